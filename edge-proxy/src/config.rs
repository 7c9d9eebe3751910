use crate::credentials::Credential;
use crate::errors::EdgeProxyError;
use chrono::{FixedOffset, Offset, Utc};
use serde::{Deserialize, Deserializer};
use std::collections::HashSet;
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;
use url::Url;

/// Path of the tracker script, fixed by the analytics backend.
pub const SCRIPT_PATH: &str = "/script.js";

pub const URL_ENV: &str = "API_BASE_URL";
pub const TOKEN_ENV: &str = "TOKEN";
pub const WEBSITE_ID_ENV: &str = "WEBSITE_ID";

#[derive(Error, Debug)]
pub enum ValidationError {
    #[error("Port cannot be 0")]
    InvalidPort,

    #[error("TTL cannot be 0: {0}")]
    ZeroTtl(&'static str),

    #[error("Cache write queue size cannot be 0")]
    ZeroWriteQueue,

    #[error("Cache sweep interval cannot be 0")]
    ZeroSweepInterval,

    #[error("Route path must start with '/': {0}")]
    InvalidRoutePath(String),

    #[error("Route path is used by more than one route: {0}")]
    DuplicateRoutePath(String),

    #[error("Upstream token cannot be sent as a header value")]
    InvalidToken,

    #[error("Invalid URL in {URL_ENV}: {0}")]
    InvalidEnvUrl(#[from] url::ParseError),
}

/// Edge proxy configuration
#[derive(Clone, Debug, Deserialize, PartialEq)]
pub struct Config {
    /// Main listener for incoming requests
    pub listener: Listener,
    /// Admin listener for health and readiness probes
    pub admin_listener: Listener,
    /// The analytics backend and the credentials used against it
    #[serde(default)]
    pub upstream: UpstreamConfig,
    #[serde(default)]
    pub cors: CorsConfig,
    #[serde(default)]
    pub cache: CacheConfig,
    #[serde(default)]
    pub routes: RoutesConfig,
    #[serde(default)]
    pub aggregate: AggregateConfig,
}

impl Config {
    /// Validates the proxy configuration
    ///
    /// Missing upstream settings are not validation errors: the routes depending
    /// on them answer with a configuration error instead.
    pub fn validate(&self) -> Result<(), ValidationError> {
        self.listener.validate()?;
        self.admin_listener.validate()?;
        self.upstream.validate()?;
        self.cache.validate()?;
        self.routes.validate()?;
        Ok(())
    }
}

/// Network listener configuration
#[derive(Clone, Debug, Deserialize, PartialEq)]
pub struct Listener {
    /// Host address to bind to (e.g., "0.0.0.0" or "127.0.0.1")
    pub host: String,
    /// Port number to listen on
    pub port: u16,
}

impl Listener {
    pub fn validate(&self) -> Result<(), ValidationError> {
        if self.port == 0 {
            return Err(ValidationError::InvalidPort);
        }
        Ok(())
    }
}

#[derive(Clone, Copy)]
enum Setting {
    Url,
    Token,
    WebsiteId,
}

impl Setting {
    fn name(self) -> &'static str {
        match self {
            Setting::Url => "upstream.url (API_BASE_URL)",
            Setting::Token => "upstream.token (TOKEN)",
            Setting::WebsiteId => "upstream.website_id (WEBSITE_ID)",
        }
    }
}

/// The analytics backend.
///
/// Every field may be absent at startup. Requests to routes that need a missing
/// value fail with [`EdgeProxyError::MissingConfiguration`] before any upstream
/// call is made.
#[derive(Clone, Debug, Deserialize, PartialEq)]
pub struct UpstreamConfig {
    /// Base URL of the backend, e.g. `https://analytics.example.com`
    pub url: Option<Url>,
    /// Bearer token for the statistics API
    pub token: Option<Credential>,
    /// Website queried by the aggregation route
    pub website_id: Option<String>,
    /// Upper bound for a single upstream exchange, body included
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
}

impl Default for UpstreamConfig {
    fn default() -> Self {
        Self {
            url: None,
            token: None,
            website_id: None,
            timeout_secs: default_timeout_secs(),
        }
    }
}

fn default_timeout_secs() -> u64 {
    10
}

/// Upstream settings needed by the single-window statistics route.
#[derive(Debug)]
pub struct StatsAccess<'a> {
    pub url: &'a Url,
    pub token: &'a Credential,
}

/// Upstream settings needed by the aggregation route.
#[derive(Debug)]
pub struct AggregateAccess<'a> {
    pub url: &'a Url,
    pub token: &'a Credential,
    pub website_id: &'a str,
}

impl UpstreamConfig {
    /// Overlays secrets provided by the host environment.
    pub fn apply_env<F>(&mut self, lookup: F) -> Result<(), ValidationError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let lookup = |name: &str| lookup(name).filter(|value| !value.is_empty());

        if let Some(url) = lookup(URL_ENV) {
            self.url = Some(Url::parse(&url)?);
        }
        if let Some(token) = lookup(TOKEN_ENV) {
            self.token = Some(Credential::new(token));
        }
        if let Some(website_id) = lookup(WEBSITE_ID_ENV) {
            self.website_id = Some(website_id);
        }
        Ok(())
    }

    pub fn validate(&self) -> Result<(), ValidationError> {
        match &self.token {
            Some(token) if !token.is_valid_header() => Err(ValidationError::InvalidToken),
            _ => Ok(()),
        }
    }

    /// Names of the required settings that are not configured, in declaration order.
    pub fn missing_settings(&self) -> Vec<&'static str> {
        self.missing(&[Setting::Url, Setting::Token, Setting::WebsiteId])
            .unwrap_or_default()
    }

    pub fn base_url(&self) -> Result<&Url, EdgeProxyError> {
        self.url
            .as_ref()
            .ok_or_else(|| EdgeProxyError::MissingConfiguration(vec![Setting::Url.name()]))
    }

    pub fn stats_access(&self) -> Result<StatsAccess<'_>, EdgeProxyError> {
        match (&self.url, self.token()) {
            (Some(url), Some(token)) => Ok(StatsAccess { url, token }),
            _ => Err(self.missing_error(&[Setting::Url, Setting::Token])),
        }
    }

    pub fn aggregate_access(&self) -> Result<AggregateAccess<'_>, EdgeProxyError> {
        match (&self.url, self.token(), self.website_id()) {
            (Some(url), Some(token), Some(website_id)) => Ok(AggregateAccess {
                url,
                token,
                website_id,
            }),
            _ => Err(self.missing_error(&[Setting::Url, Setting::Token, Setting::WebsiteId])),
        }
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    fn token(&self) -> Option<&Credential> {
        self.token.as_ref().filter(|token| !token.is_empty())
    }

    fn website_id(&self) -> Option<&str> {
        self.website_id.as_deref().filter(|id| !id.is_empty())
    }

    fn is_set(&self, setting: Setting) -> bool {
        match setting {
            Setting::Url => self.url.is_some(),
            Setting::Token => self.token().is_some(),
            Setting::WebsiteId => self.website_id().is_some(),
        }
    }

    fn missing(&self, required: &[Setting]) -> Option<Vec<&'static str>> {
        let missing: Vec<_> = required
            .iter()
            .filter(|setting| !self.is_set(**setting))
            .map(|setting| setting.name())
            .collect();
        (!missing.is_empty()).then_some(missing)
    }

    fn missing_error(&self, required: &[Setting]) -> EdgeProxyError {
        EdgeProxyError::MissingConfiguration(self.missing(required).unwrap_or_default())
    }
}

/// Cross-origin policy
#[derive(Clone, Debug, Default, Deserialize, PartialEq)]
pub struct CorsConfig {
    /// Origins allowed to read responses, matched exactly (scheme, host and port)
    #[serde(default)]
    pub allowed_origins: Vec<String>,
    /// Optional `access-control-max-age` for preflight responses
    pub max_age_secs: Option<u64>,
}

#[derive(Clone, Debug, Deserialize, PartialEq)]
pub struct CacheConfig {
    #[serde(default = "default_script_ttl_secs")]
    pub script_ttl_secs: u64,
    #[serde(default = "default_stats_ttl_secs")]
    pub stats_ttl_secs: u64,
    /// Pending background writes; further writes are dropped while the queue is full
    #[serde(default = "default_write_queue_size")]
    pub write_queue_size: usize,
    /// How often the store is swept for expired entries
    #[serde(default = "default_sweep_interval_secs")]
    pub sweep_interval_secs: u64,
    #[serde(default)]
    pub store: CacheStoreConfig,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            script_ttl_secs: default_script_ttl_secs(),
            stats_ttl_secs: default_stats_ttl_secs(),
            write_queue_size: default_write_queue_size(),
            sweep_interval_secs: default_sweep_interval_secs(),
            store: CacheStoreConfig::default(),
        }
    }
}

impl CacheConfig {
    pub fn validate(&self) -> Result<(), ValidationError> {
        if self.script_ttl_secs == 0 {
            return Err(ValidationError::ZeroTtl("cache.script_ttl_secs"));
        }
        if self.stats_ttl_secs == 0 {
            return Err(ValidationError::ZeroTtl("cache.stats_ttl_secs"));
        }
        if self.write_queue_size == 0 {
            return Err(ValidationError::ZeroWriteQueue);
        }
        if self.sweep_interval_secs == 0 {
            return Err(ValidationError::ZeroSweepInterval);
        }
        Ok(())
    }

    pub fn script_ttl(&self) -> Duration {
        Duration::from_secs(self.script_ttl_secs)
    }

    pub fn stats_ttl(&self) -> Duration {
        Duration::from_secs(self.stats_ttl_secs)
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_secs)
    }

    /// The longest TTL of any route, used as the eviction horizon of the store.
    pub fn max_ttl(&self) -> Duration {
        self.script_ttl().max(self.stats_ttl())
    }
}

fn default_script_ttl_secs() -> u64 {
    86_400
}

fn default_stats_ttl_secs() -> u64 {
    300
}

fn default_write_queue_size() -> usize {
    1024
}

fn default_sweep_interval_secs() -> u64 {
    600
}

#[derive(Clone, Debug, Deserialize, PartialEq)]
#[serde(rename_all = "lowercase")]
#[serde(tag = "type")]
pub enum CacheStoreConfig {
    Memory {
        #[serde(default = "default_max_entries")]
        max_entries: u64,
    },
    Filesystem {
        base_dir: PathBuf,
    },
    None,
}

impl Default for CacheStoreConfig {
    fn default() -> Self {
        CacheStoreConfig::Memory {
            max_entries: default_max_entries(),
        }
    }
}

fn default_max_entries() -> u64 {
    10_000
}

#[derive(Clone, Debug, Deserialize, PartialEq)]
pub struct RoutesConfig {
    /// Event ingestion path. Some deployments expose it under a different name.
    #[serde(default = "default_send_path")]
    pub send_path: String,
    /// Four-window aggregation path
    #[serde(default = "default_aggregate_path")]
    pub aggregate_path: String,
}

impl Default for RoutesConfig {
    fn default() -> Self {
        Self {
            send_path: default_send_path(),
            aggregate_path: default_aggregate_path(),
        }
    }
}

impl RoutesConfig {
    pub fn validate(&self) -> Result<(), ValidationError> {
        let mut paths = HashSet::from([SCRIPT_PATH]);
        for path in [self.send_path.as_str(), self.aggregate_path.as_str()] {
            if !path.starts_with('/') {
                return Err(ValidationError::InvalidRoutePath(path.to_string()));
            }
            if !paths.insert(path) {
                return Err(ValidationError::DuplicateRoutePath(path.to_string()));
            }
        }
        Ok(())
    }
}

fn default_send_path() -> String {
    "/api/send".into()
}

fn default_aggregate_path() -> String {
    "/api/stats/aggregate".into()
}

#[derive(Clone, Debug, Deserialize, PartialEq)]
pub struct AggregateConfig {
    /// Include the raw per-window results in the aggregate payload
    #[serde(default = "default_include_diagnostics")]
    pub include_diagnostics: bool,
    /// Offset used to find local midnight, e.g. "+08:00"
    #[serde(
        default = "default_utc_offset",
        deserialize_with = "deserialize_utc_offset"
    )]
    pub utc_offset: FixedOffset,
}

impl Default for AggregateConfig {
    fn default() -> Self {
        Self {
            include_diagnostics: default_include_diagnostics(),
            utc_offset: default_utc_offset(),
        }
    }
}

fn default_include_diagnostics() -> bool {
    true
}

fn default_utc_offset() -> FixedOffset {
    Utc.fix()
}

fn deserialize_utc_offset<'de, D>(deserializer: D) -> Result<FixedOffset, D::Error>
where
    D: Deserializer<'de>,
{
    let raw = String::deserialize(deserializer)?;
    raw.parse().map_err(serde::de::Error::custom)
}
