use crate::config::CorsConfig;
use http::header::{
    ACCESS_CONTROL_ALLOW_HEADERS, ACCESS_CONTROL_ALLOW_METHODS, ACCESS_CONTROL_ALLOW_ORIGIN,
    ACCESS_CONTROL_MAX_AGE, HeaderMap, HeaderValue, VARY,
};
use std::collections::HashSet;

const ALLOWED_METHODS: &str = "GET,HEAD,POST,OPTIONS";
const ALLOWED_HEADERS: &str = "content-type,authorization";

/// Static allow-list of origins that may read proxy responses from a browser.
///
/// Matching is exact and case-sensitive. A matching origin is echoed back, never
/// `*`; any other origin gets no cross-origin headers at all.
#[derive(Clone, Debug)]
pub struct CorsPolicy {
    allowed_origins: HashSet<String>,
    max_age: Option<HeaderValue>,
}

impl CorsPolicy {
    pub fn new(config: &CorsConfig) -> Self {
        Self {
            allowed_origins: config.allowed_origins.iter().cloned().collect(),
            max_age: config.max_age_secs.map(HeaderValue::from),
        }
    }

    /// Cross-origin headers for a request declaring `origin`.
    pub fn headers_for(&self, origin: Option<&HeaderValue>) -> HeaderMap {
        let mut headers = HeaderMap::new();

        let Some(origin) = origin.filter(|origin| self.is_allowed(origin)) else {
            return headers;
        };

        headers.insert(ACCESS_CONTROL_ALLOW_ORIGIN, origin.clone());
        headers.insert(
            ACCESS_CONTROL_ALLOW_METHODS,
            HeaderValue::from_static(ALLOWED_METHODS),
        );
        headers.insert(
            ACCESS_CONTROL_ALLOW_HEADERS,
            HeaderValue::from_static(ALLOWED_HEADERS),
        );
        headers.insert(VARY, HeaderValue::from_static("Origin"));
        if let Some(max_age) = &self.max_age {
            headers.insert(ACCESS_CONTROL_MAX_AGE, max_age.clone());
        }
        headers
    }

    fn is_allowed(&self, origin: &HeaderValue) -> bool {
        origin
            .to_str()
            .is_ok_and(|origin| !origin.is_empty() && self.allowed_origins.contains(origin))
    }
}
