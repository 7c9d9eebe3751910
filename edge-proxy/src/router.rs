use crate::aggregator::{AggregatePayload, StatsAggregator};
use crate::cache::{Cache, CacheEntry, CacheStore};
use crate::config::{Config, SCRIPT_PATH};
use crate::cors::CorsPolicy;
use crate::credentials::{Credential, inject_credential, strip_session_headers};
use crate::errors::{EdgeProxyError, JSON_CONTENT_TYPE, Result};
use crate::metrics_defs::{CACHE_HIT, CACHE_MISS, REQUEST_DURATION};
use crate::signature::RequestSignature;
use crate::upstream::UpstreamClient;
use crate::windows::{WindowCalculator, WindowOverrides};
use bytes::Bytes;
use chrono::Utc;
use http::header::{AGE, CACHE_CONTROL, CONTENT_TYPE, HeaderMap, HeaderValue, ORIGIN};
use hyper::{Method, Request, Response, StatusCode};
use regex::Regex;
use shared::{counter, histogram};
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime};
use url::Url;

pub const SCRIPT_CONTENT_TYPE: &str = "application/javascript; charset=utf-8";
pub const X_CACHE: &str = "x-cache";

const STATS_PATH_PATTERN: &str = r"(?i)^/api/websites/[0-9a-f-]+/stats$";

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Route {
    Script,
    Send,
    WebsiteStats,
    Aggregate,
}

impl Route {
    fn as_str(self) -> &'static str {
        match self {
            Route::Script => "script",
            Route::Send => "send",
            Route::WebsiteStats => "website_stats",
            Route::Aggregate => "aggregate",
        }
    }
}

#[derive(Clone, Copy, Debug)]
enum CacheStatus {
    Hit,
    Miss,
}

impl CacheStatus {
    fn header_value(self) -> HeaderValue {
        match self {
            CacheStatus::Hit => HeaderValue::from_static("HIT"),
            CacheStatus::Miss => HeaderValue::from_static("MISS"),
        }
    }
}

/// Dispatches requests to the route handlers and applies the cross-origin policy
/// to every response, errors included.
#[derive(Clone)]
pub struct Router {
    inner: Arc<RouterInner>,
}

struct RouterInner {
    config: Arc<Config>,
    cors: CorsPolicy,
    cache: Cache,
    client: UpstreamClient,
    windows: WindowCalculator,
    stats_path: Regex,
}

impl Router {
    /// Must be called from within a Tokio runtime: the cache writer is spawned here.
    pub fn new(config: Arc<Config>, store: Arc<dyn CacheStore>) -> Result<Self> {
        let stats_path = Regex::new(STATS_PATH_PATTERN)
            .map_err(|e| EdgeProxyError::InternalError(format!("Invalid route pattern: {e}")))?;
        let client = UpstreamClient::new(config.upstream.timeout())?;

        let inner = RouterInner {
            cors: CorsPolicy::new(&config.cors),
            cache: Cache::new(
                store,
                config.cache.write_queue_size,
                config.cache.sweep_interval(),
            ),
            windows: WindowCalculator::new(config.aggregate.utc_offset),
            client,
            stats_path,
            config,
        };

        Ok(Self {
            inner: Arc::new(inner),
        })
    }

    /// Routes an incoming request. Never fails: errors are rendered as JSON responses.
    pub async fn route(&self, request: Request<Bytes>) -> Response<Bytes> {
        let start = Instant::now();
        let origin = request.headers().get(ORIGIN).cloned();

        let (route_name, mut response) = if request.method() == Method::OPTIONS {
            ("preflight", preflight_response())
        } else {
            match self.find_route(request.uri().path()) {
                Some(route) => {
                    tracing::debug!(route = route.as_str(), "Matched route");
                    let response = match self.handle(route, request).await {
                        Ok(response) => response,
                        Err(e) => {
                            tracing::warn!(route = route.as_str(), error = %e, "Request failed");
                            e.into_response()
                        }
                    };
                    (route.as_str(), response)
                }
                None => {
                    tracing::debug!(
                        method = %request.method(),
                        path = %request.uri().path(),
                        "No route matched"
                    );
                    ("none", EdgeProxyError::NoRouteMatched.into_response())
                }
            }
        };

        self.apply_cors(origin.as_ref(), response.headers_mut());
        histogram!(
            REQUEST_DURATION,
            "route" => route_name,
            "status" => response.status().as_u16().to_string()
        )
        .record(start.elapsed().as_secs_f64());
        response
    }

    /// Renders an error raised before routing, e.g. an unreadable request body.
    pub fn reject(&self, headers: &HeaderMap, error: EdgeProxyError) -> Response<Bytes> {
        let mut response = error.into_response();
        self.apply_cors(headers.get(ORIGIN), response.headers_mut());
        response
    }

    /// Waits for queued cache writes to complete.
    pub async fn flush_cache(&self) {
        self.inner.cache.flush().await;
    }

    fn apply_cors(&self, origin: Option<&HeaderValue>, headers: &mut HeaderMap) {
        for (name, value) in self.inner.cors.headers_for(origin).iter() {
            headers.insert(name, value.clone());
        }
    }

    fn find_route(&self, path: &str) -> Option<Route> {
        let routes = &self.inner.config.routes;

        if path == SCRIPT_PATH {
            Some(Route::Script)
        } else if path == routes.send_path {
            Some(Route::Send)
        } else if path == routes.aggregate_path {
            Some(Route::Aggregate)
        } else if self.inner.stats_path.is_match(path) {
            Some(Route::WebsiteStats)
        } else {
            None
        }
    }

    async fn handle(&self, route: Route, request: Request<Bytes>) -> Result<Response<Bytes>> {
        match route {
            Route::Script => {
                require_method(&request, &[Method::GET, Method::HEAD], "GET, HEAD")?;
                self.handle_script(request).await
            }
            Route::Send => {
                require_method(&request, &[Method::POST], "POST")?;
                self.handle_send(request).await
            }
            Route::WebsiteStats => {
                require_method(&request, &[Method::GET], "GET")?;
                self.handle_stats(request).await
            }
            Route::Aggregate => {
                require_method(&request, &[Method::GET], "GET")?;
                self.handle_aggregate(request).await
            }
        }
    }

    async fn handle_script(&self, request: Request<Bytes>) -> Result<Response<Bytes>> {
        let config = &self.inner.config;
        let base = config.upstream.base_url()?;

        self.forward_cached(
            Route::Script,
            base,
            request,
            None,
            SCRIPT_CONTENT_TYPE,
            config.cache.script_ttl(),
        )
        .await
    }

    /// Event ingestion is forwarded as is, without caching or credentials.
    async fn handle_send(&self, mut request: Request<Bytes>) -> Result<Response<Bytes>> {
        let base = self.inner.config.upstream.base_url()?;
        strip_session_headers(request.headers_mut());

        let upstream = self.inner.client.send(base, request).await?;
        build_response(upstream.status, JSON_CONTENT_TYPE, upstream.body, None)
    }

    async fn handle_stats(&self, request: Request<Bytes>) -> Result<Response<Bytes>> {
        let config = &self.inner.config;
        let access = config.upstream.stats_access()?;

        self.forward_cached(
            Route::WebsiteStats,
            access.url,
            request,
            Some(access.token),
            JSON_CONTENT_TYPE,
            config.cache.stats_ttl(),
        )
        .await
    }

    async fn handle_aggregate(&self, request: Request<Bytes>) -> Result<Response<Bytes>> {
        let config = &self.inner.config;
        let access = config.upstream.aggregate_access()?;
        let ttl = config.cache.stats_ttl();

        let signature = RequestSignature::from_request(&request);
        if let Some(entry) = self.read_cache(Route::Aggregate, &signature).await {
            return entry_response(&entry, CacheStatus::Hit, true);
        }

        let overrides = WindowOverrides::from_query(request.uri().query());
        let windows = self.inner.windows.compute_with(Utc::now(), &overrides);

        let aggregator = StatsAggregator::new(
            self.inner.client.clone(),
            access.url.clone(),
            access.website_id,
            access.token.clone(),
        );
        let results = aggregator.aggregate(&windows).await;
        if results.all_failed() {
            tracing::warn!("Every statistics window failed");
        }

        // A partial aggregate is served but never stored
        let complete = results.all_succeeded();
        let payload = AggregatePayload::assemble(results, config.aggregate.include_diagnostics);
        let body = Bytes::from(serde_json::to_vec(&payload)?);

        let entry = CacheEntry::new(StatusCode::OK, JSON_CONTENT_TYPE, body, ttl);
        if complete {
            self.inner.cache.write(&signature, entry.clone());
        }
        entry_response(&entry, CacheStatus::Miss, complete)
    }

    /// Serves from the cache, or forwards to the backend and stores 2xx answers.
    async fn forward_cached(
        &self,
        route: Route,
        base: &Url,
        mut request: Request<Bytes>,
        credential: Option<&Credential>,
        content_type: &str,
        ttl: Duration,
    ) -> Result<Response<Bytes>> {
        let signature = RequestSignature::from_request(&request);
        if let Some(entry) = self.read_cache(route, &signature).await {
            return entry_response(&entry, CacheStatus::Hit, true);
        }

        match credential {
            Some(credential) => inject_credential(request.headers_mut(), credential)?,
            None => {
                strip_session_headers(request.headers_mut());
            }
        }

        let upstream = self.inner.client.send(base, request).await?;
        let cacheable = upstream.is_success();
        let entry = CacheEntry::new(upstream.status, content_type, upstream.body, ttl);
        if cacheable {
            self.inner.cache.write(&signature, entry.clone());
        }
        entry_response(&entry, CacheStatus::Miss, cacheable)
    }

    async fn read_cache(&self, route: Route, signature: &RequestSignature) -> Option<CacheEntry> {
        let entry = self.inner.cache.read(signature).await;
        match entry {
            Some(_) => counter!(CACHE_HIT, "route" => route.as_str()).increment(1),
            None => counter!(CACHE_MISS, "route" => route.as_str()).increment(1),
        }
        entry
    }
}

fn require_method<B>(
    request: &Request<B>,
    methods: &[Method],
    allowed: &'static str,
) -> Result<()> {
    if methods.contains(request.method()) {
        Ok(())
    } else {
        Err(EdgeProxyError::MethodNotAllowed {
            method: request.method().clone(),
            allowed,
        })
    }
}

fn preflight_response() -> Response<Bytes> {
    let mut response = Response::new(Bytes::new());
    *response.status_mut() = StatusCode::NO_CONTENT;
    response
}

/// A HIT advertises only the TTL the entry has left, plus its `Age`.
fn entry_response(
    entry: &CacheEntry,
    cache_status: CacheStatus,
    cacheable: bool,
) -> Result<Response<Bytes>> {
    let age = match cache_status {
        CacheStatus::Hit => Some(entry.age_at(SystemTime::now())),
        CacheStatus::Miss => None,
    };
    let max_age = entry.ttl.saturating_sub(age.unwrap_or_default());

    let mut response = build_response(
        entry.status(),
        &entry.content_type,
        entry.body.clone(),
        Some(cacheable.then_some(max_age)),
    )?;
    let headers = response.headers_mut();
    headers.insert(X_CACHE, cache_status.header_value());
    if let Some(age) = age {
        headers.insert(AGE, HeaderValue::from(age.as_secs()));
    }
    Ok(response)
}

/// Builds a caller-facing response from status, content type and body only, so
/// nothing else the backend sent can leak through.
///
/// `cache` is `None` for routes that never cache, `Some(None)` for an answer that
/// was not stored, and `Some(Some(ttl))` for a cacheable answer.
fn build_response(
    status: StatusCode,
    content_type: &str,
    body: Bytes,
    cache: Option<Option<Duration>>,
) -> Result<Response<Bytes>> {
    let mut builder = Response::builder()
        .status(status)
        .header(CONTENT_TYPE, content_type);

    match cache {
        Some(Some(ttl)) => {
            builder = builder.header(CACHE_CONTROL, format!("public, max-age={}", ttl.as_secs()));
        }
        Some(None) => builder = builder.header(CACHE_CONTROL, "no-store"),
        None => {}
    }

    builder
        .body(body)
        .map_err(|e| EdgeProxyError::InternalError(format!("Failed to build response: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::MemoryStore;
    use crate::config::tests::test_config;
    use crate::testutils::{MockUpstream, RecordedRequest, Reply};
    use chrono::DateTime;
    use http::header::{
        ACCESS_CONTROL_ALLOW_ORIGIN, ALLOW, AUTHORIZATION, COOKIE, SET_COOKIE, VARY,
    };
    use serde_json::{Value, json};

    const ORIGIN_OK: &str = "https://example.com";
    const WEBSITE_ID: &str = "0b7c5a5e-1f3d-4c7a-9e0b-2a6f4d8c1e22";
    // 2024-03-15T10:00:00Z
    const NOW_MS: i64 = 1_710_496_800_000;

    struct TestProxy {
        router: Router,
        upstream: MockUpstream,
        store: Arc<MemoryStore>,
    }

    async fn proxy_with<F>(configure: impl FnOnce(&mut Config), handler: F) -> TestProxy
    where
        F: Fn(&RecordedRequest) -> Reply + Send + Sync + 'static,
    {
        let upstream = MockUpstream::start(handler).await;
        let mut config = test_config();
        config.upstream.url = Some(upstream.url.clone());
        configure(&mut config);

        let store = Arc::new(MemoryStore::new(100, Duration::from_secs(86_400)));
        let router = Router::new(Arc::new(config), store.clone()).unwrap();
        TestProxy {
            router,
            upstream,
            store,
        }
    }

    async fn proxy<F>(handler: F) -> TestProxy
    where
        F: Fn(&RecordedRequest) -> Reply + Send + Sync + 'static,
    {
        proxy_with(|_| {}, handler).await
    }

    fn request(method: Method, uri: &str, origin: Option<&str>) -> Request<Bytes> {
        let mut builder = Request::builder().method(method).uri(uri);
        if let Some(origin) = origin {
            builder = builder.header(ORIGIN, origin);
        }
        builder.body(Bytes::new()).unwrap()
    }

    fn body_json(response: &Response<Bytes>) -> Value {
        serde_json::from_slice(response.body()).unwrap()
    }

    fn stats_uri() -> String {
        format!("/api/websites/{WEBSITE_ID}/stats?startAt=1&endAt=2")
    }

    fn aggregate_uri() -> String {
        format!("/api/stats/aggregate?now={NOW_MS}")
    }

    fn stats_reply(visitors: u64, pageviews: u64) -> Reply {
        let body = json!({
            "pageviews": {"value": pageviews, "prev": 0},
            "visitors": {"value": visitors, "prev": 0},
        });
        Reply::json(StatusCode::OK, &body.to_string())
    }

    #[tokio::test]
    async fn test_preflight() {
        let proxy = proxy(|_| Reply::script("")).await;

        for path in ["/script.js", "/api/stats/aggregate", "/anything"] {
            let response = proxy
                .router
                .route(request(Method::OPTIONS, path, Some(ORIGIN_OK)))
                .await;
            assert_eq!(response.status(), StatusCode::NO_CONTENT);
            assert!(response.body().is_empty());
            assert_eq!(response.headers()[ACCESS_CONTROL_ALLOW_ORIGIN], ORIGIN_OK);
            assert!(!response.headers().contains_key(CONTENT_TYPE));
        }

        let response = proxy
            .router
            .route(request(Method::OPTIONS, "/script.js", Some("https://evil.com")))
            .await;
        assert_eq!(response.status(), StatusCode::NO_CONTENT);
        assert!(response.headers().is_empty());

        assert_eq!(proxy.upstream.request_count(), 0);
    }

    #[tokio::test]
    async fn test_unknown_route() {
        let proxy = proxy(|_| Reply::script("")).await;

        for path in ["/", "/api/websites/not-hex!/stats", "/api/websites/abc/stats/extra"] {
            let response = proxy
                .router
                .route(request(Method::GET, path, Some(ORIGIN_OK)))
                .await;
            assert_eq!(response.status(), StatusCode::NOT_FOUND, "{path}");
            assert_eq!(response.headers()[CONTENT_TYPE], JSON_CONTENT_TYPE);
            assert!(body_json(&response)["error"].is_string());
            // Errors carry the cross-origin headers too
            assert_eq!(response.headers()[ACCESS_CONTROL_ALLOW_ORIGIN], ORIGIN_OK);
        }
        assert_eq!(proxy.upstream.request_count(), 0);
    }

    #[tokio::test]
    async fn test_method_not_allowed() {
        let proxy = proxy(|_| Reply::script("")).await;

        let response = proxy
            .router
            .route(request(Method::DELETE, "/script.js", None))
            .await;
        assert_eq!(response.status(), StatusCode::METHOD_NOT_ALLOWED);
        assert_eq!(response.headers()[ALLOW], "GET, HEAD");

        let response = proxy
            .router
            .route(request(Method::GET, "/api/send", None))
            .await;
        assert_eq!(response.status(), StatusCode::METHOD_NOT_ALLOWED);
        assert_eq!(response.headers()[ALLOW], "POST");

        let response = proxy
            .router
            .route(request(Method::POST, &aggregate_uri(), None))
            .await;
        assert_eq!(response.status(), StatusCode::METHOD_NOT_ALLOWED);

        assert_eq!(proxy.upstream.request_count(), 0);
    }

    #[tokio::test]
    async fn test_script_is_cached() {
        let proxy = proxy(|_| Reply::script("console.log(1)")).await;

        let first = proxy
            .router
            .route(request(Method::GET, "/script.js", Some(ORIGIN_OK)))
            .await;
        assert_eq!(first.status(), StatusCode::OK);
        assert_eq!(first.body(), "console.log(1)");
        assert_eq!(first.headers()[CONTENT_TYPE], SCRIPT_CONTENT_TYPE);
        assert_eq!(first.headers()[CACHE_CONTROL], "public, max-age=86400");
        assert_eq!(first.headers()[X_CACHE], "MISS");
        assert!(!first.headers().contains_key(AGE));
        assert!(!first.headers().contains_key(SET_COOKIE));

        proxy.router.flush_cache().await;

        // Origin does not split the cache, but the headers follow the caller
        let second = proxy
            .router
            .route(request(Method::GET, "/script.js", Some(ORIGIN_OK)))
            .await;
        assert_eq!(second.headers()[X_CACHE], "HIT");
        assert_eq!(second.body(), "console.log(1)");
        assert_eq!(second.headers()[ACCESS_CONTROL_ALLOW_ORIGIN], ORIGIN_OK);
        assert_eq!(second.headers()[VARY], "Origin");

        let third = proxy
            .router
            .route(request(Method::GET, "/script.js", Some("https://evil.com")))
            .await;
        assert_eq!(third.headers()[X_CACHE], "HIT");
        assert!(!third.headers().contains_key(ACCESS_CONTROL_ALLOW_ORIGIN));

        assert_eq!(proxy.upstream.request_count(), 1);
    }

    #[tokio::test]
    async fn test_hit_advertises_remaining_ttl() {
        let proxy = proxy(|_| stats_reply(1, 1)).await;

        let request_for_key = request(Method::GET, &stats_uri(), None);
        let key = RequestSignature::from_request(&request_for_key).cache_key();
        let mut entry = CacheEntry::new(
            StatusCode::OK,
            JSON_CONTENT_TYPE,
            Bytes::from_static(br#"{"visitors":{"value":9}}"#),
            Duration::from_secs(300),
        );
        entry.stored_at = SystemTime::now() - Duration::from_secs(200);
        proxy.store.put(key, entry).await.unwrap();

        let response = proxy.router.route(request_for_key).await;
        assert_eq!(response.headers()[X_CACHE], "HIT");
        assert_eq!(body_json(&response)["visitors"]["value"], 9);

        let age: u64 = response.headers()[AGE].to_str().unwrap().parse().unwrap();
        let max_age: u64 = response.headers()[CACHE_CONTROL]
            .to_str()
            .unwrap()
            .strip_prefix("public, max-age=")
            .unwrap()
            .parse()
            .unwrap();
        assert!((200..=201).contains(&age), "age {age}");
        assert!((99..=100).contains(&max_age), "max-age {max_age}");
        assert_eq!(proxy.upstream.request_count(), 0);
    }

    #[tokio::test]
    async fn test_expired_entry_goes_upstream() {
        let proxy = proxy(|_| Reply::script("fresh")).await;

        let request_for_key = request(Method::GET, "/script.js", None);
        let key = RequestSignature::from_request(&request_for_key).cache_key();
        let mut stale = CacheEntry::new(
            StatusCode::OK,
            SCRIPT_CONTENT_TYPE,
            Bytes::from_static(b"stale"),
            Duration::from_secs(60),
        );
        stale.stored_at = SystemTime::now() - Duration::from_secs(120);
        proxy.store.put(key, stale).await.unwrap();

        let response = proxy.router.route(request_for_key).await;
        assert_eq!(response.body(), "fresh");
        assert_eq!(response.headers()[X_CACHE], "MISS");
        assert_eq!(proxy.upstream.request_count(), 1);
    }

    #[tokio::test]
    async fn test_stats_injects_credential() {
        let proxy = proxy(|_| stats_reply(3, 4)).await;

        let request = Request::get(stats_uri())
            .header(ORIGIN, ORIGIN_OK)
            .header(COOKIE, "umami.session=abc")
            .header(AUTHORIZATION, "Bearer client-token")
            .body(Bytes::new())
            .unwrap();
        let response = proxy.router.route(request).await;

        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(response.headers()[CONTENT_TYPE], JSON_CONTENT_TYPE);
        assert_eq!(response.headers()[CACHE_CONTROL], "public, max-age=300");
        assert_eq!(body_json(&response)["visitors"]["value"], 3);

        let recorded = proxy.upstream.requests();
        assert_eq!(recorded.len(), 1);
        assert_eq!(recorded[0].uri, stats_uri());
        assert!(!recorded[0].headers.contains_key(COOKIE));
        assert_eq!(recorded[0].headers[AUTHORIZATION], "Bearer server-token");

        // The credential never reaches the caller
        assert!(!response.headers().contains_key(AUTHORIZATION));
        assert!(!response.headers().contains_key(SET_COOKIE));
        for (_, value) in response.headers() {
            assert!(!value.as_bytes().windows(12).any(|w| w == b"server-token"));
        }
        assert!(!response.body().windows(12).any(|w| w == b"server-token"));
    }

    #[tokio::test]
    async fn test_stats_errors_are_not_cached() {
        let proxy = proxy(|_| Reply::json(StatusCode::UNAUTHORIZED, r#"{"error":"nope"}"#)).await;

        for _ in 0..2 {
            let response = proxy
                .router
                .route(request(Method::GET, &stats_uri(), None))
                .await;
            assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
            assert_eq!(response.headers()[CACHE_CONTROL], "no-store");
            assert_eq!(response.headers()[X_CACHE], "MISS");
            proxy.router.flush_cache().await;
        }
        assert_eq!(proxy.upstream.request_count(), 2);
    }

    #[tokio::test]
    async fn test_send_is_forwarded() {
        let proxy = proxy(|_| Reply::json(StatusCode::OK, r#"{"cache":"token"}"#)).await;

        for _ in 0..2 {
            let request = Request::post("/api/send")
                .header(CONTENT_TYPE, "application/json")
                .header(COOKIE, "umami.session=abc")
                .body(Bytes::from_static(br#"{"type":"event","payload":{}}"#))
                .unwrap();
            let response = proxy.router.route(request).await;

            assert_eq!(response.status(), StatusCode::OK);
            assert_eq!(response.headers()[CONTENT_TYPE], JSON_CONTENT_TYPE);
            assert!(!response.headers().contains_key(X_CACHE));
            proxy.router.flush_cache().await;
        }

        let recorded = proxy.upstream.requests();
        assert_eq!(recorded.len(), 2);
        assert_eq!(recorded[0].method, Method::POST);
        assert_eq!(recorded[0].uri, "/api/send");
        assert_eq!(recorded[0].body, r#"{"type":"event","payload":{}}"#);
        assert!(!recorded[0].headers.contains_key(COOKIE));
        assert!(!recorded[0].headers.contains_key(AUTHORIZATION));
    }

    #[tokio::test]
    async fn test_custom_route_paths() {
        let proxy = proxy_with(
            |config| {
                config.routes.send_path = "/api/collect".to_string();
                config.routes.aggregate_path = "/api/umami".to_string();
            },
            |_| stats_reply(1, 1),
        )
        .await;

        let response = proxy
            .router
            .route(request(Method::GET, &format!("/api/umami?now={NOW_MS}"), None))
            .await;
        assert_eq!(response.status(), StatusCode::OK);

        let response = proxy
            .router
            .route(request(Method::POST, "/api/collect", None))
            .await;
        assert_eq!(response.status(), StatusCode::OK);

        let response = proxy
            .router
            .route(request(Method::POST, "/api/send", None))
            .await;
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_missing_configuration() {
        let proxy = proxy_with(
            |config| {
                config.upstream.token = None;
                config.upstream.website_id = None;
            },
            |_| stats_reply(1, 1),
        )
        .await;

        let response = proxy
            .router
            .route(request(Method::GET, &stats_uri(), Some(ORIGIN_OK)))
            .await;
        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(body_json(&response)["missing"], json!(["upstream.token (TOKEN)"]));
        assert_eq!(response.headers()[ACCESS_CONTROL_ALLOW_ORIGIN], ORIGIN_OK);

        let response = proxy
            .router
            .route(request(Method::GET, &aggregate_uri(), None))
            .await;
        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(
            body_json(&response)["missing"],
            json!(["upstream.token (TOKEN)", "upstream.website_id (WEBSITE_ID)"])
        );

        assert_eq!(proxy.upstream.request_count(), 0);
    }

    #[tokio::test]
    async fn test_missing_url() {
        let proxy = proxy_with(|config| config.upstream.url = None, |_| Reply::script("")).await;

        let response = proxy
            .router
            .route(request(Method::GET, "/script.js", None))
            .await;
        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(
            body_json(&response)["missing"],
            json!(["upstream.url (API_BASE_URL)"])
        );
        assert_eq!(proxy.upstream.request_count(), 0);
    }

    #[tokio::test]
    async fn test_upstream_unreachable() {
        let proxy = proxy(|_| Reply::Drop).await;

        let response = proxy
            .router
            .route(request(Method::GET, "/script.js", Some(ORIGIN_OK)))
            .await;
        assert_eq!(response.status(), StatusCode::BAD_GATEWAY);
        assert_eq!(response.headers()[CONTENT_TYPE], JSON_CONTENT_TYPE);
        assert_eq!(response.headers()[ACCESS_CONTROL_ALLOW_ORIGIN], ORIGIN_OK);
    }

    #[tokio::test]
    async fn test_aggregate_is_cached_when_complete() {
        let proxy = proxy(|_| stats_reply(5, 8)).await;

        let first = proxy
            .router
            .route(request(Method::GET, &aggregate_uri(), Some(ORIGIN_OK)))
            .await;
        assert_eq!(first.status(), StatusCode::OK);
        assert_eq!(first.headers()[X_CACHE], "MISS");
        assert_eq!(first.headers()[CACHE_CONTROL], "public, max-age=300");

        let body = body_json(&first);
        assert_eq!(body["today_visitors"], 5);
        assert_eq!(body["trailing_year_pageviews"], 8);
        assert_eq!(body["diagnostics"]["today"]["ok"], true);

        proxy.router.flush_cache().await;

        let second = proxy
            .router
            .route(request(Method::GET, &aggregate_uri(), Some(ORIGIN_OK)))
            .await;
        assert_eq!(second.headers()[X_CACHE], "HIT");
        assert_eq!(second.body(), first.body());
        assert_eq!(proxy.upstream.request_count(), 4);
    }

    #[tokio::test]
    async fn test_aggregate_with_one_failed_window() {
        let today_start: DateTime<Utc> = "2024-03-15T00:00:00Z".parse().unwrap();
        let yesterday_end = today_start.timestamp_millis().to_string();
        let proxy = proxy(move |request| {
            // The yesterday window is the only one ending at midnight
            if request.query_param("endAt").as_deref() == Some(yesterday_end.as_str()) {
                Reply::Drop
            } else {
                stats_reply(2, 3)
            }
        })
        .await;

        let response = proxy
            .router
            .route(request(Method::GET, &aggregate_uri(), None))
            .await;
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(response.headers()[CACHE_CONTROL], "no-store");

        let body = body_json(&response);
        assert_eq!(body["today_visitors"], 2);
        assert_eq!(body["today_pageviews"], 3);
        assert_eq!(body["yesterday_visitors"], Value::Null);
        assert_eq!(body["yesterday_pageviews"], Value::Null);
        assert_eq!(body["trailing_month_pageviews"], 3);
        assert_eq!(body["trailing_year_pageviews"], 3);
        assert_eq!(body["diagnostics"]["yesterday"]["ok"], false);

        proxy.router.flush_cache().await;
        let again = proxy
            .router
            .route(request(Method::GET, &aggregate_uri(), None))
            .await;
        assert_eq!(again.headers()[X_CACHE], "MISS");
        assert_eq!(proxy.upstream.request_count(), 8);
    }

    #[tokio::test]
    async fn test_aggregate_with_every_window_failed() {
        let proxy = proxy_with(
            |config| config.aggregate.include_diagnostics = false,
            |_| Reply::json(StatusCode::BAD_GATEWAY, "{}"),
        )
        .await;

        let response = proxy
            .router
            .route(request(Method::GET, &aggregate_uri(), None))
            .await;
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(
            body_json(&response),
            json!({
                "today_visitors": null,
                "today_pageviews": null,
                "yesterday_visitors": null,
                "yesterday_pageviews": null,
                "trailing_month_pageviews": null,
                "trailing_year_pageviews": null,
            })
        );
    }

    #[tokio::test]
    async fn test_aggregate_windows_follow_overrides() {
        let proxy = proxy(|_| stats_reply(1, 1)).await;

        proxy
            .router
            .route(request(Method::GET, &aggregate_uri(), None))
            .await;

        let mut windows: Vec<(String, String)> = proxy
            .upstream
            .requests()
            .iter()
            .map(|r| {
                (
                    r.query_param("startAt").unwrap(),
                    r.query_param("endAt").unwrap(),
                )
            })
            .collect();
        windows.sort();

        let now = NOW_MS.to_string();
        assert_eq!(
            windows,
            vec![
                ("1678874400000".to_string(), now.clone()),
                ("1707991200000".to_string(), now.clone()),
                ("1710374400000".to_string(), "1710460800000".to_string()),
                ("1710460800000".to_string(), now),
            ]
        );
    }
}
