use http::header::{ACCEPT, HeaderName};
use hyper::{Method, Request};
use std::fmt;
use url::form_urlencoded;

/// Headers that change the representation returned by the backend. Everything
/// else (origin, cookies, user agent...) must not split the cache.
static KEYED_HEADERS: &[HeaderName] = &[ACCEPT];

/// Normalized identity of a request, used as the cache key.
///
/// Two requests with the same method, path, query parameters (in any order) and
/// keyed headers produce the same signature.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct RequestSignature {
    method: Method,
    path: String,
    query: String,
    headers: Vec<(HeaderName, String)>,
}

impl RequestSignature {
    pub fn from_request<B>(request: &Request<B>) -> Self {
        let uri = request.uri();

        let headers = KEYED_HEADERS
            .iter()
            .filter_map(|name| {
                let value = request.headers().get(name)?.to_str().ok()?;
                Some((name.clone(), value.trim().to_ascii_lowercase()))
            })
            .collect();

        Self {
            method: request.method().clone(),
            path: normalize_path(uri.path()),
            query: normalize_query(uri.query().unwrap_or("")),
            headers,
        }
    }

    /// String form used by key-value backends.
    pub fn cache_key(&self) -> String {
        self.to_string()
    }
}

impl fmt::Display for RequestSignature {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.method, self.path)?;
        if !self.query.is_empty() {
            write!(f, "?{}", self.query)?;
        }
        for (name, value) in &self.headers {
            write!(f, " {name}={value}")?;
        }
        Ok(())
    }
}

/// Collapses repeated slashes and drops a trailing slash.
fn normalize_path(path: &str) -> String {
    let segments: Vec<&str> = path.split('/').filter(|s| !s.is_empty()).collect();
    format!("/{}", segments.join("/"))
}

/// Decodes the query into pairs, sorts them, and re-encodes them canonically.
fn normalize_query(query: &str) -> String {
    let mut pairs: Vec<(String, String)> = form_urlencoded::parse(query.as_bytes())
        .into_owned()
        .collect();
    pairs.sort();

    form_urlencoded::Serializer::new(String::new())
        .extend_pairs(pairs)
        .finish()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request(method: Method, uri: &str, headers: &[(&str, &str)]) -> Request<()> {
        let mut builder = Request::builder().method(method).uri(uri);
        for (name, value) in headers {
            builder = builder.header(*name, *value);
        }
        builder.body(()).unwrap()
    }

    fn key(method: Method, uri: &str, headers: &[(&str, &str)]) -> String {
        RequestSignature::from_request(&request(method, uri, headers)).cache_key()
    }

    #[test]
    fn test_identical_requests_collide() {
        let uri = "/api/websites/abc/stats?startAt=1&endAt=2";
        assert_eq!(key(Method::GET, uri, &[]), key(Method::GET, uri, &[]));
    }

    #[test]
    fn test_query_order_is_irrelevant() {
        assert_eq!(
            key(Method::GET, "/api/websites/abc/stats?startAt=1&endAt=2", &[]),
            key(Method::GET, "/api/websites/abc/stats?endAt=2&startAt=1", &[]),
        );
        // Percent-encoding differences do not matter once decoded
        assert_eq!(
            key(Method::GET, "/api/stats/aggregate?tz=%41sia", &[]),
            key(Method::GET, "/api/stats/aggregate?tz=Asia", &[]),
        );
    }

    #[test]
    fn test_irrelevant_headers_are_ignored() {
        let uri = "/script.js";
        assert_eq!(
            key(Method::GET, uri, &[]),
            key(
                Method::GET,
                uri,
                &[
                    ("origin", "https://example.com"),
                    ("cookie", "session=1"),
                    ("user-agent", "curl/8.0"),
                ]
            ),
        );
    }

    #[test]
    fn test_keyed_header_is_normalized() {
        let uri = "/api/stats/aggregate";
        let plain = key(Method::GET, uri, &[("accept", "application/json")]);
        assert_eq!(plain, key(Method::GET, uri, &[("accept", " Application/JSON ")]));
        assert_ne!(plain, key(Method::GET, uri, &[("accept", "text/html")]));
        assert_ne!(plain, key(Method::GET, uri, &[]));
    }

    #[test]
    fn test_differences_produce_distinct_keys() {
        let base = key(Method::GET, "/api/websites/abc/stats?startAt=1", &[]);
        assert_ne!(base, key(Method::GET, "/api/websites/abc/stats?startAt=2", &[]));
        assert_ne!(base, key(Method::GET, "/api/websites/abc/stats", &[]));
        assert_ne!(base, key(Method::HEAD, "/api/websites/abc/stats?startAt=1", &[]));
        assert_ne!(base, key(Method::GET, "/api/websites/abd/stats?startAt=1", &[]));
    }

    #[test]
    fn test_path_normalization() {
        assert_eq!(normalize_path("/script.js"), "/script.js");
        assert_eq!(normalize_path("//api///send/"), "/api/send");
        assert_eq!(normalize_path("/"), "/");
        assert_eq!(normalize_path(""), "/");
    }

    #[test]
    fn test_display() {
        let signature = RequestSignature::from_request(&request(
            Method::GET,
            "/api/websites/abc/stats?endAt=2&startAt=1",
            &[("accept", "application/json")],
        ));
        assert_eq!(
            signature.to_string(),
            "GET /api/websites/abc/stats?endAt=2&startAt=1 accept=application/json"
        );
    }
}
