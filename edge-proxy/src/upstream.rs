use crate::errors::EdgeProxyError;
use bytes::Bytes;
use http::header::{ACCEPT_ENCODING, CONTENT_LENGTH, HOST};
use hyper::{Request, StatusCode};
use shared::http::{add_via_header, filter_hop_by_hop};
use std::time::Duration;
use tokio::time::timeout;
use url::Url;

/// Any answer from the backend, including non-2xx statuses. Backend headers are
/// not kept: callers rebuild responses from status and body alone.
#[derive(Debug)]
pub struct UpstreamResponse {
    pub status: StatusCode,
    pub body: Bytes,
}

impl UpstreamResponse {
    pub fn is_success(&self) -> bool {
        self.status.is_success()
    }
}

/// Outbound HTTP client for the analytics backend.
///
/// Makes exactly one attempt per call. Redirects are returned to the caller
/// rather than followed.
#[derive(Clone, Debug)]
pub struct UpstreamClient {
    client: reqwest::Client,
    timeout: Duration,
}

impl UpstreamClient {
    pub fn new(timeout: Duration) -> Result<Self, EdgeProxyError> {
        let client = reqwest::Client::builder()
            .redirect(reqwest::redirect::Policy::none())
            .build()
            .map_err(|e| EdgeProxyError::InternalError(format!("Failed to build client: {e}")))?;

        Ok(Self { client, timeout })
    }

    /// Sends `request` to the backend at `base`.
    ///
    /// The request's path is appended to the path of `base`, and its query is
    /// forwarded as is.
    ///
    /// # Timeout Behavior
    ///
    /// The timeout applies to the entire exchange, including collecting the
    /// complete response body.
    pub async fn send(
        &self,
        base: &Url,
        request: Request<Bytes>,
    ) -> Result<UpstreamResponse, EdgeProxyError> {
        // Use host as identifier for error messages
        let upstream_identifier = base.host_str().unwrap_or(base.as_str()).to_string();

        let url = upstream_url(base, request.uri().path(), request.uri().query());

        let (mut parts, body) = request.into_parts();
        filter_hop_by_hop(&mut parts.headers, parts.version);
        add_via_header(&mut parts.headers, parts.version);
        // The client sets Host and Content-Length itself. Without Accept-Encoding the
        // body comes back identity-encoded, which is what gets cached.
        for name in [HOST, CONTENT_LENGTH, ACCEPT_ENCODING] {
            parts.headers.remove(name);
        }

        let mut builder = self
            .client
            .request(parts.method, url)
            .headers(parts.headers);
        if !body.is_empty() {
            builder = builder.body(body);
        }

        let exchange = async {
            let response = builder.send().await?;
            let status = response.status();
            let body = response.bytes().await?;

            Ok::<_, reqwest::Error>(UpstreamResponse { status, body })
        };

        timeout(self.timeout, exchange)
            .await
            // Outer error: the deadline elapsed before the body was complete
            .map_err(|_| EdgeProxyError::UpstreamTimeout(upstream_identifier.clone()))?
            // Inner error: connection failures, DNS, truncated bodies
            .map_err(|e| EdgeProxyError::UpstreamRequestFailed(upstream_identifier, e.to_string()))
    }
}

fn upstream_url(base: &Url, path: &str, query: Option<&str>) -> Url {
    let mut url = base.clone();
    let prefix = base.path().trim_end_matches('/');
    url.set_path(&format!("{prefix}{path}"));
    url.set_query(query);
    url
}
