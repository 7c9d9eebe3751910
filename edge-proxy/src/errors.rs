use bytes::Bytes;
use http::header::{ALLOW, CONTENT_TYPE, HeaderValue};
use hyper::{Method, Response, StatusCode};
use serde::Serialize;
use thiserror::Error;

pub const JSON_CONTENT_TYPE: &str = "application/json; charset=utf-8";

/// Result type alias for edge-proxy operations
pub type Result<T, E = EdgeProxyError> = std::result::Result<T, E>;

/// Errors that can occur while serving a request
#[derive(Error, Debug)]
pub enum EdgeProxyError {
    #[error("Missing required configuration: {}", .0.join(", "))]
    MissingConfiguration(Vec<&'static str>),

    #[error("No route matched for request")]
    NoRouteMatched,

    #[error("Method {method} not allowed, expected one of: {allowed}")]
    MethodNotAllowed {
        method: Method,
        allowed: &'static str,
    },

    #[error("Failed to read request body: {0}")]
    RequestBodyError(String),

    #[error("Upstream request failed for {0}: {1}")]
    UpstreamRequestFailed(String, String),

    #[error("Upstream timeout for {0}")]
    UpstreamTimeout(String),

    #[error("Response serialization error: {0}")]
    ResponseSerializationError(#[from] serde_json::Error),

    #[error("Internal error: {0}")]
    InternalError(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

#[derive(Serialize)]
struct ErrorBody<'a> {
    error: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    missing: Option<&'a [&'static str]>,
}

impl EdgeProxyError {
    pub fn status_code(&self) -> StatusCode {
        match self {
            EdgeProxyError::NoRouteMatched => StatusCode::NOT_FOUND,
            EdgeProxyError::MethodNotAllowed { .. } => StatusCode::METHOD_NOT_ALLOWED,
            EdgeProxyError::RequestBodyError(_) => StatusCode::BAD_REQUEST,
            EdgeProxyError::UpstreamRequestFailed(_, _) => StatusCode::BAD_GATEWAY,
            EdgeProxyError::UpstreamTimeout(_) => StatusCode::GATEWAY_TIMEOUT,
            EdgeProxyError::MissingConfiguration(_)
            | EdgeProxyError::ResponseSerializationError(_)
            | EdgeProxyError::InternalError(_)
            | EdgeProxyError::Io(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Renders the error as a JSON response for the caller.
    pub fn into_response(self) -> Response<Bytes> {
        let body = ErrorBody {
            error: self.to_string(),
            missing: match &self {
                EdgeProxyError::MissingConfiguration(missing) => Some(missing.as_slice()),
                _ => None,
            },
        };
        // Serializing a string and a list of strings cannot fail
        let bytes = serde_json::to_vec(&body).map(Bytes::from).unwrap_or_default();

        let mut response = Response::new(bytes);
        *response.status_mut() = self.status_code();
        response
            .headers_mut()
            .insert(CONTENT_TYPE, HeaderValue::from_static(JSON_CONTENT_TYPE));
        if let EdgeProxyError::MethodNotAllowed { allowed, .. } = self {
            response
                .headers_mut()
                .insert(ALLOW, HeaderValue::from_static(allowed));
        }
        response
    }
}
