// Keeps caller identity and the server credential on their own side of the proxy:
// inbound session headers never reach the backend, and the bearer token is only
// ever attached to outbound statistics calls.

use crate::errors::{EdgeProxyError, JSON_CONTENT_TYPE};
use http::header::{
    AUTHORIZATION, CONTENT_TYPE, COOKIE, HeaderMap, HeaderName, HeaderValue, PROXY_AUTHORIZATION,
};
use serde::Deserialize;
use std::fmt;

static SESSION_HEADERS: &[HeaderName] = &[COOKIE, AUTHORIZATION, PROXY_AUTHORIZATION];

/// Server-held bearer token for the statistics API.
///
/// `Debug` output is redacted so the token cannot end up in logs.
#[derive(Clone, PartialEq, Eq, Deserialize)]
#[serde(transparent)]
pub struct Credential(String);

impl Credential {
    pub fn new(token: impl Into<String>) -> Self {
        Credential(token.into())
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn is_valid_header(&self) -> bool {
        self.bearer_header().is_ok()
    }

    fn bearer_header(&self) -> Result<HeaderValue, http::header::InvalidHeaderValue> {
        let mut value = HeaderValue::from_str(&format!("Bearer {}", self.0))?;
        value.set_sensitive(true);
        Ok(value)
    }
}

impl fmt::Debug for Credential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Credential(<redacted>)")
    }
}

/// Removes cookies and any caller-supplied authentication before a request is forwarded.
pub fn strip_session_headers(headers: &mut HeaderMap) -> &mut HeaderMap {
    for name in SESSION_HEADERS {
        headers.remove(name);
    }
    headers
}

/// Prepares headers for a call that acts with the server's own identity.
pub fn inject_credential(
    headers: &mut HeaderMap,
    credential: &Credential,
) -> Result<(), EdgeProxyError> {
    strip_session_headers(headers);

    let authorization = credential.bearer_header().map_err(|_| {
        EdgeProxyError::InternalError("upstream token is not a valid header value".into())
    })?;
    headers.insert(AUTHORIZATION, authorization);
    headers.insert(CONTENT_TYPE, HeaderValue::from_static(JSON_CONTENT_TYPE));
    Ok(())
}
