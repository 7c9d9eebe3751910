use crate::credentials::{Credential, inject_credential};
use crate::metrics_defs::UPSTREAM_WINDOW_FAILURES;
use crate::upstream::UpstreamClient;
use crate::windows::{TimeWindow, Windows};
use bytes::Bytes;
use hyper::{Request, StatusCode};
use serde::Serialize;
use serde_json::Value;
use shared::counter;
use std::collections::HashMap;
use tokio::task::JoinSet;
use url::Url;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum WindowName {
    Today,
    Yesterday,
    TrailingMonth,
    TrailingYear,
}

impl WindowName {
    pub fn as_str(self) -> &'static str {
        match self {
            WindowName::Today => "today",
            WindowName::Yesterday => "yesterday",
            WindowName::TrailingMonth => "trailing_month",
            WindowName::TrailingYear => "trailing_year",
        }
    }
}

/// Outcome of one window query. Carries either a parsed body or an error, never both.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct WindowResult {
    ok: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    status: Option<u16>,
    #[serde(skip_serializing_if = "Option::is_none")]
    body: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<String>,
}

impl WindowResult {
    pub fn success(status: StatusCode, body: Value) -> Self {
        Self {
            ok: true,
            status: Some(status.as_u16()),
            body: Some(body),
            error: None,
        }
    }

    /// `status` is set when the backend answered at all.
    pub fn failure(status: Option<StatusCode>, error: impl Into<String>) -> Self {
        Self {
            ok: false,
            status: status.map(|s| s.as_u16()),
            body: None,
            error: Some(error.into()),
        }
    }

    pub fn is_ok(&self) -> bool {
        self.ok
    }

    /// Reads a counter from the body, either `{"field": {"value": N}}` or `{"field": N}`.
    pub fn metric(&self, field: &str) -> Option<u64> {
        let value = self.body.as_ref()?.get(field)?;
        match value {
            Value::Object(inner) => inner.get("value")?.as_u64(),
            other => other.as_u64(),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct WindowResults {
    pub today: WindowResult,
    pub yesterday: WindowResult,
    pub trailing_month: WindowResult,
    pub trailing_year: WindowResult,
}

impl WindowResults {
    fn iter(&self) -> impl Iterator<Item = &WindowResult> {
        [
            &self.today,
            &self.yesterday,
            &self.trailing_month,
            &self.trailing_year,
        ]
        .into_iter()
    }

    pub fn all_succeeded(&self) -> bool {
        self.iter().all(WindowResult::is_ok)
    }

    pub fn all_failed(&self) -> bool {
        !self.iter().any(WindowResult::is_ok)
    }
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct AggregatePayload {
    pub today_visitors: Option<u64>,
    pub today_pageviews: Option<u64>,
    pub yesterday_visitors: Option<u64>,
    pub yesterday_pageviews: Option<u64>,
    pub trailing_month_pageviews: Option<u64>,
    pub trailing_year_pageviews: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub diagnostics: Option<WindowResults>,
}

impl AggregatePayload {
    /// Failed windows leave their fields `null`; assembly itself never fails.
    pub fn assemble(results: WindowResults, include_diagnostics: bool) -> Self {
        Self {
            today_visitors: results.today.metric("visitors"),
            today_pageviews: results.today.metric("pageviews"),
            yesterday_visitors: results.yesterday.metric("visitors"),
            yesterday_pageviews: results.yesterday.metric("pageviews"),
            trailing_month_pageviews: results.trailing_month.metric("pageviews"),
            trailing_year_pageviews: results.trailing_year.metric("pageviews"),
            diagnostics: include_diagnostics.then_some(results),
        }
    }
}

/// Queries the statistics endpoint once per window, concurrently.
#[derive(Clone, Debug)]
pub struct StatsAggregator {
    client: UpstreamClient,
    base: Url,
    website_id: String,
    credential: Credential,
}

impl StatsAggregator {
    pub fn new(client: UpstreamClient, base: Url, website_id: &str, credential: Credential) -> Self {
        Self {
            client,
            base,
            website_id: website_id.to_string(),
            credential,
        }
    }

    /// Runs the four window queries and waits for all of them to settle.
    pub async fn aggregate(&self, windows: &Windows) -> WindowResults {
        let mut join_set = JoinSet::new();
        let mut task_windows = HashMap::new();

        for (name, window) in [
            (WindowName::Today, windows.today),
            (WindowName::Yesterday, windows.yesterday),
            (WindowName::TrailingMonth, windows.trailing_month),
            (WindowName::TrailingYear, windows.trailing_year),
        ] {
            let aggregator = self.clone();
            let abort_handle =
                join_set.spawn(async move { (name, aggregator.query_window(name, window).await) });
            task_windows.insert(abort_handle.id(), name);
        }

        let mut results: HashMap<WindowName, WindowResult> = HashMap::new();
        while let Some(joined) = join_set.join_next_with_id().await {
            match joined {
                Ok((_, (name, result))) => {
                    results.insert(name, result);
                }
                Err(e) => {
                    let Some(name) = task_windows.get(&e.id()).copied() else {
                        continue;
                    };
                    tracing::error!(window = name.as_str(), error = %e, "Window task failed");
                    counter!(UPSTREAM_WINDOW_FAILURES, "window" => name.as_str()).increment(1);
                    results.insert(name, WindowResult::failure(None, format!("task failed: {e}")));
                }
            }
        }

        let mut take = |name: WindowName| {
            results
                .remove(&name)
                .unwrap_or_else(|| WindowResult::failure(None, "window was not queried"))
        };
        WindowResults {
            today: take(WindowName::Today),
            yesterday: take(WindowName::Yesterday),
            trailing_month: take(WindowName::TrailingMonth),
            trailing_year: take(WindowName::TrailingYear),
        }
    }

    async fn query_window(&self, name: WindowName, window: TimeWindow) -> WindowResult {
        let result = self.fetch(window).await;
        if !result.is_ok() {
            counter!(UPSTREAM_WINDOW_FAILURES, "window" => name.as_str()).increment(1);
            tracing::warn!(
                window = name.as_str(),
                status = ?result.status,
                error = ?result.error,
                "Window query failed"
            );
        }
        result
    }

    async fn fetch(&self, window: TimeWindow) -> WindowResult {
        let uri = format!(
            "/api/websites/{}/stats?startAt={}&endAt={}",
            self.website_id,
            window.start_ms(),
            window.end_ms()
        );
        let mut request = match Request::get(uri).body(Bytes::new()) {
            Ok(request) => request,
            Err(e) => return WindowResult::failure(None, format!("invalid request: {e}")),
        };
        if let Err(e) = inject_credential(request.headers_mut(), &self.credential) {
            return WindowResult::failure(None, e.to_string());
        }

        let response = match self.client.send(&self.base, request).await {
            Ok(response) => response,
            Err(e) => return WindowResult::failure(None, e.to_string()),
        };

        if !response.is_success() {
            let reason = response.status.canonical_reason().unwrap_or("unknown status");
            return WindowResult::failure(Some(response.status), reason);
        }

        match serde_json::from_slice(&response.body) {
            Ok(body) => WindowResult::success(response.status, body),
            Err(e) => WindowResult::failure(Some(response.status), format!("invalid JSON body: {e}")),
        }
    }
}
