//! The instrumented session: a thin wrapper around `reqwest::Client` where
//! every request produces a timed, classified `RequestEvent`.
//!
//! The central type is `RequestScope`, a guard returned by each verb on the
//! "entered the response" path. Its `Drop` impl is the single place a
//! `RequestEvent` is emitted, so finalization happens on every exit path —
//! normal block exit, an early `return`, or a panic unwinding through the
//! scenario's scope — without the caller having to remember to call
//! anything.

use std::sync::Arc;
use std::time::{Duration, Instant};

use reqwest::{Method, Response};
use tracing::{debug, Instrument};

use crate::connection_pool::GLOBAL_POOL_STATS;
use crate::errors::classify_reqwest_error;
use crate::metrics::{
    status_code_label, CONCURRENT_REQUESTS, REQUEST_DURATION_SECONDS, REQUEST_STATUS_CODES,
    REQUEST_TOTAL,
};
use crate::request::{ErrorKind, ErrorSignal, RequestEvent};
use crate::stats::StatsHandle;

/// Options a scenario can pass when issuing a request.
#[derive(Debug, Clone, Default)]
pub struct RequestOptions {
    /// Overrides the event's recorded name (grouping parameterized URLs).
    pub name: Option<String>,
    /// When true, a ≥400 response is classified and returned as an `Err`
    /// immediately, without draining the body (the "interrupt the user
    /// flow on http status code error" contract).
    pub raise_for_status: bool,
}

impl RequestOptions {
    pub fn named(name: impl Into<String>) -> Self {
        Self {
            name: Some(name.into()),
            raise_for_status: false,
        }
    }

    pub fn raise_for_status(mut self, yes: bool) -> Self {
        self.raise_for_status = yes;
        self
    }
}

/// Failures that propagate out of the session's verbs before a
/// `RequestScope` exists to hand back to the caller. Every variant has
/// already been recorded into the stats aggregator by the time it surfaces.
#[derive(Debug, thiserror::Error)]
pub enum ScenarioError {
    #[error("connect failure: {0}")]
    Connect(String),
    #[error("http status error: {0}")]
    Status(u16),
    #[error("request timed out")]
    Timeout,
    #[error("scenario error: {0}")]
    Other(String),
}

/// Wraps a `reqwest::Client` plus the stats handle every request reports
/// to. Cheap to clone; the user loop owns one per virtual user.
#[derive(Clone)]
pub struct InstrumentedSession {
    client: reqwest::Client,
    stats: StatsHandle,
    base_url: Option<Arc<String>>,
}

impl InstrumentedSession {
    pub fn new(client: reqwest::Client, stats: StatsHandle) -> Self {
        Self {
            client,
            stats,
            base_url: None,
        }
    }

    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = Some(Arc::new(base_url.into()));
        self
    }

    fn resolve(&self, url: &str) -> String {
        match &self.base_url {
            Some(base) if !url.starts_with("http://") && !url.starts_with("https://") => {
                format!("{base}{url}")
            }
            _ => url.to_string(),
        }
    }

    pub async fn get(&self, url: &str, opts: RequestOptions) -> Result<RequestScope, ScenarioError> {
        self.execute(Method::GET, url, opts).await
    }

    pub async fn post(&self, url: &str, opts: RequestOptions) -> Result<RequestScope, ScenarioError> {
        self.execute(Method::POST, url, opts).await
    }

    pub async fn put(&self, url: &str, opts: RequestOptions) -> Result<RequestScope, ScenarioError> {
        self.execute(Method::PUT, url, opts).await
    }

    pub async fn patch(&self, url: &str, opts: RequestOptions) -> Result<RequestScope, ScenarioError> {
        self.execute(Method::PATCH, url, opts).await
    }

    pub async fn delete(&self, url: &str, opts: RequestOptions) -> Result<RequestScope, ScenarioError> {
        self.execute(Method::DELETE, url, opts).await
    }

    pub async fn head(&self, url: &str, opts: RequestOptions) -> Result<RequestScope, ScenarioError> {
        self.execute(Method::HEAD, url, opts).await
    }

    pub async fn options(&self, url: &str, opts: RequestOptions) -> Result<RequestScope, ScenarioError> {
        self.execute(Method::OPTIONS, url, opts).await
    }

    /// Upgrades to a WebSocket connection. Framing is not timed by the
    /// engine; the scenario is responsible for recording synthetic
    /// `RequestEvent`s for individual frames via `self.stats()`.
    pub async fn websocket(&self, url: &str) -> Result<WebSocketHandle, ScenarioError> {
        let resolved = self.resolve(url);
        debug!(url = %resolved, "opening websocket connection");
        // reqwest has no websocket support; establishing the upgrade is left
        // to whichever websocket client crate the scenario pulls in. This
        // handle only carries the resolved URL and a reference to the
        // aggregator so synthetic frame events can still be recorded.
        Ok(WebSocketHandle {
            url: resolved,
            stats: self.stats.clone(),
        })
    }

    /// Exposes the stats handle for scenarios that need to record events
    /// the engine itself doesn't time (e.g. WebSocket frames).
    pub fn stats(&self) -> &StatsHandle {
        &self.stats
    }

    async fn execute(
        &self,
        method: Method,
        url: &str,
        opts: RequestOptions,
    ) -> Result<RequestScope, ScenarioError> {
        let resolved = self.resolve(url);
        let name = opts.name.clone().unwrap_or_else(|| resolved.clone());
        let t0 = Instant::now();

        CONCURRENT_REQUESTS.inc();
        REQUEST_TOTAL.inc();

        let span = tracing::debug_span!("http_request", name = %name, method = %method);
        let send_result = self
            .client
            .request(method, &resolved)
            .send()
            .instrument(span)
            .await;

        let response = match send_result {
            Err(err) => {
                let elapsed = t0.elapsed();
                let kind = classify_reqwest_error(&err);
                let name = name_on_connect_failure(&name, &resolved, &err);
                REQUEST_STATUS_CODES.with_label_values(&["error"]).inc();
                REQUEST_DURATION_SECONDS.observe(elapsed.as_secs_f64());
                CONCURRENT_REQUESTS.dec();
                self.emit_fast_path(&name, elapsed, kind, err.to_string());
                return Err(match kind {
                    ErrorKind::Timeout => ScenarioError::Timeout,
                    _ => ScenarioError::Connect(err.to_string()),
                });
            }
            Ok(resp) => resp,
        };

        let status = response.status().as_u16();
        REQUEST_STATUS_CODES
            .with_label_values(&[status_code_label(status)])
            .inc();
        if opts.raise_for_status && status >= 400 {
            let elapsed = t0.elapsed();
            REQUEST_DURATION_SECONDS.observe(elapsed.as_secs_f64());
            CONCURRENT_REQUESTS.dec();
            let reason = response.status().canonical_reason().unwrap_or("Unknown Error");
            self.emit_fast_path(
                &name,
                elapsed,
                ErrorKind::Status(status),
                format!("message='{reason}', url='{resolved}'"),
            );
            return Err(ScenarioError::Status(status));
        }

        let ttfb = t0.elapsed();
        let drained = drain_body(response).await;
        let ttlb = t0.elapsed();
        REQUEST_DURATION_SECONDS.observe(ttlb.as_secs_f64());
        CONCURRENT_REQUESTS.dec();
        GLOBAL_POOL_STATS.record_request(ttlb.as_millis() as u64);

        let (headers, body) = match drained {
            Ok(pair) => pair,
            Err(err) => {
                self.emit_fast_path(&name, ttlb, ErrorKind::Other, err.to_string());
                return Err(err);
            }
        };

        Ok(RequestScope {
            name,
            ttfb,
            ttlb,
            status,
            headers,
            body,
            error: ErrorSignal::None,
            stats: self.stats.clone(),
            emitted: false,
        })
    }

    fn emit_fast_path(&self, name: &str, elapsed: Duration, kind: ErrorKind, message: String) {
        let class_name = match kind {
            ErrorKind::Connect => "ConnectError",
            ErrorKind::Status(_) => "HttpStatusError",
            ErrorKind::Timeout => "TimeoutError",
            ErrorKind::Assertion => "AssertionError",
            ErrorKind::Other => "Error",
        };
        self.stats.record(RequestEvent {
            name: name.to_string(),
            ttfb: elapsed,
            ttlb: elapsed,
            error: ErrorSignal::Structured {
                kind,
                class_name,
                message,
            },
        });
    }
}

/// Some connect failures never reach a point where `resolved` is
/// meaningful (e.g. a malformed host). Falling back to the caller's raw
/// input argument keeps the event's `name` populated either way.
fn name_on_connect_failure(name: &str, resolved: &str, _err: &reqwest::Error) -> String {
    if name.is_empty() {
        resolved.to_string()
    } else {
        name.to_string()
    }
}

async fn drain_body(
    response: Response,
) -> Result<(reqwest::header::HeaderMap, bytes::Bytes), ScenarioError> {
    let headers = response.headers().clone();
    let body = response
        .bytes()
        .await
        .map_err(|e| ScenarioError::Other(e.to_string()))?;
    Ok((headers, body))
}

/// A raw WebSocket connection handle. Frame-level timing is not part of
/// the engine's contract; scenarios record their own synthetic events.
pub struct WebSocketHandle {
    pub url: String,
    stats: StatsHandle,
}

impl WebSocketHandle {
    pub fn stats(&self) -> &StatsHandle {
        &self.stats
    }
}

/// The scoped request handle. Holds the response's headers and body for
/// the scenario to inspect, and finalizes exactly one `RequestEvent` when
/// dropped — whether that drop is an ordinary scope exit or a panic
/// unwinding through an assertion.
pub struct RequestScope {
    name: String,
    ttfb: Duration,
    ttlb: Duration,
    status: u16,
    headers: reqwest::header::HeaderMap,
    body: bytes::Bytes,
    error: ErrorSignal,
    stats: StatsHandle,
    emitted: bool,
}

impl RequestScope {
    pub fn status(&self) -> u16 {
        self.status
    }

    pub fn headers(&self) -> &reqwest::header::HeaderMap {
        &self.headers
    }

    pub fn bytes(&self) -> &[u8] {
        &self.body
    }

    pub fn text(&self) -> Result<&str, std::str::Utf8Error> {
        std::str::from_utf8(&self.body)
    }

    /// Sets a human-readable error string on the scope. Takes priority
    /// over any status-derived classification, but is itself overwritten
    /// if the scope exits via a panic (an assertion always wins).
    pub fn set_error(&mut self, message: impl Into<String>) {
        self.error = ErrorSignal::Message(message.into());
    }

    /// Forces success classification even if the status is ≥400 — the
    /// contract a scenario uses to declare a 4xx semantically acceptable.
    pub fn force_success(&mut self) {
        self.error = ErrorSignal::SuccessOverride;
    }
}

impl Drop for RequestScope {
    fn drop(&mut self) {
        if self.emitted {
            return;
        }
        self.emitted = true;

        let mut error = std::mem::replace(&mut self.error, ErrorSignal::None);
        if !matches!(error, ErrorSignal::SuccessOverride) && self.status >= 400 {
            if let ErrorSignal::None = error {
                error = ErrorSignal::Structured {
                    kind: ErrorKind::Status(self.status),
                    class_name: "HttpStatusError",
                    message: format!("HTTP {}", self.status),
                };
            }
        }
        if std::thread::panicking() {
            error = ErrorSignal::Structured {
                kind: ErrorKind::Assertion,
                class_name: "AssertionError",
                message: "assertion failed inside scenario scope".to_string(),
            };
        }

        self.stats.record(RequestEvent {
            name: self.name.clone(),
            ttfb: self.ttfb,
            ttlb: self.ttlb,
            error,
        });
    }
}
