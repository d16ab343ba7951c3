//! The Request event: an immutable record of one completed HTTP interaction.
//!
//! This is the unit of work the instrumented session hands to the stats
//! aggregator. Its `error` field is a tagged union rather than the mixed
//! `bool`/`Exception`/`str` shape the original implementation used across
//! its various iterations, so every consumer can match on it exhaustively.

use std::time::Duration;

/// The kind of failure a structured error represents.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// DNS, socket, or TLS handshake failure before any response arrived.
    Connect,
    /// The response carried a status code the caller asked to treat as failure.
    Status(u16),
    /// The request did not complete within the configured deadline.
    Timeout,
    /// An assertion (or other panic) unwound out of the scenario's scope.
    Assertion,
    /// Anything else the session can't classify more precisely.
    Other,
}

impl ErrorKind {
    pub fn label(&self) -> String {
        match self {
            ErrorKind::Connect => "connect".to_string(),
            ErrorKind::Status(code) => format!("status_{code}"),
            ErrorKind::Timeout => "timeout".to_string(),
            ErrorKind::Assertion => "assertion".to_string(),
            ErrorKind::Other => "other".to_string(),
        }
    }
}

/// The tagged error union a `RequestEvent` carries.
///
/// Priority when more than one applies (highest first): `Structured` with
/// `ErrorKind::Assertion` set by a panic unwinding through the scope,
/// `SuccessOverride`/`Message` set explicitly by the caller, a `Structured`
/// error synthesized from the protocol, then `None`.
#[derive(Debug, Clone)]
pub enum ErrorSignal {
    /// No error; the request is a success.
    None,
    /// The caller explicitly forced success classification (`error = false`
    /// in the original), overriding what would otherwise be a bad status.
    SuccessOverride,
    /// The caller set a human-readable error string directly on the scope.
    Message(String),
    /// A structured, classified failure.
    Structured {
        kind: ErrorKind,
        class_name: &'static str,
        message: String,
    },
}

impl ErrorSignal {
    /// Whether this signal should count as a failure for `error_count`.
    pub fn is_error(&self) -> bool {
        !matches!(self, ErrorSignal::None | ErrorSignal::SuccessOverride)
    }

    /// The string form used as a key into the bounded error-signature
    /// counter. `None`/`SuccessOverride` never reach this (callers only
    /// call it when `is_error()` is true).
    pub fn signature(&self) -> String {
        match self {
            ErrorSignal::None | ErrorSignal::SuccessOverride => String::new(),
            ErrorSignal::Message(msg) => msg.clone(),
            // HTTP status failures render aiohttp-`ClientResponseError`-style,
            // status code leading (`"404, message='Not Found', ..."`), since
            // that prefix is what operators grep for in the error table.
            ErrorSignal::Structured {
                kind: ErrorKind::Status(code),
                message,
                ..
            } => format!("{code}, {message}"),
            ErrorSignal::Structured {
                kind,
                class_name,
                message,
            } => format!("{class_name}({}): {message}", kind.label()),
        }
    }

    /// The `error.type` attribute the aggregator tags histogram points
    /// with, mirroring the original's `req.error.__class__.__name__`.
    pub fn class_name(&self) -> Option<&'static str> {
        match self {
            ErrorSignal::Structured { class_name, .. } => Some(class_name),
            ErrorSignal::Message(_) => Some("Message"),
            ErrorSignal::None | ErrorSignal::SuccessOverride => None,
        }
    }
}

/// One completed HTTP interaction, ready for ingestion by the stats
/// aggregator. Created exactly once per scoped request handle, regardless
/// of which exit path (success, classified failure, or panic) produced it.
#[derive(Debug, Clone)]
pub struct RequestEvent {
    pub name: String,
    pub ttfb: Duration,
    pub ttlb: Duration,
    pub error: ErrorSignal,
}

impl RequestEvent {
    pub fn success(name: impl Into<String>, ttfb: Duration, ttlb: Duration) -> Self {
        Self {
            name: name.into(),
            ttfb,
            ttlb,
            error: ErrorSignal::None,
        }
    }
}
