//! Domain error types for voxbot.
//!
//! Adapters report failures as events carrying an [`AdapterError`]; the
//! session scheduler maps them onto the closed [`FaultKind`] taxonomy and
//! decides recovery. Nothing is allowed to unwind past the scheduler loop.

use serde::Serialize;
use thiserror::Error;

// ---------------------------------------------------------------------------
// Fault taxonomy
// ---------------------------------------------------------------------------

/// Closed taxonomy of session-level faults.
///
/// Each variant maps to exactly one recovery policy in the scheduler:
/// teardown, retry-once, spoken fallback, silence insertion, or graceful
/// audio cut-off.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FaultKind {
    /// Peer hung up. Session teardown.
    TransportClosed,
    /// Audio gap on the transport. Silence is inserted; the session continues.
    TransportDiscontinuity,
    /// STT provider hiccup. Retried once with a fresh provider session.
    SttTransient,
    /// STT gave up. Turn aborted, fallback spoken, back to idle.
    SttFatal,
    /// Retrieval returned an error. Turn proceeds with zero contexts.
    RetrievalFailed,
    /// Retrieval exceeded its budget. Turn proceeds with zero contexts.
    RetrievalTimeout,
    /// LLM provider hiccup. Retried once.
    LlmTransient,
    /// LLM gave up. Partial text preserved, fallback spoken, back to idle.
    LlmFatal,
    /// TTS failed mid-stream. Emitted audio plays out; no retry.
    TtsFatal,
    /// The VAD error counter saturated. Session-fatal.
    VadSaturated,
}

impl FaultKind {
    /// Faults that end the session rather than the turn.
    pub fn is_session_fatal(self) -> bool {
        matches!(self, FaultKind::TransportClosed | FaultKind::VadSaturated)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            FaultKind::TransportClosed => "transport.closed",
            FaultKind::TransportDiscontinuity => "transport.discontinuity",
            FaultKind::SttTransient => "stt.transient",
            FaultKind::SttFatal => "stt.fatal",
            FaultKind::RetrievalFailed => "retrieval.failed",
            FaultKind::RetrievalTimeout => "retrieval.timeout",
            FaultKind::LlmTransient => "llm.transient",
            FaultKind::LlmFatal => "llm.fatal",
            FaultKind::TtsFatal => "tts.fatal",
            FaultKind::VadSaturated => "vad.saturated",
        }
    }
}

impl std::fmt::Display for FaultKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

// ---------------------------------------------------------------------------
// Adapter errors
// ---------------------------------------------------------------------------

/// Errors from provider adapter operations (STT/LLM/TTS/retrieval).
///
/// Embedded in `anyhow::Error` at the capability-trait seams so the trait
/// signatures stay small; callers downcast for classification:
/// `e.downcast_ref::<AdapterError>()`.
#[derive(Debug, Error)]
pub enum AdapterError {
    #[error("connection failed: {0}")]
    Connect(String),

    #[error("provider returned HTTP {status}: {message}")]
    Http { status: u16, message: String },

    #[error("protocol error: {0}")]
    Protocol(String),

    #[error("stream closed unexpectedly")]
    StreamClosed,

    #[error("missing required option: {0}")]
    MissingOption(&'static str),

    #[error("unknown adapter id: {0}")]
    UnknownAdapter(String),

    #[error("request cancelled")]
    Cancelled,
}

impl AdapterError {
    /// Whether the scheduler may retry once with a fresh provider session.
    ///
    /// Connection-level and server-side failures are transient; protocol
    /// violations, auth failures, and configuration mistakes are not.
    pub fn is_transient(&self) -> bool {
        match self {
            AdapterError::Connect(_) | AdapterError::StreamClosed => true,
            AdapterError::Http { status, .. } => *status == 429 || *status >= 500,
            AdapterError::Protocol(_)
            | AdapterError::MissingOption(_)
            | AdapterError::UnknownAdapter(_)
            | AdapterError::Cancelled => false,
        }
    }
}

/// Classify an adapter error string that crossed an event-channel boundary.
///
/// Adapter tasks post errors as strings (events must be `Clone`); the
/// scheduler recovers the transient/fatal split from known markers the
/// adapters embed. Unknown strings are treated as fatal.
pub fn error_is_transient(message: &str) -> bool {
    let lower = message.to_lowercase();

    if lower.contains("connection failed")
        || lower.contains("stream closed")
        || lower.contains("timed out")
        || lower.contains("timeout")
    {
        return true;
    }

    // HTTP status embedded by AdapterError::Http display.
    if let Some(pos) = lower.find("http ") {
        let digits: String = lower[pos + 5..]
            .chars()
            .take_while(|c| c.is_ascii_digit())
            .collect();
        if let Ok(status) = digits.parse::<u16>() {
            return status == 429 || status >= 500;
        }
    }

    false
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fault_kind_display() {
        assert_eq!(FaultKind::SttFatal.to_string(), "stt.fatal");
        assert_eq!(
            FaultKind::TransportDiscontinuity.to_string(),
            "transport.discontinuity"
        );
    }

    #[test]
    fn test_fault_kind_session_fatal() {
        assert!(FaultKind::TransportClosed.is_session_fatal());
        assert!(FaultKind::VadSaturated.is_session_fatal());
        assert!(!FaultKind::SttFatal.is_session_fatal());
        assert!(!FaultKind::RetrievalTimeout.is_session_fatal());
    }

    #[test]
    fn test_adapter_error_transient_classification() {
        assert!(AdapterError::Connect("refused".into()).is_transient());
        assert!(AdapterError::StreamClosed.is_transient());
        assert!(AdapterError::Http { status: 429, message: "slow down".into() }.is_transient());
        assert!(AdapterError::Http { status: 503, message: "overloaded".into() }.is_transient());
        assert!(!AdapterError::Http { status: 401, message: "bad key".into() }.is_transient());
        assert!(!AdapterError::Protocol("bad json".into()).is_transient());
        assert!(!AdapterError::Cancelled.is_transient());
    }

    #[test]
    fn test_adapter_error_downcast() {
        let err: anyhow::Error =
            AdapterError::Http { status: 500, message: "boom".into() }.into();
        let downcast = err.downcast_ref::<AdapterError>();
        assert!(matches!(downcast, Some(AdapterError::Http { status: 500, .. })));
    }

    #[test]
    fn test_error_is_transient_markers() {
        assert!(error_is_transient("connection failed: refused"));
        assert!(error_is_transient("provider returned HTTP 503: busy"));
        assert!(error_is_transient("request timed out"));
        assert!(!error_is_transient("provider returned HTTP 401: unauthorized"));
        assert!(!error_is_transient("protocol error: unexpected frame"));
        assert!(!error_is_transient("something else entirely"));
    }
}
