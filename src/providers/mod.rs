//! Provider capability traits and adapters.
//!
//! Each capability (STT, LLM, TTS, retrieval) is a small, stable trait; the
//! set of capabilities is closed. Concrete providers are an open set of
//! adapters registered by a stable `"provider.capability"` string id and
//! selected at session creation from the agent snapshot.

pub mod llm;
pub mod llm_openai;
pub mod registry;
pub mod retrieval;
pub mod stt;
pub mod stt_ws;
pub mod tts;
pub mod tts_ws;

use std::collections::HashMap;

use async_trait::async_trait;
use tokio::sync::watch;

pub use llm::{LlmAdapter, LlmRequest, LlmTask, ToolCallRequest};
pub use registry::ProviderRegistry;
pub use retrieval::{Retriever, ScoredContext};
pub use stt::{SttAdapter, SttStream};
pub use tts::{TtsAdapter, TtsStream};

/// Free-form adapter options from the agent configuration.
///
/// Adapters read the keys they understand and ignore the rest.
pub type AdapterOptions = HashMap<String, serde_json::Value>;

/// Read a string option.
pub fn opt_str<'a>(options: &'a AdapterOptions, key: &str) -> Option<&'a str> {
    options.get(key).and_then(|v| v.as_str())
}

/// Read a u64 option (accepts numbers only).
pub fn opt_u64(options: &AdapterOptions, key: &str) -> Option<u64> {
    options.get(key).and_then(|v| v.as_u64())
}

/// Read an f64 option.
pub fn opt_f64(options: &AdapterOptions, key: &str) -> Option<f64> {
    options.get(key).and_then(|v| v.as_f64())
}

// ---------------------------------------------------------------------------
// Cooperative cancellation
// ---------------------------------------------------------------------------

/// Scheduler-held half of a cancellation pair.
pub struct CancelHandle {
    tx: watch::Sender<bool>,
}

impl CancelHandle {
    /// Signal the task to stop. Idempotent.
    pub fn cancel(&self) {
        let _ = self.tx.send(true);
    }
}

/// Task-held half of a cancellation pair.
#[derive(Clone)]
pub struct CancelToken {
    rx: watch::Receiver<bool>,
}

impl CancelToken {
    pub fn is_cancelled(&self) -> bool {
        *self.rx.borrow()
    }

    /// Resolve when cancellation is signalled (or the handle is dropped).
    pub async fn cancelled(&mut self) {
        loop {
            if *self.rx.borrow() {
                return;
            }
            if self.rx.changed().await.is_err() {
                // Handle dropped without cancelling: treat as cancelled so
                // orphaned tasks release provider resources.
                return;
            }
        }
    }
}

/// Build a cancellation pair.
pub fn cancel_pair() -> (CancelHandle, CancelToken) {
    let (tx, rx) = watch::channel(false);
    (CancelHandle { tx }, CancelToken { rx })
}

// ---------------------------------------------------------------------------
// Tool execution seam
// ---------------------------------------------------------------------------

/// Executes tool calls requested by the LLM. Tool implementations are
/// external; the scheduler only wires requests to results.
#[async_trait]
pub trait ToolExecutor: Send + Sync {
    async fn execute(&self, name: &str, arguments: &serde_json::Value) -> anyhow::Result<String>;
}

/// Default executor for sessions without tools wired in.
pub struct NoToolExecutor;

#[async_trait]
impl ToolExecutor for NoToolExecutor {
    async fn execute(&self, name: &str, _arguments: &serde_json::Value) -> anyhow::Result<String> {
        Ok(format!("Error: tool '{}' is not available", name))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_opt_helpers() {
        let mut options = AdapterOptions::new();
        options.insert("url".into(), serde_json::json!("ws://x"));
        options.insert("topK".into(), serde_json::json!(5));
        options.insert("temperature".into(), serde_json::json!(0.7));

        assert_eq!(opt_str(&options, "url"), Some("ws://x"));
        assert_eq!(opt_u64(&options, "topK"), Some(5));
        assert_eq!(opt_f64(&options, "temperature"), Some(0.7));
        assert_eq!(opt_str(&options, "missing"), None);
        // Wrong type reads as None rather than erroring.
        assert_eq!(opt_u64(&options, "url"), None);
    }

    #[tokio::test]
    async fn test_cancel_pair_signals() {
        let (handle, mut token) = cancel_pair();
        assert!(!token.is_cancelled());
        handle.cancel();
        token.cancelled().await;
        assert!(token.is_cancelled());
    }

    #[tokio::test]
    async fn test_dropped_handle_counts_as_cancelled() {
        let (handle, mut token) = cancel_pair();
        drop(handle);
        // Must resolve rather than hang.
        tokio::time::timeout(std::time::Duration::from_millis(100), token.cancelled())
            .await
            .expect("cancelled() should resolve after handle drop");
    }

    #[tokio::test]
    async fn test_no_tool_executor_reports_unavailable() {
        let exec = NoToolExecutor;
        let out = exec.execute("magic", &serde_json::json!({})).await.unwrap();
        assert!(out.contains("magic"));
        assert!(out.starts_with("Error:"));
    }
}
