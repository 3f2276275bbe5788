//! LLM capability: a conversation in, a streamed response out.

use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::task::JoinHandle;

use super::{AdapterOptions, CancelToken};
use crate::session::events::EventSink;

/// A fully-assembled tool call extracted from the stream.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolCallRequest {
    pub id: String,
    pub name: String,
    pub arguments: serde_json::Value,
}

impl ToolCallRequest {
    /// OpenAI function-call JSON shape, for appending to the conversation.
    pub fn to_openai_json(&self) -> serde_json::Value {
        serde_json::json!({
            "id": self.id,
            "type": "function",
            "function": {
                "name": self.name,
                "arguments": serde_json::to_string(&self.arguments)
                    .unwrap_or_else(|_| "{}".to_string()),
            }
        })
    }
}

/// One streaming request: ordered messages plus tool definitions.
#[derive(Debug, Clone)]
pub struct LlmRequest {
    /// OpenAI chat format: system, history, tool results, current user.
    pub messages: Vec<serde_json::Value>,
    pub tools: Vec<serde_json::Value>,
}

/// Handle to a running LLM streaming task.
///
/// The task posts `LlmEvent`s to the session sink and exits on its own at
/// end-of-stream, on error, or within ~200 ms of cancellation.
pub struct LlmTask {
    handle: JoinHandle<()>,
}

impl LlmTask {
    pub fn new(handle: JoinHandle<()>) -> Self {
        Self { handle }
    }

    /// Await task exit as cancellation confirmation, up to `deadline`.
    /// Returns `false` if the deadline passed and the task was aborted.
    pub async fn confirm_cancelled(self, deadline: Duration) -> bool {
        let abort = self.handle.abort_handle();
        match tokio::time::timeout(deadline, self.handle).await {
            Ok(_) => true,
            Err(_) => {
                abort.abort();
                false
            }
        }
    }

    /// Detach without waiting (normal end-of-stream path).
    pub fn forget(self) {
        drop(self.handle);
    }
}

/// Factory for streamed chat completions.
#[async_trait]
pub trait LlmAdapter: Send + Sync {
    fn id(&self) -> &str;

    /// Start streaming a response. Returns immediately; the spawned task
    /// performs the request and posts `LlmEvent`s tagged with `turn`.
    async fn stream(
        &self,
        options: &AdapterOptions,
        request: LlmRequest,
        turn: u64,
        sink: EventSink,
        cancel: CancelToken,
    ) -> Result<LlmTask>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tool_call_openai_json_shape() {
        let tc = ToolCallRequest {
            id: "call_1".into(),
            name: "lookup_order".into(),
            arguments: serde_json::json!({"orderId": "A-17"}),
        };
        let json = tc.to_openai_json();
        assert_eq!(json["type"], "function");
        assert_eq!(json["function"]["name"], "lookup_order");
        // Arguments are a JSON-encoded string, as the chat API expects.
        let args: serde_json::Value =
            serde_json::from_str(json["function"]["arguments"].as_str().unwrap()).unwrap();
        assert_eq!(args["orderId"], "A-17");
    }

    #[tokio::test]
    async fn test_llm_task_confirm_within_deadline() {
        let task = LlmTask::new(tokio::spawn(async {}));
        assert!(task.confirm_cancelled(Duration::from_millis(100)).await);
    }

    #[tokio::test]
    async fn test_llm_task_deadline_aborts() {
        let task = LlmTask::new(tokio::spawn(async {
            tokio::time::sleep(Duration::from_secs(30)).await;
        }));
        let confirmed = task.confirm_cancelled(Duration::from_millis(50)).await;
        assert!(!confirmed, "hung task must be reported unconfirmed");
    }
}
