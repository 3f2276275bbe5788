//! OpenAI-compatible streaming LLM adapter (`openai.llm`).
//!
//! Talks to any endpoint implementing the OpenAI chat completions API
//! (OpenAI, OpenRouter, vLLM, llama.cpp server, ...). The request is issued
//! inside the spawned task so the scheduler never blocks on connect; deltas,
//! assembled tool calls, and the finish reason are posted to the session
//! sink as they arrive.

use std::collections::HashMap;

use anyhow::Result;
use async_trait::async_trait;
use futures_util::StreamExt;
use reqwest::Client;
use tracing::{debug, warn};

use super::llm::{LlmAdapter, LlmRequest, LlmTask, ToolCallRequest};
use super::{opt_f64, opt_str, opt_u64, AdapterOptions, CancelToken};
use crate::session::events::{EventSink, LlmEvent};

const DEFAULT_API_BASE: &str = "https://api.openai.com/v1";
const DEFAULT_MAX_TOKENS: u64 = 1024;
const DEFAULT_TEMPERATURE: f64 = 0.7;

pub struct OpenAiLlmAdapter {
    client: Client,
}

impl OpenAiLlmAdapter {
    pub fn new(client: Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl LlmAdapter for OpenAiLlmAdapter {
    fn id(&self) -> &str {
        "openai.llm"
    }

    async fn stream(
        &self,
        options: &AdapterOptions,
        request: LlmRequest,
        turn: u64,
        sink: EventSink,
        mut cancel: CancelToken,
    ) -> Result<LlmTask> {
        let api_base = opt_str(options, "apiBase")
            .unwrap_or(DEFAULT_API_BASE)
            .trim_end_matches('/')
            .to_string();
        let api_key = opt_str(options, "apiKey").unwrap_or_default().to_string();
        let model = opt_str(options, "model").unwrap_or("gpt-4o-mini").to_string();
        let max_tokens = opt_u64(options, "maxTokens").unwrap_or(DEFAULT_MAX_TOKENS);
        let temperature = opt_f64(options, "temperature").unwrap_or(DEFAULT_TEMPERATURE);

        let mut body = serde_json::json!({
            "model": model,
            "messages": request.messages,
            "max_tokens": max_tokens,
            "temperature": temperature,
            "stream": true,
        });
        if !request.tools.is_empty() {
            body["tools"] = serde_json::Value::Array(request.tools.clone());
            body["tool_choice"] = serde_json::json!("auto");
        }

        let client = self.client.clone();
        let url = format!("{}/chat/completions", api_base);

        let handle = tokio::spawn(async move {
            let send = client
                .post(&url)
                .header("Authorization", format!("Bearer {}", api_key))
                .header("Content-Type", "application/json")
                .json(&body)
                .send();

            let response = tokio::select! {
                r = send => r,
                _ = cancel.cancelled() => return,
            };

            let response = match response {
                Ok(r) => r,
                Err(e) => {
                    sink.send_llm(turn, LlmEvent::Error(format!("connection failed: {}", e)));
                    return;
                }
            };

            let status = response.status();
            if !status.is_success() {
                let message = response.text().await.unwrap_or_default();
                warn!("LLM API returned status {} (base={})", status, url);
                sink.send_llm(
                    turn,
                    LlmEvent::Error(format!(
                        "provider returned HTTP {}: {}",
                        status.as_u16(),
                        message
                    )),
                );
                return;
            }

            let byte_stream = response.bytes_stream();
            parse_sse_stream(byte_stream, turn, sink, cancel).await;
        });

        Ok(LlmTask::new(handle))
    }
}

/// Parse an SSE byte stream from an OpenAI-compatible streaming response.
///
/// Emits `Delta` for each content delta. Tool call argument fragments are
/// accumulated by index and emitted as complete `ToolCall` events before the
/// terminal `End`. Dropping the stream on cancellation closes the provider
/// connection.
async fn parse_sse_stream(
    byte_stream: impl futures_util::Stream<Item = std::result::Result<bytes::Bytes, reqwest::Error>>,
    turn: u64,
    sink: EventSink,
    mut cancel: CancelToken,
) {
    let mut line_buffer = String::new();
    let mut finish_reason = String::from("stop");
    // index → (id, name, arguments fragments)
    let mut tool_calls_acc: HashMap<u64, (String, String, String)> = HashMap::new();

    let mut stream = Box::pin(byte_stream);

    loop {
        let bytes = tokio::select! {
            next = stream.next() => match next {
                Some(Ok(b)) => b,
                Some(Err(e)) => {
                    sink.send_llm(turn, LlmEvent::Error(format!("stream closed unexpectedly: {}", e)));
                    return;
                }
                None => break,
            },
            _ = cancel.cancelled() => {
                debug!("LLM stream cancelled mid-flight");
                return;
            }
        };

        line_buffer.push_str(&String::from_utf8_lossy(&bytes));

        while let Some(newline_pos) = line_buffer.find('\n') {
            let line = line_buffer[..newline_pos].trim_end_matches('\r').to_string();
            line_buffer = line_buffer[newline_pos + 1..].to_string();

            let Some(data) = line.strip_prefix("data: ") else {
                continue;
            };

            if data == "[DONE]" {
                emit_tool_calls(&mut tool_calls_acc, turn, &sink);
                sink.send_llm(turn, LlmEvent::End { reason: finish_reason });
                return;
            }

            let chunk: serde_json::Value = match serde_json::from_str(data) {
                Ok(v) => v,
                Err(e) => {
                    debug!("SSE parse error (skipping chunk): {}", e);
                    continue;
                }
            };

            let Some(choice) = chunk.get("choices").and_then(|c| c.as_array()).and_then(|c| c.first())
            else {
                continue;
            };

            if let Some(fr) = choice.get("finish_reason").and_then(|v| v.as_str()) {
                finish_reason = fr.to_string();
            }

            let Some(delta) = choice.get("delta") else {
                continue;
            };

            if let Some(content) = delta.get("content").and_then(|v| v.as_str()) {
                if !content.is_empty() {
                    sink.send_llm(turn, LlmEvent::Delta(content.to_string()));
                }
            }

            if let Some(tc_array) = delta.get("tool_calls").and_then(|v| v.as_array()) {
                for tc in tc_array {
                    let index = tc.get("index").and_then(|v| v.as_u64()).unwrap_or(0);
                    let entry = tool_calls_acc.entry(index).or_default();
                    if let Some(id) = tc.get("id").and_then(|v| v.as_str()) {
                        entry.0 = id.to_string();
                    }
                    if let Some(function) = tc.get("function") {
                        if let Some(name) = function.get("name").and_then(|v| v.as_str()) {
                            entry.1 = name.to_string();
                        }
                        if let Some(args) = function.get("arguments").and_then(|v| v.as_str()) {
                            entry.2.push_str(args);
                        }
                    }
                }
            }
        }
    }

    // Stream ended without [DONE]: emit whatever was assembled.
    emit_tool_calls(&mut tool_calls_acc, turn, &sink);
    sink.send_llm(turn, LlmEvent::End { reason: finish_reason });
}

fn emit_tool_calls(
    acc: &mut HashMap<u64, (String, String, String)>,
    turn: u64,
    sink: &EventSink,
) {
    let mut indices: Vec<u64> = acc.keys().copied().collect();
    indices.sort_unstable();
    for idx in indices {
        let (id, name, args_str) = acc.remove(&idx).unwrap_or_default();
        if name.is_empty() {
            continue;
        }
        let arguments = serde_json::from_str(&args_str)
            .unwrap_or_else(|_| serde_json::json!({ "raw": args_str }));
        sink.send_llm(turn, LlmEvent::ToolCall { id, name, arguments });
    }
}

/// Build the full tool-call list from accumulated events, for appending the
/// assistant message to the conversation on a tool round.
pub fn tool_calls_message(content: &str, calls: &[ToolCallRequest]) -> serde_json::Value {
    serde_json::json!({
        "role": "assistant",
        "content": if content.is_empty() { serde_json::Value::Null } else { content.into() },
        "tool_calls": calls.iter().map(|c| c.to_openai_json()).collect::<Vec<_>>(),
    })
}

/// Build a tool-result message for the conversation.
pub fn tool_result_message(call: &ToolCallRequest, result: &str) -> serde_json::Value {
    serde_json::json!({
        "role": "tool",
        "tool_call_id": call.id,
        "name": call.name,
        "content": result,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::events::{session_queue, SessionEvent};

    fn sse_body(lines: &[&str]) -> Vec<std::result::Result<bytes::Bytes, reqwest::Error>> {
        lines
            .iter()
            .map(|l| Ok(bytes::Bytes::from(format!("{}\n", l))))
            .collect()
    }

    async fn drain_llm_events(
        rx: &mut tokio::sync::mpsc::UnboundedReceiver<SessionEvent>,
    ) -> Vec<crate::session::events::LlmEvent> {
        let mut out = Vec::new();
        while let Ok(ev) = rx.try_recv() {
            if let SessionEvent::Llm { event, .. } = ev {
                out.push(event);
            }
        }
        out
    }

    #[tokio::test]
    async fn test_parse_deltas_and_done() {
        let (sink, mut rx) = session_queue();
        let (_handle, cancel) = super::super::cancel_pair();

        let body = sse_body(&[
            r#"data: {"choices":[{"delta":{"content":"Bonjour"}}]}"#,
            r#"data: {"choices":[{"delta":{"content":", comment"}}]}"#,
            r#"data: {"choices":[{"delta":{},"finish_reason":"stop"}]}"#,
            "data: [DONE]",
        ]);
        parse_sse_stream(futures_util::stream::iter(body), 1, sink, cancel).await;

        let events = drain_llm_events(&mut rx).await;
        assert_eq!(events.len(), 3);
        assert!(matches!(&events[0], crate::session::events::LlmEvent::Delta(t) if t == "Bonjour"));
        assert!(
            matches!(&events[2], crate::session::events::LlmEvent::End { reason } if reason == "stop")
        );
    }

    #[tokio::test]
    async fn test_parse_tool_call_assembly() {
        let (sink, mut rx) = session_queue();
        let (_handle, cancel) = super::super::cancel_pair();

        let body = sse_body(&[
            r#"data: {"choices":[{"delta":{"tool_calls":[{"index":0,"id":"c1","function":{"name":"search","arguments":"{\"q\":"}}]}}]}"#,
            r#"data: {"choices":[{"delta":{"tool_calls":[{"index":0,"function":{"arguments":"\"rust\"}"}}]},"finish_reason":"tool_calls"}]}"#,
            "data: [DONE]",
        ]);
        parse_sse_stream(futures_util::stream::iter(body), 1, sink, cancel).await;

        let events = drain_llm_events(&mut rx).await;
        assert_eq!(events.len(), 2);
        match &events[0] {
            crate::session::events::LlmEvent::ToolCall { id, name, arguments } => {
                assert_eq!(id, "c1");
                assert_eq!(name, "search");
                assert_eq!(arguments["q"], "rust");
            }
            other => panic!("expected tool call, got {:?}", other),
        }
        assert!(matches!(
            &events[1],
            crate::session::events::LlmEvent::End { reason } if reason == "tool_calls"
        ));
    }

    #[tokio::test]
    async fn test_parse_unparseable_tool_arguments_kept_raw() {
        let (sink, mut rx) = session_queue();
        let (_handle, cancel) = super::super::cancel_pair();

        let body = sse_body(&[
            r#"data: {"choices":[{"delta":{"tool_calls":[{"index":0,"id":"c1","function":{"name":"broken","arguments":"not json"}}]},"finish_reason":"tool_calls"}]}"#,
            "data: [DONE]",
        ]);
        parse_sse_stream(futures_util::stream::iter(body), 1, sink, cancel).await;

        let events = drain_llm_events(&mut rx).await;
        match &events[0] {
            crate::session::events::LlmEvent::ToolCall { arguments, .. } => {
                assert_eq!(arguments["raw"], "not json");
            }
            other => panic!("expected tool call, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_stream_without_done_still_ends() {
        let (sink, mut rx) = session_queue();
        let (_handle, cancel) = super::super::cancel_pair();

        let body = sse_body(&[r#"data: {"choices":[{"delta":{"content":"partial"}}]}"#]);
        parse_sse_stream(futures_util::stream::iter(body), 1, sink, cancel).await;

        let events = drain_llm_events(&mut rx).await;
        assert!(matches!(
            events.last(),
            Some(crate::session::events::LlmEvent::End { .. })
        ));
    }

    #[tokio::test]
    async fn test_cancel_stops_stream_quickly() {
        let (sink, mut rx) = session_queue();
        let (handle, cancel) = super::super::cancel_pair();

        // An endless stream that yields slowly.
        let body = futures_util::stream::unfold(0u64, |n| async move {
            tokio::time::sleep(std::time::Duration::from_millis(50)).await;
            Some((
                Ok::<_, reqwest::Error>(bytes::Bytes::from(format!(
                    "data: {{\"choices\":[{{\"delta\":{{\"content\":\"t{}\"}}}}]}}\n",
                    n
                ))),
                n + 1,
            ))
        });

        let task = tokio::spawn(parse_sse_stream(Box::pin(body), 1, sink, cancel));
        tokio::time::sleep(std::time::Duration::from_millis(80)).await;
        handle.cancel();

        tokio::time::timeout(std::time::Duration::from_millis(200), task)
            .await
            .expect("parser must exit within 200ms of cancel")
            .unwrap();

        // No End event on the cancellation path; the scheduler already
        // abandoned the turn.
        let events = drain_llm_events(&mut rx).await;
        assert!(!events
            .iter()
            .any(|e| matches!(e, crate::session::events::LlmEvent::End { .. })));
    }

    #[test]
    fn test_tool_messages_shape() {
        let call = ToolCallRequest {
            id: "c9".into(),
            name: "stock".into(),
            arguments: serde_json::json!({"sku": 7}),
        };
        let assistant = tool_calls_message("", &[call.clone()]);
        assert_eq!(assistant["role"], "assistant");
        assert!(assistant["content"].is_null());
        assert_eq!(assistant["tool_calls"][0]["function"]["name"], "stock");

        let result = tool_result_message(&call, "in stock");
        assert_eq!(result["role"], "tool");
        assert_eq!(result["tool_call_id"], "c9");
        assert_eq!(result["content"], "in stock");
    }
}
