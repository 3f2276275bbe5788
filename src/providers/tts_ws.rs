//! WebSocket streaming TTS adapter (`ws.tts`).
//!
//! Sentence-sized text fragments go up as JSON, synthesized PCM comes back
//! as binary frames at the provider's native rate (`sampleRate` option,
//! default 24 kHz). The outbound audio pipeline resamples chunkwise to the
//! canonical rate, so no rate handling happens here.
//!
//! Like the STT adapter, `open` returns immediately and text pushed before
//! the socket is up is queued.

use anyhow::Result;
use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, warn};

use super::tts::{TtsAdapter, TtsStream};
use super::{opt_str, opt_u64, AdapterOptions};
use crate::audio::AudioFrame;
use crate::errors::AdapterError;
use crate::session::events::{EventSink, TtsEvent};

const DEFAULT_OUTPUT_RATE: u32 = 24_000;

pub struct WsTtsAdapter;

impl WsTtsAdapter {
    pub fn new() -> Self {
        Self
    }
}

impl Default for WsTtsAdapter {
    fn default() -> Self {
        Self::new()
    }
}

enum Command {
    Text(String),
    Flush,
    Abort,
}

struct WsTtsStream {
    tx: mpsc::UnboundedSender<Command>,
}

impl TtsStream for WsTtsStream {
    fn push_text(&self, text: &str) {
        let _ = self.tx.send(Command::Text(text.to_string()));
    }

    fn flush_and_close(&self) {
        let _ = self.tx.send(Command::Flush);
    }

    fn abort(&self) {
        let _ = self.tx.send(Command::Abort);
    }
}

#[async_trait]
impl TtsAdapter for WsTtsAdapter {
    fn id(&self) -> &str {
        "ws.tts"
    }

    async fn open(
        &self,
        options: &AdapterOptions,
        turn: u64,
        sink: EventSink,
    ) -> Result<Box<dyn TtsStream>> {
        if opt_str(options, "url").is_none() {
            return Err(AdapterError::MissingOption("url").into());
        }

        let (tx, rx) = mpsc::unbounded_channel();
        let options = options.clone();

        tokio::spawn(async move {
            if let Err(e) = run_session(options, turn, sink.clone(), rx).await {
                sink.send_tts(turn, TtsEvent::Error(e.to_string()));
            }
        });

        Ok(Box::new(WsTtsStream { tx }))
    }
}

async fn run_session(
    options: AdapterOptions,
    turn: u64,
    sink: EventSink,
    mut rx: mpsc::UnboundedReceiver<Command>,
) -> Result<()> {
    let url = opt_str(&options, "url")
        .ok_or(AdapterError::MissingOption("url"))?
        .to_string();
    let sample_rate = opt_u64(&options, "sampleRate").unwrap_or(DEFAULT_OUTPUT_RATE as u64) as u32;
    let voice = opt_str(&options, "voice").map(String::from);

    let (socket, _) = tokio_tungstenite::connect_async(&url)
        .await
        .map_err(|e| AdapterError::Connect(e.to_string()))?;
    debug!("TTS socket connected: {}", url);

    let (mut write, mut read) = socket.split();

    if let Some(voice) = voice {
        let config = serde_json::json!({"type": "config", "voice": voice});
        write
            .send(Message::Text(config.to_string()))
            .await
            .map_err(|_| AdapterError::StreamClosed)?;
    }

    let mut flushed = false;

    loop {
        tokio::select! {
            cmd = rx.recv() => {
                match cmd {
                    Some(Command::Text(text)) if !flushed => {
                        let msg = serde_json::json!({"type": "text", "text": text});
                        write
                            .send(Message::Text(msg.to_string()))
                            .await
                            .map_err(|_| AdapterError::StreamClosed)?;
                    }
                    Some(Command::Flush) if !flushed => {
                        let msg = serde_json::json!({"type": "eos"});
                        write
                            .send(Message::Text(msg.to_string()))
                            .await
                            .map_err(|_| AdapterError::StreamClosed)?;
                        flushed = true;
                    }
                    Some(Command::Text(_)) | Some(Command::Flush) => {}
                    Some(Command::Abort) | None => {
                        let _ = write.send(Message::Close(None)).await;
                        return Ok(());
                    }
                }
            }
            msg = read.next() => {
                match msg {
                    Some(Ok(Message::Binary(bytes))) => {
                        let pcm = AudioFrame::samples_from_le_bytes(&bytes);
                        if !pcm.is_empty() {
                            sink.send_tts(turn, TtsEvent::Audio {
                                pcm,
                                sample_rate,
                                is_final: false,
                            });
                        }
                    }
                    Some(Ok(Message::Text(text))) => {
                        match parse_control_message(&text) {
                            Some(Control::End) => {
                                sink.send_tts(turn, TtsEvent::End);
                                let _ = write.send(Message::Close(None)).await;
                                return Ok(());
                            }
                            Some(Control::Error(e)) => {
                                return Err(AdapterError::Protocol(e).into());
                            }
                            None => {}
                        }
                    }
                    Some(Ok(Message::Close(_))) | None => {
                        if flushed {
                            // Provider closed instead of sending an end
                            // marker; treat the stream as complete.
                            sink.send_tts(turn, TtsEvent::End);
                            return Ok(());
                        }
                        return Err(AdapterError::StreamClosed.into());
                    }
                    Some(Ok(_)) => {}
                    Some(Err(e)) => {
                        warn!("TTS socket error: {}", e);
                        return Err(AdapterError::StreamClosed.into());
                    }
                }
            }
        }
    }
}

enum Control {
    End,
    Error(String),
}

fn parse_control_message(text: &str) -> Option<Control> {
    let data: serde_json::Value = serde_json::from_str(text).ok()?;
    match data.get("type").and_then(|v| v.as_str())? {
        "end" => Some(Control::End),
        "error" => Some(Control::Error(
            data.get("error")
                .and_then(|v| v.as_str())
                .unwrap_or("unknown provider error")
                .to_string(),
        )),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_end_message() {
        assert!(matches!(
            parse_control_message(r#"{"type":"end"}"#),
            Some(Control::End)
        ));
    }

    #[test]
    fn test_parse_error_message() {
        match parse_control_message(r#"{"type":"error","error":"voice missing"}"#) {
            Some(Control::Error(e)) => assert_eq!(e, "voice missing"),
            _ => panic!("expected error"),
        }
    }

    #[test]
    fn test_unknown_messages_ignored() {
        assert!(parse_control_message(r#"{"type":"progress","pct":50}"#).is_none());
        assert!(parse_control_message("garbage").is_none());
    }

    #[tokio::test]
    async fn test_open_requires_url() {
        let adapter = WsTtsAdapter::new();
        let (sink, _rx) = crate::session::events::session_queue();
        let err = adapter
            .open(&AdapterOptions::new(), 1, sink)
            .await
            .err()
            .expect("must reject missing url");
        assert!(matches!(
            err.downcast_ref::<AdapterError>(),
            Some(AdapterError::MissingOption("url"))
        ));
    }
}
