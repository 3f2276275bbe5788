//! WebSocket streaming STT adapter (`ws.stt`).
//!
//! Two-step provider flow: an HTTP init request returns a socket URL for
//! the live session; audio then goes up as binary PCM frames and transcript
//! events come down as JSON. Providers that skip the init step are
//! supported with a direct `url` option.
//!
//! `open` returns immediately: the connection is established by a
//! background task and frames pushed in the meantime are queued, so the
//! scheduler never blocks on provider I/O.

use anyhow::Result;
use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, warn};

use super::stt::{SttAdapter, SttStream};
use super::{opt_str, AdapterOptions};
use crate::audio::{AudioFrame, SAMPLE_RATE};
use crate::errors::AdapterError;
use crate::session::events::{EventSink, SttEvent};

pub struct WsSttAdapter {
    client: reqwest::Client,
}

impl WsSttAdapter {
    pub fn new(client: reqwest::Client) -> Self {
        Self { client }
    }
}

enum Command {
    Frame(Vec<u8>),
    CloseInput,
    Abort,
}

/// Input half handed to the scheduler. All methods enqueue to the writer
/// task.
struct WsSttStream {
    tx: mpsc::UnboundedSender<Command>,
}

impl SttStream for WsSttStream {
    fn push(&self, frame: &AudioFrame) {
        let _ = self.tx.send(Command::Frame(frame.to_le_bytes()));
    }

    fn close_input(&self) {
        let _ = self.tx.send(Command::CloseInput);
    }

    fn abort(&self) {
        let _ = self.tx.send(Command::Abort);
    }
}

#[async_trait]
impl SttAdapter for WsSttAdapter {
    fn id(&self) -> &str {
        "ws.stt"
    }

    async fn open(
        &self,
        options: &AdapterOptions,
        turn: u64,
        sink: EventSink,
    ) -> Result<Box<dyn SttStream>> {
        if opt_str(options, "url").is_none() && opt_str(options, "initUrl").is_none() {
            return Err(AdapterError::MissingOption("url").into());
        }

        let (tx, rx) = mpsc::unbounded_channel();
        let options = options.clone();
        let client = self.client.clone();

        tokio::spawn(async move {
            if let Err(e) = run_session(client, options, turn, sink.clone(), rx).await {
                sink.send_stt(turn, SttEvent::Error(e.to_string()));
            }
        });

        Ok(Box::new(WsSttStream { tx }))
    }
}

/// Resolve the socket URL, connect, and pump both directions until the
/// provider closes or the scheduler aborts.
async fn run_session(
    client: reqwest::Client,
    options: AdapterOptions,
    turn: u64,
    sink: EventSink,
    mut rx: mpsc::UnboundedReceiver<Command>,
) -> Result<()> {
    let ws_url = match opt_str(&options, "url") {
        Some(url) => url.to_string(),
        None => init_provider_session(&client, &options).await?,
    };

    let (socket, _) = tokio_tungstenite::connect_async(&ws_url)
        .await
        .map_err(|e| AdapterError::Connect(e.to_string()))?;
    debug!("STT socket connected: {}", ws_url);

    let (mut write, mut read) = socket.split();
    let mut input_closed = false;

    loop {
        tokio::select! {
            cmd = rx.recv() => {
                match cmd {
                    Some(Command::Frame(bytes)) if !input_closed => {
                        write
                            .send(Message::Binary(bytes))
                            .await
                            .map_err(|_| AdapterError::StreamClosed)?;
                    }
                    Some(Command::CloseInput) if !input_closed => {
                        let stop = serde_json::json!({"type": "stop_recording"});
                        write
                            .send(Message::Text(stop.to_string()))
                            .await
                            .map_err(|_| AdapterError::StreamClosed)?;
                        input_closed = true;
                    }
                    // Late frames / duplicate closes after stop_recording.
                    Some(Command::Frame(_)) | Some(Command::CloseInput) => {}
                    Some(Command::Abort) | None => {
                        let _ = write.send(Message::Close(None)).await;
                        return Ok(());
                    }
                }
            }
            msg = read.next() => {
                match msg {
                    Some(Ok(Message::Text(text))) => {
                        if let Some(event) = parse_transcript_message(&text) {
                            let is_final = matches!(event, SttEvent::Final { .. });
                            sink.send_stt(turn, event);
                            if is_final && input_closed {
                                // Finals after stop_recording end the session.
                                let _ = write.send(Message::Close(None)).await;
                                return Ok(());
                            }
                        }
                    }
                    Some(Ok(Message::Close(_))) | None => {
                        if input_closed {
                            return Ok(());
                        }
                        return Err(AdapterError::StreamClosed.into());
                    }
                    Some(Ok(_)) => {}
                    Some(Err(e)) => {
                        warn!("STT socket error: {}", e);
                        return Err(AdapterError::StreamClosed.into());
                    }
                }
            }
        }
    }
}

/// POST the provider's init endpoint; returns the live socket URL.
async fn init_provider_session(
    client: &reqwest::Client,
    options: &AdapterOptions,
) -> Result<String> {
    let init_url = opt_str(options, "initUrl").ok_or(AdapterError::MissingOption("initUrl"))?;

    let mut body = serde_json::json!({
        "encoding": "wav/pcm",
        "bitDepth": 16,
        "sampleRate": SAMPLE_RATE,
        "channels": 1,
    });
    if let Some(model) = opt_str(options, "model") {
        body["model"] = serde_json::json!(model);
    }
    if let Some(language) = opt_str(options, "language") {
        body["language"] = serde_json::json!(language);
    }

    let mut req = client.post(init_url).json(&body);
    if let Some(key) = opt_str(options, "apiKey") {
        req = req.header("x-api-key", key);
    }

    let response = req
        .send()
        .await
        .map_err(|e| AdapterError::Connect(e.to_string()))?;

    let status = response.status();
    if !status.is_success() {
        let message = response.text().await.unwrap_or_default();
        return Err(AdapterError::Http { status: status.as_u16(), message }.into());
    }

    let data: serde_json::Value = response
        .json()
        .await
        .map_err(|e| AdapterError::Protocol(e.to_string()))?;

    data.get("url")
        .and_then(|v| v.as_str())
        .map(String::from)
        .ok_or_else(|| AdapterError::Protocol("init response missing socket url".into()).into())
}

/// Parse one provider message into a transcript event. Lifecycle and
/// speech-marker messages are ignored (the orchestrator runs its own VAD).
fn parse_transcript_message(text: &str) -> Option<SttEvent> {
    let data: serde_json::Value = serde_json::from_str(text).ok()?;
    match data.get("type").and_then(|v| v.as_str())? {
        "transcript" => {
            let payload = data.get("data")?;
            let is_final = payload
                .get("is_final")
                .and_then(|v| v.as_bool())
                .unwrap_or(false);
            let utterance = payload.get("utterance")?;
            let text = utterance.get("text").and_then(|v| v.as_str())?.to_string();
            let language = utterance
                .get("language")
                .and_then(|v| v.as_str())
                .map(String::from);
            if is_final {
                Some(SttEvent::Final { text, language })
            } else {
                Some(SttEvent::Interim { text })
            }
        }
        "error" => {
            let message = data
                .get("error")
                .and_then(|v| v.as_str())
                .unwrap_or("unknown provider error");
            Some(SttEvent::Error(format!("protocol error: {}", message)))
        }
        _ => None,
    }
}
