//! Event types for the per-session scheduler queue and the observer bus.
//!
//! All concurrent work (VAD thread, provider I/O tasks, the transport pump)
//! communicates with the scheduler exclusively by posting [`SessionEvent`]s
//! through an [`EventSink`]. The scheduler publishes [`SessionNotice`]s on a
//! broadcast bus for observers (SSE clients, the CLI).

use serde::Serialize;
use tokio::sync::mpsc;

use crate::errors::FaultKind;
use crate::vad::VadEvent;

// ---------------------------------------------------------------------------
// Inbound events
// ---------------------------------------------------------------------------

/// Raw PCM as delivered by the transport, before normalization.
#[derive(Debug, Clone)]
pub struct RawAudio {
    pub samples: Vec<i16>,
    pub sample_rate: u32,
}

/// Transcript events from an STT stream.
#[derive(Debug, Clone)]
pub enum SttEvent {
    Interim { text: String },
    Final { text: String, language: Option<String> },
    Error(String),
}

/// Streamed output from an LLM task.
#[derive(Debug, Clone)]
pub enum LlmEvent {
    Delta(String),
    ToolCall {
        id: String,
        name: String,
        arguments: serde_json::Value,
    },
    End { reason: String },
    Error(String),
}

/// Streamed output from a TTS stream.
#[derive(Debug, Clone)]
pub enum TtsEvent {
    Audio {
        pcm: Vec<i16>,
        sample_rate: u32,
        is_final: bool,
    },
    End,
    Error(String),
}

/// Everything the scheduler can receive on its single inbound queue.
///
/// STT/LLM/TTS events carry the turn generation they were issued for so the
/// scheduler can drop output from cancelled turns.
#[derive(Debug, Clone)]
pub enum SessionEvent {
    /// Decoded audio from the transport.
    Frame(RawAudio),
    /// The transport signalled an audio gap of roughly `lost_ms`.
    TransportDiscontinuity { lost_ms: u64 },
    /// The peer hung up.
    TransportClosed,
    /// Voice-activity transition from the detector.
    Vad(VadEvent),
    /// The VAD error counter saturated; the session is dead.
    VadSaturated,
    Stt { turn: u64, event: SttEvent },
    Llm { turn: u64, event: LlmEvent },
    Tts { turn: u64, event: TtsEvent },
    /// Text-mode input: run the pipeline from the final-transcript point.
    UserText(String),
    /// External teardown request (DELETE, CLI, manager shutdown).
    Cancel,
}

/// Cloneable sender half of a session's inbound queue.
///
/// Adapters receive a sink at construction and never touch the scheduler
/// directly; a dropped receiver makes sends no-ops.
#[derive(Clone)]
pub struct EventSink {
    tx: mpsc::UnboundedSender<SessionEvent>,
}

impl EventSink {
    pub fn new(tx: mpsc::UnboundedSender<SessionEvent>) -> Self {
        Self { tx }
    }

    pub fn send(&self, event: SessionEvent) {
        let _ = self.tx.send(event);
    }

    pub fn send_stt(&self, turn: u64, event: SttEvent) {
        self.send(SessionEvent::Stt { turn, event });
    }

    pub fn send_llm(&self, turn: u64, event: LlmEvent) {
        self.send(SessionEvent::Llm { turn, event });
    }

    pub fn send_tts(&self, turn: u64, event: TtsEvent) {
        self.send(SessionEvent::Tts { turn, event });
    }
}

// ---------------------------------------------------------------------------
// Observer notices
// ---------------------------------------------------------------------------

/// A completed (or interrupted) turn as published to observers.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TurnSummary {
    pub user_text: String,
    pub assistant_text: String,
    pub interrupted: bool,
    pub retrieval_failed: bool,
}

/// Structured events published on the session's observer bus.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SessionNotice {
    StateChanged { from: String, to: String },
    SpeechStarted,
    SpeechEnded,
    InterimTranscript { text: String },
    FinalTranscript { text: String },
    AssistantDelta { text: String },
    BargeIn,
    TurnCompleted { turn: TurnSummary },
    Fault { kind: FaultKind, detail: String },
    Closed,
}

// ---------------------------------------------------------------------------

/// Build a fresh session queue: (sink for producers, receiver for the
/// scheduler).
pub fn session_queue() -> (EventSink, mpsc::UnboundedReceiver<SessionEvent>) {
    let (tx, rx) = mpsc::unbounded_channel();
    (EventSink::new(tx), rx)
}

/// Outbound frame channel capacity: ~2 s of canonical frames. Sends use
/// `try_send`; if nothing drains the transport the oldest audio is dropped
/// rather than blocking the scheduler.
pub const OUTBOUND_FRAME_CAPACITY: usize = 100;

/// Observer bus capacity.
pub const NOTICE_CAPACITY: usize = 256;
