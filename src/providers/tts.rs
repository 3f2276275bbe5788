//! TTS capability: incremental text in, streamed PCM out.

use anyhow::Result;
use async_trait::async_trait;

use super::AdapterOptions;
use crate::session::events::EventSink;

/// Factory for streaming synthesis sessions.
#[async_trait]
pub trait TtsAdapter: Send + Sync {
    fn id(&self) -> &str;

    /// Establish a provider synthesis session. Audio chunk events are
    /// posted to `sink` tagged with `turn`, at whatever sample rate the
    /// provider produces; the outbound pipeline adapts.
    async fn open(
        &self,
        options: &AdapterOptions,
        turn: u64,
        sink: EventSink,
    ) -> Result<Box<dyn TtsStream>>;
}

/// Input half of an open TTS session. Non-blocking handoffs, like
/// [`super::SttStream`].
pub trait TtsStream: Send {
    /// Queue one sentence-sized chunk of text for synthesis.
    fn push_text(&self, text: &str);

    /// Signal that no further text is coming. The provider synthesizes the
    /// remainder and then emits its end event.
    fn flush_and_close(&self);

    /// Drop the provider session immediately and discard queued synthesis.
    fn abort(&self);
}
