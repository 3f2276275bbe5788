//! STT capability: canonical frames in, transcript events out.

use anyhow::Result;
use async_trait::async_trait;

use super::AdapterOptions;
use crate::audio::AudioFrame;
use crate::session::events::EventSink;

/// Factory for streaming STT sessions.
#[async_trait]
pub trait SttAdapter: Send + Sync {
    /// Stable adapter id (`"provider.stt"`).
    fn id(&self) -> &str;

    /// Establish a provider streaming session.
    ///
    /// Transcript events are posted to `sink` tagged with `turn`; the
    /// returned stream only carries the input half.
    async fn open(
        &self,
        options: &AdapterOptions,
        turn: u64,
        sink: EventSink,
    ) -> Result<Box<dyn SttStream>>;
}

/// Input half of an open STT session.
///
/// All methods are non-blocking handoffs: implementations queue work to an
/// internal writer task. Events (interim/final/error) arrive on the session
/// queue, never through this handle.
pub trait SttStream: Send {
    /// Hand one canonical frame to the provider.
    fn push(&self, frame: &AudioFrame);

    /// Signal end-of-audio. The provider produces any remaining finals and
    /// then closes.
    fn close_input(&self);

    /// Drop the provider session immediately, releasing its resources.
    /// No further events for this stream should be acted on.
    fn abort(&self);
}
