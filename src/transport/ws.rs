//! WebSocket media binding.
//!
//! Binary frames carry 16 kHz int16 little-endian PCM (≤ 100 ms per
//! message) in both directions. Text frames carry JSON control messages
//! (currently only discontinuity marks). Socket close maps to
//! `transport.closed` and tears the session down.

use axum::extract::ws::{Message, WebSocket};
use futures_util::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use super::parse_control;
use super::TransportControl;
use crate::audio::{AudioFrame, SAMPLE_RATE};
use crate::session::events::{EventSink, RawAudio, SessionEvent};

/// Pump one attached media socket until either side closes.
pub async fn run_media_socket(
    socket: WebSocket,
    sink: EventSink,
    mut outbound: mpsc::Receiver<AudioFrame>,
) {
    let (mut write, mut read) = socket.split();
    info!("media transport attached");

    loop {
        tokio::select! {
            frame = outbound.recv() => {
                match frame {
                    Some(frame) => {
                        if write
                            .send(Message::Binary(frame.to_le_bytes().into()))
                            .await
                            .is_err()
                        {
                            debug!("media socket write failed");
                            break;
                        }
                    }
                    // Scheduler gone; close the socket politely.
                    None => {
                        let _ = write.send(Message::Close(None)).await;
                        return;
                    }
                }
            }
            msg = read.next() => {
                match msg {
                    Some(Ok(Message::Binary(bytes))) => {
                        let samples = AudioFrame::samples_from_le_bytes(&bytes);
                        if !samples.is_empty() {
                            sink.send(SessionEvent::Frame(RawAudio {
                                samples,
                                sample_rate: SAMPLE_RATE,
                            }));
                        }
                    }
                    Some(Ok(Message::Text(text))) => {
                        if let Some(TransportControl::Discontinuity { lost_ms }) =
                            parse_control(&text)
                        {
                            sink.send(SessionEvent::TransportDiscontinuity { lost_ms });
                        }
                    }
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Ok(_)) => {}
                    Some(Err(e)) => {
                        warn!("media socket error: {}", e);
                        break;
                    }
                }
            }
        }
    }

    sink.send(SessionEvent::TransportClosed);
    info!("media transport detached");
}
