//! Voice activity detection over canonical frames.
//!
//! A frame classifier (WebRTC VAD) feeds a hangover state machine that turns
//! per-frame speech probabilities into start/continue/end transitions. The
//! detector runs in-process on a dedicated thread: the underlying VAD handle
//! is not `Send`, so the worker owns it and talks to the session scheduler
//! only through the event queue.

use std::time::Duration;

use chrono::{DateTime, Local};
use tracing::{debug, info, warn};
use webrtc_vad::{SampleRate, Vad, VadMode};

use crate::audio::{AudioFrame, FRAME_MS};
use crate::config::VadSettings;
use crate::session::events::{EventSink, SessionEvent};

// ---------------------------------------------------------------------------
// Events
// ---------------------------------------------------------------------------

/// Voice-activity transitions delivered to the scheduler.
#[derive(Debug, Clone)]
pub enum VadEvent {
    /// A run of speech frames followed silence.
    SpeechStart { timestamp: u64, at: DateTime<Local> },
    /// Heartbeat during sustained speech (~every 200 ms).
    SpeechContinue { timestamp: u64 },
    /// A run of silence frames followed speech.
    SpeechEnd { timestamp: u64, at: DateTime<Local> },
}

/// Outcome of classifying one frame.
#[derive(Debug, Clone)]
pub enum VadSignal {
    Event(VadEvent),
    Quiet,
    /// The error counter saturated; the session must die.
    Saturated,
}

// ---------------------------------------------------------------------------
// Classifier seam
// ---------------------------------------------------------------------------

/// Per-frame speech probability source.
///
/// The production classifier is WebRTC VAD (hard 0/1 scores); tests script
/// their own sequences.
pub trait SpeechClassifier {
    fn classify(&mut self, frame: &AudioFrame) -> Result<f32, String>;
}

/// WebRTC VAD wrapper. 20 ms canonical frames are a supported window size.
pub struct WebRtcClassifier {
    vad: Vad,
}

impl WebRtcClassifier {
    pub fn new(mode: u8) -> Self {
        let vad_mode = match mode {
            0 => VadMode::Quality,
            1 => VadMode::LowBitrate,
            2 => VadMode::Aggressive,
            _ => VadMode::VeryAggressive,
        };
        Self {
            vad: Vad::new_with_rate_and_mode(SampleRate::Rate16kHz, vad_mode),
        }
    }
}

impl SpeechClassifier for WebRtcClassifier {
    fn classify(&mut self, frame: &AudioFrame) -> Result<f32, String> {
        match self.vad.is_voice_segment(&frame.samples) {
            Ok(true) => Ok(1.0),
            Ok(false) => Ok(0.0),
            Err(_) => Err(format!("invalid frame length {}", frame.samples.len())),
        }
    }
}

// ---------------------------------------------------------------------------
// Hangover state machine
// ---------------------------------------------------------------------------

/// Turns per-frame probabilities into speech-start/continue/end events.
///
/// Classifier errors count the frame as non-speech; more than
/// `error_saturation` consecutive errors is fatal for the session.
pub struct VadDetector<C: SpeechClassifier> {
    classifier: C,
    settings: VadSettings,
    in_speech: bool,
    speech_run: u32,
    silence_run: u32,
    frames_since_heartbeat: u32,
    consecutive_errors: u32,
}

impl<C: SpeechClassifier> VadDetector<C> {
    pub fn new(classifier: C, settings: VadSettings) -> Self {
        Self {
            classifier,
            settings,
            in_speech: false,
            speech_run: 0,
            silence_run: 0,
            frames_since_heartbeat: 0,
            consecutive_errors: 0,
        }
    }

    pub fn is_in_speech(&self) -> bool {
        self.in_speech
    }

    pub fn process(&mut self, frame: &AudioFrame) -> VadSignal {
        let is_speech = match self.classifier.classify(frame) {
            Ok(p) => {
                self.consecutive_errors = 0;
                p > self.settings.threshold
            }
            Err(e) => {
                self.consecutive_errors += 1;
                if self.consecutive_errors > self.settings.error_saturation {
                    warn!("VAD error counter saturated: {}", e);
                    return VadSignal::Saturated;
                }
                debug!("VAD classify error (frame treated as silence): {}", e);
                false
            }
        };

        if is_speech {
            self.speech_run += 1;
            self.silence_run = 0;
        } else {
            self.speech_run = 0;
            self.silence_run += 1;
        }

        if !self.in_speech {
            if self.speech_run >= self.settings.start_frames {
                self.in_speech = true;
                self.frames_since_heartbeat = 0;
                return VadSignal::Event(VadEvent::SpeechStart {
                    timestamp: frame.timestamp,
                    at: Local::now(),
                });
            }
            return VadSignal::Quiet;
        }

        if self.silence_run >= self.settings.end_frames {
            self.in_speech = false;
            return VadSignal::Event(VadEvent::SpeechEnd {
                timestamp: frame.timestamp,
                at: Local::now(),
            });
        }

        self.frames_since_heartbeat += 1;
        let heartbeat_frames = (self.settings.heartbeat_ms / FRAME_MS as u64).max(1) as u32;
        if is_speech && self.frames_since_heartbeat >= heartbeat_frames {
            self.frames_since_heartbeat = 0;
            return VadSignal::Event(VadEvent::SpeechContinue {
                timestamp: frame.timestamp,
            });
        }

        VadSignal::Quiet
    }
}

// ---------------------------------------------------------------------------
// Worker thread
// ---------------------------------------------------------------------------

/// Handle to a running VAD worker. Dropping it ends the worker.
pub struct VadHandle {
    frame_tx: std::sync::mpsc::Sender<AudioFrame>,
}

impl VadHandle {
    /// Hand a canonical frame to the detector. Non-blocking; frames sent
    /// after the worker died are dropped.
    pub fn push(&self, frame: AudioFrame) {
        let _ = self.frame_tx.send(frame);
    }

    /// A handle with no detector behind it. Used for text-only sessions
    /// (and for tests that script their own voice-activity events).
    pub fn detached() -> Self {
        let (frame_tx, _) = std::sync::mpsc::channel();
        Self { frame_tx }
    }
}

/// Spawn the detector on a dedicated thread.
///
/// The WebRTC VAD handle holds a raw pointer and is not `Send`, so it is
/// created inside the thread; transitions flow back through the session
/// event sink. The thread exits when the handle is dropped.
pub fn spawn_worker(settings: VadSettings, sink: EventSink) -> VadHandle {
    let (frame_tx, frame_rx) = std::sync::mpsc::channel::<AudioFrame>();

    std::thread::Builder::new()
        .name("voxbot-vad".to_string())
        .spawn(move || {
            let mut detector =
                VadDetector::new(WebRtcClassifier::new(settings.mode), settings);
            info!("VAD worker started");

            loop {
                // Periodic timeout so the thread notices a dropped handle
                // even when no audio is flowing.
                match frame_rx.recv_timeout(Duration::from_millis(500)) {
                    Ok(frame) => match detector.process(&frame) {
                        VadSignal::Event(ev) => sink.send(SessionEvent::Vad(ev)),
                        VadSignal::Quiet => {}
                        VadSignal::Saturated => {
                            sink.send(SessionEvent::VadSaturated);
                            break;
                        }
                    },
                    Err(std::sync::mpsc::RecvTimeoutError::Timeout) => continue,
                    Err(std::sync::mpsc::RecvTimeoutError::Disconnected) => break,
                }
            }
            info!("VAD worker stopped");
        })
        .expect("failed to spawn VAD worker thread");

    VadHandle { frame_tx }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio::FRAME_SAMPLES;

    /// Scripted classifier for exercising the hangover machine.
    struct Script {
        probs: Vec<Result<f32, String>>,
        pos: usize,
    }

    impl Script {
        fn new(probs: Vec<Result<f32, String>>) -> Self {
            Self { probs, pos: 0 }
        }

        fn speech_then_silence(speech: usize, silence: usize) -> Self {
            let mut probs = vec![Ok(1.0); speech];
            probs.extend(vec![Ok(0.0); silence]);
            Self::new(probs)
        }
    }

    impl SpeechClassifier for Script {
        fn classify(&mut self, _frame: &AudioFrame) -> Result<f32, String> {
            let r = self.probs[self.pos.min(self.probs.len() - 1)].clone();
            self.pos += 1;
            r
        }
    }

    fn run_frames<C: SpeechClassifier>(det: &mut VadDetector<C>, n: usize) -> Vec<VadSignal> {
        (0..n)
            .map(|i| {
                det.process(&AudioFrame::new(
                    vec![0; FRAME_SAMPLES],
                    i as u64 * FRAME_SAMPLES as u64,
                ))
            })
            .collect()
    }

    fn starts(signals: &[VadSignal]) -> usize {
        signals
            .iter()
            .filter(|s| matches!(s, VadSignal::Event(VadEvent::SpeechStart { .. })))
            .count()
    }

    fn ends(signals: &[VadSignal]) -> usize {
        signals
            .iter()
            .filter(|s| matches!(s, VadSignal::Event(VadEvent::SpeechEnd { .. })))
            .count()
    }

    #[test]
    fn test_start_after_m_speech_frames() {
        let mut det = VadDetector::new(
            Script::speech_then_silence(10, 0),
            VadSettings::default(),
        );
        let signals = run_frames(&mut det, 4);
        assert_eq!(starts(&signals), 0, "no start before M frames");
        let signals = run_frames(&mut det, 1);
        assert_eq!(starts(&signals), 1, "start exactly at M frames");
        assert!(det.is_in_speech());
    }

    #[test]
    fn test_end_after_k_silence_frames() {
        let mut det = VadDetector::new(
            Script::speech_then_silence(5, 30),
            VadSettings::default(),
        );
        let signals = run_frames(&mut det, 5 + 24);
        assert_eq!(starts(&signals), 1);
        assert_eq!(ends(&signals), 0, "no end before K silence frames");
        let signals = run_frames(&mut det, 1);
        assert_eq!(ends(&signals), 1, "end exactly at K silence frames");
        assert!(!det.is_in_speech());
    }

    #[test]
    fn test_short_blip_does_not_trigger() {
        // 3 speech frames (< M=5) surrounded by silence.
        let mut probs = vec![Ok(0.0); 5];
        probs.extend(vec![Ok(1.0); 3]);
        probs.extend(vec![Ok(0.0); 30]);
        let mut det = VadDetector::new(Script::new(probs), VadSettings::default());
        let signals = run_frames(&mut det, 38);
        assert_eq!(starts(&signals), 0);
        assert_eq!(ends(&signals), 0);
    }

    #[test]
    fn test_brief_pause_does_not_end_speech() {
        // 10 speech, 10 silence (< K=25), 10 speech: still one utterance.
        let mut probs = vec![Ok(1.0); 10];
        probs.extend(vec![Ok(0.0); 10]);
        probs.extend(vec![Ok(1.0); 10]);
        let mut det = VadDetector::new(Script::new(probs), VadSettings::default());
        let signals = run_frames(&mut det, 30);
        assert_eq!(starts(&signals), 1);
        assert_eq!(ends(&signals), 0);
        assert!(det.is_in_speech());
    }

    #[test]
    fn test_heartbeat_during_sustained_speech() {
        let mut det = VadDetector::new(
            Script::speech_then_silence(100, 0),
            VadSettings::default(),
        );
        let signals = run_frames(&mut det, 60);
        let heartbeats = signals
            .iter()
            .filter(|s| matches!(s, VadSignal::Event(VadEvent::SpeechContinue { .. })))
            .count();
        // 55 in-speech frames after start, heartbeat every 10 frames (200 ms).
        assert!(heartbeats >= 4, "expected heartbeats, got {}", heartbeats);
    }

    #[test]
    fn test_classifier_error_counts_as_silence() {
        // Speech established, then errors: treated as silence, eventually ends.
        let mut probs: Vec<Result<f32, String>> = vec![Ok(1.0); 5];
        probs.extend((0..25).map(|_| Err("boom".to_string())));
        let mut det = VadDetector::new(Script::new(probs), VadSettings::default());
        let signals = run_frames(&mut det, 30);
        assert_eq!(starts(&signals), 1);
        assert_eq!(ends(&signals), 1);
    }

    #[test]
    fn test_error_saturation() {
        let probs: Vec<Result<f32, String>> =
            (0..60).map(|_| Err("dead".to_string())).collect();
        let mut det = VadDetector::new(Script::new(probs), VadSettings::default());
        let signals = run_frames(&mut det, 60);
        assert!(
            signals.iter().any(|s| matches!(s, VadSignal::Saturated)),
            "saturation after >50 consecutive errors"
        );
    }

    #[test]
    fn test_errors_interleaved_with_success_do_not_saturate() {
        let mut probs: Vec<Result<f32, String>> = Vec::new();
        for _ in 0..40 {
            probs.push(Err("flaky".to_string()));
            probs.push(Ok(0.0));
        }
        let mut det = VadDetector::new(Script::new(probs), VadSettings::default());
        let signals = run_frames(&mut det, 80);
        assert!(!signals.iter().any(|s| matches!(s, VadSignal::Saturated)));
    }

    #[test]
    fn test_webrtc_classifier_rejects_bad_frame() {
        let mut c = WebRtcClassifier::new(3);
        let bad = AudioFrame { samples: vec![0; 100], timestamp: 0 };
        assert!(c.classify(&bad).is_err());
    }

    #[test]
    fn test_webrtc_classifier_silence_is_not_speech() {
        let mut c = WebRtcClassifier::new(3);
        let silent = AudioFrame::new(vec![0; FRAME_SAMPLES], 0);
        let p = c.classify(&silent).unwrap();
        assert!(p < 0.5);
    }
}
