//! Audio frame pipeline: canonical frames, resampling, rechunking, and the
//! pre-speech ring buffer.
//!
//! Everything between components is expressed in one currency: 20 ms
//! blocks of 16 kHz mono signed 16-bit PCM.

pub mod frame;
pub mod pipeline;
pub mod ring;

pub use frame::{AudioFrame, FRAME_MS, FRAME_SAMPLES, SAMPLE_RATE};
pub use pipeline::FramePipeline;
pub use ring::PreSpeechBuffer;

/// Apply a linear fade-out envelope over the whole buffer.
///
/// Used when cutting off agent audio on barge-in so the transport-side
/// jitter buffer drains to silence instead of clicking.
pub fn apply_fade_out(samples: &mut [i16]) {
    let len = samples.len();
    if len == 0 {
        return;
    }
    for (i, s) in samples.iter_mut().enumerate() {
        let gain = (len - 1 - i) as f32 / len as f32;
        *s = (*s as f32 * gain) as i16;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fade_out_ends_near_silence() {
        let mut samples = vec![10_000i16; 320];
        apply_fade_out(&mut samples);
        assert!(samples[0] > 9_000, "start barely attenuated: {}", samples[0]);
        assert_eq!(*samples.last().unwrap(), 0);
        // Monotonically non-increasing magnitude.
        for w in samples.windows(2) {
            assert!(w[1] <= w[0]);
        }
    }

    #[test]
    fn test_fade_out_empty_ok() {
        let mut samples: Vec<i16> = Vec::new();
        apply_fade_out(&mut samples);
    }
}
