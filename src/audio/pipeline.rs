//! Resampling and rechunking of raw PCM into canonical frames.
//!
//! The transport delivers whatever the peer's codec produces; provider TTS
//! engines emit whatever rate their model runs at. Both paths go through a
//! [`FramePipeline`] that linear-interpolation-resamples to 16 kHz and cuts
//! exact 20 ms frames, carrying remainders across calls so every input
//! sample is accounted for.

use super::frame::{AudioFrame, FRAME_SAMPLES, SAMPLE_RATE};

/// Stateful source-rate → canonical-rate converter and rechunker.
///
/// One instance per directed stream (inbound transport audio, or one TTS
/// stream's output). Output frame timestamps are strictly monotonic.
pub struct FramePipeline {
    source_rate: u32,
    /// Unconsumed source samples (interpolation needs one-sample lookahead).
    buf: Vec<i16>,
    /// Fractional read position into `buf`, in source samples.
    pos: f64,
    /// Canonical-rate samples waiting to fill the next frame.
    pending: Vec<i16>,
    next_timestamp: u64,
}

impl FramePipeline {
    pub fn new(source_rate: u32) -> Self {
        Self::with_start_timestamp(source_rate, 0)
    }

    /// Start timestamps at an arbitrary offset, so a session can keep one
    /// monotonic outbound clock across several TTS streams.
    pub fn with_start_timestamp(source_rate: u32, start: u64) -> Self {
        Self {
            source_rate: source_rate.max(1),
            buf: Vec::new(),
            pos: 0.0,
            pending: Vec::with_capacity(FRAME_SAMPLES),
            next_timestamp: start,
        }
    }

    pub fn source_rate(&self) -> u32 {
        self.source_rate
    }

    /// Timestamp the next emitted frame will carry.
    pub fn next_timestamp(&self) -> u64 {
        self.next_timestamp
    }

    /// Feed raw source-rate samples; returns zero or more complete canonical
    /// frames. Partial-frame remainders are held until the next call.
    pub fn ingest(&mut self, raw: &[i16]) -> Vec<AudioFrame> {
        if raw.is_empty() {
            return Vec::new();
        }

        if self.source_rate == SAMPLE_RATE {
            self.pending.extend_from_slice(raw);
        } else {
            self.resample_into_pending(raw);
        }
        self.cut_frames()
    }

    /// Insert `ms` of silence (used on transport discontinuities). The gap
    /// is generated at the source rate so the timeline stays consistent.
    pub fn insert_silence(&mut self, ms: u64) -> Vec<AudioFrame> {
        let n = (self.source_rate as u64 * ms / 1000) as usize;
        let silence = vec![0i16; n];
        self.ingest(&silence)
    }

    /// Number of canonical samples currently buffered (the rechunk delay).
    pub fn pending_samples(&self) -> usize {
        self.pending.len()
    }

    fn resample_into_pending(&mut self, raw: &[i16]) {
        self.buf.extend_from_slice(raw);
        let step = self.source_rate as f64 / SAMPLE_RATE as f64;

        // Linear interpolation; acceptable quality for narrowband voice.
        while self.pos + 1.0 < self.buf.len() as f64 {
            let i = self.pos as usize;
            let frac = self.pos - i as f64;
            let a = self.buf[i] as f64;
            let b = self.buf[i + 1] as f64;
            self.pending.push((a + (b - a) * frac).round() as i16);
            self.pos += step;
        }

        // Drop consumed source samples, keeping the lookahead sample.
        let consumed = (self.pos as usize).min(self.buf.len().saturating_sub(1));
        if consumed > 0 {
            self.buf.drain(..consumed);
            self.pos -= consumed as f64;
        }
    }

    fn cut_frames(&mut self) -> Vec<AudioFrame> {
        let mut frames = Vec::new();
        while self.pending.len() >= FRAME_SAMPLES {
            let rest = self.pending.split_off(FRAME_SAMPLES);
            let samples = std::mem::replace(&mut self.pending, rest);
            frames.push(AudioFrame::new(samples, self.next_timestamp));
            self.next_timestamp += FRAME_SAMPLES as u64;
        }
        frames
    }
}

/// Stateless chunkwise resample for the outbound path (canonical → transport
/// rate). The ratio is applied per chunk without buffering across chunks, so
/// no speedup/slowdown artifacts can accumulate.
pub fn resample_chunk(samples: &[i16], from_rate: u32, to_rate: u32) -> Vec<i16> {
    if from_rate == to_rate || samples.is_empty() {
        return samples.to_vec();
    }
    let out_len = (samples.len() as u64 * to_rate as u64 / from_rate as u64) as usize;
    let mut out = Vec::with_capacity(out_len);
    let step = from_rate as f64 / to_rate as f64;
    for n in 0..out_len {
        let pos = n as f64 * step;
        let i = pos as usize;
        let frac = pos - i as f64;
        let a = samples[i.min(samples.len() - 1)] as f64;
        let b = samples[(i + 1).min(samples.len() - 1)] as f64;
        out.push((a + (b - a) * frac).round() as i16);
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_identity_rate_rechunks_exactly() {
        let mut p = FramePipeline::new(SAMPLE_RATE);
        let input: Vec<i16> = (0..800).map(|i| i as i16).collect();
        let frames = p.ingest(&input);
        // 800 samples = 2 full frames + 160 pending.
        assert_eq!(frames.len(), 2);
        assert_eq!(p.pending_samples(), 160);
        assert_eq!(frames[0].samples[..5], [0, 1, 2, 3, 4]);
        assert_eq!(frames[1].samples[0], 320);
    }

    #[test]
    fn test_identity_round_trip_is_lossless() {
        // Ingest at the canonical rate and reassemble: identity modulo the
        // rechunk delay (the held remainder).
        let mut p = FramePipeline::new(SAMPLE_RATE);
        let input: Vec<i16> = (0..1000).map(|i| (i % 313) as i16).collect();
        let mut out = Vec::new();
        for chunk in input.chunks(133) {
            for f in p.ingest(chunk) {
                out.extend_from_slice(&f.samples);
            }
        }
        let emitted = out.len();
        assert_eq!(input[..emitted], out[..]);
        assert_eq!(emitted + p.pending_samples(), input.len());
    }

    #[test]
    fn test_timestamps_strictly_monotonic() {
        let mut p = FramePipeline::new(48_000);
        let mut last: Option<u64> = None;
        for _ in 0..10 {
            let chunk = vec![100i16; 960]; // 20 ms at 48 kHz
            for f in p.ingest(&chunk) {
                if let Some(prev) = last {
                    assert!(f.timestamp > prev);
                }
                last = Some(f.timestamp);
            }
        }
        assert!(last.is_some());
    }

    #[test]
    fn test_downsample_48k_sample_accounting() {
        let mut p = FramePipeline::new(48_000);
        // 1 second of 48 kHz input should yield ~1 second of 16 kHz output.
        let input = vec![42i16; 48_000];
        let mut total = 0usize;
        for chunk in input.chunks(1000) {
            total += p.ingest(chunk).iter().map(|f| f.samples.len()).sum::<usize>();
        }
        total += p.pending_samples();
        let expected = 16_000usize;
        assert!(
            (total as i64 - expected as i64).unsigned_abs() < FRAME_SAMPLES as u64,
            "got {} canonical samples, expected ~{}",
            total,
            expected
        );
    }

    #[test]
    fn test_upsample_8k_doubles() {
        let mut p = FramePipeline::new(8_000);
        let input = vec![5i16; 8_000];
        let mut total = 0usize;
        total += p.ingest(&input).iter().map(|f| f.samples.len()).sum::<usize>();
        total += p.pending_samples();
        assert!((total as i64 - 16_000).unsigned_abs() < FRAME_SAMPLES as u64);
    }

    #[test]
    fn test_insert_silence_produces_quiet_frames() {
        let mut p = FramePipeline::new(SAMPLE_RATE);
        let frames = p.insert_silence(100);
        assert_eq!(frames.len(), 5); // 100 ms = 5 frames
        assert!(frames.iter().all(|f| f.samples.iter().all(|&s| s == 0)));
    }

    #[test]
    fn test_start_timestamp_offset() {
        let mut p = FramePipeline::with_start_timestamp(SAMPLE_RATE, 9_600);
        let frames = p.ingest(&vec![1i16; FRAME_SAMPLES]);
        assert_eq!(frames[0].timestamp, 9_600);
    }

    #[test]
    fn test_resample_chunk_identity() {
        let samples: Vec<i16> = (0..320).map(|i| i as i16).collect();
        assert_eq!(resample_chunk(&samples, 16_000, 16_000), samples);
    }

    #[test]
    fn test_resample_chunk_ratio() {
        let samples = vec![1000i16; 480]; // 20 ms at 24 kHz
        let out = resample_chunk(&samples, 24_000, 16_000);
        assert_eq!(out.len(), 320);
        // Constant signal survives interpolation.
        assert!(out.iter().all(|&s| (s - 1000).abs() <= 1));
    }
}
