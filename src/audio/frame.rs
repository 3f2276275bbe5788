//! The canonical audio frame.

/// Sample rate used throughout the pipeline (Hz).
pub const SAMPLE_RATE: u32 = 16_000;

/// Canonical frame duration in milliseconds.
pub const FRAME_MS: u32 = 20;

/// Samples per canonical frame: 16000 * 20 / 1000.
pub const FRAME_SAMPLES: usize = 320;

/// A 20 ms block of 16 kHz mono signed 16-bit PCM.
///
/// `timestamp` is the offset of the first sample, in samples at the
/// canonical rate, since the owning stream started. Timestamps are strictly
/// monotonic within a stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AudioFrame {
    pub samples: Vec<i16>,
    pub timestamp: u64,
}

impl AudioFrame {
    /// Create a frame from exactly [`FRAME_SAMPLES`] samples.
    pub fn new(samples: Vec<i16>, timestamp: u64) -> Self {
        debug_assert_eq!(samples.len(), FRAME_SAMPLES);
        Self { samples, timestamp }
    }

    /// A silent frame at the given timestamp.
    pub fn silence(timestamp: u64) -> Self {
        Self {
            samples: vec![0; FRAME_SAMPLES],
            timestamp,
        }
    }

    /// Frame contents as little-endian bytes (wire format for the
    /// WebSocket media binding).
    pub fn to_le_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.samples.len() * 2);
        for s in &self.samples {
            out.extend_from_slice(&s.to_le_bytes());
        }
        out
    }

    /// Decode little-endian bytes into i16 samples. A trailing odd byte is
    /// dropped.
    pub fn samples_from_le_bytes(bytes: &[u8]) -> Vec<i16> {
        bytes
            .chunks_exact(2)
            .map(|c| i16::from_le_bytes([c[0], c[1]]))
            .collect()
    }
}
