//! Fixed-length PCM16 frame passed from the drain thread into the gate and
//! onto the wire.

/// A contiguous block of mono PCM16 samples at a known sample rate.
///
/// Frames are transient: produced by the drain thread, classified by the
/// gate, serialized onto the socket, never persisted.
#[derive(Debug, Clone)]
pub struct PcmFrame {
    /// Mono signed 16-bit samples.
    pub samples: Vec<i16>,
    /// Sample rate in Hz (the configured wire rate, e.g. 16000).
    pub sample_rate: u32,
}

impl PcmFrame {
    pub fn new(samples: Vec<i16>, sample_rate: u32) -> Self {
        Self {
            samples,
            sample_rate,
        }
    }

    /// Duration of this frame in milliseconds.
    pub fn duration_ms(&self) -> u64 {
        (self.samples.len() as u64 * 1000) / self.sample_rate as u64
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    /// Raw little-endian bytes as the recognizer expects PCM on the wire.
    pub fn to_le_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.samples.len() * 2);
        for sample in &self.samples {
            out.extend_from_slice(&sample.to_le_bytes());
        }
        out
    }
}
