//! Sample-rate conversion between the device rate and the wire rate.
//!
//! cpal captures at the device's native rate (commonly 48 kHz). The
//! recognizer wants 16 kHz mono PCM16. `WireResampler` bridges that gap on
//! the drain thread, where allocation is allowed, and quantizes straight to
//! the i16 samples that go on the wire.
//!
//! When capture rate == wire rate no rubato session is created at all; the
//! input is only quantized.

use rubato::{FastFixedIn, PolynomialDegree, Resampler};
use tracing::error;

use crate::error::{ParlanceError, Result};

/// Input frame count per rubato call. 20 ms at 48 kHz.
const RESAMPLE_CHUNK: usize = 960;

/// Converts f32 mono audio at the capture rate into PCM16 at the wire rate.
pub struct WireResampler {
    /// `None` when capture rate == wire rate (quantize-only mode).
    resampler: Option<FastFixedIn<f32>>,
    /// Holds partial input chunks between calls.
    pending: Vec<f32>,
    /// Pre-allocated rubato output buffer: `[1][output_frames_max]`.
    scratch: Vec<Vec<f32>>,
}

fn quantize(samples: &[f32], out: &mut Vec<i16>) {
    out.extend(
        samples
            .iter()
            .map(|s| (s.clamp(-1.0, 1.0) * 32767.0) as i16),
    );
}

impl WireResampler {
    /// # Errors
    /// Returns `ParlanceError::AudioDevice` if rubato fails to initialise.
    pub fn new(capture_rate: u32, wire_rate: u32) -> Result<Self> {
        if capture_rate == wire_rate {
            return Ok(Self {
                resampler: None,
                pending: Vec::new(),
                scratch: Vec::new(),
            });
        }

        let ratio = wire_rate as f64 / capture_rate as f64;
        let resampler = FastFixedIn::<f32>::new(
            ratio,
            1.0, // fixed ratio
            PolynomialDegree::Cubic,
            RESAMPLE_CHUNK,
            1, // mono
        )
        .map_err(|e| ParlanceError::AudioDevice(format!("resampler init: {e}")))?;

        let max_out = resampler.output_frames_max();
        let scratch = vec![vec![0f32; max_out]; 1];

        tracing::info!(capture_rate, wire_rate, "resampling enabled");

        Ok(Self {
            resampler: Some(resampler),
            pending: Vec::new(),
            scratch,
        })
    }

    /// Feed captured samples, returning wire-rate PCM16 (possibly empty while
    /// rubato accumulates a full input chunk).
    pub fn process(&mut self, samples: &[f32]) -> Vec<i16> {
        let mut out = Vec::new();

        let Some(ref mut resampler) = self.resampler else {
            quantize(samples, &mut out);
            return out;
        };

        self.pending.extend_from_slice(samples);

        while self.pending.len() >= RESAMPLE_CHUNK {
            let input = &self.pending[..RESAMPLE_CHUNK];
            match resampler.process_into_buffer(&[input], &mut self.scratch, None) {
                Ok((_consumed, produced)) => {
                    quantize(&self.scratch[0][..produced], &mut out);
                }
                Err(e) => {
                    error!("resampler process error: {e}");
                }
            }
            self.pending.drain(..RESAMPLE_CHUNK);
        }

        out
    }

    /// `true` when no rate conversion happens (capture rate == wire rate).
    pub fn is_passthrough(&self) -> bool {
        self.resampler.is_none()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn passthrough_quantizes_without_delay() {
        let mut rs = WireResampler::new(16_000, 16_000).unwrap();
        assert!(rs.is_passthrough());

        let out = rs.process(&[0.0, 0.5, -0.5, 1.0, -1.0]);
        assert_eq!(out, vec![0, 16383, -16383, 32767, -32767]);
    }

    #[test]
    fn clamps_out_of_range_input() {
        let mut rs = WireResampler::new(16_000, 16_000).unwrap();
        let out = rs.process(&[2.0, -3.0]);
        assert_eq!(out, vec![32767, -32767]);
    }

    #[test]
    fn ratio_48k_to_16k_has_expected_length() {
        let mut rs = WireResampler::new(48_000, 16_000).unwrap();
        assert!(!rs.is_passthrough());

        let out = rs.process(&vec![0.0f32; 960]);
        assert!(!out.is_empty());
        // 960 samples at 48 kHz → ~320 at 16 kHz.
        assert!(
            (out.len() as isize - 320).unsigned_abs() <= 10,
            "output len={}",
            out.len()
        );
    }

    #[test]
    fn partial_chunks_accumulate_across_calls() {
        let mut rs = WireResampler::new(48_000, 16_000).unwrap();

        assert!(rs.process(&vec![0.0f32; 500]).is_empty());
        assert!(
            !rs.process(&vec![0.0f32; 500]).is_empty(),
            "second push should complete the chunk"
        );
    }
}
