//! Energy-based VAD using an RMS threshold + hangover counter.
//!
//! ## Algorithm
//!
//! 1. Compute RMS of the incoming PCM16 frame (normalized to [0, 1]).
//! 2. If RMS ≥ `threshold` → `Speech`, reset hangover counter.
//! 3. If RMS < `threshold` and hangover counter > 0 → `Speech`,
//!    decrement counter (prevents clipping syllable endings).
//! 4. Otherwise → `Silence`.

use super::vad::{VadDecision, VoiceActivityDetector};
use crate::buffering::frame::PcmFrame;

/// Detector sensitivity presets. Higher aggressiveness raises the energy
/// threshold: fewer frames classify as speech.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum GateMode {
    /// Most permissive — catches quiet speech, more false positives.
    Quality,
    #[default]
    Balanced,
    Aggressive,
    /// Most restrictive — only confident speech passes.
    VeryAggressive,
}

impl GateMode {
    /// RMS threshold for this mode (empirical, quiet-room microphone).
    pub fn rms_threshold(self) -> f32 {
        match self {
            GateMode::Quality => 0.008,
            GateMode::Balanced => 0.015,
            GateMode::Aggressive => 0.025,
            GateMode::VeryAggressive => 0.040,
        }
    }
}

/// A simple energy-based voice activity detector.
#[derive(Debug, Clone)]
pub struct EnergyVad {
    /// Normalized RMS level above which a frame is considered speech.
    threshold: f32,
    /// How many consecutive below-threshold frames still report `Speech`
    /// after real speech ends.
    hangover_frames: u32,
    /// Current hangover countdown.
    hangover_counter: u32,
}

impl EnergyVad {
    pub fn new(threshold: f32, hangover_frames: u32) -> Self {
        Self {
            threshold,
            hangover_frames,
            hangover_counter: 0,
        }
    }

    /// Construct from an aggressiveness preset. No hangover: the gate's own
    /// end-threshold counter provides the trailing grace period.
    pub fn from_mode(mode: GateMode) -> Self {
        Self::new(mode.rms_threshold(), 0)
    }

    /// Root-mean-square of a PCM16 slice, normalized to [0, 1].
    fn rms(samples: &[i16]) -> f32 {
        if samples.is_empty() {
            return 0.0;
        }
        let sum_sq: f64 = samples
            .iter()
            .map(|s| {
                let norm = *s as f64 / 32768.0;
                norm * norm
            })
            .sum();
        (sum_sq / samples.len() as f64).sqrt() as f32
    }
}

impl Default for EnergyVad {
    fn default() -> Self {
        Self::from_mode(GateMode::Balanced)
    }
}

impl VoiceActivityDetector for EnergyVad {
    fn classify(&mut self, frame: &PcmFrame) -> VadDecision {
        let rms = Self::rms(&frame.samples);

        if rms >= self.threshold {
            self.hangover_counter = self.hangover_frames;
            VadDecision::Speech
        } else if self.hangover_counter > 0 {
            self.hangover_counter -= 1;
            VadDecision::Speech
        } else {
            VadDecision::Silence
        }
    }

    fn reset(&mut self) {
        self.hangover_counter = 0;
    }
}
