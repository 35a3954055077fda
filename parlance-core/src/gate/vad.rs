//! Voice-activity classification seam.
//!
//! The `VoiceActivityDetector` trait is the gate's extensibility point: swap
//! in `EnergyVad` (default) or any future neural detector without touching
//! the gating state machine.

use crate::buffering::frame::PcmFrame;

/// Whether a given audio frame contains speech or silence.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VadDecision {
    Speech,
    Silence,
}

impl VadDecision {
    pub fn is_speech(self) -> bool {
        self == VadDecision::Speech
    }
}

/// Trait for all VAD implementations.
///
/// Implementors may be stateful (hangover counters, hidden states). They are
/// driven from the capture drain thread and must never block.
pub trait VoiceActivityDetector: Send + 'static {
    /// Classify one frame as speech or silence.
    fn classify(&mut self, frame: &PcmFrame) -> VadDecision;

    /// Reset any internal state (between speech segments).
    fn reset(&mut self);
}
