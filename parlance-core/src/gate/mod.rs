//! Voice-activity gate between capture and the network session.
//!
//! The gate decides when a live audio stream contains speech worth opening a
//! billed recognizer session for. It is a pure synchronous state machine —
//! `push()` returns the events the caller should act on and never blocks the
//! capture producer.
//!
//! ```text
//!            speech × start_frames                    silence × end_frames
//!   Quiet ─────────────────────────────► Active ─────────────────────────► Quiet
//!     │  buffer frames in bounded ring      │  forward every frame live
//!     │  (drop oldest when full)            │  (padding rides along)
//!     └─ SpeechStart + pre-padding replay ──┘  SpeechEnd
//! ```
//!
//! Segments shorter than the minimum speech duration never leave `Quiet`, so
//! no session is opened for them.

pub mod energy;
pub mod vad;

use std::collections::VecDeque;

pub use energy::{EnergyVad, GateMode};
pub use vad::{VadDecision, VoiceActivityDetector};

use crate::buffering::frame::PcmFrame;

/// Gate configuration. Durations are in milliseconds of audio.
#[derive(Debug, Clone)]
pub struct GateConfig {
    /// When false the gate is a pass-through: SpeechStart before the first
    /// frame, every frame forwarded, SpeechEnd once on flush.
    pub enabled: bool,
    /// Detector sensitivity preset.
    pub mode: GateMode,
    /// Nominal duration of each incoming frame.
    pub frame_duration_ms: u32,
    /// Consecutive speech frames required to confirm a segment start.
    pub speech_start_threshold: u32,
    /// Consecutive silence frames required to confirm a segment end.
    pub speech_end_threshold: u32,
    /// Segments shorter than this never open a session.
    pub min_speech_duration_ms: u32,
    /// Already-buffered audio replayed at segment start so the recognizer
    /// does not miss the onset.
    pub pre_padding_ms: u32,
    /// Trailing audio forwarded after the last speech frame before the
    /// segment ends.
    pub post_padding_ms: u32,
    /// Ring buffer cap while waiting for a segment start.
    pub max_buffer_seconds: u32,
}

impl Default for GateConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            mode: GateMode::Balanced,
            frame_duration_ms: 30,
            speech_start_threshold: 3,
            speech_end_threshold: 20,
            min_speech_duration_ms: 250,
            pre_padding_ms: 300,
            post_padding_ms: 200,
            max_buffer_seconds: 10,
        }
    }
}

/// What the caller should do with one pushed frame.
#[derive(Debug, Clone)]
pub enum GateEvent {
    /// A speech segment was confirmed — open the session.
    SpeechStart,
    /// Forward this frame to the open session.
    Frame(PcmFrame),
    /// The segment ended — close the session.
    SpeechEnd,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum GateState {
    /// Buffering, waiting for a confirmed segment start.
    Quiet,
    /// A segment is open; frames forward live.
    Active,
}

/// The voice-activity gate.
pub struct SpeechGate {
    config: GateConfig,
    detector: Box<dyn VoiceActivityDetector>,
    state: GateState,
    /// Pre-roll ring, bounded, oldest dropped first.
    ring: VecDeque<PcmFrame>,
    ring_capacity: usize,
    consecutive_speech: u32,
    consecutive_silence: u32,
    /// Frames required to confirm a start (threshold ∨ min duration).
    start_frames: u32,
    /// Frames required to confirm an end (threshold ∨ post padding).
    end_frames: u32,
    /// Frames of pre-padding replayed at segment start.
    pre_padding_frames: usize,
    /// Pass-through mode: whether SpeechStart has been emitted.
    passthrough_started: bool,
}

fn frames_for_ms(duration_ms: u32, frame_ms: u32) -> u32 {
    duration_ms.div_ceil(frame_ms.max(1))
}

impl SpeechGate {
    /// Build a gate with the default energy detector for `config.mode`.
    pub fn new(config: GateConfig) -> Self {
        let detector = Box::new(EnergyVad::from_mode(config.mode));
        Self::with_detector(config, detector)
    }

    /// Build a gate with an injected detector (tests, alternative VADs).
    pub fn with_detector(config: GateConfig, detector: Box<dyn VoiceActivityDetector>) -> Self {
        let frame_ms = config.frame_duration_ms.max(1);
        let start_frames = config
            .speech_start_threshold
            .max(frames_for_ms(config.min_speech_duration_ms, frame_ms))
            .max(1);
        let end_frames = config
            .speech_end_threshold
            .max(frames_for_ms(config.post_padding_ms, frame_ms))
            .max(1);
        let pre_padding_frames = frames_for_ms(config.pre_padding_ms, frame_ms) as usize;
        let ring_capacity =
            ((config.max_buffer_seconds.max(1) as u64 * 1000) / frame_ms as u64).max(1) as usize;

        Self {
            config,
            detector,
            state: GateState::Quiet,
            ring: VecDeque::with_capacity(ring_capacity.min(4096)),
            ring_capacity,
            consecutive_speech: 0,
            consecutive_silence: 0,
            start_frames,
            end_frames,
            pre_padding_frames,
            passthrough_started: false,
        }
    }

    /// Feed one frame; returns the events to act on, in order.
    pub fn push(&mut self, frame: PcmFrame) -> Vec<GateEvent> {
        if !self.config.enabled {
            let mut events = Vec::with_capacity(2);
            if !self.passthrough_started {
                self.passthrough_started = true;
                events.push(GateEvent::SpeechStart);
            }
            events.push(GateEvent::Frame(frame));
            return events;
        }

        match self.state {
            GateState::Quiet => self.push_quiet(frame),
            GateState::Active => self.push_active(frame),
        }
    }

    fn push_quiet(&mut self, frame: PcmFrame) -> Vec<GateEvent> {
        let decision = self.detector.classify(&frame);

        if self.ring.len() == self.ring_capacity {
            self.ring.pop_front();
        }
        self.ring.push_back(frame);

        if !decision.is_speech() {
            self.consecutive_speech = 0;
            return Vec::new();
        }

        self.consecutive_speech += 1;
        if self.consecutive_speech < self.start_frames {
            return Vec::new();
        }

        // Segment confirmed: replay the onset frames plus pre-padding.
        let replay = (self.consecutive_speech as usize + self.pre_padding_frames)
            .min(self.ring.len());
        let skip = self.ring.len() - replay;

        let mut events = Vec::with_capacity(replay + 1);
        events.push(GateEvent::SpeechStart);
        for frame in self.ring.drain(..).skip(skip) {
            events.push(GateEvent::Frame(frame));
        }

        self.state = GateState::Active;
        self.consecutive_speech = 0;
        self.consecutive_silence = 0;
        events
    }

    fn push_active(&mut self, frame: PcmFrame) -> Vec<GateEvent> {
        let decision = self.detector.classify(&frame);
        let mut events = vec![GateEvent::Frame(frame)];

        if decision.is_speech() {
            self.consecutive_silence = 0;
            return events;
        }

        self.consecutive_silence += 1;
        if self.consecutive_silence >= self.end_frames {
            events.push(GateEvent::SpeechEnd);
            self.end_segment();
        }
        events
    }

    /// End any active segment (drives SpeechEnd at capture stop).
    pub fn flush(&mut self) -> Vec<GateEvent> {
        if !self.config.enabled {
            if self.passthrough_started {
                self.passthrough_started = false;
                return vec![GateEvent::SpeechEnd];
            }
            return Vec::new();
        }

        if self.state == GateState::Active {
            self.end_segment();
            return vec![GateEvent::SpeechEnd];
        }
        self.reset();
        Vec::new()
    }

    /// Drop all buffered audio and counters.
    pub fn reset(&mut self) {
        self.ring.clear();
        self.consecutive_speech = 0;
        self.consecutive_silence = 0;
        self.state = GateState::Quiet;
        self.passthrough_started = false;
        self.detector.reset();
    }

    fn end_segment(&mut self) {
        self.state = GateState::Quiet;
        self.consecutive_speech = 0;
        self.consecutive_silence = 0;
        self.ring.clear();
        self.detector.reset();
    }

    /// Number of frames currently buffered while waiting for a start.
    pub fn buffered_frames(&self) -> usize {
        self.ring.len()
    }
}
