//! # parlance-core
//!
//! Streaming dictation engine SDK.
//!
//! ## Architecture
//!
//! ```text
//! Microphone → AudioCapture → SPSC RingBuffer → drain thread
//!                                                   │ resample + PCM16 framing
//!                                               SpeechGate (VAD)
//!                                                   │ SpeechStart/Frame/SpeechEnd
//!                                             driver task (tokio)
//!                                                   │
//!                                           StreamingSession
//!                                          sender ⇄ recognizer ⇄ receiver
//!                                                   │
//!                                  broadcast::Sender<TextEvent> + TextSink
//! ```
//!
//! The audio callback is zero-alloc. The drain thread never touches the
//! network; the sender/receiver tasks never touch the hardware. One session
//! is open per recording at a time, gated by voice activity so silence does
//! not hold a billed connection open.

#![forbid(unsafe_code)]
#![warn(clippy::all)]

pub mod audio;
pub mod buffering;
pub mod collaborators;
pub mod error;
pub mod events;
pub mod gate;
pub mod orchestrator;
pub mod protocol;
pub mod session;

// Convenience re-exports for downstream crates
pub use collaborators::{
    ConsumptionKind, ConsumptionRecord, ConsumptionRecorder, QuotaChecker, QuotaDecision, TextSink,
};
pub use error::ParlanceError;
pub use events::{ErrorEvent, ErrorKind, RecordingState, StateEvent, TextEvent};
pub use gate::{GateConfig, GateMode, SpeechGate};
pub use orchestrator::{Collaborators, OrchestratorConfig, RecognitionOrchestrator};
pub use session::{SessionConfig, StreamingSession};
