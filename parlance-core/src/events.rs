//! Event types broadcast to engine subscribers.
//!
//! All types derive `serde::Serialize` + `serde::Deserialize` so front ends
//! can forward them over whatever IPC they use (Tauri events, JSON lines on
//! stdout, a local WebSocket) without re-modelling them.

use serde::{Deserialize, Serialize};

// ---------------------------------------------------------------------------
// Recording state
// ---------------------------------------------------------------------------

/// Lifecycle state of the recorder, owned by `AudioCapture` and observed by
/// the orchestrator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RecordingState {
    /// No capture in progress; device changes are allowed.
    Idle,
    /// Actively capturing and (when speech is present) streaming.
    Recording,
    /// Capture stream open but frames are discarded at the consumer stage.
    Paused,
    /// Teardown in progress — transient, always ends in `Idle`.
    Stopping,
}

/// Emitted whenever the recorder changes state.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StateEvent {
    pub state: RecordingState,
    /// Optional human-readable detail (e.g. why a stop was forced).
    pub detail: Option<String>,
}

// ---------------------------------------------------------------------------
// Text events
// ---------------------------------------------------------------------------

/// A recognized-text update from the streaming session.
///
/// The recognizer re-sends the full running text of the current segment on
/// every update; `is_definite` marks results the vendor will not revise.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TextEvent {
    /// Monotonically increasing event sequence number.
    pub seq: u64,
    /// Recognized text (running text for the current segment).
    pub text: String,
    /// `true` only when the vendor marked an utterance definite. Never
    /// inferred from punctuation.
    pub is_definite: bool,
    /// Utterance start in ms, present only on definite results.
    pub start_ms: Option<u64>,
    /// Utterance end in ms, present only on definite results.
    pub end_ms: Option<u64>,
}

// ---------------------------------------------------------------------------
// Error events
// ---------------------------------------------------------------------------

/// Coarse classification so callers can pick the right user prompt
/// ("retry" for transport, "upgrade" for quota, ...).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ErrorKind {
    /// Microphone missing/busy/no permission.
    Device,
    /// Handshake or mid-stream socket failure.
    Transport,
    /// The recognizer returned a fatal application error code.
    Protocol,
    /// The quota collaborator declined the session.
    Quota,
    /// The duration watchdog force-stopped the recording.
    SessionTimeout,
}

/// Emitted on any failure the caller should surface to the user.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ErrorEvent {
    pub kind: ErrorKind,
    pub message: String,
}
