//! Narrow interfaces to the surrounding application.
//!
//! The orchestrator never talks to storage, billing, or the UI directly; it
//! depends on these three traits and nothing else. Production wires them to
//! the real services, tests inject fakes.
//!
//! All three are called from the engine's driver task and must not block for
//! long: quota checks gate session start (a local lookup), consumption
//! recording is fire-and-forget, text delivery should hand off quickly.

use crate::events::TextEvent;

/// What kind of consumption a quota question is about.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConsumptionKind {
    /// Streaming speech recognition, metered in milliseconds.
    Recognition,
}

/// Outcome of a quota check.
#[derive(Debug, Clone)]
pub struct QuotaDecision {
    pub allowed: bool,
    /// Human-readable reason when `allowed` is false.
    pub reason: Option<String>,
}

impl QuotaDecision {
    pub fn allow() -> Self {
        Self {
            allowed: true,
            reason: None,
        }
    }

    pub fn deny(reason: impl Into<String>) -> Self {
        Self {
            allowed: false,
            reason: Some(reason.into()),
        }
    }
}

/// Asks the membership layer whether a session may start.
pub trait QuotaChecker: Send + Sync {
    fn check_quota(
        &self,
        account_id: &str,
        kind: ConsumptionKind,
        estimated_ms: u64,
    ) -> QuotaDecision;
}

/// One finished session's billable usage.
#[derive(Debug, Clone)]
pub struct ConsumptionRecord {
    pub account_id: String,
    /// Wall-clock session duration in milliseconds.
    pub duration_ms: u64,
    /// Session start, unix epoch milliseconds.
    pub started_at_ms: i64,
    /// Session end, unix epoch milliseconds.
    pub ended_at_ms: i64,
    /// Recognizer provider name (e.g. "volcano").
    pub provider: String,
    pub language: String,
    pub session_id: String,
}

/// Receives usage records after each session closes.
///
/// Errors are logged by the orchestrator and never propagate — metering must
/// not take down the audio path.
pub trait ConsumptionRecorder: Send + Sync {
    fn record(&self, record: ConsumptionRecord) -> anyhow::Result<()>;
}

/// Receives every text update, definite or not.
///
/// Definite events are safe to persist; non-definite text may be revised by
/// the next event.
pub trait TextSink: Send + Sync {
    fn on_text(&self, event: &TextEvent);
}
