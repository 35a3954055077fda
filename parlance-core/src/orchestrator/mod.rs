//! `RecognitionOrchestrator` — top-level lifecycle controller.
//!
//! ## Lifecycle
//!
//! ```text
//! RecognitionOrchestrator::new()
//!     └─► start_recording(app_id)  → quota check, driver spawned,
//!         │                          capture open, state = Recording
//!         ├─► pause/resume          → frames discarded / flowing
//!         └─► stop_recording()      → capture stopped, gate flushed,
//!                                     returns last text, state = Idle
//! ```
//!
//! `stop_recording()` returns immediately with the last known text; the
//! driver task lingers to drain the recognizer's closing responses and meter
//! consumption. A caller that needs the network fully torn down (process
//! exit) uses `shutdown()`.
//!
//! ## Threading
//!
//! Methods are synchronous but must be called within a Tokio runtime: the
//! driver and the watchdog run as tasks, capture runs on its own thread.

pub mod driver;

use std::sync::{
    atomic::{AtomicBool, AtomicU64, Ordering},
    Arc,
};
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::{broadcast, mpsc};
use tracing::{info, warn};

use crate::{
    audio::{device::DeviceInfo, AudioCapture, AudioConfig},
    collaborators::{ConsumptionKind, ConsumptionRecorder, QuotaChecker, TextSink},
    error::{ParlanceError, Result},
    events::{ErrorEvent, ErrorKind, RecordingState, StateEvent, TextEvent},
    gate::{GateConfig, SpeechGate},
    session::SessionConfig,
};

use driver::{DriverContext, DriverMsg};

/// Broadcast channel capacity: events buffered for slow subscribers.
const BROADCAST_CAP: usize = 256;

/// Top-level configuration, aggregating every component's.
#[derive(Debug, Clone)]
pub struct OrchestratorConfig {
    pub audio: AudioConfig,
    pub gate: GateConfig,
    pub session: SessionConfig,
    /// Hard per-session duration limit bounding vendor billing exposure
    /// from a forgotten open microphone. 0 disables the watchdog.
    pub max_connection_duration_secs: u64,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            audio: AudioConfig::default(),
            gate: GateConfig::default(),
            session: SessionConfig::default(),
            max_connection_duration_secs: 600,
        }
    }
}

/// External collaborators, all optional. Explicitly injected rather than
/// reached through globals so tests can fake each one.
#[derive(Default)]
pub struct Collaborators {
    pub quota: Option<Arc<dyn QuotaChecker>>,
    pub consumption: Option<Arc<dyn ConsumptionRecorder>>,
    pub text_sink: Option<Arc<dyn TextSink>>,
}

struct Inner {
    config: OrchestratorConfig,
    capture: Mutex<AudioCapture>,
    gate: Arc<Mutex<SpeechGate>>,
    driver_tx: Mutex<Option<mpsc::UnboundedSender<DriverMsg>>>,
    driver_handle: Mutex<Option<tokio::task::JoinHandle<()>>>,
    text_tx: broadcast::Sender<TextEvent>,
    state_tx: broadcast::Sender<StateEvent>,
    error_tx: broadcast::Sender<ErrorEvent>,
    last_text: Arc<Mutex<String>>,
    seq: Arc<AtomicU64>,
    collaborators: Collaborators,
    /// Re-entrance guard for the stop path (user stop vs watchdog stop).
    stopping: AtomicBool,
}

/// The orchestrator handle. `Send + Sync`; wrap in `Arc` to share between
/// command handlers and event-forwarding tasks.
pub struct RecognitionOrchestrator {
    inner: Arc<Inner>,
}

impl RecognitionOrchestrator {
    pub fn new(config: OrchestratorConfig, collaborators: Collaborators) -> Self {
        let (text_tx, _) = broadcast::channel(BROADCAST_CAP);
        let (state_tx, _) = broadcast::channel(BROADCAST_CAP);
        let (error_tx, _) = broadcast::channel(BROADCAST_CAP);

        let gate = Arc::new(Mutex::new(SpeechGate::new(config.gate.clone())));
        let capture = Mutex::new(AudioCapture::new(config.audio.clone()));

        Self {
            inner: Arc::new(Inner {
                config,
                capture,
                gate,
                driver_tx: Mutex::new(None),
                driver_handle: Mutex::new(None),
                text_tx,
                state_tx,
                error_tx,
                last_text: Arc::new(Mutex::new(String::new())),
                seq: Arc::new(AtomicU64::new(0)),
                collaborators,
                stopping: AtomicBool::new(false),
            }),
        }
    }

    /// Start a recording billed to `app_id`.
    ///
    /// # Errors
    /// - `AlreadyRunning` unless idle.
    /// - `QuotaExceeded` when the quota collaborator declines — a distinct
    ///   signal from transport errors so the caller can prompt an upgrade
    ///   rather than a retry.
    /// - Device errors (typed) when the microphone cannot be opened.
    pub fn start_recording(&self, app_id: &str) -> Result<()> {
        let inner = &self.inner;

        if inner.capture.lock().state() != RecordingState::Idle {
            return Err(ParlanceError::AlreadyRunning);
        }

        if let Some(quota) = &inner.collaborators.quota {
            let estimated_ms = inner.config.max_connection_duration_secs * 1000;
            let decision = quota.check_quota(app_id, ConsumptionKind::Recognition, estimated_ms);
            if !decision.allowed {
                let reason = decision
                    .reason
                    .unwrap_or_else(|| "recognition quota exhausted".into());
                warn!(app_id, reason = %reason, "quota check declined the session");
                let _ = inner.error_tx.send(ErrorEvent {
                    kind: ErrorKind::Quota,
                    message: reason.clone(),
                });
                return Err(ParlanceError::QuotaExceeded { reason });
            }
        }

        let (pipe_tx, pipe_rx) = mpsc::unbounded_channel();

        inner.gate.lock().reset();
        inner.last_text.lock().clear();

        // Watchdog force-stop: never runs on the driver's executor thread —
        // the stop path joins the capture thread, which may block briefly.
        let force_stop = {
            let weak = Arc::downgrade(inner);
            Arc::new(move || {
                if let Some(inner) = weak.upgrade() {
                    tokio::task::spawn_blocking(move || {
                        Inner::stop_common(&inner, Some("session duration limit reached"));
                    });
                }
            })
        };

        // The wire description must match the PCM actually produced.
        let mut session_config = inner.config.session.clone();
        session_config.request.sample_rate = inner.config.audio.wire_sample_rate;

        let frame_ms =
            (inner.config.audio.frame_size as u64 * 1000) / inner.config.audio.wire_sample_rate as u64;
        if inner.config.gate.enabled && frame_ms != inner.config.gate.frame_duration_ms as u64 {
            warn!(
                capture_frame_ms = frame_ms,
                gate_frame_ms = inner.config.gate.frame_duration_ms,
                "capture frame size and gate frame duration disagree; padding math will be off"
            );
        }

        let ctx = DriverContext {
            session_config,
            max_connection_duration: Duration::from_secs(
                inner.config.max_connection_duration_secs,
            ),
            account_id: app_id.to_string(),
            rx: pipe_rx,
            tx: pipe_tx.clone(),
            text_tx: inner.text_tx.clone(),
            error_tx: inner.error_tx.clone(),
            last_text: Arc::clone(&inner.last_text),
            seq: Arc::clone(&inner.seq),
            consumption: inner.collaborators.consumption.clone(),
            text_sink: inner.collaborators.text_sink.clone(),
            force_stop,
        };

        *inner.driver_handle.lock() = Some(tokio::spawn(driver::run(ctx)));
        *inner.driver_tx.lock() = Some(pipe_tx.clone());

        // Frame path: drain thread → gate → driver. Never blocks; the gate
        // is sync and the channel unbounded.
        let gate = Arc::clone(&inner.gate);
        let start_result = inner.capture.lock().start(move |frame| {
            let events = gate.lock().push(frame);
            for event in events {
                let _ = pipe_tx.send(DriverMsg::Gate(event));
            }
        });

        if let Err(e) = start_result {
            let _ = inner.error_tx.send(ErrorEvent {
                kind: ErrorKind::Device,
                message: e.to_string(),
            });
            // Unwind the driver we just spawned.
            if let Some(tx) = inner.driver_tx.lock().take() {
                let _ = tx.send(DriverMsg::StopRequested);
            }
            return Err(e);
        }

        inner.set_state(RecordingState::Recording, None);
        info!(app_id, "recording started");
        Ok(())
    }

    /// Pause: capture stays open, frames are discarded.
    pub fn pause_recording(&self) -> Result<()> {
        self.inner.capture.lock().pause()?;
        self.inner.set_state(RecordingState::Paused, None);
        Ok(())
    }

    /// Resume after a pause.
    pub fn resume_recording(&self) -> Result<()> {
        self.inner.capture.lock().resume()?;
        self.inner.set_state(RecordingState::Recording, None);
        Ok(())
    }

    /// Stop the recording and return the last known text immediately.
    ///
    /// Capture stops first (no more frames), the gate flush drives
    /// `SpeechEnd` into the driver (closing any open session), and the
    /// network drains in the background. Always ends in `Idle`.
    pub fn stop_recording(&self) -> String {
        Inner::stop_common(&self.inner, None)
    }

    /// Current recording state (owned by capture, observed here).
    pub fn state(&self) -> RecordingState {
        self.inner.capture.lock().state()
    }

    /// Last text received from the recognizer in this recording.
    pub fn last_text(&self) -> String {
        self.inner.last_text.lock().clone()
    }

    /// Change the input device. Only allowed while idle.
    pub fn set_input_device(&self, device: Option<String>) -> Result<()> {
        self.inner.capture.lock().set_device(device)
    }

    /// Enumerate input devices for a front-end picker.
    pub fn list_input_devices(&self) -> Vec<DeviceInfo> {
        crate::audio::device::list_input_devices()
    }

    /// Subscribe to recognized-text events.
    pub fn subscribe_text(&self) -> broadcast::Receiver<TextEvent> {
        self.inner.text_tx.subscribe()
    }

    /// Subscribe to recording state changes.
    pub fn subscribe_state(&self) -> broadcast::Receiver<StateEvent> {
        self.inner.state_tx.subscribe()
    }

    /// Subscribe to error/timeout events.
    pub fn subscribe_errors(&self) -> broadcast::Receiver<ErrorEvent> {
        self.inner.error_tx.subscribe()
    }

    /// Process-exit path: stop, then wait for the driver (and with it the
    /// session teardown) with a bounded timeout, force-closing regardless.
    pub async fn shutdown(&self, timeout: Duration) {
        Inner::stop_common(&self.inner, Some("shutting down"));

        let handle = self.inner.driver_handle.lock().take();
        if let Some(mut handle) = handle {
            if tokio::time::timeout(timeout, &mut handle).await.is_err() {
                warn!(?timeout, "driver did not drain in time; aborting");
                handle.abort();
            }
        }
    }
}

impl Inner {
    fn set_state(&self, state: RecordingState, detail: Option<String>) {
        let _ = self.state_tx.send(StateEvent { state, detail });
    }

    /// The single stop path, shared by `stop_recording()`, the watchdog
    /// force-stop, and `shutdown()`. Cleanup is unconditional: whatever
    /// fails, the machine ends in `Idle`.
    fn stop_common(inner: &Arc<Inner>, detail: Option<&str>) -> String {
        if inner.stopping.swap(true, Ordering::SeqCst) {
            return inner.last_text.lock().clone();
        }

        inner.set_state(RecordingState::Stopping, detail.map(String::from));

        // 1. No more frames: stop capture (joins the drain thread).
        match inner.capture.lock().stop() {
            Ok(_session_buffer) => {}
            Err(ParlanceError::NotRunning) => {}
            Err(e) => warn!("capture stop failed: {e}"),
        }

        // 2. Gate flush drives SpeechEnd → the driver closes any open
        //    session via the end-of-audio sentinel. Not waited on.
        let flush_events = inner.gate.lock().flush();
        if let Some(tx) = inner.driver_tx.lock().take() {
            for event in flush_events {
                let _ = tx.send(DriverMsg::Gate(event));
            }
            let _ = tx.send(DriverMsg::StopRequested);
        }

        // 3. Always end idle.
        inner.set_state(RecordingState::Idle, detail.map(String::from));
        inner.stopping.store(false, Ordering::SeqCst);

        let text = inner.last_text.lock().clone();
        info!(chars = text.len(), "recording stopped");
        text
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collaborators::QuotaDecision;

    struct DenyAll;

    impl QuotaChecker for DenyAll {
        fn check_quota(
            &self,
            _account_id: &str,
            _kind: ConsumptionKind,
            _estimated_ms: u64,
        ) -> QuotaDecision {
            QuotaDecision::deny("monthly minutes exhausted")
        }
    }

    struct AllowAll;

    impl QuotaChecker for AllowAll {
        fn check_quota(
            &self,
            _account_id: &str,
            _kind: ConsumptionKind,
            _estimated_ms: u64,
        ) -> QuotaDecision {
            QuotaDecision::allow()
        }
    }

    #[tokio::test]
    async fn quota_denial_blocks_start_with_distinct_signal() {
        let orchestrator = RecognitionOrchestrator::new(
            OrchestratorConfig::default(),
            Collaborators {
                quota: Some(Arc::new(DenyAll)),
                ..Collaborators::default()
            },
        );
        let mut errors = orchestrator.subscribe_errors();

        let result = orchestrator.start_recording("acct-1");
        assert!(matches!(result, Err(ParlanceError::QuotaExceeded { .. })));
        assert_eq!(orchestrator.state(), RecordingState::Idle);

        let event = errors.try_recv().expect("quota error event expected");
        assert_eq!(event.kind, ErrorKind::Quota);
        assert!(event.message.contains("exhausted"));
    }

    #[tokio::test]
    async fn stop_while_idle_is_harmless_and_returns_last_text() {
        let orchestrator =
            RecognitionOrchestrator::new(OrchestratorConfig::default(), Collaborators::default());

        assert_eq!(orchestrator.stop_recording(), "");
        assert_eq!(orchestrator.state(), RecordingState::Idle);
    }

    #[tokio::test]
    async fn pause_requires_an_active_recording() {
        let orchestrator =
            RecognitionOrchestrator::new(OrchestratorConfig::default(), Collaborators::default());

        assert!(matches!(
            orchestrator.pause_recording(),
            Err(ParlanceError::NotRunning)
        ));
    }

    #[tokio::test]
    async fn allow_quota_does_not_emit_error_event() {
        let orchestrator = RecognitionOrchestrator::new(
            OrchestratorConfig::default(),
            Collaborators {
                quota: Some(Arc::new(AllowAll)),
                ..Collaborators::default()
            },
        );
        let mut errors = orchestrator.subscribe_errors();

        // Start proceeds past quota; it may still fail on missing audio
        // hardware, which must surface as a device error, never quota.
        match orchestrator.start_recording("acct-1") {
            Ok(()) => {
                orchestrator.stop_recording();
            }
            Err(e) => assert!(!matches!(e, ParlanceError::QuotaExceeded { .. }), "{e}"),
        }

        if let Ok(event) = errors.try_recv() {
            assert_ne!(event.kind, ErrorKind::Quota);
        }
    }
}
