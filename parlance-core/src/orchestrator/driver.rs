//! The recognition driver loop.
//!
//! ## Responsibilities (per iteration)
//!
//! ```text
//! 1. Multiplex gate events, session events, and control messages
//! 2. SpeechStart  → open a session (idempotent while one is open/opening)
//! 3. Frame        → enqueue PCM on the open session
//! 4. SpeechEnd    → request session stop (end-of-audio sentinel)
//! 5. Session text → stamp sequence, remember last text, fan out
//! 6. Session close→ cancel watchdog, record consumption, clear active
//! 7. Watchdog     → emit timeout, force-stop the whole recording
//! ```
//!
//! The driver is the only task that owns the session handle; gate events
//! arrive from the capture drain thread over an unbounded channel, so the
//! audio path never blocks on the network. While a connect is in flight,
//! frames simply queue behind it — audio is never dropped while deciding
//! whether to open a billed session.

use std::sync::{
    atomic::{AtomicU64, Ordering},
    Arc,
};
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tokio::sync::{broadcast, mpsc};
use tracing::{debug, error, info, warn};

use crate::collaborators::{ConsumptionRecord, ConsumptionRecorder, TextSink};
use crate::events::{ErrorEvent, ErrorKind, TextEvent};
use crate::gate::GateEvent;
use crate::session::{results::UtteranceResult, CloseReason, SessionConfig, SessionEvent, StreamingSession};

/// Messages multiplexed into the driver.
#[derive(Debug)]
pub enum DriverMsg {
    /// A gate decision from the capture drain thread.
    Gate(GateEvent),
    /// The duration watchdog fired for the current session.
    WatchdogFired,
    /// `stop_recording()` ran; exit once any open session has drained.
    StopRequested,
}

/// Everything the driver needs, passed as one struct so the loop stays tidy.
pub struct DriverContext {
    pub session_config: SessionConfig,
    /// Watchdog limit for one session; `Duration::ZERO` disables it.
    pub max_connection_duration: Duration,
    /// Account the recording is billed to.
    pub account_id: String,
    pub rx: mpsc::UnboundedReceiver<DriverMsg>,
    /// Loopback sender — the watchdog timer posts back into the driver.
    pub tx: mpsc::UnboundedSender<DriverMsg>,
    pub text_tx: broadcast::Sender<TextEvent>,
    pub error_tx: broadcast::Sender<ErrorEvent>,
    /// Written only here, read by the orchestrator.
    pub last_text: Arc<Mutex<String>>,
    pub seq: Arc<AtomicU64>,
    pub consumption: Option<Arc<dyn ConsumptionRecorder>>,
    pub text_sink: Option<Arc<dyn TextSink>>,
    /// Invoked when the watchdog forces the whole recording to stop.
    pub force_stop: Arc<dyn Fn() + Send + Sync>,
}

struct ActiveSession {
    session: StreamingSession,
    events: mpsc::UnboundedReceiver<SessionEvent>,
    watchdog: Option<tokio::task::JoinHandle<()>>,
    /// Wall-clock open time, unix epoch ms (consumption metering).
    started_wall_ms: i64,
    started_at: Instant,
}

enum Step {
    Msg(DriverMsg),
    Session(SessionEvent),
    /// Session event channel closed without a `Closed` — supervisor died.
    SessionGone,
}

async fn next_session_event(active: &mut Option<ActiveSession>) -> Option<SessionEvent> {
    match active.as_mut() {
        Some(a) => a.events.recv().await,
        // No session: this select arm never resolves.
        None => std::future::pending().await,
    }
}

/// Run the driver until stop completes (or every sender is gone).
pub async fn run(mut ctx: DriverContext) {
    info!("recognition driver started");

    let mut active: Option<ActiveSession> = None;
    let mut stop_requested = false;

    loop {
        let step = tokio::select! {
            msg = ctx.rx.recv() => match msg {
                Some(m) => Step::Msg(m),
                // Orchestrator dropped every handle.
                None => break,
            },
            event = next_session_event(&mut active) => match event {
                Some(e) => Step::Session(e),
                None => Step::SessionGone,
            },
        };

        match step {
            Step::Msg(DriverMsg::Gate(GateEvent::SpeechStart)) => {
                if active.is_some() {
                    debug!("speech start while a session is open — no-op");
                    continue;
                }
                if stop_requested {
                    debug!("speech start after stop request — ignored");
                    continue;
                }
                open_session(&mut ctx, &mut active).await;
            }

            Step::Msg(DriverMsg::Gate(GateEvent::Frame(frame))) => {
                if let Some(a) = &active {
                    a.session.send_audio(frame.to_le_bytes());
                }
                // No session (connect failed, or between segments): the gate
                // re-buffers the next onset, nothing to do with this frame.
            }

            Step::Msg(DriverMsg::Gate(GateEvent::SpeechEnd)) => {
                if let Some(a) = &active {
                    info!("speech ended — draining session");
                    a.session.stop();
                }
            }

            Step::Msg(DriverMsg::WatchdogFired) => {
                // A stop already in flight supersedes the watchdog.
                if stop_requested {
                    continue;
                }
                if let Some(a) = &active {
                    let elapsed = a.started_at.elapsed().as_secs();
                    warn!(elapsed, "session exceeded the duration limit — forcing stop");
                    let _ = ctx.error_tx.send(ErrorEvent {
                        kind: ErrorKind::SessionTimeout,
                        message: format!("session exceeded {elapsed}s duration limit"),
                    });
                    a.session.stop();
                    (ctx.force_stop)();
                }
            }

            Step::Msg(DriverMsg::StopRequested) => {
                let Some(a) = &mut active else {
                    break;
                };
                // Cancel the watchdog immediately; only the session drain
                // remains outstanding.
                if let Some(watchdog) = a.watchdog.take() {
                    watchdog.abort();
                }
                stop_requested = true;
            }

            Step::Session(SessionEvent::Text(result)) => {
                handle_text(&mut ctx, result);
            }

            Step::Session(SessionEvent::ProtocolError { code, message }) => {
                let _ = ctx.error_tx.send(ErrorEvent {
                    kind: ErrorKind::Protocol,
                    message: format!("recognizer error {code}: {message}"),
                });
            }

            Step::Session(SessionEvent::Closed { reason }) => {
                finish_session(&mut ctx, &mut active, reason);
                if stop_requested {
                    break;
                }
            }

            Step::SessionGone => {
                finish_session(&mut ctx, &mut active, CloseReason::Disconnected);
                if stop_requested {
                    break;
                }
            }
        }
    }

    info!("recognition driver stopped");
}

async fn open_session(ctx: &mut DriverContext, active: &mut Option<ActiveSession>) {
    let started_wall_ms = chrono::Utc::now().timestamp_millis();
    let (events_tx, events_rx) = mpsc::unbounded_channel();

    info!("speech started — opening recognizer session");
    match StreamingSession::open(ctx.session_config.clone(), events_tx).await {
        Ok(session) => {
            let watchdog = if ctx.max_connection_duration > Duration::ZERO {
                let tx = ctx.tx.clone();
                let limit = ctx.max_connection_duration;
                Some(tokio::spawn(async move {
                    tokio::time::sleep(limit).await;
                    let _ = tx.send(DriverMsg::WatchdogFired);
                }))
            } else {
                None
            };

            *active = Some(ActiveSession {
                started_at: session.started_at(),
                session,
                events: events_rx,
                watchdog,
                started_wall_ms,
            });
        }
        Err(e) => {
            // Frames queued behind this connect will be discarded; the gate
            // re-arms and the next speech segment gets a fresh attempt.
            error!("failed to open recognizer session: {e}");
            let _ = ctx.error_tx.send(ErrorEvent {
                kind: ErrorKind::Transport,
                message: e.to_string(),
            });
        }
    }
}

fn handle_text(ctx: &mut DriverContext, result: UtteranceResult) {
    let seq = ctx.seq.fetch_add(1, Ordering::Relaxed);
    let event = TextEvent {
        seq,
        text: result.text,
        is_definite: result.is_definite,
        start_ms: result.start_ms,
        end_ms: result.end_ms,
    };

    *ctx.last_text.lock() = event.text.clone();

    if event.is_definite {
        info!(
            start_ms = ?event.start_ms,
            end_ms = ?event.end_ms,
            text = %event.text,
            "definite utterance"
        );
    } else {
        debug!(text = %event.text, "interim text");
    }

    let _ = ctx.text_tx.send(event.clone());
    if let Some(sink) = &ctx.text_sink {
        sink.on_text(&event);
    }
}

/// Tear down bookkeeping for a closed session: cancel the watchdog, report a
/// disconnect (exactly once, via the single `Closed` event), and meter
/// consumption. Metering errors are logged and swallowed — billing telemetry
/// must never take down the audio path.
fn finish_session(
    ctx: &mut DriverContext,
    active: &mut Option<ActiveSession>,
    reason: CloseReason,
) {
    let Some(closed) = active.take() else {
        return;
    };

    if let Some(watchdog) = closed.watchdog {
        watchdog.abort();
    }

    if reason == CloseReason::Disconnected {
        let _ = ctx.error_tx.send(ErrorEvent {
            kind: ErrorKind::Transport,
            message: "recognizer session disconnected".into(),
        });
    }

    if let Some(recorder) = &ctx.consumption {
        let record = ConsumptionRecord {
            account_id: ctx.account_id.clone(),
            duration_ms: closed.started_at.elapsed().as_millis() as u64,
            started_at_ms: closed.started_wall_ms,
            ended_at_ms: chrono::Utc::now().timestamp_millis(),
            provider: ctx.session_config.provider.clone(),
            language: ctx.session_config.language.clone(),
            session_id: closed.session.session_id().to_string(),
        };
        if let Err(e) = recorder.record(record) {
            warn!("consumption recording failed: {e}");
        }
    }

    debug!(?reason, "session finished; ready for the next speech segment");
}
