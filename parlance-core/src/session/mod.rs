//! One WebSocket connection's lifecycle against the recognizer.
//!
//! ```text
//! Disconnected ──connect()──► Connecting ──handshake──► Open
//!                                                        │ full request, then:
//!                                   ┌────────────────────┴────────────────────┐
//!                                   │ sender task                receiver task │
//!                                   │  outbound queue ─► frames   frames ─► text│
//!                                   └────────────────────┬────────────────────┘
//!                                              supervisor joins both,
//!                                              closes the socket once,
//!                                              emits Closed exactly once
//! ```
//!
//! The sender looks one chunk ahead: it holds the most recently dequeued
//! chunk and only transmits it once it knows whether another follows, because
//! the truly last chunk must carry the terminal (negative-sequence) framing.
//! `stop()` enqueues the end-of-audio sentinel and returns — the server's
//! closing responses drain through the receiver, which is what finally tears
//! the connection down.
//!
//! Mid-stream failure is not retried here: an abrupt close ends the session
//! and is reported as disconnected. Whether to open a session for the next
//! speech segment is the orchestrator's decision.

pub mod results;

use std::sync::{
    atomic::{AtomicBool, AtomicUsize, Ordering},
    Arc,
};
use std::time::Duration;

use futures_util::{
    stream::{SplitSink, SplitStream},
    SinkExt, StreamExt,
};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, watch};
use tokio_tungstenite::{
    connect_async,
    tungstenite::{self, client::IntoClientRequest, http::HeaderValue, Message},
    MaybeTlsStream, WebSocketStream,
};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::error::{ParlanceError, Result};
use crate::protocol::{
    self, decode_response, encode_audio_frame, encode_full_request, RequestOptions,
};

use results::UtteranceResult;

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;
type WsSink = SplitSink<WsStream, Message>;
type WsSource = SplitStream<WsStream>;

/// The full client request occupies sequence 1; audio frames start here.
const AUDIO_START_SEQ: i32 = 2;

/// Outbound queue depth beyond which we log — the queue is unbounded by
/// design (dropping audio is worse than memory growth), so depth is the
/// only early warning that the socket has stalled.
const QUEUE_DEPTH_WARN: usize = 512;

/// Recognizer connection configuration.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// WebSocket endpoint, e.g. `wss://host/api/v3/recognize`.
    pub endpoint: String,
    /// Vendor resource id sent at handshake.
    pub resource_id: String,
    pub access_key: String,
    pub app_key: String,
    /// Recognition language tag, also recorded with consumption.
    pub language: String,
    /// Provider name recorded with consumption.
    pub provider: String,
    /// Options carried in the full client request.
    pub request: RequestOptions,
    /// Per-attempt handshake timeout.
    pub connect_timeout: Duration,
    /// Handshake attempts before giving up.
    pub connect_attempts: u32,
    /// Fixed delay between handshake attempts.
    pub connect_backoff: Duration,
    /// Error code treated as a benign idle-drop rather than a failure.
    /// Vendor-specific and version-dependent — configuration, not a constant.
    pub benign_close_code: i32,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            endpoint: "wss://openspeech.bytedance.com/api/v3/sauc/bigmodel".into(),
            resource_id: "volc.bigasr.sauc.duration".into(),
            access_key: String::new(),
            app_key: String::new(),
            language: "zh-CN".into(),
            provider: "volcano".into(),
            request: RequestOptions::default(),
            connect_timeout: Duration::from_secs(30),
            connect_attempts: 3,
            connect_backoff: Duration::from_secs(2),
            benign_close_code: protocol::DEFAULT_BENIGN_CLOSE_CODE,
        }
    }
}

/// Why a session ended. Reported exactly once per session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseReason {
    /// The server marked its final package (clean drain).
    Finished,
    /// Transport-level failure or abrupt close.
    Disconnected,
    /// The server reported a fatal application error.
    ProtocolError,
}

/// Events a session pushes to its owner, in arrival order.
#[derive(Debug, Clone)]
pub enum SessionEvent {
    Text(UtteranceResult),
    ProtocolError { code: i32, message: String },
    /// Emitted exactly once, after the socket is closed.
    Closed { reason: CloseReason },
}

enum Outbound {
    Audio(Vec<u8>),
    /// End-of-audio sentinel.
    Finish,
}

/// Handle to an open streaming session.
#[derive(Debug)]
pub struct StreamingSession {
    outbound: mpsc::UnboundedSender<Outbound>,
    stopping: Arc<AtomicBool>,
    supervisor: tokio::task::JoinHandle<()>,
    queue_depth: Arc<AtomicUsize>,
    session_id: String,
    started_at: std::time::Instant,
}

impl StreamingSession {
    /// Connect, send the full client request, and launch the sender/receiver
    /// pair. Events (text, errors, the final `Closed`) arrive on `events`.
    ///
    /// # Errors
    /// `ConnectExhausted` after all handshake attempts fail, `Transport` if
    /// the opening request cannot be sent.
    pub async fn open(
        config: SessionConfig,
        events: mpsc::UnboundedSender<SessionEvent>,
    ) -> Result<Self> {
        let mut ws = connect_with_retries(&config).await?;

        ws.send(Message::Binary(encode_full_request(1, &config.request)))
            .await
            .map_err(|e| ParlanceError::Transport(format!("send full request: {e}")))?;

        let session_id = Uuid::new_v4().to_string();
        info!(session_id = %session_id, "session open");

        let (sink, source) = ws.split();
        let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
        let stopping = Arc::new(AtomicBool::new(false));
        let queue_depth = Arc::new(AtomicUsize::new(0));

        let supervisor = tokio::spawn(supervise(
            sink,
            source,
            outbound_rx,
            events,
            Arc::clone(&stopping),
            Arc::clone(&queue_depth),
            config.benign_close_code,
            session_id.clone(),
        ));

        Ok(Self {
            outbound: outbound_tx,
            stopping,
            supervisor,
            queue_depth,
            session_id,
            started_at: std::time::Instant::now(),
        })
    }

    /// Enqueue one PCM chunk. Never blocks; silently drops once the sender
    /// task has exited (the session is already tearing down).
    pub fn send_audio(&self, pcm: Vec<u8>) {
        let depth = self.queue_depth.fetch_add(1, Ordering::Relaxed) + 1;
        if depth == QUEUE_DEPTH_WARN {
            warn!(depth, "outbound audio queue depth abnormal — socket stalled?");
        }
        if self.outbound.send(Outbound::Audio(pcm)).is_err() {
            debug!("audio chunk dropped: sender task already exited");
        }
    }

    /// Request shutdown: enqueue the end-of-audio sentinel. Does not block
    /// for network teardown — the receiver's natural termination closes the
    /// connection after the server's final responses drain.
    pub fn stop(&self) {
        self.stopping.store(true, Ordering::SeqCst);
        let _ = self.outbound.send(Outbound::Finish);
    }

    /// Synchronous-shutdown path for process exit: request stop, then wait
    /// for the session to drain with a bounded timeout, force-closing
    /// regardless of outcome.
    pub async fn shutdown(mut self, timeout: Duration) {
        self.stop();
        if tokio::time::timeout(timeout, &mut self.supervisor)
            .await
            .is_err()
        {
            warn!(
                session_id = %self.session_id,
                ?timeout,
                "session did not drain in time; force-closing"
            );
            // Aborting the supervisor drops both socket halves.
            self.supervisor.abort();
        }
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    /// When this session was opened (for wall-clock metering).
    pub fn started_at(&self) -> std::time::Instant {
        self.started_at
    }
}

impl Drop for StreamingSession {
    fn drop(&mut self) {
        // The supervisor owns the socket halves; aborting it drops them,
        // which closes the TCP stream if teardown never ran.
        if self.supervisor.is_finished() {
            return;
        }
        self.stopping.store(true, Ordering::SeqCst);
        let _ = self.outbound.send(Outbound::Finish);
    }
}

/// Handshake with bounded retries and fixed backoff.
async fn connect_with_retries(config: &SessionConfig) -> Result<WsStream> {
    let attempts = config.connect_attempts.max(1);
    let mut last_error = String::new();

    for attempt in 1..=attempts {
        let request = build_handshake_request(config)?;
        info!(attempt, attempts, endpoint = %config.endpoint, "connecting to recognizer");

        match tokio::time::timeout(config.connect_timeout, connect_async(request)).await {
            Ok(Ok((stream, _response))) => {
                info!(attempt, "recognizer handshake succeeded");
                return Ok(stream);
            }
            Ok(Err(e)) => {
                last_error = describe_handshake_error(&e);
                warn!(attempt, error = %last_error, "recognizer handshake failed");
            }
            Err(_) => {
                last_error = format!(
                    "handshake timed out after {}s",
                    config.connect_timeout.as_secs()
                );
                warn!(attempt, "recognizer handshake timed out");
            }
        }

        if attempt < attempts {
            tokio::time::sleep(config.connect_backoff).await;
        }
    }

    Err(ParlanceError::ConnectExhausted {
        attempts,
        reason: last_error,
    })
}

/// Auth rides in HTTP headers at handshake time; the request id is fresh per
/// attempt so the vendor can correlate retries.
fn build_handshake_request(config: &SessionConfig) -> Result<tungstenite::handshake::client::Request> {
    let mut request = config
        .endpoint
        .as_str()
        .into_client_request()
        .map_err(|e| ParlanceError::Transport(format!("bad endpoint: {e}")))?;

    let headers = request.headers_mut();
    let pairs = [
        ("X-Api-Resource-Id", config.resource_id.as_str()),
        ("X-Api-Request-Id", &Uuid::new_v4().to_string()),
        ("X-Api-Access-Key", config.access_key.as_str()),
        ("X-Api-App-Key", config.app_key.as_str()),
    ];
    for (name, value) in pairs {
        let value = HeaderValue::from_str(value)
            .map_err(|e| ParlanceError::Transport(format!("invalid header {name}: {e}")))?;
        headers.insert(name, value);
    }

    Ok(request)
}

fn describe_handshake_error(err: &tungstenite::Error) -> String {
    match err {
        tungstenite::Error::Http(response) => {
            let status = response.status();
            if status.as_u16() == 403 {
                format!("HTTP {status}: authentication failed — check access key and app key")
            } else {
                format!("HTTP {status}")
            }
        }
        other => other.to_string(),
    }
}

/// Run sender and receiver to completion, close the socket exactly once,
/// emit `Closed` exactly once.
#[allow(clippy::too_many_arguments)]
async fn supervise(
    sink: WsSink,
    source: WsSource,
    outbound_rx: mpsc::UnboundedReceiver<Outbound>,
    events: mpsc::UnboundedSender<SessionEvent>,
    stopping: Arc<AtomicBool>,
    queue_depth: Arc<AtomicUsize>,
    benign_close_code: i32,
    session_id: String,
) {
    let (done_tx, done_rx) = watch::channel(false);

    let sender = tokio::spawn(run_sender(sink, outbound_rx, done_rx, queue_depth));

    let receiver_events = events.clone();
    let receiver = tokio::spawn(async move {
        let reason = run_receiver(source, receiver_events, stopping, benign_close_code).await;
        let _ = done_tx.send(true);
        reason
    });

    let (sink_result, reason_result) = tokio::join!(sender, receiver);

    if let Ok(mut sink) = sink_result {
        let _ = sink.close().await;
    }

    let reason = reason_result.unwrap_or(CloseReason::Disconnected);
    info!(session_id = %session_id, ?reason, "session closed");
    let _ = events.send(SessionEvent::Closed { reason });
}

/// Sender: dequeue → look ahead one chunk → transmit.
///
/// The look-ahead is an explicit two-state machine: `pending == None`
/// (NoPending) or `pending == Some(chunk)` (OnePending). A chunk is only
/// transmitted once its successor arrives, so the terminal chunk — flushed by
/// the sentinel — is the only one framed with the negative sequence.
async fn run_sender(
    mut sink: WsSink,
    mut outbound_rx: mpsc::UnboundedReceiver<Outbound>,
    mut recv_done: watch::Receiver<bool>,
    queue_depth: Arc<AtomicUsize>,
) -> WsSink {
    let mut seq = AUDIO_START_SEQ;
    let mut pending: Option<Vec<u8>> = None;

    loop {
        tokio::select! {
            item = outbound_rx.recv() => match item {
                Some(Outbound::Audio(pcm)) => {
                    queue_depth.fetch_sub(1, Ordering::Relaxed);
                    if let Some(previous) = pending.replace(pcm) {
                        let frame = encode_audio_frame(seq, &previous, false);
                        if sink.send(Message::Binary(frame)).await.is_err() {
                            warn!("audio send failed; abandoning sender");
                            break;
                        }
                        seq += 1;
                    }
                }
                // The sentinel — or a dropped queue — flushes the held chunk
                // (or an empty one) as the terminal frame.
                Some(Outbound::Finish) | None => {
                    let last = pending.take().unwrap_or_default();
                    let frame = encode_audio_frame(seq, &last, true);
                    debug!(seq, bytes = last.len(), "sending terminal audio frame");
                    if sink.send(Message::Binary(frame)).await.is_err() {
                        warn!("terminal frame send failed");
                    }
                    break;
                }
            },
            // Receiver ended (server done or transport dead) — nothing we
            // send will be processed.
            _ = recv_done.changed() => break,
        }
    }

    sink
}

/// Receiver: decode every arriving frame, surface text, decide when the
/// session is over.
async fn run_receiver(
    mut source: WsSource,
    events: mpsc::UnboundedSender<SessionEvent>,
    stopping: Arc<AtomicBool>,
    benign_close_code: i32,
) -> CloseReason {
    while let Some(message) = source.next().await {
        let data = match message {
            Ok(Message::Binary(data)) => data,
            Ok(Message::Close(frame)) => {
                info!(?frame, "server closed the connection");
                return CloseReason::Disconnected;
            }
            Ok(_) => continue,
            Err(e) => {
                warn!("websocket receive error: {e}");
                return CloseReason::Disconnected;
            }
        };

        // Malformed frames decode to the zero-value response: skipped here,
        // never fatal to the session.
        let response = decode_response(&data);

        if let Some(payload) = &response.payload {
            if let Some(result) = results::extract_result(payload) {
                let _ = events.send(SessionEvent::Text(result));
            }
        }

        if response.code != 0 {
            if response.code == benign_close_code {
                if stopping.load(Ordering::SeqCst) {
                    debug!(code = response.code, "benign close during stop");
                    return CloseReason::Finished;
                }
                warn!(
                    code = response.code,
                    "benign idle-drop from recognizer; continuing to wait"
                );
                continue;
            }

            let message = protocol::error_reason(response.code);
            error!(code = response.code, reason = message, "recognizer error");
            let _ = events.send(SessionEvent::ProtocolError {
                code: response.code,
                message: message.to_string(),
            });
            return CloseReason::ProtocolError;
        }

        if response.is_last_package {
            debug!("server marked the final package");
            return CloseReason::Finished;
        }
    }

    debug!("websocket stream ended");
    CloseReason::Disconnected
}
