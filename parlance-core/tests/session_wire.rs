//! Wire-level tests for `StreamingSession` against an in-process scripted
//! recognizer endpoint. No live vendor, no audio hardware.

mod common;

use std::sync::atomic::Ordering;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Message;

use parlance_core::error::ParlanceError;
use parlance_core::session::{CloseReason, SessionConfig, SessionEvent, StreamingSession};

use common::{
    bind_server, error_response, last_package_response, parse_client_frame, text_response,
    ClientFrame,
};

fn test_config(url: &str) -> SessionConfig {
    SessionConfig {
        endpoint: url.to_string(),
        access_key: "test-access-key".into(),
        app_key: "test-app-key".into(),
        connect_timeout: Duration::from_secs(2),
        connect_attempts: 3,
        connect_backoff: Duration::from_millis(10),
        ..SessionConfig::default()
    }
}

async fn recv_event(
    rx: &mut mpsc::UnboundedReceiver<SessionEvent>,
    what: &str,
) -> SessionEvent {
    tokio::time::timeout(Duration::from_secs(5), rx.recv())
        .await
        .unwrap_or_else(|_| panic!("timed out waiting for {what}"))
        .unwrap_or_else(|| panic!("event channel closed waiting for {what}"))
}

#[tokio::test]
async fn connect_succeeds_on_third_attempt_after_two_failures() {
    let (listener, url, accepts) = bind_server().await;
    let accepts_server = accepts.clone();

    let server = tokio::spawn(async move {
        // Two doomed handshakes: accept, then drop the socket.
        for _ in 0..2 {
            let (stream, _) = listener.accept().await.unwrap();
            accepts_server.fetch_add(1, Ordering::SeqCst);
            drop(stream);
        }

        // Third attempt: a real session.
        let (stream, _) = listener.accept().await.unwrap();
        accepts_server.fetch_add(1, Ordering::SeqCst);
        let mut ws = tokio_tungstenite::accept_async(stream).await.unwrap();

        // Full request, then the terminal frame from stop().
        let full = parse_client_frame(&ws.next().await.unwrap().unwrap().into_data());
        assert_eq!(full.msg_type, 0b0001);
        assert_eq!(full.seq, 1);

        loop {
            let frame = parse_client_frame(&ws.next().await.unwrap().unwrap().into_data());
            if frame.is_terminal() {
                break;
            }
        }
        ws.send(Message::Binary(last_package_response()))
            .await
            .unwrap();
    });

    let (events_tx, mut events_rx) = mpsc::unbounded_channel();
    let session = StreamingSession::open(test_config(&url), events_tx)
        .await
        .expect("third attempt should succeed");
    assert_eq!(accepts.load(Ordering::SeqCst), 3, "exactly 3 attempts");

    session.stop();
    let event = recv_event(&mut events_rx, "session close").await;
    assert!(matches!(
        event,
        SessionEvent::Closed {
            reason: CloseReason::Finished
        }
    ));

    server.await.unwrap();
}

#[tokio::test]
async fn connect_exhaustion_is_reported_not_assumed_successful() {
    let (listener, url, accepts) = bind_server().await;
    let accepts_server = accepts.clone();

    tokio::spawn(async move {
        loop {
            let (stream, _) = listener.accept().await.unwrap();
            accepts_server.fetch_add(1, Ordering::SeqCst);
            drop(stream);
        }
    });

    let (events_tx, _events_rx) = mpsc::unbounded_channel();
    let result = StreamingSession::open(test_config(&url), events_tx).await;

    match result {
        Err(ParlanceError::ConnectExhausted { attempts, .. }) => assert_eq!(attempts, 3),
        other => panic!("expected ConnectExhausted, got {other:?}"),
    }
    assert_eq!(accepts.load(Ordering::SeqCst), 3);
}

#[tokio::test]
async fn sender_frames_audio_with_look_ahead_terminal_negation() {
    let (listener, url, _) = bind_server().await;
    let (frames_tx, mut frames_rx) = mpsc::unbounded_channel::<ClientFrame>();

    tokio::spawn(async move {
        let (stream, _) = listener.accept().await.unwrap();
        let mut ws = tokio_tungstenite::accept_async(stream).await.unwrap();

        loop {
            let frame = parse_client_frame(&ws.next().await.unwrap().unwrap().into_data());
            let terminal = frame.is_terminal();
            frames_tx.send(frame).unwrap();
            if terminal {
                break;
            }
        }
        ws.send(Message::Binary(last_package_response()))
            .await
            .unwrap();
    });

    let (events_tx, mut events_rx) = mpsc::unbounded_channel();
    let session = StreamingSession::open(test_config(&url), events_tx)
        .await
        .unwrap();

    session.send_audio(vec![0xAA; 64]);
    session.send_audio(vec![0xBB; 64]);
    session.stop();

    let event = recv_event(&mut events_rx, "session close").await;
    assert!(matches!(event, SessionEvent::Closed { .. }));

    // Full request: seq +1. First audio chunk: seq +2, positive flags.
    // Second chunk is the held one, flushed by the sentinel as the terminal
    // frame: negative-sequence flags, wire sequence -3.
    let full = frames_rx.recv().await.unwrap();
    assert_eq!(full.seq, 1);
    assert_eq!(full.msg_type, 0b0001);

    let first = frames_rx.recv().await.unwrap();
    assert_eq!(first.msg_type, 0b0010);
    assert_eq!(first.flags, 0b0001);
    assert_eq!(first.seq, 2);
    assert_eq!(first.payload, vec![0xAA; 64]);

    let terminal = frames_rx.recv().await.unwrap();
    assert_eq!(terminal.flags, 0b0011);
    assert_eq!(terminal.seq, -3);
    assert_eq!(terminal.payload, vec![0xBB; 64]);
}

#[tokio::test]
async fn stop_without_audio_sends_empty_terminal_frame() {
    let (listener, url, _) = bind_server().await;
    let (frames_tx, mut frames_rx) = mpsc::unbounded_channel::<ClientFrame>();

    tokio::spawn(async move {
        let (stream, _) = listener.accept().await.unwrap();
        let mut ws = tokio_tungstenite::accept_async(stream).await.unwrap();
        loop {
            let frame = parse_client_frame(&ws.next().await.unwrap().unwrap().into_data());
            let terminal = frame.is_terminal();
            frames_tx.send(frame).unwrap();
            if terminal {
                break;
            }
        }
        ws.send(Message::Binary(last_package_response()))
            .await
            .unwrap();
    });

    let (events_tx, mut events_rx) = mpsc::unbounded_channel();
    let session = StreamingSession::open(test_config(&url), events_tx)
        .await
        .unwrap();
    session.stop();

    recv_event(&mut events_rx, "session close").await;

    let _full = frames_rx.recv().await.unwrap();
    let terminal = frames_rx.recv().await.unwrap();
    assert_eq!(terminal.flags, 0b0011);
    assert_eq!(terminal.seq, -2, "no audio sent: terminal negates seq 2");
    assert!(terminal.payload.is_empty());
}

#[tokio::test]
async fn receiver_surfaces_text_and_definiteness() {
    let (listener, url, _) = bind_server().await;

    tokio::spawn(async move {
        let (stream, _) = listener.accept().await.unwrap();
        let mut ws = tokio_tungstenite::accept_async(stream).await.unwrap();
        let _full = ws.next().await.unwrap().unwrap();

        ws.send(Message::Binary(text_response("hel", None, false)))
            .await
            .unwrap();
        ws.send(Message::Binary(text_response(
            "hello world.",
            Some((100, 400)),
            true,
        )))
        .await
        .unwrap();
    });

    let (events_tx, mut events_rx) = mpsc::unbounded_channel();
    let _session = StreamingSession::open(test_config(&url), events_tx)
        .await
        .unwrap();

    match recv_event(&mut events_rx, "interim text").await {
        SessionEvent::Text(result) => {
            assert_eq!(result.text, "hel");
            assert!(!result.is_definite, "empty utterance list is never definite");
        }
        other => panic!("expected text, got {other:?}"),
    }

    match recv_event(&mut events_rx, "definite text").await {
        SessionEvent::Text(result) => {
            assert_eq!(result.text, "hello world.");
            assert!(result.is_definite);
            assert_eq!(result.start_ms, Some(100));
            assert_eq!(result.end_ms, Some(400));
        }
        other => panic!("expected text, got {other:?}"),
    }

    let event = recv_event(&mut events_rx, "session close").await;
    assert!(matches!(
        event,
        SessionEvent::Closed {
            reason: CloseReason::Finished
        }
    ));
}

#[tokio::test]
async fn malformed_frames_are_skipped_not_fatal() {
    let (listener, url, _) = bind_server().await;

    tokio::spawn(async move {
        let (stream, _) = listener.accept().await.unwrap();
        let mut ws = tokio_tungstenite::accept_async(stream).await.unwrap();
        let _full = ws.next().await.unwrap().unwrap();

        // Garbage, then a valid final text frame.
        ws.send(Message::Binary(vec![0xFF, 0x00, 0x13])).await.unwrap();
        ws.send(Message::Binary(text_response("survived", None, true)))
            .await
            .unwrap();
    });

    let (events_tx, mut events_rx) = mpsc::unbounded_channel();
    let _session = StreamingSession::open(test_config(&url), events_tx)
        .await
        .unwrap();

    match recv_event(&mut events_rx, "text after garbage").await {
        SessionEvent::Text(result) => assert_eq!(result.text, "survived"),
        other => panic!("expected text, got {other:?}"),
    }
    assert!(matches!(
        recv_event(&mut events_rx, "session close").await,
        SessionEvent::Closed {
            reason: CloseReason::Finished
        }
    ));
}

#[tokio::test]
async fn fatal_error_code_terminates_the_session() {
    let (listener, url, _) = bind_server().await;

    tokio::spawn(async move {
        let (stream, _) = listener.accept().await.unwrap();
        let mut ws = tokio_tungstenite::accept_async(stream).await.unwrap();
        let _full = ws.next().await.unwrap().unwrap();
        ws.send(Message::Binary(error_response(1002))).await.unwrap();
    });

    let (events_tx, mut events_rx) = mpsc::unbounded_channel();
    let _session = StreamingSession::open(test_config(&url), events_tx)
        .await
        .unwrap();

    match recv_event(&mut events_rx, "protocol error").await {
        SessionEvent::ProtocolError { code, message } => {
            assert_eq!(code, 1002);
            assert!(message.contains("authentication"));
        }
        other => panic!("expected protocol error, got {other:?}"),
    }
    assert!(matches!(
        recv_event(&mut events_rx, "session close").await,
        SessionEvent::Closed {
            reason: CloseReason::ProtocolError
        }
    ));
}

#[tokio::test]
async fn benign_code_keeps_the_receiver_waiting() {
    let (listener, url, _) = bind_server().await;

    tokio::spawn(async move {
        let (stream, _) = listener.accept().await.unwrap();
        let mut ws = tokio_tungstenite::accept_async(stream).await.unwrap();
        let _full = ws.next().await.unwrap().unwrap();

        // Idle-drop code while not stopping: the receiver must keep waiting
        // and still deliver later results.
        ws.send(Message::Binary(error_response(45_000_081)))
            .await
            .unwrap();
        ws.send(Message::Binary(text_response("after idle", None, true)))
            .await
            .unwrap();
    });

    let (events_tx, mut events_rx) = mpsc::unbounded_channel();
    let _session = StreamingSession::open(test_config(&url), events_tx)
        .await
        .unwrap();

    match recv_event(&mut events_rx, "text after benign code").await {
        SessionEvent::Text(result) => assert_eq!(result.text, "after idle"),
        other => panic!("expected text, got {other:?}"),
    }
    assert!(matches!(
        recv_event(&mut events_rx, "session close").await,
        SessionEvent::Closed {
            reason: CloseReason::Finished
        }
    ));
}

#[tokio::test]
async fn abrupt_close_reports_disconnected() {
    let (listener, url, _) = bind_server().await;

    tokio::spawn(async move {
        let (stream, _) = listener.accept().await.unwrap();
        let mut ws = tokio_tungstenite::accept_async(stream).await.unwrap();
        let _full = ws.next().await.unwrap().unwrap();
        // Drop without a close handshake.
    });

    let (events_tx, mut events_rx) = mpsc::unbounded_channel();
    let _session = StreamingSession::open(test_config(&url), events_tx)
        .await
        .unwrap();

    let mut closed = 0;
    while let Ok(Some(event)) =
        tokio::time::timeout(Duration::from_secs(5), events_rx.recv()).await
    {
        if let SessionEvent::Closed { reason } = event {
            assert_eq!(reason, CloseReason::Disconnected);
            closed += 1;
        }
    }
    assert_eq!(closed, 1, "Closed must be emitted exactly once");
}
