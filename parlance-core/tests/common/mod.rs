//! Shared helpers for wire-level tests: an in-process WebSocket endpoint plus
//! builders/parsers for the recognizer's binary frames.
#![allow(dead_code)] // each test binary uses a different subset

use std::io::{Read, Write};
use std::sync::atomic::AtomicUsize;
use std::sync::Arc;

use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use serde_json::json;
use tokio::net::TcpListener;

pub fn gzip(data: &[u8]) -> Vec<u8> {
    let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
    encoder.write_all(data).unwrap();
    encoder.finish().unwrap()
}

pub fn gunzip(data: &[u8]) -> Vec<u8> {
    let mut decoder = GzDecoder::new(data);
    let mut out = Vec::new();
    decoder.read_to_end(&mut out).unwrap();
    out
}

/// A client frame as the server sees it.
#[derive(Debug)]
pub struct ClientFrame {
    pub msg_type: u8,
    pub flags: u8,
    pub seq: i32,
    pub payload: Vec<u8>,
}

impl ClientFrame {
    pub fn is_terminal(&self) -> bool {
        self.flags == 0b0011
    }
}

/// Parse a client frame (full request or audio). Panics on malformed input —
/// these are tests, a malformed client frame is a failure.
pub fn parse_client_frame(data: &[u8]) -> ClientFrame {
    assert!(data.len() >= 12, "client frame too short: {}", data.len());
    let msg_type = (data[1] >> 4) & 0x0F;
    let flags = data[1] & 0x0F;
    let seq = i32::from_be_bytes(data[4..8].try_into().unwrap());
    let len = u32::from_be_bytes(data[8..12].try_into().unwrap()) as usize;
    assert_eq!(data.len(), 12 + len, "declared payload length mismatch");
    let payload = gunzip(&data[12..]);
    ClientFrame {
        msg_type,
        flags,
        seq,
        payload,
    }
}

fn server_frame(msg_type: u8, flags: u8, head: &[u8], body: &[u8]) -> Vec<u8> {
    let compressed = gzip(body);
    let mut msg = vec![0x11, (msg_type << 4) | flags, 0x11, 0x00];
    msg.extend_from_slice(head);
    msg.extend_from_slice(&(compressed.len() as u32).to_be_bytes());
    msg.extend_from_slice(&compressed);
    msg
}

/// A full response carrying running text and an optional definite utterance.
pub fn text_response(text: &str, definite: Option<(u64, u64)>, is_last: bool) -> Vec<u8> {
    let utterances = match definite {
        Some((start, end)) => json!([
            {"definite": true, "text": text, "start_time": start, "end_time": end}
        ]),
        None => json!([]),
    };
    let body = json!({"result": {"text": text, "utterances": utterances}});
    let flags = if is_last { 0b0011 } else { 0b0001 };
    server_frame(
        0b1001,
        flags,
        &1i32.to_be_bytes(),
        body.to_string().as_bytes(),
    )
}

/// A bare last-package response with no text.
pub fn last_package_response() -> Vec<u8> {
    server_frame(0b1001, 0b0011, &1i32.to_be_bytes(), br#"{"result":{}}"#)
}

/// An error response with the given application code.
pub fn error_response(code: i32) -> Vec<u8> {
    server_frame(0b1111, 0b0000, &code.to_be_bytes(), br#"{"error":"x"}"#)
}

/// Bind a listener on a loopback port and return it with its ws:// URL and a
/// shared accept counter.
pub async fn bind_server() -> (TcpListener, String, Arc<AtomicUsize>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let url = format!("ws://{}", listener.local_addr().unwrap());
    (listener, url, Arc::new(AtomicUsize::new(0)))
}
