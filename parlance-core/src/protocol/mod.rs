//! Binary frame codec for the recognizer's WebSocket protocol.
//!
//! ## Wire format
//!
//! ```text
//! ┌──────────────┬──────────────┬───────────────┬──────────┐
//! │ ver | hdr_len │ type | flags │ serial | comp │ reserved │   4-byte header
//! ├──────────────┴──────────────┴───────────────┴──────────┤
//! │ sequence (i32, BE)            — when flags bit0/bit1    │
//! │ event id (i32, BE)            — when flags bit2         │
//! │ error code (i32, BE)          — error responses only    │
//! │ payload length (u32, BE)                                │
//! │ gzip(payload)                                           │
//! └─────────────────────────────────────────────────────────┘
//! ```
//!
//! All integers are big-endian. Client payloads are gzip-compressed JSON
//! (the full request) or gzip-compressed raw PCM (audio frames).
//!
//! The terminal audio frame is the only end-of-stream signal: it carries the
//! arithmetic negation of the sequence it would otherwise have used, with the
//! negative-sequence flag set. There is no separate close message.

use std::io::{Read, Write};

use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use serde::Serialize;
use tracing::warn;

/// Protocol version nibble.
pub const PROTOCOL_VERSION: u8 = 0b0001;
/// Header length in 4-byte words.
pub const HEADER_WORDS: u8 = 1;

/// Message type nibbles.
pub mod message_type {
    pub const CLIENT_FULL_REQUEST: u8 = 0b0001;
    pub const CLIENT_AUDIO_ONLY: u8 = 0b0010;
    pub const SERVER_FULL_RESPONSE: u8 = 0b1001;
    pub const SERVER_ERROR_RESPONSE: u8 = 0b1111;
}

/// Message-type-specific flag nibbles.
///
/// `NEG_SEQUENCE` (terminal frame without a sequence field) is the legacy
/// framing of an older protocol-client revision; it is not wire-compatible
/// with `NEG_WITH_SEQUENCE` and is kept only so switching is a one-line edit
/// if the vendor protocol version demands it.
pub mod flags {
    pub const NO_SEQUENCE: u8 = 0b0000;
    pub const POS_SEQUENCE: u8 = 0b0001;
    pub const NEG_SEQUENCE: u8 = 0b0010;
    pub const NEG_WITH_SEQUENCE: u8 = 0b0011;
}

/// Serialization nibbles.
pub mod serialization {
    pub const NONE: u8 = 0b0000;
    pub const JSON: u8 = 0b0001;
}

/// Compression nibbles.
pub mod compression {
    pub const NONE: u8 = 0b0000;
    pub const GZIP: u8 = 0b0001;
}

/// Error code the vendor emits for an idle/segment-drop disconnect (e.g.
/// audio stalled while the user paused). Non-fatal; treat as configuration,
/// not a constant — see `SessionConfig::benign_close_code`.
pub const DEFAULT_BENIGN_CLOSE_CODE: i32 = 45_000_081;

/// Recognition options carried in the full client request.
#[derive(Debug, Clone)]
pub struct RequestOptions {
    pub uid: String,
    pub model_name: String,
    pub sample_rate: u32,
    /// Inverse text normalization ("twenty five" → "25").
    pub enable_itn: bool,
    pub enable_punctuation: bool,
    /// Required for definite-utterance detection downstream.
    pub show_utterances: bool,
}

impl Default for RequestOptions {
    fn default() -> Self {
        Self {
            uid: "parlance".into(),
            model_name: "bigmodel".into(),
            sample_rate: 16_000,
            enable_itn: true,
            enable_punctuation: true,
            show_utterances: true,
        }
    }
}

#[derive(Serialize)]
struct FullRequestPayload<'a> {
    user: UserSection<'a>,
    audio: AudioSection,
    request: RequestSection<'a>,
}

#[derive(Serialize)]
struct UserSection<'a> {
    uid: &'a str,
}

#[derive(Serialize)]
struct AudioSection {
    format: &'static str,
    codec: &'static str,
    rate: u32,
    bits: u32,
    channel: u32,
}

#[derive(Serialize)]
struct RequestSection<'a> {
    model_name: &'a str,
    enable_itn: bool,
    enable_punc: bool,
    show_utterances: bool,
    result_type: &'static str,
}

fn header(msg_type: u8, type_flags: u8) -> [u8; 4] {
    [
        (PROTOCOL_VERSION << 4) | HEADER_WORDS,
        (msg_type << 4) | type_flags,
        (serialization::JSON << 4) | compression::GZIP,
        0x00,
    ]
}

fn gzip(data: &[u8]) -> Vec<u8> {
    let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
    // Writing to a Vec cannot fail.
    let _ = encoder.write_all(data);
    encoder.finish().unwrap_or_default()
}

fn gunzip(data: &[u8]) -> std::io::Result<Vec<u8>> {
    let mut decoder = GzDecoder::new(data);
    let mut out = Vec::new();
    decoder.read_to_end(&mut out)?;
    Ok(out)
}

/// Encode the full client request that opens a recognition session.
///
/// Header flags mark a positive sequence; the payload describes the PCM
/// stream (16-bit mono at `opts.sample_rate`) and the recognition options.
pub fn encode_full_request(seq: i32, opts: &RequestOptions) -> Vec<u8> {
    let payload = FullRequestPayload {
        user: UserSection { uid: &opts.uid },
        audio: AudioSection {
            format: "pcm",
            codec: "raw",
            rate: opts.sample_rate,
            bits: 16,
            channel: 1,
        },
        request: RequestSection {
            model_name: &opts.model_name,
            enable_itn: opts.enable_itn,
            enable_punc: opts.enable_punctuation,
            show_utterances: opts.show_utterances,
            result_type: "single",
        },
    };
    // Serializing a struct of strings and bools cannot fail.
    let body = serde_json::to_vec(&payload).unwrap_or_default();
    let compressed = gzip(&body);

    let mut frame = Vec::with_capacity(12 + compressed.len());
    frame.extend_from_slice(&header(
        message_type::CLIENT_FULL_REQUEST,
        flags::POS_SEQUENCE,
    ));
    frame.extend_from_slice(&seq.to_be_bytes());
    frame.extend_from_slice(&(compressed.len() as u32).to_be_bytes());
    frame.extend_from_slice(&compressed);
    frame
}

/// Encode one audio frame.
///
/// The sequence field is always present. A terminal frame (`is_last`) carries
/// the negative-sequence flag and the negated sequence value — the protocol's
/// only end-of-stream signal.
pub fn encode_audio_frame(seq: i32, pcm: &[u8], is_last: bool) -> Vec<u8> {
    let (type_flags, wire_seq) = if is_last {
        (flags::NEG_WITH_SEQUENCE, -seq)
    } else {
        (flags::POS_SEQUENCE, seq)
    };

    let compressed = gzip(pcm);
    let mut frame = Vec::with_capacity(12 + compressed.len());
    frame.extend_from_slice(&header(message_type::CLIENT_AUDIO_ONLY, type_flags));
    frame.extend_from_slice(&wire_seq.to_be_bytes());
    frame.extend_from_slice(&(compressed.len() as u32).to_be_bytes());
    frame.extend_from_slice(&compressed);
    frame
}

/// A decoded server frame. `Default` is the zero-value returned for any
/// malformed input — callers treat decode failure as "skip and continue".
#[derive(Debug, Clone, Default)]
pub struct ServerResponse {
    /// Application error code; 0 means success.
    pub code: i32,
    /// Event id, when the has-event flag is set.
    pub event: i32,
    /// Set when the server marks the final package of the session.
    pub is_last_package: bool,
    /// Echoed sequence number, when present.
    pub sequence: i32,
    /// Decompressed, JSON-decoded payload, when present and well-formed.
    pub payload: Option<serde_json::Value>,
}

fn read_i32(buf: &[u8]) -> Option<(i32, &[u8])> {
    let bytes: [u8; 4] = buf.get(..4)?.try_into().ok()?;
    Some((i32::from_be_bytes(bytes), &buf[4..]))
}

fn read_u32(buf: &[u8]) -> Option<(u32, &[u8])> {
    let bytes: [u8; 4] = buf.get(..4)?.try_into().ok()?;
    Some((u32::from_be_bytes(bytes), &buf[4..]))
}

/// Decode one server frame.
///
/// Never fails: truncated or malformed buffers yield the zero-value response
/// so one bad frame cannot abort a session.
pub fn decode_response(msg: &[u8]) -> ServerResponse {
    let mut response = ServerResponse::default();

    if msg.len() < 4 {
        warn!(len = msg.len(), "server frame shorter than header");
        return response;
    }

    let header_words = (msg[0] & 0x0F) as usize;
    let msg_type = (msg[1] >> 4) & 0x0F;
    let type_flags = msg[1] & 0x0F;
    let serialization_type = (msg[2] >> 4) & 0x0F;
    let compression_type = msg[2] & 0x0F;

    let Some(mut rest) = msg.get(header_words * 4..) else {
        warn!(header_words, "server frame truncated before payload");
        return response;
    };

    if type_flags & 0x01 != 0 {
        let Some((seq, tail)) = read_i32(rest) else {
            return response;
        };
        response.sequence = seq;
        rest = tail;
    }
    if type_flags & 0x02 != 0 {
        response.is_last_package = true;
    }
    if type_flags & 0x04 != 0 {
        let Some((event, tail)) = read_i32(rest) else {
            return response;
        };
        response.event = event;
        rest = tail;
    }

    match msg_type {
        message_type::SERVER_FULL_RESPONSE => {
            let Some((_size, tail)) = read_u32(rest) else {
                return response;
            };
            rest = tail;
        }
        message_type::SERVER_ERROR_RESPONSE => {
            let Some((code, tail)) = read_i32(rest) else {
                return response;
            };
            response.code = code;
            let Some((_size, tail)) = read_u32(tail) else {
                return response;
            };
            rest = tail;
        }
        other => {
            warn!(msg_type = other, "unexpected server message type");
            return response;
        }
    }

    if rest.is_empty() {
        return response;
    }

    let body = if compression_type == compression::GZIP {
        match gunzip(rest) {
            Ok(decompressed) => decompressed,
            Err(e) => {
                warn!("failed to decompress server payload: {e}");
                return response;
            }
        }
    } else {
        rest.to_vec()
    };

    if serialization_type == serialization::JSON {
        match serde_json::from_slice(&body) {
            Ok(value) => response.payload = Some(value),
            Err(e) => warn!("failed to parse server payload: {e}"),
        }
    }

    response
}

/// Human-readable reason for a known vendor error code.
pub fn error_reason(code: i32) -> &'static str {
    match code {
        1001 => "invalid request parameters",
        1002 => "authentication failed",
        1003 => "quota exceeded",
        1004 => "service unavailable",
        1005 => "internal server error",
        1006 => "request timed out",
        1007 => "unsupported audio format",
        1008 => "invalid audio length",
        1009 => "invalid audio sample rate",
        1010 => "invalid audio channel count",
        DEFAULT_BENIGN_CLOSE_CODE => "connection idle or audio stream interrupted",
        _ => "unknown error code",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Hand-build a server full response the way the vendor frames it.
    fn server_full_response(seq: i32, is_last: bool, body: &[u8]) -> Vec<u8> {
        let type_flags = if is_last { 0b0011 } else { 0b0001 };
        let compressed = gzip(body);
        let mut msg = vec![
            (PROTOCOL_VERSION << 4) | HEADER_WORDS,
            (message_type::SERVER_FULL_RESPONSE << 4) | type_flags,
            (serialization::JSON << 4) | compression::GZIP,
            0x00,
        ];
        msg.extend_from_slice(&seq.to_be_bytes());
        msg.extend_from_slice(&(compressed.len() as u32).to_be_bytes());
        msg.extend_from_slice(&compressed);
        msg
    }

    #[test]
    fn full_request_header_and_sequence() {
        let frame = encode_full_request(1, &RequestOptions::default());

        assert_eq!(frame[0], 0x11, "version nibble + one header word");
        assert_eq!(frame[1], 0x11, "full request + positive sequence");
        assert_eq!(frame[2], 0x11, "JSON + gzip");
        assert_eq!(frame[3], 0x00);
        assert_eq!(&frame[4..8], &1i32.to_be_bytes());

        let payload_len = u32::from_be_bytes(frame[8..12].try_into().unwrap()) as usize;
        assert_eq!(frame.len(), 12 + payload_len);

        let body = gunzip(&frame[12..]).expect("payload should be gzip");
        let json: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(json["audio"]["rate"], 16_000);
        assert_eq!(json["audio"]["bits"], 16);
        assert_eq!(json["audio"]["channel"], 1);
        assert_eq!(json["request"]["enable_itn"], true);
        assert_eq!(json["request"]["enable_punc"], true);
        assert_eq!(json["request"]["show_utterances"], true);
    }

    #[test]
    fn audio_frame_positive_sequence() {
        let frame = encode_audio_frame(7, &[1, 2, 3, 4], false);
        assert_eq!(frame[1], 0x21, "audio-only + positive sequence");
        assert_eq!(&frame[4..8], &7i32.to_be_bytes());
    }

    #[test]
    fn terminal_frame_negates_sequence() {
        let frame = encode_audio_frame(9, &[], true);
        assert_eq!(frame[1], 0x23, "audio-only + negative sequence flags");
        assert_eq!(&frame[4..8], &(-9i32).to_be_bytes());

        // The sequence field is present even on the terminal frame.
        let payload_len = u32::from_be_bytes(frame[8..12].try_into().unwrap()) as usize;
        assert_eq!(frame.len(), 12 + payload_len);
    }

    #[test]
    fn decode_recovers_text_last_flag_and_code() {
        let body = br#"{"result":{"text":"hello world"}}"#;
        let msg = server_full_response(3, true, body);

        let response = decode_response(&msg);
        assert_eq!(response.code, 0);
        assert!(response.is_last_package);
        assert_eq!(response.sequence, 3);
        let payload = response.payload.expect("payload should decode");
        assert_eq!(payload["result"]["text"], "hello world");
    }

    #[test]
    fn decode_error_response_code() {
        let compressed = gzip(br#"{"error":"auth"}"#);
        let mut msg = vec![
            0x11,
            (message_type::SERVER_ERROR_RESPONSE << 4), // no flags
            0x11,
            0x00,
        ];
        msg.extend_from_slice(&1002i32.to_be_bytes());
        msg.extend_from_slice(&(compressed.len() as u32).to_be_bytes());
        msg.extend_from_slice(&compressed);

        let response = decode_response(&msg);
        assert_eq!(response.code, 1002);
        assert!(!response.is_last_package);
        assert_eq!(error_reason(response.code), "authentication failed");
    }

    #[test]
    fn truncated_buffers_yield_zero_response() {
        for msg in [&b""[..], &[0x11][..], &[0x11, 0x91, 0x11, 0x00][..]] {
            let response = decode_response(msg);
            assert_eq!(response.code, 0);
            assert!(!response.is_last_package);
            assert!(response.payload.is_none());
        }
    }

    #[test]
    fn garbage_payload_is_skipped_not_fatal() {
        // Valid header claiming gzip, but payload is random bytes.
        let mut msg = vec![0x11, 0x91, 0x11, 0x00];
        msg.extend_from_slice(&1i32.to_be_bytes());
        msg.extend_from_slice(&4u32.to_be_bytes());
        msg.extend_from_slice(&[0xDE, 0xAD, 0xBE, 0xEF]);

        let response = decode_response(&msg);
        assert!(response.payload.is_none());
        assert_eq!(response.sequence, 1);
    }
}
