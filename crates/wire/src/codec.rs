// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Envelope codec: newline-delimited JSON framing over a byte stream.
//!
//! The terminating newline is part of framing, never part of the payload.
//! Parsing tolerates empty lines (skipped) and a trailing partial record
//! (kept in the returned remainder for the next call). Malformed JSON lines
//! are dropped, never treated as fatal to the connection — the server stays
//! permissive to tolerate mixed-version clients.

use crate::envelope::{ClientEnvelope, ServerEnvelope};
use serde::Serialize;

/// Default ceiling on a single framed line. A line at or past this size is
/// treated as malformed and dropped rather than letting the remainder
/// buffer grow without bound.
pub const DEFAULT_MAX_LINE_BYTES: usize = 1024 * 1024;

/// Result of draining complete lines out of a connection's read buffer.
pub struct ConsumedLines<T> {
    pub messages: Vec<T>,
    pub remainder: Vec<u8>,
}

/// Splits `buffer` on `\n`, parsing each complete line as `T`. Malformed
/// lines are dropped silently; a trailing partial line is returned as
/// `remainder` for the caller to prepend to the next read.
pub fn consume_json_lines<T: serde::de::DeserializeOwned>(
    buffer: &[u8],
    max_line_bytes: usize,
) -> ConsumedLines<T> {
    let mut messages = Vec::new();
    let mut start = 0usize;
    for (i, &byte) in buffer.iter().enumerate() {
        if byte != b'\n' {
            continue;
        }
        let line = &buffer[start..i];
        start = i + 1;
        if line.is_empty() {
            continue;
        }
        if line.len() > max_line_bytes {
            continue;
        }
        if let Ok(msg) = serde_json::from_slice::<T>(line) {
            messages.push(msg);
        }
    }
    let remainder = if buffer.len() - start > max_line_bytes {
        // An oversized in-progress line: drop it rather than growing forever.
        Vec::new()
    } else {
        buffer[start..].to_vec()
    };
    ConsumedLines { messages, remainder }
}

pub fn consume_client_lines(buffer: &[u8], max_line_bytes: usize) -> ConsumedLines<ClientEnvelope> {
    consume_json_lines(buffer, max_line_bytes)
}

/// Encodes one envelope as a single line-terminated JSON record.
pub fn encode<T: Serialize>(envelope: &T) -> Vec<u8> {
    let mut bytes = serde_json::to_vec(envelope).unwrap_or_default();
    bytes.push(b'\n');
    bytes
}

pub fn encode_server(envelope: &ServerEnvelope) -> Vec<u8> {
    encode(envelope)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::envelope::ClientEnvelope;

    #[test]
    fn splits_complete_lines_and_keeps_remainder() {
        let mut buf = Vec::new();
        buf.extend_from_slice(br#"{"kind":"auth","token":"t"}"#);
        buf.push(b'\n');
        buf.extend_from_slice(br#"{"kind":"auth","token":"#); // partial
        let consumed = consume_client_lines(&buf, DEFAULT_MAX_LINE_BYTES);
        assert_eq!(consumed.messages.len(), 1);
        assert_eq!(consumed.remainder, br#"{"kind":"auth","token":"#.to_vec());
    }

    #[test]
    fn skips_empty_lines() {
        let buf = b"\n\n".to_vec();
        let consumed: ConsumedLines<ClientEnvelope> = consume_json_lines(&buf, DEFAULT_MAX_LINE_BYTES);
        assert!(consumed.messages.is_empty());
        assert!(consumed.remainder.is_empty());
    }

    #[test]
    fn drops_malformed_json_without_failing() {
        let buf = b"not json at all\n".to_vec();
        let consumed: ConsumedLines<ClientEnvelope> = consume_json_lines(&buf, DEFAULT_MAX_LINE_BYTES);
        assert!(consumed.messages.is_empty());
    }

    #[test]
    fn oversized_line_is_dropped_not_buffered_forever() {
        let mut line = vec![b'a'; 32];
        line.push(b'\n');
        let consumed: ConsumedLines<ClientEnvelope> = consume_json_lines(&line, 8);
        assert!(consumed.messages.is_empty());
        assert!(consumed.remainder.is_empty());
    }

    #[test]
    fn encode_round_trips_through_parse() {
        let env = ClientEnvelope::Auth { token: "abc".into() };
        let bytes = encode(&env);
        assert_eq!(bytes.last(), Some(&b'\n'));
        let consumed: ConsumedLines<ClientEnvelope> = consume_json_lines(&bytes, DEFAULT_MAX_LINE_BYTES);
        assert_eq!(consumed.messages.len(), 1);
    }
}
