// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Builds a [`crate::Snapshot`] from accumulated raw terminal bytes.
//!
//! This is a best-effort text projection, not a full terminal emulator: it
//! strips ANSI CSI/OSC escape sequences and splits on carriage control so
//! `session.snapshot` has something human-readable to show, without
//! tracking cursor-positioning semantics byte-for-byte.

use sha2::{Digest, Sha256};

/// Strips ANSI escape sequences (CSI `ESC [ ... letter`, OSC `ESC ] ... BEL`)
/// from raw terminal bytes, leaving printable text and `\n`/`\r`.
pub fn strip_ansi(raw: &[u8]) -> String {
    let mut out = String::with_capacity(raw.len());
    let text = String::from_utf8_lossy(raw);
    let mut chars = text.chars().peekable();
    while let Some(c) = chars.next() {
        if c != '\u{1b}' {
            out.push(c);
            continue;
        }
        match chars.peek() {
            Some('[') => {
                chars.next();
                for c in chars.by_ref() {
                    if c.is_ascii_alphabetic() {
                        break;
                    }
                }
            }
            Some(']') => {
                chars.next();
                for c in chars.by_ref() {
                    if c == '\u{7}' {
                        break;
                    }
                }
            }
            Some(_) => {
                chars.next();
            }
            None => {}
        }
    }
    out
}

/// Splits stripped text into display lines, keeping at most `max_lines` of
/// the most recent output (the PTY host's full scrollback is not
/// reconstructed here).
pub fn lines_from_raw(raw: &[u8], max_lines: usize) -> Vec<String> {
    let stripped = strip_ansi(raw);
    let mut lines: Vec<String> = stripped
        .replace('\r', "")
        .split('\n')
        .map(|s| s.to_string())
        .collect();
    if lines.len() > max_lines {
        let drop = lines.len() - max_lines;
        lines.drain(0..drop);
    }
    lines
}

pub fn content_hash(raw: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(raw);
    format!("{:x}", hasher.finalize())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn strips_csi_sequences() {
        let raw = b"\x1b[31mhello\x1b[0m world";
        assert_eq!(strip_ansi(raw), "hello world");
    }

    #[test]
    fn caps_returned_lines() {
        let raw = b"a\nb\nc\nd\n";
        let lines = lines_from_raw(raw, 2);
        assert_eq!(lines, vec!["d".to_string(), String::new()]);
    }

    #[test]
    fn hash_is_stable_for_same_bytes() {
        assert_eq!(content_hash(b"abc"), content_hash(b"abc"));
        assert_ne!(content_hash(b"abc"), content_hash(b"abd"));
    }
}
