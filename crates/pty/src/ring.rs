// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Bounded backlog of recent output chunks, used to replay bytes to a
//! freshly attached connection without re-reading from the child.

use crate::live_session::DataChunk;
use std::collections::VecDeque;

const DEFAULT_MAX_BYTES: usize = 4 * 1024 * 1024;

pub struct OutputRing {
    chunks: VecDeque<DataChunk>,
    total_bytes: usize,
    max_bytes: usize,
    latest_cursor: u64,
}

impl OutputRing {
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_MAX_BYTES)
    }

    pub fn with_capacity(max_bytes: usize) -> Self {
        Self { chunks: VecDeque::new(), total_bytes: 0, max_bytes, latest_cursor: 0 }
    }

    /// Appends a freshly produced chunk, evicting the oldest entries once
    /// `max_bytes` is exceeded.
    pub fn push(&mut self, chunk: DataChunk) {
        self.latest_cursor = chunk.cursor;
        self.total_bytes += chunk.bytes.len();
        self.chunks.push_back(chunk);
        while self.total_bytes > self.max_bytes {
            match self.chunks.pop_front() {
                Some(evicted) => self.total_bytes -= evicted.bytes.len(),
                None => break,
            }
        }
    }

    pub fn latest_cursor(&self) -> u64 {
        self.latest_cursor
    }

    /// Every resident chunk whose cursor is `>= since_cursor`, oldest first.
    pub fn backlog_since(&self, since_cursor: u64) -> Vec<DataChunk> {
        self.chunks.iter().filter(|c| c.cursor >= since_cursor).cloned().collect()
    }

    pub fn all_bytes(&self) -> Vec<u8> {
        let mut out = Vec::new();
        for chunk in &self.chunks {
            out.extend_from_slice(&chunk.bytes);
        }
        out
    }
}

impl Default for OutputRing {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;

    #[test]
    fn evicts_oldest_past_capacity() {
        let mut ring = OutputRing::with_capacity(4);
        ring.push(DataChunk { cursor: 1, bytes: Bytes::from_static(b"ab") });
        ring.push(DataChunk { cursor: 2, bytes: Bytes::from_static(b"cd") });
        ring.push(DataChunk { cursor: 3, bytes: Bytes::from_static(b"ef") });
        assert_eq!(ring.backlog_since(0).len(), 2);
    }

    #[test]
    fn backlog_since_filters_by_cursor() {
        let mut ring = OutputRing::new();
        for i in 1..=4u64 {
            ring.push(DataChunk { cursor: i, bytes: Bytes::from_static(b"a") });
        }
        let backlog = ring.backlog_since(2);
        assert_eq!(backlog.iter().map(|c| c.cursor).collect::<Vec<_>>(), vec![2, 3, 4]);
    }

    proptest::proptest! {
        /// For any run of pushes with strictly increasing cursors, the
        /// backlog returned for an arbitrary `since_cursor` is ordered
        /// oldest-first and every entry actually satisfies the bound —
        /// the property attach-replay depends on regardless of how much
        /// the ring has evicted in between.
        #[test]
        fn backlog_since_is_ordered_and_bounded(lens in proptest::collection::vec(1usize..8, 1..40), since in 0u64..50) {
            let mut ring = OutputRing::new();
            for (i, len) in lens.iter().enumerate() {
                let cursor = i as u64 + 1;
                ring.push(DataChunk { cursor, bytes: Bytes::from(vec![0u8; *len]) });
            }
            let backlog = ring.backlog_since(since);
            for chunk in &backlog {
                proptest::prop_assert!(chunk.cursor >= since);
            }
            for pair in backlog.windows(2) {
                proptest::prop_assert!(pair[0].cursor < pair[1].cursor);
            }
        }
    }
}
