// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! The opaque live-session capability (§4.4): `attach`, `detach`, `write`,
//! `resize`, `snapshot`, `close`, plus an event channel. The runtime never
//! reaches past this trait into the concrete PTY/subprocess machinery.

use crate::event::LiveSessionEvent;
use async_trait::async_trait;
use bytes::Bytes;
use sessionmux_core::AttachmentId;
use std::io;
use tokio::sync::broadcast;

/// One chunk of raw terminal output, tagged with the byte cursor of its
/// first byte... actually the cursor of the chunk as a whole (the cursor
/// assigned when the chunk was produced), matching `pty.output {cursor,
/// chunkBase64}` on the wire.
#[derive(Debug, Clone)]
pub struct DataChunk {
    pub cursor: u64,
    pub bytes: Bytes,
}

/// Handlers supplied to [`LiveSession::attach`]. `on_data` is invoked with
/// every chunk whose cursor is `>= since_cursor`, in order, exactly once;
/// `on_exit` is invoked at most once, after the last `on_data` call.
pub struct AttachHandlers {
    pub on_data: Box<dyn Fn(DataChunk) + Send + Sync>,
    pub on_exit: Box<dyn Fn(ExitInfo) + Send + Sync>,
}

#[derive(Debug, Clone, Default)]
pub struct ExitInfo {
    pub code: Option<i32>,
    pub signal: Option<String>,
}

/// Full terminal frame as returned by `snapshot()`.
#[derive(Debug, Clone)]
pub struct Snapshot {
    pub rows: u16,
    pub cols: u16,
    pub cursor_row: u16,
    pub cursor_col: u16,
    pub modes: serde_json::Value,
    pub lines: Vec<String>,
    pub hash: String,
}

/// The PTY-session capability the runtime consumes. Implementations:
/// [`crate::ProcessLiveSession`] (a real subprocess behind a PTY) and
/// [`crate::FakeLiveSession`] (an in-memory double for runtime tests).
#[async_trait]
pub trait LiveSession: Send + Sync {
    /// Registers `handlers` and returns an attachment id. Any bytes with
    /// cursor `>= since_cursor` (default 0) already produced are replayed
    /// before any newer byte; delivery for one attachment is never
    /// concurrent.
    async fn attach(&self, handlers: AttachHandlers, since_cursor: Option<u64>) -> AttachmentId;

    /// Idempotent: detaching an already-detached or unknown id is a no-op.
    async fn detach(&self, attachment_id: AttachmentId);

    /// At-most-once delivery of `data` to the child's stdin.
    async fn write(&self, data: &[u8]) -> io::Result<()>;

    /// Best-effort PTY resize.
    async fn resize(&self, cols: u16, rows: u16);

    /// Current full terminal frame.
    async fn snapshot(&self) -> Snapshot;

    /// Cursor of the last produced byte; `0` before any output.
    fn latest_cursor(&self) -> u64;

    /// Terminates the child and closes the PTY's streams.
    async fn close(&self);

    /// Subscribes to the lifecycle event channel. Dropping the receiver is
    /// the unsubscribe.
    fn subscribe_events(&self) -> broadcast::Receiver<LiveSessionEvent>;
}
