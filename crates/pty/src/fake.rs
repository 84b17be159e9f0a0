// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! An in-memory [`LiveSession`] double for runtime tests: test code pushes
//! bytes/events directly instead of spawning a real subprocess.

use crate::event::LiveSessionEvent;
use crate::live_session::{AttachHandlers, DataChunk, ExitInfo, LiveSession, Snapshot};
use crate::ring::OutputRing;
use crate::terminal;
use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use sessionmux_core::AttachmentId;
use std::collections::HashMap;
use std::io;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;

struct Shared {
    ring: Mutex<OutputRing>,
    latest_cursor: AtomicU64,
    raw_bytes: Mutex<Vec<u8>>,
    written: Mutex<Vec<u8>>,
    last_resize: Mutex<Option<(u16, u16)>>,
    data_tx: broadcast::Sender<DataChunk>,
    event_tx: broadcast::Sender<LiveSessionEvent>,
    attachments: Mutex<HashMap<AttachmentId, JoinHandle<()>>>,
    closed: std::sync::atomic::AtomicBool,
}

#[derive(Clone)]
pub struct FakeLiveSession {
    shared: Arc<Shared>,
}

impl FakeLiveSession {
    pub fn new() -> Self {
        let (data_tx, _) = broadcast::channel(1024);
        let (event_tx, _) = broadcast::channel(256);
        Self {
            shared: Arc::new(Shared {
                ring: Mutex::new(OutputRing::new()),
                latest_cursor: AtomicU64::new(0),
                raw_bytes: Mutex::new(Vec::new()),
                written: Mutex::new(Vec::new()),
                last_resize: Mutex::new(None),
                data_tx,
                event_tx,
                attachments: Mutex::new(HashMap::new()),
                closed: std::sync::atomic::AtomicBool::new(false),
            }),
        }
    }

    /// Test helper: appends bytes as if produced by the child, bumping the
    /// cursor by the chunk length and fanning it out to attached consumers.
    pub fn push_output(&self, bytes: &[u8]) {
        let cursor = self.shared.latest_cursor.fetch_add(bytes.len() as u64, Ordering::SeqCst) + bytes.len() as u64;
        self.shared.raw_bytes.lock().extend_from_slice(bytes);
        let chunk = DataChunk { cursor, bytes: Bytes::copy_from_slice(bytes) };
        self.shared.ring.lock().push(chunk.clone());
        let _ = self.shared.data_tx.send(chunk);
    }

    pub fn push_event(&self, event: LiveSessionEvent) {
        let _ = self.shared.event_tx.send(event);
    }

    pub fn written_bytes(&self) -> Vec<u8> {
        self.shared.written.lock().clone()
    }

    pub fn last_resize(&self) -> Option<(u16, u16)> {
        *self.shared.last_resize.lock()
    }

    pub fn is_closed(&self) -> bool {
        self.shared.closed.load(Ordering::SeqCst)
    }

    pub fn attachment_count(&self) -> usize {
        self.shared.attachments.lock().len()
    }
}

impl Default for FakeLiveSession {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl LiveSession for FakeLiveSession {
    async fn attach(&self, handlers: AttachHandlers, since_cursor: Option<u64>) -> AttachmentId {
        let id = AttachmentId::new();
        let since = since_cursor.unwrap_or(0);
        let mut data_rx = self.shared.data_tx.subscribe();
        let mut event_rx = self.shared.event_tx.subscribe();
        let backlog = self.shared.ring.lock().backlog_since(since);

        let handle = tokio::spawn(async move {
            let mut last_delivered = since.saturating_sub(1);
            for chunk in backlog {
                last_delivered = chunk.cursor;
                (handlers.on_data)(chunk);
            }
            loop {
                tokio::select! {
                    data = data_rx.recv() => match data {
                        Ok(chunk) => {
                            if chunk.cursor > last_delivered {
                                last_delivered = chunk.cursor;
                                (handlers.on_data)(chunk);
                            }
                        }
                        Err(broadcast::error::RecvError::Lagged(_)) => continue,
                        Err(broadcast::error::RecvError::Closed) => break,
                    },
                    ev = event_rx.recv() => match ev {
                        Ok(LiveSessionEvent::SessionExit { code, signal }) => {
                            (handlers.on_exit)(ExitInfo { code, signal });
                            break;
                        }
                        Ok(_) => continue,
                        Err(broadcast::error::RecvError::Lagged(_)) => continue,
                        Err(broadcast::error::RecvError::Closed) => break,
                    },
                }
            }
        });

        self.shared.attachments.lock().insert(id, handle);
        id
    }

    async fn detach(&self, attachment_id: AttachmentId) {
        if let Some(handle) = self.shared.attachments.lock().remove(&attachment_id) {
            handle.abort();
        }
    }

    async fn write(&self, data: &[u8]) -> io::Result<()> {
        if self.shared.closed.load(Ordering::SeqCst) {
            return Err(io::Error::new(io::ErrorKind::BrokenPipe, "session closed"));
        }
        self.shared.written.lock().extend_from_slice(data);
        Ok(())
    }

    async fn resize(&self, cols: u16, rows: u16) {
        *self.shared.last_resize.lock() = Some((cols, rows));
    }

    async fn snapshot(&self) -> Snapshot {
        let raw = self.shared.raw_bytes.lock().clone();
        let lines = terminal::lines_from_raw(&raw, 500);
        let hash = terminal::content_hash(&raw);
        Snapshot {
            rows: 24,
            cols: 80,
            cursor_row: lines.len().saturating_sub(1) as u16,
            cursor_col: lines.last().map(|l| l.len() as u16).unwrap_or(0),
            modes: serde_json::Value::Null,
            lines,
            hash,
        }
    }

    fn latest_cursor(&self) -> u64 {
        self.shared.latest_cursor.load(Ordering::SeqCst)
    }

    async fn close(&self) {
        self.shared.closed.store(true, Ordering::SeqCst);
        for (_, handle) in self.shared.attachments.lock().drain() {
            handle.abort();
        }
    }

    fn subscribe_events(&self) -> broadcast::Receiver<LiveSessionEvent> {
        self.shared.event_tx.subscribe()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    #[tokio::test]
    async fn attach_replays_backlog_since_cursor() {
        let session = FakeLiveSession::new();
        session.push_output(b"A");
        session.push_output(b"A");
        session.push_output(b"A");
        session.push_output(b"A");

        let received = Arc::new(Mutex::new(Vec::new()));
        let received_clone = Arc::clone(&received);
        let handlers = AttachHandlers {
            on_data: Box::new(move |chunk| received_clone.lock().push(chunk.cursor)),
            on_exit: Box::new(|_| {}),
        };
        session.attach(handlers, Some(2)).await;
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        assert_eq!(*received.lock(), vec![2, 3, 4]);
    }

    #[tokio::test]
    async fn exit_event_invokes_on_exit_once() {
        let session = FakeLiveSession::new();
        let count = Arc::new(AtomicUsize::new(0));
        let count_clone = Arc::clone(&count);
        let handlers = AttachHandlers {
            on_data: Box::new(|_| {}),
            on_exit: Box::new(move |_| {
                count_clone.fetch_add(1, Ordering::SeqCst);
            }),
        };
        session.attach(handlers, None).await;
        session.push_event(LiveSessionEvent::SessionExit { code: Some(0), signal: None });
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }
}
