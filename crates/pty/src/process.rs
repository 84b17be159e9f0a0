// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! A [`LiveSession`] backed by a real subprocess behind a pseudo-terminal,
//! using `portable-pty`. Blocking PTY I/O runs on dedicated OS threads (the
//! PTY crates in this ecosystem are not `async`-native) and is bridged into
//! the async world with a broadcast channel, mirroring the reader/resize/
//! wait threads of a typical PTY bridge.

use crate::live_session::{AttachHandlers, DataChunk, ExitInfo, LiveSession, Snapshot};
use crate::event::LiveSessionEvent;
use crate::ring::OutputRing;
use crate::terminal;
use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use portable_pty::{native_pty_system, Child, CommandBuilder, MasterPty, PtySize};
use sessionmux_core::AttachmentId;
use std::collections::HashMap;
use std::io::{self, Read, Write};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;

#[derive(Debug, Error)]
pub enum SpawnError {
    #[error("failed to open pty: {0}")]
    OpenPty(String),
    #[error("failed to spawn command: {0}")]
    Spawn(String),
}

pub struct SpawnParams {
    pub program: String,
    pub args: Vec<String>,
    pub cwd: Option<std::path::PathBuf>,
    pub env: Vec<(String, String)>,
    pub rows: u16,
    pub cols: u16,
}

struct Shared {
    writer: Mutex<Box<dyn Write + Send>>,
    master: Mutex<Box<dyn MasterPty + Send>>,
    child: Mutex<Box<dyn Child + Send + Sync>>,
    ring: Mutex<OutputRing>,
    latest_cursor: AtomicU64,
    raw_bytes: Mutex<Vec<u8>>,
    data_tx: broadcast::Sender<DataChunk>,
    event_tx: broadcast::Sender<LiveSessionEvent>,
    attachments: Mutex<HashMap<AttachmentId, JoinHandle<()>>>,
    closed: std::sync::atomic::AtomicBool,
}

/// A live session backed by a real PTY-attached subprocess.
pub struct ProcessLiveSession {
    shared: Arc<Shared>,
}

impl ProcessLiveSession {
    pub fn spawn(params: SpawnParams) -> Result<Self, SpawnError> {
        let pty_system = native_pty_system();
        let pair = pty_system
            .openpty(PtySize { rows: params.rows, cols: params.cols, pixel_width: 0, pixel_height: 0 })
            .map_err(|e| SpawnError::OpenPty(e.to_string()))?;

        let mut cmd = CommandBuilder::new(&params.program);
        for arg in &params.args {
            cmd.arg(arg);
        }
        if let Some(cwd) = &params.cwd {
            cmd.cwd(cwd);
        }
        for (k, v) in &params.env {
            cmd.env(k, v);
        }

        let child = pair.slave.spawn_command(cmd).map_err(|e| SpawnError::Spawn(e.to_string()))?;
        let mut reader = pair.master.try_clone_reader().map_err(|e| SpawnError::OpenPty(e.to_string()))?;
        let writer = pair.master.take_writer().map_err(|e| SpawnError::OpenPty(e.to_string()))?;

        let (data_tx, _) = broadcast::channel(4096);
        let (event_tx, _) = broadcast::channel(256);

        let shared = Arc::new(Shared {
            writer: Mutex::new(writer),
            master: Mutex::new(pair.master),
            child: Mutex::new(child),
            ring: Mutex::new(OutputRing::new()),
            latest_cursor: AtomicU64::new(0),
            raw_bytes: Mutex::new(Vec::new()),
            data_tx,
            event_tx,
            attachments: Mutex::new(HashMap::new()),
            closed: std::sync::atomic::AtomicBool::new(false),
        });

        // Reader thread: blocking PTY reads, each chunk gets the next cursor.
        let reader_shared = Arc::clone(&shared);
        std::thread::spawn(move || {
            let mut buf = [0u8; 8192];
            loop {
                match reader.read(&mut buf) {
                    Ok(0) => break,
                    Ok(n) => {
                        let cursor = reader_shared.latest_cursor.fetch_add(n as u64, Ordering::SeqCst) + n as u64;
                        let bytes = Bytes::copy_from_slice(&buf[..n]);
                        reader_shared.raw_bytes.lock().extend_from_slice(&buf[..n]);
                        let chunk = DataChunk { cursor, bytes };
                        reader_shared.ring.lock().push(chunk.clone());
                        let _ = reader_shared.data_tx.send(chunk);
                    }
                    Err(_) => break,
                }
            }
        });

        // Wait thread: blocking wait on the child, publishes session-exit.
        let wait_shared = Arc::clone(&shared);
        std::thread::spawn(move || loop {
            let exited = {
                let mut guard = wait_shared.child.lock();
                guard.try_wait()
            };
            match exited {
                Ok(Some(status)) => {
                    let code = status.exit_code() as i32;
                    let _ = wait_shared.event_tx.send(LiveSessionEvent::SessionExit {
                        code: Some(code),
                        signal: None,
                    });
                    break;
                }
                Ok(None) => std::thread::sleep(std::time::Duration::from_millis(200)),
                Err(_) => break,
            }
            if wait_shared.closed.load(Ordering::SeqCst) {
                break;
            }
        });

        Ok(Self { shared })
    }
}

#[async_trait]
impl LiveSession for ProcessLiveSession {
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
        let data = data.to_vec();
        let shared = Arc::clone(&self.shared);
        tokio::task::spawn_blocking(move || shared.writer.lock().write_all(&data))
            .await
            .map_err(|e| io::Error::new(io::ErrorKind::Other, e))?
    }

    async fn resize(&self, cols: u16, rows: u16) {
        let shared = Arc::clone(&self.shared);
        let _ = tokio::task::spawn_blocking(move || {
            let size = PtySize { cols, rows, pixel_width: 0, pixel_height: 0 };
            let _ = shared.master.lock().resize(size);
        })
        .await;
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
        let shared = Arc::clone(&self.shared);
        let _ = tokio::task::spawn_blocking(move || {
            let _ = shared.child.lock().kill();
        })
        .await;
        for (_, handle) in self.shared.attachments.lock().drain() {
            handle.abort();
        }
    }

    fn subscribe_events(&self) -> broadcast::Receiver<LiveSessionEvent> {
        self.shared.event_tx.subscribe()
    }
}
