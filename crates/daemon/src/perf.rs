// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Perf logger (§2 component 2): an append-only structured-event sink with
//! batched flush and per-name sampling. Fire-and-forget — callers never
//! await it and a full channel silently drops the event rather than
//! applying back-pressure to a hot path.
//!
//! Grounded in the teacher's buffered line-oriented append-only writers
//! (breadcrumb/job-log pattern): a bounded mpsc channel feeds a single
//! background task that batches writes and flushes periodically.

use serde::Serialize;
use std::collections::HashMap;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::sync::mpsc;
use tracing::warn;

const CHANNEL_CAPACITY: usize = 4096;
const FLUSH_INTERVAL: Duration = Duration::from_millis(500);
const BATCH_SIZE: usize = 256;

#[derive(Debug, Clone, Serialize)]
pub struct PerfEvent {
    pub name: &'static str,
    pub at_ms: u64,
    pub fields: serde_json::Value,
}

/// Handle held by producers; cloning is cheap (wraps an `mpsc::Sender`).
#[derive(Clone)]
pub struct PerfLogger {
    tx: mpsc::Sender<PerfEvent>,
}

impl PerfLogger {
    /// Spawns the background writer task and returns a handle plus a
    /// sampling rate per event name (defaulting to 1-in-1 for unlisted
    /// names). `sink` is typically a rolling file but any `AsyncWrite` works.
    pub fn spawn<W>(sink: W, sample_every: HashMap<&'static str, u32>) -> Self
    where
        W: tokio::io::AsyncWrite + Unpin + Send + 'static,
    {
        let (tx, rx) = mpsc::channel(CHANNEL_CAPACITY);
        tokio::spawn(run_writer(sink, rx, sample_every));
        Self { tx }
    }

    /// Enqueues an event. Never blocks and never awaited from a hot path —
    /// a full channel drops the event (logged once at debug via `try_send`
    /// failure, swallowed here per §7's "fire-and-forget" contract).
    pub fn record(&self, name: &'static str, at_ms: u64, fields: serde_json::Value) {
        let _ = self.tx.try_send(PerfEvent { name, at_ms, fields });
    }
}

async fn run_writer<W>(
    mut sink: W,
    mut rx: mpsc::Receiver<PerfEvent>,
    sample_every: HashMap<&'static str, u32>,
) where
    W: tokio::io::AsyncWrite + Unpin + Send + 'static,
{
    let mut counts: HashMap<&'static str, u32> = HashMap::new();
    let mut batch = Vec::with_capacity(BATCH_SIZE);
    let mut ticker = tokio::time::interval(FLUSH_INTERVAL);

    loop {
        tokio::select! {
            maybe_event = rx.recv() => {
                match maybe_event {
                    Some(event) => {
                        let every = sample_every.get(event.name).copied().unwrap_or(1).max(1);
                        let count = counts.entry(event.name).or_insert(0);
                        *count += 1;
                        if *count % every != 0 {
                            continue;
                        }
                        batch.push(event);
                        if batch.len() >= BATCH_SIZE {
                            flush(&mut sink, &mut batch).await;
                        }
                    }
                    None => {
                        flush(&mut sink, &mut batch).await;
                        return;
                    }
                }
            }
            _ = ticker.tick() => {
                flush(&mut sink, &mut batch).await;
            }
        }
    }
}

async fn flush<W: tokio::io::AsyncWrite + Unpin>(sink: &mut W, batch: &mut Vec<PerfEvent>) {
    if batch.is_empty() {
        return;
    }
    let mut buf = Vec::new();
    for event in batch.drain(..) {
        if let Ok(mut line) = serde_json::to_vec(&event) {
            line.push(b'\n');
            buf.extend_from_slice(&line);
        }
    }
    if let Err(e) = sink.write_all(&buf).await {
        warn!(error = %e, "perf logger write failed");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn records_flush_to_sink_on_channel_close() {
        let (sink_tx, mut sink_rx) = tokio::io::duplex(8192);
        let logger = PerfLogger::spawn(sink_tx, HashMap::new());
        logger.record("session.created", 1, serde_json::json!({"id": "ses-1"}));
        drop(logger);

        let mut buf = Vec::new();
        tokio::io::AsyncReadExt::read_to_end(&mut sink_rx, &mut buf).await.expect("read");
        let text = String::from_utf8(buf).expect("utf8");
        assert!(text.contains("session.created"));
    }
}
