// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! State-store error taxonomy (§7: "persistent store closed").

use thiserror::Error;

#[derive(Debug, Error)]
pub enum StorageError {
    /// Once `close()` begins, every subsequent operation reports this and
    /// the runtime disables all pollers.
    #[error("database is closed")]
    Closed,

    #[error("not found")]
    NotFound,

    #[error("wal io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("wal serialization error: {0}")]
    Serde(#[from] serde_json::Error),
}
