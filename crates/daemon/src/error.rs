// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Error taxonomy (§7), one `thiserror` enum per seam.

use thiserror::Error;

/// A connection-handling fault; every variant ends the connection.
#[derive(Debug, Error)]
pub enum ConnectionError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("buffer exceeded")]
    BufferExceeded,

    #[error("authentication required")]
    AuthRequired,

    #[error("invalid auth token")]
    InvalidAuthToken,
}

/// Reason a connection was torn down; used in logs and back-pressure
/// accounting (§4.2's supplement).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionShutdownReason {
    ClientClosed,
    BufferExceeded,
    AuthFailed,
    ServerShutdown,
}

impl std::fmt::Display for ConnectionShutdownReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            Self::ClientClosed => "client-closed",
            Self::BufferExceeded => "buffer-exceeded",
            Self::AuthFailed => "auth-failed",
            Self::ServerShutdown => "server-shutdown",
        })
    }
}

/// A command-level failure, converted to `command.failed {error}` and never
/// propagated into runtime state (§7's "per-command errors are local").
#[derive(Debug, Error)]
pub enum SessionError {
    #[error("session not found: {0}")]
    NotFound(String),

    #[error("session is not live: {0}")]
    NotLive(String),

    #[error("session already exists: {0}")]
    AlreadyExists(String),

    #[error("session is claimed by {0}")]
    Claimed(String),

    #[error("directory not found")]
    DirectoryNotFound,

    #[error("store error: {0}")]
    Store(#[from] sessionmux_storage::StorageError),

    #[error("spawn error: {0}")]
    Spawn(#[from] sessionmux_pty::SpawnError),
}

#[derive(Debug, Error)]
pub enum TelemetryError {
    #[error("unknown token")]
    UnknownToken,

    #[error("invalid body")]
    InvalidBody,
}

#[derive(Debug, Error)]
pub enum PollerError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("store error: {0}")]
    Store(#[from] sessionmux_storage::StorageError),

    #[error("request error: {0}")]
    Request(#[from] reqwest::Error),
}

/// Fatal startup errors, surfaced as exit code `1` (§6).
#[derive(Debug, Error)]
pub enum StartupError {
    #[error("non-loopback host {0} requires --auth-token")]
    AuthTokenRequired(String),

    #[error("failed to bind {0}: {1}")]
    BindFailed(String, std::io::Error),

    #[error("failed to open state store: {0}")]
    Store(#[from] sessionmux_storage::StorageError),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}
