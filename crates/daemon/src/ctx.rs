// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Shared daemon context threaded through every connection task: the
//! session runtime, the observed-event journal, the state store, the perf
//! logger, and the bits of [`DaemonConfig`] the hot path needs.

use crate::connection::ConnectionRegistry;
use crate::journal::Journal;
use crate::perf::PerfLogger;
use crate::poller::PollerRegistry;
use crate::session::SessionRuntime;
use crate::telemetry::TokenTable;
use parking_lot::Mutex;
use sessionmux_core::Clock;
use sessionmux_storage::StateStore;
use std::sync::Arc;

pub struct DaemonCtx<C: Clock> {
    pub sessions: Arc<SessionRuntime<C>>,
    pub journal: Arc<Mutex<Journal>>,
    pub store: Arc<dyn StateStore>,
    pub perf: PerfLogger,
    pub clock: C,
    pub auth_token: Option<String>,
    pub max_connection_buffered_bytes: usize,
    pub connections: Arc<ConnectionRegistry>,
    pub pollers: Arc<PollerRegistry>,
    pub telemetry_tokens: Arc<TokenTable>,
}

impl<C: Clock> DaemonCtx<C> {
    /// Whether a connection must present a token before issuing commands
    /// (§6: required whenever `--auth-token` is configured, regardless of
    /// the bind address — the host-loopback rule only gates *startup*).
    pub fn requires_auth(&self) -> bool {
        self.auth_token.is_some()
    }

    pub fn token_is_valid(&self, provided: &str) -> bool {
        self.auth_token.as_deref() == Some(provided)
    }
}
