// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Poller health type shared between the daemon's background pollers and
//! the `poller.status` diagnostics command.

use serde::{Deserialize, Serialize};

/// Operational health of one background poller, as surfaced over the wire.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MetricsHealth {
    pub last_run_at_ms: Option<u64>,
    pub last_error: Option<String>,
    pub consecutive_failures: u32,
}

impl MetricsHealth {
    pub fn record_success(&mut self, now_ms: u64) {
        self.last_run_at_ms = Some(now_ms);
        self.last_error = None;
        self.consecutive_failures = 0;
    }

    pub fn record_failure(&mut self, now_ms: u64, error: impl Into<String>) {
        self.last_run_at_ms = Some(now_ms);
        self.last_error = Some(error.into());
        self.consecutive_failures += 1;
    }
}
