// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Result payloads carried by `command.completed`, one variant per command
//! result shape named in §6's table.

use crate::types::{
    AgentToolEntry, ControllerSummary, PollerStatusEntry, SessionDiagnostics,
    SessionSnapshotResult, SessionSummary,
};
use sessionmux_core::{SessionId, SubscriptionId};
use serde::{Deserialize, Serialize};
use serde_json::Value;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum CommandResult {
    SessionList { sessions: Vec<SessionSummary> },
    SessionStatus(SessionSummary),
    SessionSnapshot(SessionSnapshotResult),
    SessionResponded { responded: bool, sent_bytes: usize },
    SessionInterrupted { interrupted: bool },
    SessionController { controller: Option<ControllerSummary> },
    SessionReleased { released: bool },
    SessionRemoved { removed: bool },
    SessionDiagnostics(SessionDiagnostics),
    PtyStarted { session_id: SessionId },
    PtyAttached { latest_cursor: u64 },
    PtyDetached { detached: bool },
    Subscribed { subscribed: bool },
    StreamSubscribed { subscription_id: SubscriptionId, backlog: Vec<Value>, stale: bool },
    Unsubscribed { unsubscribed: bool },
    AgentTools { tools: Vec<AgentToolEntry> },
    PollerStatus { pollers: Vec<PollerStatusEntry> },
    /// Generic passthrough for directory/conversation/task/repository CRUD,
    /// which return the upserted/affected record as-is.
    Record(Value),
}
