// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! DTOs returned by command results: summaries, snapshots, controllers.

use sessionmux_core::{
    AgentKind, ConnectionId, DirectoryId, SessionId, SessionStatus, StatusModel, TenantId, UserId,
    WorkspaceId, WorktreeId,
};
use serde::{Deserialize, Serialize};

/// Controller currently permitted to mutate a session, if any.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ControllerSummary {
    pub controller_id: String,
    pub controller_type: String,
    pub controller_label: Option<String>,
    pub connection_id: ConnectionId,
    pub claimed_at_ms: u64,
}

/// One row of `session.list` / `attention.list` results.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionSummary {
    pub session_id: SessionId,
    pub tenant_id: TenantId,
    pub user_id: UserId,
    pub workspace_id: WorkspaceId,
    pub directory_id: Option<DirectoryId>,
    pub worktree_id: Option<WorktreeId>,
    pub agent_kind: AgentKind,
    pub status: SessionStatus,
    pub attention_reason: Option<String>,
    pub last_event_at_ms: Option<u64>,
    pub started_at_ms: u64,
    pub exited_at_ms: Option<u64>,
    pub latest_cursor: u64,
    pub controller: Option<ControllerSummary>,
    pub live: bool,
}

/// Full terminal frame captured via `snapshot()` or on exit.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TerminalSnapshot {
    pub rows: u16,
    pub cols: u16,
    pub cursor_row: u16,
    pub cursor_col: u16,
    pub lines: Vec<String>,
    pub hash: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionSnapshotResult {
    pub session_id: SessionId,
    pub snapshot: Option<TerminalSnapshot>,
    /// True when the session has since produced newer output than the
    /// returned snapshot (e.g. a tombstoned session's last frame).
    pub stale: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusModelResult {
    pub session_id: SessionId,
    #[serde(flatten)]
    pub status_model: StatusModel,
}

/// `agent.tools.status` result: per-kind availability probe.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AgentToolEntry {
    pub agent_kind: AgentKind,
    pub available: bool,
    pub resolved_path: Option<String>,
    pub install_command: Option<String>,
}

/// `poller.status` result: one entry per background poller.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PollerStatusEntry {
    pub name: String,
    pub last_run_at_ms: Option<u64>,
    pub last_error: Option<String>,
    pub consecutive_failures: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionDiagnostics {
    pub session_id: SessionId,
    pub telemetry_ingested_total: u64,
    pub telemetry_retained_total: u64,
    pub telemetry_dropped_total: u64,
    pub fanout_bytes_enqueued_total: u64,
    pub fanout_events_enqueued_total: u64,
    pub fanout_backpressure_signals_total: u64,
    pub fanout_backpressure_disconnects_total: u64,
    pub events_last_60s: u64,
}
