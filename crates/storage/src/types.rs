// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Record shapes the state store persists (§3's data model, read-side).

use sessionmux_core::{
    AgentKind, DirectoryId, ExitRecord, RepositoryId, SessionId, SessionStatus, TaskId, TenantId,
    UserId, WorkspaceId,
};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DirectoryRecord {
    pub directory_id: DirectoryId,
    pub tenant_id: TenantId,
    pub user_id: UserId,
    pub workspace_id: WorkspaceId,
    pub cwd: String,
    pub archived_at_ms: Option<u64>,
}

/// The persisted conversation, the read-side contract the core consumes and
/// writes back to on every status/adapter-state change (§3).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConversationRecord {
    pub conversation_id: SessionId,
    pub directory_id: Option<DirectoryId>,
    pub tenant_id: TenantId,
    pub user_id: UserId,
    pub workspace_id: WorkspaceId,
    pub agent_type: AgentKind,
    pub title: Option<String>,
    pub runtime_status: Option<SessionStatus>,
    pub runtime_last_event_at_ms: Option<u64>,
    pub runtime_attention_reason: Option<String>,
    pub runtime_last_exit: Option<ExitRecord>,
    /// Opaque per-agent bag; the core only reads `codex.resumeSessionId`.
    #[serde(default)]
    pub adapter_state: serde_json::Value,
    pub archived_at_ms: Option<u64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RepositoryRecord {
    pub repository_id: RepositoryId,
    /// Normalized remote URL; the dedup key for upserts.
    pub remote_url: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskRecord {
    pub task_id: TaskId,
    pub directory_id: DirectoryId,
    pub title: String,
    pub done: bool,
    pub order: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum TelemetrySource {
    History,
    OtlpLog,
    OtlpMetric,
    OtlpTrace,
}

/// Telemetry ingested via §4.6/§4.7. `fingerprint` is the dedupe key.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TelemetryRecord {
    pub source: TelemetrySource,
    pub session_id: Option<SessionId>,
    pub provider_thread_id: Option<String>,
    pub event_name: Option<String>,
    pub severity: Option<String>,
    pub summary: Option<String>,
    pub observed_at_ms: u64,
    pub fingerprint: String,
    pub payload: serde_json::Value,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PrRecord {
    pub repository_id: RepositoryId,
    pub pr_number: u64,
    pub task_ids: Vec<TaskId>,
    pub status_rollup: serde_json::Value,
    pub jobs: serde_json::Value,
    pub closed: bool,
}

/// One `(directory, repository, branch)` sync attempt's last outcome.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncStateRecord {
    pub key: String,
    pub last_synced_at_ms: u64,
    pub last_error: Option<String>,
}
