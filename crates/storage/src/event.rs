// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! The append-only WAL record type. Every store mutation is first appended
//! here, then folded into [`crate::state::MaterializedState`] — the same
//! event-sourcing shape the daemon's own state store uses, retargeted from
//! jobs/workers/queues to directories/conversations/repositories/tasks.

use crate::types::{
    ConversationRecord, DirectoryRecord, PrRecord, RepositoryRecord, TaskRecord, TelemetryRecord,
};
use sessionmux_core::{DirectoryId, RepositoryId, SessionId, TaskId};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "event")]
pub enum StoreEvent {
    DirectoryUpserted { record: DirectoryRecord },
    DirectoryArchived { directory_id: DirectoryId, at_ms: u64 },
    ConversationUpserted { record: ConversationRecord },
    ConversationArchived { session_id: SessionId, at_ms: u64 },
    ConversationDeleted { session_id: SessionId },
    RepositoryUpserted { record: RepositoryRecord },
    TaskCreated { record: TaskRecord },
    TaskUpdated { record: TaskRecord },
    TasksReordered { directory_id: DirectoryId, task_ids: Vec<TaskId> },
    TelemetryAppended { record: TelemetryRecord },
    PrUpserted { record: PrRecord },
    PrClosed { repository_id: RepositoryId, pr_number: u64 },
    SyncStateWritten { key: String, last_synced_at_ms: u64, last_error: Option<String> },
}
