// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! The state-store contract (§1: "the persistence operations the core
//! invokes, not the storage schema itself") plus a WAL-backed in-process
//! implementation.

use crate::error::StorageError;
use crate::event::StoreEvent;
use crate::state::MaterializedState;
use crate::types::{
    ConversationRecord, DirectoryRecord, PrRecord, RepositoryRecord, TaskRecord, TelemetryRecord,
};
use crate::wal::Wal;
use async_trait::async_trait;
use sessionmux_core::{DirectoryId, RepositoryId, SessionId, TaskId};
use parking_lot::Mutex;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};

/// Transactional persistence of directories, conversations, repositories,
/// tasks, telemetry, and external-integration snapshots (§2 component 3).
/// De-duplicating upserts are keyed by stable ids; telemetry additionally
/// dedupes by fingerprint.
#[async_trait]
pub trait StateStore: Send + Sync {
    async fn upsert_directory(&self, record: DirectoryRecord) -> Result<DirectoryRecord, StorageError>;
    async fn archive_directory(&self, directory_id: DirectoryId, at_ms: u64) -> Result<(), StorageError>;
    async fn get_directory(&self, directory_id: DirectoryId) -> Result<Option<DirectoryRecord>, StorageError>;
    async fn list_directories(&self, include_archived: bool) -> Result<Vec<DirectoryRecord>, StorageError>;

    async fn upsert_conversation(&self, record: ConversationRecord) -> Result<ConversationRecord, StorageError>;
    async fn get_conversation(&self, session_id: SessionId) -> Result<Option<ConversationRecord>, StorageError>;
    async fn list_conversations(&self, include_archived: bool) -> Result<Vec<ConversationRecord>, StorageError>;
    async fn archive_conversation(&self, session_id: SessionId, at_ms: u64) -> Result<(), StorageError>;
    async fn delete_conversation(&self, session_id: SessionId) -> Result<(), StorageError>;

    async fn upsert_repository(
        &self,
        repository_id: Option<RepositoryId>,
        remote_url: String,
    ) -> Result<RepositoryRecord, StorageError>;
    async fn get_repository_by_remote_url(&self, remote_url: &str) -> Result<Option<RepositoryRecord>, StorageError>;

    async fn create_task(&self, task: TaskRecord) -> Result<TaskRecord, StorageError>;
    async fn update_task(&self, task_id: TaskId, title: Option<String>, done: Option<bool>) -> Result<TaskRecord, StorageError>;
    async fn reorder_tasks(&self, directory_id: DirectoryId, task_ids: Vec<TaskId>) -> Result<(), StorageError>;
    async fn list_tasks(&self, directory_id: DirectoryId) -> Result<Vec<TaskRecord>, StorageError>;
    async fn get_task(&self, task_id: TaskId) -> Result<Option<TaskRecord>, StorageError>;

    /// Returns `Ok(true)` when newly inserted, `Ok(false)` when the
    /// fingerprint already existed (a dedupe-rejected duplicate).
    async fn append_telemetry(&self, record: TelemetryRecord) -> Result<bool, StorageError>;

    async fn upsert_pr(&self, record: PrRecord) -> Result<PrRecord, StorageError>;
    async fn close_pr(&self, repository_id: RepositoryId, pr_number: u64) -> Result<(), StorageError>;
    async fn write_sync_state(&self, key: String, last_synced_at_ms: u64, last_error: Option<String>) -> Result<(), StorageError>;

    /// Begins shutdown. After this resolves, every operation above returns
    /// [`StorageError::Closed`].
    async fn close(&self) -> Result<(), StorageError>;
}

/// WAL-backed in-process implementation. This crate deliberately does not
/// prescribe an on-disk schema beyond "one JSON event per line" — the spec
/// scopes the concrete storage engine out; this is the reference store the
/// rest of the workspace runs against.
pub struct MemoryStateStore {
    state: Mutex<MaterializedState>,
    wal: Option<Mutex<Wal>>,
    closed: AtomicBool,
}

impl MemoryStateStore {
    /// Pure in-memory store with no WAL durability; used in tests.
    pub fn in_memory() -> Self {
        Self { state: Mutex::new(MaterializedState::default()), wal: None, closed: AtomicBool::new(false) }
    }

    /// Opens (and replays) a WAL-backed store at `path`.
    pub fn open(path: impl Into<PathBuf>) -> Result<Self, StorageError> {
        let path = path.into();
        let events = Wal::replay(&path)?;
        let mut state = MaterializedState::default();
        for event in &events {
            state.apply(event);
        }
        let wal = Wal::open(&path)?;
        Ok(Self { state: Mutex::new(state), wal: Some(Mutex::new(wal)), closed: AtomicBool::new(false) })
    }

    fn check_open(&self) -> Result<(), StorageError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(StorageError::Closed);
        }
        Ok(())
    }

    fn commit(&self, event: StoreEvent) -> Result<(), StorageError> {
        if let Some(wal) = &self.wal {
            let mut wal = wal.lock();
            wal.append(&event)?;
            wal.flush()?;
        }
        self.state.lock().apply(&event);
        Ok(())
    }
}

#[async_trait]
impl StateStore for MemoryStateStore {
    async fn upsert_directory(&self, record: DirectoryRecord) -> Result<DirectoryRecord, StorageError> {
        self.check_open()?;
        self.commit(StoreEvent::DirectoryUpserted { record: record.clone() })?;
        Ok(record)
    }

    async fn archive_directory(&self, directory_id: DirectoryId, at_ms: u64) -> Result<(), StorageError> {
        self.check_open()?;
        self.commit(StoreEvent::DirectoryArchived { directory_id, at_ms })
    }

    async fn get_directory(&self, directory_id: DirectoryId) -> Result<Option<DirectoryRecord>, StorageError> {
        self.check_open()?;
        Ok(self.state.lock().directories.get(&directory_id).cloned())
    }

    async fn list_directories(&self, include_archived: bool) -> Result<Vec<DirectoryRecord>, StorageError> {
        self.check_open()?;
        Ok(self
            .state
            .lock()
            .directories
            .values()
            .filter(|d| include_archived || d.archived_at_ms.is_none())
            .cloned()
            .collect())
    }

    async fn upsert_conversation(&self, record: ConversationRecord) -> Result<ConversationRecord, StorageError> {
        self.check_open()?;
        self.commit(StoreEvent::ConversationUpserted { record: record.clone() })?;
        Ok(record)
    }

    async fn get_conversation(&self, session_id: SessionId) -> Result<Option<ConversationRecord>, StorageError> {
        self.check_open()?;
        Ok(self.state.lock().conversations.get(&session_id).cloned())
    }

    async fn list_conversations(&self, include_archived: bool) -> Result<Vec<ConversationRecord>, StorageError> {
        self.check_open()?;
        Ok(self
            .state
            .lock()
            .conversations
            .values()
            .filter(|c| include_archived || c.archived_at_ms.is_none())
            .cloned()
            .collect())
    }

    async fn archive_conversation(&self, session_id: SessionId, at_ms: u64) -> Result<(), StorageError> {
        self.check_open()?;
        self.commit(StoreEvent::ConversationArchived { session_id, at_ms })
    }

    async fn delete_conversation(&self, session_id: SessionId) -> Result<(), StorageError> {
        self.check_open()?;
        self.commit(StoreEvent::ConversationDeleted { session_id })
    }

    async fn upsert_repository(
        &self,
        repository_id: Option<RepositoryId>,
        remote_url: String,
    ) -> Result<RepositoryRecord, StorageError> {
        self.check_open()?;
        // Reuse the previous repository id for this URL when unchanged (§4.7).
        let repository_id = repository_id
            .or_else(|| self.state.lock().repositories_by_url.get(&remote_url).map(|r| r.repository_id))
            .unwrap_or_else(RepositoryId::new);
        let record = RepositoryRecord { repository_id, remote_url };
        self.commit(StoreEvent::RepositoryUpserted { record: record.clone() })?;
        Ok(record)
    }

    async fn get_repository_by_remote_url(&self, remote_url: &str) -> Result<Option<RepositoryRecord>, StorageError> {
        self.check_open()?;
        Ok(self.state.lock().repositories_by_url.get(remote_url).cloned())
    }

    async fn create_task(&self, task: TaskRecord) -> Result<TaskRecord, StorageError> {
        self.check_open()?;
        self.commit(StoreEvent::TaskCreated { record: task.clone() })?;
        Ok(task)
    }

    async fn update_task(&self, task_id: TaskId, title: Option<String>, done: Option<bool>) -> Result<TaskRecord, StorageError> {
        self.check_open()?;
        let mut task = self.state.lock().tasks.get(&task_id).cloned().ok_or(StorageError::NotFound)?;
        if let Some(title) = title {
            task.title = title;
        }
        if let Some(done) = done {
            task.done = done;
        }
        self.commit(StoreEvent::TaskUpdated { record: task.clone() })?;
        Ok(task)
    }

    async fn reorder_tasks(&self, directory_id: DirectoryId, task_ids: Vec<TaskId>) -> Result<(), StorageError> {
        self.check_open()?;
        self.commit(StoreEvent::TasksReordered { directory_id, task_ids })
    }

    async fn list_tasks(&self, directory_id: DirectoryId) -> Result<Vec<TaskRecord>, StorageError> {
        self.check_open()?;
        let mut tasks: Vec<TaskRecord> =
            self.state.lock().tasks.values().filter(|t| t.directory_id == directory_id).cloned().collect();
        tasks.sort_by_key(|t| t.order);
        Ok(tasks)
    }

    async fn get_task(&self, task_id: TaskId) -> Result<Option<TaskRecord>, StorageError> {
        self.check_open()?;
        Ok(self.state.lock().tasks.get(&task_id).cloned())
    }

    async fn append_telemetry(&self, record: TelemetryRecord) -> Result<bool, StorageError> {
        self.check_open()?;
        if self.state.lock().telemetry_fingerprints.contains(&record.fingerprint) {
            return Ok(false);
        }
        self.commit(StoreEvent::TelemetryAppended { record })?;
        Ok(true)
    }

    async fn upsert_pr(&self, record: PrRecord) -> Result<PrRecord, StorageError> {
        self.check_open()?;
        self.commit(StoreEvent::PrUpserted { record: record.clone() })?;
        Ok(record)
    }

    async fn close_pr(&self, repository_id: RepositoryId, pr_number: u64) -> Result<(), StorageError> {
        self.check_open()?;
        self.commit(StoreEvent::PrClosed { repository_id, pr_number })
    }

    async fn write_sync_state(&self, key: String, last_synced_at_ms: u64, last_error: Option<String>) -> Result<(), StorageError> {
        self.check_open()?;
        self.commit(StoreEvent::SyncStateWritten { key, last_synced_at_ms, last_error })
    }

    async fn close(&self) -> Result<(), StorageError> {
        self.closed.store(true, Ordering::SeqCst);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sessionmux_core::{AgentKind, TenantId, UserId, WorkspaceId};

    fn sample_conversation() -> ConversationRecord {
        ConversationRecord {
            conversation_id: SessionId::new(),
            directory_id: None,
            tenant_id: TenantId::new(),
            user_id: UserId::new(),
            workspace_id: WorkspaceId::new(),
            agent_type: AgentKind::Terminal,
            title: None,
            runtime_status: None,
            runtime_last_event_at_ms: None,
            runtime_attention_reason: None,
            runtime_last_exit: None,
            adapter_state: serde_json::Value::Null,
            archived_at_ms: None,
        }
    }

    #[tokio::test]
    async fn closed_store_rejects_further_operations() {
        let store = MemoryStateStore::in_memory();
        store.close().await.expect("close");
        let err = store.upsert_conversation(sample_conversation()).await.unwrap_err();
        assert!(matches!(err, StorageError::Closed));
    }

    #[tokio::test]
    async fn telemetry_dedupes_by_fingerprint() {
        let store = MemoryStateStore::in_memory();
        let record = TelemetryRecord {
            source: crate::types::TelemetrySource::OtlpLog,
            session_id: None,
            provider_thread_id: None,
            event_name: Some("codex.user_prompt".into()),
            severity: None,
            summary: None,
            observed_at_ms: 1,
            fingerprint: "fp-1".into(),
            payload: serde_json::Value::Null,
        };
        assert!(store.append_telemetry(record.clone()).await.expect("first"));
        assert!(!store.append_telemetry(record).await.expect("dup"));
    }

    #[tokio::test]
    async fn repository_upsert_reuses_id_for_unchanged_url() {
        let store = MemoryStateStore::in_memory();
        let first = store.upsert_repository(None, "https://example.com/r".into()).await.expect("first");
        let second = store.upsert_repository(None, "https://example.com/r".into()).await.expect("second");
        assert_eq!(first.repository_id, second.repository_id);
    }

    #[tokio::test]
    async fn wal_backed_store_survives_reopen() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("store.wal");
        let conversation = sample_conversation();
        {
            let store = MemoryStateStore::open(&path).expect("open");
            store.upsert_conversation(conversation.clone()).await.expect("upsert");
        }
        let reopened = MemoryStateStore::open(&path).expect("reopen");
        let fetched = reopened.get_conversation(conversation.conversation_id).await.expect("get").expect("present");
        assert_eq!(fetched.conversation_id, conversation.conversation_id);
    }
}
