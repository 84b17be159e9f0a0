// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Materialized state folded from [`crate::event::StoreEvent`] replay.

use crate::event::StoreEvent;
use crate::types::{
    ConversationRecord, DirectoryRecord, PrRecord, RepositoryRecord, SyncStateRecord, TaskRecord,
};
use sessionmux_core::{DirectoryId, RepositoryId, SessionId, TaskId};
use std::collections::{HashMap, HashSet};

#[derive(Debug, Default)]
pub struct MaterializedState {
    pub directories: HashMap<DirectoryId, DirectoryRecord>,
    pub conversations: HashMap<SessionId, ConversationRecord>,
    pub repositories_by_url: HashMap<String, RepositoryRecord>,
    pub tasks: HashMap<TaskId, TaskRecord>,
    pub telemetry_fingerprints: HashSet<String>,
    pub prs: HashMap<(RepositoryId, u64), PrRecord>,
    pub sync_states: HashMap<String, SyncStateRecord>,
}

impl MaterializedState {
    /// Applies one WAL event. All handlers are idempotent: replaying the
    /// same event twice must leave the state identical to replaying it once.
    pub fn apply(&mut self, event: &StoreEvent) {
        match event {
            StoreEvent::DirectoryUpserted { record } => {
                self.directories.insert(record.directory_id, record.clone());
            }
            StoreEvent::DirectoryArchived { directory_id, at_ms } => {
                if let Some(dir) = self.directories.get_mut(directory_id) {
                    dir.archived_at_ms = Some(*at_ms);
                }
            }
            StoreEvent::ConversationUpserted { record } => {
                self.conversations.insert(record.conversation_id, record.clone());
            }
            StoreEvent::ConversationArchived { session_id, at_ms } => {
                if let Some(conv) = self.conversations.get_mut(session_id) {
                    conv.archived_at_ms = Some(*at_ms);
                }
            }
            StoreEvent::ConversationDeleted { session_id } => {
                self.conversations.remove(session_id);
            }
            StoreEvent::RepositoryUpserted { record } => {
                self.repositories_by_url.insert(record.remote_url.clone(), record.clone());
            }
            StoreEvent::TaskCreated { record } | StoreEvent::TaskUpdated { record } => {
                self.tasks.insert(record.task_id, record.clone());
            }
            StoreEvent::TasksReordered { task_ids, .. } => {
                for (i, task_id) in task_ids.iter().enumerate() {
                    if let Some(task) = self.tasks.get_mut(task_id) {
                        task.order = i as u32;
                    }
                }
            }
            StoreEvent::TelemetryAppended { record } => {
                self.telemetry_fingerprints.insert(record.fingerprint.clone());
            }
            StoreEvent::PrUpserted { record } => {
                self.prs.insert((record.repository_id, record.pr_number), record.clone());
            }
            StoreEvent::PrClosed { repository_id, pr_number } => {
                if let Some(pr) = self.prs.get_mut(&(*repository_id, *pr_number)) {
                    pr.closed = true;
                }
            }
            StoreEvent::SyncStateWritten { key, last_synced_at_ms, last_error } => {
                self.sync_states.insert(
                    key.clone(),
                    SyncStateRecord {
                        key: key.clone(),
                        last_synced_at_ms: *last_synced_at_ms,
                        last_error: last_error.clone(),
                    },
                );
            }
        }
    }
}
