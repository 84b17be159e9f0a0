// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Observed-event union (§4.5) and PTY lifecycle events (§4.4), both closed
//! sum types dispatched by an exhaustive `type` tag.

use sessionmux_core::{
    ConnectionId, DirectoryId, RepositoryId, SessionId, SessionStatus, TaskId,
};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Lifecycle events a [`crate::LiveSessionEvent`]-producing capability emits.
/// Named `PtyEvent` on the wire to match the `pty.event` envelope family.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum PtyLifecycleEvent {
    Notify { message: String },
    TurnCompleted,
    AttentionRequired { reason: String },
    SessionExit { code: Option<i32>, signal: Option<String> },
}

/// Action published on the controller mutex.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ControlAction {
    Claimed,
    TakenOver,
    Released,
}

/// The closed union of everything the observed-event journal can carry.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum ObservedEvent {
    #[serde(rename = "session-status")]
    SessionStatus { session_id: SessionId, status: SessionStatus, attention_reason: Option<String> },

    #[serde(rename = "session-output")]
    SessionOutput { session_id: SessionId, cursor: u64, chunk_base64: String },

    #[serde(rename = "session-event")]
    SessionEvent { session_id: SessionId, event: PtyLifecycleEvent },

    #[serde(rename = "session-key-event")]
    SessionKeyEvent { session_id: SessionId, event_name: String, severity: Option<String>, summary: Option<String> },

    #[serde(rename = "session-prompt-event")]
    SessionPromptEvent { session_id: SessionId, prompt: String },

    #[serde(rename = "session-control")]
    SessionControl {
        session_id: SessionId,
        action: ControlAction,
        previous_controller: Option<String>,
        reason: Option<String>,
    },

    #[serde(rename = "conversation-created")]
    ConversationCreated { session_id: SessionId, record: Value },

    #[serde(rename = "conversation-updated")]
    ConversationUpdated { session_id: SessionId, record: Value },

    #[serde(rename = "conversation-archived")]
    ConversationArchived { session_id: SessionId },

    #[serde(rename = "conversation-deleted")]
    ConversationDeleted { session_id: SessionId },

    #[serde(rename = "directory-upserted")]
    DirectoryUpserted { directory_id: DirectoryId, record: Value },

    #[serde(rename = "directory-archived")]
    DirectoryArchived { directory_id: DirectoryId },

    #[serde(rename = "task-created")]
    TaskCreated { task_id: TaskId, directory_id: DirectoryId, record: Value },

    #[serde(rename = "task-updated")]
    TaskUpdated { task_id: TaskId, record: Value },

    #[serde(rename = "task-reordered")]
    TaskReordered { directory_id: DirectoryId, task_ids: Vec<TaskId> },

    #[serde(rename = "repository-upserted")]
    RepositoryUpserted { repository_id: RepositoryId, record: Value },

    #[serde(rename = "github-pr-upserted")]
    GithubPrUpserted { repository_id: RepositoryId, task_ids: Vec<TaskId>, record: Value },

    #[serde(rename = "github-pr-closed")]
    GithubPrClosed { repository_id: RepositoryId, task_ids: Vec<TaskId>, pr_number: u64 },

    #[serde(rename = "github-pr-jobs-updated")]
    GithubPrJobsUpdated { repository_id: RepositoryId, task_ids: Vec<TaskId>, pr_number: u64, record: Value },

    #[serde(rename = "directory-git-updated")]
    DirectoryGitUpdated { directory_id: DirectoryId, repository_id: Option<RepositoryId>, record: Value },
}

impl ObservedEvent {
    /// Whether this event carries PTY output bytes; used by the filter's
    /// `includeOutput` gate.
    pub fn is_output(&self) -> bool {
        matches!(self, Self::SessionOutput { .. })
    }

    /// Task ids this event carries, for the `taskId` filter fallback rule
    /// ("tasks and PRs match when the event's task/PR-id list contains the
    /// filter value").
    pub fn task_ids(&self) -> &[TaskId] {
        match self {
            Self::TaskCreated { task_id, .. } => std::slice::from_ref(task_id),
            Self::TaskUpdated { task_id, .. } => std::slice::from_ref(task_id),
            Self::TaskReordered { task_ids, .. } => task_ids,
            Self::GithubPrUpserted { task_ids, .. }
            | Self::GithubPrClosed { task_ids, .. }
            | Self::GithubPrJobsUpdated { task_ids, .. } => task_ids,
            _ => &[],
        }
    }

    pub fn repository_id(&self) -> Option<RepositoryId> {
        match self {
            Self::RepositoryUpserted { repository_id, .. } => Some(*repository_id),
            Self::GithubPrUpserted { repository_id, .. }
            | Self::GithubPrClosed { repository_id, .. }
            | Self::GithubPrJobsUpdated { repository_id, .. } => Some(*repository_id),
            Self::DirectoryGitUpdated { repository_id, .. } => *repository_id,
            _ => None,
        }
    }
}

/// The connection-close control-release reason named in §4.2.
pub const CONTROLLER_DISCONNECTED_REASON: &str = "controller-disconnected";

/// Subject of a controller release: the connection that held it.
#[derive(Debug, Clone, Copy)]
pub struct ReleasedController {
    pub connection_id: ConnectionId,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn task_events_expose_task_ids_for_filter_fallback() {
        let task_id = TaskId::new();
        let ev = ObservedEvent::TaskUpdated { task_id, record: Value::Null };
        assert_eq!(ev.task_ids(), &[task_id]);
    }

    #[test]
    fn session_status_is_not_an_output_event() {
        let ev = ObservedEvent::SessionStatus {
            session_id: SessionId::new(),
            status: SessionStatus::Running,
            attention_reason: None,
        };
        assert!(!ev.is_output());
    }
}
