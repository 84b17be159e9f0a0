// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! The command surface: one closed enum per `command` envelope, matching
//! §6's table. Each variant carries only the fields that command needs;
//! fields omitted by the client default via `#[serde(default)]`.

use sessionmux_core::{
    AgentKind, DirectoryId, RepositoryId, SessionId, StreamFilter, SubscriptionId, TaskId,
    TenantId, UserId, WorkspaceId, WorktreeId,
};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum SessionListSort {
    AttentionFirst,
    StartedAsc,
    StartedDesc,
}

impl Default for SessionListSort {
    fn default() -> Self {
        Self::AttentionFirst
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct SessionListFilter {
    pub tenant_id: Option<TenantId>,
    pub user_id: Option<UserId>,
    pub workspace_id: Option<WorkspaceId>,
    pub directory_id: Option<DirectoryId>,
    pub status: Option<sessionmux_core::SessionStatus>,
    pub live: Option<bool>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "command", content = "params")]
#[serde(rename_all = "kebab-case")]
pub enum Command {
    #[serde(rename = "session.list")]
    SessionList {
        #[serde(default)]
        filter: SessionListFilter,
        #[serde(default)]
        sort: SessionListSort,
        #[serde(default)]
        limit: Option<usize>,
        #[serde(default)]
        offset: Option<usize>,
    },

    #[serde(rename = "attention.list")]
    AttentionList {
        #[serde(default)]
        filter: SessionListFilter,
    },

    #[serde(rename = "session.status", rename_all = "camelCase")]
    SessionStatus { session_id: SessionId },

    #[serde(rename = "session.snapshot", rename_all = "camelCase")]
    SessionSnapshot { session_id: SessionId },

    #[serde(rename = "session.respond", rename_all = "camelCase")]
    SessionRespond { session_id: SessionId, text: String },

    #[serde(rename = "session.interrupt", rename_all = "camelCase")]
    SessionInterrupt { session_id: SessionId },

    #[serde(rename = "session.claim", rename_all = "camelCase")]
    SessionClaim {
        session_id: SessionId,
        controller_id: String,
        controller_type: String,
        #[serde(default)]
        controller_label: Option<String>,
        #[serde(default)]
        takeover: bool,
    },

    #[serde(rename = "session.release", rename_all = "camelCase")]
    SessionRelease { session_id: SessionId, #[serde(default)] reason: Option<String> },

    #[serde(rename = "session.remove", rename_all = "camelCase")]
    SessionRemove { session_id: SessionId },

    #[serde(rename = "session.diagnostics", rename_all = "camelCase")]
    SessionDiagnostics { session_id: SessionId },

    #[serde(rename = "pty.start", rename_all = "camelCase")]
    PtyStart {
        session_id: SessionId,
        tenant_id: TenantId,
        user_id: UserId,
        workspace_id: WorkspaceId,
        #[serde(default)]
        directory_id: Option<DirectoryId>,
        #[serde(default)]
        worktree_id: Option<WorktreeId>,
        agent_kind: AgentKind,
    },

    #[serde(rename = "pty.attach", rename_all = "camelCase")]
    PtyAttach { session_id: SessionId, #[serde(default)] since_cursor: Option<u64> },

    #[serde(rename = "pty.detach", rename_all = "camelCase")]
    PtyDetach { session_id: SessionId },

    #[serde(rename = "pty.subscribe-events", rename_all = "camelCase")]
    PtySubscribeEvents { session_id: SessionId },

    #[serde(rename = "pty.unsubscribe-events", rename_all = "camelCase")]
    PtyUnsubscribeEvents { session_id: SessionId },

    #[serde(rename = "stream.subscribe", rename_all = "camelCase")]
    StreamSubscribe {
        #[serde(default)]
        filter: StreamFilter,
        #[serde(default)]
        after_cursor: Option<u64>,
    },

    #[serde(rename = "stream.unsubscribe", rename_all = "camelCase")]
    StreamUnsubscribe { subscription_id: SubscriptionId },

    #[serde(rename = "directory.upsert", rename_all = "camelCase")]
    DirectoryUpsert {
        #[serde(default)]
        directory_id: Option<DirectoryId>,
        tenant_id: TenantId,
        user_id: UserId,
        workspace_id: WorkspaceId,
        cwd: String,
    },

    #[serde(rename = "directory.archive", rename_all = "camelCase")]
    DirectoryArchive { directory_id: DirectoryId },

    #[serde(rename = "conversation.archive", rename_all = "camelCase")]
    ConversationArchive { session_id: SessionId },

    #[serde(rename = "conversation.delete", rename_all = "camelCase")]
    ConversationDelete { session_id: SessionId },

    #[serde(rename = "task.create", rename_all = "camelCase")]
    TaskCreate { directory_id: DirectoryId, title: String },

    #[serde(rename = "task.update", rename_all = "camelCase")]
    TaskUpdate { task_id: TaskId, #[serde(default)] title: Option<String>, #[serde(default)] done: Option<bool> },

    #[serde(rename = "task.reorder", rename_all = "camelCase")]
    TaskReorder { directory_id: DirectoryId, task_ids: Vec<TaskId> },

    #[serde(rename = "repository.upsert", rename_all = "camelCase")]
    RepositoryUpsert {
        #[serde(default)]
        repository_id: Option<RepositoryId>,
        remote_url: String,
    },

    #[serde(rename = "agent.tools.status")]
    AgentToolsStatus,

    #[serde(rename = "poller.status")]
    PollerStatus,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn command_tag_round_trips() {
        let cmd = Command::SessionStatus { session_id: SessionId::new() };
        let json = serde_json::to_string(&cmd).expect("serialize");
        assert!(json.contains("\"command\":\"session.status\""));
        let back: Command = serde_json::from_str(&json).expect("deserialize");
        matches!(back, Command::SessionStatus { .. });
    }

    #[test]
    fn session_list_defaults_sort_to_attention_first() {
        let json = r#"{"command":"session.list","params":{}}"#;
        let cmd: Command = serde_json::from_str(json).expect("deserialize");
        match cmd {
            Command::SessionList { sort, .. } => assert_eq!(sort, SessionListSort::AttentionFirst),
            _ => panic!("wrong variant"),
        }
    }
}
