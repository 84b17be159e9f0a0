// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! The `(tenant, user, workspace, directory?, conversation?)` tuple attached
//! to every observed event, and the equality-conjunction filter that stream
//! subscriptions match against it.

use crate::ids::{DirectoryId, RepositoryId, SessionId, TaskId, TenantId, UserId, WorkspaceId};
use serde::{Deserialize, Serialize};

/// Scope attached to a published observed event.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Scope {
    pub tenant_id: Option<TenantId>,
    pub user_id: Option<UserId>,
    pub workspace_id: Option<WorkspaceId>,
    pub directory_id: Option<DirectoryId>,
    pub conversation_id: Option<SessionId>,
}

impl Scope {
    pub fn for_session(
        tenant_id: TenantId,
        user_id: UserId,
        workspace_id: WorkspaceId,
        directory_id: Option<DirectoryId>,
        conversation_id: SessionId,
    ) -> Self {
        Self {
            tenant_id: Some(tenant_id),
            user_id: Some(user_id),
            workspace_id: Some(workspace_id),
            directory_id,
            conversation_id: Some(conversation_id),
        }
    }
}

/// A stream subscription's filter: a conjunction of equality tests.
///
/// A `None` field is unconstrained. `include_output` additionally gates
/// `session-output` events, which are otherwise excluded regardless of the
/// other fields matching.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StreamFilter {
    pub tenant_id: Option<TenantId>,
    pub user_id: Option<UserId>,
    pub workspace_id: Option<WorkspaceId>,
    pub directory_id: Option<DirectoryId>,
    pub conversation_id: Option<SessionId>,
    pub repository_id: Option<RepositoryId>,
    pub task_id: Option<TaskId>,
    #[serde(default)]
    pub include_output: bool,
}

/// Per-event-kind scope carried alongside the publish-time [`Scope`], used
/// when an event kind naturally carries its own ids (e.g. a task event
/// carrying a list of task ids) that the plain publish scope can't express.
#[derive(Debug, Clone, Default)]
pub struct MatchContext<'a> {
    pub scope: &'a Scope,
    pub task_ids: &'a [TaskId],
    pub repository_id: Option<RepositoryId>,
    pub is_output_event: bool,
}

impl StreamFilter {
    /// True if every set field of this filter is satisfied by `ctx`.
    pub fn matches(&self, ctx: &MatchContext<'_>) -> bool {
        if ctx.is_output_event && !self.include_output {
            return false;
        }
        field_matches(&self.tenant_id, &ctx.scope.tenant_id)
            && field_matches(&self.user_id, &ctx.scope.user_id)
            && field_matches(&self.workspace_id, &ctx.scope.workspace_id)
            && field_matches(&self.directory_id, &ctx.scope.directory_id)
            && field_matches(&self.conversation_id, &ctx.scope.conversation_id)
            && repository_matches(self.repository_id, ctx)
            && task_matches(self.task_id, ctx)
    }
}

fn field_matches<T: PartialEq>(filter: &Option<T>, actual: &Option<T>) -> bool {
    match filter {
        None => true,
        Some(want) => actual.as_ref() == Some(want),
    }
}

fn repository_matches(filter: Option<RepositoryId>, ctx: &MatchContext<'_>) -> bool {
    match filter {
        None => true,
        Some(want) => ctx.repository_id == Some(want),
    }
}

fn task_matches(filter: Option<TaskId>, ctx: &MatchContext<'_>) -> bool {
    match filter {
        None => true,
        Some(want) => ctx.task_ids.contains(&want),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unset_filter_matches_everything_non_output() {
        let scope = Scope::default();
        let ctx = MatchContext { scope: &scope, task_ids: &[], repository_id: None, is_output_event: false };
        assert!(StreamFilter::default().matches(&ctx));
    }

    #[test]
    fn output_events_require_include_output() {
        let scope = Scope::default();
        let ctx = MatchContext { scope: &scope, task_ids: &[], repository_id: None, is_output_event: true };
        assert!(!StreamFilter::default().matches(&ctx));
        let filter = StreamFilter { include_output: true, ..Default::default() };
        assert!(filter.matches(&ctx));
    }

    #[test]
    fn unrelated_field_only_matches_when_event_carries_it() {
        let scope = Scope::default();
        let ctx = MatchContext { scope: &scope, task_ids: &[], repository_id: None, is_output_event: false };
        let filter = StreamFilter { task_id: Some(TaskId::new()), ..Default::default() };
        assert!(!filter.matches(&ctx));
    }
}
