// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Lifecycle events a [`crate::LiveSession`] emits on its event channel (§4.4).

/// One lifecycle notification from a live session. The runtime translates
/// these into `wire::PtyLifecycleEvent` for the `pty.event` envelope and
/// into observed events for the journal.
#[derive(Debug, Clone)]
pub enum LiveSessionEvent {
    Notify { message: String },
    TurnCompleted,
    AttentionRequired { reason: String },
    SessionExit { code: Option<i32>, signal: Option<String> },
}
