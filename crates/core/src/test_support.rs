// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Shared test helpers for use across crates.
//!
//! Gated behind `#[cfg(any(test, feature = "test-support"))]`.

use crate::ids::{DirectoryId, SessionId, TenantId, UserId, WorkspaceId};
use crate::scope::Scope;

/// A scope with freshly minted ids, for tests that don't care about exact
/// identity but need a plausible, fully-populated `Scope`.
pub fn arbitrary_scope() -> Scope {
    Scope::for_session(TenantId::new(), UserId::new(), WorkspaceId::new(), Some(DirectoryId::new()), SessionId::new())
}

/// Proptest strategies for core types.
#[cfg(feature = "test-support")]
pub mod strategies {
    use crate::status::SessionStatus;
    use proptest::prelude::*;

    pub fn arb_session_status() -> impl Strategy<Value = SessionStatus> {
        prop_oneof![
            Just(SessionStatus::Running),
            Just(SessionStatus::NeedsInput),
            Just(SessionStatus::Completed),
            Just(SessionStatus::Exited),
        ]
    }
}
