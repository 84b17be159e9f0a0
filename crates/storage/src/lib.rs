// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

// Allow panic!/unwrap/expect in test code
#![cfg_attr(test, allow(clippy::panic))]
#![cfg_attr(test, allow(clippy::unwrap_used))]
#![cfg_attr(test, allow(clippy::expect_used))]

//! sessionmux-storage: the persistence contract (§2 component 3) — the
//! operations the daemon invokes against directories, conversations,
//! repositories, tasks, telemetry, and external-integration state, plus a
//! WAL-backed reference implementation. The on-disk schema itself is
//! intentionally not part of the contract: callers depend on
//! [`StateStore`], not on [`MemoryStateStore`]'s file layout.

mod error;
mod event;
mod state;
mod store;
mod types;
mod wal;

pub use error::StorageError;
pub use event::StoreEvent;
pub use state::MaterializedState;
pub use store::{MemoryStateStore, StateStore};
pub use types::{
    ConversationRecord, DirectoryRecord, PrRecord, RepositoryRecord, SyncStateRecord, TaskRecord,
    TelemetryRecord, TelemetrySource,
};
pub use wal::Wal;
