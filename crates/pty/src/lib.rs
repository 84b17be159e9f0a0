// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

// Allow panic!/unwrap/expect in test code
#![cfg_attr(test, allow(clippy::panic))]
#![cfg_attr(test, allow(clippy::unwrap_used))]
#![cfg_attr(test, allow(clippy::expect_used))]

//! sessionmux-pty: the PTY-session capability (§4.4) the runtime consumes.
//!
//! [`LiveSession`] is the opaque interface; [`ProcessLiveSession`] is the
//! real subprocess-behind-a-PTY implementation, and [`FakeLiveSession`] is
//! an in-memory double for runtime unit tests.

mod event;
mod fake;
mod live_session;
mod process;
mod ring;
mod terminal;

pub use event::LiveSessionEvent;
pub use fake::FakeLiveSession;
pub use live_session::{AttachHandlers, DataChunk, ExitInfo, LiveSession, Snapshot};
pub use process::{ProcessLiveSession, SpawnError, SpawnParams};
