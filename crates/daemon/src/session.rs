// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! The session runtime (§4.3): the in-memory table of live and tombstoned
//! sessions, the claim mutex, the status engine, and the bridge from a
//! [`LiveSession`]'s event channel into the observed-event journal.

use crate::error::SessionError;
use crate::journal::Journal;
use parking_lot::Mutex;
use sessionmux_core::{
    AgentKind, AttachmentId, Clock, ConnectionId, DirectoryId, ExitRecord, Scope, SessionId,
    SessionStatus, StatusHint, StatusModel, TenantId, UserId, WorkspaceId, WorktreeId,
};
use sessionmux_pty::{AttachHandlers, LiveSession, SpawnParams};
use sessionmux_storage::{ConversationRecord, StateStore};
use sessionmux_wire::{ControlAction, ControllerSummary, ObservedEvent, PtyLifecycleEvent, SessionSummary};
use std::collections::HashMap;
use std::sync::Arc;

/// Controller currently permitted to mutate a session (§4.3's claim mutex).
#[derive(Debug, Clone)]
struct Controller {
    controller_id: String,
    controller_type: String,
    controller_label: Option<String>,
    connection_id: ConnectionId,
    claimed_at_ms: u64,
}

impl Controller {
    fn label(&self) -> String {
        self.controller_label.clone().unwrap_or_else(|| format!("{}:{}", self.controller_type, self.controller_id))
    }

    fn summary(&self) -> ControllerSummary {
        ControllerSummary {
            controller_id: self.controller_id.clone(),
            controller_type: self.controller_type.clone(),
            controller_label: self.controller_label.clone(),
            connection_id: self.connection_id,
            claimed_at_ms: self.claimed_at_ms,
        }
    }
}

#[derive(Debug, Default)]
struct DiagnosticCounters {
    telemetry_ingested_total: u64,
    telemetry_retained_total: u64,
    telemetry_dropped_total: u64,
    fanout_bytes_enqueued_total: u64,
    fanout_events_enqueued_total: u64,
    fanout_backpressure_signals_total: u64,
    fanout_backpressure_disconnects_total: u64,
    event_timestamps_ms: std::collections::VecDeque<u64>,
}

impl DiagnosticCounters {
    fn note_event(&mut self, now_ms: u64) {
        self.event_timestamps_ms.push_back(now_ms);
        while let Some(&front) = self.event_timestamps_ms.front() {
            if now_ms.saturating_sub(front) > 60_000 {
                self.event_timestamps_ms.pop_front();
            } else {
                break;
            }
        }
    }

    fn events_last_60s(&self, now_ms: u64) -> u64 {
        self.event_timestamps_ms.iter().filter(|&&ts| now_ms.saturating_sub(ts) <= 60_000).count() as u64
    }
}

struct SessionEntry {
    session_id: SessionId,
    tenant_id: TenantId,
    user_id: UserId,
    workspace_id: WorkspaceId,
    directory_id: Option<DirectoryId>,
    worktree_id: Option<WorktreeId>,
    agent_kind: AgentKind,
    live: Option<Arc<dyn LiveSession>>,
    status_model: StatusModel,
    started_at_ms: u64,
    exited_at_ms: Option<u64>,
    controller: Option<Controller>,
    diagnostics: DiagnosticCounters,
    last_snapshot: Option<sessionmux_wire::TerminalSnapshot>,
    /// Connections subscribed to this session's raw `pty.event` lifecycle
    /// stream via `pty.subscribe-events` (§4.4) — distinct from the
    /// journal's `stream.subscribe` fan-out.
    event_subscribers: std::collections::HashSet<ConnectionId>,
}

impl SessionEntry {
    fn scope(&self) -> Scope {
        Scope::for_session(self.tenant_id, self.user_id, self.workspace_id, self.directory_id, self.session_id)
    }

    fn summary(&self, now_ms: u64) -> SessionSummary {
        SessionSummary {
            session_id: self.session_id,
            tenant_id: self.tenant_id,
            user_id: self.user_id,
            workspace_id: self.workspace_id,
            directory_id: self.directory_id,
            worktree_id: self.worktree_id,
            agent_kind: self.agent_kind,
            status: self.status_model.status,
            attention_reason: self.status_model.attention_reason.clone(),
            last_event_at_ms: self.status_model.last_event_at_ms,
            started_at_ms: self.started_at_ms,
            exited_at_ms: self.exited_at_ms,
            latest_cursor: self.live.as_ref().map(|l| l.latest_cursor()).unwrap_or(0),
            controller: self.controller.as_ref().map(Controller::summary),
            live: self.live.is_some(),
        }
    }

    fn is_tombstoned(&self) -> bool {
        self.live.is_none()
    }
}

/// Resolves the launch program for an agent kind. Terminal sessions use the
/// user's shell; the rest shell out to the agent CLI assumed to be on PATH
/// (availability is probed separately by `agent.tools.status`).
pub fn launch_command_for(agent_kind: AgentKind, cwd: Option<std::path::PathBuf>, rows: u16, cols: u16) -> SpawnParams {
    let (program, args) = match agent_kind {
        AgentKind::Codex => ("codex".to_string(), vec![]),
        AgentKind::Claude => ("claude".to_string(), vec![]),
        AgentKind::Cursor => ("cursor-agent".to_string(), vec![]),
        AgentKind::Critique => ("critique".to_string(), vec![]),
        AgentKind::Terminal => (std::env::var("SHELL").unwrap_or_else(|_| "/bin/sh".to_string()), vec![]),
    };
    SpawnParams { program, args, cwd, env: Vec::new(), rows, cols }
}

fn resolve_on_path(program: &str) -> Option<String> {
    if program.contains('/') {
        return std::path::Path::new(program).is_file().then(|| program.to_string());
    }
    let path = std::env::var_os("PATH")?;
    std::env::split_paths(&path).map(|dir| dir.join(program)).find(|candidate| candidate.is_file()).map(|p| p.to_string_lossy().into_owned())
}

/// `agent.tools.status` (§6): a PATH-availability probe per agent kind.
/// Never spawns a subprocess — resolution only, matching the wire
/// contract's "the daemon does not execute `--version` checks" note.
pub fn probe_agent_tools() -> Vec<sessionmux_wire::AgentToolEntry> {
    [AgentKind::Codex, AgentKind::Claude, AgentKind::Cursor, AgentKind::Critique, AgentKind::Terminal]
        .into_iter()
        .map(|agent_kind| {
            let spawn = launch_command_for(agent_kind, None, 24, 80);
            let resolved_path = resolve_on_path(&spawn.program);
            let install_command = match agent_kind {
                AgentKind::Codex => Some("npm install -g @openai/codex".to_string()),
                AgentKind::Claude => Some("npm install -g @anthropic-ai/claude-code".to_string()),
                AgentKind::Cursor => Some("curl https://cursor.com/install -fsS | bash".to_string()),
                AgentKind::Critique => None,
                AgentKind::Terminal => None,
            };
            sessionmux_wire::AgentToolEntry { agent_kind, available: resolved_path.is_some(), resolved_path, install_command }
        })
        .collect()
}

/// Parameters for starting a new session, mirroring the `pty.start` command.
pub struct StartParams {
    pub session_id: SessionId,
    pub tenant_id: TenantId,
    pub user_id: UserId,
    pub workspace_id: WorkspaceId,
    pub directory_id: Option<DirectoryId>,
    pub worktree_id: Option<WorktreeId>,
    pub agent_kind: AgentKind,
}

/// The in-memory session table plus the operations every command in §6's
/// `session.*`/`pty.*` family reduces to. Owns the single writer lock for
/// session state (§5's single-writer-per-session discipline).
pub struct SessionRuntime<C: Clock> {
    sessions: Mutex<HashMap<SessionId, SessionEntry>>,
    store: Arc<dyn StateStore>,
    journal: Arc<Mutex<Journal>>,
    clock: C,
    tombstone_ttl_ms: u64,
    connections: Arc<crate::connection::ConnectionRegistry>,
    hooks: crate::hooks::HooksRuntime,
}

impl<C: Clock + 'static> SessionRuntime<C> {
    pub fn new(
        store: Arc<dyn StateStore>,
        journal: Arc<Mutex<Journal>>,
        clock: C,
        tombstone_ttl_ms: u64,
        connections: Arc<crate::connection::ConnectionRegistry>,
        hooks: crate::hooks::HooksRuntime,
    ) -> Self {
        Self { sessions: Mutex::new(HashMap::new()), store, journal, clock, tombstone_ttl_ms, connections, hooks }
    }

    /// Publishes `event` under `scope` (§4.5): assigns the journal cursor,
    /// fans `stream.event` out to every matching subscription's connection,
    /// and hands the entry to the lifecycle-hooks runtime. Called from every
    /// state transition and command side effect in this module.
    fn publish(&self, scope: Scope, event: ObservedEvent) {
        let (entry, targets) = self.journal.lock().publish(scope, event);
        for target in &targets {
            self.connections.send_stream_event(target.connection_id, target.subscription_id, entry.cursor, &entry.event);
        }
        self.hooks.notify(&entry.event);
    }

    /// Fans a raw `pty.event` lifecycle record out to every connection that
    /// subscribed via `pty.subscribe-events` (§4.4), independent of the
    /// journal's `stream.subscribe` path.
    fn fanout_pty_event(&self, session_id: SessionId, event: &PtyLifecycleEvent) {
        let subscribers: Vec<ConnectionId> = {
            let sessions = self.sessions.lock();
            sessions.get(&session_id).map(|e| e.event_subscribers.iter().copied().collect()).unwrap_or_default()
        };
        for connection_id in subscribers {
            self.connections.send_pty_event(connection_id, session_id, event.clone());
        }
    }

    /// `pty.subscribe-events` (§6): registers `connection_id` to receive raw
    /// `pty.event` lifecycle records for `session_id`.
    pub fn subscribe_events(&self, session_id: SessionId, connection_id: ConnectionId) -> Result<(), SessionError> {
        let mut sessions = self.sessions.lock();
        let entry = sessions.get_mut(&session_id).ok_or_else(|| SessionError::NotFound(session_id.as_str().to_string()))?;
        entry.event_subscribers.insert(connection_id);
        Ok(())
    }

    pub fn unsubscribe_events(&self, session_id: SessionId, connection_id: ConnectionId) -> Result<(), SessionError> {
        let mut sessions = self.sessions.lock();
        let entry = sessions.get_mut(&session_id).ok_or_else(|| SessionError::NotFound(session_id.as_str().to_string()))?;
        entry.event_subscribers.remove(&connection_id);
        Ok(())
    }

    /// Removes a closing connection from every session's `pty.event`
    /// subscriber set (§4.2's shutdown side effects).
    pub fn remove_event_subscriber_everywhere(&self, connection_id: ConnectionId) {
        let mut sessions = self.sessions.lock();
        for entry in sessions.values_mut() {
            entry.event_subscribers.remove(&connection_id);
        }
    }

    /// Registers a newly spawned live session (already bridged to a PTY by
    /// the caller) and persists its conversation record. Rejects a
    /// duplicate `session_id` (§6's `session already exists`).
    pub async fn start(&self, params: StartParams, live: Arc<dyn LiveSession>) -> Result<(), SessionError> {
        {
            let sessions = self.sessions.lock();
            if sessions.contains_key(&params.session_id) {
                return Err(SessionError::AlreadyExists(params.session_id.as_str().to_string()));
            }
        }

        let now_ms = self.clock.epoch_ms();
        let status_model = StatusModel::project(SessionStatus::Running, None, Some(now_ms), None, None);

        let record = ConversationRecord {
            conversation_id: params.session_id,
            directory_id: params.directory_id,
            tenant_id: params.tenant_id,
            user_id: params.user_id,
            workspace_id: params.workspace_id,
            agent_type: params.agent_kind,
            title: None,
            runtime_status: Some(status_model.status),
            runtime_last_event_at_ms: status_model.last_event_at_ms,
            runtime_attention_reason: None,
            runtime_last_exit: None,
            adapter_state: serde_json::Value::Null,
            archived_at_ms: None,
        };
        self.store.upsert_conversation(record.clone()).await?;

        let entry = SessionEntry {
            session_id: params.session_id,
            tenant_id: params.tenant_id,
            user_id: params.user_id,
            workspace_id: params.workspace_id,
            directory_id: params.directory_id,
            worktree_id: params.worktree_id,
            agent_kind: params.agent_kind,
            live: Some(Arc::clone(&live)),
            status_model,
            started_at_ms: now_ms,
            exited_at_ms: None,
            controller: None,
            diagnostics: DiagnosticCounters::default(),
            last_snapshot: None,
            event_subscribers: std::collections::HashSet::new(),
        };
        let scope = entry.scope();
        self.sessions.lock().insert(params.session_id, entry);

        self.publish(scope, ObservedEvent::ConversationCreated {
            session_id: params.session_id,
            record: serde_json::to_value(&record).unwrap_or(serde_json::Value::Null),
        });

        Ok(())
    }

    /// Startup auto-recover (§4.3): reconstructs a session from a persisted,
    /// non-archived conversation instead of synthesizing a fresh record.
    /// The initial status is `running` unless the persisted
    /// `runtimeStatus` is `needs-input` or `completed` and a
    /// `runtimeLastEventAt` is on record, in which case that status is
    /// preserved verbatim.
    pub async fn recover(&self, record: ConversationRecord, live: Arc<dyn LiveSession>) -> Result<(), SessionError> {
        let session_id = record.conversation_id;
        {
            let sessions = self.sessions.lock();
            if sessions.contains_key(&session_id) {
                return Err(SessionError::AlreadyExists(session_id.as_str().to_string()));
            }
        }

        let now_ms = self.clock.epoch_ms();
        let preserve = matches!(record.runtime_status, Some(SessionStatus::NeedsInput) | Some(SessionStatus::Completed))
            && record.runtime_last_event_at_ms.is_some();
        let status_model = if preserve {
            StatusModel::project(
                record.runtime_status.unwrap_or(SessionStatus::Running),
                record.runtime_attention_reason.clone(),
                record.runtime_last_event_at_ms,
                record.runtime_last_exit.clone(),
                None,
            )
        } else {
            StatusModel::project(SessionStatus::Running, None, Some(now_ms), None, None)
        };

        let mut persisted = record.clone();
        persisted.runtime_status = Some(status_model.status);
        persisted.runtime_last_event_at_ms = status_model.last_event_at_ms;
        self.store.upsert_conversation(persisted.clone()).await?;

        let entry = SessionEntry {
            session_id,
            tenant_id: record.tenant_id,
            user_id: record.user_id,
            workspace_id: record.workspace_id,
            directory_id: record.directory_id,
            worktree_id: None,
            agent_kind: record.agent_type,
            live: Some(Arc::clone(&live)),
            status_model,
            started_at_ms: now_ms,
            exited_at_ms: None,
            controller: None,
            diagnostics: DiagnosticCounters::default(),
            last_snapshot: None,
            event_subscribers: std::collections::HashSet::new(),
        };
        let scope = entry.scope();
        self.sessions.lock().insert(session_id, entry);

        self.publish(scope, ObservedEvent::ConversationCreated {
            session_id,
            record: serde_json::to_value(&persisted).unwrap_or(serde_json::Value::Null),
        });

        Ok(())
    }

    /// Records one lifecycle event from a session's event channel, updating
    /// the status model and persisting it, then publishing the
    /// corresponding observed event(s). Called by the forwarding task the
    /// caller spawns per session after `start`.
    pub async fn record_lifecycle_event(&self, session_id: SessionId, event: PtyLifecycleEvent) -> Result<(), SessionError> {
        let now_ms = self.clock.epoch_ms();
        let mut exited_live: Option<Arc<dyn LiveSession>> = None;
        let (scope, observed, conversation) = {
            let mut sessions = self.sessions.lock();
            let entry = sessions.get_mut(&session_id).ok_or_else(|| SessionError::NotFound(session_id.as_str().to_string()))?;

            match &event {
                PtyLifecycleEvent::AttentionRequired { reason } => {
                    entry.status_model = StatusModel::project(
                        SessionStatus::NeedsInput,
                        Some(reason.clone()),
                        Some(now_ms),
                        None,
                        Some(&entry.status_model),
                    );
                }
                PtyLifecycleEvent::TurnCompleted => {
                    entry.status_model = StatusModel::project(
                        SessionStatus::Completed,
                        None,
                        Some(now_ms),
                        None,
                        Some(&entry.status_model),
                    );
                }
                PtyLifecycleEvent::Notify { .. } => {
                    entry.status_model.last_event_at_ms = Some(now_ms);
                }
                PtyLifecycleEvent::SessionExit { code, signal } => {
                    let exit = ExitRecord { code: *code, signal: signal.clone() };
                    entry.status_model = StatusModel::project(
                        SessionStatus::Exited,
                        None,
                        Some(now_ms),
                        Some(exit),
                        Some(&entry.status_model),
                    );
                    entry.exited_at_ms = Some(now_ms);
                    exited_live = entry.live.take();
                }
            }
            entry.diagnostics.note_event(now_ms);

            let scope = entry.scope();
            let status_observed = ObservedEvent::SessionStatus {
                session_id,
                status: entry.status_model.status,
                attention_reason: entry.status_model.attention_reason.clone(),
            };
            let conversation = ConversationRecord {
                conversation_id: session_id,
                directory_id: entry.directory_id,
                tenant_id: entry.tenant_id,
                user_id: entry.user_id,
                workspace_id: entry.workspace_id,
                agent_type: entry.agent_kind,
                title: None,
                runtime_status: Some(entry.status_model.status),
                runtime_last_event_at_ms: entry.status_model.last_event_at_ms,
                runtime_attention_reason: entry.status_model.attention_reason.clone(),
                runtime_last_exit: entry.status_model.last_exit.clone(),
                adapter_state: serde_json::Value::Null,
                archived_at_ms: None,
            };

            // A zero-length retention window means a tombstone is never
            // meant to be observable at all; rather than wait for the next
            // periodic sweep, drop it from the live table as soon as the
            // exit that created it is recorded.
            if matches!(event, PtyLifecycleEvent::SessionExit { .. }) && self.tombstone_ttl_ms == 0 {
                sessions.remove(&session_id);
            }

            (scope, status_observed, conversation)
        };

        // The exit sequence (§4.3): capture the terminal's final frame into
        // `last_snapshot` before the live session is gone, then close it.
        // `close()` aborts every attachment task itself; the connection-level
        // `pty.event` subscriber set is ours to clear here.
        if let Some(live) = exited_live {
            let snap = live.snapshot().await;
            live.close().await;
            let wire_snap = sessionmux_wire::TerminalSnapshot {
                rows: snap.rows,
                cols: snap.cols,
                cursor_row: snap.cursor_row,
                cursor_col: snap.cursor_col,
                lines: snap.lines,
                hash: snap.hash,
            };
            let mut sessions = self.sessions.lock();
            if let Some(entry) = sessions.get_mut(&session_id) {
                entry.last_snapshot = Some(wire_snap);
                entry.event_subscribers.clear();
            }
        }

        self.store.upsert_conversation(conversation).await?;
        self.fanout_pty_event(session_id, &event);
        self.publish(scope.clone(), observed);
        self.publish(scope, ObservedEvent::SessionEvent { session_id, event });
        Ok(())
    }

    /// Applies a telemetry `statusHint` (§4.6/§4.3's status-hint rule).
    /// Unknown hints are filtered upstream by [`StatusHint::parse`].
    pub fn apply_status_hint(&self, session_id: SessionId, hint: StatusHint, at_ms: u64) -> Result<(), SessionError> {
        let mut sessions = self.sessions.lock();
        let entry = sessions.get_mut(&session_id).ok_or_else(|| SessionError::NotFound(session_id.as_str().to_string()))?;
        let status = match hint {
            StatusHint::NeedsInput => SessionStatus::NeedsInput,
            StatusHint::Running => SessionStatus::Running,
        };
        let attention_reason = if matches!(hint, StatusHint::Running) { None } else { entry.status_model.attention_reason.clone() };
        entry.status_model = StatusModel::project(status, attention_reason, Some(at_ms), None, Some(&entry.status_model));
        Ok(())
    }

    pub async fn attach(&self, session_id: SessionId, handlers: AttachHandlers, since_cursor: Option<u64>) -> Result<(AttachmentId, u64), SessionError> {
        let live = {
            let sessions = self.sessions.lock();
            let entry = sessions.get(&session_id).ok_or_else(|| SessionError::NotFound(session_id.as_str().to_string()))?;
            entry.live.clone().ok_or_else(|| SessionError::NotLive(session_id.as_str().to_string()))?
        };
        let attachment_id = live.attach(handlers, since_cursor).await;
        Ok((attachment_id, live.latest_cursor()))
    }

    pub async fn detach(&self, session_id: SessionId, attachment_id: AttachmentId) -> Result<(), SessionError> {
        let live = {
            let sessions = self.sessions.lock();
            sessions.get(&session_id).and_then(|e| e.live.clone())
        };
        if let Some(live) = live {
            live.detach(attachment_id).await;
        }
        Ok(())
    }

    pub async fn write_input(&self, session_id: SessionId, data: &[u8]) -> Result<(), SessionError> {
        let live = {
            let sessions = self.sessions.lock();
            let entry = sessions.get(&session_id).ok_or_else(|| SessionError::NotFound(session_id.as_str().to_string()))?;
            entry.live.clone().ok_or_else(|| SessionError::NotLive(session_id.as_str().to_string()))?
        };
        live.write(data).await.map_err(|e| SessionError::Spawn(sessionmux_pty::SpawnError::Spawn(e.to_string())))
    }

    pub async fn resize(&self, session_id: SessionId, cols: u16, rows: u16) -> Result<(), SessionError> {
        let live = {
            let sessions = self.sessions.lock();
            let entry = sessions.get(&session_id).ok_or_else(|| SessionError::NotFound(session_id.as_str().to_string()))?;
            entry.live.clone().ok_or_else(|| SessionError::NotLive(session_id.as_str().to_string()))?
        };
        live.resize(cols, rows).await;
        Ok(())
    }

    /// Translates a `pty.signal` envelope into the corresponding control
    /// byte or a hard close, since [`LiveSession`] exposes only `write`.
    pub async fn signal(&self, session_id: SessionId, kind: sessionmux_wire::PtySignalKind) -> Result<(), SessionError> {
        use sessionmux_wire::PtySignalKind;
        match kind {
            PtySignalKind::Interrupt => self.write_input(session_id, &[0x03]).await,
            PtySignalKind::Eof => self.write_input(session_id, &[0x04]).await,
            PtySignalKind::Terminate => {
                let live = {
                    let sessions = self.sessions.lock();
                    let entry = sessions.get(&session_id).ok_or_else(|| SessionError::NotFound(session_id.as_str().to_string()))?;
                    entry.live.clone().ok_or_else(|| SessionError::NotLive(session_id.as_str().to_string()))?
                };
                live.close().await;
                Ok(())
            }
        }
    }

    pub async fn snapshot(&self, session_id: SessionId) -> Result<sessionmux_wire::SessionSnapshotResult, SessionError> {
        let live = {
            let sessions = self.sessions.lock();
            let entry = sessions.get(&session_id).ok_or_else(|| SessionError::NotFound(session_id.as_str().to_string()))?;
            entry.live.clone()
        };
        match live {
            Some(live) => {
                let snap = live.snapshot().await;
                let wire_snap = sessionmux_wire::TerminalSnapshot {
                    rows: snap.rows,
                    cols: snap.cols,
                    cursor_row: snap.cursor_row,
                    cursor_col: snap.cursor_col,
                    lines: snap.lines,
                    hash: snap.hash,
                };
                {
                    let mut sessions = self.sessions.lock();
                    if let Some(entry) = sessions.get_mut(&session_id) {
                        entry.last_snapshot = Some(wire_snap.clone());
                    }
                }
                Ok(sessionmux_wire::SessionSnapshotResult { session_id, snapshot: Some(wire_snap), stale: false })
            }
            None => {
                let sessions = self.sessions.lock();
                let entry = sessions.get(&session_id).ok_or_else(|| SessionError::NotFound(session_id.as_str().to_string()))?;
                Ok(sessionmux_wire::SessionSnapshotResult { session_id, snapshot: entry.last_snapshot.clone(), stale: true })
            }
        }
    }

    /// Claims control of a session for a connection. Fails with
    /// [`SessionError::Claimed`] unless `takeover` is set, in which case the
    /// previous controller is displaced and a `session-control` event with
    /// `TakenOver` is published naming it as `previousController` (§4.3).
    pub fn claim(
        &self,
        session_id: SessionId,
        connection_id: ConnectionId,
        controller_id: String,
        controller_type: String,
        controller_label: Option<String>,
        takeover: bool,
        now_ms: u64,
    ) -> Result<ControllerSummary, SessionError> {
        let mut sessions = self.sessions.lock();
        let entry = sessions.get_mut(&session_id).ok_or_else(|| SessionError::NotFound(session_id.as_str().to_string()))?;

        let previous_label = match &entry.controller {
            Some(existing) if !takeover => return Err(SessionError::Claimed(existing.label())),
            Some(existing) => Some(existing.label()),
            None => None,
        };

        let controller = Controller { controller_id, controller_type, controller_label, connection_id, claimed_at_ms: now_ms };
        let summary = controller.summary();
        entry.controller = Some(controller);

        let scope = entry.scope();
        let action = if previous_label.is_some() { ControlAction::TakenOver } else { ControlAction::Claimed };
        drop(sessions);
        self.publish(scope, ObservedEvent::SessionControl { session_id, action, previous_controller: previous_label, reason: None });

        Ok(summary)
    }

    pub fn release(&self, session_id: SessionId, connection_id: ConnectionId, reason: Option<String>) -> Result<bool, SessionError> {
        let mut sessions = self.sessions.lock();
        let entry = sessions.get_mut(&session_id).ok_or_else(|| SessionError::NotFound(session_id.as_str().to_string()))?;
        let released = match &entry.controller {
            Some(controller) if controller.connection_id == connection_id => {
                entry.controller = None;
                true
            }
            _ => false,
        };
        if released {
            let scope = entry.scope();
            drop(sessions);
            self.publish(scope, ObservedEvent::SessionControl { session_id, action: ControlAction::Released, previous_controller: None, reason });
        }
        Ok(released)
    }

    /// Command-path claim check (§9's Open Question (a)): commands actively
    /// refuse when a different connection holds the controller, unlike raw
    /// `pty.input`/`resize`/`signal` envelopes, which silently drop instead.
    pub fn assert_controller_allows(&self, session_id: SessionId, connection_id: ConnectionId) -> Result<(), SessionError> {
        let sessions = self.sessions.lock();
        let entry = sessions.get(&session_id).ok_or_else(|| SessionError::NotFound(session_id.as_str().to_string()))?;
        match &entry.controller {
            Some(controller) if controller.connection_id != connection_id => Err(SessionError::Claimed(controller.label())),
            _ => Ok(()),
        }
    }

    /// Forces a session back to `running` and clears any attention reason,
    /// as `session.respond`/`session.interrupt` both do (§4.3).
    pub async fn force_running(&self, session_id: SessionId, at_ms: u64) -> Result<(), SessionError> {
        let (scope, observed, conversation) = {
            let mut sessions = self.sessions.lock();
            let entry = sessions.get_mut(&session_id).ok_or_else(|| SessionError::NotFound(session_id.as_str().to_string()))?;
            entry.status_model = StatusModel::project(SessionStatus::Running, None, Some(at_ms), None, Some(&entry.status_model));
            let scope = entry.scope();
            let observed = ObservedEvent::SessionStatus { session_id, status: SessionStatus::Running, attention_reason: None };
            let conversation = ConversationRecord {
                conversation_id: session_id,
                directory_id: entry.directory_id,
                tenant_id: entry.tenant_id,
                user_id: entry.user_id,
                workspace_id: entry.workspace_id,
                agent_type: entry.agent_kind,
                title: None,
                runtime_status: Some(SessionStatus::Running),
                runtime_last_event_at_ms: Some(at_ms),
                runtime_attention_reason: None,
                runtime_last_exit: entry.status_model.last_exit.clone(),
                adapter_state: serde_json::Value::Null,
                archived_at_ms: None,
            };
            (scope, observed, conversation)
        };
        self.store.upsert_conversation(conversation).await?;
        self.publish(scope, observed);
        Ok(())
    }

    /// Releases every session controlled by a closing connection, using the
    /// fixed `controller-disconnected` reason (§4.2).
    pub fn release_all_for_connection(&self, connection_id: ConnectionId) {
        let session_ids: Vec<SessionId> = self
            .sessions
            .lock()
            .iter()
            .filter(|(_, e)| e.controller.as_ref().is_some_and(|c| c.connection_id == connection_id))
            .map(|(id, _)| *id)
            .collect();
        for session_id in session_ids {
            let _ = self.release(session_id, connection_id, Some(sessionmux_wire::CONTROLLER_DISCONNECTED_REASON.to_string()));
        }
    }

    pub async fn remove(&self, session_id: SessionId) -> Result<bool, SessionError> {
        let live = {
            let mut sessions = self.sessions.lock();
            match sessions.remove(&session_id) {
                Some(entry) => entry.live,
                None => return Ok(false),
            }
        };
        if let Some(live) = live {
            live.close().await;
        }
        self.store.delete_conversation(session_id).await?;
        Ok(true)
    }

    /// Closes every live session's PTY without touching the persisted
    /// conversation record (§4.7's shutdown ordering — sessions are
    /// reconstructed from storage on the next startup, so shutdown must not
    /// delete them the way `remove` does).
    pub async fn shutdown_all(&self) {
        let live_sessions: Vec<Arc<dyn LiveSession>> =
            self.sessions.lock().values().filter_map(|e| e.live.clone()).collect();
        for live in live_sessions {
            live.close().await;
        }
    }

    /// Drops tombstoned sessions whose TTL has elapsed (§4.3's exit
    /// retention window), called periodically by the daemon's timer loop.
    pub fn sweep_tombstones(&self, now_ms: u64) -> Vec<SessionId> {
        let mut sessions = self.sessions.lock();
        let expired: Vec<SessionId> = sessions
            .iter()
            .filter(|(_, e)| e.is_tombstoned() && e.exited_at_ms.is_some_and(|at| now_ms.saturating_sub(at) >= self.tombstone_ttl_ms))
            .map(|(id, _)| *id)
            .collect();
        for id in &expired {
            sessions.remove(id);
        }
        expired
    }

    pub fn list(&self, filter: &sessionmux_wire::SessionListFilter, sort: sessionmux_wire::SessionListSort, limit: Option<usize>, offset: Option<usize>) -> Vec<SessionSummary> {
        let now_ms = self.clock.epoch_ms();
        let mut summaries: Vec<SessionSummary> = self
            .sessions
            .lock()
            .values()
            .filter(|e| filter.tenant_id.map_or(true, |v| v == e.tenant_id))
            .filter(|e| filter.user_id.map_or(true, |v| v == e.user_id))
            .filter(|e| filter.workspace_id.map_or(true, |v| v == e.workspace_id))
            .filter(|e| filter.directory_id.map_or(true, |v| Some(v) == e.directory_id))
            .filter(|e| filter.status.map_or(true, |v| v == e.status_model.status))
            .filter(|e| filter.live.map_or(true, |v| v == e.live.is_some()))
            .map(|e| e.summary(now_ms))
            .collect();

        match sort {
            sessionmux_wire::SessionListSort::AttentionFirst => {
                // §4.3: attention priority, then lastEventAt desc (nulls
                // last — `None` already sorts below every `Some` so
                // reversing the whole tuple puts it last for free), then
                // startedAt desc, then id asc as the final tiebreak.
                summaries.sort_by_key(|s| {
                    (
                        s.status.attention_priority(),
                        std::cmp::Reverse(s.last_event_at_ms),
                        std::cmp::Reverse(s.started_at_ms),
                        s.session_id.as_str().to_string(),
                    )
                })
            }
            sessionmux_wire::SessionListSort::StartedAsc => summaries.sort_by_key(|s| s.started_at_ms),
            sessionmux_wire::SessionListSort::StartedDesc => summaries.sort_by_key(|s| std::cmp::Reverse(s.started_at_ms)),
        }

        let offset = offset.unwrap_or(0);
        if offset >= summaries.len() {
            return Vec::new();
        }
        match limit {
            Some(limit) => summaries[offset..].iter().take(limit).cloned().collect(),
            None => summaries[offset..].to_vec(),
        }
    }

    pub fn status(&self, session_id: SessionId) -> Result<SessionSummary, SessionError> {
        let now_ms = self.clock.epoch_ms();
        let sessions = self.sessions.lock();
        sessions
            .get(&session_id)
            .map(|e| e.summary(now_ms))
            .ok_or_else(|| SessionError::NotFound(session_id.as_str().to_string()))
    }

    pub fn diagnostics(&self, session_id: SessionId) -> Result<sessionmux_wire::SessionDiagnostics, SessionError> {
        let now_ms = self.clock.epoch_ms();
        let sessions = self.sessions.lock();
        let entry = sessions.get(&session_id).ok_or_else(|| SessionError::NotFound(session_id.as_str().to_string()))?;
        let d = &entry.diagnostics;
        Ok(sessionmux_wire::SessionDiagnostics {
            session_id,
            telemetry_ingested_total: d.telemetry_ingested_total,
            telemetry_retained_total: d.telemetry_retained_total,
            telemetry_dropped_total: d.telemetry_dropped_total,
            fanout_bytes_enqueued_total: d.fanout_bytes_enqueued_total,
            fanout_events_enqueued_total: d.fanout_events_enqueued_total,
            fanout_backpressure_signals_total: d.fanout_backpressure_signals_total,
            fanout_backpressure_disconnects_total: d.fanout_backpressure_disconnects_total,
            events_last_60s: d.events_last_60s(now_ms),
        })
    }

    /// Records telemetry ingestion counters against a session's diagnostics
    /// (§4.6's per-session accounting); `retained` is false when the
    /// telemetry store rejected it as a fingerprint duplicate.
    pub fn note_telemetry(&self, session_id: SessionId, retained: bool) {
        let mut sessions = self.sessions.lock();
        if let Some(entry) = sessions.get_mut(&session_id) {
            entry.diagnostics.telemetry_ingested_total += 1;
            if retained {
                entry.diagnostics.telemetry_retained_total += 1;
            } else {
                entry.diagnostics.telemetry_dropped_total += 1;
            }
        }
    }

    /// Records one PTY-output fan-out delivery against a session's
    /// diagnostics (§3's fan-out counters), and the back-pressure counters
    /// when the connection manager reports a slow or disconnected reader.
    pub fn note_fanout(&self, session_id: SessionId, bytes: usize, backpressure_signal: bool, backpressure_disconnect: bool) {
        let mut sessions = self.sessions.lock();
        if let Some(entry) = sessions.get_mut(&session_id) {
            entry.diagnostics.fanout_bytes_enqueued_total += bytes as u64;
            entry.diagnostics.fanout_events_enqueued_total += 1;
            if backpressure_signal {
                entry.diagnostics.fanout_backpressure_signals_total += 1;
            }
            if backpressure_disconnect {
                entry.diagnostics.fanout_backpressure_disconnects_total += 1;
            }
        }
    }
}
