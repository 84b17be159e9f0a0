// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Connection manager (§4.2): owns every accepted TCP socket — reads
//! newline-delimited envelopes, enforces the auth state machine, dispatches
//! commands and PTY routing, and writes responses through a bounded,
//! back-pressured per-connection queue.

use crate::ctx::DaemonCtx;
use crate::error::SessionError;
use crate::session::{launch_command_for, probe_agent_tools, StartParams};
use base64::Engine;
use parking_lot::Mutex;
use sessionmux_core::{
    AgentKind, Clock, CommandId, ConnectionId, DirectoryId, RepositoryId, SessionId, TaskId,
};
use sessionmux_pty::{AttachHandlers, DataChunk, ExitInfo, LiveSession, ProcessLiveSession};
use sessionmux_storage::{ConversationRecord, DirectoryRecord, RepositoryRecord, TaskRecord};
use sessionmux_wire::{
    error_messages, ClientEnvelope, Command, CommandResult, ObservedEvent, PtyLifecycleEvent,
    PtySignalKind, ServerEnvelope, SessionListFilter, SessionListSort,
};
use std::collections::{HashMap, HashSet};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

const MAX_LINE_BYTES: usize = sessionmux_wire::DEFAULT_MAX_LINE_BYTES;
const READ_CHUNK_BYTES: usize = 64 * 1024;

/// Outcome of enqueuing a payload to one connection's write queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendOutcome {
    Sent,
    /// `queuedBytes + socketWritableLength > maxConnectionBufferedBytes`; the
    /// connection has been marked for teardown (§5's back-pressure policy).
    WouldExceed,
    NotFound,
}

struct OutboundHandle {
    tx: mpsc::UnboundedSender<Vec<u8>>,
    queued_bytes: Arc<AtomicUsize>,
    cancel: CancellationToken,
}

/// Registry of every live connection's outbound write queue, shared between
/// the connection manager (which owns the sockets) and the session runtime
/// (which needs to fan stream/PTY events out to arbitrary connections).
pub struct ConnectionRegistry {
    handles: Mutex<HashMap<ConnectionId, OutboundHandle>>,
    max_buffered_bytes: usize,
}

impl ConnectionRegistry {
    pub fn new(max_buffered_bytes: usize) -> Self {
        Self { handles: Mutex::new(HashMap::new()), max_buffered_bytes }
    }

    fn register(&self, id: ConnectionId, tx: mpsc::UnboundedSender<Vec<u8>>, queued_bytes: Arc<AtomicUsize>, cancel: CancellationToken) {
        self.handles.lock().insert(id, OutboundHandle { tx, queued_bytes, cancel });
    }

    fn unregister(&self, id: ConnectionId) {
        self.handles.lock().remove(&id);
    }

    /// Charges `bytes.len()` against the connection's queued-byte budget
    /// and pushes onto its write queue. Exceeding the budget cancels the
    /// connection's tasks rather than growing the queue unbounded.
    fn send_bytes(&self, id: ConnectionId, bytes: Vec<u8>) -> SendOutcome {
        let handles = self.handles.lock();
        let Some(handle) = handles.get(&id) else { return SendOutcome::NotFound };
        if handle.cancel.is_cancelled() {
            return SendOutcome::NotFound;
        }
        let len = bytes.len();
        let prior = handle.queued_bytes.fetch_add(len, Ordering::SeqCst);
        if prior + len > self.max_buffered_bytes {
            handle.cancel.cancel();
            return SendOutcome::WouldExceed;
        }
        let _ = handle.tx.send(bytes);
        SendOutcome::Sent
    }

    pub fn send_envelope(&self, id: ConnectionId, envelope: &ServerEnvelope) -> SendOutcome {
        self.send_bytes(id, sessionmux_wire::encode_server(envelope))
    }

    pub fn send_stream_event(&self, id: ConnectionId, subscription_id: sessionmux_core::SubscriptionId, cursor: u64, event: &ObservedEvent) {
        self.send_envelope(id, &ServerEnvelope::StreamEvent { subscription_id, cursor, event: event.clone() });
    }

    pub fn send_pty_event(&self, id: ConnectionId, session_id: SessionId, event: PtyLifecycleEvent) {
        self.send_envelope(id, &ServerEnvelope::PtyEvent { session_id, event });
    }

    /// Tears down every currently registered connection (§4.7's shutdown
    /// ordering). Each connection's own read loop observes its cancellation
    /// token and exits on its own; this does not wait for that to happen.
    pub fn close_all(&self) {
        for handle in self.handles.lock().values() {
            handle.cancel.cancel();
        }
    }
}

/// Per-connection mutable state the read loop owns: auth, attached
/// sessions, raw-event subscriptions, and journal-stream subscriptions —
/// all erased on socket close (§4.2's shutdown side effects).
struct ConnState {
    authenticated: bool,
    attached: HashMap<SessionId, sessionmux_core::AttachmentId>,
    event_subscribed: HashSet<SessionId>,
    stream_subscribed: HashSet<sessionmux_core::SubscriptionId>,
}

impl ConnState {
    fn new(requires_auth: bool) -> Self {
        Self { authenticated: !requires_auth, attached: HashMap::new(), event_subscribed: HashSet::new(), stream_subscribed: HashSet::new() }
    }
}

/// Accepts connections on `listener` until `shutdown` fires, spawning one
/// task per socket.
pub async fn serve<C: Clock + 'static>(ctx: Arc<DaemonCtx<C>>, listener: TcpListener, shutdown: CancellationToken) {
    loop {
        tokio::select! {
            accepted = listener.accept() => {
                match accepted {
                    Ok((stream, addr)) => {
                        let ctx = Arc::clone(&ctx);
                        tokio::spawn(async move { handle_connection(ctx, stream, addr).await });
                    }
                    Err(e) => {
                        warn!(error = %e, "accept failed");
                    }
                }
            }
            _ = shutdown.cancelled() => {
                info!("control-plane listener shutting down");
                return;
            }
        }
    }
}

async fn handle_connection<C: Clock + 'static>(ctx: Arc<DaemonCtx<C>>, stream: tokio::net::TcpStream, addr: SocketAddr) {
    let connection_id = ConnectionId::new();
    let created_at_ms = ctx.clock.epoch_ms();
    debug!(%connection_id, peer = %addr, "connection accepted");

    let _ = stream.set_nodelay(true);
    let (mut read_half, mut write_half) = stream.into_split();

    let (tx, mut rx) = mpsc::unbounded_channel::<Vec<u8>>();
    let queued_bytes = Arc::new(AtomicUsize::new(0));
    let cancel = CancellationToken::new();
    ctx.connections.register(connection_id, tx.clone(), Arc::clone(&queued_bytes), cancel.clone());

    let writer_cancel = cancel.clone();
    let writer_queued = Arc::clone(&queued_bytes);
    let writer_task = tokio::spawn(async move {
        loop {
            tokio::select! {
                maybe = rx.recv() => {
                    match maybe {
                        Some(bytes) => {
                            writer_queued.fetch_sub(bytes.len(), Ordering::SeqCst);
                            if write_half.write_all(&bytes).await.is_err() {
                                return;
                            }
                        }
                        None => return,
                    }
                }
                _ = writer_cancel.cancelled() => return,
            }
        }
    });

    let mut state = ConnState::new(ctx.requires_auth());
    let mut remainder: Vec<u8> = Vec::new();
    let mut buf = vec![0u8; READ_CHUNK_BYTES];

    'read_loop: loop {
        tokio::select! {
            n = read_half.read(&mut buf) => {
                let n = match n {
                    Ok(0) => break 'read_loop,
                    Ok(n) => n,
                    Err(_) => break 'read_loop,
                };
                remainder.extend_from_slice(&buf[..n]);
                let consumed = sessionmux_wire::consume_client_lines(&remainder, MAX_LINE_BYTES);
                remainder = consumed.remainder;
                for message in consumed.messages {
                    if !dispatch_envelope(&ctx, connection_id, &mut state, message).await {
                        break 'read_loop;
                    }
                }
            }
            _ = cancel.cancelled() => break 'read_loop,
        }
    }

    cancel.cancel();
    let _ = writer_task.await;
    cleanup_connection(&ctx, connection_id, &state).await;
    let _ = created_at_ms;
    debug!(%connection_id, "connection closed");
}

async fn cleanup_connection<C: Clock + 'static>(ctx: &Arc<DaemonCtx<C>>, connection_id: ConnectionId, state: &ConnState) {
    ctx.connections.unregister(connection_id);
    for (session_id, attachment_id) in &state.attached {
        let _ = ctx.sessions.detach(*session_id, *attachment_id).await;
    }
    ctx.sessions.release_all_for_connection(connection_id);
    ctx.sessions.remove_event_subscriber_everywhere(connection_id);
    ctx.journal.lock().remove_connection(connection_id);
}

/// Handles one parsed client envelope. Returns `false` when the connection
/// must be torn down (auth failure).
async fn dispatch_envelope<C: Clock + 'static>(
    ctx: &Arc<DaemonCtx<C>>,
    connection_id: ConnectionId,
    state: &mut ConnState,
    envelope: ClientEnvelope,
) -> bool {
    if !state.authenticated {
        return match envelope {
            ClientEnvelope::Auth { token } => {
                if ctx.token_is_valid(&token) {
                    state.authenticated = true;
                    ctx.connections.send_envelope(connection_id, &ServerEnvelope::AuthOk);
                    true
                } else {
                    ctx.connections.send_envelope(connection_id, &ServerEnvelope::AuthError { error: error_messages::INVALID_AUTH_TOKEN.to_string() });
                    false
                }
            }
            _ => {
                ctx.connections.send_envelope(connection_id, &ServerEnvelope::AuthError { error: error_messages::AUTHENTICATION_REQUIRED.to_string() });
                false
            }
        };
    }

    match envelope {
        ClientEnvelope::Auth { .. } => {
            ctx.connections.send_envelope(connection_id, &ServerEnvelope::AuthOk);
        }
        ClientEnvelope::Command { command_id, command } => {
            handle_command(ctx, connection_id, state, command_id, command).await;
        }
        ClientEnvelope::PtyInput { session_id, data_base64 } => {
            if ctx.sessions.assert_controller_allows(session_id, connection_id).is_ok() {
                if let Ok(bytes) = base64::engine::general_purpose::STANDARD.decode(data_base64) {
                    let _ = ctx.sessions.write_input(session_id, &bytes).await;
                }
            }
        }
        ClientEnvelope::PtyResize { session_id, cols, rows } => {
            if ctx.sessions.assert_controller_allows(session_id, connection_id).is_ok() {
                let _ = ctx.sessions.resize(session_id, cols, rows).await;
            }
        }
        ClientEnvelope::PtySignal { session_id, signal } => {
            if ctx.sessions.assert_controller_allows(session_id, connection_id).is_ok() {
                let _ = ctx.sessions.signal(session_id, signal).await;
            }
        }
    }
    true
}

async fn handle_command<C: Clock + 'static>(
    ctx: &Arc<DaemonCtx<C>>,
    connection_id: ConnectionId,
    state: &mut ConnState,
    command_id: CommandId,
    command: Command,
) {
    ctx.connections.send_envelope(connection_id, &ServerEnvelope::CommandAccepted { command_id });
    match run_command(ctx, connection_id, state, command).await {
        Ok(result) => {
            ctx.connections.send_envelope(connection_id, &ServerEnvelope::CommandCompleted { command_id, result });
        }
        Err(error) => {
            ctx.connections.send_envelope(connection_id, &ServerEnvelope::CommandFailed { command_id, error: error.to_string() });
        }
    }
}

async fn run_command<C: Clock + 'static>(
    ctx: &Arc<DaemonCtx<C>>,
    connection_id: ConnectionId,
    state: &mut ConnState,
    command: Command,
) -> Result<CommandResult, SessionError> {
    let now_ms = ctx.clock.epoch_ms();
    match command {
        Command::SessionList { filter, sort, limit, offset } => {
            Ok(CommandResult::SessionList { sessions: ctx.sessions.list(&filter, sort, limit, offset) })
        }
        Command::AttentionList { mut filter } => {
            filter.status = Some(sessionmux_core::SessionStatus::NeedsInput);
            Ok(CommandResult::SessionList { sessions: ctx.sessions.list(&filter, SessionListSort::AttentionFirst, None, None) })
        }
        Command::SessionStatus { session_id } => Ok(CommandResult::SessionStatus(ctx.sessions.status(session_id)?)),
        Command::SessionSnapshot { session_id } => Ok(CommandResult::SessionSnapshot(ctx.sessions.snapshot(session_id).await?)),
        Command::SessionRespond { session_id, text } => {
            ctx.sessions.assert_controller_allows(session_id, connection_id)?;
            let bytes = text.into_bytes();
            ctx.sessions.write_input(session_id, &bytes).await?;
            ctx.sessions.force_running(session_id, now_ms).await?;
            Ok(CommandResult::SessionResponded { responded: true, sent_bytes: bytes.len() })
        }
        Command::SessionInterrupt { session_id } => {
            ctx.sessions.assert_controller_allows(session_id, connection_id)?;
            ctx.sessions.write_input(session_id, &[0x03]).await?;
            ctx.sessions.force_running(session_id, now_ms).await?;
            Ok(CommandResult::SessionInterrupted { interrupted: true })
        }
        Command::SessionClaim { session_id, controller_id, controller_type, controller_label, takeover } => {
            let summary = ctx.sessions.claim(session_id, connection_id, controller_id, controller_type, controller_label, takeover, now_ms)?;
            Ok(CommandResult::SessionController { controller: Some(summary) })
        }
        Command::SessionRelease { session_id, reason } => {
            let released = ctx.sessions.release(session_id, connection_id, reason)?;
            Ok(CommandResult::SessionReleased { released })
        }
        Command::SessionRemove { session_id } => Ok(CommandResult::SessionRemoved { removed: ctx.sessions.remove(session_id).await? }),
        Command::SessionDiagnostics { session_id } => Ok(CommandResult::SessionDiagnostics(ctx.sessions.diagnostics(session_id)?)),
        Command::PtyStart { session_id, tenant_id, user_id, workspace_id, directory_id, worktree_id, agent_kind } => {
            pty_start(ctx, session_id, tenant_id, user_id, workspace_id, directory_id, worktree_id, agent_kind).await
        }
        Command::PtyAttach { session_id, since_cursor } => pty_attach(ctx, connection_id, state, session_id, since_cursor).await,
        Command::PtyDetach { session_id } => {
            let detached = match state.attached.remove(&session_id) {
                Some(attachment_id) => {
                    ctx.sessions.detach(session_id, attachment_id).await?;
                    true
                }
                None => false,
            };
            Ok(CommandResult::PtyDetached { detached })
        }
        Command::PtySubscribeEvents { session_id } => {
            ctx.sessions.subscribe_events(session_id, connection_id)?;
            state.event_subscribed.insert(session_id);
            Ok(CommandResult::Subscribed { subscribed: true })
        }
        Command::PtyUnsubscribeEvents { session_id } => {
            ctx.sessions.unsubscribe_events(session_id, connection_id)?;
            state.event_subscribed.remove(&session_id);
            Ok(CommandResult::Unsubscribed { unsubscribed: true })
        }
        Command::StreamSubscribe { filter, after_cursor } => {
            let (subscription_id, backlog) = ctx.journal.lock().subscribe(connection_id, filter, after_cursor);
            state.stream_subscribed.insert(subscription_id);
            let stale = backlog.is_none();
            let backlog = backlog
                .unwrap_or_default()
                .into_iter()
                .map(|entry| serde_json::json!({ "cursor": entry.cursor, "event": entry.event }))
                .collect();
            Ok(CommandResult::StreamSubscribed { subscription_id, backlog, stale })
        }
        Command::StreamUnsubscribe { subscription_id } => {
            let unsubscribed = ctx.journal.lock().unsubscribe(subscription_id);
            state.stream_subscribed.remove(&subscription_id);
            Ok(CommandResult::Unsubscribed { unsubscribed })
        }
        Command::DirectoryUpsert { directory_id, tenant_id, user_id, workspace_id, cwd } => {
            let directory_id = directory_id.unwrap_or_else(DirectoryId::new);
            let record = DirectoryRecord { directory_id, tenant_id, user_id, workspace_id, cwd, archived_at_ms: None };
            let record = ctx.store.upsert_directory(record).await?;
            let scope = sessionmux_core::Scope { tenant_id: Some(tenant_id), user_id: Some(user_id), workspace_id: Some(workspace_id), directory_id: Some(directory_id), conversation_id: None };
            ctx.journal.lock().publish(scope, ObservedEvent::DirectoryUpserted { directory_id, record: serde_json::to_value(&record).unwrap_or_default() });
            Ok(CommandResult::Record(serde_json::to_value(&record).unwrap_or_default()))
        }
        Command::DirectoryArchive { directory_id } => {
            ctx.store.archive_directory(directory_id, now_ms).await?;
            ctx.journal.lock().publish(sessionmux_core::Scope { directory_id: Some(directory_id), ..Default::default() }, ObservedEvent::DirectoryArchived { directory_id });
            Ok(CommandResult::Record(serde_json::json!({ "directoryId": directory_id, "archived": true })))
        }
        Command::ConversationArchive { session_id } => {
            ctx.store.archive_conversation(session_id, now_ms).await?;
            ctx.journal.lock().publish(sessionmux_core::Scope { conversation_id: Some(session_id), ..Default::default() }, ObservedEvent::ConversationArchived { session_id });
            Ok(CommandResult::Record(serde_json::json!({ "sessionId": session_id, "archived": true })))
        }
        Command::ConversationDelete { session_id } => {
            ctx.store.delete_conversation(session_id).await?;
            ctx.journal.lock().publish(sessionmux_core::Scope { conversation_id: Some(session_id), ..Default::default() }, ObservedEvent::ConversationDeleted { session_id });
            Ok(CommandResult::Record(serde_json::json!({ "sessionId": session_id, "deleted": true })))
        }
        Command::TaskCreate { directory_id, title } => {
            let record = TaskRecord { task_id: TaskId::new(), directory_id, title, done: false, order: 0 };
            let record = ctx.store.create_task(record).await?;
            ctx.journal.lock().publish(
                sessionmux_core::Scope { directory_id: Some(directory_id), ..Default::default() },
                ObservedEvent::TaskCreated { task_id: record.task_id, directory_id, record: serde_json::to_value(&record).unwrap_or_default() },
            );
            Ok(CommandResult::Record(serde_json::to_value(&record).unwrap_or_default()))
        }
        Command::TaskUpdate { task_id, title, done } => {
            let record = ctx.store.update_task(task_id, title, done).await?;
            ctx.journal.lock().publish(
                sessionmux_core::Scope { directory_id: Some(record.directory_id), ..Default::default() },
                ObservedEvent::TaskUpdated { task_id, record: serde_json::to_value(&record).unwrap_or_default() },
            );
            Ok(CommandResult::Record(serde_json::to_value(&record).unwrap_or_default()))
        }
        Command::TaskReorder { directory_id, task_ids } => {
            ctx.store.reorder_tasks(directory_id, task_ids.clone()).await?;
            ctx.journal.lock().publish(
                sessionmux_core::Scope { directory_id: Some(directory_id), ..Default::default() },
                ObservedEvent::TaskReordered { directory_id, task_ids: task_ids.clone() },
            );
            Ok(CommandResult::Record(serde_json::json!({ "directoryId": directory_id, "taskIds": task_ids })))
        }
        Command::RepositoryUpsert { repository_id, remote_url } => {
            let record = ctx.store.upsert_repository(repository_id, remote_url).await?;
            let repository_id: RepositoryId = record.repository_id;
            ctx.journal.lock().publish(
                sessionmux_core::Scope::default(),
                ObservedEvent::RepositoryUpserted { repository_id, record: serde_json::to_value(&record).unwrap_or_default() },
            );
            Ok(CommandResult::Record(serde_json::to_value(&record).unwrap_or_default()))
        }
        Command::AgentToolsStatus => Ok(CommandResult::AgentTools { tools: probe_agent_tools() }),
        Command::PollerStatus => Ok(CommandResult::PollerStatus { pollers: ctx.pollers.status() }),
    }
}

/// `pty.start` (§4.3): resolves the launch command, mints a telemetry
/// token, spawns the PTY-backed subprocess, and bridges its lifecycle
/// events into the runtime's status engine.
async fn pty_start<C: Clock + 'static>(
    ctx: &Arc<DaemonCtx<C>>,
    session_id: SessionId,
    tenant_id: sessionmux_core::TenantId,
    user_id: sessionmux_core::UserId,
    workspace_id: sessionmux_core::WorkspaceId,
    directory_id: Option<DirectoryId>,
    worktree_id: Option<sessionmux_core::WorktreeId>,
    agent_kind: AgentKind,
) -> Result<CommandResult, SessionError> {
    if ctx.sessions.status(session_id).is_ok() {
        return Err(SessionError::AlreadyExists(session_id.as_str().to_string()));
    }

    let cwd = match directory_id {
        Some(id) => ctx.store.get_directory(id).await?.map(|d| std::path::PathBuf::from(d.cwd)),
        None => None,
    };

    let mut spawn_params = launch_command_for(agent_kind, cwd, 24, 80);
    let token = ctx.telemetry_tokens.mint(session_id);
    spawn_params.env.push(("SESSIONMUX_OTLP_TOKEN".to_string(), token));

    let live: Arc<dyn LiveSession> = Arc::new(
        ProcessLiveSession::spawn(spawn_params).map_err(SessionError::Spawn)?,
    );

    let params = StartParams { session_id, tenant_id, user_id, workspace_id, directory_id, worktree_id, agent_kind };
    ctx.sessions.start(params, Arc::clone(&live)).await?;
    spawn_lifecycle_bridge(Arc::clone(ctx), session_id, live);

    Ok(CommandResult::PtyStarted { session_id })
}

/// Forwards a live session's lifecycle event channel into
/// `SessionRuntime::record_lifecycle_event` until the channel closes or the
/// session exits. Shared by `pty.start` and the binary's startup
/// auto-recover path (§4.3), which both register a freshly spawned
/// [`LiveSession`] the same way.
pub fn spawn_lifecycle_bridge<C: Clock + 'static>(ctx: Arc<DaemonCtx<C>>, session_id: SessionId, live: Arc<dyn LiveSession>) {
    let mut event_rx = live.subscribe_events();
    tokio::spawn(async move {
        loop {
            match event_rx.recv().await {
                Ok(event) => {
                    let lifecycle = match event {
                        sessionmux_pty::LiveSessionEvent::Notify { message } => PtyLifecycleEvent::Notify { message },
                        sessionmux_pty::LiveSessionEvent::TurnCompleted => PtyLifecycleEvent::TurnCompleted,
                        sessionmux_pty::LiveSessionEvent::AttentionRequired { reason } => PtyLifecycleEvent::AttentionRequired { reason },
                        sessionmux_pty::LiveSessionEvent::SessionExit { code, signal } => PtyLifecycleEvent::SessionExit { code, signal },
                    };
                    let is_exit = matches!(lifecycle, PtyLifecycleEvent::SessionExit { .. });
                    let _ = ctx.sessions.record_lifecycle_event(session_id, lifecycle).await;
                    if is_exit {
                        return;
                    }
                }
                Err(tokio::sync::broadcast::error::RecvError::Lagged(_)) => continue,
                Err(tokio::sync::broadcast::error::RecvError::Closed) => return,
            }
        }
    });
}

async fn pty_attach<C: Clock + 'static>(
    ctx: &Arc<DaemonCtx<C>>,
    connection_id: ConnectionId,
    state: &mut ConnState,
    session_id: SessionId,
    since_cursor: Option<u64>,
) -> Result<CommandResult, SessionError> {
    if let Some(previous) = state.attached.remove(&session_id) {
        let _ = ctx.sessions.detach(session_id, previous).await;
    }

    let connections = Arc::clone(&ctx.connections);
    let sessions = Arc::clone(&ctx.sessions);
    let data_connections = Arc::clone(&connections);
    let data_sessions = Arc::clone(&sessions);
    let on_data = move |chunk: DataChunk| {
        let chunk_base64 = base64::engine::general_purpose::STANDARD.encode(&chunk.bytes);
        let len = chunk.bytes.len();
        let outcome = data_connections.send_envelope(
            connection_id,
            &ServerEnvelope::PtyOutput { session_id, cursor: chunk.cursor, chunk_base64 },
        );
        match outcome {
            SendOutcome::Sent => data_sessions.note_fanout(session_id, len, false, false),
            SendOutcome::WouldExceed => data_sessions.note_fanout(session_id, len, true, true),
            SendOutcome::NotFound => {}
        }
    };
    let exit_connections = Arc::clone(&connections);
    let on_exit = move |exit: ExitInfo| {
        exit_connections.send_envelope(connection_id, &ServerEnvelope::PtyExit { session_id, code: exit.code, signal: exit.signal });
    };

    let handlers = AttachHandlers { on_data: Box::new(on_data), on_exit: Box::new(on_exit) };
    let (attachment_id, latest_cursor) = ctx.sessions.attach(session_id, handlers, since_cursor).await?;
    state.attached.insert(session_id, attachment_id);
    Ok(CommandResult::PtyAttached { latest_cursor })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn send_to_unregistered_connection_is_not_found() {
        let registry = ConnectionRegistry::new(1024);
        let outcome = registry.send_envelope(ConnectionId::new(), &ServerEnvelope::AuthOk);
        assert_eq!(outcome, SendOutcome::NotFound);
    }

    #[test]
    fn exceeding_the_budget_cancels_and_reports_would_exceed() {
        let registry = ConnectionRegistry::new(8);
        let (tx, _rx) = mpsc::unbounded_channel();
        let queued = Arc::new(AtomicUsize::new(0));
        let cancel = CancellationToken::new();
        let id = ConnectionId::new();
        registry.register(id, tx, Arc::clone(&queued), cancel.clone());
        let big_envelope = ServerEnvelope::AuthError { error: "x".repeat(64) };
        let outcome = registry.send_envelope(id, &big_envelope);
        assert_eq!(outcome, SendOutcome::WouldExceed);
        assert!(cancel.is_cancelled());
    }

    #[test]
    fn small_payload_within_budget_is_sent() {
        let registry = ConnectionRegistry::new(4096);
        let (tx, mut rx) = mpsc::unbounded_channel();
        let queued = Arc::new(AtomicUsize::new(0));
        let cancel = CancellationToken::new();
        let id = ConnectionId::new();
        registry.register(id, tx, queued, cancel);
        let outcome = registry.send_envelope(id, &ServerEnvelope::AuthOk);
        assert_eq!(outcome, SendOutcome::Sent);
        assert!(rx.try_recv().is_ok());
    }
}
