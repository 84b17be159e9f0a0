//! End-to-end specs
//!
//! Drives a real `sessionmuxd` binary over its TCP control plane and
//! telemetry HTTP side-channel, exercising the cross-cutting behaviors
//! that unit tests inside each crate can't see on their own: replay
//! across a real attach, connection-scoped claim takeover, back-pressure
//! disconnects, telemetry dedupe through a real PTY-spawned token, the
//! zero-TTL tombstone boundary, and a stale journal cursor.

use base64::Engine;
use sessionmux_core::{AgentKind, CommandId, SessionId, TenantId, UserId, WorkspaceId};
use sessionmux_wire::{ClientEnvelope, Command, CommandResult, ServerEnvelope};
use std::io::{Read, Write};
use std::net::{TcpListener, TcpStream};
use std::process::{Child, Command as OsCommand};
use std::time::{Duration, Instant};

const READY_WAIT_MAX_MS: u64 = 5_000;

/// Binds an ephemeral port, then immediately releases it for the daemon to
/// rebind. Racy in theory, plenty stable in practice for a local spec run.
fn free_port() -> u16 {
    let listener = TcpListener::bind("127.0.0.1:0").expect("bind ephemeral port");
    listener.local_addr().expect("local addr").port()
}

fn wait_for(max_ms: u64, mut predicate: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + Duration::from_millis(max_ms);
    loop {
        if predicate() {
            return true;
        }
        if Instant::now() >= deadline {
            return false;
        }
        std::thread::sleep(Duration::from_millis(25));
    }
}

/// A running `sessionmuxd` process, torn down on drop.
struct Daemon {
    child: Child,
    port: u16,
    telemetry_port: u16,
    #[allow(dead_code)]
    state_dir: tempfile::TempDir,
}

impl Daemon {
    fn start(extra_args: &[&str]) -> Self {
        let state_dir = tempfile::tempdir().expect("tempdir");
        let port = free_port();
        let telemetry_port = free_port();
        let bin = assert_cmd::cargo::cargo_bin("sessionmuxd");

        let child = OsCommand::new(bin)
            .arg("--port")
            .arg(port.to_string())
            .arg("--telemetry-port")
            .arg(telemetry_port.to_string())
            .arg("--state-db-path")
            .arg(state_dir.path().join("sessionmux-state.wal"))
            .args(extra_args)
            .spawn()
            .expect("spawn sessionmuxd");

        let daemon = Self { child, port, telemetry_port, state_dir };
        assert!(
            wait_for(READY_WAIT_MAX_MS, || TcpStream::connect(("127.0.0.1", daemon.port)).is_ok()),
            "daemon did not start listening on the control plane in time"
        );
        daemon
    }

    fn connect(&self) -> Client {
        let stream = TcpStream::connect(("127.0.0.1", self.port)).expect("connect to control plane");
        stream.set_nodelay(true).expect("set nodelay");
        Client { stream, buf: Vec::new() }
    }
}

impl Drop for Daemon {
    fn drop(&mut self) {
        let _ = self.child.kill();
        let _ = self.child.wait();
    }
}

/// A single control-plane connection, speaking the real envelope types
/// directly rather than hand-rolled JSON.
struct Client {
    stream: TcpStream,
    buf: Vec<u8>,
}

impl Client {
    fn send_envelope(&mut self, envelope: &ClientEnvelope) {
        let bytes = sessionmux_wire::encode(envelope);
        self.stream.write_all(&bytes).expect("write envelope");
    }

    fn send_command(&mut self, command: Command) -> CommandId {
        let command_id = CommandId::new();
        self.send_envelope(&ClientEnvelope::Command { command_id, command });
        command_id
    }

    /// Pulls one framed envelope off the wire, waiting up to `timeout` for
    /// it to arrive. `None` covers both a clean close and a plain timeout;
    /// callers that need to tell those apart read the raw socket directly.
    fn try_read_envelope(&mut self, timeout: Duration) -> Option<ServerEnvelope> {
        loop {
            if let Some(pos) = self.buf.iter().position(|&b| b == b'\n') {
                let line: Vec<u8> = self.buf.drain(..=pos).collect();
                let line = &line[..line.len() - 1];
                if line.is_empty() {
                    continue;
                }
                return Some(serde_json::from_slice(line).expect("parse server envelope"));
            }
            self.stream.set_read_timeout(Some(timeout)).expect("set read timeout");
            let mut chunk = [0u8; 4096];
            match self.stream.read(&mut chunk) {
                Ok(0) => return None,
                Ok(n) => self.buf.extend_from_slice(&chunk[..n]),
                Err(e) if matches!(e.kind(), std::io::ErrorKind::WouldBlock | std::io::ErrorKind::TimedOut) => return None,
                Err(e) => panic!("read error: {e}"),
            }
        }
    }

    fn read_reply(&mut self) -> ServerEnvelope {
        self.try_read_envelope(Duration::from_secs(10)).expect("connection closed while waiting for a reply")
    }

    /// Sends a command and waits for its matching `command.completed` or
    /// `command.failed`, skipping over the intervening `command.accepted`
    /// and any unrelated fanout that happens to interleave on the socket.
    fn run_command(&mut self, command: Command) -> Result<CommandResult, String> {
        let command_id = self.send_command(command);
        loop {
            match self.read_reply() {
                ServerEnvelope::CommandAccepted { command_id: id } if id == command_id => continue,
                ServerEnvelope::CommandCompleted { command_id: id, result } if id == command_id => return Ok(result),
                ServerEnvelope::CommandFailed { command_id: id, error } if id == command_id => return Err(error),
                _ => continue,
            }
        }
    }

    /// Collects decoded `pty.output` bytes for `session_id` until `needle`
    /// shows up or `timeout` elapses.
    fn collect_pty_output_until(&mut self, session_id: SessionId, needle: &str, timeout: Duration) -> String {
        let deadline = Instant::now() + timeout;
        let mut collected = Vec::new();
        while Instant::now() < deadline {
            match self.try_read_envelope(Duration::from_millis(200)) {
                Some(ServerEnvelope::PtyOutput { session_id: sid, chunk_base64, .. }) if sid == session_id => {
                    if let Ok(bytes) = base64::engine::general_purpose::STANDARD.decode(chunk_base64) {
                        collected.extend_from_slice(&bytes);
                    }
                    if String::from_utf8_lossy(&collected).contains(needle) {
                        break;
                    }
                }
                Some(_) => continue,
                None => continue,
            }
        }
        String::from_utf8_lossy(&collected).into_owned()
    }

    /// Collects decoded `pty.output` bytes for `session_id` for the full
    /// `duration`, regardless of content. Used where a shell's own echo of
    /// typed input could otherwise be mistaken for the command's output.
    fn collect_pty_output_for(&mut self, session_id: SessionId, duration: Duration) -> String {
        let deadline = Instant::now() + duration;
        let mut collected = Vec::new();
        while Instant::now() < deadline {
            if let Some(ServerEnvelope::PtyOutput { session_id: sid, chunk_base64, .. }) = self.try_read_envelope(Duration::from_millis(200)) {
                if sid == session_id {
                    if let Ok(bytes) = base64::engine::general_purpose::STANDARD.decode(chunk_base64) {
                        collected.extend_from_slice(&bytes);
                    }
                }
            }
        }
        String::from_utf8_lossy(&collected).into_owned()
    }
}

fn pty_input(session_id: SessionId, line: &str) -> ClientEnvelope {
    ClientEnvelope::PtyInput {
        session_id,
        data_base64: base64::engine::general_purpose::STANDARD.encode(line.as_bytes()),
    }
}

fn start_terminal_session(client: &mut Client) -> SessionId {
    let session_id = SessionId::new();
    let result = client
        .run_command(Command::PtyStart {
            session_id,
            tenant_id: TenantId::new(),
            user_id: UserId::new(),
            workspace_id: WorkspaceId::new(),
            directory_id: None,
            worktree_id: None,
            agent_kind: AgentKind::Terminal,
        })
        .expect("pty.start");
    match result {
        CommandResult::PtyStarted { session_id: sid } => assert_eq!(sid, session_id),
        other => panic!("unexpected pty.start result: {other:?}"),
    }
    session_id
}

fn http_post_status(port: u16, path: &str, body: &serde_json::Value) -> u16 {
    let payload = serde_json::to_vec(body).expect("serialize telemetry body");
    let mut stream = TcpStream::connect(("127.0.0.1", port)).expect("connect to telemetry ingest");
    stream.set_read_timeout(Some(Duration::from_secs(5))).expect("set read timeout");
    let request = format!(
        "POST {path} HTTP/1.1\r\nHost: 127.0.0.1\r\nContent-Type: application/json\r\nContent-Length: {len}\r\nConnection: close\r\n\r\n",
        len = payload.len(),
    );
    stream.write_all(request.as_bytes()).expect("write request line");
    stream.write_all(&payload).expect("write telemetry body");
    let mut response = Vec::new();
    stream.read_to_end(&mut response).expect("read telemetry response");
    let status_line = response.split(|&b| b == b'\n').next().unwrap_or_default();
    String::from_utf8_lossy(status_line)
        .split_whitespace()
        .nth(1)
        .and_then(|code| code.parse().ok())
        .unwrap_or(0)
}

/// Attaching with `since_cursor: 0` replays everything a session already
/// produced before anyone attached, not just output from the attach point
/// forward.
#[test]
fn attach_replays_output_produced_before_the_client_attached() {
    let daemon = Daemon::start(&[]);
    let mut client = daemon.connect();
    let session_id = start_terminal_session(&mut client);

    client.send_envelope(&pty_input(session_id, "echo REPLAY-MARKER\n"));
    std::thread::sleep(Duration::from_millis(500));

    let attached = client
        .run_command(Command::PtyAttach { session_id, since_cursor: Some(0) })
        .expect("pty.attach");
    let latest_cursor = match attached {
        CommandResult::PtyAttached { latest_cursor } => latest_cursor,
        other => panic!("unexpected pty.attach result: {other:?}"),
    };
    assert!(latest_cursor > 0, "the shell should have produced output before the attach");

    let replayed = client.collect_pty_output_until(session_id, "REPLAY-MARKER", Duration::from_secs(5));
    assert!(replayed.contains("REPLAY-MARKER"), "attach did not replay prior output: {replayed:?}");
}

/// A claim is scoped to the connection that made it. A second connection
/// can't claim a session already held by the first without `takeover`, and
/// a takeover displaces the first connection's control entirely.
#[test]
fn takeover_claim_displaces_the_previous_controller() {
    let daemon = Daemon::start(&[]);
    let mut owner = daemon.connect();
    let session_id = start_terminal_session(&mut owner);

    let claimed = owner
        .run_command(Command::SessionClaim {
            session_id,
            controller_id: "agent-a".to_string(),
            controller_type: "agent".to_string(),
            controller_label: None,
            takeover: false,
        })
        .expect("first claim should succeed");
    match claimed {
        CommandResult::SessionController { controller: Some(summary) } => assert_eq!(summary.controller_id, "agent-a"),
        other => panic!("unexpected session.claim result: {other:?}"),
    }

    let mut contender = daemon.connect();
    let rejected = contender.run_command(Command::SessionClaim {
        session_id,
        controller_id: "agent-b".to_string(),
        controller_type: "agent".to_string(),
        controller_label: None,
        takeover: false,
    });
    let error = rejected.expect_err("claiming an already-claimed session without takeover should fail");
    assert!(error.contains("claimed by"), "unexpected claim error: {error}");

    let taken_over = contender
        .run_command(Command::SessionClaim {
            session_id,
            controller_id: "agent-b".to_string(),
            controller_type: "agent".to_string(),
            controller_label: None,
            takeover: true,
        })
        .expect("takeover claim should succeed");
    match taken_over {
        CommandResult::SessionController { controller: Some(summary) } => assert_eq!(summary.controller_id, "agent-b"),
        other => panic!("unexpected takeover result: {other:?}"),
    }

    // The displaced connection no longer controls the session.
    let now_rejected = owner.run_command(Command::SessionRespond { session_id, text: "hello".to_string() });
    let error = now_rejected.expect_err("the previous controller should have lost control");
    assert!(error.contains("claimed by"), "unexpected error after takeover: {error}");
}

/// Pinning the per-connection buffered-bytes budget below the size of even
/// the first outbound envelope forces an immediate, deterministic
/// back-pressure disconnect instead of needing to race real output volume.
#[test]
fn exceeding_the_connection_buffer_budget_disconnects_the_socket() {
    let daemon = Daemon::start(&["--max-connection-buffered-bytes", "4"]);
    let mut client = daemon.connect();

    client.send_command(Command::AgentToolsStatus);

    client.stream.set_read_timeout(Some(Duration::from_secs(5))).expect("set read timeout");
    let mut buf = [0u8; 1024];
    match client.stream.read(&mut buf) {
        Ok(0) => {}
        Ok(n) => panic!("expected the connection to be torn down, got {n} bytes instead"),
        Err(e) => panic!("expected a clean disconnect, got a read error: {e}"),
    }
}

/// Telemetry ingest dedupes on the `(source, session, event name, provider
/// thread id)` fingerprint, not on body content — and the ingest token
/// never travels on the control-plane wire, only into the spawned agent's
/// environment, so the test recovers it the same way a real agent would:
/// by reading it back out of its own environment over the PTY.
#[test]
fn repeated_telemetry_with_the_same_fingerprint_is_retained_once() {
    let daemon = Daemon::start(&[]);
    let mut client = daemon.connect();
    let session_id = start_terminal_session(&mut client);
    client.run_command(Command::PtyAttach { session_id, since_cursor: Some(0) }).expect("pty.attach");

    client.send_envelope(&pty_input(session_id, "echo $SESSIONMUX_OTLP_TOKEN\n"));
    // Collect for the whole window rather than stopping at the first
    // newline: the tty's own echo of the typed command line also ends in
    // one, well before the shell's expanded output line arrives.
    let output = client.collect_pty_output_for(session_id, Duration::from_secs(3));
    let token = output
        .split_whitespace()
        .find(|tok| tok.len() == 32 && tok.chars().all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-'))
        .unwrap_or_else(|| panic!("could not find the ingest token in pty output: {output:?}"))
        .to_string();

    let body = serde_json::json!({
        "eventName": "codex.user_prompt",
        "providerThreadId": "thread-1",
        "prompt": "hello there",
    });
    let path = format!("/v1/logs/{token}");
    assert_eq!(http_post_status(daemon.telemetry_port, &path, &body), 200);
    assert_eq!(http_post_status(daemon.telemetry_port, &path, &body), 200);

    let diagnostics = client.run_command(Command::SessionDiagnostics { session_id }).expect("session.diagnostics");
    match diagnostics {
        CommandResult::SessionDiagnostics(d) => {
            assert_eq!(d.telemetry_ingested_total, 2);
            assert_eq!(d.telemetry_retained_total, 1);
            assert_eq!(d.telemetry_dropped_total, 1);
        }
        other => panic!("unexpected session.diagnostics result: {other:?}"),
    }
}

/// A zero-length tombstone TTL means the session disappears from
/// `session.status` the moment its exit is recorded, not on the next
/// periodic sweep (which only runs every 30s).
#[test]
fn zero_tombstone_ttl_removes_the_session_immediately_on_exit() {
    let daemon = Daemon::start(&["--session-exit-tombstone-ttl-ms", "0"]);
    let mut client = daemon.connect();
    let session_id = start_terminal_session(&mut client);

    client.send_envelope(&pty_input(session_id, "exit\n"));

    let vanished = wait_for(5_000, || client.run_command(Command::SessionStatus { session_id }).is_err());
    assert!(vanished, "session should be gone from the live table right after it exits with a zero TTL");
}

/// When the journal's ring capacity is too small to cover the gap between a
/// subscriber's last-seen cursor and the oldest retained entry, the
/// subscription comes back stale with an empty backlog rather than
/// silently skipping the missing entries.
#[test]
fn subscribing_past_the_journal_ring_capacity_comes_back_stale() {
    let daemon = Daemon::start(&["--max-stream-journal-entries", "1"]);
    let mut client = daemon.connect();

    for cwd in ["/tmp/one", "/tmp/two"] {
        client
            .run_command(Command::DirectoryUpsert {
                directory_id: None,
                tenant_id: TenantId::new(),
                user_id: UserId::new(),
                workspace_id: WorkspaceId::new(),
                cwd: cwd.to_string(),
            })
            .expect("directory.upsert");
    }

    let subscribed = client
        .run_command(Command::StreamSubscribe { filter: Default::default(), after_cursor: Some(0) })
        .expect("stream.subscribe");
    match subscribed {
        CommandResult::StreamSubscribed { stale, backlog, .. } => {
            assert!(stale, "a cursor older than the ring's oldest entry should come back stale");
            assert!(backlog.is_empty(), "a stale subscription should not return a partial backlog");
        }
        other => panic!("unexpected stream.subscribe result: {other:?}"),
    }
}
