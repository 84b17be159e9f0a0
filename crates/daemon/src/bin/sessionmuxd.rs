// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! sessionmuxd: the control-plane daemon. Parses configuration, opens the
//! state store, recovers persisted sessions, and serves the TCP control
//! plane and the telemetry HTTP side-channel until shutdown (§4.7).

use clap::Parser;
use parking_lot::Mutex;
use sessionmux_core::{Clock, SystemClock};
use sessionmux_daemon::config::{github_token_from_env, webhook_urls_from_env};
use sessionmux_daemon::error::StartupError;
use sessionmux_daemon::hooks::{HooksConfig, HooksRuntime};
use sessionmux_daemon::poller::{spawn_git_status_refresher, spawn_github_poller, spawn_history_tailer, PollerRegistry};
use sessionmux_daemon::session::{launch_command_for, SessionRuntime};
use sessionmux_daemon::telemetry::{TelemetryFilterMode, TokenTable};
use sessionmux_daemon::{connection, telemetry, DaemonConfig, DaemonCtx, Journal, PerfLogger};
use sessionmux_pty::{LiveSession, ProcessLiveSession};
use sessionmux_storage::{MemoryStateStore, StateStore};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

const TOMBSTONE_SWEEP_INTERVAL: std::time::Duration = std::time::Duration::from_secs(30);

#[tokio::main]
async fn main() {
    let config = DaemonConfig::parse();
    if let Err(e) = config.validate() {
        eprintln!("sessionmuxd: {e}");
        std::process::exit(1);
    }

    let _log_guard = setup_logging(&config);

    match run(config).await {
        Ok(()) => info!("sessionmuxd exited cleanly"),
        Err(e) => {
            error!(error = %e, "sessionmuxd failed to start");
            std::process::exit(1);
        }
    }
}

async fn run(config: DaemonConfig) -> Result<(), StartupError> {
    let store: Arc<dyn StateStore> = Arc::new(MemoryStateStore::open(&config.state_db_path)?);
    let journal = Arc::new(Mutex::new(Journal::new(config.max_stream_journal_entries)));
    let connections = Arc::new(connection::ConnectionRegistry::new(config.max_connection_buffered_bytes));
    let hooks = HooksRuntime::spawn(HooksConfig { webhook_urls: webhook_urls_from_env() }, SystemClock);
    let perf = PerfLogger::spawn(perf_sink(&config).await?, HashMap::new());
    let pollers = Arc::new(PollerRegistry::new());
    let telemetry_tokens = Arc::new(TokenTable::new());

    let sessions = Arc::new(SessionRuntime::new(
        Arc::clone(&store),
        Arc::clone(&journal),
        SystemClock,
        config.session_exit_tombstone_ttl_ms,
        Arc::clone(&connections),
        hooks.clone(),
    ));

    let ctx = Arc::new(DaemonCtx {
        sessions,
        journal,
        store,
        perf,
        clock: SystemClock,
        auth_token: config.auth_token.clone(),
        max_connection_buffered_bytes: config.max_connection_buffered_bytes,
        connections,
        pollers: Arc::clone(&pollers),
        telemetry_tokens,
    });

    recover_sessions(&ctx).await;

    let control_listener = TcpListener::bind((config.host, config.port))
        .await
        .map_err(|e| StartupError::BindFailed(format!("{}:{}", config.host, config.port), e))?;
    let telemetry_listener = TcpListener::bind((config.telemetry_host, config.telemetry_port))
        .await
        .map_err(|e| StartupError::BindFailed(format!("{}:{}", config.telemetry_host, config.telemetry_port), e))?;

    info!(host = %config.host, port = config.port, telemetry_port = config.telemetry_port, "sessionmuxd ready");

    let poller_cancel = CancellationToken::new();
    let listener_cancel = CancellationToken::new();

    let poller_handles = spawn_pollers(&ctx, &config, poller_cancel.clone()).await;

    let control_task = tokio::spawn(connection::serve(Arc::clone(&ctx), control_listener, listener_cancel.clone()));
    let telemetry_task = tokio::spawn(telemetry::serve(
        Arc::clone(&ctx),
        telemetry_listener,
        TelemetryFilterMode::LifecycleFast,
        config.telemetry_max_requests_per_token_per_second,
        listener_cancel.clone(),
    ));

    wait_for_shutdown_signal().await;
    info!("shutdown requested");

    // §4.7 shutdown ordering: stop all timers; await any in-flight poll;
    // destroy every session (closing live ones); close all connections;
    // close listeners; close the lifecycle-hooks runtime; close the state
    // store.
    poller_cancel.cancel();
    for handle in poller_handles {
        let _ = handle.await;
    }

    ctx.sessions.shutdown_all().await;

    ctx.connections.close_all();

    listener_cancel.cancel();
    let _ = control_task.await;
    let _ = telemetry_task.await;

    hooks.close();

    ctx.store.close().await?;

    Ok(())
}

/// Startup auto-recover (§4.3): reconstructs every non-archived persisted
/// conversation's live session. Failures are logged and counted, never
/// fatal to the overall startup.
async fn recover_sessions<C: Clock + 'static>(ctx: &Arc<DaemonCtx<C>>) {
    let conversations = match ctx.store.list_conversations(false).await {
        Ok(records) => records,
        Err(e) => {
            warn!(error = %e, "failed to list persisted conversations for startup recovery");
            return;
        }
    };

    let mut recovered = 0usize;
    let mut failed = 0usize;
    for record in conversations {
        let session_id = record.conversation_id;
        let cwd = match record.directory_id {
            Some(directory_id) => match ctx.store.get_directory(directory_id).await {
                Ok(dir) => dir.map(|d| std::path::PathBuf::from(d.cwd)),
                Err(e) => {
                    warn!(%session_id, error = %e, "failed to resolve directory during session recovery");
                    failed += 1;
                    continue;
                }
            },
            None => None,
        };

        let mut spawn_params = launch_command_for(record.agent_type, cwd, 24, 80);
        let token = ctx.telemetry_tokens.mint(session_id);
        spawn_params.env.push(("SESSIONMUX_OTLP_TOKEN".to_string(), token));

        let live: Arc<dyn LiveSession> = match ProcessLiveSession::spawn(spawn_params) {
            Ok(live) => Arc::new(live),
            Err(e) => {
                warn!(%session_id, error = %e, "failed to relaunch recovered session");
                failed += 1;
                continue;
            }
        };

        match ctx.sessions.recover(record, Arc::clone(&live)).await {
            Ok(()) => {
                connection::spawn_lifecycle_bridge(Arc::clone(ctx), session_id, live);
                recovered += 1;
            }
            Err(e) => {
                warn!(%session_id, error = %e, "failed to register recovered session");
                failed += 1;
            }
        }
    }

    if recovered > 0 || failed > 0 {
        info!(recovered, failed, "startup auto-recover complete");
    }
}

/// Spawns the background pollers (§4.7): the history tailer, the
/// per-directory git-status refresher, and the GitHub PR poller. The
/// directory/repository tuples are seeded once at startup from the state
/// store; picking up directories or repositories created afterward awaits a
/// future re-seed pass rather than a live watch.
async fn spawn_pollers<C: Clock + 'static>(
    ctx: &Arc<DaemonCtx<C>>,
    config: &DaemonConfig,
    cancel: CancellationToken,
) -> Vec<tokio::task::JoinHandle<()>> {
    let mut handles = Vec::new();

    let history_path = config.state_db_path.with_file_name("history.jsonl");
    handles.push(spawn_history_tailer(
        history_path,
        Arc::clone(&ctx.store),
        Arc::clone(&ctx.journal),
        Arc::clone(&ctx.pollers),
        ctx.clock.clone(),
        cancel.clone(),
    ));

    let directories: Vec<_> = ctx
        .store
        .list_directories(false)
        .await
        .unwrap_or_default()
        .into_iter()
        .map(|d| (d.directory_id, std::path::PathBuf::from(d.cwd)))
        .collect();
    handles.push(spawn_git_status_refresher(
        directories,
        std::time::Duration::from_millis(config.git_status_min_refresh_ms),
        config.git_status_max_concurrency,
        Arc::clone(&ctx.store),
        Arc::clone(&ctx.journal),
        Arc::clone(&ctx.pollers),
        ctx.clock.clone(),
        cancel.clone(),
    ));

    // Repository records don't yet track a tracked branch per directory, so
    // the GitHub poller has no tuples to seed at startup; populating it
    // awaits directory-level branch tracking (DESIGN.md).
    let repo_tuples = Vec::new();
    handles.push(spawn_github_poller(
        repo_tuples,
        github_token_from_env(),
        config.github_poll_max_concurrency,
        Arc::clone(&ctx.store),
        Arc::clone(&ctx.journal),
        Arc::clone(&ctx.pollers),
        ctx.clock.clone(),
        cancel.clone(),
    ));

    handles.push(spawn_tombstone_sweeper(ctx, cancel));
    handles
}

/// Periodically drops tombstoned sessions whose retention TTL has elapsed
/// (§4.3). Treated as one of the "timers" stopped first during shutdown.
fn spawn_tombstone_sweeper<C: Clock + 'static>(ctx: &Arc<DaemonCtx<C>>, cancel: CancellationToken) -> tokio::task::JoinHandle<()> {
    let ctx = Arc::clone(ctx);
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(TOMBSTONE_SWEEP_INTERVAL);
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    let now_ms = ctx.clock.epoch_ms();
                    let swept = ctx.sessions.sweep_tombstones(now_ms);
                    if !swept.is_empty() {
                        info!(count = swept.len(), "swept expired session tombstones");
                    }
                }
                _ = cancel.cancelled() => return,
            }
        }
    })
}

#[cfg(unix)]
async fn wait_for_shutdown_signal() {
    use tokio::signal::unix::{signal, SignalKind};
    let mut sigterm = match signal(SignalKind::terminate()) {
        Ok(s) => s,
        Err(e) => {
            warn!(error = %e, "failed to install SIGTERM handler");
            let _ = tokio::signal::ctrl_c().await;
            return;
        }
    };
    tokio::select! {
        _ = sigterm.recv() => {}
        _ = tokio::signal::ctrl_c() => {}
    }
}

#[cfg(not(unix))]
async fn wait_for_shutdown_signal() {
    let _ = tokio::signal::ctrl_c().await;
}

async fn perf_sink(config: &DaemonConfig) -> Result<Box<dyn tokio::io::AsyncWrite + Unpin + Send>, StartupError> {
    let Some(log_dir) = &config.log_dir else {
        return Ok(Box::new(tokio::io::sink()));
    };
    tokio::fs::create_dir_all(log_dir).await?;
    let file = tokio::fs::OpenOptions::new().create(true).append(true).open(log_dir.join("perf.jsonl")).await?;
    Ok(Box::new(file))
}

fn setup_logging(config: &DaemonConfig) -> Option<tracing_appender::non_blocking::WorkerGuard> {
    use tracing_subscriber::{fmt, prelude::*, EnvFilter};

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    match &config.log_dir {
        Some(log_dir) => {
            if let Err(e) = std::fs::create_dir_all(log_dir) {
                eprintln!("sessionmuxd: failed to create log directory {}: {e}", log_dir.display());
            }
            let file_appender = tracing_appender::rolling::daily(log_dir, "sessionmuxd.log");
            let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);
            tracing_subscriber::registry().with(filter).with(fmt::layer().with_writer(non_blocking)).init();
            Some(guard)
        }
        None => {
            tracing_subscriber::registry().with(filter).with(fmt::layer()).init();
            None
        }
    }
}
