// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Background pollers (§4.7): a single-flight history tailer, a per-directory
//! git-status refresher, and the external-integration (GitHub) poller. Each
//! is scheduled with [`Backoff`] and reports into a shared [`PollerRegistry`]
//! that backs the `poller.status` command.

use crate::error::PollerError;
use crate::journal::Journal;
use parking_lot::Mutex;
use sessionmux_core::{Backoff, Clock, DirectoryId, RepositoryId};
use sessionmux_storage::{StateStore, TelemetryRecord, TelemetrySource};
use sessionmux_wire::ObservedEvent;
use sessionmux_core::MetricsHealth;
use sessionmux_wire::PollerStatusEntry;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::warn;

/// Health-tracking table shared by every poller, read back out by
/// `poller.status` (§6).
#[derive(Default)]
pub struct PollerRegistry {
    health: Mutex<HashMap<&'static str, MetricsHealth>>,
}

impl PollerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn record_success(&self, name: &'static str, now_ms: u64) {
        self.health.lock().entry(name).or_default().record_success(now_ms);
    }

    fn record_failure(&self, name: &'static str, now_ms: u64, error: impl Into<String>) {
        self.health.lock().entry(name).or_default().record_failure(now_ms, error);
    }

    pub fn status(&self) -> Vec<PollerStatusEntry> {
        self.health
            .lock()
            .iter()
            .map(|(name, health)| PollerStatusEntry {
                name: name.to_string(),
                last_run_at_ms: health.last_run_at_ms,
                last_error: health.last_error.clone(),
                consecutive_failures: health.consecutive_failures,
            })
            .collect()
    }
}

fn jitter_sample() -> f64 {
    use rand::Rng;
    rand::thread_rng().gen_range(0.0..1.0)
}

/// Tails a newline-delimited JSON history file for new entries, ingesting
/// each as telemetry. Single-flighted: only one tail pass runs at a time,
/// scheduled by [`Backoff`] (productive polls reset it, empty/error polls
/// back off), and stoppable via `cancel`.
pub fn spawn_history_tailer<C: Clock + 'static>(
    path: std::path::PathBuf,
    store: Arc<dyn StateStore>,
    journal: Arc<Mutex<Journal>>,
    registry: Arc<PollerRegistry>,
    clock: C,
    cancel: CancellationToken,
) -> tokio::task::JoinHandle<()> {
    const NAME: &str = "history-tailer";
    tokio::spawn(async move {
        let mut backoff = Backoff::new(Duration::from_millis(500), Duration::from_secs(30));
        let mut offset: u64 = 0;
        loop {
            if cancel.is_cancelled() {
                return;
            }
            let now_ms = clock.epoch_ms();
            match tail_once(&path, &mut offset, &store, &journal, now_ms).await {
                Ok(ingested) if ingested > 0 => {
                    registry.record_success(NAME, now_ms);
                    let delay = backoff.on_success(jitter_sample());
                    tokio::select! { _ = tokio::time::sleep(delay) => {}, _ = cancel.cancelled() => return }
                }
                Ok(_) => {
                    registry.record_success(NAME, now_ms);
                    let delay = backoff.on_idle_or_error(jitter_sample());
                    tokio::select! { _ = tokio::time::sleep(delay) => {}, _ = cancel.cancelled() => return }
                }
                Err(e) => {
                    warn!(error = %e, "history tailer poll failed");
                    registry.record_failure(NAME, now_ms, e.to_string());
                    let delay = backoff.on_idle_or_error(jitter_sample());
                    tokio::select! { _ = tokio::time::sleep(delay) => {}, _ = cancel.cancelled() => return }
                }
            }
        }
    })
}

async fn tail_once(
    path: &std::path::Path,
    offset: &mut u64,
    store: &Arc<dyn StateStore>,
    journal: &Arc<Mutex<Journal>>,
    now_ms: u64,
) -> Result<usize, PollerError> {
    use tokio::io::{AsyncBufReadExt, AsyncSeekExt};

    let mut file = match tokio::fs::File::open(path).await {
        Ok(f) => f,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(0),
        Err(e) => return Err(e.into()),
    };

    let size = file.metadata().await?.len();
    if size < *offset {
        // The history file was truncated or replaced underneath us; restart
        // from the top rather than seeking past end-of-file.
        *offset = 0;
    } else if *offset > 0 {
        let mut probe = vec![0u8; 1];
        file.seek(std::io::SeekFrom::Start(*offset - 1)).await?;
        use tokio::io::AsyncReadExt;
        if file.read_exact(&mut probe).await.is_err() || probe[0] != b'\n' {
            *offset = 0;
        }
    }
    file.seek(std::io::SeekFrom::Start(*offset)).await?;
    let mut lines = tokio::io::BufReader::new(file).lines();

    let mut ingested = 0usize;
    let mut consumed = *offset;
    while let Some(line) = lines.next_line().await? {
        consumed += line.len() as u64 + 1;
        if line.trim().is_empty() {
            continue;
        }
        let payload: serde_json::Value = match serde_json::from_str(&line) {
            Ok(v) => v,
            Err(_) => continue,
        };
        let fingerprint = sessionmux_core::fingerprint::stable_fingerprint(["history", line.trim()]);
        let record = TelemetryRecord {
            source: TelemetrySource::History,
            session_id: None,
            provider_thread_id: payload.get("threadId").and_then(|v| v.as_str()).map(String::from),
            event_name: payload.get("event").and_then(|v| v.as_str()).map(String::from),
            severity: None,
            summary: None,
            observed_at_ms: now_ms,
            fingerprint,
            payload,
        };
        if store.append_telemetry(record.clone()).await? {
            ingested += 1;
            journal.lock().publish(
                sessionmux_core::Scope::default(),
                ObservedEvent::SessionKeyEvent {
                    session_id: sessionmux_core::SessionId::new(),
                    event_name: record.event_name.unwrap_or_else(|| "history.entry".to_string()),
                    severity: None,
                    summary: None,
                },
            );
        }
    }
    *offset = consumed;
    Ok(ingested)
}

/// One directory's worth of git metadata refreshed via `git status`/`git
/// rev-parse`, gated by a per-directory cooldown and a bounded worker pool.
pub fn spawn_git_status_refresher<C: Clock + 'static>(
    directories: Vec<(DirectoryId, std::path::PathBuf)>,
    cooldown: Duration,
    max_concurrency: usize,
    store: Arc<dyn StateStore>,
    journal: Arc<Mutex<Journal>>,
    registry: Arc<PollerRegistry>,
    clock: C,
    cancel: CancellationToken,
) -> tokio::task::JoinHandle<()> {
    const NAME: &str = "git-status-refresher";
    tokio::spawn(async move {
        let semaphore = Arc::new(tokio::sync::Semaphore::new(max_concurrency.max(1)));
        let mut last_run: HashMap<DirectoryId, u64> = HashMap::new();
        loop {
            if cancel.is_cancelled() {
                return;
            }
            let now_ms = clock.epoch_ms();
            let mut handles = Vec::new();
            for (directory_id, cwd) in &directories {
                let due = last_run.get(directory_id).map_or(true, |&at| now_ms.saturating_sub(at) >= cooldown.as_millis() as u64);
                if !due {
                    continue;
                }
                last_run.insert(*directory_id, now_ms);
                let permit = Arc::clone(&semaphore);
                let cwd = cwd.clone();
                let store = Arc::clone(&store);
                let journal = Arc::clone(&journal);
                let directory_id = *directory_id;
                handles.push(tokio::spawn(async move {
                    let _permit = permit.acquire_owned().await.ok();
                    refresh_git_status(directory_id, &cwd, &store, &journal).await
                }));
            }
            let mut any_error = None;
            for handle in handles {
                if let Ok(Err(e)) = handle.await {
                    any_error = Some(e);
                }
            }
            match any_error {
                Some(e) => registry.record_failure(NAME, now_ms, e.to_string()),
                None => registry.record_success(NAME, now_ms),
            }
            tokio::select! { _ = tokio::time::sleep(Duration::from_secs(2)) => {}, _ = cancel.cancelled() => return }
        }
    })
}

async fn refresh_git_status(
    directory_id: DirectoryId,
    cwd: &std::path::Path,
    store: &Arc<dyn StateStore>,
    journal: &Arc<Mutex<Journal>>,
) -> Result<(), PollerError> {
    let output = tokio::process::Command::new("git")
        .arg("status")
        .arg("--porcelain=v2")
        .arg("--branch")
        .current_dir(cwd)
        .output()
        .await?;
    let record = serde_json::json!({
        "exitCode": output.status.code(),
        "porcelain": String::from_utf8_lossy(&output.stdout),
    });
    store
        .write_sync_state(format!("git-status:{directory_id}"), 0, None)
        .await?;
    journal.lock().publish(
        sessionmux_core::Scope::default(),
        ObservedEvent::DirectoryGitUpdated { directory_id, repository_id: None, record },
    );
    Ok(())
}

/// Polls GitHub for PR/job status across `(directory, repository, branch)`
/// tuples, memoizing the bearer token and bounding concurrency via a
/// semaphore (SPEC_FULL supplement over the single-tuple distilled spec).
pub fn spawn_github_poller<C: Clock + 'static>(
    tuples: Vec<(RepositoryId, String, String)>,
    bearer_token: Option<String>,
    max_concurrency: usize,
    store: Arc<dyn StateStore>,
    journal: Arc<Mutex<Journal>>,
    registry: Arc<PollerRegistry>,
    clock: C,
    cancel: CancellationToken,
) -> tokio::task::JoinHandle<()> {
    const NAME: &str = "github-poller";
    tokio::spawn(async move {
        let client = reqwest::Client::new();
        let semaphore = Arc::new(tokio::sync::Semaphore::new(max_concurrency.max(1)));
        let mut backoff = Backoff::new(Duration::from_secs(15), Duration::from_secs(300));
        loop {
            if cancel.is_cancelled() {
                return;
            }
            let now_ms = clock.epoch_ms();
            let mut handles = Vec::new();
            for (repository_id, owner_repo, branch) in &tuples {
                let permit = Arc::clone(&semaphore);
                let client = client.clone();
                let token = bearer_token.clone();
                let owner_repo = owner_repo.clone();
                let branch = branch.clone();
                let store = Arc::clone(&store);
                let journal = Arc::clone(&journal);
                let repository_id = *repository_id;
                handles.push(tokio::spawn(async move {
                    let _permit = permit.acquire_owned().await.ok();
                    poll_github_pr(&client, token.as_deref(), repository_id, &owner_repo, &branch, &store, &journal).await
                }));
            }
            let mut any_error = None;
            let mut any_success = false;
            for handle in handles {
                match handle.await {
                    Ok(Ok(())) => any_success = true,
                    Ok(Err(e)) => any_error = Some(e),
                    Err(_) => {}
                }
            }
            let delay = match any_error {
                Some(e) => {
                    registry.record_failure(NAME, now_ms, e.to_string());
                    backoff.on_idle_or_error(jitter_sample())
                }
                None if any_success => {
                    registry.record_success(NAME, now_ms);
                    backoff.on_success(jitter_sample())
                }
                None => {
                    registry.record_success(NAME, now_ms);
                    backoff.on_idle_or_error(jitter_sample())
                }
            };
            tokio::select! { _ = tokio::time::sleep(delay) => {}, _ = cancel.cancelled() => return }
        }
    })
}

async fn poll_github_pr(
    client: &reqwest::Client,
    bearer_token: Option<&str>,
    repository_id: RepositoryId,
    owner_repo: &str,
    branch: &str,
    store: &Arc<dyn StateStore>,
    journal: &Arc<Mutex<Journal>>,
) -> Result<(), PollerError> {
    let url = format!("https://api.github.com/repos/{owner_repo}/pulls?head={owner_repo}:{branch}&state=open");
    let mut request = client.get(&url).header("User-Agent", "sessionmuxd");
    if let Some(token) = bearer_token {
        request = request.bearer_auth(token);
    }
    let response = request.send().await?.error_for_status()?;
    let prs: Vec<serde_json::Value> = response.json().await?;
    for pr in prs {
        let pr_number = pr.get("number").and_then(|v| v.as_u64()).unwrap_or(0);
        let record = sessionmux_storage::PrRecord {
            repository_id,
            pr_number,
            task_ids: Vec::new(),
            status_rollup: serde_json::json!({ "state": pr.get("state") }),
            jobs: serde_json::Value::Null,
            closed: pr.get("state").and_then(|v| v.as_str()) == Some("closed"),
        };
        let task_ids = record.task_ids.clone();
        store.upsert_pr(record).await?;
        journal.lock().publish(
            sessionmux_core::Scope::default(),
            ObservedEvent::GithubPrUpserted { repository_id, task_ids, record: pr },
        );
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn registry_starts_empty_and_accumulates_status() {
        let registry = PollerRegistry::new();
        registry.record_success("history-tailer", 100);
        registry.record_failure("github-poller", 200, "rate limited");
        let status = registry.status();
        assert_eq!(status.len(), 2);
        let github = status.iter().find(|s| s.name == "github-poller").expect("entry");
        assert_eq!(github.consecutive_failures, 1);
        assert_eq!(github.last_error.as_deref(), Some("rate limited"));
    }

    #[tokio::test]
    async fn tail_once_ingests_new_lines_and_advances_offset() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("history.jsonl");
        tokio::fs::write(&path, b"{\"event\":\"codex.user_prompt\"}\n").await.expect("write");

        let store: Arc<dyn StateStore> = Arc::new(sessionmux_storage::MemoryStateStore::in_memory());
        let journal = Arc::new(Mutex::new(Journal::new(10)));
        let mut offset = 0u64;
        let ingested = tail_once(&path, &mut offset, &store, &journal, 1).await.expect("tail");
        assert_eq!(ingested, 1);
        assert!(offset > 0);

        let ingested_again = tail_once(&path, &mut offset, &store, &journal, 2).await.expect("tail again");
        assert_eq!(ingested_again, 0);
    }
}
