// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Daemon configuration: `clap` derive flags layered over defaults (§6,
//! §2's ambient "Configuration" section), serializable for diagnostics.

use clap::Parser;
use serde::{Deserialize, Serialize};
use std::net::IpAddr;
use std::path::PathBuf;

#[derive(Debug, Clone, Parser, Serialize, Deserialize)]
#[command(name = "sessionmuxd", about = "sessionmux control-plane daemon")]
pub struct DaemonConfig {
    /// Address the TCP control-plane listener binds to.
    #[arg(long, default_value = "127.0.0.1")]
    pub host: IpAddr,

    /// Port for the TCP control-plane listener.
    #[arg(long, default_value_t = 7421)]
    pub port: u16,

    /// Shared auth token clients must present via the `auth` envelope.
    /// Required when `--host` is not loopback.
    #[arg(long)]
    pub auth_token: Option<String>,

    /// Path to the write-ahead log backing the state store.
    #[arg(long, default_value = "sessionmux-state.wal")]
    pub state_db_path: PathBuf,

    /// Directory for the rolling daemon log file. Unset disables file logging.
    #[arg(long)]
    pub log_dir: Option<PathBuf>,

    /// Address the telemetry HTTP ingest endpoint binds to.
    #[arg(long, default_value = "127.0.0.1")]
    pub telemetry_host: IpAddr,

    /// Port for the telemetry HTTP ingest endpoint.
    #[arg(long, default_value_t = 7422)]
    pub telemetry_port: u16,

    /// Per-connection outbound-queue byte ceiling before disconnect (§5).
    #[arg(long, default_value_t = 4 * 1024 * 1024)]
    pub max_connection_buffered_bytes: usize,

    /// Observed-event journal ring capacity (§3).
    #[arg(long, default_value_t = 10_000)]
    pub max_stream_journal_entries: usize,

    /// How long an exited session is retained as a tombstone before removal.
    #[arg(long, default_value_t = 5 * 60 * 1000)]
    pub session_exit_tombstone_ttl_ms: u64,

    /// Floor for the per-directory git-status refresh cooldown (§4.7).
    #[arg(long, default_value_t = 30_000)]
    pub git_status_min_refresh_ms: u64,

    /// Bounded worker pool size for the git-status refresher.
    #[arg(long, default_value_t = 4)]
    pub git_status_max_concurrency: usize,

    /// Bounded worker pool size for the GitHub PR poller.
    #[arg(long, default_value_t = 4)]
    pub github_poll_max_concurrency: usize,

    /// Maximum OTLP ingest requests accepted per telemetry token per second.
    #[arg(long, default_value_t = 50)]
    pub telemetry_max_requests_per_token_per_second: u32,
}

/// Reads the webhook targets for the lifecycle-hooks runtime from the
/// environment, following the teacher's `env.rs` convention of layering
/// `OJ_`-style environment variables under the `clap` flags rather than
/// exposing every ambient knob as a CLI argument.
pub fn webhook_urls_from_env() -> Vec<String> {
    std::env::var("SESSIONMUX_WEBHOOK_URLS")
        .ok()
        .map(|raw| raw.split(',').map(str::trim).filter(|s| !s.is_empty()).map(String::from).collect())
        .unwrap_or_default()
}

/// `GITHUB_TOKEN`-style bearer token for the GitHub PR poller, read from the
/// environment rather than a CLI flag since it is a credential.
pub fn github_token_from_env() -> Option<String> {
    std::env::var("SESSIONMUX_GITHUB_TOKEN").ok().filter(|s| !s.is_empty())
}

impl DaemonConfig {
    /// Non-loopback hosts must be configured with an auth token (§6).
    pub fn validate(&self) -> Result<(), crate::error::StartupError> {
        if !self.host.is_loopback() && self.auth_token.is_none() {
            return Err(crate::error::StartupError::AuthTokenRequired(self.host.to_string()));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn non_loopback_host_without_token_fails_validation() {
        let cfg = DaemonConfig {
            host: "0.0.0.0".parse().expect("ip"),
            port: 7421,
            auth_token: None,
            state_db_path: "x.wal".into(),
            log_dir: None,
            telemetry_host: "127.0.0.1".parse().expect("ip"),
            telemetry_port: 7422,
            max_connection_buffered_bytes: 1024,
            max_stream_journal_entries: 10,
            session_exit_tombstone_ttl_ms: 0,
            git_status_min_refresh_ms: 30_000,
            git_status_max_concurrency: 4,
            github_poll_max_concurrency: 4,
            telemetry_max_requests_per_token_per_second: 50,
        };
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn loopback_host_without_token_is_fine() {
        let cfg = DaemonConfig {
            host: "127.0.0.1".parse().expect("ip"),
            port: 7421,
            auth_token: None,
            state_db_path: "x.wal".into(),
            log_dir: None,
            telemetry_host: "127.0.0.1".parse().expect("ip"),
            telemetry_port: 7422,
            max_connection_buffered_bytes: 1024,
            max_stream_journal_entries: 10,
            session_exit_tombstone_ttl_ms: 0,
            git_status_min_refresh_ms: 30_000,
            git_status_max_concurrency: 4,
            github_poll_max_concurrency: 4,
            telemetry_max_requests_per_token_per_second: 50,
        };
        assert!(cfg.validate().is_ok());
    }
}
