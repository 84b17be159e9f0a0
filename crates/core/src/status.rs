// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Session status model: the raw lifecycle status plus the richer projected
//! model the status engine regenerates on every state-affecting input.

use serde::{Deserialize, Serialize};

/// Raw runtime status of a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum SessionStatus {
    Running,
    NeedsInput,
    Completed,
    Exited,
}

impl SessionStatus {
    /// Ordering used by the `attention-first` sort: needs-input first, then
    /// running, then completed, then exited.
    pub fn attention_priority(&self) -> u8 {
        match self {
            Self::NeedsInput => 0,
            Self::Running => 1,
            Self::Completed => 2,
            Self::Exited => 3,
        }
    }
}

/// Captured once a session's PTY exits.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExitRecord {
    pub code: Option<i32>,
    pub signal: Option<String>,
}

impl ExitRecord {
    pub fn is_failure(&self) -> bool {
        self.signal.is_some() || !matches!(self.code, Some(0))
    }
}

/// Hint carried by a telemetry key event. Only these two values are defined;
/// any other value must be ignored by the status engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum StatusHint {
    NeedsInput,
    Running,
}

impl StatusHint {
    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "needs-input" => Some(Self::NeedsInput),
            "running" => Some(Self::Running),
            _ => None,
        }
    }
}

/// The opaque, richer record the UI consumes. The core regenerates this on
/// every state-affecting input from `(agentType, runtimeStatus,
/// attentionReason, latestTelemetry, previousModel)`; downstream consumers
/// treat its shape as opaque JSON.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatusModel {
    pub status: SessionStatus,
    pub attention_reason: Option<String>,
    pub last_event_at_ms: Option<u64>,
    pub last_exit: Option<ExitRecord>,
    /// Free-form projection fields layered on top, e.g. a last-prompt
    /// summary; kept as JSON since the core never inspects the shape.
    pub extra: serde_json::Value,
}

impl StatusModel {
    pub fn project(
        status: SessionStatus,
        attention_reason: Option<String>,
        last_event_at_ms: Option<u64>,
        last_exit: Option<ExitRecord>,
        previous: Option<&StatusModel>,
    ) -> Self {
        Self {
            status,
            attention_reason,
            last_event_at_ms,
            last_exit,
            extra: previous.map(|p| p.extra.clone()).unwrap_or(serde_json::Value::Null),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn attention_first_ordering() {
        let mut statuses = vec![
            SessionStatus::Exited,
            SessionStatus::Running,
            SessionStatus::NeedsInput,
            SessionStatus::Completed,
        ];
        statuses.sort_by_key(|s| s.attention_priority());
        assert_eq!(
            statuses,
            vec![
                SessionStatus::NeedsInput,
                SessionStatus::Running,
                SessionStatus::Completed,
                SessionStatus::Exited
            ]
        );
    }

    #[test]
    fn status_hint_ignores_unknown_values() {
        assert_eq!(StatusHint::parse("needs-input"), Some(StatusHint::NeedsInput));
        assert_eq!(StatusHint::parse("whatever"), None);
    }

    #[test]
    fn exit_record_failure() {
        assert!(!ExitRecord { code: Some(0), signal: None }.is_failure());
        assert!(ExitRecord { code: Some(1), signal: None }.is_failure());
        assert!(ExitRecord { code: None, signal: Some("SIGKILL".into()) }.is_failure());
    }
}
