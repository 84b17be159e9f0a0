// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Client→server and server→client envelope families (§4.1).

use crate::command::Command;
use crate::event::{ObservedEvent, PtyLifecycleEvent};
use crate::response::CommandResult;
use sessionmux_core::{CommandId, SessionId, SubscriptionId};
use serde::{Deserialize, Serialize};
use serde_json::Value;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind")]
pub enum ClientEnvelope {
    #[serde(rename = "auth")]
    Auth { token: String },

    #[serde(rename = "command")]
    Command {
        #[serde(rename = "commandId")]
        command_id: CommandId,
        #[serde(flatten)]
        command: Command,
    },

    #[serde(rename = "pty.input", rename_all = "camelCase")]
    PtyInput { session_id: SessionId, data_base64: String },

    #[serde(rename = "pty.resize", rename_all = "camelCase")]
    PtyResize { session_id: SessionId, cols: u16, rows: u16 },

    #[serde(rename = "pty.signal", rename_all = "camelCase")]
    PtySignal { session_id: SessionId, signal: PtySignalKind },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PtySignalKind {
    Interrupt,
    Eof,
    Terminate,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind")]
pub enum ServerEnvelope {
    #[serde(rename = "auth.ok")]
    AuthOk,

    #[serde(rename = "auth.error")]
    AuthError { error: String },

    #[serde(rename = "command.accepted", rename_all = "camelCase")]
    CommandAccepted { command_id: CommandId },

    #[serde(rename = "command.completed", rename_all = "camelCase")]
    CommandCompleted { command_id: CommandId, result: CommandResult },

    #[serde(rename = "command.failed", rename_all = "camelCase")]
    CommandFailed { command_id: CommandId, error: String },

    #[serde(rename = "pty.output", rename_all = "camelCase")]
    PtyOutput { session_id: SessionId, cursor: u64, chunk_base64: String },

    #[serde(rename = "pty.exit", rename_all = "camelCase")]
    PtyExit { session_id: SessionId, code: Option<i32>, signal: Option<String> },

    #[serde(rename = "pty.event", rename_all = "camelCase")]
    PtyEvent { session_id: SessionId, event: PtyLifecycleEvent },

    #[serde(rename = "stream.event", rename_all = "camelCase")]
    StreamEvent { subscription_id: SubscriptionId, cursor: u64, event: ObservedEvent },

    #[serde(rename = "stream.stale", rename_all = "camelCase")]
    StreamStale { subscription_id: SubscriptionId },
}

/// Fixed error-message strings that are part of the wire contract (§6).
pub mod error_messages {
    pub fn session_not_found(id: &str) -> String {
        format!("session not found: {id}")
    }
    pub fn session_not_live(id: &str) -> String {
        format!("session is not live: {id}")
    }
    pub fn session_already_exists(id: &str) -> String {
        format!("session already exists: {id}")
    }
    pub fn session_is_claimed(controller_label: &str) -> String {
        format!("session is claimed by {controller_label}")
    }
    pub const AUTHENTICATION_REQUIRED: &str = "authentication required";
    pub const INVALID_AUTH_TOKEN: &str = "invalid auth token";
    pub const DIRECTORY_NOT_FOUND: &str = "directory not found";
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::{consume_json_lines, encode, DEFAULT_MAX_LINE_BYTES};

    #[test]
    fn auth_envelope_round_trips() {
        let env = ClientEnvelope::Auth { token: "tok".into() };
        let bytes = encode(&env);
        let consumed: crate::codec::ConsumedLines<ClientEnvelope> =
            consume_json_lines(&bytes, DEFAULT_MAX_LINE_BYTES);
        assert_eq!(consumed.messages.len(), 1);
        match &consumed.messages[0] {
            ClientEnvelope::Auth { token } => assert_eq!(token, "tok"),
            _ => panic!("wrong variant"),
        }
    }

    #[test]
    fn pty_signal_kinds_are_lowercase_on_wire() {
        let env = ClientEnvelope::PtySignal {
            session_id: sessionmux_core::SessionId::new(),
            signal: PtySignalKind::Terminate,
        };
        let json = serde_json::to_string(&env).expect("serialize");
        assert!(json.contains("\"signal\":\"terminate\""));
    }

    #[test]
    fn error_messages_match_the_wire_contract() {
        assert_eq!(error_messages::session_not_found("ses-1"), "session not found: ses-1");
        assert_eq!(
            error_messages::session_is_claimed("agent:owner"),
            "session is claimed by agent:owner"
        );
    }
}
