// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Telemetry HTTP ingest (§4.6): a second listener, independent of the
//! control-plane TCP socket, that accepts OTLP-shaped JSON over
//! `/v1/{logs,metrics,traces}/{token}` and demultiplexes it to the session
//! the token was minted for.

use crate::ctx::DaemonCtx;
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::post;
use axum::{Json, Router};
use parking_lot::Mutex;
use sessionmux_core::{Clock, SessionId, StatusHint};
use sessionmux_storage::{TelemetryRecord, TelemetrySource};
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Lifecycle event names the `lifecycle-fast` parser mode retains even
/// without a `statusHint` (§4.6).
const LIFECYCLE_EVENT_NAMES: &[&str] =
    &["codex.user_prompt", "codex.turn.e2e_duration_ms", "codex.conversation_starts"];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TelemetryFilterMode {
    LifecycleFast,
    Full,
}

/// Maps minted per-session tokens to the session they were minted for
/// (§4.3's `pty.start`/§4.6's "token maps 1:1 to a session id").
pub struct TokenTable {
    tokens: Mutex<HashMap<String, SessionId>>,
}

impl TokenTable {
    pub fn new() -> Self {
        Self { tokens: Mutex::new(HashMap::new()) }
    }

    pub fn mint(&self, session_id: SessionId) -> String {
        let token = nanoid::nanoid!(32);
        self.tokens.lock().insert(token.clone(), session_id);
        token
    }

    pub fn resolve(&self, token: &str) -> Option<SessionId> {
        self.tokens.lock().get(token).copied()
    }

    pub fn revoke_for_session(&self, session_id: SessionId) {
        self.tokens.lock().retain(|_, v| *v != session_id);
    }
}

impl Default for TokenTable {
    fn default() -> Self {
        Self::new()
    }
}

/// Coarse per-token token-bucket (§4.6's SPEC_FULL supplement): caps the
/// number of ingest requests one session's token may make per second, so a
/// runaway subprocess cannot starve the ingest path.
struct RateLimiter {
    buckets: Mutex<HashMap<String, (u64, u32)>>,
    max_per_second: u32,
}

impl RateLimiter {
    fn new(max_per_second: u32) -> Self {
        Self { buckets: Mutex::new(HashMap::new()), max_per_second }
    }

    fn allow(&self, token: &str, now_ms: u64) -> bool {
        let second = now_ms / 1000;
        let mut buckets = self.buckets.lock();
        let entry = buckets.entry(token.to_string()).or_insert((second, 0));
        if entry.0 != second {
            *entry = (second, 0);
        }
        if entry.1 >= self.max_per_second {
            return false;
        }
        entry.1 += 1;
        true
    }
}

/// Bounded, TTL'd dedupe table for `session-prompt-event` publication
/// (§4.6 step 2: "per-session, per-second, per-hash dedupe key and a
/// bounded LRU of ≤4096 entries, 5-minute TTL").
struct PromptDedupe {
    seen: Mutex<(HashMap<String, u64>, VecDeque<String>)>,
}

const PROMPT_DEDUPE_CAPACITY: usize = 4096;
const PROMPT_DEDUPE_TTL_MS: u64 = 5 * 60 * 1000;

impl PromptDedupe {
    fn new() -> Self {
        Self { seen: Mutex::new((HashMap::new(), VecDeque::new())) }
    }

    /// Returns `true` if this key has not been seen within the TTL window,
    /// recording it as seen either way.
    fn check_and_record(&self, key: String, now_ms: u64) -> bool {
        let mut guard = self.seen.lock();
        let (map, order) = &mut *guard;

        while let Some(front) = order.front() {
            match map.get(front) {
                Some(&at) if now_ms.saturating_sub(at) > PROMPT_DEDUPE_TTL_MS => {
                    let front = order.pop_front().expect("checked");
                    map.remove(&front);
                }
                _ => break,
            }
        }

        if let Some(&at) = map.get(&key) {
            if now_ms.saturating_sub(at) <= PROMPT_DEDUPE_TTL_MS {
                return false;
            }
        }

        map.insert(key.clone(), now_ms);
        order.push_back(key);
        while order.len() > PROMPT_DEDUPE_CAPACITY {
            if let Some(evicted) = order.pop_front() {
                map.remove(&evicted);
            }
        }
        true
    }
}

/// Parsed ingest payload, mirroring §4.6's `ParsedCodexTelemetryEvent`.
#[derive(Debug, Clone)]
struct ParsedEvent {
    event_name: Option<String>,
    severity: Option<String>,
    summary: Option<String>,
    provider_thread_id: Option<String>,
    status_hint: Option<StatusHint>,
    prompt: Option<String>,
    payload: serde_json::Value,
}

fn parse_event(body: &serde_json::Value) -> ParsedEvent {
    let event_name = body.get("eventName").and_then(|v| v.as_str()).map(String::from);
    let severity = body.get("severity").and_then(|v| v.as_str()).map(String::from);
    let summary = body.get("summary").and_then(|v| v.as_str()).map(String::from);
    let provider_thread_id = body.get("providerThreadId").and_then(|v| v.as_str()).map(String::from);
    let status_hint = body.get("statusHint").and_then(|v| v.as_str()).and_then(StatusHint::parse);
    let prompt = match event_name.as_deref() {
        Some("codex.user_prompt") => body.get("prompt").and_then(|v| v.as_str()).map(String::from),
        _ => None,
    };
    ParsedEvent { event_name, severity, summary, provider_thread_id, status_hint, prompt, payload: body.clone() }
}

fn retained(mode: TelemetryFilterMode, parsed: &ParsedEvent) -> bool {
    match mode {
        TelemetryFilterMode::Full => true,
        TelemetryFilterMode::LifecycleFast => {
            parsed.status_hint.is_some()
                || parsed.event_name.as_deref().is_some_and(|name| LIFECYCLE_EVENT_NAMES.contains(&name))
        }
    }
}

/// Routes one parsed telemetry event through §4.6's steps 1-4. `apply_status`
/// gates step 4's status-hint application — false during history replay,
/// per §4.7's "without the status-hint application" rule.
async fn ingest_parsed<C: Clock + 'static>(
    ctx: &Arc<DaemonCtx<C>>,
    prompt_dedupe: &PromptDedupe,
    source: TelemetrySource,
    session_id: Option<SessionId>,
    parsed: ParsedEvent,
    mode: TelemetryFilterMode,
    apply_status: bool,
    now_ms: u64,
) {
    if !retained(mode, &parsed) {
        if let Some(session_id) = session_id {
            ctx.sessions.note_telemetry(session_id, false);
        }
        return;
    }

    let fingerprint_parts: Vec<&str> = vec![
        source_tag(source),
        session_id.map(|s| s.as_str()).unwrap_or(""),
        parsed.event_name.as_deref().unwrap_or(""),
        parsed.provider_thread_id.as_deref().unwrap_or(""),
    ];
    let fingerprint = sessionmux_core::fingerprint::stable_fingerprint(fingerprint_parts);

    let record = TelemetryRecord {
        source,
        session_id,
        provider_thread_id: parsed.provider_thread_id.clone(),
        event_name: parsed.event_name.clone(),
        severity: parsed.severity.clone(),
        summary: parsed.summary.clone(),
        observed_at_ms: now_ms,
        fingerprint,
        payload: parsed.payload.clone(),
    };

    let retained_ok = match ctx.store.append_telemetry(record).await {
        Ok(retained) => retained,
        Err(e) => {
            warn!(error = %e, "telemetry append failed");
            false
        }
    };

    if let Some(session_id) = session_id {
        ctx.sessions.note_telemetry(session_id, retained_ok);
    }
    if !retained_ok {
        return;
    }

    if let (Some(session_id), Some(prompt)) = (session_id, &parsed.prompt) {
        let hash = sessionmux_core::fingerprint::stable_fingerprint([session_id.as_str(), prompt.as_str()]);
        let dedupe_key = format!("{}:{}:{}", session_id.as_str(), now_ms / 1000, hash);
        if prompt_dedupe.check_and_record(dedupe_key, now_ms) {
            ctx.journal.lock().publish(
                sessionmux_core::Scope { conversation_id: Some(session_id), ..Default::default() },
                sessionmux_wire::ObservedEvent::SessionPromptEvent { session_id, prompt: prompt.clone() },
            );
        }
    }

    if let (Some(session_id), Some(thread_id)) = (session_id, &parsed.provider_thread_id) {
        reconcile_resume_session_id(ctx, session_id, thread_id).await;
    }

    if let Some(session_id) = session_id {
        ctx.journal.lock().publish(
            sessionmux_core::Scope { conversation_id: Some(session_id), ..Default::default() },
            sessionmux_wire::ObservedEvent::SessionKeyEvent {
                session_id,
                event_name: parsed.event_name.clone().unwrap_or_default(),
                severity: parsed.severity.clone(),
                summary: parsed.summary.clone(),
            },
        );

        if apply_status {
            if let Some(hint) = parsed.status_hint {
                let _ = ctx.sessions.apply_status_hint(session_id, hint, now_ms);
            }
        }
    }
}

fn source_tag(source: TelemetrySource) -> &'static str {
    match source {
        TelemetrySource::History => "history",
        TelemetrySource::OtlpLog => "otlp-log",
        TelemetrySource::OtlpMetric => "otlp-metric",
        TelemetrySource::OtlpTrace => "otlp-trace",
    }
}

async fn reconcile_resume_session_id<C: Clock + 'static>(ctx: &Arc<DaemonCtx<C>>, session_id: SessionId, thread_id: &str) {
    let Ok(Some(mut conversation)) = ctx.store.get_conversation(session_id).await else { return };
    let current = conversation.adapter_state.get("codex").and_then(|c| c.get("resumeSessionId")).and_then(|v| v.as_str());
    if current == Some(thread_id) {
        return;
    }
    let mut adapter_state = conversation.adapter_state.clone();
    if !adapter_state.is_object() {
        adapter_state = serde_json::json!({});
    }
    adapter_state["codex"] = serde_json::json!({ "resumeSessionId": thread_id });
    conversation.adapter_state = adapter_state;
    if let Err(e) = ctx.store.upsert_conversation(conversation).await {
        warn!(error = %e, %session_id, "failed to persist resumeSessionId reconciliation");
    }
}

struct TelemetryState<C: Clock> {
    ctx: Arc<DaemonCtx<C>>,
    mode: TelemetryFilterMode,
    rate_limiter: RateLimiter,
    prompt_dedupe: PromptDedupe,
}

async fn handle_ingest<C: Clock + 'static>(
    State(state): State<Arc<TelemetryState<C>>>,
    Path((kind, token)): Path<(String, String)>,
    body: axum::body::Bytes,
) -> impl IntoResponse {
    let source = match kind.as_str() {
        "logs" => TelemetrySource::OtlpLog,
        "metrics" => TelemetrySource::OtlpMetric,
        "traces" => TelemetrySource::OtlpTrace,
        _ => return (StatusCode::NOT_FOUND, Json(serde_json::json!({}))),
    };

    let Some(session_id) = state.ctx.telemetry_tokens.resolve(&token) else {
        return (StatusCode::NOT_FOUND, Json(serde_json::json!({})));
    };

    let now_ms = state.ctx.clock.epoch_ms();
    if !state.rate_limiter.allow(&token, now_ms) {
        debug!(%session_id, "telemetry ingest rate-limited");
        return (StatusCode::OK, Json(serde_json::json!({ "partialSuccess": {} })));
    }

    let body: serde_json::Value = match serde_json::from_slice(&body) {
        Ok(v) => v,
        Err(_) => return (StatusCode::BAD_REQUEST, Json(serde_json::json!({}))),
    };

    let parsed = parse_event(&body);
    ingest_parsed(&state.ctx, &state.prompt_dedupe, source, Some(session_id), parsed, state.mode, true, now_ms).await;

    (StatusCode::OK, Json(serde_json::json!({ "partialSuccess": {} })))
}

/// Ingests a parsed history-tailer entry (§4.7) without status-hint
/// application, reusing the same dedupe/fingerprint path as live HTTP
/// ingest. Exposed for the poller module.
pub async fn ingest_history_entry<C: Clock + 'static>(
    ctx: &Arc<DaemonCtx<C>>,
    prompt_dedupe: &PromptDedupe,
    body: &serde_json::Value,
    now_ms: u64,
) {
    let parsed = parse_event(body);
    ingest_parsed(ctx, prompt_dedupe, TelemetrySource::History, None, parsed, TelemetryFilterMode::Full, false, now_ms).await;
}

/// Builds the axum router for the telemetry side-channel.
pub fn router<C: Clock + 'static>(ctx: Arc<DaemonCtx<C>>, mode: TelemetryFilterMode, max_requests_per_token_per_second: u32) -> Router {
    let state = Arc::new(TelemetryState {
        ctx,
        mode,
        rate_limiter: RateLimiter::new(max_requests_per_token_per_second),
        prompt_dedupe: PromptDedupe::new(),
    });
    Router::new().route("/v1/:kind/:token", post(handle_ingest::<C>)).with_state(state)
}

/// Serves the telemetry HTTP endpoint until `shutdown` fires.
pub async fn serve<C: Clock + 'static>(
    ctx: Arc<DaemonCtx<C>>,
    listener: TcpListener,
    mode: TelemetryFilterMode,
    max_requests_per_token_per_second: u32,
    shutdown: CancellationToken,
) {
    let app = router(ctx, mode, max_requests_per_token_per_second);
    let server = axum::serve(listener, app).with_graceful_shutdown(async move {
        shutdown.cancelled().await;
    });
    if let Err(e) = server.await {
        warn!(error = %e, "telemetry listener exited with error");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn event_named(name: &str, status_hint: Option<StatusHint>) -> ParsedEvent {
        ParsedEvent {
            event_name: Some(name.to_string()),
            severity: None,
            summary: None,
            provider_thread_id: None,
            status_hint,
            prompt: None,
            payload: serde_json::Value::Null,
        }
    }

    #[test]
    fn lifecycle_fast_retains_named_events_only() {
        assert!(retained(TelemetryFilterMode::LifecycleFast, &event_named("codex.user_prompt", None)));
        assert!(!retained(TelemetryFilterMode::LifecycleFast, &event_named("unrelated", None)));
    }

    #[test]
    fn lifecycle_fast_retains_any_status_hint_event() {
        let hinted = event_named("unrelated", Some(StatusHint::NeedsInput));
        assert!(retained(TelemetryFilterMode::LifecycleFast, &hinted));
    }

    #[test]
    fn token_table_mints_and_resolves() {
        let table = TokenTable::new();
        let session_id = SessionId::new();
        let token = table.mint(session_id);
        assert_eq!(table.resolve(&token), Some(session_id));
        assert_eq!(table.resolve("nonexistent"), None);
    }

    #[test]
    fn rate_limiter_caps_within_one_second() {
        let limiter = RateLimiter::new(2);
        assert!(limiter.allow("tok", 1_000));
        assert!(limiter.allow("tok", 1_000));
        assert!(!limiter.allow("tok", 1_000));
        assert!(limiter.allow("tok", 2_000));
    }

    #[test]
    fn prompt_dedupe_suppresses_within_window() {
        let dedupe = PromptDedupe::new();
        assert!(dedupe.check_and_record("k".into(), 0));
        assert!(!dedupe.check_and_record("k".into(), 1_000));
        assert!(dedupe.check_and_record("k".into(), PROMPT_DEDUPE_TTL_MS + 1));
    }
}
