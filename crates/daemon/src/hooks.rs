// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Lifecycle-hooks webhook runtime (§4.8): translates a subset of observed
//! events into an external notification taxonomy and delivers them to every
//! configured target, deduping per `(session, event type)` within a short
//! window and dropping the oldest pending delivery once the queue is full
//! rather than blocking the publisher (§5's "the journal's publisher never
//! blocks on a slow subscriber" discipline, extended to hooks).

use sessionmux_core::{Clock, ExitRecord, SessionId};
use sessionmux_wire::{ObservedEvent, PtyLifecycleEvent};
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::Notify;
use tracing::warn;

const QUEUE_CAPACITY: usize = 2048;
const DEDUPE_WINDOW_MS: u64 = 250;

/// Which external targets receive a delivery. A flat list: every configured
/// webhook receives every translated event (SPEC_FULL's multi-target
/// supplement over the distilled spec's single-target sketch).
#[derive(Debug, Clone, Default)]
pub struct HooksConfig {
    pub webhook_urls: Vec<String>,
}

struct PendingDelivery {
    session_id: Option<SessionId>,
    event_type: &'static str,
    payload: serde_json::Value,
}

/// Translates `event` into zero or more notifications in the external
/// taxonomy (§4.8). Most events produce at most one; a failing
/// `session-exit` produces both `session.exited` and `turn.failed`, since a
/// client watching only lifecycle types must see the failure distinctly.
fn translate(event: &ObservedEvent) -> Vec<(&'static str, serde_json::Value)> {
    match event {
        ObservedEvent::SessionStatus { session_id, status, .. } => match status {
            sessionmux_core::SessionStatus::Running => {
                vec![("turn.started", serde_json::json!({ "sessionId": session_id.as_str() }))]
            }
            sessionmux_core::SessionStatus::NeedsInput => {
                vec![("input.required", serde_json::json!({ "sessionId": session_id.as_str() }))]
            }
            sessionmux_core::SessionStatus::Completed => {
                vec![("turn.completed", serde_json::json!({ "sessionId": session_id.as_str() }))]
            }
            sessionmux_core::SessionStatus::Exited => Vec::new(),
        },
        ObservedEvent::SessionEvent { session_id, event } => match event {
            PtyLifecycleEvent::AttentionRequired { reason } => {
                vec![("input.required", serde_json::json!({ "sessionId": session_id.as_str(), "reason": reason }))]
            }
            PtyLifecycleEvent::TurnCompleted => {
                vec![("turn.completed", serde_json::json!({ "sessionId": session_id.as_str() }))]
            }
            PtyLifecycleEvent::SessionExit { code, signal } => {
                let payload = serde_json::json!({ "sessionId": session_id.as_str(), "code": code, "signal": signal });
                let mut notifications = vec![("session.exited", payload.clone())];
                if (ExitRecord { code: *code, signal: signal.clone() }).is_failure() {
                    notifications.push(("turn.failed", payload));
                }
                notifications
            }
            PtyLifecycleEvent::Notify { .. } => Vec::new(),
        },
        ObservedEvent::ConversationCreated { session_id, .. } => {
            vec![("session.started", serde_json::json!({ "sessionId": session_id.as_str() }))]
        }
        _ => Vec::new(),
    }
}

/// Bounded pending-delivery queue. Plain `mpsc` channels only let a full
/// queue reject the newest send; §4.8 wants the opposite eviction order
/// (oldest dropped first), so the queue is a capacity-bounded deque behind
/// a lock instead, woken by a [`Notify`] — the same shape as this crate's
/// other ring buffers (`journal::Journal`, `sessionmux_pty::OutputRing`).
struct DeliveryQueue {
    items: parking_lot::Mutex<VecDeque<PendingDelivery>>,
    notify: Notify,
    handles: AtomicUsize,
}

impl DeliveryQueue {
    fn push(&self, item: PendingDelivery) {
        {
            let mut items = self.items.lock();
            if items.len() >= QUEUE_CAPACITY {
                items.pop_front();
            }
            items.push_back(item);
        }
        self.notify.notify_one();
    }

    /// Waits for the next delivery. Returns `None` once every
    /// [`HooksRuntime`] handle has been dropped and the queue is empty.
    async fn recv(&self) -> Option<PendingDelivery> {
        loop {
            if let Some(item) = self.items.lock().pop_front() {
                return Some(item);
            }
            if self.handles.load(Ordering::SeqCst) == 0 {
                return self.items.lock().pop_front();
            }
            self.notify.notified().await;
        }
    }
}

/// Handle held by the journal/session runtime to enqueue a translated
/// delivery. Cloning is cheap (wraps an `Arc`).
pub struct HooksRuntime {
    queue: Arc<DeliveryQueue>,
}

impl Clone for HooksRuntime {
    fn clone(&self) -> Self {
        self.queue.handles.fetch_add(1, Ordering::SeqCst);
        Self { queue: Arc::clone(&self.queue) }
    }
}

impl Drop for HooksRuntime {
    fn drop(&mut self) {
        if self.queue.handles.fetch_sub(1, Ordering::SeqCst) == 1 {
            self.queue.notify.notify_one();
        }
    }
}

impl HooksRuntime {
    pub fn spawn<C: Clock + 'static>(config: HooksConfig, clock: C) -> Self {
        let queue = Arc::new(DeliveryQueue {
            items: parking_lot::Mutex::new(VecDeque::new()),
            notify: Notify::new(),
            handles: AtomicUsize::new(1),
        });
        tokio::spawn(run_drain_loop(config, clock, Arc::clone(&queue)));
        Self { queue }
    }

    /// Translates and enqueues `event`. When the pending queue is already
    /// at capacity, the oldest pending delivery is dropped to make room
    /// (§4.8's FIFO eviction) rather than blocking the publisher.
    pub fn notify(&self, event: &ObservedEvent) {
        let session_id = session_id_of(event);
        for (event_type, payload) in translate(event) {
            self.queue.push(PendingDelivery { session_id, event_type, payload });
        }
    }

    /// Marks this handle as done delivering (§4.7's shutdown ordering). The
    /// drain loop exits once every clone — this one and the one the session
    /// runtime holds — has been dropped and the queue has run dry.
    pub fn close(self) {
        drop(self);
    }
}

fn session_id_of(event: &ObservedEvent) -> Option<SessionId> {
    match event {
        ObservedEvent::SessionStatus { session_id, .. }
        | ObservedEvent::SessionEvent { session_id, .. }
        | ObservedEvent::ConversationCreated { session_id, .. } => Some(*session_id),
        _ => None,
    }
}

async fn run_drain_loop<C: Clock>(config: HooksConfig, clock: C, queue: Arc<DeliveryQueue>) {
    if config.webhook_urls.is_empty() {
        // Still drain the queue so `notify` never blocks the publisher.
        while queue.recv().await.is_some() {}
        return;
    }

    let client = reqwest::Client::new();
    let mut last_sent: HashMap<(Option<SessionId>, &'static str), u64> = HashMap::new();

    while let Some(delivery) = queue.recv().await {
        let now_ms = clock.epoch_ms();
        let key = (delivery.session_id, delivery.event_type);
        if let Some(&last) = last_sent.get(&key) {
            if now_ms.saturating_sub(last) < DEDUPE_WINDOW_MS {
                continue;
            }
        }
        last_sent.insert(key, now_ms);

        for url in &config.webhook_urls {
            let body = serde_json::json!({ "type": delivery.event_type, "at": now_ms, "data": delivery.payload });
            if let Err(e) = client.post(url).json(&body).send().await {
                warn!(error = %e, url = %url, "lifecycle hook delivery failed");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn crud_events_have_no_external_translation() {
        let event = ObservedEvent::ConversationArchived { session_id: SessionId::new() };
        assert!(translate(&event).is_empty());
    }

    #[test]
    fn attention_required_translates_to_input_required() {
        let event = ObservedEvent::SessionEvent {
            session_id: SessionId::new(),
            event: PtyLifecycleEvent::AttentionRequired { reason: "needs approval".into() },
        };
        let notifications = translate(&event);
        assert_eq!(notifications.len(), 1);
        assert_eq!(notifications[0].0, "input.required");
        assert_eq!(notifications[0].1["reason"], "needs approval");
    }

    #[test]
    fn a_clean_exit_only_emits_session_exited() {
        let event = ObservedEvent::SessionEvent {
            session_id: SessionId::new(),
            event: PtyLifecycleEvent::SessionExit { code: Some(0), signal: None },
        };
        let notifications = translate(&event);
        assert_eq!(notifications.iter().map(|(t, _)| *t).collect::<Vec<_>>(), vec!["session.exited"]);
    }

    #[test]
    fn a_failing_exit_also_emits_turn_failed() {
        let event = ObservedEvent::SessionEvent {
            session_id: SessionId::new(),
            event: PtyLifecycleEvent::SessionExit { code: Some(1), signal: None },
        };
        let notifications = translate(&event);
        assert_eq!(
            notifications.iter().map(|(t, _)| *t).collect::<Vec<_>>(),
            vec!["session.exited", "turn.failed"]
        );
    }

    #[tokio::test]
    async fn delivery_queue_drops_the_oldest_entry_once_full() {
        let queue = DeliveryQueue {
            items: parking_lot::Mutex::new(VecDeque::new()),
            notify: Notify::new(),
            handles: AtomicUsize::new(1),
        };
        for i in 0..QUEUE_CAPACITY + 1 {
            queue.push(PendingDelivery { session_id: None, event_type: "turn.started", payload: serde_json::json!(i) });
        }
        let items = queue.items.lock();
        assert_eq!(items.len(), QUEUE_CAPACITY);
        // Entry 0 was the oldest and should have been evicted to make room
        // for entry QUEUE_CAPACITY; entry 1 survives as the new oldest.
        assert_eq!(items.front().expect("oldest survivor").payload, serde_json::json!(1));
        assert_eq!(items.back().expect("newest entry").payload, serde_json::json!(QUEUE_CAPACITY));
    }

    #[tokio::test]
    async fn notify_on_empty_config_drains_without_panicking() {
        let runtime = HooksRuntime::spawn(HooksConfig::default(), sessionmux_core::FakeClock::new());
        runtime.notify(&ObservedEvent::SessionEvent {
            session_id: SessionId::new(),
            event: PtyLifecycleEvent::TurnCompleted,
        });
        tokio::time::sleep(std::time::Duration::from_millis(10)).await;
    }
}
