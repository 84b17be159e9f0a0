// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Observed-event journal & subscriptions (§4.5): an append-only ring
//! numbered by a monotonic cursor, with equality-conjunction subscription
//! filters fanned out on every publish.

use sessionmux_core::{MatchContext, Scope, StreamFilter, SubscriptionId};
use sessionmux_wire::ObservedEvent;
use std::collections::{HashMap, VecDeque};

/// One resident journal entry.
#[derive(Debug, Clone)]
pub struct JournalEntry {
    pub cursor: u64,
    pub scope: Scope,
    pub event: ObservedEvent,
}

struct Subscription {
    connection_id: sessionmux_core::ConnectionId,
    filter: StreamFilter,
}

/// The append-only ring plus the live subscription table. Owned exclusively
/// by the session-runtime task (§5's single-writer discipline).
pub struct Journal {
    entries: VecDeque<JournalEntry>,
    capacity: usize,
    next_cursor: u64,
    subscriptions: HashMap<SubscriptionId, Subscription>,
}

/// One subscription's fan-out hit: which connection to deliver to.
pub struct FanoutTarget {
    pub connection_id: sessionmux_core::ConnectionId,
    pub subscription_id: SubscriptionId,
}

impl Journal {
    pub fn new(capacity: usize) -> Self {
        Self {
            entries: VecDeque::with_capacity(capacity.min(4096)),
            capacity: capacity.max(1),
            next_cursor: 1,
            subscriptions: HashMap::new(),
        }
    }

    /// Appends `event` under `scope`, assigning the next cursor. Returns the
    /// new entry and the set of subscriptions it fans out to, in insertion
    /// order — never a global order guarantee beyond per-subscription (§5).
    pub fn publish(&mut self, scope: Scope, event: ObservedEvent) -> (JournalEntry, Vec<FanoutTarget>) {
        let cursor = self.next_cursor;
        self.next_cursor += 1;

        let task_ids = event.task_ids().to_vec();
        let repository_id = event.repository_id();
        let is_output_event = event.is_output();

        let entry = JournalEntry { cursor, scope, event };
        self.entries.push_back(entry.clone());
        while self.entries.len() > self.capacity {
            self.entries.pop_front();
        }

        let ctx = MatchContext {
            scope: &entry.scope,
            task_ids: &task_ids,
            repository_id,
            is_output_event,
        };
        let targets = self
            .subscriptions
            .iter()
            .filter(|(_, sub)| sub.filter.matches(&ctx))
            .map(|(subscription_id, sub)| FanoutTarget {
                connection_id: sub.connection_id,
                subscription_id: *subscription_id,
            })
            .collect();

        (entry, targets)
    }

    /// Registers a subscription and returns its id plus the replay backlog.
    /// `None` for `backlog` (as opposed to `Some(vec![])`) signals a stale
    /// cursor the client must resync before resubscribing (§4.5).
    pub fn subscribe(
        &mut self,
        connection_id: sessionmux_core::ConnectionId,
        filter: StreamFilter,
        after_cursor: Option<u64>,
    ) -> (SubscriptionId, Option<Vec<JournalEntry>>) {
        let subscription_id = SubscriptionId::new();
        self.subscriptions.insert(subscription_id, Subscription { connection_id, filter });

        let backlog = match after_cursor {
            None => Some(Vec::new()),
            Some(after) => {
                let oldest = self.entries.front().map(|e| e.cursor);
                match oldest {
                    Some(oldest) if after + 1 < oldest && !self.entries.is_empty() => None,
                    _ => Some(
                        self.entries.iter().filter(|e| e.cursor > after).cloned().collect(),
                    ),
                }
            }
        };

        (subscription_id, backlog)
    }

    pub fn unsubscribe(&mut self, subscription_id: SubscriptionId) -> bool {
        self.subscriptions.remove(&subscription_id).is_some()
    }

    /// Removes every subscription owned by a closing connection (§4.2's
    /// shutdown side effects).
    pub fn remove_connection(&mut self, connection_id: sessionmux_core::ConnectionId) {
        self.subscriptions.retain(|_, sub| sub.connection_id != connection_id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sessionmux_core::{ConnectionId, SessionId, SessionStatus};

    fn status_event(session_id: SessionId) -> ObservedEvent {
        ObservedEvent::SessionStatus { session_id, status: SessionStatus::Running, attention_reason: None }
    }

    #[test]
    fn cursors_are_strictly_increasing() {
        let mut journal = Journal::new(10);
        let (e1, _) = journal.publish(Scope::default(), status_event(SessionId::new()));
        let (e2, _) = journal.publish(Scope::default(), status_event(SessionId::new()));
        assert_eq!(e1.cursor, 1);
        assert_eq!(e2.cursor, 2);
    }

    #[test]
    fn ring_evicts_oldest_past_capacity() {
        let mut journal = Journal::new(1);
        journal.publish(Scope::default(), status_event(SessionId::new()));
        journal.publish(Scope::default(), status_event(SessionId::new()));
        assert_eq!(journal.entries.len(), 1);
        assert_eq!(journal.entries.front().expect("entry").cursor, 2);
    }

    #[test]
    fn stale_cursor_is_signaled_when_evicted() {
        let mut journal = Journal::new(1);
        journal.publish(Scope::default(), status_event(SessionId::new()));
        journal.publish(Scope::default(), status_event(SessionId::new()));
        let (_, backlog) = journal.subscribe(ConnectionId::new(), StreamFilter::default(), Some(0));
        assert!(backlog.is_none());
    }

    #[test]
    fn subscribe_with_no_after_cursor_gets_empty_backlog() {
        let mut journal = Journal::new(10);
        journal.publish(Scope::default(), status_event(SessionId::new()));
        let (_, backlog) = journal.subscribe(ConnectionId::new(), StreamFilter::default(), None);
        assert_eq!(backlog.expect("not stale").len(), 0);
    }

    #[test]
    fn unsubscribe_removes_the_subscription() {
        let mut journal = Journal::new(10);
        let (id, _) = journal.subscribe(ConnectionId::new(), StreamFilter::default(), None);
        assert!(journal.unsubscribe(id));
        assert!(!journal.unsubscribe(id));
    }

    #[test]
    fn output_events_only_reach_include_output_subscribers() {
        let mut journal = Journal::new(10);
        let conn = ConnectionId::new();
        journal.subscribe(conn, StreamFilter::default(), None);
        let (_, targets) = journal.publish(
            Scope::default(),
            ObservedEvent::SessionOutput { session_id: SessionId::new(), cursor: 1, chunk_base64: "QQ==".into() },
        );
        assert!(targets.is_empty());
    }

    proptest::proptest! {
        /// Whatever ring capacity the journal is built with, and whatever
        /// run of publishes it sees, the cursor sequence it hands back is
        /// exactly 1, 2, 3, ... — never reused, never skipped, regardless
        /// of how many entries have since been evicted from the ring.
        #[test]
        fn cursors_increase_by_exactly_one_per_publish(capacity in 1usize..20, publish_count in 1usize..60) {
            let mut journal = Journal::new(capacity);
            for i in 0..publish_count {
                let (entry, _) = journal.publish(Scope::default(), status_event(SessionId::new()));
                proptest::prop_assert_eq!(entry.cursor, i as u64 + 1);
            }
            proptest::prop_assert!(journal.entries.len() <= capacity);
        }
    }
}
