//! Pending-call table correlating outgoing calls with their outcomes.
//!
//! Every outgoing call registers one entry keyed by its id. The entry is
//! removed on the first of reply arrival, deadline expiry, or connection
//! close, which is what makes outcome delivery exactly-once: later signals
//! for the same id find no entry and are dropped.

use std::collections::HashMap;

use serde_json::Value;
use tokio::sync::oneshot;
use tokio::time::Instant;

use crate::errors::ClientError;

/// What a pending entry resolves into.
pub(crate) enum PendingKind {
    /// A caller-issued call; the outcome goes to the caller's channel.
    Call {
        outcome: oneshot::Sender<Result<Value, ClientError>>,
    },
    /// An internally-issued keep-alive probe.
    Ping,
    /// An internally-issued `livesubscribe` for one topic.
    Subscribe { topic: String },
    /// An internally-issued `liveunsubscribe` for one topic.
    Unsubscribe { topic: String },
}

/// Lifecycle of a pending call.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum CallState {
    /// Registered but not yet written to the socket.
    Pending,
    /// Written to the socket, awaiting a reply.
    Sending,
}

pub(crate) struct PendingCall {
    pub kind: PendingKind,
    pub method: String,
    pub deadline: Instant,
    pub state: CallState,
}

#[derive(Default)]
pub(crate) struct Correlator {
    pending: HashMap<u64, PendingCall>,
}

impl Correlator {
    pub fn register(&mut self, id: u64, method: String, kind: PendingKind, deadline: Instant) {
        self.pending.insert(
            id,
            PendingCall {
                kind,
                method,
                deadline,
                state: CallState::Pending,
            },
        );
    }

    /// Marks the entry as written to the socket.
    pub fn mark_sending(&mut self, id: u64) {
        if let Some(entry) = self.pending.get_mut(&id) {
            entry.state = CallState::Sending;
        }
    }

    /// Removes and returns the entry for `id`, if it is still unresolved.
    pub fn take(&mut self, id: u64) -> Option<PendingCall> {
        self.pending.remove(&id)
    }

    /// Removes and returns every entry whose deadline has passed.
    pub fn due(&mut self, now: Instant) -> Vec<(u64, PendingCall)> {
        let expired: Vec<u64> = self
            .pending
            .iter()
            .filter(|(_, entry)| entry.deadline <= now)
            .map(|(id, _)| *id)
            .collect();
        expired
            .into_iter()
            .filter_map(|id| self.pending.remove(&id).map(|entry| (id, entry)))
            .collect()
    }

    /// Removes and returns every entry, used when the connection closes.
    pub fn drain(&mut self) -> Vec<(u64, PendingCall)> {
        self.pending.drain().collect()
    }

    /// The soonest deadline among pending entries, if any.
    pub fn earliest_deadline(&self) -> Option<Instant> {
        self.pending.values().map(|entry| entry.deadline).min()
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use tokio::sync::oneshot;
    use tokio::time::Instant;

    use super::{CallState, Correlator, PendingKind};

    fn call_entry() -> (PendingKind, oneshot::Receiver<Result<serde_json::Value, crate::errors::ClientError>>) {
        let (tx, rx) = oneshot::channel();
        (PendingKind::Call { outcome: tx }, rx)
    }

    #[test]
    fn entries_resolve_at_most_once() {
        let mut correlator = Correlator::default();
        let (kind, _rx) = call_entry();
        correlator.register(1, "echo".to_string(), kind, Instant::now());

        assert!(correlator.take(1).is_some());
        assert!(correlator.take(1).is_none());
    }

    #[test]
    fn due_removes_only_expired_entries() {
        let mut correlator = Correlator::default();
        let now = Instant::now();
        let (kind_a, _rx_a) = call_entry();
        let (kind_b, _rx_b) = call_entry();
        correlator.register(1, "a".to_string(), kind_a, now);
        correlator.register(2, "b".to_string(), kind_b, now + Duration::from_secs(60));

        let due = correlator.due(now + Duration::from_millis(1));
        assert_eq!(due.len(), 1);
        assert_eq!(due[0].0, 1);
        assert!(correlator.take(2).is_some());
    }

    #[test]
    fn earliest_deadline_tracks_the_soonest_entry() {
        let mut correlator = Correlator::default();
        assert!(correlator.earliest_deadline().is_none());

        let now = Instant::now();
        correlator.register(1, "a".to_string(), PendingKind::Ping, now + Duration::from_secs(5));
        correlator.register(
            2,
            "b".to_string(),
            PendingKind::Subscribe {
                topic: "user:1:update".to_string(),
            },
            now + Duration::from_secs(2),
        );
        assert_eq!(correlator.earliest_deadline(), Some(now + Duration::from_secs(2)));
    }

    #[test]
    fn drain_empties_the_table() {
        let mut correlator = Correlator::default();
        let now = Instant::now();
        correlator.register(1, "a".to_string(), PendingKind::Ping, now);
        correlator.register(
            2,
            "b".to_string(),
            PendingKind::Unsubscribe {
                topic: "t".to_string(),
            },
            now,
        );

        assert_eq!(correlator.drain().len(), 2);
        assert!(correlator.earliest_deadline().is_none());
    }

    #[test]
    fn mark_sending_advances_the_call_state() {
        let mut correlator = Correlator::default();
        let (kind, _rx) = call_entry();
        correlator.register(1, "echo".to_string(), kind, Instant::now());
        correlator.mark_sending(1);
        assert_eq!(correlator.take(1).expect("entry").state, CallState::Sending);
    }
}
