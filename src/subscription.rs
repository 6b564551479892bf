//! Topic subscription registry and event fan-out.
//!
//! The registry tracks which topics have listeners and whether interest is
//! currently asserted upstream. It never touches the socket: mutations
//! return the upstream command the worker must issue, and the worker calls
//! [`SubscriptionRegistry::on_connected`] after every handshake to learn
//! which topics to re-subscribe (the server keeps no subscription state
//! across disconnects).

use std::collections::HashMap;

use serde_json::Value;
use tokio::sync::mpsc;

/// Upstream command owed after a registry mutation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum UpstreamOp {
    Subscribe(String),
    Unsubscribe(String),
}

struct Listener {
    id: u64,
    sink: mpsc::UnboundedSender<Value>,
}

#[derive(Default)]
struct TopicEntry {
    listeners: Vec<Listener>,
    asserted: bool,
}

#[derive(Default)]
pub(crate) struct SubscriptionRegistry {
    topics: HashMap<String, TopicEntry>,
}

impl SubscriptionRegistry {
    /// Registers a listener. Returns the subscribe command when this topic's
    /// interest must be asserted now (connected and not yet asserted).
    pub fn add(
        &mut self,
        topic: &str,
        id: u64,
        sink: mpsc::UnboundedSender<Value>,
        connected: bool,
    ) -> Option<UpstreamOp> {
        let entry = self.topics.entry(topic.to_string()).or_default();
        entry.listeners.push(Listener { id, sink });

        if connected && !entry.asserted {
            entry.asserted = true;
            return Some(UpstreamOp::Subscribe(topic.to_string()));
        }
        None
    }

    /// Deregisters one listener. Returns the unsubscribe command when the
    /// last listener is gone and interest was asserted upstream.
    pub fn remove(&mut self, topic: &str, id: u64, connected: bool) -> Option<UpstreamOp> {
        let entry = self.topics.get_mut(topic)?;
        entry.listeners.retain(|listener| listener.id != id);
        self.drop_if_empty(topic, connected)
    }

    /// Deregisters every listener for a topic.
    pub fn remove_all(&mut self, topic: &str, connected: bool) -> Option<UpstreamOp> {
        let entry = self.topics.get_mut(topic)?;
        entry.listeners.clear();
        self.drop_if_empty(topic, connected)
    }

    /// Fans a topic payload out to every current listener. Listeners whose
    /// receivers are gone are pruned and count as removed.
    pub fn dispatch(
        &mut self,
        channel: &str,
        payload: &Value,
        connected: bool,
    ) -> (usize, Option<UpstreamOp>) {
        let Some(entry) = self.topics.get_mut(channel) else {
            return (0, None);
        };

        let mut delivered = 0;
        entry
            .listeners
            .retain(|listener| match listener.sink.send(payload.clone()) {
                Ok(()) => {
                    delivered += 1;
                    true
                }
                Err(_) => false,
            });

        (delivered, self.drop_if_empty(channel, connected))
    }

    /// Called after each handshake: returns every topic that needs a fresh
    /// `livesubscribe`, marking interest as asserted.
    pub fn on_connected(&mut self) -> Vec<String> {
        let mut topics: Vec<String> = self
            .topics
            .iter_mut()
            .map(|(topic, entry)| {
                entry.asserted = true;
                topic.clone()
            })
            .collect();
        topics.sort();
        topics
    }

    /// Called on every disconnect: upstream interest is gone, listeners stay.
    pub fn on_disconnected(&mut self) {
        for entry in self.topics.values_mut() {
            entry.asserted = false;
        }
    }

    pub fn listener_count(&self, topic: &str) -> usize {
        self.topics
            .get(topic)
            .map(|entry| entry.listeners.len())
            .unwrap_or(0)
    }

    fn drop_if_empty(&mut self, topic: &str, connected: bool) -> Option<UpstreamOp> {
        let entry = self.topics.get(topic)?;
        if !entry.listeners.is_empty() {
            return None;
        }

        let asserted = entry.asserted;
        self.topics.remove(topic);
        (connected && asserted).then(|| UpstreamOp::Unsubscribe(topic.to_string()))
    }
}
