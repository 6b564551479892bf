//! High-level Constellation client.
//!
//! `Client` is a thin facade over [`Socket`]: it opens and closes the
//! connection and hands out per-topic event streams. All resilience logic
//! (reconnects, keep-alive, re-subscription) lives in the socket layer.

use serde_json::Value;
use tokio::sync::{mpsc, watch};

use crate::errors::ClientError;
use crate::socket::{Alert, LiveEvents, Socket, SocketOptions, State};

/// Facade over a Constellation socket.
pub struct Client {
    socket: Socket,
}

impl Client {
    /// Validates the options and creates the client. No connection is made
    /// until [`Client::open`].
    pub fn new(options: SocketOptions) -> Result<Self, ClientError> {
        Ok(Self {
            socket: Socket::new(options)?,
        })
    }

    /// Boots the connection.
    pub fn open(&self) {
        self.socket.connect();
    }

    /// Gracefully shuts the connection down. Listeners stay registered and
    /// re-assert their interest if the client is opened again.
    pub fn close(&self) {
        self.socket.close();
    }

    /// Access to the underlying socket for lower-level control.
    pub fn socket(&self) -> &Socket {
        &self.socket
    }

    /// Current connection state.
    pub fn state(&self) -> State {
        self.socket.state()
    }

    /// Watch channel publishing every state change.
    pub fn state_changes(&self) -> watch::Receiver<State> {
        self.socket.state_changes()
    }

    /// Takes the connection-level alert stream. Returns `None` after the
    /// first call.
    pub fn take_alerts(&self) -> Option<mpsc::UnboundedReceiver<Alert>> {
        self.socket.take_alerts()
    }

    /// Subscribes to a live event topic and returns its payload stream.
    ///
    /// Each call registers an independent listener; subscribing twice to the
    /// same slug yields two streams that both receive every event. Dropping
    /// a stream (or calling [`LiveEvents::unsubscribe`]) removes its
    /// listener, and the topic's upstream interest is revoked when the last
    /// one goes.
    pub fn subscribe(&self, slug: &str) -> Result<LiveEvents, ClientError> {
        self.socket.add_listener(slug)
    }

    /// Removes every listener for a slug.
    pub fn unsubscribe_all(&self, slug: &str) {
        self.socket.remove_all_listeners(slug);
    }

    /// Calls a method on the server and awaits its outcome.
    pub async fn execute(&self, method: &str, params: Option<Value>) -> Result<Value, ClientError> {
        self.socket.execute(method, params).await
    }
}
