//! Connection worker: owns the transport and drives the lifecycle state
//! machine, the keep-alive watchdog, call correlation, and subscription
//! re-sync.
//!
//! Everything runs on one task. Commands, socket events, and timer expiry
//! are multiplexed through `tokio::select!`, so state transitions are
//! strictly sequential and the reply/timeout/close race per call is settled
//! by whichever signal the loop observes first.

use std::sync::Arc;
use std::time::Duration;

use serde_json::{json, Value};
use tokio::sync::{mpsc, oneshot, watch};
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::backoff::ReconnectPolicy;
use crate::errors::{ClientError, ServerError};
use crate::socket::correlator::{Correlator, PendingKind};
use crate::socket::proto::{next_call_id, parse_frame, Frame, LiveEventData, ReplyError};
use crate::socket::transform::{PayloadTransform, WirePayload};
use crate::socket::transport::{ConnectRequest, Transport, TransportEvent, TransportFactory};
use crate::socket::{Alert, State};
use crate::subscription::{SubscriptionRegistry, UpstreamOp};

/// Commands accepted by the worker.
pub(crate) enum Command {
    Connect,
    Close,
    Call {
        method: String,
        params: Option<Value>,
        timeout: Option<Duration>,
        outcome: oneshot::Sender<Result<Value, ClientError>>,
    },
    AddListener {
        topic: String,
        id: u64,
        sink: mpsc::UnboundedSender<Value>,
    },
    RemoveListener {
        topic: String,
        id: u64,
    },
    RemoveAllListeners {
        topic: String,
    },
}

pub(crate) struct WorkerConfig {
    pub request: ConnectRequest,
    pub transform: Arc<dyn PayloadTransform>,
    pub factory: Arc<dyn TransportFactory>,
    pub policy: Box<dyn ReconnectPolicy>,
    pub auto_reconnect: bool,
    pub reply_timeout: Duration,
    pub ping_interval: Duration,
}

pub(crate) async fn run(
    config: WorkerConfig,
    cmd_rx: mpsc::UnboundedReceiver<Command>,
    state_tx: watch::Sender<State>,
    alert_tx: mpsc::UnboundedSender<Alert>,
) {
    Machine {
        request: config.request,
        transform: config.transform,
        factory: config.factory,
        policy: config.policy,
        auto_reconnect: config.auto_reconnect,
        reply_timeout: config.reply_timeout,
        ping_interval: config.ping_interval,
        cmd_rx,
        state_tx,
        alert_tx,
        state: State::Idle,
        correlator: Correlator::default(),
        registry: SubscriptionRegistry::default(),
        ping_due: None,
    }
    .run()
    .await;
}

enum Flow {
    Continue,
    Shutdown,
}

enum SessionEnd {
    /// Every handle was dropped; the worker exits.
    Shutdown,
    /// The socket closed, gracefully or not.
    Closed { code: u16, reason: String },
}

struct Machine {
    request: ConnectRequest,
    transform: Arc<dyn PayloadTransform>,
    factory: Arc<dyn TransportFactory>,
    policy: Box<dyn ReconnectPolicy>,
    auto_reconnect: bool,
    reply_timeout: Duration,
    ping_interval: Duration,

    cmd_rx: mpsc::UnboundedReceiver<Command>,
    state_tx: watch::Sender<State>,
    alert_tx: mpsc::UnboundedSender<Alert>,

    state: State,
    correlator: Correlator,
    registry: SubscriptionRegistry,
    /// When the keep-alive probe fires next; disarmed while a ping is in
    /// flight and re-armed by any inbound traffic.
    ping_due: Option<Instant>,
}

impl Machine {
    async fn run(mut self) {
        loop {
            let flow = match self.state {
                State::Idle => self.run_idle().await,
                State::Connecting => self.run_connecting().await,
                State::Reconnecting => self.run_reconnecting().await,
                other => {
                    debug!(event = "unexpected_loop_state", state = %other);
                    self.set_state(State::Idle);
                    Flow::Continue
                }
            };
            if matches!(flow, Flow::Shutdown) {
                debug!(event = "worker_shutdown");
                return;
            }
        }
    }

    async fn run_idle(&mut self) -> Flow {
        loop {
            match self.cmd_rx.recv().await {
                None => return Flow::Shutdown,
                Some(Command::Connect) => {
                    self.set_state(State::Connecting);
                    return Flow::Continue;
                }
                Some(cmd) => self.handle_disconnected_command(cmd),
            }
        }
    }

    async fn run_connecting(&mut self) -> Flow {
        let factory = Arc::clone(&self.factory);
        let request = self.request.clone();
        let connect = async move { factory.connect(request).await };
        tokio::pin!(connect);

        loop {
            tokio::select! {
                result = &mut connect => match result {
                    Ok(transport) => return self.run_session(transport).await,
                    Err(err) => {
                        warn!(event = "connect_failed", error = %err);
                        self.alert(Alert::Warning(err));
                        if self.auto_reconnect {
                            self.set_state(State::Reconnecting);
                        } else {
                            self.set_state(State::Idle);
                        }
                        return Flow::Continue;
                    }
                },
                cmd = self.cmd_rx.recv() => match cmd {
                    None => return Flow::Shutdown,
                    Some(Command::Close) => {
                        // Abandon the attempt; there is no socket to close.
                        self.set_state(State::Closing);
                        self.set_state(State::Idle);
                        return Flow::Continue;
                    }
                    Some(Command::Connect) => {}
                    Some(cmd) => self.handle_disconnected_command(cmd),
                },
            }
        }
    }

    async fn run_reconnecting(&mut self) -> Flow {
        let delay = self.policy.next();
        debug!(event = "reconnect_scheduled", delay_ms = delay.as_millis() as u64);
        let sleep = tokio::time::sleep(delay);
        tokio::pin!(sleep);

        loop {
            tokio::select! {
                _ = &mut sleep => {
                    self.set_state(State::Connecting);
                    return Flow::Continue;
                }
                cmd = self.cmd_rx.recv() => match cmd {
                    None => return Flow::Shutdown,
                    Some(Command::Close) => {
                        self.set_state(State::Idle);
                        return Flow::Continue;
                    }
                    Some(Command::Connect) => {
                        self.set_state(State::Connecting);
                        return Flow::Continue;
                    }
                    Some(cmd) => self.handle_disconnected_command(cmd),
                },
            }
        }
    }

    async fn run_session(&mut self, mut transport: Box<dyn Transport>) -> Flow {
        self.arm_ping();

        let end = loop {
            let wake = self.next_wake();
            tokio::select! {
                cmd = self.cmd_rx.recv() => match cmd {
                    None => {
                        transport.close().await;
                        break SessionEnd::Shutdown;
                    }
                    Some(cmd) => self.on_session_command(cmd, &mut transport).await,
                },
                event = transport.next_event() => match event {
                    TransportEvent::Message(payload) => self.on_message(payload, &mut transport).await,
                    TransportEvent::Closed { code, reason } => break SessionEnd::Closed { code, reason },
                },
                _ = sleep_until_opt(wake) => self.on_timer(&mut transport).await,
            }
        };

        self.ping_due = None;
        for (_, entry) in self.correlator.drain() {
            // Internal pings and (un)subscribes cancelled by a close are
            // expected races; only caller-issued calls see the cancellation.
            if let PendingKind::Call { outcome } = entry.kind {
                let _ = outcome.send(Err(ClientError::Cancelled));
            }
        }
        self.registry.on_disconnected();

        match end {
            SessionEnd::Shutdown => Flow::Shutdown,
            SessionEnd::Closed { code, reason } => {
                debug!(event = "socket_closed", code, reason = %reason, state = %self.state);
                match self.state {
                    State::Refreshing => {
                        self.set_state(State::Idle);
                        self.set_state(State::Connecting);
                    }
                    State::Closing => self.set_state(State::Idle),
                    _ => {
                        let err = ServerError::from_code(code, reason);
                        if !err.should_reconnect() {
                            self.set_state(State::Idle);
                            self.alert(Alert::Error(err.into()));
                        } else if self.auto_reconnect {
                            self.alert(Alert::Warning(err.into()));
                            self.set_state(State::Reconnecting);
                        } else {
                            self.alert(Alert::Warning(err.into()));
                            self.set_state(State::Idle);
                        }
                    }
                }
                Flow::Continue
            }
        }
    }

    async fn on_session_command(&mut self, cmd: Command, transport: &mut Box<dyn Transport>) {
        match cmd {
            Command::Connect => {
                if self.state == State::Closing {
                    self.set_state(State::Refreshing);
                }
            }
            Command::Close => match self.state {
                State::Connected | State::Connecting => {
                    self.set_state(State::Closing);
                    self.ping_due = None;
                    transport.close().await;
                }
                State::Refreshing => self.set_state(State::Closing),
                _ => {}
            },
            Command::Call {
                method,
                params,
                timeout,
                outcome,
            } => {
                if matches!(self.state, State::Closing | State::Refreshing) {
                    let _ = outcome.send(Err(ClientError::Cancelled));
                } else {
                    self.send_call(transport, &method, params, timeout, PendingKind::Call { outcome })
                        .await;
                }
            }
            Command::AddListener { topic, id, sink } => {
                let op = self.registry.add(&topic, id, sink, self.state == State::Connected);
                debug!(
                    event = "listener_added",
                    %topic,
                    id,
                    listeners = self.registry.listener_count(&topic)
                );
                self.apply_upstream(op, transport).await;
            }
            Command::RemoveListener { topic, id } => {
                let op = self.registry.remove(&topic, id, self.state == State::Connected);
                self.apply_upstream(op, transport).await;
            }
            Command::RemoveAllListeners { topic } => {
                let op = self.registry.remove_all(&topic, self.state == State::Connected);
                self.apply_upstream(op, transport).await;
            }
        }
    }

    async fn on_message(&mut self, payload: WirePayload, transport: &mut Box<dyn Transport>) {
        // All inbound traffic is liveness evidence.
        self.arm_ping();

        let text = match self.transform.incoming(payload) {
            Ok(text) => text,
            Err(err) => {
                warn!(event = "incoming_transform_failed", error = %err);
                self.alert(Alert::Warning(err));
                return;
            }
        };

        match parse_frame(&text) {
            Err(err) => {
                warn!(event = "frame_parse_failed", error = %err);
                self.alert(Alert::Warning(err));
            }
            Ok(Frame::Event { event, data }) => match event.as_str() {
                "hello" => self.on_hello(transport).await,
                "live" => self.on_live_event(data, transport).await,
                other => debug!(event = "event_ignored", name = other),
            },
            Ok(Frame::Reply { id, error, result }) => self.on_reply(id, error, result),
            Ok(Frame::Method { .. }) => {
                self.alert(Alert::Warning(ClientError::MessageParse(
                    "server sent a method frame".to_string(),
                )));
            }
        }
    }

    async fn on_hello(&mut self, transport: &mut Box<dyn Transport>) {
        if self.state != State::Connecting {
            debug!(event = "hello_ignored", state = %self.state);
            return;
        }

        self.policy.reset();
        self.set_state(State::Connected);

        for topic in self.registry.on_connected() {
            let params = json!({ "events": [topic.clone()] });
            self.send_call(
                transport,
                "livesubscribe",
                Some(params),
                None,
                PendingKind::Subscribe { topic },
            )
            .await;
        }
    }

    async fn on_live_event(&mut self, data: Option<Value>, transport: &mut Box<dyn Transport>) {
        let Some(data) = data else {
            self.alert(Alert::Warning(ClientError::MessageParse(
                "live event without data".to_string(),
            )));
            return;
        };

        match serde_json::from_value::<LiveEventData>(data) {
            Ok(live) => {
                let connected = self.state == State::Connected;
                let (delivered, op) = self.registry.dispatch(&live.channel, &live.payload, connected);
                debug!(event = "live_dispatched", channel = %live.channel, delivered);
                self.apply_upstream(op, transport).await;
            }
            Err(err) => {
                self.alert(Alert::Warning(ClientError::MessageParse(format!(
                    "live event data: {err}"
                ))));
            }
        }
    }

    fn on_reply(&mut self, id: u64, error: Option<ReplyError>, result: Option<Value>) {
        let Some(entry) = self.correlator.take(id) else {
            debug!(event = "reply_unmatched", id);
            return;
        };
        debug!(event = "reply_matched", id, method = %entry.method, state = ?entry.state);

        let outcome = match error {
            Some(err) => Err(ClientError::Server(ServerError::from_code(err.code, err.message))),
            None => Ok(result.unwrap_or(Value::Null)),
        };

        match entry.kind {
            PendingKind::Call { outcome: tx } => {
                let _ = tx.send(outcome);
            }
            PendingKind::Ping => match outcome {
                Ok(_) => debug!(event = "pong", id),
                Err(err) => warn!(event = "ping_rejected", id, error = %err),
            },
            PendingKind::Subscribe { topic } => {
                if let Err(err) = outcome {
                    if !err.is_cancelled() {
                        warn!(event = "subscribe_rejected", %topic, error = %err);
                        self.alert(Alert::Error(err));
                    }
                }
            }
            PendingKind::Unsubscribe { topic } => {
                if let Err(err) = outcome {
                    debug!(event = "unsubscribe_rejected", %topic, error = %err);
                }
            }
        }
    }

    async fn on_timer(&mut self, transport: &mut Box<dyn Transport>) {
        let now = Instant::now();
        let mut ping_timed_out = false;

        for (id, entry) in self.correlator.due(now) {
            match entry.kind {
                PendingKind::Call { outcome } => {
                    debug!(event = "call_timeout", id, method = %entry.method);
                    let _ = outcome.send(Err(ClientError::ReplyTimeout {
                        method: entry.method,
                    }));
                }
                PendingKind::Ping => ping_timed_out = true,
                PendingKind::Subscribe { topic } => {
                    warn!(event = "subscribe_timeout", id, %topic);
                    self.alert(Alert::Error(ClientError::ReplyTimeout {
                        method: entry.method,
                    }));
                }
                PendingKind::Unsubscribe { .. } => {}
            }
        }

        if ping_timed_out {
            // Force-close and let the resulting close event drive the
            // reconnection path.
            warn!(event = "ping_timeout");
            self.alert(Alert::Warning(ClientError::ReplyTimeout {
                method: "ping".to_string(),
            }));
            transport.close().await;
            return;
        }

        if let Some(due) = self.ping_due {
            if due <= now {
                if self.state == State::Connected {
                    self.ping_due = None;
                    self.send_call(transport, "ping", None, None, PendingKind::Ping).await;
                } else {
                    self.arm_ping();
                }
            }
        }
    }

    async fn send_call(
        &mut self,
        transport: &mut Box<dyn Transport>,
        method: &str,
        params: Option<Value>,
        timeout: Option<Duration>,
        kind: PendingKind,
    ) {
        let id = next_call_id();
        let frame = Frame::Method {
            id,
            method: method.to_string(),
            params,
        };
        let deadline = Instant::now() + timeout.unwrap_or(self.reply_timeout);
        self.correlator.register(id, method.to_string(), kind, deadline);

        let encoded = match frame.to_text() {
            Ok(text) => text,
            Err(err) => {
                self.fail_pending(id, ClientError::MessageParse(format!("encode: {err}")));
                return;
            }
        };
        let payload = match self.transform.outgoing(encoded, &frame) {
            Ok(payload) => payload,
            Err(err) => {
                self.fail_pending(id, err);
                return;
            }
        };

        debug!(event = "call_sent", id, method);
        match transport.send(payload).await {
            Ok(()) => self.correlator.mark_sending(id),
            Err(err) => {
                // Leave the entry pending: the close event that follows the
                // write failure cancels it exactly once.
                warn!(event = "send_failed", id, error = %err);
                transport.close().await;
            }
        }
    }

    fn fail_pending(&mut self, id: u64, err: ClientError) {
        let Some(entry) = self.correlator.take(id) else {
            return;
        };
        match entry.kind {
            PendingKind::Call { outcome } => {
                let _ = outcome.send(Err(err));
            }
            PendingKind::Ping => warn!(event = "ping_failed", error = %err),
            PendingKind::Subscribe { topic } => {
                if !err.is_cancelled() {
                    warn!(event = "subscribe_failed", %topic, error = %err);
                    self.alert(Alert::Error(err));
                }
            }
            PendingKind::Unsubscribe { .. } => {}
        }
    }

    async fn apply_upstream(&mut self, op: Option<UpstreamOp>, transport: &mut Box<dyn Transport>) {
        match op {
            Some(UpstreamOp::Subscribe(topic)) => {
                let params = json!({ "events": [topic.clone()] });
                self.send_call(
                    transport,
                    "livesubscribe",
                    Some(params),
                    None,
                    PendingKind::Subscribe { topic },
                )
                .await;
            }
            Some(UpstreamOp::Unsubscribe(topic)) => {
                let params = json!({ "events": [topic.clone()] });
                self.send_call(
                    transport,
                    "liveunsubscribe",
                    Some(params),
                    None,
                    PendingKind::Unsubscribe { topic },
                )
                .await;
            }
            None => {}
        }
    }

    fn handle_disconnected_command(&mut self, cmd: Command) {
        match cmd {
            Command::Connect | Command::Close => {}
            Command::Call { outcome, .. } => {
                let _ = outcome.send(Err(ClientError::Cancelled));
            }
            Command::AddListener { topic, id, sink } => {
                let _ = self.registry.add(&topic, id, sink, false);
            }
            Command::RemoveListener { topic, id } => {
                let _ = self.registry.remove(&topic, id, false);
            }
            Command::RemoveAllListeners { topic } => {
                let _ = self.registry.remove_all(&topic, false);
            }
        }
    }

    fn next_wake(&self) -> Option<Instant> {
        let mut wake = self.correlator.earliest_deadline();
        if let Some(ping) = self.ping_due {
            wake = Some(wake.map_or(ping, |at| at.min(ping)));
        }
        wake
    }

    fn arm_ping(&mut self) {
        self.ping_due = Some(Instant::now() + self.ping_interval);
    }

    fn set_state(&mut self, state: State) {
        if self.state == state {
            return;
        }
        debug!(event = "state_changed", from = %self.state, to = %state);
        self.state = state;
        let _ = self.state_tx.send(state);
    }

    fn alert(&self, alert: Alert) {
        let _ = self.alert_tx.send(alert);
    }
}

async fn sleep_until_opt(deadline: Option<Instant>) {
    match deadline {
        Some(at) => tokio::time::sleep_until(at).await,
        None => std::future::pending().await,
    }
}
