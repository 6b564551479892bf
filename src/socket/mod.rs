//! Low-level Constellation socket: connection lifecycle, RPC correlation,
//! and live-event interest tracking.
//!
//! [`Socket::new`] validates the configuration and spawns a background
//! worker that exclusively owns the websocket. The handle communicates with
//! the worker over channels only: commands in, a `watch` of connection state
//! and a typed alert stream out, and a `oneshot` per call for its single
//! outcome.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use secrecy::{ExposeSecret, SecretString};
use serde_json::Value;
use tokio::sync::{mpsc, oneshot, watch};
use url::Url;

use crate::backoff::{ExponentialBackoff, ReconnectPolicy};
use crate::errors::ClientError;

pub mod proto;
pub mod transform;
pub mod transport;

pub(crate) mod correlator;
mod worker;

use self::transform::{CompressDetector, GzipTransform, IdentityTransform, PayloadTransform};
use self::transport::{ConnectRequest, TransportFactory, WsConnector};
use self::worker::Command;

static LISTENER_SEQ: AtomicU64 = AtomicU64::new(0);

/// Connection lifecycle state.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum State {
    /// No connection attempt has been made, or the socket was closed.
    Idle,
    /// A connection attempt is in flight (socket opening or handshake
    /// acknowledgement pending).
    Connecting,
    /// The handshake completed; calls and events flow.
    Connected,
    /// A graceful close is in flight.
    Closing,
    /// The socket dropped unexpectedly and a reconnect is scheduled.
    Reconnecting,
    /// `connect()` arrived while closing; a reconnect follows the close.
    Refreshing,
}

impl fmt::Display for State {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Idle => "idle",
            Self::Connecting => "connecting",
            Self::Connected => "connected",
            Self::Closing => "closing",
            Self::Reconnecting => "reconnecting",
            Self::Refreshing => "refreshing",
        };
        f.write_str(name)
    }
}

/// Connection-level notification that is not the outcome of a single call.
#[derive(Debug)]
pub enum Alert {
    /// Recoverable condition: a dropped connection pending reconnect, a ping
    /// timeout, a message that failed to parse.
    Warning(ClientError),
    /// Non-recoverable condition: the connection is down and will not be
    /// retried automatically.
    Error(ClientError),
}

/// Default configuration values.
pub struct SocketDefaults;

impl SocketDefaults {
    pub const URL: &'static str = "wss://constellation.mixer.com";
    pub const USER_AGENT: &'static str =
        concat!("constellation-client ", env!("CARGO_PKG_VERSION"));
    pub const REPLY_TIMEOUT: Duration = Duration::from_secs(10);
    pub const PING_INTERVAL: Duration = Duration::from_secs(10);
    pub const COMPRESS_THRESHOLD: usize = 1024;
}

const SUBPROTOCOL_PLAIN: &str = "cnstl";
const SUBPROTOCOL_GZIP: &str = "cnstl-gzip";

/// Socket configuration. Construct with [`SocketOptions::new`] and the
/// `with_*` builders; validation happens in [`Socket::new`], before any
/// socket is opened.
pub struct SocketOptions {
    /// Websocket endpoint URL.
    pub url: String,
    /// `User-Agent` header value.
    pub user_agent: String,
    /// Whether to announce the client as a bot in the `X-Is-Bot` header.
    /// Note that turning this off may get the session banned.
    pub is_bot: bool,
    /// Whether to reconnect automatically after an unexpected close.
    pub auto_reconnect: bool,
    /// Whether to negotiate the compressed subprotocol.
    pub compression: bool,
    /// Default timeout for call replies.
    pub reply_timeout: Duration,
    /// Keep-alive probe interval.
    pub ping_interval: Duration,
    /// Extra query-string pairs appended to the endpoint URL.
    pub query: Vec<(String, String)>,
    /// JSON web token, sent as the `jwt` query parameter.
    pub jwt: Option<SecretString>,
    /// OAuth token, sent as an `Authorization: Bearer` header.
    pub bearer_token: Option<SecretString>,
    /// Delay policy for reconnect attempts.
    pub reconnect_policy: Box<dyn ReconnectPolicy>,
    /// Transform applied between serialized frames and the wire.
    pub transform: Arc<dyn PayloadTransform>,
    /// Factory producing the underlying transport.
    pub transport_factory: Arc<dyn TransportFactory>,
}

impl SocketOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_url(mut self, url: impl Into<String>) -> Self {
        self.url = url.into();
        self
    }

    pub fn with_user_agent(mut self, user_agent: impl Into<String>) -> Self {
        self.user_agent = user_agent.into();
        self
    }

    pub fn with_is_bot(mut self, is_bot: bool) -> Self {
        self.is_bot = is_bot;
        self
    }

    pub fn with_auto_reconnect(mut self, auto_reconnect: bool) -> Self {
        self.auto_reconnect = auto_reconnect;
        self
    }

    /// Enables or disables compression. Disabling swaps in the pass-through
    /// transform and the plain subprotocol.
    pub fn with_compression(mut self, compression: bool) -> Self {
        self.compression = compression;
        if !compression {
            self.transform = Arc::new(IdentityTransform);
        }
        self
    }

    /// Replaces the compression detector, keeping the gzip transform.
    pub fn with_compress_detector(mut self, detector: Box<dyn CompressDetector>) -> Self {
        self.compression = true;
        self.transform = Arc::new(GzipTransform::new(detector));
        self
    }

    pub fn with_transform(mut self, transform: Arc<dyn PayloadTransform>) -> Self {
        self.transform = transform;
        self
    }

    pub fn with_jwt(mut self, jwt: SecretString) -> Self {
        self.jwt = Some(jwt);
        self
    }

    pub fn with_bearer_token(mut self, token: SecretString) -> Self {
        self.bearer_token = Some(token);
        self
    }

    pub fn with_reply_timeout(mut self, timeout: Duration) -> Self {
        self.reply_timeout = timeout;
        self
    }

    pub fn with_ping_interval(mut self, interval: Duration) -> Self {
        self.ping_interval = interval;
        self
    }

    pub fn with_query_param(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.query.push((name.into(), value.into()));
        self
    }

    pub fn with_reconnect_policy(mut self, policy: Box<dyn ReconnectPolicy>) -> Self {
        self.reconnect_policy = policy;
        self
    }

    pub fn with_transport_factory(mut self, factory: Arc<dyn TransportFactory>) -> Self {
        self.transport_factory = factory;
        self
    }

    fn validate(&self) -> Result<(), ClientError> {
        if self.jwt.is_some() && self.bearer_token.is_some() {
            return Err(ClientError::Config(
                "cannot connect with both a JWT and a bearer token".to_string(),
            ));
        }

        if let Some(jwt) = &self.jwt {
            if !is_well_formed_jwt(jwt.expose_secret()) {
                return Err(ClientError::Config("invalid JWT".to_string()));
            }
        }

        Url::parse(&self.url)
            .map_err(|err| ClientError::Config(format!("invalid endpoint URL: {err}")))?;
        Ok(())
    }

    fn connect_request(&self) -> Result<ConnectRequest, ClientError> {
        let mut url = Url::parse(&self.url)
            .map_err(|err| ClientError::Config(format!("invalid endpoint URL: {err}")))?;

        if !self.query.is_empty() || self.jwt.is_some() {
            let mut pairs = url.query_pairs_mut();
            for (name, value) in &self.query {
                pairs.append_pair(name, value);
            }
            if let Some(jwt) = &self.jwt {
                pairs.append_pair("jwt", jwt.expose_secret());
            }
        }

        let mut headers = vec![
            ("User-Agent".to_string(), self.user_agent.clone()),
            ("X-Is-Bot".to_string(), self.is_bot.to_string()),
        ];
        if let Some(token) = &self.bearer_token {
            headers.push((
                "Authorization".to_string(),
                format!("Bearer {}", token.expose_secret()),
            ));
        }

        Ok(ConnectRequest {
            url: url.to_string(),
            subprotocol: if self.compression {
                SUBPROTOCOL_GZIP.to_string()
            } else {
                SUBPROTOCOL_PLAIN.to_string()
            },
            headers,
        })
    }
}

impl Default for SocketOptions {
    fn default() -> Self {
        Self {
            url: SocketDefaults::URL.to_string(),
            user_agent: SocketDefaults::USER_AGENT.to_string(),
            is_bot: true,
            auto_reconnect: true,
            compression: true,
            reply_timeout: SocketDefaults::REPLY_TIMEOUT,
            ping_interval: SocketDefaults::PING_INTERVAL,
            query: Vec::new(),
            jwt: None,
            bearer_token: None,
            reconnect_policy: Box::new(ExponentialBackoff::default()),
            transform: Arc::new(GzipTransform::default()),
            transport_factory: Arc::new(WsConnector),
        }
    }
}

fn is_well_formed_jwt(token: &str) -> bool {
    let segments: Vec<&str> = token.split('.').collect();
    if segments.len() != 3 {
        return false;
    }
    if segments[0].is_empty() || segments[1].is_empty() {
        return false;
    }
    segments.iter().all(|segment| {
        segment
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
    })
}

/// Handle to a Constellation socket.
///
/// Cheap operations are synchronous commands to the worker; `execute` awaits
/// its call's single outcome. Dropping every handle-derived sender shuts the
/// worker down after a graceful close.
pub struct Socket {
    cmd_tx: mpsc::UnboundedSender<Command>,
    state_rx: watch::Receiver<State>,
    alerts: Mutex<Option<mpsc::UnboundedReceiver<Alert>>>,
}

impl Socket {
    /// Validates the options and spawns the connection worker.
    ///
    /// Must be called within a tokio runtime. No socket is opened until
    /// [`Socket::connect`].
    pub fn new(options: SocketOptions) -> Result<Self, ClientError> {
        options.validate()?;
        let request = options.connect_request()?;

        let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
        let (state_tx, state_rx) = watch::channel(State::Idle);
        let (alert_tx, alert_rx) = mpsc::unbounded_channel();

        let config = worker::WorkerConfig {
            request,
            transform: options.transform,
            factory: options.transport_factory,
            policy: options.reconnect_policy,
            auto_reconnect: options.auto_reconnect,
            reply_timeout: options.reply_timeout,
            ping_interval: options.ping_interval,
        };
        tokio::spawn(worker::run(config, cmd_rx, state_tx, alert_tx));

        Ok(Self {
            cmd_tx,
            state_rx,
            alerts: Mutex::new(Some(alert_rx)),
        })
    }

    /// Requests a connection attempt. A no-op unless the socket is idle,
    /// reconnecting (attempts immediately), or closing (defers the attempt
    /// until the close completes).
    pub fn connect(&self) {
        let _ = self.cmd_tx.send(Command::Connect);
    }

    /// Requests a graceful shutdown of the connection. Outstanding calls
    /// resolve with the cancellation error; listeners stay registered.
    pub fn close(&self) {
        let _ = self.cmd_tx.send(Command::Close);
    }

    /// Current connection state.
    pub fn state(&self) -> State {
        *self.state_rx.borrow()
    }

    /// Watch channel publishing every state change.
    pub fn state_changes(&self) -> watch::Receiver<State> {
        self.state_rx.clone()
    }

    /// Takes the alert stream. Returns `None` after the first call.
    pub fn take_alerts(&self) -> Option<mpsc::UnboundedReceiver<Alert>> {
        self.alerts.lock().expect("alerts mutex poisoned").take()
    }

    /// Calls a method on the server and awaits its single outcome with the
    /// default reply timeout.
    pub async fn execute(&self, method: &str, params: Option<Value>) -> Result<Value, ClientError> {
        self.execute_with_timeout(method, params, None).await
    }

    /// Calls a method with a per-call timeout override.
    pub async fn execute_with_timeout(
        &self,
        method: &str,
        params: Option<Value>,
        timeout: Option<Duration>,
    ) -> Result<Value, ClientError> {
        let (outcome_tx, outcome_rx) = oneshot::channel();
        self.cmd_tx
            .send(Command::Call {
                method: method.to_string(),
                params,
                timeout,
                outcome: outcome_tx,
            })
            .map_err(|_| ClientError::WorkerGone)?;
        outcome_rx.await.map_err(|_| ClientError::WorkerGone)?
    }

    /// Registers a listener for a topic and returns its event stream.
    ///
    /// The first listener for a topic asserts upstream interest (immediately
    /// when connected, otherwise at the next handshake). Duplicate listeners
    /// for the same topic are allowed and independently removable.
    pub fn add_listener(&self, topic: &str) -> Result<LiveEvents, ClientError> {
        let id = LISTENER_SEQ.fetch_add(1, Ordering::Relaxed);
        let (sink, rx) = mpsc::unbounded_channel();
        self.cmd_tx
            .send(Command::AddListener {
                topic: topic.to_string(),
                id,
                sink,
            })
            .map_err(|_| ClientError::WorkerGone)?;
        Ok(LiveEvents {
            topic: topic.to_string(),
            id,
            rx,
            cmd_tx: self.cmd_tx.clone(),
        })
    }

    /// Removes every listener for a topic, revoking upstream interest if
    /// connected.
    pub fn remove_all_listeners(&self, topic: &str) {
        let _ = self.cmd_tx.send(Command::RemoveAllListeners {
            topic: topic.to_string(),
        });
    }
}

/// Stream of payloads for one registered topic listener.
///
/// Dropping the handle deregisters the listener; when the topic's last
/// listener is gone a best-effort `liveunsubscribe` is issued.
pub struct LiveEvents {
    topic: String,
    id: u64,
    rx: mpsc::UnboundedReceiver<Value>,
    cmd_tx: mpsc::UnboundedSender<Command>,
}

impl LiveEvents {
    pub fn topic(&self) -> &str {
        &self.topic
    }

    /// Receives the next event payload for this topic. Returns `None` once
    /// the worker is gone.
    pub async fn recv(&mut self) -> Option<Value> {
        self.rx.recv().await
    }

    /// Deregisters this listener.
    pub fn unsubscribe(self) {}
}

impl Drop for LiveEvents {
    fn drop(&mut self) {
        let _ = self.cmd_tx.send(Command::RemoveListener {
            topic: self.topic.clone(),
            id: self.id,
        });
    }
}

#[cfg(test)]
mod tests {
    use secrecy::SecretString;

    use super::{SocketDefaults, SocketOptions};
    use crate::errors::ClientError;

    #[test]
    fn defaults_match_the_documented_configuration() {
        let options = SocketOptions::default();
        assert_eq!(options.url, SocketDefaults::URL);
        assert!(options.is_bot);
        assert!(options.auto_reconnect);
        assert!(options.compression);
        assert_eq!(options.reply_timeout, SocketDefaults::REPLY_TIMEOUT);
        assert_eq!(options.ping_interval, SocketDefaults::PING_INTERVAL);
    }

    #[test]
    fn rejects_jwt_and_bearer_token_together() {
        let options = SocketOptions::new()
            .with_jwt(SecretString::new("aaa.bbb.ccc".to_string()))
            .with_bearer_token(SecretString::new("oauth-token".to_string()));
        assert!(matches!(options.validate(), Err(ClientError::Config(_))));
    }

    #[test]
    fn rejects_malformed_jwts() {
        for bad in ["", "aaa", "aaa.bbb", ".bbb.ccc", "aaa..ccc", "aa!a.bbb.ccc", "a.b.c.d"] {
            let options = SocketOptions::new().with_jwt(SecretString::new(bad.to_string()));
            assert!(
                matches!(options.validate(), Err(ClientError::Config(_))),
                "JWT {bad:?} should be rejected"
            );
        }
    }

    #[test]
    fn accepts_well_formed_jwts_including_unsigned() {
        for good in ["aaa.bbb.ccc", "a-1.b_2.c-3", "aaa.bbb."] {
            let options = SocketOptions::new().with_jwt(SecretString::new(good.to_string()));
            assert!(options.validate().is_ok(), "JWT {good:?} should be accepted");
        }
    }

    #[test]
    fn jwt_lands_in_the_query_string() {
        let options = SocketOptions::new()
            .with_jwt(SecretString::new("aaa.bbb.ccc".to_string()))
            .with_query_param("version", "2");
        let request = options.connect_request().expect("request");
        assert!(request.url.contains("version=2"));
        assert!(request.url.contains("jwt=aaa.bbb.ccc"));
        assert!(!request
            .headers
            .iter()
            .any(|(name, _)| name == "Authorization"));
    }

    #[test]
    fn bearer_token_lands_in_the_authorization_header() {
        let options =
            SocketOptions::new().with_bearer_token(SecretString::new("oauth-token".to_string()));
        let request = options.connect_request().expect("request");
        assert!(!request.url.contains("jwt="));
        assert!(request
            .headers
            .contains(&("Authorization".to_string(), "Bearer oauth-token".to_string())));
    }

    #[test]
    fn subprotocol_tracks_the_compression_switch() {
        let compressed = SocketOptions::new().connect_request().expect("request");
        assert_eq!(compressed.subprotocol, "cnstl-gzip");

        let plain = SocketOptions::new()
            .with_compression(false)
            .connect_request()
            .expect("request");
        assert_eq!(plain.subprotocol, "cnstl");
    }

    #[test]
    fn bot_flag_is_advertised_in_headers() {
        let request = SocketOptions::new()
            .with_is_bot(false)
            .connect_request()
            .expect("request");
        assert!(request
            .headers
            .contains(&("X-Is-Bot".to_string(), "false".to_string())));
    }
}
