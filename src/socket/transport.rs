//! Transport seam between the connection worker and the websocket.
//!
//! The worker talks to a [`Transport`] trait object produced by a
//! [`TransportFactory`], so tests can inject a fake transport instead of
//! overriding a process-wide socket implementation.

use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::header::{HeaderName, HeaderValue, SEC_WEBSOCKET_PROTOCOL};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};

use crate::errors::ClientError;
use crate::socket::transform::WirePayload;

/// Prepared connection parameters handed to the factory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectRequest {
    /// Full endpoint URL including any query string.
    pub url: String,
    /// Negotiated subprotocol token.
    pub subprotocol: String,
    /// Additional request headers.
    pub headers: Vec<(String, String)>,
}

/// Event produced by polling a transport.
#[derive(Debug, Clone)]
pub enum TransportEvent {
    /// An inbound data payload.
    Message(WirePayload),
    /// The socket closed; transport errors and stream exhaustion map to an
    /// abnormal-closure code.
    Closed { code: u16, reason: String },
}

/// One established socket connection, exclusively owned by the worker.
#[async_trait]
pub trait Transport: Send {
    async fn send(&mut self, payload: WirePayload) -> Result<(), ClientError>;

    /// Waits for the next inbound event. After `Closed` is returned the
    /// transport must not be polled again.
    async fn next_event(&mut self) -> TransportEvent;

    /// Requests a graceful close; the eventual `Closed` event still arrives
    /// through `next_event`.
    async fn close(&mut self);
}

/// Opens transports for connection attempts.
#[async_trait]
pub trait TransportFactory: Send + Sync {
    async fn connect(&self, request: ConnectRequest) -> Result<Box<dyn Transport>, ClientError>;
}

/// Default factory connecting with tokio-tungstenite over TCP or TLS.
#[derive(Clone, Copy, Debug, Default)]
pub struct WsConnector;

pub(crate) fn build_http_request(
    request: &ConnectRequest,
) -> Result<tokio_tungstenite::tungstenite::handshake::client::Request, ClientError> {
    let mut http_request = request.url.as_str().into_client_request()?;
    let headers = http_request.headers_mut();

    let protocol: HeaderValue = request
        .subprotocol
        .parse()
        .map_err(|err| ClientError::Config(format!("invalid subprotocol: {err}")))?;
    headers.insert(SEC_WEBSOCKET_PROTOCOL, protocol);

    for (name, value) in &request.headers {
        let name: HeaderName = name
            .parse()
            .map_err(|err| ClientError::Config(format!("invalid header name {name:?}: {err}")))?;
        let value: HeaderValue = value
            .parse()
            .map_err(|err| ClientError::Config(format!("invalid value for header {name}: {err}")))?;
        headers.insert(name, value);
    }

    Ok(http_request)
}

#[async_trait]
impl TransportFactory for WsConnector {
    async fn connect(&self, request: ConnectRequest) -> Result<Box<dyn Transport>, ClientError> {
        let http_request = build_http_request(&request)?;
        let (socket, _) = connect_async(http_request).await?;
        Ok(Box::new(WsTransport { socket }))
    }
}

struct WsTransport {
    socket: WebSocketStream<MaybeTlsStream<TcpStream>>,
}

#[async_trait]
impl Transport for WsTransport {
    async fn send(&mut self, payload: WirePayload) -> Result<(), ClientError> {
        let message = match payload {
            WirePayload::Text(text) => Message::Text(text),
            WirePayload::Binary(bytes) => Message::Binary(bytes),
        };
        self.socket.send(message).await.map_err(ClientError::from)
    }

    async fn next_event(&mut self) -> TransportEvent {
        loop {
            match self.socket.next().await {
                Some(Ok(Message::Text(text))) => {
                    return TransportEvent::Message(WirePayload::Text(text));
                }
                Some(Ok(Message::Binary(bytes))) => {
                    return TransportEvent::Message(WirePayload::Binary(bytes));
                }
                Some(Ok(Message::Ping(payload))) => {
                    let _ = self.socket.send(Message::Pong(payload)).await;
                }
                Some(Ok(Message::Pong(_))) => {}
                Some(Ok(Message::Close(frame))) => {
                    let (code, reason) = frame
                        .map(|f| (u16::from(f.code), f.reason.into_owned()))
                        .unwrap_or((1005, String::new()));
                    return TransportEvent::Closed { code, reason };
                }
                Some(Ok(_)) => {}
                Some(Err(err)) => {
                    return TransportEvent::Closed {
                        code: 1006,
                        reason: err.to_string(),
                    };
                }
                None => {
                    return TransportEvent::Closed {
                        code: 1006,
                        reason: "socket stream ended".to_string(),
                    };
                }
            }
        }
    }

    async fn close(&mut self) {
        let _ = self.socket.close(None).await;
    }
}
