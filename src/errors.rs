//! Error types for the Constellation client.
//!
//! Server-reported protocol errors are a closed set of variants keyed by the
//! numeric code the server sends in replies and close frames. Client-side
//! failures (transport, parsing, timeouts, cancellation) live on
//! [`ClientError`].

use thiserror::Error;
use tokio_tungstenite::tungstenite::Error as WsError;

/// A protocol error reported by the Constellation server.
///
/// Codes arrive either in a reply's `error` payload or as the close code of
/// an unexpected disconnect. Unknown codes map to [`ServerError::Other`].
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ServerError {
    /// 4000: the payload could not be handled by the server.
    #[error("invalid payload (4000): {0}")]
    InvalidPayload(String),

    /// 4001: a compressed payload could not be decompressed.
    #[error("payload decompression failed (4001): {0}")]
    PayloadDecompression(String),

    /// 4002: the frame's `type` was not recognized.
    #[error("unknown frame type (4002): {0}")]
    UnknownFrameType(String),

    /// 4003: the called method does not exist.
    #[error("unknown method (4003): {0}")]
    UnknownMethod(String),

    /// 4004: the method was called with invalid arguments.
    #[error("invalid method arguments (4004): {0}")]
    InvalidArguments(String),

    /// 4005: the session's credentials are no longer valid.
    #[error("session expired (4005): {0}")]
    SessionExpired(String),

    /// 4106: the requested live event does not exist.
    #[error("unknown live event (4106): {0}")]
    UnknownEvent(String),

    /// 4107: the session is not allowed to access the live event.
    #[error("live event access denied (4107): {0}")]
    AccessDenied(String),

    /// 4108: the session is already subscribed to the live event.
    #[error("already subscribed (4108): {0}")]
    AlreadySubscribed(String),

    /// 4109: the session is not subscribed to the live event.
    #[error("not subscribed (4109): {0}")]
    NotSubscribed(String),

    /// Any code without a dedicated variant.
    #[error("server error ({code}): {message}")]
    Other { code: u16, message: String },
}

impl ServerError {
    /// Maps a numeric protocol code and message to the matching variant.
    pub fn from_code(code: u16, message: impl Into<String>) -> Self {
        let message = message.into();
        match code {
            4000 => Self::InvalidPayload(message),
            4001 => Self::PayloadDecompression(message),
            4002 => Self::UnknownFrameType(message),
            4003 => Self::UnknownMethod(message),
            4004 => Self::InvalidArguments(message),
            4005 => Self::SessionExpired(message),
            4106 => Self::UnknownEvent(message),
            4107 => Self::AccessDenied(message),
            4108 => Self::AlreadySubscribed(message),
            4109 => Self::NotSubscribed(message),
            code => Self::Other { code, message },
        }
    }

    /// Returns the numeric protocol code for this error.
    pub fn code(&self) -> u16 {
        match self {
            Self::InvalidPayload(_) => 4000,
            Self::PayloadDecompression(_) => 4001,
            Self::UnknownFrameType(_) => 4002,
            Self::UnknownMethod(_) => 4003,
            Self::InvalidArguments(_) => 4004,
            Self::SessionExpired(_) => 4005,
            Self::UnknownEvent(_) => 4106,
            Self::AccessDenied(_) => 4107,
            Self::AlreadySubscribed(_) => 4108,
            Self::NotSubscribed(_) => 4109,
            Self::Other { code, .. } => *code,
        }
    }

    /// Whether an unexpected close carrying this error should trigger an
    /// automatic reconnect. Expired sessions and revoked access cannot be
    /// repaired by retrying.
    pub fn should_reconnect(&self) -> bool {
        !matches!(self, Self::SessionExpired(_) | Self::AccessDenied(_))
    }
}

/// Errors produced by the socket layer and surfaced to callers.
#[derive(Debug, Error)]
pub enum ClientError {
    /// Invalid configuration, rejected before any socket is opened.
    #[error("configuration error: {0}")]
    Config(String),

    /// Websocket transport error.
    #[error("websocket error: {0}")]
    WebSocket(#[from] WsError),

    /// An inbound frame was not valid JSON or not a recognized shape.
    #[error("malformed message: {0}")]
    MessageParse(String),

    /// Error reported by the server, mapped through the protocol taxonomy.
    #[error(transparent)]
    Server(#[from] ServerError),

    /// No reply arrived within the call's timeout.
    #[error("timed out waiting for a reply to {method:?}")]
    ReplyTimeout {
        /// Method name of the timed-out call.
        method: String,
    },

    /// The connection closed before a reply was received.
    #[error("call was cancelled before a reply was received")]
    Cancelled,

    /// The socket worker is gone and can no longer accept commands.
    #[error("socket worker has shut down")]
    WorkerGone,
}

impl ClientError {
    /// Whether this is the cancellation outcome, which subscription re-sync
    /// treats as an expected race rather than a reportable failure.
    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled)
    }
}

#[cfg(test)]
mod tests {
    use super::ServerError;

    #[test]
    fn maps_known_codes_to_dedicated_variants() {
        let cases: [(u16, fn(&ServerError) -> bool); 10] = [
            (4000, |e| matches!(e, ServerError::InvalidPayload(_))),
            (4001, |e| matches!(e, ServerError::PayloadDecompression(_))),
            (4002, |e| matches!(e, ServerError::UnknownFrameType(_))),
            (4003, |e| matches!(e, ServerError::UnknownMethod(_))),
            (4004, |e| matches!(e, ServerError::InvalidArguments(_))),
            (4005, |e| matches!(e, ServerError::SessionExpired(_))),
            (4106, |e| matches!(e, ServerError::UnknownEvent(_))),
            (4107, |e| matches!(e, ServerError::AccessDenied(_))),
            (4108, |e| matches!(e, ServerError::AlreadySubscribed(_))),
            (4109, |e| matches!(e, ServerError::NotSubscribed(_))),
        ];

        for (code, matches_variant) in cases {
            let err = ServerError::from_code(code, "boom");
            assert!(matches_variant(&err), "wrong variant for code {code}");
            assert_eq!(err.code(), code);
        }
    }

    #[test]
    fn unknown_codes_fall_back_to_other() {
        let err = ServerError::from_code(1006, "abnormal closure");
        assert_eq!(
            err,
            ServerError::Other {
                code: 1006,
                message: "abnormal closure".to_string()
            }
        );
        assert_eq!(err.code(), 1006);
    }

    #[test]
    fn expired_sessions_and_denied_access_do_not_reconnect() {
        assert!(!ServerError::from_code(4005, "expired").should_reconnect());
        assert!(!ServerError::from_code(4107, "denied").should_reconnect());
    }

    #[test]
    fn transient_codes_reconnect() {
        assert!(ServerError::from_code(4000, "bad payload").should_reconnect());
        assert!(ServerError::from_code(4109, "not subscribed").should_reconnect());
        assert!(ServerError::from_code(1006, "dropped").should_reconnect());
    }

    #[test]
    fn display_carries_code_and_message() {
        let err = ServerError::from_code(4109, "not subscribed to user:1:update");
        let text = err.to_string();
        assert!(text.contains("4109"));
        assert!(text.contains("user:1:update"));
    }
}
