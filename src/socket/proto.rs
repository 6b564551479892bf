//! Wire frame types for the Constellation protocol.

use std::sync::atomic::{AtomicU64, Ordering};

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::errors::ClientError;

static CALL_SEQ: AtomicU64 = AtomicU64::new(0);

/// Returns the next call id. Ids are unique for the process lifetime and
/// shared across sockets.
pub(crate) fn next_call_id() -> u64 {
    CALL_SEQ.fetch_add(1, Ordering::Relaxed)
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum Frame {
    Method {
        id: u64,
        method: String,
        params: Option<Value>,
    },
    Event {
        event: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        data: Option<Value>,
    },
    Reply {
        id: u64,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        error: Option<ReplyError>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        result: Option<Value>,
    },
}

/// Error payload carried inside a reply frame.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ReplyError {
    pub code: u16,
    pub message: String,
}

/// Payload of a `live` event: the topic slug and its update.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct LiveEventData {
    pub channel: String,
    pub payload: Value,
}

impl Frame {
    pub fn to_text(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }
}

/// Parses an inbound frame, distinguishing invalid JSON from structurally
/// valid frames with an unrecognized or malformed `type`.
pub fn parse_frame(text: &str) -> Result<Frame, ClientError> {
    match serde_json::from_str::<Frame>(text) {
        Ok(frame) => Ok(frame),
        Err(_) => {
            let value: Value = serde_json::from_str(text)
                .map_err(|err| ClientError::MessageParse(format!("not valid JSON: {err}")))?;
            match value.get("type").and_then(Value::as_str) {
                Some(kind) => Err(ClientError::MessageParse(format!(
                    "unrecognized or malformed frame of type {kind:?}"
                ))),
                None => Err(ClientError::MessageParse(
                    "frame is missing a \"type\" field".to_string(),
                )),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use serde_json::{json, Value};

    use super::{parse_frame, Frame, LiveEventData, ReplyError};
    use crate::errors::ClientError;

    #[test]
    fn method_frames_serialize_with_explicit_null_params() {
        let frame = Frame::Method {
            id: 3,
            method: "ping".to_string(),
            params: None,
        };
        let encoded: Value = serde_json::from_str(&frame.to_text().expect("encode")).expect("json");
        assert_eq!(
            encoded,
            json!({"type": "method", "id": 3, "method": "ping", "params": null})
        );
    }

    #[test]
    fn call_ids_increase_monotonically() {
        let first = super::next_call_id();
        let second = super::next_call_id();
        assert!(second > first);
    }

    #[test]
    fn parses_hello_event_without_data() {
        let frame = parse_frame(r#"{"type":"event","event":"hello"}"#).expect("parse");
        assert_eq!(
            frame,
            Frame::Event {
                event: "hello".to_string(),
                data: None,
            }
        );
    }

    #[test]
    fn parses_live_event_payload() {
        let frame = parse_frame(
            r#"{"type":"event","event":"live","data":{"channel":"user:1:update","payload":{"x":1}}}"#,
        )
        .expect("parse");
        let data = match frame {
            Frame::Event { data: Some(d), .. } => d,
            other => panic!("unexpected frame {other:?}"),
        };
        let live: LiveEventData = serde_json::from_value(data).expect("live data");
        assert_eq!(live.channel, "user:1:update");
        assert_eq!(live.payload, json!({"x": 1}));
    }

    #[test]
    fn parses_reply_with_error_payload() {
        let frame =
            parse_frame(r#"{"type":"reply","id":7,"error":{"code":4109,"message":"not subscribed"}}"#)
                .expect("parse");
        assert_eq!(
            frame,
            Frame::Reply {
                id: 7,
                error: Some(ReplyError {
                    code: 4109,
                    message: "not subscribed".to_string(),
                }),
                result: None,
            }
        );
    }

    #[test]
    fn unknown_frame_type_is_a_parse_error() {
        let err = parse_frame(r#"{"type":"gossip","data":1}"#).expect_err("must fail");
        match err {
            ClientError::MessageParse(msg) => assert!(msg.contains("gossip")),
            other => panic!("unexpected error {other:?}"),
        }
    }

    #[test]
    fn invalid_json_is_a_parse_error() {
        let err = parse_frame("{nope").expect_err("must fail");
        assert!(matches!(err, ClientError::MessageParse(_)));
    }
}
