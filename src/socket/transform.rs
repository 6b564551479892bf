//! Payload transforms applied between frame serialization and the wire.
//!
//! Outgoing frames may be gzip-compressed based on a pluggable detector;
//! inbound binary payloads are decompressed before parsing.

use std::io::Read;

use flate2::read::{GzDecoder, GzEncoder};
use flate2::Compression;

use crate::errors::{ClientError, ServerError};
use crate::socket::proto::Frame;

/// A payload as it travels over the websocket.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WirePayload {
    /// Plain text frame.
    Text(String),
    /// Binary frame carrying a compressed payload.
    Binary(Vec<u8>),
}

/// Decides whether an outgoing frame should be compressed.
pub trait CompressDetector: Send + Sync {
    /// `encoded` is the serialized frame; `frame` the structured original.
    fn should_compress(&self, encoded: &str, frame: &Frame) -> bool;
}

/// Compresses every frame longer than a byte threshold.
#[derive(Clone, Copy, Debug)]
pub struct SizeThresholdDetector {
    threshold: usize,
}

impl SizeThresholdDetector {
    pub fn new(threshold: usize) -> Self {
        Self { threshold }
    }
}

impl Default for SizeThresholdDetector {
    fn default() -> Self {
        Self::new(crate::socket::SocketDefaults::COMPRESS_THRESHOLD)
    }
}

impl CompressDetector for SizeThresholdDetector {
    fn should_compress(&self, encoded: &str, _frame: &Frame) -> bool {
        encoded.len() > self.threshold
    }
}

/// Converts frames to and from their wire representation.
pub trait PayloadTransform: Send + Sync {
    /// Transforms an outgoing serialized frame.
    fn outgoing(&self, encoded: String, frame: &Frame) -> Result<WirePayload, ClientError>;

    /// Transforms an inbound payload back into frame text.
    fn incoming(&self, payload: WirePayload) -> Result<String, ClientError>;
}

/// Gzip transform: compresses outbound frames the detector selects and
/// decompresses any inbound binary payload.
pub struct GzipTransform {
    detector: Box<dyn CompressDetector>,
}

impl GzipTransform {
    pub fn new(detector: Box<dyn CompressDetector>) -> Self {
        Self { detector }
    }
}

impl Default for GzipTransform {
    fn default() -> Self {
        Self::new(Box::new(SizeThresholdDetector::default()))
    }
}

impl PayloadTransform for GzipTransform {
    fn outgoing(&self, encoded: String, frame: &Frame) -> Result<WirePayload, ClientError> {
        if !self.detector.should_compress(&encoded, frame) {
            return Ok(WirePayload::Text(encoded));
        }

        let mut encoder = GzEncoder::new(encoded.as_bytes(), Compression::default());
        let mut compressed = Vec::new();
        encoder
            .read_to_end(&mut compressed)
            .map_err(|err| ServerError::PayloadDecompression(format!("gzip encode: {err}")))?;
        Ok(WirePayload::Binary(compressed))
    }

    fn incoming(&self, payload: WirePayload) -> Result<String, ClientError> {
        match payload {
            WirePayload::Text(text) => Ok(text),
            WirePayload::Binary(bytes) => {
                let mut decoder = GzDecoder::new(bytes.as_slice());
                let mut decompressed = Vec::new();
                decoder.read_to_end(&mut decompressed).map_err(|err| {
                    ServerError::PayloadDecompression(format!("gzip decode: {err}"))
                })?;
                String::from_utf8(decompressed).map_err(|err| {
                    ServerError::PayloadDecompression(format!("decoded payload: {err}")).into()
                })
            }
        }
    }
}

/// Pass-through transform used when compression is disabled.
#[derive(Clone, Copy, Debug, Default)]
pub struct IdentityTransform;

impl PayloadTransform for IdentityTransform {
    fn outgoing(&self, encoded: String, _frame: &Frame) -> Result<WirePayload, ClientError> {
        Ok(WirePayload::Text(encoded))
    }

    fn incoming(&self, payload: WirePayload) -> Result<String, ClientError> {
        match payload {
            WirePayload::Text(text) => Ok(text),
            WirePayload::Binary(bytes) => String::from_utf8(bytes)
                .map_err(|err| ClientError::MessageParse(format!("binary frame: {err}"))),
        }
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::{
        GzipTransform, IdentityTransform, PayloadTransform, SizeThresholdDetector, WirePayload,
    };
    use crate::errors::{ClientError, ServerError};
    use crate::socket::proto::Frame;

    fn frame_with_padding(padding: usize) -> (Frame, String) {
        let frame = Frame::Method {
            id: 1,
            method: "echo".to_string(),
            params: Some(json!({"pad": "x".repeat(padding)})),
        };
        let encoded = frame.to_text().expect("encode");
        (frame, encoded)
    }

    #[test]
    fn round_trips_when_compression_applies() {
        let transform = GzipTransform::new(Box::new(SizeThresholdDetector::new(16)));
        let (frame, encoded) = frame_with_padding(256);

        let payload = transform.outgoing(encoded.clone(), &frame).expect("outgoing");
        let compressed = match &payload {
            WirePayload::Binary(bytes) => bytes.clone(),
            WirePayload::Text(_) => panic!("expected a compressed binary payload"),
        };
        assert!(compressed.len() < encoded.len());

        let restored = transform.incoming(payload).expect("incoming");
        assert_eq!(restored, encoded);
    }

    #[test]
    fn round_trips_when_compression_is_skipped() {
        let transform = GzipTransform::new(Box::new(SizeThresholdDetector::new(1 << 20)));
        let (frame, encoded) = frame_with_padding(8);

        let payload = transform.outgoing(encoded.clone(), &frame).expect("outgoing");
        assert_eq!(payload, WirePayload::Text(encoded.clone()));
        assert_eq!(transform.incoming(payload).expect("incoming"), encoded);
    }

    #[test]
    fn threshold_compresses_only_strictly_longer_payloads() {
        let detector = SizeThresholdDetector::new(32);
        let transform = GzipTransform::new(Box::new(detector));

        let (frame, encoded) = frame_with_padding(0);
        assert!(encoded.len() > 32);
        assert!(matches!(
            transform.outgoing(encoded, &frame).expect("outgoing"),
            WirePayload::Binary(_)
        ));
    }

    #[test]
    fn malformed_binary_surfaces_as_decompression_error() {
        let transform = GzipTransform::default();
        let err = transform
            .incoming(WirePayload::Binary(vec![0x1f, 0x8b, 0xff, 0x00, 0x12]))
            .expect_err("must fail");
        assert!(matches!(
            err,
            ClientError::Server(ServerError::PayloadDecompression(_))
        ));
    }

    #[test]
    fn identity_passes_text_through_unchanged() {
        let transform = IdentityTransform;
        let (frame, encoded) = frame_with_padding(64);
        let payload = transform.outgoing(encoded.clone(), &frame).expect("outgoing");
        assert_eq!(payload, WirePayload::Text(encoded.clone()));
        assert_eq!(transform.incoming(payload).expect("incoming"), encoded);
    }
}
