//! Frame codec abstraction for RPC messages.
//!
//! A [`FrameCodec`] turns a [`Message`] into the bytes of a single transport
//! frame and back. The default [`JsonCodec`] writes a JSON object per frame,
//! which keeps the wire format human-readable for debugging.

use crate::message::Message;

/// Errors that can occur while encoding or decoding a frame.
#[derive(Debug, thiserror::Error)]
pub enum SerializationError {
    #[error("JSON serialization error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Invalid data format: {0}")]
    InvalidFormat(String),

    #[error("frame of {size} bytes exceeds limit of {limit}")]
    FrameTooLarge { size: usize, limit: usize },
}

/// Rejects a frame longer than `limit` before it is handed to a transport.
pub(crate) fn ensure_frame_fits(frame: &[u8], limit: usize) -> Result<(), SerializationError> {
    if frame.len() > limit {
        return Err(SerializationError::FrameTooLarge {
            size: frame.len(),
            limit,
        });
    }
    Ok(())
}

/// Encodes and decodes whole messages to and from transport frames.
///
/// Implementations must be lossless: `decode(encode(m)) == m` for every
/// valid message.
pub trait FrameCodec: Send + Sync {
    /// Serialize a message into a single frame.
    fn encode(&self, message: &Message) -> Result<Vec<u8>, SerializationError>;

    /// Deserialize a single frame into a message.
    fn decode(&self, frame: &[u8]) -> Result<Message, SerializationError>;

    /// Get format name for debugging.
    fn format_name(&self) -> &'static str;
}

/// JSON frame codec.
#[derive(Debug, Clone, Copy, Default)]
pub struct JsonCodec;

impl JsonCodec {
    pub fn new() -> Self {
        Self
    }
}

impl FrameCodec for JsonCodec {
    fn encode(&self, message: &Message) -> Result<Vec<u8>, SerializationError> {
        message.validate()?;
        serde_json::to_vec(message).map_err(SerializationError::Json)
    }

    fn decode(&self, frame: &[u8]) -> Result<Message, SerializationError> {
        let message: Message = serde_json::from_slice(frame)?;
        message.validate()?;
        Ok(message)
    }

    fn format_name(&self) -> &'static str {
        "JSON"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::{to_params, ErrorKind};
    use serde_json::json;

    #[test]
    fn test_json_codec_round_trip() {
        let codec = JsonCodec::new();
        let message = Message::request(
            "update_entity",
            to_params(json!({
                "networkEntityId": 42,
                "componentData": {
                    "position": { "x": 1.5, "y": -0.25, "z": 1e-7 },
                    "alive": true,
                    "name": "crate"
                }
            })),
            "17",
        );

        let frame = codec.encode(&message).unwrap();
        let decoded = codec.decode(&frame).unwrap();
        assert_eq!(decoded, message);
    }

    #[test]
    fn test_error_response_round_trip() {
        let codec = JsonCodec::new();
        let request = Message::request("missing", Default::default(), "3");
        let response = request.error_reply(ErrorKind::MethodNotFound, "no handler");

        let decoded = codec.decode(&codec.encode(&response).unwrap()).unwrap();
        assert_eq!(decoded.error_kind(), Some(ErrorKind::MethodNotFound));
        assert_eq!(decoded, response);
    }

    #[test]
    fn test_decode_rejects_garbage() {
        let codec = JsonCodec::new();
        assert!(matches!(
            codec.decode(b"not json at all"),
            Err(SerializationError::Json(_))
        ));
        assert!(matches!(
            codec.decode(b"[1, 2, 3]"),
            Err(SerializationError::Json(_))
        ));
    }

    #[test]
    fn test_decode_rejects_empty_method() {
        let codec = JsonCodec::new();
        let frame = br#"{"method":"","params":{},"correlationId":"1"}"#;
        assert!(matches!(
            codec.decode(frame),
            Err(SerializationError::InvalidFormat(_))
        ));
    }

    #[test]
    fn test_encode_rejects_empty_method() {
        let codec = JsonCodec::new();
        let message = Message::request("", Default::default(), "1");
        assert!(codec.encode(&message).is_err());
    }
}
