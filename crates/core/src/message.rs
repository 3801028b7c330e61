//! The unit of work flowing through the pipeline.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;

/// Errors raised while constructing or decoding an [`IngestionMessage`].
#[derive(Debug, Error)]
pub enum MessageError {
    #[error("source must be a non-empty string")]
    EmptySource,

    #[error("payload decode error: {0}")]
    Decode(#[from] serde_json::Error),
}

/// One accepted ingestion request, as it travels over the queue.
///
/// The wire body is the JSON serialization of exactly these three fields.
/// Nothing is added or dropped between publish and delivery, so the consumer
/// sees a mapping equivalent to what the API accepted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IngestionMessage {
    /// Arbitrary JSON object supplied by the caller.
    pub data: Map<String, Value>,

    /// Origin identifier. Never empty.
    pub source: String,

    /// Caller-supplied timestamp string. ISO-8601 recommended, not enforced.
    pub timestamp: String,
}

impl IngestionMessage {
    /// Build a message, rejecting an empty `source`.
    pub fn new(
        data: Map<String, Value>,
        source: impl Into<String>,
        timestamp: impl Into<String>,
    ) -> Result<Self, MessageError> {
        let source = source.into();
        if source.is_empty() {
            return Err(MessageError::EmptySource);
        }
        Ok(Self {
            data,
            source,
            timestamp: timestamp.into(),
        })
    }

    /// Serialize to the JSON byte payload published to the queue.
    pub fn to_bytes(&self) -> Result<Vec<u8>, serde_json::Error> {
        serde_json::to_vec(self)
    }

    /// Deserialize a delivered payload back into a message.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, MessageError> {
        Ok(serde_json::from_slice(bytes)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn sample() -> IngestionMessage {
        let mut data = Map::new();
        data.insert("x".to_string(), json!(1));
        data.insert("nested".to_string(), json!({"a": [1, 2, 3], "b": null}));
        IngestionMessage::new(data, "test", "2024-01-01T00:00:00Z").unwrap()
    }

    #[test]
    fn roundtrip_preserves_mapping() {
        let msg = sample();
        let bytes = msg.to_bytes().unwrap();
        let decoded = IngestionMessage::from_bytes(&bytes).unwrap();
        assert_eq!(decoded, msg);
    }

    #[test]
    fn decodes_regardless_of_key_order() {
        let body = br#"{"timestamp":"2024-01-01T00:00:00Z","source":"test","data":{"x":1}}"#;
        let decoded = IngestionMessage::from_bytes(body).unwrap();
        assert_eq!(decoded.source, "test");
        assert_eq!(decoded.data.get("x"), Some(&json!(1)));
    }

    #[test]
    fn empty_source_rejected() {
        let err = IngestionMessage::new(Map::new(), "", "now").unwrap_err();
        assert!(matches!(err, MessageError::EmptySource));
    }

    #[test]
    fn malformed_payload_rejected() {
        let err = IngestionMessage::from_bytes(b"not json").unwrap_err();
        assert!(matches!(err, MessageError::Decode(_)));
    }

    #[test]
    fn missing_field_rejected() {
        let err = IngestionMessage::from_bytes(br#"{"data":{}}"#).unwrap_err();
        assert!(matches!(err, MessageError::Decode(_)));
    }
}
