//! Frame encoding for binary (CBOR) and text (JSON) transports.

use crate::error::{ProtocolError, ProtocolResult};
use bytes::Bytes;
use serde::de::DeserializeOwned;
use serde::Serialize;

/// Encoding used for outbound frames.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WireFormat {
    /// CBOR in binary frames.
    #[default]
    Binary,
    /// JSON in text frames.
    Text,
}

/// A message as it crosses the transport, before interpretation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RawMessage {
    /// Binary frame carrying CBOR.
    Binary(Bytes),
    /// Text frame carrying JSON.
    Text(String),
}

impl RawMessage {
    /// Returns the wire format of this message.
    pub fn format(&self) -> WireFormat {
        match self {
            RawMessage::Binary(_) => WireFormat::Binary,
            RawMessage::Text(_) => WireFormat::Text,
        }
    }

    /// Size of the message body in bytes.
    pub fn len(&self) -> usize {
        match self {
            RawMessage::Binary(bytes) => bytes.len(),
            RawMessage::Text(text) => text.len(),
        }
    }

    /// Returns true if the body is empty.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl From<Vec<u8>> for RawMessage {
    fn from(bytes: Vec<u8>) -> Self {
        RawMessage::Binary(Bytes::from(bytes))
    }
}

impl From<String> for RawMessage {
    fn from(text: String) -> Self {
        RawMessage::Text(text)
    }
}

pub(crate) fn encode<T: Serialize>(value: &T, format: WireFormat) -> ProtocolResult<RawMessage> {
    match format {
        WireFormat::Binary => {
            let mut buf = Vec::new();
            ciborium::ser::into_writer(value, &mut buf)
                .map_err(|e| ProtocolError::encoding_failed(e.to_string()))?;
            Ok(RawMessage::Binary(Bytes::from(buf)))
        }
        WireFormat::Text => serde_json::to_string(value)
            .map(RawMessage::Text)
            .map_err(|e| ProtocolError::encoding_failed(e.to_string())),
    }
}

pub(crate) fn decode<T: DeserializeOwned>(raw: &RawMessage) -> ProtocolResult<T> {
    if raw.is_empty() {
        return Err(ProtocolError::decoding_failed("empty frame"));
    }
    match raw {
        RawMessage::Binary(bytes) => ciborium::de::from_reader(bytes.as_ref())
            .map_err(|e| ProtocolError::decoding_failed(e.to_string())),
        RawMessage::Text(text) => serde_json::from_str(text)
            .map_err(|e| ProtocolError::decoding_failed(e.to_string())),
    }
}
