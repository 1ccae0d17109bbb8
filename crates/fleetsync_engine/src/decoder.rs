//! Event decoder: raw transport messages to typed frames.

use crate::error::SyncResult;
use fleetsync_protocol::{RawMessage, ServerFrame};
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::warn;

/// Decodes inbound messages.
///
/// Decoding is a pure transformation. Malformed messages are logged and
/// dropped by [`decode_or_drop`](EventDecoder::decode_or_drop) so a bad
/// frame never halts the stream.
#[derive(Debug, Default)]
pub struct EventDecoder {
    decoded: AtomicU64,
    dropped: AtomicU64,
}

impl EventDecoder {
    /// Creates a decoder.
    pub fn new() -> Self {
        Self::default()
    }

    /// Decodes and validates one message.
    pub fn decode(&self, raw: &RawMessage) -> SyncResult<ServerFrame> {
        let frame = ServerFrame::decode(raw)?;
        match &frame {
            ServerFrame::Event(envelope) => envelope.validate()?,
            ServerFrame::ResyncBatch(batch) => {
                for envelope in &batch.envelopes {
                    envelope.validate()?;
                    if envelope.kind != batch.kind {
                        return Err(fleetsync_protocol::ProtocolError::invalid_envelope(
                            format!(
                                "{} envelope {} in {} resync batch",
                                envelope.kind, envelope.entity_id, batch.kind
                            ),
                        )
                        .into());
                    }
                }
            }
            _ => {}
        }
        Ok(frame)
    }

    /// Decodes a message, logging and counting failures instead of returning them.
    pub fn decode_or_drop(&self, raw: &RawMessage) -> Option<ServerFrame> {
        match self.decode(raw) {
            Ok(frame) => {
                self.decoded.fetch_add(1, Ordering::Relaxed);
                Some(frame)
            }
            Err(error) => {
                self.dropped.fetch_add(1, Ordering::Relaxed);
                warn!(%error, bytes = raw.len(), "dropping undecodable message");
                None
            }
        }
    }

    /// Messages decoded so far.
    pub fn decoded(&self) -> u64 {
        self.decoded.load(Ordering::Relaxed)
    }

    /// Messages dropped so far.
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::SyncError;
    use fleetsync_protocol::{EntityKind, EntityStatus, Envelope, ResyncBatch, WireFormat};
    use serde_json::json;

    #[test]
    fn decodes_binary_event() {
        let decoder = EventDecoder::new();
        let frame = ServerFrame::Event(Envelope::upsert(
            EntityKind::Deployment,
            "deployment-42",
            3,
            EntityStatus::Healthy,
            json!({}),
        ));
        let raw = frame.encode(WireFormat::Binary).unwrap();
        assert_eq!(decoder.decode_or_drop(&raw), Some(frame));
        assert_eq!(decoder.decoded(), 1);
        assert_eq!(decoder.dropped(), 0);
    }

    #[test]
    fn malformed_message_is_dropped_and_counted() {
        let decoder = EventDecoder::new();
        assert!(decoder
            .decode_or_drop(&RawMessage::Text("{not json".into()))
            .is_none());
        assert_eq!(decoder.dropped(), 1);
    }

    #[test]
    fn invalid_envelope_is_a_decode_error() {
        let decoder = EventDecoder::new();
        let raw = RawMessage::Text(
            r#"{"type":"event","kind":"cluster","entity_id":"","revision":1,"operation":"delete"}"#
                .into(),
        );
        assert!(matches!(decoder.decode(&raw), Err(SyncError::Decode(_))));
    }

    #[test]
    fn resync_batch_with_foreign_kind_is_rejected() {
        let decoder = EventDecoder::new();
        let frame = ServerFrame::ResyncBatch(ResyncBatch::new(
            EntityKind::Deployment,
            0,
            vec![Envelope::delete(EntityKind::Cluster, "eu-west", 3)],
        ));
        let raw = frame.encode(WireFormat::Text).unwrap();
        assert!(decoder.decode(&raw).is_err());
    }

    #[test]
    fn stream_continues_after_bad_frame() {
        let decoder = EventDecoder::new();
        let good = ServerFrame::Pong { nonce: 1 }.encode(WireFormat::Text).unwrap();
        let frames: Vec<_> = [
            good.clone(),
            RawMessage::Binary(vec![0xff, 0x00].into()),
            good,
        ]
        .iter()
        .filter_map(|raw| decoder.decode_or_drop(raw))
        .collect();
        assert_eq!(frames.len(), 2);
        assert_eq!(decoder.dropped(), 1);
    }
}
