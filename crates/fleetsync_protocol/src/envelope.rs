//! Entity change envelopes.

use crate::correlation::CorrelationId;
use crate::error::{ProtocolError, ProtocolResult};
use crate::kind::{EntityKind, EntityStatus};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Type of change carried by an envelope.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Operation {
    /// Entity was created or updated.
    Upsert,
    /// Entity was deleted.
    Delete,
}

/// A single entity change pushed by the backend.
///
/// `Envelope` is the unit the state store consumes: it names the entity
/// (`kind` + `entity_id`), orders the change (`revision`) and carries the new
/// state. The payload is opaque to the engine.
///
/// # Fields
///
/// - `revision`: monotonic per entity; revision 0 is reserved for
///   "nothing seen yet" and never appears on the wire
/// - `status`: lifecycle status, ignored for deletes
/// - `correlation_id`: echoed when the change answers a client mutation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    /// Entity kind.
    pub kind: EntityKind,
    /// Entity id, unique within the kind.
    pub entity_id: String,
    /// Revision of the entity after this change.
    pub revision: u64,
    /// Upsert or delete.
    pub operation: Operation,
    /// Reported status.
    #[serde(default)]
    pub status: EntityStatus,
    /// Opaque entity payload.
    #[serde(default)]
    pub payload: Value,
    /// Correlation id of the client mutation that caused this change.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub correlation_id: Option<CorrelationId>,
}

impl Envelope {
    /// Creates an upsert envelope.
    pub fn upsert(
        kind: EntityKind,
        entity_id: impl Into<String>,
        revision: u64,
        status: EntityStatus,
        payload: Value,
    ) -> Self {
        Self {
            kind,
            entity_id: entity_id.into(),
            revision,
            operation: Operation::Upsert,
            status,
            payload,
            correlation_id: None,
        }
    }

    /// Creates a delete envelope.
    pub fn delete(kind: EntityKind, entity_id: impl Into<String>, revision: u64) -> Self {
        Self {
            kind,
            entity_id: entity_id.into(),
            revision,
            operation: Operation::Delete,
            status: EntityStatus::Deleting,
            payload: Value::Null,
            correlation_id: None,
        }
    }

    /// Attaches a correlation id.
    pub fn with_correlation(mut self, correlation_id: CorrelationId) -> Self {
        self.correlation_id = Some(correlation_id);
        self
    }

    /// Returns true if this envelope deletes its entity.
    pub fn is_delete(&self) -> bool {
        self.operation == Operation::Delete
    }

    /// Checks the structural rules a decoded envelope must satisfy.
    pub fn validate(&self) -> ProtocolResult<()> {
        if self.entity_id.is_empty() {
            return Err(ProtocolError::invalid_envelope("empty entity id"));
        }
        if self.revision == 0 {
            return Err(ProtocolError::invalid_envelope(format!(
                "{} {} has revision 0",
                self.kind, self.entity_id
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn upsert_fields() {
        let env = Envelope::upsert(
            EntityKind::Deployment,
            "deployment-42",
            3,
            EntityStatus::Healthy,
            json!({ "replicas": 3 }),
        );
        assert_eq!(env.operation, Operation::Upsert);
        assert!(!env.is_delete());
        assert!(env.correlation_id.is_none());
        assert!(env.validate().is_ok());
    }

    #[test]
    fn delete_has_null_payload() {
        let env = Envelope::delete(EntityKind::Cluster, "eu-west", 9);
        assert!(env.is_delete());
        assert_eq!(env.payload, Value::Null);
    }

    #[test]
    fn validation_rejects_empty_id_and_zero_revision() {
        let env = Envelope::delete(EntityKind::Cluster, "", 9);
        assert!(matches!(
            env.validate(),
            Err(ProtocolError::InvalidEnvelope { .. })
        ));

        let env = Envelope::delete(EntityKind::Cluster, "eu-west", 0);
        assert!(env.validate().is_err());
    }

    #[test]
    fn missing_optional_fields_default() {
        let env: Envelope = serde_json::from_value(json!({
            "kind": "composition",
            "entity_id": "web-stack",
            "revision": 7,
            "operation": "upsert"
        }))
        .unwrap();
        assert_eq!(env.status, EntityStatus::Unknown);
        assert_eq!(env.payload, Value::Null);
        assert!(env.correlation_id.is_none());
    }

    #[test]
    fn correlation_id_omitted_when_absent() {
        let env = Envelope::delete(EntityKind::Cluster, "eu-west", 2);
        let json = serde_json::to_value(&env).unwrap();
        assert!(json.get("correlation_id").is_none());

        let id = CorrelationId::new();
        let json = serde_json::to_value(env.with_correlation(id)).unwrap();
        assert_eq!(json["correlation_id"], json!(id.to_string()));
    }
}
