//! Envelope builders and a reference model of the final state.

use fleetsync_engine::{Mutation, Prediction, Snapshot};
use fleetsync_protocol::{EntityKind, EntityStatus, Envelope};
use serde_json::{json, Value};
use std::collections::BTreeMap;

/// A deployment upsert with a replica count payload.
pub fn deployment(id: &str, revision: u64, status: EntityStatus) -> Envelope {
    Envelope::upsert(
        EntityKind::Deployment,
        id,
        revision,
        status,
        json!({ "replicas": 3 }),
    )
}

/// An upsert with an empty payload.
pub fn upsert(kind: EntityKind, id: &str, revision: u64, status: EntityStatus) -> Envelope {
    Envelope::upsert(kind, id, revision, status, json!({}))
}

/// A delete envelope.
pub fn delete(kind: EntityKind, id: &str, revision: u64) -> Envelope {
    Envelope::delete(kind, id, revision)
}

/// A `scale` mutation predicting the `scaling` status.
pub fn scale(id: &str, replicas: u64) -> Mutation {
    Mutation::new(
        "scale",
        EntityKind::Deployment,
        id,
        Prediction::Upsert {
            status: EntityStatus::Scaling,
            payload: json!({ "replicas": replicas }),
        },
    )
    .with_payload(json!({ "replicas": replicas }))
}

/// A `delete` mutation predicting removal.
pub fn remove(kind: EntityKind, id: &str) -> Mutation {
    Mutation::new("delete", kind, id, Prediction::Delete)
}

/// The state a client must end up with after receiving a set of changes,
/// regardless of delivery order or duplication: per entity, the change with
/// the highest revision wins, and a winning delete means absent.
#[derive(Debug, Clone, Default)]
pub struct ReferenceModel {
    latest: BTreeMap<(EntityKind, String), Envelope>,
}

impl ReferenceModel {
    /// Creates an empty model.
    pub fn new() -> Self {
        Self::default()
    }

    /// Builds a model from a set of changes.
    pub fn from_changes<'a>(changes: impl IntoIterator<Item = &'a Envelope>) -> Self {
        let mut model = Self::new();
        for envelope in changes {
            model.apply(envelope);
        }
        model
    }

    /// Records one change.
    pub fn apply(&mut self, envelope: &Envelope) {
        let key = (envelope.kind, envelope.entity_id.clone());
        match self.latest.get(&key) {
            Some(current) if current.revision >= envelope.revision => {}
            _ => {
                self.latest.insert(key, envelope.clone());
            }
        }
    }

    /// Live entities of `kind` by id, as `(revision, status, payload)`.
    pub fn live(&self, kind: EntityKind) -> BTreeMap<String, (u64, EntityStatus, Value)> {
        self.latest
            .iter()
            .filter(|((k, _), envelope)| *k == kind && !envelope.is_delete())
            .map(|((_, id), envelope)| {
                (
                    id.clone(),
                    (envelope.revision, envelope.status, envelope.payload.clone()),
                )
            })
            .collect()
    }

    /// Highest revision seen for `kind`, deletes included.
    pub fn high_water(&self, kind: EntityKind) -> u64 {
        self.latest
            .iter()
            .filter(|((k, _), _)| *k == kind)
            .map(|(_, envelope)| envelope.revision)
            .max()
            .unwrap_or(0)
    }
}

/// Confirmed content of a snapshot in the shape of [`ReferenceModel::live`].
pub fn snapshot_state(snapshot: &Snapshot) -> BTreeMap<String, (u64, EntityStatus, Value)> {
    snapshot
        .entities
        .iter()
        .map(|(id, view)| {
            (
                id.clone(),
                (
                    view.entity.revision,
                    view.entity.status,
                    view.entity.payload.clone(),
                ),
            )
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn highest_revision_wins() {
        let changes = vec![
            deployment("d1", 3, EntityStatus::Healthy),
            deployment("d1", 2, EntityStatus::Error),
            deployment("d2", 1, EntityStatus::Pending),
            delete(EntityKind::Deployment, "d2", 4),
            upsert(EntityKind::Deployment, "d2", 4, EntityStatus::Healthy),
        ];
        let model = ReferenceModel::from_changes(&changes);
        let live = model.live(EntityKind::Deployment);

        assert_eq!(live.len(), 1);
        assert_eq!(live["d1"].0, 3);
        assert_eq!(live["d1"].1, EntityStatus::Healthy);
        assert_eq!(model.high_water(EntityKind::Deployment), 4);
        assert_eq!(model.high_water(EntityKind::Cluster), 0);
    }

    #[test]
    fn mutation_builders() {
        let mutation = scale("d1", 5);
        assert_eq!(mutation.action_type, "scale");
        assert!(matches!(mutation.prediction, Prediction::Upsert { status: EntityStatus::Scaling, .. }));
        assert!(matches!(remove(EntityKind::Cluster, "c").prediction, Prediction::Delete));
    }
}
