//! Property-based test generators using proptest.
//!
//! Histories are generated the way a backend produces them: one revision
//! counter per kind, deletes only of live entities. Deliveries then shuffle
//! and duplicate a history to model an unreliable transport.

use fleetsync_protocol::{EntityKind, EntityStatus, Envelope};
use proptest::prelude::*;
use serde_json::{json, Value};
use std::collections::BTreeSet;

/// Statuses a backend reports.
pub const STATUSES: [EntityStatus; 8] = [
    EntityStatus::Pending,
    EntityStatus::Progressing,
    EntityStatus::Scaling,
    EntityStatus::Syncing,
    EntityStatus::Healthy,
    EntityStatus::Degraded,
    EntityStatus::Error,
    EntityStatus::Deleting,
];

/// Strategy for entity ids drawn from a small pool, so histories touch the
/// same entity repeatedly.
pub fn entity_id_strategy() -> impl Strategy<Value = String> {
    (0u8..6).prop_map(|n| format!("entity-{n}"))
}

/// Strategy for entity kinds.
pub fn kind_strategy() -> impl Strategy<Value = EntityKind> {
    prop::sample::select(EntityKind::ALL.to_vec())
}

/// Strategy for reported statuses.
pub fn status_strategy() -> impl Strategy<Value = EntityStatus> {
    prop::sample::select(STATUSES.to_vec())
}

/// Strategy for small object payloads.
pub fn payload_strategy() -> impl Strategy<Value = Value> {
    (0u32..10, prop::option::of("[a-z]{1,8}")).prop_map(|(replicas, image)| match image {
        Some(image) => json!({ "replicas": replicas, "image": image }),
        None => json!({ "replicas": replicas }),
    })
}

/// A backend-side change before a revision is assigned.
#[derive(Debug, Clone)]
pub enum Change {
    /// Create or update an entity.
    Upsert {
        /// Entity id.
        id: String,
        /// Reported status.
        status: EntityStatus,
        /// Entity payload.
        payload: Value,
    },
    /// Delete an entity; skipped when it is not live.
    Delete {
        /// Entity id.
        id: String,
    },
}

/// Strategy for single changes.
pub fn change_strategy() -> impl Strategy<Value = Change> {
    prop_oneof![
        4 => (entity_id_strategy(), status_strategy(), payload_strategy())
            .prop_map(|(id, status, payload)| Change::Upsert { id, status, payload }),
        1 => entity_id_strategy().prop_map(|id| Change::Delete { id }),
    ]
}

/// Assigns revisions `1..` to `changes`, dropping deletes of entities that
/// are not live at that point.
pub fn assign_revisions(kind: EntityKind, changes: Vec<Change>) -> Vec<Envelope> {
    let mut live = BTreeSet::new();
    let mut revision = 0;
    let mut history = Vec::with_capacity(changes.len());
    for change in changes {
        match change {
            Change::Upsert {
                id,
                status,
                payload,
            } => {
                revision += 1;
                live.insert(id.clone());
                history.push(Envelope::upsert(kind, id, revision, status, payload));
            }
            Change::Delete { id } => {
                if live.remove(&id) {
                    revision += 1;
                    history.push(Envelope::delete(kind, id, revision));
                }
            }
        }
    }
    history
}

/// Strategy for a revision-ordered history of one kind.
pub fn history_strategy(
    kind: EntityKind,
    min_changes: usize,
    max_changes: usize,
) -> impl Strategy<Value = Vec<Envelope>> {
    prop::collection::vec(change_strategy(), min_changes..max_changes)
        .prop_map(move |changes| assign_revisions(kind, changes))
}

/// Strategy for a history together with an adversarial delivery of it:
/// every change at least once, some twice, in any order.
pub fn delivery_strategy(
    kind: EntityKind,
    min_changes: usize,
    max_changes: usize,
) -> impl Strategy<Value = (Vec<Envelope>, Vec<Envelope>)> {
    history_strategy(kind, min_changes.max(1), max_changes.max(2))
        .prop_filter("history must not be empty", |history| !history.is_empty())
        .prop_flat_map(|history| {
            let len = history.len();
            let duplicates = prop::collection::vec(0..len, 0..=len);
            (Just(history), duplicates)
        })
        .prop_flat_map(|(history, duplicates)| {
            let mut delivered = history.clone();
            delivered.extend(duplicates.iter().map(|&i| history[i].clone()));
            (Just(history), Just(delivered).prop_shuffle())
        })
}

/// Strategy for a split point inside a history, used to model a
/// disconnect after the first part was delivered.
pub fn split_history_strategy(
    kind: EntityKind,
    max_changes: usize,
) -> impl Strategy<Value = (Vec<Envelope>, usize)> {
    history_strategy(kind, 1, max_changes.max(2)).prop_flat_map(|history| {
        let len = history.len();
        (Just(history), 0..=len)
    })
}

/// Configuration for property tests.
#[derive(Debug, Clone)]
pub struct PropTestConfig {
    /// Number of test cases to run.
    pub cases: u32,
    /// Maximum shrink iterations.
    pub max_shrink_iters: u32,
}

impl Default for PropTestConfig {
    fn default() -> Self {
        Self {
            cases: 256,
            max_shrink_iters: 1000,
        }
    }
}

impl PropTestConfig {
    /// Creates a configuration for quick tests.
    #[must_use]
    pub fn quick() -> Self {
        Self {
            cases: 32,
            max_shrink_iters: 100,
        }
    }

    /// Creates a configuration for thorough tests.
    #[must_use]
    pub fn thorough() -> Self {
        Self {
            cases: 1024,
            max_shrink_iters: 10000,
        }
    }

    /// Converts to proptest config.
    #[must_use]
    pub fn to_proptest_config(&self) -> ProptestConfig {
        ProptestConfig {
            cases: self.cases,
            max_shrink_iters: self.max_shrink_iters,
            ..ProptestConfig::default()
        }
    }
}
