//! Authoritative entity journal.

use crate::error::{BackendError, BackendResult};
use fleetsync_protocol::{CorrelationId, EntityKind, EntityStatus, Envelope};
use parking_lot::RwLock;
use serde_json::Value;
use std::collections::HashMap;

#[derive(Debug, Default)]
struct KindJournal {
    next_revision: u64,
    /// Latest record per entity; deletes stay as tombstones.
    latest: HashMap<String, Envelope>,
}

impl KindJournal {
    fn record(&mut self, mut envelope: Envelope) -> Envelope {
        self.next_revision += 1;
        envelope.revision = self.next_revision;
        self.latest
            .insert(envelope.entity_id.clone(), envelope.clone());
        envelope
    }
}

/// Server-side journal of entity changes.
///
/// Revisions are assigned per kind, starting at 1. Only the latest change
/// of each entity is retained, which is all a resync needs.
#[derive(Debug, Default)]
pub struct EntityJournal {
    kinds: RwLock<HashMap<EntityKind, KindJournal>>,
}

impl EntityJournal {
    /// Creates an empty journal.
    pub fn new() -> Self {
        Self::default()
    }

    /// Records an upsert and returns the stored envelope.
    pub fn upsert(
        &self,
        kind: EntityKind,
        id: &str,
        status: EntityStatus,
        payload: Value,
        correlation_id: Option<CorrelationId>,
    ) -> Envelope {
        let mut envelope = Envelope::upsert(kind, id, 0, status, payload);
        envelope.correlation_id = correlation_id;
        self.kinds.write().entry(kind).or_default().record(envelope)
    }

    /// Records a delete of a live entity.
    pub fn delete(
        &self,
        kind: EntityKind,
        id: &str,
        correlation_id: Option<CorrelationId>,
    ) -> BackendResult<Envelope> {
        let mut kinds = self.kinds.write();
        let journal = kinds.entry(kind).or_default();
        let live = journal
            .latest
            .get(id)
            .is_some_and(|envelope| !envelope.is_delete());
        if !live {
            return Err(BackendError::UnknownEntity {
                kind,
                id: id.to_string(),
            });
        }
        let mut envelope = Envelope::delete(kind, id, 0);
        envelope.correlation_id = correlation_id;
        Ok(journal.record(envelope))
    }

    /// Live entity by id.
    pub fn get(&self, kind: EntityKind, id: &str) -> Option<Envelope> {
        self.kinds
            .read()
            .get(&kind)
            .and_then(|journal| journal.latest.get(id))
            .filter(|envelope| !envelope.is_delete())
            .cloned()
    }

    /// Changes newer than `since`, ordered by revision.
    ///
    /// `since == 0` returns the live set only, without tombstones.
    pub fn since(&self, kind: EntityKind, since: u64) -> Vec<Envelope> {
        let kinds = self.kinds.read();
        let Some(journal) = kinds.get(&kind) else {
            return Vec::new();
        };
        let mut changes: Vec<Envelope> = journal
            .latest
            .values()
            .filter(|envelope| envelope.revision > since)
            .filter(|envelope| since > 0 || !envelope.is_delete())
            .cloned()
            .collect();
        changes.sort_by_key(|envelope| envelope.revision);
        changes
    }

    /// Live entities of a kind, ordered by id.
    pub fn live(&self, kind: EntityKind) -> Vec<Envelope> {
        let mut live = self.since(kind, 0);
        live.sort_by(|a, b| a.entity_id.cmp(&b.entity_id));
        live
    }

    /// Last revision assigned for a kind.
    pub fn high_water(&self, kind: EntityKind) -> u64 {
        self.kinds
            .read()
            .get(&kind)
            .map(|journal| journal.next_revision)
            .unwrap_or(0)
    }

    /// Number of live entities of a kind.
    pub fn len(&self, kind: EntityKind) -> usize {
        self.kinds
            .read()
            .get(&kind)
            .map(|journal| {
                journal
                    .latest
                    .values()
                    .filter(|envelope| !envelope.is_delete())
                    .count()
            })
            .unwrap_or(0)
    }
}
