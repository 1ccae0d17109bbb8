//! Authoritative client-side entity state.
//!
//! The store keeps one [`EntityTable`] per kind holding the last confirmed
//! state, and an [`OptimisticLedger`] of pending local mutations. Reads merge
//! the two: a pending prediction is shown on top of the confirmed entity
//! until it is confirmed or rolled back.
//!
//! Every write happens under one lock. Change notifications are queued while
//! the lock is held and delivered once it is released, so subscribers see
//! writes in the order they were applied and may call back into the store.

use crate::ledger::{
    ExpiryReason, Mutation, MutationTicket, OptimisticEntry, OptimisticLedger, Prediction,
    Resolution, ResolutionKind,
};
use crate::router::{ChangeCause, Notification, SubscriptionRouter};
use fleetsync_protocol::{
    CorrelationId, EntityKind, EntityStatus, Envelope, MutationRequest, Operation, ResyncBatch,
};
use parking_lot::RwLock;
use serde::Serialize;
use serde_json::Value;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::time::{Duration, Instant};
use tracing::debug;

/// A confirmed entity.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Entity {
    /// Entity kind.
    pub kind: EntityKind,
    /// Entity id, unique within its kind.
    pub id: String,
    /// Revision of the last applied change; 0 for a prediction with no
    /// confirmed state behind it.
    pub revision: u64,
    /// Lifecycle status.
    pub status: EntityStatus,
    /// Kind-specific payload.
    pub payload: Value,
}

impl Entity {
    fn from_envelope(envelope: &Envelope) -> Self {
        Self {
            kind: envelope.kind,
            id: envelope.entity_id.clone(),
            revision: envelope.revision,
            status: envelope.status,
            payload: envelope.payload.clone(),
        }
    }
}

/// Result of applying one change to a table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApplyOutcome {
    /// A new entity was stored.
    Inserted,
    /// An existing entity was replaced.
    Updated,
    /// The entity was removed; its revision is kept.
    Deleted,
    /// The revision was not newer than the stored one; nothing changed.
    Stale,
}

impl ApplyOutcome {
    /// Returns true if the change was applied.
    pub fn is_applied(&self) -> bool {
        !matches!(self, ApplyOutcome::Stale)
    }
}

#[derive(Debug, Clone)]
struct Slot {
    revision: u64,
    entity: Option<Entity>,
}

/// Confirmed entities of one kind.
///
/// Deleted entities leave a tombstone holding their last revision, so a
/// late event for a deleted entity is recognized as stale.
///
/// Besides the highest revision seen, the table tracks a resume point: the
/// revision up to which it holds every change. Live events only advance it
/// once the current session's resync batch for the kind has landed, since
/// events received before that batch may skip revisions.
#[derive(Debug, Clone)]
pub struct EntityTable {
    kind: EntityKind,
    slots: HashMap<String, Slot>,
    high_water: u64,
    resume: u64,
    caught_up: bool,
}

impl EntityTable {
    /// Creates an empty table.
    pub fn new(kind: EntityKind) -> Self {
        Self {
            kind,
            slots: HashMap::new(),
            high_water: 0,
            resume: 0,
            caught_up: false,
        }
    }

    /// Kind stored in this table.
    pub fn kind(&self) -> EntityKind {
        self.kind
    }

    /// Applies a change if its revision is newer than the stored one.
    pub fn apply(&mut self, envelope: &Envelope) -> ApplyOutcome {
        let existing = self.slots.get(&envelope.entity_id);
        if let Some(slot) = existing {
            if envelope.revision <= slot.revision {
                return ApplyOutcome::Stale;
            }
        }
        let was_live = existing.is_some_and(|slot| slot.entity.is_some());

        self.high_water = self.high_water.max(envelope.revision);
        let (entity, outcome) = match envelope.operation {
            Operation::Delete => (None, ApplyOutcome::Deleted),
            Operation::Upsert => {
                let outcome = if was_live {
                    ApplyOutcome::Updated
                } else {
                    ApplyOutcome::Inserted
                };
                (Some(Entity::from_envelope(envelope)), outcome)
            }
        };
        self.slots.insert(
            envelope.entity_id.clone(),
            Slot {
                revision: envelope.revision,
                entity,
            },
        );
        outcome
    }

    /// Removes every live entity not named in `present`. Returns the removed ids.
    fn remove_absent(&mut self, present: &HashSet<&str>) -> Vec<String> {
        let mut removed: Vec<String> = self
            .slots
            .iter_mut()
            .filter(|(id, slot)| slot.entity.is_some() && !present.contains(id.as_str()))
            .map(|(id, slot)| {
                slot.entity = None;
                id.clone()
            })
            .collect();
        removed.sort();
        removed
    }

    fn raise_high_water(&mut self, revision: u64) {
        self.high_water = self.high_water.max(revision);
    }

    fn catch_up(&mut self, revision: u64) {
        self.resume = self.resume.max(revision);
        self.caught_up = true;
    }

    /// Confirmed entity by id.
    pub fn get(&self, id: &str) -> Option<&Entity> {
        self.slots.get(id).and_then(|slot| slot.entity.as_ref())
    }

    /// Stored revision for an id, including deleted ones.
    pub fn revision(&self, id: &str) -> Option<u64> {
        self.slots.get(id).map(|slot| slot.revision)
    }

    /// Highest revision seen for this kind.
    pub fn high_water(&self) -> u64 {
        self.high_water
    }

    /// Revision a resync for this kind should start after.
    pub fn resume_revision(&self) -> u64 {
        self.resume
    }

    /// Live entities.
    pub fn iter(&self) -> impl Iterator<Item = &Entity> {
        self.slots.values().filter_map(|slot| slot.entity.as_ref())
    }

    /// Number of live entities.
    pub fn len(&self) -> usize {
        self.iter().count()
    }

    /// Returns true if no entity is live.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// An entity as the UI should show it.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct EntityView {
    /// Confirmed state with any pending prediction applied.
    pub entity: Entity,
    /// Revision of the confirmed state, if any exists.
    pub confirmed_revision: Option<u64>,
    /// Pending mutation whose prediction is shown.
    pub pending: Option<CorrelationId>,
}

impl EntityView {
    /// Returns true if a prediction is shown.
    pub fn is_optimistic(&self) -> bool {
        self.pending.is_some()
    }
}

/// Point-in-time view of one kind.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Snapshot {
    /// Kind of every entity in the snapshot.
    pub kind: EntityKind,
    /// Visible entities by id.
    pub entities: BTreeMap<String, EntityView>,
}

impl Snapshot {
    /// Entity view by id.
    pub fn get(&self, id: &str) -> Option<&EntityView> {
        self.entities.get(id)
    }

    /// Visible ids in order.
    pub fn ids(&self) -> impl Iterator<Item = &str> {
        self.entities.keys().map(String::as_str)
    }

    /// Number of visible entities.
    pub fn len(&self) -> usize {
        self.entities.len()
    }

    /// Returns true if nothing is visible.
    pub fn is_empty(&self) -> bool {
        self.entities.is_empty()
    }

    /// Confirmed entities only, ignoring predictions.
    pub fn confirmed(&self) -> impl Iterator<Item = (&str, u64)> {
        self.entities
            .iter()
            .filter_map(|(id, view)| view.confirmed_revision.map(|rev| (id.as_str(), rev)))
    }
}

/// Store counters.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct StoreStats {
    /// Live events applied.
    pub events_applied: u64,
    /// Events ignored because their revision was not newer.
    pub stale_events: u64,
    /// Deletes applied, from events or resyncs.
    pub deletes: u64,
    /// Resync batches applied.
    pub resyncs: u64,
    /// Optimistic mutations begun.
    pub mutations_begun: u64,
    /// Optimistic mutations confirmed.
    pub mutations_confirmed: u64,
    /// Optimistic mutations rolled back.
    pub mutations_expired: u64,
}

/// Counts produced by [`StateStore::apply_resync`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ResyncOutcome {
    /// Envelopes applied.
    pub applied: usize,
    /// Envelopes ignored as stale.
    pub stale: usize,
    /// Entities removed because a full resync did not list them.
    pub removed: usize,
}

#[derive(Debug)]
struct StoreInner {
    tables: HashMap<EntityKind, EntityTable>,
    ledger: OptimisticLedger,
    stats: StoreStats,
}

impl StoreInner {
    fn table_mut(&mut self, kind: EntityKind) -> &mut EntityTable {
        self.tables
            .entry(kind)
            .or_insert_with(|| EntityTable::new(kind))
    }

    /// Resolves the pending entry an applied change confirms, if any.
    fn confirm(&mut self, envelope: &Envelope, now: Instant) -> Option<Resolution> {
        let correlation_id = self.ledger.match_confirmation(envelope, now)?;
        let resolution = self.ledger.confirm(correlation_id, envelope.revision)?;
        self.stats.mutations_confirmed += 1;
        debug!(
            %correlation_id,
            kind = %envelope.kind,
            entity_id = %envelope.entity_id,
            revision = envelope.revision,
            "optimistic mutation confirmed"
        );
        Some(resolution)
    }

    fn view(&self, kind: EntityKind, id: &str) -> Option<EntityView> {
        let confirmed = self.tables.get(&kind).and_then(|table| table.get(id));
        merge(kind, id, confirmed, self.ledger.overlay(kind, id))
    }
}

/// Merges a pending prediction over confirmed state. Predicted deletes hide
/// the entity.
fn merge(
    kind: EntityKind,
    id: &str,
    confirmed: Option<&Entity>,
    pending: Option<&OptimisticEntry>,
) -> Option<EntityView> {
    let confirmed_revision = confirmed.map(|entity| entity.revision);
    let Some(entry) = pending else {
        return confirmed.map(|entity| EntityView {
            entity: entity.clone(),
            confirmed_revision,
            pending: None,
        });
    };

    let (status, predicted) = match &entry.prediction {
        Prediction::Delete => return None,
        Prediction::Upsert { status, payload } => (*status, payload),
    };
    let payload = match (confirmed.map(|entity| &entity.payload), predicted) {
        (Some(Value::Object(base)), Value::Object(changes)) => {
            let mut merged = base.clone();
            for (key, value) in changes {
                merged.insert(key.clone(), value.clone());
            }
            Value::Object(merged)
        }
        _ => predicted.clone(),
    };

    Some(EntityView {
        entity: Entity {
            kind,
            id: id.to_string(),
            revision: confirmed_revision.unwrap_or(0),
            status,
            payload,
        },
        confirmed_revision,
        pending: Some(entry.correlation_id),
    })
}

/// Client-side store of confirmed and predicted entity state.
#[derive(Debug)]
pub struct StateStore {
    inner: RwLock<StoreInner>,
    router: SubscriptionRouter,
}

impl StateStore {
    /// Creates an empty store.
    ///
    /// `optimistic_timeout` bounds how long a prediction is shown;
    /// `confirm_window` bounds how long after issue an event without a
    /// correlation id may confirm a mutation.
    pub fn new(optimistic_timeout: Duration, confirm_window: Duration) -> Self {
        Self {
            inner: RwLock::new(StoreInner {
                tables: HashMap::new(),
                ledger: OptimisticLedger::new(optimistic_timeout, confirm_window),
                stats: StoreStats::default(),
            }),
            router: SubscriptionRouter::new(),
        }
    }

    /// Router delivering this store's notifications.
    pub fn router(&self) -> &SubscriptionRouter {
        &self.router
    }

    /// Applies one live event.
    ///
    /// An event whose revision is not newer than the stored one is counted
    /// and ignored. An applied event may confirm a pending mutation.
    pub fn apply_event(&self, envelope: &Envelope, now: Instant) -> ApplyOutcome {
        let outcome = {
            let mut inner = self.inner.write();
            let outcome = inner.table_mut(envelope.kind).apply(envelope);

            let confirmed = if outcome.is_applied() {
                let table = inner.table_mut(envelope.kind);
                if table.caught_up {
                    table.resume = table.resume.max(envelope.revision);
                }
                inner.stats.events_applied += 1;
                if outcome == ApplyOutcome::Deleted {
                    inner.stats.deletes += 1;
                }
                inner.confirm(envelope, now)
            } else {
                inner.stats.stale_events += 1;
                debug!(
                    kind = %envelope.kind,
                    entity_id = %envelope.entity_id,
                    revision = envelope.revision,
                    "ignoring stale event"
                );
                // An echoed id still proves the mutation landed.
                match envelope.correlation_id {
                    Some(_) => inner.confirm(envelope, now),
                    None => None,
                }
            };

            if outcome.is_applied() || confirmed.is_some() {
                self.router.enqueue(Notification::changed(
                    envelope.kind,
                    vec![envelope.entity_id.clone()],
                    ChangeCause::Event,
                ));
            }
            outcome
        };
        self.router.dispatch();
        outcome
    }

    /// Applies a resync batch atomically with a single notification.
    ///
    /// A full batch (`since_revision == 0`) is the complete set of live
    /// entities: anything it does not list is removed. Entries confirm
    /// pending mutations only through an echoed correlation id, whether or
    /// not they were newer than the stored state.
    pub fn apply_resync(&self, batch: &ResyncBatch, now: Instant) -> ResyncOutcome {
        let outcome = {
            let mut inner = self.inner.write();
            let inner = &mut *inner;
            let mut outcome = ResyncOutcome::default();
            let mut changed = Vec::new();
            let mut seen = HashSet::new();

            let table = inner.table_mut(batch.kind);
            let mut deletes = 0;
            for envelope in &batch.envelopes {
                match table.apply(envelope) {
                    ApplyOutcome::Stale => outcome.stale += 1,
                    applied => {
                        outcome.applied += 1;
                        if applied == ApplyOutcome::Deleted {
                            deletes += 1;
                        }
                        if seen.insert(envelope.entity_id.as_str()) {
                            changed.push(envelope.entity_id.clone());
                        }
                    }
                }
            }
            if batch.is_full() {
                let present: HashSet<&str> = batch
                    .envelopes
                    .iter()
                    .filter(|envelope| !envelope.is_delete())
                    .map(|envelope| envelope.entity_id.as_str())
                    .collect();
                let removed = table.remove_absent(&present);
                outcome.removed = removed.len();
                deletes += removed.len() as u64;
                for id in removed {
                    if !seen.contains(id.as_str()) {
                        changed.push(id);
                    }
                }
            }
            table.raise_high_water(batch.high_water());
            table.catch_up(batch.high_water());

            inner.stats.resyncs += 1;
            inner.stats.deletes += deletes;
            // A batch replays state rather than answering a mutation, so only
            // an echoed correlation id confirms from it.
            let mut confirmed = false;
            for envelope in batch.envelopes.iter().filter(|e| e.correlation_id.is_some()) {
                confirmed |= inner.confirm(envelope, now).is_some();
            }

            debug!(
                kind = %batch.kind,
                full = batch.is_full(),
                since = batch.since_revision,
                applied = outcome.applied,
                stale = outcome.stale,
                removed = outcome.removed,
                "applied resync batch"
            );

            if !changed.is_empty() || confirmed {
                self.router.enqueue(Notification::changed(
                    batch.kind,
                    changed,
                    ChangeCause::Resync,
                ));
            }
            outcome
        };
        self.router.dispatch();
        outcome
    }

    /// Records an optimistic mutation and shows its prediction.
    pub fn begin_mutation(
        &self,
        mutation: Mutation,
        now: Instant,
    ) -> (MutationRequest, MutationTicket) {
        let result = {
            let mut inner = self.inner.write();
            let kind = mutation.kind;
            let id = mutation.entity_id.clone();
            let result = inner.ledger.begin(mutation, now);
            inner.stats.mutations_begun += 1;
            self.router
                .enqueue(Notification::changed(kind, vec![id], ChangeCause::Optimistic));
            result
        };
        self.router.dispatch();
        result
    }

    /// Rolls back one pending mutation. Returns false if it was not pending.
    pub fn expire(&self, correlation_id: CorrelationId, reason: ExpiryReason) -> bool {
        let expired = {
            let mut inner = self.inner.write();
            let resolutions: Vec<Resolution> =
                inner.ledger.expire(correlation_id, reason).into_iter().collect();
            self.record_rollbacks(&mut inner, resolutions)
        };
        self.router.dispatch();
        expired > 0
    }

    /// Rolls back a mutation the backend refused.
    pub fn reject(&self, correlation_id: CorrelationId, reason: impl Into<String>) -> bool {
        self.expire(correlation_id, ExpiryReason::Rejected(reason.into()))
    }

    /// Rolls back every mutation whose deadline has passed.
    pub fn expire_due(&self, now: Instant) -> usize {
        let expired = {
            let mut inner = self.inner.write();
            let resolutions = inner.ledger.expire_due(now);
            self.record_rollbacks(&mut inner, resolutions)
        };
        self.router.dispatch();
        expired
    }

    /// Rolls back every pending mutation.
    pub fn flush(&self, reason: ExpiryReason) -> usize {
        let expired = {
            let mut inner = self.inner.write();
            let resolutions = inner.ledger.flush(reason);
            self.record_rollbacks(&mut inner, resolutions)
        };
        self.router.dispatch();
        expired
    }

    fn record_rollbacks(&self, inner: &mut StoreInner, resolutions: Vec<Resolution>) -> usize {
        let count = resolutions.len();
        inner.stats.mutations_expired += count as u64;

        let mut by_kind: Vec<(EntityKind, Vec<String>)> = Vec::new();
        for resolution in resolutions {
            debug_assert!(matches!(resolution.kind_of, ResolutionKind::Expired(_)));
            match by_kind.iter_mut().find(|(kind, _)| *kind == resolution.kind) {
                Some((_, ids)) => {
                    if !ids.contains(&resolution.entity_id) {
                        ids.push(resolution.entity_id);
                    }
                }
                None => by_kind.push((resolution.kind, vec![resolution.entity_id])),
            }
        }
        for (kind, ids) in by_kind {
            self.router
                .enqueue(Notification::changed(kind, ids, ChangeCause::Rollback));
        }
        count
    }

    /// Earliest pending mutation deadline.
    pub fn next_expiry(&self) -> Option<Instant> {
        self.inner.read().ledger.next_deadline()
    }

    /// Returns true if the mutation is still pending.
    pub fn is_pending(&self, correlation_id: &CorrelationId) -> bool {
        self.inner.read().ledger.is_pending(correlation_id)
    }

    /// Number of pending mutations.
    pub fn pending_count(&self) -> usize {
        self.inner.read().ledger.len()
    }

    /// Visible state of one kind.
    pub fn snapshot(&self, kind: EntityKind) -> Snapshot {
        let inner = self.inner.read();
        let mut ids: HashSet<&str> = HashSet::new();
        if let Some(table) = inner.tables.get(&kind) {
            ids.extend(table.iter().map(|entity| entity.id.as_str()));
        }
        ids.extend(
            inner
                .ledger
                .overlays(kind)
                .map(|entry| entry.entity_id.as_str()),
        );

        let entities = ids
            .into_iter()
            .filter_map(|id| inner.view(kind, id).map(|view| (id.to_string(), view)))
            .collect();
        Snapshot { kind, entities }
    }

    /// Visible state of one entity.
    pub fn entity(&self, kind: EntityKind, id: &str) -> Option<EntityView> {
        self.inner.read().view(kind, id)
    }

    /// Confirmed state of one entity, ignoring predictions.
    pub fn confirmed(&self, kind: EntityKind, id: &str) -> Option<Entity> {
        self.inner
            .read()
            .tables
            .get(&kind)
            .and_then(|table| table.get(id))
            .cloned()
    }

    /// Highest revision seen for a kind.
    pub fn high_water(&self, kind: EntityKind) -> u64 {
        self.inner
            .read()
            .tables
            .get(&kind)
            .map(EntityTable::high_water)
            .unwrap_or(0)
    }

    /// Revision the next resync for a kind should start after.
    ///
    /// This trails [`high_water`](Self::high_water) when live events arrived
    /// ahead of the kind's resync batch in the current session.
    pub fn resume_revision(&self, kind: EntityKind) -> u64 {
        self.inner
            .read()
            .tables
            .get(&kind)
            .map(EntityTable::resume_revision)
            .unwrap_or(0)
    }

    /// Starts a new session: every kind waits for its resync batch before
    /// live events advance its resume point again.
    pub fn begin_catch_up(&self) {
        for table in self.inner.write().tables.values_mut() {
            table.caught_up = false;
        }
    }

    /// Store counters.
    pub fn stats(&self) -> StoreStats {
        self.inner.read().stats.clone()
    }
}
