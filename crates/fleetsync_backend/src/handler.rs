//! Request handling shared by every session.

use crate::config::BackendConfig;
use crate::error::BackendError;
use crate::journal::EntityJournal;
use fleetsync_protocol::{
    EntityKind, EntityStatus, Envelope, MutationRequest, ResyncBatch, ResyncRequest,
};
use parking_lot::{Mutex, RwLock};
use serde_json::{Map, Value};
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::broadcast;
use tracing::{debug, info};

/// Counters kept by the backend.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BackendStats {
    /// Sessions opened.
    pub sessions: u64,
    /// Envelopes published to the change feed.
    pub events_published: u64,
    /// Resync batches served.
    pub resyncs: u64,
    /// Mutations applied.
    pub mutations_applied: u64,
    /// Mutations refused.
    pub mutations_rejected: u64,
    /// Mutations swallowed without an answer.
    pub mutations_dropped: u64,
}

/// What happened to a mutation request.
#[derive(Debug, Clone, PartialEq)]
pub enum MutationResult {
    /// Applied; the resulting change has been published.
    Applied(Envelope),
    /// Refused with a reason.
    Rejected(String),
    /// Ignored without any answer.
    Dropped,
}

/// State shared by the server handle and its sessions.
pub struct HandlerContext {
    config: RwLock<BackendConfig>,
    journal: EntityJournal,
    feed: broadcast::Sender<Envelope>,
    drop_mutations: AtomicBool,
    stats: Mutex<BackendStats>,
}

impl HandlerContext {
    /// Creates a context with an empty journal.
    pub fn new(config: BackendConfig) -> Self {
        let (feed, _) = broadcast::channel(config.feed_capacity);
        Self {
            config: RwLock::new(config),
            journal: EntityJournal::new(),
            feed,
            drop_mutations: AtomicBool::new(false),
            stats: Mutex::new(BackendStats::default()),
        }
    }

    /// Current configuration.
    pub fn config(&self) -> BackendConfig {
        self.config.read().clone()
    }

    /// The entity journal.
    pub fn journal(&self) -> &EntityJournal {
        &self.journal
    }

    /// Subscribes to the change feed.
    pub fn feed(&self) -> broadcast::Receiver<Envelope> {
        self.feed.subscribe()
    }

    /// Counters.
    pub fn stats(&self) -> BackendStats {
        *self.stats.lock()
    }

    pub(crate) fn set_echo_correlation(&self, echo: bool) {
        self.config.write().echo_correlation = echo;
    }

    pub(crate) fn set_drop_mutations(&self, drop: bool) {
        self.drop_mutations.store(drop, Ordering::SeqCst);
    }

    pub(crate) fn record_session(&self) {
        self.stats.lock().sessions += 1;
    }

    /// Pushes an envelope to every session subscribed to its kind.
    pub fn publish(&self, envelope: &Envelope) {
        self.stats.lock().events_published += 1;
        // No receivers is fine: late sessions catch up through resync.
        let _ = self.feed.send(envelope.clone());
        debug!(
            kind = %envelope.kind,
            entity_id = %envelope.entity_id,
            revision = envelope.revision,
            "published change"
        );
    }

    /// Answers a resync request.
    pub fn handle_resync(&self, request: ResyncRequest) -> ResyncBatch {
        self.stats.lock().resyncs += 1;
        let envelopes = self.journal.since(request.kind, request.since_revision);
        debug!(
            kind = %request.kind,
            since = request.since_revision,
            count = envelopes.len(),
            "serving resync"
        );
        ResyncBatch::new(request.kind, request.since_revision, envelopes)
    }

    /// Applies a mutation request against the journal.
    ///
    /// `delete` removes the entity; `create` inserts it; any other action
    /// updates an existing entity, merging the request payload into the
    /// stored one.
    pub fn handle_mutation(&self, request: MutationRequest) -> MutationResult {
        let result = self.apply_mutation(&request);
        let mut stats = self.stats.lock();
        match &result {
            MutationResult::Applied(envelope) => {
                stats.mutations_applied += 1;
                drop(stats);
                self.publish(envelope);
            }
            MutationResult::Rejected(reason) => {
                stats.mutations_rejected += 1;
                info!(
                    correlation_id = %request.correlation_id,
                    action = %request.action_type,
                    %reason,
                    "mutation rejected"
                );
            }
            MutationResult::Dropped => {
                stats.mutations_dropped += 1;
                debug!(correlation_id = %request.correlation_id, "mutation dropped");
            }
        }
        result
    }

    fn apply_mutation(&self, request: &MutationRequest) -> MutationResult {
        if self.drop_mutations.load(Ordering::SeqCst) {
            return MutationResult::Dropped;
        }
        let config = self.config.read();
        if config.reject_actions.contains(&request.action_type) {
            return MutationResult::Rejected(format!(
                "action {} is not permitted",
                request.action_type
            ));
        }
        let correlation = config
            .echo_correlation
            .then_some(request.correlation_id);
        drop(config);

        let kind = request.kind;
        let id = request.entity_id.as_str();
        if request.action_type == "delete" {
            return match self.journal.delete(kind, id, correlation) {
                Ok(envelope) => MutationResult::Applied(envelope),
                Err(e) => MutationResult::Rejected(e.to_string()),
            };
        }

        let existing = self.journal.get(kind, id);
        if existing.is_none() && request.action_type != "create" {
            return MutationResult::Rejected(
                BackendError::UnknownEntity {
                    kind,
                    id: id.to_string(),
                }
                .to_string(),
            );
        }

        let status = requested_status(&request.payload)
            .unwrap_or_else(|| status_for_action(&request.action_type));
        let payload = merge_payload(
            existing.map(|envelope| envelope.payload),
            &request.payload,
        );
        MutationResult::Applied(self.journal.upsert(kind, id, status, payload, correlation))
    }

    /// Moves every transitional entity of `kind` to `healthy` and publishes
    /// the changes.
    pub fn settle(&self, kind: EntityKind) -> Vec<Envelope> {
        let settled: Vec<Envelope> = self
            .journal
            .live(kind)
            .into_iter()
            .filter(|envelope| envelope.status.is_transitional())
            .map(|envelope| {
                self.journal.upsert(
                    kind,
                    &envelope.entity_id,
                    EntityStatus::Healthy,
                    envelope.payload,
                    None,
                )
            })
            .collect();
        for envelope in &settled {
            self.publish(envelope);
        }
        settled
    }
}

impl std::fmt::Debug for HandlerContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HandlerContext")
            .field("config", &*self.config.read())
            .field("stats", &self.stats())
            .finish_non_exhaustive()
    }
}

fn requested_status(payload: &Value) -> Option<EntityStatus> {
    payload
        .get("status")
        .and_then(|status| serde_json::from_value(status.clone()).ok())
}

fn status_for_action(action: &str) -> EntityStatus {
    match action {
        "create" => EntityStatus::Pending,
        "scale" => EntityStatus::Scaling,
        "sync" => EntityStatus::Syncing,
        _ => EntityStatus::Progressing,
    }
}

/// Shallow merge of `update` into `base`. Non-object updates replace.
fn merge_payload(base: Option<Value>, update: &Value) -> Value {
    match (base, update) {
        (Some(Value::Object(mut base)), Value::Object(update)) => {
            for (key, value) in update {
                base.insert(key.clone(), value.clone());
            }
            Value::Object(base)
        }
        (Some(base), Value::Null) => base,
        (None, Value::Null) => Value::Object(Map::new()),
        (_, update) => update.clone(),
    }
}
