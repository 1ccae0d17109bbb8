//! Optimistic update ledger.
//!
//! Tracks locally issued mutations that the backend has not confirmed yet.
//! Each entry carries a prediction that is overlaid on the confirmed
//! snapshot for display. Every entry leaves the ledger exactly once: through
//! [`confirm`](OptimisticLedger::confirm) or through
//! [`expire`](OptimisticLedger::expire) (timeout, rejection, or connection
//! close). The originator learns which through its [`MutationTicket`].

use crate::error::SyncError;
use fleetsync_protocol::{CorrelationId, EntityKind, EntityStatus, Envelope, MutationRequest};
use serde_json::Value;
use std::collections::HashMap;
use std::fmt;
use std::time::{Duration, Instant};
use tokio::sync::oneshot;
use tokio::sync::oneshot::error::TryRecvError;
use tracing::warn;

/// Predicted state of the target entity once a mutation lands.
#[derive(Debug, Clone, PartialEq)]
pub enum Prediction {
    /// The entity will exist with this status and payload.
    Upsert {
        /// Predicted status.
        status: EntityStatus,
        /// Predicted payload.
        payload: Value,
    },
    /// The entity will be gone.
    Delete,
}

/// A local action to send to the backend.
#[derive(Debug, Clone, PartialEq)]
pub struct Mutation {
    /// Backend action name.
    pub action_type: String,
    /// Target kind.
    pub kind: EntityKind,
    /// Target id.
    pub entity_id: String,
    /// Action arguments sent to the backend.
    pub payload: Value,
    /// What the UI should show until the backend answers.
    pub prediction: Prediction,
}

impl Mutation {
    /// Creates a mutation with an empty argument payload.
    pub fn new(
        action_type: impl Into<String>,
        kind: EntityKind,
        entity_id: impl Into<String>,
        prediction: Prediction,
    ) -> Self {
        Self {
            action_type: action_type.into(),
            kind,
            entity_id: entity_id.into(),
            payload: Value::Null,
            prediction,
        }
    }

    /// Sets the action arguments.
    pub fn with_payload(mut self, payload: Value) -> Self {
        self.payload = payload;
        self
    }
}

/// Why an entry left the ledger without confirmation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExpiryReason {
    /// No confirmation within the optimistic timeout.
    Timeout,
    /// The backend refused the mutation.
    Rejected(String),
    /// The engine closed its connection.
    ConnectionClosed,
}

impl ExpiryReason {
    fn into_error(self, correlation_id: CorrelationId) -> SyncError {
        match self {
            ExpiryReason::Timeout => SyncError::MutationTimeout { correlation_id },
            ExpiryReason::Rejected(reason) => SyncError::MutationRejected {
                correlation_id,
                reason,
            },
            ExpiryReason::ConnectionClosed => SyncError::ConnectionClosed,
        }
    }
}

impl fmt::Display for ExpiryReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ExpiryReason::Timeout => f.write_str("timeout"),
            ExpiryReason::Rejected(reason) => write!(f, "rejected: {reason}"),
            ExpiryReason::ConnectionClosed => f.write_str("connection closed"),
        }
    }
}

/// Final result of a mutation, delivered to its originator only.
#[derive(Debug, Clone, PartialEq)]
pub enum MutationOutcome {
    /// A backend event confirmed the mutation.
    Confirmed {
        /// Revision of the confirming event.
        revision: u64,
    },
    /// The mutation was rolled back.
    Failed(SyncError),
}

impl MutationOutcome {
    /// Returns true for a confirmed mutation.
    pub fn is_confirmed(&self) -> bool {
        matches!(self, MutationOutcome::Confirmed { .. })
    }
}

/// Handle returned to the caller that began a mutation.
#[derive(Debug)]
pub struct MutationTicket {
    correlation_id: CorrelationId,
    receiver: oneshot::Receiver<MutationOutcome>,
}

impl MutationTicket {
    /// Correlation id of the mutation.
    pub fn correlation_id(&self) -> CorrelationId {
        self.correlation_id
    }

    /// Waits for the mutation to be confirmed or rolled back.
    pub async fn outcome(self) -> MutationOutcome {
        self.receiver
            .await
            .unwrap_or(MutationOutcome::Failed(SyncError::EngineStopped))
    }

    /// Returns the outcome if it is already known.
    pub fn try_outcome(&mut self) -> Option<MutationOutcome> {
        match self.receiver.try_recv() {
            Ok(outcome) => Some(outcome),
            Err(TryRecvError::Empty) => None,
            Err(TryRecvError::Closed) => Some(MutationOutcome::Failed(SyncError::EngineStopped)),
        }
    }
}

/// A pending local mutation.
#[derive(Debug)]
pub struct OptimisticEntry {
    /// Correlation id.
    pub correlation_id: CorrelationId,
    /// Target kind.
    pub kind: EntityKind,
    /// Target id.
    pub entity_id: String,
    /// Backend action name.
    pub action_type: String,
    /// Predicted state.
    pub prediction: Prediction,
    /// When the mutation was issued.
    pub issued_at: Instant,
    /// When the mutation expires.
    pub deadline: Instant,
    sender: Option<oneshot::Sender<MutationOutcome>>,
}

/// How an entry left the ledger.
#[derive(Debug, Clone, PartialEq)]
pub enum ResolutionKind {
    /// Confirmed by an event at this revision.
    Confirmed {
        /// Revision of the confirming event.
        revision: u64,
    },
    /// Rolled back.
    Expired(ExpiryReason),
}

/// Record of an entry leaving the ledger.
#[derive(Debug, Clone, PartialEq)]
pub struct Resolution {
    /// Correlation id.
    pub correlation_id: CorrelationId,
    /// Target kind.
    pub kind: EntityKind,
    /// Target id.
    pub entity_id: String,
    /// Confirm or expire.
    pub kind_of: ResolutionKind,
}

/// Ledger of pending optimistic mutations.
#[derive(Debug)]
pub struct OptimisticLedger {
    entries: HashMap<CorrelationId, OptimisticEntry>,
    by_entity: HashMap<(EntityKind, String), Vec<CorrelationId>>,
    timeout: Duration,
    confirm_window: Duration,
}

impl OptimisticLedger {
    /// Creates an empty ledger.
    pub fn new(timeout: Duration, confirm_window: Duration) -> Self {
        Self {
            entries: HashMap::new(),
            by_entity: HashMap::new(),
            timeout,
            confirm_window,
        }
    }

    /// Records a mutation and returns the request to send plus the
    /// originator's ticket.
    pub fn begin(&mut self, mutation: Mutation, now: Instant) -> (MutationRequest, MutationTicket) {
        let correlation_id = CorrelationId::new();
        let (sender, receiver) = oneshot::channel();

        let request = MutationRequest {
            action_type: mutation.action_type.clone(),
            kind: mutation.kind,
            entity_id: mutation.entity_id.clone(),
            payload: mutation.payload,
            correlation_id,
        };

        self.by_entity
            .entry((mutation.kind, mutation.entity_id.clone()))
            .or_default()
            .push(correlation_id);
        self.entries.insert(
            correlation_id,
            OptimisticEntry {
                correlation_id,
                kind: mutation.kind,
                entity_id: mutation.entity_id,
                action_type: mutation.action_type,
                prediction: mutation.prediction,
                issued_at: now,
                deadline: now + self.timeout,
                sender: Some(sender),
            },
        );

        let ticket = MutationTicket {
            correlation_id,
            receiver,
        };
        (request, ticket)
    }

    /// Finds the pending entry a confirmed event resolves.
    ///
    /// An echoed correlation id wins. Without one, the oldest pending entry
    /// for the same entity issued within the confirm window is chosen.
    pub fn match_confirmation(&self, envelope: &Envelope, now: Instant) -> Option<CorrelationId> {
        if let Some(correlation_id) = envelope.correlation_id {
            return self
                .entries
                .contains_key(&correlation_id)
                .then_some(correlation_id);
        }

        self.by_entity
            .get(&(envelope.kind, envelope.entity_id.clone()))?
            .iter()
            .filter_map(|id| self.entries.get(id))
            .find(|entry| now.saturating_duration_since(entry.issued_at) <= self.confirm_window)
            .map(|entry| entry.correlation_id)
    }

    /// Resolves an entry as confirmed.
    pub fn confirm(&mut self, correlation_id: CorrelationId, revision: u64) -> Option<Resolution> {
        let entry = self.remove(correlation_id)?;
        Some(Self::resolve(
            entry,
            ResolutionKind::Confirmed { revision },
            MutationOutcome::Confirmed { revision },
        ))
    }

    /// Resolves an entry as rolled back.
    pub fn expire(&mut self, correlation_id: CorrelationId, reason: ExpiryReason) -> Option<Resolution> {
        let entry = self.remove(correlation_id)?;
        warn!(
            %correlation_id,
            kind = %entry.kind,
            entity_id = %entry.entity_id,
            action = %entry.action_type,
            %reason,
            "optimistic mutation rolled back"
        );
        let outcome = MutationOutcome::Failed(reason.clone().into_error(correlation_id));
        Some(Self::resolve(entry, ResolutionKind::Expired(reason), outcome))
    }

    /// Expires every entry whose deadline is at or before `now`.
    pub fn expire_due(&mut self, now: Instant) -> Vec<Resolution> {
        let mut due: Vec<(Instant, CorrelationId)> = self
            .entries
            .values()
            .filter(|entry| entry.deadline <= now)
            .map(|entry| (entry.deadline, entry.correlation_id))
            .collect();
        due.sort();
        due.into_iter()
            .filter_map(|(_, id)| self.expire(id, ExpiryReason::Timeout))
            .collect()
    }

    /// Expires every pending entry.
    pub fn flush(&mut self, reason: ExpiryReason) -> Vec<Resolution> {
        let mut pending: Vec<(Instant, CorrelationId)> = self
            .entries
            .values()
            .map(|entry| (entry.issued_at, entry.correlation_id))
            .collect();
        pending.sort();
        pending
            .into_iter()
            .filter_map(|(_, id)| self.expire(id, reason.clone()))
            .collect()
    }

    /// The most recent pending entry for an entity; its prediction is what
    /// the UI shows.
    pub fn overlay(&self, kind: EntityKind, entity_id: &str) -> Option<&OptimisticEntry> {
        self.by_entity
            .get(&(kind, entity_id.to_string()))?
            .last()
            .and_then(|id| self.entries.get(id))
    }

    /// Most recent pending entry for every entity of a kind.
    pub fn overlays(&self, kind: EntityKind) -> impl Iterator<Item = &OptimisticEntry> {
        self.by_entity
            .iter()
            .filter(move |((k, _), _)| *k == kind)
            .filter_map(|(_, ids)| ids.last().and_then(|id| self.entries.get(id)))
    }

    /// Earliest pending deadline.
    pub fn next_deadline(&self) -> Option<Instant> {
        self.entries.values().map(|entry| entry.deadline).min()
    }

    /// Returns true if the mutation is still pending.
    pub fn is_pending(&self, correlation_id: &CorrelationId) -> bool {
        self.entries.contains_key(correlation_id)
    }

    /// Number of pending entries.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Returns true if nothing is pending.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    fn remove(&mut self, correlation_id: CorrelationId) -> Option<OptimisticEntry> {
        let entry = self.entries.remove(&correlation_id)?;
        let key = (entry.kind, entry.entity_id.clone());
        if let Some(ids) = self.by_entity.get_mut(&key) {
            ids.retain(|id| *id != correlation_id);
            if ids.is_empty() {
                self.by_entity.remove(&key);
            }
        }
        Some(entry)
    }

    fn resolve(
        mut entry: OptimisticEntry,
        kind_of: ResolutionKind,
        outcome: MutationOutcome,
    ) -> Resolution {
        if let Some(sender) = entry.sender.take() {
            // The originator may have dropped its ticket.
            let _ = sender.send(outcome);
        }
        Resolution {
            correlation_id: entry.correlation_id,
            kind: entry.kind,
            entity_id: entry.entity_id,
            kind_of,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    const TIMEOUT: Duration = Duration::from_secs(10);

    fn ledger() -> OptimisticLedger {
        OptimisticLedger::new(TIMEOUT, TIMEOUT)
    }

    fn scale_up(id: &str) -> Mutation {
        Mutation::new(
            "scale",
            EntityKind::Deployment,
            id,
            Prediction::Upsert {
                status: EntityStatus::Scaling,
                payload: json!({ "replicas": 5 }),
            },
        )
        .with_payload(json!({ "replicas": 5 }))
    }

    fn confirmed(id: &str, revision: u64) -> Envelope {
        Envelope::upsert(
            EntityKind::Deployment,
            id,
            revision,
            EntityStatus::Healthy,
            json!({ "replicas": 5 }),
        )
    }

    #[test]
    fn begin_builds_request_and_overlay() {
        let mut ledger = ledger();
        let now = Instant::now();
        let (request, ticket) = ledger.begin(scale_up("deployment-42"), now);

        assert_eq!(request.correlation_id, ticket.correlation_id());
        assert_eq!(request.action_type, "scale");
        assert_eq!(request.payload, json!({ "replicas": 5 }));
        assert!(ledger.is_pending(&request.correlation_id));

        let overlay = ledger.overlay(EntityKind::Deployment, "deployment-42").unwrap();
        assert_eq!(overlay.deadline, now + TIMEOUT);
        assert!(matches!(
            overlay.prediction,
            Prediction::Upsert {
                status: EntityStatus::Scaling,
                ..
            }
        ));
    }

    #[test]
    fn confirm_resolves_ticket_once() {
        let mut ledger = ledger();
        let (request, mut ticket) = ledger.begin(scale_up("deployment-42"), Instant::now());
        let id = request.correlation_id;

        let resolution = ledger.confirm(id, 4).unwrap();
        assert_eq!(resolution.kind_of, ResolutionKind::Confirmed { revision: 4 });
        assert_eq!(ticket.try_outcome(), Some(MutationOutcome::Confirmed { revision: 4 }));

        // Already resolved: neither path fires again.
        assert!(ledger.confirm(id, 5).is_none());
        assert!(ledger.expire(id, ExpiryReason::Timeout).is_none());
        assert!(ledger.overlay(EntityKind::Deployment, "deployment-42").is_none());
        assert!(ledger.is_empty());
    }

    #[test]
    fn echoed_correlation_matches_exactly() {
        let mut ledger = ledger();
        let now = Instant::now();
        let (first, _t1) = ledger.begin(scale_up("deployment-42"), now);
        let (second, _t2) = ledger.begin(scale_up("deployment-42"), now);

        let event = confirmed("deployment-42", 4).with_correlation(second.correlation_id);
        assert_eq!(
            ledger.match_confirmation(&event, now),
            Some(second.correlation_id)
        );

        let foreign = confirmed("deployment-42", 4).with_correlation(CorrelationId::new());
        assert_eq!(ledger.match_confirmation(&foreign, now), None);
        assert!(ledger.is_pending(&first.correlation_id));
    }

    #[test]
    fn uncorrelated_event_matches_oldest_within_window() {
        let mut ledger = ledger();
        let start = Instant::now();
        let (first, _t1) = ledger.begin(scale_up("deployment-42"), start);
        let (second, _t2) = ledger.begin(scale_up("deployment-42"), start + Duration::from_secs(8));

        let event = confirmed("deployment-42", 4);
        assert_eq!(
            ledger.match_confirmation(&event, start + Duration::from_secs(9)),
            Some(first.correlation_id)
        );
        // The first entry has left the window; the second is still inside it.
        assert_eq!(
            ledger.match_confirmation(&event, start + Duration::from_secs(12)),
            Some(second.correlation_id)
        );
        assert_eq!(
            ledger.match_confirmation(&confirmed("other", 1), start),
            None
        );
    }

    #[test]
    fn expire_due_times_out_in_deadline_order() {
        let mut ledger = ledger();
        let start = Instant::now();
        let (a, mut ticket_a) = ledger.begin(scale_up("a"), start);
        let (_b, _ticket_b) = ledger.begin(scale_up("b"), start + Duration::from_secs(5));

        assert!(ledger.expire_due(start + Duration::from_secs(9)).is_empty());
        assert_eq!(ledger.next_deadline(), Some(start + TIMEOUT));

        let expired = ledger.expire_due(start + TIMEOUT);
        assert_eq!(expired.len(), 1);
        assert_eq!(expired[0].correlation_id, a.correlation_id);
        assert_eq!(
            expired[0].kind_of,
            ResolutionKind::Expired(ExpiryReason::Timeout)
        );
        assert_eq!(
            ticket_a.try_outcome(),
            Some(MutationOutcome::Failed(SyncError::MutationTimeout {
                correlation_id: a.correlation_id
            }))
        );
        assert_eq!(ledger.len(), 1);
    }

    #[test]
    fn flush_uses_connection_closed() {
        let mut ledger = ledger();
        let now = Instant::now();
        let (_a, mut ticket) = ledger.begin(scale_up("a"), now);
        let (_b, _) = ledger.begin(scale_up("b"), now);

        let flushed = ledger.flush(ExpiryReason::ConnectionClosed);
        assert_eq!(flushed.len(), 2);
        assert!(ledger.is_empty());
        assert_eq!(ledger.next_deadline(), None);
        assert_eq!(
            ticket.try_outcome(),
            Some(MutationOutcome::Failed(SyncError::ConnectionClosed))
        );
    }

    #[test]
    fn rejection_reaches_originator() {
        let mut ledger = ledger();
        let (request, ticket) = ledger.begin(scale_up("a"), Instant::now());
        ledger.expire(
            request.correlation_id,
            ExpiryReason::Rejected("quota exceeded".into()),
        );

        let outcome = block_on(ticket.outcome());
        assert_eq!(
            outcome,
            MutationOutcome::Failed(SyncError::MutationRejected {
                correlation_id: request.correlation_id,
                reason: "quota exceeded".into()
            })
        );
    }

    #[test]
    fn overlay_shows_latest_prediction() {
        let mut ledger = ledger();
        let now = Instant::now();
        ledger.begin(scale_up("a"), now);
        let delete = Mutation::new("delete", EntityKind::Deployment, "a", Prediction::Delete);
        let (request, _ticket) = ledger.begin(delete, now);

        let overlay = ledger.overlay(EntityKind::Deployment, "a").unwrap();
        assert_eq!(overlay.correlation_id, request.correlation_id);
        assert_eq!(overlay.prediction, Prediction::Delete);
        assert_eq!(ledger.overlays(EntityKind::Deployment).count(), 1);
        assert_eq!(ledger.overlays(EntityKind::Cluster).count(), 0);
    }

    #[test]
    fn dropped_ticket_does_not_block_resolution() {
        let mut ledger = ledger();
        let (request, ticket) = ledger.begin(scale_up("a"), Instant::now());
        drop(ticket);
        assert!(ledger.confirm(request.correlation_id, 2).is_some());
    }

    fn block_on<F: std::future::Future>(future: F) -> F::Output {
        tokio::runtime::Builder::new_current_thread()
            .build()
            .unwrap()
            .block_on(future)
    }
}
