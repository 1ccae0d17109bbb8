//! Backend server and per-connection sessions.

use crate::config::BackendConfig;
use crate::error::{BackendError, BackendResult};
use crate::handler::{BackendStats, HandlerContext, MutationResult};
use fleetsync_protocol::{
    ClientFrame, CorrelationId, EntityKind, EntityStatus, Envelope, MutationRejected,
    RawMessage, ResyncBatch, ResyncRequest, ServerFrame, WireFormat,
};
use serde_json::Value;
use std::collections::BTreeSet;
use std::sync::Arc;
use tokio::sync::broadcast::{self, error::RecvError};
use tracing::{debug, warn};

/// The reference backend.
///
/// Holds the authoritative entity journal and pushes every change to the
/// sessions subscribed to its kind. Cloning yields another handle to the
/// same backend.
///
/// # Example
///
/// ```
/// use fleetsync_backend::{BackendConfig, BackendServer};
/// use fleetsync_protocol::{EntityKind, EntityStatus};
///
/// let server = BackendServer::new(BackendConfig::default());
/// let envelope = server.publish_upsert(
///     EntityKind::Deployment,
///     "deployment-42",
///     EntityStatus::Healthy,
///     serde_json::json!({ "replicas": 3 }),
/// );
/// assert_eq!(envelope.revision, 1);
/// ```
#[derive(Debug, Clone)]
pub struct BackendServer {
    context: Arc<HandlerContext>,
}

impl BackendServer {
    /// Creates a backend with an empty journal.
    pub fn new(config: BackendConfig) -> Self {
        Self {
            context: Arc::new(HandlerContext::new(config)),
        }
    }

    /// Opens a session for a client presenting `token`.
    pub fn session(&self, token: Option<&str>) -> BackendResult<BackendSession> {
        let config = self.context.config();
        if let Some(expected) = config.token.as_deref() {
            match token {
                Some(token) if token == expected => {}
                Some(_) => {
                    return Err(BackendError::AuthenticationFailed("invalid token".into()));
                }
                None => {
                    return Err(BackendError::AuthenticationFailed("missing token".into()));
                }
            }
        }
        self.context.record_session();
        Ok(BackendSession {
            context: Arc::clone(&self.context),
            kinds: BTreeSet::new(),
            feed: self.context.feed(),
            format: WireFormat::Binary,
        })
    }

    /// Records an upsert and pushes it to subscribers.
    pub fn publish_upsert(
        &self,
        kind: EntityKind,
        id: &str,
        status: EntityStatus,
        payload: Value,
    ) -> Envelope {
        let envelope = self.context.journal().upsert(kind, id, status, payload, None);
        self.context.publish(&envelope);
        envelope
    }

    /// Records a delete and pushes it to subscribers.
    pub fn publish_delete(&self, kind: EntityKind, id: &str) -> BackendResult<Envelope> {
        let envelope = self.context.journal().delete(kind, id, None)?;
        self.context.publish(&envelope);
        Ok(envelope)
    }

    /// Applies a mutation as if a client had sent it.
    pub fn apply_mutation(&self, request: fleetsync_protocol::MutationRequest) -> MutationResult {
        self.context.handle_mutation(request)
    }

    /// Answers a resync request.
    pub fn resync(&self, kind: EntityKind, since_revision: u64) -> ResyncBatch {
        self.context
            .handle_resync(ResyncRequest::new(kind, since_revision))
    }

    /// Makes the backend swallow mutations without answering.
    pub fn set_drop_mutations(&self, drop: bool) {
        self.context.set_drop_mutations(drop);
    }

    /// Sets whether confirming events echo correlation ids.
    pub fn set_echo_correlation(&self, echo: bool) {
        self.context.set_echo_correlation(echo);
    }

    /// Live entity by id.
    pub fn entity(&self, kind: EntityKind, id: &str) -> Option<Envelope> {
        self.context.journal().get(kind, id)
    }

    /// Live entities of a kind, ordered by id.
    pub fn snapshot(&self, kind: EntityKind) -> Vec<Envelope> {
        self.context.journal().live(kind)
    }

    /// Last revision assigned for a kind.
    pub fn high_water(&self, kind: EntityKind) -> u64 {
        self.context.journal().high_water(kind)
    }

    /// Moves every transitional entity of `kind` to `healthy`.
    pub fn settle_transitional(&self, kind: EntityKind) -> Vec<Envelope> {
        self.context.settle(kind)
    }

    /// Counters.
    pub fn stats(&self) -> BackendStats {
        self.context.stats()
    }
}

impl Default for BackendServer {
    fn default() -> Self {
        Self::new(BackendConfig::default())
    }
}

/// One client connection.
///
/// Answers client frames with [`handle`](Self::handle) and yields pushed
/// changes for the subscribed kinds with [`next_event`](Self::next_event).
#[derive(Debug)]
pub struct BackendSession {
    context: Arc<HandlerContext>,
    kinds: BTreeSet<EntityKind>,
    feed: broadcast::Receiver<Envelope>,
    format: WireFormat,
}

impl BackendSession {
    /// Kinds this session receives.
    pub fn kinds(&self) -> &BTreeSet<EntityKind> {
        &self.kinds
    }

    /// Wire format of the last client frame; replies use it too.
    pub fn format(&self) -> WireFormat {
        self.format
    }

    /// Handles one client frame and returns the replies.
    pub fn handle(&mut self, frame: ClientFrame) -> Vec<ServerFrame> {
        match frame {
            ClientFrame::Subscribe(request) => {
                let expected = self.context.config().protocol_version;
                if request.protocol_version != expected {
                    let err = BackendError::ProtocolMismatch {
                        expected,
                        actual: request.protocol_version,
                    };
                    warn!(error = %err, "refusing subscription");
                    return vec![ServerFrame::Error {
                        message: err.to_string(),
                    }];
                }
                self.kinds.extend(request.kinds);
                debug!(kinds = ?self.kinds, "session subscribed");
                Vec::new()
            }
            ClientFrame::Resync(request) => {
                vec![ServerFrame::ResyncBatch(self.context.handle_resync(request))]
            }
            ClientFrame::Mutation(request) => {
                let correlation_id = request.correlation_id;
                match self.context.handle_mutation(request) {
                    MutationResult::Rejected(reason) => {
                        vec![ServerFrame::MutationRejected(rejection(correlation_id, reason))]
                    }
                    // The change itself arrives through the feed.
                    MutationResult::Applied(_) | MutationResult::Dropped => Vec::new(),
                }
            }
            ClientFrame::Ping { nonce } => vec![ServerFrame::Pong { nonce }],
        }
    }

    /// Decodes a raw client message, handles it and encodes the replies.
    ///
    /// Undecodable input is answered with an `Error` frame.
    pub fn handle_raw(&mut self, raw: &RawMessage) -> Vec<RawMessage> {
        self.format = raw.format();
        let replies = match ClientFrame::decode(raw) {
            Ok(frame) => self.handle(frame),
            Err(e) => {
                warn!(error = %e, "undecodable client frame");
                vec![ServerFrame::Error {
                    message: e.to_string(),
                }]
            }
        };
        replies
            .iter()
            .filter_map(|frame| self.encode(frame))
            .collect()
    }

    /// Encodes a frame in the session's wire format.
    pub fn encode(&self, frame: &ServerFrame) -> Option<RawMessage> {
        match frame.encode(self.format) {
            Ok(raw) => Some(raw),
            Err(e) => {
                warn!(error = %e, "failed to encode server frame");
                None
            }
        }
    }

    /// Waits for the next pushed change of a subscribed kind.
    ///
    /// Returns `None` when the backend is gone or the session fell too far
    /// behind; the client recovers through resync after reconnecting.
    pub async fn next_event(&mut self) -> Option<Envelope> {
        loop {
            match self.feed.recv().await {
                Ok(envelope) if self.kinds.contains(&envelope.kind) => return Some(envelope),
                Ok(_) => continue,
                Err(RecvError::Lagged(missed)) => {
                    warn!(missed, "session lagging behind change feed");
                    return None;
                }
                Err(RecvError::Closed) => return None,
            }
        }
    }
}

fn rejection(correlation_id: CorrelationId, reason: String) -> MutationRejected {
    MutationRejected {
        correlation_id,
        reason,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use fleetsync_protocol::{MutationRequest, SubscribeRequest};
    use serde_json::json;

    fn subscribed(server: &BackendServer, kinds: Vec<EntityKind>) -> BackendSession {
        let mut session = server.session(None).unwrap();
        let replies = session.handle(ClientFrame::Subscribe(SubscribeRequest::new(kinds)));
        assert!(replies.is_empty());
        session
    }

    #[test]
    fn token_is_checked() {
        let server = BackendServer::new(BackendConfig::default().with_token("s3cret"));
        assert!(matches!(
            server.session(None),
            Err(BackendError::AuthenticationFailed(_))
        ));
        assert!(server.session(Some("wrong")).is_err());
        assert!(server.session(Some("s3cret")).is_ok());
        assert_eq!(server.stats().sessions, 1);
    }

    #[test]
    fn protocol_mismatch_is_refused() {
        let server = BackendServer::default();
        let mut session = server.session(None).unwrap();
        let replies = session.handle(ClientFrame::Subscribe(SubscribeRequest {
            kinds: vec![EntityKind::Cluster],
            protocol_version: 99,
        }));
        assert!(matches!(&replies[..], [ServerFrame::Error { .. }]));
        assert!(session.kinds().is_empty());
    }

    #[test]
    fn ping_and_resync() {
        let server = BackendServer::default();
        server.publish_upsert(EntityKind::Cluster, "eu-west", EntityStatus::Healthy, json!({}));
        let mut session = subscribed(&server, vec![EntityKind::Cluster]);

        assert_eq!(
            session.handle(ClientFrame::Ping { nonce: 9 }),
            vec![ServerFrame::Pong { nonce: 9 }]
        );

        let replies = session.handle(ClientFrame::Resync(ResyncRequest::new(EntityKind::Cluster, 0)));
        let [ServerFrame::ResyncBatch(batch)] = &replies[..] else {
            panic!("expected one batch");
        };
        assert_eq!(batch.envelopes.len(), 1);
    }

    #[test]
    fn rejected_mutation_is_answered() {
        let server = BackendServer::default();
        let mut session = subscribed(&server, vec![EntityKind::Deployment]);
        let correlation_id = CorrelationId::new();
        let replies = session.handle(ClientFrame::Mutation(MutationRequest {
            action_type: "scale".into(),
            kind: EntityKind::Deployment,
            entity_id: "missing".into(),
            payload: json!({}),
            correlation_id,
        }));
        let [ServerFrame::MutationRejected(rejected)] = &replies[..] else {
            panic!("expected rejection");
        };
        assert_eq!(rejected.correlation_id, correlation_id);
    }

    #[test]
    fn raw_frames_reply_in_client_format() {
        let server = BackendServer::default();
        let mut session = server.session(None).unwrap();

        let ping = ClientFrame::Ping { nonce: 1 }.encode(WireFormat::Text).unwrap();
        let replies = session.handle_raw(&ping);
        assert_eq!(replies.len(), 1);
        assert_eq!(replies[0].format(), WireFormat::Text);
        assert_eq!(
            ServerFrame::decode(&replies[0]).unwrap(),
            ServerFrame::Pong { nonce: 1 }
        );

        let replies = session.handle_raw(&RawMessage::Text("{not json".into()));
        assert!(matches!(
            ServerFrame::decode(&replies[0]).unwrap(),
            ServerFrame::Error { .. }
        ));
    }

    #[tokio::test]
    async fn feed_is_filtered_by_kind() {
        let server = BackendServer::default();
        let mut session = subscribed(&server, vec![EntityKind::Deployment]);

        server.publish_upsert(EntityKind::Cluster, "c", EntityStatus::Healthy, json!({}));
        let published =
            server.publish_upsert(EntityKind::Deployment, "d", EntityStatus::Healthy, json!({}));

        assert_eq!(session.next_event().await, Some(published));
    }

    #[tokio::test]
    async fn lagging_session_ends() {
        let server = BackendServer::new(BackendConfig::default().with_feed_capacity(2));
        let mut session = subscribed(&server, vec![EntityKind::Deployment]);
        for i in 0..5 {
            server.publish_upsert(
                EntityKind::Deployment,
                &format!("d{i}"),
                EntityStatus::Healthy,
                json!({}),
            );
        }
        assert_eq!(session.next_event().await, None);
    }

    #[test]
    fn publish_delete_requires_live_entity() {
        let server = BackendServer::default();
        assert!(server.publish_delete(EntityKind::Cluster, "ghost").is_err());
        server.publish_upsert(EntityKind::Cluster, "c", EntityStatus::Healthy, json!({}));
        let envelope = server.publish_delete(EntityKind::Cluster, "c").unwrap();
        assert_eq!(envelope.revision, 2);
        assert!(server.snapshot(EntityKind::Cluster).is_empty());
        assert_eq!(server.high_water(EntityKind::Cluster), 2);
    }
}
