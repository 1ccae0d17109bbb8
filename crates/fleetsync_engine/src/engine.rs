//! The sync engine driver.
//!
//! [`SyncEngine`] owns the connection and runs on a single task. It opens
//! channels through a [`Connector`], performs the subscribe and resync
//! handshake after every connect, feeds decoded frames into the
//! [`StateStore`], sends mutations, and times out predictions.
//! Applications talk to it through a cloneable [`EngineHandle`].

use crate::config::EngineConfig;
use crate::decoder::EventDecoder;
use crate::error::{SyncError, SyncResult};
use crate::ledger::{ExpiryReason, Mutation, MutationTicket};
use crate::router::{ConnectionEvent, Notification, SubscriptionHandle};
use crate::store::{EntityView, Snapshot, StateStore, StoreStats};
use crate::supervisor::{
    ConnectionState, HeartbeatAction, HeartbeatMonitor, ReconnectSupervisor, RetryPlan,
};
use crate::transport::{Channel, Connector};
use fleetsync_protocol::{
    ClientFrame, EntityKind, MutationRequest, RawMessage, ResyncRequest, ServerFrame,
    SubscribeRequest,
};
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::VecDeque;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::{sleep_until, Instant};
use tracing::{debug, info, warn};

type OpenFuture = Pin<Box<dyn Future<Output = SyncResult<Channel>> + Send>>;

/// Connection counters.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ConnectionStats {
    /// Successful opens.
    pub connects: u64,
    /// Live channels lost or closed.
    pub disconnects: u64,
    /// Failed opens.
    pub open_failures: u64,
    /// Inbound messages received.
    pub messages_received: u64,
    /// Inbound messages dropped as undecodable.
    pub decode_failures: u64,
    /// Most recent transport error.
    pub last_error: Option<String>,
}

/// Engine statistics.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SyncStats {
    /// Current connection state.
    pub state: ConnectionState,
    /// Store counters.
    pub store: StoreStats,
    /// Connection counters.
    pub connection: ConnectionStats,
    /// Mutations awaiting confirmation.
    pub pending_mutations: usize,
    /// Live subscriptions.
    pub subscriptions: usize,
}

struct Shared {
    store: StateStore,
    decoder: EventDecoder,
    connection: Mutex<ConnectionStats>,
    state: watch::Receiver<ConnectionState>,
}

enum Command {
    Submit(MutationRequest),
    Track(EntityKind),
    Close(oneshot::Sender<()>),
}

/// Cloneable handle to a running engine.
#[derive(Clone)]
pub struct EngineHandle {
    shared: Arc<Shared>,
    commands: mpsc::Sender<Command>,
}

impl EngineHandle {
    /// Registers a callback for changes to `kind`.
    pub fn subscribe<F>(&self, kind: EntityKind, callback: F) -> SubscriptionHandle
    where
        F: Fn(&Notification) + Send + Sync + 'static,
    {
        self.shared.store.router().subscribe(kind, callback)
    }

    /// Registers a callback for connection events.
    pub fn subscribe_connection<F>(&self, callback: F) -> SubscriptionHandle
    where
        F: Fn(&Notification) + Send + Sync + 'static,
    {
        self.shared.store.router().subscribe_connection(callback)
    }

    /// Removes a subscription. Safe to call more than once.
    pub fn unsubscribe(&self, handle: SubscriptionHandle) -> bool {
        self.shared.store.router().unsubscribe(handle)
    }

    /// Visible state of one kind, predictions included.
    pub fn snapshot(&self, kind: EntityKind) -> Snapshot {
        self.shared.store.snapshot(kind)
    }

    /// Visible state of one entity, predictions included.
    pub fn entity(&self, kind: EntityKind, id: &str) -> Option<EntityView> {
        self.shared.store.entity(kind, id)
    }

    /// Current connection state.
    pub fn connection_state(&self) -> ConnectionState {
        *self.shared.state.borrow()
    }

    /// Receiver that observes connection state changes.
    pub fn watch_connection(&self) -> watch::Receiver<ConnectionState> {
        self.shared.state.clone()
    }

    /// Applies a prediction locally and sends the mutation.
    ///
    /// The prediction is visible as soon as this returns. While
    /// disconnected the mutation waits in an outbox and is sent after the
    /// next handshake, unless it expires first.
    pub async fn mutate(&self, mutation: Mutation) -> SyncResult<MutationTicket> {
        let (request, ticket) = self
            .shared
            .store
            .begin_mutation(mutation, Instant::now().into_std());
        let correlation_id = request.correlation_id;
        if self.commands.send(Command::Submit(request)).await.is_err() {
            self.shared
                .store
                .expire(correlation_id, ExpiryReason::ConnectionClosed);
            return Err(SyncError::EngineStopped);
        }
        Ok(ticket)
    }

    /// Adds a kind to the subscription, resyncing it if connected.
    pub async fn track(&self, kind: EntityKind) -> SyncResult<()> {
        self.commands
            .send(Command::Track(kind))
            .await
            .map_err(|_| SyncError::EngineStopped)
    }

    /// Closes the connection and stops the engine.
    ///
    /// Pending mutations fail with [`SyncError::ConnectionClosed`]. Closing
    /// a stopped engine is a no-op.
    pub async fn close(&self) -> SyncResult<()> {
        let (reply, done) = oneshot::channel();
        if self.commands.send(Command::Close(reply)).await.is_err() {
            return Ok(());
        }
        let _ = done.await;
        Ok(())
    }

    /// Engine statistics.
    pub fn stats(&self) -> SyncStats {
        let mut connection = self.shared.connection.lock().clone();
        connection.decode_failures = self.shared.decoder.dropped();
        SyncStats {
            state: self.connection_state(),
            store: self.shared.store.stats(),
            connection,
            pending_mutations: self.shared.store.pending_count(),
            subscriptions: self.shared.store.router().subscription_count(),
        }
    }
}

/// The sync engine.
///
/// Create it, take as many [`EngineHandle`]s as needed, then drive it with
/// [`run`](Self::run) or [`spawn`](Self::spawn). The engine stops when
/// [`EngineHandle::close`] is called or every handle is dropped.
pub struct SyncEngine<C: Connector> {
    config: EngineConfig,
    connector: Arc<C>,
    supervisor: ReconnectSupervisor,
    handle: EngineHandle,
    commands: mpsc::Receiver<Command>,
}

impl<C: Connector> SyncEngine<C> {
    /// Creates an engine.
    pub fn new(config: EngineConfig, connector: C) -> SyncResult<Self> {
        config.validate()?;
        let supervisor = ReconnectSupervisor::new(config.backoff);
        Ok(Self::with_supervisor(config, connector, supervisor))
    }

    /// Creates an engine whose backoff jitter is seeded.
    pub fn with_seed(config: EngineConfig, connector: C, seed: u64) -> SyncResult<Self> {
        config.validate()?;
        let supervisor = ReconnectSupervisor::with_seed(config.backoff, seed);
        Ok(Self::with_supervisor(config, connector, supervisor))
    }

    fn with_supervisor(
        config: EngineConfig,
        connector: C,
        supervisor: ReconnectSupervisor,
    ) -> Self {
        let (tx, rx) = mpsc::channel(config.queue_capacity);
        let shared = Arc::new(Shared {
            store: StateStore::new(config.optimistic_timeout, config.confirm_window),
            decoder: EventDecoder::new(),
            connection: Mutex::new(ConnectionStats::default()),
            state: supervisor.watch(),
        });
        Self {
            config,
            connector: Arc::new(connector),
            supervisor,
            handle: EngineHandle {
                shared,
                commands: tx,
            },
            commands: rx,
        }
    }

    /// Returns a handle to this engine.
    pub fn handle(&self) -> EngineHandle {
        self.handle.clone()
    }

    /// Runs the engine on a new task.
    pub fn spawn(self) -> (EngineHandle, JoinHandle<SyncResult<()>>) {
        let handle = self.handle();
        (handle, tokio::spawn(self.run()))
    }

    /// Runs the engine until it is closed.
    pub async fn run(self) -> SyncResult<()> {
        let SyncEngine {
            config,
            connector,
            supervisor,
            handle,
            commands,
        } = self;
        // Only application handles keep the command channel open.
        let EngineHandle { shared, commands: own_sender } = handle;
        drop(own_sender);

        let driver = Driver {
            kinds: config.kinds.clone(),
            config,
            connector,
            supervisor,
            shared,
            commands,
            outbox: VecDeque::new(),
        };
        driver.run().await
    }
}

enum Phase {
    Idle,
    Waiting(Instant),
    Opening(OpenFuture),
    Live(Session),
}

struct Session {
    channel: Channel,
    heartbeat: Option<HeartbeatMonitor>,
}

enum PhaseEvent {
    RetryDue,
    Opened(SyncResult<Channel>),
    Inbound(Option<SyncResult<RawMessage>>),
}

async fn next_phase_event(phase: &mut Phase) -> PhaseEvent {
    match phase {
        Phase::Idle => std::future::pending().await,
        Phase::Waiting(until) => {
            sleep_until(*until).await;
            PhaseEvent::RetryDue
        }
        Phase::Opening(open) => PhaseEvent::Opened(open.await),
        Phase::Live(session) => PhaseEvent::Inbound(session.channel.recv().await),
    }
}

async fn sleep_until_some(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

struct Driver<C: Connector> {
    config: EngineConfig,
    connector: Arc<C>,
    supervisor: ReconnectSupervisor,
    shared: Arc<Shared>,
    commands: mpsc::Receiver<Command>,
    kinds: Vec<EntityKind>,
    outbox: VecDeque<MutationRequest>,
}

impl<C: Connector> Driver<C> {
    async fn run(mut self) -> SyncResult<()> {
        info!(endpoint = %self.config.endpoint, kinds = ?self.kinds, "sync engine starting");
        let mut phase = self.start_open()?;

        loop {
            let expiry = self.shared.store.next_expiry().map(Instant::from_std);
            let heartbeat = match &phase {
                Phase::Live(session) => session
                    .heartbeat
                    .as_ref()
                    .map(|monitor| Instant::from_std(monitor.next_deadline())),
                _ => None,
            };

            tokio::select! {
                command = self.commands.recv() => match command {
                    Some(command) => match self.on_command(command, phase).await? {
                        Some(next) => phase = next,
                        None => return Ok(()),
                    },
                    None => {
                        self.shutdown(phase);
                        return Ok(());
                    }
                },
                event = next_phase_event(&mut phase) => {
                    phase = self.on_phase_event(event, phase).await?;
                }
                _ = sleep_until_some(expiry) => {
                    self.shared.store.expire_due(Instant::now().into_std());
                }
                _ = sleep_until_some(heartbeat) => {
                    phase = self.on_heartbeat(phase).await?;
                }
            }
        }
    }

    fn start_open(&mut self) -> SyncResult<Phase> {
        self.supervisor.begin_connect()?;
        self.publish_connection(None, false);

        let connector = self.connector.clone();
        let endpoint = self.config.endpoint.clone();
        let credentials = self.config.credentials.clone();
        let capacity = self.config.queue_capacity;
        debug!(%endpoint, "opening channel");
        Ok(Phase::Opening(Box::pin(async move {
            connector.open(&endpoint, &credentials, capacity).await
        })))
    }

    async fn on_phase_event(&mut self, event: PhaseEvent, phase: Phase) -> SyncResult<Phase> {
        match event {
            PhaseEvent::RetryDue => self.start_open(),
            PhaseEvent::Opened(Ok(channel)) => self.on_connected(channel).await,
            PhaseEvent::Opened(Err(error)) => {
                {
                    let mut stats = self.shared.connection.lock();
                    stats.open_failures += 1;
                    stats.last_error = Some(error.to_string());
                }
                let plan = self.supervisor.on_open_failed(&error)?;
                Ok(self.schedule_retry(plan))
            }
            PhaseEvent::Inbound(Some(Ok(raw))) => match phase {
                Phase::Live(mut session) => {
                    self.on_inbound(&mut session, raw)?;
                    Ok(Phase::Live(session))
                }
                other => Ok(other),
            },
            PhaseEvent::Inbound(Some(Err(error))) => self.on_session_lost(phase, Some(error)),
            PhaseEvent::Inbound(None) => self.on_session_lost(phase, None),
        }
    }

    async fn on_connected(&mut self, channel: Channel) -> SyncResult<Phase> {
        self.supervisor.on_open_succeeded()?;
        self.shared.connection.lock().connects += 1;
        info!(endpoint = %self.config.endpoint, "connected");
        self.publish_connection(None, false);

        let now = Instant::now().into_std();
        let session = Session {
            channel,
            heartbeat: self
                .config
                .heartbeat
                .map(|config| HeartbeatMonitor::new(config, now)),
        };
        if let Err(error) = self.handshake(&session).await {
            return self.on_session_lost(Phase::Live(session), Some(error));
        }
        Ok(Phase::Live(session))
    }

    /// Subscribes, asks for everything missed since the last seen revision
    /// of each kind, then sends mutations queued while disconnected.
    async fn handshake(&mut self, session: &Session) -> SyncResult<()> {
        let subscribe = ClientFrame::Subscribe(SubscribeRequest {
            kinds: self.kinds.clone(),
            protocol_version: self.config.protocol_version,
        });
        self.send(session, &subscribe).await?;

        self.shared.store.begin_catch_up();
        for kind in self.kinds.clone() {
            let since = self.shared.store.resume_revision(kind);
            debug!(%kind, since, "requesting resync");
            self.send(session, &ClientFrame::Resync(ResyncRequest::new(kind, since)))
                .await?;
        }

        while let Some(request) = self.outbox.pop_front() {
            if !self.shared.store.is_pending(&request.correlation_id) {
                continue;
            }
            let frame = ClientFrame::Mutation(request);
            if let Err(error) = self.send(session, &frame).await {
                if let ClientFrame::Mutation(request) = frame {
                    self.outbox.push_front(request);
                }
                return Err(error);
            }
        }
        Ok(())
    }

    fn on_inbound(&mut self, session: &mut Session, raw: RawMessage) -> SyncResult<()> {
        let now = Instant::now().into_std();
        if let Some(monitor) = session.heartbeat.as_mut() {
            if monitor.record_inbound(now) {
                self.supervisor.mark_recovered()?;
                self.publish_connection(None, false);
            }
        }
        self.shared.connection.lock().messages_received += 1;

        let Some(frame) = self.shared.decoder.decode_or_drop(&raw) else {
            return Ok(());
        };
        if !matches!(frame, ServerFrame::Error { .. }) {
            self.supervisor.on_session_healthy();
        }
        match frame {
            ServerFrame::Event(envelope) => {
                self.shared.store.apply_event(&envelope, now);
            }
            ServerFrame::ResyncBatch(batch) => {
                self.shared.store.apply_resync(&batch, now);
            }
            ServerFrame::MutationRejected(rejected) => {
                let correlation_id = rejected.correlation_id;
                if !self.shared.store.reject(correlation_id, rejected.reason) {
                    debug!(%correlation_id, "rejection for a mutation that is no longer pending");
                }
            }
            ServerFrame::Pong { nonce } => debug!(nonce, "pong"),
            ServerFrame::Error { message } => warn!(%message, "backend reported an error"),
        }
        Ok(())
    }

    fn on_session_lost(&mut self, phase: Phase, error: Option<SyncError>) -> SyncResult<Phase> {
        if let Phase::Live(mut session) = phase {
            session.channel.close();
        }
        {
            let mut stats = self.shared.connection.lock();
            stats.disconnects += 1;
            if let Some(error) = &error {
                stats.last_error = Some(error.to_string());
            }
        }
        match &error {
            Some(error) => warn!(%error, "connection lost"),
            None => info!("backend closed the connection"),
        }
        let plan = self.supervisor.on_session_lost()?;
        Ok(self.schedule_retry(plan))
    }

    fn schedule_retry(&mut self, plan: RetryPlan) -> Phase {
        self.publish_connection(Some(plan.delay), plan.persistent);
        Phase::Waiting(Instant::now() + plan.delay)
    }

    async fn on_command(&mut self, command: Command, phase: Phase) -> SyncResult<Option<Phase>> {
        match command {
            Command::Submit(request) => match &phase {
                Phase::Live(session) => {
                    let frame = ClientFrame::Mutation(request);
                    if let Err(error) = self.send(session, &frame).await {
                        debug!(%error, "mutation send failed, queueing");
                        if let ClientFrame::Mutation(request) = frame {
                            self.outbox.push_back(request);
                        }
                    }
                }
                _ => {
                    debug!(correlation_id = %request.correlation_id, "not connected, queueing mutation");
                    self.outbox.push_back(request);
                }
            },
            Command::Track(kind) => {
                if !self.kinds.contains(&kind) {
                    self.kinds.push(kind);
                    info!(%kind, "tracking kind");
                    if let Phase::Live(session) = &phase {
                        let since = self.shared.store.resume_revision(kind);
                        let subscribe = ClientFrame::Subscribe(SubscribeRequest {
                            kinds: vec![kind],
                            protocol_version: self.config.protocol_version,
                        });
                        let resync = ClientFrame::Resync(ResyncRequest::new(kind, since));
                        if let Err(error) = self.send(session, &subscribe).await {
                            debug!(%error, "subscribe send failed");
                        } else if let Err(error) = self.send(session, &resync).await {
                            debug!(%error, "resync send failed");
                        }
                    }
                }
            }
            Command::Close(reply) => {
                self.shutdown(phase);
                let _ = reply.send(());
                return Ok(None);
            }
        }
        Ok(Some(phase))
    }

    async fn on_heartbeat(&mut self, phase: Phase) -> SyncResult<Phase> {
        let mut session = match phase {
            Phase::Live(session) => session,
            other => return Ok(other),
        };
        let action = match session.heartbeat.as_mut() {
            Some(monitor) => monitor.poll(Instant::now().into_std()),
            None => return Ok(Phase::Live(session)),
        };

        match action {
            HeartbeatAction::Idle => {}
            HeartbeatAction::SendPing(nonce) => {
                if let Err(error) = self.send(&session, &ClientFrame::Ping { nonce }).await {
                    return self.on_session_lost(Phase::Live(session), Some(error));
                }
            }
            HeartbeatAction::Degrade => {
                self.supervisor.mark_degraded()?;
                self.publish_connection(None, false);
            }
            HeartbeatAction::Drop => {
                let error = SyncError::transport_retryable("heartbeat timed out");
                return self.on_session_lost(Phase::Live(session), Some(error));
            }
        }
        Ok(Phase::Live(session))
    }

    fn shutdown(&mut self, phase: Phase) {
        if let Phase::Live(mut session) = phase {
            session.channel.close();
            self.shared.connection.lock().disconnects += 1;
        }
        let flushed = self.shared.store.flush(ExpiryReason::ConnectionClosed);
        self.outbox.clear();
        self.supervisor.close();
        self.publish_connection(None, false);
        info!(flushed, "sync engine closed");
    }

    async fn send(&self, session: &Session, frame: &ClientFrame) -> SyncResult<()> {
        let raw = frame.encode(self.config.wire_format)?;
        session.channel.send(raw).await
    }

    fn publish_connection(&self, retry_in: Option<Duration>, persistent_failure: bool) {
        self.shared
            .store
            .router()
            .publish(Notification::Connection(ConnectionEvent {
                state: self.supervisor.state(),
                consecutive_failures: self.supervisor.consecutive_failures(),
                persistent_failure,
                retry_in,
            }));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ledger::{MutationOutcome, Prediction};
    use crate::transport::{MemoryConnection, MemoryConnector, MemoryListener};
    use fleetsync_protocol::{EntityStatus, Envelope, ResyncBatch, WireFormat};
    use serde_json::json;

    fn config() -> EngineConfig {
        EngineConfig::new("mem://backend")
            .with_kinds([EntityKind::Deployment, EntityKind::Cluster])
            .with_wire_format(WireFormat::Text)
            .without_heartbeat()
    }

    async fn start(
        config: EngineConfig,
    ) -> (EngineHandle, MemoryConnector, MemoryListener, JoinHandle<SyncResult<()>>) {
        let (connector, listener) = MemoryConnector::new();
        let engine = SyncEngine::with_seed(config, connector.clone(), 1).unwrap();
        let (handle, task) = engine.spawn();
        (handle, connector, listener, task)
    }

    async fn next_frame(connection: &mut MemoryConnection) -> ClientFrame {
        let raw = connection.peer.next_outbound().await.unwrap();
        ClientFrame::decode(&raw).unwrap()
    }

    async fn push(connection: &MemoryConnection, frame: ServerFrame) {
        let raw = frame.encode(WireFormat::Binary).unwrap();
        connection.peer.deliver(raw).await.unwrap();
    }

    async fn settle() {
        for _ in 0..10 {
            tokio::task::yield_now().await;
        }
    }

    #[tokio::test(start_paused = true)]
    async fn handshake_subscribes_then_resyncs_each_kind() {
        let (handle, _connector, mut listener, task) = start(config()).await;
        let mut connection = listener.accept().await.unwrap();
        assert_eq!(connection.endpoint, "mem://backend");

        match next_frame(&mut connection).await {
            ClientFrame::Subscribe(request) => {
                assert_eq!(request.kinds, vec![EntityKind::Deployment, EntityKind::Cluster])
            }
            other => panic!("expected subscribe, got {other:?}"),
        }
        assert_eq!(
            next_frame(&mut connection).await,
            ClientFrame::Resync(ResyncRequest::new(EntityKind::Deployment, 0))
        );
        assert_eq!(
            next_frame(&mut connection).await,
            ClientFrame::Resync(ResyncRequest::new(EntityKind::Cluster, 0))
        );
        assert_eq!(handle.connection_state(), ConnectionState::Connected);

        handle.close().await.unwrap();
        task.await.unwrap().unwrap();
        assert_eq!(handle.connection_state(), ConnectionState::Disconnected);
    }

    #[tokio::test(start_paused = true)]
    async fn events_reach_subscribers() {
        let (handle, _connector, mut listener, _task) = start(config()).await;
        let seen = Arc::new(Mutex::new(Vec::new()));
        {
            let seen = seen.clone();
            handle.subscribe(EntityKind::Deployment, move |n| seen.lock().push(n.clone()));
        }
        let connection = listener.accept().await.unwrap();

        push(
            &connection,
            ServerFrame::Event(Envelope::upsert(
                EntityKind::Deployment,
                "deployment-42",
                3,
                EntityStatus::Healthy,
                json!({ "replicas": 3 }),
            )),
        )
        .await;
        settle().await;

        let view = handle.entity(EntityKind::Deployment, "deployment-42").unwrap();
        assert_eq!(view.entity.revision, 3);
        assert_eq!(seen.lock().len(), 1);
        assert_eq!(handle.stats().store.events_applied, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn mutation_queued_while_disconnected_is_sent_after_handshake() {
        let (handle, connector, mut listener, _task) = start(config()).await;

        // Drop the first connection and refuse reopening so the engine stays
        // disconnected.
        let first = listener.accept().await.unwrap();
        connector.set_refusing(true);
        drop(first);
        settle().await;

        let ticket = handle
            .mutate(Mutation::new(
                "restart",
                EntityKind::Deployment,
                "deployment-42",
                Prediction::Upsert {
                    status: EntityStatus::Progressing,
                    payload: json!({}),
                },
            ))
            .await
            .unwrap();
        assert!(handle
            .entity(EntityKind::Deployment, "deployment-42")
            .unwrap()
            .is_optimistic());

        connector.set_refusing(false);
        let mut connection = listener.accept().await.unwrap();
        let mut frames = Vec::new();
        for _ in 0..4 {
            frames.push(next_frame(&mut connection).await);
        }
        match &frames[3] {
            ClientFrame::Mutation(request) => {
                assert_eq!(request.correlation_id, ticket.correlation_id());
                assert_eq!(request.action_type, "restart");
            }
            other => panic!("expected mutation, got {other:?}"),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn rejection_fails_ticket() {
        let (handle, _connector, mut listener, _task) = start(config()).await;
        let mut connection = listener.accept().await.unwrap();
        for _ in 0..3 {
            next_frame(&mut connection).await;
        }

        let ticket = handle
            .mutate(Mutation::new(
                "delete",
                EntityKind::Cluster,
                "eu-west",
                Prediction::Delete,
            ))
            .await
            .unwrap();
        let ClientFrame::Mutation(request) = next_frame(&mut connection).await else {
            panic!("expected mutation");
        };
        push(
            &connection,
            ServerFrame::MutationRejected(fleetsync_protocol::MutationRejected {
                correlation_id: request.correlation_id,
                reason: "cluster has running deployments".into(),
            }),
        )
        .await;

        match ticket.outcome().await {
            MutationOutcome::Failed(SyncError::MutationRejected { reason, .. }) => {
                assert_eq!(reason, "cluster has running deployments")
            }
            other => panic!("unexpected outcome {other:?}"),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn reconnect_resumes_after_last_resync() {
        let (handle, _connector, mut listener, _task) = start(config()).await;
        let connection = listener.accept().await.unwrap();
        push(
            &connection,
            ServerFrame::ResyncBatch(ResyncBatch::new(
                EntityKind::Deployment,
                0,
                vec![Envelope::upsert(
                    EntityKind::Deployment,
                    "a",
                    7,
                    EntityStatus::Healthy,
                    json!({}),
                )],
            )),
        )
        .await;
        settle().await;
        drop(connection);

        let mut second = listener.accept().await.unwrap();
        next_frame(&mut second).await;
        assert_eq!(
            next_frame(&mut second).await,
            ClientFrame::Resync(ResyncRequest::new(EntityKind::Deployment, 7))
        );
        assert_eq!(handle.stats().connection.connects, 2);
        assert_eq!(handle.stats().connection.disconnects, 1);
    }

    fn deployment(id: &str, revision: u64) -> Envelope {
        Envelope::upsert(
            EntityKind::Deployment,
            id,
            revision,
            EntityStatus::Healthy,
            json!({}),
        )
    }

    #[tokio::test(start_paused = true)]
    async fn live_event_ahead_of_resync_batch_keeps_resume_point() {
        let (handle, _connector, mut listener, _task) = start(config()).await;

        let first = listener.accept().await.unwrap();
        push(
            &first,
            ServerFrame::ResyncBatch(ResyncBatch::new(
                EntityKind::Deployment,
                0,
                vec![deployment("a", 5)],
            )),
        )
        .await;
        settle().await;
        drop(first);

        // The session ends before its resync batch arrives.
        let mut second = listener.accept().await.unwrap();
        next_frame(&mut second).await;
        assert_eq!(
            next_frame(&mut second).await,
            ClientFrame::Resync(ResyncRequest::new(EntityKind::Deployment, 5))
        );
        push(&second, ServerFrame::Event(deployment("b", 8))).await;
        settle().await;
        assert_eq!(handle.entity(EntityKind::Deployment, "b").unwrap().entity.revision, 8);
        drop(second);

        let mut third = listener.accept().await.unwrap();
        next_frame(&mut third).await;
        assert_eq!(
            next_frame(&mut third).await,
            ClientFrame::Resync(ResyncRequest::new(EntityKind::Deployment, 5))
        );

        // Once the batch lands, live events move the resume point again.
        push(
            &third,
            ServerFrame::ResyncBatch(ResyncBatch::new(
                EntityKind::Deployment,
                5,
                vec![deployment("c", 7), deployment("b", 8)],
            )),
        )
        .await;
        push(&third, ServerFrame::Event(deployment("c", 9))).await;
        settle().await;
        drop(third);

        let mut fourth = listener.accept().await.unwrap();
        next_frame(&mut fourth).await;
        assert_eq!(
            next_frame(&mut fourth).await,
            ClientFrame::Resync(ResyncRequest::new(EntityKind::Deployment, 9))
        );
    }

    fn assert_secs(elapsed: Duration, secs: u64) {
        let expected = Duration::from_secs(secs);
        assert!(
            elapsed >= expected && elapsed < expected + Duration::from_millis(50),
            "elapsed {elapsed:?}, expected about {expected:?}"
        );
    }

    #[tokio::test(start_paused = true)]
    async fn heartbeat_degrades_recovers_and_drops() {
        let heartbeat = crate::config::HeartbeatConfig {
            interval: Duration::from_secs(5),
            timeout: Duration::from_secs(2),
            degraded_timeout: Duration::from_secs(4),
        };
        let config = EngineConfig::new("mem://backend")
            .with_kinds([EntityKind::Deployment])
            .with_wire_format(WireFormat::Text)
            .with_heartbeat(heartbeat);
        let (handle, _connector, mut listener, _task) = start(config).await;
        let states = Arc::new(Mutex::new(Vec::new()));
        {
            let states = states.clone();
            handle.subscribe_connection(move |n| {
                if let Notification::Connection(event) = n {
                    states.lock().push(event.state);
                }
            });
        }
        let mut state = handle.watch_connection();

        let mut connection = listener.accept().await.unwrap();
        let started = Instant::now();
        for _ in 0..2 {
            next_frame(&mut connection).await;
        }
        push(
            &connection,
            ServerFrame::ResyncBatch(ResyncBatch::new(EntityKind::Deployment, 0, Vec::new())),
        )
        .await;

        assert_eq!(next_frame(&mut connection).await, ClientFrame::Ping { nonce: 1 });
        assert_secs(started.elapsed(), 5);

        state
            .wait_for(|s| *s == ConnectionState::Degraded)
            .await
            .unwrap();
        assert_secs(started.elapsed(), 7);

        // Any inbound frame proves liveness.
        push(&connection, ServerFrame::Pong { nonce: 1 }).await;
        settle().await;
        assert_eq!(handle.connection_state(), ConnectionState::Connected);

        assert_eq!(next_frame(&mut connection).await, ClientFrame::Ping { nonce: 2 });
        assert_secs(started.elapsed(), 12);

        // Silence until the degraded timeout drops the session.
        let mut second = listener.accept().await.unwrap();
        assert_secs(started.elapsed(), 18);
        assert!(matches!(next_frame(&mut second).await, ClientFrame::Subscribe(_)));
        settle().await;

        assert_eq!(
            *states.lock(),
            vec![
                ConnectionState::Connecting,
                ConnectionState::Connected,
                ConnectionState::Degraded,
                ConnectionState::Connected,
                ConnectionState::Degraded,
                ConnectionState::Disconnected,
                ConnectionState::Connecting,
                ConnectionState::Connected,
            ]
        );
        let stats = handle.stats();
        assert_eq!(stats.connection.disconnects, 1);
        assert_eq!(stats.connection.connects, 2);
        assert_eq!(
            stats.connection.last_error.as_deref(),
            Some("transport error: heartbeat timed out")
        );
    }

    struct RecordingConnector {
        inner: MemoryConnector,
        capacities: Arc<Mutex<Vec<usize>>>,
    }

    #[async_trait::async_trait]
    impl Connector for RecordingConnector {
        async fn open(
            &self,
            endpoint: &str,
            credentials: &crate::config::Credentials,
            capacity: usize,
        ) -> SyncResult<Channel> {
            self.capacities.lock().push(capacity);
            self.inner.open(endpoint, credentials, capacity).await
        }
    }

    #[tokio::test(start_paused = true)]
    async fn queue_capacity_bounds_opened_channels() {
        let (inner, mut listener) = MemoryConnector::new();
        let capacities = Arc::new(Mutex::new(Vec::new()));
        let connector = RecordingConnector {
            inner,
            capacities: capacities.clone(),
        };
        let config = config().with_queue_capacity(2);
        let engine = SyncEngine::new(config, connector).unwrap();
        let (handle, _task) = engine.spawn();

        let mut connection = listener.accept().await.unwrap();
        assert_eq!(*capacities.lock(), vec![2]);
        for _ in 0..3 {
            next_frame(&mut connection).await;
        }

        // A full inbound queue holds the backend back until the engine reads.
        for revision in 1..=20 {
            push(&connection, ServerFrame::Event(deployment("a", revision))).await;
        }
        settle().await;
        assert_eq!(handle.entity(EntityKind::Deployment, "a").unwrap().entity.revision, 20);
        assert_eq!(handle.stats().store.events_applied, 20);
    }

    #[tokio::test(start_paused = true)]
    async fn undecodable_message_is_counted_and_skipped() {
        let (handle, _connector, mut listener, _task) = start(config()).await;
        let connection = listener.accept().await.unwrap();
        connection
            .peer
            .deliver(RawMessage::Text("not a frame".into()))
            .await
            .unwrap();
        push(&connection, ServerFrame::Pong { nonce: 1 }).await;
        settle().await;

        let stats = handle.stats();
        assert_eq!(stats.connection.decode_failures, 1);
        assert_eq!(stats.connection.messages_received, 2);
        assert_eq!(stats.state, ConnectionState::Connected);
    }

    #[tokio::test(start_paused = true)]
    async fn close_after_stop_is_noop() {
        let (handle, _connector, _listener, task) = start(config()).await;
        handle.close().await.unwrap();
        task.await.unwrap().unwrap();
        handle.close().await.unwrap();
        assert!(matches!(
            handle.track(EntityKind::Organization).await,
            Err(SyncError::EngineStopped)
        ));
    }
}
