//! Transport channel abstraction.
//!
//! A [`Channel`] is one duplex connection to the backend: raw messages in,
//! raw messages out. It is produced by a [`Connector`] and is not
//! restartable; once closed or errored, the supervisor opens a new one.

use crate::config::Credentials;
use crate::error::{SyncError, SyncResult};
use async_trait::async_trait;
use fleetsync_protocol::RawMessage;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tracing::debug;

/// Opens transport channels.
///
/// This trait abstracts the network layer, allowing for different
/// implementations (WebSocket, gRPC-Web streaming, SSE, in-memory for
/// testing).
#[async_trait]
pub trait Connector: Send + Sync + 'static {
    /// Opens a channel to `endpoint` whose inbound queue holds at most
    /// `capacity` messages.
    async fn open(
        &self,
        endpoint: &str,
        credentials: &Credentials,
        capacity: usize,
    ) -> SyncResult<Channel>;
}

/// Client side of a duplex connection.
///
/// `recv` yields inbound messages until the peer hangs up, an error is
/// delivered, or the channel is closed. Closing is idempotent and also
/// happens on drop.
pub struct Channel {
    outbound: Option<mpsc::Sender<RawMessage>>,
    inbound: mpsc::Receiver<SyncResult<RawMessage>>,
}

impl Channel {
    /// Creates a connected channel and its peer end.
    ///
    /// `capacity` bounds the inbound queue: when it is full the peer's
    /// `deliver` waits, which is how connectors stop reading from the
    /// network.
    pub fn pair(capacity: usize) -> (Channel, ChannelPeer) {
        let (out_tx, out_rx) = mpsc::channel(capacity.max(1));
        let (in_tx, in_rx) = mpsc::channel(capacity.max(1));
        let channel = Channel {
            outbound: Some(out_tx),
            inbound: in_rx,
        };
        let peer = ChannelPeer {
            sender: PeerSender { inbound: in_tx },
            receiver: PeerReceiver { outbound: out_rx },
        };
        (channel, peer)
    }

    /// Sends a message to the backend.
    pub async fn send(&self, message: RawMessage) -> SyncResult<()> {
        let outbound = self.outbound.as_ref().ok_or(SyncError::NotConnected)?;
        outbound
            .send(message)
            .await
            .map_err(|_| SyncError::transport_retryable("channel closed by peer"))
    }

    /// Receives the next inbound message.
    ///
    /// Returns `None` once the channel is closed or the peer is gone.
    pub async fn recv(&mut self) -> Option<SyncResult<RawMessage>> {
        if self.outbound.is_none() {
            return None;
        }
        self.inbound.recv().await
    }

    /// Closes the channel. Safe to call more than once.
    pub fn close(&mut self) {
        if self.outbound.take().is_some() {
            self.inbound.close();
        }
    }

    /// Returns true once the channel is closed on either side.
    pub fn is_closed(&self) -> bool {
        match &self.outbound {
            Some(outbound) => outbound.is_closed(),
            None => true,
        }
    }
}

impl Drop for Channel {
    fn drop(&mut self) {
        self.close();
    }
}

/// Backend side of a [`Channel`], held by connector pumps and tests.
pub struct ChannelPeer {
    sender: PeerSender,
    receiver: PeerReceiver,
}

impl ChannelPeer {
    /// Splits into independently owned halves.
    pub fn split(self) -> (PeerSender, PeerReceiver) {
        (self.sender, self.receiver)
    }

    /// Delivers a message to the client.
    pub async fn deliver(&self, message: RawMessage) -> SyncResult<()> {
        self.sender.deliver(message).await
    }

    /// Delivers a transport error to the client.
    pub async fn fail(&self, error: SyncError) {
        self.sender.fail(error).await
    }

    /// Next message sent by the client, or `None` once the client closed.
    pub async fn next_outbound(&mut self) -> Option<RawMessage> {
        self.receiver.next_outbound().await
    }
}

/// Delivering half of a [`ChannelPeer`].
#[derive(Clone)]
pub struct PeerSender {
    inbound: mpsc::Sender<SyncResult<RawMessage>>,
}

impl PeerSender {
    /// Delivers a message, waiting while the client's queue is full.
    pub async fn deliver(&self, message: RawMessage) -> SyncResult<()> {
        match self.inbound.try_send(Ok(message)) {
            Ok(()) => Ok(()),
            Err(TrySendError::Full(item)) => {
                debug!("inbound queue full, pausing reads");
                self.inbound
                    .send(item)
                    .await
                    .map_err(|_| SyncError::transport_retryable("channel closed"))
            }
            Err(TrySendError::Closed(_)) => Err(SyncError::transport_retryable("channel closed")),
        }
    }

    /// Delivers a transport error to the client.
    pub async fn fail(&self, error: SyncError) {
        let _ = self.inbound.send(Err(error)).await;
    }

    /// Resolves once the client has closed or dropped its channel.
    pub async fn closed(&self) {
        self.inbound.closed().await
    }

    /// Returns true once the client has closed or dropped its channel.
    pub fn is_closed(&self) -> bool {
        self.inbound.is_closed()
    }
}

/// Receiving half of a [`ChannelPeer`].
pub struct PeerReceiver {
    outbound: mpsc::Receiver<RawMessage>,
}

impl PeerReceiver {
    /// Next message sent by the client, or `None` once the client closed.
    pub async fn next_outbound(&mut self) -> Option<RawMessage> {
        self.outbound.recv().await
    }
}

/// A connection accepted by a [`MemoryListener`].
pub struct MemoryConnection {
    /// Endpoint the client asked for.
    pub endpoint: String,
    /// Token the client presented.
    pub token: Option<String>,
    /// Backend end of the channel.
    pub peer: ChannelPeer,
}

/// In-process connector for tests and embedding.
///
/// Every successful open hands a [`MemoryConnection`] to the paired
/// [`MemoryListener`]. Opens can be scripted to fail.
#[derive(Clone)]
pub struct MemoryConnector {
    inner: Arc<MemoryConnectorInner>,
}

struct MemoryConnectorInner {
    accepted: mpsc::UnboundedSender<MemoryConnection>,
    fail_remaining: Mutex<u32>,
    refusing: AtomicBool,
    opens: AtomicU64,
}

impl MemoryConnector {
    /// Creates a connector and the listener that receives its connections.
    pub fn new() -> (Self, MemoryListener) {
        let (tx, rx) = mpsc::unbounded_channel();
        let connector = Self {
            inner: Arc::new(MemoryConnectorInner {
                accepted: tx,
                fail_remaining: Mutex::new(0),
                refusing: AtomicBool::new(false),
                opens: AtomicU64::new(0),
            }),
        };
        (connector, MemoryListener { accepted: rx })
    }

    /// Makes the next `count` opens fail.
    pub fn fail_next(&self, count: u32) {
        *self.inner.fail_remaining.lock() = count;
    }

    /// Refuses every open until called again with `false`.
    pub fn set_refusing(&self, refusing: bool) {
        self.inner.refusing.store(refusing, Ordering::SeqCst);
    }

    /// Number of open attempts so far.
    pub fn open_count(&self) -> u64 {
        self.inner.opens.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Connector for MemoryConnector {
    async fn open(
        &self,
        endpoint: &str,
        credentials: &Credentials,
        capacity: usize,
    ) -> SyncResult<Channel> {
        self.inner.opens.fetch_add(1, Ordering::SeqCst);

        if self.inner.refusing.load(Ordering::SeqCst) {
            return Err(SyncError::transport_retryable("connection refused"));
        }
        {
            let mut remaining = self.inner.fail_remaining.lock();
            if *remaining > 0 {
                *remaining -= 1;
                return Err(SyncError::transport_retryable("connection refused"));
            }
        }

        let (channel, peer) = Channel::pair(capacity);
        let connection = MemoryConnection {
            endpoint: endpoint.to_string(),
            token: credentials.token(),
            peer,
        };
        self.inner
            .accepted
            .send(connection)
            .map_err(|_| SyncError::transport_retryable("listener dropped"))?;
        Ok(channel)
    }
}

/// Receives connections opened through a [`MemoryConnector`].
pub struct MemoryListener {
    accepted: mpsc::UnboundedReceiver<MemoryConnection>,
}

impl MemoryListener {
    /// Waits for the next connection.
    pub async fn accept(&mut self) -> Option<MemoryConnection> {
        self.accepted.recv().await
    }

    /// Returns an already opened connection without waiting.
    pub fn try_accept(&mut self) -> Option<MemoryConnection> {
        self.accepted.try_recv().ok()
    }
}
