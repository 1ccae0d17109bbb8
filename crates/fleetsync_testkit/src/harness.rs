//! Wiring between the engine's in-memory transport and the reference
//! backend.

use fleetsync_backend::{BackendServer, BackendSession};
use fleetsync_engine::{MemoryConnection, MemoryListener, PeerSender};
use fleetsync_protocol::{RawMessage, ServerFrame, WireFormat};
use std::sync::Arc;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tracing::debug;

/// Serves one in-memory connection until either side goes away.
///
/// Client frames are answered by a [`BackendSession`]; pushed changes for
/// the subscribed kinds are forwarded as they are published. A rejected
/// token is answered with an `Error` frame and the connection is dropped.
pub async fn serve_connection(server: BackendServer, connection: MemoryConnection) {
    let MemoryConnection { token, peer, .. } = connection;
    let (sender, mut receiver) = peer.split();

    let mut session = match server.session(token.as_deref()) {
        Ok(session) => session,
        Err(e) => {
            let frame = ServerFrame::Error {
                message: e.to_string(),
            };
            if let Ok(raw) = frame.encode(WireFormat::Binary) {
                let _ = sender.deliver(raw).await;
            }
            return;
        }
    };

    loop {
        tokio::select! {
            outbound = receiver.next_outbound() => match outbound {
                Some(raw) => {
                    if !forward(&sender, session.handle_raw(&raw)).await {
                        break;
                    }
                }
                None => break,
            },
            event = session.next_event() => match event {
                Some(envelope) => {
                    let replies = encode_event(&session, envelope);
                    if !forward(&sender, replies).await {
                        break;
                    }
                }
                None => break,
            },
        }
    }
    debug!("memory session ended");
}

fn encode_event(session: &BackendSession, envelope: fleetsync_protocol::Envelope) -> Vec<RawMessage> {
    session
        .encode(&ServerFrame::Event(envelope))
        .into_iter()
        .collect()
}

async fn forward(sender: &PeerSender, messages: Vec<RawMessage>) -> bool {
    for message in messages {
        if sender.deliver(message).await.is_err() {
            return false;
        }
    }
    true
}

/// A backend accepting every connection opened through a
/// [`MemoryConnector`](fleetsync_engine::MemoryConnector).
pub struct TestBackend {
    server: BackendServer,
    kill: Arc<Notify>,
    task: JoinHandle<()>,
}

impl TestBackend {
    /// Starts serving connections from `listener`.
    pub fn spawn(server: BackendServer, mut listener: MemoryListener) -> Self {
        let kill = Arc::new(Notify::new());
        let accept_server = server.clone();
        let accept_kill = Arc::clone(&kill);
        let task = tokio::spawn(async move {
            while let Some(connection) = listener.accept().await {
                let server = accept_server.clone();
                let kill = Arc::clone(&accept_kill);
                tokio::spawn(async move {
                    tokio::select! {
                        _ = serve_connection(server, connection) => {}
                        _ = kill.notified() => debug!("memory session killed"),
                    }
                });
            }
        });
        Self { server, kill, task }
    }

    /// The backend behind every connection.
    pub fn server(&self) -> &BackendServer {
        &self.server
    }

    /// Drops every open connection. Later connections are served normally.
    pub fn drop_connections(&self) {
        self.kill.notify_waiters();
    }
}

impl Drop for TestBackend {
    fn drop(&mut self) {
        self.task.abort();
        self.kill.notify_waiters();
    }
}
