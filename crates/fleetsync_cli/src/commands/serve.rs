//! Serve command implementation.

use fleetsync_backend::{BackendConfig, BackendServer, BackendSession};
use fleetsync_protocol::{EntityKind, EntityStatus, RawMessage, ServerFrame};
use futures_util::{SinkExt, StreamExt};
use serde_json::json;
use std::net::SocketAddr;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::http::header::AUTHORIZATION;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::WebSocketStream;
use tracing::{debug, info, warn};

/// How often transitional statuses settle to `healthy`.
const SETTLE_INTERVAL: Duration = Duration::from_secs(5);

/// Runs the serve command.
pub fn run(
    listen: SocketAddr,
    token: Option<String>,
    echo: bool,
) -> Result<(), Box<dyn std::error::Error>> {
    let mut config = BackendConfig::new(listen).with_echo_correlation(echo);
    if let Some(token) = token {
        config = config.with_token(token);
    }
    let runtime = tokio::runtime::Runtime::new()?;
    runtime.block_on(serve(config))
}

async fn serve(config: BackendConfig) -> Result<(), Box<dyn std::error::Error>> {
    let listener = TcpListener::bind(config.listen_addr).await?;
    let server = BackendServer::new(config);
    seed(&server);
    info!(addr = %listener.local_addr()?, "serving fleetsync demo backend");

    let settler = server.clone();
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(SETTLE_INTERVAL);
        loop {
            ticker.tick().await;
            for kind in EntityKind::ALL {
                let settled = settler.settle_transitional(kind);
                if !settled.is_empty() {
                    debug!(%kind, count = settled.len(), "settled transitional entities");
                }
            }
        }
    });

    loop {
        tokio::select! {
            accepted = listener.accept() => {
                let (stream, peer) = accepted?;
                let server = server.clone();
                tokio::spawn(async move {
                    if let Err(e) = serve_socket(server, stream).await {
                        warn!(%peer, error = %e, "connection ended with error");
                    }
                });
            }
            _ = tokio::signal::ctrl_c() => {
                info!(stats = ?server.stats(), "shutting down");
                return Ok(());
            }
        }
    }
}

fn seed(server: &BackendServer) {
    server.publish_upsert(
        EntityKind::Organization,
        "acme",
        EntityStatus::Healthy,
        json!({ "name": "Acme", "members": 12 }),
    );
    for (id, region) in [("eu-west", "europe-west1"), ("us-east", "us-east1")] {
        server.publish_upsert(
            EntityKind::Cluster,
            id,
            EntityStatus::Healthy,
            json!({ "region": region }),
        );
    }
    server.publish_upsert(
        EntityKind::Composition,
        "storefront",
        EntityStatus::Healthy,
        json!({ "services": ["web", "api", "worker"] }),
    );
    for (id, replicas) in [("deployment-42", 3), ("deployment-7", 1)] {
        server.publish_upsert(
            EntityKind::Deployment,
            id,
            EntityStatus::Healthy,
            json!({ "composition": "storefront", "cluster": "eu-west", "replicas": replicas }),
        );
    }
}

async fn serve_socket(
    server: BackendServer,
    stream: TcpStream,
) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let mut token = None;
    let read_token = |request: &Request, response: Response| -> Result<Response, ErrorResponse> {
        token = request
            .headers()
            .get(AUTHORIZATION)
            .and_then(|value| value.to_str().ok())
            .map(|value| value.strip_prefix("Bearer ").unwrap_or(value).to_string());
        Ok(response)
    };
    let socket = tokio_tungstenite::accept_hdr_async(stream, read_token).await?;

    match server.session(token.as_deref()) {
        Ok(session) => pump(socket, session).await,
        Err(e) => {
            warn!(error = %e, "refusing session");
            let mut socket = socket;
            let frame = ServerFrame::Error {
                message: e.to_string(),
            };
            if let RawMessage::Text(text) = frame.encode(fleetsync_protocol::WireFormat::Text)? {
                socket.send(Message::Text(text)).await?;
            }
            socket.close(None).await?;
            Ok(())
        }
    }
}

async fn pump(
    socket: WebSocketStream<TcpStream>,
    mut session: BackendSession,
) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let (mut sink, mut stream) = socket.split();
    loop {
        tokio::select! {
            inbound = stream.next() => {
                let raw = match inbound {
                    Some(Ok(Message::Binary(bytes))) => RawMessage::Binary(bytes.into()),
                    Some(Ok(Message::Text(text))) => RawMessage::Text(text),
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Ok(_)) => continue,
                    Some(Err(e)) => return Err(e.into()),
                };
                for reply in session.handle_raw(&raw) {
                    sink.send(to_message(reply)).await?;
                }
            }
            event = session.next_event() => match event {
                Some(envelope) => {
                    if let Some(raw) = session.encode(&ServerFrame::Event(envelope)) {
                        sink.send(to_message(raw)).await?;
                    }
                }
                // Lagging sessions are dropped; the client resyncs.
                None => break,
            },
        }
    }
    debug!("websocket session ended");
    Ok(())
}

fn to_message(raw: RawMessage) -> Message {
    match raw {
        RawMessage::Binary(bytes) => Message::Binary(bytes.to_vec()),
        RawMessage::Text(text) => Message::Text(text),
    }
}
