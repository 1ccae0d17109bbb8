//! WebSocket connector.

use crate::config::Credentials;
use crate::error::{SyncError, SyncResult};
use crate::transport::{Channel, Connector, PeerReceiver, PeerSender};
use async_trait::async_trait;
use fleetsync_protocol::RawMessage;
use futures_util::{SinkExt, StreamExt};
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::time::timeout;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::{header::AUTHORIZATION, HeaderValue};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::{debug, warn};
use url::Url;

/// Opens channels over WebSocket.
///
/// Binary frames carry CBOR and text frames carry JSON; both are handed to
/// the engine unchanged. Credentials travel in the `Authorization` header of
/// the upgrade request.
#[derive(Debug, Clone)]
pub struct WebSocketConnector {
    connect_timeout: Duration,
}

impl WebSocketConnector {
    /// Creates a connector with a ten second handshake timeout.
    pub fn new() -> Self {
        Self {
            connect_timeout: Duration::from_secs(10),
        }
    }

    /// Sets the handshake timeout.
    pub fn with_connect_timeout(mut self, connect_timeout: Duration) -> Self {
        self.connect_timeout = connect_timeout;
        self
    }
}

impl Default for WebSocketConnector {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Connector for WebSocketConnector {
    async fn open(
        &self,
        endpoint: &str,
        credentials: &Credentials,
        capacity: usize,
    ) -> SyncResult<Channel> {
        let url = Url::parse(endpoint)
            .map_err(|e| SyncError::transport_fatal(format!("invalid endpoint {endpoint}: {e}")))?;
        if !matches!(url.scheme(), "ws" | "wss") {
            return Err(SyncError::transport_fatal(format!(
                "unsupported scheme {}",
                url.scheme()
            )));
        }

        let mut request = url
            .as_str()
            .into_client_request()
            .map_err(|e| SyncError::transport_fatal(format!("bad upgrade request: {e}")))?;
        if let Some(header) = credentials.authorization_header() {
            let value = HeaderValue::from_str(&header)
                .map_err(|e| SyncError::transport_fatal(format!("bad credentials: {e}")))?;
            request.headers_mut().insert(AUTHORIZATION, value);
        }

        let (socket, response) = timeout(self.connect_timeout, connect_async(request))
            .await
            .map_err(|_| SyncError::transport_retryable("websocket connect timed out"))?
            .map_err(|e| SyncError::transport_retryable(format!("websocket connect failed: {e}")))?;
        debug!(%url, status = %response.status(), "websocket connected");

        let (channel, peer) = Channel::pair(capacity);
        let (sender, receiver) = peer.split();
        tokio::spawn(pump(socket, sender, receiver));
        Ok(channel)
    }
}

/// Moves frames between the socket and the channel until either side ends.
async fn pump(
    socket: WebSocketStream<MaybeTlsStream<TcpStream>>,
    sender: PeerSender,
    mut receiver: PeerReceiver,
) {
    let (mut sink, mut stream) = socket.split();
    loop {
        tokio::select! {
            outbound = receiver.next_outbound() => match outbound {
                Some(raw) => {
                    let message = match raw {
                        RawMessage::Binary(bytes) => Message::Binary(bytes.to_vec()),
                        RawMessage::Text(text) => Message::Text(text),
                    };
                    if let Err(e) = sink.send(message).await {
                        sender
                            .fail(SyncError::transport_retryable(format!("websocket send failed: {e}")))
                            .await;
                        break;
                    }
                }
                None => {
                    let _ = sink.send(Message::Close(None)).await;
                    break;
                }
            },
            inbound = stream.next() => {
                let raw = match inbound {
                    Some(Ok(Message::Binary(bytes))) => RawMessage::Binary(bytes.into()),
                    Some(Ok(Message::Text(text))) => RawMessage::Text(text),
                    Some(Ok(Message::Close(frame))) => {
                        debug!(?frame, "websocket closed by backend");
                        break;
                    }
                    // Control frames are answered by tungstenite.
                    Some(Ok(_)) => continue,
                    Some(Err(e)) => {
                        warn!(error = %e, "websocket read failed");
                        sender
                            .fail(SyncError::transport_retryable(format!("websocket read failed: {e}")))
                            .await;
                        break;
                    }
                    None => break,
                };
                if sender.deliver(raw).await.is_err() {
                    break;
                }
            }
        }
    }
    debug!("websocket pump stopped");
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn rejects_non_websocket_endpoints() {
        let connector = WebSocketConnector::default();
        let err = connector
            .open("https://api.example.com", &Credentials::none(), 8)
            .await
            .err()
            .unwrap();
        assert!(!err.is_retryable());

        let err = connector
            .open("not a url", &Credentials::none(), 8)
            .await
            .err()
            .unwrap();
        assert!(!err.is_retryable());
    }

    #[tokio::test]
    async fn unreachable_backend_is_retryable() {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let connector =
            WebSocketConnector::new().with_connect_timeout(Duration::from_secs(2));
        let err = connector
            .open(&format!("ws://127.0.0.1:{port}/stream"), &Credentials::none(), 8)
            .await
            .err()
            .unwrap();
        assert!(err.is_retryable());
    }
}
