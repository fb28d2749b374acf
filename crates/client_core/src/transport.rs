//! WebSocket transport for the realtime channel.
//!
//! The session manager talks to the socket through [`SocketTransport`], so
//! tests can swap in a scripted connection. The production implementation
//! performs the auth handshake (token in the first frame, ack with the
//! server-assigned session id back) and bridges the socket to channels.

use std::time::Duration;

use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use thiserror::Error;
use tokio::{sync::mpsc, task::JoinHandle};
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tracing::warn;
use url::Url;

use shared::protocol::{ClientEmit, HandshakeAck, HandshakeReply, HandshakeRequest, ServerEvent};

/// How long to wait for the server's handshake ack before giving up on the
/// attempt and letting the reconnect policy take over.
const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("invalid server url '{url}': {reason}")]
    InvalidUrl { url: String, reason: String },
    #[error("websocket connect failed: {0}")]
    Connect(String),
    #[error("handshake rejected: {0}")]
    HandshakeRejected(String),
    #[error("connection closed during handshake")]
    ClosedDuringHandshake,
    #[error("handshake timed out")]
    HandshakeTimeout,
}

/// Inbound side of an established link.
#[derive(Debug)]
pub enum LinkEvent {
    Event(ServerEvent),
    Closed { reason: String },
}

/// One established, authenticated socket. Dropping the link tears down the
/// bridging tasks and with them the socket.
pub struct SocketLink {
    pub ack: HandshakeAck,
    pub outbound: mpsc::UnboundedSender<ClientEmit>,
    pub inbound: mpsc::UnboundedReceiver<LinkEvent>,
    tasks: Vec<JoinHandle<()>>,
}

impl SocketLink {
    /// Link without background tasks; used by scripted transports in tests.
    pub fn new(
        ack: HandshakeAck,
        outbound: mpsc::UnboundedSender<ClientEmit>,
        inbound: mpsc::UnboundedReceiver<LinkEvent>,
    ) -> Self {
        Self {
            ack,
            outbound,
            inbound,
            tasks: Vec::new(),
        }
    }

    pub(crate) fn with_tasks(
        ack: HandshakeAck,
        outbound: mpsc::UnboundedSender<ClientEmit>,
        inbound: mpsc::UnboundedReceiver<LinkEvent>,
        tasks: Vec<JoinHandle<()>>,
    ) -> Self {
        Self {
            ack,
            outbound,
            inbound,
            tasks,
        }
    }
}

impl Drop for SocketLink {
    fn drop(&mut self) {
        for task in &self.tasks {
            task.abort();
        }
    }
}

#[async_trait]
pub trait SocketTransport: Send + Sync {
    async fn connect(&self, server_url: &str, token: &str) -> Result<SocketLink, TransportError>;
}

/// Exponential backoff for reconnect attempts. Retries indefinitely; the
/// delay doubles per attempt up to `max_delay`.
#[derive(Debug, Clone)]
pub struct ReconnectPolicy {
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(30),
        }
    }
}

impl ReconnectPolicy {
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let factor = 2u32.saturating_pow(attempt.min(16));
        self.base_delay.saturating_mul(factor).min(self.max_delay)
    }
}

pub struct WebSocketTransport;

/// Map the configured http(s) base URL onto the ws(s) endpoint.
pub(crate) fn websocket_url(server_url: &str) -> Result<String, TransportError> {
    Url::parse(server_url).map_err(|err| TransportError::InvalidUrl {
        url: server_url.to_string(),
        reason: err.to_string(),
    })?;

    let mapped = if server_url.starts_with("https://") {
        server_url.replacen("https://", "wss://", 1)
    } else if server_url.starts_with("http://") {
        server_url.replacen("http://", "ws://", 1)
    } else {
        return Err(TransportError::InvalidUrl {
            url: server_url.to_string(),
            reason: "expected http:// or https:// scheme".to_string(),
        });
    };

    Ok(format!("{}/ws", mapped.trim_end_matches('/')))
}

#[async_trait]
impl SocketTransport for WebSocketTransport {
    async fn connect(&self, server_url: &str, token: &str) -> Result<SocketLink, TransportError> {
        let ws_url = websocket_url(server_url)?;
        let (mut ws_stream, _) = connect_async(&ws_url)
            .await
            .map_err(|err| TransportError::Connect(err.to_string()))?;

        let request = HandshakeRequest {
            token: token.to_string(),
        };
        let frame = serde_json::to_string(&request)
            .map_err(|err| TransportError::Connect(err.to_string()))?;
        ws_stream
            .send(Message::Text(frame))
            .await
            .map_err(|err| TransportError::Connect(err.to_string()))?;

        let ack = loop {
            let reply = tokio::time::timeout(HANDSHAKE_TIMEOUT, ws_stream.next())
                .await
                .map_err(|_| TransportError::HandshakeTimeout)?;
            match reply {
                Some(Ok(Message::Text(text))) => {
                    let reply: HandshakeReply = serde_json::from_str(&text)
                        .map_err(|err| TransportError::HandshakeRejected(err.to_string()))?;
                    match reply {
                        HandshakeReply::ConnectAck(ack) => break ack,
                        HandshakeReply::Error(err) => {
                            return Err(TransportError::HandshakeRejected(err.message));
                        }
                    }
                }
                Some(Ok(Message::Close(_))) | None => {
                    return Err(TransportError::ClosedDuringHandshake);
                }
                Some(Ok(_)) => continue,
                Some(Err(err)) => return Err(TransportError::Connect(err.to_string())),
            }
        };

        let (mut ws_sender, mut ws_receiver) = ws_stream.split();
        let (outbound_tx, mut outbound_rx) = mpsc::unbounded_channel::<ClientEmit>();
        let (inbound_tx, inbound_rx) = mpsc::unbounded_channel::<LinkEvent>();

        let writer = tokio::spawn(async move {
            while let Some(emit) = outbound_rx.recv().await {
                let frame = match serde_json::to_string(&emit) {
                    Ok(frame) => frame,
                    Err(err) => {
                        warn!(error = %err, "failed to encode outbound event");
                        continue;
                    }
                };
                if ws_sender.send(Message::Text(frame)).await.is_err() {
                    break;
                }
            }
        });

        let reader = tokio::spawn(async move {
            while let Some(message) = ws_receiver.next().await {
                match message {
                    Ok(Message::Text(text)) => match serde_json::from_str::<ServerEvent>(&text) {
                        Ok(event) => {
                            if inbound_tx.send(LinkEvent::Event(event)).is_err() {
                                return;
                            }
                        }
                        Err(err) => {
                            warn!(error = %err, "skipping malformed server event");
                        }
                    },
                    Ok(Message::Close(_)) => {
                        let _ = inbound_tx.send(LinkEvent::Closed {
                            reason: "closed by server".to_string(),
                        });
                        return;
                    }
                    Ok(_) => {}
                    Err(err) => {
                        let _ = inbound_tx.send(LinkEvent::Closed {
                            reason: err.to_string(),
                        });
                        return;
                    }
                }
            }
            let _ = inbound_tx.send(LinkEvent::Closed {
                reason: "stream ended".to_string(),
            });
        });

        Ok(SocketLink::with_tasks(
            ack,
            outbound_tx,
            inbound_rx,
            vec![writer, reader],
        ))
    }
}
