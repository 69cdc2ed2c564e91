//! Websocket client for the relay protocol, plus the participant and
//! supervisor drivers built on it.

mod participant;
mod supervisor;

use std::time::Duration;

use futures::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tokio_tungstenite::{connect_async, tungstenite::Message};

use crate::error::{RelayError, Result};
use crate::relay::{ClientMessage, ConnectionId, ServerMessage};

pub use participant::ParticipantSession;
pub use supervisor::{authenticate, SupervisorCommand, SupervisorSession};

const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(5);

/// A live signaling connection. Frames are (de)serialized on background tasks.
pub struct SignalingClient {
    id: ConnectionId,
    outbound: mpsc::UnboundedSender<ClientMessage>,
    inbound: mpsc::UnboundedReceiver<ServerMessage>,
    reader: JoinHandle<()>,
}

impl SignalingClient {
    /// Connects to `url` (e.g. `ws://127.0.0.1:3000/ws`) and waits for the relay
    /// to announce this connection's identity.
    pub async fn connect(url: &str) -> Result<Self> {
        let (ws_stream, _) = connect_async(url).await?;
        let (mut ws_sender, mut ws_receiver) = ws_stream.split();

        let (outbound, mut outbound_rx) = mpsc::unbounded_channel::<ClientMessage>();
        let (inbound_tx, mut inbound) = mpsc::unbounded_channel::<ServerMessage>();

        tokio::spawn(async move {
            while let Some(message) = outbound_rx.recv().await {
                let text = match serde_json::to_string(&message) {
                    Ok(text) => text,
                    Err(e) => {
                        tracing::error!(error = %e, "Failed to serialize client message");
                        continue;
                    }
                };
                if let Err(e) = ws_sender.send(Message::Text(text)).await {
                    tracing::warn!(error = %e, "Failed to send to relay");
                    break;
                }
            }
            let _ = ws_sender.close().await;
        });

        let reader = tokio::spawn(async move {
            while let Some(frame) = ws_receiver.next().await {
                match frame {
                    Ok(Message::Text(text)) => match serde_json::from_str::<ServerMessage>(&text) {
                        Ok(message) => {
                            if inbound_tx.send(message).is_err() {
                                break;
                            }
                        }
                        Err(e) => {
                            tracing::warn!(error = %e, raw_message = %text, "Failed to parse relay message");
                        }
                    },
                    Ok(Message::Close(_)) => break,
                    Ok(_) => {}
                    Err(e) => {
                        tracing::warn!(error = %e, "Relay connection error");
                        break;
                    }
                }
            }
        });

        let id = match timeout(HANDSHAKE_TIMEOUT, inbound.recv()).await {
            Ok(Some(ServerMessage::Connected { id })) => id,
            Ok(Some(_)) => return Err(RelayError::MissingIdentity),
            Ok(None) => return Err(RelayError::ChannelClosed),
            Err(_) => return Err(RelayError::Timeout("waiting for connection identity".to_string())),
        };
        tracing::debug!(connection_id = %id, "Connected to relay");

        Ok(Self {
            id,
            outbound,
            inbound,
            reader,
        })
    }

    pub fn id(&self) -> &ConnectionId {
        &self.id
    }

    pub fn sender(&self) -> mpsc::UnboundedSender<ClientMessage> {
        self.outbound.clone()
    }

    pub fn send(&self, message: ClientMessage) -> Result<()> {
        self.outbound.send(message).map_err(RelayError::from)
    }

    /// Next relay message, or `None` once the connection is gone.
    pub async fn recv(&mut self) -> Option<ServerMessage> {
        self.inbound.recv().await
    }

    /// Skips messages until one matches `predicate`.
    pub async fn expect<F>(&mut self, within: Duration, predicate: F) -> Result<ServerMessage>
    where
        F: Fn(&ServerMessage) -> bool,
    {
        let wait = async {
            while let Some(message) = self.inbound.recv().await {
                if predicate(&message) {
                    return Ok(message);
                }
                tracing::trace!(message = ?message, "Skipping relay message");
            }
            Err(RelayError::ChannelClosed)
        };
        timeout(within, wait)
            .await
            .map_err(|_| RelayError::Timeout("waiting for relay message".to_string()))?
    }

    /// Messages already received, without waiting.
    pub fn drain(&mut self) -> Vec<ServerMessage> {
        let mut messages = Vec::new();
        while let Ok(message) = self.inbound.try_recv() {
            messages.push(message);
        }
        messages
    }

    /// Hands out the raw channels for a driver that owns the message loop.
    pub fn into_parts(
        self,
    ) -> (
        ConnectionId,
        mpsc::UnboundedSender<ClientMessage>,
        mpsc::UnboundedReceiver<ServerMessage>,
    ) {
        (self.id, self.outbound, self.inbound)
    }

    /// Stops reading and closes the socket once no other sender remains.
    pub fn close(self) {
        self.reader.abort();
    }
}
