use futures::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use warp::ws::{Message, WebSocket};

use crate::relay::{ClientMessage, ConnectionId, RelayHandle, ServerMessage};

pub async fn handle_relay_websocket(websocket: WebSocket, relay: RelayHandle) {
    let (mut ws_sender, mut ws_receiver) = websocket.split();
    let (tx, mut rx) = mpsc::unbounded_channel::<ServerMessage>();

    let connection_id = match relay.connect(tx) {
        Ok(id) => id,
        Err(e) => {
            tracing::error!(error = %e, "Relay unavailable, closing WebSocket");
            let _ = ws_sender.close().await;
            return;
        }
    };
    tracing::info!(connection_id = %connection_id, "WebSocket connection established");

    // Spawn task to send messages to client
    let sender_id = connection_id.clone();
    let sender_task = tokio::spawn(async move {
        while let Some(message) = rx.recv().await {
            let text = match serde_json::to_string(&message) {
                Ok(text) => text,
                Err(e) => {
                    tracing::error!(connection_id = %sender_id, error = %e, "Failed to serialize relay message");
                    continue;
                }
            };
            if let Err(e) = ws_sender.send(Message::text(text)).await {
                tracing::error!(connection_id = %sender_id, error = %e, "Failed to send WebSocket message");
                break;
            }
        }
    });

    while let Some(result) = ws_receiver.next().await {
        match result {
            Ok(message) => {
                if message.is_close() {
                    break;
                }
                if handle_websocket_message(&relay, &connection_id, message).is_err() {
                    break;
                }
            }
            Err(e) => {
                tracing::error!(connection_id = %connection_id, error = %e, "WebSocket error");
                break;
            }
        }
    }

    relay.disconnect(&connection_id);
    sender_task.abort();
    tracing::info!(connection_id = %connection_id, "WebSocket connection closed");
}

fn handle_websocket_message(
    relay: &RelayHandle,
    connection_id: &ConnectionId,
    message: Message,
) -> crate::Result<()> {
    let Ok(text) = message.to_str() else {
        return Ok(());
    };
    tracing::debug!(connection_id = %connection_id, "Received relay message: {}", text);

    match serde_json::from_str::<ClientMessage>(text) {
        Ok(client_message) => relay.submit(connection_id, client_message),
        Err(e) => {
            tracing::warn!(
                connection_id = %connection_id,
                error = %e,
                raw_message = %text,
                "Failed to parse relay message"
            );
            Ok(())
        }
    }
}
