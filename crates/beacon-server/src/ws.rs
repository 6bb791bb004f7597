//! WebSocket connection plumbing: one reader and one writer task per
//! connection, with a bounded outbound queue between the registry fan-out
//! and the socket.

use std::sync::Arc;
use std::time::Duration;

use axum::extract::ws::{Message as WsMessage, WebSocket};
use futures::{SinkExt, StreamExt};
use tokio::sync::mpsc;

use crate::protocol::{ConnState, ProtocolHandler};

const PING_INTERVAL: Duration = Duration::from_secs(30);

/// Drive one WebSocket connection until the transport closes, then run the
/// role-appropriate cleanup.
pub async fn handle_socket(
    socket: WebSocket,
    handler: Arc<ProtocolHandler>,
    max_send_queue: usize,
) {
    let (tx, mut rx) = mpsc::channel::<String>(max_send_queue);
    let mut conn = ConnState::new(tx);
    let conn_id = conn.id.clone();
    tracing::info!(conn_id = %conn_id, "Streaming client connected");

    let (mut ws_tx, mut ws_rx) = socket.split();

    // Writer: drain the outbound queue, ping periodically to keep
    // intermediaries from dropping a quiet viewer connection.
    let writer = tokio::spawn(async move {
        let mut ping_interval = tokio::time::interval(PING_INTERVAL);
        ping_interval.tick().await; // consume first immediate tick

        loop {
            tokio::select! {
                frame = rx.recv() => {
                    match frame {
                        Some(text) => {
                            if ws_tx.send(WsMessage::Text(text.into())).await.is_err() {
                                break;
                            }
                        }
                        None => break,
                    }
                }
                _ = ping_interval.tick() => {
                    if ws_tx.send(WsMessage::Ping(vec![].into())).await.is_err() {
                        break;
                    }
                }
            }
        }
    });

    // Reader: feed text frames through the state machine. Any transport
    // error ends the connection the same way a clean close does.
    while let Some(Ok(message)) = ws_rx.next().await {
        match message {
            WsMessage::Text(text) => handler.handle_frame(&mut conn, text.as_str()),
            WsMessage::Close(_) => break,
            // axum answers pings automatically; pongs need no bookkeeping
            // because liveness is the client managers' concern.
            _ => {}
        }
    }

    handler.on_close(&mut conn);
    writer.abort();
    tracing::info!(conn_id = %conn_id, "Streaming client disconnected");
}
