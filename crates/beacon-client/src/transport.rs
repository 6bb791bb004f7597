//! Message transport behind the connection managers.
//!
//! The production implementation is a WebSocket; tests drive the
//! managers through an in-memory fake instead.

use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};

use crate::error::ClientError;

/// One live, ordered, bidirectional text-message connection.
#[async_trait]
pub trait Connection: Send {
    async fn send(&mut self, text: String) -> Result<(), ClientError>;

    /// Next inbound text frame, or `None` once the connection is gone.
    async fn recv(&mut self) -> Option<String>;

    /// Whether the connection is believed to be alive. Used by the
    /// heartbeat tick as a cheap dead-socket probe.
    fn is_open(&self) -> bool;

    async fn close(&mut self);
}

/// Factory for connections; each reconnect attempt calls `connect`.
#[async_trait]
pub trait Transport: Send + Sync {
    async fn connect(&self) -> Result<Box<dyn Connection>, ClientError>;
}

/// WebSocket transport for a fixed URL.
pub struct WsTransport {
    url: String,
}

impl WsTransport {
    pub fn new(url: impl Into<String>) -> Self {
        Self { url: url.into() }
    }
}

#[async_trait]
impl Transport for WsTransport {
    async fn connect(&self) -> Result<Box<dyn Connection>, ClientError> {
        let (stream, _) = connect_async(self.url.as_str())
            .await
            .map_err(|e| ClientError::Transport(e.to_string()))?;
        Ok(Box::new(WsConnection { stream, open: true }))
    }
}

struct WsConnection {
    stream: WebSocketStream<MaybeTlsStream<tokio::net::TcpStream>>,
    open: bool,
}

#[async_trait]
impl Connection for WsConnection {
    async fn send(&mut self, text: String) -> Result<(), ClientError> {
        if !self.open {
            return Err(ClientError::Transport("connection closed".into()));
        }
        self.stream
            .send(Message::Text(text.into()))
            .await
            .map_err(|e| {
                self.open = false;
                ClientError::Transport(e.to_string())
            })
    }

    async fn recv(&mut self) -> Option<String> {
        while self.open {
            match self.stream.next().await {
                Some(Ok(Message::Text(text))) => return Some(text.to_string()),
                Some(Ok(Message::Ping(payload))) => {
                    // tungstenite queues the pong; flush it out.
                    if self.stream.send(Message::Pong(payload)).await.is_err() {
                        self.open = false;
                    }
                }
                Some(Ok(Message::Close(_))) | None => self.open = false,
                Some(Ok(_)) => {}
                Some(Err(_)) => self.open = false,
            }
        }
        None
    }

    fn is_open(&self) -> bool {
        self.open
    }

    async fn close(&mut self) {
        self.open = false;
        let _ = self.stream.close(None).await;
    }
}
