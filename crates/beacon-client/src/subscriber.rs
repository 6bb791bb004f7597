//! Viewer-side connection manager.
//!
//! Keeps one subscription alive for the life of the view: on every
//! (re)connect it re-sends the subscribe frame and refetches the REST
//! snapshot, because channel state may have changed while the link was
//! down. Reconnects forever at a fixed pause; `shutdown()` ends it.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio::time::{self, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

use beacon_core::wire::{ClientMessage, ServerMessage};
use beacon_core::{FleetId, LocationId};

use crate::error::ClientError;
use crate::publisher::{HEARTBEAT_INTERVAL, RECONNECT_BACKOFF};
use crate::transport::{Connection, Transport};

#[derive(Clone)]
pub struct SubscriberConfig {
    pub heartbeat_interval: Duration,
    pub reconnect_backoff: Duration,
}

impl Default for SubscriberConfig {
    fn default() -> Self {
        Self {
            heartbeat_interval: HEARTBEAT_INTERVAL,
            reconnect_backoff: RECONNECT_BACKOFF,
        }
    }
}

/// Which channel the viewer joins.
pub trait SubscribeTarget: Send + Sync + 'static {
    fn subscribe(&self) -> ClientMessage;
}

pub struct SoloChannel {
    pub location_id: LocationId,
}

impl SubscribeTarget for SoloChannel {
    fn subscribe(&self) -> ClientMessage {
        ClientMessage::Subscribe {
            location_id: self.location_id.clone(),
        }
    }
}

pub struct FleetChannel {
    pub fleet_id: FleetId,
}

impl SubscribeTarget for FleetChannel {
    fn subscribe(&self) -> ClientMessage {
        ClientMessage::SubscribeFleet {
            fleet_id: self.fleet_id.clone(),
        }
    }
}

/// Re-pulls the view's REST snapshot. Called once per (re)connect; the
/// in-band snapshot only covers the channel itself, anything else the
/// view renders may have drifted while disconnected.
#[async_trait]
pub trait SnapshotFetcher: Send + Sync {
    async fn refetch(&self) -> Result<(), ClientError>;
}

/// Handle to a running subscription.
pub struct SubscriberHandle {
    cancel: CancellationToken,
    task: tokio::task::JoinHandle<()>,
}

impl SubscriberHandle {
    pub async fn shutdown(self) {
        self.cancel.cancel();
        let _ = self.task.await;
    }
}

pub struct Subscriber<T: SubscribeTarget> {
    target: T,
    transport: Arc<dyn Transport>,
    fetcher: Arc<dyn SnapshotFetcher>,
    config: SubscriberConfig,
}

impl<T: SubscribeTarget> Subscriber<T> {
    pub fn new(
        target: T,
        transport: Arc<dyn Transport>,
        fetcher: Arc<dyn SnapshotFetcher>,
    ) -> Self {
        Self {
            target,
            transport,
            fetcher,
            config: SubscriberConfig::default(),
        }
    }

    pub fn with_config(mut self, config: SubscriberConfig) -> Self {
        self.config = config;
        self
    }

    /// Spawn the subscription loop. Parsed server frames are forwarded
    /// on `updates`; dropping the receiver ends the subscription.
    pub fn start(self, updates: mpsc::Sender<ServerMessage>) -> SubscriberHandle {
        let cancel = CancellationToken::new();
        let runner = Runner {
            target: self.target,
            transport: self.transport,
            fetcher: self.fetcher,
            config: self.config,
            cancel: cancel.clone(),
            updates,
        };
        let task = tokio::spawn(runner.run());
        SubscriberHandle { cancel, task }
    }
}

struct Runner<T: SubscribeTarget> {
    target: T,
    transport: Arc<dyn Transport>,
    fetcher: Arc<dyn SnapshotFetcher>,
    config: SubscriberConfig,
    cancel: CancellationToken,
    updates: mpsc::Sender<ServerMessage>,
}

enum SessionEnd {
    Finished,
    TransportLost,
}

impl<T: SubscribeTarget> Runner<T> {
    async fn run(self) {
        loop {
            let conn = match self.transport.connect().await {
                Ok(conn) => conn,
                Err(err) => {
                    tracing::warn!(error = %err, "subscribe connect failed, backing off");
                    if !self.pause().await {
                        return;
                    }
                    continue;
                }
            };

            match self.session(conn).await {
                SessionEnd::Finished => return,
                SessionEnd::TransportLost => {
                    tracing::info!("subscribe transport lost, reconnecting");
                    if !self.pause().await {
                        return;
                    }
                }
            }
        }
    }

    async fn pause(&self) -> bool {
        tokio::select! {
            _ = self.cancel.cancelled() => false,
            _ = time::sleep(self.config.reconnect_backoff) => true,
        }
    }

    async fn session(&self, mut conn: Box<dyn Connection>) -> SessionEnd {
        let subscribe = match serde_json::to_string(&self.target.subscribe()) {
            Ok(frame) => frame,
            Err(_) => return SessionEnd::Finished,
        };
        if conn.send(subscribe).await.is_err() {
            return SessionEnd::TransportLost;
        }
        if let Err(err) = self.fetcher.refetch().await {
            tracing::warn!(error = %err, "snapshot refetch failed");
        }

        let mut heartbeat = time::interval_at(
            Instant::now() + self.config.heartbeat_interval,
            self.config.heartbeat_interval,
        );
        heartbeat.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => {
                    conn.close().await;
                    return SessionEnd::Finished;
                }
                msg = conn.recv() => match msg {
                    Some(text) => match serde_json::from_str::<ServerMessage>(&text) {
                        Ok(update) => {
                            if self.updates.send(update).await.is_err() {
                                // View is gone; nothing left to feed.
                                conn.close().await;
                                return SessionEnd::Finished;
                            }
                        }
                        Err(err) => {
                            tracing::debug!(error = %err, "dropping unparseable frame");
                        }
                    },
                    None => return SessionEnd::TransportLost,
                },
                _ = heartbeat.tick() => {
                    // Liveness probe for half-open sockets.
                    if !conn.is_open() {
                        return SessionEnd::TransportLost;
                    }
                }
            }
        }
    }
}
