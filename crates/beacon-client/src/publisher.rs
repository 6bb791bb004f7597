//! Publisher-side connection manager.
//!
//! Owns the whole lifetime of a publish session: claims the channel on
//! connect, forwards geolocation fixes, re-sends the last fix as a
//! heartbeat every 15 seconds, reconnects with a fixed 2 second pause
//! when the transport dies, and holds a screen wake-lock while the
//! session is foregrounded. `stop()` is terminal; everything else is
//! retried.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::time::{self, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

use beacon_core::wire::{ClientMessage, Position};
use beacon_core::{LocationId, VehicleId};

use crate::error::ClientError;
use crate::platform::{PositionFix, PositionSource, PositionWatch, WakeGuard, WakeLock};
use crate::transport::{Connection, Transport};

pub const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(15);
pub const RECONNECT_BACKOFF: Duration = Duration::from_secs(2);

#[derive(Clone)]
pub struct PublisherConfig {
    pub heartbeat_interval: Duration,
    pub reconnect_backoff: Duration,
}

impl Default for PublisherConfig {
    fn default() -> Self {
        Self {
            heartbeat_interval: HEARTBEAT_INTERVAL,
            reconnect_backoff: RECONNECT_BACKOFF,
        }
    }
}

/// What kind of channel this publisher feeds. The two topologies only
/// differ in the frames they emit.
pub trait PublishRole: Send + Sync + 'static {
    fn announce(&self) -> ClientMessage;
    fn update(&self, fix: PositionFix) -> ClientMessage;
    fn stop(&self) -> ClientMessage;
}

/// Publish to a solo location channel.
pub struct SoloRole {
    pub location_id: LocationId,
}

impl PublishRole for SoloRole {
    fn announce(&self) -> ClientMessage {
        ClientMessage::Share {
            location_id: self.location_id.clone(),
        }
    }

    fn update(&self, fix: PositionFix) -> ClientMessage {
        ClientMessage::Update {
            data: Position {
                latitude: fix.latitude,
                longitude: fix.longitude,
            },
        }
    }

    fn stop(&self) -> ClientMessage {
        ClientMessage::Stop
    }
}

/// Publish one vehicle's position into its fleet channel.
pub struct VehicleRole {
    pub vehicle_id: VehicleId,
}

impl PublishRole for VehicleRole {
    fn announce(&self) -> ClientMessage {
        ClientMessage::ShareVehicle {
            vehicle_id: self.vehicle_id.clone(),
        }
    }

    fn update(&self, fix: PositionFix) -> ClientMessage {
        ClientMessage::UpdateVehicle {
            data: Position {
                latitude: fix.latitude,
                longitude: fix.longitude,
            },
        }
    }

    fn stop(&self) -> ClientMessage {
        ClientMessage::StopVehicle
    }
}

fn frame(msg: &ClientMessage) -> String {
    serde_json::to_string(msg).unwrap_or_default()
}

enum HostEvent {
    Foregrounded,
    Backgrounded,
}

/// Handle to a running publish session.
pub struct PublisherHandle {
    cancel: CancellationToken,
    events: mpsc::Sender<HostEvent>,
    task: tokio::task::JoinHandle<()>,
}

impl PublisherHandle {
    /// The host came back to the foreground: push a fresh fix and
    /// re-acquire the wake-lock if it was lost.
    pub fn foregrounded(&self) {
        let _ = self.events.try_send(HostEvent::Foregrounded);
    }

    pub fn backgrounded(&self) {
        let _ = self.events.try_send(HostEvent::Backgrounded);
    }

    /// End the session for good: best-effort stop frame, close the
    /// transport, release the wake-lock and the position watch.
    pub async fn stop(self) {
        self.cancel.cancel();
        let _ = self.task.await;
    }
}

pub struct Publisher<R: PublishRole> {
    role: R,
    transport: Arc<dyn Transport>,
    positions: Arc<dyn PositionSource>,
    wake: Arc<dyn WakeLock>,
    config: PublisherConfig,
}

impl<R: PublishRole> Publisher<R> {
    pub fn new(
        role: R,
        transport: Arc<dyn Transport>,
        positions: Arc<dyn PositionSource>,
        wake: Arc<dyn WakeLock>,
    ) -> Self {
        Self {
            role,
            transport,
            positions,
            wake,
            config: PublisherConfig::default(),
        }
    }

    pub fn with_config(mut self, config: PublisherConfig) -> Self {
        self.config = config;
        self
    }

    /// Take an initial fix and start the session loop. Fails with
    /// [`ClientError::NoPosition`] when geolocation is unavailable;
    /// that is not retried, the operator has to resolve it.
    pub async fn start(self) -> Result<PublisherHandle, ClientError> {
        let first = self.positions.current().await?;
        let watch = self.positions.watch()?;

        let cancel = CancellationToken::new();
        let (event_tx, event_rx) = mpsc::channel(8);
        let runner = Runner {
            role: self.role,
            transport: self.transport,
            positions: self.positions,
            wake: self.wake,
            config: self.config,
            cancel: cancel.clone(),
            events: event_rx,
            watch,
            watch_open: true,
            last_fix: first,
            wake_guard: None,
            foregrounded: true,
        };
        let task = tokio::spawn(runner.run());

        Ok(PublisherHandle {
            cancel,
            events: event_tx,
            task,
        })
    }
}

enum SessionEnd {
    Stopped,
    TransportLost,
}

struct Runner<R: PublishRole> {
    role: R,
    transport: Arc<dyn Transport>,
    positions: Arc<dyn PositionSource>,
    wake: Arc<dyn WakeLock>,
    config: PublisherConfig,
    cancel: CancellationToken,
    events: mpsc::Receiver<HostEvent>,
    watch: PositionWatch,
    watch_open: bool,
    last_fix: PositionFix,
    wake_guard: Option<WakeGuard>,
    foregrounded: bool,
}

impl<R: PublishRole> Runner<R> {
    async fn run(mut self) {
        self.wake_guard = self.wake.acquire();
        if self.wake_guard.is_none() {
            tracing::debug!("wake-lock unavailable, sharing without it");
        }

        loop {
            let conn = match self.transport.connect().await {
                Ok(conn) => conn,
                Err(err) => {
                    tracing::warn!(error = %err, "publish connect failed, backing off");
                    if !self.pause().await {
                        return;
                    }
                    continue;
                }
            };

            match self.session(conn).await {
                SessionEnd::Stopped => return,
                SessionEnd::TransportLost => {
                    tracing::info!("publish transport lost, reconnecting");
                    if !self.pause().await {
                        return;
                    }
                }
            }
        }
    }

    /// Backoff wait between attempts. Returns `false` when the session
    /// was stopped while waiting.
    async fn pause(&mut self) -> bool {
        tokio::select! {
            _ = self.cancel.cancelled() => false,
            _ = time::sleep(self.config.reconnect_backoff) => true,
        }
    }

    async fn session(&mut self, mut conn: Box<dyn Connection>) -> SessionEnd {
        if conn.send(frame(&self.role.announce())).await.is_err() {
            return SessionEnd::TransportLost;
        }
        // Fresh read on every (re)connect so viewers do not resume on a
        // stale cached fix.
        if let Ok(fix) = self.positions.current().await {
            self.last_fix = fix;
        }
        if conn
            .send(frame(&self.role.update(self.last_fix)))
            .await
            .is_err()
        {
            return SessionEnd::TransportLost;
        }

        let mut heartbeat = time::interval_at(
            Instant::now() + self.config.heartbeat_interval,
            self.config.heartbeat_interval,
        );
        heartbeat.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => {
                    let _ = conn.send(frame(&self.role.stop())).await;
                    conn.close().await;
                    self.wake_guard = None;
                    return SessionEnd::Stopped;
                }
                fix = self.watch.rx.recv(), if self.watch_open => {
                    match fix {
                        Some(fix) => {
                            self.last_fix = fix;
                            if conn.send(frame(&self.role.update(fix))).await.is_err() {
                                return SessionEnd::TransportLost;
                            }
                        }
                        None => self.watch_open = false,
                    }
                }
                _ = heartbeat.tick() => {
                    // The heartbeat doubles as a dead-socket probe.
                    if !conn.is_open()
                        || conn.send(frame(&self.role.update(self.last_fix))).await.is_err()
                    {
                        return SessionEnd::TransportLost;
                    }
                }
                event = self.events.recv() => match event {
                    Some(HostEvent::Foregrounded) => {
                        self.foregrounded = true;
                        if !conn.is_open() {
                            return SessionEnd::TransportLost;
                        }
                        if let Ok(fix) = self.positions.current().await {
                            self.last_fix = fix;
                        }
                        if conn.send(frame(&self.role.update(self.last_fix))).await.is_err() {
                            return SessionEnd::TransportLost;
                        }
                        if self.wake_guard.is_none() {
                            self.wake_guard = self.wake.acquire();
                        }
                    }
                    Some(HostEvent::Backgrounded) => self.foregrounded = false,
                    None => {}
                },
                _ = wake_revoked(&self.wake_guard) => {
                    self.wake_guard = None;
                    if self.foregrounded {
                        self.wake_guard = self.wake.acquire();
                    }
                }
            }
        }
    }
}

/// Pends forever when no guard is held.
async fn wake_revoked(guard: &Option<WakeGuard>) {
    match guard {
        Some(guard) => guard.revoked().await,
        None => std::future::pending().await,
    }
}
