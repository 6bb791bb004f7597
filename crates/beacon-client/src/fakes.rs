//! In-memory fakes for the injected capabilities.
//!
//! These stand in for the WebSocket transport, the platform geolocation
//! API, and the screen wake-lock so the connection managers can be
//! exercised deterministically under paused time.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::error::ClientError;
use crate::platform::{PositionFix, PositionSource, PositionWatch, WakeGuard, WakeLock};
use crate::subscriber::SnapshotFetcher;
use crate::transport::{Connection, Transport};

/// Transport whose connections are in-memory channel pairs. The test
/// side accepts each connection through [`FakeServer`].
pub struct FakeTransport {
    remote_tx: mpsc::UnboundedSender<FakeRemote>,
    refusals: Arc<AtomicUsize>,
    connects: Arc<AtomicUsize>,
}

/// Test-side view of a [`FakeTransport`].
pub struct FakeServer {
    remotes: mpsc::UnboundedReceiver<FakeRemote>,
}

impl FakeTransport {
    pub fn pair() -> (Self, FakeServer) {
        let (remote_tx, remotes) = mpsc::unbounded_channel();
        (
            Self {
                remote_tx,
                refusals: Arc::new(AtomicUsize::new(0)),
                connects: Arc::new(AtomicUsize::new(0)),
            },
            FakeServer { remotes },
        )
    }

    /// Make the next `n` connect attempts fail.
    pub fn refuse_next(&self, n: usize) {
        self.refusals.store(n, Ordering::SeqCst);
    }

    pub fn connect_count(&self) -> usize {
        self.connects.load(Ordering::SeqCst)
    }
}

impl FakeServer {
    /// Wait for the manager's next connection.
    pub async fn accept(&mut self) -> FakeRemote {
        match self.remotes.recv().await {
            Some(remote) => remote,
            None => panic!("transport dropped before a connection arrived"),
        }
    }
}

#[async_trait]
impl Transport for FakeTransport {
    async fn connect(&self) -> Result<Box<dyn Connection>, ClientError> {
        if self
            .refusals
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
        {
            return Err(ClientError::Transport("connection refused".into()));
        }
        self.connects.fetch_add(1, Ordering::SeqCst);

        let (sent_tx, sent_rx) = mpsc::unbounded_channel();
        let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();
        let open = Arc::new(Mutex::new(true));

        let remote = FakeRemote {
            sent_rx,
            inbound_tx: Some(inbound_tx),
            open: Arc::clone(&open),
        };
        self.remote_tx
            .send(remote)
            .map_err(|_| ClientError::Transport("acceptor gone".into()))?;

        Ok(Box::new(FakeConnection {
            sent_tx,
            inbound_rx,
            open,
        }))
    }
}

/// Test-side end of one fake connection.
pub struct FakeRemote {
    sent_rx: mpsc::UnboundedReceiver<String>,
    inbound_tx: Option<mpsc::UnboundedSender<String>>,
    open: Arc<Mutex<bool>>,
}

impl FakeRemote {
    /// Next frame the manager sent.
    pub async fn recv(&mut self) -> String {
        match self.sent_rx.recv().await {
            Some(frame) => frame,
            None => panic!("manager closed the connection"),
        }
    }

    /// Deliver a frame to the manager.
    pub fn push(&self, text: impl Into<String>) {
        if let Some(tx) = &self.inbound_tx {
            let _ = tx.send(text.into());
        }
    }

    /// Sever the connection without a close handshake.
    pub fn kill(&mut self) {
        *self.open.lock() = false;
        self.inbound_tx = None;
    }

    pub fn is_open(&self) -> bool {
        *self.open.lock()
    }
}

struct FakeConnection {
    sent_tx: mpsc::UnboundedSender<String>,
    inbound_rx: mpsc::UnboundedReceiver<String>,
    open: Arc<Mutex<bool>>,
}

#[async_trait]
impl Connection for FakeConnection {
    async fn send(&mut self, text: String) -> Result<(), ClientError> {
        if !*self.open.lock() {
            return Err(ClientError::Transport("connection closed".into()));
        }
        self.sent_tx
            .send(text)
            .map_err(|_| ClientError::Transport("remote gone".into()))
    }

    async fn recv(&mut self) -> Option<String> {
        self.inbound_rx.recv().await
    }

    fn is_open(&self) -> bool {
        *self.open.lock()
    }

    async fn close(&mut self) {
        *self.open.lock() = false;
        self.inbound_rx.close();
    }
}

/// Scriptable geolocation source.
pub struct FakePositionSource {
    inner: Arc<Mutex<SourceInner>>,
    active_watches: Arc<AtomicUsize>,
}

struct SourceInner {
    fix: Option<PositionFix>,
    watchers: Vec<mpsc::Sender<PositionFix>>,
}

impl FakePositionSource {
    pub fn new(fix: PositionFix) -> Self {
        Self {
            inner: Arc::new(Mutex::new(SourceInner {
                fix: Some(fix),
                watchers: Vec::new(),
            })),
            active_watches: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// A source with no position available; `current` fails.
    pub fn unavailable() -> Self {
        Self {
            inner: Arc::new(Mutex::new(SourceInner {
                fix: None,
                watchers: Vec::new(),
            })),
            active_watches: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Update the current fix and notify all active watches.
    pub fn push_fix(&self, fix: PositionFix) {
        let mut inner = self.inner.lock();
        inner.fix = Some(fix);
        inner.watchers.retain(|tx| tx.try_send(fix).is_ok());
    }

    pub fn active_watches(&self) -> usize {
        self.active_watches.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl PositionSource for FakePositionSource {
    fn watch(&self) -> Result<PositionWatch, ClientError> {
        let (tx, rx) = mpsc::channel(16);
        self.inner.lock().watchers.push(tx);
        self.active_watches.fetch_add(1, Ordering::SeqCst);
        let count = Arc::clone(&self.active_watches);
        Ok(PositionWatch::new(rx, move || {
            count.fetch_sub(1, Ordering::SeqCst);
        }))
    }

    async fn current(&self) -> Result<PositionFix, ClientError> {
        self.inner
            .lock()
            .fix
            .ok_or_else(|| ClientError::NoPosition("geolocation unavailable".into()))
    }
}

/// Wake-lock that tracks outstanding guards and can revoke them.
pub struct FakeWakeLock {
    available: bool,
    active: Arc<AtomicUsize>,
    tokens: Arc<Mutex<Vec<CancellationToken>>>,
}

impl FakeWakeLock {
    pub fn new() -> Self {
        Self {
            available: true,
            active: Arc::new(AtomicUsize::new(0)),
            tokens: Arc::new(Mutex::new(Vec::new())),
        }
    }

    pub fn unavailable() -> Self {
        Self {
            available: false,
            ..Self::new()
        }
    }

    pub fn active(&self) -> usize {
        self.active.load(Ordering::SeqCst)
    }

    /// Revoke every outstanding guard, as a platform would when the
    /// page loses visibility.
    pub fn revoke_all(&self) {
        for token in self.tokens.lock().drain(..) {
            token.cancel();
        }
    }
}

impl Default for FakeWakeLock {
    fn default() -> Self {
        Self::new()
    }
}

impl WakeLock for FakeWakeLock {
    fn acquire(&self) -> Option<WakeGuard> {
        if !self.available {
            return None;
        }
        let token = CancellationToken::new();
        self.tokens.lock().push(token.clone());
        self.active.fetch_add(1, Ordering::SeqCst);
        let active = Arc::clone(&self.active);
        Some(WakeGuard::new(token, move || {
            active.fetch_sub(1, Ordering::SeqCst);
        }))
    }
}

/// Snapshot fetcher that just counts invocations.
#[derive(Default)]
pub struct FakeSnapshotFetcher {
    calls: Arc<AtomicUsize>,
}

impl FakeSnapshotFetcher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl SnapshotFetcher for FakeSnapshotFetcher {
    async fn refetch(&self) -> Result<(), ClientError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}
