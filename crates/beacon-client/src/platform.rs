//! Platform capabilities injected into the connection managers.
//!
//! Geolocation and wake-lock come from whatever host the managers are
//! embedded in. Both are modeled as traits so the manager logic can be
//! driven by fakes in tests.

use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::error::ClientError;

/// A single geographic fix.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PositionFix {
    pub latitude: f64,
    pub longitude: f64,
}

/// Continuous position feed. Dropping the watch cancels it on the
/// platform side.
pub struct PositionWatch {
    pub rx: mpsc::Receiver<PositionFix>,
    cancel: Option<Box<dyn FnOnce() + Send>>,
}

impl PositionWatch {
    pub fn new(rx: mpsc::Receiver<PositionFix>, cancel: impl FnOnce() + Send + 'static) -> Self {
        Self {
            rx,
            cancel: Some(Box::new(cancel)),
        }
    }
}

impl Drop for PositionWatch {
    fn drop(&mut self) {
        if let Some(cancel) = self.cancel.take() {
            cancel();
        }
    }
}

/// Source of geographic fixes.
#[async_trait]
pub trait PositionSource: Send + Sync {
    /// Start a continuous watch.
    fn watch(&self) -> Result<PositionWatch, ClientError>;

    /// One-shot read of the current position.
    async fn current(&self) -> Result<PositionFix, ClientError>;
}

/// Held while the publisher wants the device screen to stay awake.
/// Dropping the guard releases the lock.
pub struct WakeGuard {
    revoked: CancellationToken,
    release: Option<Box<dyn FnOnce() + Send + Sync>>,
}

impl WakeGuard {
    pub fn new(revoked: CancellationToken, release: impl FnOnce() + Send + Sync + 'static) -> Self {
        Self {
            revoked,
            release: Some(Box::new(release)),
        }
    }

    /// Resolves if the platform revokes the lock out from under us.
    pub async fn revoked(&self) {
        self.revoked.cancelled().await;
    }
}

impl Drop for WakeGuard {
    fn drop(&mut self) {
        if let Some(release) = self.release.take() {
            release();
        }
    }
}

/// Screen wake-lock capability. Best-effort: `acquire` returns `None`
/// on platforms without one, and sharing proceeds regardless.
pub trait WakeLock: Send + Sync {
    fn acquire(&self) -> Option<WakeGuard>;
}
