//! Client-side connection managers for publishing and viewing position
//! streams. Transport, geolocation, and wake-lock are injected behind
//! traits so the managers run identically against a live server and
//! against fakes in tests.

pub mod error;
pub mod fakes;
pub mod platform;
pub mod publisher;
pub mod subscriber;
pub mod transport;

pub use error::ClientError;
pub use platform::{PositionFix, PositionSource, PositionWatch, WakeGuard, WakeLock};
pub use publisher::{Publisher, PublisherConfig, PublisherHandle, SoloRole, VehicleRole};
pub use subscriber::{
    FleetChannel, SnapshotFetcher, SoloChannel, Subscriber, SubscriberHandle,
};
pub use transport::{Connection, Transport, WsTransport};
