pub mod clock;
pub mod ids;
pub mod records;
pub mod wire;

pub use clock::{Clock, ManualClock, SystemClock};
pub use ids::{AdminCode, ConnectionId, FleetId, LocationId, ShareCode, VehicleId};
pub use records::{FleetRecord, FleetView, LocationRecord, VehicleRecord};
