use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;

use beacon_core::clock::{Clock, SystemClock};
use beacon_core::ids::{AdminCode, FleetId, LocationId, ShareCode, VehicleId};
use beacon_core::records::{FleetRecord, LocationRecord, VehicleRecord};

/// In-memory authority for all three record types.
///
/// Everything lives behind one coarse mutex: per-message work is a handful
/// of map operations, and a single lock linearizes racing publishers for
/// free. Expiry is evaluated lazily at read time and expired records are
/// purged on detection, so reclamation latency is bounded by the next read
/// that touches the record.
#[derive(Clone)]
pub struct EntityStore {
    pub(crate) inner: Arc<Mutex<StoreInner>>,
    pub(crate) clock: Arc<dyn Clock>,
}

#[derive(Default)]
pub(crate) struct StoreInner {
    pub(crate) locations: HashMap<LocationId, LocationRecord>,
    pub(crate) fleets: HashMap<FleetId, FleetRecord>,
    pub(crate) vehicles: HashMap<VehicleId, VehicleRecord>,
    /// Creation-ordered members per fleet; drives palette assignment.
    pub(crate) fleet_members: HashMap<FleetId, Vec<VehicleId>>,
    /// Secondary indexes for capability-token lookups.
    pub(crate) admin_codes: HashMap<AdminCode, FleetId>,
    pub(crate) share_codes: HashMap<ShareCode, VehicleId>,
}

impl EntityStore {
    pub fn new() -> Self {
        Self::with_clock(Arc::new(SystemClock))
    }

    pub fn with_clock(clock: Arc<dyn Clock>) -> Self {
        Self {
            inner: Arc::new(Mutex::new(StoreInner::default())),
            clock,
        }
    }

    pub(crate) fn now(&self) -> DateTime<Utc> {
        self.clock.now()
    }
}

impl Default for EntityStore {
    fn default() -> Self {
        Self::new()
    }
}

impl StoreInner {
    /// Drop a fleet together with all of its members and indexes.
    pub(crate) fn remove_fleet_cascade(&mut self, fleet_id: &FleetId) {
        if let Some(fleet) = self.fleets.remove(fleet_id) {
            self.admin_codes.remove(&fleet.admin_code);
        }
        for vehicle_id in self.fleet_members.remove(fleet_id).unwrap_or_default() {
            if let Some(vehicle) = self.vehicles.remove(&vehicle_id) {
                self.share_codes.remove(&vehicle.share_code);
            }
        }
    }
}
