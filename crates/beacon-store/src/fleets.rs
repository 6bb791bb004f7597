use chrono::Duration;

use beacon_core::ids::{AdminCode, FleetId, ShareCode, VehicleId};
use beacon_core::records::{
    coordinates_valid, palette_color, FleetRecord, VehicleRecord, FLEET_TTL_HOURS,
};
use beacon_core::wire::Position;

use crate::error::StoreError;
use crate::store::{EntityStore, StoreInner};

impl EntityStore {
    pub fn create_fleet(&self, name: impl Into<String>) -> FleetRecord {
        let now = self.now();
        let record = FleetRecord {
            id: FleetId::new(),
            name: name.into(),
            created_at: now,
            expires_at: now + Duration::hours(FLEET_TTL_HOURS),
            admin_code: AdminCode::new(),
        };

        let mut inner = self.inner.lock();
        inner
            .admin_codes
            .insert(record.admin_code.clone(), record.id.clone());
        inner.fleet_members.insert(record.id.clone(), Vec::new());
        inner.fleets.insert(record.id.clone(), record.clone());
        tracing::debug!(fleet_id = %record.id, "Fleet created");
        record
    }

    pub fn get_fleet(&self, id: &FleetId) -> Result<FleetRecord, StoreError> {
        let now = self.now();
        let mut inner = self.inner.lock();
        match inner.fleets.get(id) {
            Some(fleet) if fleet.expires_at > now => Ok(fleet.clone()),
            Some(_) => {
                inner.remove_fleet_cascade(id);
                tracing::debug!(fleet_id = %id, "Fleet expired, purged with members");
                Err(StoreError::NotFound(format!("fleet {id}")))
            }
            None => Err(StoreError::NotFound(format!("fleet {id}"))),
        }
    }

    pub fn get_fleet_by_admin_code(&self, code: &AdminCode) -> Result<FleetRecord, StoreError> {
        let fleet_id = {
            let inner = self.inner.lock();
            inner
                .admin_codes
                .get(code)
                .cloned()
                .ok_or_else(|| StoreError::NotFound("fleet admin code".into()))?
        };
        self.get_fleet(&fleet_id)
    }

    /// Delete a fleet and every vehicle under it.
    pub fn delete_fleet(&self, id: &FleetId) -> Result<(), StoreError> {
        let mut inner = self.inner.lock();
        if !inner.fleets.contains_key(id) {
            return Err(StoreError::NotFound(format!("fleet {id}")));
        }
        inner.remove_fleet_cascade(id);
        Ok(())
    }

    /// Add a vehicle to a fleet. The palette color comes from the member
    /// count at this instant, so ordering is deterministic but colors are
    /// not reserved across deletions.
    pub fn create_vehicle(
        &self,
        fleet_id: &FleetId,
        name: impl Into<String>,
    ) -> Result<VehicleRecord, StoreError> {
        // Touch the fleet first so an expired one is purged before we join it.
        self.get_fleet(fleet_id)?;

        let now = self.now();
        let mut inner = self.inner.lock();
        let members = inner
            .fleet_members
            .entry(fleet_id.clone())
            .or_default();

        let record = VehicleRecord {
            id: VehicleId::new(),
            fleet_id: fleet_id.clone(),
            name: name.into(),
            color: palette_color(members.len()).to_string(),
            share_code: ShareCode::new(),
            latitude: None,
            longitude: None,
            live: false,
            updated_at: now,
        };
        members.push(record.id.clone());
        inner
            .share_codes
            .insert(record.share_code.clone(), record.id.clone());
        inner.vehicles.insert(record.id.clone(), record.clone());
        tracing::debug!(vehicle_id = %record.id, fleet_id = %fleet_id, "Vehicle created");
        Ok(record)
    }

    pub fn get_vehicle(&self, id: &VehicleId) -> Result<VehicleRecord, StoreError> {
        let now = self.now();
        let mut inner = self.inner.lock();
        let vehicle = inner
            .vehicles
            .get(id)
            .cloned()
            .ok_or_else(|| StoreError::NotFound(format!("vehicle {id}")))?;

        if fleet_expired(&mut inner, &vehicle.fleet_id, now) {
            return Err(StoreError::NotFound(format!("vehicle {id}")));
        }
        Ok(vehicle)
    }

    /// Resolve a vehicle by its publish capability token, paired with the
    /// owning fleet's name for display.
    pub fn get_vehicle_by_share_code(
        &self,
        code: &ShareCode,
    ) -> Result<(VehicleRecord, String), StoreError> {
        let now = self.now();
        let mut inner = self.inner.lock();
        let vehicle_id = inner
            .share_codes
            .get(code)
            .cloned()
            .ok_or_else(|| StoreError::NotFound("vehicle share code".into()))?;
        let vehicle = inner
            .vehicles
            .get(&vehicle_id)
            .cloned()
            .ok_or_else(|| StoreError::NotFound("vehicle share code".into()))?;

        if fleet_expired(&mut inner, &vehicle.fleet_id, now) {
            return Err(StoreError::NotFound("vehicle share code".into()));
        }
        let fleet_name = inner
            .fleets
            .get(&vehicle.fleet_id)
            .map(|f| f.name.clone())
            .unwrap_or_default();
        Ok((vehicle, fleet_name))
    }

    pub fn update_vehicle(
        &self,
        id: &VehicleId,
        position: Position,
    ) -> Result<VehicleRecord, StoreError> {
        if !coordinates_valid(position.latitude, position.longitude) {
            return Err(StoreError::Validation(
                "latitude and longitude must be finite".into(),
            ));
        }

        let now = self.now();
        let mut inner = self.inner.lock();
        let fleet_id = match inner.vehicles.get(id) {
            Some(v) => v.fleet_id.clone(),
            None => return Err(StoreError::NotFound(format!("vehicle {id}"))),
        };
        if fleet_expired(&mut inner, &fleet_id, now) {
            return Err(StoreError::NotFound(format!("vehicle {id}")));
        }

        let vehicle = inner
            .vehicles
            .get_mut(id)
            .ok_or_else(|| StoreError::NotFound(format!("vehicle {id}")))?;
        vehicle.latitude = Some(position.latitude);
        vehicle.longitude = Some(position.longitude);
        vehicle.updated_at = now;
        Ok(vehicle.clone())
    }

    pub fn set_vehicle_live(
        &self,
        id: &VehicleId,
        live: bool,
    ) -> Result<VehicleRecord, StoreError> {
        let now = self.now();
        let mut inner = self.inner.lock();
        let fleet_id = match inner.vehicles.get(id) {
            Some(v) => v.fleet_id.clone(),
            None => return Err(StoreError::NotFound(format!("vehicle {id}"))),
        };
        if fleet_expired(&mut inner, &fleet_id, now) {
            return Err(StoreError::NotFound(format!("vehicle {id}")));
        }

        let vehicle = inner
            .vehicles
            .get_mut(id)
            .ok_or_else(|| StoreError::NotFound(format!("vehicle {id}")))?;
        vehicle.live = live;
        vehicle.updated_at = now;
        Ok(vehicle.clone())
    }

    pub fn delete_vehicle(&self, id: &VehicleId) -> Result<(), StoreError> {
        let mut inner = self.inner.lock();
        let vehicle = inner
            .vehicles
            .remove(id)
            .ok_or_else(|| StoreError::NotFound(format!("vehicle {id}")))?;
        inner.share_codes.remove(&vehicle.share_code);
        if let Some(members) = inner.fleet_members.get_mut(&vehicle.fleet_id) {
            members.retain(|m| m != id);
        }
        Ok(())
    }

    /// Members of a fleet in creation order. An absent or expired fleet
    /// yields an empty list rather than an error.
    pub fn list_vehicles(&self, fleet_id: &FleetId) -> Vec<VehicleRecord> {
        let now = self.now();
        let mut inner = self.inner.lock();
        if fleet_expired(&mut inner, fleet_id, now) {
            return Vec::new();
        }
        let member_ids = inner
            .fleet_members
            .get(fleet_id)
            .cloned()
            .unwrap_or_default();
        member_ids
            .iter()
            .filter_map(|id| inner.vehicles.get(id).cloned())
            .collect()
    }
}

/// Lazily purge the fleet (and members) if its expiry has passed. Returns
/// true when the fleet is unusable, whether expired-now or already gone.
fn fleet_expired(
    inner: &mut StoreInner,
    fleet_id: &FleetId,
    now: chrono::DateTime<chrono::Utc>,
) -> bool {
    match inner.fleets.get(fleet_id) {
        Some(fleet) if fleet.expires_at > now => false,
        Some(_) => {
            inner.remove_fleet_cascade(fleet_id);
            true
        }
        None => true,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use beacon_core::clock::ManualClock;
    use beacon_core::records::VEHICLE_PALETTE;
    use std::sync::Arc;

    fn setup() -> (EntityStore, Arc<ManualClock>) {
        let clock = Arc::new(ManualClock::new());
        (EntityStore::with_clock(clock.clone()), clock)
    }

    #[test]
    fn fleet_create_and_lookup() {
        let (store, _) = setup();
        let fleet = store.create_fleet("Resort Buggies");
        assert_eq!(store.get_fleet(&fleet.id).unwrap().name, "Resort Buggies");
        assert_eq!(
            store
                .get_fleet_by_admin_code(&fleet.admin_code)
                .unwrap()
                .id,
            fleet.id
        );
    }

    #[test]
    fn vehicle_colors_follow_creation_order() {
        let (store, _) = setup();
        let fleet = store.create_fleet("Resort Buggies");
        let one = store.create_vehicle(&fleet.id, "Buggy 1").unwrap();
        let two = store.create_vehicle(&fleet.id, "Buggy 2").unwrap();
        assert_eq!(one.color, VEHICLE_PALETTE[0]);
        assert_eq!(two.color, VEHICLE_PALETTE[1]);
    }

    #[test]
    fn color_can_repeat_after_deletion() {
        let (store, _) = setup();
        let fleet = store.create_fleet("f");
        let one = store.create_vehicle(&fleet.id, "a").unwrap();
        store.create_vehicle(&fleet.id, "b").unwrap();
        store.delete_vehicle(&one.id).unwrap();
        // One member left, so the next creation reuses index 1.
        let three = store.create_vehicle(&fleet.id, "c").unwrap();
        assert_eq!(three.color, VEHICLE_PALETTE[1]);
    }

    #[test]
    fn share_codes_resolve_with_fleet_name() {
        let (store, _) = setup();
        let fleet = store.create_fleet("Resort Buggies");
        let vehicle = store.create_vehicle(&fleet.id, "Buggy 1").unwrap();
        let (found, fleet_name) = store
            .get_vehicle_by_share_code(&vehicle.share_code)
            .unwrap();
        assert_eq!(found.id, vehicle.id);
        assert_eq!(fleet_name, "Resort Buggies");
    }

    #[test]
    fn share_codes_are_unique() {
        let (store, _) = setup();
        let fleet = store.create_fleet("f");
        let a = store.create_vehicle(&fleet.id, "a").unwrap();
        let b = store.create_vehicle(&fleet.id, "b").unwrap();
        assert_ne!(a.share_code, b.share_code);
    }

    #[test]
    fn delete_fleet_cascades() {
        let (store, _) = setup();
        let fleet = store.create_fleet("f");
        let v = store.create_vehicle(&fleet.id, "a").unwrap();
        store.delete_fleet(&fleet.id).unwrap();

        assert!(store.get_fleet(&fleet.id).is_err());
        assert!(store.get_vehicle(&v.id).is_err());
        assert!(store.get_vehicle_by_share_code(&v.share_code).is_err());
        assert!(store.list_vehicles(&fleet.id).is_empty());
    }

    #[test]
    fn fleet_expiry_cascades() {
        let (store, clock) = setup();
        let fleet = store.create_fleet("f");
        let v = store.create_vehicle(&fleet.id, "a").unwrap();

        clock.advance(Duration::hours(25));
        assert!(store.get_fleet(&fleet.id).is_err());
        assert!(store.get_vehicle(&v.id).is_err());
        assert!(store.list_vehicles(&fleet.id).is_empty());
        // Idempotent after the purge.
        assert!(store.get_vehicle(&v.id).is_err());
    }

    #[test]
    fn create_vehicle_in_expired_fleet_fails() {
        let (store, clock) = setup();
        let fleet = store.create_fleet("f");
        clock.advance(Duration::hours(25));
        assert!(store
            .create_vehicle(&fleet.id, "late")
            .unwrap_err()
            .is_not_found());
    }

    #[test]
    fn vehicle_update_sets_position_and_live() {
        let (store, _) = setup();
        let fleet = store.create_fleet("f");
        let v = store.create_vehicle(&fleet.id, "a").unwrap();
        assert!(v.latitude.is_none());
        assert!(!v.live);

        store.set_vehicle_live(&v.id, true).unwrap();
        let updated = store
            .update_vehicle(
                &v.id,
                Position {
                    latitude: 12.5,
                    longitude: -3.25,
                },
            )
            .unwrap();
        assert_eq!(updated.latitude, Some(12.5));
        assert_eq!(updated.longitude, Some(-3.25));
        assert!(updated.live);
    }

    #[test]
    fn vehicle_update_rejects_bad_coordinates() {
        let (store, _) = setup();
        let fleet = store.create_fleet("f");
        let v = store.create_vehicle(&fleet.id, "a").unwrap();
        let res = store.update_vehicle(
            &v.id,
            Position {
                latitude: f64::NAN,
                longitude: 0.0,
            },
        );
        assert!(matches!(res, Err(StoreError::Validation(_))));
    }

    #[test]
    fn list_vehicles_keeps_creation_order() {
        let (store, _) = setup();
        let fleet = store.create_fleet("f");
        for name in ["a", "b", "c"] {
            store.create_vehicle(&fleet.id, name).unwrap();
        }
        let names: Vec<String> = store
            .list_vehicles(&fleet.id)
            .into_iter()
            .map(|v| v.name)
            .collect();
        assert_eq!(names, vec!["a", "b", "c"]);
    }

    #[test]
    fn list_vehicles_unknown_fleet_is_empty() {
        let (store, _) = setup();
        assert!(store.list_vehicles(&FleetId::new()).is_empty());
    }
}
