use chrono::Duration;

use beacon_core::ids::LocationId;
use beacon_core::records::{
    coordinates_valid, LocationRecord, MAX_TTL_MINUTES, MIN_TTL_MINUTES,
};
use beacon_core::wire::Position;

use crate::error::StoreError;
use crate::store::EntityStore;

impl EntityStore {
    /// Create a solo location share with an operator-chosen TTL.
    pub fn create_location(
        &self,
        latitude: f64,
        longitude: f64,
        name: Option<String>,
        live: bool,
        ttl_minutes: i64,
    ) -> Result<LocationRecord, StoreError> {
        if !(MIN_TTL_MINUTES..=MAX_TTL_MINUTES).contains(&ttl_minutes) {
            return Err(StoreError::Validation(format!(
                "expiresInMinutes must be between {MIN_TTL_MINUTES} and {MAX_TTL_MINUTES}, got {ttl_minutes}"
            )));
        }
        if !coordinates_valid(latitude, longitude) {
            return Err(StoreError::Validation(
                "latitude and longitude must be finite".into(),
            ));
        }

        let now = self.now();
        let record = LocationRecord {
            id: LocationId::new(),
            latitude,
            longitude,
            name,
            created_at: now,
            expires_at: now + Duration::minutes(ttl_minutes),
            live,
            updated_at: now,
        };

        let mut inner = self.inner.lock();
        inner.locations.insert(record.id.clone(), record.clone());
        tracing::debug!(location_id = %record.id, ttl_minutes, "Location created");
        Ok(record)
    }

    /// Read a location; expired records are purged and reported absent.
    pub fn get_location(&self, id: &LocationId) -> Result<LocationRecord, StoreError> {
        let now = self.now();
        let mut inner = self.inner.lock();
        match inner.locations.get(id) {
            Some(record) if record.expires_at > now => Ok(record.clone()),
            Some(_) => {
                inner.locations.remove(id);
                tracing::debug!(location_id = %id, "Location expired, purged");
                Err(StoreError::NotFound(format!("location {id}")))
            }
            None => Err(StoreError::NotFound(format!("location {id}"))),
        }
    }

    /// Overwrite position fields and refresh the last-update timestamp.
    pub fn update_location(
        &self,
        id: &LocationId,
        position: Position,
    ) -> Result<LocationRecord, StoreError> {
        if !coordinates_valid(position.latitude, position.longitude) {
            return Err(StoreError::Validation(
                "latitude and longitude must be finite".into(),
            ));
        }

        let now = self.now();
        let mut inner = self.inner.lock();
        match inner.locations.get_mut(id) {
            Some(record) if record.expires_at > now => {
                record.latitude = position.latitude;
                record.longitude = position.longitude;
                record.updated_at = now;
                Ok(record.clone())
            }
            Some(_) => {
                inner.locations.remove(id);
                Err(StoreError::NotFound(format!("location {id}")))
            }
            None => Err(StoreError::NotFound(format!("location {id}"))),
        }
    }

    /// Flip the live flag, e.g. when the publisher connects or goes away.
    pub fn set_location_live(
        &self,
        id: &LocationId,
        live: bool,
    ) -> Result<LocationRecord, StoreError> {
        let now = self.now();
        let mut inner = self.inner.lock();
        match inner.locations.get_mut(id) {
            Some(record) if record.expires_at > now => {
                record.live = live;
                record.updated_at = now;
                Ok(record.clone())
            }
            Some(_) => {
                inner.locations.remove(id);
                Err(StoreError::NotFound(format!("location {id}")))
            }
            None => Err(StoreError::NotFound(format!("location {id}"))),
        }
    }

    pub fn delete_location(&self, id: &LocationId) -> Result<(), StoreError> {
        let mut inner = self.inner.lock();
        inner
            .locations
            .remove(id)
            .map(|_| ())
            .ok_or_else(|| StoreError::NotFound(format!("location {id}")))
    }
}
