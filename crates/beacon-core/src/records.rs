use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::ids::{AdminCode, FleetId, LocationId, ShareCode, VehicleId};

/// Time-to-live bounds for a solo share, in minutes.
pub const MIN_TTL_MINUTES: i64 = 1;
pub const MAX_TTL_MINUTES: i64 = 1440;

/// Fleets always live exactly one day.
pub const FLEET_TTL_HOURS: i64 = 24;

/// Vehicle marker colors, assigned round-robin by creation order.
pub const VEHICLE_PALETTE: &[&str] = &[
    "#e6194b", "#3cb44b", "#ffe119", "#4363d8", "#f58231", "#911eb4",
    "#46f0f0", "#f032e6", "#bcf60c", "#fabebe", "#008080", "#e6beff",
];

/// Pick the palette color for the n-th vehicle created in a fleet.
pub fn palette_color(creation_index: usize) -> &'static str {
    VEHICLE_PALETTE[creation_index % VEHICLE_PALETTE.len()]
}

/// A single shared position stream.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LocationRecord {
    pub id: LocationId,
    pub latitude: f64,
    pub longitude: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub live: bool,
    pub updated_at: DateTime<Utc>,
}

/// A named group of vehicles sharing one feed. The admin code is the
/// management capability and must never leave through the public view.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FleetRecord {
    pub id: FleetId,
    pub name: String,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub admin_code: AdminCode,
}

/// Read-only projection of a fleet, admin code stripped.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FleetView {
    pub id: FleetId,
    pub name: String,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

impl From<&FleetRecord> for FleetView {
    fn from(fleet: &FleetRecord) -> Self {
        Self {
            id: fleet.id.clone(),
            name: fleet.name.clone(),
            created_at: fleet.created_at,
            expires_at: fleet.expires_at,
        }
    }
}

/// One member of a fleet with its own publisher slot.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VehicleRecord {
    pub id: VehicleId,
    pub fleet_id: FleetId,
    pub name: String,
    pub color: String,
    pub share_code: ShareCode,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub latitude: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub longitude: Option<f64>,
    pub live: bool,
    pub updated_at: DateTime<Utc>,
}

/// True when both coordinates are ordinary finite numbers. NaN and the
/// infinities come in from clients as easily as from arithmetic.
pub fn coordinates_valid(latitude: f64, longitude: f64) -> bool {
    latitude.is_finite() && longitude.is_finite()
}
