//! JSON envelopes exchanged over the streaming connection.
//!
//! Every frame is `{ "type": ..., ... }`. Unknown types and malformed
//! payloads fail to parse; the handler drops them without closing the
//! connection.

use serde::{Deserialize, Serialize};

use crate::ids::{FleetId, LocationId, VehicleId};
use crate::records::{LocationRecord, VehicleRecord};

/// A raw coordinate pair as sent by publishers.
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq)]
pub struct Position {
    pub latitude: f64,
    pub longitude: f64,
}

/// Client → server frames, both topologies.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum ClientMessage {
    /// Join a solo channel as a viewer.
    #[serde(rename_all = "camelCase")]
    Subscribe { location_id: LocationId },
    /// Claim the publisher slot for a solo channel.
    #[serde(rename_all = "camelCase")]
    Share { location_id: LocationId },
    /// Push a new position on the claimed solo channel.
    Update { data: Position },
    /// End the solo publish session.
    Stop,

    /// Join a fleet channel as a viewer.
    #[serde(rename_all = "camelCase")]
    SubscribeFleet { fleet_id: FleetId },
    /// Claim the publisher slot for one vehicle.
    #[serde(rename_all = "camelCase")]
    ShareVehicle { vehicle_id: VehicleId },
    /// Push a new position for the claimed vehicle.
    UpdateVehicle { data: Position },
    /// End the vehicle publish session.
    StopVehicle,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VehicleStoppedData {
    pub vehicle_id: VehicleId,
}

/// Server → client frames.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum ServerMessage {
    /// Current state of a solo channel, sent on join and on every update.
    Location { data: LocationRecord },
    /// The solo publisher stopped or went away.
    Stopped,

    /// Full member snapshot, sent when joining a fleet channel.
    Vehicles { data: Vec<VehicleRecord> },
    /// One vehicle moved.
    VehicleUpdate { data: VehicleRecord },
    /// One vehicle's publisher stopped or went away.
    VehicleStopped { data: VehicleStoppedData },
}

impl ServerMessage {
    pub fn to_json(&self) -> Option<String> {
        serde_json::to_string(self).ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    #[test]
    fn parse_subscribe() {
        let msg: ClientMessage =
            serde_json::from_str(r#"{"type":"subscribe","locationId":"loc_1"}"#).unwrap();
        match msg {
            ClientMessage::Subscribe { location_id } => {
                assert_eq!(location_id.as_str(), "loc_1");
            }
            other => panic!("wrong variant: {other:?}"),
        }
    }

    #[test]
    fn parse_update_with_coordinates() {
        let msg: ClientMessage =
            serde_json::from_str(r#"{"type":"update","data":{"latitude":40.0,"longitude":-73.0}}"#)
                .unwrap();
        match msg {
            ClientMessage::Update { data } => {
                assert_eq!(data.latitude, 40.0);
                assert_eq!(data.longitude, -73.0);
            }
            other => panic!("wrong variant: {other:?}"),
        }
    }

    #[test]
    fn parse_fleet_frames() {
        let msg: ClientMessage =
            serde_json::from_str(r#"{"type":"subscribeFleet","fleetId":"fleet_9"}"#).unwrap();
        assert!(matches!(msg, ClientMessage::SubscribeFleet { .. }));

        let msg: ClientMessage =
            serde_json::from_str(r#"{"type":"shareVehicle","vehicleId":"veh_2"}"#).unwrap();
        assert!(matches!(msg, ClientMessage::ShareVehicle { .. }));

        let msg: ClientMessage = serde_json::from_str(r#"{"type":"stopVehicle"}"#).unwrap();
        assert!(matches!(msg, ClientMessage::StopVehicle));
    }

    #[test]
    fn unknown_type_fails_to_parse() {
        let res: Result<ClientMessage, _> = serde_json::from_str(r#"{"type":"teleport"}"#);
        assert!(res.is_err());
    }

    #[test]
    fn non_numeric_coordinates_fail_to_parse() {
        let res: Result<ClientMessage, _> = serde_json::from_str(
            r#"{"type":"update","data":{"latitude":"north","longitude":-73.0}}"#,
        );
        assert!(res.is_err());
    }

    #[test]
    fn stopped_serializes_as_bare_type() {
        let json = ServerMessage::Stopped.to_json().unwrap();
        assert_eq!(json, r#"{"type":"stopped"}"#);
    }

    #[test]
    fn vehicle_stopped_carries_id() {
        let msg = ServerMessage::VehicleStopped {
            data: VehicleStoppedData {
                vehicle_id: VehicleId::from_raw("veh_7"),
            },
        };
        let json = msg.to_json().unwrap();
        assert!(json.contains(r#""type":"vehicleStopped""#));
        assert!(json.contains(r#""vehicleId":"veh_7""#));
    }

    #[test]
    fn location_frame_roundtrip() {
        let msg = ServerMessage::Location {
            data: LocationRecord {
                id: LocationId::from_raw("loc_abc"),
                latitude: 1.5,
                longitude: 2.5,
                name: Some("me".into()),
                created_at: Utc::now(),
                expires_at: Utc::now(),
                live: true,
                updated_at: Utc::now(),
            },
        };
        let json = msg.to_json().unwrap();
        let parsed: ServerMessage = serde_json::from_str(&json).unwrap();
        match parsed {
            ServerMessage::Location { data } => assert_eq!(data.id.as_str(), "loc_abc"),
            other => panic!("wrong variant: {other:?}"),
        }
    }
}
