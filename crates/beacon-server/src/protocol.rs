//! Per-connection protocol state machine.
//!
//! A connection starts idle and commits to exactly one role for its
//! lifetime: solo subscriber, fleet subscriber, solo publisher, or vehicle
//! publisher. Frames that violate sequencing, reference absent records, or
//! fail to parse are dropped without closing the connection; nothing on
//! this layer is fatal to the transport.

use std::sync::Arc;

use tokio::sync::mpsc;

use beacon_core::ids::{ConnectionId, FleetId, LocationId, VehicleId};
use beacon_core::wire::{ClientMessage, Position, ServerMessage, VehicleStoppedData};
use beacon_store::EntityStore;

use crate::registry::ChannelRegistry;

/// Both topologies' registries, shared by every connection task.
pub struct Channels {
    pub solo: ChannelRegistry<LocationId>,
    pub fleet: ChannelRegistry<FleetId, VehicleId>,
}

impl Channels {
    pub fn new() -> Self {
        Self {
            solo: ChannelRegistry::new(),
            fleet: ChannelRegistry::new(),
        }
    }
}

impl Default for Channels {
    fn default() -> Self {
        Self::new()
    }
}

/// The one role a connection holds for its lifetime.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Role {
    Idle,
    SoloSubscriber(LocationId),
    FleetSubscriber(FleetId),
    SoloPublisher(LocationId),
    VehiclePublisher {
        vehicle_id: VehicleId,
        fleet_id: FleetId,
    },
    /// The publisher stopped explicitly; all further frames are dropped.
    Finished,
}

/// Server-side view of one streaming connection.
pub struct ConnState {
    pub id: ConnectionId,
    pub tx: mpsc::Sender<String>,
    role: Role,
}

impl ConnState {
    pub fn new(tx: mpsc::Sender<String>) -> Self {
        Self {
            id: ConnectionId::new(),
            tx,
            role: Role::Idle,
        }
    }

    pub fn role(&self) -> &Role {
        &self.role
    }

    fn send(&self, message: &ServerMessage) {
        if let Some(json) = message.to_json() {
            let _ = self.tx.try_send(json);
        }
    }
}

pub struct ProtocolHandler {
    store: EntityStore,
    channels: Arc<Channels>,
}

impl ProtocolHandler {
    pub fn new(store: EntityStore, channels: Arc<Channels>) -> Self {
        Self { store, channels }
    }

    /// Interpret one inbound text frame.
    pub fn handle_frame(&self, conn: &mut ConnState, raw: &str) {
        let message: ClientMessage = match serde_json::from_str(raw) {
            Ok(m) => m,
            Err(e) => {
                tracing::debug!(conn_id = %conn.id, error = %e, "Dropping malformed frame");
                return;
            }
        };

        match message {
            ClientMessage::Subscribe { location_id } => self.subscribe_solo(conn, location_id),
            ClientMessage::SubscribeFleet { fleet_id } => self.subscribe_fleet(conn, fleet_id),
            ClientMessage::Share { location_id } => self.share_solo(conn, location_id),
            ClientMessage::Update { data } => self.update_solo(conn, data),
            ClientMessage::Stop => self.stop_solo(conn),
            ClientMessage::ShareVehicle { vehicle_id } => self.share_vehicle(conn, vehicle_id),
            ClientMessage::UpdateVehicle { data } => self.update_vehicle(conn, data),
            ClientMessage::StopVehicle => self.stop_vehicle(conn),
        }
    }

    /// Transport closed. Run the cleanup appropriate to the role last held.
    pub fn on_close(&self, conn: &mut ConnState) {
        match std::mem::replace(&mut conn.role, Role::Finished) {
            Role::SoloSubscriber(location_id) => {
                self.channels.solo.unsubscribe(&location_id, &conn.id);
            }
            Role::FleetSubscriber(fleet_id) => {
                self.channels.fleet.unsubscribe(&fleet_id, &conn.id);
            }
            Role::SoloPublisher(location_id) => {
                self.end_solo_publish(conn, &location_id);
            }
            Role::VehiclePublisher {
                vehicle_id,
                fleet_id,
            } => {
                self.end_vehicle_publish(conn, &vehicle_id, &fleet_id);
            }
            Role::Idle | Role::Finished => {}
        }
        tracing::debug!(conn_id = %conn.id, "Connection closed, cleanup done");
    }

    // ── Solo channel ──

    fn subscribe_solo(&self, conn: &mut ConnState, location_id: LocationId) {
        if conn.role != Role::Idle {
            tracing::debug!(conn_id = %conn.id, "Dropping subscribe, role already taken");
            return;
        }
        self.channels
            .solo
            .subscribe(&location_id, conn.id.clone(), conn.tx.clone());
        conn.role = Role::SoloSubscriber(location_id.clone());

        // Snapshot for immediate delivery. An absent record sends nothing;
        // the viewer will see frames if a sharer appears later.
        if let Ok(record) = self.store.get_location(&location_id) {
            conn.send(&ServerMessage::Location { data: record });
        }
    }

    fn share_solo(&self, conn: &mut ConnState, location_id: LocationId) {
        if conn.role != Role::Idle {
            tracing::debug!(conn_id = %conn.id, "Dropping share, role already taken");
            return;
        }
        let record = match self.store.set_location_live(&location_id, true) {
            Ok(r) => r,
            Err(e) => {
                tracing::debug!(conn_id = %conn.id, error = %e, "Dropping share");
                return;
            }
        };

        if let Some(superseded) = self
            .channels
            .solo
            .register_publisher(&location_id, conn.id.clone())
        {
            tracing::info!(
                location_id = %location_id,
                old_conn = %superseded,
                new_conn = %conn.id,
                "Publisher superseded"
            );
        }
        conn.role = Role::SoloPublisher(location_id.clone());

        if let Some(json) = (ServerMessage::Location { data: record }).to_json() {
            self.channels.solo.broadcast(&location_id, &json);
        }
    }

    fn update_solo(&self, conn: &mut ConnState, position: Position) {
        let Role::SoloPublisher(ref location_id) = conn.role else {
            tracing::debug!(conn_id = %conn.id, "Dropping update before share");
            return;
        };
        let location_id = location_id.clone();

        // A superseded publisher may still be connected; its frames are no
        // longer authoritative.
        if !self.channels.solo.is_publisher(&location_id, &conn.id) {
            tracing::debug!(conn_id = %conn.id, "Dropping update from superseded publisher");
            return;
        }

        match self.store.update_location(&location_id, position) {
            Ok(record) => {
                if let Some(json) = (ServerMessage::Location { data: record }).to_json() {
                    self.channels.solo.broadcast(&location_id, &json);
                }
            }
            Err(e) => {
                tracing::debug!(conn_id = %conn.id, error = %e, "Dropping update");
            }
        }
    }

    fn stop_solo(&self, conn: &mut ConnState) {
        match std::mem::replace(&mut conn.role, Role::Finished) {
            Role::SoloPublisher(location_id) => self.end_solo_publish(conn, &location_id),
            other => {
                // Not this connection's to stop; put the role back.
                conn.role = other;
                tracing::debug!(conn_id = %conn.id, "Dropping stop without active share");
            }
        }
    }

    fn end_solo_publish(&self, conn: &ConnState, location_id: &LocationId) {
        if self.channels.solo.unregister_publisher(location_id, &conn.id) {
            let _ = self.store.set_location_live(location_id, false);
            if let Some(json) = ServerMessage::Stopped.to_json() {
                self.channels.solo.broadcast(location_id, &json);
            }
        }
    }

    // ── Fleet channel ──

    fn subscribe_fleet(&self, conn: &mut ConnState, fleet_id: FleetId) {
        if conn.role != Role::Idle {
            tracing::debug!(conn_id = %conn.id, "Dropping subscribeFleet, role already taken");
            return;
        }
        self.channels
            .fleet
            .subscribe(&fleet_id, conn.id.clone(), conn.tx.clone());
        conn.role = Role::FleetSubscriber(fleet_id.clone());

        // Zero publishers, an unknown fleet, and an expired fleet all look
        // the same here: an empty-but-valid snapshot.
        let vehicles = self.store.list_vehicles(&fleet_id);
        conn.send(&ServerMessage::Vehicles { data: vehicles });
    }

    fn share_vehicle(&self, conn: &mut ConnState, vehicle_id: VehicleId) {
        if conn.role != Role::Idle {
            tracing::debug!(conn_id = %conn.id, "Dropping shareVehicle, role already taken");
            return;
        }
        let record = match self.store.set_vehicle_live(&vehicle_id, true) {
            Ok(r) => r,
            Err(e) => {
                tracing::debug!(conn_id = %conn.id, error = %e, "Dropping shareVehicle");
                return;
            }
        };
        let fleet_id = record.fleet_id.clone();

        if let Some(superseded) = self
            .channels
            .fleet
            .register_publisher(&vehicle_id, conn.id.clone())
        {
            tracing::info!(
                vehicle_id = %vehicle_id,
                old_conn = %superseded,
                new_conn = %conn.id,
                "Vehicle publisher superseded"
            );
        }
        conn.role = Role::VehiclePublisher {
            vehicle_id,
            fleet_id: fleet_id.clone(),
        };

        if let Some(json) = (ServerMessage::VehicleUpdate { data: record }).to_json() {
            self.channels.fleet.broadcast(&fleet_id, &json);
        }
    }

    fn update_vehicle(&self, conn: &mut ConnState, position: Position) {
        let Role::VehiclePublisher {
            ref vehicle_id,
            ref fleet_id,
        } = conn.role
        else {
            tracing::debug!(conn_id = %conn.id, "Dropping updateVehicle before shareVehicle");
            return;
        };
        let (vehicle_id, fleet_id) = (vehicle_id.clone(), fleet_id.clone());

        if !self.channels.fleet.is_publisher(&vehicle_id, &conn.id) {
            tracing::debug!(conn_id = %conn.id, "Dropping updateVehicle from superseded publisher");
            return;
        }

        match self.store.update_vehicle(&vehicle_id, position) {
            Ok(record) => {
                if let Some(json) = (ServerMessage::VehicleUpdate { data: record }).to_json() {
                    self.channels.fleet.broadcast(&fleet_id, &json);
                }
            }
            Err(e) => {
                tracing::debug!(conn_id = %conn.id, error = %e, "Dropping updateVehicle");
            }
        }
    }

    fn stop_vehicle(&self, conn: &mut ConnState) {
        match std::mem::replace(&mut conn.role, Role::Finished) {
            Role::VehiclePublisher {
                vehicle_id,
                fleet_id,
            } => self.end_vehicle_publish(conn, &vehicle_id, &fleet_id),
            other => {
                conn.role = other;
                tracing::debug!(conn_id = %conn.id, "Dropping stopVehicle without active share");
            }
        }
    }

    fn end_vehicle_publish(
        &self,
        conn: &ConnState,
        vehicle_id: &VehicleId,
        fleet_id: &FleetId,
    ) {
        if self
            .channels
            .fleet
            .unregister_publisher(vehicle_id, &conn.id)
        {
            let _ = self.store.set_vehicle_live(vehicle_id, false);
            let message = ServerMessage::VehicleStopped {
                data: VehicleStoppedData {
                    vehicle_id: vehicle_id.clone(),
                },
            };
            if let Some(json) = message.to_json() {
                self.channels.fleet.broadcast(fleet_id, &json);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::mpsc::Receiver;

    fn setup() -> (ProtocolHandler, EntityStore, Arc<Channels>) {
        let store = EntityStore::new();
        let channels = Arc::new(Channels::new());
        let handler = ProtocolHandler::new(store.clone(), Arc::clone(&channels));
        (handler, store, channels)
    }

    fn connect() -> (ConnState, Receiver<String>) {
        let (tx, rx) = mpsc::channel(32);
        (ConnState::new(tx), rx)
    }

    fn recv_frame(rx: &mut Receiver<String>) -> serde_json::Value {
        serde_json::from_str(&rx.try_recv().expect("expected a frame")).unwrap()
    }

    #[test]
    fn subscribe_receives_snapshot() {
        let (handler, store, _) = setup();
        let loc = store.create_location(40.0, -73.0, None, true, 30).unwrap();
        let (mut conn, mut rx) = connect();

        handler.handle_frame(
            &mut conn,
            &format!(r#"{{"type":"subscribe","locationId":"{}"}}"#, loc.id),
        );

        let frame = recv_frame(&mut rx);
        assert_eq!(frame["type"], "location");
        assert_eq!(frame["data"]["latitude"], 40.0);
        assert_eq!(*conn.role(), Role::SoloSubscriber(loc.id));
    }

    #[test]
    fn subscribe_unknown_location_sends_nothing_but_registers() {
        let (handler, _, channels) = setup();
        let (mut conn, mut rx) = connect();
        let ghost = LocationId::new();

        handler.handle_frame(
            &mut conn,
            &format!(r#"{{"type":"subscribe","locationId":"{ghost}"}}"#),
        );

        assert!(rx.try_recv().is_err());
        assert_eq!(channels.solo.subscriber_count(&ghost), 1);
    }

    #[test]
    fn fleet_subscribe_with_no_vehicles_gets_empty_snapshot() {
        let (handler, store, _) = setup();
        let fleet = store.create_fleet("empty");
        let (mut conn, mut rx) = connect();

        handler.handle_frame(
            &mut conn,
            &format!(r#"{{"type":"subscribeFleet","fleetId":"{}"}}"#, fleet.id),
        );

        let frame = recv_frame(&mut rx);
        assert_eq!(frame["type"], "vehicles");
        assert_eq!(frame["data"].as_array().unwrap().len(), 0);
    }

    #[test]
    fn update_before_share_is_dropped() {
        let (handler, _, _) = setup();
        let (mut conn, mut rx) = connect();

        handler.handle_frame(
            &mut conn,
            r#"{"type":"update","data":{"latitude":1.0,"longitude":2.0}}"#,
        );

        assert_eq!(*conn.role(), Role::Idle);
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn stop_from_a_subscriber_keeps_the_subscription() {
        let (handler, store, channels) = setup();
        let loc = store.create_location(0.0, 0.0, None, false, 30).unwrap();

        let (mut conn, mut rx) = connect();
        handler.handle_frame(
            &mut conn,
            &format!(r#"{{"type":"subscribe","locationId":"{}"}}"#, loc.id),
        );
        recv_frame(&mut rx);

        handler.handle_frame(&mut conn, r#"{"type":"stop"}"#);
        assert_eq!(*conn.role(), Role::SoloSubscriber(loc.id.clone()));
        assert_eq!(channels.solo.subscriber_count(&loc.id), 1);
    }

    #[test]
    fn malformed_frame_is_dropped_without_state_change() {
        let (handler, _, _) = setup();
        let (mut conn, _rx) = connect();

        handler.handle_frame(&mut conn, "not json at all");
        handler.handle_frame(&mut conn, r#"{"type":"warp"}"#);
        handler.handle_frame(
            &mut conn,
            r#"{"type":"update","data":{"latitude":"north","longitude":2.0}}"#,
        );

        assert_eq!(*conn.role(), Role::Idle);
    }

    #[test]
    fn share_then_update_broadcasts_to_subscribers() {
        let (handler, store, _) = setup();
        let loc = store.create_location(0.0, 0.0, None, false, 30).unwrap();

        let (mut viewer, mut viewer_rx) = connect();
        handler.handle_frame(
            &mut viewer,
            &format!(r#"{{"type":"subscribe","locationId":"{}"}}"#, loc.id),
        );
        let _snapshot = recv_frame(&mut viewer_rx);

        let (mut sharer, _sharer_rx) = connect();
        handler.handle_frame(
            &mut sharer,
            &format!(r#"{{"type":"share","locationId":"{}"}}"#, loc.id),
        );
        let live_frame = recv_frame(&mut viewer_rx);
        assert_eq!(live_frame["data"]["live"], true);

        handler.handle_frame(
            &mut sharer,
            r#"{"type":"update","data":{"latitude":40.0,"longitude":-73.0}}"#,
        );
        let update = recv_frame(&mut viewer_rx);
        assert_eq!(update["type"], "location");
        assert_eq!(update["data"]["latitude"], 40.0);
        assert_eq!(update["data"]["longitude"], -73.0);
    }

    #[test]
    fn stop_notifies_subscribers_and_clears_live() {
        let (handler, store, _) = setup();
        let loc = store.create_location(0.0, 0.0, None, false, 30).unwrap();

        let (mut viewer, mut viewer_rx) = connect();
        handler.handle_frame(
            &mut viewer,
            &format!(r#"{{"type":"subscribe","locationId":"{}"}}"#, loc.id),
        );
        recv_frame(&mut viewer_rx);

        let (mut sharer, _sharer_rx) = connect();
        handler.handle_frame(
            &mut sharer,
            &format!(r#"{{"type":"share","locationId":"{}"}}"#, loc.id),
        );
        recv_frame(&mut viewer_rx);

        handler.handle_frame(&mut sharer, r#"{"type":"stop"}"#);
        let frame = recv_frame(&mut viewer_rx);
        assert_eq!(frame["type"], "stopped");
        assert!(!store.get_location(&loc.id).unwrap().live);
        assert_eq!(*sharer.role(), Role::Finished);
    }

    #[test]
    fn unclean_close_behaves_like_stop() {
        let (handler, store, _) = setup();
        let loc = store.create_location(0.0, 0.0, None, false, 30).unwrap();

        let (mut viewer, mut viewer_rx) = connect();
        handler.handle_frame(
            &mut viewer,
            &format!(r#"{{"type":"subscribe","locationId":"{}"}}"#, loc.id),
        );
        recv_frame(&mut viewer_rx);

        let (mut sharer, _sharer_rx) = connect();
        handler.handle_frame(
            &mut sharer,
            &format!(r#"{{"type":"share","locationId":"{}"}}"#, loc.id),
        );
        recv_frame(&mut viewer_rx);

        // No explicit stop: the transport just dies.
        handler.on_close(&mut sharer);

        let frame = recv_frame(&mut viewer_rx);
        assert_eq!(frame["type"], "stopped");
        assert!(!store.get_location(&loc.id).unwrap().live);
    }

    #[test]
    fn superseded_publisher_updates_are_ignored() {
        let (handler, store, _) = setup();
        let loc = store.create_location(0.0, 0.0, None, false, 30).unwrap();

        let (mut first, _rx1) = connect();
        handler.handle_frame(
            &mut first,
            &format!(r#"{{"type":"share","locationId":"{}"}}"#, loc.id),
        );
        let (mut second, _rx2) = connect();
        handler.handle_frame(
            &mut second,
            &format!(r#"{{"type":"share","locationId":"{}"}}"#, loc.id),
        );

        handler.handle_frame(
            &mut first,
            r#"{"type":"update","data":{"latitude":99.0,"longitude":99.0}}"#,
        );
        // The stale publisher's write never landed.
        assert_eq!(store.get_location(&loc.id).unwrap().latitude, 0.0);

        handler.handle_frame(
            &mut second,
            r#"{"type":"update","data":{"latitude":40.0,"longitude":-73.0}}"#,
        );
        assert_eq!(store.get_location(&loc.id).unwrap().latitude, 40.0);
    }

    #[test]
    fn superseded_publisher_close_does_not_notify_stop() {
        let (handler, store, _) = setup();
        let loc = store.create_location(0.0, 0.0, None, false, 30).unwrap();

        let (mut viewer, mut viewer_rx) = connect();
        handler.handle_frame(
            &mut viewer,
            &format!(r#"{{"type":"subscribe","locationId":"{}"}}"#, loc.id),
        );
        recv_frame(&mut viewer_rx);

        let (mut first, _rx1) = connect();
        handler.handle_frame(
            &mut first,
            &format!(r#"{{"type":"share","locationId":"{}"}}"#, loc.id),
        );
        recv_frame(&mut viewer_rx);
        let (mut second, _rx2) = connect();
        handler.handle_frame(
            &mut second,
            &format!(r#"{{"type":"share","locationId":"{}"}}"#, loc.id),
        );
        recv_frame(&mut viewer_rx);

        handler.on_close(&mut first);
        // The replacement still holds the slot; no stopped frame, still live.
        assert!(viewer_rx.try_recv().is_err());
        assert!(store.get_location(&loc.id).unwrap().live);
    }

    #[test]
    fn two_buggies_one_guest() {
        let (handler, store, _) = setup();
        let fleet = store.create_fleet("Resort Buggies");
        let b1 = store.create_vehicle(&fleet.id, "Buggy 1").unwrap();
        let b2 = store.create_vehicle(&fleet.id, "Buggy 2").unwrap();

        let (mut guest, mut guest_rx) = connect();
        handler.handle_frame(
            &mut guest,
            &format!(r#"{{"type":"subscribeFleet","fleetId":"{}"}}"#, fleet.id),
        );
        let snapshot = recv_frame(&mut guest_rx);
        assert_eq!(snapshot["type"], "vehicles");
        assert_eq!(snapshot["data"].as_array().unwrap().len(), 2);

        let (mut pub1, _r1) = connect();
        handler.handle_frame(
            &mut pub1,
            &format!(r#"{{"type":"shareVehicle","vehicleId":"{}"}}"#, b1.id),
        );
        let (mut pub2, _r2) = connect();
        handler.handle_frame(
            &mut pub2,
            &format!(r#"{{"type":"shareVehicle","vehicleId":"{}"}}"#, b2.id),
        );
        recv_frame(&mut guest_rx); // b1 went live
        recv_frame(&mut guest_rx); // b2 went live

        handler.handle_frame(
            &mut pub1,
            r#"{"type":"updateVehicle","data":{"latitude":10.0,"longitude":20.0}}"#,
        );
        handler.handle_frame(
            &mut pub2,
            r#"{"type":"updateVehicle","data":{"latitude":30.0,"longitude":40.0}}"#,
        );

        let first = recv_frame(&mut guest_rx);
        assert_eq!(first["type"], "vehicleUpdate");
        assert_eq!(first["data"]["id"], b1.id.as_str());
        assert_eq!(first["data"]["latitude"], 10.0);

        let second = recv_frame(&mut guest_rx);
        assert_eq!(second["data"]["id"], b2.id.as_str());
        assert_eq!(second["data"]["latitude"], 30.0);
    }

    #[test]
    fn vehicle_publisher_close_notifies_fleet() {
        let (handler, store, _) = setup();
        let fleet = store.create_fleet("f");
        let v = store.create_vehicle(&fleet.id, "a").unwrap();

        let (mut guest, mut guest_rx) = connect();
        handler.handle_frame(
            &mut guest,
            &format!(r#"{{"type":"subscribeFleet","fleetId":"{}"}}"#, fleet.id),
        );
        recv_frame(&mut guest_rx);

        let (mut publisher, _r) = connect();
        handler.handle_frame(
            &mut publisher,
            &format!(r#"{{"type":"shareVehicle","vehicleId":"{}"}}"#, v.id),
        );
        recv_frame(&mut guest_rx);

        handler.on_close(&mut publisher);
        let frame = recv_frame(&mut guest_rx);
        assert_eq!(frame["type"], "vehicleStopped");
        assert_eq!(frame["data"]["vehicleId"], v.id.as_str());
        assert!(!store.get_vehicle(&v.id).unwrap().live);
    }

    #[test]
    fn connection_cannot_take_two_roles() {
        let (handler, store, _) = setup();
        let loc = store.create_location(0.0, 0.0, None, false, 30).unwrap();
        let fleet = store.create_fleet("f");

        let (mut conn, mut rx) = connect();
        handler.handle_frame(
            &mut conn,
            &format!(r#"{{"type":"subscribe","locationId":"{}"}}"#, loc.id),
        );
        recv_frame(&mut rx);

        // Already a solo subscriber; every other join/claim is dropped.
        handler.handle_frame(
            &mut conn,
            &format!(r#"{{"type":"subscribeFleet","fleetId":"{}"}}"#, fleet.id),
        );
        handler.handle_frame(
            &mut conn,
            &format!(r#"{{"type":"share","locationId":"{}"}}"#, loc.id),
        );
        assert_eq!(*conn.role(), Role::SoloSubscriber(loc.id));
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn subscriber_close_cleans_registry() {
        let (handler, store, channels) = setup();
        let loc = store.create_location(0.0, 0.0, None, false, 30).unwrap();

        let (mut conn, mut rx) = connect();
        handler.handle_frame(
            &mut conn,
            &format!(r#"{{"type":"subscribe","locationId":"{}"}}"#, loc.id),
        );
        recv_frame(&mut rx);
        assert_eq!(channels.solo.subscriber_count(&loc.id), 1);

        handler.on_close(&mut conn);
        assert_eq!(channels.solo.subscriber_count(&loc.id), 0);
    }
}
