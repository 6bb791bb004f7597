//! The request/response boundary: thin CRUD over the entity store.

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{delete, get, post};
use axum::{Json, Router};
use serde::Deserialize;

use beacon_core::ids::{AdminCode, FleetId, LocationId, ShareCode, VehicleId};
use beacon_core::records::FleetView;
use beacon_store::StoreError;

use crate::server::AppState;

#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error("{0}")]
    NotFound(String),

    #[error("{0}")]
    Validation(String),
}

impl From<StoreError> for ApiError {
    fn from(e: StoreError) -> Self {
        match e {
            StoreError::NotFound(what) => ApiError::NotFound(what),
            StoreError::Validation(msg) => ApiError::Validation(msg),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match &self {
            ApiError::NotFound(_) => StatusCode::NOT_FOUND,
            ApiError::Validation(_) => StatusCode::UNPROCESSABLE_ENTITY,
        };
        let body = Json(serde_json::json!({ "error": self.to_string() }));
        (status, body).into_response()
    }
}

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/locations", post(create_location))
        .route(
            "/locations/{id}",
            get(get_location).delete(delete_location),
        )
        .route("/fleets", post(create_fleet))
        .route("/fleets/{id}", get(get_fleet).delete(delete_fleet))
        .route("/fleets/admin/{code}", get(get_fleet_by_admin))
        .route(
            "/fleets/{id}/vehicles",
            post(create_vehicle).get(list_vehicles),
        )
        .route(
            "/fleets/{id}/vehicles/{vehicle_id}",
            delete(delete_vehicle),
        )
        .route("/vehicles/share/{code}", get(get_vehicle_by_share))
}

// ── Locations ──

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateLocationRequest {
    pub latitude: f64,
    pub longitude: f64,
    pub name: Option<String>,
    #[serde(default = "default_live")]
    pub live: bool,
    pub expires_in_minutes: i64,
}

fn default_live() -> bool {
    true
}

async fn create_location(
    State(state): State<AppState>,
    Json(req): Json<CreateLocationRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let record = state.store.create_location(
        req.latitude,
        req.longitude,
        req.name,
        req.live,
        req.expires_in_minutes,
    )?;
    Ok((StatusCode::CREATED, Json(record)))
}

async fn get_location(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let record = state.store.get_location(&LocationId::from_raw(id))?;
    Ok(Json(record))
}

async fn delete_location(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    state.store.delete_location(&LocationId::from_raw(id))?;
    Ok(StatusCode::NO_CONTENT)
}

// ── Fleets ──

#[derive(Debug, Deserialize)]
pub struct CreateFleetRequest {
    pub name: String,
}

async fn create_fleet(
    State(state): State<AppState>,
    Json(req): Json<CreateFleetRequest>,
) -> impl IntoResponse {
    // The only response that ever carries the admin code.
    let record = state.store.create_fleet(req.name);
    (StatusCode::CREATED, Json(record))
}

async fn get_fleet(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let record = state.store.get_fleet(&FleetId::from_raw(id))?;
    Ok(Json(FleetView::from(&record)))
}

async fn get_fleet_by_admin(
    State(state): State<AppState>,
    Path(code): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let record = state
        .store
        .get_fleet_by_admin_code(&AdminCode::from_raw(code))?;
    Ok(Json(record))
}

async fn delete_fleet(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    state.store.delete_fleet(&FleetId::from_raw(id))?;
    Ok(StatusCode::NO_CONTENT)
}

// ── Vehicles ──

#[derive(Debug, Deserialize)]
pub struct CreateVehicleRequest {
    pub name: String,
}

async fn create_vehicle(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(req): Json<CreateVehicleRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let record = state
        .store
        .create_vehicle(&FleetId::from_raw(id), req.name)?;
    Ok((StatusCode::CREATED, Json(record)))
}

async fn list_vehicles(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> impl IntoResponse {
    Json(state.store.list_vehicles(&FleetId::from_raw(id)))
}

async fn get_vehicle_by_share(
    State(state): State<AppState>,
    Path(code): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let (vehicle, fleet_name) = state
        .store
        .get_vehicle_by_share_code(&ShareCode::from_raw(code))?;
    Ok(Json(serde_json::json!({
        "vehicle": vehicle,
        "fleetName": fleet_name,
    })))
}

async fn delete_vehicle(
    State(state): State<AppState>,
    Path((fleet_id, vehicle_id)): Path<(String, String)>,
) -> Result<impl IntoResponse, ApiError> {
    let vehicle_id = VehicleId::from_raw(vehicle_id);
    let vehicle = state.store.get_vehicle(&vehicle_id)?;
    if vehicle.fleet_id.as_str() != fleet_id {
        return Err(ApiError::NotFound(format!("vehicle {vehicle_id}")));
    }
    state.store.delete_vehicle(&vehicle_id)?;
    Ok(StatusCode::NO_CONTENT)
}
