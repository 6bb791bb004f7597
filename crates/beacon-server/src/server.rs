use std::sync::Arc;

use axum::extract::ws::WebSocketUpgrade;
use axum::extract::State;
use axum::response::IntoResponse;
use axum::routing::get;
use axum::Router;
use tower_http::cors::CorsLayer;

use beacon_store::EntityStore;

use crate::protocol::{Channels, ProtocolHandler};
use crate::ws;

/// Server configuration.
pub struct ServerConfig {
    pub bind: String,
    pub port: u16,
    pub max_send_queue: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: "0.0.0.0".into(),
            port: 8090,
            max_send_queue: 256,
        }
    }
}

/// Shared application state passed to Axum handlers.
#[derive(Clone)]
pub struct AppState {
    pub store: EntityStore,
    pub channels: Arc<Channels>,
    pub handler: Arc<ProtocolHandler>,
    pub max_send_queue: usize,
}

impl AppState {
    pub fn new(store: EntityStore, max_send_queue: usize) -> Self {
        let channels = Arc::new(Channels::new());
        let handler = Arc::new(ProtocolHandler::new(store.clone(), Arc::clone(&channels)));
        Self {
            store,
            channels,
            handler,
            max_send_queue,
        }
    }
}

/// Build the Axum router with all routes.
pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/ws", get(ws_handler))
        .route("/health", get(health_handler))
        .nest("/api", crate::http::router())
        .with_state(state)
        .layer(CorsLayer::permissive())
}

/// Create and start the server. Returns a handle that keeps it alive.
pub async fn start(config: ServerConfig, store: EntityStore) -> Result<ServerHandle, std::io::Error> {
    let state = AppState::new(store, config.max_send_queue);
    let router = build_router(state);

    let addr = format!("{}:{}", config.bind, config.port);
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    let local_addr = listener.local_addr()?;

    tracing::info!(port = local_addr.port(), "Beacon server started");

    let server_handle = tokio::spawn(async move {
        axum::serve(listener, router).await.ok();
    });

    Ok(ServerHandle {
        port: local_addr.port(),
        _server: server_handle,
    })
}

/// Handle returned by `start()`. Dropping it does not stop the server,
/// but it carries the bound port for callers that asked for port 0.
pub struct ServerHandle {
    pub port: u16,
    _server: tokio::task::JoinHandle<()>,
}

/// WebSocket upgrade handler.
async fn ws_handler(ws: WebSocketUpgrade, State(state): State<AppState>) -> impl IntoResponse {
    ws.on_upgrade(move |socket| {
        ws::handle_socket(socket, state.handler, state.max_send_queue)
    })
}

/// Health check HTTP endpoint.
async fn health_handler() -> impl IntoResponse {
    axum::Json(serde_json::json!({ "status": "healthy" }))
}
