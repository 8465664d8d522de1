pub mod config;

use std::sync::Arc;
use std::time::Duration;

use axum::{
    Router,
    extract::{State, WebSocketUpgrade},
    response::IntoResponse,
    routing::get,
};
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

use huddle_api::{AppState, AppStateInner};
use huddle_db::Database;
use huddle_gateway::{Hub, connection};

#[derive(Clone)]
struct ServerState {
    hub: Hub<Database>,
    heartbeat_interval: Duration,
}

/// Full HTTP + WebSocket application over one database.
pub fn build_app(db: Arc<Database>, heartbeat_interval: Duration) -> Router {
    let hub = Hub::new(db.clone());

    let app_state: AppState = Arc::new(AppStateInner {
        db,
        hub: hub.clone(),
    });

    let state = ServerState {
        hub,
        heartbeat_interval,
    };

    let ws_route = Router::new()
        .route("/gateway", get(ws_upgrade))
        .with_state(state);

    Router::new()
        .route("/health", get(|| async { "ok" }))
        .merge(huddle_api::routes(app_state))
        .merge(ws_route)
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
}

async fn ws_upgrade(State(state): State<ServerState>, ws: WebSocketUpgrade) -> impl IntoResponse {
    ws.on_upgrade(move |socket| connection::handle_connection(socket, state.hub, state.heartbeat_interval))
}
