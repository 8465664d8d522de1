pub mod messages;
pub mod presence;

use std::sync::Arc;

use axum::{Router, routing::get};

use huddle_db::Database;
use huddle_gateway::Hub;

pub type AppState = Arc<AppStateInner>;

pub struct AppStateInner {
    pub db: Arc<Database>,
    pub hub: Hub<Database>,
}

/// Read-only REST routes over the chat store and the live roster.
pub fn routes(state: AppState) -> Router {
    Router::new()
        .route("/channels/{channel_id}/messages", get(messages::get_messages))
        .route("/projects/{project_id}/online", get(presence::get_online_users))
        .with_state(state)
}
