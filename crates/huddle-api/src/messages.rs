use axum::{
    Json,
    extract::{Path, Query, State},
    http::StatusCode,
    response::IntoResponse,
};
use serde::Deserialize;
use tracing::error;

use huddle_types::models::ChatMessage;

use crate::AppState;

const MAX_PAGE: u32 = 200;

#[derive(Debug, Deserialize)]
pub struct MessageQuery {
    #[serde(default = "default_limit")]
    pub limit: u32,
    /// Cursor: id of the oldest message from the previous page.
    pub before: Option<i64>,
}

fn default_limit() -> u32 {
    50
}

/// Channel history, newest first, with author display fields.
pub async fn get_messages(
    State(state): State<AppState>,
    Path(channel_id): Path<i64>,
    Query(query): Query<MessageQuery>,
) -> Result<impl IntoResponse, StatusCode> {
    let db = state.db.clone();
    let limit = query.limit.min(MAX_PAGE);
    let before = query.before;

    // Run blocking DB query off the async runtime
    let rows = tokio::task::spawn_blocking(move || db.get_messages(channel_id, limit, before))
        .await
        .map_err(|e| {
            error!("spawn_blocking join error: {}", e);
            StatusCode::INTERNAL_SERVER_ERROR
        })?
        .map_err(|e| {
            error!("Loading history for channel {} failed: {:#}", channel_id, e);
            StatusCode::INTERNAL_SERVER_ERROR
        })?;

    let messages: Vec<ChatMessage> = rows.into_iter().map(|row| row.into_chat_message()).collect();

    Ok(Json(messages))
}
