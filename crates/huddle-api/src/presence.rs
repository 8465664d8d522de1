use axum::{
    Json,
    extract::{Path, State},
    http::StatusCode,
    response::IntoResponse,
};
use tracing::error;

use crate::AppState;

/// Reconciled roster of a project, same shape as `updateOnlineUsers`.
pub async fn get_online_users(
    State(state): State<AppState>,
    Path(project_id): Path<i64>,
) -> Result<impl IntoResponse, StatusCode> {
    let roster = state.hub.project_users(project_id).await.map_err(|e| {
        error!("Loading roster for project {} failed: {:#}", project_id, e);
        StatusCode::INTERNAL_SERVER_ERROR
    })?;

    Ok(Json(roster))
}
