//! Sync endpoint routes.

use axum::{
    extract::{rejection::JsonRejection, State},
    routing::post,
    Json, Router,
};
use verisync_engine::{SyncRequest, SyncResponse};

use crate::auth::AuthUser;
use crate::error::{AppError, Result};
use crate::handlers::handle_sync;
use crate::AppState;

/// Create sync routes.
pub fn routes() -> Router<AppState> {
    Router::new().route("/sync", post(sync_handler))
}

/// POST /sync - push local changes and pull everything newer.
async fn sync_handler(
    State(state): State<AppState>,
    auth: AuthUser,
    payload: std::result::Result<Json<SyncRequest>, JsonRejection>,
) -> Result<Json<SyncResponse>> {
    let Json(request) = payload.map_err(|e| AppError::BadRequest(e.body_text()))?;
    let response = handle_sync(&state, &auth, request).await?;
    Ok(Json(response))
}
