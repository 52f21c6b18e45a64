//! Signature image routes.

use axum::{
    body::Bytes,
    extract::{Path, State},
    http::{header, StatusCode},
    response::IntoResponse,
    routing::post,
    Json, Router,
};
use serde_json::{json, Value};
use verisync_engine::timestamp;

use crate::auth::AuthUser;
use crate::error::Result;
use crate::handlers::{load_signature, store_signature};
use crate::AppState;

/// Create signature routes.
pub fn routes() -> Router<AppState> {
    Router::new().route(
        "/signatures/{username}",
        post(upload_signature)
            .get(get_signature)
            .delete(delete_signature),
    )
}

/// POST /signatures/{username} - replace the image with the raw request body.
async fn upload_signature(
    State(state): State<AppState>,
    auth: AuthUser,
    Path(username): Path<String>,
    body: Bytes,
) -> Result<Json<Value>> {
    let stored = store_signature(&state, &auth, &username, Some(body.to_vec())).await?;
    Ok(Json(json!({
        "status": "success",
        "uuid": stored.uuid,
        "last_modified": timestamp::format(&stored.last_modified),
    })))
}

/// GET /signatures/{username} - the stored PNG.
async fn get_signature(
    State(state): State<AppState>,
    _auth: AuthUser,
    Path(username): Path<String>,
) -> Result<impl IntoResponse> {
    let image = load_signature(&state, &username).await?;
    Ok(([(header::CONTENT_TYPE, "image/png")], image))
}

/// DELETE /signatures/{username} - clear the image, keeping the row.
async fn delete_signature(
    State(state): State<AppState>,
    auth: AuthUser,
    Path(username): Path<String>,
) -> Result<StatusCode> {
    store_signature(&state, &auth, &username, None).await?;
    Ok(StatusCode::NO_CONTENT)
}
