//! HTTP route definitions.

mod health;
mod signatures;
mod sync;

use axum::extract::DefaultBodyLimit;
use axum::http::Uri;
use axum::Router;

use crate::error::AppError;
use crate::AppState;

/// Largest accepted request body. A bootstrap push of a full device store
/// with verification results fits comfortably.
const MAX_BODY_BYTES: usize = 32 * 1024 * 1024;

/// Create all application routes. Unknown paths answer with the error
/// envelope instead of an empty 404.
pub fn create_routes() -> Router<AppState> {
    Router::new()
        .merge(health::routes())
        .merge(sync::routes())
        .merge(signatures::routes())
        .fallback(not_found)
        .layer(DefaultBodyLimit::max(MAX_BODY_BYTES))
}

async fn not_found(uri: Uri) -> AppError {
    AppError::NotFound(format!("no route for {}", uri.path()))
}
