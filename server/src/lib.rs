//! Verisync Server - the remote reconciliation service.
//!
//! Clients call `POST /sync` to push their unsynced rows and receive every row
//! that changed since their watermark, using the verisync-engine planner
//! against PostgreSQL or an in-memory dataset. Technician signature images
//! are managed under `/signatures/{username}`.

pub mod auth;
pub mod backend;
pub mod config;
pub mod db;
pub mod error;
pub mod handlers;
pub mod routes;

use std::sync::Arc;

use axum::Router;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use verisync_engine::Schema;

pub use crate::backend::{Backend, MemoryBackend};
pub use crate::config::Config;
pub use crate::error::AppError;

/// Application state shared across handlers.
#[derive(Clone)]
pub struct AppState {
    pub backend: Arc<Backend>,
    pub config: Arc<Config>,
    pub schema: Arc<Schema>,
}

impl AppState {
    pub fn new(backend: Backend, config: Config, schema: Schema) -> Self {
        Self {
            backend: Arc::new(backend),
            config: Arc::new(config),
            schema: Arc::new(schema),
        }
    }

    /// Fresh in-memory state, for development and tests.
    pub fn in_memory(config: Config) -> Self {
        Self::new(
            Backend::Memory(MemoryBackend::new()),
            config,
            Schema::standard(),
        )
    }
}

/// Build the router with tracing and CORS layers.
pub fn app(state: AppState) -> Router {
    Router::new()
        .merge(routes::create_routes())
        .layer(TraceLayer::new_for_http())
        .layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any),
        )
        .with_state(state)
}
