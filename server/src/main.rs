//! Verisync Server binary.

use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};
use verisync_engine::Schema;
use verisync_server::{app, AppState, Backend, Config};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "verisync_server=debug,tower_http=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    // Load configuration
    dotenvy::dotenv().ok();
    let config = Config::from_env()?;

    tracing::info!("Starting Verisync Server on {}:{}", config.host, config.port);
    if config.auth_secret.is_none() {
        tracing::warn!("AUTH_SECRET not set, accepting anonymous requests");
    }

    let schema = Schema::standard();
    schema.validate()?;

    let backend = Backend::connect(&config, &schema).await?;
    tracing::info!(backend = backend.name(), "Storage ready");

    let addr = format!("{}:{}", config.host, config.port);
    let state = AppState::new(backend, config, schema);

    let listener = tokio::net::TcpListener::bind(&addr).await?;
    tracing::info!("Server listening on {}", addr);

    axum::serve(listener, app(state)).await?;

    Ok(())
}
