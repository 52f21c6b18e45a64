//! # Verisync Client
//!
//! The offline side of Verisync: a SQLite record store that business logic
//! writes to while disconnected, and a sync client that reconciles it with
//! the reconciliation service whenever a connection is available.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use serde_json::json;
//! use verisync_client::{ClientConfig, HttpTransport, LocalStore, SyncClient, SyncMode, SyncOutcome};
//! use verisync_engine::{timestamp, Decision, SyncRecord};
//!
//! # async fn run() -> verisync_client::Result<()> {
//! let config = ClientConfig::new("https://sync.example.com").with_auth_token("token");
//! let store = LocalStore::open(&config.store).await?;
//!
//! store
//!     .save(
//!         "customers",
//!         SyncRecord::new("", timestamp::now()).with_field("name", json!("ACME")),
//!     )
//!     .await?;
//!
//! let client = SyncClient::new(store, HttpTransport::new(&config)?);
//! if let SyncOutcome::Conflicts(conflicts) = client.run_sync(SyncMode::Incremental).await? {
//!     let decisions: Vec<_> = conflicts.iter().map(Decision::keep_local).collect();
//!     client.resolve(&conflicts, &decisions).await?;
//!     client.run_sync(SyncMode::Incremental).await?;
//! }
//! # Ok(())
//! # }
//! ```

pub mod apply;
pub mod client;
pub mod collector;
pub mod config;
pub mod error;
pub mod profiles;
pub mod resolver;
pub mod store;
pub mod transport;

pub use apply::{Inbound, SyncSummary};
pub use client::{SyncClient, SyncEvent, SyncMode, SyncOutcome, SyncState};
pub use collector::{Outbound, SentRow};
pub use config::{ClientConfig, ConfigError, StoreConfig};
pub use error::{ClientError, Result};
pub use profiles::{Profile, ProfileCache, ProfileSet, ProfileTest};
pub use resolver::ResolutionSummary;
pub use store::{LocalRow, LocalStore};
pub use transport::{HttpTransport, SyncTransport};
