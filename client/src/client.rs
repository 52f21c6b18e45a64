//! The sync cycle state machine.
//!
//! `Idle -> Collecting -> Sending -> {Applying | Conflict | Error} -> Idle`.
//! One cycle runs at a time; a second request while one is in flight is
//! rejected with [`ClientError::SyncInProgress`]. Progress is published on a
//! `watch` channel and results are broadcast as [`SyncEvent`]s.

use std::sync::Arc;

use serde::Serialize;
use tokio::sync::{broadcast, watch, Mutex};
use tokio::task::JoinHandle;
use tracing::{error, info, warn};
use verisync_engine::{timestamp, ConflictEntry, Decision, SyncRequest, SyncResponse};

use crate::apply::{self, Inbound, SyncSummary};
use crate::collector::{self, Outbound};
use crate::error::{ClientError, Result};
use crate::profiles::ProfileCache;
use crate::resolver::{self, ResolutionSummary};
use crate::store::LocalStore;
use crate::transport::SyncTransport;

/// Where the current cycle is.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncState {
    Idle,
    Collecting,
    Sending,
    Applying,
    Conflict,
    Error,
}

/// How a cycle starts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SyncMode {
    /// Push pending rows and pull changes since the watermark.
    #[default]
    Incremental,
    /// Bootstrap from the server and replace the local store with its
    /// dataset. Pending local rows are discarded; nothing changes locally if
    /// the cycle fails.
    FullReset,
}

/// Result of a cycle that reached the server.
#[derive(Debug, Clone, PartialEq)]
pub enum SyncOutcome {
    Completed(SyncSummary),
    /// Nothing was committed on either side; resolve and sync again.
    Conflicts(Vec<ConflictEntry>),
}

/// Broadcast to subscribers as cycles finish.
#[derive(Debug, Clone, PartialEq)]
pub enum SyncEvent {
    Started { mode: SyncMode },
    Completed(SyncSummary),
    Conflict(Vec<ConflictEntry>),
    Failed { message: String, retryable: bool },
    Resolved(ResolutionSummary),
}

const EVENT_CAPACITY: usize = 32;

/// Orchestrates sync cycles against one local store.
pub struct SyncClient<T> {
    store: LocalStore,
    transport: T,
    profiles: Option<Arc<ProfileCache>>,
    in_flight: Mutex<()>,
    state: watch::Sender<SyncState>,
    events: broadcast::Sender<SyncEvent>,
}

impl<T: SyncTransport> SyncClient<T> {
    pub fn new(store: LocalStore, transport: T) -> Self {
        let (state, _) = watch::channel(SyncState::Idle);
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            store,
            transport,
            profiles: None,
            in_flight: Mutex::new(()),
            state,
            events,
        }
    }

    /// Invalidate `cache` whenever a cycle or a resolution changes the store.
    pub fn with_profile_cache(mut self, cache: Arc<ProfileCache>) -> Self {
        self.profiles = Some(cache);
        self
    }

    pub fn store(&self) -> &LocalStore {
        &self.store
    }

    pub fn transport(&self) -> &T {
        &self.transport
    }

    pub fn state(&self) -> SyncState {
        *self.state.borrow()
    }

    pub fn watch_state(&self) -> watch::Receiver<SyncState> {
        self.state.subscribe()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SyncEvent> {
        self.events.subscribe()
    }

    /// Run one cycle to completion.
    ///
    /// Transport, auth and server errors leave the store untouched. A
    /// conflict is an `Ok` outcome: nothing is marked synced and the
    /// watermark stays put.
    pub async fn run_sync(&self, mode: SyncMode) -> Result<SyncOutcome> {
        let _guard = self
            .in_flight
            .try_lock()
            .map_err(|_| ClientError::SyncInProgress)?;

        self.emit(SyncEvent::Started { mode });
        let result = self.cycle(mode).await;

        match &result {
            Ok(SyncOutcome::Completed(summary)) => {
                self.emit(SyncEvent::Completed(summary.clone()));
            }
            Ok(SyncOutcome::Conflicts(conflicts)) => {
                self.state.send_replace(SyncState::Conflict);
                self.emit(SyncEvent::Conflict(conflicts.clone()));
            }
            Err(err) => {
                self.state.send_replace(SyncState::Error);
                error!(error = %err, retryable = err.is_retryable(), "Sync failed");
                self.emit(SyncEvent::Failed {
                    message: err.to_string(),
                    retryable: err.is_retryable(),
                });
            }
        }

        self.state.send_replace(SyncState::Idle);
        result
    }

    async fn cycle(&self, mode: SyncMode) -> Result<SyncOutcome> {
        self.state.send_replace(SyncState::Collecting);
        let outbound = match mode {
            SyncMode::Incremental => collector::collect(&self.store).await?,
            SyncMode::FullReset => {
                warn!("Full reset requested; local rows are replaced once the server answers");
                Outbound::full_reset()
            }
        };

        self.state.send_replace(SyncState::Sending);
        let request = SyncRequest {
            last_sync_timestamp: outbound.watermark,
            changes: outbound.changes.clone(),
        };
        info!(
            rows = outbound.len(),
            bootstrap = request.is_bootstrap(),
            "Sending sync request"
        );
        let response = self.transport.exchange(&request).await?;

        match response {
            SyncResponse::Success {
                new_sync_timestamp,
                changes,
                uuid_map,
                skipped,
            } => {
                self.state.send_replace(SyncState::Applying);
                let inbound = Inbound {
                    new_sync_timestamp,
                    changes: &changes,
                    uuid_map: &uuid_map,
                    skipped: &skipped,
                };
                let summary = apply::apply_success(&self.store, &outbound, inbound).await?;
                self.invalidate_profiles().await;
                Ok(SyncOutcome::Completed(summary))
            }
            SyncResponse::Conflict { conflicts } => {
                warn!(count = conflicts.len(), "Sync rejected with conflicts");
                Ok(SyncOutcome::Conflicts(conflicts))
            }
            SyncResponse::Error { message } => Err(ClientError::Server(message)),
        }
    }

    /// Apply the user's decisions for conflicts reported by the last cycle.
    /// The next cycle pushes the kept rows.
    pub async fn resolve(
        &self,
        conflicts: &[ConflictEntry],
        decisions: &[Decision],
    ) -> Result<ResolutionSummary> {
        let _guard = self
            .in_flight
            .try_lock()
            .map_err(|_| ClientError::SyncInProgress)?;

        let summary =
            resolver::apply_decisions(&self.store, conflicts, decisions, timestamp::now()).await?;
        self.invalidate_profiles().await;
        self.emit(SyncEvent::Resolved(summary));
        Ok(summary)
    }

    fn emit(&self, event: SyncEvent) {
        // No subscribers is fine.
        let _ = self.events.send(event);
    }

    async fn invalidate_profiles(&self) {
        if let Some(cache) = &self.profiles {
            cache.invalidate().await;
        }
    }
}

impl<T: SyncTransport + 'static> SyncClient<T> {
    /// Run a cycle on the runtime; the result also arrives as a [`SyncEvent`].
    pub fn spawn_sync(self: &Arc<Self>, mode: SyncMode) -> JoinHandle<Result<SyncOutcome>> {
        let client = Arc::clone(self);
        tokio::spawn(async move { client.run_sync(mode).await })
    }
}
