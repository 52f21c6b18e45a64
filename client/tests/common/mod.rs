//! Shared fixtures: an in-process reconciliation service and devices that
//! talk to it through a loopback transport.

#![allow(dead_code)]

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde_json::json;
use tokio::sync::Mutex;
use verisync_client::{ClientError, LocalStore, Result, SyncClient, SyncTransport};
use verisync_engine::{
    timestamp, CustomerIdentityRule, Dataset, DatasetSnapshot, Schema, SyncRecord, SyncRequest,
    SyncResponse, SyncService,
};

static CUSTOMER_IDENTITY: CustomerIdentityRule = CustomerIdentityRule;

/// The service side, shared by every device in a test.
#[derive(Clone, Default)]
pub struct TestServer {
    dataset: Arc<Mutex<Dataset>>,
    schema: Arc<Schema>,
}

impl TestServer {
    pub fn new() -> Self {
        Self::default()
    }

    /// A device with an empty local store.
    pub async fn device(&self) -> SyncClient<Loopback> {
        let store = LocalStore::in_memory().await.unwrap();
        SyncClient::new(store, self.transport())
    }

    pub fn transport(&self) -> Loopback {
        Loopback {
            server: self.clone(),
            offline: Arc::new(AtomicBool::new(false)),
            lose_responses: Arc::new(AtomicBool::new(false)),
            latency: None,
        }
    }

    /// A live server row, if any.
    pub async fn row(&self, table: &str, uuid: &str) -> Option<SyncRecord> {
        self.dataset.lock().await.get(table, uuid).cloned()
    }

    /// Export the server's state, as a backup would.
    pub async fn snapshot(&self) -> DatasetSnapshot {
        self.dataset.lock().await.snapshot(self.schema.version)
    }

    /// Roll the server back to an earlier backup.
    pub async fn restore(&self, snapshot: DatasetSnapshot) {
        *self.dataset.lock().await = Dataset::from_snapshot(snapshot);
    }

    /// Live server rows of a table.
    pub async fn live_count(&self, table: &str) -> usize {
        self.dataset
            .lock()
            .await
            .rows(table)
            .filter(|record| record.is_active())
            .count()
    }
}

/// In-process transport. Requests and responses go through JSON so the
/// wire format is exercised.
#[derive(Clone)]
pub struct Loopback {
    server: TestServer,
    offline: Arc<AtomicBool>,
    lose_responses: Arc<AtomicBool>,
    latency: Option<Duration>,
}

impl Loopback {
    /// Fail every request before it reaches the service.
    pub fn set_offline(&self, offline: bool) {
        self.offline.store(offline, Ordering::SeqCst);
    }

    /// Let the service commit, then drop the response.
    pub fn set_lose_responses(&self, lose: bool) {
        self.lose_responses.store(lose, Ordering::SeqCst);
    }

    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = Some(latency);
        self
    }
}

impl SyncTransport for Loopback {
    async fn exchange(&self, request: &SyncRequest) -> Result<SyncResponse> {
        if let Some(latency) = self.latency {
            tokio::time::sleep(latency).await;
        }
        if self.offline.load(Ordering::SeqCst) {
            return Err(ClientError::Transport("connection refused".into()));
        }

        let body = serde_json::to_string(request).unwrap();
        let request: SyncRequest = serde_json::from_str(&body).unwrap();

        let response = {
            let mut dataset = self.server.dataset.lock().await;
            SyncService::new(&self.server.schema)
                .with_duplicate_rule(&CUSTOMER_IDENTITY)
                .serve(&mut dataset, &request, timestamp::now())
                .response
        };

        if self.lose_responses.load(Ordering::SeqCst) {
            return Err(ClientError::Transport("operation timed out".into()));
        }

        let body = serde_json::to_string(&response).unwrap();
        Ok(serde_json::from_str(&body).unwrap())
    }
}

pub fn customer(uuid: &str, name: &str) -> SyncRecord {
    SyncRecord::new(uuid, timestamp::now())
        .with_field("name", json!(name))
        .with_field("address", json!("Via Roma 1"))
}

pub fn destination(uuid: &str, customer: &str) -> SyncRecord {
    SyncRecord::new(uuid, timestamp::now())
        .with_parent(customer)
        .with_field("name", json!("Main lab"))
}

pub fn device(uuid: &str, destination: &str) -> SyncRecord {
    SyncRecord::new(uuid, timestamp::now())
        .with_parent(destination)
        .with_field("serial_number", json!("SN-1"))
        .with_field("description", json!("Infusion pump"))
}

pub fn verification(uuid: &str, device: &str) -> SyncRecord {
    SyncRecord::new(uuid, timestamp::now())
        .with_parent(device)
        .with_field("verification_date", json!("2024-01-31"))
        .with_field("overall_status", json!("PASS"))
        .with_field("results_json", json!([{"test": "Earth", "value": 0.1}]))
}
