//! The request/response channel to the reconciliation service.

use std::future::Future;

use reqwest::StatusCode;
use tracing::debug;
use verisync_engine::{SyncRequest, SyncResponse};

use crate::config::ClientConfig;
use crate::error::{ClientError, Result};

/// One round trip to the service.
///
/// A `SyncResponse::Error` body is returned as a response, not an error;
/// `Err` is reserved for failures that produced no usable body.
pub trait SyncTransport: Send + Sync {
    fn exchange(
        &self,
        request: &SyncRequest,
    ) -> impl Future<Output = Result<SyncResponse>> + Send;
}

/// JSON over HTTP with an optional bearer credential.
#[derive(Debug, Clone)]
pub struct HttpTransport {
    client: reqwest::Client,
    endpoint: String,
    token: Option<String>,
}

impl HttpTransport {
    pub fn new(config: &ClientConfig) -> Result<Self> {
        let client = reqwest::Client::builder().timeout(config.timeout).build()?;
        Ok(Self {
            client,
            endpoint: format!("{}/sync", config.server_url.trim_end_matches('/')),
            token: config.auth_token.clone(),
        })
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    /// Replace the bearer credential after a new login.
    pub fn set_token(&mut self, token: Option<String>) {
        self.token = token;
    }
}

impl SyncTransport for HttpTransport {
    async fn exchange(&self, request: &SyncRequest) -> Result<SyncResponse> {
        let mut builder = self.client.post(&self.endpoint).json(request);
        if let Some(token) = &self.token {
            builder = builder.bearer_auth(token);
        }

        let response = builder.send().await?;
        let status = response.status();
        let body = response.text().await?;
        debug!(status = %status, bytes = body.len(), "Sync response received");

        let parsed = serde_json::from_str::<SyncResponse>(&body);
        match status {
            StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => {
                let message = match parsed {
                    Ok(SyncResponse::Error { message }) => message,
                    _ => status.to_string(),
                };
                Err(ClientError::Auth(message))
            }
            status if status.is_success() => {
                parsed.map_err(|err| ClientError::InvalidResponse(err.to_string()))
            }
            status => match parsed {
                Ok(error @ SyncResponse::Error { .. }) => Ok(error),
                _ => Err(ClientError::Transport(format!("HTTP {status}"))),
            },
        }
    }
}
