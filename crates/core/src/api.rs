//! Batch upload API client (initiate / status)

use crate::error::{Error, Result};
use async_trait::async_trait;
use reqwest::{Client, RequestBuilder, Response, StatusCode};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Path of the initiate call below the API base URL
pub const INITIATE_PATH: &str = "/upload/batch-initiate";

/// Path of the status call below the API base URL
pub const STATUS_PATH: &str = "/upload/batch-status";

/// One file of an initiate manifest
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ManifestEntry {
    pub filename: String,
    pub content_type: String,
    pub file_size: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub hash: Option<String>,
}

/// Body of the initiate call
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InitiateRequest {
    pub files: Vec<ManifestEntry>,
    #[serde(rename = "userId", skip_serializing_if = "Option::is_none")]
    pub user_id: Option<String>,
}

/// Where and how one file is transferred
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UploadTarget {
    pub filename: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub upload_url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content_type: Option<String>,
    #[serde(rename = "s3_key", alias = "key", default, skip_serializing_if = "Option::is_none")]
    pub storage_key: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Answer to the initiate call
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct InitiateResponse {
    #[serde(rename = "masterBatchId", alias = "master_batch_id", alias = "batch_id", default)]
    pub master_batch_id: Option<String>,
    #[serde(rename = "totalFiles", alias = "fileCount", alias = "total_files", default)]
    pub total_files: Option<u64>,
    #[serde(rename = "totalBatches", alias = "total_chunks", default)]
    pub total_batches: Option<u64>,
    #[serde(default)]
    pub upload_urls: Option<Vec<UploadTarget>>,
}

impl InitiateResponse {
    /// The master batch id, if present and not blank
    pub fn master_batch_id(&self) -> Option<&str> {
        self.master_batch_id
            .as_deref()
            .map(str::trim)
            .filter(|id| !id.is_empty())
    }

    /// Targets handed out immediately (simple strategy deployments)
    pub fn immediate_targets(&self) -> Option<&[UploadTarget]> {
        self.upload_urls.as_deref().filter(|urls| !urls.is_empty())
    }
}

/// Server-side processing state of a master batch
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RemoteStatus {
    Processing,
    Completed,
    Failed,
}

/// Answer to the status call
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct StatusResponse {
    #[serde(default)]
    pub status: String,
    #[serde(default)]
    pub progress: Option<f64>,
    #[serde(default)]
    pub processed_files: Option<u64>,
    #[serde(default)]
    pub total_files: Option<u64>,
    #[serde(default)]
    pub upload_urls: Option<Vec<UploadTarget>>,
    #[serde(default)]
    pub message: Option<String>,
    #[serde(default)]
    pub error: Option<String>,
}

impl StatusResponse {
    /// Unknown status strings count as still processing
    pub fn remote_status(&self) -> RemoteStatus {
        match self.status.trim().to_ascii_lowercase().as_str() {
            "completed" | "complete" => RemoteStatus::Completed,
            "failed" | "error" => RemoteStatus::Failed,
            _ => RemoteStatus::Processing,
        }
    }

    pub fn targets(&self) -> Option<&[UploadTarget]> {
        self.upload_urls.as_deref().filter(|urls| !urls.is_empty())
    }

    pub fn failure_reason(&self) -> String {
        self.error
            .clone()
            .or_else(|| self.message.clone())
            .unwrap_or_else(|| "batch processing failed".to_string())
    }
}

/// The remote half of the upload handshake
#[async_trait]
pub trait BatchApi: Send + Sync {
    async fn initiate(&self, request: &InitiateRequest) -> Result<InitiateResponse>;

    async fn status(&self, master_batch_id: &str) -> Result<StatusResponse>;
}

/// Source of bearer credentials
#[async_trait]
pub trait TokenProvider: Send + Sync {
    /// Current credential
    async fn token(&self) -> Result<String>;

    /// Obtain a fresh credential after the server rejected the current one
    async fn refresh(&self) -> Result<String>;
}

/// A fixed token that cannot be renewed
#[derive(Debug, Clone)]
pub struct StaticToken(String);

impl StaticToken {
    pub fn new(token: impl Into<String>) -> Self {
        Self(token.into())
    }
}

#[async_trait]
impl TokenProvider for StaticToken {
    async fn token(&self) -> Result<String> {
        Ok(self.0.clone())
    }

    async fn refresh(&self) -> Result<String> {
        Err(Error::Authentication(
            "Token rejected and no refresh source configured".to_string(),
        ))
    }
}

#[derive(Debug, Clone, Copy)]
enum Call {
    Initiate,
    Status,
}

/// HTTP implementation of [`BatchApi`]
pub struct HttpBatchApi {
    http_client: Client,
    base_url: String,
    tokens: Option<Arc<dyn TokenProvider>>,
}

impl HttpBatchApi {
    /// Create a new client
    pub fn new(base_url: impl Into<String>, timeout: Duration) -> Result<Self> {
        let http_client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| Error::HttpClient(e.to_string()))?;

        Ok(Self {
            http_client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            tokens: None,
        })
    }

    /// Attach a bearer credential source
    pub fn with_tokens(mut self, tokens: Arc<dyn TokenProvider>) -> Self {
        self.tokens = Some(tokens);
        self
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// Send a request with the bearer credential, renewing it once on 401
    async fn send_authorized<F>(&self, build: F) -> Result<Response>
    where
        F: Fn() -> RequestBuilder,
    {
        let tokens = match &self.tokens {
            Some(tokens) => tokens,
            None => return Ok(build().send().await?),
        };

        let token = tokens.token().await?;
        let response = build().bearer_auth(&token).send().await?;
        if response.status() != StatusCode::UNAUTHORIZED {
            return Ok(response);
        }

        info!("credential rejected, requesting renewal");
        let renewed = tokens.refresh().await?;
        let response = build().bearer_auth(&renewed).send().await?;
        if response.status() == StatusCode::UNAUTHORIZED {
            return Err(Error::Authentication(
                "Credential rejected after renewal".to_string(),
            ));
        }
        Ok(response)
    }

    async fn handle_response<T: for<'de> Deserialize<'de>>(&self, response: Response, call: Call) -> Result<T> {
        let status = response.status();

        if status.is_success() {
            let body = response.text().await?;
            return serde_json::from_str(&body).map_err(|e| match call {
                Call::Initiate => Error::Validation(format!("Unreadable {:?} response: {}", call, e)),
                Call::Status => Error::TransientNetwork(format!("Unreadable {:?} response: {}", call, e)),
            });
        }

        let error_text = response.text().await.unwrap_or_default();
        if status == StatusCode::UNAUTHORIZED {
            return Err(Error::Authentication(format!("HTTP {}: {}", status.as_u16(), error_text)));
        }

        match call {
            Call::Initiate if status == StatusCode::FORBIDDEN => Err(Error::Authentication(format!(
                "HTTP {}: {}",
                status.as_u16(),
                error_text
            ))),
            // A rejected manifest will not be accepted on a second try
            Call::Initiate
                if status.is_client_error()
                    && status != StatusCode::REQUEST_TIMEOUT
                    && status != StatusCode::TOO_MANY_REQUESTS =>
            {
                Err(Error::Validation(format!(
                    "Initiate rejected with HTTP {}: {}",
                    status.as_u16(),
                    error_text
                )))
            }
            // Polls retry on any other non-2xx; only the budget ends them
            _ => Err(Error::TransientNetwork(format!(
                "HTTP {}: {}",
                status.as_u16(),
                error_text
            ))),
        }
    }
}

#[async_trait]
impl BatchApi for HttpBatchApi {
    async fn initiate(&self, request: &InitiateRequest) -> Result<InitiateResponse> {
        let url = format!("{}{}", self.base_url, INITIATE_PATH);
        debug!(files = request.files.len(), %url, "initiating batch");

        let response = self
            .send_authorized(|| {
                self.http_client
                    .post(&url)
                    .header("Content-Type", "application/json")
                    .json(request)
            })
            .await?;

        self.handle_response(response, Call::Initiate).await
    }

    async fn status(&self, master_batch_id: &str) -> Result<StatusResponse> {
        let url = format!("{}{}", self.base_url, STATUS_PATH);

        let response = self
            .send_authorized(|| {
                self.http_client
                    .get(&url)
                    .query(&[("masterBatchId", master_batch_id)])
            })
            .await?;

        let status: StatusResponse = self.handle_response(response, Call::Status).await?;
        if status.status.is_empty() {
            warn!(%master_batch_id, "status response without a status field");
        }
        Ok(status)
    }
}
