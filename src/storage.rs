use async_trait::async_trait;
use parking_lot::Mutex;
use reqwest::Client;
use uuid::Uuid;

use crate::error::{AppError, Result};
use crate::utils::{extension_for, AzureConfig};

const COLLABORATOR: &str = "blob store";

#[async_trait]
pub trait BlobStore: Send + Sync {
    /// Stores the bytes and returns a stable public URL.
    async fn upload(&self, bytes: &[u8], content_type: &str) -> Result<String>;
}

/// Azure Blob Storage via the REST `Put Blob` call, authorized by a SAS token.
pub struct AzureBlobStore {
    http: Client,
    container_url: String,
    sas_token: Option<String>,
}

impl AzureBlobStore {
    pub fn new(http: Client, config: &AzureConfig) -> Self {
        Self {
            http,
            container_url: format!(
                "{}/{}",
                config.account_url.trim_end_matches('/'),
                config.container.trim_matches('/')
            ),
            sas_token: config
                .sas_token
                .as_ref()
                .map(|token| token.trim_start_matches('?').to_string()),
        }
    }

    fn blob_url(&self, content_type: &str) -> String {
        format!(
            "{}/upload/{}_{}.{}",
            self.container_url,
            chrono::Utc::now().timestamp_millis(),
            Uuid::new_v4(),
            extension_for(content_type)
        )
    }
}

#[async_trait]
impl BlobStore for AzureBlobStore {
    async fn upload(&self, bytes: &[u8], content_type: &str) -> Result<String> {
        let url = self.blob_url(content_type);
        let request_url = match &self.sas_token {
            Some(token) => format!("{}?{}", url, token),
            None => url.clone(),
        };

        let response = self
            .http
            .put(&request_url)
            .header("x-ms-blob-type", "BlockBlob")
            .header("x-ms-blob-content-type", content_type)
            .header("content-type", content_type)
            .body(bytes.to_vec())
            .send()
            .await
            .map_err(|err| AppError::upstream(COLLABORATOR, err))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(AppError::upstream(
                COLLABORATOR,
                format!("upload returned {}: {}", status, body),
            ));
        }

        tracing::debug!(%url, size = bytes.len(), "blob uploaded");
        Ok(url)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct StoredBlob {
    pub url: String,
    pub content_type: String,
    pub size: usize,
}

/// Keeps uploads in memory and hands out sequential URLs.
pub struct MemoryBlobStore {
    base_url: String,
    blobs: Mutex<Vec<StoredBlob>>,
}

impl MemoryBlobStore {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
            blobs: Mutex::new(Vec::new()),
        }
    }

    pub fn blobs(&self) -> Vec<StoredBlob> {
        self.blobs.lock().clone()
    }
}

#[async_trait]
impl BlobStore for MemoryBlobStore {
    async fn upload(&self, bytes: &[u8], content_type: &str) -> Result<String> {
        let mut blobs = self.blobs.lock();
        let url = format!(
            "{}/upload/{}.{}",
            self.base_url.trim_end_matches('/'),
            blobs.len(),
            extension_for(content_type)
        );
        blobs.push(StoredBlob {
            url: url.clone(),
            content_type: content_type.to_string(),
            size: bytes.len(),
        });
        Ok(url)
    }
}
