//! Upload primitives: the storage collaborator the executor hands bytes to.

use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::path::{Component, Path, PathBuf};
use std::time::Duration;
use thiserror::Error;
use tracing::debug;

use crate::recording::StoredRecording;

/// Errors that can occur while pushing a recording to remote storage
#[derive(Error, Debug)]
pub enum UploadError {
    #[error("Network error: {0}")]
    Network(#[from] reqwest::Error),

    #[error("Storage rejected upload with HTTP {status}: {message}")]
    Status { status: u16, message: String },

    #[error("Timeout after {0:?}")]
    Timeout(Duration),

    #[error("Invalid presign response: {0}")]
    InvalidResponse(String),

    #[error("Object key escapes the upload root: {0}")]
    InvalidKey(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Pushes one recording's bytes to remote storage.
///
/// Implementations return `Ok(())` only once storage has accepted the bytes.
#[async_trait]
pub trait Uploader: Send + Sync {
    async fn upload(&self, recording: &StoredRecording) -> Result<(), UploadError>;
}

/// Request body sent to the presign endpoint
#[derive(Debug, Clone, Serialize)]
pub struct PresignRequest {
    pub recording_id: String,
    pub assessment_id: String,
    pub user_id: String,
    pub content_type: String,
    pub object_key: String,
}

impl From<&StoredRecording> for PresignRequest {
    fn from(recording: &StoredRecording) -> Self {
        Self {
            recording_id: recording.id.to_string(),
            assessment_id: recording.assessment_id.clone(),
            user_id: recording.user_id.clone(),
            content_type: recording.content_type.clone(),
            object_key: recording.object_key(),
        }
    }
}

/// Presign endpoint response
#[derive(Debug, Clone, Deserialize)]
pub struct PresignResponse {
    /// Time-limited URL authorizing a direct PUT of the object
    pub url: String,
}

/// Uploads through a presigned URL obtained per recording
#[derive(Clone)]
pub struct PresignedUploader {
    client: Client,
    presign_endpoint: String,
}

impl PresignedUploader {
    /// Create an uploader that asks `presign_endpoint` for upload URLs
    pub fn new(presign_endpoint: impl Into<String>) -> Result<Self, UploadError> {
        let client = Client::builder()
            .user_agent(format!("{}/{}", crate::NAME, crate::VERSION))
            .build()?;

        Ok(Self::with_client(client, presign_endpoint))
    }

    /// Create an uploader using a preconfigured client
    pub fn with_client(client: Client, presign_endpoint: impl Into<String>) -> Self {
        Self {
            client,
            presign_endpoint: presign_endpoint.into(),
        }
    }

    pub fn presign_endpoint(&self) -> &str {
        &self.presign_endpoint
    }

    async fn presign(&self, recording: &StoredRecording) -> Result<String, UploadError> {
        let response = self
            .client
            .post(&self.presign_endpoint)
            .json(&PresignRequest::from(recording))
            .send()
            .await?;
        let response = check_status(response).await?;

        let presigned: PresignResponse = response
            .json()
            .await
            .map_err(|e| UploadError::InvalidResponse(e.to_string()))?;

        if !presigned.url.starts_with("http://") && !presigned.url.starts_with("https://") {
            return Err(UploadError::InvalidResponse(format!(
                "URL must start with http:// or https://, got {}",
                presigned.url
            )));
        }

        Ok(presigned.url)
    }
}

#[async_trait]
impl Uploader for PresignedUploader {
    async fn upload(&self, recording: &StoredRecording) -> Result<(), UploadError> {
        let url = self.presign(recording).await?;
        debug!("Uploading recording {} to presigned URL", recording.id);

        let response = self
            .client
            .put(&url)
            .header(reqwest::header::CONTENT_TYPE, recording.content_type.as_str())
            .body(recording.audio.clone())
            .send()
            .await?;
        check_status(response).await?;

        Ok(())
    }
}

async fn check_status(response: reqwest::Response) -> Result<reqwest::Response, UploadError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }

    let message = match response.text().await {
        Ok(body) if body.len() > 500 => "response too large".to_string(),
        Ok(body) => body,
        Err(_) => String::new(),
    };

    Err(UploadError::Status {
        status: status.as_u16(),
        message,
    })
}

/// Writes recordings under a local directory using their object keys
#[derive(Debug, Clone)]
pub struct DirectoryUploader {
    root: PathBuf,
}

impl DirectoryUploader {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Destination path for a recording; always below the upload root
    pub fn path_for(&self, recording: &StoredRecording) -> Result<PathBuf, UploadError> {
        let key = recording.object_key();
        let relative = Path::new(&key);
        if !relative
            .components()
            .all(|c| matches!(c, Component::Normal(_)))
        {
            return Err(UploadError::InvalidKey(key));
        }
        Ok(self.root.join(relative))
    }
}

#[async_trait]
impl Uploader for DirectoryUploader {
    async fn upload(&self, recording: &StoredRecording) -> Result<(), UploadError> {
        let path = self.path_for(recording)?;
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }

        // Write then rename so a partial file never looks complete
        let tmp = path.with_extension("part");
        tokio::fs::write(&tmp, &recording.audio).await?;
        tokio::fs::rename(&tmp, &path).await?;

        debug!("Stored recording {} at {}", recording.id, path.display());
        Ok(())
    }
}
