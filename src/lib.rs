//! Assessment Uploader - resilient background upload of assessment recordings
//!
//! Recordings captured during a timed speaking assessment are buffered
//! locally and pushed to remote object storage in the background, so a flaky
//! network never interrupts the person taking the assessment. It features:
//!
//! - An in-memory recording buffer with a best-effort sled mirror for crash recovery
//! - A timer-driven, single-flight reconciliation scheduler
//! - Bounded retries per recording with a per-attempt timeout
//! - Presigned-URL uploads over HTTP, or uploads into a local directory
//! - An explicit assessment session object with its own event log
//!
//! # Example
//!
//! ```rust,no_run
//! use assessment_uploader::{build_session, config::UploaderConfig};
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = UploaderConfig {
//!         presign_endpoint: Some("https://api.example.com/uploads/presign".to_string()),
//!         ..Default::default()
//!     };
//!
//!     let session = build_session(&config, "speaking-quiz-3", "user-42").await?;
//!     session.start().await?;
//!
//!     // Each finished recording is buffered and uploaded in the background
//!     session.record(vec![0u8; 1024], "audio/webm").await?;
//!
//!     // Ending the session forces a final upload pass
//!     session.end().await?;
//!     Ok(())
//! }
//! ```

pub mod buffer;
pub mod config;
pub mod executor;
pub mod mirror;
pub mod recording;
pub mod scheduler;
pub mod session;
pub mod uploader;

// Re-export commonly used types for convenience
pub use buffer::{BufferStats, RecordingBuffer};
pub use executor::{UploadExecutor, UploadStats};
pub use mirror::{MemoryMirror, RecordingMirror, SledMirror};
pub use recording::{RecordingId, StoredRecording};
pub use scheduler::{PassOutcome, PassReport, SchedulerState, UploadScheduler};
pub use session::{AssessmentSession, SessionLog, SessionState};
pub use uploader::{DirectoryUploader, PresignedUploader, UploadError, Uploader};

use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

/// Errors that can occur in the uploader
#[derive(Error, Debug)]
pub enum UploaderError {
    /// Durable mirror could not be opened
    #[error("Mirror error: {0}")]
    Mirror(#[from] mirror::MirrorError),

    /// Upload target could not be constructed
    #[error("Upload error: {0}")]
    Upload(#[from] UploadError),

    /// Invalid configuration
    #[error("Config error: {message}")]
    Config { message: String },

    /// Session lifecycle violation
    #[error("Session error: {message}")]
    Session { message: String },

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type alias for uploader operations
pub type Result<T> = std::result::Result<T, UploaderError>;

/// Version information
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
pub const NAME: &str = env!("CARGO_PKG_NAME");

/// Upload attempts allowed per recording
pub const DEFAULT_MAX_ATTEMPTS: u32 = 3;
/// Time between scheduled upload passes
pub const DEFAULT_UPLOAD_INTERVAL: Duration = Duration::from_secs(30);
/// Longest accepted time between scheduled passes
pub const MAX_UPLOAD_INTERVAL: Duration = Duration::from_secs(24 * 60 * 60);
/// Pause between uploads within one pass
pub const DEFAULT_ITEM_DELAY: Duration = Duration::from_secs(1);
/// Upper bound on a single upload attempt
pub const DEFAULT_ATTEMPT_TIMEOUT: Duration = Duration::from_secs(60);

/// Default mirror location
pub const DEFAULT_MIRROR_PATH: &str = "/tmp/assessment-uploader/mirror";

/// Build the upload target described by `config`
pub fn build_uploader(config: &config::UploaderConfig) -> Result<Arc<dyn Uploader>> {
    match (&config.presign_endpoint, &config.output_dir) {
        (Some(endpoint), _) => Ok(Arc::new(PresignedUploader::new(endpoint.clone())?)),
        (None, Some(dir)) => Ok(Arc::new(DirectoryUploader::new(dir.clone()))),
        (None, None) => Err(UploaderError::Config {
            message: "no upload target configured".to_string(),
        }),
    }
}

/// Wire buffer, mirror, executor and scheduler into a ready-to-start session.
///
/// Recordings left in the mirror by an earlier process are restored into the
/// buffer so the new session uploads them too.
pub async fn build_session(
    config: &config::UploaderConfig,
    assessment_id: &str,
    user_id: &str,
) -> Result<AssessmentSession> {
    config.validate()?;

    let buffer = match &config.mirror_path {
        Some(path) => {
            if let Some(parent) = path.parent() {
                tokio::fs::create_dir_all(parent).await?;
            }
            let mirror = Arc::new(SledMirror::new(path)?);
            RecordingBuffer::with_mirror(config.max_attempts, mirror)
        }
        None => RecordingBuffer::new(config.max_attempts),
    };
    let buffer = Arc::new(buffer);
    buffer.restore_from_mirror().await;

    let log = Arc::new(SessionLog::new());
    let executor = Arc::new(
        UploadExecutor::new(buffer, build_uploader(config)?, config.attempt_timeout())
            .with_session_log(Arc::clone(&log)),
    );
    let scheduler = UploadScheduler::new(executor, config.scheduler_config());

    Ok(AssessmentSession::new(assessment_id, user_id, scheduler, log))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::UploaderConfig;

    #[test]
    fn test_version_constants() {
        assert!(!VERSION.is_empty());
        assert_eq!(NAME, "assessment-uploader");
    }

    #[test]
    fn test_build_uploader_requires_target() {
        let config = UploaderConfig::default();
        assert!(matches!(
            build_uploader(&config),
            Err(UploaderError::Config { .. })
        ));
    }

    #[tokio::test]
    async fn test_build_session_restores_mirrored_recordings() {
        let temp_dir = tempfile::tempdir().unwrap();
        let config = UploaderConfig {
            mirror_path: Some(temp_dir.path().join("mirror")),
            output_dir: Some(temp_dir.path().join("out")),
            ..Default::default()
        };

        {
            let session = build_session(&config, "quiz", "user").await.unwrap();
            session.buffer().save(vec![1, 2, 3], "audio/webm", "quiz", "user").await;
            session.buffer().flush_mirror().await;
        }

        let session = build_session(&config, "quiz", "user").await.unwrap();
        assert_eq!(session.buffer().pending().await.len(), 1);
        assert_eq!(session.state().await, SessionState::Created);
    }
}
