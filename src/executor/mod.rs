use chrono::{DateTime, Utc};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use tokio::time::{timeout, Instant};
use tracing::{error, info, warn};

use crate::buffer::RecordingBuffer;
use crate::recording::StoredRecording;
use crate::session::SessionLog;
use crate::uploader::{UploadError, Uploader};

/// Counters describing upload attempts made by an executor
#[derive(Debug, Clone, Default)]
pub struct UploadStats {
    pub attempts: u64,
    pub successes: u64,
    pub failures: u64,
    pub timeouts: u64,
    pub bytes_uploaded: u64,
    pub last_success: Option<DateTime<Utc>>,
}

impl std::fmt::Display for UploadStats {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "Uploads: attempts={}, succeeded={}, failed={}, timed_out={}, bytes={}",
            self.attempts, self.successes, self.failures, self.timeouts, self.bytes_uploaded
        )
    }
}

/// Performs single upload attempts and reports the outcome to the buffer
pub struct UploadExecutor {
    buffer: Arc<RecordingBuffer>,
    uploader: Arc<dyn Uploader>,
    attempt_timeout: Duration,
    stats: RwLock<UploadStats>,
    session_log: Option<Arc<SessionLog>>,
}

impl UploadExecutor {
    pub fn new(
        buffer: Arc<RecordingBuffer>,
        uploader: Arc<dyn Uploader>,
        attempt_timeout: Duration,
    ) -> Self {
        Self {
            buffer,
            uploader,
            attempt_timeout,
            stats: RwLock::new(UploadStats::default()),
            session_log: None,
        }
    }

    /// Record attempt outcomes into a session log as well
    pub fn with_session_log(mut self, log: Arc<SessionLog>) -> Self {
        self.session_log = Some(log);
        self
    }

    pub fn buffer(&self) -> &Arc<RecordingBuffer> {
        &self.buffer
    }

    /// Make exactly one upload attempt for `recording`.
    ///
    /// The attempt is counted before the upload starts so a hung or crashed
    /// call still consumes retry budget. Returns whether storage accepted the
    /// bytes; failures are logged and never propagated.
    pub async fn attempt(&self, recording: &StoredRecording) -> bool {
        self.buffer.increment_attempts(&recording.id).await;
        self.stats.write().await.attempts += 1;

        let started = Instant::now();
        let result = match timeout(self.attempt_timeout, self.uploader.upload(recording)).await {
            Ok(result) => result,
            Err(_) => Err(UploadError::Timeout(self.attempt_timeout)),
        };

        match result {
            Ok(()) => {
                self.buffer.mark_uploaded(&recording.id).await;
                {
                    let mut stats = self.stats.write().await;
                    stats.successes += 1;
                    stats.bytes_uploaded += recording.size_bytes() as u64;
                    stats.last_success = Some(Utc::now());
                }

                info!(
                    "Uploaded recording {} ({} bytes) in {}ms",
                    recording.id,
                    recording.size_bytes(),
                    started.elapsed().as_millis()
                );
                if let Some(log) = &self.session_log {
                    log.note("upload.succeeded", recording.id.to_string()).await;
                }
                true
            }
            Err(e) => {
                {
                    let mut stats = self.stats.write().await;
                    stats.failures += 1;
                    if matches!(e, UploadError::Timeout(_)) {
                        stats.timeouts += 1;
                    }
                }

                let attempt = recording.upload_attempts + 1;
                let max_attempts = self.buffer.max_attempts();
                if attempt >= max_attempts {
                    error!(
                        "Upload of recording {} failed on final attempt {}/{}: {}",
                        recording.id, attempt, max_attempts, e
                    );
                } else {
                    warn!(
                        "Upload of recording {} failed (attempt {}/{}): {}",
                        recording.id, attempt, max_attempts, e
                    );
                }
                if let Some(log) = &self.session_log {
                    log.note("upload.failed", format!("{}: {}", recording.id, e))
                        .await;
                    if attempt >= max_attempts {
                        log.note("upload.abandoned", recording.id.to_string()).await;
                    }
                }
                false
            }
        }
    }

    /// Snapshot of attempt counters
    pub async fn stats(&self) -> UploadStats {
        self.stats.read().await.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::recording::DEFAULT_CONTENT_TYPE;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct StaticUploader {
        succeed: bool,
        calls: AtomicUsize,
    }

    #[async_trait]
    impl Uploader for StaticUploader {
        async fn upload(&self, _recording: &StoredRecording) -> Result<(), UploadError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.succeed {
                Ok(())
            } else {
                Err(UploadError::Status {
                    status: 503,
                    message: "unavailable".to_string(),
                })
            }
        }
    }

    struct HangingUploader;

    #[async_trait]
    impl Uploader for HangingUploader {
        async fn upload(&self, _recording: &StoredRecording) -> Result<(), UploadError> {
            std::future::pending::<()>().await;
            Ok(())
        }
    }

    async fn setup(uploader: Arc<dyn Uploader>) -> (UploadExecutor, StoredRecording) {
        let buffer = Arc::new(RecordingBuffer::new(3));
        let id = buffer
            .save(vec![0; 16], DEFAULT_CONTENT_TYPE, "assessment", "user")
            .await;
        let recording = buffer.get(&id).await.unwrap();
        let executor = UploadExecutor::new(buffer, uploader, Duration::from_secs(5));
        (executor, recording)
    }

    #[tokio::test]
    async fn test_successful_attempt_marks_uploaded() {
        let uploader = Arc::new(StaticUploader {
            succeed: true,
            calls: AtomicUsize::new(0),
        });
        let (executor, recording) = setup(uploader.clone()).await;

        assert!(executor.attempt(&recording).await);

        let stored = executor.buffer().get(&recording.id).await.unwrap();
        assert!(stored.uploaded);
        assert_eq!(stored.upload_attempts, 1);
        assert_eq!(uploader.calls.load(Ordering::SeqCst), 1);

        let stats = executor.stats().await;
        assert_eq!(stats.successes, 1);
        assert_eq!(stats.bytes_uploaded, 16);
        assert!(stats.last_success.is_some());
    }

    #[tokio::test]
    async fn test_failed_attempt_counts_against_budget() {
        let uploader = Arc::new(StaticUploader {
            succeed: false,
            calls: AtomicUsize::new(0),
        });
        let (executor, recording) = setup(uploader).await;

        assert!(!executor.attempt(&recording).await);

        let stored = executor.buffer().get(&recording.id).await.unwrap();
        assert!(!stored.uploaded);
        assert_eq!(stored.upload_attempts, 1);
        assert_eq!(executor.stats().await.failures, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_hung_upload_times_out() {
        let (executor, recording) = setup(Arc::new(HangingUploader)).await;

        assert!(!executor.attempt(&recording).await);

        let stored = executor.buffer().get(&recording.id).await.unwrap();
        assert_eq!(stored.upload_attempts, 1);
        assert!(!stored.uploaded);

        let stats = executor.stats().await;
        assert_eq!(stats.timeouts, 1);
        assert_eq!(stats.failures, 1);
    }

    #[tokio::test]
    async fn test_outcomes_are_noted_in_session_log() {
        let buffer = Arc::new(RecordingBuffer::new(3));
        let id = buffer.save(vec![1], DEFAULT_CONTENT_TYPE, "a", "u").await;
        let recording = buffer.get(&id).await.unwrap();
        let log = Arc::new(SessionLog::new());
        let uploader = Arc::new(StaticUploader {
            succeed: false,
            calls: AtomicUsize::new(0),
        });

        let executor = UploadExecutor::new(buffer, uploader, Duration::from_secs(5))
            .with_session_log(log.clone());
        executor.attempt(&recording).await;

        let entries = log.entries_with_tag("upload.failed").await;
        assert_eq!(entries.len(), 1);
        assert!(entries[0].message.starts_with(&id.to_string()));
    }
}
