//! Assessment session lifecycle.
//!
//! An [`AssessmentSession`] ties one assessment attempt to the upload
//! machinery: starting the session arms the scheduler, recordings made while
//! it is active are buffered, and ending it forces a final upload pass before
//! the scheduler is stopped. Each session owns a [`SessionLog`] that is passed
//! explicitly to collaborators instead of living in process-wide state.

use chrono::{DateTime, Utc};
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{debug, info};

use crate::buffer::RecordingBuffer;
use crate::recording::RecordingId;
use crate::scheduler::{PassOutcome, UploadScheduler};
use crate::{Result, UploaderError};

/// One entry in a session log
#[derive(Debug, Clone, PartialEq)]
pub struct LogEntry {
    pub timestamp: DateTime<Utc>,
    /// Category, e.g. "word" or "upload.failed"
    pub tag: String,
    pub message: String,
    /// Open entries describe something still in progress
    pub open: bool,
}

/// Timestamped, tagged event log scoped to one session
#[derive(Debug, Default)]
pub struct SessionLog {
    entries: RwLock<Vec<LogEntry>>,
}

impl SessionLog {
    pub fn new() -> Self {
        Self::default()
    }

    async fn push(&self, tag: &str, message: String, open: bool) {
        debug!("[session:{}] {}", tag, message);
        self.entries.write().await.push(LogEntry {
            timestamp: Utc::now(),
            tag: tag.to_string(),
            message,
            open,
        });
    }

    /// Append a completed event
    pub async fn note(&self, tag: &str, message: impl Into<String>) {
        self.push(tag, message.into(), false).await;
    }

    /// Append an in-progress event that a later [`close`](Self::close) ends
    pub async fn open(&self, tag: &str, message: impl Into<String>) {
        self.push(tag, message.into(), true).await;
    }

    /// Close the most recent open entry with `tag`; false when none is open
    pub async fn close(&self, tag: &str) -> bool {
        let mut entries = self.entries.write().await;
        match entries.iter_mut().rev().find(|e| e.open && e.tag == tag) {
            Some(entry) => {
                entry.open = false;
                true
            }
            None => false,
        }
    }

    /// Most recent open entry with `tag`.
    ///
    /// Linear scan from newest to oldest; sessions hold at most a few hundred entries.
    pub async fn find_active(&self, tag: &str) -> Option<LogEntry> {
        self.entries
            .read()
            .await
            .iter()
            .rev()
            .find(|e| e.open && e.tag == tag)
            .cloned()
    }

    pub async fn entries(&self) -> Vec<LogEntry> {
        self.entries.read().await.clone()
    }

    pub async fn entries_with_tag(&self, tag: &str) -> Vec<LogEntry> {
        self.entries
            .read()
            .await
            .iter()
            .filter(|e| e.tag == tag)
            .cloned()
            .collect()
    }

    pub async fn len(&self) -> usize {
        self.entries.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.entries.read().await.is_empty()
    }
}

/// Lifecycle of an assessment session
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Created,
    Active,
    Ended,
}

/// One user's attempt at one assessment
pub struct AssessmentSession {
    assessment_id: String,
    user_id: String,
    scheduler: UploadScheduler,
    log: Arc<SessionLog>,
    state: RwLock<SessionState>,
}

impl AssessmentSession {
    pub fn new(
        assessment_id: impl Into<String>,
        user_id: impl Into<String>,
        scheduler: UploadScheduler,
        log: Arc<SessionLog>,
    ) -> Self {
        Self {
            assessment_id: assessment_id.into(),
            user_id: user_id.into(),
            scheduler,
            log,
            state: RwLock::new(SessionState::Created),
        }
    }

    pub fn assessment_id(&self) -> &str {
        &self.assessment_id
    }

    pub fn user_id(&self) -> &str {
        &self.user_id
    }

    pub fn log(&self) -> &Arc<SessionLog> {
        &self.log
    }

    pub fn scheduler(&self) -> &UploadScheduler {
        &self.scheduler
    }

    pub fn buffer(&self) -> &Arc<RecordingBuffer> {
        self.scheduler.executor().buffer()
    }

    pub async fn state(&self) -> SessionState {
        *self.state.read().await
    }

    /// Activate the session and arm the upload scheduler
    pub async fn start(&self) -> Result<()> {
        {
            let mut state = self.state.write().await;
            if *state != SessionState::Created {
                return Err(UploaderError::Session {
                    message: format!("cannot start a session in state {:?}", *state),
                });
            }
            *state = SessionState::Active;
        }

        info!(
            "Session started for assessment {} (user {})",
            self.assessment_id, self.user_id
        );
        self.log
            .note("session.started", self.assessment_id.clone())
            .await;
        self.scheduler.start().await;
        Ok(())
    }

    /// Buffer a finished recording for this session
    pub async fn record(&self, audio: Vec<u8>, content_type: &str) -> Result<RecordingId> {
        let state = self.state().await;
        if state != SessionState::Active {
            return Err(UploaderError::Session {
                message: format!("cannot record in state {:?}", state),
            });
        }

        let id = self
            .buffer()
            .save(audio, content_type, &self.assessment_id, &self.user_id)
            .await;
        self.log.note("recording.saved", id.to_string()).await;
        Ok(id)
    }

    /// End the session: disarm the timer, wait out any running pass, then force a final one
    pub async fn end(&self) -> Result<PassOutcome> {
        {
            let mut state = self.state.write().await;
            if *state != SessionState::Active {
                return Err(UploaderError::Session {
                    message: format!("cannot end a session in state {:?}", *state),
                });
            }
            *state = SessionState::Ended;
        }

        self.scheduler.stop().await;
        self.scheduler.wait_idle().await;
        let outcome = self.scheduler.force_upload_now().await;
        self.buffer().flush_mirror().await;

        let stats = self.buffer().stats().await;
        info!(
            "Session ended for assessment {}: {}",
            self.assessment_id, stats
        );
        self.log
            .note("session.ended", format!("{}", stats))
            .await;

        Ok(outcome)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::executor::UploadExecutor;
    use crate::recording::{StoredRecording, DEFAULT_CONTENT_TYPE};
    use crate::scheduler::SchedulerConfig;
    use crate::uploader::{UploadError, Uploader};
    use async_trait::async_trait;
    use std::time::Duration;

    struct AcceptAll;

    #[async_trait]
    impl Uploader for AcceptAll {
        async fn upload(&self, _recording: &StoredRecording) -> std::result::Result<(), UploadError> {
            Ok(())
        }
    }

    fn session() -> AssessmentSession {
        let log = Arc::new(SessionLog::new());
        let buffer = Arc::new(RecordingBuffer::new(3));
        let executor = Arc::new(
            UploadExecutor::new(buffer, Arc::new(AcceptAll), Duration::from_secs(10))
                .with_session_log(log.clone()),
        );
        let scheduler = UploadScheduler::new(executor, SchedulerConfig::default());
        AssessmentSession::new("speaking-1", "user-9", scheduler, log)
    }

    #[tokio::test]
    async fn test_find_active_returns_latest_open_entry() {
        let log = SessionLog::new();
        log.open("word", "apple").await;
        log.note("word", "banana").await;
        log.open("word", "cherry").await;
        log.open("prompt", "describe a fruit").await;

        assert_eq!(log.find_active("word").await.unwrap().message, "cherry");

        assert!(log.close("word").await);
        assert_eq!(log.find_active("word").await.unwrap().message, "apple");

        assert!(log.close("word").await);
        assert!(log.find_active("word").await.is_none());
        assert!(!log.close("word").await);
        assert_eq!(log.len().await, 4);
    }

    #[tokio::test]
    async fn test_record_requires_active_session() {
        let session = session();

        let err = session.record(vec![1], DEFAULT_CONTENT_TYPE).await;
        assert!(matches!(err, Err(UploaderError::Session { .. })));
        assert_eq!(session.state().await, SessionState::Created);
    }

    #[tokio::test(start_paused = true)]
    async fn test_session_lifecycle_uploads_on_end() {
        let session = session();
        session.start().await.unwrap();
        assert!(session.start().await.is_err());
        // Let the immediate start-up pass finish on the empty buffer
        session.scheduler().wait_idle().await;

        let first = session.record(vec![1, 2], DEFAULT_CONTENT_TYPE).await.unwrap();
        let second = session.record(vec![3, 4], "audio/ogg").await.unwrap();
        assert_eq!(session.buffer().len().await, 2);

        let outcome = session.end().await.unwrap();
        assert_eq!(outcome.report().unwrap().succeeded, 2);
        assert_eq!(session.state().await, SessionState::Ended);
        assert!(!session.scheduler().is_started().await);
        assert!(session.buffer().is_empty().await);

        let uploaded = session.log().entries_with_tag("upload.succeeded").await;
        let ids: Vec<_> = uploaded.iter().map(|e| e.message.clone()).collect();
        assert!(ids.contains(&first.to_string()));
        assert!(ids.contains(&second.to_string()));

        assert!(session.end().await.is_err());
        assert!(session.record(vec![5], DEFAULT_CONTENT_TYPE).await.is_err());
    }
}
