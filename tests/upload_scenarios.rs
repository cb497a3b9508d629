// End-to-end upload scenarios: buffer, executor and scheduler wired together
// with a scripted storage backend.

use assessment_uploader::config::UploaderConfig;
use assessment_uploader::recording::DEFAULT_CONTENT_TYPE;
use assessment_uploader::scheduler::SchedulerConfig;
use assessment_uploader::{
    build_session, PassOutcome, RecordingBuffer, RecordingId, SledMirror, StoredRecording,
    UploadError, UploadExecutor, UploadScheduler, Uploader,
};
use async_trait::async_trait;
use std::collections::HashSet;
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// Storage backend that rejects a chosen set of recordings
#[derive(Default)]
struct ScriptedUploader {
    rejected: Mutex<HashSet<RecordingId>>,
    calls: Mutex<Vec<RecordingId>>,
}

impl ScriptedUploader {
    fn reject(&self, id: RecordingId) {
        self.rejected.lock().unwrap().insert(id);
    }

    fn calls_for(&self, id: &RecordingId) -> usize {
        self.calls.lock().unwrap().iter().filter(|c| *c == id).count()
    }

    fn total_calls(&self) -> usize {
        self.calls.lock().unwrap().len()
    }
}

#[async_trait]
impl Uploader for ScriptedUploader {
    async fn upload(&self, recording: &StoredRecording) -> Result<(), UploadError> {
        self.calls.lock().unwrap().push(recording.id);
        if self.rejected.lock().unwrap().contains(&recording.id) {
            return Err(UploadError::Status {
                status: 500,
                message: "storage rejected object".to_string(),
            });
        }
        Ok(())
    }
}

fn pipeline() -> (UploadScheduler, Arc<RecordingBuffer>, Arc<ScriptedUploader>) {
    let uploader = Arc::new(ScriptedUploader::default());
    let buffer = Arc::new(RecordingBuffer::new(3));
    let executor = Arc::new(UploadExecutor::new(
        Arc::clone(&buffer),
        uploader.clone(),
        Duration::from_secs(5),
    ));
    let config = SchedulerConfig {
        interval: Duration::from_secs(30),
        item_delay: Duration::ZERO,
    };
    (UploadScheduler::new(executor, config), buffer, uploader)
}

async fn save(buffer: &RecordingBuffer, audio: &[u8]) -> RecordingId {
    buffer
        .save(audio.to_vec(), DEFAULT_CONTENT_TYPE, "speaking-quiz", "user-7")
        .await
}

#[tokio::test]
async fn test_failed_item_stays_pending_while_successful_item_is_evicted() {
    let (scheduler, buffer, uploader) = pipeline();
    let a = save(&buffer, b"first answer").await;
    let b = save(&buffer, b"second answer").await;
    uploader.reject(a);

    let report = scheduler.force_upload_now().await.report().cloned().unwrap();
    assert_eq!(report.attempted, 2);
    assert_eq!(report.succeeded, 1);
    assert_eq!(report.failed, 1);
    assert_eq!(report.evicted, 1);

    let a_stored = buffer.get(&a).await.unwrap();
    assert_eq!(a_stored.upload_attempts, 1);
    assert!(!a_stored.uploaded);
    assert_eq!(buffer.pending().await.len(), 1);

    assert!(buffer.get(&b).await.is_none());
    assert_eq!(uploader.calls_for(&b), 1);
}

#[tokio::test]
async fn test_retry_budget_is_never_exceeded() {
    let (scheduler, buffer, uploader) = pipeline();
    let id = save(&buffer, b"unlucky").await;
    uploader.reject(id);

    for pass in 1..=3 {
        let report = scheduler.force_upload_now().await.report().cloned().unwrap();
        assert_eq!(report.failed, 1);
        assert_eq!(buffer.get(&id).await.unwrap().upload_attempts, pass);
    }

    let fourth = scheduler.force_upload_now().await;
    assert_eq!(fourth.report().unwrap().attempted, 0);
    assert_eq!(uploader.calls_for(&id), 3);

    let all = buffer.all().await;
    assert_eq!(all.len(), 1);
    assert_eq!(all[0].upload_attempts, 3);
    assert!(buffer.pending().await.is_empty());
}

#[tokio::test]
async fn test_force_with_empty_buffer_never_contacts_storage() {
    let (scheduler, buffer, uploader) = pipeline();

    let outcome = scheduler.force_upload_now().await;

    assert!(matches!(outcome, PassOutcome::Completed(_)));
    assert_eq!(outcome.report().unwrap().attempted, 0);
    assert_eq!(uploader.total_calls(), 0);
    assert!(buffer.is_empty().await);
}

#[tokio::test]
async fn test_repeated_mark_uploaded_matches_single_call() {
    let (_scheduler, buffer, _uploader) = pipeline();
    let once = save(&buffer, b"one").await;
    let twice = save(&buffer, b"two").await;

    buffer.mark_uploaded(&once).await;
    buffer.mark_uploaded(&twice).await;
    buffer.mark_uploaded(&twice).await;

    let once_stored = buffer.get(&once).await.unwrap();
    let twice_stored = buffer.get(&twice).await.unwrap();
    assert_eq!(once_stored.uploaded, twice_stored.uploaded);
    assert_eq!(once_stored.upload_attempts, twice_stored.upload_attempts);
    assert!(buffer.pending().await.is_empty());
    assert_eq!(buffer.cleanup().await, 2);
}

#[tokio::test]
async fn test_session_uploads_into_directory_and_empties_mirror() {
    let temp_dir = tempfile::tempdir().unwrap();
    let out_dir = temp_dir.path().join("uploads");
    let config = UploaderConfig {
        mirror_path: Some(temp_dir.path().join("mirror")),
        output_dir: Some(out_dir.clone()),
        item_delay_ms: 10,
        ..Default::default()
    };

    let session = build_session(&config, "speaking-quiz", "user-7").await.unwrap();
    session.start().await.unwrap();
    session.scheduler().wait_idle().await;

    let id = session.record(b"RIFF....WAVE".to_vec(), "audio/wav").await.unwrap();
    let object_key = session.buffer().get(&id).await.unwrap().object_key();

    let outcome = session.end().await.unwrap();
    assert_eq!(outcome.report().unwrap().succeeded, 1);
    assert!(session.buffer().is_empty().await);

    let written = tokio::fs::read(out_dir.join(&object_key)).await.unwrap();
    assert_eq!(written, b"RIFF....WAVE");
    drop(session);

    // Nothing is left to restore after a clean shutdown
    let session = build_session(&config, "speaking-quiz", "user-7").await.unwrap();
    assert!(session.buffer().is_empty().await);
}

#[tokio::test]
async fn test_abandoned_recordings_survive_restart_until_purged() {
    let temp_dir = tempfile::tempdir().unwrap();
    let path = temp_dir.path().join("mirror");

    let abandoned = {
        let buffer = RecordingBuffer::with_mirror(1, Arc::new(SledMirror::new(&path).unwrap()));
        let id = save(&buffer, b"never accepted").await;
        buffer.increment_attempts(&id).await;
        buffer.flush_mirror().await;
        id
    };

    let mirror = Arc::new(SledMirror::new(&path).unwrap());
    let buffer = RecordingBuffer::with_mirror(1, mirror.clone());
    assert_eq!(buffer.restore_from_mirror().await, 1);
    assert_eq!(buffer.stats().await.abandoned, 1);
    assert!(buffer.pending().await.is_empty());

    assert_eq!(buffer.purge_abandoned().await, 1);
    assert!(buffer.get(&abandoned).await.is_none());
    assert!(mirror.is_empty());
}
