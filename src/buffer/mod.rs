//! Local recording buffer.
//!
//! Holds recordings between the moment the recorder finishes and the moment
//! remote storage confirms the upload. The in-memory map is authoritative;
//! an optional [`RecordingMirror`] keeps a best-effort copy for crash
//! recovery and is never allowed to fail a buffer operation. Mirror I/O runs
//! on the blocking pool after the buffer lock is released.

use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

use crate::mirror::{recording_key, MirrorResult, RecordingMirror, RECORDING_KEY_PREFIX};
use crate::recording::{RecordingId, StoredRecording};
use crate::DEFAULT_MAX_ATTEMPTS;

#[derive(Default)]
struct BufferState {
    records: HashMap<RecordingId, StoredRecording>,
    /// Insertion order of `records`
    order: Vec<RecordingId>,
}

impl BufferState {
    fn insert(&mut self, recording: StoredRecording) {
        let id = recording.id;
        if self.records.insert(id, recording).is_none() {
            self.order.push(id);
        }
    }

    fn ordered(&self) -> impl Iterator<Item = &StoredRecording> {
        self.order.iter().filter_map(|id| self.records.get(id))
    }
}

/// Counts describing the buffer contents
#[derive(Debug, Clone, Default, PartialEq)]
pub struct BufferStats {
    pub total: usize,
    pub pending: usize,
    pub uploaded: usize,
    pub abandoned: usize,
    pub total_bytes: usize,
}

impl std::fmt::Display for BufferStats {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "Recordings: total={}, pending={}, uploaded={}, abandoned={}, bytes={}",
            self.total, self.pending, self.uploaded, self.abandoned, self.total_bytes
        )
    }
}

/// In-memory store of recordings awaiting confirmed upload
pub struct RecordingBuffer {
    state: RwLock<BufferState>,
    mirror: Option<Arc<dyn RecordingMirror>>,
    max_attempts: u32,
}

impl RecordingBuffer {
    /// Create a buffer without durable mirroring
    pub fn new(max_attempts: u32) -> Self {
        Self {
            state: RwLock::new(BufferState::default()),
            mirror: None,
            max_attempts,
        }
    }

    /// Create a buffer that mirrors every recording into `mirror`
    pub fn with_mirror(max_attempts: u32, mirror: Arc<dyn RecordingMirror>) -> Self {
        Self {
            state: RwLock::new(BufferState::default()),
            mirror: Some(mirror),
            max_attempts,
        }
    }

    /// Retry budget applied by [`pending`](Self::pending)
    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    /// Buffer a finished recording and return its new identifier
    pub async fn save(
        &self,
        audio: Vec<u8>,
        content_type: &str,
        assessment_id: &str,
        user_id: &str,
    ) -> RecordingId {
        let recording = StoredRecording::new(audio, content_type, assessment_id, user_id);
        let id = recording.id;
        let size = recording.size_bytes();

        // Mirrored before it becomes visible to upload passes
        if let Some(bytes) = self.encode_for_mirror(&recording) {
            self.mirror_set(id, bytes).await;
        }

        self.state.write().await.insert(recording);
        info!(
            "Buffered recording {} for assessment {} ({} bytes)",
            id, assessment_id, size
        );
        id
    }

    /// Mark a recording as confirmed uploaded and drop its mirrored copy.
    ///
    /// Unknown ids are ignored; repeated calls leave the same state.
    pub async fn mark_uploaded(&self, id: &RecordingId) {
        let known = match self.state.write().await.records.get_mut(id) {
            Some(recording) => {
                recording.uploaded = true;
                true
            }
            None => false,
        };

        if known {
            debug!("Recording {} marked uploaded", id);
            self.mirror_remove(*id).await;
        } else {
            debug!("mark_uploaded ignored for unknown recording {}", id);
        }
    }

    /// Count one more upload attempt against a recording's retry budget
    pub async fn increment_attempts(&self, id: &RecordingId) {
        let snapshot = {
            let mut state = self.state.write().await;
            let Some(recording) = state.records.get_mut(id) else {
                return;
            };
            recording.upload_attempts += 1;
            debug!(
                "Recording {} upload attempt {}/{}",
                id, recording.upload_attempts, self.max_attempts
            );
            (self.mirror.is_some() && !recording.uploaded).then(|| recording.clone())
        };

        if let Some(bytes) = snapshot.and_then(|r| self.encode_for_mirror(&r)) {
            self.mirror_set(*id, bytes).await;
        }
    }

    /// Recordings not yet uploaded and still within the retry budget, in insertion order
    pub async fn pending(&self) -> Vec<StoredRecording> {
        let state = self.state.read().await;
        state
            .ordered()
            .filter(|r| r.is_pending(self.max_attempts))
            .cloned()
            .collect()
    }

    /// Evict every uploaded recording, returning how many were removed
    pub async fn cleanup(&self) -> usize {
        let mut state = self.state.write().await;
        let BufferState { records, order } = &mut *state;

        let before = records.len();
        records.retain(|_, r| !r.uploaded);
        order.retain(|id| records.contains_key(id));
        let removed = before - records.len();

        if removed > 0 {
            debug!("Evicted {} uploaded recordings", removed);
        }
        removed
    }

    /// Every buffered recording, in insertion order
    pub async fn all(&self) -> Vec<StoredRecording> {
        self.state.read().await.ordered().cloned().collect()
    }

    /// Look up a single recording
    pub async fn get(&self, id: &RecordingId) -> Option<StoredRecording> {
        self.state.read().await.records.get(id).cloned()
    }

    pub async fn len(&self) -> usize {
        self.state.read().await.records.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.state.read().await.records.is_empty()
    }

    /// Drop every recording and purge the mirror namespace
    pub async fn clear_all(&self) {
        let count = {
            let mut state = self.state.write().await;
            let count = state.records.len();
            *state = BufferState::default();
            count
        };

        self.run_mirror("purge mirrored recordings", |mirror| {
            mirror.remove_all_with_prefix(RECORDING_KEY_PREFIX)
        })
        .await;

        info!("Cleared {} buffered recordings", count);
    }

    /// Drop recordings whose retry budget ran out, from memory and the mirror.
    ///
    /// Returns the number removed.
    pub async fn purge_abandoned(&self) -> usize {
        let abandoned: Vec<RecordingId> = {
            let mut state = self.state.write().await;
            let BufferState { records, order } = &mut *state;

            let ids: Vec<RecordingId> = records
                .values()
                .filter(|r| r.is_abandoned(self.max_attempts))
                .map(|r| r.id)
                .collect();
            for id in &ids {
                records.remove(id);
            }
            order.retain(|id| records.contains_key(id));
            ids
        };

        for id in &abandoned {
            self.mirror_remove(*id).await;
        }
        if !abandoned.is_empty() {
            warn!("Purged {} abandoned recordings", abandoned.len());
        }
        abandoned.len()
    }

    /// Summarize buffer contents
    pub async fn stats(&self) -> BufferStats {
        let state = self.state.read().await;
        let mut stats = BufferStats::default();

        for recording in state.records.values() {
            stats.total += 1;
            stats.total_bytes += recording.size_bytes();

            if recording.uploaded {
                stats.uploaded += 1;
            } else if recording.is_abandoned(self.max_attempts) {
                stats.abandoned += 1;
            } else {
                stats.pending += 1;
            }
        }

        stats
    }

    /// Reload recordings left in the mirror by a previous process.
    ///
    /// Entries that fail to decode are logged and skipped. Recordings already
    /// in memory are left untouched. Returns the number restored.
    pub async fn restore_from_mirror(&self) -> usize {
        let Some(entries) = self
            .run_mirror("read mirrored recordings", |mirror| {
                mirror.load_all_with_prefix(RECORDING_KEY_PREFIX)
            })
            .await
        else {
            return 0;
        };

        let mut recovered: Vec<StoredRecording> = entries
            .into_iter()
            .filter_map(|(key, bytes)| match StoredRecording::from_bytes(&bytes) {
                Ok(recording) => Some(recording),
                Err(e) => {
                    warn!("Skipping unreadable mirrored entry {}: {}", key, e);
                    None
                }
            })
            .filter(|r| !r.uploaded)
            .collect();
        recovered.sort_by_key(|r| r.created_at);

        let mut state = self.state.write().await;
        let mut restored = 0;
        for recording in recovered {
            if !state.records.contains_key(&recording.id) {
                state.insert(recording);
                restored += 1;
            }
        }

        if restored > 0 {
            info!("Restored {} recordings from mirror", restored);
        }
        restored
    }

    /// Flush the mirror so buffered recordings survive a crash
    pub async fn flush_mirror(&self) {
        if let Some(mirror) = &self.mirror {
            if let Err(e) = mirror.flush().await {
                warn!("Failed to flush recording mirror: {}", e);
            }
        }
    }

    /// MessagePack snapshot for the mirror, or `None` without a mirror
    fn encode_for_mirror(&self, recording: &StoredRecording) -> Option<Vec<u8>> {
        self.mirror.as_ref()?;
        match recording.to_bytes() {
            Ok(bytes) => Some(bytes),
            Err(e) => {
                warn!("Failed to encode recording {} for mirror: {}", recording.id, e);
                None
            }
        }
    }

    async fn mirror_set(&self, id: RecordingId, bytes: Vec<u8>) {
        self.run_mirror("mirror recording", move |mirror| {
            mirror.set(&recording_key(&id), &bytes)
        })
        .await;
    }

    async fn mirror_remove(&self, id: RecordingId) {
        self.run_mirror("remove mirrored recording", move |mirror| {
            mirror.remove(&recording_key(&id))
        })
        .await;
    }

    /// Run a blocking mirror operation on the blocking pool, logging any failure
    async fn run_mirror<T, F>(&self, action: &str, op: F) -> Option<T>
    where
        T: Send + 'static,
        F: FnOnce(&dyn RecordingMirror) -> MirrorResult<T> + Send + 'static,
    {
        let mirror = Arc::clone(self.mirror.as_ref()?);
        match tokio::task::spawn_blocking(move || op(&*mirror)).await {
            Ok(Ok(value)) => Some(value),
            Ok(Err(e)) => {
                warn!("Failed to {}: {}", action, e);
                None
            }
            Err(e) => {
                warn!("Mirror task to {} did not complete: {}", action, e);
                None
            }
        }
    }
}

impl Default for RecordingBuffer {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_ATTEMPTS)
    }
}
