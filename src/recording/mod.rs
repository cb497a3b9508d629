use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Identifier assigned to a recording when it is first buffered
pub type RecordingId = Uuid;

/// Media type assumed when the recorder does not declare one
pub const DEFAULT_CONTENT_TYPE: &str = "audio/webm";

/// One locally buffered audio capture awaiting confirmed upload
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoredRecording {
    /// Unique identifier for this recording
    pub id: RecordingId,
    /// Raw encoded audio as produced by the recorder
    #[serde(with = "serde_bytes")]
    pub audio: Vec<u8>,
    /// Declared media type of `audio` (e.g., "audio/webm")
    pub content_type: String,
    /// Timestamp when the recording was buffered
    pub created_at: DateTime<Utc>,
    /// Assessment this recording belongs to
    pub assessment_id: String,
    /// User who produced the recording
    pub user_id: String,
    /// Set once remote storage confirmed the upload
    pub uploaded: bool,
    /// Number of upload attempts started so far (never decreases)
    pub upload_attempts: u32,
}

impl StoredRecording {
    /// Create a fresh, not yet attempted recording
    pub fn new(
        audio: Vec<u8>,
        content_type: impl Into<String>,
        assessment_id: impl Into<String>,
        user_id: impl Into<String>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            audio,
            content_type: content_type.into(),
            created_at: Utc::now(),
            assessment_id: assessment_id.into(),
            user_id: user_id.into(),
            uploaded: false,
            upload_attempts: 0,
        }
    }

    /// Whether the recording still needs uploading within the retry budget
    pub fn is_pending(&self, max_attempts: u32) -> bool {
        !self.uploaded && self.upload_attempts < max_attempts
    }

    /// Whether the retry budget ran out before an upload succeeded
    pub fn is_abandoned(&self, max_attempts: u32) -> bool {
        !self.uploaded && self.upload_attempts >= max_attempts
    }

    /// Size of the audio payload in bytes
    pub fn size_bytes(&self) -> usize {
        self.audio.len()
    }

    /// File extension matching the declared media type
    pub fn extension(&self) -> &'static str {
        let essence = self
            .content_type
            .split(';')
            .next()
            .unwrap_or_default()
            .trim();
        match essence {
            "audio/webm" | "video/webm" => "webm",
            "audio/ogg" | "audio/opus" => "ogg",
            "audio/wav" | "audio/x-wav" | "audio/wave" => "wav",
            "audio/mp4" | "audio/m4a" | "audio/x-m4a" => "m4a",
            "audio/mpeg" => "mp3",
            _ => "bin",
        }
    }

    /// Remote object key: `assessments/<assessment>/<user>/<id>.<ext>`.
    ///
    /// Assessment and user ids are percent-encoded so each stays a single
    /// path segment.
    pub fn object_key(&self) -> String {
        format!(
            "assessments/{}/{}/{}.{}",
            key_segment(&self.assessment_id),
            key_segment(&self.user_id),
            self.id,
            self.extension()
        )
    }

    /// Serialize this recording to MessagePack format
    pub fn to_bytes(&self) -> Result<Vec<u8>, rmp_serde::encode::Error> {
        rmp_serde::to_vec_named(self)
    }

    /// Deserialize from MessagePack format
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, rmp_serde::decode::Error> {
        rmp_serde::from_slice(bytes)
    }
}

/// Encode one object-key segment so it can never act as a separator or relative component
fn key_segment(part: &str) -> String {
    match part {
        "" => "_".to_string(),
        "." | ".." => part.replace('.', "%2E"),
        _ => urlencoding::encode(part).into_owned(),
    }
}
