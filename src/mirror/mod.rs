use async_trait::async_trait;
use sled::{Db, Tree};
use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Mutex;
use thiserror::Error;
use tracing::{debug, info};

use crate::recording::RecordingId;

/// Namespace shared by every mirrored recording key
pub const RECORDING_KEY_PREFIX: &str = "recording_";

/// Build the mirror key for a recording
pub fn recording_key(id: &RecordingId) -> String {
    format!("{}{}", RECORDING_KEY_PREFIX, id)
}

/// Errors reported by a durable mirror
#[derive(Error, Debug)]
pub enum MirrorError {
    /// Underlying sled database failed
    #[error("Sled error: {0}")]
    Sled(#[from] sled::Error),

    /// Mirror state is unusable (e.g., poisoned lock)
    #[error("Mirror unavailable: {0}")]
    Unavailable(String),
}

pub type MirrorResult<T> = std::result::Result<T, MirrorError>;

/// Best-effort durable key-value store used to survive crashes.
///
/// Callers treat every error as non-fatal; the in-memory buffer stays the
/// source of truth for the running session. The synchronous methods may block
/// on disk I/O, so async callers run them on the blocking pool.
#[async_trait]
pub trait RecordingMirror: Send + Sync {
    /// Store `value` under `key`, replacing any previous value
    fn set(&self, key: &str, value: &[u8]) -> MirrorResult<()>;

    /// Remove `key` if present
    fn remove(&self, key: &str) -> MirrorResult<()>;

    /// Remove every key starting with `prefix`, returning how many were removed
    fn remove_all_with_prefix(&self, prefix: &str) -> MirrorResult<usize>;

    /// Load every entry whose key starts with `prefix`
    fn load_all_with_prefix(&self, prefix: &str) -> MirrorResult<Vec<(String, Vec<u8>)>>;

    /// Push buffered writes to durable media
    async fn flush(&self) -> MirrorResult<()> {
        Ok(())
    }
}

/// Mirror backed by a sled tree
#[derive(Clone)]
pub struct SledMirror {
    db: Db,
    tree: Tree,
}

impl SledMirror {
    /// Open (or create) a mirror at the specified path
    pub fn new<P: AsRef<Path>>(path: P) -> MirrorResult<Self> {
        let db = sled::open(&path)?;
        let tree = db.open_tree("recordings")?;

        info!(
            "Opened recording mirror at {} ({} entries)",
            path.as_ref().display(),
            tree.len()
        );

        Ok(Self { db, tree })
    }

    /// Create a temporary mirror that is deleted on drop (useful for testing)
    pub fn new_temp() -> MirrorResult<Self> {
        let db = sled::Config::new().temporary(true).open()?;
        let tree = db.open_tree("recordings")?;
        Ok(Self { db, tree })
    }

    /// Number of mirrored entries
    pub fn len(&self) -> usize {
        self.tree.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tree.is_empty()
    }
}

#[async_trait]
impl RecordingMirror for SledMirror {
    fn set(&self, key: &str, value: &[u8]) -> MirrorResult<()> {
        self.tree.insert(key.as_bytes(), value)?;
        debug!("Mirrored {} ({} bytes)", key, value.len());
        Ok(())
    }

    fn remove(&self, key: &str) -> MirrorResult<()> {
        self.tree.remove(key.as_bytes())?;
        Ok(())
    }

    fn remove_all_with_prefix(&self, prefix: &str) -> MirrorResult<usize> {
        let mut removed = 0;
        for entry in self.tree.scan_prefix(prefix.as_bytes()) {
            let (key, _) = entry?;
            self.tree.remove(&key)?;
            removed += 1;
        }
        debug!("Removed {} mirrored entries with prefix {}", removed, prefix);
        Ok(removed)
    }

    fn load_all_with_prefix(&self, prefix: &str) -> MirrorResult<Vec<(String, Vec<u8>)>> {
        let mut entries = Vec::new();
        for entry in self.tree.scan_prefix(prefix.as_bytes()) {
            let (key, value) = entry?;
            entries.push((String::from_utf8_lossy(&key).into_owned(), value.to_vec()));
        }
        Ok(entries)
    }

    /// Flush all pending writes to disk
    async fn flush(&self) -> MirrorResult<()> {
        self.db.flush_async().await?;
        Ok(())
    }
}

/// In-memory mirror for tests and runs without durable storage
#[derive(Default)]
pub struct MemoryMirror {
    entries: Mutex<BTreeMap<String, Vec<u8>>>,
}

impl MemoryMirror {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fetch a single entry
    pub fn get(&self, key: &str) -> Option<Vec<u8>> {
        self.entries.lock().ok()?.get(key).cloned()
    }

    pub fn len(&self) -> usize {
        self.entries.lock().map(|e| e.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn lock(&self) -> MirrorResult<std::sync::MutexGuard<'_, BTreeMap<String, Vec<u8>>>> {
        self.entries
            .lock()
            .map_err(|e| MirrorError::Unavailable(e.to_string()))
    }
}

#[async_trait]
impl RecordingMirror for MemoryMirror {
    fn set(&self, key: &str, value: &[u8]) -> MirrorResult<()> {
        self.lock()?.insert(key.to_string(), value.to_vec());
        Ok(())
    }

    fn remove(&self, key: &str) -> MirrorResult<()> {
        self.lock()?.remove(key);
        Ok(())
    }

    fn remove_all_with_prefix(&self, prefix: &str) -> MirrorResult<usize> {
        let mut entries = self.lock()?;
        let before = entries.len();
        entries.retain(|key, _| !key.starts_with(prefix));
        Ok(before - entries.len())
    }

    fn load_all_with_prefix(&self, prefix: &str) -> MirrorResult<Vec<(String, Vec<u8>)>> {
        Ok(self
            .lock()?
            .iter()
            .filter(|(key, _)| key.starts_with(prefix))
            .map(|(key, value)| (key.clone(), value.clone()))
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    #[test]
    fn test_recording_key_is_namespaced() {
        let id = Uuid::new_v4();
        let key = recording_key(&id);
        assert!(key.starts_with(RECORDING_KEY_PREFIX));
        assert!(key.ends_with(&id.to_string()));
    }

    #[test]
    fn test_sled_mirror_prefix_operations() {
        let mirror = SledMirror::new_temp().unwrap();

        mirror.set("recording_a", b"one").unwrap();
        mirror.set("recording_b", b"two").unwrap();
        mirror.set("settings_theme", b"dark").unwrap();

        let loaded = mirror.load_all_with_prefix(RECORDING_KEY_PREFIX).unwrap();
        assert_eq!(loaded.len(), 2);
        assert!(loaded.contains(&("recording_a".to_string(), b"one".to_vec())));

        assert_eq!(mirror.remove_all_with_prefix(RECORDING_KEY_PREFIX).unwrap(), 2);
        assert_eq!(mirror.len(), 1);
    }

    #[tokio::test]
    async fn test_sled_mirror_persistence() {
        let temp_dir = tempfile::tempdir().unwrap();
        let path = temp_dir.path().join("mirror");

        {
            let mirror = SledMirror::new(&path).unwrap();
            mirror.set("recording_x", b"payload").unwrap();
            mirror.flush().await.unwrap();
        }

        {
            let mirror = SledMirror::new(&path).unwrap();
            let loaded = mirror.load_all_with_prefix("recording_").unwrap();
            assert_eq!(loaded, vec![("recording_x".to_string(), b"payload".to_vec())]);
        }
    }

    #[test]
    fn test_memory_mirror_remove() {
        let mirror = MemoryMirror::new();
        mirror.set("recording_a", b"1").unwrap();
        mirror.remove("recording_a").unwrap();
        mirror.remove("recording_missing").unwrap();

        assert!(mirror.is_empty());
        assert!(mirror.get("recording_a").is_none());
    }
}
