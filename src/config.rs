use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::scheduler::SchedulerConfig;
use crate::{
    Result, UploaderError, DEFAULT_ATTEMPT_TIMEOUT, DEFAULT_ITEM_DELAY, DEFAULT_MAX_ATTEMPTS,
    DEFAULT_UPLOAD_INTERVAL, MAX_UPLOAD_INTERVAL,
};

/// Uploader configuration, loadable from a JSON file
#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(default)]
pub struct UploaderConfig {
    /// Seconds between scheduled upload passes
    pub upload_interval_secs: u64,
    /// Milliseconds to wait between uploads within one pass
    pub item_delay_ms: u64,
    /// Upload attempts per recording before it is abandoned
    pub max_attempts: u32,
    /// Seconds a single upload attempt may take
    pub attempt_timeout_secs: u64,
    /// Sled directory for the crash-recovery mirror (none = memory only)
    pub mirror_path: Option<PathBuf>,
    /// Endpoint that hands out presigned upload URLs
    pub presign_endpoint: Option<String>,
    /// Local directory to upload into instead of remote storage
    pub output_dir: Option<PathBuf>,
}

impl Default for UploaderConfig {
    fn default() -> Self {
        Self {
            upload_interval_secs: DEFAULT_UPLOAD_INTERVAL.as_secs(),
            item_delay_ms: DEFAULT_ITEM_DELAY.as_millis() as u64,
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            attempt_timeout_secs: DEFAULT_ATTEMPT_TIMEOUT.as_secs(),
            mirror_path: None,
            presign_endpoint: None,
            output_dir: None,
        }
    }
}

impl UploaderConfig {
    /// Read a configuration file; missing fields take their defaults
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let contents = std::fs::read_to_string(path.as_ref())?;
        serde_json::from_str(&contents).map_err(|e| UploaderError::Config {
            message: format!("{}: {}", path.as_ref().display(), e),
        })
    }

    pub fn upload_interval(&self) -> Duration {
        Duration::from_secs(self.upload_interval_secs)
    }

    pub fn item_delay(&self) -> Duration {
        Duration::from_millis(self.item_delay_ms)
    }

    pub fn attempt_timeout(&self) -> Duration {
        Duration::from_secs(self.attempt_timeout_secs)
    }

    pub fn scheduler_config(&self) -> SchedulerConfig {
        SchedulerConfig {
            interval: self.upload_interval(),
            item_delay: self.item_delay(),
        }
    }

    /// Reject values the scheduler cannot run with
    pub fn validate(&self) -> Result<()> {
        let invalid = |message: &str| -> Result<()> {
            Err(UploaderError::Config {
                message: message.to_string(),
            })
        };

        if self.upload_interval_secs == 0 {
            return invalid("upload_interval_secs must be greater than zero");
        }
        if self.upload_interval_secs > MAX_UPLOAD_INTERVAL.as_secs() {
            return invalid("upload_interval_secs must be at most one day");
        }
        if self.max_attempts == 0 {
            return invalid("max_attempts must be greater than zero");
        }
        if self.attempt_timeout_secs == 0 {
            return invalid("attempt_timeout_secs must be greater than zero");
        }
        match (&self.presign_endpoint, &self.output_dir) {
            (None, None) => invalid("either presign_endpoint or output_dir is required"),
            (Some(_), Some(_)) => invalid("presign_endpoint and output_dir are mutually exclusive"),
            _ => Ok(()),
        }
    }
}
