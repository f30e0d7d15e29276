//! Engine configuration.
//!
//! [`EngineConfig`] carries every tunable of the engine. The binary fills it
//! from command-line flags; library callers start from `Default` and adjust
//! with the `with_*` methods.

use crate::fs::{DirectoryCheck, RetryPolicy};

use std::path::PathBuf;
use std::time::Duration;

/// Default number of attempts for a write, copy or move.
pub const DEFAULT_MAX_ATTEMPTS: u32 = 5;

/// Default number of attempts to create an advisory lock marker.
pub const DEFAULT_MARKER_ATTEMPTS: u32 = 3;

/// Default time a caller waits in the lock queue.
pub const DEFAULT_LOCK_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub retry: RetryPolicy,
    pub max_attempts: u32,
    pub marker_attempts: u32,
    pub lock_timeout: Duration,
    pub directory_check: DirectoryCheck,
    pub preserve_timestamps: bool,
    /// Keep the backup root after a successful commit.
    pub keep_backups: bool,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            retry: RetryPolicy::default(),
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            marker_attempts: DEFAULT_MARKER_ATTEMPTS,
            lock_timeout: DEFAULT_LOCK_TIMEOUT,
            directory_check: DirectoryCheck::default(),
            preserve_timestamps: false,
            keep_backups: false,
        }
    }
}

impl EngineConfig {
    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn with_max_attempts(mut self, attempts: u32) -> Self {
        self.max_attempts = attempts;
        self
    }

    pub fn with_lock_timeout(mut self, timeout: Duration) -> Self {
        self.lock_timeout = timeout;
        self
    }

    pub fn with_directory_check(mut self, check: DirectoryCheck) -> Self {
        self.directory_check = check;
        self
    }

    pub fn with_preserve_timestamps(mut self, preserve: bool) -> Self {
        self.preserve_timestamps = preserve;
        self
    }

    pub fn with_keep_backups(mut self, keep: bool) -> Self {
        self.keep_backups = keep;
        self
    }
}

/// Where a transaction places its backup root.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum BackupLocation {
    /// A fresh timestamped directory under the system temp directory.
    #[default]
    Temp,
    /// A fresh timestamped directory under the given directory.
    Under(PathBuf),
    /// Use the given directory as-is, shared with other transactions.
    ///
    /// Only the entries a transaction created are removed on commit.
    Shared(PathBuf),
}
