//! Error types for txfs.
//!
//! All operations return `Result<T>` which aliases `Result<T, TxError>`.
//!
//! I/O failures are classified exactly once, where they are first observed
//! (see [`TxError::io`] and [`IoContext`]). Retry decisions downstream only
//! look at the variant, never at the wrapped `io::Error`.

use std::io;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

/// Errors from file mutation operations.
#[derive(Debug, Error)]
pub enum TxError {
    /// Retryable I/O failure (permission hiccup, resource busy, generic I/O).
    #[error("{context}: {source}")]
    Transient {
        context: String,
        #[source]
        source: io::Error,
    },

    /// The path vanished or never existed. Never retried.
    #[error("Path not found: {}", path.display())]
    NotFound { path: PathBuf },

    /// Structural I/O failure (not-a-directory, is-a-directory). Never retried.
    #[error("{context}: {source}")]
    Permanent {
        context: String,
        #[source]
        source: io::Error,
    },

    /// Waited too long for another operation on the same path.
    #[error("Timed out after {waited:?} waiting for lock on {}", path.display())]
    LockTimeout { path: PathBuf, waited: Duration },

    /// Backup does not match its original. Always fatal.
    #[error(
        "Backup verification failed for {} (backup at {}): {detail}",
        original.display(),
        backup.display()
    )]
    Integrity {
        original: PathBuf,
        backup: PathBuf,
        detail: String,
    },

    /// A single rollback step could not be applied.
    ///
    /// Logged during rollback, never returned from a failed operation.
    #[error("Rollback step failed for {}: {detail}", path.display())]
    RollbackStep { path: PathBuf, detail: String },

    /// A transient failure persisted through every attempt.
    #[error("{context} failed after {attempts} attempt(s): {source}")]
    RetriesExhausted {
        context: String,
        attempts: u32,
        #[source]
        source: Box<TxError>,
    },

    /// Operation issued against a committed or rolled back transaction.
    #[error("Invalid transaction state: {0}")]
    InvalidState(String),

    /// Malformed plan file.
    #[error("Invalid plan: {0}")]
    Plan(String),

    /// TOML parse error.
    #[error("TOML error: {0}")]
    Toml(#[from] toml_edit::TomlError),

    /// Unexpected error.
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl TxError {
    /// Classifies an I/O error observed while performing `action` on `path`.
    pub fn io(action: &str, path: &Path, err: io::Error) -> Self {
        let context = format!("Failed to {} {}", action, path.display());
        match err.kind() {
            io::ErrorKind::NotFound => TxError::NotFound {
                path: path.to_path_buf(),
            },
            io::ErrorKind::NotADirectory | io::ErrorKind::IsADirectory => TxError::Permanent {
                context,
                source: err,
            },
            _ => TxError::Transient {
                context,
                source: err,
            },
        }
    }

    /// Returns true if the operation that produced this error may be retried.
    pub fn is_transient(&self) -> bool {
        matches!(self, TxError::Transient { .. })
    }

    /// Unwraps retry aggregation and returns the underlying failure.
    pub fn root_cause(&self) -> &TxError {
        match self {
            TxError::RetriesExhausted { source, .. } => source.root_cause(),
            other => other,
        }
    }
}

/// Attaches an action and path to an `io::Result`, classifying the failure.
pub trait IoContext<T> {
    fn io_context(self, action: &str, path: &Path) -> Result<T>;
}

impl<T> IoContext<T> for io::Result<T> {
    fn io_context(self, action: &str, path: &Path) -> Result<T> {
        self.map_err(|e| TxError::io(action, path, e))
    }
}

/// Result type alias for txfs operations.
pub type Result<T> = std::result::Result<T, TxError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_not_found_is_permanent() {
        let err = TxError::io(
            "read",
            Path::new("gone.txt"),
            io::Error::from(io::ErrorKind::NotFound),
        );
        assert!(matches!(err, TxError::NotFound { .. }));
        assert!(!err.is_transient());
    }

    #[test]
    fn test_directory_kinds_are_permanent() {
        for kind in [io::ErrorKind::NotADirectory, io::ErrorKind::IsADirectory] {
            let err = TxError::io("write", Path::new("x"), io::Error::from(kind));
            assert!(matches!(err, TxError::Permanent { .. }));
        }
    }

    #[test]
    fn test_other_kinds_are_transient() {
        for kind in [
            io::ErrorKind::PermissionDenied,
            io::ErrorKind::AlreadyExists,
            io::ErrorKind::Interrupted,
            io::ErrorKind::Other,
        ] {
            let err = TxError::io("write", Path::new("x"), io::Error::from(kind));
            assert!(err.is_transient(), "{kind:?} should be transient");
        }
    }

    #[test]
    fn test_root_cause_unwraps_retries() {
        let err = TxError::RetriesExhausted {
            context: "write a.txt".into(),
            attempts: 3,
            source: Box::new(TxError::InvalidState("inner".into())),
        };
        assert!(matches!(err.root_cause(), TxError::InvalidState(_)));
        assert!(err.to_string().contains("write a.txt failed after 3 attempt(s)"));
    }
}
