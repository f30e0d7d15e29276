//! File system operations with transaction support.
//!
//! Provides locked, atomic file and directory mutations that can be
//! committed or rolled back as a unit.

pub mod atomic;
pub mod lock;
pub mod retry;
pub mod transaction;
pub mod verify;

pub use atomic::AtomicFs;
pub use lock::{LockManager, PathLockGuard, normalize_path};
pub use retry::RetryPolicy;
pub use transaction::{Operation, RollbackSummary, Transaction, TransactionReport, TransactionStats};
pub use verify::{BackupVerifier, DirectoryCheck, Fingerprint, Verify};
