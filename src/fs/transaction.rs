//! Transactional file mutation with verified backups and rollback.
//!
//! A [`Transaction`] applies writes and copies one at a time. Before the
//! first mutation of a path that already exists, the path is copied into the
//! transaction's backup root and the copy is verified against the original.
//!
//! ## Execution Guarantees
//!
//! - **Backup first**: every pre-existing path gets exactly one verified
//!   backup before its first mutation
//! - **Atomic steps**: each mutation goes through [`AtomicFs`]
//! - **Automatic rollback**: a failing step rolls back every earlier step
//!   before the error is returned
//! - **Best-effort rollback**: a step that cannot be undone is logged and
//!   the remaining steps are still undone
//!
//! ## Phases
//!
//! 1. **Begin**: create the backup root
//! 2. **Mutate**: `write()` / `copy()`, each backing up then mutating
//! 3. **Commit**: discard the backup root, or
//! 4. **Rollback**: replay records in LIFO order
//!
//! ## Example
//!
//! ```no_run
//! # use txfs::config::BackupLocation;
//! # use txfs::fs::{AtomicFs, Transaction};
//! # fn example() -> txfs::Result<()> {
//! let fs = AtomicFs::default();
//! let mut txn = Transaction::begin(&fs, &BackupLocation::Temp, false)?;
//!
//! txn.write("README.md", "# Project\n")?;
//! txn.copy("templates/ci", ".github/workflows")?;
//!
//! let report = txn.commit()?; // Earlier steps are rolled back if any step fails
//! println!("{} files processed", report.files_processed);
//! # Ok(())
//! # }
//! ```

use crate::config::BackupLocation;
use crate::error::{IoContext, Result, TxError};
use crate::fs::atomic::{self, AtomicFs};
use crate::fs::lock::normalize_path;
use crate::fs::verify::{BackupVerifier, Verify};

use chrono::{DateTime, SecondsFormat, Utc};
use colored::Colorize;
use std::collections::HashMap;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use uuid::Uuid;

/// Prefix of backup root directory names.
pub const BACKUP_ROOT_PREFIX: &str = "txfs-backup-";

/// A recorded step of a transaction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Operation {
    /// Verified copy of `target` stored at `backup`.
    Backup { target: PathBuf, backup: PathBuf },
    /// New content written to `target`.
    ///
    /// `created` is true when `target` did not exist before the transaction
    /// first touched it; `created_dirs` lists the ancestors this step created.
    Write {
        target: PathBuf,
        created: bool,
        created_dirs: Vec<PathBuf>,
    },
    /// `source` copied onto `target`.
    Copy {
        source: PathBuf,
        target: PathBuf,
        files: usize,
        created: bool,
        created_dirs: Vec<PathBuf>,
    },
}

impl Operation {
    pub fn target(&self) -> &Path {
        match self {
            Operation::Backup { target, .. }
            | Operation::Write { target, .. }
            | Operation::Copy { target, .. } => target,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TransactionState {
    /// Accepting operations.
    Active,
    /// Backups discarded; terminal.
    Committed,
    /// Recorded steps undone; terminal.
    RolledBack,
}

#[derive(Debug)]
struct BackupRoot {
    path: PathBuf,
    shared: bool,
    entries: Vec<PathBuf>,
}

impl BackupRoot {
    fn create(location: &BackupLocation) -> Result<Self> {
        match location {
            BackupLocation::Temp => Self::create_unique(&std::env::temp_dir()),
            BackupLocation::Under(base) => Self::create_unique(base),
            BackupLocation::Shared(dir) => {
                fs::create_dir_all(dir).io_context("create backup directory", dir)?;
                Ok(Self {
                    path: dir.clone(),
                    shared: true,
                    entries: Vec::new(),
                })
            }
        }
    }

    fn create_unique(base: &Path) -> Result<Self> {
        fs::create_dir_all(base).io_context("create backup directory", base)?;
        let stem = backup_dir_name(Utc::now());

        let mut attempt = 0u32;
        loop {
            let name = if attempt == 0 {
                stem.clone()
            } else {
                format!("{}-{}", stem, attempt)
            };
            let path = base.join(name);

            match fs::create_dir(&path) {
                Ok(()) => {
                    return Ok(Self {
                        path,
                        shared: false,
                        entries: Vec::new(),
                    });
                }
                Err(e) if e.kind() == io::ErrorKind::AlreadyExists => attempt += 1,
                Err(e) => return Err(TxError::io("create backup directory", &path, e)),
            }
        }
    }

    /// Reserves an opaque, unique location for the next backup.
    fn next_entry(&mut self) -> PathBuf {
        let name = format!("{:04}-{}", self.entries.len(), Uuid::new_v4().simple());
        let path = self.path.join(name);
        self.entries.push(path.clone());
        path
    }

    /// Best-effort removal. A shared root only loses this transaction's entries.
    fn discard(&self) {
        if self.shared {
            for entry in &self.entries {
                if let Err(e) = atomic::remove_path(entry) {
                    log::warn!("Failed to remove backup {}: {}", entry.display(), e);
                }
            }
        } else if let Err(e) = atomic::remove_path(&self.path) {
            log::warn!(
                "Failed to remove backup directory {}: {}",
                self.path.display(),
                e
            );
        }
    }
}

/// Backup root name for a transaction started at `now`.
///
/// ISO-8601 with `:` and `.` replaced so the name is valid on every platform.
pub fn backup_dir_name(now: DateTime<Utc>) -> String {
    let stamp = now.to_rfc3339_opts(SecondsFormat::Millis, true);
    format!("{}{}", BACKUP_ROOT_PREFIX, stamp.replace([':', '.'], "-"))
}

/// Outcome of a rollback. Step failures are reported here, never raised.
#[derive(Debug, Default)]
pub struct RollbackSummary {
    pub restored: usize,
    pub removed: usize,
    pub failures: Vec<TxError>,
}

impl RollbackSummary {
    pub fn is_clean(&self) -> bool {
        self.failures.is_empty()
    }
}

/// What a transaction did, for reporting back to the caller.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransactionReport {
    pub files_processed: usize,
    pub backups: usize,
    /// Backup root, when at least one backup was taken.
    pub backup_dir: Option<PathBuf>,
    /// True when the backup root was kept after commit.
    pub backups_retained: bool,
}

/// Transaction coordinating verified backups and atomic mutations.
///
/// Dropping an active transaction that recorded operations rolls it back.
///
/// ## Dry-Run Mode
///
/// When `dry_run = true`, operations are recorded and logged but nothing is
/// written and no backup root is created.
#[must_use = "Transaction must be committed or rolled back"]
pub struct Transaction<'a> {
    fs: &'a AtomicFs,
    verifier: Box<dyn Verify + 'a>,
    operations: Vec<Operation>,
    /// Normalized paths touched so far, and whether each was created here.
    touched: HashMap<PathBuf, bool>,
    backup_root: Option<BackupRoot>,
    dry_run: bool,
    state: TransactionState,
}

impl<'a> Transaction<'a> {
    /// Opens a transaction, creating its backup root.
    pub fn begin(fs: &'a AtomicFs, location: &BackupLocation, dry_run: bool) -> Result<Self> {
        let backup_root = if dry_run {
            None
        } else {
            let root = BackupRoot::create(location)?;
            log::debug!("Backup directory: {}", root.path.display());
            Some(root)
        };

        Ok(Self {
            fs,
            verifier: Box::new(BackupVerifier::new(fs.config().directory_check)),
            operations: Vec::new(),
            touched: HashMap::new(),
            backup_root,
            dry_run,
            state: TransactionState::Active,
        })
    }

    /// Replaces the check run on every backup before its original is touched.
    pub fn with_verifier(mut self, verifier: impl Verify + 'a) -> Self {
        self.verifier = Box::new(verifier);
        self
    }

    pub fn len(&self) -> usize {
        self.operations.len()
    }

    pub fn is_empty(&self) -> bool {
        self.operations.is_empty()
    }

    pub fn is_dry_run(&self) -> bool {
        self.dry_run
    }

    /// Returns true if successfully committed.
    pub fn is_committed(&self) -> bool {
        self.state == TransactionState::Committed
    }

    pub fn is_rolled_back(&self) -> bool {
        self.state == TransactionState::RolledBack
    }

    /// Recorded steps in execution order.
    pub fn operations(&self) -> &[Operation] {
        &self.operations
    }

    pub fn backup_root(&self) -> Option<&Path> {
        self.backup_root.as_ref().map(|root| root.path.as_path())
    }

    fn ensure_active(&self) -> Result<()> {
        match self.state {
            TransactionState::Active => Ok(()),
            TransactionState::Committed => Err(TxError::InvalidState(
                "transaction already committed".to_string(),
            )),
            TransactionState::RolledBack => Err(TxError::InvalidState(
                "transaction already rolled back".to_string(),
            )),
        }
    }

    /// Writes `contents` to `path`, backing up any existing content first.
    ///
    /// On failure every earlier step is rolled back before the error is
    /// returned.
    pub fn write(&mut self, path: impl AsRef<Path>, contents: impl AsRef<[u8]>) -> Result<()> {
        let path = path.as_ref();
        let contents = contents.as_ref();
        self.ensure_active()?;

        if self.dry_run {
            log::info!("Would write: {}", path.display());
        }

        let result = self.step(
            path,
            |fs| fs.write(path, contents).map(|()| 1),
            |_files, created, created_dirs| Operation::Write {
                target: path.to_path_buf(),
                created,
                created_dirs,
            },
        );
        self.settle(result)
    }

    /// Copies `source` (file or tree) onto `path`, backing up `path` first.
    pub fn copy(&mut self, source: impl AsRef<Path>, path: impl AsRef<Path>) -> Result<()> {
        let source = source.as_ref();
        let path = path.as_ref();
        self.ensure_active()?;

        if self.dry_run {
            log::info!("Would copy: {} → {}", source.display(), path.display());
        }

        let result = self.step(
            path,
            |fs| fs.copy(source, path),
            |files, created, created_dirs| Operation::Copy {
                source: source.to_path_buf(),
                target: path.to_path_buf(),
                files,
                created,
                created_dirs,
            },
        );
        self.settle(result)
    }

    fn step<M, R>(&mut self, target: &Path, mutate: M, record: R) -> Result<()>
    where
        M: FnOnce(&AtomicFs) -> Result<usize>,
        R: FnOnce(usize, bool, Vec<PathBuf>) -> Operation,
    {
        let key = normalize_path(target)?;
        let exists = atomic::path_exists(target);

        let created = match self.touched.get(&key) {
            Some(&created) => created,
            None => {
                if exists && !self.dry_run {
                    self.backup(target)?;
                }
                self.touched.insert(key, !exists);
                !exists
            }
        };

        let created_dirs = if exists {
            Vec::new()
        } else {
            atomic::missing_ancestors(target)
        };

        let files = if self.dry_run {
            0
        } else {
            match mutate(self.fs) {
                Ok(files) => files,
                Err(e) => {
                    // Nothing is recorded for a failed mutation, so its
                    // directories are not reachable from rollback.
                    prune_dirs(&created_dirs);
                    return Err(e);
                }
            }
        };
        self.operations.push(record(files, created, created_dirs));
        Ok(())
    }

    fn backup(&mut self, target: &Path) -> Result<()> {
        let entry = self
            .backup_root
            .as_mut()
            .map(BackupRoot::next_entry)
            .ok_or_else(|| TxError::InvalidState("no backup directory".to_string()))?;

        self.fs.copy(target, &entry)?;
        self.verifier.verify(target, &entry)?;

        log::debug!("Backed up {} to {}", target.display(), entry.display());
        self.operations.push(Operation::Backup {
            target: target.to_path_buf(),
            backup: entry,
        });
        Ok(())
    }

    fn settle(&mut self, result: Result<()>) -> Result<()> {
        if let Err(e) = result {
            log::error!("Transaction step failed: {}", e);
            match self.rollback() {
                Ok(summary) if !summary.is_clean() => log::error!(
                    "Rollback left {} path(s) unrestored",
                    summary.failures.len()
                ),
                Ok(_) => {}
                Err(rollback_err) => log::error!("Rollback not possible: {}", rollback_err),
            }
            return Err(e);
        }
        Ok(())
    }

    /// Discards backups and closes the transaction.
    pub fn commit(&mut self) -> Result<TransactionReport> {
        self.ensure_active()?;
        self.state = TransactionState::Committed;
        let report = self.report();

        if let Some(root) = &self.backup_root {
            if report.backups_retained {
                log::info!("Backups kept at {}", root.path.display());
            } else {
                root.discard();
            }
        }

        log::info!("Committed {} operation(s)", self.operations.len());
        Ok(report)
    }

    /// Undoes recorded steps in reverse order.
    ///
    /// Backed-up paths are moved back from the backup root; paths created by
    /// the transaction are deleted together with any directories created for
    /// them. A step that fails is logged and recorded in the summary; the
    /// remaining steps still run. Rolling back twice is a no-op.
    pub fn rollback(&mut self) -> Result<RollbackSummary> {
        match self.state {
            TransactionState::Active => {}
            TransactionState::RolledBack => return Ok(RollbackSummary::default()),
            TransactionState::Committed => {
                return Err(TxError::InvalidState(
                    "cannot roll back a committed transaction".to_string(),
                ));
            }
        }
        self.state = TransactionState::RolledBack;

        let mut summary = RollbackSummary::default();
        if self.dry_run {
            return Ok(summary);
        }

        log::info!("Rolling back {} operation(s)", self.operations.len());
        for op in self.operations.iter().rev() {
            let result = match op {
                Operation::Backup { target, backup } => {
                    self.fs.move_path(backup, target).map(|()| summary.restored += 1)
                }
                Operation::Write {
                    target,
                    created: true,
                    created_dirs,
                }
                | Operation::Copy {
                    target,
                    created: true,
                    created_dirs,
                    ..
                } => self.fs.remove(target).map(|()| {
                    prune_dirs(created_dirs);
                    summary.removed += 1;
                }),
                _ => Ok(()),
            };

            if let Err(e) = result {
                let failure = TxError::RollbackStep {
                    path: op.target().to_path_buf(),
                    detail: e.to_string(),
                };
                log::error!("{}", failure);
                summary.failures.push(failure);
            }
        }

        if let Some(root) = &self.backup_root {
            if summary.is_clean() {
                root.discard();
            } else {
                log::warn!(
                    "Backups kept at {} for manual recovery",
                    root.path.display()
                );
            }
        }

        log::info!(
            "Rollback completed: {} restored, {} removed, {} failed",
            summary.restored,
            summary.removed,
            summary.failures.len()
        );
        Ok(summary)
    }

    /// Returns a report of the work done so far.
    pub fn report(&self) -> TransactionReport {
        let stats = self.stats();
        let files_processed = self
            .operations
            .iter()
            .map(|op| match op {
                Operation::Write { .. } => 1,
                Operation::Copy { files, .. } => (*files).max(1),
                Operation::Backup { .. } => 0,
            })
            .sum();

        let backup_dir = self
            .backup_root
            .as_ref()
            .filter(|_| stats.backups > 0)
            .map(|root| root.path.clone());

        TransactionReport {
            files_processed,
            backups: stats.backups,
            backups_retained: backup_dir.is_some()
                && self.state == TransactionState::Committed
                && self.fs.config().keep_backups,
            backup_dir,
        }
    }

    /// Returns human-readable preview of operations.
    pub fn preview(&self) -> Vec<String> {
        self.operations
            .iter()
            .map(|op| match op {
                Operation::Backup { target, .. } => format!("Backup: {}", target.display()),
                Operation::Write { target, .. } => format!("Write: {}", target.display()),
                Operation::Copy { source, target, .. } => {
                    format!("Copy: {} → {}", source.display(), target.display())
                }
            })
            .collect()
    }

    /// Prints a categorized summary to stdout.
    ///
    /// Paths are shown relative to `base` with forward slashes.
    pub fn print_summary(&self, base: &Path) {
        if self.operations.is_empty() {
            println!("\n{}", "No changes needed".yellow());
            return;
        }

        let display_path = |path: &Path| -> String {
            let relative = pathdiff::diff_paths(path, base).unwrap_or_else(|| path.to_path_buf());
            relative.to_string_lossy().replace('\\', "/")
        };
        let mark_new = |label: String, created: bool| -> String {
            if created {
                format!("{} {}", label, "(new)".dimmed())
            } else {
                label
            }
        };

        let mut backed_up = Vec::new();
        let mut written = Vec::new();
        let mut copied = Vec::new();

        for op in &self.operations {
            match op {
                Operation::Backup { target, .. } => backed_up.push(display_path(target)),
                Operation::Write {
                    target, created, ..
                } => written.push(mark_new(display_path(target), *created)),
                Operation::Copy {
                    source,
                    target,
                    created,
                    ..
                } => copied.push(mark_new(
                    format!("{} → {}", display_path(source), display_path(target)),
                    *created,
                )),
            }
        }

        if self.dry_run {
            println!("\n{}", "DRY RUN - No changes will be made".yellow().bold());
        } else if self.is_rolled_back() {
            println!("\n{}", "Changes rolled back:".red().bold());
        } else {
            println!("\n{}", "Changes applied:".green().bold());
        }

        self.print_section("📝", "Written", &written, 8);
        self.print_section("📁", "Copied", &copied, 8);
        self.print_section("🗄", "Backed up", &backed_up, 5);

        println!();
        let num_ops = written.len() + copied.len();
        if self.dry_run {
            println!(
                "{} {} will be modified. Run without {} to apply.",
                num_ops.to_string().cyan().bold(),
                if num_ops > 1 { "paths" } else { "path" },
                "--dry-run".cyan()
            );
        } else if self.is_rolled_back() {
            println!("{} Restored previous state", "↺".yellow().bold());
        } else {
            println!(
                "{} Successfully completed {} operations",
                "✓".green().bold(),
                num_ops
            );
        }
    }

    fn print_section(&self, icon: &str, title: &str, items: &[String], limit: usize) {
        if items.is_empty() {
            return;
        }

        println!(
            "\n{} {} ({} path{})",
            icon.bold(),
            title,
            items.len(),
            if items.len() == 1 { "" } else { "s" }
        );
        let bullet = if self.dry_run {
            "•".to_string()
        } else {
            "✓".green().to_string()
        };
        for item in items.iter().take(limit) {
            println!("   {} {}", bullet, item.dimmed());
        }
        if items.len() > limit {
            println!("   {} {} more...", bullet, items.len() - limit);
        }
    }
}

impl Drop for Transaction<'_> {
    fn drop(&mut self) {
        if self.state != TransactionState::Active {
            return;
        }

        if !self.operations.is_empty() && !self.dry_run {
            log::warn!("Transaction dropped without commit, rolling back");
            if let Err(e) = self.rollback() {
                log::error!("Rollback on drop failed: {}", e);
            }
        } else if let Some(root) = &self.backup_root {
            root.discard();
        }
    }
}

/// Removes directories created for a path, deepest first, while they are empty.
fn prune_dirs(dirs: &[PathBuf]) {
    for dir in dirs {
        match fs::remove_dir(dir) {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => {
                log::debug!("Leaving directory {}: {}", dir.display(), e);
                break;
            }
        }
    }
}

/// Statistics about transaction operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TransactionStats {
    pub writes: usize,
    pub copies: usize,
    pub backups: usize,
    pub total: usize,
}

impl Transaction<'_> {
    /// Returns operation statistics.
    pub fn stats(&self) -> TransactionStats {
        let mut writes = 0;
        let mut copies = 0;
        let mut backups = 0;

        for op in &self.operations {
            match op {
                Operation::Write { .. } => writes += 1,
                Operation::Copy { .. } => copies += 1,
                Operation::Backup { .. } => backups += 1,
            }
        }

        TransactionStats {
            writes,
            copies,
            backups,
            total: self.operations.len(),
        }
    }
}
