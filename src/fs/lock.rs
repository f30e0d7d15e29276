//! Per-path locking.
//!
//! [`LockManager`] serializes operations addressed to the same normalized
//! path. Waiters queue in FIFO order and give up after a fixed timeout.
//!
//! Each holder also tries to create an exclusive `<name>.lock` marker next
//! to the target as an advisory signal to other processes. The marker is
//! best-effort: if it cannot be created the in-process lock is still held,
//! and a guard never deletes a marker it did not create.
//!
//! The lock table is owned by the manager, not a process global. Clones of
//! a manager share one table.

use crate::config::EngineConfig;
use crate::error::{IoContext, Result, TxError};
use crate::fs::retry::RetryPolicy;

use std::collections::{HashMap, VecDeque};
use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Component, Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

/// Suffix appended to a target's file name to form its marker.
pub const MARKER_SUFFIX: &str = ".lock";

#[derive(Debug)]
struct LockEntry {
    holder: Option<u64>,
    waiters: VecDeque<u64>,
    acquired_at: Instant,
}

impl LockEntry {
    fn held_by(token: u64) -> Self {
        Self {
            holder: Some(token),
            waiters: VecDeque::new(),
            acquired_at: Instant::now(),
        }
    }
}

#[derive(Debug, Default)]
struct LockTable {
    entries: Mutex<HashMap<PathBuf, LockEntry>>,
    released: Condvar,
    next_token: AtomicU64,
}

impl LockTable {
    fn entries(&self) -> MutexGuard<'_, HashMap<PathBuf, LockEntry>> {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Grants exclusive access to paths.
#[derive(Debug, Clone)]
pub struct LockManager {
    table: Arc<LockTable>,
    timeout: Duration,
    retry: RetryPolicy,
    marker_attempts: u32,
}

impl LockManager {
    pub fn new(timeout: Duration, retry: RetryPolicy, marker_attempts: u32) -> Self {
        Self {
            table: Arc::default(),
            timeout,
            retry,
            marker_attempts,
        }
    }

    pub fn from_config(config: &EngineConfig) -> Self {
        Self::new(
            config.lock_timeout,
            config.retry.clone(),
            config.marker_attempts,
        )
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Blocks until `path` is free, then takes it.
    ///
    /// Fails with [`TxError::LockTimeout`] if the caller is still queued
    /// when the timeout elapses; the caller is removed from the queue.
    pub fn acquire(&self, path: &Path) -> Result<PathLockGuard> {
        let key = normalize_path(path)?;
        let token = self.table.next_token.fetch_add(1, Ordering::Relaxed);

        self.wait_for_turn(&key, token)?;
        log::debug!("Acquired lock on {}", key.display());

        let marker = self.create_marker(&key);
        Ok(PathLockGuard {
            table: Arc::clone(&self.table),
            key,
            token,
            marker,
            released: false,
        })
    }

    fn wait_for_turn(&self, key: &Path, token: u64) -> Result<()> {
        let mut entries = self.table.entries();

        match entries.get_mut(key) {
            None => {
                entries.insert(key.to_path_buf(), LockEntry::held_by(token));
                return Ok(());
            }
            Some(entry) => entry.waiters.push_back(token),
        }
        log::debug!("Waiting for lock on {}", key.display());

        let enqueued_at = Instant::now();
        // Timeouts too large to represent wait without a deadline.
        let deadline = enqueued_at.checked_add(self.timeout);

        loop {
            match entries.get_mut(key) {
                Some(entry) => {
                    if entry.holder.is_none() && entry.waiters.front() == Some(&token) {
                        entry.waiters.pop_front();
                        entry.holder = Some(token);
                        entry.acquired_at = Instant::now();
                        return Ok(());
                    }
                }
                None => {
                    entries.insert(key.to_path_buf(), LockEntry::held_by(token));
                    return Ok(());
                }
            }

            let Some(deadline) = deadline else {
                entries = self
                    .table
                    .released
                    .wait(entries)
                    .unwrap_or_else(PoisonError::into_inner);
                continue;
            };

            let now = Instant::now();
            if now >= deadline {
                self.abandon_wait(&mut entries, key, token);
                log::warn!("Gave up waiting for lock on {}", key.display());
                return Err(TxError::LockTimeout {
                    path: key.to_path_buf(),
                    waited: now - enqueued_at,
                });
            }

            let (guard, _) = self
                .table
                .released
                .wait_timeout(entries, deadline - now)
                .unwrap_or_else(PoisonError::into_inner);
            entries = guard;
        }
    }

    fn abandon_wait(
        &self,
        entries: &mut HashMap<PathBuf, LockEntry>,
        key: &Path,
        token: u64,
    ) {
        let Some(entry) = entries.get_mut(key) else {
            return;
        };
        entry.waiters.retain(|t| *t != token);
        if entry.holder.is_none() {
            if entry.waiters.is_empty() {
                entries.remove(key);
            } else {
                self.table.released.notify_all();
            }
        }
    }

    fn create_marker(&self, key: &Path) -> Option<PathBuf> {
        let marker = marker_path(key)?;
        let context = format!("create lock marker {}", marker.display());

        let created = self.retry.run(&context, self.marker_attempts, || {
            OpenOptions::new()
                .write(true)
                .create_new(true)
                .open(&marker)
                .io_context("create lock marker", &marker)
        });

        match created {
            Ok(mut file) => {
                if let Err(e) = writeln!(file, "{}", std::process::id()) {
                    log::debug!("Could not record pid in {}: {}", marker.display(), e);
                }
                Some(marker)
            }
            Err(e) => {
                log::warn!(
                    "Advisory lock marker unavailable for {}: {}",
                    key.display(),
                    e
                );
                None
            }
        }
    }

    /// Returns true if some caller currently holds `path`.
    pub fn is_locked(&self, path: &Path) -> bool {
        let Ok(key) = normalize_path(path) else {
            return false;
        };
        self.table
            .entries()
            .get(&key)
            .is_some_and(|entry| entry.holder.is_some())
    }

    /// Number of callers queued behind the current holder of `path`.
    pub fn waiting(&self, path: &Path) -> usize {
        let Ok(key) = normalize_path(path) else {
            return 0;
        };
        self.table
            .entries()
            .get(&key)
            .map_or(0, |entry| entry.waiters.len())
    }
}

/// Exclusive hold on a path. Released on drop or via [`release`](Self::release).
#[must_use = "the lock is released as soon as the guard is dropped"]
#[derive(Debug)]
pub struct PathLockGuard {
    table: Arc<LockTable>,
    key: PathBuf,
    token: u64,
    marker: Option<PathBuf>,
    released: bool,
}

impl PathLockGuard {
    /// Normalized path this guard holds.
    pub fn path(&self) -> &Path {
        &self.key
    }

    /// Marker file created for this hold, if any.
    pub fn marker(&self) -> Option<&Path> {
        self.marker.as_deref()
    }

    pub fn release(mut self) {
        self.release_once();
    }

    fn release_once(&mut self) {
        if self.released {
            return;
        }
        self.released = true;

        if let Some(marker) = self.marker.take()
            && let Err(e) = fs::remove_file(&marker)
        {
            log::warn!("Failed to remove lock marker {}: {}", marker.display(), e);
        }

        let mut entries = self.table.entries();
        let vacant = match entries.get_mut(&self.key) {
            Some(entry) if entry.holder == Some(self.token) => {
                entry.holder = None;
                log::debug!(
                    "Released lock on {} after {:?}",
                    self.key.display(),
                    entry.acquired_at.elapsed()
                );
                entry.waiters.is_empty()
            }
            _ => false,
        };

        if vacant {
            entries.remove(&self.key);
        } else {
            self.table.released.notify_all();
        }
    }
}

impl Drop for PathLockGuard {
    fn drop(&mut self) {
        self.release_once();
    }
}

/// Absolute, lexically cleaned form of `path` used as the lock key.
///
/// The parent is canonicalized when it exists so that differently spelled
/// paths to the same file share a key.
pub fn normalize_path(path: &Path) -> Result<PathBuf> {
    let absolute = std::path::absolute(path).io_context("resolve", path)?;

    let mut clean = PathBuf::new();
    for component in absolute.components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => {
                clean.pop();
            }
            other => clean.push(other.as_os_str()),
        }
    }

    if let (Some(parent), Some(name)) = (clean.parent(), clean.file_name())
        && let Ok(canonical) = fs::canonicalize(parent)
    {
        return Ok(canonical.join(name));
    }
    Ok(clean)
}

fn marker_path(key: &Path) -> Option<PathBuf> {
    let name = key.file_name()?;
    let mut marker = name.to_os_string();
    marker.push(MARKER_SUFFIX);
    Some(key.with_file_name(marker))
}
