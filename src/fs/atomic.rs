//! Atomic write, copy, move and remove primitives.
//!
//! Every mutation is staged next to its target (`<name>.<random>.tmp` for
//! files, `<name>.<random>.tmpdir` for trees) and renamed into place while
//! the target's [`PathLockGuard`](super::PathLockGuard) is held. Observers
//! therefore see either the old content or the new content, never a mix.
//!
//! Where `rename` cannot replace the existing target (a directory, or a
//! platform that refuses to overwrite) the target is deleted first and the
//! rename retried. The target is briefly absent in that window.
//!
//! Staging artifacts are owned by `tempfile` guards and removed on every
//! exit path.

use crate::config::EngineConfig;
use crate::error::{IoContext, Result, TxError};
use crate::fs::lock::LockManager;
use crate::fs::retry::RetryPolicy;

use std::fs::{self, File, FileTimes, Metadata, Permissions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use tempfile::{NamedTempFile, TempDir};

/// Suffix of staged files.
pub const STAGING_FILE_SUFFIX: &str = ".tmp";
/// Suffix of staged directory trees.
pub const STAGING_DIR_SUFFIX: &str = ".tmpdir";

/// File mutation engine. Cheap to clone; clones share one lock table.
#[derive(Debug, Clone)]
pub struct AtomicFs {
    config: EngineConfig,
    locks: LockManager,
}

impl Default for AtomicFs {
    fn default() -> Self {
        Self::new(EngineConfig::default())
    }
}

impl AtomicFs {
    pub fn new(config: EngineConfig) -> Self {
        let locks = LockManager::from_config(&config);
        Self { config, locks }
    }

    /// Builds an engine around an existing lock manager.
    pub fn with_locks(config: EngineConfig, locks: LockManager) -> Self {
        Self { config, locks }
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn locks(&self) -> &LockManager {
        &self.locks
    }

    fn retry(&self) -> &RetryPolicy {
        &self.config.retry
    }

    /// Replaces `path` with `contents`.
    ///
    /// Missing parent directories are created. Existing permissions of
    /// `path` carry over to the new file.
    pub fn write(&self, path: &Path, contents: &[u8]) -> Result<()> {
        let context = format!("write {}", path.display());
        self.retry().run(&context, self.config.max_attempts, || {
            self.write_once(path, contents)
        })
    }

    fn write_once(&self, path: &Path, contents: &[u8]) -> Result<()> {
        self.ensure_dir(parent_dir(path))?;
        let _guard = self.locks.acquire(path)?;

        let existing = fs::metadata(path)
            .ok()
            .filter(|m| m.is_file())
            .map(|m| m.permissions());
        let mut staged = staging_file(path, existing)?;
        staged
            .write_all(contents)
            .io_context("write staging file for", path)?;
        staged
            .as_file()
            .sync_all()
            .io_context("sync staging file for", path)?;

        persist_file(staged, path)?;
        log::debug!("Wrote {} ({} bytes)", path.display(), contents.len());
        Ok(())
    }

    /// Replaces `dest` with a copy of `source` (file or directory tree).
    ///
    /// Returns the number of files copied.
    pub fn copy(&self, source: &Path, dest: &Path) -> Result<usize> {
        let context = format!("copy {} to {}", source.display(), dest.display());
        self.retry().run(&context, self.config.max_attempts, || {
            self.copy_once(source, dest)
        })
    }

    fn copy_once(&self, source: &Path, dest: &Path) -> Result<usize> {
        let metadata = fs::metadata(source).io_context("read metadata of", source)?;
        self.ensure_dir(parent_dir(dest))?;
        let _guard = self.locks.acquire(dest)?;
        let preserve = self.config.preserve_timestamps;

        if metadata.is_dir() {
            let staged = staging_dir(dest)?;
            let files = copy_tree(source, staged.path(), preserve)?;
            apply_metadata(&metadata, staged.path(), preserve)?;
            persist_dir(staged, dest)?;
            log::debug!(
                "Copied {} → {} ({} files)",
                source.display(),
                dest.display(),
                files
            );
            Ok(files)
        } else {
            let mut staged = staging_file(dest, Some(metadata.permissions()))?;
            let mut input = File::open(source).io_context("open", source)?;
            io::copy(&mut input, staged.as_file_mut()).io_context("copy", source)?;
            staged
                .as_file()
                .sync_all()
                .io_context("sync staging file for", dest)?;
            if preserve {
                set_times(&metadata, staged.as_file(), staged.path());
            }

            persist_file(staged, dest)?;
            log::debug!("Copied {} → {}", source.display(), dest.display());
            Ok(1)
        }
    }

    /// Moves `source` onto `dest`, replacing it.
    ///
    /// On a single device this is one locked rename. Across devices it
    /// degrades to [`copy`](Self::copy) followed by removal of `source`,
    /// during which both copies are briefly visible.
    pub fn move_path(&self, source: &Path, dest: &Path) -> Result<()> {
        fs::symlink_metadata(source).io_context("read metadata of", source)?;
        self.ensure_dir(parent_dir(dest))?;

        if is_same_device(source, dest)? {
            let context = format!("move {} to {}", source.display(), dest.display());
            self.retry().run(&context, self.config.max_attempts, || {
                self.rename_once(source, dest)
            })
        } else {
            log::debug!(
                "{} and {} are on different devices, copying",
                source.display(),
                dest.display()
            );
            self.copy(source, dest)?;
            let context = format!("remove {}", source.display());
            self.retry()
                .run(&context, self.config.max_attempts, || remove_path(source))
        }
    }

    fn rename_once(&self, source: &Path, dest: &Path) -> Result<()> {
        let _guard = self.locks.acquire(dest)?;

        match fs::rename(source, dest) {
            Ok(()) => {}
            Err(e) if path_exists(dest) && path_exists(source) => {
                log::debug!(
                    "Rename onto {} failed ({}), replacing target",
                    dest.display(),
                    e
                );
                remove_path(dest)?;
                fs::rename(source, dest).io_context("move", source)?;
            }
            Err(e) => return Err(TxError::io("move", source, e)),
        }

        log::debug!("Moved {} → {}", source.display(), dest.display());
        Ok(())
    }

    /// Recursively deletes `path` under its lock. A missing path is not an error.
    pub fn remove(&self, path: &Path) -> Result<()> {
        let context = format!("remove {}", path.display());
        self.retry().run(&context, self.config.max_attempts, || {
            if !path_exists(path) {
                return Ok(());
            }
            let _guard = self.locks.acquire(path)?;
            remove_path(path)
        })
    }

    fn ensure_dir(&self, dir: &Path) -> Result<()> {
        if dir.is_dir() {
            return Ok(());
        }
        let context = format!("create directory {}", dir.display());
        self.retry().run(&context, self.config.max_attempts, || {
            fs::create_dir_all(dir)
                .map_err(|e| blocked_by_file(dir, e))
                .io_context("create directory", dir)
        })
    }
}

/// Parent of `path`, or `.` for bare file names.
pub(crate) fn parent_dir(path: &Path) -> &Path {
    match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent,
        _ => Path::new("."),
    }
}

/// `create_dir_all` reports a regular file in the way as `AlreadyExists`.
fn blocked_by_file(dir: &Path, err: io::Error) -> io::Error {
    if err.kind() == io::ErrorKind::AlreadyExists && !dir.is_dir() {
        io::Error::new(io::ErrorKind::NotADirectory, err)
    } else {
        err
    }
}

/// True if something (including a dangling symlink) exists at `path`.
pub(crate) fn path_exists(path: &Path) -> bool {
    fs::symlink_metadata(path).is_ok()
}

/// Deletes a file, symlink or directory tree. Missing paths are ignored.
pub(crate) fn remove_path(path: &Path) -> Result<()> {
    let metadata = match fs::symlink_metadata(path) {
        Ok(metadata) => metadata,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(()),
        Err(e) => return Err(TxError::io("inspect", path, e)),
    };

    let result = if metadata.is_dir() {
        fs::remove_dir_all(path)
    } else {
        fs::remove_file(path)
    };

    match result {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(TxError::io("remove", path, e)),
    }
}

fn staging_prefix(target: &Path) -> String {
    let name = target
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| "txfs".to_string());
    format!("{}.", name)
}

fn staging_file(target: &Path, permissions: Option<Permissions>) -> Result<NamedTempFile> {
    let prefix = staging_prefix(target);
    let mut builder = tempfile::Builder::new();
    builder
        .prefix(&prefix)
        .suffix(STAGING_FILE_SUFFIX)
        .rand_bytes(8);

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        builder.permissions(permissions.unwrap_or_else(|| Permissions::from_mode(0o666)));
    }
    #[cfg(not(unix))]
    let _ = permissions;

    builder
        .tempfile_in(parent_dir(target))
        .io_context("create staging file for", target)
}

fn staging_dir(target: &Path) -> Result<TempDir> {
    let prefix = staging_prefix(target);
    tempfile::Builder::new()
        .prefix(&prefix)
        .suffix(STAGING_DIR_SUFFIX)
        .rand_bytes(8)
        .tempdir_in(parent_dir(target))
        .io_context("create staging directory for", target)
}

fn persist_file(staged: NamedTempFile, target: &Path) -> Result<()> {
    let err = match staged.persist(target) {
        Ok(_) => return Ok(()),
        Err(err) => err,
    };

    if !path_exists(target) {
        return Err(TxError::io("rename staging file onto", target, err.error));
    }

    log::debug!(
        "Rename onto {} failed ({}), replacing target",
        target.display(),
        err.error
    );
    remove_path(target)?;
    err.file
        .persist(target)
        .map(|_| ())
        .map_err(|e| TxError::io("rename staging file onto", target, e.error))
}

fn persist_dir(staged: TempDir, target: &Path) -> Result<()> {
    match fs::rename(staged.path(), target) {
        Ok(()) => {}
        Err(e) if path_exists(target) => {
            log::debug!(
                "Rename onto {} failed ({}), replacing target",
                target.display(),
                e
            );
            remove_path(target)?;
            fs::rename(staged.path(), target)
                .io_context("rename staging directory onto", target)?;
        }
        Err(e) => return Err(TxError::io("rename staging directory onto", target, e)),
    }

    // Renamed away; nothing left for the guard to clean up.
    let _ = staged.keep();
    Ok(())
}

/// Copies the contents of directory `from` into existing directory `to`.
fn copy_tree(from: &Path, to: &Path, preserve: bool) -> Result<usize> {
    let mut files = 0;

    for entry in fs::read_dir(from).io_context("read directory", from)? {
        let entry = entry.io_context("read directory", from)?;
        let file_type = entry.file_type().io_context("inspect", &entry.path())?;
        let from_path = entry.path();
        let to_path = to.join(entry.file_name());

        if file_type.is_dir() {
            fs::create_dir(&to_path).io_context("create directory", &to_path)?;
            files += copy_tree(&from_path, &to_path, preserve)?;
            let metadata = fs::metadata(&from_path).io_context("read metadata of", &from_path)?;
            apply_metadata(&metadata, &to_path, preserve)?;
        } else if file_type.is_symlink() {
            copy_symlink(&from_path, &to_path)?;
            files += 1;
        } else {
            fs::copy(&from_path, &to_path).io_context("copy", &from_path)?;
            if preserve {
                let metadata =
                    fs::metadata(&from_path).io_context("read metadata of", &from_path)?;
                if let Ok(file) = File::open(&to_path) {
                    set_times(&metadata, &file, &to_path);
                }
            }
            files += 1;
        }
    }

    Ok(files)
}

#[cfg(unix)]
fn copy_symlink(from: &Path, to: &Path) -> Result<()> {
    let target = fs::read_link(from).io_context("read link", from)?;
    std::os::unix::fs::symlink(&target, to).io_context("create link", to)
}

#[cfg(not(unix))]
fn copy_symlink(from: &Path, to: &Path) -> Result<()> {
    fs::copy(from, to).io_context("copy", from).map(|_| ())
}

/// Copies permissions (and optionally timestamps) of a directory.
fn apply_metadata(source: &Metadata, dir: &Path, preserve: bool) -> Result<()> {
    if preserve && let Ok(handle) = File::open(dir) {
        set_times(source, &handle, dir);
    }
    fs::set_permissions(dir, source.permissions()).io_context("set permissions of", dir)
}

fn set_times(source: &Metadata, file: &File, path: &Path) {
    let mut times = FileTimes::new();
    if let Ok(accessed) = source.accessed() {
        times = times.set_accessed(accessed);
    }
    if let Ok(modified) = source.modified() {
        times = times.set_modified(modified);
    }
    if let Err(e) = file.set_times(times) {
        log::debug!("Could not preserve timestamps on {}: {}", path.display(), e);
    }
}

/// Checks whether the parents of two paths live on the same device.
///
/// Determines whether `rename()` can move between them or a copy is needed.
fn is_same_device(source: &Path, dest: &Path) -> Result<bool> {
    #[cfg(unix)]
    {
        use std::os::unix::fs::MetadataExt;
        let source_parent = parent_dir(source);
        let dest_parent = parent_dir(dest);
        let a = fs::metadata(source_parent).io_context("read metadata of", source_parent)?;
        let b = fs::metadata(dest_parent).io_context("read metadata of", dest_parent)?;
        Ok(a.dev() == b.dev())
    }

    #[cfg(not(unix))]
    {
        let a = std::path::absolute(source).io_context("resolve", source)?;
        let b = std::path::absolute(dest).io_context("resolve", dest)?;
        Ok(a.components().next() == b.components().next())
    }
}

/// Ancestors of `path` that do not exist yet, deepest first.
pub(crate) fn missing_ancestors(path: &Path) -> Vec<PathBuf> {
    let mut missing = Vec::new();
    let mut current = path.parent();
    while let Some(dir) = current {
        if dir.as_os_str().is_empty() || path_exists(dir) {
            break;
        }
        missing.push(dir.to_path_buf());
        current = dir.parent();
    }
    missing
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fs::RetryPolicy;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::thread;
    use std::time::Duration;
    use tempfile::TempDir;

    fn engine() -> AtomicFs {
        AtomicFs::new(
            EngineConfig::default()
                .with_retry(RetryPolicy::immediate())
                .with_max_attempts(3)
                .with_lock_timeout(Duration::from_secs(10)),
        )
    }

    fn leftovers(dir: &Path) -> Vec<String> {
        fs::read_dir(dir)
            .unwrap()
            .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
            .filter(|name| {
                name.ends_with(STAGING_FILE_SUFFIX)
                    || name.ends_with(STAGING_DIR_SUFFIX)
                    || name.ends_with(".lock")
            })
            .collect()
    }

    #[test]
    fn test_write_then_read() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("out.txt");

        engine().write(&path, b"hello").unwrap();

        assert_eq!(fs::read(&path).unwrap(), b"hello");
        assert!(leftovers(temp.path()).is_empty());
    }

    #[test]
    fn test_write_replaces_existing_content() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("out.txt");
        fs::write(&path, "a much longer original content").unwrap();

        engine().write(&path, b"short").unwrap();

        assert_eq!(fs::read_to_string(&path).unwrap(), "short");
        assert!(leftovers(temp.path()).is_empty());
    }

    #[test]
    fn test_write_creates_parent_directories() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("a/b/c/out.txt");

        engine().write(&path, b"nested").unwrap();

        assert_eq!(fs::read_to_string(&path).unwrap(), "nested");
    }

    #[test]
    fn test_write_replaces_directory_target() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("was-a-dir");
        fs::create_dir(&path).unwrap();
        fs::write(path.join("inner.txt"), "x").unwrap();

        engine().write(&path, b"now a file").unwrap();

        assert!(path.is_file());
        assert_eq!(fs::read_to_string(&path).unwrap(), "now a file");
    }

    #[cfg(unix)]
    #[test]
    fn test_write_keeps_existing_permissions() {
        use std::os::unix::fs::PermissionsExt;

        let temp = TempDir::new().unwrap();
        let path = temp.path().join("script.sh");
        fs::write(&path, "#!/bin/sh\n").unwrap();
        fs::set_permissions(&path, Permissions::from_mode(0o750)).unwrap();

        engine().write(&path, b"#!/bin/sh\necho hi\n").unwrap();

        let mode = fs::metadata(&path).unwrap().permissions().mode() & 0o777;
        assert_eq!(mode, 0o750);
    }

    #[test]
    fn test_write_into_file_parent_fails_without_leftovers() {
        let temp = TempDir::new().unwrap();
        let blocker = temp.path().join("blocker");
        fs::write(&blocker, "file").unwrap();

        let result = engine().write(&blocker.join("child.txt"), b"x");

        assert!(result.is_err());
        assert!(leftovers(temp.path()).is_empty());
    }

    #[test]
    fn test_file_in_place_of_parent_is_not_retried() {
        let temp = TempDir::new().unwrap();
        let blocker = temp.path().join("blocker");
        fs::write(&blocker, "file").unwrap();

        let started = std::time::Instant::now();
        let err = AtomicFs::default()
            .write(&blocker.join("child.txt"), b"x")
            .unwrap_err();

        assert!(matches!(err, TxError::Permanent { .. }), "got {err:?}");
        // The default policy would sleep 100ms before a second attempt
        assert!(started.elapsed() < Duration::from_millis(100));
    }

    #[test]
    fn test_copy_file() {
        let temp = TempDir::new().unwrap();
        let source = temp.path().join("src.txt");
        let dest = temp.path().join("dest/copy.txt");
        fs::write(&source, "payload").unwrap();

        let files = engine().copy(&source, &dest).unwrap();

        assert_eq!(files, 1);
        assert_eq!(fs::read_to_string(&dest).unwrap(), "payload");
        assert_eq!(fs::read_to_string(&source).unwrap(), "payload");
    }

    #[test]
    fn test_copy_tree_replaces_existing_directory() {
        let temp = TempDir::new().unwrap();
        let source = temp.path().join("template");
        fs::create_dir_all(source.join("nested")).unwrap();
        fs::write(source.join("a.txt"), "a").unwrap();
        fs::write(source.join("nested/b.txt"), "b").unwrap();

        let dest = temp.path().join("project");
        fs::create_dir(&dest).unwrap();
        fs::write(dest.join("stale.txt"), "old").unwrap();

        let files = engine().copy(&source, &dest).unwrap();

        assert_eq!(files, 2);
        assert_eq!(fs::read_to_string(dest.join("a.txt")).unwrap(), "a");
        assert_eq!(fs::read_to_string(dest.join("nested/b.txt")).unwrap(), "b");
        assert!(!dest.join("stale.txt").exists());
        assert!(leftovers(temp.path()).is_empty());
    }

    #[test]
    fn test_copy_preserves_timestamps_when_asked() {
        let temp = TempDir::new().unwrap();
        let source = temp.path().join("old.txt");
        fs::write(&source, "x").unwrap();
        let past = std::time::SystemTime::UNIX_EPOCH + Duration::from_secs(1_000_000_000);
        File::options()
            .write(true)
            .open(&source)
            .unwrap()
            .set_modified(past)
            .unwrap();

        let fs_ops = AtomicFs::new(
            EngineConfig::default()
                .with_retry(RetryPolicy::immediate())
                .with_preserve_timestamps(true),
        );
        let dest = temp.path().join("copy.txt");
        fs_ops.copy(&source, &dest).unwrap();

        assert_eq!(fs::metadata(&dest).unwrap().modified().unwrap(), past);
    }

    #[test]
    fn test_copy_missing_source_is_not_found() {
        let temp = TempDir::new().unwrap();

        let err = engine()
            .copy(&temp.path().join("missing"), &temp.path().join("dest"))
            .unwrap_err();

        assert!(matches!(err, TxError::NotFound { .. }));
        assert!(!temp.path().join("dest").exists());
    }

    #[test]
    fn test_move_file_replaces_target() {
        let temp = TempDir::new().unwrap();
        let source = temp.path().join("from.txt");
        let dest = temp.path().join("to.txt");
        fs::write(&source, "moved").unwrap();
        fs::write(&dest, "old").unwrap();

        engine().move_path(&source, &dest).unwrap();

        assert!(!source.exists());
        assert_eq!(fs::read_to_string(&dest).unwrap(), "moved");
    }

    #[test]
    fn test_move_directory_over_existing_directory() {
        let temp = TempDir::new().unwrap();
        let source = temp.path().join("backup");
        fs::create_dir(&source).unwrap();
        fs::write(source.join("keep.txt"), "restored").unwrap();

        let dest = temp.path().join("live");
        fs::create_dir(&dest).unwrap();
        fs::write(dest.join("new.txt"), "added").unwrap();

        engine().move_path(&source, &dest).unwrap();

        assert!(!source.exists());
        assert_eq!(fs::read_to_string(dest.join("keep.txt")).unwrap(), "restored");
        assert!(!dest.join("new.txt").exists());
    }

    #[test]
    fn test_remove_missing_path_is_ok() {
        let temp = TempDir::new().unwrap();
        engine().remove(&temp.path().join("never-existed")).unwrap();
    }

    #[test]
    fn test_missing_ancestors_deepest_first() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("x/y/file.txt");

        let missing = missing_ancestors(&path);

        assert_eq!(missing, vec![temp.path().join("x/y"), temp.path().join("x")]);
    }

    #[test]
    fn test_concurrent_writes_never_expose_partial_content() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("same.txt");
        let xs = vec![b'X'; 256 * 1024];
        let ys = vec![b'Y'; 256 * 1024];
        fs::write(&path, &xs).unwrap();

        let fs_ops = engine();
        let done = AtomicBool::new(false);

        thread::scope(|s| {
            let reader = s.spawn(|| {
                while !done.load(Ordering::SeqCst) {
                    match fs::read(&path) {
                        Ok(data) => assert!(data == xs || data == ys, "observed torn write"),
                        Err(e) => assert_eq!(e.kind(), io::ErrorKind::NotFound),
                    }
                }
            });
            let x = s.spawn(|| {
                for _ in 0..10 {
                    fs_ops.write(&path, &xs).unwrap();
                }
            });
            let y = s.spawn(|| {
                for _ in 0..10 {
                    fs_ops.write(&path, &ys).unwrap();
                }
            });

            x.join().unwrap();
            y.join().unwrap();
            done.store(true, Ordering::SeqCst);
            reader.join().unwrap();
        });

        let last = fs::read(&path).unwrap();
        assert!(last == xs || last == ys);
        assert!(leftovers(temp.path()).is_empty());
    }
}
