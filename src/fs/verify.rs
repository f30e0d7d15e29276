//! Backup fidelity checks.
//!
//! A backup must match its original before the original is touched.
//! Files are compared by SHA-256 digest. Directories are compared by the set
//! of relative file paths and, in [`DirectoryCheck::Content`] mode, by each
//! file's digest as well.

use crate::error::{IoContext, Result, TxError};

use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::fs::{self, File};
use std::io;
use std::path::Path;

/// How thoroughly directory backups are compared.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, clap::ValueEnum)]
pub enum DirectoryCheck {
    /// Compare only the set of relative file paths.
    #[value(name = "paths")]
    PathsOnly,
    /// Compare relative paths and every file's digest.
    #[default]
    Content,
}

/// Digest of a file, or the digested listing of a directory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Fingerprint {
    File(String),
    /// Relative path (forward slashes) to digest. Digests are `None` in
    /// [`DirectoryCheck::PathsOnly`] mode.
    Directory(BTreeMap<String, Option<String>>),
}

/// Check run on a freshly taken backup before its original is mutated.
pub trait Verify {
    /// Fails with [`TxError::Integrity`] unless `backup` matches `original`.
    fn verify(&self, original: &Path, backup: &Path) -> Result<()>;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct BackupVerifier {
    check: DirectoryCheck,
}

impl BackupVerifier {
    pub fn new(check: DirectoryCheck) -> Self {
        Self { check }
    }

    pub fn check(&self) -> DirectoryCheck {
        self.check
    }

    pub fn fingerprint(&self, path: &Path) -> Result<Fingerprint> {
        let metadata = fs::metadata(path).io_context("read metadata of", path)?;
        if metadata.is_dir() {
            self.list_tree(path).map(Fingerprint::Directory)
        } else {
            digest_file(path).map(Fingerprint::File)
        }
    }

    /// Fails with [`TxError::Integrity`] unless `backup` matches `original`.
    pub fn verify(&self, original: &Path, backup: &Path) -> Result<()> {
        let expected = self.fingerprint(original)?;
        let actual = self.fingerprint(backup)?;

        let mismatch = match (&expected, &actual) {
            (Fingerprint::File(a), Fingerprint::File(b)) if a == b => None,
            (Fingerprint::File(a), Fingerprint::File(b)) => {
                Some(format!("digest {} does not match {}", b, a))
            }
            (Fingerprint::Directory(a), Fingerprint::Directory(b)) => first_difference(a, b),
            _ => Some("backup is not the same kind of entry as the original".to_string()),
        };

        match mismatch {
            None => {
                log::debug!(
                    "Verified backup {} of {}",
                    backup.display(),
                    original.display()
                );
                Ok(())
            }
            Some(detail) => Err(TxError::Integrity {
                original: original.to_path_buf(),
                backup: backup.to_path_buf(),
                detail,
            }),
        }
    }

    fn list_tree(&self, root: &Path) -> Result<BTreeMap<String, Option<String>>> {
        let walker = ignore::WalkBuilder::new(root)
            .standard_filters(false)
            .follow_links(false)
            .build();

        let mut listing = BTreeMap::new();
        for entry in walker {
            let entry = entry.map_err(|e| match e.into_io_error() {
                Some(io_err) => TxError::io("walk", root, io_err),
                None => TxError::Other(anyhow::anyhow!(
                    "Failed to walk {}",
                    root.display()
                )),
            })?;

            if entry.depth() == 0 || entry.file_type().is_some_and(|ft| ft.is_dir()) {
                continue;
            }

            let path = entry.path();
            let relative = path
                .strip_prefix(root)
                .map_err(|e| TxError::Other(e.into()))?
                .to_string_lossy()
                .replace('\\', "/");

            let digest = match self.check {
                DirectoryCheck::PathsOnly => None,
                DirectoryCheck::Content if entry.path_is_symlink() => {
                    let target = fs::read_link(path).io_context("read link", path)?;
                    Some(hex::encode(Sha256::digest(
                        target.to_string_lossy().as_bytes(),
                    )))
                }
                DirectoryCheck::Content => Some(digest_file(path)?),
            };
            listing.insert(relative, digest);
        }

        Ok(listing)
    }
}

impl Verify for BackupVerifier {
    fn verify(&self, original: &Path, backup: &Path) -> Result<()> {
        BackupVerifier::verify(self, original, backup)
    }
}

/// Streams `path` through SHA-256 and returns the hex digest.
pub fn digest_file(path: &Path) -> Result<String> {
    let mut file = File::open(path).io_context("open", path)?;
    let mut hasher = Sha256::new();
    io::copy(&mut file, &mut hasher).io_context("read", path)?;
    Ok(hex::encode(hasher.finalize()))
}

fn first_difference(
    expected: &BTreeMap<String, Option<String>>,
    actual: &BTreeMap<String, Option<String>>,
) -> Option<String> {
    for (path, digest) in expected {
        match actual.get(path) {
            None => return Some(format!("'{}' is missing from the backup", path)),
            Some(other) if other != digest => {
                return Some(format!("'{}' differs from the original", path));
            }
            Some(_) => {}
        }
    }

    actual
        .keys()
        .find(|path| !expected.contains_key(*path))
        .map(|path| format!("'{}' is not present in the original", path))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;
    use tempfile::TempDir;

    fn tree(root: &Path, files: &[(&str, &str)]) -> PathBuf {
        fs::create_dir_all(root).unwrap();
        for (rel, content) in files {
            let path = root.join(rel);
            fs::create_dir_all(path.parent().unwrap()).unwrap();
            fs::write(path, content).unwrap();
        }
        root.to_path_buf()
    }

    #[test]
    fn test_identical_files_verify() {
        let temp = TempDir::new().unwrap();
        let original = temp.path().join("a.txt");
        let backup = temp.path().join("b.txt");
        fs::write(&original, "same bytes").unwrap();
        fs::write(&backup, "same bytes").unwrap();

        BackupVerifier::default().verify(&original, &backup).unwrap();
    }

    #[test]
    fn test_single_byte_difference_fails() {
        let temp = TempDir::new().unwrap();
        let original = temp.path().join("a.txt");
        let backup = temp.path().join("b.txt");
        fs::write(&original, "content-1").unwrap();
        fs::write(&backup, "content-2").unwrap();

        let err = BackupVerifier::default()
            .verify(&original, &backup)
            .unwrap_err();
        assert!(matches!(err, TxError::Integrity { .. }));
        assert!(!err.is_transient());
    }

    #[test]
    fn test_digest_is_sha256_hex() {
        let temp = TempDir::new().unwrap();
        let file = temp.path().join("empty");
        fs::write(&file, "").unwrap();

        assert_eq!(
            digest_file(&file).unwrap(),
            "e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855"
        );
    }

    #[test]
    fn test_directory_with_same_paths_verifies() {
        let temp = TempDir::new().unwrap();
        let original = tree(&temp.path().join("orig"), &[("a", "1"), ("b/c", "2")]);
        let backup = tree(&temp.path().join("copy"), &[("a", "1"), ("b/c", "2")]);

        let verifier = BackupVerifier::new(DirectoryCheck::PathsOnly);
        verifier.verify(&original, &backup).unwrap();

        match verifier.fingerprint(&original).unwrap() {
            Fingerprint::Directory(listing) => {
                let keys: Vec<_> = listing.keys().cloned().collect();
                assert_eq!(keys, vec!["a".to_string(), "b/c".to_string()]);
            }
            other => panic!("expected directory fingerprint, got {other:?}"),
        }
    }

    #[test]
    fn test_directory_missing_entry_fails() {
        let temp = TempDir::new().unwrap();
        let original = tree(&temp.path().join("orig"), &[("a", "1"), ("b/c", "2")]);
        let backup = tree(&temp.path().join("copy"), &[("a", "1")]);

        for check in [DirectoryCheck::PathsOnly, DirectoryCheck::Content] {
            let err = BackupVerifier::new(check)
                .verify(&original, &backup)
                .unwrap_err();
            match err {
                TxError::Integrity { detail, .. } => assert!(detail.contains("b/c")),
                other => panic!("unexpected error: {other:?}"),
            }
        }
    }

    #[test]
    fn test_directory_extra_entry_fails() {
        let temp = TempDir::new().unwrap();
        let original = tree(&temp.path().join("orig"), &[("a", "1")]);
        let backup = tree(&temp.path().join("copy"), &[("a", "1"), ("stray", "x")]);

        let err = BackupVerifier::default()
            .verify(&original, &backup)
            .unwrap_err();
        assert!(err.to_string().contains("stray"));
    }

    #[test]
    fn test_content_mode_detects_changed_file() {
        let temp = TempDir::new().unwrap();
        let original = tree(&temp.path().join("orig"), &[("a", "1"), ("b/c", "2")]);
        let backup = tree(&temp.path().join("copy"), &[("a", "1"), ("b/c", "3")]);

        assert!(
            BackupVerifier::new(DirectoryCheck::PathsOnly)
                .verify(&original, &backup)
                .is_ok()
        );
        assert!(matches!(
            BackupVerifier::new(DirectoryCheck::Content).verify(&original, &backup),
            Err(TxError::Integrity { .. })
        ));
    }

    #[test]
    fn test_hidden_and_ignored_files_are_listed() {
        let temp = TempDir::new().unwrap();
        let original = tree(
            &temp.path().join("orig"),
            &[(".gitignore", "*.log\n"), ("debug.log", "x"), (".env", "y")],
        );
        let backup = tree(&temp.path().join("copy"), &[(".gitignore", "*.log\n")]);

        let err = BackupVerifier::default()
            .verify(&original, &backup)
            .unwrap_err();
        assert!(matches!(err, TxError::Integrity { .. }));
    }

    #[test]
    fn test_kind_mismatch_fails() {
        let temp = TempDir::new().unwrap();
        let original = tree(&temp.path().join("orig"), &[("a", "1")]);
        let backup = temp.path().join("flat");
        fs::write(&backup, "1").unwrap();

        assert!(matches!(
            BackupVerifier::default().verify(&original, &backup),
            Err(TxError::Integrity { .. })
        ));
    }

    #[test]
    fn test_missing_backup_is_not_found() {
        let temp = TempDir::new().unwrap();
        let original = temp.path().join("a.txt");
        fs::write(&original, "x").unwrap();

        assert!(matches!(
            BackupVerifier::default().verify(&original, &temp.path().join("nope")),
            Err(TxError::NotFound { .. })
        ));
    }
}
