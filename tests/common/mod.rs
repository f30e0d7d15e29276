//! Shared helpers for txfs integration tests.
//!
//! Each test builds a small project in a temp directory and drives the
//! binary through the command-line interface.

use assert_cmd::Command;
use assert_cmd::cargo::cargo_bin_cmd;
use std::fs;
use std::path::Path;
use tempfile::TempDir;

/// Creates a project with a config file, a source tree and a template tree.
#[allow(unused)]
pub fn create_project() -> TempDir {
    let temp = TempDir::new().unwrap();
    let root = temp.path();

    fs::write(root.join("config.toml"), "debug = true\n").unwrap();

    fs::create_dir_all(root.join("src/nested")).unwrap();
    fs::write(root.join("src/lib.rs"), "pub fn old() {}\n").unwrap();
    fs::write(root.join("src/nested/mod.rs"), "// nested\n").unwrap();

    fs::create_dir_all(root.join("template/bin")).unwrap();
    fs::write(root.join("template/lib.rs"), "pub fn new() {}\n").unwrap();
    fs::write(root.join("template/bin/main.rs"), "fn main() {}\n").unwrap();

    temp
}

/// Names of entries in `dir` that look like leftover staging or lock files.
#[allow(unused)]
pub fn leftovers(dir: &Path) -> Vec<String> {
    fs::read_dir(dir)
        .unwrap()
        .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
        .filter(|name| {
            name.ends_with(".tmp") || name.ends_with(".tmpdir") || name.ends_with(".lock")
        })
        .collect()
}

/// Builds a txfs command running in `root` with backups under `root/.backups`.
pub fn txfs_cmd(root: &Path, args: &[&str]) -> Command {
    let mut cmd = cargo_bin_cmd!("txfs");
    cmd.args(args)
        .arg("--backup-dir")
        .arg(root.join(".backups"))
        .arg("--max-attempts")
        .arg("2")
        .current_dir(root);
    cmd
}

/// Helper to run txfs and return the assertion handle.
#[allow(unused)]
pub fn run_txfs(root: &Path, args: &[&str]) -> assert_cmd::assert::Assert {
    txfs_cmd(root, args).assert()
}
