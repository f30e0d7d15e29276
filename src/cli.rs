use crate::command::Command;
use crate::config::{BackupLocation, DEFAULT_MAX_ATTEMPTS, EngineConfig};
use crate::fs::DirectoryCheck;

use clap::{ArgAction, Args, Parser};
use std::path::PathBuf;
use std::time::Duration;

#[derive(Parser, Debug)]
#[command(
    name = "txfs",
    version,
    about = "All-or-nothing file mutations with verified backups and rollback"
)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,

    #[command(flatten)]
    pub engine: EngineArgs,

    /// Increase log verbosity (-v info, -vv debug, -vvv trace)
    #[arg(short, long, action = ArgAction::Count, global = true)]
    pub verbose: u8,
}

/// Flags shared by every subcommand.
#[derive(Args, Debug, Clone)]
pub struct EngineArgs {
    /// Attempts per write, copy or move before giving up on transient errors
    #[arg(long, value_name = "N", default_value_t = DEFAULT_MAX_ATTEMPTS, global = true)]
    pub max_attempts: u32,

    /// Seconds to wait for another operation on the same path
    #[arg(long, value_name = "SECS", default_value_t = 30, global = true)]
    pub lock_timeout: u64,

    /// How directory backups are verified
    #[arg(long, value_enum, default_value_t = DirectoryCheck::Content, global = true)]
    pub verify: DirectoryCheck,

    /// Store backups in this directory instead of a fresh temp directory
    #[arg(long, value_name = "DIR", global = true)]
    pub backup_dir: Option<PathBuf>,

    /// Keep backups after a successful run
    #[arg(long, global = true)]
    pub keep_backup: bool,

    /// Carry modification times over when copying
    #[arg(long, global = true)]
    pub preserve_timestamps: bool,

    /// Show what would change without applying any modifications
    #[arg(long, short = 'n', global = true)]
    pub dry_run: bool,
}

impl EngineArgs {
    pub fn config(&self) -> EngineConfig {
        EngineConfig::default()
            .with_max_attempts(self.max_attempts)
            .with_lock_timeout(Duration::from_secs(self.lock_timeout))
            .with_directory_check(self.verify)
            .with_preserve_timestamps(self.preserve_timestamps)
            .with_keep_backups(self.keep_backup)
    }

    pub fn backup_location(&self) -> BackupLocation {
        match &self.backup_dir {
            Some(dir) => BackupLocation::Shared(dir.clone()),
            None => BackupLocation::Temp,
        }
    }
}
