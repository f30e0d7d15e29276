pub mod apply;
pub mod copy;
pub mod move_path;
pub mod write;

use crate::cli::EngineArgs;
use crate::error::{IoContext, Result};
use crate::fs::{AtomicFs, Transaction, TransactionReport};

use clap::Subcommand;
use colored::Colorize;
use std::path::{Path, PathBuf};

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Atomically replace a file's content
    Write(write::WriteArgs),
    /// Copy a file or directory tree onto a destination, with backup
    Copy(copy::CopyArgs),
    /// Move a file or directory onto a destination
    Move(move_path::MoveArgs),
    /// Apply a TOML plan of write and copy steps as one transaction
    Apply(apply::ApplyArgs),
}

pub fn execute(command: Command, engine: &EngineArgs) -> Result<()> {
    match command {
        Command::Write(args) => write::execute(args, engine),
        Command::Copy(args) => copy::execute(args, engine),
        Command::Move(args) => move_path::execute(args, engine),
        Command::Apply(args) => apply::execute(args, engine),
    }
}

/// Base directory for summary paths when the command names none.
pub(crate) fn working_dir() -> Result<PathBuf> {
    std::env::current_dir().io_context("resolve working directory", Path::new("."))
}

/// Runs `steps` in a fresh transaction, then commits and prints a summary.
///
/// A failing step has already rolled the transaction back; the error is
/// returned for the caller to report.
pub(crate) fn run_transaction<F>(
    engine: &EngineArgs,
    base: &Path,
    steps: F,
) -> Result<TransactionReport>
where
    F: FnOnce(&mut Transaction<'_>) -> Result<()>,
{
    let fs = AtomicFs::new(engine.config());
    let mut txn = Transaction::begin(&fs, &engine.backup_location(), engine.dry_run)?;

    if let Err(e) = steps(&mut txn) {
        if txn.is_rolled_back() && !engine.dry_run {
            eprintln!(
                "{}",
                "Operation failed, all changes were rolled back.".yellow().bold()
            );
        }
        return Err(e);
    }

    let report = txn.commit()?;
    txn.print_summary(base);

    if report.backups_retained
        && let Some(dir) = &report.backup_dir
    {
        println!("{} {}", "Backups kept at".dimmed(), dir.display());
    }

    Ok(report)
}
