use crate::cli::EngineArgs;
use crate::error::Result;
use crate::plan::Plan;

use clap::Parser;
use colored::Colorize;
use std::path::{Path, PathBuf};

#[derive(Parser, Debug, Clone)]
pub struct ApplyArgs {
    /// Plan file listing `[[step]]` tables
    pub plan: PathBuf,
}

pub fn execute(args: ApplyArgs, engine: &EngineArgs) -> Result<()> {
    let plan = Plan::load(&args.plan)?;
    log::info!(
        "Applying {} step(s) from {}",
        plan.len(),
        args.plan.display()
    );

    let base = match args.plan.parent() {
        Some(dir) if !dir.as_os_str().is_empty() => dir.to_path_buf(),
        _ => super::working_dir()?,
    };

    let report = super::run_transaction(engine, &base, |txn| {
        plan.execute(txn).map(|_| ())
    })?;

    if !engine.dry_run {
        println!(
            "{} {} ({} file{}, {} backup{})",
            "✓ Applied".green().bold(),
            display_name(&args.plan).cyan(),
            report.files_processed,
            if report.files_processed == 1 { "" } else { "s" },
            report.backups,
            if report.backups == 1 { "" } else { "s" }
        );
    }

    Ok(())
}

fn display_name(path: &Path) -> String {
    path.file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_else(|| path.display().to_string())
}
