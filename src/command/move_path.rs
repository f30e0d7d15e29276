use crate::cli::EngineArgs;
use crate::error::{Result, TxError};
use crate::fs::AtomicFs;

use clap::Parser;
use colored::Colorize;
use std::path::PathBuf;

#[derive(Parser, Debug, Clone)]
#[clap(verbatim_doc_comment)]
pub struct MoveArgs {
    /// File or directory to move
    pub source: PathBuf,

    /// Destination, replaced as a whole if it exists
    ///
    /// On the same device this is a single rename. Across devices the
    /// source is copied and then removed.
    pub dest: PathBuf,
}

pub fn execute(args: MoveArgs, engine: &EngineArgs) -> Result<()> {
    if !args.source.exists() {
        return Err(TxError::NotFound { path: args.source });
    }

    if engine.dry_run {
        println!("\n{}", "DRY RUN - No changes will be made".yellow().bold());
        println!(
            "   • {} → {}",
            args.source.display(),
            args.dest.display()
        );
        return Ok(());
    }

    let fs = AtomicFs::new(engine.config());
    fs.move_path(&args.source, &args.dest)?;

    println!(
        "{} {} → {}",
        "✓ Moved".green().bold(),
        args.source.display().to_string().yellow(),
        args.dest.display().to_string().green().bold()
    );
    Ok(())
}
