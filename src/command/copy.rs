use crate::cli::EngineArgs;
use crate::error::Result;

use clap::Parser;
use std::path::PathBuf;

#[derive(Parser, Debug, Clone)]
pub struct CopyArgs {
    /// File or directory to copy
    pub source: PathBuf,

    /// Destination, replaced as a whole if it exists
    pub dest: PathBuf,
}

pub fn execute(args: CopyArgs, engine: &EngineArgs) -> Result<()> {
    let base = super::working_dir()?;
    super::run_transaction(engine, &base, |txn| txn.copy(&args.source, &args.dest))?;
    Ok(())
}
