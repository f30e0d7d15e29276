use crate::cli::EngineArgs;
use crate::error::{IoContext, Result};

use clap::Parser;
use std::fs;
use std::io::{self, Read};
use std::path::{Path, PathBuf};

#[derive(Parser, Debug, Clone)]
#[clap(verbatim_doc_comment)]
pub struct WriteArgs {
    /// File to replace (created if missing)
    pub path: PathBuf,

    /// Literal content to write
    ///
    /// Without --content or --from, content is read from stdin.
    #[arg(long, conflicts_with = "from")]
    pub content: Option<String>,

    /// Read the new content from this file
    #[arg(long, value_name = "FILE")]
    pub from: Option<PathBuf>,
}

impl WriteArgs {
    fn read_content(&self) -> Result<Vec<u8>> {
        if let Some(content) = &self.content {
            return Ok(content.clone().into_bytes());
        }
        if let Some(from) = &self.from {
            return fs::read(from).io_context("read", from);
        }

        let mut buffer = Vec::new();
        io::stdin()
            .read_to_end(&mut buffer)
            .io_context("read", Path::new("<stdin>"))?;
        Ok(buffer)
    }
}

pub fn execute(args: WriteArgs, engine: &EngineArgs) -> Result<()> {
    let content = args.read_content()?;
    log::debug!(
        "Writing {} bytes to {}",
        content.len(),
        args.path.display()
    );

    let base = super::working_dir()?;
    super::run_transaction(engine, &base, |txn| txn.write(&args.path, &content))?;
    Ok(())
}
