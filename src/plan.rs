//! Plan files: a batch of steps applied as one transaction.
//!
//! ```toml
//! [[step]]
//! kind = "write"
//! path = "config/app.toml"
//! content = "debug = false\n"
//!
//! [[step]]
//! kind = "copy"
//! source = "templates/ci"
//! path = ".github/workflows"
//! ```
//!
//! Relative paths resolve against the directory containing the plan.

use crate::error::{IoContext, Result, TxError};
use crate::fs::Transaction;

use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use toml_edit::{DocumentMut, Item, Table};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Step {
    Write { path: PathBuf, content: String },
    Copy { source: PathBuf, path: PathBuf },
}

impl fmt::Display for Step {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Step::Write { path, .. } => write!(f, "write {}", path.display()),
            Step::Copy { source, path } => {
                write!(f, "copy {} → {}", source.display(), path.display())
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Plan {
    steps: Vec<Step>,
}

impl Plan {
    /// Reads and parses the plan at `path`.
    pub fn load(path: &Path) -> Result<Self> {
        let text = fs::read_to_string(path).io_context("read plan", path)?;
        let base_dir = path.parent().unwrap_or_else(|| Path::new(""));
        Self::parse(&text, base_dir)
    }

    pub fn parse(text: &str, base_dir: &Path) -> Result<Self> {
        let doc: DocumentMut = text.parse()?;

        let tables = match doc.get("step") {
            Some(item) => item.as_array_of_tables().ok_or_else(|| {
                TxError::Plan("'step' must be an array of tables ([[step]])".to_string())
            })?,
            None => return Err(TxError::Plan("no [[step]] entries".to_string())),
        };

        let steps = tables
            .iter()
            .enumerate()
            .map(|(i, table)| parse_step(i + 1, table, base_dir))
            .collect::<Result<Vec<_>>>()?;

        if steps.is_empty() {
            return Err(TxError::Plan("no [[step]] entries".to_string()));
        }

        log::debug!("Parsed plan with {} step(s)", steps.len());
        Ok(Self { steps })
    }

    pub fn steps(&self) -> &[Step] {
        &self.steps
    }

    pub fn len(&self) -> usize {
        self.steps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }

    /// Runs every step inside `txn`, stopping at the first failure.
    ///
    /// A failing step has already rolled `txn` back when this returns.
    pub fn execute(&self, txn: &mut Transaction<'_>) -> Result<usize> {
        let total = self.steps.len();

        for (i, step) in self.steps.iter().enumerate() {
            log::info!("Step {}/{}: {}", i + 1, total, step);
            match step {
                Step::Write { path, content } => txn.write(path, content)?,
                Step::Copy { source, path } => txn.copy(source, path)?,
            }
        }

        Ok(total)
    }
}

fn string_field<'t>(table: &'t Table, number: usize, key: &str) -> Result<&'t str> {
    table.get(key).and_then(Item::as_str).ok_or_else(|| {
        TxError::Plan(format!("step {}: missing string field '{}'", number, key))
    })
}

fn parse_step(number: usize, table: &Table, base_dir: &Path) -> Result<Step> {
    let field = |key: &str| string_field(table, number, key);

    let (step, allowed): (Step, &[&str]) = match field("kind")? {
        "write" => (
            Step::Write {
                path: base_dir.join(field("path")?),
                content: field("content")?.to_string(),
            },
            &["kind", "path", "content"][..],
        ),
        "copy" => (
            Step::Copy {
                source: base_dir.join(field("source")?),
                path: base_dir.join(field("path")?),
            },
            &["kind", "path", "source"][..],
        ),
        other => {
            return Err(TxError::Plan(format!(
                "step {}: unknown kind '{}' (expected \"write\" or \"copy\")",
                number, other
            )));
        }
    };

    if let Some((key, _)) = table.iter().find(|(key, _)| !allowed.contains(key)) {
        return Err(TxError::Plan(format!(
            "step {}: unexpected field '{}'",
            number, key
        )));
    }

    Ok(step)
}
