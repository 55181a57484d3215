//! Range command implementation.

use super::{close_indexer, open_indexer, parse_args};
use anyhow::{Context, Result};
use std::path::Path;

#[derive(Debug, Clone, Copy)]
pub struct RangeOptions {
    pub start: u64,
    pub end: u64,
    pub step: Option<u64>,
    pub json: bool,
}

pub fn range(
    config_path: &Path,
    formula: &str,
    target: &str,
    args: &str,
    opts: RangeOptions,
) -> Result<()> {
    let args = parse_args(args)?;
    let indexer = open_indexer(config_path)?;

    let entries = indexer
        .evaluate_range(formula, target, &args, opts.start, opts.end, opts.step)
        .with_context(|| {
            format!(
                "Failed to evaluate {} for {} over {}..={}",
                formula, target, opts.start, opts.end
            )
        })?;
    close_indexer(indexer)?;

    if opts.json {
        println!("{}", serde_json::to_string_pretty(&entries)?);
        return Ok(());
    }

    if entries.is_empty() {
        println!("No values in range");
    }
    for entry in &entries {
        let height = entry
            .at
            .or(entry.block_height)
            .map_or_else(|| "-".to_string(), |h| h.to_string());
        println!("{:>10}  {}", height, serde_json::to_string(&entry.value)?);
    }
    Ok(())
}
