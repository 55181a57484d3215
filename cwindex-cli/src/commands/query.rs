//! Query command implementation.

use super::{close_indexer, open_indexer, parse_args};
use anyhow::{Context, Result};
use std::path::Path;

pub fn query(
    config_path: &Path,
    formula: &str,
    target: &str,
    block: Option<u64>,
    args: &str,
    json: bool,
) -> Result<()> {
    let args = parse_args(args)?;
    let indexer = open_indexer(config_path)?;

    let evaluation = indexer
        .evaluate(formula, target, &args, block)
        .with_context(|| format!("Failed to evaluate {} for {}", formula, target))?;
    close_indexer(indexer)?;

    if json {
        println!("{}", serde_json::to_string_pretty(&evaluation)?);
        return Ok(());
    }

    println!("{}", serde_json::to_string_pretty(&evaluation.value)?);
    match evaluation.block {
        Some(block) => println!(
            "(block {} at {}{})",
            block.height,
            block.date().to_rfc3339(),
            if evaluation.cached { ", cached" } else { "" }
        ),
        None => println!("(no state read)"),
    }
    Ok(())
}
