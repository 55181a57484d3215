//! Status command implementation.

use super::{close_indexer, open_indexer};
use anyhow::Result;
use std::path::Path;

pub fn status(config_path: &Path, json: bool) -> Result<()> {
    let indexer = open_indexer(config_path)?;
    let status = indexer.status()?;
    close_indexer(indexer)?;

    if json {
        println!("{}", serde_json::to_string_pretty(&status)?);
        return Ok(());
    }

    println!("Chain: {}", status.chain_id);
    match status.latest_block {
        Some(block) => println!(
            "Latest block: {} ({})",
            block.height,
            block.date().to_rfc3339()
        ),
        None => println!("Latest block: none"),
    }
    println!("Events: {}", status.events);
    println!("Transformations: {}", status.transformations);
    println!("Computations: {}", status.computations);
    Ok(())
}
