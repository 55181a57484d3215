//! CLI command implementations.

pub mod ingest;
pub mod init;
pub mod query;
pub mod range;
pub mod status;

pub use ingest::ingest_events;
pub use init::init_project;
pub use query::query;
pub use range::{range, RangeOptions};
pub use status::status;

use anyhow::{Context, Result};
use cwindex_core::{Config, Indexer};
use serde_json::Value;
use std::path::Path;

/// Open the indexer described by the config file.
pub(crate) fn open_indexer(config_path: &Path) -> Result<Indexer> {
    let config = Config::from_file(config_path)
        .with_context(|| format!("Failed to load config from {:?}", config_path))?;
    Indexer::open(config).context("Failed to open indexer")
}

/// Persist indexer state after a successful command.
pub(crate) fn close_indexer(indexer: Indexer) -> Result<()> {
    indexer.close().context("Failed to write snapshot")?;
    Ok(())
}

pub(crate) fn parse_args(args: &str) -> Result<Value> {
    let value: Value =
        serde_json::from_str(args).with_context(|| format!("Invalid --args JSON: {}", args))?;
    if !value.is_object() && !value.is_null() {
        anyhow::bail!("--args must be a JSON object, got {}", value);
    }
    Ok(value)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_args() {
        assert_eq!(
            parse_args(r#"{"key": ["count"]}"#).unwrap(),
            serde_json::json!({"key": ["count"]})
        );
        assert!(parse_args("[1, 2]").is_err());
        assert!(parse_args("{oops").is_err());
    }
}
