//! Ingest command implementation.

use super::{close_indexer, open_indexer};
use anyhow::{Context, Result};
use cwindex_types::RawEvent;
use std::fs;
use std::path::Path;

/// Read raw events, one JSON object per line. Blank lines are skipped.
pub fn read_events(path: &Path) -> Result<Vec<RawEvent>> {
    let contents =
        fs::read_to_string(path).with_context(|| format!("Failed to read {:?}", path))?;
    contents
        .lines()
        .enumerate()
        .filter(|(_, line)| !line.trim().is_empty())
        .map(|(index, line)| {
            serde_json::from_str(line)
                .with_context(|| format!("Invalid event on line {} of {:?}", index + 1, path))
        })
        .collect()
}

pub fn ingest_events(config_path: &Path, events_path: &Path, json: bool) -> Result<()> {
    let events = read_events(events_path)?;
    let indexer = open_indexer(config_path)?;

    let summary = indexer.ingest(&events).context("Ingestion failed")?;
    close_indexer(indexer)?;

    if json {
        println!("{}", serde_json::to_string_pretty(&summary)?);
    } else {
        println!("Ingested {} events from {:?}", events.len(), events_path);
        println!("  new events:          {}", summary.new_event_count);
        println!("  new transformations: {}", summary.new_transformation_count);
        println!(
            "  computations:        {} invalidated, {} destroyed, {} extended",
            summary.computations_invalidated,
            summary.computations_destroyed,
            summary.computations_extended
        );
        if let Some(height) = summary.latest_block_height {
            println!("  latest block:        {}", height);
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_read_events_skips_blank_lines() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("events.jsonl");
        fs::write(
            &path,
            concat!(
                r#"{"code_id":1,"contract_address":"dao1","block_height":1,"block_time_unix_ms":1000,"key":"99","value":1}"#,
                "\n\n",
                r#"{"code_id":1,"contract_address":"dao1","block_height":2,"block_time_unix_ms":2000,"key":"99","delete":true}"#,
                "\n",
            ),
        )
        .unwrap();

        let events = read_events(&path).unwrap();
        assert_eq!(events.len(), 2);
        assert!(events[1].delete);
        assert_eq!(events[1].value, None);
    }

    #[test]
    fn test_read_events_reports_line() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("events.jsonl");
        fs::write(&path, "\n{not json}\n").unwrap();

        let err = read_events(&path).unwrap_err();
        assert!(err.to_string().contains("line 2"));
    }
}
