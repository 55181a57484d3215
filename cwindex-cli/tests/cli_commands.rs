use assert_cmd::Command;
use predicates::prelude::*;
use serde_json::Value;
use std::fs;
use std::path::Path;
use tempfile::tempdir;

// "count" in the textual key form
const COUNT_KEY: &str = "99,111,117,110,116";

fn write_project(root: &Path) -> Result<(), Box<dyn std::error::Error>> {
    fs::write(
        root.join("cwindex.yml"),
        r#"
chain_id: test-1
data_dir: state
code_ids:
  counter: [7]
"#,
    )?;

    let events: Vec<String> = [(10, 1), (20, 2), (35, 3)]
        .iter()
        .map(|(height, value)| {
            serde_json::json!({
                "code_id": 7,
                "contract_address": "counter1",
                "block_height": height,
                "block_time_unix_ms": height * 1_000,
                "key": COUNT_KEY,
                "value": value,
            })
            .to_string()
        })
        .collect();
    fs::write(root.join("events.jsonl"), events.join("\n"))?;
    Ok(())
}

#[allow(deprecated)]
fn cwindex(root: &Path) -> Result<Command, Box<dyn std::error::Error>> {
    let mut cmd = Command::cargo_bin("cwindex")?;
    cmd.current_dir(root);
    Ok(cmd)
}

#[test]
fn ingest_then_query_json() -> Result<(), Box<dyn std::error::Error>> {
    let dir = tempdir()?;
    write_project(dir.path())?;

    let ingest = cwindex(dir.path())?
        .args(["ingest", "events.jsonl", "--json"])
        .assert()
        .success();
    let summary: Value = serde_json::from_slice(&ingest.get_output().stdout)?;
    assert_eq!(summary["new_event_count"], 3);
    assert_eq!(summary["latest_block_height"], 35);
    assert!(dir.path().join("state").join("state.json").exists());

    let query = cwindex(dir.path())?
        .args([
            "query",
            "item",
            "counter1",
            "--block",
            "25",
            "--args",
            r#"{"key": ["count"]}"#,
            "--json",
        ])
        .assert()
        .success();
    let evaluation: Value = serde_json::from_slice(&query.get_output().stdout)?;
    assert_eq!(evaluation["value"], 2);
    assert_eq!(evaluation["block"]["height"], 20);
    assert_eq!(evaluation["cached"], false);

    // The computation was persisted by the previous run
    let again = cwindex(dir.path())?
        .args([
            "query",
            "item",
            "counter1",
            "--block",
            "30",
            "--args",
            r#"{"key": ["count"]}"#,
            "--json",
        ])
        .assert()
        .success();
    let evaluation: Value = serde_json::from_slice(&again.get_output().stdout)?;
    assert_eq!(evaluation["cached"], true);

    Ok(())
}

#[test]
fn range_lists_changes() -> Result<(), Box<dyn std::error::Error>> {
    let dir = tempdir()?;
    write_project(dir.path())?;
    cwindex(dir.path())?
        .args(["ingest", "events.jsonl"])
        .assert()
        .success();

    let range = cwindex(dir.path())?
        .args([
            "range",
            "item",
            "counter1",
            "--start",
            "10",
            "--end",
            "100",
            "--args",
            r#"{"key": ["count"]}"#,
            "--json",
        ])
        .assert()
        .success();
    let entries: Value = serde_json::from_slice(&range.get_output().stdout)?;
    let heights: Vec<_> = entries
        .as_array()
        .ok_or("expected array")?
        .iter()
        .map(|e| e["block_height"].as_u64())
        .collect();
    assert_eq!(heights, vec![Some(10), Some(20), Some(35)]);

    cwindex(dir.path())?
        .args([
            "range",
            "item",
            "counter1",
            "--start",
            "10",
            "--end",
            "30",
            "--step",
            "10",
            "--args",
            r#"{"key": ["count"]}"#,
        ])
        .assert()
        .success()
        .stdout(predicate::str::contains("30  2"));

    Ok(())
}

#[test]
fn status_reports_counts() -> Result<(), Box<dyn std::error::Error>> {
    let dir = tempdir()?;
    write_project(dir.path())?;

    cwindex(dir.path())?
        .arg("status")
        .assert()
        .success()
        .stdout(predicate::str::contains("Latest block: none"));

    cwindex(dir.path())?
        .args(["ingest", "events.jsonl"])
        .assert()
        .success()
        .stdout(predicate::str::contains("new events:          3"));

    cwindex(dir.path())?
        .arg("status")
        .assert()
        .success()
        .stdout(predicate::str::contains("Chain: test-1"))
        .stdout(predicate::str::contains("Events: 3"));

    Ok(())
}

#[test]
fn query_errors_are_reported() -> Result<(), Box<dyn std::error::Error>> {
    let dir = tempdir()?;
    write_project(dir.path())?;
    cwindex(dir.path())?
        .args(["ingest", "events.jsonl"])
        .assert()
        .success();

    cwindex(dir.path())?
        .args(["query", "no_such_formula", "counter1"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("Unknown formula: no_such_formula"));

    cwindex(dir.path())?
        .args(["query", "item", "counter1", "--args", "[1]"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("--args must be a JSON object"));

    Ok(())
}

#[test]
fn missing_config_fails() -> Result<(), Box<dyn std::error::Error>> {
    let dir = tempdir()?;
    cwindex(dir.path())?
        .arg("status")
        .assert()
        .failure()
        .stderr(predicate::str::contains("Failed to load config"));
    Ok(())
}

#[test]
fn init_writes_config() -> Result<(), Box<dyn std::error::Error>> {
    let dir = tempdir()?;
    cwindex(dir.path())?
        .args(["init", "project"])
        .assert()
        .success();
    assert!(dir.path().join("project").join("cwindex.yml").exists());
    Ok(())
}
