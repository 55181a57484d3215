//! Shared types for cwindex
//!
//! This crate provides the records exchanged between ingestion, the caching
//! engine and the query layer: blocks, contracts, raw contract-state events
//! and the transformations derived from them.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;

mod expiration;

pub use expiration::{Duration, Expiration};

/// A chain block, identified by height
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Block {
    pub height: u64,
    pub time_unix_ms: u64,
}

impl Block {
    pub fn new(height: u64, time_unix_ms: u64) -> Self {
        Self {
            height,
            time_unix_ms,
        }
    }

    /// Block time as a UTC timestamp
    pub fn date(&self) -> DateTime<Utc> {
        i64::try_from(self.time_unix_ms)
            .ok()
            .and_then(DateTime::from_timestamp_millis)
            .unwrap_or_default()
    }
}

/// A deployed contract instance
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Contract {
    pub address: String,
    pub code_id: u64,
}

/// One write (or delete) of a contract storage key at a block height.
///
/// `key` is the textual key encoding produced by the key codec. Delete events
/// carry no value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    pub contract_address: String,
    pub block_height: u64,
    pub block_time_unix_ms: u64,
    pub key: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<Value>,
    #[serde(default)]
    pub delete: bool,
}

impl Event {
    pub fn block(&self) -> Block {
        Block::new(self.block_height, self.block_time_unix_ms)
    }
}

/// A named derived value for a contract at a block height.
///
/// `Value::Null` records that the name was cleared at this height.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Transformation {
    pub contract_address: String,
    pub block_height: u64,
    pub block_time_unix_ms: u64,
    pub name: String,
    pub value: Value,
}

impl Transformation {
    pub fn block(&self) -> Block {
        Block::new(self.block_height, self.block_time_unix_ms)
    }
}

/// An event as it arrives from the chain exporter, before it is split into
/// contract, block and event rows.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RawEvent {
    pub code_id: u64,
    pub contract_address: String,
    pub block_height: u64,
    pub block_time_unix_ms: u64,
    pub key: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<Value>,
    #[serde(default)]
    pub delete: bool,
}

impl RawEvent {
    pub fn block(&self) -> Block {
        Block::new(self.block_height, self.block_time_unix_ms)
    }

    pub fn contract(&self) -> Contract {
        Contract {
            address: self.contract_address.clone(),
            code_id: self.code_id,
        }
    }

    pub fn to_event(&self) -> Event {
        Event {
            contract_address: self.contract_address.clone(),
            block_height: self.block_height,
            block_time_unix_ms: self.block_time_unix_ms,
            key: self.key.clone(),
            value: if self.delete { None } else { self.value.clone() },
            delete: self.delete,
        }
    }
}

/// Named groups of code ids, e.g. `dao-core: [1, 4]`.
///
/// Transformers and formulas refer to contract kinds by these names rather
/// than by raw code ids.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CodeIdSets(BTreeMap<String, Vec<u64>>);

impl CodeIdSets {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, name: impl Into<String>, code_ids: Vec<u64>) {
        self.0.insert(name.into(), code_ids);
    }

    /// All code ids listed under any of the given names. Unknown names are
    /// ignored.
    pub fn resolve<S: AsRef<str>>(&self, names: &[S]) -> Vec<u64> {
        let mut ids: Vec<u64> = names
            .iter()
            .filter_map(|name| self.0.get(name.as_ref()))
            .flatten()
            .copied()
            .collect();
        ids.sort_unstable();
        ids.dedup();
        ids
    }

    pub fn contains<S: AsRef<str>>(&self, names: &[S], code_id: u64) -> bool {
        names
            .iter()
            .filter_map(|name| self.0.get(name.as_ref()))
            .any(|ids| ids.contains(&code_id))
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.0.keys().map(String::as_str)
    }
}

impl FromIterator<(String, Vec<u64>)> for CodeIdSets {
    fn from_iter<T: IntoIterator<Item = (String, Vec<u64>)>>(iter: T) -> Self {
        Self(iter.into_iter().collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_block_date() {
        let block = Block::new(10, 1_700_000_000_000);
        assert_eq!(block.date().timestamp_millis(), 1_700_000_000_000);
    }

    #[test]
    fn test_delete_drops_value() {
        let raw = RawEvent {
            code_id: 1,
            contract_address: "juno1dao".to_string(),
            block_height: 5,
            block_time_unix_ms: 5_000,
            key: "99,111".to_string(),
            value: Some(json!("stale")),
            delete: true,
        };

        let event = raw.to_event();
        assert!(event.delete);
        assert_eq!(event.value, None);
        assert_eq!(raw.contract().code_id, 1);
    }

    #[test]
    fn test_code_id_sets() {
        let sets: CodeIdSets = [
            ("dao-core".to_string(), vec![1, 4]),
            ("cw20".to_string(), vec![4, 9]),
        ]
        .into_iter()
        .collect();

        assert_eq!(sets.resolve(&["dao-core", "cw20", "missing"]), vec![1, 4, 9]);
        assert!(sets.contains(&["cw20"], 9));
        assert!(!sets.contains(&["dao-core"], 9));
    }

    #[test]
    fn test_event_json_shape() {
        let event = Event {
            contract_address: "juno1dao".to_string(),
            block_height: 7,
            block_time_unix_ms: 7_000,
            key: "99,111".to_string(),
            value: None,
            delete: true,
        };
        insta::assert_json_snapshot!(event, @r###"
        {
          "contract_address": "juno1dao",
          "block_height": 7,
          "block_time_unix_ms": 7000,
          "key": "99,111",
          "delete": true
        }
        "###);
    }
}
