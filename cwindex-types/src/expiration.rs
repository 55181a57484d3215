//! Contract-style expirations and durations.
//!
//! Both serialize the way CosmWasm contracts store them, externally tagged
//! in snake_case with timestamps as nanosecond strings:
//! `{"at_height": 10}`, `{"at_time": "1700000000000000000"}`, `{"never": {}}`.

use crate::Block;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Expiration {
    AtHeight(u64),
    /// Unix time in nanoseconds
    AtTime(#[serde(with = "nanos")] u64),
    Never {},
}

impl Expiration {
    pub fn is_expired(&self, block: &Block) -> bool {
        match self {
            Expiration::AtHeight(height) => block.height >= *height,
            Expiration::AtTime(nanos) => block.time_unix_ms >= nanos / 1_000_000,
            Expiration::Never {} => false,
        }
    }

    /// Expiration `duration` after `block`.
    pub fn after(block: &Block, duration: &Duration) -> Self {
        match duration {
            Duration::Height(blocks) => Expiration::AtHeight(block.height.saturating_add(*blocks)),
            Duration::Time(seconds) => Expiration::AtTime(
                block
                    .time_unix_ms
                    .saturating_add(seconds.saturating_mul(1_000))
                    .saturating_mul(1_000_000),
            ),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Duration {
    Height(u64),
    /// Seconds
    Time(u64),
}

mod nanos {
    use serde::de::Error;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &u64, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(value)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<u64, D::Error> {
        let raw = String::deserialize(deserializer)?;
        raw.parse().map_err(D::Error::custom)
    }
}
