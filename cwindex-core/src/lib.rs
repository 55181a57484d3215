//! # cwindex-core
//!
//! The indexer context for cwindex.
//!
//! This crate wires the incremental engine to a configured chain: it loads
//! `cwindex.yml`, builds the declared transformers, ingests batches of raw
//! state events, answers formula queries through the computation cache and
//! persists everything to a snapshot in the data directory.

pub mod config;
pub mod formulas;
pub mod indexer;
pub mod snapshot;
pub mod transformers;

pub use config::{Config, ConfigError, TransformerConfig};
pub use indexer::{BatchSummary, Evaluation, Indexer, IndexerError, RangeEntry, Status};
pub use snapshot::SnapshotError;
