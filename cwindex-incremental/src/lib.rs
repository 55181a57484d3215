//! cwindex incremental computation engine
//!
//! This crate caches the outputs of formulas evaluated over indexed
//! smart-contract state and keeps those caches honest as new blocks land.
//!
//! # Architecture
//!
//! State arrives as versioned rows: raw storage **events** keyed by
//! `(contract, key, height)` and derived **transformations** keyed by
//! `(contract, name, height)`. A formula reads that state through an
//! [`Env`], which records a [`DependentKey`] for every read. The output,
//! its dependencies and its validity window are stored as a
//! [`Computation`].
//!
//! ```text
//! raw events → TransformationPipeline → store → invalidation
//!                                         ↓
//!                    Env ← formula ← ComputationCache / RangeComputer
//! ```
//!
//! ## Key Features
//!
//! - **Binary key codec**: nested storage keys with efficient prefix scans
//! - **Dependency tracking**: exact, wildcard and prefix keys
//! - **Validity windows**: cached outputs are extended lazily across blocks
//! - **Bulk invalidation**: new writes destroy, cut or extend computations
//! - **Range computation**: full history in one evaluation per change
//!
//! # Example
//!
//! ```rust,ignore
//! use cwindex_incremental::prelude::*;
//!
//! let store = MemoryStore::new();
//! let code_ids = CodeIdSets::new();
//! let formula = FnFormula::new(|env: &mut Env<'_>| {
//!     Ok(env.get("juno1...", &["config".into()])?.unwrap_or_default())
//! });
//!
//! let output = compute(
//!     ComputeContext::new(&store, &code_ids),
//!     &formula,
//!     "juno1...",
//!     &serde_json::Value::Null,
//!     Block::new(100, 0),
//! )?;
//! ```

#![warn(missing_debug_implementations)]

// Core modules
pub mod db;
pub mod dependency;
pub mod filter;
pub mod keys;
pub mod memo;
pub mod store;

// Evaluation
pub mod compute;
pub mod env;
pub mod formula;

// Write path
pub mod invalidation;
pub mod metrics;
pub mod transform;

// Re-export main types
pub use compute::{compute, ComputationOutput, RangeComputation, RangeComputer, RangeOutput};
pub use db::{MemoryStore, StoreSnapshot};
pub use dependency::{DependencySet, DependentKey, KeyPattern, Namespace, WrittenKey, WrittenKeys};
pub use env::{ComputeContext, Env, EnvError, KeySpec, MapKeyKind, MatchOptions, TransformationMatch, TransformationSpec};
pub use filter::ValueFilter;
pub use formula::{FnFormula, Formula, FormulaError, FormulaRegistry};
pub use invalidation::{invalidate_dependent_computations, InvalidationBridge, InvalidationSummary};
pub use keys::{KeyError, KeyPart, KeyPartKind};
pub use memo::{Computation, ComputationCache, ComputationKey};
pub use metrics::{FormulaMetrics, MetricsRegistry, MetricsSnapshot};
pub use store::{Store, StoreError};
pub use transform::{
    ContractFilter, PreviousValue, TransformError, TransformationPipeline, Transformer,
    TransformerRegistry,
};

/// Prelude module for convenient imports
pub mod prelude {
    pub use crate::compute::{compute, RangeComputer};
    pub use crate::db::MemoryStore;
    pub use crate::env::{ComputeContext, Env, MapKeyKind};
    pub use crate::formula::{FnFormula, Formula, FormulaError, FormulaRegistry};
    pub use crate::keys::KeyPart;
    pub use crate::memo::{ComputationCache, ComputationKey};
    pub use crate::store::{
        BlockStore, ComputationStore, ContractStore, EventStore, Store, TransformationStore,
    };
    pub use crate::transform::{ContractFilter, TransformationPipeline, Transformer};
    pub use cwindex_types::{Block, CodeIdSets, Contract, Event, RawEvent, Transformation};
}
