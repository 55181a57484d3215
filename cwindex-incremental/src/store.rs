//! Storage interfaces
//!
//! The engine reads and writes through these traits so that the in-memory
//! [`MemoryStore`](crate::db::MemoryStore) and any persistent backend are
//! interchangeable. All reads take an upper height bound; rows above it are
//! invisible to the caller.

use crate::dependency::{DependentKey, KeyPattern, Namespace, WrittenKeys};
use crate::filter::ValueFilter;
use crate::memo::{Computation, ComputationKey};
use cwindex_types::{Block, Contract, Event, Transformation};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("store backend error: {0}")]
    Backend(String),
}

/// Contract state events, keyed by `(contract, key, height)`
pub trait EventStore: Send + Sync {
    /// Insert or replace events. Returns how many were new.
    fn upsert_events(&self, events: &[Event]) -> Result<usize, StoreError>;

    /// The most recent event for a key at or below `max_height`, deletes included.
    fn latest_event(
        &self,
        contract: &str,
        key: &str,
        max_height: u64,
    ) -> Result<Option<Event>, StoreError>;

    /// The earliest non-delete event for a key at or below `max_height`
    /// whose value matches `filter`.
    fn first_set_event(
        &self,
        contract: &str,
        key: &str,
        max_height: u64,
        filter: Option<&ValueFilter>,
    ) -> Result<Option<Event>, StoreError>;

    /// The most recent event of every key starting with `prefix`, ordered by key.
    fn latest_events_with_prefix(
        &self,
        contract: &str,
        prefix: &str,
        max_height: u64,
    ) -> Result<Vec<Event>, StoreError>;

    /// Latest events for several exact keys and prefixes in one call.
    fn prefetch_latest_events(
        &self,
        contract: &str,
        keys: &[String],
        prefixes: &[String],
        max_height: u64,
    ) -> Result<Vec<Event>, StoreError>;

    /// The earliest event in `[from, to]` written under any of `dependents`.
    fn first_event_matching(
        &self,
        dependents: &[DependentKey],
        from: u64,
        to: u64,
    ) -> Result<Option<Event>, StoreError>;

    fn event_count(&self) -> usize;
}

/// Derived transformations, keyed by `(contract, name, height)`
pub trait TransformationStore: Send + Sync {
    /// Insert or replace transformations. Returns how many were new.
    fn upsert_transformations(&self, transformations: &[Transformation])
        -> Result<usize, StoreError>;

    /// The most recent transformation strictly below `below_height`.
    fn latest_transformation_before(
        &self,
        contract: &str,
        name: &str,
        below_height: u64,
    ) -> Result<Option<Transformation>, StoreError>;

    /// For every `(contract, name)` whose name matches `pattern`, the most
    /// recent transformation at or below `max_height` whose value matches
    /// `filter`. Ordered by name, then contract.
    fn latest_transformations_matching(
        &self,
        contract: Option<&str>,
        pattern: &KeyPattern,
        max_height: u64,
        filter: Option<&ValueFilter>,
    ) -> Result<Vec<Transformation>, StoreError>;

    /// The earliest transformation in `[from, to]` written under any of `dependents`.
    fn first_transformation_matching(
        &self,
        dependents: &[DependentKey],
        from: u64,
        to: u64,
    ) -> Result<Option<Transformation>, StoreError>;

    fn transformation_count(&self) -> usize;
}

pub trait ContractStore: Send + Sync {
    fn upsert_contracts(&self, contracts: &[Contract]) -> Result<(), StoreError>;

    fn contract(&self, address: &str) -> Result<Option<Contract>, StoreError>;
}

pub trait BlockStore: Send + Sync {
    fn record_blocks(&self, blocks: &[Block]) -> Result<(), StoreError>;

    fn latest_block(&self) -> Result<Option<Block>, StoreError>;

    /// The highest known block at or below `height`.
    fn block_at_or_below(&self, height: u64) -> Result<Option<Block>, StoreError>;
}

/// Cached computations, keyed by `(computation key, block height)`
pub trait ComputationStore: Send + Sync {
    /// Insert or replace the computation with the same key and block height.
    fn upsert_computation(&self, computation: &Computation) -> Result<(), StoreError>;

    /// The computation with the highest block height at or below `max_height`.
    fn latest_computation(
        &self,
        key: &ComputationKey,
        max_height: u64,
    ) -> Result<Option<Computation>, StoreError>;

    /// Computations with block height in `(after, to]`, ascending.
    fn computations_between(
        &self,
        key: &ComputationKey,
        after: u64,
        to: u64,
    ) -> Result<Vec<Computation>, StoreError>;

    fn remove_computation(
        &self,
        key: &ComputationKey,
        block_height: Option<u64>,
    ) -> Result<bool, StoreError>;

    /// Every computation with a dependent key matching one of `written`.
    fn computations_matching(&self, written: &WrittenKeys)
        -> Result<Vec<Computation>, StoreError>;

    fn computation_count(&self) -> usize;
}

/// Everything the engine needs from a backend
pub trait Store: EventStore + TransformationStore + ContractStore + BlockStore + ComputationStore {}

impl<T> Store for T where
    T: EventStore + TransformationStore + ContractStore + BlockStore + ComputationStore
{
}

/// The block of the earliest write in `[from, to]` under any of `dependents`.
pub fn first_change(
    store: &dyn Store,
    dependents: &[DependentKey],
    from: u64,
    to: u64,
) -> Result<Option<Block>, StoreError> {
    if from > to || dependents.is_empty() {
        return Ok(None);
    }

    let (events, transformations): (Vec<DependentKey>, Vec<DependentKey>) = dependents
        .iter()
        .cloned()
        .partition(|d| d.namespace == Namespace::Event);

    let event = if events.is_empty() {
        None
    } else {
        store
            .first_event_matching(&events, from, to)?
            .map(|e| e.block())
    };
    let transformation = if transformations.is_empty() {
        None
    } else {
        store
            .first_transformation_matching(&transformations, from, to)?
            .map(|t| t.block())
    };

    Ok(match (event, transformation) {
        (Some(a), Some(b)) => Some(a.min(b)),
        (a, b) => a.or(b),
    })
}
