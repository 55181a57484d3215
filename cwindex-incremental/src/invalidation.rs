//! Write-path invalidation
//!
//! After a batch of events and transformations lands, every cached
//! computation whose dependencies match one of the written keys is either
//! destroyed, re-validated or pushed forward. With `E` the earliest and `L`
//! the latest written height:
//!
//! 1. computations derived at or after `E` are destroyed and recomputed on
//!    next access;
//! 2. computations derived before `E` whose window reaches `E` are
//!    re-checked from `E` through `max(window end, L)`;
//! 3. for each computation key, the most recent computation lying entirely
//!    before `E` is extended through `L`.

use crate::dependency::WrittenKeys;
use crate::memo::{Computation, ComputationKey};
use crate::store::{Store, StoreError};
use cwindex_types::{Event, Transformation};
use serde::Serialize;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;

/// What one invalidation pass did
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct InvalidationSummary {
    /// Windows cut short by a new write
    pub computations_invalidated: usize,
    /// Computations removed because they were derived at or after the earliest write
    pub computations_destroyed: usize,
    /// Windows pushed forward to the latest written height
    pub computations_extended: usize,
}

pub fn invalidate_dependent_computations(
    store: &dyn Store,
    written: &WrittenKeys,
) -> Result<InvalidationSummary, StoreError> {
    let mut summary = InvalidationSummary::default();
    let Some((earliest, latest)) = written.height_range() else {
        return Ok(summary);
    };

    let affected = store.computations_matching(written)?;
    if affected.is_empty() {
        return Ok(summary);
    }

    let mut frontier: HashMap<ComputationKey, Computation> = HashMap::new();
    // Keys with a computation destroyed or re-checked across the write
    let mut handled: HashSet<ComputationKey> = HashSet::new();
    for mut computation in affected {
        if computation.block_height() >= Some(earliest) {
            handled.insert(computation.key.clone());
            if store.remove_computation(&computation.key, computation.block_height())? {
                summary.computations_destroyed += 1;
            }
            continue;
        }

        if computation.latest_block_height_valid >= Some(earliest) {
            handled.insert(computation.key.clone());
            let up_to = computation
                .latest_block_height_valid
                .map_or(latest, |h| h.max(latest));
            if !computation.update_validity_up_to(store, up_to, Some(earliest))? {
                summary.computations_invalidated += 1;
            }
            continue;
        }

        match frontier.get(&computation.key) {
            Some(current) if current.block_height() >= computation.block_height() => {}
            _ => {
                frontier.insert(computation.key.clone(), computation);
            }
        }
    }

    frontier.retain(|key, _| !handled.contains(key));
    for mut computation in frontier.into_values() {
        if computation.update_validity_up_to(store, latest, None)? {
            summary.computations_extended += 1;
        }
    }

    tracing::debug!(
        earliest,
        latest,
        invalidated = summary.computations_invalidated,
        destroyed = summary.computations_destroyed,
        extended = summary.computations_extended,
        "invalidated dependent computations"
    );

    Ok(summary)
}

/// Connects the ingestion path to the computation cache
#[derive(Clone)]
pub struct InvalidationBridge {
    store: Arc<dyn Store>,
}

impl std::fmt::Debug for InvalidationBridge {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InvalidationBridge")
            .field("computations", &self.store.computation_count())
            .finish()
    }
}

impl InvalidationBridge {
    pub fn new(store: Arc<dyn Store>) -> Self {
        InvalidationBridge { store }
    }

    /// Handle rows that were just persisted
    pub fn on_written(
        &self,
        events: &[Event],
        transformations: &[Transformation],
    ) -> Result<InvalidationSummary, StoreError> {
        let written = WrittenKeys::from_rows(events, transformations);
        if written.is_empty() {
            return Ok(InvalidationSummary::default());
        }
        invalidate_dependent_computations(self.store.as_ref(), &written)
    }
}
