//! Cached computations and their validity windows
//!
//! A [`Computation`] stores one formula output together with the block it
//! was derived from and the highest block through which it is known to
//! still hold. Validity is extended lazily: when a computation is asked
//! about a later height, the dependency set is checked against writes in
//! the gap and the window either grows or stops just before the first write.

use crate::compute::{compute, ComputationOutput, RangeOutput};
use crate::dependency::{DependentKey, Namespace, WrittenKeys};
use crate::env::ComputeContext;
use crate::formula::{Formula, FormulaError};
use crate::store::{first_change, Store, StoreError};
use cwindex_types::Block;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Identity of a cached formula output, independent of height
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ComputationKey {
    pub target_address: String,
    pub formula: String,
    /// Canonical JSON of the arguments
    pub args: String,
}

impl ComputationKey {
    pub fn new(target_address: &str, formula: &str, args: &Value) -> Self {
        ComputationKey {
            target_address: target_address.to_string(),
            formula: formula.to_string(),
            args: canonical_args(args),
        }
    }

    /// Content hash of the key, for logs and external cache names
    pub fn digest(&self) -> String {
        let mut hasher = blake3::Hasher::new();
        hasher.update(self.target_address.as_bytes());
        hasher.update(&[0]);
        hasher.update(self.formula.as_bytes());
        hasher.update(&[0]);
        hasher.update(self.args.as_bytes());
        hasher.finalize().to_hex().to_string()
    }
}

/// Compact JSON with sorted object keys. Missing args and `{}` are the same.
pub fn canonical_args(args: &Value) -> String {
    match args {
        Value::Null => "{}".to_string(),
        other => other.to_string(),
    }
}

/// A stored formula output
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Computation {
    pub key: ComputationKey,
    /// Latest block among the rows the evaluation read; `None` if it read none.
    pub block: Option<Block>,
    /// The output holds for every height in `[block, latest_block_height_valid]`.
    pub latest_block_height_valid: Option<u64>,
    pub validity_extendable: bool,
    pub dependencies: Vec<DependentKey>,
    pub output: Value,
}

impl Computation {
    pub fn from_output(
        key: ComputationKey,
        output: ComputationOutput,
        latest_block_height_valid: u64,
        validity_extendable: bool,
    ) -> Self {
        Computation {
            key,
            block: output.block,
            latest_block_height_valid: Some(latest_block_height_valid),
            validity_extendable,
            dependencies: output.dependencies,
            output: output.value,
        }
    }

    pub fn from_range_output(
        key: ComputationKey,
        output: RangeOutput,
        validity_extendable: bool,
    ) -> Self {
        Computation {
            key,
            block: output.block,
            latest_block_height_valid: Some(output.latest_block_height_valid),
            validity_extendable,
            dependencies: output.dependencies,
            output: output.value,
        }
    }

    pub fn block_height(&self) -> Option<u64> {
        self.block.map(|b| b.height)
    }

    pub fn dependent_events(&self) -> impl Iterator<Item = &DependentKey> {
        self.dependencies
            .iter()
            .filter(|d| d.namespace == Namespace::Event)
    }

    pub fn dependent_transformations(&self) -> impl Iterator<Item = &DependentKey> {
        self.dependencies
            .iter()
            .filter(|d| d.namespace == Namespace::Transformation)
    }

    pub fn depends_on(&self, written: &WrittenKeys) -> bool {
        self.dependencies.iter().any(|d| written.matched_by(d))
    }

    /// Whether `height` lies inside the recorded validity window.
    pub fn covers(&self, height: u64) -> bool {
        self.block_height() <= Some(height) && self.latest_block_height_valid >= Some(height)
    }

    /// Try to prove the output still holds at `up_to`.
    ///
    /// Writes matching the dependencies are searched from `start_from` (or
    /// just past the current window) through `up_to`. With none found the
    /// window is extended to `up_to`; otherwise it ends just before the
    /// first write. The updated window is persisted either way.
    pub fn update_validity_up_to(
        &mut self,
        store: &dyn Store,
        up_to: u64,
        start_from: Option<u64>,
    ) -> Result<bool, StoreError> {
        if Some(up_to) < self.block_height() {
            return Ok(false);
        }
        if start_from.is_none() && self.latest_block_height_valid >= Some(up_to) {
            return Ok(true);
        }
        if !self.validity_extendable {
            return Ok(false);
        }

        let past_window = self.latest_block_height_valid.map_or(0, |h| h + 1);
        let past_block = self.block_height().map_or(0, |h| h + 1);
        let from = past_block.max(start_from.map_or(past_window, |s| s.min(past_window)));

        let change = first_change(store, &self.dependencies, from, up_to)?;
        self.latest_block_height_valid = match change {
            None => Some(up_to),
            Some(block) => block.height.checked_sub(1),
        };
        store.upsert_computation(self)?;

        tracing::trace!(
            formula = %self.key.formula,
            target = %self.key.target_address,
            args = %self.key.digest(),
            latest_valid = ?self.latest_block_height_valid,
            "validity updated"
        );

        Ok(change.is_none())
    }
}

/// Read and write access to cached computations of one store
#[derive(Clone, Copy)]
pub struct ComputationCache<'a> {
    store: &'a dyn Store,
}

impl std::fmt::Debug for ComputationCache<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ComputationCache")
            .field("computations", &self.store.computation_count())
            .finish()
    }
}

impl<'a> ComputationCache<'a> {
    pub fn new(store: &'a dyn Store) -> Self {
        ComputationCache { store }
    }

    /// The cached output for `key` at `height`, if one can be shown valid.
    pub fn lookup(
        &self,
        key: &ComputationKey,
        height: u64,
    ) -> Result<Option<Computation>, StoreError> {
        let Some(mut existing) = self.store.latest_computation(key, height)? else {
            return Ok(None);
        };
        if existing.update_validity_up_to(self.store, height, None)? {
            Ok(Some(existing))
        } else {
            Ok(None)
        }
    }

    pub fn record(
        &self,
        key: ComputationKey,
        output: ComputationOutput,
        latest_block_height_valid: u64,
        validity_extendable: bool,
    ) -> Result<Computation, StoreError> {
        let computation = Computation::from_output(
            key,
            output,
            latest_block_height_valid,
            validity_extendable,
        );
        self.store.upsert_computation(&computation)?;
        Ok(computation)
    }

    pub fn record_range(
        &self,
        key: &ComputationKey,
        outputs: Vec<RangeOutput>,
        validity_extendable: bool,
    ) -> Result<Vec<Computation>, StoreError> {
        outputs
            .into_iter()
            .map(|output| {
                let computation =
                    Computation::from_range_output(key.clone(), output, validity_extendable);
                self.store.upsert_computation(&computation)?;
                Ok(computation)
            })
            .collect()
    }

    /// Recompute `computation` at its own block.
    ///
    /// A failed evaluation removes the stored computation. If the output,
    /// block or dependencies differ, the stored computation is replaced.
    /// Both cases return `false`. Otherwise an extendable computation has
    /// its validity re-checked from its start through its recorded window;
    /// a non-extendable one is left as is.
    pub fn revalidate(
        &self,
        ctx: ComputeContext<'_>,
        formula: &dyn Formula,
        computation: &mut Computation,
    ) -> Result<bool, FormulaError> {
        let at = match computation.block {
            Some(block) => block,
            None => {
                let height = computation.latest_block_height_valid.unwrap_or(0);
                self.store
                    .block_at_or_below(height)?
                    .map_or(Block::new(height, 0), |b| Block::new(height, b.time_unix_ms))
            }
        };
        let args: Value = serde_json::from_str(&computation.key.args)?;
        let output = match compute(ctx, formula, &computation.key.target_address, &args, at) {
            Ok(output) => output,
            Err(FormulaError::Store(err)) => return Err(err.into()),
            Err(err) => {
                tracing::debug!(
                    formula = %computation.key.formula,
                    target = %computation.key.target_address,
                    error = %err,
                    "revalidation failed, computation removed"
                );
                self.store
                    .remove_computation(&computation.key, computation.block_height())?;
                return Ok(false);
            }
        };

        let unchanged = output.value == computation.output
            && output.block == computation.block
            && output.dependencies == computation.dependencies;
        if !unchanged {
            tracing::debug!(
                formula = %computation.key.formula,
                target = %computation.key.target_address,
                "revalidation replaced computation"
            );
            self.store
                .remove_computation(&computation.key, computation.block_height())?;
            *computation = self.record(
                computation.key.clone(),
                output,
                at.height,
                computation.validity_extendable,
            )?;
            return Ok(false);
        }

        if !computation.validity_extendable {
            return Ok(true);
        }
        let up_to = computation
            .latest_block_height_valid
            .unwrap_or(at.height)
            .max(at.height);
        Ok(computation.update_validity_up_to(self.store, up_to, computation.block_height())?)
    }
}
