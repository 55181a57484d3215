//! Indexer context: ingestion, cached evaluation and range queries.

use crate::config::{Config, ConfigError};
use crate::formulas;
use crate::snapshot::{self, SnapshotError};
use crate::transformers;
use cwindex_incremental::compute::{compute, RangeComputer};
use cwindex_incremental::env::ComputeContext;
use cwindex_incremental::formula::{Formula, FormulaError, FormulaRegistry};
use cwindex_incremental::invalidation::InvalidationBridge;
use cwindex_incremental::keys::KeyError;
use cwindex_incremental::memo::{Computation, ComputationCache, ComputationKey};
use cwindex_incremental::metrics::{MetricsRegistry, MetricsSnapshot};
use cwindex_incremental::store::{
    BlockStore, ComputationStore, ContractStore, EventStore, StoreError, TransformationStore,
};
use cwindex_incremental::transform::{TransformationPipeline, Transformer, TransformerRegistry};
use cwindex_incremental::MemoryStore;
use cwindex_types::{Block, Contract, Event, RawEvent};
use parking_lot::Mutex;
use serde::Serialize;
use serde_json::Value;
use std::collections::{BTreeMap, BTreeSet};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum IndexerError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Snapshot(#[from] SnapshotError),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Formula(#[from] FormulaError),

    #[error("Invalid transformer: {0}")]
    Transformer(#[from] KeyError),

    #[error("Unknown formula: {0}")]
    UnknownFormula(String),

    #[error("No blocks have been ingested")]
    NoBlocks,

    #[error("Invalid block range {start}..={end}")]
    InvalidRange { start: u64, end: u64 },

    #[error("Step must be positive")]
    InvalidStep,

    #[error("Cannot compute dynamic formula {0} over a range")]
    DynamicRange(String),
}

/// Result of one ingested batch
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct BatchSummary {
    pub new_event_count: usize,
    pub new_transformation_count: usize,
    pub computations_invalidated: usize,
    pub computations_destroyed: usize,
    pub computations_extended: usize,
    pub latest_block_height: Option<u64>,
}

impl BatchSummary {
    pub fn merge(&mut self, other: BatchSummary) {
        self.new_event_count += other.new_event_count;
        self.new_transformation_count += other.new_transformation_count;
        self.computations_invalidated += other.computations_invalidated;
        self.computations_destroyed += other.computations_destroyed;
        self.computations_extended += other.computations_extended;
        self.latest_block_height = self.latest_block_height.max(other.latest_block_height);
    }
}

/// A single evaluation
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Evaluation {
    pub value: Value,
    pub block: Option<Block>,
    /// Served from a cached computation
    pub cached: bool,
}

/// One entry of a range result
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RangeEntry {
    /// Sampled height, when a step was requested
    #[serde(skip_serializing_if = "Option::is_none")]
    pub at: Option<u64>,
    pub block_height: Option<u64>,
    pub block_time_unix_ms: Option<u64>,
    pub value: Value,
}

impl From<&Computation> for RangeEntry {
    fn from(computation: &Computation) -> Self {
        RangeEntry {
            at: None,
            block_height: computation.block.map(|b| b.height),
            block_time_unix_ms: computation.block.map(|b| b.time_unix_ms),
            value: computation.output.clone(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Status {
    pub chain_id: String,
    pub latest_block: Option<Block>,
    pub events: usize,
    pub transformations: usize,
    pub computations: usize,
}

/// The application context
///
/// Owns the store, the formula and transformer registries and the
/// invalidation bridge. Open it with [`Indexer::open`] and persist it with
/// [`Indexer::close`].
#[derive(Debug)]
pub struct Indexer {
    config: Config,
    store: Arc<MemoryStore>,
    formulas: FormulaRegistry,
    transformers: TransformerRegistry,
    pipeline: TransformationPipeline,
    bridge: InvalidationBridge,
    metrics: MetricsRegistry,
    ingest: Mutex<()>,
}

impl Indexer {
    /// Build the context, restoring the snapshot in the data directory.
    pub fn open(config: Config) -> Result<Self, IndexerError> {
        let data_dir = config.data_dir();
        let store = match snapshot::load(&data_dir, &config.chain_id)? {
            Some(state) => MemoryStore::from_snapshot(state),
            None => MemoryStore::new(),
        };
        let store = Arc::new(store);

        let transformers = transformers::registry_from_config(&config.transformers)?;
        let pipeline = TransformationPipeline::new(&transformers, &config.code_ids);
        let bridge = InvalidationBridge::new(store.clone());

        tracing::info!(
            chain_id = %config.chain_id,
            data_dir = %data_dir.display(),
            events = store.event_count(),
            computations = store.computation_count(),
            transformers = transformers.len(),
            "indexer opened"
        );

        Ok(Indexer {
            config,
            store,
            formulas: formulas::builtin(),
            transformers,
            pipeline,
            bridge,
            metrics: MetricsRegistry::new(),
            ingest: Mutex::new(()),
        })
    }

    /// Persist state and cached computations. Returns the snapshot path.
    pub fn close(self) -> Result<PathBuf, IndexerError> {
        let path = self.save()?;
        tracing::info!(path = %path.display(), "indexer closed");
        Ok(path)
    }

    pub fn save(&self) -> Result<PathBuf, IndexerError> {
        Ok(snapshot::save(
            &self.config.data_dir(),
            &self.config.chain_id,
            &self.store.snapshot(),
        )?)
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn store(&self) -> &MemoryStore {
        &self.store
    }

    pub fn register_formula(&mut self, name: impl Into<String>, formula: impl Formula) -> &mut Self {
        self.formulas.register(name, formula);
        self
    }

    pub fn register_transformer(&mut self, transformer: Transformer) -> &mut Self {
        self.transformers.register(transformer);
        self.pipeline = TransformationPipeline::new(&self.transformers, &self.config.code_ids);
        self
    }

    pub fn formula_names(&self) -> impl Iterator<Item = &str> {
        self.formulas.names()
    }

    fn context(&self) -> ComputeContext<'_> {
        ComputeContext::new(self.store.as_ref(), &self.config.code_ids)
    }

    fn formula(&self, name: &str) -> Result<Arc<dyn Formula>, IndexerError> {
        self.formulas
            .get(name)
            .ok_or_else(|| IndexerError::UnknownFormula(name.to_string()))
    }

    /// Write one batch of raw events, derive transformations and invalidate
    /// affected computations. Batches are applied one at a time.
    pub fn submit_batch(&self, raw: &[RawEvent]) -> Result<BatchSummary, IndexerError> {
        let _guard = self.ingest.lock();
        if raw.is_empty() {
            return Ok(BatchSummary::default());
        }

        let contracts: BTreeMap<&str, Contract> = raw
            .iter()
            .map(|event| (event.contract_address.as_str(), event.contract()))
            .collect();
        self.store
            .upsert_contracts(&contracts.into_values().collect::<Vec<_>>())?;

        let blocks: BTreeSet<Block> = raw.iter().map(RawEvent::block).collect();
        self.store
            .record_blocks(&blocks.iter().copied().collect::<Vec<_>>())?;

        let events: Vec<Event> = raw.iter().map(RawEvent::to_event).collect();
        let new_event_count = self.store.upsert_events(&events)?;

        let (transformations, new_transformation_count) =
            self.pipeline.run(self.store.as_ref(), raw)?;

        let invalidation = self.bridge.on_written(&events, &transformations)?;

        let summary = BatchSummary {
            new_event_count,
            new_transformation_count,
            computations_invalidated: invalidation.computations_invalidated,
            computations_destroyed: invalidation.computations_destroyed,
            computations_extended: invalidation.computations_extended,
            latest_block_height: blocks.iter().next_back().map(|b| b.height),
        };
        tracing::info!(
            events = summary.new_event_count,
            transformations = summary.new_transformation_count,
            invalidated = summary.computations_invalidated,
            destroyed = summary.computations_destroyed,
            latest_block = ?summary.latest_block_height,
            "batch ingested"
        );
        Ok(summary)
    }

    /// Submit `raw` in batches of the configured size.
    pub fn ingest(&self, raw: &[RawEvent]) -> Result<BatchSummary, IndexerError> {
        let mut total = BatchSummary::default();
        for batch in raw.chunks(self.config.ingest.batch_size.max(1)) {
            total.merge(self.submit_batch(batch)?);
        }
        Ok(total)
    }

    /// The block at `height`, or the latest ingested block.
    fn resolve_block(&self, height: Option<u64>) -> Result<Block, IndexerError> {
        let Some(height) = height else {
            return self.store.latest_block()?.ok_or(IndexerError::NoBlocks);
        };
        Ok(match self.store.block_at_or_below(height)? {
            Some(block) => Block::new(height, block.time_unix_ms),
            None => Block::new(height, 0),
        })
    }

    /// Value of `formula` for `target` at `height` (latest block if `None`).
    ///
    /// A cached computation is reused when it can be shown valid at the
    /// block; otherwise the formula runs and, unless dynamic, the result is
    /// cached as valid through the requested block.
    pub fn evaluate(
        &self,
        formula_name: &str,
        target: &str,
        args: &Value,
        height: Option<u64>,
    ) -> Result<Evaluation, IndexerError> {
        let formula = self.formula(formula_name)?;
        let block = self.resolve_block(height)?;
        let metrics = self.metrics.for_formula(formula_name);
        let key = ComputationKey::new(target, formula_name, args);
        let cache = ComputationCache::new(self.store.as_ref());

        if !formula.dynamic() {
            if let Some(existing) = cache.lookup(&key, block.height)? {
                metrics.record_hit();
                return Ok(Evaluation {
                    value: existing.output,
                    block: existing.block,
                    cached: true,
                });
            }
        }

        metrics.record_miss();
        let started = Instant::now();
        let output = compute(self.context(), formula.as_ref(), target, args, block)?;
        metrics.record_execution(1, started.elapsed());

        let evaluation = Evaluation {
            value: output.value.clone(),
            block: output.block,
            cached: false,
        };
        if !formula.dynamic() {
            cache.record(key, output, block.height, true)?;
        }

        tracing::debug!(
            formula = formula_name,
            target,
            height = block.height,
            "formula evaluated"
        );
        Ok(evaluation)
    }

    /// Change list of `formula` over `[start, end]`, with `end` capped at
    /// the latest ingested block. With a `step`, the value in effect at
    /// every `step`-th height from `start` is returned instead.
    pub fn evaluate_range(
        &self,
        formula_name: &str,
        target: &str,
        args: &Value,
        start: u64,
        end: u64,
        step: Option<u64>,
    ) -> Result<Vec<RangeEntry>, IndexerError> {
        if step == Some(0) {
            return Err(IndexerError::InvalidStep);
        }
        if start > end {
            return Err(IndexerError::InvalidRange { start, end });
        }

        let formula = self.formula(formula_name)?;
        // Outputs may change with the block alone, which no dependency records
        if formula.dynamic() {
            return Err(IndexerError::DynamicRange(formula_name.to_string()));
        }
        let latest = self.store.latest_block()?.ok_or(IndexerError::NoBlocks)?;
        let end = end.min(latest.height);
        if start > end {
            return Ok(Vec::new());
        }

        let start_block = self.resolve_block(Some(start))?;
        let key = ComputationKey::new(target, formula_name, args);
        let metrics = self.metrics.for_formula(formula_name);
        metrics.record_range();

        let chain = match self.existing_chain(formula.as_ref(), &key, target, args, start_block, end)? {
            Some(chain) => {
                metrics.record_hit();
                chain
            }
            None => {
                metrics.record_miss();
                let started = Instant::now();
                let range = self
                    .range_computer()
                    .compute(formula.as_ref(), target, args, start_block, end)?;
                metrics.record_execution(range.evaluations as u64, started.elapsed());
                ComputationCache::new(self.store.as_ref()).record_range(&key, range.outputs, true)?
            }
        };

        let entries = merge_unchanged(chain.iter().map(RangeEntry::from));
        Ok(match step {
            None | Some(1) => entries,
            Some(step) => sample(&entries, start, end, step),
        })
    }

    fn range_computer(&self) -> RangeComputer<'_> {
        RangeComputer::new(self.context()).with_max_evaluations(self.config.range.max_evaluations)
    }

    /// Cached computations chained over `[start, end]`, computing only the
    /// missing tail when the chain is contiguous but stops short of `end`.
    fn existing_chain(
        &self,
        formula: &dyn Formula,
        key: &ComputationKey,
        target: &str,
        args: &Value,
        start: Block,
        end: u64,
    ) -> Result<Option<Vec<Computation>>, IndexerError> {
        let store = self.store.as_ref();
        let Some(first) = store.latest_computation(key, start.height)? else {
            return Ok(None);
        };
        let mut chain = vec![first];
        chain.extend(store.computations_between(key, start.height, end)?);

        let contiguous = chain.windows(2).all(|pair| {
            pair[0].latest_block_height_valid.map(|h| h + 1) == pair[1].block_height()
        });
        if !contiguous {
            return Ok(None);
        }

        let Some(mut last) = chain.pop() else {
            return Ok(None);
        };
        if last.update_validity_up_to(store, end, None)? {
            chain.push(last);
            return Ok(Some(chain));
        }

        // Recompute from the last computation's own block; the first output
        // replaces it with an up to date window.
        let tail_start = last.block.unwrap_or(start);
        let started = Instant::now();
        let range = self
            .range_computer()
            .compute(formula, target, args, tail_start, end)?;
        self.metrics
            .for_formula(&key.formula)
            .record_execution(range.evaluations as u64, started.elapsed());

        let mut outputs = range.outputs;
        if let Some(first) = outputs.first_mut() {
            first.block = last.block;
        }
        let tail = ComputationCache::new(store).record_range(key, outputs, true)?;
        chain.extend(tail);

        let valid = match chain.last_mut() {
            Some(last) => last.update_validity_up_to(store, end, None)?,
            None => false,
        };
        Ok(valid.then_some(chain))
    }

    /// Recompute the cached computation in effect at `height` (latest block
    /// if `None`) and repair it if the stored state changed underneath it.
    ///
    /// Returns `None` when nothing is cached, otherwise whether the cached
    /// computation was still correct.
    pub fn revalidate(
        &self,
        formula_name: &str,
        target: &str,
        args: &Value,
        height: Option<u64>,
    ) -> Result<Option<bool>, IndexerError> {
        let formula = self.formula(formula_name)?;
        let block = self.resolve_block(height)?;
        let key = ComputationKey::new(target, formula_name, args);
        let Some(mut computation) = self.store.latest_computation(&key, block.height)? else {
            return Ok(None);
        };
        let valid = ComputationCache::new(self.store.as_ref()).revalidate(
            self.context(),
            formula.as_ref(),
            &mut computation,
        )?;
        tracing::debug!(formula = formula_name, target, valid, "computation revalidated");
        Ok(Some(valid))
    }

    pub fn status(&self) -> Result<Status, IndexerError> {
        Ok(Status {
            chain_id: self.config.chain_id.clone(),
            latest_block: self.store.latest_block()?,
            events: self.store.event_count(),
            transformations: self.store.transformation_count(),
            computations: self.store.computation_count(),
        })
    }

    pub fn metrics(&self) -> Vec<MetricsSnapshot> {
        self.metrics.snapshot_all()
    }
}

/// Collapse consecutive entries with equal values into the first of them.
fn merge_unchanged(entries: impl IntoIterator<Item = RangeEntry>) -> Vec<RangeEntry> {
    let mut merged: Vec<RangeEntry> = Vec::new();
    for entry in entries {
        if merged.last().is_some_and(|last| last.value == entry.value) {
            continue;
        }
        merged.push(entry);
    }
    merged
}

/// The entry in effect at every `step`-th height of `[start, end]`.
/// Heights before the first entry are skipped.
fn sample(entries: &[RangeEntry], start: u64, end: u64, step: u64) -> Vec<RangeEntry> {
    let mut sampled = Vec::new();
    let mut index = 0;
    let mut height = start;
    while height <= end {
        while entries
            .get(index + 1)
            .is_some_and(|next| next.block_height <= Some(height))
        {
            index += 1;
        }
        if let Some(entry) = entries.get(index).filter(|e| e.block_height <= Some(height)) {
            sampled.push(RangeEntry {
                at: Some(height),
                ..entry.clone()
            });
        }
        height = match height.checked_add(step) {
            Some(next) => next,
            None => break,
        };
    }
    sampled
}
