//! Transformation pipeline
//!
//! Transformers turn raw state events into named, derived values stored as
//! transformations. A batch is processed in event order; a transformer may
//! read the value its output had just before the event's height, which
//! includes outputs produced earlier in the same batch.

use crate::keys::KeyError;
use crate::store::{Store, StoreError};
use cwindex_types::{CodeIdSets, RawEvent, Transformation};
use serde_json::Value;
use std::fmt;
use std::sync::Arc;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum TransformError {
    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Key(#[from] KeyError),

    #[error("failed to decode value: {0}")]
    Decode(#[from] serde_json::Error),

    #[error("{0}")]
    Invalid(String),
}

/// Which contracts a transformer listens to
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ContractFilter {
    /// Contracts whose code id is in one of these named code-id sets
    CodeIdKeys(Vec<String>),
    Addresses(Vec<String>),
    Any,
}

type KeyMatcher = Arc<dyn Fn(&RawEvent) -> bool + Send + Sync>;
type Namer = Arc<dyn Fn(&RawEvent) -> Result<Option<String>, TransformError> + Send + Sync>;
type ValueFn =
    Arc<dyn Fn(&RawEvent, &PreviousValue<'_>) -> Result<Option<Value>, TransformError> + Send + Sync>;

/// Lazy access to the value a transformation had just before an event
pub struct PreviousValue<'a> {
    store: &'a dyn Store,
    batch: &'a [Transformation],
    contract: &'a str,
    name: &'a str,
    height: u64,
}

impl PreviousValue<'_> {
    /// The latest value for the same contract and name strictly below the
    /// event's height, or produced earlier in this batch. `Value::Null` if
    /// there is none.
    pub fn get(&self) -> Result<Value, StoreError> {
        let in_batch = self
            .batch
            .iter()
            .rev()
            .find(|t| t.contract_address == self.contract && t.name == self.name);
        if let Some(t) = in_batch {
            return Ok(t.value.clone());
        }
        Ok(self
            .store
            .latest_transformation_before(self.contract, self.name, self.height)?
            .map_or(Value::Null, |t| t.value))
    }
}

impl fmt::Debug for PreviousValue<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PreviousValue")
            .field("contract", &self.contract)
            .field("name", &self.name)
            .field("height", &self.height)
            .finish_non_exhaustive()
    }
}

/// Derives one named value from matching events
#[derive(Clone)]
pub struct Transformer {
    label: String,
    filter: ContractFilter,
    matches: KeyMatcher,
    namer: Namer,
    value: ValueFn,
    manually_transform_deletes: bool,
}

impl Transformer {
    /// Writes every matching event under the fixed `name`.
    pub fn new(filter: ContractFilter, name: impl Into<String>) -> Self {
        let name = name.into();
        let fixed = name.clone();
        Transformer {
            label: name,
            filter,
            matches: Arc::new(|_| true),
            namer: Arc::new(move |_| Ok(Some(fixed.clone()))),
            value: Arc::new(default_value),
            manually_transform_deletes: false,
        }
    }

    /// Derives the name from each event; `None` skips the event.
    pub fn derived<F>(label: impl Into<String>, filter: ContractFilter, namer: F) -> Self
    where
        F: Fn(&RawEvent) -> Result<Option<String>, TransformError> + Send + Sync + 'static,
    {
        Transformer {
            label: label.into(),
            filter,
            matches: Arc::new(|_| true),
            namer: Arc::new(namer),
            value: Arc::new(default_value),
            manually_transform_deletes: false,
        }
    }

    /// Only handle events for which `matches` holds.
    pub fn matching<F>(mut self, matches: F) -> Self
    where
        F: Fn(&RawEvent) -> bool + Send + Sync + 'static,
    {
        self.matches = Arc::new(matches);
        self
    }

    /// Compute the stored value; `None` skips the event.
    pub fn with_value<F>(mut self, value: F) -> Self
    where
        F: Fn(&RawEvent, &PreviousValue<'_>) -> Result<Option<Value>, TransformError>
            + Send
            + Sync
            + 'static,
    {
        self.value = Arc::new(value);
        self
    }

    /// Pass delete events to the value function instead of storing `null`.
    pub fn transform_deletes(mut self) -> Self {
        self.manually_transform_deletes = true;
        self
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    pub fn filter(&self) -> &ContractFilter {
        &self.filter
    }
}

impl fmt::Debug for Transformer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Transformer")
            .field("label", &self.label)
            .field("filter", &self.filter)
            .field("manually_transform_deletes", &self.manually_transform_deletes)
            .finish_non_exhaustive()
    }
}

fn default_value(
    event: &RawEvent,
    _previous: &PreviousValue<'_>,
) -> Result<Option<Value>, TransformError> {
    Ok(Some(
        event
            .value
            .clone()
            .unwrap_or_else(|| Value::String(String::new())),
    ))
}

#[derive(Debug, Clone, Default)]
pub struct TransformerRegistry {
    transformers: Vec<Transformer>,
}

impl TransformerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, transformer: Transformer) -> &mut Self {
        self.transformers.push(transformer);
        self
    }

    pub fn iter(&self) -> impl Iterator<Item = &Transformer> {
        self.transformers.iter()
    }

    pub fn len(&self) -> usize {
        self.transformers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.transformers.is_empty()
    }
}

impl FromIterator<Transformer> for TransformerRegistry {
    fn from_iter<T: IntoIterator<Item = Transformer>>(iter: T) -> Self {
        TransformerRegistry {
            transformers: iter.into_iter().collect(),
        }
    }
}

/// A transformer with its code-id sets resolved
#[derive(Debug, Clone)]
struct ResolvedTransformer {
    transformer: Transformer,
    code_ids: Vec<u64>,
}

impl ResolvedTransformer {
    fn applies(&self, event: &RawEvent) -> bool {
        let contract_matches = match &self.transformer.filter {
            ContractFilter::CodeIdKeys(_) => self.code_ids.contains(&event.code_id),
            ContractFilter::Addresses(addresses) => addresses.contains(&event.contract_address),
            ContractFilter::Any => true,
        };
        contract_matches && (self.transformer.matches)(event)
    }
}

/// Applies every registered transformer to batches of raw events
#[derive(Debug, Clone, Default)]
pub struct TransformationPipeline {
    transformers: Vec<ResolvedTransformer>,
}

impl TransformationPipeline {
    pub fn new(registry: &TransformerRegistry, code_ids: &CodeIdSets) -> Self {
        let transformers = registry
            .iter()
            .map(|transformer| ResolvedTransformer {
                code_ids: match &transformer.filter {
                    ContractFilter::CodeIdKeys(keys) => code_ids.resolve(keys),
                    _ => Vec::new(),
                },
                transformer: transformer.clone(),
            })
            .collect();
        TransformationPipeline { transformers }
    }

    pub fn len(&self) -> usize {
        self.transformers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.transformers.is_empty()
    }

    /// Transformations produced by `events`, in event order.
    ///
    /// A later item for the same `(contract, name, height)` replaces the
    /// earlier one. Transformer failures are logged and the item skipped;
    /// store failures abort the batch.
    pub fn transform(
        &self,
        store: &dyn Store,
        events: &[RawEvent],
    ) -> Result<Vec<Transformation>, StoreError> {
        let mut finalized: Vec<Transformation> = Vec::new();
        if self.transformers.is_empty() {
            return Ok(finalized);
        }

        for event in events {
            for resolved in self.transformers.iter().filter(|t| t.applies(event)) {
                let transformer = &resolved.transformer;
                let name = match (transformer.namer)(event) {
                    Ok(Some(name)) if !name.is_empty() => name,
                    Ok(_) => continue,
                    Err(err) => {
                        skip(transformer, event, err)?;
                        continue;
                    }
                };

                let value = if event.delete && !transformer.manually_transform_deletes {
                    Some(Value::Null)
                } else {
                    let previous = PreviousValue {
                        store,
                        batch: &finalized,
                        contract: &event.contract_address,
                        name: &name,
                        height: event.block_height,
                    };
                    match (transformer.value)(event, &previous) {
                        Ok(value) => value,
                        Err(err) => {
                            skip(transformer, event, err)?;
                            continue;
                        }
                    }
                };
                let Some(value) = value else {
                    continue;
                };

                let existing = finalized.iter_mut().rev().find(|t| {
                    t.contract_address == event.contract_address
                        && t.name == name
                        && t.block_height == event.block_height
                });
                match existing {
                    Some(existing) => existing.value = value,
                    None => finalized.push(Transformation {
                        contract_address: event.contract_address.clone(),
                        block_height: event.block_height,
                        block_time_unix_ms: event.block_time_unix_ms,
                        name,
                        value,
                    }),
                }
            }
        }

        Ok(finalized)
    }

    /// Transform and persist. Returns the transformations and how many of
    /// them were new rows.
    pub fn run(
        &self,
        store: &dyn Store,
        events: &[RawEvent],
    ) -> Result<(Vec<Transformation>, usize), StoreError> {
        let transformations = self.transform(store, events)?;
        let created = if transformations.is_empty() {
            0
        } else {
            store.upsert_transformations(&transformations)?
        };
        Ok((transformations, created))
    }
}

fn skip(transformer: &Transformer, event: &RawEvent, err: TransformError) -> Result<(), StoreError> {
    match err {
        TransformError::Store(err) => Err(err),
        err => {
            tracing::warn!(
                transformer = %transformer.label,
                contract = %event.contract_address,
                height = event.block_height,
                key = %event.key,
                error = %err,
                "transformer failed, skipping event"
            );
            Ok(())
        }
    }
}
