//! Formula environment
//!
//! An [`Env`] is the only way a formula reads state. It is bound to one
//! target contract, one argument set and one block; every read is limited
//! to rows at or below that block, records a dependent key, and folds the
//! block of each row it returns into the computation's own block. Repeated
//! reads within one evaluation are served from a private cache.

use crate::dependency::{DependencySet, DependentKey, Namespace};
use crate::filter::ValueFilter;
use crate::keys::{self, KeyError, KeyPart, KeyPartKind};
use crate::store::{Store, StoreError};
use chrono::{DateTime, Utc};
use cwindex_types::{Block, CodeIdSets, Contract, Event, Transformation};
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum EnvError {
    #[error(transparent)]
    Key(#[from] KeyError),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("failed to decode value: {0}")]
    Decode(#[from] serde_json::Error),

    #[error("missing argument `{0}`")]
    MissingArg(String),
}

/// Shared, read-only inputs of every evaluation
#[derive(Clone, Copy)]
pub struct ComputeContext<'a> {
    pub store: &'a dyn Store,
    pub code_ids: &'a CodeIdSets,
}

impl<'a> ComputeContext<'a> {
    pub fn new(store: &'a dyn Store, code_ids: &'a CodeIdSets) -> Self {
        ComputeContext { store, code_ids }
    }
}

impl fmt::Debug for ComputeContext<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ComputeContext")
            .field("code_ids", self.code_ids)
            .finish_non_exhaustive()
    }
}

/// How map entry keys are rendered by [`Env::get_map`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum MapKeyKind {
    /// UTF-8 text
    #[default]
    String,
    /// 8-byte big-endian integer, rendered in decimal
    Number,
    /// The encoded key text as stored
    Raw,
}

/// A state read to warm with [`Env::prefetch`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum KeySpec {
    Item(Vec<KeyPart>),
    Map(Vec<KeyPart>),
}

/// A transformation read to warm with [`Env::prefetch_transformations`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransformationSpec {
    /// A name or `*` pattern
    Name(String),
    /// Every `prefix:...` name
    Map(String),
}

/// Extra constraints for [`Env::get_transformation_matches`]
#[derive(Debug, Clone, Default)]
pub struct MatchOptions {
    pub filter: Option<ValueFilter>,
    /// Only contracts whose code id is in one of these named sets
    pub code_id_keys: Option<Vec<String>>,
    pub limit: Option<usize>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TransformationMatch {
    pub block: Block,
    pub contract_address: String,
    pub code_id: Option<u64>,
    pub name: String,
    pub value: Value,
}

#[derive(Debug, Clone)]
enum Cached<T> {
    Absent,
    Present(T),
}

impl<R: Clone> Cached<Vec<R>> {
    fn from_rows(rows: &[R]) -> Self {
        if rows.is_empty() {
            Cached::Absent
        } else {
            Cached::Present(rows.to_vec())
        }
    }
}

#[derive(Debug, Default)]
struct EnvCache {
    events: HashMap<DependentKey, Cached<Vec<Event>>>,
    transformations: HashMap<(DependentKey, Option<String>), Cached<Vec<Transformation>>>,
    contracts: HashMap<String, Option<Contract>>,
}

/// Read context for one formula evaluation
#[derive(Debug)]
pub struct Env<'a> {
    ctx: ComputeContext<'a>,
    target: &'a str,
    args: &'a Value,
    block: Block,
    dynamic: bool,
    dependencies: DependencySet,
    latest_block: Option<Block>,
    cache: EnvCache,
}

impl<'a> Env<'a> {
    pub fn new(
        ctx: ComputeContext<'a>,
        target: &'a str,
        args: &'a Value,
        block: Block,
        dynamic: bool,
    ) -> Self {
        Env {
            ctx,
            target,
            args,
            block,
            dynamic,
            dependencies: DependencySet::new(),
            latest_block: dynamic.then_some(block),
            cache: EnvCache::default(),
        }
    }

    /// The block this evaluation is pinned to
    pub fn block(&self) -> Block {
        self.block
    }

    pub fn date(&self) -> DateTime<Utc> {
        self.block.date()
    }

    /// Address of the contract the formula is evaluated for
    pub fn target(&self) -> &str {
        self.target
    }

    pub fn args(&self) -> &Value {
        self.args
    }

    /// A required argument, decoded.
    pub fn arg<T: DeserializeOwned>(&self, name: &str) -> Result<T, EnvError> {
        self.arg_opt(name)?
            .ok_or_else(|| EnvError::MissingArg(name.to_string()))
    }

    pub fn arg_opt<T: DeserializeOwned>(&self, name: &str) -> Result<Option<T>, EnvError> {
        match self.args.get(name) {
            None | Some(Value::Null) => Ok(None),
            Some(value) => Ok(Some(serde_json::from_value(value.clone())?)),
        }
    }

    pub fn code_ids(&self) -> &CodeIdSets {
        self.ctx.code_ids
    }

    pub fn dependencies(&self) -> impl Iterator<Item = &DependentKey> {
        self.dependencies.iter()
    }

    /// Dependencies and the latest block observed, consuming the env.
    pub fn finish(self) -> (Vec<DependentKey>, Option<Block>) {
        (self.dependencies.into_vec(), self.latest_block)
    }

    fn depend(&mut self, key: DependentKey) {
        self.dependencies.insert(key);
    }

    fn observe(&mut self, block: Block) {
        if !self.dynamic && self.latest_block.map_or(true, |b| block > b) {
            self.latest_block = Some(block);
        }
    }

    /// The current value of a storage item, `None` if unset or deleted.
    pub fn get(&mut self, contract: &str, keys: &[KeyPart]) -> Result<Option<Value>, EnvError> {
        let key = keys::encode(keys)?;
        Ok(self
            .latest_event(contract, &key)?
            .filter(|event| !event.delete)
            .map(|event| event.value.unwrap_or(Value::Null)))
    }

    pub fn get_as<T: DeserializeOwned>(
        &mut self,
        contract: &str,
        keys: &[KeyPart],
    ) -> Result<Option<T>, EnvError> {
        Ok(self
            .get(contract, keys)?
            .map(serde_json::from_value)
            .transpose()?)
    }

    fn latest_event(&mut self, contract: &str, key: &str) -> Result<Option<Event>, EnvError> {
        let dependent = DependentKey::exact(Namespace::Event, contract, key);
        let event = match self.cache.events.get(&dependent) {
            Some(Cached::Present(rows)) => rows.first().cloned(),
            Some(Cached::Absent) => None,
            None => {
                let found = self
                    .ctx
                    .store
                    .latest_event(contract, key, self.block.height)?;
                let cached = match &found {
                    Some(event) => Cached::Present(vec![event.clone()]),
                    None => Cached::Absent,
                };
                self.cache.events.insert(dependent.clone(), cached);
                found
            }
        };

        self.depend(dependent);
        if let Some(event) = &event {
            self.observe(event.block());
        }
        Ok(event)
    }

    /// Every live entry of a map, keyed by the decoded entry key.
    ///
    /// `None` when the map has never been written; an empty map when every
    /// entry has been deleted.
    pub fn get_map(
        &mut self,
        contract: &str,
        name: &[KeyPart],
        key_kind: MapKeyKind,
    ) -> Result<Option<BTreeMap<String, Value>>, EnvError> {
        let prefix = keys::encode_map_prefix(name)?;
        let events = self.prefix_events(contract, &prefix)?;
        if events.is_empty() {
            return Ok(None);
        }

        let mut map = BTreeMap::new();
        for event in events.into_iter().filter(|e| !e.delete) {
            let suffix = event.key.get(prefix.len()..).unwrap_or_default();
            let entry_key = match key_kind {
                MapKeyKind::Raw => suffix.to_string(),
                MapKeyKind::String => decode_entry_key(suffix, KeyPartKind::String)?,
                MapKeyKind::Number => decode_entry_key(suffix, KeyPartKind::Number)?,
            };
            map.insert(entry_key, event.value.unwrap_or(Value::Null));
        }
        Ok(Some(map))
    }

    fn prefix_events(&mut self, contract: &str, prefix: &str) -> Result<Vec<Event>, EnvError> {
        let dependent = DependentKey::prefix(Namespace::Event, contract, prefix);
        let events = match self.cache.events.get(&dependent) {
            Some(Cached::Present(rows)) => rows.clone(),
            Some(Cached::Absent) => Vec::new(),
            None => {
                let rows = self
                    .ctx
                    .store
                    .latest_events_with_prefix(contract, prefix, self.block.height)?;
                self.cache
                    .events
                    .insert(dependent.clone(), Cached::from_rows(&rows));
                rows
            }
        };

        self.depend(dependent);
        for event in &events {
            self.observe(event.block());
        }
        Ok(events)
    }

    /// Time of the latest write to a key, deletes included.
    pub fn get_date_key_modified(
        &mut self,
        contract: &str,
        keys: &[KeyPart],
    ) -> Result<Option<DateTime<Utc>>, EnvError> {
        let key = keys::encode(keys)?;
        Ok(self
            .latest_event(contract, &key)?
            .map(|event| event.block().date()))
    }

    /// Time a key was first given a value.
    pub fn get_date_key_first_set(
        &mut self,
        contract: &str,
        keys: &[KeyPart],
    ) -> Result<Option<DateTime<Utc>>, EnvError> {
        self.first_set(contract, keys, None)
    }

    /// Time a key was first given a value containing `filter`.
    pub fn get_date_key_first_set_with_value_match(
        &mut self,
        contract: &str,
        keys: &[KeyPart],
        filter: &ValueFilter,
    ) -> Result<Option<DateTime<Utc>>, EnvError> {
        self.first_set(contract, keys, Some(filter))
    }

    fn first_set(
        &mut self,
        contract: &str,
        keys: &[KeyPart],
        filter: Option<&ValueFilter>,
    ) -> Result<Option<DateTime<Utc>>, EnvError> {
        let key = keys::encode(keys)?;
        self.depend(DependentKey::exact(Namespace::Event, contract, &key));

        let event = self
            .ctx
            .store
            .first_set_event(contract, &key, self.block.height, filter)?;
        if let Some(event) = &event {
            self.observe(event.block());
        }
        Ok(event.map(|event| event.block().date()))
    }

    /// Warm the cache for several items and maps in one store call.
    ///
    /// Later `get`/`get_map` calls for the same keys return exactly what
    /// they would have returned without the prefetch.
    pub fn prefetch(&mut self, contract: &str, specs: &[KeySpec]) -> Result<(), EnvError> {
        let mut items = Vec::new();
        let mut prefixes = Vec::new();
        for spec in specs {
            match spec {
                KeySpec::Item(parts) => {
                    let key = keys::encode(parts)?;
                    self.depend(DependentKey::exact(Namespace::Event, contract, &key));
                    items.push(key);
                }
                KeySpec::Map(name) => {
                    let prefix = keys::encode_map_prefix(name)?;
                    self.depend(DependentKey::prefix(Namespace::Event, contract, &prefix));
                    prefixes.push(prefix);
                }
            }
        }

        items.retain(|key| {
            !self
                .cache
                .events
                .contains_key(&DependentKey::exact(Namespace::Event, contract, key))
        });
        prefixes.retain(|prefix| {
            !self
                .cache
                .events
                .contains_key(&DependentKey::prefix(Namespace::Event, contract, prefix))
        });
        if items.is_empty() && prefixes.is_empty() {
            return Ok(());
        }

        let events =
            self.ctx
                .store
                .prefetch_latest_events(contract, &items, &prefixes, self.block.height)?;

        for key in &items {
            let rows: Vec<Event> = events.iter().filter(|e| &e.key == key).cloned().collect();
            self.cache.events.insert(
                DependentKey::exact(Namespace::Event, contract, key),
                Cached::from_rows(&rows),
            );
        }
        for prefix in &prefixes {
            let rows: Vec<Event> = events
                .iter()
                .filter(|e| e.key.starts_with(prefix.as_str()))
                .cloned()
                .collect();
            for event in &rows {
                self.cache
                    .events
                    .entry(DependentKey::exact(Namespace::Event, contract, &event.key))
                    .or_insert_with(|| Cached::Present(vec![event.clone()]));
            }
            self.cache.events.insert(
                DependentKey::prefix(Namespace::Event, contract, prefix),
                Cached::from_rows(&rows),
            );
        }

        tracing::trace!(
            contract,
            items = items.len(),
            maps = prefixes.len(),
            rows = events.len(),
            "prefetched state"
        );
        Ok(())
    }

    fn transformations(
        &mut self,
        dependent: DependentKey,
        filter: Option<&ValueFilter>,
    ) -> Result<Vec<Transformation>, EnvError> {
        let cache_key = (dependent.clone(), filter.map(|f| f.as_value().to_string()));
        let rows = match self.cache.transformations.get(&cache_key) {
            Some(Cached::Present(rows)) => rows.clone(),
            Some(Cached::Absent) => Vec::new(),
            None => {
                let rows = self.ctx.store.latest_transformations_matching(
                    dependent.contract.as_deref(),
                    &dependent.pattern,
                    self.block.height,
                    filter,
                )?;
                self.cache
                    .transformations
                    .insert(cache_key, Cached::from_rows(&rows));
                rows
            }
        };

        self.depend(dependent);
        for row in &rows {
            self.observe(row.block());
        }
        Ok(rows)
    }

    /// Latest transformation of every `(contract, name)` whose name matches
    /// `name_pattern` (`*` matches any run). `contract` of `None` searches
    /// every contract.
    pub fn get_transformation_matches(
        &mut self,
        contract: Option<&str>,
        name_pattern: &str,
        options: &MatchOptions,
    ) -> Result<Option<Vec<TransformationMatch>>, EnvError> {
        let dependent = DependentKey::pattern(Namespace::Transformation, contract, name_pattern);
        let rows = self.transformations(dependent, options.filter.as_ref())?;
        let code_ids = options
            .code_id_keys
            .as_ref()
            .map(|names| self.ctx.code_ids.resolve(names));

        let mut matches = Vec::new();
        for row in rows {
            let code_id = self.get_contract(&row.contract_address)?.map(|c| c.code_id);
            if let Some(allowed) = &code_ids {
                if !code_id.is_some_and(|id| allowed.contains(&id)) {
                    continue;
                }
            }
            matches.push(TransformationMatch {
                block: row.block(),
                contract_address: row.contract_address,
                code_id,
                name: row.name,
                value: row.value,
            });
            if options.limit.is_some_and(|limit| matches.len() >= limit) {
                break;
            }
        }

        Ok((!matches.is_empty()).then_some(matches))
    }

    pub fn get_transformation_match(
        &mut self,
        contract: Option<&str>,
        name_pattern: &str,
    ) -> Result<Option<TransformationMatch>, EnvError> {
        Ok(self
            .get_transformation_matches(contract, name_pattern, &MatchOptions::default())?
            .and_then(|matches| matches.into_iter().next()))
    }

    /// Every `name_prefix:<key>` transformation of a contract as a map from
    /// `<key>` to value. Cleared (null) entries are left out.
    pub fn get_transformation_map(
        &mut self,
        contract: &str,
        name_prefix: &str,
    ) -> Result<Option<BTreeMap<String, Value>>, EnvError> {
        let prefix = format!("{}:", name_prefix);
        let dependent = DependentKey::prefix(Namespace::Transformation, contract, &prefix);
        let rows = self.transformations(dependent, None)?;
        if rows.is_empty() {
            return Ok(None);
        }

        Ok(Some(
            rows.into_iter()
                .filter(|row| !row.value.is_null())
                .map(|row| {
                    let key = row.name.get(prefix.len()..).unwrap_or_default().to_string();
                    (key, row.value)
                })
                .collect(),
        ))
    }

    pub fn prefetch_transformations(
        &mut self,
        contract: &str,
        specs: &[TransformationSpec],
    ) -> Result<(), EnvError> {
        for spec in specs {
            let dependent = match spec {
                TransformationSpec::Name(name) => {
                    DependentKey::pattern(Namespace::Transformation, Some(contract), name)
                }
                TransformationSpec::Map(prefix) => DependentKey::prefix(
                    Namespace::Transformation,
                    contract,
                    &format!("{}:", prefix),
                ),
            };
            self.transformations(dependent, None)?;
        }
        Ok(())
    }

    /// Contract metadata. Not recorded as a dependency.
    pub fn get_contract(&mut self, address: &str) -> Result<Option<Contract>, EnvError> {
        if let Some(cached) = self.cache.contracts.get(address) {
            return Ok(cached.clone());
        }
        let contract = self.ctx.store.contract(address)?;
        self.cache
            .contracts
            .insert(address.to_string(), contract.clone());
        Ok(contract)
    }

    /// Whether the contract's code id is in any of the named code-id sets.
    pub fn contract_matches_code_id_keys<S: AsRef<str>>(
        &mut self,
        address: &str,
        keys: &[S],
    ) -> Result<bool, EnvError> {
        Ok(self
            .get_contract(address)?
            .is_some_and(|contract| self.ctx.code_ids.contains(keys, contract.code_id)))
    }
}

fn decode_entry_key(suffix: &str, kind: KeyPartKind) -> Result<String, KeyError> {
    Ok(keys::decode_typed(suffix, &[kind])?
        .into_iter()
        .next()
        .map(|part| part.to_string())
        .unwrap_or_default())
}
