//! In-memory store
//!
//! Events and transformations live in ordered version tables behind
//! `parking_lot` read-write locks: one `BTreeMap` of versions per
//! `(contract, key)`, plus a height index used to find the first write
//! after a given block. Computations are grouped per [`ComputationKey`] in a
//! `DashMap`, each group ordered by block height.

use crate::dependency::{DependentKey, KeyPattern, WrittenKeys};
use crate::filter::ValueFilter;
use crate::memo::{Computation, ComputationKey};
use crate::store::{
    BlockStore, ComputationStore, ContractStore, EventStore, StoreError, TransformationStore,
};
use cwindex_types::{Block, Contract, Event, Transformation};
use dashmap::DashMap;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::ops::Bound;

type Scope = (String, String);

/// Versions of every `(contract, key)`, ordered by height
#[derive(Debug)]
struct VersionedTable<R> {
    rows: BTreeMap<Scope, BTreeMap<u64, R>>,
    by_height: BTreeMap<u64, BTreeSet<Scope>>,
}

impl<R> Default for VersionedTable<R> {
    fn default() -> Self {
        VersionedTable {
            rows: BTreeMap::new(),
            by_height: BTreeMap::new(),
        }
    }
}

impl<R> VersionedTable<R> {
    /// Returns `true` if no row existed at this height.
    fn upsert(&mut self, contract: &str, key: &str, height: u64, row: R) -> bool {
        let scope = (contract.to_string(), key.to_string());
        self.by_height
            .entry(height)
            .or_default()
            .insert(scope.clone());
        self.rows
            .entry(scope)
            .or_default()
            .insert(height, row)
            .is_none()
    }

    fn versions(&self, contract: &str, key: &str) -> Option<&BTreeMap<u64, R>> {
        self.rows.get(&(contract.to_string(), key.to_string()))
    }

    /// Version maps of every key matching `pattern`, optionally limited to
    /// one contract, in `(contract, key)` order.
    fn matching<'a>(
        &'a self,
        contract: Option<&str>,
        pattern: &KeyPattern,
    ) -> Vec<(&'a Scope, &'a BTreeMap<u64, R>)> {
        match contract {
            Some(contract) => {
                let literal = pattern.literal_prefix();
                let start = (contract.to_string(), literal.to_string());
                self.rows
                    .range(start..)
                    .take_while(|((c, k), _)| c == contract && k.starts_with(literal))
                    .filter(|((_, k), _)| pattern.matches(k))
                    .collect()
            }
            None => self
                .rows
                .iter()
                .filter(|((_, k), _)| pattern.matches(k))
                .collect(),
        }
    }

    /// The earliest row in `[from, to]` written under any of `dependents`.
    fn first_change(&self, dependents: &[DependentKey], from: u64, to: u64) -> Option<&R> {
        if from > to {
            return None;
        }

        let mut best: Option<(u64, &R)> = None;
        let mut patterns = Vec::new();
        for dependent in dependents {
            match (&dependent.contract, &dependent.pattern) {
                (Some(contract), KeyPattern::Exact(key)) => {
                    let first = self
                        .versions(contract, key)
                        .and_then(|versions| versions.range(from..=to).next());
                    if let Some((height, row)) = first {
                        if best.map_or(true, |(b, _)| *height < b) {
                            best = Some((*height, row));
                        }
                    }
                }
                _ => patterns.push(dependent),
            }
        }

        // Patterns only need scanning below the best exact hit.
        let upper = match best {
            Some((height, _)) if height > from => Some(height - 1),
            Some(_) => None,
            None => Some(to),
        };
        if let (Some(upper), false) = (upper, patterns.is_empty()) {
            for (height, scopes) in self.by_height.range(from..=upper) {
                let hit = scopes.iter().find(|(contract, key)| {
                    patterns.iter().any(|d| {
                        d.contract.as_deref().map_or(true, |c| c == contract)
                            && d.pattern.matches(key)
                    })
                });
                if let Some(scope) = hit {
                    if let Some(row) = self.rows.get(scope).and_then(|v| v.get(height)) {
                        best = Some((*height, row));
                        break;
                    }
                }
            }
        }

        best.map(|(_, row)| row)
    }

    fn len(&self) -> usize {
        self.rows.values().map(BTreeMap::len).sum()
    }

    fn all(&self) -> impl Iterator<Item = &R> {
        self.rows.values().flat_map(BTreeMap::values)
    }
}

/// In-memory implementation of every store trait
#[derive(Debug, Default)]
pub struct MemoryStore {
    events: RwLock<VersionedTable<Event>>,
    transformations: RwLock<VersionedTable<Transformation>>,
    contracts: DashMap<String, Contract>,
    blocks: RwLock<BTreeMap<u64, u64>>,
    computations: DashMap<ComputationKey, BTreeMap<Option<u64>, Computation>>,
}

/// Serializable copy of a [`MemoryStore`]
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StoreSnapshot {
    pub blocks: Vec<Block>,
    pub contracts: Vec<Contract>,
    pub events: Vec<Event>,
    pub transformations: Vec<Transformation>,
    pub computations: Vec<Computation>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn snapshot(&self) -> StoreSnapshot {
        let mut contracts: Vec<Contract> =
            self.contracts.iter().map(|c| c.value().clone()).collect();
        contracts.sort_by(|a, b| a.address.cmp(&b.address));

        let mut computations: Vec<Computation> = self
            .computations
            .iter()
            .flat_map(|group| group.value().values().cloned().collect::<Vec<_>>())
            .collect();
        computations.sort_by(|a, b| {
            (&a.key, a.block_height()).cmp(&(&b.key, b.block_height()))
        });

        StoreSnapshot {
            blocks: self
                .blocks
                .read()
                .iter()
                .map(|(height, time)| Block::new(*height, *time))
                .collect(),
            contracts,
            events: self.events.read().all().cloned().collect(),
            transformations: self.transformations.read().all().cloned().collect(),
            computations,
        }
    }

    pub fn from_snapshot(snapshot: StoreSnapshot) -> Self {
        let store = MemoryStore::new();
        {
            let mut blocks = store.blocks.write();
            for block in snapshot.blocks {
                blocks.insert(block.height, block.time_unix_ms);
            }
        }
        for contract in snapshot.contracts {
            store.contracts.insert(contract.address.clone(), contract);
        }
        {
            let mut events = store.events.write();
            for event in snapshot.events {
                let (contract, key, height) =
                    (event.contract_address.clone(), event.key.clone(), event.block_height);
                events.upsert(&contract, &key, height, event);
            }
        }
        {
            let mut transformations = store.transformations.write();
            for t in snapshot.transformations {
                let (contract, name, height) =
                    (t.contract_address.clone(), t.name.clone(), t.block_height);
                transformations.upsert(&contract, &name, height, t);
            }
        }
        for computation in snapshot.computations {
            store
                .computations
                .entry(computation.key.clone())
                .or_default()
                .insert(computation.block_height(), computation);
        }
        store
    }
}

impl EventStore for MemoryStore {
    fn upsert_events(&self, events: &[Event]) -> Result<usize, StoreError> {
        let mut table = self.events.write();
        let new = events
            .iter()
            .filter(|event| {
                table.upsert(
                    &event.contract_address,
                    &event.key,
                    event.block_height,
                    (*event).clone(),
                )
            })
            .count();
        Ok(new)
    }

    fn latest_event(
        &self,
        contract: &str,
        key: &str,
        max_height: u64,
    ) -> Result<Option<Event>, StoreError> {
        let table = self.events.read();
        Ok(table
            .versions(contract, key)
            .and_then(|versions| versions.range(..=max_height).next_back())
            .map(|(_, event)| event.clone()))
    }

    fn first_set_event(
        &self,
        contract: &str,
        key: &str,
        max_height: u64,
        filter: Option<&ValueFilter>,
    ) -> Result<Option<Event>, StoreError> {
        let table = self.events.read();
        Ok(table.versions(contract, key).and_then(|versions| {
            versions
                .range(..=max_height)
                .map(|(_, event)| event)
                .find(|event| {
                    !event.delete
                        && filter.map_or(true, |f| {
                            event.value.as_ref().is_some_and(|v| f.matches(v))
                        })
                })
                .cloned()
        }))
    }

    fn latest_events_with_prefix(
        &self,
        contract: &str,
        prefix: &str,
        max_height: u64,
    ) -> Result<Vec<Event>, StoreError> {
        let table = self.events.read();
        let pattern = KeyPattern::Prefix(prefix.to_string());
        Ok(table
            .matching(Some(contract), &pattern)
            .into_iter()
            .filter_map(|(_, versions)| versions.range(..=max_height).next_back())
            .map(|(_, event)| event.clone())
            .collect())
    }

    fn prefetch_latest_events(
        &self,
        contract: &str,
        keys: &[String],
        prefixes: &[String],
        max_height: u64,
    ) -> Result<Vec<Event>, StoreError> {
        let table = self.events.read();
        let mut found: BTreeMap<&str, &Event> = BTreeMap::new();

        for key in keys {
            if let Some((_, event)) = table
                .versions(contract, key)
                .and_then(|versions| versions.range(..=max_height).next_back())
            {
                found.insert(event.key.as_str(), event);
            }
        }
        for prefix in prefixes {
            let pattern = KeyPattern::Prefix(prefix.clone());
            for (_, versions) in table.matching(Some(contract), &pattern) {
                if let Some((_, event)) = versions.range(..=max_height).next_back() {
                    found.insert(event.key.as_str(), event);
                }
            }
        }

        Ok(found.into_values().cloned().collect())
    }

    fn first_event_matching(
        &self,
        dependents: &[DependentKey],
        from: u64,
        to: u64,
    ) -> Result<Option<Event>, StoreError> {
        Ok(self
            .events
            .read()
            .first_change(dependents, from, to)
            .cloned())
    }

    fn event_count(&self) -> usize {
        self.events.read().len()
    }
}

impl TransformationStore for MemoryStore {
    fn upsert_transformations(
        &self,
        transformations: &[Transformation],
    ) -> Result<usize, StoreError> {
        let mut table = self.transformations.write();
        let new = transformations
            .iter()
            .filter(|t| table.upsert(&t.contract_address, &t.name, t.block_height, (*t).clone()))
            .count();
        Ok(new)
    }

    fn latest_transformation_before(
        &self,
        contract: &str,
        name: &str,
        below_height: u64,
    ) -> Result<Option<Transformation>, StoreError> {
        let table = self.transformations.read();
        Ok(table
            .versions(contract, name)
            .and_then(|versions| versions.range(..below_height).next_back())
            .map(|(_, t)| t.clone()))
    }

    fn latest_transformations_matching(
        &self,
        contract: Option<&str>,
        pattern: &KeyPattern,
        max_height: u64,
        filter: Option<&ValueFilter>,
    ) -> Result<Vec<Transformation>, StoreError> {
        let table = self.transformations.read();
        let mut found: Vec<Transformation> = table
            .matching(contract, pattern)
            .into_iter()
            .filter_map(|(_, versions)| {
                versions
                    .range(..=max_height)
                    .rev()
                    .map(|(_, t)| t)
                    .find(|t| filter.map_or(true, |f| f.matches(&t.value)))
            })
            .cloned()
            .collect();
        found.sort_by(|a, b| {
            (&a.name, &a.contract_address).cmp(&(&b.name, &b.contract_address))
        });
        Ok(found)
    }

    fn first_transformation_matching(
        &self,
        dependents: &[DependentKey],
        from: u64,
        to: u64,
    ) -> Result<Option<Transformation>, StoreError> {
        Ok(self
            .transformations
            .read()
            .first_change(dependents, from, to)
            .cloned())
    }

    fn transformation_count(&self) -> usize {
        self.transformations.read().len()
    }
}

impl ContractStore for MemoryStore {
    fn upsert_contracts(&self, contracts: &[Contract]) -> Result<(), StoreError> {
        for contract in contracts {
            self.contracts
                .insert(contract.address.clone(), contract.clone());
        }
        Ok(())
    }

    fn contract(&self, address: &str) -> Result<Option<Contract>, StoreError> {
        Ok(self.contracts.get(address).map(|c| c.value().clone()))
    }
}

impl BlockStore for MemoryStore {
    fn record_blocks(&self, blocks: &[Block]) -> Result<(), StoreError> {
        let mut known = self.blocks.write();
        for block in blocks {
            known.insert(block.height, block.time_unix_ms);
        }
        Ok(())
    }

    fn latest_block(&self) -> Result<Option<Block>, StoreError> {
        Ok(self
            .blocks
            .read()
            .last_key_value()
            .map(|(height, time)| Block::new(*height, *time)))
    }

    fn block_at_or_below(&self, height: u64) -> Result<Option<Block>, StoreError> {
        Ok(self
            .blocks
            .read()
            .range(..=height)
            .next_back()
            .map(|(height, time)| Block::new(*height, *time)))
    }
}

impl ComputationStore for MemoryStore {
    fn upsert_computation(&self, computation: &Computation) -> Result<(), StoreError> {
        self.computations
            .entry(computation.key.clone())
            .or_default()
            .insert(computation.block_height(), computation.clone());
        Ok(())
    }

    fn latest_computation(
        &self,
        key: &ComputationKey,
        max_height: u64,
    ) -> Result<Option<Computation>, StoreError> {
        Ok(self.computations.get(key).and_then(|group| {
            group
                .range(..=Some(max_height))
                .next_back()
                .map(|(_, c)| c.clone())
        }))
    }

    fn computations_between(
        &self,
        key: &ComputationKey,
        after: u64,
        to: u64,
    ) -> Result<Vec<Computation>, StoreError> {
        if after >= to {
            return Ok(Vec::new());
        }
        Ok(self
            .computations
            .get(key)
            .map(|group| {
                group
                    .range((Bound::Excluded(Some(after)), Bound::Included(Some(to))))
                    .map(|(_, c)| c.clone())
                    .collect()
            })
            .unwrap_or_default())
    }

    fn remove_computation(
        &self,
        key: &ComputationKey,
        block_height: Option<u64>,
    ) -> Result<bool, StoreError> {
        let removed = match self.computations.get_mut(key) {
            Some(mut group) => group.remove(&block_height).is_some(),
            None => false,
        };
        self.computations.remove_if(key, |_, group| group.is_empty());
        Ok(removed)
    }

    fn computations_matching(
        &self,
        written: &WrittenKeys,
    ) -> Result<Vec<Computation>, StoreError> {
        Ok(self
            .computations
            .iter()
            .flat_map(|group| {
                group
                    .value()
                    .values()
                    .filter(|c| c.depends_on(written))
                    .cloned()
                    .collect::<Vec<_>>()
            })
            .collect())
    }

    fn computation_count(&self) -> usize {
        self.computations.iter().map(|group| group.len()).sum()
    }
}
