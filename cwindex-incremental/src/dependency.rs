//! Dependent keys
//!
//! A [`DependentKey`] describes a set of storage writes that a computation
//! read from: one exact key, every key matching a `*` pattern, or every key
//! under a prefix. Written rows are described by [`WrittenKey`], and a
//! computation must be reconsidered whenever a written key is matched by any
//! of its dependent keys.

use cwindex_types::{Event, Transformation};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// Which table a key lives in
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Namespace {
    /// Raw contract state events
    Event,
    /// Derived transformations
    Transformation,
}

impl Namespace {
    pub fn as_str(&self) -> &'static str {
        match self {
            Namespace::Event => "wasm",
            Namespace::Transformation => "transformation",
        }
    }
}

impl fmt::Display for Namespace {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// How a dependent key matches written keys
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(tag = "shape", content = "key", rename_all = "snake_case")]
pub enum KeyPattern {
    /// One concrete key
    Exact(String),
    /// `*` matches any run of characters, including none
    Wildcard(String),
    /// Any key starting with the pattern; the pattern may contain `*`
    Prefix(String),
}

impl KeyPattern {
    /// `Exact` for plain text, `Wildcard` when it contains `*`.
    pub fn parse(pattern: &str) -> Self {
        if pattern.contains('*') {
            KeyPattern::Wildcard(pattern.to_string())
        } else {
            KeyPattern::Exact(pattern.to_string())
        }
    }

    pub fn as_str(&self) -> &str {
        match self {
            KeyPattern::Exact(k) | KeyPattern::Wildcard(k) | KeyPattern::Prefix(k) => k,
        }
    }

    /// The text every matching key must start with.
    pub fn literal_prefix(&self) -> &str {
        let text = self.as_str();
        match self {
            KeyPattern::Exact(_) => text,
            _ => text.split('*').next().unwrap_or_default(),
        }
    }

    pub fn matches(&self, key: &str) -> bool {
        match self {
            KeyPattern::Exact(k) => k == key,
            KeyPattern::Wildcard(p) => glob_matches(p, key, true),
            KeyPattern::Prefix(p) => glob_matches(p, key, false),
        }
    }
}

fn glob_matches(pattern: &str, text: &str, anchored_end: bool) -> bool {
    let mut segments = pattern.split('*');
    let first = segments.next().unwrap_or_default();
    let Some(mut rest) = text.strip_prefix(first) else {
        return false;
    };

    let remaining: Vec<&str> = segments.collect();
    let Some((last, middle)) = remaining.split_last() else {
        return !anchored_end || rest.is_empty();
    };

    for segment in middle {
        match rest.find(segment) {
            Some(i) => rest = &rest[i + segment.len()..],
            None => return false,
        }
    }

    if anchored_end {
        rest.ends_with(last)
    } else {
        rest.contains(last)
    }
}

/// A set of keys a computation read from.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct DependentKey {
    pub namespace: Namespace,
    /// `None` matches writes by any contract.
    pub contract: Option<String>,
    pub pattern: KeyPattern,
}

impl DependentKey {
    pub fn exact(namespace: Namespace, contract: &str, key: &str) -> Self {
        Self {
            namespace,
            contract: Some(contract.to_string()),
            pattern: KeyPattern::Exact(key.to_string()),
        }
    }

    pub fn prefix(namespace: Namespace, contract: &str, prefix: &str) -> Self {
        Self {
            namespace,
            contract: Some(contract.to_string()),
            pattern: KeyPattern::Prefix(prefix.to_string()),
        }
    }

    /// Keys matching `pattern`, optionally restricted to one contract.
    pub fn pattern(namespace: Namespace, contract: Option<&str>, pattern: &str) -> Self {
        Self {
            namespace,
            contract: contract.map(str::to_string),
            pattern: KeyPattern::parse(pattern),
        }
    }

    pub fn is_prefix(&self) -> bool {
        matches!(self.pattern, KeyPattern::Prefix(_))
    }

    pub fn matches(&self, written: &WrittenKey) -> bool {
        self.namespace == written.namespace
            && self
                .contract
                .as_deref()
                .map_or(true, |c| c == written.contract)
            && self.pattern.matches(&written.key)
    }
}

/// `namespace:contract:key`, with `*` for any contract. Prefix keys render
/// with a trailing `*`.
impl fmt::Display for DependentKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}:{}:{}",
            self.namespace,
            self.contract.as_deref().unwrap_or("*"),
            self.pattern.as_str()
        )?;
        if self.is_prefix() {
            f.write_str("*")?;
        }
        Ok(())
    }
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("invalid dependent key {0:?}")]
pub struct ParseDependentKeyError(String);

/// Parses the textual form. The result is an exact or wildcard key; a
/// trailing `*` is kept as part of a wildcard pattern.
impl FromStr for DependentKey {
    type Err = ParseDependentKeyError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut split = s.splitn(3, ':');
        let (Some(namespace), Some(contract), Some(key)) = (split.next(), split.next(), split.next())
        else {
            return Err(ParseDependentKeyError(s.to_string()));
        };
        let namespace = match namespace {
            "wasm" => Namespace::Event,
            "transformation" => Namespace::Transformation,
            _ => return Err(ParseDependentKeyError(s.to_string())),
        };
        let contract = (contract != "*").then_some(contract);
        Ok(DependentKey::pattern(namespace, contract, key))
    }
}

/// A concrete key that was written by a batch
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct WrittenKey {
    pub namespace: Namespace,
    pub contract: String,
    pub key: String,
}

impl From<&Event> for WrittenKey {
    fn from(event: &Event) -> Self {
        WrittenKey {
            namespace: Namespace::Event,
            contract: event.contract_address.clone(),
            key: event.key.clone(),
        }
    }
}

impl From<&Transformation> for WrittenKey {
    fn from(transformation: &Transformation) -> Self {
        WrittenKey {
            namespace: Namespace::Transformation,
            contract: transformation.contract_address.clone(),
            key: transformation.name.clone(),
        }
    }
}

/// Written keys of one batch, grouped by namespace and contract, together
/// with the height range they span.
#[derive(Debug, Clone, Default)]
pub struct WrittenKeys {
    by_scope: HashMap<(Namespace, String), HashSet<String>>,
    heights: Option<(u64, u64)>,
}

impl WrittenKeys {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_rows(events: &[Event], transformations: &[Transformation]) -> Self {
        let mut written = Self::new();
        for event in events {
            written.insert(WrittenKey::from(event), event.block_height);
        }
        for transformation in transformations {
            written.insert(WrittenKey::from(transformation), transformation.block_height);
        }
        written
    }

    pub fn insert(&mut self, key: WrittenKey, height: u64) {
        self.by_scope
            .entry((key.namespace, key.contract))
            .or_default()
            .insert(key.key);
        self.heights = Some(match self.heights {
            Some((earliest, latest)) => (earliest.min(height), latest.max(height)),
            None => (height, height),
        });
    }

    pub fn is_empty(&self) -> bool {
        self.by_scope.is_empty()
    }

    /// Earliest and latest written heights
    pub fn height_range(&self) -> Option<(u64, u64)> {
        self.heights
    }

    /// Whether any written key falls under `dependent`.
    pub fn matched_by(&self, dependent: &DependentKey) -> bool {
        match &dependent.contract {
            Some(contract) => self
                .by_scope
                .get(&(dependent.namespace, contract.clone()))
                .is_some_and(|keys| keys_match(keys, &dependent.pattern)),
            None => self
                .by_scope
                .iter()
                .filter(|((namespace, _), _)| *namespace == dependent.namespace)
                .any(|(_, keys)| keys_match(keys, &dependent.pattern)),
        }
    }
}

fn keys_match(keys: &HashSet<String>, pattern: &KeyPattern) -> bool {
    match pattern {
        KeyPattern::Exact(key) => keys.contains(key),
        _ => keys.iter().any(|key| pattern.matches(key)),
    }
}

/// Dependent keys in first-seen order, without duplicates
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DependencySet {
    keys: Vec<DependentKey>,
    seen: HashSet<DependentKey>,
}

impl DependencySet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns `true` if the key was not already present.
    pub fn insert(&mut self, key: DependentKey) -> bool {
        if self.seen.contains(&key) {
            return false;
        }
        self.seen.insert(key.clone());
        self.keys.push(key);
        true
    }

    pub fn contains(&self, key: &DependentKey) -> bool {
        self.seen.contains(key)
    }

    pub fn iter(&self) -> impl Iterator<Item = &DependentKey> {
        self.keys.iter()
    }

    pub fn len(&self) -> usize {
        self.keys.len()
    }

    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }

    pub fn into_vec(self) -> Vec<DependentKey> {
        self.keys
    }
}

impl Extend<DependentKey> for DependencySet {
    fn extend<T: IntoIterator<Item = DependentKey>>(&mut self, iter: T) {
        for key in iter {
            self.insert(key);
        }
    }
}

impl FromIterator<DependentKey> for DependencySet {
    fn from_iter<T: IntoIterator<Item = DependentKey>>(iter: T) -> Self {
        let mut set = Self::new();
        set.extend(iter);
        set
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn written(namespace: Namespace, contract: &str, key: &str) -> WrittenKey {
        WrittenKey {
            namespace,
            contract: contract.to_string(),
            key: key.to_string(),
        }
    }

    #[test]
    fn test_exact_match() {
        let dep = DependentKey::exact(Namespace::Event, "c1", "1,2,3");
        assert!(dep.matches(&written(Namespace::Event, "c1", "1,2,3")));
        assert!(!dep.matches(&written(Namespace::Event, "c1", "1,2,3,4")));
        assert!(!dep.matches(&written(Namespace::Event, "c2", "1,2,3")));
        assert!(!dep.matches(&written(Namespace::Transformation, "c1", "1,2,3")));
    }

    #[test]
    fn test_prefix_match() {
        let dep = DependentKey::prefix(Namespace::Event, "c1", "0,3,98,97,108,");
        assert!(dep.matches(&written(Namespace::Event, "c1", "0,3,98,97,108,120")));
        assert!(!dep.matches(&written(Namespace::Event, "c1", "0,3,98,97,109,120")));
    }

    #[test]
    fn test_wildcard_match() {
        let dep = DependentKey::pattern(Namespace::Transformation, None, "proposal:*");
        assert!(dep.matches(&written(Namespace::Transformation, "c1", "proposal:1")));
        assert!(dep.matches(&written(Namespace::Transformation, "c9", "proposal:")));
        assert!(!dep.matches(&written(Namespace::Transformation, "c1", "vote:1")));

        let middle = KeyPattern::parse("a*c*e");
        assert!(middle.matches("abcde"));
        assert!(middle.matches("ace"));
        assert!(!middle.matches("abcdef"));
    }

    #[test]
    fn test_prefix_with_wildcard() {
        let pattern = KeyPattern::Prefix("vote:*:".to_string());
        assert!(pattern.matches("vote:3:juno1a"));
        assert!(!pattern.matches("vote3"));
        assert_eq!(pattern.literal_prefix(), "vote:");
    }

    #[test]
    fn test_text_form() {
        let dep = DependentKey::pattern(Namespace::Transformation, None, "proposal:*");
        assert_eq!(dep.to_string(), "transformation:*:proposal:*");
        let parsed: DependentKey = dep.to_string().parse().unwrap();
        assert_eq!(parsed, dep);

        let exact = DependentKey::exact(Namespace::Event, "c1", "1,2");
        assert_eq!(exact.to_string(), "wasm:c1:1,2");
        assert_eq!("wasm:c1:1,2".parse::<DependentKey>().unwrap(), exact);

        assert!("bogus:c1:1".parse::<DependentKey>().is_err());
        assert!("wasm:c1".parse::<DependentKey>().is_err());
    }

    #[test]
    fn test_written_keys_matching() {
        let mut keys = WrittenKeys::new();
        keys.insert(written(Namespace::Event, "c1", "1,2"), 12);
        keys.insert(written(Namespace::Transformation, "c2", "proposal:4"), 10);

        assert_eq!(keys.height_range(), Some((10, 12)));
        assert!(keys.matched_by(&DependentKey::exact(Namespace::Event, "c1", "1,2")));
        assert!(!keys.matched_by(&DependentKey::exact(Namespace::Event, "c2", "1,2")));
        assert!(keys.matched_by(&DependentKey::pattern(
            Namespace::Transformation,
            None,
            "proposal:*"
        )));
        assert!(!keys.matched_by(&DependentKey::pattern(Namespace::Event, None, "proposal:*")));
    }

    #[test]
    fn test_dependency_set_dedup() {
        let a = DependentKey::exact(Namespace::Event, "c1", "1");
        let b = DependentKey::exact(Namespace::Event, "c1", "2");
        let set: DependencySet = vec![a.clone(), b.clone(), a.clone()].into_iter().collect();
        assert_eq!(set.len(), 2);
        assert_eq!(set.into_vec(), vec![a, b]);
    }
}
