//! Formula trait and registry
//!
//! A formula is a pure function of chain state, read through an [`Env`],
//! that produces a JSON value. `Value::Null` means "no value".

use crate::env::{Env, EnvError};
use crate::keys::KeyError;
use crate::store::StoreError;
use serde_json::Value;
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum FormulaError {
    #[error(transparent)]
    Env(#[from] EnvError),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Key(#[from] KeyError),

    #[error("failed to decode value: {0}")]
    Decode(#[from] serde_json::Error),

    #[error("{0}")]
    Failed(String),

    #[error("range computation exceeded {0} evaluations")]
    EvaluationLimit(usize),
}

impl FormulaError {
    pub fn failed(message: impl Into<String>) -> Self {
        FormulaError::Failed(message.into())
    }
}

/// Core trait for formulas
///
/// Formulas must read state only through the env so that their
/// dependencies are recorded.
pub trait Formula: Send + Sync + 'static {
    fn compute(&self, env: &mut Env<'_>) -> Result<Value, FormulaError>;

    /// Whether the output depends on the block itself (height or time)
    /// rather than only on the state read. Dynamic outputs are never cached.
    fn dynamic(&self) -> bool {
        false
    }
}

/// A formula backed by a closure
pub struct FnFormula<F> {
    compute: F,
    dynamic: bool,
}

impl<F> FnFormula<F>
where
    F: Fn(&mut Env<'_>) -> Result<Value, FormulaError> + Send + Sync + 'static,
{
    pub fn new(compute: F) -> Self {
        FnFormula {
            compute,
            dynamic: false,
        }
    }

    pub fn new_dynamic(compute: F) -> Self {
        FnFormula {
            compute,
            dynamic: true,
        }
    }
}

impl<F> fmt::Debug for FnFormula<F> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FnFormula")
            .field("dynamic", &self.dynamic)
            .finish_non_exhaustive()
    }
}

impl<F> Formula for FnFormula<F>
where
    F: Fn(&mut Env<'_>) -> Result<Value, FormulaError> + Send + Sync + 'static,
{
    fn compute(&self, env: &mut Env<'_>) -> Result<Value, FormulaError> {
        (self.compute)(env)
    }

    fn dynamic(&self) -> bool {
        self.dynamic
    }
}

/// Formulas by name
#[derive(Clone, Default)]
pub struct FormulaRegistry {
    formulas: BTreeMap<String, Arc<dyn Formula>>,
}

impl FormulaRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, name: impl Into<String>, formula: impl Formula) -> &mut Self {
        self.formulas.insert(name.into(), Arc::new(formula));
        self
    }

    pub fn register_fn<F>(&mut self, name: impl Into<String>, compute: F) -> &mut Self
    where
        F: Fn(&mut Env<'_>) -> Result<Value, FormulaError> + Send + Sync + 'static,
    {
        self.register(name, FnFormula::new(compute))
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn Formula>> {
        self.formulas.get(name).cloned()
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.formulas.keys().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.formulas.len()
    }

    pub fn is_empty(&self) -> bool {
        self.formulas.is_empty()
    }
}

impl fmt::Debug for FormulaRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list().entries(self.names()).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    struct Constant;

    impl Formula for Constant {
        fn compute(&self, _env: &mut Env<'_>) -> Result<Value, FormulaError> {
            Ok(json!(1))
        }
    }

    #[test]
    fn test_registry() {
        let mut registry = FormulaRegistry::new();
        registry
            .register("constant", Constant)
            .register_fn("height", |env| Ok(json!(env.block().height)))
            .register("now", FnFormula::new_dynamic(|env: &mut Env<'_>| {
                Ok(json!(env.block().height))
            }));

        assert_eq!(registry.len(), 3);
        assert_eq!(registry.names().collect::<Vec<_>>(), vec!["constant", "height", "now"]);
        assert!(!registry.get("constant").unwrap().dynamic());
        assert!(registry.get("now").unwrap().dynamic());
        assert!(registry.get("missing").is_none());
    }
}
