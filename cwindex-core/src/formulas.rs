//! Built-in generic formulas.
//!
//! These read raw state and transformations of the target contract with
//! the key or name given in the arguments. Domain-specific formulas are
//! registered by embedders on top of these.

use cwindex_incremental::env::{Env, MapKeyKind, MatchOptions};
use cwindex_incremental::filter::ValueFilter;
use cwindex_incremental::formula::{FnFormula, FormulaError, FormulaRegistry};
use cwindex_incremental::keys::KeyPart;
use cwindex_types::Expiration;
use serde_json::{json, Value};

/// Storage key parts from a JSON array of strings and non-negative integers.
pub fn key_parts(value: &Value) -> Result<Vec<KeyPart>, FormulaError> {
    let parts = match value {
        Value::String(s) => return Ok(vec![KeyPart::from(s.as_str())]),
        Value::Array(parts) => parts,
        other => return Err(FormulaError::failed(format!("invalid key {}", other))),
    };
    parts
        .iter()
        .map(|part| match part {
            Value::String(s) => Ok(KeyPart::from(s.as_str())),
            Value::Number(n) => n
                .as_u64()
                .map(KeyPart::Num)
                .ok_or_else(|| FormulaError::failed(format!("invalid key part {}", n))),
            other => Err(FormulaError::failed(format!("invalid key part {}", other))),
        })
        .collect()
}

fn key_arg(env: &Env<'_>, name: &str) -> Result<Vec<KeyPart>, FormulaError> {
    key_parts(&env.arg::<Value>(name)?)
}

fn item(env: &mut Env<'_>) -> Result<Value, FormulaError> {
    let key = key_arg(env, "key")?;
    let target = env.target().to_string();
    Ok(env.get(&target, &key)?.unwrap_or(Value::Null))
}

fn map(env: &mut Env<'_>) -> Result<Value, FormulaError> {
    let name = key_arg(env, "name")?;
    let kind = if env.arg_opt::<bool>("numeric")?.unwrap_or(false) {
        MapKeyKind::Number
    } else {
        MapKeyKind::String
    };
    let target = env.target().to_string();
    Ok(env
        .get_map(&target, &name, kind)?
        .map_or(Value::Null, |map| json!(map)))
}

fn transformation(env: &mut Env<'_>) -> Result<Value, FormulaError> {
    let name: String = env.arg("name")?;
    let target = env.target().to_string();
    Ok(env
        .get_transformation_match(Some(&target), &name)?
        .map_or(Value::Null, |found| found.value))
}

/// Latest transformations matching a name pattern, across contracts unless
/// `contract` is given.
fn transformation_matches(env: &mut Env<'_>) -> Result<Value, FormulaError> {
    let name: String = env.arg("name")?;
    let contract: Option<String> = env.arg_opt("contract")?;
    let options = MatchOptions {
        filter: env.arg_opt::<Value>("filter")?.map(ValueFilter::new),
        code_id_keys: env.arg_opt("code_id_keys")?,
        limit: env.arg_opt("limit")?,
    };
    let matches = env.get_transformation_matches(contract.as_deref(), &name, &options)?;
    Ok(matches.map_or(Value::Null, |matches| json!(matches)))
}

fn transformation_map(env: &mut Env<'_>) -> Result<Value, FormulaError> {
    let prefix: String = env.arg("prefix")?;
    let target = env.target().to_string();
    Ok(env
        .get_transformation_map(&target, &prefix)?
        .map_or(Value::Null, |map| json!(map)))
}

fn key_modified(env: &mut Env<'_>) -> Result<Value, FormulaError> {
    let key = key_arg(env, "key")?;
    let target = env.target().to_string();
    Ok(env
        .get_date_key_modified(&target, &key)?
        .map_or(Value::Null, |date| json!(date.to_rfc3339())))
}

fn key_first_set(env: &mut Env<'_>) -> Result<Value, FormulaError> {
    let key = key_arg(env, "key")?;
    let filter = env.arg_opt::<Value>("filter")?.map(ValueFilter::new);
    let target = env.target().to_string();
    let date = match &filter {
        Some(filter) => env.get_date_key_first_set_with_value_match(&target, &key, filter)?,
        None => env.get_date_key_first_set(&target, &key)?,
    };
    Ok(date.map_or(Value::Null, |date| json!(date.to_rfc3339())))
}

/// Whether the expiration stored under `key` has passed at the current block.
fn expired(env: &mut Env<'_>) -> Result<Value, FormulaError> {
    let key = key_arg(env, "key")?;
    let target = env.target().to_string();
    let expiration: Option<Expiration> = env.get_as(&target, &key)?;
    let block = env.block();
    Ok(expiration.map_or(Value::Null, |expiration| {
        json!(expiration.is_expired(&block))
    }))
}

/// Registry with every built-in formula
pub fn builtin() -> FormulaRegistry {
    let mut registry = FormulaRegistry::new();
    registry
        .register_fn("item", item)
        .register_fn("map", map)
        .register_fn("transformation", transformation)
        .register_fn("transformation_matches", transformation_matches)
        .register_fn("transformation_map", transformation_map)
        .register_fn("key_modified", key_modified)
        .register_fn("key_first_set", key_first_set)
        .register("expired", FnFormula::new_dynamic(expired));
    registry
}
