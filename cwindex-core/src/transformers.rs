//! Builders for common transformer shapes.
//!
//! Most derived values are either a plain storage item copied under a
//! name, every entry of a storage map copied under `name:<entry key>`, or a
//! map used as a set (empty values) collapsed into one list.

use crate::config::TransformerConfig;
use cwindex_incremental::keys::{self, KeyError, KeyPart, KeyPartKind};
use cwindex_incremental::transform::{
    ContractFilter, TransformError, Transformer, TransformerRegistry,
};
use serde_json::Value;

fn contract_filter(code_id_keys: Option<&[String]>) -> ContractFilter {
    match code_id_keys {
        Some(keys) => ContractFilter::CodeIdKeys(keys.to_vec()),
        None => ContractFilter::Any,
    }
}

fn parts(path: &[String]) -> Vec<KeyPart> {
    path.iter().map(KeyPart::from).collect()
}

/// Copy the value of any of `key_paths` (default `[name]`) under `name`.
pub fn item(
    code_id_keys: Option<&[String]>,
    name: &str,
    key_paths: &[Vec<String>],
) -> Result<Transformer, KeyError> {
    let encoded: Vec<String> = if key_paths.is_empty() {
        vec![keys::encode(&[KeyPart::from(name)])?]
    } else {
        key_paths
            .iter()
            .map(|path| keys::encode(&parts(path)))
            .collect::<Result<_, _>>()?
    };

    Ok(Transformer::new(contract_filter(code_id_keys), name)
        .matching(move |event| encoded.contains(&event.key)))
}

/// Copy every entry of the maps under `prefixes` to `name:<entry key>`.
pub fn map(
    code_id_keys: Option<&[String]>,
    name: &str,
    prefixes: &[Vec<String>],
    numeric_key: bool,
) -> Result<Transformer, KeyError> {
    let prefixes: Vec<(String, usize)> = prefixes
        .iter()
        .map(|path| Ok((keys::encode_map_prefix(&parts(path))?, path.len())))
        .collect::<Result<_, KeyError>>()?;
    let matchers = prefixes.clone();
    let map_name = name.to_string();

    let transformer = Transformer::derived(name, contract_filter(code_id_keys), move |event| {
        let Some((_, depth)) = prefixes
            .iter()
            .find(|(prefix, _)| event.key.starts_with(prefix.as_str()))
        else {
            return Ok(None);
        };
        let mut kinds = vec![KeyPartKind::String; *depth];
        kinds.push(if numeric_key {
            KeyPartKind::Number
        } else {
            KeyPartKind::String
        });
        let decoded = keys::decode_typed(&event.key, &kinds)?;
        Ok(decoded
            .last()
            .map(|entry| format!("{}:{}", map_name, entry)))
    });

    Ok(transformer.matching(move |event| {
        matchers
            .iter()
            .any(|(prefix, _)| event.key.starts_with(prefix.as_str()))
    }))
}

/// Keep the entry keys of the map at `map_path` as a list under `name`.
pub fn map_list(
    code_id_keys: Option<&[String]>,
    name: &str,
    map_path: &[String],
) -> Result<Transformer, KeyError> {
    let prefix = keys::encode_map_prefix(&parts(map_path))?;
    let depth = map_path.len();
    let matcher = prefix.clone();

    Ok(Transformer::new(contract_filter(code_id_keys), name)
        .matching(move |event| event.key.starts_with(matcher.as_str()))
        .transform_deletes()
        .with_value(move |event, previous| {
            let kinds = vec![KeyPartKind::String; depth + 1];
            let entry = keys::decode_typed(&event.key, &kinds)?
                .last()
                .map(|part| Value::String(part.to_string()))
                .ok_or_else(|| TransformError::Invalid(format!("empty key {}", event.key)))?;

            let mut list = match previous.get()? {
                Value::Null => Vec::new(),
                Value::Array(items) => items,
                other => {
                    return Err(TransformError::Invalid(format!(
                        "expected array under {}, got {}",
                        prefix, other
                    )))
                }
            };

            let position = list.iter().position(|item| item == &entry);
            match (event.delete, position) {
                (true, Some(index)) => {
                    list.remove(index);
                }
                (false, None) => list.push(entry),
                _ => {}
            }
            Ok(Some(Value::Array(list)))
        }))
}

pub fn from_config(config: &TransformerConfig) -> Result<Transformer, KeyError> {
    match config {
        TransformerConfig::Item {
            name,
            code_id_keys,
            keys,
        } => item(code_id_keys.as_deref(), name, keys),
        TransformerConfig::Map {
            name,
            code_id_keys,
            prefixes,
            numeric_key,
        } => map(code_id_keys.as_deref(), name, prefixes, *numeric_key),
        TransformerConfig::MapList {
            name,
            code_id_keys,
            map,
        } => map_list(code_id_keys.as_deref(), name, map),
    }
}

pub fn registry_from_config(configs: &[TransformerConfig]) -> Result<TransformerRegistry, KeyError> {
    configs.iter().map(from_config).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use cwindex_incremental::db::MemoryStore;
    use cwindex_incremental::TransformationPipeline;
    use cwindex_types::{CodeIdSets, RawEvent, Transformation};
    use serde_json::json;

    fn raw(key: Vec<KeyPart>, height: u64, value: Option<Value>) -> RawEvent {
        RawEvent {
            code_id: 1,
            contract_address: "dao1".to_string(),
            block_height: height,
            block_time_unix_ms: height * 1_000,
            key: keys::encode(&key).unwrap(),
            delete: value.is_none(),
            value,
        }
    }

    fn code_ids() -> CodeIdSets {
        [("dao".to_string(), vec![1])].into_iter().collect()
    }

    fn run(transformer: Transformer, events: &[RawEvent]) -> Vec<Transformation> {
        let store = MemoryStore::new();
        let registry: TransformerRegistry = vec![transformer].into_iter().collect();
        TransformationPipeline::new(&registry, &code_ids())
            .run(&store, events)
            .unwrap()
            .0
    }

    #[test]
    fn test_item_defaults_to_own_name() {
        let dao = vec!["dao".to_string()];
        let transformer = item(Some(dao.as_slice()), "config", &[]).unwrap();
        let out = run(
            transformer,
            &[
                raw(vec!["config".into()], 1, Some(json!({"name": "a"}))),
                raw(vec!["other".into()], 1, Some(json!(1))),
                raw(vec!["config".into()], 2, Some(Value::Null)),
            ],
        );

        assert_eq!(out.len(), 2);
        assert_eq!(out[0].name, "config");
        assert_eq!(out[1].value, Value::Null);
    }

    #[test]
    fn test_map_names_entries() {
        let prefixes = vec![vec!["members".to_string()]];
        let transformer = map(None, "member", &prefixes, false).unwrap();
        let out = run(
            transformer,
            &[
                raw(vec!["members".into(), "addr1".into()], 1, Some(json!(10))),
                raw(vec!["members".into(), "addr2".into()], 1, Some(json!(20))),
                raw(vec!["members".into(), "addr1".into()], 2, None),
            ],
        );

        let names: Vec<_> = out.iter().map(|t| (t.name.as_str(), t.value.clone())).collect();
        assert_eq!(
            names,
            vec![
                ("member:addr1", json!(10)),
                ("member:addr2", json!(20)),
                ("member:addr1", Value::Null),
            ]
        );
    }

    #[test]
    fn test_map_numeric_keys() {
        let prefixes = vec![vec!["proposals".to_string()]];
        let transformer = map(None, "proposal", &prefixes, true).unwrap();
        let out = run(
            transformer,
            &[raw(vec!["proposals".into(), KeyPart::Num(3)], 1, Some(json!({"id": 3})))],
        );
        assert_eq!(out[0].name, "proposal:3");
    }

    #[test]
    fn test_map_list_tracks_set() {
        let path = vec!["voters".to_string()];
        let transformer = map_list(None, "voters", &path).unwrap();
        let out = run(
            transformer,
            &[
                raw(vec!["voters".into(), "a".into()], 1, Some(json!({}))),
                raw(vec!["voters".into(), "b".into()], 2, Some(json!({}))),
                raw(vec!["voters".into(), "a".into()], 3, None),
            ],
        );

        let values: Vec<_> = out.iter().map(|t| t.value.clone()).collect();
        assert_eq!(values, vec![json!(["a"]), json!(["a", "b"]), json!(["b"])]);
    }

    #[test]
    fn test_registry_from_config() {
        let configs = vec![
            TransformerConfig::Item {
                name: "config".into(),
                code_id_keys: None,
                keys: vec![],
            },
            TransformerConfig::MapList {
                name: "voters".into(),
                code_id_keys: Some(vec!["dao".into()]),
                map: vec!["voters".into()],
            },
        ];
        let registry = registry_from_config(&configs).unwrap();
        assert_eq!(registry.len(), 2);
        assert_eq!(registry.iter().nth(1).map(|t| t.label()), Some("voters"));
    }
}
