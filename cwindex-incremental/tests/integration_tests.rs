//! Integration tests for the incremental computation engine

use cwindex_incremental::dependency::{DependentKey, Namespace, WrittenKeys};
use cwindex_incremental::env::{KeySpec, MatchOptions, TransformationSpec};
use cwindex_incremental::filter::ValueFilter;
use cwindex_incremental::invalidation::InvalidationBridge;
use cwindex_incremental::keys;
use cwindex_incremental::prelude::*;
use serde_json::{json, Value};
use std::sync::Arc;

fn key(parts: &[&str]) -> String {
    let parts: Vec<KeyPart> = parts.iter().map(|p| KeyPart::from(*p)).collect();
    keys::encode(&parts).unwrap()
}

fn set(contract: &str, parts: &[&str], height: u64, value: Value) -> Event {
    Event {
        contract_address: contract.to_string(),
        block_height: height,
        block_time_unix_ms: height * 1_000,
        key: key(parts),
        value: Some(value),
        delete: false,
    }
}

fn delete(contract: &str, parts: &[&str], height: u64) -> Event {
    Event {
        contract_address: contract.to_string(),
        block_height: height,
        block_time_unix_ms: height * 1_000,
        key: key(parts),
        value: None,
        delete: true,
    }
}

fn transformation(contract: &str, name: &str, height: u64, value: Value) -> Transformation {
    Transformation {
        contract_address: contract.to_string(),
        block_height: height,
        block_time_unix_ms: height * 1_000,
        name: name.to_string(),
        value,
    }
}

fn at(height: u64) -> Block {
    Block::new(height, height * 1_000)
}

struct Foo;

impl Formula for Foo {
    fn compute(&self, env: &mut Env<'_>) -> Result<Value, FormulaError> {
        Ok(env.get("c1", &["foo".into()])?.unwrap_or(Value::Null))
    }
}

#[test]
fn test_get_follows_history() {
    let store = MemoryStore::new();
    let code_ids = CodeIdSets::new();
    store
        .upsert_events(&[
            set("c1", &["foo"], 5, json!("1")),
            set("c1", &["foo"], 10, json!("2")),
            delete("c1", &["foo"], 15),
        ])
        .unwrap();
    let ctx = ComputeContext::new(&store, &code_ids);

    let value_at = |height| {
        let mut env = Env::new(ctx, "c1", &Value::Null, at(height), false);
        env.get("c1", &["foo".into()]).unwrap()
    };
    assert_eq!(value_at(4), None);
    assert_eq!(value_at(7), Some(json!("1")));
    assert_eq!(value_at(12), Some(json!("2")));
    assert_eq!(value_at(20), None);
}

#[test]
fn test_get_map_excludes_deleted_entries() {
    let store = MemoryStore::new();
    let code_ids = CodeIdSets::new();
    store
        .upsert_events(&[
            set("c1", &["bal", "addr1"], 3, json!("10")),
            set("c1", &["bal", "addr2"], 4, json!("20")),
            delete("c1", &["bal", "addr1"], 9),
        ])
        .unwrap();
    let ctx = ComputeContext::new(&store, &code_ids);

    let mut env = Env::new(ctx, "c1", &Value::Null, at(5), false);
    let map = env
        .get_map("c1", &["bal".into()], MapKeyKind::String)
        .unwrap()
        .unwrap();
    assert_eq!(map.len(), 2);
    assert_eq!(map["addr1"], json!("10"));
    assert_eq!(map["addr2"], json!("20"));

    let mut env = Env::new(ctx, "c1", &Value::Null, at(10), false);
    let map = env
        .get_map("c1", &["bal".into()], MapKeyKind::String)
        .unwrap()
        .unwrap();
    assert_eq!(map.len(), 1);
    assert_eq!(map["addr2"], json!("20"));

    // one prefix dependency for the whole map
    let (dependencies, block) = env.finish();
    assert_eq!(dependencies.len(), 1);
    assert!(dependencies[0].is_prefix());
    assert_eq!(block, Some(at(9)));
}

#[test]
fn test_get_map_absent_vs_emptied() {
    let store = MemoryStore::new();
    let code_ids = CodeIdSets::new();
    store
        .upsert_events(&[
            set("c1", &["votes", "a"], 3, json!(1)),
            delete("c1", &["votes", "a"], 6),
        ])
        .unwrap();
    let ctx = ComputeContext::new(&store, &code_ids);

    let mut env = Env::new(ctx, "c1", &Value::Null, at(2), false);
    assert_eq!(
        env.get_map("c1", &["votes".into()], MapKeyKind::String).unwrap(),
        None
    );

    let mut env = Env::new(ctx, "c1", &Value::Null, at(7), false);
    let map = env
        .get_map("c1", &["votes".into()], MapKeyKind::String)
        .unwrap()
        .unwrap();
    assert!(map.is_empty());
}

#[test]
fn test_numeric_map_keys() {
    let store = MemoryStore::new();
    let code_ids = CodeIdSets::new();
    let entry = keys::encode(&["proposals".into(), KeyPart::Num(7)]).unwrap();
    store
        .upsert_events(&[Event {
            contract_address: "c1".to_string(),
            block_height: 1,
            block_time_unix_ms: 1_000,
            key: entry,
            value: Some(json!({"title": "seven"})),
            delete: false,
        }])
        .unwrap();
    let ctx = ComputeContext::new(&store, &code_ids);

    let mut env = Env::new(ctx, "c1", &Value::Null, at(1), false);
    let map = env
        .get_map("c1", &["proposals".into()], MapKeyKind::Number)
        .unwrap()
        .unwrap();
    assert_eq!(map["7"], json!({"title": "seven"}));
}

#[test]
fn test_prefetch_matches_individual_reads() {
    let store = MemoryStore::new();
    let code_ids = CodeIdSets::new();
    store
        .upsert_events(&[
            set("c1", &["config"], 2, json!({"name": "dao"})),
            set("c1", &["bal", "a"], 3, json!(1)),
            set("c1", &["bal", "b"], 4, json!(2)),
            delete("c1", &["bal", "b"], 5),
            delete("c1", &["gone"], 5),
        ])
        .unwrap();
    let ctx = ComputeContext::new(&store, &code_ids);

    let read = |env: &mut Env<'_>| {
        (
            env.get("c1", &["config".into()]).unwrap(),
            env.get("c1", &["gone".into()]).unwrap(),
            env.get("c1", &["missing".into()]).unwrap(),
            env.get("c1", &["bal".into(), "b".into()]).unwrap(),
            env.get_map("c1", &["bal".into()], MapKeyKind::String).unwrap(),
        )
    };

    let mut plain = Env::new(ctx, "c1", &Value::Null, at(6), false);
    let expected = read(&mut plain);

    let mut warmed = Env::new(ctx, "c1", &Value::Null, at(6), false);
    warmed
        .prefetch(
            "c1",
            &[
                KeySpec::Item(vec!["config".into()]),
                KeySpec::Item(vec!["gone".into()]),
                KeySpec::Item(vec!["missing".into()]),
                KeySpec::Map(vec!["bal".into()]),
            ],
        )
        .unwrap();
    assert_eq!(read(&mut warmed), expected);

    let (mut plain_deps, plain_block) = plain.finish();
    let (mut warmed_deps, warmed_block) = warmed.finish();
    plain_deps.sort();
    warmed_deps.sort();
    assert_eq!(plain_block, warmed_block);
    for dependency in &plain_deps {
        assert!(warmed_deps.contains(dependency), "missing {}", dependency);
    }
}

#[test]
fn test_date_getters() {
    let store = MemoryStore::new();
    let code_ids = CodeIdSets::new();
    store
        .upsert_events(&[
            set("c1", &["status"], 3, json!({"state": "pending"})),
            set("c1", &["status"], 6, json!({"state": "open"})),
            delete("c1", &["status"], 9),
        ])
        .unwrap();
    let ctx = ComputeContext::new(&store, &code_ids);
    let mut env = Env::new(ctx, "c1", &Value::Null, at(10), false);
    let parts: Vec<KeyPart> = vec!["status".into()];

    let modified = env.get_date_key_modified("c1", &parts).unwrap().unwrap();
    assert_eq!(modified, at(9).date());

    let first = env.get_date_key_first_set("c1", &parts).unwrap().unwrap();
    assert_eq!(first, at(3).date());

    let open = ValueFilter::new(json!({"state": "open"}));
    let first_open = env
        .get_date_key_first_set_with_value_match("c1", &parts, &open)
        .unwrap()
        .unwrap();
    assert_eq!(first_open, at(6).date());
}

#[test]
fn test_transformation_getters() {
    let store = MemoryStore::new();
    let code_ids: CodeIdSets = [("dao".to_string(), vec![1])].into_iter().collect();
    store
        .upsert_contracts(&[
            Contract {
                address: "dao1".to_string(),
                code_id: 1,
            },
            Contract {
                address: "other".to_string(),
                code_id: 2,
            },
        ])
        .unwrap();
    store
        .upsert_transformations(&[
            transformation("dao1", "proposal:1", 3, json!({"status": "open"})),
            transformation("dao1", "proposal:2", 4, json!({"status": "closed"})),
            transformation("dao1", "proposal:2", 8, json!({"status": "open"})),
            transformation("other", "proposal:1", 5, json!({"status": "open"})),
            transformation("dao1", "member:a", 5, json!(10)),
            transformation("dao1", "member:b", 5, json!(20)),
            transformation("dao1", "member:b", 7, Value::Null),
        ])
        .unwrap();
    let ctx = ComputeContext::new(&store, &code_ids);
    let mut env = Env::new(ctx, "dao1", &Value::Null, at(6), false);

    let all = env
        .get_transformation_matches(None, "proposal:*", &MatchOptions::default())
        .unwrap()
        .unwrap();
    assert_eq!(all.len(), 3);

    let open_in_daos = env
        .get_transformation_matches(
            None,
            "proposal:*",
            &MatchOptions {
                filter: Some(ValueFilter::new(json!({"status": "open"}))),
                code_id_keys: Some(vec!["dao".to_string()]),
                limit: None,
            },
        )
        .unwrap()
        .unwrap();
    assert_eq!(open_in_daos.len(), 1);
    assert_eq!(open_in_daos[0].name, "proposal:1");
    assert_eq!(open_in_daos[0].code_id, Some(1));

    let first = env
        .get_transformation_match(Some("dao1"), "proposal:2")
        .unwrap()
        .unwrap();
    assert_eq!(first.value, json!({"status": "closed"}));

    assert!(env
        .get_transformation_matches(Some("dao1"), "vote:*", &MatchOptions::default())
        .unwrap()
        .is_none());

    let members = env.get_transformation_map("dao1", "member").unwrap().unwrap();
    assert_eq!(members.len(), 2);
    assert_eq!(members["b"], json!(20));

    let mut later = Env::new(ctx, "dao1", &Value::Null, at(8), false);
    later
        .prefetch_transformations("dao1", &[TransformationSpec::Map("member".to_string())])
        .unwrap();
    let members = later.get_transformation_map("dao1", "member").unwrap().unwrap();
    assert_eq!(members.len(), 1);
    assert!(later.contract_matches_code_id_keys("dao1", &["dao"]).unwrap());
    assert!(!later.contract_matches_code_id_keys("other", &["dao"]).unwrap());
}

#[test]
fn test_cache_invalidated_by_new_write() {
    let store = Arc::new(MemoryStore::new());
    let code_ids = CodeIdSets::new();
    let events = vec![set("c1", &["foo"], 5, json!("1"))];
    store.upsert_events(&events).unwrap();

    let ctx = ComputeContext::new(store.as_ref(), &code_ids);
    let cache = ComputationCache::new(store.as_ref());
    let cache_key = ComputationKey::new("c1", "foo", &Value::Null);

    let output = compute(ctx, &Foo, "c1", &Value::Null, at(10)).unwrap();
    cache.record(cache_key.clone(), output, 10, true).unwrap();
    assert!(cache.lookup(&cache_key, 20).unwrap().is_some());

    let bridge = InvalidationBridge::new(store.clone());
    let newer = vec![set("c1", &["foo"], 12, json!("2"))];
    store.upsert_events(&newer).unwrap();
    let summary = bridge.on_written(&newer, &[]).unwrap();
    assert_eq!(summary.computations_invalidated, 1);

    let cached = cache.lookup(&cache_key, 11).unwrap().unwrap();
    assert_eq!(cached.output, json!("1"));
    assert_eq!(cached.latest_block_height_valid, Some(11));
    assert!(cache.lookup(&cache_key, 12).unwrap().is_none());
}

#[test]
fn test_validity_update_is_idempotent() {
    let store = MemoryStore::new();
    let code_ids = CodeIdSets::new();
    store
        .upsert_events(&[
            set("c1", &["foo"], 5, json!("1")),
            set("c1", &["foo"], 9, json!("2")),
        ])
        .unwrap();
    let ctx = ComputeContext::new(&store, &code_ids);
    let cache = ComputationCache::new(&store);
    let cache_key = ComputationKey::new("c1", "foo", &Value::Null);

    let output = compute(ctx, &Foo, "c1", &Value::Null, at(5)).unwrap();
    let mut computation = cache.record(cache_key, output, 5, true).unwrap();

    assert!(!computation.update_validity_up_to(&store, 20, None).unwrap());
    assert_eq!(computation.latest_block_height_valid, Some(8));
    assert!(!computation.update_validity_up_to(&store, 20, None).unwrap());
    assert_eq!(computation.latest_block_height_valid, Some(8));
    assert!(computation.update_validity_up_to(&store, 7, None).unwrap());
    assert_eq!(computation.latest_block_height_valid, Some(8));
}

#[test]
fn test_computation_without_dependencies() {
    let store = MemoryStore::new();
    let code_ids = CodeIdSets::new();
    store.upsert_events(&[set("c1", &["foo"], 5, json!(1))]).unwrap();
    let ctx = ComputeContext::new(&store, &code_ids);
    let constant = FnFormula::new(|_env: &mut Env<'_>| Ok(json!("fixed")));

    let output = compute(ctx, &constant, "c1", &Value::Null, at(3)).unwrap();
    assert!(output.dependencies.is_empty());
    let mut computation = ComputationCache::new(&store)
        .record(ComputationKey::new("c1", "constant", &Value::Null), output, 3, true)
        .unwrap();

    assert!(computation.update_validity_up_to(&store, 1_000, None).unwrap());
    assert_eq!(computation.latest_block_height_valid, Some(1_000));
}

#[test]
fn test_range_evaluates_once_per_change() {
    let store = MemoryStore::new();
    let code_ids = CodeIdSets::new();
    store
        .upsert_events(&[
            set("c1", &["foo"], 10, json!(1)),
            set("c1", &["foo"], 20, json!(2)),
            set("c1", &["foo"], 35, json!(3)),
            set("c1", &["unrelated"], 25, json!(0)),
        ])
        .unwrap();
    let ctx = ComputeContext::new(&store, &code_ids);

    let range = RangeComputer::new(ctx)
        .compute(&Foo, "c1", &Value::Null, at(0), 50)
        .unwrap();
    let values: Vec<_> = range.outputs.iter().map(|o| o.value.clone()).collect();
    assert_eq!(values, vec![Value::Null, json!(1), json!(2), json!(3)]);
    assert!(range.evaluations <= 5);

    let windows: Vec<_> = range
        .outputs
        .iter()
        .map(|o| (o.at, o.latest_block_height_valid))
        .collect();
    assert_eq!(windows, vec![(0, 9), (10, 19), (20, 34), (35, 50)]);
}

#[test]
fn test_pipeline_feeds_invalidation() {
    let store = Arc::new(MemoryStore::new());
    let code_ids: CodeIdSets = [("dao".to_string(), vec![1])].into_iter().collect();
    let mut registry = cwindex_incremental::TransformerRegistry::new();
    registry.register(
        Transformer::new(ContractFilter::CodeIdKeys(vec!["dao".into()]), "config")
            .matching(|e| e.key == key(&["config"])),
    );
    let pipeline = TransformationPipeline::new(&registry, &code_ids);

    let raw = |height: u64, value: Value| RawEvent {
        code_id: 1,
        contract_address: "dao1".to_string(),
        block_height: height,
        block_time_unix_ms: height * 1_000,
        key: key(&["config"]),
        value: Some(value),
        delete: false,
    };

    let (first, created) = pipeline
        .run(store.as_ref(), &[raw(2, json!({"name": "a"}))])
        .unwrap();
    assert_eq!(created, 1);

    let reader = FnFormula::new(|env: &mut Env<'_>| {
        Ok(env
            .get_transformation_match(Some("dao1"), "config")?
            .map_or(Value::Null, |m| m.value))
    });
    let ctx = ComputeContext::new(store.as_ref(), &code_ids);
    let output = compute(ctx, &reader, "dao1", &Value::Null, at(4)).unwrap();
    assert_eq!(output.value, json!({"name": "a"}));
    assert_eq!(
        output.dependencies,
        vec![DependentKey::pattern(Namespace::Transformation, Some("dao1"), "config")]
    );
    let cache_key = ComputationKey::new("dao1", "config", &Value::Null);
    ComputationCache::new(store.as_ref())
        .record(cache_key.clone(), output, 4, true)
        .unwrap();

    let (second, _) = pipeline
        .run(store.as_ref(), &[raw(6, json!({"name": "b"}))])
        .unwrap();
    let written = WrittenKeys::from_rows(&[], &second);
    let summary =
        cwindex_incremental::invalidate_dependent_computations(store.as_ref(), &written).unwrap();
    assert_eq!(summary.computations_extended, 0);

    let stored = store.latest_computation(&cache_key, 10).unwrap().unwrap();
    assert_eq!(stored.latest_block_height_valid, Some(5));
    assert_eq!(first[0].block_height, 2);
}
