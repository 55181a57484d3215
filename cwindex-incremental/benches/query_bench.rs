//! Benchmarks for the key codec, state reads and range computation

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use cwindex_incremental::keys;
use cwindex_incremental::prelude::*;
use serde_json::{json, Value};

/// A store with `writes` versions of one item and a 100-entry map
fn setup_store(writes: u64) -> MemoryStore {
    let store = MemoryStore::new();
    let item = keys::encode(&["config".into()]).unwrap_or_default();
    let mut events: Vec<Event> = (1..=writes)
        .map(|height| Event {
            contract_address: "c1".to_string(),
            block_height: height * 10,
            block_time_unix_ms: height * 10_000,
            key: item.clone(),
            value: Some(json!({"version": height})),
            delete: false,
        })
        .collect();
    for entry in 0..100u64 {
        events.push(Event {
            contract_address: "c1".to_string(),
            block_height: 1,
            block_time_unix_ms: 1_000,
            key: keys::encode(&["bal".into(), format!("addr{}", entry).into()])
                .unwrap_or_default(),
            value: Some(json!(entry)),
            delete: false,
        });
    }
    let _ = store.upsert_events(&events);
    store
}

struct Config;

impl Formula for Config {
    fn compute(&self, env: &mut Env<'_>) -> Result<Value, FormulaError> {
        Ok(env.get("c1", &["config".into()])?.unwrap_or(Value::Null))
    }
}

fn bench_key_codec(c: &mut Criterion) {
    let parts: Vec<KeyPart> = vec!["proposals".into(), "juno1abc".into(), KeyPart::Num(42)];

    c.bench_function("key_encode", |b| {
        b.iter(|| keys::encode(black_box(&parts)))
    });

    let encoded = keys::encode(&parts).unwrap_or_default();
    let kinds = [
        keys::KeyPartKind::String,
        keys::KeyPartKind::String,
        keys::KeyPartKind::Number,
    ];
    c.bench_function("key_decode", |b| {
        b.iter(|| keys::decode_typed(black_box(&encoded), &kinds))
    });
}

fn bench_env_reads(c: &mut Criterion) {
    let store = setup_store(100);
    let code_ids = CodeIdSets::new();
    let ctx = ComputeContext::new(&store, &code_ids);

    c.bench_function("env_get", |b| {
        b.iter(|| {
            let mut env = Env::new(ctx, "c1", &Value::Null, Block::new(505, 0), false);
            black_box(env.get("c1", &["config".into()]))
        })
    });

    c.bench_function("env_get_map_100", |b| {
        b.iter(|| {
            let mut env = Env::new(ctx, "c1", &Value::Null, Block::new(505, 0), false);
            black_box(env.get_map("c1", &["bal".into()], MapKeyKind::String))
        })
    });
}

fn bench_range(c: &mut Criterion) {
    let mut group = c.benchmark_group("range_compute");
    let code_ids = CodeIdSets::new();

    for writes in [10u64, 100, 1_000] {
        let store = setup_store(writes);
        let computer = RangeComputer::new(ComputeContext::new(&store, &code_ids));
        group.bench_with_input(BenchmarkId::from_parameter(writes), &writes, |b, &writes| {
            b.iter(|| {
                computer.compute(&Config, "c1", &Value::Null, Block::new(0, 0), writes * 10)
            })
        });
    }

    group.finish();
}

criterion_group!(benches, bench_key_codec, bench_env_reads, bench_range);
criterion_main!(benches);
