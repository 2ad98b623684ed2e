//! # Merge Benchmarks
//!
//! Performance benchmarks for the codec and the rule-layered merge.
//!
//! Run with: `cargo bench -p mergegraph-core`

use criterion::{BenchmarkId, Criterion, criterion_group, criterion_main};
use mergegraph_core::{
    EntitySchema, EntityType, ExtractedItem, Identifier, Identity, MergeMode, Record, RuleKind,
    RuleSet, SchemaRegistry, Shape, build_entity, dehydrate, hydrate,
};
use serde_json::{Value, json};
use std::hint::black_box;

/// A record with a list of `size` contact objects.
fn contact_record(size: usize) -> Record {
    let contacts: Vec<Value> = (0..size)
        .map(|i| json!({"kind": "email", "value": format!("user{i}@example.org")}))
        .collect();
    let value = json!({
        "name": "Ada",
        "address": {"city": "London", "zip": "N1"},
        "contact": contacts,
    });
    match value {
        Value::Object(map) => map,
        _ => Record::new(),
    }
}

fn contact_shape() -> Shape {
    Shape::object([
        ("name", Shape::Leaf),
        ("address", Shape::leaves(["city", "zip"])),
        ("contact", Shape::list(Shape::leaves(["kind", "value"]))),
    ])
}

/// `size` person items from distinct primary sources in one group.
fn person_items(size: usize) -> Vec<ExtractedItem> {
    (0..size)
        .map(|i| {
            let identity = Identity {
                identifier: Identifier::new(format!("item-{i:05}")),
                group_identity: Identifier::new("group"),
                primary_source: Identifier::new(format!("source-{}", i % 7)),
                source_local_id: i.to_string(),
            };
            ExtractedItem::new(EntityType::new("Person"), &identity)
                .with_field("email", json!([format!("p{i}@example.org")]))
                .with_field("givenName", json!(["Ada", format!("Name{}", i % 13)]))
        })
        .collect()
}

// =============================================================================
// BENCHMARKS
// =============================================================================

fn bench_dehydrate(c: &mut Criterion) {
    let mut group = c.benchmark_group("dehydrate");

    for size in [10, 100, 1000].iter() {
        let record = contact_record(*size);
        group.bench_with_input(BenchmarkId::from_parameter(size), &record, |b, record| {
            b.iter(|| black_box(dehydrate(record).expect("dehydrate")));
        });
    }

    group.finish();
}

fn bench_hydrate(c: &mut Criterion) {
    let mut group = c.benchmark_group("hydrate");
    let shape = contact_shape();

    for size in [10, 100, 1000].iter() {
        let flat = dehydrate(&contact_record(*size)).expect("dehydrate");
        group.bench_with_input(BenchmarkId::from_parameter(size), &flat, |b, flat| {
            b.iter(|| black_box(hydrate(flat, &shape).expect("hydrate")));
        });
    }

    group.finish();
}

fn bench_build_entity(c: &mut Criterion) {
    let mut group = c.benchmark_group("build_entity");
    let registry = SchemaRegistry::builtin().expect("schema");
    let stem = EntityType::new("Person");
    let schema = registry.type_schema(&stem).expect("person schema");
    let rules = RuleSet::new(stem.clone())
        .with_rule(RuleKind::Additive, "givenName", json!(["Grace"]))
        .with_rule(RuleKind::Subtractive, "givenName", json!(["Name3"]))
        .with_rule(RuleKind::Preventive, "email", json!(["source-0"]));
    let target = Identifier::new("group");

    for size in [10, 100, 1000].iter() {
        let items = person_items(*size);
        group.bench_with_input(BenchmarkId::from_parameter(size), &items, |b, items| {
            b.iter(|| {
                black_box(
                    build_entity(&target, items, Some(&rules), schema, MergeMode::Preview)
                        .expect("merge"),
                )
            });
        });
    }

    group.finish();
}

criterion_group!(benches, bench_dehydrate, bench_hydrate, bench_build_entity);
criterion_main!(benches);
