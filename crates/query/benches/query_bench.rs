//! Benchmarks for query building and evaluation.
//!
//! Data is generated once per benchmark and excluded from measurement with
//! `iter_batched` where a fresh builder is needed.

use criterion::{black_box, criterion_group, criterion_main, BatchSize, BenchmarkId, Criterion};
use std::sync::Arc;
use tessel_core::schema::{ColumnIndices, ObjectSchemaBuilder};
use tessel_core::{DataType, Value};
use tessel_query::{Case, QueryBuilder, SortOrder};
use tessel_storage::{ChangeLog, Group};

/// Simple LCG for reproducible pseudo-random ages.
fn ages(count: usize, seed: u64) -> Vec<i64> {
    let mut s = seed;
    (0..count)
        .map(|_| {
            s = s.wrapping_mul(6364136223846793005).wrapping_add(1);
            ((s >> 33) % 100) as i64
        })
        .collect()
}

fn people(count: usize) -> (Group, Arc<ColumnIndices>) {
    let mut group = Group::new();
    let mut log = ChangeLog::new();
    let schema = ObjectSchemaBuilder::new("Person")
        .unwrap()
        .field("name", DataType::String)
        .unwrap()
        .field("age", DataType::Int)
        .unwrap()
        .build()
        .unwrap();
    group.add_table(schema, &mut log).unwrap();
    for (i, age) in ages(count, 12345).into_iter().enumerate() {
        group
            .create_object(
                "Person",
                vec![Value::String(format!("name_{}", i)), Value::Int(age)],
                &mut log,
            )
            .unwrap();
    }
    let indices = Arc::new(ColumnIndices::build(&group.schema(), 1));
    (group, indices)
}

fn bench_filter(c: &mut Criterion) {
    let mut group = c.benchmark_group("filter");
    for size in [1_000usize, 10_000] {
        let (data, indices) = people(size);
        let query = QueryBuilder::new(indices.clone(), "Person")
            .unwrap()
            .between("age", 20, 40)
            .unwrap()
            .build()
            .unwrap();
        group.bench_with_input(BenchmarkId::new("between", size), &size, |b, _| {
            b.iter(|| black_box(query.execute(&data).unwrap()))
        });

        let query = QueryBuilder::new(indices, "Person")
            .unwrap()
            .contains("name", "_9", Case::Insensitive)
            .unwrap()
            .build()
            .unwrap();
        group.bench_with_input(BenchmarkId::new("contains_insensitive", size), &size, |b, _| {
            b.iter(|| black_box(query.count(&data).unwrap()))
        });
    }
    group.finish();
}

fn bench_sort(c: &mut Criterion) {
    let mut group = c.benchmark_group("sort");
    for size in [1_000usize, 10_000] {
        let (data, indices) = people(size);
        let query = QueryBuilder::new(indices, "Person")
            .unwrap()
            .sort_by(&["age", "name"], &[SortOrder::Descending, SortOrder::Ascending])
            .unwrap()
            .build()
            .unwrap();
        group.bench_with_input(BenchmarkId::new("two_fields", size), &size, |b, _| {
            b.iter(|| black_box(query.execute(&data).unwrap()))
        });
    }
    group.finish();
}

fn bench_build(c: &mut Criterion) {
    let (_, indices) = people(10);
    c.bench_function("build_grouped_query", |b| {
        b.iter_batched(
            || indices.clone(),
            |indices| {
                QueryBuilder::new(indices, "Person")
                    .unwrap()
                    .begin_group()
                    .unwrap()
                    .equal_to("name", "name_1")
                    .unwrap()
                    .or()
                    .unwrap()
                    .greater_than("age", 50)
                    .unwrap()
                    .end_group()
                    .unwrap()
                    .build()
                    .unwrap()
            },
            BatchSize::SmallInput,
        )
    });
}

criterion_group!(benches, bench_filter, bench_sort, bench_build);
criterion_main!(benches);
