//! Benchmarks for execution plan construction
//!
//! Measures reference extraction plus level partitioning on synthetic
//! projects that are wide (many independent staging models) and deep
//! (long chains of refs).

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use sqlweave_core::{Config, SelectionPolicy};
use sqlweave_project::{Catalog, ExecutionPlan, Selection, SourceDefinition};

/// Generate a project with `num_models` models, each joining up to the
/// previous `fan_in` models
fn generate_catalog(num_models: usize, fan_in: usize) -> Catalog {
    let models: Vec<(String, String)> = (0..num_models)
        .map(|i| {
            let name = format!("model_{}", i);
            let sql = if i == 0 {
                "select id, value from {{ source('raw', 'events') }}".to_string()
            } else {
                let joins: Vec<String> = (1..=fan_in.min(i))
                    .map(|j| format!("left join {{{{ ref('model_{}') }}}} t{} on t0.id = t{}.id", i - j, j, j))
                    .collect();
                format!(
                    "select t0.id, t0.value from {{{{ ref('model_{}') }}}} t0\n{}",
                    i - 1,
                    joins.join("\n")
                )
            };
            (name, sql)
        })
        .collect();

    Catalog::from_parts(
        models,
        vec![SourceDefinition::new("raw", "events", "raw_data")],
        &Config::default(),
    )
    .expect("synthetic catalog is valid")
}

/// Generate a wide project: `width` staging models feeding one mart
fn generate_wide_catalog(width: usize) -> Catalog {
    let mut models: Vec<(String, String)> = (0..width)
        .map(|i| (format!("stg_{}", i), "select * from {{ source('raw', 'events') }}".to_string()))
        .collect();

    let unions: Vec<String> = (0..width)
        .map(|i| format!("select * from {{{{ ref('stg_{}') }}}}", i))
        .collect();
    models.push(("fct_all".to_string(), unions.join("\nunion all\n")));

    Catalog::from_parts(
        models,
        vec![SourceDefinition::new("raw", "events", "raw_data")],
        &Config::default(),
    )
    .expect("synthetic catalog is valid")
}

/// Benchmark: deep chains (100, 500, 1000 models)
fn bench_deep_plans(c: &mut Criterion) {
    let mut group = c.benchmark_group("plan_deep");

    for num_models in [100, 500, 1000].iter() {
        let catalog = generate_catalog(*num_models, 3);

        group.bench_with_input(BenchmarkId::from_parameter(num_models), num_models, |b, _| {
            b.iter(|| black_box(ExecutionPlan::build(&catalog)))
        });
    }

    group.finish();
}

/// Benchmark: one level of many independent models
fn bench_wide_plans(c: &mut Criterion) {
    let mut group = c.benchmark_group("plan_wide");

    for width in [100, 1000].iter() {
        let catalog = generate_wide_catalog(*width);

        group.bench_with_input(BenchmarkId::from_parameter(width), width, |b, _| {
            b.iter(|| black_box(ExecutionPlan::build(&catalog)))
        });
    }

    group.finish();
}

/// Benchmark: selecting the tail of a deep chain pulls in its whole upstream
fn bench_selection(c: &mut Criterion) {
    let catalog = generate_catalog(500, 2);
    let selection = Selection::models(["model_499"]);

    c.bench_function("plan_select_with_upstream", |b| {
        b.iter(|| {
            black_box(ExecutionPlan::build_for(
                &catalog,
                &selection,
                SelectionPolicy::WithUpstream,
            ))
        })
    });

    c.bench_function("plan_select_exact", |b| {
        b.iter(|| black_box(ExecutionPlan::build_for(&catalog, &selection, SelectionPolicy::Exact)))
    });
}

criterion_group!(benches, bench_deep_plans, bench_wide_plans, bench_selection);
criterion_main!(benches);
