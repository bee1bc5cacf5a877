use criterion::{BenchmarkId, Criterion, Throughput, criterion_group, criterion_main};
use std::hint::black_box;

use mso_model::core::{BusinessRules, Inputs, build_graph, run_projection, simulate};

// ── Group 1: monte_carlo: iteration count scaling ──────────────────────────

fn bench_monte_carlo(c: &mut Criterion) {
    let inputs = Inputs::default();
    let rules = BusinessRules::standard();
    let mut group = c.benchmark_group("monte_carlo");
    for &iterations in &[1_000usize, 10_000, 50_000] {
        if iterations >= 50_000 {
            group.sample_size(10);
        }
        group.throughput(Throughput::Elements(iterations as u64));
        group.bench_with_input(
            BenchmarkId::from_parameter(iterations),
            &iterations,
            |b, &n| b.iter(|| simulate(black_box(&inputs), &rules, n, 42)),
        );
    }
    group.finish();
}

// ── Group 2: projection: one deterministic 19-month run ────────────────────

fn bench_projection(c: &mut Criterion) {
    let inputs = Inputs::default();
    let rules = BusinessRules::standard();
    let mut group = c.benchmark_group("projection");
    group.bench_function("run_projection", |b| {
        b.iter(|| run_projection(black_box(&inputs), &rules))
    });
    group.bench_function("build_graph", |b| {
        b.iter(|| build_graph(black_box(&inputs), &rules))
    });
    group.finish();
}

criterion_group!(benches, bench_monte_carlo, bench_projection);
criterion_main!(benches);
