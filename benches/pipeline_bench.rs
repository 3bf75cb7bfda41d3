//! Performance benchmarks for clustering and allocation.
//!
//! Run with: cargo bench

use cardinal::clustering::{ClusteringConfig, HierarchicalClustering};
use cardinal::distance::distance_matrix;
use cardinal::pipeline::{CardinalityPipeline, PipelineConfig};
use cardinal::types::{PortfolioParams, ReturnMatrix};
use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};

/// Synthetic returns: `assets` columns in blocks of five sharing a factor.
fn generate_returns(assets: usize, periods: usize) -> ReturnMatrix {
    let rows = (0..periods)
        .map(|t| {
            (0..assets)
                .map(|i| {
                    let block = (i / 5) as f64;
                    let factor = (t as f64 * (0.31 + 0.17 * block)).sin() * 0.01;
                    let idio = ((t * (i + 7)) as f64 * 0.913).sin() * 0.003;
                    factor + idio + 0.0001 * i as f64
                })
                .collect()
        })
        .collect();
    ReturnMatrix::new(rows).unwrap()
}

fn bench_clustering(c: &mut Criterion) {
    let mut group = c.benchmark_group("clustering");

    for assets in [20, 50, 100].iter() {
        let distance = distance_matrix(&generate_returns(*assets, 250)).unwrap();

        group.bench_with_input(BenchmarkId::new("sequential", assets), &distance, |b, d| {
            let engine = HierarchicalClustering::new(ClusteringConfig {
                parallel_threshold: usize::MAX,
            });
            b.iter(|| engine.cluster(black_box(d)).unwrap())
        });

        group.bench_with_input(BenchmarkId::new("parallel", assets), &distance, |b, d| {
            let engine = HierarchicalClustering::new(ClusteringConfig {
                parallel_threshold: 0,
            });
            b.iter(|| engine.cluster(black_box(d)).unwrap())
        });
    }

    group.finish();
}

fn bench_pipeline(c: &mut Criterion) {
    let mut group = c.benchmark_group("pipeline");
    group.sample_size(10);

    let returns = generate_returns(20, 250);
    for budget in [4, 8].iter() {
        let pipeline = CardinalityPipeline::new(PipelineConfig {
            params: PortfolioParams::new(*budget, 0.4, 1.0),
            ..Default::default()
        })
        .unwrap();

        group.bench_with_input(BenchmarkId::new("run", budget), &returns, |b, r| {
            b.iter(|| pipeline.run(black_box(r)).unwrap())
        });
    }

    group.finish();
}

criterion_group!(benches, bench_clustering, bench_pipeline);
criterion_main!(benches);
