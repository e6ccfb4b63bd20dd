//! Hash join benchmark: probe strategies against each other.
//!
//! Runs a full equi-join query per iteration:
//!   SELECT sum(build.payload) FROM probe JOIN build ON probe.key = build.key
//!
//! Workload parameters:
//!   - Selectivity: fraction of probe keys that have a match
//!   - Multiplicity: number of build-side duplicates per key (1 = unique, N = 1:N join)
//!
//! A second group measures hash grouping with and without spilling.

use criterion::{BenchmarkId, Criterion, Throughput, criterion_group, criterion_main};
use rand::prelude::*;
use rand_chacha::ChaCha8Rng;
use std::hint::black_box;
use std::sync::Arc;
use std::time::Duration;

use vexec::ops::{FixedAggr, HashGroupBuilder, HashjoinBuilder, JoinInput, ResultWriter, Scan};
use vexec::{BlockRelation, ExecConfig, JoinStrategy, Relation, execute};

const MEASURE_DURATION_SECS: u64 = 20;

const STRATEGIES: [JoinStrategy; 4] = [
    JoinStrategy::Scalar,
    JoinStrategy::Parallel,
    JoinStrategy::Simd,
    JoinStrategy::Boncz,
];

struct JoinWorkload {
    build: Arc<Relation>,
    probe: Arc<Relation>,
    probe_count: usize,
}

impl JoinWorkload {
    /// - `build_keys`: number of distinct keys on the build side
    /// - `multiplicity`: duplicates per key
    /// - `probe_count`: number of probe rows
    /// - `selectivity`: fraction of probe keys that exist in the build side
    fn generate(
        build_keys: usize,
        multiplicity: usize,
        probe_count: usize,
        selectivity: f64,
        seed: u64,
    ) -> Self {
        let mut rng = ChaCha8Rng::seed_from_u64(seed);

        let mut build_tuples = Vec::with_capacity(build_keys * multiplicity);
        for key in 0..build_keys as i64 {
            for dup in 0..multiplicity as i64 {
                build_tuples.push((key, key * 1000 + dup));
            }
        }
        build_tuples.shuffle(&mut rng);

        let matching_probes = (probe_count as f64 * selectivity) as usize;
        let mut probe_keys = Vec::with_capacity(probe_count);
        for _ in 0..matching_probes {
            probe_keys.push(rng.random_range(0..build_keys as i64));
        }
        let miss_base = build_keys as i64;
        for _ in matching_probes..probe_count {
            probe_keys.push(miss_base + rng.random_range(0..build_keys as i64));
        }
        probe_keys.shuffle(&mut rng);

        let mut build = Relation::new();
        build
            .add_column("key", build_tuples.iter().map(|t| t.0).collect())
            .and_then(|r| r.add_column("payload", build_tuples.iter().map(|t| t.1).collect()))
            .expect("build columns have equal length");
        let mut probe = Relation::new();
        probe
            .add_column("key", probe_keys)
            .expect("first column");

        Self {
            build: Arc::new(build),
            probe: Arc::new(probe),
            probe_count,
        }
    }

    fn run(&self, config: &ExecConfig) -> i64 {
        let sink = Arc::new(BlockRelation::new());
        execute(config, |ctx| {
            let build = Scan::new(ctx, self.build.clone())?;
            let build_key = build.column::<i64>("key")?;
            let payload = build.column::<i64>("payload")?;
            let probe = Scan::new(ctx, self.probe.clone())?;
            let probe_key = probe.column::<i64>("key")?;

            let mut join =
                HashjoinBuilder::new(ctx, JoinInput::new(Box::new(build)), JoinInput::new(Box::new(probe)))?;
            join.key(build_key, probe_key)?;
            let payload = join.payload(payload)?;
            let join = join.finish()?;

            let mut aggr = FixedAggr::new(Box::new(join));
            let total = aggr.sum(payload);
            let mut writer = ResultWriter::new(ctx, Box::new(aggr), sink.clone());
            writer.column(ctx, "total", total)?;
            Ok(Box::new(writer))
        })
        .expect("join query");
        sink.collect::<i64>("total")
            .expect("total column")
            .iter()
            .fold(0i64, |acc, &v| acc.wrapping_add(v))
    }
}

fn config(strategy: JoinStrategy) -> ExecConfig {
    ExecConfig::default().with_join_strategy(strategy)
}

fn bench_probe_selectivity(c: &mut Criterion) {
    let mut group = c.benchmark_group("probe_selectivity");
    group.measurement_time(Duration::from_secs(MEASURE_DURATION_SECS));

    for &selectivity in &[0.0, 0.1, 0.5, 1.0] {
        let workload = JoinWorkload::generate(100_000, 1, 1_000_000, selectivity, 42);
        let sel_label = format!("{:.0}pct", selectivity * 100.0);
        group.throughput(Throughput::Elements(workload.probe_count as u64));

        for strategy in STRATEGIES {
            let config = config(strategy);
            group.bench_with_input(
                BenchmarkId::new(strategy.to_string(), &sel_label),
                &workload,
                |b, w| b.iter(|| black_box(w.run(&config))),
            );
        }
    }

    group.finish();
}

fn bench_probe_multiplicity(c: &mut Criterion) {
    let mut group = c.benchmark_group("probe_multiplicity");
    group.measurement_time(Duration::from_secs(MEASURE_DURATION_SECS));

    for &multiplicity in &[1, 4, 16] {
        let workload = JoinWorkload::generate(100_000, multiplicity, 1_000_000, 1.0, 42);
        group.throughput(Throughput::Elements(workload.probe_count as u64));

        for strategy in STRATEGIES {
            let config = config(strategy);
            group.bench_with_input(
                BenchmarkId::new(strategy.to_string(), multiplicity),
                &workload,
                |b, w| b.iter(|| black_box(w.run(&config))),
            );
        }
    }

    group.finish();
}

fn bench_group_spill(c: &mut Criterion) {
    let mut group = c.benchmark_group("group_spill");
    group.measurement_time(Duration::from_secs(MEASURE_DURATION_SECS));

    let rows = 2_000_000;
    let mut rng = ChaCha8Rng::seed_from_u64(7);
    for &groups in &[1_000, 100_000, 1_000_000] {
        let keys: Vec<i64> = (0..rows).map(|_| rng.random_range(0..groups)).collect();
        let mut relation = Relation::new();
        relation
            .add_column("key", keys)
            .and_then(|r| r.add_column("value", (0..rows).collect::<Vec<i64>>()))
            .expect("group columns have equal length");
        let relation = Arc::new(relation);
        group.throughput(Throughput::Elements(rows as u64));

        group.bench_with_input(BenchmarkId::new("sum", groups), &relation, |b, relation| {
            b.iter(|| {
                let sink = Arc::new(BlockRelation::new());
                execute(&ExecConfig::default(), |ctx| {
                    let scan = Scan::new(ctx, relation.clone())?;
                    let key = scan.column::<i64>("key")?;
                    let value = scan.column::<i64>("value")?;
                    let mut grouping = HashGroupBuilder::new(ctx, Box::new(scan))?;
                    let key = grouping.key(key)?;
                    let sum = grouping.sum(value)?;
                    let grouping = grouping.finish()?;
                    let mut writer = ResultWriter::new(ctx, Box::new(grouping), sink.clone());
                    writer.column(ctx, "key", key)?;
                    writer.column(ctx, "sum", sum)?;
                    Ok(Box::new(writer))
                })
                .expect("group query")
            })
        });
    }

    group.finish();
}

criterion_group!(
    benches,
    bench_probe_selectivity,
    bench_probe_multiplicity,
    bench_group_spill,
);
criterion_main!(benches);
