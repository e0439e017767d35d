//! Micro benchmarks for the rid-bag tree.
#![forbid(unsafe_code)]
#![allow(missing_docs)]

use std::sync::Arc;

use criterion::{
    black_box, criterion_group, criterion_main, BatchSize, BenchmarkId, Criterion, Throughput,
};
use rand::seq::SliceRandom;
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use ridbag::primitives::pager::{AtomicOperationsManager, Pager, PagerOptions, Synchronous};
use ridbag::storage::btree::{BTreeOptions, EdgeKey, RidBagTree};
use tempfile::TempDir;

const INSERT_COUNT: i64 = 16_384;
const LOOKUP_SAMPLES: usize = 4_096;
const RANGE_WIDTH: i64 = 512;

fn edge(i: i64) -> EdgeKey {
    EdgeKey::new(i / 1_024, (i % 4) as i32, i)
}

fn micro_ridbag(c: &mut Criterion) {
    let mut group = c.benchmark_group("micro/ridbag");
    group.sample_size(20);

    group.throughput(Throughput::Elements(INSERT_COUNT as u64));
    group.bench_function("sequential_insert_one_op", |b| {
        b.iter_batched(
            FreshTree::new,
            |tree| {
                let keys: Vec<EdgeKey> = (0..INSERT_COUNT).map(edge).collect();
                tree.insert_in_one_operation(&keys);
                black_box(tree.tree.size().expect("size"));
            },
            BatchSize::SmallInput,
        );
    });

    let mut random_keys: Vec<EdgeKey> = (0..INSERT_COUNT).map(edge).collect();
    random_keys.shuffle(&mut ChaCha8Rng::seed_from_u64(0xBEEF_F00D));
    group.throughput(Throughput::Elements(INSERT_COUNT as u64));
    group.bench_function("random_insert_one_op", |b| {
        b.iter_batched(
            FreshTree::new,
            |tree| {
                tree.insert_in_one_operation(&random_keys);
                black_box(tree.tree.size().expect("size"));
            },
            BatchSize::SmallInput,
        );
    });

    group.throughput(Throughput::Elements(1_024));
    group.bench_function("insert_commit_each", |b| {
        b.iter_batched(
            FreshTree::new,
            |tree| {
                for key in random_keys.iter().take(1_024) {
                    tree.tree.put(key, &1).expect("put");
                }
            },
            BatchSize::SmallInput,
        );
    });

    let mut loaded = LoadedTree::new(INSERT_COUNT);
    group.throughput(Throughput::Elements(LOOKUP_SAMPLES as u64));
    group.bench_function(BenchmarkId::new("point_lookup", LOOKUP_SAMPLES), |b| {
        b.iter(|| loaded.point_lookup(LOOKUP_SAMPLES));
    });

    group.throughput(Throughput::Elements(RANGE_WIDTH as u64));
    group.bench_function(BenchmarkId::new("range_scan", RANGE_WIDTH), |b| {
        b.iter(|| loaded.range_scan(RANGE_WIDTH, true));
    });
    group.bench_function(BenchmarkId::new("range_scan_backward", RANGE_WIDTH), |b| {
        b.iter(|| loaded.range_scan(RANGE_WIDTH, false));
    });

    group.finish();
}

struct FreshTree {
    _tmpdir: TempDir,
    manager: Arc<AtomicOperationsManager>,
    tree: RidBagTree,
}

impl FreshTree {
    fn new() -> Self {
        let tmpdir = tempfile::tempdir().expect("tmpdir");
        let options = PagerOptions {
            synchronous: Synchronous::Normal,
            ..PagerOptions::default()
        };
        let pager = Pager::create(tmpdir.path(), options).expect("pager");
        let manager = Arc::new(AtomicOperationsManager::new(Arc::new(pager)));
        let tree = RidBagTree::create(&manager, "bench", BTreeOptions::default()).expect("tree");
        Self {
            _tmpdir: tmpdir,
            manager,
            tree,
        }
    }

    fn insert_in_one_operation(&self, keys: &[EdgeKey]) {
        self.manager
            .execute_inside_atomic_operation(|op| {
                for key in keys {
                    self.tree.put_with(op, key, &1)?;
                }
                Ok(())
            })
            .expect("insert");
    }
}

struct LoadedTree {
    fresh: FreshTree,
    rng: ChaCha8Rng,
}

impl LoadedTree {
    fn new(count: i64) -> Self {
        let fresh = FreshTree::new();
        let keys: Vec<EdgeKey> = (0..count).map(edge).collect();
        fresh.insert_in_one_operation(&keys);
        Self {
            fresh,
            rng: ChaCha8Rng::seed_from_u64(0xFEED_FACE),
        }
    }

    fn point_lookup(&mut self, samples: usize) {
        for _ in 0..samples {
            let key = edge(self.rng.gen_range(0..INSERT_COUNT));
            black_box(self.fresh.tree.get(&key).expect("get"));
        }
    }

    fn range_scan(&mut self, width: i64, ascending: bool) {
        for _ in 0..16 {
            let start = self.rng.gen_range(0..(INSERT_COUNT - width));
            let scan = self.fresh.tree.iterate_entries_between(
                &edge(start),
                true,
                &edge(start + width),
                true,
                ascending,
            );
            for entry in scan {
                black_box(entry.expect("scan"));
            }
        }
    }
}

criterion_group!(benches, micro_ridbag);
criterion_main!(benches);
