use super::{BTree, BTreeOptions, EdgeKey, RidBagTree};
use crate::primitives::pager::{AtomicOperationsManager, Pager, PagerOptions};
use crate::types::{Result, RidbagError};
use proptest::prelude::*;
use rand::seq::SliceRandom;
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use std::collections::BTreeMap;
use std::path::Path;
use std::sync::{Arc, Once};
use std::thread;
use tempfile::tempdir;

fn init_tracing() {
    static INIT: Once = Once::new();
    INIT.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .with_test_writer()
            .try_init();
    });
}

fn small_pages() -> PagerOptions {
    PagerOptions {
        page_size: 256,
        cache_pages: 64,
        autocheckpoint_frames: 0,
        ..PagerOptions::default()
    }
}

fn manager(dir: &Path) -> Result<Arc<AtomicOperationsManager>> {
    Ok(Arc::new(AtomicOperationsManager::new(Arc::new(
        Pager::create(dir, small_pages())?,
    ))))
}

fn collect<K: super::KeyCodec, V: super::ValCodec>(
    iter: super::RangeIter<'_, K, V>,
) -> Result<Vec<(K, V)>> {
    iter.collect()
}

fn keys_of<K: super::KeyCodec, V: super::ValCodec>(
    iter: super::RangeIter<'_, K, V>,
) -> Result<Vec<K>> {
    iter.map(|entry| entry.map(|(key, _)| key)).collect()
}

fn u64_tree(manager: &Arc<AtomicOperationsManager>, name: &str) -> Result<BTree<u64, u64>> {
    BTree::create(manager, name, BTreeOptions::default())
}

#[test]
fn three_edges_in_one_leaf() -> Result<()> {
    init_tracing();
    let dir = tempdir()?;
    let manager = manager(dir.path())?;
    let tree = RidBagTree::create(&manager, "bag", BTreeOptions::default())?;
    assert_eq!(tree.first_key()?, None);
    assert_eq!(tree.last_key()?, None);

    tree.put(&EdgeKey::new(1, 1, 0), &10)?;
    tree.put(&EdgeKey::new(1, 2, 0), &20)?;
    tree.put(&EdgeKey::new(2, 1, 0), &30)?;

    assert_eq!(tree.first_key()?, Some(EdgeKey::new(1, 1, 0)));
    assert_eq!(tree.last_key()?, Some(EdgeKey::new(2, 1, 0)));
    assert_eq!(
        collect(tree.iter())?,
        vec![
            (EdgeKey::new(1, 1, 0), 10),
            (EdgeKey::new(1, 2, 0), 20),
            (EdgeKey::new(2, 1, 0), 30),
        ]
    );
    assert_eq!(tree.get(&EdgeKey::new(1, 2, 0))?, Some(20));
    assert_eq!(tree.get(&EdgeKey::new(1, 3, 0))?, None);
    assert_eq!(tree.size()?, 3);
    Ok(())
}

#[test]
fn third_entry_splits_a_two_entry_leaf() -> Result<()> {
    let dir = tempdir()?;
    let manager = manager(dir.path())?;
    // 20-byte key plus a 78-byte value fills half of a 256-byte bucket.
    let tree: BTree<EdgeKey, Vec<u8>> =
        BTree::create(&manager, "wide", BTreeOptions::default())?;
    let payload = |tag: u8| vec![tag; 76];

    tree.put(&EdgeKey::new(1, 1, 0), &payload(10))?;
    tree.put(&EdgeKey::new(1, 2, 0), &payload(20))?;
    assert_eq!(tree.stats_snapshot().root_splits, 0);
    tree.put(&EdgeKey::new(2, 1, 0), &payload(30))?;
    assert_eq!(tree.stats_snapshot().root_splits, 1);

    assert_eq!(tree.first_key()?, Some(EdgeKey::new(1, 1, 0)));
    assert_eq!(tree.last_key()?, Some(EdgeKey::new(2, 1, 0)));
    let keys = keys_of(tree.iter())?;
    assert_eq!(
        keys,
        vec![
            EdgeKey::new(1, 1, 0),
            EdgeKey::new(1, 2, 0),
            EdgeKey::new(2, 1, 0),
        ]
    );
    assert_eq!(tree.get(&EdgeKey::new(1, 2, 0))?, Some(payload(20)));

    let report = tree.verify()?;
    assert!(report.is_ok(), "{:?}", report.errors);
    assert_eq!(report.depth, 2);
    assert_eq!(report.leaves, 2);
    Ok(())
}

#[test]
fn three_level_tree_keeps_order_and_sibling_chain() -> Result<()> {
    init_tracing();
    let dir = tempdir()?;
    let manager = manager(dir.path())?;
    let tree = RidBagTree::create(&manager, "deep", BTreeOptions::default())?;
    let mut keys: Vec<EdgeKey> = (0..600)
        .map(|i| EdgeKey::new(i / 50, (i % 7) as i32, i))
        .collect();
    let mut rng = ChaCha8Rng::seed_from_u64(0x5eed);
    keys.shuffle(&mut rng);
    for (position, key) in keys.iter().enumerate() {
        assert!(tree.put(key, &(position as i32))?);
    }

    let report = tree.verify()?;
    assert!(report.is_ok(), "{:?}", report.errors);
    assert!(report.depth >= 3, "depth {}", report.depth);
    assert_eq!(report.entries, 600);
    let stats = tree.stats_snapshot();
    assert!(stats.root_splits >= 2);
    assert!(stats.internal_splits >= 1);

    let mut expected = keys.clone();
    expected.sort();
    assert_eq!(keys_of(tree.iter())?, expected);
    let mut descending = expected.clone();
    descending.reverse();
    assert_eq!(
        keys_of(tree.iterate_entries_minor(&expected[599], true, false))?,
        descending
    );
    for (position, key) in keys.iter().enumerate() {
        assert_eq!(tree.get(key)?, Some(position as i32));
    }
    assert_eq!(tree.size()?, 600);
    Ok(())
}

#[test]
fn between_scans_honour_every_flag_combination() -> Result<()> {
    let dir = tempdir()?;
    let manager = manager(dir.path())?;
    let tree = u64_tree(&manager, "ranges")?;
    let mut model = BTreeMap::new();
    for key in (0..200u64).step_by(2) {
        tree.put(&key, &(key * 3))?;
        model.insert(key, key * 3);
    }

    let bounds = [(10u64, 40u64), (11, 41), (0, 198), (57, 57), (58, 58), (150, 400)];
    for &(low, high) in &bounds {
        for low_inclusive in [false, true] {
            for high_inclusive in [false, true] {
                let expected: Vec<u64> = model
                    .keys()
                    .copied()
                    .filter(|&key| if low_inclusive { key >= low } else { key > low })
                    .filter(|&key| if high_inclusive { key <= high } else { key < high })
                    .collect();
                let ascending = keys_of(tree.iterate_entries_between(
                    &low,
                    low_inclusive,
                    &high,
                    high_inclusive,
                    true,
                ))?;
                assert_eq!(
                    ascending, expected,
                    "[{low} {low_inclusive}, {high} {high_inclusive}] ascending"
                );
                let mut reversed = expected.clone();
                reversed.reverse();
                let descending = keys_of(tree.iterate_entries_between(
                    &low,
                    low_inclusive,
                    &high,
                    high_inclusive,
                    false,
                ))?;
                assert_eq!(
                    descending, reversed,
                    "[{low} {low_inclusive}, {high} {high_inclusive}] descending"
                );
            }
        }
    }
    Ok(())
}

#[test]
fn minor_and_major_scans() -> Result<()> {
    let dir = tempdir()?;
    let manager = manager(dir.path())?;
    let tree = u64_tree(&manager, "halves")?;
    for key in 0..100u64 {
        tree.put(&key, &key)?;
    }

    assert_eq!(
        keys_of(tree.iterate_entries_minor(&10, false, true))?,
        (0..10).collect::<Vec<_>>()
    );
    assert_eq!(
        keys_of(tree.iterate_entries_minor(&10, true, false))?,
        (0..=10).rev().collect::<Vec<_>>()
    );
    assert_eq!(
        keys_of(tree.iterate_entries_major(&90, false, true))?,
        (91..100).collect::<Vec<_>>()
    );
    assert_eq!(
        keys_of(tree.iterate_entries_major(&90, true, false))?,
        (90..100).rev().collect::<Vec<_>>()
    );
    assert!(keys_of(tree.iterate_entries_major(&500, true, true))?.is_empty());
    assert!(keys_of(tree.iterate_entries_minor(&0, false, false))?.is_empty());
    Ok(())
}

#[test]
fn inverted_or_degenerate_ranges_are_empty() -> Result<()> {
    let dir = tempdir()?;
    let manager = manager(dir.path())?;
    let tree = u64_tree(&manager, "empty_ranges")?;
    for key in 0..50u64 {
        tree.put(&key, &key)?;
    }
    for ascending in [true, false] {
        assert!(keys_of(tree.iterate_entries_between(&30, true, &20, true, ascending))?.is_empty());
        assert!(keys_of(tree.iterate_entries_between(&20, false, &20, true, ascending))?.is_empty());
        assert!(keys_of(tree.iterate_entries_between(&20, true, &20, false, ascending))?.is_empty());
        assert_eq!(
            keys_of(tree.iterate_entries_between(&20, true, &20, true, ascending))?,
            vec![20]
        );
    }
    assert_eq!(tree.stats_snapshot().iterator_fetches, 2);
    Ok(())
}

#[test]
fn update_replaces_value_without_growing() -> Result<()> {
    let dir = tempdir()?;
    let manager = manager(dir.path())?;
    let tree = RidBagTree::create(&manager, "counts", BTreeOptions::default())?;
    let key = EdgeKey::new(7, 3, 11);
    assert!(tree.put(&key, &1)?);
    assert!(!tree.put(&key, &2)?);
    assert_eq!(tree.get(&key)?, Some(2));
    assert_eq!(tree.size()?, 1);
    let stats = tree.stats_snapshot();
    assert_eq!(stats.inserts, 1);
    assert_eq!(stats.updates, 1);
    Ok(())
}

#[test]
fn update_with_new_length_reinserts_entry() -> Result<()> {
    let dir = tempdir()?;
    let manager = manager(dir.path())?;
    let tree: BTree<u64, Vec<u8>> = BTree::create(&manager, "blobs", BTreeOptions::default())?;
    for key in 0..40u64 {
        tree.put(&key, &vec![1; 4])?;
    }
    // Growing values forces splits while replacing.
    for key in 0..40u64 {
        assert!(!tree.put(&key, &vec![2; 40])?);
    }
    assert_eq!(tree.size()?, 40);
    for key in 0..40u64 {
        assert_eq!(tree.get(&key)?, Some(vec![2; 40]));
    }
    let report = tree.verify()?;
    assert!(report.is_ok(), "{:?}", report.errors);
    Ok(())
}

#[test]
fn remove_returns_previous_value() -> Result<()> {
    let dir = tempdir()?;
    let manager = manager(dir.path())?;
    let tree = u64_tree(&manager, "removals")?;
    for key in 0..30u64 {
        tree.put(&key, &(key + 100))?;
    }
    assert_eq!(tree.remove(&7)?, Some(107));
    assert_eq!(tree.remove(&7)?, None);
    assert_eq!(tree.remove(&1_000)?, None);
    assert_eq!(tree.get(&7)?, None);
    assert_eq!(tree.size()?, 29);
    assert!(!keys_of(tree.iter())?.contains(&7));
    Ok(())
}

#[test]
fn edge_keys_skip_emptied_leaves() -> Result<()> {
    let dir = tempdir()?;
    let manager = manager(dir.path())?;
    let tree = u64_tree(&manager, "sparse")?;
    for key in 0..200u64 {
        tree.put(&key, &key)?;
    }
    for key in (0..80u64).chain(150..200) {
        tree.remove(&key)?;
    }
    assert_eq!(tree.first_key()?, Some(80));
    assert_eq!(tree.last_key()?, Some(149));
    assert_eq!(keys_of(tree.iter())?, (80..150).collect::<Vec<_>>());
    assert_eq!(
        keys_of(tree.iterate_entries_minor(&1_000, true, false))?,
        (80..150).rev().collect::<Vec<_>>()
    );

    for key in 80..150u64 {
        tree.remove(&key)?;
    }
    assert_eq!(tree.first_key()?, None);
    assert_eq!(tree.last_key()?, None);
    assert!(keys_of(tree.iter())?.is_empty());
    assert_eq!(tree.size()?, 0);
    let report = tree.verify()?;
    assert!(report.is_ok(), "{:?}", report.errors);
    Ok(())
}

#[test]
fn scan_survives_writes_between_batches() -> Result<()> {
    init_tracing();
    let dir = tempdir()?;
    let manager = manager(dir.path())?;
    let tree = u64_tree(&manager, "live")?;
    for key in (0..400u64).step_by(2) {
        tree.put(&key, &key)?;
    }

    let mut scan = tree.iter();
    let mut seen = Vec::new();
    // Two full batches: nothing left in the iterator's cache.
    for _ in 0..20 {
        let (key, _) = scan.next().ok_or(RidbagError::NotFound)??;
        seen.push(key);
    }
    assert_eq!(seen.last(), Some(&38));

    thread::scope(|scope| {
        scope
            .spawn(|| -> Result<()> {
                // Lands on the page the scan stopped on.
                tree.put(&39, &39)?;
                for key in 0..10u64 {
                    tree.remove(&key)?;
                }
                for key in 1_001..1_200u64 {
                    tree.put(&key, &key)?;
                }
                tree.remove(&300)?;
                Ok(())
            })
            .join()
            .map_err(|_| RidbagError::Invalid("writer thread panicked"))?
    })?;

    for entry in scan {
        seen.push(entry?.0);
    }
    let mut expected: Vec<u64> = (0..400u64).step_by(2).filter(|&key| key != 300).collect();
    expected.push(39);
    expected.extend(1_001..1_200u64);
    expected.sort_unstable();
    assert_eq!(seen, expected);
    assert!(tree.stats_snapshot().iterator_reseeks >= 1);
    Ok(())
}

#[test]
fn backward_scan_with_small_batches_crosses_leaves() -> Result<()> {
    let dir = tempdir()?;
    let manager = manager(dir.path())?;
    let options = BTreeOptions {
        iterator_batch_size: 3,
        ..BTreeOptions::default()
    };
    let tree: BTree<u64, u64> = BTree::create(&manager, "small_batches", options)?;
    for key in 0..120u64 {
        tree.put(&key, &key)?;
    }
    let descending = keys_of(tree.iterate_entries_major(&0, true, false))?;
    assert_eq!(descending, (0..120).rev().collect::<Vec<_>>());
    assert_eq!(tree.stats_snapshot().iterator_fetches, 41);
    Ok(())
}

#[test]
fn dropped_operation_discards_changes() -> Result<()> {
    let dir = tempdir()?;
    let manager = manager(dir.path())?;
    let tree = u64_tree(&manager, "rollback")?;
    tree.put(&1, &1)?;

    {
        let op = manager.start_atomic_operation();
        for key in 100..160u64 {
            tree.put_with(&op, &key, &key)?;
        }
        assert_eq!(tree.get_with(&op, &120)?, Some(120));
        assert_eq!(tree.remove_with(&op, &1)?, Some(1));
    }
    assert_eq!(tree.get(&120)?, None);
    assert_eq!(tree.get(&1)?, Some(1));
    assert_eq!(tree.size()?, 1);

    let failed: Result<()> = manager.calculate_inside_atomic_operation(|op| {
        tree.put_with(op, &5, &5)?;
        Err(RidbagError::Invalid("abort"))
    });
    assert!(failed.is_err());
    assert_eq!(tree.get(&5)?, None);
    let report = tree.verify()?;
    assert!(report.is_ok(), "{:?}", report.errors);
    Ok(())
}

#[test]
fn operation_spanning_two_trees_commits_once() -> Result<()> {
    let dir = tempdir()?;
    let manager = manager(dir.path())?;
    let left = u64_tree(&manager, "left")?;
    let right = u64_tree(&manager, "right")?;
    let before = manager.pager().next_lsn();
    manager.execute_inside_atomic_operation(|op| {
        left.put_with(op, &1, &10)?;
        right.put_with(op, &1, &20)?;
        Ok(())
    })?;
    assert_eq!(manager.pager().next_lsn().0, before.0 + 1);
    assert_eq!(left.get(&1)?, Some(10));
    assert_eq!(right.get(&1)?, Some(20));
    Ok(())
}

#[test]
fn oversized_entries_are_rejected() -> Result<()> {
    let dir = tempdir()?;
    let manager = manager(dir.path())?;
    let tree: BTree<u64, Vec<u8>> = BTree::create(&manager, "limits", BTreeOptions::default())?;
    let err = tree.put(&1, &vec![0; 200]).err().ok_or(RidbagError::NotFound)?;
    assert!(matches!(err.root_cause(), RidbagError::InvalidOwned(_)));
    assert!(matches!(err, RidbagError::Component { operation: "put", .. }));
    assert_eq!(tree.size()?, 0);
    Ok(())
}

#[test]
fn deleted_tree_cannot_be_loaded() -> Result<()> {
    let dir = tempdir()?;
    let manager = manager(dir.path())?;
    let tree = u64_tree(&manager, "gone")?;
    tree.put(&1, &1)?;
    tree.delete()?;
    let err = BTree::<u64, u64>::load(&manager, "gone", BTreeOptions::default())
        .err()
        .ok_or(RidbagError::Invalid("tree still loadable"))?;
    assert!(matches!(err.root_cause(), RidbagError::NotFound));

    let again = u64_tree(&manager, "gone")?;
    assert_eq!(again.size()?, 0);
    Ok(())
}

fn depth_limited(max_path_length: usize) -> BTreeOptions {
    BTreeOptions {
        max_path_length,
        ..BTreeOptions::default()
    }
}

fn too_deep(err: &RidbagError) -> bool {
    matches!(err, RidbagError::Component { .. })
        && matches!(
            err.root_cause(),
            RidbagError::Corruption("tree path longer than max_path_length")
        )
}

#[test]
fn paths_past_the_depth_limit_fail_without_changing_the_tree() -> Result<()> {
    let dir = tempdir()?;
    let manager = manager(dir.path())?;
    let tree = RidBagTree::create(&manager, "deep", BTreeOptions::default())?;
    for i in 0..20 {
        tree.put(&EdgeKey::new(1, 0, i), &(i as i32))?;
    }
    assert_eq!(tree.verify()?.depth, 2);

    let shallow = RidBagTree::load(&manager, "deep", depth_limited(1))?;
    let err = shallow
        .get(&EdgeKey::new(1, 0, 3))
        .err()
        .ok_or(RidbagError::Invalid("get crossed the depth limit"))?;
    assert!(too_deep(&err), "{err}");
    let err = shallow
        .put(&EdgeKey::new(1, 0, 100), &100)
        .err()
        .ok_or(RidbagError::Invalid("put crossed the depth limit"))?;
    assert!(too_deep(&err), "{err}");
    let err = shallow
        .iter()
        .next()
        .ok_or(RidbagError::Invalid("scan ended without an error"))?
        .err()
        .ok_or(RidbagError::Invalid("scan crossed the depth limit"))?;
    assert!(too_deep(&err), "{err}");

    assert_eq!(tree.size()?, 20);
    assert_eq!(tree.get(&EdgeKey::new(1, 0, 100))?, None);
    assert_eq!(keys_of(tree.iter())?.len(), 20);
    let report = tree.verify()?;
    assert!(report.is_ok(), "{:?}", report.errors);
    Ok(())
}

#[test]
fn root_split_past_the_depth_limit_is_refused() -> Result<()> {
    let dir = tempdir()?;
    let manager = manager(dir.path())?;
    let tree = RidBagTree::create(&manager, "flat", depth_limited(1))?;
    let mut stored = 0;
    let err = loop {
        match tree.put(&EdgeKey::new(1, 0, stored), &1) {
            Ok(_) => stored += 1,
            Err(err) => break err,
        }
        assert!(stored < 100, "a single leaf never filled up");
    };
    assert!(stored >= 2);
    assert!(matches!(
        err.root_cause(),
        RidbagError::Invalid("root split would exceed max_path_length")
    ));
    assert_eq!(tree.size()?, stored as u64);
    assert_eq!(tree.get(&EdgeKey::new(1, 0, stored))?, None);
    assert_eq!(keys_of(tree.iter())?.len(), stored as usize);
    let report = tree.verify()?;
    assert!(report.is_ok(), "{:?}", report.errors);
    assert_eq!(report.depth, 1);
    Ok(())
}

#[test]
fn seeded_workload_matches_model() -> Result<()> {
    let dir = tempdir()?;
    let manager = manager(dir.path())?;
    let tree = RidBagTree::create(&manager, "workload", BTreeOptions::default())?;
    let mut model = BTreeMap::new();
    let mut rng = ChaCha8Rng::seed_from_u64(0xDEADBEEF);
    for _ in 0..3_000 {
        let key = EdgeKey::new(rng.gen_range(0..8), rng.gen_range(0..16), rng.gen_range(0..32));
        if rng.gen_bool(0.7) {
            let value: i32 = rng.gen_range(-5..5);
            let inserted = tree.put(&key, &value)?;
            assert_eq!(inserted, model.insert(key, value).is_none());
        } else {
            assert_eq!(tree.remove(&key)?, model.remove(&key));
        }
    }
    assert_eq!(tree.size()?, model.len() as u64);
    let actual: BTreeMap<EdgeKey, i32> = collect(tree.iter())?.into_iter().collect();
    assert_eq!(actual, model);
    let report = tree.verify()?;
    assert!(report.is_ok(), "{:?}", report.errors);
    Ok(())
}

#[derive(Clone, Debug)]
enum PropOp {
    Put(u64, usize),
    Remove(u64),
}

fn op_strategy() -> impl Strategy<Value = PropOp> {
    let key_range = 0u64..96;
    prop_oneof![
        3 => (key_range.clone(), 0usize..24).prop_map(|(k, len)| PropOp::Put(k, len)),
        1 => key_range.prop_map(PropOp::Remove),
    ]
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(32))]
    #[test]
    fn btree_matches_btreemap_random_ops(ops in prop::collection::vec(op_strategy(), 1..120)) {
        let dir = tempdir().expect("tempdir");
        let manager = manager(dir.path()).expect("manager");
        let tree: BTree<u64, Vec<u8>> =
            BTree::create(&manager, "prop", BTreeOptions::default()).expect("create tree");
        let mut reference = BTreeMap::new();

        for op in ops {
            match op {
                PropOp::Put(key, len) => {
                    let value = vec![key as u8; len];
                    let inserted = tree.put(&key, &value).expect("put");
                    prop_assert_eq!(inserted, reference.insert(key, value).is_none());
                }
                PropOp::Remove(key) => {
                    let removed = tree.remove(&key).expect("remove");
                    prop_assert_eq!(removed, reference.remove(&key));
                }
            }
        }

        let actual: BTreeMap<u64, Vec<u8>> =
            collect(tree.iter()).expect("scan").into_iter().collect();
        prop_assert_eq!(&actual, &reference);
        prop_assert_eq!(tree.size().expect("size"), reference.len() as u64);
        let report = tree.verify().expect("verify");
        prop_assert!(report.is_ok(), "{:?}", report.errors);
    }
}
