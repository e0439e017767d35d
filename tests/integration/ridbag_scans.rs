use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;

use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use ridbag::primitives::pager::{AtomicOperationsManager, Pager, PagerOptions};
use ridbag::storage::btree::{BTreeOptions, EdgeKey, RidBagTree};
use ridbag::types::{Result, RidbagError};
use tempfile::tempdir;

fn manager(dir: &std::path::Path, page_size: u32) -> Result<Arc<AtomicOperationsManager>> {
    let options = PagerOptions {
        page_size,
        cache_pages: 128,
        autocheckpoint_frames: 256,
        ..PagerOptions::default()
    };
    Ok(Arc::new(AtomicOperationsManager::new(Arc::new(
        Pager::create(dir, options)?,
    ))))
}

fn bag_bounds(bag: i64) -> (EdgeKey, EdgeKey) {
    (
        EdgeKey::new(bag, i32::MIN, i64::MIN),
        EdgeKey::new(bag, i32::MAX, i64::MAX),
    )
}

#[test]
fn per_bag_scans_return_only_that_bag() -> Result<()> {
    let dir = tempdir()?;
    let manager = manager(dir.path(), 1024)?;
    let tree = RidBagTree::create(&manager, "edges", BTreeOptions::default())?;
    let mut rng = ChaCha8Rng::seed_from_u64(42);
    let mut per_bag = vec![Vec::new(); 8];
    for _ in 0..4_000 {
        let bag = rng.gen_range(0..8i64);
        let key = EdgeKey::new(bag, rng.gen_range(-3..3), rng.gen_range(-1_000..1_000));
        if tree.put(&key, &1)? {
            per_bag[bag as usize].push(key);
        }
    }
    for (bag, expected) in per_bag.iter_mut().enumerate() {
        expected.sort();
        let (low, high) = bag_bounds(bag as i64);
        let ascending: Vec<EdgeKey> = tree
            .iterate_entries_between(&low, true, &high, true, true)
            .map(|entry| entry.map(|(key, _)| key))
            .collect::<Result<_>>()?;
        assert_eq!(&ascending, expected, "bag {bag}");
        let descending: Vec<EdgeKey> = tree
            .iterate_entries_between(&low, true, &high, true, false)
            .map(|entry| entry.map(|(key, _)| key))
            .collect::<Result<_>>()?;
        assert!(descending.iter().rev().eq(expected.iter()), "bag {bag}");
    }
    let report = tree.verify()?;
    assert!(report.is_ok(), "{:?}", report.errors);
    Ok(())
}

#[test]
fn readers_see_ordered_scans_while_a_writer_splits_pages() -> Result<()> {
    let dir = tempdir()?;
    let manager = manager(dir.path(), 256)?;
    let tree = RidBagTree::create(&manager, "edges", BTreeOptions::default())?;
    // Stable keys never touched by the writer.
    for i in 0..300 {
        tree.put(&EdgeKey::new(1, 0, i * 10), &0)?;
    }
    let done = AtomicBool::new(false);

    thread::scope(|scope| -> Result<()> {
        let writer = scope.spawn(|| -> Result<()> {
            let mut rng = ChaCha8Rng::seed_from_u64(7);
            for round in 0..1_500 {
                let key = EdgeKey::new(1, 0, rng.gen_range(0..3_000) * 10 + 5);
                if round % 3 == 0 {
                    tree.remove(&key)?;
                } else {
                    tree.put(&key, &1)?;
                }
            }
            done.store(true, Ordering::Release);
            Ok(())
        });

        let readers: Vec<_> = (0..3)
            .map(|reader| {
                let tree = &tree;
                let done = &done;
                scope.spawn(move || -> Result<usize> {
                    let mut scans = 0;
                    loop {
                        let ascending = reader % 2 == 0;
                        let mut previous: Option<EdgeKey> = None;
                        let mut stable = 0;
                        let scan = if ascending { tree.iter() } else { tree.iter_rev() };
                        for entry in scan {
                            let (key, value) = entry?;
                            if let Some(previous) = previous {
                                let ordered = if ascending {
                                    previous < key
                                } else {
                                    previous > key
                                };
                                assert!(ordered, "{previous} then {key}");
                            }
                            if value == 0 {
                                stable += 1;
                            }
                            previous = Some(key);
                        }
                        assert_eq!(stable, 300, "reader {reader} lost stable keys");
                        scans += 1;
                        if done.load(Ordering::Acquire) {
                            return Ok(scans);
                        }
                    }
                })
            })
            .collect();

        writer
            .join()
            .map_err(|_| RidbagError::Invalid("writer panicked"))??;
        for reader in readers {
            let scans = reader
                .join()
                .map_err(|_| RidbagError::Invalid("reader panicked"))??;
            assert!(scans >= 1);
        }
        Ok(())
    })?;

    let report = tree.verify()?;
    assert!(report.is_ok(), "{:?}", report.errors);
    Ok(())
}

#[test]
fn large_pages_hold_many_entries_per_leaf() -> Result<()> {
    let dir = tempdir()?;
    let manager = manager(dir.path(), 65_536)?;
    let tree = RidBagTree::create(&manager, "wide", BTreeOptions::default())?;
    for i in 0..1_000 {
        tree.put(&EdgeKey::new(0, 0, i), &(i as i32))?;
    }
    let report = tree.verify()?;
    assert!(report.is_ok(), "{:?}", report.errors);
    assert_eq!(report.depth, 1);
    assert_eq!(tree.first_key()?, Some(EdgeKey::new(0, 0, 0)));
    assert_eq!(tree.last_key()?, Some(EdgeKey::new(0, 0, 999)));
    let tail: Vec<i32> = tree
        .iterate_entries_major(&EdgeKey::new(0, 0, 990), false, true)
        .map(|entry| entry.map(|(_, value)| value))
        .collect::<Result<_>>()?;
    assert_eq!(tail, (991..1_000).collect::<Vec<_>>());
    Ok(())
}
