use std::fs::OpenOptions;
use std::io::Write;
use std::mem;
use std::path::Path;
use std::sync::Arc;

use ridbag::primitives::pager::{AtomicOperationsManager, Pager, PagerOptions, Synchronous};
use ridbag::storage::btree::{BTreeOptions, EdgeKey, RidBagTree};
use ridbag::types::{Result, RidbagError};
use tempfile::tempdir;

fn options() -> PagerOptions {
    PagerOptions {
        page_size: 512,
        cache_pages: 32,
        synchronous: Synchronous::Full,
        autocheckpoint_frames: 0,
        ..PagerOptions::default()
    }
}

fn open(dir: &Path) -> Result<Arc<AtomicOperationsManager>> {
    Ok(Arc::new(AtomicOperationsManager::new(Arc::new(
        Pager::open_or_create(dir, options())?,
    ))))
}

fn edge(i: i64) -> EdgeKey {
    EdgeKey::new(i % 5, (i % 3) as i32, i)
}

/// Leaks the tree and pager so no checkpoint runs, leaving the WAL as the
/// only record of committed work.
fn crash(tree: RidBagTree, manager: Arc<AtomicOperationsManager>) {
    mem::forget(tree);
    mem::forget(manager);
}

#[test]
fn clean_reopen_keeps_every_entry() -> Result<()> {
    let dir = tempdir()?;
    {
        let manager = open(dir.path())?;
        let tree = RidBagTree::create(&manager, "edges", BTreeOptions::default())?;
        for i in 0..500 {
            tree.put(&edge(i), &(i as i32))?;
        }
    }
    let manager = open(dir.path())?;
    assert_eq!(manager.pager().stats().recovered_commits, 0);
    let tree = RidBagTree::load(&manager, "edges", BTreeOptions::default())?;
    assert_eq!(tree.size()?, 500);
    for i in 0..500 {
        assert_eq!(tree.get(&edge(i))?, Some(i as i32));
    }
    let report = tree.verify()?;
    assert!(report.is_ok(), "{:?}", report.errors);
    Ok(())
}

#[test]
fn committed_work_is_replayed_from_the_wal() -> Result<()> {
    let dir = tempdir()?;
    let manager = open(dir.path())?;
    let tree = RidBagTree::create(&manager, "edges", BTreeOptions::default())?;
    for i in 0..200 {
        tree.put(&edge(i), &1)?;
    }
    for i in (0..200).step_by(4) {
        tree.remove(&edge(i))?;
    }
    crash(tree, manager);

    let manager = open(dir.path())?;
    assert!(manager.pager().stats().recovered_commits > 0);
    let tree = RidBagTree::load(&manager, "edges", BTreeOptions::default())?;
    assert_eq!(tree.size()?, 150);
    for i in 0..200 {
        let expected = if i % 4 == 0 { None } else { Some(1) };
        assert_eq!(tree.get(&edge(i))?, expected, "edge {i}");
    }
    let report = tree.verify()?;
    assert!(report.is_ok(), "{:?}", report.errors);
    Ok(())
}

#[test]
fn unfinished_operation_leaves_no_trace() -> Result<()> {
    let dir = tempdir()?;
    let manager = open(dir.path())?;
    let tree = RidBagTree::create(&manager, "edges", BTreeOptions::default())?;
    tree.put(&edge(1), &1)?;

    let op = manager.start_atomic_operation();
    for i in 100..160 {
        tree.put_with(&op, &edge(i), &2)?;
    }
    // The process dies before commit.
    mem::forget(op);
    crash(tree, manager);

    let manager = open(dir.path())?;
    let tree = RidBagTree::load(&manager, "edges", BTreeOptions::default())?;
    assert_eq!(tree.size()?, 1);
    assert_eq!(tree.get(&edge(120))?, None);
    assert_eq!(tree.get(&edge(1))?, Some(1));
    Ok(())
}

#[test]
fn torn_wal_tail_is_ignored() -> Result<()> {
    let dir = tempdir()?;
    let manager = open(dir.path())?;
    let tree = RidBagTree::create(&manager, "edges", BTreeOptions::default())?;
    for i in 0..40 {
        tree.put(&edge(i), &(i as i32))?;
    }
    crash(tree, manager);

    let mut wal = OpenOptions::new()
        .append(true)
        .open(dir.path().join("ridbag.wal"))?;
    wal.write_all(&[0xA5; 97])?;
    wal.sync_all()?;
    drop(wal);

    let manager = open(dir.path())?;
    let tree = RidBagTree::load(&manager, "edges", BTreeOptions::default())?;
    assert_eq!(tree.size()?, 40);
    assert_eq!(tree.get(&edge(39))?, Some(39));
    Ok(())
}

#[test]
fn file_added_in_rolled_back_operation_does_not_exist() -> Result<()> {
    let dir = tempdir()?;
    let manager = open(dir.path())?;
    let result: Result<()> = manager.calculate_inside_atomic_operation(|op| {
        let file = manager.pager().add_file(op, "ghost")?;
        manager.pager().add_page(op, file)?;
        Err(RidbagError::Invalid("abort"))
    });
    assert!(result.is_err());
    assert!(!dir.path().join("ghost.rbt").exists());
    let err = RidBagTree::load(&manager, "ghost", BTreeOptions::default())
        .err()
        .ok_or(RidbagError::Invalid("ghost tree loaded"))?;
    assert!(matches!(err.root_cause(), RidbagError::NotFound));
    Ok(())
}

#[test]
fn deleted_tree_stays_deleted_after_restart() -> Result<()> {
    let dir = tempdir()?;
    {
        let manager = open(dir.path())?;
        let keep = RidBagTree::create(&manager, "keep", BTreeOptions::default())?;
        let drop_me = RidBagTree::create(&manager, "drop_me", BTreeOptions::default())?;
        keep.put(&edge(1), &1)?;
        drop_me.put(&edge(1), &1)?;
        drop_me.delete()?;
    }
    assert!(!dir.path().join("drop_me.rbt").exists());
    let manager = open(dir.path())?;
    let names: Vec<String> = manager
        .pager()
        .files()
        .into_iter()
        .map(|(_, name)| name)
        .collect();
    assert_eq!(names, vec!["keep".to_owned()]);
    let keep = RidBagTree::load(&manager, "keep", BTreeOptions::default())?;
    assert_eq!(keep.get(&edge(1))?, Some(1));
    Ok(())
}

#[test]
fn autocheckpoint_bounds_the_wal() -> Result<()> {
    let dir = tempdir()?;
    let pager = Pager::create(
        dir.path(),
        PagerOptions {
            autocheckpoint_frames: 16,
            ..options()
        },
    )?;
    let manager = Arc::new(AtomicOperationsManager::new(Arc::new(pager)));
    let tree = RidBagTree::create(&manager, "edges", BTreeOptions::default())?;
    for i in 0..300 {
        tree.put(&edge(i), &(i as i32))?;
    }
    assert!(manager.pager().stats().checkpoints > 0);
    crash(tree, manager);

    let manager = open(dir.path())?;
    let tree = RidBagTree::load(&manager, "edges", BTreeOptions::default())?;
    assert_eq!(tree.size()?, 300);
    let report = tree.verify()?;
    assert!(report.is_ok(), "{:?}", report.errors);
    Ok(())
}
