use std::collections::BTreeMap;
use std::sync::Arc;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tempfile::TempDir;

use emberdb::{Config, Error, Store, StoreIterator};

fn open_store(dir: &TempDir) -> Arc<Store> {
    Store::open(Config::new(dir.path())).expect("open store")
}

fn open_store_with(config: Config) -> Arc<Store> {
    Store::open(config).expect("open store")
}

fn drain(mut it: StoreIterator) -> Vec<(Vec<u8>, Vec<u8>)> {
    let mut out = Vec::new();
    while it.valid() {
        out.push((
            it.key().expect("key").to_vec(),
            it.value().unwrap_or_default().to_vec(),
        ));
        it.next();
    }
    out
}

#[test]
fn test_basic_crud_and_iteration() {
    let dir = TempDir::new().unwrap();
    let store = open_store(&dir);
    let mut w = store.new_writer();

    w.insert(b"a", b"1").unwrap();
    w.insert(b"b", b"2").unwrap();
    w.insert(b"c", b"3").unwrap();

    assert_eq!(w.lookup(b"b").unwrap(), b"2".to_vec());

    w.delete(b"b").unwrap();
    assert_eq!(w.lookup(b"b"), Err(Error::ItemNotFound));

    let got = drain(store.new_iterator());
    assert_eq!(
        got,
        vec![
            (b"a".to_vec(), b"1".to_vec()),
            (b"c".to_vec(), b"3".to_vec())
        ]
    );

    store.close().unwrap();
}

#[test]
fn test_key_too_large_is_rejected() {
    let dir = TempDir::new().unwrap();
    let store = open_store_with(Config::new(dir.path()).max_key_size(16));
    let mut w = store.new_writer();

    assert_eq!(w.insert(&[7u8; 17], b"v"), Err(Error::KeyTooLarge));
    assert_eq!(w.delete(&[7u8; 17]), Err(Error::KeyTooLarge));
    // nothing was mutated
    assert!(drain(store.new_iterator()).is_empty());
    assert_eq!(store.count(), 0);
}

#[test]
fn test_mvcc_snapshot_isolation() {
    let dir = TempDir::new().unwrap();
    let store = open_store(&dir);
    let mut w = store.new_writer();

    w.insert(b"k", b"v0").unwrap();
    let s1 = store.new_snapshot();
    w.insert(b"k", b"v1").unwrap();

    let got = drain(s1.new_iterator().unwrap());
    assert_eq!(got, vec![(b"k".to_vec(), b"v0".to_vec())]);

    let newest = drain(store.new_iterator());
    assert_eq!(newest, vec![(b"k".to_vec(), b"v1".to_vec())]);

    s1.close();
}

#[test]
fn test_snapshot_sees_no_later_deletes() {
    let dir = TempDir::new().unwrap();
    let store = open_store(&dir);
    let mut w = store.new_writer();

    w.insert(b"a", b"1").unwrap();
    w.insert(b"b", b"2").unwrap();
    let snap = store.new_snapshot();

    w.delete(b"a").unwrap();
    w.insert(b"c", b"3").unwrap();

    let got = drain(snap.new_iterator().unwrap());
    assert_eq!(
        got,
        vec![
            (b"a".to_vec(), b"1".to_vec()),
            (b"b".to_vec(), b"2".to_vec())
        ]
    );
    snap.close();

    let newest = drain(store.new_iterator());
    assert_eq!(
        newest,
        vec![
            (b"b".to_vec(), b"2".to_vec()),
            (b"c".to_vec(), b"3".to_vec())
        ]
    );
}

#[test]
fn test_recovery_point_and_rollback() {
    let dir = TempDir::new().unwrap();
    let store = open_store(&dir);
    let mut w = store.new_writer();

    for i in 1..=100u32 {
        w.insert(format!("{i:03}").as_bytes(), b"x").unwrap();
    }
    let snap = store.new_snapshot();
    assert_eq!(snap.count(), 100);
    let rp = store
        .create_recovery_point(snap, b"after-100")
        .expect("create recovery point");
    assert_eq!(rp.meta(), b"after-100");
    assert_eq!(store.get_recovery_points().len(), 1);

    for i in 101..=200u32 {
        w.insert(format!("{i:03}").as_bytes(), b"x").unwrap();
    }
    assert_eq!(drain(store.new_iterator()).len(), 200);

    let snap = store.rollback(&rp).expect("rollback");
    assert_eq!(snap.count(), 100);

    let got = drain(store.new_iterator());
    assert_eq!(got.len(), 100);
    assert_eq!(got.first().unwrap().0, b"001".to_vec());
    assert_eq!(got.last().unwrap().0, b"100".to_vec());

    // lookups agree with iteration
    assert_eq!(w.lookup(b"050").unwrap(), b"x".to_vec());
    assert_eq!(w.lookup(b"150"), Err(Error::ItemNotFound));
}

#[test]
fn test_rollback_truncates_recovery_points() {
    let dir = TempDir::new().unwrap();
    let store = open_store(&dir);
    let mut w = store.new_writer();

    w.insert(b"a", b"1").unwrap();
    let rp1 = store
        .create_recovery_point(store.new_snapshot(), b"one")
        .unwrap();
    w.insert(b"b", b"2").unwrap();
    let _rp2 = store
        .create_recovery_point(store.new_snapshot(), b"two")
        .unwrap();
    assert_eq!(store.get_recovery_points().len(), 2);

    store.rollback(&rp1).unwrap();
    let rps = store.get_recovery_points();
    assert_eq!(rps.len(), 1);
    assert_eq!(rps[0].meta(), b"one");
}

#[test]
fn test_remove_recovery_point() {
    let dir = TempDir::new().unwrap();
    let store = open_store(&dir);
    let mut w = store.new_writer();

    w.insert(b"a", b"1").unwrap();
    let rp = store
        .create_recovery_point(store.new_snapshot(), b"m")
        .unwrap();
    assert_eq!(store.get_recovery_points().len(), 1);
    store.remove_recovery_point(&rp).unwrap();
    assert!(store.get_recovery_points().is_empty());
}

#[test]
fn test_persist_evict_and_reload() {
    let dir = TempDir::new().unwrap();
    let store = open_store(&dir);
    let mut w = store.new_writer();

    let mut rng = StdRng::seed_from_u64(7);
    let mut expected = BTreeMap::new();
    for _ in 0..10_000 {
        let key = format!("key-{:08}", rng.gen_range(0..100_000_000u64));
        let value = format!("val-{}", rng.gen_range(0..1_000_000u64));
        w.insert(key.as_bytes(), value.as_bytes()).unwrap();
        expected.insert(key, value);
    }

    store.persist_all().unwrap();
    store.evict_all().unwrap();

    // reads are served by reloading pages from the log
    for (key, value) in expected.iter().take(1000) {
        assert_eq!(
            w.lookup(key.as_bytes()).unwrap(),
            value.as_bytes().to_vec(),
            "key {key} after evict"
        );
    }

    let got = drain(store.new_iterator());
    assert_eq!(got.len(), expected.len());
}

#[test]
fn test_split_keeps_union_and_order() {
    let dir = TempDir::new().unwrap();
    let config = Config::new(dir.path())
        .max_delta_chain_len(16)
        .max_page_items(256)
        .min_page_items(2);
    let store = open_store_with(config);
    let mut w = store.new_writer();

    for i in 0..512u32 {
        w.insert(format!("key-{i:04}").as_bytes(), b"v").unwrap();
    }

    let stats = store.stats();
    assert!(stats.num_pages >= 2, "expected a split, got {stats:?}");

    let got = drain(store.new_iterator());
    assert_eq!(got.len(), 512);
    for (i, (key, _)) in got.iter().enumerate() {
        assert_eq!(key, format!("key-{i:04}").as_bytes());
    }
}

#[test]
fn test_merge_after_heavy_deletes() {
    let dir = TempDir::new().unwrap();
    let config = Config::new(dir.path())
        .max_delta_chain_len(8)
        .max_page_items(64)
        .min_page_items(4);
    let store = open_store_with(config);
    let mut w = store.new_writer();

    for i in 0..256u32 {
        w.insert(format!("k{i:04}").as_bytes(), b"v").unwrap();
    }
    let pages_after_split = store.stats().num_pages;
    assert!(pages_after_split > 1);

    // empty out the upper half; the pages covering it become merge
    // candidates as compaction shrinks them
    for i in 128..256u32 {
        w.delete(format!("k{i:04}").as_bytes()).unwrap();
    }
    for round in 0..64u32 {
        w.insert(format!("churn-{round:02}").as_bytes(), b"v").unwrap();
        w.delete(format!("churn-{round:02}").as_bytes()).unwrap();
    }

    // emptied pages merge away as compaction shrinks them
    assert!(store.stats().num_pages <= pages_after_split);

    let got = drain(store.new_iterator());
    assert_eq!(got.len(), 128);
    for (i, (key, _)) in got.iter().enumerate() {
        assert_eq!(key, format!("k{i:04}").as_bytes());
    }
}

#[test]
fn test_concurrent_writers_disjoint_ranges() {
    let dir = TempDir::new().unwrap();
    let store = open_store(&dir);

    const THREADS: u32 = 8;
    const PER_THREAD: u32 = 5_000;

    std::thread::scope(|s| {
        for t in 0..THREADS {
            let store = store.clone();
            s.spawn(move || {
                let mut w = store.new_writer();
                for i in 0..PER_THREAD {
                    let key = format!("t{t:02}-{i:06}");
                    w.insert(key.as_bytes(), b"v").expect("insert");
                }
            });
        }
    });

    assert_eq!(store.count(), (THREADS * PER_THREAD) as i64);

    let got = drain(store.new_iterator());
    assert_eq!(got.len(), (THREADS * PER_THREAD) as usize);
    for pair in got.windows(2) {
        assert!(pair[0].0 < pair[1].0, "iteration must be strictly ascending");
    }
}

#[test]
fn test_reopen_recovers_data() {
    let dir = TempDir::new().unwrap();
    {
        let store = open_store(&dir);
        let mut w = store.new_writer();
        for i in 0..500u32 {
            w.insert(format!("key-{i:04}").as_bytes(), format!("v{i}").as_bytes())
                .unwrap();
        }
        w.delete(b"key-0100").unwrap();
        store
            .create_recovery_point(store.new_snapshot(), b"checkpoint")
            .unwrap();
        store.close().unwrap();
    }

    let store = open_store(&dir);
    assert_eq!(store.get_recovery_points().len(), 1);
    assert_eq!(store.get_recovery_points()[0].meta(), b"checkpoint");

    let w = store.new_writer();
    assert_eq!(w.lookup(b"key-0000").unwrap(), b"v0".to_vec());
    assert_eq!(w.lookup(b"key-0499").unwrap(), b"v499".to_vec());
    assert_eq!(w.lookup(b"key-0100"), Err(Error::ItemNotFound));

    let got = drain(store.new_iterator());
    assert_eq!(got.len(), 499);
}

#[test]
fn test_reopen_bounds_sequence_numbers() {
    let dir = TempDir::new().unwrap();
    let old_sn;
    {
        let store = open_store(&dir);
        let mut w = store.new_writer();
        w.insert(b"k", b"old").unwrap();
        // the first snapshot always writes a max-sn checkpoint
        let snap = store.new_snapshot();
        old_sn = snap.sn();
        snap.close();
        store.close().unwrap();
    }

    let store = open_store(&dir);
    let snap = store.new_snapshot();
    assert!(
        snap.sn() > old_sn,
        "sequence numbers must not collide across restarts"
    );
    snap.close();

    // a rewrite after restart wins over the recovered version
    let mut w = store.new_writer();
    w.insert(b"k", b"new").unwrap();
    assert_eq!(w.lookup(b"k").unwrap(), b"new".to_vec());
}

#[test]
fn test_iterator_seek() {
    let dir = TempDir::new().unwrap();
    let store = open_store(&dir);
    let mut w = store.new_writer();
    for key in [&b"apple"[..], b"banana", b"cherry", b"damson"] {
        w.insert(key, b"v").unwrap();
    }

    let mut it = store.new_iterator();
    it.seek(b"b");
    assert_eq!(it.key(), Some(&b"banana"[..]));
    it.seek(b"cherry");
    assert_eq!(it.key(), Some(&b"cherry"[..]));
    it.seek(b"zzz");
    assert!(!it.valid());
}

#[test]
fn test_exclusive_directory_access() {
    let dir = TempDir::new().unwrap();
    let store = open_store(&dir);

    match Store::open(Config::new(dir.path())) {
        Err(Error::Io(_)) => {}
        Err(other) => panic!("expected an io error, got {other:?}"),
        Ok(_) => panic!("second open must not succeed"),
    }

    drop(store);
    let reopened = Store::open(Config::new(dir.path()));
    assert!(reopened.is_ok());
}

#[test]
fn test_writer_after_close_is_rejected() {
    let dir = TempDir::new().unwrap();
    let store = open_store(&dir);
    let mut w = store.new_writer();
    w.insert(b"a", b"1").unwrap();
    store.close().unwrap();

    assert_eq!(w.insert(b"b", b"2"), Err(Error::ShuttingDown));
    assert_eq!(w.lookup(b"a"), Err(Error::ShuttingDown));
}

#[tokio::test]
async fn test_background_persist_task() {
    use emberdb::{PersistTask, Scheduler};
    use std::time::Duration;

    let dir = TempDir::new().unwrap();
    let config = Config::new(dir.path()).auto_persist_interval(Duration::from_millis(20));
    let store = open_store_with(config);

    {
        let mut w = store.new_writer();
        for i in 0..100u32 {
            w.insert(format!("bg-{i:03}").as_bytes(), b"v").unwrap();
        }
    }

    let scheduler = Scheduler::new();
    scheduler.register(Arc::new(PersistTask::new(store.clone())));
    tokio::time::sleep(Duration::from_millis(100)).await;
    scheduler.shutdown().await.unwrap();

    // the background task flushed everything; evicted reads come back
    // from the log
    store.evict_all().unwrap();
    let w = store.new_writer();
    assert_eq!(w.lookup(b"bg-050").unwrap(), b"v".to_vec());
}
