//! Multi-version concurrency control: snapshots, filtered iteration,
//! recovery points and rollback.
//!
//! Every insert and delete carries the writer's last-observed global
//! sequence number. A snapshot pins an SN; its iterator composes filters
//! over the version streams the pages produce, so readers never block
//! writers. The snapshot list, the recovery-point list and rollback are
//! the only parts of the engine serialized by a lock.

use std::sync::atomic::{AtomicI32, AtomicI64, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};

use byteorder::{BigEndian, ByteOrder};
use itertools::Itertools;

use crate::errcorrupt;
use crate::error::{Error, Result};
use crate::item::Item;
use crate::lss::{BlockType, BLOCK_TYPE_SIZE};
use crate::page::collect::ItemFilter;
use crate::page::DeltaRef;
use crate::store::{Store, StoreIterator};

/// A read-only view at a sequence number.
///
/// A snapshot starts with two references: one for its creator, one held
/// by its predecessor on the snapshot chain. Full closure therefore
/// propagates in SN order, which is what lets the garbage watermark
/// advance monotonically. Using a snapshot after closing the last
/// reference is a caller bug; debug builds panic on it.
pub struct Snapshot {
    sn: u64,
    count: AtomicI64,
    ref_count: AtomicI32,
    child: Mutex<Option<Arc<Snapshot>>>,
    gc: Arc<GcState>,
    store: Weak<Store>,
    weak_self: Weak<Snapshot>,
}

impl Snapshot {
    pub(crate) fn new(
        sn: u64,
        refs: i32,
        gc: Arc<GcState>,
        store: Weak<Store>,
        weak_self: Weak<Snapshot>,
    ) -> Snapshot {
        Snapshot {
            sn,
            count: AtomicI64::new(0),
            ref_count: AtomicI32::new(refs),
            child: Mutex::new(None),
            gc,
            store,
            weak_self,
        }
    }

    pub fn sn(&self) -> u64 {
        self.sn
    }

    /// Item count at snapshot creation.
    pub fn count(&self) -> i64 {
        self.count.load(Ordering::Acquire)
    }

    pub(crate) fn set_count(&self, count: i64) {
        self.count.store(count, Ordering::Release);
    }

    pub(crate) fn set_child(&self, child: Arc<Snapshot>) {
        if let Ok(mut slot) = self.child.lock() {
            *slot = Some(child);
        }
    }

    /// Takes an extra reference, e.g. for an iterator.
    pub fn open(&self) {
        let prev = self.ref_count.fetch_add(1, Ordering::AcqRel);
        debug_assert!(prev > 0, "snapshot used after close");
    }

    /// Drops one reference. The last one advances the garbage watermark
    /// and releases the hold on the successor.
    pub fn close(&self) {
        let prev = self.ref_count.fetch_sub(1, Ordering::AcqRel);
        debug_assert!(prev > 0, "snapshot closed twice");
        if prev == 1 {
            self.gc.full_close(self.sn);
            let child = self.child.lock().ok().and_then(|mut c| c.take());
            if let Some(child) = child {
                child.close();
            }
        }
    }

    /// An iterator over exactly the keys whose newest version at or
    /// below this snapshot's SN is an insert. Closing the iterator
    /// releases the reference taken here.
    pub fn new_iterator(&self) -> Result<StoreIterator> {
        let store = self.store.upgrade().ok_or(Error::ShuttingDown)?;
        let snap = self.weak_self.upgrade().ok_or(Error::ShuttingDown)?;
        self.open();
        Ok(StoreIterator::new(store, Some(snap), self.sn))
    }
}

/// Garbage bookkeeping shared by snapshots, writers and compaction.
pub(crate) struct GcState {
    gc_sn: AtomicU64,
    live: Mutex<Vec<u64>>,
    /// Chains detached by successful CAS publications, keyed by the SN
    /// current when they were staged. Dropped once no live snapshot can
    /// still reach them.
    pending: Mutex<Vec<(u64, Vec<DeltaRef>)>>,
}

impl GcState {
    pub(crate) fn new(sn: u64) -> GcState {
        GcState {
            gc_sn: AtomicU64::new(sn),
            live: Mutex::new(Vec::new()),
            pending: Mutex::new(Vec::new()),
        }
    }

    pub(crate) fn gc_sn(&self) -> u64 {
        self.gc_sn.load(Ordering::Acquire)
    }

    pub(crate) fn set_gc_sn(&self, sn: u64) {
        self.gc_sn.store(sn, Ordering::Release);
    }

    /// Records a snapshot handed out to a reader.
    pub(crate) fn register(&self, sn: u64) {
        if let Ok(mut live) = self.live.lock() {
            live.push(sn);
        }
    }

    pub(crate) fn live_sns(&self) -> Vec<u64> {
        self.live.lock().map(|l| l.clone()).unwrap_or_default()
    }

    fn full_close(&self, sn: u64) {
        self.gc_sn.fetch_max(sn, Ordering::AcqRel);
        let floor = {
            let mut live = match self.live.lock() {
                Ok(l) => l,
                Err(_) => return,
            };
            live.retain(|&s| s != sn);
            live.iter().min().copied()
        };
        if let Ok(mut pending) = self.pending.lock() {
            match floor {
                Some(floor) => pending.retain(|(staged, _)| *staged >= floor),
                None => pending.clear(),
            }
        }
    }

    /// Defers freeing of detached chains until every snapshot open now
    /// has closed.
    pub(crate) fn stage(&self, sn: u64, deltas: Vec<DeltaRef>) {
        let has_readers = self.live.lock().map(|l| !l.is_empty()).unwrap_or(false);
        if !has_readers {
            // nothing can reach the chain; drop immediately
            return;
        }
        if let Ok(mut pending) = self.pending.lock() {
            pending.push((sn, deltas));
        }
    }

    #[cfg(test)]
    pub(crate) fn pending_len(&self) -> usize {
        self.pending.lock().map(|p| p.len()).unwrap_or(0)
    }
}

/// Drops versions that fall inside an erased interval.
#[derive(Default)]
pub struct RollbackFilter {
    intervals: Vec<(u64, u64)>,
}

impl RollbackFilter {
    pub fn new() -> RollbackFilter {
        RollbackFilter::default()
    }

    pub fn add(&mut self, start: u64, end: u64) {
        self.intervals.push((start, end));
    }

    pub fn reset(&mut self) {
        self.intervals.clear();
    }

    pub fn masks(&self, sn: u64) -> bool {
        self.intervals
            .iter()
            .any(|&(start, end)| sn >= start && sn <= end)
    }
}

impl ItemFilter for RollbackFilter {
    fn process(&mut self, itm: &Arc<Item>, out: &mut Vec<Arc<Item>>) {
        if !self.masks(itm.sn()) {
            out.push(itm.clone());
        }
    }
}

/// Snapshot visibility: for each key, the newest version with
/// `sn <= snapshot sn` decides. An insert is emitted, a delete
/// suppresses the whole key, and older versions of a decided key are
/// always dropped.
pub struct SnFilter {
    sn: u64,
    decided: Option<Vec<u8>>,
}

impl SnFilter {
    pub fn new(sn: u64) -> SnFilter {
        SnFilter { sn, decided: None }
    }
}

impl ItemFilter for SnFilter {
    fn process(&mut self, itm: &Arc<Item>, out: &mut Vec<Arc<Item>>) {
        if itm.sn() > self.sn {
            return;
        }
        if self.decided.as_deref() == Some(itm.key()) {
            return;
        }
        self.decided = Some(itm.key().to_vec());
        if itm.is_insert() {
            out.push(itm.clone());
        }
    }
}

/// Compaction GC: discards versions no live snapshot can distinguish
/// from a newer version of the same key. `boundaries` is the sorted
/// list of protection points (live snapshot SNs, recovery-point SNs,
/// zero and the current SN); a version is discardable iff it sits
/// strictly inside the same interval as a newer version of its key.
pub struct GcFilter {
    boundaries: Vec<u64>,
    skip_item: Option<Arc<Item>>,
    /// Newest version seen for the current key, whether it survived or
    /// was erased; older versions shadow against it.
    shadow: Option<Arc<Item>>,
}

impl GcFilter {
    pub fn new(boundaries: Vec<u64>) -> GcFilter {
        GcFilter {
            boundaries,
            skip_item: None,
            shadow: None,
        }
    }

    fn find_interval(&self, sn: u64) -> Option<usize> {
        self.boundaries
            .iter()
            .tuple_windows()
            .position(|(lo, hi)| sn > *lo && sn <= *hi)
    }

    fn in_interval(&self, idx: usize, sn: u64) -> bool {
        sn > self.boundaries[idx] && sn < self.boundaries[idx + 1]
    }

    fn shadowed(&self, newer_sn: u64, sn: u64) -> bool {
        match self.find_interval(newer_sn) {
            Some(idx) => self.in_interval(idx, sn),
            None => false,
        }
    }
}

impl ItemFilter for GcFilter {
    fn process(&mut self, itm: &Arc<Item>, out: &mut Vec<Arc<Item>>) {
        let skip = self.skip_item.take();

        if itm.is_delete() {
            // hold the marker; whether it survives depends on what it
            // shadows
            self.skip_item = Some(itm.clone());
            return;
        }

        if let Some(skip) = skip {
            if skip.key() == itm.key() {
                if skip.sn() == itm.sn() || self.shadowed(skip.sn(), itm.sn()) {
                    // no snapshot separates the delete from this insert;
                    // both vanish, and older versions still shadow
                    // against the erased marker
                    self.shadow = Some(skip);
                    return;
                }
                out.push(skip);
                out.push(itm.clone());
                self.shadow = Some(itm.clone());
                return;
            }
            // a delete with nothing under it erases the key outright
        }

        if let Some(prev) = &self.shadow {
            if prev.key() == itm.key() && self.shadowed(prev.sn(), itm.sn()) {
                return;
            }
        }
        out.push(itm.clone());
        self.shadow = Some(itm.clone());
    }
}

/// A persisted snapshot SN plus caller metadata, usable as a rollback
/// target.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecoveryPoint {
    pub(crate) sn: u64,
    pub(crate) count: i64,
    pub(crate) meta: Vec<u8>,
}

impl RecoveryPoint {
    pub fn sn(&self) -> u64 {
        self.sn
    }

    pub fn count(&self) -> i64 {
        self.count
    }

    pub fn meta(&self) -> &[u8] {
        &self.meta
    }
}

/// `[version: u16][n: u16] n x {len: u32, sn: u64, count: u64, meta}`,
/// big-endian; `len` covers itself, the fixed fields and the metadata.
pub(crate) fn marshal_rps(rps: &[Arc<RecoveryPoint>], version: u16) -> Vec<u8> {
    let body: usize = rps.iter().map(|rp| 4 + 8 + 8 + rp.meta.len()).sum();
    let mut bs = Vec::with_capacity(2 + 2 + body);
    bs.extend_from_slice(&version.to_be_bytes());
    bs.extend_from_slice(&(rps.len() as u16).to_be_bytes());
    for rp in rps {
        let len = (4 + 8 + 8 + rp.meta.len()) as u32;
        bs.extend_from_slice(&len.to_be_bytes());
        bs.extend_from_slice(&rp.sn.to_be_bytes());
        bs.extend_from_slice(&(rp.count as u64).to_be_bytes());
        bs.extend_from_slice(&rp.meta);
    }
    bs
}

pub(crate) fn unmarshal_rps(bs: &[u8]) -> Result<(u16, Vec<Arc<RecoveryPoint>>)> {
    if bs.len() < 4 {
        return Err(errcorrupt!("truncated recovery-point block"));
    }
    let version = BigEndian::read_u16(&bs[..2]);
    let n = BigEndian::read_u16(&bs[2..4]) as usize;
    let mut offset = 4usize;
    let mut rps = Vec::with_capacity(n);
    for _ in 0..n {
        if offset + 4 > bs.len() {
            return Err(errcorrupt!("truncated recovery-point block"));
        }
        let len = BigEndian::read_u32(&bs[offset..offset + 4]) as usize;
        let end = offset + len;
        if len < 4 + 8 + 8 || end > bs.len() {
            return Err(errcorrupt!("truncated recovery-point entry"));
        }
        let sn = BigEndian::read_u64(&bs[offset + 4..offset + 12]);
        let count = BigEndian::read_u64(&bs[offset + 12..offset + 20]) as i64;
        let meta = bs[offset + 20..end].to_vec();
        rps.push(Arc::new(RecoveryPoint { sn, count, meta }));
        offset = end;
    }
    Ok((version, rps))
}

pub(crate) fn decode_max_sn(payload: &[u8]) -> Result<u64> {
    if payload.len() != 8 {
        return Err(errcorrupt!("malformed max-sn block"));
    }
    Ok(BigEndian::read_u64(payload))
}

impl Store {
    /// Creates a snapshot pinning every version with `sn <= snapshot.sn`.
    /// Rolls per-writer counters into the global item count and stages
    /// writer reclaim lists for the garbage watermark.
    pub fn new_snapshot(&self) -> Arc<Snapshot> {
        let mut state = self.mvcc.write().unwrap();
        self.new_snapshot_locked(&mut state)
    }

    pub(crate) fn new_snapshot_locked(
        &self,
        state: &mut crate::store::MvccState,
    ) -> Arc<Snapshot> {
        let snap = state.curr_snapshot.clone();

        let next_sn = self.curr_sn.fetch_add(1, Ordering::SeqCst) + 1;
        let next = Arc::new_cyclic(|weak| {
            Snapshot::new(
                next_sn,
                2,
                self.gc.clone(),
                self.weak_handle(),
                weak.clone(),
            )
        });
        snap.set_child(next.clone());
        state.curr_snapshot = next;

        if let Err(e) = self.update_max_sn(state, next_sn, false) {
            tracing::error!(error = %e, "max-sn checkpoint failed");
        }

        let mut staged: Vec<DeltaRef> = Vec::new();
        {
            let writers = self.writers.lock().unwrap();
            for w in writers.iter() {
                state.items_count += w.count.swap(0, Ordering::AcqRel);
                if let Ok(mut reclaim) = w.reclaim.lock() {
                    staged.append(&mut reclaim);
                }
            }
        }
        snap.set_count(state.items_count);

        self.gc.register(snap.sn());
        if !staged.is_empty() {
            self.gc.stage(snap.sn(), staged);
        }
        snap
    }

    /// Writes a max-SN block bounding post-crash sequence numbers. Fires
    /// every `max_sn_sync_frequency` snapshots; the counter starts at
    /// zero, so the first snapshot after open always checkpoints.
    fn update_max_sn(
        &self,
        state: &mut crate::store::MvccState,
        sn: u64,
        force: bool,
    ) -> Result<()> {
        let freq = self.config.max_sn_sync_frequency;
        if state.num_sn_created % freq == 0 || force {
            let max_sn = sn + freq + 1;
            let mut bs = [0u8; 8];
            BigEndian::write_u64(&mut bs, max_sn);
            let mut res = self.lss.reserve(BLOCK_TYPE_SIZE + bs.len())?;
            res.write_block(BlockType::MaxSn, &bs);
            res.finalize()?;
            self.lss.sync(true)?;
            state.last_max_sn = max_sn;
        }
        state.num_sn_created += 1;
        Ok(())
    }

    fn update_recovery_points(
        &self,
        state: &mut crate::store::MvccState,
        rps: Vec<Arc<RecoveryPoint>>,
    ) -> Result<()> {
        let version = state.rp_version.wrapping_add(1);
        let bs = marshal_rps(&rps, version);
        let mut res = self.lss.reserve(BLOCK_TYPE_SIZE + bs.len())?;
        res.write_block(BlockType::RecoveryPoints, &bs);
        res.finalize()?;
        state.rp_version = version;
        state.recovery_points = rps;
        Ok(())
    }

    /// Durably captures `snap` as a rollback target. The RP list is
    /// written, every page is persisted, and the list is written once
    /// more so the on-disk version matches the post-flush state, then
    /// everything is fsynced. Closes the caller's snapshot reference.
    pub fn create_recovery_point(
        &self,
        snap: Arc<Snapshot>,
        meta: &[u8],
    ) -> Result<Arc<RecoveryPoint>> {
        let rp = Arc::new(RecoveryPoint {
            sn: snap.sn(),
            count: snap.count(),
            meta: meta.to_vec(),
        });

        let rps = {
            let mut state = self.mvcc.write().unwrap();
            let mut rps = state.recovery_points.clone();
            rps.push(rp.clone());
            self.update_recovery_points(&mut state, rps.clone())?;
            rps
        };

        snap.close();
        self.persist_all()?;

        // stabilising second write of the same list
        {
            let mut state = self.mvcc.write().unwrap();
            self.update_recovery_points(&mut state, rps)?;
        }
        self.lss.sync(true)?;
        Ok(rp)
    }

    pub fn get_recovery_points(&self) -> Vec<Arc<RecoveryPoint>> {
        self.mvcc.read().unwrap().recovery_points.clone()
    }

    pub fn remove_recovery_point(&self, rp: &RecoveryPoint) -> Result<()> {
        let mut state = self.mvcc.write().unwrap();
        let rps: Vec<Arc<RecoveryPoint>> = state
            .recovery_points
            .iter()
            .filter(|r| r.sn != rp.sn)
            .cloned()
            .collect();
        self.update_recovery_points(&mut state, rps)
    }

    /// Rolls the whole store back to `rp`: every page gets a rollback
    /// delta erasing `[rp.sn + 1, curr_sn]` and is flushed; the
    /// recovery-point list is truncated; a fresh snapshot carrying the
    /// recovery point's count becomes current.
    pub fn rollback(&self, rp: &RecoveryPoint) -> Result<Arc<Snapshot>> {
        let mut state = self.mvcc.write().unwrap();

        let start = rp.sn + 1;
        let end = self.curr_sn.load(Ordering::SeqCst);
        tracing::info!(start, end, "rolling back");

        self.page_visitor(self.config.num_persistor_threads, |pid, shard| {
            let ctx = &self.persist_ctxs[shard % self.persist_ctxs.len()];
            loop {
                let Some(mut pg) = self.read_page(pid)? else {
                    return Ok(());
                };
                pg.rollback(start, end);
                // may conflict with concurrent writers; retry from a
                // fresh read
                let mut ctx = ctx.lock().unwrap();
                if self.flush_page(&mut pg, &mut ctx)? {
                    return Ok(());
                }
            }
        })?;
        self.lss.sync(false)?;

        // pending writer counters describe erased operations
        for w in self.writers.lock().unwrap().iter() {
            w.count.store(0, Ordering::Release);
        }
        state.items_count = rp.count;
        let snap = self.new_snapshot_locked(&mut state);

        let rps: Vec<Arc<RecoveryPoint>> = state
            .recovery_points
            .iter()
            .filter(|r| r.sn <= rp.sn)
            .cloned()
            .collect();
        self.update_recovery_points(&mut state, rps)?;
        self.gc.set_gc_sn(snap.sn());

        self.lss.sync(true)?;
        Ok(snap)
    }

    /// GC boundaries for compaction: zero, the recovery-point SNs, the
    /// live snapshot SNs, and the current SN.
    pub(crate) fn gc_filter(&self) -> GcFilter {
        let mut bounds: Vec<u64> = {
            let state = self.mvcc.read().unwrap();
            state.recovery_points.iter().map(|r| r.sn).collect()
        };
        bounds.extend(self.gc.live_sns());
        bounds.push(0);
        bounds.push(self.curr_sn.load(Ordering::SeqCst));
        bounds.sort_unstable();
        bounds.dedup();
        GcFilter::new(bounds)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ins(key: &[u8], sn: u64) -> Arc<Item> {
        Arc::new(Item::insert(key, Some(b"v"), sn))
    }

    fn del(key: &[u8], sn: u64) -> Arc<Item> {
        Arc::new(Item::delete(key, sn))
    }

    fn run_filter(filter: &mut dyn ItemFilter, stream: &[Arc<Item>]) -> Vec<(Vec<u8>, u64)> {
        let mut out = Vec::new();
        for itm in stream {
            filter.process(itm, &mut out);
        }
        out.iter().map(|i| (i.key().to_vec(), i.sn())).collect()
    }

    #[test]
    fn test_sn_filter_picks_newest_qualifying_insert() {
        // stream is (key asc, sn desc)
        let stream = vec![ins(b"a", 9), ins(b"a", 4), ins(b"b", 7)];
        let got = run_filter(&mut SnFilter::new(5), &stream);
        assert_eq!(got, vec![(b"a".to_vec(), 4)]);
    }

    #[test]
    fn test_sn_filter_suppresses_deleted_key() {
        let stream = vec![del(b"a", 6), ins(b"a", 3), ins(b"a", 2), ins(b"b", 1)];
        let got = run_filter(&mut SnFilter::new(10), &stream);
        // the delete decides "a"; every older version stays hidden
        assert_eq!(got, vec![(b"b".to_vec(), 1)]);
    }

    #[test]
    fn test_sn_filter_ignores_future_versions() {
        let stream = vec![del(b"a", 8), ins(b"a", 3)];
        let got = run_filter(&mut SnFilter::new(5), &stream);
        assert_eq!(got, vec![(b"a".to_vec(), 3)]);
    }

    #[test]
    fn test_rollback_filter_masks_interval() {
        let mut f = RollbackFilter::new();
        f.add(4, 6);
        let stream = vec![ins(b"a", 7), ins(b"a", 5), ins(b"b", 4)];
        let got = run_filter(&mut f, &stream);
        assert_eq!(got, vec![(b"a".to_vec(), 7)]);
    }

    #[test]
    fn test_gc_filter_collapses_unprotected_versions() {
        // no live snapshot between 0 and 10: older shadowed versions go
        let mut f = GcFilter::new(vec![0, 10]);
        let stream = vec![ins(b"a", 9), ins(b"a", 4), ins(b"b", 3)];
        let got = run_filter(&mut f, &stream);
        assert_eq!(got, vec![(b"a".to_vec(), 9), (b"b".to_vec(), 3)]);
    }

    #[test]
    fn test_gc_filter_keeps_versions_pinned_by_snapshot() {
        // a live snapshot at 5 separates sn 9 from sn 4
        let mut f = GcFilter::new(vec![0, 5, 10]);
        let stream = vec![ins(b"a", 9), ins(b"a", 4)];
        let got = run_filter(&mut f, &stream);
        assert_eq!(got, vec![(b"a".to_vec(), 9), (b"a".to_vec(), 4)]);
    }

    #[test]
    fn test_gc_filter_drops_delete_and_shadowed_insert_together() {
        let mut f = GcFilter::new(vec![0, 10]);
        let stream = vec![del(b"a", 9), ins(b"a", 4), ins(b"b", 3)];
        let got = run_filter(&mut f, &stream);
        assert_eq!(got, vec![(b"b".to_vec(), 3)]);
    }

    #[test]
    fn test_gc_filter_keeps_pinned_delete_marker() {
        // snapshot at 5 can still see sn 4, so the delete at 9 must
        // survive to mask it
        let mut f = GcFilter::new(vec![0, 5, 10]);
        let stream = vec![del(b"a", 9), ins(b"a", 4)];
        let got = run_filter(&mut f, &stream);
        assert_eq!(got, vec![(b"a".to_vec(), 9), (b"a".to_vec(), 4)]);
    }

    #[test]
    fn test_gc_filter_erases_full_version_chain() {
        // delete, shadowed insert, and an even older insert all share
        // one interval: the whole chain goes
        let mut f = GcFilter::new(vec![0, 10]);
        let stream = vec![del(b"a", 5), ins(b"a", 3), ins(b"a", 1)];
        let got = run_filter(&mut f, &stream);
        assert!(got.is_empty());
    }

    #[test]
    fn test_gc_filter_drops_dangling_delete() {
        let mut f = GcFilter::new(vec![0, 10]);
        let stream = vec![del(b"a", 9), ins(b"b", 3)];
        let got = run_filter(&mut f, &stream);
        assert_eq!(got, vec![(b"b".to_vec(), 3)]);
    }

    #[test]
    fn test_gc_staging_waits_for_open_snapshots() {
        let gc = GcState::new(0);
        // no readers: staged chains drop immediately
        gc.stage(1, Vec::new());
        assert_eq!(gc.pending_len(), 0);

        gc.register(5);
        gc.stage(6, Vec::new());
        assert_eq!(gc.pending_len(), 1);

        gc.full_close(5);
        assert_eq!(gc.pending_len(), 0);
        assert_eq!(gc.gc_sn(), 5);
    }

    #[test]
    fn test_rps_roundtrip() {
        let rps = vec![
            Arc::new(RecoveryPoint {
                sn: 10,
                count: 100,
                meta: b"first".to_vec(),
            }),
            Arc::new(RecoveryPoint {
                sn: 20,
                count: 150,
                meta: Vec::new(),
            }),
        ];
        let bs = marshal_rps(&rps, 3);
        let (version, back) = unmarshal_rps(&bs).unwrap();
        assert_eq!(version, 3);
        assert_eq!(back.len(), 2);
        assert_eq!(back[0].sn(), 10);
        assert_eq!(back[0].count(), 100);
        assert_eq!(back[0].meta(), b"first");
        assert_eq!(back[1].sn(), 20);
        assert_eq!(back[1].meta(), b"");
    }

    #[test]
    fn test_rps_truncated() {
        let rps = vec![Arc::new(RecoveryPoint {
            sn: 1,
            count: 1,
            meta: b"m".to_vec(),
        })];
        let bs = marshal_rps(&rps, 1);
        assert!(unmarshal_rps(&bs[..bs.len() - 1]).is_err());
    }
}
