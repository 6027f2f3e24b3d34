//! The store: the single object owning the page table, the log, and the
//! MVCC control state.
//!
//! All global state (the current sequence number, the snapshot chain,
//! the recovery-point list, the log cursor) lives here and is passed
//! explicitly to writers and readers; there are no ambient singletons.
//! Page mutation is lock-free through the page table CAS; only the MVCC
//! control surface is serialized by `mvcc`'s reader-writer lock.

use std::fs;
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock, Weak};

use byteorder::{BigEndian, ByteOrder};
use serde::Serialize;

use crate::config::Config;
use crate::errcorrupt;
use crate::error::Result;
use crate::flock::FileLock;
use crate::item::Item;
use crate::lss::{BlockType, Lss, LssOffset, BLOCK_TYPE_SIZE};
use crate::mvcc::{self, GcState, RecoveryPoint, SnFilter, Snapshot};
use crate::page::codec::{self, PageHeader};
use crate::page::{base_head, DeltaContent, DeltaRef, LookupStep, Page, PageDelta};
use crate::pagetable::{PageBound, PageId, PageTable};
use crate::writer::{FlushCtx, Writer, WriterShared};

const LOCK_FILE: &str = "emberdb.lock";
const LOG_FILE: &str = "store.lss";

pub(crate) struct MvccState {
    pub curr_snapshot: Arc<Snapshot>,
    pub recovery_points: Vec<Arc<RecoveryPoint>>,
    pub rp_version: u16,
    pub num_sn_created: u64,
    pub last_max_sn: u64,
    pub items_count: i64,
}

pub(crate) struct Stats {
    pub flush_data_size: AtomicI64,
    pub mem_used: AtomicI64,
}

/// Point-in-time store statistics.
#[derive(Debug, Clone, Serialize)]
pub struct StatsSnapshot {
    pub flush_data_size: i64,
    pub mem_used: i64,
    pub num_pages: usize,
    pub items_count: i64,
    pub gc_sn: u64,
}

/// An embedded, ordered key/value store.
pub struct Store {
    pub(crate) config: Config,
    pub(crate) table: PageTable,
    pub(crate) lss: Lss,
    pub(crate) curr_sn: AtomicU64,
    pub(crate) gc: Arc<GcState>,
    pub(crate) mvcc: RwLock<MvccState>,
    pub(crate) writers: Mutex<Vec<Arc<WriterShared>>>,
    pub(crate) persist_ctxs: Vec<Mutex<FlushCtx>>,
    pub(crate) evict_ctxs: Vec<Mutex<FlushCtx>>,
    pub(crate) stats: Stats,
    shutdown: AtomicBool,
    weak_self: Weak<Store>,
    _lock: FileLock,
}

struct Recovered {
    /// Page headers keyed by upper bound, in key order.
    pages: Vec<(PageHeader, LssOffset)>,
    recovery_points: Vec<Arc<RecoveryPoint>>,
    rp_version: u16,
    max_sn: u64,
}

impl Store {
    /// Opens the store in `dir`, creating it when empty and replaying
    /// the log when not.
    pub fn open(config: Config) -> Result<Arc<Store>> {
        fs::create_dir_all(&config.dir)?;
        let lock = FileLock::lock(config.dir.join(LOCK_FILE))?;
        let lss = Lss::open(&config.dir.join(LOG_FILE))?;
        let rec = recover(&lss)?;

        let table = PageTable::new();
        if rec.pages.is_empty() {
            table.create(
                PageBound::NegInf,
                Some(base_head(Vec::new(), None, PageId::pos_inf())),
            );
        } else {
            // pages tile the key space; each low bound is the previous
            // page's upper bound
            let mut low = PageBound::NegInf;
            for (header, offset) in &rec.pages {
                let right_sibling = match &header.right_low {
                    Some(itm) => PageId::for_key(itm.clone()),
                    None => PageId::pos_inf(),
                };
                // recovered pages start evicted and stream in on demand
                let head = Arc::new(PageDelta {
                    chain_len: 0,
                    num_items: header.num_items,
                    next: None,
                    hi_item: header.hi_item.clone(),
                    right_sibling,
                    content: DeltaContent::Flush {
                        offset: *offset,
                        data_size: 0,
                        num_segments: 0,
                    },
                });
                table.create(low, Some(head));
                low = match &header.hi_item {
                    Some(itm) => PageBound::Key(itm.clone()),
                    None => PageBound::PosInf,
                };
            }
        }

        let nthreads = config.num_persistor_threads;
        let items_count = rec.recovery_points.last().map_or(0, |rp| rp.count());
        tracing::info!(
            dir = %config.dir.display(),
            pages = table.len(),
            recovery_points = rec.recovery_points.len(),
            max_sn = rec.max_sn,
            "store opened"
        );

        Ok(Arc::new_cyclic(|weak| {
            let gc = Arc::new(GcState::new(rec.max_sn));
            let snapshot = Arc::new_cyclic(|snap_weak| {
                Snapshot::new(rec.max_sn, 1, gc.clone(), weak.clone(), snap_weak.clone())
            });
            snapshot.set_count(items_count);
            Store {
                curr_sn: AtomicU64::new(rec.max_sn),
                gc,
                mvcc: RwLock::new(MvccState {
                    curr_snapshot: snapshot,
                    recovery_points: rec.recovery_points,
                    rp_version: rec.rp_version,
                    num_sn_created: 0,
                    last_max_sn: rec.max_sn,
                    items_count,
                }),
                table,
                lss,
                writers: Mutex::new(Vec::new()),
                persist_ctxs: (0..nthreads).map(|_| Mutex::new(FlushCtx::new())).collect(),
                evict_ctxs: (0..nthreads).map(|_| Mutex::new(FlushCtx::new())).collect(),
                stats: Stats {
                    flush_data_size: AtomicI64::new(0),
                    mem_used: AtomicI64::new(0),
                },
                shutdown: AtomicBool::new(false),
                weak_self: weak.clone(),
                _lock: lock,
                config,
            }
        }))
    }

    /// Opens with default configuration.
    pub fn open_dir(dir: &str) -> Result<Arc<Store>> {
        Self::open(Config::new(dir))
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn is_shutdown(&self) -> bool {
        self.shutdown.load(Ordering::Acquire)
    }

    pub(crate) fn load_sn(&self) -> u64 {
        self.curr_sn.load(Ordering::SeqCst)
    }

    /// The owning handle. A method can only run while at least one
    /// `Arc` is alive, so the upgrade cannot fail.
    fn handle(&self) -> Arc<Store> {
        self.weak_self
            .upgrade()
            .expect("store accessed outside its Arc")
    }

    pub(crate) fn weak_handle(&self) -> Weak<Store> {
        self.weak_self.clone()
    }

    /// Registers a new writer with the store; its op counter is rolled
    /// up by snapshot creation.
    pub fn new_writer(&self) -> Writer {
        let shared = Arc::new(WriterShared {
            count: AtomicI64::new(0),
            reclaim: Mutex::new(Vec::new()),
        });
        self.writers.lock().unwrap().push(shared.clone());
        Writer::new(self.handle(), shared)
    }

    /// An iterator over the newest committed state.
    pub fn new_iterator(&self) -> StoreIterator {
        StoreIterator::new(self.handle(), None, u64::MAX)
    }

    /// Total logical item count: the rolled-up global count plus every
    /// writer's pending delta.
    pub fn count(&self) -> i64 {
        let mut total = self.mvcc.read().unwrap().items_count;
        for w in self.writers.lock().unwrap().iter() {
            total += w.count.load(Ordering::Acquire);
        }
        total
    }

    pub fn stats(&self) -> StatsSnapshot {
        StatsSnapshot {
            flush_data_size: self.stats.flush_data_size.load(Ordering::Relaxed),
            mem_used: self.stats.mem_used.load(Ordering::Relaxed),
            num_pages: self.table.len(),
            items_count: self.count(),
            gc_sn: self.gc.gc_sn(),
        }
    }

    /// Blocks until the log is durable; `force` fdatasyncs.
    pub fn sync(&self, force: bool) -> Result<()> {
        self.lss.sync(force)
    }

    /// Flushes everything, makes the log durable and marks the store
    /// shut down. Idempotent.
    pub fn close(&self) -> Result<()> {
        if self.is_shutdown() {
            return Ok(());
        }
        self.persist_all()?;
        self.lss.sync(true)?;
        self.shutdown.store(true, Ordering::Release);
        tracing::info!("store closed");
        Ok(())
    }

    /// Loads the page without touching the log; evicted pages come back
    /// with their flush barrier in place. `None` when the page is gone.
    pub(crate) fn read_page_nofetch(&self, pid: &PageId) -> Option<Page> {
        self.table.read_page(pid)
    }

    /// Loads the page, materializing evicted state from the log. The
    /// materialized chain is published so the next reader finds it in
    /// memory.
    pub(crate) fn read_page(&self, pid: &PageId) -> Result<Option<Page>> {
        loop {
            let Some(mut pg) = self.table.read_page(pid) else {
                return Ok(None);
            };
            let Some(offset) = pg.fetch_barrier() else {
                return Ok(Some(pg));
            };
            let (chain, num_segments) = self.fetch_chain(offset)?;
            pg.splice_fetched(chain, num_segments);
            if self.table.update_mapping(&mut pg) {
                return Ok(Some(pg));
            }
            // lost the swap-in race; reread whatever won
        }
    }

    /// Follows the linked blocks starting at `offset` and rebuilds the
    /// chain they encode.
    fn fetch_chain(&self, offset: LssOffset) -> Result<(DeltaRef, u16)> {
        let mut header: Option<PageHeader> = None;
        let mut deltas = Vec::new();
        let mut num_segments: u16 = 0;
        let mut next = Some(offset);

        while let Some(off) = next {
            let (typ, payload) = self.lss.read(off)?;
            match typ {
                BlockType::PageData | BlockType::PageUpdate | BlockType::PageReloc => {}
                other => {
                    return Err(errcorrupt!(
                        "block type {other:?} at offset {off} while reloading a page"
                    ));
                }
            }
            let (hdr, mut decoded, link) = codec::unmarshal(&payload)?;
            if header.is_none() {
                header = Some(hdr);
            }
            deltas.append(&mut decoded);
            if link.is_some() {
                num_segments += 1;
            }
            next = link;
        }

        let Some(header) = header else {
            return Err(errcorrupt!("empty page reload at offset {offset}"));
        };
        let head = codec::build_chain(&header, deltas)?;
        Ok((head, num_segments))
    }

    /// Routes the item to its page, prepends the record delta and
    /// publishes it. CAS conflicts and page splits observed mid-flight
    /// retry from a fresh seek. Chains the writer detaches along the way
    /// land on its reclaim list.
    pub(crate) fn mutate(&self, itm: Arc<Item>, w: &WriterShared) -> Result<()> {
        loop {
            let pid = self.table.page_id_of(&itm);
            let Some(mut pg) = self.read_page(&pid)? else {
                continue;
            };
            if pg.need_removal() {
                // a merge stalled half-way; finish it and reroute
                self.finish_merge(&pid)?;
                continue;
            }
            if !pg.in_range(&itm) {
                continue;
            }
            if itm.is_delete() {
                pg.delete(itm.clone());
            } else {
                pg.insert(itm.clone());
            }
            if self.table.update_mapping(&mut pg) {
                self.stats.mem_used.fetch_add(pg.mem_delta, Ordering::Relaxed);
                self.try_smos(&pid, w);
                return Ok(());
            }
        }
    }

    /// The newest version of the probe's key, following right-sibling
    /// links across pages.
    pub(crate) fn lookup_item(&self, probe: &Arc<Item>) -> Result<Option<Arc<Item>>> {
        let mut pid = self.table.page_id_of(probe);
        loop {
            let Some(pg) = self.read_page(&pid)? else {
                pid = self.table.page_id_of(probe);
                continue;
            };
            match pg.lookup(probe) {
                LookupStep::Found(itm) => return Ok(Some(itm)),
                LookupStep::NotFound => return Ok(None),
                LookupStep::Right(next) => pid = next,
                LookupStep::Fetch(_) => {
                    // raced with an eviction; reread materializes
                }
            }
        }
    }

    /// Post-publication structure checks, in the order the thresholds
    /// compose: a long chain compacts (GC-filtered), an oversized page
    /// splits, an underfilled page merges left.
    fn try_smos(&self, pid: &PageId, w: &WriterShared) {
        let Ok(Some(mut pg)) = self.read_page(pid) else {
            return;
        };

        if pg.need_compaction(self.config.max_delta_chain_len) {
            let mut filter = self.gc_filter();
            let detached = pg.prev_head.clone();
            if pg.compact(&mut filter).is_err() {
                return;
            }
            if !self.table.update_mapping(&mut pg) {
                // another writer got there first
                return;
            }
            if let Some(old) = detached {
                if let Ok(mut reclaim) = w.reclaim.lock() {
                    reclaim.push(old);
                }
            }
        }

        if pg.need_split(self.config.max_page_items) {
            self.try_split(&mut pg);
        } else if pg.need_merge(self.config.min_page_items) && !pg.need_removal() {
            self.try_merge(pid);
        }
    }

    /// Split protocol: the split delta is published on the left page
    /// first, then the new page is mapped. Seeks landing in the gap spin
    /// on their reroute loops until the mapping appears; a lost CAS
    /// abandons the attempt with nothing published.
    fn try_split(&self, pg: &mut Page) {
        let Ok(Some(plan)) = pg.split_plan() else {
            return;
        };
        let Ok(items) = pg.split_items(&plan.pivot) else {
            return;
        };
        let right_head = pg.split_right_head(items);
        let right_pid = PageId::for_key(plan.pivot.clone());

        pg.apply_split(&plan, right_pid);
        if self.table.update_mapping(pg) {
            self.table
                .create(PageBound::Key(plan.pivot.clone()), Some(right_head));
        }
    }

    /// Merge protocol: close the victim, absorb its chain into the left
    /// neighbor, then unlink it and record the removal in the log.
    fn try_merge(&self, pid: &PageId) {
        if self.table.prev_pid(pid).is_none() {
            // the leftmost page never merges
            return;
        }

        loop {
            let Ok(Some(mut pg)) = self.read_page(pid) else {
                return;
            };
            if pg.need_removal() {
                break;
            }
            pg.close();
            if self.table.update_mapping(&mut pg) {
                break;
            }
        }

        if let Err(e) = self.finish_merge(pid) {
            tracing::error!(error = %e, "page merge failed");
        }
    }

    /// Completes a merge whose victim is already closed: absorbs the
    /// chain below the remove delta into the left neighbor, unlinks the
    /// victim, and logs a remove block.
    pub(crate) fn finish_merge(&self, pid: &PageId) -> Result<()> {
        let Some(victim_head) = self.table.head_of(pid) else {
            return Ok(());
        };
        if victim_head.op() != crate::page::PageOp::Remove {
            return Ok(());
        }
        let Some(absorbed) = victim_head.next.clone() else {
            return Ok(());
        };

        loop {
            let Some(left_pid) = self.table.prev_pid(pid) else {
                return Ok(());
            };
            let Some(mut left) = self.read_page(&left_pid)? else {
                continue;
            };
            if left.already_merged(&absorbed) {
                break;
            }
            if left.need_removal() {
                // the left neighbor is being merged itself; its merger
                // will find this victim again
                return Ok(());
            }
            left.merge(&victim_head);
            if self.table.update_mapping(&mut left) {
                break;
            }
        }

        let hi = victim_head.hi_item.clone();
        self.table.unlink(pid);
        if let Err(e) = self.write_page_remove(hi.as_ref()) {
            tracing::warn!(error = %e, "failed to log page removal");
        }
        Ok(())
    }

    /// `lssPageRemove` payload: the absorbed page's encoded upper bound
    /// (length 0 for +∞).
    fn write_page_remove(&self, hi: Option<&Arc<Item>>) -> Result<()> {
        let mut payload = Vec::new();
        match hi {
            None => payload.extend_from_slice(&0u16.to_be_bytes()),
            Some(itm) => {
                payload.extend_from_slice(&(itm.encoded_size() as u16).to_be_bytes());
                itm.encode_into(&mut payload)?;
            }
        }
        let mut res = self.lss.reserve(BLOCK_TYPE_SIZE + payload.len())?;
        res.write_block(BlockType::PageRemove, &payload);
        res.finalize()
    }
}

/// Replays the log into the structures `open` rebuilds the store from.
fn recover(lss: &Lss) -> Result<Recovered> {
    use std::collections::BTreeMap;

    // page blocks keyed by upper bound; the latest block per bound wins
    let mut pages: BTreeMap<PageBound, (PageHeader, LssOffset)> = BTreeMap::new();
    let mut recovery_points = Vec::new();
    let mut rp_version = 0u16;
    let mut max_sn = 0u64;

    lss.replay(|offset, typ, payload| {
        match typ {
            BlockType::PageData | BlockType::PageUpdate | BlockType::PageReloc => {
                let header = codec::decode_header(payload)?;
                let key = hi_bound(&header);
                pages.insert(key, (header, offset));
            }
            BlockType::PageRemove => {
                let key = decode_remove_bound(payload)?;
                pages.remove(&key);
            }
            BlockType::RecoveryPoints => {
                let (version, rps) = mvcc::unmarshal_rps(payload)?;
                rp_version = version;
                recovery_points = rps;
            }
            BlockType::MaxSn => {
                max_sn = max_sn.max(mvcc::decode_max_sn(payload)?);
            }
            BlockType::Discard => {}
        }
        Ok(())
    })?;

    Ok(Recovered {
        pages: pages.into_values().collect(),
        recovery_points,
        rp_version,
        max_sn,
    })
}

fn hi_bound(header: &PageHeader) -> PageBound {
    match &header.hi_item {
        Some(itm) => PageBound::Key(itm.clone()),
        None => PageBound::PosInf,
    }
}

fn decode_remove_bound(payload: &[u8]) -> Result<PageBound> {
    if payload.len() < 2 {
        return Err(errcorrupt!("truncated page-remove block"));
    }
    let len = BigEndian::read_u16(&payload[..2]) as usize;
    if len == 0 {
        return Ok(PageBound::PosInf);
    }
    if payload.len() < 2 + len {
        return Err(errcorrupt!("truncated page-remove block"));
    }
    Ok(PageBound::Key(Arc::new(Item::decode(&payload[2..2 + len])?)))
}

/// An ordered cursor over the store, optionally pinned to a snapshot.
/// Pages are materialized one at a time; within a page the view is the
/// instant the page was loaded, which a pinned snapshot turns into a
/// stable global view.
pub struct StoreIterator {
    store: Arc<Store>,
    snap: Option<Arc<Snapshot>>,
    sn: u64,
    items: Vec<Arc<Item>>,
    pos: usize,
    next_low: Option<Arc<Item>>,
    exhausted: bool,
}

impl StoreIterator {
    pub(crate) fn new(
        store: Arc<Store>,
        snap: Option<Arc<Snapshot>>,
        sn: u64,
    ) -> StoreIterator {
        let mut it = StoreIterator {
            store,
            snap,
            sn,
            items: Vec::new(),
            pos: 0,
            next_low: None,
            exhausted: false,
        };
        it.load_at(None);
        it.settle();
        it
    }

    /// Loads the page covering `low` (the first page when `None`) and
    /// positions past any keys below it.
    fn load_at(&mut self, low: Option<Arc<Item>>) {
        loop {
            let pid = match &low {
                Some(itm) => self.store.table.page_id_of(itm),
                None => self.store.table.first(),
            };
            match self.store.read_page(&pid) {
                Ok(Some(pg)) => {
                    let mut filter = SnFilter::new(self.sn);
                    let Ok(items) = pg.collect(&mut filter) else {
                        // raced with an eviction; reread materializes
                        continue;
                    };
                    self.items = items;
                    self.pos = 0;
                    self.next_low = pg.hi_item();
                    if let Some(itm) = &low {
                        // after a merge the covering page may start
                        // below the hop bound
                        let key = itm.key();
                        self.pos = self.items.partition_point(|i| i.key() < key);
                    }
                    return;
                }
                Ok(None) => continue,
                Err(e) => {
                    tracing::error!(error = %e, "iterator failed to load page");
                    self.items.clear();
                    self.pos = 0;
                    self.next_low = None;
                    self.exhausted = true;
                    return;
                }
            }
        }
    }

    fn settle(&mut self) {
        while !self.exhausted && self.pos >= self.items.len() {
            match self.next_low.take() {
                Some(hi) => self.load_at(Some(hi)),
                None => self.exhausted = true,
            }
        }
    }

    /// Repositions at the first key >= `key`.
    pub fn seek(&mut self, key: &[u8]) {
        self.exhausted = false;
        self.load_at(Some(Arc::new(Item::probe(key))));
        self.settle();
    }

    pub fn valid(&self) -> bool {
        !self.exhausted && self.pos < self.items.len()
    }

    pub fn get(&self) -> Option<&Arc<Item>> {
        if self.valid() {
            self.items.get(self.pos)
        } else {
            None
        }
    }

    pub fn key(&self) -> Option<&[u8]> {
        self.get().map(|i| i.key())
    }

    pub fn value(&self) -> Option<&[u8]> {
        self.get().and_then(|i| i.value())
    }

    pub fn next(&mut self) {
        if self.exhausted {
            return;
        }
        self.pos += 1;
        self.settle();
    }
}

impl Drop for StoreIterator {
    fn drop(&mut self) {
        if let Some(snap) = self.snap.take() {
            snap.close();
        }
    }
}
