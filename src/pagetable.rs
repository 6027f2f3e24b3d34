//! The page table: an ordered, concurrent mapping from page low bound to
//! chain head.
//!
//! Page low bounds index into a lock-free skiplist. Each entry holds an
//! atomically swappable head pointer; all publication goes through
//! [`PageTable::update_mapping`], a compare-and-swap by pointer identity.
//! A failed swap never blocks or errors; the caller rereads and retries
//! with fresh deltas.
//!
//! A `PageId` is an opaque handle to a page. The skiplist cannot hand
//! out long-lived node references, so the handle wraps the node's *key*
//! (the page's low bound) and resolves back to the node with a seek.

use std::cmp::Ordering;
use std::ops::Bound;
use std::sync::Arc;

use arc_swap::ArcSwapOption;
use crossbeam_skiplist::SkipMap;

use crate::item::{self, Item};
use crate::page::{DeltaRef, Page, PageDelta};

/// A page's low bound. The leftmost page starts at -∞; `PosInf` only
/// ever appears as the rightmost sibling sentinel, never as a map key.
#[derive(Debug, Clone)]
pub enum PageBound {
    NegInf,
    Key(Arc<Item>),
    PosInf,
}

impl PageBound {
    pub fn item(&self) -> Option<&Arc<Item>> {
        match self {
            PageBound::Key(itm) => Some(itm),
            _ => None,
        }
    }
}

impl Ord for PageBound {
    fn cmp(&self, other: &Self) -> Ordering {
        match (self, other) {
            (PageBound::NegInf, PageBound::NegInf) => Ordering::Equal,
            (PageBound::NegInf, _) => Ordering::Less,
            (_, PageBound::NegInf) => Ordering::Greater,
            (PageBound::PosInf, PageBound::PosInf) => Ordering::Equal,
            (PageBound::PosInf, _) => Ordering::Greater,
            (_, PageBound::PosInf) => Ordering::Less,
            (PageBound::Key(a), PageBound::Key(b)) => item::compare(a, b),
        }
    }
}

impl PartialOrd for PageBound {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl PartialEq for PageBound {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for PageBound {}

/// Opaque page handle.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PageId(PageBound);

impl PageId {
    pub(crate) fn neg_inf() -> PageId {
        PageId(PageBound::NegInf)
    }

    pub(crate) fn pos_inf() -> PageId {
        PageId(PageBound::PosInf)
    }

    pub(crate) fn for_key(itm: Arc<Item>) -> PageId {
        PageId(PageBound::Key(itm))
    }

    /// The low-bound item of the page; `None` for the ±∞ sentinels.
    pub fn item(&self) -> Option<&Arc<Item>> {
        self.0.item()
    }

    pub(crate) fn bound(&self) -> &PageBound {
        &self.0
    }
}

struct PageSlot {
    head: ArcSwapOption<PageDelta>,
}

/// PageId → chain-head mapping.
pub struct PageTable {
    map: SkipMap<PageBound, PageSlot>,
}

fn opt_ptr(head: &Option<DeltaRef>) -> *const PageDelta {
    head.as_ref().map_or(std::ptr::null(), Arc::as_ptr)
}

impl PageTable {
    pub fn new() -> PageTable {
        PageTable {
            map: SkipMap::new(),
        }
    }

    /// Installs a new page. The caller guarantees the low bound is not
    /// yet mapped (splits create fresh pivots).
    pub(crate) fn create(&self, low: PageBound, head: Option<DeltaRef>) -> PageId {
        self.map.insert(
            low.clone(),
            PageSlot {
                head: ArcSwapOption::new(head),
            },
        );
        PageId(low)
    }

    /// Unlinks a dead page.
    pub(crate) fn unlink(&self, pid: &PageId) {
        self.map.remove(pid.bound());
    }

    /// Snapshot of the page's head, or `None` when the page is gone.
    pub(crate) fn read_page(&self, pid: &PageId) -> Option<Page> {
        let entry = self.map.get(pid.bound())?;
        let head = entry.value().head.load_full();
        Some(Page::new(pid.clone(), entry.key().clone(), head))
    }

    pub(crate) fn head_of(&self, pid: &PageId) -> Option<DeltaRef> {
        self.map.get(pid.bound())?.value().head.load_full()
    }

    /// Publishes `pg.head`, swinging the slot from the head the writer
    /// read to the head it built. On success the page's read base moves
    /// forward so the writer can keep mutating; on failure the caller
    /// discards its transient deltas and rereads.
    pub(crate) fn update_mapping(&self, pg: &mut Page) -> bool {
        let Some(entry) = self.map.get(pg.pid.bound()) else {
            return false;
        };
        let prev = entry
            .value()
            .head
            .compare_and_swap(&pg.prev_head, pg.head.clone());
        let swapped = opt_ptr(&prev) == opt_ptr(&pg.prev_head);
        if swapped {
            pg.prev_head = pg.head.clone();
        }
        swapped
    }

    /// The page covering `probe`'s key.
    pub(crate) fn page_id_of(&self, probe: &Arc<Item>) -> PageId {
        let bound = PageBound::Key(probe.clone());
        match self.map.upper_bound(Bound::Included(&bound)) {
            Some(entry) => PageId(entry.key().clone()),
            None => PageId(PageBound::NegInf),
        }
    }

    /// The leftmost page.
    pub(crate) fn first(&self) -> PageId {
        PageId(PageBound::NegInf)
    }

    /// The page immediately left of `pid`, if any.
    pub(crate) fn prev_pid(&self, pid: &PageId) -> Option<PageId> {
        self.map
            .upper_bound(Bound::Excluded(pid.bound()))
            .map(|e| PageId(e.key().clone()))
    }

    pub fn len(&self) -> usize {
        self.map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }

    /// All page ids in key order, split into `n` contiguous partitions
    /// for visitor workers.
    pub(crate) fn partitions(&self, n: usize) -> Vec<Vec<PageId>> {
        let pids: Vec<PageId> = self.map.iter().map(|e| PageId(e.key().clone())).collect();
        if pids.is_empty() {
            return Vec::new();
        }
        let chunk = pids.len().div_ceil(n.max(1));
        pids.chunks(chunk).map(|c| c.to_vec()).collect()
    }
}

impl Default for PageTable {
    fn default() -> Self {
        Self::new()
    }
}
