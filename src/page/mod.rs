//! Pages and their delta chains.
//!
//! A page is a chain of immutable deltas terminating in a base page (or
//! truncated by a flush marker once its tail has been written to the
//! log). Mutation never touches published nodes: a writer builds a new
//! head locally and publishes it with a compare-and-swap on the page
//! table. Readers walk whatever head they loaded; structural sharing
//! through `Arc` keeps every published chain alive for as long as anyone
//! can still reach it.
//!
//! The delta variants are a closed set. They share a common header
//! (`chain_len`, `num_items`, `next`, `hi_item`, `right_sibling`) and the
//! lookup/collect/marshal paths all match on the content tag; there is no
//! dynamic dispatch anywhere on the read path.

pub mod codec;
pub mod collect;
pub mod iterator;

use std::cmp::Ordering;
use std::sync::Arc;

use crate::item::{self, Item};
use crate::lss::LssOffset;
use crate::pagetable::{PageBound, PageId};

use collect::ItemFilter;

pub type DeltaRef = Arc<PageDelta>;

/// Wire tag of a delta. Also the order of the closed set.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u16)]
pub enum PageOp {
    Base = 0,
    Insert = 1,
    Delete = 2,
    Split = 3,
    Remove = 4,
    Merge = 5,
    Flush = 6,
    Rollback = 7,
}

/// Content of one chain node.
#[derive(Debug, Clone)]
pub enum DeltaContent {
    /// Terminal node: the materialized, key-sorted item array.
    Base { items: Vec<Arc<Item>> },
    /// One insert or delete version; the item's own flag decides which.
    Record { item: Arc<Item> },
    /// The page was split at `item`; the header's `hi_item` is the pivot
    /// and `right_sibling` the new page.
    Split { item: Arc<Item> },
    /// The right sibling was absorbed: `sibling` is its chain (below its
    /// remove delta) and `item` the old boundary between the two.
    Merge { item: Arc<Item>, sibling: DeltaRef },
    /// The page is dead and awaiting unlink from the page table.
    Remove,
    /// Everything at `next` and below is durable in the log at `offset`,
    /// spanning `num_segments` linked update blocks. A flush marker with
    /// no `next` is an evicted page.
    Flush {
        offset: LssOffset,
        data_size: u32,
        num_segments: u16,
    },
    /// Versions with `start <= sn <= end` are logically erased.
    Rollback { start: u64, end: u64 },
}

/// One immutable node of a page's delta chain.
#[derive(Debug)]
pub struct PageDelta {
    /// Number of deltas above the base page (or above the flush marker
    /// of an evicted page).
    pub chain_len: u16,
    /// Logical item count; maintained by compaction, split and merge,
    /// not by record prepends.
    pub num_items: u16,
    pub next: Option<DeltaRef>,
    /// Exclusive upper bound of the page; `None` is +∞.
    pub hi_item: Option<Arc<Item>>,
    pub right_sibling: PageId,
    pub content: DeltaContent,
}

impl PageDelta {
    pub fn op(&self) -> PageOp {
        match &self.content {
            DeltaContent::Base { .. } => PageOp::Base,
            DeltaContent::Record { item } => {
                if item.is_delete() {
                    PageOp::Delete
                } else {
                    PageOp::Insert
                }
            }
            DeltaContent::Split { .. } => PageOp::Split,
            DeltaContent::Remove => PageOp::Remove,
            DeltaContent::Merge { .. } => PageOp::Merge,
            DeltaContent::Flush { .. } => PageOp::Flush,
            DeltaContent::Rollback { .. } => PageOp::Rollback,
        }
    }
}

/// Signals that a chain walk hit evicted state which must first be
/// materialized from the log at the given offset.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NeedsFetch(pub LssOffset);

pub type ChainResult<T> = std::result::Result<T, NeedsFetch>;

/// Outcome of a single-page lookup walk.
#[derive(Debug)]
pub enum LookupStep {
    Found(Arc<Item>),
    NotFound,
    /// The probe is at or above the page's upper bound; continue on the
    /// right sibling.
    Right(PageId),
    Fetch(NeedsFetch),
}

/// Pivot plan for a split; `left_items` is the base-item count that stays
/// on the left page.
pub struct SplitPlan {
    pub pivot: Arc<Item>,
    pub left_items: u16,
}

/// A writer's private view of one page: the head it loaded and the head
/// it intends to publish. `update_mapping` swings the table slot from
/// `prev_head` to `head`.
pub struct Page {
    pub pid: PageId,
    pub low: PageBound,
    pub prev_head: Option<DeltaRef>,
    pub head: Option<DeltaRef>,
    /// Approximate bytes added to the chain by this writer's edits.
    pub mem_delta: i64,
    /// Set when publication detaches the previous chain (compact, evict),
    /// so the caller stages `prev_head` on its reclaim list.
    pub reclaim: bool,
}

const DELTA_NODE_OVERHEAD: usize = 64;

impl Page {
    pub(crate) fn new(pid: PageId, low: PageBound, head: Option<DeltaRef>) -> Page {
        Page {
            pid,
            low,
            prev_head: head.clone(),
            head,
            mem_delta: 0,
            reclaim: false,
        }
    }

    fn header(&self) -> (u16, u16, Option<Arc<Item>>, PageId) {
        match &self.head {
            Some(h) => (
                h.chain_len,
                h.num_items,
                h.hi_item.clone(),
                h.right_sibling.clone(),
            ),
            None => (0, 0, None, PageId::pos_inf()),
        }
    }

    /// Exclusive upper bound of the page's current head.
    pub fn hi_item(&self) -> Option<Arc<Item>> {
        self.head.as_ref().and_then(|h| h.hi_item.clone())
    }

    pub fn in_range(&self, itm: &Item) -> bool {
        match &self.head {
            Some(h) => item::below(itm, h.hi_item.as_ref()),
            None => true,
        }
    }

    fn prepend_record(&mut self, itm: Arc<Item>) {
        let (chain_len, num_items, hi_item, right_sibling) = self.header();
        self.mem_delta += (DELTA_NODE_OVERHEAD + itm.encoded_size()) as i64;
        self.head = Some(Arc::new(PageDelta {
            chain_len: chain_len + 1,
            num_items,
            next: self.head.clone(),
            hi_item,
            right_sibling,
            content: DeltaContent::Record { item: itm },
        }));
    }

    pub fn insert(&mut self, itm: Arc<Item>) {
        debug_assert!(itm.is_insert());
        self.prepend_record(itm);
    }

    pub fn delete(&mut self, itm: Arc<Item>) {
        debug_assert!(itm.is_delete());
        self.prepend_record(itm);
    }

    /// Prepends a remove delta marking the page dead.
    pub fn close(&mut self) {
        let (chain_len, num_items, hi_item, right_sibling) = self.header();
        self.mem_delta += DELTA_NODE_OVERHEAD as i64;
        self.head = Some(Arc::new(PageDelta {
            chain_len,
            num_items,
            next: self.head.clone(),
            hi_item,
            right_sibling,
            content: DeltaContent::Remove,
        }));
    }

    /// Prepends a rollback delta erasing `[start, end]`.
    pub fn rollback(&mut self, start: u64, end: u64) {
        let (chain_len, num_items, hi_item, right_sibling) = self.header();
        self.mem_delta += DELTA_NODE_OVERHEAD as i64;
        self.head = Some(Arc::new(PageDelta {
            chain_len: chain_len + 1,
            num_items,
            next: self.head.clone(),
            hi_item,
            right_sibling,
            content: DeltaContent::Rollback { start, end },
        }));
    }

    /// Walks the chain for the newest live version of the probe's key.
    pub fn lookup(&self, probe: &Item) -> LookupStep {
        let Some(head) = &self.head else {
            return LookupStep::NotFound;
        };
        if !item::below(probe, head.hi_item.as_ref()) {
            return LookupStep::Right(head.right_sibling.clone());
        }

        let mut intervals: Vec<(u64, u64)> = Vec::new();
        let mut pd = Some(head.clone());
        while let Some(node) = pd {
            match &node.content {
                DeltaContent::Record { item } => {
                    if item::compare(item, probe) == Ordering::Equal
                        && !collect::masked(item.sn(), &intervals)
                    {
                        return if item.is_insert() {
                            LookupStep::Found(item.clone())
                        } else {
                            LookupStep::NotFound
                        };
                    }
                }
                DeltaContent::Rollback { start, end } => intervals.push((*start, *end)),
                DeltaContent::Split { .. } | DeltaContent::Remove => {}
                DeltaContent::Merge { item, sibling } => {
                    if item::compare(probe, item) != Ordering::Less {
                        pd = Some(sibling.clone());
                        continue;
                    }
                }
                DeltaContent::Flush { offset, .. } => {
                    if node.next.is_none() {
                        return LookupStep::Fetch(NeedsFetch(*offset));
                    }
                }
                DeltaContent::Base { items } => {
                    // leftmost equal key is the newest version of it
                    let idx =
                        items.partition_point(|i| item::compare(i, probe) == Ordering::Less);
                    for i in &items[idx..] {
                        if item::compare(i, probe) != Ordering::Equal {
                            break;
                        }
                        if collect::masked(i.sn(), &intervals) {
                            continue;
                        }
                        return if i.is_insert() {
                            LookupStep::Found(i.clone())
                        } else {
                            LookupStep::NotFound
                        };
                    }
                    return LookupStep::NotFound;
                }
            }
            pd = node.next.clone();
        }
        LookupStep::NotFound
    }

    /// Chooses the split pivot: the median base item, clamped downward
    /// until it falls below the current upper bound. A pivot clamped all
    /// the way to zero declines the split.
    pub fn split_plan(&self) -> ChainResult<Option<SplitPlan>> {
        let Some(head) = &self.head else {
            return Ok(None);
        };
        let hi = head.hi_item.clone();

        let mut pd = Some(head.clone());
        let base_items = loop {
            let Some(node) = pd else { return Ok(None) };
            match &node.content {
                DeltaContent::Base { items } => break items.clone(),
                DeltaContent::Flush { offset, .. } if node.next.is_none() => {
                    return Err(NeedsFetch(*offset));
                }
                _ => pd = node.next.clone(),
            }
        };

        let mut mid = base_items.len() / 2;
        while mid > 0 && !item::below(&base_items[mid], hi.as_ref()) {
            mid -= 1;
        }
        if mid == 0 {
            return Ok(None);
        }
        Ok(Some(SplitPlan {
            pivot: base_items[mid].clone(),
            left_items: mid as u16,
        }))
    }

    /// All versions in `[pivot, hi)`, for seeding the right page of a
    /// split.
    pub fn split_items(&self, pivot: &Arc<Item>) -> ChainResult<Vec<Arc<Item>>> {
        let hi = self.hi_item();
        collect::collect_filtered(
            self.head.as_ref(),
            Some(pivot),
            hi.as_ref(),
            &mut collect::KeepAll,
        )
    }

    /// Builds the right page's head for a split: a fresh base covering
    /// `[pivot, hi)` with the old page's bound and sibling.
    pub fn split_right_head(&self, items: Vec<Arc<Item>>) -> DeltaRef {
        let (_, _, hi_item, right_sibling) = self.header();
        Arc::new(PageDelta {
            chain_len: 0,
            num_items: items.len() as u16,
            next: None,
            hi_item,
            right_sibling,
            content: DeltaContent::Base { items },
        })
    }

    /// Prepends the split delta on the left page: upper bound truncated
    /// to the pivot, sibling pointing at the new page.
    pub fn apply_split(&mut self, plan: &SplitPlan, right: PageId) {
        let (chain_len, _, _, _) = self.header();
        self.mem_delta += (DELTA_NODE_OVERHEAD + plan.pivot.encoded_size()) as i64;
        self.head = Some(Arc::new(PageDelta {
            chain_len: chain_len + 1,
            num_items: plan.left_items,
            next: self.head.clone(),
            hi_item: Some(plan.pivot.clone()),
            right_sibling: right,
            content: DeltaContent::Split {
                item: plan.pivot.clone(),
            },
        }));
    }

    /// Absorbs the right sibling. `victim_head` must be the victim's
    /// remove delta; the absorbed chain sits below it.
    pub fn merge(&mut self, victim_head: &DeltaRef) {
        let Some(sibling) = victim_head.next.clone() else {
            return;
        };
        let Some(pivot) = self.hi_item() else {
            return;
        };
        let (chain_len, num_items, _, _) = self.header();
        self.mem_delta += (DELTA_NODE_OVERHEAD + pivot.encoded_size()) as i64;
        self.head = Some(Arc::new(PageDelta {
            chain_len: chain_len + sibling.chain_len + 1,
            num_items: num_items + sibling.num_items,
            next: self.head.clone(),
            hi_item: sibling.hi_item.clone(),
            right_sibling: sibling.right_sibling.clone(),
            content: DeltaContent::Merge {
                item: pivot,
                sibling,
            },
        }));
    }

    /// True when this page's chain already absorbed `victim_chain`
    /// (guards against two writers merging the same victim).
    pub fn already_merged(&self, victim_chain: &DeltaRef) -> bool {
        let mut pd = self.head.clone();
        while let Some(node) = pd {
            if let DeltaContent::Merge { sibling, .. } = &node.content {
                if Arc::ptr_eq(sibling, victim_chain) {
                    return true;
                }
            }
            pd = node.next.clone();
        }
        false
    }

    /// Rebuilds the page as a single base holding the filtered live
    /// versions. The old chain is detached and staged for reclaim.
    pub fn compact(&mut self, filter: &mut dyn ItemFilter) -> ChainResult<()> {
        let (_, _, hi_item, right_sibling) = self.header();
        let items =
            collect::collect_filtered(self.head.as_ref(), None, hi_item.as_ref(), filter)?;
        self.head = Some(Arc::new(PageDelta {
            chain_len: 0,
            num_items: items.len() as u16,
            next: None,
            hi_item,
            right_sibling,
            content: DeltaContent::Base { items },
        }));
        self.reclaim = true;
        Ok(())
    }

    /// All live versions of the page, sorted; feeds the page iterator.
    pub fn collect(&self, filter: &mut dyn ItemFilter) -> ChainResult<Vec<Arc<Item>>> {
        let hi = self.hi_item();
        collect::collect_filtered(self.head.as_ref(), None, hi.as_ref(), filter)
    }

    /// Materializes the page's live items (newest committed version per
    /// key, inserts only) as a standalone iterator.
    pub fn new_iterator(&self) -> ChainResult<iterator::PageIterator> {
        let mut filter = crate::mvcc::SnFilter::new(u64::MAX);
        Ok(iterator::PageIterator::new(self.collect(&mut filter)?))
    }

    pub fn need_compaction(&self, threshold: u16) -> bool {
        self.head.as_ref().map_or(false, |h| h.chain_len > threshold)
    }

    pub fn need_split(&self, threshold: u16) -> bool {
        self.head.as_ref().map_or(false, |h| h.num_items > threshold)
    }

    pub fn need_merge(&self, threshold: u16) -> bool {
        self.head.as_ref().map_or(false, |h| h.num_items < threshold)
    }

    pub fn need_removal(&self) -> bool {
        self.head.as_ref().map_or(false, |h| h.op() == PageOp::Remove)
    }

    /// True when the head carries state not yet recorded in the log.
    pub fn needs_flush(&self) -> bool {
        self.head
            .as_ref()
            .map_or(false, |h| !matches!(h.content, DeltaContent::Flush { .. }))
    }

    /// True when the page is clean and still holds memory to free.
    pub fn is_evictable(&self) -> bool {
        self.head.as_ref().map_or(false, |h| {
            matches!(h.content, DeltaContent::Flush { .. }) && h.next.is_some()
        })
    }

    /// Flush info of a clean page head.
    pub fn flush_info(&self) -> Option<(LssOffset, u32, u16)> {
        match self.head.as_deref() {
            Some(PageDelta {
                content:
                    DeltaContent::Flush {
                        offset,
                        data_size,
                        num_segments,
                    },
                ..
            }) => Some((*offset, *data_size, *num_segments)),
            _ => None,
        }
    }

    /// Prepends an additive flush marker: the offset is remembered but
    /// the in-memory chain is kept.
    pub fn add_flush_record(&mut self, offset: LssOffset, data_size: u32, num_segments: u16) {
        let (chain_len, num_items, hi_item, right_sibling) = self.header();
        self.head = Some(Arc::new(PageDelta {
            chain_len,
            num_items,
            next: self.head.clone(),
            hi_item,
            right_sibling,
            content: DeltaContent::Flush {
                offset,
                data_size,
                num_segments,
            },
        }));
    }

    /// Replaces the whole chain with a bare flush marker; the page's
    /// state is then served from the log on demand.
    pub fn evict(&mut self, offset: LssOffset, data_size: u32, num_segments: u16) {
        let (_, num_items, hi_item, right_sibling) = self.header();
        self.head = Some(Arc::new(PageDelta {
            chain_len: 0,
            num_items,
            next: None,
            hi_item,
            right_sibling,
            content: DeltaContent::Flush {
                offset,
                data_size,
                num_segments,
            },
        }));
        self.reclaim = true;
    }

    /// Offset of the evicted tail, if the chain ends in a bare flush
    /// marker instead of a base page.
    pub fn fetch_barrier(&self) -> Option<LssOffset> {
        let mut pd = self.head.clone();
        while let Some(node) = pd {
            if let DeltaContent::Flush { offset, .. } = &node.content {
                if node.next.is_none() {
                    return Some(*offset);
                }
            }
            pd = node.next.clone();
        }
        None
    }

    /// Splices a chain materialized from the log below the page's flush
    /// barrier, keeping any newer in-memory deltas above it.
    /// `num_segments` is the linked-block count observed by the reload.
    pub fn splice_fetched(&mut self, fetched: DeltaRef, num_segments: u16) {
        let mut uppers: Vec<DeltaRef> = Vec::new();
        let mut pd = self.head.clone();
        let barrier = loop {
            let Some(node) = pd else { return };
            if matches!(node.content, DeltaContent::Flush { .. }) && node.next.is_none() {
                break node;
            }
            uppers.push(node.clone());
            pd = node.next.clone();
        };
        let DeltaContent::Flush {
            offset, data_size, ..
        } = barrier.content
        else {
            return;
        };

        let mut head = Arc::new(PageDelta {
            chain_len: fetched.chain_len,
            num_items: barrier.num_items,
            next: Some(fetched),
            hi_item: barrier.hi_item.clone(),
            right_sibling: barrier.right_sibling.clone(),
            content: DeltaContent::Flush {
                offset,
                data_size,
                num_segments,
            },
        });
        for node in uppers.iter().rev() {
            let bump = match &node.content {
                DeltaContent::Record { .. } | DeltaContent::Rollback { .. } => 1,
                _ => 0,
            };
            head = Arc::new(PageDelta {
                chain_len: head.chain_len + bump,
                num_items: node.num_items,
                next: Some(head),
                hi_item: node.hi_item.clone(),
                right_sibling: node.right_sibling.clone(),
                content: node.content.clone(),
            });
        }
        self.head = Some(head);
    }
}

/// Builds a standalone base-page head, used when seeding new pages.
pub(crate) fn base_head(
    items: Vec<Arc<Item>>,
    hi_item: Option<Arc<Item>>,
    right_sibling: PageId,
) -> DeltaRef {
    Arc::new(PageDelta {
        chain_len: 0,
        num_items: items.len() as u16,
        next: None,
        hi_item,
        right_sibling,
        content: DeltaContent::Base { items },
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pagetable::PageBound;

    fn empty_page() -> Page {
        let pid = PageId::neg_inf();
        let head = base_head(Vec::new(), None, PageId::pos_inf());
        Page::new(pid, PageBound::NegInf, Some(head))
    }

    fn ins(pg: &mut Page, key: &[u8], value: &[u8], sn: u64) {
        pg.insert(Arc::new(Item::insert(key, Some(value), sn)));
    }

    fn del(pg: &mut Page, key: &[u8], sn: u64) {
        pg.delete(Arc::new(Item::delete(key, sn)));
    }

    fn found(pg: &Page, key: &[u8]) -> Option<Vec<u8>> {
        match pg.lookup(&Item::probe(key)) {
            LookupStep::Found(itm) => itm.value().map(|v| v.to_vec()),
            _ => None,
        }
    }

    #[test]
    fn test_insert_lookup_delete() {
        let mut pg = empty_page();
        ins(&mut pg, b"a", b"1", 1);
        ins(&mut pg, b"b", b"2", 2);
        assert_eq!(found(&pg, b"a"), Some(b"1".to_vec()));
        assert_eq!(found(&pg, b"b"), Some(b"2".to_vec()));
        assert_eq!(found(&pg, b"c"), None);

        del(&mut pg, b"a", 3);
        assert_eq!(found(&pg, b"a"), None);
        // newest version of a key wins
        ins(&mut pg, b"a", b"9", 4);
        assert_eq!(found(&pg, b"a"), Some(b"9".to_vec()));
    }

    #[test]
    fn test_chain_len_tracks_prepends() {
        let mut pg = empty_page();
        for i in 0..5u64 {
            ins(&mut pg, format!("k{i}").as_bytes(), b"v", i);
        }
        assert_eq!(pg.head.as_ref().unwrap().chain_len, 5);
        assert!(pg.need_compaction(4));
        assert!(!pg.need_compaction(5));
    }

    #[test]
    fn test_compact_builds_base() {
        let mut pg = empty_page();
        for i in 0..10u64 {
            ins(&mut pg, format!("k{i:02}").as_bytes(), b"v", i + 1);
        }
        del(&mut pg, b"k03", 11);
        pg.compact(&mut collect::KeepAll).unwrap();

        let head = pg.head.as_ref().unwrap();
        assert_eq!(head.chain_len, 0);
        // all eleven versions survive a KeepAll compaction
        assert_eq!(head.num_items, 11);
        assert!(pg.reclaim);
        // the delete marker still masks the older insert
        assert_eq!(found(&pg, b"k03"), None);
        assert_eq!(found(&pg, b"k04"), Some(b"v".to_vec()));
    }

    #[test]
    fn test_split_and_lookup_right() {
        let mut pg = empty_page();
        for i in 0..8u64 {
            ins(&mut pg, format!("k{i}").as_bytes(), b"v", i + 1);
        }
        pg.compact(&mut collect::KeepAll).unwrap();

        let plan = pg.split_plan().unwrap().expect("split accepted");
        assert_eq!(plan.pivot.key(), b"k4");
        let right_items = pg.split_items(&plan.pivot).unwrap();
        assert_eq!(right_items.len(), 4);

        let right_pid = PageId::for_key(plan.pivot.clone());
        let right_head = pg.split_right_head(right_items);
        pg.apply_split(&plan, right_pid.clone());

        assert_eq!(pg.head.as_ref().unwrap().num_items, 4);
        assert_eq!(pg.hi_item().unwrap().key(), b"k4");
        // keys at or above the pivot re-route to the right sibling
        assert!(matches!(pg.lookup(&Item::probe(b"k6")), LookupStep::Right(_)));
        assert_eq!(found(&pg, b"k1"), Some(b"v".to_vec()));

        let rpg = Page::new(
            right_pid,
            PageBound::Key(plan.pivot.clone()),
            Some(right_head),
        );
        assert_eq!(found(&rpg, b"k6"), Some(b"v".to_vec()));
    }

    #[test]
    fn test_split_declined_when_median_clamps_to_zero() {
        let mut pg = empty_page();
        ins(&mut pg, b"only", b"v", 1);
        pg.compact(&mut collect::KeepAll).unwrap();
        // a one-item base clamps the median to zero
        assert!(pg.split_plan().unwrap().is_none());
    }

    #[test]
    fn test_merge_absorbs_sibling() {
        // left covers [-inf, "m"), right covers ["m", +inf)
        let pivot = Arc::new(Item::insert(b"m", Some(b"p"), 3));
        let right_pid = PageId::for_key(pivot.clone());

        let mut left = Page::new(
            PageId::neg_inf(),
            PageBound::NegInf,
            Some(base_head(
                vec![Arc::new(Item::insert(b"a", Some(b"1"), 1))],
                Some(pivot.clone()),
                right_pid.clone(),
            )),
        );
        let mut right = Page::new(
            right_pid,
            PageBound::Key(pivot.clone()),
            Some(base_head(
                vec![pivot.clone(), Arc::new(Item::insert(b"z", Some(b"9"), 4))],
                None,
                PageId::pos_inf(),
            )),
        );

        right.close();
        assert!(right.need_removal());

        let victim_head = right.head.clone().unwrap();
        left.merge(&victim_head);

        assert!(left.hi_item().is_none());
        assert_eq!(left.head.as_ref().unwrap().num_items, 3);
        assert_eq!(found(&left, b"a"), Some(b"1".to_vec()));
        assert_eq!(found(&left, b"z"), Some(b"9".to_vec()));
        assert!(left.already_merged(&victim_head.next.clone().unwrap()));

        left.compact(&mut collect::KeepAll).unwrap();
        assert_eq!(left.head.as_ref().unwrap().num_items, 3);
        assert_eq!(found(&left, b"m"), Some(b"p".to_vec()));
    }

    #[test]
    fn test_rollback_masks_interval() {
        let mut pg = empty_page();
        ins(&mut pg, b"k", b"old", 5);
        ins(&mut pg, b"k", b"new", 9);
        pg.rollback(6, 10);
        // sn 9 falls inside the erased interval, sn 5 does not
        assert_eq!(found(&pg, b"k"), Some(b"old".to_vec()));

        pg.compact(&mut collect::KeepAll).unwrap();
        assert_eq!(found(&pg, b"k"), Some(b"old".to_vec()));
        // the rolled-back version is gone from the compacted base
        assert_eq!(pg.head.as_ref().unwrap().num_items, 1);
    }

    #[test]
    fn test_page_iterator_sees_live_items_only() {
        let mut pg = empty_page();
        ins(&mut pg, b"a", b"1", 1);
        ins(&mut pg, b"b", b"2", 2);
        ins(&mut pg, b"b", b"3", 3);
        del(&mut pg, b"a", 4);

        let mut it = pg.new_iterator().unwrap();
        assert!(it.valid());
        assert_eq!(it.get().unwrap().key(), b"b");
        assert_eq!(it.get().unwrap().value(), Some(&b"3"[..]));
        it.next();
        assert!(!it.valid());
    }

    #[test]
    fn test_evict_and_barrier() {
        let mut pg = empty_page();
        ins(&mut pg, b"a", b"1", 1);
        assert!(pg.needs_flush());
        pg.add_flush_record(128, 64, 0);
        assert!(!pg.needs_flush());
        assert!(pg.is_evictable());
        assert_eq!(pg.fetch_barrier(), None);

        pg.evict(128, 64, 0);
        assert!(!pg.is_evictable());
        assert_eq!(pg.fetch_barrier(), Some(128));
        assert!(matches!(
            pg.lookup(&Item::probe(b"a")),
            LookupStep::Fetch(NeedsFetch(128))
        ));
    }

    #[test]
    fn test_splice_fetched_keeps_upper_deltas() {
        let mut pg = empty_page();
        ins(&mut pg, b"a", b"1", 1);
        pg.add_flush_record(64, 32, 0);
        pg.evict(64, 32, 0);
        // new writes land on top of the evicted marker
        ins(&mut pg, b"b", b"2", 2);

        let fetched = base_head(
            vec![Arc::new(Item::insert(b"a", Some(b"1"), 1))],
            None,
            PageId::pos_inf(),
        );
        pg.splice_fetched(fetched, 0);

        assert_eq!(pg.fetch_barrier(), None);
        assert_eq!(found(&pg, b"a"), Some(b"1".to_vec()));
        assert_eq!(found(&pg, b"b"), Some(b"2".to_vec()));
    }
}
