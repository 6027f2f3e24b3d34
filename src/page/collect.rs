//! Chain collection: flattening a delta chain into the sorted version
//! sequence it represents.
//!
//! The walk gathers record deltas newest-first, recurses through merge
//! siblings, and terminates at the base page. A stable sort by key then
//! yields `(key asc, recency desc)` order without the comparator ever
//! looking at sequence numbers; the base page's items are merged in last
//! so deltas win on equal keys. Rollback deltas encountered on the way
//! contribute erase intervals that mask matching versions before any
//! caller-supplied filter runs.

use std::cmp::Ordering;
use std::sync::Arc;

use crate::item::{self, Item};

use super::{DeltaContent, DeltaRef, ChainResult, NeedsFetch};

/// A filter over the sorted version stream. `process` pushes zero or
/// more items for each input; state across calls is what lets filters
/// reason about version adjacency (the stream is key-grouped,
/// newest-first within a key).
pub trait ItemFilter {
    fn process(&mut self, itm: &Arc<Item>, out: &mut Vec<Arc<Item>>);
}

/// Keeps every version. Used by split seeding and by tests.
pub struct KeepAll;

impl ItemFilter for KeepAll {
    fn process(&mut self, itm: &Arc<Item>, out: &mut Vec<Arc<Item>>) {
        out.push(itm.clone());
    }
}

/// True when `sn` falls inside any erased interval.
pub(crate) fn masked(sn: u64, intervals: &[(u64, u64)]) -> bool {
    intervals.iter().any(|&(start, end)| sn >= start && sn <= end)
}

/// Collects every in-range version of the chain, sorted, before
/// filtering. Erase intervals found in the chain are appended to
/// `intervals`.
pub(crate) fn collect_page_items(
    head: Option<&DeltaRef>,
    lo: Option<&Arc<Item>>,
    hi: Option<&Arc<Item>>,
    intervals: &mut Vec<(u64, u64)>,
) -> ChainResult<Vec<Arc<Item>>> {
    let mut pd = head.cloned();
    let mut deltas: Vec<Arc<Item>> = Vec::new();

    while let Some(node) = pd {
        match &node.content {
            DeltaContent::Record { item } => {
                if item::in_range(item, lo, hi) {
                    deltas.push(item.clone());
                }
            }
            DeltaContent::Rollback { start, end } => intervals.push((*start, *end)),
            DeltaContent::Split { .. } | DeltaContent::Remove => {}
            DeltaContent::Merge { sibling, .. } => {
                let absorbed = collect_page_items(Some(sibling), lo, hi, intervals)?;
                deltas.extend(absorbed);
            }
            DeltaContent::Flush { offset, .. } => {
                if node.next.is_none() {
                    return Err(NeedsFetch(*offset));
                }
            }
            DeltaContent::Base { items } => {
                deltas.sort_by(|a, b| item::compare(a, b));
                let base: Vec<Arc<Item>> = items
                    .iter()
                    .filter(|i| item::in_range(i.as_ref(), lo, hi))
                    .cloned()
                    .collect();
                return Ok(merge_sorted(deltas, base));
            }
        }
        pd = node.next.clone();
    }

    deltas.sort_by(|a, b| item::compare(a, b));
    Ok(deltas)
}

/// Stable two-way merge; `newer` wins ties, so delta versions surface
/// ahead of base versions of the same key.
fn merge_sorted(newer: Vec<Arc<Item>>, older: Vec<Arc<Item>>) -> Vec<Arc<Item>> {
    let mut out = Vec::with_capacity(newer.len() + older.len());
    let mut a = newer.into_iter().peekable();
    let mut b = older.into_iter().peekable();
    loop {
        match (a.peek(), b.peek()) {
            (Some(x), Some(y)) => {
                if item::compare(x, y) != Ordering::Greater {
                    out.extend(a.next());
                } else {
                    out.extend(b.next());
                }
            }
            (Some(_), None) => out.extend(a.next()),
            (None, Some(_)) => out.extend(b.next()),
            (None, None) => break,
        }
    }
    out
}

/// Collects, applies erase intervals, then runs the filter.
pub(crate) fn collect_filtered(
    head: Option<&DeltaRef>,
    lo: Option<&Arc<Item>>,
    hi: Option<&Arc<Item>>,
    filter: &mut dyn ItemFilter,
) -> ChainResult<Vec<Arc<Item>>> {
    let mut intervals = Vec::new();
    let all = collect_page_items(head, lo, hi, &mut intervals)?;
    let mut out = Vec::with_capacity(all.len());
    for itm in &all {
        if masked(itm.sn(), &intervals) {
            continue;
        }
        filter.process(itm, &mut out);
    }
    Ok(out)
}
