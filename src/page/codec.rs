//! Page marshaling.
//!
//! # Payload format
//!
//! Every page block carries a header followed by deltas, newest first:
//!
//! ```text
//! +--------------+--------------+----------------+----------------------+
//! | chain_len u16| num_items u16| hi: u16 len+bytes | right: u16 len+bytes |
//! +--------------+--------------+----------------+----------------------+
//! | delta: op u16 + body ...                                            |
//! +---------------------------------------------------------------------+
//! ```
//!
//! - a length of 0 for `hi` encodes +∞, for `right` the rightmost
//!   sentinel
//! - record deltas: `[op][len: u16][item]`
//! - rollback deltas: `[op][start: u64][end: u64]`
//! - base page: `[op][n: u16] n x ([len: u16][item])`, terminates the
//!   block
//! - flush reference: `[op][offset: u64]`, terminates the block and
//!   names the log block holding the rest of the chain
//!
//! All integers big-endian. Merge siblings are inlined into the emission
//! (their key ranges are disjoint from the surrounding chain, so the
//! stable collection sort reconstructs the same logical state).
//!
//! Long chains are chunked into several blocks, written oldest-first and
//! linked by flush references; the newest block's offset is what the
//! page's flush delta records.

use std::sync::Arc;

use byteorder::{BigEndian, ByteOrder};

use crate::errcorrupt;
use crate::error::{Error, Result};
use crate::item::{self, Item};
use crate::lss::{BlockType, LssOffset};
use crate::pagetable::PageId;

use super::{DeltaContent, DeltaRef, Page, PageDelta, PageOp};

/// Decoded block header.
#[derive(Debug, Clone)]
pub struct PageHeader {
    pub chain_len: u16,
    pub num_items: u16,
    pub hi_item: Option<Arc<Item>>,
    pub right_low: Option<Arc<Item>>,
}

/// One decoded delta of a block body.
#[derive(Debug)]
pub enum Decoded {
    Record(Arc<Item>),
    Rollback(u64, u64),
    Base(Vec<Arc<Item>>),
}

/// The rendered flush: blocks oldest-first, plus accounting.
pub struct MarshalPlan {
    pub blocks: Vec<BlockPlan>,
    pub num_segments: u16,
    pub data_size: u32,
    pub stale_size: u32,
}

pub struct BlockPlan {
    bytes: Vec<u8>,
    needs_link: bool,
    self_contained: bool,
}

/// Size of a flush-reference delta on the wire.
const LINK_SIZE: usize = 2 + 8;

impl BlockPlan {
    /// Renders the final payload into `out`; non-oldest blocks append a
    /// flush reference to the previously written block.
    pub fn render_into(&self, prev: Option<LssOffset>, out: &mut Vec<u8>) {
        out.extend_from_slice(&self.bytes);
        if self.needs_link {
            if let Some(offset) = prev {
                let mut rec = [0u8; LINK_SIZE];
                BigEndian::write_u16(&mut rec[..2], PageOp::Flush as u16);
                BigEndian::write_u64(&mut rec[2..], offset);
                out.extend_from_slice(&rec);
            }
        }
    }

    /// Final payload as a fresh vector.
    pub fn render(&self, prev: Option<LssOffset>) -> Vec<u8> {
        let mut bytes = Vec::with_capacity(self.rendered_size());
        self.render_into(prev, &mut bytes);
        bytes
    }

    pub fn rendered_size(&self) -> usize {
        self.bytes.len() + if self.needs_link { LINK_SIZE } else { 0 }
    }

    pub fn block_type(&self) -> BlockType {
        if self.self_contained {
            BlockType::PageData
        } else {
            BlockType::PageUpdate
        }
    }
}

enum Emit {
    Record(Arc<Item>),
    Rollback(u64, u64),
    Base(Vec<Arc<Item>>),
    Link(LssOffset),
}

/// Marshals the page for flushing. `max_segments` caps both the deltas
/// per block and the linked blocks a page may accumulate before it is
/// rewritten in full.
pub(crate) fn marshal(pg: &Page, max_segments: u16) -> Result<MarshalPlan> {
    let Some(head) = &pg.head else {
        return Err(errcorrupt!("marshal of an empty page"));
    };
    let hi = head.hi_item.clone();

    let mut emits: Vec<Emit> = Vec::new();
    let mut stale_size: u32 = 0;
    let mut inherited_segments: u16 = 0;

    let mut pd = Some(head.clone());
    while let Some(node) = pd {
        match &node.content {
            DeltaContent::Record { item } => {
                if item::below(item, hi.as_ref()) {
                    emits.push(Emit::Record(item.clone()));
                }
            }
            DeltaContent::Rollback { start, end } => emits.push(Emit::Rollback(*start, *end)),
            DeltaContent::Split { .. } | DeltaContent::Remove => {}
            DeltaContent::Merge { sibling, .. } => {
                emit_chain(sibling, hi.as_ref(), &mut emits, &mut stale_size)?;
            }
            DeltaContent::Flush {
                offset,
                data_size,
                num_segments,
            } => {
                if node.next.is_none() || num_segments + 1 < max_segments {
                    // reference the durable tail instead of rewriting it
                    emits.push(Emit::Link(*offset));
                    inherited_segments = num_segments + 1;
                    break;
                }
                // the linked chain grew too long; rewrite in full
                stale_size += data_size;
            }
            DeltaContent::Base { items } => {
                let base: Vec<Arc<Item>> = items
                    .iter()
                    .filter(|i| item::below(i.as_ref(), hi.as_ref()))
                    .cloned()
                    .collect();
                emits.push(Emit::Base(base));
                break;
            }
        }
        pd = node.next.clone();
    }

    let header = encode_header(head)?;
    let chunk = max_segments.max(1) as usize;

    let mut blocks: Vec<BlockPlan> = Vec::new();
    for (i, group) in emits.rchunks(chunk).enumerate() {
        let mut bytes = header.clone();
        for e in group {
            encode_emit(e, &mut bytes)?;
        }
        let oldest = i == 0;
        let self_contained =
            oldest && matches!(group.last(), Some(Emit::Base(_)));
        blocks.push(BlockPlan {
            bytes,
            needs_link: !oldest,
            self_contained,
        });
    }
    if blocks.is_empty() {
        blocks.push(BlockPlan {
            bytes: header,
            needs_link: false,
            self_contained: false,
        });
    }

    let num_segments = inherited_segments + (blocks.len() as u16 - 1);
    let data_size: u32 = blocks.iter().map(|b| b.rendered_size() as u32).sum();

    Ok(MarshalPlan {
        blocks,
        num_segments,
        data_size,
        stale_size,
    })
}

/// Inlines an absorbed sibling chain: its records keep their op, its
/// base items become records, nested merges recurse.
fn emit_chain(
    head: &DeltaRef,
    hi: Option<&Arc<Item>>,
    emits: &mut Vec<Emit>,
    stale_size: &mut u32,
) -> Result<()> {
    let mut pd = Some(head.clone());
    while let Some(node) = pd {
        match &node.content {
            DeltaContent::Record { item } => {
                if item::below(item, hi) {
                    emits.push(Emit::Record(item.clone()));
                }
            }
            DeltaContent::Rollback { start, end } => emits.push(Emit::Rollback(*start, *end)),
            DeltaContent::Split { .. } | DeltaContent::Remove => {}
            DeltaContent::Merge { sibling, .. } => {
                emit_chain(sibling, hi, emits, stale_size)?;
            }
            DeltaContent::Flush { data_size, .. } => {
                if node.next.is_none() {
                    return Err(errcorrupt!("merge sibling chain is evicted"));
                }
                *stale_size += data_size;
            }
            DeltaContent::Base { items } => {
                for i in items {
                    if item::below(i, hi) {
                        emits.push(Emit::Record(i.clone()));
                    }
                }
                return Ok(());
            }
        }
        pd = node.next.clone();
    }
    Ok(())
}

fn encode_header(head: &PageDelta) -> Result<Vec<u8>> {
    let mut buf = Vec::with_capacity(64);
    put_u16(&mut buf, head.chain_len);
    put_u16(&mut buf, head.num_items);
    encode_bound(&mut buf, head.hi_item.as_ref())?;
    encode_bound(&mut buf, head.right_sibling.item())?;
    Ok(buf)
}

fn encode_bound(buf: &mut Vec<u8>, bound: Option<&Arc<Item>>) -> Result<()> {
    match bound {
        None => put_u16(buf, 0),
        Some(itm) => {
            put_u16(buf, encoded_len(itm)?);
            itm.encode_into(buf)?;
        }
    }
    Ok(())
}

fn encode_emit(e: &Emit, buf: &mut Vec<u8>) -> Result<()> {
    match e {
        Emit::Record(itm) => {
            let op = if itm.is_delete() {
                PageOp::Delete
            } else {
                PageOp::Insert
            };
            put_u16(buf, op as u16);
            put_u16(buf, encoded_len(itm)?);
            itm.encode_into(buf)?;
        }
        Emit::Rollback(start, end) => {
            put_u16(buf, PageOp::Rollback as u16);
            put_u64(buf, *start);
            put_u64(buf, *end);
        }
        Emit::Base(items) => {
            put_u16(buf, PageOp::Base as u16);
            put_u16(buf, items.len() as u16);
            for itm in items {
                put_u16(buf, encoded_len(itm)?);
                itm.encode_into(buf)?;
            }
        }
        Emit::Link(offset) => {
            put_u16(buf, PageOp::Flush as u16);
            put_u64(buf, *offset);
        }
    }
    Ok(())
}

fn encoded_len(itm: &Item) -> Result<u16> {
    u16::try_from(itm.encoded_size()).map_err(|_| Error::KeyTooLarge)
}

fn put_u16(buf: &mut Vec<u8>, v: u16) {
    buf.extend_from_slice(&v.to_be_bytes());
}

fn put_u64(buf: &mut Vec<u8>, v: u64) {
    buf.extend_from_slice(&v.to_be_bytes());
}

/// Decodes just the header of a block payload.
pub(crate) fn decode_header(payload: &[u8]) -> Result<PageHeader> {
    let mut pos = 0usize;
    let chain_len = get_u16(payload, &mut pos)?;
    let num_items = get_u16(payload, &mut pos)?;
    let hi_item = decode_bound(payload, &mut pos)?;
    let right_low = decode_bound(payload, &mut pos)?;
    Ok(PageHeader {
        chain_len,
        num_items,
        hi_item,
        right_low,
    })
}

/// Decodes a whole block payload into its header, delta list, and the
/// link to the next older block, if any.
pub(crate) fn unmarshal(
    payload: &[u8],
) -> Result<(PageHeader, Vec<Decoded>, Option<LssOffset>)> {
    let mut pos = 0usize;
    let chain_len = get_u16(payload, &mut pos)?;
    let num_items = get_u16(payload, &mut pos)?;
    let hi_item = decode_bound(payload, &mut pos)?;
    let right_low = decode_bound(payload, &mut pos)?;
    let header = PageHeader {
        chain_len,
        num_items,
        hi_item,
        right_low,
    };

    let mut deltas = Vec::new();
    let mut link = None;
    while pos < payload.len() {
        let op = get_u16(payload, &mut pos)?;
        match op {
            x if x == PageOp::Insert as u16 || x == PageOp::Delete as u16 => {
                let len = get_u16(payload, &mut pos)? as usize;
                let itm = Item::decode(get_slice(payload, &mut pos, len)?)?;
                let expect_delete = x == PageOp::Delete as u16;
                if itm.is_delete() != expect_delete {
                    return Err(errcorrupt!("record delta op disagrees with item flags"));
                }
                deltas.push(Decoded::Record(Arc::new(itm)));
            }
            x if x == PageOp::Rollback as u16 => {
                let start = get_u64(payload, &mut pos)?;
                let end = get_u64(payload, &mut pos)?;
                deltas.push(Decoded::Rollback(start, end));
            }
            x if x == PageOp::Base as u16 => {
                let n = get_u16(payload, &mut pos)? as usize;
                let mut items = Vec::with_capacity(n);
                for _ in 0..n {
                    let len = get_u16(payload, &mut pos)? as usize;
                    items.push(Arc::new(Item::decode(get_slice(payload, &mut pos, len)?)?));
                }
                deltas.push(Decoded::Base(items));
                break;
            }
            x if x == PageOp::Flush as u16 => {
                link = Some(get_u64(payload, &mut pos)?);
                break;
            }
            other => return Err(errcorrupt!("malformed delta op {other}")),
        }
    }
    Ok((header, deltas, link))
}

fn decode_bound(payload: &[u8], pos: &mut usize) -> Result<Option<Arc<Item>>> {
    let len = get_u16(payload, pos)? as usize;
    if len == 0 {
        return Ok(None);
    }
    Ok(Some(Arc::new(Item::decode(get_slice(payload, pos, len)?)?)))
}

fn get_u16(payload: &[u8], pos: &mut usize) -> Result<u16> {
    let s = get_slice(payload, pos, 2)?;
    Ok(BigEndian::read_u16(s))
}

fn get_u64(payload: &[u8], pos: &mut usize) -> Result<u64> {
    let s = get_slice(payload, pos, 8)?;
    Ok(BigEndian::read_u64(s))
}

fn get_slice<'a>(payload: &'a [u8], pos: &mut usize, len: usize) -> Result<&'a [u8]> {
    if *pos + len > payload.len() {
        return Err(errcorrupt!("truncated page block"));
    }
    let s = &payload[*pos..*pos + len];
    *pos += len;
    Ok(s)
}

/// Rebuilds an in-memory chain from the concatenated delta lists of a
/// block and its linked predecessors (newest first), as produced by
/// following [`unmarshal`] links.
pub(crate) fn build_chain(header: &PageHeader, deltas: Vec<Decoded>) -> Result<DeltaRef> {
    let hi_item = header.hi_item.clone();
    let right_sibling = match &header.right_low {
        Some(itm) => PageId::for_key(itm.clone()),
        None => PageId::pos_inf(),
    };

    let mut iter = deltas.into_iter().rev();
    let Some(Decoded::Base(items)) = iter.next() else {
        return Err(errcorrupt!("page block chain has no base"));
    };
    let mut head = Arc::new(PageDelta {
        chain_len: 0,
        num_items: items.len() as u16,
        next: None,
        hi_item: hi_item.clone(),
        right_sibling: right_sibling.clone(),
        content: DeltaContent::Base { items },
    });

    for d in iter {
        let content = match d {
            Decoded::Record(item) => DeltaContent::Record { item },
            Decoded::Rollback(start, end) => DeltaContent::Rollback { start, end },
            Decoded::Base(_) => {
                return Err(errcorrupt!("page block chain has more than one base"));
            }
        };
        head = Arc::new(PageDelta {
            chain_len: head.chain_len + 1,
            num_items: header.num_items,
            next: Some(head),
            hi_item: hi_item.clone(),
            right_sibling: right_sibling.clone(),
            content,
        });
    }
    Ok(head)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::page::{base_head, LookupStep};
    use crate::pagetable::PageBound;
    use std::collections::HashMap;

    fn page_with(keys: &[(&[u8], u64)]) -> Page {
        let mut pg = Page::new(
            PageId::neg_inf(),
            PageBound::NegInf,
            Some(base_head(Vec::new(), None, PageId::pos_inf())),
        );
        for (k, sn) in keys {
            pg.insert(Arc::new(Item::insert(k, Some(b"v"), *sn)));
        }
        pg
    }

    /// Simulated flush: renders blocks oldest-first at fake offsets and
    /// reassembles the chain by following links, like a page reload does.
    fn flush_and_reload(pg: &Page, max_segments: u16) -> (Page, usize) {
        let plan = marshal(pg, max_segments).unwrap();
        let nblocks = plan.blocks.len();

        let mut store: HashMap<LssOffset, Vec<u8>> = HashMap::new();
        let mut prev: Option<LssOffset> = None;
        let mut next_offset = 100u64;
        for blk in &plan.blocks {
            let payload = blk.render(prev);
            store.insert(next_offset, payload);
            prev = Some(next_offset);
            next_offset += 1;
        }
        let newest = prev.unwrap();

        let mut all = Vec::new();
        let mut header = None;
        let mut next = Some(newest);
        while let Some(off) = next {
            let (hdr, deltas, link) = unmarshal(&store[&off]).unwrap();
            if header.is_none() {
                header = Some(hdr);
            }
            all.extend(deltas);
            next = link;
        }
        let header = header.unwrap();
        let head = build_chain(&header, all).unwrap();
        (
            Page::new(PageId::neg_inf(), PageBound::NegInf, Some(head)),
            nblocks,
        )
    }

    fn lookup_value(pg: &Page, key: &[u8]) -> Option<Vec<u8>> {
        match pg.lookup(&Item::probe(key)) {
            LookupStep::Found(itm) => itm.value().map(|v| v.to_vec()),
            _ => None,
        }
    }

    #[test]
    fn test_roundtrip_lookup_agreement() {
        let mut pg = page_with(&[(b"a", 1), (b"b", 2), (b"c", 3)]);
        pg.delete(Arc::new(Item::delete(b"b", 4)));

        let (back, nblocks) = flush_and_reload(&pg, 16);
        assert_eq!(nblocks, 1);
        for key in [&b"a"[..], b"b", b"c", b"x"] {
            assert_eq!(lookup_value(&pg, key), lookup_value(&back, key));
        }
        assert_eq!(lookup_value(&back, b"a"), Some(b"v".to_vec()));
        assert_eq!(lookup_value(&back, b"b"), None);
    }

    #[test]
    fn test_hi_max_roundtrip() {
        let pg = page_with(&[(b"a", 1)]);
        let plan = marshal(&pg, 16).unwrap();
        let (hdr, _, _) = unmarshal(&plan.blocks[0].render(None)).unwrap();
        assert!(hdr.hi_item.is_none());
        assert!(hdr.right_low.is_none());
    }

    #[test]
    fn test_long_chain_produces_linked_blocks() {
        let keys: Vec<(Vec<u8>, u64)> = (0..10u64)
            .map(|i| (format!("k{i}").into_bytes(), i + 1))
            .collect();
        let refs: Vec<(&[u8], u64)> = keys.iter().map(|(k, s)| (k.as_slice(), *s)).collect();
        let pg = page_with(&refs);

        // 10 records + 1 base with a 4-delta cap per block
        let (back, nblocks) = flush_and_reload(&pg, 4);
        assert_eq!(nblocks, 3);
        for (k, _) in &refs {
            assert_eq!(lookup_value(&back, k), Some(b"v".to_vec()));
        }
        assert_eq!(back.head.as_ref().unwrap().chain_len, 10);
    }

    #[test]
    fn test_split_page_marshals_in_range_only() {
        let mut pg = page_with(&[(b"a", 1), (b"m", 2), (b"z", 3)]);
        pg.compact(&mut crate::page::collect::KeepAll).unwrap();
        let plan = pg.split_plan().unwrap().unwrap();
        let right_pid = PageId::for_key(plan.pivot.clone());
        pg.apply_split(&plan, right_pid);

        let (back, _) = flush_and_reload(&pg, 16);
        assert_eq!(lookup_value(&back, b"a"), Some(b"v".to_vec()));
        // "z" now belongs to the right sibling and is not marshaled here
        assert!(matches!(
            back.lookup(&Item::probe(b"z")),
            LookupStep::Right(_)
        ));
        assert_eq!(back.hi_item().unwrap().key(), b"m");
    }

    #[test]
    fn test_rollback_delta_survives_roundtrip() {
        let mut pg = page_with(&[(b"k", 5)]);
        pg.insert(Arc::new(Item::insert(b"k", Some(b"w"), 9)));
        pg.rollback(9, 9);

        let (back, _) = flush_and_reload(&pg, 16);
        assert_eq!(lookup_value(&back, b"k"), Some(b"v".to_vec()));
    }

    #[test]
    fn test_malformed_op_is_corrupt() {
        let pg = page_with(&[(b"a", 1)]);
        let plan = marshal(&pg, 16).unwrap();
        let mut payload = plan.blocks[0].render(None);
        // stomp the first delta's op tag
        let hdr = decode_header(&payload).unwrap();
        assert!(hdr.hi_item.is_none());
        let op_at = 2 + 2 + 2 + 2; // chain_len, num_items, empty hi, empty right
        payload[op_at] = 0xff;
        payload[op_at + 1] = 0xff;
        assert!(matches!(
            unmarshal(&payload),
            Err(Error::CorruptLog(_))
        ));
    }
}
