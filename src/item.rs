//! Versioned key/value records.
//!
//! An [`Item`] is one immutable version of a key: the key bytes, an
//! optional value, the sequence number of the writer that produced it and
//! a delete flag. Page chains, base pages and the log all store items in
//! the encoded form produced here.
//!
//! Ordering is subtle: the comparator is **key-only**. The
//! `(key asc, sn desc)` order that collections expose comes from stable
//! sorting a newest-first traversal, not from the comparator itself.

use std::cmp::Ordering;
use std::io::Cursor;
use std::sync::Arc;

use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};

use crate::errcorrupt;
use crate::error::Result;

const FLAG_DELETE: u8 = 0b0000_0001;
const FLAG_HAS_VALUE: u8 = 0b0000_0010;

/// Fixed part of the encoded form: sn + flags + key len + value len.
pub const ITEM_FIXED_SIZE: usize = 8 + 1 + 2 + 4;

/// One immutable version of a key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Item {
    sn: u64,
    flags: u8,
    key: Vec<u8>,
    value: Vec<u8>,
}

impl Item {
    /// A new insert version. `value` of `None` records the key with no
    /// payload (lookups report `ItemNoValue`).
    pub fn insert(key: &[u8], value: Option<&[u8]>, sn: u64) -> Item {
        let (flags, value) = match value {
            Some(v) => (FLAG_HAS_VALUE, v.to_vec()),
            None => (0, Vec::new()),
        };
        Item {
            sn,
            flags,
            key: key.to_vec(),
            value,
        }
    }

    /// A new delete marker.
    pub fn delete(key: &[u8], sn: u64) -> Item {
        Item {
            sn,
            flags: FLAG_DELETE,
            key: key.to_vec(),
            value: Vec::new(),
        }
    }

    /// A comparison probe. Probes never carry a value and compare equal to
    /// every version of the same key.
    pub fn probe(key: &[u8]) -> Item {
        Item {
            sn: 0,
            flags: 0,
            key: key.to_vec(),
            value: Vec::new(),
        }
    }

    pub fn key(&self) -> &[u8] {
        &self.key
    }

    /// The value, or `None` when the version has none (deletes and
    /// valueless inserts).
    pub fn value(&self) -> Option<&[u8]> {
        if self.flags & FLAG_HAS_VALUE != 0 {
            Some(&self.value)
        } else {
            None
        }
    }

    pub fn sn(&self) -> u64 {
        self.sn
    }

    pub fn is_delete(&self) -> bool {
        self.flags & FLAG_DELETE != 0
    }

    pub fn is_insert(&self) -> bool {
        !self.is_delete()
    }

    pub fn has_value(&self) -> bool {
        self.flags & FLAG_HAS_VALUE != 0
    }

    /// Size of the encoded form.
    pub fn encoded_size(&self) -> usize {
        ITEM_FIXED_SIZE + self.key.len() + self.value.len()
    }

    /// Appends the encoded form to `buf`.
    ///
    /// Layout (big-endian): `[sn: u64][flags: u8][klen: u16][key]
    /// [vlen: u32][value]`.
    pub fn encode_into(&self, buf: &mut Vec<u8>) -> Result<()> {
        buf.write_u64::<BigEndian>(self.sn)?;
        buf.write_u8(self.flags)?;
        buf.write_u16::<BigEndian>(self.key.len() as u16)?;
        buf.extend_from_slice(&self.key);
        buf.write_u32::<BigEndian>(self.value.len() as u32)?;
        buf.extend_from_slice(&self.value);
        Ok(())
    }

    /// Decodes an item, copying key and value out of `data` into fresh
    /// allocations so the result never aliases a transient buffer.
    pub fn decode(data: &[u8]) -> Result<Item> {
        let mut cur = Cursor::new(data);
        let sn = read(cur.read_u64::<BigEndian>())?;
        let flags = read(cur.read_u8())?;
        if flags & !(FLAG_DELETE | FLAG_HAS_VALUE) != 0 {
            return Err(errcorrupt!("unknown item flags {flags:#04x}"));
        }
        let klen = read(cur.read_u16::<BigEndian>())? as usize;
        let key = take(&mut cur, klen)?;
        let vlen = read(cur.read_u32::<BigEndian>())? as usize;
        let value = take(&mut cur, vlen)?;
        Ok(Item {
            sn,
            flags,
            key,
            value,
        })
    }
}

fn read<T>(res: std::io::Result<T>) -> Result<T> {
    res.map_err(|_| errcorrupt!("truncated item"))
}

fn take(cur: &mut Cursor<&[u8]>, len: usize) -> Result<Vec<u8>> {
    let pos = cur.position() as usize;
    let data = *cur.get_ref();
    if pos + len > data.len() {
        return Err(errcorrupt!("truncated item"));
    }
    cur.set_position((pos + len) as u64);
    Ok(data[pos..pos + len].to_vec())
}

/// Key-only comparison. All versions of a key compare equal.
pub fn compare(a: &Item, b: &Item) -> Ordering {
    a.key.cmp(&b.key)
}

/// True when `itm` is below the exclusive upper bound `hi`
/// (`None` == +∞, the MaxItem sentinel).
pub fn below(itm: &Item, hi: Option<&Arc<Item>>) -> bool {
    match hi {
        Some(hi) => compare(itm, hi) == Ordering::Less,
        None => true,
    }
}

/// True when `itm` falls inside `[lo, hi)`; a `lo` of `None` is -∞.
pub fn in_range(itm: &Item, lo: Option<&Arc<Item>>, hi: Option<&Arc<Item>>) -> bool {
    let above_lo = match lo {
        Some(lo) => compare(itm, lo) != Ordering::Less,
        None => true,
    };
    above_lo && below(itm, hi)
}
