//! Writer handles and per-writer scratch state.

use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::{Arc, Mutex};

use crate::error::{Error, Result};
use crate::item::Item;
use crate::page::DeltaRef;
use crate::store::Store;

/// A reusable byte buffer that grows geometrically with a floor of the
/// requested size.
pub struct Buffer {
    data: Vec<u8>,
}

impl Buffer {
    pub fn new() -> Buffer {
        Buffer { data: Vec::new() }
    }

    /// Clears the buffer and guarantees room for `size` bytes.
    pub fn request(&mut self, size: usize) -> &mut Vec<u8> {
        self.data.clear();
        if self.data.capacity() < size {
            let target = (self.data.capacity() * 2).max(size);
            self.data.reserve(target);
        }
        &mut self.data
    }
}

impl Default for Buffer {
    fn default() -> Self {
        Self::new()
    }
}

/// Scratch state for one flush worker.
pub(crate) struct FlushCtx {
    pub buf: Buffer,
}

impl FlushCtx {
    pub(crate) fn new() -> FlushCtx {
        FlushCtx { buf: Buffer::new() }
    }
}

/// Writer state the store keeps a handle on after the writer is gone:
/// the per-snapshot op counter rolled up by `new_snapshot`, and the
/// reclaim list of detached chains.
pub(crate) struct WriterShared {
    pub count: AtomicI64,
    pub reclaim: Mutex<Vec<DeltaRef>>,
}

/// A mutation handle. Writers are cheap; create one per thread.
pub struct Writer {
    store: Arc<Store>,
    shared: Arc<WriterShared>,
}

impl Writer {
    pub(crate) fn new(store: Arc<Store>, shared: Arc<WriterShared>) -> Writer {
        Writer { store, shared }
    }

    fn check_key(&self, key: &[u8], value_len: usize) -> Result<()> {
        if self.store.is_shutdown() {
            return Err(Error::ShuttingDown);
        }
        if key.len() > self.store.config().max_key_size
            || crate::item::ITEM_FIXED_SIZE + key.len() + value_len > u16::MAX as usize
        {
            return Err(Error::KeyTooLarge);
        }
        Ok(())
    }

    /// Inserts or replaces `key`, stamped with the current sequence
    /// number.
    pub fn insert(&mut self, key: &[u8], value: &[u8]) -> Result<()> {
        self.check_key(key, value.len())?;
        let sn = self.store.load_sn();
        let itm = Arc::new(Item::insert(key, Some(value), sn));
        self.store.mutate(itm, &self.shared)?;
        self.shared.count.fetch_add(1, Ordering::AcqRel);
        Ok(())
    }

    /// Records a delete marker for `key`.
    pub fn delete(&mut self, key: &[u8]) -> Result<()> {
        self.check_key(key, 0)?;
        let sn = self.store.load_sn();
        let itm = Arc::new(Item::delete(key, sn));
        self.store.mutate(itm, &self.shared)?;
        self.shared.count.fetch_sub(1, Ordering::AcqRel);
        Ok(())
    }

    /// The newest committed value for `key`.
    pub fn lookup(&self, key: &[u8]) -> Result<Vec<u8>> {
        if self.store.is_shutdown() {
            return Err(Error::ShuttingDown);
        }
        let probe = Arc::new(Item::probe(key));
        let found = self.store.lookup_item(&probe)?;
        match found {
            Some(itm) if itm.is_insert() => match itm.value() {
                Some(v) => Ok(v.to_vec()),
                None => Err(Error::ItemNoValue),
            },
            _ => Err(Error::ItemNotFound),
        }
    }
}
