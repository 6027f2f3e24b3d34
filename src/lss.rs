//! The log-structured store: a single append-only file of typed blocks.
//!
//! # File format
//!
//! ```text
//! +------------+------------+------------------------------+
//! | len: u32   | crc32: u32 | block: type u16 + payload    |
//! +------------+------------+------------------------------+
//! ```
//!
//! - `len` covers the block (type tag + payload), big-endian
//! - CRC-32/ISCSI over the block bytes
//! - offsets handed to callers are the file offset of the frame
//!
//! # Reservation protocol
//!
//! Writers call [`Lss::reserve`] to claim space (offsets are allocated
//! strictly monotonically under the internal lock), fill the returned
//! buffer, and [`Reservation::finalize`]. Frames reach the file in
//! offset order: a finalized reservation is held back until every
//! earlier one is finalized too. A dropped reservation finalizes itself
//! as `lssDiscard`, so a failed writer can never wedge the commit
//! pipeline; discarded blocks are skipped at read time.

use std::collections::VecDeque;
use std::fs::{File, OpenOptions};
use std::io::{BufWriter, Seek, SeekFrom, Write};
use std::os::unix::fs::FileExt;
use std::path::Path;
use std::sync::{Condvar, Mutex};

use byteorder::{BigEndian, ByteOrder, WriteBytesExt};
use crc::{Crc, CRC_32_ISCSI};

use crate::errcorrupt;
use crate::error::Result;

/// File offset of a block's frame.
pub type LssOffset = u64;

pub const CRC32: Crc<u32> = Crc::<u32>::new(&CRC_32_ISCSI);

pub const BLOCK_TYPE_SIZE: usize = 2;
const FRAME_HEADER_SIZE: usize = 8;

/// Block type tags.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u16)]
pub enum BlockType {
    /// Self-contained marshaled page.
    PageData = 1,
    /// Page rewritten by the log cleaner.
    PageReloc = 2,
    /// Marshaled page tail referencing earlier blocks.
    PageUpdate = 3,
    /// A page was removed after a merge.
    PageRemove = 4,
    /// The versioned recovery-point list.
    RecoveryPoints = 5,
    /// Upper bound for sequence numbers after recovery.
    MaxSn = 6,
    /// Abandoned reservation; skipped by readers.
    Discard = 7,
}

impl BlockType {
    pub fn from_u16(v: u16) -> Result<BlockType> {
        Ok(match v {
            1 => BlockType::PageData,
            2 => BlockType::PageReloc,
            3 => BlockType::PageUpdate,
            4 => BlockType::PageRemove,
            5 => BlockType::RecoveryPoints,
            6 => BlockType::MaxSn,
            7 => BlockType::Discard,
            other => return Err(errcorrupt!("unknown block type {other}")),
        })
    }
}

struct Pending {
    size: usize,
    body: Option<Vec<u8>>,
}

struct Inner {
    /// File offset of the next reservation.
    tail: LssOffset,
    writer: BufWriter<File>,
    pending: VecDeque<Pending>,
    base_seq: u64,
    next_seq: u64,
}

/// Append-only log store.
pub struct Lss {
    file: File,
    inner: Mutex<Inner>,
    drained: Condvar,
}

/// A claimed slice of the log. Fill it with [`write_block`]
/// (`Reservation::write_block`) and commit with `finalize`; dropping an
/// unfinalized reservation commits it as a discard block.
pub struct Reservation<'a> {
    lss: &'a Lss,
    offset: LssOffset,
    seq: u64,
    body: Vec<u8>,
    done: bool,
}

impl Reservation<'_> {
    pub fn offset(&self) -> LssOffset {
        self.offset
    }

    /// Writes the block (type tag + payload) into the reserved space.
    pub fn write_block(&mut self, typ: BlockType, payload: &[u8]) {
        debug_assert_eq!(BLOCK_TYPE_SIZE + payload.len(), self.body.len());
        BigEndian::write_u16(&mut self.body[..BLOCK_TYPE_SIZE], typ as u16);
        self.body[BLOCK_TYPE_SIZE..].copy_from_slice(payload);
    }

    /// Overwrites the type tag so the block is skipped at read time.
    /// Used when the mapping CAS the block was written for has failed.
    pub fn discard(&mut self) {
        BigEndian::write_u16(&mut self.body[..BLOCK_TYPE_SIZE], BlockType::Discard as u16);
    }

    pub fn finalize(mut self) -> Result<()> {
        self.done = true;
        let body = std::mem::take(&mut self.body);
        self.lss.complete(self.seq, body)
    }
}

impl Drop for Reservation<'_> {
    fn drop(&mut self) {
        if !self.done {
            let mut body = std::mem::take(&mut self.body);
            if body.len() >= BLOCK_TYPE_SIZE {
                BigEndian::write_u16(&mut body[..BLOCK_TYPE_SIZE], BlockType::Discard as u16);
            }
            let _ = self.lss.complete(self.seq, body);
        }
    }
}

impl Lss {
    /// Opens (or creates) the log at `path`. A torn frame at the tail,
    /// the signature of a crash mid-append, is truncated away.
    pub fn open(path: &Path) -> Result<Lss> {
        let file = OpenOptions::new()
            .create(true)
            .read(true)
            .write(true)
            .open(path)?;

        let file_len = file.metadata()?.len();
        let tail = scan_valid_tail(&file, file_len)?;
        if tail < file_len {
            tracing::warn!(
                tail,
                file_len,
                "dropping torn bytes at the end of the log"
            );
            file.set_len(tail)?;
        }

        let mut write_file = file.try_clone()?;
        write_file.seek(SeekFrom::Start(tail))?;

        Ok(Lss {
            file,
            inner: Mutex::new(Inner {
                tail,
                writer: BufWriter::new(write_file),
                pending: VecDeque::new(),
                base_seq: 0,
                next_seq: 0,
            }),
            drained: Condvar::new(),
        })
    }

    /// Claims `size` bytes (type tag included) at the next offset.
    pub fn reserve(&self, size: usize) -> Result<Reservation<'_>> {
        debug_assert!(size >= BLOCK_TYPE_SIZE);
        let mut inner = self.inner.lock()?;
        let offset = inner.tail;
        inner.tail += (FRAME_HEADER_SIZE + size) as u64;
        let seq = inner.next_seq;
        inner.next_seq += 1;
        inner.pending.push_back(Pending { size, body: None });
        Ok(Reservation {
            lss: self,
            offset,
            seq,
            body: vec![0u8; size],
            done: false,
        })
    }

    fn complete(&self, seq: u64, body: Vec<u8>) -> Result<()> {
        let mut inner = self.inner.lock()?;
        let idx = (seq - inner.base_seq) as usize;
        debug_assert_eq!(inner.pending[idx].size, body.len());
        inner.pending[idx].body = Some(body);

        // frames commit strictly in offset order
        loop {
            match inner.pending.front() {
                Some(p) if p.body.is_some() => {}
                _ => break,
            }
            let Some(p) = inner.pending.pop_front() else {
                break;
            };
            inner.base_seq += 1;
            let Some(body) = p.body else { break };
            inner.writer.write_u32::<BigEndian>(body.len() as u32)?;
            inner.writer.write_u32::<BigEndian>(CRC32.checksum(&body))?;
            inner.writer.write_all(&body)?;
        }

        if inner.pending.is_empty() {
            self.drained.notify_all();
        }
        Ok(())
    }

    /// Blocks until every reservation taken so far is committed, then
    /// flushes the write buffer; with `force`, also fdatasyncs.
    pub fn sync(&self, force: bool) -> Result<()> {
        let mut inner = self.inner.lock()?;
        while !inner.pending.is_empty() {
            inner = self.drained.wait(inner)?;
        }
        inner.writer.flush()?;
        drop(inner);
        if force {
            self.file.sync_data()?;
        }
        Ok(())
    }

    /// Reads the block at `offset`. Fails with `CorruptLog` on a bad
    /// checksum or an unknown type tag.
    pub fn read(&self, offset: LssOffset) -> Result<(BlockType, Vec<u8>)> {
        {
            // the frame may still sit in the write buffer
            let mut inner = self.inner.lock()?;
            inner.writer.flush()?;
        }

        let mut header = [0u8; FRAME_HEADER_SIZE];
        self.file.read_exact_at(&mut header, offset)?;
        let len = BigEndian::read_u32(&header[..4]) as usize;
        let crc = BigEndian::read_u32(&header[4..]);
        if len < BLOCK_TYPE_SIZE {
            return Err(errcorrupt!("undersized block at offset {offset}"));
        }

        let mut body = vec![0u8; len];
        self.file
            .read_exact_at(&mut body, offset + FRAME_HEADER_SIZE as u64)?;
        if CRC32.checksum(&body) != crc {
            return Err(errcorrupt!("crc mismatch for block at offset {offset}"));
        }

        let typ = BlockType::from_u16(BigEndian::read_u16(&body[..BLOCK_TYPE_SIZE]))?;
        let payload = body.split_off(BLOCK_TYPE_SIZE);
        Ok((typ, payload))
    }

    /// Sequentially visits every non-discard block. Used by recovery.
    ///
    /// All reads go through `pread` so the writer's shared cursor is
    /// never disturbed.
    pub fn replay<F>(&self, mut f: F) -> Result<()>
    where
        F: FnMut(LssOffset, BlockType, &[u8]) -> Result<()>,
    {
        let end = {
            let mut inner = self.inner.lock()?;
            inner.writer.flush()?;
            inner.tail
        };

        let mut offset = 0u64;
        while offset < end {
            let mut header = [0u8; FRAME_HEADER_SIZE];
            self.file.read_exact_at(&mut header, offset)?;
            let len = BigEndian::read_u32(&header[..4]) as usize;
            let crc = BigEndian::read_u32(&header[4..]);
            let mut body = vec![0u8; len];
            self.file
                .read_exact_at(&mut body, offset + FRAME_HEADER_SIZE as u64)?;
            if CRC32.checksum(&body) != crc {
                return Err(errcorrupt!("crc mismatch for block at offset {offset}"));
            }
            let typ = BlockType::from_u16(BigEndian::read_u16(&body[..BLOCK_TYPE_SIZE]))?;
            if typ != BlockType::Discard {
                f(offset, typ, &body[BLOCK_TYPE_SIZE..])?;
            }
            offset += (FRAME_HEADER_SIZE + len) as u64;
        }
        Ok(())
    }

    /// Offset one past the last reserved byte.
    pub fn tail_offset(&self) -> Result<LssOffset> {
        Ok(self.inner.lock()?.tail)
    }
}

/// Walks whole frames from the start; returns the offset after the last
/// intact one.
fn scan_valid_tail(file: &File, file_len: u64) -> Result<u64> {
    let mut pos = 0u64;
    loop {
        if pos + FRAME_HEADER_SIZE as u64 > file_len {
            break;
        }
        let mut header = [0u8; FRAME_HEADER_SIZE];
        file.read_exact_at(&mut header, pos)?;
        let len = BigEndian::read_u32(&header[..4]) as u64;
        let crc = BigEndian::read_u32(&header[4..]);
        if pos + FRAME_HEADER_SIZE as u64 + len > file_len {
            break;
        }
        let mut body = vec![0u8; len as usize];
        file.read_exact_at(&mut body, pos + FRAME_HEADER_SIZE as u64)?;
        if CRC32.checksum(&body) != crc {
            break;
        }
        pos += FRAME_HEADER_SIZE as u64 + len;
    }
    Ok(pos)
}
