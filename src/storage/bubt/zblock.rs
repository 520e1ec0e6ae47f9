//! Leaf (z) blocks
//!
//! ## Block Format
//! ```text
//! count: u32 | index[count]: u32 | entries ... | zero padding
//! ```
//! `index[i]` is the offset of entry `i` from the start of the block.
//!
//! ## Entry Format
//! ```text
//! flags: u16 | vbno: u16 | vbuuid: u64 (ZFLAG_VBUUID) | bornseqno: u64
//! | deadseqno: u64 (ZFLAG_DELETED) | keylen: u16 | key
//! | value length, or value-log position (ZFLAG_VALFILE): u64 | inline value
//! ```
//! All integers big-endian.

use super::vlog::VlogBuffer;
use crate::types::Entry;
use crate::{Result, StorageError};
use std::cmp::Ordering;

/// Value lives in the value log
pub const ZFLAG_VALFILE: u16 = 0x1;
/// Entry is a tombstone
pub const ZFLAG_DELETED: u16 = 0x2;
/// Entry carries a vbuuid
pub const ZFLAG_VBUUID: u16 = 0x4;

/// Encoder for one z-block.
pub(crate) struct ZBlockBuilder {
    blocksize: usize,
    offsets: Vec<u32>,
    entries: Vec<u8>,
    first_key: Vec<u8>,
    keymem: usize,
    valmem: usize,
}

impl ZBlockBuilder {
    pub fn new(blocksize: usize) -> Self {
        Self {
            blocksize,
            offsets: Vec::with_capacity(64),
            entries: Vec::with_capacity(blocksize),
            first_key: Vec::new(),
            keymem: 0,
            valmem: 0,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.offsets.is_empty()
    }

    pub fn len(&self) -> usize {
        self.offsets.len()
    }

    pub fn first_key(&self) -> &[u8] {
        &self.first_key
    }

    fn encoded_size(entry: &Entry, in_vlog: bool) -> usize {
        let mut n = 2 + 2 + 8 + 2 + entry.key.len() + 8;
        if entry.vbuuid != 0 {
            n += 8;
        }
        if entry.deleted {
            n += 8;
        }
        if !in_vlog {
            n += entry.value.len();
        }
        n
    }

    /// Append `entry`, its value goes to `vlog` when one is given.
    /// Returns false when the block is full, fails when the entry would not
    /// fit even an empty block.
    pub fn insert(&mut self, entry: &Entry, vlog: Option<&mut VlogBuffer>) -> Result<bool> {
        let in_vlog = vlog.is_some() && !entry.value.is_empty();
        let size = Self::encoded_size(entry, in_vlog);
        let footprint = 4 + 4 * (self.offsets.len() + 1) + self.entries.len() + size;
        if footprint > self.blocksize || entry.key.len() > u16::MAX as usize {
            if self.is_empty() {
                return Err(StorageError::EntryExceedsBlockSize {
                    size: 8 + size,
                    blocksize: self.blocksize,
                });
            }
            return Ok(false);
        }

        let mut flags = 0;
        if entry.vbuuid != 0 {
            flags |= ZFLAG_VBUUID;
        }
        if entry.deleted {
            flags |= ZFLAG_DELETED;
        }
        if in_vlog {
            flags |= ZFLAG_VALFILE;
        }

        self.offsets.push(self.entries.len() as u32);
        let buf = &mut self.entries;
        buf.extend_from_slice(&flags.to_be_bytes());
        buf.extend_from_slice(&entry.vbno.to_be_bytes());
        if entry.vbuuid != 0 {
            buf.extend_from_slice(&entry.vbuuid.to_be_bytes());
        }
        buf.extend_from_slice(&entry.bornseqno.to_be_bytes());
        if entry.deleted {
            buf.extend_from_slice(&entry.deadseqno.to_be_bytes());
        }
        buf.extend_from_slice(&(entry.key.len() as u16).to_be_bytes());
        buf.extend_from_slice(&entry.key);
        match vlog {
            Some(vlog) if in_vlog => {
                let fpos = vlog.append(&entry.value);
                buf.extend_from_slice(&fpos.to_be_bytes());
            }
            _ => {
                buf.extend_from_slice(&(entry.value.len() as u64).to_be_bytes());
                buf.extend_from_slice(&entry.value);
            }
        }

        if self.first_key.is_empty() {
            self.first_key = entry.key.clone();
        }
        self.keymem += entry.key.len();
        self.valmem += entry.value.len();
        Ok(true)
    }

    /// Encode the block, returns the block and its zero padding in bytes.
    pub fn finalize(&mut self) -> (Vec<u8>, usize) {
        let header = 4 + 4 * self.offsets.len();
        let mut block = Vec::with_capacity(self.blocksize);
        block.extend_from_slice(&(self.offsets.len() as u32).to_be_bytes());
        for offset in self.offsets.iter() {
            block.extend_from_slice(&(header as u32 + offset).to_be_bytes());
        }
        block.extend_from_slice(&self.entries);
        let padding = self.blocksize - block.len();
        block.resize(self.blocksize, 0);
        self.reset();
        (block, padding)
    }

    fn reset(&mut self) {
        self.offsets.clear();
        self.entries.clear();
        self.first_key.clear();
        self.keymem = 0;
        self.valmem = 0;
    }
}

/// Where an entry's value lives.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ZValue<'a> {
    Inline(&'a [u8]),
    /// Position of `[u64 len][value]` in the shard's value log
    Vlog(u64),
}

/// Decoded view of one z-block entry.
#[derive(Debug, Clone, Copy)]
pub(crate) struct ZEntry<'a> {
    pub flags: u16,
    pub vbno: u16,
    pub vbuuid: u64,
    pub bornseqno: u64,
    pub deadseqno: u64,
    pub key: &'a [u8],
    pub value: ZValue<'a>,
}

impl<'a> ZEntry<'a> {
    pub fn is_deleted(&self) -> bool {
        self.flags & ZFLAG_DELETED != 0
    }

    /// Entry with the value resolved by the caller.
    pub fn to_entry(&self, value: Vec<u8>) -> Entry {
        Entry {
            key: self.key.to_vec(),
            value,
            bornseqno: self.bornseqno,
            deadseqno: self.deadseqno,
            deleted: self.is_deleted(),
            vbno: self.vbno,
            vbuuid: self.vbuuid,
        }
    }
}

fn corrupt(what: &str) -> StorageError {
    StorageError::CorruptSnapshot(format!("zblock {}", what))
}

pub(crate) fn read_u16(buf: &[u8], at: usize) -> Option<u16> {
    buf.get(at..at + 2).map(|b| u16::from_be_bytes([b[0], b[1]]))
}

pub(crate) fn read_u32(buf: &[u8], at: usize) -> Option<u32> {
    buf.get(at..at + 4).map(|b| u32::from_be_bytes([b[0], b[1], b[2], b[3]]))
}

pub(crate) fn read_u64(buf: &[u8], at: usize) -> Option<u64> {
    let b = buf.get(at..at + 8)?;
    let mut arr = [0u8; 8];
    arr.copy_from_slice(b);
    Some(u64::from_be_bytes(arr))
}

/// Read-side view over an encoded z-block.
pub(crate) struct ZBlockView<'a> {
    buf: &'a [u8],
    count: usize,
}

impl<'a> ZBlockView<'a> {
    pub fn new(buf: &'a [u8]) -> Result<Self> {
        let count = read_u32(buf, 0).ok_or_else(|| corrupt("header"))? as usize;
        if 4 + 4 * count > buf.len() {
            return Err(corrupt("index overflow"));
        }
        Ok(Self { buf, count })
    }

    pub fn len(&self) -> usize {
        self.count
    }

    fn offset(&self, i: usize) -> Result<usize> {
        read_u32(self.buf, 4 + 4 * i).map(|o| o as usize).ok_or_else(|| corrupt("index"))
    }

    pub fn entry(&self, i: usize) -> Result<ZEntry<'a>> {
        let buf = self.buf;
        let mut at = self.offset(i)?;
        let flags = read_u16(buf, at).ok_or_else(|| corrupt("flags"))?;
        let vbno = read_u16(buf, at + 2).ok_or_else(|| corrupt("vbno"))?;
        at += 4;
        let mut vbuuid = 0;
        if flags & ZFLAG_VBUUID != 0 {
            vbuuid = read_u64(buf, at).ok_or_else(|| corrupt("vbuuid"))?;
            at += 8;
        }
        let bornseqno = read_u64(buf, at).ok_or_else(|| corrupt("bornseqno"))?;
        at += 8;
        let mut deadseqno = 0;
        if flags & ZFLAG_DELETED != 0 {
            deadseqno = read_u64(buf, at).ok_or_else(|| corrupt("deadseqno"))?;
            at += 8;
        }
        let keylen = read_u16(buf, at).ok_or_else(|| corrupt("keylen"))? as usize;
        at += 2;
        let key = buf.get(at..at + keylen).ok_or_else(|| corrupt("key"))?;
        at += keylen;
        let num = read_u64(buf, at).ok_or_else(|| corrupt("value"))?;
        at += 8;
        let value = if flags & ZFLAG_VALFILE != 0 {
            ZValue::Vlog(num)
        } else {
            let vlen = num as usize;
            ZValue::Inline(buf.get(at..at + vlen).ok_or_else(|| corrupt("inline value"))?)
        };
        Ok(ZEntry { flags, vbno, vbuuid, bornseqno, deadseqno, key, value })
    }

    /// Key of entry `i` without decoding the rest.
    pub fn key(&self, i: usize) -> Result<&'a [u8]> {
        self.entry(i).map(|entry| entry.key)
    }

    /// Binary search, `Err(i)` is the insertion point.
    pub fn search(&self, key: &[u8]) -> Result<std::result::Result<usize, usize>> {
        let (mut lo, mut hi) = (0, self.count);
        while lo < hi {
            let mid = (lo + hi) / 2;
            match self.key(mid)?.cmp(key) {
                Ordering::Less => lo = mid + 1,
                Ordering::Greater => hi = mid,
                Ordering::Equal => return Ok(Ok(mid)),
            }
        }
        Ok(Err(lo))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(key: &str, value: &str, seqno: u64) -> Entry {
        Entry::new(key.as_bytes().to_vec(), value.as_bytes().to_vec(), seqno)
    }

    #[test]
    fn test_zblock_codec() {
        let mut builder = ZBlockBuilder::new(512);
        let mut tomb = entry("b", "", 5);
        tomb.deleted = true;
        tomb.deadseqno = 9;
        let mut repl = entry("c", "gamma", 7);
        repl.vbno = 3;
        repl.vbuuid = 0xdead;

        assert!(builder.insert(&entry("a", "alpha", 1), None).unwrap());
        assert!(builder.insert(&tomb, None).unwrap());
        assert!(builder.insert(&repl, None).unwrap());
        assert_eq!(builder.first_key(), b"a");

        let (block, padding) = builder.finalize();
        assert_eq!(block.len(), 512);
        assert!(padding > 0);
        assert!(builder.is_empty());

        let view = ZBlockView::new(&block).unwrap();
        assert_eq!(view.len(), 3);
        let a = view.entry(0).unwrap();
        assert_eq!(a.key, b"a");
        assert_eq!(a.value, ZValue::Inline(b"alpha"));
        assert_eq!(a.bornseqno, 1);

        let b = view.entry(1).unwrap();
        assert!(b.is_deleted());
        assert_eq!(b.deadseqno, 9);
        assert_eq!(b.bornseqno, 5);

        let c = view.entry(2).unwrap();
        assert_eq!((c.vbno, c.vbuuid), (3, 0xdead));
        assert_eq!(c.to_entry(b"gamma".to_vec()), repl);

        assert_eq!(view.search(b"b").unwrap(), Ok(1));
        assert_eq!(view.search(b"bb").unwrap(), Err(2));
        assert_eq!(view.search(b"z").unwrap(), Err(3));
    }

    #[test]
    fn test_zblock_overflow() {
        let mut builder = ZBlockBuilder::new(512);
        let value = "x".repeat(200);
        assert!(builder.insert(&entry("k1", &value, 1), None).unwrap());
        assert!(builder.insert(&entry("k2", &value, 2), None).unwrap());
        assert!(!builder.insert(&entry("k3", &value, 3), None).unwrap());
        assert_eq!(builder.len(), 2);

        let mut empty = ZBlockBuilder::new(512);
        let huge = "x".repeat(600);
        assert!(matches!(
            empty.insert(&entry("k", &huge, 1), None),
            Err(StorageError::EntryExceedsBlockSize { .. })
        ));
    }

    #[test]
    fn test_zblock_vlog_values() {
        let mut vlog = VlogBuffer::new(512, 0);
        let mut builder = ZBlockBuilder::new(512);
        let value = "v".repeat(1000);
        assert!(builder.insert(&entry("big", &value, 1), Some(&mut vlog)).unwrap());
        assert!(builder.insert(&entry("empty", "", 2), Some(&mut vlog)).unwrap());

        let (block, _) = builder.finalize();
        let view = ZBlockView::new(&block).unwrap();
        let big = view.entry(0).unwrap();
        assert_eq!(big.value, ZValue::Vlog(0));
        assert_eq!(big.flags & ZFLAG_VALFILE, ZFLAG_VALFILE);
        let empty = view.entry(1).unwrap();
        assert_eq!(empty.value, ZValue::Inline(b""));
    }

    #[test]
    fn test_zblock_corrupt() {
        let mut block = vec![0u8; 512];
        block[..4].copy_from_slice(&1000u32.to_be_bytes());
        assert!(matches!(ZBlockView::new(&block), Err(StorageError::CorruptSnapshot(_))));
    }
}
