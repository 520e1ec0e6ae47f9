//! Intermediate (m) blocks
//!
//! ## Block Format
//! ```text
//! count: u32 | index[count]: u32 | entries ... | zero padding
//! entry: keylen: u16 | key | child: u64
//! ```
//! Each entry key is the first key of the child's subtree.
//!
//! ## Child pointer
//! Bit 0 set points at a z-block, the high byte then names the z shard.
//! The remaining low 56 bits, bit 0 cleared, are the file offset.

use super::zblock::{read_u16, read_u32, read_u64};
use crate::{Result, StorageError};
use std::cmp::Ordering;

const ZCHILD: u64 = 0x1;
const SHARD_SHIFT: u32 = 56;
const OFFSET_MASK: u64 = (1 << SHARD_SHIFT) - 1;

/// Decoded child pointer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Child {
    /// m-block at offset in the m-index file
    MBlock(u64),
    /// z-block at offset in z shard `shard`
    ZBlock { shard: usize, offset: u64 },
}

impl Child {
    pub fn encode(self) -> u64 {
        match self {
            Child::MBlock(offset) => {
                debug_assert!(offset & !OFFSET_MASK == 0 && offset & ZCHILD == 0);
                offset
            }
            Child::ZBlock { shard, offset } => {
                debug_assert!(offset & !OFFSET_MASK == 0 && offset & ZCHILD == 0);
                ((shard as u64) << SHARD_SHIFT) | offset | ZCHILD
            }
        }
    }

    pub fn decode(ptr: u64) -> Self {
        let offset = ptr & OFFSET_MASK & !ZCHILD;
        if ptr & ZCHILD != 0 {
            Child::ZBlock { shard: (ptr >> SHARD_SHIFT) as usize, offset }
        } else {
            Child::MBlock(offset)
        }
    }
}

/// Encoder for one m-block.
pub(crate) struct MBlockBuilder {
    blocksize: usize,
    offsets: Vec<u32>,
    entries: Vec<u8>,
    first_key: Vec<u8>,
}

impl MBlockBuilder {
    pub fn new(blocksize: usize) -> Self {
        Self { blocksize, offsets: Vec::with_capacity(64), entries: Vec::new(), first_key: Vec::new() }
    }

    pub fn is_empty(&self) -> bool {
        self.offsets.is_empty()
    }

    pub fn first_key(&self) -> &[u8] {
        &self.first_key
    }

    /// Append a child, false when the block is full.
    pub fn insert(&mut self, key: &[u8], child: u64) -> Result<bool> {
        let size = 2 + key.len() + 8;
        let footprint = 4 + 4 * (self.offsets.len() + 1) + self.entries.len() + size;
        if footprint > self.blocksize || key.len() > u16::MAX as usize {
            if self.is_empty() {
                return Err(StorageError::EntryExceedsBlockSize { size: 8 + size, blocksize: self.blocksize });
            }
            return Ok(false);
        }
        self.offsets.push(self.entries.len() as u32);
        self.entries.extend_from_slice(&(key.len() as u16).to_be_bytes());
        self.entries.extend_from_slice(key);
        self.entries.extend_from_slice(&child.to_be_bytes());
        if self.first_key.is_empty() {
            self.first_key = key.to_vec();
        }
        Ok(true)
    }

    /// Encode the block, returns the block, its first key and padding.
    pub fn finalize(&mut self) -> (Vec<u8>, Vec<u8>, usize) {
        let header = 4 + 4 * self.offsets.len();
        let mut block = Vec::with_capacity(self.blocksize);
        block.extend_from_slice(&(self.offsets.len() as u32).to_be_bytes());
        for offset in self.offsets.iter() {
            block.extend_from_slice(&(header as u32 + offset).to_be_bytes());
        }
        block.extend_from_slice(&self.entries);
        let padding = self.blocksize - block.len();
        block.resize(self.blocksize, 0);

        let first_key = std::mem::take(&mut self.first_key);
        self.offsets.clear();
        self.entries.clear();
        (block, first_key, padding)
    }
}

fn corrupt(what: &str) -> StorageError {
    StorageError::CorruptSnapshot(format!("mblock {}", what))
}

/// Read-side view over an encoded m-block.
pub(crate) struct MBlockView<'a> {
    buf: &'a [u8],
    count: usize,
}

impl<'a> MBlockView<'a> {
    pub fn new(buf: &'a [u8]) -> Result<Self> {
        let count = read_u32(buf, 0).ok_or_else(|| corrupt("header"))? as usize;
        if count == 0 || 4 + 4 * count > buf.len() {
            return Err(corrupt("bad count"));
        }
        Ok(Self { buf, count })
    }

    pub fn len(&self) -> usize {
        self.count
    }

    pub fn entry(&self, i: usize) -> Result<(&'a [u8], Child)> {
        let at = read_u32(self.buf, 4 + 4 * i).ok_or_else(|| corrupt("index"))? as usize;
        let keylen = read_u16(self.buf, at).ok_or_else(|| corrupt("keylen"))? as usize;
        let key = self.buf.get(at + 2..at + 2 + keylen).ok_or_else(|| corrupt("key"))?;
        let ptr = read_u64(self.buf, at + 2 + keylen).ok_or_else(|| corrupt("child"))?;
        Ok((key, Child::decode(ptr)))
    }

    pub fn child(&self, i: usize) -> Result<Child> {
        self.entry(i).map(|(_, child)| child)
    }

    /// Index of the child whose subtree may hold `key`: the last entry
    /// with a first key at or below `key`, `None` if `key` sorts before
    /// the whole block.
    pub fn floor(&self, key: &[u8]) -> Result<Option<usize>> {
        let (mut lo, mut hi) = (0, self.count);
        while lo < hi {
            let mid = (lo + hi) / 2;
            match self.entry(mid)?.0.cmp(key) {
                Ordering::Greater => hi = mid,
                _ => lo = mid + 1,
            }
        }
        Ok(lo.checked_sub(1))
    }
}
