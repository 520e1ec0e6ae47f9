//! MemPool: one contiguous block sliced into equal sized chunks.

use super::freebits::FreeBits;
use parking_lot::Mutex;
use std::ptr::NonNull;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

/// Fixed-size chunk allocator over a single heap block.
///
/// The block never moves for the lifetime of the pool and every chunk is
/// owned by at most one [`Block`] handle, which is what makes handing out
/// shared and exclusive slices from `&self` sound.
pub(crate) struct Pool {
    base: NonNull<u8>,
    size: usize,
    nchunks: usize,
    fbits: Mutex<FreeBits>,
    allocated: AtomicUsize,
}

unsafe impl Send for Pool {}
unsafe impl Sync for Pool {}

impl Pool {
    pub fn new(size: usize, nchunks: usize) -> Self {
        let capacity = size * nchunks;
        let block = vec![0u8; capacity].into_boxed_slice();
        let base = Box::into_raw(block) as *mut u8;
        Self {
            // Box::into_raw never returns null.
            base: NonNull::new(base).unwrap_or(NonNull::dangling()),
            size,
            nchunks,
            fbits: Mutex::new(FreeBits::new(nchunks)),
            allocated: AtomicUsize::new(0),
        }
    }

    pub fn chunk_size(&self) -> usize {
        self.size
    }

    pub fn capacity(&self) -> usize {
        self.size * self.nchunks
    }

    pub fn allocated(&self) -> usize {
        self.allocated.load(Ordering::Relaxed)
    }

    pub fn base_addr(&self) -> usize {
        self.base.as_ptr() as usize
    }

    pub fn overhead(&self) -> usize {
        std::mem::size_of::<Self>() + self.fbits.lock().sizeof()
    }

    pub fn is_full(&self) -> bool {
        self.fbits.lock().free_chunks() == 0
    }

    fn alloc_chunk(&self) -> Option<u32> {
        let nth = self.fbits.lock().alloc()?;
        self.allocated.fetch_add(self.size, Ordering::Relaxed);
        Some(nth as u32)
    }

    fn free_chunk(&self, nth: u32) {
        self.fbits.lock().free(nth as usize);
        self.allocated.fetch_sub(self.size, Ordering::Relaxed);
    }

    fn chunk(&self, nth: u32) -> &[u8] {
        let off = (nth as usize) * self.size;
        debug_assert!(off + self.size <= self.capacity());
        unsafe { std::slice::from_raw_parts(self.base.as_ptr().add(off), self.size) }
    }

    #[allow(clippy::mut_from_ref)]
    fn chunk_mut(&self, nth: u32) -> &mut [u8] {
        let off = (nth as usize) * self.size;
        debug_assert!(off + self.size <= self.capacity());
        unsafe { std::slice::from_raw_parts_mut(self.base.as_ptr().add(off), self.size) }
    }
}

impl Drop for Pool {
    fn drop(&mut self) {
        let capacity = self.capacity();
        unsafe {
            let slice = std::ptr::slice_from_raw_parts_mut(self.base.as_ptr(), capacity);
            drop(Box::from_raw(slice));
        }
    }
}

/// Owned handle to one allocated chunk, freed back to its pool on drop.
pub struct Block {
    pool: Arc<Pool>,
    nth: u32,
    len: u32,
}

impl Block {
    /// Claim a chunk from `pool`, `len` is the usable length.
    pub(crate) fn alloc(pool: &Arc<Pool>, len: usize) -> Option<Block> {
        debug_assert!(len <= pool.chunk_size());
        let nth = pool.alloc_chunk()?;
        let mut block = Block { pool: Arc::clone(pool), nth, len: len as u32 };
        block.as_mut_slice().fill(0);
        Some(block)
    }

    pub fn as_slice(&self) -> &[u8] {
        &self.pool.chunk(self.nth)[..self.len as usize]
    }

    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        let len = self.len as usize;
        &mut self.pool.chunk_mut(self.nth)[..len]
    }

    pub fn len(&self) -> usize {
        self.len as usize
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Size of the chunk backing this block, always `>= len()`.
    pub fn capacity(&self) -> usize {
        self.pool.chunk_size()
    }

    /// Numeric address of the chunk, for diagnostics.
    pub fn addr(&self) -> u64 {
        (self.pool.base_addr() + (self.nth as usize) * self.pool.chunk_size()) as u64
    }
}

impl Drop for Block {
    fn drop(&mut self) {
        self.pool.free_chunk(self.nth);
    }
}

impl std::fmt::Debug for Block {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Block")
            .field("addr", &format_args!("{:#x}", self.addr()))
            .field("len", &self.len)
            .field("capacity", &self.capacity())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pool_blocks() {
        let pool = Arc::new(Pool::new(64, 16));
        let mut blocks = Vec::new();
        for i in 0..16 {
            let mut block = Block::alloc(&pool, 10 + i).unwrap();
            block.as_mut_slice().fill(i as u8);
            blocks.push(block);
        }
        assert!(Block::alloc(&pool, 8).is_none());
        assert!(pool.is_full());
        assert_eq!(pool.allocated(), pool.capacity());

        for (i, block) in blocks.iter().enumerate() {
            assert_eq!(block.len(), 10 + i);
            assert!(block.as_slice().iter().all(|b| *b == i as u8));
        }

        blocks.truncate(4);
        assert_eq!(pool.allocated(), 4 * 64);
        let block = Block::alloc(&pool, 64).unwrap();
        assert!(block.as_slice().iter().all(|b| *b == 0));
    }
}
