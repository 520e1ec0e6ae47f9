//! Size-classed arena over fixed-chunk pools
//!
//! ## Size classes
//! Classes start at `min_block`. The class after `from` is the largest
//! `size = from + k * addby`, `k >= 1`, whose average utilization
//! `(from + size) / 2 / size` stays at or above 95%, where `addby` is
//! `from * 0.05` rounded up to a multiple of 32 (never less than 32). The
//! last class is always `max_block`.
//!
//! ## Accounting
//! `memory()` is the fixed capacity, `allocated()` the bytes held by live
//! blocks and `available()` the rest, so `allocated() + available() ==
//! memory()` at every point.
//!
//! ## Overdraft
//! Copy-on-write clones of existing tree nodes go through
//! [`Arena::alloc_overdraft`], which may grow the heap past capacity. Those
//! copies are transient and return to the pools once the snapshots pinning
//! the originals are purged. While overdrawn, `memory()` reports the heap.

use super::pool::{Block, Pool};
use crate::config::ArenaConfig;
use crate::{Result, StorageError};
use parking_lot::Mutex;
use std::sync::Arc;

/// Target chunk utilization driving the size-class growth.
pub const MEM_UTILIZATION: f64 = 0.95;

/// Size class alignment.
pub const ALIGNMENT: usize = 32;

/// Compute the size classes between `minblock` and `maxblock`, inclusive.
pub fn blocksizes(minblock: usize, maxblock: usize) -> Vec<usize> {
    let mut sizes = Vec::new();
    let mut from = minblock;
    while from < maxblock {
        sizes.push(from);
        from = next_blocksize(from);
    }
    sizes.push(maxblock);
    sizes
}

fn size_step(from: usize) -> usize {
    let addby = (from as f64 * (1.0 - MEM_UTILIZATION)) as usize;
    if addby <= ALIGNMENT {
        ALIGNMENT
    } else if addby % ALIGNMENT != 0 {
        addby + (ALIGNMENT - addby % ALIGNMENT)
    } else {
        addby
    }
}

fn next_blocksize(from: usize) -> usize {
    let addby = size_step(from);
    let mut size = from + addby;
    while average_utilization(from, size + addby) >= MEM_UTILIZATION {
        size += addby;
    }
    size
}

/// Expected fill of a `size` chunk holding requests spread over `from..size`.
fn average_utilization(from: usize, size: usize) -> f64 {
    (from + size) as f64 / 2.0 / size as f64
}

struct Slabs {
    /// Per size class, pools sorted by base address
    pools: Vec<Vec<Arc<Pool>>>,
    heap: usize,
}

/// Memory arena handing out [`Block`]s from size-classed pools.
pub struct Arena {
    config: ArenaConfig,
    sizes: Vec<usize>,
    slabs: Mutex<Slabs>,
}

impl Arena {
    pub fn new(config: ArenaConfig) -> Result<Self> {
        config.validate()?;
        if config.min_block % ALIGNMENT != 0 || config.max_block % ALIGNMENT != 0 {
            return Err(StorageError::InvalidConfig(format!(
                "arena block sizes {}/{} not aligned to {}",
                config.min_block, config.max_block, ALIGNMENT
            )));
        }
        let sizes = blocksizes(config.min_block, config.max_block);
        let pools = sizes.iter().map(|_| Vec::new()).collect();
        Ok(Self { config, sizes, slabs: Mutex::new(Slabs { pools, heap: 0 }) })
    }

    /// Allocate a block of exactly `n` usable bytes.
    pub fn alloc(&self, n: usize) -> Result<Block> {
        self.alloc_block(n, false)
    }

    /// Allocate ignoring capacity, `n` must fit the largest size class.
    pub fn alloc_overdraft(&self, n: usize) -> Block {
        match self.alloc_block(n, true) {
            Ok(block) => block,
            Err(err) => panic!("overdraft allocation of {} failed: {}", n, err),
        }
    }

    fn alloc_block(&self, n: usize, overdraft: bool) -> Result<Block> {
        let largest = self.sizes[self.sizes.len() - 1];
        if n > largest {
            return Err(StorageError::AllocTooLarge { size: n, max: largest });
        }
        let class = self.sizes.partition_point(|size| *size < n);
        let size = self.sizes[class];

        let mut slabs = self.slabs.lock();
        for pool in slabs.pools[class].iter() {
            if let Some(block) = Block::alloc(pool, n) {
                return Ok(block);
            }
        }

        let nchunks = self.pool_chunks(size, slabs.heap, overdraft)?;
        let pool = Arc::new(Pool::new(size, nchunks));
        slabs.heap += pool.capacity();
        let block = Block::alloc(&pool, n).ok_or_else(|| {
            StorageError::OutOfMemory(format!("fresh pool of {} exhausted", size))
        })?;
        let pools = &mut slabs.pools[class];
        let at = pools.partition_point(|p| p.base_addr() < pool.base_addr());
        pools.insert(at, pool);
        Ok(block)
    }

    /// Chunks for a new pool of `size`, shrunk towards 8 to stay within capacity.
    fn pool_chunks(&self, size: usize, heap: usize, overdraft: bool) -> Result<usize> {
        let mut nchunks = (self.config.pool_capacity / size).min(self.config.max_chunks);
        nchunks = (nchunks / 8) * 8;
        if nchunks < 8 {
            nchunks = 8;
        }
        if overdraft {
            return Ok(nchunks);
        }
        let room = self.config.capacity.saturating_sub(heap);
        if nchunks * size > room {
            nchunks = ((room / size) / 8) * 8;
        }
        if nchunks < 8 {
            return Err(StorageError::OutOfMemory(format!(
                "arena capacity {} exhausted, heap {} class {}",
                self.config.capacity, heap, size
            )));
        }
        Ok(nchunks)
    }

    /// Capacity of this arena, or the heap while overdrawn.
    pub fn memory(&self) -> usize {
        self.config.capacity.max(self.heap())
    }

    pub fn capacity(&self) -> usize {
        self.config.capacity
    }

    /// Bytes held by live blocks, counted at chunk size.
    pub fn allocated(&self) -> usize {
        let slabs = self.slabs.lock();
        slabs.pools.iter().flatten().map(|pool| pool.allocated()).sum()
    }

    pub fn available(&self) -> usize {
        let slabs = self.slabs.lock();
        let allocated: usize = slabs.pools.iter().flatten().map(|pool| pool.allocated()).sum();
        self.config.capacity.max(slabs.heap) - allocated
    }

    /// Bytes reserved by pools.
    pub fn heap(&self) -> usize {
        self.slabs.lock().heap
    }

    /// Book-keeping bytes, excluding the chunks themselves.
    pub fn overhead(&self) -> usize {
        let slabs = self.slabs.lock();
        let pools: usize = slabs.pools.iter().flatten().map(|pool| pool.overhead()).sum();
        std::mem::size_of::<Self>() + self.sizes.len() * 8 + pools
    }

    /// Ratio of allocated bytes to reserved heap, 1.0 on an empty arena.
    pub fn utilization(&self) -> f64 {
        let slabs = self.slabs.lock();
        if slabs.heap == 0 {
            return 1.0;
        }
        let allocated: usize = slabs.pools.iter().flatten().map(|pool| pool.allocated()).sum();
        allocated as f64 / slabs.heap as f64
    }

    /// Per size class `(size, pools, allocated bytes)`, only classes with pools.
    pub fn slabs(&self) -> Vec<(usize, usize, usize)> {
        let slabs = self.slabs.lock();
        self.sizes
            .iter()
            .zip(slabs.pools.iter())
            .filter(|(_, pools)| !pools.is_empty())
            .map(|(size, pools)| {
                (*size, pools.len(), pools.iter().map(|p| p.allocated()).sum())
            })
            .collect()
    }

    pub fn blocksizes(&self) -> &[usize] {
        &self.sizes
    }

    /// Size class serving an allocation of `n` bytes.
    pub fn chunk_size(&self, n: usize) -> Option<usize> {
        let class = self.sizes.partition_point(|size| *size < n);
        self.sizes.get(class).copied()
    }

    /// Drop pools with no live blocks.
    pub fn release_free_pools(&self) -> usize {
        let mut slabs = self.slabs.lock();
        let mut released = 0;
        for pools in slabs.pools.iter_mut() {
            pools.retain(|pool| {
                // A pool is only referenced by the arena and its blocks.
                let unused = pool.allocated() == 0 && Arc::strong_count(pool) == 1;
                if unused {
                    released += pool.capacity();
                }
                !unused
            });
        }
        slabs.heap -= released;
        released
    }
}

impl std::fmt::Debug for Arena {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Arena")
            .field("memory", &self.memory())
            .field("heap", &self.heap())
            .field("allocated", &self.allocated())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::{Rng, SeedableRng};

    fn small_arena() -> Arena {
        Arena::new(ArenaConfig {
            capacity: 16 * 1024 * 1024,
            min_block: 32,
            max_block: 64 * 1024,
            pool_capacity: 128 * 1024,
            max_chunks: 1024,
        })
        .unwrap()
    }

    #[test]
    fn test_blocksizes() {
        let sizes = blocksizes(32, 1024 * 1024);
        assert_eq!(sizes[0], 32);
        assert_eq!(sizes[1], 64);
        assert_eq!(*sizes.last().unwrap(), 1024 * 1024);
        for pair in sizes.windows(2) {
            assert!(pair[0] < pair[1]);
            assert_eq!(pair[0] % ALIGNMENT, 0);
            let addby = pair[1] - pair[0];
            // the last class is clamped to max_block
            if pair[1] != 1024 * 1024 {
                assert!(addby >= ALIGNMENT);
                assert!(addby as f64 >= pair[0] as f64 * (1.0 - MEM_UTILIZATION));
            }
        }
    }

    #[test]
    fn test_next_blocksize_keeps_utilization() {
        assert_eq!(next_blocksize(32), 64);
        assert_eq!(next_blocksize(1024), 1088);
        assert!(average_utilization(1024, 1152) < MEM_UTILIZATION);
        // addby 1024, a second step still averages above 95%
        assert_eq!(next_blocksize(20000), 22048);
        assert!(average_utilization(20000, 22048) >= MEM_UTILIZATION);

        for from in (32..64 * 1024).step_by(ALIGNMENT * 7) {
            let next = next_blocksize(from);
            assert_eq!(next % ALIGNMENT, 0);
            assert!(next > from);
            let addby = size_step(from);
            // one more step would drop below the target, unless it is the first
            assert!(next == from + addby || average_utilization(from, next) >= MEM_UTILIZATION);
            assert!(average_utilization(from, next + addby) < MEM_UTILIZATION);
        }
    }

    #[test]
    fn test_alloc_rounds_to_class() {
        let arena = small_arena();
        let block = arena.alloc(33).unwrap();
        assert_eq!(block.len(), 33);
        assert_eq!(block.capacity(), 64);
        assert_eq!(arena.chunk_size(33), Some(64));
        assert_eq!(arena.allocated(), 64);
        drop(block);
        assert_eq!(arena.allocated(), 0);
    }

    #[test]
    fn test_alloc_too_large() {
        let arena = small_arena();
        match arena.alloc(64 * 1024 + 1) {
            Err(StorageError::AllocTooLarge { size, max }) => {
                assert_eq!(size, 64 * 1024 + 1);
                assert_eq!(max, 64 * 1024);
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_out_of_memory() {
        let arena = Arena::new(ArenaConfig {
            capacity: 512 * 1024,
            min_block: 32,
            max_block: 64 * 1024,
            pool_capacity: 512 * 1024,
            max_chunks: 8,
        })
        .unwrap();

        let mut blocks = Vec::new();
        let err = loop {
            match arena.alloc(64 * 1024) {
                Ok(block) => blocks.push(block),
                Err(err) => break err,
            }
        };
        assert!(matches!(err, StorageError::OutOfMemory(_)));
        assert_eq!(blocks.len(), 8);
        assert!(arena.heap() <= arena.memory());

        let extra = arena.alloc_overdraft(64 * 1024);
        assert!(arena.heap() > arena.capacity());
        assert_eq!(arena.memory(), arena.heap());
        assert_eq!(arena.allocated() + arena.available(), arena.memory());
        drop(extra);
        drop(blocks);
        assert_eq!(arena.allocated(), 0);
    }

    #[test]
    fn test_pools_sorted_by_address() {
        let arena = small_arena();
        let blocks: Vec<Block> = (0..3000).map(|_| arena.alloc(100).unwrap()).collect();
        let slabs = arena.slabs.lock();
        for pools in slabs.pools.iter() {
            for pair in pools.windows(2) {
                assert!(pair[0].base_addr() < pair[1].base_addr());
            }
        }
        drop(slabs);
        drop(blocks);
        assert!(arena.release_free_pools() > 0);
        assert_eq!(arena.heap(), 0);
    }

    #[test]
    fn test_accounting_random() {
        let arena = small_arena();
        let mut rng = rand::rngs::StdRng::seed_from_u64(0x5eed);
        let mut live: Vec<Block> = Vec::new();

        for _ in 0..20_000 {
            if live.is_empty() || rng.gen_bool(0.5) {
                let n = rng.gen_range(1..=2048);
                let mut block = arena.alloc(n).unwrap();
                block.as_mut_slice()[0] = (n & 0xff) as u8;
                live.push(block);
            } else {
                let i = rng.gen_range(0..live.len());
                let block = live.swap_remove(i);
                assert_eq!(block.as_slice()[0], (block.len() & 0xff) as u8);
            }
            assert_eq!(arena.allocated() + arena.available(), arena.memory());
        }
        assert!(arena.utilization() > 0.0);
        live.clear();
        assert_eq!(arena.allocated(), 0);
        assert_eq!(arena.available(), arena.memory());
    }
}
