//! Memory arena for index nodes and values
//!
//! A pool slices one heap block into equal chunks tracked by a free bitmap,
//! an arena keeps pools per size class. Allocations come back as owned
//! [`Block`] handles that return their chunk on drop.

mod arena;
mod freebits;
mod pool;

pub use arena::{blocksizes, Arena, ALIGNMENT, MEM_UTILIZATION};
pub use pool::Block;
