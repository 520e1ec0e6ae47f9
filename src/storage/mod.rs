//! Storage layer
//!
//! - `malloc`: slab arena backing the memory indexes
//! - `llrb`: in-memory left-leaning red-black trees, locked and MVCC
//! - `bubt`: immutable bottoms-up btree snapshots on disk
//! - `lsm`: the `Bogn` index composing the above into an LSM tree

pub mod bubt;
pub mod llrb;
pub mod lsm;
pub mod malloc;
