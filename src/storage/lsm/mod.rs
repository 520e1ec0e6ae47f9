//! LSM index over memory and disk levels
//!
//! ## Architecture
//! - **mw**: in-memory tree taking every write
//! - **mr**: the previous `mw` while it is being flushed
//! - **mc**: optional cache of entries read off disk
//! - **disks**: up to sixteen bottoms-up btree snapshots, level 0 newest
//!
//! ## Background work
//! - Compactor: persist while everything fits in memory, then flush and
//!   merge disk levels once the index grows past memory
//! - Purger: destroys superseded disk levels once no reader holds them

mod cache;
mod compaction;
mod engine;
mod memindex;
mod merging_iterator;
mod purger;
mod snapshot;
mod txn;

pub use engine::{Bogn, BognStats, DiskStats};
pub use merging_iterator::MergingIterator;
pub use snapshot::{BognIter, NLEVELS};
pub use txn::{BognTxn, BognView};
