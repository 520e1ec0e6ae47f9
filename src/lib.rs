//! Bogn Storage Engine
//!
//! Embeddable key-value store pairing in-memory sorted indexes with
//! immutable on-disk btrees, tied together by an LSM style compactor.
//!
//! ## Architecture
//! - Memory: arena allocated LLRB trees, lock based (`Llrb`) or snapshot
//!   based (`Mvcc`), with bit-packed node metadata
//! - Disk: bottoms-up built btrees (`bubt`) with sharded leaf files and an
//!   optional value log
//! - Coordinator: `Bogn` keeps a chain of memory and disk levels, flushing
//!   and compacting them in the background
//!
//! ## Example
//! ```no_run
//! use bogn::{Bogn, BognConfig};
//!
//! let config = BognConfig::with_paths(vec!["/tmp/bogn".into()]);
//! let index = Bogn::new("users", config)?;
//! index.set(b"alice", b"admin")?;
//! assert_eq!(index.get(b"alice")?.unwrap().value, b"admin");
//! index.close()?;
//! # Ok::<(), bogn::StorageError>(())
//! ```

pub mod config;
pub mod storage;
pub mod types;

mod error;

pub use config::{ArenaConfig, BognConfig, BubtConfig, CompactPolicy, DiskStore, LlrbConfig, MemStore};
pub use error::{Result, StorageError};
pub use storage::bubt::{BuildStats, Builder, Snapshot as BubtSnapshot};
pub use storage::llrb::{Llrb, LlrbSnapshot, LlrbStats, Mvcc, Txn, View};
pub use storage::lsm::{Bogn, BognIter, BognStats, BognTxn, BognView, DiskStats, NLEVELS};
pub use types::{Entry, EntryIter, Inclusion, KeyRange, Reader};
