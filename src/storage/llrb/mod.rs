//! Left-leaning red-black tree memory indexes
//!
//! Two flavours share one copy-on-write tree:
//! - [`Llrb`]: one writer and many readers on a `RwLock`
//! - [`Mvcc`]: one writer, readers on immutable snapshots
//!
//! Keys and node metadata live in a key arena, values in a value arena,
//! see [`crate::storage::malloc`].

mod cow;
mod iter;
#[allow(clippy::module_inception)]
mod llrb;
pub mod metadata;
mod mvcc;
mod node;
mod snapshot;
mod stats;
mod tree;
mod txn;

pub use iter::LlrbIter;
pub use llrb::Llrb;
pub use metadata::{FieldMask, Metadata};
pub use mvcc::Mvcc;
pub use snapshot::LlrbSnapshot;
pub use stats::{ArenaStats, LlrbStats};
pub use tree::UpsertCallback;
pub use txn::{Txn, View};
pub(crate) use txn::{TxnIndex, TxnOp, TxnWrite};
