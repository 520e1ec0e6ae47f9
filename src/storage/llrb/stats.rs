//! Counters reported by `Llrb::stats` and `Mvcc::stats`

use crate::storage::malloc::Arena;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicUsize, Ordering};

/// Arena accounting snapshot
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ArenaStats {
    pub capacity: usize,
    pub memory: usize,
    pub heap: usize,
    pub allocated: usize,
    pub available: usize,
    pub overhead: usize,
    /// allocated / heap, 1.0 for an empty arena
    pub utilization: f64,
}

impl ArenaStats {
    pub fn from_arena(arena: &Arena) -> Self {
        Self {
            capacity: arena.capacity(),
            memory: arena.memory(),
            heap: arena.heap(),
            allocated: arena.allocated(),
            available: arena.available(),
            overhead: arena.overhead(),
            utilization: arena.utilization(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LlrbStats {
    pub name: String,
    pub seqno: u64,

    /// Entries in the tree, tombstones included
    pub n_count: usize,
    pub n_inserts: usize,
    pub n_updates: usize,
    pub n_deletes: usize,

    /// Nodes allocated for writes
    pub n_nodes: usize,
    /// Nodes released without passing through a snapshot
    pub n_frees: usize,
    /// Copy-on-write clones
    pub n_clones: usize,
    /// Nodes queued for release with a snapshot
    pub n_reclaims: usize,

    pub n_snapshots: usize,
    pub n_purgedss: usize,
    pub n_activess: usize,

    pub n_txns: usize,
    pub n_commits: usize,
    pub n_aborts: usize,

    pub keymemory: usize,
    pub valmemory: usize,
    pub keyarena: ArenaStats,
    pub valarena: ArenaStats,
}

/// Read-side counters kept outside the writer lock.
#[derive(Debug, Default)]
pub(crate) struct TxnCounters {
    pub n_txns: AtomicUsize,
    pub n_commits: AtomicUsize,
    pub n_aborts: AtomicUsize,
}

impl TxnCounters {
    pub fn fill(&self, stats: &mut LlrbStats) {
        stats.n_txns = self.n_txns.load(Ordering::Relaxed);
        stats.n_commits = self.n_commits.load(Ordering::Relaxed);
        stats.n_aborts = self.n_aborts.load(Ordering::Relaxed);
    }
}
