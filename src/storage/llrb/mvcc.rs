//! Snapshot based memory index
//!
//! ## Concurrency
//! - Writers serialize on the tree mutex and never block readers
//! - Readers always go through the latest snapshot, a fresh one is cut on
//!   demand whenever writes landed since the previous one
//! - Nodes replaced by a write are parked on the reclaim list of the next
//!   snapshot and released when that snapshot is purged
//!
//! ## Purge
//! Snapshots are purged strictly oldest first, and only once nobody but the
//! chain holds them. The newest snapshot is never purged.

use super::iter::{self, LlrbIter};
use super::snapshot::LlrbSnapshot;
use super::stats::{LlrbStats, TxnCounters};
use super::tree::{Tree, UpsertCallback};
use super::txn::{Txn, TxnIndex, TxnWrite, View};
use crate::config::LlrbConfig;
use crate::types::{Entry, EntryIter, Inclusion, Reader};
use crate::Result;
use log::{debug, info};
use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

pub struct Mvcc {
    name: String,
    logprefix: String,
    tree: Mutex<Tree>,
    /// Oldest first, never empty
    snapshots: Mutex<VecDeque<Arc<LlrbSnapshot>>>,
    /// Writes landed since the newest snapshot
    dirty: AtomicBool,
    snapshot_ids: AtomicU64,
    n_purged: AtomicUsize,
    txns: TxnCounters,
}

impl Mvcc {
    pub fn new(name: &str, config: LlrbConfig) -> Result<Self> {
        let logprefix = format!("MVCC [{}]", name);
        let mut tree = Tree::new(name, logprefix.clone(), config, true)?;
        let mut snapshots = VecDeque::new();
        snapshots.push_back(Arc::new(tree.snapshot(0)));
        info!("{} created", logprefix);
        Ok(Self {
            name: name.to_string(),
            logprefix,
            tree: Mutex::new(tree),
            snapshots: Mutex::new(snapshots),
            dirty: AtomicBool::new(false),
            snapshot_ids: AtomicU64::new(0),
            n_purged: AtomicUsize::new(0),
            txns: TxnCounters::default(),
        })
    }

    pub fn id(&self) -> &str {
        &self.name
    }

    pub fn logprefix(&self) -> &str {
        &self.logprefix
    }

    pub fn count(&self) -> usize {
        self.tree.lock().count()
    }

    pub fn footprint(&self) -> usize {
        self.tree.lock().footprint()
    }

    pub fn get_seqno(&self) -> u64 {
        self.tree.lock().seqno
    }

    pub fn set_seqno(&self, seqno: u64) {
        self.tree.lock().seqno = seqno;
        self.dirty.store(true, Ordering::Release);
    }

    pub fn vclock(&self) -> HashMap<u16, (u64, u64)> {
        self.tree.lock().vclock()
    }

    /// Latest snapshot, cutting a new one if writes landed since the last.
    pub fn snapshot(&self) -> Arc<LlrbSnapshot> {
        if self.dirty.load(Ordering::Acquire) {
            // lock order: tree, then snapshots
            let mut tree = self.tree.lock();
            if self.dirty.swap(false, Ordering::AcqRel) {
                let id = self.snapshot_ids.fetch_add(1, Ordering::Relaxed) + 1;
                let snapshot = Arc::new(tree.snapshot(id));
                let mut snapshots = self.snapshots.lock();
                snapshots.push_back(Arc::clone(&snapshot));
                self.purge(&mut snapshots);
                return snapshot;
            }
        }
        let mut snapshots = self.snapshots.lock();
        self.purge(&mut snapshots);
        match snapshots.back() {
            Some(snapshot) => Arc::clone(snapshot),
            None => unreachable!("{} snapshot chain is never empty", self.logprefix),
        }
    }

    fn purge(&self, snapshots: &mut VecDeque<Arc<LlrbSnapshot>>) {
        while snapshots.len() > 1 {
            match snapshots.front() {
                Some(front) if Arc::strong_count(front) == 1 => {
                    if let Some(snapshot) = snapshots.pop_front() {
                        debug!(
                            "{} purged snapshot {} reclaiming {} nodes",
                            self.logprefix,
                            snapshot.id(),
                            snapshot.n_reclaim()
                        );
                    }
                    self.n_purged.fetch_add(1, Ordering::Relaxed);
                }
                _ => break,
            }
        }
    }

    /// Release whatever snapshots readers have let go of.
    pub fn purge_snapshots(&self) -> usize {
        let mut snapshots = self.snapshots.lock();
        let before = snapshots.len();
        self.purge(&mut snapshots);
        before - snapshots.len()
    }

    pub fn get(&self, key: &[u8]) -> Option<Entry> {
        self.snapshot().get(key)
    }

    pub fn min(&self) -> Option<Entry> {
        let snapshot = self.snapshot();
        iter::min(&snapshot.root).map(|node| node.to_entry())
    }

    pub fn max(&self) -> Option<Entry> {
        let snapshot = self.snapshot();
        iter::max(&snapshot.root).map(|node| node.to_entry())
    }

    pub fn range(
        &self,
        low: Option<&[u8]>,
        high: Option<&[u8]>,
        incl: Inclusion,
        reverse: bool,
        callback: &mut dyn FnMut(&Entry) -> bool,
    ) {
        self.snapshot().range(low, high, incl, reverse, callback)
    }

    pub fn iterate(
        &self,
        low: Option<&[u8]>,
        high: Option<&[u8]>,
        incl: Inclusion,
        reverse: bool,
    ) -> LlrbIter {
        self.snapshot().iterate(low, high, incl, reverse)
    }

    /// Run a write under the tree lock and mark the chain stale.
    fn write<T>(&self, op: impl FnOnce(&mut Tree) -> T) -> T {
        let mut tree = self.tree.lock();
        let out = op(&mut tree);
        self.dirty.store(true, Ordering::Release);
        out
    }

    pub fn upsert(
        &self,
        key: &[u8],
        value: &[u8],
        callback: Option<UpsertCallback<'_>>,
    ) -> Result<(Entry, Option<Entry>)> {
        self.write(|tree| tree.upsert(key, value, callback))
    }

    pub fn set(&self, key: &[u8], value: &[u8]) -> Result<(u64, Option<Entry>)> {
        self.write(|tree| tree.set(key, value))
    }

    pub fn load(&self, entry: &Entry) -> Result<Option<Entry>> {
        self.write(|tree| tree.load(entry))
    }

    pub fn set_cas(&self, key: &[u8], value: &[u8], cas: u64) -> Result<(u64, Option<Entry>)> {
        self.write(|tree| tree.set_cas(key, value, cas))
    }

    pub fn delete(&self, key: &[u8], lsm: bool) -> Result<(u64, Option<Entry>)> {
        self.write(|tree| tree.delete(key, lsm))
    }

    pub fn delete_min(&self) -> Option<Entry> {
        self.write(|tree| tree.delete_min())
    }

    pub fn delete_max(&self) -> Option<Entry> {
        self.write(|tree| tree.delete_max())
    }

    pub fn begin_txn(&self, id: u64) -> Txn<'_> {
        Txn::new(id, self)
    }

    pub fn view(&self, id: u64) -> View {
        View::new(id, self.snapshot())
    }

    pub fn stats(&self) -> LlrbStats {
        let mut stats = self.tree.lock().stats();
        stats.n_snapshots = self.snapshot_ids.load(Ordering::Relaxed) as usize;
        stats.n_purgedss = self.n_purged.load(Ordering::Relaxed);
        stats.n_activess = self.snapshots.lock().len();
        self.txns.fill(&mut stats);
        stats
    }

    pub fn log(&self) {
        let stats = self.stats();
        info!(
            "{} count:{} seqno:{} keymem:{} valmem:{} clones:{} reclaims:{}",
            self.logprefix,
            stats.n_count,
            stats.seqno,
            stats.keymemory,
            stats.valmemory,
            stats.n_clones,
            stats.n_reclaims
        );
        info!(
            "{} snapshots:{} purged:{} active:{}",
            self.logprefix, stats.n_snapshots, stats.n_purgedss, stats.n_activess
        );
    }

    pub fn validate(&self) -> Result<LlrbStats> {
        self.tree.lock().validate()?;
        Ok(self.stats())
    }
}

impl Reader for Mvcc {
    fn get(&self, key: &[u8]) -> Result<Option<Entry>> {
        Ok(Mvcc::get(self, key))
    }

    fn iterate(
        &self,
        low: Option<&[u8]>,
        high: Option<&[u8]>,
        incl: Inclusion,
        reverse: bool,
    ) -> Result<EntryIter> {
        Ok(Box::new(Mvcc::iterate(self, low, high, incl, reverse)))
    }
}

impl TxnIndex for Mvcc {
    fn txn_snapshot(&self) -> Arc<LlrbSnapshot> {
        self.snapshot()
    }

    fn txn_commit(&self, writes: &[TxnWrite]) -> Result<u64> {
        self.write(|tree| tree.commit(writes))
    }

    fn txn_counters(&self) -> &TxnCounters {
        &self.txns
    }
}

impl std::fmt::Debug for Mvcc {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Mvcc").field("name", &self.name).field("count", &self.count()).finish()
    }
}
