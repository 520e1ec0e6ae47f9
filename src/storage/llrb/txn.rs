//! Transactions and read-only views over a tree snapshot
//!
//! A [`Txn`] reads from the snapshot taken when it began and buffers its
//! writes. `commit` hands the buffered writes to the writer, which checks
//! that every written key still carries the seqno the transaction saw and
//! applies them all, or fails with `Rollback` and applies nothing.

use super::iter::LlrbIter;
use super::snapshot::LlrbSnapshot;
use super::stats::TxnCounters;
use crate::types::{Entry, Inclusion};
use crate::Result;
use std::collections::BTreeMap;
use std::sync::atomic::Ordering;
use std::sync::Arc;

#[derive(Debug, Clone)]
pub(crate) enum TxnOp {
    Set(Vec<u8>),
    Delete { lsm: bool },
}

#[derive(Debug, Clone)]
pub(crate) struct TxnWrite {
    pub key: Vec<u8>,
    pub op: TxnOp,
    /// Seqno of `key` when first touched, zero if absent
    pub cas: u64,
}

/// Index that transactions commit into.
pub(crate) trait TxnIndex: Send + Sync {
    fn txn_snapshot(&self) -> Arc<LlrbSnapshot>;
    fn txn_commit(&self, writes: &[TxnWrite]) -> Result<u64>;
    fn txn_counters(&self) -> &TxnCounters;
}

pub struct Txn<'a> {
    id: u64,
    index: &'a dyn TxnIndex,
    snapshot: Arc<LlrbSnapshot>,
    writes: BTreeMap<Vec<u8>, TxnWrite>,
    done: bool,
}

impl<'a> Txn<'a> {
    pub(crate) fn new(id: u64, index: &'a dyn TxnIndex) -> Self {
        index.txn_counters().n_txns.fetch_add(1, Ordering::Relaxed);
        let snapshot = index.txn_snapshot();
        Self { id, index, snapshot, writes: BTreeMap::new(), done: false }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    /// Buffered writes first, then the snapshot. Buffered deletes read as absent.
    pub fn get(&self, key: &[u8]) -> Option<Entry> {
        match self.writes.get(key) {
            Some(TxnWrite { op: TxnOp::Set(value), .. }) => {
                Some(Entry::new(key.to_vec(), value.clone(), 0))
            }
            Some(TxnWrite { op: TxnOp::Delete { .. }, .. }) => None,
            None => self.snapshot.get(key),
        }
    }

    fn cas(&self, key: &[u8]) -> u64 {
        match self.writes.get(key) {
            Some(write) => write.cas,
            None => self.snapshot.get(key).map_or(0, |entry| entry.seqno()),
        }
    }

    pub fn set(&mut self, key: &[u8], value: &[u8]) {
        assert!(!key.is_empty(), "txn {} empty key", self.id);
        let cas = self.cas(key);
        let op = TxnOp::Set(value.to_vec());
        self.writes.insert(key.to_vec(), TxnWrite { key: key.to_vec(), op, cas });
    }

    pub fn delete(&mut self, key: &[u8], lsm: bool) {
        assert!(!key.is_empty(), "txn {} empty key", self.id);
        let cas = self.cas(key);
        let op = TxnOp::Delete { lsm };
        self.writes.insert(key.to_vec(), TxnWrite { key: key.to_vec(), op, cas });
    }

    /// Seqno of the last applied write.
    pub fn commit(mut self) -> Result<u64> {
        self.done = true;
        let writes: Vec<TxnWrite> = std::mem::take(&mut self.writes).into_values().collect();
        let counters = self.index.txn_counters();
        match self.index.txn_commit(&writes) {
            Ok(seqno) => {
                counters.n_commits.fetch_add(1, Ordering::Relaxed);
                Ok(seqno)
            }
            Err(err) => {
                counters.n_aborts.fetch_add(1, Ordering::Relaxed);
                Err(err)
            }
        }
    }

    pub fn abort(mut self) {
        self.done = true;
        self.index.txn_counters().n_aborts.fetch_add(1, Ordering::Relaxed);
    }
}

impl Drop for Txn<'_> {
    fn drop(&mut self) {
        if !self.done {
            self.index.txn_counters().n_aborts.fetch_add(1, Ordering::Relaxed);
        }
    }
}

/// Read-only transaction.
pub struct View {
    id: u64,
    snapshot: Arc<LlrbSnapshot>,
}

impl View {
    pub(crate) fn new(id: u64, snapshot: Arc<LlrbSnapshot>) -> Self {
        Self { id, snapshot }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn get(&self, key: &[u8]) -> Option<Entry> {
        self.snapshot.get(key)
    }

    pub fn range(
        &self,
        low: Option<&[u8]>,
        high: Option<&[u8]>,
        incl: Inclusion,
        reverse: bool,
        callback: &mut dyn FnMut(&Entry) -> bool,
    ) {
        self.snapshot.range(low, high, incl, reverse, callback)
    }

    pub fn iterate(
        &self,
        low: Option<&[u8]>,
        high: Option<&[u8]>,
        incl: Inclusion,
        reverse: bool,
    ) -> LlrbIter {
        self.snapshot.iterate(low, high, incl, reverse)
    }

    /// Views are read-only, writing through one is a bug.
    pub fn set(&self, _key: &[u8], _value: &[u8]) {
        panic!("view {} is read-only", self.id);
    }

    pub fn delete(&self, _key: &[u8], _lsm: bool) {
        panic!("view {} is read-only", self.id);
    }

    pub fn abort(self) {}
}
