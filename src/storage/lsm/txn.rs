//! Transactions and read-only views across every level of the index
//!
//! Both read from a [`HeadView`] frozen when they began. A transaction
//! buffers its writes along with the seqno each key carried in that view;
//! commit re-reads those keys through the current head under the writer
//! lock and either applies every write to `mw` or fails with `Rollback`.

use super::engine::Shared;
use super::snapshot::{BognIter, HeadView};
use crate::storage::llrb::{TxnOp, TxnWrite};
use crate::types::{Entry, Inclusion, KeyRange};
use crate::Result;
use std::collections::BTreeMap;
use std::sync::atomic::Ordering;

pub struct BognTxn<'a> {
    id: u64,
    shared: &'a Shared,
    view: HeadView,
    writes: BTreeMap<Vec<u8>, TxnWrite>,
    done: bool,
}

impl<'a> BognTxn<'a> {
    pub(crate) fn new(id: u64, shared: &'a Shared) -> Self {
        shared.counters.n_txns.fetch_add(1, Ordering::Relaxed);
        let view = HeadView::new(shared.head());
        Self { id, shared, view, writes: BTreeMap::new(), done: false }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    /// Buffered writes first, then the view. Buffered deletes read as absent.
    pub fn get(&self, key: &[u8]) -> Result<Option<Entry>> {
        match self.writes.get(key) {
            Some(TxnWrite { op: TxnOp::Set(value), .. }) => Ok(Some(Entry::new(key.to_vec(), value.clone(), 0))),
            Some(TxnWrite { op: TxnOp::Delete { .. }, .. }) => Ok(None),
            None => self.view.get(key),
        }
    }

    fn cas(&self, key: &[u8]) -> Result<u64> {
        match self.writes.get(key) {
            Some(write) => Ok(write.cas),
            None => Ok(self.view.get(key)?.map_or(0, |entry| entry.seqno())),
        }
    }

    pub fn set(&mut self, key: &[u8], value: &[u8]) -> Result<()> {
        assert!(!key.is_empty(), "txn {} empty key", self.id);
        let cas = self.cas(key)?;
        let op = TxnOp::Set(value.to_vec());
        self.writes.insert(key.to_vec(), TxnWrite { key: key.to_vec(), op, cas });
        Ok(())
    }

    pub fn delete(&mut self, key: &[u8]) -> Result<()> {
        assert!(!key.is_empty(), "txn {} empty key", self.id);
        let cas = self.cas(key)?;
        let op = TxnOp::Delete { lsm: self.shared.lsm_deletes() };
        self.writes.insert(key.to_vec(), TxnWrite { key: key.to_vec(), op, cas });
        Ok(())
    }

    /// Seqno of the last applied write.
    pub fn commit(mut self) -> Result<u64> {
        self.done = true;
        let writes: Vec<TxnWrite> = std::mem::take(&mut self.writes).into_values().collect();
        let counters = &self.shared.counters;
        match self.shared.commit(writes) {
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
        self.shared.counters.n_aborts.fetch_add(1, Ordering::Relaxed);
    }
}

impl Drop for BognTxn<'_> {
    fn drop(&mut self) {
        if !self.done {
            self.shared.counters.n_aborts.fetch_add(1, Ordering::Relaxed);
        }
    }
}

/// Read-only transaction over every level.
pub struct BognView {
    id: u64,
    view: HeadView,
}

impl BognView {
    pub(crate) fn new(id: u64, shared: &Shared) -> Self {
        Self { id, view: HeadView::new(shared.head()) }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    /// Newest version as of the view, tombstones included.
    pub fn get(&self, key: &[u8]) -> Result<Option<Entry>> {
        self.view.get(key)
    }

    /// Live entries in range.
    pub fn scan(&self, low: Option<&[u8]>, high: Option<&[u8]>, incl: Inclusion, reverse: bool) -> BognIter {
        self.view.iterate(KeyRange::new(low, high, incl), reverse, true)
    }

    pub fn set(&self, _key: &[u8], _value: &[u8]) {
        panic!("view {} is read-only", self.id);
    }

    pub fn delete(&self, _key: &[u8]) {
        panic!("view {} is read-only", self.id);
    }

    pub fn abort(self) {}
}
