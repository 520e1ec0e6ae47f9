//! Memory level of the index, either flavour of LLRB behind one type

use crate::config::{BognConfig, MemStore};
use crate::storage::llrb::{Llrb, LlrbIter, LlrbSnapshot, LlrbStats, Mvcc, TxnIndex, TxnWrite};
use crate::types::{Entry, EntryIter, Inclusion};
use crate::Result;
use std::sync::Arc;

pub(crate) enum MemIndex {
    Llrb(Llrb),
    Mvcc(Mvcc),
}

macro_rules! dispatch {
    ($self:expr, $index:ident => $body:expr) => {
        match $self {
            MemIndex::Llrb($index) => $body,
            MemIndex::Mvcc($index) => $body,
        }
    };
}

impl MemIndex {
    pub fn new(name: &str, config: &BognConfig) -> Result<Self> {
        Ok(match config.memstore {
            MemStore::Llrb => MemIndex::Llrb(Llrb::new(name, config.llrb.clone())?),
            MemStore::Mvcc => MemIndex::Mvcc(Mvcc::new(name, config.llrb.clone())?),
        })
    }

    /// Fresh index continuing the seqno sequence at `seqno`.
    pub fn seeded(name: &str, config: &BognConfig, seqno: u64) -> Result<Self> {
        let index = Self::new(name, config)?;
        index.set_seqno(seqno);
        Ok(index)
    }

    pub fn id(&self) -> &str {
        dispatch!(self, index => index.id())
    }

    pub fn count(&self) -> usize {
        dispatch!(self, index => index.count())
    }

    pub fn footprint(&self) -> usize {
        dispatch!(self, index => index.footprint())
    }

    pub fn get_seqno(&self) -> u64 {
        dispatch!(self, index => index.get_seqno())
    }

    pub fn set_seqno(&self, seqno: u64) {
        dispatch!(self, index => index.set_seqno(seqno))
    }

    pub fn get(&self, key: &[u8]) -> Option<Entry> {
        dispatch!(self, index => index.get(key))
    }

    pub fn set(&self, key: &[u8], value: &[u8]) -> Result<(u64, Option<Entry>)> {
        dispatch!(self, index => index.set(key, value))
    }

    pub fn load(&self, entry: &Entry) -> Result<Option<Entry>> {
        dispatch!(self, index => index.load(entry))
    }

    pub fn delete(&self, key: &[u8], lsm: bool) -> Result<(u64, Option<Entry>)> {
        dispatch!(self, index => index.delete(key, lsm))
    }

    pub fn iterate(
        &self,
        low: Option<&[u8]>,
        high: Option<&[u8]>,
        incl: Inclusion,
        reverse: bool,
    ) -> LlrbIter {
        dispatch!(self, index => index.iterate(low, high, incl, reverse))
    }

    /// Whole index in key order, tombstones included.
    pub fn full_iter(&self) -> EntryIter {
        Box::new(self.iterate(None, None, Inclusion::Both, false))
    }

    pub fn snapshot(&self) -> Arc<LlrbSnapshot> {
        dispatch!(self, index => index.snapshot())
    }

    /// Apply `writes` all or nothing, `cas` values are this index's seqnos.
    pub fn txn_commit(&self, writes: &[TxnWrite]) -> Result<u64> {
        dispatch!(self, index => index.txn_commit(writes))
    }

    pub fn stats(&self) -> LlrbStats {
        dispatch!(self, index => index.stats())
    }

    pub fn validate(&self) -> Result<LlrbStats> {
        dispatch!(self, index => index.validate())
    }

    pub fn log(&self) {
        dispatch!(self, index => index.log())
    }
}

impl std::fmt::Debug for MemIndex {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        dispatch!(self, index => index.fmt(f))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::LlrbConfig;
    use crate::storage::llrb::TxnOp;
    use crate::StorageError;

    fn config(memstore: MemStore) -> BognConfig {
        BognConfig { memstore, llrb: LlrbConfig::small(), ..Default::default() }
    }

    #[test]
    fn test_memindex_flavours() {
        for memstore in [MemStore::Llrb, MemStore::Mvcc] {
            let index = MemIndex::seeded("mem", &config(memstore), 100).unwrap();
            assert_eq!(index.set(b"b", b"2").unwrap().0, 101);
            assert_eq!(index.set(b"a", b"1").unwrap().0, 102);
            index.delete(b"b", true).unwrap();
            assert_eq!(index.get_seqno(), 103);
            assert_eq!(index.count(), 2);
            assert!(index.get(b"b").unwrap().deleted);

            let entries: Vec<Entry> = index.full_iter().map(|r| r.unwrap()).collect();
            assert_eq!(entries.len(), 2);
            assert_eq!(entries[0].key, b"a");
            assert!(index.footprint() > 0);
            index.validate().unwrap();
        }
    }

    #[test]
    fn test_memindex_txn_commit() {
        let index = MemIndex::new("mem", &config(MemStore::Mvcc)).unwrap();
        let (seqno, _) = index.set(b"k", b"v").unwrap();

        let stale = [TxnWrite { key: b"k".to_vec(), op: TxnOp::Set(b"x".to_vec()), cas: seqno - 1 }];
        assert!(matches!(index.txn_commit(&stale), Err(StorageError::Rollback)));

        let fresh = [
            TxnWrite { key: b"k".to_vec(), op: TxnOp::Set(b"x".to_vec()), cas: seqno },
            TxnWrite { key: b"n".to_vec(), op: TxnOp::Set(b"y".to_vec()), cas: 0 },
        ];
        index.txn_commit(&fresh).unwrap();
        assert_eq!(index.get(b"k").unwrap().value, b"x");
        assert_eq!(index.get(b"n").unwrap().value, b"y");
    }
}
