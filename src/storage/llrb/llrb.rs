//! Lock based memory index
//!
//! ## Concurrency
//! - One writer at a time behind a `RwLock`, readers share the read side
//! - Iterators clone the root under the read lock and then walk without any
//!   lock, writers clone whatever node an iterator still holds
//! - Replaced nodes are released as soon as no reader holds them

use super::iter::{self, LlrbIter};
use super::snapshot::LlrbSnapshot;
use super::stats::{LlrbStats, TxnCounters};
use super::tree::{Tree, UpsertCallback};
use super::txn::{Txn, TxnIndex, TxnWrite, View};
use crate::config::LlrbConfig;
use crate::types::{Entry, EntryIter, Inclusion, KeyRange, Reader};
use crate::Result;
use log::info;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

pub struct Llrb {
    name: String,
    logprefix: String,
    tree: RwLock<Tree>,
    snapshot_ids: AtomicU64,
    txns: TxnCounters,
}

impl Llrb {
    pub fn new(name: &str, config: LlrbConfig) -> Result<Self> {
        let logprefix = format!("LLRB [{}]", name);
        let tree = Tree::new(name, logprefix.clone(), config, false)?;
        info!("{} created", logprefix);
        Ok(Self {
            name: name.to_string(),
            logprefix,
            tree: RwLock::new(tree),
            snapshot_ids: AtomicU64::new(0),
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
        self.tree.read().count()
    }

    /// Bytes held in the key and value arenas.
    pub fn footprint(&self) -> usize {
        self.tree.read().footprint()
    }

    pub fn get_seqno(&self) -> u64 {
        self.tree.read().seqno
    }

    /// Seed the seqno, typically from the index this one replaces.
    pub fn set_seqno(&self, seqno: u64) {
        self.tree.write().seqno = seqno;
    }

    pub fn vclock(&self) -> HashMap<u16, (u64, u64)> {
        self.tree.read().vclock()
    }

    pub fn get(&self, key: &[u8]) -> Option<Entry> {
        self.tree.read().get(key)
    }

    pub fn min(&self) -> Option<Entry> {
        iter::min(&self.tree.read().root).map(|node| node.to_entry())
    }

    pub fn max(&self) -> Option<Entry> {
        iter::max(&self.tree.read().root).map(|node| node.to_entry())
    }

    /// Walk the range under the read lock.
    pub fn range(
        &self,
        low: Option<&[u8]>,
        high: Option<&[u8]>,
        incl: Inclusion,
        reverse: bool,
        callback: &mut dyn FnMut(&Entry) -> bool,
    ) {
        let range = KeyRange::new(low, high, incl);
        let tree = self.tree.read();
        iter::range_walk(&tree.root, &range, reverse, &mut |node| callback(&node.to_entry()));
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

    /// Point-in-time view of the current root.
    pub fn snapshot(&self) -> Arc<LlrbSnapshot> {
        let id = self.snapshot_ids.fetch_add(1, Ordering::Relaxed) + 1;
        Arc::new(self.tree.write().snapshot(id))
    }

    pub fn upsert(
        &self,
        key: &[u8],
        value: &[u8],
        callback: Option<UpsertCallback<'_>>,
    ) -> Result<(Entry, Option<Entry>)> {
        self.tree.write().upsert(key, value, callback)
    }

    /// Returns the seqno of this write and the entry it replaced.
    pub fn set(&self, key: &[u8], value: &[u8]) -> Result<(u64, Option<Entry>)> {
        self.tree.write().set(key, value)
    }

    /// Insert an entry keeping its own seqnos, see `Tree::load`.
    pub fn load(&self, entry: &Entry) -> Result<Option<Entry>> {
        self.tree.write().load(entry)
    }

    pub fn set_cas(&self, key: &[u8], value: &[u8], cas: u64) -> Result<(u64, Option<Entry>)> {
        self.tree.write().set_cas(key, value, cas)
    }

    pub fn delete(&self, key: &[u8], lsm: bool) -> Result<(u64, Option<Entry>)> {
        self.tree.write().delete(key, lsm)
    }

    pub fn delete_min(&self) -> Option<Entry> {
        self.tree.write().delete_min()
    }

    pub fn delete_max(&self) -> Option<Entry> {
        self.tree.write().delete_max()
    }

    pub fn begin_txn(&self, id: u64) -> Txn<'_> {
        Txn::new(id, self)
    }

    pub fn view(&self, id: u64) -> View {
        View::new(id, self.snapshot())
    }

    pub fn stats(&self) -> LlrbStats {
        let mut stats = self.tree.read().stats();
        stats.n_snapshots = self.snapshot_ids.load(Ordering::Relaxed) as usize;
        self.txns.fill(&mut stats);
        stats
    }

    pub fn log(&self) {
        let stats = self.stats();
        info!(
            "{} count:{} seqno:{} keymem:{} valmem:{} inserts:{} updates:{} deletes:{}",
            self.logprefix,
            stats.n_count,
            stats.seqno,
            stats.keymemory,
            stats.valmemory,
            stats.n_inserts,
            stats.n_updates,
            stats.n_deletes
        );
        info!(
            "{} keyarena heap:{} allocated:{} utilization:{:.2}",
            self.logprefix, stats.keyarena.heap, stats.keyarena.allocated, stats.keyarena.utilization
        );
        info!(
            "{} valarena heap:{} allocated:{} utilization:{:.2}",
            self.logprefix, stats.valarena.heap, stats.valarena.allocated, stats.valarena.utilization
        );
    }

    pub fn validate(&self) -> Result<LlrbStats> {
        self.tree.read().validate()?;
        Ok(self.stats())
    }
}

impl Reader for Llrb {
    fn get(&self, key: &[u8]) -> Result<Option<Entry>> {
        Ok(Llrb::get(self, key))
    }

    fn iterate(
        &self,
        low: Option<&[u8]>,
        high: Option<&[u8]>,
        incl: Inclusion,
        reverse: bool,
    ) -> Result<EntryIter> {
        Ok(Box::new(Llrb::iterate(self, low, high, incl, reverse)))
    }
}

impl TxnIndex for Llrb {
    fn txn_snapshot(&self) -> Arc<LlrbSnapshot> {
        self.snapshot()
    }

    fn txn_commit(&self, writes: &[TxnWrite]) -> Result<u64> {
        self.tree.write().commit(writes)
    }

    fn txn_counters(&self) -> &TxnCounters {
        &self.txns
    }
}

impl std::fmt::Debug for Llrb {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Llrb").field("name", &self.name).field("count", &self.count()).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::llrb::metadata::Metadata;
    use crate::StorageError;
    use rand::{Rng, SeedableRng};
    use std::collections::BTreeMap;

    fn new_llrb(name: &str) -> Llrb {
        Llrb::new(name, LlrbConfig::small()).unwrap()
    }

    fn keys(entries: &[Entry]) -> Vec<Vec<u8>> {
        entries.iter().map(|e| e.key.clone()).collect()
    }

    #[test]
    fn test_llrb_crud() {
        let llrb = new_llrb("crud");
        assert!(llrb.get(b"a").is_none());

        let (seqno, old) = llrb.set(b"a", b"1").unwrap();
        assert_eq!(seqno, 1);
        assert!(old.is_none());
        let (seqno, old) = llrb.set(b"a", b"2").unwrap();
        assert_eq!(seqno, 2);
        assert_eq!(old.unwrap().value, b"1");

        let entry = llrb.get(b"a").unwrap();
        assert_eq!(entry.value, b"2");
        assert_eq!(entry.seqno(), 2);
        assert_eq!(llrb.count(), 1);

        let (_, old) = llrb.delete(b"a", false).unwrap();
        assert_eq!(old.unwrap().value, b"2");
        assert!(llrb.get(b"a").is_none());
        assert_eq!(llrb.count(), 0);
        llrb.validate().unwrap();
    }

    #[test]
    fn test_llrb_random_against_btree() {
        let llrb = new_llrb("random");
        let mut model: BTreeMap<Vec<u8>, Vec<u8>> = BTreeMap::new();
        let mut rng = rand::rngs::StdRng::seed_from_u64(42);

        for i in 0..5000 {
            let key = format!("key{:05}", rng.gen_range(0..1500)).into_bytes();
            match rng.gen_range(0..10) {
                0..=6 => {
                    let value = format!("val{}", i).into_bytes();
                    llrb.set(&key, &value).unwrap();
                    model.insert(key, value);
                }
                7 => {
                    llrb.delete_min();
                    let first = model.keys().next().cloned();
                    if let Some(first) = first {
                        model.remove(&first);
                    }
                }
                8 => {
                    llrb.delete_max();
                    let last = model.keys().next_back().cloned();
                    if let Some(last) = last {
                        model.remove(&last);
                    }
                }
                _ => {
                    llrb.delete(&key, false).unwrap();
                    model.remove(&key);
                }
            }
            if i % 500 == 0 {
                llrb.validate().unwrap();
            }
        }
        llrb.validate().unwrap();
        assert_eq!(llrb.count(), model.len());

        let entries: Vec<Entry> = llrb.iterate(None, None, Inclusion::Both, false).map(|e| e.unwrap()).collect();
        let expected: Vec<(Vec<u8>, Vec<u8>)> = model.into_iter().collect();
        assert_eq!(entries.len(), expected.len());
        for (entry, (key, value)) in entries.iter().zip(expected.iter()) {
            assert_eq!(&entry.key, key);
            assert_eq!(&entry.value, value);
        }
    }

    #[test]
    fn test_llrb_range_inclusions() {
        let llrb = new_llrb("range");
        for i in 0..100u32 {
            llrb.set(format!("{:03}", i).as_bytes(), b"v").unwrap();
        }
        let low: &[u8] = b"010";
        let high: &[u8] = b"020";
        let cases = [
            (Inclusion::None, 9),
            (Inclusion::Low, 10),
            (Inclusion::High, 10),
            (Inclusion::Both, 11),
        ];
        for (incl, n) in cases {
            for reverse in [false, true] {
                let mut seen = Vec::new();
                llrb.range(Some(low), Some(high), incl, reverse, &mut |e| {
                    seen.push(e.clone());
                    true
                });
                assert_eq!(seen.len(), n, "{:?} reverse:{}", incl, reverse);

                let iterated: Vec<Entry> =
                    llrb.iterate(Some(low), Some(high), incl, reverse).map(|e| e.unwrap()).collect();
                assert_eq!(keys(&seen), keys(&iterated));

                let mut sorted = keys(&seen);
                sorted.sort();
                if reverse {
                    sorted.reverse();
                }
                assert_eq!(keys(&seen), sorted);
            }
        }

        let mut count = 0;
        llrb.range(None, None, Inclusion::Both, false, &mut |_| {
            count += 1;
            count < 5
        });
        assert_eq!(count, 5);
        assert_eq!(llrb.min().unwrap().key, b"000");
        assert_eq!(llrb.max().unwrap().key, b"099");
    }

    #[test]
    fn test_llrb_set_cas() {
        let llrb = new_llrb("cas");
        let (seqno, _) = llrb.set_cas(b"k", b"v1", 0).unwrap();
        assert!(matches!(llrb.set_cas(b"k", b"v2", 0), Err(StorageError::InvalidCas)));
        assert!(matches!(llrb.set_cas(b"k", b"v2", seqno + 10), Err(StorageError::InvalidCas)));
        let (seqno2, _) = llrb.set_cas(b"k", b"v2", seqno).unwrap();
        assert!(seqno2 > seqno);
        assert_eq!(llrb.get(b"k").unwrap().value, b"v2");

        // a tombstone counts as absent
        llrb.delete(b"k", true).unwrap();
        llrb.set_cas(b"k", b"v3", 0).unwrap();
        assert!(!llrb.get(b"k").unwrap().deleted);
    }

    #[test]
    fn test_llrb_lsm_delete() {
        let llrb = new_llrb("lsm");
        llrb.set(b"present", b"value").unwrap();
        let (seqno, old) = llrb.delete(b"present", true).unwrap();
        assert_eq!(old.unwrap().value, b"value");
        let entry = llrb.get(b"present").unwrap();
        assert!(entry.deleted);
        assert_eq!(entry.deadseqno, seqno);
        assert_eq!(entry.bornseqno, 1);

        let (seqno, old) = llrb.delete(b"absent", true).unwrap();
        assert!(old.is_none());
        let entry = llrb.get(b"absent").unwrap();
        assert!(entry.deleted);
        assert_eq!(entry.seqno(), seqno);
        assert_eq!(llrb.count(), 2);
        llrb.validate().unwrap();
    }

    #[test]
    fn test_llrb_iterator_survives_writes() {
        let llrb = new_llrb("iterwrite");
        for i in 0..1000u32 {
            llrb.set(format!("{:04}", i).as_bytes(), b"old").unwrap();
        }
        let iter = llrb.iterate(None, None, Inclusion::Both, false);
        for i in 0..1000u32 {
            if i % 2 == 0 {
                llrb.delete(format!("{:04}", i).as_bytes(), false).unwrap();
            } else {
                llrb.set(format!("{:04}", i).as_bytes(), b"new").unwrap();
            }
        }
        let entries: Vec<Entry> = iter.map(|e| e.unwrap()).collect();
        assert_eq!(entries.len(), 1000);
        assert!(entries.iter().all(|e| e.value == b"old"));
        assert_eq!(llrb.count(), 500);
        llrb.validate().unwrap();
        assert!(llrb.stats().n_clones > 0);
    }

    #[test]
    fn test_llrb_upsert_callback() {
        let llrb = new_llrb("callback");
        let mut callback = |md: &mut Metadata<&mut [u8]>| {
            md.set_vbno(7).set_vbuuid(0xfeed);
        };
        let (entry, _) = llrb.upsert(b"k", b"v", Some(&mut callback)).unwrap();
        assert_eq!(entry.vbno, 7);
        assert_eq!(entry.vbuuid, 0xfeed);
        assert_eq!(llrb.vclock().get(&7), Some(&(0xfeed, 1)));
    }

    #[test]
    #[should_panic(expected = "empty key")]
    fn test_llrb_empty_key() {
        let llrb = new_llrb("empty");
        let _ = llrb.set(b"", b"v");
    }

    #[test]
    fn test_llrb_txn() {
        let llrb = new_llrb("txn");
        llrb.set(b"a", b"1").unwrap();
        llrb.set(b"b", b"1").unwrap();

        let mut txn = llrb.begin_txn(1);
        txn.set(b"a", b"2");
        txn.delete(b"b", false);
        txn.set(b"c", b"3");
        assert_eq!(txn.get(b"a").unwrap().value, b"2");
        assert!(txn.get(b"b").is_none());
        assert!(llrb.get(b"c").is_none());
        txn.commit().unwrap();

        assert_eq!(llrb.get(b"a").unwrap().value, b"2");
        assert!(llrb.get(b"b").is_none());
        assert_eq!(llrb.get(b"c").unwrap().value, b"3");

        let mut txn = llrb.begin_txn(2);
        txn.set(b"a", b"txn");
        llrb.set(b"a", b"outside").unwrap();
        assert!(matches!(txn.commit(), Err(StorageError::Rollback)));
        assert_eq!(llrb.get(b"a").unwrap().value, b"outside");

        let txn = llrb.begin_txn(3);
        txn.abort();

        let stats = llrb.stats();
        assert_eq!(stats.n_txns, 3);
        assert_eq!(stats.n_commits, 1);
        assert_eq!(stats.n_aborts, 2);
        llrb.validate().unwrap();
    }

    #[test]
    fn test_llrb_view() {
        let llrb = new_llrb("view");
        llrb.set(b"a", b"1").unwrap();
        let view = llrb.view(1);
        llrb.set(b"a", b"2").unwrap();
        assert_eq!(view.get(b"a").unwrap().value, b"1");
        assert_eq!(view.iterate(None, None, Inclusion::Both, false).count(), 1);
    }

    #[test]
    #[should_panic(expected = "read-only")]
    fn test_llrb_view_write() {
        let llrb = new_llrb("viewwrite");
        let view = llrb.view(1);
        view.set(b"a", b"1");
    }

    #[test]
    fn test_llrb_memory_released() {
        let llrb = new_llrb("memory");
        for i in 0..2000u32 {
            llrb.set(format!("key{}", i).as_bytes(), &[0u8; 100]).unwrap();
        }
        let stats = llrb.stats();
        assert_eq!(stats.keymemory, (0..2000u32).map(|i| format!("key{}", i).len()).sum::<usize>());
        assert_eq!(stats.valmemory, 2000 * 100);
        for i in 0..2000u32 {
            llrb.delete(format!("key{}", i).as_bytes(), false).unwrap();
        }
        let stats = llrb.stats();
        assert_eq!(stats.keymemory, 0);
        assert_eq!(stats.valmemory, 0);
        assert_eq!(stats.keyarena.allocated, 0);
        assert_eq!(stats.valarena.allocated, 0);
    }
}
