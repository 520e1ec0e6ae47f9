//! Tree state and write path shared by `Llrb` and `Mvcc`

use super::cow::{is_red, Cow};
use super::iter;
use super::metadata::{FieldMask, Metadata};
use super::node::{Link, Llrbnode};
use super::snapshot::LlrbSnapshot;
use super::stats::{ArenaStats, LlrbStats};
use super::txn::{TxnOp, TxnWrite};
use crate::config::LlrbConfig;
use crate::storage::malloc::Arena;
use crate::types::Entry;
use crate::{Result, StorageError};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

/// Metadata callback run on a new node before it is linked into the tree.
pub type UpsertCallback<'a> = &'a mut dyn FnMut(&mut Metadata<&mut [u8]>);

#[derive(Debug, Default)]
struct WriteCounts {
    n_inserts: usize,
    n_updates: usize,
    n_deletes: usize,
    n_nodes: usize,
    n_frees: usize,
    n_clones: usize,
    n_reclaims: usize,
}

pub(crate) struct Tree {
    pub name: String,
    pub logprefix: String,
    config: LlrbConfig,
    fields: FieldMask,
    keys: Arena,
    vals: Arena,
    pub root: Link,
    pub seqno: u64,
    n_count: usize,
    keymemory: usize,
    valmemory: usize,
    /// vbno -> (vbuuid, seqno)
    vclock: HashMap<u16, (u64, u64)>,
    /// Replaced nodes waiting for the next snapshot
    reclaim: Vec<Arc<Llrbnode>>,
    retain: bool,
    counts: WriteCounts,
}

fn access_now() -> u64 {
    SystemTime::now().duration_since(UNIX_EPOCH).map(|d| d.as_secs()).unwrap_or(0)
}

impl Tree {
    /// `retain` keeps replaced nodes for the next snapshot instead of
    /// releasing them.
    pub fn new(name: &str, logprefix: String, config: LlrbConfig, retain: bool) -> Result<Self> {
        config.validate()?;
        let keys = Arena::new(config.key_arena())?;
        let vals = Arena::new(config.val_arena())?;
        let fields = FieldMask::from_flags(config.bornseqno, config.deadseqno, true, config.vbuuid);
        Ok(Self {
            name: name.to_string(),
            logprefix,
            config,
            fields,
            keys,
            vals,
            root: None,
            seqno: 0,
            n_count: 0,
            keymemory: 0,
            valmemory: 0,
            vclock: HashMap::new(),
            reclaim: Vec::new(),
            retain,
            counts: WriteCounts::default(),
        })
    }

    pub fn count(&self) -> usize {
        self.n_count
    }

    pub fn config(&self) -> &LlrbConfig {
        &self.config
    }

    /// Bytes held in both arenas.
    pub fn footprint(&self) -> usize {
        self.keys.allocated() + self.vals.allocated()
    }

    pub fn vclock(&self) -> HashMap<u16, (u64, u64)> {
        self.vclock.clone()
    }

    pub fn get(&self, key: &[u8]) -> Option<Entry> {
        iter::get(&self.root, key).map(|node| node.to_entry())
    }

    /// Capture the root and take over the reclaim list.
    pub fn snapshot(&mut self, id: u64) -> LlrbSnapshot {
        let reclaim = std::mem::take(&mut self.reclaim);
        LlrbSnapshot::new(id, self.root.clone(), reclaim, self.seqno, self.n_count)
    }

    /// Node ready to be linked, sized and allocated up front.
    fn prepare(&self, key: &[u8], value: Option<&[u8]>) -> Result<Llrbnode> {
        assert!(!key.is_empty(), "{} empty key", self.logprefix);
        if key.len() > self.config.max_keysize {
            return Err(StorageError::AllocTooLarge { size: key.len(), max: self.config.max_keysize });
        }
        if let Some(value) = value {
            if value.len() > self.config.max_valsize {
                return Err(StorageError::AllocTooLarge {
                    size: value.len(),
                    max: self.config.max_valsize,
                });
            }
        }
        Llrbnode::new(&self.keys, &self.vals, self.fields, key, value)
    }

    fn retire(&mut self, node: Arc<Llrbnode>) {
        if self.retain {
            self.counts.n_reclaims += 1;
            self.reclaim.push(node);
        } else {
            self.counts.n_frees += 1;
        }
    }

    fn account(&mut self, cow: (usize, usize, usize)) {
        self.counts.n_clones += cow.0;
        self.counts.n_frees += cow.1;
        self.counts.n_reclaims += cow.2;
    }

    /// Link a prepared and stamped node, returns the replaced entry.
    fn link(&mut self, node: Llrbnode) -> (Entry, Option<Entry>) {
        let entry = node.to_entry();
        let (klen, vlen) = node.footprint();
        let (old, counts) = {
            let reclaim = if self.retain { Some(&mut self.reclaim) } else { None };
            let mut cow = Cow::new(&self.keys, reclaim);
            let old = cow.upsert(&mut self.root, node);
            (old, (cow.n_clones, cow.n_frees, cow.n_reclaims))
        };
        self.account(counts);
        self.counts.n_nodes += 1;

        let old = match old {
            Some(old) => {
                let (_, ovlen) = old.footprint();
                self.valmemory = self.valmemory + vlen - ovlen;
                self.counts.n_updates += 1;
                let oldentry = old.to_entry();
                self.retire(old);
                Some(oldentry)
            }
            None => {
                self.n_count += 1;
                self.keymemory += klen;
                self.valmemory += vlen;
                self.counts.n_inserts += 1;
                None
            }
        };
        self.seqno = self.seqno.max(entry.seqno());
        self.vclock.insert(entry.vbno, (entry.vbuuid, self.seqno));
        (entry, old)
    }

    /// Insert or replace `key`, `callback` may adjust metadata before the
    /// node goes live.
    pub fn upsert(
        &mut self,
        key: &[u8],
        value: &[u8],
        callback: Option<UpsertCallback<'_>>,
    ) -> Result<(Entry, Option<Entry>)> {
        let mut node = self.prepare(key, Some(value))?;
        let seqno = self.seqno + 1;
        node.stamp(seqno, false, 0, 0);
        node.metadata_mut().set_access(access_now());
        if let Some(callback) = callback {
            callback(&mut node.metadata_mut());
        }
        self.seqno = seqno;
        Ok(self.link(node))
    }

    pub fn set(&mut self, key: &[u8], value: &[u8]) -> Result<(u64, Option<Entry>)> {
        let (_, old) = self.upsert(key, value, None)?;
        Ok((self.seqno, old))
    }

    /// Insert `entry` carrying the seqnos it was written with elsewhere.
    /// The tree seqno never moves backwards.
    pub fn load(&mut self, entry: &Entry) -> Result<Option<Entry>> {
        let value = if entry.deleted { None } else { Some(entry.value.as_slice()) };
        let mut node = self.prepare(&entry.key, value)?;
        node.stamp(entry.bornseqno, false, entry.vbno, entry.vbuuid);
        if entry.deleted {
            node.stamp(entry.deadseqno, true, entry.vbno, entry.vbuuid);
        }
        node.metadata_mut().set_access(access_now());
        let (_, old) = self.link(node);
        Ok(old)
    }

    /// `cas == 0` requires `key` absent or deleted, otherwise the live
    /// entry's seqno must equal `cas`.
    pub fn set_cas(&mut self, key: &[u8], value: &[u8], cas: u64) -> Result<(u64, Option<Entry>)> {
        let matched = match iter::get(&self.root, key) {
            None => cas == 0,
            Some(node) if node.is_deleted() => cas == 0,
            Some(node) => cas != 0 && node.seqno() == cas,
        };
        if !matched {
            return Err(StorageError::InvalidCas);
        }
        self.set(key, value)
    }

    /// Tombstone `key` in place, without restructuring the tree.
    fn mark_deleted(&mut self, key: &[u8], seqno: u64) -> Option<Entry> {
        let (old, counts) = {
            let reclaim = if self.retain { Some(&mut self.reclaim) } else { None };
            let mut cow = Cow::new(&self.keys, reclaim);
            let old = cow.find_mut(&mut self.root, key).map(|node| {
                let old = node.to_entry();
                let (vbno, vbuuid) = (node.vbno(), node.vbuuid());
                node.stamp(seqno, true, vbno, vbuuid);
                old
            });
            (old, (cow.n_clones, cow.n_frees, cow.n_reclaims))
        };
        self.account(counts);
        old
    }

    /// Unlink `key` from the tree.
    fn remove(&mut self, key: &[u8]) -> Option<Entry> {
        iter::get(&self.root, key)?;
        let (old, counts) = {
            let reclaim = if self.retain { Some(&mut self.reclaim) } else { None };
            let mut cow = Cow::new(&self.keys, reclaim);
            let old = cow.delete(&mut self.root, key);
            (old, (cow.n_clones, cow.n_frees, cow.n_reclaims))
        };
        self.account(counts);
        old.map(|node| self.unlinked(node))
    }

    fn unlinked(&mut self, node: Arc<Llrbnode>) -> Entry {
        let (klen, vlen) = node.footprint();
        self.n_count -= 1;
        self.keymemory -= klen;
        self.valmemory -= vlen;
        self.counts.n_deletes += 1;
        let entry = node.to_entry();
        self.retire(node);
        entry
    }

    /// With `lsm` the key is kept as a tombstone, inserting one if absent.
    pub fn delete(&mut self, key: &[u8], lsm: bool) -> Result<(u64, Option<Entry>)> {
        assert!(!key.is_empty(), "{} empty key", self.logprefix);
        let seqno = self.seqno + 1;
        let exists = iter::get(&self.root, key).is_some();
        let old = match (lsm, exists) {
            (true, true) => {
                let old = self.mark_deleted(key, seqno);
                self.counts.n_deletes += 1;
                old
            }
            (true, false) => {
                let mut node = self.prepare(key, None)?;
                node.stamp(seqno, true, 0, 0);
                self.link(node);
                self.counts.n_deletes += 1;
                None
            }
            (false, true) => self.remove(key),
            (false, false) => None,
        };
        self.seqno = seqno;
        Ok((seqno, old))
    }

    pub fn delete_min(&mut self) -> Option<Entry> {
        let (old, counts) = {
            let reclaim = if self.retain { Some(&mut self.reclaim) } else { None };
            let mut cow = Cow::new(&self.keys, reclaim);
            let old = cow.delete_min(&mut self.root);
            (old, (cow.n_clones, cow.n_frees, cow.n_reclaims))
        };
        self.account(counts);
        old.map(|node| self.unlinked(node))
    }

    pub fn delete_max(&mut self) -> Option<Entry> {
        let (old, counts) = {
            let reclaim = if self.retain { Some(&mut self.reclaim) } else { None };
            let mut cow = Cow::new(&self.keys, reclaim);
            let old = cow.delete_max(&mut self.root);
            (old, (cow.n_clones, cow.n_frees, cow.n_reclaims))
        };
        self.account(counts);
        old.map(|node| self.unlinked(node))
    }

    /// Apply a transaction's writes if none of its keys moved since they
    /// were read, all or nothing.
    pub fn commit(&mut self, writes: &[TxnWrite]) -> Result<u64> {
        for write in writes {
            let current = iter::get(&self.root, &write.key).map_or(0, |node| node.seqno());
            if current != write.cas {
                return Err(StorageError::Rollback);
            }
        }

        let mut prepared = Vec::with_capacity(writes.len());
        for write in writes {
            let node = match &write.op {
                TxnOp::Set(value) => Some(self.prepare(&write.key, Some(value))?),
                TxnOp::Delete { lsm: true } if write.cas == 0 => {
                    Some(self.prepare(&write.key, None)?)
                }
                TxnOp::Delete { .. } => None,
            };
            prepared.push(node);
        }

        for (write, node) in writes.iter().zip(prepared) {
            let seqno = self.seqno + 1;
            match node {
                Some(mut node) => {
                    let deleted = matches!(write.op, TxnOp::Delete { .. });
                    node.stamp(seqno, deleted, 0, 0);
                    node.metadata_mut().set_access(access_now());
                    self.link(node);
                    if deleted {
                        self.counts.n_deletes += 1;
                    }
                }
                None => match write.op {
                    TxnOp::Delete { lsm: true } => {
                        self.mark_deleted(&write.key, seqno);
                        self.counts.n_deletes += 1;
                    }
                    TxnOp::Delete { lsm: false } => {
                        self.remove(&write.key);
                    }
                    TxnOp::Set(_) => {}
                },
            }
            self.seqno = seqno;
        }
        Ok(self.seqno)
    }

    pub fn stats(&self) -> LlrbStats {
        LlrbStats {
            name: self.name.clone(),
            seqno: self.seqno,
            n_count: self.n_count,
            n_inserts: self.counts.n_inserts,
            n_updates: self.counts.n_updates,
            n_deletes: self.counts.n_deletes,
            n_nodes: self.counts.n_nodes,
            n_frees: self.counts.n_frees,
            n_clones: self.counts.n_clones,
            n_reclaims: self.counts.n_reclaims,
            keymemory: self.keymemory,
            valmemory: self.valmemory,
            keyarena: ArenaStats::from_arena(&self.keys),
            valarena: ArenaStats::from_arena(&self.vals),
            ..Default::default()
        }
    }

    /// Check ordering, colours, black height and the memory counters.
    pub fn validate(&self) -> Result<()> {
        if is_red(&self.root) {
            return Err(StorageError::Validation(format!("{} root is red", self.logprefix)));
        }
        let mut walk = Walk::default();
        walk.node(&self.root, false)?;

        if walk.count != self.n_count {
            return Err(StorageError::Validation(format!(
                "{} count {} != n_count {}",
                self.logprefix, walk.count, self.n_count
            )));
        }
        if walk.keymem != self.keymemory || walk.valmem != self.valmemory {
            return Err(StorageError::Validation(format!(
                "{} memory {}/{} != {}/{}",
                self.logprefix, walk.keymem, walk.valmem, self.keymemory, self.valmemory
            )));
        }
        if walk.maxseqno > self.seqno {
            return Err(StorageError::Validation(format!(
                "{} node seqno {} beyond tree seqno {}",
                self.logprefix, walk.maxseqno, self.seqno
            )));
        }
        let utilization = self.keys.utilization();
        if utilization < crate::storage::malloc::MEM_UTILIZATION {
            log::debug!("{} key arena utilization {:.2}", self.logprefix, utilization);
        }
        Ok(())
    }
}

#[derive(Default)]
struct Walk {
    prev: Option<Vec<u8>>,
    count: usize,
    keymem: usize,
    valmem: usize,
    maxseqno: u64,
}

impl Walk {
    /// Returns the black height of `link`.
    fn node(&mut self, link: &Link, parent_red: bool) -> Result<usize> {
        let node = match link {
            Some(node) => node,
            None => return Ok(0),
        };
        if node.is_red() && parent_red {
            return Err(StorageError::Validation(format!("consecutive red links at {:?}", node)));
        }
        if is_red(&node.right) {
            return Err(StorageError::Validation(format!("right leaning red link at {:?}", node)));
        }
        let left = self.node(&node.left, node.is_red())?;

        if let Some(prev) = &self.prev {
            if prev.as_slice() >= node.key() {
                return Err(StorageError::Validation(format!("keys out of order at {:?}", node)));
            }
        }
        self.prev = Some(node.key().to_vec());
        self.count += 1;
        self.keymem += node.key().len();
        self.valmem += node.value().len();
        self.maxseqno = self.maxseqno.max(node.bornseqno()).max(node.deadseqno());

        let right = self.node(&node.right, node.is_red())?;
        if left != right {
            return Err(StorageError::Validation(format!(
                "black height {} != {} at {:?}",
                left, right, node
            )));
        }
        Ok(left + usize::from(node.is_black()))
    }
}
