//! Head snapshot: the levels a reader resolves through
//!
//! ## Layout
//! ```text
//! mw (writes) -> mr (being flushed) -> mc (disk cache) -> disks[0] .. disks[15]
//! ```
//! Newer levels shadow older ones; among disks the lower index is newer.
//! A head is immutable once installed, the index swaps in a new one for
//! every flush or compaction and readers keep whatever head they cloned.

use super::cache::Cache;
use super::memindex::MemIndex;
use super::merging_iterator::MergingIterator;
use crate::storage::bubt::Snapshot as BubtSnapshot;
use crate::storage::llrb::LlrbSnapshot;
use crate::config::BubtConfig;
use crate::types::{Entry, EntryIter, KeyRange};
use crate::{Result, StorageError};
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// Disk levels per index.
pub const NLEVELS: usize = 16;

/// One disk level, `version` grows every time the level is rewritten.
#[derive(Clone, Debug)]
pub(crate) struct Disk {
    pub level: usize,
    pub version: u64,
    pub snapshot: BubtSnapshot,
    pub meta: LevelMeta,
}

impl Disk {
    pub fn open(dirname: &str, level: usize, version: u64, config: &BubtConfig) -> Result<Self> {
        let snapshot = BubtSnapshot::open(dirname, &config.diskpaths, config.mmap)?;
        let meta = LevelMeta::decode(snapshot.metadata()).map_err(|err| {
            StorageError::CorruptSnapshot(format!("{}: level metadata {}", dirname, err))
        })?;
        Ok(Self { level, version, snapshot, meta })
    }

    pub fn footprint(&self) -> u64 {
        self.snapshot.footprint()
    }

    /// Highest seqno the level covers.
    pub fn seqno(&self) -> u64 {
        self.snapshot.seqno().max(self.meta.seqno)
    }
}

/// Snapshot name for `level` of index `name`: `name-level-version-uuid`.
pub(crate) fn level_name(name: &str, level: usize, version: u64) -> String {
    let uuid: u64 = rand::thread_rng().gen();
    format!("{}-{}-{}-{:016x}", name, level, version, uuid)
}

/// Level and version of a snapshot directory belonging to index `name`.
pub(crate) fn parse_level_name(name: &str, dirname: &str) -> Option<(usize, u64)> {
    let mut parts = dirname.rsplitn(4, '-');
    let uuid = parts.next()?;
    let version = parts.next()?.parse::<u64>().ok()?;
    let level = parts.next()?.parse::<usize>().ok()?;
    let prefix = parts.next()?;
    if prefix != name || level >= NLEVELS || uuid.len() != 16 {
        return None;
    }
    u64::from_str_radix(uuid, 16).ok()?;
    Some((level, version))
}

/// Application metadata sealed into every disk level.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub(crate) struct LevelMeta {
    /// Index seqno when the level was built
    pub seqno: u64,
    /// Build time, seconds since the epoch
    pub flushunix: u64,
}

impl LevelMeta {
    pub fn now(seqno: u64) -> Self {
        let flushunix = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .map(|d| d.as_secs())
            .unwrap_or(0);
        Self { seqno, flushunix }
    }

    pub fn encode(&self) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }

    pub fn decode(data: &[u8]) -> Result<Self> {
        Ok(serde_json::from_slice(data)?)
    }
}

pub(crate) struct Head {
    pub id: u64,
    pub mw: Arc<MemIndex>,
    pub mr: Option<Arc<MemIndex>>,
    pub mc: Option<Arc<Cache>>,
    pub disks: [Option<Disk>; NLEVELS],
}

impl Head {
    pub fn new(id: u64, mw: Arc<MemIndex>) -> Self {
        Self { id, mw, mr: None, mc: None, disks: Default::default() }
    }

    /// Same levels under a new id.
    pub fn derive(&self, id: u64) -> Self {
        Self {
            id,
            mw: Arc::clone(&self.mw),
            mr: self.mr.clone(),
            mc: self.mc.clone(),
            disks: self.disks.clone(),
        }
    }

    /// Bytes held by every memory level.
    pub fn memheap(&self) -> usize {
        self.mw.footprint()
            + self.mr.as_ref().map_or(0, |mr| mr.footprint())
            + self.mc.as_ref().map_or(0, |mc| mc.footprint())
    }

    /// Disks newest first.
    pub fn levels(&self) -> impl Iterator<Item = &Disk> {
        self.disks.iter().flatten()
    }

    /// Highest seqno across every level.
    pub fn seqno(&self) -> u64 {
        let disk = self.levels().map(|d| d.seqno()).max().unwrap_or(0);
        self.mw.get_seqno().max(self.mr.as_ref().map_or(0, |mr| mr.get_seqno())).max(disk)
    }

    /// Newest version of `key`, tombstones included. The flag tells
    /// whether it was read off a disk level.
    pub fn get(&self, key: &[u8]) -> Result<Option<(Entry, bool)>> {
        if let Some(entry) = self.mw.get(key) {
            return Ok(Some((entry, false)));
        }
        if let Some(entry) = self.mr.as_ref().and_then(|mr| mr.get(key)) {
            return Ok(Some((entry, false)));
        }
        if let Some(entry) = self.mc.as_ref().and_then(|mc| mc.get(key)) {
            return Ok(Some((entry, false)));
        }
        for disk in self.levels() {
            if let Some(entry) = disk.snapshot.get(key)? {
                return Ok(Some((entry, true)));
            }
        }
        Ok(None)
    }
}

impl std::fmt::Debug for Head {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let disks: Vec<&str> = self.levels().map(|d| d.snapshot.id()).collect();
        f.debug_struct("Head")
            .field("id", &self.id)
            .field("mw", &self.mw.id())
            .field("mr", &self.mr.as_ref().map(|mr| mr.id().to_string()))
            .field("mc", &self.mc.is_some())
            .field("disks", &disks)
            .finish()
    }
}

/// A head with its memory levels frozen at one point in time.
pub(crate) struct HeadView {
    head: Arc<Head>,
    mw: Arc<LlrbSnapshot>,
    mr: Option<Arc<LlrbSnapshot>>,
    mc: Option<Arc<LlrbSnapshot>>,
}

impl HeadView {
    pub fn new(head: Arc<Head>) -> Self {
        let mw = head.mw.snapshot();
        let mr = head.mr.as_ref().map(|mr| mr.snapshot());
        let mc = head.mc.as_ref().map(|mc| mc.snapshot());
        Self { head, mw, mr, mc }
    }

    /// Newest version of `key` as of the view, tombstones included.
    pub fn get(&self, key: &[u8]) -> Result<Option<Entry>> {
        let memory = [Some(&self.mw), self.mr.as_ref(), self.mc.as_ref()];
        for snapshot in memory.into_iter().flatten() {
            if let Some(entry) = snapshot.get(key) {
                return Ok(Some(entry));
            }
        }
        for disk in self.head.levels() {
            if let Some(entry) = disk.snapshot.get(key)? {
                return Ok(Some(entry));
            }
        }
        Ok(None)
    }

    /// Merged iteration, `skip_deleted` hides tombstones and whatever they
    /// shadow.
    pub fn iterate(&self, range: KeyRange, reverse: bool, skip_deleted: bool) -> BognIter {
        let (low, high) = (range.low.as_deref(), range.high.as_deref());
        let memory = [Some(&self.mw), self.mr.as_ref(), self.mc.as_ref()];
        let mut sources: Vec<EntryIter> = memory
            .into_iter()
            .flatten()
            .map(|snapshot| -> EntryIter { Box::new(snapshot.iterate(low, high, range.incl, reverse)) })
            .collect();
        for disk in self.head.levels() {
            sources.push(Box::new(disk.snapshot.iter_range(range.clone(), reverse)));
        }
        BognIter {
            _head: Arc::clone(&self.head),
            inner: MergingIterator::new(sources, reverse, skip_deleted),
        }
    }
}

/// Iterator over the merged levels, keeps its head alive.
pub struct BognIter {
    _head: Arc<Head>,
    inner: MergingIterator,
}

impl Iterator for BognIter {
    type Item = Result<Entry>;

    fn next(&mut self) -> Option<Self::Item> {
        self.inner.next()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_level_name() {
        let dirname = level_name("users-east", 14, 3);
        assert_eq!(parse_level_name("users-east", &dirname), Some((14, 3)));
        assert_eq!(parse_level_name("users", &dirname), None);
        assert_eq!(parse_level_name("users-east", "users-east-16-1-0123456789abcdef"), None);
        assert_eq!(parse_level_name("users-east", "users-east-3-x-0123456789abcdef"), None);
        assert_eq!(parse_level_name("users-east", "users-east-3-1-xyz"), None);
        assert_ne!(level_name("a", 0, 1), level_name("a", 0, 1));
    }

    #[test]
    fn test_level_meta() {
        let meta = LevelMeta::now(42);
        assert!(meta.flushunix > 0);
        assert_eq!(LevelMeta::decode(&meta.encode().unwrap()).unwrap(), meta);
        assert!(LevelMeta::decode(b"garbage").is_err());
    }
}
