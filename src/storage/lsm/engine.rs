//! Bogn index: memory levels over a stack of disk levels
//!
//! ## Architecture
//! - **Head**: `{mw, mr, mc, disks[16]}` behind `snaplock`. Readers clone
//!   the head and run without any lock, writers hold the read side of
//!   `snaplock` plus the writer mutex and only touch `mw`
//! - **Compactor**: one thread deciding between persist, flush and disk
//!   compaction every tick, see [`super::compaction`]
//! - **Purger**: one thread destroying disk levels of retired heads
//!
//! ## Thread Management
//! - Background threads hold `Weak` references to the shared state
//! - `close()` drops the close channel, joins both threads, then winds up:
//!   whatever is still memory-only is written to disk
//! - `Drop` closes an index that was not closed explicitly

use super::compaction::{self, Counters};
use super::memindex::MemIndex;
use super::purger::{self, Purger};
use super::snapshot::{level_name, parse_level_name, BognIter, Disk, Head, HeadView, NLEVELS};
use super::txn::{BognTxn, BognView};
use super::cache::Cache;
use crate::config::BognConfig;
use crate::storage::bubt::index_dir;
use crate::storage::llrb::{LlrbStats, TxnWrite};
use crate::types::{Entry, EntryIter, Inclusion, KeyRange, Reader};
use crate::{Result, StorageError};
use crossbeam::channel::{bounded, Receiver, Sender};
use log::{error, info, warn};
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use std::collections::BTreeMap;
use std::fs;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

/// State shared between the index handle and its background threads.
pub(crate) struct Shared {
    pub name: String,
    pub logprefix: String,
    pub config: BognConfig,

    pub snaplock: RwLock<Arc<Head>>,
    /// Serializes writers, taken after the read side of `snaplock`
    pub writer: Mutex<()>,
    /// Serializes flush, persist and disk compaction
    pub maint: Mutex<()>,

    /// Highest version seen per level, on disk or built
    versions: Mutex<[u64; NLEVELS]>,
    head_ids: AtomicU64,
    mem_ids: AtomicU64,

    pub purger: Purger,
    purge_tx: Sender<()>,

    pub dgm: AtomicBool,
    pub degraded: AtomicBool,
    pub closed: AtomicBool,
    /// Every write up to this seqno is on disk
    pub persisted_seqno: AtomicU64,
    pub counters: Counters,
}

impl Shared {
    fn open(name: &str, config: BognConfig) -> Result<(Self, Receiver<()>)> {
        let logprefix = format!("BOGN [{}]", name);
        let (disks, versions) = if config.durable {
            reload(name, &config, &logprefix)?
        } else {
            (Default::default(), [0; NLEVELS])
        };

        let seqno = disks.iter().flatten().map(|d| d.seqno()).max().unwrap_or(0);
        let mw = MemIndex::seeded(&format!("{}-mw-0", name), &config, seqno)?;
        let mut head = Head::new(0, Arc::new(mw));
        head.disks = disks;
        let n_disks = head.levels().count();

        let (purge_tx, purge_rx) = bounded(1);
        let dgm = config.dgm;
        let shared = Shared {
            name: name.to_string(),
            logprefix: logprefix.clone(),
            config,
            snaplock: RwLock::new(Arc::new(head)),
            writer: Mutex::new(()),
            maint: Mutex::new(()),
            versions: Mutex::new(versions),
            head_ids: AtomicU64::new(1),
            mem_ids: AtomicU64::new(1),
            purger: Purger::new(&logprefix),
            purge_tx,
            dgm: AtomicBool::new(dgm),
            degraded: AtomicBool::new(false),
            closed: AtomicBool::new(false),
            persisted_seqno: AtomicU64::new(seqno),
            counters: Counters::default(),
        };
        info!("{} opened with {} disk level(s) at seqno {}", logprefix, n_disks, seqno);
        Ok((shared, purge_rx))
    }

    pub fn head(&self) -> Arc<Head> {
        Arc::clone(&self.snaplock.read())
    }

    /// Deletes leave tombstones whenever older levels may hold the key.
    pub fn lsm_deletes(&self) -> bool {
        self.config.durable || self.config.dgm
    }

    pub fn new_memindex(&self, tag: &str) -> Result<MemIndex> {
        let n = self.mem_ids.fetch_add(1, Ordering::Relaxed);
        MemIndex::new(&format!("{}-{}-{}", self.name, tag, n), &self.config)
    }

    /// Fresh working-set cache when the index keeps one.
    pub fn new_cache(&self) -> Result<Option<Arc<Cache>>> {
        if !(self.config.dgm && self.config.workingset) {
            return Ok(None);
        }
        let n = self.mem_ids.fetch_add(1, Ordering::Relaxed);
        Ok(Some(Arc::new(Cache::new(&format!("{}-mc-{}", self.name, n), &self.config)?)))
    }

    /// Reserve the next version of `level` and name its snapshot.
    pub fn next_level_name(&self, level: usize) -> (String, u64) {
        let mut versions = self.versions.lock();
        versions[level] += 1;
        let version = versions[level];
        (level_name(&self.name, level, version), version)
    }

    /// Swap in the head built by `make` from the current one. The old head
    /// is retired together with the disk levels the new head no longer
    /// holds. Every old head is queued, even one dropping no level, so that
    /// a reader on it keeps newer retirements from being purged.
    pub fn install<F>(&self, make: F) -> Arc<Head>
    where
        F: FnOnce(&Head, u64) -> Head,
    {
        let id = self.head_ids.fetch_add(1, Ordering::Relaxed);
        let (old, new) = {
            let mut head = self.snaplock.write();
            let new = Arc::new(make(&head, id));
            let old = std::mem::replace(&mut *head, Arc::clone(&new));
            (old, new)
        };

        let stale: Vec<Disk> = old
            .levels()
            .filter(|d| !new.levels().any(|n| n.snapshot.id() == d.snapshot.id()))
            .cloned()
            .collect();
        info!("{} installed head {} {:?}", self.logprefix, id, new);
        self.purger.retire(old, stale);
        let _ = self.purge_tx.try_send(());
        new
    }

    /// Run a write against `mw` of the current head.
    pub fn write<T>(&self, op: impl FnOnce(&Head) -> Result<T>) -> Result<T> {
        let head = self.snaplock.read();
        let _writer = self.writer.lock();
        if self.closed.load(Ordering::Acquire) {
            return Err(StorageError::Closed(self.name.clone()));
        }
        op(&head)
    }

    /// Apply transaction writes carrying the seqnos seen by the transaction.
    pub fn commit(&self, writes: Vec<TxnWrite>) -> Result<u64> {
        self.write(|head| {
            let mut local = Vec::with_capacity(writes.len());
            for write in writes {
                let current = head.get(&write.key)?.map_or(0, |(entry, _)| entry.seqno());
                if current != write.cas {
                    return Err(StorageError::Rollback);
                }
                let cas = head.mw.get(&write.key).map_or(0, |entry| entry.seqno());
                local.push(TxnWrite { cas, ..write });
            }
            head.mw.txn_commit(&local)
        })
    }

    /// Memory footprint that triggers the next flush.
    pub fn threshold(&self) -> usize {
        let capacity = self.config.mem_capacity() as f64;
        let factor = match (self.dgm.load(Ordering::Acquire), self.config.workingset) {
            (false, _) => 0.9,
            (true, false) => 0.5,
            (true, true) => 0.3,
        };
        (capacity * factor) as usize
    }

    pub fn purge(&self, force: bool) -> Result<usize> {
        self.purger.purge(force)
    }
}

/// Open the newest complete version of every level found under the disk
/// paths, removing older and incomplete versions.
fn reload(
    name: &str,
    config: &BognConfig,
    logprefix: &str,
) -> Result<([Option<Disk>; NLEVELS], [u64; NLEVELS])> {
    let mut found: BTreeMap<(usize, u64), Vec<String>> = BTreeMap::new();
    for path in config.bubt.diskpaths.iter() {
        fs::create_dir_all(path)?;
        for dirent in fs::read_dir(path)? {
            let dirent = dirent?;
            if !dirent.file_type()?.is_dir() {
                continue;
            }
            let dirname = dirent.file_name().to_string_lossy().into_owned();
            if let Some(key) = parse_level_name(name, &dirname) {
                let names = found.entry(key).or_default();
                if !names.contains(&dirname) {
                    names.push(dirname);
                }
            }
        }
    }

    let mut disks: [Option<Disk>; NLEVELS] = Default::default();
    let mut versions = [0u64; NLEVELS];
    // newest version of each level first
    for ((level, version), dirnames) in found.into_iter().rev() {
        versions[level] = versions[level].max(version);
        for dirname in dirnames {
            if disks[level].is_some() {
                info!("{} removing older {}", logprefix, dirname);
                remove_level(&config.bubt.diskpaths, &dirname)?;
                continue;
            }
            match Disk::open(&dirname, level, version, &config.bubt) {
                Ok(disk) => {
                    info!("{} reloaded level {} version {} ({} entries)", logprefix, level, version, disk.snapshot.count());
                    disks[level] = Some(disk);
                }
                Err(StorageError::InvalidMarker(path)) => {
                    warn!("{} removing incomplete {}, no marker in {:?}", logprefix, dirname, path);
                    remove_level(&config.bubt.diskpaths, &dirname)?;
                }
                Err(StorageError::Io(err)) if err.kind() == std::io::ErrorKind::NotFound => {
                    warn!("{} removing incomplete {}: {}", logprefix, dirname, err);
                    remove_level(&config.bubt.diskpaths, &dirname)?;
                }
                Err(err) => {
                    error!("{} reloading {}: {}", logprefix, dirname, err);
                    return Err(err);
                }
            }
        }
    }
    Ok((disks, versions))
}

/// Remove the files of snapshot `dirname` under every path.
pub(crate) fn remove_level(paths: &[PathBuf], dirname: &str) -> Result<()> {
    for path in paths {
        match fs::remove_dir_all(index_dir(path, dirname)) {
            Ok(()) => {}
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
            Err(err) => return Err(err.into()),
        }
    }
    Ok(())
}

/// Per level details reported by [`BognStats`].
#[derive(Debug, Clone, Serialize)]
pub struct DiskStats {
    pub level: usize,
    pub version: u64,
    pub name: String,
    pub count: usize,
    pub seqno: u64,
    pub footprint: u64,
    pub flushunix: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct BognStats {
    pub name: String,
    pub seqno: u64,
    pub persisted_seqno: u64,
    pub dgm: bool,
    /// Compactor gave up after an error
    pub degraded: bool,
    pub threshold: usize,
    pub memheap: usize,

    pub n_flushes: usize,
    pub n_persists: usize,
    pub n_compactions: usize,
    pub n_purged: usize,
    /// Disk hits the working-set cache had no room for
    pub n_cache_dropped: usize,
    /// Disk hits the working-set cache failed to load
    pub n_cache_failed: usize,
    /// Retired heads waiting for readers to let go
    pub n_retired: usize,
    pub n_txns: usize,
    pub n_commits: usize,
    pub n_aborts: usize,

    pub mw: LlrbStats,
    pub mr: Option<LlrbStats>,
    pub mc: Option<LlrbStats>,
    pub disks: Vec<DiskStats>,
}

/// Key-value index spanning memory and disk levels.
pub struct Bogn {
    shared: Arc<Shared>,
    shutdown: Arc<AtomicBool>,
    /// Dropped to wake and stop the background threads
    finch: Mutex<Option<Sender<()>>>,
    compactor: Mutex<Option<JoinHandle<()>>>,
    purger: Mutex<Option<JoinHandle<()>>>,
    destroyed: AtomicBool,
}

impl Bogn {
    /// Open index `name`, reloading whatever levels the disk paths hold.
    pub fn new(name: &str, config: BognConfig) -> Result<Self> {
        config.validate()?;
        let durable = config.durable;
        let (shared, purge_rx) = Shared::open(name, config)?;
        let shared = Arc::new(shared);
        let shutdown = Arc::new(AtomicBool::new(false));
        let (finch_tx, finch_rx) = bounded::<()>(0);

        let purger = {
            let shared = Arc::downgrade(&shared);
            let finch = finch_rx.clone();
            thread::Builder::new()
                .name(format!("purger-{}", name))
                .spawn(move || purger::run(shared, finch, purge_rx))?
        };
        let compactor = if durable {
            let shared = Arc::downgrade(&shared);
            let shutdown = Arc::clone(&shutdown);
            let handle = thread::Builder::new()
                .name(format!("compactor-{}", name))
                .spawn(move || compaction::run_compactor(shared, shutdown, finch_rx))?;
            Some(handle)
        } else {
            None
        };

        Ok(Self {
            shared,
            shutdown,
            finch: Mutex::new(Some(finch_tx)),
            compactor: Mutex::new(compactor),
            purger: Mutex::new(Some(purger)),
            destroyed: AtomicBool::new(false),
        })
    }

    pub fn id(&self) -> &str {
        &self.shared.name
    }

    /// Newest version of `key`, a tombstone if it was deleted last.
    pub fn get(&self, key: &[u8]) -> Result<Option<Entry>> {
        let head = self.shared.head();
        match head.get(key)? {
            Some((entry, true)) => {
                if let Some(mc) = &head.mc {
                    mc.admit(entry.clone());
                }
                Ok(Some(entry))
            }
            Some((entry, false)) => Ok(Some(entry)),
            None => Ok(None),
        }
    }

    /// Returns the seqno of the write.
    pub fn set(&self, key: &[u8], value: &[u8]) -> Result<u64> {
        self.shared.write(|head| head.mw.set(key, value).map(|(seqno, _)| seqno))
    }

    /// Set only if `key` still carries seqno `cas`, zero meaning absent or
    /// deleted, across every level.
    pub fn set_cas(&self, key: &[u8], value: &[u8], cas: u64) -> Result<u64> {
        self.shared.write(|head| {
            let matched = match head.get(key)? {
                None => cas == 0,
                Some((entry, _)) if entry.deleted => cas == 0,
                Some((entry, _)) => cas != 0 && entry.seqno() == cas,
            };
            if !matched {
                return Err(StorageError::InvalidCas);
            }
            head.mw.set(key, value).map(|(seqno, _)| seqno)
        })
    }

    pub fn delete(&self, key: &[u8]) -> Result<u64> {
        let lsm = self.shared.lsm_deletes();
        self.shared.write(|head| head.mw.delete(key, lsm).map(|(seqno, _)| seqno))
    }

    /// Every live entry in key order.
    pub fn scan(&self) -> BognIter {
        self.scan_range(KeyRange::full(), false)
    }

    /// Live entries within `range`, tombstones and what they shadow hidden.
    pub fn scan_range(&self, range: KeyRange, reverse: bool) -> BognIter {
        HeadView::new(self.shared.head()).iterate(range, reverse, true)
    }

    pub fn begin_txn(&self, id: u64) -> BognTxn<'_> {
        BognTxn::new(id, &self.shared)
    }

    pub fn view(&self, id: u64) -> BognView {
        BognView::new(id, &self.shared)
    }

    /// Move the memory levels into a disk level. False when memory held
    /// nothing to flush or the index is not durable.
    pub fn flush(&self) -> Result<bool> {
        if !self.shared.config.durable {
            return Ok(false);
        }
        let _maint = self.shared.maint.lock();
        self.shared.flush_locked()
    }

    /// Write memory and every disk level into the oldest level, keeping
    /// memory as is.
    pub fn persist(&self) -> Result<bool> {
        if !self.shared.config.durable {
            return Ok(false);
        }
        let _maint = self.shared.maint.lock();
        self.shared.persist_locked()
    }

    /// Merge one pair of disk levels if the compaction policy picks one.
    pub fn compact(&self) -> Result<bool> {
        let _maint = self.shared.maint.lock();
        self.shared.compact_locked()
    }

    pub fn stats(&self) -> BognStats {
        let shared = &self.shared;
        let head = shared.head();
        let counters = &shared.counters;
        let disks = head
            .levels()
            .map(|d| DiskStats {
                level: d.level,
                version: d.version,
                name: d.snapshot.id().to_string(),
                count: d.snapshot.count(),
                seqno: d.seqno(),
                footprint: d.footprint(),
                flushunix: d.meta.flushunix,
            })
            .collect();
        BognStats {
            name: shared.name.clone(),
            seqno: head.seqno(),
            persisted_seqno: shared.persisted_seqno.load(Ordering::Acquire),
            dgm: shared.dgm.load(Ordering::Acquire),
            degraded: shared.degraded.load(Ordering::Acquire),
            threshold: shared.threshold(),
            memheap: head.memheap(),
            n_flushes: counters.n_flushes.load(Ordering::Relaxed),
            n_persists: counters.n_persists.load(Ordering::Relaxed),
            n_compactions: counters.n_compactions.load(Ordering::Relaxed),
            n_purged: shared.purger.n_purged(),
            n_cache_dropped: head.mc.as_ref().map_or(0, |mc| mc.n_dropped()),
            n_cache_failed: head.mc.as_ref().map_or(0, |mc| mc.n_failed()),
            n_retired: shared.purger.pending(),
            n_txns: counters.n_txns.load(Ordering::Relaxed),
            n_commits: counters.n_commits.load(Ordering::Relaxed),
            n_aborts: counters.n_aborts.load(Ordering::Relaxed),
            mw: head.mw.stats(),
            mr: head.mr.as_ref().map(|mr| mr.stats()),
            mc: head.mc.as_ref().map(|mc| mc.index().stats()),
            disks,
        }
    }

    pub fn log(&self) {
        let stats = self.stats();
        let logprefix = &self.shared.logprefix;
        info!(
            "{} seqno:{} persisted:{} dgm:{} memheap:{} threshold:{}",
            logprefix, stats.seqno, stats.persisted_seqno, stats.dgm, stats.memheap, stats.threshold
        );
        info!(
            "{} flushes:{} persists:{} compactions:{} purged:{} retired:{}",
            logprefix, stats.n_flushes, stats.n_persists, stats.n_compactions, stats.n_purged, stats.n_retired
        );
        let head = self.shared.head();
        head.mw.log();
        if let Some(mr) = &head.mr {
            mr.log();
        }
        if let Some(mc) = &head.mc {
            mc.index().log();
        }
        for disk in head.levels() {
            disk.snapshot.log();
        }
    }

    /// Validate every level and the seqno order between them.
    pub fn validate(&self) -> Result<BognStats> {
        let head = self.shared.head();
        head.mw.validate()?;
        if let Some(mr) = &head.mr {
            mr.validate()?;
        }
        if let Some(mc) = &head.mc {
            mc.index().validate()?;
        }
        for disk in head.levels() {
            disk.snapshot.validate()?;
        }
        let seqno = head.mw.get_seqno();
        if let Some(disk) = head.levels().find(|d| d.seqno() > seqno) {
            return Err(StorageError::Validation(format!(
                "{} level {} seqno {} beyond mw seqno {}",
                self.shared.logprefix,
                disk.level,
                disk.seqno(),
                seqno
            )));
        }
        Ok(self.stats())
    }

    /// Stop the background threads and write memory-only data to disk.
    /// Writes fail with `Closed` afterwards, reads keep working.
    pub fn close(&self) -> Result<()> {
        self.shutdown(true)
    }

    /// Close without winding up and remove every file of the index.
    pub fn destroy(&self) -> Result<()> {
        if self.destroyed.swap(true, Ordering::AcqRel) {
            panic!("{} destroyed twice", self.shared.logprefix);
        }
        self.shutdown(false)?;

        let shared = &self.shared;
        let head = shared.head();
        for disk in head.levels() {
            disk.snapshot.destroy()?;
        }
        let paths = &shared.config.bubt.diskpaths;
        if shared.config.durable {
            for path in paths.iter() {
                let dirents = match fs::read_dir(path) {
                    Ok(dirents) => dirents,
                    Err(err) if err.kind() == std::io::ErrorKind::NotFound => continue,
                    Err(err) => return Err(err.into()),
                };
                for dirent in dirents {
                    let dirname = dirent?.file_name().to_string_lossy().into_owned();
                    if parse_level_name(&shared.name, &dirname).is_some() {
                        remove_level(paths, &dirname)?;
                    }
                }
            }
        }
        info!("{} destroyed", shared.logprefix);
        Ok(())
    }

    fn shutdown(&self, windup: bool) -> Result<()> {
        let shared = &self.shared;
        {
            let _writer = shared.writer.lock();
            if shared.closed.swap(true, Ordering::AcqRel) {
                return Ok(());
            }
        }
        self.shutdown.store(true, Ordering::Release);
        drop(self.finch.lock().take());

        let handles = [self.compactor.lock().take(), self.purger.lock().take()];
        for handle in handles.into_iter().flatten() {
            if handle.join().is_err() {
                error!("{} background thread panicked", shared.logprefix);
            }
        }

        let mut res = Ok(());
        if windup && shared.config.durable {
            let _maint = shared.maint.lock();
            res = shared.windup();
        }
        if let Err(err) = shared.purge(true) {
            res = res.and(Err(err));
        }
        match &res {
            Ok(()) => info!("{} closed", shared.logprefix),
            Err(err) => error!("{} close: {}", shared.logprefix, err),
        }
        res
    }
}

impl Reader for Bogn {
    fn get(&self, key: &[u8]) -> Result<Option<Entry>> {
        Bogn::get(self, key)
    }

    /// Merged iteration that keeps tombstones.
    fn iterate(
        &self,
        low: Option<&[u8]>,
        high: Option<&[u8]>,
        incl: Inclusion,
        reverse: bool,
    ) -> Result<EntryIter> {
        let view = HeadView::new(self.shared.head());
        Ok(Box::new(view.iterate(KeyRange::new(low, high, incl), reverse, false)))
    }
}

impl Drop for Bogn {
    fn drop(&mut self) {
        if let Err(err) = self.shutdown(true) {
            error!("{} closing on drop: {}", self.shared.logprefix, err);
        }
    }
}

impl std::fmt::Debug for Bogn {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Bogn").field("name", &self.shared.name).field("head", &self.shared.head()).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{LlrbConfig, MemStore};
    use crate::storage::lsm::compaction::TickState;
    use std::time::{Duration, Instant};
    use tempfile::TempDir;

    fn test_config(dir: &TempDir) -> BognConfig {
        let _ = env_logger::builder().is_test(true).try_init();
        let paths = vec![dir.path().join("p0"), dir.path().join("p1")];
        let mut config = BognConfig::with_paths(paths);
        config.llrb = LlrbConfig::small();
        config.bubt.m_block_size = 512;
        config.bubt.z_block_size = 1024;
        config.bubt.v_block_size = 1024;
        config.compact_tick_ms = 3_600_000;
        config.flush_period_secs = 3600;
        config
    }

    fn key(i: usize) -> Vec<u8> {
        format!("key-{:05}", i).into_bytes()
    }

    fn live_keys(index: &Bogn) -> Vec<Vec<u8>> {
        index.scan().map(|r| r.unwrap().key).collect()
    }

    fn level_dirs(dir: &TempDir, name: &str) -> Vec<String> {
        let mut dirnames: Vec<String> = fs::read_dir(dir.path().join("p0"))
            .unwrap()
            .map(|d| d.unwrap().file_name().to_string_lossy().into_owned())
            .filter(|d| parse_level_name(name, d).is_some())
            .collect();
        dirnames.sort();
        dirnames
    }

    fn wait_until(mut cond: impl FnMut() -> bool) -> bool {
        let deadline = Instant::now() + Duration::from_secs(5);
        while Instant::now() < deadline {
            if cond() {
                return true;
            }
            thread::sleep(Duration::from_millis(5));
        }
        false
    }

    /// Build the current `mw` into `level` and start over with an empty
    /// `mw`, the way a flush does but at a chosen level.
    fn spill(index: &Bogn, level: usize) {
        let shared = &index.shared;
        let _maint = shared.maint.lock();
        let head = shared.head();
        let disk = shared.build_level(level, vec![head.mw.full_iter()], false, head.mw.get_seqno()).unwrap();
        let fresh = Arc::new(shared.new_memindex("mw").unwrap());
        shared.install(|old, id| {
            fresh.set_seqno(old.mw.get_seqno());
            let mut disks = old.disks.clone();
            disks[level] = Some(disk);
            Head { id, mw: Arc::clone(&fresh), mr: None, mc: None, disks }
        });
    }

    #[test]
    fn test_crud() {
        let dir = TempDir::new().unwrap();
        for memstore in [MemStore::Llrb, MemStore::Mvcc] {
            let name = format!("crud-{:?}", memstore).to_lowercase();
            let config = BognConfig { memstore, ..test_config(&dir) };
            let index = Bogn::new(&name, config).unwrap();

            assert_eq!(index.set(b"alice", b"admin").unwrap(), 1);
            assert_eq!(index.set(b"bob", b"user").unwrap(), 2);
            assert_eq!(index.get(b"alice").unwrap().unwrap().value, b"admin");
            assert!(index.get(b"carol").unwrap().is_none());

            assert!(matches!(index.set_cas(b"alice", b"root", 2), Err(StorageError::InvalidCas)));
            assert!(matches!(index.set_cas(b"carol", b"user", 7), Err(StorageError::InvalidCas)));
            assert_eq!(index.set_cas(b"alice", b"root", 1).unwrap(), 3);
            assert_eq!(index.set_cas(b"carol", b"user", 0).unwrap(), 4);

            assert_eq!(index.delete(b"bob").unwrap(), 5);
            let bob = index.get(b"bob").unwrap().unwrap();
            assert!(bob.deleted);
            assert_eq!(bob.seqno(), 5);
            // a deleted key is set again with cas zero
            assert!(matches!(index.set_cas(b"bob", b"x", 5), Err(StorageError::InvalidCas)));
            assert_eq!(index.set_cas(b"bob", b"guest", 0).unwrap(), 6);
            index.delete(b"bob").unwrap();

            assert_eq!(live_keys(&index), vec![b"alice".to_vec(), b"carol".to_vec()]);
            let all: Vec<Entry> = index.iterate(None, None, Inclusion::Both, false).unwrap().map(|r| r.unwrap()).collect();
            assert_eq!(all.len(), 3);
            assert!(all[1].deleted);

            let stats = index.validate().unwrap();
            assert_eq!(stats.seqno, 7);
            index.destroy().unwrap();
        }
    }

    #[test]
    fn test_levels_shadow_older_levels() {
        let dir = TempDir::new().unwrap();
        let index = Bogn::new("shadow", test_config(&dir)).unwrap();
        for i in 0..200 {
            index.set(&key(i), b"v1").unwrap();
        }
        assert!(index.flush().unwrap());
        let stats = index.stats();
        assert_eq!(stats.disks.len(), 1);
        assert_eq!(stats.disks[0].level, NLEVELS - 1);
        assert_eq!(stats.disks[0].count, 200);
        assert_eq!(stats.mw.n_count, 0);

        for i in (0..200).step_by(2) {
            index.set(&key(i), b"v2").unwrap();
        }
        for i in (1..200).step_by(10) {
            index.delete(&key(i)).unwrap();
        }
        for i in 0..200 {
            let entry = index.get(&key(i)).unwrap().unwrap();
            match (i % 2, i % 10) {
                (0, _) => assert_eq!(entry.value, b"v2"),
                (_, 1) => assert!(entry.deleted),
                _ => assert_eq!(entry.value, b"v1"),
            }
        }
        let keys = live_keys(&index);
        assert_eq!(keys.len(), 180);
        assert!(!keys.contains(&key(11)));

        let reverse: Vec<Vec<u8>> = index
            .scan_range(KeyRange::new(Some(&key(10)), Some(&key(20)), Inclusion::Low), true)
            .map(|r| r.unwrap().key)
            .collect();
        let want: Vec<Vec<u8>> = (10..20).rev().filter(|i| i % 10 != 1).map(key).collect();
        assert_eq!(reverse, want);

        assert!(index.flush().unwrap());
        assert!(!index.flush().unwrap());
        for i in (1..200).step_by(10) {
            assert!(index.get(&key(i)).unwrap().map_or(true, |e| e.deleted));
        }
        assert_eq!(live_keys(&index).len(), 180);
        index.validate().unwrap();
    }

    #[test]
    fn test_reload() {
        let dir = TempDir::new().unwrap();
        let seqno = {
            let index = Bogn::new("reload", test_config(&dir)).unwrap();
            for i in 0..300 {
                index.set(&key(i), format!("value-{}", i).as_bytes()).unwrap();
            }
            for i in 0..30 {
                index.delete(&key(i)).unwrap();
            }
            index.close().unwrap();
            assert!(matches!(index.set(b"late", b"x"), Err(StorageError::Closed(_))));
            assert_eq!(index.get(&key(100)).unwrap().unwrap().value, b"value-100");
            index.stats().seqno
        };
        assert_eq!(seqno, 330);
        assert_eq!(level_dirs(&dir, "reload").len(), 1);

        // a crashed build leaves an incomplete newer version behind
        let bogus = level_name("reload", NLEVELS - 1, 99);
        fs::create_dir_all(index_dir(&dir.path().join("p0"), &bogus)).unwrap();

        let index = Bogn::new("reload", test_config(&dir)).unwrap();
        assert_eq!(level_dirs(&dir, "reload").len(), 1);
        let stats = index.stats();
        assert_eq!(stats.seqno, seqno);
        assert_eq!(stats.persisted_seqno, seqno);
        assert_eq!(live_keys(&index).len(), 270);
        assert!(index.get(&key(5)).unwrap().is_none());
        assert_eq!(index.get(&key(299)).unwrap().unwrap().value, b"value-299");
        assert_eq!(index.set(b"next", b"x").unwrap(), seqno + 1);

        assert!(index.persist().unwrap());
        let stats = index.stats();
        assert_eq!(stats.disks[0].version, 100);
        index.close().unwrap();
        drop(index);

        let index = Bogn::new("reload", test_config(&dir)).unwrap();
        assert_eq!(index.get(b"next").unwrap().unwrap().seqno(), seqno + 1);
        index.destroy().unwrap();
        assert!(level_dirs(&dir, "reload").is_empty());
    }

    #[test]
    fn test_dgm_reload() {
        let dir = TempDir::new().unwrap();
        let config = BognConfig { dgm: true, ..test_config(&dir) };
        {
            let index = Bogn::new("dgm", config.clone()).unwrap();
            for i in 0..100 {
                index.set(&key(i), b"first").unwrap();
            }
            index.flush().unwrap();
            for i in 50..150 {
                index.set(&key(i), b"second").unwrap();
            }
        }
        let index = Bogn::new("dgm", config).unwrap();
        assert_eq!(index.stats().seqno, 200);
        assert_eq!(live_keys(&index).len(), 150);
        assert_eq!(index.get(&key(10)).unwrap().unwrap().value, b"first");
        assert_eq!(index.get(&key(60)).unwrap().unwrap().value, b"second");
        assert_eq!(index.stats().mw.n_count, 0);
    }

    #[test]
    fn test_persist() {
        let dir = TempDir::new().unwrap();
        let index = Bogn::new("persist", test_config(&dir)).unwrap();
        assert!(!index.persist().unwrap());

        for i in 0..100 {
            index.set(&key(i), b"v").unwrap();
        }
        index.flush().unwrap();
        for i in 100..200 {
            index.set(&key(i), b"v").unwrap();
        }
        index.delete(&key(0)).unwrap();
        assert!(index.persist().unwrap());
        assert!(!index.persist().unwrap());

        let stats = index.stats();
        assert_eq!(stats.disks.len(), 1);
        assert_eq!(stats.disks[0].level, NLEVELS - 1);
        assert_eq!(stats.disks[0].count, 199);
        assert_eq!(stats.persisted_seqno, 201);
        assert_eq!(stats.n_persists, 1);
        // memory stays in place while the index is not dgm
        assert_eq!(stats.mw.n_count, 101);

        assert!(wait_until(|| {
            index.shared.purge(false).unwrap();
            level_dirs(&dir, "persist").len() == 1
        }));
        index.validate().unwrap();
    }

    #[test]
    fn test_compaction_and_purge() {
        let dir = TempDir::new().unwrap();
        let index = Bogn::new("compact", test_config(&dir)).unwrap();
        for i in 0..100 {
            index.set(&key(i), b"old").unwrap();
        }
        spill(&index, NLEVELS - 1);
        for i in 50..150 {
            index.set(&key(i), b"new").unwrap();
        }
        index.delete(&key(0)).unwrap();
        spill(&index, NLEVELS - 2);

        let stats = index.stats();
        assert_eq!(stats.disks.len(), 2);
        assert!(index.get(&key(0)).unwrap().unwrap().deleted);
        let reader = index.scan();

        assert!(index.compact().unwrap());
        let stats = index.stats();
        assert_eq!(stats.n_compactions, 1);
        assert_eq!(stats.disks.len(), 1);
        assert_eq!(stats.disks[0].level, NLEVELS - 1);
        assert_eq!(stats.disks[0].version, 2);
        // tombstones go once they reach the oldest level
        assert_eq!(stats.disks[0].count, 149);
        assert!(index.get(&key(0)).unwrap().is_none());
        assert_eq!(index.get(&key(10)).unwrap().unwrap().value, b"old");
        assert_eq!(index.get(&key(60)).unwrap().unwrap().value, b"new");

        // the reader still holds the old levels
        index.shared.purge(false).unwrap();
        assert_eq!(level_dirs(&dir, "compact").len(), 3);
        assert_eq!(reader.count(), 149);
        assert!(wait_until(|| {
            index.shared.purge(false).unwrap();
            level_dirs(&dir, "compact").len() == 1
        }));
        assert_eq!(index.stats().n_purged, 2);
        assert!(!index.compact().unwrap());
        index.validate().unwrap();
    }

    #[test]
    fn test_purge_waits_for_older_heads() {
        let dir = TempDir::new().unwrap();
        let index = Bogn::new("chain", test_config(&dir)).unwrap();
        for i in 0..100 {
            index.set(&key(i), b"old").unwrap();
        }
        spill(&index, NLEVELS - 1);
        // this head drops no level when replaced, yet pins level 15
        let reader = index.scan();
        for i in 50..150 {
            index.set(&key(i), b"new").unwrap();
        }
        spill(&index, NLEVELS - 2);
        assert!(index.compact().unwrap());

        assert_eq!(index.shared.purge(false).unwrap(), 0);
        assert_eq!(level_dirs(&dir, "chain").len(), 3);
        assert_eq!(index.stats().n_purged, 0);
        assert_eq!(reader.count(), 100);

        assert!(wait_until(|| {
            index.shared.purge(false).unwrap();
            level_dirs(&dir, "chain").len() == 1
        }));
        assert_eq!(index.stats().n_purged, 2);
        assert_eq!(live_keys(&index).len(), 150);
    }

    #[test]
    fn test_txn() {
        let dir = TempDir::new().unwrap();
        let index = Bogn::new("txn", test_config(&dir)).unwrap();
        index.set(b"a", b"1").unwrap();
        index.set(b"b", b"1").unwrap();
        index.flush().unwrap();
        index.set(b"c", b"1").unwrap();

        let mut txn = index.begin_txn(1);
        assert_eq!(txn.get(b"a").unwrap().unwrap().value, b"1");
        txn.set(b"a", b"2").unwrap();
        txn.set(b"c", b"2").unwrap();
        txn.delete(b"b").unwrap();
        txn.set(b"d", b"2").unwrap();
        assert!(txn.get(b"b").unwrap().is_none());
        assert_eq!(txn.get(b"d").unwrap().unwrap().value, b"2");
        let seqno = txn.commit().unwrap();
        assert_eq!(seqno, 7);
        assert_eq!(index.get(b"a").unwrap().unwrap().value, b"2");
        assert!(index.get(b"b").unwrap().unwrap().deleted);
        assert_eq!(live_keys(&index), vec![b"a".to_vec(), b"c".to_vec(), b"d".to_vec()]);

        let view = index.view(2);
        let mut txn = index.begin_txn(3);
        txn.set(b"a", b"3").unwrap();
        index.set(b"a", b"racing").unwrap();
        assert!(matches!(txn.commit(), Err(StorageError::Rollback)));
        assert_eq!(index.get(b"a").unwrap().unwrap().value, b"racing");
        assert_eq!(view.get(b"a").unwrap().unwrap().value, b"2");
        let scanned: Vec<Vec<u8>> = view.scan(None, None, Inclusion::Both, false).map(|r| r.unwrap().key).collect();
        assert_eq!(scanned.len(), 3);
        view.abort();

        let txn = index.begin_txn(4);
        drop(txn);
        let stats = index.stats();
        assert_eq!((stats.n_txns, stats.n_commits, stats.n_aborts), (3, 1, 2));
    }

    #[test]
    #[should_panic(expected = "read-only")]
    fn test_view_is_read_only() {
        let dir = TempDir::new().unwrap();
        let index = Bogn::new("view", test_config(&dir)).unwrap();
        index.view(1).set(b"a", b"1");
    }

    #[test]
    fn test_tick_persists_when_due() {
        let dir = TempDir::new().unwrap();
        let config = BognConfig { flush_period_secs: 0, ..test_config(&dir) };
        let index = Bogn::new("tick", config).unwrap();
        let mut state = TickState::new();
        index.shared.tick(&mut state).unwrap();
        assert_eq!(index.stats().n_persists, 0);

        for i in 0..50 {
            index.set(&key(i), b"v").unwrap();
        }
        index.shared.tick(&mut state).unwrap();
        index.shared.tick(&mut state).unwrap();
        let stats = index.stats();
        assert_eq!(stats.n_persists, 1);
        assert!(!stats.dgm);
        assert_eq!(stats.persisted_seqno, 50);
    }

    #[test]
    fn test_tick_flushes_in_dgm() {
        let dir = TempDir::new().unwrap();
        let config = BognConfig { dgm: true, flush_period_secs: 0, ..test_config(&dir) };
        let index = Bogn::new("tickdgm", config).unwrap();
        for i in 0..50 {
            index.set(&key(i), b"v").unwrap();
        }
        let mut state = TickState::new();
        index.shared.tick(&mut state).unwrap();
        index.shared.tick(&mut state).unwrap();
        let stats = index.stats();
        assert_eq!(stats.n_flushes, 1);
        assert_eq!(stats.disks.len(), 1);
        assert_eq!(stats.mw.n_count, 0);
        assert!(stats.dgm);
    }

    #[test]
    fn test_workingset_cache() {
        let dir = TempDir::new().unwrap();
        let config = BognConfig { dgm: true, workingset: true, ..test_config(&dir) };
        let index = Bogn::new("cache", config).unwrap();
        for i in 0..50 {
            index.set(&key(i), b"v").unwrap();
        }
        index.flush().unwrap();
        assert!(index.stats().mc.is_some());

        // newer hit first, then an older one
        let newer = index.get(&key(30)).unwrap().unwrap();
        assert!(wait_until(|| index.stats().mc.map_or(false, |mc| mc.n_count == 1)));
        let entry = index.get(&key(7)).unwrap().unwrap();
        assert_eq!((newer.seqno(), entry.seqno()), (31, 8));
        assert!(wait_until(|| index.stats().mc.map_or(false, |mc| mc.n_count == 2)));

        let cached = index.get(&key(7)).unwrap().unwrap();
        assert_eq!(cached.seqno(), entry.seqno());
        assert_eq!(cached.value, entry.value);
        assert_eq!(live_keys(&index).len(), 50);
        let stats = index.validate().unwrap();
        assert_eq!(stats.n_cache_failed, 0);
    }

    #[test]
    fn test_not_durable() {
        let dir = TempDir::new().unwrap();
        let config = BognConfig { durable: false, ..test_config(&dir) };
        let index = Bogn::new("volatile", config).unwrap();
        index.set(b"a", b"1").unwrap();
        index.set(b"b", b"1").unwrap();
        index.delete(b"a").unwrap();
        assert!(index.get(b"a").unwrap().is_none());
        assert!(!index.flush().unwrap());
        assert!(!index.persist().unwrap());
        index.close().unwrap();
        assert!(!dir.path().join("p0").exists());
    }

    #[test]
    fn test_concurrent_writers() {
        let dir = TempDir::new().unwrap();
        let index = Bogn::new("stress", test_config(&dir)).unwrap();
        thread::scope(|s| {
            for t in 0..4 {
                let index = &index;
                s.spawn(move || {
                    for i in 0..250 {
                        index.set(&key(t * 1000 + i), format!("{}", t).as_bytes()).unwrap();
                    }
                });
            }
            s.spawn(|| {
                for _ in 0..5 {
                    index.flush().unwrap();
                    thread::sleep(Duration::from_millis(2));
                }
            });
            s.spawn(|| {
                for _ in 0..20 {
                    let keys = live_keys(&index);
                    assert!(keys.windows(2).all(|w| w[0] < w[1]));
                }
            });
        });
        assert_eq!(live_keys(&index).len(), 1000);
        assert_eq!(index.get(&key(3249)).unwrap().unwrap().value, b"3");
        let stats = index.validate().unwrap();
        assert_eq!(stats.seqno, 1000);
    }

    #[test]
    fn test_snaplock_readers_see_whole_commits() {
        let dir = TempDir::new().unwrap();
        let index = Bogn::new("snaplock", test_config(&dir)).unwrap();
        let round = |index: &Bogn, r: usize| {
            let mut txn = index.begin_txn(r as u64);
            let value = format!("round-{:04}", r).repeat(8);
            for i in 0..64 {
                txn.set(&key(i), value.as_bytes()).unwrap();
            }
            txn.commit().unwrap();
        };
        round(&index, 0);

        let stop = AtomicBool::new(false);
        thread::scope(|s| {
            let readers: Vec<_> = (0..4)
                .map(|_| {
                    s.spawn(|| {
                        let mut n_scans = 0;
                        while !stop.load(Ordering::Acquire) || n_scans == 0 {
                            let values: Vec<Vec<u8>> = index.scan().map(|r| r.unwrap().value).collect();
                            assert_eq!(values.len(), 64);
                            assert!(values.iter().all(|v| v == &values[0]), "torn read");
                            n_scans += 1;
                        }
                        n_scans
                    })
                })
                .collect();
            s.spawn(|| {
                for r in 1..=200 {
                    round(&index, r);
                    if r % 25 == 0 {
                        index.flush().unwrap();
                    }
                }
                stop.store(true, Ordering::Release);
            });
            for reader in readers {
                assert!(reader.join().unwrap() > 0);
            }
        });

        let last = format!("round-{:04}", 200).repeat(8);
        assert_eq!(index.get(&key(63)).unwrap().unwrap().value, last.as_bytes());
        assert!(index.stats().disks.len() >= 1);
        index.validate().unwrap();
    }

    #[test]
    #[should_panic(expected = "destroyed twice")]
    fn test_destroy_twice() {
        let dir = TempDir::new().unwrap();
        let index = Bogn::new("twice", test_config(&dir)).unwrap();
        index.destroy().unwrap();
        let _ = index.destroy();
    }

    #[test]
    fn test_invalid_config() {
        let dir = TempDir::new().unwrap();
        let config = BognConfig { workingset: true, ..test_config(&dir) };
        assert!(matches!(Bogn::new("bad", config), Err(StorageError::InvalidConfig(_))));
    }
}
