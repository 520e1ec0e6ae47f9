//! Flush, persist and disk compaction, and the compactor thread driving them
//!
//! ## Flush (two phase)
//! 1. `{mw, disks}` becomes `{fresh mw, mr: old mw, disks}`, writers move
//!    on to the fresh index right away
//! 2. `mr`, merged with the level it lands in when that level is reused,
//!    is built into a new disk level, then `{mw, disks + new level}` is
//!    installed with a fresh working-set cache
//!
//! ## Persist
//! While the whole data set fits in memory, `mw` and every disk level are
//! periodically rewritten into the oldest level and `mw` stays in place.
//!
//! ## Disk compaction
//! Two adjacent levels are merged into the slot of the older one. A level
//! newer than the other is at least `ratio` of its size, or older than
//! the compaction period, before the pair qualifies.
//!
//! Tombstones are dropped only when the output is the oldest level.
//! Flush, persist and compaction are serialized on `maint`; installing a
//! head is the only step taking `snaplock` for writing.

use super::engine::{remove_level, Shared};
use super::merging_iterator::MergingIterator;
use super::snapshot::{Disk, Head, LevelMeta, NLEVELS};
use crate::config::CompactPolicy;
use crate::storage::bubt::Builder;
use crate::types::{EntryIter, Inclusion};
use crate::{Result, StorageError};
use crossbeam::channel::{bounded, Receiver, RecvTimeoutError, TryRecvError};
use log::{debug, error, info, warn};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

#[derive(Debug, Default)]
pub(crate) struct Counters {
    pub n_flushes: AtomicUsize,
    pub n_persists: AtomicUsize,
    pub n_compactions: AtomicUsize,
    pub n_txns: AtomicUsize,
    pub n_commits: AtomicUsize,
    pub n_aborts: AtomicUsize,
}

/// What the pickers need to know about a disk level.
#[derive(Debug, Clone, Copy, PartialEq)]
pub(crate) struct LevelInfo {
    pub level: usize,
    pub footprint: u64,
    pub flushunix: u64,
}

impl LevelInfo {
    /// Disk levels of `head`, newest first.
    pub fn of(head: &Head) -> Vec<LevelInfo> {
        head.levels()
            .map(|d| LevelInfo { level: d.level, footprint: d.footprint(), flushunix: d.meta.flushunix })
            .collect()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum FlushTarget {
    /// Build a level of its own
    New(usize),
    /// Rewrite an existing level together with the flushed memory
    Merge(usize),
}

/// Where `memheap` bytes of memory go. A new level is opened above the
/// newest one while memory is large relative to it, otherwise memory is
/// merged into the newest level.
pub(crate) fn pick_flush_level(levels: &[LevelInfo], memheap: usize, ratio: f64) -> FlushTarget {
    match levels.first() {
        None => FlushTarget::New(NLEVELS - 1),
        Some(newest) if newest.level > 0 => {
            let footprint = newest.footprint.max(1) as f64;
            if memheap as f64 / footprint > ratio {
                FlushTarget::New(newest.level - 1)
            } else {
                FlushTarget::Merge(newest.level)
            }
        }
        Some(newest) => FlushTarget::Merge(newest.level),
    }
}

/// Adjacent pair to merge, as positions into `levels` (newest first).
pub(crate) fn pick_compaction(
    levels: &[LevelInfo],
    policy: CompactPolicy,
    ratio: f64,
    period_secs: u64,
    now_secs: u64,
) -> Option<(usize, usize)> {
    let ratios: Vec<(usize, f64)> = levels
        .windows(2)
        .enumerate()
        .map(|(i, pair)| (i, pair[0].footprint as f64 / pair[1].footprint.max(1) as f64))
        .collect();
    let over = ratios.iter().copied().filter(|(_, r)| *r >= ratio);
    let picked = match policy {
        CompactPolicy::FirstOverRatio => over.map(|(i, _)| i).next(),
        CompactPolicy::LargestRatio => over
            .max_by(|a, b| a.1.partial_cmp(&b.1).unwrap_or(std::cmp::Ordering::Equal))
            .map(|(i, _)| i),
    };
    picked
        .or_else(|| levels.windows(2).position(|pair| now_secs.saturating_sub(pair[0].flushunix) >= period_secs))
        .map(|i| (i, i + 1))
}

fn now_secs() -> u64 {
    SystemTime::now().duration_since(UNIX_EPOCH).map(|d| d.as_secs()).unwrap_or(0)
}

impl Shared {
    /// Build `sources`, merged newest first, into a new version of `level`.
    pub(crate) fn build_level(
        &self,
        level: usize,
        sources: Vec<EntryIter>,
        drop_tombstones: bool,
        seqno: u64,
    ) -> Result<Disk> {
        let (dirname, version) = self.next_level_name(level);
        let metadata = LevelMeta::now(seqno).encode()?;
        let iter = MergingIterator::new(sources, false, false)
            .filter(move |item| !(drop_tombstones && matches!(item, Ok(entry) if entry.deleted)));

        let start = Instant::now();
        let res = Builder::new(&dirname, &self.config.bubt)
            .and_then(|builder| builder.build(iter, &metadata))
            .and_then(|stats| {
                info!(
                    "{} built level {} version {}, {} entries in {:?}",
                    self.logprefix,
                    level,
                    version,
                    stats.n_count,
                    start.elapsed()
                );
                Disk::open(&dirname, level, version, &self.config.bubt)
            });
        if res.is_err() {
            if let Err(err) = remove_level(&self.config.bubt.diskpaths, &dirname) {
                warn!("{} removing failed build {}: {}", self.logprefix, dirname, err);
            }
        }
        res
    }

    /// Flush memory into a disk level. A previous flush that failed after
    /// its first phase is completed instead of starting a new one.
    pub(crate) fn flush_locked(&self) -> Result<bool> {
        let mut head = self.head();
        if head.mr.is_none() {
            if head.mw.count() == 0 {
                return Ok(false);
            }
            let fresh = Arc::new(self.new_memindex("mw")?);
            head = self.install(|old, id| {
                fresh.set_seqno(old.mw.get_seqno());
                Head {
                    id,
                    mw: Arc::clone(&fresh),
                    mr: Some(Arc::clone(&old.mw)),
                    mc: old.mc.clone(),
                    disks: old.disks.clone(),
                }
            });
        }
        let Some(mr) = head.mr.clone() else {
            return Ok(false);
        };

        let levels = LevelInfo::of(&head);
        let target = pick_flush_level(&levels, mr.footprint(), self.config.ratio);
        let mut sources: Vec<EntryIter> = vec![mr.full_iter()];
        let mut seqno = mr.get_seqno();
        let level = match target {
            FlushTarget::New(level) => level,
            FlushTarget::Merge(level) => {
                if let Some(disk) = &head.disks[level] {
                    sources.push(Box::new(disk.snapshot.iter()));
                    seqno = seqno.max(disk.seqno());
                }
                level
            }
        };
        let drop_tombstones = head.levels().all(|d| d.level <= level);
        info!(
            "{} flushing {} entries ({} bytes) {:?}",
            self.logprefix,
            mr.count(),
            mr.footprint(),
            target
        );

        let ndisk = self.build_level(level, sources, drop_tombstones, seqno)?;
        let mc = self.new_cache()?;
        self.install(|old, id| {
            let mut disks = old.disks.clone();
            disks[level] = Some(ndisk);
            Head { id, mw: Arc::clone(&old.mw), mr: None, mc, disks }
        });
        self.persisted_seqno.fetch_max(mr.get_seqno(), Ordering::AcqRel);
        self.counters.n_flushes.fetch_add(1, Ordering::Relaxed);
        Ok(true)
    }

    /// Rewrite memory and every disk level into the oldest level. False
    /// when nothing changed since the last persist.
    pub(crate) fn persist_locked(&self) -> Result<bool> {
        let head = self.head();
        let snapshot = head.mw.snapshot();
        let persisted = self.persisted_seqno.load(Ordering::Acquire);
        if head.mr.is_none() && snapshot.seqno() <= persisted {
            return Ok(false);
        }

        let mut sources: Vec<EntryIter> = vec![Box::new(snapshot.iterate(None, None, Inclusion::Both, false))];
        let mut seqno = snapshot.seqno();
        if let Some(mr) = &head.mr {
            sources.push(mr.full_iter());
            seqno = seqno.max(mr.get_seqno());
        }
        for disk in head.levels() {
            sources.push(Box::new(disk.snapshot.iter()));
            seqno = seqno.max(disk.seqno());
        }
        info!("{} persisting up to seqno {}", self.logprefix, snapshot.seqno());

        let level = NLEVELS - 1;
        let ndisk = self.build_level(level, sources, true, seqno)?;
        self.install(|old, id| {
            let mut disks: [Option<Disk>; NLEVELS] = Default::default();
            disks[level] = Some(ndisk);
            Head { id, mw: Arc::clone(&old.mw), mr: None, mc: old.mc.clone(), disks }
        });
        self.persisted_seqno.fetch_max(snapshot.seqno(), Ordering::AcqRel);
        self.counters.n_persists.fetch_add(1, Ordering::Relaxed);
        Ok(true)
    }

    fn compaction_pair(&self, head: &Head) -> Option<(Disk, Disk, bool)> {
        let levels = LevelInfo::of(head);
        let config = &self.config;
        let (i, j) = pick_compaction(&levels, config.compact_policy, config.ratio, config.compact_period_secs, now_secs())?;
        let d0 = head.disks[levels[i].level].clone()?;
        let d1 = head.disks[levels[j].level].clone()?;
        Some((d0, d1, j + 1 == levels.len()))
    }

    /// Merge the pair of disk levels the policy picks, if any.
    pub(crate) fn compact_locked(&self) -> Result<bool> {
        let head = self.head();
        let Some((d0, d1, oldest)) = self.compaction_pair(&head) else {
            return Ok(false);
        };
        info!(
            "{} compacting level {} ({} bytes) into level {} ({} bytes)",
            self.logprefix,
            d0.level,
            d0.footprint(),
            d1.level,
            d1.footprint()
        );
        let seqno = d0.seqno().max(d1.seqno());
        let sources: Vec<EntryIter> = vec![Box::new(d0.snapshot.iter()), Box::new(d1.snapshot.iter())];
        let ndisk = self.build_level(d1.level, sources, oldest, seqno)?;
        self.install(|old, id| {
            let mut disks = old.disks.clone();
            disks[d0.level] = None;
            disks[d1.level] = Some(ndisk);
            Head { id, mw: Arc::clone(&old.mw), mr: old.mr.clone(), mc: old.mc.clone(), disks }
        });
        self.counters.n_compactions.fetch_add(1, Ordering::Relaxed);
        Ok(true)
    }

    /// Start over with an empty working-set cache.
    fn reset_cache(&self) -> Result<()> {
        let mc = self.new_cache()?;
        self.install(|old, id| Head { mc, ..old.derive(id) });
        Ok(())
    }

    /// Final write of memory-only data at close.
    pub(crate) fn windup(&self) -> Result<()> {
        if !self.dgm.load(Ordering::Acquire) {
            self.persist_locked()?;
            return Ok(());
        }
        loop {
            let head = self.head();
            let dirty = head.mr.is_some() || head.mw.get_seqno() > self.persisted_seqno.load(Ordering::Acquire);
            if !dirty || !self.flush_locked()? {
                return Ok(());
            }
        }
    }

    /// One compactor step.
    pub(crate) fn tick(self: &Arc<Self>, state: &mut TickState) -> Result<()> {
        if !self.config.durable {
            return Ok(());
        }
        state.poll(false)?;

        let head = self.head();
        let memheap = head.memheap();
        let dirty = head.mr.is_some() || head.mw.get_seqno() > self.persisted_seqno.load(Ordering::Acquire);
        let due = dirty && state.last_flush.elapsed() >= Duration::from_secs(self.config.flush_period_secs);
        let has_cache = head.mc.is_some();
        drop(head);

        if !self.dgm.load(Ordering::Acquire) {
            if memheap <= self.threshold() {
                if due {
                    let _maint = self.maint.lock();
                    self.persist_locked()?;
                    state.last_flush = Instant::now();
                }
                return Ok(());
            }
            info!("{} memheap {} over {}, switching to dgm", self.logprefix, memheap, self.threshold());
            self.dgm.store(true, Ordering::Release);
        }

        if memheap > self.threshold() || due {
            let _maint = self.maint.lock();
            if !self.flush_locked()? && has_cache {
                debug!("{} nothing to flush, dropping the cache", self.logprefix);
                self.reset_cache()?;
            }
            state.last_flush = Instant::now();
        } else if state.inflight.is_none() && self.compaction_pair(&self.head()).is_some() {
            state.inflight = Some(self.spawn_compaction()?);
        }
        Ok(())
    }

    fn spawn_compaction(self: &Arc<Self>) -> Result<Inflight> {
        let (tx, rx) = bounded(1);
        let shared = Arc::clone(self);
        let handle = thread::Builder::new().name(format!("compaction-{}", self.name)).spawn(move || {
            let res = {
                let _maint = shared.maint.lock();
                shared.compact_locked()
            };
            let _ = tx.send(res);
        })?;
        Ok(Inflight { rx, handle })
    }
}

struct Inflight {
    rx: Receiver<Result<bool>>,
    handle: JoinHandle<()>,
}

/// Compactor state carried from tick to tick.
pub(crate) struct TickState {
    last_flush: Instant,
    inflight: Option<Inflight>,
}

impl TickState {
    pub fn new() -> Self {
        Self { last_flush: Instant::now(), inflight: None }
    }

    /// Collect a finished disk compaction, `block` waits for it.
    fn poll(&mut self, block: bool) -> Result<()> {
        let Some(inflight) = &self.inflight else {
            return Ok(());
        };
        let res = if block {
            inflight.rx.recv().ok()
        } else {
            match inflight.rx.try_recv() {
                Ok(res) => Some(res),
                Err(TryRecvError::Empty) => return Ok(()),
                Err(TryRecvError::Disconnected) => None,
            }
        };
        if let Some(inflight) = self.inflight.take() {
            let _ = inflight.handle.join();
        }
        match res {
            Some(res) => res.map(|_| ()),
            None => Err(StorageError::Flusher("disk compaction exited without a result".into())),
        }
    }
}

/// Compactor thread: ticks until the close channel drops, then waits for
/// an in-flight disk compaction. Any error stops it for good, the index
/// stays readable and writable in memory.
pub(crate) fn run_compactor(shared: Weak<Shared>, shutdown: Arc<AtomicBool>, finch: Receiver<()>) {
    let (tick, logprefix) = match shared.upgrade() {
        Some(shared) => (Duration::from_millis(shared.config.compact_tick_ms), shared.logprefix.clone()),
        None => return,
    };
    info!("{} compactor started", logprefix);

    let mut state = TickState::new();
    loop {
        match finch.recv_timeout(tick) {
            Err(RecvTimeoutError::Timeout) => {}
            _ => break,
        }
        if shutdown.load(Ordering::Acquire) {
            break;
        }
        let Some(shared) = shared.upgrade() else { break };
        if let Err(err) = shared.tick(&mut state) {
            error!("{} compactor giving up: {}", logprefix, err);
            shared.degraded.store(true, Ordering::Release);
            break;
        }
    }

    if let Err(err) = state.poll(true) {
        error!("{} disk compaction: {}", logprefix, err);
        if let Some(shared) = shared.upgrade() {
            shared.degraded.store(true, Ordering::Release);
        }
    }
    info!("{} compactor stopped", logprefix);
}

#[cfg(test)]
mod tests {
    use super::*;

    fn info(level: usize, footprint: u64, flushunix: u64) -> LevelInfo {
        LevelInfo { level, footprint, flushunix }
    }

    #[test]
    fn test_pick_flush_level() {
        assert_eq!(pick_flush_level(&[], 1000, 0.5), FlushTarget::New(15));

        let levels = [info(15, 1000, 0)];
        assert_eq!(pick_flush_level(&levels, 600, 0.5), FlushTarget::New(14));
        assert_eq!(pick_flush_level(&levels, 400, 0.5), FlushTarget::Merge(15));

        let levels = [info(0, 1000, 0), info(15, 10_000, 0)];
        assert_eq!(pick_flush_level(&levels, 100_000, 0.5), FlushTarget::Merge(0));
    }

    #[test]
    fn test_pick_compaction_policies() {
        let now = 1_000_000;
        // ratios newest first: 200/1000 = 0.2, 1000/1500 = 0.67, 1500/2000 = 0.75
        let levels = [info(12, 200, now), info(13, 1000, now), info(14, 1500, now), info(15, 2000, now)];
        let first = pick_compaction(&levels, CompactPolicy::FirstOverRatio, 0.5, 300, now);
        assert_eq!(first, Some((1, 2)));
        let largest = pick_compaction(&levels, CompactPolicy::LargestRatio, 0.5, 300, now);
        assert_eq!(largest, Some((2, 3)));

        let small = [info(14, 10, now), info(15, 1000, now)];
        assert_eq!(pick_compaction(&small, CompactPolicy::FirstOverRatio, 0.5, 300, now), None);
        assert_eq!(pick_compaction(&small[..1], CompactPolicy::LargestRatio, 0.1, 300, now), None);
    }

    #[test]
    fn test_pick_compaction_by_age() {
        let now = 1_000_000;
        let levels = [info(13, 10, now), info(14, 10, now - 500), info(15, 10_000, now - 900)];
        // 10/10 is over the ratio anyway
        assert_eq!(pick_compaction(&levels, CompactPolicy::FirstOverRatio, 0.5, 300, now), Some((0, 1)));

        let levels = [info(14, 10, now - 400), info(15, 10_000, now - 900)];
        assert_eq!(pick_compaction(&levels, CompactPolicy::FirstOverRatio, 0.5, 300, now), Some((0, 1)));
        assert_eq!(pick_compaction(&levels, CompactPolicy::FirstOverRatio, 0.5, 600, now), None);
    }
}
