//! Read-only view over a built snapshot
//!
//! ## Opening
//! The m-index file is read from its tail: the marker run gives the
//! m-block size, the u64 in front of the marker gives the metadata length,
//! the settings block sits right before the metadata region. Every file is
//! shared-locked and checked for its marker before the first read.

use super::iter::BubtIter;
use super::mblock::{Child, MBlockView};
use super::reader::{BufferPool, SnapFile};
use super::settings::{metadata_region, Settings};
use super::zblock::{ZBlockView, ZEntry, ZValue};
use super::{index_dir, mindex_file, vlog_file, zindex_file};
use crate::config::{MAX_BLOCKSIZE, MIN_BLOCKSIZE};
use crate::types::{Entry, EntryIter, Inclusion, KeyRange, Reader};
use crate::{Result, StorageError};
use log::{info, warn};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

/// Scratch buffers kept per block size
const POOL_BUFFERS: usize = 16;

pub(crate) struct Inner {
    pub name: String,
    pub logprefix: String,
    pub paths: Vec<PathBuf>,
    pub settings: Settings,
    pub metadata: Vec<u8>,
    mindex: SnapFile,
    zfiles: Vec<SnapFile>,
    vlogs: Vec<SnapFile>,
    mpool: BufferPool,
    zpool: BufferPool,
    footprint: u64,
    refs: AtomicUsize,
    destroyed: AtomicBool,
}

impl Inner {
    pub fn read_mblock(&self, offset: u64) -> Result<Vec<u8>> {
        let mut buf = self.mpool.get();
        self.mindex.read_at(offset, &mut buf)?;
        Ok(buf)
    }

    pub fn read_zblock(&self, shard: usize, offset: u64) -> Result<Vec<u8>> {
        let file = self
            .zfiles
            .get(shard)
            .ok_or_else(|| StorageError::CorruptSnapshot(format!("no z shard {}", shard)))?;
        let mut buf = self.zpool.get();
        file.read_at(offset, &mut buf)?;
        Ok(buf)
    }

    pub fn recycle_m(&self, buf: Vec<u8>) {
        self.mpool.put(buf)
    }

    pub fn recycle_z(&self, buf: Vec<u8>) {
        self.zpool.put(buf)
    }

    /// Entry with its value, read from the value log if needed.
    pub fn resolve(&self, shard: usize, zentry: &ZEntry) -> Result<Entry> {
        let value = match zentry.value {
            ZValue::Inline(value) => value.to_vec(),
            ZValue::Vlog(fpos) => {
                let vlog = self
                    .vlogs
                    .get(shard)
                    .ok_or_else(|| StorageError::CorruptSnapshot(format!("no vlog shard {}", shard)))?;
                let len = vlog.read_u64(fpos)? as usize;
                let mut value = vec![0u8; len];
                vlog.read_at(fpos + 8, &mut value)?;
                value
            }
        };
        Ok(zentry.to_entry(value))
    }

    /// Point lookup, `resolve` false leaves value-log values unread.
    pub fn get(&self, key: &[u8], resolve: bool) -> Result<Option<Entry>> {
        let mut child = match self.settings.rootblock {
            Some(root) => Child::MBlock(root),
            None => return Ok(None),
        };
        loop {
            match child {
                Child::MBlock(offset) => {
                    let buf = self.read_mblock(offset)?;
                    let next = MBlockView::new(&buf).and_then(|view| match view.floor(key)? {
                        Some(i) => view.child(i).map(Some),
                        None => Ok(None),
                    });
                    self.recycle_m(buf);
                    match next? {
                        Some(next) => child = next,
                        None => return Ok(None),
                    }
                }
                Child::ZBlock { shard, offset } => {
                    let buf = self.read_zblock(shard, offset)?;
                    let res = ZBlockView::new(&buf).and_then(|view| match view.search(key)? {
                        Ok(i) => {
                            let zentry = view.entry(i)?;
                            match (resolve, zentry.value) {
                                (false, ZValue::Vlog(_)) => Ok(Some(zentry.to_entry(Vec::new()))),
                                _ => self.resolve(shard, &zentry).map(Some),
                            }
                        }
                        Err(_) => Ok(None),
                    });
                    self.recycle_z(buf);
                    return res;
                }
            }
        }
    }
}

/// Shared handle to an opened snapshot, clones share files and buffers.
#[derive(Clone)]
pub struct Snapshot {
    inner: Arc<Inner>,
}

impl Snapshot {
    /// Open snapshot `name` laid out under `paths`, the first path holds
    /// the m-index.
    pub fn open(name: &str, paths: &[PathBuf], mmap: bool) -> Result<Self> {
        let logprefix = format!("BUBT [{}]", name);
        let first = paths
            .first()
            .ok_or_else(|| StorageError::InvalidConfig("no disk paths".into()))?;

        let mindex = SnapFile::open(mindex_file(first, name), false)?;
        let msize = mindex.marker_run(MAX_BLOCKSIZE as u64)? / 32 * 32;
        if msize < MIN_BLOCKSIZE as u64 {
            return Err(StorageError::InvalidMarker(mindex.path().to_path_buf()));
        }
        let marker_at = mindex.size() - msize;
        if marker_at < 8 {
            return Err(corrupt(name, "m-index too small"));
        }
        let mdlen = mindex.read_u64(marker_at - 8)?;
        let region = metadata_region(mdlen, msize);
        if region + msize > marker_at {
            return Err(corrupt(name, "truncated metadata"));
        }
        let md_at = marker_at - region;
        let mut metadata = vec![0u8; mdlen as usize];
        mindex.read_at(md_at, &mut metadata)?;

        let mut block = vec![0u8; msize as usize];
        mindex.read_at(md_at - msize, &mut block)?;
        let settings = Settings::decode(&block)?;
        if settings.name != name {
            return Err(corrupt(name, &format!("settings name {:?}", settings.name)));
        }
        if settings.mblocksize as u64 != msize {
            return Err(corrupt(name, &format!("mblocksize {} marker {}", settings.mblocksize, msize)));
        }
        if settings.n_zshards == 0 || settings.n_zshards > paths.len() {
            return Err(corrupt(name, &format!("{} z shards, {} paths", settings.n_zshards, paths.len())));
        }

        let mut zfiles = Vec::with_capacity(settings.n_zshards);
        let mut vlogs = Vec::new();
        for (shard, path) in paths.iter().take(settings.n_zshards).enumerate() {
            let zfile = SnapFile::open(zindex_file(path, name, shard), mmap)?;
            zfile.check_marker(settings.zblocksize)?;
            zfiles.push(zfile);
            if settings.vlog {
                let vfile = SnapFile::open(vlog_file(path, name, shard), mmap)?;
                vfile.check_marker(settings.vblocksize)?;
                vlogs.push(vfile);
            }
        }

        let footprint = mindex.size()
            + zfiles.iter().map(|f| f.size()).sum::<u64>()
            + vlogs.iter().map(|f| f.size()).sum::<u64>();
        let inner = Inner {
            name: name.to_string(),
            logprefix,
            paths: paths.iter().take(settings.n_zshards).cloned().collect(),
            mpool: BufferPool::new(settings.mblocksize, POOL_BUFFERS),
            zpool: BufferPool::new(settings.zblocksize, POOL_BUFFERS),
            settings,
            metadata,
            mindex,
            zfiles,
            vlogs,
            footprint,
            refs: AtomicUsize::new(0),
            destroyed: AtomicBool::new(false),
        };
        let snapshot = Snapshot { inner: Arc::new(inner) };
        snapshot.validate_quick()?;

        info!(
            "{} opened, {} entries footprint {}",
            snapshot.inner.logprefix, snapshot.inner.settings.n_count, footprint
        );
        Ok(snapshot)
    }

    pub fn id(&self) -> &str {
        &self.inner.name
    }

    pub fn settings(&self) -> &Settings {
        &self.inner.settings
    }

    /// Application metadata sealed with the snapshot.
    pub fn metadata(&self) -> &[u8] {
        &self.inner.metadata
    }

    pub fn count(&self) -> usize {
        self.inner.settings.n_count
    }

    pub fn seqno(&self) -> u64 {
        self.inner.settings.seqno
    }

    /// Bytes on disk across all files.
    pub fn footprint(&self) -> u64 {
        self.inner.footprint
    }

    pub fn paths(&self) -> &[PathBuf] {
        &self.inner.paths
    }

    pub fn get(&self, key: &[u8]) -> Result<Option<Entry>> {
        self.inner.get(key, true)
    }

    /// Like `get`, value-log values come back empty.
    pub fn lookup(&self, key: &[u8]) -> Result<Option<Entry>> {
        self.inner.get(key, false)
    }

    pub fn min(&self) -> Result<Option<Entry>> {
        self.iter_range(KeyRange::full(), false).next().transpose()
    }

    pub fn max(&self) -> Result<Option<Entry>> {
        self.iter_range(KeyRange::full(), true).next().transpose()
    }

    /// Full scan in key order.
    pub fn iter(&self) -> BubtIter {
        self.iter_range(KeyRange::full(), false)
    }

    pub fn iter_range(&self, range: KeyRange, reverse: bool) -> BubtIter {
        BubtIter::new(Arc::clone(&self.inner), range, reverse)
    }

    /// Take a reference, `destroy` fails while any is held.
    pub fn refer(&self) -> usize {
        self.inner.refs.fetch_add(1, Ordering::AcqRel) + 1
    }

    pub fn release(&self) -> usize {
        let prev = self.inner.refs.fetch_sub(1, Ordering::AcqRel);
        assert!(prev > 0, "{} release without refer", self.inner.logprefix);
        prev - 1
    }

    pub fn refs(&self) -> usize {
        self.inner.refs.load(Ordering::Acquire)
    }

    /// Remove every file of this snapshot. Open handles keep reading the
    /// unlinked files.
    pub fn destroy(&self) -> Result<()> {
        let refs = self.refs();
        if refs > 0 {
            return Err(StorageError::SnapshotInUse(format!("{} has {} refs", self.inner.name, refs)));
        }
        if self.inner.destroyed.swap(true, Ordering::AcqRel) {
            panic!("{} destroyed twice", self.inner.logprefix);
        }
        for path in self.inner.paths.iter() {
            remove_index_dir(path, &self.inner.name)?;
        }
        info!("{} destroyed", self.inner.logprefix);
        Ok(())
    }

    /// Cross-check file sizes against the settings.
    pub fn validate_quick(&self) -> Result<()> {
        let inner = &self.inner;
        let s = &inner.settings;
        let (msize, zsize, vsize) = (s.mblocksize as u64, s.zblocksize as u64, s.vblocksize as u64);

        let want = (s.n_mblocks as u64 + 1) * msize + metadata_region(inner.metadata.len() as u64, msize) + msize;
        if inner.mindex.size() != want {
            return Err(corrupt(&inner.name, &format!("m-index {} bytes, want {}", inner.mindex.size(), want)));
        }
        let zbytes: u64 = inner.zfiles.iter().map(|f| f.size()).sum();
        let want = (s.n_zblocks + s.n_zshards) as u64 * zsize;
        if zbytes != want {
            return Err(corrupt(&inner.name, &format!("z shards {} bytes, want {}", zbytes, want)));
        }
        if s.vlog {
            let vbytes: u64 = inner.vlogs.iter().map(|f| f.size()).sum();
            let want = (s.n_vblocks + s.n_zshards) as u64 * vsize;
            if vbytes != want {
                return Err(corrupt(&inner.name, &format!("vlogs {} bytes, want {}", vbytes, want)));
            }
        }
        match s.rootblock {
            Some(root) if root >= s.n_mblocks as u64 * msize => {
                Err(corrupt(&inner.name, &format!("root {} beyond m-blocks", root)))
            }
            None if s.n_count > 0 => Err(corrupt(&inner.name, "entries without root")),
            _ => Ok(()),
        }
    }

    /// Full scan: key order and every counter in the settings.
    pub fn validate(&self) -> Result<()> {
        let s = &self.inner.settings;
        let (mut n_count, mut n_deleted, mut keymem, mut valmem) = (0, 0, 0, 0);
        let mut prev: Option<Vec<u8>> = None;
        for entry in self.iter() {
            let entry = entry?;
            if let Some(prev) = &prev {
                if prev >= &entry.key {
                    return Err(StorageError::Validation(format!(
                        "{} key order broken at {:?}",
                        self.inner.logprefix,
                        String::from_utf8_lossy(&entry.key)
                    )));
                }
            }
            if entry.seqno() > s.seqno {
                return Err(StorageError::Validation(format!(
                    "{} seqno {} beyond {}",
                    self.inner.logprefix,
                    entry.seqno(),
                    s.seqno
                )));
            }
            n_count += 1;
            if entry.deleted {
                n_deleted += 1;
            }
            keymem += entry.key.len();
            valmem += entry.value.len();
            prev = Some(entry.key);
        }

        let checks = [
            ("n_count", n_count, s.n_count),
            ("n_deleted", n_deleted, s.n_deleted),
            ("keymem", keymem, s.keymem),
            ("valmem", valmem, s.valmem),
        ];
        for (what, got, want) in checks {
            if got != want {
                return Err(StorageError::Validation(format!(
                    "{} {} {} != {}",
                    self.inner.logprefix, what, got, want
                )));
            }
        }
        Ok(())
    }

    pub fn log(&self) {
        let s = &self.inner.settings;
        info!(
            "{} count {} deleted {} seqno {} keymem {} valmem {} padding {} footprint {}",
            self.inner.logprefix, s.n_count, s.n_deleted, s.seqno, s.keymem, s.valmem, s.paddingmem,
            self.inner.footprint
        );
    }
}

impl std::fmt::Debug for Snapshot {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Snapshot")
            .field("name", &self.inner.name)
            .field("count", &self.inner.settings.n_count)
            .field("footprint", &self.inner.footprint)
            .finish()
    }
}

impl Reader for Snapshot {
    fn get(&self, key: &[u8]) -> Result<Option<Entry>> {
        Snapshot::get(self, key)
    }

    fn iterate(
        &self,
        low: Option<&[u8]>,
        high: Option<&[u8]>,
        incl: Inclusion,
        reverse: bool,
    ) -> Result<EntryIter> {
        Ok(Box::new(self.iter_range(KeyRange::new(low, high, incl), reverse)))
    }
}

fn corrupt(name: &str, what: &str) -> StorageError {
    StorageError::CorruptSnapshot(format!("{}: {}", name, what))
}

fn remove_index_dir(path: &Path, name: &str) -> Result<()> {
    let dir = index_dir(path, name);
    match fs::remove_dir_all(&dir) {
        Ok(()) => Ok(()),
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
            warn!("BUBT [{}] {:?} already gone", name, dir);
            Ok(())
        }
        Err(err) => Err(err.into()),
    }
}
