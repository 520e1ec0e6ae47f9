//! Bottoms-up construction of a snapshot from a sorted entry stream
//!
//! ## Build Steps
//! 1. Entries fill the current z-block, a full z-block goes to its shard's
//!    flusher (z-blocks rotate across shards) together with the pending
//!    value-log batch of that shard.
//! 2. The first key of every flushed z-block is pushed into the level-0
//!    m-block, a full m-block is flushed and its first key pushed one level
//!    up, and so on.
//! 3. On finish the partial blocks are flushed bottom up, the single block
//!    of the topmost level becomes the root.
//! 4. Settings and application metadata close the m-index file, every
//!    flusher then writes its marker.

use super::flusher::Flusher;
use super::mblock::{Child, MBlockBuilder};
use super::settings::{encode_metadata, BuildStats, Settings};
use super::vlog::VlogBuffer;
use super::zblock::ZBlockBuilder;
use super::{index_dir, mindex_file, vlog_file, zindex_file};
use crate::config::BubtConfig;
use crate::types::Entry;
use crate::{Result, StorageError};
use log::{debug, error, info};
use std::fs;
use std::time::{Instant, SystemTime, UNIX_EPOCH};

/// Writes one snapshot, consumed by [`Builder::build`].
pub struct Builder {
    name: String,
    logprefix: String,
    config: BubtConfig,
    mflusher: Flusher,
    zflushers: Vec<Flusher>,
    vflushers: Vec<Flusher>,
}

impl Builder {
    /// Create the index directories and start one flusher per file.
    pub fn new(name: &str, config: &BubtConfig) -> Result<Self> {
        config.validate()?;
        let logprefix = format!("BUBT [{}]", name);

        for path in config.diskpaths.iter() {
            fs::create_dir_all(index_dir(path, name))?;
        }
        let queue = config.flush_queue;
        let mflusher = Flusher::new(
            &mindex_file(&config.diskpaths[0], name),
            config.m_block_size,
            queue,
            &logprefix,
        )?;
        let zflushers = config
            .diskpaths
            .iter()
            .enumerate()
            .map(|(shard, path)| {
                Flusher::new(&zindex_file(path, name, shard), config.z_block_size, queue, &logprefix)
            })
            .collect::<Result<Vec<_>>>()?;
        let vflushers = if config.vlog {
            config
                .diskpaths
                .iter()
                .enumerate()
                .map(|(shard, path)| {
                    Flusher::new(&vlog_file(path, name, shard), config.v_block_size, queue, &logprefix)
                })
                .collect::<Result<Vec<_>>>()?
        } else {
            Vec::new()
        };

        info!(
            "{} builder started, {} shard(s) msize {} zsize {} vlog {}",
            logprefix,
            zflushers.len(),
            config.m_block_size,
            config.z_block_size,
            config.vlog
        );
        Ok(Self {
            name: name.to_string(),
            logprefix,
            config: config.clone(),
            mflusher,
            zflushers,
            vflushers,
        })
    }

    /// Consume `iter`, which must yield strictly increasing keys, and seal
    /// the snapshot with `metadata`. On error no file is sealed.
    pub fn build<I>(self, iter: I, metadata: &[u8]) -> Result<BuildStats>
    where
        I: Iterator<Item = Result<Entry>>,
    {
        let Builder { name, logprefix, config, mflusher, zflushers, vflushers } = self;

        let res = {
            let mut state = BuildState::new(&name, &config, &mflusher, &zflushers, &vflushers);
            state.consume(iter).and_then(|()| state.finish(metadata))
        };

        match res {
            Ok(settings) => {
                let mut first_err = None;
                let flushers = std::iter::once(mflusher).chain(zflushers).chain(vflushers);
                for flusher in flushers {
                    if let Err(err) = flusher.close() {
                        first_err.get_or_insert(err);
                    }
                }
                if let Some(err) = first_err {
                    error!("{} closing flushers: {}", logprefix, err);
                    return Err(err);
                }
                info!(
                    "{} built {} entries ({} deleted), {} z-blocks {} m-blocks in {:?}",
                    logprefix,
                    settings.n_count,
                    settings.n_deleted,
                    settings.n_zblocks,
                    settings.n_mblocks,
                    std::time::Duration::from_nanos(settings.buildtime)
                );
                Ok(settings)
            }
            Err(err) => {
                let flushers = std::iter::once(mflusher).chain(zflushers).chain(vflushers);
                let mut first_err = None;
                for flusher in flushers {
                    if let Some(err) = flusher.abort() {
                        first_err.get_or_insert(err);
                    }
                }
                let err = first_err.unwrap_or(err);
                error!("{} build failed: {}", logprefix, err);
                Err(err)
            }
        }
    }
}

struct MLevel {
    block: MBlockBuilder,
    /// Blocks already flushed at this level
    flushed: usize,
}

struct BuildState<'a> {
    config: &'a BubtConfig,
    mflusher: &'a Flusher,
    zflushers: &'a [Flusher],
    vflushers: &'a [Flusher],

    zblock: ZBlockBuilder,
    /// Next free offset in each z shard
    zoffsets: Vec<u64>,
    vlogs: Vec<VlogBuffer>,
    levels: Vec<MLevel>,
    prev_key: Option<Vec<u8>>,

    settings: Settings,
    start: Instant,
}

impl<'a> BuildState<'a> {
    fn new(
        name: &str,
        config: &'a BubtConfig,
        mflusher: &'a Flusher,
        zflushers: &'a [Flusher],
        vflushers: &'a [Flusher],
    ) -> Self {
        let epoch = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_nanos() as u64)
            .unwrap_or(0);
        let settings = Settings {
            name: name.to_string(),
            zblocksize: config.z_block_size,
            mblocksize: config.m_block_size,
            vblocksize: config.v_block_size,
            epoch,
            n_zshards: zflushers.len(),
            vlog: config.vlog,
            ..Default::default()
        };
        Self {
            config,
            mflusher,
            zflushers,
            vflushers,
            zblock: ZBlockBuilder::new(config.z_block_size),
            zoffsets: vec![0; zflushers.len()],
            vlogs: vflushers.iter().map(|_| VlogBuffer::new(config.v_block_size, 0)).collect(),
            levels: Vec::new(),
            prev_key: None,
            settings,
            start: Instant::now(),
        }
    }

    fn shard(&self) -> usize {
        self.settings.n_zblocks % self.zflushers.len()
    }

    fn consume<I>(&mut self, iter: I) -> Result<()>
    where
        I: Iterator<Item = Result<Entry>>,
    {
        for entry in iter {
            let entry = entry?;
            if let Some(prev) = &self.prev_key {
                if prev.as_slice() >= entry.key.as_slice() {
                    return Err(StorageError::Validation(format!(
                        "unsorted input, {:?} after {:?}",
                        String::from_utf8_lossy(&entry.key),
                        String::from_utf8_lossy(prev)
                    )));
                }
            }
            self.add(&entry)?;
            self.prev_key = Some(entry.key);
        }
        Ok(())
    }

    fn add(&mut self, entry: &Entry) -> Result<()> {
        let shard = self.shard();
        if !self.zblock.insert(entry, self.vlogs.get_mut(shard))? {
            self.flush_z()?;
            let shard = self.shard();
            if !self.zblock.insert(entry, self.vlogs.get_mut(shard))? {
                return Err(StorageError::EntryExceedsBlockSize {
                    size: entry.footprint(),
                    blocksize: self.config.z_block_size,
                });
            }
        }

        let settings = &mut self.settings;
        settings.n_count += 1;
        if entry.deleted {
            settings.n_deleted += 1;
        }
        settings.keymem += entry.key.len();
        settings.valmem += entry.value.len();
        settings.seqno = settings.seqno.max(entry.bornseqno).max(entry.deadseqno);
        Ok(())
    }

    fn flush_z(&mut self) -> Result<()> {
        if self.zblock.is_empty() {
            return Ok(());
        }
        let shard = self.shard();
        let first_key = self.zblock.first_key().to_vec();
        let (block, padding) = self.zblock.finalize();

        let offset = self.zoffsets[shard];
        self.zoffsets[shard] += block.len() as u64;
        self.zflushers[shard].send(block)?;

        if let Some(vlog) = self.vlogs.get_mut(shard) {
            if let Some((batch, vpadding)) = vlog.take_batch() {
                self.settings.n_vblocks += batch.len() / self.config.v_block_size;
                self.settings.paddingmem += vpadding;
                self.vflushers[shard].send(batch)?;
            }
        }

        self.settings.n_zblocks += 1;
        self.settings.paddingmem += padding;
        debug!("zblock shard {} offset {} padding {}", shard, offset, padding);

        self.push_child(0, &first_key, Child::ZBlock { shard, offset }.encode())
    }

    fn push_child(&mut self, level: usize, key: &[u8], ptr: u64) -> Result<()> {
        if self.levels.len() == level {
            self.levels.push(MLevel { block: MBlockBuilder::new(self.config.m_block_size), flushed: 0 });
        }
        if self.levels[level].block.insert(key, ptr)? {
            return Ok(());
        }

        let (first_key, mptr) = self.flush_m(level)?;
        self.push_child(level + 1, &first_key, mptr)?;
        if !self.levels[level].block.insert(key, ptr)? {
            return Err(StorageError::EntryExceedsBlockSize {
                size: key.len() + 10,
                blocksize: self.config.m_block_size,
            });
        }
        Ok(())
    }

    /// Flush the m-block at `level`, returns its first key and pointer.
    fn flush_m(&mut self, level: usize) -> Result<(Vec<u8>, u64)> {
        let (block, first_key, padding) = self.levels[level].block.finalize();
        let offset = (self.settings.n_mblocks * self.config.m_block_size) as u64;
        self.mflusher.send(block)?;

        self.settings.n_mblocks += 1;
        self.settings.paddingmem += padding;
        self.levels[level].flushed += 1;
        Ok((first_key, Child::MBlock(offset).encode()))
    }

    fn finish(&mut self, metadata: &[u8]) -> Result<Settings> {
        self.flush_z()?;

        let mut rootblock = None;
        let mut level = 0;
        while level < self.levels.len() {
            if self.levels[level].block.is_empty() {
                level += 1;
                continue;
            }
            let top = level + 1 == self.levels.len();
            let (first_key, ptr) = self.flush_m(level)?;
            if top && self.levels[level].flushed == 1 {
                rootblock = Some(ptr);
                break;
            }
            self.push_child(level + 1, &first_key, ptr)?;
            level += 1;
        }

        let msize = self.config.m_block_size;
        self.settings.rootblock = rootblock;
        self.settings.buildtime = self.start.elapsed().as_nanos() as u64;
        self.mflusher.send(self.settings.encode(msize)?)?;
        self.mflusher.send(encode_metadata(metadata, msize))?;
        Ok(self.settings.clone())
    }
}
