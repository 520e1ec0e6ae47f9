//! Engine configuration
//!
//! Every component takes a plain serde-derived config struct. `BognConfig`
//! also understands the flat dotted settings map (`"bubt.msize"`, ...) that
//! applications hand over when opening an index.

use crate::{Result, StorageError};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::PathBuf;

/// Smallest block size for z-blocks, m-blocks and value-log blocks.
pub const MIN_BLOCKSIZE: usize = 512;

/// Largest block size for z-blocks, m-blocks and value-log blocks.
pub const MAX_BLOCKSIZE: usize = 1024 * 1024 * 1024;

/// Memory arena configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ArenaConfig {
    /// Total memory the arena may hand out, in bytes
    pub capacity: usize,

    /// Smallest size class
    pub min_block: usize,

    /// Largest size class, allocations above this fail
    pub max_block: usize,

    /// Upper bound on bytes owned by a single pool
    pub pool_capacity: usize,

    /// Upper bound on chunks in a single pool, rounded down to a multiple of 8
    pub max_chunks: usize,
}

impl Default for ArenaConfig {
    fn default() -> Self {
        Self {
            capacity: 64 * 1024 * 1024,  // 64MB
            min_block: 32,
            max_block: 1024 * 1024,      // 1MB
            pool_capacity: 1024 * 1024,  // 1MB per pool
            max_chunks: 20 * 1024,
        }
    }
}

impl ArenaConfig {
    pub fn validate(&self) -> Result<()> {
        if self.min_block == 0 || self.min_block > self.max_block {
            return Err(StorageError::InvalidConfig(format!(
                "arena min_block {} / max_block {}", self.min_block, self.max_block
            )));
        }
        if self.max_block > self.capacity {
            return Err(StorageError::InvalidConfig(format!(
                "arena max_block {} exceeds capacity {}", self.max_block, self.capacity
            )));
        }
        if self.max_chunks < 8 {
            return Err(StorageError::InvalidConfig("arena max_chunks must be >= 8".into()));
        }
        Ok(())
    }
}

/// In-memory index configuration, shared by `Llrb` and `Mvcc`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LlrbConfig {
    /// Arena capacity for nodes (metadata + key)
    pub key_capacity: usize,

    /// Arena capacity for values
    pub val_capacity: usize,

    /// Largest key accepted
    pub max_keysize: usize,

    /// Largest value accepted
    pub max_valsize: usize,

    /// Upper bound on bytes owned by a single arena pool
    pub pool_capacity: usize,

    /// Keep born-seqno in node metadata
    pub bornseqno: bool,

    /// Keep dead-seqno in node metadata
    pub deadseqno: bool,

    /// Keep vbuuid in node metadata
    pub vbuuid: bool,
}

impl Default for LlrbConfig {
    fn default() -> Self {
        Self {
            key_capacity: 64 * 1024 * 1024,
            val_capacity: 64 * 1024 * 1024,
            max_keysize: 4096,
            max_valsize: 1024 * 1024,
            pool_capacity: 1024 * 1024,
            bornseqno: true,
            deadseqno: true,
            vbuuid: true,
        }
    }
}

impl LlrbConfig {
    /// Small capacities, handy for tests and embedded use
    pub fn small() -> Self {
        Self {
            key_capacity: 8 * 1024 * 1024,
            val_capacity: 8 * 1024 * 1024,
            pool_capacity: 256 * 1024,
            ..Default::default()
        }
    }

    pub fn validate(&self) -> Result<()> {
        self.key_arena().validate()?;
        self.val_arena().validate()
    }

    /// Arena backing node metadata and keys
    pub fn key_arena(&self) -> ArenaConfig {
        ArenaConfig {
            capacity: self.key_capacity,
            min_block: 32,
            max_block: (self.max_keysize + 128).next_power_of_two(),
            pool_capacity: self.pool_capacity,
            ..Default::default()
        }
    }

    /// Arena backing values
    pub fn val_arena(&self) -> ArenaConfig {
        ArenaConfig {
            capacity: self.val_capacity,
            min_block: 32,
            max_block: self.max_valsize.next_power_of_two(),
            pool_capacity: self.pool_capacity.max(self.max_valsize.next_power_of_two() * 8),
            ..Default::default()
        }
    }
}

/// Bottoms-up btree configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BubtConfig {
    /// Directories holding index files, the first one also holds the m-index
    pub diskpaths: Vec<PathBuf>,

    /// Intermediate block size
    pub m_block_size: usize,

    /// Leaf block size
    pub z_block_size: usize,

    /// Value-log block size
    pub v_block_size: usize,

    /// Store values in separate value-log files
    pub vlog: bool,

    /// Memory map leaf and value-log files on open
    pub mmap: bool,

    /// Bound on blocks queued per flusher
    pub flush_queue: usize,
}

impl Default for BubtConfig {
    fn default() -> Self {
        Self {
            diskpaths: vec![PathBuf::from("/opt/bogn/")],
            m_block_size: 4096,
            z_block_size: 4096,
            v_block_size: 4096 * 4,
            vlog: false,
            mmap: true,
            flush_queue: 64,
        }
    }
}

impl BubtConfig {
    pub fn with_paths(diskpaths: Vec<PathBuf>) -> Self {
        Self { diskpaths, ..Default::default() }
    }

    pub fn validate(&self) -> Result<()> {
        if self.diskpaths.is_empty() {
            return Err(StorageError::InvalidConfig("bubt.diskpaths is empty".into()));
        }
        if self.diskpaths.len() > 255 {
            return Err(StorageError::InvalidConfig("too many bubt.diskpaths".into()));
        }
        let sizes = [
            ("msize", self.m_block_size),
            ("zsize", self.z_block_size),
            ("vsize", self.v_block_size),
        ];
        for (name, size) in sizes {
            if !(MIN_BLOCKSIZE..=MAX_BLOCKSIZE).contains(&size) {
                return Err(StorageError::InvalidConfig(format!(
                    "bubt.{} {} not within [{}, {}]", name, size, MIN_BLOCKSIZE, MAX_BLOCKSIZE
                )));
            }
            if size % 32 != 0 {
                return Err(StorageError::InvalidConfig(format!(
                    "bubt.{} {} not a multiple of 32", name, size
                )));
            }
        }
        if self.flush_queue == 0 {
            return Err(StorageError::InvalidConfig("bubt flush_queue is zero".into()));
        }
        Ok(())
    }
}

/// Memory index flavour
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MemStore {
    /// Read-write locked tree, writers block readers
    Llrb,
    /// Copy-on-write tree, readers work on snapshots
    Mvcc,
}

/// Disk index flavour
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DiskStore {
    Bubt,
}

/// Disk-compaction pair policy
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub enum CompactPolicy {
    /// First adjacent pair, newest first, whose footprint ratio
    /// `newer / older` reaches `ratio`
    FirstOverRatio,
    /// Adjacent pair with the largest footprint ratio, if it reaches `ratio`
    LargestRatio,
}

/// Top level index configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BognConfig {
    pub memstore: MemStore,
    pub diskstore: DiskStore,

    /// Persist the index on disk at all
    pub durable: bool,

    /// Disk-greater-than-memory mode
    pub dgm: bool,

    /// Only a subset of keys is active, valid only with `dgm`
    pub workingset: bool,

    /// Disk level compaction trigger ratio, within [0.1, 0.5]
    pub ratio: f64,

    /// Seconds between periodic persists of in-memory writes
    pub flush_period_secs: u64,

    /// Seconds a disk level may live before being merged with the next one
    pub compact_period_secs: u64,

    /// Compactor tick
    pub compact_tick_ms: u64,

    /// How disk levels are paired for compaction
    pub compact_policy: CompactPolicy,

    pub llrb: LlrbConfig,
    pub bubt: BubtConfig,
}

impl Default for BognConfig {
    fn default() -> Self {
        Self {
            memstore: MemStore::Mvcc,
            diskstore: DiskStore::Bubt,
            durable: true,
            dgm: false,
            workingset: false,
            ratio: 0.5,
            flush_period_secs: 100,
            compact_period_secs: 300,
            compact_tick_ms: 1000,
            compact_policy: CompactPolicy::FirstOverRatio,
            llrb: LlrbConfig::default(),
            bubt: BubtConfig::default(),
        }
    }
}

impl BognConfig {
    pub fn with_paths(diskpaths: Vec<PathBuf>) -> Self {
        Self { bubt: BubtConfig::with_paths(diskpaths), ..Default::default() }
    }

    /// Build a config from a flat settings map, unknown keys are rejected.
    pub fn from_settings(settings: &HashMap<String, String>) -> Result<Self> {
        let mut config = Self::default();
        for (key, value) in settings {
            match key.as_str() {
                "memstore" => {
                    config.memstore = match value.as_str() {
                        "llrb" => MemStore::Llrb,
                        "mvcc" => MemStore::Mvcc,
                        _ => return Err(invalid(key, value)),
                    }
                }
                "diskstore" => {
                    config.diskstore = match value.as_str() {
                        "bubt" => DiskStore::Bubt,
                        _ => return Err(invalid(key, value)),
                    }
                }
                "durable" => config.durable = parse(key, value)?,
                "dgm" => config.dgm = parse(key, value)?,
                "workingset" => config.workingset = parse(key, value)?,
                "ratio" => config.ratio = parse(key, value)?,
                "period" => config.flush_period_secs = parse(key, value)?,
                "compactperiod" => config.compact_period_secs = parse(key, value)?,
                "compacttick" => config.compact_tick_ms = parse(key, value)?,
                "bubt.msize" => config.bubt.m_block_size = parse(key, value)?,
                "bubt.zsize" => config.bubt.z_block_size = parse(key, value)?,
                "bubt.vsize" => config.bubt.v_block_size = parse(key, value)?,
                "bubt.vlog" => config.bubt.vlog = parse(key, value)?,
                "bubt.mmap" => config.bubt.mmap = parse(key, value)?,
                "bubt.diskpaths" => {
                    config.bubt.diskpaths = value
                        .split(',')
                        .map(str::trim)
                        .filter(|s| !s.is_empty())
                        .map(PathBuf::from)
                        .collect();
                }
                "llrb.keycapacity" => config.llrb.key_capacity = parse(key, value)?,
                "llrb.valcapacity" => config.llrb.val_capacity = parse(key, value)?,
                "llrb.poolcapacity" => config.llrb.pool_capacity = parse(key, value)?,
                "llrb.fields" => {
                    config.llrb.bornseqno = false;
                    config.llrb.deadseqno = false;
                    config.llrb.vbuuid = false;
                    for field in value.split(',').map(str::trim).filter(|s| !s.is_empty()) {
                        match field {
                            "bnseq" => config.llrb.bornseqno = true,
                            "ddseq" => config.llrb.deadseqno = true,
                            "vbuuid" => config.llrb.vbuuid = true,
                            _ => return Err(invalid(key, field)),
                        }
                    }
                }
                _ => {
                    return Err(StorageError::InvalidConfig(format!("unknown setting {:?}", key)));
                }
            }
        }
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.workingset && !self.dgm {
            return Err(StorageError::InvalidConfig("workingset requires dgm".into()));
        }
        if !(0.1..=0.5).contains(&self.ratio) {
            return Err(StorageError::InvalidConfig(format!(
                "ratio {} not within [0.1, 0.5]", self.ratio
            )));
        }
        if self.compact_tick_ms == 0 {
            return Err(StorageError::InvalidConfig("compact tick is zero".into()));
        }
        self.llrb.validate()?;
        self.bubt.validate()
    }

    /// Memory capacity the compactor measures flush thresholds against.
    pub fn mem_capacity(&self) -> usize {
        self.llrb.key_capacity + self.llrb.val_capacity
    }

    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }
}

fn parse<T: std::str::FromStr>(key: &str, value: &str) -> Result<T> {
    value.trim().parse::<T>().map_err(|_| invalid(key, value))
}

fn invalid(key: &str, value: &str) -> StorageError {
    StorageError::InvalidConfig(format!("invalid value {:?} for {:?}", value, key))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        BognConfig::default().validate().unwrap();
        LlrbConfig::small().validate().unwrap();
    }

    #[test]
    fn test_from_settings() {
        let mut settings = HashMap::new();
        settings.insert("memstore".to_string(), "llrb".to_string());
        settings.insert("dgm".to_string(), "true".to_string());
        settings.insert("workingset".to_string(), "true".to_string());
        settings.insert("ratio".to_string(), "0.25".to_string());
        settings.insert("bubt.msize".to_string(), "8192".to_string());
        settings.insert("bubt.diskpaths".to_string(), "/tmp/a, /tmp/b".to_string());
        settings.insert("llrb.fields".to_string(), "bnseq,vbuuid".to_string());

        let config = BognConfig::from_settings(&settings).unwrap();
        assert_eq!(config.memstore, MemStore::Llrb);
        assert!(config.dgm && config.workingset);
        assert_eq!(config.ratio, 0.25);
        assert_eq!(config.bubt.m_block_size, 8192);
        assert_eq!(
            config.bubt.diskpaths,
            vec![PathBuf::from("/tmp/a"), PathBuf::from("/tmp/b")]
        );
        assert!(config.llrb.bornseqno && config.llrb.vbuuid && !config.llrb.deadseqno);
    }

    #[test]
    fn test_invalid_settings() {
        let mut settings = HashMap::new();
        settings.insert("workingset".to_string(), "true".to_string());
        assert!(BognConfig::from_settings(&settings).is_err());

        let mut settings = HashMap::new();
        settings.insert("ratio".to_string(), "0.9".to_string());
        assert!(BognConfig::from_settings(&settings).is_err());

        let mut settings = HashMap::new();
        settings.insert("bubt.zsize".to_string(), "100".to_string());
        assert!(BognConfig::from_settings(&settings).is_err());

        let mut settings = HashMap::new();
        settings.insert("nosuchkey".to_string(), "1".to_string());
        assert!(BognConfig::from_settings(&settings).is_err());
    }
}
