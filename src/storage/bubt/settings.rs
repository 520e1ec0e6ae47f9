//! Build settings, persisted as JSON in the m-index file
//!
//! ## Settings block
//! ```text
//! len: u16 | JSON | zero padding to the m-block size
//! ```

use super::zblock::read_u16;
use crate::{Result, StorageError};
use serde::{Deserialize, Serialize};

/// What a build produced, read back by every reader.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Settings {
    pub name: String,
    pub zblocksize: usize,
    pub mblocksize: usize,
    pub vblocksize: usize,

    /// Build duration in nanoseconds
    pub buildtime: u64,
    /// Build start, nanoseconds since the unix epoch
    pub epoch: u64,
    /// Highest seqno among the entries
    pub seqno: u64,

    pub keymem: usize,
    pub valmem: usize,
    /// Zero padding across z, m and value-log blocks
    pub paddingmem: usize,

    pub n_zblocks: usize,
    pub n_mblocks: usize,
    pub n_vblocks: usize,
    pub n_count: usize,
    pub n_deleted: usize,

    pub n_zshards: usize,
    pub vlog: bool,
    /// m-index offset of the root block, absent for an empty snapshot
    pub rootblock: Option<u64>,
}

/// Statistics returned by `Builder::build`.
pub type BuildStats = Settings;

impl Settings {
    pub fn encode(&self, blocksize: usize) -> Result<Vec<u8>> {
        let json = serde_json::to_vec(self)?;
        if json.len() + 2 > blocksize || json.len() > u16::MAX as usize {
            return Err(StorageError::EntryExceedsBlockSize { size: json.len() + 2, blocksize });
        }
        let mut block = Vec::with_capacity(blocksize);
        block.extend_from_slice(&(json.len() as u16).to_be_bytes());
        block.extend_from_slice(&json);
        block.resize(blocksize, 0);
        Ok(block)
    }

    pub fn decode(block: &[u8]) -> Result<Self> {
        let len = read_u16(block, 0)
            .ok_or_else(|| StorageError::CorruptSnapshot("settings block too small".into()))?
            as usize;
        let json = block
            .get(2..2 + len)
            .ok_or_else(|| StorageError::CorruptSnapshot("settings length overflow".into()))?;
        serde_json::from_slice(json)
            .map_err(|err| StorageError::CorruptSnapshot(format!("settings: {}", err)))
    }
}

/// Metadata region: bytes, zero padding, trailing u64 length, in whole
/// m-blocks.
pub(crate) fn encode_metadata(metadata: &[u8], blocksize: usize) -> Vec<u8> {
    let total = (metadata.len() + 8).div_ceil(blocksize) * blocksize;
    let mut region = Vec::with_capacity(total);
    region.extend_from_slice(metadata);
    region.resize(total - 8, 0);
    region.extend_from_slice(&(metadata.len() as u64).to_be_bytes());
    region
}

/// Size of the metadata region for `len` metadata bytes.
pub(crate) fn metadata_region(len: u64, blocksize: u64) -> u64 {
    (len + 8).div_ceil(blocksize) * blocksize
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_settings_block() {
        let settings = Settings {
            name: "level-1".into(),
            zblocksize: 4096,
            mblocksize: 4096,
            vblocksize: 4096,
            n_count: 10,
            rootblock: Some(8192),
            ..Default::default()
        };
        let block = settings.encode(512).unwrap();
        assert_eq!(block.len(), 512);
        assert_eq!(Settings::decode(&block).unwrap(), settings);

        let long = Settings { name: "x".repeat(600), ..Default::default() };
        assert!(long.encode(512).is_err());
    }

    #[test]
    fn test_metadata_region() {
        let region = encode_metadata(b"hello", 512);
        assert_eq!(region.len(), 512);
        assert_eq!(&region[..5], b"hello");
        assert_eq!(&region[504..], &5u64.to_be_bytes());
        assert_eq!(metadata_region(5, 512), 512);
        assert_eq!(metadata_region(504, 512), 512);
        assert_eq!(metadata_region(505, 512), 1024);
        assert_eq!(encode_metadata(b"", 512).len(), 512);
    }
}
