//! Bottoms-up built btree on disk
//!
//! ## Files
//! ```text
//! path0/name/name-index      m-blocks | settings | metadata | marker
//! pathN/name/name-zindex-N   z-blocks | marker
//! pathN/name/name-vlog-N     value batches | marker   (vlog only)
//! ```
//! z-blocks are spread round robin across one shard per disk path. A marker
//! block (block size × `0xAB`) seals every file once its flusher closed
//! cleanly.
//!
//! ## Lifecycle
//! - [`Builder`] consumes a sorted entry iterator and writes the files
//! - [`Snapshot`] opens them read-only, any number of readers may share it

mod builder;
mod flusher;
mod iter;
mod mblock;
mod reader;
mod settings;
mod snapshot;
mod vlog;
mod zblock;

pub use builder::Builder;
pub use iter::BubtIter;
pub use settings::{BuildStats, Settings};
pub use snapshot::Snapshot;
pub use zblock::{ZFLAG_DELETED, ZFLAG_VALFILE, ZFLAG_VBUUID};

use std::path::{Path, PathBuf};

/// Byte filling every marker block.
pub const MARKER_BYTE: u8 = 0xAB;

/// Directory holding `name`'s files under one disk path.
pub fn index_dir(path: &Path, name: &str) -> PathBuf {
    path.join(name)
}

pub(crate) fn mindex_file(path: &Path, name: &str) -> PathBuf {
    index_dir(path, name).join(format!("{}-index", name))
}

pub(crate) fn zindex_file(path: &Path, name: &str, shard: usize) -> PathBuf {
    index_dir(path, name).join(format!("{}-zindex-{}", name, shard))
}

pub(crate) fn vlog_file(path: &Path, name: &str, shard: usize) -> PathBuf {
    index_dir(path, name).join(format!("{}-vlog-{}", name, shard))
}
