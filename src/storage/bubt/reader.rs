//! Read access to snapshot files and scratch buffers for block reads

use super::MARKER_BYTE;
use crate::{Result, StorageError};
use fs2::FileExt;
use memmap2::{Mmap, MmapOptions};
use parking_lot::Mutex;
use std::fs::File;
use std::io::{ErrorKind, Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};

/// One snapshot file, shared-locked for as long as it is open.
pub(crate) struct SnapFile {
    path: PathBuf,
    size: u64,
    file: Mutex<File>,
    mmap: Option<Mmap>,
}

impl SnapFile {
    pub fn open(path: PathBuf, mmap: bool) -> Result<Self> {
        let file = File::open(&path)?;
        FileExt::try_lock_shared(&file)?;
        let size = file.metadata()?.len();
        let mmap = if mmap && size > 0 {
            Some(unsafe { MmapOptions::new().map(&file)? })
        } else {
            None
        };
        Ok(Self { path, size, file: Mutex::new(file), mmap })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn size(&self) -> u64 {
        self.size
    }

    pub fn read_at(&self, fpos: u64, buf: &mut [u8]) -> Result<()> {
        let end = fpos + buf.len() as u64;
        if end > self.size {
            return Err(self.partial(fpos, buf.len()));
        }
        match &self.mmap {
            Some(mmap) => {
                let src = mmap
                    .get(fpos as usize..end as usize)
                    .ok_or_else(|| self.partial(fpos, buf.len()))?;
                buf.copy_from_slice(src);
            }
            None => {
                let mut file = self.file.lock();
                file.seek(SeekFrom::Start(fpos))?;
                file.read_exact(buf).map_err(|err| match err.kind() {
                    ErrorKind::UnexpectedEof => self.partial(fpos, buf.len()),
                    _ => StorageError::Io(err),
                })?;
            }
        }
        Ok(())
    }

    pub fn read_u64(&self, fpos: u64) -> Result<u64> {
        let mut scratch = [0u8; 8];
        self.read_at(fpos, &mut scratch)?;
        Ok(u64::from_be_bytes(scratch))
    }

    fn partial(&self, fpos: u64, len: usize) -> StorageError {
        StorageError::PartialRead(format!("{:?} {}+{} beyond {}", self.path, fpos, len, self.size))
    }

    /// Fail unless the file ends in a full marker block.
    pub fn check_marker(&self, blocksize: usize) -> Result<()> {
        if self.size < blocksize as u64 {
            return Err(StorageError::InvalidMarker(self.path.clone()));
        }
        let mut block = vec![0u8; blocksize];
        self.read_at(self.size - blocksize as u64, &mut block)?;
        if block.iter().any(|b| *b != MARKER_BYTE) {
            return Err(StorageError::InvalidMarker(self.path.clone()));
        }
        Ok(())
    }

    /// Number of marker bytes at the tail of the file, up to `limit`.
    pub fn marker_run(&self, limit: u64) -> Result<u64> {
        let mut run = 0u64;
        let mut chunk = vec![0u8; 4096];
        while run < limit && run < self.size {
            let n = (self.size - run).min(chunk.len() as u64) as usize;
            let buf = &mut chunk[..n];
            self.read_at(self.size - run - n as u64, buf)?;
            match buf.iter().rev().position(|b| *b != MARKER_BYTE) {
                Some(pos) => return Ok(run + pos as u64),
                None => run += n as u64,
            }
        }
        Ok(run.min(limit))
    }
}

/// Bounded pool of block sized scratch buffers.
pub(crate) struct BufferPool {
    size: usize,
    max: usize,
    free: Mutex<Vec<Vec<u8>>>,
}

impl BufferPool {
    pub fn new(size: usize, max: usize) -> Self {
        Self { size, max, free: Mutex::new(Vec::with_capacity(max)) }
    }

    pub fn get(&self) -> Vec<u8> {
        self.free.lock().pop().unwrap_or_else(|| vec![0u8; self.size])
    }

    pub fn put(&self, buf: Vec<u8>) {
        if buf.len() != self.size {
            return;
        }
        let mut free = self.free.lock();
        if free.len() < self.max {
            free.push(buf);
        }
    }
}
