//! One writer thread per output file
//!
//! Blocks reach the writer over a bounded channel, a full channel blocks
//! the builder. On close the writer appends the marker block, flushes and
//! syncs. An aborted flusher stops without a marker, so a half built file
//! is never mistaken for a complete one.

use super::MARKER_BYTE;
use crate::{Result, StorageError};
use crossbeam::channel::{bounded, Receiver, Sender};
use fs2::FileExt;
use log::{debug, error};
use std::fs::{File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

pub(crate) struct Flusher {
    path: PathBuf,
    logprefix: String,
    tx: Option<Sender<Vec<u8>>>,
    abort: Arc<AtomicBool>,
    handle: Option<JoinHandle<Result<u64>>>,
}

impl Flusher {
    /// Create (or truncate) `path` and start its writer thread.
    pub fn new(path: &Path, marker_size: usize, queue: usize, logprefix: &str) -> Result<Self> {
        let file = OpenOptions::new().write(true).create(true).truncate(true).open(path)?;
        file.try_lock_exclusive()?;

        let (tx, rx) = bounded(queue);
        let abort = Arc::new(AtomicBool::new(false));
        let thread_abort = Arc::clone(&abort);
        let thread_path = path.to_path_buf();
        let thread_prefix = logprefix.to_string();
        let handle = thread::Builder::new()
            .name("bubt-flusher".into())
            .spawn(move || {
                let res = run(file, rx, marker_size, &thread_abort);
                if let Err(err) = &res {
                    error!("{} flusher {:?}: {}", thread_prefix, thread_path, err);
                }
                res
            })?;

        Ok(Self {
            path: path.to_path_buf(),
            logprefix: logprefix.to_string(),
            tx: Some(tx),
            abort,
            handle: Some(handle),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Queue a block, blocks while the writer is behind.
    pub fn send(&self, block: Vec<u8>) -> Result<()> {
        let tx = self.tx.as_ref().ok_or_else(|| self.exited())?;
        tx.send(block).map_err(|_| self.exited())
    }

    fn exited(&self) -> StorageError {
        StorageError::Flusher(format!("{} flusher for {:?} exited", self.logprefix, self.path))
    }

    /// Write the marker, sync and wait for the writer. Returns the file size.
    pub fn close(mut self) -> Result<u64> {
        self.join()
    }

    /// Stop without writing a marker, returns the writer's own error if it
    /// failed before the abort.
    pub fn abort(mut self) -> Option<StorageError> {
        self.abort.store(true, Ordering::Release);
        self.join().err()
    }

    fn join(&mut self) -> Result<u64> {
        drop(self.tx.take());
        match self.handle.take() {
            Some(handle) => match handle.join() {
                Ok(res) => res,
                Err(_) => Err(StorageError::Flusher(format!(
                    "{} flusher for {:?} panicked",
                    self.logprefix, self.path
                ))),
            },
            None => Err(self.exited()),
        }
    }
}

impl Drop for Flusher {
    fn drop(&mut self) {
        if self.handle.is_some() {
            self.abort.store(true, Ordering::Release);
            let _ = self.join();
        }
    }
}

fn run(file: File, rx: Receiver<Vec<u8>>, marker_size: usize, abort: &AtomicBool) -> Result<u64> {
    let mut writer = BufWriter::with_capacity(64 * 1024, file);
    let mut written = 0u64;
    for block in rx.iter() {
        writer.write_all(&block)?;
        written += block.len() as u64;
    }
    if abort.load(Ordering::Acquire) {
        writer.flush()?;
        debug!("flusher aborted after {} bytes", written);
        return Ok(written);
    }
    writer.write_all(&vec![MARKER_BYTE; marker_size])?;
    written += marker_size as u64;
    writer.flush()?;
    writer.get_ref().sync_data()?;
    Ok(written)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_flusher_writes_marker() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("file");
        let flusher = Flusher::new(&path, 512, 4, "test").unwrap();
        for i in 0..10u8 {
            flusher.send(vec![i; 512]).unwrap();
        }
        assert_eq!(flusher.close().unwrap(), 11 * 512);

        let data = std::fs::read(&path).unwrap();
        assert_eq!(data.len(), 11 * 512);
        assert_eq!(data[512 * 3], 3);
        assert!(data[512 * 10..].iter().all(|b| *b == MARKER_BYTE));
    }

    #[test]
    fn test_flusher_abort_skips_marker() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("file");
        let flusher = Flusher::new(&path, 512, 4, "test").unwrap();
        flusher.send(vec![1; 512]).unwrap();
        assert!(flusher.abort().is_none());

        let data = std::fs::read(&path).unwrap();
        assert_eq!(data.len(), 512);
        assert!(data.iter().all(|b| *b == 1));
    }
}
