//! Working-set cache over the disk levels
//!
//! Readers that hit a disk level hand the entry to the cacher thread over a
//! bounded channel, and never wait on it: a full channel drops the entry.
//! The cacher loads each entry into its own memory index with the seqnos it
//! carried on disk.

use super::memindex::MemIndex;
use crate::config::BognConfig;
use crate::types::Entry;
use crate::Result;
use crossbeam::channel::{bounded, Receiver, Sender, TrySendError};
use log::{debug, info};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

/// Disk hits queued towards the cacher before new ones are dropped.
const CACHE_QUEUE: usize = 1000;

pub(crate) struct Cache {
    index: Arc<MemIndex>,
    tx: Option<Sender<Entry>>,
    handle: Option<JoinHandle<()>>,
    n_dropped: AtomicUsize,
    n_failed: Arc<AtomicUsize>,
}

impl Cache {
    pub fn new(name: &str, config: &BognConfig) -> Result<Self> {
        let index = Arc::new(MemIndex::new(name, config)?);
        let (tx, rx) = bounded(CACHE_QUEUE);
        let n_failed = Arc::new(AtomicUsize::new(0));
        let (cacher, failed) = (Arc::clone(&index), Arc::clone(&n_failed));
        let logprefix = format!("CACHE [{}]", name);
        let handle = thread::Builder::new()
            .name(format!("cacher-{}", name))
            .spawn(move || run_cacher(&cacher, rx, &failed, &logprefix))?;
        Ok(Self { index, tx: Some(tx), handle: Some(handle), n_dropped: AtomicUsize::new(0), n_failed })
    }

    pub fn get(&self, key: &[u8]) -> Option<Entry> {
        self.index.get(key)
    }

    pub fn footprint(&self) -> usize {
        self.index.footprint()
    }

    pub fn snapshot(&self) -> Arc<crate::storage::llrb::LlrbSnapshot> {
        self.index.snapshot()
    }

    pub fn index(&self) -> &MemIndex {
        &self.index
    }

    pub fn n_dropped(&self) -> usize {
        self.n_dropped.load(Ordering::Relaxed)
    }

    /// Disk hits the cacher could not load, typically oversized entries.
    pub fn n_failed(&self) -> usize {
        self.n_failed.load(Ordering::Relaxed)
    }

    /// Queue a disk hit, best effort.
    pub fn admit(&self, entry: Entry) {
        if let Some(tx) = &self.tx {
            match tx.try_send(entry) {
                Ok(()) => {}
                Err(TrySendError::Full(_)) | Err(TrySendError::Disconnected(_)) => {
                    self.n_dropped.fetch_add(1, Ordering::Relaxed);
                }
            }
        }
    }
}

impl Drop for Cache {
    fn drop(&mut self) {
        drop(self.tx.take());
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

fn run_cacher(index: &MemIndex, rx: Receiver<Entry>, n_failed: &AtomicUsize, logprefix: &str) {
    info!("{} cacher started", logprefix);
    let mut n_cached = 0usize;
    for entry in rx {
        if index.get(&entry.key).is_some() {
            continue;
        }
        match index.load(&entry) {
            Ok(_) => n_cached += 1,
            Err(err) => {
                n_failed.fetch_add(1, Ordering::Relaxed);
                debug!("{} skipping {:?}: {}", logprefix, String::from_utf8_lossy(&entry.key), err);
            }
        }
    }
    info!("{} cacher stopped, {} entries cached", logprefix, n_cached);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::LlrbConfig;
    use std::time::{Duration, Instant};

    fn wait_for(cache: &Cache, key: &[u8]) -> Option<Entry> {
        let deadline = Instant::now() + Duration::from_secs(5);
        while Instant::now() < deadline {
            if let Some(entry) = cache.get(key) {
                return Some(entry);
            }
            thread::sleep(Duration::from_millis(5));
        }
        None
    }

    #[test]
    fn test_cache_keeps_disk_seqno() {
        let config = BognConfig { llrb: LlrbConfig::small(), ..Default::default() };
        let cache = Cache::new("cache", &config).unwrap();

        cache.admit(Entry::new(b"k1".to_vec(), b"v1".to_vec(), 40));
        let mut tombstone = Entry::new(b"k2".to_vec(), Vec::new(), 7);
        tombstone.deleted = true;
        tombstone.deadseqno = 9;
        cache.admit(tombstone);

        let k1 = wait_for(&cache, b"k1").unwrap();
        assert_eq!((k1.value.as_slice(), k1.bornseqno), (&b"v1"[..], 40));
        let k2 = wait_for(&cache, b"k2").unwrap();
        assert!(k2.deleted);
        assert_eq!((k2.bornseqno, k2.seqno()), (7, 9));
        assert!(cache.footprint() > 0);
        assert_eq!(cache.n_dropped(), 0);

        // an older hit after a newer one leaves the index seqno alone
        assert_eq!(cache.index().get_seqno(), 40);
        cache.index().validate().unwrap();
    }

    #[test]
    fn test_cache_counts_failed_loads() {
        let config = BognConfig { llrb: LlrbConfig::small(), ..Default::default() };
        let cache = Cache::new("cache", &config).unwrap();

        let big = vec![b'x'; config.llrb.max_keysize + 1];
        cache.admit(Entry::new(big, b"v".to_vec(), 3));
        cache.admit(Entry::new(b"small".to_vec(), b"v".to_vec(), 4));
        assert!(wait_for(&cache, b"small").is_some());
        assert_eq!(cache.n_failed(), 1);
        assert_eq!(cache.n_dropped(), 0);
    }

    #[test]
    fn test_cache_drop_joins_cacher() {
        let config = BognConfig { llrb: LlrbConfig::small(), ..Default::default() };
        let cache = Cache::new("cache", &config).unwrap();
        for i in 0..100u64 {
            cache.admit(Entry::new(format!("key-{:03}", i).into_bytes(), b"v".to_vec(), i + 1));
        }
        drop(cache);
    }
}
