//! Deferred removal of superseded disk levels
//!
//! Every head swap retires the old head together with the levels it alone
//! still referenced, possibly none. Retired heads form a chain purged
//! strictly oldest first: a head goes only once no reader holds it and
//! every older head is gone, so a reader pinning any head also pins the
//! levels retired after it.

use super::engine::Shared;
use super::snapshot::{Disk, Head};
use crate::Result;
use crossbeam::channel::Receiver;
use crossbeam::select;
use log::{error, info};
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

pub(crate) struct Retired {
    head: Arc<Head>,
    disks: Vec<Disk>,
}

pub(crate) struct Purger {
    logprefix: String,
    queue: Mutex<VecDeque<Retired>>,
    n_purged: AtomicUsize,
}

impl Purger {
    pub fn new(logprefix: &str) -> Self {
        Self { logprefix: logprefix.to_string(), queue: Mutex::new(VecDeque::new()), n_purged: AtomicUsize::new(0) }
    }

    pub fn retire(&self, head: Arc<Head>, disks: Vec<Disk>) {
        self.queue.lock().push_back(Retired { head, disks });
    }

    pub fn pending(&self) -> usize {
        self.queue.lock().len()
    }

    /// Levels destroyed so far.
    pub fn n_purged(&self) -> usize {
        self.n_purged.load(Ordering::Relaxed)
    }

    /// Destroy the levels of every retired head nobody reads any more,
    /// stopping at the first one still in use. `force` ignores readers.
    pub fn purge(&self, force: bool) -> Result<usize> {
        let (mut n, mut first_err) = (0, None);
        loop {
            let retired = {
                let mut queue = self.queue.lock();
                match queue.front() {
                    Some(front) if force || Arc::strong_count(&front.head) == 1 => queue.pop_front(),
                    _ => None,
                }
            };
            let Some(retired) = retired else { break };
            drop(retired.head);
            for disk in retired.disks {
                if let Err(err) = disk.snapshot.destroy() {
                    error!("{} purging {}: {}", self.logprefix, disk.snapshot.id(), err);
                    first_err.get_or_insert(err);
                    continue;
                }
                info!("{} purged level {} version {}", self.logprefix, disk.level, disk.version);
                self.n_purged.fetch_add(1, Ordering::Relaxed);
                n += 1;
            }
        }
        match first_err {
            Some(err) => Err(err),
            None => Ok(n),
        }
    }
}

/// Purger thread: wakes on every retirement and once per compactor tick,
/// readers release heads without telling anybody.
pub(crate) fn run(shared: Weak<Shared>, finch: Receiver<()>, notify: Receiver<()>) {
    let (tick, logprefix) = match shared.upgrade() {
        Some(shared) => (Duration::from_millis(shared.config.compact_tick_ms), shared.logprefix.clone()),
        None => return,
    };
    info!("{} purger started", logprefix);
    loop {
        select! {
            recv(notify) -> msg => if msg.is_err() { break },
            recv(finch) -> _ => break,
            default(tick) => {},
        }
        let Some(shared) = shared.upgrade() else { break };
        if let Err(err) = shared.purge(false) {
            error!("{} purge: {}", logprefix, err);
        }
    }
    info!("{} purger stopped", logprefix);
}
