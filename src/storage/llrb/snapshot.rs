//! Immutable point-in-time views of a tree

use super::iter::{self, LlrbIter};
use super::node::{Link, Llrbnode};
use crate::types::{Entry, Inclusion, KeyRange};
use std::sync::Arc;

/// Root captured at a point in time, plus the nodes the writer replaced
/// since the previous snapshot. The reclaimed nodes are released when the
/// snapshot is purged, which happens strictly oldest first.
pub struct LlrbSnapshot {
    id: u64,
    pub(crate) root: Link,
    reclaim: Vec<Arc<Llrbnode>>,
    seqno: u64,
    count: usize,
}

impl LlrbSnapshot {
    pub(crate) fn new(id: u64, root: Link, reclaim: Vec<Arc<Llrbnode>>, seqno: u64, count: usize) -> Self {
        Self { id, root, reclaim, seqno, count }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    /// Tree seqno when the snapshot was taken.
    pub fn seqno(&self) -> u64 {
        self.seqno
    }

    /// Entries visible, tombstones included.
    pub fn count(&self) -> usize {
        self.count
    }

    pub(crate) fn n_reclaim(&self) -> usize {
        self.reclaim.len()
    }

    pub fn get(&self, key: &[u8]) -> Option<Entry> {
        iter::get(&self.root, key).map(|node| node.to_entry())
    }

    pub fn min(&self) -> Option<Entry> {
        iter::min(&self.root).map(|node| node.to_entry())
    }

    pub fn max(&self) -> Option<Entry> {
        iter::max(&self.root).map(|node| node.to_entry())
    }

    pub fn range(
        &self,
        low: Option<&[u8]>,
        high: Option<&[u8]>,
        incl: Inclusion,
        reverse: bool,
        callback: &mut dyn FnMut(&Entry) -> bool,
    ) {
        let range = KeyRange::new(low, high, incl);
        iter::range_walk(&self.root, &range, reverse, &mut |node| callback(&node.to_entry()));
    }

    pub fn iterate(
        self: &Arc<Self>,
        low: Option<&[u8]>,
        high: Option<&[u8]>,
        incl: Inclusion,
        reverse: bool,
    ) -> LlrbIter {
        LlrbIter::new(Arc::clone(self), KeyRange::new(low, high, incl), reverse)
    }
}

impl std::fmt::Debug for LlrbSnapshot {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LlrbSnapshot")
            .field("id", &self.id)
            .field("seqno", &self.seqno)
            .field("count", &self.count)
            .field("reclaim", &self.reclaim.len())
            .finish()
    }
}
