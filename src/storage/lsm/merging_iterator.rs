//! Streaming k-way merge across LSM levels
//!
//! ## Approach
//! - One heap slot per source, holding that source's current entry
//! - Each `next()` pops the smallest key (largest when reverse)
//! - On equal keys the source with the lower index wins, the shadowed
//!   versions are consumed and dropped
//! - Optionally skips tombstones, for merged reads
//!
//! Sources must be passed newest first: `mw, mr, mc, disks[0..]`.

use crate::types::{Entry, EntryIter};
use crate::Result;
use std::cmp::Ordering;
use std::collections::BinaryHeap;

struct HeapItem {
    entry: Entry,
    source: usize,
    reverse: bool,
}

impl PartialEq for HeapItem {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for HeapItem {}

impl PartialOrd for HeapItem {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for HeapItem {
    // Max-heap: the item that must come out next compares greatest.
    fn cmp(&self, other: &Self) -> Ordering {
        let by_key = if self.reverse {
            self.entry.key.cmp(&other.entry.key)
        } else {
            other.entry.key.cmp(&self.entry.key)
        };
        by_key.then_with(|| other.source.cmp(&self.source))
    }
}

pub struct MergingIterator {
    heap: BinaryHeap<HeapItem>,
    sources: Vec<EntryIter>,
    reverse: bool,
    skip_deleted: bool,
    /// Error raised while refilling, yielded before anything else
    pending: Option<crate::StorageError>,
    finished: bool,
}

impl MergingIterator {
    /// Merge `sources`, newest first, all ordered the same way.
    pub fn new(sources: Vec<EntryIter>, reverse: bool, skip_deleted: bool) -> Self {
        let mut iter = Self {
            heap: BinaryHeap::with_capacity(sources.len()),
            sources,
            reverse,
            skip_deleted,
            pending: None,
            finished: false,
        };
        for source in 0..iter.sources.len() {
            iter.refill(source);
        }
        iter
    }

    fn refill(&mut self, source: usize) {
        match self.sources[source].next() {
            Some(Ok(entry)) => self.heap.push(HeapItem { entry, source, reverse: self.reverse }),
            Some(Err(err)) => {
                if self.pending.is_none() {
                    self.pending = Some(err);
                }
            }
            None => {}
        }
    }

    fn next_entry(&mut self) -> Option<Result<Entry>> {
        loop {
            if let Some(err) = self.pending.take() {
                return Some(Err(err));
            }
            let item = self.heap.pop()?;
            self.refill(item.source);

            // drop older versions of the same key
            while self.heap.peek().is_some_and(|top| top.entry.key == item.entry.key) {
                if let Some(shadowed) = self.heap.pop() {
                    self.refill(shadowed.source);
                }
            }

            if self.skip_deleted && item.entry.deleted {
                continue;
            }
            return Some(Ok(item.entry));
        }
    }
}

impl Iterator for MergingIterator {
    type Item = Result<Entry>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.finished {
            return None;
        }
        let next = self.next_entry();
        match &next {
            None | Some(Err(_)) => self.finished = true,
            Some(Ok(_)) => {}
        }
        next
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::StorageError;

    fn entry(key: u8, value: u8, seqno: u64) -> Entry {
        Entry::new(vec![key], vec![value], seqno)
    }

    fn tombstone(key: u8, seqno: u64) -> Entry {
        let mut entry = Entry::new(vec![key], Vec::new(), seqno);
        entry.deleted = true;
        entry.deadseqno = seqno;
        entry
    }

    fn source(entries: Vec<Entry>) -> EntryIter {
        Box::new(entries.into_iter().map(Ok))
    }

    fn keys(iter: MergingIterator) -> Vec<(u8, u8)> {
        iter.map(|r| r.unwrap()).map(|e| (e.key[0], e.value.first().copied().unwrap_or(0))).collect()
    }

    #[test]
    fn test_merging_iterator_basic() {
        let sources = vec![
            source(vec![entry(1, 1, 1), entry(3, 3, 1), entry(5, 5, 1)]),
            source(vec![entry(2, 2, 1), entry(4, 4, 1), entry(6, 6, 1)]),
        ];
        let iter = MergingIterator::new(sources, false, false);
        let got: Vec<u8> = keys(iter).into_iter().map(|(k, _)| k).collect();
        assert_eq!(got, vec![1, 2, 3, 4, 5, 6]);
    }

    #[test]
    fn test_merging_iterator_newest_wins() {
        // same key in three levels, first source is the newest
        let sources = vec![
            source(vec![entry(1, 30, 3)]),
            source(vec![entry(1, 20, 2), entry(2, 20, 2)]),
            source(vec![entry(1, 10, 1), entry(2, 10, 1), entry(3, 10, 1)]),
        ];
        let iter = MergingIterator::new(sources, false, false);
        assert_eq!(keys(iter), vec![(1, 30), (2, 20), (3, 10)]);
    }

    #[test]
    fn test_merging_iterator_reverse() {
        let sources = vec![
            source(vec![entry(4, 40, 4), entry(2, 20, 2)]),
            source(vec![entry(3, 3, 1), entry(2, 2, 1), entry(1, 1, 1)]),
        ];
        let iter = MergingIterator::new(sources, true, false);
        assert_eq!(keys(iter), vec![(4, 40), (3, 3), (2, 20), (1, 1)]);
    }

    #[test]
    fn test_merging_iterator_tombstone() {
        let sources = vec![
            source(vec![entry(1, 1, 5), tombstone(2, 6)]),
            source(vec![entry(2, 2, 1), entry(3, 3, 1)]),
        ];
        let merged = MergingIterator::new(sources, false, true);
        assert_eq!(keys(merged), vec![(1, 1), (3, 3)]);

        // plain mode surfaces the tombstone, still shadowing the older value
        let sources = vec![
            source(vec![entry(1, 1, 5), tombstone(2, 6)]),
            source(vec![entry(2, 2, 1), entry(3, 3, 1)]),
        ];
        let plain: Vec<Entry> = MergingIterator::new(sources, false, false).map(|r| r.unwrap()).collect();
        assert_eq!(plain.len(), 3);
        assert!(plain[1].deleted);
        assert_eq!(plain[1].deadseqno, 6);
    }

    #[test]
    fn test_merging_iterator_error() {
        let failing: EntryIter = Box::new(
            vec![Ok(entry(1, 1, 1)), Err(StorageError::PartialRead("disk".into()))].into_iter(),
        );
        let mut iter = MergingIterator::new(vec![failing, source(vec![entry(2, 2, 1)])], false, false);
        assert!(iter.next().unwrap().is_ok());
        assert!(iter.next().unwrap().is_err());
        assert!(iter.next().is_none());
    }
}
