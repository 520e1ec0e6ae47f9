//! Core data types shared by every index flavour

use crate::Result;

/// A key with its value and version metadata, as returned by every reader.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Entry {
    pub key: Vec<u8>,
    pub value: Vec<u8>,

    /// Sequence number of the write that created this version
    pub bornseqno: u64,

    /// Sequence number of the delete, zero while the entry is live
    pub deadseqno: u64,

    /// LSM tombstone
    pub deleted: bool,

    /// Replication bucket
    pub vbno: u16,

    /// Replication bucket uuid
    pub vbuuid: u64,
}

impl Entry {
    pub fn new(key: Vec<u8>, value: Vec<u8>, seqno: u64) -> Self {
        Self { key, value, bornseqno: seqno, deadseqno: 0, deleted: false, vbno: 0, vbuuid: 0 }
    }

    /// Latest sequence number that touched this entry, used as its CAS.
    pub fn seqno(&self) -> u64 {
        if self.deleted && self.deadseqno > 0 {
            self.deadseqno
        } else {
            self.bornseqno
        }
    }

    pub fn is_deleted(&self) -> bool {
        self.deleted
    }

    /// Bytes charged to key and value memory
    pub fn footprint(&self) -> usize {
        self.key.len() + self.value.len()
    }
}

/// Which range bounds are inclusive.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Inclusion {
    None,
    Low,
    High,
    Both,
}

impl Inclusion {
    pub const ALL: [Inclusion; 4] = [Inclusion::None, Inclusion::Low, Inclusion::High, Inclusion::Both];

    pub fn low(self) -> bool {
        matches!(self, Inclusion::Low | Inclusion::Both)
    }

    pub fn high(self) -> bool {
        matches!(self, Inclusion::High | Inclusion::Both)
    }
}

/// Owned `[low, high]` range, `None` bounds are open ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyRange {
    pub low: Option<Vec<u8>>,
    pub high: Option<Vec<u8>>,
    pub incl: Inclusion,
}

impl KeyRange {
    pub fn new(low: Option<&[u8]>, high: Option<&[u8]>, incl: Inclusion) -> Self {
        Self { low: low.map(|k| k.to_vec()), high: high.map(|k| k.to_vec()), incl }
    }

    pub fn full() -> Self {
        Self { low: None, high: None, incl: Inclusion::Both }
    }

    /// `key` is at or beyond the lower bound
    pub fn above_low(&self, key: &[u8]) -> bool {
        match &self.low {
            None => true,
            Some(low) if self.incl.low() => key >= low.as_slice(),
            Some(low) => key > low.as_slice(),
        }
    }

    /// `key` is at or before the upper bound
    pub fn below_high(&self, key: &[u8]) -> bool {
        match &self.high {
            None => true,
            Some(high) if self.incl.high() => key <= high.as_slice(),
            Some(high) => key < high.as_slice(),
        }
    }

    pub fn contains(&self, key: &[u8]) -> bool {
        self.above_low(key) && self.below_high(key)
    }
}

/// Owned iterator over entries in key order.
pub type EntryIter = Box<dyn Iterator<Item = Result<Entry>> + Send>;

/// Read access common to memory indexes and disk snapshots.
pub trait Reader: Send + Sync {
    fn get(&self, key: &[u8]) -> Result<Option<Entry>>;

    /// Owned iterator, does not hold any lock on the index while alive.
    fn iterate(
        &self,
        low: Option<&[u8]>,
        high: Option<&[u8]>,
        incl: Inclusion,
        reverse: bool,
    ) -> Result<EntryIter>;

    /// Visit entries in range until the callback returns false.
    fn range(
        &self,
        low: Option<&[u8]>,
        high: Option<&[u8]>,
        incl: Inclusion,
        reverse: bool,
        callback: &mut dyn FnMut(&Entry) -> bool,
    ) -> Result<()> {
        for entry in self.iterate(low, high, incl, reverse)? {
            if !callback(&entry?) {
                break;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_key_range_inclusion() {
        let lo: &[u8] = b"b";
        let hi: &[u8] = b"d";
        let cases = [
            (Inclusion::None, [false, true, false]),
            (Inclusion::Low, [true, true, false]),
            (Inclusion::High, [false, true, true]),
            (Inclusion::Both, [true, true, true]),
        ];
        for (incl, expect) in cases {
            let r = KeyRange::new(Some(lo), Some(hi), incl);
            assert_eq!(r.contains(b"b"), expect[0], "{:?}", incl);
            assert_eq!(r.contains(b"c"), expect[1], "{:?}", incl);
            assert_eq!(r.contains(b"d"), expect[2], "{:?}", incl);
            assert!(!r.contains(b"a") && !r.contains(b"e"));
        }
        assert!(KeyRange::full().contains(b""));
    }

    #[test]
    fn test_entry_seqno() {
        let mut entry = Entry::new(b"k".to_vec(), b"v".to_vec(), 10);
        assert_eq!(entry.seqno(), 10);
        entry.deleted = true;
        entry.deadseqno = 12;
        assert_eq!(entry.seqno(), 12);
        assert_eq!(entry.footprint(), 2);
    }
}
