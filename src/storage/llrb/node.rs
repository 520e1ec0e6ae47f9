//! Tree nodes backed by arena blocks
//!
//! A node owns one key-arena block holding its metadata followed by the key
//! bytes. Values live in a separate value-arena block wrapped in a
//! reference counted [`NodeValue`], so a node and its copy-on-write clone
//! share the value without copying it.

use super::metadata::{FieldMask, Metadata, MD_BNSEQ, MD_DDSEQ, MD_MVALUE, MD_VBUUID};
use crate::storage::malloc::{Arena, Block};
use crate::types::Entry;
use crate::Result;
use std::sync::Arc;

pub(crate) type Link = Option<Arc<Llrbnode>>;

/// Value bytes in the value arena.
pub struct NodeValue {
    block: Block,
}

impl NodeValue {
    pub fn new(vals: &Arena, value: &[u8]) -> Result<Self> {
        let mut block = vals.alloc(value.len())?;
        block.as_mut_slice().copy_from_slice(value);
        Ok(Self { block })
    }

    pub fn bytes(&self) -> &[u8] {
        self.block.as_slice()
    }

    pub fn handle(&self) -> u64 {
        self.block.addr()
    }
}

pub struct Llrbnode {
    block: Block,
    value: Option<Arc<NodeValue>>,
    pub(crate) left: Link,
    pub(crate) right: Link,
}

impl Llrbnode {
    /// Fresh red node, metadata fields zeroed.
    pub fn new(
        keys: &Arena,
        vals: &Arena,
        fields: FieldMask,
        key: &[u8],
        value: Option<&[u8]>,
    ) -> Result<Self> {
        assert!(!key.is_empty(), "empty key");

        let value = match value {
            Some(value) => Some(Arc::new(NodeValue::new(vals, value)?)),
            None => None,
        };
        let mdsize = fields.sizeof();
        let mut block = keys.alloc(mdsize + key.len())?;
        {
            let buf = block.as_mut_slice();
            Metadata::new(&mut buf[..mdsize]).init(fields);
            buf[mdsize..].copy_from_slice(key);
        }
        let mut node = Self { block, value, left: None, right: None };
        if fields.has(MD_MVALUE) {
            let handle = node.value.as_ref().map_or(0, |v| v.handle());
            node.metadata_mut().set_mvalue(handle);
        }
        Ok(node)
    }

    /// Copy metadata and key into a new block, sharing value and children.
    pub fn cow_clone(&self, keys: &Arena) -> Self {
        let mut block = keys.alloc_overdraft(self.block.len());
        block.as_mut_slice().copy_from_slice(self.block.as_slice());
        Self {
            block,
            value: self.value.clone(),
            left: self.left.clone(),
            right: self.right.clone(),
        }
    }

    pub fn metadata(&self) -> Metadata<&[u8]> {
        Metadata::new(self.block.as_slice())
    }

    pub fn metadata_mut(&mut self) -> Metadata<&mut [u8]> {
        Metadata::new(self.block.as_mut_slice())
    }

    fn mdsize(&self) -> usize {
        self.metadata().sizeof()
    }

    pub fn key(&self) -> &[u8] {
        &self.block.as_slice()[self.mdsize()..]
    }

    pub fn value(&self) -> &[u8] {
        self.value.as_ref().map_or(&[], |v| v.bytes())
    }

    pub(crate) fn node_value(&self) -> Option<&Arc<NodeValue>> {
        self.value.as_ref()
    }

    pub fn is_black(&self) -> bool {
        self.metadata().is_black()
    }

    pub fn is_red(&self) -> bool {
        self.metadata().is_red()
    }

    pub fn set_black(&mut self, black: bool) {
        let mut md = self.metadata_mut();
        if black {
            md.set_black();
        } else {
            md.set_red();
        }
    }

    pub fn toggle_link(&mut self) {
        self.metadata_mut().toggle_link();
    }

    pub fn is_deleted(&self) -> bool {
        self.metadata().is_deleted()
    }

    pub fn bornseqno(&self) -> u64 {
        let md = self.metadata();
        if md.fields().has(MD_BNSEQ) {
            md.bnseq()
        } else {
            0
        }
    }

    pub fn deadseqno(&self) -> u64 {
        let md = self.metadata();
        if md.fields().has(MD_DDSEQ) {
            md.ddseq()
        } else {
            0
        }
    }

    pub fn vbuuid(&self) -> u64 {
        let md = self.metadata();
        if md.fields().has(MD_VBUUID) {
            md.vbuuid()
        } else {
            0
        }
    }

    pub fn vbno(&self) -> u16 {
        self.metadata().vbno()
    }

    /// Latest seqno that touched this node.
    pub fn seqno(&self) -> u64 {
        if self.is_deleted() {
            let dead = self.deadseqno();
            if dead > 0 {
                return dead;
            }
        }
        self.bornseqno()
    }

    /// Stamp seqnos and replication fields the tree keeps.
    pub(crate) fn stamp(&mut self, seqno: u64, deleted: bool, vbno: u16, vbuuid: u64) {
        let fields = self.metadata().fields();
        let mut md = self.metadata_mut();
        md.set_vbno(vbno).set_deleted(deleted);
        if deleted {
            if fields.has(MD_DDSEQ) {
                md.set_ddseq(seqno);
            }
        } else if fields.has(MD_BNSEQ) {
            md.set_bnseq(seqno);
        }
        if fields.has(MD_VBUUID) {
            md.set_vbuuid(vbuuid);
        }
    }

    /// Key and value bytes charged to the tree.
    pub fn footprint(&self) -> (usize, usize) {
        (self.key().len(), self.value().len())
    }

    pub fn to_entry(&self) -> Entry {
        Entry {
            key: self.key().to_vec(),
            value: self.value().to_vec(),
            bornseqno: self.bornseqno(),
            deadseqno: self.deadseqno(),
            deleted: self.is_deleted(),
            vbno: self.vbno(),
            vbuuid: self.vbuuid(),
        }
    }
}

impl std::fmt::Debug for Llrbnode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Llrbnode")
            .field("key", &String::from_utf8_lossy(self.key()))
            .field("black", &self.is_black())
            .field("seqno", &self.seqno())
            .field("deleted", &self.is_deleted())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::LlrbConfig;

    #[test]
    fn test_node_layout() {
        let config = LlrbConfig::small();
        let keys = Arena::new(config.key_arena()).unwrap();
        let vals = Arena::new(config.val_arena()).unwrap();
        let fields = FieldMask::from_flags(true, true, true, true);

        let mut node = Llrbnode::new(&keys, &vals, fields, b"hello", Some(b"world")).unwrap();
        node.stamp(10, false, 3, 99);
        assert_eq!(node.key(), b"hello");
        assert_eq!(node.value(), b"world");
        assert!(node.is_red());
        assert_eq!(node.metadata().mvalue(), node.node_value().unwrap().handle());

        let mut clone = node.cow_clone(&keys);
        clone.set_black(true);
        clone.stamp(11, true, 3, 99);
        assert!(node.is_red() && !node.is_deleted());
        assert_eq!(node.seqno(), 10);
        assert!(clone.is_black() && clone.is_deleted());
        assert_eq!((clone.bornseqno(), clone.deadseqno()), (10, 11));
        assert!(Arc::ptr_eq(node.node_value().unwrap(), clone.node_value().unwrap()));

        let entry = clone.to_entry();
        assert_eq!(entry.seqno(), 11);
        assert_eq!(entry.vbuuid, 99);
        assert_eq!(entry.vbno, 3);
    }
}
