//! Read-side traversal: point lookups, callback ranges and owned iterators

use super::node::{Link, Llrbnode};
use super::snapshot::LlrbSnapshot;
use crate::types::{Entry, KeyRange};
use crate::Result;
use std::cmp::Ordering;
use std::sync::Arc;

pub(crate) fn get<'a>(root: &'a Link, key: &[u8]) -> Option<&'a Llrbnode> {
    let mut link = root;
    while let Some(node) = link {
        match key.cmp(node.key()) {
            Ordering::Less => link = &node.left,
            Ordering::Greater => link = &node.right,
            Ordering::Equal => return Some(node),
        }
    }
    None
}

pub(crate) fn min(root: &Link) -> Option<&Llrbnode> {
    let mut node = root.as_deref()?;
    while let Some(left) = node.left.as_deref() {
        node = left;
    }
    Some(node)
}

pub(crate) fn max(root: &Link) -> Option<&Llrbnode> {
    let mut node = root.as_deref()?;
    while let Some(right) = node.right.as_deref() {
        node = right;
    }
    Some(node)
}

/// In-order walk over `range`, returns false once the callback asked to stop.
pub(crate) fn range_walk(
    link: &Link,
    range: &KeyRange,
    reverse: bool,
    callback: &mut dyn FnMut(&Llrbnode) -> bool,
) -> bool {
    let node = match link {
        Some(node) => node,
        None => return true,
    };
    let above = range.above_low(node.key());
    let below = range.below_high(node.key());
    let (first, second) = if reverse { (&node.right, &node.left) } else { (&node.left, &node.right) };
    let (visit_first, visit_second) = if reverse { (below, above) } else { (above, below) };

    if visit_first && !range_walk(first, range, reverse, callback) {
        return false;
    }
    if above && below && !callback(node) {
        return false;
    }
    if visit_second {
        return range_walk(second, range, reverse, callback);
    }
    true
}

/// Owned iterator over a snapshot, holds the snapshot alive while iterating.
pub struct LlrbIter {
    stack: Vec<Arc<Llrbnode>>,
    range: KeyRange,
    reverse: bool,
    _snapshot: Arc<LlrbSnapshot>,
}

impl LlrbIter {
    pub(crate) fn new(snapshot: Arc<LlrbSnapshot>, range: KeyRange, reverse: bool) -> Self {
        let mut stack = Vec::new();
        let mut link = snapshot.root.clone();
        while let Some(node) = link {
            if reverse {
                if range.below_high(node.key()) {
                    link = node.right.clone();
                    stack.push(node);
                } else {
                    link = node.left.clone();
                }
            } else if range.above_low(node.key()) {
                link = node.left.clone();
                stack.push(node);
            } else {
                link = node.right.clone();
            }
        }
        Self { stack, range, reverse, _snapshot: snapshot }
    }

    fn next_node(&mut self) -> Option<Arc<Llrbnode>> {
        let node = self.stack.pop()?;
        let in_range = if self.reverse {
            self.range.above_low(node.key())
        } else {
            self.range.below_high(node.key())
        };
        if !in_range {
            self.stack.clear();
            return None;
        }
        let mut link = if self.reverse { node.left.clone() } else { node.right.clone() };
        while let Some(child) = link {
            link = if self.reverse { child.right.clone() } else { child.left.clone() };
            self.stack.push(child);
        }
        Some(node)
    }
}

impl Iterator for LlrbIter {
    type Item = Result<Entry>;

    fn next(&mut self) -> Option<Self::Item> {
        self.next_node().map(|node| Ok(node.to_entry()))
    }
}
