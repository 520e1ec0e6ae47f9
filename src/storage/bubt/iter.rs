//! Range iteration over a snapshot
//!
//! The iterator keeps one frame per m-block level from the root down to
//! the current z-block. It owns its scratch blocks and a handle on the
//! snapshot, so it outlives the `Snapshot` it came from.

use super::mblock::{Child, MBlockView};
use super::snapshot::Inner;
use super::zblock::ZBlockView;
use crate::types::{Entry, KeyRange};
use crate::Result;
use std::sync::Arc;

struct Frame {
    buf: Vec<u8>,
    idx: usize,
    count: usize,
}

struct Leaf {
    buf: Vec<u8>,
    shard: usize,
    /// Forward: next entry to yield. Reverse: one past it.
    pos: usize,
    count: usize,
}

pub struct BubtIter {
    inner: Arc<Inner>,
    range: KeyRange,
    reverse: bool,
    stack: Vec<Frame>,
    leaf: Option<Leaf>,
    started: bool,
    done: bool,
}

impl BubtIter {
    pub(crate) fn new(inner: Arc<Inner>, range: KeyRange, reverse: bool) -> Self {
        Self { inner, range, reverse, stack: Vec::new(), leaf: None, started: false, done: false }
    }

    /// Position on the first entry within range.
    fn seek(&mut self) -> Result<()> {
        let mut child = match self.inner.settings.rootblock {
            Some(root) => Child::MBlock(root),
            None => {
                self.done = true;
                return Ok(());
            }
        };
        loop {
            match child {
                Child::MBlock(offset) => {
                    let buf = self.inner.read_mblock(offset)?;
                    let view = MBlockView::new(&buf)?;
                    let count = view.len();
                    let idx = match (self.reverse, &self.range.low, &self.range.high) {
                        (false, None, _) => 0,
                        (false, Some(low), _) => view.floor(low)?.unwrap_or(0),
                        (true, _, None) => count - 1,
                        (true, _, Some(high)) => match view.floor(high)? {
                            Some(idx) => idx,
                            None => {
                                self.inner.recycle_m(buf);
                                self.done = true;
                                return Ok(());
                            }
                        },
                    };
                    child = view.child(idx)?;
                    self.stack.push(Frame { buf, idx, count });
                }
                Child::ZBlock { shard, offset } => {
                    let buf = self.inner.read_zblock(shard, offset)?;
                    let view = ZBlockView::new(&buf)?;
                    let count = view.len();
                    let pos = match (self.reverse, &self.range.low, &self.range.high) {
                        (false, None, _) => 0,
                        (false, Some(low), _) => match view.search(low)? {
                            Ok(i) if self.range.incl.low() => i,
                            Ok(i) => i + 1,
                            Err(i) => i,
                        },
                        (true, _, None) => count,
                        (true, _, Some(high)) => match view.search(high)? {
                            Ok(i) if self.range.incl.high() => i + 1,
                            Ok(i) => i,
                            Err(i) => i,
                        },
                    };
                    self.leaf = Some(Leaf { buf, shard, pos, count });
                    return Ok(());
                }
            }
        }
    }

    /// Step to the next leaf in iteration order, false past the last one.
    fn next_leaf(&mut self) -> Result<bool> {
        loop {
            let child = match self.stack.last_mut() {
                None => return Ok(false),
                Some(frame) => {
                    let next = if self.reverse {
                        frame.idx.checked_sub(1)
                    } else if frame.idx + 1 < frame.count {
                        Some(frame.idx + 1)
                    } else {
                        None
                    };
                    match next {
                        Some(idx) => {
                            frame.idx = idx;
                            Some(MBlockView::new(&frame.buf)?.child(idx)?)
                        }
                        None => None,
                    }
                }
            };
            match child {
                Some(child) => {
                    self.descend(child)?;
                    return Ok(true);
                }
                None => {
                    if let Some(frame) = self.stack.pop() {
                        self.inner.recycle_m(frame.buf);
                    }
                }
            }
        }
    }

    /// Walk down to the first (or, reverse, last) leaf under `child`.
    fn descend(&mut self, mut child: Child) -> Result<()> {
        loop {
            match child {
                Child::MBlock(offset) => {
                    let buf = self.inner.read_mblock(offset)?;
                    let view = MBlockView::new(&buf)?;
                    let count = view.len();
                    let idx = if self.reverse { count - 1 } else { 0 };
                    child = view.child(idx)?;
                    self.stack.push(Frame { buf, idx, count });
                }
                Child::ZBlock { shard, offset } => {
                    let buf = self.inner.read_zblock(shard, offset)?;
                    let count = ZBlockView::new(&buf)?.len();
                    let pos = if self.reverse { count } else { 0 };
                    self.leaf = Some(Leaf { buf, shard, pos, count });
                    return Ok(());
                }
            }
        }
    }

    fn next_entry(&mut self) -> Result<Option<Entry>> {
        if !self.started {
            self.started = true;
            self.seek()?;
        }
        while !self.done {
            if let Some(leaf) = self.leaf.as_mut() {
                let at = if self.reverse {
                    leaf.pos.checked_sub(1)
                } else if leaf.pos < leaf.count {
                    Some(leaf.pos)
                } else {
                    None
                };
                if let Some(i) = at {
                    leaf.pos = if self.reverse { i } else { i + 1 };
                    let zentry = ZBlockView::new(&leaf.buf)?.entry(i)?;
                    let in_range = if self.reverse {
                        self.range.above_low(zentry.key)
                    } else {
                        self.range.below_high(zentry.key)
                    };
                    if in_range {
                        return self.inner.resolve(leaf.shard, &zentry).map(Some);
                    }
                    self.close();
                    return Ok(None);
                }
            }
            if let Some(leaf) = self.leaf.take() {
                self.inner.recycle_z(leaf.buf);
            }
            if !self.next_leaf()? {
                self.close();
            }
        }
        Ok(None)
    }

    fn close(&mut self) {
        self.done = true;
        if let Some(leaf) = self.leaf.take() {
            self.inner.recycle_z(leaf.buf);
        }
        for frame in self.stack.drain(..) {
            self.inner.recycle_m(frame.buf);
        }
    }
}

impl Iterator for BubtIter {
    type Item = Result<Entry>;

    fn next(&mut self) -> Option<Self::Item> {
        match self.next_entry() {
            Ok(Some(entry)) => Some(Ok(entry)),
            Ok(None) => None,
            Err(err) => {
                self.close();
                Some(Err(err))
            }
        }
    }
}

impl Drop for BubtIter {
    fn drop(&mut self) {
        self.close();
    }
}
