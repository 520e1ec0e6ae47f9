//! Copy-on-write mutation context
//!
//! Every write walks the tree through [`Cow`]. A node reachable from any
//! outstanding snapshot or reader is shared (`Arc` count above one) and is
//! cloned before it is touched, the replaced original is handed to the
//! reclaim list (MVCC) or released right away (locked tree). Exclusive nodes
//! are mutated in place.
//!
//! All fallible allocation for a write happens before the walk: clones draw
//! from the key arena's overdraft, so a walk never fails half way.
//!
//! Rebalancing follows the 2-3 left-leaning red-black rules:
//! - no right-leaning red links
//! - no red node with a red left child
//! - equal black height on every path

use super::node::{Link, Llrbnode};
use crate::storage::malloc::Arena;
use std::cmp::Ordering;
use std::sync::Arc;

pub(crate) struct Cow<'a> {
    keys: &'a Arena,
    reclaim: Option<&'a mut Vec<Arc<Llrbnode>>>,
    pub n_clones: usize,
    pub n_frees: usize,
    pub n_reclaims: usize,
}

pub(crate) fn is_red(link: &Link) -> bool {
    link.as_ref().map_or(false, |node| node.is_red())
}

fn is_red_left(link: &Link) -> bool {
    link.as_ref().map_or(false, |node| is_red(&node.left))
}

impl<'a> Cow<'a> {
    /// `reclaim` collects replaced nodes, `None` releases them immediately.
    pub fn new(keys: &'a Arena, reclaim: Option<&'a mut Vec<Arc<Llrbnode>>>) -> Self {
        Self { keys, reclaim, n_clones: 0, n_frees: 0, n_reclaims: 0 }
    }

    /// Hand a node that left the tree to the reclaim list.
    pub fn retire(&mut self, node: Arc<Llrbnode>) {
        match self.reclaim.as_mut() {
            Some(reclaim) => {
                self.n_reclaims += 1;
                reclaim.push(node);
            }
            None => {
                self.n_frees += 1;
                drop(node);
            }
        }
    }

    /// Exclusive access to the node behind `link`, cloning it if shared.
    fn own<'n>(&mut self, link: &'n mut Arc<Llrbnode>) -> &'n mut Llrbnode {
        if Arc::get_mut(link).is_none() {
            let clone = Arc::new(link.cow_clone(self.keys));
            let old = std::mem::replace(link, clone);
            self.n_clones += 1;
            self.retire(old);
        }
        Arc::get_mut(link).expect("copy-on-write clone is exclusive")
    }

    fn rotate_left(&mut self, link: &mut Arc<Llrbnode>) {
        let h = self.own(link);
        let mut x = h.right.take().expect("rotate left without right child");
        let black = h.is_black();
        {
            let xn = self.own(&mut x);
            assert!(xn.is_red(), "rotating a black link");
            h.right = xn.left.take();
            xn.set_black(black);
        }
        h.set_black(false);
        let h = std::mem::replace(link, x);
        self.own(link).left = Some(h);
    }

    fn rotate_right(&mut self, link: &mut Arc<Llrbnode>) {
        let h = self.own(link);
        let mut x = h.left.take().expect("rotate right without left child");
        let black = h.is_black();
        {
            let xn = self.own(&mut x);
            assert!(xn.is_red(), "rotating a black link");
            h.left = xn.right.take();
            xn.set_black(black);
        }
        h.set_black(false);
        let h = std::mem::replace(link, x);
        self.own(link).right = Some(h);
    }

    fn flip(&mut self, link: &mut Arc<Llrbnode>) {
        let h = self.own(link);
        h.toggle_link();
        if let Some(left) = h.left.as_mut() {
            self.own(left).toggle_link();
        }
        if let Some(right) = h.right.as_mut() {
            self.own(right).toggle_link();
        }
    }

    fn move_red_left(&mut self, link: &mut Arc<Llrbnode>) {
        self.flip(link);
        if is_red_left(&link.right) {
            let h = self.own(link);
            if let Some(right) = h.right.as_mut() {
                self.rotate_right(right);
            }
            self.rotate_left(link);
            self.flip(link);
        }
    }

    fn move_red_right(&mut self, link: &mut Arc<Llrbnode>) {
        self.flip(link);
        if is_red_left(&link.left) {
            self.rotate_right(link);
            self.flip(link);
        }
    }

    fn fixup(&mut self, link: &mut Arc<Llrbnode>) {
        if is_red(&link.right) {
            self.rotate_left(link);
        }
        if is_red(&link.left) && is_red_left(&link.left) {
            self.rotate_right(link);
        }
        if is_red(&link.left) && is_red(&link.right) {
            self.flip(link);
        }
    }

    fn insert_fixup(&mut self, link: &mut Arc<Llrbnode>) {
        if is_red(&link.right) && !is_red(&link.left) {
            self.rotate_left(link);
        }
        if is_red(&link.left) && is_red_left(&link.left) {
            self.rotate_right(link);
        }
        if is_red(&link.left) && is_red(&link.right) {
            self.flip(link);
        }
    }

    /// Insert `node`, or put it in place of the node with the same key.
    /// Returns the replaced node, the caller retires it.
    pub fn upsert(&mut self, root: &mut Link, node: Llrbnode) -> Option<Arc<Llrbnode>> {
        let old = self.insert(root, node);
        if let Some(root) = root.as_mut() {
            if root.is_red() {
                self.own(root).set_black(true);
            }
        }
        old
    }

    fn insert(&mut self, link: &mut Link, mut node: Llrbnode) -> Option<Arc<Llrbnode>> {
        let arc = match link {
            None => {
                *link = Some(Arc::new(node));
                return None;
            }
            Some(arc) => arc,
        };
        let old = match node.key().cmp(arc.key()) {
            Ordering::Less => {
                let h = self.own(arc);
                self.insert(&mut h.left, node)
            }
            Ordering::Greater => {
                let h = self.own(arc);
                self.insert(&mut h.right, node)
            }
            Ordering::Equal => {
                node.left = arc.left.clone();
                node.right = arc.right.clone();
                node.set_black(arc.is_black());
                return Some(std::mem::replace(arc, Arc::new(node)));
            }
        };
        self.insert_fixup(arc);
        old
    }

    /// Exclusive access to the node holding `key`, cloning the path to it.
    pub fn find_mut<'n>(&mut self, mut link: &'n mut Link, key: &[u8]) -> Option<&'n mut Llrbnode> {
        loop {
            let arc = link.as_mut()?;
            let h = self.own(arc);
            match key.cmp(h.key()) {
                Ordering::Less => link = &mut h.left,
                Ordering::Greater => link = &mut h.right,
                Ordering::Equal => return Some(h),
            }
        }
    }

    /// Remove the node holding `key`, the caller retires it.
    pub fn delete(&mut self, root: &mut Link, key: &[u8]) -> Option<Arc<Llrbnode>> {
        let deleted = self.delete_at(root, key);
        self.blacken(root);
        deleted
    }

    pub fn delete_min(&mut self, root: &mut Link) -> Option<Arc<Llrbnode>> {
        let deleted = self.delete_min_at(root);
        self.blacken(root);
        deleted
    }

    pub fn delete_max(&mut self, root: &mut Link) -> Option<Arc<Llrbnode>> {
        let deleted = self.delete_max_at(root);
        self.blacken(root);
        deleted
    }

    fn blacken(&mut self, root: &mut Link) {
        if let Some(root) = root.as_mut() {
            if root.is_red() {
                self.own(root).set_black(true);
            }
        }
    }

    fn delete_at(&mut self, link: &mut Link, key: &[u8]) -> Option<Arc<Llrbnode>> {
        let arc = link.as_mut()?;
        let deleted;
        if key < arc.key() {
            if arc.left.is_none() {
                return None;
            }
            if !is_red(&arc.left) && !is_red_left(&arc.left) {
                self.move_red_left(arc);
            }
            let h = self.own(arc);
            deleted = self.delete_at(&mut h.left, key);
        } else {
            if is_red(&arc.left) {
                self.rotate_right(arc);
            }
            if key == arc.key() && arc.right.is_none() {
                return link.take();
            }
            if arc.right.is_some() && !is_red(&arc.right) && !is_red_left(&arc.right) {
                self.move_red_right(arc);
            }
            if key == arc.key() {
                let h = self.own(arc);
                let mut min = self.delete_min_at(&mut h.right).expect("right subtree has a minimum");
                let (left, right, black) = (h.left.take(), h.right.take(), h.is_black());
                let m = self.own(&mut min);
                m.left = left;
                m.right = right;
                m.set_black(black);
                deleted = Some(std::mem::replace(arc, min));
            } else {
                let h = self.own(arc);
                deleted = self.delete_at(&mut h.right, key);
            }
        }
        self.fixup(arc);
        deleted
    }

    fn delete_min_at(&mut self, link: &mut Link) -> Option<Arc<Llrbnode>> {
        let arc = link.as_mut()?;
        if arc.left.is_none() {
            return link.take();
        }
        if !is_red(&arc.left) && !is_red_left(&arc.left) {
            self.move_red_left(arc);
        }
        let h = self.own(arc);
        let deleted = self.delete_min_at(&mut h.left);
        self.fixup(arc);
        deleted
    }

    fn delete_max_at(&mut self, link: &mut Link) -> Option<Arc<Llrbnode>> {
        let arc = link.as_mut()?;
        if is_red(&arc.left) {
            self.rotate_right(arc);
        }
        if arc.right.is_none() {
            return link.take();
        }
        if !is_red(&arc.right) && !is_red_left(&arc.right) {
            self.move_red_right(arc);
        }
        let h = self.own(arc);
        let deleted = self.delete_max_at(&mut h.right);
        self.fixup(arc);
        deleted
    }
}
