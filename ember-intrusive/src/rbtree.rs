//! Intrusive Red-Black Tree
//!
//! Balanced search tree threaded through [`RbLink`]s embedded in the
//! elements. Ordering comes entirely from the [`TreeAdapter`], which can also
//! compare a bare key against an element so lookups do not need a probe
//! object.
//!
//! # Duplicate keys
//!
//! Keys are unique. [`RbTree::insert`] refuses an element that compares equal
//! to one already present and returns the resident element instead.
//!
//! # Algorithm
//!
//! Insertion and removal follow the classic parent-pointer formulation
//! (rotate + recolour fix-ups after a plain BST insert/remove). The NULL id
//! stands in for the black leaf sentinel.

use core::cmp::Ordering;
use crate::arena::{Arena, NodeId};

/// Node colour.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Color {
    Red,
    #[default]
    Black,
}

/// Link fields embedded in a tree element.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct RbLink {
    parent: NodeId,
    left: NodeId,
    right: NodeId,
    color: Color,
    linked: bool,
}

impl RbLink {
    /// An unlinked link.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            parent: NodeId::NULL,
            left: NodeId::NULL,
            right: NodeId::NULL,
            color: Color::Black,
            linked: false,
        }
    }

    #[inline]
    #[must_use]
    pub const fn is_linked(&self) -> bool {
        self.linked
    }

    #[inline]
    #[must_use]
    pub const fn color(&self) -> Color {
        self.color
    }
}

/// Selects the [`RbLink`] and the ordering a tree uses.
pub trait TreeAdapter {
    type Value;
    type Key: ?Sized;

    fn link<'a>(&self, value: &'a Self::Value) -> &'a RbLink;
    fn link_mut<'a>(&self, value: &'a mut Self::Value) -> &'a mut RbLink;

    /// Order of `a` relative to `b`.
    fn compare(&self, a: &Self::Value, b: &Self::Value) -> Ordering;

    /// Order of `key` relative to `value`.
    fn compare_key(&self, key: &Self::Key, value: &Self::Value) -> Ordering;
}

/// Structural problem found by [`RbTree::validate`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RbViolation {
    /// The root is red
    RedRoot,
    /// A red node has a red child
    RedRed(NodeId),
    /// Paths below this node have different black counts
    BlackHeight(NodeId),
    /// A child's parent link does not point back
    Parent(NodeId),
    /// In-order sequence is not strictly increasing at this node
    Order(NodeId),
    /// A reachable node is not marked linked
    Unlinked(NodeId),
}

/// An intrusive red-black tree.
#[derive(Debug)]
pub struct RbTree<A: TreeAdapter> {
    root: NodeId,
    adapter: A,
}

impl<A: TreeAdapter + Default> Default for RbTree<A> {
    fn default() -> Self {
        Self::new(A::default())
    }
}

impl<A: TreeAdapter> RbTree<A> {
    /// Create an empty tree.
    #[must_use]
    pub const fn new(adapter: A) -> Self {
        Self {
            root: NodeId::NULL,
            adapter,
        }
    }

    #[inline]
    #[must_use]
    pub fn adapter(&self) -> &A {
        &self.adapter
    }

    #[inline]
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.root.is_null()
    }

    #[inline]
    #[must_use]
    pub fn root(&self) -> Option<NodeId> {
        self.root.to_option()
    }

    /// Number of elements. Walks the whole tree.
    #[must_use]
    pub fn len(&self, arena: &Arena<A::Value>) -> usize {
        self.iter(arena).count()
    }

    // -- Link accessors

    #[inline]
    fn link<'a>(&self, arena: &'a Arena<A::Value>, id: NodeId) -> &'a RbLink {
        self.adapter.link(&arena[id])
    }

    #[inline]
    fn link_mut<'a>(&self, arena: &'a mut Arena<A::Value>, id: NodeId) -> &'a mut RbLink {
        self.adapter.link_mut(&mut arena[id])
    }

    #[inline]
    fn parent(&self, arena: &Arena<A::Value>, id: NodeId) -> NodeId {
        self.link(arena, id).parent
    }

    #[inline]
    fn left(&self, arena: &Arena<A::Value>, id: NodeId) -> NodeId {
        self.link(arena, id).left
    }

    #[inline]
    fn right(&self, arena: &Arena<A::Value>, id: NodeId) -> NodeId {
        self.link(arena, id).right
    }

    #[inline]
    fn is_red(&self, arena: &Arena<A::Value>, id: NodeId) -> bool {
        !id.is_null() && self.link(arena, id).color == Color::Red
    }

    #[inline]
    fn is_black(&self, arena: &Arena<A::Value>, id: NodeId) -> bool {
        !self.is_red(arena, id)
    }

    #[inline]
    fn set_color(&self, arena: &mut Arena<A::Value>, id: NodeId, color: Color) {
        self.link_mut(arena, id).color = color;
    }

    /// Point `parent`'s child slot that held `old` at `new`, or the root when
    /// `parent` is NULL.
    fn replace_child(&mut self, arena: &mut Arena<A::Value>, parent: NodeId, old: NodeId, new: NodeId) {
        if parent.is_null() {
            self.root = new;
        } else if self.left(arena, parent) == old {
            self.link_mut(arena, parent).left = new;
        } else {
            self.link_mut(arena, parent).right = new;
        }
    }

    // -- Rotations

    fn rotate_left(&mut self, arena: &mut Arena<A::Value>, elm: NodeId) {
        let tmp = self.right(arena, elm);
        let tmp_left = self.left(arena, tmp);

        self.link_mut(arena, elm).right = tmp_left;
        if !tmp_left.is_null() {
            self.link_mut(arena, tmp_left).parent = elm;
        }

        let parent = self.parent(arena, elm);
        self.link_mut(arena, tmp).parent = parent;
        self.replace_child(arena, parent, elm, tmp);

        self.link_mut(arena, tmp).left = elm;
        self.link_mut(arena, elm).parent = tmp;
    }

    fn rotate_right(&mut self, arena: &mut Arena<A::Value>, elm: NodeId) {
        let tmp = self.left(arena, elm);
        let tmp_right = self.right(arena, tmp);

        self.link_mut(arena, elm).left = tmp_right;
        if !tmp_right.is_null() {
            self.link_mut(arena, tmp_right).parent = elm;
        }

        let parent = self.parent(arena, elm);
        self.link_mut(arena, tmp).parent = parent;
        self.replace_child(arena, parent, elm, tmp);

        self.link_mut(arena, tmp).right = elm;
        self.link_mut(arena, elm).parent = tmp;
    }

    // -- Insertion

    /// Insert `id`, keeping the tree balanced.
    ///
    /// Returns `Err(existing)` without modifying the tree when an element
    /// comparing equal is already present.
    ///
    /// # Panics
    ///
    /// Panics if `id` is already linked through this adapter's link.
    pub fn insert(&mut self, arena: &mut Arena<A::Value>, id: NodeId) -> Result<(), NodeId> {
        assert!(!self.link(arena, id).linked, "tree insert of linked node {id:?}");

        let mut parent = NodeId::NULL;
        let mut cur = self.root;
        let mut went_left = false;
        while !cur.is_null() {
            parent = cur;
            match self.adapter.compare(&arena[id], &arena[cur]) {
                Ordering::Less => {
                    went_left = true;
                    cur = self.left(arena, cur);
                }
                Ordering::Greater => {
                    went_left = false;
                    cur = self.right(arena, cur);
                }
                Ordering::Equal => return Err(cur),
            }
        }

        *self.link_mut(arena, id) = RbLink {
            parent,
            left: NodeId::NULL,
            right: NodeId::NULL,
            color: Color::Red,
            linked: true,
        };

        if parent.is_null() {
            self.root = id;
        } else if went_left {
            self.link_mut(arena, parent).left = id;
        } else {
            self.link_mut(arena, parent).right = id;
        }

        self.insert_fixup(arena, id);
        Ok(())
    }

    fn insert_fixup(&mut self, arena: &mut Arena<A::Value>, mut elm: NodeId) {
        loop {
            let mut parent = self.parent(arena, elm);
            if parent.is_null() || self.is_black(arena, parent) {
                break;
            }
            // A red parent is never the root, so the grandparent exists
            let gparent = self.parent(arena, parent);

            if parent == self.left(arena, gparent) {
                let uncle = self.right(arena, gparent);
                if self.is_red(arena, uncle) {
                    self.set_color(arena, uncle, Color::Black);
                    self.set_color(arena, parent, Color::Black);
                    self.set_color(arena, gparent, Color::Red);
                    elm = gparent;
                    continue;
                }
                if self.right(arena, parent) == elm {
                    self.rotate_left(arena, parent);
                    core::mem::swap(&mut parent, &mut elm);
                }
                self.set_color(arena, parent, Color::Black);
                self.set_color(arena, gparent, Color::Red);
                self.rotate_right(arena, gparent);
            } else {
                let uncle = self.left(arena, gparent);
                if self.is_red(arena, uncle) {
                    self.set_color(arena, uncle, Color::Black);
                    self.set_color(arena, parent, Color::Black);
                    self.set_color(arena, gparent, Color::Red);
                    elm = gparent;
                    continue;
                }
                if self.left(arena, parent) == elm {
                    self.rotate_right(arena, parent);
                    core::mem::swap(&mut parent, &mut elm);
                }
                self.set_color(arena, parent, Color::Black);
                self.set_color(arena, gparent, Color::Red);
                self.rotate_left(arena, gparent);
            }
        }

        let root = self.root;
        self.set_color(arena, root, Color::Black);
    }

    // -- Removal

    /// Remove `id` and return its in-order successor.
    ///
    /// # Panics
    ///
    /// Panics if `id` is not linked.
    pub fn erase(&mut self, arena: &mut Arena<A::Value>, id: NodeId) -> Option<NodeId> {
        assert!(self.link(arena, id).linked, "tree erase of unlinked node {id:?}");
        let next = self.next(arena, id);
        self.remove(arena, id);
        next
    }

    fn remove(&mut self, arena: &mut Arena<A::Value>, old: NodeId) {
        let old_link = *self.link(arena, old);
        let child;
        let mut parent;
        let color;

        if old_link.left.is_null() || old_link.right.is_null() {
            child = if old_link.left.is_null() { old_link.right } else { old_link.left };
            parent = old_link.parent;
            color = old_link.color;

            if !child.is_null() {
                self.link_mut(arena, child).parent = parent;
            }
            self.replace_child(arena, parent, old, child);
        } else {
            // Two children: splice out the successor and move it into old's place
            let mut elm = old_link.right;
            while !self.left(arena, elm).is_null() {
                elm = self.left(arena, elm);
            }

            child = self.right(arena, elm);
            parent = self.parent(arena, elm);
            color = self.link(arena, elm).color;

            if !child.is_null() {
                self.link_mut(arena, child).parent = parent;
            }
            self.replace_child(arena, parent, elm, child);
            if parent == old {
                parent = elm;
            }

            // Re-read: old's right slot may have just been rewritten
            let old_link = *self.link(arena, old);
            *self.link_mut(arena, elm) = old_link;
            self.replace_child(arena, old_link.parent, old, elm);
            self.link_mut(arena, old_link.left).parent = elm;
            if !old_link.right.is_null() {
                self.link_mut(arena, old_link.right).parent = elm;
            }
        }

        *self.link_mut(arena, old) = RbLink::new();

        if color == Color::Black {
            self.remove_fixup(arena, parent, child);
        }
    }

    fn remove_fixup(&mut self, arena: &mut Arena<A::Value>, mut parent: NodeId, mut elm: NodeId) {
        while self.is_black(arena, elm) && elm != self.root {
            if self.left(arena, parent) == elm {
                let mut sib = self.right(arena, parent);
                if self.is_red(arena, sib) {
                    self.set_color(arena, sib, Color::Black);
                    self.set_color(arena, parent, Color::Red);
                    self.rotate_left(arena, parent);
                    sib = self.right(arena, parent);
                }
                let (sl, sr) = (self.left(arena, sib), self.right(arena, sib));
                if self.is_black(arena, sl) && self.is_black(arena, sr) {
                    self.set_color(arena, sib, Color::Red);
                    elm = parent;
                    parent = self.parent(arena, elm);
                } else {
                    if self.is_black(arena, sr) {
                        self.set_color(arena, sl, Color::Black);
                        self.set_color(arena, sib, Color::Red);
                        self.rotate_right(arena, sib);
                        sib = self.right(arena, parent);
                    }
                    let parent_color = self.link(arena, parent).color;
                    self.set_color(arena, sib, parent_color);
                    self.set_color(arena, parent, Color::Black);
                    let sr = self.right(arena, sib);
                    if !sr.is_null() {
                        self.set_color(arena, sr, Color::Black);
                    }
                    self.rotate_left(arena, parent);
                    elm = self.root;
                    break;
                }
            } else {
                let mut sib = self.left(arena, parent);
                if self.is_red(arena, sib) {
                    self.set_color(arena, sib, Color::Black);
                    self.set_color(arena, parent, Color::Red);
                    self.rotate_right(arena, parent);
                    sib = self.left(arena, parent);
                }
                let (sl, sr) = (self.left(arena, sib), self.right(arena, sib));
                if self.is_black(arena, sl) && self.is_black(arena, sr) {
                    self.set_color(arena, sib, Color::Red);
                    elm = parent;
                    parent = self.parent(arena, elm);
                } else {
                    if self.is_black(arena, sl) {
                        self.set_color(arena, sr, Color::Black);
                        self.set_color(arena, sib, Color::Red);
                        self.rotate_left(arena, sib);
                        sib = self.left(arena, parent);
                    }
                    let parent_color = self.link(arena, parent).color;
                    self.set_color(arena, sib, parent_color);
                    self.set_color(arena, parent, Color::Black);
                    let sl = self.left(arena, sib);
                    if !sl.is_null() {
                        self.set_color(arena, sl, Color::Black);
                    }
                    self.rotate_right(arena, parent);
                    elm = self.root;
                    break;
                }
            }
        }

        if !elm.is_null() {
            self.set_color(arena, elm, Color::Black);
        }
    }

    // -- Lookup

    /// Element comparing equal to `probe`.
    #[must_use]
    pub fn find(&self, arena: &Arena<A::Value>, probe: &A::Value) -> Option<NodeId> {
        let mut cur = self.root;
        while !cur.is_null() {
            match self.adapter.compare(probe, &arena[cur]) {
                Ordering::Less => cur = self.left(arena, cur),
                Ordering::Greater => cur = self.right(arena, cur),
                Ordering::Equal => return Some(cur),
            }
        }
        None
    }

    /// Element whose key equals `key`.
    #[must_use]
    pub fn find_key(&self, arena: &Arena<A::Value>, key: &A::Key) -> Option<NodeId> {
        let mut cur = self.root;
        while !cur.is_null() {
            match self.adapter.compare_key(key, &arena[cur]) {
                Ordering::Less => cur = self.left(arena, cur),
                Ordering::Greater => cur = self.right(arena, cur),
                Ordering::Equal => return Some(cur),
            }
        }
        None
    }

    /// Smallest element not less than `probe`.
    #[must_use]
    pub fn nfind(&self, arena: &Arena<A::Value>, probe: &A::Value) -> Option<NodeId> {
        let mut cur = self.root;
        let mut best = NodeId::NULL;
        while !cur.is_null() {
            match self.adapter.compare(probe, &arena[cur]) {
                Ordering::Less => {
                    best = cur;
                    cur = self.left(arena, cur);
                }
                Ordering::Greater => cur = self.right(arena, cur),
                Ordering::Equal => return Some(cur),
            }
        }
        best.to_option()
    }

    /// Smallest element whose key is not less than `key`.
    #[must_use]
    pub fn nfind_key(&self, arena: &Arena<A::Value>, key: &A::Key) -> Option<NodeId> {
        let mut cur = self.root;
        let mut best = NodeId::NULL;
        while !cur.is_null() {
            match self.adapter.compare_key(key, &arena[cur]) {
                Ordering::Less => {
                    best = cur;
                    cur = self.left(arena, cur);
                }
                Ordering::Greater => cur = self.right(arena, cur),
                Ordering::Equal => return Some(cur),
            }
        }
        best.to_option()
    }

    // -- Traversal

    fn leftmost(&self, arena: &Arena<A::Value>, mut id: NodeId) -> NodeId {
        while !id.is_null() {
            let left = self.left(arena, id);
            if left.is_null() {
                break;
            }
            id = left;
        }
        id
    }

    fn rightmost(&self, arena: &Arena<A::Value>, mut id: NodeId) -> NodeId {
        while !id.is_null() {
            let right = self.right(arena, id);
            if right.is_null() {
                break;
            }
            id = right;
        }
        id
    }

    /// Smallest element.
    #[must_use]
    pub fn first(&self, arena: &Arena<A::Value>) -> Option<NodeId> {
        self.leftmost(arena, self.root).to_option()
    }

    /// Largest element.
    #[must_use]
    pub fn last(&self, arena: &Arena<A::Value>) -> Option<NodeId> {
        self.rightmost(arena, self.root).to_option()
    }

    /// In-order successor of `id`.
    #[must_use]
    pub fn next(&self, arena: &Arena<A::Value>, id: NodeId) -> Option<NodeId> {
        let right = self.right(arena, id);
        if !right.is_null() {
            return Some(self.leftmost(arena, right));
        }
        let mut elm = id;
        let mut parent = self.parent(arena, elm);
        while !parent.is_null() && elm == self.right(arena, parent) {
            elm = parent;
            parent = self.parent(arena, elm);
        }
        parent.to_option()
    }

    /// In-order predecessor of `id`.
    #[must_use]
    pub fn prev(&self, arena: &Arena<A::Value>, id: NodeId) -> Option<NodeId> {
        let left = self.left(arena, id);
        if !left.is_null() {
            return Some(self.rightmost(arena, left));
        }
        let mut elm = id;
        let mut parent = self.parent(arena, elm);
        while !parent.is_null() && elm == self.left(arena, parent) {
            elm = parent;
            parent = self.parent(arena, elm);
        }
        parent.to_option()
    }

    /// Iterate element ids in ascending order.
    pub fn iter<'a>(&'a self, arena: &'a Arena<A::Value>) -> Iter<'a, A> {
        Iter {
            tree: self,
            arena,
            front: self.leftmost(arena, self.root),
            back: self.rightmost(arena, self.root),
        }
    }

    // -- Verification

    /// Check every red-black and ordering invariant.
    ///
    /// Returns the black height of the tree.
    pub fn validate(&self, arena: &Arena<A::Value>) -> Result<usize, RbViolation> {
        if self.root.is_null() {
            return Ok(0);
        }
        if self.is_red(arena, self.root) {
            return Err(RbViolation::RedRoot);
        }
        if !self.parent(arena, self.root).is_null() {
            return Err(RbViolation::Parent(self.root));
        }
        let height = self.validate_subtree(arena, self.root)?;

        let mut prev: Option<NodeId> = None;
        for id in self.iter(arena) {
            if let Some(p) = prev {
                if self.adapter.compare(&arena[p], &arena[id]) != Ordering::Less {
                    return Err(RbViolation::Order(id));
                }
            }
            prev = Some(id);
        }
        Ok(height)
    }

    fn validate_subtree(&self, arena: &Arena<A::Value>, id: NodeId) -> Result<usize, RbViolation> {
        if id.is_null() {
            return Ok(1);
        }
        let link = self.link(arena, id);
        if !link.linked {
            return Err(RbViolation::Unlinked(id));
        }
        for child in [link.left, link.right] {
            if child.is_null() {
                continue;
            }
            if self.parent(arena, child) != id {
                return Err(RbViolation::Parent(child));
            }
            if link.color == Color::Red && self.is_red(arena, child) {
                return Err(RbViolation::RedRed(child));
            }
        }
        let lh = self.validate_subtree(arena, link.left)?;
        let rh = self.validate_subtree(arena, link.right)?;
        if lh != rh {
            return Err(RbViolation::BlackHeight(id));
        }
        Ok(lh + usize::from(link.color == Color::Black))
    }

    /// Longest root-to-leaf path, counted in nodes.
    #[must_use]
    pub fn height(&self, arena: &Arena<A::Value>) -> usize {
        self.height_of(arena, self.root)
    }

    fn height_of(&self, arena: &Arena<A::Value>, id: NodeId) -> usize {
        if id.is_null() {
            return 0;
        }
        let link = self.link(arena, id);
        1 + self.height_of(arena, link.left).max(self.height_of(arena, link.right))
    }
}

/// Double-ended in-order iterator over an [`RbTree`].
///
/// Invalidated by removing the element it is positioned on.
pub struct Iter<'a, A: TreeAdapter> {
    tree: &'a RbTree<A>,
    arena: &'a Arena<A::Value>,
    front: NodeId,
    back: NodeId,
}

impl<A: TreeAdapter> Iterator for Iter<'_, A> {
    type Item = NodeId;

    fn next(&mut self) -> Option<NodeId> {
        let id = self.front.to_option()?;
        if id == self.back {
            self.front = NodeId::NULL;
            self.back = NodeId::NULL;
        } else {
            self.front = NodeId::from_option(self.tree.next(self.arena, id));
        }
        Some(id)
    }
}

impl<A: TreeAdapter> DoubleEndedIterator for Iter<'_, A> {
    fn next_back(&mut self) -> Option<NodeId> {
        let id = self.back.to_option()?;
        if id == self.front {
            self.front = NodeId::NULL;
            self.back = NodeId::NULL;
        } else {
            self.back = NodeId::from_option(self.tree.prev(self.arena, id));
        }
        Some(id)
    }
}
