//! Intrusive Doubly-Linked List
//!
//! The list stores only its two ends; every element carries a [`ListLink`]
//! inside itself. A NULL neighbour means "the list head", so walking off
//! either end brings you back to the sentinel, as in a circular list with a
//! head node.
//!
//! All operations borrow the [`Arena`] holding the elements. The list
//! neither allocates nor frees: destroying an element that is still linked
//! is a bug in the caller.

use crate::arena::{Arena, NodeId};

/// Link fields embedded in a list element.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ListLink {
    prev: NodeId,
    next: NodeId,
    linked: bool,
}

impl ListLink {
    /// An unlinked link.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            prev: NodeId::NULL,
            next: NodeId::NULL,
            linked: false,
        }
    }

    #[inline]
    #[must_use]
    pub const fn is_linked(&self) -> bool {
        self.linked
    }

    fn reset(&mut self) {
        *self = Self::new();
    }
}

/// Selects the [`ListLink`] a list threads through.
///
/// Adapters may carry state; an object with one link per core uses an
/// adapter holding the core index.
pub trait ListAdapter {
    type Value;

    fn link<'a>(&self, value: &'a Self::Value) -> &'a ListLink;
    fn link_mut<'a>(&self, value: &'a mut Self::Value) -> &'a mut ListLink;
}

/// An intrusive doubly-linked list.
#[derive(Debug)]
pub struct List<A: ListAdapter> {
    head: NodeId,
    tail: NodeId,
    adapter: A,
}

impl<A: ListAdapter + Default> Default for List<A> {
    fn default() -> Self {
        Self::new(A::default())
    }
}

impl<A: ListAdapter> List<A> {
    /// Create an empty list.
    #[must_use]
    pub const fn new(adapter: A) -> Self {
        Self {
            head: NodeId::NULL,
            tail: NodeId::NULL,
            adapter,
        }
    }

    #[inline]
    #[must_use]
    pub fn adapter(&self) -> &A {
        &self.adapter
    }

    #[inline]
    fn link<'a>(&self, arena: &'a Arena<A::Value>, id: NodeId) -> &'a ListLink {
        self.adapter.link(&arena[id])
    }

    #[inline]
    fn link_mut<'a>(&self, arena: &'a mut Arena<A::Value>, id: NodeId) -> &'a mut ListLink {
        self.adapter.link_mut(&mut arena[id])
    }

    #[inline]
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.head.is_null()
    }

    #[inline]
    #[must_use]
    pub fn front(&self) -> Option<NodeId> {
        self.head.to_option()
    }

    #[inline]
    #[must_use]
    pub fn back(&self) -> Option<NodeId> {
        self.tail.to_option()
    }

    /// Element after `id`, or `None` at the end.
    #[must_use]
    pub fn next(&self, arena: &Arena<A::Value>, id: NodeId) -> Option<NodeId> {
        self.link(arena, id).next.to_option()
    }

    /// Element before `id`, or `None` at the start.
    #[must_use]
    pub fn prev(&self, arena: &Arena<A::Value>, id: NodeId) -> Option<NodeId> {
        self.link(arena, id).prev.to_option()
    }

    /// Number of elements. Walks the whole list.
    #[must_use]
    pub fn len(&self, arena: &Arena<A::Value>) -> usize {
        self.iter(arena).count()
    }

    /// Link `id` in front of `pos`; `None` appends.
    ///
    /// # Panics
    ///
    /// Panics if `id` is already linked through this adapter's link.
    pub fn insert(&mut self, arena: &mut Arena<A::Value>, pos: Option<NodeId>, id: NodeId) {
        assert!(!self.link(arena, id).linked, "list insert of linked node {id:?}");

        let (prev, next) = match pos {
            Some(pos) => {
                debug_assert!(self.link(arena, pos).linked);
                (self.link(arena, pos).prev, pos)
            }
            None => (self.tail, NodeId::NULL),
        };

        let link = self.link_mut(arena, id);
        link.prev = prev;
        link.next = next;
        link.linked = true;

        if prev.is_null() {
            self.head = id;
        } else {
            self.link_mut(arena, prev).next = id;
        }
        if next.is_null() {
            self.tail = id;
        } else {
            self.link_mut(arena, next).prev = id;
        }
    }

    pub fn push_back(&mut self, arena: &mut Arena<A::Value>, id: NodeId) {
        self.insert(arena, None, id);
    }

    pub fn push_front(&mut self, arena: &mut Arena<A::Value>, id: NodeId) {
        let head = self.front();
        self.insert(arena, head, id);
    }

    /// Unlink `id` and return the element that followed it.
    ///
    /// # Panics
    ///
    /// Panics if `id` is not linked.
    pub fn erase(&mut self, arena: &mut Arena<A::Value>, id: NodeId) -> Option<NodeId> {
        let link = *self.link(arena, id);
        assert!(link.linked, "list erase of unlinked node {id:?}");
        debug_assert!(!link.prev.is_null() || self.head == id);
        debug_assert!(!link.next.is_null() || self.tail == id);

        if link.prev.is_null() {
            self.head = link.next;
        } else {
            self.link_mut(arena, link.prev).next = link.next;
        }
        if link.next.is_null() {
            self.tail = link.prev;
        } else {
            self.link_mut(arena, link.next).prev = link.prev;
        }

        self.link_mut(arena, id).reset();
        link.next.to_option()
    }

    /// Unlink and return the first element.
    pub fn pop_front(&mut self, arena: &mut Arena<A::Value>) -> Option<NodeId> {
        let id = self.front()?;
        self.erase(arena, id);
        Some(id)
    }

    /// Unlink and return the last element.
    pub fn pop_back(&mut self, arena: &mut Arena<A::Value>) -> Option<NodeId> {
        let id = self.back()?;
        self.erase(arena, id);
        Some(id)
    }

    /// Move `[first, last)` out of `other` and link it in front of `pos`.
    ///
    /// `last == None` takes everything from `first` to the end of `other`,
    /// and `pos == None` appends. Runs in constant time.
    pub fn splice(
        &mut self,
        arena: &mut Arena<A::Value>,
        pos: Option<NodeId>,
        other: &mut Self,
        first: NodeId,
        last: Option<NodeId>,
    ) {
        if Some(first) == last {
            return;
        }

        let range_last = match last {
            Some(last) => self.link(arena, last).prev,
            None => other.tail,
        };
        debug_assert!(!range_last.is_null());

        // Detach from `other`
        let before = self.link(arena, first).prev;
        let after = NodeId::from_option(last);
        if before.is_null() {
            other.head = after;
        } else {
            self.link_mut(arena, before).next = after;
        }
        if after.is_null() {
            other.tail = before;
        } else {
            self.link_mut(arena, after).prev = before;
        }

        // Attach in front of `pos`
        let (prev, next) = match pos {
            Some(pos) => (self.link(arena, pos).prev, pos),
            None => (self.tail, NodeId::NULL),
        };
        self.link_mut(arena, first).prev = prev;
        self.link_mut(arena, range_last).next = next;
        if prev.is_null() {
            self.head = first;
        } else {
            self.link_mut(arena, prev).next = first;
        }
        if next.is_null() {
            self.tail = range_last;
        } else {
            self.link_mut(arena, next).prev = range_last;
        }
    }

    /// Unlink every element.
    pub fn clear(&mut self, arena: &mut Arena<A::Value>) {
        let mut cur = self.head;
        while !cur.is_null() {
            let link = self.link_mut(arena, cur);
            let next = link.next;
            link.reset();
            cur = next;
        }
        self.head = NodeId::NULL;
        self.tail = NodeId::NULL;
    }

    /// Iterate element ids front to back.
    pub fn iter<'a>(&'a self, arena: &'a Arena<A::Value>) -> Iter<'a, A> {
        Iter {
            list: self,
            arena,
            front: self.head,
            back: self.tail,
        }
    }
}

/// Double-ended iterator over a [`List`].
///
/// Invalidated by removing the element it is positioned on.
pub struct Iter<'a, A: ListAdapter> {
    list: &'a List<A>,
    arena: &'a Arena<A::Value>,
    front: NodeId,
    back: NodeId,
}

impl<A: ListAdapter> Iterator for Iter<'_, A> {
    type Item = NodeId;

    fn next(&mut self) -> Option<NodeId> {
        let id = self.front.to_option()?;
        if id == self.back {
            self.front = NodeId::NULL;
            self.back = NodeId::NULL;
        } else {
            self.front = self.list.link(self.arena, id).next;
        }
        Some(id)
    }
}

impl<A: ListAdapter> DoubleEndedIterator for Iter<'_, A> {
    fn next_back(&mut self) -> Option<NodeId> {
        let id = self.back.to_option()?;
        if id == self.front {
            self.front = NodeId::NULL;
            self.back = NodeId::NULL;
        } else {
            self.back = self.list.link(self.arena, id).prev;
        }
        Some(id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    struct Item {
        value: u32,
        link: ListLink,
    }

    #[derive(Default)]
    struct ItemAdapter;

    impl ListAdapter for ItemAdapter {
        type Value = Item;

        fn link<'a>(&self, value: &'a Item) -> &'a ListLink {
            &value.link
        }

        fn link_mut<'a>(&self, value: &'a mut Item) -> &'a mut ListLink {
            &mut value.link
        }
    }

    fn setup(n: u32) -> (Arena<Item>, Vec<NodeId>) {
        let mut arena = Arena::with_capacity(n as usize);
        let ids = (0..n)
            .map(|value| arena.insert(Item { value, link: ListLink::new() }).ok().unwrap())
            .collect();
        (arena, ids)
    }

    fn values(list: &List<ItemAdapter>, arena: &Arena<Item>) -> Vec<u32> {
        list.iter(arena).map(|id| arena[id].value).collect()
    }

    #[test]
    fn test_push_and_pop() {
        let (mut arena, ids) = setup(4);
        let mut list = List::new(ItemAdapter);
        list.push_back(&mut arena, ids[1]);
        list.push_back(&mut arena, ids[2]);
        list.push_front(&mut arena, ids[0]);
        list.insert(&mut arena, Some(ids[2]), ids[3]);
        assert_eq!(values(&list, &arena), vec![0, 1, 3, 2]);

        assert_eq!(list.pop_front(&mut arena), Some(ids[0]));
        assert_eq!(list.pop_back(&mut arena), Some(ids[2]));
        assert_eq!(values(&list, &arena), vec![1, 3]);
        assert!(!arena[ids[0]].link.is_linked());
    }

    #[test]
    fn test_erase_returns_next() {
        let (mut arena, ids) = setup(3);
        let mut list = List::new(ItemAdapter);
        for &id in &ids {
            list.push_back(&mut arena, id);
        }
        assert_eq!(list.erase(&mut arena, ids[1]), Some(ids[2]));
        assert_eq!(list.erase(&mut arena, ids[2]), None);
        assert_eq!(list.front(), Some(ids[0]));
        assert_eq!(list.back(), Some(ids[0]));
    }

    #[test]
    #[should_panic(expected = "linked node")]
    fn test_double_insert_panics() {
        let (mut arena, ids) = setup(1);
        let mut list = List::new(ItemAdapter);
        list.push_back(&mut arena, ids[0]);
        list.push_back(&mut arena, ids[0]);
    }

    #[test]
    fn test_reverse_iteration() {
        let (mut arena, ids) = setup(5);
        let mut list = List::new(ItemAdapter);
        for &id in &ids {
            list.push_back(&mut arena, id);
        }
        let rev: Vec<u32> = list.iter(&arena).rev().map(|id| arena[id].value).collect();
        assert_eq!(rev, vec![4, 3, 2, 1, 0]);

        // Meeting in the middle yields each element once
        let mut it = list.iter(&arena);
        assert_eq!(it.next(), Some(ids[0]));
        assert_eq!(it.next_back(), Some(ids[4]));
        assert_eq!(it.next(), Some(ids[1]));
        assert_eq!(it.next_back(), Some(ids[3]));
        assert_eq!(it.next(), Some(ids[2]));
        assert_eq!(it.next(), None);
        assert_eq!(it.next_back(), None);
    }

    #[test]
    fn test_splice_range() {
        let (mut arena, ids) = setup(6);
        let mut a = List::new(ItemAdapter);
        let mut b = List::new(ItemAdapter);
        for &id in &ids[..3] {
            a.push_back(&mut arena, id);
        }
        for &id in &ids[3..] {
            b.push_back(&mut arena, id);
        }

        // Move [3, 5) in front of 1
        a.splice(&mut arena, Some(ids[1]), &mut b, ids[3], Some(ids[5]));
        assert_eq!(values(&a, &arena), vec![0, 3, 4, 1, 2]);
        assert_eq!(values(&b, &arena), vec![5]);

        // Move the rest of b to the end of a
        a.splice(&mut arena, None, &mut b, ids[5], None);
        assert_eq!(values(&a, &arena), vec![0, 3, 4, 1, 2, 5]);
        assert!(b.is_empty());
        assert_eq!(a.iter(&arena).rev().count(), 6);
    }

    #[test]
    fn test_clear_unlinks_all() {
        let (mut arena, ids) = setup(3);
        let mut list = List::new(ItemAdapter);
        for &id in &ids {
            list.push_back(&mut arena, id);
        }
        list.clear(&mut arena);
        assert!(list.is_empty());
        assert!(ids.iter().all(|&id| !arena[id].link.is_linked()));
        list.push_back(&mut arena, ids[2]);
        assert_eq!(list.len(&arena), 1);
    }

    #[derive(Debug, Clone)]
    enum Op {
        PushBack(usize),
        PushFront(usize),
        PopFront,
        PopBack,
        Erase(usize),
        SpliceFromOther(usize),
    }

    fn op_strategy() -> impl Strategy<Value = Op> {
        prop_oneof![
            (0..32usize).prop_map(Op::PushBack),
            (0..32usize).prop_map(Op::PushFront),
            Just(Op::PopFront),
            Just(Op::PopBack),
            (0..32usize).prop_map(Op::Erase),
            (0..32usize).prop_map(Op::SpliceFromOther),
        ]
    }

    proptest! {
        #[test]
        fn prop_forward_and_backward_counts_agree(ops in prop::collection::vec(op_strategy(), 0..200)) {
            let (mut arena, ids) = setup(32);
            let mut list = List::new(ItemAdapter);
            let mut other = List::new(ItemAdapter);
            // Model: which list each node is in (0 = none, 1 = list, 2 = other)
            let mut model: Vec<Vec<usize>> = vec![Vec::new(), Vec::new()];
            let mut home = [0u8; 32];

            for op in ops {
                match op {
                    Op::PushBack(i) if home[i] == 0 => {
                        list.push_back(&mut arena, ids[i]);
                        model[0].push(i);
                        home[i] = 1;
                    }
                    Op::PushFront(i) if home[i] == 0 => {
                        // Park on the other list so splice has material
                        other.push_front(&mut arena, ids[i]);
                        model[1].insert(0, i);
                        home[i] = 2;
                    }
                    Op::PopFront => {
                        let got = list.pop_front(&mut arena);
                        let want = if model[0].is_empty() { None } else { Some(model[0].remove(0)) };
                        prop_assert_eq!(got, want.map(|i| ids[i]));
                        if let Some(i) = want { home[i] = 0; }
                    }
                    Op::PopBack => {
                        let got = list.pop_back(&mut arena);
                        let want = model[0].pop();
                        prop_assert_eq!(got, want.map(|i| ids[i]));
                        if let Some(i) = want { home[i] = 0; }
                    }
                    Op::Erase(i) if home[i] == 1 => {
                        let pos = model[0].iter().position(|&x| x == i).unwrap();
                        let next = list.erase(&mut arena, ids[i]);
                        model[0].remove(pos);
                        prop_assert_eq!(next, model[0].get(pos).map(|&x| ids[x]));
                        home[i] = 0;
                    }
                    Op::SpliceFromOther(i) if home[i] == 2 => {
                        // Move [i, end) of other to the front of list
                        let pos = model[1].iter().position(|&x| x == i).unwrap();
                        let moved: Vec<usize> = model[1].drain(pos..).collect();
                        let dest = list.front();
                        list.splice(&mut arena, dest, &mut other, ids[i], None);
                        for &m in &moved { home[m] = 1; }
                        let mut merged = moved;
                        merged.extend(model[0].iter().copied());
                        model[0] = merged;
                    }
                    _ => {}
                }

                let fwd = list.iter(&arena).count();
                let bwd = list.iter(&arena).rev().count();
                prop_assert_eq!(fwd, bwd);
                prop_assert_eq!(fwd, list.len(&arena));
                prop_assert_eq!(fwd, model[0].len());
                let got: Vec<u32> = list.iter(&arena).map(|id| arena[id].value).collect();
                let want: Vec<u32> = model[0].iter().map(|&i| i as u32).collect();
                prop_assert_eq!(got, want);
                prop_assert_eq!(other.iter(&arena).rev().count(), model[1].len());
            }
        }
    }
}
