//! Generation-Checked Arena
//!
//! Fixed-capacity slab that owns intrusive nodes. Slot 0 is reserved so that
//! [`NodeId::NULL`] can double as the "no neighbour" marker inside links.
//! Removing a value bumps the slot's generation; any [`NodeId`] still
//! pointing at the old occupant stops resolving.

use alloc::boxed::Box;
use alloc::vec::Vec;
use core::fmt;
use core::ops::{Index, IndexMut};

/// Reference to a slot in an [`Arena`].
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
#[repr(C)]
pub struct NodeId {
    index: u32,
    generation: u32,
}

impl NodeId {
    /// The null reference. Never handed out by an arena.
    pub const NULL: Self = Self { index: 0, generation: 0 };

    #[inline]
    #[must_use]
    pub const fn new(index: u32, generation: u32) -> Self {
        Self { index, generation }
    }

    #[inline]
    #[must_use]
    pub const fn index(self) -> u32 {
        self.index
    }

    #[inline]
    #[must_use]
    pub const fn generation(self) -> u32 {
        self.generation
    }

    #[inline]
    #[must_use]
    pub const fn is_null(self) -> bool {
        self.index == 0
    }

    /// `None` for [`NodeId::NULL`], `Some(self)` otherwise.
    #[inline]
    #[must_use]
    pub const fn to_option(self) -> Option<Self> {
        if self.is_null() {
            None
        } else {
            Some(self)
        }
    }

    /// Inverse of [`to_option`](Self::to_option).
    #[inline]
    #[must_use]
    pub const fn from_option(id: Option<Self>) -> Self {
        match id {
            Some(id) => id,
            None => Self::NULL,
        }
    }
}

impl fmt::Debug for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_null() {
            f.write_str("NodeId(NULL)")
        } else {
            write!(f, "NodeId({}v{})", self.index, self.generation)
        }
    }
}

enum Slot<T> {
    Occupied { generation: u32, value: T },
    Vacant { generation: u32, next_free: u32 },
}

/// Fixed-capacity, generation-checked slab.
pub struct Arena<T> {
    slots: Box<[Slot<T>]>,
    free_head: u32,
    len: usize,
}

impl<T> Arena<T> {
    /// Create an arena with room for `capacity` values.
    #[must_use]
    pub fn with_capacity(capacity: usize) -> Self {
        assert!(capacity < u32::MAX as usize, "arena capacity exceeds u32 index space");

        // Slot 0 is the NULL slot and never enters the free list
        let slots: Vec<Slot<T>> = (0..=capacity)
            .map(|i| Slot::Vacant {
                generation: 0,
                next_free: if i == 0 || i == capacity { 0 } else { i as u32 + 1 },
            })
            .collect();

        Self {
            slots: slots.into_boxed_slice(),
            free_head: if capacity == 0 { 0 } else { 1 },
            len: 0,
        }
    }

    /// Store `value`, handing it back when the arena is full.
    pub fn insert(&mut self, value: T) -> Result<NodeId, T> {
        let index = self.free_head;
        if index == 0 {
            return Err(value);
        }

        let slot = &mut self.slots[index as usize];
        let (generation, next_free) = match *slot {
            Slot::Vacant { generation, next_free } => (generation, next_free),
            Slot::Occupied { .. } => unreachable!("free list points at an occupied slot"),
        };
        *slot = Slot::Occupied { generation, value };
        self.free_head = next_free;
        self.len += 1;

        Ok(NodeId::new(index, generation))
    }

    /// Remove and return the value behind `id`.
    pub fn remove(&mut self, id: NodeId) -> Option<T> {
        if !self.contains(id) {
            return None;
        }

        let slot = core::mem::replace(
            &mut self.slots[id.index as usize],
            Slot::Vacant {
                generation: id.generation.wrapping_add(1),
                next_free: self.free_head,
            },
        );
        self.free_head = id.index;
        self.len -= 1;

        match slot {
            Slot::Occupied { value, .. } => Some(value),
            Slot::Vacant { .. } => None,
        }
    }

    /// Check whether `id` refers to a live value.
    #[must_use]
    pub fn contains(&self, id: NodeId) -> bool {
        self.get(id).is_some()
    }

    #[must_use]
    pub fn get(&self, id: NodeId) -> Option<&T> {
        if id.is_null() {
            return None;
        }
        match self.slots.get(id.index as usize)? {
            Slot::Occupied { generation, value } if *generation == id.generation => Some(value),
            _ => None,
        }
    }

    #[must_use]
    pub fn get_mut(&mut self, id: NodeId) -> Option<&mut T> {
        if id.is_null() {
            return None;
        }
        match self.slots.get_mut(id.index as usize)? {
            Slot::Occupied { generation, value } if *generation == id.generation => Some(value),
            _ => None,
        }
    }

    /// Number of live values.
    #[inline]
    #[must_use]
    pub fn len(&self) -> usize {
        self.len
    }

    #[inline]
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Maximum number of live values.
    #[inline]
    #[must_use]
    pub fn capacity(&self) -> usize {
        self.slots.len() - 1
    }

    /// Iterate live values in slot order.
    pub fn iter(&self) -> impl Iterator<Item = (NodeId, &T)> {
        self.slots.iter().enumerate().filter_map(|(i, slot)| match slot {
            Slot::Occupied { generation, value } => Some((NodeId::new(i as u32, *generation), value)),
            Slot::Vacant { .. } => None,
        })
    }
}

impl<T> Index<NodeId> for Arena<T> {
    type Output = T;

    fn index(&self, id: NodeId) -> &T {
        match self.get(id) {
            Some(value) => value,
            None => panic!("stale or null {id:?}"),
        }
    }
}

impl<T> IndexMut<NodeId> for Arena<T> {
    fn index_mut(&mut self, id: NodeId) -> &mut T {
        match self.get_mut(id) {
            Some(value) => value,
            None => panic!("stale or null {id:?}"),
        }
    }
}

impl<T> fmt::Debug for Arena<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Arena")
            .field("len", &self.len)
            .field("capacity", &self.capacity())
            .finish()
    }
}
