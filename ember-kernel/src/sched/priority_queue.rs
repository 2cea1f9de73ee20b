//! Multi-core priority queue
//!
//! Every schedulable member sits in at most one list per core:
//!
//! - the **scheduled** queue of its active core, and
//! - the **suggested** queue of every other core in its affinity mask.
//!
//! Each core keeps one list per priority and a 64-bit bitmap of the
//! non-empty ones. Priority `p` owns bit `63 - p`, so the highest non-empty
//! priority is the bitmap's leading-zero count.
//!
//! Members are identified by [`NodeId`] into an [`Arena`]; the queue never
//! owns them.

use core::marker::PhantomData;

use ember_arch::smp::{CoreMask, NUM_CORES};
use ember_intrusive::{Arena, List, ListAdapter, ListLink, NodeId};
use ember_syscall::types::NUM_PRIORITIES;

/// What the queue needs to know about a member.
pub trait QueueMember {
    fn priority(&self) -> i32;
    /// Core the member runs on, or -1 for none.
    fn active_core(&self) -> i32;
    fn affinity_mask(&self) -> u64;
    fn queue_link(&self, core: usize) -> &ListLink;
    fn queue_link_mut(&mut self, core: usize) -> &mut ListLink;
}

/// Threads the per-core link for `core`.
pub struct QueueAdapter<M> {
    core: usize,
    _marker: PhantomData<fn() -> M>,
}

impl<M> QueueAdapter<M> {
    const fn new(core: usize) -> Self {
        Self { core, _marker: PhantomData }
    }
}

impl<M: QueueMember> ListAdapter for QueueAdapter<M> {
    type Value = M;

    fn link<'a>(&self, value: &'a M) -> &'a ListLink {
        value.queue_link(self.core)
    }

    fn link_mut<'a>(&self, value: &'a mut M) -> &'a mut ListLink {
        value.queue_link_mut(self.core)
    }
}

#[inline]
const fn is_queued_priority(priority: i32) -> bool {
    priority >= 0 && (priority as usize) < NUM_PRIORITIES
}

#[inline]
const fn priority_bit(priority: usize) -> u64 {
    1u64 << (NUM_PRIORITIES - 1 - priority)
}

#[inline]
const fn valid_core(core: i32) -> Option<usize> {
    if core >= 0 && (core as usize) < NUM_CORES {
        Some(core as usize)
    } else {
        None
    }
}

/// Cores in `mask`, lowest first.
fn cores_of(mask: u64) -> impl Iterator<Item = usize> {
    CoreMask(mask).iter().filter(|&core| core < NUM_CORES)
}

// -- Per-core level lists

struct LevelQueue<M: QueueMember> {
    lists: [[List<QueueAdapter<M>>; NUM_PRIORITIES]; NUM_CORES],
    available: [u64; NUM_CORES],
}

impl<M: QueueMember> LevelQueue<M> {
    fn new() -> Self {
        Self {
            lists: core::array::from_fn(|core| {
                core::array::from_fn(|_| List::new(QueueAdapter::new(core)))
            }),
            available: [0; NUM_CORES],
        }
    }

    fn push_back(&mut self, arena: &mut Arena<M>, priority: usize, core: usize, id: NodeId) {
        self.lists[core][priority].push_back(arena, id);
        self.available[core] |= priority_bit(priority);
    }

    fn push_front(&mut self, arena: &mut Arena<M>, priority: usize, core: usize, id: NodeId) {
        self.lists[core][priority].push_front(arena, id);
        self.available[core] |= priority_bit(priority);
    }

    fn remove(&mut self, arena: &mut Arena<M>, priority: usize, core: usize, id: NodeId) {
        let list = &mut self.lists[core][priority];
        list.erase(arena, id);
        if list.is_empty() {
            self.available[core] &= !priority_bit(priority);
        }
    }

    fn front(&self, core: usize) -> Option<NodeId> {
        let available = self.available[core];
        if available == 0 {
            return None;
        }
        self.lists[core][available.leading_zeros() as usize].front()
    }

    fn front_at(&self, core: usize, priority: usize) -> Option<NodeId> {
        self.lists[core][priority].front()
    }

    /// Next member after `id`, continuing into lower priorities.
    fn next(&self, arena: &Arena<M>, core: usize, id: NodeId) -> Option<NodeId> {
        let priority = arena[id].priority() as usize;
        if let Some(next) = self.lists[core][priority].next(arena, id) {
            return Some(next);
        }
        let lower = self.available[core] & (priority_bit(priority) - 1);
        if lower == 0 {
            return None;
        }
        self.lists[core][lower.leading_zeros() as usize].front()
    }

    fn same_priority_next(&self, arena: &Arena<M>, core: usize, id: NodeId) -> Option<NodeId> {
        let priority = arena[id].priority() as usize;
        self.lists[core][priority].next(arena, id)
    }

    fn is_empty(&self, core: usize) -> bool {
        self.available[core] == 0
    }
}

// -- Public queue

/// Scheduled and suggested queues for every core.
pub struct PriorityQueue<M: QueueMember> {
    scheduled: LevelQueue<M>,
    suggested: LevelQueue<M>,
}

impl<M: QueueMember> Default for PriorityQueue<M> {
    fn default() -> Self {
        Self::new()
    }
}

impl<M: QueueMember> PriorityQueue<M> {
    #[must_use]
    pub fn new() -> Self {
        Self {
            scheduled: LevelQueue::new(),
            suggested: LevelQueue::new(),
        }
    }

    fn push(&mut self, arena: &mut Arena<M>, id: NodeId, front: bool) {
        let member = &arena[id];
        let priority = member.priority();
        if !is_queued_priority(priority) {
            return;
        }
        let priority = priority as usize;
        let mut affinity = member.affinity_mask();

        if let Some(core) = valid_core(member.active_core()) {
            if front {
                self.scheduled.push_front(arena, priority, core, id);
            } else {
                self.scheduled.push_back(arena, priority, core, id);
            }
            affinity &= !(1u64 << core);
        }

        // Suggestions always go to the back, even for a front push
        for core in cores_of(affinity) {
            self.suggested.push_back(arena, priority, core, id);
        }
    }

    fn remove_with(
        &mut self,
        arena: &mut Arena<M>,
        id: NodeId,
        priority: i32,
        active_core: i32,
        mut affinity: u64,
    ) {
        if !is_queued_priority(priority) {
            return;
        }
        let priority = priority as usize;

        if let Some(core) = valid_core(active_core) {
            self.scheduled.remove(arena, priority, core, id);
            affinity &= !(1u64 << core);
        }
        for core in cores_of(affinity) {
            self.suggested.remove(arena, priority, core, id);
        }
    }

    /// Queue at the back of its priority level.
    pub fn push_back(&mut self, arena: &mut Arena<M>, id: NodeId) {
        self.push(arena, id, false);
    }

    /// Queue at the front of its level on the active core.
    pub fn push_front(&mut self, arena: &mut Arena<M>, id: NodeId) {
        self.push(arena, id, true);
    }

    /// Remove from every queue, using the member's current fields.
    pub fn remove(&mut self, arena: &mut Arena<M>, id: NodeId) {
        let member = &arena[id];
        let (priority, core, affinity) = (member.priority(), member.active_core(), member.affinity_mask());
        self.remove_with(arena, id, priority, core, affinity);
    }

    // -- Lookups

    #[must_use]
    pub fn scheduled_front(&self, core: usize) -> Option<NodeId> {
        self.scheduled.front(core)
    }

    #[must_use]
    pub fn scheduled_front_at(&self, core: usize, priority: i32) -> Option<NodeId> {
        if !is_queued_priority(priority) {
            return None;
        }
        self.scheduled.front_at(core, priority as usize)
    }

    #[must_use]
    pub fn scheduled_next(&self, arena: &Arena<M>, core: usize, id: NodeId) -> Option<NodeId> {
        self.scheduled.next(arena, core, id)
    }

    #[must_use]
    pub fn suggested_front(&self, core: usize) -> Option<NodeId> {
        self.suggested.front(core)
    }

    #[must_use]
    pub fn suggested_front_at(&self, core: usize, priority: i32) -> Option<NodeId> {
        if !is_queued_priority(priority) {
            return None;
        }
        self.suggested.front_at(core, priority as usize)
    }

    #[must_use]
    pub fn suggested_next(&self, arena: &Arena<M>, core: usize, id: NodeId) -> Option<NodeId> {
        self.suggested.next(arena, core, id)
    }

    /// Next suggestion for `core` at the same priority as `id`.
    #[must_use]
    pub fn same_priority_next(&self, arena: &Arena<M>, core: usize, id: NodeId) -> Option<NodeId> {
        self.suggested.same_priority_next(arena, core, id)
    }

    /// Next scheduled member on `core` at the same priority as `id`.
    #[must_use]
    pub fn scheduled_same_priority_next(&self, arena: &Arena<M>, core: usize, id: NodeId) -> Option<NodeId> {
        self.scheduled.same_priority_next(arena, core, id)
    }

    #[must_use]
    pub fn has_scheduled(&self, core: usize) -> bool {
        !self.scheduled.is_empty(core)
    }

    // -- Moves

    /// Move to the front of its level on its active core.
    pub fn move_to_scheduled_front(&mut self, arena: &mut Arena<M>, id: NodeId) {
        let member = &arena[id];
        let priority = member.priority();
        let Some(core) = valid_core(member.active_core()) else {
            return;
        };
        if !is_queued_priority(priority) {
            return;
        }
        self.scheduled.remove(arena, priority as usize, core, id);
        self.scheduled.push_front(arena, priority as usize, core, id);
    }

    /// Move to the back of its level; returns the level's new front.
    pub fn move_to_scheduled_back(&mut self, arena: &mut Arena<M>, id: NodeId) -> Option<NodeId> {
        let member = &arena[id];
        let priority = member.priority();
        let core = valid_core(member.active_core())?;
        if !is_queued_priority(priority) {
            return None;
        }
        self.scheduled.remove(arena, priority as usize, core, id);
        self.scheduled.push_back(arena, priority as usize, core, id);
        self.scheduled.front_at(core, priority as usize)
    }

    // -- Field changes
    //
    // The member's fields already hold the new value; the old one is passed in.

    pub fn change_priority(&mut self, arena: &mut Arena<M>, old_priority: i32, is_running: bool, id: NodeId) {
        let member = &arena[id];
        let (core, affinity) = (member.active_core(), member.affinity_mask());
        self.remove_with(arena, id, old_priority, core, affinity);

        // A running member keeps its turn at the new level
        if is_running {
            self.push_front(arena, id);
        } else {
            self.push_back(arena, id);
        }
    }

    pub fn change_affinity_mask(&mut self, arena: &mut Arena<M>, old_core: i32, old_affinity: u64, id: NodeId) {
        let priority = arena[id].priority();
        self.remove_with(arena, id, priority, old_core, old_affinity);
        self.push_back(arena, id);
    }

    /// Move from `old_core`'s scheduled queue to the member's active core.
    ///
    /// The old core keeps it as a suggestion.
    pub fn change_core(&mut self, arena: &mut Arena<M>, old_core: i32, id: NodeId, to_front: bool) {
        let member = &arena[id];
        let priority = member.priority();
        let new_core = member.active_core();
        if old_core == new_core || !is_queued_priority(priority) {
            return;
        }
        let priority = priority as usize;

        if let Some(core) = valid_core(old_core) {
            self.scheduled.remove(arena, priority, core, id);
        }
        if let Some(core) = valid_core(new_core) {
            self.suggested.remove(arena, priority, core, id);
            if to_front {
                self.scheduled.push_front(arena, priority, core, id);
            } else {
                self.scheduled.push_back(arena, priority, core, id);
            }
        }
        if let Some(core) = valid_core(old_core) {
            self.suggested.push_back(arena, priority, core, id);
        }
    }
}
