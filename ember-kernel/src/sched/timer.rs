//! Sleep queue
//!
//! Waiting threads with a timeout, ordered by `(wake tick, thread id)` in an
//! intrusive red-black tree. The id breaks ties so every key is unique.

use core::cmp::Ordering;
use core::marker::PhantomData;

use ember_intrusive::{Arena, NodeId, RbLink, RbTree, TreeAdapter};

/// Nanoseconds per second.
const NS_PER_SECOND: u128 = 1_000_000_000;

/// What the sleep queue needs from a member.
pub trait Sleeper {
    fn wake_tick(&self) -> u64;
    /// Unique id used as the tie breaker.
    fn sleeper_id(&self) -> u64;
    fn sleep_link(&self) -> &RbLink;
    fn sleep_link_mut(&mut self) -> &mut RbLink;
}

pub struct SleepAdapter<M>(PhantomData<fn() -> M>);

impl<M> Default for SleepAdapter<M> {
    fn default() -> Self {
        Self(PhantomData)
    }
}

impl<M: Sleeper> TreeAdapter for SleepAdapter<M> {
    type Value = M;
    type Key = (u64, u64);

    fn link<'a>(&self, value: &'a M) -> &'a RbLink {
        value.sleep_link()
    }

    fn link_mut<'a>(&self, value: &'a mut M) -> &'a mut RbLink {
        value.sleep_link_mut()
    }

    fn compare(&self, a: &M, b: &M) -> Ordering {
        (a.wake_tick(), a.sleeper_id()).cmp(&(b.wake_tick(), b.sleeper_id()))
    }

    fn compare_key(&self, key: &(u64, u64), value: &M) -> Ordering {
        key.cmp(&(value.wake_tick(), value.sleeper_id()))
    }
}

/// Timed waiters, earliest first.
pub struct SleepQueue<M: Sleeper> {
    tree: RbTree<SleepAdapter<M>>,
}

impl<M: Sleeper> Default for SleepQueue<M> {
    fn default() -> Self {
        Self::new()
    }
}

impl<M: Sleeper> SleepQueue<M> {
    #[must_use]
    pub fn new() -> Self {
        Self { tree: RbTree::new(SleepAdapter::default()) }
    }

    /// Queue `id`; its wake tick must already be set.
    pub fn insert(&mut self, arena: &mut Arena<M>, id: NodeId) {
        if let Err(existing) = self.tree.insert(arena, id) {
            panic!("sleep key of {id:?} collides with {existing:?}");
        }
    }

    /// Remove `id` if it is queued. Returns whether it was.
    pub fn cancel(&mut self, arena: &mut Arena<M>, id: NodeId) -> bool {
        if !arena[id].sleep_link().is_linked() {
            return false;
        }
        self.tree.erase(arena, id);
        true
    }

    /// Dequeue the earliest waiter if its tick is `<= now`.
    pub fn pop_expired(&mut self, arena: &mut Arena<M>, now: u64) -> Option<NodeId> {
        let first = self.tree.first(arena)?;
        if arena[first].wake_tick() > now {
            return None;
        }
        self.tree.erase(arena, first);
        Some(first)
    }

    /// Tick of the earliest waiter.
    #[must_use]
    pub fn next_wake_tick(&self, arena: &Arena<M>) -> Option<u64> {
        self.tree.first(arena).map(|id| arena[id].wake_tick())
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.tree.is_empty()
    }

    #[must_use]
    pub fn len(&self, arena: &Arena<M>) -> usize {
        self.tree.len(arena)
    }
}

/// Ticks covering `ns` nanoseconds, rounded up, never less than one.
#[must_use]
pub fn ns_to_ticks(ns: u64, ticks_per_second: u64) -> u64 {
    let ticks = (ns as u128 * ticks_per_second as u128).div_ceil(NS_PER_SECOND);
    ticks.clamp(1, u64::MAX as u128) as u64
}
