//! Threads
//!
//! # State
//!
//! The raw state packs the logical state in the low nibble and the active
//! suspend flags above it:
//!
//! ```text
//! +-----------------------------+-------+
//! | Init Bt Debug Thread Proc   | state |
//! +-----------------------------+-------+
//!   8    7   6     5      4       3   0
//! ```
//!
//! A thread is queued exactly when its raw state equals
//! [`ThreadState::Runnable`]; any suspend flag keeps a runnable thread off
//! the queues without changing its logical state.

use alloc::boxed::Box;

use ember_arch::smp::NUM_CORES;
use ember_intrusive::{ListAdapter, ListLink, RbLink};
use ember_syscall::ThreadLocalRegion;

use super::ProcessRef;
use crate::sched::priority_queue::QueueMember;
use crate::sched::timer::Sleeper;

/// Bits of the raw state holding the logical state.
pub const THREAD_STATE_MASK: u16 = 0xF;

/// First bit of the suspend flags.
pub const SUSPEND_SHIFT: u16 = 4;

/// All suspend flags.
pub const SUSPEND_MASK: u16 = 0x1F << SUSPEND_SHIFT;

#[repr(u16)]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ThreadState {
    Initialized = 0,
    Waiting = 1,
    Runnable = 2,
    Terminated = 3,
}

impl ThreadState {
    #[must_use]
    pub const fn from_raw(raw: u16) -> Self {
        match raw & THREAD_STATE_MASK {
            0 => Self::Initialized,
            1 => Self::Waiting,
            2 => Self::Runnable,
            _ => Self::Terminated,
        }
    }

    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Initialized => "initialized",
            Self::Waiting => "waiting",
            Self::Runnable => "runnable",
            Self::Terminated => "terminated",
        }
    }
}

/// Reasons a thread can be held off the queues.
#[repr(u16)]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SuspendType {
    Process = 0,
    Thread = 1,
    Debug = 2,
    Backtrace = 3,
    Init = 4,
}

impl SuspendType {
    /// Flag bit in the raw state.
    #[inline]
    #[must_use]
    pub const fn flag(self) -> u16 {
        1 << (SUSPEND_SHIFT + self as u16)
    }
}

/// Creation parameters.
#[derive(Clone, Copy, Debug)]
pub struct ThreadParams {
    pub entry: u64,
    pub argument: u64,
    pub stack_top: u64,
    pub priority: i32,
    /// Ideal and initial active core
    pub core: i32,
}

/// A schedulable thread.
pub struct Thread {
    pub(crate) id: u64,
    pub(crate) owner: ProcessRef,

    pub(crate) priority: i32,
    pub(crate) base_priority: i32,
    pub(crate) raw_state: u16,
    pub(crate) suspend_requests: u16,

    pub(crate) ideal_core: i32,
    pub(crate) active_core: i32,
    pub(crate) affinity_mask: u64,

    pub(crate) queue_links: [ListLink; NUM_CORES],
    pub(crate) process_link: ListLink,
    pub(crate) id_link: RbLink,
    pub(crate) sleep_link: RbLink,
    pub(crate) wake_tick: u64,

    pub(crate) ref_count: u32,
    /// Holds the reference dropped when the thread terminates
    pub(crate) started: bool,

    pub(crate) yield_count: u64,
    pub(crate) yield_schedule_count: i64,
    pub(crate) last_scheduled_tick: u64,

    pub(crate) entry: u64,
    pub(crate) argument: u64,
    pub(crate) stack_top: u64,
    pub(crate) tls: Box<ThreadLocalRegion>,
}

impl Thread {
    pub(crate) fn new(id: u64, owner: ProcessRef, params: &ThreadParams) -> Self {
        Self {
            id,
            owner,
            priority: params.priority,
            base_priority: params.priority,
            raw_state: ThreadState::Initialized as u16,
            suspend_requests: 0,
            ideal_core: params.core,
            active_core: params.core,
            affinity_mask: 1u64 << params.core,
            queue_links: [ListLink::new(); NUM_CORES],
            process_link: ListLink::new(),
            id_link: RbLink::new(),
            sleep_link: RbLink::new(),
            wake_tick: 0,
            ref_count: 1,
            started: false,
            yield_count: 0,
            yield_schedule_count: -1,
            last_scheduled_tick: 0,
            entry: params.entry,
            argument: params.argument,
            stack_top: params.stack_top,
            tls: Box::new(ThreadLocalRegion::zeroed()),
        }
    }

    #[inline]
    #[must_use]
    pub fn id(&self) -> u64 {
        self.id
    }

    #[inline]
    #[must_use]
    pub fn owner(&self) -> ProcessRef {
        self.owner
    }

    #[inline]
    #[must_use]
    pub fn state(&self) -> ThreadState {
        ThreadState::from_raw(self.raw_state)
    }

    #[inline]
    #[must_use]
    pub fn raw_state(&self) -> u16 {
        self.raw_state
    }

    #[inline]
    #[must_use]
    pub fn is_terminated(&self) -> bool {
        self.state() == ThreadState::Terminated
    }

    #[inline]
    #[must_use]
    pub fn base_priority(&self) -> i32 {
        self.base_priority
    }

    #[inline]
    #[must_use]
    pub fn ideal_core(&self) -> i32 {
        self.ideal_core
    }

    #[must_use]
    pub fn is_suspend_requested(&self, ty: SuspendType) -> bool {
        self.suspend_requests & ty.flag() != 0
    }

    #[must_use]
    pub fn entry_point(&self) -> (u64, u64, u64) {
        (self.entry, self.argument, self.stack_top)
    }

    #[must_use]
    pub fn yield_count(&self) -> u64 {
        self.yield_count
    }

    pub fn tls_mut(&mut self) -> &mut ThreadLocalRegion {
        &mut self.tls
    }

    /// Replace the logical state, keeping the suspend flags.
    ///
    /// Entering `Terminated` drops the flags. Returns the old raw state.
    pub(crate) fn set_state(&mut self, state: ThreadState) -> u16 {
        let old = self.raw_state;
        self.raw_state = if state == ThreadState::Terminated {
            state as u16
        } else {
            (old & !THREAD_STATE_MASK) | state as u16
        };
        old
    }

    /// Fold the requested suspend flags into the raw state.
    ///
    /// Returns the old raw state, or `None` for a terminated thread.
    pub(crate) fn apply_suspend_requests(&mut self) -> Option<u16> {
        if self.is_terminated() {
            return None;
        }
        let old = self.raw_state;
        self.raw_state = (old & THREAD_STATE_MASK) | self.suspend_requests;
        Some(old)
    }

    pub(crate) fn request_suspend(&mut self, ty: SuspendType) {
        self.suspend_requests |= ty.flag();
    }

    pub(crate) fn clear_suspend(&mut self, ty: SuspendType) {
        self.suspend_requests &= !ty.flag();
    }
}

impl core::fmt::Debug for Thread {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Thread")
            .field("id", &self.id)
            .field("owner", &self.owner)
            .field("state", &self.state())
            .field("raw_state", &format_args!("{:#x}", self.raw_state))
            .field("priority", &self.priority)
            .field("active_core", &self.active_core)
            .field("affinity", &format_args!("{:#x}", self.affinity_mask))
            .field("refs", &self.ref_count)
            .finish_non_exhaustive()
    }
}

impl QueueMember for Thread {
    #[inline]
    fn priority(&self) -> i32 {
        self.priority
    }

    #[inline]
    fn active_core(&self) -> i32 {
        self.active_core
    }

    #[inline]
    fn affinity_mask(&self) -> u64 {
        self.affinity_mask
    }

    #[inline]
    fn queue_link(&self, core: usize) -> &ListLink {
        &self.queue_links[core]
    }

    #[inline]
    fn queue_link_mut(&mut self, core: usize) -> &mut ListLink {
        &mut self.queue_links[core]
    }
}

impl Sleeper for Thread {
    #[inline]
    fn wake_tick(&self) -> u64 {
        self.wake_tick
    }

    #[inline]
    fn sleeper_id(&self) -> u64 {
        self.id
    }

    #[inline]
    fn sleep_link(&self) -> &RbLink {
        &self.sleep_link
    }

    #[inline]
    fn sleep_link_mut(&mut self) -> &mut RbLink {
        &mut self.sleep_link
    }
}

/// Links threads into their process's thread list.
#[derive(Debug, Default, Clone, Copy)]
pub struct ProcessThreadAdapter;

impl ListAdapter for ProcessThreadAdapter {
    type Value = Thread;

    fn link<'a>(&self, value: &'a Thread) -> &'a ListLink {
        &value.process_link
    }

    fn link_mut<'a>(&self, value: &'a mut Thread) -> &'a mut ListLink {
        &mut value.process_link
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ember_intrusive::NodeId;

    fn thread() -> Thread {
        let params = ThreadParams { entry: 0x1000, argument: 7, stack_top: 0x8000, priority: 44, core: 1 };
        Thread::new(3, ProcessRef(NodeId::new(1, 0)), &params)
    }

    #[test]
    fn test_new_thread() {
        let t = thread();
        assert_eq!(t.state(), ThreadState::Initialized);
        assert_eq!(t.affinity_mask, 0b10);
        assert_eq!(t.active_core, 1);
        assert_eq!(t.ref_count, 1);
        assert_eq!(t.entry_point(), (0x1000, 7, 0x8000));
    }

    #[test]
    fn test_suspend_gates_runnable() {
        let mut t = thread();
        t.set_state(ThreadState::Runnable);
        assert_eq!(t.raw_state(), ThreadState::Runnable as u16);

        t.request_suspend(SuspendType::Thread);
        let old = t.apply_suspend_requests();
        assert_eq!(old, Some(ThreadState::Runnable as u16));
        assert_eq!(t.state(), ThreadState::Runnable);
        assert_ne!(t.raw_state(), ThreadState::Runnable as u16);
        assert_eq!(t.raw_state() & SUSPEND_MASK, SuspendType::Thread.flag());

        t.clear_suspend(SuspendType::Thread);
        t.apply_suspend_requests();
        assert_eq!(t.raw_state(), ThreadState::Runnable as u16);
    }

    #[test]
    fn test_state_change_keeps_flags() {
        let mut t = thread();
        t.request_suspend(SuspendType::Debug);
        t.apply_suspend_requests();
        t.set_state(ThreadState::Waiting);
        assert_eq!(t.raw_state(), ThreadState::Waiting as u16 | SuspendType::Debug.flag());

        t.set_state(ThreadState::Terminated);
        assert_eq!(t.raw_state(), ThreadState::Terminated as u16);
        assert_eq!(t.apply_suspend_requests(), None);
    }

    #[test]
    fn test_suspend_flags() {
        assert_eq!(SuspendType::Process.flag(), 0x10);
        assert_eq!(SuspendType::Init.flag(), 0x100);
        assert_eq!(SUSPEND_MASK, 0x1F0);
    }
}
