//! Per-core scheduling state
//!
//! The layout is fixed so that exception entry code can read
//! `needs_scheduling` and the highest-priority thread without calling into
//! Rust. Only `needs_scheduling` is touched outside the scheduler lock.

use core::sync::atomic::{AtomicBool, Ordering};

use ember_intrusive::NodeId;

use crate::object::ThreadRef;

/// Scheduler state of one core.
#[repr(C)]
#[derive(Debug)]
pub struct SchedulingState {
    /// Set when `highest_priority_thread` changed and the core has not yet
    /// switched to it
    pub needs_scheduling: AtomicBool,
    /// An interrupt task is waiting to run on this core
    pub interrupt_task_runnable: bool,
    /// Count switches to idle in `idle_count`
    pub should_count_idle: bool,
    pub idle_count: u64,
    /// Thread this core should be running; NULL means idle
    pub highest_priority_thread: NodeId,
    /// Top of this core's idle stack
    pub idle_thread_stack: usize,
    /// Thread that ran before the last switch
    pub prev_thread: NodeId,
    /// Address of the core's interrupt task manager
    pub interrupt_task_manager: usize,
}

#[cfg(target_pointer_width = "64")]
const _: () = {
    use core::mem::{offset_of, size_of};
    assert!(offset_of!(SchedulingState, needs_scheduling) == 0x00);
    assert!(offset_of!(SchedulingState, interrupt_task_runnable) == 0x01);
    assert!(offset_of!(SchedulingState, should_count_idle) == 0x02);
    assert!(offset_of!(SchedulingState, idle_count) == 0x08);
    assert!(offset_of!(SchedulingState, highest_priority_thread) == 0x10);
    assert!(offset_of!(SchedulingState, idle_thread_stack) == 0x18);
    assert!(offset_of!(SchedulingState, prev_thread) == 0x20);
    assert!(offset_of!(SchedulingState, interrupt_task_manager) == 0x28);
    assert!(size_of::<SchedulingState>() == 0x30);
};

impl SchedulingState {
    #[must_use]
    pub const fn new(count_idle: bool) -> Self {
        Self {
            needs_scheduling: AtomicBool::new(false),
            interrupt_task_runnable: false,
            should_count_idle: count_idle,
            idle_count: 0,
            highest_priority_thread: NodeId::NULL,
            idle_thread_stack: 0,
            prev_thread: NodeId::NULL,
            interrupt_task_manager: 0,
        }
    }

    #[inline]
    pub fn needs_scheduling(&self) -> bool {
        self.needs_scheduling.load(Ordering::Acquire)
    }

    #[inline]
    pub fn set_needs_scheduling(&self, value: bool) {
        self.needs_scheduling.store(value, Ordering::Release);
    }

    #[inline]
    pub fn highest_priority_thread(&self) -> Option<ThreadRef> {
        self.highest_priority_thread.to_option().map(ThreadRef)
    }
}

/// What a core runs after a reschedule.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SwitchTarget {
    Thread(ThreadRef),
    Idle,
    InterruptTask,
}

/// Result of [`Kernel::reschedule_current_core`](crate::Kernel::reschedule_current_core).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ThreadSwitch {
    /// Thread that was running, `None` when the core was idle
    pub prev: Option<ThreadRef>,
    pub next: SwitchTarget,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_state() {
        let state = SchedulingState::new(true);
        assert!(!state.needs_scheduling());
        assert!(state.should_count_idle);
        assert_eq!(state.highest_priority_thread(), None);

        state.set_needs_scheduling(true);
        assert!(state.needs_scheduling());
    }
}
