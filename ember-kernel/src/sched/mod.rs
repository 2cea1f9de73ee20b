//! Priority Scheduler
//!
//! Fixed-priority, per-core scheduling with opportunistic migration.
//!
//! # Key Concepts
//!
//! - **Scheduled queue**: per core, the runnable threads whose active core
//!   is that core, by priority (0 highest).
//! - **Suggested queue**: per core, runnable threads that could run there
//!   but are currently assigned elsewhere.
//! - **Highest priority thread**: what a core should be running. Recomputed
//!   in one pass for all cores whenever a state change marks the scheduler
//!   as needing an update; cores whose choice changed get `needs_scheduling`
//!   and, if they are not the caller, a scheduler IPI.
//! - **Migration**: an idle core first pulls a suggested thread that is not
//!   already the top thread on its own core, then steals the top thread of a
//!   core that has something else to run. A core whose top thread has
//!   priority below [`HIGHEST_CORE_MIGRATION_ALLOWED_PRIORITY`] never loses
//!   threads to migration.
//!
//! Everything here runs under the scheduler lock; see
//! [`SchedulerGuard`](crate::kernel::SchedulerGuard).

use core::array;

use ember_arch::smp::{core_bit, CoreMask, NUM_CORES};
use ember_intrusive::NodeId;
use log::trace;

use crate::object::{ObjectStore, Thread, ThreadRef, ThreadState};

pub mod ipi;
pub mod priority_queue;
pub mod state;
pub mod timer;

pub use ipi::{reschedule_other_cores, GicIpi, InterProcessorInterrupt};
pub use priority_queue::PriorityQueue;
pub use state::{SchedulingState, SwitchTarget, ThreadSwitch};
pub use timer::{ns_to_ticks, SleepQueue};

// -- Constants

/// Top threads with a priority numerically below this are never migrated
/// off their core.
pub const HIGHEST_CORE_MIGRATION_ALLOWED_PRIORITY: i32 = 2;

const RUNNABLE: u16 = ThreadState::Runnable as u16;

// -- Scheduler

/// Scheduling state of all cores.
pub struct Scheduler {
    queue: PriorityQueue<Thread>,
    states: [SchedulingState; NUM_CORES],
    /// Thread each core is running, NULL for idle
    current: [NodeId; NUM_CORES],
    active_cores: u64,
    update_needed: bool,
    /// Cores asked to reschedule outside the highest-priority update
    forced_cores: u64,
    sleepers: SleepQueue<Thread>,
    now: u64,
}

impl Scheduler {
    #[must_use]
    pub fn new(active_cores: u64, count_idle: bool) -> Self {
        Self {
            queue: PriorityQueue::new(),
            states: array::from_fn(|_| SchedulingState::new(count_idle)),
            current: [NodeId::NULL; NUM_CORES],
            active_cores,
            update_needed: false,
            forced_cores: 0,
            sleepers: SleepQueue::new(),
            now: 0,
        }
    }

    #[inline]
    #[must_use]
    pub fn state(&self, core: usize) -> &SchedulingState {
        &self.states[core]
    }

    /// Last tick seen by [`handle_timer`](Self::handle_timer).
    #[inline]
    #[must_use]
    pub fn now(&self) -> u64 {
        self.now
    }

    /// Thread running on `core`, if it still exists.
    #[must_use]
    pub fn current_thread(&self, objects: &ObjectStore, core: usize) -> Option<ThreadRef> {
        self.current[core]
            .to_option()
            .filter(|&id| objects.threads.contains(id))
            .map(ThreadRef)
    }

    #[must_use]
    pub fn is_current(&self, t: ThreadRef) -> bool {
        self.current.contains(&t.0)
    }

    #[inline]
    pub fn set_update_needed(&mut self) {
        self.update_needed = true;
    }

    #[inline]
    #[must_use]
    pub fn is_update_needed(&self) -> bool {
        self.update_needed
    }

    #[must_use]
    pub fn queue(&self) -> &PriorityQueue<Thread> {
        &self.queue
    }

    fn increment_scheduled_count(objects: &mut ObjectStore, id: NodeId) {
        let Some(owner) = objects.threads.get(id).map(|t| t.owner) else {
            return;
        };
        if let Some(process) = objects.processes.get_mut(owner.0) {
            process.schedule_count += 1;
        }
    }

    // -- Highest-priority selection

    /// Record `thread` as what `core` should run.
    ///
    /// Returns `1 << core` if that changed the core's choice, else 0.
    pub fn update_highest_priority_thread(
        &mut self,
        objects: &mut ObjectStore,
        core: usize,
        thread: Option<NodeId>,
    ) -> u64 {
        let state = &mut self.states[core];
        let prev = state.highest_priority_thread.to_option();
        if prev == thread {
            return 0;
        }

        if let Some(prev) = prev {
            Self::increment_scheduled_count(objects, prev);
            if let Some(t) = objects.threads.get_mut(prev) {
                t.last_scheduled_tick = self.now;
            }
        }
        if state.should_count_idle && thread.is_none() {
            state.idle_count += 1;
        }

        state.highest_priority_thread = NodeId::from_option(thread);
        state.set_needs_scheduling(true);
        core_bit(core)
    }

    /// Recompute every core's highest priority thread, migrating threads
    /// onto idle cores where allowed.
    ///
    /// Returns the mask of cores whose choice changed.
    pub fn update_highest_priority_threads(&mut self, objects: &mut ObjectStore) -> u64 {
        self.update_needed = false;

        let mut cores_needing_scheduling = 0;
        let mut idle_cores = CoreMask::EMPTY;
        let mut top: [Option<NodeId>; NUM_CORES] = [None; NUM_CORES];

        for core in 0..NUM_CORES {
            top[core] = self.queue.scheduled_front(core);
            if top[core].is_none() && CoreMask(self.active_cores).contains(core) {
                idle_cores.0 |= core_bit(core);
            }
            cores_needing_scheduling |= self.update_highest_priority_thread(objects, core, top[core]);
        }

        while let Some(core) = idle_cores.lowest() {
            idle_cores = idle_cores.without(core);

            let mut candidates = [0usize; NUM_CORES];
            let mut num_candidates = 0;
            let mut suggested = self.queue.suggested_front(core);

            while let Some(s) = suggested {
                let s_core = objects.threads[s].active_core;
                let top_on_s_core = usize::try_from(s_core).ok().and_then(|c| top[c]);

                if top_on_s_core != Some(s) {
                    if let Some(t) = top_on_s_core {
                        if objects.threads[t].priority < HIGHEST_CORE_MIGRATION_ALLOWED_PRIORITY {
                            break;
                        }
                    }
                    trace!("core {core}: pulling thread {} from core {s_core}", objects.threads[s].id);
                    objects.threads[s].active_core = core as i32;
                    self.queue.change_core(&mut objects.threads, s_core, s, false);
                    top[core] = Some(s);
                    cores_needing_scheduling |= self.update_highest_priority_thread(objects, core, top[core]);
                    break;
                }

                // The suggestion is the top thread on its own core; remember
                // that core in case it has something else to run
                if let Ok(c) = usize::try_from(s_core) {
                    if num_candidates < NUM_CORES {
                        candidates[num_candidates] = c;
                        num_candidates += 1;
                    }
                }
                suggested = self.queue.suggested_next(&objects.threads, core, s);
            }

            if suggested.is_some() {
                continue;
            }

            for &candidate in &candidates[..num_candidates] {
                let Some(s) = top[candidate] else {
                    continue;
                };
                let Some(next) = self.queue.scheduled_next(&objects.threads, candidate, s) else {
                    continue;
                };

                top[candidate] = Some(next);
                cores_needing_scheduling |= self.update_highest_priority_thread(objects, candidate, top[candidate]);

                trace!("core {core}: stealing thread {} from core {candidate}", objects.threads[s].id);
                objects.threads[s].active_core = core as i32;
                self.queue.change_core(&mut objects.threads, candidate as i32, s, false);
                top[core] = Some(s);
                cores_needing_scheduling |= self.update_highest_priority_thread(objects, core, top[core]);
                break;
            }
        }

        cores_needing_scheduling
    }

    /// Ask `core` to reschedule even if its choice is unchanged.
    pub fn request_reschedule(&mut self, core: usize) {
        self.states[core].set_needs_scheduling(true);
        self.forced_cores |= core_bit(core);
    }

    /// Mark the core's interrupt task as runnable; it preempts any thread.
    pub fn set_interrupt_task_runnable(&mut self, core: usize) {
        self.states[core].interrupt_task_runnable = true;
        self.request_reschedule(core);
    }

    /// Run a pending update and collect every core that must reschedule.
    pub fn take_cores_needing_scheduling(&mut self, objects: &mut ObjectStore) -> u64 {
        let mut cores = core::mem::take(&mut self.forced_cores);
        if self.update_needed {
            cores |= self.update_highest_priority_threads(objects);
        }
        cores
    }

    // -- Thread changes

    /// Queue or dequeue `t` after its raw state changed from `old_raw`.
    pub fn on_thread_state_changed(&mut self, objects: &mut ObjectStore, t: ThreadRef, old_raw: u16) {
        let cur_raw = objects.threads[t.0].raw_state;
        if old_raw == cur_raw {
            return;
        }
        if old_raw == RUNNABLE {
            self.queue.remove(&mut objects.threads, t.0);
        } else if cur_raw == RUNNABLE {
            self.queue.push_back(&mut objects.threads, t.0);
        } else {
            return;
        }
        Self::increment_scheduled_count(objects, t.0);
        self.set_update_needed();
    }

    /// Requeue `t` after its priority changed from `old_priority`.
    pub fn on_thread_priority_changed(&mut self, objects: &mut ObjectStore, t: ThreadRef, old_priority: i32) {
        if objects.threads[t.0].raw_state != RUNNABLE {
            return;
        }
        let is_running = self.is_current(t);
        self.queue.change_priority(&mut objects.threads, old_priority, is_running, t.0);
        Self::increment_scheduled_count(objects, t.0);
        self.set_update_needed();
    }

    /// Requeue `t` after its affinity or active core changed.
    pub fn on_thread_affinity_mask_changed(
        &mut self,
        objects: &mut ObjectStore,
        t: ThreadRef,
        old_affinity: u64,
        old_core: i32,
    ) {
        if objects.threads[t.0].raw_state != RUNNABLE {
            return;
        }
        self.queue.change_affinity_mask(&mut objects.threads, old_core, old_affinity, t.0);
        Self::increment_scheduled_count(objects, t.0);
        self.set_update_needed();
    }

    // -- Yields

    /// The running thread on `core`, if runnable and due for a yield.
    fn yielding_thread(&self, objects: &ObjectStore, core: usize) -> Option<ThreadRef> {
        let t = self.current_thread(objects, core)?;
        let thread = &objects.threads[t.0];
        let process = objects.processes.get(thread.owner.0)?;
        (thread.yield_schedule_count != process.schedule_count && thread.raw_state == RUNNABLE).then_some(t)
    }

    fn mark_yield_redundant(objects: &mut ObjectStore, t: ThreadRef) {
        let owner = objects.threads[t.0].owner;
        let count = objects.processes[owner.0].schedule_count;
        objects.threads[t.0].yield_schedule_count = count;
    }

    /// Give up the rest of the turn to threads of equal priority on this core.
    pub fn yield_without_core_migration(&mut self, objects: &mut ObjectStore, core: usize) {
        let Some(t) = self.yielding_thread(objects, core) else {
            return;
        };
        objects.threads[t.0].yield_count += 1;

        let next = self.queue.move_to_scheduled_back(&mut objects.threads, t.0);
        Self::increment_scheduled_count(objects, t.0);

        if next == Some(t.0) {
            Self::mark_yield_redundant(objects, t);
        } else {
            self.set_update_needed();
        }
    }

    /// Yield, and pull a suggested thread of at least equal priority onto
    /// this core if one can migrate.
    pub fn yield_with_core_migration(&mut self, objects: &mut ObjectStore, core: usize) {
        let Some(t) = self.yielding_thread(objects, core) else {
            return;
        };
        objects.threads[t.0].yield_count += 1;

        let Ok(core_id) = usize::try_from(objects.threads[t.0].active_core) else {
            return;
        };
        let priority = objects.threads[t.0].priority;
        let next = self.queue.move_to_scheduled_back(&mut objects.threads, t.0);
        Self::increment_scheduled_count(objects, t.0);

        let mut recheck = false;
        let mut suggested = self.queue.suggested_front(core_id);
        while let Some(s) = suggested {
            let s_core = objects.threads[s].active_core;
            let running_on_s_core = usize::try_from(s_core)
                .ok()
                .and_then(|c| self.states[c].highest_priority_thread.to_option());

            if running_on_s_core != Some(s) {
                let s_priority = objects.threads[s].priority;
                // Prefer our own next thread over a lower-priority suggestion,
                // and over an equal one that ran more recently
                let prefer_next = match next {
                    Some(n) if n != t.0 => {
                        objects.threads[n].last_scheduled_tick < objects.threads[s].last_scheduled_tick
                    }
                    _ => false,
                };
                if s_priority > priority || (s_priority == priority && prefer_next) {
                    suggested = None;
                    break;
                }

                let can_migrate = running_on_s_core
                    .and_then(|r| objects.threads.get(r))
                    .is_none_or(|r| r.priority >= HIGHEST_CORE_MIGRATION_ALLOWED_PRIORITY);
                if can_migrate {
                    objects.threads[s].active_core = core_id as i32;
                    self.queue.change_core(&mut objects.threads, s_core, s, true);
                    Self::increment_scheduled_count(objects, s);
                    break;
                }
                recheck = true;
            }
            suggested = self.queue.suggested_next(&objects.threads, core_id, s);
        }

        if suggested.is_some() || next != Some(t.0) {
            self.set_update_needed();
        } else if !recheck {
            Self::mark_yield_redundant(objects, t);
        }
    }

    /// Step off this core entirely, letting any suggested thread have it.
    ///
    /// The thread stays runnable as a suggestion and gets placed again by
    /// the next update.
    pub fn yield_to_any_thread(&mut self, objects: &mut ObjectStore, core: usize) {
        let Some(t) = self.yielding_thread(objects, core) else {
            return;
        };
        objects.threads[t.0].yield_count += 1;

        let old_core = objects.threads[t.0].active_core;
        let Ok(core_id) = usize::try_from(old_core) else {
            return;
        };
        objects.threads[t.0].active_core = -1;
        self.queue.change_core(&mut objects.threads, old_core, t.0, false);
        Self::increment_scheduled_count(objects, t.0);

        if self.queue.has_scheduled(core_id) {
            self.set_update_needed();
            return;
        }

        let mut suggested = self.queue.suggested_front(core_id);
        while let Some(s) = suggested {
            let s_core = objects.threads[s].active_core;
            let top_on_s_core = usize::try_from(s_core)
                .ok()
                .and_then(|c| self.queue.scheduled_front(c));

            if top_on_s_core != Some(s) {
                let can_migrate = top_on_s_core
                    .is_none_or(|top| objects.threads[top].priority >= HIGHEST_CORE_MIGRATION_ALLOWED_PRIORITY);
                if can_migrate {
                    objects.threads[s].active_core = core_id as i32;
                    self.queue.change_core(&mut objects.threads, s_core, s, false);
                    Self::increment_scheduled_count(objects, s);
                }
                break;
            }
            suggested = self.queue.suggested_next(&objects.threads, core_id, s);
        }

        if suggested == Some(t.0) {
            Self::mark_yield_redundant(objects, t);
        } else {
            self.set_update_needed();
        }
    }

    // -- Switching

    /// Pick what `core` runs next if its choice changed.
    ///
    /// Returns `None` when the core should keep running what it runs.
    pub fn reschedule_current_core(&mut self, objects: &ObjectStore, core: usize) -> Option<ThreadSwitch> {
        let state = &mut self.states[core];
        if !state.needs_scheduling() {
            return None;
        }

        let prev = self.current[core]
            .to_option()
            .filter(|&id| objects.threads.contains(id))
            .map(ThreadRef);

        if state.interrupt_task_runnable {
            // Leave needs_scheduling set so the core comes back for its
            // thread once the task is done
            state.interrupt_task_runnable = false;
            return Some(ThreadSwitch { prev, next: SwitchTarget::InterruptTask });
        }
        state.set_needs_scheduling(false);

        let next = state
            .highest_priority_thread
            .to_option()
            .filter(|&id| objects.threads.contains(id));
        if next == self.current[core].to_option() {
            return None;
        }

        state.prev_thread = NodeId::from_option(prev.map(|t| t.0));
        self.current[core] = NodeId::from_option(next);

        let next = next.map_or(SwitchTarget::Idle, |id| SwitchTarget::Thread(ThreadRef(id)));
        trace!("core {core}: switch {prev:?} -> {next:?}");
        Some(ThreadSwitch { prev, next })
    }

    // -- Sleep

    /// Put a runnable thread to sleep until `wake_tick`.
    pub fn sleep(&mut self, objects: &mut ObjectStore, t: ThreadRef, wake_tick: u64) {
        let thread = &mut objects.threads[t.0];
        thread.wake_tick = wake_tick;
        let old = thread.set_state(ThreadState::Waiting);
        self.sleepers.insert(&mut objects.threads, t.0);
        self.on_thread_state_changed(objects, t, old);
    }

    /// Drop `t` from the sleep queue without waking it.
    pub fn cancel_sleep(&mut self, objects: &mut ObjectStore, t: ThreadRef) -> bool {
        self.sleepers.cancel(&mut objects.threads, t.0)
    }

    /// Advance time to `now` and wake every expired sleeper.
    ///
    /// Returns the number of threads woken.
    pub fn handle_timer(&mut self, objects: &mut ObjectStore, now: u64) -> usize {
        self.now = self.now.max(now);
        let mut woken = 0;
        while let Some(id) = self.sleepers.pop_expired(&mut objects.threads, self.now) {
            let thread = &mut objects.threads[id];
            if thread.state() != ThreadState::Waiting {
                continue;
            }
            let old = thread.set_state(ThreadState::Runnable);
            self.on_thread_state_changed(objects, ThreadRef(id), old);
            woken += 1;
        }
        woken
    }

    #[must_use]
    pub fn next_wake_tick(&self, objects: &ObjectStore) -> Option<u64> {
        self.sleepers.next_wake_tick(&objects.threads)
    }
}
