//! Kernel state under the scheduler lock
//!
//! [`KernelState`] pairs the object registries with the scheduler and
//! implements the lifecycle operations that touch both: starting and
//! terminating threads and processes, priority and affinity changes,
//! suspension and debugger attachment.

use alloc::vec::Vec;

use ember_arch::smp::{CoreMask, ALL_CORES_MASK};
use ember_paging::AddressSpace;
use ember_syscall::types::{ProcessState, ThreadActivity, YieldType, IDEAL_CORE_NO_UPDATE};
use ember_syscall::{SvcError, SvcResult};
use log::{debug, info};

use crate::config::KernelConfig;
use crate::object::{ObjectStore, ProcessParams, ProcessRef, SuspendType, ThreadParams, ThreadRef, ThreadState};
use crate::sched::{ns_to_ticks, Scheduler};

/// Everything guarded by the scheduler lock.
pub struct KernelState {
    pub objects: ObjectStore,
    pub sched: Scheduler,
    default_handle_table_size: usize,
    ticks_per_second: u64,
}

impl KernelState {
    #[must_use]
    pub fn new(config: &KernelConfig) -> Self {
        Self {
            objects: ObjectStore::new(config.max_threads, config.max_processes),
            sched: Scheduler::new(config.active_cores, config.count_idle),
            default_handle_table_size: config.default_handle_table_size,
            ticks_per_second: config.ticks_per_second,
        }
    }

    /// Thread running on `core`.
    #[must_use]
    pub fn current_thread(&self, core: usize) -> Option<ThreadRef> {
        self.sched.current_thread(&self.objects, core)
    }

    // -- Suspension

    fn update_suspend_state(&mut self, t: ThreadRef) {
        if let Some(old) = self.objects.thread_mut(t).apply_suspend_requests() {
            self.sched.on_thread_state_changed(&mut self.objects, t, old);
        }
    }

    fn request_suspend(&mut self, t: ThreadRef, ty: SuspendType) {
        self.objects.thread_mut(t).request_suspend(ty);
        self.update_suspend_state(t);
    }

    fn resume(&mut self, t: ThreadRef, ty: SuspendType) {
        self.objects.thread_mut(t).clear_suspend(ty);
        self.update_suspend_state(t);
    }

    // -- Processes

    /// Create a process in the `Created` state.
    ///
    /// The caller owns the returned reference.
    pub fn create_process(
        &mut self,
        params: &ProcessParams,
        address_space: Option<AddressSpace>,
    ) -> SvcResult<ProcessRef> {
        if params.core_mask == 0 || params.core_mask & !ALL_CORES_MASK != 0 {
            return Err(SvcError::InvalidCoreId);
        }
        let ideal_bit = u32::try_from(params.ideal_core).ok().and_then(|c| 1u64.checked_shl(c));
        if ideal_bit.is_none_or(|bit| params.core_mask & bit == 0) {
            return Err(SvcError::InvalidCoreId);
        }
        if params.priority_mask == 0 {
            return Err(SvcError::InvalidPriority);
        }

        let table_size = match params.handle_table_size {
            0 => self.default_handle_table_size,
            n => n,
        };
        self.objects.create_process(params, table_size, address_space)
    }

    /// Create the main thread of a `Created` process and start both.
    ///
    /// The main thread receives a handle to itself as its argument.
    pub fn start_process(
        &mut self,
        p: ProcessRef,
        priority: i32,
        core: i32,
        entry: u64,
        stack_top: u64,
    ) -> SvcResult<ThreadRef> {
        let process = self.objects.process(p);
        let next_state = match process.state() {
            ProcessState::Created => ProcessState::Running,
            ProcessState::CreatedAttached => ProcessState::RunningAttached,
            _ => return Err(SvcError::InvalidState),
        };
        if !process.check_thread_priority(priority) {
            return Err(SvcError::InvalidPriority);
        }
        let core = if core < 0 { process.ideal_core() } else { core };
        if u32::try_from(core).ok().and_then(|c| 1u64.checked_shl(c)).is_none_or(|b| process.core_mask() & b == 0) {
            return Err(SvcError::InvalidCoreId);
        }

        let params = ThreadParams { entry, argument: 0, stack_top, priority, core };
        let t = self.objects.create_thread(p, &params)?;
        let handle = match self.objects.add(p, t) {
            Ok(h) => h,
            Err(e) => {
                self.objects.close(t.into());
                return Err(e);
            }
        };
        self.objects.thread_mut(t).argument = u64::from(handle.raw());

        let process = self.objects.process_mut(p);
        process.state = next_state;
        process.running = true;
        self.objects.open(p.into());

        let result = self.start_thread(t);
        self.objects.close(t.into());
        result?;

        info!("process {} ({}) started", self.objects.process(p).id(), self.objects.process(p).name());
        Ok(t)
    }

    /// Terminate every thread of `p` and release its resources.
    ///
    /// A process that never started cannot be terminated; one already
    /// terminating is left alone.
    pub fn terminate_process(&mut self, p: ProcessRef) -> SvcResult<()> {
        match self.objects.process(p).state() {
            ProcessState::Created | ProcessState::CreatedAttached => return Err(SvcError::InvalidState),
            ProcessState::Terminating | ProcessState::Terminated => return Ok(()),
            _ => {}
        }
        self.terminate_running_process(p);
        Ok(())
    }

    /// Tear down a process that has been started and not yet terminated.
    fn terminate_running_process(&mut self, p: ProcessRef) {
        let pid = self.objects.process(p).id();
        self.objects.process_mut(p).state = ProcessState::Terminating;

        for t in self.objects.threads_of(p) {
            if self.objects.contains_thread(t) {
                self.terminate_thread(t);
            }
        }

        let process = self.objects.process_mut(p);
        process.state = ProcessState::Terminated;
        process.aliases.clear();
        let handles = process.handle_table.drain();
        let space = process.address_space.take();
        let was_running = core::mem::take(&mut process.running);

        if let Some(space) = space {
            self.objects.dead_address_spaces.push(space);
        }
        for obj in handles {
            self.objects.close(obj);
        }
        if was_running {
            self.objects.close(p.into());
        }
        info!("process {pid} terminated");
    }

    /// Attach a debugger to `p`, debug-suspending all of its threads.
    pub fn debug_attach(&mut self, p: ProcessRef) -> SvcResult<()> {
        let process = self.objects.process_mut(p);
        process.state = match process.state {
            ProcessState::Created => ProcessState::CreatedAttached,
            ProcessState::Running | ProcessState::Crashed => ProcessState::DebugBreak,
            ProcessState::CreatedAttached | ProcessState::RunningAttached | ProcessState::DebugBreak => {
                return Err(SvcError::Busy)
            }
            ProcessState::Terminating | ProcessState::Terminated => return Err(SvcError::ProcessTerminated),
        };
        debug!("debugger attached to process {}", process.id);

        for t in self.objects.threads_of(p) {
            if !self.objects.thread(t).is_terminated() {
                self.request_suspend(t, SuspendType::Debug);
            }
        }
        Ok(())
    }

    // -- Threads

    /// Create a thread in `p`. The caller owns the returned reference.
    pub fn create_thread(&mut self, p: ProcessRef, params: &ThreadParams) -> SvcResult<ThreadRef> {
        if self.objects.process(p).state().is_terminated() {
            return Err(SvcError::ProcessTerminated);
        }
        self.objects.create_thread(p, params)
    }

    /// Move an `Initialized` thread to `Runnable`.
    pub fn start_thread(&mut self, t: ThreadRef) -> SvcResult<()> {
        let thread = self.objects.thread(t);
        if thread.state() != ThreadState::Initialized {
            return Err(SvcError::InvalidState);
        }
        let owner = thread.owner();
        if self.objects.process(owner).state().is_terminated() {
            return Err(SvcError::ProcessTerminated);
        }

        self.objects.open(t.into());
        self.objects.thread_mut(t).started = true;
        if self.objects.process(owner).is_debug_attached() {
            self.request_suspend(t, SuspendType::Debug);
        }

        let old = self.objects.thread_mut(t).set_state(ThreadState::Runnable);
        self.sched.on_thread_state_changed(&mut self.objects, t, old);
        debug!("thread {} started", self.objects.thread(t).id());
        Ok(())
    }

    /// Terminate `t`, and its process with it if `t` was the last started
    /// thread of a running process.
    pub fn terminate_thread(&mut self, t: ThreadRef) {
        if self.objects.thread(t).is_terminated() {
            return;
        }
        self.sched.cancel_sleep(&mut self.objects, t);

        let thread = self.objects.thread_mut(t);
        let old = thread.set_state(ThreadState::Terminated);
        let owner = thread.owner();
        let tid = thread.id();
        let was_started = core::mem::take(&mut thread.started);
        self.sched.on_thread_state_changed(&mut self.objects, t, old);
        debug!("thread {tid} terminated");

        if was_started {
            self.objects.close(t.into());
        }

        if !self.objects.contains_process(owner) || !self.objects.process(owner).is_running() {
            return;
        }
        let any_started = self
            .objects
            .threads_of(owner)
            .into_iter()
            .any(|t| self.objects.thread(t).started);
        if !any_started {
            self.terminate_running_process(owner);
        }
    }

    /// Terminate the thread running on `core`.
    pub fn exit_thread(&mut self, core: usize) {
        if let Some(t) = self.current_thread(core) {
            self.terminate_thread(t);
        }
    }

    pub fn set_thread_priority(&mut self, t: ThreadRef, priority: i32) {
        let thread = self.objects.thread_mut(t);
        let old = thread.priority;
        thread.base_priority = priority;
        thread.priority = priority;
        if old != priority {
            self.sched.on_thread_priority_changed(&mut self.objects, t, old);
        }
    }

    /// Set ideal core and affinity.
    ///
    /// `core_id` may be [`IDEAL_CORE_NO_UPDATE`] to keep the current ideal
    /// core, which must then be in `mask`. A thread whose active core
    /// leaves the mask moves to its ideal core, or to the highest core in
    /// the mask when it has none.
    pub fn set_thread_core_mask(&mut self, t: ThreadRef, core_id: i32, mask: u64) -> SvcResult<()> {
        let thread = self.objects.thread_mut(t);
        let core_id = if core_id == IDEAL_CORE_NO_UPDATE {
            let ideal = thread.ideal_core;
            let in_mask = u32::try_from(ideal).ok().and_then(|c| 1u64.checked_shl(c)).is_some_and(|b| mask & b != 0);
            if !in_mask {
                return Err(SvcError::InvalidCombination);
            }
            ideal
        } else {
            core_id
        };

        let old_mask = thread.affinity_mask;
        thread.ideal_core = core_id;
        thread.affinity_mask = mask;
        if old_mask == mask {
            return Ok(());
        }

        let active_core = thread.active_core;
        let active_in_mask = usize::try_from(active_core).map_or(true, |c| CoreMask(mask).contains(c));
        if !active_in_mask {
            thread.active_core = match CoreMask(mask).highest() {
                Some(highest) if core_id < 0 => highest as i32,
                _ => core_id,
            };
        }
        self.sched.on_thread_affinity_mask_changed(&mut self.objects, t, old_mask, active_core);
        Ok(())
    }

    /// Pause or resume a waiting or runnable thread.
    pub fn set_thread_activity(&mut self, t: ThreadRef, activity: ThreadActivity) -> SvcResult<()> {
        let thread = self.objects.thread(t);
        if !matches!(thread.state(), ThreadState::Waiting | ThreadState::Runnable) {
            return Err(SvcError::InvalidState);
        }
        let paused = thread.is_suspend_requested(SuspendType::Thread);
        match activity {
            ThreadActivity::Paused if !paused => self.request_suspend(t, SuspendType::Thread),
            ThreadActivity::Runnable if paused => self.resume(t, SuspendType::Thread),
            _ => return Err(SvcError::InvalidState),
        }
        Ok(())
    }

    /// `SleepThread` for the thread on `core`: a yield for 0, -1 and -2,
    /// a timed wait for positive values.
    pub fn sleep_thread(&mut self, core: usize, ns: i64) {
        match YieldType::from_sleep_ns(ns) {
            Some(YieldType::WithoutCoreMigration) => self.sched.yield_without_core_migration(&mut self.objects, core),
            Some(YieldType::WithCoreMigration) => self.sched.yield_with_core_migration(&mut self.objects, core),
            Some(YieldType::ToAnyThread) => self.sched.yield_to_any_thread(&mut self.objects, core),
            None if ns > 0 => {
                let Some(t) = self.current_thread(core) else {
                    return;
                };
                let ticks = ns_to_ticks(ns.unsigned_abs(), self.ticks_per_second);
                let wake = self.sched.now().saturating_add(ticks);
                self.sched.sleep(&mut self.objects, t, wake);
            }
            None => {}
        }
    }

    /// Ids for the list SVCs: every process.
    #[must_use]
    pub fn process_ids(&self) -> Vec<u64> {
        self.objects.process_ids().collect()
    }
}
