//! Thread SVC handlers
//!
//! - CreateThread / StartThread / ExitThread
//! - SleepThread: timed sleep, or one of the three yields
//! - Get/SetThreadPriority, Get/SetThreadCoreMask
//! - GetThreadId, SetThreadActivity, GetThreadList

use alloc::vec::Vec;

use ember_syscall::types::{
    is_valid_priority, ThreadActivity, IDEAL_CORE_DONT_CARE, IDEAL_CORE_NO_UPDATE, IDEAL_CORE_USE_PROCESS_VALUE,
};
use ember_syscall::{Handle, SvcError, SvcResult};

use super::{caller, valid_core, write_id_list, SvcRegisters};
use crate::kernel::Kernel;
use crate::object::{Process, Thread, ThreadParams, ThreadRef};
use crate::sched::InterProcessorInterrupt;
use crate::state::KernelState;

fn thread_from_handle(state: &KernelState, core: usize, raw: u32) -> SvcResult<ThreadRef> {
    let (p, current) = caller(state, core)?;
    state
        .objects
        .get_object_from_handle::<Thread>(p, Some(current), Handle::from_raw(raw))
        .ok_or(SvcError::InvalidHandle)
}

/// Handle CreateThread.
///
/// # ABI
///
/// - x1: entry point
/// - x2: argument
/// - x3: stack top
/// - w4: priority, must be allowed by the process
/// - w5: core, or -2 for the process's ideal core
///
/// # Returns
///
/// w1: handle to the new thread, which starts out `Initialized`.
pub fn create_thread<I: InterProcessorInterrupt>(kernel: &Kernel<I>, core: usize, regs: &mut SvcRegisters) -> SvcResult<()> {
    let (entry, argument, stack_top) = (regs.x[1], regs.x[2], regs.x[3]);
    let priority = regs.w_signed(4);
    let core_id = regs.w_signed(5);
    if !is_valid_priority(priority) {
        return Err(SvcError::InvalidPriority);
    }
    if core_id != IDEAL_CORE_USE_PROCESS_VALUE && !valid_core(core_id) {
        return Err(SvcError::InvalidCoreId);
    }

    let mut guard = kernel.lock(core);
    let (p, _) = caller(&guard, core)?;
    let process = guard.objects.process(p);
    let core_id = if core_id == IDEAL_CORE_USE_PROCESS_VALUE { process.ideal_core() } else { core_id };
    if process.core_mask() & (1u64 << core_id) == 0 {
        return Err(SvcError::InvalidCoreId);
    }
    if !process.check_thread_priority(priority) {
        return Err(SvcError::InvalidPriority);
    }

    let params = ThreadParams { entry, argument, stack_top, priority, core: core_id };
    let t = guard.create_thread(p, &params)?;
    let handle = guard.objects.add(p, t);
    guard.objects.close(t.into());
    regs.x[1] = u64::from(handle?.raw());
    Ok(())
}

/// Handle StartThread.
///
/// # ABI
///
/// - w0: thread handle
pub fn start_thread<I: InterProcessorInterrupt>(kernel: &Kernel<I>, core: usize, regs: &SvcRegisters) -> SvcResult<()> {
    let mut guard = kernel.lock(core);
    let t = thread_from_handle(&guard, core, regs.w(0))?;
    guard.start_thread(t)
}

/// Handle ExitThread. The caller does not return to user space.
pub fn exit_thread<I: InterProcessorInterrupt>(kernel: &Kernel<I>, core: usize) -> SvcResult<()> {
    kernel.lock(core).exit_thread(core);
    Ok(())
}

/// Handle SleepThread.
///
/// # ABI
///
/// - x0: nanoseconds; 0, -1 and -2 select a yield instead
pub fn sleep_thread<I: InterProcessorInterrupt>(kernel: &Kernel<I>, core: usize, regs: &SvcRegisters) -> SvcResult<()> {
    kernel.lock(core).sleep_thread(core, regs.x[0] as i64);
    Ok(())
}

/// Handle GetThreadPriority.
///
/// # ABI
///
/// - w1: thread handle
///
/// # Returns
///
/// w1: current priority
pub fn get_thread_priority<I: InterProcessorInterrupt>(
    kernel: &Kernel<I>,
    core: usize,
    regs: &mut SvcRegisters,
) -> SvcResult<()> {
    let guard = kernel.lock(core);
    let t = thread_from_handle(&guard, core, regs.w(1))?;
    regs.x[1] = u64::from(guard.objects.thread(t).priority as u32);
    Ok(())
}

/// Handle SetThreadPriority.
///
/// # ABI
///
/// - w0: thread handle
/// - w1: priority, must be allowed by the calling process
pub fn set_thread_priority<I: InterProcessorInterrupt>(
    kernel: &Kernel<I>,
    core: usize,
    regs: &SvcRegisters,
) -> SvcResult<()> {
    let priority = regs.w_signed(1);
    if !is_valid_priority(priority) {
        return Err(SvcError::InvalidPriority);
    }

    let mut guard = kernel.lock(core);
    let (p, _) = caller(&guard, core)?;
    if !guard.objects.process(p).check_thread_priority(priority) {
        return Err(SvcError::InvalidPriority);
    }
    let t = thread_from_handle(&guard, core, regs.w(0))?;
    guard.set_thread_priority(t, priority);
    Ok(())
}

/// Handle GetThreadCoreMask.
///
/// # ABI
///
/// - w2: thread handle
///
/// # Returns
///
/// w1: ideal core, x2: affinity mask
pub fn get_thread_core_mask<I: InterProcessorInterrupt>(
    kernel: &Kernel<I>,
    core: usize,
    regs: &mut SvcRegisters,
) -> SvcResult<()> {
    let guard = kernel.lock(core);
    let t = thread_from_handle(&guard, core, regs.w(2))?;
    let thread = guard.objects.thread(t);
    regs.x[1] = u64::from(thread.ideal_core() as u32);
    regs.x[2] = thread.affinity_mask;
    Ok(())
}

/// Handle SetThreadCoreMask.
///
/// # ABI
///
/// - w0: thread handle
/// - w1: ideal core, or -1 (none), -2 (the process's), -3 (keep current)
/// - x2: affinity mask, a subset of the process's core mask
pub fn set_thread_core_mask<I: InterProcessorInterrupt>(
    kernel: &Kernel<I>,
    core: usize,
    regs: &SvcRegisters,
) -> SvcResult<()> {
    let mut core_id = regs.w_signed(1);
    let mut mask = regs.x[2];
    if !valid_core(core_id)
        && !matches!(core_id, IDEAL_CORE_DONT_CARE | IDEAL_CORE_USE_PROCESS_VALUE | IDEAL_CORE_NO_UPDATE)
    {
        return Err(SvcError::InvalidCoreId);
    }

    let mut guard = kernel.lock(core);
    let (p, _) = caller(&guard, core)?;
    let process = guard.objects.process(p);
    if core_id == IDEAL_CORE_USE_PROCESS_VALUE {
        core_id = process.ideal_core();
        mask = 1u64 << core_id;
    } else {
        if mask | process.core_mask() != process.core_mask() {
            return Err(SvcError::InvalidCoreId);
        }
        if mask == 0 {
            return Err(SvcError::InvalidCombination);
        }
        if valid_core(core_id) && mask & (1u64 << core_id) == 0 {
            return Err(SvcError::InvalidCombination);
        }
    }

    let t = thread_from_handle(&guard, core, regs.w(0))?;
    guard.set_thread_core_mask(t, core_id, mask)
}

/// Handle GetThreadId.
///
/// # ABI
///
/// - w1: thread handle
///
/// # Returns
///
/// x1: thread id
pub fn get_thread_id<I: InterProcessorInterrupt>(kernel: &Kernel<I>, core: usize, regs: &mut SvcRegisters) -> SvcResult<()> {
    let guard = kernel.lock(core);
    let t = thread_from_handle(&guard, core, regs.w(1))?;
    regs.x[1] = guard.objects.thread(t).id();
    Ok(())
}

/// Handle SetThreadActivity.
///
/// # ABI
///
/// - w0: handle to another thread of the calling process
/// - w1: 0 to resume, 1 to pause
pub fn set_thread_activity<I: InterProcessorInterrupt>(
    kernel: &Kernel<I>,
    core: usize,
    regs: &SvcRegisters,
) -> SvcResult<()> {
    let activity = ThreadActivity::from_raw(regs.w(1)).ok_or(SvcError::InvalidEnumValue)?;

    let mut guard = kernel.lock(core);
    let (p, current) = caller(&guard, core)?;
    let t = thread_from_handle(&guard, core, regs.w(0))?;
    if t == current {
        return Err(SvcError::Busy);
    }
    if guard.objects.thread(t).owner() != p {
        return Err(SvcError::InvalidHandle);
    }
    guard.set_thread_activity(t, activity)
}

/// Handle GetThreadList.
///
/// # ABI
///
/// - w2: maximum number of ids to return
/// - w3: process handle, or 0 for every thread in the system
///
/// # Returns
///
/// w1: number of ids written to the caller's message buffer, each as a
/// pair of words, low half first.
pub fn get_thread_list<I: InterProcessorInterrupt>(kernel: &Kernel<I>, core: usize, regs: &mut SvcRegisters) -> SvcResult<()> {
    let max = regs.w(2);
    if max & 0xF000_0000 != 0 {
        return Err(SvcError::OutOfRange);
    }
    let handle = Handle::from_raw(regs.w(3));

    let mut guard = kernel.lock(core);
    let (p, current) = caller(&guard, core)?;
    let ids: Vec<u64> = if handle.is_invalid() {
        guard.objects.all_thread_ids().collect()
    } else {
        let target = guard
            .objects
            .get_object_from_handle::<Process>(p, Some(current), handle)
            .ok_or(SvcError::InvalidHandle)?;
        guard.objects.thread_ids(target).collect()
    };
    let count = write_id_list(&mut guard, current, ids, max as usize);
    regs.x[1] = count as u64;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::object::ThreadState;
    use crate::sched::ipi::mock::IpiEvent;
    use crate::sched::{SwitchTarget, ThreadSwitch};
    use crate::svc::test_support::*;
    use ember_arch::gic::IpiKind;
    use ember_syscall::SvcId;

    const CURRENT_THREAD: u64 = Handle::CURRENT_THREAD.raw() as u64;

    fn spawn(kernel: &Kernel<crate::sched::ipi::mock::RecordingIpi>, priority: u64, core: u64) -> u64 {
        call_result(kernel, SvcId::CreateThread, &[0, 0x2000, 7, 0x9000, priority, core]).unwrap().x[1]
    }

    #[test]
    fn test_create_and_start_thread() {
        let (kernel, _, _) = booted();
        let handle = spawn(&kernel, 30, 1);
        assert_eq!(call_result(&kernel, SvcId::GetThreadPriority, &[0, handle]).unwrap().x[1], 30);
        let regs = call_result(&kernel, SvcId::GetThreadCoreMask, &[0, 0, handle]).unwrap();
        assert_eq!((regs.x[1], regs.x[2]), (1, 0b10));
        assert!(kernel.ipi.take().is_empty());

        call_result(&kernel, SvcId::StartThread, &[handle]).unwrap();
        assert_eq!(kernel.ipi.take(), [IpiEvent::Barrier, IpiEvent::Send(IpiKind::Scheduler, 0b10)]);
        assert_eq!(
            call_result(&kernel, SvcId::StartThread, &[handle]).unwrap_err(),
            SvcError::InvalidState
        );
    }

    #[test]
    fn test_create_thread_rejects() {
        let (kernel, _, _) = booted();
        let cases = [
            (64, 0, SvcError::InvalidPriority),
            (u64::from(u32::MAX), 0, SvcError::InvalidPriority),
            (30, 4, SvcError::InvalidCoreId),
            (30, u64::from(IDEAL_CORE_DONT_CARE as u32), SvcError::InvalidCoreId),
        ];
        for (priority, core, err) in cases {
            assert_eq!(
                call_result(&kernel, SvcId::CreateThread, &[0, 0, 0, 0, priority, core]).unwrap_err(),
                err
            );
        }
        // The process's ideal core
        let handle = spawn(&kernel, 30, u64::from(IDEAL_CORE_USE_PROCESS_VALUE as u32));
        let regs = call_result(&kernel, SvcId::GetThreadCoreMask, &[0, 0, handle]).unwrap();
        assert_eq!(regs.x[1], 0);
    }

    #[test]
    fn test_set_thread_core_mask() {
        let (kernel, _, _) = booted();
        let handle = spawn(&kernel, 30, 1);
        let set = |core: i32, mask: u64| {
            call_result(&kernel, SvcId::SetThreadCoreMask, &[handle, u64::from(core as u32), mask]).map(|_| ())
        };

        assert_eq!(set(4, 0b1), Err(SvcError::InvalidCoreId));
        assert_eq!(set(0, 0b1_0000), Err(SvcError::InvalidCoreId));
        assert_eq!(set(IDEAL_CORE_DONT_CARE, 0), Err(SvcError::InvalidCombination));
        assert_eq!(set(2, 0b11), Err(SvcError::InvalidCombination));
        assert_eq!(set(IDEAL_CORE_NO_UPDATE, 0b100), Err(SvcError::InvalidCombination));

        set(2, 0b110).unwrap();
        let regs = call_result(&kernel, SvcId::GetThreadCoreMask, &[0, 0, handle]).unwrap();
        assert_eq!((regs.x[1], regs.x[2]), (2, 0b110));

        set(IDEAL_CORE_USE_PROCESS_VALUE, 0).unwrap();
        let regs = call_result(&kernel, SvcId::GetThreadCoreMask, &[0, 0, handle]).unwrap();
        assert_eq!((regs.x[1], regs.x[2]), (0, 0b1));
    }

    #[test]
    fn test_priority_change() {
        let (kernel, _, main) = booted();
        call_result(&kernel, SvcId::SetThreadPriority, &[CURRENT_THREAD, 20]).unwrap();
        assert_eq!(kernel.lock(0).objects.thread(main).priority, 20);
        assert_eq!(
            call_result(&kernel, SvcId::SetThreadPriority, &[CURRENT_THREAD, 64]).unwrap_err(),
            SvcError::InvalidPriority
        );
        assert_eq!(
            call_result(&kernel, SvcId::GetThreadPriority, &[0, 0x1234]).unwrap_err(),
            SvcError::InvalidHandle
        );
    }

    #[test]
    fn test_thread_activity() {
        let (kernel, _, _) = booted();
        assert_eq!(
            call_result(&kernel, SvcId::SetThreadActivity, &[CURRENT_THREAD, 1]).unwrap_err(),
            SvcError::Busy
        );
        assert_eq!(
            call_result(&kernel, SvcId::SetThreadActivity, &[CURRENT_THREAD, 2]).unwrap_err(),
            SvcError::InvalidEnumValue
        );

        let handle = spawn(&kernel, 30, 0);
        call_result(&kernel, SvcId::StartThread, &[handle]).unwrap();
        call_result(&kernel, SvcId::SetThreadActivity, &[handle, 1]).unwrap();
        // Paused: the higher priority thread does not preempt main
        assert_eq!(kernel.reschedule_current_core(0), None);

        call_result(&kernel, SvcId::SetThreadActivity, &[handle, 0]).unwrap();
        let switch = kernel.reschedule_current_core(0).unwrap();
        assert!(matches!(switch.next, SwitchTarget::Thread(_)));
    }

    #[test]
    fn test_sleep_and_exit() {
        let (kernel, _, main) = booted();
        call_result(&kernel, SvcId::SleepThread, &[5_000]).unwrap();
        assert_eq!(kernel.lock(0).objects.thread(main).state(), ThreadState::Waiting);
        assert_eq!(
            kernel.reschedule_current_core(0),
            Some(ThreadSwitch { prev: Some(main), next: SwitchTarget::Idle })
        );
        kernel.handle_timer_tick(0, 1_000);
        assert_eq!(kernel.current_thread(0), Some(main));

        // A yield with nothing else to run keeps the thread
        call_result(&kernel, SvcId::SleepThread, &[0]).unwrap();
        assert_eq!(kernel.reschedule_current_core(0), None);

        call_result(&kernel, SvcId::ExitThread, &[]).unwrap();
        assert_eq!(kernel.current_thread(0), None);
    }

    #[test]
    fn test_thread_list() {
        let (kernel, p, main) = booted();
        let handle = spawn(&kernel, 30, 0);
        let tid = call_result(&kernel, SvcId::GetThreadId, &[0, handle]).unwrap().x[1];
        let main_tid = kernel.lock(0).objects.thread(main).id();

        let regs = call_result(&kernel, SvcId::GetThreadList, &[0, 0, 8, 0]).unwrap();
        assert_eq!(regs.x[1], 2);
        {
            let mut guard = kernel.lock(0);
            let words = &mut guard.objects.thread_mut(main).tls_mut().message_buffer;
            assert_eq!(&words[..4], &[main_tid as u32, 0, tid as u32, 0]);
        }

        let own = u64::from(Handle::CURRENT_PROCESS.raw());
        assert_eq!(call_result(&kernel, SvcId::GetThreadList, &[0, 0, 1, own]).unwrap().x[1], 1);
        assert_eq!(
            call_result(&kernel, SvcId::GetThreadList, &[0, 0, 8, handle]).unwrap_err(),
            SvcError::InvalidHandle
        );
        assert_eq!(
            call_result(&kernel, SvcId::GetThreadList, &[0, 0, 0x1000_0000, 0]).unwrap_err(),
            SvcError::OutOfRange
        );
        assert_eq!(kernel.lock(0).objects.thread_ids(p).count(), 2);
    }
}
