//! Process and handle SVC handlers

use ember_syscall::types::{is_valid_priority, ProcessInfoType, IDEAL_CORE_USE_PROCESS_VALUE};
use ember_syscall::{Handle, SvcError, SvcResult};
use log::info;

use super::{caller, valid_core, write_id_list, SvcRegisters};
use crate::kernel::Kernel;
use crate::object::process::PROCESS_NAME_LEN;
use crate::object::{Process, ProcessParams, ProcessRef, Thread};
use crate::sched::InterProcessorInterrupt;
use crate::state::KernelState;

fn process_from_handle(state: &KernelState, core: usize, raw: u32) -> SvcResult<ProcessRef> {
    let (p, current) = caller(state, core)?;
    state
        .objects
        .get_object_from_handle::<Process>(p, Some(current), Handle::from_raw(raw))
        .ok_or(SvcError::InvalidHandle)
}

/// Handle CloseHandle.
///
/// # ABI
///
/// - w0: handle; pseudo-handles cannot be closed
pub fn close_handle<I: InterProcessorInterrupt>(kernel: &Kernel<I>, core: usize, regs: &SvcRegisters) -> SvcResult<()> {
    let mut guard = kernel.lock(core);
    let (p, _) = caller(&guard, core)?;
    guard.objects.close_handle(p, Handle::from_raw(regs.w(0)))
}

/// Handle GetProcessId.
///
/// # ABI
///
/// - w1: process handle, or a thread handle for its owner
///
/// # Returns
///
/// x1: process id
pub fn get_process_id<I: InterProcessorInterrupt>(kernel: &Kernel<I>, core: usize, regs: &mut SvcRegisters) -> SvcResult<()> {
    let guard = kernel.lock(core);
    let (p, current) = caller(&guard, core)?;
    let handle = Handle::from_raw(regs.w(1));
    let objects = &guard.objects;
    let target = objects
        .get_object_from_handle::<Process>(p, Some(current), handle)
        .or_else(|| {
            objects
                .get_object_from_handle::<Thread>(p, Some(current), handle)
                .map(|t| objects.thread(t).owner())
        })
        .ok_or(SvcError::InvalidHandle)?;
    regs.x[1] = objects.process(target).id();
    Ok(())
}

/// Handle DebugActiveProcess.
///
/// Debug-suspends every thread of the target.
///
/// # ABI
///
/// - x1: process id
///
/// # Returns
///
/// w1: handle to the target process
pub fn debug_active_process<I: InterProcessorInterrupt>(
    kernel: &Kernel<I>,
    core: usize,
    regs: &mut SvcRegisters,
) -> SvcResult<()> {
    let pid = regs.x[1];

    let mut guard = kernel.lock(core);
    let (p, _) = caller(&guard, core)?;
    let target = guard.objects.get_process_from_id(pid).ok_or(SvcError::InvalidProcessId)?;
    if target == p {
        return Err(SvcError::InvalidState);
    }
    let handle = guard.objects.add(p, target)?;
    if let Err(e) = guard.debug_attach(target) {
        guard.objects.close_handle(p, handle)?;
        return Err(e);
    }
    regs.x[1] = u64::from(handle.raw());
    Ok(())
}

/// Handle GetProcessList.
///
/// # ABI
///
/// - w2: maximum number of ids to return
///
/// # Returns
///
/// w1: number of ids written to the caller's message buffer, each as a
/// pair of words, low half first.
pub fn get_process_list<I: InterProcessorInterrupt>(
    kernel: &Kernel<I>,
    core: usize,
    regs: &mut SvcRegisters,
) -> SvcResult<()> {
    let max = regs.w(2);
    if max & 0xF000_0000 != 0 {
        return Err(SvcError::OutOfRange);
    }

    let mut guard = kernel.lock(core);
    let (_, current) = caller(&guard, core)?;
    let ids = guard.process_ids();
    let count = write_id_list(&mut guard, current, ids, max as usize);
    regs.x[1] = count as u64;
    Ok(())
}

/// Handle CreateProcess.
///
/// # ABI
///
/// - w1: ideal core
/// - x2: core mask
/// - x3: priority mask
/// - w4: handle table size, 0 for the default
/// - x5: up to eight bytes of name, little endian
///
/// # Returns
///
/// w1: handle to the new process, in the `Created` state
pub fn create_process<I: InterProcessorInterrupt>(kernel: &Kernel<I>, core: usize, regs: &mut SvcRegisters) -> SvcResult<()> {
    let mut name = [0; PROCESS_NAME_LEN];
    name[..8].copy_from_slice(&regs.x[5].to_le_bytes());
    let params = ProcessParams {
        name,
        ideal_core: regs.w_signed(1),
        core_mask: regs.x[2],
        priority_mask: regs.x[3],
        handle_table_size: regs.w(4) as usize,
    };

    let mut guard = kernel.lock(core);
    let (p, _) = caller(&guard, core)?;
    let child = guard.create_process_with_space(&params)?;
    let handle = guard.objects.add(p, child);
    guard.objects.close(child.into());
    regs.x[1] = u64::from(handle?.raw());
    Ok(())
}

/// Handle StartProcess.
///
/// # ABI
///
/// - w0: process handle
/// - w1: main thread priority
/// - w2: main thread core, or -2 for the process's ideal core
/// - x3: entry point
/// - x4: stack top
pub fn start_process<I: InterProcessorInterrupt>(kernel: &Kernel<I>, core: usize, regs: &SvcRegisters) -> SvcResult<()> {
    let priority = regs.w_signed(1);
    let core_id = regs.w_signed(2);
    if !is_valid_priority(priority) {
        return Err(SvcError::InvalidPriority);
    }
    if core_id != IDEAL_CORE_USE_PROCESS_VALUE && !valid_core(core_id) {
        return Err(SvcError::InvalidCoreId);
    }

    let mut guard = kernel.lock(core);
    let target = process_from_handle(&guard, core, regs.w(0))?;
    guard.start_process(target, priority, core_id, regs.x[3], regs.x[4])?;
    Ok(())
}

/// Handle TerminateProcess.
///
/// # ABI
///
/// - w0: process handle
pub fn terminate_process<I: InterProcessorInterrupt>(kernel: &Kernel<I>, core: usize, regs: &SvcRegisters) -> SvcResult<()> {
    let mut guard = kernel.lock(core);
    let target = process_from_handle(&guard, core, regs.w(0))?;
    info!("core {core}: terminating process {}", guard.objects.process(target).id());
    guard.terminate_process(target)
}

/// Handle GetProcessInfo.
///
/// # ABI
///
/// - w1: process handle
/// - w2: info type; only 0 (process state) exists
///
/// # Returns
///
/// x1: the requested value
pub fn get_process_info<I: InterProcessorInterrupt>(kernel: &Kernel<I>, core: usize, regs: &mut SvcRegisters) -> SvcResult<()> {
    let info = ProcessInfoType::from_raw(regs.w(2)).ok_or(SvcError::InvalidEnumValue)?;

    let guard = kernel.lock(core);
    let target = process_from_handle(&guard, core, regs.w(1))?;
    regs.x[1] = match info {
        ProcessInfoType::ProcessState => guard.objects.process(target).state() as u64,
    };
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sched::ipi::mock::RecordingIpi;
    use crate::svc::test_support::*;
    use ember_syscall::types::ProcessState;
    use ember_syscall::SvcId;

    const CURRENT_PROCESS: u64 = Handle::CURRENT_PROCESS.raw() as u64;
    const CURRENT_THREAD: u64 = Handle::CURRENT_THREAD.raw() as u64;

    fn create_child(kernel: &Kernel<RecordingIpi>) -> u64 {
        let name = u64::from_le_bytes(*b"child\0\0\0");
        call_result(kernel, SvcId::CreateProcess, &[0, 1, 0b0110, u64::MAX, 0, name]).unwrap().x[1]
    }

    fn process_state(kernel: &Kernel<RecordingIpi>, handle: u64) -> u64 {
        call_result(kernel, SvcId::GetProcessInfo, &[0, handle, 0]).unwrap().x[1]
    }

    #[test]
    fn test_process_lifecycle() {
        let (kernel, _, _) = booted();
        let child = create_child(&kernel);
        assert_eq!(process_state(&kernel, child), ProcessState::Created as u64);
        let pid = call_result(&kernel, SvcId::GetProcessId, &[0, child]).unwrap().x[1];
        {
            let guard = kernel.lock(0);
            let p = guard.objects.get_process_from_id(pid).unwrap();
            assert_eq!(guard.objects.process(p).name(), "child");
        }

        let neg2 = u64::from(IDEAL_CORE_USE_PROCESS_VALUE as u32);
        call_result(&kernel, SvcId::StartProcess, &[child, 40, neg2, 0x1000, 0x8000]).unwrap();
        assert_eq!(process_state(&kernel, child), ProcessState::Running as u64);
        // Main thread on the ideal core, core 1
        assert_eq!(kernel.handle_scheduler_ipi(1).map(|s| s.prev), Some(None));

        call_result(&kernel, SvcId::TerminateProcess, &[child]).unwrap();
        assert_eq!(process_state(&kernel, child), ProcessState::Terminated as u64);
        call_result(&kernel, SvcId::TerminateProcess, &[child]).unwrap();

        call_result(&kernel, SvcId::CloseHandle, &[child]).unwrap();
        assert_eq!(
            call_result(&kernel, SvcId::CloseHandle, &[child]).unwrap_err(),
            SvcError::InvalidHandle
        );
        assert!(kernel.lock(0).objects.get_process_from_id(pid).is_none());
    }

    #[test]
    fn test_create_process_rejects() {
        let (kernel, _, _) = booted();
        let cases = [
            ([0, 0, 0, u64::MAX, 0, 0], SvcError::InvalidCoreId),
            ([0, 2, 0b1, u64::MAX, 0, 0], SvcError::InvalidCoreId),
            ([0, 0, 0b1_0001, u64::MAX, 0, 0], SvcError::InvalidCoreId),
            ([0, 0, 0b1, 0, 0, 0], SvcError::InvalidPriority),
            ([0, 0, 0b1, u64::MAX, 2000, 0], SvcError::InvalidSize),
        ];
        for (args, err) in cases {
            assert_eq!(call_result(&kernel, SvcId::CreateProcess, &args).unwrap_err(), err, "{args:x?}");
        }
        assert_eq!(kernel.lock(0).objects.process_count(), 1);
    }

    #[test]
    fn test_start_process_rejects() {
        let (kernel, _, _) = booted();
        let child = create_child(&kernel);
        assert_eq!(
            call_result(&kernel, SvcId::StartProcess, &[child, 64, 1, 0, 0]).unwrap_err(),
            SvcError::InvalidPriority
        );
        assert_eq!(
            call_result(&kernel, SvcId::StartProcess, &[child, 40, 0, 0, 0]).unwrap_err(),
            SvcError::InvalidCoreId
        );
        assert_eq!(
            call_result(&kernel, SvcId::StartProcess, &[CURRENT_THREAD, 40, 1, 0, 0]).unwrap_err(),
            SvcError::InvalidHandle
        );
        // Unstarted processes cannot be terminated
        assert_eq!(
            call_result(&kernel, SvcId::TerminateProcess, &[child]).unwrap_err(),
            SvcError::InvalidState
        );
    }

    #[test]
    fn test_debug_attach() {
        let (kernel, _, _) = booted();
        let child = create_child(&kernel);
        let pid = call_result(&kernel, SvcId::GetProcessId, &[0, child]).unwrap().x[1];
        let own = call_result(&kernel, SvcId::GetProcessId, &[0, CURRENT_THREAD]).unwrap().x[1];

        let debug = call_result(&kernel, SvcId::DebugActiveProcess, &[0, pid]).unwrap().x[1];
        assert_ne!(debug, child);
        assert_eq!(process_state(&kernel, debug), ProcessState::CreatedAttached as u64);
        assert_eq!(
            call_result(&kernel, SvcId::DebugActiveProcess, &[0, pid]).unwrap_err(),
            SvcError::Busy
        );
        assert_eq!(
            call_result(&kernel, SvcId::DebugActiveProcess, &[0, own]).unwrap_err(),
            SvcError::InvalidState
        );
        assert_eq!(
            call_result(&kernel, SvcId::DebugActiveProcess, &[0, 999]).unwrap_err(),
            SvcError::InvalidProcessId
        );

        // The attached main thread starts suspended
        call_result(&kernel, SvcId::StartProcess, &[child, 40, 1, 0x1000, 0x8000]).unwrap();
        assert_eq!(process_state(&kernel, child), ProcessState::RunningAttached as u64);
        assert_eq!(kernel.handle_scheduler_ipi(1), None);
    }

    #[test]
    fn test_process_list_and_info() {
        let (kernel, _, _) = booted();
        create_child(&kernel);
        let regs = call_result(&kernel, SvcId::GetProcessList, &[0, 0, 32]).unwrap();
        assert_eq!(regs.x[1], 2);
        assert_eq!(
            call_result(&kernel, SvcId::GetProcessList, &[0, 0, 0xF000_0000]).unwrap_err(),
            SvcError::OutOfRange
        );

        assert_eq!(process_state(&kernel, CURRENT_PROCESS), ProcessState::Running as u64);
        assert_eq!(
            call_result(&kernel, SvcId::GetProcessInfo, &[0, CURRENT_PROCESS, 1]).unwrap_err(),
            SvcError::InvalidEnumValue
        );
        assert_eq!(
            call_result(&kernel, SvcId::GetProcessInfo, &[0, CURRENT_THREAD, 0]).unwrap_err(),
            SvcError::InvalidHandle
        );
        assert_eq!(
            call_result(&kernel, SvcId::CloseHandle, &[CURRENT_PROCESS]).unwrap_err(),
            SvcError::InvalidHandle
        );
    }
}
