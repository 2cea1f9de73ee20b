//! SVC dispatch
//!
//! User space enters the kernel with `svc #imm`; the exception vector hands
//! the immediate and the saved registers to [`handle_svc`], which decodes
//! the arguments, runs the handler and writes the results back.
//!
//! # ABI
//!
//! Horizon register conventions:
//! - x0-x7: arguments
//! - w0: result code on return (`0` is success)
//! - x1..: output values, only meaningful on success
//!
//! `GetCurrentProcessorNumber` is the exception: it returns the core number
//! in w0 and has no result code.
//!
//! Every handler validates its raw arguments before taking the scheduler
//! lock. List SVCs write ids into the caller's thread-local message buffer.

pub mod memory;
pub mod process_ops;
pub mod thread_ops;

use ember_arch::smp::NUM_CORES;
use ember_syscall::{ResultCode, SvcError, SvcId, SvcResult};
use log::{debug, trace, warn};

use crate::kernel::Kernel;
use crate::object::{ProcessRef, ThreadRef};
use crate::sched::InterProcessorInterrupt;
use crate::state::KernelState;

/// Saved argument and result registers of an SVC.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SvcRegisters {
    pub x: [u64; 8],
}

impl SvcRegisters {
    #[must_use]
    pub fn new(args: &[u64]) -> Self {
        let mut x = [0; 8];
        let n = args.len().min(x.len());
        x[..n].copy_from_slice(&args[..n]);
        Self { x }
    }

    /// Low 32 bits of `x[n]`.
    #[inline]
    #[must_use]
    pub fn w(&self, n: usize) -> u32 {
        self.x[n] as u32
    }

    /// Low 32 bits of `x[n]` as a signed value.
    #[inline]
    #[must_use]
    pub fn w_signed(&self, n: usize) -> i32 {
        self.x[n] as u32 as i32
    }

    /// Result code the SVC left in w0.
    #[must_use]
    pub fn result(&self) -> ResultCode {
        ResultCode::from_raw(self.x[0] as u32)
    }
}

/// Handle SVC `svc_id` issued by the thread running on `core`.
pub fn handle_svc<I: InterProcessorInterrupt>(kernel: &Kernel<I>, core: usize, svc_id: u32, regs: &mut SvcRegisters) {
    let Some(svc) = SvcId::from_number(svc_id) else {
        warn!("core {core}: invalid SVC number {svc_id:#x}");
        regs.x[0] = u64::from(ResultCode::from(SvcError::NotImplemented).raw());
        return;
    };

    trace!(
        "core {core}: SVC {} (x0={:#x}, x1={:#x}, x2={:#x})",
        svc.name(),
        regs.x[0],
        regs.x[1],
        regs.x[2]
    );

    if svc == SvcId::GetCurrentProcessorNumber {
        regs.x[0] = core as u64;
        return;
    }

    let result = dispatch(kernel, core, svc, regs);
    if let Err(e) = result {
        debug!("core {core}: {} failed: {e:?}", svc.name());
    }
    regs.x[0] = u64::from(ResultCode::from(result).raw());
}

fn dispatch<I: InterProcessorInterrupt>(
    kernel: &Kernel<I>,
    core: usize,
    svc: SvcId,
    regs: &mut SvcRegisters,
) -> SvcResult<()> {
    match svc {
        // -- Memory
        SvcId::SetMemoryPermission => memory::set_memory_permission(kernel, core, regs),
        SvcId::MapMemory => memory::map_memory(kernel, core, regs),
        SvcId::UnmapMemory => memory::unmap_memory(kernel, core, regs),
        SvcId::QueryMemory => memory::query_memory(kernel, core, regs),

        // -- Threads
        SvcId::CreateThread => thread_ops::create_thread(kernel, core, regs),
        SvcId::StartThread => thread_ops::start_thread(kernel, core, regs),
        SvcId::ExitThread => thread_ops::exit_thread(kernel, core),
        SvcId::SleepThread => thread_ops::sleep_thread(kernel, core, regs),
        SvcId::GetThreadPriority => thread_ops::get_thread_priority(kernel, core, regs),
        SvcId::SetThreadPriority => thread_ops::set_thread_priority(kernel, core, regs),
        SvcId::GetThreadCoreMask => thread_ops::get_thread_core_mask(kernel, core, regs),
        SvcId::SetThreadCoreMask => thread_ops::set_thread_core_mask(kernel, core, regs),
        SvcId::GetThreadId => thread_ops::get_thread_id(kernel, core, regs),
        SvcId::SetThreadActivity => thread_ops::set_thread_activity(kernel, core, regs),
        SvcId::GetThreadList => thread_ops::get_thread_list(kernel, core, regs),
        // Answered before dispatch
        SvcId::GetCurrentProcessorNumber => Ok(()),

        // -- Handles and processes
        SvcId::CloseHandle => process_ops::close_handle(kernel, core, regs),
        SvcId::GetProcessId => process_ops::get_process_id(kernel, core, regs),
        SvcId::DebugActiveProcess => process_ops::debug_active_process(kernel, core, regs),
        SvcId::GetProcessList => process_ops::get_process_list(kernel, core, regs),
        SvcId::CreateProcess => process_ops::create_process(kernel, core, regs),
        SvcId::StartProcess => process_ops::start_process(kernel, core, regs),
        SvcId::TerminateProcess => process_ops::terminate_process(kernel, core, regs),
        SvcId::GetProcessInfo => process_ops::get_process_info(kernel, core, regs),
    }
}

/// Process and thread issuing an SVC on `core`.
pub(crate) fn caller(state: &KernelState, core: usize) -> SvcResult<(ProcessRef, ThreadRef)> {
    let t = state.current_thread(core).ok_or(SvcError::InvalidState)?;
    Ok((state.objects.thread(t).owner(), t))
}

/// Whether `core` names a physical core.
#[inline]
pub(crate) fn valid_core(core: i32) -> bool {
    usize::try_from(core).is_ok_and(|c| c < NUM_CORES)
}

/// Most ids a list SVC returns: one u64 per word pair of the message buffer.
pub const MAX_LIST_IDS: usize = ember_syscall::MESSAGE_BUFFER_SIZE / 8;

/// Write up to `max` ids into `t`'s message buffer. Returns how many were
/// written.
pub(crate) fn write_id_list(
    state: &mut KernelState,
    t: ThreadRef,
    ids: impl IntoIterator<Item = u64>,
    max: usize,
) -> usize {
    let mut buffer = state.objects.thread_mut(t).tls_mut().message_buffer();
    let mut index = 0;
    let mut count = 0;
    for id in ids.into_iter().take(max.min(MAX_LIST_IDS)) {
        index = buffer.set_process_id(index, id);
        count += 1;
    }
    count
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::*;
    use crate::config::KernelConfig;
    use crate::object::process::PROCESS_NAME_LEN;
    use crate::object::ProcessParams;
    use crate::sched::ipi::mock::RecordingIpi;

    pub fn params() -> ProcessParams {
        let mut name = [0; PROCESS_NAME_LEN];
        name[..4].copy_from_slice(b"init");
        ProcessParams { name, ideal_core: 0, core_mask: 0b1111, priority_mask: u64::MAX, handle_table_size: 0 }
    }

    /// A kernel whose core 0 runs the main thread of a fresh process.
    pub fn booted() -> (Kernel<RecordingIpi>, ProcessRef, ThreadRef) {
        let kernel = Kernel::<RecordingIpi>::new(KernelConfig::DEFAULT, RecordingIpi::default()).unwrap();
        let p = kernel.create_process(0, &params()).unwrap();
        let main = kernel.lock(0).start_process(p, 44, 0, 0x1000, 0x8000).unwrap();
        kernel.reschedule_current_core(0);
        kernel.ipi.take();
        (kernel, p, main)
    }

    /// Issue `svc` on core 0 and return the registers afterwards.
    pub fn call(kernel: &Kernel<RecordingIpi>, svc: SvcId, args: &[u64]) -> SvcRegisters {
        let mut regs = SvcRegisters::new(args);
        handle_svc(kernel, 0, svc.number(), &mut regs);
        regs
    }

    /// Like [`call`], reducing the result to `Ok`/`Err`.
    pub fn call_result(kernel: &Kernel<RecordingIpi>, svc: SvcId, args: &[u64]) -> Result<SvcRegisters, SvcError> {
        let regs = call(kernel, svc, args);
        match regs.result().to_result() {
            Ok(()) => Ok(regs),
            Err(e) => Err(e.unwrap_or(SvcError::NotImplemented)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::test_support::*;
    use super::*;

    #[test]
    fn test_invalid_svc_number() {
        let (kernel, _, _) = booted();
        let mut regs = SvcRegisters::default();
        handle_svc(&kernel, 0, 0x7F, &mut regs);
        assert_eq!(regs.result(), ResultCode::from(SvcError::NotImplemented));
    }

    #[test]
    fn test_current_processor_number() {
        let (kernel, _, _) = booted();
        let mut regs = SvcRegisters::new(&[0xdead]);
        handle_svc(&kernel, 3, SvcId::GetCurrentProcessorNumber.number(), &mut regs);
        assert_eq!(regs.x[0], 3);
    }

    #[test]
    fn test_no_caller_on_idle_core() {
        let (kernel, _, _) = booted();
        let mut regs = SvcRegisters::new(&[0, 0, 0, 0, 44, 0]);
        handle_svc(&kernel, 1, SvcId::CreateThread.number(), &mut regs);
        assert_eq!(regs.result(), ResultCode::from(SvcError::InvalidState));
    }

    #[test]
    fn test_w_registers_truncate() {
        let regs = SvcRegisters::new(&[0xFFFF_FFFF_0000_0001, 0x1_FFFF_FFFE]);
        assert_eq!(regs.w(0), 1);
        assert_eq!(regs.w_signed(1), -2);
    }
}
