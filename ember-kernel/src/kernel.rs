//! The kernel instance
//!
//! [`Kernel`] owns the scheduler lock and the page-table lock. Everything
//! that touches scheduling or object state goes through
//! [`Kernel::lock`], whose guard publishes the result when it drops:
//!
//! 1. pending highest-priority updates are computed under the lock,
//! 2. address spaces of finalized processes are torn down,
//! 3. the lock is released,
//! 4. other cores whose choice changed get a scheduler IPI.
//!
//! Lock order is scheduler first, then page tables.

use alloc::boxed::Box;
use core::mem::ManuallyDrop;
use core::ops::{Deref, DerefMut};

use ember_arch::sync::{IrqSpinMutex, IrqSpinMutexGuard};
use ember_common::memory::{find_window, WindowKind, PAGE_SIZE};
use ember_common::{PhysAddr, VirtAddr};
use ember_paging::{AddressSpace, HeapTableMemory, PageAttribute, PageTableEntry, Permission, Shareable, TableMemory};
use ember_syscall::{SvcError, SvcResult};
use log::{debug, warn};
use spin::Once;

use crate::config::{ConfigError, KernelConfig};
use crate::logging;
use crate::object::{ProcessParams, ProcessRef, ThreadRef};
use crate::sched::{reschedule_other_cores, GicIpi, InterProcessorInterrupt, ThreadSwitch};
use crate::state::KernelState;
use crate::svc::memory::map_error;

/// Translation-table storage shared by every address space.
pub type SharedTableMemory = Box<dyn TableMemory + Send>;

/// The kernel core: scheduler, objects and page tables.
pub struct Kernel<I: InterProcessorInterrupt = GicIpi> {
    config: KernelConfig,
    pub(crate) ipi: I,
    state: IrqSpinMutex<KernelState>,
    page_tables: IrqSpinMutex<SharedTableMemory>,
}

impl<I: InterProcessorInterrupt> Kernel<I> {
    /// Build a kernel with heap-backed translation tables.
    pub fn new(config: KernelConfig, ipi: I) -> Result<Self, ConfigError> {
        Self::with_table_memory(config, ipi, Box::new(HeapTableMemory::new()))
    }

    pub fn with_table_memory(config: KernelConfig, ipi: I, tables: SharedTableMemory) -> Result<Self, ConfigError> {
        config.validate()?;
        debug!(
            "kernel: {} cores, {} threads, {} processes",
            config.num_active_cores(),
            config.max_threads,
            config.max_processes
        );
        Ok(Self {
            state: IrqSpinMutex::new(KernelState::new(&config)),
            page_tables: IrqSpinMutex::new(tables),
            config,
            ipi,
        })
    }

    #[must_use]
    pub fn config(&self) -> &KernelConfig {
        &self.config
    }

    /// Take the scheduler lock on behalf of `core`.
    pub fn lock(&self, core: usize) -> SchedulerGuard<'_, I> {
        SchedulerGuard {
            kernel: self,
            core,
            pending: 0,
            state: ManuallyDrop::new(self.state.lock()),
        }
    }

    pub(crate) fn page_tables(&self) -> IrqSpinMutexGuard<'_, SharedTableMemory> {
        self.page_tables.lock()
    }

    /// Switch `core` to its highest priority thread if that changed.
    pub fn reschedule_current_core(&self, core: usize) -> Option<ThreadSwitch> {
        let mut guard = self.lock(core);
        guard.flush();
        let state = &mut *guard;
        state.sched.reschedule_current_core(&state.objects, core)
    }

    /// Scheduler IPI handler.
    #[inline]
    pub fn handle_scheduler_ipi(&self, core: usize) -> Option<ThreadSwitch> {
        self.reschedule_current_core(core)
    }

    /// Timer interrupt: advance time to `now`, wake sleepers, and
    /// reschedule this core.
    pub fn handle_timer_tick(&self, core: usize, now: u64) -> Option<ThreadSwitch> {
        let ms = u128::from(now) * 1000 / u128::from(self.config.ticks_per_second);
        logging::set_clock_ms(u64::try_from(ms).unwrap_or(u64::MAX));
        {
            let mut guard = self.lock(core);
            let state = &mut *guard;
            state.sched.handle_timer(&mut state.objects, now);
        }
        self.reschedule_current_core(core)
    }

    #[must_use]
    pub fn current_thread(&self, core: usize) -> Option<ThreadRef> {
        self.lock(core).current_thread(core)
    }

    /// Create a process with a fresh address space.
    ///
    /// The returned reference belongs to the caller.
    pub fn create_process(&self, core: usize, params: &ProcessParams) -> SvcResult<ProcessRef> {
        let mut guard = self.lock(core);
        guard.create_process_with_space(params)
    }

    /// Map `pages` pages of physical memory at `pa` into process `pid` at `va`,
    /// on behalf of `core`.
    ///
    /// The physical range must lie inside one user-mappable memory window.
    pub fn map_process_memory(
        &self,
        core: usize,
        pid: u64,
        va: u64,
        pa: u64,
        pages: usize,
        perm: Permission,
    ) -> SvcResult<()> {
        let size = pages.checked_mul(PAGE_SIZE).ok_or(SvcError::InvalidSize)? as u64;
        if size == 0 {
            return Err(SvcError::InvalidSize);
        }
        let window = find_window(pa, size).ok_or(SvcError::InvalidMemoryRegion)?;
        if !window.user_mappable {
            warn!("map of {pa:#x}+{size:#x} into pid {pid}: window {} is not user mappable", window.name);
            return Err(SvcError::InvalidMemoryRegion);
        }
        if matches!(perm, Permission::KernelR | Permission::KernelRW | Permission::KernelRX | Permission::KernelRWX) {
            return Err(SvcError::InvalidNewMemoryPermission);
        }

        let guard = self.lock(core);
        let p = guard.objects.get_process_from_id(pid).ok_or(SvcError::InvalidProcessId)?;
        let mut space = guard.objects.process(p).address_space().ok_or(SvcError::InvalidState)?;

        let attr = match window.kind {
            WindowKind::Mmio => PageAttribute::DeviceNGnRE,
            WindowKind::Dram | WindowKind::Iram => PageAttribute::Normal,
        };
        let template = PageTableEntry::from_attributes(perm, attr, Shareable::InnerShareable, true, true);

        let mut tables = self.page_tables();
        space
            .map_pages(&mut **tables, VirtAddr::new(va), PhysAddr::new(pa), pages, template)
            .map_err(map_error)
    }
}

impl<I: InterProcessorInterrupt + Default> Kernel<I> {
    /// Kernel with the default configuration, for hosts and tests.
    pub fn with_defaults() -> Result<Self, ConfigError> {
        Self::new(KernelConfig::DEFAULT, I::default())
    }
}

// -- Scheduler lock guard

/// Holds the scheduler lock; publishes scheduling changes on drop.
pub struct SchedulerGuard<'a, I: InterProcessorInterrupt> {
    kernel: &'a Kernel<I>,
    core: usize,
    /// Cores already known to need a reschedule
    pending: u64,
    state: ManuallyDrop<IrqSpinMutexGuard<'a, KernelState>>,
}

impl<I: InterProcessorInterrupt> SchedulerGuard<'_, I> {
    /// Compute pending highest-priority updates now instead of at drop.
    pub fn flush(&mut self) {
        let state = &mut **self.state;
        self.pending |= state.sched.take_cores_needing_scheduling(&mut state.objects);
    }

    pub fn core(&self) -> usize {
        self.core
    }

    /// Create a process and give it an address space.
    pub fn create_process_with_space(&mut self, params: &ProcessParams) -> SvcResult<ProcessRef> {
        let space = {
            let mut tables = self.kernel.page_tables();
            AddressSpace::new(&mut **tables, false).map_err(map_error)?
        };
        match self.create_process(params, Some(space)) {
            Ok(p) => Ok(p),
            Err(e) => {
                space.finalize(&mut **self.kernel.page_tables());
                Err(e)
            }
        }
    }

    /// Run `f` with the page tables locked.
    pub fn with_page_tables<R>(&self, f: impl FnOnce(&mut dyn TableMemory) -> R) -> R {
        let mut tables = self.kernel.page_tables();
        f(&mut **tables)
    }
}

impl<I: InterProcessorInterrupt> Deref for SchedulerGuard<'_, I> {
    type Target = KernelState;

    fn deref(&self) -> &KernelState {
        &self.state
    }
}

impl<I: InterProcessorInterrupt> DerefMut for SchedulerGuard<'_, I> {
    fn deref_mut(&mut self) -> &mut KernelState {
        &mut self.state
    }
}

impl<I: InterProcessorInterrupt> Drop for SchedulerGuard<'_, I> {
    fn drop(&mut self) {
        self.flush();

        let dead = core::mem::take(&mut self.state.objects.dead_address_spaces);
        if !dead.is_empty() {
            let mut tables = self.kernel.page_tables();
            for space in dead {
                space.finalize(&mut **tables);
            }
        }

        // SAFETY: `state` is not used after this point.
        unsafe { ManuallyDrop::drop(&mut self.state) };

        reschedule_other_cores(&self.kernel.ipi, self.core, self.pending);
    }
}

// -- Global instance

static KERNEL: Once<Kernel<GicIpi>> = Once::new();

/// Build the global kernel and install the logger.
///
/// Only the first successful call has any effect.
pub fn init(config: KernelConfig) -> Result<&'static Kernel<GicIpi>, ConfigError> {
    let kernel = KERNEL.try_call_once(|| Kernel::new(config, GicIpi))?;
    logging::init(config.log_level);
    Ok(kernel)
}

/// The global kernel, once [`init`] has run.
#[must_use]
pub fn kernel() -> Option<&'static Kernel<GicIpi>> {
    KERNEL.get()
}
