//! CPU Control and Information
//!
//! Low-level CPU operations. Bare-metal builds issue the real instructions;
//! host builds get equivalents that keep the memory-ordering guarantees.

#[cfg(all(target_arch = "aarch64", target_os = "none"))]
mod imp {
    use aarch64_cpu::registers::*;
    use core::arch::asm;

    #[inline]
    pub fn cpu_id() -> usize {
        (MPIDR_EL1.get() & 0xFF) as usize
    }

    #[inline]
    pub fn wait_for_interrupt() {
        // SAFETY: WFI is always safe to call
        unsafe {
            asm!("wfi", options(nomem, nostack));
        }
    }

    #[inline]
    pub fn dsb_sy() {
        // SAFETY: Memory barrier is always safe
        unsafe {
            asm!("dsb sy", options(nostack));
        }
    }

    #[inline]
    pub fn dsb_ish() {
        // SAFETY: Memory barrier is always safe
        unsafe {
            asm!("dsb ish", options(nostack));
        }
    }

    #[inline]
    pub fn dmb_sy() {
        // SAFETY: Memory barrier is always safe
        unsafe {
            asm!("dmb sy", options(nostack));
        }
    }

    #[inline]
    pub fn isb() {
        // SAFETY: ISB is always safe
        unsafe {
            asm!("isb", options(nostack));
        }
    }

    #[inline]
    pub fn invalidate_tlb_all() {
        // SAFETY: TLB invalidation is safe
        unsafe {
            asm!(
                "dsb ishst",
                "tlbi vmalle1is",
                "dsb ish",
                "isb",
                options(nostack)
            );
        }
    }

    #[inline]
    pub fn invalidate_tlb_page(va: u64) {
        // SAFETY: TLB invalidation is safe
        unsafe {
            asm!(
                "dsb ishst",
                "tlbi vaae1is, {0}",
                "dsb ish",
                "isb",
                in(reg) va >> 12,
                options(nostack, preserves_flags)
            );
        }
    }

    #[inline]
    pub fn disable_interrupts() -> u64 {
        let daif = DAIF.get();
        // SAFETY: Masking DAIF is safe in kernel mode
        unsafe {
            asm!("msr daifset, #0xf", options(nomem, nostack));
        }
        daif
    }

    #[inline]
    pub fn restore_interrupts(daif: u64) {
        DAIF.set(daif);
    }

    #[inline]
    pub fn interrupts_enabled() -> bool {
        (DAIF.get() & 0xC0) == 0
    }
}

#[cfg(not(all(target_arch = "aarch64", target_os = "none")))]
mod imp {
    use core::sync::atomic::{fence, AtomicU64, Ordering};

    /// Host stand-in for DAIF; bit 7 (I) set means masked.
    static HOST_DAIF: AtomicU64 = AtomicU64::new(0);

    #[inline]
    pub fn cpu_id() -> usize {
        0
    }

    #[inline]
    pub fn wait_for_interrupt() {
        core::hint::spin_loop();
    }

    #[inline]
    pub fn dsb_sy() {
        fence(Ordering::SeqCst);
    }

    #[inline]
    pub fn dsb_ish() {
        fence(Ordering::SeqCst);
    }

    #[inline]
    pub fn dmb_sy() {
        fence(Ordering::SeqCst);
    }

    #[inline]
    pub fn isb() {
        fence(Ordering::SeqCst);
    }

    #[inline]
    pub fn invalidate_tlb_all() {
        fence(Ordering::SeqCst);
    }

    #[inline]
    pub fn invalidate_tlb_page(_va: u64) {
        fence(Ordering::SeqCst);
    }

    #[inline]
    pub fn disable_interrupts() -> u64 {
        HOST_DAIF.swap(0x3C0, Ordering::AcqRel)
    }

    #[inline]
    pub fn restore_interrupts(daif: u64) {
        HOST_DAIF.store(daif, Ordering::Release);
    }

    #[inline]
    pub fn interrupts_enabled() -> bool {
        HOST_DAIF.load(Ordering::Acquire) & 0xC0 == 0
    }
}

/// Get the current CPU ID (MPIDR_EL1 Aff0 field)
#[must_use]
#[inline]
pub fn cpu_id() -> usize {
    imp::cpu_id()
}

/// Halt the CPU (spin loop)
#[inline]
pub fn halt() -> ! {
    loop {
        wait_for_interrupt();
    }
}

/// Wait for interrupt (WFI instruction)
#[inline]
pub fn wait_for_interrupt() {
    imp::wait_for_interrupt();
}

/// Data synchronization barrier, full system
#[inline]
pub fn dsb_sy() {
    imp::dsb_sy();
}

/// Data synchronization barrier, inner shareable
#[inline]
pub fn dsb_ish() {
    imp::dsb_ish();
}

/// Data memory barrier
#[inline]
pub fn dmb_sy() {
    imp::dmb_sy();
}

/// Instruction synchronization barrier
#[inline]
pub fn isb() {
    imp::isb();
}

/// Invalidate every EL1 TLB entry on all cores
#[inline]
pub fn invalidate_tlb_all() {
    imp::invalidate_tlb_all();
}

/// Invalidate the TLB entries for one virtual page, all ASIDs, all cores
#[inline]
pub fn invalidate_tlb_page(va: u64) {
    imp::invalidate_tlb_page(va);
}

/// Disable all interrupts and return previous state
#[must_use]
#[inline]
pub fn disable_interrupts() -> u64 {
    imp::disable_interrupts()
}

/// Restore interrupt state
#[inline]
pub fn restore_interrupts(daif: u64) {
    imp::restore_interrupts(daif);
}

/// Check if interrupts are enabled
#[must_use]
pub fn interrupts_enabled() -> bool {
    imp::interrupts_enabled()
}

