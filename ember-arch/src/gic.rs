//! GIC Software-Generated Interrupts
//!
//! Inter-processor interrupts are GICv2 SGIs raised by writing `GICD_SGIR`
//! in the distributor. Only the target-list form is used: the sender names
//! the destination cores explicitly, and never interrupts itself through this
//! path.

use core::sync::atomic::{AtomicUsize, Ordering};

use tock_registers::interfaces::Writeable;
use tock_registers::register_bitfields;
use tock_registers::registers::WriteOnly;

register_bitfields![u32,
    pub GICD_SGIR [
        /// SGI interrupt id (0-15)
        SGIINTID OFFSET(0) NUMBITS(4) [],
        /// Secure-group selection for the forwarded SGI
        NSATT OFFSET(15) NUMBITS(1) [],
        /// Destination cores, one bit per CPU interface
        CPU_TARGET_LIST OFFSET(16) NUMBITS(8) [],
        /// How the target list is interpreted
        TARGET_LIST_FILTER OFFSET(24) NUMBITS(2) [
            TargetList = 0,
            AllOthers = 1,
            SelfOnly = 2
        ]
    ]
];

/// Offset of GICD_SGIR from the distributor base
pub const GICD_SGIR_OFFSET: usize = 0xF00;

/// SGI numbers used by the kernel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum IpiKind {
    /// Wake a core out of power-down
    WakeUpCore = 0,
    /// Tear down a thread running on another core
    ThreadTerminate = 4,
    /// Perform a cache maintenance request
    CacheOperation = 5,
    /// Re-run scheduling on the target cores
    Scheduler = 6,
    /// Rendezvous for all cores
    CoreBarrier = 7,
}

impl IpiKind {
    #[inline]
    #[must_use]
    pub const fn sgi(self) -> u32 {
        self as u32
    }

    #[must_use]
    pub const fn name(self) -> &'static str {
        match self {
            Self::WakeUpCore => "WakeUpCore",
            Self::ThreadTerminate => "ThreadTerminate",
            Self::CacheOperation => "CacheOperation",
            Self::Scheduler => "Scheduler",
            Self::CoreBarrier => "CoreBarrier",
        }
    }
}

/// Virtual address of the mapped distributor; 0 until [`init`] runs.
static GICD_BASE: AtomicUsize = AtomicUsize::new(0);

/// Record the distributor's virtual base address.
///
/// # Safety
///
/// `base` must be the virtual address of a live GICv2 distributor mapping
/// that stays mapped for the lifetime of the kernel.
pub unsafe fn init(base: usize) {
    GICD_BASE.store(base, Ordering::Release);
}

/// Compute the `GICD_SGIR` value raising `sgi` on the cores in `target_mask`.
#[must_use]
pub const fn sgir_value(sgi: u32, target_mask: u64) -> u32 {
    ((target_mask as u32 & 0xFF) << 16) | (sgi & 0xF)
}

/// Raise `kind` on every core in `target_mask`.
///
/// Does nothing before [`init`] or for an empty mask.
pub fn send_sgi(kind: IpiKind, target_mask: u64) {
    let base = GICD_BASE.load(Ordering::Acquire);
    if base == 0 || target_mask & 0xFF == 0 {
        return;
    }

    // SAFETY: `init` guarantees `base` maps a GICv2 distributor, and SGIR is
    // a 32-bit write-only register at a fixed offset inside it.
    let sgir = unsafe { &*((base + GICD_SGIR_OFFSET) as *const WriteOnly<u32, GICD_SGIR::Register>) };
    sgir.write(
        GICD_SGIR::TARGET_LIST_FILTER::TargetList
            + GICD_SGIR::CPU_TARGET_LIST.val((target_mask & 0xFF) as u32)
            + GICD_SGIR::SGIINTID.val(kind.sgi()),
    );
}
