//! Cross-core reschedule requests
//!
//! After the scheduler lock is released, every other core whose highest
//! priority thread changed gets one scheduler SGI. The barrier before the
//! send makes the scheduler state written under the lock visible to the
//! target before it takes the interrupt.

use ember_arch::cpu::dsb_sy;
use ember_arch::gic::{self, IpiKind};
use ember_arch::smp::{core_bit, online_cores};

/// Sends inter-processor interrupts.
pub trait InterProcessorInterrupt {
    /// Full-system data synchronization barrier.
    fn barrier(&self);

    /// Raise `kind` on every core in `mask`.
    fn send(&self, kind: IpiKind, mask: u64);
}

/// IPIs through the GIC distributor. Cores that have not yet called
/// [`ember_arch::smp::mark_core_online`] are left out.
#[derive(Debug, Default, Clone, Copy)]
pub struct GicIpi;

impl InterProcessorInterrupt for GicIpi {
    #[inline]
    fn barrier(&self) {
        dsb_sy();
    }

    #[inline]
    fn send(&self, kind: IpiKind, mask: u64) {
        let mask = mask & online_cores().bits();
        if mask != 0 {
            gic::send_sgi(kind, mask);
        }
    }
}

/// Ask every core in `cores_needing_scheduling` except `current_core` to
/// reschedule.
///
/// Returns the mask the IPI went to (0 if none was sent).
pub fn reschedule_other_cores<I: InterProcessorInterrupt + ?Sized>(
    ipi: &I,
    current_core: usize,
    cores_needing_scheduling: u64,
) -> u64 {
    let targets = cores_needing_scheduling & !core_bit(current_core);
    if targets != 0 {
        ipi.barrier();
        ipi.send(IpiKind::Scheduler, targets);
        log::trace!("core {current_core}: reschedule IPI to {targets:#x}");
    }
    targets
}


#[cfg(test)]
mod tests {
    use super::mock::{IpiEvent, RecordingIpi};
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_self_only_sends_nothing() {
        let ipi = RecordingIpi::default();
        assert_eq!(reschedule_other_cores(&ipi, 2, 0b0100), 0);
        assert!(ipi.take().is_empty());
    }

    #[test]
    fn test_barrier_then_send() {
        let ipi = RecordingIpi::default();
        assert_eq!(reschedule_other_cores(&ipi, 0, 0b1011), 0b1010);
        assert_eq!(
            ipi.take(),
            [IpiEvent::Barrier, IpiEvent::Send(IpiKind::Scheduler, 0b1010)]
        );
    }

    proptest! {
        #[test]
        fn prop_ipi_targets(mask in any::<u64>(), core in 0usize..64) {
            let ipi = RecordingIpi::default();
            let target = reschedule_other_cores(&ipi, core, mask);
            prop_assert_eq!(target, mask & !(1u64 << core));

            let events = ipi.take();
            if target == 0 {
                prop_assert!(events.is_empty());
            } else {
                prop_assert_eq!(events, vec![IpiEvent::Barrier, IpiEvent::Send(IpiKind::Scheduler, target)]);
            }
        }
    }
}
