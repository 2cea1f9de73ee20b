//! Interrupt-safe synchronization primitives
//!
//! [`IrqSpinMutex`] masks interrupts on the local core for as long as it is
//! held. The kernel's global scheduler lock is one of these: an interrupt
//! handler on the same core that reaches for the lock can never spin against
//! the code it preempted.
//!
//! # Example
//!
//! ```ignore
//! use ember_arch::sync::IrqSpinMutex;
//!
//! static COUNTER: IrqSpinMutex<u64> = IrqSpinMutex::new(0);
//!
//! fn increment() {
//!     let mut guard = COUNTER.lock();
//!     *guard += 1;
//! }   // Interrupts restored here
//! ```

use core::cell::UnsafeCell;
use core::marker::PhantomData;
use core::ops::{Deref, DerefMut};
use core::sync::atomic::{AtomicBool, Ordering};

use crate::cpu::{disable_interrupts, restore_interrupts};

/// A spinlock that disables interrupts while held.
///
/// # Rules
///
/// - Never block or sleep while holding the lock
/// - Keep critical sections short; other cores spin with interrupts masked
/// - Acquire nested `IrqSpinMutex`es in a fixed order
pub struct IrqSpinMutex<T> {
    locked: AtomicBool,
    data: UnsafeCell<T>,
}

// SAFETY: The data is only reachable through a guard, and at most one guard
// exists at a time.
unsafe impl<T: Send> Sync for IrqSpinMutex<T> {}
unsafe impl<T: Send> Send for IrqSpinMutex<T> {}

impl<T> IrqSpinMutex<T> {
    /// Create a new, unlocked mutex.
    #[must_use]
    pub const fn new(value: T) -> Self {
        Self {
            locked: AtomicBool::new(false),
            data: UnsafeCell::new(value),
        }
    }

    /// Mask interrupts, then spin until the lock is ours.
    #[must_use]
    pub fn lock(&self) -> IrqSpinMutexGuard<'_, T> {
        // Interrupts go off first so an ISR cannot preempt us mid-spin and
        // try to take the same lock.
        let daif = disable_interrupts();

        loop {
            if self
                .locked
                .compare_exchange_weak(false, true, Ordering::Acquire, Ordering::Relaxed)
                .is_ok()
            {
                break;
            }
            while self.locked.load(Ordering::Relaxed) {
                core::hint::spin_loop();
            }
        }

        IrqSpinMutexGuard::new(self, daif)
    }

    /// Try to acquire the lock without spinning.
    ///
    /// Interrupt state is left untouched when the lock is busy.
    #[must_use]
    pub fn try_lock(&self) -> Option<IrqSpinMutexGuard<'_, T>> {
        let daif = disable_interrupts();

        match self
            .locked
            .compare_exchange(false, true, Ordering::Acquire, Ordering::Relaxed)
        {
            Ok(_) => Some(IrqSpinMutexGuard::new(self, daif)),
            Err(_) => {
                restore_interrupts(daif);
                None
            }
        }
    }

    /// Racy snapshot of the lock state, for diagnostics only.
    #[must_use]
    pub fn is_locked(&self) -> bool {
        self.locked.load(Ordering::Relaxed)
    }
}

impl<T: Default> Default for IrqSpinMutex<T> {
    fn default() -> Self {
        Self::new(T::default())
    }
}

impl<T: core::fmt::Debug> core::fmt::Debug for IrqSpinMutex<T> {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        let mut d = f.debug_struct("IrqSpinMutex");
        match self.try_lock() {
            Some(guard) => d.field("data", &*guard),
            None => d.field("data", &"<locked>"),
        };
        d.finish()
    }
}

/// Exclusive access to the data of an [`IrqSpinMutex`].
///
/// Dropping the guard releases the lock and then restores the interrupt
/// mask that was in effect when the lock was taken. The guard is `!Send`:
/// restoring DAIF on a different core would corrupt that core's state.
pub struct IrqSpinMutexGuard<'a, T> {
    mutex: &'a IrqSpinMutex<T>,
    daif: u64,
    _not_send: PhantomData<*const ()>,
}

impl<'a, T> IrqSpinMutexGuard<'a, T> {
    fn new(mutex: &'a IrqSpinMutex<T>, daif: u64) -> Self {
        Self {
            mutex,
            daif,
            _not_send: PhantomData,
        }
    }
}

impl<T> Deref for IrqSpinMutexGuard<'_, T> {
    type Target = T;

    fn deref(&self) -> &T {
        // SAFETY: The guard proves the lock is held
        unsafe { &*self.mutex.data.get() }
    }
}

impl<T> DerefMut for IrqSpinMutexGuard<'_, T> {
    fn deref_mut(&mut self) -> &mut T {
        // SAFETY: The guard proves the lock is held, and `&mut self` proves
        // no other borrow of the data is live
        unsafe { &mut *self.mutex.data.get() }
    }
}

impl<T> Drop for IrqSpinMutexGuard<'_, T> {
    fn drop(&mut self) {
        // Release before unmasking so an interrupt taken right after sees the
        // lock free and all protected writes published.
        self.mutex.locked.store(false, Ordering::Release);
        restore_interrupts(self.daif);
    }
}

// SAFETY: Sharing `&Guard` only hands out `&T`.
unsafe impl<T: Sync> Sync for IrqSpinMutexGuard<'_, T> {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lock_and_release() {
        let m = IrqSpinMutex::new(5u32);
        {
            let mut g = m.lock();
            *g += 1;
            assert!(m.is_locked());
            assert!(m.try_lock().is_none());
        }
        assert!(!m.is_locked());
        assert_eq!(*m.lock(), 6);
    }

    #[test]
    fn test_contended_increment() {
        use std::sync::Arc;

        let m = Arc::new(IrqSpinMutex::new(0u64));
        let handles: Vec<_> = (0..4)
            .map(|_| {
                let m = Arc::clone(&m);
                std::thread::spawn(move || {
                    for _ in 0..1000 {
                        *m.lock() += 1;
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }
        assert_eq!(*m.lock(), 4000);
    }
}
