/*
 * SPDX-License-Identifier: MIT OR BlueOak-1.0.0
 * Copyright (c) 2019 Andre Richter <andre.o.richter@gmail.com>
 * Copyright (c) Berkus Decker <berkus+vesper@metta.systems>
 * Original code distributed under MIT, additional changes are under BlueOak-1.0.0
 */

//! Locks used by the driver.
//!
//! Two flavours exist. [`IRQSafeSpinLock`] masks local interrupts for the duration of the
//! critical section and must only wrap short register or bookkeeping updates; it is what
//! the TLB maintenance path and fault handlers take. [`SleepLock`] guards sequences that
//! may block on clocks or secure monitor calls and must never be taken from interrupt
//! context.

use cfg_if::cfg_if;

//--------------------------------------------------------------------------------------------------
// Public Definitions
//--------------------------------------------------------------------------------------------------

/// Synchronization interfaces.
pub mod interface {

    /// Any object implementing this trait guarantees exclusive access to the data wrapped within
    /// the Mutex for the duration of the provided closure.
    pub trait Mutex {
        /// The type of the data that is wrapped by this mutex.
        type Data;

        /// Locks the mutex and grants the closure temporary mutable access to the wrapped data.
        fn lock<R>(&self, f: impl FnOnce(&mut Self::Data) -> R) -> R;
    }
}

/// Spinning lock that keeps local interrupts masked while held.
pub struct IRQSafeSpinLock<T>
where
    T: ?Sized,
{
    inner: spin::Mutex<T>,
}

/// Lock for sections that may block, such as clock enables and secure calls.
///
/// Backed by a spinning mutex until the scheduler grows wait queues.
pub struct SleepLock<T>
where
    T: ?Sized,
{
    inner: spin::Mutex<T>,
}

//--------------------------------------------------------------------------------------------------
// Public Code
//--------------------------------------------------------------------------------------------------

impl<T> IRQSafeSpinLock<T> {
    /// Create an instance.
    pub const fn new(data: T) -> Self {
        Self {
            inner: spin::Mutex::new(data),
        }
    }
}

impl<T> SleepLock<T> {
    /// Create an instance.
    pub const fn new(data: T) -> Self {
        Self {
            inner: spin::Mutex::new(data),
        }
    }
}

impl<T: Default> Default for IRQSafeSpinLock<T> {
    fn default() -> Self {
        Self::new(T::default())
    }
}

impl<T: Default> Default for SleepLock<T> {
    fn default() -> Self {
        Self::new(T::default())
    }
}

/// Run `f` with local IRQs masked, restoring the previous mask afterwards.
pub fn exec_with_irq_masked<R>(f: impl FnOnce() -> R) -> R {
    let saved = local_irq_save();
    let ret = f();
    local_irq_restore(saved);
    ret
}

//------------------------------------------------------------------------------
// OS Interface Code
//------------------------------------------------------------------------------

impl<T> interface::Mutex for IRQSafeSpinLock<T> {
    type Data = T;

    fn lock<R>(&self, f: impl FnOnce(&mut Self::Data) -> R) -> R {
        exec_with_irq_masked(|| {
            let mut data = self.inner.lock();
            f(&mut data)
        })
    }
}

impl<T> interface::Mutex for SleepLock<T> {
    type Data = T;

    fn lock<R>(&self, f: impl FnOnce(&mut Self::Data) -> R) -> R {
        let mut data = self.inner.lock();
        f(&mut data)
    }
}

//--------------------------------------------------------------------------------------------------
// Private Code
//--------------------------------------------------------------------------------------------------

cfg_if! {
    if #[cfg(all(target_arch = "aarch64", target_os = "none"))] {
        use aarch64_cpu::registers::{Readable, Writeable, ReadWriteable, DAIF};

        #[inline(always)]
        fn local_irq_save() -> u64 {
            let saved = DAIF.get();
            DAIF.modify(DAIF::I::Masked);
            saved
        }

        #[inline(always)]
        fn local_irq_restore(saved: u64) {
            DAIF.set(saved);
        }
    } else {
        // Hosted builds have no interrupt mask to manage.
        #[inline(always)]
        fn local_irq_save() -> u64 {
            0
        }

        #[inline(always)]
        fn local_irq_restore(_saved: u64) {}
    }
}

//--------------------------------------------------------------------------------------------------
// Testing
//--------------------------------------------------------------------------------------------------
