//! Spinlocks
//!
//! Busy-wait lock for short critical sections. `lock()` leaves interrupts
//! alone and is only for sections that never run in interrupt context;
//! `lock_irq()` masks local interrupts for the lifetime of the guard and is
//! required for any state also touched by interrupt handlers. The acquirer's
//! source location is recorded to make deadlocks diagnosable.
//!
//! Critical sections under a spinlock must not sleep: no mutex, no wait
//! queue, no sleeping allocation.

use crate::arch;
use core::cell::UnsafeCell;
use core::ops::{Deref, DerefMut};
use core::panic::Location;
use core::sync::atomic::{AtomicBool, AtomicPtr, Ordering};

pub struct SpinLock<T: ?Sized> {
    locked: AtomicBool,
    /// Source location of the current holder, for debugging.
    owner: AtomicPtr<Location<'static>>,
    data: UnsafeCell<T>,
}

unsafe impl<T: ?Sized + Send> Send for SpinLock<T> {}
unsafe impl<T: ?Sized + Send> Sync for SpinLock<T> {}

impl<T> SpinLock<T> {
    pub const fn new(data: T) -> Self {
        Self {
            locked: AtomicBool::new(false),
            owner: AtomicPtr::new(core::ptr::null_mut()),
            data: UnsafeCell::new(data),
        }
    }
}

impl<T: ?Sized> SpinLock<T> {
    #[track_caller]
    fn acquire(&self) {
        let caller = Location::caller();
        while self
            .locked
            .compare_exchange_weak(false, true, Ordering::Acquire, Ordering::Relaxed)
            .is_err()
        {
            while self.locked.load(Ordering::Relaxed) {
                arch::pause();
            }
        }
        self.owner
            .store(caller as *const _ as *mut _, Ordering::Relaxed);
    }

    fn release(&self) {
        self.owner.store(core::ptr::null_mut(), Ordering::Relaxed);
        self.locked.store(false, Ordering::Release);
    }

    /// Acquire without touching the interrupt flag.
    #[track_caller]
    pub fn lock(&self) -> SpinGuard<'_, T> {
        self.acquire();
        SpinGuard { lock: self }
    }

    /// Acquire with local interrupts masked until the guard drops.
    #[track_caller]
    pub fn lock_irq(&self) -> SpinIrqGuard<'_, T> {
        let irq = arch::irq_save();
        self.acquire();
        SpinIrqGuard { lock: self, irq }
    }

    #[track_caller]
    pub fn try_lock(&self) -> Option<SpinGuard<'_, T>> {
        if self
            .locked
            .compare_exchange(false, true, Ordering::Acquire, Ordering::Relaxed)
            .is_ok()
        {
            self.owner
                .store(Location::caller() as *const _ as *mut _, Ordering::Relaxed);
            Some(SpinGuard { lock: self })
        } else {
            None
        }
    }

    pub fn is_locked(&self) -> bool {
        self.locked.load(Ordering::Relaxed)
    }

    /// Source location of the current holder, if any.
    pub fn holder_location(&self) -> Option<&'static Location<'static>> {
        let ptr = self.owner.load(Ordering::Relaxed);
        if ptr.is_null() {
            None
        } else {
            Some(unsafe { &*ptr })
        }
    }
}

pub struct SpinGuard<'a, T: ?Sized> {
    lock: &'a SpinLock<T>,
}

impl<T: ?Sized> Deref for SpinGuard<'_, T> {
    type Target = T;
    fn deref(&self) -> &T {
        unsafe { &*self.lock.data.get() }
    }
}

impl<T: ?Sized> DerefMut for SpinGuard<'_, T> {
    fn deref_mut(&mut self) -> &mut T {
        unsafe { &mut *self.lock.data.get() }
    }
}

impl<T: ?Sized> Drop for SpinGuard<'_, T> {
    fn drop(&mut self) {
        self.lock.release();
    }
}

pub struct SpinIrqGuard<'a, T: ?Sized> {
    lock: &'a SpinLock<T>,
    irq: arch::IrqState,
}

impl<T: ?Sized> Deref for SpinIrqGuard<'_, T> {
    type Target = T;
    fn deref(&self) -> &T {
        unsafe { &*self.lock.data.get() }
    }
}

impl<T: ?Sized> DerefMut for SpinIrqGuard<'_, T> {
    fn deref_mut(&mut self) -> &mut T {
        unsafe { &mut *self.lock.data.get() }
    }
}

impl<T: ?Sized> Drop for SpinIrqGuard<'_, T> {
    fn drop(&mut self) {
        self.lock.release();
        arch::irq_restore(self.irq);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exclusive_access() {
        let lock = SpinLock::new(0u32);
        {
            let mut g = lock.lock();
            *g += 1;
            assert!(lock.try_lock().is_none());
        }
        assert_eq!(*lock.lock(), 1);
    }

    #[test]
    fn holder_location_recorded() {
        let lock = SpinLock::new(());
        assert!(lock.holder_location().is_none());
        let g = lock.lock();
        assert!(lock.holder_location().is_some());
        drop(g);
        assert!(lock.holder_location().is_none());
    }
}
