//! Blocking mutex
//!
//! Recursive-capable sleeping lock. The lock state is an atomic count
//! (0 = unlocked, n = held with recursion depth n) plus the holder's
//! thread id. Contended lockers re-check the count under the internal
//! wait-queue lock, closing the race with a concurrent unlock, then
//! sleep. Unlock with waiters present hands the mutex directly to the
//! first waiter: the count never drops to zero, so a third thread cannot
//! barge in between release and wake, and the waiter runs without
//! re-contending.
//!
//! Misuse is fatal: unlocking an unheld mutex, unlocking from the wrong
//! thread, or recursively locking a non-recursive mutex.

use crate::sched::thread::{Thread, ThreadId};
use crate::sched::waitq::{SleepCheck, SleepFlags, WaitQueue};
use alloc::sync::Arc;
use core::cell::UnsafeCell;
use core::ops::{Deref, DerefMut};
use core::sync::atomic::{AtomicU32, Ordering};

bitflags::bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct MutexFlags: u32 {
        /// The holder may re-acquire; depth is tracked in the count.
        const RECURSIVE = 1 << 0;
    }
}

pub struct Mutex {
    name: &'static str,
    flags: MutexFlags,
    /// 0 = unlocked; n = locked with recursion depth n.
    count: AtomicU32,
    /// Raw thread id of the holder; 0 = none.
    holder: AtomicU32,
    queue: WaitQueue,
}

impl Mutex {
    pub const fn new(name: &'static str) -> Self {
        Self::with_flags(name, MutexFlags::empty())
    }

    pub const fn with_flags(name: &'static str, flags: MutexFlags) -> Self {
        Self {
            name,
            flags,
            count: AtomicU32::new(0),
            holder: AtomicU32::new(0),
            queue: WaitQueue::new("mutex"),
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn is_held(&self) -> bool {
        self.count.load(Ordering::Acquire) > 0
    }

    pub fn holder(&self) -> Option<ThreadId> {
        match self.holder.load(Ordering::Acquire) {
            0 => None,
            id => Some(ThreadId(id)),
        }
    }

    pub fn recursion_depth(&self) -> u32 {
        self.count.load(Ordering::Acquire)
    }

    fn try_acquire(&self, id: u32) -> bool {
        if self
            .count
            .compare_exchange(0, 1, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
        {
            self.holder.store(id, Ordering::Release);
            true
        } else {
            false
        }
    }

    /// Acquire as `thread`, sleeping on contention.
    pub fn lock_as(&self, thread: &Arc<Thread>) {
        let id = thread.id().0;
        if self.try_acquire(id) {
            return;
        }
        if self.holder.load(Ordering::Acquire) == id {
            if !self.flags.contains(MutexFlags::RECURSIVE) {
                crate::fatal!("mutex {}: recursive lock of non-recursive mutex", self.name);
            }
            // Only the holder touches the count while it is non-zero.
            self.count.fetch_add(1, Ordering::AcqRel);
            return;
        }

        loop {
            let result = self.queue.sleep_with(
                thread,
                SleepFlags::empty(),
                None,
                || {
                    // Re-check under the queue lock: a concurrent unlock
                    // that saw an empty queue has fully released by now.
                    if self.try_acquire(id) {
                        SleepCheck::Abort(Ok(()))
                    } else {
                        SleepCheck::Sleep
                    }
                },
                || {},
            );
            match result {
                Ok(()) => {
                    // Either the precheck acquired, or unlock handed the
                    // mutex over with our id already published.
                    if self.holder.load(Ordering::Acquire) == id {
                        return;
                    }
                }
                Err(err) => {
                    crate::fatal!("mutex {}: sleep failed: {:?}", self.name, err);
                }
            }
        }
    }

    /// Try to acquire as `thread` without sleeping.
    pub fn try_lock_as(&self, thread: &Arc<Thread>) -> bool {
        let id = thread.id().0;
        if self.try_acquire(id) {
            return true;
        }
        if self.holder.load(Ordering::Acquire) == id && self.flags.contains(MutexFlags::RECURSIVE)
        {
            self.count.fetch_add(1, Ordering::AcqRel);
            return true;
        }
        false
    }

    /// Release as `thread`.
    pub fn unlock_as(&self, thread: &Arc<Thread>) {
        self.unlock_raw(thread.id().0)
    }

    fn unlock_raw(&self, id: u32) {
        if self.count.load(Ordering::Acquire) == 0 {
            crate::fatal!("mutex {}: unlock of unheld mutex", self.name);
        }
        if self.holder.load(Ordering::Acquire) != id {
            crate::fatal!("mutex {}: unlock from thread that does not hold it", self.name);
        }
        if self.count.load(Ordering::Acquire) > 1 {
            self.count.fetch_sub(1, Ordering::AcqRel);
            return;
        }

        // Depth 1: hand off to the first waiter if there is one. The
        // count stays at 1 across a handoff.
        let handed_off = self
            .queue
            .wake_one_handoff(|next| self.holder.store(next.0, Ordering::Release));
        if handed_off.is_none() {
            self.holder.store(0, Ordering::Release);
            self.count.store(0, Ordering::Release);
        }
    }

    /// Acquire using the calling context's identity. Before threading is
    /// up (and for hosted callers without a registered thread) the boot
    /// context spins; boot-context acquisition is never recursive, as
    /// there is no identity to tell two anonymous callers apart.
    pub fn lock(&self) {
        match crate::sched::current() {
            Some(thread) => self.lock_as(&thread),
            None => {
                let boot = crate::sched::thread::BOOT_CONTEXT.0;
                while !self.try_acquire(boot) {
                    crate::arch::pause();
                }
            }
        }
    }

    pub fn unlock(&self) {
        match crate::sched::current() {
            Some(thread) => self.unlock_as(&thread),
            None => self.unlock_raw(crate::sched::thread::BOOT_CONTEXT.0),
        }
    }

    pub(crate) fn queue(&self) -> &WaitQueue {
        &self.queue
    }
}

/// Data guarded by a [`Mutex`].
pub struct Locked<T> {
    mutex: Mutex,
    data: UnsafeCell<T>,
}

unsafe impl<T: Send> Send for Locked<T> {}
unsafe impl<T: Send> Sync for Locked<T> {}

impl<T> Locked<T> {
    pub const fn new(name: &'static str, data: T) -> Self {
        Self {
            mutex: Mutex::new(name),
            data: UnsafeCell::new(data),
        }
    }

    pub fn lock(&self) -> LockedGuard<'_, T> {
        self.mutex.lock();
        LockedGuard { owner: self }
    }

    pub fn lock_as(&self, thread: &Arc<Thread>) -> LockedGuard<'_, T> {
        self.mutex.lock_as(thread);
        LockedGuard { owner: self }
    }

    pub fn mutex(&self) -> &Mutex {
        &self.mutex
    }
}

pub struct LockedGuard<'a, T> {
    owner: &'a Locked<T>,
}

impl<T> Deref for LockedGuard<'_, T> {
    type Target = T;
    fn deref(&self) -> &T {
        unsafe { &*self.owner.data.get() }
    }
}

impl<T> DerefMut for LockedGuard<'_, T> {
    fn deref_mut(&mut self) -> &mut T {
        unsafe { &mut *self.owner.data.get() }
    }
}

impl<T> Drop for LockedGuard<'_, T> {
    fn drop(&mut self) {
        self.owner.mutex.unlock();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sched::thread::adopt;

    #[test]
    fn uncontended_lock_unlock() {
        let t = adopt("mtx-plain");
        let mutex = Mutex::new("plain");
        mutex.lock_as(&t);
        assert_eq!(mutex.holder(), Some(t.id()));
        assert_eq!(mutex.recursion_depth(), 1);
        mutex.unlock_as(&t);
        assert!(!mutex.is_held());
        assert_eq!(mutex.holder(), None);
    }

    #[test]
    fn recursive_lock_tracks_depth() {
        let t = adopt("mtx-rec");
        let mutex = Mutex::with_flags("rec", MutexFlags::RECURSIVE);
        mutex.lock_as(&t);
        mutex.lock_as(&t);
        mutex.lock_as(&t);
        assert_eq!(mutex.recursion_depth(), 3);
        mutex.unlock_as(&t);
        mutex.unlock_as(&t);
        assert!(mutex.is_held());
        mutex.unlock_as(&t);
        assert!(!mutex.is_held());
    }

    #[test]
    fn try_lock_fails_when_held_by_other() {
        let t1 = adopt("mtx-t1");
        let t2 = adopt("mtx-t2");
        let mutex = Mutex::new("try");
        assert!(mutex.try_lock_as(&t1));
        assert!(!mutex.try_lock_as(&t2));
        mutex.unlock_as(&t1);
        assert!(mutex.try_lock_as(&t2));
        mutex.unlock_as(&t2);
    }

    #[test]
    fn handoff_transfers_ownership_directly() {
        use std::sync::atomic::{AtomicBool, Ordering as StdOrdering};
        static MUTEX: Mutex = Mutex::new("handoff");
        static GOT_IT: AtomicBool = AtomicBool::new(false);
        static RELEASE: AtomicBool = AtomicBool::new(false);

        let t1 = adopt("handoff-holder");
        MUTEX.lock_as(&t1);

        let t2 = adopt("handoff-waiter");
        let t2c = t2.clone();
        let waiter = std::thread::spawn(move || {
            MUTEX.lock_as(&t2c);
            GOT_IT.store(true, StdOrdering::SeqCst);
            while !RELEASE.load(StdOrdering::SeqCst) {
                std::thread::yield_now();
            }
            MUTEX.unlock_as(&t2c);
        });

        while MUTEX.queue().is_empty() {
            std::thread::yield_now();
        }
        MUTEX.unlock_as(&t1);
        // Ownership went straight to t2: the count never dropped to 0
        // and the holder was t2 the moment the wake was issued.
        assert_eq!(MUTEX.holder(), Some(t2.id()));
        RELEASE.store(true, StdOrdering::SeqCst);
        waiter.join().unwrap();
        assert!(GOT_IT.load(StdOrdering::SeqCst));
        assert!(!MUTEX.is_held());
    }

    #[test]
    fn locked_container_round_trip() {
        let cell = Locked::new("cell", 41u32);
        {
            let mut guard = cell.lock();
            *guard += 1;
        }
        assert_eq!(*cell.lock(), 42);
    }
}
