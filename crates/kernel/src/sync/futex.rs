//! Futexes
//!
//! User-mode blocking keyed by the physical address of a 4-byte-aligned
//! user int32, so processes sharing a page share the futex regardless of
//! where they map it. A futex object is created on first touch and
//! refcounted per owning process; it dies when the last process that
//! touched it exits.
//!
//! The decisive property: `wait` checks `*addr == expected` under the
//! futex's queue lock, so a concurrent `wake` after the value changed
//! cannot be missed, and a stale value returns TryAgain without sleeping.

use crate::mm::page::PhysAddr;
use crate::sched::thread::Thread;
use crate::sched::waitq::{SleepCheck, SleepFlags, WaitQueue};
use crate::status::{Result, Status};
use crate::sync::spinlock::SpinLock;
use alloc::collections::BTreeMap;
use alloc::sync::Arc;
use core::sync::atomic::{AtomicU32, Ordering};

pub struct Futex {
    key: PhysAddr,
    /// One reference per process that has touched this futex.
    refs: AtomicU32,
    queue: WaitQueue,
}

impl Futex {
    fn new(key: PhysAddr) -> Self {
        Self {
            key,
            refs: AtomicU32::new(0),
            queue: WaitQueue::new("futex"),
        }
    }

    pub fn key(&self) -> PhysAddr {
        self.key
    }

    /// Number of threads parked on this futex.
    pub fn waiter_count(&self) -> usize {
        self.queue.waiter_count()
    }

    fn load_value(&self) -> i32 {
        // The page is pinned by the caller for the duration of the
        // operation; the word is 4-aligned by construction.
        unsafe { core::ptr::read_volatile(crate::mm::phys_to_virt(self.key) as *const i32) }
    }
}

/// Global table of live futexes; no two share a key.
pub struct FutexTable {
    table: SpinLock<BTreeMap<u64, Arc<Futex>>>,
}

impl FutexTable {
    pub const fn new() -> Self {
        Self {
            table: SpinLock::new(BTreeMap::new()),
        }
    }

    /// Look up or create the futex for `key`, taking one reference.
    /// The caller (a process's futex map) owns that reference.
    pub fn get(&self, key: PhysAddr) -> Arc<Futex> {
        let mut table = self.table.lock();
        let futex = table
            .entry(key)
            .or_insert_with(|| Arc::new(Futex::new(key)));
        futex.refs.fetch_add(1, Ordering::AcqRel);
        futex.clone()
    }

    /// Drop one reference; the futex is removed at zero.
    pub fn put(&self, futex: &Arc<Futex>) {
        let mut table = self.table.lock();
        if futex.refs.fetch_sub(1, Ordering::AcqRel) == 1 {
            table.remove(&futex.key);
        }
    }

    pub fn len(&self) -> usize {
        self.table.lock().len()
    }
}

static FUTEXES: FutexTable = FutexTable::new();

pub fn table() -> &'static FutexTable {
    &FUTEXES
}

/// Key validity: user futex words must be 4-byte aligned.
pub fn validate_addr(addr: u64) -> Result<()> {
    if addr % 4 != 0 {
        return Err(Status::InvalidArg);
    }
    Ok(())
}

/// Sleep on `futex` until woken, unless the word no longer holds
/// `expected` (TryAgain), the timeout expires (TimedOut) or the sleep is
/// interrupted (Interrupted).
pub fn wait(
    futex: &Arc<Futex>,
    thread: &Arc<Thread>,
    expected: i32,
    timeout_ns: Option<u64>,
) -> Result<()> {
    futex.queue.sleep_with(
        thread,
        SleepFlags::INTERRUPTIBLE,
        timeout_ns,
        || {
            if futex.load_value() != expected {
                SleepCheck::Abort(Err(Status::TryAgain))
            } else {
                SleepCheck::Sleep
            }
        },
        || {},
    )
}

/// Wake up to `count` waiters. Returns how many were woken.
pub fn wake(futex: &Arc<Futex>, count: usize) -> usize {
    let mut woken = 0;
    while woken < count && futex.queue.wake_one() {
        woken += 1;
    }
    woken
}

/// Wake up to `wake_n` waiters of `src`, then migrate the remaining
/// waiters to `dst`. Fails with TryAgain when `*src != expected`. Returns
/// (woken, moved).
pub fn requeue(
    src: &Arc<Futex>,
    expected: i32,
    wake_n: usize,
    dst: &Arc<Futex>,
) -> Result<(usize, usize)> {
    src.queue
        .requeue(&dst.queue, wake_n, || src.load_value() == expected)
        .ok_or(Status::TryAgain)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sched::thread::adopt;

    /// A 4-byte futex word in simulated physical memory.
    fn futex_word(value: i32) -> PhysAddr {
        let (pa, _) = crate::mm::phys::sim_ram(crate::mm::PAGE_SIZE);
        unsafe {
            core::ptr::write_volatile(crate::mm::phys_to_virt(pa) as *mut i32, value);
        }
        pa
    }

    fn set_word(pa: PhysAddr, value: i32) {
        unsafe {
            core::ptr::write_volatile(crate::mm::phys_to_virt(pa) as *mut i32, value);
        }
    }

    #[test]
    fn table_dedupes_by_key() {
        let table = FutexTable::new();
        let a = table.get(0x4000);
        let b = table.get(0x4000);
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(table.len(), 1);
        table.put(&a);
        assert_eq!(table.len(), 1);
        table.put(&b);
        assert_eq!(table.len(), 0);
    }

    #[test]
    fn mismatched_value_returns_try_again() {
        let table = FutexTable::new();
        let pa = futex_word(7);
        let futex = table.get(pa);
        let t = adopt("futex-mismatch");
        assert_eq!(wait(&futex, &t, 8, None), Err(Status::TryAgain));
        table.put(&futex);
    }

    #[test]
    fn wait_parks_until_wake() {
        let table = FutexTable::new();
        let pa = futex_word(0);
        let futex = table.get(pa);
        let t = adopt("futex-waiter");
        let f2 = futex.clone();
        let handle =
            std::thread::spawn(move || wait(&f2, &t, 0, Some(5_000_000_000)));
        while futex.queue.is_empty() {
            std::thread::yield_now();
        }
        set_word(pa, 1);
        assert_eq!(wake(&futex, 1), 1);
        assert_eq!(handle.join().unwrap(), Ok(()));
        table.put(&futex);
    }

    #[test]
    fn wait_times_out() {
        let table = FutexTable::new();
        let pa = futex_word(3);
        let futex = table.get(pa);
        let t = adopt("futex-timeout");
        let start = crate::time::monotonic_ns();
        assert_eq!(wait(&futex, &t, 3, Some(30_000_000)), Err(Status::TimedOut));
        assert!(crate::time::monotonic_ns() - start >= 30_000_000);
        table.put(&futex);
    }

    #[test]
    fn requeue_migrates_remainder() {
        let table = FutexTable::new();
        let pa_src = futex_word(0);
        let pa_dst = futex_word(0);
        let src = table.get(pa_src);
        let dst = table.get(pa_dst);

        let mut handles = alloc::vec::Vec::new();
        for _ in 0..3 {
            let f = src.clone();
            let t = adopt("futex-requeue");
            handles.push(std::thread::spawn(move || {
                wait(&f, &t, 0, Some(5_000_000_000))
            }));
        }
        while src.queue.waiter_count() != 3 {
            std::thread::yield_now();
        }

        // Value mismatch leaves everything in place.
        assert_eq!(requeue(&src, 9, 1, &dst), Err(Status::TryAgain));

        let (woken, moved) = requeue(&src, 0, 1, &dst).unwrap();
        assert_eq!((woken, moved), (1, 2));
        assert_eq!(dst.queue.waiter_count(), 2);

        // Wake the migrated waiters on the destination.
        assert_eq!(wake(&dst, 8), 2);
        for h in handles {
            assert_eq!(h.join().unwrap(), Ok(()));
        }
        table.put(&src);
        table.put(&dst);
    }

    #[test]
    fn alignment_is_validated() {
        assert_eq!(validate_addr(0x1002), Err(Status::InvalidArg));
        assert!(validate_addr(0x1004).is_ok());
    }
}
