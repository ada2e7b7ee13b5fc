//! Condition variables
//!
//! Always paired with a caller-supplied mutex: `wait` releases it,
//! sleeps, and re-acquires before returning, including on timeout or
//! interruption, so the caller's invariants hold either way.

use super::mutex::Mutex;
use crate::sched::thread::Thread;
use crate::sched::waitq::{SleepCheck, SleepFlags, WaitQueue};
use crate::status::Result;
use alloc::sync::Arc;

pub struct CondVar {
    queue: WaitQueue,
}

impl CondVar {
    pub const fn new(name: &'static str) -> Self {
        Self {
            queue: WaitQueue::new(name),
        }
    }

    /// Release `mutex`, sleep until signalled, re-acquire. The release
    /// happens after this thread is on the queue, so a signal sent by
    /// the next holder of the mutex cannot be missed.
    pub fn wait_as(&self, thread: &Arc<Thread>, mutex: &Mutex) -> Result<()> {
        self.wait_inner(thread, mutex, SleepFlags::empty(), None)
    }

    /// As [`wait_as`] with a timeout and optional interruptibility.
    pub fn wait_timeout_as(
        &self,
        thread: &Arc<Thread>,
        mutex: &Mutex,
        flags: SleepFlags,
        timeout_ns: Option<u64>,
    ) -> Result<()> {
        self.wait_inner(thread, mutex, flags, timeout_ns)
    }

    fn wait_inner(
        &self,
        thread: &Arc<Thread>,
        mutex: &Mutex,
        flags: SleepFlags,
        timeout_ns: Option<u64>,
    ) -> Result<()> {
        let result = self.queue.sleep_with(
            thread,
            flags,
            timeout_ns,
            || SleepCheck::Sleep,
            || mutex.unlock_as(thread),
        );
        mutex.lock_as(thread);
        result
    }

    /// Wake one waiter.
    pub fn signal(&self) -> bool {
        self.queue.wake_one()
    }

    /// Wake all waiters.
    pub fn broadcast(&self) -> usize {
        self.queue.wake_all()
    }
}
