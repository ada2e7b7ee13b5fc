//! Counting semaphores
//!
//! Thin layer over a missed-wake-counting wait queue: `up` with no
//! waiter banks the wake, and `down` consumes a banked wake instead of
//! sleeping. The queue's missed count is the semaphore value.

use crate::sched::thread::Thread;
use crate::sched::waitq::{SleepFlags, WaitQueue, WaitQueueFlags};
use crate::status::Result;
use alloc::sync::Arc;

pub struct Semaphore {
    queue: WaitQueue,
}

impl Semaphore {
    pub const fn new(name: &'static str, initial: u32) -> Self {
        Self {
            queue: WaitQueue::with_missed(name, WaitQueueFlags::COUNT_MISSED, initial),
        }
    }

    /// Take one unit, sleeping until one is available.
    pub fn down_as(&self, thread: &Arc<Thread>) -> Result<()> {
        self.queue.sleep(thread, SleepFlags::empty(), None)
    }

    /// As [`down_as`] with timeout / interruptibility.
    pub fn down_timeout_as(
        &self,
        thread: &Arc<Thread>,
        flags: SleepFlags,
        timeout_ns: Option<u64>,
    ) -> Result<()> {
        self.queue.sleep(thread, flags, timeout_ns)
    }

    /// Take one unit without sleeping; WouldBlock when none available.
    pub fn try_down_as(&self, thread: &Arc<Thread>) -> Result<()> {
        self.queue.sleep(thread, SleepFlags::NONBLOCK, None)
    }

    /// Release one unit.
    pub fn up(&self) {
        self.queue.wake_one();
    }

    /// Current value (banked units).
    pub fn count(&self) -> u32 {
        self.queue.missed()
    }
}
