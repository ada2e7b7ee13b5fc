//! Wait queues
//!
//! A wait queue is a named sleep set. Sleeping atomically releases the
//! caller's lock, links the thread's waiter record onto the queue and
//! suspends; waking pops waiters in FIFO order and makes them runnable.
//!
//! Each thread owns one waiter record reused across sleeps. The record
//! packs an epoch with its state: a new sleep bumps the epoch, so a stale
//! queue entry left behind by a timeout, an interrupt or a requeue can
//! never capture a later sleep. Wake therefore pops in O(1) with no
//! allocation and discards stale entries as it meets them; cancellation
//! is a single atomic transition, with no list walk anywhere.

use super::thread::{Thread, ThreadFlags, ThreadId, ThreadState};
use crate::status::{Result, Status};
use crate::sync::spinlock::SpinLock;
use alloc::collections::VecDeque;
use alloc::sync::Arc;
use core::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaiterState {
    /// Not sleeping.
    Idle = 0,
    /// Linked on a queue, thread suspended or about to be.
    Queued = 1,
    /// Woken normally.
    Woken = 2,
    /// Sleep aborted by interrupt() or a signal.
    Interrupted = 3,
    /// Sleep timeout expired.
    TimedOut = 4,
}

impl WaiterState {
    fn from_u8(v: u8) -> WaiterState {
        match v {
            0 => WaiterState::Idle,
            1 => WaiterState::Queued,
            2 => WaiterState::Woken,
            3 => WaiterState::Interrupted,
            _ => WaiterState::TimedOut,
        }
    }
}

/// Per-thread sleep slot. `word` packs (epoch << 8) | state so that state
/// transitions are valid only against the sleep they belong to.
pub struct Waiter {
    thread: ThreadId,
    word: AtomicU64,
    /// Queue the waiter is linked into, for diagnostics. Address only.
    queue: AtomicUsize,
}

impl Waiter {
    pub fn new(thread: ThreadId) -> Self {
        Self {
            thread,
            word: AtomicU64::new(0),
            queue: AtomicUsize::new(0),
        }
    }

    pub fn thread(&self) -> ThreadId {
        self.thread
    }

    fn pack(epoch: u64, state: WaiterState) -> u64 {
        (epoch << 8) | state as u64
    }

    /// Start a new sleep: bump the epoch, state becomes Queued.
    fn begin_sleep(&self, queue: usize) -> u64 {
        let epoch = (self.word.load(Ordering::Acquire) >> 8) + 1;
        self.word
            .store(Self::pack(epoch, WaiterState::Queued), Ordering::Release);
        self.queue.store(queue, Ordering::Release);
        epoch
    }

    /// Current state of the sleep identified by `epoch`; `None` once a
    /// newer sleep has started.
    fn state_of(&self, epoch: u64) -> Option<WaiterState> {
        let word = self.word.load(Ordering::Acquire);
        (word >> 8 == epoch).then(|| WaiterState::from_u8((word & 0xFF) as u8))
    }

    /// Transition `epoch`'s sleep from Queued to `to`. Exactly one of
    /// wake, timeout and interrupt wins.
    fn try_transition(&self, epoch: u64, to: WaiterState) -> bool {
        self.word
            .compare_exchange(
                Self::pack(epoch, WaiterState::Queued),
                Self::pack(epoch, to),
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_ok()
    }

    fn current_state(&self) -> WaiterState {
        WaiterState::from_u8((self.word.load(Ordering::Acquire) & 0xFF) as u8)
    }
}

bitflags::bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct WaitQueueFlags: u32 {
        /// Count wakes that found no waiter; a later sleep consumes a
        /// missed wake instead of blocking (semaphore semantics).
        const COUNT_MISSED = 1 << 0;
    }
}

bitflags::bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct SleepFlags: u32 {
        /// Sleep may be aborted by interrupt() or a signal.
        const INTERRUPTIBLE = 1 << 0;
        /// Never block: WouldBlock unless a missed wake is available.
        const NONBLOCK = 1 << 1;
    }
}

/// Decision returned by a sleep precheck, evaluated under the queue lock.
pub enum SleepCheck {
    Sleep,
    /// Do not sleep; return this result instead.
    Abort(Result<()>),
}

struct WaitQueueInner {
    waiters: VecDeque<(Arc<Waiter>, u64)>,
    missed: u32,
}

pub struct WaitQueue {
    name: &'static str,
    flags: WaitQueueFlags,
    inner: SpinLock<WaitQueueInner>,
}

impl WaitQueue {
    pub const fn new(name: &'static str) -> Self {
        Self::with_flags(name, WaitQueueFlags::empty())
    }

    pub const fn with_flags(name: &'static str, flags: WaitQueueFlags) -> Self {
        Self::with_missed(name, flags, 0)
    }

    /// Construct with an initial missed-wake balance (semaphores start
    /// with their initial count banked here).
    pub const fn with_missed(name: &'static str, flags: WaitQueueFlags, missed: u32) -> Self {
        Self {
            name,
            flags,
            inner: SpinLock::new(WaitQueueInner {
                waiters: VecDeque::new(),
                missed,
            }),
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    /// Block until woken. See [`sleep_with`] for the full contract.
    pub fn sleep(
        &self,
        thread: &Arc<Thread>,
        flags: SleepFlags,
        timeout_ns: Option<u64>,
    ) -> Result<()> {
        self.sleep_with(thread, flags, timeout_ns, || SleepCheck::Sleep, || {})
    }

    /// The full sleep operation.
    ///
    /// Under the queue lock: runs `precheck` (abort without sleeping if it
    /// says so), consumes a missed wake if the queue counts them, then
    /// links the waiter. After the lock is dropped, `unlock` releases the
    /// caller's own lock; only then does the thread suspend. A waker
    /// scanning the queue after `precheck` ran will find us, so no wake
    /// can be lost in the gap.
    ///
    /// Returns `Ok` on wake, `TimedOut` on expiry of `timeout_ns`,
    /// `Interrupted` when cancelled, `WouldBlock` for a NONBLOCK miss.
    pub fn sleep_with(
        &self,
        thread: &Arc<Thread>,
        flags: SleepFlags,
        timeout_ns: Option<u64>,
        precheck: impl FnOnce() -> SleepCheck,
        unlock: impl FnOnce(),
    ) -> Result<()> {
        let epoch;
        {
            let mut inner = self.inner.lock_irq();

            if let SleepCheck::Abort(result) = precheck() {
                return result;
            }

            if self.flags.contains(WaitQueueFlags::COUNT_MISSED) && inner.missed > 0 {
                inner.missed -= 1;
                return Ok(());
            }

            if flags.contains(SleepFlags::NONBLOCK) {
                return Err(Status::WouldBlock);
            }

            if flags.contains(SleepFlags::INTERRUPTIBLE) {
                thread.set_flag(ThreadFlags::INTERRUPTIBLE);
            }

            epoch = thread.waiter.begin_sleep(self as *const _ as usize);
            let waiter = thread.waiter.clone();
            inner.waiters.push_back((waiter, epoch));
        }

        // An interruptible sleep with a termination already requested
        // must not wait for another interrupt().
        if flags.contains(SleepFlags::INTERRUPTIBLE) && thread.flags().contains(ThreadFlags::KILLED)
        {
            thread.waiter.try_transition(epoch, WaiterState::Interrupted);
        }

        unlock();

        let outcome = super::block(thread, &thread.waiter, epoch, timeout_ns);
        thread.clear_flag(ThreadFlags::INTERRUPTIBLE);

        match outcome {
            WaiterState::Woken => Ok(()),
            WaiterState::TimedOut => Err(Status::TimedOut),
            WaiterState::Interrupted => Err(Status::Interrupted),
            state => crate::fatal!(
                "waitq {}: sleep ended in state {:?}",
                self.name,
                state
            ),
        }
    }

    /// Wake the first waiter. When the queue counts missed wakes and no
    /// waiter is present, the wake is banked for the next sleeper.
    pub fn wake_one(&self) -> bool {
        let woken = {
            let mut inner = self.inner.lock_irq();
            loop {
                match inner.waiters.pop_front() {
                    Some((waiter, epoch)) => {
                        if waiter.try_transition(epoch, WaiterState::Woken) {
                            break Some(waiter.thread());
                        }
                        // Stale entry from a cancelled or requeued sleep.
                    }
                    None => {
                        if self.flags.contains(WaitQueueFlags::COUNT_MISSED) {
                            inner.missed += 1;
                        }
                        break None;
                    }
                }
            }
        };
        match woken {
            Some(thread) => {
                super::unblock_id(thread);
                true
            }
            None => false,
        }
    }

    /// Hand something off to the first waiter: `prepare(thread)` runs
    /// under the queue lock before the waiter can observe its wake, so
    /// whatever it publishes (e.g. mutex ownership) is visible to the
    /// woken thread and to everyone else before any new acquirer can get
    /// in. Returns the woken thread, or None if the queue was empty.
    pub fn wake_one_handoff(&self, mut prepare: impl FnMut(ThreadId)) -> Option<ThreadId> {
        let woken = {
            let mut inner = self.inner.lock_irq();
            loop {
                match inner.waiters.pop_front() {
                    Some((waiter, epoch)) => {
                        prepare(waiter.thread());
                        if waiter.try_transition(epoch, WaiterState::Woken) {
                            break Some(waiter.thread());
                        }
                    }
                    None => break None,
                }
            }
        };
        if let Some(thread) = woken {
            super::unblock_id(thread);
        }
        woken
    }

    /// Wake every waiter. Never banks a missed wake.
    pub fn wake_all(&self) -> usize {
        let mut woken = alloc::vec::Vec::new();
        {
            let mut inner = self.inner.lock_irq();
            while let Some((waiter, epoch)) = inner.waiters.pop_front() {
                if waiter.try_transition(epoch, WaiterState::Woken) {
                    woken.push(waiter.thread());
                }
            }
        }
        let count = woken.len();
        for thread in woken {
            super::unblock_id(thread);
        }
        count
    }

    /// Whether any live waiter is queued.
    pub fn is_empty(&self) -> bool {
        let inner = self.inner.lock_irq();
        !inner
            .waiters
            .iter()
            .any(|(w, e)| w.state_of(*e) == Some(WaiterState::Queued))
    }

    /// Number of live queued waiters.
    pub fn waiter_count(&self) -> usize {
        let inner = self.inner.lock_irq();
        inner
            .waiters
            .iter()
            .filter(|(w, e)| w.state_of(*e) == Some(WaiterState::Queued))
            .count()
    }

    /// Banked missed-wake count.
    pub fn missed(&self) -> u32 {
        self.inner.lock_irq().missed
    }

    /// Wake up to `wake_n` waiters from `self`, then move the remaining
    /// waiters onto `target`. The two queue locks are taken in address
    /// order so concurrent requeues cannot deadlock. `precheck` runs with
    /// both locks held; returning false abandons the operation (None).
    pub fn requeue(
        &self,
        target: &WaitQueue,
        wake_n: usize,
        precheck: impl FnOnce() -> bool,
    ) -> Option<(usize, usize)> {
        let mut woken = alloc::vec::Vec::new();
        let moved;
        {
            let (first, second) = if (self as *const _ as usize) < (target as *const _ as usize) {
                (&self.inner, &target.inner)
            } else {
                (&target.inner, &self.inner)
            };
            let mut first_guard = first.lock_irq();
            let mut second_guard = second.lock_irq();
            let (src, dst) = if core::ptr::eq(first, &self.inner) {
                (&mut *first_guard, &mut *second_guard)
            } else {
                (&mut *second_guard, &mut *first_guard)
            };

            if !precheck() {
                return None;
            }

            while woken.len() < wake_n {
                match src.waiters.pop_front() {
                    Some((waiter, epoch)) => {
                        if waiter.try_transition(epoch, WaiterState::Woken) {
                            woken.push(waiter.thread());
                        }
                    }
                    None => break,
                }
            }

            moved = src.waiters.len();
            let target_addr = target as *const _ as usize;
            for (waiter, _) in src.waiters.iter() {
                waiter.queue.store(target_addr, Ordering::Release);
            }
            let drained: VecDeque<_> = core::mem::take(&mut src.waiters);
            dst.waiters.extend(drained);
        }
        let count = woken.len();
        for thread in woken {
            super::unblock_id(thread);
        }
        Some((count, moved))
    }
}

/// Abort a thread's interruptible sleep from any CPU. Returns whether a
/// sleep was actually cancelled.
pub fn interrupt(thread: &Thread) -> bool {
    if !thread.flags().contains(ThreadFlags::INTERRUPTIBLE) {
        return false;
    }
    let word = thread.waiter.word.load(Ordering::Acquire);
    let epoch = word >> 8;
    if WaiterState::from_u8((word & 0xFF) as u8) != WaiterState::Queued {
        return false;
    }
    if thread.waiter.try_transition(epoch, WaiterState::Interrupted) {
        // The queue entry goes stale; wake skips it by epoch.
        if thread.transition(ThreadState::Sleeping, ThreadState::Ready) {
            super::insert_ready(thread.id());
        }
        true
    } else {
        false
    }
}

/// Resolve the state a parked thread's sleep finished in; used by the
/// scheduler's block path.
pub(super) fn sleep_outcome(waiter: &Waiter, epoch: u64) -> Option<WaiterState> {
    match waiter.state_of(epoch) {
        Some(WaiterState::Queued) => None,
        Some(state) => Some(state),
        // A newer sleep exists; cannot happen while we are still parked.
        None => Some(waiter.current_state()),
    }
}

/// Expire a sleep: transition to TimedOut if still queued.
pub(crate) fn expire(waiter: &Waiter, epoch: u64) -> bool {
    waiter.try_transition(epoch, WaiterState::TimedOut)
}
