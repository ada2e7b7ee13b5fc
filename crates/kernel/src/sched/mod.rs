//! Thread scheduler
//!
//! Per-CPU priority run queues with time-sliced preemption. Each CPU
//! schedules independently from its own queues; CPUs interact only through
//! run-queue spinlocks and wake IPIs. A thread is inserted on the CPU
//! chosen at run() time, currently the creator's CPU.
//!
//! The context switch itself runs with interrupts disabled; the incoming
//! thread resumes either in `reschedule()` or, on first run, in the
//! trampoline, which finishes switch bookkeeping before calling the entry
//! point.

pub mod signal;
pub mod thread;
pub mod waitq;

use crate::smp::percpu;
use alloc::collections::VecDeque;
use alloc::sync::Arc;
use thread::{Thread, ThreadId, ThreadState};
use waitq::{Waiter, WaiterState};

pub const NUM_PRIORITIES: usize = 32;

/// Scheduler ticks per timeslice.
pub const TIMESLICE_TICKS: u32 = 5;

/// One CPU's ready threads, bucketed by priority. Guarded by the per-CPU
/// run-queue spinlock; cross-CPU wakes take the target CPU's lock.
pub struct RunQueues {
    bitmap: u32,
    queues: [VecDeque<ThreadId>; NUM_PRIORITIES],
}

impl RunQueues {
    pub const fn new() -> Self {
        const EMPTY: VecDeque<ThreadId> = VecDeque::new();
        Self {
            bitmap: 0,
            queues: [EMPTY; NUM_PRIORITIES],
        }
    }

    pub fn push(&mut self, priority: u8, id: ThreadId) {
        let prio = priority as usize % NUM_PRIORITIES;
        self.queues[prio].push_back(id);
        self.bitmap |= 1 << prio;
    }

    /// Highest-priority ready thread, FIFO within a priority.
    pub fn pop_highest(&mut self) -> Option<ThreadId> {
        if self.bitmap == 0 {
            return None;
        }
        let prio = 31 - self.bitmap.leading_zeros() as usize;
        let id = self.queues[prio].pop_front();
        if self.queues[prio].is_empty() {
            self.bitmap &= !(1 << prio);
        }
        id
    }

    pub fn remove(&mut self, id: ThreadId) {
        for prio in 0..NUM_PRIORITIES {
            let queue = &mut self.queues[prio];
            queue.retain(|&t| t != id);
            if queue.is_empty() {
                self.bitmap &= !(1 << prio);
            }
        }
    }

    pub fn highest_priority(&self) -> Option<u8> {
        if self.bitmap == 0 {
            None
        } else {
            Some((31 - self.bitmap.leading_zeros()) as u8)
        }
    }

    pub fn len(&self) -> usize {
        self.queues.iter().map(|q| q.len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.bitmap == 0
    }
}

/// Threads whose stacks await reclamation are handled by the reaper; this
/// queue wakes it.
static REAPER_QUEUE: waitq::WaitQueue = waitq::WaitQueue::new("reaper");

pub fn init() {
    crate::info!(
        "sched: {} priorities, timeslice {} ticks",
        NUM_PRIORITIES,
        TIMESLICE_TICKS
    );
}

/// Transition a Created thread to Ready and queue it for execution.
pub fn run(thread: &Arc<Thread>) {
    if !thread.transition(ThreadState::Created, ThreadState::Ready) {
        crate::fatal!("sched: run() on {:?} not in Created state", thread.id());
    }
    thread
        .timeslice
        .store(TIMESLICE_TICKS, core::sync::atomic::Ordering::Release);
    insert_ready(thread.id());
}

/// Convenience: create and immediately run a kernel thread.
pub fn spawn(name: &str, entry: fn(usize), arg: usize) -> crate::status::Result<Arc<Thread>> {
    let t = thread::create(0, name, entry, arg, thread::DEFAULT_PRIORITY)?;
    run(&t);
    Ok(t)
}

/// Insert a Ready thread into its CPU's run queue and nudge that CPU.
pub(crate) fn insert_ready(id: ThreadId) {
    let Some(t) = thread::lookup(id) else {
        return;
    };
    let cpu = t.cpu();
    let pcpu = percpu::get(cpu);
    {
        let mut run = pcpu.run_queues.lock_irq();
        run.push(t.priority(), id);
    }
    // Preempt the target if we beat what it is running.
    let should_preempt = match current_on(cpu) {
        Some(curr) => t.priority() > curr.priority(),
        None => true,
    };
    if should_preempt {
        pcpu.set_need_preempt(true);
        if cpu != crate::arch::cpu_id() {
            crate::smp::ipi::send_reschedule(cpu);
        }
    }
}

/// Wake a sleeping thread (wait-queue wake path).
pub(crate) fn unblock_id(id: ThreadId) {
    let Some(t) = thread::lookup(id) else {
        return;
    };
    if t.transition(ThreadState::Sleeping, ThreadState::Ready) {
        insert_ready(id);
    }
    // Otherwise the thread has not suspended yet; it will observe its
    // waiter state before doing so.
}

/// The thread currently running on `cpu`, if any.
pub fn current_on(cpu: usize) -> Option<Arc<Thread>> {
    let id = percpu::get(cpu).current_thread();
    thread::lookup(id)
}

/// The thread currently running on this CPU.
pub fn current() -> Option<Arc<Thread>> {
    current_on(crate::arch::cpu_id())
}

/// Identity of the running context for lock-holder bookkeeping: the
/// current thread's id, or the boot context before threading is up.
pub fn current_id() -> ThreadId {
    match percpu::try_get(crate::arch::cpu_id()) {
        Some(pcpu) => {
            let id = pcpu.current_thread();
            if id.0 == 0 {
                thread::BOOT_CONTEXT
            } else {
                id
            }
        }
        None => thread::BOOT_CONTEXT,
    }
}

/// Scheduler tick: burn the running thread's timeslice and request
/// preemption when it is used up. Called from the timer with the
/// Reschedule action, interrupts disabled.
pub fn tick() {
    let pcpu = percpu::current();
    if let Some(curr) = current() {
        let left = curr.timeslice.load(core::sync::atomic::Ordering::Acquire);
        if left > 1 {
            curr.timeslice
                .store(left - 1, core::sync::atomic::Ordering::Release);
        } else {
            pcpu.set_need_preempt(true);
        }
    }
}

/// Suspend the calling thread until its waiter record leaves the Queued
/// state. This is the single parking primitive under every sleep.
pub(crate) fn block(
    thread: &Arc<Thread>,
    waiter: &Arc<Waiter>,
    epoch: u64,
    timeout_ns: Option<u64>,
) -> WaiterState {
    #[cfg(not(target_os = "none"))]
    {
        // Hosted: the kernel thread is backed by a host thread; park by
        // spinning on the waiter word. Timeouts expire here, exactly one
        // transition wins against wake and interrupt.
        thread.set_state(ThreadState::Sleeping);
        let deadline = timeout_ns.map(|ns| crate::time::monotonic_ns().saturating_add(ns));
        let state = loop {
            match waitq::sleep_outcome(waiter, epoch) {
                Some(state) => break state,
                None => {}
            }
            if let Some(deadline) = deadline {
                if crate::time::monotonic_ns() >= deadline {
                    waitq::expire(waiter, epoch);
                    continue;
                }
            }
            crate::arch::pause();
        };
        thread.set_state(ThreadState::Running);
        state
    }

    #[cfg(target_os = "none")]
    {
        let _timer = timeout_ns.map(|ns| {
            crate::time::timer::arm_sleep_timeout(waiter.clone(), epoch, ns)
        });
        loop {
            if let Some(state) = waitq::sleep_outcome(waiter, epoch) {
                return state;
            }
            let irq = crate::arch::irq_save();
            thread.set_state(ThreadState::Sleeping);
            reschedule();
            crate::arch::irq_restore(irq);
        }
    }
}

/// Voluntarily give up the CPU.
pub fn yield_now() {
    #[cfg(target_os = "none")]
    {
        let irq = crate::arch::irq_save();
        if let Some(curr) = current() {
            if curr.transition(ThreadState::Running, ThreadState::Ready) {
                insert_ready(curr.id());
            }
        }
        reschedule();
        crate::arch::irq_restore(irq);
    }
    #[cfg(not(target_os = "none"))]
    {
        crate::arch::pause();
    }
}

/// Called on the interrupt return-to-kernel path when the need-preempt
/// flag is set.
pub fn preempt() {
    let pcpu = percpu::current();
    if pcpu.take_need_preempt() {
        yield_now();
    }
}

/// Terminate the calling thread. The stack is reclaimed by the reaper
/// after the final switch away, never here.
pub fn exit_current(code: i32) -> ! {
    let Some(curr) = current() else {
        crate::fatal!("sched: exit with no current thread");
    };
    thread::retire(&curr, code);
    REAPER_QUEUE.wake_one();

    #[cfg(target_os = "none")]
    {
        crate::arch::irq_disable();
        reschedule();
        unreachable!("dead thread rescheduled");
    }
    #[cfg(not(target_os = "none"))]
    {
        panic!("thread exit on hosted build");
    }
}

/// Reaper thread body: reclaim dead threads' stacks as they arrive.
pub fn reaper_entry(_arg: usize) {
    loop {
        thread::reap();
        let Some(curr) = current() else { return };
        let _ = REAPER_QUEUE.sleep(&curr, waitq::SleepFlags::empty(), None);
    }
}

/// Pick the next thread on this CPU and switch to it. Interrupts must be
/// disabled. Bare metal only: hosted threads park in [`block`] instead.
#[cfg(target_os = "none")]
fn reschedule() {
    let pcpu = percpu::current();
    pcpu.set_need_preempt(false);

    let next_id = {
        let mut run = pcpu.run_queues.lock();
        run.pop_highest()
    };
    let next = match next_id.and_then(thread::lookup) {
        Some(next) => next,
        None => match thread::lookup(pcpu.idle_thread()) {
            Some(idle) => idle,
            // Early boot: nothing to switch to yet.
            None => return,
        },
    };

    let prev = current();
    if let Some(ref prev) = prev {
        if prev.id() == next.id() {
            if prev.state() == ThreadState::Ready {
                prev.set_state(ThreadState::Running);
            }
            return;
        }
    }

    next.set_state(ThreadState::Running);
    next.set_cpu(pcpu.id);
    next.timeslice
        .store(TIMESLICE_TICKS, core::sync::atomic::Ordering::Release);
    pcpu.set_current_thread(next.id());
    pcpu.inc_context_switches();

    // Different owning processes mean an MMU context switch.
    if let Some(ref prev) = prev {
        if prev.process != next.process {
            crate::process::switch_mmu(next.process);
        }
    }

    let prev_ctx = match prev {
        Some(ref prev) => prev.context.get(),
        None => pcpu.boot_context.get(),
    };
    unsafe {
        crate::arch::context_switch(prev_ctx, next.context.get());
    }
}

/// First code a new thread runs after its first context switch: finish
/// the switch, then call the entry point.
#[cfg(target_os = "none")]
pub(crate) extern "C" fn thread_trampoline() -> ! {
    crate::arch::irq_enable();
    let Some(curr) = current() else {
        crate::fatal!("sched: trampoline with no current thread");
    };
    if let Some((entry, arg)) = curr.take_entry() {
        entry(arg);
    }
    exit_current(0);
}

/// Idle loop, one thread per CPU.
pub fn idle_entry(_arg: usize) {
    loop {
        crate::arch::wait_for_interrupt();
        #[cfg(target_os = "none")]
        {
            let irq = crate::arch::irq_save();
            reschedule();
            crate::arch::irq_restore(irq);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn run_queue_priority_order() {
        let mut rq = RunQueues::new();
        rq.push(4, ThreadId(10));
        rq.push(16, ThreadId(11));
        rq.push(4, ThreadId(12));
        rq.push(31, ThreadId(13));
        assert_eq!(rq.pop_highest(), Some(ThreadId(13)));
        assert_eq!(rq.pop_highest(), Some(ThreadId(11)));
        // FIFO within the same priority.
        assert_eq!(rq.pop_highest(), Some(ThreadId(10)));
        assert_eq!(rq.pop_highest(), Some(ThreadId(12)));
        assert_eq!(rq.pop_highest(), None);
    }

    #[test]
    fn run_queue_remove_clears_bitmap() {
        let mut rq = RunQueues::new();
        rq.push(7, ThreadId(1));
        rq.remove(ThreadId(1));
        assert!(rq.is_empty());
        assert_eq!(rq.pop_highest(), None);
    }

    #[test]
    fn wake_before_park_is_not_lost() {
        use std::sync::atomic::{AtomicBool, Ordering};
        static QUEUE: waitq::WaitQueue = waitq::WaitQueue::new("wake-race");
        static DONE: AtomicBool = AtomicBool::new(false);

        let sleeper = thread::adopt("race-sleeper");
        let handle = std::thread::spawn(move || {
            let result = QUEUE.sleep(&sleeper, waitq::SleepFlags::empty(), Some(5_000_000_000));
            DONE.store(true, Ordering::SeqCst);
            result
        });
        // Busy-wait until the sleeper is queued, then wake.
        while QUEUE.is_empty() {
            std::thread::yield_now();
        }
        assert!(QUEUE.wake_one());
        assert_eq!(handle.join().unwrap(), Ok(()));
        assert!(DONE.load(Ordering::SeqCst));
    }

    #[test]
    fn waiters_wake_in_fifo_order() {
        use std::sync::{Arc as StdArc, Mutex as StdMutex};
        static QUEUE: waitq::WaitQueue = waitq::WaitQueue::new("fifo");
        let order = StdArc::new(StdMutex::new(alloc::vec::Vec::new()));

        let mut handles = alloc::vec::Vec::new();
        for i in 0..3usize {
            let order = order.clone();
            let t = thread::adopt("fifo-sleeper");
            handles.push(std::thread::spawn(move || {
                // Park strictly in index order.
                while QUEUE.waiter_count() != i {
                    std::thread::yield_now();
                }
                QUEUE
                    .sleep(&t, waitq::SleepFlags::empty(), Some(5_000_000_000))
                    .unwrap();
                order.lock().unwrap().push(i);
            }));
        }
        while QUEUE.waiter_count() != 3 {
            std::thread::yield_now();
        }
        for _ in 0..3 {
            assert!(QUEUE.wake_one());
            std::thread::sleep(std::time::Duration::from_millis(20));
        }
        for h in handles {
            h.join().unwrap();
        }
        assert_eq!(*order.lock().unwrap(), alloc::vec![0usize, 1, 2]);
    }

    #[test]
    fn wake_all_releases_everyone() {
        static QUEUE: waitq::WaitQueue = waitq::WaitQueue::new("wake-all");
        let mut handles = alloc::vec::Vec::new();
        for _ in 0..4 {
            let t = thread::adopt("all-sleeper");
            handles.push(std::thread::spawn(move || {
                QUEUE.sleep(&t, waitq::SleepFlags::empty(), Some(5_000_000_000))
            }));
        }
        while QUEUE.waiter_count() != 4 {
            std::thread::yield_now();
        }
        assert_eq!(QUEUE.wake_all(), 4);
        for h in handles {
            assert_eq!(h.join().unwrap(), Ok(()));
        }
    }

    #[test]
    fn nonblocking_sleep_would_block() {
        static QUEUE: waitq::WaitQueue = waitq::WaitQueue::new("nb");
        let t = thread::adopt("nb-sleeper");
        assert_eq!(
            QUEUE.sleep(&t, waitq::SleepFlags::NONBLOCK, None),
            Err(crate::status::Status::WouldBlock)
        );
    }

    #[test]
    fn missed_wake_is_banked_for_one_waiter() {
        static QUEUE: waitq::WaitQueue =
            waitq::WaitQueue::with_flags("missed", waitq::WaitQueueFlags::COUNT_MISSED);
        // Wake with nobody waiting: banked, not lost.
        assert!(!QUEUE.wake_one());
        assert_eq!(QUEUE.missed(), 1);
        let t = thread::adopt("missed-sleeper");
        // Sleep consumes the bank without blocking.
        assert_eq!(QUEUE.sleep(&t, waitq::SleepFlags::empty(), None), Ok(()));
        assert_eq!(QUEUE.missed(), 0);
        // NONBLOCK with an empty bank reports WouldBlock.
        assert_eq!(
            QUEUE.sleep(&t, waitq::SleepFlags::NONBLOCK, None),
            Err(crate::status::Status::WouldBlock)
        );
    }

    #[test]
    fn interrupt_cancels_interruptible_sleep() {
        static QUEUE: waitq::WaitQueue = waitq::WaitQueue::new("intr");
        let t = thread::adopt("intr-sleeper");
        let t2 = t.clone();
        let handle = std::thread::spawn(move || {
            QUEUE.sleep(&t2, waitq::SleepFlags::INTERRUPTIBLE, Some(5_000_000_000))
        });
        while QUEUE.is_empty() {
            std::thread::yield_now();
        }
        assert!(waitq::interrupt(&t));
        assert_eq!(handle.join().unwrap(), Err(crate::status::Status::Interrupted));
    }

    #[test]
    fn timeout_expires_sleep() {
        static QUEUE: waitq::WaitQueue = waitq::WaitQueue::new("timeout");
        let t = thread::adopt("timeout-sleeper");
        let start = crate::time::monotonic_ns();
        let result = QUEUE.sleep(&t, waitq::SleepFlags::empty(), Some(20_000_000));
        let elapsed = crate::time::monotonic_ns() - start;
        assert_eq!(result, Err(crate::status::Status::TimedOut));
        assert!(elapsed >= 20_000_000);
    }
}
