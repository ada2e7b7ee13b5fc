//! Per-CPU timers
//!
//! Each CPU keeps its timers sorted by remaining time, shortest first;
//! the clock source is programmed against the head. When a tick arrives,
//! every timer whose remaining time has elapsed fires in expiry order and
//! the rest are decremented.

use crate::sched::waitq::{WaitQueue, Waiter};
use crate::sync::spinlock::SpinLock;
use alloc::sync::Arc;
use alloc::vec::Vec;

/// What a timer does when it fires.
pub enum TimerAction {
    /// Scheduler tick: burn the current timeslice, set the preempt flag
    /// when it runs out.
    Reschedule,
    /// Call back; a `true` return requests a reschedule.
    Function(fn() -> bool),
    /// Wake a wait queue (`sleep(ns)` parks the caller on a private
    /// queue and arms one of these).
    Wake(Arc<WaitQueue>),
    /// Expire one sleep with TimedOut. Internal support for wait-queue
    /// sleep timeouts.
    SleepTimeout { waiter: Arc<Waiter>, epoch: u64 },
}

struct TimerEntry {
    id: u64,
    remaining_ns: u64,
    /// Re-arm interval for periodic timers.
    period_ns: Option<u64>,
    action: TimerAction,
}

struct TimerListInner {
    entries: Vec<TimerEntry>,
    next_id: u64,
}

/// One CPU's timer list.
pub struct TimerList {
    inner: SpinLock<TimerListInner>,
}

impl TimerList {
    pub const fn new() -> Self {
        Self {
            inner: SpinLock::new(TimerListInner {
                entries: Vec::new(),
                next_id: 1,
            }),
        }
    }

    /// Arm a timer `ns` nanoseconds out. Returns its id.
    pub fn arm(&self, ns: u64, action: TimerAction) -> u64 {
        self.arm_inner(ns, None, action)
    }

    /// Arm a periodic timer with period `ns`.
    pub fn arm_periodic(&self, ns: u64, action: TimerAction) -> u64 {
        self.arm_inner(ns, Some(ns), action)
    }

    fn arm_inner(&self, ns: u64, period_ns: Option<u64>, action: TimerAction) -> u64 {
        let mut inner = self.inner.lock_irq();
        let id = inner.next_id;
        inner.next_id += 1;
        let entry = TimerEntry {
            id,
            remaining_ns: ns,
            period_ns,
            action,
        };
        // Sorted shortest-first; ties keep insertion order so equal
        // deadlines fire FIFO.
        let pos = inner
            .entries
            .partition_point(|e| e.remaining_ns <= entry.remaining_ns);
        inner.entries.insert(pos, entry);
        if pos == 0 {
            super::program_source(ns);
        }
        id
    }

    /// Cancel a pending timer. Returns whether it was still pending.
    pub fn cancel(&self, id: u64) -> bool {
        let mut inner = self.inner.lock_irq();
        match inner.entries.iter().position(|e| e.id == id) {
            Some(pos) => {
                inner.entries.remove(pos);
                true
            }
            None => false,
        }
    }

    pub fn pending(&self) -> usize {
        self.inner.lock_irq().entries.len()
    }

    /// Nanoseconds until the next timer fires.
    pub fn next_deadline(&self) -> Option<u64> {
        self.inner.lock_irq().entries.first().map(|e| e.remaining_ns)
    }

    /// Advance the list by `elapsed_ns`: fire everything due, in expiry
    /// order, and reprogram the source for the new head. Returns the ids
    /// fired, in firing order.
    pub fn advance(&self, elapsed_ns: u64) -> Vec<u64> {
        let mut due = Vec::new();
        {
            let mut inner = self.inner.lock_irq();
            loop {
                let head_due = inner
                    .entries
                    .first()
                    .map_or(false, |e| e.remaining_ns <= elapsed_ns);
                if !head_due {
                    break;
                }
                due.push(inner.entries.remove(0));
            }
            for entry in inner.entries.iter_mut() {
                entry.remaining_ns -= elapsed_ns;
            }
            if let Some(head) = inner.entries.first() {
                super::program_source(head.remaining_ns);
            }
        }

        let mut fired = Vec::with_capacity(due.len());
        for entry in due {
            fired.push(entry.id);
            let resched = match &entry.action {
                TimerAction::Reschedule => {
                    crate::sched::tick();
                    false
                }
                TimerAction::Function(func) => func(),
                TimerAction::Wake(queue) => {
                    queue.wake_all();
                    false
                }
                TimerAction::SleepTimeout { waiter, epoch } => {
                    if crate::sched::waitq::expire(waiter, *epoch) {
                        crate::sched::unblock_id(waiter.thread());
                    }
                    false
                }
            };
            if resched {
                crate::smp::percpu::current().set_need_preempt(true);
            }
            if let Some(period) = entry.period_ns {
                self.arm_inner(period, Some(period), entry.action);
            }
        }
        fired
    }
}

/// Handle to a pending timeout on a specific CPU; cancels on drop.
pub struct TimerHandle {
    cpu: usize,
    id: u64,
}

impl Drop for TimerHandle {
    fn drop(&mut self) {
        crate::smp::percpu::get(self.cpu).timers.cancel(self.id);
    }
}

/// Arm a sleep-timeout timer on the calling CPU.
pub fn arm_sleep_timeout(waiter: Arc<Waiter>, epoch: u64, ns: u64) -> TimerHandle {
    let cpu = crate::arch::cpu_id();
    let id = crate::smp::percpu::get(cpu)
        .timers
        .arm(ns, TimerAction::SleepTimeout { waiter, epoch });
    TimerHandle { cpu, id }
}

/// Tick entry point, called from the clock source's interrupt handler
/// with the elapsed nanoseconds since the last event.
pub fn on_tick(elapsed_ns: u64) {
    crate::smp::percpu::current().timers.advance(elapsed_ns);
}

/// Sleep for at least `ns` nanoseconds.
pub fn sleep_ns(thread: &Arc<crate::sched::thread::Thread>, ns: u64) -> crate::status::Result<()> {
    use crate::sched::waitq::SleepFlags;
    let queue = Arc::new(WaitQueue::new("sleep"));

    #[cfg(target_os = "none")]
    {
        crate::smp::percpu::current()
            .timers
            .arm(ns, TimerAction::Wake(queue.clone()));
        queue.sleep(thread, SleepFlags::empty(), None)
    }

    #[cfg(not(target_os = "none"))]
    {
        // No tick interrupt on hosted builds; the sleep deadline expires
        // in the parking loop instead.
        match queue.sleep(thread, SleepFlags::empty(), Some(ns)) {
            Err(crate::status::Status::TimedOut) => Ok(()),
            other => other,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn timers_fire_shortest_first() {
        let list = TimerList::new();
        fn noop() -> bool {
            false
        }
        let t5 = list.arm(5, TimerAction::Function(noop));
        let t1 = list.arm(1, TimerAction::Function(noop));
        let t3 = list.arm(3, TimerAction::Function(noop));
        let fired = list.advance(5);
        assert_eq!(fired, alloc::vec![t1, t3, t5]);
        assert_eq!(list.pending(), 0);
    }

    #[test]
    fn equal_deadlines_fire_in_arm_order() {
        let list = TimerList::new();
        fn noop() -> bool {
            false
        }
        let a = list.arm(2, TimerAction::Function(noop));
        let b = list.arm(2, TimerAction::Function(noop));
        let c = list.arm(2, TimerAction::Function(noop));
        assert_eq!(list.advance(2), alloc::vec![a, b, c]);
    }

    #[test]
    fn remainder_decrements_and_fires_later() {
        let list = TimerList::new();
        fn noop() -> bool {
            false
        }
        let long = list.arm(10, TimerAction::Function(noop));
        assert!(list.advance(4).is_empty());
        assert_eq!(list.next_deadline(), Some(6));
        assert_eq!(list.advance(6), alloc::vec![long]);
    }

    #[test]
    fn cancelled_timers_do_not_fire(){
        let list = TimerList::new();
        fn noop() -> bool {
            false
        }
        let id = list.arm(3, TimerAction::Function(noop));
        assert!(list.cancel(id));
        assert!(!list.cancel(id));
        assert!(list.advance(10).is_empty());
    }

    #[test]
    fn periodic_timer_rearms() {
        let list = TimerList::new();
        fn noop() -> bool {
            false
        }
        list.arm_periodic(4, TimerAction::Function(noop));
        assert_eq!(list.advance(4).len(), 1);
        assert_eq!(list.pending(), 1);
        assert_eq!(list.advance(4).len(), 1);
    }

    #[test]
    fn wake_action_wakes_queue() {
        let list = TimerList::new();
        static QUEUE: spin::Once<Arc<WaitQueue>> = spin::Once::new();
        let queue = QUEUE.call_once(|| Arc::new(WaitQueue::new("timer-wake"))).clone();
        list.arm(1, TimerAction::Wake(queue.clone()));
        let t = crate::sched::thread::adopt("timer-sleeper");
        let q2 = queue.clone();
        let handle = std::thread::spawn(move || {
            q2.sleep(&t, crate::sched::waitq::SleepFlags::empty(), Some(5_000_000_000))
        });
        while queue.is_empty() {
            std::thread::yield_now();
        }
        list.advance(1);
        assert_eq!(handle.join().unwrap(), Ok(()));
    }
}
