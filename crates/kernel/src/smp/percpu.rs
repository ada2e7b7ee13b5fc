//! Per-CPU data
//!
//! One record per CPU, reached through an architecturally fixed register
//! (the GS base on x86-64). State owned by a single CPU needs no lock,
//! but anything also touched from interrupt handlers is reached through
//! `lock_irq` or accessed with interrupts masked.

use super::MAX_CPUS;
use crate::sched::thread::ThreadId;
use crate::sched::RunQueues;
use crate::sync::spinlock::SpinLock;
use crate::time::timer::TimerList;
use core::cell::UnsafeCell;
use core::ops::Deref;
use core::sync::atomic::{AtomicBool, AtomicI64, AtomicU32, AtomicU64, AtomicUsize, Ordering};

/// Default scheduler tick: 10 ms.
pub const DEFAULT_TICK_NS: u64 = 10_000_000;

pub struct PerCpu {
    /// CPU id. Must stay the first field: the architecture code reads it
    /// through the per-CPU base register.
    pub id: usize,
    current_thread: AtomicU32,
    idle_thread: AtomicU32,
    pub run_queues: SpinLock<RunQueues>,
    pub timers: TimerList,
    need_preempt: AtomicBool,
    tick_ns: AtomicU64,
    /// Offset added to the cycle-derived clock so all CPUs agree.
    pub(crate) clock_offset: AtomicI64,
    context_switches: AtomicUsize,
    /// Context of the CPU's boot stack, switch target of the first
    /// reschedule.
    pub(crate) boot_context: UnsafeCell<crate::arch::Context>,
}

unsafe impl Sync for PerCpu {}

impl PerCpu {
    const fn new(id: usize) -> Self {
        Self {
            id,
            current_thread: AtomicU32::new(0),
            idle_thread: AtomicU32::new(0),
            run_queues: SpinLock::new(RunQueues::new()),
            timers: TimerList::new(),
            need_preempt: AtomicBool::new(false),
            tick_ns: AtomicU64::new(DEFAULT_TICK_NS),
            clock_offset: AtomicI64::new(0),
            context_switches: AtomicUsize::new(0),
            boot_context: UnsafeCell::new(crate::arch::Context::new()),
        }
    }

    pub fn current_thread(&self) -> ThreadId {
        ThreadId(self.current_thread.load(Ordering::Acquire))
    }

    pub fn set_current_thread(&self, id: ThreadId) {
        self.current_thread.store(id.0, Ordering::Release);
    }

    pub fn idle_thread(&self) -> ThreadId {
        ThreadId(self.idle_thread.load(Ordering::Acquire))
    }

    pub fn set_idle_thread(&self, id: ThreadId) {
        self.idle_thread.store(id.0, Ordering::Release);
    }

    /// Read the need-preempt flag. Interrupts must be disabled: the flag
    /// is shared with this CPU's interrupt handlers.
    pub fn need_preempt(&self) -> bool {
        self.need_preempt.load(Ordering::Acquire)
    }

    pub fn set_need_preempt(&self, value: bool) {
        self.need_preempt.store(value, Ordering::Release);
    }

    /// Consume the need-preempt flag.
    pub fn take_need_preempt(&self) -> bool {
        self.need_preempt.swap(false, Ordering::AcqRel)
    }

    pub fn tick_ns(&self) -> u64 {
        self.tick_ns.load(Ordering::Acquire)
    }

    pub fn set_tick_ns(&self, ns: u64) {
        self.tick_ns.store(ns, Ordering::Release);
    }

    pub fn inc_context_switches(&self) {
        self.context_switches.fetch_add(1, Ordering::Relaxed);
    }

    pub fn context_switches(&self) -> usize {
        self.context_switches.load(Ordering::Relaxed)
    }
}

static CPUS: [PerCpu; MAX_CPUS] = [
    PerCpu::new(0),
    PerCpu::new(1),
    PerCpu::new(2),
    PerCpu::new(3),
    PerCpu::new(4),
    PerCpu::new(5),
    PerCpu::new(6),
    PerCpu::new(7),
];

pub fn get(cpu: usize) -> &'static PerCpu {
    CPUS.get(cpu).unwrap_or(&CPUS[0])
}

pub fn try_get(cpu: usize) -> Option<&'static PerCpu> {
    CPUS.get(cpu)
}

/// This CPU's record.
pub fn current() -> &'static PerCpu {
    get(crate::arch::cpu_id())
}

/// Borrow of the current CPU's record tied to a critical section:
/// interrupts (and with them preemption) stay off while the guard lives,
/// so the borrow cannot migrate between CPUs.
pub struct CpuGuard {
    cpu: &'static PerCpu,
    irq: crate::arch::IrqState,
}

impl Deref for CpuGuard {
    type Target = PerCpu;
    fn deref(&self) -> &PerCpu {
        self.cpu
    }
}

impl Drop for CpuGuard {
    fn drop(&mut self) {
        crate::arch::irq_restore(self.irq);
    }
}

/// Enter a scheduler critical section on this CPU.
pub fn critical() -> CpuGuard {
    let irq = crate::arch::irq_save();
    CpuGuard {
        cpu: get(crate::arch::cpu_id()),
        irq,
    }
}

/// Register this CPU's record with the architecture so [`current`]
/// resolves through the fixed register.
pub fn publish(cpu: usize) {
    crate::arch::set_percpu(cpu, get(cpu) as *const PerCpu as usize);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn guard_pins_cpu_record() {
        let guard = critical();
        assert_eq!(guard.id, crate::arch::cpu_id());
        drop(guard);
    }

    #[test]
    fn preempt_flag_is_consumed() {
        let pcpu = get(5);
        pcpu.set_need_preempt(true);
        assert!(pcpu.take_need_preempt());
        assert!(!pcpu.need_preempt());
        assert!(!pcpu.take_need_preempt());
    }
}
