//! Inter-processor interrupts
//!
//! Three mechanisms: a fixed "reschedule now" vector, a generic-call
//! vector draining a per-CPU function queue, and NMI overloaded for the
//! pause-all / halt-all cross-CPU commands used by fatal errors and the
//! debugger. Hosted builds route everything through the per-CPU state
//! directly.

use super::{percpu, MAX_CPUS};
use crate::sync::spinlock::SpinLock;
use alloc::collections::VecDeque;
use core::sync::atomic::{AtomicBool, Ordering};

/// Fixed IPI vectors (>= 48 per the dispatch layout).
pub const RESCHEDULE_VECTOR: u8 = 48;
pub const GENERIC_VECTOR: u8 = 49;

/// Cross-CPU commands carried by NMI.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NmiCommand {
    None,
    /// Spin until resumed (debugger pause-all).
    Pause,
    /// Stop permanently (fatal error).
    Halt,
}

static NMI_HALT: AtomicBool = AtomicBool::new(false);
static NMI_PAUSE: AtomicBool = AtomicBool::new(false);

/// Pending generic-IPI calls per CPU.
struct CallQueue {
    calls: SpinLock<VecDeque<fn()>>,
}

impl CallQueue {
    const fn new() -> Self {
        Self {
            calls: SpinLock::new(VecDeque::new()),
        }
    }
}

static CALLS: [CallQueue; MAX_CPUS] = [
    CallQueue::new(),
    CallQueue::new(),
    CallQueue::new(),
    CallQueue::new(),
    CallQueue::new(),
    CallQueue::new(),
    CallQueue::new(),
    CallQueue::new(),
];

/// Ask `cpu` to run its scheduler as soon as it returns to kernel code.
pub fn send_reschedule(cpu: usize) {
    percpu::get(cpu).set_need_preempt(true);
    #[cfg(all(target_arch = "x86_64", target_os = "none"))]
    send_vector(cpu, RESCHEDULE_VECTOR);
}

/// Queue `func` on `cpu` and interrupt it.
pub fn send_call(cpu: usize, func: fn()) {
    if cpu >= MAX_CPUS {
        return;
    }
    CALLS[cpu].calls.lock_irq().push_back(func);
    #[cfg(all(target_arch = "x86_64", target_os = "none"))]
    send_vector(cpu, GENERIC_VECTOR);
    #[cfg(not(target_os = "none"))]
    drain_calls(cpu);
}

/// Generic-vector handler body: run every queued call.
pub fn drain_calls(cpu: usize) {
    loop {
        let call = CALLS[cpu].calls.lock_irq().pop_front();
        match call {
            Some(func) => func(),
            None => break,
        }
    }
}

/// Stop every other CPU. Used by fatal errors; there is no way back.
pub fn halt_others() {
    NMI_HALT.store(true, Ordering::Release);
    let this = crate::arch::cpu_id();
    for cpu in super::online_cpus() {
        if cpu != this {
            super::set_online(cpu, false);
            #[cfg(all(target_arch = "x86_64", target_os = "none"))]
            send_nmi(cpu);
        }
    }
}

/// Park every other CPU until [`resume_others`] (debugger entry).
pub fn pause_others() {
    NMI_PAUSE.store(true, Ordering::Release);
    #[cfg(all(target_arch = "x86_64", target_os = "none"))]
    {
        let this = crate::arch::cpu_id();
        for cpu in super::online_cpus() {
            if cpu != this {
                send_nmi(cpu);
            }
        }
    }
}

pub fn resume_others() {
    NMI_PAUSE.store(false, Ordering::Release);
}

/// NMI handler body: decode the pending cross-CPU command.
pub fn nmi_command() -> NmiCommand {
    if NMI_HALT.load(Ordering::Acquire) {
        NmiCommand::Halt
    } else if NMI_PAUSE.load(Ordering::Acquire) {
        NmiCommand::Pause
    } else {
        NmiCommand::None
    }
}

/// Spin while a pause-all is in effect.
pub fn pause_loop() {
    while NMI_PAUSE.load(Ordering::Acquire) {
        crate::arch::pause();
    }
}

#[cfg(all(target_arch = "x86_64", target_os = "none"))]
fn send_vector(cpu: usize, vector: u8) {
    crate::arch::x86_64::apboot::send_ipi(cpu, vector);
}

#[cfg(all(target_arch = "x86_64", target_os = "none"))]
fn send_nmi(cpu: usize) {
    crate::arch::x86_64::apboot::send_nmi(cpu);
}

#[cfg(test)]
mod tests {
    use super::*;
    use core::sync::atomic::AtomicUsize;

    #[test]
    fn generic_call_runs_on_target() {
        static HITS: AtomicUsize = AtomicUsize::new(0);
        fn bump() {
            HITS.fetch_add(1, Ordering::SeqCst);
        }
        send_call(0, bump);
        assert_eq!(HITS.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn reschedule_sets_preempt_flag() {
        send_reschedule(3);
        assert!(percpu::get(3).take_need_preempt());
    }
}
