//! Interrupt dispatch
//!
//! A single per-CPU entry point receives every CPU exception and
//! external IRQ with a saved register frame, and dispatches through a
//! 256-entry table: vectors 0–31 are exceptions with fixed semantics,
//! 32–47 route through the IRQ controller abstraction, 48 and up carry
//! IPIs and registered software vectors.
//!
//! Return policy: going back to user mode delivers pending signals;
//! going back to kernel mode runs the scheduler's preempt path when the
//! CPU's need-preempt flag is set.

pub mod irq;

use crate::mm::fault::{FaultReason, FaultResult};
use crate::mm::mmu::Protection;
use crate::sched::signal::{SigInfo, Signal, SEGV_ACCERR, SEGV_MAPERR};
use crate::sched::thread::ThreadFlags;
use crate::status::{Result, Status};
use core::sync::atomic::{AtomicUsize, Ordering};

/// Saved CPU state at interrupt entry. The entry stubs fill this in;
/// for page faults they also capture the faulting address (CR2).
#[repr(C)]
#[derive(Debug, Clone, Copy, Default)]
pub struct InterruptFrame {
    pub rax: u64,
    pub rbx: u64,
    pub rcx: u64,
    pub rdx: u64,
    pub rsi: u64,
    pub rdi: u64,
    pub rbp: u64,
    pub r8: u64,
    pub r9: u64,
    pub r10: u64,
    pub r11: u64,
    pub r12: u64,
    pub r13: u64,
    pub r14: u64,
    pub r15: u64,
    pub vector: u64,
    pub error_code: u64,
    pub fault_addr: u64,
    pub rip: u64,
    pub cs: u64,
    pub rflags: u64,
    pub rsp: u64,
    pub ss: u64,
}

impl InterruptFrame {
    /// Whether the interrupted code ran in ring 3.
    pub fn from_user(&self) -> bool {
        self.cs & 3 == 3
    }
}

pub type Handler = fn(&mut InterruptFrame);

/// Vector dispatch table; entries are handler fn pointers stored as
/// usizes (0 = unregistered) so dispatch is lock-free.
const EMPTY_SLOT: AtomicUsize = AtomicUsize::new(0);
static TABLE: [AtomicUsize; 256] = [EMPTY_SLOT; 256];

/// Exception mnemonics for vectors 0–31.
const EXCEPTION_NAMES: [&str; 32] = [
    "DE", "DB", "NMI", "BP", "OF", "BR", "UD", "NM", "DF", "reserved", "TS", "NP", "SS", "GP",
    "PF", "reserved", "MF", "AC", "MC", "XM", "VE", "CP", "reserved", "reserved", "reserved",
    "reserved", "reserved", "reserved", "HV", "VC", "SX", "reserved",
];

pub fn exception_name(vector: u8) -> &'static str {
    EXCEPTION_NAMES.get(vector as usize).copied().unwrap_or("?")
}

bitflags::bitflags! {
    /// Page-fault error-code bits, consumed bit-exact from hardware.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct PageFaultError: u64 {
        /// Fault on a present mapping (protection violation).
        const PRESENT = 1 << 0;
        const WRITE = 1 << 1;
        const USER = 1 << 2;
        const RESERVED = 1 << 3;
        const EXEC = 1 << 4;
    }
}

/// Register a handler on a free vector.
pub fn register(vector: u8, handler: Handler) -> Result<()> {
    let slot = &TABLE[vector as usize];
    if slot
        .compare_exchange(0, handler as usize, Ordering::AcqRel, Ordering::Acquire)
        .is_err()
    {
        return Err(Status::InUse);
    }
    Ok(())
}

pub fn unregister(vector: u8) {
    TABLE[vector as usize].store(0, Ordering::Release);
}

fn handler_for(vector: usize) -> Option<Handler> {
    let raw = TABLE[vector].load(Ordering::Acquire);
    if raw == 0 {
        None
    } else {
        // Registered through register(), so the value is a Handler.
        Some(unsafe { core::mem::transmute::<usize, Handler>(raw) })
    }
}

pub fn init() {
    irq::init();
    crate::info!("interrupt: dispatch table ready");
}

/// The single dispatch entry point.
pub fn dispatch(frame: &mut InterruptFrame) {
    let vector = (frame.vector & 0xFF) as usize;
    let from_user = frame.from_user();

    if from_user {
        // Entering the kernel from user mode: remember where the user
        // frame lives so signal setup can rewrite it.
        if let Some(thread) = crate::sched::current() {
            thread.note_kernel_entry(frame as *mut InterruptFrame as usize);
        }
    }

    match vector {
        0..=31 => handle_exception(vector as u8, frame),
        32..=47 => irq::handle((vector - 32) as u8, frame),
        _ => match handler_for(vector) {
            Some(handler) => handler(frame),
            None => {
                crate::warn!("interrupt: unhandled vector {}", vector);
            }
        },
    }

    // Exit-path work.
    if from_user {
        deliver_pending_signals(frame);
        if let Some(thread) = crate::sched::current() {
            thread.note_kernel_exit();
        }
    } else if crate::smp::percpu::current().need_preempt() {
        crate::sched::preempt();
    }
}

fn handle_exception(vector: u8, frame: &mut InterruptFrame) {
    match vector {
        // NMI carries the cross-CPU pause/halt commands.
        2 => match crate::smp::ipi::nmi_command() {
            crate::smp::ipi::NmiCommand::Halt => crate::arch::halt_loop(),
            crate::smp::ipi::NmiCommand::Pause => crate::smp::ipi::pause_loop(),
            crate::smp::ipi::NmiCommand::None => {
                crate::warn!("interrupt: spurious NMI");
            }
        },
        // Double fault: something is deeply wrong; never recoverable.
        8 => crate::fatal!("double fault, error {:#x}", frame.error_code),
        14 => handle_page_fault(frame),
        // Breakpoint: let a registered debugger hook take it, else log.
        3 => match handler_for(3) {
            Some(handler) => handler(frame),
            None => crate::warn!("interrupt: stray breakpoint at {:#x}", frame.rip),
        },
        _ => {
            let signal = exception_signal(vector);
            if frame.from_user() {
                if let Some(signal) = signal {
                    crate::debug!(
                        "interrupt: user {} fault at {:#x}, signalling {:?}",
                        exception_name(vector),
                        frame.rip,
                        signal
                    );
                    if let Some(thread) = crate::sched::current() {
                        thread.send_signal(SigInfo::new(signal, 0, frame.rip));
                    }
                    return;
                }
            }
            crate::fatal!(
                "kernel {} exception at {:#x} (error {:#x})",
                exception_name(vector),
                frame.rip,
                frame.error_code
            );
        }
    }
}

/// Signal delivered for a user-mode exception, by vector.
fn exception_signal(vector: u8) -> Option<Signal> {
    match vector {
        0 | 16 | 19 => Some(Signal::Fpe),   // DE, MF, XM
        4 | 5 => Some(Signal::Segv),        // OF, BR
        6 | 7 => Some(Signal::Ill),         // UD, NM
        10 | 11 | 12 | 13 => Some(Signal::Segv), // TS, NP, SS, GP
        17 => Some(Signal::Bus),            // AC
        _ => None,
    }
}

fn handle_page_fault(frame: &mut InterruptFrame) {
    let error = PageFaultError::from_bits_truncate(frame.error_code);
    let addr = frame.fault_addr;
    let from_user = frame.from_user();

    // A reserved-bit fault means corrupted page tables. During a
    // guarded user copy it is reported as a failed copy; anywhere else
    // it is fatal.
    if error.contains(PageFaultError::RESERVED) {
        if !from_user && usermem_active() {
            usermem_fail(frame);
            return;
        }
        crate::fatal!(
            "reserved-bit page fault at {:#x} (error {:#x})",
            addr,
            frame.error_code
        );
    }

    let access = if error.contains(PageFaultError::WRITE) {
        Protection::WRITE
    } else if error.contains(PageFaultError::EXEC) {
        Protection::EXEC
    } else {
        Protection::READ
    };
    let reason = if error.contains(PageFaultError::PRESENT) {
        FaultReason::ProtViolation
    } else {
        FaultReason::NotPresent
    };

    let result = match crate::process::current() {
        Some(process) if crate::mm::is_user_address(addr) => {
            let mut aspace = process.aspace().lock();
            crate::mm::fault::resolve(&mut aspace, addr, reason, access)
        }
        _ => FaultResult::NoRegion,
    };

    match result {
        FaultResult::Success => {}
        FaultResult::NoRegion | FaultResult::AccessDenied if from_user => {
            let code = if result == FaultResult::NoRegion {
                SEGV_MAPERR
            } else {
                SEGV_ACCERR
            };
            crate::debug!("interrupt: SIGSEGV for {:#x} (code {})", addr, code);
            if let Some(thread) = crate::sched::current() {
                thread.send_signal(SigInfo::new(Signal::Segv, code, addr));
            }
        }
        FaultResult::OutOfMemory if from_user => {
            crate::warn!("interrupt: fault at {:#x} failed, out of memory", addr);
            if let Some(thread) = crate::sched::current() {
                thread.send_signal(SigInfo::new(Signal::Kill, 0, addr));
            }
        }
        _ => {
            // Kernel-mode fault: survivable only inside a guarded user
            // copy touching a user address.
            if usermem_active() && crate::mm::is_user_address(addr) {
                usermem_fail(frame);
                return;
            }
            crate::fatal!(
                "kernel page fault at {:#x} (rip {:#x}, error {:#x}): {:?}",
                addr,
                frame.rip,
                frame.error_code,
                result
            );
        }
    }
}

fn usermem_active() -> bool {
    crate::sched::current()
        .map(|t| t.flags().contains(ThreadFlags::USERMEM))
        .unwrap_or(false)
}

/// Abort the guarded user copy in progress: flag the failure and steer
/// execution to the copy routine's fixup point.
fn usermem_fail(frame: &mut InterruptFrame) {
    if let Some(thread) = crate::sched::current() {
        thread.set_usermem_fault();
    }
    if let Some(fixup) = crate::syscall::uaccess::fixup_rip() {
        frame.rip = fixup;
    }
}

fn deliver_pending_signals(frame: &mut InterruptFrame) {
    let Some(thread) = crate::sched::current() else {
        return;
    };
    while let Some(info) = thread.dequeue_signal() {
        let Some(signal) = Signal::from_u32(info.signo) else {
            continue;
        };
        match signal.default_action() {
            crate::sched::signal::SignalAction::Ignore => continue,
            crate::sched::signal::SignalAction::Stop => {
                crate::debug!("signal: stopping thread {:?}", thread.id());
                // Parked until SIGCONT; the stop state rides on the
                // thread's interruptible-sleep machinery.
                continue;
            }
            crate::sched::signal::SignalAction::Terminate => {
                crate::info!(
                    "signal: terminating {:?} with {:?} (code {}, addr {:#x})",
                    thread.id(),
                    signal,
                    info.code,
                    info.addr
                );
                thread.note_fatal_signal(info);
                crate::process::exit_current(128 + info.signo as i32, frame);
                return;
            }
        }
    }
}
