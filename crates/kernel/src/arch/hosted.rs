//! Software fallback for hosted builds
//!
//! The hosted test kernel runs as an ordinary process: there is one
//! simulated CPU, "interrupt masking" is a flag, and the cycle counter
//! reads the host's unprivileged counter where one exists.

use super::IrqState;
use core::sync::atomic::{AtomicBool, AtomicU64, Ordering};

static IRQ_ENABLED: AtomicBool = AtomicBool::new(true);

pub fn cpu_id() -> usize {
    0
}

pub fn irq_save() -> IrqState {
    IrqState(IRQ_ENABLED.swap(false, Ordering::AcqRel))
}

pub fn irq_restore(state: IrqState) {
    IRQ_ENABLED.store(state.0, Ordering::Release);
}

pub fn irq_enabled() -> bool {
    IRQ_ENABLED.load(Ordering::Acquire)
}

pub fn irq_enable() {
    IRQ_ENABLED.store(true, Ordering::Release);
}

pub fn irq_disable() {
    IRQ_ENABLED.store(false, Ordering::Release);
}

pub fn pause() {
    core::hint::spin_loop();
}

pub fn cycle_counter() -> u64 {
    #[cfg(target_arch = "x86_64")]
    unsafe {
        core::arch::x86_64::_rdtsc()
    }

    #[cfg(target_arch = "aarch64")]
    {
        let cnt: u64;
        unsafe {
            core::arch::asm!("mrs {0}, cntvct_el0", out(reg) cnt, options(nostack, nomem));
        }
        cnt
    }

    #[cfg(not(any(target_arch = "x86_64", target_arch = "aarch64")))]
    {
        // No readable counter; a monotonically increasing stand-in.
        static FAKE: AtomicU64 = AtomicU64::new(0);
        FAKE.fetch_add(1000, Ordering::Relaxed)
    }
}

pub fn wait_for_interrupt() {
    core::hint::spin_loop();
}

pub fn halt_loop() -> ! {
    panic!("halt_loop on hosted build");
}

static PERCPU_BASE: AtomicU64 = AtomicU64::new(0);

pub fn set_percpu(_cpu: usize, base: usize) {
    PERCPU_BASE.store(base as u64, Ordering::Release);
}

/// Saved callee context. Unused on hosted builds, where every kernel
/// thread is backed by a host thread and never switched by us.
#[derive(Debug, Default)]
pub struct Context {
    _opaque: u64,
}

impl Context {
    pub const fn new() -> Self {
        Self { _opaque: 0 }
    }

    pub fn prepare(_stack_top: u64, _entry: u64) -> Self {
        Self::new()
    }
}

/// # Safety
/// Never called on hosted builds; present to keep the scheduler portable.
pub unsafe fn context_switch(_from: *mut Context, _to: *const Context) {
    unreachable!("context_switch on hosted build");
}
