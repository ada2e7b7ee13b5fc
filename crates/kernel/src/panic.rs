//! Fatal errors and the panic handler
//!
//! Kernel-invariant violations are unconditionally fatal: log the reason,
//! stop every other CPU, and halt. On hosted builds a fatal error becomes a
//! process panic so the test harness reports it.

use core::fmt;
use core::sync::atomic::{AtomicBool, Ordering};

/// Set once a fatal error is in progress, so a nested fatal (e.g. from a
/// logging path) does not recurse.
static IN_FATAL: AtomicBool = AtomicBool::new(false);

/// Report an unrecoverable kernel error and halt all CPUs.
pub fn fatal(args: fmt::Arguments) -> ! {
    if !IN_FATAL.swap(true, Ordering::SeqCst) {
        crate::error!("fatal: {}", args);
        crate::smp::ipi::halt_others();
    }

    #[cfg(target_os = "none")]
    {
        crate::arch::halt_loop();
    }

    #[cfg(not(target_os = "none"))]
    {
        panic!("kernel fatal: {}", args);
    }
}

#[macro_export]
macro_rules! fatal {
    ($($arg:tt)*) => {
        $crate::panic::fatal(format_args!($($arg)*))
    };
}

#[cfg(target_os = "none")]
#[panic_handler]
fn panic(info: &core::panic::PanicInfo) -> ! {
    crate::arch::irq_disable();
    crate::error!("panic: {}", info);
    crate::smp::ipi::halt_others();
    crate::arch::halt_loop();
}
