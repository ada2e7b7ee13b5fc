//! Architecture facade
//!
//! The rest of the kernel reaches the hardware only through this module:
//! CPU identification, local interrupt masking, the cycle counter, and the
//! raw context switch. The bare-metal x86-64 implementation lives in
//! `x86_64/`; every other build (notably the hosted test build) gets a
//! software fallback so the core logic stays exercisable off-target.

#[cfg(all(target_arch = "x86_64", target_os = "none"))]
pub mod x86_64;
#[cfg(all(target_arch = "x86_64", target_os = "none"))]
use self::x86_64 as imp;

#[cfg(not(all(target_arch = "x86_64", target_os = "none")))]
pub mod hosted;
#[cfg(not(all(target_arch = "x86_64", target_os = "none")))]
use self::hosted as imp;

/// Saved local-interrupt state, returned by [`irq_save`].
#[derive(Debug, Clone, Copy)]
pub struct IrqState(pub(crate) bool);

/// Identify the executing CPU.
#[inline]
pub fn cpu_id() -> usize {
    imp::cpu_id()
}

/// Disable local interrupts, returning the previous state.
#[inline]
pub fn irq_save() -> IrqState {
    imp::irq_save()
}

/// Restore a state captured by [`irq_save`].
#[inline]
pub fn irq_restore(state: IrqState) {
    imp::irq_restore(state)
}

/// Whether local interrupts are currently enabled.
#[inline]
pub fn irq_enabled() -> bool {
    imp::irq_enabled()
}

#[inline]
pub fn irq_enable() {
    imp::irq_enable()
}

#[inline]
pub fn irq_disable() {
    imp::irq_disable()
}

/// Spin-wait hint.
#[inline]
pub fn pause() {
    imp::pause()
}

/// CPU cycle counter (TSC on x86-64).
#[inline]
pub fn cycle_counter() -> u64 {
    imp::cycle_counter()
}

/// Park the CPU until the next interrupt.
#[inline]
pub fn wait_for_interrupt() {
    imp::wait_for_interrupt()
}

/// Stop this CPU permanently.
pub fn halt_loop() -> ! {
    imp::halt_loop()
}

/// Publish this CPU's per-CPU record so [`cpu_id`] can find it.
///
/// On x86-64 this writes the GS base MSR; hosted builds record it in a
/// process-wide slot.
pub fn set_percpu(cpu: usize, base: usize) {
    imp::set_percpu(cpu, base)
}

pub use imp::{context_switch, Context};
