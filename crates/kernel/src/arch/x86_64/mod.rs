//! x86-64 bare-metal implementation
//!
//! Interrupt masking and halting go through the `x86_64` crate; the
//! context switch is a small assembly routine that swaps callee-saved
//! registers and stacks. Per-CPU lookup uses the GS base MSR: GS points at
//! the CPU's `PerCpu` record, whose first field is the CPU id.

pub mod apboot;

use super::IrqState;
use x86_64::instructions::interrupts;
use x86_64::registers::model_specific::GsBase;
use x86_64::VirtAddr;

pub fn cpu_id() -> usize {
    let base = GsBase::read().as_u64();
    if base == 0 {
        // Early boot, before set_percpu(); only the boot CPU runs here.
        return 0;
    }
    // First field of the PerCpu record is the id.
    unsafe { *(base as *const usize) }
}

pub fn irq_save() -> IrqState {
    let enabled = interrupts::are_enabled();
    interrupts::disable();
    IrqState(enabled)
}

pub fn irq_restore(state: IrqState) {
    if state.0 {
        interrupts::enable();
    }
}

pub fn irq_enabled() -> bool {
    interrupts::are_enabled()
}

pub fn irq_enable() {
    interrupts::enable();
}

pub fn irq_disable() {
    interrupts::disable();
}

pub fn pause() {
    core::hint::spin_loop();
}

pub fn cycle_counter() -> u64 {
    unsafe { core::arch::x86_64::_rdtsc() }
}

pub fn wait_for_interrupt() {
    x86_64::instructions::hlt();
}

pub fn halt_loop() -> ! {
    loop {
        interrupts::disable();
        x86_64::instructions::hlt();
    }
}

pub fn set_percpu(_cpu: usize, base: usize) {
    GsBase::write(VirtAddr::new(base as u64));
}

/// Callee-saved register context of a suspended thread.
///
/// Layout is fixed; the switch routine below addresses fields by offset.
#[repr(C)]
#[derive(Debug, Default)]
pub struct Context {
    pub rsp: u64,
    pub rbp: u64,
    pub rbx: u64,
    pub r12: u64,
    pub r13: u64,
    pub r14: u64,
    pub r15: u64,
    pub rip: u64,
}

impl Context {
    pub const fn new() -> Self {
        Self {
            rsp: 0,
            rbp: 0,
            rbx: 0,
            r12: 0,
            r13: 0,
            r14: 0,
            r15: 0,
            rip: 0,
        }
    }

    /// Prepare a context that enters `entry` on `stack_top` at first switch.
    pub fn prepare(stack_top: u64, entry: u64) -> Self {
        let mut ctx = Self::new();
        // Entry sees a 16-byte aligned stack, as the trampoline expects.
        ctx.rsp = stack_top & !0xF;
        ctx.rip = entry;
        ctx
    }
}

core::arch::global_asm!(
    r#"
    .global __quark_context_switch
    // rdi = from (Context *), rsi = to (const Context *)
    __quark_context_switch:
        mov [rdi + 0x00], rsp
        mov [rdi + 0x08], rbp
        mov [rdi + 0x10], rbx
        mov [rdi + 0x18], r12
        mov [rdi + 0x20], r13
        mov [rdi + 0x28], r14
        mov [rdi + 0x30], r15
        lea rax, [rip + 1f]
        mov [rdi + 0x38], rax

        mov rsp, [rsi + 0x00]
        mov rbp, [rsi + 0x08]
        mov rbx, [rsi + 0x10]
        mov r12, [rsi + 0x18]
        mov r13, [rsi + 0x20]
        mov r14, [rsi + 0x28]
        mov r15, [rsi + 0x30]
        jmp [rsi + 0x38]
    1:
        ret
"#
);

extern "C" {
    fn __quark_context_switch(from: *mut Context, to: *const Context);
}

/// # Safety
/// Must be called with interrupts disabled; `from` and `to` must be valid
/// contexts and `to` must reference a live kernel stack.
pub unsafe fn context_switch(from: *mut Context, to: *const Context) {
    __quark_context_switch(from, to);
}
