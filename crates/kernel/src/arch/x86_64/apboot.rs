//! AP startup (INIT-SIPI-SIPI)
//!
//! Secondary CPUs power up halted in real mode. The boot CPU copies a
//! 16-bit trampoline below 1 MiB, then kicks each AP with an INIT IPI
//! followed by two startup IPIs pointing at the trampoline page. The
//! trampoline climbs to long mode on a stack we hand it and jumps into
//! `boot::ap_main`.

use core::sync::atomic::{AtomicUsize, Ordering};

/// Local APIC register block (xAPIC default base).
const APIC_BASE: u64 = 0xFEE0_0000;
const APIC_ICR_LOW: u64 = 0x300;
const APIC_ICR_HIGH: u64 = 0x310;

/// Trampoline page, real-mode addressable.
const TRAMPOLINE: u64 = 0x8000;

/// CPU id the trampoline should claim, consumed by the next AP.
pub static PENDING_CPU: AtomicUsize = AtomicUsize::new(0);

fn apic_write(reg: u64, value: u32) {
    unsafe {
        core::ptr::write_volatile(crate::mm::phys_to_virt(APIC_BASE + reg) as *mut u32, value);
    }
}

fn apic_icr(dest_apic: u32, value: u32) {
    apic_write(APIC_ICR_HIGH, dest_apic << 24);
    apic_write(APIC_ICR_LOW, value);
}

fn wait_us(us: u64) {
    let deadline = crate::time::monotonic_ns() + us * 1000;
    while crate::time::monotonic_ns() < deadline {
        crate::arch::pause();
    }
}

/// Send a fixed-vector IPI to a CPU (APIC id == CPU index on the flat
/// topologies this kernel targets).
pub fn send_ipi(cpu: usize, vector: u8) {
    apic_icr(cpu as u32, 0x0000_4000 | vector as u32);
}

/// Send an NMI to a CPU.
pub fn send_nmi(cpu: usize) {
    apic_icr(cpu as u32, 0x0000_4400);
}

/// Bring one AP out of reset. Assumes APIC id == CPU index, which holds
/// for the flat topologies this kernel targets.
pub fn start_ap(cpu: usize) {
    PENDING_CPU.store(cpu, Ordering::Release);
    let apic = cpu as u32;

    // INIT, assert then deassert, per the MP spec.
    apic_icr(apic, 0x0000_4500);
    wait_us(10_000);

    // Two SIPIs at the trampoline vector (address >> 12).
    let vector = (TRAMPOLINE >> 12) as u32;
    apic_icr(apic, 0x0000_4600 | vector);
    wait_us(200);
    apic_icr(apic, 0x0000_4600 | vector);
}

/// Long-mode landing from the trampoline.
#[no_mangle]
extern "C" fn ap_entry() -> ! {
    let cpu = PENDING_CPU.load(Ordering::Acquire);
    crate::boot::ap_main(cpu)
}
