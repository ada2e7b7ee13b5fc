//! Boot sequencing
//!
//! The boot CPU walks: early heap → time base → memory management →
//! interrupt dispatch → scheduler → system threads → AP launch, then
//! becomes the idle loop. Each AP re-runs the per-CPU part and passes a
//! two-barrier TSC handshake with the boot CPU so every CPU's monotonic
//! clock agrees before it joins the scheduler.

#[cfg(target_os = "none")]
use crate::bootinfo::BootInfo;
#[cfg(target_os = "none")]
use core::sync::atomic::{AtomicU32, AtomicU64, Ordering};

/// Serial console sink for the log facility.
#[cfg(all(target_arch = "x86_64", target_os = "none"))]
mod console {
    use spin::Mutex;
    use uart_16550::SerialPort;

    static PORT: Mutex<Option<SerialPort>> = Mutex::new(None);

    pub fn init() {
        let mut port = unsafe { SerialPort::new(0x3F8) };
        port.init();
        *PORT.lock() = Some(port);
        crate::klog::set_console(write);
    }

    fn write(s: &str) {
        use core::fmt::Write;
        if let Some(ref mut port) = *PORT.lock() {
            let _ = port.write_str(s);
        }
    }
}

/// Identify the boot CPU before anything depends on its features.
#[cfg(all(target_arch = "x86_64", target_os = "none"))]
fn cpu_detect() {
    let cpuid = raw_cpuid::CpuId::new();
    let vendor = cpuid
        .get_vendor_info()
        .map(|v| alloc::string::String::from(v.as_str()))
        .unwrap_or_default();
    let invariant_tsc = cpuid
        .get_advanced_power_mgmt_info()
        .map(|i| i.has_invariant_tsc())
        .unwrap_or(false);
    crate::info!("boot: cpu {} (invariant TSC: {})", vendor, invariant_tsc);
    if let Some(tsc) = cpuid.get_tsc_info() {
        if let Some(hz) = tsc.tsc_frequency() {
            crate::time::calibrate(hz / 1_000_000);
        }
    }
}

/// Boot-CPU initialisation, called from the loader entry with the
/// translated handoff.
#[cfg(target_os = "none")]
pub fn kernel_main(info: &BootInfo) -> ! {
    crate::heap::init();
    #[cfg(target_arch = "x86_64")]
    console::init();

    if let Some(level) = info.option("loglevel") {
        let level = match level {
            "error" => crate::klog::LogLevel::Error,
            "warn" => crate::klog::LogLevel::Warn,
            "debug" => crate::klog::LogLevel::Debug,
            "trace" => crate::klog::LogLevel::Trace,
            _ => crate::klog::LogLevel::Info,
        };
        crate::klog::set_level(level);
    }

    crate::time::init();
    crate::mm::init(info);
    #[cfg(target_arch = "x86_64")]
    cpu_detect();
    crate::interrupt::init();
    crate::mm::lrm::init();
    crate::sched::init();

    crate::smp::percpu::publish(0);
    crate::smp::set_online(0, true);

    if let Some(tick_us) = info.option("sched_tick_us").and_then(|v| v.parse::<u64>().ok()) {
        crate::smp::percpu::get(0).set_tick_ns(tick_us * 1000);
    }

    spawn_system_threads();
    start_tick(0);
    start_aps(info);

    crate::info!("boot: core online, {} CPU(s)", crate::smp::online_count());
    crate::arch::irq_enable();
    crate::sched::idle_entry(0);
    unreachable!("idle loop returned");
}

/// Kernel service threads: the reaper (dead-thread stacks), the page
/// writer (dirty-page write-back) and the low-resource worker.
#[cfg(target_os = "none")]
fn spawn_system_threads() {
    let spawned = crate::sched::spawn("reaper", crate::sched::reaper_entry, 0)
        .and(crate::sched::spawn("page-writer", page_writer_entry, 0))
        .and(crate::sched::spawn("lrm-worker", crate::mm::lrm::worker_entry, 0));
    if let Err(err) = spawned {
        crate::fatal!("boot: system thread creation failed: {:?}", err);
    }
}

/// Page-writer thread body: lazily write dirty cached pages back
/// through their owners.
pub fn page_writer_entry(_arg: usize) {
    const BATCH: usize = 32;
    const INTERVAL_NS: u64 = 500_000_000;
    loop {
        let Some(curr) = crate::sched::current() else {
            return;
        };
        let _ = crate::time::timer::sleep_ns(&curr, INTERVAL_NS);
        let cleaned = crate::mm::phys::get().flush_dirty(BATCH);
        if cleaned > 0 {
            crate::debug!("page-writer: cleaned {} pages", cleaned);
        }
    }
}

/// Arm this CPU's periodic scheduler tick.
#[cfg(target_os = "none")]
fn start_tick(cpu: usize) {
    let pcpu = crate::smp::percpu::get(cpu);
    pcpu.timers.arm_periodic(
        pcpu.tick_ns(),
        crate::time::timer::TimerAction::Reschedule,
    );
}

// ---------------------------------------------------------------------
// AP bring-up and TSC synchronization (boot CPU side).
// ---------------------------------------------------------------------

/// TSC handshake stages.
#[cfg(target_os = "none")]
const SYNC_IDLE: u32 = 0;
#[cfg(target_os = "none")]
const SYNC_AP_READY: u32 = 1;
#[cfg(target_os = "none")]
const SYNC_VALUE_POSTED: u32 = 2;
#[cfg(target_os = "none")]
const SYNC_DONE: u32 = 3;

#[cfg(target_os = "none")]
static SYNC_STAGE: AtomicU32 = AtomicU32::new(SYNC_IDLE);
#[cfg(target_os = "none")]
static SYNC_BOOT_TSC: AtomicU64 = AtomicU64::new(0);

/// Launch secondary CPUs named on the command line (`smp=N`).
#[cfg(target_os = "none")]
fn start_aps(info: &BootInfo) {
    let want: usize = info
        .option("smp")
        .and_then(|v| v.parse().ok())
        .unwrap_or(1)
        .min(crate::smp::MAX_CPUS);

    for cpu in 1..want {
        SYNC_STAGE.store(SYNC_IDLE, Ordering::Release);
        crate::arch::x86_64::apboot::start_ap(cpu);

        // Barrier one: wait for the AP to reach the handshake.
        let deadline = crate::time::monotonic_ns() + 1_000_000_000;
        while SYNC_STAGE.load(Ordering::Acquire) != SYNC_AP_READY {
            if crate::time::monotonic_ns() > deadline {
                crate::warn!("boot: CPU {} did not come up", cpu);
                break;
            }
            crate::arch::pause();
        }
        if SYNC_STAGE.load(Ordering::Acquire) != SYNC_AP_READY {
            continue;
        }

        // Post our TSC; the AP computes its offset against it. The gap
        // between these two reads bounds the residual skew at one IPI
        // round-trip.
        SYNC_BOOT_TSC.store(crate::arch::cycle_counter(), Ordering::Release);
        SYNC_STAGE.store(SYNC_VALUE_POSTED, Ordering::Release);

        // Barrier two: AP is synchronized and scheduling.
        while SYNC_STAGE.load(Ordering::Acquire) != SYNC_DONE {
            crate::arch::pause();
        }
        crate::info!("boot: CPU {} online", cpu);
    }
}

/// Per-AP entry, reached from the trampoline in long mode.
#[cfg(target_os = "none")]
pub fn ap_main(cpu: usize) -> ! {
    crate::smp::percpu::publish(cpu);

    // Barrier one: signal readiness, wait for the boot CPU's TSC.
    SYNC_STAGE.store(SYNC_AP_READY, Ordering::Release);
    while SYNC_STAGE.load(Ordering::Acquire) != SYNC_VALUE_POSTED {
        crate::arch::pause();
    }
    let boot_tsc = SYNC_BOOT_TSC.load(Ordering::Acquire);
    let mine = crate::arch::cycle_counter();
    let offset_ns = (boot_tsc as i64 - mine as i64) / 1000; // approx, 1 cycle/ns scale
    crate::smp::percpu::get(cpu)
        .clock_offset
        .store(offset_ns, Ordering::Release);

    crate::smp::set_online(cpu, true);
    start_tick(cpu);

    // Barrier two: hand control back to the boot CPU and schedule.
    SYNC_STAGE.store(SYNC_DONE, Ordering::Release);
    crate::arch::irq_enable();
    crate::sched::idle_entry(0);
    unreachable!("AP idle loop returned");
}

// ---------------------------------------------------------------------
// Hosted test kernel.
// ---------------------------------------------------------------------

/// Bring the kernel up inside an ordinary process: simulated RAM backs
/// the physical allocator and every subsystem initialises exactly as on
/// hardware, minus the privileged glue. The test suites drive the kernel
/// through this entry.
#[cfg(not(target_os = "none"))]
pub mod hosted {
    use crate::bootinfo::{BootInfo, MemoryKind, MemoryRange};

    static INIT: spin::Once<()> = spin::Once::new();

    pub fn init(mem_bytes: usize) {
        INIT.call_once(|| {
            crate::time::init();

            let (base, size) = crate::mm::phys::sim_ram(mem_bytes);
            let mut info = BootInfo::new();
            let pushed = info.memory.push(MemoryRange {
                base,
                size,
                kind: MemoryKind::Free,
            });
            if pushed.is_err() {
                panic!("hosted boot: memory map overflow");
            }

            crate::mm::init(&info);
            crate::interrupt::init();
            crate::mm::lrm::init();
            crate::sched::init();
            crate::smp::percpu::publish(0);
            crate::smp::set_online(0, true);
        });
    }
}
