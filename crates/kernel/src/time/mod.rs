//! Time keeping
//!
//! Monotonic time derives from the CPU cycle counter, scaled by the
//! calibrated frequency plus a per-CPU offset established during AP
//! bring-up, so every CPU's clock reads the same wall value. One clock
//! source is active per system and drives the per-CPU timer lists.

pub mod timer;

use core::sync::atomic::{AtomicU64, Ordering};

/// Cycle count at boot; monotonic time is measured from here.
static BOOT_CYCLES: AtomicU64 = AtomicU64::new(0);

/// Calibrated cycle rate. Defaults to 1 GHz until calibration runs.
static CYCLES_PER_US: AtomicU64 = AtomicU64::new(1000);

/// Realtime clock at boot (nanoseconds since the Unix epoch), from the
/// loader or RTC; zero when unknown.
static BOOT_UNIX_NS: AtomicU64 = AtomicU64::new(0);

/// How the active clock source delivers events.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClockKind {
    /// Fixed tick length in nanoseconds.
    Periodic(u64),
    /// Programmed with each next deadline.
    OneShot,
}

/// A hardware tick source. One is active per system.
pub trait ClockSource: Send + Sync {
    fn name(&self) -> &'static str;
    fn kind(&self) -> ClockKind;
    fn enable(&self) {}
    fn disable(&self) {}
    /// For one-shot sources: program the next deadline, nanoseconds from
    /// now.
    fn prepare(&self, _deadline_ns: u64) {}
}

static SOURCE: spin::RwLock<Option<&'static dyn ClockSource>> = spin::RwLock::new(None);

pub fn set_source(source: &'static dyn ClockSource) {
    crate::info!("time: clock source {} ({:?})", source.name(), source.kind());
    source.enable();
    *SOURCE.write() = Some(source);
}

pub fn source_kind() -> Option<ClockKind> {
    SOURCE.read().map(|s| s.kind())
}

/// Ask the active one-shot source for an event in `ns` nanoseconds.
pub(crate) fn program_source(ns: u64) {
    if let Some(source) = *SOURCE.read() {
        if source.kind() == ClockKind::OneShot {
            source.prepare(ns);
        }
    }
}

pub fn init() {
    BOOT_CYCLES.store(crate::arch::cycle_counter(), Ordering::Release);
}

/// Record the calibrated cycle rate (boot CPU measures it against a
/// fixed-frequency reference during bring-up).
pub fn calibrate(cycles_per_us: u64) {
    if cycles_per_us > 0 {
        CYCLES_PER_US.store(cycles_per_us, Ordering::Release);
    }
}

pub fn set_boot_unix_ns(ns: u64) {
    BOOT_UNIX_NS.store(ns, Ordering::Release);
}

/// Monotonic nanoseconds since boot, consistent across CPUs.
pub fn monotonic_ns() -> u64 {
    let cycles = crate::arch::cycle_counter()
        .saturating_sub(BOOT_CYCLES.load(Ordering::Acquire));
    let rate = CYCLES_PER_US.load(Ordering::Acquire).max(1);
    let raw = cycles.saturating_mul(1000) / rate;
    let offset = crate::smp::percpu::current()
        .clock_offset
        .load(Ordering::Acquire);
    raw.saturating_add_signed(offset)
}

pub fn monotonic_us() -> u64 {
    monotonic_ns() / 1000
}

/// Wall-clock nanoseconds since the Unix epoch (boot estimate plus
/// monotonic time).
pub fn realtime_ns() -> u64 {
    BOOT_UNIX_NS.load(Ordering::Acquire).saturating_add(monotonic_ns())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn monotonic_never_decreases() {
        let a = monotonic_ns();
        let b = monotonic_ns();
        assert!(b >= a);
    }
}
