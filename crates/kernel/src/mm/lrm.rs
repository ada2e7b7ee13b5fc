//! Low-resource manager
//!
//! Watches physical memory and kernel virtual space, classifies each
//! into Ok/Advisory/Low/Critical bands, and drives registered shrink
//! handlers in priority order when any resource drops below Ok. A
//! dedicated worker thread runs the periodic pass; callers under
//! allocation pressure run a synchronous pass in their own context via
//! [`reclaim`].

use crate::sync::mutex::Locked;
use alloc::vec::Vec;

/// Severity bands, worst last.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum ResourceLevel {
    Ok,
    Advisory,
    Low,
    Critical,
}

bitflags::bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct ResourceTypes: u32 {
        /// Physical page pools.
        const PHYSICAL = 1 << 0;
        /// Kernel virtual space.
        const KVA = 1 << 1;
    }
}

/// A registered shrink callback. Returns bytes released.
pub struct LrmHandler {
    pub name: &'static str,
    /// Lower runs earlier.
    pub priority: u8,
    pub types: ResourceTypes,
    pub func: fn(ResourceTypes, ResourceLevel) -> usize,
}

static HANDLERS: Locked<Vec<LrmHandler>> = Locked::new("lrm-handlers", Vec::new());

/// Worker interval: 1 second.
const WORKER_INTERVAL_NS: u64 = 1_000_000_000;

pub fn register(handler: LrmHandler) {
    let mut handlers = HANDLERS.lock();
    let pos = handlers.partition_point(|h| h.priority <= handler.priority);
    handlers.insert(pos, handler);
}

/// Classify free-fraction (percent) into a band.
fn band(free_percent: usize) -> ResourceLevel {
    match free_percent {
        0..=4 => ResourceLevel::Critical,
        5..=9 => ResourceLevel::Low,
        10..=14 => ResourceLevel::Advisory,
        _ => ResourceLevel::Ok,
    }
}

/// Current level of one resource.
pub fn level_of(resource: ResourceTypes) -> ResourceLevel {
    if resource.contains(ResourceTypes::PHYSICAL) {
        let stats = super::phys::stats();
        if stats.total_pages == 0 {
            return ResourceLevel::Ok;
        }
        band(stats.free_pages * 100 / stats.total_pages)
    } else {
        let (total, used) = super::kvmem::va_stats();
        if total == 0 {
            return ResourceLevel::Ok;
        }
        band((total - used) * 100 / total)
    }
}

/// Run one shrink pass for `types`. Handlers run in priority order;
/// each resource is re-measured after every handler so the pass stops
/// as soon as it recovers. Returns total bytes released.
pub fn run_pass(types: ResourceTypes) -> usize {
    let mut released = 0;
    for resource in [ResourceTypes::PHYSICAL, ResourceTypes::KVA] {
        if !types.contains(resource) {
            continue;
        }
        let mut level = level_of(resource);
        if level == ResourceLevel::Ok {
            continue;
        }
        crate::info!("lrm: {:?} at {:?}, shrinking", resource, level);
        let handlers = HANDLERS.lock();
        for handler in handlers.iter() {
            if !handler.types.intersects(resource) {
                continue;
            }
            released += (handler.func)(resource, level);
            level = level_of(resource);
            if level == ResourceLevel::Ok {
                break;
            }
        }
    }
    released
}

/// Immediate synchronous pass for a caller facing allocation pressure;
/// returns once the pass completes.
pub fn reclaim(types: ResourceTypes) -> usize {
    run_pass(types)
}

/// Worker thread body: periodic passes whenever anything is below Ok.
pub fn worker_entry(_arg: usize) {
    loop {
        let Some(curr) = crate::sched::current() else {
            return;
        };
        let _ = crate::time::timer::sleep_ns(&curr, WORKER_INTERVAL_NS);
        if level_of(ResourceTypes::PHYSICAL) != ResourceLevel::Ok
            || level_of(ResourceTypes::KVA) != ResourceLevel::Ok
        {
            run_pass(ResourceTypes::PHYSICAL | ResourceTypes::KVA);
        }
    }
}

fn shrink_caches(_resource: ResourceTypes, _level: ResourceLevel) -> usize {
    super::slab::reclaim_all() + super::kvmem::reclaim()
}

pub fn init() {
    register(LrmHandler {
        name: "slab-caches",
        priority: 10,
        types: ResourceTypes::PHYSICAL | ResourceTypes::KVA,
        func: shrink_caches,
    });
    crate::info!("lrm: online");
}

#[cfg(test)]
mod tests {
    use super::*;
    use core::sync::atomic::{AtomicUsize, Ordering};

    static CALLS: AtomicUsize = AtomicUsize::new(0);

    fn fake_shrink(_r: ResourceTypes, _l: ResourceLevel) -> usize {
        CALLS.fetch_add(1, Ordering::SeqCst);
        0
    }

    #[test]
    fn bands_classify_pressure() {
        assert_eq!(band(50), ResourceLevel::Ok);
        assert_eq!(band(14), ResourceLevel::Advisory);
        assert_eq!(band(9), ResourceLevel::Low);
        assert_eq!(band(2), ResourceLevel::Critical);
    }

    #[test]
    fn handlers_sorted_by_priority() {
        crate::testing::init_kernel();
        register(LrmHandler {
            name: "late",
            priority: 200,
            types: ResourceTypes::PHYSICAL,
            func: fake_shrink,
        });
        register(LrmHandler {
            name: "early",
            priority: 1,
            types: ResourceTypes::PHYSICAL,
            func: fake_shrink,
        });
        let handlers = HANDLERS.lock();
        let late_pos = handlers.iter().position(|h| h.name == "late").unwrap();
        let early_pos = handlers.iter().position(|h| h.name == "early").unwrap();
        assert!(early_pos < late_pos);
    }

    #[test]
    fn healthy_resources_skip_handlers() {
        crate::testing::init_kernel();
        // The hosted test pool is far above the pressure bands, so a
        // pass must not invoke anything.
        CALLS.store(0, Ordering::SeqCst);
        run_pass(ResourceTypes::PHYSICAL);
        assert_eq!(CALLS.load(Ordering::SeqCst), 0);
    }
}
