//! Kernel virtual memory
//!
//! Three layers over the kernel heap range: the raw arena carves the
//! virtual range into spans, the va arena imports from it and adds
//! quantum caches for small-span speed, and the backed layer allocates
//! physical pages for each span and maps them into the kernel context.
//! Freeing releases the backing pages before the span.

use super::arena::Arena;
use super::mmu::{MapFlags, Protection};
use super::page::{PhysAddr, PAGE_SIZE};
use super::phys::AllocFlags;
use crate::status::Result;
use lazy_static::lazy_static;

lazy_static! {
    /// Carves the kernel heap virtual range. No backing, no caching.
    static ref RAW_ARENA: Arena = Arena::new(
        "kvmem-raw",
        Some((
            super::KERNEL_HEAP_BASE as usize,
            super::KERNEL_HEAP_SIZE as usize
        )),
        PAGE_SIZE,
        None,
        false,
    );

    /// Imports from raw; quantum caches serve small spans.
    static ref VA_ARENA: Arena = Arena::new("kvmem-va", None, PAGE_SIZE, Some(&*RAW_ARENA), true);
}

/// Bookkeeping from pointer back to (va span, phys base, size) on hosted
/// builds, where the returned pointer is the direct-map address.
#[cfg(not(target_os = "none"))]
static PTR_MAP: crate::sync::spinlock::SpinLock<
    alloc::collections::BTreeMap<usize, (usize, PhysAddr, usize)>,
> = crate::sync::spinlock::SpinLock::new(alloc::collections::BTreeMap::new());

pub fn init() {
    lazy_static::initialize(&RAW_ARENA);
    lazy_static::initialize(&VA_ARENA);
    crate::info!(
        "kvmem: heap range {:#x}..{:#x}",
        super::KERNEL_HEAP_BASE,
        super::KERNEL_HEAP_BASE + super::KERNEL_HEAP_SIZE
    );
}

/// Allocate unbacked kernel virtual space.
pub fn kva_alloc(size: usize) -> Result<usize> {
    VA_ARENA.alloc(size)
}

pub fn kva_free(base: usize, size: usize) {
    VA_ARENA.free(base, size)
}

/// Allocate `size` bytes of kernel memory backed by anonymous pages,
/// mapped read-write-execute in the kernel context.
pub fn alloc(size: usize, flags: AllocFlags) -> Result<*mut u8> {
    let size = (size + PAGE_SIZE - 1) & !(PAGE_SIZE - 1);
    let pages = size / PAGE_SIZE;
    let va = VA_ARENA.alloc(size)?;

    #[cfg(target_os = "none")]
    {
        let ctx = super::mmu::kernel_context();
        ctx.lock();
        let mut mapped = 0;
        let result = loop {
            if mapped == pages {
                break Ok(());
            }
            let pa = match super::phys::alloc(flags) {
                Ok(pa) => pa,
                Err(err) => break Err(err),
            };
            let virt = (va + mapped * PAGE_SIZE) as u64;
            match ctx.map(virt, pa, Protection::RWX, MapFlags::empty()) {
                Ok(()) => mapped += 1,
                Err(err) => {
                    super::phys::free(pa);
                    break Err(err);
                }
            }
        };
        if let Err(err) = result {
            // Unwind the partial span; no mapping survives a failure.
            for i in 0..mapped {
                let virt = (va + i * PAGE_SIZE) as u64;
                if let Ok((pa, true)) = ctx.unmap(virt, false) {
                    super::phys::free(pa);
                }
            }
            ctx.unlock();
            VA_ARENA.free(va, size);
            return Err(err);
        }
        ctx.unlock();
        Ok(va as *mut u8)
    }

    #[cfg(not(target_os = "none"))]
    {
        // Hosted: the backing must be host-addressable, so take one
        // contiguous run and hand out its direct-map address; the va
        // span still tracks the allocation in the arena.
        let pa = match super::phys::alloc_range(pages, 1, 0, 0, 0, 0, flags) {
            Ok(pa) => pa,
            Err(err) => {
                VA_ARENA.free(va, size);
                return Err(err);
            }
        };
        let ctx = super::mmu::kernel_context();
        ctx.lock();
        for i in 0..pages {
            let virt = (va + i * PAGE_SIZE) as u64;
            let _ = ctx.map(
                virt,
                pa + (i * PAGE_SIZE) as u64,
                Protection::RWX,
                MapFlags::empty(),
            );
        }
        ctx.unlock();
        let ptr = super::phys_to_virt(pa);
        PTR_MAP.lock().insert(ptr as usize, (va, pa, size));
        Ok(ptr)
    }
}

/// Free a span from [`alloc`]. Backing pages are released before the
/// virtual span.
pub fn free(ptr: *mut u8, size: usize) {
    let size = (size + PAGE_SIZE - 1) & !(PAGE_SIZE - 1);
    let pages = size / PAGE_SIZE;

    #[cfg(target_os = "none")]
    {
        let va = ptr as usize;
        let ctx = super::mmu::kernel_context();
        ctx.lock();
        for i in 0..pages {
            let virt = (va + i * PAGE_SIZE) as u64;
            if let Ok((pa, true)) = ctx.unmap(virt, true) {
                super::phys::free(pa);
            }
        }
        ctx.unlock();
        VA_ARENA.free(va, size);
    }

    #[cfg(not(target_os = "none"))]
    {
        let Some((va, pa, recorded)) = PTR_MAP.lock().remove(&(ptr as usize)) else {
            crate::fatal!("kvmem: free of unknown pointer {:p}", ptr);
        };
        if recorded != size {
            crate::fatal!("kvmem: free size {:#x} != allocated {:#x}", size, recorded);
        }
        let ctx = super::mmu::kernel_context();
        ctx.lock();
        for i in 0..pages {
            let _ = ctx.unmap((va + i * PAGE_SIZE) as u64, true);
        }
        ctx.unlock();
        super::phys::free_range(pa, pages);
        VA_ARENA.free(va, size);
    }
}

/// Hand cached and fully-free imported spans back under memory pressure.
pub fn reclaim() -> usize {
    VA_ARENA.reclaim()
}

/// (total, used) bytes of kernel virtual space.
pub fn va_stats() -> (usize, usize) {
    let stats = RAW_ARENA.stats();
    (stats.total, stats.used)
}
