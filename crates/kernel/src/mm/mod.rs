//! Memory management
//!
//! Layered bottom-up: physical page allocator (`phys`), kernel virtual
//! memory (`arena`, `kvmem`, `slab`), MMU contexts (`mmu`), and the user
//! address-space / page-fault layer (`region`, `fault`). The low-resource
//! manager (`lrm`) drives cache shrinking when memory runs short.

pub mod arena;
pub mod fault;
pub mod kvmem;
pub mod lrm;
pub mod mmu;
pub mod page;
pub mod phys;
pub mod region;
pub mod slab;

pub use page::{PhysAddr, PAGE_SHIFT, PAGE_SIZE};

/// Start of the kernel half of the address space.
pub const KERNEL_BASE: u64 = 0xFFFF_8000_0000_0000;

/// Base of the physical direct map (bare metal only).
pub const PHYS_MAP_BASE: u64 = 0xFFFF_8800_0000_0000;

/// Kernel heap virtual range, managed by the `kvmem` arenas.
pub const KERNEL_HEAP_BASE: u64 = 0xFFFF_9000_0000_0000;
pub const KERNEL_HEAP_SIZE: u64 = 64 * 1024 * 1024 * 1024;

/// End of the user half (exclusive). Canonical lower-half addresses only.
pub const USER_TOP: u64 = 0x0000_8000_0000_0000;

#[inline]
pub fn is_user_address(addr: u64) -> bool {
    addr < USER_TOP
}

#[inline]
pub fn is_kernel_address(addr: u64) -> bool {
    addr >= KERNEL_BASE
}

/// Map a physical address to a kernel-accessible pointer.
///
/// Bare metal goes through the direct map; the hosted test kernel hands
/// out "physical" addresses that are already host pointers into the
/// simulated RAM block, so the mapping is the identity.
#[inline]
pub fn phys_to_virt(pa: PhysAddr) -> *mut u8 {
    #[cfg(target_os = "none")]
    {
        (PHYS_MAP_BASE + pa) as *mut u8
    }
    #[cfg(not(target_os = "none"))]
    {
        pa as *mut u8
    }
}

/// Bring up the memory subsystems in dependency order.
pub fn init(info: &crate::bootinfo::BootInfo) {
    let ranges: heapless::Vec<(PhysAddr, u64), { crate::bootinfo::MAX_MEMORY_RANGES }> = info
        .free_ranges()
        .map(|r| (r.base, r.size))
        .collect();
    phys::init(&ranges);
    mmu::init();
    kvmem::init();
    slab::init();
    #[cfg(target_os = "none")]
    crate::heap::enable_slab();
    crate::info!("mm: online, {} MiB free", phys::stats().free_pages * PAGE_SIZE / (1024 * 1024));
}
