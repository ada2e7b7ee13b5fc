//! Kernel heap (global allocator)
//!
//! Bare metal only; hosted builds use the host allocator. A fixed early
//! heap (linked-list allocator over a static region) carries boot-time
//! allocation; once the slab layer is up, small allocations route
//! through per-size kmalloc caches and everything else stays on the
//! early heap.

use crate::mm::phys::AllocFlags;
use crate::mm::slab::{CacheFlags, SlabCache};
use core::alloc::{GlobalAlloc, Layout};
use core::sync::atomic::{AtomicBool, Ordering};
use linked_list_allocator::LockedHeap;

const EARLY_HEAP_SIZE: usize = 16 * 1024 * 1024;

#[repr(align(4096))]
struct EarlyHeap([u8; EARLY_HEAP_SIZE]);

static mut EARLY_HEAP: EarlyHeap = EarlyHeap([0; EARLY_HEAP_SIZE]);

static HEAP: LockedHeap = LockedHeap::empty();
static SLAB_READY: AtomicBool = AtomicBool::new(false);

/// kmalloc size classes served by slab caches.
const KMALLOC_SIZES: [usize; 5] = [16, 32, 64, 128, 256];

static KMALLOC: spin::Once<[&'static SlabCache; 5]> = spin::Once::new();

pub fn init() {
    unsafe {
        let base = core::ptr::addr_of_mut!(EARLY_HEAP) as *mut u8;
        HEAP.lock().init(base, EARLY_HEAP_SIZE);
    }
}

/// Create the kmalloc caches and start routing small allocations
/// through them. Called at the end of mm bring-up.
pub fn enable_slab() {
    KMALLOC.call_once(|| {
        let mut caches: [Option<&'static SlabCache>; 5] = [None; 5];
        for (i, &size) in KMALLOC_SIZES.iter().enumerate() {
            let created = SlabCache::create(
                kmalloc_name(size),
                size,
                8,
                None,
                None,
                core::ptr::null_mut(),
                CacheFlags::empty(),
                // Growth failures fall back to the early heap; never
                // escalate them.
                AllocFlags::empty(),
            );
            match created {
                Ok(cache) => caches[i] = Some(cache),
                Err(err) => crate::fatal!("heap: kmalloc-{} cache failed: {:?}", size, err),
            }
        }
        caches.map(|c| match c {
            Some(c) => c,
            None => crate::fatal!("heap: kmalloc cache missing"),
        })
    });
    SLAB_READY.store(true, Ordering::Release);
    crate::info!("heap: kmalloc caches online");
}

const fn kmalloc_name(size: usize) -> &'static str {
    match size {
        16 => "kmalloc-16",
        32 => "kmalloc-32",
        64 => "kmalloc-64",
        128 => "kmalloc-128",
        _ => "kmalloc-256",
    }
}

fn class_index(layout: Layout) -> Option<usize> {
    if layout.align() > 8 {
        return None;
    }
    KMALLOC_SIZES.iter().position(|&s| layout.size() <= s)
}

fn in_early_heap(ptr: *mut u8) -> bool {
    let base = unsafe { core::ptr::addr_of!(EARLY_HEAP) as usize };
    let addr = ptr as usize;
    addr >= base && addr < base + EARLY_HEAP_SIZE
}

struct KernelAllocator;

unsafe impl GlobalAlloc for KernelAllocator {
    unsafe fn alloc(&self, layout: Layout) -> *mut u8 {
        if SLAB_READY.load(Ordering::Acquire) {
            if let (Some(idx), Some(caches)) = (class_index(layout), KMALLOC.get()) {
                if let Ok(ptr) = caches[idx].alloc(AllocFlags::empty()) {
                    return ptr;
                }
            }
        }
        HEAP.lock()
            .allocate_first_fit(layout)
            .map(|nn| nn.as_ptr())
            .unwrap_or(core::ptr::null_mut())
    }

    unsafe fn dealloc(&self, ptr: *mut u8, layout: Layout) {
        if !in_early_heap(ptr) {
            if let (Some(idx), Some(caches)) = (class_index(layout), KMALLOC.get()) {
                caches[idx].free(ptr);
                return;
            }
        }
        if let Some(nn) = core::ptr::NonNull::new(ptr) {
            HEAP.lock().deallocate(nn, layout);
        }
    }
}

#[global_allocator]
static ALLOCATOR: KernelAllocator = KernelAllocator;
