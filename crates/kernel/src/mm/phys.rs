//! Physical page allocator
//!
//! Physical memory is partitioned into three tiers keyed by the highest
//! address they can serve: below 16 MiB (legacy DMA), below 4 GiB (32-bit
//! DMA) and everything above. Each tier is a buddy allocator over
//! power-of-two page blocks. Single-page allocations prefer the highest
//! tier the caller's constraints allow, leaving the scarce low tiers for
//! the callers that actually need them.
//!
//! One descriptor per frame lives in the [`PhysicalMemory`] object for the
//! whole run; the sum over all page states always equals the frame total.

use super::page::{
    pa_to_pfn, page_align_down, page_align_up, pfn_to_pa, Page, PageFlags, PageState, Pfn,
    PhysAddr, PAGE_SIZE,
};
use crate::status::{Result, Status};
use crate::sync::spinlock::SpinLock;
use alloc::boxed::Box;
use alloc::collections::VecDeque;
use alloc::vec::Vec;
use core::sync::atomic::{AtomicUsize, Ordering};

/// Maximum buddy order (2^10 pages = 4 MiB blocks).
pub const MAX_ORDER: u8 = 10;

/// Tier boundaries, in frames.
const DMA16_LIMIT_PFN: Pfn = (16 * 1024 * 1024) >> super::PAGE_SHIFT;
const DMA32_LIMIT_PFN: Pfn = (4 * 1024 * 1024 * 1024u64 >> super::PAGE_SHIFT) as Pfn;

/// Which free-list pool a frame belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(usize)]
pub enum MemoryTier {
    /// Below 16 MiB; serves legacy DMA.
    Dma16 = 0,
    /// Below 4 GiB; serves 32-bit DMA.
    Dma32 = 1,
    /// No address constraint.
    High = 2,
}

impl MemoryTier {
    pub fn of_pfn(pfn: Pfn) -> MemoryTier {
        if pfn < DMA16_LIMIT_PFN {
            MemoryTier::Dma16
        } else if pfn < DMA32_LIMIT_PFN {
            MemoryTier::Dma32
        } else {
            MemoryTier::High
        }
    }
}

bitflags::bitflags! {
    /// Allocation behaviour flags.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct AllocFlags: u32 {
        /// Failure is fatal; for allocations the kernel cannot survive
        /// without (boot-time structures).
        const BOOT = 1 << 0;
        /// Zero the pages before returning them.
        const ZERO = 1 << 1;
        /// Caller may sleep: allowed to trigger a synchronous reclaim
        /// pass and retry before reporting exhaustion.
        const WAIT = 1 << 2;
        /// Must be servable by legacy DMA (below 16 MiB).
        const DMA16 = 1 << 3;
        /// Must be servable by 32-bit DMA (below 4 GiB).
        const DMA32 = 1 << 4;
    }
}

/// Totals per page state. The grand total is invariant after init.
#[derive(Debug, Clone, Copy, Default)]
pub struct PhysStats {
    pub total_pages: usize,
    pub free_pages: usize,
    pub allocated_pages: usize,
    pub cached_clean_pages: usize,
    pub cached_dirty_pages: usize,
}

/// Flush callback of a page-cache owner; invoked by the page writer for
/// each CachedDirty page the owner holds.
pub trait PageCacheOwner: Send + Sync {
    fn flush(&self, pa: PhysAddr, page: &Page) -> Result<()>;
}

/// One tier's buddy state: free lists of block-head PFNs per order.
struct Tier {
    free_lists: [Vec<Pfn>; MAX_ORDER as usize + 1],
}

impl Tier {
    const fn new() -> Self {
        const EMPTY: Vec<Pfn> = Vec::new();
        Self {
            free_lists: [EMPTY; MAX_ORDER as usize + 1],
        }
    }
}

/// The process-wide physical memory object.
pub struct PhysicalMemory {
    base_pfn: Pfn,
    pages: Box<[Page]>,
    tiers: [SpinLock<Tier>; 3],
    free: AtomicUsize,
    allocated: AtomicUsize,
    cached_clean: AtomicUsize,
    cached_dirty: AtomicUsize,
    total: usize,
    /// PFNs that may need write-back, drained by the page writer.
    dirty_queue: SpinLock<VecDeque<Pfn>>,
    owners: SpinLock<Vec<&'static dyn PageCacheOwner>>,
}

impl PhysicalMemory {
    /// Build descriptors and free lists from the loader's usable ranges.
    pub fn new(ranges: &[(PhysAddr, u64)]) -> Self {
        let mut min_pfn = Pfn::MAX;
        let mut max_pfn = 0;
        for &(base, size) in ranges {
            let start = pa_to_pfn(page_align_up(base));
            let end = pa_to_pfn(page_align_down(base + size));
            if start < end {
                min_pfn = min_pfn.min(start);
                max_pfn = max_pfn.max(end);
            }
        }
        if min_pfn >= max_pfn {
            crate::fatal!("phys: no usable memory ranges");
        }

        let span = max_pfn - min_pfn;
        let mut pages = Vec::with_capacity(span);
        for _ in 0..span {
            pages.push(Page::new());
        }

        let mem = Self {
            base_pfn: min_pfn,
            pages: pages.into_boxed_slice(),
            tiers: [
                SpinLock::new(Tier::new()),
                SpinLock::new(Tier::new()),
                SpinLock::new(Tier::new()),
            ],
            free: AtomicUsize::new(0),
            allocated: AtomicUsize::new(0),
            cached_clean: AtomicUsize::new(0),
            cached_dirty: AtomicUsize::new(0),
            total: 0,
            dirty_queue: SpinLock::new(VecDeque::new()),
            owners: SpinLock::new(Vec::new()),
        };

        let mut total = 0;
        for &(base, size) in ranges {
            let start = pa_to_pfn(page_align_up(base));
            let end = pa_to_pfn(page_align_down(base + size));
            if start >= end {
                continue;
            }
            // A range may straddle a tier boundary; split it there.
            let mut pfn = start;
            while pfn < end {
                let limit = match MemoryTier::of_pfn(pfn) {
                    MemoryTier::Dma16 => DMA16_LIMIT_PFN.min(end),
                    MemoryTier::Dma32 => DMA32_LIMIT_PFN.min(end),
                    MemoryTier::High => end,
                };
                mem.add_free_run(pfn, limit - pfn);
                total += limit - pfn;
                pfn = limit;
            }
        }

        let mut mem = mem;
        mem.total = total;
        mem.free.store(total, Ordering::Release);
        mem
    }

    fn page(&self, pfn: Pfn) -> Option<&Page> {
        pfn.checked_sub(self.base_pfn)
            .and_then(|idx| self.pages.get(idx))
    }

    /// Descriptor lookup, constant time from address.
    pub fn lookup(&self, pa: PhysAddr) -> Option<&Page> {
        self.page(pa_to_pfn(pa))
    }

    /// Insert a run of frames into the free lists as maximal aligned
    /// power-of-two blocks. Descriptor states become Free.
    fn add_free_run(&self, start: Pfn, count: usize) {
        let mut pfn = start;
        let mut remaining = count;
        let tier = MemoryTier::of_pfn(start) as usize;
        let mut t = self.tiers[tier].lock();
        while remaining > 0 {
            let mut order = 0u8;
            while order < MAX_ORDER {
                let block = 1usize << (order + 1);
                if block > remaining || pfn & (block - 1) != 0 {
                    break;
                }
                order += 1;
            }
            self.insert_free_block(&mut *t, pfn, order);
            pfn += 1 << order;
            remaining -= 1 << order;
        }
    }

    fn insert_free_block(&self, tier: &mut Tier, pfn: Pfn, order: u8) {
        for i in 0..(1usize << order) {
            if let Some(p) = self.page(pfn + i) {
                p.store_state(PageState::Free);
                p.clear_flag(PageFlags::BUDDY);
                p.set_refcount(0);
            }
        }
        if let Some(head) = self.page(pfn) {
            head.order.store(order, Ordering::Release);
            head.set_flag(PageFlags::BUDDY);
        }
        tier.free_lists[order as usize].push(pfn);
    }

    /// Pop a block of at least `order`, splitting larger blocks.
    fn take_block(&self, tier_idx: usize, order: u8) -> Option<Pfn> {
        let mut tier = self.tiers[tier_idx].lock();
        let mut current = order;
        while current <= MAX_ORDER {
            if let Some(pfn) = tier.free_lists[current as usize].pop() {
                if let Some(head) = self.page(pfn) {
                    head.clear_flag(PageFlags::BUDDY);
                }
                while current > order {
                    current -= 1;
                    self.insert_free_block(&mut *tier, pfn + (1 << current), current);
                }
                return Some(pfn);
            }
            current += 1;
        }
        None
    }

    /// Return a block to its tier, coalescing with free buddies.
    fn release_block(&self, mut pfn: Pfn, mut order: u8) {
        let tier_idx = MemoryTier::of_pfn(pfn) as usize;
        let mut tier = self.tiers[tier_idx].lock();
        while order < MAX_ORDER {
            let buddy = pfn ^ (1usize << order);
            // Coalescing must not cross a tier boundary.
            if MemoryTier::of_pfn(buddy) as usize != tier_idx {
                break;
            }
            let buddy_free = self.page(buddy).is_some_and(|p| {
                p.state() == PageState::Free
                    && p.flags().contains(PageFlags::BUDDY)
                    && p.order.load(Ordering::Acquire) == order
            });
            if !buddy_free {
                break;
            }
            let list = &mut tier.free_lists[order as usize];
            match list.iter().position(|&p| p == buddy) {
                Some(pos) => {
                    list.swap_remove(pos);
                }
                // Descriptor said free but the head is mid-operation on
                // another CPU; stop coalescing here.
                None => break,
            }
            if let Some(p) = self.page(buddy) {
                p.clear_flag(PageFlags::BUDDY);
            }
            pfn = pfn.min(buddy);
            order += 1;
        }
        self.insert_free_block(&mut *tier, pfn, order);
    }

    fn counter(&self, state: PageState) -> &AtomicUsize {
        match state {
            PageState::Free => &self.free,
            PageState::Allocated => &self.allocated,
            PageState::CachedClean => &self.cached_clean,
            PageState::CachedDirty => &self.cached_dirty,
        }
    }

    fn account(&self, from: PageState, to: PageState, count: usize) {
        if from != to {
            self.counter(from).fetch_sub(count, Ordering::AcqRel);
            self.counter(to).fetch_add(count, Ordering::AcqRel);
        }
    }

    /// Candidate tiers for an allocation, most preferred first.
    fn tier_order(flags: AllocFlags) -> &'static [usize] {
        if flags.contains(AllocFlags::DMA16) {
            &[MemoryTier::Dma16 as usize]
        } else if flags.contains(AllocFlags::DMA32) {
            &[MemoryTier::Dma32 as usize, MemoryTier::Dma16 as usize]
        } else {
            &[
                MemoryTier::High as usize,
                MemoryTier::Dma32 as usize,
                MemoryTier::Dma16 as usize,
            ]
        }
    }

    /// Allocate a single page.
    pub fn alloc(&self, flags: AllocFlags) -> Result<PhysAddr> {
        self.alloc_pages(0, flags)
    }

    /// Allocate a naturally aligned block of 2^order pages.
    pub fn alloc_pages(&self, order: u8, flags: AllocFlags) -> Result<PhysAddr> {
        if order > MAX_ORDER {
            return Err(Status::InvalidArg);
        }

        let mut attempt = 0;
        let pfn = loop {
            let found = Self::tier_order(flags)
                .iter()
                .find_map(|&t| self.take_block(t, order));
            match found {
                Some(pfn) => break pfn,
                None if flags.contains(AllocFlags::WAIT) && attempt == 0 => {
                    // Suspension point: run a synchronous reclaim pass.
                    super::lrm::reclaim(super::lrm::ResourceTypes::PHYSICAL);
                    attempt += 1;
                }
                None => {
                    if flags.contains(AllocFlags::BOOT) {
                        crate::fatal!("phys: boot allocation of order {} failed", order);
                    }
                    crate::warn!("phys: allocation failed (order {})", order);
                    return Err(Status::NoMemory);
                }
            }
        };

        let count = 1usize << order;
        for i in 0..count {
            if let Some(p) = self.page(pfn + i) {
                p.store_state(PageState::Allocated);
            }
        }
        if let Some(head) = self.page(pfn) {
            head.order.store(order, Ordering::Release);
            head.set_refcount(1);
        }
        self.account(PageState::Free, PageState::Allocated, count);

        let pa = pfn_to_pa(pfn);
        if flags.contains(AllocFlags::ZERO) {
            unsafe {
                core::ptr::write_bytes(super::phys_to_virt(pa), 0, count * PAGE_SIZE);
            }
        }
        Ok(pa)
    }

    /// Free a single page allocated with [`alloc`].
    pub fn free(&self, pa: PhysAddr) {
        self.free_pages(pa, 0);
    }

    /// Drop a reference to a block; frees it when the count hits zero.
    pub fn free_pages(&self, pa: PhysAddr, order: u8) {
        let pfn = pa_to_pfn(pa);
        let Some(head) = self.page(pfn) else {
            crate::fatal!("phys: free of unknown address {:#x}", pa);
        };
        if head.is_busy() {
            crate::fatal!("phys: free of busy page {:#x}", pa);
        }
        if head.state() == PageState::Free {
            crate::fatal!("phys: double free at {:#x}", pa);
        }
        if head.put() > 0 {
            return;
        }

        let count = 1usize << order;
        let state = head.state();
        head.set_owner(None);
        self.account(state, PageState::Free, count);
        self.release_block(pfn, order);
    }

    /// Constrained multi-page allocation for DMA setup: `count` contiguous
    /// pages, start aligned to `align` pages plus `phase`, not crossing any
    /// `boundary`-page multiple, inside `[min_pa, max_pa)`.
    pub fn alloc_range(
        &self,
        count: usize,
        align: usize,
        phase: usize,
        boundary: usize,
        min_pa: PhysAddr,
        max_pa: PhysAddr,
        flags: AllocFlags,
    ) -> Result<PhysAddr> {
        if count == 0 || (boundary != 0 && count > boundary) {
            return Err(Status::InvalidArg);
        }
        let align = align.max(1);
        if phase >= align {
            return Err(Status::InvalidArg);
        }
        let min_pfn = pa_to_pfn(page_align_up(min_pa));
        let max_pfn = if max_pa == 0 {
            Pfn::MAX
        } else {
            pa_to_pfn(page_align_down(max_pa))
        };

        for &tier_idx in Self::tier_order(flags) {
            if let Some(pfn) = self.carve_range(tier_idx, count, align, phase, boundary, min_pfn, max_pfn) {
                for i in 0..count {
                    if let Some(p) = self.page(pfn + i) {
                        p.store_state(PageState::Allocated);
                    }
                }
                if let Some(head) = self.page(pfn) {
                    head.set_refcount(1);
                }
                self.account(PageState::Free, PageState::Allocated, count);
                let pa = pfn_to_pa(pfn);
                if flags.contains(AllocFlags::ZERO) {
                    unsafe {
                        core::ptr::write_bytes(super::phys_to_virt(pa), 0, count * PAGE_SIZE);
                    }
                }
                return Ok(pa);
            }
        }

        if flags.contains(AllocFlags::BOOT) {
            crate::fatal!("phys: boot range allocation of {} pages failed", count);
        }
        Err(Status::NoMemory)
    }

    /// Search one tier for a block that can satisfy the constraints, carve
    /// the requested run out of it and return the trimmings to the lists.
    #[allow(clippy::too_many_arguments)]
    fn carve_range(
        &self,
        tier_idx: usize,
        count: usize,
        align: usize,
        phase: usize,
        boundary: usize,
        min_pfn: Pfn,
        max_pfn: Pfn,
    ) -> Option<Pfn> {
        let fits = |start: Pfn| -> bool {
            if boundary != 0 {
                let first = start / boundary;
                let last = (start + count - 1) / boundary;
                if first != last {
                    return false;
                }
            }
            true
        };
        let align_candidate = |at: Pfn| -> Pfn {
            // Smallest start >= at with start % align == phase.
            let base = at.saturating_sub(phase);
            let aligned = (base + align - 1) / align * align;
            aligned + phase
        };

        let claim: Option<(Pfn, u8, Pfn)> = {
            let mut tier = self.tiers[tier_idx].lock();
            let mut found: Option<(usize, usize, Pfn, Pfn)> = None;
            'search: for order in (0..=MAX_ORDER as usize).rev() {
                if (1usize << order) < count {
                    continue;
                }
                for (idx, &block) in tier.free_lists[order].iter().enumerate() {
                    let block_end = block + (1 << order);
                    let lo = block.max(min_pfn);
                    let hi = block_end.min(max_pfn);
                    let mut candidate = align_candidate(lo);
                    if boundary != 0 && candidate + count <= hi && !fits(candidate) {
                        // Jump to the next boundary window and re-align.
                        let next = (candidate / boundary + 1) * boundary;
                        candidate = align_candidate(next);
                    }
                    if candidate >= lo && candidate + count <= hi && fits(candidate) {
                        found = Some((order, idx, block, candidate));
                        break 'search;
                    }
                }
            }
            found.map(|(order, idx, block, candidate)| {
                tier.free_lists[order].swap_remove(idx);
                (block, order as u8, candidate)
            })
        };

        let (block, order, candidate) = claim?;
        if let Some(head) = self.page(block) {
            head.clear_flag(PageFlags::BUDDY);
        }
        // Trim the unused head and tail back onto the free lists.
        if candidate > block {
            self.add_free_run(block, candidate - block);
        }
        let block_end = block + (1usize << order);
        if candidate + count < block_end {
            self.add_free_run(candidate + count, block_end - (candidate + count));
        }
        Some(candidate)
    }

    /// Free a run allocated with [`alloc_range`].
    pub fn free_range(&self, base: PhysAddr, count: usize) {
        let pfn = pa_to_pfn(base);
        let Some(head) = self.page(pfn) else {
            crate::fatal!("phys: free_range of unknown address {:#x}", base);
        };
        if head.is_busy() {
            crate::fatal!("phys: free_range of busy page {:#x}", base);
        }
        if head.put() > 0 {
            return;
        }
        self.account(PageState::Allocated, PageState::Free, count);
        self.add_free_run(pfn, count);
    }

    /// Move a page between states, keeping counters and the dirty queue
    /// coherent. This is the only sanctioned way to re-type a page.
    pub fn set_state(&self, pa: PhysAddr, new: PageState) {
        let pfn = pa_to_pfn(pa);
        let Some(page) = self.page(pfn) else {
            crate::fatal!("phys: set_state of unknown address {:#x}", pa);
        };
        let old = page.state();
        if old == new {
            return;
        }
        if new == PageState::Free || old == PageState::Free {
            crate::fatal!("phys: set_state cannot allocate or free pages");
        }
        page.store_state(new);
        self.account(old, new, 1);
        match new {
            PageState::CachedDirty => {
                page.set_flag(PageFlags::DIRTY);
                self.dirty_queue.lock().push_back(pfn);
            }
            PageState::CachedClean | PageState::Allocated => {
                page.clear_flag(PageFlags::DIRTY);
                // Dirty-queue entry, if any, is skipped lazily.
            }
            PageState::Free => unreachable!(),
        }
    }

    /// Register a page-cache owner; the returned token goes into
    /// [`Page::set_owner`] for each page the cache holds.
    pub fn register_owner(&self, owner: &'static dyn PageCacheOwner) -> usize {
        let mut owners = self.owners.lock();
        owners.push(owner);
        owners.len() - 1
    }

    /// One page-writer pass: write back up to `limit` dirty pages via
    /// their owners' flush callbacks. Returns the number cleaned.
    pub fn flush_dirty(&self, limit: usize) -> usize {
        let mut cleaned = 0;
        // Bounded by the queue length at entry so pages that stay busy and
        // get requeued cannot spin this pass forever.
        let mut budget = self.dirty_queue.lock().len();
        while cleaned < limit && budget > 0 {
            budget -= 1;
            let Some(pfn) = self.dirty_queue.lock().pop_front() else {
                break;
            };
            let Some(page) = self.page(pfn) else {
                continue;
            };
            if page.state() != PageState::CachedDirty {
                continue; // re-typed since queued
            }
            // Busy excludes concurrent evict while we write back.
            if !page.mark_busy() {
                self.dirty_queue.lock().push_back(pfn);
                continue;
            }
            let owner = page.owner().and_then(|t| self.owners.lock().get(t).copied());
            let result = match owner {
                Some(owner) => owner.flush(pfn_to_pa(pfn), page),
                None => Ok(()),
            };
            match result {
                Ok(()) => {
                    self.set_state(pfn_to_pa(pfn), PageState::CachedClean);
                    cleaned += 1;
                }
                Err(err) => {
                    crate::warn!("phys: write-back of {:#x} failed: {:?}", pfn_to_pa(pfn), err);
                    self.dirty_queue.lock().push_back(pfn);
                }
            }
            page.clear_busy();
        }
        cleaned
    }

    pub fn stats(&self) -> PhysStats {
        PhysStats {
            total_pages: self.total,
            free_pages: self.free.load(Ordering::Acquire),
            allocated_pages: self.allocated.load(Ordering::Acquire),
            cached_clean_pages: self.cached_clean.load(Ordering::Acquire),
            cached_dirty_pages: self.cached_dirty.load(Ordering::Acquire),
        }
    }
}

/// The kernel's physical memory; set once during boot.
static PHYS: spin::Once<PhysicalMemory> = spin::Once::new();

pub fn init(ranges: &[(PhysAddr, u64)]) {
    PHYS.call_once(|| {
        let mem = PhysicalMemory::new(ranges);
        let stats = mem.stats();
        crate::info!(
            "phys: {} pages ({} MiB) across {} ranges",
            stats.total_pages,
            stats.total_pages * PAGE_SIZE / (1024 * 1024),
            ranges.len()
        );
        mem
    });
}

/// The global instance. Fatal before [`init`].
pub fn get() -> &'static PhysicalMemory {
    match PHYS.get() {
        Some(mem) => mem,
        None => crate::fatal!("phys: used before init"),
    }
}

pub fn alloc(flags: AllocFlags) -> Result<PhysAddr> {
    get().alloc(flags)
}

pub fn alloc_pages(order: u8, flags: AllocFlags) -> Result<PhysAddr> {
    get().alloc_pages(order, flags)
}

pub fn free(pa: PhysAddr) {
    get().free(pa)
}

pub fn free_pages(pa: PhysAddr, order: u8) {
    get().free_pages(pa, order)
}

pub fn alloc_range(
    count: usize,
    align: usize,
    phase: usize,
    boundary: usize,
    min_pa: PhysAddr,
    max_pa: PhysAddr,
    flags: AllocFlags,
) -> Result<PhysAddr> {
    get().alloc_range(count, align, phase, boundary, min_pa, max_pa, flags)
}

pub fn free_range(pa: PhysAddr, count: usize) {
    get().free_range(pa, count)
}

pub fn lookup(pa: PhysAddr) -> Option<&'static Page> {
    get().lookup(pa)
}

pub fn stats() -> PhysStats {
    get().stats()
}

/// Allocate a block of host memory usable as simulated RAM, returning its
/// (physical) base and size. Hosted builds only.
#[cfg(not(target_os = "none"))]
pub fn sim_ram(bytes: usize) -> (PhysAddr, u64) {
    let layout = core::alloc::Layout::from_size_align(bytes, PAGE_SIZE).unwrap();
    let ptr = unsafe { alloc::alloc::alloc_zeroed(layout) };
    if ptr.is_null() {
        crate::fatal!("phys: simulated RAM allocation failed");
    }
    (ptr as PhysAddr, bytes as u64)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn make_mem(pages: usize) -> PhysicalMemory {
        let (base, size) = sim_ram(pages * PAGE_SIZE);
        PhysicalMemory::new(&[(base, size)])
    }

    #[test]
    fn conservation_over_alloc_free() {
        let mem = make_mem(64);
        let total = mem.stats().total_pages;
        let pa = mem.alloc(AllocFlags::empty()).unwrap();
        let s = mem.stats();
        assert_eq!(s.free_pages + s.allocated_pages, total);
        assert_eq!(mem.lookup(pa).unwrap().state(), PageState::Allocated);
        mem.free(pa);
        let s = mem.stats();
        assert_eq!(s.free_pages, total);
        assert_eq!(mem.lookup(pa).unwrap().state(), PageState::Free);
    }

    #[test]
    fn blocks_are_zeroed_on_request() {
        let mem = make_mem(16);
        let pa = mem.alloc(AllocFlags::ZERO).unwrap();
        let bytes = unsafe { core::slice::from_raw_parts(super::super::phys_to_virt(pa), PAGE_SIZE) };
        assert!(bytes.iter().all(|&b| b == 0));
        mem.free(pa);
    }

    #[test]
    fn coalescing_restores_large_blocks() {
        let mem = make_mem(32);
        let a = mem.alloc_pages(2, AllocFlags::empty()).unwrap();
        let b = mem.alloc_pages(2, AllocFlags::empty()).unwrap();
        mem.free_pages(a, 2);
        mem.free_pages(b, 2);
        // After freeing both, an order-3 block must be allocatable again.
        let c = mem.alloc_pages(3, AllocFlags::empty()).unwrap();
        mem.free_pages(c, 3);
    }

    #[test]
    fn refcounted_block_freed_on_last_put() {
        let mem = make_mem(16);
        let pa = mem.alloc(AllocFlags::empty()).unwrap();
        mem.lookup(pa).unwrap().get();
        mem.free(pa); // first put, still referenced
        assert_eq!(mem.lookup(pa).unwrap().state(), PageState::Allocated);
        mem.free(pa); // second put, actually freed
        assert_eq!(mem.lookup(pa).unwrap().state(), PageState::Free);
    }

    #[test]
    fn alloc_range_respects_alignment_and_phase() {
        let mem = make_mem(128);
        let pa = mem
            .alloc_range(3, 8, 1, 0, 0, 0, AllocFlags::empty())
            .unwrap();
        let pfn = pa_to_pfn(pa);
        assert_eq!(pfn % 8, 1);
        let s = mem.stats();
        assert_eq!(s.allocated_pages, 3);
        mem.free_range(pa, 3);
        assert_eq!(mem.stats().free_pages, mem.stats().total_pages);
    }

    #[test]
    fn alloc_range_honours_boundary() {
        let mem = make_mem(128);
        let pa = mem
            .alloc_range(4, 1, 0, 16, 0, 0, AllocFlags::empty())
            .unwrap();
        let pfn = pa_to_pfn(pa);
        assert_eq!(pfn / 16, (pfn + 3) / 16);
        mem.free_range(pa, 4);
    }

    #[test]
    fn cached_state_transitions_are_counted() {
        let mem = make_mem(16);
        let pa = mem.alloc(AllocFlags::empty()).unwrap();
        mem.set_state(pa, PageState::CachedDirty);
        assert_eq!(mem.stats().cached_dirty_pages, 1);
        assert!(mem.lookup(pa).unwrap().flags().contains(PageFlags::DIRTY));
        let cleaned = mem.flush_dirty(8);
        assert_eq!(cleaned, 1);
        assert_eq!(mem.stats().cached_clean_pages, 1);
        assert_eq!(mem.lookup(pa).unwrap().state(), PageState::CachedClean);
        mem.set_state(pa, PageState::Allocated);
        mem.free(pa);
    }
}
