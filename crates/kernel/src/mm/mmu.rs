//! MMU contexts
//!
//! One context per address space: the x86-64 4-level table tree rooted at
//! a PML4 frame. Entries are encoded and walked in software, so the
//! hosted test kernel exercises the same paths as the hardware walker
//! consumes on bare metal.
//!
//! Structural changes require the context's recursive mutex; TLB
//! invalidations are queued while it is held and issued in one batch at
//! the final unlock, with a cross-CPU shootdown when the mapping was in
//! use on other CPUs.

use super::page::{PhysAddr, PAGE_SIZE};
use super::phys::AllocFlags;
use crate::status::{Result, Status};
use crate::sync::mutex::{Mutex, MutexFlags};
use crate::sync::spinlock::SpinLock;
use alloc::sync::Arc;
use alloc::vec::Vec;
use core::sync::atomic::{AtomicU64, Ordering};

bitflags::bitflags! {
    /// Access rights of a mapping.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct Protection: u32 {
        const READ = 1 << 0;
        const WRITE = 1 << 1;
        const EXEC = 1 << 2;
    }
}

impl Protection {
    pub const RW: Protection = Protection::READ.union(Protection::WRITE);
    pub const RWX: Protection = Protection::RW.union(Protection::EXEC);
}

bitflags::bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct MapFlags: u32 {
        /// Replace an existing mapping instead of failing with InUse.
        const REPLACE = 1 << 0;
    }
}

// Page-table entry bits (x86-64).
const PTE_PRESENT: u64 = 1 << 0;
const PTE_WRITE: u64 = 1 << 1;
const PTE_USER: u64 = 1 << 2;
const PTE_NX: u64 = 1 << 63;
const PTE_ADDR_MASK: u64 = 0x000F_FFFF_FFFF_F000;

const ENTRIES: usize = 512;
const LEVELS: usize = 4;

fn encode(pa: PhysAddr, prot: Protection, user: bool) -> u64 {
    let mut pte = (pa & PTE_ADDR_MASK) | PTE_PRESENT;
    if prot.contains(Protection::WRITE) {
        pte |= PTE_WRITE;
    }
    if !prot.contains(Protection::EXEC) {
        pte |= PTE_NX;
    }
    if user {
        pte |= PTE_USER;
    }
    pte
}

fn decode_prot(pte: u64) -> Protection {
    let mut prot = Protection::READ;
    if pte & PTE_WRITE != 0 {
        prot |= Protection::WRITE;
    }
    if pte & PTE_NX == 0 {
        prot |= Protection::EXEC;
    }
    prot
}

fn table_index(virt: u64, level: usize) -> usize {
    ((virt >> (12 + 9 * level)) & 0x1FF) as usize
}

/// View a table frame as its entry array.
unsafe fn table(pa: PhysAddr) -> *mut [u64; ENTRIES] {
    super::phys_to_virt(pa) as *mut [u64; ENTRIES]
}

pub struct MmuContext {
    user: bool,
    /// Top-level (PML4) table frame.
    top: PhysAddr,
    /// Guards structural changes. Recursive so nested subsystems (fault
    /// handling inside an allocation, for instance) can re-enter.
    lock: Mutex,
    /// CPUs currently running with this context loaded.
    cpus: AtomicU64,
    /// Invalidations queued while the lock is held.
    pending_flush: SpinLock<Vec<(u64, bool)>>,
}

impl MmuContext {
    pub fn new(user: bool) -> Result<Arc<MmuContext>> {
        let top = super::phys::alloc(AllocFlags::ZERO)?;
        // The kernel half is shared: user contexts reference the kernel
        // context's upper-half tables directly.
        if user {
            if let Some(kernel) = KERNEL_CONTEXT.get() {
                unsafe {
                    let src = &(&*table(kernel.top))[ENTRIES / 2..];
                    (&mut *table(top))[ENTRIES / 2..].copy_from_slice(src);
                }
            }
        }
        Ok(Arc::new(MmuContext {
            user,
            top,
            lock: Mutex::with_flags("mmu-context", MutexFlags::RECURSIVE),
            cpus: AtomicU64::new(0),
            pending_flush: SpinLock::new(Vec::new()),
        }))
    }

    pub fn is_user(&self) -> bool {
        self.user
    }

    pub fn table_root(&self) -> PhysAddr {
        self.top
    }

    /// Acquire the context lock. All structural operations require it.
    pub fn lock(&self) {
        self.lock.lock();
    }

    /// Release the context lock; the final release issues every queued
    /// TLB invalidation.
    pub fn unlock(&self) {
        let last = self.lock.recursion_depth() == 1;
        if last {
            self.issue_pending_flushes();
        }
        self.lock.unlock();
    }

    fn assert_locked(&self) {
        if !self.lock.is_held() {
            crate::fatal!("mmu: structural operation without the context lock");
        }
    }

    /// Reject addresses on the wrong side of the canonical split.
    fn check_addr(&self, virt: u64) -> Result<()> {
        if virt % PAGE_SIZE as u64 != 0 {
            return Err(Status::InvalidArg);
        }
        let ok = if self.user {
            super::is_user_address(virt)
        } else {
            super::is_kernel_address(virt)
        };
        if ok {
            Ok(())
        } else {
            Err(Status::InvalidAddr)
        }
    }

    /// Walk to the leaf table, optionally creating intermediate levels.
    /// Intermediate tables created before a failure stay in place; they
    /// hold no visible mapping.
    fn walk(&self, virt: u64, create: bool) -> Result<Option<PhysAddr>> {
        let mut current = self.top;
        for level in (1..LEVELS).rev() {
            let idx = table_index(virt, level);
            let entry = unsafe { (*table(current))[idx] };
            if entry & PTE_PRESENT == 0 {
                if !create {
                    return Ok(None);
                }
                let new_table = super::phys::alloc(AllocFlags::ZERO)?;
                // Intermediate entries carry the loosest rights; the
                // leaf enforces the real protection.
                let pte = (new_table & PTE_ADDR_MASK)
                    | PTE_PRESENT
                    | PTE_WRITE
                    | if self.user { PTE_USER } else { 0 };
                unsafe {
                    (*table(current))[idx] = pte;
                }
                current = new_table;
            } else {
                current = entry & PTE_ADDR_MASK;
            }
        }
        Ok(Some(current))
    }

    /// Install a mapping for one page.
    pub fn map(&self, virt: u64, phys: PhysAddr, prot: Protection, flags: MapFlags) -> Result<()> {
        self.assert_locked();
        self.check_addr(virt)?;
        if phys % PAGE_SIZE as u64 != 0 {
            return Err(Status::InvalidArg);
        }
        let leaf = match self.walk(virt, true)? {
            Some(leaf) => leaf,
            None => crate::fatal!("mmu: creating walk produced no leaf table"),
        };
        let idx = table_index(virt, 0);
        unsafe {
            let entry = &mut (*table(leaf))[idx];
            if *entry & PTE_PRESENT != 0 && !flags.contains(MapFlags::REPLACE) {
                return Err(Status::InUse);
            }
            let replacing = *entry & PTE_PRESENT != 0;
            *entry = encode(phys, prot, self.user);
            if replacing {
                self.queue_flush(virt, true);
            }
        }
        Ok(())
    }

    /// Change protection on a mapped range. Unmapped pages are skipped.
    pub fn protect(&self, virt: u64, size: u64, prot: Protection) -> Result<()> {
        self.assert_locked();
        self.check_addr(virt)?;
        if size % PAGE_SIZE as u64 != 0 {
            return Err(Status::InvalidArg);
        }
        let mut addr = virt;
        while addr < virt + size {
            if let Some(leaf) = self.walk(addr, false)? {
                let idx = table_index(addr, 0);
                unsafe {
                    let entry = &mut (*table(leaf))[idx];
                    if *entry & PTE_PRESENT != 0 {
                        let pa = *entry & PTE_ADDR_MASK;
                        *entry = encode(pa, prot, self.user);
                        self.queue_flush(addr, true);
                    }
                }
            }
            addr += PAGE_SIZE as u64;
        }
        Ok(())
    }

    /// Remove one page's mapping. `shared` states whether the mapping
    /// may have been used on other CPUs, forcing a cross-CPU shootdown.
    /// Returns the physical address and whether a mapping existed.
    pub fn unmap(&self, virt: u64, shared: bool) -> Result<(PhysAddr, bool)> {
        self.assert_locked();
        self.check_addr(virt)?;
        let Some(leaf) = self.walk(virt, false)? else {
            return Ok((0, false));
        };
        let idx = table_index(virt, 0);
        unsafe {
            let entry = &mut (*table(leaf))[idx];
            if *entry & PTE_PRESENT == 0 {
                return Ok((0, false));
            }
            let pa = *entry & PTE_ADDR_MASK;
            *entry = 0;
            self.queue_flush(virt, shared);
            Ok((pa, true))
        }
    }

    /// Translate a virtual address. Never fails; unmapped is None.
    pub fn query(&self, virt: u64) -> Option<(PhysAddr, Protection)> {
        let virt_page = virt & !(PAGE_SIZE as u64 - 1);
        let leaf = self.walk(virt_page, false).ok()??;
        let entry = unsafe { (*table(leaf))[table_index(virt_page, 0)] };
        if entry & PTE_PRESENT == 0 {
            return None;
        }
        let pa = (entry & PTE_ADDR_MASK) | (virt & (PAGE_SIZE as u64 - 1));
        Some((pa, decode_prot(entry)))
    }

    /// Switch this CPU onto the context.
    pub fn load(&self) {
        self.cpus
            .fetch_or(1 << crate::arch::cpu_id(), Ordering::AcqRel);
        #[cfg(all(target_arch = "x86_64", target_os = "none"))]
        unsafe {
            use x86_64::registers::control::{Cr3, Cr3Flags};
            use x86_64::structures::paging::PhysFrame;
            use x86_64::PhysAddr as HwPhysAddr;
            Cr3::write(
                PhysFrame::containing_address(HwPhysAddr::new(self.top)),
                Cr3Flags::empty(),
            );
        }
    }

    /// Drop this CPU from the context's user set.
    pub fn unload(&self) {
        self.cpus
            .fetch_and(!(1 << crate::arch::cpu_id()), Ordering::AcqRel);
    }

    pub fn active_cpus(&self) -> u64 {
        self.cpus.load(Ordering::Acquire)
    }

    fn queue_flush(&self, virt: u64, shared: bool) {
        if self.lock.is_held() {
            self.pending_flush.lock().push((virt, shared));
        } else {
            self.flush_one(virt, shared);
        }
    }

    fn issue_pending_flushes(&self) {
        let pending: Vec<(u64, bool)> = core::mem::take(&mut *self.pending_flush.lock());
        for (virt, shared) in pending {
            self.flush_one(virt, shared);
        }
    }

    fn flush_one(&self, _virt: u64, shared: bool) {
        #[cfg(all(target_arch = "x86_64", target_os = "none"))]
        {
            x86_64::instructions::tlb::flush(x86_64::VirtAddr::new(_virt));
        }
        // A mapping used on other CPUs needs a shootdown IPI to each of
        // them; private mappings only invalidate locally.
        if shared {
            let this = crate::arch::cpu_id();
            let mask = self.active_cpus();
            for cpu in crate::smp::online_cpus() {
                if cpu != this && mask & (1 << cpu) != 0 {
                    crate::smp::ipi::send_call(cpu, flush_all_local);
                }
            }
        }
    }

    /// Free the table tree of a dead user context. Leaf pages belong to
    /// the address-space layer; the shared kernel-half tables belong to
    /// the kernel context. Neither is touched here.
    fn free_tables(&self, table_pa: PhysAddr, level: usize) {
        if level > 1 {
            let limit = if level == LEVELS { ENTRIES / 2 } else { ENTRIES };
            for idx in 0..limit {
                let entry = unsafe { (*table(table_pa))[idx] };
                if entry & PTE_PRESENT != 0 {
                    self.free_tables(entry & PTE_ADDR_MASK, level - 1);
                }
            }
        }
        super::phys::free(table_pa);
    }
}

impl Drop for MmuContext {
    fn drop(&mut self) {
        if !self.user {
            crate::fatal!("mmu: kernel context destroyed");
        }
        if self.active_cpus() != 0 {
            crate::fatal!("mmu: context destroyed while loaded on a CPU");
        }
        self.free_tables(self.top, LEVELS);
    }
}

/// Invalidate this CPU's entire TLB (shootdown IPI target).
fn flush_all_local() {
    #[cfg(all(target_arch = "x86_64", target_os = "none"))]
    x86_64::instructions::tlb::flush_all();
}

/// The kernel's shared MMU context. Its mappings appear in every address
/// space; modifications take this context's lock.
static KERNEL_CONTEXT: spin::Once<Arc<MmuContext>> = spin::Once::new();

pub fn init() {
    KERNEL_CONTEXT.call_once(|| {
        let ctx = match MmuContext::new(false) {
            Ok(ctx) => ctx,
            Err(err) => crate::fatal!("mmu: kernel context allocation failed: {:?}", err),
        };
        ctx.load();
        ctx
    });
}

pub fn kernel_context() -> &'static Arc<MmuContext> {
    match KERNEL_CONTEXT.get() {
        Some(ctx) => ctx,
        None => crate::fatal!("mmu: used before init"),
    }
}
