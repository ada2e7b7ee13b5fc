//! User address spaces
//!
//! A process's address space is a sorted set of non-overlapping regions,
//! each backed either by anonymous memory or by a pager object (a file's
//! page cache). A private region carries an amap: its own copies of
//! pages written through it, overriding the backing source. The amap is
//! what copy-on-write shares and splits across process duplication.

use super::mmu::{MmuContext, Protection};
use super::page::{page_align_down, page_align_up, PhysAddr, PAGE_SIZE};
use super::phys::AllocFlags;
use crate::status::{Result, Status};
use alloc::collections::BTreeMap;
use alloc::sync::Arc;
use alloc::vec::Vec;

/// User address-space layout.
pub const USER_MMAP_BASE: u64 = 0x0000_7000_0000_0000;
pub const USER_STACK_TOP: u64 = 0x0000_7FFF_FFFF_F000;

bitflags::bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct RegionFlags: u32 {
        /// Writes are private to this address space (copy-on-write).
        const PRIVATE = 1 << 0;
        /// Grows-down stack region.
        const STACK = 1 << 1;
        /// The given address is a requirement, not a hint.
        const FIXED = 1 << 2;
    }
}

/// A pager: supplies and accepts pages for an object-backed region.
pub trait VmObject: Send + Sync {
    /// Page backing byte `offset` into the object. May block on I/O.
    fn get_page(&self, offset: u64) -> Result<PhysAddr>;
    /// Write back a page (page writer path).
    fn flush_page(&self, _offset: u64, _pa: PhysAddr) -> Result<()> {
        Ok(())
    }
}

pub enum RegionSource {
    Anonymous,
    Object { object: Arc<dyn VmObject>, offset: u64 },
}

impl RegionSource {
    fn clone_for_split(&self, delta: u64) -> RegionSource {
        match self {
            RegionSource::Anonymous => RegionSource::Anonymous,
            RegionSource::Object { object, offset } => RegionSource::Object {
                object: object.clone(),
                offset: offset + delta,
            },
        }
    }
}

/// A privately owned page copy, freed with its last owner.
pub struct AnonPage {
    pa: PhysAddr,
}

impl AnonPage {
    pub(super) fn new_zeroed() -> Result<Arc<AnonPage>> {
        let pa = super::phys::alloc(AllocFlags::ZERO)?;
        Ok(Arc::new(AnonPage { pa }))
    }

    /// New page holding a copy of `src`.
    pub(super) fn new_copy_of(src: PhysAddr) -> Result<Arc<AnonPage>> {
        let pa = super::phys::alloc(AllocFlags::empty())?;
        unsafe {
            core::ptr::copy_nonoverlapping(
                super::phys_to_virt(src),
                super::phys_to_virt(pa),
                PAGE_SIZE,
            );
        }
        Ok(Arc::new(AnonPage { pa }))
    }

    pub fn phys(&self) -> PhysAddr {
        self.pa
    }
}

impl Drop for AnonPage {
    fn drop(&mut self) {
        super::phys::free(self.pa);
    }
}

pub struct Region {
    start: u64,
    size: u64,
    prot: Protection,
    flags: RegionFlags,
    source: RegionSource,
    /// Page-index → privately owned page, overriding the source.
    amap: BTreeMap<u64, Arc<AnonPage>>,
}

impl Region {
    pub fn start(&self) -> u64 {
        self.start
    }

    pub fn end(&self) -> u64 {
        self.start + self.size
    }

    pub fn size(&self) -> u64 {
        self.size
    }

    pub fn protection(&self) -> Protection {
        self.prot
    }

    pub fn flags(&self) -> RegionFlags {
        self.flags
    }

    pub fn contains(&self, addr: u64) -> bool {
        addr >= self.start && addr < self.end()
    }

    pub fn is_private(&self) -> bool {
        self.flags.contains(RegionFlags::PRIVATE)
    }

    fn page_index(&self, addr: u64) -> u64 {
        (page_align_down(addr) - self.start) / PAGE_SIZE as u64
    }

    pub(super) fn anon_at(&self, addr: u64) -> Option<&Arc<AnonPage>> {
        self.amap.get(&self.page_index(addr))
    }

    pub(super) fn set_anon_at(&mut self, addr: u64, page: Arc<AnonPage>) {
        self.amap.insert(self.page_index(addr), page);
    }

    pub(super) fn source(&self) -> &RegionSource {
        &self.source
    }

    /// Byte offset into the backing object for `addr`.
    pub(super) fn source_offset(&self, addr: u64) -> u64 {
        match &self.source {
            RegionSource::Anonymous => page_align_down(addr) - self.start,
            RegionSource::Object { offset, .. } => offset + (page_align_down(addr) - self.start),
        }
    }

    /// Rights to install in the page tables for a page of this region:
    /// a private page still shared with another address space (or not
    /// yet copied from its source) must not be writable, so the write
    /// faults and copies.
    pub(super) fn effective_prot(&self, addr: u64) -> Protection {
        if !self.is_private() {
            return self.prot;
        }
        let writable_copy = self
            .anon_at(addr)
            .map_or(false, |anon| Arc::strong_count(anon) == 1);
        if writable_copy {
            self.prot
        } else {
            self.prot - Protection::WRITE
        }
    }
}

pub struct AddressSpace {
    mmu: Arc<MmuContext>,
    /// Regions keyed by start address; non-overlapping by construction.
    regions: BTreeMap<u64, Region>,
}

impl AddressSpace {
    pub fn new() -> Result<AddressSpace> {
        Ok(AddressSpace {
            mmu: MmuContext::new(true)?,
            regions: BTreeMap::new(),
        })
    }

    pub fn mmu(&self) -> &Arc<MmuContext> {
        &self.mmu
    }

    pub fn find_region(&self, addr: u64) -> Option<&Region> {
        self.regions
            .range(..=addr)
            .next_back()
            .map(|(_, r)| r)
            .filter(|r| r.contains(addr))
    }

    pub(super) fn find_region_mut(&mut self, addr: u64) -> Option<&mut Region> {
        self.regions
            .range_mut(..=addr)
            .next_back()
            .map(|(_, r)| r)
            .filter(|r| r.contains(addr))
    }

    fn overlaps(&self, start: u64, end: u64) -> bool {
        self.regions
            .values()
            .any(|r| start < r.end() && end > r.start)
    }

    /// Lowest free gap of `size` bytes at or above the mmap base.
    fn find_free(&self, size: u64) -> Result<u64> {
        let mut candidate = USER_MMAP_BASE;
        for region in self.regions.values() {
            if region.end() <= candidate {
                continue;
            }
            if region.start >= candidate + size {
                break;
            }
            candidate = region.end();
        }
        if candidate + size <= super::USER_TOP {
            Ok(candidate)
        } else {
            Err(Status::NoMemory)
        }
    }

    /// Create a region. `addr` of zero picks a free range unless FIXED.
    pub fn map(
        &mut self,
        addr: u64,
        size: u64,
        prot: Protection,
        flags: RegionFlags,
        source: RegionSource,
    ) -> Result<u64> {
        let size = page_align_up(size);
        if size == 0 {
            return Err(Status::InvalidArg);
        }
        let start = if addr == 0 && !flags.contains(RegionFlags::FIXED) {
            self.find_free(size)?
        } else {
            if addr % PAGE_SIZE as u64 != 0 {
                return Err(Status::InvalidArg);
            }
            if !super::is_user_address(addr) || !super::is_user_address(addr + size - 1) {
                return Err(Status::InvalidAddr);
            }
            addr
        };
        if self.overlaps(start, start + size) {
            return Err(Status::AlreadyExists);
        }
        self.regions.insert(
            start,
            Region {
                start,
                size,
                prot,
                flags,
                source,
                amap: BTreeMap::new(),
            },
        );
        Ok(start)
    }

    /// Split the region spanning `at`, if any, so that `at` becomes a
    /// region boundary.
    fn split_at(&mut self, at: u64) {
        let Some(region) = self.find_region(at) else {
            return;
        };
        let start = region.start;
        if at == start {
            return;
        }
        let mut left = self.regions.remove(&start).unwrap_or_else(|| {
            crate::fatal!("aspace: region map inconsistent at {:#x}", start)
        });
        let split_idx = (at - start) / PAGE_SIZE as u64;
        let right_amap: BTreeMap<u64, Arc<AnonPage>> = left
            .amap
            .split_off(&split_idx)
            .into_iter()
            .map(|(idx, page)| (idx - split_idx, page))
            .collect();
        let right = Region {
            start: at,
            size: left.size - (at - start),
            prot: left.prot,
            flags: left.flags,
            source: left.source.clone_for_split(at - start),
            amap: right_amap,
        };
        left.size = at - start;
        self.regions.insert(start, left);
        self.regions.insert(at, right);
    }

    /// Drop every mapping and owned page in `[addr, addr + size)`.
    pub fn unmap(&mut self, addr: u64, size: u64) -> Result<()> {
        if addr % PAGE_SIZE as u64 != 0 {
            return Err(Status::InvalidArg);
        }
        let size = page_align_up(size);
        let end = addr + size;
        self.split_at(addr);
        self.split_at(end);

        let covered: Vec<u64> = self
            .regions
            .range(addr..end)
            .map(|(&start, _)| start)
            .collect();
        self.mmu.lock();
        for start in covered {
            if let Some(region) = self.regions.remove(&start) {
                let mut page = region.start;
                while page < region.end() {
                    if let Ok((pa, true)) = self.mmu.unmap(page, true) {
                        // Pages the amap owns are freed when the region
                        // drops; source-cache pages just lose our ref.
                        let ours = region
                            .anon_at(page)
                            .map_or(false, |anon| anon.phys() == pa);
                        if !ours {
                            if let Some(desc) = super::phys::lookup(pa) {
                                desc.put();
                            }
                        }
                    }
                    page += PAGE_SIZE as u64;
                }
            }
        }
        self.mmu.unlock();
        Ok(())
    }

    /// Change the access rights of `[addr, addr + size)`.
    pub fn protect(&mut self, addr: u64, size: u64, prot: Protection) -> Result<()> {
        if addr % PAGE_SIZE as u64 != 0 {
            return Err(Status::InvalidArg);
        }
        let size = page_align_up(size);
        let end = addr + size;
        self.split_at(addr);
        self.split_at(end);

        let covered: Vec<u64> = self
            .regions
            .range(addr..end)
            .map(|(&start, _)| start)
            .collect();
        if covered.is_empty() {
            return Err(Status::NotFound);
        }
        self.mmu.lock();
        let mut result = Ok(());
        'outer: for start in covered {
            let Some(region) = self.regions.get_mut(&start) else {
                continue;
            };
            region.prot = prot;
            // Re-derive installed rights page by page; COW pages stay
            // read-only regardless of the new protection.
            let mut page = region.start;
            while page < region.end() {
                if self.mmu.query(page).is_some() {
                    let effective = region.effective_prot(page);
                    if let Err(err) = self.mmu.protect(page, PAGE_SIZE as u64, effective) {
                        result = Err(err);
                        break 'outer;
                    }
                }
                page += PAGE_SIZE as u64;
            }
        }
        self.mmu.unlock();
        result
    }

    /// Translate `addr` for `access`, faulting the page in if needed.
    /// The guarded user-copy path and futex key lookup use this.
    pub fn resolve(&mut self, addr: u64, access: Protection) -> Result<PhysAddr> {
        if let Some((pa, prot)) = self.mmu.query(addr) {
            if prot.contains(access) {
                return Ok(pa);
            }
        }
        match super::fault::resolve(self, addr, super::fault::FaultReason::NotPresent, access) {
            super::fault::FaultResult::Success => {}
            super::fault::FaultResult::OutOfMemory => return Err(Status::NoMemory),
            _ => return Err(Status::InvalidAddr),
        }
        match self.mmu.query(addr) {
            Some((pa, _)) => Ok(pa),
            None => Err(Status::InvalidAddr),
        }
    }

    /// Copy-on-write duplicate (the memory side of process duplication).
    /// Private pages become shared read-only; either side's next write
    /// copies. Shared regions keep referencing the same objects.
    pub fn duplicate(&mut self) -> Result<AddressSpace> {
        let child_mmu = MmuContext::new(true)?;
        let mut child_regions = BTreeMap::new();

        self.mmu.lock();
        let mut result = Ok(());
        'outer: for (&start, region) in self.regions.iter() {
            // Sharing the amap entries makes both sides' copies COW.
            child_regions.insert(
                start,
                Region {
                    start: region.start,
                    size: region.size,
                    prot: region.prot,
                    flags: region.flags,
                    source: region.source.clone_for_split(0),
                    amap: region.amap.clone(),
                },
            );
            // Downgrade our own writable private mappings so our next
            // write faults and copies.
            if region.is_private() {
                let mut page = region.start;
                while page < region.end() {
                    if self.mmu.query(page).is_some() {
                        if let Err(err) =
                            self.mmu
                                .protect(page, PAGE_SIZE as u64, region.prot - Protection::WRITE)
                        {
                            result = Err(err);
                            break 'outer;
                        }
                    }
                    page += PAGE_SIZE as u64;
                }
            }
        }
        self.mmu.unlock();
        result?;

        // The child starts with no mappings; every touch faults in
        // through the shared amap or the source.
        Ok(AddressSpace {
            mmu: child_mmu,
            regions: child_regions,
        })
    }

    pub fn region_count(&self) -> usize {
        self.regions.len()
    }

    /// Regions are sorted and non-overlapping. Test support.
    #[cfg(test)]
    pub fn check_invariants(&self) -> bool {
        let mut last_end = 0;
        for (&start, region) in self.regions.iter() {
            if start != region.start || start < last_end {
                return false;
            }
            last_end = region.end();
        }
        true
    }
}

impl Drop for AddressSpace {
    fn drop(&mut self) {
        // Unmap everything so amap pages and source references drop
        // before the MMU context tears down its tables.
        let spans: Vec<(u64, u64)> = self
            .regions
            .values()
            .map(|r| (r.start, r.size))
            .collect();
        for (start, size) in spans {
            let _ = self.unmap(start, size);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn anon_rw() -> (Protection, RegionFlags, RegionSource) {
        (
            Protection::RW,
            RegionFlags::PRIVATE,
            RegionSource::Anonymous,
        )
    }

    #[test]
    fn regions_stay_sorted_and_disjoint() {
        crate::testing::init_kernel();
        let mut aspace = AddressSpace::new().unwrap();
        let (prot, flags, _) = anon_rw();
        aspace
            .map(0x10000, 0x3000, prot, flags, RegionSource::Anonymous)
            .unwrap();
        aspace
            .map(0x20000, 0x1000, prot, flags, RegionSource::Anonymous)
            .unwrap();
        assert!(aspace.check_invariants());
        // Overlap is refused.
        assert_eq!(
            aspace.map(0x11000, 0x1000, prot, flags, RegionSource::Anonymous),
            Err(Status::AlreadyExists)
        );
    }

    #[test]
    fn auto_placement_finds_gaps() {
        crate::testing::init_kernel();
        let mut aspace = AddressSpace::new().unwrap();
        let (prot, flags, _) = anon_rw();
        let a = aspace
            .map(0, 0x2000, prot, flags, RegionSource::Anonymous)
            .unwrap();
        let b = aspace
            .map(0, 0x2000, prot, flags, RegionSource::Anonymous)
            .unwrap();
        assert!(a >= USER_MMAP_BASE);
        assert!(b >= a + 0x2000);
        assert!(aspace.check_invariants());
    }

    #[test]
    fn unmap_splits_partially_covered_regions() {
        crate::testing::init_kernel();
        let mut aspace = AddressSpace::new().unwrap();
        let (prot, flags, _) = anon_rw();
        aspace
            .map(0x40000, 0x4000, prot, flags, RegionSource::Anonymous)
            .unwrap();
        aspace.unmap(0x41000, 0x1000).unwrap();
        assert!(aspace.check_invariants());
        assert_eq!(aspace.region_count(), 2);
        assert!(aspace.find_region(0x40000).is_some());
        assert!(aspace.find_region(0x41000).is_none());
        assert!(aspace.find_region(0x42000).is_some());
    }

    #[test]
    fn unaligned_requests_are_rejected() {
        crate::testing::init_kernel();
        let mut aspace = AddressSpace::new().unwrap();
        let (prot, flags, _) = anon_rw();
        assert_eq!(
            aspace.map(0x1234, 0x1000, prot, flags, RegionSource::Anonymous),
            Err(Status::InvalidArg)
        );
        assert_eq!(aspace.unmap(0x1234, 0x1000), Err(Status::InvalidArg));
    }
}
