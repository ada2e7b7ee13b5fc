//! Page-fault resolution
//!
//! Completes the memory model: a fault against a mapped region is
//! resolved from the region's amap or its backing source, copying on
//! private writes. The exception dispatcher calls in here for vector 14;
//! the guarded user-copy path calls in directly.

use super::mmu::{MapFlags, Protection};
use super::page::{page_align_down, PhysAddr};
use super::region::{AddressSpace, AnonPage, RegionSource, VmObject};
use crate::status::Status;
use alloc::sync::Arc;

/// Why the hardware raised the fault.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FaultReason {
    /// No translation for the address.
    NotPresent,
    /// Translation exists but forbids the access.
    ProtViolation,
    /// Reserved bit set in a page-table entry; always fatal.
    ReservedBit,
}

/// Outcome of resolution.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FaultResult {
    Success,
    /// Address lies outside every region.
    NoRegion,
    /// Region exists but forbids the access.
    AccessDenied,
    /// A page or table allocation failed.
    OutOfMemory,
}

/// How to back the faulting page.
enum Plan {
    /// Map a page the amap already owns.
    UseAnon { pa: PhysAddr, shared: bool },
    /// Copy an existing page into a fresh private one.
    CopyPage { src: PhysAddr },
    /// Copy the backing object's page into a fresh private one.
    CopyObject { object: Arc<dyn VmObject>, offset: u64 },
    /// Fresh zeroed private page.
    Zero,
    /// Map the backing object's page directly.
    UseObject { object: Arc<dyn VmObject>, offset: u64 },
}

/// Resolve a fault at `addr` for `access` in `aspace`.
pub fn resolve(
    aspace: &mut AddressSpace,
    addr: u64,
    reason: FaultReason,
    access: Protection,
) -> FaultResult {
    if reason == FaultReason::ReservedBit {
        // The dispatcher handles this before calling here; a reserved
        // bit can only mean corrupted tables.
        crate::fatal!("fault: reserved-bit fault reached the resolver");
    }

    let page_base = page_align_down(addr);
    let wants_write = access.contains(Protection::WRITE);

    // Decide how to back the page. Immutable pass over the region.
    let (prot, private, plan) = {
        let Some(region) = aspace.find_region(addr) else {
            crate::debug!("fault: no region for {:#x}", addr);
            return FaultResult::NoRegion;
        };
        if !region.protection().contains(access) {
            return FaultResult::AccessDenied;
        }
        let private = region.is_private();
        let plan = if let Some(anon) = region.anon_at(addr) {
            if private && wants_write && Arc::strong_count(anon) > 1 {
                // Still shared after a duplication; writing needs our
                // own copy.
                Plan::CopyPage { src: anon.phys() }
            } else {
                Plan::UseAnon {
                    pa: anon.phys(),
                    shared: private && Arc::strong_count(anon) > 1,
                }
            }
        } else {
            match region.source() {
                RegionSource::Anonymous => Plan::Zero,
                RegionSource::Object { object, .. } => {
                    let offset = region.source_offset(addr);
                    if private && wants_write {
                        Plan::CopyObject {
                            object: object.clone(),
                            offset,
                        }
                    } else {
                        Plan::UseObject {
                            object: object.clone(),
                            offset,
                        }
                    }
                }
            }
        };
        (region.protection(), private, plan)
    };

    // Materialize the backing page. Object get_page may block on I/O,
    // so this happens before the MMU lock is taken.
    let (pa, new_anon, effective) = match plan {
        Plan::UseAnon { pa, shared } => {
            let effective = if shared { prot - Protection::WRITE } else { prot };
            (pa, None, effective)
        }
        Plan::CopyPage { src } => match AnonPage::new_copy_of(src) {
            Ok(anon) => (anon.phys(), Some(anon), prot),
            Err(_) => return FaultResult::OutOfMemory,
        },
        Plan::CopyObject { object, offset } => {
            let src = match object.get_page(offset) {
                Ok(src) => src,
                Err(Status::NoMemory) => return FaultResult::OutOfMemory,
                Err(_) => return FaultResult::AccessDenied,
            };
            match AnonPage::new_copy_of(src) {
                Ok(anon) => (anon.phys(), Some(anon), prot),
                Err(_) => return FaultResult::OutOfMemory,
            }
        }
        Plan::Zero => match AnonPage::new_zeroed() {
            Ok(anon) => (anon.phys(), Some(anon), prot),
            Err(_) => return FaultResult::OutOfMemory,
        },
        Plan::UseObject { object, offset } => {
            let pa = match object.get_page(offset) {
                Ok(pa) => pa,
                Err(Status::NoMemory) => return FaultResult::OutOfMemory,
                Err(_) => return FaultResult::AccessDenied,
            };
            // Hold a reference on the cache page while it is mapped;
            // dropped again on unmap.
            if let Some(desc) = super::phys::lookup(pa) {
                desc.get();
            }
            // A private mapping of an object page stays read-only so
            // the first write faults into a copy.
            let effective = if private { prot - Protection::WRITE } else { prot };
            (pa, None, effective)
        }
    };

    // Install the mapping.
    let mmu = aspace.mmu().clone();
    mmu.lock();
    let mapped = mmu.map(page_base, pa, effective, MapFlags::REPLACE);
    mmu.unlock();
    if mapped.is_err() {
        return FaultResult::OutOfMemory;
    }

    if let Some(anon) = new_anon {
        if let Some(region) = aspace.find_region_mut(addr) {
            region.set_anon_at(addr, anon);
        }
    }

    crate::trace!("fault: resolved {:#x} ({:?})", addr, access);
    FaultResult::Success
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mm::region::RegionFlags;
    use crate::mm::{phys_to_virt, PAGE_SIZE};

    fn read_byte(aspace: &mut AddressSpace, addr: u64) -> u8 {
        assert_eq!(
            resolve(aspace, addr, FaultReason::NotPresent, Protection::READ),
            FaultResult::Success
        );
        let (pa, _) = aspace.mmu().query(addr).unwrap();
        unsafe { *phys_to_virt(pa) }
    }

    fn write_byte(aspace: &mut AddressSpace, addr: u64, value: u8) {
        assert_eq!(
            resolve(aspace, addr, FaultReason::ProtViolation, Protection::WRITE),
            FaultResult::Success
        );
        let (pa, prot) = aspace.mmu().query(addr).unwrap();
        assert!(prot.contains(Protection::WRITE));
        unsafe {
            *phys_to_virt(pa) = value;
        }
    }

    #[test]
    fn anonymous_read_is_zero_filled() {
        crate::testing::init_kernel();
        let mut aspace = AddressSpace::new().unwrap();
        aspace
            .map(
                0x10000,
                PAGE_SIZE as u64,
                Protection::RW,
                RegionFlags::PRIVATE,
                RegionSource::Anonymous,
            )
            .unwrap();
        assert_eq!(read_byte(&mut aspace, 0x10004), 0);
    }

    #[test]
    fn unmapped_address_reports_no_region() {
        crate::testing::init_kernel();
        let mut aspace = AddressSpace::new().unwrap();
        assert_eq!(
            resolve(
                &mut aspace,
                0xDEAD_B000,
                FaultReason::NotPresent,
                Protection::READ
            ),
            FaultResult::NoRegion
        );
    }

    #[test]
    fn forbidden_access_reports_denied() {
        crate::testing::init_kernel();
        let mut aspace = AddressSpace::new().unwrap();
        aspace
            .map(
                0x20000,
                PAGE_SIZE as u64,
                Protection::READ,
                RegionFlags::PRIVATE,
                RegionSource::Anonymous,
            )
            .unwrap();
        assert_eq!(
            resolve(
                &mut aspace,
                0x20000,
                FaultReason::ProtViolation,
                Protection::WRITE
            ),
            FaultResult::AccessDenied
        );
    }

    #[test]
    fn copy_on_write_isolates_parent_and_child() {
        crate::testing::init_kernel();
        let mut parent = AddressSpace::new().unwrap();
        let base = 0x30000u64;
        parent
            .map(
                base,
                PAGE_SIZE as u64,
                Protection::RW,
                RegionFlags::PRIVATE,
                RegionSource::Anonymous,
            )
            .unwrap();
        write_byte(&mut parent, base + 8, 0xAB);

        let mut child = parent.duplicate().unwrap();

        // Child sees the parent's data through the shared amap.
        assert_eq!(read_byte(&mut child, base + 8), 0xAB);

        // Child's write copies; the parent keeps its value.
        write_byte(&mut child, base + 8, 0xCD);
        assert_eq!(read_byte(&mut child, base + 8), 0xCD);
        assert_eq!(read_byte(&mut parent, base + 8), 0xAB);

        // And the parent's next write also goes to its own copy.
        write_byte(&mut parent, base + 16, 0x77);
        assert_eq!(read_byte(&mut child, base + 16), 0);
    }

    struct FilledObject {
        pa: crate::mm::page::PhysAddr,
    }

    impl FilledObject {
        fn new(fill: u8) -> Self {
            let pa = crate::mm::phys::alloc(crate::mm::phys::AllocFlags::ZERO).unwrap();
            unsafe {
                core::ptr::write_bytes(phys_to_virt(pa), fill, PAGE_SIZE);
            }
            Self { pa }
        }
    }

    impl VmObject for FilledObject {
        fn get_page(&self, _offset: u64) -> crate::status::Result<crate::mm::page::PhysAddr> {
            Ok(self.pa)
        }
    }

    #[test]
    fn private_object_write_copies_source() {
        crate::testing::init_kernel();
        let object = Arc::new(FilledObject::new(0x5A));
        let src_pa = object.pa;
        let mut aspace = AddressSpace::new().unwrap();
        let base = 0x50000u64;
        aspace
            .map(
                base,
                PAGE_SIZE as u64,
                Protection::RW,
                RegionFlags::PRIVATE,
                RegionSource::Object {
                    object: object.clone(),
                    offset: 0,
                },
            )
            .unwrap();

        // Read maps the source page read-only.
        assert_eq!(read_byte(&mut aspace, base), 0x5A);
        let (pa, prot) = aspace.mmu().query(base).unwrap();
        assert_eq!(pa, src_pa);
        assert!(!prot.contains(Protection::WRITE));

        // Write copies it; the source keeps its content.
        write_byte(&mut aspace, base, 0x11);
        let (pa_after, _) = aspace.mmu().query(base).unwrap();
        assert_ne!(pa_after & !0xFFF, src_pa & !0xFFF);
        assert_eq!(unsafe { *phys_to_virt(src_pa) }, 0x5A);
    }
}
