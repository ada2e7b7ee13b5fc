//! End-to-end virtual-memory scenarios against the hosted kernel:
//! zero-fill on first touch, copy-on-write across process duplication,
//! and guarded user copies from unmapped memory.

use quark_kernel::mm::mmu::Protection;
use quark_kernel::mm::region::{RegionFlags, RegionSource};
use quark_kernel::mm::{phys_to_virt, PAGE_SIZE};
use quark_kernel::process::Process;
use quark_kernel::status::Status;
use quark_kernel::syscall::uaccess;

fn setup() {
    quark_kernel::boot::hosted::init(64 * 1024 * 1024);
}

/// Fault a byte in for reading and return it.
fn user_read(process: &std::sync::Arc<Process>, addr: u64) -> u8 {
    let mut buf = [0u8; 1];
    uaccess::copy_from_user_in(process, &mut buf, addr).unwrap();
    buf[0]
}

fn user_write(process: &std::sync::Arc<Process>, addr: u64, value: u8) {
    uaccess::copy_to_user_in(process, addr, &[value]).unwrap();
}

#[test]
fn anonymous_page_reads_zero() {
    setup();
    let process = Process::create("zero-fill").unwrap();
    let base = 0x10000u64;
    {
        let mut aspace = process.aspace().lock();
        aspace
            .map(
                base,
                PAGE_SIZE as u64,
                Protection::RW,
                RegionFlags::PRIVATE,
                RegionSource::Anonymous,
            )
            .unwrap();
    }

    assert_eq!(user_read(&process, base + 4), 0);

    // The fault installed a real translation.
    {
        let aspace = process.aspace().lock();
        assert!(aspace.mmu().query(base + 4).is_some());
    }
    process.exit(0);
}

#[test]
fn copy_on_write_across_duplicate() {
    setup();
    let parent = Process::create("cow-parent").unwrap();
    let base = 0x10000u64;
    {
        let mut aspace = parent.aspace().lock();
        aspace
            .map(
                base,
                PAGE_SIZE as u64,
                Protection::RW,
                RegionFlags::PRIVATE,
                RegionSource::Anonymous,
            )
            .unwrap();
    }

    user_write(&parent, base + 8, 0xAB);
    let child = parent.duplicate("cow-child").unwrap();

    // Child observes the parent's write through the shared page.
    assert_eq!(user_read(&child, base + 8), 0xAB);

    // Child's write lands in its own copy.
    user_write(&child, base + 8, 0xCD);
    assert_eq!(user_read(&child, base + 8), 0xCD);
    assert_eq!(user_read(&parent, base + 8), 0xAB);

    child.exit(0);
    parent.exit(0);
}

#[test]
fn copy_from_unmapped_user_memory_fails_cleanly() {
    setup();
    let process = Process::create("bad-copy").unwrap();
    let mut dst = [0u8; 8];
    // No mapping anywhere near this address: the guarded copy reports
    // InvalidAddr instead of taking the kernel down.
    assert_eq!(
        uaccess::copy_from_user_in(&process, &mut dst, 0xDEAD_BEEF_000),
        Err(Status::InvalidAddr)
    );
    process.exit(0);
}

#[test]
fn protect_blocks_writes_but_cow_still_works() {
    setup();
    let process = Process::create("protect").unwrap();
    let base = 0x40000u64;
    {
        let mut aspace = process.aspace().lock();
        aspace
            .map(
                base,
                PAGE_SIZE as u64,
                Protection::RW,
                RegionFlags::PRIVATE,
                RegionSource::Anonymous,
            )
            .unwrap();
    }
    user_write(&process, base, 1);
    {
        let mut aspace = process.aspace().lock();
        aspace.protect(base, PAGE_SIZE as u64, Protection::READ).unwrap();
    }
    // Write access is now refused by the region.
    assert_eq!(
        uaccess::copy_to_user_in(&process, base, &[2]),
        Err(Status::InvalidAddr)
    );
    // Reading still works and sees the old value.
    assert_eq!(user_read(&process, base), 1);
    process.exit(0);
}

#[test]
fn unmap_tears_down_translation() {
    setup();
    let process = Process::create("unmap").unwrap();
    let base = 0x50000u64;
    {
        let mut aspace = process.aspace().lock();
        aspace
            .map(
                base,
                PAGE_SIZE as u64,
                Protection::RW,
                RegionFlags::PRIVATE,
                RegionSource::Anonymous,
            )
            .unwrap();
    }
    user_write(&process, base, 7);
    {
        let mut aspace = process.aspace().lock();
        aspace.unmap(base, PAGE_SIZE as u64).unwrap();
        assert!(aspace.mmu().query(base).is_none());
    }
    let mut buf = [0u8; 1];
    assert_eq!(
        uaccess::copy_from_user_in(&process, &mut buf, base),
        Err(Status::InvalidAddr)
    );
    process.exit(0);
}

#[test]
fn object_backed_region_reads_through_pager() {
    setup();

    struct PatternObject {
        pa: u64,
    }

    impl quark_kernel::mm::region::VmObject for PatternObject {
        fn get_page(&self, _offset: u64) -> quark_kernel::status::Result<u64> {
            Ok(self.pa)
        }
    }

    let pa = quark_kernel::mm::phys::alloc(quark_kernel::mm::phys::AllocFlags::ZERO).unwrap();
    unsafe {
        core::ptr::write_bytes(phys_to_virt(pa), 0x42, PAGE_SIZE);
    }

    let process = Process::create("pager").unwrap();
    let base = 0x60000u64;
    {
        let mut aspace = process.aspace().lock();
        aspace
            .map(
                base,
                PAGE_SIZE as u64,
                Protection::RW,
                RegionFlags::PRIVATE,
                RegionSource::Object {
                    object: std::sync::Arc::new(PatternObject { pa }),
                    offset: 0,
                },
            )
            .unwrap();
    }

    // Read comes from the pager's page.
    assert_eq!(user_read(&process, base + 10), 0x42);
    // Private write copies; the pager's page is untouched.
    user_write(&process, base + 10, 0x99);
    assert_eq!(user_read(&process, base + 10), 0x99);
    assert_eq!(unsafe { *phys_to_virt(pa + 10) }, 0x42);
    process.exit(0);
}
