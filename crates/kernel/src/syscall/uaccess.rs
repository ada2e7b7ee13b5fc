//! Guarded user-memory access
//!
//! Bounded copies between kernel and user memory. The copy never touches
//! user virtual addresses directly: each page is resolved (faulting it
//! in if needed) under the address-space lock, and the bytes move
//! through the kernel's view of the physical page. Unresolvable pages
//! become InvalidAddr instead of a kernel fatal; the per-thread USERMEM
//! flag additionally redirects a reserved-bit fault taken inside the
//! guarded section into the same error path.

use crate::mm::mmu::Protection;
use crate::mm::{page::PAGE_SIZE, phys_to_virt};
use crate::process::Process;
use crate::sched::thread::{Thread, ThreadFlags};
use crate::status::{Result, Status};
use alloc::string::String;
use alloc::sync::Arc;
use alloc::vec::Vec;

/// RAII marker for a guarded user-memory section.
struct UserMemGuard {
    thread: Option<Arc<Thread>>,
}

impl UserMemGuard {
    fn enter() -> UserMemGuard {
        let thread = crate::sched::current();
        if let Some(ref thread) = thread {
            thread.set_flag(ThreadFlags::USERMEM);
        }
        UserMemGuard { thread }
    }

    /// Whether a hardware fault was redirected into this section.
    fn failed(&self) -> bool {
        self.thread
            .as_ref()
            .map(|t| t.take_usermem_fault())
            .unwrap_or(false)
    }
}

impl Drop for UserMemGuard {
    fn drop(&mut self) {
        if let Some(ref thread) = self.thread {
            thread.clear_flag(ThreadFlags::USERMEM);
        }
    }
}

/// Landing point for a fault fixup inside a guarded section. The copy
/// loop itself never dereferences user addresses, so there is no code
/// address to resume at; the fault flag carries the failure instead.
pub(crate) fn fixup_rip() -> Option<u64> {
    None
}

fn check_user_range(addr: u64, len: usize) -> Result<()> {
    let end = addr.checked_add(len as u64).ok_or(Status::InvalidAddr)?;
    if crate::mm::is_user_address(addr) && end <= crate::mm::USER_TOP {
        Ok(())
    } else {
        Err(Status::InvalidAddr)
    }
}

/// Copy `dst.len()` bytes from `src` in `process`'s address space.
pub fn copy_from_user_in(process: &Arc<Process>, dst: &mut [u8], src: u64) -> Result<()> {
    if dst.is_empty() {
        return Ok(());
    }
    check_user_range(src, dst.len())?;
    let guard = UserMemGuard::enter();

    // Holding the address-space lock across the copy keeps every
    // resolved page mapped until we are done with it.
    let mut aspace = process.aspace().lock();
    let mut copied = 0usize;
    while copied < dst.len() {
        let addr = src + copied as u64;
        let page_off = (addr % PAGE_SIZE as u64) as usize;
        let chunk = (PAGE_SIZE - page_off).min(dst.len() - copied);
        let pa = aspace
            .resolve(addr, Protection::READ)
            .map_err(|_| Status::InvalidAddr)?;
        unsafe {
            core::ptr::copy_nonoverlapping(phys_to_virt(pa), dst[copied..].as_mut_ptr(), chunk);
        }
        copied += chunk;
    }
    drop(aspace);

    if guard.failed() {
        return Err(Status::InvalidAddr);
    }
    Ok(())
}

/// Copy `src` into `dst` in `process`'s address space.
pub fn copy_to_user_in(process: &Arc<Process>, dst: u64, src: &[u8]) -> Result<()> {
    if src.is_empty() {
        return Ok(());
    }
    check_user_range(dst, src.len())?;
    let guard = UserMemGuard::enter();

    let mut aspace = process.aspace().lock();
    let mut copied = 0usize;
    while copied < src.len() {
        let addr = dst + copied as u64;
        let page_off = (addr % PAGE_SIZE as u64) as usize;
        let chunk = (PAGE_SIZE - page_off).min(src.len() - copied);
        let pa = aspace
            .resolve(addr, Protection::WRITE)
            .map_err(|_| Status::InvalidAddr)?;
        unsafe {
            core::ptr::copy_nonoverlapping(src[copied..].as_ptr(), phys_to_virt(pa), chunk);
        }
        copied += chunk;
    }
    drop(aspace);

    if guard.failed() {
        return Err(Status::InvalidAddr);
    }
    Ok(())
}

/// Read a NUL-terminated string of at most `max_len` bytes.
pub fn copy_string_from_user_in(
    process: &Arc<Process>,
    src: u64,
    max_len: usize,
) -> Result<String> {
    let guard = UserMemGuard::enter();
    let mut bytes: Vec<u8> = Vec::new();

    let mut aspace = process.aspace().lock();
    let mut addr = src;
    'scan: while bytes.len() < max_len {
        check_user_range(addr, 1)?;
        let page_off = (addr % PAGE_SIZE as u64) as usize;
        let chunk = (PAGE_SIZE - page_off).min(max_len - bytes.len());
        let pa = aspace
            .resolve(addr, Protection::READ)
            .map_err(|_| Status::InvalidAddr)?;
        for i in 0..chunk {
            let byte = unsafe { *phys_to_virt(pa + i as u64) };
            if byte == 0 {
                break 'scan;
            }
            bytes.push(byte);
        }
        if bytes.len() == max_len {
            // No terminator within the bound.
            return Err(Status::TooLong);
        }
        addr += chunk as u64;
    }
    drop(aspace);

    if guard.failed() {
        return Err(Status::InvalidAddr);
    }
    String::from_utf8(bytes).map_err(|_| Status::InvalidArg)
}

/// [`copy_from_user_in`] against the current process.
pub fn copy_from_user(dst: &mut [u8], src: u64) -> Result<()> {
    let process = crate::process::current().ok_or(Status::InvalidAddr)?;
    copy_from_user_in(&process, dst, src)
}

/// [`copy_to_user_in`] against the current process.
pub fn copy_to_user(dst: u64, src: &[u8]) -> Result<()> {
    let process = crate::process::current().ok_or(Status::InvalidAddr)?;
    copy_to_user_in(&process, dst, src)
}

pub fn copy_string_from_user(src: u64, max_len: usize) -> Result<String> {
    let process = crate::process::current().ok_or(Status::InvalidAddr)?;
    copy_string_from_user_in(&process, src, max_len)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mm::region::{RegionFlags, RegionSource};

    fn process_with_page(base: u64) -> Arc<Process> {
        let p = Process::create("uaccess-test").unwrap();
        {
            let mut aspace = p.aspace().lock();
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
        p
    }

    #[test]
    fn round_trip_through_user_page() {
        crate::testing::init_kernel();
        let base = 0x1_0000u64;
        let p = process_with_page(base);
        copy_to_user_in(&p, base + 100, b"quark").unwrap();
        let mut buf = [0u8; 5];
        copy_from_user_in(&p, &mut buf, base + 100).unwrap();
        assert_eq!(&buf, b"quark");
        p.exit(0);
    }

    #[test]
    fn crossing_a_page_boundary() {
        crate::testing::init_kernel();
        let base = 0x2_0000u64;
        let p = Process::create("uaccess-cross").unwrap();
        {
            let mut aspace = p.aspace().lock();
            aspace
                .map(
                    base,
                    2 * PAGE_SIZE as u64,
                    Protection::RW,
                    RegionFlags::PRIVATE,
                    RegionSource::Anonymous,
                )
                .unwrap();
        }
        let data: Vec<u8> = (0u8..=255).cycle().take(PAGE_SIZE + 64).collect();
        let at = base + PAGE_SIZE as u64 - 32;
        copy_to_user_in(&p, at, &data).unwrap();
        let mut back = alloc::vec![0u8; data.len()];
        copy_from_user_in(&p, &mut back, at).unwrap();
        assert_eq!(back, data);
        p.exit(0);
    }

    #[test]
    fn unmapped_source_is_invalid_addr() {
        crate::testing::init_kernel();
        let p = Process::create("uaccess-bad").unwrap();
        let mut buf = [0u8; 8];
        assert_eq!(
            copy_from_user_in(&p, &mut buf, 0xDEAD_BEEF_000),
            Err(Status::InvalidAddr)
        );
        p.exit(0);
    }

    #[test]
    fn kernel_addresses_are_rejected() {
        crate::testing::init_kernel();
        let p = Process::create("uaccess-kaddr").unwrap();
        let mut buf = [0u8; 8];
        assert_eq!(
            copy_from_user_in(&p, &mut buf, crate::mm::KERNEL_BASE),
            Err(Status::InvalidAddr)
        );
        // A range that wraps past the user half is rejected too.
        assert_eq!(
            copy_to_user_in(&p, crate::mm::USER_TOP - 4, &[0u8; 8]),
            Err(Status::InvalidAddr)
        );
        p.exit(0);
    }

    #[test]
    fn string_copy_honours_bounds() {
        crate::testing::init_kernel();
        let base = 0x3_0000u64;
        let p = process_with_page(base);
        copy_to_user_in(&p, base, b"hello\0world").unwrap();
        assert_eq!(copy_string_from_user_in(&p, base, 64).unwrap(), "hello");
        assert_eq!(
            copy_string_from_user_in(&p, base, 3),
            Err(Status::TooLong)
        );
        p.exit(0);
    }
}
