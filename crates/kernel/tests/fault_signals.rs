//! The user-visible face of a bad memory access: a page fault from user
//! mode with no backing region must surface as SIGSEGV with the map
//! error code and the faulting address, delivered to the current thread.
//!
//! This test installs itself as the CPU's current thread, so it runs
//! alone in this binary.

use quark_kernel::interrupt::{dispatch, InterruptFrame, PageFaultError};
use quark_kernel::mm::mmu::Protection;
use quark_kernel::mm::region::{RegionFlags, RegionSource};
use quark_kernel::mm::PAGE_SIZE;
use quark_kernel::process::Process;
use quark_kernel::sched::signal::{Signal, SEGV_ACCERR, SEGV_MAPERR};
use quark_kernel::sched::thread::adopt_for;
use quark_kernel::smp::percpu;

fn user_fault_frame(addr: u64, error: PageFaultError) -> InterruptFrame {
    InterruptFrame {
        vector: 14,
        error_code: error.bits(),
        fault_addr: addr,
        rip: addr,
        cs: 0x33, // ring 3
        ..Default::default()
    }
}

#[test]
fn unmapped_user_access_raises_segv_maperr() {
    quark_kernel::boot::hosted::init(32 * 1024 * 1024);

    let process = Process::create("segv-proc").unwrap();
    {
        let mut aspace = process.aspace().lock();
        aspace
            .map(
                0x10000,
                PAGE_SIZE as u64,
                Protection::READ,
                RegionFlags::PRIVATE,
                RegionSource::Anonymous,
            )
            .unwrap();
    }
    let thread = adopt_for("segv-thread", process.id());
    percpu::get(0).set_current_thread(thread.id());

    // Read of an address with no region: SEGV, map error, si_addr is
    // the faulting address. Signal delivery on the return-to-user path
    // terminates the thread; the recorded fatal signal is what user
    // mode would have seen.
    let bad = 0x7FFF_0000u64;
    let mut frame = user_fault_frame(bad, PageFaultError::USER);
    dispatch(&mut frame);
    let info = thread.fatal_signal().expect("no terminating signal");
    assert_eq!(info.signo, Signal::Segv.number());
    assert_eq!(info.code, SEGV_MAPERR);
    assert_eq!(info.addr, bad);

    // Write to a read-only region: SEGV with the access error code.
    let mut frame = user_fault_frame(
        0x10000,
        PageFaultError::USER | PageFaultError::WRITE,
    );
    dispatch(&mut frame);
    let info = thread.fatal_signal().expect("no terminating signal");
    assert_eq!(info.signo, Signal::Segv.number());
    assert_eq!(info.code, SEGV_ACCERR);
    assert_eq!(info.addr, 0x10000);

    // A resolvable fault queues nothing.
    let mut frame = user_fault_frame(0x10000, PageFaultError::USER);
    dispatch(&mut frame);
    assert!(thread.dequeue_signal().is_none());
    {
        let aspace = process.aspace().lock();
        assert!(aspace.mmu().query(0x10000).is_some());
    }

    percpu::get(0).set_current_thread(quark_kernel::sched::thread::ThreadId(0));
    process.exit(0);
}
