//! Futex behaviour through the full process path: value check under the
//! futex lock, wake across threads, and timeout bounds measured on the
//! kernel's monotonic clock.

use quark_kernel::mm::mmu::Protection;
use quark_kernel::mm::region::{RegionFlags, RegionSource};
use quark_kernel::mm::PAGE_SIZE;
use quark_kernel::process::Process;
use quark_kernel::sched::thread::adopt;
use quark_kernel::status::Status;
use quark_kernel::sync::futex;
use quark_kernel::syscall::uaccess;
use std::sync::Arc;

fn setup_process(name: &str, base: u64) -> Arc<Process> {
    quark_kernel::boot::hosted::init(32 * 1024 * 1024);
    let process = Process::create(name).unwrap();
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
    process
}

fn set_word(process: &Arc<Process>, addr: u64, value: i32) {
    uaccess::copy_to_user_in(process, addr, &value.to_ne_bytes()).unwrap();
}

#[test]
fn wait_with_stale_value_is_try_again() {
    let base = 0x10000u64;
    let process = setup_process("futex-stale", base);
    set_word(&process, base, 5);
    let f = process.futex_for(base).unwrap();
    let t = adopt("stale-waiter");
    assert_eq!(futex::wait(&f, &t, 4, None), Err(Status::TryAgain));
    process.exit(0);
}

#[test]
fn timeout_is_within_bounds() {
    let base = 0x10000u64;
    let process = setup_process("futex-timeout", base);
    set_word(&process, base, 0);
    let f = process.futex_for(base).unwrap();
    let t = adopt("timeout-waiter");

    let timeout_ns = 100_000_000u64; // 100 ms
    let start = quark_kernel::time::monotonic_ns();
    let result = futex::wait(&f, &t, 0, Some(timeout_ns));
    let elapsed = quark_kernel::time::monotonic_ns() - start;

    assert_eq!(result, Err(Status::TimedOut));
    assert!(elapsed >= timeout_ns, "woke early: {} ns", elapsed);
    assert!(
        elapsed <= timeout_ns + 10_000_000,
        "woke late: {} ns",
        elapsed
    );
    process.exit(0);
}

#[test]
fn wake_releases_parked_thread() {
    let base = 0x10000u64;
    let process = setup_process("futex-wake", base);
    set_word(&process, base, 0);
    let f = process.futex_for(base).unwrap();

    let waiter_thread = adopt("futex-sleeper");
    let f2 = f.clone();
    let handle = std::thread::spawn(move || futex::wait(&f2, &waiter_thread, 0, Some(5_000_000_000)));

    // Wait until the waiter is parked, flip the word, wake.
    let deadline = std::time::Instant::now() + std::time::Duration::from_secs(5);
    while f.waiter_count() == 0 {
        assert!(std::time::Instant::now() < deadline, "waiter never parked");
        std::thread::yield_now();
    }
    set_word(&process, base, 1);
    assert_eq!(futex::wake(&f, 1), 1);
    assert_eq!(handle.join().unwrap(), Ok(()));
    process.exit(0);
}

#[test]
fn requeue_moves_sleepers_between_words() {
    let base = 0x10000u64;
    let process = setup_process("futex-requeue", base);
    set_word(&process, base, 0);
    set_word(&process, base + 64, 0);
    let src = process.futex_for(base).unwrap();
    let dst = process.futex_for(base + 64).unwrap();

    let mut handles = Vec::new();
    for _ in 0..3 {
        let f = src.clone();
        let t = adopt("requeue-sleeper");
        handles.push(std::thread::spawn(move || {
            futex::wait(&f, &t, 0, Some(5_000_000_000))
        }));
    }

    // Wait for all three to park on src.
    let deadline = std::time::Instant::now() + std::time::Duration::from_secs(5);
    while src.waiter_count() != 3 {
        assert!(std::time::Instant::now() < deadline, "sleepers never parked");
        std::thread::yield_now();
    }

    let (woken, moved) = futex::requeue(&src, 0, 1, &dst).unwrap();
    assert_eq!((woken, moved), (1, 2));
    assert_eq!(futex::wake(&dst, 8), 2);
    for h in handles {
        assert_eq!(h.join().unwrap(), Ok(()));
    }
    process.exit(0);
}
