//! Cross-thread stress of the blocking primitives: the mutex hammer
//! from two threads, semaphore ping-pong, and condvar signalling.

use quark_kernel::sched::thread::adopt;
use quark_kernel::sync::mutex::{Mutex, MutexFlags};
use quark_kernel::sync::{CondVar, Semaphore};
use std::sync::atomic::{AtomicU64, Ordering};

fn setup() {
    quark_kernel::boot::hosted::init(32 * 1024 * 1024);
}

#[test]
fn two_threads_hammer_recursive_mutex() {
    setup();
    static MUTEX: Mutex = Mutex::with_flags("hammer", MutexFlags::RECURSIVE);
    static COUNTER: AtomicU64 = AtomicU64::new(0);
    const ITERS: u64 = 100_000;

    let mut handles = Vec::new();
    for i in 0..2 {
        let t = adopt(if i == 0 { "hammer-a" } else { "hammer-b" });
        handles.push(std::thread::spawn(move || {
            for _ in 0..ITERS {
                MUTEX.lock_as(&t);
                let v = COUNTER.load(Ordering::Relaxed);
                COUNTER.store(v + 1, Ordering::Relaxed);
                MUTEX.unlock_as(&t);
            }
        }));
    }
    for h in handles {
        h.join().unwrap();
    }

    // No lost updates, nothing held, nobody recorded as holder.
    assert_eq!(COUNTER.load(Ordering::SeqCst), 2 * ITERS);
    assert_eq!(MUTEX.recursion_depth(), 0);
    assert_eq!(MUTEX.holder(), None);
}

#[test]
fn semaphore_bounds_a_producer_consumer_pair() {
    setup();
    static ITEMS: Semaphore = Semaphore::new("items", 0);
    static SPACE: Semaphore = Semaphore::new("space", 4);
    static PRODUCED: AtomicU64 = AtomicU64::new(0);
    static CONSUMED: AtomicU64 = AtomicU64::new(0);
    const COUNT: u64 = 2_000;

    let producer = adopt("producer");
    let consumer = adopt("consumer");

    let p = std::thread::spawn(move || {
        for _ in 0..COUNT {
            SPACE.down_as(&producer).unwrap();
            PRODUCED.fetch_add(1, Ordering::SeqCst);
            ITEMS.up();
        }
    });
    let c = std::thread::spawn(move || {
        for _ in 0..COUNT {
            ITEMS.down_as(&consumer).unwrap();
            CONSUMED.fetch_add(1, Ordering::SeqCst);
            SPACE.up();
        }
    });
    p.join().unwrap();
    c.join().unwrap();

    assert_eq!(PRODUCED.load(Ordering::SeqCst), COUNT);
    assert_eq!(CONSUMED.load(Ordering::SeqCst), COUNT);
    assert_eq!(ITEMS.count(), 0);
    assert_eq!(SPACE.count(), 4);
}

#[test]
fn condvar_coordinates_state_change() {
    setup();
    static MUTEX: Mutex = Mutex::new("cv-state");
    static CV: CondVar = CondVar::new("cv-change");
    static STATE: AtomicU64 = AtomicU64::new(0);

    let waiter = adopt("cv-waiter");
    let handle = std::thread::spawn(move || {
        MUTEX.lock_as(&waiter);
        while STATE.load(Ordering::SeqCst) == 0 {
            CV.wait_as(&waiter, &MUTEX).unwrap();
        }
        let seen = STATE.load(Ordering::SeqCst);
        MUTEX.unlock_as(&waiter);
        seen
    });

    // Let the waiter park, then publish under the lock and signal.
    std::thread::sleep(std::time::Duration::from_millis(20));
    let changer = adopt("cv-changer");
    MUTEX.lock_as(&changer);
    STATE.store(17, Ordering::SeqCst);
    CV.signal();
    MUTEX.unlock_as(&changer);

    assert_eq!(handle.join().unwrap(), 17);
}
