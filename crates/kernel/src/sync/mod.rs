//! Synchronization primitives
//!
//! From the bottom up: spinlocks (busy-wait, interrupt-masking), the
//! blocking mutex with direct handoff, condition variables, counting
//! semaphores, and futexes exposing the wait-queue machinery to user
//! mode. Everything that sleeps is built on `sched::waitq`.

pub mod condvar;
pub mod futex;
pub mod mutex;
pub mod semaphore;
pub mod spinlock;

pub use condvar::CondVar;
pub use mutex::{Locked, Mutex, MutexFlags};
pub use semaphore::Semaphore;
pub use spinlock::SpinLock;
