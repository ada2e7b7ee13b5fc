//! Thread lifecycle
//!
//! A thread is the scheduled entity; it belongs to a process and owns a
//! kernel stack. States move Created → Ready → Running → Sleeping → Dead;
//! the stack is reclaimed asynchronously by the reaper after the thread's
//! final switch out, never by the thread itself.

use super::signal::{SigInfo, Signal, SignalSet};
use super::waitq::{Waiter, WaiterState};
use crate::status::{Result, Status};
use crate::sync::spinlock::SpinLock;
use alloc::collections::{BTreeMap, VecDeque};
use alloc::string::String;
use alloc::sync::Arc;
use alloc::vec::Vec;
use core::cell::UnsafeCell;
use core::sync::atomic::{AtomicU32, AtomicU8, AtomicUsize, Ordering};

/// Stable thread identifier. Never reused within a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct ThreadId(pub u32);

/// Identity used for code running before the scheduler owns the CPU
/// (boot path, interrupt stacks).
pub const BOOT_CONTEXT: ThreadId = ThreadId(u32::MAX);

/// Kernel stack: 4 pages.
pub const KSTACK_ORDER: u8 = 2;
pub const KSTACK_SIZE: usize = crate::mm::PAGE_SIZE << KSTACK_ORDER;

#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ThreadState {
    Created = 0,
    Ready = 1,
    Running = 2,
    Sleeping = 3,
    Dead = 4,
}

impl ThreadState {
    fn from_u8(v: u8) -> ThreadState {
        match v {
            0 => ThreadState::Created,
            1 => ThreadState::Ready,
            2 => ThreadState::Running,
            3 => ThreadState::Sleeping,
            _ => ThreadState::Dead,
        }
    }
}

bitflags::bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct ThreadFlags: u32 {
        /// Current sleep may be aborted by a signal or interrupt().
        const INTERRUPTIBLE = 1 << 0;
        /// Inside a guarded user-memory copy; hardware faults on user
        /// addresses report InvalidAddr instead of being fatal.
        const USERMEM = 1 << 1;
        /// Termination requested; honoured at the next interruptible
        /// point or user-mode return.
        const KILLED = 1 << 2;
        /// A guarded user-memory access faulted; the copy routine turns
        /// this into InvalidAddr.
        const USERMEM_FAULT = 1 << 3;
    }
}

/// Pending-signal state, guarded by one lock.
pub struct SignalQueue {
    pub pending: SignalSet,
    pub info: VecDeque<SigInfo>,
    pub mask: SignalSet,
    /// The signal that terminated the thread, kept for diagnostics.
    pub fatal: Option<SigInfo>,
}

pub struct Thread {
    id: ThreadId,
    name: String,
    /// Owning process id; 0 is the kernel process.
    pub(crate) process: u32,
    state: AtomicU8,
    cpu: AtomicUsize,
    priority: AtomicU8,
    /// Remaining timeslice in scheduler ticks.
    pub(crate) timeslice: AtomicU32,
    flags: AtomicU32,
    pub(crate) signals: SpinLock<SignalQueue>,
    /// Sleep slot; links the thread to at most one wait queue.
    pub(crate) waiter: Arc<Waiter>,
    /// Saved user-frame address while inside the kernel from user mode.
    user_frame: AtomicUsize,
    /// Kernel stack physical base; 0 when the host provides the stack.
    kstack: AtomicUsize,
    /// Saved CPU context. Touched only by the scheduler with interrupts
    /// disabled, or before first run.
    pub(crate) context: UnsafeCell<crate::arch::Context>,
    entry: SpinLock<Option<(fn(usize), usize)>>,
    exit_code: AtomicU32,
}

unsafe impl Send for Thread {}
unsafe impl Sync for Thread {}

impl Thread {
    pub fn id(&self) -> ThreadId {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn state(&self) -> ThreadState {
        ThreadState::from_u8(self.state.load(Ordering::Acquire))
    }

    pub(crate) fn set_state(&self, state: ThreadState) {
        self.state.store(state as u8, Ordering::Release);
    }

    pub(crate) fn transition(&self, from: ThreadState, to: ThreadState) -> bool {
        self.state
            .compare_exchange(from as u8, to as u8, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    pub fn cpu(&self) -> usize {
        self.cpu.load(Ordering::Acquire)
    }

    pub(crate) fn set_cpu(&self, cpu: usize) {
        self.cpu.store(cpu, Ordering::Release);
    }

    pub fn priority(&self) -> u8 {
        self.priority.load(Ordering::Acquire)
    }

    pub fn flags(&self) -> ThreadFlags {
        ThreadFlags::from_bits_truncate(self.flags.load(Ordering::Acquire))
    }

    pub(crate) fn set_flag(&self, flag: ThreadFlags) {
        self.flags.fetch_or(flag.bits(), Ordering::AcqRel);
    }

    pub(crate) fn clear_flag(&self, flag: ThreadFlags) {
        self.flags.fetch_and(!flag.bits(), Ordering::AcqRel);
    }

    pub fn exit_code(&self) -> i32 {
        self.exit_code.load(Ordering::Acquire) as i32
    }

    pub(crate) fn take_entry(&self) -> Option<(fn(usize), usize)> {
        self.entry.lock().take()
    }

    /// Record where the user-mode frame was saved on kernel entry, for
    /// signal setup. Zero once back in user mode.
    pub fn note_kernel_entry(&self, frame_addr: usize) {
        self.user_frame.store(frame_addr, Ordering::Release);
    }

    pub fn note_kernel_exit(&self) {
        self.user_frame.store(0, Ordering::Release);
    }

    pub fn user_frame(&self) -> Option<usize> {
        match self.user_frame.load(Ordering::Acquire) {
            0 => None,
            addr => Some(addr),
        }
    }

    /// Mark the in-progress guarded user copy as failed.
    pub fn set_usermem_fault(&self) {
        self.set_flag(ThreadFlags::USERMEM_FAULT);
    }

    /// Record the signal that is terminating this thread.
    pub fn note_fatal_signal(&self, info: SigInfo) {
        self.signals.lock().fatal = Some(info);
    }

    pub fn fatal_signal(&self) -> Option<SigInfo> {
        self.signals.lock().fatal
    }

    /// Consume the guarded-copy failure flag.
    pub fn take_usermem_fault(&self) -> bool {
        let had = self.flags().contains(ThreadFlags::USERMEM_FAULT);
        if had {
            self.clear_flag(ThreadFlags::USERMEM_FAULT);
        }
        had
    }

    /// Queue a signal and abort an interruptible sleep so it is noticed.
    pub fn send_signal(&self, info: SigInfo) {
        {
            let mut signals = self.signals.lock();
            if let Some(signal) = Signal::from_u32(info.signo) {
                signals.pending.add(signal);
                signals.info.push_back(info);
            }
        }
        if info.signo == Signal::Kill.number() {
            self.set_flag(ThreadFlags::KILLED);
        }
        super::waitq::interrupt(self);
    }

    /// Take the lowest pending unmasked signal.
    pub fn dequeue_signal(&self) -> Option<SigInfo> {
        let mut signals = self.signals.lock();
        let signal = signals.pending.first()?;
        if signals.mask.contains(signal) && signal.is_catchable() {
            return None;
        }
        signals.pending.remove(signal);
        let pos = signals
            .info
            .iter()
            .position(|i| i.signo == signal.number())?;
        signals.info.remove(pos)
    }
}

impl core::fmt::Debug for Thread {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Thread")
            .field("id", &self.id.0)
            .field("name", &self.name)
            .field("state", &self.state())
            .finish()
    }
}

/// Global thread registry.
static THREADS: SpinLock<BTreeMap<u32, Arc<Thread>>> = SpinLock::new(BTreeMap::new());

/// Threads awaiting stack reclamation.
static DEAD: SpinLock<Vec<Arc<Thread>>> = SpinLock::new(Vec::new());

static NEXT_ID: AtomicU32 = AtomicU32::new(1);

/// Default scheduling priority (middle of the range).
pub const DEFAULT_PRIORITY: u8 = 16;

/// Create a thread in the Created state. It does not run until
/// [`super::run`] inserts it into a run queue.
pub fn create(
    process: u32,
    name: &str,
    entry: fn(usize),
    arg: usize,
    priority: u8,
) -> Result<Arc<Thread>> {
    if priority as usize >= super::NUM_PRIORITIES {
        return Err(Status::InvalidArg);
    }
    let id = ThreadId(NEXT_ID.fetch_add(1, Ordering::AcqRel));

    // Bare metal gives every thread its own kernel stack; hosted threads
    // run on host stacks.
    #[cfg(target_os = "none")]
    let kstack = {
        use crate::mm::phys::AllocFlags;
        crate::mm::phys::alloc_pages(KSTACK_ORDER, AllocFlags::ZERO)? as usize
    };
    #[cfg(not(target_os = "none"))]
    let kstack = 0usize;

    let context = {
        #[cfg(target_os = "none")]
        {
            let stack_top = crate::mm::phys_to_virt(kstack as u64) as u64 + KSTACK_SIZE as u64;
            crate::arch::Context::prepare(stack_top, super::thread_trampoline as usize as u64)
        }
        #[cfg(not(target_os = "none"))]
        {
            crate::arch::Context::new()
        }
    };

    let thread = Arc::new(Thread {
        id,
        name: String::from(name),
        process,
        state: AtomicU8::new(ThreadState::Created as u8),
        cpu: AtomicUsize::new(crate::arch::cpu_id()),
        priority: AtomicU8::new(priority),
        timeslice: AtomicU32::new(0),
        flags: AtomicU32::new(0),
        signals: SpinLock::new(SignalQueue {
            pending: SignalSet::empty(),
            info: VecDeque::new(),
            mask: SignalSet::empty(),
            fatal: None,
        }),
        waiter: Arc::new(Waiter::new(id)),
        user_frame: AtomicUsize::new(0),
        kstack: AtomicUsize::new(kstack),
        context: UnsafeCell::new(context),
        entry: SpinLock::new(Some((entry, arg))),
        exit_code: AtomicU32::new(0),
    });

    THREADS.lock().insert(id.0, thread.clone());
    crate::debug!("thread: created {} ({:?})", name, id);
    Ok(thread)
}

pub fn lookup(id: ThreadId) -> Option<Arc<Thread>> {
    THREADS.lock().get(&id.0).cloned()
}

/// Move a thread to Dead and queue it for the reaper. The caller is
/// responsible for never touching its stack again.
pub(super) fn retire(thread: &Arc<Thread>, code: i32) {
    thread.exit_code.store(code as u32, Ordering::Release);
    thread.set_state(ThreadState::Dead);
    THREADS.lock().remove(&thread.id().0);
    DEAD.lock().push(thread.clone());
}

/// Reclaim stacks of dead threads. Runs in the reaper thread, never in
/// the context of the dying thread itself.
pub fn reap() -> usize {
    let dead: Vec<Arc<Thread>> = core::mem::take(&mut *DEAD.lock());
    let count = dead.len();
    for thread in dead {
        let kstack = thread.kstack.swap(0, Ordering::AcqRel);
        if kstack != 0 {
            crate::mm::phys::free_pages(kstack as u64, KSTACK_ORDER);
        }
        crate::debug!("thread: reaped {:?}", thread.id());
    }
    count
}

/// Register the calling host thread as a kernel thread. Hosted test
/// kernels use this to give identities to std threads driving the API.
#[cfg(not(target_os = "none"))]
pub fn adopt(name: &str) -> Arc<Thread> {
    adopt_for(name, 0)
}

/// As [`adopt`], owned by a specific process.
#[cfg(not(target_os = "none"))]
pub fn adopt_for(name: &str, process: u32) -> Arc<Thread> {
    let id = ThreadId(NEXT_ID.fetch_add(1, Ordering::AcqRel));
    let thread = Arc::new(Thread {
        id,
        name: String::from(name),
        process,
        state: AtomicU8::new(ThreadState::Running as u8),
        cpu: AtomicUsize::new(crate::arch::cpu_id()),
        priority: AtomicU8::new(DEFAULT_PRIORITY),
        timeslice: AtomicU32::new(0),
        flags: AtomicU32::new(0),
        signals: SpinLock::new(SignalQueue {
            pending: SignalSet::empty(),
            info: VecDeque::new(),
            mask: SignalSet::empty(),
            fatal: None,
        }),
        waiter: Arc::new(Waiter::new(id)),
        user_frame: AtomicUsize::new(0),
        kstack: AtomicUsize::new(0),
        context: UnsafeCell::new(crate::arch::Context::new()),
        entry: SpinLock::new(None),
        exit_code: AtomicU32::new(0),
    });
    THREADS.lock().insert(id.0, thread.clone());
    thread
}

/// Abort a thread's interruptible sleep, making its blocking call return
/// Interrupted.
pub fn interrupt(thread: &Thread) -> bool {
    super::waitq::interrupt(thread)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn created_threads_are_registered() {
        fn entry(_: usize) {}
        let t = create(0, "reg-test", entry, 0, DEFAULT_PRIORITY).unwrap();
        assert_eq!(t.state(), ThreadState::Created);
        assert!(lookup(t.id()).is_some());
        retire(&t, 0);
        assert!(lookup(t.id()).is_none());
        assert!(reap() >= 1);
    }

    #[test]
    fn signal_queue_masks() {
        let t = adopt("sig-test");
        t.send_signal(SigInfo::new(Signal::Usr1, 0, 0));
        {
            let mut signals = t.signals.lock();
            signals.mask.add(Signal::Usr1);
        }
        assert!(t.dequeue_signal().is_none());
        {
            let mut signals = t.signals.lock();
            signals.mask.remove(Signal::Usr1);
        }
        let info = t.dequeue_signal().unwrap();
        assert_eq!(info.signo, Signal::Usr1.number());
    }

    #[test]
    fn kill_is_not_maskable() {
        let t = adopt("kill-test");
        {
            let mut signals = t.signals.lock();
            signals.mask.add(Signal::Kill);
        }
        t.send_signal(SigInfo::new(Signal::Kill, 0, 0));
        assert!(t.flags().contains(ThreadFlags::KILLED));
        let info = t.dequeue_signal().unwrap();
        assert_eq!(info.signo, Signal::Kill.number());
    }

    #[test]
    fn invalid_priority_rejected() {
        fn entry(_: usize) {}
        assert_eq!(
            create(0, "bad-prio", entry, 0, 200).err(),
            Some(Status::InvalidArg)
        );
    }
}
