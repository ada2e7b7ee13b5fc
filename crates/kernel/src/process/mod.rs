//! Processes
//!
//! A process owns its MMU context and address space, its threads, and
//! the map of futexes it has touched. Threads share the context while
//! alive; the context is destroyed when the process goes away and no
//! CPU still references it.

use crate::mm::mmu::MmuContext;
use crate::mm::region::AddressSpace;
use crate::sched::thread::ThreadId;
use crate::status::{Result, Status};
use crate::sync::futex::{self, Futex};
use crate::sync::mutex::Locked;
use crate::sync::spinlock::SpinLock;
use alloc::collections::BTreeMap;
use alloc::string::String;
use alloc::sync::Arc;
use alloc::vec::Vec;
use core::sync::atomic::{AtomicU32, Ordering};

pub type ProcessId = u32;

pub struct Process {
    id: ProcessId,
    name: String,
    /// The address space's MMU context, duplicated here so the context
    /// switch can reach it without taking the address-space mutex.
    mmu: Arc<MmuContext>,
    aspace: Locked<AddressSpace>,
    /// Futexes this process has touched, keyed by physical address.
    futexes: SpinLock<BTreeMap<u64, Arc<Futex>>>,
    threads: SpinLock<Vec<ThreadId>>,
    exit_code: AtomicU32,
}

static TABLE: SpinLock<BTreeMap<ProcessId, Arc<Process>>> = SpinLock::new(BTreeMap::new());
static NEXT_ID: AtomicU32 = AtomicU32::new(1);

impl Process {
    fn from_aspace(name: &str, aspace: AddressSpace) -> Arc<Process> {
        let id = NEXT_ID.fetch_add(1, Ordering::AcqRel);
        let process = Arc::new(Process {
            id,
            name: String::from(name),
            mmu: aspace.mmu().clone(),
            aspace: Locked::new("aspace", aspace),
            futexes: SpinLock::new(BTreeMap::new()),
            threads: SpinLock::new(Vec::new()),
            exit_code: AtomicU32::new(0),
        });
        TABLE.lock().insert(id, process.clone());
        crate::debug!("process: created {} ({})", name, id);
        process
    }

    pub fn create(name: &str) -> Result<Arc<Process>> {
        Ok(Self::from_aspace(name, AddressSpace::new()?))
    }

    pub fn id(&self) -> ProcessId {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn aspace(&self) -> &Locked<AddressSpace> {
        &self.aspace
    }

    pub fn mmu(&self) -> &Arc<MmuContext> {
        &self.mmu
    }

    pub fn exit_code(&self) -> i32 {
        self.exit_code.load(Ordering::Acquire) as i32
    }

    /// Create a thread owned by this process.
    pub fn spawn_thread(
        self: &Arc<Self>,
        name: &str,
        entry: fn(usize),
        arg: usize,
    ) -> Result<Arc<crate::sched::thread::Thread>> {
        let thread = crate::sched::thread::create(
            self.id,
            name,
            entry,
            arg,
            crate::sched::thread::DEFAULT_PRIORITY,
        )?;
        self.threads.lock().push(thread.id());
        crate::sched::run(&thread);
        Ok(thread)
    }

    pub fn thread_ids(&self) -> Vec<ThreadId> {
        self.threads.lock().clone()
    }

    /// The futex behind a user address, faulting the page in and
    /// pinning it for as long as this process holds the futex.
    pub fn futex_for(&self, addr: u64) -> Result<Arc<Futex>> {
        futex::validate_addr(addr)?;
        if !crate::mm::is_user_address(addr) {
            return Err(Status::InvalidAddr);
        }
        let pa = {
            let mut aspace = self.aspace.lock();
            aspace.resolve(addr, crate::mm::mmu::Protection::READ)?
        };
        let mut futexes = self.futexes.lock();
        if let Some(existing) = futexes.get(&pa) {
            return Ok(existing.clone());
        }
        // Pin the page while the futex is registered, so the word
        // cannot be freed out from under a waiter.
        if let Some(page) = crate::mm::phys::lookup(pa) {
            page.get();
        }
        let futex = futex::table().get(pa);
        futexes.insert(pa, futex.clone());
        Ok(futex)
    }

    /// Drop every futex reference this process holds.
    fn release_futexes(&self) {
        let futexes: BTreeMap<u64, Arc<Futex>> = core::mem::take(&mut *self.futexes.lock());
        for (pa, futex) in futexes {
            futex::table().put(&futex);
            if let Some(page) = crate::mm::phys::lookup(pa) {
                page.put();
            }
        }
    }

    /// Copy-on-write duplicate of this process's memory (the core of
    /// fork). The new process starts with no threads and a fresh futex
    /// map.
    pub fn duplicate(self: &Arc<Self>, name: &str) -> Result<Arc<Process>> {
        let child_aspace = {
            let mut aspace = self.aspace.lock();
            aspace.duplicate()?
        };
        Ok(Self::from_aspace(name, child_aspace))
    }

    /// Tear the process down. All of its threads must already be dead.
    pub fn exit(&self, code: i32) {
        self.exit_code.store(code as u32, Ordering::Release);
        self.release_futexes();
        TABLE.lock().remove(&self.id);
        crate::info!("process: {} ({}) exited with {}", self.name, self.id, code);
    }
}

pub fn lookup(id: ProcessId) -> Option<Arc<Process>> {
    TABLE.lock().get(&id).cloned()
}

/// The process owning the current thread; None for kernel threads.
pub fn current() -> Option<Arc<Process>> {
    let thread = crate::sched::current()?;
    if thread.process == 0 {
        return None;
    }
    lookup(thread.process)
}

/// Point this CPU's MMU at `process`'s context (kernel context for the
/// kernel process). Called from the context switch.
pub fn switch_mmu(process: ProcessId) {
    match lookup(process) {
        Some(process) => process.mmu.load(),
        None => crate::mm::mmu::kernel_context().load(),
    }
}

/// Terminate the current thread in response to a fatal signal. On bare
/// metal the thread never returns to user mode; the hosted test kernel
/// records the kill and lets the test harness observe it.
pub fn exit_current(code: i32, _frame: &mut crate::interrupt::InterruptFrame) {
    #[cfg(target_os = "none")]
    {
        if let Some(thread) = crate::sched::current() {
            if let Some(process) = current() {
                let remaining: Vec<ThreadId> = process
                    .thread_ids()
                    .into_iter()
                    .filter(|&id| id != thread.id())
                    .collect();
                if remaining.is_empty() {
                    process.exit(code);
                }
            }
        }
        crate::sched::exit_current(code);
    }

    #[cfg(not(target_os = "none"))]
    {
        if let Some(thread) = crate::sched::current() {
            thread.set_flag(crate::sched::thread::ThreadFlags::KILLED);
        }
        crate::debug!("process: thread terminated with code {}", code);
    }
}
