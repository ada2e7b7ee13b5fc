//! System-call dispatch
//!
//! A stable 32-bit identifier names a service table (high half) and a
//! call within it (low half). The dispatcher clamps both indices,
//! dereferences the function and invokes it with six integer-register
//! arguments; the result register carries a non-negative value on
//! success or a negated status code.

pub mod uaccess;

use crate::mm::mmu::Protection;
use crate::mm::region::{RegionFlags, RegionSource};
use crate::status::{Result, Status};

pub type SyscallArgs = [u64; 6];
pub type SyscallFn = fn(&SyscallArgs) -> Result<u64>;

pub struct Service {
    pub name: &'static str,
    pub calls: &'static [SyscallFn],
}

/// Stub for surface that exists in the ABI but is served elsewhere
/// (files, IPC, handles) or not yet.
fn sys_not_implemented(_args: &SyscallArgs) -> Result<u64> {
    Err(Status::NotImplemented)
}

// Service 0: core kernel calls.
const CORE_CALLS: &[SyscallFn] = &[
    sys_thread_exit,     // 0
    sys_thread_sleep,    // 1
    sys_thread_id,       // 2
    sys_clock_monotonic, // 3
    sys_clock_realtime,  // 4
    sys_vm_map,          // 5
    sys_vm_unmap,        // 6
    sys_vm_protect,      // 7
    sys_futex_wait,      // 8
    sys_futex_wake,      // 9
    sys_futex_requeue,   // 10
    sys_system_fatal,    // 11
    sys_system_shutdown, // 12
];

// Service 1: object/handle surface (external to the core).
const OBJECT_CALLS: &[SyscallFn] = &[
    sys_not_implemented, // handle_close
    sys_not_implemented, // handle_duplicate
    sys_not_implemented, // handle_flags
    sys_not_implemented, // handle_wait
];

// Service 2: file surface (VFS is an external collaborator).
const FILE_CALLS: &[SyscallFn] = &[
    sys_not_implemented, // file_read
    sys_not_implemented, // file_write
    sys_not_implemented, // file_seek
    sys_not_implemented, // file_info
    sys_not_implemented, // file_sync
    sys_not_implemented, // dir_read
];

// Service 3: IPC ports (external to the core).
const IPC_CALLS: &[SyscallFn] = &[
    sys_not_implemented, // port_create
    sys_not_implemented, // port_listen
    sys_not_implemented, // connection_send
    sys_not_implemented, // connection_receive
];

static SERVICES: &[Service] = &[
    Service {
        name: "core",
        calls: CORE_CALLS,
    },
    Service {
        name: "object",
        calls: OBJECT_CALLS,
    },
    Service {
        name: "file",
        calls: FILE_CALLS,
    },
    Service {
        name: "ipc",
        calls: IPC_CALLS,
    },
];

/// Split a call identifier into (service, call).
pub fn split_id(id: u32) -> (usize, usize) {
    ((id >> 16) as usize, (id & 0xFFFF) as usize)
}

pub const fn call_id(service: u16, call: u16) -> u32 {
    ((service as u32) << 16) | call as u32
}

/// Route one system call. Unknown identifiers are clamped into
/// NotImplemented rather than faulting.
pub fn dispatch(id: u32, args: &SyscallArgs) -> i64 {
    let (service_idx, call_idx) = split_id(id);
    let Some(service) = SERVICES.get(service_idx) else {
        return Status::NotImplemented.as_ret();
    };
    let Some(func) = service.calls.get(call_idx) else {
        return Status::NotImplemented.as_ret();
    };
    match func(args) {
        Ok(value) => value as i64,
        Err(status) => {
            crate::trace!(
                "syscall: {}:{} -> {:?}",
                service.name,
                call_idx,
                status
            );
            status.as_ret()
        }
    }
}

fn current_process() -> Result<alloc::sync::Arc<crate::process::Process>> {
    crate::process::current().ok_or(Status::NotFound)
}

fn current_thread() -> Result<alloc::sync::Arc<crate::sched::thread::Thread>> {
    crate::sched::current().ok_or(Status::NotFound)
}

fn sys_thread_exit(args: &SyscallArgs) -> Result<u64> {
    let _code = args[0] as i32;
    #[cfg(target_os = "none")]
    {
        crate::sched::exit_current(_code)
    }
    #[cfg(not(target_os = "none"))]
    {
        Err(Status::NotSupported)
    }
}

fn sys_thread_sleep(args: &SyscallArgs) -> Result<u64> {
    let thread = current_thread()?;
    crate::time::timer::sleep_ns(&thread, args[0])?;
    Ok(0)
}

fn sys_thread_id(_args: &SyscallArgs) -> Result<u64> {
    Ok(current_thread()?.id().0 as u64)
}

fn sys_clock_monotonic(_args: &SyscallArgs) -> Result<u64> {
    Ok(crate::time::monotonic_ns())
}

fn sys_clock_realtime(_args: &SyscallArgs) -> Result<u64> {
    Ok(crate::time::realtime_ns())
}

/// args: addr, size, protection bits, flag bits. Returns the base.
fn sys_vm_map(args: &SyscallArgs) -> Result<u64> {
    let process = current_process()?;
    let prot = Protection::from_bits(args[2] as u32).ok_or(Status::InvalidArg)?;
    let flags = RegionFlags::from_bits(args[3] as u32).ok_or(Status::InvalidArg)?;
    let mut aspace = process.aspace().lock();
    aspace.map(args[0], args[1], prot, flags, RegionSource::Anonymous)
}

fn sys_vm_unmap(args: &SyscallArgs) -> Result<u64> {
    let process = current_process()?;
    let mut aspace = process.aspace().lock();
    aspace.unmap(args[0], args[1])?;
    Ok(0)
}

fn sys_vm_protect(args: &SyscallArgs) -> Result<u64> {
    let process = current_process()?;
    let prot = Protection::from_bits(args[2] as u32).ok_or(Status::InvalidArg)?;
    let mut aspace = process.aspace().lock();
    aspace.protect(args[0], args[1], prot)?;
    Ok(0)
}

/// args: addr, expected, timeout_ns (u64::MAX = none).
fn sys_futex_wait(args: &SyscallArgs) -> Result<u64> {
    let process = current_process()?;
    let thread = current_thread()?;
    let futex = process.futex_for(args[0])?;
    let timeout = if args[2] == u64::MAX {
        None
    } else {
        Some(args[2])
    };
    crate::sync::futex::wait(&futex, &thread, args[1] as i32, timeout)?;
    Ok(0)
}

/// args: addr, count. Returns number woken.
fn sys_futex_wake(args: &SyscallArgs) -> Result<u64> {
    let process = current_process()?;
    let futex = process.futex_for(args[0])?;
    Ok(crate::sync::futex::wake(&futex, args[1] as usize) as u64)
}

/// args: src addr, expected, wake count, dst addr. Returns woken.
fn sys_futex_requeue(args: &SyscallArgs) -> Result<u64> {
    let process = current_process()?;
    let src = process.futex_for(args[0])?;
    let dst = process.futex_for(args[3])?;
    let (woken, _moved) =
        crate::sync::futex::requeue(&src, args[1] as i32, args[2] as usize, &dst)?;
    Ok(woken as u64)
}

fn sys_system_fatal(args: &SyscallArgs) -> Result<u64> {
    if current_process().is_err() {
        return Err(Status::PermDenied);
    }
    crate::fatal!("user-requested fatal ({:#x})", args[0]);
}

fn sys_system_shutdown(_args: &SyscallArgs) -> Result<u64> {
    crate::info!("syscall: shutdown requested");
    Err(Status::NotSupported)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn id_split_round_trips() {
        let id = call_id(2, 5);
        assert_eq!(split_id(id), (2, 5));
        assert_eq!(split_id(call_id(0, 0)), (0, 0));
    }

    #[test]
    fn unknown_ids_clamp_to_not_implemented() {
        let args: SyscallArgs = [0; 6];
        assert_eq!(
            dispatch(call_id(999, 0), &args),
            Status::NotImplemented.as_ret()
        );
        assert_eq!(
            dispatch(call_id(0, 999), &args),
            Status::NotImplemented.as_ret()
        );
        // External-surface stubs answer the same way.
        assert_eq!(
            dispatch(call_id(2, 0), &args),
            Status::NotImplemented.as_ret()
        );
    }

    #[test]
    fn clock_calls_return_time() {
        let args: SyscallArgs = [0; 6];
        let a = dispatch(call_id(0, 3), &args);
        let b = dispatch(call_id(0, 3), &args);
        assert!(a >= 0);
        assert!(b >= a);
    }

    #[test]
    fn vm_map_requires_a_process() {
        // Without a current process the call reports NotFound.
        let args: SyscallArgs = [0, 0x1000, 0x3, 0x1, 0, 0];
        assert_eq!(dispatch(call_id(0, 5), &args), Status::NotFound.as_ret());
    }
}
