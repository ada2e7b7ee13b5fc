//! Signals
//!
//! A POSIX-compatible subset: stable numbers, a typed bitset for masks so
//! invalid signal numbers are rejected at the boundary, and the `SigInfo`
//! record delivered with each signal. Delivery happens on the
//! return-to-user path of the interrupt dispatcher.

use crate::status::{Result, Status};

/// Signal numbers (POSIX-compatible subset)
#[repr(u32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Signal {
    Hup = 1,
    Int = 2,
    Quit = 3,
    Ill = 4,
    Trap = 5,
    Abrt = 6,
    Bus = 7,
    Fpe = 8,
    Kill = 9,
    Usr1 = 10,
    Segv = 11,
    Usr2 = 12,
    Pipe = 13,
    Alrm = 14,
    Term = 15,
    Chld = 17,
    Cont = 18,
    Stop = 19,
}

/// Highest valid signal number.
pub const SIGNAL_MAX: u32 = 19;

impl Signal {
    pub fn from_u32(signo: u32) -> Option<Self> {
        Some(match signo {
            1 => Signal::Hup,
            2 => Signal::Int,
            3 => Signal::Quit,
            4 => Signal::Ill,
            5 => Signal::Trap,
            6 => Signal::Abrt,
            7 => Signal::Bus,
            8 => Signal::Fpe,
            9 => Signal::Kill,
            10 => Signal::Usr1,
            11 => Signal::Segv,
            12 => Signal::Usr2,
            13 => Signal::Pipe,
            14 => Signal::Alrm,
            15 => Signal::Term,
            17 => Signal::Chld,
            18 => Signal::Cont,
            19 => Signal::Stop,
            _ => return None,
        })
    }

    pub fn number(self) -> u32 {
        self as u32
    }

    /// Whether the signal can be caught, blocked or ignored.
    pub fn is_catchable(self) -> bool {
        !matches!(self, Signal::Kill | Signal::Stop)
    }

    pub fn default_action(self) -> SignalAction {
        match self {
            Signal::Chld | Signal::Cont => SignalAction::Ignore,
            Signal::Stop => SignalAction::Stop,
            _ => SignalAction::Terminate,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SignalAction {
    Ignore,
    Terminate,
    Stop,
}

/// `si_code` values for SIGSEGV.
pub const SEGV_MAPERR: i32 = 1;
pub const SEGV_ACCERR: i32 = 2;

/// Signal metadata delivered with the signal.
#[derive(Debug, Clone, Copy)]
pub struct SigInfo {
    pub signo: u32,
    pub code: i32,
    /// Faulting address for hardware-raised signals.
    pub addr: u64,
}

impl SigInfo {
    pub fn new(signal: Signal, code: i32, addr: u64) -> Self {
        Self {
            signo: signal.number(),
            code,
            addr,
        }
    }
}

/// Typed bitset over the finite signal set.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct SignalSet(u64);

impl SignalSet {
    pub const fn empty() -> Self {
        Self(0)
    }

    pub fn add(&mut self, signal: Signal) {
        self.0 |= 1 << signal.number();
    }

    pub fn remove(&mut self, signal: Signal) {
        self.0 &= !(1 << signal.number());
    }

    pub fn contains(&self, signal: Signal) -> bool {
        self.0 & (1 << signal.number()) != 0
    }

    pub fn is_empty(&self) -> bool {
        self.0 == 0
    }

    /// Lowest pending signal, if any.
    pub fn first(&self) -> Option<Signal> {
        if self.0 == 0 {
            return None;
        }
        Signal::from_u32(self.0.trailing_zeros())
    }

    /// Build from a raw user-supplied word, rejecting bits outside the
    /// valid signal range.
    pub fn from_raw(raw: u64) -> Result<Self> {
        if raw & !Self::valid_mask() != 0 {
            return Err(Status::InvalidArg);
        }
        Ok(Self(raw))
    }

    pub fn raw(&self) -> u64 {
        self.0
    }

    fn valid_mask() -> u64 {
        let mut mask = 0;
        for n in 1..=SIGNAL_MAX {
            if Signal::from_u32(n).is_some() {
                mask |= 1 << n;
            }
        }
        mask
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn set_membership() {
        let mut set = SignalSet::empty();
        set.add(Signal::Segv);
        set.add(Signal::Term);
        assert!(set.contains(Signal::Segv));
        assert!(!set.contains(Signal::Kill));
        assert_eq!(set.first(), Some(Signal::Segv));
        set.remove(Signal::Segv);
        assert_eq!(set.first(), Some(Signal::Term));
    }

    #[test]
    fn raw_rejects_invalid_bits() {
        assert!(SignalSet::from_raw(1 << Signal::Kill.number()).is_ok());
        // Bit 16 is a hole in the subset; bit 63 is out of range.
        assert_eq!(SignalSet::from_raw(1 << 16), Err(Status::InvalidArg));
        assert_eq!(SignalSet::from_raw(1 << 63), Err(Status::InvalidArg));
    }

    #[test]
    fn kill_and_stop_are_uncatchable() {
        assert!(!Signal::Kill.is_catchable());
        assert!(!Signal::Stop.is_catchable());
        assert!(Signal::Segv.is_catchable());
    }
}
