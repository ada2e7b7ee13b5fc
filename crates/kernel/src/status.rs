//! Kernel status codes
//!
//! One stable numeric enumeration shared by every subsystem and exposed
//! unchanged through the system call ABI. Functions return
//! `Result<T, Status>`; the syscall layer encodes `Ok` as a non-negative
//! value and `Err(s)` as `-(s as i64)`, so `Success` (0) never appears as
//! an `Err` variant.

/// Stable error codes. The numeric values are ABI and must not change.
#[repr(i64)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Status {
    NotImplemented = 1,
    NotSupported = 2,
    WouldBlock = 3,
    Interrupted = 4,
    TimedOut = 5,
    InvalidArg = 6,
    InvalidHandle = 7,
    InvalidAddr = 8,
    Overflow = 9,
    NoMemory = 10,
    PermDenied = 11,
    NotFound = 12,
    AlreadyExists = 13,
    TooSmall = 14,
    TooLong = 15,
    InUse = 16,
    DeviceError = 17,
    DestUnreachable = 18,
    TryAgain = 19,
}

/// Numeric code for success, used on the syscall boundary.
pub const STATUS_SUCCESS: i64 = 0;

impl Status {
    /// Positive numeric code (ABI value).
    pub const fn code(self) -> i64 {
        self as i64
    }

    /// Encoding used in an integer syscall return register.
    pub const fn as_ret(self) -> i64 {
        -(self as i64)
    }

    /// Static description of the error
    pub fn description(self) -> &'static str {
        match self {
            Status::NotImplemented => "Not implemented",
            Status::NotSupported => "Not supported",
            Status::WouldBlock => "Operation would block",
            Status::Interrupted => "Interrupted",
            Status::TimedOut => "Timed out",
            Status::InvalidArg => "Invalid argument",
            Status::InvalidHandle => "Invalid handle",
            Status::InvalidAddr => "Invalid address",
            Status::Overflow => "Value too large",
            Status::NoMemory => "Out of memory",
            Status::PermDenied => "Permission denied",
            Status::NotFound => "Not found",
            Status::AlreadyExists => "Already exists",
            Status::TooSmall => "Buffer too small",
            Status::TooLong => "Name too long",
            Status::InUse => "In use",
            Status::DeviceError => "Device error",
            Status::DestUnreachable => "Destination unreachable",
            Status::TryAgain => "Try again",
        }
    }

    /// Decode a positive numeric code back to a variant.
    pub fn from_code(code: i64) -> Option<Self> {
        Some(match code {
            1 => Status::NotImplemented,
            2 => Status::NotSupported,
            3 => Status::WouldBlock,
            4 => Status::Interrupted,
            5 => Status::TimedOut,
            6 => Status::InvalidArg,
            7 => Status::InvalidHandle,
            8 => Status::InvalidAddr,
            9 => Status::Overflow,
            10 => Status::NoMemory,
            11 => Status::PermDenied,
            12 => Status::NotFound,
            13 => Status::AlreadyExists,
            14 => Status::TooSmall,
            15 => Status::TooLong,
            16 => Status::InUse,
            17 => Status::DeviceError,
            18 => Status::DestUnreachable,
            19 => Status::TryAgain,
            _ => return None,
        })
    }
}

pub type Result<T> = core::result::Result<T, Status>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn codes_are_stable() {
        assert_eq!(Status::NotImplemented.code(), 1);
        assert_eq!(Status::TimedOut.code(), 5);
        assert_eq!(Status::NoMemory.code(), 10);
        assert_eq!(Status::TryAgain.code(), 19);
    }

    #[test]
    fn ret_encoding_roundtrip() {
        for code in 1..=19 {
            let s = Status::from_code(code).unwrap();
            assert_eq!(s.as_ret(), -code);
            assert_eq!(Status::from_code(s.code()), Some(s));
        }
        assert_eq!(Status::from_code(0), None);
        assert_eq!(Status::from_code(20), None);
    }
}
