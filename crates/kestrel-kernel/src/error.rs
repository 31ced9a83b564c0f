use crate::types::ThreadHandle;
use kestrel_hal::VirtAddr;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum KernelError {
    #[error("initialization error: {0}")]
    Init(String),

    #[error("no such thread: {0}")]
    NoSuchThread(ThreadHandle),

    #[error("thread handles exhausted")]
    HandleExhausted,

    #[error("syscall group {0} registered twice")]
    DuplicateGroup(u8),
}

/// Value of a thread's pending-error field.
///
/// Codes follow the usual POSIX numbering so user space can hand them
/// straight to its `errno`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Hash)]
#[repr(i32)]
pub enum Errno {
    #[default]
    None = 0,
    NotPermitted = 1,
    ResourceExhausted = 11,
    BadAddress = 14,
    Busy = 16,
    NotImplemented = 38,
    TimedOut = 110,
}

impl Errno {
    pub fn code(self) -> i32 {
        self as i32
    }

    pub fn is_error(self) -> bool {
        self != Errno::None
    }
}

/// Return value for a failed `semaphore_wait` (-2 in the user ABI).
pub const WAIT_FAILED: u32 = -2i32 as u32;

/// Return value for a rejected user pointer (-1 in the user ABI).
pub const BAD_ADDRESS_RESULT: u32 = u32::MAX;

/// Return value of `test_and_set` when the word was already held.
pub const ALREADY_LOCKED_RESULT: u32 = 2;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum SyscallError {
    #[error("bad user address {0:?}")]
    BadAddress(VirtAddr),

    #[error("lock already held")]
    AlreadyLocked,

    #[error("syscall {0:#010x} not implemented")]
    NotImplemented(u32),

    #[error("no free timer for a bounded wait")]
    ResourceExhausted,

    #[error("wait timed out")]
    TimedOut,
}

impl SyscallError {
    pub fn errno(&self) -> Errno {
        match self {
            SyscallError::BadAddress(_) => Errno::BadAddress,
            SyscallError::AlreadyLocked => Errno::Busy,
            SyscallError::NotImplemented(_) => Errno::NotImplemented,
            SyscallError::ResourceExhausted => Errno::ResourceExhausted,
            SyscallError::TimedOut => Errno::TimedOut,
        }
    }

    /// What the failing call hands back in `a0`.
    pub fn return_value(&self) -> u32 {
        match self {
            SyscallError::BadAddress(_) => BAD_ADDRESS_RESULT,
            SyscallError::AlreadyLocked => ALREADY_LOCKED_RESULT,
            SyscallError::NotImplemented(_) => 0,
            SyscallError::ResourceExhausted | SyscallError::TimedOut => WAIT_FAILED,
        }
    }
}
