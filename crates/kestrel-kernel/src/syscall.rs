//! Syscall decoding and the per-call execution context.
//!
//! A syscall value packs the subsystem group in its top byte and the
//! group-specific opcode in the low 24 bits. The group picks the handler
//! from the [`SyscallTable`](dispatch::SyscallTable); the handler decodes
//! the opcode.

pub mod dispatch;

use crate::error::{Errno, SyscallError};
use crate::thread::tcb::ThreadControlBlock;
use crate::timer::Timers;
use kestrel_hal::{AddressSpace, Cpu, VirtAddr};
use std::fmt;
use std::sync::Arc;

pub use dispatch::{eval_syscall_block, BlockHook, DispatchOutcome, SyscallFn, SyscallTable};

/// Syscall group identifiers.
pub mod group {
    pub const SCHED: u8 = 0;
    pub const SCHED_THREAD: u8 = 1;
    pub const SIGNAL: u8 = 2;
    pub const FS: u8 = 3;
    pub const LOCKS: u8 = 4;
}

const GROUP_SHIFT: u32 = 24;
const OPCODE_MASK: u32 = (1 << GROUP_SHIFT) - 1;

#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct SyscallNumber(u32);

impl SyscallNumber {
    /// Packs `group` and `opcode`; opcode bits above the low 24 are dropped.
    pub const fn new(group: u8, opcode: u32) -> Self {
        Self(((group as u32) << GROUP_SHIFT) | (opcode & OPCODE_MASK))
    }

    pub const fn from_raw(raw: u32) -> Self {
        Self(raw)
    }

    pub const fn raw(&self) -> u32 {
        self.0
    }

    pub const fn group(&self) -> u8 {
        (self.0 >> GROUP_SHIFT) as u8
    }

    pub const fn opcode(&self) -> u32 {
        self.0 & OPCODE_MASK
    }
}

impl fmt::Debug for SyscallNumber {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Syscall({}:{})", self.group(), self.opcode())
    }
}

/// One decoded `ecall`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Syscall {
    pub number: SyscallNumber,
    pub arg: VirtAddr,
}

impl Syscall {
    pub fn new(number: SyscallNumber, arg: VirtAddr) -> Self {
        Self { number, arg }
    }

    pub fn from_registers(cpu: &Cpu) -> Self {
        let (raw, arg) = cpu.syscall_args();
        Self::new(SyscallNumber::from_raw(raw), arg)
    }
}

/// What a handler gets to see of the kernel: the calling thread and the
/// shared timer pool.
pub struct SyscallContext<'a> {
    pub thread: &'a mut ThreadControlBlock,
    pub timers: &'a Timers,
}

impl<'a> SyscallContext<'a> {
    pub fn new(thread: &'a mut ThreadControlBlock, timers: &'a Timers) -> Self {
        Self { thread, timers }
    }

    pub fn set_errno(&mut self, errno: Errno) {
        self.thread.errno = errno;
    }

    pub fn address_space(&self) -> Arc<AddressSpace> {
        Arc::clone(&self.thread.address_space)
    }
}

/// Turns a handler result into the value returned to user space, recording
/// the error in the thread's errno on failure.
pub fn complete(ctx: &mut SyscallContext<'_>, result: Result<u32, SyscallError>) -> u32 {
    match result {
        Ok(value) => value,
        Err(e) => {
            ctx.set_errno(e.errno());
            e.return_value()
        }
    }
}
