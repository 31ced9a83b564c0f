//! The locks syscall group: user-space test-and-set and semaphores.
//!
//! User lock words and semaphore blocks live in the caller's address space.
//! Every pointer is checked with [`AddressSpace::access_ok`] before the word
//! behind it is touched, and a rejected pointer leaves all state unchanged.
//!
//! Semaphore wait never sleeps. A caller that gets [`WAIT_PENDING`] back is
//! expected to call again; the first such answer arms a timer that bounds how
//! long those retries may go on.

use super::atomic::{self, Exchange};
use super::semaphore;
use crate::error::SyscallError;
use crate::syscall::{complete, Syscall, SyscallContext};
use bytemuck::{Pod, Zeroable};
use core::mem::{offset_of, size_of};
use core::sync::atomic::AtomicU32;
use kestrel_hal::{AddressSpace, Protection, VirtAddr};
use log::{debug, trace, warn};

pub mod opcode {
    pub const TEST_AND_SET: u32 = 0;
    pub const SEMAPHORE_WAIT: u32 = 1;
    pub const SEMAPHORE_RELEASE: u32 = 2;
}

/// Returned by a semaphore wait that has to be retried (-1 in the user ABI).
pub const WAIT_PENDING: u32 = u32::MAX;

/// User-memory semaphore.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Pod, Zeroable)]
#[repr(C)]
pub struct SemaphoreBlock {
    /// Current value.
    pub s: u32,
    /// Capacity.
    pub count: u32,
}

/// Argument record of a semaphore wait.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Pod, Zeroable)]
#[repr(C)]
pub struct SemaphoreWaitArgs {
    pub sem: u32,
    pub millisec: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitStatus {
    /// Decremented; carries the value left behind.
    Acquired(u32),
    StillWaiting,
}

/// Entry point of the locks group in the syscall table.
pub fn handle_syscall(ctx: &mut SyscallContext<'_>, call: Syscall) -> u32 {
    let result = match call.number.opcode() {
        opcode::TEST_AND_SET => test_and_set(ctx, call.arg),
        opcode::SEMAPHORE_WAIT => semaphore_wait(ctx, call.arg).map(|status| match status {
            WaitStatus::Acquired(value) => value,
            WaitStatus::StillWaiting => WAIT_PENDING,
        }),
        opcode::SEMAPHORE_RELEASE => semaphore_release(ctx, call.arg).map(|()| 0),
        _ => Err(SyscallError::NotImplemented(call.number.raw())),
    };

    if let Err(SyscallError::BadAddress(addr)) = result {
        warn!(
            "{}: {:?} rejected user pointer {:?}",
            ctx.thread.handle, call.number, addr
        );
    }
    complete(ctx, result)
}

/// One atomic exchange on the user lock word at `addr`.
pub fn test_and_set(ctx: &mut SyscallContext<'_>, addr: VirtAddr) -> Result<u32, SyscallError> {
    let space = ctx.address_space();
    let word = user_word(&space, addr, Protection::READ | Protection::WRITE)?;
    match atomic::try_acquire(word) {
        Exchange::Acquired => Ok(0),
        Exchange::AlreadyHeld => Err(SyscallError::AlreadyLocked),
    }
}

pub fn semaphore_wait(
    ctx: &mut SyscallContext<'_>,
    arg: VirtAddr,
) -> Result<WaitStatus, SyscallError> {
    let space = ctx.address_space();
    if !space.access_ok(arg, size_of::<SemaphoreWaitArgs>(), Protection::READ) {
        return Err(SyscallError::BadAddress(arg));
    }
    let args: SemaphoreWaitArgs = space
        .read_pod(arg)
        .map_err(|_| SyscallError::BadAddress(arg))?;
    let sem = UserSemaphore::resolve(&space, VirtAddr::new(args.sem))?;
    let handle = ctx.thread.handle;

    if let Some(timer) = ctx.thread.wait_timer {
        if ctx.timers.owner(timer) != Some(handle) {
            ctx.timers.release(timer);
            ctx.thread.wait_timer = None;
            debug!("{}: wait on {:#x} timed out", handle, args.sem);
            return Err(SyscallError::TimedOut);
        }
    }

    if let Some(value) = semaphore::try_down(sem.value) {
        if let Some(timer) = ctx.thread.wait_timer.take() {
            ctx.timers.release(timer);
        }
        trace!("{}: took {:#x}, {} left", handle, args.sem, value);
        return Ok(WaitStatus::Acquired(value));
    }

    if ctx.thread.wait_timer.is_none() {
        let timer = ctx
            .timers
            .add(handle, args.millisec)
            .map_err(|_| SyscallError::ResourceExhausted)?;
        ctx.thread.wait_timer = Some(timer);
    }
    Ok(WaitStatus::StillWaiting)
}

/// Increments the semaphore at `addr` unless it is already at capacity, in
/// which case the release is dropped.
pub fn semaphore_release(ctx: &mut SyscallContext<'_>, addr: VirtAddr) -> Result<(), SyscallError> {
    let space = ctx.address_space();
    let sem = UserSemaphore::resolve(&space, addr)?;
    if !semaphore::up(sem.value, sem.count) {
        trace!("{}: {:?} already at capacity {}", ctx.thread.handle, addr, sem.count);
    }
    Ok(())
}

fn user_word(
    space: &AddressSpace,
    addr: VirtAddr,
    prot: Protection,
) -> Result<&AtomicU32, SyscallError> {
    if !space.access_ok(addr, size_of::<u32>(), prot) {
        return Err(SyscallError::BadAddress(addr));
    }
    space.word(addr).map_err(|_| SyscallError::BadAddress(addr))
}

struct UserSemaphore<'a> {
    value: &'a AtomicU32,
    count: u32,
}

impl<'a> UserSemaphore<'a> {
    fn resolve(space: &'a AddressSpace, addr: VirtAddr) -> Result<Self, SyscallError> {
        let rw = Protection::READ | Protection::WRITE;
        if !space.access_ok(addr, size_of::<SemaphoreBlock>(), rw) {
            return Err(SyscallError::BadAddress(addr));
        }
        let count_addr = addr + offset_of!(SemaphoreBlock, count) as u32;
        Ok(Self {
            value: user_word(space, addr, rw)?,
            count: space
                .read_word(count_addr)
                .map_err(|_| SyscallError::BadAddress(addr))?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{Errno, WAIT_FAILED};
    use crate::syscall::{group, SyscallNumber};
    use crate::thread::tcb::ThreadControlBlock;
    use crate::timer::Timers;
    use crate::types::ThreadHandle;
    use std::sync::Arc;

    const BLOCK: u32 = 0x1000;
    const ARGS: u32 = 0x1010;
    const LOCK: u32 = 0x1020;
    const READ_ONLY: u32 = 0x4000;

    struct Fixture {
        tcb: ThreadControlBlock,
        timers: Timers,
    }

    impl Fixture {
        fn new(max_timers: usize) -> Self {
            let _ = env_logger::builder().is_test(true).try_init();
            let mut space = AddressSpace::new();
            space
                .map(VirtAddr::new(0x1000), 0x100, Protection::READ | Protection::WRITE)
                .unwrap();
            space
                .map(VirtAddr::new(READ_ONLY), 0x40, Protection::READ)
                .unwrap();
            Self {
                tcb: ThreadControlBlock::new(
                    ThreadHandle::new(1).unwrap(),
                    Arc::new(space),
                    VirtAddr::new(0),
                    0,
                ),
                timers: Timers::new(max_timers),
            }
        }

        fn with_semaphore(s: u32, count: u32, millisec: u32) -> Self {
            let fixture = Self::new(4);
            let space = &fixture.tcb.address_space;
            space
                .write_pod(VirtAddr::new(BLOCK), &SemaphoreBlock { s, count })
                .unwrap();
            space
                .write_pod(
                    VirtAddr::new(ARGS),
                    &SemaphoreWaitArgs {
                        sem: BLOCK,
                        millisec,
                    },
                )
                .unwrap();
            fixture
        }

        fn call(&mut self, op: u32, arg: u32) -> u32 {
            self.tcb.errno = Errno::None;
            let mut ctx = SyscallContext::new(&mut self.tcb, &self.timers);
            handle_syscall(
                &mut ctx,
                Syscall::new(SyscallNumber::new(group::LOCKS, op), VirtAddr::new(arg)),
            )
        }

        fn wait(&mut self) -> u32 {
            self.call(opcode::SEMAPHORE_WAIT, ARGS)
        }

        fn release(&mut self) -> u32 {
            self.call(opcode::SEMAPHORE_RELEASE, BLOCK)
        }

        fn value(&self) -> u32 {
            self.tcb.address_space.read_word(VirtAddr::new(BLOCK)).unwrap()
        }
    }

    #[test]
    fn wait_succeeds_after_release_and_frees_its_timer() {
        let mut f = Fixture::with_semaphore(0, 1, 500);

        assert_eq!(f.wait(), WAIT_PENDING);
        assert_eq!(f.tcb.errno, Errno::None);
        assert!(f.tcb.wait_timer.is_some());
        assert_eq!(f.timers.in_use(), 1);

        assert_eq!(f.release(), 0);
        assert_eq!(f.value(), 1);

        assert_eq!(f.wait(), 0);
        assert_eq!(f.tcb.errno, Errno::None);
        assert_eq!(f.value(), 0);
        assert_eq!(f.tcb.wait_timer, None);
        assert_eq!(f.timers.in_use(), 0);
    }

    #[test]
    fn wait_times_out_once_the_deadline_passes() {
        let mut f = Fixture::with_semaphore(0, 1, 500);

        assert_eq!(f.wait(), WAIT_PENDING);
        f.timers.advance(499);
        assert_eq!(f.wait(), WAIT_PENDING);
        assert_eq!(f.timers.in_use(), 1);

        f.timers.advance(1);
        assert_eq!(f.wait(), WAIT_FAILED);
        assert_eq!(f.tcb.errno, Errno::TimedOut);
        assert_eq!(f.tcb.wait_timer, None);
        assert_eq!(f.timers.in_use(), 0);
    }

    #[test]
    fn immediate_success_arms_no_timer() {
        let mut f = Fixture::with_semaphore(2, 2, 10);
        assert_eq!(f.wait(), 1);
        assert_eq!(f.wait(), 0);
        assert_eq!(f.timers.in_use(), 0);
        assert_eq!(f.tcb.wait_timer, None);
    }

    #[test]
    fn release_at_capacity_is_a_no_op() {
        let mut f = Fixture::with_semaphore(1, 1, 10);
        assert_eq!(f.release(), 0);
        assert_eq!(f.tcb.errno, Errno::None);
        assert_eq!(f.value(), 1);
    }

    #[test]
    fn exhausted_timer_pool_fails_the_wait() {
        let mut f = Fixture::with_semaphore(0, 1, 10);
        f.timers = Timers::new(0);
        assert_eq!(f.wait(), WAIT_FAILED);
        assert_eq!(f.tcb.errno, Errno::ResourceExhausted);
        assert_eq!(f.tcb.wait_timer, None);
    }

    #[test]
    fn test_and_set_reports_busy_word() {
        let mut f = Fixture::new(1);
        assert_eq!(f.call(opcode::TEST_AND_SET, LOCK), 0);
        assert_eq!(
            f.tcb.address_space.read_word(VirtAddr::new(LOCK)).unwrap(),
            atomic::HELD
        );

        assert_eq!(f.call(opcode::TEST_AND_SET, LOCK), 2);
        assert_eq!(f.tcb.errno, Errno::Busy);
    }

    #[test]
    fn bad_pointers_are_rejected_without_side_effects() {
        let mut f = Fixture::with_semaphore(0, 1, 10);

        assert_eq!(f.call(opcode::TEST_AND_SET, 0x9000), u32::MAX);
        assert_eq!(f.tcb.errno, Errno::BadAddress);

        // Readable but not writable.
        assert_eq!(f.call(opcode::TEST_AND_SET, READ_ONLY), u32::MAX);
        assert_eq!(f.tcb.errno, Errno::BadAddress);
        assert_eq!(
            f.tcb.address_space.read_word(VirtAddr::new(READ_ONLY)).unwrap(),
            0
        );

        assert_eq!(f.call(opcode::SEMAPHORE_RELEASE, 0x10fc), u32::MAX);
        assert_eq!(f.tcb.errno, Errno::BadAddress);

        // Wait arguments pointing at a block the caller cannot write.
        f.tcb
            .address_space
            .write_pod(
                VirtAddr::new(ARGS),
                &SemaphoreWaitArgs {
                    sem: READ_ONLY,
                    millisec: 10,
                },
            )
            .unwrap();
        assert_eq!(f.wait(), u32::MAX);
        assert_eq!(f.tcb.errno, Errno::BadAddress);
        assert_eq!(f.tcb.wait_timer, None);
        assert_eq!(f.timers.in_use(), 0);
    }

    #[test]
    fn unknown_opcode_is_not_implemented() {
        let mut f = Fixture::new(1);
        assert_eq!(f.call(9, LOCK), 0);
        assert_eq!(f.tcb.errno, Errno::NotImplemented);
    }
}
