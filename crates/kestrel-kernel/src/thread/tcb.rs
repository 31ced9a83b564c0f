use crate::error::Errno;
use crate::types::{ThreadHandle, TimerId};
use bitflags::bitflags;
use kestrel_hal::{AddressSpace, Cpu, Register, VirtAddr};
use std::sync::Arc;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ThreadState {
    Ready,
    Running,
    Blocked,
    Terminated { exit_code: i32 },
}

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct ThreadFlags: u32 {
        /// Put the thread to sleep on the way back from the current syscall.
        const SYSCALL_WAIT = 1 << 0;
    }
}

pub struct ThreadControlBlock {
    pub handle: ThreadHandle,
    pub state: ThreadState,
    pub flags: ThreadFlags,
    /// Pending error of the last syscall.
    pub errno: Errno,
    /// Timer bounding an in-progress semaphore wait.
    pub wait_timer: Option<TimerId>,
    pub address_space: Arc<AddressSpace>,
    pub context: SavedContext,
}

impl ThreadControlBlock {
    pub fn new(
        handle: ThreadHandle,
        address_space: Arc<AddressSpace>,
        entry_point: VirtAddr,
        stack_top: u32,
    ) -> Self {
        Self {
            handle,
            state: ThreadState::Ready,
            flags: ThreadFlags::empty(),
            errno: Errno::None,
            wait_timer: None,
            address_space,
            context: SavedContext::new(entry_point, stack_top),
        }
    }
}

impl std::fmt::Debug for ThreadControlBlock {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ThreadControlBlock")
            .field("handle", &self.handle)
            .field("state", &self.state)
            .field("flags", &self.flags)
            .field("errno", &self.errno)
            .field("wait_timer", &self.wait_timer)
            .finish_non_exhaustive()
    }
}

#[derive(Debug, Clone, Copy)]
pub struct SavedContext {
    pub pc: u32,
    pub regs: [u32; 32],
}

impl SavedContext {
    pub fn new(entry_point: VirtAddr, stack_top: u32) -> Self {
        let mut regs = [0; 32];
        regs[Register::SP.val()] = stack_top;
        Self {
            pc: entry_point.val(),
            regs,
        }
    }

    pub fn save_from(&mut self, cpu: &Cpu) {
        self.pc = cpu.pc;
        self.regs = cpu.regs;
    }

    pub fn restore_to(&self, cpu: &mut Cpu) {
        cpu.pc = self.pc;
        cpu.regs = self.regs;
    }
}
