pub mod tcb;

use crate::error::KernelError;
use crate::types::ThreadHandle;
use kestrel_hal::{AddressSpace, Cpu, VirtAddr};
use log::{debug, info};
use std::collections::HashMap;
use std::sync::Arc;
use tcb::{ThreadControlBlock, ThreadState};

/// Owns every thread control block and tracks which one the hart is
/// running. Picking the next thread is the caller's business.
#[derive(Debug)]
pub struct ThreadManager {
    threads: HashMap<ThreadHandle, ThreadControlBlock>,
    current_thread: Option<ThreadHandle>,
    next_handle: u32,
}

impl ThreadManager {
    pub fn new() -> Self {
        Self {
            threads: HashMap::new(),
            current_thread: None,
            next_handle: 1,
        }
    }

    pub fn create_thread(
        &mut self,
        address_space: Arc<AddressSpace>,
        entry_point: VirtAddr,
        stack_top: u32,
    ) -> Result<ThreadHandle, KernelError> {
        let handle = ThreadHandle::new(self.next_handle).ok_or(KernelError::HandleExhausted)?;
        self.next_handle = self
            .next_handle
            .checked_add(1)
            .ok_or(KernelError::HandleExhausted)?;

        let tcb = ThreadControlBlock::new(handle, address_space, entry_point, stack_top);
        self.threads.insert(handle, tcb);
        debug!("created {} at {:?}", handle, entry_point);
        Ok(handle)
    }

    pub fn get(&self, handle: ThreadHandle) -> Option<&ThreadControlBlock> {
        self.threads.get(&handle)
    }

    pub fn get_mut(&mut self, handle: ThreadHandle) -> Option<&mut ThreadControlBlock> {
        self.threads.get_mut(&handle)
    }

    pub fn current(&self) -> Option<ThreadHandle> {
        self.current_thread
    }

    pub fn current_mut(&mut self) -> Option<&mut ThreadControlBlock> {
        let current = self.current_thread?;
        self.threads.get_mut(&current)
    }

    pub fn threads(&self) -> impl Iterator<Item = &ThreadControlBlock> {
        self.threads.values()
    }

    /// Saves the running thread's registers and loads `next`'s.
    pub fn switch_to(&mut self, next: ThreadHandle, cpu: &mut Cpu) -> Result<(), KernelError> {
        if !self.threads.contains_key(&next) {
            return Err(KernelError::NoSuchThread(next));
        }

        if let Some(tcb) = self.current_mut() {
            tcb.context.save_from(cpu);
            if tcb.state == ThreadState::Running {
                tcb.state = ThreadState::Ready;
            }
        }

        let tcb = self
            .threads
            .get_mut(&next)
            .ok_or(KernelError::NoSuchThread(next))?;
        tcb.state = ThreadState::Running;
        tcb.context.restore_to(cpu);
        self.current_thread = Some(next);
        Ok(())
    }

    pub fn exit_current_thread(&mut self, code: i32) {
        if let Some(tcb) = self.current_mut() {
            info!("{} exited with {}", tcb.handle, code);
            tcb.state = ThreadState::Terminated { exit_code: code };
        }
        self.current_thread = None;
    }

    pub fn wake_thread(&mut self, handle: ThreadHandle) {
        if let Some(tcb) = self.threads.get_mut(&handle) {
            if tcb.state == ThreadState::Blocked {
                tcb.state = ThreadState::Ready;
            }
        }
    }
}

impl Default for ThreadManager {
    fn default() -> Self {
        Self::new()
    }
}
