//! Lock primitives and syscall dispatch for the Kestrel kernel.
//!
//! The [`Kernel`] owns the threads, the timer pool and an immutable
//! [`SyscallTable`]. User lock words and semaphores are served by the locks
//! group in [`sync::syscalls`]; other subsystems plug into the table through
//! [`Kernel::standard_syscalls`].

pub mod error;
pub mod sync;
pub mod syscall;
pub mod thread;
pub mod timer;
pub mod types;

use crate::error::KernelError;
use crate::syscall::dispatch::SyscallTableBuilder;
use crate::syscall::{group, Syscall, SyscallContext, SyscallTable};
use crate::thread::tcb::ThreadControlBlock;
use crate::thread::ThreadManager;
use crate::timer::Timers;
use crate::types::ThreadHandle;
use kestrel_hal::{irq, AddressSpace, Cpu, TrapCause, TrapError, TrapHandler, VirtAddr};
use log::{debug, info};
use std::sync::Arc;

pub use error::{Errno, SyscallError};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct KernelConfig {
    /// Size of the timer pool bounding semaphore waits.
    pub max_timers: usize,
    /// Milliseconds the timer interrupt advances the clock by.
    pub tick_ms: u32,
}

impl Default for KernelConfig {
    fn default() -> Self {
        Self {
            max_timers: 16,
            tick_ms: 10,
        }
    }
}

impl KernelConfig {
    pub fn validate(&self) -> Result<(), KernelError> {
        if self.max_timers == 0 || self.max_timers > u16::MAX as usize + 1 {
            return Err(KernelError::Init(format!(
                "max_timers must be in 1..={}, got {}",
                u16::MAX as usize + 1,
                self.max_timers
            )));
        }
        if self.tick_ms == 0 {
            return Err(KernelError::Init("tick_ms must be non-zero".into()));
        }
        Ok(())
    }
}

#[derive(Debug)]
pub struct Kernel {
    config: KernelConfig,
    syscalls: SyscallTable,
    timers: Timers,
    thread_manager: ThreadManager,
}

impl Kernel {
    pub fn new(config: KernelConfig) -> Result<Self, KernelError> {
        Self::with_syscalls(config, Self::standard_syscalls()?.build())
    }

    /// Table builder with the groups this crate implements already
    /// registered.
    pub fn standard_syscalls() -> Result<SyscallTableBuilder, KernelError> {
        SyscallTable::builder().register(group::LOCKS, sync::syscalls::handle_syscall)
    }

    pub fn with_syscalls(config: KernelConfig, syscalls: SyscallTable) -> Result<Self, KernelError> {
        config.validate()?;
        info!(
            "kernel up: {} syscall groups, {} timers, {} ms tick",
            syscalls.len(),
            config.max_timers,
            config.tick_ms
        );
        Ok(Self {
            config,
            syscalls,
            timers: Timers::new(config.max_timers),
            thread_manager: ThreadManager::new(),
        })
    }

    pub fn config(&self) -> &KernelConfig {
        &self.config
    }

    pub fn timers(&self) -> &Timers {
        &self.timers
    }

    pub fn syscalls(&self) -> &SyscallTable {
        &self.syscalls
    }

    pub fn spawn_thread(
        &mut self,
        address_space: Arc<AddressSpace>,
        entry_point: VirtAddr,
        stack_top: u32,
    ) -> Result<ThreadHandle, KernelError> {
        self.thread_manager
            .create_thread(address_space, entry_point, stack_top)
    }

    pub fn switch_to(&mut self, handle: ThreadHandle, cpu: &mut Cpu) -> Result<(), KernelError> {
        self.thread_manager.switch_to(handle, cpu)
    }

    pub fn current_thread(&self) -> Option<ThreadHandle> {
        self.thread_manager.current()
    }

    pub fn thread(&self, handle: ThreadHandle) -> Option<&ThreadControlBlock> {
        self.thread_manager.get(handle)
    }

    pub fn thread_mut(&mut self, handle: ThreadHandle) -> Option<&mut ThreadControlBlock> {
        self.thread_manager.get_mut(handle)
    }

    pub fn wake_thread(&mut self, handle: ThreadHandle) {
        self.thread_manager.wake_thread(handle);
    }

    /// One timer interrupt: advances the clock by `tick_ms` in interrupt
    /// context. Returns how many timers expired.
    pub fn tick(&self) -> usize {
        let _handler = irq::enter_handler();
        let expired = self.timers.advance(self.config.tick_ms);
        if expired > 0 {
            debug!("tick: {} timers expired", expired);
        }
        expired
    }

    /// Serves an `ecall` of the current thread: result in `a0`, blocked flag
    /// in `a1`, resume after the `ecall`.
    pub fn handle_syscall(&mut self, cpu: &mut Cpu) -> Result<VirtAddr, TrapError> {
        let call = Syscall::from_registers(cpu);
        let thread = self
            .thread_manager
            .current_mut()
            .ok_or_else(|| TrapError::HandlerPanic("syscall with no current thread".into()))?;

        let mut ctx = SyscallContext::new(thread, &self.timers);
        let outcome = self.syscalls.dispatch(&mut ctx, call);
        debug!(
            "{}: {:?} -> {:#x}{}",
            thread.handle,
            call.number,
            outcome.value,
            if outcome.blocked { " (blocked)" } else { "" }
        );

        cpu.set_syscall_return(outcome.value, outcome.blocked);
        Ok(VirtAddr::new(cpu.pc.wrapping_add(4)))
    }
}

impl TrapHandler for Kernel {
    fn handle_trap(&mut self, cause: TrapCause, cpu: &mut Cpu) -> Result<VirtAddr, TrapError> {
        match cause {
            TrapCause::EnvironmentCallFromU | TrapCause::EnvironmentCallFromS => {
                self.handle_syscall(cpu)
            }
            TrapCause::TimerInterrupt => {
                self.tick();
                Ok(VirtAddr::new(cpu.pc))
            }
            _ => Err(TrapError::Unhandled(cause)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn config_rejects_degenerate_values() {
        assert!(KernelConfig::default().validate().is_ok());
        let no_timers = KernelConfig {
            max_timers: 0,
            ..Default::default()
        };
        assert!(matches!(no_timers.validate(), Err(KernelError::Init(_))));
        let no_tick = KernelConfig {
            tick_ms: 0,
            ..Default::default()
        };
        assert!(matches!(no_tick.validate(), Err(KernelError::Init(_))));
    }

    #[test]
    fn syscall_without_a_thread_is_a_trap_error() {
        let mut kernel = Kernel::new(KernelConfig::default()).unwrap();
        let mut cpu = Cpu::new(0x100);
        assert!(matches!(
            kernel.handle_trap(TrapCause::EnvironmentCallFromU, &mut cpu),
            Err(TrapError::HandlerPanic(_))
        ));
    }

    #[test]
    fn standard_table_reaches_the_locks_group() {
        let kernel = Kernel::new(KernelConfig::default()).unwrap();
        assert_eq!(kernel.syscalls().len(), group::LOCKS as usize + 1);
    }
}
