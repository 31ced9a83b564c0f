use crate::cpu::Cpu;
use crate::memory::VirtAddr;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrapCause {
    // Exceptions
    IllegalInstruction { instruction: u32 },
    LoadAccessFault { addr: VirtAddr },
    StoreAccessFault { addr: VirtAddr },

    // System calls
    EnvironmentCallFromU, // ecall from user mode
    EnvironmentCallFromS, // ecall from supervisor mode

    // Interrupts
    TimerInterrupt,
    ExternalInterrupt,
}

impl TrapCause {
    pub fn is_syscall(&self) -> bool {
        matches!(
            self,
            TrapCause::EnvironmentCallFromU | TrapCause::EnvironmentCallFromS
        )
    }
}

/// Trait that the kernel implements to handle traps
pub trait TrapHandler: Send {
    /// Handle a trap. Returns the address to resume execution.
    fn handle_trap(&mut self, cause: TrapCause, cpu: &mut Cpu) -> Result<VirtAddr, TrapError>;
}

#[derive(Debug, thiserror::Error)]
pub enum TrapError {
    #[error("unhandled trap: {0:?}")]
    Unhandled(TrapCause),

    #[error("trap handler panicked: {0}")]
    HandlerPanic(String),

    #[error("halt requested")]
    Halt,
}
