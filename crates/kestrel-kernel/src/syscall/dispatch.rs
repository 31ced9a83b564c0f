use super::{Syscall, SyscallContext};
use crate::error::{Errno, KernelError};
use crate::thread::tcb::{ThreadControlBlock, ThreadFlags, ThreadState};
use log::{debug, trace, warn};

/// Handler of one syscall group. Gets the full syscall (group and opcode)
/// and is responsible for validating the argument pointer itself.
pub type SyscallFn = fn(&mut SyscallContext<'_>, Syscall) -> u32;

/// Runs after every handled syscall. Returns whether the thread must not be
/// resumed on the return path.
pub type BlockHook = fn(&mut ThreadControlBlock) -> bool;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DispatchOutcome {
    pub value: u32,
    pub blocked: bool,
}

/// Group-indexed handler table.
///
/// Built once through [`SyscallTable::builder`] and never changed after;
/// dispatch only needs `&self`, so one table serves every hart.
pub struct SyscallTable {
    handlers: Box<[SyscallFn]>,
    block_hook: BlockHook,
}

impl SyscallTable {
    pub fn builder() -> SyscallTableBuilder {
        SyscallTableBuilder::default()
    }

    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }

    pub fn dispatch(&self, ctx: &mut SyscallContext<'_>, call: Syscall) -> DispatchOutcome {
        let group = call.number.group() as usize;
        let Some(handler) = self.handlers.get(group) else {
            warn!(
                "{}: {:?} outside the table ({} groups)",
                ctx.thread.handle,
                call.number,
                self.handlers.len()
            );
            ctx.set_errno(Errno::NotImplemented);
            return DispatchOutcome {
                value: 0,
                blocked: false,
            };
        };

        ctx.set_errno(Errno::None);
        trace!("{}: {:?} arg {:?}", ctx.thread.handle, call.number, call.arg);
        let value = handler(ctx, call);
        let blocked = (self.block_hook)(ctx.thread);
        DispatchOutcome { value, blocked }
    }
}

impl std::fmt::Debug for SyscallTable {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SyscallTable")
            .field("groups", &self.handlers.len())
            .finish_non_exhaustive()
    }
}

#[derive(Default)]
pub struct SyscallTableBuilder {
    handlers: Vec<Option<SyscallFn>>,
    block_hook: Option<BlockHook>,
}

impl SyscallTableBuilder {
    pub fn register(mut self, group: u8, handler: SyscallFn) -> Result<Self, KernelError> {
        let index = group as usize;
        if self.handlers.len() <= index {
            self.handlers.resize(index + 1, None);
        }
        if self.handlers[index].replace(handler).is_some() {
            return Err(KernelError::DuplicateGroup(group));
        }
        Ok(self)
    }

    /// Replaces [`eval_syscall_block`] as the post-dispatch hook.
    pub fn block_hook(mut self, hook: BlockHook) -> Self {
        self.block_hook = Some(hook);
        self
    }

    /// Unregistered groups below the highest registered one answer
    /// `NotImplemented`.
    pub fn build(self) -> SyscallTable {
        SyscallTable {
            handlers: self
                .handlers
                .into_iter()
                .map(|h| h.unwrap_or(not_implemented))
                .collect(),
            block_hook: self.block_hook.unwrap_or(eval_syscall_block),
        }
    }
}

fn not_implemented(ctx: &mut SyscallContext<'_>, call: Syscall) -> u32 {
    debug!("{}: no handler for {:?}", ctx.thread.handle, call.number);
    ctx.set_errno(Errno::NotImplemented);
    0
}

/// Default post-dispatch hook: a thread that asked to wait during the call
/// is blocked instead of resumed.
pub fn eval_syscall_block(thread: &mut ThreadControlBlock) -> bool {
    if !thread.flags.contains(ThreadFlags::SYSCALL_WAIT) {
        return false;
    }
    thread.flags.remove(ThreadFlags::SYSCALL_WAIT);
    thread.state = ThreadState::Blocked;
    true
}
