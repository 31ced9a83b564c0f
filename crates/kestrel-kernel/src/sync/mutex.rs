use super::atomic::{self, Exchange, LockWord, FREE};
use core::fmt;
use core::hint;
use core::panic::Location;
use core::ptr;
use core::sync::atomic::{AtomicPtr, Ordering};
use kestrel_hal::irq;
use log::{trace, warn};
use std::thread;

/// How a contended [`Mutex`] waits.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MutexKind {
    /// May-yield lock: waiters hand the processor back to the scheduler.
    /// Not usable from interrupt handlers.
    Default,
    /// Busy-spin lock: waiters never yield. Usable from any context.
    Spin,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum LockError {
    #[error("lock operation not permitted in this context")]
    NotPermitted,
}

/// A single non-blocking attempt found the lock taken.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("lock is held")]
pub struct WouldBlock;

/// Kernel mutex over one lock word.
///
/// No ownership tracking and no recursion: the word is either free or held
/// and any context may release it. There is no destroy step, a mutex lives
/// exactly as long as the structure embedding it.
pub struct Mutex {
    kind: MutexKind,
    word: LockWord,
    tag: Option<&'static str>,
    holder: AtomicPtr<Location<'static>>,
}

impl Mutex {
    pub const fn new(kind: MutexKind) -> Self {
        Self {
            kind,
            word: LockWord::new(FREE),
            tag: None,
            holder: AtomicPtr::new(ptr::null_mut()),
        }
    }

    /// Creates a mutex whose contention is traced under `tag`.
    pub const fn with_tag(kind: MutexKind, tag: &'static str) -> Self {
        Self {
            kind,
            word: LockWord::new(FREE),
            tag: Some(tag),
            holder: AtomicPtr::new(ptr::null_mut()),
        }
    }

    /// Re-initializes an embedded mutex: free, with the given kind.
    pub fn init(&mut self, kind: MutexKind) {
        self.kind = kind;
        *self.word.get_mut() = FREE;
        *self.holder.get_mut() = ptr::null_mut();
    }

    pub fn kind(&self) -> MutexKind {
        self.kind
    }

    pub fn tag(&self) -> Option<&'static str> {
        self.tag
    }

    /// Acquires the mutex, waiting as long as it takes.
    ///
    /// A may-yield mutex cannot be waited on from an interrupt handler; that
    /// request fails with [`LockError::NotPermitted`].
    #[track_caller]
    pub fn spin_acquire(&self) -> Result<(), LockError> {
        if self.kind == MutexKind::Default && irq::in_interrupt() {
            warn!(
                "mutex {}: may-yield acquire from interrupt context",
                self.tag.unwrap_or("?")
            );
            return Err(LockError::NotPermitted);
        }
        self.acquire_waiting();
        Ok(())
    }

    /// Acquire path shared with the locks built on top of this one.
    #[track_caller]
    pub(crate) fn acquire_waiting(&self) {
        let mut contended = false;
        while !atomic::try_acquire(&self.word).is_acquired() {
            if !contended {
                contended = true;
                if let Some(tag) = self.tag {
                    trace!("mutex {}: contended, held since {:?}", tag, self.holder_location());
                }
            }
            match self.kind {
                MutexKind::Spin => hint::spin_loop(),
                MutexKind::Default => thread::yield_now(),
            }
        }
        self.record_holder();
    }

    /// One exchange attempt; never waits.
    #[track_caller]
    pub fn try_acquire(&self) -> Result<(), WouldBlock> {
        match atomic::try_acquire(&self.word) {
            Exchange::Acquired => {
                self.record_holder();
                Ok(())
            }
            Exchange::AlreadyHeld => Err(WouldBlock),
        }
    }

    pub fn release(&self) {
        self.holder.store(ptr::null_mut(), Ordering::Relaxed);
        atomic::release(&self.word);
    }

    /// Snapshot of the lock word. Only an observation: it must not be used to
    /// decide whether to skip acquiring.
    pub fn is_held(&self) -> bool {
        self.word.load(Ordering::Relaxed) != FREE
    }

    /// Where the current holder acquired the mutex, if it is held.
    pub fn holder_location(&self) -> Option<&'static Location<'static>> {
        let location = self.holder.load(Ordering::Relaxed);
        // SAFETY: the pointer is either null or was taken from a
        // `&'static Location` in `record_holder`.
        unsafe { location.as_ref() }
    }

    #[track_caller]
    fn record_holder(&self) {
        let location: &'static Location<'static> = Location::caller();
        self.holder
            .store(location as *const Location<'static> as *mut _, Ordering::Relaxed);
    }
}

impl fmt::Debug for Mutex {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Mutex")
            .field("kind", &self.kind)
            .field("tag", &self.tag)
            .field("held", &self.is_held())
            .finish()
    }
}
