//! Readers-writer lock for in-kernel use.
//!
//! Many readers or one writer, with writer priority: once a writer has
//! announced itself in `writers_waiting`, no new reader is admitted until that
//! writer has been through the lock. A steady stream of readers can therefore
//! delay a writer by at most the readers already inside.

use super::mutex::{Mutex, MutexKind, WouldBlock};
use core::cell::Cell;
use core::fmt;
use core::hint;
use core::sync::atomic::{AtomicI32, AtomicU32, Ordering};

const FREE: i32 = 0;
const WRITE_LOCKED: i32 = -1;

/// Observable state of an [`RwLock`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RwState {
    Free,
    Shared(u32),
    Exclusive,
}

pub struct RwLock {
    // Both fields are only read or written with `lock` held; the atomics just
    // let the accessors stay safe code.
    state: AtomicI32,
    writers_waiting: AtomicU32,
    lock: Mutex,
}

impl RwLock {
    pub const fn new() -> Self {
        Self {
            state: AtomicI32::new(FREE),
            writers_waiting: AtomicU32::new(0),
            lock: Mutex::with_tag(MutexKind::Spin, "rwlock"),
        }
    }

    /// Runs `f` on the state and the waiting-writer count with the embedded
    /// mutex held.
    fn locked<R>(&self, f: impl FnOnce(&Cell<i32>, &Cell<u32>) -> R) -> R {
        self.lock.acquire_waiting();
        let state = Cell::new(self.state.load(Ordering::Relaxed));
        let waiting = Cell::new(self.writers_waiting.load(Ordering::Relaxed));
        let result = f(&state, &waiting);
        self.state.store(state.get(), Ordering::Relaxed);
        self.writers_waiting.store(waiting.get(), Ordering::Relaxed);
        self.lock.release();
        result
    }

    pub fn write_lock(&self) {
        self.locked(|_, waiting| waiting.set(waiting.get() + 1));
        while !self.locked(|state, waiting| {
            if state.get() != FREE {
                return false;
            }
            state.set(WRITE_LOCKED);
            waiting.set(waiting.get() - 1);
            true
        }) {
            hint::spin_loop();
        }
    }

    pub fn try_write_lock(&self) -> Result<(), WouldBlock> {
        self.locked(|state, _| {
            if state.get() == FREE {
                state.set(WRITE_LOCKED);
                Ok(())
            } else {
                Err(WouldBlock)
            }
        })
    }

    pub fn write_unlock(&self) {
        self.locked(|state, _| {
            debug_assert_eq!(state.get(), WRITE_LOCKED, "write_unlock without write lock");
            state.set(FREE);
        });
    }

    pub fn read_lock(&self) {
        while self.try_read_lock().is_err() {
            hint::spin_loop();
        }
    }

    pub fn try_read_lock(&self) -> Result<(), WouldBlock> {
        self.locked(|state, waiting| {
            if state.get() != WRITE_LOCKED && waiting.get() == 0 {
                state.set(state.get() + 1);
                Ok(())
            } else {
                Err(WouldBlock)
            }
        })
    }

    pub fn read_unlock(&self) {
        self.locked(|state, _| {
            debug_assert!(state.get() > 0, "read_unlock without read lock");
            state.set(state.get() - 1);
        });
    }

    pub fn state(&self) -> RwState {
        match self.locked(|state, _| state.get()) {
            WRITE_LOCKED => RwState::Exclusive,
            FREE => RwState::Free,
            readers => RwState::Shared(readers as u32),
        }
    }

    pub fn writers_waiting(&self) -> u32 {
        self.locked(|_, waiting| waiting.get())
    }
}

impl Default for RwLock {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for RwLock {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RwLock")
            .field("state", &self.state())
            .field("writers_waiting", &self.writers_waiting())
            .finish()
    }
}
