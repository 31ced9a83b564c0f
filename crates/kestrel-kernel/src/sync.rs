//! Kernel locking primitives.
//!
//! Everything here bottoms out in [`atomic`]: a lock word that only the
//! atomic exchange primitive ever moves from free to held. [`Mutex`] builds on
//! it, [`RwLock`] and [`SpinLock`] build on `Mutex`.

pub mod atomic;
pub mod mutex;
pub mod rwlock;
pub mod semaphore;
pub mod spinlock;
pub mod syscalls;

pub use atomic::{Exchange, LockWord};
pub use mutex::{LockError, Mutex, MutexKind, WouldBlock};
pub use rwlock::{RwLock, RwState};
pub use semaphore::Semaphore;
pub use spinlock::{SpinLock, SpinLockGuard};
