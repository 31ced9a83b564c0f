//! Bounded counting semaphore.
//!
//! [`try_down`] and [`up`] work on bare atomic cells so the same two
//! operations serve kernel-owned [`Semaphore`]s and semaphore blocks that
//! live in user memory. Nothing else may change a semaphore value.

use core::sync::atomic::{AtomicU32, Ordering};

/// Non-blocking decrement. Returns the new value, or `None` if the value was
/// already zero.
pub fn try_down(value: &AtomicU32) -> Option<u32> {
    value
        .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |s| s.checked_sub(1))
        .ok()
        .map(|previous| previous - 1)
}

/// Increment that saturates at `count`. Returns whether the value changed;
/// a release at capacity is discarded.
pub fn up(value: &AtomicU32, count: u32) -> bool {
    value
        .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |s| {
            (s < count).then_some(s + 1)
        })
        .is_ok()
}

#[derive(Debug)]
pub struct Semaphore {
    value: AtomicU32,
    count: u32,
}

impl Semaphore {
    /// `initial` is clamped to `count`.
    pub const fn new(count: u32, initial: u32) -> Self {
        let initial = if initial > count { count } else { initial };
        Self {
            value: AtomicU32::new(initial),
            count,
        }
    }

    pub fn try_down(&self) -> Option<u32> {
        try_down(&self.value)
    }

    pub fn up(&self) -> bool {
        up(&self.value, self.count)
    }

    pub fn value(&self) -> u32 {
        self.value.load(Ordering::SeqCst)
    }

    pub fn count(&self) -> u32 {
        self.count
    }
}
