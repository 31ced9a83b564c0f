use core::fmt;
use core::num::NonZeroU32;

/// Thread identifier
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash, Ord, PartialOrd)]
pub struct ThreadHandle(NonZeroU32);

impl ThreadHandle {
    pub fn new(id: u32) -> Option<Self> {
        NonZeroU32::new(id).map(Self)
    }

    pub fn val(&self) -> u32 {
        self.0.get()
    }
}

impl fmt::Display for ThreadHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "thread#{}", self.0)
    }
}

/// Timer identifier: pool slot plus the generation the slot had when the
/// timer was handed out, so a released id can never name a later timer.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash)]
pub struct TimerId {
    pub(crate) slot: u16,
    pub(crate) generation: u32,
}

impl TimerId {
    pub fn slot(&self) -> usize {
        self.slot as usize
    }
}

impl fmt::Display for TimerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "timer#{}.{}", self.slot, self.generation)
    }
}
