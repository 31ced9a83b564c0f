//! Fixed-capacity pool of one-shot kernel timers.
//!
//! Timers are a scarce resource: a slot is taken by [`Timers::add`] and only
//! comes back through [`Timers::release`]. An expired timer keeps its slot
//! but stops reporting an owner, which is how waiters learn that their
//! deadline passed.

use crate::sync::SpinLock;
use crate::types::{ThreadHandle, TimerId};
use log::{trace, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum TimerError {
    #[error("no free timers")]
    Exhausted,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Slot {
    Free,
    Armed { owner: ThreadHandle, deadline: u64 },
    Expired,
}

#[derive(Debug)]
struct Entry {
    generation: u32,
    slot: Slot,
}

#[derive(Debug)]
struct TimerTable {
    now_ms: u64,
    entries: Vec<Entry>,
}

impl TimerTable {
    fn entry(&mut self, id: TimerId) -> Option<&mut Entry> {
        self.entries
            .get_mut(id.slot())
            .filter(|e| e.generation == id.generation)
    }
}

#[derive(Debug)]
pub struct Timers {
    table: SpinLock<TimerTable>,
}

impl Timers {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.min(u16::MAX as usize + 1);
        let entries = (0..capacity)
            .map(|_| Entry {
                generation: 0,
                slot: Slot::Free,
            })
            .collect();
        Self {
            table: SpinLock::with_tag(
                TimerTable {
                    now_ms: 0,
                    entries,
                },
                "timers",
            ),
        }
    }

    /// Arms a timer for `owner` that expires `millis` from now.
    pub fn add(&self, owner: ThreadHandle, millis: u32) -> Result<TimerId, TimerError> {
        let mut table = self.table.lock();
        let deadline = table.now_ms + millis as u64;
        let Some(slot) = table.entries.iter().position(|e| e.slot == Slot::Free) else {
            warn!("timer pool exhausted, {} rejected", owner);
            return Err(TimerError::Exhausted);
        };

        let entry = &mut table.entries[slot];
        entry.slot = Slot::Armed { owner, deadline };
        let id = TimerId {
            slot: slot as u16,
            generation: entry.generation,
        };
        trace!("{} armed for {} ({} ms)", id, owner, millis);
        Ok(id)
    }

    /// The thread an armed timer belongs to. `None` once the timer has
    /// expired, or when `id` no longer names a live timer.
    pub fn owner(&self, id: TimerId) -> Option<ThreadHandle> {
        let mut table = self.table.lock();
        match table.entry(id)?.slot {
            Slot::Armed { owner, .. } => Some(owner),
            Slot::Free | Slot::Expired => None,
        }
    }

    /// Gives the slot back. Returns `false` for an id that was already
    /// released, so a slot is never freed twice.
    pub fn release(&self, id: TimerId) -> bool {
        let mut table = self.table.lock();
        match table.entry(id) {
            Some(entry) if entry.slot != Slot::Free => {
                entry.slot = Slot::Free;
                entry.generation = entry.generation.wrapping_add(1);
                trace!("{} released", id);
                true
            }
            _ => false,
        }
    }

    /// Moves the clock forward and expires every timer that came due.
    /// Returns how many expired.
    pub fn advance(&self, elapsed_ms: u32) -> usize {
        let mut table = self.table.lock();
        table.now_ms += elapsed_ms as u64;
        let now = table.now_ms;

        let mut expired = 0;
        for entry in &mut table.entries {
            if let Slot::Armed { owner, deadline } = entry.slot {
                if deadline <= now {
                    trace!("timer of {} expired at {} ms", owner, now);
                    entry.slot = Slot::Expired;
                    expired += 1;
                }
            }
        }
        expired
    }

    pub fn now_ms(&self) -> u64 {
        self.table.lock().now_ms
    }

    pub fn in_use(&self) -> usize {
        self.table
            .lock()
            .entries
            .iter()
            .filter(|e| e.slot != Slot::Free)
            .count()
    }

    pub fn capacity(&self) -> usize {
        self.table.lock().entries.len()
    }
}
