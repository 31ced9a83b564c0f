//! Atomic exchange on a single lock word.
//!
//! A lock word is `0` when free and anything else when held. Two strategies
//! implement the exchange:
//!
//! - [`IrqMaskExchange`] masks local interrupts around a plain load and store.
//!   Sufficient on a single core, where masking interrupts excludes every
//!   other execution context.
//! - [`ExclusiveExchange`] is the exclusive-load / store-conditional loop used
//!   on multiprocessors, expressed as a weak compare-exchange.
//!
//! Both report the same [`Exchange`] outcome and both write the word only
//! when the outcome is [`Exchange::Acquired`]; a word observed held is left
//! untouched. The strategy is fixed at build time by the `uniprocessor`
//! feature through [`ActiveExchange`].

use core::hint;
use core::sync::atomic::{AtomicU32, Ordering};
use kestrel_hal::irq;

pub type LockWord = AtomicU32;

pub const FREE: u32 = 0;
pub const HELD: u32 = 1;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[must_use]
pub enum Exchange {
    Acquired,
    AlreadyHeld,
}

impl Exchange {
    pub fn is_acquired(self) -> bool {
        self == Exchange::Acquired
    }
}

pub trait AtomicExchange {
    /// Moves `word` from free to held, indivisibly with respect to every
    /// other core and interrupt level.
    fn try_acquire(word: &LockWord) -> Exchange;
}

#[derive(Debug)]
pub enum IrqMaskExchange {}

impl AtomicExchange for IrqMaskExchange {
    fn try_acquire(word: &LockWord) -> Exchange {
        let state = irq::save_and_disable();
        let outcome = if word.load(Ordering::SeqCst) != FREE {
            Exchange::AlreadyHeld
        } else {
            word.store(HELD, Ordering::SeqCst);
            Exchange::Acquired
        };
        irq::restore(state);
        outcome
    }
}

#[derive(Debug)]
pub enum ExclusiveExchange {}

impl AtomicExchange for ExclusiveExchange {
    fn try_acquire(word: &LockWord) -> Exchange {
        loop {
            if word.load(Ordering::Relaxed) != FREE {
                return Exchange::AlreadyHeld;
            }
            match word.compare_exchange_weak(FREE, HELD, Ordering::SeqCst, Ordering::Relaxed) {
                Ok(_) => return Exchange::Acquired,
                Err(observed) if observed != FREE => return Exchange::AlreadyHeld,
                // Reservation lost without the word changing hands.
                Err(_) => hint::spin_loop(),
            }
        }
    }
}

#[cfg(feature = "uniprocessor")]
pub type ActiveExchange = IrqMaskExchange;

#[cfg(not(feature = "uniprocessor"))]
pub type ActiveExchange = ExclusiveExchange;

/// Attempts to take `word` with the strategy this kernel was built with.
#[inline]
pub fn try_acquire(word: &LockWord) -> Exchange {
    ActiveExchange::try_acquire(word)
}

/// Frees `word`. Pairs with the ordering of [`try_acquire`], so the next
/// acquirer observes everything written before the release.
#[inline]
pub fn release(word: &LockWord) {
    word.store(FREE, Ordering::SeqCst);
}
