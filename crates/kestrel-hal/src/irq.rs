//! Local interrupt masking and interrupt-context tracking.
//!
//! On the host the processor's interrupt mask is modelled as the mask word of
//! a single simulated core. Masking interrupts claims that word, so while one
//! execution context runs with interrupts disabled no other context (another
//! OS thread standing in for a thread or an interrupt handler) can enter a
//! masked section. Masking nests per execution context; only the outermost
//! [`restore`] unmasks.

use std::cell::Cell;
use std::hint;
use std::sync::atomic::{AtomicBool, Ordering};

static MASKED: AtomicBool = AtomicBool::new(false);

thread_local! {
    static MASK_DEPTH: Cell<u32> = const { Cell::new(0) };
    static HANDLER_DEPTH: Cell<u32> = const { Cell::new(0) };
}

/// Interrupt state saved by [`save_and_disable`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[must_use = "interrupts stay masked until the state is restored"]
pub struct InterruptState {
    was_enabled: bool,
}

impl InterruptState {
    pub fn was_enabled(&self) -> bool {
        self.was_enabled
    }
}

/// Disables interrupt delivery for the calling context and returns the
/// previous state.
pub fn save_and_disable() -> InterruptState {
    let depth = MASK_DEPTH.with(Cell::get);
    if depth == 0 {
        while MASKED
            .compare_exchange_weak(false, true, Ordering::Acquire, Ordering::Relaxed)
            .is_err()
        {
            hint::spin_loop();
        }
    }
    MASK_DEPTH.with(|d| d.set(depth + 1));
    InterruptState {
        was_enabled: depth == 0,
    }
}

/// Restores the interrupt state saved by the matching [`save_and_disable`].
pub fn restore(state: InterruptState) {
    let depth = MASK_DEPTH.with(Cell::get);
    assert!(depth > 0, "irq::restore without a matching save_and_disable");
    MASK_DEPTH.with(|d| d.set(depth - 1));
    debug_assert_eq!(state.was_enabled, depth == 1, "unbalanced interrupt restore");
    if depth == 1 {
        MASKED.store(false, Ordering::Release);
    }
}

/// Whether interrupts are currently delivered to the calling context.
pub fn enabled() -> bool {
    MASK_DEPTH.with(Cell::get) == 0
}

/// RAII interrupt mask: disabled on creation, previous state restored on drop.
#[derive(Debug)]
pub struct IrqGuard {
    state: Option<InterruptState>,
}

impl IrqGuard {
    pub fn new() -> Self {
        Self {
            state: Some(save_and_disable()),
        }
    }
}

impl Default for IrqGuard {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for IrqGuard {
    fn drop(&mut self) {
        if let Some(state) = self.state.take() {
            restore(state);
        }
    }
}

/// Marks the calling context as running an interrupt handler until dropped.
#[derive(Debug)]
pub struct HandlerGuard {
    _private: (),
}

pub fn enter_handler() -> HandlerGuard {
    HANDLER_DEPTH.with(|d| d.set(d.get() + 1));
    HandlerGuard { _private: () }
}

impl Drop for HandlerGuard {
    fn drop(&mut self) {
        HANDLER_DEPTH.with(|d| d.set(d.get() - 1));
    }
}

/// Whether the calling context is an interrupt handler.
pub fn in_interrupt() -> bool {
    HANDLER_DEPTH.with(Cell::get) > 0
}
