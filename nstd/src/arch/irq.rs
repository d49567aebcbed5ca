// SPDX-License-Identifier: MPL-2.0

//! Local IRQ state bookkeeping.
//!
//! Critical sections nest, so the state is a per-CPU disable depth rather
//! than a boolean: IRQs are logically enabled only at depth zero. Guards
//! record whether they were the outermost disable and restore on drop, in
//! reverse acquisition order.

use core::marker::PhantomData;

#[cfg(not(test))]
mod state {
    use core::sync::atomic::{AtomicUsize, Ordering};

    // Single-CPU bootstrap state; the arch port replaces this with the
    // per-CPU interrupt flag.
    static DISABLE_DEPTH: AtomicUsize = AtomicUsize::new(0);

    pub(super) fn enter() -> bool {
        DISABLE_DEPTH.fetch_add(1, Ordering::Relaxed) == 0
    }

    pub(super) fn leave() {
        DISABLE_DEPTH.fetch_sub(1, Ordering::Relaxed);
    }
}


/// Disables local IRQs and returns a guard that restores the previous
/// state when dropped.
pub fn disable_local() -> DisabledLocalIrqGuard {
    let was_enabled = state::enter();
    DisabledLocalIrqGuard {
        was_enabled,
        _not_send: PhantomData,
    }
}

/// A guard for the local-IRQ-disabled state.
pub struct DisabledLocalIrqGuard {
    was_enabled: bool,
    // IRQ state is CPU-local; the guard must not leave its CPU.
    _not_send: PhantomData<*mut ()>,
}

impl DisabledLocalIrqGuard {
    /// Returns whether IRQs were enabled when this guard was taken.
    pub fn was_enabled(&self) -> bool {
        self.was_enabled
    }
}

impl Drop for DisabledLocalIrqGuard {
    fn drop(&mut self) {
        state::leave();
    }
}
