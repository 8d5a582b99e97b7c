//! Monotonic Atomic Flag
//!
//! A boolean that starts `false` and can only ever move to `true`.
//! Handlers use it as their shutdown flag: once `close` begins, every
//! connection task observes the flag and refuses new work.

use std::sync::atomic::{AtomicBool, Ordering};

/// A one-way `false -> true` atomic flag.
#[derive(Debug, Default)]
pub struct AtomicFlag {
    set: AtomicBool,
}

impl AtomicFlag {
    /// Creates a new, unset flag.
    pub const fn new() -> Self {
        Self {
            set: AtomicBool::new(false),
        }
    }

    /// Returns true once the flag has been set.
    pub fn get(&self) -> bool {
        self.set.load(Ordering::SeqCst)
    }

    /// Sets the flag.
    ///
    /// Returns true if this call performed the transition, false if the
    /// flag was already set.
    pub fn set(&self) -> bool {
        !self.set.swap(true, Ordering::SeqCst)
    }
}
