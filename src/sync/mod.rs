//! Synchronization primitives shared by the acceptor and the handlers.

pub mod flag;
pub mod wait;

pub use flag::AtomicFlag;
pub use wait::{OwnedWaitGuard, WaitGroup, WaitGuard};
