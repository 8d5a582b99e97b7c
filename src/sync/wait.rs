//! Wait Group with Bounded Waiting
//!
//! Counts outstanding units of work and lets other tasks wait for the count
//! to reach zero, optionally with a timeout. Two users in this crate:
//!
//! - the acceptor, which waits for every spawned connection task to finish
//! - each connection record, whose in-flight request counter is drained
//!   before the socket is closed during shutdown
//!
//! The count lives in a `tokio::sync::watch` channel so waiters are woken
//! on every change without polling.

use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;

/// A counter of outstanding work that can be awaited.
#[derive(Debug)]
pub struct WaitGroup {
    count: watch::Sender<usize>,
}

impl Default for WaitGroup {
    fn default() -> Self {
        Self::new()
    }
}

impl WaitGroup {
    /// Creates an empty wait group.
    pub fn new() -> Self {
        let (count, _) = watch::channel(0);
        Self { count }
    }

    /// Adds `delta` units of outstanding work.
    pub fn add(&self, delta: usize) {
        self.count.send_modify(|count| *count += delta);
    }

    /// Marks one unit of work as finished.
    ///
    /// Calling `done` more often than `add` saturates at zero instead of
    /// wrapping around.
    pub fn done(&self) {
        self.count
            .send_modify(|count| *count = count.saturating_sub(1));
    }

    /// Adds one unit of work and returns a guard that finishes it on drop.
    pub fn guard(&self) -> WaitGuard<'_> {
        self.add(1);
        WaitGuard { group: self }
    }

    /// Like [`guard`](Self::guard), but the guard owns a handle to the group
    /// so it can move into a spawned task.
    pub fn guard_owned(self: &Arc<Self>) -> OwnedWaitGuard {
        self.add(1);
        OwnedWaitGuard {
            group: Arc::clone(self),
        }
    }

    /// Current number of outstanding units.
    pub fn pending(&self) -> usize {
        *self.count.borrow()
    }

    /// Waits until the count reaches zero.
    pub async fn wait(&self) {
        let mut rx = self.count.subscribe();
        // The sender lives in `self`, so the channel cannot close while we wait.
        let _ = rx.wait_for(|count| *count == 0).await;
    }

    /// Waits until the count reaches zero or `timeout` elapses.
    ///
    /// Returns true if the wait timed out with work still outstanding.
    pub async fn wait_timeout(&self, timeout: Duration) -> bool {
        tokio::time::timeout(timeout, self.wait()).await.is_err()
    }
}

/// RAII guard for one unit of work in a [`WaitGroup`].
#[derive(Debug)]
pub struct WaitGuard<'a> {
    group: &'a WaitGroup,
}

impl Drop for WaitGuard<'_> {
    fn drop(&mut self) {
        self.group.done();
    }
}

/// Owned variant of [`WaitGuard`].
#[derive(Debug)]
pub struct OwnedWaitGuard {
    group: Arc<WaitGroup>,
}

impl Drop for OwnedWaitGuard {
    fn drop(&mut self) {
        self.group.done();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_owned_guard_moves_into_task() {
        let wg = Arc::new(WaitGroup::new());
        for _ in 0..4 {
            let guard = wg.guard_owned();
            tokio::spawn(async move {
                tokio::time::sleep(Duration::from_millis(10)).await;
                drop(guard);
            });
        }
        assert!(!wg.wait_timeout(Duration::from_secs(2)).await);
    }

    #[tokio::test]
    async fn test_wait_returns_immediately_when_empty() {
        let wg = WaitGroup::new();
        assert!(!wg.wait_timeout(Duration::from_millis(10)).await);
    }

    #[tokio::test]
    async fn test_wait_for_done() {
        let wg = Arc::new(WaitGroup::new());
        wg.add(2);
        assert_eq!(wg.pending(), 2);

        let worker = Arc::clone(&wg);
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            worker.done();
            worker.done();
        });

        assert!(!wg.wait_timeout(Duration::from_secs(2)).await);
        assert_eq!(wg.pending(), 0);
    }

    #[tokio::test]
    async fn test_wait_timeout_expires() {
        let wg = WaitGroup::new();
        wg.add(1);

        let start = tokio::time::Instant::now();
        assert!(wg.wait_timeout(Duration::from_millis(50)).await);
        assert!(start.elapsed() >= Duration::from_millis(50));
        assert_eq!(wg.pending(), 1);
    }

    #[tokio::test]
    async fn test_guard_finishes_on_drop() {
        let wg = WaitGroup::new();
        {
            let _a = wg.guard();
            let _b = wg.guard();
            assert_eq!(wg.pending(), 2);
        }
        assert_eq!(wg.pending(), 0);
    }

    #[test]
    fn test_done_saturates() {
        let wg = WaitGroup::new();
        wg.done();
        assert_eq!(wg.pending(), 0);
    }
}
