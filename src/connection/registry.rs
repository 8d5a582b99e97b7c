//! Connection Registry
//!
//! Tracks every connection a handler is currently serving so that shutdown
//! can drain and close all of them.
//!
//! ## Concurrency
//!
//! Connection tasks register and unregister concurrently while a shutdown
//! may be walking the set. The map sits behind a single mutex that is only
//! held for inserts, removals and taking a snapshot; draining happens on
//! the snapshot, outside the lock.

use crate::sync::{WaitGroup, WaitGuard};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, warn};

/// Identity of a registered connection.
pub type ClientId = u64;

/// One live connection.
///
/// The socket itself stays with the connection task; the record holds what
/// the shutdown path needs: the in-flight request counter and the signal
/// that tells the task to drop its socket.
#[derive(Debug)]
pub struct Client {
    id: ClientId,
    addr: SocketAddr,
    in_flight: WaitGroup,
    closed: watch::Sender<bool>,
}

impl Client {
    fn new(id: ClientId, addr: SocketAddr) -> Self {
        let (closed, _) = watch::channel(false);
        Self {
            id,
            addr,
            in_flight: WaitGroup::new(),
            closed,
        }
    }

    pub fn id(&self) -> ClientId {
        self.id
    }

    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    /// Marks a request as in flight until the guard is dropped.
    pub fn begin_request(&self) -> WaitGuard<'_> {
        self.in_flight.guard()
    }

    /// Number of requests currently in flight.
    pub fn in_flight(&self) -> usize {
        self.in_flight.pending()
    }

    /// Tells the connection task to close its socket.
    pub fn close(&self) {
        self.closed.send_replace(true);
    }

    pub fn is_closed(&self) -> bool {
        *self.closed.borrow()
    }

    /// Resolves once [`close`](Self::close) has been called.
    pub async fn closed(&self) {
        let mut rx = self.closed.subscribe();
        let _ = rx.wait_for(|closed| *closed).await;
    }

    /// Waits up to `timeout` for in-flight requests to finish, then closes.
    ///
    /// Returns true if the close was forced with requests still in flight.
    pub async fn drain_and_close(&self, timeout: Duration) -> bool {
        let forced = self.in_flight.wait_timeout(timeout).await;
        if forced {
            warn!(
                client = %self.addr,
                id = self.id,
                in_flight = self.in_flight(),
                "Drain timed out, forcing close"
            );
        }
        self.close();
        forced
    }
}

/// Concurrency-safe set of live connections.
#[derive(Debug, Default)]
pub struct ConnRegistry {
    clients: Mutex<HashMap<ClientId, Arc<Client>>>,
    next_id: AtomicU64,
}

impl ConnRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<ClientId, Arc<Client>>> {
        // A panicking connection task cannot leave the map half-updated
        self.clients.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Registers a new connection from `addr`.
    ///
    /// The returned guard unregisters it when dropped.
    pub fn register(&self, addr: SocketAddr) -> Registration<'_> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let client = Arc::new(Client::new(id, addr));
        self.lock().insert(id, Arc::clone(&client));
        debug!(client = %addr, id, "Registered connection");
        Registration {
            registry: self,
            client,
        }
    }

    /// Removes a connection. Removing an absent id is a no-op.
    ///
    /// Returns true if the connection was registered.
    pub fn unregister(&self, id: ClientId) -> bool {
        self.lock().remove(&id).is_some()
    }

    /// Number of registered connections.
    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    /// The connections registered right now, in no particular order.
    pub fn snapshot(&self) -> Vec<Arc<Client>> {
        self.lock().values().cloned().collect()
    }

    /// Visits every registered connection exactly once.
    pub fn for_each(&self, mut f: impl FnMut(&Arc<Client>)) {
        for client in self.snapshot() {
            f(&client);
        }
    }
}

/// Keeps a connection registered for as long as it lives.
#[derive(Debug)]
pub struct Registration<'a> {
    registry: &'a ConnRegistry,
    client: Arc<Client>,
}

impl Registration<'_> {
    pub fn client(&self) -> &Arc<Client> {
        &self.client
    }
}

impl Drop for Registration<'_> {
    fn drop(&mut self) {
        if self.registry.unregister(self.client.id) {
            debug!(client = %self.client.addr, id = self.client.id, "Unregistered connection");
        }
    }
}
