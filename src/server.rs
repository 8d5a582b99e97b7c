//! TCP Acceptor and Shutdown Orchestration
//!
//! The server moves through three states:
//!
//! ```text
//!  Listening ──(signal | accept error)──▶ Draining ──(all tasks done)──▶ Stopped
//! ```
//!
//! - **Listening**: accept connections, spawn one task per connection that
//!   runs [`Handler::handle`]. Every task is counted in a wait group.
//! - **Draining**: the listener is dropped first so no new connection can be
//!   admitted, then [`Handler::close`] drains and closes open connections.
//! - **Stopped**: every connection task has finished; `run` returns.

use crate::config::ServerConfig;
use crate::connection::Handler;
use crate::panic_message;
use crate::sync::WaitGroup;
use futures::FutureExt;
use std::future::Future;
use std::io;
use std::net::SocketAddr;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use thiserror::Error;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{watch, Semaphore};
use tracing::{debug, error, info, info_span, warn, Instrument};

/// Server lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServerState {
    Listening,
    Draining,
    Stopped,
}

/// Errors that stop the server as a whole.
#[derive(Debug, Error)]
pub enum ServerError {
    /// Binding the listen address failed at startup
    #[error("failed to bind {address}: {source}")]
    Bind {
        address: String,
        #[source]
        source: io::Error,
    },

    /// Installing the termination signal handlers failed
    #[error("failed to install signal handler: {0}")]
    Signal(#[source] io::Error),
}

/// Accepts connections and hands them to a [`Handler`].
pub struct Server {
    config: ServerConfig,
    handler: Arc<dyn Handler>,
    state: watch::Sender<ServerState>,
}

impl Server {
    pub fn new(config: ServerConfig, handler: Arc<dyn Handler>) -> Self {
        let (state, _) = watch::channel(ServerState::Listening);
        Self {
            config,
            handler,
            state,
        }
    }

    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    /// Current lifecycle state.
    pub fn state(&self) -> ServerState {
        *self.state.borrow()
    }

    /// Receiver notified on every state change.
    pub fn subscribe(&self) -> watch::Receiver<ServerState> {
        self.state.subscribe()
    }

    /// Binds the configured address.
    pub async fn bind(&self) -> Result<TcpListener, ServerError> {
        TcpListener::bind(&self.config.address)
            .await
            .map_err(|source| ServerError::Bind {
                address: self.config.address.clone(),
                source,
            })
    }

    /// Binds, serves, and shuts down on SIGHUP, SIGQUIT, SIGTERM or SIGINT.
    ///
    /// Returns once every connection has been closed.
    pub async fn run_with_signal(&self) -> Result<(), ServerError> {
        let shutdown = shutdown_signal()?;
        let listener = self.bind().await?;
        info!(address = %self.config.address, "Bound, start listening");
        self.run(listener, shutdown).await;
        Ok(())
    }

    /// Serves `listener` until `shutdown` resolves or accepting fails.
    pub async fn run(&self, listener: TcpListener, shutdown: impl Future<Output = ()>) {
        let tasks = Arc::new(WaitGroup::new());
        let limit = match self.config.max_connections {
            0 => None,
            max => Some(Arc::new(Semaphore::new(max as usize))),
        };

        self.state.send_replace(ServerState::Listening);
        tokio::pin!(shutdown);

        loop {
            tokio::select! {
                biased;

                _ = &mut shutdown => {
                    info!("Shutting down...");
                    break;
                }

                accepted = listener.accept() => match accepted {
                    Ok((stream, peer)) => self.dispatch(stream, peer, &tasks, limit.as_ref()),
                    Err(e) => {
                        error!(error = %e, "Accept failed, shutting down");
                        break;
                    }
                },
            }
        }

        self.state.send_replace(ServerState::Draining);
        drop(listener);
        self.handler.close().await;

        debug!(tasks = tasks.pending(), "Waiting for connection tasks");
        tasks.wait().await;

        self.state.send_replace(ServerState::Stopped);
        info!("Server stopped");
    }

    /// Spawns the task serving one accepted connection.
    fn dispatch(
        &self,
        stream: TcpStream,
        peer: SocketAddr,
        tasks: &Arc<WaitGroup>,
        limit: Option<&Arc<Semaphore>>,
    ) {
        let permit = match limit.map(|l| Arc::clone(l).try_acquire_owned()) {
            None => None,
            Some(Ok(permit)) => Some(permit),
            Some(Err(_)) => {
                warn!(client = %peer, "Connection limit reached, dropping connection");
                return;
            }
        };

        info!(client = %peer, "Accepted connection");
        let handler = Arc::clone(&self.handler);
        let done = tasks.guard_owned();

        let task = async move {
            let _done = done;
            let _permit = permit;
            if let Err(panic) = AssertUnwindSafe(handler.handle(stream, peer))
                .catch_unwind()
                .await
            {
                error!(error = %panic_message(&*panic), "Connection handler panicked");
            }
        };
        tokio::spawn(task.instrument(info_span!("connection", client = %peer)));
    }
}

/// Resolves on the first hang-up, quit, terminate or interrupt signal.
///
/// Handlers are installed before this returns, so a signal arriving before
/// the future is polled is not lost.
#[cfg(unix)]
pub fn shutdown_signal() -> Result<impl Future<Output = ()>, ServerError> {
    use tokio::signal::unix::{signal, SignalKind};

    let mut hangup = signal(SignalKind::hangup()).map_err(ServerError::Signal)?;
    let mut quit = signal(SignalKind::quit()).map_err(ServerError::Signal)?;
    let mut terminate = signal(SignalKind::terminate()).map_err(ServerError::Signal)?;
    let mut interrupt = signal(SignalKind::interrupt()).map_err(ServerError::Signal)?;

    Ok(async move {
        let name = tokio::select! {
            _ = hangup.recv() => "SIGHUP",
            _ = quit.recv() => "SIGQUIT",
            _ = terminate.recv() => "SIGTERM",
            _ = interrupt.recv() => "SIGINT",
        };
        info!(signal = name, "Shutdown signal received");
    })
}

#[cfg(not(unix))]
pub fn shutdown_signal() -> Result<impl Future<Output = ()>, ServerError> {
    Ok(async {
        match tokio::signal::ctrl_c().await {
            Ok(()) => info!(signal = "ctrl-c", "Shutdown signal received"),
            Err(e) => {
                error!(error = %e, "Failed to listen for ctrl-c");
                std::future::pending::<()>().await;
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::{EchoHandler, HandlerOptions};
    use std::time::Duration;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::sync::oneshot;

    #[tokio::test]
    async fn test_bind_failure_is_reported() {
        let taken = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let config = ServerConfig {
            address: taken.local_addr().unwrap().to_string(),
            ..ServerConfig::default()
        };
        let server = Server::new(config, Arc::new(EchoHandler::default()));

        match server.bind().await {
            Err(ServerError::Bind { address, .. }) => {
                assert_eq!(address, taken.local_addr().unwrap().to_string())
            }
            other => panic!("expected bind error, got {:?}", other.map(|_| ())),
        }
    }

    #[tokio::test]
    async fn test_state_transitions() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let server = Arc::new(Server::new(
            ServerConfig::default(),
            Arc::new(EchoHandler::default()),
        ));
        let mut states = server.subscribe();
        let (stop_tx, stop_rx) = oneshot::channel::<()>();

        let running = Arc::clone(&server);
        let run = tokio::spawn(async move {
            running
                .run(listener, async {
                    let _ = stop_rx.await;
                })
                .await
        });

        assert_eq!(server.state(), ServerState::Listening);
        stop_tx.send(()).unwrap();

        tokio::time::timeout(Duration::from_secs(5), states.wait_for(|s| *s == ServerState::Stopped))
            .await
            .unwrap()
            .unwrap();
        run.await.unwrap();
        assert_eq!(server.state(), ServerState::Stopped);
    }

    #[tokio::test]
    async fn test_connection_limit() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let config = ServerConfig {
            max_connections: 1,
            ..ServerConfig::default()
        };
        let server = Arc::new(Server::new(
            config,
            Arc::new(EchoHandler::new(HandlerOptions::default())),
        ));
        let (stop_tx, stop_rx) = oneshot::channel::<()>();

        let running = Arc::clone(&server);
        let run = tokio::spawn(async move {
            running
                .run(listener, async {
                    let _ = stop_rx.await;
                })
                .await
        });

        let mut first = TcpStream::connect(addr).await.unwrap();
        first.write_all(b"one\n").await.unwrap();
        let mut buf = [0u8; 4];
        first.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"one\n");

        // Over the limit: accepted by the kernel, then dropped by the server
        let mut second = TcpStream::connect(addr).await.unwrap();
        let n = tokio::time::timeout(Duration::from_secs(5), second.read(&mut buf))
            .await
            .unwrap()
            .unwrap_or(0);
        assert_eq!(n, 0);

        stop_tx.send(()).unwrap();
        tokio::time::timeout(Duration::from_secs(5), run)
            .await
            .unwrap()
            .unwrap();
    }
}
