//! Connection Handlers
//!
//! A [`Handler`] owns every connection the acceptor hands it: `handle` serves
//! one connection until it ends, `close` drains and closes all of them.
//!
//! ## Connection Lifecycle
//!
//! ```text
//! 1. Acceptor spawns handle(stream, peer)
//!        │
//!        ▼
//! 2. Shutting down? ──yes──▶ drop socket, return
//!        │ no
//!        ▼
//! 3. Register in ConnRegistry
//!        │
//!        ▼
//! 4. ┌──────────────────────────────┐
//!    │  read unit ◀── idle timeout  │
//!    │  begin request (in flight)   │◀── close signal ends the loop
//!    │  write response              │
//!    │  end request                 │
//!    └──────────────────────────────┘
//!        │  EOF / I/O error / close signal
//!        ▼
//! 5. Unregister, socket dropped
//! ```
//!
//! ## Handlers
//!
//! - [`EchoHandler`]: writes every received line back unchanged. No protocol
//!   decoding; used to validate the transport.
//! - [`RespHandler`]: decodes RESP units through a [`DecodeStream`] and
//!   answers each one through an [`Executor`].

use crate::config::ServerConfig;
use crate::connection::registry::{Client, ConnRegistry, Registration};
use crate::protocol::decoder::MAX_LINE_LENGTH;
use crate::protocol::{DecodeError, DecodeStream, RespValue};
use crate::sync::AtomicFlag;
use async_trait::async_trait;
use futures::future::join_all;
use std::future::Future;
use std::net::SocketAddr;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader, BufWriter};
use tokio::net::TcpStream;
use tracing::{debug, info, trace, warn};

/// Default bound on how long shutdown waits for one connection to drain
pub const DEFAULT_DRAIN_TIMEOUT: Duration = Duration::from_secs(10);

/// Serves connections handed over by the acceptor.
#[async_trait]
pub trait Handler: Send + Sync + 'static {
    /// Serves one connection until it closes.
    async fn handle(&self, stream: TcpStream, peer: SocketAddr);

    /// Refuses new connections, then drains and closes every open one.
    ///
    /// Returns once each registered connection has drained or hit the
    /// drain timeout.
    async fn close(&self);
}

/// Timeouts shared by all handlers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HandlerOptions {
    /// Close a connection that sends nothing for this long (zero disables)
    pub idle_timeout: Duration,
    /// How long shutdown waits for in-flight requests per connection
    pub drain_timeout: Duration,
}

impl Default for HandlerOptions {
    fn default() -> Self {
        Self {
            idle_timeout: Duration::ZERO,
            drain_timeout: DEFAULT_DRAIN_TIMEOUT,
        }
    }
}

impl From<&ServerConfig> for HandlerOptions {
    fn from(config: &ServerConfig) -> Self {
        Self {
            idle_timeout: config.idle_timeout,
            drain_timeout: config.drain_timeout,
        }
    }
}

/// Registry plus shutdown flag, the state every handler needs.
#[derive(Debug, Default)]
pub struct Lifecycle {
    registry: ConnRegistry,
    closing: AtomicFlag,
    options: HandlerOptions,
}

impl Lifecycle {
    pub fn new(options: HandlerOptions) -> Self {
        Self {
            registry: ConnRegistry::new(),
            closing: AtomicFlag::new(),
            options,
        }
    }

    pub fn options(&self) -> HandlerOptions {
        self.options
    }

    pub fn registry(&self) -> &ConnRegistry {
        &self.registry
    }

    pub fn is_closing(&self) -> bool {
        self.closing.get()
    }

    /// Registers a new connection unless shutdown has begun.
    pub fn admit(&self, peer: SocketAddr) -> Option<Registration<'_>> {
        if self.closing.get() {
            return None;
        }
        let registration = self.registry.register(peer);
        // `close` sets the flag before it snapshots the registry, so a
        // connection that registers concurrently is either in the snapshot
        // or sees the flag here.
        if self.closing.get() {
            return None;
        }
        Some(registration)
    }

    /// Sets the shutdown flag and drains every registered connection.
    ///
    /// Connections drain concurrently, so the whole call is bounded by one
    /// drain timeout rather than one per connection.
    pub async fn close(&self) {
        if !self.closing.set() {
            debug!("Close already in progress");
        }

        let clients = self.registry.snapshot();
        info!(connections = clients.len(), "Closing connections");

        let timeout = self.options.drain_timeout;
        let forced = join_all(clients.iter().map(|c| c.drain_and_close(timeout)))
            .await
            .into_iter()
            .filter(|forced| *forced)
            .count();

        info!(
            connections = clients.len(),
            forced, "All connections closed"
        );
    }

    /// Runs `fut` unless the connection is closed or goes idle first.
    ///
    /// Returns `None` when the close signal or the idle timeout won.
    async fn guarded<T>(&self, client: &Client, fut: impl Future<Output = T>) -> Option<T> {
        let idle = self.options.idle_timeout;
        tokio::select! {
            _ = client.closed() => None,
            out = async {
                if idle.is_zero() {
                    Some(fut.await)
                } else {
                    tokio::time::timeout(idle, fut).await.ok()
                }
            } => out,
        }
    }

    /// Runs `fut` unless the connection is closed first.
    async fn until_closed<T>(client: &Client, fut: impl Future<Output = T>) -> Option<T> {
        tokio::select! {
            _ = client.closed() => None,
            out = fut => Some(out),
        }
    }
}

/// Writes every received line back to the client unchanged.
///
/// At most [`MAX_LINE_LENGTH`] bytes are buffered per read.
#[derive(Debug, Default)]
pub struct EchoHandler {
    lifecycle: Lifecycle,
}

impl EchoHandler {
    pub fn new(options: HandlerOptions) -> Self {
        Self {
            lifecycle: Lifecycle::new(options),
        }
    }

    pub fn lifecycle(&self) -> &Lifecycle {
        &self.lifecycle
    }
}

#[async_trait]
impl Handler for EchoHandler {
    async fn handle(&self, stream: TcpStream, peer: SocketAddr) {
        let Some(registration) = self.lifecycle.admit(peer) else {
            debug!(client = %peer, "Shutting down, refusing connection");
            return;
        };
        let client = registration.client();

        let (reader, mut writer) = stream.into_split();
        let mut reader = BufReader::new(reader);
        let mut line = Vec::with_capacity(256);

        loop {
            line.clear();
            // Lines over the limit are echoed back in chunks
            let mut chunk = (&mut reader).take(MAX_LINE_LENGTH as u64);
            let read = match self
                .lifecycle
                .guarded(client, chunk.read_until(b'\n', &mut line))
                .await
            {
                Some(read) => read,
                None => {
                    debug!(client = %peer, "Connection closed by server or idle");
                    break;
                }
            };

            match read {
                Ok(0) => {
                    debug!(client = %peer, "Client disconnected");
                    break;
                }
                Ok(n) => trace!(client = %peer, bytes = n, "Read line"),
                Err(e) => {
                    debug!(client = %peer, error = %e, "Read failed");
                    break;
                }
            }

            let _request = client.begin_request();
            match Lifecycle::until_closed(client, writer.write_all(&line)).await {
                Some(Ok(())) => {}
                Some(Err(e)) => {
                    debug!(client = %peer, error = %e, "Write failed");
                    break;
                }
                None => break,
            }
        }
    }

    async fn close(&self) {
        self.lifecycle.close().await;
    }
}

/// Turns a decoded unit into a reply.
///
/// This is the seam to the command engine: the transport only decodes and
/// writes, the executor decides what a unit means.
pub trait Executor: Send + Sync + 'static {
    fn execute(&self, unit: RespValue) -> RespValue;
}

impl<F> Executor for F
where
    F: Fn(RespValue) -> RespValue + Send + Sync + 'static,
{
    fn execute(&self, unit: RespValue) -> RespValue {
        self(unit)
    }
}

/// Replies with the decoded unit itself.
#[derive(Debug, Clone, Copy, Default)]
pub struct Reflect;

impl Executor for Reflect {
    fn execute(&self, unit: RespValue) -> RespValue {
        unit
    }
}

/// Decodes RESP units and answers each one through an [`Executor`].
///
/// Protocol errors are answered with `-ERR <message>` and the connection
/// stays open; I/O errors and end of input close it.
#[derive(Debug)]
pub struct RespHandler<E> {
    lifecycle: Lifecycle,
    executor: E,
}

impl<E: Executor> RespHandler<E> {
    pub fn new(executor: E, options: HandlerOptions) -> Self {
        Self {
            lifecycle: Lifecycle::new(options),
            executor,
        }
    }

    pub fn lifecycle(&self) -> &Lifecycle {
        &self.lifecycle
    }
}

#[async_trait]
impl<E: Executor> Handler for RespHandler<E> {
    async fn handle(&self, stream: TcpStream, peer: SocketAddr) {
        let Some(registration) = self.lifecycle.admit(peer) else {
            debug!(client = %peer, "Shutting down, refusing connection");
            return;
        };
        let client = registration.client();

        let (reader, writer) = stream.into_split();
        let mut writer = BufWriter::new(writer);
        let mut units = DecodeStream::spawn(reader);

        loop {
            let unit = match self.lifecycle.guarded(client, units.recv()).await {
                Some(Some(unit)) => unit,
                Some(None) => {
                    debug!(client = %peer, "Decode stream ended");
                    break;
                }
                None => {
                    debug!(client = %peer, "Connection closed by server or idle");
                    break;
                }
            };

            let _request = client.begin_request();
            let reply = match unit {
                Ok(value) => {
                    trace!(client = %peer, kind = value.kind(), "Executing unit");
                    self.executor.execute(value)
                }
                Err(e) if e.is_eof() => {
                    debug!(client = %peer, "Client disconnected");
                    break;
                }
                Err(e @ DecodeError::Io(_)) => {
                    debug!(client = %peer, error = %e, "Read failed");
                    break;
                }
                Err(e) if e.is_fatal() => {
                    warn!(client = %peer, error = %e, "Decoder failed, closing connection");
                    break;
                }
                Err(e) => {
                    warn!(client = %peer, error = %e, "Protocol error");
                    RespValue::error(format!("ERR {}", e))
                }
            };

            match Lifecycle::until_closed(client, write_reply(&mut writer, &reply)).await {
                Some(Ok(())) => {}
                Some(Err(e)) => {
                    debug!(client = %peer, error = %e, "Write failed");
                    break;
                }
                None => break,
            }
        }
    }

    async fn close(&self) {
        self.lifecycle.close().await;
    }
}

async fn write_reply<W>(writer: &mut W, reply: &RespValue) -> std::io::Result<()>
where
    W: AsyncWrite + Unpin,
{
    writer.write_all(&reply.serialize()).await?;
    writer.flush().await
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use tokio::io::AsyncReadExt;
    use tokio::net::TcpListener;

    /// Accepts connections forever and hands them to `handler`.
    async fn serve<H: Handler>(handler: Arc<H>) -> SocketAddr {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        tokio::spawn(async move {
            while let Ok((stream, peer)) = listener.accept().await {
                let handler = Arc::clone(&handler);
                tokio::spawn(async move { handler.handle(stream, peer).await });
            }
        });

        addr
    }

    async fn read_exactly(client: &mut TcpStream, n: usize) -> Vec<u8> {
        let mut buf = vec![0u8; n];
        tokio::time::timeout(Duration::from_secs(5), client.read_exact(&mut buf))
            .await
            .unwrap()
            .unwrap();
        buf
    }

    async fn wait_for_connections(lifecycle: &Lifecycle, n: usize) {
        for _ in 0..200 {
            if lifecycle.registry().len() == n {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("expected {} registered connections", n);
    }

    #[tokio::test]
    async fn test_echo_lines() {
        let handler = Arc::new(EchoHandler::default());
        let addr = serve(Arc::clone(&handler)).await;

        let mut client = TcpStream::connect(addr).await.unwrap();
        client.write_all(b"+PING\r\nhello\n").await.unwrap();

        assert_eq!(read_exactly(&mut client, 13).await, b"+PING\r\nhello\n");
    }

    #[tokio::test]
    async fn test_echo_line_over_limit() {
        let handler = Arc::new(EchoHandler::default());
        let addr = serve(Arc::clone(&handler)).await;

        let mut long = vec![b'a'; MAX_LINE_LENGTH * 2 + 10];
        long.push(b'\n');
        long.extend_from_slice(b"short\n");

        let (mut reader, mut writer) = TcpStream::connect(addr).await.unwrap().into_split();
        let payload = long.clone();
        let send = tokio::spawn(async move {
            writer.write_all(&payload).await.unwrap();
            writer
        });

        let mut echoed = vec![0u8; long.len()];
        tokio::time::timeout(Duration::from_secs(5), reader.read_exact(&mut echoed))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(echoed, long);

        // Still one connection, served line by line after the long one
        assert_eq!(handler.lifecycle().registry().len(), 1);
        drop(send.await.unwrap());
    }

    #[tokio::test]
    async fn test_echo_unregisters_on_eof() {
        let handler = Arc::new(EchoHandler::default());
        let addr = serve(Arc::clone(&handler)).await;

        let client = TcpStream::connect(addr).await.unwrap();
        wait_for_connections(handler.lifecycle(), 1).await;

        drop(client);
        wait_for_connections(handler.lifecycle(), 0).await;
    }

    #[tokio::test]
    async fn test_resp_reflects_units() {
        let handler = Arc::new(RespHandler::new(Reflect, HandlerOptions::default()));
        let addr = serve(Arc::clone(&handler)).await;

        let mut client = TcpStream::connect(addr).await.unwrap();
        client.write_all(b"$3\r\nfoo\r\n").await.unwrap();
        assert_eq!(read_exactly(&mut client, 9).await, b"$3\r\nfoo\r\n");

        client
            .write_all(b"*2\r\n$3\r\nGET\r\n$1\r\nk\r\n")
            .await
            .unwrap();
        assert_eq!(
            read_exactly(&mut client, 20).await,
            b"*2\r\n$3\r\nGET\r\n$1\r\nk\r\n"
        );
    }

    #[tokio::test]
    async fn test_resp_reports_protocol_errors() {
        let handler = Arc::new(RespHandler::new(Reflect, HandlerOptions::default()));
        let addr = serve(Arc::clone(&handler)).await;

        let mut client = TcpStream::connect(addr).await.unwrap();
        client.write_all(b"+bad\n:7\r\n").await.unwrap();

        let expected_err = b"-ERR protocol error: line not terminated by CRLF: '+bad\\n'\r\n";
        let mut expected = expected_err.to_vec();
        expected.extend_from_slice(b":7\r\n");
        assert_eq!(read_exactly(&mut client, expected.len()).await, expected);
    }

    #[tokio::test]
    async fn test_custom_executor() {
        let executor = |unit: RespValue| match unit {
            RespValue::Array(args) if args.first() == Some(&RespValue::bulk_string("PING")) => {
                RespValue::simple_string("PONG")
            }
            _ => RespValue::error("ERR unknown command"),
        };
        let handler = Arc::new(RespHandler::new(executor, HandlerOptions::default()));
        let addr = serve(Arc::clone(&handler)).await;

        let mut client = TcpStream::connect(addr).await.unwrap();
        client.write_all(b"*1\r\n$4\r\nPING\r\nPING\r\n").await.unwrap();
        assert_eq!(read_exactly(&mut client, 14).await, b"+PONG\r\n+PONG\r\n");
    }

    #[tokio::test]
    async fn test_idle_timeout_closes_connection() {
        let options = HandlerOptions {
            idle_timeout: Duration::from_millis(100),
            ..HandlerOptions::default()
        };
        let handler = Arc::new(RespHandler::new(Reflect, options));
        let addr = serve(Arc::clone(&handler)).await;

        let mut client = TcpStream::connect(addr).await.unwrap();
        let mut buf = [0u8; 16];
        let n = tokio::time::timeout(Duration::from_secs(5), client.read(&mut buf))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(n, 0);
        wait_for_connections(handler.lifecycle(), 0).await;
    }

    #[tokio::test]
    async fn test_close_drops_idle_connections() {
        let handler = Arc::new(EchoHandler::default());
        let addr = serve(Arc::clone(&handler)).await;

        let mut clients = Vec::new();
        for _ in 0..3 {
            clients.push(TcpStream::connect(addr).await.unwrap());
        }
        wait_for_connections(handler.lifecycle(), 3).await;

        tokio::time::timeout(Duration::from_secs(2), handler.close())
            .await
            .unwrap();

        for client in &mut clients {
            let mut buf = [0u8; 8];
            let n = tokio::time::timeout(Duration::from_secs(5), client.read(&mut buf))
                .await
                .unwrap()
                .unwrap_or(0);
            assert_eq!(n, 0);
        }
        wait_for_connections(handler.lifecycle(), 0).await;
    }

    #[tokio::test]
    async fn test_refuses_connections_after_close() {
        let handler = Arc::new(EchoHandler::default());
        handler.close().await;
        assert!(handler.lifecycle().is_closing());

        let addr = serve(Arc::clone(&handler)).await;
        let mut client = TcpStream::connect(addr).await.unwrap();
        let _ = client.write_all(b"hello\n").await;

        let mut buf = [0u8; 8];
        let n = tokio::time::timeout(Duration::from_secs(5), client.read(&mut buf))
            .await
            .unwrap()
            .unwrap_or(0);
        assert_eq!(n, 0);
        assert!(handler.lifecycle().registry().is_empty());
    }

    #[tokio::test]
    async fn test_close_is_bounded_by_drain_timeout() {
        let lifecycle = Lifecycle::new(HandlerOptions {
            idle_timeout: Duration::ZERO,
            drain_timeout: Duration::from_millis(100),
        });
        let peer = SocketAddr::from(([127, 0, 0, 1], 4000));
        let stuck = lifecycle.admit(peer).unwrap();
        let idle = lifecycle.admit(peer).unwrap();

        // A request that never finishes
        let _request = stuck.client().begin_request();

        let start = tokio::time::Instant::now();
        lifecycle.close().await;
        let elapsed = start.elapsed();

        assert!(elapsed >= Duration::from_millis(100));
        assert!(elapsed < Duration::from_secs(2));
        assert!(stuck.client().is_closed());
        assert!(idle.client().is_closed());
        assert!(lifecycle.admit(peer).is_none());
    }
}
