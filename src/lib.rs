//! # respgate - TCP Front-End for a RESP Key-Value Server
//!
//! respgate accepts TCP connections, decodes the RESP request protocol from
//! each connection's byte stream as it arrives, and shuts every connection
//! down in bounded time when the process is told to stop. What a decoded
//! request *means* is left to an [`Executor`](connection::Executor).
//!
//! ## Architecture
//!
//! ```text
//! ┌───────────────────────────────────────────────────────────────────┐
//! │                            respgate                               │
//! │                                                                   │
//! │  ┌─────────────┐  spawn   ┌──────────────┐  read half  ┌────────┐  │
//! │  │   Server    │─────────>│   Handler    │────────────>│ Decode │  │
//! │  │ (acceptor)  │          │ handle(conn) │<────────────│ Stream │  │
//! │  └──────┬──────┘          └──────┬───────┘   units     └───┬────┘  │
//! │         │ signal                 │ register                │       │
//! │         ▼                        ▼                         ▼       │
//! │  ┌─────────────┐  close   ┌──────────────┐          ┌───────────┐  │
//! │  │  Draining   │─────────>│ ConnRegistry │          │  Decoder  │  │
//! │  └─────────────┘          └──────────────┘          │ ReadState │  │
//! │                                                     └───────────┘  │
//! └───────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Quick Start
//!
//! ```ignore
//! use respgate::config::ServerConfig;
//! use respgate::connection::{HandlerOptions, Reflect, RespHandler};
//! use respgate::server::Server;
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = ServerConfig::default();
//!     let handler = Arc::new(RespHandler::new(Reflect, HandlerOptions::from(&config)));
//!
//!     // Serves until SIGINT/SIGTERM/SIGQUIT/SIGHUP, then drains and returns
//!     Server::new(config, handler).run_with_signal().await?;
//!     Ok(())
//! }
//! ```
//!
//! ## Module Overview
//!
//! - [`protocol`]: RESP values, the streaming decoder and its task adapter
//! - [`connection`]: handler contract, echo/RESP handlers, connection registry
//! - [`server`]: accept loop and shutdown orchestration
//! - [`config`]: CLI and TOML configuration
//! - [`sync`]: monotonic flag and wait group used during shutdown
//!
//! ## Failure Isolation
//!
//! Protocol errors are reported per unit and decoding continues. I/O errors
//! end one connection. A panic in a decode task or a handler is caught at
//! the task boundary and logged; it never takes down the acceptor or other
//! connections. Only a bind failure at startup stops the whole server.

use std::any::Any;

pub mod config;
pub mod connection;
pub mod protocol;
pub mod server;
pub mod sync;

// Re-export commonly used types for convenience
pub use config::{Config, ConfigError, ServerConfig};
pub use connection::{EchoHandler, Executor, Handler, HandlerOptions, Reflect, RespHandler};
pub use protocol::{DecodeError, DecodeStream, Decoder, Payload, RespValue};
pub use server::{Server, ServerError, ServerState};

/// The default port respgate listens on (same as Redis)
pub const DEFAULT_PORT: u16 = 6379;

/// The default host respgate binds to
pub const DEFAULT_HOST: &str = "127.0.0.1";

/// Version of respgate
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Extracts the message from a caught panic payload.
pub(crate) fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}
