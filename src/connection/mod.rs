//! Connection Handling
//!
//! Everything between an accepted socket and the protocol layer: the
//! [`Handler`] contract the acceptor talks to, the handlers themselves, and
//! the registry that lets shutdown reach every open connection.
//!
//! ```text
//!  Acceptor ──spawn──▶ Handler::handle(stream, peer)
//!                          │ register
//!                          ▼
//!                    ConnRegistry ◀── Handler::close() drains each Client
//! ```

pub mod handler;
pub mod registry;

pub use handler::{
    EchoHandler, Executor, Handler, HandlerOptions, Lifecycle, Reflect, RespHandler,
    DEFAULT_DRAIN_TIMEOUT,
};
pub use registry::{Client, ClientId, ConnRegistry, Registration};
