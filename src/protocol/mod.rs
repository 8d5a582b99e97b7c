//! RESP Protocol Module
//!
//! This module decodes the RESP wire protocol from a live byte stream.
//!
//! - [`types`]: protocol values and their wire encoding
//! - [`decoder`]: the streaming decoder state machine
//! - [`stream`]: runs a decoder on its own task and delivers units over a channel
//!
//! ## Example
//!
//! ```ignore
//! use respgate::protocol::DecodeStream;
//!
//! let (reader, writer) = socket.into_split();
//! let mut units = DecodeStream::spawn(reader);
//! while let Some(unit) = units.recv().await {
//!     match unit {
//!         Ok(value) => println!("decoded {}", value),
//!         Err(e) if e.is_fatal() => break,
//!         Err(e) => eprintln!("bad input: {}", e),
//!     }
//! }
//! ```

pub mod decoder;
pub mod stream;
pub mod types;

pub use decoder::{DecodeError, Decoder, Payload, ReadMode, ReadState};
pub use stream::DecodeStream;
pub use types::RespValue;
