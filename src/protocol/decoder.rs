//! Streaming RESP Decoder
//!
//! Turns an unbounded byte source into a sequence of decoded units without
//! buffering whole messages up front. The decoder pulls exactly as many
//! bytes as the current state needs:
//!
//! ```text
//!            ┌───────────────────────────────┐
//!            │          ReadingLine          │◀──────────────┐
//!            │  read up to and incl. "\n"    │               │
//!            └──────┬──────────────┬─────────┘               │
//!   "$<len>"        │              │ "+", "-", ":", "*<n>"   │
//!                   ▼              └── unit complete? ───────┤
//!            ┌───────────────────────────────┐               │
//!            │          ReadingBulk          │               │
//!            │  read exactly len + 2 bytes   │───────────────┘
//!            └───────────────────────────────┘
//! ```
//!
//! Arrays open a pending frame that collects nested units until its declared
//! count is reached. When the outermost unit completes it is emitted and the
//! [`ReadState`] goes back to its zero value.
//!
//! ## Errors
//!
//! - Protocol errors (bad terminator, bad length, unknown type byte) are
//!   recoverable: the unit is reported as an error, the state is reset and
//!   decoding continues at the current stream position. A bulk payload that
//!   overruns its length is skipped to the next newline, and an oversized
//!   one is skipped whole, so payload bytes are never decoded as units.
//! - I/O errors, including end of stream, are fatal: the error is reported
//!   once and the decoder produces nothing afterwards.

use crate::protocol::types::{prefix, RespValue};
use bytes::{Bytes, BytesMut};
use std::io;
use thiserror::Error;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncReadExt, BufReader};
use tracing::trace;

/// Maximum size for a single bulk payload (512 MB, same as Redis)
pub const MAX_BULK_SIZE: usize = 512 * 1024 * 1024;

/// Maximum array nesting depth
pub const MAX_NESTING_DEPTH: usize = 32;

/// Maximum length of a single protocol line, terminator included
pub const MAX_LINE_LENGTH: usize = 64 * 1024;

/// Bytes of offending input quoted in protocol error messages
const PREVIEW_LEN: usize = 64;

/// Errors reported by the decoder.
#[derive(Debug, Error)]
pub enum DecodeError {
    /// Line or bulk payload not terminated by CRLF, or otherwise malformed
    #[error("protocol error: {0}")]
    Protocol(String),

    /// Unknown leading type byte inside an array
    #[error("protocol error: unknown type byte '{}'", .0.escape_ascii())]
    UnknownPrefix(u8),

    /// Length, count or integer that is not a signed decimal
    #[error("protocol error: invalid integer '{0}'")]
    InvalidInteger(String),

    /// Simple string or error that is not valid UTF-8
    #[error("protocol error: invalid UTF-8 in line")]
    InvalidUtf8,

    /// Negative bulk length other than -1
    #[error("protocol error: invalid bulk length {0}")]
    InvalidBulkLength(i64),

    /// Negative array count other than -1
    #[error("protocol error: invalid array length {0}")]
    InvalidArrayLength(i64),

    /// Bulk payload over [`MAX_BULK_SIZE`]
    #[error("protocol error: bulk length {size} exceeds {max}")]
    BulkTooLarge { size: usize, max: usize },

    /// Line over [`MAX_LINE_LENGTH`]
    #[error("protocol error: line exceeds {0} bytes")]
    LineTooLong(usize),

    /// Arrays nested deeper than [`MAX_NESTING_DEPTH`]
    #[error("protocol error: arrays nested deeper than {0}")]
    TooDeep(usize),

    /// Reading from the byte source failed or hit end of stream
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// The decode task faulted
    #[error("internal decoder fault: {0}")]
    Internal(String),
}

impl DecodeError {
    /// Fatal errors end the decoded sequence.
    pub fn is_fatal(&self) -> bool {
        matches!(self, DecodeError::Io(_) | DecodeError::Internal(_))
    }

    /// True when the byte source simply ran out.
    pub fn is_eof(&self) -> bool {
        matches!(self, DecodeError::Io(e) if e.kind() == io::ErrorKind::UnexpectedEof)
    }
}

/// One decoded unit: a protocol value or the error that replaced it.
pub type Payload = Result<RespValue, DecodeError>;

/// What the decoder reads next.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum ReadMode {
    /// Read a CRLF-terminated line.
    #[default]
    Line,
    /// Read a bulk payload of this many bytes plus its CRLF.
    Bulk(usize),
}

#[derive(Debug)]
struct PendingArray {
    expected: usize,
    args: Vec<RespValue>,
}

/// Per-connection decode cursor.
///
/// The zero value (`ReadState::default()`) means "between units".
#[derive(Debug, Default)]
pub struct ReadState {
    mode: ReadMode,
    /// Type byte of the outermost unit being decoded
    msg_type: Option<u8>,
    /// Open arrays, outermost first
    arrays: Vec<PendingArray>,
}

impl ReadState {
    /// Current read mode.
    pub fn mode(&self) -> ReadMode {
        self.mode
    }

    /// Type byte of the unit in progress, if any.
    pub fn msg_type(&self) -> Option<u8> {
        self.msg_type
    }

    /// Number of nested units still expected by the innermost open array.
    pub fn expected_args(&self) -> usize {
        self.arrays
            .last()
            .map(|a| a.expected - a.args.len())
            .unwrap_or(0)
    }

    /// True when no unit is partially decoded.
    pub fn is_idle(&self) -> bool {
        self.mode == ReadMode::Line && self.msg_type.is_none() && self.arrays.is_empty()
    }

    /// Applies one line (without its CRLF) to the state.
    ///
    /// Returns a value when the line completes one, `None` when the line only
    /// declared a bulk payload or opened an array.
    pub fn on_line(&mut self, line: &[u8]) -> Result<Option<RespValue>, DecodeError> {
        let Some(&type_byte) = line.first() else {
            if self.arrays.is_empty() {
                return Err(DecodeError::Protocol("empty line".to_string()));
            }
            return Err(DecodeError::Protocol("empty line inside array".to_string()));
        };
        if self.msg_type.is_none() {
            self.msg_type = Some(type_byte);
        }
        let body = &line[1..];

        match type_byte {
            prefix::SIMPLE_STRING => Ok(Some(RespValue::SimpleString(utf8(body)?))),
            prefix::ERROR => Ok(Some(RespValue::Error(utf8(body)?))),
            prefix::INTEGER => Ok(Some(RespValue::Integer(parse_int(body)?))),
            prefix::BULK_STRING => {
                let len = parse_int(body)?;
                if len == -1 {
                    return Ok(Some(RespValue::Null));
                }
                if len < 0 {
                    return Err(DecodeError::InvalidBulkLength(len));
                }
                let len = usize::try_from(len).map_err(|_| DecodeError::BulkTooLarge {
                    size: usize::MAX,
                    max: MAX_BULK_SIZE,
                })?;
                if len > MAX_BULK_SIZE {
                    return Err(DecodeError::BulkTooLarge {
                        size: len,
                        max: MAX_BULK_SIZE,
                    });
                }
                self.mode = ReadMode::Bulk(len);
                Ok(None)
            }
            prefix::ARRAY => {
                let count = parse_int(body)?;
                if count == -1 {
                    return Ok(Some(RespValue::Null));
                }
                if count < 0 {
                    return Err(DecodeError::InvalidArrayLength(count));
                }
                if count == 0 {
                    return Ok(Some(RespValue::Array(Vec::new())));
                }
                if self.arrays.len() >= MAX_NESTING_DEPTH {
                    return Err(DecodeError::TooDeep(MAX_NESTING_DEPTH));
                }
                let expected = usize::try_from(count)
                    .map_err(|_| DecodeError::InvalidArrayLength(count))?;
                self.arrays.push(PendingArray {
                    expected,
                    // Cap the preallocation, the count is client-controlled
                    args: Vec::with_capacity(expected.min(1024)),
                });
                Ok(None)
            }
            _ if self.arrays.is_empty() => inline(line).map(Some),
            other => Err(DecodeError::UnknownPrefix(other)),
        }
    }

    /// Applies a bulk payload read in [`ReadMode::Bulk`] mode.
    pub fn on_bulk(&mut self, payload: Bytes) -> RespValue {
        self.mode = ReadMode::Line;
        RespValue::BulkString(payload)
    }

    /// Feeds a finished value into the innermost open array.
    ///
    /// Returns the outermost unit once it is complete, resetting the state.
    pub fn complete(&mut self, mut value: RespValue) -> Option<RespValue> {
        loop {
            let Some(top) = self.arrays.last_mut() else {
                *self = ReadState::default();
                return Some(value);
            };
            top.args.push(value);
            if top.args.len() < top.expected {
                return None;
            }
            let args = std::mem::take(&mut top.args);
            self.arrays.pop();
            value = RespValue::Array(args);
        }
    }
}

/// Decodes RESP units from an async byte source.
///
/// The decoder is tied to one byte source and cannot be restarted. It is
/// not cancellation safe: a `next_unit` future dropped mid-read loses the
/// bytes it consumed, so drive it from a single loop (see
/// [`DecodeStream`](crate::protocol::DecodeStream)).
#[derive(Debug)]
pub struct Decoder<R> {
    reader: BufReader<R>,
    state: ReadState,
    line: Vec<u8>,
    finished: bool,
}

impl<R: AsyncRead + Unpin> Decoder<R> {
    /// Creates a decoder reading from `reader`.
    pub fn new(reader: R) -> Self {
        Self {
            reader: BufReader::new(reader),
            state: ReadState::default(),
            line: Vec::with_capacity(128),
            finished: false,
        }
    }

    /// The current decode cursor.
    pub fn state(&self) -> &ReadState {
        &self.state
    }

    /// Decodes the next unit.
    ///
    /// Returns `None` once a fatal error has been reported.
    pub async fn next_unit(&mut self) -> Option<Payload> {
        if self.finished {
            return None;
        }

        match self.decode_unit().await {
            Ok(value) => {
                trace!(kind = value.kind(), "Decoded unit");
                Some(Ok(value))
            }
            Err(e) => {
                self.state = ReadState::default();
                if e.is_fatal() {
                    self.finished = true;
                }
                Some(Err(e))
            }
        }
    }

    async fn decode_unit(&mut self) -> Result<RespValue, DecodeError> {
        loop {
            let value = match self.state.mode {
                ReadMode::Line => {
                    self.read_line().await?;
                    match self.state.on_line(&self.line) {
                        Err(DecodeError::BulkTooLarge { size, max }) => {
                            // Skip the payload so none of it is read as units
                            self.discard(size.saturating_add(2)).await?;
                            return Err(DecodeError::BulkTooLarge { size, max });
                        }
                        parsed => parsed?,
                    }
                }
                ReadMode::Bulk(len) => {
                    let payload = self.read_bulk(len).await?;
                    Some(self.state.on_bulk(payload))
                }
            };

            if let Some(value) = value {
                if let Some(unit) = self.state.complete(value) {
                    return Ok(unit);
                }
            }
        }
    }

    /// Reads one line into `self.line`, stripping the CRLF.
    async fn read_line(&mut self) -> Result<(), DecodeError> {
        self.line.clear();
        let n = (&mut self.reader)
            .take(MAX_LINE_LENGTH as u64)
            .read_until(b'\n', &mut self.line)
            .await?;

        if n == 0 {
            return Err(eof("connection closed"));
        }

        if self.line.last() != Some(&b'\n') {
            if self.line.len() < MAX_LINE_LENGTH {
                return Err(eof("connection closed mid-line"));
            }
            self.skip_line().await?;
            return Err(DecodeError::LineTooLong(MAX_LINE_LENGTH));
        }

        let len = self.line.len();
        if len < 2 || self.line[len - 2] != b'\r' {
            return Err(DecodeError::Protocol(format!(
                "line not terminated by CRLF: '{}'",
                preview(&self.line)
            )));
        }

        self.line.truncate(len - 2);
        Ok(())
    }

    /// Discards input up to and including the next newline.
    async fn skip_line(&mut self) -> Result<(), DecodeError> {
        loop {
            let (newline, available) = {
                let buf = self.reader.fill_buf().await?;
                (buf.iter().position(|&b| b == b'\n'), buf.len())
            };
            if available == 0 {
                return Err(eof("connection closed mid-line"));
            }
            match newline {
                Some(pos) => {
                    self.reader.consume(pos + 1);
                    return Ok(());
                }
                None => self.reader.consume(available),
            }
        }
    }

    /// Reads a bulk payload of `len` bytes and its CRLF.
    async fn read_bulk(&mut self, len: usize) -> Result<Bytes, DecodeError> {
        let mut buf = BytesMut::zeroed(len + 2);
        self.reader.read_exact(&mut buf).await?;

        if &buf[len..] != b"\r\n" {
            // The payload ran past its declared length; realign on the next
            // line boundary unless the slot already ended on one.
            if buf[len + 1] != b'\n' {
                self.skip_line().await?;
            }
            return Err(DecodeError::Protocol(format!(
                "bulk string not terminated by CRLF: '{}'",
                preview(&buf[len..])
            )));
        }

        buf.truncate(len);
        Ok(buf.freeze())
    }

    /// Consumes up to `n` bytes without buffering them.
    ///
    /// Stops early at end of stream; the next read reports it.
    async fn discard(&mut self, n: usize) -> Result<(), DecodeError> {
        let mut limited = (&mut self.reader).take(n as u64);
        let skipped = tokio::io::copy_buf(&mut limited, &mut tokio::io::sink()).await?;
        trace!(skipped, "Discarded oversized bulk payload");
        Ok(())
    }
}

fn eof(msg: &'static str) -> DecodeError {
    DecodeError::Io(io::Error::new(io::ErrorKind::UnexpectedEof, msg))
}

fn preview(bytes: &[u8]) -> String {
    let end = bytes.len().min(PREVIEW_LEN);
    bytes[..end].escape_ascii().to_string()
}

fn utf8(body: &[u8]) -> Result<String, DecodeError> {
    String::from_utf8(body.to_vec()).map_err(|_| DecodeError::InvalidUtf8)
}

/// Parses a plain signed decimal. A leading `+` is not accepted.
fn parse_int(body: &[u8]) -> Result<i64, DecodeError> {
    std::str::from_utf8(body)
        .ok()
        .filter(|s| !s.starts_with('+'))
        .and_then(|s| s.parse().ok())
        .ok_or_else(|| DecodeError::InvalidInteger(preview(body)))
}

/// Inline commands: `PING\r\n` is decoded as `["PING"]`.
fn inline(line: &[u8]) -> Result<RespValue, DecodeError> {
    let args: Vec<RespValue> = line
        .split(|b| b.is_ascii_whitespace())
        .filter(|word| !word.is_empty())
        .map(|word| RespValue::BulkString(Bytes::copy_from_slice(word)))
        .collect();

    if args.is_empty() {
        return Err(DecodeError::Protocol("empty inline command".to_string()));
    }
    Ok(RespValue::Array(args))
}
