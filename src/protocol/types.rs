//! RESP Value Types
//!
//! The values a RESP byte stream decodes into, and their wire encoding.
//!
//! ## Wire Format
//!
//! ```text
//! +<text>\r\n                     simple string
//! -<text>\r\n                     error
//! :<decimal>\r\n                  integer
//! $<len>\r\n<len bytes>\r\n       bulk string ($-1\r\n is null)
//! *<count>\r\n<count units>       array       (*-1\r\n is null)
//! ```

use bytes::Bytes;
use std::fmt;

/// The CRLF line terminator.
pub const CRLF: &[u8] = b"\r\n";

/// Leading type bytes.
pub mod prefix {
    pub const SIMPLE_STRING: u8 = b'+';
    pub const ERROR: u8 = b'-';
    pub const INTEGER: u8 = b':';
    pub const BULK_STRING: u8 = b'$';
    pub const ARRAY: u8 = b'*';
}

/// One fully decoded protocol value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RespValue {
    /// `+<text>\r\n`, never contains CR or LF.
    SimpleString(String),

    /// `-<text>\r\n`
    Error(String),

    /// `:<decimal>\r\n`
    Integer(i64),

    /// Binary-safe, length-prefixed payload.
    BulkString(Bytes),

    /// Null bulk string or null array.
    Null,

    /// Ordered nested values.
    Array(Vec<RespValue>),
}

impl RespValue {
    pub fn simple_string(s: impl Into<String>) -> Self {
        RespValue::SimpleString(s.into())
    }

    pub fn error(s: impl Into<String>) -> Self {
        RespValue::Error(s.into())
    }

    pub fn bulk_string(data: impl Into<Bytes>) -> Self {
        RespValue::BulkString(data.into())
    }

    /// Short name of the value's type, used in log fields.
    pub fn kind(&self) -> &'static str {
        match self {
            RespValue::SimpleString(_) => "simple-string",
            RespValue::Error(_) => "error",
            RespValue::Integer(_) => "integer",
            RespValue::BulkString(_) => "bulk-string",
            RespValue::Null => "null",
            RespValue::Array(_) => "array",
        }
    }

    /// Encodes the value in wire format.
    pub fn serialize(&self) -> Vec<u8> {
        let mut buf = Vec::new();
        self.serialize_into(&mut buf);
        buf
    }

    /// Appends the wire encoding of the value to `buf`.
    pub fn serialize_into(&self, buf: &mut Vec<u8>) {
        match self {
            RespValue::SimpleString(s) => write_line(buf, prefix::SIMPLE_STRING, s.as_bytes()),
            RespValue::Error(s) => write_line(buf, prefix::ERROR, s.as_bytes()),
            RespValue::Integer(n) => write_line(buf, prefix::INTEGER, n.to_string().as_bytes()),
            RespValue::BulkString(data) => {
                write_line(buf, prefix::BULK_STRING, data.len().to_string().as_bytes());
                buf.extend_from_slice(data);
                buf.extend_from_slice(CRLF);
            }
            RespValue::Null => write_line(buf, prefix::BULK_STRING, b"-1"),
            RespValue::Array(items) => {
                write_line(buf, prefix::ARRAY, items.len().to_string().as_bytes());
                for item in items {
                    item.serialize_into(buf);
                }
            }
        }
    }
}

fn write_line(buf: &mut Vec<u8>, type_byte: u8, body: &[u8]) {
    buf.push(type_byte);
    buf.extend_from_slice(body);
    buf.extend_from_slice(CRLF);
}

impl fmt::Display for RespValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RespValue::SimpleString(s) => write!(f, "{}", s),
            RespValue::Error(s) => write!(f, "(error) {}", s),
            RespValue::Integer(n) => write!(f, "(integer) {}", n),
            RespValue::BulkString(data) => match std::str::from_utf8(data) {
                Ok(s) => write!(f, "\"{}\"", s),
                Err(_) => write!(f, "(binary, {} bytes)", data.len()),
            },
            RespValue::Null => write!(f, "(nil)"),
            RespValue::Array(items) => {
                write!(f, "[")?;
                for (i, item) in items.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{}", item)?;
                }
                write!(f, "]")
            }
        }
    }
}
