/// Redis RESP (Redis Serialization Protocol) parsing and generation

use bytes::{Buf, BufMut, Bytes, BytesMut};
use std::str;

/// RESP data types
#[derive(Debug, Clone, PartialEq)]
pub enum RespValue {
    /// Simple String (+OK\r\n)
    SimpleString(String),
    /// Error (-ERR message\r\n)
    Error(String),
    /// Integer (:123\r\n)
    Integer(i64),
    /// Bulk String ($5\r\nhello\r\n)
    BulkString(Option<Bytes>), // None represents NULL
    /// Array (*2\r\n$5\r\nhello\r\n$5\r\nworld\r\n)
    Array(Option<Vec<RespValue>>), // None represents NULL array
}

/// RESP parser for reading Redis protocol messages
pub struct RespParser;

/// Deepest array nesting accepted from a peer
pub const MAX_NESTING: usize = 32;

/// RESP encoder for writing Redis protocol messages
pub struct RespEncoder;

/// Parse error types
#[derive(Debug, thiserror::Error)]
pub enum RespParseError {
    #[error("Unknown RESP type byte: 0x{0:02x}")]
    UnknownType(u8),
    #[error("Invalid length: {0}")]
    InvalidLength(String),
    #[error("Invalid RESP format: {0}")]
    InvalidFormat(String),
    #[error("Invalid UTF-8: {0}")]
    InvalidUtf8(#[from] str::Utf8Error),
}

impl RespValue {
    /// Text view of string-like values
    pub fn as_str(&self) -> Option<&str> {
        match self {
            RespValue::SimpleString(s) | RespValue::Error(s) => Some(s),
            RespValue::BulkString(Some(data)) => str::from_utf8(data).ok(),
            _ => None,
        }
    }

    /// Consume the value as a non-null array
    pub fn into_array(self) -> Option<Vec<RespValue>> {
        match self {
            RespValue::Array(Some(elements)) => Some(elements),
            _ => None,
        }
    }
}

impl RespParser {
    /// Parse one RESP value from the front of `buf`.
    ///
    /// Returns `Ok(None)` and leaves `buf` untouched when the value is not
    /// complete yet.
    pub fn parse(buf: &mut BytesMut) -> Result<Option<RespValue>, RespParseError> {
        match Self::parse_at(buf, 0, 0)? {
            Some((value, consumed)) => {
                buf.advance(consumed);
                Ok(Some(value))
            }
            None => Ok(None),
        }
    }

    /// Parse one complete RESP value occupying exactly `frame`
    pub fn parse_frame(frame: &[u8]) -> Result<RespValue, RespParseError> {
        match Self::parse_at(frame, 0, 0)? {
            Some((value, consumed)) if consumed == frame.len() => Ok(value),
            Some(_) => Err(Self::trailing()),
            None => Err(Self::incomplete()),
        }
    }

    /// Parse a client command occupying exactly `frame`: an array whose
    /// elements are all bulk or simple strings. Any other element type is
    /// rejected before it is decoded, so nested arrays are never descended
    /// into.
    pub fn parse_command(frame: &[u8]) -> Result<Vec<Bytes>, RespParseError> {
        match frame.first() {
            Some(b'*') => {}
            Some(&other) => return Err(RespParseError::UnknownType(other)),
            None => return Err(Self::incomplete()),
        }
        let (line, mut cursor) = Self::read_line(frame, 1).ok_or_else(Self::incomplete)?;
        let count = Self::parse_length(line)?;
        if count < 0 {
            return Err(RespParseError::InvalidFormat("null command array".to_string()));
        }

        let mut parts = Vec::with_capacity(count.min(1024) as usize);
        for _ in 0..count {
            let element = match frame.get(cursor) {
                Some(b'$') | Some(b'+') => Self::parse_at(frame, cursor, 0)?,
                Some(&other) => {
                    return Err(RespParseError::InvalidFormat(format!(
                        "command element of type '{}'",
                        other.escape_ascii()
                    )))
                }
                None => None,
            };
            match element {
                Some((RespValue::BulkString(Some(data)), after)) => {
                    parts.push(data);
                    cursor = after;
                }
                Some((RespValue::SimpleString(s), after)) => {
                    parts.push(Bytes::from(s));
                    cursor = after;
                }
                Some(_) => {
                    return Err(RespParseError::InvalidFormat(
                        "null command element".to_string(),
                    ))
                }
                None => return Err(Self::incomplete()),
            }
        }

        if cursor != frame.len() {
            return Err(Self::trailing());
        }
        Ok(parts)
    }

    fn incomplete() -> RespParseError {
        RespParseError::InvalidFormat("incomplete value".to_string())
    }

    fn trailing() -> RespParseError {
        RespParseError::InvalidFormat("trailing bytes after value".to_string())
    }

    fn parse_at(
        buf: &[u8],
        pos: usize,
        depth: usize,
    ) -> Result<Option<(RespValue, usize)>, RespParseError> {
        let Some(&first_byte) = buf.get(pos) else {
            return Ok(None);
        };
        let Some((line, next)) = Self::read_line(buf, pos + 1) else {
            return Ok(None);
        };

        match first_byte {
            b'+' => Ok(Some((
                RespValue::SimpleString(str::from_utf8(line)?.to_string()),
                next,
            ))),
            b'-' => Ok(Some((RespValue::Error(str::from_utf8(line)?.to_string()), next))),
            b':' => Ok(Some((RespValue::Integer(Self::parse_length(line)?), next))),
            b'$' => {
                let size = Self::parse_length(line)?;
                if size < 0 {
                    // NULL bulk string
                    return Ok(Some((RespValue::BulkString(None), next)));
                }
                let size = size as usize;

                // Check if we have enough data for the string + \r\n
                if buf.len() < next + size + 2 {
                    return Ok(None);
                }
                if &buf[next + size..next + size + 2] != b"\r\n" {
                    return Err(RespParseError::InvalidFormat(
                        "Missing \\r\\n after bulk string".to_string(),
                    ));
                }
                let content = Bytes::copy_from_slice(&buf[next..next + size]);
                Ok(Some((RespValue::BulkString(Some(content)), next + size + 2)))
            }
            b'*' => {
                let size = Self::parse_length(line)?;
                if size < 0 {
                    // NULL array
                    return Ok(Some((RespValue::Array(None), next)));
                }
                if depth >= MAX_NESTING {
                    return Err(RespParseError::InvalidFormat(format!(
                        "arrays nested deeper than {}",
                        MAX_NESTING
                    )));
                }

                let mut elements = Vec::with_capacity(size.min(1024) as usize);
                let mut cursor = next;
                for _ in 0..size {
                    match Self::parse_at(buf, cursor, depth + 1)? {
                        Some((element, after)) => {
                            elements.push(element);
                            cursor = after;
                        }
                        None => return Ok(None),
                    }
                }
                Ok(Some((RespValue::Array(Some(elements)), cursor)))
            }
            other => Err(RespParseError::UnknownType(other)),
        }
    }

    /// Read a line ending with \r\n starting at `from`; returns the content
    /// and the position just past the terminator
    fn read_line(buf: &[u8], from: usize) -> Option<(&[u8], usize)> {
        if from > buf.len() {
            return None;
        }
        buf[from..]
            .windows(2)
            .position(|w| w == b"\r\n")
            .map(|i| (&buf[from..from + i], from + i + 2))
    }

    fn parse_length(line: &[u8]) -> Result<i64, RespParseError> {
        btoi::btoi::<i64>(line)
            .map_err(|_| RespParseError::InvalidLength(String::from_utf8_lossy(line).into_owned()))
    }
}

impl RespEncoder {
    /// Encode a RESP value to bytes
    pub fn encode(value: &RespValue) -> Bytes {
        let mut buf = BytesMut::new();
        Self::encode_into(&mut buf, value);
        buf.freeze()
    }

    /// Encode a RESP value into an existing buffer
    pub fn encode_into(buf: &mut BytesMut, value: &RespValue) {
        match value {
            RespValue::SimpleString(s) => {
                buf.put_u8(b'+');
                buf.extend_from_slice(s.as_bytes());
                buf.put_slice(b"\r\n");
            }
            RespValue::Error(s) => {
                buf.put_u8(b'-');
                buf.extend_from_slice(s.as_bytes());
                buf.put_slice(b"\r\n");
            }
            RespValue::Integer(n) => {
                buf.put_u8(b':');
                buf.extend_from_slice(n.to_string().as_bytes());
                buf.put_slice(b"\r\n");
            }
            RespValue::BulkString(Some(data)) => {
                buf.put_u8(b'$');
                buf.extend_from_slice(data.len().to_string().as_bytes());
                buf.put_slice(b"\r\n");
                buf.extend_from_slice(data);
                buf.put_slice(b"\r\n");
            }
            RespValue::BulkString(None) => {
                buf.extend_from_slice(b"$-1\r\n");
            }
            RespValue::Array(Some(elements)) => {
                buf.put_u8(b'*');
                buf.extend_from_slice(elements.len().to_string().as_bytes());
                buf.put_slice(b"\r\n");
                for element in elements {
                    Self::encode_into(buf, element);
                }
            }
            RespValue::Array(None) => {
                buf.extend_from_slice(b"*-1\r\n");
            }
        }
    }

    /// Create a Redis command from command name and arguments
    pub fn create_command(command: &str, args: &[&str]) -> RespValue {
        let mut elements = vec![RespValue::BulkString(Some(Bytes::from(command.to_string())))];

        for arg in args {
            elements.push(RespValue::BulkString(Some(Bytes::from(arg.to_string()))));
        }

        RespValue::Array(Some(elements))
    }
}
