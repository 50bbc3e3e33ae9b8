/// Client request decoding and read/write classification

use crate::core::Role;
use crate::error::RedisError;
use crate::redis::resp::{RespParseError, RespParser};
use crate::redis::scanner;
use bytes::Bytes;
use fnv::FnvHashSet;
use lazy_static::lazy_static;

lazy_static! {
    /// Commands that never modify data and may be answered by any replica
    static ref READ_SAFE_COMMANDS: FnvHashSet<&'static str> = [
        "get", "mget", "getrange", "substr", "strlen", "exists", "ttl", "pttl", "type",
        "getbit", "bitcount", "bitpos",
        "llen", "lrange", "lindex",
        "scard", "smembers", "sismember", "smismember", "srandmember", "sinter", "sunion",
        "sdiff",
        "hget", "hmget", "hgetall", "hlen", "hexists", "hkeys", "hvals", "hstrlen",
        "zcard", "zcount", "zlexcount", "zrange", "zrangebyscore", "zrangebylex",
        "zrevrange", "zrevrangebyscore", "zrevrangebylex", "zrank", "zrevrank", "zscore",
        "zmscore",
        "pfcount", "geopos", "geodist", "geohash", "georadius_ro", "georadiusbymember_ro",
        "dump",
    ]
    .into_iter()
    .collect();
}

/// A decoded client request
#[derive(Debug, Clone, PartialEq)]
pub struct Request {
    /// Lower-cased command verb
    verb: String,
    args: Vec<Bytes>,
}

impl Request {
    /// Decode one complete request frame as delimited by [`request_len`]
    pub fn parse(frame: &[u8]) -> Result<Self, RedisError> {
        match frame.first() {
            Some(b'*') => Self::parse_array(frame),
            Some(_) => Self::parse_inline(frame),
            None => Err(RedisError::EmptyCommand),
        }
    }

    fn parse_array(frame: &[u8]) -> Result<Self, RedisError> {
        let parts =
            RespParser::parse_command(frame).map_err(|e| RedisError::protocol(e.to_string()))?;
        Self::from_parts(parts)
    }

    fn parse_inline(frame: &[u8]) -> Result<Self, RedisError> {
        let parts = frame
            .split(|b| b.is_ascii_whitespace())
            .filter(|token| !token.is_empty())
            .map(Bytes::copy_from_slice)
            .collect();

        Self::from_parts(parts)
    }

    fn from_parts(mut parts: Vec<Bytes>) -> Result<Self, RedisError> {
        if parts.is_empty() {
            return Err(RedisError::EmptyCommand);
        }
        let verb = String::from_utf8_lossy(&parts.remove(0)).to_ascii_lowercase();
        Ok(Self { verb, args: parts })
    }

    pub fn verb(&self) -> &str {
        &self.verb
    }

    pub fn args(&self) -> &[Bytes] {
        &self.args
    }

    /// Whether any replica may serve this request
    pub fn is_read_safe(&self) -> bool {
        is_read_safe(&self.verb)
    }
}

/// Check if a command verb is in the read-safe allow-list (case-insensitive)
pub fn is_read_safe(verb: &str) -> bool {
    READ_SAFE_COMMANDS.contains(verb.to_ascii_lowercase().as_str())
}

/// Decide which role serves a request. Everything is a write unless it is
/// read-safe and a replica topology is known.
pub fn classify(request: &Request, replicas_known: bool) -> Role {
    if replicas_known && request.is_read_safe() {
        Role::Replica
    } else {
        Role::Primary
    }
}

/// Length of the first complete request at the front of `buf`.
///
/// Array requests are delimited by the framing scanner. Anything else is an
/// inline command ending at the first line feed; the bare literal `PING`
/// with no terminator at all is also accepted.
pub fn request_len(buf: &[u8]) -> Result<Option<usize>, RespParseError> {
    match buf.first() {
        None => Ok(None),
        Some(b'*') => scanner::frame_len(buf),
        Some(_) => {
            if let Some(pos) = buf.iter().position(|&b| b == b'\n') {
                Ok(Some(pos + 1))
            } else if buf.eq_ignore_ascii_case(b"PING") {
                Ok(Some(buf.len()))
            } else {
                Ok(None)
            }
        }
    }
}
