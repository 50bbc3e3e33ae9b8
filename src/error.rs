/// Unified error handling for the sentinel proxy
///
/// Errors fall into three families: transport failures (dial, read, write,
/// deadline), framing failures (malformed client requests or backend
/// replies) and topology failures (sentinel unreachable or replying with
/// something unexpected). Only the first failure to reach the initial
/// primary is fatal; everything else ends one session or skips one
/// discovery cycle.

use std::fmt;
use std::io;
use thiserror::Error;

pub use crate::config::ConfigError;
pub use crate::redis::resp::RespParseError;

/// Main error type for proxy operations
#[derive(Debug, Error)]
pub enum ProxyError {
    /// Network-related errors
    #[error("Network error: {0}")]
    Network(#[from] io::Error),

    /// Configuration errors
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    /// Reply or request framing errors
    #[error("Protocol error: {0}")]
    Protocol(#[from] RespParseError),

    /// Backend pool errors
    #[error("Backend error: {message}")]
    Backend { message: String },

    /// Redis command errors
    #[error("Redis error: {0}")]
    Redis(#[from] RedisError),

    /// Sentinel / discovery errors
    #[error("Topology error: {0}")]
    Topology(#[from] TopologyError),

    /// Timeout errors
    #[error("Operation timed out: {operation}")]
    Timeout { operation: String },
}

/// Client request errors
#[derive(Debug, Error)]
pub enum RedisError {
    #[error("RESP protocol error: {message}")]
    ProtocolError { message: String },

    #[error("Empty command")]
    EmptyCommand,

    #[error("Request larger than {limit} bytes")]
    RequestTooLarge { limit: usize },
}

/// Sentinel and discovery errors
#[derive(Debug, Error)]
pub enum TopologyError {
    #[error("No primary known")]
    NoPrimary,

    #[error("No sentinels known")]
    NoSentinels,

    #[error("Sentinel {sentinel} reported no primaries")]
    NoPrimaries { sentinel: String },

    #[error("Sentinel {sentinel} does not monitor a primary named {name}")]
    UnknownPrimary { sentinel: String, name: String },

    #[error("Unable to reach {endpoint}: {message}")]
    Unreachable { endpoint: String, message: String },

    #[error("Malformed sentinel reply: {message}")]
    MalformedReply { message: String },

    #[error("Invalid endpoint: {0}")]
    InvalidEndpoint(String),
}

/// Result type alias for proxy operations
pub type ProxyResult<T> = Result<T, ProxyError>;

/// Convenience methods for creating specific error types
impl ProxyError {
    /// Create a backend pool error
    pub fn backend<S: Into<String>>(message: S) -> Self {
        ProxyError::Backend {
            message: message.into(),
        }
    }

    /// Create a timeout error
    pub fn timeout<S: Into<String>>(operation: S) -> Self {
        ProxyError::Timeout {
            operation: operation.into(),
        }
    }

    /// Check if this error is recoverable (the next attempt may succeed)
    pub fn is_recoverable(&self) -> bool {
        match self {
            ProxyError::Network(_) => true,
            ProxyError::Backend { .. } => true,
            ProxyError::Timeout { .. } => true,
            ProxyError::Topology(TopologyError::Unreachable { .. }) => true,
            ProxyError::Topology(TopologyError::NoPrimaries { .. }) => true,
            _ => false,
        }
    }

    /// Get error severity level
    pub fn severity(&self) -> ErrorSeverity {
        match self {
            ProxyError::Config(_) => ErrorSeverity::Critical,
            ProxyError::Network(_) => ErrorSeverity::Warning,
            ProxyError::Backend { .. } => ErrorSeverity::Warning,
            ProxyError::Timeout { .. } => ErrorSeverity::Warning,
            ProxyError::Topology(_) => ErrorSeverity::Warning,
            _ => ErrorSeverity::Error,
        }
    }
}

/// Error severity levels for logging
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorSeverity {
    /// Critical errors that require immediate attention
    Critical,
    /// Errors that affect functionality but don't crash the system
    Error,
    /// Warnings about potential issues
    Warning,
}

impl fmt::Display for ErrorSeverity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ErrorSeverity::Critical => write!(f, "CRITICAL"),
            ErrorSeverity::Error => write!(f, "ERROR"),
            ErrorSeverity::Warning => write!(f, "WARNING"),
        }
    }
}

impl RedisError {
    pub fn protocol<S: Into<String>>(message: S) -> Self {
        RedisError::ProtocolError {
            message: message.into(),
        }
    }
}

impl TopologyError {
    pub fn unreachable<E: fmt::Display>(endpoint: impl fmt::Display, err: E) -> Self {
        TopologyError::Unreachable {
            endpoint: endpoint.to_string(),
            message: err.to_string(),
        }
    }

    pub fn malformed<S: Into<String>>(message: S) -> Self {
        TopologyError::MalformedReply {
            message: message.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_creation() {
        let error = ProxyError::backend("Backend unavailable");
        assert!(matches!(error, ProxyError::Backend { .. }));
        assert_eq!(error.to_string(), "Backend error: Backend unavailable");
    }

    #[test]
    fn test_error_severity() {
        let config_error = ProxyError::Config(ConfigError::ValidationError("test".to_string()));
        assert_eq!(config_error.severity(), ErrorSeverity::Critical);

        let network_error =
            ProxyError::Network(io::Error::new(io::ErrorKind::ConnectionRefused, "test"));
        assert_eq!(network_error.severity(), ErrorSeverity::Warning);

        let framing_error = ProxyError::Protocol(RespParseError::UnknownType(b'?'));
        assert_eq!(framing_error.severity(), ErrorSeverity::Error);
    }

    #[test]
    fn test_error_recoverability() {
        let network_error =
            ProxyError::Network(io::Error::new(io::ErrorKind::ConnectionRefused, "test"));
        assert!(network_error.is_recoverable());

        let unreachable = ProxyError::Topology(TopologyError::unreachable("10.0.0.1:26379", "refused"));
        assert!(unreachable.is_recoverable());

        let config_error = ProxyError::Config(ConfigError::ValidationError("test".to_string()));
        assert!(!config_error.is_recoverable());
    }

    #[test]
    fn test_topology_error_display() {
        let err = TopologyError::UnknownPrimary {
            sentinel: "127.0.0.1:26379".to_string(),
            name: "mymaster".to_string(),
        };
        assert_eq!(
            err.to_string(),
            "Sentinel 127.0.0.1:26379 does not monitor a primary named mymaster"
        );
    }

    #[test]
    fn test_redis_error_creation() {
        let redis_error = RedisError::protocol("Invalid RESP format");
        let proxy_error = ProxyError::Redis(redis_error);
        assert!(matches!(proxy_error, ProxyError::Redis(_)));
    }
}
