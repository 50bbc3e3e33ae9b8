/// Configuration management for the sentinel proxy

use crate::core::{Endpoint, SessionTimeouts};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;
use std::time::Duration;

/// Main proxy configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Client-facing listener
    pub server: ServerConfig,
    /// Initial primary and sentinel discovery
    pub sentinel: SentinelConfig,
    /// Backend connection pools
    pub pool: PoolConfig,
    /// Per-request deadlines
    pub session: SessionConfig,
    /// Read reply cache
    pub cache: CacheConfig,
    /// Logging configuration
    pub logging: LoggingConfig,
}

/// Server configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Address to listen on
    pub listen_addr: String,
    /// Maximum number of concurrent client sessions
    pub max_connections: usize,
    /// Size of each socket read
    pub buffer_size: usize,
    /// Largest client request; longer ones end the session
    pub max_request_bytes: usize,
}

/// Sentinel configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SentinelConfig {
    /// Primary to start from before any sentinel has been asked
    pub primary_host: String,
    pub primary_port: u16,
    /// Monitored primary to follow; the first one reported when unset
    pub master_name: Option<String>,
    /// Sentinels known before the first hello exploration
    pub seeds: Vec<String>,
    /// Discovery period in seconds
    pub refresh_interval_sec: u64,
    /// How long to listen for sentinel hellos
    pub exploration_window_ms: u64,
    /// Dial and query timeout for sentinel calls
    pub query_timeout_ms: u64,
}

/// Pool configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PoolConfig {
    /// Connections minted per backend endpoint
    pub connections_per_endpoint: usize,
    /// Backend dial timeout in milliseconds
    pub connect_timeout_ms: u64,
}

/// Session deadlines in milliseconds
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// Wait for a pooled backend connection
    pub borrow_timeout_ms: u64,
    pub backend_write_timeout_ms: u64,
    pub backend_read_timeout_ms: u64,
    pub client_write_timeout_ms: u64,
}

/// Reply cache configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    pub enabled: bool,
    /// Maximum age of a servable reply
    pub freshness_ms: u64,
    /// Period of the expired entry sweep
    pub sweep_interval_ms: u64,
    /// Larger requests are never cached
    pub max_request_bytes: usize,
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Log level (error, warn, info, debug, trace)
    pub level: String,
    /// Log format (text, compact)
    pub format: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen_addr: "127.0.0.1:36379".to_string(),
            max_connections: 10000,
            buffer_size: 4096,
            max_request_bytes: crate::core::DEFAULT_MAX_REQUEST_BYTES,
        }
    }
}

impl Default for SentinelConfig {
    fn default() -> Self {
        Self {
            primary_host: "127.0.0.1".to_string(),
            primary_port: 6379,
            master_name: None,
            seeds: Vec::new(),
            refresh_interval_sec: 30,
            exploration_window_ms: 4000,
            query_timeout_ms: 5000,
        }
    }
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            connections_per_endpoint: 50,
            connect_timeout_ms: 5000,
        }
    }
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            borrow_timeout_ms: 10_000,
            backend_write_timeout_ms: 10_000,
            backend_read_timeout_ms: 5000,
            client_write_timeout_ms: 5000,
        }
    }
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            freshness_ms: 1000,
            sweep_interval_ms: 1000,
            max_request_bytes: 4096,
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: "text".to_string(),
        }
    }
}

impl SentinelConfig {
    pub fn primary(&self) -> Endpoint {
        Endpoint::new(self.primary_host.clone(), self.primary_port)
    }

    pub fn seed_endpoints(&self) -> Result<Vec<Endpoint>, ConfigError> {
        self.seeds
            .iter()
            .map(|seed| {
                seed.parse::<Endpoint>()
                    .map_err(|_| ConfigError::ValidationError(format!("Invalid sentinel seed: {}", seed)))
            })
            .collect()
    }

    pub fn refresh_interval(&self) -> Duration {
        Duration::from_secs(self.refresh_interval_sec)
    }

    pub fn exploration_window(&self) -> Duration {
        Duration::from_millis(self.exploration_window_ms)
    }

    pub fn query_timeout(&self) -> Duration {
        Duration::from_millis(self.query_timeout_ms)
    }
}

impl PoolConfig {
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }
}

impl SessionConfig {
    pub fn timeouts(&self) -> SessionTimeouts {
        SessionTimeouts {
            borrow: Duration::from_millis(self.borrow_timeout_ms),
            backend_write: Duration::from_millis(self.backend_write_timeout_ms),
            backend_read: Duration::from_millis(self.backend_read_timeout_ms),
            client_write: Duration::from_millis(self.client_write_timeout_ms),
        }
    }
}

impl CacheConfig {
    pub fn freshness(&self) -> Duration {
        Duration::from_millis(self.freshness_ms)
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_millis(self.sweep_interval_ms)
    }
}

fn require_positive(value: u64, name: &str) -> Result<(), ConfigError> {
    if value == 0 {
        return Err(ConfigError::ValidationError(format!(
            "{} must be greater than 0",
            name
        )));
    }
    Ok(())
}

impl Config {
    /// Load configuration from TOML file
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let content = fs::read_to_string(path)
            .map_err(|e| ConfigError::IoError(e.to_string()))?;

        let config: Config = toml::from_str(&content)
            .map_err(|e| ConfigError::ParseError(e.to_string()))?;

        config.validate()?;
        Ok(config)
    }

    /// Save configuration to TOML file
    pub fn save_to_file<P: AsRef<Path>>(&self, path: P) -> Result<(), ConfigError> {
        let content = toml::to_string_pretty(self)
            .map_err(|e| ConfigError::SerializeError(e.to_string()))?;

        fs::write(path, content)
            .map_err(|e| ConfigError::IoError(e.to_string()))?;

        Ok(())
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<(), ConfigError> {
        // Validate server config
        self.server
            .listen_addr
            .parse::<std::net::SocketAddr>()
            .map_err(|_| {
                ConfigError::ValidationError(format!(
                    "Invalid listen address: {}",
                    self.server.listen_addr
                ))
            })?;
        require_positive(self.server.max_connections as u64, "max_connections")?;
        require_positive(self.server.buffer_size as u64, "buffer_size")?;
        require_positive(self.server.max_request_bytes as u64, "max_request_bytes")?;

        // Validate sentinel config
        if self.sentinel.primary_host.trim().is_empty() {
            return Err(ConfigError::ValidationError(
                "primary_host cannot be empty".to_string(),
            ));
        }
        require_positive(self.sentinel.primary_port as u64, "primary_port")?;
        if matches!(&self.sentinel.master_name, Some(name) if name.trim().is_empty()) {
            return Err(ConfigError::ValidationError(
                "master_name cannot be empty when set".to_string(),
            ));
        }
        self.sentinel.seed_endpoints()?;
        require_positive(self.sentinel.refresh_interval_sec, "refresh_interval_sec")?;
        require_positive(self.sentinel.exploration_window_ms, "exploration_window_ms")?;
        require_positive(self.sentinel.query_timeout_ms, "query_timeout_ms")?;

        if self.sentinel.exploration_window_ms
            >= self.sentinel.refresh_interval_sec.saturating_mul(1000)
        {
            return Err(ConfigError::ValidationError(
                "exploration_window_ms must be shorter than refresh_interval_sec".to_string(),
            ));
        }

        // Validate pool config
        require_positive(
            self.pool.connections_per_endpoint as u64,
            "connections_per_endpoint",
        )?;
        require_positive(self.pool.connect_timeout_ms, "connect_timeout_ms")?;

        // Validate session config
        require_positive(self.session.borrow_timeout_ms, "borrow_timeout_ms")?;
        require_positive(self.session.backend_write_timeout_ms, "backend_write_timeout_ms")?;
        require_positive(self.session.backend_read_timeout_ms, "backend_read_timeout_ms")?;
        require_positive(self.session.client_write_timeout_ms, "client_write_timeout_ms")?;

        // Validate cache config
        if self.cache.enabled {
            require_positive(self.cache.freshness_ms, "freshness_ms")?;
            require_positive(self.cache.sweep_interval_ms, "sweep_interval_ms")?;
            require_positive(self.cache.max_request_bytes as u64, "max_request_bytes")?;
        }

        // Validate logging config
        match self.logging.level.as_str() {
            "error" | "warn" | "info" | "debug" | "trace" => {}
            _ => return Err(ConfigError::ValidationError(
                format!("Invalid log level: {}", self.logging.level)
            )),
        }

        match self.logging.format.as_str() {
            "text" | "compact" => {}
            _ => return Err(ConfigError::ValidationError(
                format!("Invalid log format: {}", self.logging.format)
            )),
        }

        Ok(())
    }

    /// Create example configuration file
    pub fn create_example_config<P: AsRef<Path>>(path: P) -> Result<(), ConfigError> {
        let config = Config {
            server: ServerConfig {
                listen_addr: "0.0.0.0:36379".to_string(),
                ..Default::default()
            },
            sentinel: SentinelConfig {
                primary_host: "10.0.1.10".to_string(),
                master_name: Some("mymaster".to_string()),
                seeds: vec![
                    "10.0.1.20:26379".to_string(),
                    "10.0.1.21:26379".to_string(),
                    "10.0.1.22:26379".to_string(),
                ],
                ..Default::default()
            },
            ..Default::default()
        };

        config.save_to_file(path)
    }
}

/// Configuration error types
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    IoError(String),

    #[error("Parse error: {0}")]
    ParseError(String),

    #[error("Serialize error: {0}")]
    SerializeError(String),

    #[error("Validation error: {0}")]
    ValidationError(String),
}
