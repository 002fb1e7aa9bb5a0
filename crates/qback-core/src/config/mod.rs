//! Configuration management for qback.
//!
//! Settings come from an optional TOML file; command-line flags override
//! them in the binary. Every section is `#[serde(default)]`, so a file only
//! needs the keys it changes.
//!
//! ## Configuration File Locations
//!
//! | Platform | Path |
//! |----------|------|
//! | Linux | `~/.config/qback/config.toml` |
//! | macOS | `~/Library/Application Support/qback/config.toml` |
//! | Windows | `%APPDATA%\qback\config.toml` |
//!
//! ## Example
//!
//! ```toml
//! [client]
//! address = "10.0.0.5:50051"
//! chunk_size = 4194304
//! chunk_timeout = "45s"
//!
//! [transport.retry]
//! max_attempts = 6
//! initial_backoff = "500ms"
//!
//! [tls]
//! cert_dir = "/etc/qback/certs"
//! ```

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::protocol::DEFAULT_MAX_PAYLOAD_SIZE;
use crate::transfer::{validate_chunk_size, TransferConfig};

/// Main configuration struct for qback.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Server settings
    pub server: ServerConfig,
    /// Client settings
    pub client: ClientConfig,
    /// Transport settings shared by both sides
    pub transport: TransportConfig,
    /// TLS settings
    pub tls: TlsSettings,
}

/// Server settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Listen address
    pub address: String,
    /// Storage root for the directory backend
    pub storage_dir: Option<PathBuf>,
    /// Use the memory backend instead of a directory
    pub memory: bool,
    /// Require mutual TLS
    pub tls: bool,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            address: format!("0.0.0.0:{}", crate::DEFAULT_PORT),
            storage_dir: None,
            memory: false,
            tls: false,
        }
    }
}

/// Client settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    /// Server address
    pub address: String,
    /// Chunk size in bytes
    pub chunk_size: usize,
    /// Per-chunk send/receive deadline
    #[serde(with = "humantime_serde")]
    pub chunk_timeout: Duration,
    /// Connect with mutual TLS
    pub tls: bool,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            address: format!("127.0.0.1:{}", crate::DEFAULT_PORT),
            chunk_size: crate::DEFAULT_CHUNK_SIZE,
            chunk_timeout: Duration::from_secs(crate::DEFAULT_CHUNK_TIMEOUT_SECS),
            tls: false,
        }
    }
}

/// Transport settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TransportConfig {
    /// Largest frame payload accepted
    pub max_message_size: usize,
    /// Deadline for TCP connect and TLS handshake
    #[serde(with = "humantime_serde")]
    pub connect_timeout: Duration,
    /// Server deadline for each read from a client
    #[serde(with = "humantime_serde")]
    pub idle_timeout: Duration,
    /// Client deadline for admission replies, final results and listings
    #[serde(with = "humantime_serde")]
    pub response_timeout: Duration,
    /// Client deadline for a ping round trip
    #[serde(with = "humantime_serde")]
    pub ping_timeout: Duration,
    /// Idle time before TCP keep-alive probes start
    #[serde(with = "humantime_serde")]
    pub keepalive_idle: Duration,
    /// Interval between TCP keep-alive probes
    #[serde(with = "humantime_serde")]
    pub keepalive_interval: Duration,
    /// Connection retry policy
    pub retry: RetryConfig,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            max_message_size: DEFAULT_MAX_PAYLOAD_SIZE,
            connect_timeout: Duration::from_secs(10),
            idle_timeout: Duration::from_secs(60),
            response_timeout: Duration::from_secs(300),
            ping_timeout: Duration::from_secs(5),
            keepalive_idle: Duration::from_secs(10),
            keepalive_interval: Duration::from_secs(5),
            retry: RetryConfig::default(),
        }
    }
}

/// Retry policy for connection establishment.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    /// Total connection attempts, including the first
    pub max_attempts: u32,
    /// Delay before the second attempt
    #[serde(with = "humantime_serde")]
    pub initial_backoff: Duration,
    /// Factor applied to the delay after each failed attempt
    pub multiplier: u32,
    /// Upper bound on any single delay
    #[serde(with = "humantime_serde")]
    pub max_backoff: Duration,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 4,
            initial_backoff: Duration::from_secs(1),
            multiplier: 2,
            max_backoff: Duration::from_secs(30),
        }
    }
}

impl RetryConfig {
    /// A policy that never retries.
    #[must_use]
    pub fn no_retry() -> Self {
        Self {
            max_attempts: 1,
            ..Self::default()
        }
    }

    /// Delay after the failed attempt number `attempt` (1-based).
    #[must_use]
    pub fn backoff(&self, attempt: u32) -> Duration {
        let factor = self
            .multiplier
            .max(1)
            .saturating_pow(attempt.saturating_sub(1));
        self.initial_backoff
            .saturating_mul(factor)
            .min(self.max_backoff)
    }
}

/// TLS settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TlsSettings {
    /// Directory holding `ca.pem` and the role's certificate and key
    pub cert_dir: Option<PathBuf>,
    /// Name the client expects in the server certificate
    pub server_name: String,
}

impl Default for TlsSettings {
    fn default() -> Self {
        Self {
            cert_dir: None,
            server_name: "localhost".to_string(),
        }
    }
}

impl Config {
    /// Load configuration from the default location.
    ///
    /// Returns defaults if no configuration file exists.
    ///
    /// # Errors
    ///
    /// Returns an error if the file exists but cannot be read or parsed.
    pub fn load() -> Result<Self> {
        let path = Self::config_path();
        if !path.exists() {
            return Ok(Self::default());
        }
        Self::load_from(&path)
    }

    /// Load configuration from an explicit file, which must exist.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read, parsed or validated.
    pub fn load_from(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            Error::Config(format!("Failed to read config {}: {e}", path.display()))
        })?;

        let config: Self = toml::from_str(&content)
            .map_err(|e| Error::Config(format!("Failed to parse config: {e}")))?;
        config.validate()?;
        Ok(config)
    }

    /// Save configuration to `path`, creating parent directories.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be written.
    pub fn save_to(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| {
                Error::Config(format!("Failed to create config directory: {e}"))
            })?;
        }

        let content = toml::to_string_pretty(self)
            .map_err(|e| Error::Config(format!("Failed to serialize config: {e}")))?;

        std::fs::write(path, content)
            .map_err(|e| Error::Config(format!("Failed to write config: {e}")))
    }

    /// Check value ranges that serde cannot express.
    ///
    /// # Errors
    ///
    /// Returns `Error::Config` describing the first invalid value.
    pub fn validate(&self) -> Result<()> {
        if self.transport.max_message_size == 0 {
            return Err(Error::Config(
                "transport.max_message_size must be greater than zero".to_string(),
            ));
        }
        if self.transport.retry.max_attempts == 0 {
            return Err(Error::Config(
                "transport.retry.max_attempts must be at least 1".to_string(),
            ));
        }
        validate_chunk_size(self.client.chunk_size, self.transport.max_message_size)
            .map_err(|e| Error::Config(format!("client.chunk_size: {e}")))
    }

    /// Session parameters for client transfers.
    #[must_use]
    pub fn transfer_config(&self) -> TransferConfig {
        TransferConfig {
            chunk_size: self.client.chunk_size,
            chunk_timeout: self.client.chunk_timeout,
            response_timeout: self.transport.response_timeout,
            max_message_size: self.transport.max_message_size,
        }
    }

    /// Get the configuration directory path.
    #[must_use]
    pub fn config_dir() -> Option<PathBuf> {
        directories::ProjectDirs::from("", "", "qback").map(|dirs| dirs.config_dir().to_path_buf())
    }

    /// Get the full path to the configuration file.
    #[must_use]
    pub fn config_path() -> PathBuf {
        Self::config_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("config.toml")
    }
}

/// Durations written as `"250us"`, `"250ms"`, `"30s"` or `"5m"`.
///
/// Precision is one microsecond; anything finer is dropped on write.
mod humantime_serde {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        let rendered = if duration.subsec_micros() == 0 {
            format!("{}s", duration.as_secs())
        } else if duration.subsec_micros() % 1000 == 0 {
            format!("{}ms", duration.as_millis())
        } else {
            format!("{}us", duration.as_micros())
        };
        serializer.serialize_str(&rendered)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        parse(&s).map_err(serde::de::Error::custom)
    }

    pub(super) fn parse(s: &str) -> Result<Duration, String> {
        let s = s.trim();
        let (digits, micros_per_unit) = if let Some(v) = s.strip_suffix("us") {
            (v, 1)
        } else if let Some(v) = s.strip_suffix("ms") {
            (v, 1000)
        } else if let Some(v) = s.strip_suffix('s') {
            (v, 1_000_000)
        } else if let Some(v) = s.strip_suffix('m') {
            (v, 60_000_000)
        } else {
            return Err(format!("invalid duration '{s}', use e.g. \"500ms\", \"30s\" or \"5m\""));
        };

        digits
            .trim()
            .parse::<u64>()
            .map(|n| Duration::from_micros(n.saturating_mul(micros_per_unit)))
            .map_err(|e| format!("invalid duration '{s}': {e}"))
    }
}
