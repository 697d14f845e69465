//! Configuration types for Wharf

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

use crate::{Result, WharfError};

/// Main server configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Host address to bind to (empty = any interface)
    #[serde(default)]
    pub host: String,
    /// Port to listen on
    pub port: u16,
    /// Maximum time to wait for a complete request, in milliseconds
    #[serde(default = "default_read_timeout")]
    pub read_timeout: u64,
    /// Maximum size of a request (headers plus non-multipart body) in bytes
    #[serde(default = "default_max_request_size")]
    pub max_request_size: usize,
    /// Maximum size of a multipart request body in bytes
    #[serde(default = "default_max_multipart_size")]
    pub max_multipart_size: usize,
    /// Number of connection handlers created at startup and kept alive
    #[serde(default = "default_min_connections", alias = "min_threads")]
    pub min_connections: usize,
    /// Maximum number of concurrent connection handlers
    #[serde(default = "default_max_connections", alias = "max_threads")]
    pub max_connections: usize,
    /// Interval of the idle-handler cleanup sweep, in milliseconds
    #[serde(default = "default_cleanup_interval")]
    pub cleanup_interval: u64,
    /// TLS configuration (plain TCP if absent)
    #[serde(default)]
    pub tls: Option<TlsConfig>,
    /// Session cookie configuration
    #[serde(default)]
    pub session: SessionConfig,
    /// Static file serving configuration
    #[serde(default)]
    pub static_files: StaticFilesConfig,
}

fn default_read_timeout() -> u64 {
    10_000
}

fn default_max_request_size() -> usize {
    16 * 1024
}

fn default_max_multipart_size() -> usize {
    1024 * 1024
}

fn default_min_connections() -> usize {
    4
}

fn default_max_connections() -> usize {
    100
}

fn default_cleanup_interval() -> u64 {
    60_000
}

/// TLS configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TlsConfig {
    /// PEM file with the certificate chain
    pub cert_file: PathBuf,
    /// PEM file with the private key
    pub key_file: PathBuf,
}

/// Session cookie configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionConfig {
    /// Name of the session cookie
    #[serde(default = "default_cookie_name")]
    pub cookie_name: String,
    /// Path attribute of the session cookie
    #[serde(default)]
    pub cookie_path: String,
    /// Domain attribute of the session cookie
    #[serde(default)]
    pub cookie_domain: String,
    /// Comment attribute of the session cookie
    #[serde(default)]
    pub cookie_comment: String,
    /// Session lifetime in milliseconds
    #[serde(default = "default_expiration_time")]
    pub expiration_time: u64,
}

fn default_cookie_name() -> String {
    "sessionid".to_string()
}

fn default_expiration_time() -> u64 {
    3_600_000
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            cookie_name: default_cookie_name(),
            cookie_path: String::new(),
            cookie_domain: String::new(),
            cookie_comment: String::new(),
            expiration_time: default_expiration_time(),
        }
    }
}

/// Static file serving configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StaticFilesConfig {
    /// Document root directory
    #[serde(default = "default_docroot")]
    pub path: PathBuf,
    /// Character encoding reported for text files
    #[serde(default = "default_encoding")]
    pub encoding: String,
    /// Value of the Cache-Control max-age header, in milliseconds
    #[serde(default = "default_max_age")]
    pub max_age: u64,
    /// Largest file size that may be stored in the cache, in bytes
    #[serde(default = "default_max_cached_file_size")]
    pub max_cached_file_size: usize,
    /// Total cache budget in bytes
    #[serde(default = "default_cache_size")]
    pub cache_size: usize,
    /// Lifetime of a cache entry in milliseconds (0 = no expiry)
    #[serde(default = "default_cache_time")]
    pub cache_time: u64,
}

fn default_docroot() -> PathBuf {
    PathBuf::from(".")
}

fn default_encoding() -> String {
    "UTF-8".to_string()
}

fn default_max_age() -> u64 {
    60_000
}

fn default_max_cached_file_size() -> usize {
    65_536
}

fn default_cache_size() -> usize {
    1_000_000
}

fn default_cache_time() -> u64 {
    60_000
}

impl Default for StaticFilesConfig {
    fn default() -> Self {
        Self {
            path: default_docroot(),
            encoding: default_encoding(),
            max_age: default_max_age(),
            max_cached_file_size: default_max_cached_file_size(),
            cache_size: default_cache_size(),
            cache_time: default_cache_time(),
        }
    }
}

impl Config {
    /// Create a configuration with defaults for the given port
    #[must_use]
    pub fn for_port(port: u16) -> Self {
        Self {
            host: String::new(),
            port,
            read_timeout: default_read_timeout(),
            max_request_size: default_max_request_size(),
            max_multipart_size: default_max_multipart_size(),
            min_connections: default_min_connections(),
            max_connections: default_max_connections(),
            cleanup_interval: default_cleanup_interval(),
            tls: None,
            session: SessionConfig::default(),
            static_files: StaticFilesConfig::default(),
        }
    }

    /// Load configuration from TOML file
    ///
    /// # Errors
    ///
    /// Returns error if file cannot be read or parsed
    pub fn from_file(path: &std::path::Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| WharfError::ConfigError(format!("Failed to read config file: {e}")))?;

        let config: Self = toml::from_str(&content)
            .map_err(|e| WharfError::ConfigError(format!("Failed to parse config: {e}")))?;

        config.validate()?;
        Ok(config)
    }

    /// Validate configuration
    ///
    /// # Errors
    ///
    /// Returns error if configuration is invalid
    ///
    /// # Panics
    ///
    /// Panics if resource limits are zero (programming error)
    pub fn validate(&self) -> Result<()> {
        if self.min_connections > self.max_connections {
            return Err(WharfError::LimitExceeded {
                limit: self.max_connections,
                actual: self.min_connections,
            });
        }

        if let Some(tls) = &self.tls {
            if !tls.cert_file.exists() {
                return Err(WharfError::ConfigError(format!(
                    "TLS certificate file does not exist: {}",
                    tls.cert_file.display()
                )));
            }
            if !tls.key_file.exists() {
                return Err(WharfError::ConfigError(format!(
                    "TLS key file does not exist: {}",
                    tls.key_file.display()
                )));
            }
        }

        assert!(
            self.max_connections > 0,
            "max_connections must be > 0"
        );
        assert!(
            self.max_request_size > 0,
            "max_request_size must be > 0"
        );
        assert!(
            self.max_multipart_size > 0,
            "max_multipart_size must be > 0"
        );
        assert!(self.read_timeout > 0, "read_timeout must be > 0");

        Ok(())
    }
}
