//! Configuration management for Portico.

use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::{PorticoError, Result};

/// Environment variable prefix; `PORTICO__SERVER__BIND` maps to `server.bind`.
const ENV_PREFIX: &str = "PORTICO";

/// Largest accepted `server.throttle`. The throttle admits three times this
/// many requests (running plus backlog), which must fit in a semaphore.
pub const MAX_THROTTLE: usize = tokio::sync::Semaphore::MAX_PERMITS / 3;

fn environment() -> config::Environment {
    config::Environment::with_prefix(ENV_PREFIX)
        .prefix_separator("__")
        .separator("__")
        .list_separator(",")
        .with_list_parse_key("cors.allowed_origins")
        .try_parsing(true)
}

/// Main configuration for the Portico gateway.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PorticoConfig {
    /// Server configuration
    #[serde(default)]
    pub server: ServerConfig,

    /// TLS configuration
    #[serde(default)]
    pub tls: TlsConfig,

    /// CORS configuration for the API routes
    #[serde(default)]
    pub cors: CorsConfig,

    /// Rate limiting configuration
    #[serde(default)]
    pub rate_limiting: RateLimitingConfig,
}

/// Server configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Address to listen on
    #[serde(default = "default_bind")]
    pub bind: SocketAddr,

    /// Trust forwarded-client headers from a reverse proxy
    #[serde(default)]
    pub proxy: bool,

    /// Maximum concurrent in-flight requests (0 disables the throttle)
    #[serde(default)]
    pub throttle: usize,

    /// Directory holding the SPA bundle (`index.html` and assets)
    #[serde(default = "default_public_dir")]
    pub public_dir: PathBuf,

    /// Upper bound on how long in-flight requests may drain at shutdown
    #[serde(default = "default_drain_timeout")]
    pub drain_timeout_secs: u64,

    /// How long a connection may take to send a complete request head
    #[serde(default = "default_read_timeout")]
    pub read_timeout_secs: u64,

    /// Include panic details in 500 responses
    #[serde(default)]
    pub debug: bool,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: default_bind(),
            proxy: false,
            throttle: 0,
            public_dir: default_public_dir(),
            drain_timeout_secs: default_drain_timeout(),
            read_timeout_secs: default_read_timeout(),
            debug: false,
        }
    }
}

impl ServerConfig {
    pub fn drain_timeout(&self) -> Duration {
        Duration::from_secs(self.drain_timeout_secs)
    }

    pub fn read_timeout(&self) -> Duration {
        Duration::from_secs(self.read_timeout_secs)
    }
}

fn default_bind() -> SocketAddr {
    SocketAddr::from(([0, 0, 0, 0], 8080))
}

fn default_public_dir() -> PathBuf {
    PathBuf::from("public/dist")
}

fn default_drain_timeout() -> u64 {
    10
}

fn default_read_timeout() -> u64 {
    10
}

/// TLS configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TlsConfig {
    /// Serve HTTPS instead of plain HTTP
    #[serde(default)]
    pub enabled: bool,

    /// PEM certificate chain
    pub cert: Option<PathBuf>,

    /// PEM private key
    pub key: Option<PathBuf>,
}

/// CORS configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CorsConfig {
    /// Allowed origins; `*` (or an empty list) allows any origin
    #[serde(default = "default_allowed_origins")]
    pub allowed_origins: Vec<String>,
}

impl Default for CorsConfig {
    fn default() -> Self {
        Self {
            allowed_origins: default_allowed_origins(),
        }
    }
}

impl CorsConfig {
    /// Whether any origin is allowed.
    pub fn allows_any(&self) -> bool {
        self.allowed_origins.is_empty() || self.allowed_origins.iter().any(|o| o == "*")
    }
}

fn default_allowed_origins() -> Vec<String> {
    vec!["*".to_string()]
}

/// Rate limiting configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RateLimitingConfig {
    /// Requests allowed per client per window (0 disables limiting)
    #[serde(default = "default_limit")]
    pub limit: u64,

    /// Window length in seconds
    #[serde(default = "default_interval")]
    pub interval_secs: u64,

    /// How often the in-memory backend evicts expired entries, in seconds
    #[serde(default = "default_cleanup_interval")]
    pub cleanup_interval_secs: u64,
}

impl Default for RateLimitingConfig {
    fn default() -> Self {
        Self {
            limit: default_limit(),
            interval_secs: default_interval(),
            cleanup_interval_secs: default_cleanup_interval(),
        }
    }
}

impl RateLimitingConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs)
    }

    pub fn cleanup_interval(&self) -> Duration {
        Duration::from_secs(self.cleanup_interval_secs)
    }

    pub fn is_enabled(&self) -> bool {
        self.limit > 0
    }
}

fn default_limit() -> u64 {
    2000
}

fn default_interval() -> u64 {
    60 * 60
}

fn default_cleanup_interval() -> u64 {
    10
}

impl PorticoConfig {
    /// Load configuration from defaults, an optional file, and `PORTICO__*`
    /// environment variables, in increasing order of precedence.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        Self::load_with(path, environment())
    }

    fn load_with(path: Option<&Path>, env: config::Environment) -> Result<Self> {
        let mut builder = config::Config::builder();

        if let Some(path) = path {
            builder = builder.add_source(config::File::from(path).required(true));
        }

        let config: PorticoConfig = builder.add_source(env).build()?.try_deserialize()?;

        config.validate()?;
        Ok(config)
    }

    /// Load configuration from a YAML string.
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        let config: PorticoConfig = serde_yaml::from_str(yaml)
            .map_err(|e| PorticoError::Config(format!("Failed to parse config: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    /// Reject settings the gateway cannot run with.
    pub fn validate(&self) -> Result<()> {
        if self.rate_limiting.interval_secs == 0 {
            return Err(PorticoError::Config(
                "rate_limiting.interval_secs must be greater than zero".to_string(),
            ));
        }

        if self.rate_limiting.cleanup_interval_secs == 0 {
            return Err(PorticoError::Config(
                "rate_limiting.cleanup_interval_secs must be greater than zero".to_string(),
            ));
        }

        if self.server.read_timeout_secs == 0 {
            return Err(PorticoError::Config(
                "server.read_timeout_secs must be greater than zero".to_string(),
            ));
        }

        if self.server.throttle > MAX_THROTTLE {
            return Err(PorticoError::Config(format!(
                "server.throttle must be at most {}",
                MAX_THROTTLE
            )));
        }

        if self.tls.enabled && (self.tls.cert.is_none() || self.tls.key.is_none()) {
            return Err(PorticoError::Config(
                "tls.cert and tls.key are required when tls is enabled".to_string(),
            ));
        }

        Ok(())
    }
}
