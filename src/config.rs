//! Configuration management for Turnstile.
//!
//! Settings are layered: built-in defaults, then an optional YAML file, then
//! the process environment.

use std::net::SocketAddr;
use std::path::Path;

use config::{Config, Environment};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::error::{Result, TurnstileError};
use crate::ratelimit::LimitPolicy;

/// Main configuration for the Turnstile service.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TurnstileConfig {
    /// Server configuration
    #[serde(default)]
    pub server: ServerConfig,

    /// Default limit configuration
    #[serde(default)]
    pub limits: LimitsConfig,

    /// Counter store configuration
    #[serde(default)]
    pub store: StoreConfig,
}

/// Server configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// HTTP listen address
    #[serde(default = "default_listen_addr")]
    pub listen_addr: SocketAddr,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen_addr: default_listen_addr(),
        }
    }
}

fn default_listen_addr() -> SocketAddr {
    SocketAddr::from(([0, 0, 0, 0], 8080))
}

/// Process-wide default quota.
///
/// Both values default to zero when unset, and a zero limit rejects every
/// request.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LimitsConfig {
    /// Requests allowed per window (`DEFAULT_LIMIT`)
    #[serde(default)]
    pub default_limit: u64,

    /// Window length in seconds (`DEFAULT_TTL`)
    #[serde(default)]
    pub default_ttl_secs: u64,
}

/// Counter store configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreConfig {
    /// Redis `host:port` (`REDIS_HOST`)
    #[serde(default = "default_redis_host")]
    pub redis_host: String,

    /// Redis password (`REDIS_PASSWORD`)
    #[serde(default)]
    pub redis_password: Option<String>,

    /// Redis logical database (`REDIS_DB`)
    #[serde(default)]
    pub redis_db: i64,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            redis_host: default_redis_host(),
            redis_password: None,
            redis_db: 0,
        }
    }
}

fn default_redis_host() -> String {
    "127.0.0.1:6379".to_string()
}

impl TurnstileConfig {
    /// Load configuration from a file path.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        info!(path = %path.display(), "Loading configuration file");

        let contents = std::fs::read_to_string(path)?;
        Self::from_yaml(&contents)
    }

    /// Load configuration from a YAML string.
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        serde_yaml::from_str(yaml)
            .map_err(|e| TurnstileError::Config(format!("Failed to parse configuration: {}", e)))
    }

    /// Load the full configuration: defaults, the optional file, then the
    /// process environment.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut config = match path {
            Some(path) => Self::from_file(path)?,
            None => Self::default(),
        };

        let env = Config::builder()
            .add_source(Environment::default())
            .build()?;
        config.apply_env(&env)?;

        if config.limits.default_limit == 0 {
            warn!("DEFAULT_LIMIT is zero or unset; every request will be rejected");
        }

        Ok(config)
    }

    /// Apply overrides from environment-style keys (lowercased variable
    /// names, as produced by `config::Environment`).
    pub fn apply_env(&mut self, env: &Config) -> Result<()> {
        if let Ok(raw) = env.get_string("default_limit") {
            self.limits.default_limit = parse_or_zero("DEFAULT_LIMIT", &raw);
        }
        if let Ok(raw) = env.get_string("default_ttl") {
            self.limits.default_ttl_secs = parse_or_zero("DEFAULT_TTL", &raw);
        }
        if let Ok(host) = env.get_string("redis_host") {
            self.store.redis_host = host;
        }
        if let Ok(password) = env.get_string("redis_password") {
            self.store.redis_password = Some(password);
        }
        if let Ok(raw) = env.get_string("redis_db") {
            self.store.redis_db = raw
                .trim()
                .parse()
                .map_err(|e| TurnstileError::Config(format!("REDIS_DB = {:?}: {}", raw, e)))?;
        }
        if let Ok(raw) = env.get_string("listen_addr") {
            self.server.listen_addr = raw
                .trim()
                .parse()
                .map_err(|e| TurnstileError::Config(format!("LISTEN_ADDR = {:?}: {}", raw, e)))?;
        }
        Ok(())
    }

    /// The default policy handed to the resolver.
    pub fn default_policy(&self) -> LimitPolicy {
        LimitPolicy::new(self.limits.default_limit, self.limits.default_ttl_secs)
    }
}

/// Parse a non-negative integer, falling back to zero.
fn parse_or_zero(name: &str, raw: &str) -> u64 {
    match raw.trim().parse() {
        Ok(value) => value,
        Err(e) => {
            warn!(variable = name, value = %raw, error = %e, "Malformed value, using 0");
            0
        }
    }
}
