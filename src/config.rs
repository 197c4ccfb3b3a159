//! Configuration types and loading
//!
//! Configuration is a small JSON document selecting the transport and the
//! remote endpoint, with optional timeout overrides:
//!
//! ```json
//! {
//!     "endpoint": "203.0.113.7:443",
//!     "transmission": "tls",
//!     "connect_timeout_secs": 5
//! }
//! ```
//!
//! Every field can also be overridden from the environment
//! (`WG_STREAM_ENDPOINT`, `WG_STREAM_TRANSMISSION`).

use std::fmt;
use std::net::SocketAddr;
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::bind::StreamBindConfig;
use crate::error::ConfigError;

/// Environment variable overriding the endpoint.
const ENV_ENDPOINT: &str = "WG_STREAM_ENDPOINT";

/// Environment variable overriding the transmission.
const ENV_TRANSMISSION: &str = "WG_STREAM_TRANSMISSION";

/// How WireGuard datagrams reach the peer.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Transmission {
    /// Native datagrams; served by the platform bind, unsupervised.
    Udp,
    /// TunSafe frames over a plain TCP stream.
    #[default]
    Tcp,
    /// TunSafe frames over a TLS-wrapped TCP stream.
    Tls,
}

impl Transmission {
    /// Whether this transmission runs over the stream bind.
    #[must_use]
    pub fn is_stream(self) -> bool {
        matches!(self, Self::Tcp | Self::Tls)
    }

    /// Canonical config-file spelling.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Udp => "udp",
            Self::Tcp => "tcp",
            Self::Tls => "tls",
        }
    }
}

impl FromStr for Transmission {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "udp" => Ok(Self::Udp),
            "tcp" => Ok(Self::Tcp),
            "tls" => Ok(Self::Tls),
            other => Err(ConfigError::validation(format!(
                "unknown transmission {other:?} (expected udp, tcp or tls)"
            ))),
        }
    }
}

impl fmt::Display for Transmission {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Root configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Config {
    /// Remote endpoint as `ip:port`.
    pub endpoint: String,

    /// Transport selection.
    #[serde(default)]
    pub transmission: Transmission,

    /// TCP connect timeout in seconds.
    #[serde(default = "default_connect_timeout_secs")]
    pub connect_timeout_secs: u64,

    /// TLS handshake deadline in seconds.
    #[serde(default = "default_handshake_timeout_secs")]
    pub handshake_timeout_secs: u64,
}

fn default_connect_timeout_secs() -> u64 {
    5
}

fn default_handshake_timeout_secs() -> u64 {
    5
}

impl Config {
    /// Validate field values.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::ValidationError` when a value is out of range
    /// or unparsable.
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.endpoint.parse::<SocketAddr>().map_err(|_| {
            ConfigError::validation(format!(
                "endpoint {:?} is not an ip:port pair",
                self.endpoint
            ))
        })?;
        if self.connect_timeout_secs == 0 {
            return Err(ConfigError::validation("connect_timeout_secs must be > 0"));
        }
        if self.handshake_timeout_secs == 0 {
            return Err(ConfigError::validation(
                "handshake_timeout_secs must be > 0",
            ));
        }
        Ok(())
    }

    /// Bind configuration for a stream transmission; `None` under UDP.
    #[must_use]
    pub fn stream_bind_config(&self) -> Option<StreamBindConfig> {
        if !self.transmission.is_stream() {
            return None;
        }
        let base = if self.transmission == Transmission::Tls {
            StreamBindConfig::tls()
        } else {
            StreamBindConfig::tcp()
        };
        Some(
            base.with_connect_timeout(Duration::from_secs(self.connect_timeout_secs))
                .with_handshake_timeout(Duration::from_secs(self.handshake_timeout_secs)),
        )
    }
}

/// Load configuration from a JSON file, then apply environment overrides.
///
/// # Errors
///
/// Returns `ConfigError` if the file cannot be read, parsed or validated.
pub fn load_config(path: impl AsRef<Path>) -> Result<Config, ConfigError> {
    let path = path.as_ref();
    debug!(?path, "loading configuration");

    if !path.exists() {
        return Err(ConfigError::FileNotFound {
            path: path.display().to_string(),
        });
    }
    let contents = std::fs::read_to_string(path)?;
    let mut config: Config = serde_json::from_str(&contents)
        .map_err(|e| ConfigError::ParseError(format!("failed to parse JSON: {e}")))?;

    apply_env_overrides(&mut config)?;
    config.validate()?;

    info!(
        endpoint = %config.endpoint,
        transmission = %config.transmission,
        "configuration loaded"
    );
    Ok(config)
}

/// Load configuration from a JSON string. No environment overrides.
///
/// # Errors
///
/// Returns `ConfigError` if parsing or validation fails.
pub fn load_config_str(json: &str) -> Result<Config, ConfigError> {
    let config: Config =
        serde_json::from_str(json).map_err(|e| ConfigError::ParseError(e.to_string()))?;
    config.validate()?;
    Ok(config)
}

fn apply_env_overrides(config: &mut Config) -> Result<(), ConfigError> {
    if let Ok(endpoint) = std::env::var(ENV_ENDPOINT) {
        debug!(%endpoint, "endpoint overridden from environment");
        config.endpoint = endpoint;
    }
    if let Ok(transmission) = std::env::var(ENV_TRANSMISSION) {
        debug!(%transmission, "transmission overridden from environment");
        config.transmission = transmission.parse()?;
    }
    Ok(())
}
