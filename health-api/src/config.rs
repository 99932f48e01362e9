//! Configuration management using Figment
//!
//! Configuration is loaded from multiple sources with the following
//! precedence (highest to lowest):
//! 1. Environment variables (prefix: `HEALTH_API_`, nesting with `__`,
//!    e.g. `HEALTH_API_CLIENT__PROTOCOL=grpc`)
//! 2. A TOML file (`./config.toml` for [`Config::load`])
//! 3. Default values

use std::path::Path;

use figment::{
    providers::{Env, Format, Serialized, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};

use crate::codec::Codec;
use crate::error::Result;
use crate::protocol::Protocol;

/// Environment variable prefix
pub const ENV_PREFIX: &str = "HEALTH_API_";

/// Main configuration structure
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Config {
    /// Service configuration
    #[serde(default)]
    pub service: ServiceConfig,

    /// Outbound health client
    #[serde(default)]
    pub client: ClientSettings,
}

/// Service-level configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServiceConfig {
    /// Service name, used in logs
    #[serde(default = "default_service_name")]
    pub name: String,

    /// Log level or `EnvFilter` directive (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub log_level: String,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            name: default_service_name(),
            log_level: default_log_level(),
        }
    }
}

/// Settings for [`HealthClient::from_settings`](crate::client::HealthClient::from_settings)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClientSettings {
    /// Base URL of the remote endpoint
    #[serde(default = "default_url")]
    pub url: String,

    /// `connect`, `grpc` or `grpc+web`
    #[serde(default)]
    pub protocol: Protocol,

    /// `proto` or `json`
    #[serde(default)]
    pub codec: Codec,

    /// Attach GCE metadata identity tokens
    #[serde(default)]
    pub authorization: bool,

    /// Per-call deadline in milliseconds
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_ms: Option<u64>,
}

impl Default for ClientSettings {
    fn default() -> Self {
        Self {
            url: default_url(),
            protocol: Protocol::default(),
            codec: Codec::default(),
            authorization: false,
            timeout_ms: None,
        }
    }
}

fn default_service_name() -> String {
    "health-api".to_string()
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_url() -> String {
    "http://localhost:8080".to_string()
}

impl Config {
    /// Load configuration from `./config.toml` (if present) and the environment
    pub fn load() -> Result<Self> {
        Self::load_from("config.toml")
    }

    /// Load configuration from a specific file
    ///
    /// A missing file is not an error; defaults and environment still apply.
    pub fn load_from(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        if path.exists() {
            tracing::info!("Loading configuration from: {}", path.display());
        }

        let config = Self::figment(path).extract()?;
        Ok(config)
    }

    fn figment(path: &Path) -> Figment {
        Figment::new()
            .merge(Serialized::defaults(Config::default()))
            .merge(Toml::file(path))
            .merge(Env::prefixed(ENV_PREFIX).split("__"))
    }
}
