//! Engine Configuration - Single Source Of Truth
//!
//! Mirrors the print-authority discipline elsewhere in this engine: rather
//! than conditionals sprinkled across call sites, every tunable lives here,
//! resolved once at process start from env vars over compiled-in defaults.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub cache_root: PathBuf,
    pub storage_root: PathBuf,
    pub public_base_url: String,
    pub bind_addr: SocketAddr,
    pub connect_timeout: Duration,
    pub read_timeout: Duration,
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("invalid value for {var}: {value:?} ({reason})")]
    InvalidEnvVar {
        var: &'static str,
        value: String,
        reason: String,
    },
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            cache_root: default_data_dir().join("cache"),
            storage_root: default_data_dir().join("output"),
            public_base_url: "http://localhost:9002".to_string(),
            bind_addr: "0.0.0.0:9002".parse().unwrap(),
            connect_timeout: Duration::from_secs(5),
            read_timeout: Duration::from_secs(30),
        }
    }
}

fn default_data_dir() -> PathBuf {
    std::env::temp_dir().join("forgeimages")
}

impl EngineConfig {
    /// Layer environment variables over the compiled-in defaults. A malformed
    /// override is a startup-time hard error, never a per-request failure.
    pub fn from_env() -> Result<Self, ConfigError> {
        let mut config = Self::default();

        if let Ok(v) = std::env::var("FORGEIMAGES_CACHE_ROOT") {
            config.cache_root = PathBuf::from(v);
        }
        if let Ok(v) = std::env::var("FORGEIMAGES_STORAGE_ROOT") {
            config.storage_root = PathBuf::from(v);
        }
        if let Ok(v) = std::env::var("FORGEIMAGES_PUBLIC_BASE_URL") {
            config.public_base_url = v;
        }
        if let Ok(v) = std::env::var("FORGEIMAGES_BIND_ADDR") {
            config.bind_addr = v.parse().map_err(|e| ConfigError::InvalidEnvVar {
                var: "FORGEIMAGES_BIND_ADDR",
                value: v,
                reason: format!("{e}"),
            })?;
        }
        if let Ok(v) = std::env::var("FORGEIMAGES_CONNECT_TIMEOUT_MS") {
            config.connect_timeout = Duration::from_millis(parse_millis(
                "FORGEIMAGES_CONNECT_TIMEOUT_MS",
                &v,
            )?);
        }
        if let Ok(v) = std::env::var("FORGEIMAGES_READ_TIMEOUT_MS") {
            config.read_timeout = Duration::from_millis(parse_millis(
                "FORGEIMAGES_READ_TIMEOUT_MS",
                &v,
            )?);
        }

        Ok(config)
    }
}

fn parse_millis(var: &'static str, value: &str) -> Result<u64, ConfigError> {
    value.parse::<u64>().map_err(|e| ConfigError::InvalidEnvVar {
        var,
        value: value.to_string(),
        reason: format!("{e}"),
    })
}
