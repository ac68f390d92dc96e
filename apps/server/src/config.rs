//! Server configuration.
//!
//! Supports loading from YAML files with environment variable overrides.

use std::net::SocketAddr;
use std::path::Path;

use anyhow::{Context, Result};
use serde::Deserialize;

/// One channel a publisher may stream to, with its preshared key.
#[derive(Debug, Clone, Deserialize)]
pub struct ChannelKeyConfig {
    /// Channel id presented in the CONNECT command.
    pub id: String,
    /// Preshared stream key (HMAC secret).
    pub key: String,
    /// User-facing channel name; defaults to the id.
    pub name: Option<String>,
}

/// Server configuration loaded from YAML with environment overrides.
#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Bind address for the HTTP playback API.
    /// Override: `LUCENT_HTTP_BIND`
    pub http_bind: SocketAddr,

    /// Bind address for the FTL handshake listener.
    /// Override: `LUCENT_FTL_BIND`
    pub ftl_bind: SocketAddr,

    /// Channels accepted for publishing.
    pub channels: Vec<ChannelKeyConfig>,

    /// Pipeline configuration (queue retention, Opus bitrate, RTP bind,
    /// thumbnail cadence, web expiry, ...).
    #[serde(flatten)]
    pub core: lucent_core::Config,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            http_bind: "0.0.0.0:8080".parse().expect("static address parses"),
            ftl_bind: "0.0.0.0:8084".parse().expect("static address parses"),
            channels: Vec::new(),
            core: lucent_core::Config::default(),
        }
    }
}

impl ServerConfig {
    /// Loads configuration from a YAML file, then applies environment overrides.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut config = if let Some(path) = path {
            let content = std::fs::read_to_string(path)
                .with_context(|| format!("Failed to read config file: {}", path.display()))?;
            serde_yaml::from_str(&content)
                .with_context(|| format!("Failed to parse config file: {}", path.display()))?
        } else {
            Self::default()
        };

        config.apply_env_overrides();
        Ok(config)
    }

    /// Applies environment variable overrides to the configuration.
    fn apply_env_overrides(&mut self) {
        if let Ok(val) = std::env::var("LUCENT_HTTP_BIND") {
            if let Ok(addr) = val.parse() {
                self.http_bind = addr;
            }
        }

        if let Ok(val) = std::env::var("LUCENT_FTL_BIND") {
            if let Ok(addr) = val.parse() {
                self.ftl_bind = addr;
            }
        }

        if let Ok(val) = std::env::var("LUCENT_RTP_BIND") {
            if let Ok(addr) = val.parse() {
                self.core.rtp_listen_addr = addr;
            }
        }
    }
}
