use serde::{Deserialize, Serialize};
use std::path::PathBuf;

use lanyard_models::Intents;

use crate::error::GatewayError;

/// Connection settings shared by every shard in a cluster.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GatewayConfig {
    /// Bot bearer token.
    pub token: String,
    /// Intents bitmask sent with identify.
    #[serde(default)]
    pub intents: Intents,
    /// Total number of shards across all clusters.
    #[serde(default = "default_shard_count")]
    pub shard_count: u32,
    /// Gateway hostname, without scheme or port.
    #[serde(default = "default_gateway_host")]
    pub gateway_host: String,
    #[serde(default = "default_gateway_port")]
    pub gateway_port: u16,
    #[serde(default = "default_api_version")]
    pub api_version: u8,
    /// Enable the zlib-stream transport.
    #[serde(default = "default_true")]
    pub compress: bool,
    /// Member-list threshold sent with identify.
    #[serde(default = "default_large_threshold")]
    pub large_threshold: u32,
    /// Optional PEM bundle replacing the built-in trust anchors.
    #[serde(default)]
    pub ca_bundle: Option<PathBuf>,
}

impl GatewayConfig {
    pub fn new(token: impl Into<String>) -> Self {
        Self {
            token: token.into(),
            intents: Intents::default(),
            shard_count: default_shard_count(),
            gateway_host: default_gateway_host(),
            gateway_port: default_gateway_port(),
            api_version: default_api_version(),
            compress: true,
            large_threshold: default_large_threshold(),
            ca_bundle: None,
        }
    }

    /// Apply `LANYARD_*` environment overrides. Only the CA bundle path is
    /// part of the external contract; the rest mirror the config fields
    /// for deployment convenience.
    pub fn apply_env_overrides(&mut self) {
        if let Ok(value) = std::env::var("LANYARD_CA_BUNDLE") {
            if !value.trim().is_empty() {
                self.ca_bundle = Some(PathBuf::from(value));
            }
        }
        if let Ok(value) = std::env::var("LANYARD_GATEWAY_HOST") {
            if !value.trim().is_empty() {
                self.gateway_host = value;
            }
        }
        if let Ok(value) = std::env::var("LANYARD_GATEWAY_PORT") {
            if let Ok(parsed) = value.parse::<u16>() {
                self.gateway_port = parsed;
            }
        }
        if let Ok(value) = std::env::var("LANYARD_COMPRESS") {
            if let Ok(parsed) = value.parse::<bool>() {
                self.compress = parsed;
            }
        }
    }

    pub fn validate(&self) -> Result<(), GatewayError> {
        if self.token.trim().is_empty() {
            return Err(GatewayError::Config("token must not be empty".into()));
        }
        if self.shard_count == 0 {
            return Err(GatewayError::Config("shard_count must be at least 1".into()));
        }
        if self.gateway_host.trim().is_empty() {
            return Err(GatewayError::Config("gateway_host must not be empty".into()));
        }
        Ok(())
    }

    /// Request path for the gateway upgrade.
    pub fn gateway_path(&self) -> String {
        let mut path = format!("/?v={}&encoding=json", self.api_version);
        if self.compress {
            path.push_str("&compress=zlib-stream");
        }
        path
    }
}

fn default_shard_count() -> u32 {
    1
}
fn default_gateway_host() -> String {
    "gateway.lanyard.chat".into()
}
fn default_gateway_port() -> u16 {
    443
}
fn default_api_version() -> u8 {
    10
}
fn default_large_threshold() -> u32 {
    250
}
fn default_true() -> bool {
    true
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn gateway_path_reflects_compression() {
        let mut config = GatewayConfig::new("tok");
        assert_eq!(config.gateway_path(), "/?v=10&encoding=json&compress=zlib-stream");
        config.compress = false;
        assert_eq!(config.gateway_path(), "/?v=10&encoding=json");
    }

    #[test]
    fn validate_rejects_empty_token_and_zero_shards() {
        assert!(GatewayConfig::new("  ").validate().is_err());

        let mut config = GatewayConfig::new("tok");
        config.shard_count = 0;
        assert!(config.validate().is_err());

        assert!(GatewayConfig::new("tok").validate().is_ok());
    }

    #[test]
    fn ca_bundle_env_override_wins() {
        let mut config = GatewayConfig::new("tok");
        std::env::set_var("LANYARD_CA_BUNDLE", "/tmp/roots.pem");
        config.apply_env_overrides();
        std::env::remove_var("LANYARD_CA_BUNDLE");
        assert_eq!(config.ca_bundle, Some(PathBuf::from("/tmp/roots.pem")));
    }
}
