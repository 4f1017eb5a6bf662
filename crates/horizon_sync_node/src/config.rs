//! Configuration management for the sync node.
//!
//! Settings come from a TOML file that is created with defaults when it does
//! not exist yet; command-line flags are applied on top by the application.

use anyhow::{Context, Result};
use horizon_entity_sync::SyncConfig;
use horizon_rpc::RpcConfig;
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::Path;
use tracing::info;

fn default_demo_entities() -> u64 {
    8
}

/// Application configuration loaded from TOML file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AppConfig {
    pub node: NodeSettings,
    #[serde(default)]
    pub rpc: RpcConfig,
    #[serde(default)]
    pub sync: SyncConfig,
    pub logging: LoggingSettings,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeSettings {
    /// Address the dispatcher listens on in serve mode
    pub bind_address: String,
    /// Number of entities created by push mode
    #[serde(default = "default_demo_entities")]
    pub demo_entities: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LoggingSettings {
    /// Log level filter (trace, debug, info, warn, error)
    pub level: String,
    /// Whether to output logs in JSON format
    pub json_format: bool,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            node: NodeSettings {
                bind_address: "127.0.0.1:7400".to_string(),
                demo_entities: default_demo_entities(),
            },
            rpc: RpcConfig::default(),
            sync: SyncConfig::default(),
            logging: LoggingSettings {
                level: "info".to_string(),
                json_format: false,
            },
        }
    }
}

impl AppConfig {
    /// Loads configuration from a TOML file.
    ///
    /// If the file doesn't exist, writes the default configuration there and
    /// returns it.
    pub async fn load_from_file(path: &Path) -> Result<Self> {
        if path.exists() {
            let content = tokio::fs::read_to_string(path)
                .await
                .with_context(|| format!("failed to read {}", path.display()))?;
            toml::from_str(&content).with_context(|| format!("failed to parse {}", path.display()))
        } else {
            let default_config = AppConfig::default();
            let toml_content = toml::to_string_pretty(&default_config)?;
            tokio::fs::write(path, toml_content)
                .await
                .with_context(|| format!("failed to write {}", path.display()))?;
            info!("Created default configuration file: {}", path.display());
            Ok(default_config)
        }
    }

    pub fn bind_address(&self) -> Result<SocketAddr> {
        self.node
            .bind_address
            .parse()
            .with_context(|| format!("invalid bind address: {}", self.node.bind_address))
    }

    pub fn validate(&self) -> Result<(), String> {
        if self.node.bind_address.parse::<SocketAddr>().is_err() {
            return Err(format!("Invalid bind address: {}", &self.node.bind_address));
        }

        if self.node.demo_entities == 0 {
            return Err("demo_entities must be at least 1".to_string());
        }

        self.rpc.validate()?;

        let valid_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_levels.contains(&self.logging.level.as_str()) {
            return Err(format!(
                "Invalid log level: {}. Must be one of: {valid_levels:?}",
                &self.logging.level
            ));
        }

        Ok(())
    }
}
