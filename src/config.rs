//! Gateway Configuration
//!
//! TOML file plus environment overrides.
//!
//! ## Priority Order (highest to lowest)
//!
//! 1. Environment variables (`PML_AUTO_APPROVE`, `PML_SANDBOX_RUNNER`)
//! 2. Config file (`~/.config/pml-gateway/config.toml` or `--config`)
//! 3. Defaults
//!
//! ## Example
//!
//! ```toml
//! [gateway]
//! auto_approve = false
//!
//! [sandbox]
//! runner = "node"
//! args = ["sandbox-runner.mjs"]
//!
//! [servers.db]
//! transport = "stdio"
//! command = "npx"
//! args = ["-y", "@example/db-server"]
//! scope = "network-api"
//! approval = "hil"
//!
//! [servers.web]
//! transport = "http-stream"
//! url = "https://tools.example.com/rpc"
//! ```

use std::collections::HashMap;
use std::fs;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::error::{PmlError, Result};
use crate::mux::ServerConfig;

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct GatewaySection {
    /// Skip HIL gates entirely (trusted automation)
    #[serde(default)]
    pub auto_approve: bool,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct SandboxSection {
    /// Interpreter command for code_exec tasks
    #[serde(default)]
    pub runner: Option<String>,

    #[serde(default)]
    pub args: Vec<String>,
}

/// Main configuration structure
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct GatewayConfig {
    #[serde(default)]
    pub gateway: GatewaySection,

    #[serde(default)]
    pub sandbox: SandboxSection,

    /// Tool servers keyed by id
    #[serde(default)]
    pub servers: HashMap<String, ServerConfig>,
}

impl GatewayConfig {
    /// Get the config directory path
    ///
    /// Returns `~/.config/pml-gateway/` on Unix, `%APPDATA%/pml-gateway/` on
    /// Windows
    pub fn config_dir() -> PathBuf {
        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("pml-gateway")
    }

    pub fn config_path() -> PathBuf {
        Self::config_dir().join("config.toml")
    }

    /// Load configuration from a specific file.
    ///
    /// Returns an error if the file is missing or malformed.
    pub fn load_from(path: &std::path::Path) -> Result<Self> {
        let content = fs::read_to_string(path).map_err(|e| PmlError::ConfigError {
            reason: format!("failed to read {}: {}", path.display(), e),
        })?;
        let mut config = Self::parse(&content)?;
        config.apply_env();
        Ok(config)
    }

    /// Load from the default location; defaults when the file is absent.
    pub fn load() -> Result<Self> {
        let path = Self::config_path();
        if !path.exists() {
            let mut config = Self::default();
            config.apply_env();
            return Ok(config);
        }
        Self::load_from(&path)
    }

    pub fn parse(content: &str) -> Result<Self> {
        let mut config: GatewayConfig =
            toml::from_str(content).map_err(|e| PmlError::ConfigError {
                reason: format!("failed to parse config: {}", e),
            })?;
        // Server ids come from the table keys
        for (id, server) in config.servers.iter_mut() {
            server.id = id.clone();
        }
        Ok(config)
    }

    fn apply_env(&mut self) {
        if let Ok(value) = std::env::var("PML_AUTO_APPROVE") {
            self.gateway.auto_approve = matches!(value.as_str(), "1" | "true" | "yes");
        }
        if let Ok(runner) = std::env::var("PML_SANDBOX_RUNNER") {
            if !runner.is_empty() {
                self.sandbox.runner = Some(runner);
            }
        }
    }

    /// Server configs with ids filled in, deterministic order.
    pub fn server_configs(&self) -> Vec<ServerConfig> {
        let mut configs: Vec<ServerConfig> = self.servers.values().cloned().collect();
        configs.sort_by(|a, b| a.id.cmp(&b.id));
        configs
    }
}
