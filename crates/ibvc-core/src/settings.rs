//! Host configuration file and environment overrides.
//!
//! A pipeline is described by one TOML file:
//!
//! ```toml
//! [settings]
//! tool_name = "IBVC"
//! negotiation_window = 10000
//!
//! [node]
//! name = "agent-1"
//! install_path = "/opt/ibvc"
//! license_path = "/etc/ibvc/license.lic"
//!
//! [checkout]
//! config_path = "/repo/ibvc.config"
//! target_revision = "HEAD"
//!
//! [[checkout.parameters]]
//! name = "ARCH"
//! value = "x86"
//!
//! [save]
//! keep = true
//! ```
//!
//! `IBVC_BRIDGE_TOOL_NAME` and `IBVC_BRIDGE_NEGOTIATION_WINDOW` override the
//! `[settings]` table after the file is read.

use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::config::PhaseConfig;
use crate::error::{BridgeError, Result};
use crate::negotiate::DEFAULT_NEGOTIATION_WINDOW;
use crate::node::{ExecutionNode, DEFAULT_TOOL_NAME};

pub const ENV_TOOL_NAME: &str = "IBVC_BRIDGE_TOOL_NAME";
pub const ENV_NEGOTIATION_WINDOW: &str = "IBVC_BRIDGE_NEGOTIATION_WINDOW";

/// Knobs of the bridge itself, independent of any phase.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BridgeSettings {
    /// Executable name, joined onto a node's install path.
    #[serde(default = "default_tool_name")]
    pub tool_name: String,

    /// Most recent log lines scanned for the best-match announcement.
    #[serde(default = "default_negotiation_window")]
    pub negotiation_window: usize,
}

fn default_tool_name() -> String {
    DEFAULT_TOOL_NAME.to_string()
}

fn default_negotiation_window() -> usize {
    DEFAULT_NEGOTIATION_WINDOW
}

impl Default for BridgeSettings {
    fn default() -> Self {
        Self {
            tool_name: default_tool_name(),
            negotiation_window: default_negotiation_window(),
        }
    }
}

impl BridgeSettings {
    /// Apply overrides from an environment lookup.
    ///
    /// Takes the lookup as a function so tests need not touch the process
    /// environment.
    pub fn apply_env<F>(&mut self, lookup: F) -> Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(name) = lookup(ENV_TOOL_NAME).filter(|v| !v.is_empty()) {
            self.tool_name = name;
        }
        if let Some(raw) = lookup(ENV_NEGOTIATION_WINDOW) {
            self.negotiation_window = raw.trim().parse().map_err(|_| {
                BridgeError::InvalidConfig(format!(
                    "{ENV_NEGOTIATION_WINDOW} must be a non-negative integer, got '{raw}'"
                ))
            })?;
        }
        Ok(())
    }
}

/// Everything a host needs to drive the three phases for one build.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PipelineConfig {
    #[serde(default)]
    pub settings: BridgeSettings,
    #[serde(default)]
    pub node: ExecutionNode,
    #[serde(default)]
    pub checkout: PhaseConfig,
    #[serde(default)]
    pub setup: PhaseConfig,
    #[serde(default)]
    pub save: PhaseConfig,
}

impl PipelineConfig {
    /// Parse a TOML document and validate every phase.
    pub fn from_toml_str(content: &str) -> Result<Self> {
        let config: PipelineConfig = toml::from_str(content)
            .map_err(|e| BridgeError::InvalidConfig(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Read the file at `path`, then apply process environment overrides.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| BridgeError::ConfigFile {
            path: path.to_path_buf(),
            reason: e.to_string(),
        })?;
        let mut config = Self::from_toml_str(&content).map_err(|e| BridgeError::ConfigFile {
            path: path.to_path_buf(),
            reason: e.to_string(),
        })?;
        config.settings.apply_env(|key| std::env::var(key).ok())?;
        tracing::debug!(path = %path.display(), "loaded pipeline configuration");
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        self.checkout.validate()?;
        self.setup.validate()?;
        self.save.validate()?;
        Ok(())
    }
}
