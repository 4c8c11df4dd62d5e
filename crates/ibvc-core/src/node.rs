//! Per-node tool installation and license lookup.

use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::config::normalize_config_path;

/// Default executable name when a node has no install path configured.
pub const DEFAULT_TOOL_NAME: &str = "IBVC";

/// Tool configuration of the host a phase runs on. Read-only here.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecutionNode {
    #[serde(default)]
    pub name: String,
    /// Directory the tool is installed in.
    #[serde(default)]
    pub install_path: Option<String>,
    #[serde(default)]
    pub license_path: Option<String>,
}

impl ExecutionNode {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Self::default()
        }
    }

    pub fn with_install_path(mut self, path: impl Into<String>) -> Self {
        self.install_path = Some(path.into());
        self
    }

    pub fn with_license_path(mut self, path: impl Into<String>) -> Self {
        self.license_path = Some(path.into());
        self
    }
}

/// Looks up where the tool and its license live on a node.
pub trait NodeResolver: Send + Sync {
    /// Executable to launch. Never empty.
    fn resolve_install_path(&self, node: &ExecutionNode) -> String;

    /// License file, or an empty string when the node has none.
    fn resolve_license_path(&self, node: &ExecutionNode) -> String;
}

/// Resolver reading [`ExecutionNode`] fields directly.
///
/// The executable is `<install_path>/<tool_name>`, or the bare tool name
/// when the node has no install path.
#[derive(Debug, Clone)]
pub struct DefaultNodeResolver {
    tool_name: String,
}

impl DefaultNodeResolver {
    pub fn new(tool_name: impl Into<String>) -> Self {
        Self {
            tool_name: tool_name.into(),
        }
    }
}

impl Default for DefaultNodeResolver {
    fn default() -> Self {
        Self::new(DEFAULT_TOOL_NAME)
    }
}

impl NodeResolver for DefaultNodeResolver {
    fn resolve_install_path(&self, node: &ExecutionNode) -> String {
        match node.install_path.as_deref().filter(|p| !p.is_empty()) {
            Some(home) => Path::new(home)
                .join(&self.tool_name)
                .to_string_lossy()
                .into_owned(),
            None => self.tool_name.clone(),
        }
    }

    fn resolve_license_path(&self, node: &ExecutionNode) -> String {
        node.license_path
            .as_deref()
            .and_then(normalize_config_path)
            .unwrap_or_default()
    }
}
