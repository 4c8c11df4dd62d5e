//! Argument vector construction for the IBVC tool.

use serde::{Deserialize, Serialize};

use crate::config::EffectiveConfig;
use crate::env::EnvironmentMap;

/// Tool operations this bridge drives.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Operation {
    /// Check out the requested revision or the nearest available one.
    CheckoutBestMatch,

    /// Save the workspace back.
    Checkin,
}

impl Operation {
    /// Value passed after `--operation`.
    pub fn as_str(&self) -> &'static str {
        match self {
            Operation::CheckoutBestMatch => "checkout-best-match",
            Operation::Checkin => "checkin",
        }
    }
}

impl std::fmt::Display for Operation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Executable and license resolved for the current node.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct NodeInfo {
    pub executable: String,
    pub license: String,
}

/// Full command line, executable first.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ArgumentVector(Vec<String>);

impl ArgumentVector {
    pub fn new(argv: Vec<String>) -> Self {
        Self(argv)
    }

    /// The executable. Empty when the vector is empty.
    pub fn program(&self) -> &str {
        self.0.first().map(String::as_str).unwrap_or_default()
    }

    pub fn args(&self) -> &[String] {
        self.0.get(1..).unwrap_or_default()
    }

    pub fn as_slice(&self) -> &[String] {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn into_inner(self) -> Vec<String> {
        self.0
    }
}

impl std::fmt::Display for ArgumentVector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0.join(" "))
    }
}

/// Builds argument vectors, expanding every string against the environment.
///
/// Argument order is fixed:
///
/// 1. executable, `--operation <op>`
/// 2. `--ibvc-config <path>`, `--lic-file <path>` when present
/// 3. checkout: `--sfvc-revision <rev>`; checkin: `--keep`, `--purge-other`
/// 4. additional arguments as one token
/// 5. `--param-<name> <value>` per parameter, in stored order
#[derive(Debug, Clone, Copy)]
pub struct CommandBuilder<'a> {
    env: &'a EnvironmentMap,
}

impl<'a> CommandBuilder<'a> {
    pub fn new(env: &'a EnvironmentMap) -> Self {
        Self { env }
    }

    pub fn build(
        &self,
        operation: Operation,
        config: &EffectiveConfig,
        node: &NodeInfo,
    ) -> ArgumentVector {
        let mut argv = vec![
            self.env.expand(&node.executable),
            "--operation".to_string(),
            operation.as_str().to_string(),
        ];

        if let Some(path) = &config.config_path {
            argv.push("--ibvc-config".to_string());
            argv.push(self.env.expand(path));
        }

        if !node.license.is_empty() {
            argv.push("--lic-file".to_string());
            argv.push(self.env.expand(&node.license));
        }

        match operation {
            Operation::CheckoutBestMatch => {
                if let Some(rev) = &config.target_revision {
                    argv.push("--sfvc-revision".to_string());
                    argv.push(self.env.expand(rev));
                }
            }
            Operation::Checkin => {
                if config.checkin.keep {
                    argv.push("--keep".to_string());
                }
                if config.checkin.purge_other {
                    argv.push("--purge-other".to_string());
                }
            }
        }

        if let Some(extra) = &config.additional_arguments {
            argv.push(self.env.expand(extra));
        }

        for param in config.parameters.iter().filter(|p| !p.name.is_empty()) {
            argv.push(format!("--param-{}", self.env.expand(&param.name)));
            argv.push(self.env.expand(&param.value));
        }

        ArgumentVector(argv)
    }
}
