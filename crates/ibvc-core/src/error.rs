//! Error taxonomy for the IBVC bridge.

use std::path::PathBuf;

/// Errors produced while running a pipeline phase.
///
/// A best-match miss is not represented here: the negotiator returns
/// `None` and later phases simply see no best-match variables.
#[derive(Debug, thiserror::Error)]
pub enum BridgeError {
    /// The tool process could not be started.
    #[error("failed to launch {program}: {source}")]
    LaunchFailure {
        program: String,
        #[source]
        source: std::io::Error,
    },

    /// The tool ran and exited non-zero. The code stays out of the message.
    #[error("IBVC terminated with errors")]
    ToolExecutionFailure { exit_code: i32 },

    /// The host interrupted the wait on the tool process.
    #[error("IBVC failed to finish properly: {0}")]
    Interrupted(String),

    #[error("invalid phase configuration: {0}")]
    InvalidConfig(String),

    #[error("invalid checkout state transition: {from} -> {to}")]
    InvalidTransition { from: String, to: String },

    #[error("failed to load configuration from {path}: {reason}")]
    ConfigFile { path: PathBuf, reason: String },

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl BridgeError {
    /// Whether this error ended a phase because of the tool itself
    /// (launch, exit code or interruption) rather than bad input.
    pub fn is_tool_failure(&self) -> bool {
        matches!(
            self,
            BridgeError::LaunchFailure { .. }
                | BridgeError::ToolExecutionFailure { .. }
                | BridgeError::Interrupted(_)
        )
    }
}

/// Result type for bridge operations.
pub type Result<T> = std::result::Result<T, BridgeError>;
