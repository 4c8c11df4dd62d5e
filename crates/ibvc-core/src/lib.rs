//! IBVC Bridge Core Library
//!
//! Drives the external IBVC version-control tool from a build pipeline:
//! resolves per-phase configuration against the inherited build
//! environment, builds the tool's argument vector, runs it, and recovers the
//! best-match revisions it announces.

pub mod command;
pub mod config;
pub mod env;
pub mod error;
pub mod fakes;
pub mod invoker;
pub mod negotiate;
pub mod node;
pub mod obs;
pub mod phase;
pub mod settings;
pub mod telemetry;

pub use command::{ArgumentVector, CommandBuilder, NodeInfo, Operation};
pub use config::{
    normalize_config_path, resolve, CheckinOptions, EffectiveConfig, Parameter, PhaseConfig,
    Precedence,
};
pub use env::{
    param_key, EnvironmentMap, VCS_BEST_MATCH_TOOL_REV, VCS_BEST_MATCH_VCS_REV, VCS_CONFIG,
    VCS_PARAM_PREFIX, VCS_TARGET_REV,
};
pub use error::{BridgeError, Result};
pub use invoker::{
    interrupt_channel, BuildLog, Interrupt, InterruptHandle, InvocationResult, OutputSink,
    ProcessInvoker, ToolInvoker,
};
pub use negotiate::{NegotiatedRevisions, RevisionNegotiator, DEFAULT_NEGOTIATION_WINDOW};
pub use node::{DefaultNodeResolver, ExecutionNode, NodeResolver, DEFAULT_TOOL_NAME};
pub use phase::{
    BuildContext, BuildResult, CheckoutOutcome, CheckoutState, SaveOutcome, VcsBridge,
};
pub use settings::{BridgeSettings, PipelineConfig};

/// Crate version.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
