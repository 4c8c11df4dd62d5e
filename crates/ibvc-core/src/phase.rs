//! The three pipeline phases driven through one shared core.
//!
//! [`VcsBridge`] owns the tool invoker and node resolver; each phase method
//! is a thin adapter choosing an [`Operation`] and a [`Precedence`] and
//! threading the build's [`EnvironmentMap`] from one phase to the next.
//!
//! - checkout: resolve, build argv, invoke, negotiate, publish
//! - build-setup: resolve from the environment and publish, no tool run
//! - post-build save: resolve with override, build argv, invoke

use std::collections::BTreeMap;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::{debug, Instrument};

use crate::command::{ArgumentVector, CommandBuilder, NodeInfo, Operation};
use crate::config::{resolve, EffectiveConfig, PhaseConfig, Precedence};
use crate::env::{param_key, EnvironmentMap, VCS_CONFIG, VCS_TARGET_REV};
use crate::error::{BridgeError, Result};
use crate::invoker::{BuildLog, Interrupt, InvocationResult, OutputSink, ToolInvoker};
use crate::negotiate::{NegotiatedRevisions, RevisionNegotiator};
use crate::node::{ExecutionNode, NodeResolver};
use crate::obs;
use crate::settings::BridgeSettings;

/// Phase names used in spans and lifecycle events.
pub const CHECKOUT: &str = "checkout";
pub const BUILD_SETUP: &str = "build-setup";
pub const POST_BUILD_SAVE: &str = "post-build-save";

// ---------------------------------------------------------------------------
// Build context
// ---------------------------------------------------------------------------

/// Overall outcome of the build the phases belong to.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BuildResult {
    #[default]
    Success,
    Failure,
}

/// Per-build state handed from phase to phase by the host.
#[derive(Debug)]
pub struct BuildContext {
    pub env: EnvironmentMap,
    pub log: BuildLog,
    pub result: BuildResult,
    pub node: ExecutionNode,
    pub interrupt: Interrupt,
}

impl BuildContext {
    pub fn new(node: ExecutionNode) -> Self {
        Self {
            env: EnvironmentMap::new(),
            log: BuildLog::new(),
            result: BuildResult::Success,
            node,
            interrupt: Interrupt::never(),
        }
    }

    pub fn with_env(mut self, env: EnvironmentMap) -> Self {
        self.env = env;
        self
    }

    pub fn with_log(mut self, log: BuildLog) -> Self {
        self.log = log;
        self
    }

    pub fn with_result(mut self, result: BuildResult) -> Self {
        self.result = result;
        self
    }

    pub fn with_interrupt(mut self, interrupt: Interrupt) -> Self {
        self.interrupt = interrupt;
        self
    }

    pub fn mark_failed(&mut self) {
        self.result = BuildResult::Failure;
    }

    pub fn succeeded(&self) -> bool {
        self.result == BuildResult::Success
    }
}

// ---------------------------------------------------------------------------
// Checkout state machine
// ---------------------------------------------------------------------------

/// Progress of the checkout phase.
///
/// `Pending -> Invoking -> (Succeeded -> Negotiating -> Published) | Failed`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CheckoutState {
    Pending,
    Invoking,
    Succeeded,
    Negotiating,
    Published,
    Failed,
}

impl CheckoutState {
    pub fn can_transition_to(self, next: CheckoutState) -> bool {
        use CheckoutState::*;
        matches!(
            (self, next),
            (Pending, Invoking)
                | (Invoking, Succeeded)
                | (Invoking, Failed)
                | (Succeeded, Negotiating)
                | (Negotiating, Published)
        )
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, CheckoutState::Published | CheckoutState::Failed)
    }

    fn advance(&mut self, next: CheckoutState) -> Result<()> {
        if !self.can_transition_to(next) {
            return Err(BridgeError::InvalidTransition {
                from: format!("{self:?}"),
                to: format!("{next:?}"),
            });
        }
        debug!(from = ?*self, to = ?next, "checkout state");
        *self = next;
        Ok(())
    }
}

/// Result of a successful checkout phase.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CheckoutOutcome {
    pub state: CheckoutState,
    pub invocation: InvocationResult,
    /// `None` when the tool announced no best match.
    pub revisions: Option<NegotiatedRevisions>,
}

/// Result of a post-build save phase.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SaveOutcome {
    Saved(InvocationResult),
    /// The build had already failed; nothing was saved.
    Skipped,
}

// ---------------------------------------------------------------------------
// Bridge
// ---------------------------------------------------------------------------

/// Shared core behind the checkout, build-setup and post-build phases.
pub struct VcsBridge {
    invoker: Arc<dyn ToolInvoker>,
    resolver: Arc<dyn NodeResolver>,
    negotiator: RevisionNegotiator,
}

impl VcsBridge {
    pub fn new(invoker: Arc<dyn ToolInvoker>, resolver: Arc<dyn NodeResolver>) -> Self {
        Self {
            invoker,
            resolver,
            negotiator: RevisionNegotiator::default(),
        }
    }

    pub fn with_settings(mut self, settings: &BridgeSettings) -> Self {
        self.negotiator = RevisionNegotiator::new(settings.negotiation_window);
        self
    }

    pub fn with_negotiation_window(mut self, max_lines: usize) -> Self {
        self.negotiator = RevisionNegotiator::new(max_lines);
        self
    }

    /// Pre-build checkout with best-match negotiation.
    ///
    /// On success the resolved configuration and any negotiated revisions
    /// are published into `build.env`. On failure the environment is left
    /// untouched and the build is marked failed.
    pub async fn checkout(
        &self,
        config: &PhaseConfig,
        build: &mut BuildContext,
    ) -> Result<CheckoutOutcome> {
        self.run_checkout(config, build)
            .instrument(obs::phase_span(CHECKOUT))
            .await
    }

    async fn run_checkout(
        &self,
        config: &PhaseConfig,
        build: &mut BuildContext,
    ) -> Result<CheckoutOutcome> {
        obs::emit_phase_started(CHECKOUT);
        config.validate()?;

        let mut state = CheckoutState::Pending;
        let effective = resolve(config, &build.env, Precedence::OverrideIfRequested);
        let node = self.node_info(build);
        build.log.write_line(&format!("IBVC path: '{}'", node.executable));
        build.log.write_line(&format!("IBVC license: '{}'", node.license));

        let argv =
            CommandBuilder::new(&build.env).build(Operation::CheckoutBestMatch, &effective, &node);

        state.advance(CheckoutState::Invoking)?;
        let invocation = match self
            .run_tool(Operation::CheckoutBestMatch, &argv, build)
            .await
        {
            Ok(invocation) => invocation,
            Err(e) => {
                state.advance(CheckoutState::Failed)?;
                obs::emit_phase_error(CHECKOUT, &e);
                return Err(e);
            }
        };
        state.advance(CheckoutState::Succeeded)?;

        publish_config(&effective, &mut build.env);

        state.advance(CheckoutState::Negotiating)?;
        let window = build.log.tail(self.negotiator.max_lines());
        let revisions = self.negotiator.extract(&window, &build.log);
        match &revisions {
            Some(revs) => {
                if revs.publish(&mut build.env) {
                    obs::emit_revisions_published(&revs.tool_revision, &revs.vcs_revision);
                }
            }
            None => obs::emit_negotiation_miss(self.negotiator.max_lines()),
        }
        state.advance(CheckoutState::Published)?;

        obs::emit_phase_finished(CHECKOUT, true);
        Ok(CheckoutOutcome {
            state,
            invocation,
            revisions,
        })
    }

    /// Build-time environment setup. Never runs the tool.
    ///
    /// Publishes configuration with inherited values taking precedence and
    /// returns every `VCS_*` variable build steps will see.
    pub fn build_setup(
        &self,
        config: &PhaseConfig,
        build: &mut BuildContext,
    ) -> Result<BTreeMap<String, String>> {
        let _span = obs::PhaseSpan::enter(BUILD_SETUP);
        obs::emit_phase_started(BUILD_SETUP);
        config.validate()?;

        let effective = resolve(config, &build.env, Precedence::Inherit);
        publish_config(&effective, &mut build.env);

        if let Some(revs) = NegotiatedRevisions::from_env(&build.env) {
            debug!(
                tool_revision = %revs.tool_revision,
                vcs_revision = %revs.vcs_revision,
                "best-match revisions visible to build steps"
            );
        }

        obs::emit_phase_finished(BUILD_SETUP, true);
        Ok(build.env.vcs_vars())
    }

    /// Post-build save (checkin). Skipped when the build already failed.
    pub async fn post_build_save(
        &self,
        config: &PhaseConfig,
        build: &mut BuildContext,
    ) -> Result<SaveOutcome> {
        self.run_post_build_save(config, build)
            .instrument(obs::phase_span(POST_BUILD_SAVE))
            .await
    }

    async fn run_post_build_save(
        &self,
        config: &PhaseConfig,
        build: &mut BuildContext,
    ) -> Result<SaveOutcome> {
        obs::emit_phase_started(POST_BUILD_SAVE);
        if !build.succeeded() {
            build.log.write_line("Skipping IBVC save on failure");
            obs::emit_phase_finished(POST_BUILD_SAVE, true);
            return Ok(SaveOutcome::Skipped);
        }
        config.validate()?;

        let effective = resolve(config, &build.env, Precedence::OverrideIfRequested);
        let node = self.node_info(build);
        let argv = CommandBuilder::new(&build.env).build(Operation::Checkin, &effective, &node);

        let invocation = self
            .run_tool(Operation::Checkin, &argv, build)
            .await
            .inspect_err(|e| obs::emit_phase_error(POST_BUILD_SAVE, e))?;

        obs::emit_phase_finished(POST_BUILD_SAVE, true);
        Ok(SaveOutcome::Saved(invocation))
    }

    fn node_info(&self, build: &BuildContext) -> NodeInfo {
        NodeInfo {
            executable: build
                .env
                .expand(&self.resolver.resolve_install_path(&build.node)),
            license: build
                .env
                .expand(&self.resolver.resolve_license_path(&build.node)),
        }
    }

    /// Invoke the tool and turn anything but a clean exit into a failed
    /// build plus an error, with the reason on the build log.
    async fn run_tool(
        &self,
        operation: Operation,
        argv: &ArgumentVector,
        build: &mut BuildContext,
    ) -> Result<InvocationResult> {
        obs::emit_tool_invoked(operation, argv.program(), argv.args().len());

        let outcome = self
            .invoker
            .invoke(argv, &build.log, &build.interrupt)
            .await;

        match outcome {
            Ok(invocation) if invocation.succeeded => {
                obs::emit_tool_exited(operation, invocation.exit_code, true);
                build.log.write_line("IBVC finished successfully");
                Ok(invocation)
            }
            Ok(invocation) => {
                obs::emit_tool_exited(operation, invocation.exit_code, false);
                build.mark_failed();
                let err = BridgeError::ToolExecutionFailure {
                    exit_code: invocation.exit_code,
                };
                build.log.write_line(&err.to_string());
                Err(err)
            }
            Err(err) => {
                build.mark_failed();
                build.log.write_line(&err.to_string());
                Err(err)
            }
        }
    }
}

/// Publish config path, target revision and parameters, first writer wins.
fn publish_config(config: &EffectiveConfig, env: &mut EnvironmentMap) {
    if let Some(path) = &config.config_path {
        env.publish(VCS_CONFIG, path.clone());
    }
    if let Some(rev) = &config.target_revision {
        env.publish(VCS_TARGET_REV, rev.clone());
    }
    for param in config.parameters.iter().filter(|p| !p.name.is_empty()) {
        env.publish(param_key(&param.name), param.value.clone());
    }
}
