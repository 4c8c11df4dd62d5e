//! IBVC Bridge - build pipeline host for the IBVC version-control tool
//!
//! The `ibvc-bridge` command runs one pipeline phase per invocation and
//! hands the build environment from phase to phase through a state file.
//!
//! ## Commands
//!
//! - `checkout`: Check out the requested revision, or the tool's best match
//! - `setup`: Publish the `VCS_*` variables build steps will see
//! - `save`: Check the workspace back in after the build
//! - `env`: Print the current build environment
//! - `reset`: Discard the state file before a new build

use anyhow::{Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use serde::{Deserialize, Serialize};
use std::fs::OpenOptions;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{info, Level};

use ibvc_core::{
    interrupt_channel, BridgeSettings, BuildContext, BuildLog, BuildResult, DefaultNodeResolver,
    EnvironmentMap, Interrupt, PipelineConfig, ProcessInvoker, SaveOutcome, VcsBridge,
};

#[derive(Parser)]
#[command(name = "ibvc-bridge")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = "Run IBVC checkout, setup and save phases for a build", long_about = None)]
struct Cli {
    /// Enable verbose output
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Emit JSON-formatted log lines
    #[arg(long, global = true)]
    json: bool,

    /// Pipeline configuration (TOML)
    #[arg(short, long, global = true, env = "IBVC_BRIDGE_CONFIG")]
    config: Option<PathBuf>,

    /// Build environment state shared between phases
    #[arg(
        long,
        global = true,
        env = "IBVC_BRIDGE_STATE",
        default_value = ".ibvc/build-env.json"
    )]
    state: PathBuf,

    /// Append the build log to this file instead of stdout
    #[arg(long, global = true)]
    log_file: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Check out the requested revision before the build
    Checkout,

    /// Publish VCS_* variables for build steps and print them
    Setup,

    /// Save the workspace after the build
    Save {
        /// Record the build as failed first (the save is then skipped)
        #[arg(long)]
        build_failed: bool,
    },

    /// Print the build environment
    Env {
        /// Output format
        #[arg(long, value_enum, default_value_t = EnvFormat::Shell)]
        format: EnvFormat,
    },

    /// Discard the state file so the next checkout starts a fresh build
    Reset,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum EnvFormat {
    /// KEY=VALUE lines
    Shell,
    /// One JSON object
    Json,
}

/// Everything one build carries between `ibvc-bridge` invocations.
#[derive(Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
struct BuildState {
    #[serde(default)]
    env: EnvironmentMap,
    #[serde(default)]
    result: BuildResult,
}

impl BuildState {
    /// Read the state file. A missing file is a fresh build.
    fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read state file: {}", path.display()))?;
        serde_json::from_str(&content)
            .with_context(|| format!("Failed to parse state file: {}", path.display()))
    }

    fn store(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create {}", parent.display()))?;
        }
        let json = serde_json::to_string_pretty(self)?;
        std::fs::write(path, json)
            .with_context(|| format!("Failed to write state file: {}", path.display()))
    }
}

/// Host-side resources shared by every phase command.
struct Session {
    pipeline: PipelineConfig,
    state_path: PathBuf,
    log: BuildLog,
    interrupt: Interrupt,
}

impl Session {
    /// Build context for one phase, seeded from the state file.
    fn open(&self) -> Result<BuildContext> {
        let state = BuildState::load(&self.state_path)?;
        Ok(BuildContext::new(self.pipeline.node.clone())
            .with_env(state.env)
            .with_result(state.result)
            .with_log(self.log.clone())
            .with_interrupt(self.interrupt.clone()))
    }

    /// Write the phase's environment and build result back, even after a
    /// failed phase so later phases see the failure.
    fn persist(&self, build: BuildContext) -> Result<()> {
        BuildState {
            env: build.env,
            result: build.result,
        }
        .store(&self.state_path)
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Setup logging
    let level = if cli.verbose {
        Level::DEBUG
    } else {
        Level::INFO
    };
    ibvc_core::telemetry::init_tracing(cli.json, level);

    let pipeline = load_pipeline(cli.config.as_deref())?;
    let log = open_build_log(cli.log_file.as_deref())?
        .with_capacity(pipeline.settings.negotiation_window);

    let (handle, interrupt) = interrupt_channel();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            handle.interrupt("interrupted by Ctrl-C");
        }
    });

    let bridge = process_bridge(&pipeline.settings);
    let session = Session {
        pipeline,
        state_path: cli.state,
        log,
        interrupt,
    };

    match cli.command {
        Commands::Checkout => cmd_checkout(&bridge, &session).await,
        Commands::Setup => {
            let vars = cmd_setup(&bridge, &session)?;
            print!("{}", format_env(&vars, EnvFormat::Shell)?);
            Ok(())
        }
        Commands::Save { build_failed } => cmd_save(&bridge, &session, build_failed).await,
        Commands::Env { format } => {
            let state = BuildState::load(&session.state_path)?;
            print!("{}", format_env(&state.env, format)?);
            Ok(())
        }
        Commands::Reset => cmd_reset(&session.state_path),
    }
}

/// Load the pipeline file, or defaults plus environment overrides when no
/// file is given.
fn load_pipeline(path: Option<&Path>) -> Result<PipelineConfig> {
    match path {
        Some(path) => PipelineConfig::load(path).context("Failed to load pipeline configuration"),
        None => {
            let mut pipeline = PipelineConfig::default();
            pipeline
                .settings
                .apply_env(|key| std::env::var(key).ok())
                .context("Invalid bridge settings in environment")?;
            Ok(pipeline)
        }
    }
}

fn open_build_log(path: Option<&Path>) -> Result<BuildLog> {
    let writer: Box<dyn Write + Send> = match path {
        Some(path) => Box::new(
            OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)
                .with_context(|| format!("Failed to open log file: {}", path.display()))?,
        ),
        None => Box::new(std::io::stdout()),
    };
    Ok(BuildLog::with_tee(writer))
}

fn process_bridge(settings: &BridgeSettings) -> VcsBridge {
    VcsBridge::new(
        Arc::new(ProcessInvoker::new()),
        Arc::new(DefaultNodeResolver::new(settings.tool_name.as_str())),
    )
    .with_settings(settings)
}

/// Run the checkout phase and persist the resulting environment.
async fn cmd_checkout(bridge: &VcsBridge, session: &Session) -> Result<()> {
    let mut build = session.open()?;
    let outcome = bridge.checkout(&session.pipeline.checkout, &mut build).await;
    session.persist(build)?;

    let outcome = outcome.context("Checkout phase failed")?;
    match outcome.revisions {
        Some(revs) => info!(
            tool_revision = %revs.tool_revision,
            vcs_revision = %revs.vcs_revision,
            "checked out best match"
        ),
        None => info!("checked out requested revision"),
    }
    Ok(())
}

/// Run the build-setup phase and return the step environment.
fn cmd_setup(bridge: &VcsBridge, session: &Session) -> Result<EnvironmentMap> {
    let mut build = session.open()?;
    let vars = bridge.build_setup(&session.pipeline.setup, &mut build);
    session.persist(build)?;

    let vars = vars.context("Build setup phase failed")?;
    Ok(vars.into_iter().collect())
}

/// Run the post-build save phase.
async fn cmd_save(bridge: &VcsBridge, session: &Session, build_failed: bool) -> Result<()> {
    let mut build = session.open()?;
    if build_failed {
        build.mark_failed();
    }
    let outcome = bridge.post_build_save(&session.pipeline.save, &mut build).await;
    session.persist(build)?;

    match outcome.context("Post-build save phase failed")? {
        SaveOutcome::Saved(result) => info!(exit_code = result.exit_code, "workspace saved"),
        SaveOutcome::Skipped => info!("save skipped for failed build"),
    }
    Ok(())
}

fn cmd_reset(state_path: &Path) -> Result<()> {
    if state_path.exists() {
        std::fs::remove_file(state_path)
            .with_context(|| format!("Failed to remove {}", state_path.display()))?;
        info!(path = %state_path.display(), "build state discarded");
    }
    Ok(())
}

fn format_env(env: &EnvironmentMap, format: EnvFormat) -> Result<String> {
    match format {
        EnvFormat::Shell => Ok(env.iter().map(|(k, v)| format!("{k}={v}\n")).collect()),
        EnvFormat::Json => Ok(format!("{}\n", serde_json::to_string_pretty(env)?)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ibvc_core::fakes::ScriptedInvoker;
    use ibvc_core::{
        ExecutionNode, PhaseConfig, VCS_BEST_MATCH_TOOL_REV, VCS_CONFIG, VCS_TARGET_REV,
    };

    const ANNOUNCEMENT: &str = "Checking out IBVC revision r5 and SFVC revision abc";

    fn session(dir: &Path) -> Session {
        let pipeline = PipelineConfig {
            node: ExecutionNode::new("agent-1").with_install_path("/opt/ibvc"),
            checkout: PhaseConfig::new()
                .with_config_path("/repo/ibvc.config")
                .with_target_revision("HEAD"),
            ..PipelineConfig::default()
        };
        Session {
            pipeline,
            state_path: dir.join(".ibvc").join("build-env.json"),
            log: BuildLog::new(),
            interrupt: Interrupt::never(),
        }
    }

    fn scripted(invoker: &Arc<ScriptedInvoker>) -> VcsBridge {
        VcsBridge::new(invoker.clone(), Arc::new(DefaultNodeResolver::default()))
    }

    #[test]
    fn test_missing_state_is_fresh_build() {
        let dir = tempfile::tempdir().unwrap();
        let state = BuildState::load(&dir.path().join("none.json")).unwrap();
        assert_eq!(state, BuildState::default());
        assert_eq!(state.result, BuildResult::Success);
    }

    #[test]
    fn test_state_file_shape() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("state.json");
        let mut env = EnvironmentMap::new();
        env.publish(VCS_CONFIG, "/repo/cfg");
        BuildState {
            env,
            result: BuildResult::Failure,
        }
        .store(&path)
        .unwrap();

        let raw: serde_json::Value =
            serde_json::from_str(&std::fs::read_to_string(&path).unwrap()).unwrap();
        assert_eq!(raw["env"]["VCS_CONFIG"], "/repo/cfg");
        assert_eq!(raw["result"], "failure");
    }

    #[test]
    fn test_corrupt_state_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state.json");
        std::fs::write(&path, "not json").unwrap();
        let err = BuildState::load(&path).unwrap_err();
        assert!(err.to_string().contains("Failed to parse state file"));
    }

    #[tokio::test]
    async fn test_phases_share_state_file() {
        let dir = tempfile::tempdir().unwrap();
        let session = session(dir.path());
        let tool = Arc::new(ScriptedInvoker::succeeding(vec![ANNOUNCEMENT.to_string()]));
        let bridge = scripted(&tool);

        cmd_checkout(&bridge, &session).await.unwrap();
        let vars = cmd_setup(&bridge, &session).unwrap();
        assert_eq!(vars.get(VCS_CONFIG), Some("/repo/ibvc.config"));
        assert_eq!(vars.get(VCS_TARGET_REV), Some("HEAD"));
        assert_eq!(vars.get(VCS_BEST_MATCH_TOOL_REV), Some("r5"));

        cmd_save(&bridge, &session, false).await.unwrap();
        let calls = tool.calls();
        assert_eq!(calls.len(), 2);
        assert_eq!(calls[1].args()[1], "checkin");
        assert_eq!(calls[1].program(), "/opt/ibvc/IBVC");
    }

    #[tokio::test]
    async fn test_failed_checkout_persists_failure() {
        let dir = tempfile::tempdir().unwrap();
        let session = session(dir.path());
        let failing = Arc::new(ScriptedInvoker::exiting(1, vec![]));

        let err = cmd_checkout(&scripted(&failing), &session).await.unwrap_err();
        assert!(format!("{err:#}").contains("IBVC terminated with errors"));

        let state = BuildState::load(&session.state_path).unwrap();
        assert_eq!(state.result, BuildResult::Failure);
        assert!(state.env.is_empty());

        let saver = Arc::new(ScriptedInvoker::succeeding(vec![]));
        cmd_save(&scripted(&saver), &session, false).await.unwrap();
        assert!(saver.calls().is_empty());
    }

    #[tokio::test]
    async fn test_save_with_build_failed_flag_skips_tool() {
        let dir = tempfile::tempdir().unwrap();
        let session = session(dir.path());
        let tool = Arc::new(ScriptedInvoker::succeeding(vec![]));

        cmd_save(&scripted(&tool), &session, true).await.unwrap();
        assert!(tool.calls().is_empty());
        assert_eq!(
            BuildState::load(&session.state_path).unwrap().result,
            BuildResult::Failure
        );
    }

    #[test]
    fn test_reset_removes_state() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state.json");
        BuildState::default().store(&path).unwrap();
        cmd_reset(&path).unwrap();
        assert!(!path.exists());
        cmd_reset(&path).unwrap();
    }

    #[test]
    fn test_format_env() {
        let env: EnvironmentMap = [
            ("VCS_TARGET_REV".to_string(), "HEAD".to_string()),
            ("VCS_CONFIG".to_string(), "/repo/cfg".to_string()),
        ]
        .into_iter()
        .collect();

        assert_eq!(
            format_env(&env, EnvFormat::Shell).unwrap(),
            "VCS_CONFIG=/repo/cfg\nVCS_TARGET_REV=HEAD\n"
        );
        let json: serde_json::Value =
            serde_json::from_str(&format_env(&env, EnvFormat::Json).unwrap()).unwrap();
        assert_eq!(json["VCS_TARGET_REV"], "HEAD");
    }

    #[test]
    fn test_cli_parses_global_flags() {
        let cli = Cli::try_parse_from([
            "ibvc-bridge",
            "save",
            "--build-failed",
            "--state",
            "/tmp/state.json",
            "--verbose",
        ])
        .unwrap();
        assert!(cli.verbose);
        assert_eq!(cli.state, PathBuf::from("/tmp/state.json"));
        assert!(matches!(cli.command, Commands::Save { build_failed: true }));
    }
}
