//! In-memory fakes for the tool boundary (testing only).
//!
//! [`ScriptedInvoker`] satisfies the [`ToolInvoker`] contract without
//! spawning anything: it replays canned output into the sink and reports a
//! fixed exit code, recording every argument vector it was handed.

use std::sync::Mutex;

use async_trait::async_trait;

use crate::command::ArgumentVector;
use crate::error::{BridgeError, Result};
use crate::invoker::{Interrupt, InvocationResult, OutputSink, ToolInvoker};

#[derive(Debug, Clone)]
enum Script {
    Exit { output: Vec<String>, exit_code: i32 },
    LaunchFailure(String),
    /// Emit output, then block until interrupted.
    Hang { output: Vec<String> },
}

/// Tool invoker replaying a fixed script.
#[derive(Debug)]
pub struct ScriptedInvoker {
    script: Script,
    calls: Mutex<Vec<ArgumentVector>>,
}

impl ScriptedInvoker {
    fn with_script(script: Script) -> Self {
        Self {
            script,
            calls: Mutex::new(Vec::new()),
        }
    }

    /// Print `output` and exit 0.
    pub fn succeeding(output: Vec<String>) -> Self {
        Self::exiting(0, output)
    }

    /// Print `output` and exit with `exit_code`.
    pub fn exiting(exit_code: i32, output: Vec<String>) -> Self {
        Self::with_script(Script::Exit { output, exit_code })
    }

    /// Fail to start, as if the executable were missing.
    pub fn failing_to_launch(message: impl Into<String>) -> Self {
        Self::with_script(Script::LaunchFailure(message.into()))
    }

    /// Print `output`, then wait until the host interrupts.
    pub fn hanging(output: Vec<String>) -> Self {
        Self::with_script(Script::Hang { output })
    }

    /// Argument vectors received so far, in call order.
    pub fn calls(&self) -> Vec<ArgumentVector> {
        self.calls.lock().unwrap().clone()
    }
}

#[async_trait]
impl ToolInvoker for ScriptedInvoker {
    async fn invoke(
        &self,
        argv: &ArgumentVector,
        sink: &dyn OutputSink,
        interrupt: &Interrupt,
    ) -> Result<InvocationResult> {
        self.calls.lock().unwrap().push(argv.clone());

        match &self.script {
            Script::Exit { output, exit_code } => {
                for line in output {
                    sink.write_line(line);
                }
                Ok(InvocationResult::from_exit_code(*exit_code))
            }
            Script::LaunchFailure(message) => Err(BridgeError::LaunchFailure {
                program: argv.program().to_string(),
                source: std::io::Error::new(std::io::ErrorKind::NotFound, message.clone()),
            }),
            Script::Hang { output } => {
                for line in output {
                    sink.write_line(line);
                }
                let reason = interrupt.clone().triggered().await;
                Err(BridgeError::Interrupted(reason))
            }
        }
    }
}
