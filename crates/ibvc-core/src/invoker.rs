//! Launching the tool and streaming its output into the build log.
//!
//! Defines the [`ToolInvoker`] async trait and the subprocess-backed
//! [`ProcessInvoker`], plus the build log sink and host interrupt signal the
//! invoker works against.

use std::collections::VecDeque;
use std::io::Write;
use std::process::Stdio;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncBufRead, AsyncBufReadExt, BufReader};
use tokio::process::Command;
use tokio::sync::watch;
use tracing::{debug, warn};

use crate::command::ArgumentVector;
use crate::error::{BridgeError, Result};
use crate::negotiate::DEFAULT_NEGOTIATION_WINDOW;

// ---------------------------------------------------------------------------
// Output sink
// ---------------------------------------------------------------------------

/// Line-oriented destination for user-visible build output.
pub trait OutputSink: Send + Sync {
    fn write_line(&self, line: &str);
}

/// The build's log: recent lines are kept for scanning and every line is
/// optionally echoed to a writer (console, log file) as it arrives.
///
/// Only the last `capacity` lines are retained, defaulting to the
/// negotiation window; the tee writer is where the full log lives. Clones
/// share the same log.
#[derive(Clone)]
pub struct BuildLog {
    lines: Arc<Mutex<VecDeque<String>>>,
    capacity: usize,
    tee: Arc<Mutex<Option<Box<dyn Write + Send>>>>,
}

impl Default for BuildLog {
    fn default() -> Self {
        Self {
            lines: Arc::default(),
            capacity: DEFAULT_NEGOTIATION_WINDOW,
            tee: Arc::default(),
        }
    }
}

impl BuildLog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Echo every line to `writer` as well.
    pub fn with_tee(writer: Box<dyn Write + Send>) -> Self {
        Self {
            tee: Arc::new(Mutex::new(Some(writer))),
            ..Self::default()
        }
    }

    /// Retain at most `capacity` lines.
    pub fn with_capacity(mut self, capacity: usize) -> Self {
        self.capacity = capacity;
        self
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Retained lines, oldest first.
    pub fn lines(&self) -> Vec<String> {
        lock(&self.lines).iter().cloned().collect()
    }

    /// The last `max_lines` retained lines, oldest first.
    pub fn tail(&self, max_lines: usize) -> Vec<String> {
        let lines = lock(&self.lines);
        let start = lines.len().saturating_sub(max_lines);
        lines.range(start..).cloned().collect()
    }

    pub fn len(&self) -> usize {
        lock(&self.lines).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl OutputSink for BuildLog {
    fn write_line(&self, line: &str) {
        {
            let mut lines = lock(&self.lines);
            lines.push_back(line.to_string());
            while lines.len() > self.capacity {
                lines.pop_front();
            }
        }

        let mut tee = lock(&self.tee);
        if let Some(writer) = tee.as_mut() {
            if let Err(e) = writeln!(writer, "{line}").and_then(|_| writer.flush()) {
                warn!(error = %e, "failed to echo build log line");
            }
        }
    }
}

/// A panic while holding the log leaves it usable; lines are plain data.
fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

impl std::fmt::Debug for BuildLog {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BuildLog").field("lines", &self.len()).finish()
    }
}

// ---------------------------------------------------------------------------
// Host interruption
// ---------------------------------------------------------------------------

/// Host side of an interrupt signal.
#[derive(Debug)]
pub struct InterruptHandle {
    tx: watch::Sender<Option<String>>,
}

impl InterruptHandle {
    /// Interrupt whoever is waiting on the paired [`Interrupt`].
    pub fn interrupt(&self, reason: impl Into<String>) {
        self.tx.send_replace(Some(reason.into()));
    }
}

/// Phase side of an interrupt signal.
#[derive(Debug, Clone)]
pub struct Interrupt {
    rx: watch::Receiver<Option<String>>,
}

/// Create a connected interrupt handle and signal.
pub fn interrupt_channel() -> (InterruptHandle, Interrupt) {
    let (tx, rx) = watch::channel(None);
    (InterruptHandle { tx }, Interrupt { rx })
}

impl Interrupt {
    /// A signal that never fires.
    pub fn never() -> Self {
        interrupt_channel().1
    }

    pub fn is_triggered(&self) -> bool {
        self.rx.borrow().is_some()
    }

    /// Resolve with the interrupt reason once the host interrupts.
    ///
    /// Pends forever if the handle is dropped without interrupting.
    pub async fn triggered(&mut self) -> String {
        loop {
            if let Some(reason) = self.rx.borrow_and_update().clone() {
                return reason;
            }
            if self.rx.changed().await.is_err() {
                std::future::pending::<()>().await;
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Invocation
// ---------------------------------------------------------------------------

/// Outcome of one tool run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct InvocationResult {
    pub exit_code: i32,
    pub succeeded: bool,
}

impl InvocationResult {
    /// Exit code 0 succeeds; any other code fails, uninterpreted.
    pub fn from_exit_code(exit_code: i32) -> Self {
        Self {
            exit_code,
            succeeded: exit_code == 0,
        }
    }
}

/// Runs the tool for a phase.
#[async_trait]
pub trait ToolInvoker: Send + Sync {
    /// Run `argv` to completion, streaming output into `sink`.
    ///
    /// Returns `Err` when the process cannot be launched or the wait is
    /// interrupted. A non-zero exit is an `Ok` with `succeeded == false`.
    async fn invoke(
        &self,
        argv: &ArgumentVector,
        sink: &dyn OutputSink,
        interrupt: &Interrupt,
    ) -> Result<InvocationResult>;
}

/// [`ToolInvoker`] that spawns the tool as a child process.
///
/// stdout and stderr lines are written to the sink as they arrive, with
/// bytes that are not UTF-8 replaced rather than dropped. An interrupt
/// stops the wait but leaves the child running.
#[derive(Debug, Clone, Default)]
pub struct ProcessInvoker;

impl ProcessInvoker {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl ToolInvoker for ProcessInvoker {
    async fn invoke(
        &self,
        argv: &ArgumentVector,
        sink: &dyn OutputSink,
        interrupt: &Interrupt,
    ) -> Result<InvocationResult> {
        let program = argv.program();
        debug!(program = %program, args = ?argv.args(), "launching tool");

        let mut child = Command::new(program)
            .args(argv.args())
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|source| BridgeError::LaunchFailure {
                program: program.to_string(),
                source,
            })?;

        let stdout = child.stdout.take().ok_or_else(|| {
            BridgeError::Io(std::io::Error::other("child stdout was not captured"))
        })?;
        let stderr = child.stderr.take().ok_or_else(|| {
            BridgeError::Io(std::io::Error::other("child stderr was not captured"))
        })?;

        let mut stdout = Some(BufReader::new(stdout));
        let mut stderr = Some(BufReader::new(stderr));
        let mut stdout_buf = Vec::new();
        let mut stderr_buf = Vec::new();
        let mut interrupt = interrupt.clone();

        let status = loop {
            tokio::select! {
                read = read_chunk(&mut stdout, &mut stdout_buf), if stdout.is_some() => {
                    forward_chunk(read, &mut stdout, &mut stdout_buf, sink, "stdout");
                }
                read = read_chunk(&mut stderr, &mut stderr_buf), if stderr.is_some() => {
                    forward_chunk(read, &mut stderr, &mut stderr_buf, sink, "stderr");
                }
                status = child.wait(), if stdout.is_none() && stderr.is_none() => break status?,
                reason = interrupt.triggered() => {
                    warn!(program = %program, reason = %reason, "interrupted while waiting for tool");
                    return Err(BridgeError::Interrupted(reason));
                }
            }
        };

        // Killed by a signal: no exit code.
        let exit_code = status.code().unwrap_or(-1);
        debug!(program = %program, exit_code, "tool exited");
        Ok(InvocationResult::from_exit_code(exit_code))
    }
}

/// Read up to and including the next newline into `buf`.
///
/// Partial reads stay in `buf` if the future is dropped, so the next call
/// picks up where this one stopped.
async fn read_chunk<R>(reader: &mut Option<R>, buf: &mut Vec<u8>) -> std::io::Result<usize>
where
    R: AsyncBufRead + Unpin,
{
    match reader {
        Some(reader) => reader.read_until(b'\n', buf).await,
        None => std::future::pending().await,
    }
}

/// Write a completed chunk to the sink, or close the pipe on EOF or error.
///
/// Closing drops the read end, so a tool still writing to it gets EPIPE
/// instead of blocking on a full pipe.
fn forward_chunk<R>(
    read: std::io::Result<usize>,
    reader: &mut Option<R>,
    buf: &mut Vec<u8>,
    sink: &dyn OutputSink,
    stream: &str,
) {
    match read {
        Ok(0) => *reader = None,
        Ok(_) => sink.write_line(&decode_line(buf)),
        Err(e) => {
            warn!(stream, error = %e, "stopped reading tool output");
            if !buf.is_empty() {
                sink.write_line(&decode_line(buf));
            }
            *reader = None;
        }
    }
    buf.clear();
}

/// Decode one raw output line. Bytes that are not UTF-8 become U+FFFD.
fn decode_line(raw: &[u8]) -> String {
    let line = raw.strip_suffix(b"\n").unwrap_or(raw);
    let line = line.strip_suffix(b"\r").unwrap_or(line);
    String::from_utf8_lossy(line).into_owned()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_decode_line_tolerates_invalid_utf8() {
        assert_eq!(decode_line(b"plain\n"), "plain");
        assert_eq!(decode_line(b"crlf\r\n"), "crlf");
        assert_eq!(decode_line(b"no newline"), "no newline");
        assert_eq!(decode_line(b"caf\xe9\n"), "caf\u{FFFD}");
    }

    #[test]
    fn test_forward_chunk_closes_pipe_on_error() {
        let log = BuildLog::new();
        let mut reader = Some(());
        let mut buf = b"partial".to_vec();
        forward_chunk(
            Err(std::io::Error::other("broken")),
            &mut reader,
            &mut buf,
            &log,
            "stdout",
        );
        assert!(reader.is_none());
        assert!(buf.is_empty());
        assert_eq!(log.lines(), vec!["partial"]);
    }

    #[test]
    fn test_exit_code_mapping() {
        assert!(InvocationResult::from_exit_code(0).succeeded);
        for code in [1, 127, -1] {
            let result = InvocationResult::from_exit_code(code);
            assert!(!result.succeeded, "exit code {code} should fail");
            assert_eq!(result.exit_code, code);
        }
    }

    #[test]
    fn test_build_log_tail_keeps_order() {
        let log = BuildLog::new();
        for i in 0..5 {
            log.write_line(&format!("line {i}"));
        }
        assert_eq!(log.tail(2), vec!["line 3", "line 4"]);
        assert_eq!(log.tail(100).len(), 5);
        assert!(log.tail(0).is_empty());
    }

    #[test]
    fn test_build_log_retains_only_capacity() {
        let log = BuildLog::new().with_capacity(3);
        for i in 0..10 {
            log.write_line(&format!("line {i}"));
        }
        assert_eq!(log.len(), 3);
        assert_eq!(log.lines(), vec!["line 7", "line 8", "line 9"]);
        assert_eq!(log.tail(2), vec!["line 8", "line 9"]);
        assert_eq!(BuildLog::new().capacity(), DEFAULT_NEGOTIATION_WINDOW);
    }

    #[test]
    fn test_build_log_survives_poisoned_lock() {
        let log = BuildLog::new();
        log.write_line("before");
        let poisoner = log.clone();
        let _ = std::thread::spawn(move || {
            let _guard = poisoner.lines.lock().unwrap();
            panic!("poison the log");
        })
        .join();

        log.write_line("after");
        assert_eq!(log.lines(), vec!["before", "after"]);
    }

    #[test]
    fn test_build_log_clones_share_lines() {
        let log = BuildLog::new();
        let other = log.clone();
        other.write_line("from clone");
        assert_eq!(log.lines(), vec!["from clone"]);
    }

    #[test]
    fn test_build_log_tee_receives_lines() {
        #[derive(Clone, Default)]
        struct Shared(Arc<Mutex<Vec<u8>>>);
        impl Write for Shared {
            fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
                self.0.lock().unwrap().extend_from_slice(buf);
                Ok(buf.len())
            }
            fn flush(&mut self) -> std::io::Result<()> {
                Ok(())
            }
        }

        let buf = Shared::default();
        let log = BuildLog::with_tee(Box::new(buf.clone()));
        log.write_line("hello");
        log.write_line("world");
        assert_eq!(
            String::from_utf8(buf.0.lock().unwrap().clone()).unwrap(),
            "hello\nworld\n"
        );
    }

    #[tokio::test]
    async fn test_interrupt_fires_with_reason() {
        let (handle, mut interrupt) = interrupt_channel();
        assert!(!interrupt.is_triggered());
        handle.interrupt("build aborted");
        assert!(interrupt.is_triggered());
        assert_eq!(interrupt.triggered().await, "build aborted");
    }

    #[tokio::test(start_paused = true)]
    async fn test_never_interrupt_stays_pending() {
        let mut interrupt = Interrupt::never();
        let waited = tokio::time::timeout(
            std::time::Duration::from_secs(5),
            interrupt.triggered(),
        )
        .await;
        assert!(waited.is_err());
    }
}
