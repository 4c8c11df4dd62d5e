//! Best-match revision negotiation.
//!
//! When the requested revision does not exist the tool checks out the
//! nearest one and announces it on a line ending in
//! `Checking out <tool> revision T and <vcs> revision V`. The negotiator
//! recovers `T` and `V` from the build log so later phases can see them.

use std::sync::OnceLock;

use regex::Regex;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::env::{EnvironmentMap, VCS_BEST_MATCH_TOOL_REV, VCS_BEST_MATCH_VCS_REV};
use crate::invoker::OutputSink;

/// Log lines scanned when the host configures nothing else.
pub const DEFAULT_NEGOTIATION_WINDOW: usize = 10_000;

/// Revisions the tool actually checked out. Both are always present.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NegotiatedRevisions {
    pub tool_revision: String,
    pub vcs_revision: String,
}

impl NegotiatedRevisions {
    pub fn new(tool_revision: impl Into<String>, vcs_revision: impl Into<String>) -> Self {
        Self {
            tool_revision: tool_revision.into(),
            vcs_revision: vcs_revision.into(),
        }
    }

    /// Read a previously published pair. `None` unless both keys are set.
    pub fn from_env(env: &EnvironmentMap) -> Option<Self> {
        let tool = env.get(VCS_BEST_MATCH_TOOL_REV).filter(|v| !v.is_empty())?;
        let vcs = env.get(VCS_BEST_MATCH_VCS_REV).filter(|v| !v.is_empty())?;
        Some(Self::new(tool, vcs))
    }

    /// Publish both keys, or neither.
    ///
    /// Returns `false` without writing if either key is already set, so a
    /// half-published pair can never appear.
    pub fn publish(&self, env: &mut EnvironmentMap) -> bool {
        if env.contains_key(VCS_BEST_MATCH_TOOL_REV) || env.contains_key(VCS_BEST_MATCH_VCS_REV) {
            debug!("best-match revisions already published, keeping first pair");
            return false;
        }
        env.publish(VCS_BEST_MATCH_TOOL_REV, self.tool_revision.clone());
        env.publish(VCS_BEST_MATCH_VCS_REV, self.vcs_revision.clone());
        true
    }
}

/// Scans tool output for the best-match announcement.
#[derive(Debug, Clone, Copy)]
pub struct RevisionNegotiator {
    max_lines: usize,
}

impl Default for RevisionNegotiator {
    fn default() -> Self {
        Self::new(DEFAULT_NEGOTIATION_WINDOW)
    }
}

impl RevisionNegotiator {
    pub fn new(max_lines: usize) -> Self {
        Self { max_lines }
    }

    pub fn max_lines(&self) -> usize {
        self.max_lines
    }

    /// Extract the first announcement within the last `max_lines` lines.
    ///
    /// Logs a confirmation line to `sink` on a hit. A miss is `None`, not
    /// an error.
    pub fn extract<S: AsRef<str>>(
        &self,
        log_lines: &[S],
        sink: &dyn OutputSink,
    ) -> Option<NegotiatedRevisions> {
        let revisions = extract(log_lines, self.max_lines)?;
        sink.write_line(&format!(
            "Will write {VCS_BEST_MATCH_VCS_REV}='{}' and {VCS_BEST_MATCH_TOOL_REV}='{}' to build environment",
            revisions.vcs_revision, revisions.tool_revision
        ));
        Some(revisions)
    }
}

/// Scan the last `max_lines` of `log_lines`, in log order, and return the
/// revisions from the earliest matching line.
pub fn extract<S: AsRef<str>>(log_lines: &[S], max_lines: usize) -> Option<NegotiatedRevisions> {
    let start = log_lines.len().saturating_sub(max_lines);
    log_lines[start..].iter().find_map(|line| parse_line(line.as_ref()))
}

/// Match a single line against the announcement pattern.
pub fn parse_line(line: &str) -> Option<NegotiatedRevisions> {
    let caps = announcement_pattern().captures(line)?;
    Some(NegotiatedRevisions::new(&caps["tool"], &caps["vcs"]))
}

fn announcement_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(r"^.*Checking out \S+ revision (?P<tool>[A-Za-z0-9_]+) and \S+ revision (?P<vcs>[A-Za-z0-9_]+)$")
            .expect("announcement pattern is valid")
    })
}
