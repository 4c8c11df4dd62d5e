//! Structured lifecycle events for pipeline phases.
//!
//! Phase work runs inside a [`PhaseSpan`]; the `emit_*` functions record
//! the milestones at `info!` (failures at `warn!`). Filter with `RUST_LOG`.

use tracing::{info, warn};

use crate::command::Operation;

/// Span tagging everything logged during one phase.
///
/// Async phase bodies attach it with `tracing::Instrument`; synchronous
/// ones enter it through [`PhaseSpan`].
pub fn phase_span(phase: &str) -> tracing::Span {
    tracing::info_span!("ibvc.phase", phase = %phase)
}

/// RAII guard that enters a phase-scoped span for the duration of a phase.
pub struct PhaseSpan {
    _span: tracing::span::EnteredSpan,
}

impl PhaseSpan {
    /// Create and enter a span tagged with the phase name.
    pub fn enter(phase: &str) -> Self {
        Self {
            _span: phase_span(phase).entered(),
        }
    }
}

pub fn emit_phase_started(phase: &str) {
    info!(event = "phase.started", phase = %phase);
}

pub fn emit_tool_invoked(operation: Operation, program: &str, arg_count: usize) {
    info!(
        event = "tool.invoked",
        operation = %operation,
        program = %program,
        arg_count = arg_count,
    );
}

/// The exit code is diagnostic only; it never changes behaviour.
pub fn emit_tool_exited(operation: Operation, exit_code: i32, succeeded: bool) {
    if succeeded {
        info!(event = "tool.exited", operation = %operation, exit_code = exit_code);
    } else {
        warn!(event = "tool.exited", operation = %operation, exit_code = exit_code, succeeded = false);
    }
}

pub fn emit_revisions_published(tool_revision: &str, vcs_revision: &str) {
    info!(
        event = "revisions.published",
        tool_revision = %tool_revision,
        vcs_revision = %vcs_revision,
    );
}

pub fn emit_negotiation_miss(window: usize) {
    info!(event = "revisions.not_found", window = window);
}

pub fn emit_phase_finished(phase: &str, success: bool) {
    info!(event = "phase.finished", phase = %phase, success = success);
}

pub fn emit_phase_error(phase: &str, error: &dyn std::fmt::Display) {
    warn!(event = "phase.error", phase = %phase, error = %error);
}
