//! Structured observability hooks for scope lifecycle events.
//!
//! This module provides:
//! - Scope-tagged tracing spans via the `ScopeSpan` RAII guard
//! - Emission functions for entry, commit, rollback, close and cleanup failures
//!
//! Lifecycle events are emitted at `debug!` level; cleanup failures and
//! abandoned scopes at `warn!`. Filter with `RUST_LOG=txscope=debug`.

use tracing::{debug, warn};

use crate::ambient::ScopeKey;
use crate::handle::{ConnectionId, ExecutionMode};
use crate::policy::{ResolutionMode, ScopeOutcome};

/// RAII guard that enters a span tagged with the scope key and mode.
pub struct ScopeSpan {
    _span: tracing::span::EnteredSpan,
}

impl ScopeSpan {
    pub fn enter(key: ScopeKey, mode: ExecutionMode) -> Self {
        Self {
            _span: span(key, mode).entered(),
        }
    }
}

/// Span for instrumenting a suspending scope.
pub fn span(key: ScopeKey, mode: ExecutionMode) -> tracing::Span {
    tracing::debug_span!("txscope.scope", scope = %key, mode = %mode)
}

/// Emit event: scope entered with its resolved role.
pub fn emit_scope_entered(mode: ResolutionMode, outcome: ScopeOutcome, conn: ConnectionId) {
    debug!(
        event = "scope.entered",
        resolution = %mode,
        role = outcome.role(),
        connection = %conn,
    );
}

/// Emit event: the owning scope committed its transaction.
pub fn emit_committed(conn: ConnectionId) {
    debug!(event = "scope.committed", connection = %conn);
}

/// Emit event: the owning scope rolled back its transaction.
pub fn emit_rolled_back(conn: ConnectionId) {
    debug!(event = "scope.rolled_back", connection = %conn);
}

/// Emit event: the owning scope released its connection.
pub fn emit_closed(conn: ConnectionId) {
    debug!(event = "scope.closed", connection = %conn);
}

/// Emit event: a call was rejected before reaching the database.
pub fn emit_contract_violation(mode: ResolutionMode, error: &dyn std::fmt::Display) {
    debug!(event = "scope.contract_violation", resolution = %mode, error = %error);
}

/// Emit event: a cleanup step failed while another error was propagating.
pub fn emit_cleanup_error(step: &str, error: &dyn std::fmt::Display) {
    warn!(event = "scope.cleanup_error", step = step, error = %error);
}

/// Emit event: a scope was torn down by a panic or by dropping its future.
pub fn emit_abandoned(conn: ConnectionId, outcome: ScopeOutcome) {
    warn!(event = "scope.abandoned", connection = %conn, role = outcome.role());
}
