//! Error types for txscope

use thiserror::Error;

use crate::handle::ExecutionMode;

/// Errors reported by an underlying engine through the capability traits.
///
/// Engines map their native errors into these variants; the scoping layer
/// passes them through to the caller untouched.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum EngineError {
    /// Opening or talking to the connection failed
    #[error("Database connection failed: {0}")]
    Connection(String),

    /// Statement execution failed
    #[error("Database query failed: {0}")]
    Query(String),

    /// Begin/commit/rollback failed
    #[error("Transaction failed: {0}")]
    Transaction(String),

    /// The connection was already closed
    #[error("connection is closed")]
    Closed,
}

/// Errors surfaced by the scoped wrappers.
#[derive(Error, Debug)]
pub enum ScopeError {
    /// A strict-atomic execute was issued with nothing ambient.
    #[error("must be called within an atomic scope")]
    NoAmbientAtomicContext,

    /// A transactional call resolved to a connection with no active transaction.
    #[error("requires the connection to be in an active transaction")]
    NotInTransaction,

    /// An atomic scope was requested on top of an ambient connection that is
    /// not inside a transaction.
    #[error(
        "cannot start an atomic scope inside a non-atomic scope without an active transaction"
    )]
    AtomicInsideNonAtomic,

    /// A handle of the other execution mode was supplied.
    #[error("a {found} connection was provided to a {expected} call path")]
    CrossModeConnection {
        expected: ExecutionMode,
        found: ExecutionMode,
    },

    /// The configured engine is not one this layer knows how to open.
    #[error("unsupported engine type: {scheme}")]
    UnsupportedEngine { scheme: String },

    /// Malformed configuration
    #[error("invalid configuration: {0}")]
    Config(String),

    /// Engine failure, passed through unmodified
    #[error(transparent)]
    Engine(#[from] EngineError),
}

impl ScopeError {
    /// Contract violations are programming errors raised before any
    /// statement reaches the database. They are never worth retrying.
    pub fn is_contract_violation(&self) -> bool {
        matches!(
            self,
            ScopeError::NoAmbientAtomicContext
                | ScopeError::NotInTransaction
                | ScopeError::AtomicInsideNonAtomic
                | ScopeError::CrossModeConnection { .. }
                | ScopeError::UnsupportedEngine { .. }
        )
    }

    /// The engine error, if this is a pass-through.
    pub fn engine_error(&self) -> Option<&EngineError> {
        match self {
            ScopeError::Engine(err) => Some(err),
            _ => None,
        }
    }
}

/// Result type for engine capability calls
pub type EngineResult<T> = std::result::Result<T, EngineError>;

/// Result type for scoped wrapper calls
pub type ScopeResult<T> = std::result::Result<T, ScopeError>;
