//! Engine capability traits
//!
//! The scoping layer never talks SQL itself. It drives an underlying client
//! library through one of two capability sets:
//! - `Engine` / `Connection`: blocking I/O, one OS thread per call chain
//! - `AsyncEngine` / `AsyncConnection`: suspending I/O, one task per call chain
//!
//! Both sets expose the same operations (open, close, begin, commit,
//! rollback, execute, in_transaction). The resolution policy is written once
//! against `policy::Probe` values and shared by both.

use async_trait::async_trait;

use crate::error::EngineResult;

// ---------------------------------------------------------------------------
// Blocking capability set
// ---------------------------------------------------------------------------

/// A live, blocking database connection.
///
/// Guarantees expected by the scoping layer:
/// - `in_transaction()` reflects engine state, including transactions ended
///   by user code through `commit`/`rollback`.
/// - `commit`/`rollback` end the current transaction.
/// - `close` discards any unfinished transaction.
pub trait Connection: Send + 'static {
    /// Statement type accepted by `execute`.
    type Statement: ?Sized;
    /// Result of executing a statement.
    type Output;

    /// Start a transaction. Fails if one is already active.
    fn begin(&mut self) -> EngineResult<()>;

    /// Commit the active transaction.
    fn commit(&mut self) -> EngineResult<()>;

    /// Roll back the active transaction.
    fn rollback(&mut self) -> EngineResult<()>;

    /// Execute a single statement.
    fn execute(&mut self, statement: &Self::Statement) -> EngineResult<Self::Output>;

    /// Whether the connection is inside an active transaction.
    fn in_transaction(&self) -> bool;

    /// Release the connection. Further calls fail with `EngineError::Closed`.
    fn close(&mut self) -> EngineResult<()>;
}

/// Source of blocking connections.
pub trait Engine: Send + Sync + 'static {
    type Connection: Connection;

    /// Open a new connection.
    fn connect(&self) -> EngineResult<Self::Connection>;
}

// ---------------------------------------------------------------------------
// Suspending capability set
// ---------------------------------------------------------------------------

/// A live, suspending database connection.
///
/// Same guarantees as `Connection`; every I/O operation is a suspension point.
#[async_trait]
pub trait AsyncConnection: Send + 'static {
    type Statement: ?Sized + Sync;
    type Output: Send;

    async fn begin(&mut self) -> EngineResult<()>;

    async fn commit(&mut self) -> EngineResult<()>;

    async fn rollback(&mut self) -> EngineResult<()>;

    async fn execute(&mut self, statement: &Self::Statement) -> EngineResult<Self::Output>;

    fn in_transaction(&self) -> bool;

    async fn close(&mut self) -> EngineResult<()>;

    /// Abandon the active transaction without suspending.
    ///
    /// Called when a scope future is dropped before it could await a proper
    /// rollback. Implementations may discard local state immediately or queue
    /// the rollback for the next round trip.
    fn start_rollback(&mut self);
}

/// Source of suspending connections.
#[async_trait]
pub trait AsyncEngine: Send + Sync + 'static {
    type Connection: AsyncConnection;

    async fn connect(&self) -> EngineResult<Self::Connection>;
}
