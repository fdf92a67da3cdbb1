//! Blocking scoped wrapper
//!
//! `ScopedEngine` wraps an `Engine` and hands out connections through
//! closures instead of context managers. Every entry point funnels into one
//! private routine that resolves, acquires, installs, runs the body and
//! cleans up, so the lifecycle rules live in exactly one place:
//!
//! - only the scope that opened a connection closes it
//! - only the scope that began a transaction commits or rolls it back
//! - the ambient cell is restored on every exit path, panics included
//!
//! # Example
//!
//! ```
//! use serde_json::json;
//! use txscope::{MemoryEngine, ScopeError, ScopedEngine, Statement};
//!
//! let db = ScopedEngine::new(MemoryEngine::new());
//! db.engine().create_table("users")?;
//!
//! db.atomic_scoped(|_conn| {
//!     db.execute_strict_atomic(&Statement::insert("users", json!({"name": "ada"})))?;
//!     Ok::<_, ScopeError>(())
//! })?;
//!
//! assert_eq!(db.engine().committed_count("users"), Some(1));
//! # Ok::<(), ScopeError>(())
//! ```

use std::fmt;
use std::sync::Arc;

use crate::ambient::{AmbientCell, ScopeKey};
use crate::engine::{Connection, Engine};
use crate::error::{EngineResult, ScopeError, ScopeResult};
use crate::handle::{Conn, ConnectionArg, ExecutionMode};
use crate::obs::{self, ScopeSpan};
use crate::policy::{resolve, settle, Finish, Resolution, ResolutionMode, ScopeOutcome};

type ConnOf<E> = Conn<<E as Engine>::Connection>;
type StatementOf<E> = <<E as Engine>::Connection as Connection>::Statement;
type OutputOf<E> = <<E as Engine>::Connection as Connection>::Output;

/// Blocking engine with ambient connection scoping.
///
/// Clones share the engine and the ambient slot, so a scope opened through
/// one clone is visible to calls made through another on the same thread.
pub struct ScopedEngine<E: Engine> {
    engine: Arc<E>,
    cell: AmbientCell<ConnOf<E>>,
}

impl<E: Engine> ScopedEngine<E> {
    pub fn new(engine: E) -> Self {
        Self::from_arc(Arc::new(engine))
    }

    pub fn from_arc(engine: Arc<E>) -> Self {
        Self {
            engine,
            cell: AmbientCell::new(ScopeKey::new()),
        }
    }

    pub fn engine(&self) -> &E {
        &self.engine
    }

    pub fn key(&self) -> ScopeKey {
        self.cell.key()
    }

    /// Connection installed by the innermost active scope on this thread.
    pub fn ambient(&self) -> Option<ConnOf<E>> {
        self.cell.get()
    }

    /// Open a connection outside any scope. The caller owns it.
    pub fn open_connection(&self) -> ScopeResult<ConnOf<E>> {
        Ok(Conn::new(self.engine.connect()?))
    }

    fn open_transaction(&self) -> ScopeResult<ConnOf<E>> {
        let conn = self.open_connection()?;
        if let Err(err) = conn.begin() {
            if let Err(close_err) = conn.close() {
                obs::emit_cleanup_error("close", &close_err);
            }
            return Err(err.into());
        }
        Ok(conn)
    }

    // -----------------------------------------------------------------------
    // Scopes
    // -----------------------------------------------------------------------

    /// Run `f` on the ambient connection, or on a fresh plain connection that
    /// is closed afterwards. No transaction is started or finished.
    pub fn connect_scoped<T, Err, F>(&self, f: F) -> Result<T, Err>
    where
        F: FnOnce(&ConnOf<E>) -> Result<T, Err>,
        Err: From<ScopeError>,
    {
        self.scoped(ResolutionMode::Loose, None, f)
    }

    /// Run `f` inside a transaction.
    ///
    /// Nested atomic scopes reuse the outermost transaction; only the
    /// outermost scope commits (on `Ok`) or rolls back (on `Err` or panic).
    /// Fails with `AtomicInsideNonAtomic` if the ambient connection is not in
    /// a transaction.
    pub fn atomic_scoped<T, Err, F>(&self, f: F) -> Result<T, Err>
    where
        F: FnOnce(&ConnOf<E>) -> Result<T, Err>,
        Err: From<ScopeError>,
    {
        self.scoped(ResolutionMode::Atomic, None, f)
    }

    /// Run `f` on the given connection, or resolve one like `connect_scoped`.
    ///
    /// A given connection is used as-is and never closed by this call.
    pub fn connect<T, Err, F>(
        &self,
        conn: impl Into<ConnectionArg<E::Connection>>,
        f: F,
    ) -> Result<T, Err>
    where
        F: FnOnce(&ConnOf<E>) -> Result<T, Err>,
        Err: From<ScopeError>,
    {
        let explicit = self.blocking_arg(conn.into(), ResolutionMode::Loose)?;
        self.scoped(ResolutionMode::Loose, explicit.as_ref(), f)
    }

    /// Run `f` inside a transaction on the given connection, or resolve one
    /// like `atomic_scoped`.
    ///
    /// A given connection already in a transaction is reused. A given
    /// connection without one gets a transaction begun on it, which this call
    /// commits or rolls back; the connection itself stays open.
    pub fn transact<T, Err, F>(
        &self,
        conn: impl Into<ConnectionArg<E::Connection>>,
        f: F,
    ) -> Result<T, Err>
    where
        F: FnOnce(&ConnOf<E>) -> Result<T, Err>,
        Err: From<ScopeError>,
    {
        let explicit = self.blocking_arg(conn.into(), ResolutionMode::Transact)?;
        self.scoped(ResolutionMode::Transact, explicit.as_ref(), f)
    }

    // -----------------------------------------------------------------------
    // One-statement calls
    // -----------------------------------------------------------------------

    /// Execute on `conn` if given (caller-managed), else on the ambient
    /// connection, else on a fresh connection opened and closed for this
    /// statement alone.
    pub fn execute_loose(
        &self,
        conn: Option<&ConnOf<E>>,
        statement: &StatementOf<E>,
    ) -> ScopeResult<OutputOf<E>> {
        match conn {
            Some(conn) => Ok(conn.execute(statement)?),
            None => self.scoped(ResolutionMode::Loose, None, |conn| {
                conn.execute(statement).map_err(ScopeError::from)
            }),
        }
    }

    /// Execute inside the ambient transaction.
    ///
    /// Fails with `NoAmbientAtomicContext` outside any scope and with
    /// `NotInTransaction` if the ambient transaction was already ended.
    pub fn execute_strict_atomic(&self, statement: &StatementOf<E>) -> ScopeResult<OutputOf<E>> {
        self.scoped(ResolutionMode::StrictAtomic, None, |conn| {
            conn.execute(statement).map_err(ScopeError::from)
        })
    }

    /// Execute on `conn`, else on the ambient connection; either must
    /// already be in a transaction. With neither, run a one-shot transaction.
    pub fn execute_strict_transactional(
        &self,
        conn: Option<&ConnOf<E>>,
        statement: &StatementOf<E>,
    ) -> ScopeResult<OutputOf<E>> {
        self.scoped(ResolutionMode::StrictTransactional, conn, |conn| {
            conn.execute(statement).map_err(ScopeError::from)
        })
    }

    /// Execute in the ambient transaction if there is one, else in a
    /// one-shot transaction.
    pub fn execute_atomic(&self, statement: &StatementOf<E>) -> ScopeResult<OutputOf<E>> {
        self.execute_strict_transactional(None, statement)
    }

    // -----------------------------------------------------------------------
    // Internals
    // -----------------------------------------------------------------------

    fn blocking_arg(
        &self,
        arg: ConnectionArg<E::Connection>,
        mode: ResolutionMode,
    ) -> ScopeResult<Option<ConnOf<E>>> {
        match arg {
            ConnectionArg::Absent => Ok(None),
            ConnectionArg::Blocking(conn) => Ok(Some(conn)),
            ConnectionArg::Suspending(_) => {
                let err = ScopeError::CrossModeConnection {
                    expected: ExecutionMode::Blocking,
                    found: ExecutionMode::Suspending,
                };
                obs::emit_contract_violation(mode, &err);
                Err(err)
            }
        }
    }

    fn acquire(
        &self,
        mode: ResolutionMode,
        explicit: Option<&ConnOf<E>>,
        ambient: Option<&ConnOf<E>>,
    ) -> ScopeResult<(ConnOf<E>, ScopeOutcome)> {
        let resolution = resolve(mode, explicit.map(Conn::probe), ambient.map(Conn::probe))
            .inspect_err(|err| obs::emit_contract_violation(mode, err))?;

        let candidate = explicit.or(ambient).cloned();
        let conn = match (resolution, candidate) {
            (Resolution::Reuse(_), Some(conn)) => conn,
            (Resolution::BeginOn(_), Some(conn)) => {
                conn.begin()?;
                conn
            }
            (Resolution::OpenConnection, _) => self.open_connection()?,
            (Resolution::OpenTransaction, _) => self.open_transaction()?,
            (Resolution::Reuse(_) | Resolution::BeginOn(_), None) => {
                unreachable!("resolve only reuses a present connection")
            }
        };
        Ok((conn, resolution.outcome()))
    }

    fn scoped<T, Err, F>(
        &self,
        mode: ResolutionMode,
        explicit: Option<&ConnOf<E>>,
        f: F,
    ) -> Result<T, Err>
    where
        F: FnOnce(&ConnOf<E>) -> Result<T, Err>,
        Err: From<ScopeError>,
    {
        let _span = ScopeSpan::enter(self.key(), ExecutionMode::Blocking);
        let ambient = self.cell.get();
        let (conn, outcome) = self.acquire(mode, explicit, ambient.as_ref())?;
        obs::emit_scope_entered(mode, outcome, conn.id());

        // Declared before the guard so the cell is restored after cleanup.
        let _token = match &ambient {
            Some(current) if current.same_as(&conn) => None,
            _ => Some(self.cell.set(Some(conn.clone()))),
        };
        let mut guard = AbandonGuard::new(conn.clone(), outcome);

        let result = f(&conn);
        let result = exit(&conn, outcome, result);
        guard.disarm();
        result
    }
}

impl<E: Engine> Clone for ScopedEngine<E> {
    fn clone(&self) -> Self {
        Self {
            engine: Arc::clone(&self.engine),
            cell: AmbientCell::new(self.cell.key()),
        }
    }
}

impl<E: Engine> fmt::Debug for ScopedEngine<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ScopedEngine").field("key", &self.key()).finish()
    }
}

/// Run the owner's exit steps and fold them into the body's result.
fn exit<C: Connection, T, Err>(
    conn: &Conn<C>,
    outcome: ScopeOutcome,
    result: Result<T, Err>,
) -> Result<T, Err>
where
    Err: From<ScopeError>,
{
    let in_transaction = outcome.owns_transaction && conn.in_transaction();
    let plan = outcome.exit_plan(result.is_ok(), in_transaction);

    let finish = match plan.finish {
        Some(Finish::Commit) => commit(conn),
        Some(Finish::Rollback) => conn.rollback().map(|()| obs::emit_rolled_back(conn.id())),
        None => Ok(()),
    };
    let close = if plan.close {
        conn.close().map(|()| obs::emit_closed(conn.id()))
    } else {
        Ok(())
    };
    settle(result, finish, close)
}

fn commit<C: Connection>(conn: &Conn<C>) -> EngineResult<()> {
    match conn.commit() {
        Ok(()) => {
            obs::emit_committed(conn.id());
            Ok(())
        }
        Err(err) => {
            if conn.in_transaction() {
                if let Err(rollback_err) = conn.rollback() {
                    obs::emit_cleanup_error("rollback", &rollback_err);
                }
            }
            Err(err)
        }
    }
}

/// Rolls back and closes on behalf of an owner whose body panicked.
struct AbandonGuard<C: Connection> {
    conn: Conn<C>,
    outcome: ScopeOutcome,
    armed: bool,
}

impl<C: Connection> AbandonGuard<C> {
    fn new(conn: Conn<C>, outcome: ScopeOutcome) -> Self {
        Self {
            conn,
            outcome,
            armed: outcome.is_owner(),
        }
    }

    fn disarm(&mut self) {
        self.armed = false;
    }
}

impl<C: Connection> Drop for AbandonGuard<C> {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        let outcome = self.outcome;
        obs::emit_abandoned(self.conn.id(), outcome);
        self.conn.with_connection(|conn| {
            if outcome.owns_transaction && conn.in_transaction() {
                if let Err(err) = conn.rollback() {
                    obs::emit_cleanup_error("rollback", &err);
                }
            }
            if outcome.owns_connection {
                if let Err(err) = conn.close() {
                    obs::emit_cleanup_error("close", &err);
                }
            }
        });
    }
}
