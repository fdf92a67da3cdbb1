//! Suspending scoped wrapper
//!
//! `AsyncScopedEngine` is the task-local twin of `ScopedEngine`. Scope bodies
//! are closures returning a future; they receive an owned `AsyncConn` handle
//! so the future can hold it across awaits.
//!
//! Connect, begin, execute, commit, rollback and close are all suspension
//! points. If the scope future is dropped mid-flight (task aborted, timeout
//! elapsed, `select!` branch lost), the owner's transaction is abandoned via
//! `AsyncConnection::start_rollback`, an owned connection is closed on a
//! spawned task, and the task-local cell unwinds to its previous value.

use std::fmt;
use std::future::Future;
use std::sync::Arc;

use tracing::Instrument;

use crate::ambient::{ScopeKey, TaskCell};
use crate::engine::{AsyncConnection, AsyncEngine};
use crate::error::{EngineResult, ScopeError, ScopeResult};
use crate::handle::{AsyncConn, ConnectionArg, ExecutionMode};
use crate::obs;
use crate::policy::{resolve, settle, Finish, Resolution, ResolutionMode, ScopeOutcome};

type ConnOf<E> = AsyncConn<<E as AsyncEngine>::Connection>;
type StatementOf<E> = <<E as AsyncEngine>::Connection as AsyncConnection>::Statement;
type OutputOf<E> = <<E as AsyncEngine>::Connection as AsyncConnection>::Output;

/// Suspending engine with ambient connection scoping.
///
/// Each tokio task sees its own ambient slot; a task spawned from inside a
/// scope starts with nothing ambient.
pub struct AsyncScopedEngine<E: AsyncEngine> {
    engine: Arc<E>,
    cell: TaskCell<ConnOf<E>>,
}

impl<E: AsyncEngine> AsyncScopedEngine<E> {
    pub fn new(engine: E) -> Self {
        Self::from_arc(Arc::new(engine))
    }

    pub fn from_arc(engine: Arc<E>) -> Self {
        Self {
            engine,
            cell: TaskCell::new(ScopeKey::new()),
        }
    }

    pub fn engine(&self) -> &E {
        &self.engine
    }

    pub fn key(&self) -> ScopeKey {
        self.cell.key()
    }

    /// Connection installed by the innermost active scope in this task.
    pub fn ambient(&self) -> Option<ConnOf<E>> {
        self.cell.get()
    }

    /// Open a connection outside any scope. The caller owns it.
    pub async fn open_connection(&self) -> ScopeResult<ConnOf<E>> {
        Ok(AsyncConn::new(self.engine.connect().await?))
    }

    async fn open_transaction(&self) -> ScopeResult<ConnOf<E>> {
        let conn = self.open_connection().await?;
        // closes the connection if this future is dropped before `begin` lands
        let mut opened = AbandonGuard::new(conn.clone(), Resolution::OpenConnection.outcome());
        let begun = conn.begin().await;
        opened.disarm();
        if let Err(err) = begun {
            if let Err(close_err) = conn.close().await {
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
    /// is closed afterwards.
    pub async fn connect_scoped<T, Err, F, Fut>(&self, f: F) -> Result<T, Err>
    where
        F: FnOnce(ConnOf<E>) -> Fut,
        Fut: Future<Output = Result<T, Err>>,
        Err: From<ScopeError>,
    {
        self.scoped(ResolutionMode::Loose, None, f).await
    }

    /// Run `f` inside a transaction, reusing the ambient one if present.
    pub async fn atomic_scoped<T, Err, F, Fut>(&self, f: F) -> Result<T, Err>
    where
        F: FnOnce(ConnOf<E>) -> Fut,
        Fut: Future<Output = Result<T, Err>>,
        Err: From<ScopeError>,
    {
        self.scoped(ResolutionMode::Atomic, None, f).await
    }

    /// Run `f` on the given connection, or resolve one like `connect_scoped`.
    pub async fn connect<T, Err, F, Fut>(
        &self,
        conn: impl Into<ConnectionArg<E::Connection>>,
        f: F,
    ) -> Result<T, Err>
    where
        F: FnOnce(ConnOf<E>) -> Fut,
        Fut: Future<Output = Result<T, Err>>,
        Err: From<ScopeError>,
    {
        let explicit = self.suspending_arg(conn.into(), ResolutionMode::Loose)?;
        self.scoped(ResolutionMode::Loose, explicit, f).await
    }

    /// Run `f` inside a transaction on the given connection, beginning one on
    /// it if needed, or resolve one like `atomic_scoped`.
    pub async fn transact<T, Err, F, Fut>(
        &self,
        conn: impl Into<ConnectionArg<E::Connection>>,
        f: F,
    ) -> Result<T, Err>
    where
        F: FnOnce(ConnOf<E>) -> Fut,
        Fut: Future<Output = Result<T, Err>>,
        Err: From<ScopeError>,
    {
        let explicit = self.suspending_arg(conn.into(), ResolutionMode::Transact)?;
        self.scoped(ResolutionMode::Transact, explicit, f).await
    }

    // -----------------------------------------------------------------------
    // One-statement calls
    // -----------------------------------------------------------------------

    /// See [`ScopedEngine::execute_loose`](crate::ScopedEngine::execute_loose).
    pub async fn execute_loose(
        &self,
        conn: Option<&ConnOf<E>>,
        statement: &StatementOf<E>,
    ) -> ScopeResult<OutputOf<E>> {
        match conn {
            Some(conn) => Ok(conn.execute(statement).await?),
            None => {
                self.scoped(ResolutionMode::Loose, None, |conn| async move {
                    conn.execute(statement).await.map_err(ScopeError::from)
                })
                .await
            }
        }
    }

    /// See [`ScopedEngine::execute_strict_atomic`](crate::ScopedEngine::execute_strict_atomic).
    pub async fn execute_strict_atomic(
        &self,
        statement: &StatementOf<E>,
    ) -> ScopeResult<OutputOf<E>> {
        self.scoped(ResolutionMode::StrictAtomic, None, |conn| async move {
            conn.execute(statement).await.map_err(ScopeError::from)
        })
        .await
    }

    /// See [`ScopedEngine::execute_strict_transactional`](crate::ScopedEngine::execute_strict_transactional).
    pub async fn execute_strict_transactional(
        &self,
        conn: Option<&ConnOf<E>>,
        statement: &StatementOf<E>,
    ) -> ScopeResult<OutputOf<E>> {
        self.scoped(
            ResolutionMode::StrictTransactional,
            conn.cloned(),
            |conn| async move { conn.execute(statement).await.map_err(ScopeError::from) },
        )
        .await
    }

    /// See [`ScopedEngine::execute_atomic`](crate::ScopedEngine::execute_atomic).
    pub async fn execute_atomic(&self, statement: &StatementOf<E>) -> ScopeResult<OutputOf<E>> {
        self.execute_strict_transactional(None, statement).await
    }

    // -----------------------------------------------------------------------
    // Internals
    // -----------------------------------------------------------------------

    fn suspending_arg(
        &self,
        arg: ConnectionArg<E::Connection>,
        mode: ResolutionMode,
    ) -> ScopeResult<Option<ConnOf<E>>> {
        match arg {
            ConnectionArg::Absent => Ok(None),
            ConnectionArg::Suspending(conn) => Ok(Some(conn)),
            ConnectionArg::Blocking(_) => {
                let err = ScopeError::CrossModeConnection {
                    expected: ExecutionMode::Suspending,
                    found: ExecutionMode::Blocking,
                };
                obs::emit_contract_violation(mode, &err);
                Err(err)
            }
        }
    }

    async fn acquire(
        &self,
        mode: ResolutionMode,
        explicit: Option<ConnOf<E>>,
        ambient: Option<&ConnOf<E>>,
    ) -> ScopeResult<(ConnOf<E>, ScopeOutcome)> {
        // the ambient probe is only consulted when nothing explicit was given
        let explicit_probe = match &explicit {
            Some(conn) => Some(conn.probe().await),
            None => None,
        };
        let ambient_probe = match (&explicit, ambient) {
            (None, Some(conn)) => Some(conn.probe().await),
            _ => None,
        };
        let resolution = resolve(mode, explicit_probe, ambient_probe)
            .inspect_err(|err| obs::emit_contract_violation(mode, err))?;

        let candidate = explicit.or_else(|| ambient.cloned());
        let conn = match (resolution, candidate) {
            (Resolution::Reuse(_), Some(conn)) => conn,
            (Resolution::BeginOn(_), Some(conn)) => {
                conn.begin().await?;
                conn
            }
            (Resolution::OpenConnection, _) => self.open_connection().await?,
            (Resolution::OpenTransaction, _) => self.open_transaction().await?,
            (Resolution::Reuse(_) | Resolution::BeginOn(_), None) => {
                unreachable!("resolve only reuses a present connection")
            }
        };
        Ok((conn, resolution.outcome()))
    }

    async fn scoped<T, Err, F, Fut>(
        &self,
        mode: ResolutionMode,
        explicit: Option<ConnOf<E>>,
        f: F,
    ) -> Result<T, Err>
    where
        F: FnOnce(ConnOf<E>) -> Fut,
        Fut: Future<Output = Result<T, Err>>,
        Err: From<ScopeError>,
    {
        let span = obs::span(self.key(), ExecutionMode::Suspending);
        self.run_scope(mode, explicit, f).instrument(span).await
    }

    async fn run_scope<T, Err, F, Fut>(
        &self,
        mode: ResolutionMode,
        explicit: Option<ConnOf<E>>,
        f: F,
    ) -> Result<T, Err>
    where
        F: FnOnce(ConnOf<E>) -> Fut,
        Fut: Future<Output = Result<T, Err>>,
        Err: From<ScopeError>,
    {
        let ambient = self.cell.get();
        let (conn, outcome) = self.acquire(mode, explicit, ambient.as_ref()).await?;
        obs::emit_scope_entered(mode, outcome, conn.id());

        let install = !matches!(&ambient, Some(current) if current.same_as(&conn));
        let installed = conn.clone();
        // armed before the body is first polled, so a drop right after
        // acquisition still cleans up
        let mut guard = AbandonGuard::new(conn.clone(), outcome);
        let body = async move {
            let result = f(conn.clone()).await;
            let result = exit(&conn, outcome, result).await;
            guard.disarm();
            result
        };

        if install {
            self.cell.scope(Some(installed), body).await
        } else {
            body.await
        }
    }
}

impl<E: AsyncEngine> Clone for AsyncScopedEngine<E> {
    fn clone(&self) -> Self {
        Self {
            engine: Arc::clone(&self.engine),
            cell: TaskCell::new(self.cell.key()),
        }
    }
}

impl<E: AsyncEngine> fmt::Debug for AsyncScopedEngine<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AsyncScopedEngine")
            .field("key", &self.key())
            .finish()
    }
}

async fn exit<C: AsyncConnection, T, Err>(
    conn: &AsyncConn<C>,
    outcome: ScopeOutcome,
    result: Result<T, Err>,
) -> Result<T, Err>
where
    Err: From<ScopeError>,
{
    let in_transaction = outcome.owns_transaction && conn.in_transaction().await;
    let plan = outcome.exit_plan(result.is_ok(), in_transaction);

    let finish = match plan.finish {
        Some(Finish::Commit) => commit(conn).await,
        Some(Finish::Rollback) => conn
            .rollback()
            .await
            .map(|()| obs::emit_rolled_back(conn.id())),
        None => Ok(()),
    };
    let close = if plan.close {
        conn.close().await.map(|()| obs::emit_closed(conn.id()))
    } else {
        Ok(())
    };
    settle(result, finish, close)
}

async fn commit<C: AsyncConnection>(conn: &AsyncConn<C>) -> EngineResult<()> {
    match conn.commit().await {
        Ok(()) => {
            obs::emit_committed(conn.id());
            Ok(())
        }
        Err(err) => {
            if conn.in_transaction().await {
                if let Err(rollback_err) = conn.rollback().await {
                    obs::emit_cleanup_error("rollback", &rollback_err);
                }
            }
            Err(err)
        }
    }
}

/// Abandons an owner's transaction when its scope future is dropped or
/// its body panics.
struct AbandonGuard<C: AsyncConnection> {
    conn: AsyncConn<C>,
    outcome: ScopeOutcome,
    armed: bool,
}

impl<C: AsyncConnection> AbandonGuard<C> {
    fn new(conn: AsyncConn<C>, outcome: ScopeOutcome) -> Self {
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

impl<C: AsyncConnection> Drop for AbandonGuard<C> {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        let outcome = self.outcome;
        obs::emit_abandoned(self.conn.id(), outcome);

        if outcome.owns_transaction {
            let abandoned = self.conn.try_with_connection(|conn| {
                if conn.in_transaction() {
                    conn.start_rollback();
                }
            });
            if abandoned.is_none() {
                obs::emit_cleanup_error("rollback", &"connection busy, left to close");
            }
        }

        if outcome.owns_connection {
            let conn = self.conn.clone();
            match tokio::runtime::Handle::try_current() {
                Ok(runtime) => {
                    runtime.spawn(async move {
                        if let Err(err) = conn.close().await {
                            obs::emit_cleanup_error("close", &err);
                        }
                    });
                }
                Err(_) => obs::emit_cleanup_error("close", &"no runtime to close on"),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::{MemoryEngine, Statement};
    use serde_json::json;

    fn db() -> AsyncScopedEngine<MemoryEngine> {
        let db = AsyncScopedEngine::new(MemoryEngine::new());
        db.engine().create_table("items").unwrap();
        db
    }

    #[tokio::test]
    async fn test_ambient_is_empty_outside_scopes() {
        let db = db();
        assert!(db.ambient().is_none());
        db.atomic_scoped(|conn| async move {
            assert!(conn.in_transaction().await);
            Ok::<_, ScopeError>(())
        })
        .await
        .unwrap();
        assert!(db.ambient().is_none());
    }

    #[tokio::test]
    async fn test_clones_share_the_ambient_slot() {
        let db = db();
        let other = db.clone();
        db.atomic_scoped(|conn| async move {
            assert_eq!(other.ambient(), Some(conn));
            Ok::<_, ScopeError>(())
        })
        .await
        .unwrap();
    }

    #[tokio::test]
    async fn test_blocking_handle_is_rejected() {
        let db = db();
        let blocking = crate::handle::Conn::new(
            crate::engine::Engine::connect(db.engine()).unwrap(),
        );

        let err = db
            .transact(blocking, |_| async { Ok::<_, ScopeError>(()) })
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            ScopeError::CrossModeConnection {
                expected: ExecutionMode::Suspending,
                found: ExecutionMode::Blocking,
            }
        ));
        assert_eq!(db.engine().stats().begins, 0);
    }

    #[tokio::test]
    async fn test_one_shot_transaction_commits() {
        let db = db();
        db.execute_atomic(&Statement::insert("items", json!({"id": 1})))
            .await
            .unwrap();

        let stats = db.engine().stats();
        assert_eq!(stats.commits, 1);
        assert_eq!(stats.connections_opened, stats.connections_closed);
        assert_eq!(db.engine().committed_count("items"), Some(1));
    }
}
