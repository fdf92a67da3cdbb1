//! Connection handles
//!
//! A handle is what scopes yield to user code and what the ambient cells
//! reference. Handles are cheap `Arc` clones; equality is identity, so two
//! nested scopes can assert they were given "the same connection".
//!
//! The handle does not own the lifecycle of the connection. Whichever scope
//! opened it decides when it is committed, rolled back and closed.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use crate::engine::{AsyncConnection, Connection};
use crate::error::EngineResult;
use crate::policy::Probe;

static NEXT_CONNECTION_ID: AtomicU64 = AtomicU64::new(1);

/// Process-unique identifier of a handle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnectionId(u64);

impl ConnectionId {
    fn next() -> Self {
        ConnectionId(NEXT_CONNECTION_ID.fetch_add(1, Ordering::Relaxed))
    }

    pub fn as_u64(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "conn-{}", self.0)
    }
}

/// Concurrency model a handle was opened under.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ExecutionMode {
    /// Blocking I/O on the calling thread
    Blocking,
    /// Suspending I/O inside an async task
    Suspending,
}

impl fmt::Display for ExecutionMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ExecutionMode::Blocking => write!(f, "blocking"),
            ExecutionMode::Suspending => write!(f, "suspending"),
        }
    }
}

// ---------------------------------------------------------------------------
// Blocking handle
// ---------------------------------------------------------------------------

struct ConnShared<C> {
    id: ConnectionId,
    conn: Mutex<C>,
}

/// Shared handle to a blocking connection.
pub struct Conn<C> {
    inner: Arc<ConnShared<C>>,
}

impl<C> Conn<C> {
    /// Wrap a connection opened outside the scoping layer.
    pub fn new(conn: C) -> Self {
        Self {
            inner: Arc::new(ConnShared {
                id: ConnectionId::next(),
                conn: Mutex::new(conn),
            }),
        }
    }

    pub fn id(&self) -> ConnectionId {
        self.inner.id
    }

    pub fn mode(&self) -> ExecutionMode {
        ExecutionMode::Blocking
    }

    /// Whether both handles point at the same connection.
    pub fn same_as(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    fn lock(&self) -> MutexGuard<'_, C> {
        self.inner.conn.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Run `f` with exclusive access to the raw connection.
    pub fn with_connection<R>(&self, f: impl FnOnce(&mut C) -> R) -> R {
        f(&mut self.lock())
    }
}

impl<C: Connection> Conn<C> {
    pub fn execute(&self, statement: &C::Statement) -> EngineResult<C::Output> {
        self.lock().execute(statement)
    }

    pub fn begin(&self) -> EngineResult<()> {
        self.lock().begin()
    }

    pub fn commit(&self) -> EngineResult<()> {
        self.lock().commit()
    }

    pub fn rollback(&self) -> EngineResult<()> {
        self.lock().rollback()
    }

    pub fn in_transaction(&self) -> bool {
        self.lock().in_transaction()
    }

    pub fn close(&self) -> EngineResult<()> {
        self.lock().close()
    }

    pub(crate) fn probe(&self) -> Probe {
        Probe::new(self.in_transaction())
    }
}

impl<C> Clone for Conn<C> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<C> PartialEq for Conn<C> {
    fn eq(&self, other: &Self) -> bool {
        self.same_as(other)
    }
}

impl<C> Eq for Conn<C> {}

impl<C> fmt::Debug for Conn<C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Conn").field("id", &self.inner.id).finish()
    }
}

// ---------------------------------------------------------------------------
// Suspending handle
// ---------------------------------------------------------------------------

struct AsyncConnShared<C> {
    id: ConnectionId,
    conn: tokio::sync::Mutex<C>,
}

/// Shared handle to a suspending connection.
pub struct AsyncConn<C> {
    inner: Arc<AsyncConnShared<C>>,
}

impl<C> AsyncConn<C> {
    /// Wrap a connection opened outside the scoping layer.
    pub fn new(conn: C) -> Self {
        Self {
            inner: Arc::new(AsyncConnShared {
                id: ConnectionId::next(),
                conn: tokio::sync::Mutex::new(conn),
            }),
        }
    }

    pub fn id(&self) -> ConnectionId {
        self.inner.id
    }

    pub fn mode(&self) -> ExecutionMode {
        ExecutionMode::Suspending
    }

    pub fn same_as(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    /// Run `f` with exclusive access to the raw connection.
    pub async fn with_connection<R>(&self, f: impl FnOnce(&mut C) -> R) -> R {
        let mut conn = self.inner.conn.lock().await;
        f(&mut conn)
    }

    /// Non-suspending access, `None` while another caller holds the lock.
    pub(crate) fn try_with_connection<R>(&self, f: impl FnOnce(&mut C) -> R) -> Option<R> {
        self.inner.conn.try_lock().ok().map(|mut conn| f(&mut conn))
    }
}

impl<C: AsyncConnection> AsyncConn<C> {
    pub async fn execute(&self, statement: &C::Statement) -> EngineResult<C::Output> {
        self.inner.conn.lock().await.execute(statement).await
    }

    pub async fn begin(&self) -> EngineResult<()> {
        self.inner.conn.lock().await.begin().await
    }

    pub async fn commit(&self) -> EngineResult<()> {
        self.inner.conn.lock().await.commit().await
    }

    pub async fn rollback(&self) -> EngineResult<()> {
        self.inner.conn.lock().await.rollback().await
    }

    pub async fn in_transaction(&self) -> bool {
        self.inner.conn.lock().await.in_transaction()
    }

    pub async fn close(&self) -> EngineResult<()> {
        self.inner.conn.lock().await.close().await
    }

    pub(crate) async fn probe(&self) -> Probe {
        Probe::new(self.in_transaction().await)
    }
}

impl<C> Clone for AsyncConn<C> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<C> PartialEq for AsyncConn<C> {
    fn eq(&self, other: &Self) -> bool {
        self.same_as(other)
    }
}

impl<C> Eq for AsyncConn<C> {}

impl<C> fmt::Debug for AsyncConn<C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AsyncConn").field("id", &self.inner.id).finish()
    }
}

// ---------------------------------------------------------------------------
// Explicit connection argument
// ---------------------------------------------------------------------------

/// Connection passed explicitly to `connect` / `transact`.
///
/// Callers that inject connections from the outside (request extensions,
/// job contexts) hand over whatever they hold. The wrapper checks the mode
/// before resolving and rejects handles of the other concurrency model.
#[derive(Debug)]
pub enum ConnectionArg<C> {
    /// Nothing supplied; resolve from the ambient scope.
    Absent,
    Blocking(Conn<C>),
    Suspending(AsyncConn<C>),
}

impl<C> ConnectionArg<C> {
    pub fn mode(&self) -> Option<ExecutionMode> {
        match self {
            ConnectionArg::Absent => None,
            ConnectionArg::Blocking(_) => Some(ExecutionMode::Blocking),
            ConnectionArg::Suspending(_) => Some(ExecutionMode::Suspending),
        }
    }
}

impl<C> Default for ConnectionArg<C> {
    fn default() -> Self {
        ConnectionArg::Absent
    }
}

impl<C> Clone for ConnectionArg<C> {
    fn clone(&self) -> Self {
        match self {
            ConnectionArg::Absent => ConnectionArg::Absent,
            ConnectionArg::Blocking(conn) => ConnectionArg::Blocking(conn.clone()),
            ConnectionArg::Suspending(conn) => ConnectionArg::Suspending(conn.clone()),
        }
    }
}

impl<C> From<Conn<C>> for ConnectionArg<C> {
    fn from(conn: Conn<C>) -> Self {
        ConnectionArg::Blocking(conn)
    }
}

impl<C> From<&Conn<C>> for ConnectionArg<C> {
    fn from(conn: &Conn<C>) -> Self {
        ConnectionArg::Blocking(conn.clone())
    }
}

impl<C> From<Option<Conn<C>>> for ConnectionArg<C> {
    fn from(conn: Option<Conn<C>>) -> Self {
        conn.map_or(ConnectionArg::Absent, ConnectionArg::Blocking)
    }
}

impl<C> From<AsyncConn<C>> for ConnectionArg<C> {
    fn from(conn: AsyncConn<C>) -> Self {
        ConnectionArg::Suspending(conn)
    }
}

impl<C> From<&AsyncConn<C>> for ConnectionArg<C> {
    fn from(conn: &AsyncConn<C>) -> Self {
        ConnectionArg::Suspending(conn.clone())
    }
}

impl<C> From<Option<AsyncConn<C>>> for ConnectionArg<C> {
    fn from(conn: Option<AsyncConn<C>>) -> Self {
        conn.map_or(ConnectionArg::Absent, ConnectionArg::Suspending)
    }
}
