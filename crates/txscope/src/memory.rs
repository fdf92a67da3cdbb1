//! In-memory reference engine
//!
//! `MemoryEngine` implements both capability sets over one connection type,
//! so the same store can be driven from blocking and suspending code. It
//! behaves like a typical client library:
//!
//! - executing outside a transaction implicitly begins one (autobegin)
//! - closing a connection discards an unfinished transaction
//! - a transaction reads the committed state as of `begin` plus its own
//!   writes; commit replays the writes onto the latest committed state
//!
//! `EngineStats` counts engine-level calls so tests can check who committed,
//! rolled back or executed what.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::debug;

use crate::config::{EngineConfig, EngineKind};
use crate::engine::{AsyncConnection, AsyncEngine, Connection, Engine};
use crate::error::{EngineError, EngineResult, ScopeResult};

/// Statements understood by the memory engine.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum Statement {
    CreateTable { table: String },
    Insert { table: String, row: Value },
    Count { table: String },
    Select { table: String },
    DeleteAll { table: String },
}

impl Statement {
    pub fn create_table(table: impl Into<String>) -> Self {
        Statement::CreateTable {
            table: table.into(),
        }
    }

    pub fn insert(table: impl Into<String>, row: Value) -> Self {
        Statement::Insert {
            table: table.into(),
            row,
        }
    }

    pub fn count(table: impl Into<String>) -> Self {
        Statement::Count {
            table: table.into(),
        }
    }

    pub fn select(table: impl Into<String>) -> Self {
        Statement::Select {
            table: table.into(),
        }
    }

    pub fn delete_all(table: impl Into<String>) -> Self {
        Statement::DeleteAll {
            table: table.into(),
        }
    }

    pub fn table(&self) -> &str {
        match self {
            Statement::CreateTable { table }
            | Statement::Insert { table, .. }
            | Statement::Count { table }
            | Statement::Select { table }
            | Statement::DeleteAll { table } => table,
        }
    }

    fn is_write(&self) -> bool {
        !matches!(self, Statement::Count { .. } | Statement::Select { .. })
    }
}

/// Rows returned by a statement.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct QueryResult {
    pub rows: Vec<Value>,
    pub rows_affected: u64,
}

impl QueryResult {
    /// First column of the first row as an integer (e.g. a count).
    pub fn scalar_u64(&self) -> Option<u64> {
        self.rows.first().and_then(Value::as_u64)
    }
}

type Tables = BTreeMap<String, Vec<Value>>;

fn apply(tables: &mut Tables, statement: &Statement) -> EngineResult<QueryResult> {
    let table = statement.table();
    match statement {
        Statement::CreateTable { .. } => {
            if tables.contains_key(table) {
                return Err(EngineError::Query(format!("table {table} already exists")));
            }
            tables.insert(table.to_string(), Vec::new());
            Ok(QueryResult::default())
        }
        Statement::Insert { row, .. } => {
            let rows = rows_mut(tables, table)?;
            rows.push(row.clone());
            Ok(QueryResult {
                rows: Vec::new(),
                rows_affected: 1,
            })
        }
        Statement::Count { .. } => {
            let count = rows_mut(tables, table)?.len();
            Ok(QueryResult {
                rows: vec![Value::from(count as u64)],
                rows_affected: 0,
            })
        }
        Statement::Select { .. } => Ok(QueryResult {
            rows: rows_mut(tables, table)?.clone(),
            rows_affected: 0,
        }),
        Statement::DeleteAll { .. } => {
            let rows = rows_mut(tables, table)?;
            let affected = rows.len() as u64;
            rows.clear();
            Ok(QueryResult {
                rows: Vec::new(),
                rows_affected: affected,
            })
        }
    }
}

fn rows_mut<'a>(tables: &'a mut Tables, table: &str) -> EngineResult<&'a mut Vec<Value>> {
    tables
        .get_mut(table)
        .ok_or_else(|| EngineError::Query(format!("no such table: {table}")))
}

/// Snapshot of engine-level call counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct EngineStats {
    pub connections_opened: u64,
    pub connections_closed: u64,
    /// Explicit begins plus autobegins
    pub begins: u64,
    pub commits: u64,
    /// Explicit rollbacks plus abandoned scopes; discarding on close is not counted
    pub rollbacks: u64,
    pub executes: u64,
}

#[derive(Debug, Default)]
struct Counters {
    connections_opened: AtomicU64,
    connections_closed: AtomicU64,
    begins: AtomicU64,
    commits: AtomicU64,
    rollbacks: AtomicU64,
    executes: AtomicU64,
}

fn bump(counter: &AtomicU64) {
    counter.fetch_add(1, Ordering::Relaxed);
}

#[derive(Debug, Default)]
struct Store {
    tables: Mutex<Tables>,
    counters: Counters,
}

impl Store {
    fn tables(&self) -> MutexGuard<'_, Tables> {
        self.tables.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// In-memory engine; clones share the same store.
#[derive(Debug, Clone)]
pub struct MemoryEngine {
    name: String,
    store: Arc<Store>,
}

impl MemoryEngine {
    pub fn new() -> Self {
        Self::named("mem://")
    }

    pub fn named(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            store: Arc::new(Store::default()),
        }
    }

    /// Open the engine a configuration describes.
    ///
    /// Fails with `UnsupportedEngine` for any non-memory URL.
    pub fn from_config(config: &EngineConfig) -> ScopeResult<Self> {
        match config.kind()? {
            EngineKind::Memory => Ok(Self::named(config.display_name())),
        }
    }

    /// Open the engine described by the environment
    ///
    /// Reads TXSCOPE_DATABASE_URL (default "mem://") and TXSCOPE_ENGINE_NAME.
    pub fn from_env() -> ScopeResult<Self> {
        let config = EngineConfig::from_env();
        debug!(url = %config.url, name = config.display_name(), "engine config from env");
        Self::from_config(&config)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Create a table directly in the committed state.
    pub fn create_table(&self, table: &str) -> EngineResult<()> {
        apply(&mut self.store.tables(), &Statement::create_table(table)).map(|_| ())
    }

    /// Committed row count, bypassing connections entirely.
    pub fn committed_count(&self, table: &str) -> Option<usize> {
        self.store.tables().get(table).map(Vec::len)
    }

    pub fn stats(&self) -> EngineStats {
        let c = &self.store.counters;
        EngineStats {
            connections_opened: c.connections_opened.load(Ordering::Relaxed),
            connections_closed: c.connections_closed.load(Ordering::Relaxed),
            begins: c.begins.load(Ordering::Relaxed),
            commits: c.commits.load(Ordering::Relaxed),
            rollbacks: c.rollbacks.load(Ordering::Relaxed),
            executes: c.executes.load(Ordering::Relaxed),
        }
    }

    fn open(&self) -> MemoryConnection {
        bump(&self.store.counters.connections_opened);
        MemoryConnection {
            store: Arc::clone(&self.store),
            tx: None,
            closed: false,
        }
    }
}

impl Default for MemoryEngine {
    fn default() -> Self {
        Self::new()
    }
}

impl Engine for MemoryEngine {
    type Connection = MemoryConnection;

    fn connect(&self) -> EngineResult<MemoryConnection> {
        Ok(self.open())
    }
}

#[async_trait]
impl AsyncEngine for MemoryEngine {
    type Connection = MemoryConnection;

    async fn connect(&self) -> EngineResult<MemoryConnection> {
        tokio::task::yield_now().await;
        Ok(self.open())
    }
}

#[derive(Debug)]
struct PendingTransaction {
    working: Tables,
    writes: Vec<Statement>,
}

/// Connection to a `MemoryEngine`.
#[derive(Debug)]
pub struct MemoryConnection {
    store: Arc<Store>,
    tx: Option<PendingTransaction>,
    closed: bool,
}

impl MemoryConnection {
    fn ensure_open(&self) -> EngineResult<()> {
        if self.closed {
            Err(EngineError::Closed)
        } else {
            Ok(())
        }
    }

    fn begin_now(&mut self) -> EngineResult<()> {
        self.ensure_open()?;
        if self.tx.is_some() {
            return Err(EngineError::Transaction(
                "a transaction is already active".to_string(),
            ));
        }
        let working = self.store.tables().clone();
        self.tx = Some(PendingTransaction {
            working,
            writes: Vec::new(),
        });
        bump(&self.store.counters.begins);
        Ok(())
    }

    // Committing or rolling back with no active transaction is a no-op.
    fn commit_now(&mut self) -> EngineResult<()> {
        self.ensure_open()?;
        let Some(tx) = self.tx.take() else {
            return Ok(());
        };
        let mut tables = self.store.tables();
        let mut next = tables.clone();
        for write in &tx.writes {
            apply(&mut next, write)
                .map_err(|err| EngineError::Transaction(format!("commit failed: {err}")))?;
        }
        *tables = next;
        bump(&self.store.counters.commits);
        debug!(writes = tx.writes.len(), "memory transaction committed");
        Ok(())
    }

    fn rollback_now(&mut self) -> EngineResult<()> {
        self.ensure_open()?;
        if self.tx.take().is_some() {
            bump(&self.store.counters.rollbacks);
        }
        Ok(())
    }

    fn execute_now(&mut self, statement: &Statement) -> EngineResult<QueryResult> {
        self.ensure_open()?;
        bump(&self.store.counters.executes);
        if self.tx.is_none() {
            self.begin_now()?;
        }
        let Some(tx) = self.tx.as_mut() else {
            return Err(EngineError::Transaction("autobegin failed".to_string()));
        };
        let result = apply(&mut tx.working, statement)?;
        if statement.is_write() {
            tx.writes.push(statement.clone());
        }
        Ok(result)
    }

    fn close_now(&mut self) -> EngineResult<()> {
        if self.closed {
            return Ok(());
        }
        self.tx = None;
        self.closed = true;
        bump(&self.store.counters.connections_closed);
        Ok(())
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }
}

impl Connection for MemoryConnection {
    type Statement = Statement;
    type Output = QueryResult;

    fn begin(&mut self) -> EngineResult<()> {
        self.begin_now()
    }

    fn commit(&mut self) -> EngineResult<()> {
        self.commit_now()
    }

    fn rollback(&mut self) -> EngineResult<()> {
        self.rollback_now()
    }

    fn execute(&mut self, statement: &Statement) -> EngineResult<QueryResult> {
        self.execute_now(statement)
    }

    fn in_transaction(&self) -> bool {
        self.tx.is_some()
    }

    fn close(&mut self) -> EngineResult<()> {
        self.close_now()
    }
}

#[async_trait]
impl AsyncConnection for MemoryConnection {
    type Statement = Statement;
    type Output = QueryResult;

    async fn begin(&mut self) -> EngineResult<()> {
        tokio::task::yield_now().await;
        self.begin_now()
    }

    async fn commit(&mut self) -> EngineResult<()> {
        tokio::task::yield_now().await;
        self.commit_now()
    }

    async fn rollback(&mut self) -> EngineResult<()> {
        tokio::task::yield_now().await;
        self.rollback_now()
    }

    async fn execute(&mut self, statement: &Statement) -> EngineResult<QueryResult> {
        tokio::task::yield_now().await;
        self.execute_now(statement)
    }

    fn in_transaction(&self) -> bool {
        self.tx.is_some()
    }

    async fn close(&mut self) -> EngineResult<()> {
        tokio::task::yield_now().await;
        self.close_now()
    }

    fn start_rollback(&mut self) {
        if self.tx.take().is_some() {
            bump(&self.store.counters.rollbacks);
        }
    }
}
