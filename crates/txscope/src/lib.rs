//! txscope: Ambient Connection and Transaction Scoping
//!
//! This crate sits above a SQL client library and decides, for each call,
//! which connection a query runs on. Application code opens scopes instead
//! of threading a connection through every function signature; nested calls
//! pick up the innermost scope's connection from an ambient, per-thread or
//! per-task slot.
//!
//! ## Call conventions
//!
//! - `connect_scoped` / `execute_loose`: reuse whatever is ambient, otherwise
//!   use a fresh plain connection
//! - `atomic_scoped` / `execute_atomic`: reuse the ambient transaction,
//!   otherwise run in a new one
//! - `execute_strict_atomic`: require an ambient transaction
//! - `execute_strict_transactional`: require the given or ambient connection
//!   to be in a transaction
//! - `connect` / `transact`: take an explicit connection when the caller
//!   already has one
//!
//! Only the scope that opened a connection or began a transaction ever
//! commits, rolls back or closes it. Nested scopes are transparent.
//!
//! ## Key Components
//!
//! - `ScopedEngine`: blocking wrapper over an `Engine`
//! - `AsyncScopedEngine`: suspending wrapper over an `AsyncEngine`
//! - `policy::resolve`: the resolution state machine shared by both
//! - `MemoryEngine`: in-memory reference engine implementing both traits

pub mod ambient;
pub mod config;
pub mod engine;
mod error;
pub mod handle;
pub mod memory;
pub mod obs;
pub mod policy;
mod scoped;
mod scoped_async;
pub mod telemetry;

pub use ambient::{AmbientCell, AmbientToken, ScopeKey, TaskCell};
pub use config::{EngineConfig, EngineKind};
pub use engine::{AsyncConnection, AsyncEngine, Connection, Engine};
pub use error::{EngineError, EngineResult, ScopeError, ScopeResult};
pub use handle::{AsyncConn, Conn, ConnectionArg, ConnectionId, ExecutionMode};
pub use memory::{EngineStats, MemoryConnection, MemoryEngine, QueryResult, Statement};
pub use policy::{ResolutionMode, ScopeOutcome};
pub use scoped::ScopedEngine;
pub use scoped_async::AsyncScopedEngine;
pub use telemetry::{init_test_tracing, init_tracing, LogFormat};
