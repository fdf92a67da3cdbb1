//! Resolution policy: the ambient scope state machine
//!
//! Every scope entry and every execute call is decided here, once, for both
//! concurrency models. Inputs are reduced to `Probe`s (is there a candidate
//! connection, and is it inside a transaction) so the policy never touches
//! a connection itself.
//!
//! ```text
//!   mode \ candidate      none              in transaction     no transaction
//!   ------------------------------------------------------------------------------
//!   Loose                 OpenConnection    Reuse              Reuse
//!   Atomic                OpenTransaction   Reuse              AtomicInsideNonAtomic
//!   StrictAtomic          NoAmbientAtomic   Reuse              NotInTransaction
//!   StrictTransactional   OpenTransaction   Reuse              NotInTransaction
//!   Transact              OpenTransaction   Reuse              BeginOn (explicit only)
//! ```
//!
//! The candidate is the explicit connection if one was given, else the
//! ambient one.

use std::fmt;

use crate::error::{EngineResult, ScopeError, ScopeResult};
use crate::obs;

/// How a call site wants its connection resolved. Fixed per call site.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ResolutionMode {
    /// Reuse whatever is there, otherwise open a plain connection.
    Loose,
    /// Reuse an ambient transaction, otherwise open one.
    Atomic,
    /// Require an ambient transaction.
    StrictAtomic,
    /// Require the resolved connection to be in a transaction; with nothing
    /// to resolve, run a one-shot transaction.
    StrictTransactional,
    /// Like `Atomic`, but an explicitly passed connection without a
    /// transaction gets one begun on it.
    Transact,
}

impl fmt::Display for ResolutionMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ResolutionMode::Loose => "loose",
            ResolutionMode::Atomic => "atomic",
            ResolutionMode::StrictAtomic => "strict_atomic",
            ResolutionMode::StrictTransactional => "strict_transactional",
            ResolutionMode::Transact => "transact",
        };
        f.write_str(name)
    }
}

/// What the policy needs to know about a candidate connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Probe {
    pub in_transaction: bool,
}

impl Probe {
    pub fn new(in_transaction: bool) -> Self {
        Self { in_transaction }
    }
}

/// Where a reused connection came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Source {
    Explicit,
    Ambient,
}

/// Decision for one scope entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Resolution {
    /// Use an existing connection as-is.
    Reuse(Source),
    /// Begin a transaction on an existing connection and own that transaction.
    BeginOn(Source),
    /// Open a plain connection and own it.
    OpenConnection,
    /// Open a connection, begin a transaction, own both.
    OpenTransaction,
}

impl Resolution {
    pub fn outcome(&self) -> ScopeOutcome {
        match self {
            Resolution::Reuse(_) => ScopeOutcome::REUSER,
            Resolution::BeginOn(_) => ScopeOutcome {
                owns_connection: false,
                owns_transaction: true,
            },
            Resolution::OpenConnection => ScopeOutcome {
                owns_connection: true,
                owns_transaction: false,
            },
            Resolution::OpenTransaction => ScopeOutcome {
                owns_connection: true,
                owns_transaction: true,
            },
        }
    }
}

/// Decide how a scope entry resolves its connection.
///
/// Fails with a contract violation before anything reaches the database.
pub fn resolve(
    mode: ResolutionMode,
    explicit: Option<Probe>,
    ambient: Option<Probe>,
) -> ScopeResult<Resolution> {
    let candidate = explicit
        .map(|probe| (Source::Explicit, probe))
        .or_else(|| ambient.map(|probe| (Source::Ambient, probe)));

    let resolution = match (mode, candidate) {
        (ResolutionMode::Loose, Some((source, _))) => Resolution::Reuse(source),
        (ResolutionMode::Loose, None) => Resolution::OpenConnection,

        (ResolutionMode::StrictAtomic, None) => return Err(ScopeError::NoAmbientAtomicContext),
        (ResolutionMode::StrictTransactional, None)
        | (ResolutionMode::Atomic, None)
        | (ResolutionMode::Transact, None) => Resolution::OpenTransaction,

        (_, Some((source, probe))) if probe.in_transaction => Resolution::Reuse(source),

        (ResolutionMode::Atomic, Some(_)) => return Err(ScopeError::AtomicInsideNonAtomic),
        (ResolutionMode::Transact, Some((Source::Explicit, _))) => {
            Resolution::BeginOn(Source::Explicit)
        }
        (ResolutionMode::Transact, Some((Source::Ambient, _))) => {
            return Err(ScopeError::AtomicInsideNonAtomic)
        }
        (ResolutionMode::StrictAtomic, Some(_))
        | (ResolutionMode::StrictTransactional, Some(_)) => {
            return Err(ScopeError::NotInTransaction)
        }
    };
    Ok(resolution)
}

/// Lifecycle responsibility of one scope invocation.
///
/// Only an owner commits, rolls back or closes; a reuser's exit leaves the
/// connection alone.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ScopeOutcome {
    pub owns_connection: bool,
    pub owns_transaction: bool,
}

impl ScopeOutcome {
    pub const REUSER: ScopeOutcome = ScopeOutcome {
        owns_connection: false,
        owns_transaction: false,
    };

    pub fn is_owner(&self) -> bool {
        self.owns_connection || self.owns_transaction
    }

    pub fn role(&self) -> &'static str {
        match (self.owns_connection, self.owns_transaction) {
            (false, false) => "reuser",
            (true, false) => "connection_owner",
            (false, true) => "transaction_owner",
            (true, true) => "owner",
        }
    }

    /// What to do on exit, given how the body ended and whether the
    /// connection is still inside a transaction.
    ///
    /// A transaction ended by user code mid-scope is not finished again.
    pub fn exit_plan(&self, succeeded: bool, in_transaction: bool) -> ExitPlan {
        let finish = if self.owns_transaction && in_transaction {
            Some(if succeeded {
                Finish::Commit
            } else {
                Finish::Rollback
            })
        } else {
            None
        };
        ExitPlan {
            finish,
            close: self.owns_connection,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Finish {
    Commit,
    Rollback,
}

/// Cleanup steps for one scope exit, in order: finish, then close.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExitPlan {
    pub finish: Option<Finish>,
    pub close: bool,
}

impl ExitPlan {
    pub fn is_noop(&self) -> bool {
        self.finish.is_none() && !self.close
    }
}

/// Fold cleanup results into the body's result.
///
/// A failed commit turns success into failure. When the body already failed,
/// cleanup errors are logged and the body's error wins.
pub(crate) fn settle<T, Err>(
    result: Result<T, Err>,
    finish: EngineResult<()>,
    close: EngineResult<()>,
) -> Result<T, Err>
where
    Err: From<ScopeError>,
{
    match result {
        Ok(value) => match (finish, close) {
            (Ok(()), Ok(())) => Ok(value),
            (Err(err), close) => {
                if let Err(close_err) = close {
                    obs::emit_cleanup_error("close", &close_err);
                }
                Err(ScopeError::Engine(err).into())
            }
            (Ok(()), Err(err)) => Err(ScopeError::Engine(err).into()),
        },
        Err(body_err) => {
            if let Err(err) = finish {
                obs::emit_cleanup_error("rollback", &err);
            }
            if let Err(err) = close {
                obs::emit_cleanup_error("close", &err);
            }
            Err(body_err)
        }
    }
}
