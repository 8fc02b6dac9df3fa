//! Capability interface to a relational database.
//!
//! A backend performs migrations; it never decides which ones to run, and
//! it never opens its own transactions — the coordinator owns the
//! boundaries and calls `begin`/`commit`/`rollback` explicitly. Dropping a
//! backend releases its session, which aborts any transaction still open,
//! so every exit path (including panics) leaves the database consistent.

use std::collections::BTreeSet;
use std::fmt;

use crate::migration::Migration;

/// Error type for backend operations.
#[derive(Debug)]
pub enum BackendError {
    /// Could not open a session against the database.
    Connect(String),
    /// The database rejected a statement.
    Sql(String),
    /// Asked to revert a migration that carries no revert SQL.
    MissingRevert(String),
}

impl fmt::Display for BackendError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BackendError::Connect(detail) => write!(f, "{}", detail),
            BackendError::Sql(detail) => write!(f, "{}", detail),
            BackendError::MissingRevert(id) => {
                write!(f, "migration '{}' has no revert script", id)
            }
        }
    }
}

impl std::error::Error for BackendError {}

pub type BackendResult<T> = Result<T, BackendError>;

/// Database operations the coordinator drives.
pub trait Backend {
    /// Open a transaction.
    fn begin(&mut self) -> BackendResult<()>;

    /// Make everything since `begin` permanent.
    fn commit(&mut self) -> BackendResult<()>;

    /// Discard everything since `begin`.
    fn rollback(&mut self) -> BackendResult<()>;

    /// Ensure the ledger table exists and the bootstrap id is recorded.
    /// Idempotent; runs inside whatever transaction is open.
    fn bootstrap(&mut self) -> BackendResult<()>;

    /// Read the set of installed migration ids from the ledger.
    fn list_installed(&mut self) -> BackendResult<BTreeSet<String>>;

    /// Execute the migration's apply SQL, then record its id in the
    /// ledger. Both effects land in the enclosing transaction.
    fn apply_migration(&mut self, migration: &Migration) -> BackendResult<()>;

    /// Execute the migration's revert SQL (error if absent), then delete
    /// its id from the ledger.
    fn revert_migration(&mut self, migration: &Migration) -> BackendResult<()>;
}
