//! SQLite backend for stratum.
//!
//! One `rusqlite::Connection` per session. Transaction control is plain
//! SQL (`BEGIN`/`COMMIT`/`ROLLBACK`) issued by the coordinator through the
//! trait; the backend itself never starts a transaction. Dropping the
//! backend closes the connection, which aborts anything left open.

use std::collections::BTreeSet;
use std::path::Path;

use log::debug;
use rusqlite::Connection;

use stratum_core::backend::{Backend, BackendError, BackendResult};
use stratum_core::migration::{Migration, BOOTSTRAP_ID};

/// Name of the ledger table recording installed migrations.
pub const LEDGER_TABLE: &str = "installed_migrations";

/// A session against one SQLite database file.
pub struct SqliteBackend {
    conn: Connection,
}

impl SqliteBackend {
    /// Open (creating if necessary) the database at `path`.
    pub fn open<P: AsRef<Path>>(path: P) -> BackendResult<Self> {
        let conn = Connection::open(path.as_ref())
            .map_err(|e| BackendError::Connect(e.to_string()))?;
        debug!("opened sqlite database {}", path.as_ref().display());
        Ok(Self { conn })
    }

    /// An in-memory database; used by tests.
    pub fn open_in_memory() -> BackendResult<Self> {
        let conn =
            Connection::open_in_memory().map_err(|e| BackendError::Connect(e.to_string()))?;
        Ok(Self { conn })
    }
}

fn sql_err(e: rusqlite::Error) -> BackendError {
    BackendError::Sql(e.to_string())
}

impl Backend for SqliteBackend {
    fn begin(&mut self) -> BackendResult<()> {
        self.conn.execute_batch("BEGIN DEFERRED").map_err(sql_err)
    }

    fn commit(&mut self) -> BackendResult<()> {
        self.conn.execute_batch("COMMIT").map_err(sql_err)
    }

    fn rollback(&mut self) -> BackendResult<()> {
        self.conn.execute_batch("ROLLBACK").map_err(sql_err)
    }

    fn bootstrap(&mut self) -> BackendResult<()> {
        self.conn
            .execute_batch(&format!(
                "CREATE TABLE IF NOT EXISTS {} (migration_id TEXT PRIMARY KEY)",
                LEDGER_TABLE
            ))
            .map_err(sql_err)?;
        self.conn
            .execute(
                &format!(
                    "INSERT OR IGNORE INTO {} (migration_id) VALUES (?1)",
                    LEDGER_TABLE
                ),
                [BOOTSTRAP_ID],
            )
            .map_err(sql_err)?;
        Ok(())
    }

    fn list_installed(&mut self) -> BackendResult<BTreeSet<String>> {
        let mut stmt = self
            .conn
            .prepare(&format!("SELECT migration_id FROM {}", LEDGER_TABLE))
            .map_err(sql_err)?;
        let rows = stmt
            .query_map([], |row| row.get::<_, String>(0))
            .map_err(sql_err)?;
        let mut installed = BTreeSet::new();
        for row in rows {
            installed.insert(row.map_err(sql_err)?);
        }
        Ok(installed)
    }

    fn apply_migration(&mut self, migration: &Migration) -> BackendResult<()> {
        self.conn.execute_batch(&migration.apply).map_err(sql_err)?;
        self.conn
            .execute(
                &format!("INSERT INTO {} (migration_id) VALUES (?1)", LEDGER_TABLE),
                [migration.id.as_str()],
            )
            .map_err(sql_err)?;
        Ok(())
    }

    fn revert_migration(&mut self, migration: &Migration) -> BackendResult<()> {
        let sql = migration
            .revert
            .as_deref()
            .ok_or_else(|| BackendError::MissingRevert(migration.id.clone()))?;
        self.conn.execute_batch(sql).map_err(sql_err)?;
        self.conn
            .execute(
                &format!("DELETE FROM {} WHERE migration_id = ?1", LEDGER_TABLE),
                [migration.id.as_str()],
            )
            .map_err(sql_err)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeSet;

    fn migration(id: &str, apply: &str, revert: Option<&str>) -> Migration {
        Migration {
            id: id.to_string(),
            depends: BTreeSet::new(),
            apply: apply.to_string(),
            revert: revert.map(str::to_string),
            description: String::new(),
            created: None,
        }
    }

    fn bootstrapped() -> SqliteBackend {
        let mut backend = SqliteBackend::open_in_memory().unwrap();
        backend.begin().unwrap();
        backend.bootstrap().unwrap();
        backend.commit().unwrap();
        backend
    }

    #[test]
    fn test_bootstrap_is_idempotent() {
        let mut backend = bootstrapped();
        backend.begin().unwrap();
        backend.bootstrap().unwrap();
        backend.commit().unwrap();
        assert_eq!(
            backend.list_installed().unwrap(),
            BTreeSet::from([BOOTSTRAP_ID.to_string()])
        );
    }

    #[test]
    fn test_apply_executes_sql_and_records_ledger_row() {
        let mut backend = bootstrapped();
        backend.begin().unwrap();
        backend
            .apply_migration(&migration(
                "users",
                "CREATE TABLE users (id INTEGER PRIMARY KEY);",
                None,
            ))
            .unwrap();
        backend.commit().unwrap();

        assert!(backend.list_installed().unwrap().contains("users"));
        let count: i64 = backend
            .conn
            .query_row("SELECT COUNT(*) FROM users", [], |row| row.get(0))
            .unwrap();
        assert_eq!(count, 0);
    }

    #[test]
    fn test_revert_removes_ledger_row() {
        let mut backend = bootstrapped();
        backend.begin().unwrap();
        let m = migration(
            "users",
            "CREATE TABLE users (id INTEGER PRIMARY KEY);",
            Some("DROP TABLE users;"),
        );
        backend.apply_migration(&m).unwrap();
        backend.revert_migration(&m).unwrap();
        backend.commit().unwrap();

        assert!(!backend.list_installed().unwrap().contains("users"));
    }

    #[test]
    fn test_revert_without_script_is_an_error() {
        let mut backend = bootstrapped();
        backend.begin().unwrap();
        let err = backend
            .revert_migration(&migration("oneway", "SELECT 1;", None))
            .unwrap_err();
        assert!(matches!(err, BackendError::MissingRevert(id) if id == "oneway"));
        backend.rollback().unwrap();
    }

    #[test]
    fn test_rollback_discards_apply_and_ledger_row() {
        let mut backend = bootstrapped();
        backend.begin().unwrap();
        backend
            .apply_migration(&migration(
                "gone",
                "CREATE TABLE gone (id INTEGER);",
                None,
            ))
            .unwrap();
        backend.rollback().unwrap();

        assert!(!backend.list_installed().unwrap().contains("gone"));
        let table_count: i64 = backend
            .conn
            .query_row(
                "SELECT COUNT(*) FROM sqlite_master WHERE type='table' AND name='gone'",
                [],
                |row| row.get(0),
            )
            .unwrap();
        assert_eq!(table_count, 0);
    }

    #[test]
    fn test_malformed_sql_surfaces_as_sql_error() {
        let mut backend = bootstrapped();
        backend.begin().unwrap();
        let err = backend
            .apply_migration(&migration("bad", "THIS IS NOT SQL;", None))
            .unwrap_err();
        assert!(matches!(err, BackendError::Sql(_)));
        backend.rollback().unwrap();
    }

    #[test]
    fn test_empty_apply_sql_is_a_noop() {
        let mut backend = bootstrapped();
        backend.begin().unwrap();
        backend.apply_migration(&migration("empty", "", None)).unwrap();
        backend.commit().unwrap();
        assert!(backend.list_installed().unwrap().contains("empty"));
    }
}
