//! Orchestration of store, graph and backend.
//!
//! Every operation shares the same preamble: the coordinator is built from
//! a loaded migration set and its validated graph, opens a transaction,
//! bootstraps the ledger and commits immediately. The eager commit means a
//! failure later in the invocation can never lose ledger initialization.
//! After the preamble each operation wraps all of its SQL effects in
//! exactly one transaction: it commits everything or nothing.

use std::fmt;

use colored::*;
use log::debug;

use crate::backend::{Backend, BackendError, BackendResult};
use crate::graph::DependencyGraph;
use crate::migration::MigrationSet;

/// Errors surfaced by coordinator operations.
#[derive(Debug)]
pub enum CoordinatorError {
    /// The named migration is not in the store.
    NotFound(String),
    /// A backend operation failed; the transaction has been rolled back.
    Backend(BackendError),
}

impl fmt::Display for CoordinatorError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CoordinatorError::NotFound(id) => {
                write!(f, "no migration named '{}' in the store", id)
            }
            CoordinatorError::Backend(e) => e.fmt(f),
        }
    }
}

impl std::error::Error for CoordinatorError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            CoordinatorError::Backend(e) => Some(e),
            CoordinatorError::NotFound(_) => None,
        }
    }
}

impl From<BackendError> for CoordinatorError {
    fn from(e: BackendError) -> Self {
        CoordinatorError::Backend(e)
    }
}

pub type CoordinatorResult<T> = Result<T, CoordinatorError>;

#[derive(Clone, Copy)]
enum Direction {
    Apply,
    Revert,
}

/// Drives migration plans against one backend session.
pub struct Coordinator<B: Backend> {
    migrations: MigrationSet,
    graph: DependencyGraph,
    backend: B,
}

impl<B: Backend> Coordinator<B> {
    /// Run the shared preamble: bootstrap the ledger and commit it.
    pub fn new(
        migrations: MigrationSet,
        graph: DependencyGraph,
        mut backend: B,
    ) -> CoordinatorResult<Self> {
        backend.begin()?;
        if let Err(e) = backend.bootstrap() {
            let _ = backend.rollback();
            return Err(e.into());
        }
        backend.commit()?;
        Ok(Self {
            migrations,
            graph,
            backend,
        })
    }

    /// Release the session; used by tests to inspect the database after
    /// the coordinator is done with it.
    pub fn into_backend(self) -> B {
        self.backend
    }

    /// Apply every migration not yet installed, in dependency order.
    pub fn upgrade(&mut self) -> CoordinatorResult<()> {
        let plan = self.pending_plan()?;
        if plan.is_empty() {
            println!("Database is up to date.");
            return Ok(());
        }
        debug!("upgrade plan: {:?}", plan);
        self.execute(&plan, Direction::Apply)
    }

    /// Apply the target and any of its dependencies that are missing.
    pub fn apply(&mut self, target: &str) -> CoordinatorResult<()> {
        let plan = self.apply_plan(target)?;
        if plan.is_empty() {
            println!("Migration '{}' is already installed.", target);
            return Ok(());
        }
        debug!("apply plan for '{}': {:?}", target, plan);
        self.execute(&plan, Direction::Apply)
    }

    /// Revert the target and everything installed that depends on it,
    /// most-dependent first.
    pub fn revert(&mut self, target: &str) -> CoordinatorResult<()> {
        self.check_known(target)?;
        let installed = self.backend.list_installed()?;
        let mut plan = self.graph.descendants(target);
        plan.push(target.to_string());
        plan.retain(|id| installed.contains(id));
        if plan.is_empty() {
            println!("Migration '{}' is not installed.", target);
            return Ok(());
        }
        debug!("revert plan for '{}': {:?}", target, plan);
        self.execute(&plan, Direction::Revert)
    }

    /// Apply the target's plan, revert it again in reverse, then roll the
    /// whole transaction back: the database ends exactly as it began. This
    /// is the round-trip safety check for a migration's revert SQL.
    pub fn test(&mut self, target: &str) -> CoordinatorResult<()> {
        let plan = self.apply_plan(target)?;
        self.backend.begin()?;
        let mut applied = Vec::new();
        for id in &plan {
            if let Err(e) = self.step(id, Direction::Apply) {
                let _ = self.backend.rollback();
                return Err(e.into());
            }
            applied.push(id.clone());
        }
        for id in applied.iter().rev() {
            if let Err(e) = self.step(id, Direction::Revert) {
                let _ = self.backend.rollback();
                return Err(e.into());
            }
        }
        self.backend.rollback()?;
        println!("{}", "Successfully tested migrations.".green());
        Ok(())
    }

    /// Print the ids `upgrade` would apply, one per line, without applying
    /// anything.
    pub fn pending(&mut self) -> CoordinatorResult<()> {
        let plan = self.pending_plan()?;
        if plan.is_empty() {
            println!("Database is up to date.");
        } else {
            for id in &plan {
                println!("{}", id);
            }
        }
        Ok(())
    }

    fn check_known(&self, target: &str) -> CoordinatorResult<()> {
        if self.graph.contains(target) {
            Ok(())
        } else {
            Err(CoordinatorError::NotFound(target.to_string()))
        }
    }

    fn pending_plan(&mut self) -> CoordinatorResult<Vec<String>> {
        let installed = self.backend.list_installed()?;
        Ok(self
            .graph
            .topological_order()
            .into_iter()
            .filter(|id| !installed.contains(id))
            .collect())
    }

    fn apply_plan(&mut self, target: &str) -> CoordinatorResult<Vec<String>> {
        self.check_known(target)?;
        let installed = self.backend.list_installed()?;
        let mut plan = self.graph.ancestors(target);
        plan.push(target.to_string());
        plan.retain(|id| !installed.contains(id));
        Ok(plan)
    }

    /// Run a plan inside one transaction; roll back on the first failure.
    fn execute(&mut self, plan: &[String], direction: Direction) -> CoordinatorResult<()> {
        self.backend.begin()?;
        for id in plan {
            if let Err(e) = self.step(id, direction) {
                let _ = self.backend.rollback();
                return Err(e.into());
            }
        }
        if let Err(e) = self.backend.commit() {
            let _ = self.backend.rollback();
            return Err(e.into());
        }
        Ok(())
    }

    /// One migration, with its progress line.
    fn step(&mut self, id: &str, direction: Direction) -> BackendResult<()> {
        let migration = &self.migrations[id];
        let label = match direction {
            Direction::Apply => "Applying:",
            Direction::Revert => "Reverting:",
        };
        print!("{} {}... ", label.cyan(), id);
        let _ = std::io::Write::flush(&mut std::io::stdout());
        let result = match direction {
            Direction::Apply => self.backend.apply_migration(migration),
            Direction::Revert => self.backend.revert_migration(migration),
        };
        match result {
            Ok(()) => {
                println!("{}", "done.".green());
                Ok(())
            }
            Err(e) => {
                println!("{}", "failed.".red());
                Err(e)
            }
        }
    }
}
