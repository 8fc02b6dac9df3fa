//! stratum — dependency-aware SQL schema migrations.
//!
//! A thin dispatcher: parse a verb, hand it to the coordinator, format
//! whatever comes back. Exit codes: 0 on success, 1 for everything else
//! (usage, store, graph, not-found and database errors alike).

use std::path::{Path, PathBuf};
use std::process::ExitCode;

use anyhow::Result;
use clap::{Parser, Subcommand};
use colored::*;
use log::debug;

use stratum_core::backend::BackendError;
use stratum_core::coordinator::{Coordinator, CoordinatorError, CoordinatorResult};
use stratum_core::graph::DependencyGraph;
use stratum_core::store::Store;
use stratum_sqlite::SqliteBackend;

#[derive(Parser)]
#[command(name = "stratum", version, about = "Dependency-aware SQL schema migrations")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Create an empty migration file in the store
    New {
        store_path: PathBuf,
        migration_id: String,
    },
    /// Apply a migration and any missing dependencies
    Apply {
        store_path: PathBuf,
        db_path: PathBuf,
        migration_id: String,
    },
    /// Revert a migration and everything installed that depends on it
    Revert {
        store_path: PathBuf,
        db_path: PathBuf,
        migration_id: String,
    },
    /// Apply then revert a migration, rolling everything back at the end
    Test {
        store_path: PathBuf,
        db_path: PathBuf,
        migration_id: String,
    },
    /// Apply all pending migrations
    Upgrade {
        store_path: PathBuf,
        db_path: PathBuf,
    },
    /// List pending migrations without applying them
    #[command(name = "upgrade-list")]
    UpgradeList {
        store_path: PathBuf,
        db_path: PathBuf,
    },
}

fn main() -> ExitCode {
    env_logger::init();
    // clap's default error exit code is 2; the contract here is 1 for
    // every failure, so parse errors are printed and mapped by hand.
    let cli = match Cli::try_parse() {
        Ok(cli) => cli,
        Err(err) => {
            let _ = err.print();
            return ExitCode::from(1);
        }
    };
    match run(cli.command) {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            report(&err);
            ExitCode::from(1)
        }
    }
}

fn run(command: Command) -> Result<()> {
    match command {
        Command::New {
            store_path,
            migration_id,
        } => {
            let path = Store::new(store_path).create_new(&migration_id)?;
            println!("{} {}", "Created:".green(), path.display());
            Ok(())
        }
        Command::Apply {
            store_path,
            db_path,
            migration_id,
        } => with_coordinator(&store_path, &db_path, |c| c.apply(&migration_id)),
        Command::Revert {
            store_path,
            db_path,
            migration_id,
        } => with_coordinator(&store_path, &db_path, |c| c.revert(&migration_id)),
        Command::Test {
            store_path,
            db_path,
            migration_id,
        } => with_coordinator(&store_path, &db_path, |c| c.test(&migration_id)),
        Command::Upgrade {
            store_path,
            db_path,
        } => with_coordinator(&store_path, &db_path, |c| c.upgrade()),
        Command::UpgradeList {
            store_path,
            db_path,
        } => with_coordinator(&store_path, &db_path, |c| c.pending()),
    }
}

/// Shared preamble of every database-touching verb: load the store, build
/// the graph, open the session, bootstrap the ledger.
fn with_coordinator<F>(store_path: &Path, db_path: &Path, operation: F) -> Result<()>
where
    F: FnOnce(&mut Coordinator<SqliteBackend>) -> CoordinatorResult<()>,
{
    let migrations = Store::new(store_path).load_all()?;
    let graph = DependencyGraph::build(&migrations)?;
    debug!("store loaded, {} migrations", migrations.len());
    let backend = SqliteBackend::open(db_path)?;
    let mut coordinator = Coordinator::new(migrations, graph, backend)?;
    operation(&mut coordinator)?;
    Ok(())
}

/// Uniform error formatting. Database failures share one message shape;
/// everything else prints its own Display.
fn report(err: &anyhow::Error) {
    let backend_error = match err.downcast_ref::<CoordinatorError>() {
        Some(CoordinatorError::Backend(e)) => Some(e),
        Some(CoordinatorError::NotFound(_)) => None,
        None => err.downcast_ref::<BackendError>(),
    };
    match backend_error {
        Some(BackendError::Sql(msg)) | Some(BackendError::Connect(msg)) => {
            eprintln!("{} {}", "A database error occurred:".red(), msg);
        }
        Some(BackendError::MissingRevert(_)) | None => {
            eprintln!("{} {}", "Error:".red(), err);
        }
    }
}
