//! Filesystem store: one file per migration, identified by its stem.

pub mod format;

use std::collections::BTreeMap;
use std::fmt;
use std::fs;
use std::io;
use std::path::PathBuf;

use chrono::Utc;
use log::debug;

use crate::migration::{bootstrap_migration, valid_id, Migration, MigrationSet, BOOTSTRAP_ID};

/// Filename extension of migration files.
pub const MIGRATION_EXTENSION: &str = "mig";

/// Errors from loading or writing the store.
#[derive(Debug)]
pub enum StoreError {
    /// Filesystem failure on the named path.
    Io { path: PathBuf, source: io::Error },
    /// A migration file failed to parse.
    Parse {
        id: String,
        line: usize,
        detail: String,
    },
    /// Two files resolved to the same migration id.
    DuplicateId(String),
    /// A file (or `new` target) uses the internal bootstrap id.
    ReservedId(String),
    /// A file stem (or `new` target) is not a legal migration id.
    InvalidId(String),
    /// A migration names a dependency that is not in the store.
    UnresolvedDependency { id: String, dep: String },
    /// `new` targeting an id that already has a file.
    Exists(String),
}

impl fmt::Display for StoreError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StoreError::Io { path, source } => {
                write!(f, "cannot access {}: {}", path.display(), source)
            }
            StoreError::Parse { id, line, detail } => {
                write!(f, "migration '{}': line {}: {}", id, line, detail)
            }
            StoreError::DuplicateId(id) => write!(f, "duplicate migration id '{}'", id),
            StoreError::ReservedId(id) => {
                write!(f, "'{}' is reserved for the internal bootstrap migration", id)
            }
            StoreError::InvalidId(id) => write!(f, "invalid migration id '{}'", id),
            StoreError::UnresolvedDependency { id, dep } => {
                write!(f, "migration '{}' depends on '{}', which is not in the store", id, dep)
            }
            StoreError::Exists(id) => write!(f, "migration '{}' already exists", id),
        }
    }
}

impl std::error::Error for StoreError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            StoreError::Io { source, .. } => Some(source),
            _ => None,
        }
    }
}

pub type StoreResult<T> = Result<T, StoreError>;

/// A directory of migration files.
pub struct Store {
    root: PathBuf,
}

impl Store {
    pub fn new<P: Into<PathBuf>>(root: P) -> Self {
        Self { root: root.into() }
    }

    /// The path a migration id maps to. Pure; the file need not exist.
    pub fn resolve(&self, id: &str) -> PathBuf {
        self.root.join(format!("{}.{}", id, MIGRATION_EXTENSION))
    }

    /// Load every migration in the store, inject the bootstrap migration,
    /// and verify the set is closed under `Depends`.
    pub fn load_all(&self) -> StoreResult<MigrationSet> {
        let mut set: MigrationSet = BTreeMap::new();
        set.insert(BOOTSTRAP_ID.to_string(), bootstrap_migration());

        let entries = fs::read_dir(&self.root).map_err(|e| StoreError::Io {
            path: self.root.clone(),
            source: e,
        })?;
        let mut paths = Vec::new();
        for entry in entries {
            let entry = entry.map_err(|e| StoreError::Io {
                path: self.root.clone(),
                source: e,
            })?;
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) == Some(MIGRATION_EXTENSION) {
                paths.push(path);
            }
        }
        paths.sort();

        for path in paths {
            let id = match path.file_stem().and_then(|s| s.to_str()) {
                Some(stem) => stem.to_string(),
                None => {
                    return Err(StoreError::InvalidId(
                        path.file_name()
                            .map(|n| n.to_string_lossy().into_owned())
                            .unwrap_or_default(),
                    ))
                }
            };
            if id == BOOTSTRAP_ID {
                return Err(StoreError::ReservedId(id));
            }
            if !valid_id(&id) {
                return Err(StoreError::InvalidId(id));
            }

            let text = fs::read_to_string(&path).map_err(|e| StoreError::Io {
                path: path.clone(),
                source: e,
            })?;
            let parsed = format::parse(&text).map_err(|e| StoreError::Parse {
                id: id.clone(),
                line: e.line,
                detail: e.detail,
            })?;

            let migration = Migration {
                id: id.clone(),
                depends: parsed.depends,
                apply: parsed.apply,
                revert: parsed.revert,
                description: parsed.description,
                created: Some(parsed.created),
            };
            if set.insert(id.clone(), migration).is_some() {
                return Err(StoreError::DuplicateId(id));
            }
        }

        // Closure check runs after every file has parsed, so a typo in one
        // dependency is reported as exactly that and not as a parse cascade.
        for (id, migration) in &set {
            for dep in &migration.depends {
                if !set.contains_key(dep) {
                    return Err(StoreError::UnresolvedDependency {
                        id: id.clone(),
                        dep: dep.clone(),
                    });
                }
            }
        }

        debug!(
            "loaded {} migrations from {}",
            set.len() - 1,
            self.root.display()
        );
        Ok(set)
    }

    /// Create a template file for a new migration. Fails if the id is
    /// syntactically invalid, reserved, or already present.
    pub fn create_new(&self, id: &str) -> StoreResult<PathBuf> {
        if id == BOOTSTRAP_ID {
            return Err(StoreError::ReservedId(id.to_string()));
        }
        if !valid_id(id) {
            return Err(StoreError::InvalidId(id.to_string()));
        }
        let path = self.resolve(id);
        if path.exists() {
            return Err(StoreError::Exists(id.to_string()));
        }
        fs::create_dir_all(&self.root).map_err(|e| StoreError::Io {
            path: self.root.clone(),
            source: e,
        })?;

        let template = Migration {
            id: id.to_string(),
            depends: Default::default(),
            apply: String::new(),
            revert: Some(String::new()),
            description: "(describe the migration here)".to_string(),
            created: Some(Utc::now()),
        };
        fs::write(&path, format::render(&template)).map_err(|e| StoreError::Io {
            path: path.clone(),
            source: e,
        })?;
        debug!("created migration template {}", path.display());
        Ok(path)
    }
}
