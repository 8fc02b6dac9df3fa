//! Migration metadata and the loaded migration set.

use std::collections::{BTreeMap, BTreeSet};

use chrono::{DateTime, Utc};

/// Reserved id of the internal bootstrap migration.
///
/// The bootstrap migration is not a file in the store: it is injected into
/// every loaded [`MigrationSet`], and its real effect (creating the ledger
/// table and recording this id) lives in `Backend::bootstrap`, which every
/// session runs and commits before anything else. User migrations may
/// depend on it freely; it is always installed by the time a plan runs.
pub const BOOTSTRAP_ID: &str = "root";

/// A single schema migration: forward and backward SQL plus the ids it
/// depends on.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Migration {
    /// Unique within a store; equals the filename stem.
    pub id: String,
    /// Ids this migration requires to be applied first.
    pub depends: BTreeSet<String>,
    /// SQL executed to install.
    pub apply: String,
    /// SQL executed to uninstall; `None` makes the migration one-way.
    pub revert: Option<String>,
    /// Free-text, informational.
    pub description: String,
    /// Informational; `None` only for the synthetic bootstrap migration.
    pub created: Option<DateTime<Utc>>,
}

/// Every migration known to the store, keyed by id.
pub type MigrationSet = BTreeMap<String, Migration>;

/// The synthetic bootstrap migration.
pub fn bootstrap_migration() -> Migration {
    Migration {
        id: BOOTSTRAP_ID.to_string(),
        depends: BTreeSet::new(),
        apply: String::new(),
        revert: None,
        description: "install the migration ledger".to_string(),
        created: None,
    }
}

/// Check an id against the accepted syntax: ASCII alphanumerics, `_`, `-`.
///
/// Ids double as filename stems, so anything fancier (path separators,
/// dots, whitespace) is rejected outright.
pub fn valid_id(id: &str) -> bool {
    !id.is_empty()
        && id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
}
