//! The step chain for the bundled application schema.
//!
//! Version 0 is an empty database. Each module below holds the step that
//! upgrades from the version in its name's predecessor.

mod sql;
mod v1_sessions;
mod v2_memory;
mod v3_message_channels;
mod v5_account_credentials;
mod v6_schema_meta;

pub use sql::SqlStep;

use upshift_common::Result;

use crate::migrations::{MigrationStep, StepRegistry};

/// Schema version this build upgrades stores to.
pub const CURRENT_VERSION: u32 = 6;

/// Build the registry of every historical step, keyed by "from" version.
pub fn registry() -> Result<StepRegistry> {
    StepRegistry::new()
        .with(|| Box::new(v1_sessions::SESSIONS) as Box<dyn MigrationStep>)?
        .with(|| Box::new(v2_memory::MEMORY_ENTRIES) as Box<dyn MigrationStep>)?
        .with(|| Box::new(v3_message_channels::MessageChannels) as Box<dyn MigrationStep>)?
        .with(|| Box::new(v5_account_credentials::AccountCredentials) as Box<dyn MigrationStep>)?
        .with(|| Box::new(v6_schema_meta::SchemaMeta) as Box<dyn MigrationStep>)
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::migrations::{MigrationEngine, NoHeartbeat};
    use crate::progress::ProgressLog;
    use crate::store::{SqliteStore, Store};
    use upshift_security::MemoryCredentialStore;

    #[test]
    fn chain_covers_every_version_up_to_current() {
        let registry = registry().unwrap();
        assert_eq!(registry.latest_version(), Some(CURRENT_VERSION));
        for start in [0, 1, 2, 3, 5] {
            assert!(registry.reaches(start, CURRENT_VERSION), "no path from {start}");
        }
        // 4 was skipped by the accounts rewrite.
        assert!(!registry.contains(4));
    }

    #[test]
    fn empty_database_upgrades_to_current() {
        let engine = MigrationEngine::new(Arc::new(registry().unwrap()))
            .with_credentials(Arc::new(MemoryCredentialStore::new()));
        let mut store = SqliteStore::in_memory().unwrap();
        let progress = ProgressLog::new();

        let outcome = engine.execute(&mut store, 0, CURRENT_VERSION, &progress, &NoHeartbeat);

        assert!(outcome.succeeded(), "{:?}", outcome.failure);
        assert_eq!(outcome.steps_applied, 5);
        assert_eq!(store.schema_version().unwrap(), CURRENT_VERSION);

        let tables: Vec<String> = store
            .query("SELECT name FROM sqlite_master WHERE type = 'table' ORDER BY name", &[])
            .unwrap()
            .into_iter()
            .filter_map(|row| row[0].as_str().map(str::to_string))
            .collect();
        for expected in ["accounts", "memory_entries", "messages", "schema_meta", "sessions"] {
            assert!(tables.iter().any(|t| t == expected), "missing {expected} in {tables:?}");
        }
        assert!(!tables.iter().any(|t| t.ends_with("_old")));
    }
}
