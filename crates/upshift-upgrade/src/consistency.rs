use tracing::{info, warn};
use upshift_common::Result;
use upshift_db::Store;

/// Findings of a post-upgrade consistency pass.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct ConsistencyReport {
    pub problems: Vec<String>,
    /// Rows removed or rewritten to restore consistency.
    pub repaired: usize,
}

impl ConsistencyReport {
    pub fn is_clean(&self) -> bool {
        self.problems.is_empty() && self.repaired == 0
    }
}

/// Detects, and where possible repairs, structural damage left by a
/// conversion. Runs once after a successful live upgrade.
pub trait ConsistencyChecker: Send + Sync {
    fn check(&self, store: &mut dyn Store) -> Result<ConsistencyReport>;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct SkipConsistencyCheck;

impl ConsistencyChecker for SkipConsistencyCheck {
    fn check(&self, _store: &mut dyn Store) -> Result<ConsistencyReport> {
        Ok(ConsistencyReport::default())
    }
}

/// SQLite integrity and foreign-key checks, plus removal of messages whose
/// session is gone.
#[derive(Debug, Default, Clone, Copy)]
pub struct SqliteConsistencyCheck;

impl SqliteConsistencyCheck {
    fn has_table(store: &mut dyn Store, name: &str) -> Result<bool> {
        let rows = store.query(
            "SELECT 1 FROM sqlite_master WHERE type = 'table' AND name = ?1",
            &[name.into()],
        )?;
        Ok(!rows.is_empty())
    }
}

impl ConsistencyChecker for SqliteConsistencyCheck {
    fn check(&self, store: &mut dyn Store) -> Result<ConsistencyReport> {
        let mut report = ConsistencyReport::default();

        for row in store.query("PRAGMA integrity_check", &[])? {
            match row.first().and_then(|v| v.as_str()) {
                Some("ok") => {}
                Some(problem) => report.problems.push(problem.to_string()),
                None => {}
            }
        }

        if Self::has_table(store, "messages")? && Self::has_table(store, "sessions")? {
            report.repaired += store.execute(
                "DELETE FROM messages WHERE session_id NOT IN (SELECT id FROM sessions)",
                &[],
            )?;
        }

        // table, rowid, parent, fkid
        for row in store.query("PRAGMA foreign_key_check", &[])? {
            let table = row.first().and_then(|v| v.as_str()).unwrap_or("?");
            let parent = row.get(2).and_then(|v| v.as_str()).unwrap_or("?");
            let rowid = row.get(1).and_then(|v| v.as_i64()).unwrap_or_default();
            report
                .problems
                .push(format!("{table} row {rowid} references missing {parent} row"));
        }

        if report.is_clean() {
            info!("consistency check found no problems");
        } else {
            warn!(
                problems = report.problems.len(),
                repaired = report.repaired,
                "consistency check finished with findings"
            );
        }
        Ok(report)
    }
}
