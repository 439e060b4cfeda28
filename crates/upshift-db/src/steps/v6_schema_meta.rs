use chrono::Utc;
use upshift_common::Result;

use crate::migrations::{MigrationStep, StepContext};

/// Records when the store was converted to the current layout. Nothing else
/// changes; the timestamp lands in the same transaction as the version.
pub struct SchemaMeta;

impl MigrationStep for SchemaMeta {
    fn from_version(&self) -> u32 {
        5
    }

    fn to_version(&self) -> u32 {
        6
    }

    fn title(&self) -> &str {
        "schema_meta"
    }

    fn apply(&self, ctx: &mut StepContext<'_>) -> Result<()> {
        ctx.execute_batch(
            "CREATE TABLE IF NOT EXISTS schema_meta (key TEXT PRIMARY KEY, value TEXT NOT NULL)",
        )?;
        ctx.execute(
            "INSERT OR REPLACE INTO schema_meta (key, value) VALUES ('converted_at', ?1)",
            &[Utc::now().to_rfc3339().into()],
        )?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::migrations::{NoHeartbeat, execute_step};
    use crate::progress::ProgressLog;
    use crate::steps::testing::store_at;
    use crate::store::Store;

    #[test]
    fn records_conversion_time_with_the_version() {
        let mut store = store_at(5);
        let progress = ProgressLog::new();
        {
            let mut ctx = StepContext::new(&mut store, 5, &progress, &NoHeartbeat);
            assert_eq!(execute_step(&SchemaMeta, &mut ctx).reached_version, 6);
        }

        assert_eq!(store.schema_version().unwrap(), 6);
        let rows = store
            .query("SELECT value FROM schema_meta WHERE key = 'converted_at'", &[])
            .unwrap();
        let stamp = rows[0][0].as_str().unwrap();
        assert!(chrono::DateTime::parse_from_rfc3339(stamp).is_ok());
    }
}
