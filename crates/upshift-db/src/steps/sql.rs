use upshift_common::Result;

use crate::migrations::{MigrationStep, StepContext};

/// A step made only of static SQL.
///
/// Statements are separated by `;` and run one by one, so a failure names
/// the statement that broke.
#[derive(Debug, Clone, Copy)]
pub struct SqlStep {
    pub from: u32,
    pub to: u32,
    pub name: &'static str,
    pub sql: &'static str,
}

impl SqlStep {
    fn statements(&self) -> impl Iterator<Item = &'static str> {
        self.sql.split(';').map(str::trim).filter(|s| !s.is_empty())
    }
}

impl MigrationStep for SqlStep {
    fn from_version(&self) -> u32 {
        self.from
    }

    fn to_version(&self) -> u32 {
        self.to
    }

    fn title(&self) -> &str {
        self.name
    }

    fn apply(&self, ctx: &mut StepContext<'_>) -> Result<()> {
        for statement in self.statements() {
            ctx.execute_batch(statement)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::migrations::{NoHeartbeat, execute_step};
    use crate::progress::ProgressLog;
    use crate::store::{SqliteStore, Store};

    const TWO_TABLES: SqlStep = SqlStep {
        from: 0,
        to: 1,
        name: "two tables",
        sql: "
            CREATE TABLE a (id INTEGER);

            CREATE TABLE b (id INTEGER);
        ",
    };

    const SECOND_BREAKS: SqlStep = SqlStep {
        from: 0,
        to: 1,
        name: "second breaks",
        sql: "CREATE TABLE a (id INTEGER); CREATE INDEX idx_b ON b(id);",
    };

    #[test]
    fn splits_on_semicolons_and_skips_blanks() {
        assert_eq!(TWO_TABLES.statements().count(), 2);
    }

    #[test]
    fn failure_names_the_breaking_statement() {
        let mut store = SqliteStore::in_memory().unwrap();
        let progress = ProgressLog::new();
        let mut ctx = StepContext::new(&mut store, 0, &progress, &NoHeartbeat);

        let report = execute_step(&SECOND_BREAKS, &mut ctx);

        assert_eq!(report.reached_version, 0);
        let diagnostic = report.diagnostic.unwrap();
        assert!(diagnostic.ends_with("last statement: CREATE INDEX idx_b ON b(id)"), "{diagnostic}");
    }

    #[test]
    fn applies_every_statement() {
        let mut store = SqliteStore::in_memory().unwrap();
        let progress = ProgressLog::new();
        {
            let mut ctx = StepContext::new(&mut store, 0, &progress, &NoHeartbeat);
            assert_eq!(execute_step(&TWO_TABLES, &mut ctx).reached_version, 1);
        }
        let rows = store
            .query("SELECT count(*) FROM sqlite_master WHERE name IN ('a', 'b')", &[])
            .unwrap();
        assert_eq!(rows[0][0].as_i64(), Some(2));
    }
}
