use std::any::Any;
use std::panic::{self, AssertUnwindSafe};
use std::time::Duration;

use upshift_common::{Error, Result};
use upshift_security::CredentialStore;

use crate::progress::{LogThrottle, ProgressSink};
use crate::store::{Row, SqlValue, Store};

/// One unit of schema change, from [`from_version`](Self::from_version) to
/// [`to_version`](Self::to_version).
///
/// `apply` issues its statements through the [`StepContext`]. It does not
/// write the new version itself: once `apply` returns `Ok`, the runner
/// persists `to_version` inside the same transaction as the step's writes.
pub trait MigrationStep: Send {
    fn from_version(&self) -> u32;

    fn to_version(&self) -> u32;

    fn title(&self) -> &str;

    fn apply(&self, ctx: &mut StepContext<'_>) -> Result<()>;
}

/// Lets a long-running step keep its upgrade lease alive.
pub trait Heartbeat: Send + Sync {
    /// Returns `false` when the lease could not be extended (expired, or
    /// already replaced by a newer one).
    fn beat(&self) -> bool;
}

/// Heartbeat for runs that are not lease-guarded.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoHeartbeat;

impl Heartbeat for NoHeartbeat {
    fn beat(&self) -> bool {
        true
    }
}

/// What the engine learns from running one step.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StepReport {
    pub reached_version: u32,
    pub diagnostic: Option<String>,
}

impl StepReport {
    pub fn advanced(to: u32) -> Self {
        Self {
            reached_version: to,
            diagnostic: None,
        }
    }

    pub fn stalled(at: u32, diagnostic: impl Into<String>) -> Self {
        Self {
            reached_version: at,
            diagnostic: Some(diagnostic.into()),
        }
    }
}

/// Everything a step may touch while it runs.
///
/// Every statement passes through here so the last one attempted can be
/// quoted when the step fails.
pub struct StepContext<'a> {
    store: &'a mut dyn Store,
    from_version: u32,
    progress: &'a dyn ProgressSink,
    heartbeat: &'a dyn Heartbeat,
    credentials: Option<&'a dyn CredentialStore>,
    log_interval: Duration,
    last_statement: Option<String>,
}

impl<'a> StepContext<'a> {
    pub fn new(
        store: &'a mut dyn Store,
        from_version: u32,
        progress: &'a dyn ProgressSink,
        heartbeat: &'a dyn Heartbeat,
    ) -> Self {
        Self {
            store,
            from_version,
            progress,
            heartbeat,
            credentials: None,
            log_interval: Duration::from_secs(10),
            last_statement: None,
        }
    }

    pub fn with_credentials(mut self, credentials: Option<&'a dyn CredentialStore>) -> Self {
        self.credentials = credentials;
        self
    }

    pub fn with_log_interval(mut self, interval: Duration) -> Self {
        self.log_interval = interval;
        self
    }

    pub fn from_version(&self) -> u32 {
        self.from_version
    }

    pub fn execute(&mut self, sql: &str, params: &[SqlValue]) -> Result<usize> {
        self.last_statement = Some(sql.to_string());
        self.store.execute(sql, params)
    }

    pub fn execute_batch(&mut self, sql: &str) -> Result<()> {
        self.last_statement = Some(sql.to_string());
        self.store.execute_batch(sql)
    }

    pub fn query(&mut self, sql: &str, params: &[SqlValue]) -> Result<Vec<Row>> {
        self.last_statement = Some(sql.to_string());
        self.store.query(sql, params)
    }

    pub fn table_exists(&mut self, name: &str) -> Result<bool> {
        let rows = self.query(
            "SELECT 1 FROM sqlite_master WHERE type = 'table' AND name = ?1",
            &[name.into()],
        )?;
        Ok(!rows.is_empty())
    }

    pub fn set_version(&mut self, version: u32) -> Result<()> {
        self.last_statement = Some(format!("set schema version {version}"));
        self.store.set_schema_version(version)
    }

    pub fn progress(&self) -> &dyn ProgressSink {
        self.progress
    }

    /// Extend the upgrade lease. Call this between batches of slow work.
    pub fn heartbeat(&self) -> bool {
        self.heartbeat.beat()
    }

    pub fn throttle(&self) -> LogThrottle {
        LogThrottle::new(self.log_interval)
    }

    pub fn credentials(&self) -> Result<&'a dyn CredentialStore> {
        self.credentials
            .ok_or_else(|| Error::Credential("no credential store attached to this upgrade".into()))
    }

    pub fn has_credentials(&self) -> bool {
        self.credentials.is_some()
    }

    pub fn last_statement(&self) -> Option<&str> {
        self.last_statement.as_deref()
    }

    fn diagnostic(&self, cause: &str) -> String {
        match &self.last_statement {
            Some(sql) => format!("{cause}; last statement: {}", sql.trim()),
            None => cause.to_string(),
        }
    }
}

/// Run one step and fold every way it can fail into a [`StepReport`].
///
/// Errors and panics both come back as "still at `from_version`" with a
/// diagnostic naming the last statement attempted.
pub fn execute_step(step: &dyn MigrationStep, ctx: &mut StepContext<'_>) -> StepReport {
    let from = ctx.from_version();
    let to = step.to_version();

    if to <= from {
        return StepReport::stalled(
            from,
            format!("step '{}' does not advance past version {from} (targets {to})", step.title()),
        );
    }

    let result = panic::catch_unwind(AssertUnwindSafe(|| -> Result<()> {
        step.apply(ctx)?;
        ctx.set_version(to)
    }));

    match result {
        Ok(Ok(())) => StepReport::advanced(to),
        Ok(Err(e)) => StepReport::stalled(from, ctx.diagnostic(&e.to_string())),
        Err(payload) => StepReport::stalled(
            from,
            ctx.diagnostic(&format!("step panicked: {}", panic_message(payload.as_ref()))),
        ),
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> &str {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s
    } else {
        "unknown panic"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::progress::ProgressLog;
    use crate::store::SqliteStore;
    use upshift_security::MemoryCredentialStore;

    struct CreateTable;

    impl MigrationStep for CreateTable {
        fn from_version(&self) -> u32 {
            1
        }
        fn to_version(&self) -> u32 {
            2
        }
        fn title(&self) -> &str {
            "create widgets"
        }
        fn apply(&self, ctx: &mut StepContext<'_>) -> Result<()> {
            ctx.execute_batch("CREATE TABLE widgets (id INTEGER PRIMARY KEY)")
        }
    }

    struct FailsMidway;

    impl MigrationStep for FailsMidway {
        fn from_version(&self) -> u32 {
            1
        }
        fn to_version(&self) -> u32 {
            2
        }
        fn title(&self) -> &str {
            "fails midway"
        }
        fn apply(&self, ctx: &mut StepContext<'_>) -> Result<()> {
            ctx.execute_batch("CREATE TABLE ok_table (id INTEGER)")?;
            ctx.execute("INSERT INTO nowhere (id) VALUES (1)", &[])?;
            Ok(())
        }
    }

    struct Panics;

    impl MigrationStep for Panics {
        fn from_version(&self) -> u32 {
            1
        }
        fn to_version(&self) -> u32 {
            2
        }
        fn title(&self) -> &str {
            "panics"
        }
        fn apply(&self, ctx: &mut StepContext<'_>) -> Result<()> {
            ctx.execute_batch("CREATE TABLE before_panic (id INTEGER)")?;
            panic!("row 17 had an impossible value");
        }
    }

    fn store_at(version: u32) -> SqliteStore {
        let mut store = SqliteStore::in_memory().unwrap();
        store.set_schema_version(version).unwrap();
        store
    }

    #[test]
    fn successful_step_persists_its_target_version() {
        let mut store = store_at(1);
        let progress = ProgressLog::new();
        let report = {
            let mut ctx = StepContext::new(&mut store, 1, &progress, &NoHeartbeat);
            execute_step(&CreateTable, &mut ctx)
        };

        assert_eq!(report, StepReport::advanced(2));
        assert_eq!(store.schema_version().unwrap(), 2);
    }

    #[test]
    fn failing_statement_is_quoted_in_diagnostic() {
        let mut store = store_at(1);
        let progress = ProgressLog::new();
        let mut ctx = StepContext::new(&mut store, 1, &progress, &NoHeartbeat);
        let report = execute_step(&FailsMidway, &mut ctx);

        assert_eq!(report.reached_version, 1);
        let diagnostic = report.diagnostic.unwrap();
        assert!(diagnostic.contains("no such table"), "{diagnostic}");
        assert!(diagnostic.contains("INSERT INTO nowhere (id) VALUES (1)"), "{diagnostic}");
    }

    #[test]
    fn panic_is_contained_at_the_step_boundary() {
        let mut store = store_at(1);
        let progress = ProgressLog::new();
        let report = {
            let mut ctx = StepContext::new(&mut store, 1, &progress, &NoHeartbeat);
            execute_step(&Panics, &mut ctx)
        };

        assert_eq!(report.reached_version, 1);
        let diagnostic = report.diagnostic.unwrap();
        assert!(diagnostic.contains("row 17 had an impossible value"));
        assert!(diagnostic.contains("CREATE TABLE before_panic"));
        assert_eq!(store.schema_version().unwrap(), 1);
    }

    #[test]
    fn credentials_are_optional() {
        let mut store = store_at(1);
        let progress = ProgressLog::new();
        let ctx = StepContext::new(&mut store, 1, &progress, &NoHeartbeat);
        assert!(!ctx.has_credentials());
        assert!(matches!(ctx.credentials(), Err(Error::Credential(_))));

        let vault = MemoryCredentialStore::new();
        let mut store = store_at(1);
        let ctx = StepContext::new(&mut store, 1, &progress, &NoHeartbeat)
            .with_credentials(Some(&vault as &dyn CredentialStore));
        ctx.credentials().unwrap().set("acct", "k", "v").unwrap();
        assert_eq!(vault.get("acct", "k").unwrap().as_deref(), Some("v"));
    }
}
