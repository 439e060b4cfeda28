use std::sync::Arc;
use std::time::{Duration, Instant};

use thiserror::Error;
use tracing::{info, warn};
use upshift_security::CredentialStore;

use super::registry::StepRegistry;
use super::step::{Heartbeat, MigrationStep, StepContext, StepReport, execute_step};
use crate::progress::ProgressSink;
use crate::store::Store;

/// Why an upgrade run ended short of its target.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum UpgradeFailure {
    /// A step ran but left the version where it was.
    #[error("automatic upgrade stalled at version {version}: {diagnostic}")]
    Stalled { version: u32, diagnostic: String },

    /// No step is registered for `version` and the target is still ahead.
    #[error("automatic upgrade failed at version {version}: this build has no upgrade path to version {target}")]
    UnsupportedPath { version: u32, target: u32 },

    #[error("automatic upgrade overshot: reached version {version}, expected {target}")]
    Overshot { version: u32, target: u32 },

    #[error("store is at version {current}, newer than version {target} supported by this build")]
    Downgrade { current: u32, target: u32 },

    #[error("store error at version {version}: {message}")]
    Store { version: u32, message: String },
}

impl UpgradeFailure {
    /// The version the store was left at.
    pub fn version(&self) -> u32 {
        match self {
            UpgradeFailure::Stalled { version, .. }
            | UpgradeFailure::UnsupportedPath { version, .. }
            | UpgradeFailure::Overshot { version, .. }
            | UpgradeFailure::Store { version, .. } => *version,
            UpgradeFailure::Downgrade { current, .. } => *current,
        }
    }
}

/// Terminal result of one engine run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UpgradeOutcome {
    pub from_version: u32,
    pub reached_version: u32,
    pub target_version: u32,
    pub steps_applied: usize,
    pub failure: Option<UpgradeFailure>,
    pub duration: Duration,
}

impl UpgradeOutcome {
    /// A run that failed before any step could be attempted.
    pub fn aborted(from: u32, target: u32, failure: UpgradeFailure) -> Self {
        Self {
            from_version: from,
            reached_version: from,
            target_version: target,
            steps_applied: 0,
            failure: Some(failure),
            duration: Duration::ZERO,
        }
    }

    pub fn succeeded(&self) -> bool {
        self.failure.is_none()
    }

    pub fn summary(&self) -> String {
        match &self.failure {
            None => format!(
                "upgraded from version {} to {} in {} step(s)",
                self.from_version, self.reached_version, self.steps_applied
            ),
            Some(failure) => failure.to_string(),
        }
    }
}

/// Drives steps from a starting version toward a target, one at a time.
pub struct MigrationEngine {
    registry: Arc<StepRegistry>,
    credentials: Option<Arc<dyn CredentialStore>>,
    log_interval: Duration,
}

impl MigrationEngine {
    pub fn new(registry: Arc<StepRegistry>) -> Self {
        Self {
            registry,
            credentials: None,
            log_interval: Duration::from_secs(10),
        }
    }

    pub fn with_credentials(mut self, credentials: Arc<dyn CredentialStore>) -> Self {
        self.credentials = Some(credentials);
        self
    }

    pub fn with_log_interval(mut self, interval: Duration) -> Self {
        self.log_interval = interval;
        self
    }

    pub fn registry(&self) -> &StepRegistry {
        &self.registry
    }

    /// Apply steps until `store` is at `to`.
    ///
    /// Never retries: a stalled step ends the run, and the store stays at
    /// the version it stalled on.
    pub fn execute(
        &self,
        store: &mut dyn Store,
        from: u32,
        to: u32,
        progress: &dyn ProgressSink,
        heartbeat: &dyn Heartbeat,
    ) -> UpgradeOutcome {
        let started = Instant::now();
        let mut current = from;
        let mut steps_applied = 0;
        let mut failure = None;

        if from > to {
            failure = Some(UpgradeFailure::Downgrade {
                current: from,
                target: to,
            });
        }

        while failure.is_none() && current < to {
            let Some(step) = self.registry.lookup(current) else {
                break;
            };

            match store.schema_version() {
                Ok(actual) if actual == current => {}
                Ok(actual) => {
                    failure = Some(UpgradeFailure::Store {
                        version: current,
                        message: format!("store reports version {actual}, expected {current}"),
                    });
                    break;
                }
                Err(e) => {
                    failure = Some(UpgradeFailure::Store {
                        version: current,
                        message: e.to_string(),
                    });
                    break;
                }
            }

            progress.message(&format!("upgrading from version {current}: {}", step.title()));
            let report = self.run_step(store, step.as_ref(), current, progress, heartbeat);

            if report.reached_version <= current {
                failure = Some(UpgradeFailure::Stalled {
                    version: current,
                    diagnostic: report
                        .diagnostic
                        .unwrap_or_else(|| "step made no progress".to_string()),
                });
                break;
            }

            progress.step_completed(current, report.reached_version, step.title());
            steps_applied += 1;
            current = report.reached_version;
            if !heartbeat.beat() {
                warn!("upgrade lease could not be renewed after reaching version {current}");
            }
        }

        if failure.is_none() {
            if current < to {
                failure = Some(UpgradeFailure::UnsupportedPath {
                    version: current,
                    target: to,
                });
            } else if current > to {
                failure = Some(UpgradeFailure::Overshot {
                    version: current,
                    target: to,
                });
            }
        }

        let duration = started.elapsed();
        info!(
            from,
            reached = current,
            target = to,
            steps = steps_applied,
            "schema upgrade took {duration:?}"
        );

        UpgradeOutcome {
            from_version: from,
            reached_version: current,
            target_version: to,
            steps_applied,
            failure,
            duration,
        }
    }

    /// Run one step, inside a store transaction when the store supports it.
    fn run_step(
        &self,
        store: &mut dyn Store,
        step: &dyn MigrationStep,
        current: u32,
        progress: &dyn ProgressSink,
        heartbeat: &dyn Heartbeat,
    ) -> StepReport {
        let transactional = store.transactional_ddl();
        if transactional && let Err(e) = store.begin() {
            return StepReport::stalled(current, format!("failed to begin transaction: {e}"));
        }

        let report = {
            let mut ctx = StepContext::new(&mut *store, current, progress, heartbeat)
                .with_credentials(self.credentials.as_deref())
                .with_log_interval(self.log_interval);
            execute_step(step, &mut ctx)
        };

        if !transactional {
            return report;
        }

        if report.reached_version > current {
            if let Err(e) = store.commit() {
                if let Err(rollback) = store.rollback() {
                    warn!("rollback after failed commit also failed: {rollback}");
                }
                return StepReport::stalled(current, format!("failed to commit step: {e}"));
            }
        } else if let Err(e) = store.rollback() {
            warn!("failed to roll back stalled step at version {current}: {e}");
        }
        report
    }
}
