use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use tokio::runtime::{Builder, Runtime};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};
use upshift_common::{Error, Result};
use upshift_config::UpgradeConfig;
use upshift_db::{
    Heartbeat, MigrationEngine, ProgressSink, StepRegistry, Store, StoreOpener,
    TracingProgress, UpgradeFailure, UpgradeOutcome,
};
use upshift_security::CredentialStore;

use crate::clock::{Clock, SystemClock};
use crate::consistency::{ConsistencyChecker, SqliteConsistencyCheck};
use crate::lease::{LeasePolicy, UpgradeLease};
use crate::services::{AvailabilityFlag, ServiceAvailability};

const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

/// Who asked for an upgrade. `Restore` selects the blocking path.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Requestor {
    AppStart,
    User,
    Restore,
    /// Store-open machinery calling [`UpgradeCoordinator::on_upgrade`].
    StoreOpen,
}

impl Requestor {
    pub fn is_restore(&self) -> bool {
        matches!(self, Requestor::Restore)
    }
}

impl fmt::Display for Requestor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Requestor::AppStart => write!(f, "app start"),
            Requestor::User => write!(f, "user"),
            Requestor::Restore => write!(f, "restore"),
            Requestor::StoreOpen => write!(f, "store open"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpgradeState {
    Idle,
    /// A lease is reserved but no worker has picked the run up yet.
    LeasePending,
    Running,
    EndedSuccess,
    EndedFailure,
}

/// Why a trigger did nothing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkipReason {
    NotReady,
    AlreadyUpgrading,
    /// The previous run's result has not been acknowledged yet.
    Unacknowledged,
}

impl fmt::Display for SkipReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SkipReason::NotReady => write!(f, "coordinator is not ready"),
            SkipReason::AlreadyUpgrading => write!(f, "an upgrade is already running"),
            SkipReason::Unacknowledged => write!(f, "previous upgrade result not acknowledged"),
        }
    }
}

#[derive(Debug)]
pub enum TriggerResult {
    /// The run was scheduled on the worker pool.
    Started(UpgradeTicket),
    /// The restore path ran to completion before returning.
    Completed(UpgradeOutcome),
    Skipped(SkipReason),
}

impl TriggerResult {
    pub fn skip_reason(&self) -> Option<SkipReason> {
        match self {
            TriggerResult::Skipped(reason) => Some(*reason),
            _ => None,
        }
    }

    pub fn is_started(&self) -> bool {
        matches!(self, TriggerResult::Started(_))
    }
}

/// Handle on a scheduled upgrade run.
#[derive(Debug)]
pub struct UpgradeTicket {
    lease_id: u64,
    handle: JoinHandle<UpgradeOutcome>,
}

impl UpgradeTicket {
    pub fn lease_id(&self) -> u64 {
        self.lease_id
    }

    pub async fn wait(self) -> Result<UpgradeOutcome> {
        self.handle
            .await
            .map_err(|e| Error::Upgrade(format!("upgrade worker failed: {e}")))
    }

    /// Block the calling thread until the run completes.
    pub fn wait_blocking(self) -> Result<UpgradeOutcome> {
        futures::executor::block_on(self.wait())
    }
}

struct CoordinatorState {
    phase: UpgradeState,
    lease: Option<UpgradeLease>,
    next_lease_id: u64,
    ready: bool,
    last_outcome: Option<UpgradeOutcome>,
}

struct Shared {
    state: Mutex<CoordinatorState>,
    /// Held for the whole store-touching part of a run.
    execution: Mutex<()>,
    engine: MigrationEngine,
    opener: Arc<dyn StoreOpener>,
    target_version: u32,
    progress: Arc<dyn ProgressSink>,
    availability: Arc<dyn ServiceAvailability>,
    consistency: Arc<dyn ConsistencyChecker>,
    clock: Arc<dyn Clock>,
    policy: LeasePolicy,
    drain_delay: Duration,
}

struct LeaseHeartbeat<'a> {
    shared: &'a Shared,
    lease_id: u64,
}

impl Heartbeat for LeaseHeartbeat<'_> {
    fn beat(&self) -> bool {
        self.shared.renew(Some(self.lease_id))
    }
}

impl Shared {
    fn state(&self) -> MutexGuard<'_, CoordinatorState> {
        // Every update is a plain field assignment, so a poisoned guard is
        // still coherent.
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn try_acquire(&self, requestor: Requestor) -> std::result::Result<u64, SkipReason> {
        let mut guard = self.state();
        let state = &mut *guard;
        if !state.ready {
            return Err(SkipReason::NotReady);
        }

        let now = self.clock.now();
        match state.phase {
            UpgradeState::Idle => {}
            UpgradeState::EndedSuccess | UpgradeState::EndedFailure => {
                return Err(SkipReason::Unacknowledged);
            }
            UpgradeState::LeasePending | UpgradeState::Running => match &state.lease {
                Some(lease) if lease.is_valid(now) => return Err(SkipReason::AlreadyUpgrading),
                stale => warn!(
                    lease = stale.as_ref().map(|l| l.id),
                    "previous upgrade lease expired unrenewed, taking over"
                ),
            },
        }

        let id = state.next_lease_id;
        state.next_lease_id += 1;
        state.lease = Some(UpgradeLease::acquire(id, now, &self.policy));
        state.phase = UpgradeState::LeasePending;
        info!(lease = id, %requestor, "upgrade lease acquired");
        Ok(id)
    }

    fn release_unstarted(&self, lease_id: u64) {
        let mut guard = self.state();
        let state = &mut *guard;
        if state
            .lease
            .as_ref()
            .is_some_and(|l| l.id == lease_id && !l.started)
        {
            state.lease = None;
            state.phase = UpgradeState::Idle;
        }
    }

    fn begin(&self, lease_id: u64) -> bool {
        let now = self.clock.now();
        let mut guard = self.state();
        let state = &mut *guard;
        match state.lease.as_mut() {
            Some(lease) if lease.id == lease_id => {
                lease.start(now, &self.policy);
                state.phase = UpgradeState::Running;
                true
            }
            _ => false,
        }
    }

    /// Extend the running lease. `None` renews whichever lease is current.
    fn renew(&self, lease_id: Option<u64>) -> bool {
        let now = self.clock.now();
        let mut guard = self.state();
        let Some(lease) = guard.lease.as_mut() else {
            return false;
        };
        if lease_id.is_some_and(|id| id != lease.id) || !lease.started {
            return false;
        }
        let renewed = lease.renew(now, &self.policy);
        if renewed {
            debug!(lease = lease.id, remaining = ?lease.remaining(now), "upgrade lease renewed");
        } else {
            warn!(lease = lease.id, "upgrade lease reached its maximum lifetime");
        }
        renewed
    }

    /// Record the outcome if `lease_id` still owns the coordinator.
    fn finish(&self, lease_id: u64, outcome: &UpgradeOutcome) -> bool {
        let mut guard = self.state();
        let state = &mut *guard;
        if state.lease.as_ref().map(|l| l.id) != Some(lease_id) {
            warn!(lease = lease_id, "upgrade finished under a lease that was already replaced");
            return false;
        }
        state.lease = None;
        state.phase = if outcome.succeeded() {
            UpgradeState::EndedSuccess
        } else {
            UpgradeState::EndedFailure
        };
        state.last_outcome = Some(outcome.clone());
        true
    }

    fn abandon_pending(&self) {
        let mut guard = self.state();
        let state = &mut *guard;
        if state.phase == UpgradeState::LeasePending
            && let Some(lease) = state.lease.as_ref()
            && !lease.started
        {
            warn!(lease = lease.id, "dropping upgrade lease whose run never started");
            state.lease = None;
            state.phase = UpgradeState::Idle;
        }
    }

    fn aborted(&self, version: u32, message: impl Into<String>) -> UpgradeOutcome {
        UpgradeOutcome::aborted(
            version,
            self.target_version,
            UpgradeFailure::Store {
                version,
                message: message.into(),
            },
        )
    }

    /// Version currently recorded in the store, for failure reports.
    /// Falls back to 0 when the store cannot be read.
    fn stored_version(&self) -> u32 {
        match self.opener.open().and_then(|mut store| store.schema_version()) {
            Ok(version) => version,
            Err(e) => {
                warn!("could not read schema version of {}: {e}", self.opener.describe());
                0
            }
        }
    }

    /// Run `body` under `lease_id`. Services are unavailable for the whole
    /// run, and the outcome is recorded only if the lease was not replaced.
    fn guarded<V, F>(&self, lease_id: u64, requestor: Requestor, version: V, body: F) -> UpgradeOutcome
    where
        V: Fn() -> u32,
        F: FnOnce(&dyn Heartbeat) -> UpgradeOutcome,
    {
        let _exclusive = self.execution.lock().unwrap_or_else(PoisonError::into_inner);
        if !self.begin(lease_id) {
            warn!(lease = lease_id, "upgrade lease was replaced before its run started");
            return self.aborted(version(), "upgrade lease lost before the run started");
        }

        self.availability.mark_unavailable("schema upgrade in progress");
        self.progress
            .message(&format!("upgrade requested by {requestor}"));

        let heartbeat = LeaseHeartbeat {
            shared: self,
            lease_id,
        };
        let outcome = panic::catch_unwind(AssertUnwindSafe(|| body(&heartbeat))).unwrap_or_else(|_| {
            error!(lease = lease_id, "upgrade worker panicked");
            self.aborted(version(), "upgrade worker panicked")
        });

        self.progress.finished(&outcome);
        if !self.drain_delay.is_zero() {
            std::thread::sleep(self.drain_delay);
        }

        if self.finish(lease_id, &outcome) {
            self.availability.mark_available();
        }
        outcome
    }

    fn run(&self, lease_id: u64, requestor: Requestor) -> UpgradeOutcome {
        self.guarded(
            lease_id,
            requestor,
            || self.stored_version(),
            |heartbeat| self.migrate(heartbeat, !requestor.is_restore()),
        )
    }

    fn migrate(&self, heartbeat: &dyn Heartbeat, check_consistency: bool) -> UpgradeOutcome {
        let mut store = match self.opener.open() {
            Ok(store) => store,
            Err(e) => {
                return self.aborted(0, format!("failed to open {}: {e}", self.opener.describe()));
            }
        };
        let from = match store.schema_version() {
            Ok(version) => version,
            Err(e) => return self.aborted(0, format!("failed to read schema version: {e}")),
        };

        self.upgrade(store.as_mut(), from, self.target_version, heartbeat, check_consistency)
    }

    fn upgrade(
        &self,
        store: &mut dyn Store,
        from: u32,
        to: u32,
        heartbeat: &dyn Heartbeat,
        check_consistency: bool,
    ) -> UpgradeOutcome {
        if from == to {
            debug!("store already at version {to}");
        }
        let outcome = self
            .engine
            .execute(store, from, to, self.progress.as_ref(), heartbeat);

        if outcome.succeeded() && check_consistency {
            match self.consistency.check(store) {
                Ok(report) if report.is_clean() => {}
                Ok(report) => self.progress.message(&format!(
                    "consistency check repaired {} row(s), {} problem(s) remain",
                    report.repaired,
                    report.problems.len()
                )),
                Err(e) => warn!("consistency check failed: {e}"),
            }
        }
        outcome
    }
}

/// Builder for [`UpgradeCoordinator`].
pub struct CoordinatorBuilder {
    opener: Arc<dyn StoreOpener>,
    registry: Arc<StepRegistry>,
    target_version: u32,
    progress: Arc<dyn ProgressSink>,
    availability: Arc<dyn ServiceAvailability>,
    consistency: Arc<dyn ConsistencyChecker>,
    credentials: Option<Arc<dyn CredentialStore>>,
    clock: Arc<dyn Clock>,
}

impl CoordinatorBuilder {
    pub fn with_progress(mut self, progress: Arc<dyn ProgressSink>) -> Self {
        self.progress = progress;
        self
    }

    pub fn with_availability(mut self, availability: Arc<dyn ServiceAvailability>) -> Self {
        self.availability = availability;
        self
    }

    pub fn with_consistency(mut self, consistency: Arc<dyn ConsistencyChecker>) -> Self {
        self.consistency = consistency;
        self
    }

    pub fn with_credentials(mut self, credentials: Arc<dyn CredentialStore>) -> Self {
        self.credentials = Some(credentials);
        self
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn build(self, config: &UpgradeConfig) -> UpgradeCoordinator {
        let mut engine =
            MigrationEngine::new(self.registry).with_log_interval(config.progress_log_interval());
        if let Some(credentials) = self.credentials {
            engine = engine.with_credentials(credentials);
        }

        let shared = Shared {
            state: Mutex::new(CoordinatorState {
                phase: UpgradeState::Idle,
                lease: None,
                next_lease_id: 1,
                ready: false,
                last_outcome: None,
            }),
            execution: Mutex::new(()),
            engine,
            opener: self.opener,
            target_version: self.target_version,
            progress: self.progress,
            availability: self.availability,
            consistency: self.consistency,
            clock: self.clock,
            policy: LeasePolicy::from(&config.lease),
            drain_delay: config.drain_delay(),
        };

        UpgradeCoordinator {
            shared: Arc::new(shared),
            worker: Mutex::new(None),
            worker_threads: config.worker_threads.max(1),
        }
    }
}

/// The single entry point for upgrading a store.
///
/// Owns the upgrade lease and the worker pool. At most one run is in
/// flight; triggers that lose the race are no-ops and are not queued.
pub struct UpgradeCoordinator {
    shared: Arc<Shared>,
    worker: Mutex<Option<Runtime>>,
    worker_threads: usize,
}

impl UpgradeCoordinator {
    pub fn builder(
        opener: Arc<dyn StoreOpener>,
        registry: Arc<StepRegistry>,
        target_version: u32,
    ) -> CoordinatorBuilder {
        CoordinatorBuilder {
            opener,
            registry,
            target_version,
            progress: Arc::new(TracingProgress),
            availability: Arc::new(AvailabilityFlag::new()),
            consistency: Arc::new(SqliteConsistencyCheck),
            credentials: None,
            clock: Arc::new(SystemClock),
        }
    }

    /// Spin up the worker pool and begin accepting triggers.
    pub fn start(&self) -> Result<()> {
        let mut worker = self
            .worker
            .lock()
            .map_err(|_| Error::Upgrade("worker pool lock poisoned".into()))?;
        if worker.is_none() {
            let runtime = Builder::new_multi_thread()
                .worker_threads(self.worker_threads)
                .max_blocking_threads(self.worker_threads)
                .thread_name("upshift-upgrade")
                .enable_time()
                .build()?;
            *worker = Some(runtime);
        }
        self.shared.state().ready = true;
        info!(
            workers = self.worker_threads,
            target = self.shared.target_version,
            "upgrade coordinator started"
        );
        Ok(())
    }

    /// Stop accepting triggers and drain the worker pool.
    pub fn shutdown(&self) {
        self.shared.state().ready = false;
        let runtime = self
            .worker
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(runtime) = runtime {
            runtime.shutdown_timeout(SHUTDOWN_GRACE);
            info!("upgrade coordinator stopped");
        }
        self.shared.abandon_pending();
    }

    /// Ask for an upgrade to the target version.
    ///
    /// Returns immediately with a ticket, except for [`Requestor::Restore`],
    /// which blocks until the run is over so nothing else can touch the
    /// store first.
    pub fn trigger(&self, requestor: Requestor) -> TriggerResult {
        let lease_id = match self.shared.try_acquire(requestor) {
            Ok(id) => id,
            Err(reason) => {
                info!(%requestor, "upgrade trigger ignored: {reason}");
                return TriggerResult::Skipped(reason);
            }
        };

        let handle = {
            let worker = self.worker.lock().unwrap_or_else(PoisonError::into_inner);
            match worker.as_ref() {
                Some(runtime) => {
                    let shared = Arc::clone(&self.shared);
                    runtime.spawn_blocking(move || shared.run(lease_id, requestor))
                }
                None => {
                    self.shared.release_unstarted(lease_id);
                    return TriggerResult::Skipped(SkipReason::NotReady);
                }
            }
        };

        let ticket = UpgradeTicket { lease_id, handle };
        if !requestor.is_restore() {
            return TriggerResult::Started(ticket);
        }

        match ticket.wait_blocking() {
            Ok(outcome) => TriggerResult::Completed(outcome),
            Err(e) => {
                error!("restore upgrade did not complete: {e}");
                let version = self.shared.stored_version();
                TriggerResult::Completed(self.shared.aborted(version, e.to_string()))
            }
        }
    }

    /// Extend the current lease. Returns `false` if no run is in flight or
    /// the lease hit its maximum lifetime.
    pub fn heartbeat(&self) -> bool {
        self.shared.renew(None)
    }

    /// Run the engine against an already-open store on behalf of
    /// store-open machinery.
    ///
    /// Takes the lease and records the outcome like a trigger does, so it
    /// fails with [`Error::Upgrade`] when another upgrade holds the lease,
    /// when a previous result is unacknowledged, or when `to` is not reached.
    pub fn on_upgrade(&self, store: &mut dyn Store, from: u32, to: u32) -> Result<UpgradeOutcome> {
        let requestor = Requestor::StoreOpen;
        let lease_id = self
            .shared
            .try_acquire(requestor)
            .map_err(|reason| Error::Upgrade(format!("upgrade not started: {reason}")))?;

        let shared = &self.shared;
        let outcome = shared.guarded(
            lease_id,
            requestor,
            move || from,
            |heartbeat| shared.upgrade(store, from, to, heartbeat, true),
        );

        match &outcome.failure {
            None => Ok(outcome),
            Some(failure) => Err(Error::Upgrade(failure.to_string())),
        }
    }

    pub fn state(&self) -> UpgradeState {
        self.shared.state().phase
    }

    /// Whether a run holds a live lease. A run whose lease lapsed counts as
    /// abandoned.
    pub fn is_upgrading(&self) -> bool {
        let now = self.shared.clock.now();
        let state = self.shared.state();
        matches!(
            state.phase,
            UpgradeState::LeasePending | UpgradeState::Running
        ) && state.lease.as_ref().is_some_and(|lease| lease.is_valid(now))
    }

    pub fn is_upgrade_error(&self) -> bool {
        self.state() == UpgradeState::EndedFailure
    }

    pub fn lease(&self) -> Option<UpgradeLease> {
        self.shared.state().lease.clone()
    }

    pub fn last_outcome(&self) -> Option<UpgradeOutcome> {
        self.shared.state().last_outcome.clone()
    }

    pub fn target_version(&self) -> u32 {
        self.shared.target_version
    }

    /// Return a finished coordinator to `Idle`. Returns the state that was
    /// acknowledged, or `None` if nothing had finished.
    pub fn acknowledge(&self) -> Option<UpgradeState> {
        let mut state = self.shared.state();
        match state.phase {
            ended @ (UpgradeState::EndedSuccess | UpgradeState::EndedFailure) => {
                state.phase = UpgradeState::Idle;
                Some(ended)
            }
            _ => None,
        }
    }
}

impl Drop for UpgradeCoordinator {
    fn drop(&mut self) {
        let runtime = self
            .worker
            .get_mut()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(runtime) = runtime {
            runtime.shutdown_background();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use upshift_db::SqliteOpener;

    fn coordinator() -> UpgradeCoordinator {
        UpgradeCoordinator::builder(
            Arc::new(SqliteOpener::new("/nonexistent/never-opened.db")),
            Arc::new(StepRegistry::new()),
            1,
        )
        .build(&UpgradeConfig::default())
    }

    #[test]
    fn trigger_before_start_is_not_ready() {
        let coordinator = coordinator();
        let result = coordinator.trigger(Requestor::User);
        assert_eq!(result.skip_reason(), Some(SkipReason::NotReady));
        assert_eq!(coordinator.state(), UpgradeState::Idle);
        assert!(coordinator.lease().is_none());
    }

    #[test]
    fn heartbeat_without_run_is_refused() {
        let coordinator = coordinator();
        coordinator.start().unwrap();
        assert!(!coordinator.heartbeat());
        coordinator.shutdown();
    }

    #[test]
    fn acknowledge_only_clears_terminal_states() {
        let coordinator = coordinator();
        assert_eq!(coordinator.acknowledge(), None);

        coordinator.shared.state().phase = UpgradeState::EndedFailure;
        assert!(coordinator.is_upgrade_error());
        assert_eq!(coordinator.acknowledge(), Some(UpgradeState::EndedFailure));
        assert_eq!(coordinator.state(), UpgradeState::Idle);
    }

    #[test]
    fn lapsed_pending_lease_is_not_reported_as_upgrading() {
        let clock = Arc::new(crate::clock::ManualClock::new());
        let coordinator = UpgradeCoordinator::builder(
            Arc::new(SqliteOpener::new("/nonexistent/never-opened.db")),
            Arc::new(StepRegistry::new()),
            1,
        )
        .with_clock(clock.clone())
        .build(&UpgradeConfig::default());
        coordinator.shared.state().ready = true;

        coordinator.shared.try_acquire(Requestor::User).unwrap();
        assert!(coordinator.is_upgrading());

        clock.advance(Duration::from_secs(10));
        assert_eq!(coordinator.state(), UpgradeState::LeasePending);
        assert!(!coordinator.is_upgrading());
    }

    #[test]
    fn shutdown_drops_a_lease_whose_run_never_started() {
        let coordinator = coordinator();
        coordinator.start().unwrap();
        coordinator.shared.try_acquire(Requestor::AppStart).unwrap();
        assert_eq!(coordinator.state(), UpgradeState::LeasePending);

        coordinator.shutdown();

        assert_eq!(coordinator.state(), UpgradeState::Idle);
        assert!(coordinator.lease().is_none());
        assert!(!coordinator.is_upgrading());
    }

    #[test]
    fn requestor_display() {
        assert_eq!(Requestor::AppStart.to_string(), "app start");
        assert!(Requestor::Restore.is_restore());
        assert!(!Requestor::User.is_restore());
        assert_eq!(Requestor::StoreOpen.to_string(), "store open");
    }
}
