use std::time::{Duration, Instant};

use upshift_config::LeaseConfig;

/// Durations governing an [`UpgradeLease`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LeasePolicy {
    /// Lifetime of a reserved lease whose run has not started yet.
    pub initial: Duration,
    /// Extension granted when the run starts and on every heartbeat.
    pub renewal: Duration,
    /// Hard ceiling on a lease's lifetime, measured from acquisition.
    pub max_total: Duration,
}

impl From<&LeaseConfig> for LeasePolicy {
    fn from(config: &LeaseConfig) -> Self {
        Self {
            initial: config.initial(),
            renewal: config.renewal(),
            max_total: config.max_total(),
        }
    }
}

impl Default for LeasePolicy {
    fn default() -> Self {
        Self::from(&LeaseConfig::default())
    }
}

/// Permission to run exactly one upgrade.
///
/// Once `expires_at` passes without renewal the lease is considered
/// abandoned and a new trigger may take over.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UpgradeLease {
    pub id: u64,
    pub acquired_at: Instant,
    pub expires_at: Instant,
    /// Whether a worker actually began the run, as opposed to only
    /// reserving it.
    pub started: bool,
}

impl UpgradeLease {
    pub fn acquire(id: u64, now: Instant, policy: &LeasePolicy) -> Self {
        Self {
            id,
            acquired_at: now,
            expires_at: now + policy.initial.min(policy.max_total),
            started: false,
        }
    }

    pub fn is_valid(&self, now: Instant) -> bool {
        now < self.expires_at
    }

    pub fn start(&mut self, now: Instant, policy: &LeasePolicy) {
        self.started = true;
        self.renew(now, policy);
    }

    /// Push the expiry `policy.renewal` past `now`, capped at the lease's
    /// maximum lifetime. Returns `false` once the cap has been reached.
    pub fn renew(&mut self, now: Instant, policy: &LeasePolicy) -> bool {
        let ceiling = self.acquired_at + policy.max_total;
        if now >= ceiling {
            return false;
        }
        let candidate = (now + policy.renewal).min(ceiling);
        if candidate > self.expires_at {
            self.expires_at = candidate;
        }
        true
    }

    pub fn remaining(&self, now: Instant) -> Duration {
        self.expires_at.saturating_duration_since(now)
    }
}
