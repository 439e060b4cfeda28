use std::sync::atomic::{AtomicBool, Ordering};

use tracing::info;

/// Dependent services that must stay off the store while it is upgraded.
pub trait ServiceAvailability: Send + Sync {
    fn mark_unavailable(&self, reason: &str);

    fn mark_available(&self);
}

/// Availability as a single shared flag, for hosts that poll.
#[derive(Debug)]
pub struct AvailabilityFlag {
    available: AtomicBool,
}

impl AvailabilityFlag {
    pub fn new() -> Self {
        Self {
            available: AtomicBool::new(true),
        }
    }

    pub fn is_available(&self) -> bool {
        self.available.load(Ordering::SeqCst)
    }
}

impl Default for AvailabilityFlag {
    fn default() -> Self {
        Self::new()
    }
}

impl ServiceAvailability for AvailabilityFlag {
    fn mark_unavailable(&self, reason: &str) {
        info!("services unavailable: {reason}");
        self.available.store(false, Ordering::SeqCst);
    }

    fn mark_available(&self) {
        info!("services available");
        self.available.store(true, Ordering::SeqCst);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn flag_starts_available_and_toggles() {
        let flag = AvailabilityFlag::new();
        assert!(flag.is_available());
        flag.mark_unavailable("upgrading");
        assert!(!flag.is_available());
        flag.mark_available();
        assert!(flag.is_available());
    }
}
