use std::sync::Mutex;
use std::time::{Duration, Instant};

use tracing::{error, info, warn};

use crate::migrations::UpgradeOutcome;

/// Receives human-readable progress while an upgrade runs.
pub trait ProgressSink: Send + Sync {
    fn message(&self, text: &str);

    /// A step moved the store from `from` to `to`.
    fn step_completed(&self, from: u32, to: u32, title: &str);

    /// Terminal signal for the whole run.
    fn finished(&self, outcome: &UpgradeOutcome);
}

/// Forwards progress to `tracing`.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingProgress;

impl ProgressSink for TracingProgress {
    fn message(&self, text: &str) {
        info!("{text}");
    }

    fn step_completed(&self, from: u32, to: u32, title: &str) {
        info!("upgraded {from} -> {to}: {title}");
    }

    fn finished(&self, outcome: &UpgradeOutcome) {
        match &outcome.failure {
            None => info!(
                "upgrade finished at version {} in {:?}",
                outcome.reached_version, outcome.duration
            ),
            Some(failure) => error!("upgrade failed: {failure}"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProgressEvent {
    Message(String),
    Step { from: u32, to: u32, title: String },
    Finished { success: bool, summary: String },
}

/// Keeps every progress event in memory, e.g. for a status screen.
#[derive(Debug, Default)]
pub struct ProgressLog {
    events: Mutex<Vec<ProgressEvent>>,
}

impl ProgressLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<ProgressEvent> {
        self.events.lock().map(|e| e.clone()).unwrap_or_default()
    }

    pub fn step_count(&self) -> usize {
        self.events()
            .iter()
            .filter(|e| matches!(e, ProgressEvent::Step { .. }))
            .count()
    }

    fn push(&self, event: ProgressEvent) {
        match self.events.lock() {
            Ok(mut events) => events.push(event),
            Err(_) => warn!("progress log lock poisoned, dropping event"),
        }
    }
}

impl ProgressSink for ProgressLog {
    fn message(&self, text: &str) {
        self.push(ProgressEvent::Message(text.to_string()));
    }

    fn step_completed(&self, from: u32, to: u32, title: &str) {
        self.push(ProgressEvent::Step {
            from,
            to,
            title: title.to_string(),
        });
    }

    fn finished(&self, outcome: &UpgradeOutcome) {
        self.push(ProgressEvent::Finished {
            success: outcome.succeeded(),
            summary: outcome.summary(),
        });
    }
}

/// Rate limiter for progress lines inside row loops.
///
/// The first call to [`ready`](Self::ready) always passes; after that at most
/// one call per `interval` does.
#[derive(Debug)]
pub struct LogThrottle {
    interval: Duration,
    last: Option<Instant>,
}

impl LogThrottle {
    pub fn new(interval: Duration) -> Self {
        Self {
            interval,
            last: None,
        }
    }

    pub fn ready(&mut self) -> bool {
        let now = Instant::now();
        match self.last {
            Some(last) if now.duration_since(last) < self.interval => false,
            _ => {
                self.last = Some(now);
                true
            }
        }
    }
}
