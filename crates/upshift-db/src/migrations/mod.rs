//! Migration system for moving a store between schema versions.
//!
//! Each step is keyed by the version it upgrades from. The engine looks up
//! the step for the store's current version, runs it, and repeats until the
//! target is reached, a step stalls, or no step is registered.

mod engine;
mod registry;
mod step;

pub use engine::{MigrationEngine, UpgradeFailure, UpgradeOutcome};
pub use registry::{StepFactory, StepRegistry};
pub use step::{Heartbeat, MigrationStep, NoHeartbeat, StepContext, StepReport, execute_step};
