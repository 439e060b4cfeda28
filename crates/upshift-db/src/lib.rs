pub mod migrations;
pub mod progress;
pub mod steps;
pub mod store;

pub use migrations::{
    Heartbeat, MigrationEngine, MigrationStep, NoHeartbeat, StepContext, StepRegistry, StepReport,
    UpgradeFailure, UpgradeOutcome,
};
pub use progress::{LogThrottle, ProgressEvent, ProgressLog, ProgressSink, TracingProgress};
pub use store::{Row, SqlValue, SqliteOpener, SqliteStore, Store, StoreOpener};
