pub mod clock;
pub mod consistency;
pub mod coordinator;
pub mod lease;
pub mod services;

pub use clock::{Clock, ManualClock, SystemClock};
pub use consistency::{
    ConsistencyChecker, ConsistencyReport, SkipConsistencyCheck, SqliteConsistencyCheck,
};
pub use coordinator::{
    CoordinatorBuilder, Requestor, SkipReason, TriggerResult, UpgradeCoordinator, UpgradeState,
    UpgradeTicket,
};
pub use lease::{LeasePolicy, UpgradeLease};
pub use services::{AvailabilityFlag, ServiceAvailability};
