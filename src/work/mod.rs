pub mod item;
pub mod lease;
pub mod outcome;

pub use item::{ShardWorkItem, WorkItemRecord};
pub use lease::{MAX_LEASE_EXPONENT, lease_duration_for_exponent, lease_expiry_millis};
pub use outcome::{AcquiredWorkItem, WorkAcquisitionOutcome};
