//! Lease-based coordination of shard migration work across a fleet of
//! independent workers.
//!
//! Work items live in a shared store (an OpenSearch-compatible document store
//! or a PostgreSQL table). Workers lease one item at a time, and leases grow
//! exponentially each time an item has to be picked up again. A local watchdog
//! makes a worker stop before its lease can be handed to someone else.

pub mod config;
pub mod coordinator;
pub mod core;
pub mod driver;
pub mod pipeline;
pub mod preparer;
pub mod scoped;
pub mod watchdog;
pub mod work;
pub mod worker;

pub use config::{
    CoordinatorBackend, CoordinatorConfig, DocumentStoreSettings, PostgresSettings,
    build_coordinator,
};
pub use coordinator::{DocumentStoreWorkCoordinator, PostgresWorkCoordinator, WorkCoordinator};
pub use crate::core::{Clock, CoordinationError, ManualClock, Result, SkewedClock, SystemClock};
pub use driver::{DocumentsRunner, MigrationOutcome, MigrationSettings, ShardMigrationResult};
pub use preparer::{
    ShardPrepRetryPolicy, ShardSetupOutcome, ShardWorkPreparer, confirm_shard_prep_is_complete,
};
pub use scoped::{ItemDisposition, ScopedWorkCoordinator};
pub use watchdog::{LeaseExpirationWatchdog, LeaseGuard};
pub use work::{AcquiredWorkItem, ShardWorkItem, WorkAcquisitionOutcome, WorkItemRecord};
pub use worker::{WorkerOutcome, exit_code_for_error, run_worker};
