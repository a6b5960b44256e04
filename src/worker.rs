use crate::core::{CoordinationError, Result};
use crate::driver::{DocumentsRunner, MigrationOutcome, ShardMigrationResult};
use crate::preparer::{ShardPrepRetryPolicy, ShardWorkPreparer, confirm_shard_prep_is_complete};
use tracing::info;

pub const EXIT_SHARD_MIGRATED: i32 = 0;
pub const EXIT_FATAL: i32 = 1;
pub const EXIT_LEASE_EXPIRED: i32 = 2;
pub const EXIT_NO_WORK_LEFT: i32 = 3;
pub const EXIT_SHARD_TOO_LARGE: i32 = 4;

/// How a single worker invocation ended without error.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WorkerOutcome {
    ShardMigrated {
        work_item_id: String,
        result: ShardMigrationResult,
    },
    /// Nothing is left for this worker to do; the supervisor can stop
    /// restarting workers once every item is complete.
    NoWorkLeft,
}

impl WorkerOutcome {
    pub fn exit_code(&self) -> i32 {
        match self {
            Self::ShardMigrated { .. } => EXIT_SHARD_MIGRATED,
            Self::NoWorkLeft => EXIT_NO_WORK_LEFT,
        }
    }
}

/// Exit code for a worker that stopped with `err`.
pub fn exit_code_for_error(err: &CoordinationError) -> i32 {
    match err {
        CoordinationError::LeaseExpired(_) => EXIT_LEASE_EXPIRED,
        CoordinationError::ShardTooLarge { .. } => EXIT_SHARD_TOO_LARGE,
        _ => EXIT_FATAL,
    }
}

/// One worker lifetime: provision the store, make sure shard work items
/// exist, then migrate at most one shard.
pub async fn run_worker(
    runner: &DocumentsRunner,
    preparer: &mut ShardWorkPreparer,
    prep_policy: ShardPrepRetryPolicy,
) -> Result<WorkerOutcome> {
    let scoped = runner.scoped();
    let coordinator = scoped.coordinator();

    coordinator.setup().await?;
    confirm_shard_prep_is_complete(preparer, scoped, prep_policy).await?;

    loop {
        if !coordinator.work_items_are_pending().await? {
            info!("No work items are pending; all work items have been processed");
            return Ok(WorkerOutcome::NoWorkLeft);
        }

        match runner.migrate_next_shard().await? {
            MigrationOutcome::Migrated {
                work_item_id,
                result,
            } => return Ok(WorkerOutcome::ShardMigrated {
                work_item_id,
                result,
            }),
            MigrationOutcome::NoAvailableWork => {
                info!("Work items are pending but all are leased by other workers");
                return Ok(WorkerOutcome::NoWorkLeft);
            }
            MigrationOutcome::AlreadyCompleted => continue,
        }
    }
}
