pub mod document_store;
pub mod postgres;

use crate::core::{Clock, Result};
use crate::work::{WorkAcquisitionOutcome, WorkItemRecord};
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;

pub use document_store::DocumentStoreWorkCoordinator;
pub use postgres::PostgresWorkCoordinator;

/// Lease-based assignment of work items to the workers of a fleet.
///
/// Every mutation of a work item goes through one of these operations; each is
/// atomic with respect to the item it touches. Implementations exist for a
/// document store (optimistic, compare-and-swap on a single document) and for
/// PostgreSQL (row locks inside a transaction). Both present the same contract,
/// so callers hold an `Arc<dyn WorkCoordinator>` built once at startup.
#[async_trait]
pub trait WorkCoordinator: Send + Sync {
    /// Identity recorded as `lease_holder_id` for leases this instance takes.
    fn worker_id(&self) -> &str;

    fn clock(&self) -> &Arc<dyn Clock>;

    /// Provision backend tables/indices. Idempotent.
    async fn setup(&self) -> Result<()>;

    /// Insert `work_item_id` unassigned. `Ok(false)` when it already existed.
    async fn create_unassigned_work_item(&self, work_item_id: &str) -> Result<bool>;

    /// Create the item already leased to this worker, or take over its lease
    /// once expired.
    async fn create_or_update_lease_for_work_item(
        &self,
        work_item_id: &str,
        lease_duration: Duration,
    ) -> Result<WorkAcquisitionOutcome>;

    /// Lease one random incomplete item whose lease has lapsed.
    async fn acquire_next_work_item(&self, lease_duration: Duration)
    -> Result<WorkAcquisitionOutcome>;

    /// Mark an item this worker holds as complete. Fails with
    /// `LeaseNotHeld` when the caller isn't the recorded holder.
    async fn complete_work_item(&self, work_item_id: &str) -> Result<()>;

    /// Create `successor_ids` unassigned and complete the parent, as one
    /// logical step.
    async fn create_successor_work_items_and_mark_complete(
        &self,
        work_item_id: &str,
        successor_ids: &[String],
        starting_lease_exponent: u32,
    ) -> Result<()>;

    async fn num_work_items_not_yet_complete(&self) -> Result<u64>;

    async fn work_items_are_pending(&self) -> Result<bool> {
        Ok(self.num_work_items_not_yet_complete().await? > 0)
    }

    /// Ids of every incomplete item, sorted.
    async fn pending_work_item_ids(&self) -> Result<Vec<String>>;

    /// Read-only snapshot of one item.
    async fn get_work_item(&self, work_item_id: &str) -> Result<Option<WorkItemRecord>>;
}

/// Validates a successor list before any write is issued.
pub(crate) fn check_successor_ids(parent_id: &str, successor_ids: &[String]) -> Result<()> {
    use crate::core::CoordinationError;

    if successor_ids.is_empty() {
        return Err(CoordinationError::Integrity(format!(
            "work item '{}' cannot be split into zero successors",
            parent_id
        )));
    }
    if successor_ids.iter().any(|id| id == parent_id) {
        return Err(CoordinationError::Integrity(format!(
            "work item '{}' cannot be its own successor",
            parent_id
        )));
    }
    Ok(())
}
