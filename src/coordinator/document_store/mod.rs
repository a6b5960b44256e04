pub mod client;
pub mod http;
pub mod memory;

pub use client::{
    CreateResult, DocumentStoreClient, DocumentVersion, UpdateResult, VersionedDocument,
};
pub use http::HttpDocumentStoreClient;
pub use memory::InMemoryDocumentStore;

use super::{WorkCoordinator, check_successor_ids};
use crate::core::clock::millis_to_datetime;
use crate::core::{Clock, CoordinationError, Result};
use crate::work::{
    AcquiredWorkItem, WorkAcquisitionOutcome, WorkItemRecord, lease_expiry_millis,
};
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

/// How many eligible documents one acquisition round looks at.
const ACQUIRE_CANDIDATES_PER_ROUND: usize = 10;

/// Work coordinator over a store that only offers single-document atomicity.
///
/// Every state change is a compare-and-swap against the version read just
/// before it; losing a race shows up as `VersionConflict` and the operation
/// re-reads and re-decides. The only multi-document step is a split, which is
/// ordered so that a crash part-way leaves a recoverable parent rather than a
/// completed parent with missing successors:
///
/// 1. stamp `successorItemIds` on the (still incomplete) parent,
/// 2. create each successor (create-only, so repeats are harmless),
/// 3. set `completedAt` on the parent.
///
/// An acquirer that later finds a lapsed parent stuck between 1 and 3 replays
/// steps 2 and 3 before looking for real work.
pub struct DocumentStoreWorkCoordinator {
    client: Arc<dyn DocumentStoreClient>,
    worker_id: String,
    clock: Arc<dyn Clock>,
}

impl DocumentStoreWorkCoordinator {
    pub fn new(
        client: Arc<dyn DocumentStoreClient>,
        worker_id: impl Into<String>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            client,
            worker_id: worker_id.into(),
            clock,
        }
    }

    fn acquired(&self, record: &WorkItemRecord) -> WorkAcquisitionOutcome {
        WorkAcquisitionOutcome::Acquired(AcquiredWorkItem {
            work_item_id: record.id.clone(),
            lease_expiry: millis_to_datetime(record.lease_expiry),
            lease_exponent: record.lease_exponent.saturating_sub(1),
        })
    }

    /// The record after this worker takes a fresh lease on it.
    fn leased_to_me(&self, record: &WorkItemRecord, now: i64, base: Duration) -> WorkItemRecord {
        let mut leased = record.clone();
        leased.lease_holder_id = Some(self.worker_id.clone());
        leased.lease_expiry = lease_expiry_millis(now, base, record.lease_exponent);
        leased.lease_exponent = record.lease_exponent.saturating_add(1);
        leased
    }

    /// Steps 2 and 3 of a split for a parent whose successors are already
    /// stamped. Returns `false` when the parent changed underneath us.
    async fn finish_split(
        &self,
        parent: &VersionedDocument,
        starting_lease_exponent: u32,
    ) -> Result<bool> {
        let successor_ids = parent.record.successor_item_ids.clone().unwrap_or_default();
        for successor_id in &successor_ids {
            let successor = WorkItemRecord::unassigned(successor_id.as_str(), &self.worker_id)
                .with_lease_exponent(starting_lease_exponent);
            if self.client.create_document(&successor).await? == CreateResult::AlreadyExists {
                debug!(work_item_id = %successor_id, "Successor already existed");
            }
        }

        let mut completed = parent.record.clone();
        completed.completed_at = Some(self.clock.now_millis());
        match self.client.conditional_update(&completed, parent.version).await? {
            UpdateResult::Updated(_) => Ok(true),
            UpdateResult::VersionConflict => self.write_landed(&completed).await,
        }
    }

    async fn recover_interrupted_split(&self, parent: &VersionedDocument) -> Result<()> {
        warn!(
            work_item_id = %parent.record.id,
            successors = ?parent.record.successor_item_ids,
            worker_id = %self.worker_id,
            "Found incomplete work item that already lists successors; finishing its split"
        );
        if !self
            .finish_split(parent, parent.record.lease_exponent)
            .await?
        {
            debug!(work_item_id = %parent.record.id, "Interrupted split was finished elsewhere");
        }
        Ok(())
    }

    /// A conditional write reported a conflict. When the client replayed a
    /// write whose first attempt was applied, the stored record is exactly
    /// what we sent; anything else means another writer got there first.
    async fn write_landed(&self, written: &WorkItemRecord) -> Result<bool> {
        let landed = self
            .client
            .get_document(&written.id)
            .await?
            .is_some_and(|current| current.record == *written);
        if landed {
            debug!(work_item_id = %written.id, "Conflict was a replay of our own write");
        }
        Ok(landed)
    }

    async fn load(&self, work_item_id: &str) -> Result<VersionedDocument> {
        self.client.get_document(work_item_id).await?.ok_or_else(|| {
            CoordinationError::Integrity(format!("work item '{}' does not exist", work_item_id))
        })
    }
}

#[async_trait]
impl WorkCoordinator for DocumentStoreWorkCoordinator {
    fn worker_id(&self) -> &str {
        &self.worker_id
    }

    fn clock(&self) -> &Arc<dyn Clock> {
        &self.clock
    }

    async fn setup(&self) -> Result<()> {
        self.client.ensure_index().await
    }

    async fn create_unassigned_work_item(&self, work_item_id: &str) -> Result<bool> {
        let record = WorkItemRecord::unassigned(work_item_id, &self.worker_id);
        let created = self.client.create_document(&record).await? == CreateResult::Created;
        debug!(work_item_id = %work_item_id, created, "Created unassigned work item");
        Ok(created)
    }

    async fn create_or_update_lease_for_work_item(
        &self,
        work_item_id: &str,
        lease_duration: Duration,
    ) -> Result<WorkAcquisitionOutcome> {
        loop {
            let now = self.clock.now_millis();
            let Some(existing) = self.client.get_document(work_item_id).await? else {
                let fresh = self.leased_to_me(
                    &WorkItemRecord::unassigned(work_item_id, &self.worker_id),
                    now,
                    lease_duration,
                );
                match self.client.create_document(&fresh).await? {
                    CreateResult::Created => return Ok(self.acquired(&fresh)),
                    // Lost the creation race; decide again from what the winner wrote.
                    CreateResult::AlreadyExists => continue,
                }
            };

            let record = &existing.record;
            if record.is_completed() {
                return Ok(WorkAcquisitionOutcome::AlreadyCompleted);
            }
            if record.is_held_by(&self.worker_id, now) {
                return Ok(self.acquired(record));
            }
            if !record.is_lease_expired(now) {
                return Ok(WorkAcquisitionOutcome::LeaseLockHeldElsewhere);
            }

            let leased = self.leased_to_me(record, now, lease_duration);
            match self.client.conditional_update(&leased, existing.version).await? {
                UpdateResult::Updated(_) => return Ok(self.acquired(&leased)),
                UpdateResult::VersionConflict if self.write_landed(&leased).await? => {
                    return Ok(self.acquired(&leased));
                }
                UpdateResult::VersionConflict => continue,
            }
        }
    }

    async fn acquire_next_work_item(
        &self,
        lease_duration: Duration,
    ) -> Result<WorkAcquisitionOutcome> {
        loop {
            let now = self.clock.now_millis();
            let candidates = self
                .client
                .search_acquirable(now, ACQUIRE_CANDIDATES_PER_ROUND)
                .await?;
            if candidates.is_empty() {
                return Ok(WorkAcquisitionOutcome::NoAvailableWork);
            }

            for candidate in candidates {
                if candidate.record.is_completed() {
                    continue;
                }
                if candidate.record.has_pending_successors() {
                    self.recover_interrupted_split(&candidate).await?;
                    continue;
                }

                let leased = self.leased_to_me(&candidate.record, now, lease_duration);
                let won = match self
                    .client
                    .conditional_update(&leased, candidate.version)
                    .await?
                {
                    UpdateResult::Updated(_) => true,
                    UpdateResult::VersionConflict => self.write_landed(&leased).await?,
                };
                if !won {
                    debug!(work_item_id = %leased.id, "Lost acquisition race");
                    continue;
                }

                info!(
                    work_item_id = %leased.id,
                    worker_id = %self.worker_id,
                    lease_expiry = leased.lease_expiry,
                    lease_exponent = leased.lease_exponent,
                    "Acquired work item"
                );
                return Ok(self.acquired(&leased));
            }
        }
    }

    async fn complete_work_item(&self, work_item_id: &str) -> Result<()> {
        loop {
            let current = self.load(work_item_id).await?;
            let record = &current.record;
            if record.is_completed() || record.lease_holder_id.as_deref() != Some(self.worker_id.as_str())
            {
                return Err(CoordinationError::lease_not_held(
                    work_item_id,
                    &self.worker_id,
                ));
            }

            let mut completed = record.clone();
            completed.completed_at = Some(self.clock.now_millis());
            match self
                .client
                .conditional_update(&completed, current.version)
                .await?
            {
                UpdateResult::VersionConflict if !self.write_landed(&completed).await? => continue,
                UpdateResult::Updated(_) | UpdateResult::VersionConflict => {
                    info!(work_item_id = %work_item_id, worker_id = %self.worker_id, "Completed work item");
                    return Ok(());
                }
            }
        }
    }

    async fn create_successor_work_items_and_mark_complete(
        &self,
        work_item_id: &str,
        successor_ids: &[String],
        starting_lease_exponent: u32,
    ) -> Result<()> {
        check_successor_ids(work_item_id, successor_ids)?;

        loop {
            let current = self.load(work_item_id).await?;
            let record = &current.record;

            if let Some(existing) = &record.successor_item_ids {
                if existing.as_slice() != successor_ids {
                    return Err(CoordinationError::Integrity(format!(
                        "work item '{}' already lists successors {:?}",
                        work_item_id, existing
                    )));
                }
                // Someone (possibly a recovering acquirer) already finished this split.
                if record.is_completed() {
                    return Ok(());
                }
            }
            if record.is_completed() || record.lease_holder_id.as_deref() != Some(self.worker_id.as_str())
            {
                return Err(CoordinationError::lease_not_held(
                    work_item_id,
                    &self.worker_id,
                ));
            }

            let stamped = if record.successor_item_ids.is_some() {
                current
            } else {
                let mut intent = record.clone();
                intent.successor_item_ids = Some(successor_ids.to_vec());
                match self.client.conditional_update(&intent, current.version).await? {
                    UpdateResult::Updated(version) => VersionedDocument {
                        record: intent,
                        version,
                    },
                    UpdateResult::VersionConflict => continue,
                }
            };

            if self.finish_split(&stamped, starting_lease_exponent).await? {
                info!(
                    work_item_id = %work_item_id,
                    successors = ?successor_ids,
                    worker_id = %self.worker_id,
                    "Split work item into successors"
                );
                return Ok(());
            }
        }
    }

    async fn num_work_items_not_yet_complete(&self) -> Result<u64> {
        self.client.count_incomplete().await
    }

    async fn pending_work_item_ids(&self) -> Result<Vec<String>> {
        self.client.list_incomplete_ids().await
    }

    async fn get_work_item(&self, work_item_id: &str) -> Result<Option<WorkItemRecord>> {
        Ok(self
            .client
            .get_document(work_item_id)
            .await?
            .map(|doc| doc.record))
    }
}
