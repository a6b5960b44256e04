use crate::coordinator::WorkCoordinator;
use crate::core::{CoordinationError, Result};
use crate::watchdog::{LeaseExpirationWatchdog, LeaseGuard};
use crate::work::{AcquiredWorkItem, WorkAcquisitionOutcome};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// What to do with a leased item once processing returns.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ItemDisposition {
    Complete,
    Successors {
        ids: Vec<String>,
        starting_lease_exponent: u32,
    },
    /// Keep the lease and let it lapse; the item will be picked up again.
    LeaveLeased,
}

/// Returned by the processing closure of
/// [`ScopedWorkCoordinator::ensure_phase_completion`].
#[derive(Debug)]
pub struct WorkResult<T> {
    pub disposition: ItemDisposition,
    pub value: T,
}

impl<T> WorkResult<T> {
    pub fn complete(value: T) -> Self {
        Self {
            disposition: ItemDisposition::Complete,
            value,
        }
    }

    pub fn successors(ids: Vec<String>, starting_lease_exponent: u32, value: T) -> Self {
        Self {
            disposition: ItemDisposition::Successors {
                ids,
                starting_lease_exponent,
            },
            value,
        }
    }

    pub fn leave_leased(value: T) -> Self {
        Self {
            disposition: ItemDisposition::LeaveLeased,
            value,
        }
    }
}

#[derive(Debug, PartialEq, Eq)]
pub enum PhaseOutcome<T> {
    Processed { work_item_id: String, value: T },
    AlreadyCompleted,
    NoAvailableWork,
    LeaseLockHeldElsewhere,
}

/// How a phase obtains its lease.
#[derive(Debug, Clone, Copy)]
pub enum Acquisition<'a> {
    Next { lease_duration: Duration },
    Specific {
        work_item_id: &'a str,
        lease_duration: Duration,
    },
}

/// A lease handed to processing code, with the token that is cancelled when
/// the lease runs out.
#[derive(Debug, Clone)]
pub struct LeasedWorkItem {
    pub item: AcquiredWorkItem,
    pub cancellation: CancellationToken,
}

/// An acquisition outcome plus, when a lease was granted, the armed guard.
pub struct ScopedAcquisition {
    pub outcome: WorkAcquisitionOutcome,
    pub guard: Option<LeaseGuard>,
}

/// Binds a [`WorkCoordinator`] to a [`LeaseExpirationWatchdog`].
///
/// Leases come back with their watchdog already armed, and completing or
/// splitting consumes the [`LeaseGuard`], disarming it before the coordinator
/// is called.
pub struct ScopedWorkCoordinator {
    coordinator: Arc<dyn WorkCoordinator>,
    watchdog: LeaseExpirationWatchdog,
    tolerable_clock_skew: Duration,
}

impl ScopedWorkCoordinator {
    pub fn new(
        coordinator: Arc<dyn WorkCoordinator>,
        watchdog: LeaseExpirationWatchdog,
        tolerable_clock_skew: Duration,
    ) -> Self {
        Self {
            coordinator,
            watchdog,
            tolerable_clock_skew,
        }
    }

    pub fn coordinator(&self) -> &Arc<dyn WorkCoordinator> {
        &self.coordinator
    }

    fn arm(&self, outcome: WorkAcquisitionOutcome) -> ScopedAcquisition {
        let guard = outcome.acquired().map(|item| {
            self.watchdog.arm_with_margin(
                &item.work_item_id,
                item.lease_expiry,
                self.tolerable_clock_skew,
            )
        });
        ScopedAcquisition { outcome, guard }
    }

    pub async fn acquire_next_work_item(&self, lease_duration: Duration) -> Result<ScopedAcquisition> {
        let outcome = self.coordinator.acquire_next_work_item(lease_duration).await?;
        Ok(self.arm(outcome))
    }

    pub async fn create_or_update_lease_for_work_item(
        &self,
        work_item_id: &str,
        lease_duration: Duration,
    ) -> Result<ScopedAcquisition> {
        let outcome = self
            .coordinator
            .create_or_update_lease_for_work_item(work_item_id, lease_duration)
            .await?;
        Ok(self.arm(outcome))
    }

    pub async fn complete_work_item(&self, mut guard: LeaseGuard) -> Result<()> {
        guard.disarm();
        if guard.is_expired() {
            return Err(CoordinationError::LeaseExpired(guard.work_item_id().to_string()));
        }
        self.coordinator.complete_work_item(guard.work_item_id()).await
    }

    pub async fn create_successor_work_items_and_mark_complete(
        &self,
        mut guard: LeaseGuard,
        successor_ids: &[String],
        starting_lease_exponent: u32,
    ) -> Result<()> {
        guard.disarm();
        if guard.is_expired() {
            return Err(CoordinationError::LeaseExpired(guard.work_item_id().to_string()));
        }
        self.coordinator
            .create_successor_work_items_and_mark_complete(
                guard.work_item_id(),
                successor_ids,
                starting_lease_exponent,
            )
            .await
    }

    /// Runs one acquire → process → dispose cycle.
    ///
    /// `process` is dropped as soon as the lease expires; no further
    /// coordinator call is made for the item and `LeaseExpired` is returned.
    /// When `process` fails the lease is left to lapse.
    pub async fn ensure_phase_completion<T, F, Fut>(
        &self,
        acquisition: Acquisition<'_>,
        process: F,
    ) -> Result<PhaseOutcome<T>>
    where
        F: FnOnce(LeasedWorkItem) -> Fut,
        Fut: Future<Output = Result<WorkResult<T>>>,
    {
        let scoped = match acquisition {
            Acquisition::Next { lease_duration } => {
                self.acquire_next_work_item(lease_duration).await?
            }
            Acquisition::Specific {
                work_item_id,
                lease_duration,
            } => {
                self.create_or_update_lease_for_work_item(work_item_id, lease_duration)
                    .await?
            }
        };

        let (item, guard) = match (scoped.outcome, scoped.guard) {
            (WorkAcquisitionOutcome::Acquired(item), Some(guard)) => (item, guard),
            (WorkAcquisitionOutcome::AlreadyCompleted, _) => {
                return Ok(PhaseOutcome::AlreadyCompleted);
            }
            (WorkAcquisitionOutcome::LeaseLockHeldElsewhere, _) => {
                return Ok(PhaseOutcome::LeaseLockHeldElsewhere);
            }
            _ => return Ok(PhaseOutcome::NoAvailableWork),
        };

        let work_item_id = item.work_item_id.clone();
        let cancellation = guard.token();
        let leased = LeasedWorkItem {
            item,
            cancellation: cancellation.clone(),
        };

        let result = tokio::select! {
            result = process(leased) => result?,
            _ = cancellation.cancelled() => {
                warn!(work_item_id = %work_item_id, "Abandoning work item after its lease expired");
                return Err(CoordinationError::LeaseExpired(work_item_id));
            }
        };

        match result.disposition {
            ItemDisposition::Complete => self.complete_work_item(guard).await?,
            ItemDisposition::Successors {
                ids,
                starting_lease_exponent,
            } => {
                self.create_successor_work_items_and_mark_complete(
                    guard,
                    &ids,
                    starting_lease_exponent,
                )
                .await?
            }
            ItemDisposition::LeaveLeased => {
                info!(work_item_id = %work_item_id, "Leaving work item leased");
                drop(guard);
            }
        }

        Ok(PhaseOutcome::Processed {
            work_item_id,
            value: result.value,
        })
    }
}
