use crate::core::{CoordinationError, Result};
use crate::pipeline::{ShardMetadataProvider, filter_indices};
use crate::scoped::{Acquisition, PhaseOutcome, ScopedWorkCoordinator, WorkResult};
use crate::work::ShardWorkItem;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Work item guarding the one-time enumeration of shards.
pub const SHARD_SETUP_WORK_ITEM_ID: &str = "shard_setup";

pub const SHARD_SETUP_LEASE_DURATION: Duration = Duration::from_secs(60 * 60);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShardPrepState {
    NotStarted,
    Enumerating,
    Done,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShardSetupOutcome {
    /// This worker enumerated the shards.
    Enumerated { created: usize, already_existed: usize },
    /// Another worker finished enumeration earlier; `pending` is the number
    /// of incomplete items read back from the store afterwards.
    AlreadyComplete { pending: u64 },
    /// Another worker is enumerating right now.
    HeldElsewhere,
}

/// Creates one unassigned work item per selected (index, shard) pair.
///
/// Only the worker holding the `shard_setup` lease enumerates; work item
/// creation is idempotent, so a worker that dies mid-enumeration is simply
/// replaced by the next one to take the lease.
pub struct ShardWorkPreparer {
    metadata: Arc<dyn ShardMetadataProvider>,
    snapshot_name: String,
    index_allowlist: Vec<String>,
    state: ShardPrepState,
}

impl ShardWorkPreparer {
    pub fn new(
        metadata: Arc<dyn ShardMetadataProvider>,
        snapshot_name: impl Into<String>,
        index_allowlist: Vec<String>,
    ) -> Self {
        Self {
            metadata,
            snapshot_name: snapshot_name.into(),
            index_allowlist,
            state: ShardPrepState::NotStarted,
        }
    }

    pub fn state(&self) -> ShardPrepState {
        self.state
    }

    pub async fn run(&mut self, scoped: &ScopedWorkCoordinator) -> Result<ShardSetupOutcome> {
        let metadata = &self.metadata;
        let snapshot_name = self.snapshot_name.as_str();
        let allowlist = self.index_allowlist.as_slice();
        let state = &mut self.state;
        let coordinator = scoped.coordinator().clone();

        let outcome = scoped
            .ensure_phase_completion(
                Acquisition::Specific {
                    work_item_id: SHARD_SETUP_WORK_ITEM_ID,
                    lease_duration: SHARD_SETUP_LEASE_DURATION,
                },
                move |_leased| async move {
                    *state = ShardPrepState::Enumerating;
                    let indices = filter_indices(metadata.list_indices(snapshot_name).await?, allowlist);

                    let mut created = 0;
                    let mut already_existed = 0;
                    for index in &indices {
                        for shard_number in 0..index.number_of_shards {
                            let id = ShardWorkItem::new(index.name.as_str(), shard_number).to_string();
                            if coordinator.create_unassigned_work_item(&id).await? {
                                created += 1;
                            } else {
                                already_existed += 1;
                            }
                        }
                    }
                    info!(
                        snapshot = %snapshot_name,
                        indices = indices.len(),
                        created,
                        already_existed,
                        "Enumerated shard work items"
                    );
                    Ok::<_, CoordinationError>(WorkResult::complete((created, already_existed)))
                },
            )
            .await?;

        match outcome {
            PhaseOutcome::Processed {
                value: (created, already_existed),
                ..
            } => {
                self.state = ShardPrepState::Done;
                Ok(ShardSetupOutcome::Enumerated {
                    created,
                    already_existed,
                })
            }
            PhaseOutcome::AlreadyCompleted => {
                // The sentinel alone says nothing about the items; count them.
                let pending = scoped.coordinator().num_work_items_not_yet_complete().await?;
                self.state = ShardPrepState::Done;
                debug!(pending, "Shard setup was already completed");
                Ok(ShardSetupOutcome::AlreadyComplete { pending })
            }
            PhaseOutcome::LeaseLockHeldElsewhere => Ok(ShardSetupOutcome::HeldElsewhere),
            PhaseOutcome::NoAvailableWork => Err(CoordinationError::Integrity(format!(
                "lease on '{}' was neither granted nor refused",
                SHARD_SETUP_WORK_ITEM_ID
            ))),
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct ShardPrepRetryPolicy {
    pub initial_delay: Duration,
    /// Upper bound on a single wait; attempts are not bounded.
    pub max_delay: Duration,
}

impl Default for ShardPrepRetryPolicy {
    fn default() -> Self {
        Self {
            initial_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(5 * 60),
        }
    }
}

/// Runs the preparer until shard setup is known to be finished, waiting with
/// doubling delay while another worker holds the setup lease or the
/// coordination store is briefly unreachable.
pub async fn confirm_shard_prep_is_complete(
    preparer: &mut ShardWorkPreparer,
    scoped: &ScopedWorkCoordinator,
    policy: ShardPrepRetryPolicy,
) -> Result<ShardSetupOutcome> {
    let mut delay = policy.initial_delay;
    let mut attempt = 0u64;
    loop {
        match preparer.run(scoped).await {
            Ok(ShardSetupOutcome::HeldElsewhere) => {
                info!(
                    attempt,
                    delay_ms = delay.as_millis() as u64,
                    "Another worker holds the lock for setting up shard work items; waiting"
                );
            }
            Ok(outcome) => return Ok(outcome),
            Err(err) if err.is_transient() => {
                warn!(attempt, error = %err, "Shard setup failed, retrying");
            }
            Err(err) => return Err(err),
        }
        tokio::time::sleep(delay).await;
        delay = (delay * 2).min(policy.max_delay);
        attempt += 1;
    }
}
