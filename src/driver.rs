use crate::coordinator::WorkCoordinator;
use crate::core::clock::to_chrono;
use crate::core::{Clock, CoordinationError, Result};
use crate::pipeline::{BulkSink, DocumentSource, ShardMetadataProvider, SourceDocument};
use crate::scoped::{Acquisition, LeasedWorkItem, PhaseOutcome, ScopedWorkCoordinator, WorkResult};
use crate::watchdog::LeaseExpirationWatchdog;
use crate::work::ShardWorkItem;
use futures::StreamExt;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};

pub const DEFAULT_MAX_SHARD_SIZE_BYTES: u64 = 80 * 1024 * 1024 * 1024;
pub const DEFAULT_MAX_BYTES_PER_BATCH: usize = 10 * 1024 * 1024;
pub const DEFAULT_INITIAL_LEASE_DURATION: Duration = Duration::from_secs(10 * 60);

/// Per-worker migration knobs.
#[derive(Debug, Clone)]
pub struct MigrationSettings {
    pub snapshot_name: String,

    /// Lease requested for a shard; doubled on every re-acquisition
    pub initial_lease_duration: Duration,

    /// Shards larger than this are refused with `ShardTooLarge`. The refused
    /// item stays leased to the refusing worker with its lease exponent
    /// already bumped, so no worker can retry it until that lease lapses,
    /// and the retry then gets a doubled lease.
    pub max_shard_size_bytes: u64,

    /// `None` leaves the document count per batch unbounded
    pub max_docs_per_batch: Option<usize>,

    pub max_bytes_per_batch: usize,

    /// When set, a shard whose lease is this close to expiring is handed off
    /// as a successor item at the next batch boundary.
    pub checkpoint_lead_time: Option<Duration>,
}

impl MigrationSettings {
    pub fn new(snapshot_name: &str) -> Self {
        Self {
            snapshot_name: snapshot_name.to_string(),
            initial_lease_duration: DEFAULT_INITIAL_LEASE_DURATION,
            max_shard_size_bytes: DEFAULT_MAX_SHARD_SIZE_BYTES,
            max_docs_per_batch: None,
            max_bytes_per_batch: DEFAULT_MAX_BYTES_PER_BATCH,
            checkpoint_lead_time: None,
        }
    }

    pub fn initial_lease_duration(mut self, duration: Duration) -> Self {
        self.initial_lease_duration = duration;
        self
    }

    /// See the field: a refused shard is only retried after its lease lapses.
    pub fn max_shard_size_bytes(mut self, max: u64) -> Self {
        self.max_shard_size_bytes = max;
        self
    }

    pub fn max_docs_per_batch(mut self, max: usize) -> Self {
        self.max_docs_per_batch = Some(max);
        self
    }

    pub fn max_bytes_per_batch(mut self, max: usize) -> Self {
        self.max_bytes_per_batch = max;
        self
    }

    pub fn checkpoint_lead_time(mut self, lead: Duration) -> Self {
        self.checkpoint_lead_time = Some(lead);
        self
    }

    pub fn validate(&self) -> Result<()> {
        if self.snapshot_name.is_empty() {
            return Err(CoordinationError::Config(
                "snapshot name cannot be empty".to_string(),
            ));
        }
        if self.initial_lease_duration.is_zero() {
            return Err(CoordinationError::Config(
                "initial lease duration must be > 0".to_string(),
            ));
        }
        if self.max_docs_per_batch == Some(0) || self.max_bytes_per_batch == 0 {
            return Err(CoordinationError::Config(
                "batch limits must be > 0".to_string(),
            ));
        }
        if let Some(lead) = self.checkpoint_lead_time {
            if lead >= self.initial_lease_duration {
                return Err(CoordinationError::Config(
                    "checkpoint lead time must be shorter than the initial lease".to_string(),
                ));
            }
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ShardMigrationResult {
    /// Every remaining document of the item was sent.
    Completed { documents: u64 },
    /// Sending stopped early; the rest continues as `successor_id`.
    Checkpointed {
        documents: u64,
        next_doc_number: u64,
        successor_id: String,
    },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MigrationOutcome {
    Migrated {
        work_item_id: String,
        result: ShardMigrationResult,
    },
    AlreadyCompleted,
    NoAvailableWork,
}

/// Migrates one leased shard per call: size check, stream documents from the
/// source, send them to the sink in batches, then complete or split the item.
pub struct DocumentsRunner {
    scoped: ScopedWorkCoordinator,
    metadata: Arc<dyn ShardMetadataProvider>,
    source: Arc<dyn DocumentSource>,
    sink: Arc<dyn BulkSink>,
    settings: MigrationSettings,
}

struct Batch {
    documents: Vec<SourceDocument>,
    bytes: usize,
}

impl Batch {
    fn new() -> Self {
        Self {
            documents: Vec::new(),
            bytes: 0,
        }
    }

    fn is_full_for(&self, next: &SourceDocument, settings: &MigrationSettings) -> bool {
        if self.documents.is_empty() {
            return false;
        }
        let docs_full = settings
            .max_docs_per_batch
            .is_some_and(|max| self.documents.len() >= max);
        let bytes_full = self.bytes + next.approximate_size() > settings.max_bytes_per_batch;
        docs_full || bytes_full
    }

    fn push(&mut self, document: SourceDocument) {
        self.bytes += document.approximate_size();
        self.documents.push(document);
    }
}

impl DocumentsRunner {
    pub fn new(
        scoped: ScopedWorkCoordinator,
        metadata: Arc<dyn ShardMetadataProvider>,
        source: Arc<dyn DocumentSource>,
        sink: Arc<dyn BulkSink>,
        settings: MigrationSettings,
    ) -> Self {
        Self {
            scoped,
            metadata,
            source,
            sink,
            settings,
        }
    }

    /// Builds the scoped coordinator from its parts.
    pub fn with_watchdog(
        coordinator: Arc<dyn WorkCoordinator>,
        watchdog: LeaseExpirationWatchdog,
        tolerable_clock_skew: Duration,
        metadata: Arc<dyn ShardMetadataProvider>,
        source: Arc<dyn DocumentSource>,
        sink: Arc<dyn BulkSink>,
        settings: MigrationSettings,
    ) -> Self {
        let scoped = ScopedWorkCoordinator::new(coordinator, watchdog, tolerable_clock_skew);
        Self::new(scoped, metadata, source, sink, settings)
    }

    pub fn scoped(&self) -> &ScopedWorkCoordinator {
        &self.scoped
    }

    pub fn settings(&self) -> &MigrationSettings {
        &self.settings
    }

    pub async fn migrate_next_shard(&self) -> Result<MigrationOutcome> {
        let outcome = self
            .scoped
            .ensure_phase_completion(
                Acquisition::Next {
                    lease_duration: self.settings.initial_lease_duration,
                },
                |leased| self.migrate_shard(leased),
            )
            .await?;

        Ok(match outcome {
            PhaseOutcome::Processed {
                work_item_id,
                value,
            } => MigrationOutcome::Migrated {
                work_item_id,
                result: value,
            },
            PhaseOutcome::AlreadyCompleted => MigrationOutcome::AlreadyCompleted,
            PhaseOutcome::NoAvailableWork | PhaseOutcome::LeaseLockHeldElsewhere => {
                MigrationOutcome::NoAvailableWork
            }
        })
    }

    fn clock(&self) -> &Arc<dyn Clock> {
        self.scoped.coordinator().clock()
    }

    fn checkpoint_due(&self, leased: &LeasedWorkItem) -> bool {
        let Some(lead) = self.settings.checkpoint_lead_time else {
            return false;
        };
        self.clock()
            .now()
            .checked_add_signed(to_chrono(lead))
            .is_none_or(|horizon| horizon >= leased.item.lease_expiry)
    }

    async fn migrate_shard(
        &self,
        leased: LeasedWorkItem,
    ) -> Result<WorkResult<ShardMigrationResult>> {
        let shard = ShardWorkItem::parse(&leased.item.work_item_id)?;
        info!(
            work_item_id = %leased.item.work_item_id,
            index = %shard.index_name,
            shard = shard.shard_number,
            starting_doc = shard.starting_doc_id,
            "Migrating documents"
        );

        let metadata = self
            .metadata
            .shard_metadata(&self.settings.snapshot_name, &shard.index_name, shard.shard_number)
            .await?;
        info!(size_bytes = metadata.total_size_bytes, "Shard size");
        if metadata.total_size_bytes > self.settings.max_shard_size_bytes {
            return Err(CoordinationError::ShardTooLarge {
                index_name: shard.index_name,
                shard_number: shard.shard_number,
                size_bytes: metadata.total_size_bytes,
                max_bytes: self.settings.max_shard_size_bytes,
            });
        }

        let mut documents = self
            .source
            .read_documents(
                &self.settings.snapshot_name,
                &shard.index_name,
                shard.shard_number,
                shard.starting_doc_id,
            )
            .await?;

        let mut batch = Batch::new();
        let mut sent = 0u64;
        while let Some(document) = documents.next().await {
            let document = document?;
            if batch.is_full_for(&document, &self.settings) {
                sent += self.flush(&shard.index_name, &mut batch).await?;

                if self.checkpoint_due(&leased) {
                    let successor = shard.successor_from(document.doc_number);
                    info!(
                        work_item_id = %leased.item.work_item_id,
                        successor = %successor,
                        documents = sent,
                        "Lease is close to expiring; handing the rest of the shard to a successor"
                    );
                    let successor_id = successor.to_string();
                    return Ok(WorkResult::successors(
                        vec![successor_id.clone()],
                        leased.item.lease_exponent,
                        ShardMigrationResult::Checkpointed {
                            documents: sent,
                            next_doc_number: document.doc_number,
                            successor_id,
                        },
                    ));
                }
            }
            batch.push(document);
        }
        sent += self.flush(&shard.index_name, &mut batch).await?;

        info!(
            work_item_id = %leased.item.work_item_id,
            documents = sent,
            "Docs migrated"
        );
        Ok(WorkResult::complete(ShardMigrationResult::Completed {
            documents: sent,
        }))
    }

    async fn flush(&self, index_name: &str, batch: &mut Batch) -> Result<u64> {
        if batch.documents.is_empty() {
            return Ok(0);
        }
        self.sink.send_batch(index_name, &batch.documents).await?;
        let count = batch.documents.len() as u64;
        debug!(index = %index_name, documents = count, bytes = batch.bytes, "Flushed batch");
        *batch = Batch::new();
        Ok(count)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn doc(n: u64, bytes: usize) -> SourceDocument {
        SourceDocument {
            id: n.to_string(),
            doc_number: n,
            source: json!({ "body": "x".repeat(bytes) }),
        }
    }

    #[test]
    fn test_batch_limits() {
        let settings = MigrationSettings::new("snap").max_docs_per_batch(2);
        let mut batch = Batch::new();
        assert!(!batch.is_full_for(&doc(0, 10), &settings));
        batch.push(doc(0, 10));
        batch.push(doc(1, 10));
        assert!(batch.is_full_for(&doc(2, 10), &settings));

        let settings = MigrationSettings::new("snap").max_bytes_per_batch(200);
        let mut batch = Batch::new();
        batch.push(doc(0, 100));
        assert!(batch.is_full_for(&doc(1, 100), &settings));
        assert!(!batch.is_full_for(&doc(1, 1), &settings));
    }

    #[test]
    fn test_oversized_document_still_sent_alone() {
        let settings = MigrationSettings::new("snap").max_bytes_per_batch(10);
        let batch = Batch::new();
        assert!(!batch.is_full_for(&doc(0, 1_000), &settings));
    }

    #[test]
    fn test_settings_validation() {
        assert!(MigrationSettings::new("snap").validate().is_ok());
        assert!(MigrationSettings::new("").validate().is_err());
        assert!(
            MigrationSettings::new("snap")
                .max_docs_per_batch(0)
                .validate()
                .is_err()
        );
        assert!(
            MigrationSettings::new("snap")
                .initial_lease_duration(Duration::from_secs(60))
                .checkpoint_lead_time(Duration::from_secs(60))
                .validate()
                .is_err()
        );
    }

    #[test]
    fn test_defaults() {
        let settings = MigrationSettings::new("snap");
        assert_eq!(settings.max_shard_size_bytes, 85_899_345_920);
        assert_eq!(settings.max_bytes_per_batch, 10_485_760);
        assert_eq!(settings.initial_lease_duration, Duration::from_secs(600));
        assert!(settings.max_docs_per_batch.is_none());
    }
}
