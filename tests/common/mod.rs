#![allow(dead_code)]

use async_trait::async_trait;
use futures::StreamExt;
use futures::stream;
use serde_json::json;
use shardlease::coordinator::document_store::InMemoryDocumentStore;
use shardlease::pipeline::{
    BulkSink, DocumentSource, DocumentStream, IndexMetadata, ShardMetadata, ShardMetadataProvider,
    SourceDocument,
};
use shardlease::{
    Clock, CoordinationError, DocumentStoreWorkCoordinator, LeaseExpirationWatchdog, Result,
    ScopedWorkCoordinator, WorkCoordinator,
};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

pub fn coordinator(
    store: &InMemoryDocumentStore,
    worker_id: &str,
    clock: Arc<dyn Clock>,
) -> Arc<dyn WorkCoordinator> {
    Arc::new(DocumentStoreWorkCoordinator::new(
        Arc::new(store.clone()),
        worker_id,
        clock,
    ))
}

/// Scoped coordinator whose watchdog only cancels; no process exit in tests.
pub fn scoped(
    store: &InMemoryDocumentStore,
    worker_id: &str,
    clock: Arc<dyn Clock>,
) -> ScopedWorkCoordinator {
    ScopedWorkCoordinator::new(
        coordinator(store, worker_id, clock.clone()),
        LeaseExpirationWatchdog::cancel_only(clock),
        Duration::ZERO,
    )
}

#[derive(Debug, Clone)]
pub struct FakeShard {
    pub size_bytes: u64,
    pub documents: u64,
}

/// Snapshot whose documents are generated on the fly.
#[derive(Debug, Clone, Default)]
pub struct FakeSnapshot {
    indices: Vec<(String, Vec<FakeShard>)>,
}

impl FakeSnapshot {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn index(mut self, name: &str, shards: Vec<FakeShard>) -> Self {
        self.indices.push((name.to_string(), shards));
        self
    }

    /// `count` small shards of `documents` docs each.
    pub fn uniform(name: &str, count: usize, documents: u64) -> Self {
        let shards = (0..count)
            .map(|_| FakeShard {
                size_bytes: 1_024,
                documents,
            })
            .collect();
        Self::new().index(name, shards)
    }

    fn shard(&self, index_name: &str, shard_number: u32) -> Result<&FakeShard> {
        self.indices
            .iter()
            .find(|(name, _)| name == index_name)
            .and_then(|(_, shards)| shards.get(shard_number as usize))
            .ok_or_else(|| {
                CoordinationError::Pipeline(format!("no shard {}/{}", index_name, shard_number))
            })
    }
}

pub fn document_id(index_name: &str, shard_number: u32, doc_number: u64) -> String {
    format!("{}-{}-{}", index_name, shard_number, doc_number)
}

#[async_trait]
impl ShardMetadataProvider for FakeSnapshot {
    async fn list_indices(&self, _snapshot_name: &str) -> Result<Vec<IndexMetadata>> {
        Ok(self
            .indices
            .iter()
            .map(|(name, shards)| IndexMetadata {
                name: name.clone(),
                number_of_shards: shards.len() as u32,
            })
            .collect())
    }

    async fn shard_metadata(
        &self,
        _snapshot_name: &str,
        index_name: &str,
        shard_number: u32,
    ) -> Result<ShardMetadata> {
        let shard = self.shard(index_name, shard_number)?;
        Ok(ShardMetadata {
            index_name: index_name.to_string(),
            shard_number,
            total_size_bytes: shard.size_bytes,
            doc_count: shard.documents,
        })
    }
}

#[async_trait]
impl DocumentSource for FakeSnapshot {
    async fn read_documents(
        &self,
        _snapshot_name: &str,
        index_name: &str,
        shard_number: u32,
        starting_doc_number: u64,
    ) -> Result<DocumentStream> {
        let total = self.shard(index_name, shard_number)?.documents;
        let index_name = index_name.to_string();
        let documents = (starting_doc_number..total).map(move |doc_number| {
            Ok(SourceDocument {
                id: document_id(&index_name, shard_number, doc_number),
                doc_number,
                source: json!({ "n": doc_number }),
            })
        });
        Ok(stream::iter(documents).boxed())
    }
}

/// Records every batch; can be told to fail the next N sends.
#[derive(Debug, Default)]
pub struct RecordingSink {
    batches: Mutex<Vec<(String, Vec<String>)>>,
    failures_left: AtomicUsize,
    delay: Option<Duration>,
}

impl RecordingSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn failing(times: usize) -> Self {
        let sink = Self::default();
        sink.failures_left.store(times, Ordering::SeqCst);
        sink
    }

    pub fn slow(delay: Duration) -> Self {
        Self {
            delay: Some(delay),
            ..Self::default()
        }
    }

    pub fn batches(&self) -> Vec<(String, Vec<String>)> {
        self.batches.lock().unwrap().clone()
    }

    pub fn document_ids(&self) -> Vec<String> {
        self.batches()
            .into_iter()
            .flat_map(|(_, ids)| ids)
            .collect()
    }
}

#[async_trait]
impl BulkSink for RecordingSink {
    async fn send_batch(&self, index_name: &str, documents: &[SourceDocument]) -> Result<()> {
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        let failing = self
            .failures_left
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |left| left.checked_sub(1))
            .is_ok();
        if failing {
            return Err(CoordinationError::Pipeline("target rejected the batch".into()));
        }
        self.batches.lock().unwrap().push((
            index_name.to_string(),
            documents.iter().map(|doc| doc.id.clone()).collect(),
        ));
        Ok(())
    }
}
