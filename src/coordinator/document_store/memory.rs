use super::client::{
    CreateResult, DocumentStoreClient, DocumentVersion, UpdateResult, VersionedDocument,
};
use crate::core::Result;
use crate::work::WorkItemRecord;
use async_trait::async_trait;
use rand::seq::SliceRandom;
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use tokio::sync::RwLock;

const PRIMARY_TERM: i64 = 1;

/// Process-local document store with the same per-document guarantees as the
/// HTTP store. Clones share the same documents, so several coordinators (one
/// per simulated worker) can contend on one instance.
#[derive(Clone, Default)]
pub struct InMemoryDocumentStore {
    documents: Arc<RwLock<HashMap<String, VersionedDocument>>>,
    next_seq_no: Arc<AtomicI64>,
    index_created: Arc<AtomicBool>,
}

impl InMemoryDocumentStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn index_created(&self) -> bool {
        self.index_created.load(Ordering::SeqCst)
    }

    pub async fn len(&self) -> usize {
        self.documents.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.documents.read().await.is_empty()
    }

    fn next_version(&self) -> DocumentVersion {
        DocumentVersion {
            seq_no: self.next_seq_no.fetch_add(1, Ordering::SeqCst),
            primary_term: PRIMARY_TERM,
        }
    }
}

#[async_trait]
impl DocumentStoreClient for InMemoryDocumentStore {
    async fn ensure_index(&self) -> Result<()> {
        self.index_created.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn create_document(&self, record: &WorkItemRecord) -> Result<CreateResult> {
        let mut documents = self.documents.write().await;
        if documents.contains_key(&record.id) {
            return Ok(CreateResult::AlreadyExists);
        }

        let version = self.next_version();
        documents.insert(
            record.id.clone(),
            VersionedDocument {
                record: record.clone(),
                version,
            },
        );
        Ok(CreateResult::Created)
    }

    async fn get_document(&self, id: &str) -> Result<Option<VersionedDocument>> {
        Ok(self.documents.read().await.get(id).cloned())
    }

    async fn conditional_update(
        &self,
        record: &WorkItemRecord,
        expected: DocumentVersion,
    ) -> Result<UpdateResult> {
        let mut documents = self.documents.write().await;
        let Some(stored) = documents.get_mut(&record.id) else {
            return Ok(UpdateResult::VersionConflict);
        };
        if stored.version != expected {
            return Ok(UpdateResult::VersionConflict);
        }

        let version = self.next_version();
        stored.record = record.clone();
        stored.version = version;
        Ok(UpdateResult::Updated(version))
    }

    async fn search_acquirable(
        &self,
        now_millis: i64,
        limit: usize,
    ) -> Result<Vec<VersionedDocument>> {
        let mut candidates = {
            let documents = self.documents.read().await;
            documents
                .values()
                .filter(|doc| doc.record.is_acquirable(now_millis))
                .cloned()
                .collect::<Vec<_>>()
        };

        candidates.shuffle(&mut rand::thread_rng());
        candidates.truncate(limit);
        Ok(candidates)
    }

    async fn count_incomplete(&self) -> Result<u64> {
        let documents = self.documents.read().await;
        Ok(documents
            .values()
            .filter(|doc| !doc.record.is_completed())
            .count() as u64)
    }

    async fn list_incomplete_ids(&self) -> Result<Vec<String>> {
        let documents = self.documents.read().await;
        let mut ids = documents
            .values()
            .filter(|doc| !doc.record.is_completed())
            .map(|doc| doc.record.id.clone())
            .collect::<Vec<_>>();
        ids.sort();
        Ok(ids)
    }
}
