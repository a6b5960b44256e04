use crate::core::Result;
use crate::work::WorkItemRecord;
use async_trait::async_trait;

/// Optimistic-concurrency token of a stored document. A conditional write only
/// succeeds while the stored document still carries the same version.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct DocumentVersion {
    pub seq_no: i64,
    pub primary_term: i64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VersionedDocument {
    pub record: WorkItemRecord,
    pub version: DocumentVersion,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CreateResult {
    Created,
    AlreadyExists,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpdateResult {
    Updated(DocumentVersion),
    VersionConflict,
}

/// Primitive single-document operations the coordinator is built from.
///
/// Atomicity is per document: `create_document` is create-only and
/// `conditional_update` is a compare-and-swap on [`DocumentVersion`]. Nothing
/// here spans more than one document.
#[async_trait]
pub trait DocumentStoreClient: Send + Sync {
    /// Create the backing index if missing.
    async fn ensure_index(&self) -> Result<()>;

    async fn create_document(&self, record: &WorkItemRecord) -> Result<CreateResult>;

    async fn get_document(&self, id: &str) -> Result<Option<VersionedDocument>>;

    async fn conditional_update(
        &self,
        record: &WorkItemRecord,
        expected: DocumentVersion,
    ) -> Result<UpdateResult>;

    /// Up to `limit` incomplete documents with `lease_expiry < now_millis`,
    /// in random order.
    async fn search_acquirable(&self, now_millis: i64, limit: usize)
    -> Result<Vec<VersionedDocument>>;

    async fn count_incomplete(&self) -> Result<u64>;

    async fn list_incomplete_ids(&self) -> Result<Vec<String>>;
}
