//! Narrow interfaces to the systems a migration worker reads from and writes
//! to. The coordination core only depends on these traits; `local` and `bulk`
//! provide the implementations used by the binary.

pub mod bulk;
pub mod local;

pub use bulk::HttpBulkSink;
pub use local::LocalSnapshotDirectory;

use crate::core::Result;
use async_trait::async_trait;
use futures::stream::BoxStream;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IndexMetadata {
    pub name: String,
    pub number_of_shards: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ShardMetadata {
    pub index_name: String,
    pub shard_number: u32,
    pub total_size_bytes: u64,
    #[serde(default)]
    pub doc_count: u64,
}

/// One document read out of a snapshot shard.
///
/// `doc_number` is the document's position within its shard and is the
/// resumable cursor: reading again from `doc_number + 1` continues after it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SourceDocument {
    pub id: String,
    pub doc_number: u64,
    pub source: serde_json::Value,
}

impl SourceDocument {
    /// Bytes this document adds to a bulk request body.
    pub fn approximate_size(&self) -> usize {
        // action line + newline + source + newline
        self.id.len() + 32 + self.source.to_string().len()
    }
}

pub type DocumentStream = BoxStream<'static, Result<SourceDocument>>;

#[async_trait]
pub trait ShardMetadataProvider: Send + Sync {
    async fn list_indices(&self, snapshot_name: &str) -> Result<Vec<IndexMetadata>>;

    async fn shard_metadata(
        &self,
        snapshot_name: &str,
        index_name: &str,
        shard_number: u32,
    ) -> Result<ShardMetadata>;
}

#[async_trait]
pub trait DocumentSource: Send + Sync {
    /// Lazily reads the shard's documents, skipping those numbered below
    /// `starting_doc_number`.
    async fn read_documents(
        &self,
        snapshot_name: &str,
        index_name: &str,
        shard_number: u32,
        starting_doc_number: u64,
    ) -> Result<DocumentStream>;
}

#[async_trait]
pub trait BulkSink: Send + Sync {
    /// Durably writes `documents` into `index_name` on the target, or fails.
    async fn send_batch(&self, index_name: &str, documents: &[SourceDocument]) -> Result<()>;
}

/// Indices selected for migration. An empty allow-list selects every index
/// that isn't a system index (leading `.`).
pub fn filter_indices(indices: Vec<IndexMetadata>, allowlist: &[String]) -> Vec<IndexMetadata> {
    indices
        .into_iter()
        .filter(|index| {
            if allowlist.is_empty() {
                !index.name.starts_with('.')
            } else {
                allowlist.iter().any(|allowed| allowed == &index.name)
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn index(name: &str) -> IndexMetadata {
        IndexMetadata {
            name: name.to_string(),
            number_of_shards: 1,
        }
    }

    #[test]
    fn test_empty_allowlist_skips_system_indices() {
        let selected = filter_indices(vec![index("logs"), index(".kibana"), index("geo")], &[]);
        let names = selected.iter().map(|i| i.name.as_str()).collect::<Vec<_>>();
        assert_eq!(names, vec!["logs", "geo"]);
    }

    #[test]
    fn test_allowlist_is_exact() {
        let selected = filter_indices(
            vec![index("logs"), index("logs-old"), index(".kibana")],
            &["logs".to_string(), ".kibana".to_string()],
        );
        let names = selected.iter().map(|i| i.name.as_str()).collect::<Vec<_>>();
        assert_eq!(names, vec!["logs", ".kibana"]);
    }
}
