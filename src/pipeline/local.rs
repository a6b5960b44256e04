use super::{DocumentSource, DocumentStream, IndexMetadata, ShardMetadata, ShardMetadataProvider, SourceDocument};
use crate::core::{CoordinationError, Result};
use async_trait::async_trait;
use futures::StreamExt;
use futures::stream;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tokio::fs::File;
use tokio::io::{AsyncBufReadExt, BufReader};

pub const MANIFEST_FILE: &str = "manifest.json";

/// `<root>/<snapshot>/manifest.json`
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SnapshotManifest {
    pub indices: Vec<ManifestIndex>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ManifestIndex {
    pub name: String,
    pub shards: Vec<ManifestShard>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ManifestShard {
    pub shard_number: u32,
    pub total_size_bytes: u64,
    #[serde(default)]
    pub doc_count: u64,
}

#[derive(Debug, Deserialize)]
struct NdjsonDocument {
    id: String,
    source: serde_json::Value,
}

/// Snapshot exported to a directory tree:
///
/// ```text
/// <root>/<snapshot>/manifest.json
/// <root>/<snapshot>/<index>/<shard>.ndjson    one {"id", "source"} per line
/// ```
///
/// A document's number is its line position among the non-empty lines.
#[derive(Debug, Clone)]
pub struct LocalSnapshotDirectory {
    root: PathBuf,
}

impl LocalSnapshotDirectory {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn shard_path(&self, snapshot_name: &str, index_name: &str, shard_number: u32) -> PathBuf {
        self.root
            .join(snapshot_name)
            .join(index_name)
            .join(format!("{}.ndjson", shard_number))
    }

    pub async fn manifest(&self, snapshot_name: &str) -> Result<SnapshotManifest> {
        let path = self.root.join(snapshot_name).join(MANIFEST_FILE);
        let raw = tokio::fs::read_to_string(&path).await.map_err(|e| {
            CoordinationError::Pipeline(format!("reading {}: {}", path.display(), e))
        })?;
        Ok(serde_json::from_str(&raw)?)
    }
}

#[async_trait]
impl ShardMetadataProvider for LocalSnapshotDirectory {
    async fn list_indices(&self, snapshot_name: &str) -> Result<Vec<IndexMetadata>> {
        let manifest = self.manifest(snapshot_name).await?;
        Ok(manifest
            .indices
            .into_iter()
            .map(|index| IndexMetadata {
                number_of_shards: index.shards.len() as u32,
                name: index.name,
            })
            .collect())
    }

    async fn shard_metadata(
        &self,
        snapshot_name: &str,
        index_name: &str,
        shard_number: u32,
    ) -> Result<ShardMetadata> {
        let manifest = self.manifest(snapshot_name).await?;
        manifest
            .indices
            .iter()
            .filter(|index| index.name == index_name)
            .flat_map(|index| index.shards.iter())
            .find(|shard| shard.shard_number == shard_number)
            .map(|shard| ShardMetadata {
                index_name: index_name.to_string(),
                shard_number,
                total_size_bytes: shard.total_size_bytes,
                doc_count: shard.doc_count,
            })
            .ok_or_else(|| {
                CoordinationError::Pipeline(format!(
                    "snapshot '{}' has no shard {}/{}",
                    snapshot_name, index_name, shard_number
                ))
            })
    }
}

#[async_trait]
impl DocumentSource for LocalSnapshotDirectory {
    async fn read_documents(
        &self,
        snapshot_name: &str,
        index_name: &str,
        shard_number: u32,
        starting_doc_number: u64,
    ) -> Result<DocumentStream> {
        let path = self.shard_path(snapshot_name, index_name, shard_number);
        let file = File::open(&path).await.map_err(|e| {
            CoordinationError::Pipeline(format!("opening {}: {}", path.display(), e))
        })?;
        let lines = BufReader::new(file).lines();
        let display = path.display().to_string();

        let documents = stream::unfold(
            (lines, 0u64, display),
            move |(mut lines, mut next_doc, display)| async move {
                loop {
                    let line = match lines.next_line().await {
                        Ok(Some(line)) => line,
                        Ok(None) => return None,
                        Err(e) => {
                            let err = CoordinationError::Pipeline(format!("reading {}: {}", display, e));
                            return Some((Err(err), (lines, next_doc, display)));
                        }
                    };
                    if line.trim().is_empty() {
                        continue;
                    }

                    let doc_number = next_doc;
                    next_doc += 1;
                    if doc_number < starting_doc_number {
                        continue;
                    }

                    let parsed = serde_json::from_str::<NdjsonDocument>(&line)
                        .map(|doc| SourceDocument {
                            id: doc.id,
                            doc_number,
                            source: doc.source,
                        })
                        .map_err(|e| {
                            CoordinationError::Pipeline(format!(
                                "{} line {}: {}",
                                display, doc_number, e
                            ))
                        });
                    return Some((parsed, (lines, next_doc, display)));
                }
            },
        );

        Ok(documents.boxed())
    }
}
