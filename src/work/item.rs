use crate::core::{CoordinationError, Result};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Persisted state of one unit of work, identical across backends.
///
/// `lease_expiry` is epoch milliseconds; `0` marks an item that has never been
/// leased. Once `completed_at` is set the record is terminal.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkItemRecord {
    pub id: String,
    pub creator_id: String,
    #[serde(default)]
    pub completed_at: Option<i64>,
    #[serde(default)]
    pub lease_holder_id: Option<String>,
    #[serde(default)]
    pub lease_expiry: i64,
    #[serde(default)]
    pub lease_exponent: u32,
    #[serde(default)]
    pub successor_item_ids: Option<Vec<String>>,
}

impl WorkItemRecord {
    pub fn unassigned(id: impl Into<String>, creator_id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            creator_id: creator_id.into(),
            completed_at: None,
            lease_holder_id: None,
            lease_expiry: 0,
            lease_exponent: 0,
            successor_item_ids: None,
        }
    }

    pub fn with_lease_exponent(mut self, exponent: u32) -> Self {
        self.lease_exponent = exponent;
        self
    }

    pub fn is_completed(&self) -> bool {
        self.completed_at.is_some()
    }

    pub fn is_lease_expired(&self, now_millis: i64) -> bool {
        self.lease_expiry < now_millis
    }

    /// Eligible for `acquire_next_work_item`.
    pub fn is_acquirable(&self, now_millis: i64) -> bool {
        !self.is_completed() && self.is_lease_expired(now_millis)
    }

    pub fn is_held_by(&self, worker_id: &str, now_millis: i64) -> bool {
        !self.is_completed()
            && self.lease_holder_id.as_deref() == Some(worker_id)
            && !self.is_lease_expired(now_millis)
    }

    /// A parent whose split was recorded but never completed.
    pub fn has_pending_successors(&self) -> bool {
        !self.is_completed()
            && self
                .successor_item_ids
                .as_ref()
                .is_some_and(|ids| !ids.is_empty())
    }
}

const ID_SEPARATOR: &str = "__";

/// Structured form of a shard work item id: `<index>__<shard>__<startingDocId>`.
///
/// Successor fragments of a shard share the index and shard number and differ
/// only in the document number they resume from.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ShardWorkItem {
    pub index_name: String,
    pub shard_number: u32,
    pub starting_doc_id: u64,
}

impl ShardWorkItem {
    pub fn new(index_name: impl Into<String>, shard_number: u32) -> Self {
        Self {
            index_name: index_name.into(),
            shard_number,
            starting_doc_id: 0,
        }
    }

    pub fn starting_at(mut self, doc_id: u64) -> Self {
        self.starting_doc_id = doc_id;
        self
    }

    pub fn successor_from(&self, next_doc_id: u64) -> Self {
        Self {
            index_name: self.index_name.clone(),
            shard_number: self.shard_number,
            starting_doc_id: next_doc_id,
        }
    }

    pub fn parse(id: &str) -> Result<Self> {
        id.parse()
    }
}

impl fmt::Display for ShardWorkItem {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}{sep}{}{sep}{}",
            self.index_name,
            self.shard_number,
            self.starting_doc_id,
            sep = ID_SEPARATOR
        )
    }
}

impl FromStr for ShardWorkItem {
    type Err = CoordinationError;

    fn from_str(id: &str) -> Result<Self> {
        let invalid = || CoordinationError::InvalidWorkItemId(id.to_string());

        // Index names may themselves contain the separator, so parse from the right.
        let mut parts = id.rsplitn(3, ID_SEPARATOR).collect::<Vec<_>>();
        parts.reverse();

        let (index_name, shard, starting_doc) = match parts.as_slice() {
            [index, shard, start] => match start.parse::<u64>() {
                Ok(start) if shard.parse::<u32>().is_ok() => (*index, *shard, start),
                // `<index with __>__<shard>`: the middle piece belonged to the index.
                _ => {
                    let (index, shard) = id.rsplit_once(ID_SEPARATOR).ok_or_else(invalid)?;
                    (index, shard, 0)
                }
            },
            [index, shard] => (*index, *shard, 0),
            _ => return Err(invalid()),
        };

        if index_name.is_empty() {
            return Err(invalid());
        }
        let shard_number = shard.parse::<u32>().map_err(|_| invalid())?;

        Ok(Self {
            index_name: index_name.to_string(),
            shard_number,
            starting_doc_id: starting_doc,
        })
    }
}
