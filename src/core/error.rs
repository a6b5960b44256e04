use thiserror::Error;

#[derive(Error, Debug)]
pub enum CoordinationError {
    #[error("Coordination backend error: {0}")]
    Backend(String),

    #[error("Work item '{work_item_id}' is not leased by worker '{worker_id}' or is already complete")]
    LeaseNotHeld {
        work_item_id: String,
        worker_id: String,
    },

    #[error("Lease for work item '{0}' expired before processing finished")]
    LeaseExpired(String),

    #[error(
        "The shard size of {size_bytes} bytes for {index_name}/{shard_number} exceeds the maximum shard size of {max_bytes} bytes"
    )]
    ShardTooLarge {
        index_name: String,
        shard_number: u32,
        size_bytes: u64,
        max_bytes: u64,
    },

    #[error("Document pipeline error: {0}")]
    Pipeline(String),

    #[error("Invalid work item id '{0}'")]
    InvalidWorkItemId(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Work item integrity error: {0}")]
    Integrity(String),
}

impl CoordinationError {
    /// Errors talking to the coordination store, worth retrying with backoff.
    /// Source and sink failures are not: they need an operator or a fresh
    /// lease cycle.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Backend(_))
    }

    pub fn lease_not_held(work_item_id: impl Into<String>, worker_id: impl Into<String>) -> Self {
        Self::LeaseNotHeld {
            work_item_id: work_item_id.into(),
            worker_id: worker_id.into(),
        }
    }
}

pub type Result<T> = std::result::Result<T, CoordinationError>;

impl From<sqlx::Error> for CoordinationError {
    fn from(err: sqlx::Error) -> Self {
        Self::Backend(err.to_string())
    }
}

impl From<reqwest::Error> for CoordinationError {
    fn from(err: reqwest::Error) -> Self {
        Self::Backend(err.to_string())
    }
}

impl From<serde_json::Error> for CoordinationError {
    fn from(err: serde_json::Error) -> Self {
        Self::Serialization(err.to_string())
    }
}

impl From<std::io::Error> for CoordinationError {
    fn from(err: std::io::Error) -> Self {
        Self::Pipeline(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transient_classification() {
        assert!(CoordinationError::Backend("connection reset".into()).is_transient());
        assert!(!CoordinationError::Pipeline("manifest missing".into()).is_transient());
        assert!(!CoordinationError::Config("bad url".into()).is_transient());
        assert!(!CoordinationError::lease_not_held("a__0__0", "w1").is_transient());
        assert!(!CoordinationError::LeaseExpired("a__0__0".into()).is_transient());
    }

    #[test]
    fn test_lease_not_held_message() {
        let err = CoordinationError::lease_not_held("logs__1__0", "worker-7");
        let message = err.to_string();
        assert!(message.contains("logs__1__0"));
        assert!(message.contains("worker-7"));
    }
}
