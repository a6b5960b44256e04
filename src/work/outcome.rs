use chrono::{DateTime, Utc};

/// A lease granted to the calling worker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AcquiredWorkItem {
    pub work_item_id: String,
    pub lease_expiry: DateTime<Utc>,
    /// Exponent used to size this lease (the stored exponent before increment).
    pub lease_exponent: u32,
}

/// Result of trying to obtain a lease.
///
/// `acquire_next_work_item` yields `Acquired`, `AlreadyCompleted` or
/// `NoAvailableWork`; `create_or_update_lease_for_work_item` yields
/// `Acquired`, `AlreadyCompleted` or `LeaseLockHeldElsewhere`. None of these
/// are errors: contention is handled by backing off at the caller.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WorkAcquisitionOutcome {
    Acquired(AcquiredWorkItem),
    AlreadyCompleted,
    NoAvailableWork,
    LeaseLockHeldElsewhere,
}

impl WorkAcquisitionOutcome {
    pub fn acquired(&self) -> Option<&AcquiredWorkItem> {
        match self {
            Self::Acquired(item) => Some(item),
            _ => None,
        }
    }

    pub fn into_acquired(self) -> Option<AcquiredWorkItem> {
        match self {
            Self::Acquired(item) => Some(item),
            _ => None,
        }
    }
}
