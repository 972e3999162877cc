//! Error types for resource-group operations.

use std::time::Duration;

use thiserror::Error;

/// Result type alias for pool operations.
pub type PoolResult<T> = Result<T, PoolError>;

/// Failures reported by a cloud provider (or its simulation).
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum CloudApiError {
    /// Well-known transient throttling. Retried next tick without noise.
    #[error("request throttled: {0}")]
    Throttled(String),

    #[error("request timed out after {0:?}")]
    Timeout(Duration),

    #[error("{0}")]
    Other(String),
}

impl CloudApiError {
    pub fn is_throttled(&self) -> bool {
        matches!(self, CloudApiError::Throttled(_))
    }
}

/// An instance running a workload that must not be evicted. Reported in
/// [`crate::Selection::blocked`]; the rest of the selection goes ahead.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("instance {instance_id} in {group_id} runs a non-evictable workload")]
pub struct CriticalWorkloadError {
    pub instance_id: String,
    pub group_id: String,
}

#[derive(Debug, Error)]
pub enum PoolError {
    /// Some groups could not be read; their last known values were used.
    #[error("could not read state of groups: {}", groups.join(", "))]
    PartialGroupState { groups: Vec<String> },

    #[error("cloud API error for group {group}: {source}")]
    CloudApi {
        group: String,
        #[source]
        source: CloudApiError,
    },

    #[error("pool {0} has no resource groups")]
    NoResourceGroups(String),

    #[error("drain queue unavailable: {0}")]
    Drain(String),
}

impl PoolError {
    pub fn is_throttled(&self) -> bool {
        matches!(self, PoolError::CloudApi { source, .. } if source.is_throttled())
    }
}
