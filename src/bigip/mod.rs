//! Traffic manager management interface
//!
//! The reconciler talks to the device only through [`TrafficManager`];
//! [`BigIpClient`] implements it over the BIG-IP iControl REST API.

mod client;
mod wire;

use async_trait::async_trait;
use thiserror::Error;

use crate::model::{DesiredConfig, Operation};

pub use client::{BigIpClient, BigIpSettings};

/// Outcome of a single failed call to the traffic manager
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum OperationError {
    /// Network failure, timeout, 5xx or throttling
    #[error("transient failure: {0}")]
    Transient(String),

    /// Validation error or any other permanent 4xx
    #[error("rejected with HTTP {status}: {message}")]
    Rejected { status: u16, message: String },

    #[error("object already exists")]
    AlreadyExists,

    #[error("object not found")]
    NotFound,

    #[error("not authorized: {0}")]
    Unauthorized(String),
}

impl OperationError {
    /// Retrying may succeed. Authorization failures are retried too so that
    /// a credential rotation in progress does not fail the object.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            OperationError::Transient(_) | OperationError::Unauthorized(_)
        )
    }

    pub fn is_unauthorized(&self) -> bool {
        matches!(self, OperationError::Unauthorized(_))
    }
}

#[async_trait]
pub trait TrafficManager: Send + Sync {
    /// Apply one operation. Implementations report rather than resolve
    /// conflicts: the reconciler decides how to react to
    /// [`OperationError::AlreadyExists`] and [`OperationError::NotFound`].
    async fn apply(&self, operation: &Operation) -> Result<(), OperationError>;

    /// Every managed object currently configured in `partition`, normalized
    /// to the desired-state model
    async fn list_objects(&self, partition: &str) -> Result<DesiredConfig, OperationError>;

    /// Partitions that a wildcard partition filter expands to
    async fn list_partitions(&self) -> Result<Vec<String>, OperationError>;

    /// Remove device-side leftovers no managed object references any more.
    /// Returns the names of what was removed.
    async fn collect_garbage(&self, _partition: &str) -> Result<Vec<String>, OperationError> {
        Ok(Vec::new())
    }
}
