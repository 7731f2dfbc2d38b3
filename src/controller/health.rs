//! Controller health as seen by the REST API
//!
//! Ready means the last cycle ran to completion without failed operations.
//! Healthy is only lost on authorization failures that survived retries;
//! it comes back as soon as the device accepts our credentials again.

use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};

use chrono::{DateTime, Utc};
use serde::Serialize;

use super::lifecycle::ObjectPhase;

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FailureSummary {
    pub object: String,
    /// Short error class, see [`crate::Error::kind`]
    pub kind: String,
    pub error: String,
}

/// Serializable digest of one cycle
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CycleSummary {
    pub cycle: u64,
    pub started_at: DateTime<Utc>,
    pub duration_ms: u64,
    pub applied: usize,
    pub failed: Vec<FailureSummary>,
    pub deferred: usize,
    pub cancelled: usize,
    pub skipped: bool,
    pub skip_reason: Option<String>,
}

impl CycleSummary {
    pub fn succeeded(&self) -> bool {
        !self.skipped && self.failed.is_empty() && self.cancelled == 0
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ObjectStatus {
    pub object: String,
    pub phase: ObjectPhase,
}

#[derive(Debug, Default)]
struct HealthInner {
    initialized: bool,
    unauthorized: bool,
    last_cycle: Option<CycleSummary>,
    objects: Vec<ObjectStatus>,
}

/// Shared handle; cheap to clone
#[derive(Clone, Debug, Default)]
pub struct HealthState {
    inner: Arc<RwLock<HealthInner>>,
}

impl HealthState {
    pub fn new() -> Self {
        Self::default()
    }

    fn read(&self) -> RwLockReadGuard<'_, HealthInner> {
        self.inner.read().unwrap_or_else(|e| e.into_inner())
    }

    fn write(&self) -> RwLockWriteGuard<'_, HealthInner> {
        self.inner.write().unwrap_or_else(|e| e.into_inner())
    }

    pub fn mark_initialized(&self) {
        self.write().initialized = true;
    }

    pub fn set_unauthorized(&self, unauthorized: bool) {
        self.write().unauthorized = unauthorized;
        #[cfg(feature = "metrics")]
        super::metrics::set_healthy(!unauthorized);
    }

    pub fn record_cycle(&self, summary: CycleSummary, objects: Vec<ObjectStatus>) {
        let mut inner = self.write();
        inner.last_cycle = Some(summary);
        inner.objects = objects;
    }

    pub fn is_healthy(&self) -> bool {
        !self.read().unauthorized
    }

    pub fn is_ready(&self) -> bool {
        let inner = self.read();
        inner.initialized
            && inner
                .last_cycle
                .as_ref()
                .map(CycleSummary::succeeded)
                .unwrap_or(false)
    }

    pub fn last_cycle(&self) -> Option<CycleSummary> {
        self.read().last_cycle.clone()
    }

    pub fn objects(&self) -> Vec<ObjectStatus> {
        self.read().objects.clone()
    }
}
