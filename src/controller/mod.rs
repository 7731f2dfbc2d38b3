//! Controller module for BIG-IP reconciliation
//! This module contains the main controller loop, the translation from
//! topology to BIG-IP objects and the ordered execution of changes.

pub mod backoff;
mod cycle;
pub mod diff;
mod health;
mod lifecycle;
#[cfg(feature = "metrics")]
pub mod metrics;
mod reconciler;
#[cfg(test)]
mod reconciler_test;
pub mod translator;

pub use backoff::BackoffPolicy;
pub use cycle::{Controller, ControllerSettings, CycleResult};
pub use diff::{compute_plan, OperationPlan, Phase, Stage};
pub use health::{CycleSummary, FailureSummary, HealthState, ObjectStatus};
pub use lifecycle::{LifecycleTracker, ObjectPhase};
pub use reconciler::{ReconcileReport, Reconciler, ReconcilerConfig};
pub use translator::{translate, TranslateOptions};
