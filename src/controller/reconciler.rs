//! Plan execution against the traffic manager
//!
//! Phases run one after another; the operations of a phase run concurrently
//! up to `worker_limit`. Every operation is retried on its own and the applied
//! record is only written for operations that succeeded.

use futures::stream::{self, StreamExt};
use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tracing::{debug, error, info, instrument, warn};

use super::backoff::{sleep_or_shutdown, BackoffPolicy};
use super::diff::{OperationPlan, Phase, Stage};
use crate::bigip::{OperationError, TrafficManager};
use crate::error::Error;
use crate::model::{Action, ObjectKey, Operation};
use crate::store::{AppliedRecord, AppliedState, StateStore};

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReconcilerConfig {
    /// Maximum operations in flight within one phase
    pub worker_limit: usize,
    pub retry: BackoffPolicy,
    /// Log operations instead of sending them
    pub dry_run: bool,
}

impl Default for ReconcilerConfig {
    fn default() -> Self {
        Self {
            worker_limit: 4,
            retry: BackoffPolicy::default(),
            dry_run: false,
        }
    }
}

/// Outcome of executing one plan
#[derive(Debug, Default)]
pub struct ReconcileReport {
    /// Succeeded operations, in completion order
    pub applied: Vec<(ObjectKey, Action)>,
    pub failed: Vec<(ObjectKey, Error)>,
    /// Held back because a dependency is not in the required state
    pub deferred: Vec<ObjectKey>,
    /// Not started because of shutdown
    pub cancelled: Vec<ObjectKey>,
    /// Some operation ran out of retries on an authorization failure
    pub unauthorized: bool,
}

enum Outcome {
    Applied(Operation),
    Failed(OperationError),
    Cancelled,
}

pub struct Reconciler {
    config: ReconcilerConfig,
}

impl Reconciler {
    pub fn new(config: ReconcilerConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &ReconcilerConfig {
        &self.config
    }

    /// Execute `plan`, updating `store` for every successful operation
    #[instrument(skip_all, fields(operations = plan.len(), dry_run = self.config.dry_run))]
    pub async fn execute(
        &self,
        plan: &OperationPlan,
        traffic: &dyn TrafficManager,
        store: &mut dyn StateStore,
        shutdown: &watch::Receiver<bool>,
    ) -> ReconcileReport {
        let mut report = ReconcileReport::default();
        // The applied record as this execution progresses. In dry-run mode
        // the store is left alone but dependencies still need tracking.
        let mut view = store.snapshot();

        for phase in plan.phases() {
            if *shutdown.borrow() {
                info!("Shutdown requested, cancelling phase {}", phase.stage);
                report
                    .cancelled
                    .extend(phase.operations.iter().map(|op| op.key().clone()));
                continue;
            }

            let runnable = self.filter_phase(phase, &view, &mut report);
            debug!(
                "Phase {}: dispatching {} of {} operations",
                phase.stage,
                runnable.len(),
                phase.operations.len()
            );

            let outcomes: Vec<(ObjectKey, Outcome)> = stream::iter(runnable)
                .map(|operation| async move {
                    let key = operation.key().clone();
                    let outcome = self.apply_with_retry(traffic, operation, shutdown).await;
                    (key, outcome)
                })
                .buffer_unordered(self.config.worker_limit.max(1))
                .collect()
                .await;

            for (key, outcome) in outcomes {
                match outcome {
                    Outcome::Applied(operation) => {
                        let action = operation.action();
                        record_operation(&key, action, "success");
                        if let Err(e) = self.record(store, &mut view, operation) {
                            error!("Failed to record {} {}: {}", action, key, e);
                            report.failed.push((key, e));
                            continue;
                        }
                        report.applied.push((key, action));
                    }
                    Outcome::Failed(e) => {
                        warn!("Giving up on {}: {}", key, e);
                        record_operation(&key, action_of(plan, &key), "failure");
                        if e.is_unauthorized() {
                            report.unauthorized = true;
                        }
                        report.failed.push((
                            key.clone(),
                            Error::OperationFailure {
                                key: key.to_string(),
                                source: e,
                            },
                        ));
                    }
                    Outcome::Cancelled => report.cancelled.push(key),
                }
            }
        }

        report
    }

    /// Drop the operations whose dependencies are not in place
    fn filter_phase(
        &self,
        phase: &Phase,
        view: &AppliedState,
        report: &mut ReconcileReport,
    ) -> Vec<Operation> {
        let mut runnable = Vec::with_capacity(phase.operations.len());
        for operation in &phase.operations {
            let key = operation.key();
            let blocked: Vec<ObjectKey> = match (phase.stage, operation) {
                // A delete waits while anything applied still points at it
                (Stage::Remove(_), Operation::Delete { .. }) => view
                    .iter()
                    .filter(|(k, record)| *k != key && record.body.references().contains(key))
                    .map(|(k, _)| k.clone())
                    .collect(),
                // A create or update needs every object it references
                (_, op) => op
                    .body()
                    .map(|body| body.references())
                    .unwrap_or_default()
                    .into_iter()
                    .filter(|r| !view.contains_key(r))
                    .collect(),
            };
            if blocked.is_empty() {
                runnable.push(operation.clone());
            } else {
                let names: Vec<String> = blocked.iter().map(ToString::to_string).collect();
                warn!("Deferring {}: waiting on {}", operation, names.join(", "));
                record_operation(key, operation.action(), "deferred");
                report.deferred.push(key.clone());
            }
        }
        runnable
    }

    async fn apply_with_retry(
        &self,
        traffic: &dyn TrafficManager,
        operation: Operation,
        shutdown: &watch::Receiver<bool>,
    ) -> Outcome {
        let mut current = operation;
        let mut attempts = 0;
        let mut rewritten = false;

        loop {
            if *shutdown.borrow() {
                return Outcome::Cancelled;
            }
            if self.config.dry_run {
                info!("[dry-run] would {}", current);
                return Outcome::Applied(current);
            }

            let error = match traffic.apply(&current).await {
                Ok(()) => {
                    debug!("Applied {}", current);
                    return Outcome::Applied(current);
                }
                Err(e) => e,
            };

            current = match (current, error) {
                // Already absent is what a delete wants
                (op @ Operation::Delete { .. }, OperationError::NotFound) => {
                    debug!("{} was already absent", op.key());
                    return Outcome::Applied(op);
                }
                (Operation::Create { key, body }, OperationError::AlreadyExists) if !rewritten => {
                    info!("{} already exists, updating instead", key);
                    rewritten = true;
                    Operation::Update { key, body }
                }
                (Operation::Update { key, body }, OperationError::NotFound) if !rewritten => {
                    info!("{} vanished from the device, creating it again", key);
                    rewritten = true;
                    Operation::Create { key, body }
                }
                (op, e) if e.is_transient() => {
                    attempts += 1;
                    if !self.config.retry.allows_retry(attempts) {
                        if e.is_unauthorized() {
                            error!("Not authorized to {} after {} attempts: {}", op, attempts, e);
                        }
                        return Outcome::Failed(e);
                    }
                    let delay = self.config.retry.delay(attempts - 1);
                    warn!(
                        "{} failed (attempt {}/{}): {}, retrying in {:?}",
                        op, attempts, self.config.retry.max_attempts, e, delay
                    );
                    if sleep_or_shutdown(delay, shutdown).await {
                        return Outcome::Cancelled;
                    }
                    op
                }
                (_, e) => return Outcome::Failed(e),
            };
        }
    }

    fn record(
        &self,
        store: &mut dyn StateStore,
        view: &mut AppliedState,
        operation: Operation,
    ) -> crate::error::Result<()> {
        match operation {
            Operation::Create { key, body } | Operation::Update { key, body } => {
                let generation = store.next_generation();
                if !self.config.dry_run {
                    store.put(key.clone(), body.clone(), generation)?;
                }
                view.insert(key, AppliedRecord { body, generation });
            }
            Operation::Delete { key } => {
                if !self.config.dry_run {
                    store.delete(&key)?;
                }
                view.remove(&key);
            }
        }
        Ok(())
    }
}

fn action_of(plan: &OperationPlan, key: &ObjectKey) -> Action {
    plan.operations()
        .find(|op| op.key() == key)
        .map(Operation::action)
        .unwrap_or(Action::Update)
}

#[cfg(feature = "metrics")]
fn record_operation(key: &ObjectKey, action: Action, result: &str) {
    super::metrics::inc_operation(key.kind.as_str(), action.as_str(), result);
}

#[cfg(not(feature = "metrics"))]
fn record_operation(_key: &ObjectKey, _action: Action, _result: &str) {}
