//! The reconciliation loop
//!
//! One cycle: observe, translate, diff against the applied record, execute.
//! Cycles run strictly one after another and never fail as a whole; problems
//! are reported in the [`CycleResult`].

use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use tokio::sync::watch;
use tracing::{debug, error, info, instrument, warn};

use super::diff::{compute_plan, summarize};
use super::health::{CycleSummary, FailureSummary, HealthState, ObjectStatus};
use super::lifecycle::LifecycleTracker;
use super::reconciler::{Reconciler, ReconcilerConfig};
use super::translator::{translate, TranslateOptions};
use crate::bigip::TrafficManager;
use crate::error::{Error, Result};
use crate::model::{Action, DesiredConfig, ObjectKey, ObjectKind};
use crate::observer::{Observation, StateObserver};
use crate::store::StateStore;

/// Behaviour knobs of the controller
#[derive(Clone, Debug)]
pub struct ControllerSettings {
    pub translate: TranslateOptions,
    pub reconciler: ReconcilerConfig,
    /// Re-read the device every this many cycles to repair drift; 0 disables
    pub drift_check_every: u64,
    /// Remove nodes no pool member references after pools changed
    pub collect_garbage: bool,
}

impl Default for ControllerSettings {
    fn default() -> Self {
        Self {
            translate: TranslateOptions::default(),
            reconciler: ReconcilerConfig::default(),
            drift_check_every: 0,
            collect_garbage: true,
        }
    }
}

/// What happened during one cycle
#[derive(Debug, Default)]
pub struct CycleResult {
    pub cycle: u64,
    pub applied: Vec<(ObjectKey, Action)>,
    pub failed: Vec<(ObjectKey, Error)>,
    pub deferred: Vec<ObjectKey>,
    pub skipped: bool,
    pub skip_reason: Option<String>,
    pub cancelled: Vec<ObjectKey>,
}

impl CycleResult {
    fn skipped(cycle: u64, label: &str, reason: String) -> Self {
        warn!("Skipping cycle {}: {}", cycle, reason);
        #[cfg(feature = "metrics")]
        super::metrics::inc_skipped_cycle(label);
        #[cfg(not(feature = "metrics"))]
        let _ = label;
        Self {
            cycle,
            skipped: true,
            skip_reason: Some(reason),
            ..Default::default()
        }
    }

    /// Nothing failed, nothing was held back or cancelled
    pub fn is_converged(&self) -> bool {
        !self.skipped
            && self.failed.is_empty()
            && self.deferred.is_empty()
            && self.cancelled.is_empty()
    }

    fn summary(&self, started_at: chrono::DateTime<Utc>, elapsed: Duration) -> CycleSummary {
        CycleSummary {
            cycle: self.cycle,
            started_at,
            duration_ms: u64::try_from(elapsed.as_millis()).unwrap_or(u64::MAX),
            applied: self.applied.len(),
            failed: self
                .failed
                .iter()
                .map(|(key, e)| FailureSummary {
                    object: key.to_string(),
                    kind: e.kind().to_string(),
                    error: e.to_string(),
                })
                .collect(),
            deferred: self.deferred.len(),
            cancelled: self.cancelled.len(),
            skipped: self.skipped,
            skip_reason: self.skip_reason.clone(),
        }
    }
}

enum ObservationSource {
    /// Observe inline at the start of each cycle
    Direct(StateObserver),
    /// Read the latest value published by a spawned observer
    Feed(watch::Receiver<Option<Observation>>),
}

pub struct Controller {
    source: ObservationSource,
    traffic: Arc<dyn TrafficManager>,
    store: Box<dyn StateStore>,
    reconciler: Reconciler,
    settings: ControllerSettings,
    lifecycle: LifecycleTracker,
    health: HealthState,
    shutdown: watch::Receiver<bool>,
    cycle: u64,
    needs_rebuild: bool,
}

impl Controller {
    pub fn new(
        observer: StateObserver,
        traffic: Arc<dyn TrafficManager>,
        store: Box<dyn StateStore>,
        settings: ControllerSettings,
        shutdown: watch::Receiver<bool>,
    ) -> Self {
        Self {
            source: ObservationSource::Direct(observer.with_shutdown(shutdown.clone())),
            traffic,
            store,
            reconciler: Reconciler::new(settings.reconciler.clone()),
            settings,
            lifecycle: LifecycleTracker::new(),
            health: HealthState::new(),
            shutdown,
            cycle: 0,
            needs_rebuild: false,
        }
    }

    pub fn health(&self) -> HealthState {
        self.health.clone()
    }

    pub fn store(&self) -> &dyn StateStore {
        self.store.as_ref()
    }

    pub fn lifecycle(&self) -> &LifecycleTracker {
        &self.lifecycle
    }

    /// Load the applied record, rebuilding it from the device when it is
    /// not durable or fails its integrity check
    #[instrument(skip(self))]
    pub async fn initialize(&mut self) -> Result<()> {
        let rebuild = match self.store.load() {
            Ok(()) if self.store.is_durable() => {
                let snapshot = self.store.snapshot();
                self.lifecycle.reset_live(snapshot.keys());
                false
            }
            Ok(()) => true,
            Err(e @ Error::StoreCorruption(_)) => {
                warn!("Applied state is corrupted ({}), rebuilding from the device", e);
                true
            }
            Err(e) => return Err(e),
        };
        self.health.mark_initialized();

        if rebuild {
            self.needs_rebuild = true;
            self.rebuild_state().await?;
        }
        Ok(())
    }

    /// Partitions to read back from the device
    async fn managed_partitions(&self) -> Result<BTreeSet<String>> {
        let filter = &self.settings.translate.partitions;
        let mut partitions: BTreeSet<String> = filter.explicit().cloned().collect();
        if filter.is_wildcard() {
            partitions.extend(self.traffic.list_partitions().await?);
        }
        Ok(partitions)
    }

    /// Replace the applied record with what the device currently holds
    #[instrument(skip(self))]
    pub async fn rebuild_state(&mut self) -> Result<()> {
        let live = match self.read_live().await {
            Ok(live) => live,
            Err(e) => {
                if let Error::TrafficManager(source) = &e {
                    self.health.set_unauthorized(source.is_unauthorized());
                }
                return Err(e);
            }
        };
        self.health.set_unauthorized(false);

        let count = live.len();
        self.lifecycle.reset_live(live.keys());
        self.store.replace_all(live)?;
        self.needs_rebuild = false;
        self.publish_object_metrics();
        info!("Rebuilt applied state with {} objects from the device", count);
        Ok(())
    }

    async fn read_live(&self) -> Result<DesiredConfig> {
        let mut live = DesiredConfig::new();
        for partition in self.managed_partitions().await? {
            let objects = self.traffic.list_objects(&partition).await?;
            debug!("Partition {} holds {} objects", partition, objects.len());
            live.extend(objects);
        }
        Ok(live)
    }

    /// Rebuild and report which records no longer matched the device
    async fn check_drift(&mut self) -> Result<usize> {
        let before = self.store.snapshot();
        self.rebuild_state().await?;
        let after = self.store.snapshot();

        let keys: BTreeSet<&ObjectKey> = before.keys().chain(after.keys()).collect();
        let drifted = keys
            .into_iter()
            .filter(|k| before.get(*k).map(|r| &r.body) != after.get(*k).map(|r| &r.body))
            .count();
        if drifted > 0 {
            warn!("Detected drift on {} objects", drifted);
        } else {
            debug!("No drift detected");
        }
        Ok(drifted)
    }

    async fn next_observation(&mut self) -> Option<Observation> {
        match &mut self.source {
            ObservationSource::Direct(observer) => Some(observer.observe().await),
            ObservationSource::Feed(rx) => rx.borrow_and_update().clone(),
        }
    }

    /// Run one full cycle
    #[instrument(skip(self), fields(cycle = self.cycle + 1))]
    pub async fn run_cycle(&mut self) -> CycleResult {
        self.cycle += 1;
        let started_at = Utc::now();
        let started = Instant::now();

        let result = self.reconcile_once().await;

        let elapsed = started.elapsed();
        #[cfg(feature = "metrics")]
        super::metrics::observe_cycle_duration_seconds(elapsed.as_secs_f64());
        self.publish_object_metrics();

        let objects = self
            .lifecycle
            .iter()
            .map(|(key, phase)| ObjectStatus {
                object: key.to_string(),
                phase,
            })
            .collect();
        self.health
            .record_cycle(result.summary(started_at, elapsed), objects);
        result
    }

    async fn reconcile_once(&mut self) -> CycleResult {
        let cycle = self.cycle;
        if *self.shutdown.borrow() {
            return CycleResult::skipped(cycle, "shutdown", "shutdown requested".to_string());
        }

        if self.needs_rebuild {
            if let Err(e) = self.rebuild_state().await {
                return CycleResult::skipped(
                    cycle,
                    "rebuild_failed",
                    format!("applied state rebuild failed: {e}"),
                );
            }
        } else if self.settings.drift_check_every > 0
            && cycle % self.settings.drift_check_every == 0
        {
            if let Err(e) = self.check_drift().await {
                warn!("Drift check failed: {}", e);
            }
        }

        let snapshot = match self.next_observation().await {
            Some(Observation::Fresh(snapshot)) => snapshot,
            Some(Observation::Stale(snapshot)) => {
                warn!(
                    "Reconciling against stale topology revision {}",
                    snapshot.revision
                );
                snapshot
            }
            Some(Observation::Untrusted(reason)) => {
                return CycleResult::skipped(
                    cycle,
                    "untrusted_topology",
                    format!("untrusted topology: {reason}"),
                );
            }
            Some(Observation::Unavailable(reason)) => {
                return CycleResult::skipped(
                    cycle,
                    "orchestrator_unavailable",
                    format!("orchestrator unavailable: {reason}"),
                );
            }
            None => {
                return CycleResult::skipped(
                    cycle,
                    "no_observation",
                    "no topology observed yet".to_string(),
                );
            }
        };

        let desired = match translate(&snapshot, &self.settings.translate) {
            Ok(desired) => desired,
            Err(e) => {
                error!("Translating revision {} failed: {}", snapshot.revision, e);
                return CycleResult::skipped(cycle, "translation_failed", e.to_string());
            }
        };

        let plan = compute_plan(&desired, &self.store.snapshot());
        if plan.is_empty() {
            debug!(
                "Cycle {}: {} objects already in sync",
                cycle,
                desired.len()
            );
            return CycleResult {
                cycle,
                ..Default::default()
            };
        }
        info!(
            "Cycle {}: {} operations planned for revision {} {:?}",
            cycle,
            plan.len(),
            snapshot.revision,
            summarize(&plan)
        );

        self.lifecycle.mark_planned(&plan);
        let report = self
            .reconciler
            .execute(
                &plan,
                self.traffic.as_ref(),
                self.store.as_mut(),
                &self.shutdown,
            )
            .await;

        for (key, action) in &report.applied {
            self.lifecycle.mark_succeeded(key, *action);
        }
        if let Err(e) = self.store.flush() {
            error!("Persisting applied state failed: {}", e);
        }
        self.health.set_unauthorized(report.unauthorized);

        if self.settings.collect_garbage && !self.reconciler.config().dry_run {
            self.collect_garbage(&report.applied).await;
        }

        info!(
            "Cycle {} finished: {} applied, {} failed, {} deferred, {} cancelled",
            cycle,
            report.applied.len(),
            report.failed.len(),
            report.deferred.len(),
            report.cancelled.len()
        );
        CycleResult {
            cycle,
            applied: report.applied,
            failed: report.failed,
            deferred: report.deferred,
            skipped: false,
            skip_reason: None,
            cancelled: report.cancelled,
        }
    }

    /// Remove orphaned nodes from partitions where pools changed
    async fn collect_garbage(&self, applied: &[(ObjectKey, Action)]) {
        let partitions: BTreeSet<&str> = applied
            .iter()
            .filter(|(key, _)| key.kind == ObjectKind::Pool)
            .map(|(key, _)| key.partition.as_str())
            .collect();
        for partition in partitions {
            match self.traffic.collect_garbage(partition).await {
                Ok(removed) if !removed.is_empty() => {
                    info!(
                        "Removed {} orphaned nodes from partition {}",
                        removed.len(),
                        partition
                    )
                }
                Ok(_) => {}
                Err(e) => warn!("Garbage collection in partition {} failed: {}", partition, e),
            }
        }
    }

    fn publish_object_metrics(&self) {
        #[cfg(feature = "metrics")]
        {
            use std::collections::BTreeMap;

            let mut counts: BTreeMap<ObjectKind, usize> =
                ObjectKind::ALL.iter().map(|k| (*k, 0)).collect();
            for key in self.store.snapshot().keys() {
                *counts.entry(key.kind).or_insert(0) += 1;
            }
            for (kind, count) in counts {
                super::metrics::set_managed_objects(kind.as_str(), count);
            }
        }
    }

    /// Swap inline observation for a spawned observer feeding a watch channel
    fn start_feed(&mut self, poll_interval: Duration) -> watch::Receiver<Option<Observation>> {
        let (_, idle) = watch::channel(None);
        let rx = match std::mem::replace(&mut self.source, ObservationSource::Feed(idle)) {
            ObservationSource::Direct(observer) => {
                let (rx, _handle) = observer.spawn(poll_interval, self.shutdown.clone());
                rx
            }
            ObservationSource::Feed(rx) => rx,
        };
        self.source = ObservationSource::Feed(rx.clone());
        rx
    }

    /// Reconcile every time the observer publishes, until shutdown
    pub async fn run(mut self, poll_interval: Duration) {
        let mut shutdown = self.shutdown.clone();
        let mut feed = self.start_feed(poll_interval);
        info!("Controller loop started");

        loop {
            tokio::select! {
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                    continue;
                }
                changed = feed.changed() => {
                    if changed.is_err() {
                        warn!("Observer stopped publishing");
                        break;
                    }
                }
            }

            let result = self.run_cycle().await;
            if !result.is_converged() && !result.skipped {
                debug!("Cycle {} left work for the next cycle", result.cycle);
            }
        }

        if let Err(e) = self.store.flush() {
            error!("Persisting applied state on shutdown failed: {}", e);
        }
        info!("Controller stopped after {} cycles", self.cycle);
    }
}
