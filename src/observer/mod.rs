//! State Observer
//!
//! Polls the orchestrator and turns each successful answer into an immutable
//! [`TopologySnapshot`]. Transient failures are retried with backoff; once
//! retries are exhausted the last good snapshot is reused.

pub mod kubernetes;
pub mod marathon;

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::controller::backoff::{sleep_or_shutdown, BackoffPolicy};
use crate::error::{Error, Result};
use crate::model::{PartitionFilter, Service, TopologySnapshot};

pub use kubernetes::{KubernetesOrchestrator, KubernetesSettings};
pub use marathon::{MarathonOrchestrator, MarathonSettings};

/// Source of the application topology
#[async_trait]
pub trait Orchestrator: Send + Sync {
    /// Short name used in logs
    fn name(&self) -> &'static str;

    /// All routable services. Return [`Error::ObservationFailure`] when the
    /// orchestrator could not be reached and [`Error::MalformedTopology`]
    /// when its answer cannot be trusted.
    async fn fetch_services(&self) -> Result<Vec<Service>>;
}

/// Result of one observation attempt
#[derive(Clone, Debug)]
pub enum Observation {
    /// Newly fetched snapshot
    Fresh(Arc<TopologySnapshot>),
    /// Fetching failed; this is the last good snapshot
    Stale(Arc<TopologySnapshot>),
    /// The orchestrator answered with data that cannot be used
    Untrusted(String),
    /// Fetching failed and no earlier snapshot exists
    Unavailable(String),
}

impl Observation {
    pub fn snapshot(&self) -> Option<&Arc<TopologySnapshot>> {
        match self {
            Observation::Fresh(s) | Observation::Stale(s) => Some(s),
            Observation::Untrusted(_) | Observation::Unavailable(_) => None,
        }
    }

    pub fn is_fresh(&self) -> bool {
        matches!(self, Observation::Fresh(_))
    }
}

pub struct StateObserver {
    orchestrator: Arc<dyn Orchestrator>,
    backoff: BackoffPolicy,
    partitions: PartitionFilter,
    revision: u64,
    last_good: Option<Arc<TopologySnapshot>>,
    shutdown: Option<watch::Receiver<bool>>,
}

impl StateObserver {
    pub fn new(
        orchestrator: Arc<dyn Orchestrator>,
        backoff: BackoffPolicy,
        partitions: PartitionFilter,
    ) -> Self {
        Self {
            orchestrator,
            backoff,
            partitions,
            revision: 0,
            last_good: None,
            shutdown: None,
        }
    }

    /// Stop retrying as soon as shutdown is requested
    pub fn with_shutdown(mut self, shutdown: watch::Receiver<bool>) -> Self {
        self.shutdown = Some(shutdown);
        self
    }

    /// Fetch, normalize and publish one snapshot
    pub async fn observe(&mut self) -> Observation {
        let mut attempt = 0;
        let failure = loop {
            match self.orchestrator.fetch_services().await {
                Ok(services) => {
                    let snapshot = Arc::new(self.normalize(services));
                    debug!(
                        "Observed revision {} with {} services from {}",
                        snapshot.revision,
                        snapshot.len(),
                        self.orchestrator.name()
                    );
                    self.last_good = Some(snapshot.clone());
                    return Observation::Fresh(snapshot);
                }
                Err(e @ Error::MalformedTopology(_)) => {
                    error!("{} returned malformed data: {}", self.orchestrator.name(), e);
                    return Observation::Untrusted(e.to_string());
                }
                Err(e) if e.is_retriable() => {
                    attempt += 1;
                    if !self.backoff.allows_retry(attempt) {
                        break e;
                    }
                    let delay = self.backoff.delay(attempt - 1);
                    warn!(
                        "Observing {} failed (attempt {}/{}): {}, retrying in {:?}",
                        self.orchestrator.name(),
                        attempt,
                        self.backoff.max_attempts,
                        e,
                        delay
                    );
                    match &self.shutdown {
                        Some(shutdown) => {
                            if sleep_or_shutdown(delay, shutdown).await {
                                info!("Shutdown requested, abandoning observation retries");
                                break e;
                            }
                        }
                        None => tokio::time::sleep(delay).await,
                    }
                }
                Err(e) => break e,
            }
        };

        match &self.last_good {
            Some(snapshot) => {
                warn!(
                    "Observing {} failed: {}; reusing revision {}",
                    self.orchestrator.name(),
                    failure,
                    snapshot.revision
                );
                Observation::Stale(snapshot.clone())
            }
            None => {
                error!(
                    "Observing {} failed and no earlier snapshot exists: {}",
                    self.orchestrator.name(),
                    failure
                );
                Observation::Unavailable(failure.to_string())
            }
        }
    }

    fn normalize(&mut self, services: Vec<Service>) -> TopologySnapshot {
        let mut kept = Vec::with_capacity(services.len());
        let mut ids = HashSet::with_capacity(services.len());
        for mut service in services {
            if !self.partitions.manages(&service.partition) {
                debug!(
                    "Ignoring service {} in unmanaged partition '{}'",
                    service.id, service.partition
                );
                continue;
            }
            let problems = service.validate();
            if !problems.is_empty() {
                for problem in problems {
                    error!("Dropping invalid service: {}", problem);
                }
                continue;
            }
            if !ids.insert(service.id.clone()) {
                error!(
                    "Dropping service {}: another service already uses this id",
                    service.id
                );
                continue;
            }
            service.normalize();
            kept.push(service);
        }
        self.revision += 1;
        TopologySnapshot::new(self.revision, kept)
    }

    /// Poll on `interval` and publish every observation into a single-slot
    /// buffer. Readers only ever see the latest value.
    pub fn spawn(
        mut self,
        interval: Duration,
        mut shutdown: watch::Receiver<bool>,
    ) -> (watch::Receiver<Option<Observation>>, JoinHandle<()>) {
        let (tx, rx) = watch::channel(None);
        if self.shutdown.is_none() {
            self.shutdown = Some(shutdown.clone());
        }
        let handle = tokio::spawn(async move {
            info!(
                "Observing {} every {:?}",
                self.orchestrator.name(),
                interval
            );
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {}
                    changed = shutdown.changed() => {
                        if changed.is_err() || *shutdown.borrow() {
                            break;
                        }
                        continue;
                    }
                }
                let observation = self.observe().await;
                if tx.send(Some(observation)).is_err() {
                    debug!("No readers left for observations");
                    break;
                }
            }
            info!("Observer for {} stopped", self.orchestrator.name());
        });
        (rx, handle)
    }
}
