//! Test doubles shared by the unit tests

use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::net::IpAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;

use crate::bigip::{OperationError, TrafficManager};
use crate::error::{Error, Result};
use crate::model::{
    DesiredConfig, Endpoint, Frontend, HealthCheck, HealthProtocol, Mode, ObjectBody, ObjectKey,
    Operation, Service, DEFAULT_LB_METHOD,
};
use crate::observer::Orchestrator;

/// In-memory traffic manager that enforces references and monitor name
/// uniqueness like the device does
#[derive(Default)]
pub struct FakeDevice {
    objects: Mutex<DesiredConfig>,
    calls: Mutex<Vec<Operation>>,
    faults: Mutex<BTreeMap<ObjectKey, VecDeque<OperationError>>>,
    permanent: Mutex<BTreeMap<ObjectKey, OperationError>>,
    listing_fault: Mutex<Option<OperationError>>,
    latency: Mutex<Option<Duration>>,
    in_flight: AtomicUsize,
    peak_in_flight: AtomicUsize,
    /// Node addresses per partition
    nodes: Mutex<BTreeMap<String, BTreeSet<String>>>,
    collected: Mutex<Vec<String>>,
}

impl FakeDevice {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn with_objects(objects: DesiredConfig) -> Arc<Self> {
        let device = Self::default();
        *device.objects.lock().unwrap() = objects;
        Arc::new(device)
    }

    /// Return these errors, one per call, before behaving normally again
    pub fn fail_next(&self, key: &ObjectKey, errors: Vec<OperationError>) {
        self.faults
            .lock()
            .unwrap()
            .entry(key.clone())
            .or_default()
            .extend(errors);
    }

    pub fn fail_always(&self, key: &ObjectKey, error: OperationError) {
        self.permanent.lock().unwrap().insert(key.clone(), error);
    }

    pub fn fail_listing(&self, error: Option<OperationError>) {
        *self.listing_fault.lock().unwrap() = error;
    }

    pub fn calls(&self) -> Vec<Operation> {
        self.calls.lock().unwrap().clone()
    }

    pub fn clear_calls(&self) {
        self.calls.lock().unwrap().clear();
    }

    pub fn objects(&self) -> DesiredConfig {
        self.objects.lock().unwrap().clone()
    }

    /// Change an object behind the controller's back
    pub fn tamper(&self, key: &ObjectKey, body: Option<ObjectBody>) {
        let mut objects = self.objects.lock().unwrap();
        match body {
            Some(body) => objects.insert(key.clone(), body),
            None => objects.remove(key),
        };
    }

    /// Hold every apply for `latency` so concurrent calls overlap
    pub fn slow_down(&self, latency: Duration) {
        *self.latency.lock().unwrap() = Some(latency);
    }

    /// Most applies that were ever running at the same time
    pub fn peak_in_flight(&self) -> usize {
        self.peak_in_flight.load(Ordering::SeqCst)
    }

    pub fn add_node(&self, partition: &str, address: &str) {
        self.nodes
            .lock()
            .unwrap()
            .entry(partition.to_string())
            .or_default()
            .insert(address.to_string());
    }

    pub fn nodes(&self, partition: &str) -> Vec<String> {
        self.nodes
            .lock()
            .unwrap()
            .get(partition)
            .map(|n| n.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Partitions garbage collection ran in, in call order
    pub fn collected_partitions(&self) -> Vec<String> {
        self.collected.lock().unwrap().clone()
    }

    fn injected_fault(&self, key: &ObjectKey) -> Option<OperationError> {
        if let Some(error) = self.permanent.lock().unwrap().get(key) {
            return Some(error.clone());
        }
        self.faults
            .lock()
            .unwrap()
            .get_mut(key)
            .and_then(VecDeque::pop_front)
    }
}

struct InFlight<'a>(&'a AtomicUsize);

impl<'a> InFlight<'a> {
    fn enter(counter: &'a AtomicUsize, peak: &AtomicUsize) -> Self {
        let now = counter.fetch_add(1, Ordering::SeqCst) + 1;
        peak.fetch_max(now, Ordering::SeqCst);
        Self(counter)
    }
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

fn rejected(message: String) -> OperationError {
    OperationError::Rejected {
        status: 400,
        message,
    }
}

#[async_trait]
impl TrafficManager for FakeDevice {
    async fn apply(&self, operation: &Operation) -> std::result::Result<(), OperationError> {
        self.calls.lock().unwrap().push(operation.clone());
        let _in_flight = InFlight::enter(&self.in_flight, &self.peak_in_flight);
        let latency = *self.latency.lock().unwrap();
        if let Some(latency) = latency {
            tokio::time::sleep(latency).await;
        }
        let key = operation.key();
        if let Some(error) = self.injected_fault(key) {
            return Err(error);
        }

        let mut objects = self.objects.lock().unwrap();
        match operation {
            Operation::Create { body, .. } | Operation::Update { body, .. } => {
                let exists = objects.contains_key(key);
                let name_taken = key.kind.is_monitor()
                    && objects.keys().any(|k| {
                        k.kind.is_monitor()
                            && k.kind != key.kind
                            && k.partition == key.partition
                            && k.name == key.name
                    });
                if matches!(operation, Operation::Create { .. }) && (exists || name_taken) {
                    return Err(OperationError::AlreadyExists);
                }
                if matches!(operation, Operation::Update { .. }) && !exists {
                    return Err(OperationError::NotFound);
                }
                if let Some(missing) = body.references().into_iter().find(|r| !objects.contains_key(r)) {
                    return Err(rejected(format!("{missing} does not exist")));
                }
                objects.insert(key.clone(), body.clone());
            }
            Operation::Delete { .. } => {
                if !objects.contains_key(key) {
                    return Err(OperationError::NotFound);
                }
                if let Some((user, _)) = objects
                    .iter()
                    .find(|(k, b)| *k != key && b.references().contains(key))
                {
                    return Err(rejected(format!("{key} is in use by {user}")));
                }
                objects.remove(key);
            }
        }
        Ok(())
    }

    async fn list_objects(&self, partition: &str) -> std::result::Result<DesiredConfig, OperationError> {
        if let Some(error) = self.listing_fault.lock().unwrap().clone() {
            return Err(error);
        }
        Ok(self
            .objects
            .lock()
            .unwrap()
            .iter()
            .filter(|(k, _)| k.partition == partition)
            .map(|(k, b)| (k.clone(), b.clone()))
            .collect())
    }

    async fn list_partitions(&self) -> std::result::Result<Vec<String>, OperationError> {
        if let Some(error) = self.listing_fault.lock().unwrap().clone() {
            return Err(error);
        }
        let partitions: BTreeSet<String> = self
            .objects
            .lock()
            .unwrap()
            .keys()
            .map(|k| k.partition.clone())
            .collect();
        Ok(partitions.into_iter().collect())
    }

    async fn collect_garbage(&self, partition: &str) -> std::result::Result<Vec<String>, OperationError> {
        self.collected.lock().unwrap().push(partition.to_string());
        let in_use: BTreeSet<String> = self
            .objects
            .lock()
            .unwrap()
            .iter()
            .filter(|(k, _)| k.partition == partition)
            .filter_map(|(_, body)| match body {
                ObjectBody::Pool(pool) => Some(pool.members.keys().cloned().collect::<Vec<_>>()),
                _ => None,
            })
            .flatten()
            .filter_map(|member| member.rsplit_once(':').map(|(addr, _)| addr.to_string()))
            .collect();

        let mut nodes = self.nodes.lock().unwrap();
        let Some(known) = nodes.get_mut(partition) else {
            return Ok(Vec::new());
        };
        let orphans: Vec<String> = known.difference(&in_use).cloned().collect();
        for orphan in &orphans {
            known.remove(orphan);
        }
        Ok(orphans)
    }
}

/// Orchestrator whose answer the test sets directly
#[derive(Default)]
pub struct StaticOrchestrator {
    answer: Mutex<Option<Result<Vec<Service>>>>,
}

impl StaticOrchestrator {
    pub fn new(services: Vec<Service>) -> Arc<Self> {
        let orchestrator = Self::default();
        orchestrator.set(services);
        Arc::new(orchestrator)
    }

    pub fn set(&self, services: Vec<Service>) {
        *self.answer.lock().unwrap() = Some(Ok(services));
    }

    pub fn set_error(&self, error: Error) {
        *self.answer.lock().unwrap() = Some(Err(error));
    }
}

#[async_trait]
impl Orchestrator for StaticOrchestrator {
    fn name(&self) -> &'static str {
        "static"
    }

    async fn fetch_services(&self) -> Result<Vec<Service>> {
        let answer = self.answer.lock().unwrap();
        match answer.as_ref() {
            Some(Ok(services)) => Ok(services.clone()),
            Some(Err(Error::MalformedTopology(m))) => Err(Error::MalformedTopology(m.clone())),
            Some(Err(e)) => Err(Error::ObservationFailure(e.to_string())),
            None => Err(Error::ObservationFailure("no answer configured".into())),
        }
    }
}

/// HTTP service in partition `mesos` with one HTTP health check
pub fn http_service(id: &str, members: &[&str]) -> Service {
    Service {
        id: id.to_string(),
        partition: "mesos".to_string(),
        frontend: Frontend {
            bind_addr: "10.128.10.240".parse().unwrap(),
            port: 80,
            mode: Mode::Http,
            balance: DEFAULT_LB_METHOD.to_string(),
            ssl_profile: None,
        },
        endpoints: members.iter().map(|m| endpoint(m)).collect(),
        health_checks: vec![HealthCheck {
            protocol: HealthProtocol::Http,
            path: Some("/health".to_string()),
            interval_secs: 20,
            timeout_secs: 20,
            max_consecutive_failures: 3,
        }],
        routes: vec![],
    }
}

/// `a.b.c.d:port` into a healthy endpoint
pub fn endpoint(member: &str) -> Endpoint {
    let (address, port) = member.rsplit_once(':').unwrap();
    Endpoint::healthy(address.parse::<IpAddr>().unwrap(), port.parse().unwrap())
}
