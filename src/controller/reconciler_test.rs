//! Tests for plan execution
//!
//! These tests verify:
//! - Dependency ordering (monitors before pools before virtual servers)
//! - Deferral when a dependency failed
//! - Create/update fallbacks and idempotent deletes
//! - Retry of transient failures and surfacing of permanent ones
//! - Dry-run and shutdown handling

#[cfg(test)]
mod tests {
    use super::super::backoff::BackoffPolicy;
    use super::super::diff::compute_plan;
    use super::super::reconciler::*;
    use super::super::translator::{translate, TranslateOptions};
    use crate::bigip::OperationError;
    use crate::error::Error;
    use crate::model::{Action, DesiredConfig, ObjectKey, ObjectKind, Operation, TopologySnapshot};
    use crate::store::{MemoryStore, StateStore};
    use crate::testing::{http_service, FakeDevice};
    use tokio::sync::watch;

    fn desired(services: &[(&str, &[&str])]) -> DesiredConfig {
        let services = services
            .iter()
            .map(|(id, members)| http_service(id, members))
            .collect::<Vec<_>>();
        translate(&TopologySnapshot::new(1, services), &TranslateOptions::default()).unwrap()
    }

    fn reconciler() -> Reconciler {
        Reconciler::new(ReconcilerConfig {
            worker_limit: 4,
            retry: BackoffPolicy::immediate(3),
            dry_run: false,
        })
    }

    fn key(kind: ObjectKind, name: &str) -> ObjectKey {
        ObjectKey::new(kind, "mesos", name)
    }

    fn running() -> (watch::Sender<bool>, watch::Receiver<bool>) {
        watch::channel(false)
    }

    #[tokio::test]
    async fn test_fresh_plan_applies_in_dependency_order() {
        let device = FakeDevice::new();
        let mut store = MemoryStore::new();
        let (_tx, shutdown) = running();
        let desired = desired(&[("svc-a", &["10.0.0.1:8080"]), ("svc-b", &["10.0.0.2:8080"])]);
        let plan = compute_plan(&desired, &store.snapshot());

        let report = reconciler()
            .execute(&plan, device.as_ref(), &mut store, &shutdown)
            .await;

        assert_eq!(report.applied.len(), 6);
        assert!(report.failed.is_empty());
        assert!(report.deferred.is_empty());
        assert_eq!(device.objects(), desired);

        let ranks: Vec<u8> = device.calls().iter().map(|op| op.key().kind.rank()).collect();
        let mut sorted = ranks.clone();
        sorted.sort();
        assert_eq!(ranks, sorted);

        let snapshot = store.snapshot();
        assert_eq!(snapshot.len(), 6);
        assert!(snapshot.values().all(|record| record.generation > 0));
    }

    #[tokio::test]
    async fn test_deletes_run_virtual_servers_first() {
        let existing = desired(&[("svc-a", &["10.0.0.1:8080"])]);
        let device = FakeDevice::with_objects(existing.clone());
        let mut store = MemoryStore::new();
        store.replace_all(existing).unwrap();
        let (_tx, shutdown) = running();

        let plan = compute_plan(&DesiredConfig::new(), &store.snapshot());
        let report = reconciler()
            .execute(&plan, device.as_ref(), &mut store, &shutdown)
            .await;

        assert_eq!(report.applied.len(), 3);
        assert!(device.objects().is_empty());
        assert!(store.snapshot().is_empty());
        let kinds: Vec<ObjectKind> = device.calls().iter().map(|op| op.key().kind).collect();
        assert_eq!(
            kinds,
            vec![ObjectKind::VirtualServer, ObjectKind::Pool, ObjectKind::HttpMonitor]
        );
    }

    #[tokio::test]
    async fn test_failed_pool_defers_its_virtual_server_only() {
        let device = FakeDevice::new();
        device.fail_always(
            &key(ObjectKind::Pool, "svc-a"),
            OperationError::Rejected {
                status: 400,
                message: "invalid member".to_string(),
            },
        );
        let mut store = MemoryStore::new();
        let (_tx, shutdown) = running();
        let desired = desired(&[("svc-a", &["10.0.0.1:8080"]), ("svc-b", &["10.0.0.2:8080"])]);
        let plan = compute_plan(&desired, &store.snapshot());

        let report = reconciler()
            .execute(&plan, device.as_ref(), &mut store, &shutdown)
            .await;

        assert_eq!(report.failed.len(), 1);
        assert_eq!(report.failed[0].0, key(ObjectKind::Pool, "svc-a"));
        assert_eq!(report.deferred, vec![key(ObjectKind::VirtualServer, "svc-a")]);
        // svc-b converged fully; svc-a kept its monitor
        assert_eq!(report.applied.len(), 4);
        assert!(store.get(&key(ObjectKind::VirtualServer, "svc-b")).is_some());
        assert!(store.get(&key(ObjectKind::HttpMonitor, "svc-a_http")).is_some());
        assert!(store.get(&key(ObjectKind::Pool, "svc-a")).is_none());
    }

    #[tokio::test]
    async fn test_failed_virtual_server_delete_defers_pool_delete() {
        let existing = desired(&[("svc-a", &["10.0.0.1:8080"])]);
        let device = FakeDevice::with_objects(existing.clone());
        device.fail_always(
            &key(ObjectKind::VirtualServer, "svc-a"),
            OperationError::Rejected {
                status: 400,
                message: "locked".to_string(),
            },
        );
        let mut store = MemoryStore::new();
        store.replace_all(existing).unwrap();
        let (_tx, shutdown) = running();

        let plan = compute_plan(&DesiredConfig::new(), &store.snapshot());
        let report = reconciler()
            .execute(&plan, device.as_ref(), &mut store, &shutdown)
            .await;

        assert_eq!(report.failed.len(), 1);
        assert_eq!(report.deferred.len(), 2);
        assert!(report.applied.is_empty());
        assert_eq!(store.snapshot().len(), 3);
        assert_eq!(device.objects().len(), 3);
    }

    #[tokio::test]
    async fn test_create_of_existing_object_becomes_update() {
        let existing = desired(&[("svc-a", &["10.0.0.1:8080"])]);
        let device = FakeDevice::with_objects(existing);
        let mut store = MemoryStore::new();
        let (_tx, shutdown) = running();

        let wanted = desired(&[("svc-a", &["10.0.0.1:8080", "10.0.0.2:8080"])]);
        let plan = compute_plan(&wanted, &store.snapshot());
        let report = reconciler()
            .execute(&plan, device.as_ref(), &mut store, &shutdown)
            .await;

        assert!(report.failed.is_empty());
        assert_eq!(device.objects(), wanted);
        let pool_key = key(ObjectKind::Pool, "svc-a");
        let pool_calls: Vec<Action> = device
            .calls()
            .iter()
            .filter(|op| op.key() == &pool_key)
            .map(Operation::action)
            .collect();
        assert_eq!(pool_calls, vec![Action::Create, Action::Update]);
        assert!(report
            .applied
            .contains(&(pool_key, Action::Update)));
    }

    #[tokio::test]
    async fn test_update_of_missing_object_becomes_create() {
        let applied = desired(&[("svc-a", &["10.0.0.1:8080"])]);
        let mut live = applied.clone();
        live.remove(&key(ObjectKind::VirtualServer, "svc-a"));
        let device = FakeDevice::with_objects(live);
        let mut store = MemoryStore::new();
        store.replace_all(applied).unwrap();
        let (_tx, shutdown) = running();

        let wanted = desired(&[("svc-a", &["10.0.0.2:8080"])]);
        let mut wanted_vs_changed = wanted.clone();
        if let Some(crate::model::ObjectBody::VirtualServer(vs)) =
            wanted_vs_changed.get_mut(&key(ObjectKind::VirtualServer, "svc-a"))
        {
            vs.snat_automap = false;
        }
        let plan = compute_plan(&wanted_vs_changed, &store.snapshot());
        let report = reconciler()
            .execute(&plan, device.as_ref(), &mut store, &shutdown)
            .await;

        assert!(report.failed.is_empty());
        assert_eq!(device.objects(), wanted_vs_changed);
        assert!(report
            .applied
            .contains(&(key(ObjectKind::VirtualServer, "svc-a"), Action::Create)));
    }

    #[tokio::test]
    async fn test_delete_of_absent_object_counts_as_applied() {
        let applied = desired(&[("svc-a", &["10.0.0.1:8080"])]);
        let device = FakeDevice::new();
        let mut store = MemoryStore::new();
        store.replace_all(applied).unwrap();
        let (_tx, shutdown) = running();

        let plan = compute_plan(&DesiredConfig::new(), &store.snapshot());
        let report = reconciler()
            .execute(&plan, device.as_ref(), &mut store, &shutdown)
            .await;

        assert_eq!(report.applied.len(), 3);
        assert!(report.failed.is_empty());
        assert!(store.snapshot().is_empty());
    }

    #[tokio::test]
    async fn test_transient_failures_are_retried() {
        let device = FakeDevice::new();
        let pool_key = key(ObjectKind::Pool, "svc-a");
        device.fail_next(
            &pool_key,
            vec![
                OperationError::Transient("503 Service Unavailable".to_string()),
                OperationError::Transient("connection reset".to_string()),
            ],
        );
        let mut store = MemoryStore::new();
        let (_tx, shutdown) = running();
        let desired = desired(&[("svc-a", &["10.0.0.1:8080"])]);
        let plan = compute_plan(&desired, &store.snapshot());

        let report = reconciler()
            .execute(&plan, device.as_ref(), &mut store, &shutdown)
            .await;

        assert!(report.failed.is_empty());
        assert_eq!(report.applied.len(), 3);
        let attempts = device.calls().iter().filter(|op| op.key() == &pool_key).count();
        assert_eq!(attempts, 3);
    }

    #[tokio::test]
    async fn test_exhausted_retries_surface_as_failure() {
        let device = FakeDevice::new();
        let monitor_key = key(ObjectKind::HttpMonitor, "svc-a_http");
        device.fail_always(&monitor_key, OperationError::Transient("timeout".to_string()));
        let mut store = MemoryStore::new();
        let (_tx, shutdown) = running();
        let desired = desired(&[("svc-a", &["10.0.0.1:8080"])]);
        let plan = compute_plan(&desired, &store.snapshot());

        let report = reconciler()
            .execute(&plan, device.as_ref(), &mut store, &shutdown)
            .await;

        assert_eq!(report.failed.len(), 1);
        assert_eq!(report.failed[0].0, monitor_key);
        assert!(matches!(
            &report.failed[0].1,
            Error::OperationFailure {
                source: OperationError::Transient(_),
                ..
            }
        ));
        assert_eq!(report.deferred.len(), 2);
        assert_eq!(
            device.calls().iter().filter(|op| op.key() == &monitor_key).count(),
            3
        );
        assert!(!report.unauthorized);
    }

    #[tokio::test]
    async fn test_unauthorized_is_reported() {
        let device = FakeDevice::new();
        let monitor_key = key(ObjectKind::HttpMonitor, "svc-a_http");
        device.fail_always(&monitor_key, OperationError::Unauthorized("401".to_string()));
        let mut store = MemoryStore::new();
        let (_tx, shutdown) = running();
        let desired = desired(&[("svc-a", &["10.0.0.1:8080"])]);
        let plan = compute_plan(&desired, &store.snapshot());

        let report = reconciler()
            .execute(&plan, device.as_ref(), &mut store, &shutdown)
            .await;

        assert!(report.unauthorized);
    }

    #[tokio::test]
    async fn test_dry_run_leaves_device_and_store_untouched() {
        let device = FakeDevice::new();
        let mut store = MemoryStore::new();
        let (_tx, shutdown) = running();
        let desired = desired(&[("svc-a", &["10.0.0.1:8080"])]);
        let plan = compute_plan(&desired, &store.snapshot());

        let reconciler = Reconciler::new(ReconcilerConfig {
            dry_run: true,
            ..Default::default()
        });
        let report = reconciler
            .execute(&plan, device.as_ref(), &mut store, &shutdown)
            .await;

        assert_eq!(report.applied.len(), 3);
        assert!(report.deferred.is_empty());
        assert!(device.calls().is_empty());
        assert!(store.snapshot().is_empty());
    }

    #[tokio::test]
    async fn test_shutdown_cancels_remaining_phases() {
        let device = FakeDevice::new();
        let mut store = MemoryStore::new();
        let (tx, shutdown) = running();
        tx.send(true).unwrap();
        let desired = desired(&[("svc-a", &["10.0.0.1:8080"])]);
        let plan = compute_plan(&desired, &store.snapshot());

        let report = reconciler()
            .execute(&plan, device.as_ref(), &mut store, &shutdown)
            .await;

        assert_eq!(report.cancelled.len(), 3);
        assert!(report.applied.is_empty());
        assert!(device.calls().is_empty());
    }

    #[tokio::test]
    async fn test_worker_limit_bounds_operations_in_flight() {
        let device = FakeDevice::new();
        device.slow_down(std::time::Duration::from_millis(20));
        let mut store = MemoryStore::new();
        let (_tx, shutdown) = running();
        let services = (0..6)
            .map(|i| http_service(&format!("svc-{i}"), &[format!("10.0.0.{}:8080", i + 1).as_str()]))
            .collect::<Vec<_>>();
        let desired =
            translate(&TopologySnapshot::new(1, services), &TranslateOptions::default()).unwrap();
        let plan = compute_plan(&desired, &store.snapshot());

        let reconciler = Reconciler::new(ReconcilerConfig {
            worker_limit: 2,
            retry: BackoffPolicy::immediate(1),
            dry_run: false,
        });
        let report = reconciler
            .execute(&plan, device.as_ref(), &mut store, &shutdown)
            .await;

        assert_eq!(report.applied.len(), 18);
        assert_eq!(device.peak_in_flight(), 2);
    }
}
