//! Prometheus metrics for the BIG-IP controller
//!
//! # Exported metrics
//! The `/metrics` endpoint (when built with `--features metrics`) exports the following metrics:
//! - `bigip_ctlr_cycle_duration_seconds` (histogram): duration of reconciliation cycles.
//! - `bigip_ctlr_operations_total` (counter): operations labeled by kind, action and result.
//! - `bigip_ctlr_skipped_cycles_total` (counter): cycles skipped, labeled by reason.
//! - `bigip_ctlr_managed_objects` (gauge): objects in the applied record labeled by kind.
//! - `bigip_ctlr_healthy` (gauge): 1 while the controller considers itself healthy.

use std::sync::atomic::{AtomicI64, AtomicU64};

use once_cell::sync::Lazy;
use prometheus_client::encoding::EncodeLabelSet;
use prometheus_client::metrics::counter::Counter;
use prometheus_client::metrics::family::Family;
use prometheus_client::metrics::gauge::Gauge;
use prometheus_client::metrics::histogram::{exponential_buckets, Histogram};
use prometheus_client::registry::Registry;

/// Labels for traffic manager operations
#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct OperationLabels {
    /// Object kind, e.g. "pool"
    pub kind: String,
    /// "create", "update" or "delete"
    pub action: String,
    /// "success", "failure" or "deferred"
    pub result: String,
}

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct SkipLabels {
    pub reason: String,
}

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct KindLabels {
    pub kind: String,
}

/// Histogram tracking cycle duration (seconds)
pub static CYCLE_DURATION_SECONDS: Lazy<Histogram> = Lazy::new(|| {
    // 1ms .. ~32s across 16 buckets.
    Histogram::new(exponential_buckets(0.001, 2.0, 16))
});

pub static OPERATIONS_TOTAL: Lazy<Family<OperationLabels, Counter<u64, AtomicU64>>> =
    Lazy::new(Family::default);

pub static SKIPPED_CYCLES_TOTAL: Lazy<Family<SkipLabels, Counter<u64, AtomicU64>>> =
    Lazy::new(Family::default);

pub static MANAGED_OBJECTS: Lazy<Family<KindLabels, Gauge<i64, AtomicI64>>> =
    Lazy::new(Family::default);

pub static HEALTHY: Lazy<Gauge<i64, AtomicI64>> = Lazy::new(Gauge::default);

/// Global metrics registry
pub static REGISTRY: Lazy<Registry> = Lazy::new(|| {
    let mut registry = Registry::default();

    registry.register(
        "bigip_ctlr_cycle_duration_seconds",
        "Duration of reconciliation cycles in seconds",
        CYCLE_DURATION_SECONDS.clone(),
    );
    registry.register(
        "bigip_ctlr_operations",
        "Total number of traffic manager operations by result",
        OPERATIONS_TOTAL.clone(),
    );
    registry.register(
        "bigip_ctlr_skipped_cycles",
        "Total number of cycles skipped before reconciling",
        SKIPPED_CYCLES_TOTAL.clone(),
    );
    registry.register(
        "bigip_ctlr_managed_objects",
        "Objects currently in the applied record",
        MANAGED_OBJECTS.clone(),
    );
    registry.register(
        "bigip_ctlr_healthy",
        "Whether the controller is healthy (1) or not (0)",
        HEALTHY.clone(),
    );

    registry
});

pub fn observe_cycle_duration_seconds(seconds: f64) {
    CYCLE_DURATION_SECONDS.observe(seconds);
}

pub fn inc_operation(kind: &str, action: &str, result: &str) {
    let labels = OperationLabels {
        kind: kind.to_string(),
        action: action.to_string(),
        result: result.to_string(),
    };
    OPERATIONS_TOTAL.get_or_create(&labels).inc();
}

pub fn inc_skipped_cycle(reason: &str) {
    let labels = SkipLabels {
        reason: reason.to_string(),
    };
    SKIPPED_CYCLES_TOTAL.get_or_create(&labels).inc();
}

pub fn set_managed_objects(kind: &str, count: usize) {
    let labels = KindLabels {
        kind: kind.to_string(),
    };
    MANAGED_OBJECTS
        .get_or_create(&labels)
        .set(i64::try_from(count).unwrap_or(i64::MAX));
}

pub fn set_healthy(healthy: bool) {
    HEALTHY.set(i64::from(healthy));
}

#[cfg(test)]
mod tests {
    use super::*;
    use prometheus_client::encoding::text::encode;

    #[test]
    fn test_registry_exports_operation_counter() {
        inc_operation("pool", "create", "success");
        set_managed_objects("pool", 3);
        set_healthy(true);
        observe_cycle_duration_seconds(0.25);

        let mut buffer = String::new();
        encode(&mut buffer, &REGISTRY).unwrap();
        assert!(buffer.contains("bigip_ctlr_operations_total"));
        assert!(buffer.contains("kind=\"pool\""));
        assert!(buffer.contains("bigip_ctlr_managed_objects"));
    }

    #[test]
    fn test_skipped_cycle_counter() {
        inc_skipped_cycle("untrusted_topology");
        let labels = SkipLabels {
            reason: "untrusted_topology".to_string(),
        };
        assert!(SKIPPED_CYCLES_TOTAL.get_or_create(&labels).get() >= 1);
    }
}
