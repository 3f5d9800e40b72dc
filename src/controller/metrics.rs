//! Prometheus metrics for the load balancer controller
//!
//! # Exported metrics
//! The `/metrics` endpoint (when built with `--features metrics`) exports the following metrics:
//! - `hcloud_lb_reconcile_duration_seconds` (histogram): duration of Ensure/Update/EnsureDeleted labeled by operation.
//! - `hcloud_lb_reconcile_errors_total` (counter): failed operations labeled by operation and error kind.
//! - `hcloud_lb_cloud_api_calls_total` (counter): Hetzner Cloud API requests labeled by method and route.

use std::sync::atomic::AtomicU64;

use once_cell::sync::Lazy;
use prometheus_client::encoding::EncodeLabelSet;
use prometheus_client::metrics::counter::Counter;
use prometheus_client::metrics::family::Family;
use prometheus_client::metrics::histogram::{exponential_buckets, Histogram};
use prometheus_client::registry::Registry;

/// Labels for reconcile metrics
#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct OperationLabels {
    /// Public operation, e.g. "ensure"
    pub operation: String,
}

/// Labels for reconcile error metrics
#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct ErrorLabels {
    pub operation: String,
    /// Error kind/category, e.g. "cloud_api", "annotation", "config"
    pub kind: String,
}

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct ApiCallLabels {
    /// Method and route with IDs collapsed, e.g. "POST /load_balancers/{id}/actions/add_service"
    pub call: String,
}

/// Histogram tracking operation duration (seconds)
pub static RECONCILE_DURATION_SECONDS: Lazy<Family<OperationLabels, Histogram>> = Lazy::new(|| {
    fn reconcile_histogram() -> Histogram {
        // 10ms .. ~5.5min across 16 buckets; action waits dominate.
        Histogram::new(exponential_buckets(0.01, 2.0, 16))
    }

    Family::new_with_constructor(reconcile_histogram)
});

/// Counter tracking failed operations
pub static RECONCILE_ERRORS_TOTAL: Lazy<Family<ErrorLabels, Counter<u64, AtomicU64>>> =
    Lazy::new(Family::default);

/// Counter tracking cloud API requests
pub static CLOUD_API_CALLS_TOTAL: Lazy<Family<ApiCallLabels, Counter<u64, AtomicU64>>> =
    Lazy::new(Family::default);

/// Global metrics registry
pub static REGISTRY: Lazy<Registry> = Lazy::new(|| {
    let mut registry = Registry::default();

    registry.register(
        "hcloud_lb_reconcile_duration_seconds",
        "Duration of load balancer operations in seconds",
        RECONCILE_DURATION_SECONDS.clone(),
    );
    // Counters get their `_total` suffix from the encoder.
    registry.register(
        "hcloud_lb_reconcile_errors",
        "Total number of failed load balancer operations",
        RECONCILE_ERRORS_TOTAL.clone(),
    );
    registry.register(
        "hcloud_lb_cloud_api_calls",
        "Total number of Hetzner Cloud API requests",
        CLOUD_API_CALLS_TOTAL.clone(),
    );

    registry
});

/// Observe an operation duration in seconds.
pub fn observe_reconcile_duration_seconds(operation: &str, seconds: f64) {
    let labels = OperationLabels {
        operation: operation.to_string(),
    };
    RECONCILE_DURATION_SECONDS
        .get_or_create(&labels)
        .observe(seconds);
}

/// Increment the reconcile error counter.
pub fn inc_reconcile_error(operation: &str, kind: &str) {
    let labels = ErrorLabels {
        operation: operation.to_string(),
        kind: kind.to_string(),
    };
    RECONCILE_ERRORS_TOTAL.get_or_create(&labels).inc();
}

pub fn inc_cloud_api_call(call: &str) {
    let labels = ApiCallLabels {
        call: call.to_string(),
    };
    CLOUD_API_CALLS_TOTAL.get_or_create(&labels).inc();
}

/// Render the registry in OpenMetrics text format
pub fn encode() -> Result<String, std::fmt::Error> {
    let mut buffer = String::new();
    prometheus_client::encoding::text::encode(&mut buffer, &REGISTRY)?;
    Ok(buffer)
}
