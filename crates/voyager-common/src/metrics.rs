//! Metrics registry for Voyager observability
//!
//! Provides OpenTelemetry metrics for:
//! - Ingress reconciliation (duration, errors by class)
//! - Offshoot drift restoration
//! - Rendered HAProxy config size

use once_cell::sync::Lazy;
use opentelemetry::global;
use opentelemetry::metrics::{Counter, Histogram, Meter};
use opentelemetry::KeyValue;

/// Global meter for Voyager metrics
static METER: Lazy<Meter> = Lazy::new(|| global::meter("voyager"));

// ============================================================================
// Reconciliation Metrics
// ============================================================================

/// Histogram of ingress reconciliation duration
///
/// Labels:
/// - `ingress`: namespace/name
/// - `result`: success, error
pub static INGRESS_RECONCILE_DURATION: Lazy<Histogram<f64>> = Lazy::new(|| {
    METER
        .f64_histogram("voyager_ingress_reconcile_duration_seconds")
        .with_description("Duration of ingress reconciliation in seconds")
        .with_unit("s")
        .build()
});

/// Counter of ingress reconciliation errors
///
/// Labels:
/// - `ingress`: namespace/name
/// - `error_class`: config, reference, kube, serialization, internal
pub static INGRESS_RECONCILE_ERRORS: Lazy<Counter<u64>> = Lazy::new(|| {
    METER
        .u64_counter("voyager_ingress_reconcile_errors_total")
        .with_description("Total number of ingress reconciliation errors")
        .with_unit("{errors}")
        .build()
});

/// Counter of offshoots recreated after out-of-band deletion
///
/// Labels:
/// - `kind`: ConfigMap, Service, Deployment, DaemonSet, ...
pub static OFFSHOOTS_RESTORED: Lazy<Counter<u64>> = Lazy::new(|| {
    METER
        .u64_counter("voyager_offshoots_restored_total")
        .with_description("Total number of offshoot objects recreated after drift")
        .with_unit("{objects}")
        .build()
});

/// Histogram of rendered HAProxy config size in bytes
pub static RENDERED_CONFIG_BYTES: Lazy<Histogram<u64>> = Lazy::new(|| {
    METER
        .u64_histogram("voyager_rendered_config_bytes")
        .with_description("Size of the rendered HAProxy configuration")
        .with_unit("By")
        .build()
});

// ============================================================================
// Metric Recording Helpers
// ============================================================================

/// Record an ingress reconciliation with timing
pub struct ReconcileTimer {
    ingress: String,
    start: std::time::Instant,
}

impl ReconcileTimer {
    /// Start timing a reconciliation
    pub fn start(ingress: impl Into<String>) -> Self {
        Self {
            ingress: ingress.into(),
            start: std::time::Instant::now(),
        }
    }

    /// Record successful completion
    pub fn success(self) {
        let duration = self.start.elapsed().as_secs_f64();
        INGRESS_RECONCILE_DURATION.record(
            duration,
            &[
                KeyValue::new("ingress", self.ingress),
                KeyValue::new("result", "success"),
            ],
        );
    }

    /// Record error completion
    pub fn error(self, error_class: &str) {
        let duration = self.start.elapsed().as_secs_f64();
        INGRESS_RECONCILE_DURATION.record(
            duration,
            &[
                KeyValue::new("ingress", self.ingress.clone()),
                KeyValue::new("result", "error"),
            ],
        );
        INGRESS_RECONCILE_ERRORS.add(
            1,
            &[
                KeyValue::new("ingress", self.ingress),
                KeyValue::new("error_class", error_class.to_string()),
            ],
        );
    }
}

/// Count an offshoot restored after drift
pub fn record_offshoot_restored(kind: &str) {
    OFFSHOOTS_RESTORED.add(1, &[KeyValue::new("kind", kind.to_string())]);
}

/// Record the size of a freshly rendered config
pub fn record_rendered_config(bytes: usize) {
    RENDERED_CONFIG_BYTES.record(bytes as u64, &[]);
}
