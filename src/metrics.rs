//! Prometheus metrics for the reconciler.

use prometheus::{histogram_opts, opts, HistogramVec, IntCounter, IntCounterVec, Registry};

use crate::error::Error;

#[derive(Clone)]
pub struct Metrics {
    pub reconciliations: IntCounter,
    pub failures: IntCounterVec,
    pub reconcile_duration: HistogramVec,
}

impl Default for Metrics {
    fn default() -> Self {
        let reconciliations =
            IntCounter::with_opts(opts!("docdb_controller_reconciliations_total", "reconciliations")).unwrap();
        let failures = IntCounterVec::new(
            opts!("docdb_controller_reconciliation_errors_total", "reconciliation errors"),
            &["instance", "namespace", "kind"],
        )
        .unwrap();
        let reconcile_duration = HistogramVec::new(
            histogram_opts!(
                "docdb_controller_reconcile_duration_seconds",
                "reconcile duration"
            ),
            &["instance", "namespace"],
        )
        .unwrap();
        Metrics {
            reconciliations,
            failures,
            reconcile_duration,
        }
    }
}

impl Metrics {
    pub fn register(self, registry: &Registry) -> prometheus::Result<Self> {
        registry.register(Box::new(self.reconciliations.clone()))?;
        registry.register(Box::new(self.failures.clone()))?;
        registry.register(Box::new(self.reconcile_duration.clone()))?;
        Ok(self)
    }

    /// Starts a reconcile-duration timer; the returned guard records its
    /// elapsed time into the histogram on drop.
    pub fn count_and_measure(&self, namespace: &str) -> prometheus::HistogramTimer {
        self.reconciliations.inc();
        self.reconcile_duration
            .with_label_values(&["docdb", namespace])
            .start_timer()
    }

    pub fn reconcile_failure(&self, namespace: &str, name: &str, error: &Error) {
        let kind = match error {
            Error::KubeError(_) => "kube",
            Error::FinalizerError(_) => "finalizer",
            Error::SerdeError(_) => "serde",
            Error::HttpError(_) => "http",
            Error::NotReadyYet(_) => "not_ready",
            Error::UserMisconfig(_) => "user_misconfig",
            Error::FatalInvariant => "fatal_invariant",
        };
        self.failures.with_label_values(&[name, namespace, kind]).inc();
    }
}
