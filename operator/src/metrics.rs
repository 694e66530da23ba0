use crate::Error;
use k8s_openapi::api::core::v1::PersistentVolumeClaim;
use kube::ResourceExt;
use prometheus_client::{
    encoding::{EncodeLabelSet, text::encode},
    metrics::{counter::Counter, family::Family, gauge::Gauge, histogram::Histogram},
    registry::{Registry, Unit},
};
use std::sync::Arc;
use tokio::time::Instant;

#[derive(Clone)]
pub struct Metrics {
    pub reconcile: ReconcileMetrics,
    pub incidents: IncidentMetrics,
    pub registry: Arc<Registry>,
}

impl Default for Metrics {
    fn default() -> Self {
        let mut registry = Registry::with_prefix("pvc_scaler");
        let reconcile = ReconcileMetrics::default().register(registry.sub_registry_with_prefix("reconcile"));
        let incidents = IncidentMetrics::default().register(registry.sub_registry_with_prefix("incident"));
        Self {
            reconcile,
            incidents,
            registry: Arc::new(registry),
        }
    }
}

impl Metrics {
    /// OpenMetrics text exposition
    pub fn encode(&self) -> String {
        let mut buffer = String::new();
        if let Err(e) = encode(&mut buffer, &self.registry) {
            tracing::warn!("Failed to encode metrics: {e}");
        }
        buffer
    }
}

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct ErrorLabels {
    pub instance: String,
    pub error: String,
}

#[derive(Clone)]
pub struct ReconcileMetrics {
    pub runs: Counter,
    pub failures: Family<ErrorLabels, Counter>,
    pub duration: Histogram,
}

impl Default for ReconcileMetrics {
    fn default() -> Self {
        Self {
            runs: Counter::default(),
            failures: Family::<ErrorLabels, Counter>::default(),
            duration: Histogram::new([0.01, 0.1, 0.25, 0.5, 1., 5., 15., 60.].into_iter()),
        }
    }
}

impl ReconcileMetrics {
    /// Register API metrics to start tracking them.
    pub fn register(self, r: &mut Registry) -> Self {
        r.register_with_unit("duration", "reconcile duration", Unit::Seconds, self.duration.clone());
        r.register("failures", "reconciliation errors", self.failures.clone());
        r.register("runs", "reconciliations", self.runs.clone());
        self
    }

    pub fn reconcile_failure(&self, pvc: &PersistentVolumeClaim, e: &Error) {
        self.failures
            .get_or_create(&ErrorLabels {
                instance: format!("{}/{}", pvc.namespace().unwrap_or_default(), pvc.name_any()),
                error: e.metric_label(),
            })
            .inc();
    }

    pub fn count_and_measure(&self) -> ReconcileMeasurer {
        self.runs.inc();
        ReconcileMeasurer {
            start: Instant::now(),
            metric: self.duration.clone(),
        }
    }
}

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct ScaleLabels {
    pub direction: String,
    pub result: String,
}

#[derive(Clone, Default)]
pub struct IncidentMetrics {
    pub opened: Counter,
    pub active: Gauge,
    pub scales: Family<ScaleLabels, Counter>,
}

impl IncidentMetrics {
    pub fn register(self, r: &mut Registry) -> Self {
        r.register("opened", "incidents opened on a degraded claim", self.opened.clone());
        r.register("active", "incidents waiting for their claim to recover", self.active.clone());
        r.register("scales", "deployment scale actions", self.scales.clone());
        self
    }

    pub fn scaled(&self, direction: &str, ok: bool) {
        self.scales
            .get_or_create(&ScaleLabels {
                direction: direction.to_string(),
                result: if ok { "ok" } else { "error" }.to_string(),
            })
            .inc();
    }
}

/// Smart function duration measurer
///
/// Relies on Drop to calculate duration and register the observation in the histogram
pub struct ReconcileMeasurer {
    start: Instant,
    metric: Histogram,
}

impl Drop for ReconcileMeasurer {
    fn drop(&mut self) {
        #[allow(clippy::cast_precision_loss)]
        let duration = self.start.elapsed().as_millis() as f64 / 1000.0;
        self.metric.observe(duration);
    }
}
