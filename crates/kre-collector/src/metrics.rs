use std::{sync::Arc, time::Duration};

use kre_common::error::Result;
use kre_extract::CompiledConfig;
use kre_metrics::{CounterMetric, GaugeMetric, MetricsRegistry, SampleBatch};

/// One gauge per configured metric, labelled with the base labels followed
/// by the metric's own labels.
pub struct ResourceMetrics {
    gauges: Vec<Arc<GaugeMetric>>,
}

impl ResourceMetrics {
    pub fn register(registry: &MetricsRegistry, config: &CompiledConfig) -> Result<Self> {
        let gauges = config
            .metrics()
            .map(|metric| {
                registry.register_gauge(
                    &metric.name,
                    &metric.help,
                    metric.label_names(&config.base_labels).as_slice(),
                )
            })
            .collect::<Result<Vec<_>>>()?;
        Ok(Self { gauges })
    }

    pub fn gauges(&self) -> &[Arc<GaugeMetric>] {
        &self.gauges
    }

    pub fn commit(&self, registry: &MetricsRegistry, batch: SampleBatch) -> Result<()> {
        registry.commit(&self.gauges, batch)
    }
}

/// Metrics about the exporter's own collection cycles.
pub struct CollectorMetrics {
    list_requests_total: Arc<CounterMetric>,
    cycles_total: Arc<CounterMetric>,
    last_cycle_duration_seconds: Arc<GaugeMetric>,
    last_cycle_documents: Arc<GaugeMetric>,
    last_cycle_samples: Arc<GaugeMetric>,
    last_success_timestamp_seconds: Arc<GaugeMetric>,
}

impl CollectorMetrics {
    pub fn register(registry: &MetricsRegistry) -> Result<Self> {
        let no_labels: &[&str] = &[];
        Ok(Self {
            list_requests_total: registry.register_counter(
                "kube_resource_exporter_list_requests_total",
                "Kubernetes list requests by resource and outcome",
                &["gvr", "status"],
            )?,
            cycles_total: registry.register_counter(
                "kube_resource_exporter_cycles_total",
                "Collection cycles by outcome",
                &["status"],
            )?,
            last_cycle_duration_seconds: registry.register_gauge(
                "kube_resource_exporter_last_cycle_duration_seconds",
                "Wall time of the last collection cycle",
                no_labels,
            )?,
            last_cycle_documents: registry.register_gauge(
                "kube_resource_exporter_last_cycle_documents",
                "Documents visited by the last collection cycle",
                no_labels,
            )?,
            last_cycle_samples: registry.register_gauge(
                "kube_resource_exporter_last_cycle_samples",
                "Samples emitted by the last collection cycle",
                no_labels,
            )?,
            last_success_timestamp_seconds: registry.register_gauge(
                "kube_resource_exporter_last_success_timestamp_seconds",
                "Unix time of the last committed collection cycle",
                no_labels,
            )?,
        })
    }

    pub fn record_list(&self, gvr: &str, ok: bool) {
        self.list_requests_total
            .inc_one(&[gvr, if ok { "success" } else { "error" }]);
    }

    pub fn record_cycle(&self, status: &str, duration: Duration, documents: u64, samples: u64) {
        self.cycles_total.inc_one(&[status]);
        self.last_cycle_duration_seconds
            .set(&[], duration.as_secs_f64());
        self.last_cycle_documents.set(&[], documents as f64);
        self.last_cycle_samples.set(&[], samples as f64);
    }

    pub fn record_success(&self, unix_seconds: i64) {
        self.last_success_timestamp_seconds
            .set(&[], unix_seconds as f64);
    }
}
