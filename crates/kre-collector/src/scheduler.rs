use std::{
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
    time::{Duration, Instant},
};

use chrono::{DateTime, Utc};
use kre_common::error::Result;
use kre_metrics::{CacheDocument, MetricsRegistry, SampleCache};
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::{
    collector::{Collector, CycleReport},
    metrics::{CollectorMetrics, ResourceMetrics},
};

/// Shortest interval between cycles; smaller values are raised to this.
pub const MIN_INTERVAL: Duration = Duration::from_secs(1);

/// Flips once a complete sample set is exposed.
#[derive(Debug, Clone, Default)]
pub struct Readiness(Arc<AtomicBool>);

impl Readiness {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn mark_ready(&self) {
        self.0.store(true, Ordering::Release);
    }

    pub fn is_ready(&self) -> bool {
        self.0.load(Ordering::Acquire)
    }
}

pub struct CacheSettings {
    pub cache: SampleCache,
    pub tag: String,
}

/// Drives collection cycles on a fixed interval and publishes their results.
pub struct Scheduler {
    collector: Collector,
    registry: Arc<MetricsRegistry>,
    resource_metrics: ResourceMetrics,
    collector_metrics: Option<Arc<CollectorMetrics>>,
    cache: Option<CacheSettings>,
    interval: Duration,
    readiness: Readiness,
}

impl Scheduler {
    pub fn new(
        collector: Collector,
        registry: Arc<MetricsRegistry>,
        resource_metrics: ResourceMetrics,
        interval: Duration,
        readiness: Readiness,
    ) -> Self {
        if interval < MIN_INTERVAL {
            warn!(
                requested_ms = interval.as_millis() as u64,
                "scrape interval below minimum, using {}s",
                MIN_INTERVAL.as_secs()
            );
        }
        Self {
            collector,
            registry,
            resource_metrics,
            collector_metrics: None,
            cache: None,
            interval: interval.max(MIN_INTERVAL),
            readiness,
        }
    }

    pub fn with_cache(mut self, cache: CacheSettings) -> Self {
        self.cache = Some(cache);
        self
    }

    pub fn with_metrics(mut self, metrics: Arc<CollectorMetrics>) -> Self {
        self.collector_metrics = Some(metrics);
        self
    }

    /// Publishes a still-valid cached sample set. Returns when the cache
    /// expires, which is when the first live cycle should run.
    pub async fn restore(&self) -> Result<Option<DateTime<Utc>>> {
        let Some(settings) = &self.cache else {
            return Ok(None);
        };
        let Some(document) = settings.cache.load(&settings.tag, Utc::now()).await? else {
            return Ok(None);
        };

        let expires_at = document.expires_at;
        let restored = document.restore(&self.registry, self.resource_metrics.gauges())?;
        self.readiness.mark_ready();
        info!(
            path = %settings.cache.path().display(),
            samples = restored,
            expires_at = %expires_at,
            "restored metrics from cache"
        );
        Ok(Some(expires_at))
    }

    /// Runs one cycle and commits it unless it was cancelled.
    pub async fn run_once(&self, cancel: &CancellationToken) -> CycleReport {
        let started = Instant::now();
        let outcome = self.collector.run_cycle(cancel).await;
        let report = outcome.report;
        let elapsed = started.elapsed();

        if report.cancelled {
            info!(documents = report.documents, "collection cycle cancelled, keeping previous samples");
            self.record_cycle("cancelled", elapsed, &report);
            return report;
        }

        if let Err(err) = self.resource_metrics.commit(&self.registry, outcome.batch) {
            error!(error = %err, "failed to publish collected metrics");
            self.record_cycle("error", elapsed, &report);
            return report;
        }
        self.readiness.mark_ready();

        let status = if report.failed_selectors.is_empty() {
            "success"
        } else {
            "partial"
        };
        self.record_cycle(status, elapsed, &report);
        if let Some(metrics) = &self.collector_metrics {
            metrics.record_success(Utc::now().timestamp());
        }

        info!(
            documents = report.documents,
            samples = report.samples,
            list_calls = report.list_calls,
            failed_selectors = report.failed_selectors.len(),
            duration_ms = elapsed.as_millis() as u64,
            "collection cycle finished"
        );

        self.write_cache().await;
        report
    }

    /// Loops until `cancel` fires. With `first_run_at` in the future the
    /// first cycle waits until then.
    pub async fn run(self, cancel: CancellationToken, first_run_at: Option<DateTime<Utc>>) {
        if let Some(delay) = first_run_at.and_then(|at| (at - Utc::now()).to_std().ok()) {
            info!(delay_secs = delay.as_secs(), "delaying first collection until cache expiry");
            tokio::select! {
                _ = cancel.cancelled() => return,
                _ = tokio::time::sleep(delay) => {}
            }
        }

        let mut interval = tokio::time::interval(self.interval);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = interval.tick() => {}
            }
            self.run_once(&cancel).await;
        }
        info!("collection scheduler stopped");
    }

    async fn write_cache(&self) {
        let Some(settings) = &self.cache else {
            return;
        };
        let expires_at = match chrono::Duration::from_std(self.interval) {
            Ok(interval) => Utc::now() + interval,
            Err(err) => {
                warn!(error = %err, "scrape interval out of range, not caching");
                return;
            }
        };
        let document =
            CacheDocument::capture(&settings.tag, expires_at, self.resource_metrics.gauges());
        if let Err(err) = settings.cache.store(&document).await {
            warn!(path = %settings.cache.path().display(), error = %err, "failed to write metrics cache");
        }
    }

    fn record_cycle(&self, status: &str, elapsed: Duration, report: &CycleReport) {
        if let Some(metrics) = &self.collector_metrics {
            metrics.record_cycle(status, elapsed, report.documents, report.samples);
        }
    }
}

#[cfg(test)]
mod tests {
    use std::{sync::Arc, time::Duration};

    use kre_extract::BaseLabels;
    use kre_metrics::{MetricsRegistry, SampleCache};
    use tokio_util::sync::CancellationToken;

    use super::{CacheSettings, MIN_INTERVAL, Readiness, Scheduler};
    use crate::{
        collector::{
            Collector, CollectorOptions,
            tests::{MockLister, PODS_BY_PHASE, compiled, pod},
        },
        metrics::{CollectorMetrics, ResourceMetrics},
    };

    fn build_scheduler(
        lister: MockLister,
        registry: &Arc<MetricsRegistry>,
        readiness: &Readiness,
    ) -> Scheduler {
        build_scheduler_every(lister, registry, readiness, Duration::from_secs(60))
    }

    fn build_scheduler_every(
        lister: MockLister,
        registry: &Arc<MetricsRegistry>,
        readiness: &Readiness,
        interval: Duration,
    ) -> Scheduler {
        let config = compiled(PODS_BY_PHASE, BaseLabels::default());
        let resource_metrics = ResourceMetrics::register(registry, &config).unwrap();
        let collector_metrics = Arc::new(CollectorMetrics::register(registry).unwrap());
        let collector = Collector::new(config, Arc::new(lister), CollectorOptions::default())
            .with_metrics(collector_metrics.clone());
        Scheduler::new(
            collector,
            registry.clone(),
            resource_metrics,
            interval,
            readiness.clone(),
        )
        .with_metrics(collector_metrics)
    }

    #[tokio::test]
    async fn committed_cycle_replaces_samples_and_marks_ready() {
        let registry = Arc::new(MetricsRegistry::new());
        let readiness = Readiness::new();
        let lister = MockLister::default().page(
            "/api/v1/pods",
            "",
            vec![pod("a", "p0", "Running"), pod("a", "p1", "Running")],
            "",
        );
        let scheduler = build_scheduler(lister, &registry, &readiness);
        assert!(!readiness.is_ready());

        let report = scheduler.run_once(&CancellationToken::new()).await;
        assert_eq!(report.samples, 2);
        assert!(readiness.is_ready());

        let rendered = registry.render_prometheus();
        assert!(rendered.contains("# TYPE pods_by_phase gauge\n"));
        assert!(rendered.contains("pods_by_phase{phase=\"Running\"} 2\n"));
        assert!(rendered.contains(
            "kube_resource_exporter_list_requests_total{gvr=\"/v1/pods\",status=\"success\"} 1\n"
        ));
    }

    #[tokio::test]
    async fn cancelled_cycle_keeps_previous_samples() {
        let registry = Arc::new(MetricsRegistry::new());
        let readiness = Readiness::new();
        let scheduler = build_scheduler(MockLister::default().hanging(), &registry, &readiness);

        let gauge = registry
            .collect_all()
            .into_iter()
            .find(|metric| metric.descriptor.name == "pods_by_phase")
            .unwrap();
        assert!(gauge.samples.is_empty());

        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            trigger.cancel();
        });

        let report = scheduler.run_once(&cancel).await;
        assert!(report.cancelled);
        assert!(!readiness.is_ready());
        assert!(registry.render_prometheus().contains(
            "kube_resource_exporter_cycles_total{status=\"cancelled\"} 1\n"
        ));
    }

    #[tokio::test]
    async fn cache_written_after_cycle_is_restored_on_restart() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("kube-resources.json");

        let registry = Arc::new(MetricsRegistry::new());
        let readiness = Readiness::new();
        let lister =
            MockLister::default().page("/api/v1/pods", "", vec![pod("a", "p0", "Pending")], "");
        let scheduler = build_scheduler(lister, &registry, &readiness).with_cache(CacheSettings {
            cache: SampleCache::new(path.clone()),
            tag: "tag".to_string(),
        });
        scheduler.run_once(&CancellationToken::new()).await;

        let restarted_registry = Arc::new(MetricsRegistry::new());
        let restarted_readiness = Readiness::new();
        let restarted = build_scheduler(MockLister::default(), &restarted_registry, &restarted_readiness)
            .with_cache(CacheSettings {
                cache: SampleCache::new(path),
                tag: "tag".to_string(),
            });

        let expires_at = restarted.restore().await.unwrap();
        assert!(expires_at.is_some());
        assert!(restarted_readiness.is_ready());
        assert!(
            restarted_registry
                .render_prometheus()
                .contains("pods_by_phase{phase=\"Pending\"} 1\n")
        );
    }

    #[tokio::test]
    async fn run_stops_when_cancelled() {
        let registry = Arc::new(MetricsRegistry::new());
        let readiness = Readiness::new();
        let lister =
            MockLister::default().page("/api/v1/pods", "", vec![pod("a", "p0", "Running")], "");
        let scheduler = build_scheduler(lister, &registry, &readiness);

        let cancel = CancellationToken::new();
        let handle = tokio::spawn(scheduler.run(cancel.clone(), None));
        while !readiness.is_ready() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        cancel.cancel();
        tokio::time::timeout(Duration::from_secs(5), handle)
            .await
            .unwrap()
            .unwrap();
    }

    #[tokio::test]
    async fn zero_interval_is_raised_to_minimum() {
        let registry = Arc::new(MetricsRegistry::new());
        let readiness = Readiness::new();
        let lister =
            MockLister::default().page("/api/v1/pods", "", vec![pod("a", "p0", "Running")], "");
        let scheduler = build_scheduler_every(lister, &registry, &readiness, Duration::ZERO);
        assert_eq!(scheduler.interval, MIN_INTERVAL);

        let cancel = CancellationToken::new();
        let handle = tokio::spawn(scheduler.run(cancel.clone(), None));
        while !readiness.is_ready() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        cancel.cancel();
        tokio::time::timeout(Duration::from_secs(5), handle)
            .await
            .unwrap()
            .unwrap();
    }
}
