use std::{collections::HashMap, sync::Arc};

use kre_common::types::GroupVersionResource;
use kre_extract::{BaseLabels, CompiledConfig, Evaluation, ResourceSelector};
use kre_metrics::SampleBatch;
use serde_json::Value;
use tokio::{sync::Semaphore, task::JoinSet};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};

use crate::{
    lister::{ListOptions, ResourceLister},
    metrics::CollectorMetrics,
};

#[derive(Debug, Clone)]
pub struct CollectorOptions {
    /// Upper bound on selectors listed concurrently.
    pub parallelism: usize,
    /// Page size for list calls; unset lets the API server decide.
    pub list_limit: Option<u64>,
}

impl Default for CollectorOptions {
    fn default() -> Self {
        Self {
            parallelism: 5,
            list_limit: None,
        }
    }
}

/// Summary of one collection cycle.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CycleReport {
    pub documents: u64,
    pub samples: u64,
    pub list_calls: u64,
    pub failed_selectors: Vec<GroupVersionResource>,
    pub cancelled: bool,
}

impl CycleReport {
    fn merge(&mut self, selector: SelectorReport) {
        self.documents += selector.documents;
        self.samples += selector.samples;
        self.list_calls += selector.list_calls;
        if selector.failed {
            self.failed_selectors.push(selector.gvr);
        }
    }
}

pub struct CycleOutcome {
    pub batch: SampleBatch,
    pub report: CycleReport,
}

#[derive(Debug)]
struct SelectorReport {
    gvr: GroupVersionResource,
    documents: u64,
    samples: u64,
    list_calls: u64,
    failed: bool,
}

impl SelectorReport {
    fn new(gvr: &GroupVersionResource) -> Self {
        Self {
            gvr: gvr.clone(),
            documents: 0,
            samples: 0,
            list_calls: 0,
            failed: false,
        }
    }
}

/// Runs one pass over every configured resource selector.
pub struct Collector {
    config: Arc<CompiledConfig>,
    lister: Arc<dyn ResourceLister>,
    options: CollectorOptions,
    metrics: Option<Arc<CollectorMetrics>>,
}

impl Collector {
    pub fn new(
        config: Arc<CompiledConfig>,
        lister: Arc<dyn ResourceLister>,
        options: CollectorOptions,
    ) -> Self {
        Self {
            config,
            lister,
            options,
            metrics: None,
        }
    }

    pub fn with_metrics(mut self, metrics: Arc<CollectorMetrics>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    /// Lists every selector and evaluates every metric against every
    /// document. The returned batch is only meaningful when the report is
    /// not cancelled.
    pub async fn run_cycle(&self, cancel: &CancellationToken) -> CycleOutcome {
        let batch = Arc::new(SampleBatch::new());
        let permits = Arc::new(Semaphore::new(
            self.options.parallelism.clamp(1, Semaphore::MAX_PERMITS),
        ));
        let mut tasks = JoinSet::new();
        let mut spawned = HashMap::new();

        for index in 0..self.config.resources.len() {
            let config = Arc::clone(&self.config);
            let lister = Arc::clone(&self.lister);
            let batch = Arc::clone(&batch);
            let permits = Arc::clone(&permits);
            let cancel = cancel.clone();
            let metrics = self.metrics.clone();
            let limit = self.options.list_limit;

            let handle = tasks.spawn(async move {
                let selector = &config.resources[index];
                let _permit = tokio::select! {
                    biased;
                    _ = cancel.cancelled() => return SelectorReport::new(&selector.gvr),
                    permit = permits.acquire_owned() => match permit {
                        Ok(permit) => permit,
                        Err(_) => return SelectorReport::new(&selector.gvr),
                    },
                };

                let task = SelectorTask {
                    selector,
                    base_labels: &config.base_labels,
                    lister: lister.as_ref(),
                    limit,
                    metrics: metrics.as_deref(),
                };
                task.collect(&cancel, &batch).await
            });
            spawned.insert(handle.id(), index);
        }

        let mut report = CycleReport::default();
        while let Some(joined) = tasks.join_next_with_id().await {
            match joined {
                Ok((_, selector)) => report.merge(selector),
                Err(err) => {
                    let Some(&index) = spawned.get(&err.id()) else {
                        error!(error = %err, "resource collection task failed");
                        continue;
                    };
                    let gvr = &self.config.resources[index].gvr;
                    error!(gvr = %gvr, error = %err, "resource collection task failed");
                    let mut failed = SelectorReport::new(gvr);
                    failed.failed = true;
                    report.merge(failed);
                }
            }
        }
        report.cancelled = cancel.is_cancelled();

        let batch = match Arc::try_unwrap(batch) {
            Ok(batch) => batch,
            Err(_) => {
                warn!("sample batch still shared after collection; discarding");
                SampleBatch::new()
            }
        };

        CycleOutcome { batch, report }
    }
}

struct SelectorTask<'a> {
    selector: &'a ResourceSelector,
    base_labels: &'a BaseLabels,
    lister: &'a dyn ResourceLister,
    limit: Option<u64>,
    metrics: Option<&'a CollectorMetrics>,
}

impl SelectorTask<'_> {
    /// Pages through the selector and merges its samples into `batch` once the
    /// last page is in. A failed or cancelled selector contributes nothing.
    async fn collect(&self, cancel: &CancellationToken, batch: &SampleBatch) -> SelectorReport {
        let gvr = &self.selector.gvr;
        let gvr_label = gvr.to_string();
        let mut report = SelectorReport::new(gvr);
        let pending = SampleBatch::new();
        let mut samples = 0;
        let mut options = ListOptions {
            label_selector: self.selector.label_selector.clone(),
            limit: self.limit,
            continue_token: None,
        };

        loop {
            let page = tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    debug!(gvr = %gvr, "collection cancelled");
                    return report;
                }
                page = self.lister.list(gvr, &options) => page,
            };
            report.list_calls += 1;

            let page = match page {
                Ok(page) => {
                    self.record_list(&gvr_label, true);
                    page
                }
                Err(err) => {
                    self.record_list(&gvr_label, false);
                    error!(gvr = %gvr, error = %err, "failed to list resources, skipping for this cycle");
                    report.failed = true;
                    return report;
                }
            };

            for document in &page.items {
                report.documents += 1;
                samples += self.collect_document(document, &pending);
            }

            match page.next_token() {
                Some(token) if options.continue_token.as_deref() == Some(token) => {
                    error!(gvr = %gvr, token, "api server repeated continue token, skipping for this cycle");
                    report.failed = true;
                    return report;
                }
                Some(token) => options.continue_token = Some(token.to_string()),
                None => break,
            }
        }

        batch.merge(pending);
        report.samples = samples;
        report
    }

    fn collect_document(&self, document: &Value, batch: &SampleBatch) -> u64 {
        let mut samples = 0;
        for metric in &self.selector.metrics {
            match metric.evaluate(document, self.base_labels) {
                Evaluation::Excluded => debug!(
                    gvr = %self.selector.gvr,
                    resource = %resource_id(document),
                    metric = %metric.name,
                    "filtered"
                ),
                Evaluation::NoValue => debug!(
                    gvr = %self.selector.gvr,
                    resource = %resource_id(document),
                    metric = %metric.name,
                    "no value found"
                ),
                Evaluation::Sample {
                    label_values,
                    value,
                } => {
                    batch.add(&metric.name, label_values, value);
                    samples += 1;
                }
            }
        }
        samples
    }

    fn record_list(&self, gvr: &str, ok: bool) {
        if let Some(metrics) = self.metrics {
            metrics.record_list(gvr, ok);
        }
    }
}

fn resource_id(document: &Value) -> String {
    let field = |name: &str| {
        document
            .get("metadata")
            .and_then(|metadata| metadata.get(name))
            .and_then(Value::as_str)
            .unwrap_or_default()
    };
    format!("{}/{}", field("namespace"), field("name"))
}
