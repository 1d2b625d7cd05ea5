use std::{
    collections::HashMap,
    sync::{
        Arc, Mutex, RwLock,
        atomic::{AtomicU64, Ordering},
    },
};

use kre_common::error::{ExporterError, Result};

use crate::types::{CollectedMetric, MetricDescriptor, MetricSample, MetricType, MetricValue};

pub type LabelValues = Vec<String>;

trait RegisteredMetric: Send + Sync {
    fn descriptor(&self) -> MetricDescriptor;
    fn collect(&self) -> Vec<MetricSample>;
}

/// Metric families exposed on `/metrics`.
///
/// Rendering holds the exposition barrier for reading; [`MetricsRegistry::publish`]
/// holds it for writing, so a scrape never observes half of a cycle's update.
pub struct MetricsRegistry {
    metrics: RwLock<HashMap<String, Arc<dyn RegisteredMetric>>>,
    exposition: RwLock<()>,
}

impl MetricsRegistry {
    pub fn new() -> Self {
        Self {
            metrics: RwLock::new(HashMap::new()),
            exposition: RwLock::new(()),
        }
    }

    pub fn register_counter(
        &self,
        name: &str,
        help: &str,
        variable_labels: &[&str],
    ) -> Result<Arc<CounterMetric>> {
        let metric = Arc::new(CounterMetric::new(name, help, variable_labels));
        self.register(metric.clone())?;
        Ok(metric)
    }

    pub fn register_gauge<S: AsRef<str>>(
        &self,
        name: &str,
        help: &str,
        variable_labels: &[S],
    ) -> Result<Arc<GaugeMetric>> {
        let metric = Arc::new(GaugeMetric::new(name, help, variable_labels));
        self.register(metric.clone())?;
        Ok(metric)
    }

    /// Runs `update` while scrapes are held off.
    pub fn publish<F: FnOnce()>(&self, update: F) -> Result<()> {
        let _barrier = self.exposition.write().map_err(|_| {
            ExporterError::InternalError("failed to acquire metrics exposition lock".to_string())
        })?;
        update();
        Ok(())
    }

    /// Replaces the series of every gauge in `targets` with the batch contents.
    /// Gauges the batch has no samples for are emptied.
    pub fn commit(&self, targets: &[Arc<GaugeMetric>], batch: SampleBatch) -> Result<()> {
        let mut series = batch.into_series();
        self.publish(|| {
            for gauge in targets {
                gauge.replace(series.remove(gauge.name()).unwrap_or_default());
            }
        })
    }

    pub fn collect_all(&self) -> Vec<CollectedMetric> {
        let metrics = match self.metrics.read() {
            Ok(guard) => guard,
            Err(_) => return Vec::new(),
        };

        let mut collected = metrics
            .values()
            .map(|metric| CollectedMetric {
                descriptor: metric.descriptor(),
                samples: metric.collect(),
            })
            .collect::<Vec<_>>();

        collected.sort_by(|left, right| left.descriptor.name.cmp(&right.descriptor.name));
        collected
    }

    /// Text exposition format 0.0.4. Samples carry no timestamps.
    pub fn render_prometheus(&self) -> String {
        let _barrier = match self.exposition.read() {
            Ok(guard) => guard,
            Err(_) => return String::new(),
        };

        let mut output = String::new();
        for metric in self.collect_all() {
            output.push_str("# HELP ");
            output.push_str(&metric.descriptor.name);
            output.push(' ');
            output.push_str(&escape_help(&metric.descriptor.help));
            output.push('\n');

            output.push_str("# TYPE ");
            output.push_str(&metric.descriptor.name);
            output.push(' ');
            output.push_str(metric.descriptor.metric_type.as_prometheus_type());
            output.push('\n');

            let mut samples = metric.samples;
            samples.sort_by(|left, right| left.labels.cmp(&right.labels));
            for sample in samples {
                output.push_str(&render_sample_line(
                    &metric.descriptor.name,
                    &sample.labels,
                    sample.value.as_f64(),
                ));
            }
        }

        output
    }

    fn register<M: RegisteredMetric + 'static>(&self, metric: Arc<M>) -> Result<()> {
        let descriptor = metric.descriptor();
        let name = descriptor.name.clone();
        let mut metrics = self.metrics.write().map_err(|_| {
            ExporterError::InternalError("failed to acquire metrics registry lock".to_string())
        })?;

        if metrics.contains_key(&name) {
            return Err(ExporterError::DuplicateMetric(name));
        }

        metrics.insert(name, metric);
        Ok(())
    }
}

impl Default for MetricsRegistry {
    fn default() -> Self {
        Self::new()
    }
}

pub struct CounterMetric {
    descriptor: MetricDescriptor,
    series: RwLock<HashMap<LabelValues, Arc<AtomicU64>>>,
}

impl CounterMetric {
    fn new(name: &str, help: &str, variable_labels: &[&str]) -> Self {
        Self {
            descriptor: descriptor(name, help, MetricType::Counter, variable_labels),
            series: RwLock::new(HashMap::new()),
        }
    }

    pub fn inc(&self, labels: &[&str], value: u64) {
        let series = self.get_or_create_series(labels);
        series.fetch_add(value, Ordering::Relaxed);
    }

    pub fn inc_one(&self, labels: &[&str]) {
        self.inc(labels, 1);
    }

    fn get_or_create_series(&self, labels: &[&str]) -> Arc<AtomicU64> {
        let label_values = normalize_labels(&self.descriptor, labels);
        if let Ok(guard) = self.series.read()
            && let Some(existing) = guard.get(&label_values)
        {
            return existing.clone();
        }

        match self.series.write() {
            Ok(mut guard) => guard
                .entry(label_values)
                .or_insert_with(|| Arc::new(AtomicU64::new(0)))
                .clone(),
            Err(_) => Arc::new(AtomicU64::new(0)),
        }
    }
}

impl RegisteredMetric for CounterMetric {
    fn descriptor(&self) -> MetricDescriptor {
        self.descriptor.clone()
    }

    fn collect(&self) -> Vec<MetricSample> {
        let series = match self.series.read() {
            Ok(guard) => guard,
            Err(_) => return Vec::new(),
        };

        series
            .iter()
            .map(|(label_values, value)| MetricSample {
                labels: materialize_labels(&self.descriptor, label_values),
                value: MetricValue::Counter(value.load(Ordering::Relaxed) as f64),
            })
            .collect()
    }
}

pub struct GaugeMetric {
    descriptor: MetricDescriptor,
    series: Mutex<HashMap<LabelValues, f64>>,
}

impl GaugeMetric {
    fn new<S: AsRef<str>>(name: &str, help: &str, variable_labels: &[S]) -> Self {
        Self {
            descriptor: descriptor(name, help, MetricType::Gauge, variable_labels),
            series: Mutex::new(HashMap::new()),
        }
    }

    pub fn name(&self) -> &str {
        &self.descriptor.name
    }

    pub fn variable_labels(&self) -> &[String] {
        &self.descriptor.variable_labels
    }

    pub fn set(&self, labels: &[&str], value: f64) {
        let label_values = normalize_labels(&self.descriptor, labels);
        if let Ok(mut series) = self.series.lock() {
            series.insert(label_values, value);
        }
    }

    /// Swaps in a complete sample set; call inside [`MetricsRegistry::publish`].
    pub fn replace(&self, samples: HashMap<LabelValues, f64>) {
        let expected = self.descriptor.variable_labels.len();
        let samples: HashMap<LabelValues, f64> = samples
            .into_iter()
            .map(|(mut labels, value)| {
                labels.resize(expected, String::new());
                (labels, value)
            })
            .collect();
        if let Ok(mut series) = self.series.lock() {
            *series = samples;
        }
    }

    pub fn snapshot(&self) -> HashMap<LabelValues, f64> {
        self.series
            .lock()
            .map(|series| series.clone())
            .unwrap_or_default()
    }
}

impl RegisteredMetric for GaugeMetric {
    fn descriptor(&self) -> MetricDescriptor {
        self.descriptor.clone()
    }

    fn collect(&self) -> Vec<MetricSample> {
        let series = match self.series.lock() {
            Ok(guard) => guard,
            Err(_) => return Vec::new(),
        };

        series
            .iter()
            .map(|(label_values, value)| MetricSample {
                labels: materialize_labels(&self.descriptor, label_values),
                value: MetricValue::Gauge(*value),
            })
            .collect()
    }
}

/// Per-cycle accumulator. Samples for the same label set are summed.
#[derive(Debug, Default)]
pub struct SampleBatch {
    series: Mutex<HashMap<String, HashMap<LabelValues, f64>>>,
}

impl SampleBatch {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&self, metric: &str, label_values: LabelValues, value: f64) {
        if let Ok(mut series) = self.series.lock() {
            *series
                .entry(metric.to_string())
                .or_default()
                .entry(label_values)
                .or_insert(0.0) += value;
        }
    }

    /// Folds `other` into this batch, summing equal label sets.
    pub fn merge(&self, other: SampleBatch) {
        let incoming = other.into_series();
        if incoming.is_empty() {
            return;
        }
        if let Ok(mut series) = self.series.lock() {
            for (metric, samples) in incoming {
                let target = series.entry(metric).or_default();
                for (label_values, value) in samples {
                    *target.entry(label_values).or_insert(0.0) += value;
                }
            }
        }
    }

    pub fn len(&self) -> usize {
        self.series
            .lock()
            .map(|series| series.values().map(HashMap::len).sum())
            .unwrap_or_default()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn into_series(self) -> HashMap<String, HashMap<LabelValues, f64>> {
        self.series.into_inner().unwrap_or_default()
    }
}

fn descriptor<S: AsRef<str>>(
    name: &str,
    help: &str,
    metric_type: MetricType,
    variable_labels: &[S],
) -> MetricDescriptor {
    MetricDescriptor {
        name: name.to_string(),
        help: help.to_string(),
        metric_type,
        variable_labels: variable_labels
            .iter()
            .map(|label| label.as_ref().to_string())
            .collect(),
    }
}

fn normalize_labels(descriptor: &MetricDescriptor, labels: &[&str]) -> LabelValues {
    let expected = descriptor.variable_labels.len();
    (0..expected)
        .map(|index| labels.get(index).copied().unwrap_or_default().to_string())
        .collect()
}

fn materialize_labels(descriptor: &MetricDescriptor, values: &[String]) -> Vec<(String, String)> {
    descriptor
        .variable_labels
        .iter()
        .zip(values.iter())
        .map(|(name, value)| (name.clone(), value.clone()))
        .collect()
}

fn render_sample_line(name: &str, labels: &[(String, String)], value: f64) -> String {
    let mut rendered = String::new();
    rendered.push_str(name);

    if !labels.is_empty() {
        rendered.push('{');
        for (index, (key, value)) in labels.iter().enumerate() {
            if index > 0 {
                rendered.push(',');
            }
            rendered.push_str(key);
            rendered.push_str("=\"");
            rendered.push_str(&escape_label_value(value));
            rendered.push('"');
        }
        rendered.push('}');
    }

    rendered.push(' ');
    rendered.push_str(&format_metric_value(value));
    rendered.push('\n');
    rendered
}

fn format_metric_value(value: f64) -> String {
    if value.is_nan() {
        "NaN".to_string()
    } else if value.is_infinite() {
        if value > 0.0 { "+Inf" } else { "-Inf" }.to_string()
    } else if value.fract() == 0.0 && value.abs() < 1e15 {
        format!("{value:.0}")
    } else {
        value.to_string()
    }
}

fn escape_help(value: &str) -> String {
    value.replace('\\', "\\\\").replace('\n', "\\n")
}

fn escape_label_value(value: &str) -> String {
    value
        .replace('\\', "\\\\")
        .replace('\n', "\\n")
        .replace('"', "\\\"")
}
