pub mod cache;
pub mod registry;
pub mod types;

pub use cache::{CacheDocument, SampleCache, cache_tag};
pub use registry::{CounterMetric, GaugeMetric, LabelValues, MetricsRegistry, SampleBatch};
pub use types::{CollectedMetric, MetricDescriptor, MetricSample, MetricType, MetricValue};
