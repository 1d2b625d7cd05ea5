pub mod collector;
pub mod kube;
pub mod lister;
pub mod metrics;
pub mod scheduler;

pub use collector::{Collector, CollectorOptions, CycleOutcome, CycleReport};
pub use kube::{KubeApiLister, KubeClientConfig};
pub use lister::{ListOptions, ResourceList, ResourceLister};
pub use metrics::{CollectorMetrics, ResourceMetrics};
pub use scheduler::{CacheSettings, Readiness, Scheduler};
