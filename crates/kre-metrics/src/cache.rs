use std::{
    collections::HashMap,
    path::{Path, PathBuf},
    sync::Arc,
};

use chrono::{DateTime, Utc};
use kre_common::error::{ExporterError, Result};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tokio::fs;
use tracing::{debug, info, warn};

use crate::registry::{GaugeMetric, MetricsRegistry, SampleBatch};

/// Hex SHA-256 over the build's cache version and the effective configuration.
pub fn cache_tag(version: &str, input: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(version.as_bytes());
    hasher.update([0u8]);
    hasher.update(input.as_bytes());
    hex::encode(hasher.finalize())
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CachedSample {
    pub labels: Vec<String>,
    pub value: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CachedMetric {
    pub name: String,
    pub samples: Vec<CachedSample>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CacheDocument {
    pub tag: String,
    pub expires_at: DateTime<Utc>,
    pub metrics: Vec<CachedMetric>,
}

impl CacheDocument {
    /// Snapshot of the gauges' current series.
    pub fn capture(tag: &str, expires_at: DateTime<Utc>, gauges: &[Arc<GaugeMetric>]) -> Self {
        let metrics = gauges
            .iter()
            .map(|gauge| {
                let mut samples = gauge
                    .snapshot()
                    .into_iter()
                    .map(|(labels, value)| CachedSample { labels, value })
                    .collect::<Vec<_>>();
                samples.sort_by(|left, right| left.labels.cmp(&right.labels));
                CachedMetric {
                    name: gauge.name().to_string(),
                    samples,
                }
            })
            .collect();

        Self {
            tag: tag.to_string(),
            expires_at,
            metrics,
        }
    }

    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at <= now
    }

    /// Publishes the cached samples in one commit. Metrics no longer
    /// registered are dropped.
    pub fn restore(self, registry: &MetricsRegistry, gauges: &[Arc<GaugeMetric>]) -> Result<usize> {
        let batch = SampleBatch::new();
        let known = gauges
            .iter()
            .map(|gauge| (gauge.name().to_string(), gauge.variable_labels().len()))
            .collect::<HashMap<_, _>>();

        for metric in self.metrics {
            let Some(arity) = known.get(&metric.name) else {
                debug!(metric = %metric.name, "skipping cached metric that is no longer configured");
                continue;
            };
            for sample in metric.samples {
                if sample.labels.len() != *arity {
                    continue;
                }
                batch.add(&metric.name, sample.labels, sample.value);
            }
        }

        let restored = batch.len();
        registry.commit(gauges, batch)?;
        Ok(restored)
    }
}

/// Sample set persisted between restarts.
#[derive(Debug, Clone)]
pub struct SampleCache {
    path: PathBuf,
}

impl SampleCache {
    pub fn new(path: PathBuf) -> Self {
        Self { path }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Returns the cached document only when its tag matches and it has not
    /// expired. A missing or unreadable cache is not an error.
    pub async fn load(&self, tag: &str, now: DateTime<Utc>) -> Result<Option<CacheDocument>> {
        let bytes = match fs::read(&self.path).await {
            Ok(bytes) => bytes,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(err) => return Err(ExporterError::Io(err)),
        };

        let document: CacheDocument = match serde_json::from_slice(&bytes) {
            Ok(document) => document,
            Err(err) => {
                warn!(path = %self.path.display(), error = %err, "ignoring unreadable metrics cache");
                return Ok(None);
            }
        };

        if document.tag != tag {
            info!(path = %self.path.display(), "ignoring metrics cache written for another configuration");
            return Ok(None);
        }
        if document.is_expired(now) {
            info!(
                path = %self.path.display(),
                expired_at = %document.expires_at,
                "ignoring expired metrics cache"
            );
            return Ok(None);
        }

        Ok(Some(document))
    }

    /// Writes through a sibling temporary file so readers never see a partial cache.
    pub async fn store(&self, document: &CacheDocument) -> Result<()> {
        let bytes = serde_json::to_vec(document).map_err(|err| {
            ExporterError::InternalError(format!(
                "failed to serialize metrics cache {}: {err}",
                self.path.display()
            ))
        })?;

        if let Some(parent) = self.path.parent()
            && !parent.as_os_str().is_empty()
        {
            fs::create_dir_all(parent).await?;
        }

        let mut tmp = self.path.clone().into_os_string();
        tmp.push(".tmp");
        let tmp = PathBuf::from(tmp);
        fs::write(&tmp, bytes).await?;
        fs::rename(&tmp, &self.path).await?;
        Ok(())
    }
}
