use std::{path::PathBuf, time::Duration};

use clap::Parser;
use kre_collector::{CollectorOptions, KubeClientConfig, scheduler::MIN_INTERVAL};
use kre_extract::BaseLabels;

const MAX_PARALLELISM: u64 = 1024;

#[derive(Debug, Parser)]
#[command(
    name = "kube-resource-exporter",
    version,
    about = "Exports Prometheus metrics derived from Kubernetes resources"
)]
pub struct Cli {
    /// Debug logging
    #[arg(long = "log.debug", env = "LOG_DEBUG")]
    pub log_debug: bool,

    /// Log in JSON format
    #[arg(long = "log.json", env = "LOG_JSON")]
    pub log_json: bool,

    /// Path to the exporter configuration file
    #[arg(long = "config", env = "CONFIG")]
    pub config: PathBuf,

    /// Kubernetes API server URL, empty when running in-cluster
    #[arg(long = "kube.server", env = "KUBE_SERVER")]
    pub kube_server: Option<String>,

    /// Bearer token file for the API server
    #[arg(long = "kube.token-file", env = "KUBE_TOKEN_FILE")]
    pub kube_token_file: Option<PathBuf>,

    /// CA bundle for the API server certificate
    #[arg(long = "kube.ca-file", env = "KUBE_CA_FILE")]
    pub kube_ca_file: Option<PathBuf>,

    /// Skip API server certificate verification
    #[arg(long = "kube.insecure", env = "KUBE_INSECURE")]
    pub kube_insecure: bool,

    /// Timeout for a single list request
    #[arg(long = "kube.timeout", env = "KUBE_TIMEOUT", default_value = "60s", value_parser = humantime::parse_duration)]
    pub kube_timeout: Duration,

    /// Label for the resource name, empty disables it
    #[arg(long = "metric.label.name", env = "METRIC_LABEL_NAME", default_value = "name")]
    pub metric_label_name: String,

    /// Label for the resource namespace, empty disables it
    #[arg(long = "metric.label.namespace", env = "METRIC_LABEL_NAMESPACE", default_value = "namespace")]
    pub metric_label_namespace: String,

    /// Label for the resource group/version/kind, empty disables it
    #[arg(long = "metric.label.gvr", env = "METRIC_LABEL_GVR", default_value = "gvr")]
    pub metric_label_gvr: String,

    /// Page size for list calls
    #[arg(long = "metric.list.limit", env = "METRIC_LIST_LIMIT")]
    pub metric_list_limit: Option<u64>,

    /// Resource kinds listed at the same time
    #[arg(
        long = "metric.parallelism",
        env = "METRIC_PARALLELISM",
        default_value_t = 5,
        value_parser = clap::value_parser!(u64).range(1..=MAX_PARALLELISM)
    )]
    pub metric_parallelism: u64,

    /// Interval between collection cycles
    #[arg(long = "scrape.time", env = "SCRAPE_TIME", default_value = "30m", value_parser = parse_interval)]
    pub scrape_time: Duration,

    /// Directory for the metrics cache, disabled when unset
    #[arg(long = "cache.path", env = "CACHE_PATH")]
    pub cache_path: Option<PathBuf>,

    /// Listen address; a bare `:port` binds all interfaces
    #[arg(long = "server.bind", env = "SERVER_BIND", default_value = ":8080")]
    pub server_bind: String,

    #[arg(long = "server.timeout.read", env = "SERVER_TIMEOUT_READ", default_value = "5s", value_parser = humantime::parse_duration)]
    pub server_timeout_read: Duration,

    #[arg(long = "server.timeout.write", env = "SERVER_TIMEOUT_WRITE", default_value = "10s", value_parser = humantime::parse_duration)]
    pub server_timeout_write: Duration,
}

fn parse_interval(value: &str) -> Result<Duration, String> {
    let interval = humantime::parse_duration(value).map_err(|err| err.to_string())?;
    if interval < MIN_INTERVAL {
        return Err(format!(
            "must be at least {}",
            humantime::format_duration(MIN_INTERVAL)
        ));
    }
    Ok(interval)
}

impl Cli {
    pub fn base_labels(&self) -> BaseLabels {
        BaseLabels::new(
            &self.metric_label_gvr,
            &self.metric_label_namespace,
            &self.metric_label_name,
        )
    }

    pub fn collector_options(&self) -> CollectorOptions {
        CollectorOptions {
            parallelism: usize::try_from(self.metric_parallelism).unwrap_or(usize::MAX),
            list_limit: self.metric_list_limit.filter(|limit| *limit > 0),
        }
    }

    pub fn kube_client_config(&self) -> KubeClientConfig {
        KubeClientConfig {
            server: self
                .kube_server
                .clone()
                .filter(|server| !server.trim().is_empty()),
            token_file: self.kube_token_file.clone(),
            ca_file: self.kube_ca_file.clone(),
            insecure: self.kube_insecure,
            request_timeout: self.kube_timeout,
        }
    }

    pub fn bind_address(&self) -> String {
        if self.server_bind.starts_with(':') {
            format!("0.0.0.0{}", self.server_bind)
        } else {
            self.server_bind.clone()
        }
    }

    /// Budget for a whole request; axum does not separate reading from writing.
    pub fn request_timeout(&self) -> Duration {
        self.server_timeout_read + self.server_timeout_write
    }

    /// Everything besides the compiled configuration that changes the samples.
    pub fn metric_options_json(&self) -> serde_json::Value {
        serde_json::json!({
            "labels": {
                "name": self.metric_label_name,
                "namespace": self.metric_label_namespace,
                "gvr": self.metric_label_gvr,
            },
            "listLimit": self.metric_list_limit,
        })
    }
}
