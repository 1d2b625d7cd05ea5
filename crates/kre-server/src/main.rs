mod cli;
mod http;

use std::sync::Arc;

use clap::Parser;
use kre_collector::{
    CacheSettings, Collector, CollectorMetrics, KubeApiLister, Readiness, ResourceMetrics,
    Scheduler,
};
use kre_common::version::{APP_NAME, APP_VERSION, CACHE_VERSION};
use kre_extract::{CompileOptions, RawConfig, compile};
use kre_metrics::{MetricsRegistry, SampleCache, cache_tag};
use tokio_util::sync::CancellationToken;
use tower_http::{timeout::TimeoutLayer, trace::TraceLayer};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use crate::{
    cli::Cli,
    http::{AppState, router},
};

const CACHE_FILE_NAME: &str = "kube-resources.json";

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();
    init_tracing(&cli)?;

    info!(app = APP_NAME, version = APP_VERSION, "starting exporter");

    info!(path = %cli.config.display(), "reading configuration");
    let raw = RawConfig::from_file(&cli.config)?;
    let config = Arc::new(compile(
        &raw,
        &CompileOptions {
            base_labels: cli.base_labels(),
        },
    )?);
    info!(
        resources = config.resources.len(),
        metrics = config.metrics().count(),
        "configuration compiled"
    );

    let registry = Arc::new(MetricsRegistry::new());
    let resource_metrics = ResourceMetrics::register(&registry, &config)?;
    let collector_metrics = Arc::new(CollectorMetrics::register(&registry)?);

    info!("connecting to Kubernetes");
    let lister = Arc::new(KubeApiLister::connect(cli.kube_client_config()).await?);
    let collector = Collector::new(Arc::clone(&config), lister, cli.collector_options())
        .with_metrics(Arc::clone(&collector_metrics));

    let readiness = Readiness::new();
    let mut scheduler = Scheduler::new(
        collector,
        Arc::clone(&registry),
        resource_metrics,
        cli.scrape_time,
        readiness.clone(),
    )
    .with_metrics(collector_metrics);

    if let Some(dir) = &cli.cache_path {
        let tag_input = serde_json::json!({
            "options": cli.metric_options_json(),
            "config": config.canonical(),
        });
        scheduler = scheduler.with_cache(CacheSettings {
            cache: SampleCache::new(dir.join(CACHE_FILE_NAME)),
            tag: cache_tag(CACHE_VERSION, &tag_input.to_string()),
        });
    }

    let first_run_at = match scheduler.restore().await {
        Ok(expires_at) => expires_at,
        Err(err) => {
            warn!(error = %err, "failed to restore metrics cache");
            None
        }
    };

    let cancel = CancellationToken::new();
    let collection = tokio::spawn(scheduler.run(cancel.clone(), first_run_at));
    info!(interval = %humantime::format_duration(cli.scrape_time), "metrics collection started");

    let app = router(Arc::new(AppState {
        registry,
        readiness,
    }))
    .layer(TimeoutLayer::new(cli.request_timeout()))
    .layer(TraceLayer::new_for_http());

    let addr = cli.bind_address();
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    info!(bind = %addr, "http server listening");
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal(cancel.clone()))
        .await?;

    cancel.cancel();
    collection.await?;
    info!("kube-resource-exporter stopped");

    Ok(())
}

fn init_tracing(cli: &Cli) -> Result<(), Box<dyn std::error::Error>> {
    let level = if cli.log_debug { "debug" } else { "info" };
    let env_filter = EnvFilter::from_default_env().add_directive(level.parse()?);
    if cli.log_json {
        tracing_subscriber::fmt()
            .json()
            .with_env_filter(env_filter)
            .init();
    } else {
        tracing_subscriber::fmt().with_env_filter(env_filter).init();
    }
    Ok(())
}

async fn shutdown_signal(cancel: CancellationToken) {
    let ctrl_c = async {
        if let Err(err) = tokio::signal::ctrl_c().await {
            warn!(error = %err, "failed to listen for ctrl-c");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(err) => {
                warn!(error = %err, "failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }

    info!("shutdown signal received");
    cancel.cancel();
}
