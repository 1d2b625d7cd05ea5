use std::sync::Arc;

use axum::{
    Router,
    body::Body,
    extract::State,
    http::{HeaderValue, StatusCode, header},
    response::{IntoResponse, Response},
    routing::get,
};
use kre_collector::Readiness;
use kre_metrics::MetricsRegistry;

pub struct AppState {
    pub registry: Arc<MetricsRegistry>,
    pub readiness: Readiness,
}

pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/metrics", get(prometheus_metrics))
        .route("/healthz", get(health_live))
        .route("/readyz", get(health_ready))
        .with_state(state)
}

async fn prometheus_metrics(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let payload = state.registry.render_prometheus();

    let mut response = Response::new(Body::from(payload));
    *response.status_mut() = StatusCode::OK;
    response.headers_mut().insert(
        header::CONTENT_TYPE,
        HeaderValue::from_static("text/plain; version=0.0.4; charset=utf-8"),
    );

    response
}

async fn health_live() -> impl IntoResponse {
    (StatusCode::OK, "Ok")
}

async fn health_ready(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    if state.readiness.is_ready() {
        (StatusCode::OK, "Ok")
    } else {
        (StatusCode::SERVICE_UNAVAILABLE, "waiting for first collection")
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use axum::{
        body::{Body, to_bytes},
        http::{Request, StatusCode, header},
    };
    use kre_collector::Readiness;
    use kre_metrics::MetricsRegistry;
    use tower::ServiceExt;

    use super::{AppState, router};

    async fn get(state: &Arc<AppState>, uri: &str) -> (StatusCode, String, Option<String>) {
        let response = router(state.clone())
            .oneshot(Request::builder().uri(uri).body(Body::empty()).unwrap())
            .await
            .unwrap();
        let status = response.status();
        let content_type = response
            .headers()
            .get(header::CONTENT_TYPE)
            .map(|value| value.to_str().unwrap().to_string());
        let body = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        (status, String::from_utf8(body.to_vec()).unwrap(), content_type)
    }

    fn state() -> Arc<AppState> {
        Arc::new(AppState {
            registry: Arc::new(MetricsRegistry::new()),
            readiness: Readiness::new(),
        })
    }

    #[tokio::test]
    async fn readyz_waits_for_first_sample_set() {
        let state = state();
        let (status, _, _) = get(&state, "/readyz").await;
        assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);

        state.readiness.mark_ready();
        let (status, body, _) = get(&state, "/readyz").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body, "Ok");

        let (status, body, _) = get(&state, "/healthz").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body, "Ok");
    }

    #[tokio::test]
    async fn metrics_uses_text_exposition_format() {
        let state = state();
        let gauge = state
            .registry
            .register_gauge("deployment_replicas", "Desired replicas", &["name"])
            .unwrap();
        gauge.set(&["web"], 3.0);

        let (status, body, content_type) = get(&state, "/metrics").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(
            content_type.as_deref(),
            Some("text/plain; version=0.0.4; charset=utf-8")
        );
        assert!(body.contains("# TYPE deployment_replicas gauge\n"));
        assert!(body.contains("deployment_replicas{name=\"web\"} 3\n"));
    }
}
