use std::{path::PathBuf, time::Duration};

use async_trait::async_trait;
use kre_common::{
    error::{ExporterError, Result},
    types::GroupVersionResource,
    version::USER_AGENT,
};
use serde_json::Value;
use tokio::fs;
use tracing::{debug, info};

use crate::lister::{ListOptions, ResourceList, ResourceLister};

const SERVICE_ACCOUNT_DIR: &str = "/var/run/secrets/kubernetes.io/serviceaccount";

#[derive(Debug, Clone)]
pub struct KubeClientConfig {
    /// API server base URL; in-cluster discovery is used when unset.
    pub server: Option<String>,
    pub token_file: Option<PathBuf>,
    pub ca_file: Option<PathBuf>,
    pub insecure: bool,
    pub request_timeout: Duration,
}

impl Default for KubeClientConfig {
    fn default() -> Self {
        Self {
            server: None,
            token_file: None,
            ca_file: None,
            insecure: false,
            request_timeout: Duration::from_secs(60),
        }
    }
}

/// Lists resources straight from the Kubernetes REST API.
pub struct KubeApiLister {
    server: String,
    token_file: Option<PathBuf>,
    client: reqwest::Client,
}

impl KubeApiLister {
    pub async fn connect(config: KubeClientConfig) -> Result<Self> {
        let in_cluster = config.server.is_none();
        let server = match config.server {
            Some(server) => server,
            None => in_cluster_server(
                std::env::var("KUBERNETES_SERVICE_HOST").ok(),
                std::env::var("KUBERNETES_SERVICE_PORT").ok(),
            )?,
        };
        let server = server.trim_end_matches('/').to_string();
        let parsed = url::Url::parse(&server).map_err(|err| {
            ExporterError::InvalidArgument(format!("invalid Kubernetes API server URL {server}: {err}"))
        })?;
        if !matches!(parsed.scheme(), "http" | "https") {
            return Err(ExporterError::InvalidArgument(format!(
                "unsupported Kubernetes API server scheme in {server}"
            )));
        }

        let token_file = match config.token_file {
            Some(path) => Some(path),
            None if in_cluster => existing(PathBuf::from(SERVICE_ACCOUNT_DIR).join("token")).await,
            None => None,
        };
        let ca_file = match config.ca_file {
            Some(path) => Some(path),
            None if in_cluster => existing(PathBuf::from(SERVICE_ACCOUNT_DIR).join("ca.crt")).await,
            None => None,
        };

        let mut builder = reqwest::Client::builder()
            .user_agent(USER_AGENT)
            .timeout(config.request_timeout);

        if let Some(ca_file) = &ca_file {
            let pem = fs::read(ca_file).await?;
            let certificate = reqwest::Certificate::from_pem(&pem).map_err(|err| {
                ExporterError::InvalidArgument(format!(
                    "invalid CA bundle {}: {err}",
                    ca_file.display()
                ))
            })?;
            builder = builder.add_root_certificate(certificate);
        }
        if config.insecure {
            builder = builder.danger_accept_invalid_certs(true);
        }

        let client = builder.build().map_err(|err| {
            ExporterError::InternalError(format!("failed to build Kubernetes client: {err}"))
        })?;

        info!(
            server = %server,
            in_cluster,
            token = token_file.is_some(),
            ca = ca_file.is_some(),
            "Kubernetes API client configured"
        );

        Ok(Self {
            server,
            token_file,
            client,
        })
    }

    pub fn server(&self) -> &str {
        &self.server
    }

    async fn bearer_token(&self) -> Result<Option<String>> {
        let Some(path) = &self.token_file else {
            return Ok(None);
        };
        // Re-read every call; projected service-account tokens rotate.
        let token = fs::read_to_string(path).await?;
        let token = token.trim();
        Ok((!token.is_empty()).then(|| token.to_string()))
    }
}

#[async_trait]
impl ResourceLister for KubeApiLister {
    async fn list(
        &self,
        gvr: &GroupVersionResource,
        options: &ListOptions,
    ) -> Result<ResourceList> {
        let list_error = |message: String| ExporterError::List {
            gvr: gvr.to_string(),
            message,
        };

        let url = format!("{}{}", self.server, gvr.api_path());
        let mut request = self.client.get(&url).query(&query_params(options));
        if let Some(token) = self.bearer_token().await? {
            request = request.bearer_auth(token);
        }

        debug!(url = %url, continue_token = ?options.continue_token, "listing resources");
        let response = request
            .send()
            .await
            .map_err(|err| list_error(format!("request to {url} failed: {err}")))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(list_error(format!(
                "{url} returned status {status}: {}",
                api_error_message(&body)
            )));
        }

        let body = response
            .json::<Value>()
            .await
            .map_err(|err| list_error(format!("invalid list response from {url}: {err}")))?;
        parse_list(body).map_err(list_error)
    }
}

fn query_params(options: &ListOptions) -> Vec<(&'static str, String)> {
    let mut params = Vec::new();
    if let Some(selector) = options.label_selector.as_deref().filter(|s| !s.is_empty()) {
        params.push(("labelSelector", selector.to_string()));
    }
    if let Some(limit) = options.limit.filter(|limit| *limit > 0) {
        params.push(("limit", limit.to_string()));
    }
    if let Some(token) = options.continue_token.as_deref().filter(|t| !t.is_empty()) {
        params.push(("continue", token.to_string()));
    }
    params
}

/// Items of a `List` response. Each item gets the list's `apiVersion` and
/// item kind filled in when the server omitted them, as the API server does
/// for typed lists.
fn parse_list(body: Value) -> std::result::Result<ResourceList, String> {
    let Value::Object(mut body) = body else {
        return Err("list response is not an object".to_string());
    };

    let continue_token = body
        .get("metadata")
        .and_then(|metadata| metadata.get("continue"))
        .and_then(Value::as_str)
        .filter(|token| !token.is_empty())
        .map(str::to_string);

    let api_version = body
        .get("apiVersion")
        .and_then(Value::as_str)
        .map(str::to_string);
    let item_kind = body
        .get("kind")
        .and_then(Value::as_str)
        .and_then(|kind| kind.strip_suffix("List"))
        .map(str::to_string);

    let items = match body.remove("items") {
        Some(Value::Array(items)) => items,
        Some(Value::Null) | None => Vec::new(),
        Some(_) => return Err("list response items is not an array".to_string()),
    };

    let items = items
        .into_iter()
        .map(|mut item| {
            if let Value::Object(fields) = &mut item {
                if let Some(api_version) = &api_version {
                    fields
                        .entry("apiVersion")
                        .or_insert_with(|| Value::String(api_version.clone()));
                }
                if let Some(kind) = &item_kind {
                    fields
                        .entry("kind")
                        .or_insert_with(|| Value::String(kind.clone()));
                }
            }
            item
        })
        .collect();

    Ok(ResourceList {
        items,
        continue_token,
    })
}

fn api_error_message(body: &str) -> String {
    serde_json::from_str::<Value>(body)
        .ok()
        .and_then(|status| {
            status
                .get("message")
                .and_then(Value::as_str)
                .map(str::to_string)
        })
        .unwrap_or_else(|| body.trim().to_string())
}

fn in_cluster_server(host: Option<String>, port: Option<String>) -> Result<String> {
    let (Some(host), Some(port)) = (host, port) else {
        return Err(ExporterError::InvalidArgument(
            "no Kubernetes API server configured and KUBERNETES_SERVICE_HOST/KUBERNETES_SERVICE_PORT are not set".to_string(),
        ));
    };
    if host.contains(':') {
        Ok(format!("https://[{host}]:{port}"))
    } else {
        Ok(format!("https://{host}:{port}"))
    }
}

async fn existing(path: PathBuf) -> Option<PathBuf> {
    fs::try_exists(&path)
        .await
        .unwrap_or(false)
        .then_some(path)
}

#[cfg(test)]
mod tests {
    use std::{collections::HashMap, io::Write, time::Duration};

    use axum::{
        Json, Router,
        extract::Query,
        http::{HeaderMap, StatusCode},
        routing::get,
    };
    use kre_common::types::GroupVersionResource;
    use serde_json::{Value, json};

    use super::{KubeApiLister, KubeClientConfig, in_cluster_server, parse_list, query_params};
    use crate::lister::{ListOptions, ResourceLister};

    #[test]
    fn in_cluster_server_brackets_ipv6() {
        assert_eq!(
            in_cluster_server(Some("10.0.0.1".to_string()), Some("443".to_string())).unwrap(),
            "https://10.0.0.1:443"
        );
        assert_eq!(
            in_cluster_server(Some("fd00::1".to_string()), Some("443".to_string())).unwrap(),
            "https://[fd00::1]:443"
        );
        assert!(in_cluster_server(None, Some("443".to_string())).is_err());
    }

    #[tokio::test]
    async fn rejects_invalid_server_urls() {
        for server in ["not a url", "ftp://cluster.local"] {
            let result = KubeApiLister::connect(KubeClientConfig {
                server: Some(server.to_string()),
                ..KubeClientConfig::default()
            })
            .await;
            assert!(result.is_err(), "{server} was accepted");
        }
    }

    #[test]
    fn query_params_skip_empty_values() {
        let options = ListOptions {
            label_selector: Some("app=web".to_string()),
            limit: Some(0),
            continue_token: Some(String::new()),
        };
        assert_eq!(
            query_params(&options),
            vec![("labelSelector", "app=web".to_string())]
        );
    }

    #[test]
    fn parse_list_fills_item_kind() {
        let list = parse_list(json!({
            "apiVersion": "apps/v1",
            "kind": "DeploymentList",
            "metadata": {"continue": "abc"},
            "items": [{"metadata": {"name": "web"}}]
        }))
        .unwrap();
        assert_eq!(list.continue_token.as_deref(), Some("abc"));
        assert_eq!(list.items[0]["apiVersion"], "apps/v1");
        assert_eq!(list.items[0]["kind"], "Deployment");

        let empty = parse_list(json!({"metadata": {"continue": ""}, "items": null})).unwrap();
        assert!(empty.items.is_empty());
        assert!(empty.next_token().is_none());
    }

    async fn fake_list(
        headers: HeaderMap,
        Query(query): Query<HashMap<String, String>>,
    ) -> Result<Json<Value>, StatusCode> {
        if headers
            .get("authorization")
            .and_then(|value| value.to_str().ok())
            != Some("Bearer secret")
        {
            return Err(StatusCode::UNAUTHORIZED);
        }
        assert_eq!(query.get("labelSelector").map(String::as_str), Some("app=web"));
        let body = match query.get("continue").map(String::as_str) {
            None => json!({
                "apiVersion": "v1",
                "kind": "PodList",
                "metadata": {"continue": "page-2"},
                "items": [{"metadata": {"name": "web-0"}}]
            }),
            Some("page-2") => json!({
                "apiVersion": "v1",
                "kind": "PodList",
                "metadata": {},
                "items": [{"metadata": {"name": "web-1"}}]
            }),
            Some(_) => return Err(StatusCode::GONE),
        };
        Ok(Json(body))
    }

    #[tokio::test]
    async fn lists_pages_from_api_server() {
        let app = Router::new().route("/api/v1/pods", get(fake_list));
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });

        let mut token = tempfile::NamedTempFile::new().unwrap();
        writeln!(token, "secret").unwrap();

        let lister = KubeApiLister::connect(KubeClientConfig {
            server: Some(format!("http://{addr}/")),
            token_file: Some(token.path().to_path_buf()),
            request_timeout: Duration::from_secs(5),
            ..KubeClientConfig::default()
        })
        .await
        .unwrap();
        assert_eq!(lister.server(), format!("http://{addr}"));

        let gvr = GroupVersionResource::new("", "v1", "pods");
        let mut options = ListOptions {
            label_selector: Some("app=web".to_string()),
            ..ListOptions::default()
        };
        let first = lister.list(&gvr, &options).await.unwrap();
        assert_eq!(first.items[0]["kind"], "Pod");
        assert_eq!(first.next_token(), Some("page-2"));

        options.continue_token = first.continue_token.clone();
        let second = lister.list(&gvr, &options).await.unwrap();
        assert_eq!(second.items[0]["metadata"]["name"], "web-1");
        assert!(second.next_token().is_none());

        options.continue_token = Some("expired".to_string());
        let err = lister.list(&gvr, &options).await.unwrap_err();
        assert!(err.to_string().contains("/v1/pods"));
    }
}
