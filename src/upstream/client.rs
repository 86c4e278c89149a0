//! HTTP client for one upstream inference endpoint.
//!
//! An [`UpstreamClient`] is the pooled unit: a keep-alive HTTP client bound to
//! a single base URL. The [`Connector`] trait is the seam the connection pool
//! uses to create and probe connections, so the pool itself stays transport
//! agnostic.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::header::{HeaderMap, HeaderValue, AUTHORIZATION};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, instrument};
use uuid::Uuid;

use crate::config::upstream::{
    DEFAULT_CHAT_PATH, DEFAULT_LIVENESS_PATH, DEFAULT_REQUEST_TIMEOUT, PROBE_TIMEOUT,
};
use crate::credentials::Credential;
use crate::error::{with_timeout, AppError, Result};

/// Longest upstream error body kept in an error message.
const MAX_ERROR_BODY_CHARS: usize = 512;

/// How the pool creates and health-checks connections.
#[async_trait]
pub trait Connector: Send + Sync + 'static {
    /// The pooled connection type.
    type Connection: Send + Sync + 'static;

    /// Open a new connection to `base_url`.
    async fn connect(&self, base_url: &str) -> Result<Self::Connection>;

    /// Lightweight liveness check of an idle connection.
    async fn probe(&self, connection: &Self::Connection) -> Result<()>;
}

/// Upstream REST surface settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct UpstreamConfig {
    /// Path of the chat completion endpoint.
    pub chat_path: String,
    /// Path probed by the pool health check.
    pub liveness_path: String,
    /// Timeout applied to each upstream request.
    #[serde(with = "crate::config::duration_secs")]
    pub request_timeout: Duration,
}

impl Default for UpstreamConfig {
    fn default() -> Self {
        Self {
            chat_path: DEFAULT_CHAT_PATH.to_string(),
            liveness_path: DEFAULT_LIVENESS_PATH.to_string(),
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
        }
    }
}

/// A keep-alive HTTP connection to one inference endpoint.
#[derive(Debug, Clone)]
pub struct UpstreamClient {
    id: Uuid,
    base_url: String,
    chat_url: String,
    liveness_url: String,
    http: reqwest::Client,
}

impl UpstreamClient {
    /// Build a client bound to `base_url`.
    pub fn connect(base_url: &str, config: &UpstreamConfig) -> Result<Self> {
        let base = base_url.trim_end_matches('/');
        if !(base.starts_with("http://") || base.starts_with("https://")) {
            return Err(AppError::InvalidInput(format!(
                "upstream base URL must be http(s): {}",
                base_url
            )));
        }

        let http = reqwest::Client::builder()
            .pool_max_idle_per_host(1)
            .tcp_keepalive(Duration::from_secs(60))
            .connect_timeout(Duration::from_secs(10))
            .timeout(config.request_timeout)
            .build()?;

        let client = Self {
            id: Uuid::new_v4(),
            base_url: base.to_string(),
            chat_url: format!("{}{}", base, config.chat_path),
            liveness_url: format!("{}{}", base, config.liveness_path),
            http,
        };
        debug!(connection_id = %client.id, base_url = %client.base_url, "Created upstream client");
        Ok(client)
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// POST a chat completion request, authenticating with `credential` when given.
    #[instrument(skip(self, body, credential), fields(base_url = %self.base_url))]
    pub async fn chat_completion(&self, body: &Value, credential: Option<&Credential>) -> Result<Value> {
        let response = self
            .http
            .post(&self.chat_url)
            .headers(auth_headers(credential)?)
            .json(body)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            return Err(AppError::Upstream {
                status: Some(status.as_u16()),
                message: truncate(&text),
            });
        }

        Ok(response.json::<Value>().await?)
    }

    /// GET the liveness path; any 2xx counts as alive.
    pub async fn probe(&self) -> Result<()> {
        with_timeout(
            async {
                let response = self.http.get(&self.liveness_url).send().await?;
                let status = response.status();
                if status.is_success() {
                    Ok(())
                } else {
                    Err(AppError::Upstream {
                        status: Some(status.as_u16()),
                        message: format!("liveness probe to {} failed", self.liveness_url),
                    })
                }
            },
            PROBE_TIMEOUT,
            "liveness probe",
        )
        .await
    }
}

fn auth_headers(credential: Option<&Credential>) -> Result<HeaderMap> {
    let mut headers = HeaderMap::new();
    if let Some(credential) = credential {
        let value = HeaderValue::from_str(&format!("Bearer {}", credential.expose()))
            .map_err(|_| AppError::InvalidInput("credential is not a valid header value".to_string()))?;
        headers.insert(AUTHORIZATION, value);
    }
    Ok(headers)
}

fn truncate(text: &str) -> String {
    if text.chars().count() <= MAX_ERROR_BODY_CHARS {
        return text.to_string();
    }
    let mut truncated: String = text.chars().take(MAX_ERROR_BODY_CHARS).collect();
    truncated.push_str("...");
    truncated
}

/// Connector producing [`UpstreamClient`]s.
#[derive(Debug, Clone, Default)]
pub struct HttpConnector {
    config: UpstreamConfig,
}

impl HttpConnector {
    pub fn new(config: UpstreamConfig) -> Self {
        Self { config }
    }
}

#[async_trait]
impl Connector for HttpConnector {
    type Connection = UpstreamClient;

    async fn connect(&self, base_url: &str) -> Result<UpstreamClient> {
        UpstreamClient::connect(base_url, &self.config)
    }

    async fn probe(&self, connection: &UpstreamClient) -> Result<()> {
        connection.probe().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use wiremock::matchers::{header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    #[test]
    fn test_rejects_non_http_base_url() {
        let result = UpstreamClient::connect("grpc://node:8001", &UpstreamConfig::default());
        assert!(matches!(result, Err(AppError::InvalidInput(_))));
    }

    #[test]
    fn test_urls_are_joined_without_double_slash() {
        let client = UpstreamClient::connect("http://node:11434/", &UpstreamConfig::default()).unwrap();
        assert_eq!(client.base_url(), "http://node:11434");
        assert_eq!(client.chat_url, "http://node:11434/v1/chat/completions");
    }

    #[tokio::test]
    async fn test_chat_completion_sends_bearer_credential() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1/chat/completions"))
            .and(header("authorization", "Bearer sk-test"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"id": "cmpl-1"})))
            .expect(1)
            .mount(&server)
            .await;

        let client = UpstreamClient::connect(&server.uri(), &UpstreamConfig::default()).unwrap();
        let credential = Credential::new("sk-test");
        let response = client
            .chat_completion(&json!({"model": "llama3"}), Some(&credential))
            .await
            .unwrap();
        assert_eq!(response["id"], "cmpl-1");
    }

    #[tokio::test]
    async fn test_non_success_status_becomes_upstream_error() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1/chat/completions"))
            .respond_with(ResponseTemplate::new(429).set_body_string("rate limited"))
            .mount(&server)
            .await;

        let client = UpstreamClient::connect(&server.uri(), &UpstreamConfig::default()).unwrap();
        let err = client
            .chat_completion(&json!({}), None)
            .await
            .unwrap_err();
        assert_eq!(err.upstream_status(), Some(429));
        assert!(err.to_string().contains("rate limited"));
    }

    #[tokio::test]
    async fn test_probe_uses_liveness_path() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/health"))
            .respond_with(ResponseTemplate::new(200))
            .mount(&server)
            .await;

        let connector = HttpConnector::default();
        let client = connector.connect(&server.uri()).await.unwrap();
        assert!(connector.probe(&client).await.is_ok());

        let broken = UpstreamClient::connect(
            &server.uri(),
            &UpstreamConfig {
                liveness_path: "/missing".to_string(),
                ..Default::default()
            },
        )
        .unwrap();
        assert!(broken.probe().await.is_err());
    }
}
