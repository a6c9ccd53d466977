//! Request/response side of a resource endpoint.
//!
//! ```text
//! GET    <endpoint>[?params]   → list | {data|items: list, pagination?} | object
//! POST   <endpoint>            → created item
//! PUT    <endpoint>/<id>       → updated item
//! DELETE <endpoint>/<id>       → status only
//! ```

use std::time::Duration;

use async_trait::async_trait;
use reqwest::header::{HeaderMap, HeaderValue, ACCEPT};
use reqwest::{Client, Response};
use serde_json::Value;

use crate::protocol::{path_segment, ResourceId};

/// Request-level failures.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ApiError {
    #[error("request failed: {0}")]
    Request(String),

    #[error("server returned {status}: {body}")]
    Status { status: u16, body: String },

    #[error("invalid response body: {0}")]
    Decode(String),
}

/// Query parameters for a list request, in insertion order.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FetchParams {
    pairs: Vec<(String, String)>,
}

impl FetchParams {
    /// Empty parameter list.
    pub fn new() -> Self {
        Self::default()
    }

    /// Append one `key=value` pair.
    pub fn with(mut self, key: impl Into<String>, value: impl ToString) -> Self {
        self.pairs.push((key.into(), value.to_string()));
        self
    }

    /// Append `page=<n>`.
    pub fn page(self, page: u64) -> Self {
        self.with("page", page)
    }

    /// Append `per_page=<n>`.
    pub fn per_page(self, per_page: u64) -> Self {
        self.with("per_page", per_page)
    }

    /// Pairs in insertion order.
    pub fn pairs(&self) -> &[(String, String)] {
        &self.pairs
    }

    /// Whether no parameter is set.
    pub fn is_empty(&self) -> bool {
        self.pairs.is_empty()
    }
}

/// Backend for a [`ResourceCache`](crate::cache::ResourceCache).
#[async_trait]
pub trait ResourceApi: Send + Sync {
    async fn list(&self, endpoint: &str, params: &FetchParams) -> Result<Value, ApiError>;

    async fn create(&self, endpoint: &str, item: &Value) -> Result<Value, ApiError>;

    async fn update(&self, endpoint: &str, id: &ResourceId, patch: &Value)
        -> Result<Value, ApiError>;

    async fn delete(&self, endpoint: &str, id: &ResourceId) -> Result<(), ApiError>;
}

/// HTTP client configuration.
#[derive(Debug, Clone)]
pub struct HttpConfig {
    pub base_url: String,
    pub timeout_secs: u64,
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            base_url: "http://127.0.0.1:8000/api".to_string(),
            timeout_secs: 30,
        }
    }
}

/// JSON-over-HTTP backend. Keeps a cookie store so the session cookie is
/// sent with every request.
#[derive(Debug, Clone)]
pub struct HttpResourceApi {
    client: Client,
    config: HttpConfig,
}

impl HttpResourceApi {
    /// Build the HTTP client with a cookie store and JSON accept header.
    pub fn new(config: HttpConfig) -> Result<Self, ApiError> {
        let mut headers = HeaderMap::new();
        headers.insert(ACCEPT, HeaderValue::from_static("application/json"));
        let client = Client::builder()
            .cookie_store(true)
            .default_headers(headers)
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()
            .map_err(|e| ApiError::Request(format!("Failed to build HTTP client: {e}")))?;
        Ok(Self { client, config })
    }

    /// Configuration the client was built with.
    pub fn config(&self) -> &HttpConfig {
        &self.config
    }

    fn url(&self, endpoint: &str) -> String {
        format!(
            "{}/{}",
            self.config.base_url.trim_end_matches('/'),
            endpoint.trim_matches('/')
        )
    }

    /// Item URL; the id is always exactly one path segment.
    fn item_url(&self, endpoint: &str, id: &ResourceId) -> String {
        let id = id.to_string();
        format!("{}/{}", self.url(endpoint), path_segment(&id))
    }

    async fn checked(response: Response) -> Result<Response, ApiError> {
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }
        let body = response.text().await.unwrap_or_default();
        Err(ApiError::Status {
            status: status.as_u16(),
            body,
        })
    }

    /// Decode a JSON body; an empty body reads as `null`.
    async fn read_json(response: Response) -> Result<Value, ApiError> {
        let response = Self::checked(response).await?;
        let text = response
            .text()
            .await
            .map_err(|e| ApiError::Request(e.to_string()))?;
        if text.trim().is_empty() {
            return Ok(Value::Null);
        }
        serde_json::from_str(&text).map_err(|e| ApiError::Decode(e.to_string()))
    }
}

fn request_error(e: reqwest::Error) -> ApiError {
    ApiError::Request(e.to_string())
}

#[async_trait]
impl ResourceApi for HttpResourceApi {
    async fn list(&self, endpoint: &str, params: &FetchParams) -> Result<Value, ApiError> {
        let response = self
            .client
            .get(self.url(endpoint))
            .query(params.pairs())
            .send()
            .await
            .map_err(request_error)?;
        Self::read_json(response).await
    }

    async fn create(&self, endpoint: &str, item: &Value) -> Result<Value, ApiError> {
        let response = self
            .client
            .post(self.url(endpoint))
            .json(item)
            .send()
            .await
            .map_err(request_error)?;
        Self::read_json(response).await
    }

    async fn update(
        &self,
        endpoint: &str,
        id: &ResourceId,
        patch: &Value,
    ) -> Result<Value, ApiError> {
        let response = self
            .client
            .put(self.item_url(endpoint, id))
            .json(patch)
            .send()
            .await
            .map_err(request_error)?;
        Self::read_json(response).await
    }

    async fn delete(&self, endpoint: &str, id: &ResourceId) -> Result<(), ApiError> {
        let response = self
            .client
            .delete(self.item_url(endpoint, id))
            .send()
            .await
            .map_err(request_error)?;
        Self::checked(response).await.map(|_| ())
    }
}
