use async_trait::async_trait;
use loadprobe_common::{Endpoint, HttpMethod, LoadProbeError, Result, TransportError};
use std::time::Duration;
use uuid::Uuid;

pub mod executor;

pub use executor::{ExecutorConfig, RequestExecutor, RetryPolicy};

/// A single timed call against the target.
///
/// Implementations return the HTTP status of one attempt, or why no status was
/// received. Retries, timing and success classification belong to
/// [`RequestExecutor`], not to the transport.
#[async_trait]
pub trait Transport: Send + Sync {
    async fn call(&self, endpoint: &Endpoint, timeout: Duration) -> std::result::Result<u16, TransportError>;
}

/// [`Transport`] over HTTP, sharing one connection pool across all virtual users.
pub struct HttpTransport {
    /// Base address without a trailing slash, e.g. `http://localhost:5000`.
    base_url: String,
    http_client: reqwest::Client,
}

impl HttpTransport {
    /// Create a transport aimed at `base_url`. Only `http` and `https` addresses are accepted.
    pub fn new(base_url: &str) -> Result<Self> {
        let parsed = reqwest::Url::parse(base_url).map_err(|e| {
            LoadProbeError::InvalidConfig(format!("invalid target address {base_url:?}: {e}"))
        })?;
        if !matches!(parsed.scheme(), "http" | "https") {
            return Err(LoadProbeError::InvalidConfig(format!(
                "target address must use http or https, got {:?}",
                parsed.scheme()
            )));
        }
        if parsed.host_str().is_none() {
            return Err(LoadProbeError::InvalidConfig(format!(
                "target address {base_url:?} has no host"
            )));
        }

        Ok(Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            http_client: reqwest::Client::new(),
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// Build the absolute URL for `endpoint`.
    pub fn build_url(&self, endpoint: &Endpoint) -> String {
        format!("{}{}", self.base_url, endpoint.path)
    }
}

#[async_trait]
impl Transport for HttpTransport {
    async fn call(&self, endpoint: &Endpoint, timeout: Duration) -> std::result::Result<u16, TransportError> {
        let url = self.build_url(endpoint);

        let response = self
            .http_client
            .request(to_reqwest_method(endpoint.method), &url)
            .timeout(timeout)
            .header("X-Request-Id", Uuid::new_v4().to_string())
            .send()
            .await
            .map_err(|e| classify_error(&e, timeout))?;

        let status = response.status().as_u16();

        // Latency covers the full response, so drain the body before returning.
        response
            .bytes()
            .await
            .map_err(|e| classify_error(&e, timeout))?;

        Ok(status)
    }
}

fn to_reqwest_method(method: HttpMethod) -> reqwest::Method {
    match method {
        HttpMethod::Get => reqwest::Method::GET,
        HttpMethod::Post => reqwest::Method::POST,
        HttpMethod::Put => reqwest::Method::PUT,
        HttpMethod::Delete => reqwest::Method::DELETE,
        HttpMethod::Head => reqwest::Method::HEAD,
    }
}

fn classify_error(e: &reqwest::Error, timeout: Duration) -> TransportError {
    if e.is_timeout() {
        TransportError::Timeout(timeout.as_millis() as u64)
    } else if e.is_connect() {
        TransportError::Connect(e.to_string())
    } else if e.is_body() || e.is_decode() || e.is_builder() {
        TransportError::Malformed(e.to_string())
    } else {
        TransportError::Reset(e.to_string())
    }
}
