//! Shared HTTP plumbing for provider clients.
//!
//! One [`ProviderHttp`] exists per configured provider. Pagination, enrichment, webhook
//! refetches and hook registration all go through its [`RateGate`], so the provider sees at
//! most `rate_limit` concurrent requests no matter how many passes are running.

use crate::{Error, Result};
use reqwest::header::{HeaderMap, HeaderName, HeaderValue, USER_AGENT};
use reqwest::{Client, Method, RequestBuilder};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;

pub const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// Provider-wide request throttle.
#[derive(Debug, Clone)]
pub struct RateGate {
    permits: Arc<Semaphore>,
    limit: usize,
}

impl RateGate {
    pub fn new(limit: usize) -> Result<Self> {
        if limit == 0 {
            return Err(Error::Configuration("rate_limit must be > 0".to_string()));
        }
        Ok(Self {
            permits: Arc::new(Semaphore::new(limit)),
            limit,
        })
    }

    pub fn limit(&self) -> usize {
        self.limit
    }

    /// Requests currently holding a permit.
    pub fn in_use(&self) -> usize {
        self.limit - self.permits.available_permits()
    }

    pub async fn acquire(&self) -> Result<tokio::sync::OwnedSemaphorePermit> {
        self.permits
            .clone()
            .acquire_owned()
            .await
            .map_err(|_| Error::BackendMessage("provider rate gate closed".to_string()))
    }
}

/// A decoded JSON response plus the headers some providers paginate with.
#[derive(Debug, Clone)]
pub struct JsonResponse {
    pub status: u16,
    pub headers: HeaderMap,
    pub body: serde_json::Value,
}

impl JsonResponse {
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name).and_then(|v| v.to_str().ok())
    }
}

#[derive(Debug, Clone)]
pub struct ProviderHttp {
    client: Client,
    base_url: String,
    headers: HeaderMap,
    gate: RateGate,
    provider: &'static str,
}

impl ProviderHttp {
    #[tracing::instrument(level = "debug", skip(base_url))]
    pub fn new(provider: &'static str, base_url: &str, rate_limit: usize) -> Result<Self> {
        let client = Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .map_err(|e| Error::backend("build reqwest client", e))?;
        let mut headers = HeaderMap::new();
        headers.insert(USER_AGENT, HeaderValue::from_static("resync"));
        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            headers,
            gate: RateGate::new(rate_limit)?,
            provider,
        })
    }

    /// Add a default header sent with every request (auth tokens, API versions).
    pub fn with_header(mut self, name: &'static str, value: &str) -> Result<Self> {
        let value = HeaderValue::from_str(value).map_err(|e| {
            Error::Configuration(format!("invalid {} header '{name}': {e}", self.provider))
        })?;
        let name = HeaderName::from_bytes(name.as_bytes())
            .map_err(|e| Error::Configuration(format!("invalid header name '{name}': {e}")))?;
        self.headers.insert(name, value);
        Ok(self)
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// Start a request. Paths are joined to the base URL; absolute URLs pass through.
    pub fn request(&self, method: Method, path: &str) -> RequestBuilder {
        let url = if path.starts_with("http://") || path.starts_with("https://") {
            path.to_string()
        } else {
            format!("{}/{}", self.base_url, path.trim_start_matches('/'))
        };
        self.client
            .request(method, url)
            .headers(self.headers.clone())
    }

    pub fn get(&self, path: &str) -> RequestBuilder {
        self.request(Method::GET, path)
    }

    pub fn post(&self, path: &str) -> RequestBuilder {
        self.request(Method::POST, path)
    }

    /// Send through the rate gate and decode a JSON body. Non-success statuses are classified
    /// with [`Error::from_status`].
    #[tracing::instrument(level = "debug", skip(self, builder), fields(provider = self.provider))]
    pub async fn send(&self, builder: RequestBuilder) -> Result<JsonResponse> {
        let _permit = self.gate.acquire().await?;
        let resp = builder.send().await.map_err(Error::backend_reqwest)?;
        let status = resp.status();
        let headers = resp.headers().clone();
        if !status.is_success() {
            let text = resp.text().await.unwrap_or_default();
            tracing::debug!(status = status.as_u16(), body = %truncate(&text, 512), "provider request failed");
            return Err(Error::from_status(
                status.as_u16(),
                format!("{} {}", self.provider, truncate(&text, 200)),
            ));
        }
        let bytes = resp.bytes().await.map_err(Error::backend_reqwest)?;
        let body = if bytes.is_empty() {
            serde_json::Value::Null
        } else {
            serde_json::from_slice(&bytes)
                .map_err(|e| Error::backend(format!("decode {} response", self.provider), e))?
        };
        Ok(JsonResponse {
            status: status.as_u16(),
            headers,
            body,
        })
    }
}

fn truncate(s: &str, max: usize) -> &str {
    match s.char_indices().nth(max) {
        Some((idx, _)) => &s[..idx],
        None => s,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn joins_paths_and_passes_absolute_urls() {
        let http = ProviderHttp::new("gitlab", "https://gitlab.example.com/api/v4/", 2).unwrap();
        let req = http.get("/projects").build().unwrap();
        assert_eq!(req.url().as_str(), "https://gitlab.example.com/api/v4/projects");
        let req = http
            .get("https://other.example.com/graphql")
            .build()
            .unwrap();
        assert_eq!(req.url().as_str(), "https://other.example.com/graphql");
    }

    #[test]
    fn default_headers_are_attached() {
        let http = ProviderHttp::new("pagerduty", "https://api.pagerduty.com", 1)
            .unwrap()
            .with_header("authorization", "Token token=abc")
            .unwrap();
        let req = http.get("services").build().unwrap();
        assert_eq!(
            req.headers().get("authorization").unwrap(),
            "Token token=abc"
        );
    }

    #[tokio::test]
    async fn gate_bounds_concurrent_permits() {
        let gate = RateGate::new(2).unwrap();
        let a = gate.acquire().await.unwrap();
        let _b = gate.acquire().await.unwrap();
        assert_eq!(gate.in_use(), 2);
        let pending = tokio::time::timeout(Duration::from_millis(20), gate.acquire()).await;
        assert!(pending.is_err());
        drop(a);
        assert!(gate.acquire().await.is_ok());
        assert!(RateGate::new(0).is_err());
    }
}
