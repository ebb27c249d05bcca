use std::{
    collections::{HashMap, VecDeque},
    sync::Arc,
    time::{Duration, Instant},
};

use anyhow::Context;
use async_trait::async_trait;
use shared::error::FetchError;
use tokio::sync::Mutex;
use tracing::{debug, warn};
use url::Url;

pub mod config;

pub use config::{load_settings, ClientSettings};

/// Asynchronous boundary to the CRM server. Implementations answer with
/// the decoded JSON payload or a structured failure; no retries happen at
/// this layer, failures surface once to the immediate caller.
#[async_trait]
pub trait Backend: Send + Sync {
    async fn get(&self, url: &str) -> Result<serde_json::Value, FetchError>;

    async fn post_form(
        &self,
        url: &str,
        fields: &[(String, String)],
    ) -> Result<serde_json::Value, FetchError>;
}

/// Placeholder wired in when no server connection is configured.
pub struct MissingBackend;

#[async_trait]
impl Backend for MissingBackend {
    async fn get(&self, url: &str) -> Result<serde_json::Value, FetchError> {
        Err(FetchError::network(format!(
            "no backend configured for GET {url}"
        )))
    }

    async fn post_form(
        &self,
        url: &str,
        _fields: &[(String, String)],
    ) -> Result<serde_json::Value, FetchError> {
        Err(FetchError::network(format!(
            "no backend configured for POST {url}"
        )))
    }
}

pub struct HttpBackend {
    http: reqwest::Client,
    base_url: Url,
}

impl HttpBackend {
    pub fn new(settings: &ClientSettings) -> anyhow::Result<Self> {
        let base_url = Url::parse(&settings.server_url)
            .with_context(|| format!("invalid server url: {}", settings.server_url))?;
        let http = reqwest::Client::builder()
            .timeout(settings.request_timeout())
            .build()
            .context("failed to build http client")?;
        Ok(Self { http, base_url })
    }

    fn resolve(&self, url: &str) -> Result<Url, FetchError> {
        let resolved = if url.starts_with("http://") || url.starts_with("https://") {
            Url::parse(url)
        } else {
            self.base_url.join(url)
        };
        resolved.map_err(|err| FetchError::network(format!("invalid request url {url}: {err}")))
    }

    async fn decode(response: reqwest::Response) -> Result<serde_json::Value, FetchError> {
        let status = response.status();
        let body = response
            .text()
            .await
            .map_err(|err| FetchError::network(format!("failed to read response body: {err}")))?;
        if !status.is_success() {
            return Err(FetchError::new(status.as_u16(), body));
        }
        serde_json::from_str(&body).map_err(|err| {
            FetchError::new(status.as_u16(), format!("invalid json payload: {err}"))
        })
    }
}

#[async_trait]
impl Backend for HttpBackend {
    async fn get(&self, url: &str) -> Result<serde_json::Value, FetchError> {
        let target = self.resolve(url)?;
        let response = self.http.get(target).send().await.map_err(|err| {
            warn!("http: GET {url} failed before response: {err}");
            FetchError::network(err.to_string())
        })?;
        Self::decode(response).await
    }

    async fn post_form(
        &self,
        url: &str,
        fields: &[(String, String)],
    ) -> Result<serde_json::Value, FetchError> {
        let target = self.resolve(url)?;
        let response = self
            .http
            .post(target)
            .form(fields)
            .send()
            .await
            .map_err(|err| {
                warn!("http: POST {url} failed before response: {err}");
                FetchError::network(err.to_string())
            })?;
        Self::decode(response).await
    }
}

struct CacheEntry {
    payload: serde_json::Value,
    expires_at: Instant,
}

/// GET-through cache with a fixed expiry window, shared by every widget
/// that resolves display labels. POSTs always pass through.
pub struct CachedBackend<B> {
    inner: B,
    ttl: Duration,
    entries: Mutex<HashMap<String, CacheEntry>>,
}

impl<B: Backend> CachedBackend<B> {
    pub fn new(inner: B, ttl: Duration) -> Self {
        Self {
            inner,
            ttl,
            entries: Mutex::new(HashMap::new()),
        }
    }

    pub fn shared(inner: B, ttl: Duration) -> Arc<Self> {
        Arc::new(Self::new(inner, ttl))
    }

    pub async fn invalidate(&self, url: &str) {
        self.entries.lock().await.remove(url);
    }

    pub async fn clear(&self) {
        self.entries.lock().await.clear();
    }
}

#[async_trait]
impl<B: Backend> Backend for CachedBackend<B> {
    async fn get(&self, url: &str) -> Result<serde_json::Value, FetchError> {
        {
            let mut entries = self.entries.lock().await;
            if let Some(entry) = entries.get(url) {
                if entry.expires_at > Instant::now() {
                    debug!("cache: hit url={url}");
                    return Ok(entry.payload.clone());
                }
                entries.remove(url);
            }
        }

        let payload = self.inner.get(url).await?;
        self.entries.lock().await.insert(
            url.to_string(),
            CacheEntry {
                payload: payload.clone(),
                expires_at: Instant::now() + self.ttl,
            },
        );
        Ok(payload)
    }

    async fn post_form(
        &self,
        url: &str,
        fields: &[(String, String)],
    ) -> Result<serde_json::Value, FetchError> {
        self.inner.post_form(url, fields).await
    }
}

enum MockReply {
    Payload(serde_json::Value),
    Failure(FetchError),
}

struct MockRule {
    reply: MockReply,
    delay: Option<Duration>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MockCall {
    pub method: &'static str,
    pub url: String,
}

/// Scriptable backend for widget tests: per-URL response queues with
/// optional artificial latency and a call journal. The last rule of a
/// queue persists, so a single stub answers any number of requests while
/// earlier rules are consumed in order.
#[derive(Default)]
pub struct MockBackend {
    get_routes: Mutex<HashMap<String, VecDeque<MockRule>>>,
    post_routes: Mutex<HashMap<String, VecDeque<MockRule>>>,
    calls: Mutex<Vec<MockCall>>,
}

impl MockBackend {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn stub_get(&self, url: &str, payload: serde_json::Value) {
        self.push_get(url, MockReply::Payload(payload), None).await;
    }

    pub async fn stub_get_delayed(&self, url: &str, payload: serde_json::Value, delay: Duration) {
        self.push_get(url, MockReply::Payload(payload), Some(delay))
            .await;
    }

    pub async fn stub_get_error(&self, url: &str, status: u16, body: &str) {
        self.push_get(url, MockReply::Failure(FetchError::new(status, body)), None)
            .await;
    }

    pub async fn stub_post(&self, url: &str, payload: serde_json::Value) {
        self.post_routes
            .lock()
            .await
            .entry(url.to_string())
            .or_default()
            .push_back(MockRule {
                reply: MockReply::Payload(payload),
                delay: None,
            });
    }

    pub async fn calls(&self) -> Vec<MockCall> {
        self.calls.lock().await.clone()
    }

    pub async fn call_count(&self, url: &str) -> usize {
        self.calls
            .lock()
            .await
            .iter()
            .filter(|call| call.url == url)
            .count()
    }

    async fn push_get(&self, url: &str, reply: MockReply, delay: Option<Duration>) {
        self.get_routes
            .lock()
            .await
            .entry(url.to_string())
            .or_default()
            .push_back(MockRule { reply, delay });
    }

    async fn take_rule(
        routes: &Mutex<HashMap<String, VecDeque<MockRule>>>,
        url: &str,
    ) -> Option<(MockReply, Option<Duration>)> {
        let mut routes = routes.lock().await;
        let queue = routes.get_mut(url)?;
        if queue.len() > 1 {
            let rule = queue.pop_front()?;
            return Some((rule.reply, rule.delay));
        }
        let rule = queue.front()?;
        let reply = match &rule.reply {
            MockReply::Payload(payload) => MockReply::Payload(payload.clone()),
            MockReply::Failure(err) => MockReply::Failure(err.clone()),
        };
        Some((reply, rule.delay))
    }

    async fn answer(
        &self,
        method: &'static str,
        routes: &Mutex<HashMap<String, VecDeque<MockRule>>>,
        url: &str,
    ) -> Result<serde_json::Value, FetchError> {
        self.calls.lock().await.push(MockCall {
            method,
            url: url.to_string(),
        });

        let Some((reply, delay)) = Self::take_rule(routes, url).await else {
            return Err(FetchError::new(404, format!("mock: no route for {url}")));
        };

        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        match reply {
            MockReply::Payload(payload) => Ok(payload),
            MockReply::Failure(err) => Err(err),
        }
    }
}

#[async_trait]
impl Backend for MockBackend {
    async fn get(&self, url: &str) -> Result<serde_json::Value, FetchError> {
        self.answer("GET", &self.get_routes, url).await
    }

    async fn post_form(
        &self,
        url: &str,
        _fields: &[(String, String)],
    ) -> Result<serde_json::Value, FetchError> {
        self.answer("POST", &self.post_routes, url).await
    }
}

#[async_trait]
impl<B: Backend + ?Sized> Backend for Arc<B> {
    async fn get(&self, url: &str) -> Result<serde_json::Value, FetchError> {
        (**self).get(url).await
    }

    async fn post_form(
        &self,
        url: &str,
        fields: &[(String, String)],
    ) -> Result<serde_json::Value, FetchError> {
        (**self).post_form(url, fields).await
    }
}

#[cfg(test)]
mod tests;
