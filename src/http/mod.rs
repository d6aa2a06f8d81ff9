//! Rate-limited, retrying HTTP effect layer.
//!
//! All outbound traffic from provider adapters goes through [`HttpClient`]:
//! a token-bucket rate limiter in front of a transport, bounded exponential
//! backoff with full jitter, and typed error classification so callers can
//! decide between retry, failover, and hard failure. The clock, sleeper, and
//! transport are injected, which keeps retry/backoff tests off the wall
//! clock.

pub mod rate_limit;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use rand::Rng;
use serde_json::Value;
use tokio::sync::Mutex;
use tracing::{debug, warn};

use rate_limit::{Clock, RateLimitConfig, SystemClock, TokenBucket};

// ── Error classification ────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HttpErrorKind {
    RateLimit,
    Server,
    Client,
    Timeout,
    Unknown,
}

/// A classified HTTP failure. `should_retry` is the transport-level verdict;
/// the provider manager layers failover on top of it.
#[derive(Debug, Clone, thiserror::Error)]
#[error("{kind:?} error (status {status:?}): {message}")]
pub struct HttpError {
    pub kind: HttpErrorKind,
    pub status: Option<u16>,
    pub message: String,
    pub should_retry: bool,
    /// Server-requested delay from a `Retry-After` header, when present.
    pub retry_after: Option<Duration>,
}

impl HttpError {
    fn classify(status: u16, message: String, retry_after: Option<Duration>) -> Self {
        let (kind, should_retry) = match status {
            429 => (HttpErrorKind::RateLimit, true),
            408 => (HttpErrorKind::Timeout, true),
            500..=599 => (HttpErrorKind::Server, true),
            400..=499 => (HttpErrorKind::Client, false),
            _ => (HttpErrorKind::Unknown, true),
        };
        Self {
            kind,
            status: Some(status),
            message,
            should_retry,
            retry_after,
        }
    }

    pub fn timeout(message: impl Into<String>) -> Self {
        Self {
            kind: HttpErrorKind::Timeout,
            status: None,
            message: message.into(),
            should_retry: true,
            retry_after: None,
        }
    }

    pub fn network(message: impl Into<String>) -> Self {
        Self {
            kind: HttpErrorKind::Unknown,
            status: None,
            message: message.into(),
            should_retry: true,
            retry_after: None,
        }
    }
}

// ── Transport ───────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct HttpRequest {
    pub method: String,
    pub url: String,
    pub headers: Vec<(String, String)>,
    pub body: Option<Value>,
}

impl HttpRequest {
    pub fn get(url: impl Into<String>) -> Self {
        Self {
            method: "GET".to_string(),
            url: url.into(),
            headers: Vec::new(),
            body: None,
        }
    }

    pub fn post(url: impl Into<String>, body: Value) -> Self {
        Self {
            method: "POST".to_string(),
            url: url.into(),
            headers: Vec::new(),
            body: Some(body),
        }
    }

    pub fn header(mut self, name: &str, value: &str) -> Self {
        self.headers.push((name.to_string(), value.to_string()));
        self
    }

    /// Path portion of the URL, for metric labels.
    fn endpoint(&self) -> String {
        self.url
            .splitn(4, '/')
            .nth(3)
            .map(|p| format!("/{}", p.split('?').next().unwrap_or(p)))
            .unwrap_or_else(|| "/".to_string())
    }
}

#[derive(Debug, Clone)]
pub struct HttpResponse {
    pub status: u16,
    pub body: Value,
}

/// The fetch effect. The production implementation wraps `reqwest`; tests
/// script responses.
#[async_trait]
pub trait Transport: Send + Sync {
    async fn execute(&self, request: &HttpRequest) -> Result<HttpResponse, HttpError>;
}

pub struct ReqwestTransport {
    client: reqwest::Client,
}

impl ReqwestTransport {
    pub fn new(timeout: Duration) -> Result<Self, HttpError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .user_agent(concat!("exitbook/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| HttpError::network(format!("building http client: {e}")))?;
        Ok(Self { client })
    }
}

#[async_trait]
impl Transport for ReqwestTransport {
    async fn execute(&self, request: &HttpRequest) -> Result<HttpResponse, HttpError> {
        let mut builder = match request.method.as_str() {
            "POST" => self.client.post(&request.url),
            _ => self.client.get(&request.url),
        };
        for (name, value) in &request.headers {
            builder = builder.header(name, value);
        }
        if let Some(body) = &request.body {
            builder = builder.json(body);
        }

        let response = builder.send().await.map_err(|e| {
            if e.is_timeout() {
                HttpError::timeout(e.to_string())
            } else {
                HttpError::network(e.to_string())
            }
        })?;

        let status = response.status().as_u16();
        let retry_after = response
            .headers()
            .get("retry-after")
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.parse::<u64>().ok())
            .map(Duration::from_secs);
        let text = response
            .text()
            .await
            .map_err(|e| HttpError::network(format!("reading body: {e}")))?;

        if !(200..300).contains(&status) {
            return Err(HttpError::classify(status, truncate(&text, 300), retry_after));
        }

        let body = if text.is_empty() {
            Value::Null
        } else {
            serde_json::from_str(&text)
                .map_err(|e| HttpError::network(format!("decoding response body: {e}")))?
        };
        Ok(HttpResponse { status, body })
    }
}

fn truncate(s: &str, max: usize) -> String {
    if s.len() <= max {
        return s.to_string();
    }
    let mut end = max;
    while end > 0 && !s.is_char_boundary(end) {
        end -= 1;
    }
    format!("{}…", &s[..end])
}

// ── Metrics ─────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct RequestMetric {
    pub provider: String,
    pub endpoint: String,
    pub method: String,
    pub duration_ms: u64,
    pub status: Option<u16>,
    pub timestamp_ms: u64,
}

// ── Retry policy ────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct RetryConfig {
    pub max_retries: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(30),
        }
    }
}

// ── Client ──────────────────────────────────────────────────────────

const METRICS_BUFFER_CAP: usize = 1024;

/// Rate-limited retrying HTTP client bound to one provider.
pub struct HttpClient {
    provider: String,
    transport: Arc<dyn Transport>,
    bucket: TokenBucket,
    retry: RetryConfig,
    clock: Arc<dyn Clock>,
    metrics: Mutex<Vec<RequestMetric>>,
}

impl HttpClient {
    pub fn new(
        provider: &str,
        rate_limit: RateLimitConfig,
        retry: RetryConfig,
        timeout: Duration,
    ) -> Result<Self, HttpError> {
        let transport = Arc::new(ReqwestTransport::new(timeout)?);
        Self::with_effects(provider, rate_limit, retry, transport, Arc::new(SystemClock))
    }

    /// Construction with injected transport and clock. Fails when any
    /// configured rate is non-positive.
    pub fn with_effects(
        provider: &str,
        rate_limit: RateLimitConfig,
        retry: RetryConfig,
        transport: Arc<dyn Transport>,
        clock: Arc<dyn Clock>,
    ) -> Result<Self, HttpError> {
        let bucket = TokenBucket::new(rate_limit, clock.clone())
            .map_err(|e| HttpError::network(format!("invalid rate limit config: {e}")))?;
        Ok(Self {
            provider: provider.to_string(),
            transport,
            bucket,
            retry,
            clock,
            metrics: Mutex::new(Vec::new()),
        })
    }

    /// Issue a request, waiting on the rate limiter, retrying retriable
    /// failures with full-jitter backoff, and honoring `Retry-After` on 429.
    pub async fn request(&self, request: &HttpRequest) -> Result<HttpResponse, HttpError> {
        let mut last_err: Option<HttpError> = None;

        for attempt in 0..=self.retry.max_retries {
            self.bucket.acquire().await;

            let started = self.clock.now_ms();
            let result = self.transport.execute(request).await;
            let duration_ms = self.clock.now_ms().saturating_sub(started);

            let status = match &result {
                Ok(resp) => Some(resp.status),
                Err(e) => e.status,
            };
            self.record_metric(request, duration_ms, status).await;

            match result {
                Ok(resp) => return Ok(resp),
                Err(err) => {
                    debug!(
                        provider = %self.provider,
                        url = %request.url,
                        attempt,
                        kind = ?err.kind,
                        "request failed: {}",
                        err.message
                    );
                    if !err.should_retry || attempt == self.retry.max_retries {
                        return Err(err);
                    }
                    let delay = match err.retry_after {
                        Some(after) if err.kind == HttpErrorKind::RateLimit => after,
                        _ => self.backoff_delay(attempt),
                    };
                    warn!(
                        provider = %self.provider,
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        "retrying after {:?} failure",
                        err.kind
                    );
                    last_err = Some(err);
                    self.clock.sleep(delay).await;
                }
            }
        }

        Err(last_err.unwrap_or_else(|| HttpError::network("retry loop exhausted")))
    }

    pub async fn get_json(&self, url: &str) -> Result<Value, HttpError> {
        Ok(self.request(&HttpRequest::get(url)).await?.body)
    }

    /// Drain metrics recorded since the last call.
    pub async fn take_metrics(&self) -> Vec<RequestMetric> {
        std::mem::take(&mut *self.metrics.lock().await)
    }

    /// Full-jitter exponential backoff, capped at `max_delay`.
    fn backoff_delay(&self, attempt: u32) -> Duration {
        let exp = self
            .retry
            .base_delay
            .saturating_mul(2u32.saturating_pow(attempt))
            .min(self.retry.max_delay);
        let jitter_ms = rand::rng().random_range(0..=exp.as_millis() as u64);
        Duration::from_millis(jitter_ms)
    }

    async fn record_metric(&self, request: &HttpRequest, duration_ms: u64, status: Option<u16>) {
        let metric = RequestMetric {
            provider: self.provider.clone(),
            endpoint: request.endpoint(),
            method: request.method.clone(),
            duration_ms,
            status,
            timestamp_ms: self.clock.now_ms(),
        };
        debug!(
            provider = %metric.provider,
            endpoint = %metric.endpoint,
            method = %metric.method,
            duration_ms,
            status = status.unwrap_or(0),
            "http request"
        );
        let mut buf = self.metrics.lock().await;
        if buf.len() >= METRICS_BUFFER_CAP {
            buf.remove(0);
        }
        buf.push(metric);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rate_limit::ManualClock;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Transport that plays back a scripted sequence of outcomes.
    struct ScriptedTransport {
        script: Vec<Result<HttpResponse, HttpError>>,
        calls: AtomicUsize,
    }

    #[async_trait]
    impl Transport for ScriptedTransport {
        async fn execute(&self, _request: &HttpRequest) -> Result<HttpResponse, HttpError> {
            let i = self.calls.fetch_add(1, Ordering::SeqCst);
            self.script
                .get(i)
                .cloned()
                .unwrap_or_else(|| Err(HttpError::network("script exhausted")))
        }
    }

    fn client_with_script(
        script: Vec<Result<HttpResponse, HttpError>>,
    ) -> (HttpClient, Arc<ManualClock>) {
        let clock = Arc::new(ManualClock::new());
        let transport = Arc::new(ScriptedTransport {
            script,
            calls: AtomicUsize::new(0),
        });
        let client = HttpClient::with_effects(
            "test",
            RateLimitConfig::per_second(1000),
            RetryConfig {
                max_retries: 3,
                base_delay: Duration::from_millis(1),
                max_delay: Duration::from_millis(10),
            },
            transport,
            clock.clone(),
        )
        .unwrap();
        (client, clock)
    }

    fn ok_response() -> Result<HttpResponse, HttpError> {
        Ok(HttpResponse {
            status: 200,
            body: serde_json::json!({"ok": true}),
        })
    }

    #[tokio::test]
    async fn returns_first_success() {
        let (client, _) = client_with_script(vec![ok_response()]);
        let resp = client.request(&HttpRequest::get("http://x/api/v1")).await.unwrap();
        assert_eq!(resp.status, 200);
    }

    #[tokio::test]
    async fn retries_server_errors_then_succeeds() {
        let (client, _) = client_with_script(vec![
            Err(HttpError::classify(503, "unavailable".into(), None)),
            Err(HttpError::timeout("slow")),
            ok_response(),
        ]);
        let resp = client.request(&HttpRequest::get("http://x/api")).await.unwrap();
        assert_eq!(resp.status, 200);
        assert_eq!(client.take_metrics().await.len(), 3);
    }

    #[tokio::test]
    async fn client_errors_are_not_retried() {
        let (client, _) = client_with_script(vec![
            Err(HttpError::classify(404, "missing".into(), None)),
            ok_response(),
        ]);
        let err = client.request(&HttpRequest::get("http://x/api")).await.unwrap_err();
        assert_eq!(err.kind, HttpErrorKind::Client);
        // Only one call recorded: no retry happened.
        assert_eq!(client.take_metrics().await.len(), 1);
    }

    #[tokio::test]
    async fn rate_limit_honors_retry_after() {
        let (client, clock) = client_with_script(vec![
            Err(HttpError::classify(
                429,
                "slow down".into(),
                Some(Duration::from_secs(7)),
            )),
            ok_response(),
        ]);
        let resp = client.request(&HttpRequest::get("http://x/api")).await.unwrap();
        assert_eq!(resp.status, 200);
        // The manual clock advanced by exactly the server-requested delay.
        assert!(clock.slept_ms() >= 7000);
    }

    #[tokio::test]
    async fn exhausted_retries_surface_last_error() {
        let (client, _) = client_with_script(vec![
            Err(HttpError::classify(500, "a".into(), None)),
            Err(HttpError::classify(502, "b".into(), None)),
            Err(HttpError::classify(503, "c".into(), None)),
            Err(HttpError::classify(504, "d".into(), None)),
        ]);
        let err = client.request(&HttpRequest::get("http://x/api")).await.unwrap_err();
        assert_eq!(err.status, Some(504));
    }

    #[test]
    fn endpoint_strips_host_and_query() {
        let req = HttpRequest::get("https://api.example.com/v2/txs?page=3");
        assert_eq!(req.endpoint(), "/v2/txs");
    }
}
