//! Per-chain provider orchestration: health scoring, circuit breaking,
//! failover, and streaming cursor arbitration.
//!
//! The manager owns mutable per-provider state behind a per-chain lock. Every
//! operation selects providers by score (recent success rate, latency, stable
//! preference order), skips open circuits, and fails over on retriable
//! errors. Streaming operations additionally guarantee non-overlapping
//! batches across failover by applying the replacement provider's replay
//! window to the last durable cursor.

use std::collections::{HashMap, HashSet, VecDeque};
use std::num::NonZeroUsize;
use std::sync::Arc;
use std::time::Duration;

use futures::Stream;
use lru::LruCache;
use serde_json::Value;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::cancel::CancelToken;
use crate::error::{Error, Result};
use crate::http::rate_limit::{Clock, SystemClock};
use crate::model::{Cursor, NormalizedRecord};

use super::api::{
    PageRequest, ProviderError, ProviderRequest, ProviderResponse,
};
use super::registry::{RegisteredProvider, Registry};

// ── Config ──────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct ManagerConfig {
    /// Consecutive failures before a circuit opens.
    pub failure_threshold: u32,
    /// Cool-down before an open circuit allows a half-open trial.
    pub circuit_cooldown: Duration,
    /// Window during which repeated rate-limit responses start counting as
    /// failures.
    pub rate_limit_window: Duration,
    /// TTL for the read-through cache on point operations.
    pub cache_ttl: Duration,
    pub cache_capacity: usize,
    /// Bound on the in-memory `(operation, transaction id)` dedup window
    /// held during one streaming session.
    pub dedup_window: usize,
}

impl Default for ManagerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            circuit_cooldown: Duration::from_secs(60),
            rate_limit_window: Duration::from_secs(60),
            cache_ttl: Duration::from_secs(300),
            cache_capacity: 2048,
            dedup_window: 10_000,
        }
    }
}

// ── Health & circuit state ──────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Circuit {
    Closed,
    Open,
    HalfOpen,
}

const SUCCESS_WINDOW: usize = 20;

#[derive(Debug)]
pub struct ProviderHealth {
    pub consecutive_failures: u32,
    pub last_error: Option<String>,
    pub last_latency_ms: u64,
    pub circuit: Circuit,
    pub circuit_opened_at_ms: u64,
    pub last_success_at_ms: u64,
    rate_limited_until_ms: u64,
    recent: VecDeque<bool>,
}

impl Default for ProviderHealth {
    fn default() -> Self {
        Self {
            consecutive_failures: 0,
            last_error: None,
            last_latency_ms: 0,
            circuit: Circuit::Closed,
            circuit_opened_at_ms: 0,
            last_success_at_ms: 0,
            rate_limited_until_ms: 0,
            recent: VecDeque::new(),
        }
    }
}

impl ProviderHealth {
    fn push_outcome(&mut self, success: bool) {
        if self.recent.len() >= SUCCESS_WINDOW {
            self.recent.pop_front();
        }
        self.recent.push_back(success);
    }

    fn success_rate(&self) -> f64 {
        if self.recent.is_empty() {
            return 1.0;
        }
        let ok = self.recent.iter().filter(|s| **s).count();
        ok as f64 / self.recent.len() as f64
    }
}

// ── Streaming types ─────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct StreamRequest {
    pub address: String,
    pub operation_type: String,
    pub since_ms: Option<i64>,
    pub until_ms: Option<i64>,
    pub cursor: Option<Cursor>,
    pub page_size: u32,
}

#[derive(Debug, Clone, Default)]
pub struct BatchStats {
    pub provider: String,
    pub fetched: usize,
    pub deduplicated: usize,
}

/// One batch from `execute_streaming`. The cursor is durable: checkpoint it
/// and pass it back to resume with no overlap.
#[derive(Debug, Clone)]
pub struct StreamBatch {
    pub raw: Vec<Value>,
    pub normalized: Vec<NormalizedRecord>,
    pub cursor: Cursor,
    pub is_complete: bool,
    pub stats: BatchStats,
}

// ── Manager ─────────────────────────────────────────────────────────

struct CacheEntry {
    response: ProviderResponse,
    expires_at_ms: u64,
}

pub struct ProviderManager {
    registry: Arc<Registry>,
    config: ManagerConfig,
    clock: Arc<dyn Clock>,
    /// Per-chain health state; one lock per manager keeps mutation simple
    /// and contention is negligible at provider-call frequency.
    health: Mutex<HashMap<(String, String), ProviderHealth>>,
    cache: Mutex<LruCache<String, CacheEntry>>,
}

impl ProviderManager {
    pub fn new(registry: Arc<Registry>, config: ManagerConfig) -> Self {
        Self::with_clock(registry, config, Arc::new(SystemClock))
    }

    pub fn with_clock(
        registry: Arc<Registry>,
        config: ManagerConfig,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let capacity = NonZeroUsize::new(config.cache_capacity.max(1))
            .expect("capacity clamped to at least 1");
        Self {
            registry,
            config,
            clock,
            health: Mutex::new(HashMap::new()),
            cache: Mutex::new(LruCache::new(capacity)),
        }
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    /// Snapshot of a provider's health, for display.
    pub async fn health_of(&self, chain: &str, provider: &str) -> Option<(Circuit, u32)> {
        let health = self.health.lock().await;
        health
            .get(&(chain.to_lowercase(), provider.to_string()))
            .map(|h| (h.circuit, h.consecutive_failures))
    }

    // ── Selection ───────────────────────────────────────────────────

    /// Score and order candidate providers for an operation. Open circuits
    /// are skipped until their cool-down elapses, at which point they are
    /// admitted as half-open trials.
    async fn select(
        &self,
        chain: &str,
        candidates: Vec<RegisteredProvider>,
    ) -> Vec<RegisteredProvider> {
        let now = self.clock.now_ms();
        let mut health = self.health.lock().await;
        let mut scored: Vec<(f64, RegisteredProvider)> = Vec::new();

        for (index, provider) in candidates.into_iter().enumerate() {
            let key = (chain.to_lowercase(), provider.metadata.name.clone());
            let entry = health.entry(key).or_default();

            match entry.circuit {
                Circuit::Open => {
                    let cooled = now.saturating_sub(entry.circuit_opened_at_ms)
                        >= self.config.circuit_cooldown.as_millis() as u64;
                    if !cooled {
                        continue;
                    }
                    entry.circuit = Circuit::HalfOpen;
                    info!(chain, provider = %provider.metadata.name, "circuit half-open");
                }
                Circuit::Closed | Circuit::HalfOpen => {}
            }
            if now < entry.rate_limited_until_ms {
                continue;
            }

            let latency_factor = 1.0 / (1.0 + entry.last_latency_ms as f64 / 1_000.0);
            let preference = 1.0 / (1.0 + index as f64);
            let score =
                entry.success_rate() * 0.5 + latency_factor * 0.3 + preference * 0.2;
            scored.push((score, provider));
        }

        scored.sort_by(|a, b| b.0.partial_cmp(&a.0).unwrap_or(std::cmp::Ordering::Equal));
        let ordered: Vec<RegisteredProvider> = scored.into_iter().map(|(_, p)| p).collect();
        debug!(
            chain,
            candidates = ?ordered.iter().map(|p| p.metadata.name.as_str()).collect::<Vec<_>>(),
            "provider.selection"
        );
        ordered
    }

    // ── Outcome bookkeeping ─────────────────────────────────────────

    async fn record_success(&self, chain: &str, provider: &str, latency_ms: u64) {
        let mut health = self.health.lock().await;
        let entry = health
            .entry((chain.to_lowercase(), provider.to_string()))
            .or_default();
        if entry.circuit != Circuit::Closed {
            info!(chain, provider, "circuit closed");
        }
        entry.consecutive_failures = 0;
        entry.circuit = Circuit::Closed;
        entry.last_latency_ms = latency_ms;
        entry.last_success_at_ms = self.clock.now_ms();
        entry.push_outcome(true);
    }

    async fn record_failure(&self, chain: &str, provider: &str, err: &ProviderError) {
        let now = self.clock.now_ms();
        let mut health = self.health.lock().await;
        let entry = health
            .entry((chain.to_lowercase(), provider.to_string()))
            .or_default();
        entry.last_error = Some(err.to_string());
        entry.push_outcome(false);

        if err.is_rate_limited() {
            // A lone rate-limit response backs the provider off without
            // penalizing the circuit; repeats within the window do count.
            let within_window = now < entry.rate_limited_until_ms;
            entry.rate_limited_until_ms =
                now + self.config.rate_limit_window.as_millis() as u64;
            warn!(chain, provider, "provider.rate_limited");
            if !within_window {
                return;
            }
        }

        entry.consecutive_failures += 1;
        if entry.circuit == Circuit::HalfOpen
            || entry.consecutive_failures >= self.config.failure_threshold
        {
            entry.circuit = Circuit::Open;
            entry.circuit_opened_at_ms = now;
            warn!(
                chain,
                provider,
                failures = entry.consecutive_failures,
                "circuit opened"
            );
        }
    }

    // ── Point operations with failover ──────────────────────────────

    /// Try providers in scored order until one succeeds. Retriable errors
    /// advance to the next provider; auth/parameter errors fail immediately;
    /// rate limits back the provider off but keep it enrolled.
    pub async fn execute_with_failover(
        &self,
        chain: &str,
        request: ProviderRequest,
        cancel: &CancelToken,
    ) -> Result<ProviderResponse> {
        if let Some(key) = request.cache_key() {
            let cache_key = format!("{chain}:{key}");
            if let Some(hit) = self.cache_get(&cache_key).await {
                debug!(chain, key = %cache_key, "provider cache hit");
                return Ok(hit);
            }
        }

        let candidates = self
            .registry
            .providers_for(chain, request.operation());
        if candidates.is_empty() {
            return Err(Error::ProviderUnavailable(format!(
                "no provider on chain {chain} supports {}",
                request.operation_name()
            )));
        }

        let ordered = self.select(chain, candidates).await;
        let mut errors: Vec<String> = Vec::new();

        for provider in ordered {
            cancel.check()?;
            let name = provider.metadata.name.clone();
            let started = self.clock.now_ms();
            match provider.client.execute(&request, cancel).await {
                Ok(response) => {
                    let latency = self.clock.now_ms().saturating_sub(started);
                    self.record_success(chain, &name, latency).await;
                    if let Some(key) = request.cache_key() {
                        self.cache_put(&format!("{chain}:{key}"), response.clone()).await;
                    }
                    return Ok(response);
                }
                Err(err) => {
                    self.record_failure(chain, &name, &err).await;
                    if !err.retriable {
                        return Err(provider_error_to_crate(err));
                    }
                    errors.push(err.to_string());
                }
            }
        }

        Err(Error::ProviderUnavailable(format!(
            "ALL_PROVIDERS_FAILED on chain {chain} for {}: {}",
            request.operation_name(),
            errors.join("; ")
        )))
    }

    // ── Streaming ───────────────────────────────────────────────────

    /// Pull-based stream of batches. Batches are yielded in producer order;
    /// each carries a self-contained cursor. On failover mid-stream the next
    /// provider resumes from the last durable cursor widened by its replay
    /// window, and the in-memory dedup window drops any replayed records.
    pub fn execute_streaming(
        self: Arc<Self>,
        chain: String,
        request: StreamRequest,
        cancel: CancelToken,
    ) -> impl Stream<Item = Result<StreamBatch>> {
        async_stream::stream! {
            let candidates = self
                .registry
                .providers_for(&chain, super::api::ProviderOp::GetAddressTransactions);
            if candidates.is_empty() {
                yield Err(Error::ProviderUnavailable(format!(
                    "no streaming provider registered for chain {chain}"
                )));
                return;
            }

            let ordered = self.select(&chain, candidates).await;
            if ordered.is_empty() {
                yield Err(Error::ProviderUnavailable(format!(
                    "all providers for chain {chain} are circuit-open"
                )));
                return;
            }

            let mut provider_idx = 0usize;
            let mut cursor = request.cursor.clone();
            let mut seen: HashSet<(String, String)> = HashSet::new();
            let mut seen_order: VecDeque<(String, String)> = VecDeque::new();
            // A fresh provider taking over an inherited cursor must widen it.
            let mut needs_replay_window = match &cursor {
                Some(c) => c.provider_name != ordered[0].metadata.name,
                None => false,
            };

            loop {
                if cancel.is_cancelled() {
                    yield Err(Error::Cancelled);
                    return;
                }

                let provider = &ordered[provider_idx];
                let name = provider.metadata.name.clone();

                let effective_cursor = match (&cursor, needs_replay_window) {
                    (Some(c), true) => {
                        let adjusted = provider.client.apply_replay_window(c);
                        info!(
                            chain = %chain,
                            provider = %name,
                            reason = "failover",
                            from = ?c.primary.value,
                            to = ?adjusted.primary.value,
                            "provider.cursor.adjusted"
                        );
                        Some(adjusted)
                    }
                    (c, _) => c.clone(),
                };
                needs_replay_window = false;

                let page_request = PageRequest {
                    address: request.address.clone(),
                    operation_type: request.operation_type.clone(),
                    since_ms: request.since_ms,
                    until_ms: request.until_ms,
                    cursor: effective_cursor,
                    page_size: request.page_size,
                };

                let started = self.clock.now_ms();
                match provider.client.fetch_page(&page_request, &cancel).await {
                    Ok(page) => {
                        let latency = self.clock.now_ms().saturating_sub(started);
                        self.record_success(&chain, &name, latency).await;

                        let fetched = page.normalized.len();
                        let mut raw = Vec::with_capacity(fetched);
                        let mut normalized = Vec::with_capacity(fetched);
                        for (raw_item, record) in
                            page.raw.into_iter().zip(page.normalized.into_iter())
                        {
                            let key = (
                                request.operation_type.clone(),
                                record.external_id.clone(),
                            );
                            if seen.contains(&key) {
                                continue;
                            }
                            if seen_order.len() >= self.config.dedup_window {
                                if let Some(evicted) = seen_order.pop_front() {
                                    seen.remove(&evicted);
                                }
                            }
                            seen.insert(key.clone());
                            seen_order.push_back(key);
                            raw.push(raw_item);
                            normalized.push(record);
                        }
                        let deduplicated = fetched - normalized.len();

                        let mut next = page.next_cursor;
                        next.provider_name = name.clone();
                        cursor = Some(next.clone());
                        let is_complete = page.is_complete;

                        yield Ok(StreamBatch {
                            raw,
                            normalized,
                            cursor: next,
                            is_complete,
                            stats: BatchStats {
                                provider: name,
                                fetched,
                                deduplicated,
                            },
                        });

                        if is_complete {
                            return;
                        }
                    }
                    Err(err) => {
                        self.record_failure(&chain, &name, &err).await;
                        if !err.retriable {
                            yield Err(provider_error_to_crate(err));
                            return;
                        }
                        warn!(
                            chain = %chain,
                            provider = %provider.metadata.name,
                            error = %err,
                            "streaming provider failed; failing over"
                        );
                        provider_idx += 1;
                        if provider_idx >= ordered.len() {
                            yield Err(Error::ProviderUnavailable(format!(
                                "ALL_PROVIDERS_FAILED streaming {} on chain {chain}: {err}",
                                request.operation_type
                            )));
                            return;
                        }
                        needs_replay_window = cursor.is_some();
                    }
                }
            }
        }
    }

    // ── Cache ───────────────────────────────────────────────────────

    async fn cache_get(&self, key: &str) -> Option<ProviderResponse> {
        let now = self.clock.now_ms();
        let mut cache = self.cache.lock().await;
        match cache.get(key) {
            Some(entry) if entry.expires_at_ms > now => Some(entry.response.clone()),
            Some(_) => {
                cache.pop(key);
                None
            }
            None => None,
        }
    }

    async fn cache_put(&self, key: &str, response: ProviderResponse) {
        let expires_at_ms = self.clock.now_ms() + self.config.cache_ttl.as_millis() as u64;
        self.cache.lock().await.put(
            key.to_string(),
            CacheEntry {
                response,
                expires_at_ms,
            },
        );
    }
}

fn provider_error_to_crate(err: ProviderError) -> Error {
    use super::api::ProviderErrorKind as K;
    match err.kind {
        K::Auth => Error::Auth(err.to_string()),
        K::InvalidParameter => Error::InvalidArgs(err.to_string()),
        K::RateLimited => Error::RateLimited(err.to_string()),
        K::Timeout => Error::Timeout(err.to_string()),
        K::NotSupported => Error::InvalidArgs(err.to_string()),
        _ => Error::Network(err.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::http::rate_limit::{ManualClock, RateLimitConfig};
    use crate::providers::api::{ProviderErrorKind, ProviderOp};
    use crate::providers::mock::{MockProvider, mock_page};
    use crate::providers::registry::{ProviderMetadata, ReplayWindow};

    fn metadata(name: &str, priority: u32) -> ProviderMetadata {
        ProviderMetadata {
            name: name.to_string(),
            supported_chains: vec!["testchain".to_string()],
            operations: vec![
                ProviderOp::GetAddressTransactions,
                ProviderOp::FetchPrice,
                ProviderOp::HasAddressTransactions,
            ],
            rate_limit: RateLimitConfig::per_second(100),
            timeout: Duration::from_secs(5),
            priority,
            api_key_env: None,
            replay_window: ReplayWindow::default(),
        }
    }

    fn registry_with(providers: Vec<(ProviderMetadata, Arc<MockProvider>)>) -> Arc<Registry> {
        let mut registry = Registry::new();
        for (meta, client) in providers {
            let client_arc: Arc<dyn super::super::api::ApiClient> = client;
            registry
                .register(meta, Arc::new(move |_cfg| Ok(client_arc.clone())))
                .unwrap();
        }
        Arc::new(registry)
    }

    fn manager(registry: Arc<Registry>, clock: Arc<ManualClock>) -> Arc<ProviderManager> {
        Arc::new(ProviderManager::with_clock(
            registry,
            ManagerConfig::default(),
            clock,
        ))
    }

    fn upstream_err(provider: &str) -> ProviderError {
        ProviderError::new(provider, "fetch_page", ProviderErrorKind::Upstream, "boom")
    }

    fn price_request() -> ProviderRequest {
        ProviderRequest::Price {
            asset_symbol: "BTC".to_string(),
            currency: "USD".to_string(),
            timestamp_ms: 1_700_000_000_000,
        }
    }

    #[tokio::test]
    async fn failover_returns_first_success() {
        let a = Arc::new(MockProvider::new("a"));
        let b = Arc::new(MockProvider::new("b"));
        a.set_response(
            "has_address_transactions",
            Err(ProviderError::new("a", "has_address_transactions", ProviderErrorKind::Upstream, "down")),
        );
        b.set_response(
            "has_address_transactions",
            Ok(ProviderResponse::HasTransactions(true)),
        );

        let registry = registry_with(vec![(metadata("a", 0), a), (metadata("b", 1), b)]);
        let mgr = manager(registry, Arc::new(ManualClock::new()));

        let resp = mgr
            .execute_with_failover(
                "testchain",
                ProviderRequest::HasAddressTransactions { address: "addr".into() },
                &CancelToken::new(),
            )
            .await
            .unwrap();
        assert!(matches!(resp, ProviderResponse::HasTransactions(true)));
    }

    #[tokio::test]
    async fn non_retriable_error_fails_without_failover() {
        let a = Arc::new(MockProvider::new("a"));
        let b = Arc::new(MockProvider::new("b"));
        a.set_response(
            "fetch_price",
            Err(ProviderError::new("a", "fetch_price", ProviderErrorKind::Auth, "bad key")),
        );
        b.set_response(
            "fetch_price",
            Ok(ProviderResponse::Price(None)),
        );

        let registry = registry_with(vec![(metadata("a", 0), a), (metadata("b", 1), b)]);
        let mgr = manager(registry, Arc::new(ManualClock::new()));

        let err = mgr
            .execute_with_failover("testchain", price_request(), &CancelToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Auth(_)));
    }

    #[tokio::test]
    async fn all_providers_failed_aggregates() {
        let a = Arc::new(MockProvider::new("a"));
        a.set_response(
            "fetch_price",
            Err(ProviderError::new("a", "fetch_price", ProviderErrorKind::Upstream, "x")),
        );
        let registry = registry_with(vec![(metadata("a", 0), a)]);
        let mgr = manager(registry, Arc::new(ManualClock::new()));

        let err = mgr
            .execute_with_failover("testchain", price_request(), &CancelToken::new())
            .await
            .unwrap_err();
        match err {
            Error::ProviderUnavailable(msg) => assert!(msg.contains("ALL_PROVIDERS_FAILED")),
            other => panic!("unexpected error {other:?}"),
        }
    }

    #[tokio::test]
    async fn circuit_opens_after_threshold_and_reopens_half_open() {
        let a = Arc::new(MockProvider::new("a"));
        a.set_response(
            "fetch_price",
            Err(ProviderError::new("a", "fetch_price", ProviderErrorKind::Upstream, "x")),
        );
        let registry = registry_with(vec![(metadata("a", 0), a.clone())]);
        let clock = Arc::new(ManualClock::new());
        let mgr = manager(registry, clock.clone());

        for _ in 0..5 {
            let _ = mgr
                .execute_with_failover("testchain", price_request(), &CancelToken::new())
                .await;
        }
        let (circuit, failures) = mgr.health_of("testchain", "a").await.unwrap();
        assert_eq!(circuit, Circuit::Open);
        assert_eq!(failures, 5);

        // While open (and not cooled down) the provider is skipped entirely.
        let err = mgr
            .execute_with_failover("testchain", price_request(), &CancelToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, Error::ProviderUnavailable(_)));

        // After cool-down the circuit admits a half-open trial; a success
        // closes it.
        clock.advance(61_000);
        a.set_response("fetch_price", Ok(ProviderResponse::Price(None)));
        mgr.execute_with_failover("testchain", price_request(), &CancelToken::new())
            .await
            .unwrap();
        let (circuit, _) = mgr.health_of("testchain", "a").await.unwrap();
        assert_eq!(circuit, Circuit::Closed);
    }

    #[tokio::test]
    async fn single_rate_limit_does_not_open_circuit() {
        let a = Arc::new(MockProvider::new("a"));
        a.set_response(
            "fetch_price",
            Err(ProviderError::new("a", "fetch_price", ProviderErrorKind::RateLimited, "429")),
        );
        let registry = registry_with(vec![(metadata("a", 0), a)]);
        let mgr = manager(registry, Arc::new(ManualClock::new()));

        let _ = mgr
            .execute_with_failover("testchain", price_request(), &CancelToken::new())
            .await;
        let (circuit, failures) = mgr.health_of("testchain", "a").await.unwrap();
        assert_eq!(circuit, Circuit::Closed);
        assert_eq!(failures, 0);
    }

    #[tokio::test]
    async fn point_operations_hit_cache_on_second_call() {
        let a = Arc::new(MockProvider::new("a"));
        a.set_response("fetch_price", Ok(ProviderResponse::Price(None)));
        let registry = registry_with(vec![(metadata("a", 0), a.clone())]);
        let mgr = manager(registry, Arc::new(ManualClock::new()));

        mgr.execute_with_failover("testchain", price_request(), &CancelToken::new())
            .await
            .unwrap();
        // Clear the script; a cache miss would now error.
        a.set_response(
            "fetch_price",
            Err(ProviderError::new("a", "fetch_price", ProviderErrorKind::Upstream, "x")),
        );
        mgr.execute_with_failover("testchain", price_request(), &CancelToken::new())
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn streaming_failover_applies_replay_window_and_dedups() {
        // Provider A yields two pages then dies with a 5xx; provider B
        // resumes with a 5-block rewind and re-serves one record.
        let a = Arc::new(MockProvider::new("a"));
        a.push_page("native", Ok(mock_page("native", &["tx1", "tx2"], 100, false)));
        a.push_page("native", Ok(mock_page("native", &["tx3", "tx4"], 200, false)));
        a.push_page("native", Err(upstream_err("a")));

        let b = Arc::new(
            MockProvider::new("b").with_replay_window(ReplayWindow { blocks: 5, millis: 0 }),
        );
        b.push_page("native", Ok(mock_page("native", &["tx4", "tx5"], 300, true)));

        let registry = registry_with(vec![(metadata("a", 0), a), (metadata("b", 1), b)]);
        let mgr = manager(registry, Arc::new(ManualClock::new()));

        let request = StreamRequest {
            address: "addr".to_string(),
            operation_type: "native".to_string(),
            since_ms: None,
            until_ms: None,
            cursor: None,
            page_size: 2,
        };
        let stream = mgr.execute_streaming("testchain".into(), request, CancelToken::new());
        tokio::pin!(stream);

        let mut ids: Vec<String> = Vec::new();
        let mut batches = 0;
        while let Some(item) = futures::StreamExt::next(&mut stream).await {
            let batch = item.unwrap();
            batches += 1;
            ids.extend(batch.normalized.iter().map(|r| r.external_id.clone()));
            if batch.is_complete {
                break;
            }
        }

        assert_eq!(batches, 3);
        // No duplicates and no gaps across the failover boundary.
        assert_eq!(ids, vec!["tx1", "tx2", "tx3", "tx4", "tx5"]);
    }

    #[tokio::test]
    async fn streaming_all_providers_failed_is_fatal() {
        let a = Arc::new(MockProvider::new("a"));
        a.push_page("native", Err(upstream_err("a")));
        let registry = registry_with(vec![(metadata("a", 0), a)]);
        let mgr = manager(registry, Arc::new(ManualClock::new()));

        let request = StreamRequest {
            address: "addr".to_string(),
            operation_type: "native".to_string(),
            since_ms: None,
            until_ms: None,
            cursor: None,
            page_size: 10,
        };
        let stream = mgr.execute_streaming("testchain".into(), request, CancelToken::new());
        tokio::pin!(stream);
        let first = futures::StreamExt::next(&mut stream).await.unwrap();
        assert!(matches!(first, Err(Error::ProviderUnavailable(_))));
    }

    #[tokio::test]
    async fn streaming_honors_cancellation_between_pages() {
        let a = Arc::new(MockProvider::new("a"));
        a.push_page("native", Ok(mock_page("native", &["tx1"], 100, false)));
        a.push_page("native", Ok(mock_page("native", &["tx2"], 200, true)));
        let registry = registry_with(vec![(metadata("a", 0), a)]);
        let mgr = manager(registry, Arc::new(ManualClock::new()));

        let cancel = CancelToken::new();
        let request = StreamRequest {
            address: "addr".to_string(),
            operation_type: "native".to_string(),
            since_ms: None,
            until_ms: None,
            cursor: None,
            page_size: 1,
        };
        let stream = mgr.execute_streaming("testchain".into(), request, cancel.clone());
        tokio::pin!(stream);

        let first = futures::StreamExt::next(&mut stream).await.unwrap().unwrap();
        assert_eq!(first.normalized.len(), 1);
        cancel.cancel();
        let second = futures::StreamExt::next(&mut stream).await.unwrap();
        assert!(matches!(second, Err(Error::Cancelled)));
    }
}
