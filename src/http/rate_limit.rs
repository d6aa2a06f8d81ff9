//! Token-bucket rate limiting with an injected clock.
//!
//! A provider's limit is expressed as a burst size plus refill rates at one
//! or more horizons (second/minute/hour); the effective rate is the most
//! restrictive one. Acquiring waits until a token is available, so callers
//! never observe a rejected request, only delay.

use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::Mutex;

// ── Clock effect ────────────────────────────────────────────────────

/// Time and sleep effects, injected so rate-limit and backoff behavior is
/// deterministic under test.
#[async_trait]
pub trait Clock: Send + Sync {
    fn now_ms(&self) -> u64;
    async fn sleep(&self, duration: Duration);
}

pub struct SystemClock;

#[async_trait]
impl Clock for SystemClock {
    fn now_ms(&self) -> u64 {
        use std::time::{SystemTime, UNIX_EPOCH};
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis() as u64)
            .unwrap_or(0)
    }

    async fn sleep(&self, duration: Duration) {
        tokio::time::sleep(duration).await;
    }
}

/// Test clock: `sleep` advances time instantly and tallies the total.
pub struct ManualClock {
    now_ms: std::sync::atomic::AtomicU64,
    slept_ms: std::sync::atomic::AtomicU64,
}

impl ManualClock {
    pub fn new() -> Self {
        Self {
            now_ms: std::sync::atomic::AtomicU64::new(1_700_000_000_000),
            slept_ms: std::sync::atomic::AtomicU64::new(0),
        }
    }

    pub fn advance(&self, ms: u64) {
        self.now_ms.fetch_add(ms, std::sync::atomic::Ordering::SeqCst);
    }

    pub fn slept_ms(&self) -> u64 {
        self.slept_ms.load(std::sync::atomic::Ordering::SeqCst)
    }
}

impl Default for ManualClock {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Clock for ManualClock {
    fn now_ms(&self) -> u64 {
        self.now_ms.load(std::sync::atomic::Ordering::SeqCst)
    }

    async fn sleep(&self, duration: Duration) {
        let ms = duration.as_millis() as u64;
        self.advance(ms);
        self.slept_ms.fetch_add(ms, std::sync::atomic::Ordering::SeqCst);
    }
}

// ── Config ──────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RateLimitConfig {
    /// Bucket capacity: how many requests may go out back-to-back.
    pub burst_limit: u32,
    pub requests_per_second: Option<f64>,
    pub requests_per_minute: Option<f64>,
    pub requests_per_hour: Option<f64>,
}

impl RateLimitConfig {
    pub fn per_second(n: u32) -> Self {
        Self {
            burst_limit: n.max(1),
            requests_per_second: Some(n as f64),
            requests_per_minute: None,
            requests_per_hour: None,
        }
    }

    pub fn per_minute(n: u32) -> Self {
        Self {
            burst_limit: 1,
            requests_per_second: None,
            requests_per_minute: Some(n as f64),
            requests_per_hour: None,
        }
    }

    /// Effective refill rate in tokens per millisecond: the most restrictive
    /// of the configured horizons.
    fn tokens_per_ms(&self) -> Result<f64, String> {
        let mut rates = Vec::new();
        if let Some(r) = self.requests_per_second {
            rates.push(r / 1_000.0);
        }
        if let Some(r) = self.requests_per_minute {
            rates.push(r / 60_000.0);
        }
        if let Some(r) = self.requests_per_hour {
            rates.push(r / 3_600_000.0);
        }
        if rates.is_empty() {
            return Err("at least one refill rate is required".to_string());
        }
        if rates.iter().any(|r| *r <= 0.0) {
            return Err("rate limits must be positive".to_string());
        }
        Ok(rates.into_iter().fold(f64::INFINITY, f64::min))
    }
}

// ── Token bucket ────────────────────────────────────────────────────

struct BucketState {
    tokens: f64,
    last_refill_ms: u64,
}

pub struct TokenBucket {
    capacity: f64,
    tokens_per_ms: f64,
    state: Mutex<BucketState>,
    clock: std::sync::Arc<dyn Clock>,
}

impl TokenBucket {
    /// Fails when the burst limit is zero or any configured rate is
    /// non-positive.
    pub fn new(config: RateLimitConfig, clock: std::sync::Arc<dyn Clock>) -> Result<Self, String> {
        if config.burst_limit == 0 {
            return Err("burst limit must be positive".to_string());
        }
        let tokens_per_ms = config.tokens_per_ms()?;
        let capacity = config.burst_limit as f64;
        let now = clock.now_ms();
        Ok(Self {
            capacity,
            tokens_per_ms,
            state: Mutex::new(BucketState {
                tokens: capacity,
                last_refill_ms: now,
            }),
            clock,
        })
    }

    /// Take one token, sleeping until the bucket refills if necessary.
    pub async fn acquire(&self) {
        loop {
            let wait = {
                let mut state = self.state.lock().await;
                let now = self.clock.now_ms();
                let elapsed = now.saturating_sub(state.last_refill_ms) as f64;
                state.tokens = (state.tokens + elapsed * self.tokens_per_ms).min(self.capacity);
                state.last_refill_ms = now;

                if state.tokens >= 1.0 {
                    state.tokens -= 1.0;
                    return;
                }
                let deficit = 1.0 - state.tokens;
                Duration::from_millis((deficit / self.tokens_per_ms).ceil() as u64)
            };
            self.clock.sleep(wait).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn rejects_invalid_config() {
        let clock = Arc::new(ManualClock::new());
        assert!(
            TokenBucket::new(
                RateLimitConfig {
                    burst_limit: 0,
                    requests_per_second: Some(1.0),
                    requests_per_minute: None,
                    requests_per_hour: None,
                },
                clock.clone(),
            )
            .is_err()
        );
        assert!(
            TokenBucket::new(
                RateLimitConfig {
                    burst_limit: 1,
                    requests_per_second: Some(-5.0),
                    requests_per_minute: None,
                    requests_per_hour: None,
                },
                clock.clone(),
            )
            .is_err()
        );
        assert!(
            TokenBucket::new(
                RateLimitConfig {
                    burst_limit: 1,
                    requests_per_second: None,
                    requests_per_minute: None,
                    requests_per_hour: None,
                },
                clock,
            )
            .is_err()
        );
    }

    #[tokio::test]
    async fn burst_passes_without_waiting() {
        let clock = Arc::new(ManualClock::new());
        let bucket = TokenBucket::new(
            RateLimitConfig {
                burst_limit: 3,
                requests_per_second: Some(1.0),
                requests_per_minute: None,
                requests_per_hour: None,
            },
            clock.clone(),
        )
        .unwrap();

        for _ in 0..3 {
            bucket.acquire().await;
        }
        assert_eq!(clock.slept_ms(), 0);
    }

    #[tokio::test]
    async fn exhausted_bucket_waits_for_refill() {
        let clock = Arc::new(ManualClock::new());
        let bucket =
            TokenBucket::new(RateLimitConfig::per_second(1), clock.clone()).unwrap();

        bucket.acquire().await;
        bucket.acquire().await;
        // Second acquire had to wait roughly a full refill interval.
        assert!(clock.slept_ms() >= 900, "slept {}ms", clock.slept_ms());
    }

    #[tokio::test]
    async fn most_restrictive_rate_wins() {
        let clock = Arc::new(ManualClock::new());
        // 100/s but only 60/min → effective 1/s.
        let bucket = TokenBucket::new(
            RateLimitConfig {
                burst_limit: 1,
                requests_per_second: Some(100.0),
                requests_per_minute: Some(60.0),
                requests_per_hour: None,
            },
            clock.clone(),
        )
        .unwrap();

        bucket.acquire().await;
        bucket.acquire().await;
        assert!(clock.slept_ms() >= 900, "slept {}ms", clock.slept_ms());
    }
}
