use chrono::Utc;
use convoy_core::ConvoyResult;
use convoy_store::{DegradedFlag, DegradedMode, Store};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};
use std::net::IpAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, warn};
use uuid::Uuid;

/// Rate limit configuration (`[rate_limit]`).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RateLimitConfig {
    pub enabled: bool,
    /// Requests per window for endpoints without an override.
    pub default_limit: u32,
    pub window_secs: u64,
    /// Endpoint path → requests per window.
    pub endpoints: HashMap<String, u32>,
    /// Reverse proxies whose `X-Forwarded-For` / `X-Real-IP` headers are
    /// believed. Empty means every request is keyed on its socket peer.
    pub trusted_proxies: Vec<IpAddr>,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            default_limit: 100,
            window_secs: 60,
            endpoints: HashMap::new(),
            trusted_proxies: Vec::new(),
        }
    }
}

/// Outcome of one rate-limit check.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct RateLimitDecision {
    pub limited: bool,
    pub limit: u32,
    pub remaining: u32,
    /// Time until the oldest counted request leaves the window.
    pub reset_after: Duration,
}

/// Sliding-window log limiter keyed by `(client_ip, endpoint)`.
///
/// The log lives in the shared store as an ordered set of request
/// timestamps, so every gateway replica sees the same window. A request is
/// added first and removed again if it pushed the count over the limit,
/// which keeps the check safe under concurrent callers.
///
/// When the store is unreachable the limiter falls back to an in-process
/// window per key and reports [`DegradedMode`] until the store answers again.
pub struct RateLimiter {
    store: Arc<dyn Store>,
    config: RateLimitConfig,
    window: Duration,
    local: Mutex<HashMap<String, VecDeque<Instant>>>,
    degraded: DegradedFlag,
}

impl RateLimiter {
    pub fn new(store: Arc<dyn Store>, config: RateLimitConfig) -> Self {
        let window = Duration::from_secs(config.window_secs.max(1));
        Self {
            store,
            config,
            window,
            local: Mutex::new(HashMap::new()),
            degraded: DegradedFlag::new("rate_limiter"),
        }
    }

    /// Override the window length.
    pub fn with_window(mut self, window: Duration) -> Self {
        self.window = window;
        self
    }

    pub fn window(&self) -> Duration {
        self.window
    }

    /// Whether forwarding headers sent by `peer` are believed.
    pub fn trusts_proxy(&self, peer: &IpAddr) -> bool {
        self.config.trusted_proxies.contains(peer)
    }

    /// Limit for `endpoint`: its override, else the default.
    pub fn limit_for(&self, endpoint: &str) -> u32 {
        self.config
            .endpoints
            .get(endpoint)
            .copied()
            .unwrap_or(self.config.default_limit)
    }

    /// Count this request against the caller's window.
    pub async fn check(&self, client_ip: &str, endpoint: &str) -> RateLimitDecision {
        let limit = self.limit_for(endpoint);
        if !self.config.enabled {
            return RateLimitDecision {
                limited: false,
                limit,
                remaining: limit,
                reset_after: Duration::ZERO,
            };
        }

        let key = format!("convoy:ratelimit:{client_ip}:{endpoint}");
        let decision = match self.check_store(&key, limit).await {
            Ok(decision) => {
                self.degraded.clear();
                decision
            }
            Err(e) => {
                self.degraded.mark(&e);
                warn!(client = %client_ip, endpoint = %endpoint, error = %e, "Store unavailable, using local rate limit window");
                self.check_local(&key, limit)
            }
        };
        if decision.limited {
            debug!(client = %client_ip, endpoint = %endpoint, limit, "Rate limited");
        }
        decision
    }

    async fn check_store(&self, key: &str, limit: u32) -> ConvoyResult<RateLimitDecision> {
        let window_ms = self.window.as_millis() as f64;
        let now_ms = Utc::now().timestamp_millis() as f64;
        self.store
            .zremrangebyscore(key, f64::MIN, now_ms - window_ms)
            .await?;

        // Unique across replicas hitting the same key in the same millisecond.
        let member = format!("{now_ms}-{}", Uuid::new_v4().simple());
        self.store.zadd(key, &member, now_ms).await?;
        self.store.expire(key, self.window).await?;
        let count = self.store.zcard(key).await?;

        if count > u64::from(limit) {
            self.store.zrem(key, &member).await?;
            let oldest = self.store.zfirst(key).await?.map_or(now_ms, |(_, s)| s);
            let reset_ms = (oldest + window_ms - now_ms).max(0.0);
            return Ok(RateLimitDecision {
                limited: true,
                limit,
                remaining: 0,
                reset_after: Duration::from_millis(reset_ms as u64),
            });
        }

        let oldest = self.store.zfirst(key).await?.map_or(now_ms, |(_, s)| s);
        Ok(RateLimitDecision {
            limited: false,
            limit,
            remaining: limit.saturating_sub(count as u32),
            reset_after: Duration::from_millis((oldest + window_ms - now_ms).max(0.0) as u64),
        })
    }

    fn check_local(&self, key: &str, limit: u32) -> RateLimitDecision {
        let now = Instant::now();
        let mut local = self.local.lock();
        let log = local.entry(key.to_string()).or_default();
        while log
            .front()
            .is_some_and(|t| now.duration_since(*t) >= self.window)
        {
            log.pop_front();
        }

        let reset_after = |log: &VecDeque<Instant>| {
            log.front()
                .map_or(Duration::ZERO, |t| self.window.saturating_sub(now.duration_since(*t)))
        };

        if log.len() >= limit as usize {
            return RateLimitDecision {
                limited: true,
                limit,
                remaining: 0,
                reset_after: reset_after(log),
            };
        }
        log.push_back(now);
        RateLimitDecision {
            limited: false,
            limit,
            remaining: limit.saturating_sub(log.len() as u32),
            reset_after: reset_after(log),
        }
    }

    /// Remove local windows with no activity for `max_idle`.
    pub fn cleanup(&self, max_idle: Duration) {
        let now = Instant::now();
        self.local.lock().retain(|_, log| {
            log.back()
                .is_some_and(|t| now.duration_since(*t) < max_idle)
        });
    }

    /// Number of local fallback windows currently held.
    pub fn local_windows(&self) -> usize {
        self.local.lock().len()
    }

    pub fn is_degraded(&self) -> bool {
        self.degraded.is_degraded()
    }

    pub fn degraded(&self) -> Option<DegradedMode> {
        self.degraded.current()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use convoy_store::MemoryStore;

    fn limiter(limit: u32) -> (Arc<MemoryStore>, RateLimiter) {
        let store = Arc::new(MemoryStore::new());
        let config = RateLimitConfig {
            default_limit: limit,
            ..RateLimitConfig::default()
        };
        (store.clone(), RateLimiter::new(store, config))
    }

    #[tokio::test]
    async fn test_allows_up_to_limit() {
        let (_, limiter) = limiter(3);
        for expected_remaining in [2, 1, 0] {
            let d = limiter.check("10.0.0.1", "/tasks").await;
            assert!(!d.limited);
            assert_eq!(d.remaining, expected_remaining);
        }
        let d = limiter.check("10.0.0.1", "/tasks").await;
        assert!(d.limited);
        assert!(d.reset_after <= Duration::from_secs(60));
    }

    #[tokio::test]
    async fn test_keys_are_independent() {
        let (_, limiter) = limiter(1);
        assert!(!limiter.check("a", "/tasks").await.limited);
        assert!(!limiter.check("b", "/tasks").await.limited);
        assert!(!limiter.check("a", "/stats").await.limited);
        assert!(limiter.check("a", "/tasks").await.limited);
    }

    #[tokio::test]
    async fn test_replicas_share_one_window() {
        let store = Arc::new(MemoryStore::new());
        let config = RateLimitConfig {
            default_limit: 2,
            ..RateLimitConfig::default()
        };
        let first = RateLimiter::new(store.clone(), config.clone());
        let second = RateLimiter::new(store, config);

        assert_eq!(first.check("a", "/tasks").await.remaining, 1);
        assert_eq!(second.check("a", "/tasks").await.remaining, 0);
        assert!(first.check("a", "/tasks").await.limited);
        assert!(second.check("a", "/tasks").await.limited);
    }

    #[tokio::test]
    async fn test_endpoint_override() {
        let store = Arc::new(MemoryStore::new());
        let mut config = RateLimitConfig::default();
        config.endpoints.insert("/events/publish".into(), 7);
        let limiter = RateLimiter::new(store, config);
        assert_eq!(limiter.limit_for("/events/publish"), 7);
        assert_eq!(limiter.limit_for("/tasks"), 100);
    }

    #[tokio::test]
    async fn test_disabled_never_limits() {
        let store = Arc::new(MemoryStore::new());
        let config = RateLimitConfig {
            enabled: false,
            default_limit: 1,
            ..RateLimitConfig::default()
        };
        let limiter = RateLimiter::new(store, config);
        for _ in 0..5 {
            assert!(!limiter.check("a", "/tasks").await.limited);
        }
    }

    #[tokio::test]
    async fn test_local_fallback_when_store_down() {
        let (store, limiter) = limiter(2);
        store.set_offline(true);
        assert!(!limiter.check("a", "/tasks").await.limited);
        assert!(limiter.is_degraded());
        assert!(!limiter.check("a", "/tasks").await.limited);
        assert!(limiter.check("a", "/tasks").await.limited);
        assert_eq!(limiter.local_windows(), 1);

        store.set_offline(false);
        assert!(!limiter.check("a", "/tasks").await.limited);
        assert!(!limiter.is_degraded());
    }

    #[tokio::test]
    async fn test_cleanup_prunes_idle_local_windows() {
        let (store, limiter) = limiter(5);
        store.set_offline(true);
        limiter.check("a", "/tasks").await;
        limiter.check("b", "/tasks").await;
        tokio::time::sleep(Duration::from_millis(30)).await;
        limiter.cleanup(Duration::from_millis(10));
        assert_eq!(limiter.local_windows(), 0);
    }
}
