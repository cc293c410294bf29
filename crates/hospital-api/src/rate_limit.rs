//! Fixed-window rate limiting.
//!
//! A window opens on the first request for a key and closes `window` later; inside it
//! at most `max_requests` requests are admitted. Counters live behind [`RateLimitStore`]:
//! [`MemoryRateLimitStore`] for a single process, [`RedisRateLimitStore`] when several
//! instances must share one budget.
//!
//! Store outages fail open: the request is admitted and a warning is logged.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use hospital_common::error::CommonError;
use hospital_common::redis::RedisCache;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, warn};

use crate::error::ApiError;

const REDIS_KEY_PREFIX: &str = "hospital:v1:ratelimit:";

/// Counter state for one key. `reset_time` is in epoch milliseconds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateLimitEntry {
    pub count: u32,
    pub reset_time: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateLimitDecision {
    pub allowed: bool,
    pub remaining: u32,
    pub reset_time: u64,
}

impl RateLimitDecision {
    /// Whole seconds until the window resets, never less than one.
    pub fn retry_after_secs(&self, now_ms: u64) -> u64 {
        let wait_ms = self.reset_time.saturating_sub(now_ms);
        wait_ms.div_ceil(1000).max(1)
    }
}

/// A named limit, e.g. "5 login attempts per 15 minutes".
#[derive(Debug, Clone, Copy)]
pub struct RateLimitPolicy {
    pub scope: &'static str,
    pub max_requests: u32,
    pub window: Duration,
}

impl RateLimitPolicy {
    pub const fn new(scope: &'static str, max_requests: u32, window: Duration) -> Self {
        Self {
            scope,
            max_requests,
            window,
        }
    }

    /// Scoped key, so different endpoints never share a counter.
    pub fn key(&self, identifier: &str) -> String {
        format!("{}:{}", self.scope, identifier)
    }
}

#[async_trait]
pub trait RateLimitStore: Send + Sync {
    /// Current entry for `key`, expired or not.
    async fn get(&self, key: &str, now_ms: u64) -> Result<Option<RateLimitEntry>, CommonError>;

    /// Count one request. Opens a fresh window (`count = 1`) when no live window exists.
    async fn increment(
        &self,
        key: &str,
        window: Duration,
        now_ms: u64,
    ) -> Result<RateLimitEntry, CommonError>;

    /// Drop every entry whose window has closed. Returns how many were removed.
    async fn sweep(&self, now_ms: u64) -> usize;
}

#[derive(Default)]
pub struct MemoryRateLimitStore {
    entries: Mutex<HashMap<String, RateLimitEntry>>,
}

impl MemoryRateLimitStore {
    pub fn new() -> Self {
        Self::default()
    }

    #[cfg(test)]
    pub fn len(&self) -> usize {
        self.entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }
}

#[async_trait]
impl RateLimitStore for MemoryRateLimitStore {
    async fn get(&self, key: &str, _now_ms: u64) -> Result<Option<RateLimitEntry>, CommonError> {
        let entries = self.entries.lock().unwrap_or_else(PoisonError::into_inner);
        Ok(entries.get(key).copied())
    }

    async fn increment(
        &self,
        key: &str,
        window: Duration,
        now_ms: u64,
    ) -> Result<RateLimitEntry, CommonError> {
        let mut entries = self.entries.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(entry) = entries.get_mut(key) {
            if entry.reset_time > now_ms {
                entry.count = entry.count.saturating_add(1);
                return Ok(*entry);
            }
        }
        let fresh = RateLimitEntry {
            count: 1,
            reset_time: now_ms.saturating_add(window.as_millis() as u64),
        };
        entries.insert(key.to_string(), fresh);
        Ok(fresh)
    }

    async fn sweep(&self, now_ms: u64) -> usize {
        let mut entries = self.entries.lock().unwrap_or_else(PoisonError::into_inner);
        let before = entries.len();
        entries.retain(|_, entry| entry.reset_time > now_ms);
        before - entries.len()
    }
}

/// Shared counters in Redis. Keys carry their window as a TTL, so Redis does the sweeping.
pub struct RedisRateLimitStore {
    redis: RedisCache,
}

impl RedisRateLimitStore {
    pub fn new(redis: RedisCache) -> Self {
        Self { redis }
    }
}

#[async_trait]
impl RateLimitStore for RedisRateLimitStore {
    async fn get(&self, key: &str, now_ms: u64) -> Result<Option<RateLimitEntry>, CommonError> {
        let counter = self
            .redis
            .read_counter(&format!("{REDIS_KEY_PREFIX}{key}"))
            .await?;
        Ok(counter.map(|c| RateLimitEntry {
            count: u32::try_from(c.count).unwrap_or(u32::MAX),
            reset_time: now_ms.saturating_add(c.ttl_ms),
        }))
    }

    async fn increment(
        &self,
        key: &str,
        window: Duration,
        now_ms: u64,
    ) -> Result<RateLimitEntry, CommonError> {
        let counter = self
            .redis
            .incr_counter(&format!("{REDIS_KEY_PREFIX}{key}"), window.as_millis() as u64)
            .await?;
        Ok(RateLimitEntry {
            count: u32::try_from(counter.count).unwrap_or(u32::MAX),
            reset_time: now_ms.saturating_add(counter.ttl_ms),
        })
    }

    async fn sweep(&self, _now_ms: u64) -> usize {
        0
    }
}

#[derive(Clone)]
pub struct RateLimiter {
    store: Arc<dyn RateLimitStore>,
}

impl RateLimiter {
    pub fn new(store: Arc<dyn RateLimitStore>) -> Self {
        Self { store }
    }

    pub fn store(&self) -> Arc<dyn RateLimitStore> {
        Arc::clone(&self.store)
    }

    pub async fn check(&self, identifier: &str, max_requests: u32, window: Duration) -> RateLimitDecision {
        self.check_at(identifier, max_requests, window, now_ms()).await
    }

    pub async fn check_at(
        &self,
        identifier: &str,
        max_requests: u32,
        window: Duration,
        now_ms: u64,
    ) -> RateLimitDecision {
        match self.store.get(identifier, now_ms).await {
            Ok(Some(entry)) if entry.reset_time > now_ms && entry.count >= max_requests => {
                return RateLimitDecision {
                    allowed: false,
                    remaining: 0,
                    reset_time: entry.reset_time,
                };
            }
            Ok(_) => {}
            Err(e) => {
                warn!(error = %e, identifier, "rate limit store unavailable, allowing request");
                return fail_open(max_requests, window, now_ms);
            }
        }

        match self.store.increment(identifier, window, now_ms).await {
            // Another request took the last slot between our read and our increment.
            Ok(entry) if entry.count > max_requests => RateLimitDecision {
                allowed: false,
                remaining: 0,
                reset_time: entry.reset_time,
            },
            Ok(entry) => RateLimitDecision {
                allowed: true,
                remaining: max_requests - entry.count,
                reset_time: entry.reset_time,
            },
            Err(e) => {
                warn!(error = %e, identifier, "rate limit store unavailable, allowing request");
                fail_open(max_requests, window, now_ms)
            }
        }
    }

    /// Apply `policy` to a client, turning a rejection into [`ApiError::RateLimited`].
    pub async fn enforce(
        &self,
        policy: &RateLimitPolicy,
        client: &str,
    ) -> Result<RateLimitDecision, ApiError> {
        let decision = self
            .check(&policy.key(client), policy.max_requests, policy.window)
            .await;
        if decision.allowed {
            return Ok(decision);
        }
        warn!(scope = policy.scope, client, "rate limit exceeded");
        Err(ApiError::RateLimited {
            retry_after_secs: decision.retry_after_secs(now_ms()),
        })
    }
}

fn fail_open(max_requests: u32, window: Duration, now_ms: u64) -> RateLimitDecision {
    RateLimitDecision {
        allowed: true,
        remaining: max_requests.saturating_sub(1),
        reset_time: now_ms.saturating_add(window.as_millis() as u64),
    }
}

/// Periodically drop closed windows so memory stays bounded by active clients.
pub fn spawn_sweeper(store: Arc<dyn RateLimitStore>, every: Duration) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(every);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // The first tick completes immediately.
        ticker.tick().await;
        loop {
            ticker.tick().await;
            let removed = store.sweep(now_ms()).await;
            if removed > 0 {
                debug!(removed, "swept expired rate limit entries");
            }
        }
    })
}

pub fn now_ms() -> u64 {
    chrono::Utc::now().timestamp_millis().max(0) as u64
}

#[cfg(test)]
mod tests {
    use super::*;

    const WINDOW: Duration = Duration::from_secs(60);

    fn limiter() -> (RateLimiter, Arc<MemoryRateLimitStore>) {
        let store = Arc::new(MemoryRateLimitStore::new());
        (RateLimiter::new(store.clone()), store)
    }

    #[tokio::test]
    async fn admits_max_requests_then_rejects() {
        let (limiter, _) = limiter();
        let t0 = 1_000_000;

        for i in 0..5u32 {
            let d = limiter.check_at("10.0.0.1", 5, WINDOW, t0 + u64::from(i)).await;
            assert!(d.allowed, "request {i} should be allowed");
            assert_eq!(d.remaining, 4 - i);
            assert_eq!(d.reset_time, t0 + 60_000);
        }

        let d = limiter.check_at("10.0.0.1", 5, WINDOW, t0 + 10).await;
        assert!(!d.allowed);
        assert_eq!(d.remaining, 0);
        assert_eq!(d.reset_time, t0 + 60_000);
    }

    #[tokio::test]
    async fn rejected_requests_do_not_advance_the_counter() {
        let (limiter, store) = limiter();
        let t0 = 5_000;
        for _ in 0..4 {
            limiter.check_at("k", 2, WINDOW, t0).await;
        }
        let entry = store.get("k", t0).await.unwrap().unwrap();
        assert_eq!(entry.count, 2);
    }

    #[tokio::test]
    async fn window_resets_after_reset_time() {
        let (limiter, _) = limiter();
        let t0 = 10_000;
        assert!(limiter.check_at("k", 1, WINDOW, t0).await.allowed);
        assert!(!limiter.check_at("k", 1, WINDOW, t0 + 59_999).await.allowed);

        let after = limiter.check_at("k", 1, WINDOW, t0 + 60_000).await;
        assert!(after.allowed);
        assert_eq!(after.remaining, 0);
        assert_eq!(after.reset_time, t0 + 120_000);
    }

    #[tokio::test]
    async fn identifiers_are_independent() {
        let (limiter, _) = limiter();
        assert!(limiter.check_at("a", 1, WINDOW, 0).await.allowed);
        assert!(!limiter.check_at("a", 1, WINDOW, 1).await.allowed);
        assert!(limiter.check_at("b", 1, WINDOW, 1).await.allowed);
    }

    #[tokio::test]
    async fn policies_scope_their_keys() {
        let login = RateLimitPolicy::new("login", 1, WINDOW);
        let form = RateLimitPolicy::new("form", 1, WINDOW);
        assert_eq!(login.key("1.2.3.4"), "login:1.2.3.4");

        let (limiter, _) = limiter();
        assert!(limiter.enforce(&login, "1.2.3.4").await.is_ok());
        assert!(limiter.enforce(&form, "1.2.3.4").await.is_ok());
        let err = limiter.enforce(&login, "1.2.3.4").await.unwrap_err();
        match err {
            ApiError::RateLimited { retry_after_secs } => {
                assert!((1..=60).contains(&retry_after_secs))
            }
            other => panic!("expected rate limit error, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn sweep_removes_only_closed_windows() {
        let store = MemoryRateLimitStore::new();
        store.increment("old", Duration::from_secs(1), 0).await.unwrap();
        store.increment("live", Duration::from_secs(60), 0).await.unwrap();
        assert_eq!(store.len(), 2);

        assert_eq!(store.sweep(1_000).await, 1);
        assert_eq!(store.len(), 1);
        assert!(store.get("live", 1_000).await.unwrap().is_some());
        assert!(store.get("old", 1_000).await.unwrap().is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn sweeper_clears_closed_windows_every_interval() {
        let store = Arc::new(MemoryRateLimitStore::new());
        store.increment("old", Duration::from_secs(1), 0).await.unwrap();
        store
            .increment("live", Duration::from_secs(3600), now_ms())
            .await
            .unwrap();

        let sweeper = spawn_sweeper(store.clone(), Duration::from_secs(60));
        tokio::time::sleep(Duration::from_secs(30)).await;
        assert_eq!(store.len(), 2);

        tokio::time::sleep(Duration::from_secs(31)).await;
        assert_eq!(store.len(), 1);
        assert!(store.get("live", now_ms()).await.unwrap().is_some());
        sweeper.abort();
    }

    #[test]
    fn retry_after_rounds_up_and_never_hits_zero() {
        let d = RateLimitDecision {
            allowed: false,
            remaining: 0,
            reset_time: 10_500,
        };
        assert_eq!(d.retry_after_secs(10_000), 1);
        assert_eq!(d.retry_after_secs(8_400), 3);
        assert_eq!(d.retry_after_secs(20_000), 1);
    }

    struct BrokenStore;

    #[async_trait]
    impl RateLimitStore for BrokenStore {
        async fn get(&self, _: &str, _: u64) -> Result<Option<RateLimitEntry>, CommonError> {
            Err(CommonError::RedisUnavailable)
        }
        async fn increment(&self, _: &str, _: Duration, _: u64) -> Result<RateLimitEntry, CommonError> {
            Err(CommonError::RedisUnavailable)
        }
        async fn sweep(&self, _: u64) -> usize {
            0
        }
    }

    #[tokio::test]
    async fn store_outage_fails_open() {
        let limiter = RateLimiter::new(Arc::new(BrokenStore));
        for _ in 0..10 {
            assert!(limiter.check_at("k", 1, WINDOW, 0).await.allowed);
        }
    }

    /// Reports an empty window on read but a full one on increment, as when a
    /// concurrent request wins the race in a shared store.
    struct RacingStore;

    #[async_trait]
    impl RateLimitStore for RacingStore {
        async fn get(&self, _: &str, _: u64) -> Result<Option<RateLimitEntry>, CommonError> {
            Ok(None)
        }
        async fn increment(&self, _: &str, _: Duration, now_ms: u64) -> Result<RateLimitEntry, CommonError> {
            Ok(RateLimitEntry {
                count: 4,
                reset_time: now_ms + 1_000,
            })
        }
        async fn sweep(&self, _: u64) -> usize {
            0
        }
    }

    #[tokio::test]
    async fn losing_an_increment_race_rejects() {
        let limiter = RateLimiter::new(Arc::new(RacingStore));
        let d = limiter.check_at("k", 3, WINDOW, 0).await;
        assert!(!d.allowed);
        assert_eq!(d.reset_time, 1_000);
    }
}
