/// Redis wrapper with graceful degradation.
///
/// Cache operations return `Option<T>`/`bool`: on any Redis error they log a warning and
/// report a miss, so callers fall through to the source of truth. The counter operations
/// used for shared rate limiting return `Result` instead, because their callers decide
/// what an outage means for them.
use redis::AsyncCommands;
use tracing::warn;

use crate::error::CommonError;

#[derive(Clone)]
pub struct RedisCache {
    client: Option<redis::Client>,
}

/// Counter state as stored in Redis.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WindowCounter {
    pub count: u64,
    /// Milliseconds until the key expires. Zero when Redis reports no expiry.
    pub ttl_ms: u64,
}

impl RedisCache {
    /// Attempt to connect to Redis. If the URL is `None` or the client cannot be created,
    /// returns a `RedisCache` that always degrades gracefully (no-ops).
    pub fn new(url: Option<&str>) -> Self {
        let client = url.and_then(|u| {
            redis::Client::open(u)
                .inspect_err(|e| warn!(error = %e, url = u, "failed to create redis client, cache disabled"))
                .ok()
        });
        Self { client }
    }

    /// A cache with no backing server. Every read misses and every write is dropped.
    pub fn disabled() -> Self {
        Self { client: None }
    }

    /// Test the connection by sending a PING. Returns `true` if Redis is reachable.
    pub async fn is_available(&self) -> bool {
        let Some(client) = &self.client else {
            return false;
        };
        match client.get_multiplexed_async_connection().await {
            Ok(mut conn) => {
                let result: Result<String, _> = redis::cmd("PING").query_async(&mut conn).await;
                result.is_ok()
            }
            Err(_) => false,
        }
    }

    /// Get a value from Redis. Returns `None` if Redis is unavailable or the key doesn't exist.
    pub async fn get(&self, key: &str) -> Option<String> {
        let client = self.client.as_ref()?;
        let mut conn = client
            .get_multiplexed_async_connection()
            .await
            .inspect_err(|e| warn!(error = %e, "redis connection failed"))
            .ok()?;
        let value: Option<String> = conn
            .get(key)
            .await
            .inspect_err(|e| warn!(error = %e, key, "redis GET failed"))
            .ok()?;
        value
    }

    /// Set a value in Redis with a TTL in seconds. Returns `true` if successful.
    pub async fn set_with_ttl(&self, key: &str, value: &str, ttl_secs: u64) -> bool {
        let Some(client) = &self.client else {
            return false;
        };
        let Ok(mut conn) = client
            .get_multiplexed_async_connection()
            .await
            .inspect_err(|e| warn!(error = %e, "redis connection failed"))
        else {
            return false;
        };
        conn.set_ex::<_, _, ()>(key, value, ttl_secs)
            .await
            .inspect_err(|e| warn!(error = %e, key, "redis SETEX failed"))
            .is_ok()
    }

    /// Read a window counter without touching it.
    pub async fn read_counter(&self, key: &str) -> Result<Option<WindowCounter>, CommonError> {
        let mut conn = self.connection().await?;
        let count: Option<u64> = conn.get(key).await?;
        let Some(count) = count else {
            return Ok(None);
        };
        let ttl: i64 = redis::cmd("PTTL").arg(key).query_async(&mut conn).await?;
        Ok(Some(WindowCounter {
            count,
            ttl_ms: ttl.max(0) as u64,
        }))
    }

    /// Increment a window counter. The first increment of a window sets the expiry.
    pub async fn incr_counter(&self, key: &str, window_ms: u64) -> Result<WindowCounter, CommonError> {
        let mut conn = self.connection().await?;
        let count: u64 = conn.incr(key, 1u64).await?;
        if count == 1 {
            let _: () = redis::cmd("PEXPIRE")
                .arg(key)
                .arg(window_ms)
                .query_async(&mut conn)
                .await?;
        }
        let ttl: i64 = redis::cmd("PTTL").arg(key).query_async(&mut conn).await?;
        // A key that lost its expiry (ttl -1) would never reset.
        if ttl < 0 {
            let _: () = redis::cmd("PEXPIRE")
                .arg(key)
                .arg(window_ms)
                .query_async(&mut conn)
                .await?;
            return Ok(WindowCounter {
                count,
                ttl_ms: window_ms,
            });
        }
        Ok(WindowCounter {
            count,
            ttl_ms: ttl as u64,
        })
    }

    async fn connection(&self) -> Result<redis::aio::MultiplexedConnection, CommonError> {
        let client = self.client.as_ref().ok_or(CommonError::RedisUnavailable)?;
        Ok(client.get_multiplexed_async_connection().await?)
    }
}
