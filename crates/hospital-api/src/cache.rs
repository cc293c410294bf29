/// Redis caching layer for site search.
///
/// All operations degrade gracefully: without Redis every lookup misses and every
/// write is dropped, and search simply goes to the CMS each time.
///
/// Key schema:
/// - `hospital:v1:search:{sha256(query)}`: JSON-serialized `Vec<SearchResult>` (TTL: 60s,
///   matching the `s-maxage` the endpoint advertises)
use hospital_common::redis::RedisCache;
use hospital_common::site_api::SearchResult;
use sha2::{Digest, Sha256};
use tracing::warn;

const KEY_PREFIX: &str = "hospital:v1:";
const SEARCH_TTL_SECS: u64 = 60;

pub struct SearchCache {
    redis: RedisCache,
}

impl SearchCache {
    pub fn new(redis: RedisCache) -> Self {
        Self { redis }
    }

    pub async fn get(&self, query: &str) -> Option<Vec<SearchResult>> {
        let key = search_key(query);
        let json = self.redis.get(&key).await?;
        serde_json::from_str(&json)
            .inspect_err(|e| warn!(error = %e, key, "cache deserialization failed"))
            .ok()
    }

    pub async fn set(&self, query: &str, results: &[SearchResult]) {
        let key = search_key(query);
        if let Ok(json) = serde_json::to_string(results) {
            self.redis.set_with_ttl(&key, &json, SEARCH_TTL_SECS).await;
        }
    }
}

/// Queries differing only in case share an entry.
fn search_key(query: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(query.to_lowercase().as_bytes());
    let hash = hasher.finalize();
    format!("{KEY_PREFIX}search:{:x}", hash)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn search_key_is_stable_and_case_insensitive() {
        let a = search_key("Cardiology");
        assert_eq!(a, search_key("cardiology"));
        assert_ne!(a, search_key("neurology"));
        assert!(a.starts_with("hospital:v1:search:"));
        assert_eq!(a.len(), "hospital:v1:search:".len() + 64);
    }

    #[tokio::test]
    async fn disabled_cache_always_misses() {
        let cache = SearchCache::new(RedisCache::disabled());
        cache.set("mri", &[]).await;
        assert!(cache.get("mri").await.is_none());
    }
}
