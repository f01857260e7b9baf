//! Cache collaborator
//!
//! Services receive an `Arc<dyn CacheStore>` explicitly; there is no global
//! cache. Values are stored as JSON so any serializable result can be cached.
//!
//! Key layout:
//! - analysis: `response-analysis:<workspace>_<sorted flags>_t<threshold>`
//! - statistics: `coding-statistics:<workspace>:<version>`
//! - incomplete variables: `incomplete-variables:<workspace>`

use crate::models::{CodingVersion, MatchingFlags};
use crate::{Error, Result};
use async_trait::async_trait;
use globset::Glob;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use std::collections::HashMap;
use std::time::{Duration, Instant};
use tokio::sync::RwLock;

pub const ANALYSIS_PREFIX: &str = "response-analysis";
pub const STATISTICS_PREFIX: &str = "coding-statistics";
pub const INCOMPLETE_VARIABLES_PREFIX: &str = "incomplete-variables";

/// Key/value cache with glob-pattern invalidation
#[async_trait]
pub trait CacheStore: Send + Sync {
    async fn get_value(&self, key: &str) -> Option<Value>;

    async fn set_value(&self, key: &str, value: Value, ttl: Option<Duration>);

    async fn delete(&self, key: &str);

    /// Delete every key matching a glob-like pattern (`*` wildcard)
    ///
    /// Returns the number of removed entries.
    async fn delete_by_pattern(&self, pattern: &str) -> Result<usize>;
}

/// Typed helpers over [`CacheStore`]
#[async_trait]
pub trait CacheStoreExt: CacheStore {
    /// Read and decode a cached value
    ///
    /// Entries that no longer decode into `T` are treated as a miss.
    async fn get_json<T>(&self, key: &str) -> Option<T>
    where
        T: DeserializeOwned + Send,
    {
        let value = self.get_value(key).await?;
        match serde_json::from_value(value) {
            Ok(decoded) => Some(decoded),
            Err(e) => {
                tracing::warn!(key, error = %e, "Discarding undecodable cache entry");
                None
            }
        }
    }

    async fn set_json<T>(&self, key: &str, value: &T, ttl: Option<Duration>) -> Result<()>
    where
        T: Serialize + Sync,
    {
        let encoded = serde_json::to_value(value)?;
        self.set_value(key, encoded, ttl).await;
        Ok(())
    }
}

impl<C: CacheStore + ?Sized> CacheStoreExt for C {}

struct CacheEntry {
    value: Value,
    expires_at: Option<Instant>,
}

impl CacheEntry {
    fn is_expired(&self, now: Instant) -> bool {
        self.expires_at.is_some_and(|at| at <= now)
    }
}

/// In-process [`CacheStore`]
#[derive(Default)]
pub struct MemoryCache {
    entries: RwLock<HashMap<String, CacheEntry>>,
}

impl MemoryCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of live (non-expired) entries
    pub async fn len(&self) -> usize {
        let now = Instant::now();
        self.entries
            .read()
            .await
            .values()
            .filter(|e| !e.is_expired(now))
            .count()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }
}

#[async_trait]
impl CacheStore for MemoryCache {
    async fn get_value(&self, key: &str) -> Option<Value> {
        let now = Instant::now();
        {
            let entries = self.entries.read().await;
            match entries.get(key) {
                None => return None,
                Some(entry) if !entry.is_expired(now) => return Some(entry.value.clone()),
                Some(_) => {}
            }
        }

        // Expired: drop it so it does not linger until the next pattern delete
        self.entries.write().await.remove(key);
        None
    }

    async fn set_value(&self, key: &str, value: Value, ttl: Option<Duration>) {
        let entry = CacheEntry {
            value,
            expires_at: ttl.map(|t| Instant::now() + t),
        };
        self.entries.write().await.insert(key.to_string(), entry);
    }

    async fn delete(&self, key: &str) {
        self.entries.write().await.remove(key);
    }

    async fn delete_by_pattern(&self, pattern: &str) -> Result<usize> {
        let matcher = Glob::new(pattern)
            .map_err(|e| Error::Validation(format!("Invalid cache pattern {}: {}", pattern, e)))?
            .compile_matcher();

        let mut entries = self.entries.write().await;
        let before = entries.len();
        entries.retain(|key, _| !matcher.is_match(key));
        let removed = before - entries.len();

        tracing::debug!(pattern, removed, "Cache entries invalidated");
        Ok(removed)
    }
}

/// Cache key of a full (unpaginated) analysis result
pub fn analysis_key(workspace_id: i64, flags: &MatchingFlags, threshold: i64) -> String {
    format!(
        "{}:{}_{}_t{}",
        ANALYSIS_PREFIX,
        workspace_id,
        flags.cache_fragment(),
        threshold
    )
}

pub fn statistics_key(workspace_id: i64, version: CodingVersion) -> String {
    format!("{}:{}:{}", STATISTICS_PREFIX, workspace_id, version)
}

pub fn incomplete_variables_key(workspace_id: i64) -> String {
    format!("{}:{}", INCOMPLETE_VARIABLES_PREFIX, workspace_id)
}

/// Drop every cached analysis of a workspace, across flag sets and thresholds
pub async fn invalidate_analysis(cache: &dyn CacheStore, workspace_id: i64) -> Result<usize> {
    cache
        .delete_by_pattern(&format!("{}:{}_*", ANALYSIS_PREFIX, workspace_id))
        .await
}

pub async fn invalidate_statistics(cache: &dyn CacheStore, workspace_id: i64, version: CodingVersion) {
    cache.delete(&statistics_key(workspace_id, version)).await;
}

pub async fn invalidate_incomplete_variables(cache: &dyn CacheStore, workspace_id: i64) {
    cache.delete(&incomplete_variables_key(workspace_id)).await;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::MatchingFlag;
    use serde_json::json;

    #[tokio::test]
    async fn test_set_get_delete() {
        let cache = MemoryCache::new();
        cache.set_value("a", json!({"n": 1}), None).await;

        assert_eq!(cache.get_value("a").await, Some(json!({"n": 1})));

        cache.delete("a").await;
        assert_eq!(cache.get_value("a").await, None);
    }

    #[tokio::test]
    async fn test_typed_roundtrip() {
        let cache = MemoryCache::new();
        cache.set_json("list", &vec![1_i64, 2, 3], None).await.unwrap();

        let list: Option<Vec<i64>> = cache.get_json("list").await;
        assert_eq!(list, Some(vec![1, 2, 3]));

        let wrong: Option<String> = cache.get_json("list").await;
        assert_eq!(wrong, None);
    }

    #[tokio::test]
    async fn test_ttl_expiry() {
        let cache = MemoryCache::new();
        cache
            .set_value("short", json!(1), Some(Duration::from_millis(10)))
            .await;
        cache.set_value("long", json!(2), None).await;

        tokio::time::sleep(Duration::from_millis(30)).await;

        assert_eq!(cache.get_value("short").await, None);
        assert_eq!(cache.get_value("long").await, Some(json!(2)));
        assert_eq!(cache.len().await, 1);
    }

    #[tokio::test]
    async fn test_invalidate_analysis_only_hits_workspace() {
        let cache = MemoryCache::new();
        let flags = MatchingFlags::new().with(MatchingFlag::IgnoreCase);

        cache.set_value(&analysis_key(1, &flags, 2), json!(1), None).await;
        cache.set_value(&analysis_key(1, &MatchingFlags::new(), 3), json!(1), None).await;
        cache.set_value(&analysis_key(12, &flags, 2), json!(1), None).await;
        cache.set_value(&statistics_key(1, CodingVersion::V1), json!(1), None).await;

        let removed = invalidate_analysis(&cache, 1).await.unwrap();
        assert_eq!(removed, 2);
        assert!(cache.get_value(&analysis_key(12, &flags, 2)).await.is_some());
        assert!(cache.get_value(&statistics_key(1, CodingVersion::V1)).await.is_some());
    }

    #[test]
    fn test_key_layout() {
        let flags = MatchingFlags::new()
            .with(MatchingFlag::IgnoreWhitespace)
            .with(MatchingFlag::IgnoreCase);
        assert_eq!(
            analysis_key(5, &flags, 2),
            "response-analysis:5_IGNORE_CASE,IGNORE_WHITESPACE_t2"
        );
        assert_eq!(statistics_key(5, CodingVersion::V2), "coding-statistics:5:v2");
        assert_eq!(incomplete_variables_key(5), "incomplete-variables:5");
    }

    #[tokio::test]
    async fn test_invalid_pattern_is_error() {
        let cache = MemoryCache::new();
        assert!(cache.delete_by_pattern("[unclosed").await.is_err());
    }
}
