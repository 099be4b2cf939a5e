//! In-process cache with per-namespace TTL presets.
//!
//! Entries expire lazily on read. TTL presets follow data volatility: live
//! scores churn every play, team metadata changes once a season.

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use dashmap::DashMap;
use serde::{de::DeserializeOwned, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tracing::{debug, warn};

use crate::error::Result;

/// Cache namespaces with their default TTLs
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Namespace {
    /// 15s: live scores
    LiveGames,
    /// 30s: in-game player stat lines
    PlayerStats,
    /// 60s: game detail
    Games,
    /// 5 min: injury reports
    Injuries,
    /// 30 min: weekly projections
    Projections,
    /// 24h: team/schedule metadata
    Teams,
}

impl Namespace {
    pub fn ttl(&self) -> Duration {
        match self {
            Self::LiveGames => Duration::from_secs(15),
            Self::PlayerStats => Duration::from_secs(30),
            Self::Games => Duration::from_secs(60),
            Self::Injuries => Duration::from_secs(300),
            Self::Projections => Duration::from_secs(1800),
            Self::Teams => Duration::from_secs(86_400),
        }
    }

    pub fn prefix(&self) -> &'static str {
        match self {
            Self::LiveGames => "live",
            Self::PlayerStats => "stats",
            Self::Games => "games",
            Self::Injuries => "injuries",
            Self::Projections => "projections",
            Self::Teams => "teams",
        }
    }
}

#[derive(Clone)]
struct Entry {
    value: serde_json::Value,
    expires_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Default, serde::Serialize)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub writes: u64,
    pub evictions: u64,
    pub entries: usize,
}

/// Values are stored as JSON so one map serves every cached type.
pub struct CacheManager {
    entries: DashMap<String, Entry>,
    max_entries: usize,
    hits: AtomicU64,
    misses: AtomicU64,
    writes: AtomicU64,
    evictions: AtomicU64,
}

impl CacheManager {
    pub fn new(max_entries: usize) -> Self {
        Self {
            entries: DashMap::new(),
            max_entries: max_entries.max(1),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            writes: AtomicU64::new(0),
            evictions: AtomicU64::new(0),
        }
    }

    fn full_key(namespace: Namespace, key: &str) -> String {
        format!("{}:{}", namespace.prefix(), key)
    }

    pub fn get<T: DeserializeOwned>(&self, namespace: Namespace, key: &str) -> Option<T> {
        let full = Self::full_key(namespace, key);
        let now = Utc::now();

        let expired = match self.entries.get(&full) {
            Some(entry) if entry.expires_at > now => {
                let value = serde_json::from_value(entry.value.clone());
                match value {
                    Ok(v) => {
                        self.hits.fetch_add(1, Ordering::Relaxed);
                        return Some(v);
                    }
                    Err(e) => {
                        // Stored under this key with a different shape.
                        warn!(key = %full, error = %e, "cached value failed to deserialize");
                        true
                    }
                }
            }
            Some(_) => true,
            None => false,
        };

        if expired {
            self.entries.remove(&full);
            self.evictions.fetch_add(1, Ordering::Relaxed);
        }
        self.misses.fetch_add(1, Ordering::Relaxed);
        None
    }

    pub fn set<T: Serialize>(&self, namespace: Namespace, key: &str, value: &T) -> Result<()> {
        self.set_with_ttl(namespace, key, value, namespace.ttl())
    }

    pub fn set_with_ttl<T: Serialize>(
        &self,
        namespace: Namespace,
        key: &str,
        value: &T,
        ttl: Duration,
    ) -> Result<()> {
        if self.entries.len() >= self.max_entries {
            self.evict_expired();
            if self.entries.len() >= self.max_entries {
                // Still full of live entries: drop an arbitrary one rather
                // than grow without bound.
                // Bind the key first: holding the iter guard across `remove`
                // would deadlock on the shard lock.
                let victim = self.entries.iter().next().map(|e| e.key().clone());
                if let Some(victim) = victim {
                    self.entries.remove(&victim);
                    self.evictions.fetch_add(1, Ordering::Relaxed);
                }
            }
        }

        let full = Self::full_key(namespace, key);
        let expires_at = Utc::now()
            + ChronoDuration::from_std(ttl).unwrap_or_else(|_| ChronoDuration::seconds(60));
        self.entries.insert(
            full,
            Entry {
                value: serde_json::to_value(value)?,
                expires_at,
            },
        );
        self.writes.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    /// Read-through: return the cached value or produce, store and return it.
    pub async fn get_or_set<T, F, Fut>(
        &self,
        namespace: Namespace,
        key: &str,
        produce: F,
    ) -> Result<T>
    where
        T: Serialize + DeserializeOwned,
        F: FnOnce() -> Fut,
        Fut: std::future::Future<Output = Result<T>>,
    {
        if let Some(value) = self.get(namespace, key) {
            return Ok(value);
        }
        let value = produce().await?;
        self.set(namespace, key, &value)?;
        Ok(value)
    }

    pub fn get_many<T: DeserializeOwned>(
        &self,
        namespace: Namespace,
        keys: &[&str],
    ) -> Vec<Option<T>> {
        keys.iter().map(|key| self.get(namespace, key)).collect()
    }

    pub fn set_many<T: Serialize>(
        &self,
        namespace: Namespace,
        entries: &[(&str, T)],
    ) -> Result<()> {
        for (key, value) in entries {
            self.set(namespace, key, value)?;
        }
        Ok(())
    }

    pub fn invalidate(&self, namespace: Namespace, key: &str) {
        self.entries.remove(&Self::full_key(namespace, key));
    }

    /// Drop every entry in a namespace
    pub fn invalidate_namespace(&self, namespace: Namespace) {
        let prefix = format!("{}:", namespace.prefix());
        self.entries.retain(|key, _| !key.starts_with(&prefix));
    }

    fn evict_expired(&self) {
        let now = Utc::now();
        let before = self.entries.len();
        self.entries.retain(|_, entry| entry.expires_at > now);
        let dropped = before.saturating_sub(self.entries.len());
        if dropped > 0 {
            debug!(dropped, "evicted expired cache entries");
            self.evictions.fetch_add(dropped as u64, Ordering::Relaxed);
        }
    }

    pub fn stats(&self) -> CacheStats {
        CacheStats {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            writes: self.writes.load(Ordering::Relaxed),
            evictions: self.evictions.load(Ordering::Relaxed),
            entries: self.entries.len(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips_typed_values() {
        let cache = CacheManager::new(100);
        cache.set(Namespace::Games, "week:6", &vec![1u32, 2, 3]).unwrap();
        let got: Vec<u32> = cache.get(Namespace::Games, "week:6").unwrap();
        assert_eq!(got, vec![1, 2, 3]);
        assert_eq!(cache.stats().hits, 1);
    }

    #[test]
    fn namespaces_do_not_collide() {
        let cache = CacheManager::new(100);
        cache.set(Namespace::Games, "k", &1u32).unwrap();
        cache.set(Namespace::LiveGames, "k", &2u32).unwrap();
        assert_eq!(cache.get::<u32>(Namespace::Games, "k"), Some(1));
        assert_eq!(cache.get::<u32>(Namespace::LiveGames, "k"), Some(2));
    }

    #[test]
    fn expired_entries_read_as_misses() {
        let cache = CacheManager::new(100);
        cache
            .set_with_ttl(Namespace::LiveGames, "k", &1u32, Duration::ZERO)
            .unwrap();
        assert_eq!(cache.get::<u32>(Namespace::LiveGames, "k"), None);
        assert_eq!(cache.stats().misses, 1);
    }

    #[test]
    fn capacity_bound_is_enforced() {
        let cache = CacheManager::new(3);
        for i in 0..10 {
            cache.set(Namespace::Games, &format!("k{i}"), &i).unwrap();
        }
        assert!(cache.stats().entries <= 3);
    }

    #[test]
    fn invalidate_namespace_only_touches_that_namespace() {
        let cache = CacheManager::new(100);
        cache.set(Namespace::Games, "a", &1u32).unwrap();
        cache.set(Namespace::Injuries, "a", &2u32).unwrap();
        cache.invalidate_namespace(Namespace::Games);
        assert_eq!(cache.get::<u32>(Namespace::Games, "a"), None);
        assert_eq!(cache.get::<u32>(Namespace::Injuries, "a"), Some(2));
    }

    #[tokio::test]
    async fn get_or_set_produces_once() {
        let cache = CacheManager::new(100);
        let first: u32 = cache
            .get_or_set(Namespace::Games, "k", || async { Ok(5u32) })
            .await
            .unwrap();
        let second: u32 = cache
            .get_or_set(Namespace::Games, "k", || async {
                panic!("should not be produced again")
            })
            .await
            .unwrap();
        assert_eq!(first, 5);
        assert_eq!(second, 5);
    }

    #[test]
    fn batch_ops_round_trip() {
        let cache = CacheManager::new(100);
        cache
            .set_many(Namespace::Games, &[("a", 1u32), ("b", 2u32)])
            .unwrap();
        let got = cache.get_many::<u32>(Namespace::Games, &["a", "b", "c"]);
        assert_eq!(got, vec![Some(1), Some(2), None]);
    }

    #[test]
    fn live_ttl_is_shortest() {
        assert!(Namespace::LiveGames.ttl() < Namespace::PlayerStats.ttl());
        assert!(Namespace::Projections.ttl() < Namespace::Teams.ttl());
    }
}
