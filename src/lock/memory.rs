//! In-process lock cache for single-instance deployments and tests

use super::LockCache;
use crate::error::ReconcilerResult;

use async_trait::async_trait;
use dashmap::DashMap;
use std::time::Duration;
use tokio::time::Instant;

/// Cache entries with a deadline, expired lazily on access
#[derive(Default)]
pub struct MemoryCache {
    entries: DashMap<String, (String, Instant)>,
}

impl MemoryCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Value and time left for `key` if it is still live
    fn live(&self, key: &str) -> Option<(String, Duration)> {
        let now = Instant::now();
        if let Some(entry) = self.entries.get(key) {
            let (value, deadline) = entry.value();
            if *deadline > now {
                return Some((value.clone(), *deadline - now));
            }
        }
        self.evict_expired(key, now);
        None
    }

    /// Remove `key` only if it was already expired at `now`, so an entry
    /// written after the expiry was observed survives.
    fn evict_expired(&self, key: &str, now: Instant) {
        self.entries
            .remove_if(key, |_, (_, deadline)| *deadline <= now);
    }
}

/// Glob match supporting a single trailing `*`
fn glob_matches(pattern: &str, key: &str) -> bool {
    match pattern.strip_suffix('*') {
        Some(prefix) => key.starts_with(prefix),
        None => key == pattern,
    }
}

#[async_trait]
impl LockCache for MemoryCache {
    async fn get(&self, key: &str) -> ReconcilerResult<Option<String>> {
        Ok(self.live(key).map(|(value, _)| value))
    }

    async fn set_ex(&self, key: &str, value: &str, ttl: Duration) -> ReconcilerResult<()> {
        self.entries
            .insert(key.to_string(), (value.to_string(), Instant::now() + ttl));
        Ok(())
    }

    async fn del(&self, key: &str) -> ReconcilerResult<()> {
        self.entries.remove(key);
        Ok(())
    }

    async fn scan_match(&self, pattern: &str) -> ReconcilerResult<Vec<String>> {
        // Expired keys are returned too, as a real cache scan may
        Ok(self
            .entries
            .iter()
            .filter(|e| glob_matches(pattern, e.key()))
            .map(|e| e.key().clone())
            .collect())
    }

    async fn ttl(&self, key: &str) -> ReconcilerResult<Option<Duration>> {
        Ok(self.live(key).map(|(_, remaining)| remaining))
    }

    async fn ping(&self) -> ReconcilerResult<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_glob() {
        assert!(glob_matches("wallet:trc20:T1_*", "wallet:trc20:T1_12.5"));
        assert!(!glob_matches("wallet:trc20:T1_*", "wallet:trc20:T12_12.5"));
        assert!(glob_matches("exact", "exact"));
        assert!(!glob_matches("exact", "exactly"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_scan_reports_expired_keys_but_ttl_does_not() {
        let cache = MemoryCache::new();
        cache
            .set_ex("wallet:eth:0x1_5", "T1", Duration::from_secs(1))
            .await
            .unwrap();
        tokio::time::advance(Duration::from_secs(2)).await;

        let keys = cache.scan_match("wallet:eth:0x1_*").await.unwrap();
        assert_eq!(keys, vec!["wallet:eth:0x1_5".to_string()]);
        assert_eq!(cache.ttl("wallet:eth:0x1_5").await.unwrap(), None);
        assert_eq!(cache.get("wallet:eth:0x1_5").await.unwrap(), None);
    }

    #[tokio::test(start_paused = true)]
    async fn test_eviction_spares_entry_rewritten_after_expiry() {
        let cache = MemoryCache::new();
        let key = "wallet:trc20:T1_12.5";
        cache.set_ex(key, "OLD", Duration::from_secs(1)).await.unwrap();
        tokio::time::advance(Duration::from_secs(2)).await;

        // Expiry observed, then a new lock lands before the eviction runs
        let observed = Instant::now();
        cache.set_ex(key, "NEW", Duration::from_secs(600)).await.unwrap();
        cache.evict_expired(key, observed);

        assert_eq!(cache.get(key).await.unwrap(), Some("NEW".to_string()));
        assert_eq!(cache.ttl(key).await.unwrap(), Some(Duration::from_secs(600)));
    }
}
