//! Wallet-amount locks
//!
//! A lock entry records which trade is expecting an exact amount at a
//! wallet address: `wallet:<prefix>:<address>_<amount>` -> trade id, with a
//! TTL covering the order's payable window. Entries live in an external
//! key-value cache with no transaction shared with the order store.

mod memory;
mod redis_cache;

pub use memory::MemoryCache;
pub use redis_cache::RedisCache;

use crate::chain::ChainAddress;
use crate::error::ReconcilerResult;

use async_trait::async_trait;
use rust_decimal::Decimal;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

const KEY_PREFIX: &str = "wallet:";

/// Primitive operations of the key-value cache holding lock entries
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait LockCache: Send + Sync {
    async fn get(&self, key: &str) -> ReconcilerResult<Option<String>>;

    async fn set_ex(&self, key: &str, value: &str, ttl: Duration) -> ReconcilerResult<()>;

    async fn del(&self, key: &str) -> ReconcilerResult<()>;

    /// Keys matching a glob `pattern`; may include keys that expired since
    async fn scan_match(&self, pattern: &str) -> ReconcilerResult<Vec<String>>;

    /// Remaining TTL, `None` when the key is gone or has no expiry
    async fn ttl(&self, key: &str) -> ReconcilerResult<Option<Duration>>;

    async fn ping(&self) -> ReconcilerResult<()>;
}

/// Key for one (address, amount) pair
pub fn cache_key(address: &ChainAddress, amount: Decimal) -> String {
    format!("{}{}_{}", KEY_PREFIX, address, amount.normalize())
}

fn wildcard_key(address: &ChainAddress) -> String {
    format!("{}{}_*", KEY_PREFIX, address)
}

/// Cache-backed mapping from (chain, address, amount) to trade id
#[derive(Clone)]
pub struct LockStore {
    cache: Arc<dyn LockCache>,
}

impl LockStore {
    pub fn new(cache: Arc<dyn LockCache>) -> Self {
        Self { cache }
    }

    /// Set the entry, replacing whatever is there
    pub async fn lock(
        &self,
        address: &ChainAddress,
        amount: Decimal,
        trade_id: &str,
        ttl: Duration,
    ) -> ReconcilerResult<()> {
        let key = cache_key(address, amount);

        if let Ok(Some(previous)) = self.cache.get(&key).await {
            if previous != trade_id {
                warn!(
                    "Lock {} reassigned from trade {} to {} while still live",
                    key, previous, trade_id
                );
            }
        }

        self.cache.set_ex(&key, trade_id, ttl).await?;
        debug!("Locked {} -> {} for {:?}", key, trade_id, ttl);
        Ok(())
    }

    pub async fn unlock(&self, address: &ChainAddress, amount: Decimal) -> ReconcilerResult<()> {
        let key = cache_key(address, amount);
        self.cache.del(&key).await?;
        debug!("Unlocked {}", key);
        Ok(())
    }

    pub async fn lookup_trade_id(
        &self,
        address: &ChainAddress,
        amount: Decimal,
    ) -> ReconcilerResult<Option<String>> {
        self.cache.get(&cache_key(address, amount)).await
    }

    /// Whether any unexpired lock exists for `address`.
    ///
    /// Only gates whether a scan is worth an explorer call: any cache error
    /// answers `true` so a payable order is never left unscanned.
    pub async fn is_locked(&self, address: &ChainAddress) -> bool {
        let keys = match self.cache.scan_match(&wildcard_key(address)).await {
            Ok(keys) => keys,
            Err(e) => {
                warn!("Lock scan for {} failed, assuming locked: {}", address, e);
                return true;
            }
        };

        for key in keys {
            match self.cache.ttl(&key).await {
                Ok(Some(remaining)) if !remaining.is_zero() => return true,
                Ok(_) => continue,
                Err(e) => {
                    warn!("TTL lookup for {} failed, assuming locked: {}", key, e);
                    return true;
                }
            }
        }

        false
    }

    pub async fn health_check(&self) -> ReconcilerResult<()> {
        self.cache.ping().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chain::Chain;
    use crate::error::ReconcilerError;
    use std::str::FromStr;

    fn wallet() -> ChainAddress {
        ChainAddress::new(Chain::Bsc, "0xWallet")
    }

    fn amount(s: &str) -> Decimal {
        Decimal::from_str(s).unwrap()
    }

    fn memory_store() -> LockStore {
        LockStore::new(Arc::new(MemoryCache::new()))
    }

    fn cache_error() -> ReconcilerError {
        ReconcilerError::Cache(redis::RedisError::from((
            redis::ErrorKind::IoError,
            "connection reset",
        )))
    }

    #[test]
    fn test_key_layout() {
        assert_eq!(cache_key(&wallet(), amount("12.50")), "wallet:bsc:0xWallet_12.5");
        assert_eq!(cache_key(&wallet(), amount("10.000")), "wallet:bsc:0xWallet_10");
        assert_eq!(wildcard_key(&wallet()), "wallet:bsc:0xWallet_*");
    }

    #[tokio::test(start_paused = true)]
    async fn test_lock_lookup_until_ttl() {
        let store = memory_store();
        store
            .lock(&wallet(), amount("12.5"), "T1", Duration::from_secs(600))
            .await
            .unwrap();

        assert_eq!(
            store.lookup_trade_id(&wallet(), amount("12.50")).await.unwrap(),
            Some("T1".to_string())
        );
        assert_eq!(store.lookup_trade_id(&wallet(), amount("12.51")).await.unwrap(), None);

        tokio::time::advance(Duration::from_secs(601)).await;
        assert_eq!(store.lookup_trade_id(&wallet(), amount("12.5")).await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_unlock_removes_entry() {
        let store = memory_store();
        store
            .lock(&wallet(), amount("3"), "T1", Duration::from_secs(600))
            .await
            .unwrap();
        store.unlock(&wallet(), amount("3")).await.unwrap();

        assert_eq!(store.lookup_trade_id(&wallet(), amount("3")).await.unwrap(), None);
        assert!(!store.is_locked(&wallet()).await);
    }

    #[tokio::test]
    async fn test_later_lock_overwrites_earlier() {
        let store = memory_store();
        store
            .lock(&wallet(), amount("12.5"), "FIRST", Duration::from_secs(600))
            .await
            .unwrap();
        store
            .lock(&wallet(), amount("12.5"), "SECOND", Duration::from_secs(600))
            .await
            .unwrap();

        assert_eq!(
            store.lookup_trade_id(&wallet(), amount("12.5")).await.unwrap(),
            Some("SECOND".to_string())
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_is_locked_ignores_expired_and_other_wallets() {
        let store = memory_store();
        assert!(!store.is_locked(&wallet()).await);

        let other = ChainAddress::new(Chain::Polygon, "0xWallet");
        store
            .lock(&other, amount("1"), "T0", Duration::from_secs(600))
            .await
            .unwrap();
        assert!(!store.is_locked(&wallet()).await);

        store
            .lock(&wallet(), amount("1"), "T1", Duration::from_secs(5))
            .await
            .unwrap();
        assert!(store.is_locked(&wallet()).await);

        tokio::time::advance(Duration::from_secs(6)).await;
        assert!(!store.is_locked(&wallet()).await);
    }

    #[tokio::test]
    async fn test_is_locked_skips_keys_observed_after_expiry() {
        let mut cache = MockLockCache::new();
        cache
            .expect_scan_match()
            .returning(|_| Ok(vec!["wallet:bsc:0xWallet_1".to_string()]));
        cache.expect_ttl().returning(|_| Ok(None));

        let store = LockStore::new(Arc::new(cache));
        assert!(!store.is_locked(&wallet()).await);
    }

    #[tokio::test]
    async fn test_is_locked_fails_open_on_scan_error() {
        let mut cache = MockLockCache::new();
        cache.expect_scan_match().returning(|_| Err(cache_error()));

        let store = LockStore::new(Arc::new(cache));
        assert!(store.is_locked(&wallet()).await);
    }

    #[tokio::test]
    async fn test_is_locked_fails_open_on_ttl_error() {
        let mut cache = MockLockCache::new();
        cache
            .expect_scan_match()
            .returning(|_| Ok(vec!["wallet:bsc:0xWallet_1".to_string()]));
        cache.expect_ttl().returning(|_| Err(cache_error()));

        let store = LockStore::new(Arc::new(cache));
        assert!(store.is_locked(&wallet()).await);
    }
}
