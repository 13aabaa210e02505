//! Redis lock cache

use super::LockCache;
use crate::error::ReconcilerResult;

use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::AsyncCommands;
use std::time::Duration;
use tracing::info;

const SCAN_COUNT: usize = 1000;

/// Lock cache over a multiplexed, auto-reconnecting Redis connection
#[derive(Clone)]
pub struct RedisCache {
    conn: ConnectionManager,
}

impl RedisCache {
    pub async fn connect(url: &str) -> ReconcilerResult<Self> {
        let client = redis::Client::open(url)?;
        let conn = ConnectionManager::new(client).await?;
        info!("Connected to Redis lock cache");
        Ok(Self { conn })
    }
}

#[async_trait]
impl LockCache for RedisCache {
    async fn get(&self, key: &str) -> ReconcilerResult<Option<String>> {
        let mut conn = self.conn.clone();
        Ok(conn.get(key).await?)
    }

    async fn set_ex(&self, key: &str, value: &str, ttl: Duration) -> ReconcilerResult<()> {
        let mut conn = self.conn.clone();
        let millis = ttl.as_millis().clamp(1, u64::MAX as u128) as u64;
        conn.pset_ex::<_, _, ()>(key, value, millis).await?;
        Ok(())
    }

    async fn del(&self, key: &str) -> ReconcilerResult<()> {
        let mut conn = self.conn.clone();
        conn.del::<_, ()>(key).await?;
        Ok(())
    }

    async fn scan_match(&self, pattern: &str) -> ReconcilerResult<Vec<String>> {
        let mut conn = self.conn.clone();
        let mut keys = Vec::new();
        let mut cursor: u64 = 0;

        loop {
            let (next, batch): (u64, Vec<String>) = redis::cmd("SCAN")
                .arg(cursor)
                .arg("MATCH")
                .arg(pattern)
                .arg("COUNT")
                .arg(SCAN_COUNT)
                .query_async(&mut conn)
                .await?;
            keys.extend(batch);
            cursor = next;
            if cursor == 0 {
                break;
            }
        }

        Ok(keys)
    }

    async fn ttl(&self, key: &str) -> ReconcilerResult<Option<Duration>> {
        let mut conn = self.conn.clone();
        // -2: no such key, -1: no expiry
        let millis: i64 = conn.pttl(key).await?;
        Ok((millis > 0).then(|| Duration::from_millis(millis as u64)))
    }

    async fn ping(&self) -> ReconcilerResult<()> {
        let mut conn = self.conn.clone();
        redis::cmd("PING").query_async::<_, String>(&mut conn).await?;
        Ok(())
    }
}
