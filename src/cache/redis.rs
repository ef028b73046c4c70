// Redis adapter for the remote cache
//
// Sorted sets are held at score zero so ZADD's return value doubles as the
// test-and-insert result. Every call is bounded by the configured
// read/write timeout; failures surface to the caller with no in-adapter
// retries.

use crate::cache::RemoteCache;
use crate::error::IngestError;
use crate::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use redis::aio::ConnectionManager;
use redis::AsyncCommands;
use std::future::Future;
use std::time::Duration;
use tracing::{info, warn};

pub struct RedisCache {
    conn: ConnectionManager,
    timeout: Duration,
}

impl RedisCache {
    /// Connect, ping, and probe the server's eviction policy. A policy other
    /// than `noeviction` only warns: the operator may be mid-reconfiguration,
    /// but ingest continues at their own risk.
    pub async fn new(addr: &str, timeout: Duration) -> Result<RedisCache> {
        let client = redis::Client::open(format!("redis://{}", addr))?;
        let conn = ConnectionManager::new(client).await?;
        let cache = RedisCache { conn, timeout };

        cache
            .bounded(async {
                let mut conn = cache.conn.clone();
                let pong: String = redis::cmd("PING").query_async(&mut conn).await?;
                Ok(pong)
            })
            .await?;

        match cache.memory_policy_correct().await {
            Ok(true) => info!("Redis maxmemory-policy is noeviction"),
            Ok(false) => warn!(
                "Redis maxmemory-policy should be `noeviction`; evictions will lose set membership"
            ),
            Err(e) => warn!("Could not verify Redis maxmemory-policy: {}", e),
        }

        Ok(cache)
    }

    pub async fn memory_policy_correct(&self) -> Result<bool> {
        let mut conn = self.conn.clone();
        let info: String = self
            .bounded(async move {
                Ok(redis::cmd("INFO").arg("memory").query_async(&mut conn).await?)
            })
            .await?;
        Ok(info.contains("maxmemory_policy:noeviction"))
    }

    async fn bounded<T>(&self, fut: impl Future<Output = Result<T>>) -> Result<T> {
        match tokio::time::timeout(self.timeout, fut).await {
            Ok(res) => res,
            Err(_) => Err(IngestError::Timeout { duration: self.timeout }),
        }
    }

    fn is_oom(err: &redis::RedisError) -> bool {
        err.code() == Some("OOM") || err.to_string().starts_with("OOM")
    }
}

#[async_trait]
impl RemoteCache for RedisCache {
    async fn exists(&self, key: &str) -> Result<bool> {
        let mut conn = self.conn.clone();
        let key = key.to_string();
        self.bounded(async move { Ok(conn.exists(key).await?) }).await
    }

    async fn sorted_insert(&self, key: &str, member: &str) -> Result<bool> {
        let mut conn = self.conn.clone();
        let k = key.to_string();
        let m = member.to_string();
        let added: i64 = self
            .bounded(async move {
                conn.zadd(&k, &m, 0).await.map_err(|e| {
                    if Self::is_oom(&e) {
                        IngestError::CacheOutOfMemory { key: k.clone(), member: m.clone() }
                    } else {
                        IngestError::from(e)
                    }
                })
            })
            .await?;
        Ok(added == 1)
    }

    async fn sorted_contains(&self, key: &str, member: &str) -> Result<bool> {
        let mut conn = self.conn.clone();
        let key = key.to_string();
        let member = member.to_string();
        let score: Option<f64> = self
            .bounded(async move { Ok(conn.zscore(key, member).await?) })
            .await?;
        Ok(score.is_some())
    }

    async fn sorted_list(&self, key: &str) -> Result<Vec<String>> {
        let mut conn = self.conn.clone();
        let key = key.to_string();
        self.bounded(async move { Ok(conn.zrange(key, 0, -1).await?) }).await
    }

    async fn expire_at(&self, key: &str, when: DateTime<Utc>) -> Result<()> {
        let mut conn = self.conn.clone();
        let key = key.to_string();
        self.bounded(async move {
            let _: bool = conn.expire_at(key, when.timestamp()).await?;
            Ok(())
        })
        .await
    }

    async fn queue(&self, key: &str, id: &str) -> Result<i64> {
        let mut conn = self.conn.clone();
        let key = key.to_string();
        let id = id.to_string();
        self.bounded(async move { Ok(conn.rpush(key, id).await?) }).await
    }

    async fn pop(&self, key: &str) -> Result<Option<String>> {
        let mut conn = self.conn.clone();
        let key = key.to_string();
        self.bounded(async move { Ok(conn.lpop(key, None).await?) }).await
    }

    async fn queue_length(&self, key: &str) -> Result<i64> {
        let mut conn = self.conn.clone();
        let key = key.to_string();
        self.bounded(async move { Ok(conn.llen(key).await?) }).await
    }
}
