//! Redis-backed implementations of [`CacheStore`] and [`StorageStore`].
//!
//! Every multi-key mutation goes through a `redis::pipe()`, matching the
//! original's use of `Redis.pipeline()` in `ipasnhistory/lookup.py` and
//! `ipasnhistory/query.py` (spec §5: "every multi-key update is batched
//! through a pipeline"). No `MULTI`/`EXEC` transaction is used — every
//! operation here is commutative or idempotent on disjoint keys, the same
//! assumption the original relies on.

use super::{CacheStore, ResponseHash, StorageStore};
use crate::error::{IpasnError, Result};
use crate::key::{RUNNING_KEY, SHUTDOWN_KEY};
use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::AsyncCommands;
use std::collections::HashMap;

fn cache_err(e: redis::RedisError) -> IpasnError {
    IpasnError::Cache(e.to_string())
}

fn storage_err(e: redis::RedisError) -> IpasnError {
    IpasnError::Storage(e.to_string())
}

#[derive(Clone)]
pub struct RedisCacheStore {
    conn: ConnectionManager,
}

impl RedisCacheStore {
    pub async fn connect(url: &str) -> Result<Self> {
        let client = redis::Client::open(url).map_err(cache_err)?;
        let conn = client.get_connection_manager().await.map_err(cache_err)?;
        Ok(Self { conn })
    }
}

#[async_trait]
impl CacheStore for RedisCacheStore {
    async fn sadd(&self, key: &str, members: &[String]) -> Result<()> {
        if members.is_empty() {
            return Ok(());
        }
        let mut conn = self.conn.clone();
        conn.sadd::<_, _, ()>(key, members).await.map_err(cache_err)
    }

    async fn srem(&self, key: &str, members: &[String]) -> Result<()> {
        if members.is_empty() {
            return Ok(());
        }
        let mut conn = self.conn.clone();
        conn.srem::<_, _, ()>(key, members).await.map_err(cache_err)
    }

    async fn smembers(&self, key: &str) -> Result<Vec<String>> {
        let mut conn = self.conn.clone();
        conn.smembers(key).await.map_err(cache_err)
    }

    async fn srandmember(&self, key: &str, count: usize) -> Result<Vec<String>> {
        let mut conn = self.conn.clone();
        conn.srandmember_multiple(key, count).await.map_err(cache_err)
    }

    async fn hset(&self, key: &str, fields: &ResponseHash) -> Result<()> {
        let mut conn = self.conn.clone();
        let pairs: Vec<(String, String)> = fields
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();
        conn.hset_multiple::<_, _, _, ()>(key, &pairs)
            .await
            .map_err(cache_err)
    }

    async fn hgetall(&self, key: &str) -> Result<ResponseHash> {
        let mut conn = self.conn.clone();
        conn.hgetall(key).await.map_err(cache_err)
    }

    async fn hset_meta(&self, key: &str, fields: &[(String, String)]) -> Result<()> {
        let mut conn = self.conn.clone();
        conn.hset_multiple::<_, _, _, ()>(key, fields)
            .await
            .map_err(cache_err)
    }

    async fn expire(&self, key: &str, ttl_secs: u64) -> Result<()> {
        let mut conn = self.conn.clone();
        conn.expire::<_, ()>(key, ttl_secs as i64)
            .await
            .map_err(cache_err)
    }

    async fn set_running(&self, name: &str) -> Result<()> {
        let mut conn = self.conn.clone();
        conn.hset::<_, _, _, ()>(RUNNING_KEY, name, "1")
            .await
            .map_err(cache_err)
    }

    async fn unset_running(&self, name: &str) -> Result<()> {
        let mut conn = self.conn.clone();
        conn.hdel::<_, _, ()>(RUNNING_KEY, name)
            .await
            .map_err(cache_err)
    }

    async fn is_running(&self) -> Result<HashMap<String, String>> {
        let mut conn = self.conn.clone();
        conn.hgetall(RUNNING_KEY).await.map_err(cache_err)
    }

    async fn is_shutdown_requested(&self) -> Result<bool> {
        let mut conn = self.conn.clone();
        conn.exists(SHUTDOWN_KEY).await.map_err(cache_err)
    }
}

#[derive(Clone)]
pub struct RedisStorageStore {
    conn: ConnectionManager,
}

impl RedisStorageStore {
    pub async fn connect(url: &str) -> Result<Self> {
        let client = redis::Client::open(url).map_err(storage_err)?;
        let conn = client.get_connection_manager().await.map_err(storage_err)?;
        Ok(Self { conn })
    }
}

#[async_trait]
impl StorageStore for RedisStorageStore {
    async fn smembers(&self, key: &str) -> Result<Vec<String>> {
        let mut conn = self.conn.clone();
        conn.smembers(key).await.map_err(storage_err)
    }

    async fn smembers_pipeline(&self, keys: &[String]) -> Result<Vec<Vec<String>>> {
        if keys.is_empty() {
            return Ok(Vec::new());
        }
        let mut conn = self.conn.clone();
        let mut pipe = redis::pipe();
        for key in keys {
            pipe.smembers(key);
        }
        pipe.query_async(&mut conn).await.map_err(storage_err)
    }

    async fn get_ipcount(&self, key: &str) -> Result<Option<u64>> {
        let mut conn = self.conn.clone();
        conn.get(key).await.map_err(storage_err)
    }
}
