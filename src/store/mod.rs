//! The two store interfaces (spec §9 "Dual cache/storage stores"): a fast
//! ephemeral key-value store (`CacheStore`) and a larger persistent one
//! (`StorageStore`). Both are addressed purely by string keys; no
//! cross-store transactions are required.
//!
//! Production implementations back both with Redis (`redis` crate,
//! `tokio-comp`), matching the original's two `StrictRedis` connections
//! (`ipasnhistory/query.py`: `self.cache` / `self.storagedb`). A
//! deterministic in-memory fake backs the integration tests in `tests/`
//! without requiring a live Redis.

pub mod memory;
pub mod redis_store;

pub use memory::MemoryStore;
pub use redis_store::RedisCacheStore;
pub use redis_store::RedisStorageStore;

use crate::error::Result;
use async_trait::async_trait;
use std::collections::HashMap;

/// A single written/read response hash: `{asn, prefix}` plus whatever else
/// the writer chose to put in it (spec §3 "Response record").
pub type ResponseHash = HashMap<String, String>;

/// TTL applied to every response hash and refreshed whenever it is read or
/// written (spec §3: "TTL = 43200 s (12 h) whenever read or written").
pub const RESPONSE_TTL_SECS: u64 = 43200;

/// The ephemeral cache store: work-set, response hashes, cached-dates index,
/// lock set, META keys, liveness flags.
#[async_trait]
pub trait CacheStore: Send + Sync {
    async fn sadd(&self, key: &str, members: &[String]) -> Result<()>;
    async fn srem(&self, key: &str, members: &[String]) -> Result<()>;
    async fn smembers(&self, key: &str) -> Result<Vec<String>>;
    async fn srandmember(&self, key: &str, count: usize) -> Result<Vec<String>>;

    async fn hset(&self, key: &str, fields: &ResponseHash) -> Result<()>;
    async fn hgetall(&self, key: &str) -> Result<ResponseHash>;
    async fn hset_meta(&self, key: &str, fields: &[(String, String)]) -> Result<()>;

    async fn expire(&self, key: &str, ttl_secs: u64) -> Result<()>;

    async fn set_running(&self, name: &str) -> Result<()>;
    async fn unset_running(&self, name: &str) -> Result<()>;
    async fn is_running(&self) -> Result<HashMap<String, String>>;
    async fn is_shutdown_requested(&self) -> Result<bool>;
}

/// The durable storage store: source/date/ASN prefix tables, loaded once per
/// worker at startup. Read-only for workers — mutated only by external
/// loaders (out of scope; spec §5).
#[async_trait]
pub trait StorageStore: Send + Sync {
    async fn smembers(&self, key: &str) -> Result<Vec<String>>;
    async fn smembers_pipeline(&self, keys: &[String]) -> Result<Vec<Vec<String>>>;
    async fn get_ipcount(&self, key: &str) -> Result<Option<u64>>;
}
