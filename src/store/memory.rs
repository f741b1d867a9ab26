//! Deterministic in-memory [`CacheStore`] + [`StorageStore`] fake used by
//! the integration tests in `tests/` so the end-to-end scenarios of spec
//! §8 run without a live Redis.

use super::{CacheStore, ResponseHash, StorageStore};
use crate::error::Result;
use crate::key::{RUNNING_KEY, SHUTDOWN_KEY};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};

#[derive(Default)]
struct Inner {
    sets: HashMap<String, HashSet<String>>,
    hashes: HashMap<String, ResponseHash>,
}

#[derive(Default)]
pub struct MemoryStore {
    inner: Mutex<Inner>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl CacheStore for MemoryStore {
    async fn sadd(&self, key: &str, members: &[String]) -> Result<()> {
        let mut inner = self.inner.lock();
        inner
            .sets
            .entry(key.to_string())
            .or_default()
            .extend(members.iter().cloned());
        Ok(())
    }

    async fn srem(&self, key: &str, members: &[String]) -> Result<()> {
        let mut inner = self.inner.lock();
        if let Some(set) = inner.sets.get_mut(key) {
            for m in members {
                set.remove(m);
            }
        }
        Ok(())
    }

    async fn smembers(&self, key: &str) -> Result<Vec<String>> {
        let inner = self.inner.lock();
        Ok(inner
            .sets
            .get(key)
            .map(|s| s.iter().cloned().collect())
            .unwrap_or_default())
    }

    async fn srandmember(&self, key: &str, count: usize) -> Result<Vec<String>> {
        let inner = self.inner.lock();
        Ok(inner
            .sets
            .get(key)
            .map(|s| s.iter().take(count).cloned().collect())
            .unwrap_or_default())
    }

    async fn hset(&self, key: &str, fields: &ResponseHash) -> Result<()> {
        let mut inner = self.inner.lock();
        inner
            .hashes
            .entry(key.to_string())
            .or_default()
            .extend(fields.clone());
        Ok(())
    }

    async fn hgetall(&self, key: &str) -> Result<ResponseHash> {
        let inner = self.inner.lock();
        Ok(inner.hashes.get(key).cloned().unwrap_or_default())
    }

    async fn hset_meta(&self, key: &str, fields: &[(String, String)]) -> Result<()> {
        let mut inner = self.inner.lock();
        let entry = inner.hashes.entry(key.to_string()).or_default();
        for (k, v) in fields {
            entry.insert(k.clone(), v.clone());
        }
        Ok(())
    }

    async fn expire(&self, _key: &str, _ttl_secs: u64) -> Result<()> {
        // TTL is not modeled in the fake — tests only assert on presence.
        Ok(())
    }

    async fn set_running(&self, name: &str) -> Result<()> {
        let mut inner = self.inner.lock();
        inner
            .hashes
            .entry(RUNNING_KEY.to_string())
            .or_default()
            .insert(name.to_string(), "1".to_string());
        Ok(())
    }

    async fn unset_running(&self, name: &str) -> Result<()> {
        let mut inner = self.inner.lock();
        if let Some(h) = inner.hashes.get_mut(RUNNING_KEY) {
            h.remove(name);
        }
        Ok(())
    }

    async fn is_running(&self) -> Result<HashMap<String, String>> {
        let inner = self.inner.lock();
        Ok(inner.hashes.get(RUNNING_KEY).cloned().unwrap_or_default())
    }

    async fn is_shutdown_requested(&self) -> Result<bool> {
        let inner = self.inner.lock();
        Ok(inner.sets.contains_key(SHUTDOWN_KEY))
    }
}

/// `MemoryStore` doubles as the `StorageStore` fake too — the production
/// system talks to two distinct Redis instances, but the key namespaces
/// never collide (spec §4.5), so one shared table is sufficient for tests.
#[async_trait]
impl StorageStore for MemoryStore {
    async fn smembers(&self, key: &str) -> Result<Vec<String>> {
        CacheStore::smembers(self, key).await
    }

    async fn smembers_pipeline(&self, keys: &[String]) -> Result<Vec<Vec<String>>> {
        let mut out = Vec::with_capacity(keys.len());
        for key in keys {
            out.push(CacheStore::smembers(self, key).await?);
        }
        Ok(out)
    }

    async fn get_ipcount(&self, key: &str) -> Result<Option<u64>> {
        let inner = self.inner.lock();
        Ok(inner
            .hashes
            .get("__ipcount__")
            .and_then(|h| h.get(key))
            .and_then(|v| v.parse().ok()))
    }
}

impl MemoryStore {
    /// Test helper: seed a snapshot's ASN/prefix/ipcount data directly.
    pub async fn seed_prefixes(
        &self,
        source: &str,
        family: crate::key::AddressFamily,
        date: &str,
        asn: &str,
        prefixes: &[&str],
        ipcount: u64,
    ) {
        let dates_key = crate::key::storage_dates_key(source, family);
        let asns_key = crate::key::storage_asns_key(source, family, date);
        let prefixes_key = crate::key::storage_prefixes_key(source, family, date, asn);
        let ipcount_key = crate::key::storage_ipcount_key(source, family, date, asn);

        CacheStore::sadd(self, &dates_key, &[date.to_string()])
            .await
            .unwrap();
        CacheStore::sadd(self, &asns_key, &[asn.to_string()])
            .await
            .unwrap();
        CacheStore::sadd(
            self,
            &prefixes_key,
            &prefixes.iter().map(|p| p.to_string()).collect::<Vec<_>>(),
        )
        .await
        .unwrap();

        let mut inner = self.inner.lock();
        inner
            .hashes
            .entry("__ipcount__".to_string())
            .or_default()
            .insert(ipcount_key, ipcount.to_string());
    }
}
