//! The Lookup Worker (spec §4.2).
//!
//! Owns a subset of snapshot tries for one `[first_date, last_date]` window
//! and polls the shared work-set. Construction is cheap; [`LookupWorker::start`]
//! performs the initial, lock-free load, and [`LookupWorker::serve`] runs the
//! steady-state loop until cancelled.

use crate::key::{
    cached_dates_key, is_null_prefix, lock_interval, lock_key, storage_asns_key,
    storage_dates_key, storage_prefixes_key, AddressFamily, QueryKey, WORK_SET_KEY,
};
use crate::store::{CacheStore, ResponseHash, StorageStore, RESPONSE_TTL_SECS};
use crate::trie::Trie;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// How many work items a worker samples per sweep (spec §4.2: "Randomly
/// sample up to 20 work items").
const SAMPLE_SIZE: usize = 20;

/// Pause between sweeps of the steady-state loop when nothing forces
/// faster iteration (kept short so the `shutdown` sentinel is noticed
/// quickly, per the cooperative-cancellation design in spec §5/§9).
const SWEEP_INTERVAL: Duration = Duration::from_millis(200);

pub struct LookupWorker<C: CacheStore, S: StorageStore> {
    source: String,
    first_date: String,
    last_date: String,
    cache: Arc<C>,
    storage: Arc<S>,
    trees: HashMap<AddressFamily, HashMap<String, Trie>>,
}

impl<C: CacheStore, S: StorageStore> LookupWorker<C, S> {
    pub fn new(
        source: impl Into<String>,
        first_date: impl Into<String>,
        last_date: impl Into<String>,
        cache: Arc<C>,
        storage: Arc<S>,
    ) -> Self {
        LookupWorker {
            source: source.into(),
            first_date: first_date.into(),
            last_date: last_date.into(),
            cache,
            storage,
            trees: HashMap::new(),
        }
    }

    pub fn source(&self) -> &str {
        &self.source
    }

    pub fn first_date(&self) -> &str {
        &self.first_date
    }

    pub fn last_date(&self) -> &str {
        &self.last_date
    }

    fn loaded(&self, family: AddressFamily, date: &str) -> bool {
        self.trees
            .get(&family)
            .map(|m| m.contains_key(date))
            .unwrap_or(false)
    }

    fn in_window(&self, date: &str) -> bool {
        self.first_date.as_str() <= date && date <= self.last_date.as_str()
    }

    /// Startup load (spec §4.2: "ignores locks, loads as fast as
    /// possible").
    pub async fn start(&mut self) -> anyhow::Result<()> {
        self.reload_if_stale(true).await
    }

    /// `load_tree(d, family)` (spec §4.2).
    async fn load_tree(&mut self, family: AddressFamily, date: &str) -> anyhow::Result<()> {
        debug!(source = %self.source, %family, %date, "loading snapshot");
        let asns = self
            .storage
            .smembers(&storage_asns_key(&self.source, family, date))
            .await?;

        let prefix_keys: Vec<String> = asns
            .iter()
            .map(|asn| storage_prefixes_key(&self.source, family, date, asn))
            .collect();
        let prefix_lists = self.storage.smembers_pipeline(&prefix_keys).await?;

        let mut trie = match family {
            AddressFamily::V4 => Trie::new_v4(),
            AddressFamily::V6 => Trie::new_v6(),
        };

        for (asn, prefixes) in asns.iter().zip(prefix_lists) {
            for prefix in prefixes {
                if let Err(e) = trie.insert(&prefix, asn) {
                    warn!(source = %self.source, %family, %date, prefix = %prefix, error = %e, "dropping malformed prefix at load time");
                }
            }
        }

        self.trees
            .entry(family)
            .or_default()
            .insert(date.to_string(), trie);

        self.cache
            .sadd(&cached_dates_key(&self.source, family), &[date.to_string()])
            .await?;
        debug!(source = %self.source, %family, %date, "snapshot loaded");
        Ok(())
    }

    /// `reload_if_stale(ignore_lock)` (spec §4.2).
    pub async fn reload_if_stale(&mut self, ignore_lock: bool) -> anyhow::Result<()> {
        for family in [AddressFamily::V4, AddressFamily::V6] {
            let lock_k = lock_key(&self.source, family);

            if !ignore_lock {
                let held = self.cache.smembers(&lock_k).await?;
                let interval = lock_interval(&self.first_date, &self.last_date);
                let overlapping = held.iter().any(|i| intervals_overlap(i, &interval));
                if overlapping {
                    continue;
                }
            }

            let available = self
                .storage
                .smembers(&storage_dates_key(&self.source, family))
                .await?;
            let missing: Vec<String> = available
                .into_iter()
                .filter(|d| self.in_window(d))
                .filter(|d| !self.loaded(family, d))
                .collect();

            if missing.is_empty() {
                continue;
            }

            let interval = lock_interval(&self.first_date, &self.last_date);
            if !ignore_lock {
                self.cache.sadd(&lock_k, &[interval.clone()]).await?;
            }

            for date in &missing {
                self.load_tree(family, date).await?;
            }

            if !ignore_lock {
                self.cache.srem(&lock_k, &[interval]).await?;
            }
        }
        Ok(())
    }

    /// Steady-state loop (spec §4.2 "serve"). Runs until `cancel` fires,
    /// finishing the current sweep before exiting.
    pub async fn serve(&mut self, cancel: CancellationToken) -> anyhow::Result<()> {
        self.cache.set_running(&format!("worker:{}", self.source)).await?;
        loop {
            if cancel.is_cancelled() || self.cache.is_shutdown_requested().await.unwrap_or(false) {
                break;
            }

            if let Err(e) = self.reload_if_stale(false).await {
                warn!(source = %self.source, error = %e, "reload_if_stale failed");
            }

            if let Err(e) = self.sweep().await {
                warn!(source = %self.source, error = %e, "sweep failed");
            }

            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = tokio::time::sleep(SWEEP_INTERVAL) => {}
            }
        }
        self.cache.unset_running(&format!("worker:{}", self.source)).await?;
        Ok(())
    }

    /// Runs one sweep of the steady-state loop outside of [`LookupWorker::serve`],
    /// for tests that need deterministic control over when a worker picks up
    /// enqueued work instead of waiting on `SWEEP_INTERVAL`.
    pub async fn sweep_for_test(&mut self) -> anyhow::Result<()> {
        self.sweep().await
    }

    async fn sweep(&mut self) -> anyhow::Result<()> {
        let sample = self.cache.srandmember(WORK_SET_KEY, SAMPLE_SIZE).await?;
        let mut to_remove = Vec::new();

        for raw in sample {
            let key = match QueryKey::parse(&raw) {
                Ok(k) => k,
                Err(_) => continue,
            };

            let existing = self.cache.hgetall(&raw).await?;
            if !existing.is_empty() {
                // Another worker already answered this one.
                to_remove.push(raw);
                continue;
            }

            if key.source != self.source {
                continue;
            }
            if !self.loaded(key.family, &key.date) {
                continue;
            }

            let fields = self.answer(&key);
            self.cache.hset(&raw, &fields).await?;
            self.cache.expire(&raw, RESPONSE_TTL_SECS).await?;
            to_remove.push(raw);
        }

        if !to_remove.is_empty() {
            self.cache.srem(WORK_SET_KEY, &to_remove).await?;
        }
        Ok(())
    }

    fn answer(&self, key: &QueryKey) -> ResponseHash {
        let trie = self
            .trees
            .get(&key.family)
            .and_then(|m| m.get(&key.date))
            .expect("checked loaded() before calling answer()");

        let mut fields = ResponseHash::new();
        match trie.lookup(&key.ip) {
            Ok(Some(hit)) => {
                if is_null_prefix(&hit.prefix) {
                    // Normalize: an enclosing 0.0.0.0/0 or ::/0 with a
                    // non-zero ASN should not happen on well-formed data
                    // (spec §9 Open Question); force asn to 0 regardless.
                    fields.insert("asn".to_string(), "0".to_string());
                    fields.insert("prefix".to_string(), key.family.null_route().to_string());
                } else {
                    fields.insert("asn".to_string(), hit.asn);
                    fields.insert("prefix".to_string(), hit.prefix);
                }
            }
            Ok(None) => {
                fields.insert("asn".to_string(), "0".to_string());
                fields.insert("prefix".to_string(), key.family.null_route().to_string());
            }
            Err(e) => {
                fields.insert("error".to_string(), format!("Query invalid: {e}"));
            }
        }
        fields
    }
}

/// Two `"first_last"` intervals overlap iff neither is entirely before the
/// other.
fn intervals_overlap(a: &str, b: &str) -> bool {
    let (Some((a_first, a_last)), Some((b_first, b_last))) = (split_interval(a), split_interval(b))
    else {
        return false;
    };
    a_first <= b_last && b_first <= a_last
}

fn split_interval(s: &str) -> Option<(&str, &str)> {
    s.split_once('_')
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;

    #[tokio::test]
    async fn loads_and_answers_hit() {
        let cache = Arc::new(MemoryStore::new());
        let storage = Arc::new(MemoryStore::new());
        storage
            .seed_prefixes(
                "caida",
                AddressFamily::V4,
                "2023-06-12T00:00:00",
                "15169",
                &["8.8.8.0/24"],
                256,
            )
            .await;

        let mut worker = LookupWorker::new(
            "caida",
            "2023-06-01T00:00:00",
            "2023-06-30T00:00:00",
            cache.clone(),
            storage,
        );
        worker.start().await.unwrap();

        let key = QueryKey::new(
            "caida",
            AddressFamily::V4,
            "2023-06-12T00:00:00",
            "8.8.8.8",
        );
        CacheStore::sadd(cache.as_ref(), WORK_SET_KEY, &[key.format()])
            .await
            .unwrap();

        worker.sweep().await.unwrap();

        let response = CacheStore::hgetall(cache.as_ref(), &key.format())
            .await
            .unwrap();
        assert_eq!(response.get("asn").unwrap(), "15169");
        assert_eq!(response.get("prefix").unwrap(), "8.8.8.0/24");

        let remaining = CacheStore::smembers(cache.as_ref(), WORK_SET_KEY)
            .await
            .unwrap();
        assert!(remaining.is_empty());
    }

    #[tokio::test]
    async fn miss_is_normalized_to_null_route() {
        let cache = Arc::new(MemoryStore::new());
        let storage = Arc::new(MemoryStore::new());
        storage
            .seed_prefixes(
                "caida",
                AddressFamily::V4,
                "2023-06-12T00:00:00",
                "15169",
                &["8.8.8.0/24"],
                256,
            )
            .await;

        let mut worker = LookupWorker::new(
            "caida",
            "2023-06-01T00:00:00",
            "2023-06-30T00:00:00",
            cache.clone(),
            storage,
        );
        worker.start().await.unwrap();

        let key = QueryKey::new(
            "caida",
            AddressFamily::V4,
            "2023-06-12T00:00:00",
            "192.0.2.1",
        );
        CacheStore::sadd(cache.as_ref(), WORK_SET_KEY, &[key.format()])
            .await
            .unwrap();
        worker.sweep().await.unwrap();

        let response = CacheStore::hgetall(cache.as_ref(), &key.format())
            .await
            .unwrap();
        assert_eq!(response.get("asn").unwrap(), "0");
        assert_eq!(response.get("prefix").unwrap(), "0.0.0.0/0");
    }

    #[tokio::test]
    async fn ignores_work_for_another_source() {
        let cache = Arc::new(MemoryStore::new());
        let storage = Arc::new(MemoryStore::new());
        storage
            .seed_prefixes(
                "caida",
                AddressFamily::V4,
                "2023-06-12T00:00:00",
                "15169",
                &["8.8.8.0/24"],
                256,
            )
            .await;
        let mut worker = LookupWorker::new(
            "caida",
            "2023-06-01T00:00:00",
            "2023-06-30T00:00:00",
            cache.clone(),
            storage,
        );
        worker.start().await.unwrap();

        let key = QueryKey::new(
            "ripe_rrc00",
            AddressFamily::V4,
            "2023-06-12T00:00:00",
            "8.8.8.8",
        );
        CacheStore::sadd(cache.as_ref(), WORK_SET_KEY, &[key.format()])
            .await
            .unwrap();
        worker.sweep().await.unwrap();

        // Not ours: left untouched for another worker to pick up.
        let remaining = CacheStore::smembers(cache.as_ref(), WORK_SET_KEY)
            .await
            .unwrap();
        assert_eq!(remaining.len(), 1);
    }

    #[test]
    fn overlapping_intervals_detected() {
        assert!(intervals_overlap("2023-06-01_2023-06-30", "2023-06-15_2023-07-15"));
        assert!(!intervals_overlap("2023-06-01_2023-06-10", "2023-06-15_2023-07-15"));
    }
}
