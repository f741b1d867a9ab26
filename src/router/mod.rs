//! The Query Router (spec §4.4): resolves dates, fans a query out into one
//! key per covering source, enqueues misses, and collates the best answer.
//! Grounded in `ipasnhistory/query.py`'s `Query` class.

pub mod dates;

use crate::error::{IpasnError, Result};
use crate::key::{is_null_asn, is_null_prefix, AddressFamily, QueryKey, WORK_SET_KEY};
use crate::store::{CacheStore, ResponseHash, StorageStore, RESPONSE_TTL_SECS};
use chrono::{Duration as ChronoDuration, NaiveDateTime};
use dates::DateResolver;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

/// Caller-supplied resolution criteria for a single IP: either a point date,
/// an interval, or neither (meaning "closest to now"). At most one of
/// `date` / `first` may be set — callers build this from query-string or
/// JSON-body parameters (spec §6).
#[derive(Debug, Clone, Default)]
pub struct DateSelector {
    pub date: Option<String>,
    pub first: Option<String>,
    pub last: Option<String>,
    pub precision_delta: Option<ChronoDuration>,
}

pub struct Router<C: CacheStore, S: StorageStore> {
    cache: Arc<C>,
    storage: Arc<S>,
    dates: DateResolver<C>,
}

impl<C: CacheStore, S: StorageStore> Router<C, S> {
    pub fn new(cache: Arc<C>, storage: Arc<S>) -> Self {
        let dates = DateResolver::new(cache.clone());
        Router {
            cache,
            storage,
            dates,
        }
    }

    /// `_keys_for_query` (spec §4.4 "Key fan-out"): one [`QueryKey`] per
    /// `(source, resolved date)` pair, skipping sources with no data in the
    /// requested window rather than failing the whole query.
    pub async fn keys_for_query(
        &self,
        sources: &[String],
        ip: &str,
        selector: &DateSelector,
    ) -> Result<Vec<QueryKey>> {
        let family = AddressFamily::infer(ip);
        let mut keys = Vec::new();
        let mut last_err = None;

        for source in sources {
            match self
                .dates
                .find_dates(
                    source,
                    family,
                    selector.date.as_deref(),
                    selector.first.as_deref(),
                    selector.last.as_deref(),
                    selector.precision_delta,
                )
                .await
            {
                Ok(resolved) => {
                    for date in resolved {
                        keys.push(QueryKey::new(source.clone(), family, date, ip.to_string()));
                    }
                }
                Err(e) => last_err = Some(e),
            }
        }

        if keys.is_empty() {
            return Err(last_err.unwrap_or_else(|| {
                IpasnError::NoRouteViews {
                    source: sources.join(","),
                    family: family.to_string(),
                }
            }));
        }
        Ok(keys)
    }

    /// Enqueues every key for worker pickup without waiting for an answer
    /// (`mass_cache`, spec §4.4/§6).
    pub async fn mass_cache(&self, keys: &[QueryKey]) -> Result<()> {
        let members: Vec<String> = keys.iter().map(|k| k.format()).collect();
        self.cache.sadd(WORK_SET_KEY, &members).await
    }

    /// Returns whatever's already cached for each key, keyed by its full
    /// `source|family|date|ip` name (spec §4.5), and enqueues the misses
    /// without blocking for an answer (`mass_query`, spec §4.4/§6).
    pub async fn mass_query(&self, keys: &[QueryKey]) -> Result<HashMap<String, ResponseHash>> {
        let mut out = HashMap::with_capacity(keys.len());
        let mut misses = Vec::new();

        for key in keys {
            let name = key.format();
            let hash = self.cache.hgetall(&name).await?;
            if hash.is_empty() {
                misses.push(name.clone());
            } else {
                self.cache.expire(&name, RESPONSE_TTL_SECS).await?;
            }
            out.insert(name, hash);
        }

        if !misses.is_empty() {
            self.cache.sadd(WORK_SET_KEY, &misses).await?;
        }
        Ok(out)
    }

    /// Per-date collation of a `mass_query` result for a single IP, the same
    /// dominance rule `query` uses but without waiting for misses (spec
    /// §4.4 "mass_query... Collate with the same best-answer rule").
    pub fn collate_mass_query(
        &self,
        keys: &[QueryKey],
        answered: &HashMap<String, ResponseHash>,
    ) -> Vec<(String, ResponseHash)> {
        let mut per_date: HashMap<&str, Vec<(&str, ResponseHash)>> = HashMap::new();
        for key in keys {
            let hash = answered.get(&key.format()).cloned().unwrap_or_default();
            per_date
                .entry(key.date.as_str())
                .or_default()
                .push((key.source.as_str(), hash));
        }
        let mut collated: Vec<(String, ResponseHash)> = per_date
            .into_iter()
            .map(|(date, answers)| (date.to_string(), best_answer_with_source(answers)))
            .collect();
        collated.sort_by(|a, b| b.0.cmp(&a.0));
        collated
    }

    /// Blocking query (`query`, spec §4.4): enqueues any misses, then polls
    /// every 100 ms until every key has an answer or `timeout` elapses,
    /// collating the best answer **per date** across every source that
    /// resolved to it (spec §4.4 step 4, Testable Property 5), sorted by
    /// date descending (Scenario 3). `is_point` selects step 5's filtering
    /// rule: a point query with at least one valid answer returns only the
    /// valid ones; an interval query (or a point query with no valid
    /// answer anywhere) returns everything, sentinels included.
    pub async fn query(
        &self,
        keys: &[QueryKey],
        timeout: Duration,
        is_point: bool,
    ) -> Result<Vec<(String, ResponseHash)>> {
        let names: Vec<String> = keys.iter().map(|k| k.format()).collect();
        let deadline = tokio::time::Instant::now() + timeout;

        loop {
            let mut per_date: HashMap<&str, Vec<(&str, ResponseHash)>> = HashMap::new();
            let mut missing = Vec::new();

            for (key, name) in keys.iter().zip(&names) {
                let hash = self.cache.hgetall(name).await?;
                if hash.is_empty() {
                    missing.push(name.clone());
                } else {
                    self.cache.expire(name, RESPONSE_TTL_SECS).await?;
                }
                per_date
                    .entry(key.date.as_str())
                    .or_default()
                    .push((key.source.as_str(), hash));
            }

            if missing.is_empty() || tokio::time::Instant::now() >= deadline {
                if !missing.is_empty() {
                    self.cache.sadd(WORK_SET_KEY, &missing).await?;
                }

                let mut collated: Vec<(String, ResponseHash)> = per_date
                    .into_iter()
                    .map(|(date, answers)| (date.to_string(), best_answer_with_source(answers)))
                    .collect();
                collated.sort_by(|a, b| b.0.cmp(&a.0));

                if is_point {
                    let any_valid = collated.iter().any(|(_, h)| is_valid_answer(h));
                    if any_valid {
                        collated.retain(|(_, h)| is_valid_answer(h));
                    }
                }
                return Ok(collated);
            }

            self.cache.sadd(WORK_SET_KEY, &missing).await?;
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
    }

    /// `meta` (spec §4.4/§6): per-(source, family) expected interval and
    /// cached-dates completeness (Testable Property 7: `percent = 100 *
    /// (|expected| - |missing|) / |expected|`, where `expected` is one
    /// calendar day per day in `[first, last]` and `missing` is that set
    /// minus whatever's actually in the cached-dates index).
    pub async fn meta(&self, sources: &[String]) -> Result<MetaReport> {
        use crate::key::{cached_dates_key, META_EXPECTED_INTERVAL_KEY};

        let expected = self.cache.hgetall(META_EXPECTED_INTERVAL_KEY).await?;
        let first = expected.get("first").cloned();
        let last = expected.get("last").cloned();

        let expected_days: Vec<String> = match (&first, &last) {
            (Some(f), Some(l)) => {
                let f = dates::parse_to_utc_naive(f)?;
                let l = dates::parse_to_utc_naive(l)?;
                calendar_days(&f, &l)
            }
            _ => Vec::new(),
        };

        let mut cached_dates = HashMap::with_capacity(sources.len());
        for source in sources {
            let mut per_family = HashMap::with_capacity(2);
            for family in [AddressFamily::V4, AddressFamily::V6] {
                let mut cached = self.cache.smembers(&cached_dates_key(source, family)).await?;
                cached.sort();
                let cached_set: HashSet<&str> = cached.iter().map(|d| d.as_str()).collect();
                let mut missing: Vec<String> = expected_days
                    .iter()
                    .filter(|d| !cached_set.contains(d.as_str()))
                    .cloned()
                    .collect();
                missing.sort();

                let percent = if expected_days.is_empty() {
                    0.0
                } else {
                    100.0 * (expected_days.len() - missing.len()) as f64 / expected_days.len() as f64
                };

                per_family.insert(
                    family.as_str().to_string(),
                    SourceMeta {
                        cached,
                        missing,
                        percent,
                    },
                );
            }
            cached_dates.insert(source.clone(), per_family);
        }

        Ok(MetaReport {
            expected_first: first,
            expected_last: last,
            cached_dates,
        })
    }

    /// `asn_meta` (spec §4.4/§6): resolves dates exactly like `query` does
    /// (`date`/`first`/`last`/`precision_delta`), then for each resolved
    /// date either reads the one requested ASN's prefixes/address count or,
    /// when `asn` is omitted, enumerates every ASN announced on that date.
    pub async fn asn_meta(
        &self,
        source: &str,
        family: AddressFamily,
        asn: Option<&str>,
        selector: &DateSelector,
    ) -> Result<Vec<(String, HashMap<String, AsnMeta>)>> {
        use crate::key::{storage_asns_key, storage_ipcount_key, storage_prefixes_key};

        let resolved = self
            .dates
            .find_dates(
                source,
                family,
                selector.date.as_deref(),
                selector.first.as_deref(),
                selector.last.as_deref(),
                selector.precision_delta,
            )
            .await?;

        let mut out = Vec::with_capacity(resolved.len());
        for date in resolved {
            let asns: Vec<String> = match asn {
                Some(a) => vec![a.to_string()],
                None => self.storage.smembers(&storage_asns_key(source, family, &date)).await?,
            };

            let mut by_asn = HashMap::with_capacity(asns.len());
            for a in asns {
                let prefixes = self
                    .storage
                    .smembers(&storage_prefixes_key(source, family, &date, &a))
                    .await?;
                let ipcount = self
                    .storage
                    .get_ipcount(&storage_ipcount_key(source, family, &date, &a))
                    .await?;
                by_asn.insert(a, AsnMeta { prefixes, ipcount });
            }
            out.push((date, by_asn));
        }
        out.sort_by(|a, b| b.0.cmp(&a.0));
        Ok(out)
    }
}

/// One entry per calendar day in `[first, last]`, formatted the same way a
/// cached-dates member is (midnight, `ISO_FMT`).
fn calendar_days(first: &NaiveDateTime, last: &NaiveDateTime) -> Vec<String> {
    let mut days = Vec::new();
    let mut cur = first.date();
    let end = last.date();
    while cur <= end {
        days.push(format!("{}T00:00:00", cur.format("%Y-%m-%d")));
        cur += ChronoDuration::days(1);
    }
    days
}

#[derive(Debug, Clone, PartialEq)]
pub struct MetaReport {
    pub expected_first: Option<String>,
    pub expected_last: Option<String>,
    /// `source -> family ("v4"/"v6") -> completeness`.
    pub cached_dates: HashMap<String, HashMap<String, SourceMeta>>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct SourceMeta {
    pub cached: Vec<String>,
    pub missing: Vec<String>,
    pub percent: f64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AsnMeta {
    pub prefixes: Vec<String>,
    pub ipcount: Option<u64>,
}

fn is_valid_answer(hash: &ResponseHash) -> bool {
    let asn_ok = hash.get("asn").map(|a| !is_null_asn(a)).unwrap_or(false);
    let prefix_ok = hash
        .get("prefix")
        .map(|p| !is_null_prefix(p))
        .unwrap_or(false);
    asn_ok && prefix_ok
}

fn prefix_len(hash: &ResponseHash) -> i32 {
    hash.get("prefix")
        .and_then(|p| p.parse::<ipnet::IpNet>().ok())
        .map(|n| n.prefix_len() as i32)
        .unwrap_or(-1)
}

/// Same dominance rule as [`best_answer`], but also stamps the winning
/// hash with the `source` that produced it (spec §6 response shape: each
/// date's entry carries `{asn, prefix, source}`).
fn best_answer_with_source(answers: Vec<(&str, ResponseHash)>) -> ResponseHash {
    let mut best: Option<(&str, ResponseHash)> = None;
    for (source, hash) in answers {
        best = Some(match best {
            None => (source, hash),
            Some((current_source, current)) => {
                let current_valid = is_valid_answer(&current);
                let hash_valid = is_valid_answer(&hash);
                if hash_valid && (!current_valid || prefix_len(&hash) > prefix_len(&current)) {
                    (source, hash)
                } else {
                    (current_source, current)
                }
            }
        });
    }
    match best {
        Some((source, mut hash)) => {
            if !hash.is_empty() {
                hash.insert("source".to_string(), source.to_string());
            }
            hash
        }
        None => ResponseHash::new(),
    }
}

/// Best-answer collation (spec §4.4 "Best answer"): a valid answer beats an
/// invalid/empty one; among valid answers, the more specific (longer)
/// prefix wins.
fn best_answer(hashes: Vec<ResponseHash>) -> ResponseHash {
    let mut best: Option<ResponseHash> = None;
    for hash in hashes {
        best = Some(match best {
            None => hash,
            Some(current) => {
                let current_valid = is_valid_answer(&current);
                let hash_valid = is_valid_answer(&hash);
                if hash_valid && (!current_valid || prefix_len(&hash) > prefix_len(&current)) {
                    hash
                } else {
                    current
                }
            }
        });
    }
    best.unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::key::{AddressFamily, META_EXPECTED_INTERVAL_KEY};
    use crate::store::MemoryStore;

    fn hash(asn: &str, prefix: &str) -> ResponseHash {
        let mut h = HashMap::new();
        h.insert("asn".to_string(), asn.to_string());
        h.insert("prefix".to_string(), prefix.to_string());
        h
    }

    #[test]
    fn best_answer_prefers_valid_over_invalid() {
        let invalid = hash("0", "0.0.0.0/0");
        let valid = hash("15169", "8.8.8.0/24");
        assert_eq!(
            best_answer(vec![invalid.clone(), valid.clone()]),
            valid
        );
        assert_eq!(best_answer(vec![valid.clone(), invalid]), valid);
    }

    #[test]
    fn best_answer_prefers_more_specific_prefix() {
        let broad = hash("15169", "8.0.0.0/8");
        let narrow = hash("15169", "8.8.8.0/24");
        assert_eq!(best_answer(vec![broad, narrow.clone()]), narrow);
    }

    #[tokio::test]
    async fn mass_query_enqueues_misses_and_returns_hits() {
        let cache = Arc::new(MemoryStore::new());
        let storage = Arc::new(MemoryStore::new());
        let router = Router::new(cache.clone(), storage);

        let hit_key = QueryKey::new("caida", AddressFamily::V4, "2023-06-12T00:00:00", "8.8.8.8");
        cache
            .hset(&hit_key.format(), &hash("15169", "8.8.8.0/24"))
            .await
            .unwrap();
        let miss_key = QueryKey::new("caida", AddressFamily::V4, "2023-06-13T00:00:00", "8.8.8.8");

        let result = router
            .mass_query(&[hit_key.clone(), miss_key.clone()])
            .await
            .unwrap();
        assert_eq!(result.get(&hit_key.format()).unwrap().get("asn").unwrap(), "15169");
        assert!(result.get(&miss_key.format()).unwrap().is_empty());

        let queued = cache.smembers(crate::key::WORK_SET_KEY).await.unwrap();
        assert!(queued.contains(&miss_key.format()));
    }

    #[tokio::test]
    async fn query_returns_immediately_when_already_answered() {
        let cache = Arc::new(MemoryStore::new());
        let storage = Arc::new(MemoryStore::new());
        let router = Router::new(cache.clone(), storage);

        let key = QueryKey::new("caida", AddressFamily::V4, "2023-06-12T00:00:00", "8.8.8.8");
        cache
            .hset(&key.format(), &hash("15169", "8.8.8.0/24"))
            .await
            .unwrap();

        let answer = router
            .query(&[key], Duration::from_millis(500), true)
            .await
            .unwrap();
        assert_eq!(answer.len(), 1);
        assert_eq!(answer[0].0, "2023-06-12T00:00:00");
        assert_eq!(answer[0].1.get("asn").unwrap(), "15169");
        assert_eq!(answer[0].1.get("source").unwrap(), "caida");
    }

    #[tokio::test]
    async fn query_collates_per_date_and_sorts_descending() {
        let cache = Arc::new(MemoryStore::new());
        let storage = Arc::new(MemoryStore::new());
        let router = Router::new(cache.clone(), storage);

        let d10 = QueryKey::new("caida", AddressFamily::V4, "2023-06-10T00:00:00", "8.8.8.8");
        let d11 = QueryKey::new("caida", AddressFamily::V4, "2023-06-11T00:00:00", "8.8.8.8");
        let d12_caida = QueryKey::new("caida", AddressFamily::V4, "2023-06-12T00:00:00", "8.8.8.8");
        let d12_ripe = QueryKey::new("ripe", AddressFamily::V4, "2023-06-12T00:00:00", "8.8.8.8");

        cache.hset(&d10.format(), &hash("15169", "8.8.8.0/24")).await.unwrap();
        cache.hset(&d11.format(), &hash("15169", "8.8.8.0/24")).await.unwrap();
        cache.hset(&d12_caida.format(), &hash("3356", "8.0.0.0/9")).await.unwrap();
        cache.hset(&d12_ripe.format(), &hash("15169", "8.8.8.0/24")).await.unwrap();

        let answer = router
            .query(
                &[d10, d11, d12_caida, d12_ripe],
                Duration::from_millis(500),
                false,
            )
            .await
            .unwrap();

        assert_eq!(answer.len(), 3);
        assert_eq!(answer[0].0, "2023-06-12T00:00:00");
        assert_eq!(answer[0].1.get("prefix").unwrap(), "8.8.8.0/24");
        assert_eq!(answer[0].1.get("source").unwrap(), "ripe");
        assert_eq!(answer[1].0, "2023-06-11T00:00:00");
        assert_eq!(answer[2].0, "2023-06-10T00:00:00");
    }

    #[tokio::test]
    async fn meta_reports_completeness() {
        let cache = Arc::new(MemoryStore::new());
        let storage = Arc::new(MemoryStore::new());
        let router = Router::new(cache.clone(), storage);

        cache
            .hset_meta(
                META_EXPECTED_INTERVAL_KEY,
                &[
                    ("first".to_string(), "2023-06-01T00:00:00".to_string()),
                    ("last".to_string(), "2023-06-10T00:00:00".to_string()),
                ],
            )
            .await
            .unwrap();
        cache
            .sadd(
                &crate::key::cached_dates_key("caida", AddressFamily::V4),
                &["2023-06-05T00:00:00".to_string()],
            )
            .await
            .unwrap();

        let report = router.meta(&["caida".to_string()]).await.unwrap();
        let v4 = report.cached_dates.get("caida").unwrap().get("v4").unwrap();
        assert_eq!(v4.cached, vec!["2023-06-05T00:00:00".to_string()]);
        assert_eq!(v4.missing.len(), 9);
        assert!(!v4.missing.contains(&"2023-06-05T00:00:00".to_string()));
        assert!((v4.percent - 10.0).abs() < 1e-9);
    }

    #[tokio::test]
    async fn asn_meta_reads_one_asn_on_a_resolved_date() {
        let cache = Arc::new(MemoryStore::new());
        let storage = Arc::new(MemoryStore::new());
        storage
            .seed_prefixes(
                "caida",
                AddressFamily::V4,
                "2023-06-12T00:00:00",
                "15169",
                &["8.8.8.0/24", "8.8.4.0/24"],
                512,
            )
            .await;
        let router = Router::new(cache, storage);

        let selector = DateSelector {
            date: Some("2023-06-12T00:00:00".to_string()),
            ..Default::default()
        };
        let by_date = router
            .asn_meta("caida", AddressFamily::V4, Some("15169"), &selector)
            .await
            .unwrap();

        assert_eq!(by_date.len(), 1);
        let (date, by_asn) = &by_date[0];
        assert_eq!(date, "2023-06-12T00:00:00");
        let asn_meta = by_asn.get("15169").unwrap();
        assert_eq!(asn_meta.prefixes.len(), 2);
        assert_eq!(asn_meta.ipcount, Some(512));
    }

    #[tokio::test]
    async fn asn_meta_enumerates_all_asns_when_asn_omitted() {
        let cache = Arc::new(MemoryStore::new());
        let storage = Arc::new(MemoryStore::new());
        storage
            .seed_prefixes("caida", AddressFamily::V4, "2023-06-12T00:00:00", "15169", &["8.8.8.0/24"], 256)
            .await;
        storage
            .seed_prefixes("caida", AddressFamily::V4, "2023-06-12T00:00:00", "3356", &["8.0.0.0/9"], 1 << 23)
            .await;
        let router = Router::new(cache, storage);

        let selector = DateSelector {
            date: Some("2023-06-12T00:00:00".to_string()),
            ..Default::default()
        };
        let by_date = router
            .asn_meta("caida", AddressFamily::V4, None, &selector)
            .await
            .unwrap();

        assert_eq!(by_date.len(), 1);
        let (_, by_asn) = &by_date[0];
        assert_eq!(by_asn.len(), 2);
        assert!(by_asn.contains_key("15169"));
        assert!(by_asn.contains_key("3356"));
    }
}
