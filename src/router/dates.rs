//! Date resolution (spec §4.4 "find_dates") with 10-minute in-process
//! memoization of the cached-dates index, ported from
//! `ipasnhistory/query.py::_find_dates` / `nearest_date` / `find_interval`.

use crate::error::{IpasnError, Result};
use crate::key::{cached_dates_key, AddressFamily};
use crate::store::CacheStore;
use chrono::{Duration as ChronoDuration, NaiveDateTime, TimeZone, Utc};
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

/// How long the cached-dates index is trusted in-process before re-reading
/// the cache store (spec §4.4 "memoized in-process for 10 minutes").
const MEMO_TTL: Duration = Duration::from_secs(600);

const ISO_FMT: &str = "%Y-%m-%dT%H:%M:%S";

pub struct DateResolver<C: CacheStore> {
    cache: Arc<C>,
    memo: RwLock<HashMap<(String, AddressFamily), (Instant, Vec<String>)>>,
}

impl<C: CacheStore> DateResolver<C> {
    pub fn new(cache: Arc<C>) -> Self {
        DateResolver {
            cache,
            memo: RwLock::new(HashMap::new()),
        }
    }

    async fn cached_dates(&self, source: &str, family: AddressFamily) -> Result<Vec<String>> {
        let memo_key = (source.to_string(), family);
        {
            let memo = self.memo.read();
            if let Some((fetched_at, dates)) = memo.get(&memo_key) {
                if fetched_at.elapsed() < MEMO_TTL {
                    return Ok(dates.clone());
                }
            }
        }
        let dates = self
            .cache
            .smembers(&cached_dates_key(source, family))
            .await
            .map_err(|e| IpasnError::Cache(e.to_string()))?;
        self.memo
            .write()
            .insert(memo_key, (Instant::now(), dates.clone()));
        Ok(dates)
    }

    /// `_find_dates` (spec §4.4). Resolves a point `date`, an interval
    /// `[first, last]`, or (if neither is given) "latest" — nearest to now.
    pub async fn find_dates(
        &self,
        source: &str,
        family: AddressFamily,
        date: Option<&str>,
        first: Option<&str>,
        last: Option<&str>,
        precision_delta: Option<ChronoDuration>,
    ) -> Result<Vec<String>> {
        let cached = self.cached_dates(source, family).await?;
        if cached.is_empty() {
            return Err(IpasnError::NoRouteViews {
                source: source.to_string(),
                family: family.to_string(),
            });
        }

        if let Some(d) = date {
            Ok(vec![self.nearest_date(&cached, source, d, precision_delta)?])
        } else if let Some(f) = first {
            self.find_interval(&cached, source, f, last)
        } else {
            let now = Utc::now().naive_utc().format(ISO_FMT).to_string();
            Ok(vec![self.nearest_date(&cached, source, &now, precision_delta)?])
        }
    }

    /// `nearest_date` (spec §4.4, Testable Property 4 & 6).
    fn nearest_date(
        &self,
        cached: &[String],
        source: &str,
        date: &str,
        precision_delta: Option<ChronoDuration>,
    ) -> Result<String> {
        let target = parse_to_utc_naive(date)?;

        let nearest = cached
            .iter()
            .filter_map(|d| parse_to_utc_naive(d).ok().map(|parsed| (d, parsed)))
            .min_by_key(|(_, parsed)| (*parsed - target).num_seconds().abs())
            .map(|(d, _)| d.clone())
            .ok_or_else(|| IpasnError::NoRouteViews {
                source: source.to_string(),
                family: "".to_string(),
            })?;

        if let Some(delta) = precision_delta {
            let nearest_parsed = parse_to_utc_naive(&nearest)?;
            let min = target - delta;
            let max = target + delta;
            if nearest_parsed < min || nearest_parsed > max {
                return Err(IpasnError::OutsidePrecision {
                    source: source.to_string(),
                    min: min.format(ISO_FMT).to_string(),
                    max: max.format(ISO_FMT).to_string(),
                });
            }
        }

        Ok(nearest)
    }

    /// `find_interval` (spec §4.4).
    fn find_interval(
        &self,
        cached: &[String],
        source: &str,
        first: &str,
        last: Option<&str>,
    ) -> Result<Vec<String>> {
        let last_owned;
        let last = match last {
            Some(l) => l,
            None => {
                last_owned = Utc::now().naive_utc().format(ISO_FMT).to_string();
                &last_owned
            }
        };

        if first > last {
            return Err(IpasnError::IntervalOrder {
                first: first.to_string(),
                last: last.to_string(),
            });
        }

        let near_first = self.nearest_date(cached, source, first, None)?;
        let near_last = self.nearest_date(cached, source, last, None)?;

        if near_first.as_str() <= last && near_last.as_str() >= first {
            let mut within: Vec<String> = cached
                .iter()
                .filter(|d| first <= d.as_str() && d.as_str() <= last)
                .cloned()
                .collect();
            within.sort();
            Ok(within)
        } else {
            Err(IpasnError::EmptyInterval {
                first: first.to_string(),
                last: last.to_string(),
                near_first,
                near_last,
            })
        }
    }
}

/// Parses an ISO-ish date/datetime string and converts any timezone-aware
/// input to UTC naive before comparison (spec §4.4 "Timezones").
pub fn parse_to_utc_naive(s: &str) -> Result<NaiveDateTime> {
    if let Ok(dt) = chrono::DateTime::parse_from_rfc3339(s) {
        return Ok(dt.with_timezone(&Utc).naive_utc());
    }
    if let Ok(dt) = NaiveDateTime::parse_from_str(s, ISO_FMT) {
        return Ok(Utc.from_utc_datetime(&dt).naive_utc());
    }
    if let Ok(date) = chrono::NaiveDate::parse_from_str(s, "%Y-%m-%d") {
        return Ok(date.and_hms_opt(0, 0, 0).expect("midnight is always valid"));
    }
    Err(IpasnError::InvalidDate(s.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;

    async fn resolver_with_dates(dates: &[&str]) -> DateResolver<MemoryStore> {
        let cache = Arc::new(MemoryStore::new());
        CacheStore::sadd(
            cache.as_ref(),
            &cached_dates_key("caida", AddressFamily::V4),
            &dates.iter().map(|d| d.to_string()).collect::<Vec<_>>(),
        )
        .await
        .unwrap();
        DateResolver::new(cache)
    }

    #[tokio::test]
    async fn nearest_date_picks_closest() {
        let resolver =
            resolver_with_dates(&["2023-06-10T00:00:00", "2023-06-12T00:00:00"]).await;
        let dates = resolver
            .find_dates(
                "caida",
                AddressFamily::V4,
                Some("2023-06-11T12:00:00"),
                None,
                None,
                None,
            )
            .await
            .unwrap();
        assert_eq!(dates, vec!["2023-06-12T00:00:00"]);
    }

    #[tokio::test]
    async fn precision_delta_rejects_far_dates() {
        let resolver = resolver_with_dates(&["2023-06-12T00:00:00"]).await;
        let err = resolver
            .find_dates(
                "caida",
                AddressFamily::V4,
                Some("2020-01-01T00:00:00"),
                None,
                None,
                Some(ChronoDuration::days(1)),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, IpasnError::OutsidePrecision { .. }));
    }

    #[tokio::test]
    async fn interval_returns_sorted_dates() {
        let resolver = resolver_with_dates(&[
            "2023-06-10T00:00:00",
            "2023-06-11T00:00:00",
            "2023-06-12T00:00:00",
        ])
        .await;
        let dates = resolver
            .find_dates(
                "caida",
                AddressFamily::V4,
                None,
                Some("2023-06-10T00:00:00"),
                Some("2023-06-12T00:00:00"),
                None,
            )
            .await
            .unwrap();
        assert_eq!(
            dates,
            vec![
                "2023-06-10T00:00:00",
                "2023-06-11T00:00:00",
                "2023-06-12T00:00:00"
            ]
        );
    }

    #[tokio::test]
    async fn no_cached_dates_fails() {
        let cache = Arc::new(MemoryStore::new());
        let resolver = DateResolver::new(cache);
        let err = resolver
            .find_dates("caida", AddressFamily::V4, None, None, None, None)
            .await
            .unwrap_err();
        assert!(matches!(err, IpasnError::NoRouteViews { .. }));
    }

    #[tokio::test]
    async fn interval_with_first_after_last_fails() {
        let resolver = resolver_with_dates(&["2023-06-12T00:00:00"]).await;
        let err = resolver
            .find_dates(
                "caida",
                AddressFamily::V4,
                None,
                Some("2023-06-20T00:00:00"),
                Some("2023-06-10T00:00:00"),
                None,
            )
            .await
            .unwrap_err();
        assert!(matches!(err, IpasnError::IntervalOrder { .. }));
    }
}
