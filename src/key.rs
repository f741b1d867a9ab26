//! Canonical string-key layout shared by the cache store and the storage store
//! (spec §4.5, §3 "Work item (query key)").
//!
//! A work item / response-hash key is `"{source}|{family}|{date}|{ip}"`. This
//! string is deliberately reused both as the element of the `query` work-set
//! and as the name of the response hash written back under the same key —
//! enqueue and result-publish are idempotent because they share one name.

use crate::error::{IpasnError, Result};
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AddressFamily {
    V4,
    V6,
}

impl serde::Serialize for AddressFamily {
    fn serialize<S>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.serialize_str(self.as_str())
    }
}

impl<'de> serde::Deserialize<'de> for AddressFamily {
    fn deserialize<D>(deserializer: D) -> std::result::Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

impl AddressFamily {
    pub fn as_str(&self) -> &'static str {
        match self {
            AddressFamily::V4 => "v4",
            AddressFamily::V6 => "v6",
        }
    }

    /// Infer the family from an IP literal: a colon means IPv6 (spec §4.4
    /// "Key fan-out").
    pub fn infer(ip_literal: &str) -> AddressFamily {
        if ip_literal.contains(':') {
            AddressFamily::V6
        } else {
            AddressFamily::V4
        }
    }

    pub fn null_route(&self) -> &'static str {
        match self {
            AddressFamily::V4 => "0.0.0.0/0",
            AddressFamily::V6 => "::/0",
        }
    }
}

impl fmt::Display for AddressFamily {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for AddressFamily {
    type Err = IpasnError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "v4" => Ok(AddressFamily::V4),
            "v6" => Ok(AddressFamily::V6),
            other => Err(IpasnError::InvalidQuery(format!(
                "address_family has to be v4 or v6, not {other}"
            ))),
        }
    }
}

/// A work item / response-hash key: `source|family|date|ip`.
///
/// `ip` may itself contain IPv6 colons, but it may never contain the `|`
/// separator (Testable Property 3).
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct QueryKey {
    pub source: String,
    pub family: AddressFamily,
    pub date: String,
    pub ip: String,
}

impl QueryKey {
    pub fn new(
        source: impl Into<String>,
        family: AddressFamily,
        date: impl Into<String>,
        ip: impl Into<String>,
    ) -> Self {
        Self {
            source: source.into(),
            family,
            date: date.into(),
            ip: ip.into(),
        }
    }

    pub fn format(&self) -> String {
        format!("{}|{}|{}|{}", self.source, self.family, self.date, self.ip)
    }

    /// Parses a key previously produced by [`QueryKey::format`].
    ///
    /// Splits on `|` into exactly 4 fields; the `ip` field is everything
    /// after the third separator, so IPv6 literals containing `:` round-trip
    /// fine, but an `ip` containing a literal `|` would not — the format side
    /// never produces that, so this is the only malformed-input case.
    pub fn parse(raw: &str) -> Result<Self> {
        let mut parts = raw.splitn(4, '|');
        let source = parts
            .next()
            .ok_or_else(|| IpasnError::InvalidQuery(raw.to_string()))?;
        let family = parts
            .next()
            .ok_or_else(|| IpasnError::InvalidQuery(raw.to_string()))?;
        let date = parts
            .next()
            .ok_or_else(|| IpasnError::InvalidQuery(raw.to_string()))?;
        let ip = parts
            .next()
            .ok_or_else(|| IpasnError::InvalidQuery(raw.to_string()))?;
        Ok(QueryKey::new(source, family.parse()?, date, ip))
    }
}

impl fmt::Display for QueryKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.format())
    }
}

/// `{source}|{family}|cached_dates` — the per-(source, family) set of dates
/// at least one worker has loaded.
pub fn cached_dates_key(source: &str, family: AddressFamily) -> String {
    format!("{source}|{family}|cached_dates")
}

/// `lock|{source}|{family}` — the set of claimed `"first_last"` intervals.
pub fn lock_key(source: &str, family: AddressFamily) -> String {
    format!("lock|{source}|{family}")
}

/// `"{first}_{last}"` lock-set member.
pub fn lock_interval(first: &str, last: &str) -> String {
    format!("{first}_{last}")
}

/// `{source}|{family}|dates` — all dates with snapshots loaded in storage.
pub fn storage_dates_key(source: &str, family: AddressFamily) -> String {
    format!("{source}|{family}|dates")
}

/// `{source}|{family}|{date}|asns`
pub fn storage_asns_key(source: &str, family: AddressFamily, date: &str) -> String {
    format!("{source}|{family}|{date}|asns")
}

/// `{source}|{family}|{date}|{asn}`
pub fn storage_prefixes_key(source: &str, family: AddressFamily, date: &str, asn: &str) -> String {
    format!("{source}|{family}|{date}|{asn}")
}

/// `{source}|{family}|{date}|{asn}|ipcount`
pub fn storage_ipcount_key(source: &str, family: AddressFamily, date: &str, asn: &str) -> String {
    format!("{source}|{family}|{date}|{asn}|ipcount")
}

pub const WORK_SET_KEY: &str = "query";
pub const META_SOURCES_KEY: &str = "META:sources";
pub const META_EXPECTED_INTERVAL_KEY: &str = "META:expected_interval";
pub const RUNNING_KEY: &str = "running";
pub const SHUTDOWN_KEY: &str = "shutdown";

/// Values that count as "no answer" for an ASN field (spec §3, §4.4).
pub fn is_null_asn(asn: &str) -> bool {
    matches!(asn, "0" | "")
}

/// Values that count as the null route for a prefix field.
pub fn is_null_prefix(prefix: &str) -> bool {
    matches!(prefix, "0.0.0.0/0" | "::/0" | "")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips_v4() {
        let key = QueryKey::new("caida", AddressFamily::V4, "2023-06-12T00:00:00", "8.8.8.8");
        let parsed = QueryKey::parse(&key.format()).unwrap();
        assert_eq!(key, parsed);
    }

    #[test]
    fn round_trips_v6_ip_with_colons() {
        let key = QueryKey::new(
            "ripe_rrc00",
            AddressFamily::V6,
            "2023-06-12T00:00:00",
            "2001:db8::1",
        );
        let parsed = QueryKey::parse(&key.format()).unwrap();
        assert_eq!(key, parsed);
        assert_eq!(parsed.ip, "2001:db8::1");
    }

    #[test]
    fn infers_family_from_ip_literal() {
        assert_eq!(AddressFamily::infer("8.8.8.8"), AddressFamily::V4);
        assert_eq!(AddressFamily::infer("::1"), AddressFamily::V6);
    }

    #[test]
    fn rejects_truncated_key() {
        assert!(QueryKey::parse("caida|v4").is_err());
    }

    proptest::proptest! {
        #[test]
        fn format_parse_round_trip(
            source in "[a-z_]{1,12}",
            is_v6 in proptest::bool::ANY,
            date in "[0-9]{4}-[0-9]{2}-[0-9]{2}",
            ip in "[0-9]{1,3}\\.[0-9]{1,3}\\.[0-9]{1,3}\\.[0-9]{1,3}",
        ) {
            let family = if is_v6 { AddressFamily::V6 } else { AddressFamily::V4 };
            let key = QueryKey::new(source, family, date, ip);
            let parsed = QueryKey::parse(&key.format()).unwrap();
            proptest::prop_assert_eq!(key, parsed);
        }
    }
}
