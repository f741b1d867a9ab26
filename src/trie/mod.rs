//! Longest-prefix-match radix trie (spec §4.1).
//!
//! Backed by [`ipnet_trie::IpnetTrie`], the Patricia trie the BGP-domain
//! example (`wayback-rpki`) already uses for RPKI prefix matching. Separate
//! `Trie` instances are built for IPv4 and IPv6 — the underlying trie is
//! generic over `IpNet` so either family works, but callers are expected to
//! keep one instance per family the way the worker does (spec: "Separate
//! IPv4 (32-bit key space) and IPv6 (128-bit) instances").
//!
//! Construction is single-threaded; once a snapshot's prefixes are inserted,
//! the trie is read-only for the lifetime of the owning worker (spec
//! invariant: "A snapshot, once loaded into a worker's trie, is never
//! mutated").

use crate::error::{IpasnError, Result};
use crate::key::AddressFamily;
use ipnet::IpNet;
use ipnet_trie::IpnetTrie;
use std::net::IpAddr;
use std::str::FromStr;

/// Outcome of a trie lookup: the origin ASN and the enclosing prefix that
/// produced it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LookupHit {
    pub asn: String,
    pub prefix: String,
}

pub struct Trie {
    family: AddressFamily,
    inner: IpnetTrie<String>,
}

impl Trie {
    pub fn new_v4() -> Self {
        Trie {
            family: AddressFamily::V4,
            inner: IpnetTrie::new(),
        }
    }

    pub fn new_v6() -> Self {
        Trie {
            family: AddressFamily::V6,
            inner: IpnetTrie::new(),
        }
    }

    pub fn family(&self) -> AddressFamily {
        self.family
    }

    /// Inserts `prefix_str -> asn_str`. A later insert for the same prefix
    /// replaces the earlier ASN (spec §4.1). Malformed prefixes, or ones
    /// from the wrong address family, are rejected.
    pub fn insert(&mut self, prefix_str: &str, asn_str: &str) -> Result<()> {
        let net = parse_prefix(prefix_str, self.family)?;
        self.inner.insert(net, asn_str.to_string());
        Ok(())
    }

    /// Longest-prefix match for `ip_str`. Returns the ASN and the enclosing
    /// prefix with the greatest prefix length among all stored prefixes
    /// containing the IP, or `None` if no stored prefix covers it.
    pub fn lookup(&self, ip_str: &str) -> Result<Option<LookupHit>> {
        let ip = IpAddr::from_str(ip_str)
            .map_err(|_| IpasnError::InvalidIp(ip_str.to_string()))?;
        if matches!(ip, IpAddr::V4(_)) != matches!(self.family, AddressFamily::V4) {
            return Err(IpasnError::InvalidIp(format!(
                "{ip_str} does not match this trie's address family"
            )));
        }
        let host = host_net(ip);

        let mut best: Option<(u8, IpNet, &String)> = None;
        for (net, asn) in self.inner.matches(&host) {
            if net.prefix_len() >= best.map(|(len, _, _)| len).unwrap_or(0) {
                best = Some((net.prefix_len(), net, asn));
            }
        }

        Ok(best.map(|(_, net, asn)| LookupHit {
            asn: asn.clone(),
            prefix: net.to_string(),
        }))
    }

    pub fn len(&self) -> usize {
        self.inner.iter().count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

fn host_net(ip: IpAddr) -> IpNet {
    match ip {
        IpAddr::V4(v4) => IpNet::new(IpAddr::V4(v4), 32).expect("32 is a valid IPv4 prefix length"),
        IpAddr::V6(v6) => {
            IpNet::new(IpAddr::V6(v6), 128).expect("128 is a valid IPv6 prefix length")
        }
    }
}

fn parse_prefix(prefix_str: &str, family: AddressFamily) -> Result<IpNet> {
    let net = IpNet::from_str(prefix_str)
        .map_err(|_| IpasnError::InvalidPrefix(prefix_str.to_string()))?;
    let matches_family = matches!(
        (net, family),
        (IpNet::V4(_), AddressFamily::V4) | (IpNet::V6(_), AddressFamily::V6)
    );
    if !matches_family {
        return Err(IpasnError::InvalidPrefix(format!(
            "{prefix_str} is not a valid {} prefix",
            family.as_str()
        )));
    }
    Ok(net)
}
