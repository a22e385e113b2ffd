use serde::{Deserialize, Serialize};
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};

/// One configured source endpoint of a sending zone.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PoolEntry {
    pub address: IpAddr,
    /// Hostname presented in EHLO and synthesized Received headers when
    /// sending from this address.
    pub name: Option<String>,
    /// Share of traffic in [0, 1]. Entries without a ratio split whatever
    /// share the explicit ratios leave unclaimed.
    pub ratio: Option<f64>,
}

impl PoolEntry {
    pub fn new(address: IpAddr) -> Self {
        Self {
            address,
            name: None,
            ratio: None,
        }
    }

    fn sentinel(address: IpAddr) -> Self {
        Self::new(address)
    }
}

/// Expand weighted entries into a repetition-weighted selection array so a
/// uniform index pick follows the configured distribution.
pub fn divide_load(entries: &[PoolEntry]) -> Vec<PoolEntry> {
    // entries with an explicit zero ratio are disabled
    let entries: Vec<&PoolEntry> = entries
        .iter()
        .filter(|e| e.ratio.is_none_or(|r| r > 0.0))
        .collect();
    if entries.is_empty() {
        return Vec::new();
    }

    let custom_share: f64 = entries
        .iter()
        .filter_map(|e| e.ratio)
        .map(|r| r.clamp(0.0, 1.0))
        .sum();
    let unclaimed = (1.0 - custom_share.min(1.0)).max(0.0);
    let default_count = entries.iter().filter(|e| e.ratio.is_none()).count();
    let default_share = if default_count > 0 {
        unclaimed / default_count as f64
    } else {
        0.0
    };

    let ratios: Vec<f64> = entries
        .iter()
        .map(|e| e.ratio.map(|r| r.clamp(0.0, 1.0)).unwrap_or(default_share))
        .collect();

    let total_shares: f64 = ratios.iter().sum();
    let smallest = ratios.iter().copied().fold(f64::INFINITY, f64::min);
    if smallest <= 0.0 || !smallest.is_finite() {
        // degenerate configuration, fall back to one slot each
        return entries.into_iter().cloned().collect();
    }

    let total_items = (total_shares / smallest).ceil();

    let mut expanded = Vec::new();
    for (entry, ratio) in entries.iter().zip(ratios) {
        let repeats = (total_items * ratio).ceil() as usize;
        for _ in 0..repeats {
            expanded.push((*entry).clone());
        }
    }
    expanded
}

/// The expanded source pools of a zone, one per address family. Never
/// empty: an unconfigured family gets an unspecified-address sentinel so
/// the kernel picks the source.
#[derive(Debug, Clone)]
pub struct SourcePool {
    v4: Vec<PoolEntry>,
    v6: Vec<PoolEntry>,
    has_v6: bool,
}

impl SourcePool {
    pub fn new(entries: &[PoolEntry]) -> Self {
        let (v4, v6): (Vec<PoolEntry>, Vec<PoolEntry>) = entries
            .iter()
            .cloned()
            .partition(|e| e.address.is_ipv4());

        let has_v6 = !v6.is_empty();

        let mut v4 = divide_load(&v4);
        let mut v6 = divide_load(&v6);
        if v4.is_empty() {
            v4.push(PoolEntry::sentinel(IpAddr::V4(Ipv4Addr::UNSPECIFIED)));
        }
        if v6.is_empty() {
            v6.push(PoolEntry::sentinel(IpAddr::V6(Ipv6Addr::UNSPECIFIED)));
        }

        Self { v4, v6, has_v6 }
    }

    pub fn has_ipv6(&self) -> bool {
        self.has_v6
    }

    /// All distinct configured addresses, for startup sanity checks.
    pub fn addresses(&self) -> Vec<IpAddr> {
        let mut seen = Vec::new();
        for entry in self.v4.iter().chain(self.v6.iter()) {
            if !seen.contains(&entry.address) && !entry.address.is_unspecified() {
                seen.push(entry.address);
            }
        }
        seen
    }

    /// Pick a source endpoint for a hash key. Identical keys over an
    /// identical effective pool always land on the same endpoint, which is
    /// what keeps greylisting continuity across retries.
    ///
    /// Returns the entry plus whether the disabled-address filter had to be
    /// bypassed to keep the pool non-empty.
    pub fn select(&self, key: &str, use_ipv6: bool, disabled: &[IpAddr]) -> (PoolEntry, bool) {
        let pool = if use_ipv6 && self.has_v6 { &self.v6 } else { &self.v4 };

        let eligible: Vec<&PoolEntry> = pool
            .iter()
            .filter(|e| !disabled.contains(&e.address))
            .collect();

        let (pool_disabled, chosen) = if eligible.is_empty() {
            // the blacklist is soft: a filter that empties the pool is skipped
            (true, pool.iter().collect::<Vec<_>>())
        } else {
            (false, eligible)
        };

        let index = crc32fast::hash(key.as_bytes()) as usize % chosen.len();
        (chosen[index].clone(), pool_disabled)
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn entry(address: &str, ratio: Option<f64>) -> PoolEntry {
        PoolEntry {
            address: address.parse().unwrap(),
            name: None,
            ratio,
        }
    }

    #[test]
    fn equal_shares_without_ratios() {
        let expanded = divide_load(&[
            entry("10.0.0.1", None),
            entry("10.0.0.2", None),
            entry("10.0.0.3", None),
        ]);
        assert_eq!(expanded.len(), 3);
    }

    #[test]
    fn weighted_expansion_matches_ratios() {
        let expanded = divide_load(&[
            entry("10.0.0.1", Some(0.9)),
            entry("10.0.0.2", Some(0.1)),
        ]);

        assert_eq!(expanded.len(), 10);
        let heavy = expanded
            .iter()
            .filter(|e| e.address == "10.0.0.1".parse::<IpAddr>().unwrap())
            .count();
        assert_eq!(heavy, 9);
    }

    #[test]
    fn zero_ratio_entries_are_excluded() {
        let expanded = divide_load(&[
            entry("10.0.0.1", Some(0.0)),
            entry("10.0.0.2", None),
        ]);
        assert_eq!(expanded.len(), 1);
        assert_eq!(expanded[0].address, "10.0.0.2".parse::<IpAddr>().unwrap());
    }

    #[test]
    fn mixed_explicit_and_default_ratios() {
        let expanded = divide_load(&[
            entry("10.0.0.1", Some(0.5)),
            entry("10.0.0.2", None),
            entry("10.0.0.3", None),
        ]);

        let count_of = |address: &str| {
            let address: IpAddr = address.parse().unwrap();
            expanded.iter().filter(|e| e.address == address).count()
        };
        assert_eq!(count_of("10.0.0.1"), 2);
        assert_eq!(count_of("10.0.0.2"), 1);
        assert_eq!(count_of("10.0.0.3"), 1);
    }

    #[test]
    fn empty_family_gets_a_sentinel() {
        let pool = SourcePool::new(&[entry("10.0.0.1", None)]);
        let (picked, _) = pool.select("key", true, &[]);
        // no v6 configured: requests for v6 fall back to the v4 pool
        assert_eq!(picked.address, "10.0.0.1".parse::<IpAddr>().unwrap());
        assert!(!pool.has_ipv6());

        let pool = SourcePool::new(&[]);
        let (picked, _) = pool.select("key", false, &[]);
        assert!(picked.address.is_unspecified());
    }

    #[test]
    fn selection_is_stable_per_key() {
        let pool = SourcePool::new(&[
            entry("10.0.0.1", None),
            entry("10.0.0.2", None),
            entry("10.0.0.3", None),
        ]);

        for key in ["a@example.com", "b@example.org", "1234.1"] {
            let (first, _) = pool.select(key, false, &[]);
            for _ in 0..10 {
                let (again, _) = pool.select(key, false, &[]);
                assert_eq!(first, again);
            }
        }
    }

    #[test]
    fn disabled_filter_is_soft() {
        let only: IpAddr = "10.0.0.1".parse().unwrap();
        let pool = SourcePool::new(&[entry("10.0.0.1", None)]);

        let (picked, bypassed) = pool.select("key", false, &[only]);
        assert_eq!(picked.address, only);
        assert!(bypassed);
    }

    #[test]
    fn disabled_addresses_are_skipped_when_possible() {
        let bad: IpAddr = "10.0.0.1".parse().unwrap();
        let pool = SourcePool::new(&[entry("10.0.0.1", None), entry("10.0.0.2", None)]);

        for key in ["k1", "k2", "k3", "k4"] {
            let (picked, bypassed) = pool.select(key, false, &[bad]);
            assert_ne!(picked.address, bad);
            assert!(!bypassed);
        }
    }

    #[test]
    fn weighted_distribution_converges() {
        let pool = SourcePool::new(&[
            entry("10.0.0.1", Some(0.9)),
            entry("10.0.0.2", Some(0.1)),
        ]);

        let heavy: IpAddr = "10.0.0.1".parse().unwrap();
        let hits = (0..1000)
            .map(|i| pool.select(&format!("sender-{i}@example.com"), false, &[]))
            .filter(|(e, _)| e.address == heavy)
            .count();

        assert!((850..=950).contains(&hits), "heavy endpoint hit {hits} times");
    }
}
