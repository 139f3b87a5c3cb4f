//! Operator whitelist of IPs and CIDR ranges.

use std::net::IpAddr;
use std::sync::RwLock;

use ipnet::IpNet;
use tracing::warn;

/// Parse `10.0.0.0/8`, `::1/128` or a bare address (a `/32` or `/128`).
///
/// Host bits are cleared, so `10.1.2.3/8` and `10.0.0.0/8` are the same
/// entry.
pub fn parse_network(entry: &str) -> Option<IpNet> {
    let entry = entry.trim();
    if let Ok(net) = entry.parse::<IpNet>() {
        Some(net.trunc())
    } else if let Ok(ip) = entry.parse::<IpAddr>() {
        Some(IpNet::from(ip))
    } else {
        None
    }
}

/// Mutable set of whitelisted ranges, local to this process.
///
/// Lookups take a read lock on a short `Vec`; writes only happen through
/// the admin API.
#[derive(Debug, Default)]
pub struct Whitelist {
    ranges: RwLock<Vec<IpNet>>,
}

impl Whitelist {
    /// Build from configuration entries; invalid entries are logged and
    /// skipped.
    pub fn new(entries: &[String]) -> Self {
        let ranges = entries
            .iter()
            .filter_map(|entry| {
                let parsed = parse_network(entry);
                if parsed.is_none() {
                    warn!(entry = %entry, "Invalid whitelist entry, skipping");
                }
                parsed
            })
            .collect();
        Self {
            ranges: RwLock::new(ranges),
        }
    }

    /// Whether `ip` falls in any whitelisted range. Non-IP identities such
    /// as `"unknown"` are never whitelisted.
    pub fn contains(&self, ip: &str) -> bool {
        let Ok(addr) = ip.parse::<IpAddr>() else {
            return false;
        };
        match self.ranges.read() {
            Ok(ranges) => ranges.iter().any(|range| range.contains(&addr)),
            Err(poisoned) => poisoned.into_inner().iter().any(|range| range.contains(&addr)),
        }
    }

    /// Add a range. Returns `false` if it was already present.
    pub fn insert(&self, range: IpNet) -> bool {
        let mut ranges = match self.ranges.write() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        if ranges.contains(&range) {
            return false;
        }
        ranges.push(range);
        true
    }

    /// Remove a range. Returns `true` if it was present.
    pub fn remove(&self, range: &IpNet) -> bool {
        let mut ranges = match self.ranges.write() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        let before = ranges.len();
        ranges.retain(|r| r != range);
        ranges.len() != before
    }

    pub fn len(&self) -> usize {
        match self.ranges.read() {
            Ok(ranges) => ranges.len(),
            Err(poisoned) => poisoned.into_inner().len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_network() {
        assert_eq!(parse_network("10.0.0.0/8").unwrap().prefix_len(), 8);
        assert_eq!(parse_network("::1/128").unwrap().prefix_len(), 128);
        assert_eq!(parse_network(" 192.168.1.1 ").unwrap().prefix_len(), 32);
        assert!(parse_network("10.0.0.0/33").is_none());
        assert!(parse_network("not-an-ip").is_none());
        assert!(parse_network("10.0.0.0/x").is_none());
    }

    #[test]
    fn test_parse_network_clears_host_bits() {
        assert_eq!(
            parse_network("10.1.2.3/8").unwrap(),
            parse_network("10.0.0.0/8").unwrap()
        );
    }

    #[test]
    fn test_network_contains() {
        let range = parse_network("10.0.0.0/8").unwrap();
        assert!(range.contains(&"10.255.1.2".parse::<IpAddr>().unwrap()));
        assert!(!range.contains(&"11.0.0.1".parse::<IpAddr>().unwrap()));
        assert!(!range.contains(&"::1".parse::<IpAddr>().unwrap()));
    }

    #[test]
    fn test_whitelist_skips_invalid_entries() {
        let list = Whitelist::new(&["10.0.0.0/8".into(), "garbage".into()]);
        assert_eq!(list.len(), 1);
        assert!(list.contains("10.1.2.3"));
        assert!(!list.contains("unknown"));
    }

    #[test]
    fn test_whitelist_insert_and_remove() {
        let list = Whitelist::default();
        let range = parse_network("203.0.113.0/24").unwrap();

        assert!(list.insert(range));
        assert!(!list.insert(range));
        assert!(list.contains("203.0.113.77"));

        assert!(list.remove(&range));
        assert!(!list.contains("203.0.113.77"));
        assert!(list.is_empty());
    }

    #[test]
    fn test_network_display() {
        let range = parse_network("2001:db8::/32").unwrap();
        assert_eq!(range.to_string(), "2001:db8::/32");
    }
}
