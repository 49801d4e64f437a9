//! Destination trust classification (SSRF protection).
//!
//! Decides whether a concrete address may be dialed. The check always runs
//! against the resolved address, never against the hostname, so a name that
//! rebinds to an internal address is caught even when served from cache.
//!
//! # Blocked Ranges
//!
//! Evaluated in table order, first match wins:
//!
//! | Label              | Range              |
//! |--------------------|--------------------|
//! | `this-network`     | `0.0.0.0/8`        |
//! | `private`          | `10.0.0.0/8`       |
//! | `shared-address`   | `100.64.0.0/10`    |
//! | `loopback`         | `127.0.0.0/8`      |
//! | `link-local`       | `169.254.0.0/16`   |
//! | `private`          | `172.16.0.0/12`    |
//! | `private`          | `192.168.0.0/16`   |
//! | `multicast`        | `224.0.0.0/4`      |
//! | `reserved`         | `240.0.0.0/4`      |
//! | `unspecified`      | `::/128`           |
//! | `loopback`         | `::1/128`          |
//! | `unique-local`     | `fc00::/7`         |
//! | `link-local`       | `fe80::/10`        |
//! | `multicast`        | `ff00::/8`         |
//!
//! IPv4-mapped IPv6 addresses (`::ffff:a.b.c.d`) are judged by their IPv4 form.
//! Text that is not a valid address is always blocked, even with enforcement off.

use ipnet::IpNet;
use std::fmt;
use std::net::IpAddr;
use std::sync::LazyLock;

const BLOCKED_CIDRS: &[(&str, &str)] = &[
    ("this-network", "0.0.0.0/8"),
    ("private", "10.0.0.0/8"),
    ("shared-address", "100.64.0.0/10"),
    ("loopback", "127.0.0.0/8"),
    ("link-local", "169.254.0.0/16"),
    ("private", "172.16.0.0/12"),
    ("private", "192.168.0.0/16"),
    ("multicast", "224.0.0.0/4"),
    ("reserved", "240.0.0.0/4"),
    ("unspecified", "::/128"),
    ("loopback", "::1/128"),
    ("unique-local", "fc00::/7"),
    ("link-local", "fe80::/10"),
    ("multicast", "ff00::/8"),
];

static BLOCKED_RANGES: LazyLock<Vec<BlockedRange>> = LazyLock::new(|| {
    BLOCKED_CIDRS
        .iter()
        .map(|&(label, cidr)| BlockedRange {
            label,
            net: cidr.parse().expect("hardcoded CIDR"),
        })
        .collect()
});

#[derive(Debug, Clone, Copy)]
struct BlockedRange {
    label: &'static str,
    net: IpNet,
}

/// Why an address was refused.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BlockReason {
    /// The input is not a syntactically valid address.
    Invalid,

    /// The address falls in a disallowed range.
    Range {
        label: &'static str,
        net: IpNet,
    },
}

impl fmt::Display for BlockReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BlockReason::Invalid => f.write_str("invalid address"),
            BlockReason::Range { label, net } => write!(f, "{label} range {net}"),
        }
    }
}

/// Outcome of classifying one address.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Verdict {
    Allowed,
    Blocked(BlockReason),
}

impl Verdict {
    pub fn is_blocked(&self) -> bool {
        matches!(self, Verdict::Blocked(_))
    }
}

/// Classifies destination addresses as allowed or blocked.
#[derive(Debug, Clone)]
pub struct TrustClassifier {
    enforce: bool,
}

impl TrustClassifier {
    /// `enforce = false` only disables the range checks; invalid input stays blocked.
    pub fn new(enforce: bool) -> Self {
        Self { enforce }
    }

    pub fn is_enforcing(&self) -> bool {
        self.enforce
    }

    /// Classify an address given as text.
    pub fn classify_str(&self, addr: &str) -> Verdict {
        match addr.trim().parse::<IpAddr>() {
            Ok(ip) => self.classify(ip),
            Err(_) => Verdict::Blocked(BlockReason::Invalid),
        }
    }

    /// Classify a concrete address.
    pub fn classify(&self, addr: IpAddr) -> Verdict {
        if !self.enforce {
            return Verdict::Allowed;
        }
        let addr = match addr {
            IpAddr::V6(v6) => v6
                .to_ipv4_mapped()
                .map(IpAddr::V4)
                .unwrap_or(IpAddr::V6(v6)),
            v4 => v4,
        };
        BLOCKED_RANGES
            .iter()
            .find(|range| range.net.contains(&addr))
            .map(|range| {
                Verdict::Blocked(BlockReason::Range {
                    label: range.label,
                    net: range.net,
                })
            })
            .unwrap_or(Verdict::Allowed)
    }
}

impl Default for TrustClassifier {
    fn default() -> Self {
        Self::new(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn blocked(addr: &str) -> bool {
        TrustClassifier::new(true).classify_str(addr).is_blocked()
    }

    #[test]
    fn test_blocks_private_ipv4() {
        for addr in [
            "10.0.0.1",
            "10.255.255.255",
            "172.16.0.1",
            "172.31.255.254",
            "192.168.1.1",
        ] {
            assert!(blocked(addr), "{addr} should be blocked");
        }
    }

    #[test]
    fn test_blocks_loopback_link_local_and_shared() {
        for addr in [
            "127.0.0.1",
            "127.8.9.10",
            "169.254.169.254",
            "100.64.0.1",
            "100.127.255.255",
            "0.0.0.0",
            "0.1.2.3",
        ] {
            assert!(blocked(addr), "{addr} should be blocked");
        }
    }

    #[test]
    fn test_blocks_multicast_and_reserved_ipv4() {
        for addr in ["224.0.0.1", "239.255.255.250", "240.0.0.1", "255.255.255.255"] {
            assert!(blocked(addr), "{addr} should be blocked");
        }
    }

    #[test]
    fn test_blocks_special_ipv6() {
        for addr in ["::", "::1", "fc00::1", "fd12:3456::1", "fe80::1", "febf::1", "ff02::1"] {
            assert!(blocked(addr), "{addr} should be blocked");
        }
    }

    #[test]
    fn test_blocks_ipv4_mapped_ipv6() {
        assert!(blocked("::ffff:127.0.0.1"));
        assert!(blocked("::ffff:10.0.0.1"));
        assert!(!blocked("::ffff:93.184.216.34"));
    }

    #[test]
    fn test_allows_public_addresses() {
        for addr in [
            "93.184.216.34",
            "1.1.1.1",
            "8.8.8.8",
            "172.15.255.255",
            "172.32.0.1",
            "100.63.255.255",
            "100.128.0.1",
            "223.255.255.255",
            "2606:2800:220:1::1",
            "2001:4860:4860::8888",
        ] {
            assert!(!blocked(addr), "{addr} should be allowed");
        }
    }

    #[test]
    fn test_invalid_input_blocked_even_without_enforcement() {
        let classifier = TrustClassifier::new(false);
        assert_eq!(
            classifier.classify_str("not-an-ip"),
            Verdict::Blocked(BlockReason::Invalid)
        );
        assert_eq!(
            classifier.classify_str(""),
            Verdict::Blocked(BlockReason::Invalid)
        );
        assert_eq!(
            classifier.classify_str("999.1.1.1"),
            Verdict::Blocked(BlockReason::Invalid)
        );
    }

    #[test]
    fn test_enforcement_off_allows_ranges() {
        let classifier = TrustClassifier::new(false);
        assert_eq!(classifier.classify_str("127.0.0.1"), Verdict::Allowed);
        assert_eq!(classifier.classify_str("10.0.0.1"), Verdict::Allowed);
    }

    #[test]
    fn test_first_match_reports_label() {
        let verdict = TrustClassifier::new(true).classify_str("169.254.169.254");
        match verdict {
            Verdict::Blocked(BlockReason::Range { label, net }) => {
                assert_eq!(label, "link-local");
                assert_eq!(net.to_string(), "169.254.0.0/16");
            }
            other => panic!("unexpected verdict {other:?}"),
        }
    }

    #[test]
    fn test_block_reason_display() {
        let verdict = TrustClassifier::new(true).classify_str("10.1.1.1");
        let Verdict::Blocked(reason) = verdict else {
            panic!("expected blocked");
        };
        assert_eq!(reason.to_string(), "private range 10.0.0.0/8");
    }

    #[test]
    fn test_default_enforces() {
        assert!(TrustClassifier::default().is_enforcing());
    }
}
