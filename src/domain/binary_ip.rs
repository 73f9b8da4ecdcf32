//! Binary IP addresses
//!
//! Textual addresses coming from configuration and from Via headers are
//! written in many ways (`10.0.0.1`, `::ffff:10.0.0.1`, `[2001:db8::1]`).
//! `BinaryIp` folds all of them into one 16-byte form so that equality is
//! plain byte comparison.

use super::shared::DomainError;
use std::fmt;
use std::net::{IpAddr, Ipv6Addr, ToSocketAddrs};
use tracing::debug;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct BinaryIp([u8; 16]);

impl BinaryIp {
    /// Parse a numeric address. Brackets around IPv6 literals are accepted.
    pub fn parse(text: &str) -> Result<Self, DomainError> {
        let trimmed = text.trim();
        let literal = trimmed
            .strip_prefix('[')
            .and_then(|s| s.strip_suffix(']'))
            .unwrap_or(trimmed);

        literal
            .parse::<IpAddr>()
            .map(Self::from)
            .map_err(|_| DomainError::InvalidAddress(text.to_string()))
    }

    /// Parse a numeric address, falling back to a DNS lookup for host names.
    /// The first address returned by the resolver is kept.
    pub fn resolve(host: &str) -> Result<Self, DomainError> {
        if let Ok(ip) = Self::parse(host) {
            return Ok(ip);
        }

        let resolved = (host.trim(), 0u16)
            .to_socket_addrs()
            .map_err(|e| DomainError::InvalidAddress(format!("{}: {}", host, e)))?
            .next()
            .ok_or_else(|| DomainError::InvalidAddress(format!("{}: no address", host)))?;

        debug!("Resolved {} to {}", host, resolved.ip());
        Ok(Self::from(resolved.ip()))
    }

    pub fn octets(&self) -> [u8; 16] {
        self.0
    }

    pub fn to_ip_addr(&self) -> IpAddr {
        let v6 = Ipv6Addr::from(self.0);
        match v6.to_ipv4_mapped() {
            Some(v4) => IpAddr::V4(v4),
            None => IpAddr::V6(v6),
        }
    }
}

impl From<IpAddr> for BinaryIp {
    fn from(ip: IpAddr) -> Self {
        match ip {
            IpAddr::V4(v4) => Self(v4.to_ipv6_mapped().octets()),
            IpAddr::V6(v6) => Self(v6.octets()),
        }
    }
}

impl fmt::Display for BinaryIp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_ip_addr())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ipv4_and_mapped_ipv6_compare_equal() {
        let plain = BinaryIp::parse("192.168.1.10").unwrap();
        let mapped = BinaryIp::parse("::ffff:192.168.1.10").unwrap();
        assert_eq!(plain, mapped);
        assert_eq!(plain.to_string(), "192.168.1.10");
    }

    #[test]
    fn test_ipv6_spellings_compare_equal() {
        let short = BinaryIp::parse("2001:db8::1").unwrap();
        let long = BinaryIp::parse("2001:0db8:0000:0000:0000:0000:0000:0001").unwrap();
        let bracketed = BinaryIp::parse("[2001:db8::1]").unwrap();
        assert_eq!(short, long);
        assert_eq!(short, bracketed);
    }

    #[test]
    fn test_different_addresses_differ() {
        assert_ne!(
            BinaryIp::parse("10.0.0.1").unwrap(),
            BinaryIp::parse("10.0.0.2").unwrap()
        );
    }

    #[test]
    fn test_invalid_literal() {
        assert!(BinaryIp::parse("not-an-ip").is_err());
        assert!(BinaryIp::parse("").is_err());
    }

    #[test]
    fn test_resolve_numeric_does_not_hit_dns() {
        let ip = BinaryIp::resolve("127.0.0.1").unwrap();
        assert_eq!(ip.to_string(), "127.0.0.1");
    }
}
