//! Small CIDR helpers shared by the rule and namespace code.

use std::fmt;
use std::net::IpAddr;
use std::str::FromStr;

use crate::error::{KeelError, KeelResult};

/// An IP prefix in CIDR notation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Cidr {
    addr: IpAddr,
    prefix_len: u8,
}

impl Cidr {
    /// Build a prefix, validating the length against the address family.
    ///
    /// # Errors
    ///
    /// [`KeelError::InvalidParameter`] when the prefix length exceeds the
    /// family's bit width.
    pub fn new(addr: IpAddr, prefix_len: u8) -> KeelResult<Self> {
        let max = match addr {
            IpAddr::V4(_) => 32,
            IpAddr::V6(_) => 128,
        };
        if prefix_len > max {
            return Err(KeelError::invalid(format!(
                "prefix length {prefix_len} out of range for {addr}"
            )));
        }
        Ok(Self { addr, prefix_len })
    }

    /// The address part as given (not necessarily the network address).
    #[must_use]
    pub fn addr(&self) -> IpAddr {
        self.addr
    }

    /// The prefix length.
    #[must_use]
    pub fn prefix_len(&self) -> u8 {
        self.prefix_len
    }

    /// Whether this prefix is IPv6.
    #[must_use]
    pub fn is_ipv6(&self) -> bool {
        self.addr.is_ipv6()
    }

    /// Whether this is the all-zero default prefix (`0.0.0.0/0`, `::/0`).
    #[must_use]
    pub fn is_default(&self) -> bool {
        self.prefix_len == 0
    }

    fn bits(addr: IpAddr) -> u128 {
        match addr {
            IpAddr::V4(a) => u128::from(u32::from(a)),
            IpAddr::V6(a) => u128::from(a),
        }
    }

    fn mask(&self) -> u128 {
        let width = if self.addr.is_ipv4() { 32 } else { 128 };
        if self.prefix_len == 0 {
            0
        } else {
            let shift = width - u32::from(self.prefix_len);
            (!0u128 >> (128 - width)) & (!0u128 << shift)
        }
    }

    /// Whether `ip` falls inside this prefix. Always false across families.
    #[must_use]
    pub fn contains(&self, ip: IpAddr) -> bool {
        if self.addr.is_ipv4() != ip.is_ipv4() {
            return false;
        }
        (Self::bits(ip) & self.mask()) == (Self::bits(self.addr) & self.mask())
    }

    /// Whether two prefixes share any address.
    #[must_use]
    pub fn overlaps(&self, other: &Self) -> bool {
        if self.addr.is_ipv4() != other.addr.is_ipv4() {
            return false;
        }
        let short = self.prefix_len.min(other.prefix_len);
        let width = if self.addr.is_ipv4() { 32u32 } else { 128 };
        let mask = if short == 0 {
            0
        } else {
            (!0u128 >> (128 - width)) & (!0u128 << (width - u32::from(short)))
        };
        (Self::bits(self.addr) & mask) == (Self::bits(other.addr) & mask)
    }
}

impl FromStr for Cidr {
    type Err = KeelError;

    fn from_str(s: &str) -> KeelResult<Self> {
        let (addr, len) = s
            .split_once('/')
            .ok_or_else(|| KeelError::invalid(format!("not a CIDR: {s}")))?;
        let addr: IpAddr = addr
            .parse()
            .map_err(|_| KeelError::invalid(format!("bad address in CIDR: {s}")))?;
        let prefix_len: u8 = len
            .parse()
            .map_err(|_| KeelError::invalid(format!("bad prefix length in CIDR: {s}")))?;
        Self::new(addr, prefix_len)
    }
}

impl fmt::Display for Cidr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.addr, self.prefix_len)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_and_display() {
        let cidr: Cidr = "172.18.0.0/16".parse().unwrap();
        assert_eq!(cidr.prefix_len(), 16);
        assert_eq!(cidr.to_string(), "172.18.0.0/16");

        assert!("172.18.0.0".parse::<Cidr>().is_err());
        assert!("172.18.0.0/40".parse::<Cidr>().is_err());
        assert!("fd00::/64".parse::<Cidr>().is_ok());
    }

    #[test]
    fn contains_respects_mask() {
        let cidr: Cidr = "172.18.0.0/16".parse().unwrap();
        assert!(cidr.contains("172.18.200.3".parse().unwrap()));
        assert!(!cidr.contains("172.19.0.1".parse().unwrap()));
        assert!(!cidr.contains("fd00::1".parse().unwrap()));
    }

    #[test]
    fn overlap_is_symmetric() {
        let wide: Cidr = "10.0.0.0/8".parse().unwrap();
        let narrow: Cidr = "10.42.0.0/16".parse().unwrap();
        let other: Cidr = "192.168.0.0/16".parse().unwrap();

        assert!(wide.overlaps(&narrow));
        assert!(narrow.overlaps(&wide));
        assert!(!narrow.overlaps(&other));
    }

    #[test]
    fn default_prefix_overlaps_everything() {
        let all: Cidr = "0.0.0.0/0".parse().unwrap();
        let some: Cidr = "172.18.0.0/16".parse().unwrap();
        assert!(all.overlaps(&some));
        assert!(all.is_default());
    }
}
