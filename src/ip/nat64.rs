use std::{
    fmt,
    net::{Ipv4Addr, Ipv6Addr},
};

use super::IpError;

const MAX_PREFIX_LENGTH: u8 = 96;

/// Stateless mapping of IPv4 addresses into an IPv6 prefix.
///
/// The IPv4 address always occupies the last 32 bits; the first 96 bits are
/// copied from the configured prefix. Membership only compares the leading
/// `len` bits.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub struct Nat64Prefix {
    octets: [u8; 12],
    len: u8,
}

impl Nat64Prefix {
    /// `::ffff:0:0/96`, the IPv4-mapped range.
    pub const IPV4_MAPPED: Nat64Prefix = Nat64Prefix {
        octets: [0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0xff, 0xff],
        len: 96,
    };

    pub fn new(prefix: Ipv6Addr, len: u8) -> Result<Nat64Prefix, IpError> {
        if len > MAX_PREFIX_LENGTH {
            return Err("NAT64 prefix length must not exceed 96 bits".into());
        }
        let mut octets = [0u8; 12];
        octets.copy_from_slice(&prefix.octets()[0..12]);
        Ok(Nat64Prefix { octets, len })
    }

    pub fn prefix(&self) -> Ipv6Addr {
        let mut octets = [0u8; 16];
        octets[0..12].copy_from_slice(&self.octets);
        Ipv6Addr::from(octets)
    }

    pub fn prefix_len(&self) -> u8 {
        self.len
    }

    pub fn ipv4_to_ipv6(&self, addr: Ipv4Addr) -> Ipv6Addr {
        let mut octets = [0u8; 16];
        octets[0..12].copy_from_slice(&self.octets);
        octets[12..16].copy_from_slice(&addr.octets());
        Ipv6Addr::from(octets)
    }

    /// Returns `None` if `addr` is outside of the prefix.
    pub fn ipv6_to_ipv4(&self, addr: &Ipv6Addr) -> Option<Ipv4Addr> {
        if !self.matches(addr) {
            return None;
        }
        let mut octets = [0u8; 4];
        octets.copy_from_slice(&addr.octets()[12..16]);
        Some(Ipv4Addr::from(octets))
    }

    pub fn matches(&self, addr: &Ipv6Addr) -> bool {
        let addr = addr.octets();
        let full_bytes = (self.len / 8) as usize;
        if addr[..full_bytes] != self.octets[..full_bytes] {
            return false;
        }
        let remaining_bits = self.len % 8;
        if remaining_bits == 0 {
            return true;
        }
        let mask = 0xffu8 << (8 - remaining_bits);
        addr[full_bytes] & mask == self.octets[full_bytes] & mask
    }
}

impl Default for Nat64Prefix {
    fn default() -> Nat64Prefix {
        Nat64Prefix::IPV4_MAPPED
    }
}

impl fmt::Display for Nat64Prefix {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}/{}", self.prefix(), self.prefix_len())
    }
}
