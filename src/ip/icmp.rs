use std::{fmt, ops::Deref};

use crate::logger::fmt_slice_hex;

use super::{IpError, ICMP_ECHO_HEADER_LEN};

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum IcmpV4 {
    EchoReply,
    EchoRequest,
    Unknown(u8, u8),
}

impl IcmpV4 {
    fn from_type_code(icmp_type: u8, icmp_code: u8) -> IcmpV4 {
        match (icmp_type, icmp_code) {
            (0, 0) => IcmpV4::EchoReply,
            (8, 0) => IcmpV4::EchoRequest,
            (icmp_type, icmp_code) => IcmpV4::Unknown(icmp_type, icmp_code),
        }
    }

    pub fn type_u8(&self) -> u8 {
        match *self {
            IcmpV4::EchoReply => 0,
            IcmpV4::EchoRequest => 8,
            IcmpV4::Unknown(icmp_type, _) => icmp_type,
        }
    }

    /// Only echo requests are accepted from the IPv4 side.
    pub fn to_v6(&self) -> Option<IcmpV6> {
        match *self {
            IcmpV4::EchoRequest => Some(IcmpV6::EchoRequest),
            _ => None,
        }
    }

    /// Maps an echo back to its IPv6 type after it crossed the tunnel.
    pub fn echo_to_v6(&self) -> Option<IcmpV6> {
        match *self {
            IcmpV4::EchoRequest => Some(IcmpV6::EchoRequest),
            IcmpV4::EchoReply => Some(IcmpV6::EchoReply),
            IcmpV4::Unknown(_, _) => None,
        }
    }
}

impl fmt::Display for IcmpV4 {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            IcmpV4::EchoReply => f.write_str("Echo reply"),
            IcmpV4::EchoRequest => f.write_str("Echo request"),
            IcmpV4::Unknown(icmp_type, icmp_code) => {
                write!(f, "Unknown type {icmp_type} code {icmp_code}")
            }
        }
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum IcmpV6 {
    EchoRequest,
    EchoReply,
    Unknown(u8, u8),
}

impl IcmpV6 {
    fn from_type_code(icmp_type: u8, icmp_code: u8) -> IcmpV6 {
        match (icmp_type, icmp_code) {
            (128, 0) => IcmpV6::EchoRequest,
            (129, 0) => IcmpV6::EchoReply,
            (icmp_type, icmp_code) => IcmpV6::Unknown(icmp_type, icmp_code),
        }
    }

    pub fn type_u8(&self) -> u8 {
        match *self {
            IcmpV6::EchoRequest => 128,
            IcmpV6::EchoReply => 129,
            IcmpV6::Unknown(icmp_type, _) => icmp_type,
        }
    }

    pub fn to_v4(&self) -> Option<IcmpV4> {
        match *self {
            IcmpV6::EchoRequest => Some(IcmpV4::EchoRequest),
            IcmpV6::EchoReply => Some(IcmpV4::EchoReply),
            IcmpV6::Unknown(_, _) => None,
        }
    }
}

impl fmt::Display for IcmpV6 {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            IcmpV6::EchoRequest => f.write_str("Echo request"),
            IcmpV6::EchoReply => f.write_str("Echo reply"),
            IcmpV6::Unknown(icmp_type, icmp_code) => {
                write!(f, "Unknown type {icmp_type} code {icmp_code}")
            }
        }
    }
}

pub struct IcmpV4Message<'a>(&'a [u8]);

impl IcmpV4Message<'_> {
    pub fn from_data(data: &[u8]) -> Result<IcmpV4Message<'_>, IpError> {
        if data.len() >= ICMP_ECHO_HEADER_LEN {
            Ok(IcmpV4Message(data))
        } else {
            Err(IpError::Truncated("Not enough data in ICMPv4 header"))
        }
    }

    pub fn icmp_type(&self) -> IcmpV4 {
        IcmpV4::from_type_code(self[0], self[1])
    }

    fn checksum(&self) -> u16 {
        let mut checksum = [0u8; 2];
        checksum.copy_from_slice(&self[2..4]);
        u16::from_be_bytes(checksum)
    }
}

impl Deref for IcmpV4Message<'_> {
    type Target = [u8];

    fn deref(&self) -> &Self::Target {
        self.0
    }
}

impl fmt::Display for IcmpV4Message<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "ICMPv4 {} C={:#06X}: {}",
            self.icmp_type(),
            self.checksum(),
            fmt_slice_hex(self)
        )
    }
}

pub struct IcmpV6Message<'a>(&'a [u8]);

impl IcmpV6Message<'_> {
    pub fn from_data(data: &[u8]) -> Result<IcmpV6Message<'_>, IpError> {
        if data.len() >= ICMP_ECHO_HEADER_LEN {
            Ok(IcmpV6Message(data))
        } else {
            Err(IpError::Truncated("Not enough data in ICMPv6 header"))
        }
    }

    pub fn icmp_type(&self) -> IcmpV6 {
        IcmpV6::from_type_code(self[0], self[1])
    }

    fn checksum(&self) -> u16 {
        let mut checksum = [0u8; 2];
        checksum.copy_from_slice(&self[2..4]);
        u16::from_be_bytes(checksum)
    }
}

impl Deref for IcmpV6Message<'_> {
    type Target = [u8];

    fn deref(&self) -> &Self::Target {
        self.0
    }
}

impl fmt::Display for IcmpV6Message<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "ICMPv6 {} C={:#06X}: {}",
            self.icmp_type(),
            self.checksum(),
            fmt_slice_hex(self)
        )
    }
}
