use std::{
    error, fmt,
    net::{Ipv4Addr, Ipv6Addr},
};

use crate::logger::fmt_slice_hex;

mod checksum;
pub mod icmp;
pub mod nat64;
pub mod translate;

pub use checksum::{
    fill_ip_header_checksum, fill_transport_checksum_v4, fill_transport_checksum_v6,
    validate_ip_header, validate_transport_v4, validate_transport_v6,
};
#[cfg(test)]
pub use checksum::checksum;
pub use nat64::Nat64Prefix;

pub const IPV4_HEADER_LEN: usize = 20;
pub const IPV6_HEADER_LEN: usize = 40;
pub const UDP_HEADER_LEN: usize = 8;
pub const TCP_HEADER_LEN: usize = 20;
pub const ICMP_HEADER_LEN: usize = 4;
pub const ICMP_ECHO_HEADER_LEN: usize = 8;

pub const DNS_PORT: u16 = 53;

/// All-nodes link-local multicast, the IPv6 equivalent of a limited broadcast.
pub const IPV6_ALL_NODES: Ipv6Addr = Ipv6Addr::new(0xff02, 0, 0, 0, 0, 0, 0, 1);

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub struct TransportProtocolType(u8);

impl TransportProtocolType {
    pub const ICMP: TransportProtocolType = TransportProtocolType(1);
    pub const TCP: TransportProtocolType = TransportProtocolType(6);
    pub const UDP: TransportProtocolType = TransportProtocolType(17);
    pub const IPV6_ICMP: TransportProtocolType = TransportProtocolType(58);

    pub fn from_u8(value: u8) -> TransportProtocolType {
        TransportProtocolType(value)
    }

    pub fn to_u8(self) -> u8 {
        self.0
    }

    /// Offset of the checksum field from the start of the transport header.
    pub fn checksum_offset(&self) -> usize {
        match *self {
            Self::TCP => 16,
            Self::UDP => 6,
            _ => 2,
        }
    }
}

impl fmt::Display for TransportProtocolType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match *self {
            Self::ICMP => write!(f, "ICMP"),
            Self::TCP => write!(f, "TCP"),
            Self::UDP => write!(f, "UDP"),
            Self::IPV6_ICMP => write!(f, "IPv6-ICMP"),
            _ => write!(f, "Unknown IP transport protocol {}", self.0),
        }
    }
}

pub enum TransportData<'a> {
    Udp(&'a [u8]),
    Tcp(&'a [u8]),
    IcmpV4(&'a [u8]),
    IcmpV6(&'a [u8]),
}

impl TransportData<'_> {
    pub fn from_data(
        protocol: TransportProtocolType,
        data: &[u8],
    ) -> Result<TransportData<'_>, IpError> {
        match protocol {
            TransportProtocolType::UDP => {
                if data.len() < UDP_HEADER_LEN {
                    return Err(IpError::Truncated("Not enough data for UDP header"));
                }
                let mut length = [0u8; 2];
                length.copy_from_slice(&data[4..6]);
                let length = u16::from_be_bytes(length) as usize;
                if length < UDP_HEADER_LEN {
                    Err(IpError::Truncated("UDP length is shorter than its header"))
                } else if length > data.len() {
                    Err(IpError::Truncated("UDP length overflows the packet"))
                } else {
                    Ok(TransportData::Udp(&data[..length]))
                }
            }
            TransportProtocolType::TCP => {
                if data.len() < TCP_HEADER_LEN {
                    return Err(IpError::Truncated("Not enough data for TCP header"));
                }
                let data_offset = ((data[12] >> 4) & 0x0f) as usize * 4;
                if data_offset > data.len() {
                    Err(IpError::Truncated("TCP data offset overflow"))
                } else if data_offset < TCP_HEADER_LEN {
                    Err(IpError::Unsupported("TCP data offset folds into the header"))
                } else {
                    Ok(TransportData::Tcp(data))
                }
            }
            TransportProtocolType::ICMP => {
                if data.len() < ICMP_HEADER_LEN {
                    Err(IpError::Truncated("Not enough data for ICMPv4 header"))
                } else {
                    Ok(TransportData::IcmpV4(data))
                }
            }
            TransportProtocolType::IPV6_ICMP => {
                if data.len() < ICMP_HEADER_LEN {
                    Err(IpError::Truncated("Not enough data for ICMPv6 header"))
                } else {
                    Ok(TransportData::IcmpV6(data))
                }
            }
            _ => Err(IpError::Unsupported("Unsupported transport protocol")),
        }
    }

    pub fn protocol(&self) -> TransportProtocolType {
        match self {
            TransportData::Udp(_) => TransportProtocolType::UDP,
            TransportData::Tcp(_) => TransportProtocolType::TCP,
            TransportData::IcmpV4(_) => TransportProtocolType::ICMP,
            TransportData::IcmpV6(_) => TransportProtocolType::IPV6_ICMP,
        }
    }

    /// Transport header and payload. For UDP this ends at the UDP length.
    pub fn full_data(&self) -> &[u8] {
        match self {
            TransportData::Udp(data) => data,
            TransportData::Tcp(data) => data,
            TransportData::IcmpV4(data) => data,
            TransportData::IcmpV6(data) => data,
        }
    }

    pub fn src_port(&self) -> Option<u16> {
        match self {
            TransportData::Udp(data) | TransportData::Tcp(data) => {
                let mut src_port = [0u8; 2];
                src_port.copy_from_slice(&data[0..2]);
                Some(u16::from_be_bytes(src_port))
            }
            TransportData::IcmpV4(_) | TransportData::IcmpV6(_) => None,
        }
    }

    pub fn dst_port(&self) -> Option<u16> {
        match self {
            TransportData::Udp(data) | TransportData::Tcp(data) => {
                let mut dst_port = [0u8; 2];
                dst_port.copy_from_slice(&data[2..4]);
                Some(u16::from_be_bytes(dst_port))
            }
            TransportData::IcmpV4(_) | TransportData::IcmpV6(_) => None,
        }
    }

    pub fn icmp_type(&self) -> Option<u8> {
        match self {
            TransportData::IcmpV4(data) | TransportData::IcmpV6(data) => Some(data[0]),
            TransportData::Udp(_) | TransportData::Tcp(_) => None,
        }
    }
}

impl fmt::Display for TransportData<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TransportData::IcmpV4(data) => match icmp::IcmpV4Message::from_data(data) {
                Ok(icmp) => icmp.fmt(f),
                Err(err) => write!(f, "ICMPv4 error: {err}"),
            },
            TransportData::IcmpV6(data) => match icmp::IcmpV6Message::from_data(data) {
                Ok(icmp) => icmp.fmt(f),
                Err(err) => write!(f, "ICMPv6 error: {err}"),
            },
            other => write!(f, "{} {}", other.protocol(), fmt_slice_hex(other.full_data())),
        }
    }
}

pub struct Ipv4Packet<'a> {
    data: &'a [u8],
    transport_data: TransportData<'a>,
}

impl<'a> Ipv4Packet<'a> {
    const FRAGMENT_OFFSET_MASK: u16 = 0x1fff;
    const FRAGMENT_MF_MASK: u16 = 1 << 13;

    pub fn from_data(data: &'a [u8]) -> Result<Ipv4Packet<'a>, IpError> {
        if data.len() < IPV4_HEADER_LEN {
            return Err(IpError::Truncated("Not enough bytes in IPv4 header"));
        }
        if data[0] >> 4 != 4 {
            return Err(IpError::Unsupported("Not an IPv4 packet"));
        }
        let header_length = Self::header_length(data);
        if header_length < IPV4_HEADER_LEN {
            return Err(IpError::Unsupported("IPv4 header length is too short"));
        }
        if data.len() < header_length {
            return Err(IpError::Truncated("IPv4 header length overflow"));
        }
        let mut total_length = [0u8; 2];
        total_length.copy_from_slice(&data[2..4]);
        let total_length = u16::from_be_bytes(total_length) as usize;
        if total_length > data.len() {
            return Err(IpError::Truncated("IPv4 total length overflows the buffer"));
        }
        if total_length <= header_length {
            return Err(IpError::Truncated("IPv4 packet has no payload"));
        }
        let data = &data[..total_length];

        let mut fragment = [0u8; 2];
        fragment.copy_from_slice(&data[6..8]);
        let fragment = u16::from_be_bytes(fragment);
        if fragment & (Self::FRAGMENT_MF_MASK | Self::FRAGMENT_OFFSET_MASK) != 0 {
            return Err(IpError::Unsupported("Fragmented IPv4 packets are not supported"));
        }

        let protocol_type = TransportProtocolType::from_u8(data[9]);
        let transport_data = TransportData::from_data(protocol_type, &data[header_length..])?;
        Ok(Ipv4Packet {
            data,
            transport_data,
        })
    }

    fn header_length(data: &[u8]) -> usize {
        (data[0] & 0x0f) as usize * 4
    }

    pub fn total_length(&self) -> usize {
        self.data.len()
    }

    pub fn identification(&self) -> u16 {
        let mut identification = [0u8; 2];
        identification.copy_from_slice(&self.data[4..6]);
        u16::from_be_bytes(identification)
    }

    /// Differentiated services code point, the upper six bits of the type
    /// of service field.
    pub fn dscp(&self) -> u8 {
        self.data[1] >> 2
    }

    pub fn ttl(&self) -> u8 {
        self.data[8]
    }

    pub fn src_addr(&self) -> Ipv4Addr {
        let mut src_addr = [0u8; 4];
        src_addr.copy_from_slice(&self.data[12..16]);
        Ipv4Addr::from(src_addr)
    }

    pub fn dst_addr(&self) -> Ipv4Addr {
        let mut dst_addr = [0u8; 4];
        dst_addr.copy_from_slice(&self.data[16..20]);
        Ipv4Addr::from(dst_addr)
    }

    pub fn transport_protocol(&self) -> TransportProtocolType {
        self.transport_data.protocol()
    }

    pub fn transport_data(&self) -> &TransportData<'a> {
        &self.transport_data
    }

    pub fn validate_ip_checksum(&self) -> bool {
        validate_ip_header(&self.data[..Self::header_length(self.data)])
    }

    pub fn validate_transport_checksum(&self) -> bool {
        validate_transport_v4(self.data, self.transport_protocol())
    }
}

impl fmt::Display for Ipv4Packet<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let transport = self.transport_data();
        write!(f, "IPv4 {} {}", transport.protocol(), self.src_addr())?;
        if let Some(src_port) = transport.src_port() {
            write!(f, ":{src_port}")?;
        }
        write!(f, " -> {}", self.dst_addr())?;
        if let Some(dst_port) = transport.dst_port() {
            write!(f, ":{dst_port}")?;
        }
        write!(
            f,
            " ID={:#06X} L={} TTL={}",
            self.identification(),
            self.total_length(),
            self.ttl()
        )
    }
}

pub struct Ipv6Packet<'a> {
    data: &'a [u8],
    transport_data: TransportData<'a>,
}

impl<'a> Ipv6Packet<'a> {
    pub fn from_data(data: &'a [u8]) -> Result<Ipv6Packet<'a>, IpError> {
        if data.len() < IPV6_HEADER_LEN {
            return Err(IpError::Truncated("Not enough bytes in IPv6 header"));
        }
        if data[0] >> 4 != 6 {
            return Err(IpError::Unsupported("Not an IPv6 packet"));
        }
        let mut payload_length = [0u8; 2];
        payload_length.copy_from_slice(&data[4..6]);
        let total_length = IPV6_HEADER_LEN + u16::from_be_bytes(payload_length) as usize;
        if total_length > data.len() {
            return Err(IpError::Truncated("IPv6 payload length overflows the buffer"));
        }
        let data = &data[..total_length];

        let protocol_type = TransportProtocolType::from_u8(data[6]);
        let transport_data = TransportData::from_data(protocol_type, &data[IPV6_HEADER_LEN..])?;
        Ok(Ipv6Packet {
            data,
            transport_data,
        })
    }

    pub fn payload_length(&self) -> usize {
        self.data.len() - IPV6_HEADER_LEN
    }

    pub fn hop_limit(&self) -> u8 {
        self.data[7]
    }

    pub fn src_addr(&self) -> Ipv6Addr {
        let mut src_addr = [0u8; 16];
        src_addr.copy_from_slice(&self.data[8..24]);
        Ipv6Addr::from(src_addr)
    }

    pub fn dst_addr(&self) -> Ipv6Addr {
        let mut dst_addr = [0u8; 16];
        dst_addr.copy_from_slice(&self.data[24..40]);
        Ipv6Addr::from(dst_addr)
    }

    pub fn transport_protocol(&self) -> TransportProtocolType {
        self.transport_data.protocol()
    }

    pub fn transport_data(&self) -> &TransportData<'a> {
        &self.transport_data
    }

    pub fn validate_transport_checksum(&self) -> bool {
        validate_transport_v6(self.data, self.transport_protocol())
    }
}

impl fmt::Display for Ipv6Packet<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let transport = self.transport_data();
        write!(f, "IPv6 {} [{}]", transport.protocol(), self.src_addr())?;
        if let Some(src_port) = transport.src_port() {
            write!(f, ":{src_port}")?;
        }
        write!(f, " -> [{}]", self.dst_addr())?;
        if let Some(dst_port) = transport.dst_port() {
            write!(f, ":{dst_port}")?;
        }
        write!(f, " L={} H={}", self.payload_length(), self.hop_limit())
    }
}

#[derive(Debug)]
pub enum IpError {
    Truncated(&'static str),
    Unsupported(&'static str),
    Internal(&'static str),
}

impl fmt::Display for IpError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Self::Truncated(msg) => write!(f, "Truncated packet: {msg}"),
            Self::Unsupported(msg) => write!(f, "Unsupported packet: {msg}"),
            Self::Internal(msg) => f.write_str(msg),
        }
    }
}

impl error::Error for IpError {}

impl From<&'static str> for IpError {
    fn from(msg: &'static str) -> IpError {
        Self::Internal(msg)
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    /// Builds an IPv6 packet with a valid transport checksum.
    pub fn build_ipv6_packet(
        src: Ipv6Addr,
        dst: Ipv6Addr,
        protocol: TransportProtocolType,
        hop_limit: u8,
        transport: &[u8],
    ) -> Vec<u8> {
        let mut packet = vec![0u8; IPV6_HEADER_LEN + transport.len()];
        packet[0] = 0x60;
        packet[4..6].copy_from_slice(&(transport.len() as u16).to_be_bytes());
        packet[6] = protocol.to_u8();
        packet[7] = hop_limit;
        packet[8..24].copy_from_slice(&src.octets());
        packet[24..40].copy_from_slice(&dst.octets());
        packet[IPV6_HEADER_LEN..].copy_from_slice(transport);
        fill_transport_checksum_v6(&mut packet, protocol);
        packet
    }

    /// Builds an IPv4 packet with valid header and transport checksums.
    pub fn build_ipv4_packet(
        src: Ipv4Addr,
        dst: Ipv4Addr,
        protocol: TransportProtocolType,
        ttl: u8,
        transport: &[u8],
    ) -> Vec<u8> {
        let total_length = IPV4_HEADER_LEN + transport.len();
        let mut packet = vec![0u8; total_length];
        packet[0] = 0x45;
        packet[2..4].copy_from_slice(&(total_length as u16).to_be_bytes());
        packet[4..6].copy_from_slice(&0x1234u16.to_be_bytes());
        packet[8] = ttl;
        packet[9] = protocol.to_u8();
        packet[12..16].copy_from_slice(&src.octets());
        packet[16..20].copy_from_slice(&dst.octets());
        packet[IPV4_HEADER_LEN..].copy_from_slice(transport);
        fill_ip_header_checksum(&mut packet);
        fill_transport_checksum_v4(&mut packet, protocol);
        packet
    }

    pub fn build_udp(src_port: u16, dst_port: u16, payload: &[u8]) -> Vec<u8> {
        let udp_length = UDP_HEADER_LEN + payload.len();
        let mut udp = vec![0u8; udp_length];
        udp[0..2].copy_from_slice(&src_port.to_be_bytes());
        udp[2..4].copy_from_slice(&dst_port.to_be_bytes());
        udp[4..6].copy_from_slice(&(udp_length as u16).to_be_bytes());
        udp[UDP_HEADER_LEN..].copy_from_slice(payload);
        udp
    }

    pub fn build_tcp(src_port: u16, dst_port: u16, payload: &[u8]) -> Vec<u8> {
        let mut tcp = vec![0u8; TCP_HEADER_LEN + payload.len()];
        tcp[0..2].copy_from_slice(&src_port.to_be_bytes());
        tcp[2..4].copy_from_slice(&dst_port.to_be_bytes());
        tcp[4..8].copy_from_slice(&0x01020304u32.to_be_bytes());
        tcp[12] = 0x50;
        tcp[13] = 0x18;
        tcp[14..16].copy_from_slice(&8192u16.to_be_bytes());
        tcp[TCP_HEADER_LEN..].copy_from_slice(payload);
        tcp
    }

    pub fn build_icmp_echo(icmp_type: u8, identifier: u16, sequence: u16) -> Vec<u8> {
        let mut icmp = vec![0u8; ICMP_ECHO_HEADER_LEN + 4];
        icmp[0] = icmp_type;
        icmp[4..6].copy_from_slice(&identifier.to_be_bytes());
        icmp[6..8].copy_from_slice(&sequence.to_be_bytes());
        icmp[8..].copy_from_slice(b"ping");
        icmp
    }

    #[test]
    fn parse_ipv6_udp() {
        let src = "fd00::1".parse().unwrap();
        let dst = "::ffff:93.184.216.34".parse().unwrap();
        let packet = build_ipv6_packet(
            src,
            dst,
            TransportProtocolType::UDP,
            64,
            &build_udp(5000, 7000, b"hello"),
        );
        let parsed = Ipv6Packet::from_data(&packet).unwrap();
        assert_eq!(parsed.src_addr(), src);
        assert_eq!(parsed.dst_addr(), dst);
        assert_eq!(parsed.hop_limit(), 64);
        assert_eq!(parsed.payload_length(), 13);
        assert_eq!(parsed.transport_protocol(), TransportProtocolType::UDP);
        assert_eq!(parsed.transport_data().src_port(), Some(5000));
        assert_eq!(parsed.transport_data().dst_port(), Some(7000));
        assert!(parsed.validate_transport_checksum());
        assert_eq!(
            parsed.to_string(),
            "IPv6 UDP [fd00::1]:5000 -> [::ffff:93.184.216.34]:7000 L=13 H=64"
        );
    }

    #[test]
    fn ipv6_trailing_bytes_are_ignored() {
        let src = "fd00::1".parse().unwrap();
        let dst = "fd00::2".parse().unwrap();
        let mut packet = build_ipv6_packet(
            src,
            dst,
            TransportProtocolType::UDP,
            64,
            &build_udp(5000, 7000, b"hi"),
        );
        packet.extend_from_slice(&[0xaa; 6]);
        let parsed = Ipv6Packet::from_data(&packet).unwrap();
        assert_eq!(parsed.transport_data().full_data().len(), 10);
        assert!(parsed.validate_transport_checksum());
    }

    #[test]
    fn ipv6_truncated() {
        assert!(matches!(
            Ipv6Packet::from_data(&[0x60; 39]),
            Err(IpError::Truncated(_))
        ));
        let src = "fd00::1".parse().unwrap();
        let dst = "fd00::2".parse().unwrap();
        let packet = build_ipv6_packet(
            src,
            dst,
            TransportProtocolType::UDP,
            64,
            &build_udp(5000, 7000, b"hello"),
        );
        assert!(matches!(
            Ipv6Packet::from_data(&packet[..packet.len() - 1]),
            Err(IpError::Truncated(_))
        ));
    }

    #[test]
    fn ipv6_extension_headers_are_unsupported() {
        let src = "fd00::1".parse().unwrap();
        let dst = "fd00::2".parse().unwrap();
        let mut packet = build_ipv6_packet(
            src,
            dst,
            TransportProtocolType::UDP,
            64,
            &build_udp(5000, 7000, b"hello"),
        );
        // Hop-by-hop options.
        packet[6] = 0;
        assert!(matches!(
            Ipv6Packet::from_data(&packet),
            Err(IpError::Unsupported(_))
        ));
    }

    #[test]
    fn parse_ipv4_tcp() {
        let src = Ipv4Addr::new(203, 0, 113, 5);
        let dst = Ipv4Addr::new(10, 0, 0, 2);
        let packet = build_ipv4_packet(
            src,
            dst,
            TransportProtocolType::TCP,
            57,
            &build_tcp(443, 50000, b"data"),
        );
        let parsed = Ipv4Packet::from_data(&packet).unwrap();
        assert_eq!(parsed.src_addr(), src);
        assert_eq!(parsed.dst_addr(), dst);
        assert_eq!(parsed.ttl(), 57);
        assert_eq!(parsed.identification(), 0x1234);
        assert_eq!(parsed.total_length(), 44);
        assert_eq!(parsed.transport_data().src_port(), Some(443));
        assert_eq!(parsed.transport_data().dst_port(), Some(50000));
        assert!(parsed.validate_ip_checksum());
        assert!(parsed.validate_transport_checksum());
    }

    #[test]
    fn ipv4_fragments_are_unsupported() {
        let src = Ipv4Addr::new(203, 0, 113, 5);
        let dst = Ipv4Addr::new(10, 0, 0, 2);
        let mut packet = build_ipv4_packet(
            src,
            dst,
            TransportProtocolType::UDP,
            64,
            &build_udp(53, 40000, b"answer"),
        );
        // More fragments flag.
        packet[6] = 0x20;
        assert!(matches!(
            Ipv4Packet::from_data(&packet),
            Err(IpError::Unsupported(_))
        ));
    }

    #[test]
    fn ipv4_header_only_is_truncated() {
        let src = Ipv4Addr::new(203, 0, 113, 5);
        let dst = Ipv4Addr::new(10, 0, 0, 2);
        let mut packet = build_ipv4_packet(
            src,
            dst,
            TransportProtocolType::UDP,
            64,
            &build_udp(53, 40000, b""),
        );
        packet.truncate(IPV4_HEADER_LEN);
        packet[2..4].copy_from_slice(&(IPV4_HEADER_LEN as u16).to_be_bytes());
        assert!(matches!(
            Ipv4Packet::from_data(&packet),
            Err(IpError::Truncated(_))
        ));
    }

    #[test]
    fn udp_length_shorter_than_header() {
        let src = Ipv4Addr::new(203, 0, 113, 5);
        let dst = Ipv4Addr::new(10, 0, 0, 2);
        let mut udp = build_udp(53, 40000, b"abc");
        udp[4..6].copy_from_slice(&4u16.to_be_bytes());
        let packet = build_ipv4_packet(src, dst, TransportProtocolType::UDP, 64, &udp);
        assert!(matches!(
            Ipv4Packet::from_data(&packet),
            Err(IpError::Truncated(_))
        ));
    }
}
