//! Stateless header translation between IPv6 and IPv4.
//!
//! Both directions copy the transport segment into the output buffer, rewrite
//! the IP header in front of it and recompute every checksum over the final
//! bytes. Nothing is written to the output buffer before all validation that
//! doesn't depend on the copied payload has passed.

use std::{error, fmt, net::Ipv4Addr};

use log::{trace, warn};

use crate::{context::TranslationContext, dns64::Dns64Rewriter};

use super::{
    fill_ip_header_checksum, fill_transport_checksum_v4, fill_transport_checksum_v6,
    icmp::{IcmpV4Message, IcmpV6Message},
    IpError, Ipv4Packet, Ipv6Packet, TransportData, TransportProtocolType, DNS_PORT,
    IPV4_HEADER_LEN, IPV6_ALL_NODES, IPV6_HEADER_LEN, UDP_HEADER_LEN,
};

/// Translates an IPv6 packet into `dest` as an IPv4 packet, returning the
/// IPv4 packet length.
pub fn translate_6to4(
    context: &TranslationContext,
    dns64: &dyn Dns64Rewriter,
    packet: &[u8],
    dest: &mut [u8],
) -> Result<usize, DropReason> {
    let packet = Ipv6Packet::from_data(packet)?;
    if !packet.validate_transport_checksum() {
        warn!("Translating IPv6 packet with invalid transport checksum: {packet}");
    }
    let transport = packet.transport_data();
    let (protocol, icmp_type) = match transport {
        TransportData::Udp(_) => (TransportProtocolType::UDP, None),
        TransportData::Tcp(_) => (TransportProtocolType::TCP, None),
        TransportData::IcmpV6(data) => {
            let icmp = IcmpV6Message::from_data(data)?;
            match icmp.icmp_type().to_v4() {
                Some(icmp_type) => (TransportProtocolType::ICMP, Some(icmp_type.type_u8())),
                None => {
                    return Err(DropReason::UnsupportedProtocol(
                        "Only ICMPv6 echo messages can be translated",
                    ))
                }
            }
        }
        TransportData::IcmpV4(_) => {
            return Err(DropReason::UnsupportedProtocol(
                "ICMPv4 cannot be carried over IPv6",
            ))
        }
    };

    let dst_addr = context
        .nat64_prefix()
        .ipv6_to_ipv4(&packet.dst_addr())
        .ok_or(DropReason::AddressNotTranslatable(
            "IPv6 destination is outside of the NAT64 prefix",
        ))?;
    let src_addr = match context.host_address() {
        Some(host_address) => host_address,
        None if dst_addr.is_broadcast() => Ipv4Addr::UNSPECIFIED,
        None => {
            return Err(DropReason::HostUnconfigured(
                "Only broadcasts can be sent before the host address is configured",
            ))
        }
    };

    let transport_data = transport.full_data();
    let mut transport_length = transport_data.len();
    if IPV4_HEADER_LEN + transport_length > dest.len() {
        return Err(DropReason::OversizedResult(
            "Translated IPv4 packet exceeds the buffer",
        ));
    }
    dest[IPV4_HEADER_LEN..IPV4_HEADER_LEN + transport_length].copy_from_slice(transport_data);
    if let Some(icmp_type) = icmp_type {
        dest[IPV4_HEADER_LEN] = icmp_type;
    }
    if protocol == TransportProtocolType::UDP && transport.dst_port() == Some(DNS_PORT) {
        transport_length = rewrite_dns(
            &mut dest[IPV4_HEADER_LEN..],
            transport_length,
            |payload, len| dns64.rewrite_query(payload, len),
        )?;
    }
    let total_length = IPV4_HEADER_LEN + transport_length;
    if total_length > u16::MAX as usize {
        return Err(DropReason::OversizedResult(
            "Translated IPv4 packet exceeds the maximum IPv4 length",
        ));
    }

    let header = &mut dest[..IPV4_HEADER_LEN];
    header[0] = 0x45;
    header[1] = 0x00;
    header[2..4].copy_from_slice(&(total_length as u16).to_be_bytes());
    header[4..6].copy_from_slice(&context.next_ip_id().to_be_bytes());
    header[6..8].fill(0);
    header[8] = packet.hop_limit();
    header[9] = protocol.to_u8();
    header[10..12].fill(0);
    header[12..16].copy_from_slice(&src_addr.octets());
    header[16..20].copy_from_slice(&dst_addr.octets());

    let translated = &mut dest[..total_length];
    fill_ip_header_checksum(translated);
    fill_transport_checksum_v4(translated, protocol);
    if log::log_enabled!(log::Level::Trace) {
        if let Ok(translated) = Ipv4Packet::from_data(translated) {
            trace!("Translated {packet} to {translated}");
        }
    }
    Ok(total_length)
}

/// Translates an IPv4 packet into `dest` as an IPv6 packet, returning the
/// IPv6 packet length.
pub fn translate_4to6(
    context: &TranslationContext,
    dns64: &dyn Dns64Rewriter,
    packet: &[u8],
    dest: &mut [u8],
) -> Result<usize, DropReason> {
    let packet = Ipv4Packet::from_data(packet)?;
    if !packet.validate_ip_checksum() {
        warn!("Translating IPv4 packet with invalid header checksum: {packet}");
    }
    if !packet.validate_transport_checksum() {
        warn!("Translating IPv4 packet with invalid transport checksum: {packet}");
    }
    let transport = packet.transport_data();
    let (protocol, icmp_type) = match transport {
        TransportData::Udp(_) => (TransportProtocolType::UDP, None),
        TransportData::Tcp(_) => (TransportProtocolType::TCP, None),
        TransportData::IcmpV4(data) => {
            let icmp = IcmpV4Message::from_data(data)?;
            match icmp.icmp_type().to_v6() {
                Some(icmp_type) => (TransportProtocolType::IPV6_ICMP, Some(icmp_type.type_u8())),
                None => {
                    return Err(DropReason::UnsupportedProtocol(
                        "Only ICMPv4 echo requests can be translated",
                    ))
                }
            }
        }
        TransportData::IcmpV6(_) => {
            return Err(DropReason::UnsupportedProtocol(
                "ICMPv6 cannot be carried over IPv4",
            ))
        }
    };

    let transport_data = transport.full_data();
    let mut transport_length = transport_data.len();
    if IPV6_HEADER_LEN + transport_length > dest.len() {
        return Err(DropReason::OversizedResult(
            "Translated IPv6 packet exceeds the buffer",
        ));
    }

    let src_addr = context.nat64_prefix().ipv4_to_ipv6(packet.src_addr());
    let dst_addr = if context.is_broadcast(packet.dst_addr()) {
        IPV6_ALL_NODES
    } else {
        let host_address = context.host_address().ok_or(DropReason::HostUnconfigured(
            "Host address is not configured",
        ))?;
        if packet.dst_addr() != host_address {
            return Err(DropReason::AddressNotTranslatable(
                "IPv4 destination doesn't match the host address",
            ));
        }
        match transport.dst_port() {
            Some(dst_port) if !context.is_local_port(dst_port) => {
                context.nat64_prefix().ipv4_to_ipv6(host_address)
            }
            _ => context
                .local_ipv6_address()
                .ok_or(DropReason::HostUnconfigured(
                    "Local IPv6 address is not configured",
                ))?,
        }
    };

    dest[IPV6_HEADER_LEN..IPV6_HEADER_LEN + transport_length].copy_from_slice(transport_data);
    if let Some(icmp_type) = icmp_type {
        dest[IPV6_HEADER_LEN] = icmp_type;
    }
    if protocol == TransportProtocolType::UDP && transport.src_port() == Some(DNS_PORT) {
        transport_length = rewrite_dns(
            &mut dest[IPV6_HEADER_LEN..],
            transport_length,
            |payload, len| dns64.rewrite_response(payload, len),
        )?;
    }
    let total_length = IPV6_HEADER_LEN + transport_length;

    write_ipv6_header(
        &mut dest[..IPV6_HEADER_LEN],
        transport_length,
        protocol,
        packet.ttl(),
        &src_addr.octets(),
        &dst_addr.octets(),
    )?;
    let translated = &mut dest[..total_length];
    fill_transport_checksum_v6(translated, protocol);
    if log::log_enabled!(log::Level::Trace) {
        if let Ok(translated) = Ipv6Packet::from_data(translated) {
            trace!("Translated {packet} to {translated}");
        }
    }
    Ok(total_length)
}

/// Writes a 40-byte IPv6 header with zero traffic class and flow label.
pub(crate) fn write_ipv6_header(
    header: &mut [u8],
    payload_length: usize,
    protocol: TransportProtocolType,
    hop_limit: u8,
    src_addr: &[u8; 16],
    dst_addr: &[u8; 16],
) -> Result<(), DropReason> {
    if payload_length > u16::MAX as usize {
        return Err(DropReason::OversizedResult(
            "IPv6 payload exceeds the maximum payload length",
        ));
    }
    header[0] = 0x60;
    header[1..4].fill(0);
    header[4..6].copy_from_slice(&(payload_length as u16).to_be_bytes());
    header[6] = protocol.to_u8();
    header[7] = hop_limit;
    header[8..24].copy_from_slice(src_addr);
    header[24..40].copy_from_slice(dst_addr);
    Ok(())
}

/// Passes the DNS message in a UDP datagram through `rewrite` and updates
/// the UDP length, returning the new UDP datagram length.
pub(crate) fn rewrite_dns<F>(
    udp: &mut [u8],
    udp_length: usize,
    rewrite: F,
) -> Result<usize, DropReason>
where
    F: FnOnce(&mut [u8], usize) -> usize,
{
    let payload = &mut udp[UDP_HEADER_LEN..];
    let payload_length = rewrite(payload, udp_length - UDP_HEADER_LEN);
    if payload_length > payload.len() {
        return Err(DropReason::OversizedResult(
            "DNS64 rewrite exceeds the buffer",
        ));
    }
    let udp_length = UDP_HEADER_LEN + payload_length;
    if udp_length > u16::MAX as usize {
        return Err(DropReason::OversizedResult(
            "DNS64 rewrite exceeds the maximum UDP length",
        ));
    }
    udp[4..6].copy_from_slice(&(udp_length as u16).to_be_bytes());
    Ok(udp_length)
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DropReason {
    TruncatedPacket(&'static str),
    UnsupportedProtocol(&'static str),
    AddressNotTranslatable(&'static str),
    HostUnconfigured(&'static str),
    OversizedResult(&'static str),
    WrongTunnelPeer(&'static str),
}

impl fmt::Display for DropReason {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Self::TruncatedPacket(msg) => write!(f, "Truncated packet: {msg}"),
            Self::UnsupportedProtocol(msg) => write!(f, "Unsupported protocol: {msg}"),
            Self::AddressNotTranslatable(msg) => write!(f, "Address not translatable: {msg}"),
            Self::HostUnconfigured(msg) => write!(f, "Host unconfigured: {msg}"),
            Self::OversizedResult(msg) => write!(f, "Oversized result: {msg}"),
            Self::WrongTunnelPeer(msg) => write!(f, "Wrong tunnel peer: {msg}"),
        }
    }
}

impl error::Error for DropReason {}

impl From<IpError> for DropReason {
    fn from(err: IpError) -> DropReason {
        match err {
            IpError::Truncated(msg) => Self::TruncatedPacket(msg),
            IpError::Unsupported(msg) | IpError::Internal(msg) => Self::UnsupportedProtocol(msg),
        }
    }
}
