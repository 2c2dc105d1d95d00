//! Tunnel framing on top of NAT64 translation.
//!
//! Flows with a port below the ephemeral threshold are translated as plain
//! NAT64 packets. All other flows share a single outer UDP flow between the
//! host and the remote tunnel endpoint; every tunneled datagram carries an
//! [`EndpointBlock`] right after the outer UDP header, which lets the far
//! side restore the original IPv6 endpoints. TCP segments and ICMP echoes
//! get a new outer UDP header; their protocol travels in the DSCP bits of
//! the outer IPv4 header.

use std::sync::{PoisonError, RwLock, RwLockReadGuard};

use log::{debug, trace, warn};

use crate::{
    context::TranslationContext,
    dns64::{Dns64Rewriter, PassthroughDns64},
    ip::{
        fill_ip_header_checksum, fill_transport_checksum_v4, fill_transport_checksum_v6,
        icmp::IcmpV4Message,
        translate::{rewrite_dns, translate_4to6, translate_6to4, write_ipv6_header},
        Ipv4Packet, Ipv6Packet, TransportData, TransportProtocolType, DNS_PORT,
        IPV4_HEADER_LEN, IPV6_HEADER_LEN, UDP_HEADER_LEN,
    },
};

mod endpoint;

pub use crate::ip::translate::DropReason;
pub use endpoint::{EndpointBlock, PortByteOrder, ENDPOINT_BLOCK_LEN};

pub struct Tunnel {
    context: RwLock<TranslationContext>,
    dns64: Box<dyn Dns64Rewriter>,
}

impl Tunnel {
    pub fn new(context: TranslationContext) -> Tunnel {
        Tunnel::with_dns64(context, Box::new(PassthroughDns64::default()))
    }

    pub fn with_dns64(context: TranslationContext, dns64: Box<dyn Dns64Rewriter>) -> Tunnel {
        Tunnel {
            context: RwLock::new(context),
            dns64,
        }
    }

    /// Runs `f` with exclusive access to the context.
    ///
    /// Waits for in-flight translations to complete; translations started
    /// later will use the updated context.
    pub fn configure<F, R>(&self, f: F) -> R
    where
        F: FnOnce(&mut TranslationContext) -> R,
    {
        let mut context = self.context.write().unwrap_or_else(PoisonError::into_inner);
        f(&mut context)
    }

    pub fn context(&self) -> RwLockReadGuard<'_, TranslationContext> {
        self.context.read().unwrap_or_else(PoisonError::into_inner)
    }

    /// Converts an IPv6 packet from the segment into an IPv4 packet for the
    /// uplink. Returns 0 if the packet was dropped.
    pub fn encapsulate(&self, packet: &[u8], dest: &mut [u8]) -> usize {
        match self.try_encapsulate(packet, dest) {
            Ok(length) => length,
            Err(err) => {
                debug!("Dropping IPv6 packet: {err}");
                0
            }
        }
    }

    /// Converts an IPv4 packet from the uplink into an IPv6 packet for the
    /// segment. Returns 0 if the packet was dropped.
    pub fn decapsulate(&self, packet: &[u8], dest: &mut [u8]) -> usize {
        match self.try_decapsulate(packet, dest) {
            Ok(length) => length,
            Err(err) => {
                debug!("Dropping IPv4 packet: {err}");
                0
            }
        }
    }

    pub fn try_encapsulate(&self, packet: &[u8], dest: &mut [u8]) -> Result<usize, DropReason> {
        let context = self.context();
        let ipv6_packet = Ipv6Packet::from_data(packet)?;
        let transport = ipv6_packet.transport_data();
        if let Some(src_port) = transport.src_port() {
            if context.is_local_port(src_port) {
                return translate_6to4(&context, self.dns64.as_ref(), packet, dest);
            }
        }

        if !context.is_host_address_configured() {
            return Err(DropReason::HostUnconfigured(
                "Tunneled flows require a host address",
            ));
        }
        let block = EndpointBlock {
            src_addr: ipv6_packet.src_addr(),
            src_port: transport.src_port().unwrap_or(0),
            dst_addr: ipv6_packet.dst_addr(),
            dst_port: transport.dst_port().unwrap_or(0),
        };
        // UDP keeps its own header as the outer one, other protocols need a new one.
        let (segment_start, inserted_length) =
            if ipv6_packet.transport_protocol() == TransportProtocolType::UDP {
                (IPV4_HEADER_LEN + UDP_HEADER_LEN, ENDPOINT_BLOCK_LEN)
            } else {
                (IPV4_HEADER_LEN, UDP_HEADER_LEN + ENDPOINT_BLOCK_LEN)
            };
        if IPV4_HEADER_LEN + transport.full_data().len() + inserted_length > dest.len() {
            return Err(DropReason::OversizedResult(
                "Encapsulated packet exceeds the buffer",
            ));
        }

        let translated_length = translate_6to4(&context, self.dns64.as_ref(), packet, dest)?;
        let total_length = translated_length + inserted_length;
        if total_length > dest.len() || total_length > u16::MAX as usize {
            return Err(DropReason::OversizedResult(
                "Encapsulated packet exceeds the buffer",
            ));
        }
        dest.copy_within(
            segment_start..translated_length,
            segment_start + inserted_length,
        );
        let block_start = IPV4_HEADER_LEN + UDP_HEADER_LEN;
        block.write_to(
            &mut dest[block_start..block_start + ENDPOINT_BLOCK_LEN],
            context.endpoint_port_order(),
        )?;

        let tunnel_remote = context.tunnel_remote();
        let udp_length = (total_length - IPV4_HEADER_LEN) as u16;
        let udp = &mut dest[IPV4_HEADER_LEN..block_start];
        udp[0..2].copy_from_slice(&context.tunnel_local_port().to_be_bytes());
        udp[2..4].copy_from_slice(&tunnel_remote.port().to_be_bytes());
        udp[4..6].copy_from_slice(&udp_length.to_be_bytes());
        udp[6..8].fill(0);

        let header = &mut dest[..IPV4_HEADER_LEN];
        header[1] = protocol_marker(ipv6_packet.transport_protocol());
        header[2..4].copy_from_slice(&(total_length as u16).to_be_bytes());
        header[9] = TransportProtocolType::UDP.to_u8();
        header[16..20].copy_from_slice(&tunnel_remote.ip().octets());

        let encapsulated = &mut dest[..total_length];
        fill_ip_header_checksum(encapsulated);
        fill_transport_checksum_v4(encapsulated, TransportProtocolType::UDP);
        trace!("Encapsulated {block} to tunnel {tunnel_remote}");
        Ok(total_length)
    }

    pub fn try_decapsulate(&self, packet: &[u8], dest: &mut [u8]) -> Result<usize, DropReason> {
        let context = self.context();
        let ipv4_packet = Ipv4Packet::from_data(packet)?;
        let transport = ipv4_packet.transport_data();
        match transport.dst_port() {
            Some(dst_port) if !context.is_local_port(dst_port) => {}
            _ => return translate_4to6(&context, self.dns64.as_ref(), packet, dest),
        }

        if ipv4_packet.transport_protocol() != TransportProtocolType::UDP {
            return Err(DropReason::UnsupportedProtocol(
                "Only UDP can carry tunneled flows",
            ));
        }
        let tunnel_remote = context.tunnel_remote();
        if ipv4_packet.src_addr() != *tunnel_remote.ip() {
            return Err(DropReason::WrongTunnelPeer(
                "Source address doesn't match the tunnel endpoint",
            ));
        }
        if transport.src_port() != Some(tunnel_remote.port()) {
            return Err(DropReason::WrongTunnelPeer(
                "Source port doesn't match the tunnel endpoint",
            ));
        }
        if !ipv4_packet.validate_ip_checksum() {
            warn!("Decapsulating IPv4 packet with invalid header checksum: {ipv4_packet}");
        }
        if !ipv4_packet.validate_transport_checksum() {
            warn!("Decapsulating IPv4 packet with invalid transport checksum: {ipv4_packet}");
        }
        let protocol = inner_protocol(ipv4_packet.dscp())?;

        let outer_udp = transport.full_data();
        let block =
            EndpointBlock::from_data(&outer_udp[UDP_HEADER_LEN..], context.endpoint_port_order())?;
        let inner = &outer_udp[UDP_HEADER_LEN + ENDPOINT_BLOCK_LEN..];
        let mut transport_length = if protocol == TransportProtocolType::UDP {
            UDP_HEADER_LEN + inner.len()
        } else {
            inner.len()
        };
        if IPV6_HEADER_LEN + transport_length > dest.len() {
            return Err(DropReason::OversizedResult(
                "Decapsulated packet exceeds the buffer",
            ));
        }

        let segment = &mut dest[IPV6_HEADER_LEN..];
        match protocol {
            TransportProtocolType::UDP => {
                segment[0..2].copy_from_slice(&block.src_port.to_be_bytes());
                segment[2..4].copy_from_slice(&block.dst_port.to_be_bytes());
                segment[4..6].copy_from_slice(&(transport_length as u16).to_be_bytes());
                segment[6..8].fill(0);
                segment[UDP_HEADER_LEN..transport_length].copy_from_slice(inner);
                if block.src_port == DNS_PORT {
                    transport_length = rewrite_dns(segment, transport_length, |payload, len| {
                        self.dns64.rewrite_response(payload, len)
                    })?;
                }
            }
            TransportProtocolType::TCP => {
                TransportData::from_data(TransportProtocolType::TCP, inner)?;
                segment[..transport_length].copy_from_slice(inner);
                segment[0..2].copy_from_slice(&block.src_port.to_be_bytes());
                segment[2..4].copy_from_slice(&block.dst_port.to_be_bytes());
            }
            _ => {
                let icmp = IcmpV4Message::from_data(inner)?;
                let icmp_type = icmp.icmp_type().echo_to_v6().ok_or(
                    DropReason::UnsupportedProtocol("Only ICMP echo messages can be tunneled"),
                )?;
                segment[..transport_length].copy_from_slice(inner);
                segment[0] = icmp_type.type_u8();
            }
        }

        write_ipv6_header(
            &mut dest[..IPV6_HEADER_LEN],
            transport_length,
            protocol,
            ipv4_packet.ttl(),
            &block.src_addr.octets(),
            &block.dst_addr.octets(),
        )?;
        let total_length = IPV6_HEADER_LEN + transport_length;
        fill_transport_checksum_v6(&mut dest[..total_length], protocol);
        trace!("Decapsulated {protocol} {block} from tunnel {tunnel_remote}");
        Ok(total_length)
    }
}

/// Marks the IPv6 next header of a tunneled segment in the DSCP bits of the
/// outer IPv4 header. UDP flows keep a zero type of service.
fn protocol_marker(protocol: TransportProtocolType) -> u8 {
    if protocol == TransportProtocolType::UDP {
        0
    } else {
        protocol.to_u8() << 2
    }
}

fn inner_protocol(dscp: u8) -> Result<TransportProtocolType, DropReason> {
    match dscp {
        0 => Ok(TransportProtocolType::UDP),
        dscp => match TransportProtocolType::from_u8(dscp) {
            protocol @ (TransportProtocolType::TCP | TransportProtocolType::IPV6_ICMP) => {
                Ok(protocol)
            }
            _ => Err(DropReason::UnsupportedProtocol(
                "Unknown protocol marker in tunneled packet",
            )),
        },
    }
}
