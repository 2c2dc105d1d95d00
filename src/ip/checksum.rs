//! Internet checksum (RFC 1071) and the IPv4/IPv6 pseudo-header variants.
//!
//! All functions that produce a value to be stored in a packet return the
//! one's complement of the folded sum, and never return `0x0000`: an all-zero
//! field means "no checksum" for UDP, and `0xffff` is the equivalent
//! one's complement representation of zero.

use super::{TransportProtocolType, IPV6_HEADER_LEN};

#[derive(Clone, Copy)]
pub struct Checksum(u32);

impl Checksum {
    pub fn new() -> Checksum {
        Checksum(0)
    }

    pub fn with_seed(seed: u16) -> Checksum {
        Checksum(seed as u32)
    }

    #[inline]
    pub fn fold(&mut self) {
        let mut sum = self.0;
        // At most two adds are needed:
        // 0xffff + 0xffff = 0x1fffe, 0x1+0xfffe = ffff
        sum = (sum >> 16) + (sum & 0x0000ffffu32);
        sum = (sum >> 16) + (sum & 0x0000ffffu32);
        self.0 = sum;
    }

    pub fn add_slice(&mut self, add: &[u8]) {
        // Keep headroom for a full 64 KiB slice.
        self.fold();
        let mut iter = add.chunks_exact(2);
        let full_sum = iter
            .by_ref()
            .map(|bytes| ((bytes[0] as u32) << 8) | (bytes[1] as u32))
            .sum::<u32>();
        let remain_sum = match *iter.remainder() {
            [high] => (high as u32) << 8,
            _ => 0u32,
        };

        self.0 += full_sum + remain_sum;
    }

    /// Folded one's complement sum, not inverted.
    pub fn sum(&self) -> u16 {
        let mut folded = *self;
        folded.fold();
        (folded.0 & 0x0000ffff) as u16
    }

    /// Inverted sum, ready to be written into a checksum field.
    pub fn value(&self) -> u16 {
        match !self.sum() {
            0x0000 => 0xffff,
            checksum => checksum,
        }
    }
}

/// Adds `data` as big-endian 16-bit words to `seed` using end-around carry.
/// An odd trailing byte is padded with a zero low byte.
pub fn checksum(seed: u16, data: &[u8]) -> u16 {
    let mut checksum = Checksum::with_seed(seed);
    checksum.add_slice(data);
    checksum.sum()
}

/// Checksum value for an IPv4 header whose checksum field is zeroed.
pub fn ip_header_checksum(header: &[u8]) -> u16 {
    let mut checksum = Checksum::new();
    checksum.add_slice(header);
    checksum.value()
}

fn ipv4_header_length(packet: &[u8]) -> usize {
    (packet[0] & 0x0f) as usize * 4
}

fn ipv4_pseudo_checksum(
    packet: &[u8],
    protocol: TransportProtocolType,
    transport_length: usize,
) -> Checksum {
    let mut checksum = Checksum::new();
    if protocol == TransportProtocolType::ICMP {
        // ICMPv4 doesn't include IPv4 pseudoheaders.
        return checksum;
    }
    checksum.add_slice(&packet[12..20]);
    checksum.add_slice(&[0u8, protocol.to_u8()]);
    checksum.add_slice(&(transport_length as u16).to_be_bytes());
    checksum
}

fn ipv6_pseudo_checksum(
    packet: &[u8],
    protocol: TransportProtocolType,
    transport_length: usize,
) -> Checksum {
    let mut checksum = Checksum::new();
    checksum.add_slice(&packet[8..40]);
    checksum.add_slice(&(transport_length as u32).to_be_bytes());
    checksum.add_slice(&[0u8, 0u8, 0u8, protocol.to_u8()]);
    checksum
}

/// Checksum value for the transport segment of an IPv4 packet.
///
/// `packet` must end at the last valid byte of the packet, and the transport
/// checksum field must already be zeroed.
pub fn transport_checksum_v4(packet: &[u8], protocol: TransportProtocolType) -> u16 {
    let transport = &packet[ipv4_header_length(packet)..];
    let mut checksum = ipv4_pseudo_checksum(packet, protocol, transport.len());
    checksum.add_slice(transport);
    checksum.value()
}

/// Checksum value for the transport segment of an IPv6 packet without
/// extension headers.
///
/// `packet` must end at the last valid byte of the packet, and the transport
/// checksum field must already be zeroed.
pub fn transport_checksum_v6(packet: &[u8], protocol: TransportProtocolType) -> u16 {
    let transport = &packet[IPV6_HEADER_LEN..];
    let mut checksum = ipv6_pseudo_checksum(packet, protocol, transport.len());
    checksum.add_slice(transport);
    checksum.value()
}

/// Zeroes and recomputes the IPv4 header checksum in place.
pub fn fill_ip_header_checksum(packet: &mut [u8]) {
    let header_length = ipv4_header_length(packet);
    packet[10..12].fill(0);
    let checksum = ip_header_checksum(&packet[..header_length]);
    packet[10..12].copy_from_slice(&checksum.to_be_bytes());
}

/// Zeroes and recomputes the transport checksum of an IPv4 packet in place.
pub fn fill_transport_checksum_v4(packet: &mut [u8], protocol: TransportProtocolType) {
    let offset = ipv4_header_length(packet) + protocol.checksum_offset();
    packet[offset..offset + 2].fill(0);
    let checksum = transport_checksum_v4(packet, protocol);
    packet[offset..offset + 2].copy_from_slice(&checksum.to_be_bytes());
}

/// Zeroes and recomputes the transport checksum of an IPv6 packet in place.
pub fn fill_transport_checksum_v6(packet: &mut [u8], protocol: TransportProtocolType) {
    let offset = IPV6_HEADER_LEN + protocol.checksum_offset();
    packet[offset..offset + 2].fill(0);
    let checksum = transport_checksum_v6(packet, protocol);
    packet[offset..offset + 2].copy_from_slice(&checksum.to_be_bytes());
}

pub fn validate_ip_header(header: &[u8]) -> bool {
    checksum(0, header) == 0xffff
}

pub fn validate_transport_v4(packet: &[u8], protocol: TransportProtocolType) -> bool {
    let transport = &packet[ipv4_header_length(packet)..];
    let offset = protocol.checksum_offset();
    if protocol == TransportProtocolType::UDP && transport[offset..offset + 2] == [0, 0] {
        // UDP over IPv4 may omit the checksum.
        return true;
    }
    let mut checksum = ipv4_pseudo_checksum(packet, protocol, transport.len());
    checksum.add_slice(transport);
    checksum.sum() == 0xffff
}

pub fn validate_transport_v6(packet: &[u8], protocol: TransportProtocolType) -> bool {
    let transport = &packet[IPV6_HEADER_LEN..];
    let mut checksum = ipv6_pseudo_checksum(packet, protocol, transport.len());
    checksum.add_slice(transport);
    checksum.sum() == 0xffff
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn zero_buffer_sums_to_zero() {
        for len in [0usize, 1, 2, 7, 20, 1500] {
            assert_eq!(checksum(0, &vec![0u8; len]), 0);
        }
    }

    #[test]
    fn odd_trailing_byte_is_padded() {
        assert_eq!(checksum(0, &[0x01, 0x02, 0x03]), 0x0402);
        assert_eq!(checksum(0, &[0xab]), 0xab00);
    }

    #[test]
    fn end_around_carry() {
        assert_eq!(checksum(0, &[0xff, 0xff, 0x00, 0x01]), 0x0001);
        assert_eq!(checksum(0xffff, &[0xff, 0xff]), 0xffff);
        assert_eq!(checksum(0x0001, &[0xff, 0xfe]), 0xffff);
    }

    #[test]
    fn seed_is_accumulated() {
        let data = [0x12, 0x34, 0x56, 0x78];
        let partial = checksum(0, &data[..2]);
        assert_eq!(checksum(partial, &data[2..]), checksum(0, &data));
    }

    #[test]
    fn word_order_does_not_matter() {
        let a = [0x12, 0x34, 0xab, 0xcd, 0x00, 0x01];
        let b = [0x00, 0x01, 0x12, 0x34, 0xab, 0xcd];
        assert_eq!(checksum(0, &a), checksum(0, &b));
    }

    #[test]
    fn known_ipv4_header() {
        // Example from RFC 1071 discussions, checksum is 0xb861.
        let mut header = [
            0x45, 0x00, 0x00, 0x73, 0x00, 0x00, 0x40, 0x00, 0x40, 0x11, 0x00, 0x00, 0xc0, 0xa8,
            0x00, 0x01, 0xc0, 0xa8, 0x00, 0xc7,
        ];
        assert_eq!(ip_header_checksum(&header), 0xb861);
        fill_ip_header_checksum(&mut header);
        assert_eq!(&header[10..12], &[0xb8, 0x61]);
        assert!(validate_ip_header(&header));
    }

    #[test]
    fn refilled_header_sums_to_ffff() {
        let mut header = [
            0x45, 0x00, 0x00, 0x1c, 0x12, 0x34, 0x00, 0x00, 0x40, 0x01, 0xde, 0xad, 0x0a, 0x00,
            0x00, 0x02, 0x08, 0x08, 0x08, 0x08,
        ];
        assert!(!validate_ip_header(&header));
        fill_ip_header_checksum(&mut header);
        assert_eq!(checksum(0, &header), 0xffff);
    }

    #[test]
    fn all_zero_data_never_emits_zero() {
        assert_eq!(ip_header_checksum(&[0u8; 20]), 0xffff);
        // Sum of 0xffff inverts to 0, which is emitted as 0xffff.
        assert_eq!(ip_header_checksum(&[0xff, 0xff]), 0xffff);
    }

    #[test]
    fn udp_over_ipv4() {
        let mut packet = vec![
            0x45, 0x00, 0x00, 0x21, 0x00, 0x01, 0x00, 0x00, 0x40, 0x11, 0x00, 0x00, 0x0a, 0x00,
            0x00, 0x02, 0xc6, 0x33, 0x64, 0x01, // IPv4 header
            0x13, 0x88, 0x23, 0x28, 0x00, 0x0d, 0x00, 0x00, // UDP header
            b'h', b'e', b'l', b'l', b'o',
        ];
        fill_ip_header_checksum(&mut packet);
        fill_transport_checksum_v4(&mut packet, TransportProtocolType::UDP);
        assert!(validate_transport_v4(&packet, TransportProtocolType::UDP));
        packet[30] ^= 0x01;
        assert!(!validate_transport_v4(&packet, TransportProtocolType::UDP));
    }

    #[test]
    fn udp_without_checksum_is_valid_over_ipv4() {
        let packet = [
            0x45, 0x00, 0x00, 0x1c, 0x00, 0x01, 0x00, 0x00, 0x40, 0x11, 0x00, 0x00, 0x0a, 0x00,
            0x00, 0x02, 0xc6, 0x33, 0x64, 0x01, 0x00, 0x44, 0x00, 0x43, 0x00, 0x08, 0x00, 0x00,
        ];
        assert!(validate_transport_v4(&packet, TransportProtocolType::UDP));
    }

    #[test]
    fn icmpv4_has_no_pseudo_header() {
        let mut packet = vec![
            0x45, 0x00, 0x00, 0x1c, 0x00, 0x01, 0x00, 0x00, 0x40, 0x01, 0x00, 0x00, 0x0a, 0x00,
            0x00, 0x02, 0xc6, 0x33, 0x64, 0x01, // IPv4 header
            0x08, 0x00, 0x00, 0x00, 0x12, 0x34, 0x00, 0x01, // Echo request
        ];
        fill_transport_checksum_v4(&mut packet, TransportProtocolType::ICMP);
        assert_eq!(checksum(0, &packet[20..]), 0xffff);
        // Changing addresses must not affect an ICMPv4 checksum.
        packet[12] = 0x0b;
        assert!(validate_transport_v4(&packet, TransportProtocolType::ICMP));
    }

    #[test]
    fn icmpv6_includes_pseudo_header() {
        let mut packet = vec![0u8; 48];
        packet[0] = 0x60;
        packet[4..6].copy_from_slice(&8u16.to_be_bytes());
        packet[6] = TransportProtocolType::IPV6_ICMP.to_u8();
        packet[7] = 64;
        packet[8..24].copy_from_slice(&"fd00::1".parse::<std::net::Ipv6Addr>().unwrap().octets());
        packet[24..40].copy_from_slice(&"fd00::2".parse::<std::net::Ipv6Addr>().unwrap().octets());
        packet[40] = 128;
        packet[44..48].copy_from_slice(&[0x12, 0x34, 0x00, 0x01]);
        fill_transport_checksum_v6(&mut packet, TransportProtocolType::IPV6_ICMP);
        assert!(validate_transport_v6(&packet, TransportProtocolType::IPV6_ICMP));
        packet[23] = 0x03;
        assert!(!validate_transport_v6(&packet, TransportProtocolType::IPV6_ICMP));
    }
}
