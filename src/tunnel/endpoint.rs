use std::{fmt, net::Ipv6Addr};

use crate::ip::IpError;

pub const ENDPOINT_BLOCK_LEN: usize = 36;

/// Byte order of the source port inside the endpoint block.
///
/// The destination port is always in network byte order.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum PortByteOrder {
    /// Source port stored little-endian, reversed relative to the rest of
    /// the packet.
    #[default]
    ReversedSource,
    /// Both ports in network byte order.
    Network,
}

impl PortByteOrder {
    fn encode_src_port(&self, port: u16) -> [u8; 2] {
        match self {
            Self::ReversedSource => port.to_le_bytes(),
            Self::Network => port.to_be_bytes(),
        }
    }

    fn decode_src_port(&self, data: [u8; 2]) -> u16 {
        match self {
            Self::ReversedSource => u16::from_le_bytes(data),
            Self::Network => u16::from_be_bytes(data),
        }
    }
}

impl fmt::Display for PortByteOrder {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Self::ReversedSource => f.write_str("reversed"),
            Self::Network => f.write_str("network"),
        }
    }
}

/// Original IPv6 endpoints of a tunneled flow.
///
/// Layout: source address (16), source port (2), destination address (16),
/// destination port (2).
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct EndpointBlock {
    pub src_addr: Ipv6Addr,
    pub src_port: u16,
    pub dst_addr: Ipv6Addr,
    pub dst_port: u16,
}

impl EndpointBlock {
    pub fn from_data(data: &[u8], order: PortByteOrder) -> Result<EndpointBlock, IpError> {
        if data.len() < ENDPOINT_BLOCK_LEN {
            return Err(IpError::Truncated("Not enough data for endpoint block"));
        }
        let mut src_addr = [0u8; 16];
        src_addr.copy_from_slice(&data[0..16]);
        let mut src_port = [0u8; 2];
        src_port.copy_from_slice(&data[16..18]);
        let mut dst_addr = [0u8; 16];
        dst_addr.copy_from_slice(&data[18..34]);
        let mut dst_port = [0u8; 2];
        dst_port.copy_from_slice(&data[34..36]);
        Ok(EndpointBlock {
            src_addr: Ipv6Addr::from(src_addr),
            src_port: order.decode_src_port(src_port),
            dst_addr: Ipv6Addr::from(dst_addr),
            dst_port: u16::from_be_bytes(dst_port),
        })
    }

    pub fn write_to(&self, dest: &mut [u8], order: PortByteOrder) -> Result<(), IpError> {
        if dest.len() < ENDPOINT_BLOCK_LEN {
            return Err(IpError::Truncated("Not enough space for endpoint block"));
        }
        dest[0..16].copy_from_slice(&self.src_addr.octets());
        dest[16..18].copy_from_slice(&order.encode_src_port(self.src_port));
        dest[18..34].copy_from_slice(&self.dst_addr.octets());
        dest[34..36].copy_from_slice(&self.dst_port.to_be_bytes());
        Ok(())
    }
}

impl fmt::Display for EndpointBlock {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(
            f,
            "[{}]:{} -> [{}]:{}",
            self.src_addr, self.src_port, self.dst_addr, self.dst_port
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn block() -> EndpointBlock {
        EndpointBlock {
            src_addr: "fd00::1".parse().unwrap(),
            src_port: 0x1388,
            dst_addr: "::ffff:93.184.216.34".parse().unwrap(),
            dst_port: 0x1b58,
        }
    }

    #[test]
    fn default_order_reverses_source_port() {
        let mut data = [0u8; ENDPOINT_BLOCK_LEN];
        block()
            .write_to(&mut data, PortByteOrder::default())
            .unwrap();
        assert_eq!(&data[0..16], &block().src_addr.octets());
        assert_eq!(&data[16..18], &[0x88, 0x13]);
        assert_eq!(&data[18..34], &block().dst_addr.octets());
        assert_eq!(&data[34..36], &[0x1b, 0x58]);
        assert_eq!(
            EndpointBlock::from_data(&data, PortByteOrder::ReversedSource).unwrap(),
            block()
        );
        assert_eq!(
            EndpointBlock::from_data(&data, PortByteOrder::Network)
                .unwrap()
                .src_port,
            0x8813
        );
    }

    #[test]
    fn network_order_layout() {
        let mut data = [0u8; ENDPOINT_BLOCK_LEN];
        block().write_to(&mut data, PortByteOrder::Network).unwrap();
        assert_eq!(&data[16..18], &[0x13, 0x88]);
        assert_eq!(&data[34..36], &[0x1b, 0x58]);
        assert_eq!(
            EndpointBlock::from_data(&data, PortByteOrder::Network).unwrap(),
            block()
        );
    }

    #[test]
    fn short_buffers() {
        let mut data = [0u8; ENDPOINT_BLOCK_LEN - 1];
        assert!(block().write_to(&mut data, PortByteOrder::default()).is_err());
        assert!(EndpointBlock::from_data(&data, PortByteOrder::default()).is_err());
    }

    #[test]
    fn display() {
        assert_eq!(
            block().to_string(),
            "[fd00::1]:5000 -> [::ffff:93.184.216.34]:7000"
        );
    }
}
