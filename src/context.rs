use std::{
    error, fmt,
    net::{Ipv4Addr, Ipv6Addr, SocketAddrV4},
    sync::atomic::{AtomicU16, Ordering},
};

use log::info;

use crate::{
    ip::{IpError, Nat64Prefix},
    tunnel::PortByteOrder,
};

pub const DEFAULT_EPHEMERAL_THRESHOLD: u16 = 1024;
pub const DEFAULT_TUNNEL_PORT: u16 = 9000;

#[derive(Clone, Debug)]
pub struct ContextConfig {
    pub host_address: Option<(Ipv4Addr, Ipv4Addr)>,
    pub default_router: Ipv4Addr,
    pub local_ipv6_address: Option<Ipv6Addr>,
    pub tunnel_remote: SocketAddrV4,
    pub tunnel_local_port: u16,
    pub nat64_prefix: Nat64Prefix,
    pub ephemeral_threshold: u16,
    pub endpoint_port_order: PortByteOrder,
}

impl Default for ContextConfig {
    fn default() -> ContextConfig {
        ContextConfig {
            host_address: None,
            default_router: Ipv4Addr::UNSPECIFIED,
            local_ipv6_address: None,
            tunnel_remote: SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, DEFAULT_TUNNEL_PORT),
            tunnel_local_port: DEFAULT_TUNNEL_PORT,
            nat64_prefix: Nat64Prefix::default(),
            ephemeral_threshold: DEFAULT_EPHEMERAL_THRESHOLD,
            endpoint_port_order: PortByteOrder::default(),
        }
    }
}

/// Addressing state shared by all translations.
///
/// Setters require exclusive access; translations only read the context,
/// except for the IP identification counter which is atomic.
pub struct TranslationContext {
    host_address: Option<Ipv4Addr>,
    netmask: Ipv4Addr,
    default_router: Ipv4Addr,
    tunnel_remote_address: Ipv4Addr,
    tunnel_remote_port: u16,
    tunnel_local_port: u16,
    local_ipv6_address: Option<Ipv6Addr>,
    nat64_prefix: Nat64Prefix,
    ephemeral_threshold: u16,
    endpoint_port_order: PortByteOrder,
    ip_id: AtomicU16,
}

impl TranslationContext {
    pub fn new(config: ContextConfig) -> TranslationContext {
        let (host_address, netmask) = match config.host_address {
            Some((addr, netmask)) => (Some(addr), netmask),
            None => (None, Ipv4Addr::UNSPECIFIED),
        };
        TranslationContext {
            host_address,
            netmask,
            default_router: config.default_router,
            tunnel_remote_address: *config.tunnel_remote.ip(),
            tunnel_remote_port: config.tunnel_remote.port(),
            tunnel_local_port: config.tunnel_local_port,
            local_ipv6_address: config.local_ipv6_address,
            nat64_prefix: config.nat64_prefix,
            ephemeral_threshold: config.ephemeral_threshold,
            endpoint_port_order: config.endpoint_port_order,
            ip_id: AtomicU16::new(rand::random()),
        }
    }

    pub fn set_host_address(&mut self, addr: Ipv4Addr, netmask: Ipv4Addr) {
        info!("Host address set to {addr} netmask {netmask}");
        self.host_address = Some(addr);
        self.netmask = netmask;
    }

    pub fn set_default_router(&mut self, addr: Ipv4Addr) {
        info!("Default router set to {addr}");
        self.default_router = addr;
    }

    pub fn set_local_ipv6_address(&mut self, addr: Ipv6Addr) {
        info!("Local IPv6 address set to {addr}");
        self.local_ipv6_address = Some(addr);
    }

    pub fn set_tunnel_remote(&mut self, addr: Ipv4Addr, port: u16) {
        info!("Tunnel remote endpoint set to {addr}:{port}");
        self.tunnel_remote_address = addr;
        self.tunnel_remote_port = port;
    }

    pub fn set_tunnel_local_port(&mut self, port: u16) {
        info!("Tunnel local port set to {port}");
        self.tunnel_local_port = port;
    }

    pub fn set_address_prefix(&mut self, prefix: Ipv6Addr, len: u8) -> Result<(), ConfigError> {
        let prefix = Nat64Prefix::new(prefix, len)?;
        info!("NAT64 prefix set to {prefix}");
        self.nat64_prefix = prefix;
        Ok(())
    }

    pub fn host_address(&self) -> Option<Ipv4Addr> {
        self.host_address
    }

    pub fn is_host_address_configured(&self) -> bool {
        self.host_address.is_some()
    }

    pub fn netmask(&self) -> Ipv4Addr {
        self.netmask
    }

    pub fn default_router(&self) -> Ipv4Addr {
        self.default_router
    }

    pub fn local_ipv6_address(&self) -> Option<Ipv6Addr> {
        self.local_ipv6_address
    }

    pub fn tunnel_remote(&self) -> SocketAddrV4 {
        SocketAddrV4::new(self.tunnel_remote_address, self.tunnel_remote_port)
    }

    pub fn tunnel_local_port(&self) -> u16 {
        self.tunnel_local_port
    }

    pub fn nat64_prefix(&self) -> &Nat64Prefix {
        &self.nat64_prefix
    }

    pub fn ephemeral_threshold(&self) -> u16 {
        self.ephemeral_threshold
    }

    pub fn endpoint_port_order(&self) -> PortByteOrder {
        self.endpoint_port_order
    }

    /// Ports below the ephemeral threshold are translated without tunnel framing.
    pub fn is_local_port(&self, port: u16) -> bool {
        port < self.ephemeral_threshold
    }

    /// Limited broadcast, or the directed broadcast of the configured subnet.
    pub fn is_broadcast(&self, addr: Ipv4Addr) -> bool {
        if addr.is_broadcast() {
            return true;
        }
        let host_address = match self.host_address {
            Some(host_address) => u32::from(host_address),
            None => return false,
        };
        let netmask = u32::from(self.netmask);
        if netmask == u32::MAX {
            return false;
        }
        let subnet_broadcast = (host_address & netmask) | !netmask;
        u32::from(addr) == subnet_broadcast
    }

    /// Returns the identification for the next packet translated to IPv4.
    pub fn next_ip_id(&self) -> u16 {
        self.ip_id.fetch_add(1, Ordering::Relaxed)
    }
}

#[derive(Debug)]
pub enum ConfigError {
    Internal(&'static str),
    Ip(IpError),
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Self::Internal(msg) => f.write_str(msg),
            Self::Ip(e) => write!(f, "Invalid address: {e}"),
        }
    }
}

impl error::Error for ConfigError {
    fn source(&self) -> Option<&(dyn error::Error + 'static)> {
        match self {
            Self::Internal(_msg) => None,
            Self::Ip(err) => Some(err),
        }
    }
}

impl From<IpError> for ConfigError {
    fn from(err: IpError) -> ConfigError {
        Self::Ip(err)
    }
}

impl From<&'static str> for ConfigError {
    fn from(msg: &'static str) -> ConfigError {
        Self::Internal(msg)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn host_starts_unconfigured() {
        let mut context = TranslationContext::new(ContextConfig::default());
        assert!(!context.is_host_address_configured());
        assert_eq!(context.host_address(), None);

        context.set_host_address(Ipv4Addr::new(10, 0, 0, 2), Ipv4Addr::new(255, 255, 255, 0));
        assert!(context.is_host_address_configured());
        assert_eq!(context.host_address(), Some(Ipv4Addr::new(10, 0, 0, 2)));
        assert_eq!(context.netmask(), Ipv4Addr::new(255, 255, 255, 0));
    }

    #[test]
    fn configuration_setters() {
        let mut context = TranslationContext::new(ContextConfig::default());
        context.set_default_router(Ipv4Addr::new(10, 0, 0, 1));
        context.set_local_ipv6_address("fd00::1".parse().unwrap());
        context.set_tunnel_remote(Ipv4Addr::new(198, 51, 100, 1), 9100);
        context.set_tunnel_local_port(9200);
        assert_eq!(context.default_router(), Ipv4Addr::new(10, 0, 0, 1));
        assert_eq!(
            context.local_ipv6_address(),
            Some("fd00::1".parse().unwrap())
        );
        assert_eq!(
            context.tunnel_remote(),
            SocketAddrV4::new(Ipv4Addr::new(198, 51, 100, 1), 9100)
        );
        assert_eq!(context.tunnel_local_port(), 9200);
    }

    #[test]
    fn address_prefix() {
        let mut context = TranslationContext::new(ContextConfig::default());
        assert_eq!(*context.nat64_prefix(), Nat64Prefix::IPV4_MAPPED);
        context
            .set_address_prefix("64:ff9b::".parse().unwrap(), 96)
            .unwrap();
        assert_eq!(
            context.nat64_prefix().ipv4_to_ipv6(Ipv4Addr::new(192, 0, 2, 1)),
            "64:ff9b::c000:201".parse::<Ipv6Addr>().unwrap()
        );
        assert!(context
            .set_address_prefix("64:ff9b::".parse().unwrap(), 120)
            .is_err());
        assert_eq!(context.nat64_prefix().prefix_len(), 96);
    }

    #[test]
    fn broadcast_detection() {
        let mut context = TranslationContext::new(ContextConfig::default());
        assert!(context.is_broadcast(Ipv4Addr::BROADCAST));
        assert!(!context.is_broadcast(Ipv4Addr::new(10, 0, 0, 255)));

        context.set_host_address(Ipv4Addr::new(10, 0, 0, 2), Ipv4Addr::new(255, 255, 255, 0));
        assert!(context.is_broadcast(Ipv4Addr::new(10, 0, 0, 255)));
        assert!(!context.is_broadcast(Ipv4Addr::new(10, 0, 1, 255)));
        assert!(!context.is_broadcast(Ipv4Addr::new(10, 0, 0, 2)));

        context.set_host_address(Ipv4Addr::new(10, 0, 0, 2), Ipv4Addr::BROADCAST);
        assert!(!context.is_broadcast(Ipv4Addr::new(10, 0, 0, 2)));
    }

    #[test]
    fn ip_id_wraps() {
        let context = TranslationContext::new(ContextConfig::default());
        context.ip_id.store(0xfffe, Ordering::Relaxed);
        assert_eq!(context.next_ip_id(), 0xfffe);
        assert_eq!(context.next_ip_id(), 0xffff);
        assert_eq!(context.next_ip_id(), 0x0000);
        assert_eq!(context.next_ip_id(), 0x0001);
    }

    #[test]
    fn ephemeral_threshold() {
        let context = TranslationContext::new(ContextConfig::default());
        assert!(context.is_local_port(67));
        assert!(context.is_local_port(1023));
        assert!(!context.is_local_port(1024));
    }
}
