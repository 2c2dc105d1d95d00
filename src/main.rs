use std::{
    env, fmt,
    net::{Ipv4Addr, Ipv6Addr, SocketAddr, SocketAddrV4},
    path::PathBuf,
    process,
    str::FromStr,
};

use context::{ConfigError, ContextConfig, TranslationContext};
use tunnel::{PortByteOrder, Tunnel};

mod context;
mod dns64;
mod futures;
mod gateway;
mod ip;
mod logger;
mod pcap;
mod tunnel;

enum Action {
    Serve(ContextConfig, Addressing, gateway::Config),
}

/// Addresses applied through the configuration interface once the tunnel
/// is created.
struct Addressing {
    host_address: Option<(Ipv4Addr, Ipv4Addr)>,
    default_router: Option<Ipv4Addr>,
    local_ipv6_address: Option<Ipv6Addr>,
    tunnel_remote: SocketAddrV4,
    tunnel_local_port: u16,
    nat64_prefix: Option<(Ipv6Addr, u8)>,
}

impl Addressing {
    fn apply(&self, context: &mut TranslationContext) -> Result<(), ConfigError> {
        if let Some((addr, netmask)) = self.host_address {
            context.set_host_address(addr, netmask);
        }
        if let Some(addr) = self.default_router {
            context.set_default_router(addr);
        }
        if let Some(addr) = self.local_ipv6_address {
            context.set_local_ipv6_address(addr);
        }
        context.set_tunnel_remote(*self.tunnel_remote.ip(), self.tunnel_remote.port());
        context.set_tunnel_local_port(self.tunnel_local_port);
        if let Some((prefix, len)) = self.nat64_prefix {
            context.set_address_prefix(prefix, len)?;
        }
        Ok(())
    }
}

pub struct Args {
    log_level: log::LevelFilter,
    action: Action,
}

const USAGE_INSTRUCTIONS: &str = "Usage: tunnel64 [OPTIONS] serve\n\n\
Options:\
\n      --log-level=<LOG_LEVEL>          Log level [default: info]\
\n      --host-address=<IP>/<NETMASK>    IPv4 host address and netmask [default: unconfigured]\
\n      --default-router=<IP>            IPv4 default router [default: 0.0.0.0]\
\n      --local-ipv6=<IP>                IPv6 address of the segment node receiving local flows\
\n      --tunnel-remote=<IP>:<PORT>      Remote tunnel endpoint (required)\
\n      --tunnel-local-port=<PORT>       Local port of the outer tunnel flow [default: 9000]\
\n      --nat64-prefix=<IP>/<LEN>        NAT64 address prefix [default: ::ffff:0.0.0.0/96]\
\n      --ephemeral-threshold=<PORT>     Ports below this value bypass the tunnel [default: 1024]\
\n      --endpoint-port-order=<ORDER>    Source port order in endpoint blocks, reversed or network [default: reversed]\
\n      --segment-listen=<IP>:<PORT>     Listen address for IPv6 packets from the segment [default: [::]:6464]\
\n      --uplink-listen=<IP>:<PORT>      Listen address for IPv4 packets from the uplink [default: 0.0.0.0:6446]\
\n      --uplink-peer=<IP>:<PORT>        Address receiving IPv4 packets for the uplink (required)\
\n      --pcap=<FILENAME>                Write translated packets into a PCAP file\
\n      --help                           Print help";

impl Args {
    fn parse() -> Args {
        let fail_with_error = |name: &str, value: &str, err: fmt::Arguments| {
            eprintln!(
                "Argument {} has an unsupported value {}: {}",
                name, value, err
            );
            println!("{}", USAGE_INSTRUCTIONS);
            process::exit(2);
        };

        let mut log_level = log::LevelFilter::Info;
        let mut context_config = ContextConfig::default();
        let mut host_address = None;
        let mut default_router = None;
        let mut local_ipv6_address = None;
        let mut tunnel_remote = None;
        let mut tunnel_local_port = context::DEFAULT_TUNNEL_PORT;
        let mut nat64_prefix = None;
        let mut segment_listen = SocketAddr::new(Ipv6Addr::UNSPECIFIED.into(), 6464);
        let mut uplink_listen = SocketAddr::new(Ipv4Addr::UNSPECIFIED.into(), 6446);
        let mut uplink_peer = None;
        let mut pcap_path = None;

        for arg in env::args()
            .take(env::args().len().saturating_sub(1))
            .skip(1)
        {
            if arg == "--help" || arg == "help" {
                println!("{}", USAGE_INSTRUCTIONS);
                process::exit(0);
            }
            let (name, value) = if let Some(arg) = arg.split_once('=') {
                arg
            } else {
                eprintln!("Option flag {} has no value", arg);
                println!("{}", USAGE_INSTRUCTIONS);
                process::exit(2);
            };

            if name == "--log-level" {
                log_level = match value.to_uppercase().as_str() {
                    "TRACE" => log::LevelFilter::Trace,
                    "DEBUG" => log::LevelFilter::Debug,
                    "INFO" => log::LevelFilter::Info,
                    "WARN" => log::LevelFilter::Warn,
                    "ERROR" => log::LevelFilter::Error,
                    "OFF" => log::LevelFilter::Off,
                    _ => {
                        fail_with_error(name, value, format_args!("Unsupported log level"));
                        process::exit(2);
                    }
                };
            } else if name == "--host-address" {
                let (addr, netmask) = if let Some(value) = value.split_once('/') {
                    value
                } else {
                    fail_with_error(name, value, format_args!("Netmask is missing"));
                    process::exit(2);
                };
                match (Ipv4Addr::from_str(addr), Ipv4Addr::from_str(netmask)) {
                    (Ok(addr), Ok(netmask)) => host_address = Some((addr, netmask)),
                    (Err(err), _) | (_, Err(err)) => fail_with_error(
                        name,
                        value,
                        format_args!("Failed to parse IPv4 address: {}", err),
                    ),
                };
            } else if name == "--default-router" {
                match Ipv4Addr::from_str(value) {
                    Ok(addr) => default_router = Some(addr),
                    Err(err) => fail_with_error(
                        name,
                        value,
                        format_args!("Failed to parse IPv4 address: {}", err),
                    ),
                };
            } else if name == "--local-ipv6" {
                match Ipv6Addr::from_str(value) {
                    Ok(addr) => local_ipv6_address = Some(addr),
                    Err(err) => fail_with_error(
                        name,
                        value,
                        format_args!("Failed to parse IPv6 address: {}", err),
                    ),
                };
            } else if name == "--tunnel-remote" {
                match SocketAddrV4::from_str(value) {
                    Ok(addr) => tunnel_remote = Some(addr),
                    Err(err) => fail_with_error(
                        name,
                        value,
                        format_args!("Failed to parse IPv4 socket address: {}", err),
                    ),
                };
            } else if name == "--tunnel-local-port" {
                match u16::from_str(value) {
                    Ok(port) => tunnel_local_port = port,
                    Err(err) => fail_with_error(
                        name,
                        value,
                        format_args!("Failed to parse port: {}", err),
                    ),
                };
            } else if name == "--nat64-prefix" {
                let (prefix, len) = if let Some(value) = value.split_once('/') {
                    value
                } else {
                    fail_with_error(name, value, format_args!("Prefix length is missing"));
                    process::exit(2);
                };
                let prefix = match Ipv6Addr::from_str(prefix) {
                    Ok(prefix) => prefix,
                    Err(err) => {
                        fail_with_error(
                            name,
                            value,
                            format_args!("Failed to parse IPv6 prefix: {}", err),
                        );
                        process::exit(2);
                    }
                };
                let len = match u8::from_str(len) {
                    Ok(len) => len,
                    Err(err) => {
                        fail_with_error(
                            name,
                            value,
                            format_args!("Failed to parse prefix length: {}", err),
                        );
                        process::exit(2);
                    }
                };
                nat64_prefix = Some((prefix, len));
            } else if name == "--ephemeral-threshold" {
                match u16::from_str(value) {
                    Ok(port) => context_config.ephemeral_threshold = port,
                    Err(err) => fail_with_error(
                        name,
                        value,
                        format_args!("Failed to parse port: {}", err),
                    ),
                };
            } else if name == "--endpoint-port-order" {
                context_config.endpoint_port_order = match value.to_lowercase().as_str() {
                    "reversed" => PortByteOrder::ReversedSource,
                    "network" => PortByteOrder::Network,
                    _ => {
                        fail_with_error(name, value, format_args!("Unsupported port order"));
                        process::exit(2);
                    }
                };
            } else if name == "--segment-listen" {
                match SocketAddr::from_str(value) {
                    Ok(addr) => segment_listen = addr,
                    Err(err) => fail_with_error(
                        name,
                        value,
                        format_args!("Failed to parse socket address: {}", err),
                    ),
                };
            } else if name == "--uplink-listen" {
                match SocketAddr::from_str(value) {
                    Ok(addr) => uplink_listen = addr,
                    Err(err) => fail_with_error(
                        name,
                        value,
                        format_args!("Failed to parse socket address: {}", err),
                    ),
                };
            } else if name == "--uplink-peer" {
                match SocketAddr::from_str(value) {
                    Ok(addr) => uplink_peer = Some(addr),
                    Err(err) => fail_with_error(
                        name,
                        value,
                        format_args!("Failed to parse socket address: {}", err),
                    ),
                };
            } else if name == "--pcap" {
                pcap_path = Some(PathBuf::from(value));
            } else {
                eprintln!("Unsupported argument {}", arg);
            }
        }

        let action = if let Some(action) = env::args().last() {
            action
        } else {
            eprintln!("No action specified");
            println!("{}", USAGE_INSTRUCTIONS);
            process::exit(2);
        };

        match action.as_str() {
            "serve" => {
                let (tunnel_remote, uplink_peer) = match (tunnel_remote, uplink_peer) {
                    (Some(tunnel_remote), Some(uplink_peer)) => (tunnel_remote, uplink_peer),
                    _ => {
                        eprintln!("Tunnel remote and uplink peer must be specified");
                        println!("{}", USAGE_INSTRUCTIONS);
                        process::exit(2);
                    }
                };
                let addressing = Addressing {
                    host_address,
                    default_router,
                    local_ipv6_address,
                    tunnel_remote,
                    tunnel_local_port,
                    nat64_prefix,
                };

                let action = Action::Serve(
                    context_config,
                    addressing,
                    gateway::Config {
                        segment_listen,
                        uplink_listen,
                        uplink_peer,
                        pcap_path,
                    },
                );
                Args { log_level, action }
            }
            _ => {
                eprintln!("No action specified");
                println!("{}", USAGE_INSTRUCTIONS);
                process::exit(2);
            }
        }
    }
}

fn main() {
    println!(
        "tunnel64 version {}",
        option_env!("CARGO_PKG_VERSION").unwrap_or("unknown")
    );
    let args = Args::parse();

    if let Err(err) = logger::setup_logger(args.log_level) {
        eprintln!("Failed to set up logger, error is {}", err);
    }
    match args.action {
        Action::Serve(context_config, addressing, gateway_config) => {
            let tunnel = Tunnel::new(TranslationContext::new(context_config));
            if let Err(err) = tunnel.configure(|context| addressing.apply(context)) {
                println!("Failed to configure addresses, error is {}", err);
                process::exit(2);
            }
            if let Err(err) = gateway::serve(gateway_config, tunnel) {
                println!("Failed to run gateway, error is {}", err);
                process::exit(1);
            }
        }
    }
}
