use std::{
    error, fmt,
    future::{self, Future},
    io,
    net::SocketAddr,
    path::PathBuf,
    pin::pin,
    task::Poll,
    time::Duration,
};

use log::{debug, info, trace, warn};
use tokio::{
    net::UdpSocket,
    runtime,
    signal,
    sync::oneshot,
};

use crate::{
    futures::RoundRobinSelector,
    pcap::{PcapSender, PcapWriter},
    tunnel::Tunnel,
};

// Largest packet that fits into the tunnel.
const MAX_PACKET_SIZE: usize = 1500;

pub struct Config {
    pub segment_listen: SocketAddr,
    pub uplink_listen: SocketAddr,
    pub uplink_peer: SocketAddr,
    pub pcap_path: Option<PathBuf>,
}

enum Event {
    Segment(io::Result<(usize, SocketAddr)>),
    Uplink(io::Result<(usize, SocketAddr)>),
    Shutdown,
}

/// Relays raw packets, one per UDP datagram, between the constrained segment
/// and the uplink.
///
/// IPv6 packets received on the segment socket are encapsulated and sent to
/// the uplink peer. IPv4 packets received from the uplink peer are
/// decapsulated and sent to the most recent segment peer.
pub struct Gateway {
    tunnel: Tunnel,
    segment: UdpSocket,
    uplink: UdpSocket,
    uplink_peer: SocketAddr,
}

impl Gateway {
    pub async fn bind(config: &Config, tunnel: Tunnel) -> Result<Gateway, GatewayError> {
        let segment = UdpSocket::bind(config.segment_listen).await?;
        let uplink = UdpSocket::bind(config.uplink_listen).await?;
        Ok(Gateway {
            tunnel,
            segment,
            uplink,
            uplink_peer: config.uplink_peer,
        })
    }

    pub fn segment_addr(&self) -> Result<SocketAddr, GatewayError> {
        Ok(self.segment.local_addr()?)
    }

    pub fn uplink_addr(&self) -> Result<SocketAddr, GatewayError> {
        Ok(self.uplink.local_addr()?)
    }

    pub async fn run(
        self,
        shutdown_receiver: oneshot::Receiver<()>,
        mut pcap_sender: Option<PcapSender>,
    ) -> Result<(), GatewayError> {
        info!(
            "Relaying segment {} to uplink {} via {}",
            self.segment_addr()?,
            self.uplink_peer,
            self.uplink_addr()?
        );
        {
            let context = self.tunnel.context();
            match context.host_address() {
                Some(addr) => info!(
                    "Host address {addr} netmask {} default router {}",
                    context.netmask(),
                    context.default_router()
                ),
                None => info!("Host address is not configured"),
            }
            info!(
                "Ports below {} bypass the tunnel to {}",
                context.ephemeral_threshold(),
                context.tunnel_remote()
            );
        }
        let mut segment_read_buffer = [0u8; MAX_PACKET_SIZE];
        let mut uplink_read_buffer = [0u8; MAX_PACKET_SIZE];
        let mut write_buffer = [0u8; MAX_PACKET_SIZE];
        let mut segment_peer = None;
        let mut selector = RoundRobinSelector::new();
        let mut shutdown_command = pin!(shutdown_receiver);
        loop {
            let event = {
                let receive_segment = async {
                    Event::Segment(self.segment.recv_from(&mut segment_read_buffer).await)
                };
                let receive_uplink = async {
                    Event::Uplink(self.uplink.recv_from(&mut uplink_read_buffer).await)
                };
                let mut receive = pin!(selector.select(receive_segment, receive_uplink));
                future::poll_fn(|cx| {
                    if shutdown_command.as_mut().poll(cx).is_ready() {
                        Poll::Ready(Event::Shutdown)
                    } else {
                        receive.as_mut().poll(cx)
                    }
                })
                .await
            };
            match event {
                Event::Shutdown => {
                    info!("Stopping gateway");
                    return Ok(());
                }
                Event::Segment(Ok((length, peer))) => {
                    if segment_peer != Some(peer) {
                        info!("Segment peer is now {peer}");
                        segment_peer = Some(peer);
                    }
                    let length = self
                        .tunnel
                        .encapsulate(&segment_read_buffer[..length], &mut write_buffer);
                    if length == 0 {
                        continue;
                    }
                    let packet = &write_buffer[..length];
                    if let Some(pcap_sender) = pcap_sender.as_mut() {
                        pcap_sender.send_packet(packet);
                    }
                    if let Err(err) = self.uplink.send_to(packet, self.uplink_peer).await {
                        warn!("Failed to send packet to uplink: {err}");
                    }
                }
                Event::Uplink(Ok((length, peer))) => {
                    if peer != self.uplink_peer {
                        debug!("Ignoring datagram from unknown uplink peer {peer}");
                        continue;
                    }
                    let segment_peer = if let Some(segment_peer) = segment_peer {
                        segment_peer
                    } else {
                        trace!("No segment peer yet, dropping uplink packet");
                        continue;
                    };
                    let length = self
                        .tunnel
                        .decapsulate(&uplink_read_buffer[..length], &mut write_buffer);
                    if length == 0 {
                        continue;
                    }
                    let packet = &write_buffer[..length];
                    if let Some(pcap_sender) = pcap_sender.as_mut() {
                        pcap_sender.send_packet(packet);
                    }
                    if let Err(err) = self.segment.send_to(packet, segment_peer).await {
                        warn!("Failed to send packet to segment: {err}");
                    }
                }
                Event::Segment(Err(err)) => {
                    warn!("Failed to receive packet from segment: {err}");
                }
                Event::Uplink(Err(err)) => {
                    warn!("Failed to receive packet from uplink: {err}");
                }
            }
        }
    }
}

/// Runs the gateway until Ctrl-C is received.
pub fn serve(config: Config, tunnel: Tunnel) -> Result<(), GatewayError> {
    let rt = runtime::Builder::new_current_thread()
        .enable_all()
        .build()?;
    let (shutdown_sender, shutdown_receiver) = oneshot::channel();
    rt.spawn(async move {
        if let Err(err) = signal::ctrl_c().await {
            warn!("Failed to wait for Ctrl-C: {err}");
        }
        let _ = shutdown_sender.send(());
    });
    let result = rt.block_on(run_gateway(&config, tunnel, shutdown_receiver));
    rt.shutdown_timeout(Duration::from_secs(60));
    result
}

async fn run_gateway(
    config: &Config,
    tunnel: Tunnel,
    shutdown_receiver: oneshot::Receiver<()>,
) -> Result<(), GatewayError> {
    let pcap_sender = if let Some(pcap_path) = &config.pcap_path {
        let (writer, sender) = PcapWriter::new(pcap_path).await?;
        tokio::spawn(writer.run());
        Some(sender)
    } else {
        None
    };
    let gateway = Gateway::bind(config, tunnel).await?;
    gateway.run(shutdown_receiver, pcap_sender).await
}

#[derive(Debug)]
pub enum GatewayError {
    Internal(&'static str),
    Io(io::Error),
}

impl fmt::Display for GatewayError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Self::Internal(msg) => f.write_str(msg),
            Self::Io(e) => write!(f, "IO error: {e}"),
        }
    }
}

impl error::Error for GatewayError {
    fn source(&self) -> Option<&(dyn error::Error + 'static)> {
        match self {
            Self::Internal(_msg) => None,
            Self::Io(err) => Some(err),
        }
    }
}

impl From<&'static str> for GatewayError {
    fn from(msg: &'static str) -> GatewayError {
        Self::Internal(msg)
    }
}

impl From<io::Error> for GatewayError {
    fn from(err: io::Error) -> GatewayError {
        Self::Io(err)
    }
}
