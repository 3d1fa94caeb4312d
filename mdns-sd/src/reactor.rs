//! Network reactor (spec §4.F): owns the multicast UDP sockets, receives
//! datagrams, and provides the send primitive. Socket construction follows
//! the teacher's `hr-dhcp::server::run_dhcp_server` /
//! `hr-ipv6::ra::run_ra_sender` idiom — build with `socket2::Socket`, set
//! the multicast options it can't express, then hand off to
//! `tokio::net::UdpSocket`.

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr, SocketAddrV4, SocketAddrV6};
use std::sync::Arc;
use std::time::Duration;

use socket2::{Domain, Protocol, Socket, Type};
use tokio::net::UdpSocket;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::config::{Config, InterfaceChoice, IpVersion};
use crate::error::{Error, Result};
use crate::message::{self, Message};

pub const MDNS_PORT: u16 = 5353;
pub const MDNS_GROUP_V4: Ipv4Addr = Ipv4Addr::new(224, 0, 0, 251);
pub const MDNS_GROUP_V6: Ipv6Addr = Ipv6Addr::new(0xff02, 0, 0, 0, 0, 0, 0, 0xfb);

/// Platform interface enumeration is out of this crate's scope (spec §1);
/// this trait is the seam a caller supplies a real implementation of.
/// `DefaultIfaces` resolves `All`/`Default` to "let the OS pick" and
/// `Explicit` to the given addresses parsed as IPs.
pub trait Ifaces: Send + Sync {
    fn addresses(&self, choice: &InterfaceChoice, version: IpVersion) -> Vec<IpAddr>;
}

pub struct DefaultIfaces;

impl Ifaces for DefaultIfaces {
    fn addresses(&self, choice: &InterfaceChoice, version: IpVersion) -> Vec<IpAddr> {
        match choice {
            InterfaceChoice::All | InterfaceChoice::Default => {
                let mut out = Vec::new();
                if version.wants_v4() {
                    out.push(IpAddr::V4(Ipv4Addr::UNSPECIFIED));
                }
                if version.wants_v6() {
                    out.push(IpAddr::V6(Ipv6Addr::UNSPECIFIED));
                }
                out
            }
            InterfaceChoice::Explicit(list) => list.iter().filter_map(|s| s.parse().ok()).collect(),
        }
    }
}

enum Family {
    V4,
    V6,
}

struct BoundSocket {
    socket: Arc<UdpSocket>,
    family: Family,
}

/// An inbound datagram, parsed, tagged with where it came from.
pub struct Inbound {
    pub message: Message,
    pub source: SocketAddr,
}

pub struct Reactor {
    sockets: Vec<BoundSocket>,
}

impl Reactor {
    /// Bind one multicast socket per selected interface per requested
    /// address family. `unicast` binds an ephemeral port instead of 5353
    /// and skips the multicast join (spec §6 `unicast` option).
    pub async fn open(config: &Config, ifaces: &dyn Ifaces) -> Result<Self> {
        let mut sockets = Vec::new();

        if config.ip_version.wants_v4() {
            for addr in ifaces.addresses(&config.interfaces, IpVersion::V4Only) {
                if let IpAddr::V4(v4) = addr {
                    sockets.push(BoundSocket {
                        socket: Arc::new(bind_v4(v4, config.unicast)?),
                        family: Family::V4,
                    });
                }
            }
        }

        if config.ip_version.wants_v6() {
            for addr in ifaces.addresses(&config.interfaces, IpVersion::V6Only) {
                if let IpAddr::V6(v6) = addr {
                    sockets.push(BoundSocket {
                        socket: Arc::new(bind_v6(v6, config.unicast)?),
                        family: Family::V6,
                    });
                }
            }
        }

        if sockets.is_empty() {
            return Err(Error::NetworkError(std::io::Error::new(
                std::io::ErrorKind::AddrNotAvailable,
                "no usable interfaces for the configured ip_version",
            )));
        }

        Ok(Self { sockets })
    }

    /// Serialise `datagrams` are expected pre-encoded (via `message::encode`)
    /// and sent on every socket whose family matches `target`, or the mDNS
    /// group on that family if `target` is `None`.
    pub async fn send(&self, datagram: &[u8], target: Option<SocketAddr>) -> Result<()> {
        for bound in &self.sockets {
            let dest = match (&bound.family, target) {
                (Family::V4, Some(SocketAddr::V4(v4))) => SocketAddr::V4(v4),
                (Family::V6, Some(SocketAddr::V6(v6))) => SocketAddr::V6(v6),
                (_, Some(_)) => continue,
                (Family::V4, None) => SocketAddr::V4(SocketAddrV4::new(MDNS_GROUP_V4, MDNS_PORT)),
                (Family::V6, None) => SocketAddr::V6(SocketAddrV6::new(MDNS_GROUP_V6, MDNS_PORT, 0, 0)),
            };
            if let Err(e) = bound.socket.send_to(datagram, dest).await {
                warn!("mdns send to {} failed: {}", dest, e);
            }
        }
        Ok(())
    }

    /// Spawn one receive loop per bound socket, forwarding parsed messages
    /// to `tx`. Malformed datagrams are logged at `debug!` and dropped
    /// (spec §7): they never reach the channel. A recv error marks that
    /// socket as unhealthy for 5s (backed off, not fatal) before retrying —
    /// other sockets are unaffected.
    pub fn spawn_receive_loops(self: &Arc<Self>, tx: mpsc::UnboundedSender<Inbound>) -> Vec<tokio::task::JoinHandle<()>> {
        self.sockets
            .iter()
            .map(|bound| {
                let socket = bound.socket.clone();
                let tx = tx.clone();
                tokio::spawn(async move {
                    let mut buf = vec![0u8; 9000];
                    loop {
                        let (len, source) = match socket.recv_from(&mut buf).await {
                            Ok(r) => r,
                            Err(e) => {
                                warn!("mdns recv error, backing off 5s: {}", e);
                                tokio::time::sleep(Duration::from_secs(5)).await;
                                continue;
                            }
                        };
                        match message::decode(&buf[..len]) {
                            Ok(message) => {
                                if tx.send(Inbound { message, source }).is_err() {
                                    return;
                                }
                            }
                            Err(e) => debug!("dropping malformed datagram from {}: {}", source, e),
                        }
                    }
                })
            })
            .collect()
    }
}

fn bind_v4(addr: Ipv4Addr, unicast: bool) -> Result<UdpSocket> {
    let socket = Socket::new(Domain::IPV4, Type::DGRAM, Some(Protocol::UDP))?;
    socket.set_reuse_address(true)?;
    #[cfg(unix)]
    socket.set_reuse_port(true)?;

    let port = if unicast { 0 } else { MDNS_PORT };
    let bind_addr = if unicast { addr } else { Ipv4Addr::UNSPECIFIED };
    socket.bind(&SocketAddr::V4(SocketAddrV4::new(bind_addr, port)).into())?;

    if !unicast {
        socket.join_multicast_v4(&MDNS_GROUP_V4, &addr)?;
        socket.set_multicast_loop_v4(true)?;
        socket.set_multicast_ttl_v4(255)?;
    }

    socket.set_nonblocking(true)?;
    Ok(UdpSocket::from_std(socket.into())?)
}

fn bind_v6(addr: Ipv6Addr, unicast: bool) -> Result<UdpSocket> {
    let socket = Socket::new(Domain::IPV6, Type::DGRAM, Some(Protocol::UDP))?;
    socket.set_reuse_address(true)?;
    #[cfg(unix)]
    socket.set_reuse_port(true)?;

    let port = if unicast { 0 } else { MDNS_PORT };
    socket.bind(&SocketAddr::V6(SocketAddrV6::new(Ipv6Addr::UNSPECIFIED, port, 0, 0)).into())?;

    if !unicast {
        socket.join_multicast_v6(&MDNS_GROUP_V6, 0)?;
        socket.set_multicast_loop_v6(true)?;
        socket.set_multicast_hops_v6(255)?;
    }
    let _ = addr;

    socket.set_nonblocking(true)?;
    Ok(UdpSocket::from_std(socket.into())?)
}
