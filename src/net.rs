//! UDP transport for the port: one socket on 319 (event) and one on 320
//! (general), both joined to the PTP multicast groups on the chosen interface.
//!
//! Receive timestamps come from the kernel via `SO_TIMESTAMPNS`; when the
//! control message is missing the packet is stamped in user space.

use anyhow::{anyhow, Context, Result};
use log::{debug, info, warn};
use socket2::{Domain, Protocol, Socket, Type};
use std::net::{IpAddr, Ipv4Addr, SocketAddrV4, UdpSocket};
use std::time::{Duration, SystemTime};

#[cfg(unix)]
use nix::sys::socket::{setsockopt, sockopt};

use crate::config::IpMode;
use crate::datasets::ClockIdentity;
use crate::ptp::{PTP_EVENT_PORT, PTP_GENERAL_PORT, PTP_PDELAY_MULTICAST, PTP_PRIMARY_MULTICAST};
use crate::time::TimeInternal;
use crate::traits::{Channel, Destination, PtpNetwork, ReceivedPacket};

const RECV_BUFFER: usize = 2048;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InterfaceInfo {
    pub name: String,
    pub address: Ipv4Addr,
    pub mac: Option<[u8; 6]>,
}

impl InterfaceInfo {
    /// EUI-64 from the MAC, or a random identity when the MAC is unknown.
    pub fn clock_identity(&self) -> ClockIdentity {
        match self.mac {
            Some(mac) => ClockIdentity::from_mac(mac),
            None => {
                warn!("[Net] No MAC address for {}, using a random clock identity", self.name);
                ClockIdentity::random()
            }
        }
    }
}

/// Pick the interface to run on. With `name`, that interface must exist and
/// carry an IPv4 address; otherwise the first non-loopback IPv4 interface wins.
pub fn find_interface(name: Option<&str>) -> Result<InterfaceInfo> {
    let interfaces = if_addrs::get_if_addrs().context("Failed to list network interfaces")?;

    let candidates: Vec<(String, Ipv4Addr)> = interfaces
        .iter()
        .filter_map(|iface| match iface.ip() {
            IpAddr::V4(ip) if !iface.is_loopback() => Some((iface.name.clone(), ip)),
            _ => None,
        })
        .collect();

    let chosen = match name {
        Some(wanted) => candidates
            .into_iter()
            .find(|(n, _)| n == wanted)
            .ok_or_else(|| anyhow!("Interface {} not found or has no IPv4 address", wanted))?,
        None => {
            let mut candidates = candidates.into_iter();
            let first = candidates
                .next()
                .ok_or_else(|| anyhow!("No non-loopback IPv4 interface found"))?;
            for (other, ip) in candidates {
                debug!("[Net] Also available: {} ({})", other, ip);
            }
            first
        }
    };

    let (name, address) = chosen;
    let mac = read_mac(&name);
    Ok(InterfaceInfo { name, address, mac })
}

#[cfg(target_os = "linux")]
fn read_mac(name: &str) -> Option<[u8; 6]> {
    let text = std::fs::read_to_string(format!("/sys/class/net/{}/address", name)).ok()?;
    parse_mac(text.trim())
}

#[cfg(not(target_os = "linux"))]
fn read_mac(_name: &str) -> Option<[u8; 6]> {
    None
}

/// Parse `aa:bb:cc:dd:ee:ff`. The all-zero address counts as unknown.
pub fn parse_mac(text: &str) -> Option<[u8; 6]> {
    let mut mac = [0u8; 6];
    let mut parts = text.split(':');
    for byte in mac.iter_mut() {
        *byte = u8::from_str_radix(parts.next()?, 16).ok()?;
    }
    if parts.next().is_some() || mac == [0u8; 6] {
        return None;
    }
    Some(mac)
}

/// Bind a PTP socket on `port`. Multicast sockets join both PTP groups on
/// `interface_ip` and send through that interface without loopback.
pub fn create_ptp_socket(port: u16, interface_ip: Ipv4Addr, multicast: bool) -> Result<UdpSocket> {
    let socket = Socket::new(Domain::IPV4, Type::DGRAM, Some(Protocol::UDP))?;
    socket.set_reuse_address(true)?;

    let addr = SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, port);
    socket
        .bind(&addr.into())
        .with_context(|| format!("Failed to bind UDP port {}", port))?;

    if multicast {
        for group in [PTP_PRIMARY_MULTICAST, PTP_PDELAY_MULTICAST] {
            socket
                .join_multicast_v4(&group, &interface_ip)
                .with_context(|| format!("Failed to join {} on {}", group, interface_ip))?;
        }
        socket.set_multicast_if_v4(&interface_ip)?;
        socket.set_multicast_loop_v4(false)?;
        socket.set_multicast_ttl_v4(1)?;
    }
    socket.set_nonblocking(true)?;

    let udp_socket: UdpSocket = socket.into();

    #[cfg(unix)]
    {
        if let Err(e) = setsockopt(&udp_socket, sockopt::ReceiveTimestampns, &true) {
            warn!("[Net] Kernel timestamping unavailable on port {}: {}", port, e);
        }
    }

    Ok(udp_socket)
}

/// One datagram with its kernel receive timestamp and source address.
#[cfg(unix)]
fn recv_with_timestamp(sock: &UdpSocket, buf: &mut [u8]) -> Result<Option<(usize, Ipv4Addr, TimeInternal)>> {
    use nix::sys::socket::{recvmsg, ControlMessageOwned, MsgFlags, SockaddrStorage};
    use nix::sys::time::TimeSpec;
    use std::os::fd::AsRawFd;

    let fd = sock.as_raw_fd();
    let mut iov = [std::io::IoSliceMut::new(buf)];
    let mut cmsg_buf = nix::cmsg_space!(TimeSpec);

    match recvmsg::<SockaddrStorage>(fd, &mut iov, Some(&mut cmsg_buf), MsgFlags::empty()) {
        Ok(msg) => {
            let timestamp = msg
                .cmsgs()
                .find_map(|cmsg| match cmsg {
                    ControlMessageOwned::ScmTimestampns(ts) => {
                        Some(TimeInternal::new(ts.tv_sec() as i32, ts.tv_nsec() as i32))
                    }
                    _ => None,
                })
                .unwrap_or_else(|| TimeInternal::from_system_time(SystemTime::now()));
            let source = msg
                .address
                .as_ref()
                .and_then(|a| a.as_sockaddr_in())
                .map(|sin| *SocketAddrV4::from(*sin).ip())
                .unwrap_or(Ipv4Addr::UNSPECIFIED);
            Ok(Some((msg.bytes, source, timestamp)))
        }
        Err(nix::errno::Errno::EAGAIN) => Ok(None),
        Err(e) => Err(e.into()),
    }
}

#[cfg(not(unix))]
fn recv_with_timestamp(sock: &UdpSocket, buf: &mut [u8]) -> Result<Option<(usize, Ipv4Addr, TimeInternal)>> {
    match sock.recv_from(buf) {
        Ok((size, std::net::SocketAddr::V4(from))) => {
            Ok(Some((size, *from.ip(), TimeInternal::from_system_time(SystemTime::now()))))
        }
        Ok((_, from)) => Err(anyhow!("Unexpected IPv6 source {}", from)),
        Err(ref e) if e.kind() == std::io::ErrorKind::WouldBlock => Ok(None),
        Err(e) => Err(e.into()),
    }
}

/// `PtpNetwork` over real sockets.
pub struct UdpNetwork {
    interface: InterfaceInfo,
    multicast: bool,
    event: UdpSocket,
    general: UdpSocket,
    buf: Vec<u8>,
}

impl UdpNetwork {
    pub fn new(interface: InterfaceInfo, ip_mode: IpMode) -> Result<Self> {
        let multicast = ip_mode != IpMode::Unicast;
        let (event, general) = Self::open(&interface, multicast)?;
        info!(
            "[Net] Listening on {} ({}) ports {}/{}{}",
            interface.name,
            interface.address,
            PTP_EVENT_PORT,
            PTP_GENERAL_PORT,
            if multicast { ", multicast joined" } else { "" }
        );
        Ok(UdpNetwork {
            interface,
            multicast,
            event,
            general,
            buf: vec![0u8; RECV_BUFFER],
        })
    }

    fn open(interface: &InterfaceInfo, multicast: bool) -> Result<(UdpSocket, UdpSocket)> {
        let event = create_ptp_socket(PTP_EVENT_PORT, interface.address, multicast)?;
        let general = create_ptp_socket(PTP_GENERAL_PORT, interface.address, multicast)?;
        Ok((event, general))
    }

    pub fn interface(&self) -> &InterfaceInfo {
        &self.interface
    }

    fn socket(&self, channel: Channel) -> &UdpSocket {
        match channel {
            Channel::Event => &self.event,
            Channel::General => &self.general,
        }
    }
}

impl PtpNetwork for UdpNetwork {
    fn recv_packet(&mut self) -> Result<Option<ReceivedPacket>> {
        for channel in [Channel::Event, Channel::General] {
            let sock = match channel {
                Channel::Event => &self.event,
                Channel::General => &self.general,
            };
            if let Some((size, source, timestamp)) = recv_with_timestamp(sock, &mut self.buf)? {
                return Ok(Some(ReceivedPacket {
                    data: self.buf[..size].to_vec(),
                    timestamp,
                    source,
                    channel,
                }));
            }
        }
        Ok(None)
    }

    fn send(&mut self, channel: Channel, data: &[u8], destination: Destination) -> Result<Option<TimeInternal>> {
        let port = match channel {
            Channel::Event => PTP_EVENT_PORT,
            Channel::General => PTP_GENERAL_PORT,
        };
        let ip = match destination {
            Destination::Multicast => PTP_PRIMARY_MULTICAST,
            Destination::PeerMulticast => PTP_PDELAY_MULTICAST,
            Destination::Unicast(ip) => ip,
        };
        let target = SocketAddrV4::new(ip, port);

        let sent = self
            .socket(channel)
            .send_to(data, target)
            .with_context(|| format!("Failed to send {} bytes to {}", data.len(), target))?;
        if sent != data.len() {
            return Err(anyhow!("Short send to {}: {} of {} bytes", target, sent, data.len()));
        }

        // Software transmit timestamp; taken right after the send returns
        Ok(match channel {
            Channel::Event => Some(TimeInternal::from_system_time(SystemTime::now())),
            Channel::General => None,
        })
    }

    #[cfg(unix)]
    fn wait(&mut self, timeout: Duration) -> Result<bool> {
        use nix::poll::{poll, PollFd, PollFlags};

        let mut fds = [
            PollFd::new(&self.event, PollFlags::POLLIN),
            PollFd::new(&self.general, PollFlags::POLLIN),
        ];
        let millis = timeout.as_millis().min(i32::MAX as u128) as i32;
        match poll(&mut fds, millis) {
            Ok(n) => Ok(n > 0),
            Err(nix::errno::Errno::EINTR) => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    #[cfg(not(unix))]
    fn wait(&mut self, timeout: Duration) -> Result<bool> {
        std::thread::sleep(timeout.min(Duration::from_millis(1)));
        Ok(true)
    }

    /// Close and reopen both sockets, rejoining the multicast groups.
    fn reset(&mut self) -> Result<()> {
        let (event, general) = Self::open(&self.interface, self.multicast)?;
        self.event = event;
        self.general = general;
        debug!("[Net] Sockets reopened on {}", self.interface.name);
        Ok(())
    }
}
