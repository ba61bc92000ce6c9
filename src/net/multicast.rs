//! UDP multicast processor.

use std::io;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr, UdpSocket};
use std::sync::{Arc, Weak};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use socket2::{Domain, Protocol, SockRef, Socket, Type};
use tracing::{debug, info, warn};

use super::{check_families, mtu, NetworkProcessor, Packet, PacketListener, ProcessorCore};
use crate::config::NetworkConfig;
use crate::error::{Error, Result};
use crate::executor::Executors;
use crate::metrics::{self, ProcessorKind};

/// mDNS port.
pub const MDNS_PORT: u16 = 5353;

/// mDNS IPv4 group, 224.0.0.251.
pub const GROUP_V4: Ipv4Addr = Ipv4Addr::new(224, 0, 0, 251);

/// mDNS IPv6 group, ff02::fb.
pub const GROUP_V6: Ipv6Addr = Ipv6Addr::new(0xff02, 0, 0, 0, 0, 0, 0, 0xfb);

/// Blocking receive timeout; bounds how long `close` waits for the reader.
const READ_TIMEOUT: Duration = Duration::from_millis(500);

/// mDNS messages may be up to 9000 bytes regardless of the link MTU.
const MAX_MESSAGE: usize = 9000;

struct Shared {
    core: ProcessorCore,
    /// Taken by `close`; the reader thread holds its own handle.
    socket: Mutex<Option<UdpSocket>>,
    local_addr: SocketAddr,
    interface: IpAddr,
    if_index: u32,
    group: SocketAddr,
    ttl: u32,
    max_payload: usize,
}

/// A socket joined to a multicast group, with its own reader thread.
pub struct MulticastProcessor {
    shared: Arc<Shared>,
    reader: Mutex<Option<JoinHandle<()>>>,
    config: NetworkConfig,
}

impl MulticastProcessor {
    /// Bind to `port`, join `group` on `interface` and configure the socket.
    ///
    /// The reader is not running until [`start`](Self::start).
    pub fn open(
        interface: IpAddr,
        group: IpAddr,
        port: u16,
        listener: Arc<dyn PacketListener>,
        executors: Arc<Executors>,
        config: &NetworkConfig,
    ) -> Result<Arc<Self>> {
        let ipv6 = check_families(interface, group)?;
        if !group.is_multicast() {
            return Err(Error::Config(format!("{group} is not a multicast address")));
        }

        let bind_addr = if ipv6 {
            SocketAddr::new(IpAddr::V6(Ipv6Addr::UNSPECIFIED), port)
        } else {
            SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), port)
        };
        let bind_err = |e: io::Error| Error::Bind {
            address: bind_addr,
            source: Arc::new(e),
        };

        let domain = if ipv6 { Domain::IPV6 } else { Domain::IPV4 };
        let socket = Socket::new(domain, Type::DGRAM, Some(Protocol::UDP)).map_err(bind_err)?;
        socket.set_reuse_address(true).map_err(bind_err)?;
        #[cfg(all(unix, not(target_os = "solaris"), not(target_os = "illumos")))]
        socket.set_reuse_port(true).map_err(bind_err)?;
        if ipv6 {
            socket.set_only_v6(true).map_err(bind_err)?;
        }
        socket.bind(&bind_addr.into()).map_err(bind_err)?;

        let join_err = |e: io::Error| Error::Join {
            group,
            source: Arc::new(e),
        };
        let loopback = !config.multicast_loopback_disabled;
        let mut if_index = 0;
        match (interface, group) {
            (IpAddr::V4(iface), IpAddr::V4(group)) => {
                socket.join_multicast_v4(&group, &iface).map_err(join_err)?;
                if !iface.is_unspecified() {
                    socket.set_multicast_if_v4(&iface).map_err(join_err)?;
                }
                socket
                    .set_multicast_ttl_v4(config.multicast_ttl)
                    .map_err(join_err)?;
                socket.set_multicast_loop_v4(loopback).map_err(join_err)?;
            }
            (IpAddr::V6(iface), IpAddr::V6(group)) => {
                if_index = interface_index(IpAddr::V6(iface));
                socket.join_multicast_v6(&group, if_index).map_err(join_err)?;
                if if_index != 0 {
                    socket.set_multicast_if_v6(if_index).map_err(join_err)?;
                }
                socket
                    .set_multicast_hops_v6(config.multicast_ttl)
                    .map_err(join_err)?;
                socket.set_multicast_loop_v6(loopback).map_err(join_err)?;
            }
            _ => unreachable!("address families checked above"),
        }
        socket
            .set_read_timeout(Some(READ_TIMEOUT))
            .map_err(bind_err)?;

        let socket: UdpSocket = socket.into();
        let local_addr = socket.local_addr().map_err(bind_err)?;
        let max_payload = mtu::negotiate(interface);
        info!(
            %interface,
            %group,
            port,
            ttl = config.multicast_ttl,
            loopback,
            max_payload,
            "multicast processor bound"
        );

        Ok(Arc::new(Self {
            shared: Arc::new(Shared {
                core: ProcessorCore::new(ProcessorKind::Multicast, listener, &executors),
                socket: Mutex::new(Some(socket)),
                local_addr,
                interface,
                if_index,
                group: SocketAddr::new(group, port),
                ttl: config.multicast_ttl,
                max_payload,
            }),
            reader: Mutex::new(None),
            config: config.clone(),
        }))
    }

    /// Spawn the reader thread and, if configured, the health monitor.
    pub fn start(self: &Arc<Self>) -> Result<()> {
        let mut reader = self.reader.lock();
        if reader.is_some() {
            return Ok(());
        }
        let socket = match self.shared.socket.lock().as_ref() {
            Some(socket) => socket.try_clone()?,
            None => return Err(Error::Closed("multicast processor")),
        };
        let shared = Arc::clone(&self.shared);
        let name = format!("mdns-mcast-{}", self.shared.group.ip());
        *reader = Some(
            thread::Builder::new()
                .name(name)
                .spawn(move || read_loop(shared, socket))?,
        );
        drop(reader);

        let this: Arc<dyn NetworkProcessor> = self.clone();
        let weak: Weak<dyn NetworkProcessor> = Arc::downgrade(&this);
        self.shared.core.start_monitor(weak, &self.config)
    }

    /// Multicast group and port packets are sent to.
    pub fn group(&self) -> SocketAddr {
        self.shared.group
    }

    /// Local interface address.
    pub fn interface(&self) -> IpAddr {
        self.shared.interface
    }

    fn leave_group(&self, socket: &UdpSocket) -> io::Result<()> {
        match (self.shared.group.ip(), self.shared.interface) {
            (IpAddr::V4(group), IpAddr::V4(iface)) => socket.leave_multicast_v4(&group, &iface),
            (IpAddr::V6(group), _) => socket.leave_multicast_v6(&group, self.shared.if_index),
            _ => Ok(()),
        }
    }
}

impl NetworkProcessor for MulticastProcessor {
    fn kind(&self) -> ProcessorKind {
        ProcessorKind::Multicast
    }

    fn local_addr(&self) -> SocketAddr {
        self.shared.local_addr
    }

    fn max_payload_size(&self) -> usize {
        self.shared.max_payload
    }

    fn send(&self, data: &[u8]) -> Result<()> {
        let shared = &self.shared;
        if shared.core.is_closed() {
            return Ok(());
        }

        let result = {
            let guard = shared.socket.lock();
            let Some(socket) = guard.as_ref() else {
                return Ok(());
            };
            // Some stacks reset the multicast TTL; set it on every send.
            let sock = SockRef::from(socket);
            let ttl = if shared.group.is_ipv6() {
                sock.set_multicast_hops_v6(shared.ttl)
            } else {
                sock.set_multicast_ttl_v4(shared.ttl)
            };
            if let Err(e) = ttl {
                debug!(group = %shared.group, error = %e, "failed to set multicast ttl");
            }
            socket.send_to(data, shared.group)
        };

        match result {
            Ok(sent) => {
                metrics::record_packet_sent(ProcessorKind::Multicast, sent);
                Ok(())
            }
            Err(e) => {
                metrics::record_send_error(ProcessorKind::Multicast);
                let unreachable = is_unreachable(&e);
                let err = Error::Send {
                    destination: shared.group,
                    message: e.to_string(),
                    source: Arc::new(e),
                };
                if unreachable {
                    warn!(group = %shared.group, error = %err, "destination unreachable, closing processor");
                    metrics::record_processor_closed(ProcessorKind::Multicast, "unreachable");
                    self.close();
                }
                Err(err)
            }
        }
    }

    fn close(&self) {
        if !self.shared.core.mark_closed() {
            return;
        }
        let socket = self.shared.socket.lock().take();
        if let Some(socket) = &socket {
            if let Err(e) = self.leave_group(socket) {
                warn!(group = %self.shared.group, error = %e, "failed to leave multicast group");
            }
        }
        if let Some(handle) = self.reader.lock().take() {
            if handle.thread().id() != thread::current().id() {
                let _ = handle.join();
            }
        }
        drop(socket);
        debug!(group = %self.shared.group, interface = %self.shared.interface, "multicast processor closed");
    }

    fn is_operational(&self) -> bool {
        if self.shared.core.is_closed() {
            return false;
        }
        let reader_alive = self
            .reader
            .lock()
            .as_ref()
            .is_some_and(|h| !h.is_finished());
        let executors_alive = self
            .shared
            .core
            .executors()
            .is_some_and(|e| e.network().is_operational());
        reader_alive && executors_alive
    }

    fn last_activity(&self) -> Instant {
        self.shared.core.last_activity()
    }
}

impl Drop for MulticastProcessor {
    fn drop(&mut self) {
        self.close();
    }
}

fn read_loop(shared: Arc<Shared>, socket: UdpSocket) {
    let mut buf = vec![0u8; shared.max_payload.max(MAX_MESSAGE)];
    while !shared.core.is_closed() {
        match socket.recv_from(&mut buf) {
            Ok((len, source)) => shared.core.dispatch(Packet::new(source, buf[..len].to_vec())),
            Err(e) if matches!(e.kind(), io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut) => {}
            Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
            Err(e) => {
                if shared.core.is_closed() {
                    break;
                }
                warn!(group = %shared.group, error = %e, "multicast receive failed");
            }
        }
    }
    debug!(group = %shared.group, "multicast reader exited");
}

/// Interface index owning `address`, or 0 (any) if unknown.
fn interface_index(address: IpAddr) -> u32 {
    if address.is_unspecified() {
        return 0;
    }
    if_addrs::get_if_addrs()
        .ok()
        .and_then(|interfaces| {
            interfaces
                .into_iter()
                .find(|i| i.ip() == address)
                .and_then(|i| i.index)
        })
        .unwrap_or(0)
}

/// Whether a send failure means the route to the group is gone.
#[cfg(unix)]
pub(crate) fn is_unreachable(err: &io::Error) -> bool {
    matches!(err.raw_os_error(), Some(libc::EHOSTUNREACH | libc::ENETUNREACH))
}

#[cfg(not(unix))]
pub(crate) fn is_unreachable(_err: &io::Error) -> bool {
    false
}
