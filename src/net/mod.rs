//! Network transport: packets, processors and their shared receive plumbing.
//!
//! A processor owns one socket (or acceptor) and exactly one reader thread.
//! The reader wraps every datagram in a [`Packet`] and hands it to the
//! network worker pool, which calls the processor's [`PacketListener`].

pub mod monitor;
pub mod mtu;
pub mod multicast;
pub mod unicast;

use std::net::{IpAddr, SocketAddr};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Instant;

use hickory_proto::op::Message;
use parking_lot::Mutex;
use tracing::{debug, trace};

use crate::config::NetworkConfig;
use crate::error::{Error, Result};
use crate::executor::{Executors, ScheduledHandle};
use crate::listener::{Dispatcher, ListenerError, ListenerResult};
use crate::metrics::{self, ProcessorKind};

pub use multicast::MulticastProcessor;
pub use unicast::UnicastProcessor;

static NEXT_SEQUENCE: AtomicU64 = AtomicU64::new(0);

/// One received datagram (or framed stream message). Immutable.
#[derive(Debug, Clone)]
pub struct Packet {
    source: SocketAddr,
    payload: Vec<u8>,
    sequence: u64,
    created: Instant,
}

impl Packet {
    /// Wrap a received payload, assigning the next sequence number.
    pub fn new(source: SocketAddr, payload: Vec<u8>) -> Self {
        Self {
            source,
            payload,
            sequence: NEXT_SEQUENCE.fetch_add(1, Ordering::Relaxed),
            created: Instant::now(),
        }
    }

    /// Sender address.
    pub fn source(&self) -> SocketAddr {
        self.source
    }

    /// Raw payload.
    pub fn payload(&self) -> &[u8] {
        &self.payload
    }

    /// Process-wide monotonic sequence number.
    pub fn sequence(&self) -> u64 {
        self.sequence
    }

    /// When the packet was received.
    pub fn created(&self) -> Instant {
        self.created
    }

    /// Decode the payload as a DNS message.
    pub fn decode(&self) -> Result<Message> {
        Ok(Message::from_vec(&self.payload)?)
    }
}

/// Receives packets from a processor. Called on a network pool thread.
pub trait PacketListener: Send + Sync {
    /// Handle one packet.
    fn packet_received(&self, packet: &Packet) -> ListenerResult;
}

impl PacketListener for Dispatcher<dyn PacketListener> {
    fn packet_received(&self, packet: &Packet) -> ListenerResult {
        self.dispatch(|l| l.packet_received(packet))
            .map_err(ListenerError::from)
    }
}

/// Common contract of the multicast and unicast processors.
pub trait NetworkProcessor: Send + Sync {
    /// Processor variant.
    fn kind(&self) -> ProcessorKind;

    /// Address the socket is bound to.
    fn local_addr(&self) -> SocketAddr;

    /// Largest UDP payload that fits the negotiated MTU.
    fn max_payload_size(&self) -> usize;

    /// Send one message. A no-op once closed.
    fn send(&self, data: &[u8]) -> Result<()>;

    /// Stop the reader, cancel monitoring and release the socket.
    fn close(&self);

    /// Whether the processor is open and its reader thread is alive.
    fn is_operational(&self) -> bool;

    /// Last packet arrival, or the start time if nothing arrived yet.
    fn last_activity(&self) -> Instant;
}

/// Open a processor of the given kind.
///
/// `address` is the multicast group for [`ProcessorKind::Multicast`] and the
/// listen address for [`ProcessorKind::Unicast`]. `interface` must be of the
/// same address family.
pub fn open(
    kind: ProcessorKind,
    interface: IpAddr,
    address: IpAddr,
    port: u16,
    listener: Arc<dyn PacketListener>,
    executors: Arc<Executors>,
    config: &NetworkConfig,
) -> Result<Arc<dyn NetworkProcessor>> {
    match kind {
        ProcessorKind::Multicast => {
            let processor =
                MulticastProcessor::open(interface, address, port, listener, executors, config)?;
            processor.start()?;
            Ok(processor)
        }
        ProcessorKind::Unicast => {
            check_families(interface, address)?;
            let processor = UnicastProcessor::open(
                SocketAddr::new(address, port),
                listener,
                executors,
                config,
            )?;
            processor.start()?;
            Ok(processor)
        }
    }
}

/// Reject mixed IPv4/IPv6 pairs. Returns whether the pair is IPv6.
pub fn check_families(interface: IpAddr, address: IpAddr) -> Result<bool> {
    match (interface, address) {
        (IpAddr::V4(_), IpAddr::V4(_)) => Ok(false),
        (IpAddr::V6(_), IpAddr::V6(_)) => Ok(true),
        _ => Err(Error::Config(format!(
            "interface {interface} and address {address} are of different address families"
        ))),
    }
}

/// State shared by a processor and its reader thread.
pub(crate) struct ProcessorCore {
    kind: ProcessorKind,
    listener: Arc<dyn PacketListener>,
    executors: Weak<Executors>,
    exit: AtomicBool,
    started: Instant,
    last_packet: Mutex<Option<Instant>>,
    monitor: Mutex<Option<ScheduledHandle>>,
}

impl ProcessorCore {
    pub(crate) fn new(
        kind: ProcessorKind,
        listener: Arc<dyn PacketListener>,
        executors: &Arc<Executors>,
    ) -> Self {
        Self {
            kind,
            listener,
            executors: Arc::downgrade(executors),
            exit: AtomicBool::new(false),
            started: Instant::now(),
            last_packet: Mutex::new(None),
            monitor: Mutex::new(None),
        }
    }

    pub(crate) fn kind(&self) -> ProcessorKind {
        self.kind
    }

    pub(crate) fn is_closed(&self) -> bool {
        self.exit.load(Ordering::SeqCst)
    }

    /// Mark closed and cancel monitoring. Returns `false` if already closed.
    pub(crate) fn mark_closed(&self) -> bool {
        if self.exit.swap(true, Ordering::SeqCst) {
            return false;
        }
        if let Some(handle) = self.monitor.lock().take() {
            handle.cancel();
        }
        true
    }

    pub(crate) fn executors(&self) -> Option<Arc<Executors>> {
        self.executors.upgrade()
    }

    pub(crate) fn last_activity(&self) -> Instant {
        self.last_packet.lock().unwrap_or(self.started)
    }

    /// Start the health monitor if enabled.
    pub(crate) fn start_monitor(
        &self,
        processor: Weak<dyn NetworkProcessor>,
        config: &NetworkConfig,
    ) -> Result<()> {
        if !config.thread_monitor {
            return Ok(());
        }
        let executors = self
            .executors()
            .ok_or(Error::Closed("executors"))?;
        let handle = monitor::spawn(processor, &executors)?;
        *self.monitor.lock() = Some(handle);
        Ok(())
    }

    /// Submit a received packet to the network pool.
    pub(crate) fn dispatch(&self, packet: Packet) {
        *self.last_packet.lock() = Some(packet.created());
        metrics::record_packet_received(self.kind, packet.payload().len());
        trace!(
            kind = self.kind.as_str(),
            source = %packet.source(),
            sequence = packet.sequence(),
            bytes = packet.payload().len(),
            "packet received"
        );

        let Some(executors) = self.executors() else {
            metrics::record_packet_dropped(self.kind, "shutdown");
            return;
        };
        let listener = Arc::clone(&self.listener);
        let kind = self.kind;
        let submitted = executors.network().execute(move || {
            if let Err(e) = listener.packet_received(&packet) {
                debug!(
                    kind = kind.as_str(),
                    source = %packet.source(),
                    error = ?e,
                    "packet listener failed"
                );
            }
        });
        if let Err(e) = submitted {
            metrics::record_packet_dropped(self.kind, "rejected");
            debug!(kind = self.kind.as_str(), error = %e, "packet dropped");
        }
    }
}
