//! Receive-only unicast processor.
//!
//! Accepts TCP connections and reads DNS messages framed with a two-byte
//! length prefix (RFC 1035 §4.2.2). One mio poller serves the acceptor and
//! every accepted connection on a single reader thread. There is no write
//! path: [`send`](NetworkProcessor::send) returns [`Error::ReceiveOnly`].

use std::collections::HashMap;
use std::io::{self, Read};
use std::net::SocketAddr;
use std::sync::{Arc, Weak};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use mio::net::{TcpListener, TcpStream};
use mio::{Events, Interest, Poll, Token, Waker};
use parking_lot::Mutex;
use tracing::{debug, info, trace, warn};

use super::{mtu, NetworkProcessor, Packet, PacketListener, ProcessorCore};
use crate::config::NetworkConfig;
use crate::error::{Error, Result};
use crate::executor::Executors;
use crate::metrics::{self, ProcessorKind};

const LISTENER_TOKEN: Token = Token(0);
const WAKER_TOKEN: Token = Token(1);
const CONNECTION_TOKEN_START: usize = 2;
const MAX_EVENTS: usize = 128;

/// Default poll timeout, the resolution response-wait window.
pub const DEFAULT_POLL_TIMEOUT: Duration = Duration::from_millis(250);

struct Connection {
    stream: TcpStream,
    peer: SocketAddr,
    buffer: Vec<u8>,
}

struct IoLoop {
    poll: Poll,
    listener: TcpListener,
    connections: HashMap<Token, Connection>,
    next_token: usize,
    poll_timeout: Duration,
}

struct Shared {
    core: ProcessorCore,
    local_addr: SocketAddr,
    waker: Waker,
}

/// Listening TCP socket that turns framed messages into packets.
pub struct UnicastProcessor {
    shared: Arc<Shared>,
    io: Mutex<Option<IoLoop>>,
    reader: Mutex<Option<JoinHandle<()>>>,
    config: NetworkConfig,
    max_payload: usize,
    poll_timeout: Duration,
}

impl UnicastProcessor {
    /// Bind `address` and register it with a new poller.
    pub fn open(
        address: SocketAddr,
        listener: Arc<dyn PacketListener>,
        executors: Arc<Executors>,
        config: &NetworkConfig,
    ) -> Result<Arc<Self>> {
        Self::with_poll_timeout(address, listener, executors, config, DEFAULT_POLL_TIMEOUT)
    }

    /// Like [`open`](Self::open) with an explicit poll timeout.
    pub fn with_poll_timeout(
        address: SocketAddr,
        listener: Arc<dyn PacketListener>,
        executors: Arc<Executors>,
        config: &NetworkConfig,
        poll_timeout: Duration,
    ) -> Result<Arc<Self>> {
        let bind_err = |e: io::Error| Error::Bind {
            address,
            source: Arc::new(e),
        };
        let poll = Poll::new()?;
        let mut tcp = TcpListener::bind(address).map_err(bind_err)?;
        poll.registry()
            .register(&mut tcp, LISTENER_TOKEN, Interest::READABLE)?;
        let waker = Waker::new(poll.registry(), WAKER_TOKEN)?;
        let local_addr = tcp.local_addr()?;

        info!(%local_addr, "unicast processor listening");

        Ok(Arc::new(Self {
            shared: Arc::new(Shared {
                core: ProcessorCore::new(ProcessorKind::Unicast, listener, &executors),
                local_addr,
                waker,
            }),
            io: Mutex::new(Some(IoLoop {
                poll,
                listener: tcp,
                connections: HashMap::new(),
                next_token: CONNECTION_TOKEN_START,
                poll_timeout,
            })),
            reader: Mutex::new(None),
            config: config.clone(),
            max_payload: mtu::negotiate(address.ip()),
            poll_timeout,
        }))
    }

    /// How long the reader thread blocks in one poll.
    pub fn poll_timeout(&self) -> Duration {
        self.poll_timeout
    }

    /// Spawn the reader thread and, if configured, the health monitor.
    pub fn start(self: &Arc<Self>) -> Result<()> {
        let Some(io) = self.io.lock().take() else {
            return Ok(());
        };
        let shared = Arc::clone(&self.shared);
        let handle = thread::Builder::new()
            .name(format!("mdns-ucast-{}", self.shared.local_addr.port()))
            .spawn(move || io.run(&shared))?;
        *self.reader.lock() = Some(handle);

        let this: Arc<dyn NetworkProcessor> = self.clone();
        let weak: Weak<dyn NetworkProcessor> = Arc::downgrade(&this);
        self.shared.core.start_monitor(weak, &self.config)
    }
}

impl NetworkProcessor for UnicastProcessor {
    fn kind(&self) -> ProcessorKind {
        ProcessorKind::Unicast
    }

    fn local_addr(&self) -> SocketAddr {
        self.shared.local_addr
    }

    fn max_payload_size(&self) -> usize {
        self.max_payload
    }

    fn send(&self, _data: &[u8]) -> Result<()> {
        if self.shared.core.is_closed() {
            return Ok(());
        }
        Err(Error::ReceiveOnly(self.shared.local_addr))
    }

    fn close(&self) {
        if !self.shared.core.mark_closed() {
            return;
        }
        if let Err(e) = self.shared.waker.wake() {
            debug!(error = %e, "failed to wake unicast reader");
        }
        if let Some(handle) = self.reader.lock().take() {
            if handle.thread().id() != thread::current().id() {
                let _ = handle.join();
            }
        }
        debug!(local_addr = %self.shared.local_addr, "unicast processor closed");
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

impl Drop for UnicastProcessor {
    fn drop(&mut self) {
        self.close();
    }
}

impl IoLoop {
    fn run(mut self, shared: &Shared) {
        let mut events = Events::with_capacity(MAX_EVENTS);

        while !shared.core.is_closed() {
            if let Err(e) = self.poll.poll(&mut events, Some(self.poll_timeout)) {
                if e.kind() != io::ErrorKind::Interrupted {
                    warn!(local_addr = %shared.local_addr, error = %e, "poll failed");
                }
                continue;
            }

            for event in events.iter() {
                match event.token() {
                    LISTENER_TOKEN => self.accept(shared),
                    WAKER_TOKEN => {}
                    token => {
                        if event.is_readable() || event.is_read_closed() {
                            self.read(token, shared);
                        }
                    }
                }
            }
        }

        for (_, mut conn) in self.connections.drain() {
            let _ = self.poll.registry().deregister(&mut conn.stream);
        }
        metrics::record_open_connections(0);
        debug!(local_addr = %shared.local_addr, "unicast reader exited");
    }

    fn accept(&mut self, shared: &Shared) {
        loop {
            match self.listener.accept() {
                Ok((mut stream, peer)) => {
                    let token = Token(self.next_token);
                    self.next_token += 1;
                    if let Err(e) = self
                        .poll
                        .registry()
                        .register(&mut stream, token, Interest::READABLE)
                    {
                        warn!(%peer, error = %e, "failed to register connection");
                        continue;
                    }
                    trace!(%peer, ?token, "connection accepted");
                    self.connections.insert(
                        token,
                        Connection {
                            stream,
                            peer,
                            buffer: Vec::new(),
                        },
                    );
                    metrics::record_open_connections(self.connections.len());
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => return,
                Err(e) => {
                    if !shared.core.is_closed() {
                        warn!(local_addr = %shared.local_addr, error = %e, "accept failed");
                    }
                    return;
                }
            }
        }
    }

    fn read(&mut self, token: Token, shared: &Shared) {
        let Some(conn) = self.connections.get_mut(&token) else {
            return;
        };

        let mut closed = false;
        let mut chunk = [0u8; 4096];
        loop {
            match conn.stream.read(&mut chunk) {
                Ok(0) => {
                    closed = true;
                    break;
                }
                Ok(n) => conn.buffer.extend_from_slice(&chunk[..n]),
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
                Err(e) => {
                    debug!(peer = %conn.peer, error = %e, "connection read failed");
                    closed = true;
                    break;
                }
            }
        }

        for payload in drain_frames(&mut conn.buffer) {
            shared.core.dispatch(Packet::new(conn.peer, payload));
        }

        if closed {
            if let Some(mut conn) = self.connections.remove(&token) {
                let _ = self.poll.registry().deregister(&mut conn.stream);
                if !conn.buffer.is_empty() {
                    metrics::record_packet_dropped(ProcessorKind::Unicast, "truncated");
                }
                trace!(peer = %conn.peer, "connection closed");
            }
            metrics::record_open_connections(self.connections.len());
        }
    }
}

/// Split complete length-prefixed frames off the front of `buffer`.
pub(crate) fn drain_frames(buffer: &mut Vec<u8>) -> Vec<Vec<u8>> {
    let mut frames = Vec::new();
    let mut offset = 0;
    while buffer.len() - offset >= 2 {
        let len = u16::from_be_bytes([buffer[offset], buffer[offset + 1]]) as usize;
        if buffer.len() - offset - 2 < len {
            break;
        }
        frames.push(buffer[offset + 2..offset + 2 + len].to_vec());
        offset += 2 + len;
    }
    buffer.drain(..offset);
    frames
}
