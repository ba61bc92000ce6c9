//! Unicast DNS resolver: UDP with TCP retry on truncation.

use std::io::{self, Read, Write};
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr, SocketAddrV6, TcpStream, UdpSocket};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use hickory_proto::op::Message;
use parking_lot::Mutex;
use tracing::{debug, trace};

use super::{RequestId, Resolver, ResolverListener};
use crate::error::{Error, Result};
use crate::executor::Executors;
use crate::metrics;

/// Standard DNS port.
pub const DNS_PORT: u16 = 53;

const RESOLV_CONF: &str = "/etc/resolv.conf";
const MAX_UDP_RESPONSE: usize = 65_535;

struct Inner {
    server: SocketAddr,
    timeout: Mutex<Duration>,
    closed: AtomicBool,
}

/// Resolver for one unicast nameserver.
pub struct UnicastResolver {
    inner: Arc<Inner>,
    executors: Arc<Executors>,
}

impl UnicastResolver {
    /// Resolver for `server`. Asynchronous sends run on the general pool.
    pub fn new(server: SocketAddr, timeout: Duration, executors: Arc<Executors>) -> Self {
        Self {
            inner: Arc::new(Inner {
                server,
                timeout: Mutex::new(timeout),
                closed: AtomicBool::new(false),
            }),
            executors,
        }
    }

    /// Nameserver address.
    pub fn server(&self) -> SocketAddr {
        self.inner.server
    }
}

impl Inner {
    fn timeout(&self) -> Duration {
        *self.timeout.lock()
    }

    fn ensure_open(&self) -> Result<()> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(Error::Closed("unicast resolver"));
        }
        Ok(())
    }

    fn exchange(&self, query: &Message) -> Result<Message> {
        self.ensure_open()?;
        let bytes = query.to_vec()?;
        let timeout = self.timeout();

        let response = self.exchange_udp(&bytes, query.id(), timeout)?;
        if !response.truncated() {
            return Ok(response);
        }
        debug!(server = %self.server, id = query.id(), "truncated response, retrying over tcp");
        metrics::record_tcp_retry();
        self.exchange_tcp(&bytes, timeout)
    }

    fn exchange_udp(&self, bytes: &[u8], id: u16, timeout: Duration) -> Result<Message> {
        let local = match self.server.ip() {
            IpAddr::V4(_) => SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), 0),
            IpAddr::V6(_) => SocketAddr::new(IpAddr::V6(Ipv6Addr::UNSPECIFIED), 0),
        };
        let socket = UdpSocket::bind(local).map_err(|e| Error::Bind {
            address: local,
            source: Arc::new(e),
        })?;
        socket.send_to(bytes, self.server).map_err(|e| self.send_error(e))?;
        metrics::record_packet_sent(metrics::ProcessorKind::Unicast, bytes.len());

        let deadline = Instant::now() + timeout;
        let mut buf = vec![0u8; MAX_UDP_RESPONSE];
        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Err(Error::Timeout);
            }
            socket.set_read_timeout(Some(remaining))?;
            let (len, from) = socket.recv_from(&mut buf).map_err(io_error)?;
            if from != self.server {
                trace!(%from, server = %self.server, "ignoring datagram from unexpected source");
                continue;
            }
            let response = match Message::from_vec(&buf[..len]) {
                Ok(response) => response,
                Err(e) => {
                    debug!(server = %self.server, error = %e, "undecodable response");
                    continue;
                }
            };
            if response.id() != id {
                trace!(server = %self.server, id = response.id(), "ignoring mismatched id");
                continue;
            }
            return Ok(response);
        }
    }

    fn exchange_tcp(&self, bytes: &[u8], timeout: Duration) -> Result<Message> {
        let len = u16::try_from(bytes.len())
            .map_err(|_| Error::Config(format!("query of {} bytes exceeds tcp framing", bytes.len())))?;

        let mut stream = TcpStream::connect_timeout(&self.server, timeout).map_err(io_error)?;
        stream.set_read_timeout(Some(timeout))?;
        stream.set_write_timeout(Some(timeout))?;

        let mut framed = Vec::with_capacity(bytes.len() + 2);
        framed.extend_from_slice(&len.to_be_bytes());
        framed.extend_from_slice(bytes);
        stream.write_all(&framed).map_err(|e| self.send_error(e))?;

        let mut prefix = [0u8; 2];
        stream.read_exact(&mut prefix).map_err(io_error)?;
        let mut body = vec![0u8; u16::from_be_bytes(prefix) as usize];
        stream.read_exact(&mut body).map_err(io_error)?;
        Ok(Message::from_vec(&body)?)
    }

    fn send_error(&self, e: io::Error) -> Error {
        metrics::record_send_error(metrics::ProcessorKind::Unicast);
        Error::Send {
            destination: self.server,
            message: e.to_string(),
            source: Arc::new(e),
        }
    }
}

fn io_error(e: io::Error) -> Error {
    match e.kind() {
        io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut => Error::Timeout,
        _ => e.into(),
    }
}

impl Resolver for UnicastResolver {
    fn send(&self, query: &Message) -> Result<Message> {
        self.inner.exchange(query)
    }

    fn send_async(
        &self,
        query: &Message,
        listener: Arc<dyn ResolverListener>,
    ) -> Result<RequestId> {
        self.inner.ensure_open()?;
        let id = RequestId::of(query);
        let inner = Arc::clone(&self.inner);
        let query = query.clone();
        self.executors.general().execute(move || {
            let delivered = match inner.exchange(&query) {
                Ok(response) => listener.received_response(id, &response),
                Err(e) => {
                    debug!(server = %inner.server, %id, error = %e, "unicast query failed");
                    listener.handle_error(id, &e)
                }
            };
            if let Err(e) = delivered {
                debug!(server = %inner.server, %id, error = ?e, "resolver listener failed");
            }
        })?;
        Ok(id)
    }

    fn set_timeout(&self, timeout: Duration) {
        *self.inner.timeout.lock() = timeout;
    }

    fn timeout(&self) -> Duration {
        self.inner.timeout()
    }

    fn close(&self) {
        self.inner.closed.store(true, Ordering::SeqCst);
    }
}

/// Nameservers listed in `/etc/resolv.conf`, or none if it cannot be read.
pub fn system_nameservers() -> Vec<SocketAddr> {
    match std::fs::read_to_string(RESOLV_CONF) {
        Ok(text) => parse_resolv_conf(&text),
        Err(e) => {
            debug!(path = RESOLV_CONF, error = %e, "no system resolver configuration");
            Vec::new()
        }
    }
}

/// Extract `nameserver` entries from resolv.conf text.
///
/// An IPv6 zone (`fe80::1%eth0` or `fe80::1%2`) becomes the scope id.
pub fn parse_resolv_conf(text: &str) -> Vec<SocketAddr> {
    parse_resolv_conf_with(text, interface_index_by_name)
}

fn parse_resolv_conf_with<F>(text: &str, zone_index: F) -> Vec<SocketAddr>
where
    F: Fn(&str) -> Option<u32>,
{
    text.lines()
        .map(|line| line.split(['#', ';']).next().unwrap_or_default())
        .filter_map(|line| {
            let mut fields = line.split_whitespace();
            if fields.next()? != "nameserver" {
                return None;
            }
            let field = fields.next()?;
            let (address, zone) = match field.split_once('%') {
                Some((address, zone)) => (address, Some(zone)),
                None => (field, None),
            };
            match (address.parse::<IpAddr>().ok()?, zone) {
                (IpAddr::V6(v6), Some(zone)) => {
                    let scope = zone.parse::<u32>().ok().or_else(|| zone_index(zone));
                    if scope.is_none() {
                        debug!(%v6, zone, "unknown nameserver zone");
                    }
                    Some(SocketAddr::V6(SocketAddrV6::new(
                        v6,
                        DNS_PORT,
                        0,
                        scope.unwrap_or(0),
                    )))
                }
                (ip, _) => Some(SocketAddr::new(ip, DNS_PORT)),
            }
        })
        .collect()
}

fn interface_index_by_name(name: &str) -> Option<u32> {
    if_addrs::get_if_addrs()
        .ok()?
        .into_iter()
        .find(|i| i.name == name)
        .and_then(|i| i.index)
}

#[cfg(test)]
mod tests {
    use super::*;
    use hickory_proto::op::{MessageType, Query};
    use hickory_proto::rr::{Name, RData, Record, RecordType};
    use std::net::TcpListener;
    use std::str::FromStr;
    use std::thread;

    fn query(id: u16) -> Message {
        let mut m = Message::new();
        m.set_id(id);
        m.add_query(Query::query(Name::from_str("example.com.").unwrap(), RecordType::A));
        m
    }

    fn answer_for(request: &Message, truncated: bool) -> Message {
        let mut m = Message::new();
        m.set_id(request.id());
        m.set_message_type(MessageType::Response);
        m.set_truncated(truncated);
        if !truncated {
            m.add_answer(Record::from_rdata(
                Name::from_str("example.com.").unwrap(),
                60,
                RData::A(Ipv4Addr::new(93, 184, 216, 34).into()),
            ));
        }
        m
    }

    #[test]
    fn test_parse_resolv_conf() {
        let text = "\
# comment
search example.com
nameserver 10.0.0.2
nameserver   fe80::1%eth0  # trailing
nameserver fe80::2%3
nameserver fe80::3%missing
nameserver not-an-address
nameserver 2001:db8::1
options ndots:2
";
        let servers = parse_resolv_conf_with(text, |zone| (zone == "eth0").then_some(7));
        let scopes: Vec<_> = servers
            .iter()
            .map(|server| match server {
                SocketAddr::V6(v6) => v6.scope_id(),
                SocketAddr::V4(_) => 0,
            })
            .collect();
        assert_eq!(
            servers,
            vec![
                "10.0.0.2:53".parse::<SocketAddr>().unwrap(),
                "[fe80::1%7]:53".parse::<SocketAddr>().unwrap(),
                "[fe80::2%3]:53".parse::<SocketAddr>().unwrap(),
                "[fe80::3]:53".parse::<SocketAddr>().unwrap(),
                "[2001:db8::1]:53".parse::<SocketAddr>().unwrap(),
            ]
        );
        assert_eq!(scopes, vec![0, 7, 3, 0, 0]);
    }

    #[test]
    fn test_udp_exchange() {
        let server = UdpSocket::bind("127.0.0.1:0").unwrap();
        let addr = server.local_addr().unwrap();
        thread::spawn(move || {
            let mut buf = [0u8; 512];
            let (len, from) = server.recv_from(&mut buf).unwrap();
            let request = Message::from_vec(&buf[..len]).unwrap();
            server
                .send_to(&answer_for(&request, false).to_vec().unwrap(), from)
                .unwrap();
        });

        let executors = Executors::new(&Default::default()).unwrap();
        let resolver = UnicastResolver::new(addr, Duration::from_secs(2), executors.clone());
        let response = resolver.send(&query(1234)).unwrap();
        assert_eq!(response.id(), 1234);
        assert_eq!(response.answers().len(), 1);
        executors.shutdown();
    }

    #[test]
    fn test_truncated_udp_retries_over_tcp() {
        let tcp = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = tcp.local_addr().unwrap();
        let udp = UdpSocket::bind(addr).unwrap();

        thread::spawn(move || {
            let mut buf = [0u8; 512];
            let (len, from) = udp.recv_from(&mut buf).unwrap();
            let request = Message::from_vec(&buf[..len]).unwrap();
            udp.send_to(&answer_for(&request, true).to_vec().unwrap(), from)
                .unwrap();
        });
        thread::spawn(move || {
            let (mut stream, _) = tcp.accept().unwrap();
            let mut prefix = [0u8; 2];
            stream.read_exact(&mut prefix).unwrap();
            let mut body = vec![0u8; u16::from_be_bytes(prefix) as usize];
            stream.read_exact(&mut body).unwrap();
            let request = Message::from_vec(&body).unwrap();
            let reply = answer_for(&request, false).to_vec().unwrap();
            stream
                .write_all(&(reply.len() as u16).to_be_bytes())
                .unwrap();
            stream.write_all(&reply).unwrap();
        });

        let executors = Executors::new(&Default::default()).unwrap();
        let resolver = UnicastResolver::new(addr, Duration::from_secs(2), executors.clone());
        let response = resolver.send(&query(77)).unwrap();
        assert!(!response.truncated());
        assert_eq!(response.answers().len(), 1);
        executors.shutdown();
    }

    #[test]
    fn test_timeout_and_close() {
        let silent = UdpSocket::bind("127.0.0.1:0").unwrap();
        let executors = Executors::new(&Default::default()).unwrap();
        let resolver = UnicastResolver::new(
            silent.local_addr().unwrap(),
            Duration::from_millis(50),
            executors.clone(),
        );
        assert!(matches!(resolver.send(&query(1)), Err(Error::Timeout)));

        resolver.close();
        assert!(matches!(resolver.send(&query(1)), Err(Error::Closed(_))));
        executors.shutdown();
    }
}
