//! Resolver and querier contracts, plus the response routing shared by the
//! multicast querier and the unicast processor.

pub mod composite;
pub mod domains;
pub mod multicast;
pub mod resolution;
pub mod unicast;

use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};

use crossbeam_channel::{bounded, Sender};
use hickory_proto::op::{Message, MessageType};
use hickory_proto::rr::{Record, RecordType};
use parking_lot::Mutex;
use tracing::{debug, trace};

use crate::error::{Error, Result};
use crate::listener::{Dispatcher, ListenerError, ListenerRegistry, ListenerResult};
use crate::net::{Packet, PacketListener};

pub use composite::MulticastDnsQuerier;
pub use multicast::MulticastQuerier;
pub use resolution::{Resolution, Response};
pub use unicast::UnicastResolver;

/// Identifier of one request issued through a [`Resolver`].
///
/// This is the DNS message id of the request. Multicast responders usually
/// answer with id 0, so callers must not rely on it alone for correlation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RequestId(pub u16);

impl RequestId {
    /// Id of `message`.
    pub fn of(message: &Message) -> Self {
        RequestId(message.id())
    }
}

impl fmt::Display for RequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Callbacks for asynchronous responses.
pub trait ResolverListener: Send + Sync {
    /// A response arrived for request `id`.
    fn received_response(&self, id: RequestId, response: &Message) -> ListenerResult;

    /// Request `id` failed.
    fn handle_error(&self, id: RequestId, error: &Error) -> ListenerResult;
}

impl ResolverListener for Dispatcher<dyn ResolverListener> {
    fn received_response(&self, id: RequestId, response: &Message) -> ListenerResult {
        self.dispatch(|l| l.received_response(id, response))
            .map_err(ListenerError::from)
    }

    fn handle_error(&self, id: RequestId, error: &Error) -> ListenerResult {
        self.dispatch(|l| l.handle_error(id, error))
            .map_err(ListenerError::from)
    }
}

/// Something that answers DNS queries.
pub trait Resolver: Send + Sync {
    /// Send `query` and block for the answer.
    fn send(&self, query: &Message) -> Result<Message>;

    /// Send `query`; responses and errors are reported to `listener`.
    fn send_async(&self, query: &Message, listener: Arc<dyn ResolverListener>)
        -> Result<RequestId>;

    /// Change the timeout for synchronous sends.
    fn set_timeout(&self, timeout: Duration);

    /// Current timeout for synchronous sends.
    fn timeout(&self) -> Duration;

    /// Release sockets. Further sends fail with [`Error::Closed`].
    fn close(&self);
}

/// A resolver that can also broadcast and be observed.
pub trait Querier: Resolver {
    /// Send `message` to every multicast responder. Answers already in the
    /// message are kept only when `add_known_answers` is set.
    fn broadcast(&self, message: &Message, add_known_answers: bool) -> Result<()>;

    /// Observe every response this querier receives.
    fn register_listener(
        &self,
        listener: Arc<dyn ResolverListener>,
    ) -> Result<Arc<dyn ResolverListener>>;

    /// Stop observing.
    fn unregister_listener(
        &self,
        listener: &Arc<dyn ResolverListener>,
    ) -> Option<Arc<dyn ResolverListener>>;

    /// This querier as a plain [`Resolver`].
    fn as_resolver(self: Arc<Self>) -> Arc<dyn Resolver>;
}

/// Whether `response` carries records answering a question of `query`.
pub fn answers_query(query: &Message, response: &Message) -> bool {
    if response.message_type() != MessageType::Response {
        return false;
    }
    query.queries().iter().any(|q| {
        response
            .answers()
            .iter()
            .chain(response.additionals())
            .any(|record| record_answers(record, q.name(), q.query_type()))
    })
}

fn record_answers(record: &Record, name: &hickory_proto::rr::Name, query_type: RecordType) -> bool {
    record.name() == name
        && (query_type == RecordType::ANY
            || record.record_type() == query_type
            || record.record_type() == RecordType::CNAME)
}

/// A listener waiting for an outstanding request, dropped after `expires`.
struct Pending {
    id: RequestId,
    listener: Arc<dyn ResolverListener>,
    expires: Instant,
}

/// Decodes packets into DNS responses and routes them to waiting requests
/// and registered listeners.
pub(crate) struct ResponseRouter {
    name: &'static str,
    pending: Mutex<Vec<Pending>>,
    listeners: ListenerRegistry<dyn ResolverListener>,
}

impl ResponseRouter {
    pub(crate) fn new(name: &'static str) -> Arc<Self> {
        Arc::new(Self {
            name,
            pending: Mutex::new(Vec::new()),
            listeners: ListenerRegistry::new(name),
        })
    }

    pub(crate) fn listeners(&self) -> &ListenerRegistry<dyn ResolverListener> {
        &self.listeners
    }

    /// Route responses to `listener` until `ttl` elapses.
    pub(crate) fn add_pending(
        &self,
        id: RequestId,
        listener: Arc<dyn ResolverListener>,
        ttl: Duration,
    ) {
        self.pending.lock().push(Pending {
            id,
            listener,
            expires: Instant::now() + ttl,
        });
    }

    pub(crate) fn remove_pending(&self, listener: &Arc<dyn ResolverListener>) {
        self.pending
            .lock()
            .retain(|p| !std::ptr::addr_eq(Arc::as_ptr(&p.listener), Arc::as_ptr(listener)));
    }

    pub(crate) fn pending_len(&self) -> usize {
        self.pending.lock().len()
    }

    /// Deliver one decoded response.
    pub(crate) fn route(&self, response: &Message) -> ListenerResult {
        let id = RequestId::of(response);
        let now = Instant::now();
        let waiting: Vec<(RequestId, Arc<dyn ResolverListener>)> = {
            let mut pending = self.pending.lock();
            pending.retain(|p| p.expires > now);
            pending
                .iter()
                .map(|p| (p.id, Arc::clone(&p.listener)))
                .collect()
        };

        for (request, listener) in waiting {
            if let Err(ListenerError::Failed(message)) = listener.received_response(id, response) {
                debug!(router = self.name, %request, error = %message, "request listener failed");
            }
        }
        self.listeners
            .dispatch(|l| l.received_response(id, response))
            .map_err(ListenerError::from)
    }

    pub(crate) fn close(&self) {
        self.pending.lock().clear();
        self.listeners.close();
    }
}

impl PacketListener for ResponseRouter {
    fn packet_received(&self, packet: &Packet) -> ListenerResult {
        let message = match packet.decode() {
            Ok(message) => message,
            Err(e) => {
                debug!(router = self.name, source = %packet.source(), error = %e, "undecodable packet");
                return Ok(());
            }
        };
        if message.message_type() != MessageType::Response {
            trace!(router = self.name, source = %packet.source(), "ignoring query");
            return Ok(());
        }
        self.route(&message)
    }
}

/// Listener that hands the first correlated response to a waiting thread.
struct Waiter {
    query: Message,
    tx: Sender<Result<Message>>,
}

impl ResolverListener for Waiter {
    fn received_response(&self, id: RequestId, response: &Message) -> ListenerResult {
        if id == RequestId::of(&self.query) || answers_query(&self.query, response) {
            let _ = self.tx.try_send(Ok(response.clone()));
        }
        Ok(())
    }

    fn handle_error(&self, _id: RequestId, error: &Error) -> ListenerResult {
        let _ = self.tx.try_send(Err(error.clone()));
        Ok(())
    }
}

/// Synchronous send built on [`Resolver::send_async`].
pub(crate) fn send_and_wait(
    resolver: &dyn Resolver,
    query: &Message,
    timeout: Duration,
) -> Result<Message> {
    let (tx, rx) = bounded(1);
    let waiter: Arc<dyn ResolverListener> = Arc::new(Waiter {
        query: query.clone(),
        tx,
    });
    resolver.send_async(query, waiter)?;
    rx.recv_timeout(timeout).map_err(|_| Error::Timeout)?
}

#[cfg(test)]
mod tests {
    use super::*;
    use hickory_proto::op::Query;
    use hickory_proto::rr::{Name, RData};
    use std::net::Ipv4Addr;
    use std::str::FromStr;

    fn query(name: &str, rtype: RecordType) -> Message {
        let mut message = Message::new();
        message.add_query(Query::query(Name::from_str(name).unwrap(), rtype));
        message
    }

    fn response_with(name: &str, rdata: RData) -> Message {
        let mut message = Message::new();
        message.set_message_type(MessageType::Response);
        message.add_answer(Record::from_rdata(Name::from_str(name).unwrap(), 120, rdata));
        message
    }

    #[test]
    fn test_answers_query_matches_name_and_type() {
        let q = query("host.local.", RecordType::A);
        let a = RData::A(Ipv4Addr::new(10, 0, 0, 1).into());
        assert!(answers_query(&q, &response_with("host.local.", a.clone())));
        assert!(answers_query(&q, &response_with("HOST.local.", a.clone())));
        assert!(!answers_query(&q, &response_with("other.local.", a.clone())));

        let aaaa = query("host.local.", RecordType::AAAA);
        assert!(!answers_query(&aaaa, &response_with("host.local.", a.clone())));

        let any = query("host.local.", RecordType::ANY);
        assert!(answers_query(&any, &response_with("host.local.", a)));
    }

    #[test]
    fn test_answers_query_requires_response() {
        let q = query("host.local.", RecordType::A);
        let mut r = response_with("host.local.", RData::A(Ipv4Addr::LOCALHOST.into()));
        r.set_message_type(MessageType::Query);
        assert!(!answers_query(&q, &r));
    }

    struct Counter(Mutex<usize>);

    impl ResolverListener for Counter {
        fn received_response(&self, _: RequestId, _: &Message) -> ListenerResult {
            *self.0.lock() += 1;
            Ok(())
        }
        fn handle_error(&self, _: RequestId, _: &Error) -> ListenerResult {
            Ok(())
        }
    }

    #[test]
    fn test_router_expires_pending() {
        let router = ResponseRouter::new("test");
        let live = Arc::new(Counter(Mutex::new(0)));
        let expired = Arc::new(Counter(Mutex::new(0)));
        router.add_pending(RequestId(1), live.clone(), Duration::from_secs(60));
        router.add_pending(RequestId(2), expired.clone(), Duration::ZERO);

        let response = response_with("host.local.", RData::A(Ipv4Addr::LOCALHOST.into()));
        router.route(&response).unwrap();

        assert_eq!(*live.0.lock(), 1);
        assert_eq!(*expired.0.lock(), 0);
        assert_eq!(router.pending_len(), 1);

        let as_dyn: Arc<dyn ResolverListener> = live;
        router.remove_pending(&as_dyn);
        assert_eq!(router.pending_len(), 0);
    }

    #[test]
    fn test_router_ignores_queries_and_garbage() {
        let router = ResponseRouter::new("test");
        let observer = Arc::new(Counter(Mutex::new(0)));
        router.listeners().register(observer.clone()).unwrap();

        let source = "127.0.0.1:5353".parse().unwrap();
        let q = query("host.local.", RecordType::A);
        router
            .packet_received(&Packet::new(source, q.to_vec().unwrap()))
            .unwrap();
        router
            .packet_received(&Packet::new(source, vec![1, 2, 3]))
            .unwrap();
        assert_eq!(*observer.0.lock(), 0);

        let r = response_with("host.local.", RData::A(Ipv4Addr::LOCALHOST.into()));
        router
            .packet_received(&Packet::new(source, r.to_vec().unwrap()))
            .unwrap();
        assert_eq!(*observer.0.lock(), 1);
    }
}
