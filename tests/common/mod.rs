//! Shared test infrastructure for querier and transport integration tests.

#![allow(dead_code)]

use std::net::{IpAddr, Ipv4Addr};
use std::str::FromStr;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use hickory_proto::op::{Message, MessageType, OpCode, Query, ResponseCode};
use hickory_proto::rr::{Name, RData, Record, RecordType};
use parking_lot::Mutex;

use mdns_querier::error::{Error, Result};
use mdns_querier::listener::ListenerResult;
use mdns_querier::querier::{Querier, RequestId, Resolver, ResolverListener};

// --- Constants ---

pub const HOST: &str = "host.local.";
pub const UNICAST_HOST: &str = "www.example.com.";
pub const RESPONSE_WAIT: Duration = Duration::from_millis(150);
pub const TIMEOUT: Duration = Duration::from_millis(1500);

// --- Message builders ---

/// Build a query for `name`/`record_type` with the given id.
pub fn build_query(name: &str, record_type: RecordType, id: u16) -> Message {
    let mut msg = Message::new();
    msg.set_id(id);
    msg.set_message_type(MessageType::Query);
    msg.set_op_code(OpCode::Query);
    msg.add_query(Query::query(Name::from_str(name).unwrap(), record_type));
    msg
}

/// Build an A record.
pub fn a_record(name: &str, ip: Ipv4Addr) -> Record {
    Record::from_rdata(Name::from_str(name).unwrap(), 120, RData::A(ip.into()))
}

/// Build a response carrying `records` in the answer section.
pub fn build_response(id: u16, records: Vec<Record>) -> Message {
    let mut msg = Message::new();
    msg.set_id(id);
    msg.set_message_type(MessageType::Response);
    msg.set_authoritative(true);
    for record in records {
        msg.add_answer(record);
    }
    msg
}

// --- Fake resolver ---

/// What a [`FakeResolver`] does with each query.
#[derive(Clone)]
pub enum Behavior {
    /// Answer with this message after the delay.
    Respond(Message, Duration),
    /// Report this error after the delay.
    Fail(Error, Duration),
    /// Never answer.
    Silent,
    /// Refuse to send.
    Refuse(Error),
}

/// Resolver that answers from a script, on its own thread.
pub struct FakeResolver {
    behavior: Behavior,
    queries: Mutex<Vec<Message>>,
    broadcasts: Mutex<Vec<Message>>,
    listeners: Mutex<Vec<Arc<dyn ResolverListener>>>,
    timeout: Mutex<Duration>,
    closed: Mutex<bool>,
}

impl FakeResolver {
    pub fn new(behavior: Behavior) -> Arc<Self> {
        Arc::new(Self {
            behavior,
            queries: Mutex::new(Vec::new()),
            broadcasts: Mutex::new(Vec::new()),
            listeners: Mutex::new(Vec::new()),
            timeout: Mutex::new(TIMEOUT),
            closed: Mutex::new(false),
        })
    }

    pub fn responding(records: Vec<Record>, delay: Duration) -> Arc<Self> {
        Self::new(Behavior::Respond(build_response(0, records), delay))
    }

    pub fn failing(error: Error, delay: Duration) -> Arc<Self> {
        Self::new(Behavior::Fail(error, delay))
    }

    pub fn silent() -> Arc<Self> {
        Self::new(Behavior::Silent)
    }

    pub fn query_count(&self) -> usize {
        self.queries.lock().len()
    }

    pub fn broadcasts(&self) -> Vec<Message> {
        self.broadcasts.lock().clone()
    }

    pub fn is_closed(&self) -> bool {
        *self.closed.lock()
    }

    /// Push `response` to every registered listener, as a responder would.
    pub fn announce(&self, response: &Message) {
        let listeners = self.listeners.lock().clone();
        for listener in listeners {
            let _ = listener.received_response(RequestId::of(response), response);
        }
    }
}

impl Resolver for FakeResolver {
    fn send(&self, query: &Message) -> Result<Message> {
        self.queries.lock().push(query.clone());
        match &self.behavior {
            Behavior::Respond(response, delay) => {
                thread::sleep(*delay);
                Ok(response.clone())
            }
            Behavior::Fail(error, delay) => {
                thread::sleep(*delay);
                Err(error.clone())
            }
            Behavior::Silent => Err(Error::Timeout),
            Behavior::Refuse(error) => Err(error.clone()),
        }
    }

    fn send_async(
        &self,
        query: &Message,
        listener: Arc<dyn ResolverListener>,
    ) -> Result<RequestId> {
        self.queries.lock().push(query.clone());
        let id = RequestId::of(query);
        match self.behavior.clone() {
            Behavior::Respond(response, delay) => {
                thread::spawn(move || {
                    thread::sleep(delay);
                    let _ = listener.received_response(id, &response);
                });
            }
            Behavior::Fail(error, delay) => {
                thread::spawn(move || {
                    thread::sleep(delay);
                    let _ = listener.handle_error(id, &error);
                });
            }
            Behavior::Silent => {}
            Behavior::Refuse(error) => return Err(error),
        }
        Ok(id)
    }

    fn set_timeout(&self, timeout: Duration) {
        *self.timeout.lock() = timeout;
    }

    fn timeout(&self) -> Duration {
        *self.timeout.lock()
    }

    fn close(&self) {
        *self.closed.lock() = true;
    }
}

impl Querier for FakeResolver {
    fn broadcast(&self, message: &Message, _add_known_answers: bool) -> Result<()> {
        if let Behavior::Refuse(error) = &self.behavior {
            return Err(error.clone());
        }
        self.broadcasts.lock().push(message.clone());
        Ok(())
    }

    fn register_listener(
        &self,
        listener: Arc<dyn ResolverListener>,
    ) -> Result<Arc<dyn ResolverListener>> {
        self.listeners.lock().push(Arc::clone(&listener));
        Ok(listener)
    }

    fn unregister_listener(
        &self,
        listener: &Arc<dyn ResolverListener>,
    ) -> Option<Arc<dyn ResolverListener>> {
        let mut listeners = self.listeners.lock();
        let index = listeners
            .iter()
            .position(|l| std::ptr::addr_eq(Arc::as_ptr(l), Arc::as_ptr(listener)))?;
        Some(listeners.remove(index))
    }

    fn as_resolver(self: Arc<Self>) -> Arc<dyn Resolver> {
        self
    }
}

// --- Recording listener ---

/// Records every callback it receives.
#[derive(Default)]
pub struct RecordingListener {
    pub responses: Mutex<Vec<(RequestId, Message)>>,
    pub errors: Mutex<Vec<(RequestId, String)>>,
}

impl RecordingListener {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn response_count(&self) -> usize {
        self.responses.lock().len()
    }

    pub fn error_count(&self) -> usize {
        self.errors.lock().len()
    }
}

impl ResolverListener for RecordingListener {
    fn received_response(&self, id: RequestId, response: &Message) -> ListenerResult {
        self.responses.lock().push((id, response.clone()));
        Ok(())
    }

    fn handle_error(&self, id: RequestId, error: &Error) -> ListenerResult {
        self.errors.lock().push((id, error.to_string()));
        Ok(())
    }
}

// --- Response helpers ---

/// Extract A addresses from a response.
pub fn extract_a_ips(msg: &Message) -> Vec<IpAddr> {
    msg.answers()
        .iter()
        .filter_map(|r| match r.data() {
            RData::A(a) => Some(IpAddr::V4(a.0)),
            _ => None,
        })
        .collect()
}

/// Assert response code.
pub fn assert_response_code(msg: &Message, expected: ResponseCode) {
    assert_eq!(
        msg.response_code(),
        expected,
        "expected {:?}, got {:?}",
        expected,
        msg.response_code()
    );
}

/// Assert response is successful with exactly the expected IPv4 addresses.
pub fn assert_a_response(msg: &Message, expected: &[Ipv4Addr]) {
    assert_response_code(msg, ResponseCode::NoError);
    let mut actual = extract_a_ips(msg);
    actual.sort();
    let mut expected: Vec<IpAddr> = expected.iter().copied().map(IpAddr::V4).collect();
    expected.sort();
    assert_eq!(
        actual, expected,
        "A records mismatch.\nactual:   {:?}\nexpected: {:?}",
        actual, expected
    );
}

/// Poll `condition` until it holds or `timeout` passes.
pub fn wait_for(timeout: Duration, condition: impl Fn() -> bool) -> bool {
    let deadline = std::time::Instant::now() + timeout;
    while std::time::Instant::now() < deadline {
        if condition() {
            return true;
        }
        thread::sleep(Duration::from_millis(10));
    }
    condition()
}
