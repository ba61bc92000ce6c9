//! One in-flight logical query and its response aggregation.
//!
//! A [`Resolution`] sends its query to every eligible resolver, collects the
//! responses (or failures) as they arrive, and merges them into a single
//! synthesized answer:
//!
//! - complete once every dispatched sub-query has answered, or at the wait
//!   deadline, whichever comes first;
//! - if every sub-query failed, the first failure is returned;
//! - records from NOERROR responses are merged without duplicates, and the
//!   answer is NXDOMAIN if nothing was merged.

use std::sync::Arc;
use std::time::{Duration, Instant};

use hickory_proto::op::{Message, MessageType, ResponseCode};
use hickory_proto::rr::Record;
use parking_lot::{Condvar, Mutex};
use tracing::{debug, trace, warn};

use super::{answers_query, domains, RequestId, Resolver, ResolverListener};
use crate::error::{Error, Result};
use crate::listener::ListenerResult;
use crate::metrics::{self, ResolutionOutcome};

/// One sub-response: a message or a failure.
#[derive(Debug, Clone)]
pub enum Response {
    /// A decoded response.
    Message(Message),
    /// The sub-query failed.
    Failure(Error),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Created,
    Dispatching,
    Started,
}

struct State {
    phase: Phase,
    started: Instant,
    unicast: bool,
    ids: Vec<RequestId>,
    sent: usize,
    responses: Vec<Response>,
}

struct Shared {
    query: Message,
    listener: Option<Arc<dyn ResolverListener>>,
    response_wait: Duration,
    timeout: Duration,
    state: Mutex<State>,
    arrived: Condvar,
}

/// Handle to one in-flight query. Cheap to clone.
#[derive(Clone)]
pub struct Resolution {
    shared: Arc<Shared>,
}

impl std::fmt::Debug for Resolution {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.shared.state.lock();
        f.debug_struct("Resolution")
            .field("id", &self.shared.query.id())
            .field("phase", &state.phase)
            .field("sent", &state.sent)
            .field("responses", &state.responses.len())
            .finish()
    }
}

impl Resolution {
    /// Create a resolution for `query`.
    ///
    /// `listener`, if any, is told about every sub-response as it arrives.
    /// Multicast-only resolutions complete after `response_wait`; anything
    /// involving unicast waits up to `timeout`. `response_wait` is capped at
    /// `timeout`.
    pub fn new(
        query: Message,
        listener: Option<Arc<dyn ResolverListener>>,
        response_wait: Duration,
        timeout: Duration,
    ) -> Self {
        Self {
            shared: Arc::new(Shared {
                query,
                listener,
                response_wait: response_wait.min(timeout),
                timeout,
                state: Mutex::new(State {
                    phase: Phase::Created,
                    started: Instant::now(),
                    unicast: false,
                    ids: Vec::new(),
                    sent: 0,
                    responses: Vec::new(),
                }),
                arrived: Condvar::new(),
            }),
        }
    }

    /// The original query.
    pub fn query(&self) -> &Message {
        &self.shared.query
    }

    /// Send the query to every eligible resolver.
    ///
    /// `multicast` resolvers are used when a question targets a multicast
    /// domain, `unicast` resolvers when a question targets any other domain.
    /// A sub-query that cannot be sent counts as a failed response. Calling
    /// this more than once has no effect.
    pub fn start(&self, multicast: &[Arc<dyn Resolver>], unicast: &[Arc<dyn Resolver>]) {
        let query = &self.shared.query;
        let use_multicast = !multicast.is_empty() && domains::is_multicast_query(query);
        let use_unicast = !unicast.is_empty() && domains::is_unicast_query(query);

        {
            let mut state = self.shared.state.lock();
            if state.phase != Phase::Created {
                return;
            }
            state.phase = Phase::Dispatching;
            state.started = Instant::now();
            state.unicast = use_unicast;
        }

        if !use_multicast && !use_unicast {
            warn!(
                id = query.id(),
                questions = query.queries().len(),
                "no responder or resolver for query"
            );
        }

        let listener: Arc<dyn ResolverListener> = self.shared.clone();
        let targets = multicast
            .iter()
            .filter(|_| use_multicast)
            .chain(unicast.iter().filter(|_| use_unicast));
        for resolver in targets {
            let result = resolver.send_async(query, Arc::clone(&listener));
            let mut state = self.shared.state.lock();
            state.sent += 1;
            match result {
                Ok(id) => state.ids.push(id),
                Err(e) => {
                    debug!(id = query.id(), error = %e, "sub-query failed to send");
                    state.responses.push(Response::Failure(e));
                }
            }
        }

        let mut state = self.shared.state.lock();
        state.phase = Phase::Started;
        trace!(id = query.id(), sent = state.sent, "resolution started");
        drop(state);
        self.shared.arrived.notify_all();
    }

    /// Whether every dispatched sub-query has produced a response.
    pub fn has_results(&self) -> bool {
        has_results(&self.shared.state.lock())
    }

    /// Number of sub-queries dispatched.
    pub fn requests_sent(&self) -> usize {
        self.shared.state.lock().sent
    }

    /// Responses collected so far, in arrival order.
    pub fn responses(&self) -> Vec<Response> {
        self.shared.state.lock().responses.clone()
    }

    /// Block until complete or the deadline passes. Returns whether the
    /// resolution completed.
    pub fn wait(&self) -> bool {
        let mut state = self.shared.state.lock();
        let deadline = state.started + self.shared.wait_for(&state);
        loop {
            if has_results(&state) {
                return true;
            }
            if Instant::now() >= deadline {
                return false;
            }
            // Deadline is absolute, so spurious wakeups just loop.
            self.shared.arrived.wait_until(&mut state, deadline);
        }
    }

    /// Wait for completion and merge the collected responses.
    pub fn get_response(&self) -> Result<Message> {
        let complete = self.wait();
        let state = self.shared.state.lock();
        let merged = merge(&self.shared.query, &state.responses, state.sent);

        let outcome = match &merged {
            Err(_) => ResolutionOutcome::Failed,
            Ok(m) if m.response_code() == ResponseCode::NXDomain => ResolutionOutcome::NxDomain,
            Ok(_) if !complete || has_failures(&state.responses) => ResolutionOutcome::Partial,
            Ok(_) => ResolutionOutcome::Success,
        };
        metrics::record_resolution(outcome, state.sent, state.started.elapsed());
        debug!(
            id = self.shared.query.id(),
            sent = state.sent,
            responses = state.responses.len(),
            complete,
            ?outcome,
            "resolution finished"
        );
        merged
    }
}

impl Shared {
    fn wait_for(&self, state: &State) -> Duration {
        if state.unicast {
            self.timeout
        } else {
            self.response_wait
        }
    }

    fn attributed(&self, state: &State, id: RequestId, response: &Message) -> bool {
        state.ids.is_empty() || state.ids.contains(&id) || answers_query(&self.query, response)
    }
}

impl ResolverListener for Shared {
    fn received_response(&self, id: RequestId, response: &Message) -> ListenerResult {
        {
            let mut state = self.state.lock();
            if !self.attributed(&state, id, response) {
                return Ok(());
            }
            state.responses.push(Response::Message(response.clone()));
        }
        self.arrived.notify_all();

        match &self.listener {
            Some(listener) => listener.received_response(id, response),
            None => Ok(()),
        }
    }

    fn handle_error(&self, id: RequestId, error: &Error) -> ListenerResult {
        self.state.lock().responses.push(Response::Failure(error.clone()));
        self.arrived.notify_all();

        match &self.listener {
            Some(listener) => listener.handle_error(id, error),
            None => Ok(()),
        }
    }
}

fn has_results(state: &State) -> bool {
    state.phase == Phase::Started && state.responses.len() >= state.sent
}

fn has_failures(responses: &[Response]) -> bool {
    responses.iter().any(|r| matches!(r, Response::Failure(_)))
}

/// Merge `responses` into one answer built on `query`.
pub(crate) fn merge(query: &Message, responses: &[Response], sent: usize) -> Result<Message> {
    let mut answer = query.clone();
    answer.set_message_type(MessageType::Response);

    let mut added = 0;
    let mut successes = 0;
    let mut failures = 0;
    let mut first_error = None;

    for response in responses {
        let message = match response {
            Response::Failure(e) => {
                failures += 1;
                first_error.get_or_insert_with(|| e.clone());
                continue;
            }
            Response::Message(m) => m,
        };
        successes += 1;
        if message.response_code() != ResponseCode::NoError {
            continue;
        }
        if message.authoritative() {
            answer.set_authoritative(true);
        }
        if message.authentic_data() {
            answer.set_authentic_data(true);
        }
        for record in message.answers() {
            if !contains(answer.answers(), record) {
                answer.add_answer(record.clone());
                added += 1;
            }
        }
        for record in message.name_servers() {
            if !contains(answer.name_servers(), record) {
                answer.add_name_server(record.clone());
                added += 1;
            }
        }
        for record in message.additionals() {
            if !contains(answer.additionals(), record) {
                answer.add_additional(record.clone());
                added += 1;
            }
        }
    }

    if successes == 0 && failures > 0 && failures >= sent {
        if let Some(e) = first_error {
            return Err(e);
        }
    }
    if added == 0 {
        answer.set_response_code(ResponseCode::NXDomain);
    }
    Ok(answer)
}

/// Record identity ignores TTL.
fn same_record(a: &Record, b: &Record) -> bool {
    a.name() == b.name()
        && a.record_type() == b.record_type()
        && a.dns_class() == b.dns_class()
        && a.data() == b.data()
}

fn contains(section: &[Record], record: &Record) -> bool {
    section.iter().any(|r| same_record(r, record))
}
