//! Multicast-only querier for one address family.

use std::net::IpAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use hickory_proto::op::Message;
use parking_lot::Mutex;
use tracing::{debug, info};

use super::{send_and_wait, Querier, RequestId, Resolver, ResolverListener, ResponseRouter};
use crate::config::Config;
use crate::error::{Error, Result};
use crate::executor::Executors;
use crate::net::multicast::{GROUP_V4, GROUP_V6};
use crate::net::{MulticastProcessor, NetworkProcessor};

/// Sends queries to the mDNS group of one address family and routes the
/// responses to waiting requests and registered listeners.
pub struct MulticastQuerier {
    processor: Arc<MulticastProcessor>,
    router: Arc<ResponseRouter>,
    timeout: Mutex<Duration>,
    closed: AtomicBool,
}

impl MulticastQuerier {
    /// Join the mDNS group of `interface`'s address family and start reading.
    pub fn open(interface: IpAddr, config: &Config, executors: Arc<Executors>) -> Result<Arc<Self>> {
        let (group, name) = match interface {
            IpAddr::V4(_) => (IpAddr::V4(GROUP_V4), "mdns-v4"),
            IpAddr::V6(_) => (IpAddr::V6(GROUP_V6), "mdns-v6"),
        };
        let router = ResponseRouter::new(name);
        let processor = MulticastProcessor::open(
            interface,
            group,
            config.querier.multicast_port,
            router.clone(),
            executors,
            &config.network,
        )?;
        processor.start()?;
        info!(%interface, %group, "multicast querier ready");

        Ok(Arc::new(Self {
            processor,
            router,
            timeout: Mutex::new(config.querier.timeout()),
            closed: AtomicBool::new(false),
        }))
    }

    /// Underlying processor.
    pub fn processor(&self) -> &Arc<MulticastProcessor> {
        &self.processor
    }

    fn ensure_open(&self) -> Result<()> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(Error::Closed("multicast querier"));
        }
        Ok(())
    }

    fn encode(&self, message: &Message) -> Result<Vec<u8>> {
        let bytes = message.to_vec()?;
        if bytes.len() > self.processor.max_payload_size() {
            debug!(
                bytes = bytes.len(),
                max = self.processor.max_payload_size(),
                "message exceeds negotiated payload size"
            );
        }
        Ok(bytes)
    }
}

impl Resolver for MulticastQuerier {
    fn send(&self, query: &Message) -> Result<Message> {
        self.ensure_open()?;
        send_and_wait(self, query, self.timeout())
    }

    fn send_async(
        &self,
        query: &Message,
        listener: Arc<dyn ResolverListener>,
    ) -> Result<RequestId> {
        self.ensure_open()?;
        let bytes = self.encode(query)?;
        let id = RequestId::of(query);

        // Registered before sending so a fast answer is not missed.
        self.router
            .add_pending(id, Arc::clone(&listener), self.timeout());
        if let Err(e) = self.processor.send(&bytes) {
            self.router.remove_pending(&listener);
            return Err(e);
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
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.processor.close();
        self.router.close();
    }
}

impl Querier for MulticastQuerier {
    fn broadcast(&self, message: &Message, add_known_answers: bool) -> Result<()> {
        self.ensure_open()?;
        let bytes = if add_known_answers {
            self.encode(message)?
        } else {
            let mut message = message.clone();
            message.take_answers();
            self.encode(&message)?
        };
        self.processor.send(&bytes)
    }

    fn register_listener(
        &self,
        listener: Arc<dyn ResolverListener>,
    ) -> Result<Arc<dyn ResolverListener>> {
        self.router.listeners().register(listener)
    }

    fn unregister_listener(
        &self,
        listener: &Arc<dyn ResolverListener>,
    ) -> Option<Arc<dyn ResolverListener>> {
        self.router.listeners().unregister(listener)
    }

    fn as_resolver(self: Arc<Self>) -> Arc<dyn Resolver> {
        self
    }
}

impl Drop for MulticastQuerier {
    fn drop(&mut self) {
        self.close();
    }
}
