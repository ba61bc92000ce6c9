//! The composite querier: multicast responders per address family plus
//! unicast resolvers, behind one [`Querier`].

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use hickory_proto::op::Message;
use parking_lot::Mutex;
use tracing::{debug, info, warn};

use super::unicast::{system_nameservers, UnicastResolver};
use super::{
    MulticastQuerier, Querier, RequestId, Resolution, Resolver, ResolverListener, ResponseRouter,
};
use crate::config::Config;
use crate::error::{Error, Result};
use crate::executor::Executors;
use crate::listener::ListenerRegistry;
use crate::net::{NetworkProcessor, UnicastProcessor};

/// Fans each query out to every eligible responder and merges the answers.
pub struct MulticastDnsQuerier {
    multicast: Vec<Arc<dyn Querier>>,
    multicast_resolvers: Vec<Arc<dyn Resolver>>,
    unicast: Vec<Arc<dyn Resolver>>,
    unicast_processor: Mutex<Option<Arc<UnicastProcessor>>>,
    listeners: ListenerRegistry<dyn ResolverListener>,
    response_wait: Duration,
    timeout: Mutex<Duration>,
    closed: AtomicBool,
}

impl MulticastDnsQuerier {
    /// Build the responders and resolvers described by `config`.
    ///
    /// A responder that cannot be opened (e.g. no IPv6 on this host) is
    /// logged and skipped. Fails with [`Error::NoResponders`] if nothing at
    /// all could be built.
    pub fn new(config: &Config, executors: Arc<Executors>) -> Result<Self> {
        let mut multicast: Vec<Arc<dyn Querier>> = Vec::new();
        let families = [
            (
                config.querier.ipv4,
                config
                    .network
                    .interface_v4
                    .unwrap_or(IpAddr::V4(Ipv4Addr::UNSPECIFIED)),
            ),
            (
                config.querier.ipv6,
                config
                    .network
                    .interface_v6
                    .unwrap_or(IpAddr::V6(Ipv6Addr::UNSPECIFIED)),
            ),
        ];
        for (enabled, interface) in families {
            if !enabled {
                continue;
            }
            match MulticastQuerier::open(interface, config, Arc::clone(&executors)) {
                Ok(querier) => multicast.push(querier),
                Err(e) => warn!(%interface, error = %e, "multicast responder unavailable"),
            }
        }

        let nameservers = if config.querier.nameservers.is_empty() {
            system_nameservers()
        } else {
            config.querier.nameservers.clone()
        };
        let unicast: Vec<Arc<dyn Resolver>> = nameservers
            .into_iter()
            .map(|server| {
                Arc::new(UnicastResolver::new(
                    server,
                    config.querier.timeout(),
                    Arc::clone(&executors),
                )) as Arc<dyn Resolver>
            })
            .collect();

        let querier = Self::with_resolvers(
            multicast,
            unicast,
            config.querier.response_wait(),
            config.querier.timeout(),
        )?;

        if let Some(address) = config.network.unicast_listen {
            let router = ResponseRouter::new("unicast-listen");
            router
                .listeners()
                .register(Arc::new(querier.listeners.dispatcher()))?;
            let opened = UnicastProcessor::with_poll_timeout(
                address,
                router,
                executors,
                &config.network,
                config.querier.response_wait(),
            )
            .and_then(|processor| processor.start().map(|()| processor));
            match opened {
                Ok(processor) => *querier.unicast_processor.lock() = Some(processor),
                Err(e) => warn!(%address, error = %e, "unicast listener unavailable"),
            }
        }

        Ok(querier)
    }

    /// Assemble a querier from already-built responders and resolvers.
    pub fn with_resolvers(
        multicast: Vec<Arc<dyn Querier>>,
        unicast: Vec<Arc<dyn Resolver>>,
        response_wait: Duration,
        timeout: Duration,
    ) -> Result<Self> {
        if multicast.is_empty() && unicast.is_empty() {
            return Err(Error::NoResponders);
        }

        let listeners: ListenerRegistry<dyn ResolverListener> = ListenerRegistry::new("querier");
        for querier in &multicast {
            querier.register_listener(Arc::new(listeners.dispatcher()))?;
        }
        let multicast_resolvers = multicast
            .iter()
            .map(|q| Arc::clone(q).as_resolver())
            .collect();

        info!(
            multicast = multicast.len(),
            unicast = unicast.len(),
            response_wait_ms = response_wait.as_millis() as u64,
            timeout_ms = timeout.as_millis() as u64,
            "querier ready"
        );

        Ok(Self {
            multicast,
            multicast_resolvers,
            unicast,
            unicast_processor: Mutex::new(None),
            listeners,
            response_wait,
            timeout: Mutex::new(timeout),
            closed: AtomicBool::new(false),
        })
    }

    /// Number of multicast responders.
    pub fn multicast_count(&self) -> usize {
        self.multicast.len()
    }

    /// Number of unicast resolvers.
    pub fn unicast_count(&self) -> usize {
        self.unicast.len()
    }

    /// The TCP listener opened for `network.unicast_listen`, until closed.
    pub fn unicast_listener(&self) -> Option<Arc<UnicastProcessor>> {
        self.unicast_processor.lock().clone()
    }

    /// Start a resolution and return it without waiting.
    ///
    /// `listener` is told about every sub-response as it arrives; the
    /// merged answer is available from [`Resolution::get_response`].
    pub fn resolve(
        &self,
        query: &Message,
        listener: Option<Arc<dyn ResolverListener>>,
    ) -> Result<Resolution> {
        self.ensure_open()?;
        let resolution = Resolution::new(query.clone(), listener, self.response_wait, self.timeout());
        resolution.start(&self.multicast_resolvers, &self.unicast);
        Ok(resolution)
    }

    fn ensure_open(&self) -> Result<()> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(Error::Closed("querier"));
        }
        Ok(())
    }
}

impl Resolver for MulticastDnsQuerier {
    fn send(&self, query: &Message) -> Result<Message> {
        self.resolve(query, None)?.get_response()
    }

    fn send_async(
        &self,
        query: &Message,
        listener: Arc<dyn ResolverListener>,
    ) -> Result<RequestId> {
        self.resolve(query, Some(listener))?;
        Ok(RequestId::of(query))
    }

    fn set_timeout(&self, timeout: Duration) {
        *self.timeout.lock() = timeout;
        for resolver in self.multicast_resolvers.iter().chain(&self.unicast) {
            resolver.set_timeout(timeout);
        }
    }

    fn timeout(&self) -> Duration {
        *self.timeout.lock()
    }

    fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        for resolver in self.multicast_resolvers.iter().chain(&self.unicast) {
            resolver.close();
        }
        if let Some(processor) = self.unicast_processor.lock().take() {
            processor.close();
        }
        self.listeners.close();
        debug!("querier closed");
    }
}

impl Querier for MulticastDnsQuerier {
    fn broadcast(&self, message: &Message, add_known_answers: bool) -> Result<()> {
        self.ensure_open()?;

        let mut accepted = 0;
        let mut first_error = None;
        for querier in &self.multicast {
            match querier.broadcast(message, add_known_answers) {
                Ok(()) => accepted += 1,
                Err(e) => {
                    debug!(error = %e, "multicast broadcast failed");
                    first_error.get_or_insert(e);
                }
            }
        }

        let observer: Arc<dyn ResolverListener> = Arc::new(self.listeners.dispatcher());
        for resolver in &self.unicast {
            if let Err(e) = resolver.send_async(message, Arc::clone(&observer)) {
                debug!(error = %e, "unicast broadcast failed");
            }
        }

        match first_error {
            Some(e) if accepted == 0 => Err(e),
            _ => Ok(()),
        }
    }

    fn register_listener(
        &self,
        listener: Arc<dyn ResolverListener>,
    ) -> Result<Arc<dyn ResolverListener>> {
        self.listeners.register(listener)
    }

    fn unregister_listener(
        &self,
        listener: &Arc<dyn ResolverListener>,
    ) -> Option<Arc<dyn ResolverListener>> {
        self.listeners.unregister(listener)
    }

    fn as_resolver(self: Arc<Self>) -> Arc<dyn Resolver> {
        self
    }
}

impl Drop for MulticastDnsQuerier {
    fn drop(&mut self) {
        self.close();
    }
}
