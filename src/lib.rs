//! mdns-querier - Multicast DNS / DNS-SD resolution with unicast DNS fallback.
//!
//! This crate issues one logical DNS query against every applicable responder
//! (mDNS over IPv4, mDNS over IPv6, unicast nameservers), collects the
//! responses as they race in, and merges them into one answer.
//!
//! ## Features
//!
//! - Multicast processors per address family with their own reader threads
//! - Unicast DNS over UDP, retried over TCP on truncation
//! - Response aggregation with deduplication and timeout-based completion
//! - DNS-SD service name parsing with RFC 1035 label escaping
//! - Ordered listener fan-out with early stop
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────────┐
//! │                         mdns-querier                             │
//! │                                                                  │
//! │  caller ──▶ MulticastDnsQuerier ──▶ Resolution                   │
//! │                 │                      │ send_async              │
//! │                 │        ┌─────────────┼──────────────┐          │
//! │                 │        ▼             ▼              ▼          │
//! │                 │  MulticastQuerier MulticastQuerier UnicastRes. │
//! │                 │     (IPv4)          (IPv6)        (UDP/TCP)    │
//! │                 │        │             │                         │
//! │                 │  MulticastProcessor (reader thread)            │
//! │                 │        │ Packet                                │
//! │                 │        ▼                                       │
//! │                 │  network pool ──▶ ResponseRouter ──▶ listeners │
//! │                 ▼                                                │
//! │             Executors (network, general, scheduler)              │
//! └──────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Example Usage
//!
//! ```rust,ignore
//! use mdns_querier::{Config, Executors, Lookup, MulticastDnsQuerier};
//! use std::sync::Arc;
//!
//! let config = Config::default();
//! let executors = Executors::new(&config.executors)?;
//! let querier = Arc::new(MulticastDnsQuerier::new(&config, executors.clone())?);
//!
//! let lookup = Lookup::new(querier.clone());
//! for service in lookup.browse("_http._tcp.local.")? {
//!     println!("{service}");
//! }
//!
//! querier.close();
//! executors.shutdown();
//! ```

#![warn(missing_docs)]

pub mod config;
pub mod error;
pub mod executor;
pub mod listener;
pub mod lookup;
pub mod metrics;
pub mod net;
pub mod options;
pub mod querier;
pub mod service_name;
pub mod telemetry;

// Re-export main types
pub use config::{Config, ExecutorsConfig, NetworkConfig, QuerierConfig, TelemetryConfig};
pub use error::{Error, Result};
pub use executor::Executors;
pub use listener::{ListenerError, ListenerRegistry, ListenerResult};
pub use lookup::Lookup;
pub use querier::{
    MulticastDnsQuerier, Querier, RequestId, Resolution, Resolver, ResolverListener,
};
pub use service_name::ServiceName;
