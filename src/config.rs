//! Configuration types for mdns-querier.

use serde::{Deserialize, Serialize};
use std::net::{IpAddr, SocketAddr};
use std::path::Path;
use std::time::Duration;

use crate::error::{Error, Result};

/// Top-level configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    /// Query fan-out and resolution timing.
    #[serde(default)]
    pub querier: QuerierConfig,

    /// Socket and processor settings.
    #[serde(default)]
    pub network: NetworkConfig,

    /// Worker pool sizing.
    #[serde(default)]
    pub executors: ExecutorsConfig,

    /// Telemetry configuration.
    #[serde(default)]
    pub telemetry: TelemetryConfig,
}

impl Config {
    /// Load configuration from an optional TOML file, overridden by
    /// `MDNS__<SECTION>__<KEY>` environment variables.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut builder = config::Config::builder();
        if let Some(path) = path {
            builder = builder.add_source(config::File::from(path));
        }
        let config: Config = builder
            .add_source(
                config::Environment::with_prefix("MDNS")
                    .prefix_separator("__")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?
            .try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    /// Reject option values the querier cannot work with.
    pub fn validate(&self) -> Result<()> {
        if self.querier.response_wait_ms == 0 {
            return Err(Error::Config("querier.response_wait_ms must be > 0".into()));
        }
        if self.querier.timeout_ms < self.querier.response_wait_ms {
            return Err(Error::Config(
                "querier.timeout_ms must be >= querier.response_wait_ms".into(),
            ));
        }
        if self.network.multicast_ttl == 0 {
            return Err(Error::Config("network.multicast_ttl must be > 0".into()));
        }
        for (name, pool) in [
            ("network", &self.executors.network),
            ("general", &self.executors.general),
            ("scheduled", &self.executors.scheduled),
        ] {
            pool.validate(name)?;
        }
        Ok(())
    }
}

/// Query fan-out and resolution timing.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QuerierConfig {
    /// Time to wait for responses before a resolution completes, in ms.
    #[serde(default = "default_response_wait_ms")]
    pub response_wait_ms: u64,

    /// Upper bound for a synchronous send, in ms.
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,

    /// Create an IPv4 multicast responder.
    #[serde(default = "default_true")]
    pub ipv4: bool,

    /// Create an IPv6 multicast responder.
    #[serde(default = "default_true")]
    pub ipv6: bool,

    /// Multicast DNS port.
    #[serde(default = "default_mdns_port")]
    pub multicast_port: u16,

    /// Unicast nameservers. Empty means read `/etc/resolv.conf`.
    #[serde(default)]
    pub nameservers: Vec<SocketAddr>,
}

impl QuerierConfig {
    /// Response-wait window.
    pub fn response_wait(&self) -> Duration {
        Duration::from_millis(self.response_wait_ms)
    }

    /// Overall resolution timeout.
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

impl Default for QuerierConfig {
    fn default() -> Self {
        Self {
            response_wait_ms: default_response_wait_ms(),
            timeout_ms: default_timeout_ms(),
            ipv4: true,
            ipv6: true,
            multicast_port: default_mdns_port(),
            nameservers: Vec::new(),
        }
    }
}

/// Socket and processor settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NetworkConfig {
    /// Run the periodic processor health monitor.
    #[serde(default)]
    pub thread_monitor: bool,

    /// Suppress local delivery of our own multicast packets.
    #[serde(default)]
    pub multicast_loopback_disabled: bool,

    /// TTL / hop limit for multicast sends.
    #[serde(default = "default_multicast_ttl")]
    pub multicast_ttl: u32,

    /// Interface address for the IPv4 responder (unspecified if unset).
    #[serde(default)]
    pub interface_v4: Option<IpAddr>,

    /// Interface address for the IPv6 responder (unspecified if unset).
    #[serde(default)]
    pub interface_v6: Option<IpAddr>,

    /// Listen address for a receive-only unicast processor.
    #[serde(default)]
    pub unicast_listen: Option<SocketAddr>,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            thread_monitor: false,
            multicast_loopback_disabled: false,
            multicast_ttl: default_multicast_ttl(),
            interface_v4: None,
            interface_v6: None,
            unicast_listen: None,
        }
    }
}

/// What a pool does when its queue is full and it cannot grow.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum OverflowPolicy {
    /// Drop the task and log it.
    Reject,
    /// Run the task on a fresh, unpooled thread.
    RunUnpooled,
}

/// Sizing for one worker pool.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PoolConfig {
    /// Threads kept alive while idle.
    pub core_threads: usize,
    /// Upper bound on pooled threads.
    pub max_threads: usize,
    /// Bounded queue capacity.
    pub queue_depth: usize,
    /// Nice adjustment applied to pool threads (Linux only, 0 = unchanged).
    #[serde(default)]
    pub priority: i32,
    /// Overflow behavior.
    pub overflow: OverflowPolicy,
}

impl PoolConfig {
    fn validate(&self, name: &str) -> Result<()> {
        if self.core_threads == 0 || self.max_threads < self.core_threads {
            return Err(Error::Config(format!(
                "executors.{name}: need 0 < core_threads <= max_threads"
            )));
        }
        if self.queue_depth == 0 {
            return Err(Error::Config(format!(
                "executors.{name}.queue_depth must be > 0"
            )));
        }
        Ok(())
    }
}

/// Sizing for the three executor pools.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutorsConfig {
    /// Packet dispatch pool.
    #[serde(default = "default_network_pool")]
    pub network: PoolConfig,

    /// General async work (unicast sends, listener callbacks).
    #[serde(default = "default_general_pool")]
    pub general: PoolConfig,

    /// Periodic tasks (health monitor, options re-poll).
    #[serde(default = "default_scheduled_pool")]
    pub scheduled: PoolConfig,
}

impl Default for ExecutorsConfig {
    fn default() -> Self {
        Self {
            network: default_network_pool(),
            general: default_general_pool(),
            scheduled: default_scheduled_pool(),
        }
    }
}

/// Telemetry configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TelemetryConfig {
    /// Log level filter (e.g., "info", "debug", "mdns_querier=debug,warn").
    #[serde(default = "default_log_level")]
    pub log_level: String,

    /// Start with verbose diagnostic logging enabled.
    #[serde(default)]
    pub verbose: bool,

    /// Prometheus metrics exporter address.
    #[serde(default)]
    pub prometheus_addr: Option<SocketAddr>,
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
            verbose: false,
            prometheus_addr: None,
        }
    }
}

fn default_true() -> bool {
    true
}

fn default_response_wait_ms() -> u64 {
    250
}

fn default_timeout_ms() -> u64 {
    6000
}

fn default_mdns_port() -> u16 {
    5353
}

fn default_multicast_ttl() -> u32 {
    255
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_network_pool() -> PoolConfig {
    PoolConfig {
        core_threads: 2,
        max_threads: 8,
        queue_depth: 256,
        priority: 0,
        overflow: OverflowPolicy::Reject,
    }
}

fn default_general_pool() -> PoolConfig {
    PoolConfig {
        core_threads: 2,
        max_threads: 16,
        queue_depth: 128,
        priority: 0,
        overflow: OverflowPolicy::RunUnpooled,
    }
}

fn default_scheduled_pool() -> PoolConfig {
    PoolConfig {
        core_threads: 1,
        max_threads: 2,
        queue_depth: 32,
        priority: 0,
        overflow: OverflowPolicy::Reject,
    }
}
