//! Telemetry setup for mdns-querier.
//!
//! Supports:
//! - Tracing with configurable log levels, switchable to verbose at runtime
//! - Prometheus metrics endpoint (with `prometheus` feature)

#[cfg(feature = "prometheus")]
use std::net::SocketAddr;
use std::sync::OnceLock;

use tracing::info;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{reload, EnvFilter, Registry};

use crate::config::TelemetryConfig;

/// Filter directive applied while verbose logging is on.
const VERBOSE_DIRECTIVE: &str = "mdns_querier=trace,debug";

struct FilterControl {
    handle: reload::Handle<EnvFilter, Registry>,
    base: String,
}

static FILTER: OnceLock<FilterControl> = OnceLock::new();

/// Initialize telemetry (tracing, metrics).
pub fn init(config: &TelemetryConfig) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    init_tracing(config)?;

    // Start Prometheus exporter if configured
    #[cfg(feature = "prometheus")]
    if let Some(addr) = config.prometheus_addr {
        start_prometheus_exporter(addr)?;
    }

    Ok(())
}

fn init_tracing(config: &TelemetryConfig) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    // RUST_LOG wins over the configured level.
    let base = std::env::var(EnvFilter::DEFAULT_ENV).unwrap_or_else(|_| config.log_level.clone());
    let initial = if config.verbose {
        VERBOSE_DIRECTIVE
    } else {
        base.as_str()
    };
    let (filter, handle) = reload::Layer::new(EnvFilter::try_new(initial)?);

    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().with_thread_names(true))
        .try_init()?;

    let _ = FILTER.set(FilterControl { handle, base });
    if config.verbose {
        info!("verbose logging enabled");
    }
    Ok(())
}

/// Switch verbose logging on or off.
///
/// Returns `false` when telemetry was not initialized through [`init`] or the
/// filter could not be swapped.
pub fn set_verbose(verbose: bool) -> bool {
    let Some(control) = FILTER.get() else {
        return false;
    };
    let directive = if verbose {
        VERBOSE_DIRECTIVE
    } else {
        control.base.as_str()
    };
    let filter = match EnvFilter::try_new(directive) {
        Ok(filter) => filter,
        Err(e) => {
            tracing::warn!(error = %e, "invalid log filter");
            return false;
        }
    };
    match control.handle.reload(filter) {
        Ok(()) => {
            info!(verbose, "log filter updated");
            true
        }
        Err(e) => {
            tracing::warn!(error = %e, "failed to reload log filter");
            false
        }
    }
}

/// Start Prometheus metrics HTTP exporter.
#[cfg(feature = "prometheus")]
fn start_prometheus_exporter(
    addr: SocketAddr,
) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    use metrics_exporter_prometheus::PrometheusBuilder;

    PrometheusBuilder::new()
        .with_http_listener(addr)
        .install()?;

    info!(%addr, "Prometheus metrics exporter started");

    Ok(())
}
