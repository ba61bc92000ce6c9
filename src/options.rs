//! Runtime options re-evaluated while the process runs.
//!
//! Verbose logging can be switched on without a restart by setting any of
//! [`VERBOSE_VARS`]; the environment is re-read every [`REPOLL_INTERVAL`].

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tracing::info;

use crate::config::TelemetryConfig;
use crate::error::Result;
use crate::executor::{ScheduledHandle, Scheduler};
use crate::metrics;
use crate::telemetry;

/// Environment variables that enable verbose logging. Any one suffices.
pub const VERBOSE_VARS: &[&str] = &["MDNS_VERBOSE", "MDNS_DEBUG", "DNSSD_VERBOSE"];

/// How often the environment is re-read.
pub const REPOLL_INTERVAL: Duration = Duration::from_secs(60);

/// Live option values.
#[derive(Debug)]
pub struct Options {
    configured_verbose: bool,
    verbose: AtomicBool,
}

impl Options {
    /// Options seeded from `config` and the current environment.
    pub fn new(config: &TelemetryConfig) -> Arc<Self> {
        let verbose = config.verbose || verbose_from(|k| std::env::var(k).ok());
        metrics::record_verbose(verbose);
        Arc::new(Self {
            configured_verbose: config.verbose,
            verbose: AtomicBool::new(verbose),
        })
    }

    /// Whether verbose logging is on.
    pub fn is_verbose(&self) -> bool {
        self.verbose.load(Ordering::Relaxed)
    }

    /// Re-read the environment. Returns whether the verbose flag changed.
    pub fn refresh(&self) -> bool {
        self.apply(self.configured_verbose || verbose_from(|k| std::env::var(k).ok()))
    }

    fn apply(&self, verbose: bool) -> bool {
        if self.verbose.swap(verbose, Ordering::Relaxed) == verbose {
            return false;
        }
        info!(verbose, "verbose logging toggled");
        telemetry::set_verbose(verbose);
        metrics::record_verbose(verbose);
        true
    }

    /// Re-read the environment every [`REPOLL_INTERVAL`] on `scheduler`.
    pub fn schedule(self: &Arc<Self>, scheduler: &Scheduler) -> Result<ScheduledHandle> {
        let options = Arc::downgrade(self);
        scheduler.schedule_at_fixed_rate(REPOLL_INTERVAL, REPOLL_INTERVAL, move || {
            if let Some(options) = options.upgrade() {
                options.refresh();
            }
        })
    }
}

/// OR of the verbose variables, read through `lookup`.
pub fn verbose_from<F>(lookup: F) -> bool
where
    F: Fn(&str) -> Option<String>,
{
    VERBOSE_VARS
        .iter()
        .filter_map(|var| lookup(var))
        .any(|value| is_truthy(&value))
}

/// `1`, `true`, `yes` or `on`, case-insensitively.
pub fn is_truthy(value: &str) -> bool {
    matches!(
        value.trim().to_ascii_lowercase().as_str(),
        "1" | "true" | "yes" | "on"
    )
}
