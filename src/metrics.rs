//! Metrics instrumentation for mdns-querier.
//!
//! All metrics are prefixed with `mdns.`

use metrics::{counter, gauge, histogram};
use std::time::Duration;

/// Kind of network processor, used as a metric label.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessorKind {
    /// UDP multicast processor.
    Multicast,
    /// TCP receive-only processor.
    Unicast,
}

impl ProcessorKind {
    /// Label value.
    pub fn as_str(self) -> &'static str {
        match self {
            ProcessorKind::Multicast => "multicast",
            ProcessorKind::Unicast => "unicast",
        }
    }
}

/// Record a received packet.
pub fn record_packet_received(kind: ProcessorKind, bytes: usize) {
    counter!("mdns.packet.received.count", "kind" => kind.as_str()).increment(1);
    histogram!("mdns.packet.received.bytes", "kind" => kind.as_str()).record(bytes as f64);
}

/// Record a sent packet.
pub fn record_packet_sent(kind: ProcessorKind, bytes: usize) {
    counter!("mdns.packet.sent.count", "kind" => kind.as_str()).increment(1);
    histogram!("mdns.packet.sent.bytes", "kind" => kind.as_str()).record(bytes as f64);
}

/// Record a packet that was received but never dispatched.
pub fn record_packet_dropped(kind: ProcessorKind, reason: &'static str) {
    counter!("mdns.packet.dropped.count", "kind" => kind.as_str(), "reason" => reason)
        .increment(1);
}

/// Record a failed send.
pub fn record_send_error(kind: ProcessorKind) {
    counter!("mdns.packet.send_error.count", "kind" => kind.as_str()).increment(1);
}

/// Record a processor being force-closed (unreachable route or health monitor).
pub fn record_processor_closed(kind: ProcessorKind, reason: &'static str) {
    counter!("mdns.processor.closed.count", "kind" => kind.as_str(), "reason" => reason)
        .increment(1);
}

/// Record a task rejected by an executor pool.
pub fn record_rejected_task(pool: &'static str) {
    counter!("mdns.executor.rejected.count", "pool" => pool).increment(1);
}

/// Record the number of open unicast connections.
pub fn record_open_connections(count: usize) {
    gauge!("mdns.unicast.connections").set(count as f64);
}

/// How a resolution completed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResolutionOutcome {
    /// Every sub-query answered.
    Success,
    /// Some sub-queries failed or timed out, at least one record merged.
    Partial,
    /// No record merged.
    NxDomain,
    /// Every sub-query failed.
    Failed,
}

/// Record a completed resolution.
pub fn record_resolution(outcome: ResolutionOutcome, responders: usize, duration: Duration) {
    let outcome_str = match outcome {
        ResolutionOutcome::Success => "success",
        ResolutionOutcome::Partial => "partial",
        ResolutionOutcome::NxDomain => "nxdomain",
        ResolutionOutcome::Failed => "failed",
    };

    counter!("mdns.resolution.count", "outcome" => outcome_str).increment(1);
    histogram!("mdns.resolution.duration.seconds").record(duration.as_secs_f64());
    histogram!("mdns.resolution.responders").record(responders as f64);
}

/// Record a unicast query that had to be retried over TCP.
pub fn record_tcp_retry() {
    counter!("mdns.unicast.tcp_retry.count").increment(1);
}

/// Record a change of the verbose logging flag.
pub fn record_verbose(enabled: bool) {
    gauge!("mdns.options.verbose").set(if enabled { 1.0 } else { 0.0 });
}
