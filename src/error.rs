//! Error types for mdns-querier.

use std::net::SocketAddr;
use std::sync::Arc;

use thiserror::Error;

/// Errors that can occur while configuring, transporting or resolving queries.
///
/// The enum is `Clone` so that a resolution can hand the first recorded
/// sub-query failure back to every caller waiting on it.
#[derive(Debug, Clone, Error)]
pub enum Error {
    /// Invalid configuration (mismatched address families, bad numeric option).
    #[error("Invalid configuration: {0}")]
    Config(String),

    /// Invalid service name or domain name text.
    #[error("Parse error: {0}")]
    Parse(String),

    /// Socket could not be created or bound.
    #[error("Failed to bind {address}: {source}")]
    Bind {
        /// Address the bind was attempted on.
        address: SocketAddr,
        /// Underlying I/O failure.
        #[source]
        source: Arc<std::io::Error>,
    },

    /// Multicast group membership could not be established.
    #[error("Failed to join multicast group {group}: {source}")]
    Join {
        /// Group address.
        group: std::net::IpAddr,
        /// Underlying I/O failure.
        #[source]
        source: Arc<std::io::Error>,
    },

    /// A datagram could not be sent.
    #[error("Error sending to {destination}: {message}")]
    Send {
        /// Destination of the failed send.
        destination: SocketAddr,
        /// Message of the underlying failure.
        message: String,
        /// Underlying I/O failure.
        #[source]
        source: Arc<std::io::Error>,
    },

    /// The processor, querier or registry has been closed.
    #[error("{0} is closed")]
    Closed(&'static str),

    /// The processor only receives; it has no write path.
    #[error("Processor at {0} is receive-only")]
    ReceiveOnly(SocketAddr),

    /// DNS codec error.
    #[error("DNS protocol error: {0}")]
    Proto(Arc<hickory_proto::ProtoError>),

    /// IO error (network, file, etc.)
    #[error("IO error: {0}")]
    Io(Arc<std::io::Error>),

    /// A synchronous request produced no answer before its deadline.
    #[error("Timed out waiting for response")]
    Timeout,

    /// A listener failed while a dispatch was fanned out to it.
    #[error("Listener dispatch failed: {0}")]
    Listener(String),

    /// A task was refused by an executor pool.
    #[error("Task rejected by {0} pool")]
    Rejected(&'static str),

    /// No multicast responder and no unicast resolver could be constructed.
    #[error("No multicast responders or unicast resolvers available")]
    NoResponders,
}

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        Error::Io(Arc::new(err))
    }
}

impl From<hickory_proto::ProtoError> for Error {
    fn from(err: hickory_proto::ProtoError) -> Self {
        Error::Proto(Arc::new(err))
    }
}

impl From<config::ConfigError> for Error {
    fn from(err: config::ConfigError) -> Self {
        Error::Config(err.to_string())
    }
}

/// Result alias used throughout the crate.
pub type Result<T> = std::result::Result<T, Error>;
