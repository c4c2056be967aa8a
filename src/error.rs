//! Error types for tracing operations.

use thiserror::Error;

/// Everything that can go wrong while resolving, probing, receiving or dispatching.
#[derive(Error, Debug)]
pub enum TraceError {
    #[error("invalid {field} address ({value})")]
    AddressParse { field: &'static str, value: String },

    #[error("address family mismatch: {0}")]
    FamilyMismatch(String),

    #[error("configuration error: {0}")]
    Configuration(String),

    // Inbound datagrams
    #[error("incomplete ICMP message: expected at least {expected} bytes, got {actual}")]
    TruncatedMessage { expected: usize, actual: usize },

    #[error("unknown ICMP control message type ({0})")]
    UnknownMessageKind(u8),

    #[error("IPv4 header with options is not supported (header length {header_len} bytes)")]
    UnsupportedIpOptions { header_len: usize },

    #[error("{0} is not implemented")]
    NotImplemented(&'static str),

    #[error("socket {op} failed: {source}")]
    Socket {
        op: &'static str,
        #[source]
        source: std::io::Error,
    },

    // Runtime reports, never returned synchronously
    #[error("{channel} channel full, dropping message")]
    ChannelOverflow { channel: &'static str },

    #[error("no trace registered for receipt ({key}), dropping it")]
    CorrelationMiss { key: String },

    #[error("background task failed: {0}")]
    Task(String),
}

impl TraceError {
    pub(crate) fn socket(op: &'static str) -> impl FnOnce(std::io::Error) -> Self {
        move |source| TraceError::Socket { op, source }
    }

    /// Whether a failed attempt may be retried on the same hop.
    ///
    /// Everything else means the target can never be probed with the current setup,
    /// so its session ends right away.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::Socket { .. } | Self::Task(_) | Self::ChannelOverflow { .. }
        )
    }
}
