//! Multi-target traceroute.
//!
//! Many targets are traced at once over raw IPv4 sockets. All traces share a single ICMP
//! receive socket; inbound messages are filtered by (source, destination) pair, decoded, and
//! routed to the trace whose probe triggered them.

pub mod checksum;
pub mod correlation;
pub mod counters;
pub mod error;
pub mod filter;
pub mod packet;
pub mod platform;
pub mod probe;
pub mod receive;
pub mod report;
pub mod result;
pub mod sink;
pub mod target;
pub mod tracer;

pub use correlation::CorrelationKey;
pub use counters::DebugInfo;
pub use error::TraceError;
pub use probe::{Prober, SendProbe};
pub use receive::{Datagram, Receiver, ReceiverConfig};
pub use result::{HopRecord, TraceResult};
pub use sink::ErrorSink;
pub use target::{AddressFamily, ProbeProtocol, ResolvedTarget, Target};
pub use tracer::{ProtocolStack, Tracer, TracerConfig};
