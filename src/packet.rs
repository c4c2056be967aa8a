//! Wire format of outgoing probes and inbound ICMP control messages.

pub mod construct;
pub mod deconstruct;
pub mod layout;

pub use construct::{Constructor, Ipv4Constructor, Ipv6Constructor, ProbeRequest};
pub use deconstruct::{Deconstructor, Ipv4Deconstructor, Ipv6Deconstructor, Receipt, ReceiptKind};
