//! Admission of inbound datagrams before they are fully decoded.
//!
//! A raw ICMP socket sees every control message the host receives. Only messages about
//! a (source, destination) pair that is currently being traced are worth decoding.

use std::collections::HashMap;
use std::fmt;
use std::net::IpAddr;

use parking_lot::Mutex;
use pnet::packet::icmp::{IcmpPacket, IcmpTypes};
use pnet::packet::ipv4::Ipv4Packet;
use serde::Serialize;

use crate::packet::layout::*;

/// The (source, destination) pair of an original probe.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub struct FlowPair {
    pub src: IpAddr,
    pub dst: IpAddr,
}

impl FlowPair {
    pub fn new(src: IpAddr, dst: IpAddr) -> Self {
        Self { src, dst }
    }
}

impl fmt::Display for FlowPair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}", self.src, self.dst)
    }
}

/// Pulls out just the pair implicated by an IPv4 ICMP message, without decoding the rest.
///
/// Echo replies carry it swapped in their own header; error messages quote it.
pub fn flow_pair(datagram: &[u8]) -> Option<FlowPair> {
    if datagram.len() < MIN_MESSAGE_LEN {
        return None;
    }
    let outer = Ipv4Packet::new(datagram)?;
    if header_len(outer.get_header_length()) != IPV4_HEADER_LEN {
        return None;
    }
    let icmp = IcmpPacket::new(&datagram[OUTER_ICMP..])?;
    match icmp.get_icmp_type() {
        IcmpTypes::EchoReply => Some(FlowPair::new(
            outer.get_destination().into(),
            outer.get_source().into(),
        )),
        IcmpTypes::DestinationUnreachable | IcmpTypes::TimeExceeded => {
            let inner = Ipv4Packet::new(datagram.get(EMBEDDED_IP..EMBEDDED_L4)?)?;
            Some(FlowPair::new(
                inner.get_source().into(),
                inner.get_destination().into(),
            ))
        }
        _ => None,
    }
}

/// Pairs under trace, reference counted since several targets may share one.
#[derive(Debug, Default)]
pub struct FilterSet {
    pairs: Mutex<HashMap<FlowPair, usize>>,
}

impl FilterSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, pair: FlowPair) {
        *self.pairs.lock().entry(pair).or_insert(0) += 1;
    }

    pub fn remove(&self, pair: &FlowPair) {
        let mut pairs = self.pairs.lock();
        if let Some(count) = pairs.get_mut(pair) {
            *count -= 1;
            if *count == 0 {
                pairs.remove(pair);
            }
        }
    }

    pub fn contains(&self, pair: &FlowPair) -> bool {
        self.pairs.lock().contains_key(pair)
    }

    pub fn admit(&self, datagram: &[u8]) -> bool {
        flow_pair(datagram).is_some_and(|pair| self.contains(&pair))
    }

    pub fn len(&self) -> usize {
        self.pairs.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
