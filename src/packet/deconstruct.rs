//! Parsing of inbound ICMP control messages into receipts.

use std::fmt;
use std::net::IpAddr;
use std::time::Instant;

use pnet::packet::icmp::destination_unreachable::DestinationUnreachablePacket;
use pnet::packet::icmp::echo_reply::EchoReplyPacket;
use pnet::packet::icmp::echo_request::EchoRequestPacket;
use pnet::packet::icmp::time_exceeded::TimeExceededPacket;
use pnet::packet::icmp::{IcmpPacket, IcmpType, IcmpTypes};
use pnet::packet::ip::IpNextHeaderProtocols;
use pnet::packet::ipv4::Ipv4Packet;
use pnet::packet::udp::UdpPacket;
use pnet::packet::Packet;
use serde::Serialize;

use crate::error::TraceError;
use crate::packet::layout::*;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum ReceiptKind {
    EchoReply,
    TimeExceeded,
    Unreachable,
}

impl ReceiptKind {
    pub fn from_icmp_type(icmp_type: IcmpType) -> Result<Self, TraceError> {
        match icmp_type {
            IcmpTypes::EchoReply => Ok(ReceiptKind::EchoReply),
            IcmpTypes::DestinationUnreachable => Ok(ReceiptKind::Unreachable),
            IcmpTypes::TimeExceeded => Ok(ReceiptKind::TimeExceeded),
            other => Err(TraceError::UnknownMessageKind(other.0)),
        }
    }

    /// Echo replies and unreachables both end the hop search.
    pub fn is_terminal(self) -> bool {
        matches!(self, ReceiptKind::EchoReply | ReceiptKind::Unreachable)
    }
}

impl fmt::Display for ReceiptKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ReceiptKind::EchoReply => f.write_str("ICMPEcho"),
            ReceiptKind::TimeExceeded => f.write_str("ICMPTimeExceed"),
            ReceiptKind::Unreachable => f.write_str("ICMPUnreachable"),
        }
    }
}

/// A parsed inbound message.
///
/// `src`/`dst` always describe the original probe (our source, the traced destination),
/// whichever header they had to be recovered from. `responder` is whoever generated the message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Receipt {
    pub kind: ReceiptKind,
    pub received_at: Instant,
    pub responder: IpAddr,
    pub src: IpAddr,
    pub dst: IpAddr,
    pub id: u16,
    pub seq: Option<u16>,
    pub ports: Option<(u16, u16)>,
    pub ttl: u8,
    pub proto: u8,
    pub reachable: bool,
}

pub trait Deconstructor: Send + Sync {
    fn deconstruct(&self, datagram: &[u8], received_at: Instant) -> Result<Receipt, TraceError>;
}

/// Parses IPv4 ICMP messages.
///
/// Payloads are located by header length alone. The total length field is not trusted,
/// since some kernels rewrite it on raw sockets and some routers quote it truncated.
pub struct Ipv4Deconstructor;

impl Ipv4Deconstructor {
    fn echo_reply(
        &self,
        outer: &Ipv4Packet<'_>,
        icmp: &[u8],
        received_at: Instant,
    ) -> Result<Receipt, TraceError> {
        let echo = EchoReplyPacket::new(icmp)
            .ok_or_else(|| truncated(OUTER_ICMP + ICMP_HEADER_LEN, OUTER_ICMP + icmp.len()))?;
        Ok(Receipt {
            kind: ReceiptKind::EchoReply,
            received_at,
            responder: outer.get_source().into(),
            src: outer.get_destination().into(),
            dst: outer.get_source().into(),
            id: echo.get_identifier(),
            seq: Some(echo.get_sequence_number()),
            ports: None,
            ttl: outer.get_ttl(),
            proto: IpNextHeaderProtocols::Icmp.0,
            reachable: true,
        })
    }

    /// Time exceeded and unreachable both quote the original header plus 8 bytes of its payload.
    fn quoted(
        &self,
        kind: ReceiptKind,
        outer: &Ipv4Packet<'_>,
        icmp: &[u8],
        received_at: Instant,
    ) -> Result<Receipt, TraceError> {
        let actual = OUTER_ICMP + icmp.len();
        if actual < MIN_EMBEDDED_MESSAGE_LEN {
            return Err(truncated(MIN_EMBEDDED_MESSAGE_LEN, actual));
        }
        let too_short = || truncated(MIN_EMBEDDED_MESSAGE_LEN, actual);

        let exceeded;
        let unreachable;
        let quoted = match kind {
            ReceiptKind::TimeExceeded => {
                exceeded = TimeExceededPacket::new(icmp).ok_or_else(too_short)?;
                exceeded.payload()
            }
            _ => {
                unreachable = DestinationUnreachablePacket::new(icmp).ok_or_else(too_short)?;
                unreachable.payload()
            }
        };

        let inner = Ipv4Packet::new(quoted).ok_or_else(too_short)?;
        check_no_options(inner.get_header_length())?;
        let l4 = &quoted[IPV4_HEADER_LEN..];

        let proto = inner.get_next_level_protocol();
        let (id, seq, ports) = match proto {
            IpNextHeaderProtocols::Icmp => {
                let echo = EchoRequestPacket::new(l4).ok_or_else(too_short)?;
                (echo.get_identifier(), Some(echo.get_sequence_number()), None)
            }
            IpNextHeaderProtocols::Udp => {
                let udp = UdpPacket::new(l4).ok_or_else(too_short)?;
                (
                    inner.get_identification(),
                    None,
                    Some((udp.get_source(), udp.get_destination())),
                )
            }
            _ => (inner.get_identification(), None, None),
        };

        Ok(Receipt {
            kind,
            received_at,
            responder: outer.get_source().into(),
            src: inner.get_source().into(),
            dst: inner.get_destination().into(),
            id,
            seq,
            ports,
            ttl: inner.get_ttl(),
            proto: proto.0,
            reachable: kind.is_terminal(),
        })
    }
}

impl Deconstructor for Ipv4Deconstructor {
    fn deconstruct(&self, datagram: &[u8], received_at: Instant) -> Result<Receipt, TraceError> {
        if datagram.len() < MIN_MESSAGE_LEN {
            return Err(truncated(MIN_MESSAGE_LEN, datagram.len()));
        }
        let outer = Ipv4Packet::new(datagram)
            .ok_or_else(|| truncated(MIN_MESSAGE_LEN, datagram.len()))?;
        check_no_options(outer.get_header_length())?;

        let icmp = &datagram[OUTER_ICMP..];
        let header = IcmpPacket::new(icmp)
            .ok_or_else(|| truncated(MIN_MESSAGE_LEN, datagram.len()))?;
        match ReceiptKind::from_icmp_type(header.get_icmp_type())? {
            ReceiptKind::EchoReply => self.echo_reply(&outer, icmp, received_at),
            kind => self.quoted(kind, &outer, icmp, received_at),
        }
    }
}

fn check_no_options(ihl: u8) -> Result<(), TraceError> {
    match header_len(ihl) {
        IPV4_HEADER_LEN => Ok(()),
        header_len => Err(TraceError::UnsupportedIpOptions { header_len }),
    }
}

fn truncated(expected: usize, actual: usize) -> TraceError {
    TraceError::TruncatedMessage { expected, actual }
}

pub struct Ipv6Deconstructor;

impl Deconstructor for Ipv6Deconstructor {
    fn deconstruct(&self, _datagram: &[u8], _received_at: Instant) -> Result<Receipt, TraceError> {
        Err(TraceError::NotImplemented("ICMPv6 parsing"))
    }
}
