//! Probe construction: a hand-built IPv4 header followed by an ICMP echo request or a UDP datagram.

use std::net::Ipv4Addr;

use log::trace;
use pnet::packet::icmp::echo_request::{self as icmp_echo_request, MutableEchoRequestPacket};
use pnet::packet::icmp::IcmpTypes;
use pnet::packet::ip::{IpNextHeaderProtocol, IpNextHeaderProtocols};
use pnet::packet::ipv4::MutableIpv4Packet;
use pnet::packet::udp::MutableUdpPacket;
use pnet::packet::Packet;

use crate::checksum::{checksum, udp_ipv4_checksum, ICMP_CHECKSUM_WORD, IPV4_CHECKSUM_WORD};
use crate::error::TraceError;
use crate::packet::layout::*;
use crate::platform;
use crate::target::{ProbeProtocol, ResolvedTarget};

/// Everything needed to build one probe.
#[derive(Debug, Clone, Copy)]
pub struct ProbeRequest<'a> {
    pub target: &'a ResolvedTarget,
    pub ttl: u8,
    pub id: u16,
    pub seq: u16,
    pub src_port: u16,
    pub dst_port: u16,
}

impl<'a> ProbeRequest<'a> {
    pub fn new(target: &'a ResolvedTarget, ttl: u8, id: u16, seq: u16) -> Self {
        Self {
            target,
            ttl,
            id,
            seq,
            src_port: target.src.port(),
            dst_port: target.dst.port(),
        }
    }
}

pub trait Constructor: Send + Sync {
    /// Returns the full datagram, IP header included, ready for a header-including raw socket.
    fn packet(&self, req: &ProbeRequest<'_>) -> Result<Vec<u8>, TraceError>;
}

pub struct Ipv4Constructor {
    protocol: Option<ProbeProtocol>,
    payload_len: usize,
}

impl Ipv4Constructor {
    /// `payload_len` extra bytes follow the transport header. UDP always carries at least one.
    pub fn new(protocol: Option<ProbeProtocol>, payload_len: usize) -> Self {
        Self {
            protocol,
            payload_len,
        }
    }

    fn packet_icmp(&self, req: &ProbeRequest<'_>) -> Result<Vec<u8>, TraceError> {
        let (src, dst) = req.target.v4_pair()?;
        let payload = padding(self.payload_len);
        let total_len = usize::from(wire_len(IPV4_HEADER_LEN + ICMP_HEADER_LEN + payload.len())?);

        let mut buf = vec![0u8; total_len];
        write_ipv4_header(&mut buf, req, src, dst, IpNextHeaderProtocols::Icmp)?;

        let mut echo = MutableEchoRequestPacket::new(&mut buf[IPV4_HEADER_LEN..])
            .ok_or_else(|| view_error("ICMP echo request"))?;
        echo.set_icmp_type(IcmpTypes::EchoRequest);
        echo.set_icmp_code(icmp_echo_request::IcmpCodes::NoCode);
        echo.set_identifier(req.id);
        echo.set_sequence_number(req.seq);
        echo.set_payload(&payload);
        let sum = checksum(echo.packet(), ICMP_CHECKSUM_WORD);
        echo.set_checksum(sum);

        Ok(buf)
    }

    fn packet_udp(&self, req: &ProbeRequest<'_>) -> Result<Vec<u8>, TraceError> {
        let (src, dst) = req.target.v4_pair()?;
        let payload = match self.payload_len {
            0 => vec![b'a'],
            n => padding(n),
        };
        let udp_len = wire_len(UDP_HEADER_LEN + payload.len())?;
        let total_len = IPV4_HEADER_LEN + usize::from(udp_len);

        let mut buf = vec![0u8; total_len];
        write_ipv4_header(&mut buf, req, src, dst, IpNextHeaderProtocols::Udp)?;

        let mut udp =
            MutableUdpPacket::new(&mut buf[IPV4_HEADER_LEN..]).ok_or_else(|| view_error("UDP"))?;
        udp.set_source(req.src_port);
        udp.set_destination(req.dst_port);
        udp.set_length(udp_len);
        udp.set_payload(&payload);
        let sum = udp_ipv4_checksum(&udp.to_immutable(), src, dst);
        udp.set_checksum(sum);

        Ok(buf)
    }
}

impl Constructor for Ipv4Constructor {
    fn packet(&self, req: &ProbeRequest<'_>) -> Result<Vec<u8>, TraceError> {
        let mut bytes = match self.protocol {
            Some(ProbeProtocol::Icmp) => self.packet_icmp(req)?,
            Some(ProbeProtocol::Udp) => self.packet_udp(req)?,
            None => {
                return Err(TraceError::Configuration(
                    "no probe packet type selected".to_string(),
                ));
            }
        };
        if platform::total_length_in_host_order() {
            bytes.swap(IP_TOTAL_LEN, IP_TOTAL_LEN + 1);
        }
        trace!(
            "Built {} byte probe to {} ttl={} id={} seq={}",
            bytes.len(),
            req.target.dst,
            req.ttl,
            req.id,
            req.seq
        );
        Ok(bytes)
    }
}

/// Fills in the 20-byte IPv4 header at the start of `buf`, which spans the whole datagram.
fn write_ipv4_header(
    buf: &mut [u8],
    req: &ProbeRequest<'_>,
    src: Ipv4Addr,
    dst: Ipv4Addr,
    proto: IpNextHeaderProtocol,
) -> Result<(), TraceError> {
    let total_len = wire_len(buf.len())?;
    let mut ip = MutableIpv4Packet::new(buf).ok_or_else(|| view_error("IPv4"))?;
    ip.set_version(4);
    ip.set_header_length(5);
    ip.set_total_length(total_len);
    // UDP probes carry no identifier of their own; routers quote this field back
    ip.set_identification(req.id);
    ip.set_ttl(req.ttl);
    ip.set_next_level_protocol(proto);
    ip.set_source(src);
    ip.set_destination(dst);
    let sum = checksum(&ip.packet()[..IPV4_HEADER_LEN], IPV4_CHECKSUM_WORD);
    ip.set_checksum(sum);
    Ok(())
}

/// Lengths go on the wire as 16-bit fields.
fn wire_len(len: usize) -> Result<u16, TraceError> {
    u16::try_from(len).map_err(|_| {
        TraceError::Configuration(format!(
            "{} byte probe does not fit an IPv4 datagram; padding is limited to {} bytes",
            len, MAX_PAYLOAD_LEN
        ))
    })
}

fn padding(len: usize) -> Vec<u8> {
    (0..len).map(|i| 0x10u8.wrapping_add(i as u8)).collect()
}

fn view_error(layer: &str) -> TraceError {
    TraceError::Configuration(format!("probe buffer too short for {} header", layer))
}

pub struct Ipv6Constructor;

impl Constructor for Ipv6Constructor {
    fn packet(&self, _req: &ProbeRequest<'_>) -> Result<Vec<u8>, TraceError> {
        Err(TraceError::NotImplemented("IPv6 probe construction"))
    }
}
