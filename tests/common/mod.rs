#![allow(dead_code)]

use std::collections::HashMap;
use std::net::Ipv4Addr;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use pnet::packet::ip::IpNextHeaderProtocols;
use pnet::packet::ipv4::{Ipv4Packet, MutableIpv4Packet};
use tokio::sync::mpsc;

use mtr_trace::packet::layout::*;
use mtr_trace::packet::{Constructor, Ipv4Constructor, Ipv4Deconstructor, ProbeRequest};
use mtr_trace::{
    Datagram, ProbeProtocol, ProtocolStack, Prober, Receiver, ResolvedTarget, SendProbe, Target,
    TraceError, Tracer, TracerConfig,
};

pub const SOURCE: &str = "192.168.1.10";
pub const SOURCE_V4: Ipv4Addr = Ipv4Addr::new(192, 168, 1, 10);

/// Short enough to keep lossy scenarios fast, long enough for an in-process reply.
pub const HOP_WAIT: Duration = Duration::from_millis(40);

/// The path to one destination. Routers answer with time exceeded, the destination with an
/// echo reply to ICMP probes or a port unreachable to UDP probes.
#[derive(Debug, Clone, Default)]
pub struct Route {
    routers: Vec<Option<Ipv4Addr>>,
    silent_destination: bool,
    drop_first: HashMap<u8, u32>,
    late: HashMap<u8, Duration>,
}

impl Route {
    /// `"*"` is a router that never answers.
    pub fn through(routers: &[&str]) -> Self {
        Self {
            routers: routers
                .iter()
                .map(|r| match *r {
                    "*" => None,
                    addr => Some(addr.parse().unwrap()),
                })
                .collect(),
            ..Self::default()
        }
    }

    pub fn silent_destination(mut self) -> Self {
        self.silent_destination = true;
        self
    }

    /// The first `n` probes sent with this TTL go unanswered.
    pub fn drop_first(mut self, ttl: u8, n: u32) -> Self {
        self.drop_first.insert(ttl, n);
        self
    }

    /// Answers to probes with this TTL arrive `by` after the probe was sent.
    pub fn late(mut self, ttl: u8, by: Duration) -> Self {
        self.late.insert(ttl, by);
        self
    }
}

/// A network of scripted routes, answering probes the moment they are sent.
pub struct FakeNetwork {
    routes: Mutex<HashMap<Ipv4Addr, Route>>,
    seen: Mutex<HashMap<(Ipv4Addr, u8), u32>>,
    probes: Mutex<Vec<Vec<u8>>>,
    inbound: mpsc::Sender<Datagram>,
}

impl FakeNetwork {
    pub fn new() -> (Arc<Self>, FakeReceiver) {
        let (inbound, rx) = mpsc::channel(10_000);
        let network = Self {
            routes: Mutex::new(HashMap::new()),
            seen: Mutex::new(HashMap::new()),
            probes: Mutex::new(Vec::new()),
            inbound,
        };
        (Arc::new(network), FakeReceiver { rx: Some(rx) })
    }

    pub fn route(&self, dst: &str, route: Route) {
        self.routes.lock().insert(dst.parse().unwrap(), route);
    }

    /// Puts an arbitrary datagram on the wire, as if some other host had sent it.
    pub fn inject(&self, bytes: Vec<u8>) {
        self.inbound.try_send(Datagram::new(bytes)).unwrap();
    }

    pub fn probes_sent(&self) -> usize {
        self.probes.lock().len()
    }

    pub fn probes(&self) -> Vec<Vec<u8>> {
        self.probes.lock().clone()
    }

    fn answer(&self, probe: &[u8]) -> Option<(Vec<u8>, Duration)> {
        let ip = Ipv4Packet::new(probe)?;
        let (dst, ttl) = (ip.get_destination(), ip.get_ttl());
        let route = self.routes.lock().get(&dst).cloned()?;

        let mut seen = self.seen.lock();
        let count = seen.entry((dst, ttl)).or_insert(0);
        *count += 1;
        if route.drop_first.get(&ttl).is_some_and(|n| *count <= *n) {
            return None;
        }
        drop(seen);

        let delay = route.late.get(&ttl).copied().unwrap_or_default();
        let hop = usize::from(ttl);
        if hop <= route.routers.len() {
            let router = route.routers[hop - 1]?;
            return Some((quoting(router, ICMP_TIME_EXCEEDED, 0, probe), delay));
        }
        if route.silent_destination {
            return None;
        }
        let reply = match ip.get_next_level_protocol() {
            IpNextHeaderProtocols::Udp => quoting(dst, ICMP_DEST_UNREACHABLE, 3, probe),
            _ => echo_reply(probe),
        };
        Some((reply, delay))
    }
}

impl Prober for FakeNetwork {
    fn probe(&self, req: &SendProbe) -> Result<(), TraceError> {
        let probe = network_order(req.bytes.clone());
        match self.answer(&probe) {
            Some((reply, delay)) if delay.is_zero() => {
                self.inbound.try_send(Datagram::new(reply)).unwrap();
            }
            Some((reply, delay)) => {
                let inbound = self.inbound.clone();
                std::thread::spawn(move || {
                    std::thread::sleep(delay);
                    // The tracer may be gone by now
                    let _ = inbound.try_send(Datagram::new(reply));
                });
            }
            None => {}
        }
        self.probes.lock().push(probe);
        Ok(())
    }

    fn close(&self) {}
}

pub struct FakeReceiver {
    rx: Option<mpsc::Receiver<Datagram>>,
}

impl Receiver for FakeReceiver {
    fn receive(&mut self) -> Result<mpsc::Receiver<Datagram>, TraceError> {
        self.rx
            .take()
            .ok_or_else(|| TraceError::Configuration("fake receiver already taken".into()))
    }

    fn close(&mut self) {}
}

/// A tracer wired to a fresh fake network.
pub fn tracer(config: TracerConfig) -> (Tracer, Arc<FakeNetwork>) {
    let (network, receiver) = FakeNetwork::new();
    let v4 = ProtocolStack {
        constructor: Box::new(Ipv4Constructor::new(config.protocol, config.payload_len)),
        deconstructor: Box::new(Ipv4Deconstructor),
        prober: network.clone(),
        receiver: Box::new(receiver),
    };
    let tracer = Tracer::with_stacks(config, v4, ProtocolStack::ipv6()).unwrap();
    (tracer, network)
}

pub fn config() -> TracerConfig {
    TracerConfig {
        next_hop_wait: HOP_WAIT,
        ..TracerConfig::default()
    }
}

pub fn target(dst: &str, max_ttl: u8, retry: u32) -> ResolvedTarget {
    Target::new(SOURCE, dst)
        .max_ttl(max_ttl)
        .retry(retry)
        .resolve()
        .unwrap()
}

/// An ICMP probe from [`SOURCE`], as another tracer on this host would send it.
pub fn echo_probe(dst: &str, id: u16, seq: u16) -> Vec<u8> {
    let target = target(dst, 30, 1);
    let constructor = Ipv4Constructor::new(Some(ProbeProtocol::Icmp), 0);
    let bytes = constructor
        .packet(&ProbeRequest::new(&target, 1, id, seq))
        .unwrap();
    network_order(bytes)
}

/// A router's ICMP error quoting the probe's IP header and first 8 payload bytes.
pub fn quoting(from: Ipv4Addr, icmp_type: u8, code: u8, probe: &[u8]) -> Vec<u8> {
    let probe_src = Ipv4Packet::new(probe).unwrap().get_source();
    let mut buf = outer_header(from, probe_src, MIN_EMBEDDED_MESSAGE_LEN);
    buf[OUTER_ICMP + ICMP_TYPE] = icmp_type;
    buf[OUTER_ICMP + 1] = code;
    buf[EMBEDDED_IP..].copy_from_slice(&probe[..IPV4_HEADER_LEN + 8]);
    buf
}

fn echo_reply(probe: &[u8]) -> Vec<u8> {
    let ip = Ipv4Packet::new(probe).unwrap();
    let mut buf = outer_header(ip.get_destination(), ip.get_source(), probe.len());
    buf[OUTER_ICMP..].copy_from_slice(&probe[IPV4_HEADER_LEN..]);
    buf[OUTER_ICMP + ICMP_TYPE] = ICMP_ECHO_REPLY;
    buf
}

fn outer_header(src: Ipv4Addr, dst: Ipv4Addr, len: usize) -> Vec<u8> {
    let mut buf = vec![0u8; len];
    let mut ip = MutableIpv4Packet::new(&mut buf).unwrap();
    ip.set_version(4);
    ip.set_header_length(5);
    ip.set_total_length(len as u16);
    ip.set_ttl(64);
    ip.set_next_level_protocol(IpNextHeaderProtocols::Icmp);
    ip.set_source(src);
    ip.set_destination(dst);
    buf
}

fn network_order(mut bytes: Vec<u8>) -> Vec<u8> {
    if mtr_trace::platform::total_length_in_host_order() {
        bytes.swap(IP_TOTAL_LEN, IP_TOTAL_LEN + 1);
    }
    bytes
}
