use std::fmt;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr, UdpSocket};

use serde::{Deserialize, Serialize};

use crate::error::TraceError;

pub const DEFAULT_MAX_TTL: u8 = 30;

/// Transport used for the probes of a tracer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum ProbeProtocol {
    Icmp,
    Udp,
}

impl fmt::Display for ProbeProtocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ProbeProtocol::Icmp => f.write_str("icmp"),
            ProbeProtocol::Udp => f.write_str("udp"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum AddressFamily {
    V4,
    V6,
}

impl AddressFamily {
    pub fn of(addr: &IpAddr) -> Self {
        match addr {
            IpAddr::V4(_) => AddressFamily::V4,
            IpAddr::V6(_) => AddressFamily::V6,
        }
    }
}

/// What the caller wants traced, as given on the command line or in a batch file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Target {
    pub src_addr: String,
    pub dst_addr: String,
    pub src_port: u16,
    pub dst_port: u16,
    pub max_ttl: u8,
    pub retry: u32,
}

impl Target {
    pub fn new(src_addr: impl Into<String>, dst_addr: impl Into<String>) -> Self {
        Self {
            src_addr: src_addr.into(),
            dst_addr: dst_addr.into(),
            src_port: 65533,
            dst_port: 65535,
            max_ttl: DEFAULT_MAX_TTL,
            retry: 1,
        }
    }

    pub fn ports(mut self, src_port: u16, dst_port: u16) -> Self {
        self.src_port = src_port;
        self.dst_port = dst_port;
        self
    }

    pub fn max_ttl(mut self, max_ttl: u8) -> Self {
        self.max_ttl = max_ttl;
        self
    }

    pub fn retry(mut self, retry: u32) -> Self {
        self.retry = retry;
        self
    }

    /// Parses both addresses into concrete socket endpoints.
    ///
    /// A retry count of zero is treated as one attempt per hop.
    pub fn resolve(&self) -> Result<ResolvedTarget, TraceError> {
        let src_ip = parse_addr("source", &self.src_addr)?;
        let dst_ip = parse_addr("destination", &self.dst_addr)?;
        let family = AddressFamily::of(&dst_ip);
        if AddressFamily::of(&src_ip) != family {
            return Err(TraceError::FamilyMismatch(format!(
                "source {} and destination {} differ",
                src_ip, dst_ip
            )));
        }
        if self.max_ttl == 0 {
            return Err(TraceError::Configuration(
                "max ttl must be at least 1".to_string(),
            ));
        }
        Ok(ResolvedTarget {
            src: SocketAddr::new(src_ip, self.src_port),
            dst: SocketAddr::new(dst_ip, self.dst_port),
            family,
            max_ttl: self.max_ttl,
            retry: self.retry.max(1),
        })
    }
}

fn parse_addr(field: &'static str, value: &str) -> Result<IpAddr, TraceError> {
    value.trim().parse().map_err(|_| TraceError::AddressParse {
        field,
        value: value.to_string(),
    })
}

/// A target with parsed endpoints, ready to be probed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResolvedTarget {
    pub src: SocketAddr,
    pub dst: SocketAddr,
    pub family: AddressFamily,
    pub max_ttl: u8,
    pub retry: u32,
}

impl ResolvedTarget {
    pub fn src_ip(&self) -> IpAddr {
        self.src.ip()
    }

    pub fn dst_ip(&self) -> IpAddr {
        self.dst.ip()
    }

    /// Both endpoints as IPv4 addresses, or a family mismatch.
    pub fn v4_pair(&self) -> Result<(Ipv4Addr, Ipv4Addr), TraceError> {
        match (self.src.ip(), self.dst.ip()) {
            (IpAddr::V4(src), IpAddr::V4(dst)) => Ok((src, dst)),
            (src, dst) => Err(TraceError::FamilyMismatch(format!(
                "expected IPv4 endpoints, got {} -> {}",
                src, dst
            ))),
        }
    }
}

/// Finds the local address the kernel would route `dst` through.
///
/// Connecting a UDP socket sends nothing, it only selects a route.
pub fn outbound_source(dst: IpAddr) -> std::io::Result<IpAddr> {
    let bind: SocketAddr = match dst {
        IpAddr::V4(_) => (Ipv4Addr::UNSPECIFIED, 0).into(),
        IpAddr::V6(_) => (Ipv6Addr::UNSPECIFIED, 0).into(),
    };
    let socket = UdpSocket::bind(bind)?;
    socket.connect((dst, 53))?;
    Ok(socket.local_addr()?.ip())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_resolve_keeps_address_bytes_and_ports() {
        let pairs = [
            ("10.23.228.78", "172.16.57.12"),
            ("0.0.0.0", "255.255.255.255"),
            ("192.168.1.1", "8.8.8.8"),
        ];
        for (src, dst) in pairs {
            let resolved = Target::new(src, dst).ports(65523, 33434).resolve().unwrap();
            assert_eq!(resolved.src.ip(), src.parse::<IpAddr>().unwrap());
            assert_eq!(resolved.dst.ip(), dst.parse::<IpAddr>().unwrap());
            assert_eq!(resolved.src.port(), 65523);
            assert_eq!(resolved.dst.port(), 33434);
            assert_eq!(resolved.family, AddressFamily::V4);
            let (s, d) = resolved.v4_pair().unwrap();
            assert_eq!(s.octets(), src.parse::<Ipv4Addr>().unwrap().octets());
            assert_eq!(d.octets(), dst.parse::<Ipv4Addr>().unwrap().octets());
        }
    }

    #[test]
    fn test_resolve_rejects_malformed_addresses() {
        let err = Target::new("10.0.0.256", "8.8.8.8").resolve().unwrap_err();
        assert!(matches!(err, TraceError::AddressParse { field: "source", .. }));

        let err = Target::new("10.0.0.1", "eight").resolve().unwrap_err();
        assert!(matches!(
            err,
            TraceError::AddressParse {
                field: "destination",
                ..
            }
        ));
    }

    #[test]
    fn test_resolve_rejects_mixed_families() {
        let err = Target::new("10.0.0.1", "2001:db8::1").resolve().unwrap_err();
        assert!(matches!(err, TraceError::FamilyMismatch(_)));
    }

    #[test]
    fn test_ipv6_resolves_to_v6_family() {
        let resolved = Target::new("2001:db8::2", "2001:db8::1").resolve().unwrap();
        assert_eq!(resolved.family, AddressFamily::V6);
        assert!(resolved.v4_pair().is_err());
    }

    #[test]
    fn test_zero_retry_becomes_one() {
        let resolved = Target::new("10.0.0.1", "10.0.0.2").retry(0).resolve().unwrap();
        assert_eq!(resolved.retry, 1);
    }

    #[test]
    fn test_zero_max_ttl_is_rejected() {
        let err = Target::new("10.0.0.1", "10.0.0.2").max_ttl(0).resolve().unwrap_err();
        assert!(matches!(err, TraceError::Configuration(_)));
    }
}
