//! Sending side: raw, header-including sockets.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use log::debug;
use parking_lot::Mutex;
use socket2::{Domain, Protocol, SockAddr, Socket, Type};

use crate::error::TraceError;

const IPPROTO_RAW: i32 = 255;

/// One constructed probe and where it goes.
#[derive(Debug, Clone)]
pub struct SendProbe {
    pub src: SocketAddr,
    pub dst: SocketAddr,
    pub write_timeout: Duration,
    pub bytes: Vec<u8>,
}

pub trait Prober: Send + Sync {
    /// Blocking send, bounded by the probe's write timeout.
    fn probe(&self, req: &SendProbe) -> Result<(), TraceError>;

    fn close(&self);
}

/// Keeps one bound raw socket per source address, opened on first use.
#[derive(Debug, Default)]
pub struct Ipv4Prober {
    sockets: Mutex<HashMap<SocketAddr, Arc<Socket>>>,
}

impl Ipv4Prober {
    pub fn new() -> Self {
        Self::default()
    }

    fn socket_for(&self, src: SocketAddr) -> Result<Arc<Socket>, TraceError> {
        let mut sockets = self.sockets.lock();
        if let Some(socket) = sockets.get(&src) {
            return Ok(socket.clone());
        }

        let socket = Socket::new(Domain::IPV4, Type::RAW, Some(Protocol::from(IPPROTO_RAW)))
            .map_err(TraceError::socket("open raw"))?;
        socket
            .set_header_included(true)
            .map_err(TraceError::socket("set IP_HDRINCL"))?;
        socket
            .bind(&SockAddr::from(src))
            .map_err(TraceError::socket("bind"))?;
        debug!("Opened raw send socket bound to {}", src);

        let socket = Arc::new(socket);
        sockets.insert(src, socket.clone());
        Ok(socket)
    }
}

impl Prober for Ipv4Prober {
    fn probe(&self, req: &SendProbe) -> Result<(), TraceError> {
        let socket = self.socket_for(req.src)?;
        socket
            .set_write_timeout(Some(req.write_timeout))
            .map_err(TraceError::socket("set write timeout"))?;
        socket
            .send_to(&req.bytes, &SockAddr::from(req.dst))
            .map_err(TraceError::socket("sendto"))?;
        Ok(())
    }

    fn close(&self) {
        let closed = self.sockets.lock().drain().count();
        if closed > 0 {
            debug!("Closed {} raw send sockets", closed);
        }
    }
}

pub struct Ipv6Prober;

impl Prober for Ipv6Prober {
    fn probe(&self, _req: &SendProbe) -> Result<(), TraceError> {
        Err(TraceError::NotImplemented("IPv6 probing"))
    }

    fn close(&self) {}
}
