//! Receiving side: one raw ICMP socket per address family, drained into a bounded channel.

use std::io::{self, ErrorKind};
use std::mem::MaybeUninit;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use log::{debug, trace};
use pnet::packet::icmp::{IcmpPacket, IcmpTypes};
use socket2::{Domain, Protocol, Socket, Type};
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tokio_util::sync::CancellationToken;

use crate::error::TraceError;
use crate::packet::layout::OUTER_ICMP;
use crate::platform;
use crate::sink::ErrorSink;

const RECV_BUFFER_LEN: usize = 1500;
const ERROR_BACKOFF: Duration = Duration::from_millis(50);

/// Raw bytes off the wire, stamped when the read returned.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Datagram {
    pub bytes: Vec<u8>,
    pub received_at: Instant,
}

impl Datagram {
    pub fn new(bytes: Vec<u8>) -> Self {
        Self {
            bytes,
            received_at: Instant::now(),
        }
    }
}

pub trait Receiver: Send {
    /// Opens the socket and starts reading. The returned channel is closed exactly once,
    /// after the socket has been released, when the receiver is closed.
    fn receive(&mut self) -> Result<mpsc::Receiver<Datagram>, TraceError>;

    fn close(&mut self);
}

#[derive(Debug, Clone)]
pub struct ReceiverConfig {
    pub capacity: usize,
    pub read_timeout: Duration,
    pub buffer_size: Option<usize>,
}

impl Default for ReceiverConfig {
    fn default() -> Self {
        Self {
            capacity: 10000,
            read_timeout: Duration::from_secs(1),
            buffer_size: None,
        }
    }
}

pub struct Ipv4Receiver {
    config: ReceiverConfig,
    sink: ErrorSink,
    stop: CancellationToken,
    handle: Option<JoinHandle<()>>,
}

impl Ipv4Receiver {
    pub fn new(config: ReceiverConfig, sink: ErrorSink) -> Self {
        Self {
            config,
            sink,
            stop: CancellationToken::new(),
            handle: None,
        }
    }

    fn open_socket(&self) -> Result<Socket, TraceError> {
        let socket = Socket::new(Domain::IPV4, Type::RAW, Some(Protocol::ICMPV4))
            .map_err(TraceError::socket("open raw ICMP"))?;
        platform::set_receive_error_reporting(&socket)
            .map_err(TraceError::socket("enable IP_RECVERR"))?;
        platform::set_receive_timeout(&socket, self.config.read_timeout)
            .map_err(TraceError::socket("set receive timeout"))?;
        if let Some(bytes) = self.config.buffer_size {
            platform::set_receive_buffer(&socket, bytes)
                .map_err(TraceError::socket("set receive buffer"))?;
        }
        Ok(socket)
    }
}

impl Ipv4Receiver {
    /// Runs the read loop on its own thread over `read`, which owns the socket.
    fn start<R>(&mut self, read: R) -> Result<mpsc::Receiver<Datagram>, TraceError>
    where
        R: FnMut(&mut [MaybeUninit<u8>]) -> io::Result<usize> + Send + 'static,
    {
        let (tx, rx) = mpsc::channel(self.config.capacity);
        self.stop = CancellationToken::new();

        let stop = self.stop.clone();
        let sink = self.sink.clone();
        let handle = std::thread::Builder::new()
            .name("icmp-receive".to_string())
            .spawn(move || read_loop(read, tx, stop, sink))
            .map_err(TraceError::socket("spawn receive thread"))?;
        self.handle = Some(handle);
        Ok(rx)
    }
}

impl Receiver for Ipv4Receiver {
    fn receive(&mut self) -> Result<mpsc::Receiver<Datagram>, TraceError> {
        if self.handle.is_some() {
            return Err(TraceError::Configuration(
                "ICMP receiver is already running".to_string(),
            ));
        }
        let socket = self.open_socket()?;
        let rx = self.start(move |buf| socket.recv(buf))?;
        debug!("Listening for ICMP on a raw IPv4 socket");
        Ok(rx)
    }

    /// Returns once the socket is released, which takes up to one read timeout.
    fn close(&mut self) {
        self.stop.cancel();
        if let Some(handle) = self.handle.take() {
            if handle.join().is_err() {
                self.sink.report(TraceError::Task(
                    "ICMP receive thread panicked".to_string(),
                ));
            }
        }
    }
}

fn read_loop<R>(
    mut read: R,
    tx: mpsc::Sender<Datagram>,
    stop: CancellationToken,
    sink: ErrorSink,
) where
    R: FnMut(&mut [MaybeUninit<u8>]) -> io::Result<usize>,
{
    let mut buf = [MaybeUninit::<u8>::uninit(); RECV_BUFFER_LEN];

    while !stop.is_cancelled() {
        let len = match read(&mut buf) {
            Ok(len) => len,
            Err(e)
                if matches!(
                    e.kind(),
                    ErrorKind::WouldBlock | ErrorKind::TimedOut | ErrorKind::Interrupted
                ) =>
            {
                continue;
            }
            Err(e) => {
                sink.report(TraceError::Socket {
                    op: "recvfrom",
                    source: e,
                });
                std::thread::sleep(ERROR_BACKOFF);
                continue;
            }
        };
        let received_at = Instant::now();

        // The read initialized the first `len` bytes
        let bytes: &[u8] = unsafe { std::slice::from_raw_parts(buf.as_ptr() as *const u8, len) };
        if is_echo_request(bytes) {
            continue;
        }

        let datagram = Datagram {
            bytes: bytes.to_vec(),
            received_at,
        };
        match tx.try_send(datagram) {
            Ok(()) => trace!("Queued {} byte ICMP datagram", len),
            Err(TrySendError::Full(_)) => {
                sink.report(TraceError::ChannelOverflow { channel: "receive" })
            }
            Err(TrySendError::Closed(_)) => break,
        }
    }

    // Socket first, so the channel only closes once it is gone
    drop(read);
    drop(tx);
    debug!("ICMP receive loop stopped");
}

/// Our own outgoing echo requests show up on the raw socket too.
pub fn is_echo_request(datagram: &[u8]) -> bool {
    datagram
        .get(OUTER_ICMP..)
        .and_then(IcmpPacket::new)
        .is_some_and(|icmp| icmp.get_icmp_type() == IcmpTypes::EchoRequest)
}

pub struct Ipv6Receiver;

impl Receiver for Ipv6Receiver {
    fn receive(&mut self) -> Result<mpsc::Receiver<Datagram>, TraceError> {
        Err(TraceError::NotImplemented("ICMPv6 receiving"))
    }

    fn close(&mut self) {}
}
