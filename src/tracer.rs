//! Orchestration: one shared receiver, a small dispatcher pool, one session task per target.

mod dispatch;
mod session;

use std::sync::Arc;
use std::time::Duration;

use log::{debug, info};
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

use crate::correlation::{CorrelationKey, Registry};
use crate::counters::{Counters, DebugInfo};
use crate::error::TraceError;
use crate::packet::layout::MAX_PAYLOAD_LEN;
use crate::packet::{
    Constructor, Deconstructor, Ipv4Constructor, Ipv4Deconstructor, Ipv6Constructor,
    Ipv6Deconstructor,
};
use crate::probe::{Ipv4Prober, Ipv6Prober, Prober};
use crate::receive::{Ipv4Receiver, Ipv6Receiver, Receiver, ReceiverConfig};
use crate::result::TraceResult;
use crate::sink::ErrorSink;
use crate::target::{AddressFamily, ProbeProtocol, ResolvedTarget};

use session::Session;

pub const DEFAULT_BATCH_SIZE: usize = 5000;

#[derive(Debug, Clone)]
pub struct TracerConfig {
    pub protocol: Option<ProbeProtocol>,
    /// Consecutive TTLs without any reply before a target is given up.
    pub max_unreply: u32,
    /// How long to wait for the answer to one probe.
    pub next_hop_wait: Duration,
    pub dispatchers: usize,
    pub batch_size: usize,
    pub receiver: ReceiverConfig,
    /// Capacity of each session's private receipt channel.
    pub result_capacity: usize,
    pub write_timeout: Duration,
    /// Padding after the transport header, at most [`MAX_PAYLOAD_LEN`].
    pub payload_len: usize,
    pub error_sink: ErrorSink,
}

impl Default for TracerConfig {
    fn default() -> Self {
        Self {
            protocol: Some(ProbeProtocol::Icmp),
            max_unreply: 8,
            next_hop_wait: Duration::from_millis(200),
            dispatchers: 5,
            batch_size: DEFAULT_BATCH_SIZE,
            receiver: ReceiverConfig::default(),
            result_capacity: 100,
            write_timeout: Duration::from_secs(1),
            payload_len: 0,
            error_sink: ErrorSink::log_only(),
        }
    }
}

impl TracerConfig {
    fn validate(&self) -> Result<ProbeProtocol, TraceError> {
        let protocol = self.protocol.ok_or_else(|| {
            TraceError::Configuration("no probe packet type selected".to_string())
        })?;
        let positive = [
            ("batch size", self.batch_size),
            ("dispatcher count", self.dispatchers),
            ("result channel capacity", self.result_capacity),
            ("receive channel capacity", self.receiver.capacity),
            ("max unreplied hops", self.max_unreply as usize),
        ];
        for (name, value) in positive {
            if value == 0 {
                return Err(TraceError::Configuration(format!(
                    "{} must be at least 1",
                    name
                )));
            }
        }
        if self.payload_len > MAX_PAYLOAD_LEN {
            return Err(TraceError::Configuration(format!(
                "payload of {} bytes exceeds the {} bytes an IPv4 probe can carry",
                self.payload_len, MAX_PAYLOAD_LEN
            )));
        }
        Ok(protocol)
    }
}

/// The capability set for one address family.
pub struct ProtocolStack {
    pub constructor: Box<dyn Constructor>,
    pub deconstructor: Box<dyn Deconstructor>,
    pub prober: Arc<dyn Prober>,
    pub receiver: Box<dyn Receiver>,
}

impl ProtocolStack {
    pub fn ipv4(config: &TracerConfig) -> Self {
        Self {
            constructor: Box::new(Ipv4Constructor::new(config.protocol, config.payload_len)),
            deconstructor: Box::new(Ipv4Deconstructor),
            prober: Arc::new(Ipv4Prober::new()),
            receiver: Box::new(Ipv4Receiver::new(
                config.receiver.clone(),
                config.error_sink.clone(),
            )),
        }
    }

    pub fn ipv6() -> Self {
        Self {
            constructor: Box::new(Ipv6Constructor),
            deconstructor: Box::new(Ipv6Deconstructor),
            prober: Arc::new(Ipv6Prober),
            receiver: Box::new(Ipv6Receiver),
        }
    }

    fn split(self) -> (Family, Box<dyn Receiver>) {
        let family = Family {
            constructor: self.constructor,
            deconstructor: self.deconstructor,
            prober: self.prober,
        };
        (family, self.receiver)
    }
}

struct Family {
    constructor: Box<dyn Constructor>,
    deconstructor: Box<dyn Deconstructor>,
    prober: Arc<dyn Prober>,
}

/// State every session and dispatcher can read.
struct Shared {
    config: TracerConfig,
    protocol: ProbeProtocol,
    v4: Family,
    v6: Family,
    registry: Registry,
    counters: Counters,
    sink: ErrorSink,
}

impl Shared {
    fn family(&self, family: AddressFamily) -> &Family {
        match family {
            AddressFamily::V4 => &self.v4,
            AddressFamily::V6 => &self.v6,
        }
    }
}

struct Listener {
    v4: Box<dyn Receiver>,
    // Never started: ICMPv6 receiving is not implemented
    v6: Box<dyn Receiver>,
    stop: Option<CancellationToken>,
}

pub struct Tracer {
    shared: Arc<Shared>,
    listener: Mutex<Listener>,
}

impl Tracer {
    /// A tracer on real raw sockets. Sockets are opened by [`Tracer::listen`] and on first send.
    pub fn new(config: TracerConfig) -> Result<Self, TraceError> {
        let v4 = ProtocolStack::ipv4(&config);
        Self::with_stacks(config, v4, ProtocolStack::ipv6())
    }

    pub fn with_stacks(
        config: TracerConfig,
        v4: ProtocolStack,
        v6: ProtocolStack,
    ) -> Result<Self, TraceError> {
        let protocol = config.validate()?;
        let (v4, v4_receiver) = v4.split();
        let (v6, v6_receiver) = v6.split();
        let sink = config.error_sink.clone();
        let shared = Shared {
            config,
            protocol,
            v4,
            v6,
            registry: Registry::new(),
            counters: Counters::new(),
            sink,
        };
        Ok(Self {
            shared: Arc::new(shared),
            listener: Mutex::new(Listener {
                v4: v4_receiver,
                v6: v6_receiver,
                stop: None,
            }),
        })
    }

    /// Starts the shared receiver and the dispatcher pool, unless already running.
    ///
    /// Must be called from within a Tokio runtime. Failing to open the receive socket is fatal:
    /// without it no trace could ever see a reply.
    pub fn listen(&self) -> Result<(), TraceError> {
        let mut listener = self.listener.lock();
        if listener.stop.is_some() {
            return Ok(());
        }
        let runtime = tokio::runtime::Handle::try_current().map_err(|e| {
            TraceError::Configuration(format!("listen needs a Tokio runtime: {}", e))
        })?;

        let inbound = listener.v4.receive()?;
        let inbound = Arc::new(tokio::sync::Mutex::new(inbound));
        let stop = CancellationToken::new();
        for worker in 0..self.shared.config.dispatchers {
            runtime.spawn(dispatch::run(
                self.shared.clone(),
                inbound.clone(),
                stop.clone(),
                worker,
            ));
        }
        listener.stop = Some(stop);
        debug!(
            "Listening with {} dispatchers",
            self.shared.config.dispatchers
        );
        Ok(())
    }

    /// Stops dispatching and releases every socket. Blocks until the receive thread has let
    /// go of its socket, which takes up to one receive timeout.
    ///
    /// Sessions are not cancelled; call this only after `batch_trace` has returned.
    pub fn close(&self) {
        let mut listener = self.listener.lock();
        if let Some(stop) = listener.stop.take() {
            stop.cancel();
        }
        listener.v4.close();
        listener.v6.close();
        self.shared.v4.prober.close();
        self.shared.v6.prober.close();
        debug!("Tracer closed");
    }

    pub fn debug_info(&self) -> DebugInfo {
        self.shared.counters.debug_info()
    }

    /// Traces every target, at most `batch_size` at a time, starting each at `start_ttl`.
    ///
    /// Returns exactly one result per target, in the order given.
    pub async fn batch_trace(
        &self,
        targets: &[ResolvedTarget],
        start_ttl: u8,
    ) -> Result<Vec<TraceResult>, TraceError> {
        if targets.is_empty() {
            return Ok(Vec::new());
        }
        self.listen()?;
        let start_ttl = start_ttl.max(1);

        let mut results = Vec::with_capacity(targets.len());
        let chunks = targets.chunks(self.shared.config.batch_size);
        let chunk_count = chunks.len();
        for (n, chunk) in chunks.enumerate() {
            info!(
                "Tracing chunk {}/{} ({} targets)",
                n + 1,
                chunk_count,
                chunk.len()
            );
            results.extend(self.trace_chunk(chunk, start_ttl).await);
        }
        Ok(results)
    }

    async fn trace_chunk(&self, chunk: &[ResolvedTarget], start_ttl: u8) -> Vec<TraceResult> {
        // Everything is registered before the first session can send
        let mut slots = Vec::with_capacity(chunk.len());
        let mut sessions = Vec::with_capacity(chunk.len());
        for (idx, target) in chunk.iter().enumerate() {
            let (slot, session) = self.open_session(target);
            slots.push(slot);
            if let Some(session) = session {
                sessions.push((idx, session));
            }
        }

        let mut running = JoinSet::new();
        for (idx, session) in sessions {
            running.spawn(async move { (idx, session.run(start_ttl).await) });
        }
        while let Some(joined) = running.join_next().await {
            match joined {
                Ok((idx, result)) => slots[idx] = result,
                Err(e) => self
                    .shared
                    .sink
                    .report(TraceError::Task(format!("trace session failed: {}", e))),
            }
        }

        // A panicked session never got to unregister
        for slot in &slots {
            self.shared.registry.unregister(&slot.key);
        }
        slots
    }

    /// Allocates an identifier and registers the target. The returned result is the
    /// placeholder kept if no session runs.
    fn open_session(&self, target: &ResolvedTarget) -> (TraceResult, Option<Session>) {
        let id = self.shared.counters.next_id();
        let key = CorrelationKey::for_target(self.shared.protocol, id, target);
        let result = TraceResult::new(id, key, target.clone());

        let (tx, rx) = mpsc::channel(self.shared.config.result_capacity);
        if let Err(err) = self.shared.registry.register(key, tx) {
            self.shared.sink.report(err);
            return (result, None);
        }
        let session = Session::new(self.shared.clone(), result.clone(), rx);
        (result, Some(session))
    }
}

impl Drop for Tracer {
    fn drop(&mut self) {
        if let Some(stop) = self.listener.get_mut().stop.take() {
            stop.cancel();
        }
        self.listener.get_mut().v4.close();
    }
}
