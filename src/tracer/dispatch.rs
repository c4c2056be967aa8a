use std::sync::Arc;

use log::{debug, trace};
use tokio::sync::{mpsc, Mutex};
use tokio_util::sync::CancellationToken;

use crate::correlation::CorrelationKey;
use crate::error::TraceError;
use crate::receive::Datagram;

use super::{Family, Shared};

/// What happened to one inbound datagram.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(super) enum Dispatch {
    /// Not about any pair under trace; never decoded.
    Filtered,
    Delivered,
    /// Decoded, but no session is waiting for it.
    Orphan,
    Malformed,
    /// The session's channel was full.
    Overflow,
}

/// Filters, decodes and routes one datagram to the session that sent the matching probe.
pub(super) fn dispatch(shared: &Shared, family: &Family, datagram: &Datagram) -> Dispatch {
    if !shared.registry.filter().admit(&datagram.bytes) {
        return Dispatch::Filtered;
    }
    shared.counters.record_received();

    let receipt = match family
        .deconstructor
        .deconstruct(&datagram.bytes, datagram.received_at)
    {
        Ok(receipt) => receipt,
        Err(err) => {
            shared.sink.report(err);
            return Dispatch::Malformed;
        }
    };
    trace!(
        "{} from {} for {}-{} id={}",
        receipt.kind,
        receipt.responder,
        receipt.src,
        receipt.dst,
        receipt.id
    );

    let key = CorrelationKey::for_receipt(shared.protocol, &receipt);
    match shared.registry.route(&key, receipt) {
        Ok(()) => Dispatch::Delivered,
        Err(err) => {
            let outcome = match err {
                TraceError::ChannelOverflow { .. } => Dispatch::Overflow,
                _ => Dispatch::Orphan,
            };
            shared.sink.report(err);
            outcome
        }
    }
}

/// Drains the shared inbound channel until stopped or the receiver goes away.
pub(super) async fn run(
    shared: Arc<Shared>,
    inbound: Arc<Mutex<mpsc::Receiver<Datagram>>>,
    stop: CancellationToken,
    worker: usize,
) {
    loop {
        let next = async { inbound.lock().await.recv().await };
        tokio::select! {
            biased; // Stop should take prio
            _ = stop.cancelled() => {
                trace!("Cancellation signal received by dispatcher {}", worker);
                return;
            }
            datagram = next => {
                let Some(datagram) = datagram else {
                    debug!("Receiver closed channel for dispatcher {}", worker);
                    return;
                };
                dispatch(&shared, &shared.v4, &datagram);
            }
        }
    }
}
