use std::sync::Arc;
use std::time::Instant;

use log::{debug, trace};
use tokio::sync::mpsc;
use tokio::time::timeout_at;

use crate::error::TraceError;
use crate::packet::{ProbeRequest, Receipt};
use crate::probe::SendProbe;
use crate::result::{HopRecord, TraceResult};

use super::Shared;

enum Attempt {
    Replied(Receipt, Instant),
    Lost,
    Fatal(TraceError),
}

/// One target's walk up the TTLs. Registered with the dispatcher before it is spawned.
pub(super) struct Session {
    shared: Arc<Shared>,
    result: TraceResult,
    receipts: mpsc::Receiver<Receipt>,
}

impl Session {
    pub(super) fn new(
        shared: Arc<Shared>,
        result: TraceResult,
        receipts: mpsc::Receiver<Receipt>,
    ) -> Self {
        Self {
            shared,
            result,
            receipts,
        }
    }

    pub(super) async fn run(mut self, start_ttl: u8) -> TraceResult {
        let max_ttl = self.result.target.max_ttl;
        let retry = self.result.target.retry.max(1);
        let mut unreplied = 0;

        'hops: for ttl in start_ttl..=max_ttl {
            let mut replies = 0;
            for _ in 0..retry {
                match self.attempt(ttl).await {
                    Attempt::Replied(receipt, sent_at) => {
                        replies += 1;
                        let latency = receipt.received_at.saturating_duration_since(sent_at);
                        self.result.hops.push(HopRecord::replied(
                            ttl,
                            receipt.responder,
                            latency,
                            receipt.reachable,
                        ));
                        if receipt.reachable {
                            debug!(
                                "{} reached at ttl {} ({})",
                                self.result.key, ttl, receipt.kind
                            );
                            self.result.done = true;
                            break 'hops;
                        }
                    }
                    Attempt::Lost => self.result.hops.push(HopRecord::lost(ttl)),
                    Attempt::Fatal(err) => {
                        self.shared.sink.report(err);
                        break 'hops;
                    }
                }
            }

            if replies > 0 {
                unreplied = 0;
                continue;
            }
            unreplied += 1;
            if unreplied >= self.shared.config.max_unreply {
                debug!(
                    "{} gave up after {} silent hops at ttl {}",
                    self.result.key, unreplied, ttl
                );
                break;
            }
        }

        self.finish()
    }

    /// Sends one probe and waits for its answer.
    async fn attempt(&mut self, ttl: u8) -> Attempt {
        let sent_at = match self.send(ttl).await {
            Ok(sent_at) => sent_at,
            Err(err) if err.is_retryable() => {
                self.shared.sink.report(err);
                return Attempt::Lost;
            }
            Err(err) => return Attempt::Fatal(err),
        };

        let deadline = tokio::time::Instant::now() + self.shared.config.next_hop_wait;
        loop {
            match timeout_at(deadline, self.receipts.recv()).await {
                Ok(Some(receipt)) if is_stale(&receipt, ttl) => {
                    trace!(
                        "{} dropped stale receipt seq {:?} at ttl {}",
                        self.result.key,
                        receipt.seq,
                        ttl
                    );
                }
                Ok(Some(receipt)) => return Attempt::Replied(receipt, sent_at),
                Ok(None) | Err(_) => return Attempt::Lost,
            }
        }
    }

    async fn send(&self, ttl: u8) -> Result<Instant, TraceError> {
        let target = &self.result.target;
        let family = self.shared.family(target.family);
        let req = ProbeRequest::new(target, ttl, self.result.id, u16::from(ttl));
        let probe = SendProbe {
            src: target.src,
            dst: target.dst,
            write_timeout: self.shared.config.write_timeout,
            bytes: family.constructor.packet(&req)?,
        };

        let prober = family.prober.clone();
        let sent_at = Instant::now();
        tokio::task::spawn_blocking(move || prober.probe(&probe))
            .await
            .map_err(|e| TraceError::Task(format!("probe send failed: {}", e)))??;
        self.shared.counters.record_sent();
        Ok(sent_at)
    }

    fn finish(mut self) -> TraceResult {
        self.shared.registry.unregister(&self.result.key);
        let total = self.result.hops.len();
        let lost = self.result.hops.iter().filter(|r| !r.is_success()).count();
        self.result.avg_pkt_loss = match total {
            0 => 0.0,
            n => lost as f32 / n as f32,
        };
        self.result
    }
}

/// ICMP probes carry their TTL as sequence number; an answer to an earlier TTL is stale.
fn is_stale(receipt: &Receipt, ttl: u8) -> bool {
    matches!(receipt.seq, Some(seq) if seq != u16::from(ttl))
}
