use std::net::IpAddr;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::correlation::CorrelationKey;
use crate::target::ResolvedTarget;

/// One row of trace output: a single attempt, or after aggregation every attempt at one TTL.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct HopRecord {
    pub ttl: u8,
    /// Whoever answered; `None` if nobody did.
    pub hop: Option<IpAddr>,
    /// Zero when lost, the mean over answered attempts otherwise.
    pub latency: Duration,
    pub reached: bool,
    pub attempts: u32,
    pub replies: u32,
    pub packet_loss: f32,
}

impl HopRecord {
    pub fn replied(ttl: u8, hop: IpAddr, latency: Duration, reached: bool) -> Self {
        Self {
            ttl,
            hop: Some(hop),
            // A reply always counts as a success, even on a clock too coarse to see it
            latency: latency.max(Duration::from_nanos(1)),
            reached,
            attempts: 1,
            replies: 1,
            packet_loss: 0.0,
        }
    }

    pub fn lost(ttl: u8) -> Self {
        Self {
            ttl,
            hop: None,
            latency: Duration::ZERO,
            reached: false,
            attempts: 1,
            replies: 0,
            packet_loss: 1.0,
        }
    }

    pub fn is_success(&self) -> bool {
        self.replies > 0
    }

    /// Collapses records that share a TTL. Already merged records keep their weight.
    fn merge(group: &[HopRecord]) -> HopRecord {
        let attempts: u32 = group.iter().map(|r| r.attempts).sum();
        let replies: u32 = group.iter().map(|r| r.replies).sum();
        let latency = match replies {
            0 => Duration::ZERO,
            n => group.iter().map(|r| r.latency * r.replies).sum::<Duration>() / n,
        };
        HopRecord {
            ttl: group[0].ttl,
            hop: group.iter().find_map(|r| r.hop),
            latency,
            reached: group.iter().any(|r| r.reached),
            attempts,
            replies,
            packet_loss: loss_fraction(attempts, replies),
        }
    }
}

fn loss_fraction(attempts: u32, replies: u32) -> f32 {
    match attempts {
        0 => 0.0,
        n => (n - replies) as f32 / n as f32,
    }
}

/// Everything learned about one target.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TraceResult {
    pub id: u16,
    pub key: CorrelationKey,
    pub target: ResolvedTarget,
    pub started_at: DateTime<Utc>,
    pub done: bool,
    pub avg_pkt_loss: f32,
    pub hops: Vec<HopRecord>,
}

impl TraceResult {
    pub fn new(id: u16, key: CorrelationKey, target: ResolvedTarget) -> Self {
        Self {
            id,
            key,
            target,
            started_at: Utc::now(),
            done: false,
            avg_pkt_loss: 0.0,
            hops: Vec::new(),
        }
    }

    /// One record per TTL: mean latency over answered attempts, loss over all attempts,
    /// first responder seen, reached if any attempt reached.
    pub fn aggregate(&self) -> TraceResult {
        let hops = self
            .hops
            .chunk_by(|a, b| a.ttl == b.ttl)
            .map(HopRecord::merge)
            .collect();
        TraceResult {
            hops,
            ..self.clone()
        }
    }

    pub fn last_hop(&self) -> Option<&HopRecord> {
        self.hops.last()
    }
}
