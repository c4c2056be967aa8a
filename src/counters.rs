use std::sync::atomic::{AtomicU32, Ordering};

use serde::Serialize;

/// Identifier allocation and packet counts, scoped to one tracer.
#[derive(Debug, Default)]
pub struct Counters {
    next_id: AtomicU32,
    sent: AtomicU32,
    received: AtomicU32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct DebugInfo {
    pub packet_send: u32,
    pub packet_rcv: u32,
}

impl Counters {
    pub fn new() -> Self {
        Self::default()
    }

    /// Monotonically increasing identifier, wrapped modulo 65535.
    ///
    /// Zero is skipped: on a header-including raw socket the kernel replaces a zero IP
    /// identification with one of its own, and UDP receipts are matched on that field.
    pub fn next_id(&self) -> u16 {
        loop {
            let n = self.next_id.fetch_add(1, Ordering::Relaxed).wrapping_add(1);
            match (n % 65535) as u16 {
                0 => continue,
                id => return id,
            }
        }
    }

    pub fn record_sent(&self) {
        self.sent.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_received(&self) {
        self.received.fetch_add(1, Ordering::Relaxed);
    }

    pub fn debug_info(&self) -> DebugInfo {
        DebugInfo {
            packet_send: self.sent.load(Ordering::Relaxed),
            packet_rcv: self.received.load(Ordering::Relaxed),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ids_start_at_one_and_wrap_past_zero() {
        let counters = Counters::new();
        assert_eq!(counters.next_id(), 1);
        assert_eq!(counters.next_id(), 2);

        counters.next_id.store(65533, Ordering::Relaxed);
        assert_eq!(counters.next_id(), 65534);
        assert_eq!(counters.next_id(), 1);
        assert_eq!(counters.next_id(), 2);
    }

    #[test]
    fn test_debug_info() {
        let counters = Counters::new();
        counters.record_sent();
        counters.record_sent();
        counters.record_received();
        assert_eq!(
            counters.debug_info(),
            DebugInfo {
                packet_send: 2,
                packet_rcv: 1
            }
        );
        let json = serde_json::to_string(&counters.debug_info()).unwrap();
        assert_eq!(json, r#"{"packet_send":2,"packet_rcv":1}"#);
    }
}
