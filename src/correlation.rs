//! Routing of receipts back to the trace whose probe caused them.

use std::collections::HashMap;
use std::fmt;
use std::net::IpAddr;

use parking_lot::Mutex;
use serde::Serialize;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;

use crate::error::TraceError;
use crate::filter::{FilterSet, FlowPair};
use crate::packet::Receipt;
use crate::target::{ProbeProtocol, ResolvedTarget};

/// Identifier plus addresses, plus ports when probing with UDP.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub struct CorrelationKey {
    pub id: u16,
    pub src: IpAddr,
    pub dst: IpAddr,
    pub ports: Option<(u16, u16)>,
}

impl CorrelationKey {
    pub fn for_target(protocol: ProbeProtocol, id: u16, target: &ResolvedTarget) -> Self {
        Self {
            id,
            src: target.src_ip(),
            dst: target.dst_ip(),
            ports: match protocol {
                ProbeProtocol::Udp => Some((target.src.port(), target.dst.port())),
                ProbeProtocol::Icmp => None,
            },
        }
    }

    pub fn for_receipt(protocol: ProbeProtocol, receipt: &Receipt) -> Self {
        Self {
            id: receipt.id,
            src: receipt.src,
            dst: receipt.dst,
            ports: match protocol {
                ProbeProtocol::Udp => receipt.ports,
                ProbeProtocol::Icmp => None,
            },
        }
    }

    pub fn pair(&self) -> FlowPair {
        FlowPair::new(self.src, self.dst)
    }
}

impl fmt::Display for CorrelationKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.ports {
            Some((src_port, dst_port)) => write!(
                f,
                "{}:{}:{}-{}:{}",
                self.id, self.src, src_port, self.dst, dst_port
            ),
            None => write!(f, "{}:{}-{}", self.id, self.src, self.dst),
        }
    }
}

/// The correlation map and the filter set, the only mutable state shared between tasks.
///
/// A session's key and pair are registered before its task is spawned, so no receipt for it
/// can be dispatched before there is somewhere to deliver it. The session unregisters itself
/// once it stops reading its channel; receipts arriving after that are orphans.
#[derive(Debug, Default)]
pub struct Registry {
    routes: Mutex<HashMap<CorrelationKey, mpsc::Sender<Receipt>>>,
    filter: FilterSet,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(
        &self,
        key: CorrelationKey,
        results: mpsc::Sender<Receipt>,
    ) -> Result<(), TraceError> {
        {
            let mut routes = self.routes.lock();
            if routes.contains_key(&key) {
                return Err(TraceError::Configuration(format!(
                    "correlation key {} is already in flight",
                    key
                )));
            }
            routes.insert(key, results);
        }
        self.filter.insert(key.pair());
        Ok(())
    }

    pub fn unregister(&self, key: &CorrelationKey) {
        if self.routes.lock().remove(key).is_some() {
            self.filter.remove(&key.pair());
        }
    }

    pub fn filter(&self) -> &FilterSet {
        &self.filter
    }

    /// Hands the receipt to the registered session without waiting.
    pub fn route(&self, key: &CorrelationKey, receipt: Receipt) -> Result<(), TraceError> {
        let results = self.routes.lock().get(key).cloned();
        let Some(results) = results else {
            return Err(TraceError::CorrelationMiss {
                key: key.to_string(),
            });
        };
        match results.try_send(receipt) {
            Ok(()) => Ok(()),
            Err(TrySendError::Full(_)) => Err(TraceError::ChannelOverflow { channel: "result" }),
            Err(TrySendError::Closed(_)) => Err(TraceError::CorrelationMiss {
                key: key.to_string(),
            }),
        }
    }

    pub fn len(&self) -> usize {
        self.routes.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::packet::ReceiptKind;
    use crate::target::Target;
    use std::time::Instant;

    fn target() -> ResolvedTarget {
        Target::new("192.168.1.10", "8.8.8.8")
            .ports(65533, 65535)
            .resolve()
            .unwrap()
    }

    fn receipt(id: u16, ports: Option<(u16, u16)>) -> Receipt {
        Receipt {
            kind: ReceiptKind::TimeExceeded,
            received_at: Instant::now(),
            responder: "10.0.0.1".parse().unwrap(),
            src: "192.168.1.10".parse().unwrap(),
            dst: "8.8.8.8".parse().unwrap(),
            id,
            seq: Some(1),
            ports,
            ttl: 1,
            proto: 1,
            reachable: false,
        }
    }

    #[test]
    fn test_key_rendering() {
        let target = target();
        let icmp = CorrelationKey::for_target(ProbeProtocol::Icmp, 7, &target);
        assert_eq!(icmp.to_string(), "7:192.168.1.10-8.8.8.8");
        let udp = CorrelationKey::for_target(ProbeProtocol::Udp, 7, &target);
        assert_eq!(udp.to_string(), "7:192.168.1.10:65533-8.8.8.8:65535");
    }

    #[test]
    fn test_udp_keys_need_matching_ports() {
        let target = target();
        let key = CorrelationKey::for_target(ProbeProtocol::Udp, 7, &target);
        assert_eq!(
            CorrelationKey::for_receipt(ProbeProtocol::Udp, &receipt(7, Some((65533, 65535)))),
            key
        );
        assert_ne!(
            CorrelationKey::for_receipt(ProbeProtocol::Udp, &receipt(7, Some((1, 2)))),
            key
        );
    }

    #[tokio::test]
    async fn test_route_lifecycle() {
        let registry = Registry::new();
        let key = CorrelationKey::for_target(ProbeProtocol::Icmp, 3, &target());
        let (tx, mut rx) = mpsc::channel(1);

        registry.register(key, tx.clone()).unwrap();
        assert!(registry.filter().contains(&key.pair()));
        assert!(registry.register(key, tx).is_err());

        registry.route(&key, receipt(3, None)).unwrap();
        assert_eq!(rx.recv().await.unwrap().id, 3);

        registry.route(&key, receipt(3, None)).unwrap();
        let err = registry.route(&key, receipt(3, None)).unwrap_err();
        assert!(matches!(err, TraceError::ChannelOverflow { .. }));

        registry.unregister(&key);
        assert!(registry.is_empty());
        assert!(!registry.filter().contains(&key.pair()));
        let err = registry.route(&key, receipt(3, None)).unwrap_err();
        assert!(matches!(err, TraceError::CorrelationMiss { .. }));
    }
}
