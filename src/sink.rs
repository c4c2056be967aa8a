use log::warn;
use tokio::sync::mpsc;

use crate::error::TraceError;

/// Where errors from background tasks end up.
///
/// Every report is logged; if the caller handed in a channel it also receives the error,
/// unless that channel is full, in which case the report is only logged.
#[derive(Debug, Clone, Default)]
pub struct ErrorSink {
    tx: Option<mpsc::Sender<TraceError>>,
}

impl ErrorSink {
    pub fn new(tx: mpsc::Sender<TraceError>) -> Self {
        Self { tx: Some(tx) }
    }

    /// Only logs.
    pub fn log_only() -> Self {
        Self::default()
    }

    pub fn report(&self, err: TraceError) {
        warn!("{}", err);
        if let Some(tx) = &self.tx {
            let _ = tx.try_send(err);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_reports_reach_channel_until_full() {
        let (tx, mut rx) = mpsc::channel(1);
        let sink = ErrorSink::new(tx);
        sink.report(TraceError::Task("first".into()));
        sink.report(TraceError::Task("second".into()));

        assert!(matches!(rx.recv().await, Some(TraceError::Task(msg)) if msg == "first"));
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn test_log_only_never_panics() {
        ErrorSink::log_only().report(TraceError::ChannelOverflow { channel: "receive" });
    }
}
