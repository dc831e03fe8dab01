//! Core event bus
//!
//! Components publish what happened; front ends, exporters and tests
//! subscribe. Publishing never blocks and never fails: with no subscribers
//! the event is simply dropped.

use std::net::SocketAddr;
use std::sync::Arc;
use tokio::sync::broadcast;

use crate::scanner::active::{ScanProgress, ScanStatus};
use crate::scanner::alerts::Alert;

pub const DEFAULT_EVENT_CAPACITY: usize = 1024;

/// Core events
#[derive(Debug, Clone)]
pub enum CoreEvent {
    /// Proxy is accepting connections
    ProxyStarted { addr: SocketAddr },

    /// Listening socket closed
    ProxyStopped,

    /// Exchange recorded in history
    HistoryAdded {
        id: u64,
        method: String,
        url: String,
        status: Option<u16>,
    },

    /// Client rejected our certificate or spoke something other than TLS
    TlsHandshakeFailed { host: String, peer: SocketAddr, reason: String },

    /// CONNECT refused because no root material is loaded
    CaUnavailable { host: String, reason: String },

    /// Passive queue was full and messages went unscanned
    PassiveScanDegraded { dropped: u64 },

    AlertAdded(Arc<Alert>),

    AlertReplaced(Arc<Alert>),

    /// Every stored alert was removed
    AlertsCleared { removed: usize },

    /// Active scan job changed state
    ScanStateChanged { job_id: String, status: ScanStatus },

    /// Periodic active scan progress
    ScanProgress { job_id: String, progress: ScanProgress },
}

/// Broadcast channel shared by all components
#[derive(Debug, Clone)]
pub struct EventBus {
    tx: broadcast::Sender<CoreEvent>,
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(DEFAULT_EVENT_CAPACITY)
    }
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    pub fn publish(&self, event: CoreEvent) {
        // no subscribers is fine
        let _ = self.tx.send(event);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<CoreEvent> {
        self.tx.subscribe()
    }

    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_publish_without_subscribers_is_silent() {
        let bus = EventBus::new(4);
        bus.publish(CoreEvent::ProxyStopped);

        let mut rx = bus.subscribe();
        bus.publish(CoreEvent::PassiveScanDegraded { dropped: 3 });
        match rx.recv().await.unwrap() {
            CoreEvent::PassiveScanDegraded { dropped } => assert_eq!(dropped, 3),
            other => panic!("unexpected event {:?}", other),
        }
    }
}
