//! The exchange path shared by proxied and scanner traffic
//!
//! before-send listeners -> origin (or a listener's response) ->
//! after-receive listeners -> history -> passive scan queue.

use async_trait::async_trait;
use chrono::Utc;
use std::sync::Arc;
use tracing::debug;

use super::history::{HistoryRecord, HistoryStore};
use super::listener::ListenerChain;
use super::upstream::{UpstreamConnector, UpstreamPool};
use crate::app::events::{CoreEvent, EventBus};
use crate::error::{ExchangeError, UpstreamError};
use crate::http::{HttpMessage, MessageReader};
use crate::scanner::passive::PassiveScanDispatcher;

/// Sends a request through the full exchange path and returns the
/// completed, recorded message.
#[async_trait]
pub trait HttpSender: Send + Sync {
    async fn send(&self, message: HttpMessage) -> Result<HttpMessage, ExchangeError>;
}

pub struct Exchanger {
    listeners: Arc<ListenerChain>,
    history: Arc<HistoryStore>,
    passive: Arc<PassiveScanDispatcher>,
    upstream: Arc<UpstreamConnector>,
    reader: MessageReader,
    events: EventBus,
}

impl Exchanger {
    pub fn new(
        listeners: Arc<ListenerChain>,
        history: Arc<HistoryStore>,
        passive: Arc<PassiveScanDispatcher>,
        upstream: Arc<UpstreamConnector>,
        reader: MessageReader,
        events: EventBus,
    ) -> Self {
        Self {
            listeners,
            history,
            passive,
            upstream,
            reader,
            events,
        }
    }

    /// Pool for one client connection
    pub fn pool(&self) -> UpstreamPool {
        UpstreamPool::new(Arc::clone(&self.upstream), self.reader)
    }

    pub fn reader(&self) -> MessageReader {
        self.reader
    }

    /// Run one exchange. Upstream failures are returned unrecorded so the
    /// caller can answer with a synthetic response.
    pub async fn exchange(
        &self,
        mut message: HttpMessage,
        pool: &mut UpstreamPool,
    ) -> Result<Arc<HistoryRecord>, UpstreamError> {
        let outcome = self.listeners.run_before_send(&mut message);
        message.time_sent = Some(Utc::now());

        match outcome.response {
            Some((header, body)) => message.set_response(header, body),
            None => {
                let (header, body) = pool.send(&message.request_header, &message.request_body).await?;
                message.set_response(header, body);
            }
        }
        message.time_received = Some(Utc::now());

        self.listeners.run_after_receive(&mut message);
        Ok(self.complete(message).await)
    }

    async fn complete(&self, message: HttpMessage) -> Arc<HistoryRecord> {
        let record = self.history.record(message);
        debug!(
            id = record.id,
            method = %record.message.method(),
            url = %record.message.url(),
            status = ?record.message.status(),
            "Exchange recorded"
        );
        self.events.publish(CoreEvent::HistoryAdded {
            id: record.id,
            method: record.message.method().to_string(),
            url: record.message.url().to_string(),
            status: record.message.status(),
        });
        self.passive.enqueue(Arc::clone(&record)).await;
        record
    }
}

#[async_trait]
impl HttpSender for Exchanger {
    async fn send(&self, message: HttpMessage) -> Result<HttpMessage, ExchangeError> {
        let mut pool = self.pool();
        let record = self.exchange(message, &mut pool).await?;
        Ok(record.message.clone())
    }
}

impl std::fmt::Debug for Exchanger {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Exchanger")
            .field("listeners", &self.listeners.len())
            .field("history", &self.history.len())
            .finish()
    }
}
