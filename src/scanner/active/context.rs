//! What a plugin sees while attacking one injection point

use std::sync::atomic::Ordering;
use std::sync::Arc;
use tracing::trace;

use super::engine::EngineShared;
use super::injection::InjectionPoint;
use super::job::JobControl;
use crate::error::{ExchangeError, ScanPluginError};
use crate::http::HttpMessage;
use crate::proxy::HistoryRecord;
use crate::scanner::alerts::{Alert, Confidence};
use crate::scanner::policies::{AlertThreshold, AttackStrength};

pub struct AttackContext {
    record: Arc<HistoryRecord>,
    point: InjectionPoint,
    plugin_id: u32,
    strength: AttackStrength,
    threshold: AlertThreshold,
    shared: Arc<EngineShared>,
    control: Arc<JobControl>,
}

impl AttackContext {
    pub(crate) fn new(
        record: Arc<HistoryRecord>,
        point: InjectionPoint,
        plugin_id: u32,
        strength: AttackStrength,
        threshold: AlertThreshold,
        shared: Arc<EngineShared>,
        control: Arc<JobControl>,
    ) -> Self {
        Self {
            record,
            point,
            plugin_id,
            strength,
            threshold,
            shared,
            control,
        }
    }

    /// The recorded exchange under attack
    pub fn base(&self) -> &HttpMessage {
        &self.record.message
    }

    pub fn history_id(&self) -> u64 {
        self.record.id
    }

    pub fn point(&self) -> &InjectionPoint {
        &self.point
    }

    pub fn strength(&self) -> AttackStrength {
        self.strength
    }

    pub fn threshold(&self) -> AlertThreshold {
        self.threshold
    }

    /// Plugins should return early once this is true
    pub fn is_stopped(&self) -> bool {
        self.control.is_stopped() || self.control.is_skipped(self.plugin_id)
    }

    /// Fresh copy of the base request with the injection point set to `value`
    pub fn variant(&self, value: &str) -> HttpMessage {
        self.point.apply(&self.record.message, value)
    }

    /// Send `value` at the injection point
    pub async fn attack(&self, value: &str) -> Result<HttpMessage, ScanPluginError> {
        self.send(self.variant(value)).await
    }

    /// Send a request through the exchange path. Waits while the job is
    /// paused and for a free slot on the target host.
    pub async fn send(&self, message: HttpMessage) -> Result<HttpMessage, ScanPluginError> {
        if !self.control.wait_runnable().await {
            return Err(ExchangeError::Stopped.into());
        }
        if self.control.is_skipped(self.plugin_id) {
            return Err(ScanPluginError::Skipped);
        }

        let host = message.request_header.resolved().host;
        let _slot = self
            .shared
            .throttle
            .acquire(&host)
            .await
            .map_err(|_| ExchangeError::Stopped)?;
        // Stopped while waiting for the slot
        if self.control.is_stopped() {
            return Err(ExchangeError::Stopped.into());
        }

        trace!(job = %self.control.id, plugin = self.plugin_id, url = %message.url(), "Sending attack");
        self.control.requests_sent.fetch_add(1, Ordering::Relaxed);
        let timeout = self.shared.settings.request_timeout;
        match tokio::time::timeout(timeout, self.shared.sender.send(message)).await {
            Ok(result) => Ok(result?),
            Err(_) => Err(ExchangeError::Timeout(timeout.as_millis() as u64).into()),
        }
    }

    /// Report a finding. Alerts below the policy threshold are dropped.
    /// Missing uri, parameter and source are filled from the context.
    pub fn raise(&self, mut alert: Alert) -> bool {
        if !meets_threshold(alert.confidence, self.threshold) {
            trace!(plugin = self.plugin_id, confidence = ?alert.confidence, "Alert below threshold");
            return false;
        }
        if alert.uri.is_empty() {
            alert.uri = self.record.message.url().to_string();
            alert.method = self.record.message.method().to_string();
        }
        if alert.param.is_empty() {
            alert.param = self.point.name.clone();
        }
        alert.source_history_id.get_or_insert(self.record.id);
        alert.tags.entry("injection".into()).or_insert_with(|| self.point.location.as_str().to_string());

        self.control.alerts_raised.fetch_add(1, Ordering::Relaxed);
        self.shared.alerts.upsert(alert);
        true
    }
}

impl std::fmt::Debug for AttackContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AttackContext")
            .field("history_id", &self.record.id)
            .field("point", &self.point)
            .field("plugin_id", &self.plugin_id)
            .finish()
    }
}

fn meets_threshold(confidence: Confidence, threshold: AlertThreshold) -> bool {
    match threshold {
        AlertThreshold::Off => false,
        AlertThreshold::Low => confidence != Confidence::FalsePositive,
        AlertThreshold::Medium => confidence >= Confidence::Medium,
        AlertThreshold::High => confidence >= Confidence::High,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_threshold_filters_by_confidence() {
        assert!(meets_threshold(Confidence::Low, AlertThreshold::Low));
        assert!(!meets_threshold(Confidence::Low, AlertThreshold::Medium));
        assert!(meets_threshold(Confidence::High, AlertThreshold::High));
        assert!(!meets_threshold(Confidence::FalsePositive, AlertThreshold::Low));
        assert!(!meets_threshold(Confidence::UserConfirmed, AlertThreshold::Off));
    }
}
