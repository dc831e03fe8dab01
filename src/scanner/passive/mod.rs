//! Passive security scanner
//!
//! Every recorded exchange is queued once and analyzed by every enabled
//! rule on a bounded pool of blocking workers. Rules never modify or send
//! requests. The proxy side only ever waits a bounded time to enqueue; past
//! that the message is dropped unscanned and the drop is reported.

pub mod rules;

use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch, Semaphore};
use tracing::{debug, warn};

use crate::app::events::{CoreEvent, EventBus};
use crate::error::ScanRuleError;
use crate::http::{HttpMessage, Initiator};
use crate::proxy::HistoryRecord;
use crate::scanner::alerts::{Alert, AlertStore};

/// Trait for passive scan rules
pub trait PassiveScanRule: Send + Sync {
    /// Plugin id used for alert deduplication and filters
    fn id(&self) -> u32;

    /// Rule name
    fn name(&self) -> &str;

    /// Check if the rule is enabled
    fn is_enabled(&self) -> bool {
        true
    }

    /// Analyze one completed exchange
    fn scan(&self, message: &HttpMessage) -> Result<Vec<Alert>, ScanRuleError>;
}

#[derive(Debug, Clone)]
pub struct PassiveSettings {
    pub queue_capacity: usize,
    pub workers: usize,
    /// How long the producer waits on a full queue before dropping
    pub enqueue_timeout: Duration,
    /// Only messages from these initiators are scanned
    pub initiators: Vec<Initiator>,
}

impl Default for PassiveSettings {
    fn default() -> Self {
        Self {
            queue_capacity: 1000,
            workers: 4,
            enqueue_timeout: Duration::from_millis(250),
            initiators: vec![Initiator::Proxy, Initiator::Manual, Initiator::Spider, Initiator::Auth],
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnqueueOutcome {
    Queued,
    /// Initiator is not passively scanned
    Skipped,
    /// Queue stayed full past the timeout
    Dropped,
}

/// Dispatcher counters
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PassiveStats {
    /// Queued or running right now
    pub pending: u64,
    pub scanned: u64,
    pub dropped: u64,
    pub alerts_raised: u64,
    pub rule_failures: HashMap<String, u64>,
}

type RuleSet = Arc<Vec<Arc<dyn PassiveScanRule>>>;

struct Shared {
    rules: RwLock<RuleSet>,
    alerts: Arc<AlertStore>,
    scanned: AtomicU64,
    alerts_raised: AtomicU64,
    failures: Mutex<HashMap<String, u64>>,
    pending: watch::Sender<u64>,
}

impl Shared {
    fn scan_one(&self, rules: &RuleSet, record: &HistoryRecord) {
        for rule in rules.iter().filter(|r| r.is_enabled()) {
            let result = catch_unwind(AssertUnwindSafe(|| rule.scan(&record.message)));
            match result {
                Ok(Ok(alerts)) => {
                    for alert in alerts {
                        self.raise(alert, record);
                    }
                }
                Ok(Err(e)) => {
                    warn!(rule = rule.name(), id = record.id, error = %e, "Passive rule failed");
                    self.record_failure(rule.name());
                }
                Err(_) => {
                    warn!(rule = rule.name(), id = record.id, "Passive rule panicked");
                    self.record_failure(rule.name());
                }
            }
        }
        self.scanned.fetch_add(1, Ordering::Relaxed);
        self.pending.send_modify(|n| *n = n.saturating_sub(1));
    }

    fn raise(&self, mut alert: Alert, record: &HistoryRecord) {
        if alert.uri.is_empty() {
            alert.uri = record.message.url().to_string();
            alert.method = record.message.method().to_string();
        }
        alert.source_history_id.get_or_insert(record.id);
        self.alerts_raised.fetch_add(1, Ordering::Relaxed);
        self.alerts.upsert(alert);
    }

    fn record_failure(&self, rule: &str) {
        *self.failures.lock().entry(rule.to_string()).or_insert(0) += 1;
    }
}

/// Passive scanner
pub struct PassiveScanDispatcher {
    tx: mpsc::Sender<Arc<HistoryRecord>>,
    shared: Arc<Shared>,
    settings: PassiveSettings,
    dropped: AtomicU64,
    events: EventBus,
}

impl PassiveScanDispatcher {
    /// Create the dispatcher and spawn its pump task. Must be called
    /// inside a tokio runtime.
    pub fn start(settings: PassiveSettings, alerts: Arc<AlertStore>, events: EventBus) -> Self {
        let (tx, rx) = mpsc::channel(settings.queue_capacity.max(1));
        let (pending, _) = watch::channel(0u64);
        let shared = Arc::new(Shared {
            rules: RwLock::new(Arc::new(Vec::new())),
            alerts,
            scanned: AtomicU64::new(0),
            alerts_raised: AtomicU64::new(0),
            failures: Mutex::new(HashMap::new()),
            pending,
        });

        tokio::spawn(pump(rx, Arc::clone(&shared), settings.workers.max(1)));

        Self {
            tx,
            shared,
            settings,
            dropped: AtomicU64::new(0),
            events,
        }
    }

    pub fn register_rule(&self, rule: Arc<dyn PassiveScanRule>) {
        let mut guard = self.shared.rules.write();
        let mut next: Vec<Arc<dyn PassiveScanRule>> = guard.as_ref().clone();
        debug!(rule = rule.name(), id = rule.id(), "Registering passive rule");
        next.push(rule);
        *guard = Arc::new(next);
    }

    /// Get list of rule names
    pub fn rule_names(&self) -> Vec<String> {
        self.shared.rules.read().iter().map(|r| r.name().to_string()).collect()
    }

    pub fn should_scan(&self, initiator: Initiator) -> bool {
        self.settings.initiators.contains(&initiator)
    }

    /// Queue a recorded exchange for scanning
    pub async fn enqueue(&self, record: Arc<HistoryRecord>) -> EnqueueOutcome {
        if !self.should_scan(record.message.initiator) {
            return EnqueueOutcome::Skipped;
        }

        // Count first so drain() never sees a queued message as idle
        self.shared.pending.send_modify(|n| *n += 1);
        let record = match self.tx.try_send(record) {
            Ok(()) => return EnqueueOutcome::Queued,
            Err(mpsc::error::TrySendError::Full(record)) => record,
            Err(mpsc::error::TrySendError::Closed(record)) => return self.drop_unscanned(&record),
        };

        match self.tx.send_timeout(record, self.settings.enqueue_timeout).await {
            Ok(()) => EnqueueOutcome::Queued,
            Err(mpsc::error::SendTimeoutError::Timeout(record))
            | Err(mpsc::error::SendTimeoutError::Closed(record)) => self.drop_unscanned(&record),
        }
    }

    fn drop_unscanned(&self, record: &HistoryRecord) -> EnqueueOutcome {
        self.shared.pending.send_modify(|n| *n = n.saturating_sub(1));
        let dropped = self.dropped.fetch_add(1, Ordering::Relaxed) + 1;
        warn!(id = record.id, dropped, "Passive scan queue full, message not scanned");
        self.events.publish(CoreEvent::PassiveScanDegraded { dropped });
        EnqueueOutcome::Dropped
    }

    /// Wait until the queue is empty and no rule is running
    pub async fn drain(&self) {
        let mut rx = self.shared.pending.subscribe();
        // the sender lives in `shared`, so this only fails if we are gone
        let _ = rx.wait_for(|n| *n == 0).await;
    }

    pub fn stats(&self) -> PassiveStats {
        PassiveStats {
            pending: *self.shared.pending.borrow(),
            scanned: self.shared.scanned.load(Ordering::Relaxed),
            dropped: self.dropped.load(Ordering::Relaxed),
            alerts_raised: self.shared.alerts_raised.load(Ordering::Relaxed),
            rule_failures: self.shared.failures.lock().clone(),
        }
    }
}

impl std::fmt::Debug for PassiveScanDispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PassiveScanDispatcher")
            .field("settings", &self.settings)
            .field("stats", &self.stats())
            .finish()
    }
}

async fn pump(mut rx: mpsc::Receiver<Arc<HistoryRecord>>, shared: Arc<Shared>, workers: usize) {
    let permits = Arc::new(Semaphore::new(workers));
    while let Some(record) = rx.recv().await {
        let Ok(permit) = Arc::clone(&permits).acquire_owned().await else {
            break;
        };
        let rules = Arc::clone(&shared.rules.read());
        let shared = Arc::clone(&shared);
        tokio::task::spawn_blocking(move || {
            shared.scan_one(&rules, &record);
            drop(permit);
        });
    }
    debug!("Passive scan pump stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::http::{Body, RequestHeader};
    use crate::proxy::HistoryStore;
    use crate::scanner::alerts::{Confidence, Risk};

    struct CountingRule {
        id: u32,
        seen: Arc<Mutex<Vec<u64>>>,
    }

    impl PassiveScanRule for CountingRule {
        fn id(&self) -> u32 {
            self.id
        }

        fn name(&self) -> &str {
            "counting"
        }

        fn scan(&self, message: &HttpMessage) -> Result<Vec<Alert>, ScanRuleError> {
            self.seen.lock().push(message.history_id.unwrap_or_default());
            Ok(vec![Alert::new(self.id, "Seen", Risk::Info, Confidence::High)])
        }
    }

    struct BrokenRule;

    impl PassiveScanRule for BrokenRule {
        fn id(&self) -> u32 {
            99
        }

        fn name(&self) -> &str {
            "broken"
        }

        fn scan(&self, _message: &HttpMessage) -> Result<Vec<Alert>, ScanRuleError> {
            panic!("rule bug");
        }
    }

    struct SlowRule;

    impl PassiveScanRule for SlowRule {
        fn id(&self) -> u32 {
            98
        }

        fn name(&self) -> &str {
            "slow"
        }

        fn scan(&self, _message: &HttpMessage) -> Result<Vec<Alert>, ScanRuleError> {
            std::thread::sleep(Duration::from_millis(300));
            Ok(Vec::new())
        }
    }

    fn record(store: &HistoryStore, i: usize, initiator: Initiator) -> Arc<HistoryRecord> {
        let header = RequestHeader::new("GET", &format!("http://example.com/{}", i)).unwrap();
        store.record(HttpMessage::new(header, Body::empty(), initiator))
    }

    #[tokio::test]
    async fn test_every_rule_sees_every_message_once() {
        let alerts = Arc::new(AlertStore::new(EventBus::default()));
        let dispatcher = PassiveScanDispatcher::start(PassiveSettings::default(), Arc::clone(&alerts), EventBus::default());
        let seen_a = Arc::new(Mutex::new(Vec::new()));
        let seen_b = Arc::new(Mutex::new(Vec::new()));
        dispatcher.register_rule(Arc::new(CountingRule { id: 1, seen: Arc::clone(&seen_a) }));
        dispatcher.register_rule(Arc::new(CountingRule { id: 2, seen: Arc::clone(&seen_b) }));
        dispatcher.register_rule(Arc::new(BrokenRule));

        let history = HistoryStore::new(100);
        for i in 0..20 {
            assert_eq!(dispatcher.enqueue(record(&history, i, Initiator::Proxy)).await, EnqueueOutcome::Queued);
        }
        dispatcher.drain().await;

        let mut a = seen_a.lock().clone();
        let mut b = seen_b.lock().clone();
        a.sort_unstable();
        b.sort_unstable();
        assert_eq!(a, (1..=20).collect::<Vec<u64>>());
        assert_eq!(a, b);

        let stats = dispatcher.stats();
        assert_eq!(stats.scanned, 20);
        assert_eq!(stats.pending, 0);
        assert_eq!(stats.rule_failures.get("broken"), Some(&20));
        assert_eq!(alerts.len(), 40);
    }

    #[tokio::test]
    async fn test_scan_traffic_is_not_passively_scanned() {
        let dispatcher = PassiveScanDispatcher::start(
            PassiveSettings::default(),
            Arc::new(AlertStore::new(EventBus::default())),
            EventBus::default(),
        );
        let history = HistoryStore::new(10);
        let outcome = dispatcher.enqueue(record(&history, 0, Initiator::ActiveScan)).await;
        assert_eq!(outcome, EnqueueOutcome::Skipped);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_full_queue_drops_and_signals() {
        let events = EventBus::default();
        let mut rx = events.subscribe();
        let settings = PassiveSettings {
            queue_capacity: 1,
            workers: 1,
            enqueue_timeout: Duration::from_millis(20),
            ..PassiveSettings::default()
        };
        let dispatcher =
            PassiveScanDispatcher::start(settings, Arc::new(AlertStore::new(EventBus::default())), events.clone());
        dispatcher.register_rule(Arc::new(SlowRule));

        let history = HistoryStore::new(100);
        let mut outcomes = Vec::new();
        for i in 0..6 {
            outcomes.push(dispatcher.enqueue(record(&history, i, Initiator::Proxy)).await);
        }
        assert!(outcomes.contains(&EnqueueOutcome::Dropped));

        let dropped = dispatcher.stats().dropped;
        assert!(dropped > 0);
        match rx.recv().await.unwrap() {
            CoreEvent::PassiveScanDegraded { dropped } => assert!(dropped >= 1),
            other => panic!("unexpected event {:?}", other),
        }

        dispatcher.drain().await;
        let stats = dispatcher.stats();
        assert_eq!(stats.scanned + stats.dropped, 6);
    }
}
