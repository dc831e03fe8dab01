//! Active scan job state and user controls

use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::watch;
use tracing::info;

use crate::app::events::{CoreEvent, EventBus};
use crate::proxy::SiteFilter;

/// Job lifecycle: `Pending -> Running <-> Paused -> (Finished | Stopped)`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ScanStatus {
    Pending,
    Running,
    Paused,
    Stopped,
    Finished,
}

impl ScanStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, ScanStatus::Stopped | ScanStatus::Finished)
    }
}

/// What a job may attack
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ScanScope {
    /// Explicit history records
    Ids(Vec<u64>),
    /// Every record under a site or path prefix
    Subtree(SiteFilter),
}

/// Snapshot of a job's counters
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ScanProgress {
    pub total_units: u64,
    pub completed_units: u64,
    pub requests_sent: u64,
    pub alerts_raised: u64,
    pub enabled_plugins: u64,
    pub plugin_failures: HashMap<String, u64>,
}

impl ScanProgress {
    /// Plugin invocations still to run
    pub fn remaining_estimate(&self) -> u64 {
        self.total_units.saturating_sub(self.completed_units) * self.enabled_plugins
    }

    pub fn percent(&self) -> u8 {
        if self.total_units == 0 {
            return 100;
        }
        ((self.completed_units * 100) / self.total_units).min(100) as u8
    }
}

/// Shared between the job handle, its scheduler and its units
#[derive(Debug)]
pub(crate) struct JobControl {
    pub(crate) id: String,
    status: watch::Sender<ScanStatus>,
    skipped: RwLock<HashSet<u32>>,
    pub(crate) total_units: AtomicU64,
    pub(crate) completed_units: AtomicU64,
    pub(crate) requests_sent: AtomicU64,
    pub(crate) alerts_raised: AtomicU64,
    pub(crate) enabled_plugins: AtomicU64,
    failures: Mutex<HashMap<String, u64>>,
    events: EventBus,
}

impl JobControl {
    pub(crate) fn new(id: String, events: EventBus) -> Self {
        let (status, _) = watch::channel(ScanStatus::Pending);
        Self {
            id,
            status,
            skipped: RwLock::new(HashSet::new()),
            total_units: AtomicU64::new(0),
            completed_units: AtomicU64::new(0),
            requests_sent: AtomicU64::new(0),
            alerts_raised: AtomicU64::new(0),
            enabled_plugins: AtomicU64::new(0),
            failures: Mutex::new(HashMap::new()),
            events,
        }
    }

    pub(crate) fn status(&self) -> ScanStatus {
        *self.status.borrow()
    }

    /// Apply `next` if `allowed(current)`; publishes the change
    fn transition(&self, allowed: impl Fn(ScanStatus) -> bool, next: ScanStatus) -> bool {
        let changed = self.status.send_if_modified(|current| {
            if allowed(*current) && *current != next {
                *current = next;
                true
            } else {
                false
            }
        });
        if changed {
            info!(job = %self.id, status = ?next, "Scan status changed");
            self.events.publish(CoreEvent::ScanStateChanged {
                job_id: self.id.clone(),
                status: next,
            });
        }
        changed
    }

    pub(crate) fn mark_running(&self) -> bool {
        self.transition(|s| s == ScanStatus::Pending, ScanStatus::Running)
    }

    pub(crate) fn pause(&self) -> bool {
        self.transition(|s| s == ScanStatus::Running, ScanStatus::Paused)
    }

    pub(crate) fn resume(&self) -> bool {
        self.transition(|s| s == ScanStatus::Paused, ScanStatus::Running)
    }

    pub(crate) fn stop(&self) -> bool {
        self.transition(|s| !s.is_terminal(), ScanStatus::Stopped)
    }

    pub(crate) fn finish(&self) -> bool {
        self.transition(|s| s == ScanStatus::Running || s == ScanStatus::Paused, ScanStatus::Finished)
    }

    pub(crate) fn is_stopped(&self) -> bool {
        self.status() == ScanStatus::Stopped
    }

    /// Wait out a pause. Returns false once the job is stopped.
    pub(crate) async fn wait_runnable(&self) -> bool {
        let mut rx = self.status.subscribe();
        let running = match rx.wait_for(|s| *s != ScanStatus::Paused && *s != ScanStatus::Pending).await {
            Ok(status) => *status == ScanStatus::Running,
            Err(_) => false,
        };
        running
    }

    /// Resolves on the next status change
    pub(crate) fn subscribe(&self) -> watch::Receiver<ScanStatus> {
        self.status.subscribe()
    }

    pub(crate) fn skip_plugin(&self, plugin_id: u32) {
        self.skipped.write().insert(plugin_id);
    }

    pub(crate) fn is_skipped(&self, plugin_id: u32) -> bool {
        self.skipped.read().contains(&plugin_id)
    }

    pub(crate) fn record_failure(&self, plugin: &str) {
        *self.failures.lock().entry(plugin.to_string()).or_insert(0) += 1;
    }

    pub(crate) fn progress(&self) -> ScanProgress {
        ScanProgress {
            total_units: self.total_units.load(Ordering::Relaxed),
            completed_units: self.completed_units.load(Ordering::Relaxed),
            requests_sent: self.requests_sent.load(Ordering::Relaxed),
            alerts_raised: self.alerts_raised.load(Ordering::Relaxed),
            enabled_plugins: self.enabled_plugins.load(Ordering::Relaxed),
            plugin_failures: self.failures.lock().clone(),
        }
    }

    pub(crate) fn publish_progress(&self) {
        self.events.publish(CoreEvent::ScanProgress {
            job_id: self.id.clone(),
            progress: self.progress(),
        });
    }
}

/// Handle to a running or finished active scan
#[derive(Debug)]
pub struct ScanJob {
    control: std::sync::Arc<JobControl>,
    scope: ScanScope,
    plugin_order: Vec<u32>,
    started_at: DateTime<Utc>,
}

impl ScanJob {
    pub(crate) fn new(control: std::sync::Arc<JobControl>, scope: ScanScope, plugin_order: Vec<u32>) -> Self {
        Self {
            control,
            scope,
            plugin_order,
            started_at: Utc::now(),
        }
    }

    pub fn id(&self) -> &str {
        &self.control.id
    }

    pub fn scope(&self) -> &ScanScope {
        &self.scope
    }

    /// Plugin ids in execution order
    pub fn plugin_order(&self) -> &[u32] {
        &self.plugin_order
    }

    pub fn started_at(&self) -> DateTime<Utc> {
        self.started_at
    }

    pub fn status(&self) -> ScanStatus {
        self.control.status()
    }

    pub fn progress(&self) -> ScanProgress {
        self.control.progress()
    }

    /// Stop dispatching new units and requests; in-flight requests complete
    pub fn pause(&self) -> bool {
        self.control.pause()
    }

    pub fn resume(&self) -> bool {
        self.control.resume()
    }

    /// Abandon the rest of the job. A paused job goes straight to stopped.
    pub fn stop(&self) -> bool {
        self.control.stop()
    }

    /// Skip a plugin for the rest of this job
    pub fn skip_plugin(&self, plugin_id: u32) {
        info!(job = %self.control.id, plugin = plugin_id, "Skipping plugin");
        self.control.skip_plugin(plugin_id);
    }

    /// Wait until the job finished or was stopped
    pub async fn wait(&self) -> ScanStatus {
        let mut rx = self.control.subscribe();
        let status = match rx.wait_for(|s| s.is_terminal()).await {
            Ok(status) => *status,
            Err(_) => self.control.status(),
        };
        status
    }
}
