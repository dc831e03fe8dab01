//! Active scan scheduling
//!
//! A job expands its scope into units (one recorded message and one of its
//! injection points) and runs every enabled plugin on each unit in
//! dependency-then-priority order. Units are dispatched round-robin across
//! hosts, at most `per_host_concurrency` per host and
//! `global_concurrency` in total, so a slow host only ever ties up its own
//! share. Each request additionally takes a per-host slot shared by every
//! job.

use parking_lot::{Mutex, RwLock};
use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap, HashSet, VecDeque};
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, Semaphore};
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::context::AttackContext;
use super::injection::{injection_points, InjectionPoint};
use super::job::{JobControl, ScanJob, ScanScope, ScanStatus};
use super::throttle::HostThrottle;
use super::ActiveScanPlugin;
use crate::app::events::EventBus;
use crate::error::{ExchangeError, ScanPluginError, SchedulingError};
use crate::proxy::{HistoryRecord, HistoryStore, HttpSender, PinGuard};
use crate::scanner::alerts::AlertStore;
use crate::scanner::policies::ScanPolicy;

#[derive(Debug, Clone)]
pub struct ActiveSettings {
    /// Units running at once, across all jobs
    pub global_concurrency: usize,
    /// Units and requests in flight per host
    pub per_host_concurrency: usize,
    pub request_timeout: Duration,
    pub plugin_timeout: Duration,
}

impl Default for ActiveSettings {
    fn default() -> Self {
        Self {
            global_concurrency: 10,
            per_host_concurrency: 2,
            request_timeout: Duration::from_secs(30),
            plugin_timeout: Duration::from_secs(300),
        }
    }
}

/// State every unit of every job needs
pub(crate) struct EngineShared {
    pub(crate) sender: Arc<dyn HttpSender>,
    pub(crate) throttle: HostThrottle,
    pub(crate) alerts: Arc<AlertStore>,
    pub(crate) global: Arc<Semaphore>,
    pub(crate) settings: ActiveSettings,
}

type PluginSet = Arc<Vec<Arc<dyn ActiveScanPlugin>>>;

/// Active scan engine
pub struct ActiveScanEngine {
    shared: Arc<EngineShared>,
    history: Arc<HistoryStore>,
    plugins: RwLock<PluginSet>,
    policy: RwLock<ScanPolicy>,
    jobs: Mutex<HashMap<String, Arc<ScanJob>>>,
    events: EventBus,
}

impl ActiveScanEngine {
    pub fn new(
        settings: ActiveSettings,
        sender: Arc<dyn HttpSender>,
        history: Arc<HistoryStore>,
        alerts: Arc<AlertStore>,
        events: EventBus,
    ) -> Self {
        let shared = Arc::new(EngineShared {
            sender,
            throttle: HostThrottle::new(settings.per_host_concurrency),
            alerts,
            global: Arc::new(Semaphore::new(settings.global_concurrency.max(1))),
            settings,
        });
        Self {
            shared,
            history,
            plugins: RwLock::new(Arc::new(Vec::new())),
            policy: RwLock::new(ScanPolicy::default()),
            jobs: Mutex::new(HashMap::new()),
            events,
        }
    }

    /// Register a plugin. A plugin with the same id is replaced.
    pub fn register_plugin(&self, plugin: Arc<dyn ActiveScanPlugin>) {
        let mut guard = self.plugins.write();
        let mut next: Vec<Arc<dyn ActiveScanPlugin>> = guard.iter().filter(|p| p.id() != plugin.id()).cloned().collect();
        debug!(plugin = plugin.name(), id = plugin.id(), "Registering active plugin");
        next.push(plugin);
        *guard = Arc::new(next);
    }

    pub fn plugin_names(&self) -> Vec<String> {
        self.plugins.read().iter().map(|p| p.name().to_string()).collect()
    }

    pub fn set_policy(&self, policy: ScanPolicy) {
        *self.policy.write() = policy;
    }

    pub fn policy(&self) -> ScanPolicy {
        self.policy.read().clone()
    }

    /// Validate the plugin order, pin the scope and spawn the job's
    /// scheduler. Must be called inside a tokio runtime.
    pub fn start_scan(&self, scope: ScanScope) -> Result<Arc<ScanJob>, SchedulingError> {
        let policy = self.policy();
        let registered: PluginSet = self.plugins.read().clone();
        let enabled: Vec<Arc<dyn ActiveScanPlugin>> =
            registered.iter().filter(|p| policy.is_enabled(p.id())).cloned().collect();
        if enabled.is_empty() {
            return Err(SchedulingError::NoPlugins);
        }
        let known: HashSet<u32> = registered.iter().map(|p| p.id()).collect();
        let ordered = order_plugins(&enabled, &known)?;

        let ids = match &scope {
            ScanScope::Ids(ids) => {
                let mut ids = ids.clone();
                ids.sort_unstable();
                ids.dedup();
                ids
            }
            ScanScope::Subtree(filter) => self.history.ids(filter),
        };
        if ids.is_empty() {
            return Err(SchedulingError::EmptyScope);
        }
        let pin = self.history.pin(&ids);

        let control = Arc::new(JobControl::new(Uuid::new_v4().to_string(), self.events.clone()));
        let order: Vec<u32> = ordered.iter().map(|p| p.id()).collect();
        let job = Arc::new(ScanJob::new(Arc::clone(&control), scope, order.clone()));
        self.jobs.lock().insert(job.id().to_string(), Arc::clone(&job));
        info!(job = %job.id(), records = ids.len(), plugins = ?order, "Starting active scan");

        let scheduler = Scheduler {
            shared: Arc::clone(&self.shared),
            history: Arc::clone(&self.history),
            control,
            plugins: Arc::new(ordered),
            policy: Arc::new(policy),
        };
        tokio::spawn(scheduler.run(ids, pin));
        Ok(job)
    }

    pub fn job(&self, id: &str) -> Option<Arc<ScanJob>> {
        self.jobs.lock().get(id).cloned()
    }

    pub fn jobs(&self) -> Vec<Arc<ScanJob>> {
        self.jobs.lock().values().cloned().collect()
    }

    pub fn pause(&self, id: &str) -> Result<bool, SchedulingError> {
        Ok(self.require(id)?.pause())
    }

    pub fn resume(&self, id: &str) -> Result<bool, SchedulingError> {
        Ok(self.require(id)?.resume())
    }

    pub fn stop(&self, id: &str) -> Result<bool, SchedulingError> {
        Ok(self.require(id)?.stop())
    }

    /// Stop every job that is still running or paused
    pub fn stop_all(&self) {
        for job in self.jobs() {
            job.stop();
        }
    }

    /// Drop finished and stopped jobs from the registry
    pub fn prune(&self) -> usize {
        let mut jobs = self.jobs.lock();
        let before = jobs.len();
        jobs.retain(|_, job| !job.status().is_terminal());
        before - jobs.len()
    }

    fn require(&self, id: &str) -> Result<Arc<ScanJob>, SchedulingError> {
        self.job(id).ok_or_else(|| SchedulingError::UnknownJob(id.to_string()))
    }
}

impl std::fmt::Debug for ActiveScanEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ActiveScanEngine")
            .field("settings", &self.shared.settings)
            .field("plugins", &self.plugin_names())
            .field("jobs", &self.jobs.lock().len())
            .finish()
    }
}

/// Order plugins so every dependency runs first, breaking ties by
/// ascending priority and then registration order.
///
/// Dependencies on registered but disabled plugins are ignored; unknown
/// ones are an error.
pub(crate) fn order_plugins(
    plugins: &[Arc<dyn ActiveScanPlugin>],
    registered: &HashSet<u32>,
) -> Result<Vec<Arc<dyn ActiveScanPlugin>>, SchedulingError> {
    let present: HashMap<u32, usize> = plugins.iter().enumerate().map(|(i, p)| (p.id(), i)).collect();
    let mut indegree = vec![0usize; plugins.len()];
    let mut dependents: Vec<Vec<usize>> = vec![Vec::new(); plugins.len()];

    for (i, plugin) in plugins.iter().enumerate() {
        for dep in plugin.depends_on() {
            if !registered.contains(&dep) {
                return Err(SchedulingError::MissingDependency {
                    plugin: plugin.id(),
                    missing: dep,
                });
            }
            if let Some(&d) = present.get(&dep) {
                indegree[i] += 1;
                dependents[d].push(i);
            }
        }
    }

    let mut ready: BinaryHeap<Reverse<(i32, usize)>> = indegree
        .iter()
        .enumerate()
        .filter(|(_, n)| **n == 0)
        .map(|(i, _)| Reverse((plugins[i].priority(), i)))
        .collect();
    let mut order = Vec::with_capacity(plugins.len());

    while let Some(Reverse((_, i))) = ready.pop() {
        order.push(Arc::clone(&plugins[i]));
        for &next in &dependents[i] {
            indegree[next] -= 1;
            if indegree[next] == 0 {
                ready.push(Reverse((plugins[next].priority(), next)));
            }
        }
    }

    if order.len() < plugins.len() {
        let mut stuck: Vec<u32> = indegree
            .iter()
            .enumerate()
            .filter(|(_, n)| **n > 0)
            .map(|(i, _)| plugins[i].id())
            .collect();
        stuck.sort_unstable();
        return Err(SchedulingError::DependencyCycle(stuck));
    }
    Ok(order)
}

struct Unit {
    record: Arc<HistoryRecord>,
    point: InjectionPoint,
}

/// Pending units per host, handed out round-robin
#[derive(Default)]
struct HostQueues {
    order: VecDeque<String>,
    queues: HashMap<String, VecDeque<Unit>>,
    len: usize,
}

impl HostQueues {
    fn push(&mut self, host: String, unit: Unit) {
        let queue = self.queues.entry(host.clone()).or_default();
        if queue.is_empty() {
            self.order.push_back(host);
        }
        queue.push_back(unit);
        self.len += 1;
    }

    fn len(&self) -> usize {
        self.len
    }

    fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Next unit from the first host in rotation that is under its cap
    fn next_ready(&mut self, in_flight: &HashMap<String, usize>, per_host: usize) -> Option<(String, Unit)> {
        for _ in 0..self.order.len() {
            let host = self.order.pop_front()?;
            if in_flight.get(&host).copied().unwrap_or(0) >= per_host {
                self.order.push_back(host);
                continue;
            }
            let queue = self.queues.get_mut(&host)?;
            let unit = queue.pop_front()?;
            if queue.is_empty() {
                self.queues.remove(&host);
            } else {
                self.order.push_back(host.clone());
            }
            self.len -= 1;
            return Some((host, unit));
        }
        None
    }
}

/// Tells the scheduler a unit is done, even if the unit task panicked
struct UnitDone {
    host: String,
    tx: mpsc::UnboundedSender<String>,
}

impl Drop for UnitDone {
    fn drop(&mut self) {
        let _ = self.tx.send(std::mem::take(&mut self.host));
    }
}

struct Scheduler {
    shared: Arc<EngineShared>,
    history: Arc<HistoryStore>,
    control: Arc<JobControl>,
    plugins: PluginSet,
    policy: Arc<ScanPolicy>,
}

impl Scheduler {
    async fn run(self, ids: Vec<u64>, _pin: PinGuard) {
        let mut queues = HostQueues::default();
        for id in ids {
            let Some(record) = self.history.get(id) else {
                warn!(job = %self.control.id, id, "History record vanished before scanning");
                continue;
            };
            let host = record.message.request_header.resolved().host;
            for point in injection_points(&record.message) {
                queues.push(
                    host.clone(),
                    Unit {
                        record: Arc::clone(&record),
                        point,
                    },
                );
            }
        }
        self.control.total_units.store(queues.len() as u64, Ordering::Relaxed);
        self.control
            .enabled_plugins
            .store(self.plugins.len() as u64, Ordering::Relaxed);
        self.control.mark_running();

        let global = self.shared.settings.global_concurrency.max(1);
        let per_host = self.shared.settings.per_host_concurrency.max(1);
        let (done_tx, mut done_rx) = mpsc::unbounded_channel::<String>();
        let mut in_flight: HashMap<String, usize> = HashMap::new();
        let mut running = 0usize;
        let mut status = self.control.subscribe();

        loop {
            let current = *status.borrow_and_update();
            if current == ScanStatus::Stopped {
                break;
            }
            if current == ScanStatus::Running {
                while running < global {
                    let Some((host, unit)) = queues.next_ready(&in_flight, per_host) else {
                        break;
                    };
                    *in_flight.entry(host.clone()).or_insert(0) += 1;
                    running += 1;
                    let done = UnitDone {
                        host,
                        tx: done_tx.clone(),
                    };
                    tokio::spawn(run_unit(
                        Arc::clone(&self.shared),
                        Arc::clone(&self.control),
                        Arc::clone(&self.plugins),
                        Arc::clone(&self.policy),
                        unit,
                        done,
                    ));
                }
            }
            if running == 0 && queues.is_empty() {
                break;
            }

            tokio::select! {
                Some(host) = done_rx.recv() => {
                    running -= 1;
                    if let Some(n) = in_flight.get_mut(&host) {
                        *n = n.saturating_sub(1);
                    }
                }
                changed = status.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
            }
        }

        if self.control.finish() {
            info!(job = %self.control.id, "Active scan finished");
        } else {
            info!(job = %self.control.id, pending = queues.len(), "Active scan stopped");
        }
        self.control.publish_progress();
    }
}

async fn run_unit(
    shared: Arc<EngineShared>,
    control: Arc<JobControl>,
    plugins: PluginSet,
    policy: Arc<ScanPolicy>,
    unit: Unit,
    _done: UnitDone,
) {
    let Ok(_global) = Arc::clone(&shared.global).acquire_owned().await else {
        return;
    };

    for plugin in plugins.iter() {
        if !control.wait_runnable().await {
            break;
        }
        let id = plugin.id();
        if control.is_skipped(id) || !plugin.applies_to(&unit.point) {
            continue;
        }

        let ctx = AttackContext::new(
            Arc::clone(&unit.record),
            unit.point.clone(),
            id,
            policy.strength(id),
            policy.threshold(id),
            Arc::clone(&shared),
            Arc::clone(&control),
        );
        let timeout = shared.settings.plugin_timeout;
        let task_plugin = Arc::clone(plugin);
        // Own task so a panic is attributed to this plugin only
        let outcome = tokio::spawn(async move { tokio::time::timeout(timeout, task_plugin.scan(&ctx)).await }).await;

        let name = plugin.name();
        match outcome {
            Ok(Ok(Ok(()))) | Ok(Ok(Err(ScanPluginError::Skipped))) => {}
            Ok(Ok(Err(ScanPluginError::Exchange(ExchangeError::Stopped)))) => break,
            Ok(Ok(Err(e))) => {
                warn!(job = %control.id, plugin = name, id = unit.record.id, param = %unit.point.name, error = %e, "Active plugin failed");
                control.record_failure(name);
            }
            Ok(Err(_)) => {
                warn!(job = %control.id, plugin = name, id = unit.record.id, timeout_ms = timeout.as_millis() as u64, "Active plugin timed out");
                control.record_failure(name);
            }
            Err(e) => {
                warn!(job = %control.id, plugin = name, id = unit.record.id, error = %e, "Active plugin panicked");
                control.record_failure(name);
            }
        }
    }

    control.completed_units.fetch_add(1, Ordering::Relaxed);
    control.publish_progress();
}
