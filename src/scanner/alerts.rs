//! Security alerts and the deduplicating alert store

use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use tracing::debug;

use crate::app::events::{CoreEvent, EventBus};
use crate::error::ConfigError;
use crate::http::HttpMessage;

/// Risk level for alerts
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Risk {
    Info,
    Low,
    Medium,
    High,
}

impl Risk {
    pub fn as_str(&self) -> &'static str {
        match self {
            Risk::Info => "info",
            Risk::Low => "low",
            Risk::Medium => "medium",
            Risk::High => "high",
        }
    }
}

/// How sure the rule is about a finding
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Confidence {
    FalsePositive,
    Low,
    Medium,
    High,
    UserConfirmed,
}

/// A single finding
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Alert {
    /// Id of the rule or plugin that raised it
    pub plugin_id: u32,

    pub name: String,

    pub risk: Risk,

    pub confidence: Confidence,

    pub uri: String,

    pub method: String,

    /// Affected parameter, empty when the alert is not parameter specific
    pub param: String,

    pub attack: String,

    pub evidence: String,

    pub description: String,

    pub solution: String,

    pub other_info: String,

    pub cwe_id: Option<u32>,

    pub wasc_id: Option<u32>,

    pub tags: BTreeMap<String, String>,

    /// History record the alert was raised on
    pub source_history_id: Option<u64>,

    pub raised_at: DateTime<Utc>,
}

impl Alert {
    pub fn new(plugin_id: u32, name: &str, risk: Risk, confidence: Confidence) -> Self {
        Self {
            plugin_id,
            name: name.to_string(),
            risk,
            confidence,
            uri: String::new(),
            method: "GET".to_string(),
            param: String::new(),
            attack: String::new(),
            evidence: String::new(),
            description: String::new(),
            solution: String::new(),
            other_info: String::new(),
            cwe_id: None,
            wasc_id: None,
            tags: BTreeMap::new(),
            source_history_id: None,
            raised_at: Utc::now(),
        }
    }

    /// Take uri, method and history id from the message
    pub fn for_message(mut self, message: &HttpMessage) -> Self {
        self.uri = message.url().to_string();
        self.method = message.method().to_string();
        self.source_history_id = message.history_id;
        self
    }

    pub fn with_uri(mut self, uri: &str) -> Self {
        self.uri = uri.to_string();
        self
    }

    pub fn with_param(mut self, param: &str) -> Self {
        self.param = param.to_string();
        self
    }

    pub fn with_attack(mut self, attack: &str) -> Self {
        self.attack = attack.to_string();
        self
    }

    pub fn with_evidence(mut self, evidence: &str) -> Self {
        self.evidence = evidence.to_string();
        self
    }

    pub fn with_description(mut self, description: &str) -> Self {
        self.description = description.to_string();
        self
    }

    pub fn with_solution(mut self, solution: &str) -> Self {
        self.solution = solution.to_string();
        self
    }

    pub fn with_other_info(mut self, info: &str) -> Self {
        self.other_info = info.to_string();
        self
    }

    pub fn with_cwe(mut self, cwe_id: u32) -> Self {
        self.cwe_id = Some(cwe_id);
        self
    }

    pub fn with_wasc(mut self, wasc_id: u32) -> Self {
        self.wasc_id = Some(wasc_id);
        self
    }

    pub fn with_tag(mut self, key: &str, value: &str) -> Self {
        self.tags.insert(key.to_string(), value.to_string());
        self
    }

    pub fn key(&self) -> AlertKey {
        AlertKey {
            plugin_id: self.plugin_id,
            uri: self.uri.clone(),
            param: self.param.clone(),
        }
    }
}

/// Deduplication key
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct AlertKey {
    pub plugin_id: u32,
    pub uri: String,
    pub param: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpsertOutcome {
    Added,
    Replaced,
}

/// Risk an alert filter assigns
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FilterRisk {
    FalsePositive,
    Info,
    Low,
    Medium,
    High,
}

/// User rule rewriting alerts before they are stored
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct AlertFilter {
    pub plugin_id: u32,
    pub new_risk: FilterRisk,
    /// Url the alert must be raised on; exact unless `url_is_regex`
    pub url: Option<String>,
    pub url_is_regex: bool,
    pub parameter: Option<String>,
    pub enabled: bool,
}

impl Default for AlertFilter {
    fn default() -> Self {
        Self {
            plugin_id: 0,
            new_risk: FilterRisk::FalsePositive,
            url: None,
            url_is_regex: false,
            parameter: None,
            enabled: true,
        }
    }
}

impl AlertFilter {
    pub fn compile(&self) -> Result<CompiledAlertFilter, ConfigError> {
        let url_regex = match (&self.url, self.url_is_regex) {
            (Some(url), true) => Some(Regex::new(&format!("^(?:{})$", url)).map_err(|e| {
                ConfigError::ValidationError {
                    field: "alert_filters.url".into(),
                    reason: e.to_string(),
                }
            })?),
            _ => None,
        };
        Ok(CompiledAlertFilter {
            filter: self.clone(),
            url_regex,
        })
    }
}

#[derive(Debug, Clone)]
pub struct CompiledAlertFilter {
    filter: AlertFilter,
    url_regex: Option<Regex>,
}

impl CompiledAlertFilter {
    pub fn applies_to(&self, alert: &Alert) -> bool {
        let f = &self.filter;
        if !f.enabled || f.plugin_id != alert.plugin_id {
            return false;
        }
        let url_matches = match (&f.url, &self.url_regex) {
            (_, Some(re)) => re.is_match(&alert.uri),
            (Some(url), None) => url == &alert.uri,
            (None, None) => true,
        };
        url_matches && f.parameter.as_deref().map_or(true, |p| p == alert.param)
    }

    fn apply(&self, alert: &mut Alert) {
        match self.filter.new_risk {
            FilterRisk::FalsePositive => alert.confidence = Confidence::FalsePositive,
            FilterRisk::Info => alert.risk = Risk::Info,
            FilterRisk::Low => alert.risk = Risk::Low,
            FilterRisk::Medium => alert.risk = Risk::Medium,
            FilterRisk::High => alert.risk = Risk::High,
        }
    }
}

/// Deduplicated findings keyed by (plugin, uri, parameter); later alerts
/// replace earlier ones.
pub struct AlertStore {
    alerts: Mutex<HashMap<AlertKey, Arc<Alert>>>,
    filters: RwLock<Vec<CompiledAlertFilter>>,
    events: EventBus,
}

impl AlertStore {
    pub fn new(events: EventBus) -> Self {
        Self {
            alerts: Mutex::new(HashMap::new()),
            filters: RwLock::new(Vec::new()),
            events,
        }
    }

    pub fn set_filters(&self, filters: &[AlertFilter]) -> Result<(), ConfigError> {
        let compiled = filters.iter().map(AlertFilter::compile).collect::<Result<Vec<_>, _>>()?;
        *self.filters.write() = compiled;
        Ok(())
    }

    pub fn upsert(&self, mut alert: Alert) -> UpsertOutcome {
        for filter in self.filters.read().iter() {
            if filter.applies_to(&alert) {
                filter.apply(&mut alert);
            }
        }

        let alert = Arc::new(alert);
        let mut alerts = self.alerts.lock();
        let previous = alerts.insert(alert.key(), Arc::clone(&alert));
        let outcome = if previous.is_some() {
            UpsertOutcome::Replaced
        } else {
            UpsertOutcome::Added
        };
        debug!(plugin = alert.plugin_id, uri = %alert.uri, param = %alert.param, ?outcome, "Alert stored");

        // Published under the lock so subscribers see store order
        self.events.publish(match outcome {
            UpsertOutcome::Added => CoreEvent::AlertAdded(alert),
            UpsertOutcome::Replaced => CoreEvent::AlertReplaced(alert),
        });
        outcome
    }

    pub fn get(&self, key: &AlertKey) -> Option<Arc<Alert>> {
        self.alerts.lock().get(key).cloned()
    }

    /// All alerts, highest risk first
    pub fn all(&self) -> Vec<Arc<Alert>> {
        let mut alerts: Vec<Arc<Alert>> = self.alerts.lock().values().cloned().collect();
        alerts.sort_by(|a, b| b.risk.cmp(&a.risk).then_with(|| a.key().cmp(&b.key())));
        alerts
    }

    pub fn count_by_risk(&self) -> BTreeMap<Risk, usize> {
        let mut counts = BTreeMap::new();
        for alert in self.alerts.lock().values() {
            *counts.entry(alert.risk).or_insert(0) += 1;
        }
        counts
    }

    pub fn len(&self) -> usize {
        self.alerts.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.alerts.lock().is_empty()
    }

    pub fn clear(&self) {
        let mut alerts = self.alerts.lock();
        let removed = alerts.len();
        alerts.clear();
        self.events.publish(CoreEvent::AlertsCleared { removed });
    }
}

impl std::fmt::Debug for AlertStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AlertStore").field("alerts", &self.len()).finish()
    }
}
