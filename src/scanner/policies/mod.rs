//! Scan policies for configuring active scan behavior

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// How hard a plugin attacks: roughly how many variants it sends per point
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AttackStrength {
    Low,
    #[default]
    Medium,
    High,
    Insane,
}

impl AttackStrength {
    /// Upper bound on payloads tried per injection point
    pub fn payload_limit(&self) -> usize {
        match self {
            AttackStrength::Low => 3,
            AttackStrength::Medium => 8,
            AttackStrength::High => 16,
            AttackStrength::Insane => usize::MAX,
        }
    }
}

/// Minimum confidence an alert needs to be reported.
/// `Off` disables the plugin entirely.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AlertThreshold {
    Off,
    Low,
    #[default]
    Medium,
    High,
}

/// Per-plugin overrides
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PluginPolicy {
    #[serde(default = "default_true")]
    pub enabled: bool,

    pub strength: Option<AttackStrength>,

    pub threshold: Option<AlertThreshold>,
}

fn default_true() -> bool {
    true
}

impl Default for PluginPolicy {
    fn default() -> Self {
        Self {
            enabled: true,
            strength: None,
            threshold: None,
        }
    }
}

/// Scan policy configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScanPolicy {
    /// Policy name
    pub name: String,

    pub default_strength: AttackStrength,

    pub default_threshold: AlertThreshold,

    /// Overrides keyed by plugin id
    #[serde(default)]
    pub plugins: HashMap<u32, PluginPolicy>,
}

impl Default for ScanPolicy {
    fn default() -> Self {
        Self::standard()
    }
}

impl ScanPolicy {
    /// Standard scan policy - balanced between speed and coverage
    pub fn standard() -> Self {
        Self {
            name: "Standard".to_string(),
            default_strength: AttackStrength::Medium,
            default_threshold: AlertThreshold::Medium,
            plugins: HashMap::new(),
        }
    }

    /// Quick scan - fast but limited coverage
    pub fn quick() -> Self {
        Self {
            name: "Quick".to_string(),
            default_strength: AttackStrength::Low,
            default_threshold: AlertThreshold::High,
            plugins: HashMap::new(),
        }
    }

    /// Full scan - comprehensive but slow
    pub fn full() -> Self {
        Self {
            name: "Full".to_string(),
            default_strength: AttackStrength::Insane,
            default_threshold: AlertThreshold::Low,
            plugins: HashMap::new(),
        }
    }

    /// Check if a plugin is enabled
    pub fn is_enabled(&self, plugin_id: u32) -> bool {
        let enabled = self.plugins.get(&plugin_id).map_or(true, |p| p.enabled);
        enabled && self.threshold(plugin_id) != AlertThreshold::Off
    }

    pub fn strength(&self, plugin_id: u32) -> AttackStrength {
        self.plugins
            .get(&plugin_id)
            .and_then(|p| p.strength)
            .unwrap_or(self.default_strength)
    }

    pub fn threshold(&self, plugin_id: u32) -> AlertThreshold {
        self.plugins
            .get(&plugin_id)
            .and_then(|p| p.threshold)
            .unwrap_or(self.default_threshold)
    }

    /// Enable or disable a plugin
    pub fn set_enabled(&mut self, plugin_id: u32, enabled: bool) {
        self.plugins.entry(plugin_id).or_default().enabled = enabled;
    }

    pub fn set_strength(&mut self, plugin_id: u32, strength: AttackStrength) {
        self.plugins.entry(plugin_id).or_default().strength = Some(strength);
    }

    pub fn set_threshold(&mut self, plugin_id: u32, threshold: AlertThreshold) {
        self.plugins.entry(plugin_id).or_default().threshold = Some(threshold);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_overrides_fall_back_to_defaults() {
        let mut policy = ScanPolicy::standard();
        policy.set_strength(40018, AttackStrength::High);

        assert_eq!(policy.strength(40018), AttackStrength::High);
        assert_eq!(policy.threshold(40018), AlertThreshold::Medium);
        assert_eq!(policy.strength(40012), AttackStrength::Medium);
    }

    #[test]
    fn test_threshold_off_disables_plugin() {
        let mut policy = ScanPolicy::full();
        assert!(policy.is_enabled(40012));

        policy.set_threshold(40012, AlertThreshold::Off);
        assert!(!policy.is_enabled(40012));

        policy.set_threshold(40012, AlertThreshold::Low);
        policy.set_enabled(40012, false);
        assert!(!policy.is_enabled(40012));
    }

    #[test]
    fn test_policy_from_toml() {
        let policy: ScanPolicy = toml::from_str(
            r#"
            name = "Custom"
            default_strength = "high"
            default_threshold = "off"
            "#,
        )
        .unwrap();
        assert_eq!(policy.default_strength, AttackStrength::High);
        assert!(policy.plugins.is_empty());
        assert!(!policy.is_enabled(40012));
    }
}
