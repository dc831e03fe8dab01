//! Application configuration management

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::ConfigError;
use crate::http::{Initiator, MessageReader, DEFAULT_MAX_BODY_BYTES, DEFAULT_MAX_HEADER_BYTES};
use crate::proxy::{CaSettings, UpstreamSettings, DEFAULT_LEAF_CACHE_CAPACITY, DEFAULT_LEAF_VALIDITY_DAYS, DEFAULT_MAX_HISTORY_ITEMS};
use crate::scanner::active::ActiveSettings;
use crate::scanner::alerts::AlertFilter;
use crate::scanner::passive::PassiveSettings;
use crate::scanner::policies::ScanPolicy;

/// Main application configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// General settings
    pub general: GeneralConfig,

    /// Proxy settings
    pub proxy: ProxyConfig,

    /// Scanner settings
    pub scanner: ScannerConfig,

    /// Rules rewriting alert risk before storage
    pub alert_filters: Vec<AlertFilter>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GeneralConfig {
    /// Maximum items in history
    pub max_history_items: usize,

    /// Append completed exchanges to this JSON-lines file
    pub history_file: Option<PathBuf>,

    /// Buffered events per subscriber before the slowest one lags
    pub event_capacity: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ProxyConfig {
    /// Proxy listen address
    #[serde(alias = "listenAddress")]
    pub address: String,

    pub port: u16,

    /// PEM keystore with the root certificate and key
    #[serde(alias = "caKeystorePath")]
    pub ca_keystore_path: Option<PathBuf>,

    /// Generate and write a root when the keystore is missing
    #[serde(alias = "generateCaIfMissing")]
    pub generate_ca_if_missing: bool,

    /// Refuse to start without usable root material.
    /// When false the proxy starts and refuses CONNECT instead.
    #[serde(alias = "failOnCaError")]
    pub fail_on_ca_error: bool,

    pub leaf_validity_days: u32,

    pub leaf_cache_capacity: usize,

    /// Accept any certificate presented by origin servers
    #[serde(alias = "upstreamTrustAllCerts")]
    pub upstream_trust_all_certs: bool,

    pub connect_timeout_secs: u64,

    pub read_timeout_secs: u64,

    /// Close idle client connections after this long
    pub idle_timeout_secs: u64,

    pub handshake_timeout_secs: u64,

    pub max_header_bytes: usize,

    pub max_body_bytes: usize,

    /// `host:port` to `ip:port` overrides applied before DNS
    pub resolve_overrides: HashMap<String, String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ScannerConfig {
    #[serde(alias = "passiveScanQueueCapacity")]
    pub passive_scan_queue_capacity: usize,

    pub passive_workers: usize,

    /// How long the proxy waits on a full passive queue before dropping
    pub passive_enqueue_timeout_ms: u64,

    /// Initiators whose messages are passively scanned
    pub passive_scan_initiators: Vec<Initiator>,

    #[serde(alias = "activeScanGlobalConcurrency")]
    pub active_scan_global_concurrency: usize,

    #[serde(alias = "activeScanPerHostConcurrency")]
    pub active_scan_per_host_concurrency: usize,

    /// Request timeout in seconds
    pub request_timeout_secs: u64,

    /// Upper bound for one plugin at one injection point
    pub plugin_timeout_secs: u64,

    /// Default scan policy: "standard", "quick" or "full"
    pub default_policy: String,
}

impl Default for GeneralConfig {
    fn default() -> Self {
        Self {
            max_history_items: DEFAULT_MAX_HISTORY_ITEMS,
            history_file: None,
            event_capacity: crate::app::events::DEFAULT_EVENT_CAPACITY,
        }
    }
}

impl Default for ProxyConfig {
    fn default() -> Self {
        let upstream = UpstreamSettings::default();
        Self {
            address: "127.0.0.1".to_string(),
            port: 8080,
            ca_keystore_path: None,
            generate_ca_if_missing: true,
            fail_on_ca_error: true,
            leaf_validity_days: DEFAULT_LEAF_VALIDITY_DAYS,
            leaf_cache_capacity: DEFAULT_LEAF_CACHE_CAPACITY,
            upstream_trust_all_certs: false,
            connect_timeout_secs: upstream.connect_timeout.as_secs(),
            read_timeout_secs: upstream.read_timeout.as_secs(),
            idle_timeout_secs: 60,
            handshake_timeout_secs: 10,
            max_header_bytes: DEFAULT_MAX_HEADER_BYTES,
            max_body_bytes: DEFAULT_MAX_BODY_BYTES,
            resolve_overrides: HashMap::new(),
        }
    }
}

impl Default for ScannerConfig {
    fn default() -> Self {
        let passive = PassiveSettings::default();
        let active = ActiveSettings::default();
        Self {
            passive_scan_queue_capacity: passive.queue_capacity,
            passive_workers: passive.workers,
            passive_enqueue_timeout_ms: passive.enqueue_timeout.as_millis() as u64,
            passive_scan_initiators: passive.initiators,
            active_scan_global_concurrency: active.global_concurrency,
            active_scan_per_host_concurrency: active.per_host_concurrency,
            request_timeout_secs: active.request_timeout.as_secs(),
            plugin_timeout_secs: active.plugin_timeout.as_secs(),
            default_policy: "standard".to_string(),
        }
    }
}

impl Config {
    /// Load configuration from file
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let config_path = match path {
            Some(p) => p.to_path_buf(),
            None => Self::default_config_path()?,
        };

        if config_path.exists() {
            let contents = std::fs::read_to_string(&config_path)
                .with_context(|| format!("Failed to read config from {:?}", config_path))?;

            let config = Self::from_toml(&contents).with_context(|| format!("Invalid configuration in {:?}", config_path))?;

            tracing::info!(path = ?config_path, "Loaded configuration");
            Ok(config)
        } else if path.is_some() {
            anyhow::bail!("Configuration file {:?} does not exist", config_path)
        } else {
            tracing::info!("No configuration file found, using defaults");
            Ok(Self::default())
        }
    }

    /// Parse and validate
    pub fn from_toml(contents: &str) -> Result<Self, ConfigError> {
        let config: Config = toml::from_str(contents).map_err(|e| ConfigError::ParseError(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Save configuration to file
    pub fn save(&self, path: Option<&Path>) -> Result<()> {
        let config_path = match path {
            Some(p) => p.to_path_buf(),
            None => Self::default_config_path()?,
        };

        if let Some(parent) = config_path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create config directory {:?}", parent))?;
        }

        let contents = toml::to_string_pretty(self).context("Failed to serialize configuration")?;
        std::fs::write(&config_path, contents)
            .with_context(|| format!("Failed to write config to {:?}", config_path))?;

        tracing::info!(path = ?config_path, "Saved configuration");
        Ok(())
    }

    /// Reject values the components cannot run with
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.bind_addr()?;

        let positive = [
            ("general.max_history_items", self.general.max_history_items),
            ("general.event_capacity", self.general.event_capacity),
            ("proxy.leaf_cache_capacity", self.proxy.leaf_cache_capacity),
            ("proxy.leaf_validity_days", self.proxy.leaf_validity_days as usize),
            ("proxy.max_header_bytes", self.proxy.max_header_bytes),
            ("scanner.passive_scan_queue_capacity", self.scanner.passive_scan_queue_capacity),
            ("scanner.passive_workers", self.scanner.passive_workers),
            ("scanner.active_scan_global_concurrency", self.scanner.active_scan_global_concurrency),
            ("scanner.active_scan_per_host_concurrency", self.scanner.active_scan_per_host_concurrency),
        ];
        for (field, value) in positive {
            if value == 0 {
                return Err(invalid(field, "must be greater than zero"));
            }
        }

        if self.scanner.active_scan_per_host_concurrency > self.scanner.active_scan_global_concurrency {
            return Err(invalid(
                "scanner.active_scan_per_host_concurrency",
                "cannot exceed active_scan_global_concurrency",
            ));
        }
        if self.scanner.request_timeout_secs == 0 || self.scanner.plugin_timeout_secs == 0 {
            return Err(invalid("scanner.request_timeout_secs", "timeouts must be greater than zero"));
        }
        if self.proxy.connect_timeout_secs == 0 || self.proxy.read_timeout_secs == 0 {
            return Err(invalid("proxy.connect_timeout_secs", "timeouts must be greater than zero"));
        }
        self.scan_policy()?;

        for filter in &self.alert_filters {
            filter.compile()?;
        }
        Ok(())
    }

    pub fn bind_addr(&self) -> Result<SocketAddr, ConfigError> {
        let addr = crate::http::format_authority(&self.proxy.address, self.proxy.port);
        addr.parse()
            .map_err(|_| invalid("proxy.address", &format!("'{}' is not an IP address", self.proxy.address)))
    }

    pub fn scan_policy(&self) -> Result<ScanPolicy, ConfigError> {
        match self.scanner.default_policy.to_ascii_lowercase().as_str() {
            "standard" => Ok(ScanPolicy::standard()),
            "quick" => Ok(ScanPolicy::quick()),
            "full" => Ok(ScanPolicy::full()),
            other => Err(invalid(
                "scanner.default_policy",
                &format!("unknown policy '{}', expected standard, quick or full", other),
            )),
        }
    }

    pub fn ca_settings(&self) -> CaSettings {
        CaSettings {
            keystore_path: self.proxy.ca_keystore_path.clone(),
            generate_if_missing: self.proxy.generate_ca_if_missing,
            leaf_validity_days: self.proxy.leaf_validity_days,
            cache_capacity: self.proxy.leaf_cache_capacity,
        }
    }

    pub fn upstream_settings(&self) -> UpstreamSettings {
        UpstreamSettings {
            connect_timeout: Duration::from_secs(self.proxy.connect_timeout_secs),
            read_timeout: Duration::from_secs(self.proxy.read_timeout_secs),
            trust_all_certs: self.proxy.upstream_trust_all_certs,
            resolve_overrides: self.proxy.resolve_overrides.clone(),
        }
    }

    pub fn message_reader(&self) -> MessageReader {
        MessageReader::new(self.proxy.max_header_bytes, self.proxy.max_body_bytes)
    }

    pub fn passive_settings(&self) -> PassiveSettings {
        PassiveSettings {
            queue_capacity: self.scanner.passive_scan_queue_capacity,
            workers: self.scanner.passive_workers,
            enqueue_timeout: Duration::from_millis(self.scanner.passive_enqueue_timeout_ms),
            initiators: self.scanner.passive_scan_initiators.clone(),
        }
    }

    pub fn active_settings(&self) -> ActiveSettings {
        ActiveSettings {
            global_concurrency: self.scanner.active_scan_global_concurrency,
            per_host_concurrency: self.scanner.active_scan_per_host_concurrency,
            request_timeout: Duration::from_secs(self.scanner.request_timeout_secs),
            plugin_timeout: Duration::from_secs(self.scanner.plugin_timeout_secs),
        }
    }

    /// Get default configuration file path
    pub fn default_config_path() -> Result<PathBuf> {
        let dirs = directories::ProjectDirs::from("io", "tollgate", "tollgate")
            .context("Failed to determine config directory")?;

        Ok(dirs.config_dir().join("config.toml"))
    }

    /// Get data directory path
    pub fn data_dir() -> Result<PathBuf> {
        let dirs = directories::ProjectDirs::from("io", "tollgate", "tollgate")
            .context("Failed to determine data directory")?;

        Ok(dirs.data_dir().to_path_buf())
    }
}

fn invalid(field: &str, reason: &str) -> ConfigError {
    ConfigError::ValidationError {
        field: field.to_string(),
        reason: reason.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        let config = Config::default();
        config.validate().unwrap();
        assert_eq!(config.bind_addr().unwrap(), "127.0.0.1:8080".parse().unwrap());
        assert!(config.proxy.fail_on_ca_error);
    }

    #[test]
    fn test_camel_case_aliases() {
        let config = Config::from_toml(
            r#"
            [proxy]
            port = 9090
            address = "0.0.0.0"
            caKeystorePath = "/tmp/ca.pem"
            upstreamTrustAllCerts = true

            [scanner]
            activeScanGlobalConcurrency = 20
            activeScanPerHostConcurrency = 4
            passiveScanQueueCapacity = 50
            "#,
        )
        .unwrap();

        assert_eq!(config.proxy.port, 9090);
        assert_eq!(config.proxy.ca_keystore_path, Some(PathBuf::from("/tmp/ca.pem")));
        assert!(config.upstream_settings().trust_all_certs);
        assert_eq!(config.active_settings().global_concurrency, 20);
        assert_eq!(config.active_settings().per_host_concurrency, 4);
        assert_eq!(config.passive_settings().queue_capacity, 50);
    }

    #[test]
    fn test_validation_rejects_bad_values() {
        let mut config = Config::default();
        config.scanner.active_scan_per_host_concurrency = 0;
        assert!(matches!(config.validate(), Err(ConfigError::ValidationError { .. })));

        let mut config = Config::default();
        config.scanner.active_scan_per_host_concurrency = 50;
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.proxy.address = "localhost".into();
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.scanner.default_policy = "paranoid".into();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_parse_error_is_reported() {
        let err = Config::from_toml("[proxy\nport = ").unwrap_err();
        assert!(matches!(err, ConfigError::ParseError(_)));
    }

    #[test]
    fn test_alert_filters_section() {
        let config = Config::from_toml(
            r#"
            [[alert_filters]]
            plugin_id = 10021
            new_risk = "false_positive"
            url = "https://example\\.com/.*"
            url_is_regex = true
            "#,
        )
        .unwrap();
        assert_eq!(config.alert_filters.len(), 1);
        assert!(config.alert_filters[0].url_is_regex);

        let bad = Config::from_toml(
            r#"
            [[alert_filters]]
            plugin_id = 1
            url = "("
            url_is_regex = true
            "#,
        );
        assert!(bad.is_err());
    }

    #[test]
    fn test_save_and_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("config.toml");

        let mut config = Config::default();
        config.proxy.port = 18080;
        config.scanner.passive_scan_initiators = vec![Initiator::Proxy];
        config.save(Some(&path)).unwrap();

        let loaded = Config::load(Some(&path)).unwrap();
        assert_eq!(loaded.proxy.port, 18080);
        assert_eq!(loaded.scanner.passive_scan_initiators, vec![Initiator::Proxy]);
    }

    #[test]
    fn test_missing_explicit_path_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        assert!(Config::load(Some(&dir.path().join("absent.toml"))).is_err());
    }
}
