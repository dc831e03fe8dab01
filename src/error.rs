//! Custom error types for Tollgate
//!
//! Every failure is attributed to the narrowest scope that owns it: one
//! exchange, one connection, one rule, one plugin or one scan job. Only
//! CA and configuration failures are allowed to stop the proxy, and only
//! at startup.

use thiserror::Error;

/// Main error type for Tollgate operations
#[derive(Error, Debug)]
pub enum TollgateError {
    /// Configuration related errors
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    /// Certificate authority errors
    #[error("Certificate authority error: {0}")]
    Ca(#[from] CaError),

    /// Proxy server errors
    #[error("Proxy error: {0}")]
    Proxy(#[from] ProxyError),

    /// Upstream TLS client setup
    #[error("TLS error: {0}")]
    Tls(#[from] TlsError),

    /// Active scan scheduling errors
    #[error("Scheduling error: {0}")]
    Scheduling(#[from] SchedulingError),

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Configuration errors
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read configuration file: {path}")]
    ReadError { path: String, source: std::io::Error },

    #[error("Failed to parse configuration: {0}")]
    ParseError(String),

    #[error("Invalid configuration value: {field} - {reason}")]
    ValidationError { field: String, reason: String },
}

/// Malformed HTTP framing. Aborts the single exchange it was found in.
#[derive(Error, Debug)]
pub enum ProtocolError {
    #[error("Malformed start line: {0:?}")]
    MalformedStartLine(String),

    #[error("Malformed header line: {0:?}")]
    MalformedHeader(String),

    #[error("Invalid Content-Length: {0:?}")]
    InvalidContentLength(String),

    #[error("Unsupported transfer coding in request: {0:?}")]
    UnsupportedTransferCoding(String),

    #[error("Invalid chunk size line: {0:?}")]
    InvalidChunkSize(String),

    #[error("Unresolvable request target: {0:?}")]
    InvalidTarget(String),

    #[error("Header block exceeds {limit} bytes")]
    HeaderTooLarge { limit: usize },

    #[error("Body exceeds {limit} bytes")]
    BodyTooLarge { limit: usize },

    #[error("Connection closed mid-message")]
    UnexpectedEof,

    #[error("I/O error while reading message: {0}")]
    Io(#[from] std::io::Error),
}

impl ProtocolError {
    /// Whether the connection can carry another message after this error.
    ///
    /// Only errors found after the message was completely framed leave the
    /// byte stream at a known message boundary.
    pub fn connection_reusable(&self) -> bool {
        matches!(self, ProtocolError::InvalidTarget(_))
    }
}

/// TLS handshake failures on either leg of a tunnel
#[derive(Error, Debug)]
pub enum TlsError {
    #[error("Client handshake with {host} failed: {reason}")]
    ClientHandshake { host: String, reason: String },

    #[error("Upstream handshake with {host} failed: {reason}")]
    UpstreamHandshake { host: String, reason: String },

    #[error("Invalid server name: {0}")]
    InvalidServerName(String),

    #[error("TLS configuration error: {0}")]
    Config(String),
}

/// Failures reaching the origin server. Surfaced to the client as a
/// synthetic error response.
#[derive(Error, Debug)]
pub enum UpstreamError {
    #[error("Could not resolve {host}: {reason}")]
    Resolve { host: String, reason: String },

    #[error("Could not connect to {target}: {reason}")]
    Connect { target: String, reason: String },

    #[error("Timed out after {timeout_ms}ms talking to {target}")]
    Timeout { target: String, timeout_ms: u64 },

    #[error(transparent)]
    Tls(#[from] TlsError),

    #[error("Upstream sent an invalid response: {0}")]
    Protocol(#[from] ProtocolError),

    #[error("Upstream I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl UpstreamError {
    /// Status code of the synthetic response shown to the client
    pub fn status_code(&self) -> u16 {
        match self {
            UpstreamError::Timeout { .. } => 504,
            _ => 502,
        }
    }
}

/// Root certificate material problems and leaf minting failures
#[derive(Error, Debug, Clone)]
pub enum CaError {
    #[error("CA unavailable: {0}")]
    Unavailable(String),

    #[error("Invalid hostname for certificate: {0:?}")]
    InvalidHostname(String),

    #[error("Failed to generate certificate for {host}: {reason}")]
    Generation { host: String, reason: String },

    #[error("Failed to load keystore {path}: {reason}")]
    Keystore { path: String, reason: String },
}

/// Proxy server errors
#[derive(Error, Debug)]
pub enum ProxyError {
    #[error("Failed to start proxy on {addr}: {reason}")]
    StartError { addr: String, reason: String },

    #[error("Proxy already running")]
    AlreadyRunning,
}

/// Failure of one listener in the chain
#[derive(Error, Debug)]
#[error("Listener {listener} failed: {message}")]
pub struct ListenerError {
    pub listener: String,
    pub message: String,
}

impl ListenerError {
    pub fn new(listener: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            listener: listener.into(),
            message: message.into(),
        }
    }
}

/// Failure of one passive scan rule on one message
#[derive(Error, Debug)]
#[error("Passive rule {rule} failed: {message}")]
pub struct ScanRuleError {
    pub rule: String,
    pub message: String,
}

impl ScanRuleError {
    pub fn new(rule: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            rule: rule.into(),
            message: message.into(),
        }
    }
}

/// Failure of one active scan plugin at one injection point
#[derive(Error, Debug)]
pub enum ScanPluginError {
    #[error("Request failed: {0}")]
    Exchange(#[from] ExchangeError),

    #[error("Plugin timed out after {0}ms")]
    Timeout(u64),

    #[error("Plugin skipped")]
    Skipped,

    #[error("{0}")]
    Failed(String),
}

/// Internal invariant violations of the active scan scheduler.
/// Aborts only the affected job.
#[derive(Error, Debug, Clone)]
pub enum SchedulingError {
    #[error("Plugin {plugin} depends on unknown plugin {missing}")]
    MissingDependency { plugin: u32, missing: u32 },

    #[error("Dependency cycle between plugins {0:?}")]
    DependencyCycle(Vec<u32>),

    #[error("Scan scope is empty")]
    EmptyScope,

    #[error("No enabled plugins for this scan")]
    NoPlugins,

    #[error("Job {0} not found")]
    UnknownJob(String),
}

/// Errors from the shared "send a request, get a response" primitive
#[derive(Error, Debug)]
pub enum ExchangeError {
    #[error(transparent)]
    Upstream(#[from] UpstreamError),

    #[error("Request timed out after {0}ms")]
    Timeout(u64),

    #[error("Scan stopped")]
    Stopped,
}

impl TollgateError {
    /// Get a user-friendly error message
    pub fn user_message(&self) -> String {
        match self {
            TollgateError::Config(e) => format!("Configuration problem: {}", e.user_hint()),
            TollgateError::Ca(e) => format!("Certificate problem: {}", e.user_hint()),
            TollgateError::Proxy(e) => format!("Proxy issue: {}", e.user_hint()),
            TollgateError::Tls(e) => format!("TLS setup problem: {}", e),
            TollgateError::Scheduling(e) => format!("Scan issue: {}", e),
            TollgateError::Io(e) => format!("File system issue: {}", e),
        }
    }
}

/// Trait for providing user-friendly hints
pub trait UserHint {
    fn user_hint(&self) -> String;
}

impl UserHint for ConfigError {
    fn user_hint(&self) -> String {
        match self {
            ConfigError::ReadError { path, .. } => {
                format!("Could not read '{}'. Check if the file exists and you have read permissions.", path)
            }
            ConfigError::ParseError(_) => {
                "The configuration file has invalid syntax. Check for TOML formatting errors.".into()
            }
            ConfigError::ValidationError { field, reason } => {
                format!("Invalid value for '{}': {}", field, reason)
            }
        }
    }
}

impl UserHint for CaError {
    fn user_hint(&self) -> String {
        match self {
            CaError::Unavailable(_) | CaError::Keystore { .. } => {
                "HTTPS interception is disabled until the CA keystore is fixed. Check ca_keystore_path.".into()
            }
            CaError::InvalidHostname(host) => {
                format!("'{}' cannot be used as a certificate name.", host)
            }
            _ => self.to_string(),
        }
    }
}

impl UserHint for ProxyError {
    fn user_hint(&self) -> String {
        match self {
            ProxyError::StartError { addr, .. } => {
                format!("Could not start proxy on {}. It may already be in use.", addr)
            }
            _ => self.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_only_framed_errors_keep_connection() {
        assert!(ProtocolError::InvalidTarget("x".into()).connection_reusable());
        assert!(!ProtocolError::MalformedStartLine("x".into()).connection_reusable());
        assert!(!ProtocolError::UnexpectedEof.connection_reusable());
    }

    #[test]
    fn test_upstream_status_codes() {
        let timeout = UpstreamError::Timeout { target: "a:1".into(), timeout_ms: 10 };
        let connect = UpstreamError::Connect { target: "a:1".into(), reason: "refused".into() };
        assert_eq!(timeout.status_code(), 504);
        assert_eq!(connect.status_code(), 502);
    }
}
