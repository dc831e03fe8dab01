//! Application core module
//!
//! `ProxyCore` builds every component from a [`Config`] and owns them for
//! the lifetime of the process. Components receive what they need through
//! their constructors; nothing is reachable through globals.

pub mod config;
pub mod events;

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

pub use config::Config;
pub use events::{CoreEvent, EventBus};

use crate::error::{ProxyError, SchedulingError, TollgateError};
use crate::proxy::{
    CertificateAuthority, ConnectionContext, CopyRelay, Exchanger, HistoryStore, HttpSender, JsonlPersistence,
    ListenerChain, ListenerHandle, ProxyListener, ProxyServer, UpstreamConnector,
};
use crate::scanner::active::{attacks, ActiveScanEngine, ActiveScanPlugin, ScanJob, ScanScope};
use crate::scanner::alerts::AlertStore;
use crate::scanner::passive::{rules, PassiveScanDispatcher, PassiveScanRule};

/// Owns the proxy, the history and both scan engines
pub struct ProxyCore {
    config: Config,
    events: EventBus,
    ca: Arc<CertificateAuthority>,
    history: Arc<HistoryStore>,
    listeners: Arc<ListenerChain>,
    alerts: Arc<AlertStore>,
    passive: Arc<PassiveScanDispatcher>,
    exchanger: Arc<Exchanger>,
    active: Arc<ActiveScanEngine>,
    server: ProxyServer,
}

impl ProxyCore {
    /// Build every component. Must be called inside a tokio runtime.
    ///
    /// Unusable root material is fatal unless `proxy.fail_on_ca_error` is
    /// off, in which case the core starts without HTTPS interception.
    pub fn new(config: Config) -> Result<Self, TollgateError> {
        config.validate()?;
        let events = EventBus::new(config.general.event_capacity);

        let ca = CertificateAuthority::new(config.ca_settings());
        if let Err(e) = ca.availability() {
            if config.proxy.fail_on_ca_error {
                return Err(e.into());
            }
            warn!(error = %e, "Starting without a usable CA, CONNECT requests will be refused");
        }
        let ca = Arc::new(ca);

        let history = Arc::new(match &config.general.history_file {
            Some(path) => {
                let persistence = JsonlPersistence::open(path)?;
                info!(path = %path.display(), "Persisting history");
                HistoryStore::with_persistence(config.general.max_history_items, Arc::new(persistence))
            }
            None => HistoryStore::new(config.general.max_history_items),
        });

        let alerts = Arc::new(AlertStore::new(events.clone()));
        alerts.set_filters(&config.alert_filters)?;

        let passive = Arc::new(PassiveScanDispatcher::start(
            config.passive_settings(),
            Arc::clone(&alerts),
            events.clone(),
        ));

        let listeners = Arc::new(ListenerChain::new());
        let upstream = Arc::new(UpstreamConnector::new(config.upstream_settings())?);
        let exchanger = Arc::new(Exchanger::new(
            Arc::clone(&listeners),
            Arc::clone(&history),
            Arc::clone(&passive),
            upstream,
            config.message_reader(),
            events.clone(),
        ));

        let sender: Arc<dyn HttpSender> = exchanger.clone();
        let active = Arc::new(ActiveScanEngine::new(
            config.active_settings(),
            sender,
            Arc::clone(&history),
            Arc::clone(&alerts),
            events.clone(),
        ));
        active.set_policy(config.scan_policy()?);

        let ctx = Arc::new(ConnectionContext {
            exchanger: Arc::clone(&exchanger),
            ca: Arc::clone(&ca),
            relay: Arc::new(CopyRelay),
            events: events.clone(),
            idle_timeout: Duration::from_secs(config.proxy.idle_timeout_secs),
            handshake_timeout: Duration::from_secs(config.proxy.handshake_timeout_secs),
        });
        let server = ProxyServer::new(config.bind_addr()?, ctx, events.clone());

        Ok(Self {
            config,
            events,
            ca,
            history,
            listeners,
            alerts,
            passive,
            exchanger,
            active,
            server,
        })
    }

    /// Register the bundled passive rules and active plugins
    pub fn register_builtins(&self) {
        self.register_passive_rule(Arc::new(rules::SecurityHeadersRule::new()));
        self.register_passive_rule(Arc::new(rules::ServerBannerRule::new()));
        for plugin in attacks::builtin_plugins() {
            self.register_active_plugin(plugin);
        }
    }

    pub fn register_listener(&self, priority: i32, listener: Arc<dyn ProxyListener>) -> ListenerHandle {
        self.listeners.register(priority, listener)
    }

    pub fn deregister_listener(&self, handle: ListenerHandle) -> bool {
        self.listeners.deregister(handle)
    }

    pub fn register_passive_rule(&self, rule: Arc<dyn PassiveScanRule>) {
        self.passive.register_rule(rule);
    }

    pub fn register_active_plugin(&self, plugin: Arc<dyn ActiveScanPlugin>) {
        self.active.register_plugin(plugin);
    }

    pub async fn start(&self) -> Result<SocketAddr, ProxyError> {
        self.server.start().await
    }

    /// Close the listening socket and stop every scan job
    pub async fn stop(&self) {
        self.server.stop().await;
        self.active.stop_all();
    }

    /// Stop, then wait up to `grace` for queued passive scans to finish
    pub async fn shutdown(&self, grace: Duration) {
        self.stop().await;
        if tokio::time::timeout(grace, self.passive.drain()).await.is_err() {
            let stats = self.passive.stats();
            warn!(pending = stats.pending, "Passive scan queue not drained before shutdown");
        }
    }

    pub fn start_scan(&self, scope: ScanScope) -> Result<Arc<ScanJob>, SchedulingError> {
        self.active.start_scan(scope)
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.server.local_addr()
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn events(&self) -> &EventBus {
        &self.events
    }

    pub fn ca(&self) -> &Arc<CertificateAuthority> {
        &self.ca
    }

    pub fn history(&self) -> &Arc<HistoryStore> {
        &self.history
    }

    pub fn alerts(&self) -> &Arc<AlertStore> {
        &self.alerts
    }

    pub fn passive(&self) -> &Arc<PassiveScanDispatcher> {
        &self.passive
    }

    pub fn active(&self) -> &Arc<ActiveScanEngine> {
        &self.active
    }

    /// Send a request through listeners, history and passive scanning
    pub fn sender(&self) -> Arc<dyn HttpSender> {
        self.exchanger.clone()
    }
}

impl std::fmt::Debug for ProxyCore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProxyCore")
            .field("local_addr", &self.local_addr())
            .field("ca", &self.ca)
            .field("history", &self.history.len())
            .field("alerts", &self.alerts.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{CaError, ListenerError};
    use crate::http::HttpMessage;
    use crate::proxy::AfterReceiveAction;
    use crate::scanner::active::attacks::xss::REFLECTED_XSS_PLUGIN_ID;
    use crate::scanner::active::ScanStatus;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::{TcpListener, TcpStream};

    fn test_config() -> Config {
        let mut config = Config::default();
        config.proxy.port = 0;
        config
    }

    /// Origin that echoes the `q` query parameter into an HTML page
    async fn reflecting_origin() -> SocketAddr {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            loop {
                let Ok((mut socket, _)) = listener.accept().await else { break };
                tokio::spawn(async move {
                    let mut head = Vec::new();
                    let mut byte = [0u8; 1];
                    while !head.ends_with(b"\r\n\r\n") {
                        match socket.read(&mut byte).await {
                            Ok(0) | Err(_) => return,
                            Ok(_) => head.push(byte[0]),
                        }
                    }
                    let head = String::from_utf8_lossy(&head);
                    let target = head.split_whitespace().nth(1).unwrap_or("/");
                    let query = target.split_once('?').map(|(_, q)| q).unwrap_or("");
                    let q = url::form_urlencoded::parse(query.as_bytes())
                        .find(|(k, _)| k == "q")
                        .map(|(_, v)| v.into_owned())
                        .unwrap_or_default();
                    let body = format!("<html><body>Results for {}</body></html>", q);
                    let response = format!(
                        "HTTP/1.1 200 OK\r\nContent-Type: text/html\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
                        body.len(),
                        body
                    );
                    let _ = socket.write_all(response.as_bytes()).await;
                    let _ = socket.shutdown().await;
                });
            }
        });
        addr
    }

    struct Counter(AtomicUsize);

    impl ProxyListener for Counter {
        fn name(&self) -> &str {
            "counter"
        }

        fn after_receive(&self, _message: &mut HttpMessage) -> Result<AfterReceiveAction, ListenerError> {
            self.0.fetch_add(1, Ordering::SeqCst);
            Ok(AfterReceiveAction::Continue)
        }
    }

    #[tokio::test]
    async fn test_missing_keystore_is_fatal_by_default() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = test_config();
        config.proxy.ca_keystore_path = Some(dir.path().join("missing.pem"));
        config.proxy.generate_ca_if_missing = false;

        let err = ProxyCore::new(config.clone()).unwrap_err();
        assert!(matches!(err, TollgateError::Ca(CaError::Unavailable(_))), "{:?}", err);

        config.proxy.fail_on_ca_error = false;
        let core = ProxyCore::new(config).unwrap();
        assert!(!core.ca().is_available());
    }

    #[tokio::test]
    async fn test_generated_keystore_is_written() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("ca.pem");
        let mut config = test_config();
        config.proxy.ca_keystore_path = Some(path.clone());

        let core = ProxyCore::new(config.clone()).unwrap();
        assert!(core.ca().is_available());
        assert!(path.exists());

        // Second start loads the same root
        let again = ProxyCore::new(config).unwrap();
        assert_eq!(core.ca().root_cert_pem().unwrap(), again.ca().root_cert_pem().unwrap());
    }

    #[tokio::test]
    async fn test_builtins_registered() {
        let core = ProxyCore::new(test_config()).unwrap();
        core.register_builtins();
        assert_eq!(core.passive().rule_names().len(), 2);
        assert_eq!(core.active().plugin_names().len(), 2);
    }

    #[tokio::test]
    async fn test_proxied_request_then_active_scan() {
        let origin = reflecting_origin().await;
        let core = ProxyCore::new(test_config()).unwrap();
        core.register_builtins();
        let counter = Arc::new(Counter(AtomicUsize::new(0)));
        let handle = core.register_listener(10, counter.clone());
        let addr = core.start().await.unwrap();

        let mut client = TcpStream::connect(addr).await.unwrap();
        let request = format!(
            "GET http://{}/search?q=hello HTTP/1.1\r\nHost: {}\r\nConnection: close\r\n\r\n",
            origin, origin
        );
        client.write_all(request.as_bytes()).await.unwrap();
        let mut response = String::new();
        client.read_to_string(&mut response).await.unwrap();
        assert!(response.contains("Results for hello"), "{}", response);
        assert_eq!(core.history().len(), 1);

        let job = core.start_scan(ScanScope::Ids(vec![1])).unwrap();
        assert_eq!(job.wait().await, ScanStatus::Finished);

        let xss: Vec<_> = core
            .alerts()
            .all()
            .into_iter()
            .filter(|a| a.plugin_id == REFLECTED_XSS_PLUGIN_ID)
            .collect();
        assert_eq!(xss.len(), 1);
        assert_eq!(xss[0].param, "q");
        assert_eq!(xss[0].source_history_id, Some(1));

        // Attack requests went through listeners and history too
        assert!(core.history().len() > 1);
        assert_eq!(counter.0.load(Ordering::SeqCst), core.history().len());

        assert!(core.deregister_listener(handle));
        core.shutdown(Duration::from_secs(5)).await;
        assert!(core.local_addr().is_none());
    }
}
