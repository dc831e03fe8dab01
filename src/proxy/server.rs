//! Proxy server implementation

use parking_lot::Mutex;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;

use super::connection::{handle_connection, ConnectionContext};
use crate::app::events::{CoreEvent, EventBus};
use crate::error::ProxyError;

const ACCEPT_ERROR_BACKOFF: Duration = Duration::from_millis(100);

/// Intercepting proxy server
pub struct ProxyServer {
    /// Address to bind
    bind_addr: SocketAddr,

    /// Shared state for every connection
    ctx: Arc<ConnectionContext>,

    events: EventBus,

    /// Server shutdown signal
    shutdown_tx: Mutex<Option<oneshot::Sender<()>>>,

    accept_task: Mutex<Option<JoinHandle<()>>>,

    /// Actual bound address once running
    local_addr: Mutex<Option<SocketAddr>>,

    /// Server running flag
    running: Arc<AtomicBool>,
}

impl ProxyServer {
    pub fn new(bind_addr: SocketAddr, ctx: Arc<ConnectionContext>, events: EventBus) -> Self {
        Self {
            bind_addr,
            ctx,
            events,
            shutdown_tx: Mutex::new(None),
            accept_task: Mutex::new(None),
            local_addr: Mutex::new(None),
            running: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Bind and start accepting. Returns the bound address, which differs
    /// from the configured one when port 0 was requested.
    pub async fn start(&self) -> Result<SocketAddr, ProxyError> {
        if self.running.swap(true, Ordering::SeqCst) {
            return Err(ProxyError::AlreadyRunning);
        }

        let listener = match TcpListener::bind(self.bind_addr).await {
            Ok(listener) => listener,
            Err(e) => {
                self.running.store(false, Ordering::SeqCst);
                return Err(ProxyError::StartError {
                    addr: self.bind_addr.to_string(),
                    reason: e.to_string(),
                });
            }
        };
        let local_addr = listener.local_addr().map_err(|e| ProxyError::StartError {
            addr: self.bind_addr.to_string(),
            reason: e.to_string(),
        })?;

        tracing::info!(addr = %local_addr, "Proxy server listening");
        *self.local_addr.lock() = Some(local_addr);
        self.events.publish(CoreEvent::ProxyStarted { addr: local_addr });

        let (shutdown_tx, shutdown_rx) = oneshot::channel();
        *self.shutdown_tx.lock() = Some(shutdown_tx);

        let ctx = Arc::clone(&self.ctx);
        let task = tokio::spawn(accept_loop(listener, ctx, shutdown_rx));
        *self.accept_task.lock() = Some(task);

        Ok(local_addr)
    }

    /// Stop accepting. The listening socket is closed before this returns;
    /// connections already accepted run to completion.
    pub async fn stop(&self) {
        if !self.running.swap(false, Ordering::SeqCst) {
            return;
        }
        if let Some(tx) = self.shutdown_tx.lock().take() {
            let _ = tx.send(());
        }
        let task = self.accept_task.lock().take();
        if let Some(task) = task {
            let _ = task.await;
        }
        *self.local_addr.lock() = None;
        self.events.publish(CoreEvent::ProxyStopped);
        tracing::info!("Proxy server stopped");
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        *self.local_addr.lock()
    }

    /// Check if proxy is running
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }
}

async fn accept_loop(listener: TcpListener, ctx: Arc<ConnectionContext>, mut shutdown: oneshot::Receiver<()>) {
    loop {
        tokio::select! {
            _ = &mut shutdown => break,
            accepted = listener.accept() => match accepted {
                Ok((stream, peer)) => {
                    tracing::debug!(peer = %peer, "Proxy: new connection");
                    tokio::spawn(handle_connection(Arc::clone(&ctx), stream, peer));
                }
                Err(e) => {
                    tracing::error!(error = %e, "Accept error");
                    // Errors such as EMFILE persist; back off before retrying
                    tokio::time::sleep(ACCEPT_ERROR_BACKOFF).await;
                }
            },
        }
    }
    drop(listener);
}
