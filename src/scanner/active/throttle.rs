//! Per-host request limits shared by every active scan job

use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{AcquireError, OwnedSemaphorePermit, Semaphore};

/// Caps outstanding scan requests per host across all jobs
#[derive(Debug)]
pub struct HostThrottle {
    per_host: usize,
    hosts: Mutex<HashMap<String, Arc<Semaphore>>>,
}

impl HostThrottle {
    pub fn new(per_host: usize) -> Self {
        Self {
            per_host: per_host.max(1),
            hosts: Mutex::new(HashMap::new()),
        }
    }

    pub fn per_host(&self) -> usize {
        self.per_host
    }

    fn semaphore(&self, host: &str) -> Arc<Semaphore> {
        let mut hosts = self.hosts.lock();
        Arc::clone(
            hosts
                .entry(host.to_ascii_lowercase())
                .or_insert_with(|| Arc::new(Semaphore::new(self.per_host))),
        )
    }

    /// Wait for a request slot on `host`. The slot is released when the
    /// permit drops.
    pub async fn acquire(&self, host: &str) -> Result<OwnedSemaphorePermit, AcquireError> {
        self.semaphore(host).acquire_owned().await
    }

    /// Requests currently outstanding to `host`
    pub fn in_flight(&self, host: &str) -> usize {
        let hosts = self.hosts.lock();
        hosts
            .get(&host.to_ascii_lowercase())
            .map_or(0, |s| self.per_host - s.available_permits())
    }
}
