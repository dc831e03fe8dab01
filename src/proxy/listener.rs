//! Ordered observers in the exchange path
//!
//! Listeners run sequentially in ascending priority (ties in registration
//! order) right before a request is sent and right after its response is
//! received. They may mutate the message, and a before-send listener may
//! answer the request itself.

use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{debug, warn};

use crate::error::ListenerError;
use crate::http::{Body, HttpMessage, ResponseHeader};

/// Result of a before-send listener
#[derive(Debug)]
pub enum BeforeSendAction {
    Continue,
    Modified,
    /// Skip the remaining listeners and the origin; answer with this
    DropWithResponse(ResponseHeader, Body),
}

/// Result of an after-receive listener
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AfterReceiveAction {
    Continue,
    Modified,
}

/// Observer of every exchange going through the proxy
pub trait ProxyListener: Send + Sync {
    fn name(&self) -> &str;

    fn before_send(&self, _message: &mut HttpMessage) -> Result<BeforeSendAction, ListenerError> {
        Ok(BeforeSendAction::Continue)
    }

    fn after_receive(&self, _message: &mut HttpMessage) -> Result<AfterReceiveAction, ListenerError> {
        Ok(AfterReceiveAction::Continue)
    }
}

/// Token returned by registration, used to deregister
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerHandle(u64);

#[derive(Clone)]
struct Registered {
    handle: ListenerHandle,
    priority: i32,
    listener: Arc<dyn ProxyListener>,
}

/// Outcome of the before-send pass
#[derive(Debug, Default)]
pub struct BeforeSendOutcome {
    pub modified: bool,
    pub response: Option<(ResponseHeader, Body)>,
}

#[derive(Default)]
pub struct ListenerChain {
    /// Sorted snapshot, replaced wholesale on (de)registration
    listeners: RwLock<Arc<Vec<Registered>>>,
    next_handle: AtomicU64,
    failures: Mutex<HashMap<String, u64>>,
}

impl ListenerChain {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, priority: i32, listener: Arc<dyn ProxyListener>) -> ListenerHandle {
        let handle = ListenerHandle(self.next_handle.fetch_add(1, Ordering::Relaxed));
        let mut guard = self.listeners.write();
        let mut next: Vec<Registered> = guard.as_ref().clone();
        debug!(listener = listener.name(), priority, "Registering proxy listener");
        next.push(Registered {
            handle,
            priority,
            listener,
        });
        // stable sort keeps registration order for equal priorities
        next.sort_by_key(|r| r.priority);
        *guard = Arc::new(next);
        handle
    }

    pub fn deregister(&self, handle: ListenerHandle) -> bool {
        let mut guard = self.listeners.write();
        let before = guard.len();
        let next: Vec<Registered> = guard.iter().filter(|r| r.handle != handle).cloned().collect();
        let removed = next.len() != before;
        *guard = Arc::new(next);
        removed
    }

    pub fn len(&self) -> usize {
        self.listeners.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.listeners.read().is_empty()
    }

    fn snapshot(&self) -> Arc<Vec<Registered>> {
        Arc::clone(&self.listeners.read())
    }

    pub fn run_before_send(&self, message: &mut HttpMessage) -> BeforeSendOutcome {
        let mut outcome = BeforeSendOutcome::default();
        for entry in self.snapshot().iter() {
            let result = catch_unwind(AssertUnwindSafe(|| entry.listener.before_send(message)));
            match self.settle(entry, result) {
                Some(BeforeSendAction::Continue) | None => {}
                Some(BeforeSendAction::Modified) => outcome.modified = true,
                Some(BeforeSendAction::DropWithResponse(header, body)) => {
                    debug!(listener = entry.listener.name(), url = %message.url(), "Listener answered request");
                    outcome.response = Some((header, body));
                    break;
                }
            }
        }
        outcome
    }

    /// Returns whether any listener modified the message
    pub fn run_after_receive(&self, message: &mut HttpMessage) -> bool {
        let mut modified = false;
        for entry in self.snapshot().iter() {
            let result = catch_unwind(AssertUnwindSafe(|| entry.listener.after_receive(message)));
            if let Some(AfterReceiveAction::Modified) = self.settle(entry, result) {
                modified = true;
            }
        }
        modified
    }

    fn settle<T>(&self, entry: &Registered, result: std::thread::Result<Result<T, ListenerError>>) -> Option<T> {
        let name = entry.listener.name();
        match result {
            Ok(Ok(action)) => Some(action),
            Ok(Err(e)) => {
                warn!(listener = name, error = %e, "Proxy listener failed");
                self.record_failure(name);
                None
            }
            Err(_) => {
                warn!(listener = name, "Proxy listener panicked");
                self.record_failure(name);
                None
            }
        }
    }

    fn record_failure(&self, name: &str) {
        *self.failures.lock().entry(name.to_string()).or_insert(0) += 1;
    }

    pub fn failure_count(&self, name: &str) -> u64 {
        self.failures.lock().get(name).copied().unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::http::{synthetic_response, Initiator, RequestHeader};

    struct Recorder {
        name: String,
        calls: Arc<Mutex<Vec<String>>>,
        drop_request: bool,
    }

    impl ProxyListener for Recorder {
        fn name(&self) -> &str {
            &self.name
        }

        fn before_send(&self, message: &mut HttpMessage) -> Result<BeforeSendAction, ListenerError> {
            self.calls.lock().push(format!("before:{}", self.name));
            if self.drop_request {
                let (header, body) = synthetic_response(403, "Forbidden", "blocked");
                return Ok(BeforeSendAction::DropWithResponse(header, body));
            }
            message.request_header.headers.append("X-Seen-By", &self.name);
            Ok(BeforeSendAction::Modified)
        }

        fn after_receive(&self, _message: &mut HttpMessage) -> Result<AfterReceiveAction, ListenerError> {
            self.calls.lock().push(format!("after:{}", self.name));
            Ok(AfterReceiveAction::Continue)
        }
    }

    struct Panicker;

    impl ProxyListener for Panicker {
        fn name(&self) -> &str {
            "panicker"
        }

        fn before_send(&self, _message: &mut HttpMessage) -> Result<BeforeSendAction, ListenerError> {
            panic!("listener bug");
        }

        fn after_receive(&self, _message: &mut HttpMessage) -> Result<AfterReceiveAction, ListenerError> {
            Err(ListenerError::new("panicker", "cannot inspect"))
        }
    }

    fn message() -> HttpMessage {
        HttpMessage::new(
            RequestHeader::new("GET", "http://example.com/").unwrap(),
            Body::empty(),
            Initiator::Proxy,
        )
    }

    fn recorder(name: &str, calls: &Arc<Mutex<Vec<String>>>, drop_request: bool) -> Arc<dyn ProxyListener> {
        Arc::new(Recorder {
            name: name.to_string(),
            calls: Arc::clone(calls),
            drop_request,
        })
    }

    #[test]
    fn test_drop_at_20_skips_30() {
        let calls = Arc::new(Mutex::new(Vec::new()));
        let chain = ListenerChain::new();
        chain.register(30, recorder("p30", &calls, false));
        chain.register(10, recorder("p10", &calls, false));
        chain.register(20, recorder("p20", &calls, true));

        let mut msg = message();
        let outcome = chain.run_before_send(&mut msg);
        let (response, _) = outcome.response.unwrap();
        assert_eq!(response.status, 403);
        assert!(outcome.modified);
        assert_eq!(*calls.lock(), vec!["before:p10", "before:p20"]);

        chain.run_after_receive(&mut msg);
        assert_eq!(calls.lock()[2..], ["after:p10", "after:p20", "after:p30"]);
    }

    #[test]
    fn test_equal_priority_keeps_registration_order() {
        let calls = Arc::new(Mutex::new(Vec::new()));
        let chain = ListenerChain::new();
        chain.register(5, recorder("first", &calls, false));
        chain.register(5, recorder("second", &calls, false));

        let mut msg = message();
        chain.run_before_send(&mut msg);
        let seen: Vec<&str> = msg.request_header.headers.get_all("x-seen-by").collect();
        assert_eq!(seen, vec!["first", "second"]);
    }

    #[test]
    fn test_failures_are_isolated_and_counted() {
        let calls = Arc::new(Mutex::new(Vec::new()));
        let chain = ListenerChain::new();
        chain.register(0, Arc::new(Panicker));
        chain.register(1, recorder("after-panic", &calls, false));

        let mut msg = message();
        let outcome = chain.run_before_send(&mut msg);
        assert!(outcome.response.is_none());
        chain.run_after_receive(&mut msg);

        assert_eq!(chain.failure_count("panicker"), 2);
        assert_eq!(*calls.lock(), vec!["before:after-panic", "after:after-panic"]);
    }

    #[test]
    fn test_deregister() {
        let calls = Arc::new(Mutex::new(Vec::new()));
        let chain = ListenerChain::new();
        let handle = chain.register(0, recorder("gone", &calls, false));
        assert!(chain.deregister(handle));
        assert!(!chain.deregister(handle));
        assert!(chain.is_empty());
    }
}
