//! Tollgate - TLS-intercepting security testing proxy
//!
//! An HTTP/1.1 proxy that terminates TLS with per-host certificates minted
//! from its own CA, records every exchange and feeds it to passive scan
//! rules. Recorded requests can be attacked by the active scan engine,
//! whose requests travel back through the same exchange path.

pub mod app;
pub mod error;
pub mod http;
pub mod proxy;
pub mod scanner;

pub use app::{Config, CoreEvent, EventBus, ProxyCore};
pub use error::{TollgateError, UserHint};
