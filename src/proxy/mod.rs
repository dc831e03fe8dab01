//! Intercepting proxy module
//!
//! Accepts client connections, terminates TLS for CONNECT tunnels, runs
//! every exchange through the listener chain and records it in history.

mod connection;
mod exchange;
mod history;
mod listener;
mod relay;
mod server;
mod tls;
mod upstream;

#[cfg(test)]
mod tests;

pub use connection::{handle_connection, ConnectionContext, CA_ERROR_HEADER};
pub use exchange::{Exchanger, HttpSender};
pub use history::{
    HistoryCursor, HistoryPersistence, HistoryRecord, HistoryStore, JsonlPersistence, PinGuard, SiteFilter,
    DEFAULT_CURSOR_BATCH, DEFAULT_MAX_HISTORY_ITEMS,
};
pub use listener::{
    AfterReceiveAction, BeforeSendAction, BeforeSendOutcome, ListenerChain, ListenerHandle, ProxyListener,
};
pub use relay::{BufferedStream, CopyRelay, UpgradeRelay};
pub use server::ProxyServer;
pub use tls::{
    CaSettings, CaStats, CertificateAuthority, DynamicCertResolver, LeafCertificate, DEFAULT_LEAF_CACHE_CAPACITY,
    DEFAULT_LEAF_VALIDITY_DAYS,
};
pub use upstream::{AsyncStream, BoxedStream, UpstreamConnector, UpstreamPool, UpstreamSettings};
