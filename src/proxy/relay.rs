//! Raw byte relay for upgraded connections (WebSocket and friends)

use async_trait::async_trait;
use tokio::io::BufReader;
use tracing::debug;

use super::upstream::BoxedStream;

/// A stream with whatever was already read ahead still buffered
pub type BufferedStream = BufReader<BoxedStream>;

/// Takes over both sides of a connection after a `101 Switching Protocols`
#[async_trait]
pub trait UpgradeRelay: Send + Sync {
    async fn relay(&self, url: &str, client: BufferedStream, upstream: BufferedStream) -> std::io::Result<()>;
}

/// Copies bytes in both directions until either side closes
#[derive(Debug, Default, Clone, Copy)]
pub struct CopyRelay;

#[async_trait]
impl UpgradeRelay for CopyRelay {
    async fn relay(&self, url: &str, mut client: BufferedStream, mut upstream: BufferedStream) -> std::io::Result<()> {
        let (to_upstream, to_client) = tokio::io::copy_bidirectional(&mut client, &mut upstream).await?;
        debug!(url, to_upstream, to_client, "Upgraded connection closed");
        Ok(())
    }
}
