//! Per-connection state machine
//!
//! A client connection starts as plain HTTP. A `CONNECT` turns it into a
//! TLS tunnel terminated with a leaf from the CA, after which a fresh
//! request loop runs inside the tunnel. Each loop reads a request, runs it
//! through the exchange path and writes the response until either side
//! asks to close or the connection is upgraded.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tokio_rustls::TlsAcceptor;
use tracing::{debug, info, warn};

use super::exchange::Exchanger;
use super::relay::{BufferedStream, UpgradeRelay};
use super::tls::CertificateAuthority;
use super::upstream::BoxedStream;
use crate::app::events::{CoreEvent, EventBus};
use crate::error::{ProtocolError, TlsError};
use crate::http::{synthetic_response, Body, HttpMessage, Initiator, RequestHeader, ResponseHeader, TargetContext};

pub const CA_ERROR_HEADER: &str = "X-Tollgate-Error";

/// Everything a connection task needs, shared by all connections
pub struct ConnectionContext {
    pub exchanger: Arc<Exchanger>,
    pub ca: Arc<CertificateAuthority>,
    pub relay: Arc<dyn UpgradeRelay>,
    pub events: EventBus,
    /// Max wait for the next request on an open connection
    pub idle_timeout: Duration,
    pub handshake_timeout: Duration,
}

/// What the request loop ended with
enum Flow {
    Closed,
    /// Client asked for a tunnel; the stream is handed back for the handshake
    Connect(BufferedStream, RequestHeader),
}

/// Serve one accepted client connection until it closes
pub async fn handle_connection(ctx: Arc<ConnectionContext>, stream: TcpStream, peer: SocketAddr) {
    let _ = stream.set_nodelay(true);
    let mut client: BufferedStream = BufReader::new(Box::new(stream));
    let mut target_ctx = TargetContext::plain();

    loop {
        match serve(&ctx, client, &target_ctx, peer).await {
            Flow::Closed => break,
            Flow::Connect(stream, header) => match establish_tunnel(&ctx, stream, &header, peer).await {
                Some((tls_client, tunnel_ctx)) => {
                    client = tls_client;
                    target_ctx = tunnel_ctx;
                }
                None => break,
            },
        }
    }
    debug!(peer = %peer, "Client connection closed");
}

async fn serve(ctx: &ConnectionContext, mut client: BufferedStream, target_ctx: &TargetContext, peer: SocketAddr) -> Flow {
    let reader = ctx.exchanger.reader();
    let mut pool = ctx.exchanger.pool();

    loop {
        let read = tokio::time::timeout(ctx.idle_timeout, reader.read_request(&mut client, target_ctx)).await;
        let (header, body) = match read {
            Err(_) => {
                debug!(peer = %peer, "Client connection idle, closing");
                return Flow::Closed;
            }
            Ok(Ok(None)) => return Flow::Closed,
            Ok(Ok(Some(request))) => request,
            Ok(Err(e)) => {
                debug!(peer = %peer, error = %e, "Malformed request");
                let reusable = e.connection_reusable();
                let (status, reason) = protocol_status(&e);
                let (mut resp, body) = synthetic_response(status, reason, &e.to_string());
                if !reusable {
                    resp.headers.append("Connection", "close");
                }
                if write_response(&mut client, &resp, &body).await.is_err() || !reusable {
                    return Flow::Closed;
                }
                continue;
            }
        };

        if header.is_connect() {
            return Flow::Connect(client, header);
        }

        let client_keep_alive = header.wants_keep_alive();
        let upgrade = header.is_upgrade();
        let target = header.resolved();
        let message = HttpMessage::new(header, body, Initiator::Proxy);

        let record = match ctx.exchanger.exchange(message, &mut pool).await {
            Ok(record) => record,
            Err(e) => {
                warn!(peer = %peer, target = %target.authority(), error = %e, "Upstream request failed");
                let status = e.status_code();
                let reason = if status == 504 { "Gateway Timeout" } else { "Bad Gateway" };
                let (resp, body) = synthetic_response(status, reason, &e.to_string());
                if write_response(&mut client, &resp, &body).await.is_err() || !client_keep_alive {
                    return Flow::Closed;
                }
                continue;
            }
        };

        let message = &record.message;
        let Some(resp) = &message.response_header else {
            return Flow::Closed;
        };
        if write_response(&mut client, resp, &message.response_body).await.is_err() {
            return Flow::Closed;
        }

        if upgrade && resp.status == 101 {
            if let Some(upstream) = pool.take(&target) {
                debug!(peer = %peer, url = %message.url(), "Connection upgraded, relaying");
                if let Err(e) = ctx.relay.relay(message.url(), client, upstream).await {
                    debug!(peer = %peer, error = %e, "Upgrade relay ended with error");
                }
            }
            return Flow::Closed;
        }

        if !client_keep_alive || !resp.wants_keep_alive() || message.response_body.is_until_close() {
            let _ = client.get_mut().shutdown().await;
            return Flow::Closed;
        }
    }
}

async fn establish_tunnel(
    ctx: &ConnectionContext,
    mut client: BufferedStream,
    header: &RequestHeader,
    peer: SocketAddr,
) -> Option<(BufferedStream, TargetContext)> {
    let target = header.resolved();
    let host = target.host.trim_start_matches('[').trim_end_matches(']').to_string();

    // Mint before answering so a broken CA never yields a half-open tunnel
    let ca = Arc::clone(&ctx.ca);
    let mint_host = host.clone();
    let minted = tokio::task::spawn_blocking(move || ca.leaf_for(&mint_host)).await;
    let ca_failure = match minted {
        Ok(Ok(_)) => None,
        Ok(Err(e)) => Some(e.to_string()),
        Err(e) => Some(e.to_string()),
    };
    if let Some(reason) = ca_failure {
        warn!(peer = %peer, host = %host, reason = %reason, "Refusing CONNECT, CA unavailable");
        ctx.events.publish(CoreEvent::CaUnavailable {
            host: host.clone(),
            reason: reason.clone(),
        });
        let (mut resp, body) = synthetic_response(503, "Service Unavailable", &reason);
        resp.headers.append(CA_ERROR_HEADER, "ca-unavailable");
        resp.headers.append("Connection", "close");
        let _ = write_response(&mut client, &resp, &body).await;
        return None;
    }

    let config = match ctx.ca.server_config(&host) {
        Ok(config) => config,
        Err(e) => {
            warn!(host = %host, error = %e, "Could not build TLS config");
            return None;
        }
    };

    let established = ResponseHeader::new(200, "Connection Established");
    if write_response(&mut client, &established, &Body::empty()).await.is_err() {
        return None;
    }
    if !client.buffer().is_empty() {
        debug!(peer = %peer, "Client sent data before the tunnel was established, discarding");
    }

    let acceptor = TlsAcceptor::from(config);
    let handshake = tokio::time::timeout(ctx.handshake_timeout, acceptor.accept(client.into_inner())).await;
    let tls = match handshake {
        Ok(Ok(tls)) => tls,
        Ok(Err(e)) => {
            handshake_failed(ctx, &host, peer, e.to_string());
            return None;
        }
        Err(_) => {
            handshake_failed(ctx, &host, peer, "handshake timed out".into());
            return None;
        }
    };
    info!(peer = %peer, host = %host, port = target.port, "TLS tunnel established");

    let stream: BoxedStream = Box::new(tls);
    Some((BufReader::new(stream), TargetContext::tunnel(&host, target.port)))
}

fn handshake_failed(ctx: &ConnectionContext, host: &str, peer: SocketAddr, reason: String) {
    let err = TlsError::ClientHandshake {
        host: host.to_string(),
        reason: reason.clone(),
    };
    warn!(peer = %peer, error = %err, "Client TLS handshake failed");
    ctx.events.publish(CoreEvent::TlsHandshakeFailed {
        host: host.to_string(),
        peer,
        reason,
    });
}

fn protocol_status(err: &ProtocolError) -> (u16, &'static str) {
    match err {
        ProtocolError::HeaderTooLarge { .. } => (431, "Request Header Fields Too Large"),
        ProtocolError::BodyTooLarge { .. } => (413, "Content Too Large"),
        ProtocolError::UnsupportedTransferCoding(_) => (501, "Not Implemented"),
        _ => (400, "Bad Request"),
    }
}

async fn write_response(client: &mut BufferedStream, header: &ResponseHeader, body: &Body) -> std::io::Result<()> {
    let mut bytes = header.to_bytes();
    body.write_to(&mut bytes);
    let stream = client.get_mut();
    stream.write_all(&bytes).await?;
    stream.flush().await
}
