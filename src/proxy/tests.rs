//! End-to-end proxy tests over real sockets on 127.0.0.1

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio_rustls::{TlsAcceptor, TlsConnector};

use super::*;
use crate::app::events::{CoreEvent, EventBus};
use crate::error::ListenerError;
use crate::http::{synthetic_response, HttpMessage, MessageReader};
use crate::scanner::alerts::AlertStore;
use crate::scanner::passive::{PassiveScanDispatcher, PassiveSettings};

struct TestProxy {
    server: ProxyServer,
    addr: SocketAddr,
    history: Arc<HistoryStore>,
    listeners: Arc<ListenerChain>,
    events: EventBus,
}

async fn start_proxy(ca: CertificateAuthority, upstream: UpstreamSettings) -> TestProxy {
    let events = EventBus::default();
    let alerts = Arc::new(AlertStore::new(events.clone()));
    let passive = Arc::new(PassiveScanDispatcher::start(
        PassiveSettings::default(),
        alerts,
        events.clone(),
    ));
    let history = Arc::new(HistoryStore::new(DEFAULT_MAX_HISTORY_ITEMS));
    let listeners = Arc::new(ListenerChain::new());
    let connector = Arc::new(UpstreamConnector::new(upstream).unwrap());
    let exchanger = Arc::new(Exchanger::new(
        Arc::clone(&listeners),
        Arc::clone(&history),
        passive,
        connector,
        MessageReader::default(),
        events.clone(),
    ));
    let ctx = Arc::new(ConnectionContext {
        exchanger,
        ca: Arc::new(ca),
        relay: Arc::new(CopyRelay),
        events: events.clone(),
        idle_timeout: Duration::from_secs(5),
        handshake_timeout: Duration::from_secs(5),
    });

    let server = ProxyServer::new("127.0.0.1:0".parse().unwrap(), ctx, events.clone());
    let addr = server.start().await.unwrap();
    TestProxy {
        server,
        addr,
        history,
        listeners,
        events,
    }
}

/// TLS origin for `example.com` using a leaf from its own, unrelated CA
async fn tls_origin(response: &'static [u8]) -> SocketAddr {
    let origin_ca = Arc::new(CertificateAuthority::new(CaSettings::default()));
    let acceptor = TlsAcceptor::from(origin_ca.server_config("example.com").unwrap());
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    tokio::spawn(async move {
        let (socket, _) = listener.accept().await.unwrap();
        let mut tls = acceptor.accept(socket).await.unwrap();
        read_head(&mut tls).await;
        tls.write_all(response).await.unwrap();
        tls.shutdown().await.unwrap();
    });
    addr
}

/// Plain origin answering each request on a single accepted socket
async fn plain_origin(responses: Vec<&'static [u8]>) -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        let (mut socket, _) = listener.accept().await.unwrap();
        for response in responses {
            read_head(&mut socket).await;
            socket.write_all(response).await.unwrap();
        }
    });
    addr
}

/// Read byte by byte up to the blank line so nothing past it is consumed
async fn read_head<R: AsyncRead + Unpin>(stream: &mut R) -> String {
    let mut head = Vec::new();
    let mut byte = [0u8; 1];
    while !head.ends_with(b"\r\n\r\n") {
        if stream.read(&mut byte).await.unwrap() == 0 {
            break;
        }
        head.push(byte[0]);
    }
    String::from_utf8(head).unwrap()
}

async fn read_all<R: AsyncRead + Unpin>(stream: &mut R) -> String {
    let mut out = Vec::new();
    let mut buf = [0u8; 4096];
    loop {
        match stream.read(&mut buf).await {
            Ok(0) | Err(_) => break,
            Ok(n) => out.extend_from_slice(&buf[..n]),
        }
    }
    String::from_utf8_lossy(&out).into_owned()
}

fn client_tls(ca: &CertificateAuthority) -> TlsConnector {
    let mut roots = rustls::RootCertStore::empty();
    roots.add(ca.root_cert_der().unwrap()).unwrap();
    let config = rustls::ClientConfig::builder_with_provider(Arc::new(rustls::crypto::ring::default_provider()))
        .with_safe_default_protocol_versions()
        .unwrap()
        .with_root_certificates(roots)
        .with_no_client_auth();
    TlsConnector::from(Arc::new(config))
}

#[tokio::test]
async fn test_connect_tunnel_end_to_end() {
    let origin = tls_origin(b"HTTP/1.1 200 OK\r\nContent-Length: 5\r\nX-Origin: yes\r\n\r\nhello").await;

    let proxy_ca = CertificateAuthority::new(CaSettings::default());
    let connector = client_tls(&proxy_ca);
    let upstream = UpstreamSettings {
        trust_all_certs: true,
        resolve_overrides: HashMap::from([("example.com:443".to_string(), origin.to_string())]),
        ..UpstreamSettings::default()
    };
    let proxy = start_proxy(proxy_ca, upstream).await;

    let mut client = TcpStream::connect(proxy.addr).await.unwrap();
    client
        .write_all(b"CONNECT example.com:443 HTTP/1.1\r\nHost: example.com:443\r\n\r\n")
        .await
        .unwrap();
    let head = read_head(&mut client).await;
    assert!(head.starts_with("HTTP/1.1 200"), "{}", head);

    // Verifies the leaf against the proxy root
    let server_name = rustls_pki_types::ServerName::try_from("example.com").unwrap();
    let mut tls = connector.connect(server_name, client).await.unwrap();
    tls.write_all(b"GET /hello HTTP/1.1\r\nHost: example.com\r\nConnection: close\r\n\r\n")
        .await
        .unwrap();
    let response = read_all(&mut tls).await;
    assert!(response.starts_with("HTTP/1.1 200 OK"), "{}", response);
    assert!(response.contains("X-Origin: yes"));
    assert!(response.ends_with("hello"));

    assert_eq!(proxy.history.len(), 1);
    let record = proxy.history.get(1).unwrap();
    assert_eq!(record.message.url(), "https://example.com/hello");
    assert_eq!(record.message.status(), Some(200));

    proxy.server.stop().await;
}

#[tokio::test]
async fn test_unreachable_origin_gets_502() {
    let closed = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let dead = closed.local_addr().unwrap();
    drop(closed);

    let proxy = start_proxy(CertificateAuthority::new(CaSettings::default()), UpstreamSettings::default()).await;
    let mut client = TcpStream::connect(proxy.addr).await.unwrap();
    let request = format!(
        "GET http://{}/ HTTP/1.1\r\nHost: {}\r\nConnection: close\r\n\r\n",
        dead, dead
    );
    client.write_all(request.as_bytes()).await.unwrap();

    let response = read_all(&mut client).await;
    assert!(response.starts_with("HTTP/1.1 502"), "{}", response);
    assert!(proxy.history.is_empty());
}

#[tokio::test]
async fn test_connect_without_ca_is_refused() {
    let proxy = start_proxy(CertificateAuthority::unavailable("no keystore"), UpstreamSettings::default()).await;
    let mut events = proxy.events.subscribe();

    let mut client = TcpStream::connect(proxy.addr).await.unwrap();
    client
        .write_all(b"CONNECT example.com:443 HTTP/1.1\r\nHost: example.com:443\r\n\r\n")
        .await
        .unwrap();
    let response = read_all(&mut client).await;
    assert!(response.starts_with("HTTP/1.1 503"), "{}", response);
    assert!(response.contains(&format!("{}: ca-unavailable", CA_ERROR_HEADER)));

    let event = tokio::time::timeout(Duration::from_secs(2), async {
        loop {
            if let Ok(CoreEvent::CaUnavailable { host, .. }) = events.recv().await {
                return host;
            }
        }
    })
    .await
    .unwrap();
    assert_eq!(event, "example.com");
}

struct Blocker;

impl ProxyListener for Blocker {
    fn name(&self) -> &str {
        "blocker"
    }

    fn before_send(&self, message: &mut HttpMessage) -> Result<BeforeSendAction, ListenerError> {
        if message.url().contains("/blocked") {
            let (header, body) = synthetic_response(403, "Forbidden", "blocked by listener");
            return Ok(BeforeSendAction::DropWithResponse(header, body));
        }
        Ok(BeforeSendAction::Continue)
    }
}

#[tokio::test]
async fn test_listener_response_skips_origin_and_is_recorded() {
    let proxy = start_proxy(CertificateAuthority::new(CaSettings::default()), UpstreamSettings::default()).await;
    proxy.listeners.register(10, Arc::new(Blocker));

    // Nothing listens on this host; the listener must answer first
    let mut client = TcpStream::connect(proxy.addr).await.unwrap();
    client
        .write_all(b"GET http://blocked.invalid/blocked HTTP/1.1\r\nHost: blocked.invalid\r\nConnection: close\r\n\r\n")
        .await
        .unwrap();
    let response = read_all(&mut client).await;
    assert!(response.starts_with("HTTP/1.1 403"), "{}", response);
    assert!(response.ends_with("blocked by listener"));
    assert_eq!(proxy.history.len(), 1);
}

#[tokio::test]
async fn test_plain_request_keeps_client_connection_open() {
    let origin = plain_origin(vec![
        b"HTTP/1.1 200 OK\r\nContent-Length: 2\r\n\r\nok",
        b"HTTP/1.1 200 OK\r\nContent-Length: 4\r\nConnection: close\r\n\r\nbye!",
    ])
    .await;
    let proxy = start_proxy(CertificateAuthority::new(CaSettings::default()), UpstreamSettings::default()).await;

    let mut client = TcpStream::connect(proxy.addr).await.unwrap();
    let request = format!("GET http://{}/a HTTP/1.1\r\nHost: {}\r\n\r\n", origin, origin);
    client.write_all(request.as_bytes()).await.unwrap();
    let head = read_head(&mut client).await;
    assert!(head.starts_with("HTTP/1.1 200"));
    let mut body = [0u8; 2];
    client.read_exact(&mut body).await.unwrap();
    assert_eq!(&body, b"ok");

    // Same client connection and the pooled upstream serve a second request
    let request = format!(
        "GET http://{}/b HTTP/1.1\r\nHost: {}\r\nConnection: close\r\n\r\n",
        origin, origin
    );
    client.write_all(request.as_bytes()).await.unwrap();
    let response = read_all(&mut client).await;
    assert!(response.starts_with("HTTP/1.1 200"), "{}", response);
    assert!(response.ends_with("bye!"));
    assert_eq!(proxy.history.len(), 2);
}

#[tokio::test]
async fn test_interim_continue_is_not_the_final_response() {
    let origin = plain_origin(vec![
        b"HTTP/1.1 100 Continue\r\n\r\nHTTP/1.1 200 OK\r\nContent-Length: 2\r\n\r\nok",
        b"HTTP/1.1 200 OK\r\nContent-Length: 4\r\nConnection: close\r\n\r\nbye!",
    ])
    .await;
    let proxy = start_proxy(CertificateAuthority::new(CaSettings::default()), UpstreamSettings::default()).await;

    let mut client = TcpStream::connect(proxy.addr).await.unwrap();
    let request = format!(
        "POST http://{}/upload HTTP/1.1\r\nHost: {}\r\nExpect: 100-continue\r\nContent-Length: 2\r\n\r\nhi",
        origin, origin
    );
    client.write_all(request.as_bytes()).await.unwrap();
    let head = read_head(&mut client).await;
    assert!(head.starts_with("HTTP/1.1 200"), "{}", head);
    let mut body = [0u8; 2];
    client.read_exact(&mut body).await.unwrap();
    assert_eq!(&body, b"ok");

    // The pooled upstream must not still hold the final response of the first request
    let request = format!(
        "GET http://{}/next HTTP/1.1\r\nHost: {}\r\nConnection: close\r\n\r\n",
        origin, origin
    );
    client.write_all(request.as_bytes()).await.unwrap();
    let response = read_all(&mut client).await;
    assert!(response.ends_with("bye!"), "{}", response);

    assert_eq!(proxy.history.get(1).unwrap().message.status(), Some(200));
    assert_eq!(proxy.history.get(2).unwrap().message.status(), Some(200));
}

#[tokio::test]
async fn test_client_handshake_failure_only_closes_that_connection() {
    let proxy = start_proxy(CertificateAuthority::new(CaSettings::default()), UpstreamSettings::default()).await;
    let mut events = proxy.events.subscribe();

    // This client trusts some other root, so it rejects the minted leaf
    let stranger = client_tls(&CertificateAuthority::new(CaSettings::default()));
    let mut client = TcpStream::connect(proxy.addr).await.unwrap();
    client
        .write_all(b"CONNECT example.com:443 HTTP/1.1\r\nHost: example.com:443\r\n\r\n")
        .await
        .unwrap();
    let head = read_head(&mut client).await;
    assert!(head.starts_with("HTTP/1.1 200"), "{}", head);
    let server_name = rustls_pki_types::ServerName::try_from("example.com").unwrap();
    assert!(stranger.connect(server_name, client).await.is_err());

    let host = tokio::time::timeout(Duration::from_secs(2), async {
        loop {
            if let Ok(CoreEvent::TlsHandshakeFailed { host, .. }) = events.recv().await {
                return host;
            }
        }
    })
    .await
    .unwrap();
    assert_eq!(host, "example.com");

    let origin = plain_origin(vec![b"HTTP/1.1 200 OK\r\nContent-Length: 2\r\nConnection: close\r\n\r\nup"]).await;
    let mut client = TcpStream::connect(proxy.addr).await.unwrap();
    let request = format!(
        "GET http://{}/ HTTP/1.1\r\nHost: {}\r\nConnection: close\r\n\r\n",
        origin, origin
    );
    client.write_all(request.as_bytes()).await.unwrap();
    let response = read_all(&mut client).await;
    assert!(response.starts_with("HTTP/1.1 200"), "{}", response);
    assert!(response.ends_with("up"));
    assert!(proxy.server.is_running());
}

#[tokio::test]
async fn test_switching_protocols_hands_off_to_relay() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let origin = listener.local_addr().unwrap();
    tokio::spawn(async move {
        let (mut socket, _) = listener.accept().await.unwrap();
        read_head(&mut socket).await;
        socket
            .write_all(b"HTTP/1.1 101 Switching Protocols\r\nConnection: Upgrade\r\nUpgrade: echo\r\n\r\n")
            .await
            .unwrap();
        let mut buf = [0u8; 1024];
        loop {
            match socket.read(&mut buf).await {
                Ok(0) | Err(_) => break,
                Ok(n) => {
                    if socket.write_all(&buf[..n]).await.is_err() {
                        break;
                    }
                }
            }
        }
    });
    let proxy = start_proxy(CertificateAuthority::new(CaSettings::default()), UpstreamSettings::default()).await;

    let mut client = TcpStream::connect(proxy.addr).await.unwrap();
    let request = format!(
        "GET http://{}/socket HTTP/1.1\r\nHost: {}\r\nConnection: Upgrade\r\nUpgrade: echo\r\n\r\n",
        origin, origin
    );
    client.write_all(request.as_bytes()).await.unwrap();
    let head = read_head(&mut client).await;
    assert!(head.starts_with("HTTP/1.1 101"), "{}", head);

    client.write_all(b"ping").await.unwrap();
    let mut echoed = [0u8; 4];
    tokio::time::timeout(Duration::from_secs(2), client.read_exact(&mut echoed))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(&echoed, b"ping");
    assert_eq!(proxy.history.get(1).unwrap().message.status(), Some(101));
}

#[tokio::test]
async fn test_refused_upgrade_keeps_connection_alive() {
    let origin = plain_origin(vec![
        b"HTTP/1.1 200 OK\r\nContent-Length: 5\r\n\r\nplain",
        b"HTTP/1.1 200 OK\r\nContent-Length: 4\r\nConnection: close\r\n\r\nbye!",
    ])
    .await;
    let proxy = start_proxy(CertificateAuthority::new(CaSettings::default()), UpstreamSettings::default()).await;

    let mut client = TcpStream::connect(proxy.addr).await.unwrap();
    let request = format!(
        "GET http://{}/socket HTTP/1.1\r\nHost: {}\r\nConnection: Upgrade\r\nUpgrade: echo\r\n\r\n",
        origin, origin
    );
    client.write_all(request.as_bytes()).await.unwrap();
    let head = read_head(&mut client).await;
    assert!(head.starts_with("HTTP/1.1 200"), "{}", head);
    let mut body = [0u8; 5];
    client.read_exact(&mut body).await.unwrap();
    assert_eq!(&body, b"plain");

    let request = format!(
        "GET http://{}/after HTTP/1.1\r\nHost: {}\r\nConnection: close\r\n\r\n",
        origin, origin
    );
    client.write_all(request.as_bytes()).await.unwrap();
    let response = read_all(&mut client).await;
    assert!(response.starts_with("HTTP/1.1 200"), "{}", response);
    assert!(response.ends_with("bye!"));
    assert_eq!(proxy.history.len(), 2);
}

#[tokio::test]
async fn test_stop_closes_listener_promptly() {
    let proxy = start_proxy(CertificateAuthority::new(CaSettings::default()), UpstreamSettings::default()).await;
    assert!(proxy.server.is_running());

    tokio::time::timeout(Duration::from_secs(2), proxy.server.stop())
        .await
        .unwrap();
    assert!(!proxy.server.is_running());
    assert!(proxy.server.local_addr().is_none());
    assert!(TcpStream::connect(proxy.addr).await.is_err());
}
