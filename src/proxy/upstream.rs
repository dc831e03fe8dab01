//! Connections from the proxy to origin servers

use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::{ClientConfig, DigitallySignedStruct, RootCertStore, SignatureScheme};
use rustls_pki_types::{CertificateDer, ServerName, UnixTime};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tokio_rustls::TlsConnector;
use tracing::{debug, trace};

use crate::error::{ProtocolError, TlsError, UpstreamError};
use crate::http::{format_authority, Body, MessageReader, RequestHeader, ResponseHeader, Scheme, Target};

/// Any bidirectional byte stream: plain TCP or TLS on either leg
pub trait AsyncStream: AsyncRead + AsyncWrite + Unpin + Send {}

impl<T: AsyncRead + AsyncWrite + Unpin + Send> AsyncStream for T {}

pub type BoxedStream = Box<dyn AsyncStream>;

#[derive(Debug, Clone)]
pub struct UpstreamSettings {
    pub connect_timeout: Duration,
    /// Bound on waiting for a complete response
    pub read_timeout: Duration,
    /// Accept any upstream certificate
    pub trust_all_certs: bool,
    /// `host:port` to `ip:port` overrides applied before DNS
    pub resolve_overrides: HashMap<String, String>,
}

impl Default for UpstreamSettings {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(10),
            read_timeout: Duration::from_secs(60),
            trust_all_certs: false,
            resolve_overrides: HashMap::new(),
        }
    }
}

/// Opens plain and TLS connections to origin servers
pub struct UpstreamConnector {
    settings: UpstreamSettings,
    tls: TlsConnector,
}

impl UpstreamConnector {
    pub fn new(settings: UpstreamSettings) -> Result<Self, TlsError> {
        let builder = ClientConfig::builder_with_provider(Arc::new(rustls::crypto::ring::default_provider()))
            .with_safe_default_protocol_versions()
            .map_err(|e| TlsError::Config(e.to_string()))?;

        let mut config = if settings.trust_all_certs {
            builder
                .dangerous()
                .with_custom_certificate_verifier(Arc::new(TrustAllVerifier))
                .with_no_client_auth()
        } else {
            let roots = RootCertStore::from_iter(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
            builder.with_root_certificates(roots).with_no_client_auth()
        };
        config.alpn_protocols = vec![b"http/1.1".to_vec()];

        Ok(Self {
            settings,
            tls: TlsConnector::from(Arc::new(config)),
        })
    }

    pub fn read_timeout(&self) -> Duration {
        self.settings.read_timeout
    }

    pub async fn connect(&self, target: &Target) -> Result<BoxedStream, UpstreamError> {
        let authority = format_authority(&target.host, target.port);
        let addr = self
            .settings
            .resolve_overrides
            .get(&authority)
            .cloned()
            .unwrap_or_else(|| authority.clone());

        trace!(target = %authority, addr = %addr, "Connecting upstream");
        let tcp = tokio::time::timeout(self.settings.connect_timeout, TcpStream::connect(&addr))
            .await
            .map_err(|_| UpstreamError::Timeout {
                target: authority.clone(),
                timeout_ms: self.settings.connect_timeout.as_millis() as u64,
            })?
            .map_err(|e| UpstreamError::Connect {
                target: authority.clone(),
                reason: e.to_string(),
            })?;
        let _ = tcp.set_nodelay(true);

        if target.scheme == Scheme::Http {
            return Ok(Box::new(tcp));
        }

        let server_name = ServerName::try_from(target.host.clone())
            .map_err(|_| TlsError::InvalidServerName(target.host.clone()))?;
        let tls = tokio::time::timeout(self.settings.connect_timeout, self.tls.connect(server_name, tcp))
            .await
            .map_err(|_| UpstreamError::Timeout {
                target: authority.clone(),
                timeout_ms: self.settings.connect_timeout.as_millis() as u64,
            })?
            .map_err(|e| TlsError::UpstreamHandshake {
                host: target.host.clone(),
                reason: e.to_string(),
            })?;
        debug!(target = %authority, "Upstream TLS established");
        Ok(Box::new(tls))
    }
}

impl std::fmt::Debug for UpstreamConnector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UpstreamConnector").field("settings", &self.settings).finish()
    }
}

type PoolKey = (Scheme, String, u16);

/// Upstream connections owned by one client connection, at most one per
/// (scheme, host, port). Never shared across client connections.
pub struct UpstreamPool {
    connector: Arc<UpstreamConnector>,
    reader: MessageReader,
    conns: HashMap<PoolKey, BufReader<BoxedStream>>,
}

impl UpstreamPool {
    pub fn new(connector: Arc<UpstreamConnector>, reader: MessageReader) -> Self {
        Self {
            connector,
            reader,
            conns: HashMap::new(),
        }
    }

    /// Send one request and read its response. A reused connection that
    /// turns out to be stale is retried once on a fresh connection.
    pub async fn send(&mut self, header: &RequestHeader, body: &Body) -> Result<(ResponseHeader, Body), UpstreamError> {
        let target = header.resolved();
        let key: PoolKey = (target.scheme, target.host.clone(), target.port);
        let upstream_header = header.for_upstream();

        let mut bytes = upstream_header.to_bytes();
        body.write_to(&mut bytes);

        let timeout = self.connector.read_timeout();
        if let Some(conn) = self.conns.remove(&key) {
            match Self::round_trip(self.reader, timeout, conn, &bytes, &header.method, &target).await {
                Ok((conn, header_out, body_out)) => {
                    self.keep(key, conn, header, &header_out, &body_out);
                    return Ok((header_out, body_out));
                }
                Err(e) if is_stale(&e) => {
                    debug!(host = %target.host, error = %e, "Reused upstream connection was stale, retrying");
                }
                Err(e) => return Err(e),
            }
        }

        let conn = BufReader::new(self.connector.connect(&target).await?);
        let (conn, header_out, body_out) =
            Self::round_trip(self.reader, timeout, conn, &bytes, &header.method, &target).await?;
        self.keep(key, conn, header, &header_out, &body_out);
        Ok((header_out, body_out))
    }

    /// Write the request and read the response. Free of `&self`: the pool
    /// holds streams that are not `Sync`.
    async fn round_trip(
        reader: MessageReader,
        timeout: Duration,
        mut conn: BufReader<BoxedStream>,
        bytes: &[u8],
        method: &str,
        target: &Target,
    ) -> Result<(BufReader<BoxedStream>, ResponseHeader, Body), UpstreamError> {
        conn.get_mut().write_all(bytes).await?;
        conn.get_mut().flush().await?;

        let (header, body) = tokio::time::timeout(timeout, reader.read_response(&mut conn, method))
            .await
            .map_err(|_| UpstreamError::Timeout {
                target: target.authority(),
                timeout_ms: timeout.as_millis() as u64,
            })??;
        Ok((conn, header, body))
    }

    fn keep(
        &mut self,
        key: PoolKey,
        conn: BufReader<BoxedStream>,
        request: &RequestHeader,
        response: &ResponseHeader,
        body: &Body,
    ) {
        let switching = response.status == 101;
        if switching || (request.wants_keep_alive() && response.wants_keep_alive() && !body.is_until_close()) {
            self.conns.insert(key, conn);
        }
    }

    /// Remove the connection to `target`, e.g. to hand it to an upgrade relay
    pub fn take(&mut self, target: &Target) -> Option<BufReader<BoxedStream>> {
        self.conns.remove(&(target.scheme, target.host.clone(), target.port))
    }

    pub fn len(&self) -> usize {
        self.conns.len()
    }

    pub fn is_empty(&self) -> bool {
        self.conns.is_empty()
    }
}

fn is_stale(err: &UpstreamError) -> bool {
    matches!(
        err,
        UpstreamError::Io(_) | UpstreamError::Protocol(ProtocolError::UnexpectedEof) | UpstreamError::Protocol(ProtocolError::Io(_))
    )
}

/// Accepts every upstream certificate. Only used when explicitly configured.
#[derive(Debug)]
struct TrustAllVerifier;

impl ServerCertVerifier for TrustAllVerifier {
    fn verify_server_cert(
        &self,
        _end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: UnixTime,
    ) -> Result<ServerCertVerified, rustls::Error> {
        Ok(ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        Ok(HandshakeSignatureValid::assertion())
    }

    fn verify_tls13_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        Ok(HandshakeSignatureValid::assertion())
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        rustls::crypto::ring::default_provider()
            .signature_verification_algorithms
            .supported_schemes()
    }
}
