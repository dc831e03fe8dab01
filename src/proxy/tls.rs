//! Certificate authority for HTTPS interception
//!
//! Owns the root key pair and mints a short-lived leaf certificate per
//! hostname. Leaves are cached (LRU, capacity bounded) and never served
//! past their `not_after`. Minting for one host is serialized through a
//! per-host slot so different hosts mint in parallel.

use parking_lot::{Mutex, RwLock};
use rcgen::{
    BasicConstraints, Certificate, CertificateParams, DistinguishedName, DnType, ExtendedKeyUsagePurpose, IsCa,
    KeyPair, KeyUsagePurpose, SanType,
};
use rustls::server::{ClientHello, ResolvesServerCert};
use rustls::sign::CertifiedKey;
use rustls::ServerConfig;
use rustls_pki_types::pem::PemObject;
use rustls_pki_types::{CertificateDer, PrivateKeyDer, PrivatePkcs8KeyDer};
use std::collections::{HashMap, VecDeque};
use std::fs;
use std::net::IpAddr;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use time::{Duration, OffsetDateTime};
use tracing::{debug, info, warn};

use crate::error::{CaError, TlsError};

pub const DEFAULT_LEAF_VALIDITY_DAYS: u32 = 7;
pub const DEFAULT_LEAF_CACHE_CAPACITY: usize = 1000;
const ROOT_VALIDITY_DAYS: i64 = 3650;
/// Leaves this close to expiry are re-minted instead of served
const EXPIRY_MARGIN: Duration = Duration::hours(1);

/// Where root material comes from and how leaves are minted
#[derive(Debug, Clone)]
pub struct CaSettings {
    /// PEM file holding the root certificate and its PKCS#8 key.
    /// `None` keeps a generated root in memory only.
    pub keystore_path: Option<PathBuf>,
    /// Write a freshly generated root to `keystore_path` if it is missing
    pub generate_if_missing: bool,
    pub leaf_validity_days: u32,
    pub cache_capacity: usize,
}

impl Default for CaSettings {
    fn default() -> Self {
        Self {
            keystore_path: None,
            generate_if_missing: true,
            leaf_validity_days: DEFAULT_LEAF_VALIDITY_DAYS,
            cache_capacity: DEFAULT_LEAF_CACHE_CAPACITY,
        }
    }
}

struct RootMaterial {
    cert: Certificate,
    key: KeyPair,
    /// Root certificate as the client should install it
    pem: String,
    der: CertificateDer<'static>,
}

/// A minted leaf certificate. Never mutated; replaced by eviction.
pub struct LeafCertificate {
    pub host: String,
    pub cert_der: CertificateDer<'static>,
    pub cert_pem: String,
    pub key_pem: String,
    pub not_after: OffsetDateTime,
    certified_key: Arc<CertifiedKey>,
}

impl LeafCertificate {
    pub fn certified_key(&self) -> Arc<CertifiedKey> {
        Arc::clone(&self.certified_key)
    }

    fn is_fresh(&self, now: OffsetDateTime) -> bool {
        self.not_after - EXPIRY_MARGIN > now
    }
}

impl std::fmt::Debug for LeafCertificate {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LeafCertificate")
            .field("host", &self.host)
            .field("not_after", &self.not_after)
            .finish()
    }
}

struct LeafCache {
    entries: HashMap<String, Arc<LeafCertificate>>,
    lru: VecDeque<String>,
}

impl LeafCache {
    fn touch(&mut self, host: &str) {
        if let Some(pos) = self.lru.iter().position(|h| h == host) {
            self.lru.remove(pos);
        }
        self.lru.push_back(host.to_string());
    }

    fn remove(&mut self, host: &str) {
        self.entries.remove(host);
        if let Some(pos) = self.lru.iter().position(|h| h == host) {
            self.lru.remove(pos);
        }
    }
}

/// Cache counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CaStats {
    pub cached: usize,
    pub hits: u64,
    pub misses: u64,
    pub evictions: u64,
}

/// Certificate Authority for generating site certificates
pub struct CertificateAuthority {
    root: RwLock<Result<Arc<RootMaterial>, CaError>>,
    cache: Mutex<LeafCache>,
    slots: Mutex<HashMap<String, Arc<Mutex<()>>>>,
    settings: CaSettings,
    hits: AtomicU64,
    misses: AtomicU64,
    evictions: AtomicU64,
}

impl CertificateAuthority {
    /// Load or generate root material. Failures leave the authority in the
    /// unavailable state instead of erroring; see [`Self::availability`].
    pub fn new(settings: CaSettings) -> Self {
        let root = match &settings.keystore_path {
            None => generate_root().map(Arc::new),
            Some(path) if path.exists() => load_keystore(path).map(Arc::new),
            Some(path) if settings.generate_if_missing => generate_root().map(|root| {
                if let Err(e) = write_keystore(path, &root) {
                    warn!(path = %path.display(), error = %e, "Could not persist generated CA, keeping it in memory");
                } else {
                    info!(path = %path.display(), "Generated new CA keystore");
                }
                Arc::new(root)
            }),
            Some(path) => Err(CaError::Keystore {
                path: path.display().to_string(),
                reason: "file does not exist".into(),
            }),
        };
        let root = root.map_err(|e| CaError::Unavailable(e.to_string()));
        if let Err(e) = &root {
            warn!(error = %e, "HTTPS interception disabled");
        }
        Self::with_root(root, settings)
    }

    /// An authority that refuses every request
    pub fn unavailable(reason: impl Into<String>) -> Self {
        Self::with_root(Err(CaError::Unavailable(reason.into())), CaSettings::default())
    }

    fn with_root(root: Result<Arc<RootMaterial>, CaError>, settings: CaSettings) -> Self {
        Self {
            root: RwLock::new(root),
            cache: Mutex::new(LeafCache {
                entries: HashMap::new(),
                lru: VecDeque::new(),
            }),
            slots: Mutex::new(HashMap::new()),
            settings,
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            evictions: AtomicU64::new(0),
        }
    }

    pub fn availability(&self) -> Result<(), CaError> {
        self.root.read().as_ref().map(|_| ()).map_err(Clone::clone)
    }

    pub fn is_available(&self) -> bool {
        self.root.read().is_ok()
    }

    /// Replace the root material from a keystore and drop every cached leaf.
    /// On failure the current root stays in place.
    pub fn reload(&self, path: &Path) -> Result<(), CaError> {
        let root = load_keystore(path)?;
        *self.root.write() = Ok(Arc::new(root));
        self.clear_cache();
        info!(path = %path.display(), "CA root reloaded");
        Ok(())
    }

    pub fn root_cert_pem(&self) -> Result<String, CaError> {
        Ok(self.root_material()?.pem.clone())
    }

    pub fn root_cert_der(&self) -> Result<CertificateDer<'static>, CaError> {
        Ok(self.root_material()?.der.clone())
    }

    /// Write the root certificate (no key) for installation in a trust store
    pub fn export_root(&self, path: &Path) -> Result<(), CaError> {
        let pem = self.root_cert_pem()?;
        fs::write(path, pem).map_err(|e| CaError::Keystore {
            path: path.display().to_string(),
            reason: e.to_string(),
        })
    }

    fn root_material(&self) -> Result<Arc<RootMaterial>, CaError> {
        self.root.read().clone()
    }

    /// Leaf certificate for `host`, minting it on a cache miss.
    ///
    /// Repeated calls return the same leaf until it is evicted or close to
    /// expiry.
    pub fn leaf_for(&self, host: &str) -> Result<Arc<LeafCertificate>, CaError> {
        let root = self.root_material()?;
        let host = normalize_host(host)?;

        if let Some(leaf) = self.cached(&host) {
            self.hits.fetch_add(1, Ordering::Relaxed);
            return Ok(leaf);
        }

        let slot = Arc::clone(self.slots.lock().entry(host.clone()).or_default());
        let _minting = slot.lock();

        // Another worker may have minted while we waited for the slot
        if let Some(leaf) = self.cached(&host) {
            self.hits.fetch_add(1, Ordering::Relaxed);
            return Ok(leaf);
        }

        self.misses.fetch_add(1, Ordering::Relaxed);
        let minted = mint_leaf(&root, &host, self.settings.leaf_validity_days);
        self.slots.lock().remove(&host);
        let leaf = Arc::new(minted?);
        debug!(host = %host, not_after = %leaf.not_after, "Minted leaf certificate");
        self.insert(host, Arc::clone(&leaf));
        Ok(leaf)
    }

    fn cached(&self, host: &str) -> Option<Arc<LeafCertificate>> {
        let mut cache = self.cache.lock();
        let leaf = cache.entries.get(host).cloned()?;
        if leaf.is_fresh(OffsetDateTime::now_utc()) {
            cache.touch(host);
            Some(leaf)
        } else {
            cache.remove(host);
            None
        }
    }

    fn insert(&self, host: String, leaf: Arc<LeafCertificate>) {
        let mut cache = self.cache.lock();
        cache.touch(&host);
        cache.entries.insert(host, leaf);
        while cache.entries.len() > self.settings.cache_capacity.max(1) {
            let Some(oldest) = cache.lru.pop_front() else { break };
            cache.entries.remove(&oldest);
            self.evictions.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn clear_cache(&self) {
        let mut cache = self.cache.lock();
        cache.entries.clear();
        cache.lru.clear();
    }

    pub fn stats(&self) -> CaStats {
        CaStats {
            cached: self.cache.lock().entries.len(),
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            evictions: self.evictions.load(Ordering::Relaxed),
        }
    }

    /// Server-side TLS configuration for one tunnel. The certificate is
    /// chosen from the client's SNI, falling back to the CONNECT host.
    pub fn server_config(self: &Arc<Self>, host_hint: &str) -> Result<Arc<ServerConfig>, TlsError> {
        let resolver = Arc::new(DynamicCertResolver {
            ca: Arc::clone(self),
            host_hint: Some(host_hint.to_string()),
        });
        let mut config = ServerConfig::builder_with_provider(Arc::new(rustls::crypto::ring::default_provider()))
            .with_safe_default_protocol_versions()
            .map_err(|e| TlsError::Config(e.to_string()))?
            .with_no_client_auth()
            .with_cert_resolver(resolver);
        // Only HTTP/1.1 is framed by the proxy
        config.alpn_protocols = vec![b"http/1.1".to_vec()];
        Ok(Arc::new(config))
    }
}

impl std::fmt::Debug for CertificateAuthority {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CertificateAuthority")
            .field("available", &self.is_available())
            .field("stats", &self.stats())
            .finish()
    }
}

/// Picks a leaf from SNI during the handshake
pub struct DynamicCertResolver {
    ca: Arc<CertificateAuthority>,
    host_hint: Option<String>,
}

impl ResolvesServerCert for DynamicCertResolver {
    fn resolve(&self, client_hello: ClientHello<'_>) -> Option<Arc<CertifiedKey>> {
        let host = client_hello
            .server_name()
            .map(|s| s.to_string())
            .or_else(|| self.host_hint.clone())?;

        match self.ca.leaf_for(&host) {
            Ok(leaf) => Some(leaf.certified_key()),
            Err(e) => {
                warn!(host = %host, error = %e, "No certificate for handshake");
                None
            }
        }
    }
}

impl std::fmt::Debug for DynamicCertResolver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DynamicCertResolver")
            .field("host_hint", &self.host_hint)
            .finish()
    }
}

fn ca_params() -> CertificateParams {
    let mut params = CertificateParams::default();
    params.is_ca = IsCa::Ca(BasicConstraints::Constrained(0));
    params.key_usages = vec![
        KeyUsagePurpose::DigitalSignature,
        KeyUsagePurpose::KeyCertSign,
        KeyUsagePurpose::CrlSign,
    ];

    let mut dn = DistinguishedName::new();
    dn.push(DnType::CommonName, "Tollgate Proxy CA");
    dn.push(DnType::OrganizationName, "Tollgate");
    params.distinguished_name = dn;

    let now = OffsetDateTime::now_utc();
    params.not_before = now - Duration::days(1);
    params.not_after = now + Duration::days(ROOT_VALIDITY_DAYS);
    params
}

fn generate_root() -> Result<RootMaterial, CaError> {
    let generation = |e: rcgen::Error| CaError::Generation {
        host: "root".into(),
        reason: e.to_string(),
    };
    let key = KeyPair::generate().map_err(generation)?;
    let cert = ca_params().self_signed(&key).map_err(generation)?;
    Ok(RootMaterial {
        pem: cert.pem(),
        der: cert.der().clone(),
        cert,
        key,
    })
}

fn load_keystore(path: &Path) -> Result<RootMaterial, CaError> {
    let keystore_err = |reason: String| CaError::Keystore {
        path: path.display().to_string(),
        reason,
    };
    let contents = fs::read_to_string(path).map_err(|e| keystore_err(e.to_string()))?;

    let cert_pem = pem_block(&contents, "CERTIFICATE").ok_or_else(|| keystore_err("no CERTIFICATE block".into()))?;
    let key_pem = pem_block(&contents, "PRIVATE KEY").ok_or_else(|| keystore_err("no PRIVATE KEY block".into()))?;

    let der = CertificateDer::from_pem_slice(cert_pem.as_bytes()).map_err(|e| keystore_err(e.to_string()))?;
    let key = KeyPair::from_pem(key_pem).map_err(|e| keystore_err(e.to_string()))?;
    let params = CertificateParams::from_ca_cert_pem(cert_pem).map_err(|e| keystore_err(e.to_string()))?;
    if !matches!(params.is_ca, IsCa::Ca(_)) {
        return Err(keystore_err("certificate is not a CA".into()));
    }
    // Re-signing with the same key and subject gives an issuer that chains
    // to the certificate on disk.
    let cert = params.self_signed(&key).map_err(|e| keystore_err(e.to_string()))?;

    Ok(RootMaterial {
        pem: cert_pem.to_string(),
        der,
        cert,
        key,
    })
}

fn write_keystore(path: &Path, root: &RootMaterial) -> std::io::Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    let mut contents = root.pem.clone();
    contents.push_str(&root.key.serialize_pem());
    fs::write(path, contents)
}

/// First `-----BEGIN <label>-----` block in `contents`, line ending included
fn pem_block<'a>(contents: &'a str, label: &str) -> Option<&'a str> {
    let begin = format!("-----BEGIN {}-----", label);
    let end = format!("-----END {}-----", label);
    let start = contents.find(&begin)?;
    let mut stop = contents[start..].find(&end)? + start + end.len();
    if contents[stop..].starts_with("\r\n") {
        stop += 2;
    } else if contents[stop..].starts_with('\n') {
        stop += 1;
    }
    Some(&contents[start..stop])
}

fn normalize_host(host: &str) -> Result<String, CaError> {
    let host = host.trim().trim_start_matches('[').trim_end_matches(']').to_lowercase();
    if host.is_empty() || host.contains('/') || host.contains(' ') {
        return Err(CaError::InvalidHostname(host));
    }
    Ok(host)
}

fn mint_leaf(root: &RootMaterial, host: &str, validity_days: u32) -> Result<LeafCertificate, CaError> {
    let generation = |e: rcgen::Error| CaError::Generation {
        host: host.to_string(),
        reason: e.to_string(),
    };

    let mut params = CertificateParams::default();
    let mut dn = DistinguishedName::new();
    dn.push(DnType::CommonName, host);
    params.distinguished_name = dn;

    params.subject_alt_names = match host.parse::<IpAddr>() {
        Ok(ip) => vec![SanType::IpAddress(ip)],
        Err(_) => vec![SanType::DnsName(
            host.try_into().map_err(|_| CaError::InvalidHostname(host.to_string()))?,
        )],
    };
    params.key_usages = vec![KeyUsagePurpose::DigitalSignature, KeyUsagePurpose::KeyEncipherment];
    params.extended_key_usages = vec![ExtendedKeyUsagePurpose::ServerAuth];
    params.use_authority_key_identifier_extension = true;

    let now = OffsetDateTime::now_utc();
    let not_after = now + Duration::days(i64::from(validity_days.max(1)));
    params.not_before = now - Duration::days(1);
    params.not_after = not_after;

    let key_pair = KeyPair::generate().map_err(generation)?;
    let cert = params.signed_by(&key_pair, &root.cert, &root.key).map_err(generation)?;

    let key_der = PrivateKeyDer::Pkcs8(PrivatePkcs8KeyDer::from(key_pair.serialize_der()));
    let signing_key = rustls::crypto::ring::sign::any_supported_type(&key_der).map_err(|e| CaError::Generation {
        host: host.to_string(),
        reason: e.to_string(),
    })?;
    let certified_key = Arc::new(CertifiedKey::new(vec![cert.der().clone()], signing_key));

    Ok(LeafCertificate {
        host: host.to_string(),
        cert_der: cert.der().clone(),
        cert_pem: cert.pem(),
        key_pem: key_pair.serialize_pem(),
        not_after,
        certified_key,
    })
}
