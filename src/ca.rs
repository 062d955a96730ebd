//! Root certificate authority and per-host leaf signing
//!
//! The root is loaded from PEM files or generated on first start. Leaves are
//! signed lazily for each intercepted hostname and cached; concurrent requests
//! for the same hostname share a single signing operation.
use crate::errors::{Error, Result};
use moka::future::Cache;
use rand::Rng;
use rcgen::{
  BasicConstraints, CertificateParams, DistinguishedName, DnType, ExtendedKeyUsagePurpose, IsCa,
  Issuer, KeyPair, KeyUsagePurpose, SanType,
};
use std::net::IpAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use time::OffsetDateTime;
use tokio::fs;
use tokio_rustls::rustls::pki_types::{CertificateDer, PrivateKeyDer};
use tokio_rustls::rustls::ServerConfig;

/// File name of the root certificate inside the storage directory
pub const CA_CERT_FILE: &str = "ca_cert.pem";
/// File name of the root private key inside the storage directory
pub const CA_KEY_FILE: &str = "ca_key.pem";
/// Default leaf validity (7 days)
pub const DEFAULT_LEAF_VALIDITY: std::time::Duration = std::time::Duration::from_secs(7 * 24 * 3600);
const ROOT_VALIDITY_DAYS: i64 = 3650;
/// Backdating of not_before to tolerate client clock skew
const NOT_BEFORE_OFFSET: time::Duration = time::Duration::seconds(60);
const MAX_CACHED_LEAVES: u64 = 10_000;

/// Operator root used to sign leaf certificates.
pub struct CertificateAuthority {
  issuer: Issuer<'static, KeyPair>,
  cert_der: CertificateDer<'static>,
  cert_pem: String,
  cert_path: Option<PathBuf>,
}

impl std::fmt::Debug for CertificateAuthority {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.debug_struct("CertificateAuthority")
      .field("cert_path", &self.cert_path)
      .finish_non_exhaustive()
  }
}

impl CertificateAuthority {
  /// Load `ca_cert.pem` / `ca_key.pem` from `storage`, generating and writing
  /// a new root if either is missing.
  pub async fn load_or_generate(storage: impl AsRef<Path>) -> Result<Self> {
    let storage = storage.as_ref();
    if !storage.exists() {
      fs::create_dir_all(storage).await?;
    }
    let cert_path = storage.join(CA_CERT_FILE);
    let key_path = storage.join(CA_KEY_FILE);
    if cert_path.exists() && key_path.exists() {
      return Self::from_pem_files(&cert_path, &key_path).await;
    }

    let (cert_pem, key_pem) = generate_root()?;
    fs::write(&cert_path, cert_pem.as_bytes()).await?;
    fs::write(&key_path, key_pem.as_bytes()).await?;
    #[cfg(unix)]
    {
      use std::os::unix::fs::PermissionsExt;
      fs::set_permissions(&key_path, std::fs::Permissions::from_mode(0o600)).await?;
    }
    tracing::info!("generated new root certificate at {}", cert_path.display());
    let mut ca = Self::from_pem(&cert_pem, &key_pem)?;
    ca.cert_path = Some(cert_path);
    Ok(ca)
  }

  /// Load an operator supplied root from explicit PEM files.
  pub async fn from_pem_files(cert: impl AsRef<Path>, key: impl AsRef<Path>) -> Result<Self> {
    let cert = cert.as_ref();
    let cert_pem = fs::read_to_string(cert)
      .await
      .map_err(|e| Error::config(format!("cannot read {}: {}", cert.display(), e)))?;
    let key_pem = fs::read_to_string(key.as_ref())
      .await
      .map_err(|e| Error::config(format!("cannot read {}: {}", key.as_ref().display(), e)))?;
    let mut ca = Self::from_pem(&cert_pem, &key_pem)?;
    ca.cert_path = Some(cert.to_path_buf());
    tracing::info!("loaded root certificate from {}", cert.display());
    Ok(ca)
  }

  /// Build from in-memory PEM text.
  pub fn from_pem(cert_pem: &str, key_pem: &str) -> Result<Self> {
    let key_pair = KeyPair::from_pem(key_pem)
      .map_err(|e| Error::config(format!("failed to parse root key: {}", e)))?;
    let issuer = Issuer::from_ca_cert_pem(cert_pem, key_pair)
      .map_err(|e| Error::config(format!("failed to parse root certificate: {}", e)))?;
    let cert_der = rustls_pemfile::certs(&mut cert_pem.as_bytes())
      .next()
      .ok_or_else(|| Error::config("no certificate found in root PEM"))?
      .map_err(|e| Error::config(format!("failed to decode root PEM: {}", e)))?;
    Ok(CertificateAuthority {
      issuer,
      cert_der,
      cert_pem: cert_pem.to_string(),
      cert_path: None,
    })
  }

  /// Generate a throwaway root that is never written to disk.
  pub fn ephemeral() -> Result<Self> {
    let (cert_pem, key_pem) = generate_root()?;
    Self::from_pem(&cert_pem, &key_pem)
  }

  /// Root certificate in PEM form, for installation into client trust stores.
  pub fn ca_cert_pem(&self) -> &str {
    &self.cert_pem
  }

  /// Where the root certificate lives on disk, if it came from disk.
  pub fn ca_cert_path(&self) -> Option<&Path> {
    self.cert_path.as_deref()
  }

  /// Root certificate in DER form.
  pub fn ca_cert_der(&self) -> &CertificateDer<'static> {
    &self.cert_der
  }

  /// Sign a leaf for `hostname`, valid from one minute ago for `validity`.
  pub fn sign(&self, hostname: &str, validity: std::time::Duration) -> Result<LeafCertificate> {
    let host = normalize_hostname(hostname)?;
    let mut params = CertificateParams::default();
    params.serial_number = Some(rand::thread_rng().gen::<u64>().into());
    let mut dn = DistinguishedName::new();
    dn.push(DnType::CommonName, host.as_str());
    params.distinguished_name = dn;
    params.subject_alt_names = match host.parse::<IpAddr>() {
      Ok(ip) => vec![SanType::IpAddress(ip)],
      Err(_) => vec![SanType::DnsName(host.as_str().try_into().map_err(|_| {
        Error::signing(format!("invalid hostname: {}", host))
      })?)],
    };
    params.key_usages = vec![
      KeyUsagePurpose::DigitalSignature,
      KeyUsagePurpose::KeyEncipherment,
    ];
    params.extended_key_usages = vec![ExtendedKeyUsagePurpose::ServerAuth];

    let validity = time::Duration::try_from(validity)
      .map_err(|e| Error::signing(format!("invalid leaf validity: {}", e)))?;
    let now = OffsetDateTime::now_utc();
    params.not_before = now - NOT_BEFORE_OFFSET;
    params.not_after = now + validity;

    let key_pair = KeyPair::generate()
      .map_err(|e| Error::signing(format!("failed to generate leaf key: {}", e)))?;
    let cert = params
      .signed_by(&key_pair, &self.issuer)
      .map_err(|e| Error::signing(format!("failed to sign leaf for {}: {}", host, e)))?;
    let key = PrivateKeyDer::try_from(key_pair.serialize_der())
      .map_err(|_| Error::signing("failed to serialize leaf key"))?;
    let chain = vec![
      CertificateDer::from(cert.der().to_vec()),
      self.cert_der.clone(),
    ];
    let server_config = leaf_server_config(chain.clone(), key.clone_key())?;
    tracing::debug!("signed leaf certificate for {}", host);
    Ok(LeafCertificate {
      hostname: host,
      chain,
      key,
      not_after: params.not_after,
      server_config,
    })
  }
}

fn generate_root() -> Result<(String, String)> {
  let mut params = CertificateParams::default();
  let mut dn = DistinguishedName::new();
  dn.push(DnType::CommonName, "tapwire Proxy CA");
  dn.push(DnType::OrganizationName, "tapwire");
  params.distinguished_name = dn;
  params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
  params.key_usages = vec![
    KeyUsagePurpose::KeyCertSign,
    KeyUsagePurpose::CrlSign,
    KeyUsagePurpose::DigitalSignature,
  ];
  let now = OffsetDateTime::now_utc();
  params.not_before = now - NOT_BEFORE_OFFSET;
  params.not_after = now + time::Duration::days(ROOT_VALIDITY_DAYS);

  let key_pair = KeyPair::generate()
    .map_err(|e| Error::signing(format!("failed to generate root key: {}", e)))?;
  let cert = params
    .self_signed(&key_pair)
    .map_err(|e| Error::signing(format!("failed to self-sign root: {}", e)))?;
  Ok((cert.pem(), key_pair.serialize_pem()))
}

fn leaf_server_config(
  chain: Vec<CertificateDer<'static>>,
  key: PrivateKeyDer<'static>,
) -> Result<Arc<ServerConfig>> {
  let mut config = ServerConfig::builder_with_provider(crate::tls::crypto_provider())
    .with_safe_default_protocol_versions()
    .map_err(|e| Error::signing(format!("invalid TLS versions: {}", e)))?
    .with_no_client_auth()
    .with_single_cert(chain, key)
    .map_err(|e| Error::signing(format!("failed to build TLS config: {}", e)))?;
  config.alpn_protocols = vec![b"http/1.1".to_vec()];
  Ok(Arc::new(config))
}

/// Lowercase `hostname`, strip IPv6 brackets and a trailing dot, and check
/// that it can name a certificate subject.
pub fn normalize_hostname(hostname: &str) -> Result<String> {
  let trimmed = hostname.trim();
  let unbracketed = trimmed
    .strip_prefix('[')
    .and_then(|h| h.strip_suffix(']'))
    .unwrap_or(trimmed);
  if let Ok(ip) = unbracketed.parse::<IpAddr>() {
    return Ok(ip.to_string());
  }
  let host = unbracketed.strip_suffix('.').unwrap_or(unbracketed).to_ascii_lowercase();
  if host.is_empty() {
    return Err(Error::signing("empty hostname"));
  }
  if host.len() > 253 {
    return Err(Error::signing(format!("hostname longer than 253 bytes: {}", host)));
  }
  for label in host.split('.') {
    if label.is_empty() || label.len() > 63 {
      return Err(Error::signing(format!("invalid label in hostname: {}", host)));
    }
    if label.starts_with('-')
      || !label
        .bytes()
        .all(|b| b.is_ascii_alphanumeric() || b == b'-' || b == b'_')
    {
      return Err(Error::signing(format!("illegal characters in hostname: {}", host)));
    }
  }
  Ok(host)
}

/// A signed leaf with the TLS server configuration that presents it.
#[derive(Debug)]
pub struct LeafCertificate {
  hostname: String,
  chain: Vec<CertificateDer<'static>>,
  key: PrivateKeyDer<'static>,
  not_after: OffsetDateTime,
  server_config: Arc<ServerConfig>,
}

impl LeafCertificate {
  /// Normalized hostname the leaf was issued for.
  pub fn hostname(&self) -> &str {
    &self.hostname
  }
  /// `[leaf, root]`
  pub fn chain(&self) -> &[CertificateDer<'static>] {
    &self.chain
  }
  /// Leaf private key.
  pub fn key(&self) -> &PrivateKeyDer<'static> {
    &self.key
  }
  /// End of validity.
  pub fn not_after(&self) -> OffsetDateTime {
    self.not_after
  }
  /// Whether the leaf is expired or about to expire.
  pub fn is_expired(&self) -> bool {
    OffsetDateTime::now_utc() + NOT_BEFORE_OFFSET >= self.not_after
  }
  /// Server configuration presenting this leaf with ALPN `http/1.1`.
  pub fn server_config(&self) -> Arc<ServerConfig> {
    self.server_config.clone()
  }
}

/// Signs leaves on demand and caches them per hostname.
#[derive(Clone)]
pub struct CertificateManager {
  ca: Arc<CertificateAuthority>,
  cache: Cache<String, Arc<LeafCertificate>>,
  leaf_validity: std::time::Duration,
}

impl std::fmt::Debug for CertificateManager {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.debug_struct("CertificateManager")
      .field("ca", &self.ca)
      .field("cached", &self.cache.entry_count())
      .field("leaf_validity", &self.leaf_validity)
      .finish()
  }
}

impl CertificateManager {
  /// Create a manager signing with `ca`.
  ///
  /// Cached leaves are evicted after half of `leaf_validity`.
  pub fn new(ca: CertificateAuthority, leaf_validity: std::time::Duration) -> Self {
    let cache = Cache::builder()
      .max_capacity(MAX_CACHED_LEAVES)
      .time_to_live(leaf_validity / 2)
      .build();
    CertificateManager {
      ca: Arc::new(ca),
      cache,
      leaf_validity,
    }
  }

  /// The signing root.
  pub fn authority(&self) -> &CertificateAuthority {
    &self.ca
  }

  /// Root certificate in PEM form.
  pub fn ca_cert_pem(&self) -> &str {
    self.ca.ca_cert_pem()
  }

  /// Root certificate path, if loaded from disk.
  pub fn ca_cert_path(&self) -> Option<&Path> {
    self.ca.ca_cert_path()
  }

  /// Get the cached leaf for `hostname` or sign a new one.
  ///
  /// Concurrent calls for the same uncached hostname run one signing
  /// operation and all receive the same leaf.
  pub async fn sign_leaf(&self, hostname: &str) -> Result<Arc<LeafCertificate>> {
    let host = normalize_hostname(hostname)?;
    if let Some(leaf) = self.cache.get(&host).await {
      if !leaf.is_expired() {
        return Ok(leaf);
      }
      tracing::debug!("cached leaf for {} expired", host);
      self.cache.invalidate(&host).await;
    }
    let ca = self.ca.clone();
    let validity = self.leaf_validity;
    let name = host.clone();
    self
      .cache
      .try_get_with(host, async move {
        tokio::task::spawn_blocking(move || ca.sign(&name, validity))
          .await
          .map_err(|e| Error::signing(format!("signing task failed: {}", e)))?
          .map(Arc::new)
      })
      .await
      .map_err(|err| match err.as_ref() {
        Error::Signing(msg) => Error::Signing(msg.clone()),
        other => Error::Signing(other.to_string()),
      })
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn hostnames_are_validated() {
    assert_eq!(normalize_hostname("WWW.Example.COM.").unwrap(), "www.example.com");
    assert_eq!(normalize_hostname("[::1]").unwrap(), "::1");
    assert!(normalize_hostname("").is_err());
    assert!(normalize_hostname("a..b").is_err());
    assert!(normalize_hostname("bad host").is_err());
    assert!(normalize_hostname(&"a".repeat(254)).is_err());
    assert!(normalize_hostname(&format!("{}.com", "a".repeat(64))).is_err());
  }

  #[tokio::test]
  async fn root_is_persisted_and_reloaded() {
    let dir = tempfile::tempdir().unwrap();
    let first = CertificateAuthority::load_or_generate(dir.path()).await.unwrap();
    assert!(dir.path().join(CA_CERT_FILE).exists());
    assert!(dir.path().join(CA_KEY_FILE).exists());
    let second = CertificateAuthority::load_or_generate(dir.path()).await.unwrap();
    assert_eq!(first.ca_cert_der(), second.ca_cert_der());
    assert!(second.ca_cert_pem().contains("BEGIN CERTIFICATE"));
  }

  #[tokio::test]
  async fn unreadable_root_is_fatal() {
    let dir = tempfile::tempdir().unwrap();
    let cert = dir.path().join("cert.pem");
    std::fs::write(&cert, "not a certificate").unwrap();
    let result = CertificateAuthority::from_pem_files(&cert, dir.path().join("missing.pem")).await;
    assert!(matches!(result, Err(Error::Config(_))));
  }

  #[test]
  fn leaf_chains_to_root() {
    let ca = CertificateAuthority::ephemeral().unwrap();
    let leaf = ca.sign("example.com", DEFAULT_LEAF_VALIDITY).unwrap();
    assert_eq!(leaf.chain().len(), 2);
    assert_eq!(&leaf.chain()[1], ca.ca_cert_der());
    assert_eq!(leaf.hostname(), "example.com");
    assert!(!leaf.is_expired());
    let remaining = leaf.not_after() - OffsetDateTime::now_utc();
    assert!(remaining > time::Duration::days(6));
    assert!(remaining <= time::Duration::days(7));
    assert!(ca.sign("10.0.0.1", DEFAULT_LEAF_VALIDITY).is_ok());
  }

  #[tokio::test]
  async fn signing_rejects_malformed_hostnames() {
    let manager = CertificateManager::new(
      CertificateAuthority::ephemeral().unwrap(),
      DEFAULT_LEAF_VALIDITY,
    );
    assert!(matches!(
      manager.sign_leaf("bad..host").await,
      Err(Error::Signing(_))
    ));
  }

  #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
  async fn concurrent_signing_is_coalesced() {
    let manager = CertificateManager::new(
      CertificateAuthority::ephemeral().unwrap(),
      DEFAULT_LEAF_VALIDITY,
    );
    let calls = (0..16).map(|_| {
      let manager = manager.clone();
      async move { manager.sign_leaf("coalesce.test").await.unwrap() }
    });
    let leaves = futures::future::join_all(calls).await;
    for leaf in &leaves[1..] {
      assert!(Arc::ptr_eq(&leaves[0], leaf));
    }
    let again = manager.sign_leaf("COALESCE.test").await.unwrap();
    assert!(Arc::ptr_eq(&leaves[0], &again));
  }
}
