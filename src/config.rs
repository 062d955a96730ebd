//! Proxy configuration
use crate::codec::ParseLimits;
use crate::dispatch::RetryPolicy;
use crate::errors::{Error, Result};
use crate::hook::HookFailurePolicy;
use crate::intercept::TlsFailurePolicy;
use crate::tls::UpstreamVerification;
use serde::Deserialize;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Configuration for the intercepting proxy.
///
/// Every field has a default; a JSON document only needs the fields it
/// changes. Durations are given in seconds.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct ProxyConfig {
  /// Address the listener binds to
  pub listen_addr: SocketAddr,
  /// Directory holding `ca_cert.pem` / `ca_key.pem`, created on first start
  pub ca_storage_path: PathBuf,
  /// Operator supplied root certificate; overrides `ca_storage_path` with `ca_key_path`
  pub ca_cert_path: Option<PathBuf>,
  /// Operator supplied root key
  pub ca_key_path: Option<PathBuf>,
  /// Validity of forged leaf certificates
  #[serde(with = "duration_secs")]
  pub leaf_validity: Duration,
  /// Terminate TLS and inspect HTTPS; when false TLS connections are tunnelled raw
  pub intercept_tls: bool,
  /// Consult the socket's original destination (Linux `SO_ORIGINAL_DST`)
  pub transparent: bool,
  /// Upstream certificate checking
  pub upstream_verification: UpstreamVerification,
  /// Extra PEM bundles trusted for upstream connections
  pub extra_root_pems: Vec<PathBuf>,
  /// What to do when no leaf can be signed for a host
  pub signing_failure: TlsFailurePolicy,
  /// What to do when a hook faults
  pub hook_failure: HookFailurePolicy,
  /// Largest accepted header block
  pub max_header_bytes: usize,
  /// Largest accepted body
  pub max_body_bytes: usize,
  /// Largest accepted header count
  pub max_headers: usize,
  /// Bound on client and upstream TLS handshakes
  #[serde(with = "duration_secs")]
  pub handshake_timeout: Duration,
  /// Bound on connecting to an upstream
  #[serde(with = "duration_secs")]
  pub connect_timeout: Duration,
  /// Bound on waiting for the upstream response head
  #[serde(with = "duration_secs")]
  pub response_header_timeout: Duration,
  /// Bound on one whole flow, from request head to relay
  #[serde(with = "duration_secs")]
  pub flow_timeout: Duration,
  /// How long an idle keep-alive client connection is kept
  #[serde(with = "duration_secs")]
  pub idle_timeout: Duration,
  /// How long in-flight connections may drain on shutdown
  #[serde(with = "duration_secs")]
  pub shutdown_grace: Duration,
  /// Concurrent client connections
  pub max_connections: usize,
  /// Idle upstream connections kept per `(host, port, tls)`
  pub pool_max_idle_per_host: usize,
  /// How long an idle upstream connection is kept
  #[serde(with = "duration_secs")]
  pub pool_idle_timeout: Duration,
  /// Upstream retry behaviour; off by default
  pub retry: RetryPolicy,
  /// Answer failures with synthetic error pages instead of closing
  pub synthetic_errors: bool,
}

impl Default for ProxyConfig {
  fn default() -> Self {
    let limits = ParseLimits::default();
    ProxyConfig {
      listen_addr: SocketAddr::from(([127, 0, 0, 1], 8080)),
      ca_storage_path: PathBuf::from(".tapwire"),
      ca_cert_path: None,
      ca_key_path: None,
      leaf_validity: crate::ca::DEFAULT_LEAF_VALIDITY,
      intercept_tls: true,
      transparent: false,
      upstream_verification: UpstreamVerification::default(),
      extra_root_pems: Vec::new(),
      signing_failure: TlsFailurePolicy::default(),
      hook_failure: HookFailurePolicy::default(),
      max_header_bytes: limits.max_header_bytes,
      max_body_bytes: limits.max_body_bytes,
      max_headers: limits.max_headers,
      handshake_timeout: Duration::from_secs(10),
      connect_timeout: Duration::from_secs(10),
      response_header_timeout: Duration::from_secs(30),
      flow_timeout: Duration::from_secs(120),
      idle_timeout: Duration::from_secs(60),
      shutdown_grace: Duration::from_secs(5),
      max_connections: 1000,
      pool_max_idle_per_host: 8,
      pool_idle_timeout: Duration::from_secs(90),
      retry: RetryPolicy::default(),
      synthetic_errors: true,
    }
  }
}

impl ProxyConfig {
  /// Parse a JSON document.
  pub fn from_json_str(json: &str) -> Result<Self> {
    let config: ProxyConfig =
      serde_json::from_str(json).map_err(|e| Error::config(format!("invalid config: {}", e)))?;
    config.validate()?;
    Ok(config)
  }

  /// Read and parse a JSON file.
  pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self> {
    let path = path.as_ref();
    let json = std::fs::read_to_string(path)
      .map_err(|e| Error::config(format!("cannot read {}: {}", path.display(), e)))?;
    Self::from_json_str(&json)
  }

  /// Reject settings the proxy cannot run with.
  pub fn validate(&self) -> Result<()> {
    if self.max_connections == 0 {
      return Err(Error::config("max_connections must be positive"));
    }
    if self.max_header_bytes == 0 || self.max_headers == 0 {
      return Err(Error::config("header limits must be positive"));
    }
    if self.ca_cert_path.is_some() != self.ca_key_path.is_some() {
      return Err(Error::config(
        "ca_cert_path and ca_key_path must be given together",
      ));
    }
    for (name, value) in [
      ("handshake_timeout", self.handshake_timeout),
      ("connect_timeout", self.connect_timeout),
      ("response_header_timeout", self.response_header_timeout),
      ("flow_timeout", self.flow_timeout),
      ("leaf_validity", self.leaf_validity),
    ] {
      if value.is_zero() {
        return Err(Error::config(format!("{} must be positive", name)));
      }
    }
    Ok(())
  }

  /// Parser bounds derived from this configuration.
  pub fn limits(&self) -> ParseLimits {
    ParseLimits {
      max_header_bytes: self.max_header_bytes,
      max_body_bytes: self.max_body_bytes,
      max_headers: self.max_headers,
    }
  }

  /// Set the listen address.
  pub fn with_listen_addr(mut self, addr: SocketAddr) -> Self {
    self.listen_addr = addr;
    self
  }

  /// Keep the generated root in `path`.
  pub fn with_ca_storage(mut self, path: impl Into<PathBuf>) -> Self {
    self.ca_storage_path = path.into();
    self
  }

  /// Use an operator supplied root.
  pub fn with_root_files(mut self, cert: impl Into<PathBuf>, key: impl Into<PathBuf>) -> Self {
    self.ca_cert_path = Some(cert.into());
    self.ca_key_path = Some(key.into());
    self
  }

  /// Turn TLS interception on or off.
  pub fn with_intercept_tls(mut self, intercept: bool) -> Self {
    self.intercept_tls = intercept;
    self
  }

  /// Use the socket's original destination as a fallback target.
  pub fn with_transparent(mut self, transparent: bool) -> Self {
    self.transparent = transparent;
    self
  }

  /// Set the upstream verification policy.
  pub fn with_upstream_verification(mut self, policy: UpstreamVerification) -> Self {
    self.upstream_verification = policy;
    self
  }

  /// Trust an extra PEM bundle upstream.
  pub fn with_extra_root_pem(mut self, path: impl Into<PathBuf>) -> Self {
    self.extra_root_pems.push(path.into());
    self
  }

  /// Set the leaf signing failure policy.
  pub fn with_signing_failure(mut self, policy: TlsFailurePolicy) -> Self {
    self.signing_failure = policy;
    self
  }

  /// Set the hook failure policy.
  pub fn with_hook_failure(mut self, policy: HookFailurePolicy) -> Self {
    self.hook_failure = policy;
    self
  }

  /// Set the parser bounds.
  pub fn with_limits(mut self, limits: ParseLimits) -> Self {
    self.max_header_bytes = limits.max_header_bytes;
    self.max_body_bytes = limits.max_body_bytes;
    self.max_headers = limits.max_headers;
    self
  }

  /// Set the TLS handshake timeout.
  pub fn with_handshake_timeout(mut self, timeout: Duration) -> Self {
    self.handshake_timeout = timeout;
    self
  }

  /// Set the upstream connect timeout.
  pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
    self.connect_timeout = timeout;
    self
  }

  /// Set the upstream response head timeout.
  pub fn with_response_header_timeout(mut self, timeout: Duration) -> Self {
    self.response_header_timeout = timeout;
    self
  }

  /// Set the total flow timeout.
  pub fn with_flow_timeout(mut self, timeout: Duration) -> Self {
    self.flow_timeout = timeout;
    self
  }

  /// Set the client keep-alive idle timeout.
  pub fn with_idle_timeout(mut self, timeout: Duration) -> Self {
    self.idle_timeout = timeout;
    self
  }

  /// Set the shutdown grace period.
  pub fn with_shutdown_grace(mut self, grace: Duration) -> Self {
    self.shutdown_grace = grace;
    self
  }

  /// Bound concurrent client connections.
  pub fn with_max_connections(mut self, max: usize) -> Self {
    self.max_connections = max;
    self
  }

  /// Configure the upstream connection pool.
  pub fn with_pool(mut self, max_idle_per_host: usize, idle_timeout: Duration) -> Self {
    self.pool_max_idle_per_host = max_idle_per_host;
    self.pool_idle_timeout = idle_timeout;
    self
  }

  /// Set the retry policy.
  pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
    self.retry = retry;
    self
  }

  /// Enable or disable synthetic error pages.
  pub fn with_synthetic_errors(mut self, enabled: bool) -> Self {
    self.synthetic_errors = enabled;
    self
  }
}

/// (De)serialize a `Duration` as (possibly fractional) seconds.
pub(crate) mod duration_secs {
  use serde::{Deserialize, Deserializer};
  use std::time::Duration;

  pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
  where
    D: Deserializer<'de>,
  {
    let secs = f64::deserialize(deserializer)?;
    Duration::try_from_secs_f64(secs).map_err(serde::de::Error::custom)
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn defaults_are_valid() {
    let config = ProxyConfig::default();
    assert!(config.validate().is_ok());
    assert!(config.intercept_tls);
    assert_eq!(config.retry.max_attempts, 0);
    assert_eq!(config.leaf_validity, Duration::from_secs(7 * 24 * 3600));
  }

  #[test]
  fn partial_json_overrides_defaults() {
    let config = ProxyConfig::from_json_str(
      r#"{
        "listen_addr": "0.0.0.0:9090",
        "upstream_verification": "warn_only",
        "hook_failure": "abort_flow",
        "signing_failure": "pass_through",
        "connect_timeout": 2.5,
        "retry": { "max_attempts": 2 }
      }"#,
    )
    .unwrap();
    assert_eq!(config.listen_addr.port(), 9090);
    assert_eq!(config.upstream_verification, UpstreamVerification::WarnOnly);
    assert_eq!(config.hook_failure, HookFailurePolicy::AbortFlow);
    assert_eq!(config.signing_failure, TlsFailurePolicy::PassThrough);
    assert_eq!(config.connect_timeout, Duration::from_millis(2500));
    assert_eq!(config.retry.max_attempts, 2);
    assert_eq!(config.max_connections, 1000);
  }

  #[test]
  fn invalid_values_are_rejected() {
    assert!(matches!(
      ProxyConfig::from_json_str(r#"{"max_connections": 0}"#),
      Err(Error::Config(_))
    ));
    assert!(matches!(
      ProxyConfig::from_json_str(r#"{"ca_cert_path": "root.pem"}"#),
      Err(Error::Config(_))
    ));
    assert!(ProxyConfig::from_json_str("{not json").is_err());
  }

  #[test]
  fn loads_from_file() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("proxy.json");
    std::fs::write(&path, r#"{"intercept_tls": false}"#).unwrap();
    let config = ProxyConfig::from_json_file(&path).unwrap();
    assert!(!config.intercept_tls);
  }
}
