//! Upstream TLS configuration and certificate verification policies
//!
use crate::errors::{Error, Result};
use serde::Deserialize;
use std::path::PathBuf;
use std::sync::Arc;
use tokio_rustls::rustls;
use tokio_rustls::rustls::client::danger::{
  HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier,
};
use tokio_rustls::rustls::client::WebPkiServerVerifier;
use tokio_rustls::rustls::crypto::{CryptoProvider, WebPkiSupportedAlgorithms};
use tokio_rustls::rustls::pki_types::{CertificateDer, ServerName, UnixTime};
use tokio_rustls::rustls::{
  ClientConfig, DigitallySignedStruct, Error as TLSError, RootCertStore, SignatureScheme,
};

/// The process wide crypto provider, falling back to `ring`.
pub(crate) fn crypto_provider() -> Arc<CryptoProvider> {
  CryptoProvider::get_default()
    .cloned()
    .unwrap_or_else(|| Arc::new(rustls::crypto::ring::default_provider()))
}

/// How the upstream server certificate is checked.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UpstreamVerification {
  /// Validate against the trust anchors and fail the handshake on error.
  #[default]
  Strict,
  /// Validate, log a warning on failure and continue.
  WarnOnly,
  /// Skip certificate validation. Handshake signatures are still checked.
  Disabled,
}

/// Trust anchors: `webpki-roots` plus the certificates in `extra_pems`.
pub fn root_store(extra_pems: &[PathBuf]) -> Result<RootCertStore> {
  let mut roots = RootCertStore::empty();
  roots.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
  for path in extra_pems {
    let pem = std::fs::read(path)
      .map_err(|e| Error::config(format!("cannot read {}: {}", path.display(), e)))?;
    add_pem_bundle(&mut roots, &pem)?;
  }
  Ok(roots)
}

/// Add every certificate of a PEM bundle to `roots`.
pub fn add_pem_bundle(roots: &mut RootCertStore, pem: &[u8]) -> Result<usize> {
  let mut added = 0;
  for cert in rustls_pemfile::certs(&mut std::io::Cursor::new(pem)) {
    let cert = cert.map_err(|e| Error::config(format!("invalid certificate PEM: {}", e)))?;
    roots
      .add(cert)
      .map_err(|e| Error::config(format!("unusable trust anchor: {}", e)))?;
    added += 1;
  }
  Ok(added)
}

/// Client configuration for upstream connections, ALPN `http/1.1`.
pub fn upstream_client_config(
  policy: UpstreamVerification,
  roots: RootCertStore,
) -> Result<Arc<ClientConfig>> {
  let provider = crypto_provider();
  let builder = ClientConfig::builder_with_provider(provider.clone())
    .with_safe_default_protocol_versions()
    .map_err(|e| Error::config(format!("invalid TLS versions: {}", e)))?;
  let builder = match policy {
    UpstreamVerification::Strict => builder.with_root_certificates(roots),
    UpstreamVerification::WarnOnly => {
      let inner = WebPkiServerVerifier::builder_with_provider(Arc::new(roots), provider.clone())
        .build()
        .map_err(|e| Error::config(format!("cannot build verifier: {}", e)))?;
      builder
        .dangerous()
        .with_custom_certificate_verifier(Arc::new(WarnOnly { inner }))
    }
    UpstreamVerification::Disabled => builder
      .dangerous()
      .with_custom_certificate_verifier(Arc::new(NoVerifier {
        signature_algorithms: provider.signature_verification_algorithms,
      })),
  };
  let mut config = builder.with_no_client_auth();
  config.alpn_protocols = vec![b"http/1.1".to_vec()];
  Ok(Arc::new(config))
}

#[derive(Debug)]
struct NoVerifier {
  signature_algorithms: WebPkiSupportedAlgorithms,
}

impl ServerCertVerifier for NoVerifier {
  fn verify_server_cert(
    &self,
    _end_entity: &CertificateDer<'_>,
    _intermediates: &[CertificateDer<'_>],
    _server_name: &ServerName<'_>,
    _ocsp_response: &[u8],
    _now: UnixTime,
  ) -> std::result::Result<ServerCertVerified, TLSError> {
    Ok(ServerCertVerified::assertion())
  }

  fn verify_tls12_signature(
    &self,
    message: &[u8],
    cert: &CertificateDer<'_>,
    dss: &DigitallySignedStruct,
  ) -> std::result::Result<HandshakeSignatureValid, TLSError> {
    rustls::crypto::verify_tls12_signature(message, cert, dss, &self.signature_algorithms)
  }

  fn verify_tls13_signature(
    &self,
    message: &[u8],
    cert: &CertificateDer<'_>,
    dss: &DigitallySignedStruct,
  ) -> std::result::Result<HandshakeSignatureValid, TLSError> {
    rustls::crypto::verify_tls13_signature(message, cert, dss, &self.signature_algorithms)
  }

  fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
    self.signature_algorithms.supported_schemes()
  }
}

#[derive(Debug)]
struct WarnOnly {
  inner: Arc<WebPkiServerVerifier>,
}

impl ServerCertVerifier for WarnOnly {
  fn verify_server_cert(
    &self,
    end_entity: &CertificateDer<'_>,
    intermediates: &[CertificateDer<'_>],
    server_name: &ServerName<'_>,
    ocsp_response: &[u8],
    now: UnixTime,
  ) -> std::result::Result<ServerCertVerified, TLSError> {
    match self
      .inner
      .verify_server_cert(end_entity, intermediates, server_name, ocsp_response, now)
    {
      Ok(verified) => Ok(verified),
      Err(err) => {
        tracing::warn!(
          "upstream certificate for {} failed validation, continuing: {}",
          server_name.to_str(),
          err
        );
        Ok(ServerCertVerified::assertion())
      }
    }
  }

  fn verify_tls12_signature(
    &self,
    message: &[u8],
    cert: &CertificateDer<'_>,
    dss: &DigitallySignedStruct,
  ) -> std::result::Result<HandshakeSignatureValid, TLSError> {
    self.inner.verify_tls12_signature(message, cert, dss)
  }

  fn verify_tls13_signature(
    &self,
    message: &[u8],
    cert: &CertificateDer<'_>,
    dss: &DigitallySignedStruct,
  ) -> std::result::Result<HandshakeSignatureValid, TLSError> {
    self.inner.verify_tls13_signature(message, cert, dss)
  }

  fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
    self.inner.supported_verify_schemes()
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn root_store_includes_extra_bundle() {
    let ca = crate::ca::CertificateAuthority::ephemeral().unwrap();
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("extra.pem");
    std::fs::write(&path, ca.ca_cert_pem()).unwrap();
    let base = root_store(&[]).unwrap().len();
    let with_extra = root_store(&[path]).unwrap().len();
    assert_eq!(with_extra, base + 1);
  }

  #[test]
  fn missing_bundle_is_a_config_error() {
    let err = root_store(&[PathBuf::from("/nonexistent/roots.pem")]).unwrap_err();
    assert!(matches!(err, Error::Config(_)));
  }

  #[test]
  fn every_policy_builds() {
    for policy in [
      UpstreamVerification::Strict,
      UpstreamVerification::WarnOnly,
      UpstreamVerification::Disabled,
    ] {
      let config = upstream_client_config(policy, root_store(&[]).unwrap()).unwrap();
      assert_eq!(config.alpn_protocols, vec![b"http/1.1".to_vec()]);
    }
  }

  #[test]
  fn policy_deserializes_from_snake_case() {
    let policy: UpstreamVerification = serde_json::from_str("\"warn_only\"").unwrap();
    assert_eq!(policy, UpstreamVerification::WarnOnly);
  }
}
